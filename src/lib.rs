//! Mock Manager
//!
//! A development-time HTTP mock layer. Mock files under `mock/` map route
//! keys to responses; matching requests are answered locally and everything
//! else falls through to an upstream server.
//!
//! # Features
//!
//! - **File-defined mocks**: JSON, YAML or Rhai scripts keyed by `"METHOD /path"`
//! - **Route templates**: `/user/:id` style parameters, decoded per segment
//! - **Hot reload**: file changes are debounced into a single reload
//! - **Persistent toggles**: enable/disable state survives restarts through a cache file
//! - **Control API**: list, toggle and open mocks in an editor under `/_mock`
//!
//! # Example Mock File
//!
//! ```rhai
//! // mock/users.rhai
//! #{
//!     "GET /api/users": [#{ id: 1, name: "Ada" }],
//!     "POST /api/users/:id": |req, res| {
//!         res.status(201).json(#{ id: req.params.id, body: req.body });
//!     },
//! }
//! ```
//!
//! # Example Configuration
//!
//! ```yaml
//! include:
//!   - "fixtures/**/*.yaml"
//! exclude:
//!   - "mock/drafts/**"
//! prefix: /api
//! log:
//!   match: true
//! ```

pub mod body;
pub mod cache;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod editor;
pub mod error;
pub mod handler;
pub mod loader;
pub mod matcher;
pub mod record;
pub mod registry;
pub mod script;
pub mod server;
pub mod watch;

pub use config::MockManagerConfig;
pub use dispatch::Dispatch;
pub use handler::{MockHandler, MockRequest, MockResponse};
pub use loader::MockLoader;
pub use record::{MockRecord, RecordSet};
pub use registry::{MockEvent, MockRegistry};
pub use server::{Fallback, MockServer};
pub use watch::{ReloadSession, ReloadSessions};
