//! Mock records and the ordered set that holds them.
//!
//! A record is produced from one exported route key (`"GET /user/:id"` or
//! `"/user/:id"`) and the value exported under it.

use crate::control::ControlEndpoint;
use crate::handler::MockHandler;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::error;

/// Method used when a route key has no verb.
pub const DEFAULT_METHOD: &str = "GET";

/// Methods a record can be dispatched for.
pub const VALID_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// Method and path split out of a route key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteKey {
    pub method: String,
    pub path: Option<String>,
}

/// Parse a route key into method and path.
///
/// Never fails: an unknown method or a missing path is logged and the
/// resulting record simply never matches a request.
pub fn parse_route_key(key: &str) -> RouteKey {
    let tokens: Vec<&str> = key.split_whitespace().collect();
    match tokens.as_slice() {
        [] => {
            error!(key = %key, "Mock key is empty, path is undefined");
            RouteKey {
                method: DEFAULT_METHOD.to_string(),
                path: None,
            }
        }
        [path] => RouteKey {
            method: DEFAULT_METHOD.to_string(),
            path: Some((*path).to_string()),
        },
        [method, path, ..] => {
            let method = method.to_uppercase();
            if !VALID_METHODS.contains(&method.as_str()) {
                error!(key = %key, method = %method, "Mock method is not supported");
            }
            RouteKey {
                method,
                path: Some((*path).to_string()),
            }
        }
    }
}

/// Record id for a method and path.
pub fn record_id(method: &str, path: Option<&str>) -> String {
    format!("{} {}", method, path.unwrap_or("undefined"))
}

/// What a record does when it matches.
#[derive(Clone)]
pub enum Handler {
    /// Respond 200 with this value as JSON
    Static(serde_json::Value),
    /// Invoke a function with the request and a response sink
    Dynamic(Arc<dyn MockHandler>),
    /// Built-in control endpoint
    Control(ControlEndpoint),
    /// Restored from the cache before any load produced a handler
    Detached,
}

impl Handler {
    /// Function handlers get params and a parsed body; static ones do not.
    pub fn is_function(&self) -> bool {
        matches!(self, Handler::Dynamic(_) | Handler::Control(_))
    }

    /// Whether the handler has an accepted runtime shape (function, array or object).
    pub fn has_valid_shape(&self) -> bool {
        match self {
            Handler::Static(value) => value.is_array() || value.is_object(),
            Handler::Dynamic(_) | Handler::Control(_) => true,
            Handler::Detached => false,
        }
    }

    fn shape_name(&self) -> &'static str {
        match self {
            Handler::Static(serde_json::Value::Null) => "null",
            Handler::Static(serde_json::Value::Bool(_)) => "boolean",
            Handler::Static(serde_json::Value::Number(_)) => "number",
            Handler::Static(serde_json::Value::String(_)) => "string",
            Handler::Static(serde_json::Value::Array(_)) => "array",
            Handler::Static(serde_json::Value::Object(_)) => "object",
            Handler::Dynamic(_) | Handler::Control(_) => "function",
            Handler::Detached => "undefined",
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Handler::Dynamic(_) => f.write_str("Dynamic(..)"),
            Handler::Control(endpoint) => f.debug_tuple("Control").field(endpoint).finish(),
            Handler::Detached => f.write_str("Detached"),
        }
    }
}

/// Distinguishes built-in control endpoints from user mocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecordKind {
    #[default]
    #[serde(rename = "mock")]
    User,
    #[serde(rename = "mockApi")]
    Control,
}

/// One simulated endpoint.
#[derive(Debug, Clone)]
pub struct MockRecord {
    pub id: String,
    pub method: String,
    pub path: Option<String>,
    pub handler: Handler,
    pub enable: bool,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub kind: RecordKind,
}

impl MockRecord {
    /// Build a user record from an exported key and its value.
    pub fn from_export(key: &str, handler: Handler, file: Option<String>, line: Option<u32>) -> Self {
        let RouteKey { method, path } = parse_route_key(key);
        let record = Self {
            id: record_id(&method, path.as_deref()),
            method,
            path,
            handler,
            enable: true,
            file,
            line,
            kind: RecordKind::User,
        };
        if !record.handler.has_valid_shape() {
            error!(
                id = %record.id,
                file = record.file.as_deref().unwrap_or("-"),
                "Mock handler must be function or array or object, but got {}",
                record.handler.shape_name()
            );
        }
        record
    }

    /// Build a control record; always enabled and never prefixed.
    pub fn control(method: &str, path: String, endpoint: ControlEndpoint) -> Self {
        Self {
            id: record_id(method, Some(&path)),
            method: method.to_string(),
            path: Some(path),
            handler: Handler::Control(endpoint),
            enable: true,
            file: None,
            line: None,
            kind: RecordKind::Control,
        }
    }

    pub fn is_control(&self) -> bool {
        self.kind == RecordKind::Control
    }

    /// Whether the record can ever be dispatched.
    pub fn is_routable(&self) -> bool {
        self.path.is_some()
            && !matches!(self.handler, Handler::Detached)
            && VALID_METHODS.contains(&self.method.as_str())
    }

    /// Serializable view used by the list endpoint and the cache.
    pub fn view(&self) -> RecordView {
        RecordView {
            id: self.id.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            enable: Some(self.enable),
            file: self.file.clone(),
            line: self.line,
            kind: self.is_control().then_some(RecordKind::Control),
            handler: match &self.handler {
                Handler::Static(value) => Some(value.clone()),
                _ => None,
            },
        }
    }

    /// Rebuild a record from its persisted view; the handler is not restored.
    pub fn from_view(view: RecordView) -> Self {
        Self {
            id: view.id,
            method: view.method,
            path: view.path,
            handler: Handler::Detached,
            enable: view.enable.unwrap_or(true),
            file: view.file,
            line: view.line,
            kind: view.kind.unwrap_or_default(),
        }
    }
}

/// Wire form of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordView {
    #[serde(default)]
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<RecordKind>,
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub handler: Option<serde_json::Value>,
}

/// Records keyed by id, iterated in insertion order.
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    records: Vec<MockRecord>,
    index: HashMap<String, usize>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&MockRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut MockRecord> {
        match self.index.get(id) {
            Some(&i) => Some(&mut self.records[i]),
            None => None,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Insert a record under its own id.
    ///
    /// An existing record with the same id is replaced in place and
    /// returned, so the id keeps its original position.
    pub fn insert(&mut self, record: MockRecord) -> Option<MockRecord> {
        match self.index.get(&record.id) {
            Some(&i) => Some(std::mem::replace(&mut self.records[i], record)),
            None => {
                self.index.insert(record.id.clone(), self.records.len());
                self.records.push(record);
                None
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MockRecord> {
        self.records.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.id.as_str())
    }
}

impl FromIterator<MockRecord> for RecordSet {
    fn from_iter<I: IntoIterator<Item = MockRecord>>(iter: I) -> Self {
        let mut set = RecordSet::new();
        for record in iter {
            set.insert(record);
        }
        set
    }
}

impl IntoIterator for RecordSet {
    type Item = MockRecord;
    type IntoIter = std::vec::IntoIter<MockRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}
