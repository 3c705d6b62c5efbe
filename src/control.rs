//! Built-in control endpoints.
//!
//! These records are always present, always enabled and never prefixed. They
//! let the admin page list mocks, toggle them and jump to their source.

use crate::editor::SourceLocation;
use crate::handler::{MockRequest, MockResponse};
use crate::record::MockRecord;
use crate::registry::MockRegistry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Which built-in endpoint a control record serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEndpoint {
    /// `GET <base>/_getMock`
    GetMock,
    /// `POST <base>/_updateMock`
    UpdateMock,
    /// `POST <base>/_openSourceWithEditor`
    OpenSourceWithEditor,
}

/// Control records for a base path such as `/_mock`.
pub fn control_records(base: &str) -> Vec<MockRecord> {
    vec![
        MockRecord::control("GET", format!("{base}/_getMock"), ControlEndpoint::GetMock),
        MockRecord::control("POST", format!("{base}/_updateMock"), ControlEndpoint::UpdateMock),
        MockRecord::control(
            "POST",
            format!("{base}/_openSourceWithEditor"),
            ControlEndpoint::OpenSourceWithEditor,
        ),
    ]
}

/// Uniform response envelope of the control API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiEnvelope<T> {
    pub fn success(data: Option<T>) -> Self {
        Self {
            code: 1,
            message: "success".to_string(),
            data,
        }
    }
}

impl ApiEnvelope<()> {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            message: message.into(),
            data: None,
        }
    }
}

/// One entry of the update endpoint's body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub id: String,
    pub enable: bool,
}

#[derive(Debug, Deserialize)]
struct OpenSourceRequest {
    file: String,
    #[serde(default)]
    line: Option<u32>,
    #[serde(default)]
    column: Option<u32>,
}

/// Serve a control endpoint.
pub(crate) async fn respond(
    registry: &MockRegistry,
    endpoint: ControlEndpoint,
    req: &MockRequest,
) -> MockResponse {
    match endpoint {
        ControlEndpoint::GetMock => {
            let records = registry.records();
            let data: Vec<_> = records.iter().map(MockRecord::view).collect();
            MockResponse::json(200, &ApiEnvelope::success(Some(data)))
        }
        ControlEndpoint::UpdateMock => {
            let updates: Vec<RecordUpdate> = match serde_json::from_value(req.body.clone()) {
                Ok(updates) => updates,
                Err(e) => {
                    debug!(error = %e, "Rejected update body");
                    return MockResponse::json(
                        400,
                        &ApiEnvelope::failure(format!("Expected [{{id, enable}}]: {e}")),
                    );
                }
            };
            match registry.update(&updates).await {
                Ok(_) => MockResponse::json(200, &ApiEnvelope::<()>::success(None)),
                Err(e) => {
                    warn!(error = %e, "Failed to persist mock update");
                    MockResponse::json(500, &ApiEnvelope::failure(e.to_string()))
                }
            }
        }
        ControlEndpoint::OpenSourceWithEditor => {
            let request: OpenSourceRequest = match serde_json::from_value(req.body.clone()) {
                Ok(request) => request,
                Err(e) => {
                    return MockResponse::json(
                        400,
                        &ApiEnvelope::failure(format!("Expected {{file, line?, column?}}: {e}")),
                    );
                }
            };
            registry.open_in_editor(&SourceLocation {
                file: request.file,
                line: request.line.unwrap_or(1),
                column: request.column.unwrap_or(1),
            });
            MockResponse::json(200, &ApiEnvelope::<()>::success(None))
        }
    }
}
