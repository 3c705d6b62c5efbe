//! Per-request dispatch.
//!
//! Walks user records in set order, then the control records, and serves
//! the request with the first enabled record whose method and path match.

use crate::body::parse_body;
use crate::control;
use crate::error::DispatchError;
use crate::handler::{HandlerOutcome, MockRequest, MockResponse, ResponseSink};
use crate::matcher::Params;
use crate::record::Handler;
use crate::registry::MockRegistry;
use tracing::{debug, info};

/// What the registry did with a request.
#[derive(Debug)]
pub enum Dispatch {
    /// A mock produced the response
    Handled(MockResponse),
    /// No mock answered; hand the request to the next stage
    Next(MockRequest),
}

impl MockRegistry {
    /// Serve a request from the current record set.
    pub async fn dispatch(&self, mut req: MockRequest) -> Result<Dispatch, DispatchError> {
        let state = self.snapshot();
        let found = match state
            .matcher
            .find_match(&state.records, self.control(), &req.method, &req.path)
        {
            Ok(found) => found,
            Err(e) => {
                self.record_request(None);
                return Err(e.into());
            }
        };
        let Some(found) = found else {
            self.record_request(None);
            debug!(method = %req.method, path = %req.path, "No mock matched");
            return Ok(Dispatch::Next(req));
        };

        let record = found.record;
        if self.config().log.r#match {
            info!(id = %record.id, "[Mock] match -> {}", req.url());
        }
        self.record_request(Some((record.id.as_str(), record.is_control())));

        match &record.handler {
            Handler::Static(value) => Ok(Dispatch::Handled(MockResponse::json(200, value))),
            Handler::Dynamic(handler) => {
                prepare_request(&mut req, found.params).await?;
                let sink = handler
                    .handle(&req, ResponseSink::new())
                    .await
                    .map_err(|e| DispatchError::Handler {
                        id: record.id.clone(),
                        message: format!("{e:#}"),
                    })?;
                Ok(match sink.into_outcome() {
                    HandlerOutcome::Respond(response) => Dispatch::Handled(response),
                    HandlerOutcome::Pass => Dispatch::Next(req),
                })
            }
            Handler::Control(endpoint) => {
                prepare_request(&mut req, found.params).await?;
                Ok(Dispatch::Handled(control::respond(self, *endpoint, &req).await))
            }
            // Never compiled into a route
            Handler::Detached => Ok(Dispatch::Next(req)),
        }
    }
}

/// Attach route params and, for anything but GET, the parsed body.
async fn prepare_request(req: &mut MockRequest, params: Params) -> Result<(), DispatchError> {
    req.params = params;
    if req.method != "GET" {
        let parsed = parse_body(req).await?;
        req.body = parsed.body;
        req.files = parsed.files;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockManagerConfig;
    use crate::editor::{EditorLauncher, SourceLocation};
    use crate::registry::MockEvent;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    async fn registry_with(dir: &TempDir, config: MockManagerConfig) -> MockRegistry {
        let registry = MockRegistry::new(dir.path(), config);
        registry.reload().await.unwrap();
        registry
    }

    fn handled(dispatch: Dispatch) -> MockResponse {
        match dispatch {
            Dispatch::Handled(response) => response,
            Dispatch::Next(req) => panic!("Expected a mock response for {}", req.path),
        }
    }

    fn json_post(path: &str, body: serde_json::Value) -> MockRequest {
        MockRequest::new("POST", path)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
    }

    const USERS: &str = r#"
#{
    "GET /user/:id": |req, res| { res.json(#{ id: req.params.id }); },
    "POST /user": |req, res| { res.status(201).json(#{ created: req.body.name }); },
    "POST /upload": |req, res| {
        res.json(#{ title: req.body.title, files: req.files.len(), name: req.files[0].originalname });
    },
    "GET /maybe": |req, res| { res.next(); },
    "GET /boom": |req, res| { throw "exploded"; },
}
"#;

    #[tokio::test]
    async fn test_static_payload() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mock/list.json", r#"{"/list": [1, 2, 3]}"#);
        let registry = registry_with(&dir, MockManagerConfig::default()).await;

        let response = handled(registry.dispatch(MockRequest::new("GET", "/list")).await.unwrap());
        assert_eq!(response.status, 200);
        assert_eq!(response.header("mock"), Some("true"));
        assert_eq!(response.json_body().unwrap(), json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_static_payload_ignores_method_body() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mock/a.json", r#"{"POST /static": {"ok": true}}"#);
        let registry = registry_with(&dir, MockManagerConfig::default()).await;

        // Malformed JSON is never parsed for static payloads
        let req = MockRequest::new("POST", "/static")
            .with_header("content-type", "application/json")
            .with_body("{ not json");
        let response = handled(registry.dispatch(req).await.unwrap());
        assert_eq!(response.json_body().unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_function_handler_gets_params() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mock/users.rhai", USERS);
        let registry = registry_with(&dir, MockManagerConfig::default()).await;

        let response = handled(registry.dispatch(MockRequest::new("GET", "/user/42")).await.unwrap());
        assert_eq!(response.json_body().unwrap(), json!({"id": "42"}));
        assert_eq!(response.header("mock"), Some("true"));
    }

    #[tokio::test]
    async fn test_function_handler_gets_json_body() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mock/users.rhai", USERS);
        let registry = registry_with(&dir, MockManagerConfig::default()).await;

        let response = handled(
            registry
                .dispatch(json_post("/user", json!({"name": "Ada"})))
                .await
                .unwrap(),
        );
        assert_eq!(response.status, 201);
        assert_eq!(response.json_body().unwrap(), json!({"created": "Ada"}));
    }

    #[tokio::test]
    async fn test_function_handler_gets_multipart() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mock/users.rhai", USERS);
        let registry = registry_with(&dir, MockManagerConfig::default()).await;

        let body = "--b\r\n\
Content-Disposition: form-data; name=\"title\"\r\n\r\n\
avatar\r\n\
--b\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"me.png\"\r\n\
Content-Type: image/png\r\n\r\n\
PNG\r\n\
--b--\r\n";
        let req = MockRequest::new("POST", "/upload")
            .with_header("content-type", "multipart/form-data; boundary=b")
            .with_body(body);
        let response = handled(registry.dispatch(req).await.unwrap());
        assert_eq!(
            response.json_body().unwrap(),
            json!({"title": "avatar", "files": 1, "name": "me.png"})
        );
    }

    #[tokio::test]
    async fn test_malformed_body_is_client_error() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mock/users.rhai", USERS);
        let registry = registry_with(&dir, MockManagerConfig::default()).await;

        let req = MockRequest::new("POST", "/user")
            .with_header("content-type", "application/json")
            .with_body("{ nope");
        let err = registry.dispatch(req).await.unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_handler_next_falls_through() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mock/users.rhai", USERS);
        let registry = registry_with(&dir, MockManagerConfig::default()).await;

        let dispatch = registry.dispatch(MockRequest::new("GET", "/maybe")).await.unwrap();
        assert!(matches!(dispatch, Dispatch::Next(_)));
    }

    #[tokio::test]
    async fn test_handler_error_is_server_error() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mock/users.rhai", USERS);
        let registry = registry_with(&dir, MockManagerConfig::default()).await;

        let err = registry.dispatch(MockRequest::new("GET", "/boom")).await.unwrap_err();
        assert_eq!(err.status(), 500);
        assert!(err.to_string().contains("exploded"));
    }

    #[tokio::test]
    async fn test_bad_param_encoding_is_client_error() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mock/users.rhai", USERS);
        let registry = registry_with(&dir, MockManagerConfig::default()).await;

        let err = registry
            .dispatch(MockRequest::new("GET", "/user/%E0%A4%A"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_no_match_and_method_mismatch() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mock/list.json", r#"{"/list": []}"#);
        let registry = registry_with(&dir, MockManagerConfig::default()).await;

        for req in [MockRequest::new("GET", "/other"), MockRequest::new("DELETE", "/list")] {
            assert!(matches!(registry.dispatch(req).await.unwrap(), Dispatch::Next(_)));
        }
        assert_eq!(registry.total_requests(), 2);
        assert_eq!(registry.total_matched(), 0);
    }

    #[tokio::test]
    async fn test_match_event_published() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mock/list.json", r#"{"/list": []}"#);
        let config = MockManagerConfig {
            log: crate::config::LogSettings { r#match: false },
            ..Default::default()
        };
        let registry = registry_with(&dir, config).await;
        let mut events = registry.subscribe();

        registry.dispatch(MockRequest::new("GET", "/list")).await.unwrap();
        registry.dispatch(MockRequest::new("GET", "/_mock/_getMock")).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            MockEvent::Matched {
                id: "GET /list".to_string(),
                control: false
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            MockEvent::Matched {
                id: "GET /_mock/_getMock".to_string(),
                control: true
            }
        );
    }

    #[tokio::test]
    async fn test_get_mock_lists_records() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mock/list.json", "{\n  \"/list\": [1]\n}");
        let registry = registry_with(&dir, MockManagerConfig::default()).await;

        let response = handled(
            registry
                .dispatch(MockRequest::new("GET", "/_mock/_getMock"))
                .await
                .unwrap(),
        );
        let body = response.json_body().unwrap();
        assert_eq!(body["code"], 1);
        assert_eq!(body["message"], "success");
        assert_eq!(body["data"][0]["id"], "GET /list");
        assert_eq!(body["data"][0]["enable"], true);
        assert_eq!(body["data"][0]["file"], "mock/list.json");
        assert_eq!(body["data"][0]["line"], 2);
    }

    #[tokio::test]
    async fn test_update_mock_rejects_bad_body() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, MockManagerConfig::default()).await;

        let response = handled(
            registry
                .dispatch(json_post("/_mock/_updateMock", json!({"id": "GET /a"})))
                .await
                .unwrap(),
        );
        assert_eq!(response.status, 400);
        assert_eq!(response.json_body().unwrap()["code"], 0);
    }

    #[derive(Default)]
    struct RecordingEditor(Mutex<Vec<SourceLocation>>);

    impl EditorLauncher for RecordingEditor {
        fn open(&self, location: &SourceLocation) {
            self.0.lock().push(location.clone());
        }
    }

    #[tokio::test]
    async fn test_open_source_with_editor() {
        let dir = TempDir::new().unwrap();
        let editor = Arc::new(RecordingEditor::default());
        let registry = MockRegistry::new(dir.path(), MockManagerConfig::default())
            .with_editor(editor.clone());

        let response = handled(
            registry
                .dispatch(json_post(
                    "/_mock/_openSourceWithEditor",
                    json!({"file": "mock/a.json", "line": 4}),
                ))
                .await
                .unwrap(),
        );
        assert_eq!(response.json_body().unwrap()["code"], 1);
        assert_eq!(
            editor.0.lock().as_slice(),
            &[SourceLocation {
                file: "mock/a.json".to_string(),
                line: 4,
                column: 1
            }]
        );

        let response = handled(
            registry
                .dispatch(json_post("/_mock/_openSourceWithEditor", json!({})))
                .await
                .unwrap(),
        );
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_route_basename_moves_control_endpoints() {
        let dir = TempDir::new().unwrap();
        let config = MockManagerConfig {
            route_basename: "/admin".to_string(),
            ..Default::default()
        };
        let registry = registry_with(&dir, config).await;

        let moved = registry
            .dispatch(MockRequest::new("GET", "/admin/_mock/_getMock"))
            .await
            .unwrap();
        assert!(matches!(moved, Dispatch::Handled(_)));
        let old = registry
            .dispatch(MockRequest::new("GET", "/_mock/_getMock"))
            .await
            .unwrap();
        assert!(matches!(old, Dispatch::Next(_)));
    }

    #[tokio::test]
    async fn test_cached_records_are_not_routable_before_reload() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mock/list.json", r#"{"/list": [1]}"#);
        registry_with(&dir, MockManagerConfig::default()).await;

        let restored = MockRegistry::new(dir.path(), MockManagerConfig::default());
        assert!(restored.records().contains("GET /list"));
        let dispatch = restored.dispatch(MockRequest::new("GET", "/list")).await.unwrap();
        assert!(matches!(dispatch, Dispatch::Next(_)));
    }
}
