//! HTTP host for the dispatch engine.
//!
//! Every request goes through [`MockRegistry::dispatch`]. Requests that no
//! mock claims are either answered with a 404 or forwarded to an upstream.

use crate::control::ApiEnvelope;
use crate::dispatch::Dispatch;
use crate::handler::{MockRequest, MockResponse};
use crate::registry::MockRegistry;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub type ServerBody = BoxBody<Bytes, hyper::Error>;

type HttpClient = Client<HttpConnector, Full<Bytes>>;

/// What happens to requests no mock handles.
#[derive(Clone)]
pub enum Fallback {
    /// Answer with a JSON 404
    NotFound,
    /// Forward to an upstream HTTP server
    Proxy { upstream: Uri, client: HttpClient },
}

impl Fallback {
    pub fn proxy(upstream: Uri) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Fallback::Proxy { upstream, client }
    }

    async fn respond(&self, parts: Parts, body: Bytes) -> Response<ServerBody> {
        match self {
            Fallback::NotFound => {
                let message = format!("No mock for {} {}", parts.method, parts.uri.path());
                let body = serde_json::to_vec(&ApiEnvelope::<()>::failure(message))
                    .unwrap_or_default();
                let mut response = Response::new(full(body));
                *response.status_mut() = StatusCode::NOT_FOUND;
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                response
            }
            Fallback::Proxy { upstream, client } => {
                forward(client, upstream, parts, body).await
            }
        }
    }
}

async fn forward(
    client: &HttpClient,
    upstream: &Uri,
    parts: Parts,
    body: Bytes,
) -> Response<ServerBody> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let target = format!(
        "{}{}",
        upstream.to_string().trim_end_matches('/'),
        path_and_query
    );
    let uri: Uri = match target.parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(target = %target, error = %e, "Invalid upstream URI");
            return error_response(502, format!("Invalid upstream URI: {}", target));
        }
    };

    let mut request = Request::from_parts(parts, Full::new(body));
    *request.uri_mut() = uri;
    request.headers_mut().remove(HOST);

    debug!(uri = %request.uri(), "Forwarding to upstream");
    match client.request(request).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            match body.collect().await {
                Ok(collected) => Response::from_parts(parts, full(collected.to_bytes())),
                Err(e) => {
                    warn!(error = %e, "Failed to read upstream body");
                    error_response(502, format!("Failed to read upstream body: {}", e))
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "Upstream request failed");
            error_response(502, format!("Upstream request failed: {}", e))
        }
    }
}

/// Serves mocks over HTTP/1.
pub struct MockServer {
    registry: Arc<MockRegistry>,
    fallback: Arc<Fallback>,
}

impl MockServer {
    pub fn new(registry: Arc<MockRegistry>) -> Self {
        Self {
            registry,
            fallback: Arc::new(Fallback::NotFound),
        }
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = Arc::new(fallback);
        self
    }

    /// Bind `addr` and serve until the accept loop fails.
    pub async fn run(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(address = %listener.local_addr()?, "Mock server listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let registry = self.registry.clone();
            let fallback = self.fallback.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    handle(req, registry.clone(), fallback.clone())
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!(peer = %peer, "Error serving connection: {:?}", err);
                }
            });
        }
    }
}

pub(crate) async fn handle<B>(
    req: Request<B>,
    registry: Arc<MockRegistry>,
    fallback: Arc<Fallback>,
) -> Result<Response<ServerBody>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Ok(error_response(
                400,
                format!("Failed to read request body: {}", e),
            ))
        }
    };

    let mock_request = to_mock_request(&parts, body.clone());
    match registry.dispatch(mock_request).await {
        Ok(Dispatch::Handled(response)) => Ok(into_response(response)),
        Ok(Dispatch::Next(_)) => Ok(fallback.respond(parts, body).await),
        Err(e) => {
            debug!(error = %e, "Dispatch failed");
            Ok(error_response(e.status(), e.to_string()))
        }
    }
}

fn to_mock_request(parts: &Parts, body: Bytes) -> MockRequest {
    let target = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let mut request = MockRequest::new(parts.method.as_str(), target).with_body(body);
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    request
}

fn into_response(mock: MockResponse) -> Response<ServerBody> {
    let mut response = Response::new(full(mock.body));
    *response.status_mut() =
        StatusCode::from_u16(mock.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in &mock.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => warn!(header = %name, "Dropping invalid response header"),
        }
    }
    response
}

fn error_response(status: u16, message: String) -> Response<ServerBody> {
    into_response(MockResponse::json(
        status,
        &ApiEnvelope::<()>::failure(message),
    ))
}

fn full(body: impl Into<Bytes>) -> ServerBody {
    BoxBody::new(Full::new(body.into()).map_err(|never: Infallible| match never {}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockManagerConfig;
    use tempfile::TempDir;

    async fn registry_with(files: &[(&str, &str)]) -> (TempDir, Arc<MockRegistry>) {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let registry = Arc::new(MockRegistry::new(dir.path(), MockManagerConfig::default()));
        registry.reload().await.unwrap();
        (dir, registry)
    }

    async fn body_json(response: Response<ServerBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: &str, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    #[tokio::test]
    async fn test_mocked_route() {
        let (_dir, registry) =
            registry_with(&[("mock/users.json", r#"{"GET /api/users": [{"id": 1}]}"#)]).await;

        let response = handle(
            request("GET", "/api/users", ""),
            registry,
            Arc::new(Fallback::NotFound),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("Mock").unwrap(), "true");
        assert_eq!(body_json(response).await, serde_json::json!([{"id": 1}]));
    }

    #[tokio::test]
    async fn test_unmatched_route_is_not_found() {
        let (_dir, registry) = registry_with(&[]).await;

        let response = handle(
            request("GET", "/nothing", ""),
            registry,
            Arc::new(Fallback::NotFound),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("Mock").is_none());
        let body = body_json(response).await;
        assert_eq!(body["code"], 0);
        assert_eq!(body["message"], "No mock for GET /nothing");
    }

    #[tokio::test]
    async fn test_dispatch_error_status() {
        let (_dir, registry) = registry_with(&[(
            "mock/a.rhai",
            r#"#{ "POST /echo": |req, res| { res.json(req.body); } }"#,
        )])
        .await;

        let response = handle(
            request("POST", "/echo", "{broken"),
            registry,
            Arc::new(Fallback::NotFound),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], 0);
    }

    #[tokio::test]
    async fn test_control_route_over_http() {
        let (_dir, registry) =
            registry_with(&[("mock/users.json", r#"{"/api/users": []}"#)]).await;

        let response = handle(
            request("GET", "/_mock/_getMock", ""),
            registry,
            Arc::new(Fallback::NotFound),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["code"], 1);
        assert_eq!(body["data"][0]["id"], "GET /api/users");
    }

    #[tokio::test]
    async fn test_proxy_fallback() {
        let (_upstream_dir, upstream) =
            registry_with(&[("mock/list.json", r#"{"/list": ["from upstream"]}"#)]).await;
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(MockServer::new(upstream).serve(upstream_listener));

        let (_front_dir, front) = registry_with(&[]).await;
        let front_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front_listener.local_addr().unwrap();
        let upstream_uri: Uri = format!("http://{}", upstream_addr).parse().unwrap();
        tokio::spawn(
            MockServer::new(front)
                .with_fallback(Fallback::proxy(upstream_uri))
                .serve(front_listener),
        );

        let client: HttpClient = Client::builder(TokioExecutor::new()).build_http();
        let uri: Uri = format!("http://{}/list", front_addr).parse().unwrap();
        let response = client
            .request(
                Request::builder()
                    .uri(uri)
                    .body(Full::new(Bytes::new()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("Mock").unwrap(), "true");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, serde_json::json!(["from upstream"]));
    }
}
