//! Request and response types seen by mock handlers.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Header added to every response produced by a mock.
pub const MOCK_HEADER: &str = "Mock";

/// An incoming request as the dispatch engine sees it.
#[derive(Debug, Clone, Default)]
pub struct MockRequest {
    /// Upper-cased method
    pub method: String,
    /// Path without query string
    pub path: String,
    /// Raw query string, without `?`
    pub query: Option<String>,
    /// Headers with lower-cased names, in arrival order
    pub headers: Vec<(String, String)>,
    /// Raw request body
    pub raw_body: Bytes,
    /// Route parameters of the matched record
    pub params: BTreeMap<String, String>,
    /// Body produced by the parsing chain
    pub body: serde_json::Value,
    /// Files received through multipart/form-data
    pub files: Vec<UploadedFile>,
}

impl MockRequest {
    pub fn new(method: &str, path: &str) -> Self {
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path.to_string(), None),
        };
        Self {
            method: method.to_uppercase(),
            path,
            query,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_lowercase(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.raw_body = body.into();
        self
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Path plus query string.
    pub fn url(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }

    /// Query string parsed with bracket notation.
    pub fn query_params(&self) -> serde_json::Value {
        crate::body::parse_urlencoded(self.query.as_deref().unwrap_or(""))
    }
}

/// A file part of a multipart body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadedFile {
    pub fieldname: String,
    pub originalname: String,
    pub mimetype: String,
    pub size: usize,
    #[serde(skip)]
    pub buffer: Bytes,
}

/// A finished response.
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl MockResponse {
    /// JSON response with the mock marker header.
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
        Self {
            status,
            headers: vec![
                (MOCK_HEADER.to_string(), "true".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: Bytes::from(body),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body parsed as JSON, for tests and diagnostics.
    pub fn json_body(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// What a handler decided.
#[derive(Debug)]
pub enum HandlerOutcome {
    Respond(MockResponse),
    /// Fall through to the next pipeline stage
    Pass,
}

/// Collects what a handler writes.
#[derive(Debug, Clone)]
pub struct ResponseSink {
    status: u16,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    passed: bool,
}

impl Default for ResponseSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseSink {
    pub fn new() -> Self {
        Self {
            status: 200,
            headers: vec![(MOCK_HEADER.to_string(), "true".to_string())],
            body: None,
            passed: false,
        }
    }

    pub fn status(&mut self, status: u16) -> &mut Self {
        self.status = status;
        self
    }

    /// Set a header, replacing an earlier value of the same name.
    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn json(&mut self, value: &serde_json::Value) -> &mut Self {
        if !self.has_header("content-type") {
            self.header("Content-Type", "application/json");
        }
        self.body = Some(Bytes::from(value.to_string()));
        self
    }

    /// Send a string as HTML, any other value as JSON.
    pub fn send(&mut self, value: &serde_json::Value) -> &mut Self {
        match value {
            serde_json::Value::String(text) => {
                if !self.has_header("content-type") {
                    self.header("Content-Type", "text/html; charset=utf-8");
                }
                self.body = Some(Bytes::from(text.clone()));
                self
            }
            other => self.json(other),
        }
    }

    pub fn bytes(&mut self, body: Bytes) -> &mut Self {
        self.body = Some(body);
        self
    }

    /// Finish without a body.
    pub fn end(&mut self) -> &mut Self {
        if self.body.is_none() {
            self.body = Some(Bytes::new());
        }
        self
    }

    /// Hand the request to the next pipeline stage.
    pub fn pass(&mut self) -> &mut Self {
        self.passed = true;
        self
    }

    pub fn is_sent(&self) -> bool {
        self.body.is_some()
    }

    pub fn into_outcome(self) -> HandlerOutcome {
        if self.passed && self.body.is_none() {
            return HandlerOutcome::Pass;
        }
        HandlerOutcome::Respond(MockResponse {
            status: self.status,
            headers: self.headers,
            body: self.body.unwrap_or_default(),
        })
    }
}

/// A dynamic mock: receives the request and a sink to answer through.
#[async_trait]
pub trait MockHandler: Send + Sync {
    async fn handle(&self, req: &MockRequest, res: ResponseSink) -> anyhow::Result<ResponseSink>;
}

/// Handler backed by a plain closure.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> MockHandler for FnHandler<F>
where
    F: Fn(&MockRequest, &mut ResponseSink) + Send + Sync,
{
    async fn handle(&self, req: &MockRequest, mut res: ResponseSink) -> anyhow::Result<ResponseSink> {
        (self.0)(req, &mut res);
        Ok(res)
    }
}

/// Wrap a closure as a dynamic handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn MockHandler>
where
    F: Fn(&MockRequest, &mut ResponseSink) + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}
