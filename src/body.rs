//! Request body negotiation for function handlers.
//!
//! The chain tries JSON, then url-encoded forms, then multipart/form-data.
//! Each stage only runs when the request's content type selects it, so at
//! most one stage consumes the body.

use crate::error::DispatchError;
use crate::handler::{MockRequest, UploadedFile};
use bytes::Bytes;
use serde_json::{Map, Value};

/// Size cap for JSON and url-encoded bodies.
pub const BODY_LIMIT: usize = 5 * 1024 * 1024;

/// Output of the parsing chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBody {
    pub body: Value,
    pub files: Vec<UploadedFile>,
}

/// Run the negotiation chain over a request's raw body.
pub async fn parse_body(req: &MockRequest) -> Result<ParsedBody, DispatchError> {
    let content_type = req.header("content-type").unwrap_or_default();
    let media_type = media_type(content_type);

    if is_json(&media_type) {
        check_limit(&req.raw_body)?;
        return Ok(ParsedBody {
            body: parse_json(&req.raw_body)?,
            files: Vec::new(),
        });
    }

    if media_type == "application/x-www-form-urlencoded" {
        check_limit(&req.raw_body)?;
        let text = std::str::from_utf8(&req.raw_body)
            .map_err(|e| DispatchError::MalformedBody(e.to_string()))?;
        return Ok(ParsedBody {
            body: parse_urlencoded(text),
            files: Vec::new(),
        });
    }

    if media_type == "multipart/form-data" {
        return parse_multipart(content_type, req.raw_body.clone()).await;
    }

    Ok(ParsedBody {
        body: Value::Object(Map::new()),
        files: Vec::new(),
    })
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_json(media_type: &str) -> bool {
    media_type == "application/json"
        || (media_type.starts_with("application/") && media_type.ends_with("+json"))
}

fn check_limit(body: &Bytes) -> Result<(), DispatchError> {
    if body.len() > BODY_LIMIT {
        return Err(DispatchError::PayloadTooLarge {
            size: body.len(),
            limit: BODY_LIMIT,
        });
    }
    Ok(())
}

/// Any JSON value is accepted, not only objects and arrays.
fn parse_json(body: &[u8]) -> Result<Value, DispatchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(body).map_err(|e| DispatchError::MalformedBody(e.to_string()))
}

async fn parse_multipart(content_type: &str, body: Bytes) -> Result<ParsedBody, DispatchError> {
    let malformed = |e: multer::Error| DispatchError::MalformedBody(e.to_string());
    let boundary = multer::parse_boundary(content_type).map_err(malformed)?;
    let stream = futures::stream::once(async move { Ok::<Bytes, std::convert::Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = Value::Object(Map::new());
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(originalname) => {
                let mimetype = field
                    .content_type()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                let buffer = field.bytes().await.map_err(malformed)?;
                files.push(UploadedFile {
                    fieldname: name,
                    originalname,
                    mimetype,
                    size: buffer.len(),
                    buffer,
                });
            }
            None => {
                let text = field.text().await.map_err(malformed)?;
                insert_pair(&mut fields, &name, Value::String(text));
            }
        }
    }

    Ok(ParsedBody {
        body: fields,
        files,
    })
}

/// Parse `a=1&b[c]=2&d[]=3` into nested JSON.
///
/// Repeated keys collect into arrays; bracket segments build objects, and
/// empty or numeric segments build arrays.
pub fn parse_urlencoded(input: &str) -> Value {
    let mut root = Value::Object(Map::new());
    for pair in input.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(key);
        if key.is_empty() {
            continue;
        }
        insert_pair(&mut root, &key, Value::String(decode_component(value)));
    }
    root
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

fn insert_pair(root: &mut Value, key: &str, value: Value) {
    let segments = split_key(key);
    insert_value(root, &segments, value);
}

/// `a[b][]` becomes `["a", "b", ""]`; malformed brackets keep the key whole.
fn split_key(key: &str) -> Vec<String> {
    let Some(open) = key.find('[') else {
        return vec![key.to_string()];
    };
    if open == 0 {
        return vec![key.to_string()];
    }
    let mut segments = vec![key[..open].to_string()];
    let mut rest = &key[open..];
    while let Some(inner) = rest.strip_prefix('[') {
        let Some(close) = inner.find(']') else {
            return vec![key.to_string()];
        };
        segments.push(inner[..close].to_string());
        rest = &inner[close + 1..];
    }
    if !rest.is_empty() {
        return vec![key.to_string()];
    }
    segments
}

fn empty_container(next: &str) -> Value {
    if next.is_empty() || next.parse::<usize>().is_ok() {
        Value::Array(Vec::new())
    } else {
        Value::Object(Map::new())
    }
}

fn insert_value(target: &mut Value, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    match target {
        Value::Array(items) => {
            let index = head.parse::<usize>().ok().filter(|&i| i < items.len());
            if rest.is_empty() {
                match index {
                    Some(i) => items[i] = value,
                    None => items.push(value),
                }
                return;
            }
            let i = match index {
                Some(i) => i,
                None => {
                    items.push(empty_container(&rest[0]));
                    items.len() - 1
                }
            };
            insert_value(&mut items[i], rest, value);
        }
        Value::Object(map) => {
            if rest.is_empty() {
                match map.get_mut(head.as_str()) {
                    Some(Value::Array(existing)) => existing.push(value),
                    Some(existing) => {
                        let previous = existing.take();
                        *existing = Value::Array(vec![previous, value]);
                    }
                    None => {
                        map.insert(head.clone(), value);
                    }
                }
                return;
            }
            let child = map
                .entry(head.clone())
                .or_insert_with(|| empty_container(&rest[0]));
            if !child.is_object() && !child.is_array() {
                *child = empty_container(&rest[0]);
            }
            insert_value(child, rest, value);
        }
        _ => {}
    }
}
