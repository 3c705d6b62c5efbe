//! Rhai mock files.
//!
//! A `.rhai` mock file evaluates to an object map from route key to either a
//! closure `|req, res| ...` or a plain value:
//!
//! ```rhai
//! #{
//!     "GET /users": [#{ id: 1, name: "Ada" }],
//!     "POST /users": |req, res| {
//!         res.status(201).json(#{ created: req.body.name });
//!     },
//! }
//! ```
//!
//! The same map may instead sit under a `"default"` key. Entries keep the
//! order in which their keys are written in the file.

use crate::handler::{MockHandler, MockRequest, ResponseSink};
use crate::loader::{Export, ExportValue, ModuleEvaluator, DEFAULT_EXPORT};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rhai::module_resolvers::FileModuleResolver;
use rhai::{Array, Blob, Dynamic, Engine, FnPtr, Map, AST};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Evaluates Rhai mock files.
///
/// Each call builds a fresh engine and module resolver, so imported helper
/// modules are re-read on every load.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptEvaluator;

impl ScriptEvaluator {
    fn create_engine(base_dir: &Path) -> Engine {
        let mut engine = Engine::new();
        engine.set_module_resolver(FileModuleResolver::new_with_path(base_dir));

        engine
            .register_type_with_name::<ScriptResponse>("Response")
            .register_fn("status", |res: &mut ScriptResponse, code: i64| {
                let code = u16::try_from(code).unwrap_or(500);
                res.with(|sink| {
                    sink.status(code);
                });
                res.clone()
            })
            .register_fn("header", |res: &mut ScriptResponse, name: &str, value: &str| {
                res.with(|sink| {
                    sink.header(name, value);
                });
                res.clone()
            })
            .register_fn("json", |res: &mut ScriptResponse, value: Dynamic| {
                let value = dynamic_to_json(value);
                res.with(|sink| {
                    sink.json(&value);
                });
            })
            .register_fn("send", |res: &mut ScriptResponse, value: Dynamic| {
                match value.clone().try_cast::<Blob>() {
                    Some(blob) => res.with(|sink| {
                        sink.bytes(Bytes::from(blob));
                    }),
                    None => {
                        let value = dynamic_to_json(value);
                        res.with(|sink| {
                            sink.send(&value);
                        });
                    }
                }
            })
            .register_fn("end", |res: &mut ScriptResponse| {
                res.with(|sink| {
                    sink.end();
                });
            })
            .register_fn("next", |res: &mut ScriptResponse| {
                res.with(|sink| {
                    sink.pass();
                });
            });

        engine.on_print(|text| info!(target: "mock_manager::script", "{text}"));
        engine.on_debug(|text, source, pos| {
            debug!(target: "mock_manager::script", source = source.unwrap_or("-"), position = %pos, "{text}")
        });

        engine
    }
}

impl ModuleEvaluator for ScriptEvaluator {
    fn evaluate(&self, path: &Path) -> Result<Vec<Export>> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let engine = Self::create_engine(base_dir);
        let ast = engine
            .compile_file(path.to_path_buf())
            .map_err(|e| anyhow!("Failed to compile script: {e}"))?;
        let result: Dynamic = engine
            .eval_ast(&ast)
            .map_err(|e| anyhow!("Script execution error: {e}"))?;

        if result.is_unit() {
            return Ok(Vec::new());
        }
        let map = result
            .try_cast::<Map>()
            .ok_or_else(|| anyhow!("Mock script must evaluate to an object map"))?;
        let map = match map.get(DEFAULT_EXPORT).and_then(|v| v.clone().try_cast::<Map>()) {
            Some(inner) => inner,
            None => map,
        };

        let engine = Arc::new(engine);
        let ast = Arc::new(ast);
        let mut exports: Vec<Export> = map
            .into_iter()
            .map(|(key, value)| {
                let key = key.to_string();
                let value = match value.clone().try_cast::<FnPtr>() {
                    Some(callback) => ExportValue::Function(Arc::new(ScriptHandler {
                        engine: engine.clone(),
                        ast: ast.clone(),
                        callback,
                        file: path.to_path_buf(),
                    })),
                    None => ExportValue::Value(dynamic_to_json(value)),
                };
                Export { key, value }
            })
            .collect();
        // Object maps iterate sorted by key; restore source order
        exports.sort_by_key(|export| key_offset(&source, &export.key).unwrap_or(usize::MAX));
        Ok(exports)
    }
}

/// Byte offset of `key` written as a quoted object map key.
fn key_offset(source: &str, key: &str) -> Option<usize> {
    let quoted = format!("\"{key}\"");
    source
        .match_indices(&quoted)
        .map(|(offset, _)| offset)
        .find(|&offset| source[offset + quoted.len()..].trim_start().starts_with(':'))
}

/// A Rhai closure exported by a mock file.
struct ScriptHandler {
    engine: Arc<Engine>,
    ast: Arc<AST>,
    callback: FnPtr,
    file: PathBuf,
}

#[async_trait]
impl MockHandler for ScriptHandler {
    async fn handle(&self, req: &MockRequest, res: ResponseSink) -> Result<ResponseSink> {
        let engine = self.engine.clone();
        let ast = self.ast.clone();
        let callback = self.callback.clone();
        let request = request_map(req);
        let response = ScriptResponse::new(res);
        let handle = response.clone();

        tokio::task::spawn_blocking(move || callback.call::<Dynamic>(&engine, &ast, (request, handle)))
            .await
            .map_err(|e| anyhow!("Script task failed: {e}"))?
            .map_err(|e| anyhow!("Script error in {}: {e}", self.file.display()))?;

        Ok(response.into_sink())
    }
}

/// The `res` value handed to Rhai closures.
#[derive(Clone)]
pub struct ScriptResponse(Arc<Mutex<ResponseSink>>);

impl ScriptResponse {
    fn new(sink: ResponseSink) -> Self {
        Self(Arc::new(Mutex::new(sink)))
    }

    fn with(&self, f: impl FnOnce(&mut ResponseSink)) {
        f(&mut self.0.lock());
    }

    fn into_sink(self) -> ResponseSink {
        self.0.lock().clone()
    }
}

fn request_map(req: &MockRequest) -> Map {
    let mut map = Map::new();
    map.insert("method".into(), Dynamic::from(req.method.clone()));
    map.insert("path".into(), Dynamic::from(req.path.clone()));
    map.insert("url".into(), Dynamic::from(req.url()));

    let params: Map = req
        .params
        .iter()
        .map(|(k, v)| (k.as_str().into(), Dynamic::from(v.clone())))
        .collect();
    map.insert("params".into(), Dynamic::from(params));

    let mut headers = Map::new();
    for (name, value) in &req.headers {
        headers
            .entry(name.as_str().into())
            .or_insert_with(|| Dynamic::from(value.clone()));
    }
    map.insert("headers".into(), Dynamic::from(headers));

    map.insert("query".into(), json_to_dynamic(req.query_params()));
    map.insert("body".into(), json_to_dynamic(req.body.clone()));

    let files: Array = req
        .files
        .iter()
        .map(|file| {
            let mut entry = Map::new();
            entry.insert("fieldname".into(), Dynamic::from(file.fieldname.clone()));
            entry.insert("originalname".into(), Dynamic::from(file.originalname.clone()));
            entry.insert("mimetype".into(), Dynamic::from(file.mimetype.clone()));
            entry.insert("size".into(), Dynamic::from(file.size as i64));
            entry.insert("buffer".into(), Dynamic::from_blob(file.buffer.to_vec()));
            Dynamic::from(entry)
        })
        .collect();
    map.insert("files".into(), Dynamic::from(files));
    map
}

fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from(i),
            None => n.as_f64().map(Dynamic::from).unwrap_or(Dynamic::UNIT),
        },
        Value::String(s) => Dynamic::from(s),
        Value::Array(items) => {
            let items: Array = items.into_iter().map(json_to_dynamic).collect();
            Dynamic::from(items)
        }
        Value::Object(obj) => {
            let map: Map = obj
                .into_iter()
                .map(|(k, v)| (k.into(), json_to_dynamic(v)))
                .collect();
            Dynamic::from(map)
        }
    }
}

fn dynamic_to_json(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::Number(i.into());
    }
    if let Ok(f) = value.as_float() {
        return serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number);
    }
    if let Ok(c) = value.as_char() {
        return Value::String(c.to_string());
    }
    if value.is_string() {
        return Value::String(value.to_string());
    }
    if let Some(blob) = value.clone().try_cast::<Blob>() {
        return Value::Array(blob.into_iter().map(Value::from).collect());
    }
    if let Some(items) = value.clone().try_cast::<Array>() {
        return Value::Array(items.into_iter().map(dynamic_to_json).collect());
    }
    if let Some(map) = value.clone().try_cast::<Map>() {
        return Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                .collect(),
        );
    }
    Value::String(value.to_string())
}
