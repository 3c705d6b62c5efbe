//! Mock file discovery and loading.
//!
//! Scans the default `mock/` glob plus configured include patterns, evaluates
//! every matching file and turns each exported entry into a record. A file
//! that cannot be evaluated aborts the whole load.

use crate::config::MockManagerConfig;
use crate::error::LoadError;
use crate::handler::MockHandler;
use crate::record::{Handler, MockRecord, RecordSet};
use crate::script::ScriptEvaluator;
use anyhow::{bail, Context};
use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Top-level key holding the mapping when a file wraps it.
pub const DEFAULT_EXPORT: &str = "default";

/// Value exported under one route key.
pub enum ExportValue {
    Function(Arc<dyn MockHandler>),
    Value(Value),
}

impl ExportValue {
    fn into_handler(self) -> Handler {
        match self {
            ExportValue::Function(handler) => Handler::Dynamic(handler),
            ExportValue::Value(value) => Handler::Static(value),
        }
    }
}

/// One entry of a mock file's mapping.
pub struct Export {
    pub key: String,
    pub value: ExportValue,
}

/// Turns a mock file into its exported entries.
pub trait ModuleEvaluator: Send + Sync {
    fn evaluate(&self, path: &Path) -> anyhow::Result<Vec<Export>>;
}

/// JSON and YAML mock files; entries keep document order.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataEvaluator;

impl ModuleEvaluator for DataEvaluator {
    fn evaluate(&self, path: &Path) -> anyhow::Result<Vec<Export>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let document: Value = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };

        let mut map = match document {
            Value::Null => return Ok(Vec::new()),
            Value::Object(map) => map,
            other => bail!("Mock data file must contain a mapping, got {}", value_kind(&other)),
        };
        let wrapped = map.get(DEFAULT_EXPORT).cloned();
        if let Some(Value::Object(inner)) = wrapped {
            map = inner;
        }

        Ok(map
            .into_iter()
            .map(|(key, value)| Export {
                key,
                value: ExportValue::Value(value),
            })
            .collect())
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Loads the record set from the working directory.
#[derive(Clone)]
pub struct MockLoader {
    cwd: PathBuf,
    patterns: Vec<String>,
    ignore: Vec<String>,
    script: Arc<dyn ModuleEvaluator>,
    data: Arc<dyn ModuleEvaluator>,
}

impl MockLoader {
    pub fn new(cwd: &Path, config: &MockManagerConfig) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            patterns: config.mock_patterns(),
            ignore: config.ignore_patterns(),
            script: Arc::new(ScriptEvaluator),
            data: Arc::new(DataEvaluator),
        }
    }

    /// Replace the evaluator used for `.rhai` files.
    pub fn with_script_evaluator(mut self, evaluator: Arc<dyn ModuleEvaluator>) -> Self {
        self.script = evaluator;
        self
    }

    /// Patterns scanned by this loader, default first.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Directories a watcher should observe, one per scanned pattern.
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = Vec::new();
        for pattern in &self.patterns {
            let root = self.cwd.join(literal_base(pattern));
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        roots
    }

    /// Files to load, in load order.
    ///
    /// Within a pattern files are sorted by path; a file matched by several
    /// patterns is kept at its first position only.
    pub fn discover(&self) -> Result<Vec<PathBuf>, LoadError> {
        let ignore = build_glob_set(&self.ignore)?;
        let mut seen = HashSet::new();
        let mut files = Vec::new();

        for pattern in &self.patterns {
            let matcher = build_glob(pattern)?;
            let absolute = Path::new(pattern).is_absolute();
            let root = self.cwd.join(literal_base(pattern));
            if !root.exists() {
                debug!(pattern = %pattern, root = %root.display(), "Mock pattern base does not exist");
                continue;
            }

            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = entry.map_err(|source| LoadError::Walk {
                    dir: root.clone(),
                    source,
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(&self.cwd).unwrap_or(entry.path());
                let candidate = if absolute { entry.path() } else { relative };
                if !matcher.is_match(candidate) || ignore.is_match(relative) {
                    continue;
                }
                if seen.insert(entry.path().to_path_buf()) {
                    files.push(entry.path().to_path_buf());
                }
            }
        }
        Ok(files)
    }

    /// Evaluate every mock file into a fresh record set.
    pub fn load(&self) -> Result<RecordSet, LoadError> {
        let files = self.discover()?;
        let mut records = RecordSet::new();

        for file in &files {
            let exports = self.evaluate(file).map_err(|source| LoadError::Evaluate {
                file: file.clone(),
                source,
            })?;
            let relative = self.relative(file);
            let source = std::fs::read_to_string(file).unwrap_or_default();

            for export in exports {
                let line = locate_line(&source, &export.key);
                let record = MockRecord::from_export(
                    &export.key,
                    export.value.into_handler(),
                    Some(relative.clone()),
                    line,
                );
                let id = record.id.clone();
                if let Some(previous) = records.insert(record) {
                    warn!(
                        "{} is duplicated in {} and {}",
                        id,
                        relative,
                        previous.file.as_deref().unwrap_or("-")
                    );
                }
            }
        }

        debug!(files = files.len(), records = records.len(), "Loaded mock files");
        Ok(records)
    }

    fn evaluate(&self, file: &Path) -> anyhow::Result<Vec<Export>> {
        match file.extension().and_then(|e| e.to_str()) {
            Some("rhai") => self.script.evaluate(file),
            Some("json" | "yaml" | "yml") => self.data.evaluate(file),
            _ => bail!("Unsupported mock file type"),
        }
    }

    fn relative(&self, file: &Path) -> String {
        file.strip_prefix(&self.cwd)
            .unwrap_or(file)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

fn build_glob(pattern: &str) -> Result<GlobMatcher, LoadError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|source| LoadError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet, LoadError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|source| LoadError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| LoadError::Pattern {
        pattern: patterns.join(", "),
        source,
    })
}

/// Leading components of a glob that contain no wildcard.
pub(crate) fn literal_base(pattern: &str) -> PathBuf {
    let mut base = PathBuf::new();
    let components: Vec<Component> = Path::new(pattern).components().collect();
    for (i, component) in components.iter().enumerate() {
        let text = component.as_os_str().to_string_lossy();
        let is_last = i + 1 == components.len();
        if is_last || text.contains(['*', '?', '[', '{']) {
            break;
        }
        base.push(component);
    }
    base
}

/// First line (1-based) mentioning the route key as a quoted string or YAML key.
fn locate_line(source: &str, key: &str) -> Option<u32> {
    let double = format!("\"{key}\"");
    let single = format!("'{key}'");
    let bare = format!("{key}:");
    source
        .lines()
        .position(|line| {
            line.contains(&double) || line.contains(&single) || line.trim_start().starts_with(&bare)
        })
        .and_then(|index| u32::try_from(index + 1).ok())
}
