//! Configuration for the mock manager.
//!
//! Defines which files are scanned for mocks, where the enable/disable cache
//! lives, and how matched requests are logged and routed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Glob that is always scanned, relative to the working directory.
pub const MOCK_FILE_GLOB: &str = "mock/**/*.{rhai,json,yaml,yml}";

/// Rhai definition files only declare signatures and are never loaded.
pub const DEFINITION_FILE_GLOB: &str = "**/*.d.rhai";

/// Name of the cache file inside `cacheOutput`.
pub const CACHE_FILE_NAME: &str = "mock.json";

/// Main configuration for the mock manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MockManagerConfig {
    /// Glob patterns for files that must not be parsed as mocks
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Extra glob patterns scanned after the default `mock/` directory
    #[serde(default)]
    pub include: Vec<String>,

    /// Directory holding the cached record set
    #[serde(default = "default_cache_output")]
    pub cache_output: PathBuf,

    /// Debug logging switches
    #[serde(default)]
    pub log: LogSettings,

    /// Prefix prepended to every user-defined mock path
    #[serde(default)]
    pub prefix: String,

    /// Prefix for the control routes themselves
    #[serde(default)]
    pub route_basename: String,

    /// Whether the host should switch off its own built-in mock facility
    #[serde(default)]
    pub auto_disable_umi_mock: bool,

    /// Reload mocks when files under the scanned directories change
    #[serde(default = "default_true")]
    pub watch: bool,

    /// Quiet period before a burst of file changes triggers one reload
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Command used by the open-in-editor control endpoint
    #[serde(default = "default_editor")]
    pub editor: String,
}

impl Default for MockManagerConfig {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            include: Vec::new(),
            cache_output: default_cache_output(),
            log: LogSettings::default(),
            prefix: String::new(),
            route_basename: String::new(),
            auto_disable_umi_mock: false,
            watch: true,
            debounce_ms: default_debounce_ms(),
            editor: default_editor(),
        }
    }
}

impl MockManagerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        for pattern in self.include.iter().chain(self.exclude.iter()) {
            globset::Glob::new(pattern)
                .map_err(|e| anyhow::anyhow!("Invalid glob {}: {}", pattern, e))?;
        }
        validate_route_prefix("prefix", &self.prefix)?;
        validate_route_prefix("routeBasename", &self.route_basename)?;
        if self.editor.trim().is_empty() {
            anyhow::bail!("editor cannot be empty");
        }
        Ok(())
    }

    /// Base path of the control endpoints, `<routeBasename>/_mock`.
    pub fn control_base(&self) -> String {
        format!("{}/_mock", self.route_basename.trim_end_matches('/'))
    }

    /// Cache directory resolved against the working directory.
    pub fn cache_dir(&self, cwd: &Path) -> PathBuf {
        cwd.join(&self.cache_output)
    }

    /// All scanned patterns, default first.
    pub fn mock_patterns(&self) -> Vec<String> {
        std::iter::once(MOCK_FILE_GLOB.to_string())
            .chain(self.include.iter().cloned())
            .collect()
    }

    /// All ignored patterns, definition files first.
    pub fn ignore_patterns(&self) -> Vec<String> {
        std::iter::once(DEFINITION_FILE_GLOB.to_string())
            .chain(self.exclude.iter().cloned())
            .collect()
    }
}

fn validate_route_prefix(name: &str, value: &str) -> anyhow::Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    if !value.starts_with('/') {
        anyhow::bail!("{} must start with '/': {}", name, value);
    }
    if value.len() > 1 && value.ends_with('/') {
        anyhow::bail!("{} must not end with '/': {}", name, value);
    }
    Ok(())
}

/// Logging switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSettings {
    /// Log every request intercepted by a mock
    #[serde(default = "default_true")]
    pub r#match: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { r#match: true }
    }
}

fn default_true() -> bool {
    true
}

fn default_cache_output() -> PathBuf {
    PathBuf::from("node_modules/.cache/mock")
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_editor() -> String {
    "code".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
exclude:
  - "mock/legacy/**"
include:
  - "src/**/_mock.rhai"
cacheOutput: .cache/mock
log:
  match: false
prefix: /api
routeBasename: /admin
autoDisableUmiMock: true
"#;
        let config: MockManagerConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.exclude, vec!["mock/legacy/**"]);
        assert_eq!(config.include, vec!["src/**/_mock.rhai"]);
        assert_eq!(config.cache_output, PathBuf::from(".cache/mock"));
        assert!(!config.log.r#match);
        assert_eq!(config.prefix, "/api");
        assert!(config.auto_disable_umi_mock);
        assert_eq!(config.control_base(), "/admin/_mock");
    }

    #[test]
    fn test_defaults() {
        let config: MockManagerConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.log.r#match);
        assert!(config.watch);
        assert_eq!(config.debounce_ms, 300);
        assert_eq!(config.prefix, "");
        assert_eq!(config.control_base(), "/_mock");
        assert_eq!(
            config.cache_dir(Path::new("/app")),
            PathBuf::from("/app/node_modules/.cache/mock")
        );
    }

    #[test]
    fn test_patterns_order() {
        let config = MockManagerConfig {
            include: vec!["extra/*.json".to_string()],
            exclude: vec!["mock/skip.rhai".to_string()],
            ..Default::default()
        };
        assert_eq!(config.mock_patterns(), vec![MOCK_FILE_GLOB, "extra/*.json"]);
        assert_eq!(
            config.ignore_patterns(),
            vec![DEFINITION_FILE_GLOB, "mock/skip.rhai"]
        );
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let config = MockManagerConfig {
            prefix: "api".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MockManagerConfig {
            route_basename: "/admin/".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_glob_rejected() {
        let config = MockManagerConfig {
            include: vec!["mock/[".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<MockManagerConfig, _> = serde_yaml::from_str("stubs: []");
        assert!(result.is_err());
    }
}
