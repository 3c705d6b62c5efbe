//! Error types shared across the registry.

use std::path::PathBuf;

/// A reload could not produce a record set.
///
/// Any of these aborts the whole load; the registry keeps serving the
/// previous record set.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Mock file {} parse failed.\n{source:#}", file.display())]
    Evaluate {
        file: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("Invalid mock file pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("Failed to scan {}: {source}", dir.display())]
    Walk {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("Mock loader task failed: {0}")]
    Join(String),
}

/// Reading or writing the cache envelope failed.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cache file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Cache writer task failed: {0}")]
    Join(String),
}

/// A route template could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("Unterminated group in route {0}")]
    UnterminatedGroup(String),
    #[error("Missing parameter name at {index} in route {template}")]
    MissingName { template: String, index: usize },
    #[error("Unexpected modifier {modifier:?} at {index} in route {template}")]
    DanglingModifier {
        template: String,
        index: usize,
        modifier: char,
    },
    #[error("Invalid route pattern {template}: {message}")]
    Regex { template: String, message: String },
}

/// A matched path segment was not valid percent-encoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to decode param '{value}'")]
pub struct DecodeError {
    pub value: String,
}

/// A matched request could not be served.
///
/// Every variant maps to an HTTP status; none of them is a fault of the
/// registry itself except `Handler`.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    BadParam(#[from] DecodeError),
    #[error("Malformed request body: {0}")]
    MalformedBody(String),
    #[error("Request entity too large ({size} > {limit} bytes)")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("Mock handler {id} failed: {message}")]
    Handler { id: String, message: String },
}

impl DispatchError {
    /// HTTP status the host should answer with.
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::BadParam(_) | DispatchError::MalformedBody(_) => 400,
            DispatchError::PayloadTooLarge { .. } => 413,
            DispatchError::Handler { .. } => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_status() {
        let decode = DispatchError::from(DecodeError {
            value: "%E0%A4%A".to_string(),
        });
        assert_eq!(decode.status(), 400);
        assert_eq!(decode.to_string(), "Failed to decode param '%E0%A4%A'");

        let large = DispatchError::PayloadTooLarge { size: 10, limit: 5 };
        assert_eq!(large.status(), 413);

        let handler = DispatchError::Handler {
            id: "GET /a".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(handler.status(), 500);
    }

    #[test]
    fn test_load_error_names_file() {
        let err = LoadError::Evaluate {
            file: PathBuf::from("/app/mock/user.rhai"),
            source: anyhow::anyhow!("Syntax error"),
        };
        let message = err.to_string();
        assert!(message.contains("/app/mock/user.rhai"));
        assert!(message.contains("Syntax error"));
    }
}
