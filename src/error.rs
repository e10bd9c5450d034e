use std::time::Duration;

use thiserror::Error;

/// Errors raised while running an external hardware tool.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{tool}: binary not found")]
    NotFound { tool: String },

    #[error("{tool}: permission denied")]
    PermissionDenied { tool: String },

    #[error("{tool}: timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("{tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool}: exited with code {code}: {stderr}")]
    Failed {
        tool: String,
        code: i32,
        stderr: String,
    },
}

/// Errors raised while parsing tool output into records.
///
/// Parsers degrade per-record where they can; these variants cover the cases
/// where the top-level structure itself is unusable.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed {what}: {detail}")]
    MalformedStructure { what: &'static str, detail: String },

    #[error("unexpected record shape in {what}: {detail}")]
    UnexpectedRecordShape { what: &'static str, detail: String },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A collector-level failure, carried inside a `CollectionResult`.
///
/// Collectors never propagate these as raised errors; the registry only sees
/// them as data attached to a finished result.
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("collector unavailable: {reason}")]
    Unavailable { reason: String },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("scrape deadline exceeded")]
    DeadlineExceeded,

    #[error("collector failed: {reason}")]
    Failed { reason: String },
}

impl CollectionError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// Short kind tag for logs and status reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "unavailable",
            Self::Execution(ExecutionError::NotFound { .. }) => "not_found",
            Self::Execution(ExecutionError::PermissionDenied { .. }) => "permission_denied",
            Self::Execution(ExecutionError::Timeout { .. }) => "timeout",
            Self::Execution(_) => "execution",
            Self::Parse(_) => "parse",
            Self::Http(_) => "http",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Failed { .. } => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        let err = CollectionError::unavailable("ipmimonitoring not installed");
        assert_eq!(err.kind(), "unavailable");

        let err = CollectionError::from(ExecutionError::Timeout {
            tool: "storcli".into(),
            timeout: Duration::from_secs(10),
        });
        assert_eq!(err.kind(), "timeout");

        let err = CollectionError::from(ParseError::MalformedStructure {
            what: "storcli output",
            detail: "missing Controllers".into(),
        });
        assert_eq!(err.kind(), "parse");
    }
}
