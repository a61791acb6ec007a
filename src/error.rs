use serde::Serialize;
use thiserror::Error;

/// Failures raised while talking to a retailer.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network: {0}")]
    Net(#[from] reqwest::Error),
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("graphql errors: {0}")]
    GraphQl(String),
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("browser: {0}")]
    Browser(String),
    #[error("other: {0}")]
    Other(String),
}

impl FetchError {
    /// 5xx, timeouts and network faults are worth another attempt; 4xx and
    /// malformed configuration are not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            FetchError::Net(_) | FetchError::Timeout(_) | FetchError::Browser(_) => true,
            FetchError::Json(_) | FetchError::GraphQl(_) => true,
            FetchError::Selector { .. } | FetchError::Other(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store {store:?}: {reason}")]
    Invalid { store: String, reason: String },
}

/// Error taxonomy surfaced in [`crate::model::IngestionReport::errors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network/timeout failure that survived the retry bound.
    TransientFetch,
    /// A record lacked a required slot after extraction.
    ParseMiss,
    /// Two resolutions raced to create the same identity key.
    Conflict,
    /// A write failed mid-run; only its product or page was rolled back.
    Persist,
    /// Persistence unreachable; the store run was aborted.
    Fatal,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestError {
    pub kind: ErrorKind,
    /// Unit of work the error belongs to, e.g. `category=Dairy page=3`.
    pub scope: String,
    pub message: String,
}

impl IngestError {
    pub fn new(kind: ErrorKind, scope: impl Into<String>, message: impl ToString) -> Self {
        Self {
            kind,
            scope: scope.into(),
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} [{}]: {}", self.kind, self.scope, self.message)
    }
}
