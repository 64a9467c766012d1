use thiserror::Error;
use uuid::Uuid;

/// Main engine error type that encompasses all possible failure modes
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Concurrent operation error: {details}")]
    Concurrency { details: String },
}

/// Format-level failures: the document never became a `DocumentTree`.
/// Always fatal, always local to the single submitted document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed XML: {detail}")]
    Malformed { detail: String },

    #[error("unsupported CFDI version: {tag:?}")]
    UnsupportedVersion { tag: Option<String> },

    #[error("missing required element: {path}")]
    MissingRequiredElement { path: String },
}

/// Index store failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The identifier is already bound to different content. Surfaced
    /// distinctly from ordinary validation failure: it indicates data
    /// corruption or tampering, not a malformed document.
    #[error("identifier conflict: {identifier} is already bound to different content")]
    IdentifierConflict { identifier: Uuid },
}

/// Durable-archive failures.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive read error: {key} - {detail}")]
    Read { key: String, detail: String },

    #[error("archive write error: {key} - {detail}")]
    Write { key: String, detail: String },

    #[error("archive entry corrupt: {key} - {detail}")]
    Corrupt { key: String, detail: String },

    #[error("archive index error: {detail}")]
    Index { detail: String },
}

/// Certificate-status collaborator failures. These degrade the chain check
/// to `Unverifiable`; they never abort ingestion.
#[derive(Error, Debug)]
pub enum StatusError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("status request timeout for serial {serial} after {timeout_secs} seconds")]
    Timeout { serial: String, timeout_secs: u64 },

    #[error("unexpected status payload: {detail}")]
    UnexpectedPayload { detail: String },
}

/// Configuration-specific error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    FileNotFound { path: std::path::PathBuf },

    #[error("invalid configuration format: {0}")]
    InvalidFormat(#[from] toml::de::Error),

    #[error("invalid configuration value: {field} = {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;
