//! Error types for the translation cache.
//! Public translation entry points never surface these: every failure degrades
//! to the original, untranslated content. They are used internally and by the
//! lifecycle entry points (`CacheRuntime::open`, `Config::load`).

use std::path::PathBuf;

/// Failures of the persistent cache store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode record field `{field}`: {reason}")]
    Encode { field: &'static str, reason: String },

    #[error("failed to decode record field `{field}`: {reason}")]
    Decode { field: &'static str, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failures of a translation engine call. Each variant carries a stable log code.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("translation timeout")]
    Timeout,

    #[error("malformed engine response: {0}")]
    Malformed(String),

    #[error("engine misconfigured: {0}")]
    Config(String),
}

impl EngineError {
    /// Stable code used in fill-failure log lines.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Http(_) | EngineError::Status { .. } => "ENGINE_HTTP",
            EngineError::RateLimited { .. } => "ENGINE_RATE_LIMITED",
            EngineError::Timeout => "ENGINE_TIMEOUT",
            EngineError::Malformed(_) => "ENGINE_MALFORMED",
            EngineError::Config(_) => "ENGINE_CONFIG",
        }
    }
}

/// Failures of a client re-query against the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("undecodable response: {0}")]
    Decode(String),
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Errors from opening or closing a [`crate::CacheRuntime`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
