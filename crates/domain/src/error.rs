/// Shared error type used across all hub crates.
///
/// The variants map onto the closed set of error kinds surfaced to
/// clients: auth failures, unknown message types, tool execution
/// failures, router unavailability, proxy/provider failures, storage
/// failures, and schedule failures. Everything else is transport-level
/// (`Io`, `Json`, `Timeout`) or internal (`Config`, `Other`).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("auth: {0}")]
    Auth(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("tool: {0}")]
    ToolExec(String),

    #[error("router: {0}")]
    RouterUnavailable(String),

    #[error("proxy {provider}: {message}")]
    Proxy { provider: String, message: String },

    #[error("storage: {0}")]
    Storage(String),

    #[error("schedule: {0}")]
    Schedule(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
