use thiserror::Error;

/// Errors surfaced while loading or persisting the device registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("io error for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed device file {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors returned by the framed channel's read/write path.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connection closed")]
    Closed,
    #[error("frame exceeds maximum size ({0} bytes)")]
    TooLarge(u32),
    #[error("authentication failed")]
    AuthFail,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("read timed out")]
    Timeout,
}

/// Errors returned by the RPC codec.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Errors surfaced while loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing required field {0}")]
    MissingField(String),
}

/// Outcome of handling one RPC request inside a plugin's message loop.
///
/// Models the source's `HandlerExit`/`HandlerFail`/`PluginFail` exceptions
/// as explicit variants instead of caught exceptions.
pub enum HandlerOutcome {
    /// Keep the session's loop running. `Some(response)` sends a reply
    /// first; `None` covers handlers (e.g. notifications) that reply to
    /// nothing by contract.
    Continue(Option<serde_json::Value>),
    /// Log this message, send nothing, keep the loop running.
    Abort(String),
    /// Log this message, then terminate the session.
    Kill(String),
}

/// Errors a plugin handler can produce; converted to a `HandlerOutcome` by
/// the dispatcher.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{0}")]
    Fail(String),
    #[error("{0}")]
    SessionFail(String),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
