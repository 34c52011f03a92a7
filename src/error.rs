//! Error taxonomy for the fetch manager (§7 of the design).
//!
//! `CacheError` intentionally never appears here: L2 failures are logged at
//! their point of occurrence in `storage` and never propagate to a caller.

use std::fmt;

/// The only errors a caller of [`crate::fetch`] / [`crate::fetch_stream`] can
/// observe. A non-2xx upstream status is not an error — it is delivered as a
/// successful [`crate::response::Response`].
#[derive(Debug, Clone)]
pub enum FetchError {
    /// Config missing or malformed; fatal for the call that triggered the load.
    Config(String),
    /// Connect/socket/DNS failure reported by the transport.
    Transport(String),
    /// One of the `connect`, `socket`, or `request` timeout stages fired.
    Timeout(TimeoutStage),
    /// The caller's cancellation handle fired. Not logged as an error.
    Aborted,
}

/// Which timeout stage elapsed first (§5: "enforce each independently,
/// shortest wins").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    Connect,
    Socket,
    Request,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutStage::Connect => write!(f, "connect"),
            TimeoutStage::Socket => write!(f, "socket"),
            TimeoutStage::Request => write!(f, "request"),
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Config(msg) => write!(f, "config error: {msg}"),
            FetchError::Transport(msg) => write!(f, "transport error: {msg}"),
            FetchError::Timeout(stage) => write!(f, "{stage} timeout elapsed"),
            FetchError::Aborted => write!(f, "request aborted by caller"),
        }
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    /// The `http.error` telemetry attribute value for this error, or `None`
    /// for `Aborted` which is explicitly not logged as an error (§7).
    pub fn telemetry_tag(&self) -> Option<&'static str> {
        match self {
            FetchError::Config(_) => Some("config"),
            FetchError::Transport(_) => Some("network"),
            FetchError::Timeout(_) => Some("timeout"),
            FetchError::Aborted => None,
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Transport(err.to_string())
    }
}

impl From<hyper::Error> for FetchError {
    fn from(err: hyper::Error) -> Self {
        FetchError::Transport(err.to_string())
    }
}
