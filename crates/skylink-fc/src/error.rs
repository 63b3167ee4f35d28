use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("open {endpoint}: {source}")]
    Open {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no vehicle heartbeat on {endpoint} within {timeout:?}")]
    NoHeartbeat { endpoint: String, timeout: Duration },

    #[error("vehicle connection failed after {attempts} attempts on {endpoint}: {last}")]
    ConnectionFailed { endpoint: String, attempts: u32, last: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("link reader stopped")]
    Closed,
}

impl LinkError {
    /// Errors that mean the session is gone and the caller should reconnect.
    pub fn is_transport(&self) -> bool {
        matches!(self, LinkError::Transport(_) | LinkError::Closed)
    }
}
