use codec::frame::{OperationCode, Status};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Bad address `{0}`")]
    BadAddress(String),

    #[error("Timeout on connecting `{0}`")]
    ConnectTimeout(String),

    #[error("Failed to establish TCP connection to `{0}`. Cause: `{1}`")]
    ConnectFailure(String, String),

    #[error("Authentication against `{0}` failed")]
    AuthFailed(String),

    #[error("Bucket `{0}` not found")]
    BucketNotFound(String),

    #[error("Channel to `{0}` is closed")]
    ChannelClosed(String),

    #[error("Server answered {status} to {opcode}")]
    ServerStatus {
        opcode: OperationCode,
        status: Status,
    },

    #[error("Operation timed out")]
    TimedOut,

    #[error("Session disconnected")]
    SessionDisconnected,

    #[error("Maximum number of attempts reached after {attempts} retries")]
    CannotRetry {
        attempts: u32,
        #[source]
        cause: Box<ClientError>,
    },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Config refresh failed: {0}")]
    ConfigRefresh(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Errors no retry loop may swallow: repeating the operation cannot help.
    pub fn is_interrupting(&self) -> bool {
        matches!(
            self,
            ClientError::AuthFailed(_)
                | ClientError::BucketNotFound(_)
                | ClientError::SessionDisconnected
                | ClientError::IllegalState(_)
                | ClientError::CannotRetry { .. }
        )
    }
}
