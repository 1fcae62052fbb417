use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("Bucket name must not be empty")]
    EmptyBucket,

    #[error("Ack watermark percent must fall in (0, 100], found {0}")]
    BadAckWatermark(u8),

    #[error("Connection buffer size must be positive")]
    ZeroBufferSize,

    #[error("Retry max-attempt must be positive")]
    ZeroRetryAttempts,
}
