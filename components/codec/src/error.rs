use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    /// Not enough data is available to parse a message
    #[error("Not enough data for a frame")]
    Incomplete,

    #[error("The incoming frame is invalid. Reason: {0}")]
    BadFrame(String),

    #[error("Invalid frame body length(max: {max:?}, found: {found:?})")]
    TooLongFrame { found: u32, max: u32 },

    #[error("Frame magic code mismatch(found: {found:?})")]
    MagicCodeMismatch { found: u8 },

    #[error("Underlying connection reset by peer")]
    ConnectionReset,
}
