use codec::frame::OperationCode;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("Frame carries opcode {found} where {expected} was required")]
    UnexpectedOpcode {
        expected: OperationCode,
        found: OperationCode,
    },

    #[error("Body of {opcode} message is malformed: {reason}")]
    MalformedBody {
        opcode: OperationCode,
        reason: String,
    },
}
