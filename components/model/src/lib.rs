pub mod bucket;
pub mod error;
pub mod event;
pub mod message;
pub mod stream;

pub use bucket::{BucketConfig, NodeEndpoint};
pub use error::DecodeError;
pub use event::{ControlEvent, DcpEvent, SystemEvent};
pub use stream::{FailoverLogEntry, StreamEndReason, StreamRequest, NO_END_SEQNO};
