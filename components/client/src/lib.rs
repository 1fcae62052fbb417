//! Partition-aware DCP streaming client.
//!
//! The [`Conductor`] is the public façade: it fetches the bucket topology,
//! opens one binary-protocol channel per master node, negotiates per-vBucket
//! streams, and keeps a background fixer running that repairs streams across
//! rollbacks, dead connections, and topology changes.

pub mod ack;
mod channel;
pub mod conductor;
pub mod config_provider;
pub mod error;
mod fixer;
pub mod handlers;
pub mod partition_state;
pub mod retry;
pub mod session_state;

pub use ack::AckHandle;
pub use conductor::Conductor;
pub use config_provider::{ConfigProvider, FixedConfigProvider};
pub use error::ClientError;
pub use handlers::{ControlEventHandler, DataEvent, DataEventHandler, DataMessage, SystemEventHandler};
pub use partition_state::{PartitionState, StreamState};
pub use retry::{Delay, RetryPolicy, Verdict};
pub use session_state::SessionState;
