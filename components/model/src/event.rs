use std::net::SocketAddr;
use std::sync::Arc;

use crate::bucket::BucketConfig;
use crate::stream::{FailoverLogEntry, StreamEndReason};

/// The closed set of events the repair reactor consumes. Channels and the
/// config provider publish these into the conductor-owned queue; only the
/// fixer reads them.
#[derive(Debug, Clone)]
pub enum DcpEvent {
    /// A connection died or went silent past the dead-peer interval.
    ChannelDropped { address: SocketAddr, cause: String },

    /// The server ended a stream. Non-final reasons trigger a reopen.
    StreamEnd {
        partition: u16,
        reason: StreamEndReason,
    },

    /// The server demands the consumer rewind its resume point.
    Rollback { partition: u16, seqno: u64 },

    /// The addressed node no longer masters the partition.
    NotMyVbucket { partition: u16 },

    /// A config with a newer revision was observed.
    ConfigRevision { config: Arc<BucketConfig> },

    /// Unrecoverable failure, scoped to a partition, a channel, or the
    /// whole session.
    Fatal {
        address: Option<SocketAddr>,
        partition: Option<u16>,
        cause: String,
    },

    /// Shut the reactor down.
    Poison,
}

/// Stream-control notifications delivered to the embedder.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    SnapshotMarker {
        partition: u16,
        start_seqno: u64,
        end_seqno: u64,
    },
    StreamEnd {
        partition: u16,
        reason: StreamEndReason,
    },
    FailoverLogUpdate {
        partition: u16,
        failover_log: Vec<FailoverLogEntry>,
    },
}

/// Out-of-band notifications delivered to the embedder.
#[derive(Debug, Clone)]
pub enum SystemEvent {
    ChannelDropped { address: SocketAddr, cause: String },
    Rollback { partition: u16, seqno: u64 },
    PartitionFailed { partition: u16, cause: String },
    TopologyUpdated { rev: u64 },
    ChannelFailed { address: SocketAddr, cause: String },
}
