use std::fmt::{self, Display};

/// End seqno requesting an unbounded stream that follows the partition
/// forever.
pub const NO_END_SEQNO: u64 = u64::MAX;

/// One entry of a partition's failover log, identifying a lineage breakpoint.
/// Logs are ordered most-recent-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverLogEntry {
    pub uuid: u64,
    pub seqno: u64,
}

/// Everything a DCP_STREAM_REQ needs: the resume point of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub partition: u16,
    pub vbucket_uuid: u64,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub snapshot_start_seqno: u64,
    pub snapshot_end_seqno: u64,
}

impl StreamRequest {
    /// A stream over `[start, end]` with a collapsed snapshot window, the
    /// common shape when resuming exactly at a snapshot boundary.
    pub fn at(partition: u16, vbucket_uuid: u64, start_seqno: u64, end_seqno: u64) -> Self {
        Self {
            partition,
            vbucket_uuid,
            start_seqno,
            end_seqno,
            snapshot_start_seqno: start_seqno,
            snapshot_end_seqno: start_seqno,
        }
    }
}

impl Display for StreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "StreamRequest[partition={}, uuid={:#x}, seqno=[{}, {}], snapshot=[{}, {}]]",
            self.partition,
            self.vbucket_uuid,
            self.start_seqno,
            self.end_seqno,
            self.snapshot_start_seqno,
            self.snapshot_end_seqno
        )
    }
}

/// Reason carried by a STREAM_END message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndReason {
    /// The stream reached the requested end seqno.
    Ok,
    /// The client asked for the stream to close.
    Closed,
    /// The vbucket state changed; the stream cannot continue here.
    StateChanged,
    /// The server is shutting the connection down.
    Disconnected,
    /// The consumer could not keep up.
    TooSlow,
    Unknown(u32),
}

impl StreamEndReason {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => StreamEndReason::Ok,
            1 => StreamEndReason::Closed,
            2 => StreamEndReason::StateChanged,
            3 => StreamEndReason::Disconnected,
            4 => StreamEndReason::TooSlow,
            other => StreamEndReason::Unknown(other),
        }
    }

    /// Whether the stream ended for good. Non-final reasons make the fixer
    /// reopen the stream from its resume point.
    pub fn is_final(&self) -> bool {
        matches!(self, StreamEndReason::Ok | StreamEndReason::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_reason_codes() {
        assert_eq!(StreamEndReason::Ok, StreamEndReason::from_code(0));
        assert_eq!(StreamEndReason::Closed, StreamEndReason::from_code(1));
        assert_eq!(StreamEndReason::StateChanged, StreamEndReason::from_code(2));
        assert_eq!(StreamEndReason::Unknown(9), StreamEndReason::from_code(9));
    }

    #[test]
    fn test_finality() {
        assert!(StreamEndReason::Ok.is_final());
        assert!(StreamEndReason::Closed.is_final());
        assert!(!StreamEndReason::StateChanged.is_final());
        assert!(!StreamEndReason::TooSlow.is_final());
        assert!(!StreamEndReason::Unknown(9).is_final());
    }
}
