//! Per-vBucket stream bookkeeping.
//!
//! Writers are the owning channel's reader task and the fixer, which are
//! mutually exclusive because a partition is bound to exactly one channel at
//! a time. Everyone else only observes, or parks on one of the condition
//! signals.

use std::sync::Mutex;
use std::time::Duration;

use log::{debug, trace, warn};
use model::stream::{FailoverLogEntry, StreamEndReason, StreamRequest};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug)]
struct Inner {
    state: StreamState,
    start_seqno: u64,
    end_seqno: u64,
    snapshot_start_seqno: u64,
    snapshot_end_seqno: u64,
    vbucket_uuid: u64,
    failover_log: Vec<FailoverLogEntry>,
    current_vbucket_seqno: u64,
    pending_failover_request: bool,
    pending_seq_request: bool,
    end_reason: Option<StreamEndReason>,
    session_disconnected: bool,
}

pub struct PartitionState {
    partition: u16,
    inner: Mutex<Inner>,
    failover_updated: Notify,
    seq_updated: Notify,
    stream_state_changed: Notify,
}

impl PartitionState {
    pub fn new(partition: u16) -> Self {
        Self {
            partition,
            inner: Mutex::new(Inner {
                state: StreamState::Disconnected,
                start_seqno: 0,
                end_seqno: 0,
                snapshot_start_seqno: 0,
                snapshot_end_seqno: 0,
                vbucket_uuid: 0,
                failover_log: Vec::new(),
                current_vbucket_seqno: 0,
                pending_failover_request: false,
                pending_seq_request: false,
                end_reason: None,
                session_disconnected: false,
            }),
            failover_updated: Notify::new(),
            seq_updated: Notify::new(),
            stream_state_changed: Notify::new(),
        }
    }

    pub fn partition(&self) -> u16 {
        self.partition
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().unwrap().state
    }

    pub fn start_seqno(&self) -> u64 {
        self.inner.lock().unwrap().start_seqno
    }

    pub fn end_seqno(&self) -> u64 {
        self.inner.lock().unwrap().end_seqno
    }

    pub fn snapshot(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.snapshot_start_seqno, inner.snapshot_end_seqno)
    }

    pub fn vbucket_uuid(&self) -> u64 {
        self.inner.lock().unwrap().vbucket_uuid
    }

    pub fn failover_log(&self) -> Vec<FailoverLogEntry> {
        self.inner.lock().unwrap().failover_log.clone()
    }

    pub fn current_vbucket_seqno(&self) -> u64 {
        self.inner.lock().unwrap().current_vbucket_seqno
    }

    pub fn end_reason(&self) -> Option<StreamEndReason> {
        self.inner.lock().unwrap().end_reason
    }

    /// Seed the resume point from an embedder-issued stream request.
    pub fn apply_request(&self, request: &StreamRequest) {
        let mut inner = self.inner.lock().unwrap();
        inner.start_seqno = request.start_seqno;
        inner.end_seqno = request.end_seqno;
        inner.snapshot_start_seqno = request.snapshot_start_seqno;
        inner.snapshot_end_seqno = request.snapshot_end_seqno;
        inner.vbucket_uuid = request.vbucket_uuid;
        inner.end_reason = None;
    }

    /// Produce the wire request for (re)opening this partition's stream.
    ///
    /// Picks the most recent failover-log entry whose seqno is at or below
    /// the resume seqno; with no such entry the newest entry is used and the
    /// server replies with rollback semantics. The snapshot window is clamped
    /// so `snapshot_start <= start_seqno <= snapshot_end` holds at the moment
    /// the stream is opened.
    pub fn use_stream_request(&self) -> StreamRequest {
        let mut inner = self.inner.lock().unwrap();
        let resume_seqno = inner.start_seqno;
        let chosen = inner
            .failover_log
            .iter()
            .find(|entry| entry.seqno <= resume_seqno)
            .or_else(|| inner.failover_log.first())
            .map(|entry| entry.uuid);
        if let Some(uuid) = chosen {
            inner.vbucket_uuid = uuid;
        }
        if inner.snapshot_start_seqno > inner.start_seqno {
            inner.snapshot_start_seqno = inner.start_seqno;
        }
        if inner.snapshot_end_seqno < inner.start_seqno {
            inner.snapshot_end_seqno = inner.start_seqno;
        }
        StreamRequest {
            partition: self.partition,
            vbucket_uuid: inner.vbucket_uuid,
            start_seqno: inner.start_seqno,
            end_seqno: inner.end_seqno,
            snapshot_start_seqno: inner.snapshot_start_seqno,
            snapshot_end_seqno: inner.snapshot_end_seqno,
        }
    }

    pub fn failover_request(&self) {
        self.inner.lock().unwrap().pending_failover_request = true;
    }

    pub fn current_seq_request(&self) {
        self.inner.lock().unwrap().pending_seq_request = true;
    }

    pub fn set_failover_log(&self, log: Vec<FailoverLogEntry>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.failover_log = log;
            inner.pending_failover_request = false;
        }
        self.failover_updated.notify_waiters();
    }

    pub fn set_current_vbucket_seqno(&self, seqno: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.current_vbucket_seqno = seqno;
            inner.pending_seq_request = false;
        }
        self.seq_updated.notify_waiters();
    }

    /// Record the snapshot window the next run of mutations falls into.
    pub fn advance_snapshot(&self, start_seqno: u64, end_seqno: u64) {
        let mut inner = self.inner.lock().unwrap();
        trace!(
            "Partition {} snapshot advances to [{}, {}]",
            self.partition,
            start_seqno,
            end_seqno
        );
        inner.snapshot_start_seqno = start_seqno;
        inner.snapshot_end_seqno = end_seqno;
    }

    /// Move the resume seqno forward to a delivered mutation.
    ///
    /// Reaching the requested end seqno finishes the stream.
    pub fn advance_seqno(&self, seqno: u64) {
        let finished = {
            let mut inner = self.inner.lock().unwrap();
            if seqno > inner.snapshot_end_seqno {
                // Reachable when a migration races a stale in-flight frame
                // onto a reopened stream; widen the window rather than lose
                // the mutation.
                warn!(
                    "Partition {} seqno {} escapes snapshot window ending at {}; widening",
                    self.partition, seqno, inner.snapshot_end_seqno
                );
                inner.snapshot_end_seqno = seqno;
            }
            inner.start_seqno = seqno;
            if seqno == inner.end_seqno {
                inner.state = StreamState::Disconnected;
                inner.end_reason = Some(StreamEndReason::Ok);
                true
            } else {
                false
            }
        };
        if finished {
            debug!("Partition {} reached its end seqno", self.partition);
            self.stream_state_changed.notify_waiters();
        }
    }

    /// Rewind the resume point after the server demanded a rollback.
    pub fn rollback(&self, seqno: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.start_seqno = seqno;
        inner.snapshot_start_seqno = seqno;
        inner.snapshot_end_seqno = seqno;
    }

    pub fn set_state(&self, state: StreamState) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == state {
                return;
            }
            trace!(
                "Partition {} stream state: {:?} --> {:?}",
                self.partition,
                inner.state,
                state
            );
            inner.state = state;
        }
        self.stream_state_changed.notify_waiters();
    }

    pub fn set_end(&self, reason: StreamEndReason) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.end_reason = Some(reason);
            inner.state = StreamState::Disconnected;
        }
        self.stream_state_changed.notify_waiters();
    }

    /// Session-wide teardown: unblock every waiter with `SessionDisconnected`.
    pub(crate) fn set_session_disconnected(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.session_disconnected = true;
            inner.state = StreamState::Disconnected;
        }
        self.failover_updated.notify_waiters();
        self.seq_updated.notify_waiters();
        self.stream_state_changed.notify_waiters();
    }

    pub(crate) fn clear_session_disconnected(&self) {
        self.inner.lock().unwrap().session_disconnected = false;
    }

    pub async fn wait_till_failover_updated(&self, timeout: Duration) -> Result<(), ClientError> {
        self.wait_until(&self.failover_updated, timeout, |inner| {
            !inner.pending_failover_request
        })
        .await
    }

    pub async fn wait_till_current_seq_updated(&self, timeout: Duration) -> Result<(), ClientError> {
        self.wait_until(&self.seq_updated, timeout, |inner| {
            !inner.pending_seq_request
        })
        .await
    }

    pub async fn wait_for_state(
        &self,
        expected: StreamState,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        self.wait_until(&self.stream_state_changed, timeout, move |inner| {
            inner.state == expected
        })
        .await
    }

    async fn wait_until<F>(
        &self,
        condition: &Notify,
        timeout: Duration,
        predicate: F,
    ) -> Result<(), ClientError>
    where
        F: Fn(&Inner) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = condition.notified();
            tokio::pin!(notified);
            // Register before re-checking the predicate so a signal landing
            // in between is not lost.
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().unwrap();
                if predicate(&inner) {
                    return Ok(());
                }
                if inner.session_disconnected {
                    return Err(ClientError::SessionDisconnected);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ClientError::TimedOut);
            }
        }
    }
}

impl std::fmt::Debug for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("PartitionState")
            .field("partition", &self.partition)
            .field("state", &inner.state)
            .field("start_seqno", &inner.start_seqno)
            .field("end_seqno", &inner.end_seqno)
            .field(
                "snapshot",
                &(inner.snapshot_start_seqno, inner.snapshot_end_seqno),
            )
            .field("vbucket_uuid", &inner.vbucket_uuid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::stream::NO_END_SEQNO;
    use std::sync::Arc;

    #[test]
    fn test_use_stream_request_picks_matching_entry() {
        let ps = PartitionState::new(0);
        ps.apply_request(&StreamRequest {
            partition: 0,
            vbucket_uuid: 0,
            start_seqno: 50,
            end_seqno: NO_END_SEQNO,
            snapshot_start_seqno: 40,
            snapshot_end_seqno: 50,
        });
        ps.set_failover_log(vec![
            FailoverLogEntry {
                uuid: 0xC,
                seqno: 80,
            },
            FailoverLogEntry {
                uuid: 0xB,
                seqno: 30,
            },
            FailoverLogEntry { uuid: 0xA, seqno: 0 },
        ]);
        let request = ps.use_stream_request();
        assert_eq!(0xB, request.vbucket_uuid, "most recent entry at or below 50");
        assert_eq!(50, request.start_seqno);
    }

    #[test]
    fn test_use_stream_request_falls_back_to_newest_entry() {
        let ps = PartitionState::new(0);
        ps.apply_request(&StreamRequest::at(0, 0, 10, NO_END_SEQNO));
        ps.set_failover_log(vec![
            FailoverLogEntry {
                uuid: 0xC,
                seqno: 90,
            },
            FailoverLogEntry {
                uuid: 0xB,
                seqno: 40,
            },
        ]);
        let request = ps.use_stream_request();
        assert_eq!(0xC, request.vbucket_uuid, "no entry at or below 10");
    }

    #[test]
    fn test_use_stream_request_clamps_snapshot_window() {
        let ps = PartitionState::new(0);
        ps.apply_request(&StreamRequest {
            partition: 0,
            vbucket_uuid: 7,
            start_seqno: 100,
            end_seqno: NO_END_SEQNO,
            snapshot_start_seqno: 0,
            snapshot_end_seqno: 0,
        });
        let request = ps.use_stream_request();
        assert!(request.snapshot_start_seqno <= request.start_seqno);
        assert!(request.start_seqno <= request.snapshot_end_seqno);
    }

    #[test]
    fn test_advance_seqno_finishes_at_end() {
        let ps = PartitionState::new(0);
        ps.apply_request(&StreamRequest {
            partition: 0,
            vbucket_uuid: 0,
            start_seqno: 0,
            end_seqno: 3,
            snapshot_start_seqno: 0,
            snapshot_end_seqno: 3,
        });
        ps.set_state(StreamState::Connected);
        ps.advance_seqno(1);
        ps.advance_seqno(2);
        assert_eq!(StreamState::Connected, ps.state());
        ps.advance_seqno(3);
        assert_eq!(StreamState::Disconnected, ps.state());
        assert_eq!(Some(StreamEndReason::Ok), ps.end_reason());
        assert_eq!(3, ps.start_seqno());
    }

    #[test]
    fn test_advance_seqno_widens_escaped_snapshot() {
        let ps = PartitionState::new(0);
        ps.apply_request(&StreamRequest::at(0, 0, 0, NO_END_SEQNO));
        ps.advance_snapshot(0, 10);
        ps.advance_seqno(15);
        assert_eq!(15, ps.start_seqno());
        assert_eq!((0, 15), ps.snapshot());
    }

    #[test]
    fn test_rollback_collapses_snapshot() {
        let ps = PartitionState::new(0);
        ps.apply_request(&StreamRequest {
            partition: 0,
            vbucket_uuid: 0,
            start_seqno: 50,
            end_seqno: NO_END_SEQNO,
            snapshot_start_seqno: 40,
            snapshot_end_seqno: 60,
        });
        ps.rollback(30);
        assert_eq!(30, ps.start_seqno());
        assert_eq!((30, 30), ps.snapshot());
    }

    #[tokio::test]
    async fn test_wait_till_seq_updated() {
        let ps = Arc::new(PartitionState::new(0));
        ps.current_seq_request();
        let waiter = Arc::clone(&ps);
        let task = tokio::spawn(async move {
            waiter
                .wait_till_current_seq_updated(Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ps.set_current_vbucket_seqno(99);
        task.await.unwrap().unwrap();
        assert_eq!(99, ps.current_vbucket_seqno());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let ps = PartitionState::new(0);
        ps.failover_request();
        let result = ps
            .wait_till_failover_updated(Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(ClientError::TimedOut)));
    }

    #[tokio::test]
    async fn test_session_disconnect_unblocks_waiters() {
        let ps = Arc::new(PartitionState::new(0));
        let waiter = Arc::clone(&ps);
        let task = tokio::spawn(async move {
            waiter
                .wait_for_state(StreamState::Connected, Duration::from_secs(30))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ps.set_session_disconnected();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ClientError::SessionDisconnected)));
    }
}
