use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;

use crate::partition_state::PartitionState;

/// The per-partition states of one bucket session.
///
/// Created on the first successful connect and reused across reconnects so
/// stream progress survives; only the connected flag toggles.
pub struct SessionState {
    partitions: Vec<Arc<PartitionState>>,
    connected: AtomicBool,
}

impl SessionState {
    pub fn new(num_partitions: u16) -> Self {
        let partitions = (0..num_partitions)
            .map(|partition| Arc::new(PartitionState::new(partition)))
            .collect();
        Self {
            partitions,
            connected: AtomicBool::new(true),
        }
    }

    pub fn num_partitions(&self) -> u16 {
        self.partitions.len() as u16
    }

    pub fn get(&self, partition: u16) -> Option<Arc<PartitionState>> {
        self.partitions.get(partition as usize).cloned()
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Arc<PartitionState>> {
        self.partitions.iter()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Rearm the session on reconnect, preserving per-partition progress.
    pub fn set_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        for partition in &self.partitions {
            partition.clear_session_disconnected();
        }
    }

    /// Session-wide teardown: every partition drops to `Disconnected` and
    /// every parked waiter is signaled.
    pub fn set_disconnected(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Session marked disconnected; signaling all partitions");
        for partition in &self.partitions {
            partition.set_session_disconnected();
        }
    }
}
