//! The repair reactor.
//!
//! A single long-lived task consumes the conductor-owned event queue and
//! drives recovery: reconnecting dropped channels, rerouting partitions whose
//! master moved, reopening streams from their saved resume points. Being the
//! sole consumer keeps per-partition event handling in arrival order.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use log::{info, warn};
use model::bucket::BucketConfig;
use model::event::{DcpEvent, SystemEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::conductor::Conductor;
use crate::error::ClientError;
use crate::partition_state::StreamState;
use crate::retry::{RetryPolicy, Verdict};

tokio::task_local! {
    static IN_FIXER: bool;
}

/// Whether the current task is the fixer. `Conductor::disconnect` uses this
/// to avoid joining the fixer onto itself when invoked from a fixer-driven
/// callback.
pub(crate) fn called_from_fixer() -> bool {
    IN_FIXER.try_with(|flag| *flag).unwrap_or(false)
}

pub(crate) struct FixerHandle {
    /// Resolves to the event receiver so the conductor can rearm it.
    pub(crate) join: JoinHandle<mpsc::UnboundedReceiver<DcpEvent>>,
    started: watch::Receiver<bool>,
}

impl FixerHandle {
    /// Gate establishing connections on the reactor being ready to consume.
    pub(crate) async fn wait_till_started(&mut self) {
        while !*self.started.borrow() {
            if self.started.changed().await.is_err() {
                return;
            }
        }
    }
}

pub(crate) struct Fixer {
    conductor: Weak<Conductor>,
    last_config: Option<Arc<BucketConfig>>,
    /// ChannelDropped rounds seen per address since its last successful
    /// repair. Bounds revival so a flapping node cannot loop forever.
    repair_rounds: HashMap<SocketAddr, u32>,
}

impl Fixer {
    pub(crate) fn spawn(
        conductor: Weak<Conductor>,
        mut events: mpsc::UnboundedReceiver<DcpEvent>,
    ) -> FixerHandle {
        let (started_tx, started_rx) = watch::channel(false);
        let join = tokio::spawn(IN_FIXER.scope(true, async move {
            let mut fixer = Fixer {
                last_config: conductor.upgrade().and_then(|c| c.provider().config()),
                conductor,
                repair_rounds: HashMap::new(),
            };
            let _ = started_tx.send(true);
            info!("Fixer started");
            while let Some(event) = events.recv().await {
                if matches!(event, DcpEvent::Poison) {
                    info!("Fixer poisoned; shutting down");
                    break;
                }
                fixer.handle(event).await;
            }
            info!("Fixer stopped");
            events
        }));
        FixerHandle {
            join,
            started: started_rx,
        }
    }

    async fn handle(&mut self, event: DcpEvent) {
        let Some(conductor) = self.conductor.upgrade() else {
            return;
        };
        match event {
            DcpEvent::ChannelDropped { address, cause } => {
                self.on_channel_dropped(&conductor, address, cause).await;
            }
            DcpEvent::StreamEnd { partition, reason } => {
                if reason.is_final() {
                    return;
                }
                info!(
                    "Stream for partition {} ended with {:?}; reopening",
                    partition, reason
                );
                self.restart_stream(&conductor, partition).await;
            }
            DcpEvent::Rollback { partition, seqno } => {
                if let Some(session) = conductor.session_state() {
                    if let Some(ps) = session.get(partition) {
                        ps.rollback(seqno);
                    }
                }
                conductor
                    .system_handler()
                    .on_event(SystemEvent::Rollback { partition, seqno });
                self.restart_stream(&conductor, partition).await;
            }
            DcpEvent::NotMyVbucket { partition } => {
                self.on_not_my_vbucket(&conductor, partition).await;
            }
            DcpEvent::ConfigRevision { config } => {
                self.on_config(&conductor, config).await;
            }
            DcpEvent::Fatal {
                address,
                partition,
                cause,
            } => {
                self.on_fatal(&conductor, address, partition, cause).await;
            }
            DcpEvent::Poison => {}
        }
    }

    async fn on_channel_dropped(
        &mut self,
        conductor: &Arc<Conductor>,
        address: SocketAddr,
        cause: String,
    ) {
        warn!("Channel {} dropped: {}", address, cause);
        conductor.system_handler().on_event(SystemEvent::ChannelDropped {
            address,
            cause: cause.clone(),
        });

        // Resume points live in the partition states; all we need from the
        // dying channel is which partitions it owned.
        let owned = match conductor.remove_channel(address).await {
            Some(channel) => {
                let owned = channel.owned_partitions();
                channel.disconnect(false).await;
                owned
            }
            None => Vec::new(),
        };

        if !conductor.is_connected() {
            return;
        }

        let rounds = self.repair_rounds.entry(address).or_insert(0);
        *rounds += 1;
        let max_rounds = conductor.config().retry.max_repair_attempts_per_channel;
        if *rounds > max_rounds {
            warn!(
                "Giving up on channel {} after {} repair rounds",
                address, max_rounds
            );
            conductor.system_handler().on_event(SystemEvent::ChannelFailed {
                address,
                cause: format!("repair abandoned after {} rounds: {}", max_rounds, cause),
            });
            self.fail_partitions(conductor, &owned, "channel repair abandoned");
            return;
        }

        let mut all_restarted = true;
        for partition in owned {
            // The current master may be a different node by now.
            all_restarted &= self.restart_stream(conductor, partition).await;
        }
        if all_restarted {
            self.repair_rounds.remove(&address);
        }
    }

    /// Reconnect the partition's current master and reopen the stream from
    /// its saved resume point. Bounded by the retry policy; exhaustion marks
    /// the partition failed.
    async fn restart_stream(&mut self, conductor: &Arc<Conductor>, partition: u16) -> bool {
        let Some(session) = conductor.session_state() else {
            return false;
        };
        if !session.is_connected() {
            return false;
        }
        let Some(ps) = session.get(partition) else {
            return false;
        };

        let policy = RetryPolicy::from_config(conductor.config());
        let mut attempt = 1;
        loop {
            if !session.is_connected() {
                return false;
            }
            match self.try_restart(conductor, partition).await {
                Ok(()) => return true,
                Err(e) => match policy.check(attempt, e) {
                    Verdict::Retry(delay) => {
                        info!(
                            "Repair attempt {} for partition {} failed; retrying in {:?}",
                            attempt, partition, delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Verdict::Abort(e) => {
                        warn!("Abandoning repair of partition {}: {}", partition, e);
                        ps.set_state(StreamState::Disconnected);
                        conductor
                            .system_handler()
                            .on_event(SystemEvent::PartitionFailed {
                                partition,
                                cause: e.to_string(),
                            });
                        return false;
                    }
                },
            }
        }
    }

    async fn try_restart(
        &self,
        conductor: &Arc<Conductor>,
        partition: u16,
    ) -> Result<(), ClientError> {
        let address = conductor.master_address(partition)?;
        let channel = conductor.add_channel(address).await?;
        channel.open_stream(partition);
        Ok(())
    }

    /// A node answered NotMyVbucket: poll the provider until a config with a
    /// newer revision shows up, then reroute the partition.
    async fn on_not_my_vbucket(&mut self, conductor: &Arc<Conductor>, partition: u16) {
        let stale_rev = self
            .last_config
            .as_ref()
            .map(|config| config.rev)
            .unwrap_or(0);
        let policy = RetryPolicy::from_config(conductor.config());
        let mut attempt = 1;
        loop {
            let refreshed = conductor
                .provider()
                .refresh(
                    conductor.config().io_timeout(),
                    1,
                    conductor.config().retry_delay(),
                )
                .await;
            let error = match refreshed {
                Ok(config) if config.rev > stale_rev => {
                    self.last_config = Some(Arc::clone(&config));
                    break;
                }
                Ok(config) => ClientError::ConfigRefresh(format!(
                    "revision {} is not newer than {}",
                    config.rev, stale_rev
                )),
                Err(e) => e,
            };
            match policy.check(attempt, error) {
                Verdict::Retry(delay) => {
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Verdict::Abort(e) => {
                    warn!(
                        "Partition {} unroutable, config never caught up: {}",
                        partition, e
                    );
                    self.fail_partitions(conductor, &[partition], &e.to_string());
                    return;
                }
            }
        }
        self.restart_stream(conductor, partition).await;
    }

    /// Diff the new topology against the previous one: move streams whose
    /// master changed, drop channels of departed nodes, add channels for new
    /// nodes holding primaries.
    async fn on_config(&mut self, conductor: &Arc<Conductor>, config: Arc<BucketConfig>) {
        info!("Applying config revision {}", config.rev);
        let previous = self.last_config.replace(Arc::clone(&config));
        conductor
            .system_handler()
            .on_event(SystemEvent::TopologyUpdated { rev: config.rev });

        // Channels of nodes the new topology no longer contains.
        let valid: HashSet<SocketAddr> = config
            .nodes
            .iter()
            .filter_map(|node| conductor.resolve(node).ok())
            .collect();
        for address in conductor.channel_addresses().await {
            if valid.contains(&address) {
                continue;
            }
            info!("Node {} left the topology; dropping its channel", address);
            if let Some(channel) = conductor.remove_channel(address).await {
                channel.disconnect(false).await;
            }
            self.repair_rounds.remove(&address);
        }

        let Some(previous) = previous else {
            return;
        };

        for partition in 0..config.num_partitions() {
            let old_master = previous.master_of(partition, false);
            let new_master = config.master_of(partition, false);
            if old_master == new_master {
                continue;
            }
            let streaming = conductor
                .session_state()
                .and_then(|session| session.get(partition))
                .map(|ps| {
                    matches!(
                        ps.state(),
                        StreamState::Connected | StreamState::Connecting
                    )
                })
                .unwrap_or(false);
            if !streaming {
                continue;
            }
            info!(
                "Master of partition {} moved ({:?} -> {:?}); migrating stream",
                partition, old_master, new_master
            );
            // Quietly close on the old node when its channel is still around;
            // a late STREAM_END from it is ignored after forget.
            if let Some(old_index) = old_master {
                if let Some(address) = previous
                    .node_at(old_index)
                    .and_then(|node| conductor.resolve(node).ok())
                {
                    if let Some(channel) = conductor.channel_at(address).await {
                        channel.close_stream_quiet(partition);
                    }
                }
            }
            self.restart_stream(conductor, partition).await;
        }

        // Pre-open channels on new nodes that master primaries, so stream
        // starts do not pay the connect cost later.
        for (index, node) in config.nodes.iter().enumerate() {
            if !config.has_primary_partitions_on(index) {
                continue;
            }
            if let Ok(address) = conductor.resolve(node) {
                if conductor.channel_at(address).await.is_none() {
                    if let Err(e) = conductor.add_channel(address).await {
                        warn!("Failed to pre-open channel to {}: {}", address, e);
                    }
                }
            }
        }
    }

    async fn on_fatal(
        &mut self,
        conductor: &Arc<Conductor>,
        address: Option<SocketAddr>,
        partition: Option<u16>,
        cause: String,
    ) {
        if let Some(partition) = partition {
            self.fail_partitions(conductor, &[partition], &cause);
        }
        if let Some(address) = address {
            warn!("Channel {} failed fatally: {}", address, cause);
            let owned = match conductor.remove_channel(address).await {
                Some(channel) => {
                    let owned = channel.owned_partitions();
                    channel.disconnect(false).await;
                    owned
                }
                None => Vec::new(),
            };
            self.fail_partitions(conductor, &owned, &cause);
            conductor.system_handler().on_event(SystemEvent::ChannelFailed {
                address,
                cause,
            });
        }
    }

    fn fail_partitions(&self, conductor: &Arc<Conductor>, partitions: &[u16], cause: &str) {
        let Some(session) = conductor.session_state() else {
            return;
        };
        for partition in partitions {
            if let Some(ps) = session.get(*partition) {
                ps.set_state(StreamState::Disconnected);
            }
            conductor
                .system_handler()
                .on_event(SystemEvent::PartitionFailed {
                    partition: *partition,
                    cause: cause.to_owned(),
                });
        }
    }
}
