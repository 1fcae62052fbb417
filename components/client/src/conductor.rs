//! Public façade and coordinator.
//!
//! The conductor owns the channels map, the session state, the event queue
//! feeding the fixer, and the fixer lifecycle. Embedders drive everything
//! through it: connect, establish connections, start/stop streams, query
//! seqnos and failover logs, disconnect.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, error, info};
use model::bucket::{BucketConfig, NodeEndpoint};
use model::event::DcpEvent;
use model::stream::StreamRequest;
use tokio::sync::{mpsc, Mutex};

use crate::channel::DcpChannel;
use crate::config_provider::ConfigProvider;
use crate::error::ClientError;
use crate::fixer::{self, Fixer, FixerHandle};
use crate::handlers::{ControlEventHandler, DataEventHandler, SystemEventHandler};
use crate::partition_state::{PartitionState, StreamState};
use crate::session_state::SessionState;

pub struct Conductor {
    config: Arc<config::Configuration>,
    provider: Arc<dyn ConfigProvider>,

    /// One channel per master node, keyed by its binary-service address.
    channels: Mutex<HashMap<SocketAddr, Arc<DcpChannel>>>,

    session: StdMutex<Option<Arc<SessionState>>>,
    connected: AtomicBool,
    established: AtomicBool,

    events_tx: mpsc::UnboundedSender<DcpEvent>,
    /// Parked here between fixer runs; the fixer task hands it back on exit.
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<DcpEvent>>>,
    fixer: StdMutex<Option<FixerHandle>>,

    data_handler: Arc<dyn DataEventHandler>,
    control_handler: Arc<dyn ControlEventHandler>,
    system_handler: Arc<dyn SystemEventHandler>,
}

impl Conductor {
    pub fn new(
        config: config::Configuration,
        provider: Arc<dyn ConfigProvider>,
        data_handler: Arc<dyn DataEventHandler>,
        control_handler: Arc<dyn ControlEventHandler>,
        system_handler: Arc<dyn SystemEventHandler>,
    ) -> Result<Arc<Self>, ClientError> {
        config
            .check()
            .map_err(|e| ClientError::IllegalState(e.to_string()))?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        provider.attach_sink(events_tx.clone());
        Ok(Arc::new(Self {
            config: Arc::new(config),
            provider,
            channels: Mutex::new(HashMap::new()),
            session: StdMutex::new(None),
            connected: AtomicBool::new(false),
            established: AtomicBool::new(false),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            fixer: StdMutex::new(None),
            data_handler,
            control_handler,
            system_handler,
        }))
    }

    pub(crate) fn config(&self) -> &Arc<config::Configuration> {
        &self.config
    }

    pub(crate) fn provider(&self) -> &Arc<dyn ConfigProvider> {
        &self.provider
    }

    pub(crate) fn system_handler(&self) -> &Arc<dyn SystemEventHandler> {
        &self.system_handler
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn session_state(&self) -> Option<Arc<SessionState>> {
        self.session.lock().unwrap().clone()
    }

    pub fn num_partitions(&self) -> Result<u16, ClientError> {
        self.provider
            .config()
            .map(|config| config.num_partitions())
            .ok_or_else(|| ClientError::IllegalState("no config fetched yet".to_owned()))
    }

    fn partition_state(&self, partition: u16) -> Result<Arc<PartitionState>, ClientError> {
        self.session_state()
            .ok_or_else(|| ClientError::IllegalState("no session; connect() first".to_owned()))?
            .get(partition)
            .ok_or_else(|| ClientError::IllegalState(format!("partition {} out of range", partition)))
    }

    /// Fetch the topology and create (or rearm) the session. Idempotent.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let refresh = self
            .provider
            .refresh(
                self.config.io_timeout(),
                self.config.retry.max_attempt,
                self.config.retry_delay(),
            )
            .await;
        match refresh {
            Ok(config) => {
                self.create_session(&config);
                info!(
                    "Connected to bucket `{}`: {} partitions over {} nodes (rev {})",
                    self.config.bucket,
                    config.num_partitions(),
                    config.nodes.len(),
                    config.rev
                );
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn create_session(&self, config: &BucketConfig) {
        let mut session = self.session.lock().unwrap();
        match session.as_ref() {
            None => {
                *session = Some(Arc::new(SessionState::new(config.num_partitions())));
            }
            Some(existing) => existing.set_connected(),
        }
    }

    /// Start the fixer and open one channel per node that masters primary
    /// partitions. Idempotent.
    pub async fn establish_dcp_connections(self: &Arc<Self>) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::IllegalState(
                "connect() before establishing DCP connections".to_owned(),
            ));
        }
        if self.established.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let config = self
            .provider
            .config()
            .ok_or_else(|| ClientError::IllegalState("no config fetched yet".to_owned()))?;

        let mut events_rx = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ClientError::IllegalState("event queue already in use".to_owned()))?;
        // Events queued by a previous session must not leak into this one.
        while events_rx.try_recv().is_ok() {}
        let mut handle = Fixer::spawn(Arc::downgrade(self), events_rx);
        handle.wait_till_started().await;
        *self.fixer.lock().unwrap() = Some(handle);

        for (index, node) in config.nodes.iter().enumerate() {
            if !config.has_primary_partitions_on(index) {
                continue;
            }
            let address = self.resolve(node)?;
            self.add_channel(address).await?;
        }
        Ok(())
    }

    pub(crate) fn resolve(&self, node: &NodeEndpoint) -> Result<SocketAddr, ClientError> {
        let address = node
            .binary_address(self.config.connection.ssl_enabled)
            .ok_or_else(|| ClientError::BadAddress(node.host.clone()))?;
        address
            .to_socket_addrs()
            .map_err(|_| ClientError::BadAddress(address.clone()))?
            .next()
            .ok_or(ClientError::BadAddress(address))
    }

    /// Get the channel at `address`, creating and connecting it first when
    /// absent. The channels lock is held across the connect, so no two
    /// callers race to create the same channel.
    pub(crate) async fn add_channel(
        self: &Arc<Self>,
        address: SocketAddr,
    ) -> Result<Arc<DcpChannel>, ClientError> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(&address) {
            return Ok(Arc::clone(channel));
        }
        let session = self
            .session_state()
            .ok_or_else(|| ClientError::IllegalState("no session; connect() first".to_owned()))?;
        debug!("Adding DCP channel against {}", address);
        let channel = DcpChannel::new(
            address,
            Arc::clone(&self.config),
            session,
            self.events_tx.clone(),
            Arc::clone(&self.data_handler),
            Arc::clone(&self.control_handler),
            Arc::clone(&self.system_handler),
        );
        channels.insert(address, Arc::clone(&channel));
        match channel.connect().await {
            Ok(()) => Ok(channel),
            Err(e) => {
                channels.remove(&address);
                Err(e)
            }
        }
    }

    pub(crate) async fn remove_channel(&self, address: SocketAddr) -> Option<Arc<DcpChannel>> {
        self.channels.lock().await.remove(&address)
    }

    pub(crate) async fn channel_at(&self, address: SocketAddr) -> Option<Arc<DcpChannel>> {
        self.channels.lock().await.get(&address).cloned()
    }

    pub(crate) async fn channel_addresses(&self) -> Vec<SocketAddr> {
        self.channels.lock().await.keys().copied().collect()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    /// Address of the node currently mastering `partition`, per the latest
    /// observed config.
    pub(crate) fn master_address(&self, partition: u16) -> Result<SocketAddr, ClientError> {
        let config = self
            .provider
            .config()
            .ok_or_else(|| ClientError::IllegalState("no config fetched yet".to_owned()))?;
        let index = config.master_of(partition, false).ok_or_else(|| {
            ClientError::IllegalState(format!("no master for partition {}", partition))
        })?;
        let node = config
            .node_at(index)
            .ok_or_else(|| ClientError::IllegalState(format!("no node at index {}", index)))?;
        self.resolve(node)
    }

    /// The routing primitive: the channel of the node mastering `partition`.
    /// A mapped master without a channel is a programming error.
    pub(crate) async fn master_channel_by_partition(
        &self,
        partition: u16,
    ) -> Result<Arc<DcpChannel>, ClientError> {
        let address = self.master_address(partition)?;
        self.channels
            .lock()
            .await
            .get(&address)
            .cloned()
            .ok_or_else(|| {
                ClientError::IllegalState(format!(
                    "no DCP channel for partition {} at {}",
                    partition, address
                ))
            })
    }

    /// Seed the partition's resume point from `request` and dispatch the
    /// stream-open on the master channel.
    pub async fn start_stream_for_partition(
        &self,
        request: &StreamRequest,
    ) -> Result<(), ClientError> {
        let channel = self.master_channel_by_partition(request.partition).await?;
        let ps = self.partition_state(request.partition)?;
        ps.apply_request(request);
        channel.open_stream(request.partition);
        Ok(())
    }

    /// Close the stream and wait for the server-acknowledged transition to
    /// `Disconnected`. A partition without an open stream is a no-op.
    pub async fn stop_stream_for_partition(&self, partition: u16) -> Result<(), ClientError> {
        let channel = self.master_channel_by_partition(partition).await?;
        if !channel.stream_is_open(partition) {
            return Ok(());
        }
        let ps = self.partition_state(partition)?;
        channel.close_stream(partition).await?;
        ps.wait_for_state(StreamState::Disconnected, self.config.io_timeout())
            .await
    }

    pub async fn stream_is_open(&self, partition: u16) -> Result<bool, ClientError> {
        Ok(self
            .master_channel_by_partition(partition)
            .await?
            .stream_is_open(partition))
    }

    /// Refresh `current_vbucket_seqno` of every partition, waiting until all
    /// answers arrived or the io timeout passes.
    pub async fn get_seqnos(&self) -> Result<(), ClientError> {
        let session = self
            .session_state()
            .ok_or_else(|| ClientError::IllegalState("no session; connect() first".to_owned()))?;
        for ps in session.partitions() {
            ps.current_seq_request();
        }
        {
            let channels = self.channels.lock().await;
            for channel in channels.values() {
                channel.get_seqnos()?;
            }
        }
        for ps in session.partitions() {
            ps.wait_till_current_seq_updated(self.config.io_timeout())
                .await?;
        }
        Ok(())
    }

    /// Fetch the failover log of one partition into its state.
    pub async fn get_failover_log(&self, partition: u16) -> Result<(), ClientError> {
        let ps = self.partition_state(partition)?;
        ps.failover_request();
        let channel = self.master_channel_by_partition(partition).await?;
        channel.get_failover_log(partition)?;
        ps.wait_till_failover_updated(self.config.io_timeout()).await
    }

    /// Tear the whole client down: poison the fixer, unblock every waiter,
    /// close all channels. Safe to call at any time, from anywhere; a
    /// disconnect issued from inside a fixer-invoked callback will not join
    /// the fixer onto itself.
    pub async fn disconnect(self: &Arc<Self>, wait: bool) -> Result<(), ClientError> {
        info!("Conductor.disconnect called");
        if let Some(session) = self.session_state() {
            session.set_disconnected();
        }

        let handle = self.fixer.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = self.events_tx.send(DcpEvent::Poison);
            if wait && !fixer::called_from_fixer() {
                self.reclaim_fixer(handle).await;
            } else {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.reclaim_fixer(handle).await });
            }
        }

        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Instructed to shut down DCP channels");
        let drained: Vec<(SocketAddr, Arc<DcpChannel>)> = {
            let mut channels = self.channels.lock().await;
            channels.drain().collect()
        };
        for (_, channel) in drained {
            channel.disconnect(wait).await;
        }
        self.established.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Await the fixer task and park the event receiver for a future
    /// establish cycle.
    async fn reclaim_fixer(&self, handle: FixerHandle) {
        match handle.join.await {
            Ok(receiver) => {
                *self.events_rx.lock().unwrap() = Some(receiver);
            }
            Err(e) => error!("Fixer task failed: {}", e),
        }
    }

    pub fn fixer_is_running(&self) -> bool {
        self.fixer.lock().unwrap().is_some()
    }
}
