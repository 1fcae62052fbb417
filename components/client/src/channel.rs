//! One TCP session to one node's binary-protocol port.
//!
//! The channel owns stream bookkeeping for the partitions mastered at its
//! node: it runs the connect handshake, correlates request/response pairs
//! through opaques, dispatches inbound stream traffic into partition states
//! and embedder sinks, and reports failures into the repair queue.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use codec::frame::{Frame, HeloFeature, OperationCode, Status};
use log::{debug, error, info, trace, warn};
use model::event::{ControlEvent, DcpEvent, SystemEvent};
use model::message;
use model::stream::StreamEndReason;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use transport::{ChannelReader, ChannelWriter};

use crate::ack::{AckHandle, FlowControlState};
use crate::error::ClientError;
use crate::handlers::{ControlEventHandler, DataEvent, DataEventHandler, DataMessage, SystemEventHandler};
use crate::partition_state::StreamState;
use crate::retry::{RetryPolicy, Verdict};
use crate::session_state::SessionState;

const DESIRED_FEATURES: [HeloFeature; 5] = [
    HeloFeature::DataType,
    HeloFeature::TcpNoDelay,
    HeloFeature::MutationSeqno,
    HeloFeature::Xerror,
    HeloFeature::SelectBucket,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Connection-scoped plumbing, replaced wholesale on every (re)connect.
struct Wiring {
    writer: mpsc::UnboundedSender<Frame>,
    flow: Arc<FlowControlState>,
    cancel: CancellationToken,
}

pub(crate) struct DcpChannel {
    address: SocketAddr,
    config: Arc<config::Configuration>,
    session: Arc<SessionState>,
    events: mpsc::UnboundedSender<DcpEvent>,
    data_handler: Arc<dyn DataEventHandler>,
    control_handler: Arc<dyn ControlEventHandler>,
    system_handler: Arc<dyn SystemEventHandler>,

    state: Mutex<ChannelState>,
    wiring: Mutex<Option<Wiring>>,

    /// In-flight requests, keyed by opaque.
    inflight: Arc<Mutex<HashMap<u32, oneshot::Sender<Frame>>>>,

    /// Partitions with a stream open or pending on this connection.
    opened: Mutex<HashSet<u16>>,

    /// Transient-failure attempts per pending stream request.
    stream_attempts: Mutex<HashMap<u16, u32>>,

    negotiated: Mutex<HashSet<HeloFeature>>,

    opaque: AtomicU32,
    last_frame_at: Mutex<Instant>,
    producer_dropped: AtomicBool,
}

impl DcpChannel {
    pub(crate) fn new(
        address: SocketAddr,
        config: Arc<config::Configuration>,
        session: Arc<SessionState>,
        events: mpsc::UnboundedSender<DcpEvent>,
        data_handler: Arc<dyn DataEventHandler>,
        control_handler: Arc<dyn ControlEventHandler>,
        system_handler: Arc<dyn SystemEventHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            config,
            session,
            events,
            data_handler,
            control_handler,
            system_handler,
            state: Mutex::new(ChannelState::Disconnected),
            wiring: Mutex::new(None),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            opened: Mutex::new(HashSet::new()),
            stream_attempts: Mutex::new(HashMap::new()),
            negotiated: Mutex::new(HashSet::new()),
            opaque: AtomicU32::new(0),
            last_frame_at: Mutex::new(Instant::now()),
            producer_dropped: AtomicBool::new(false),
        })
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ChannelState) {
        let mut current = self.state.lock().unwrap();
        if *current != state {
            trace!(
                "Channel {} state: {:?} --> {:?}",
                self.address,
                *current,
                state
            );
            *current = state;
        }
    }

    pub(crate) fn stream_is_open(&self, partition: u16) -> bool {
        self.opened.lock().unwrap().contains(&partition)
    }

    pub(crate) fn owned_partitions(&self) -> Vec<u16> {
        self.opened.lock().unwrap().iter().copied().collect()
    }

    /// Drop local bookkeeping for a partition whose stream is being moved
    /// elsewhere. Late frames from this node for that partition (data,
    /// snapshot markers, stream-ends) are then ignored.
    pub(crate) fn forget_partition(&self, partition: u16) {
        self.opened.lock().unwrap().remove(&partition);
    }

    /// Features the server accepted during HELO.
    pub(crate) fn negotiated_features(&self) -> HashSet<HeloFeature> {
        self.negotiated.lock().unwrap().clone()
    }

    fn writer(&self) -> Option<mpsc::UnboundedSender<Frame>> {
        self.wiring
            .lock()
            .unwrap()
            .as_ref()
            .map(|w| w.writer.clone())
    }

    fn flow(&self) -> Option<Arc<FlowControlState>> {
        self.wiring
            .lock()
            .unwrap()
            .as_ref()
            .map(|w| Arc::clone(&w.flow))
    }

    fn teardown(&self) {
        if let Some(wiring) = self.wiring.lock().unwrap().take() {
            wiring.cancel.cancel();
        }
    }

    /// Establish the session, retrying transient failures under the
    /// configured policy.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        let policy = RetryPolicy::from_config(&self.config);
        let this = Arc::clone(self);
        policy
            .run(move || {
                let this = Arc::clone(&this);
                async move { this.connect_once().await }
            })
            .await
    }

    async fn connect_once(self: Arc<Self>) -> Result<(), ClientError> {
        self.set_state(ChannelState::Connecting);
        match self.do_connect().await {
            Ok(()) => {
                self.set_state(ChannelState::Connected);
                info!("Channel to {} established", self.address);
                Ok(())
            }
            Err(e) => {
                warn!("Connect attempt to {} failed: {}", self.address, e);
                self.teardown();
                self.set_state(ChannelState::Disconnected);
                Err(e)
            }
        }
    }

    async fn do_connect(self: &Arc<Self>) -> Result<(), ClientError> {
        let address_str = self.address.to_string();
        let stream = timeout(self.config.connect_timeout(), TcpStream::connect(self.address))
            .await
            .map_err(|_| ClientError::ConnectTimeout(address_str.clone()))?
            .map_err(|e| ClientError::ConnectFailure(address_str.clone(), e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let cancel = CancellationToken::new();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let flow = Arc::new(FlowControlState::new(
            self.config.ack_watermark(),
            writer_tx.clone(),
        ));
        *self.wiring.lock().unwrap() = Some(Wiring {
            writer: writer_tx,
            flow,
            cancel: cancel.clone(),
        });
        *self.last_frame_at.lock().unwrap() = Instant::now();
        self.producer_dropped.store(false, Ordering::SeqCst);

        tokio::spawn(Self::write_loop(
            ChannelWriter::new(write_half, &address_str),
            writer_rx,
            cancel.clone(),
        ));
        tokio::spawn(Self::read_loop(
            Arc::clone(self),
            ChannelReader::new(read_half, &address_str),
            cancel.clone(),
        ));

        // SASL PLAIN, when the bucket requires credentials.
        if let Some(credentials) = &self.config.credentials {
            let response = self
                .send_request(message::sasl_auth_plain(
                    &credentials.username,
                    &credentials.password,
                ))
                .await?;
            if response.status() != Status::Success {
                return Err(ClientError::AuthFailed(address_str));
            }
        }

        let response = self
            .send_request(message::select_bucket(&self.config.bucket))
            .await?;
        match response.status() {
            Status::Success => {}
            Status::AuthError => return Err(ClientError::AuthFailed(address_str)),
            _ => return Err(ClientError::BucketNotFound(self.config.bucket.clone())),
        }

        let name = self.config.connection_name(&address_str);
        let response = self
            .send_request(message::helo(&name, &DESIRED_FEATURES))
            .await?;
        let negotiated = message::parse_helo_response(&response);
        debug!("Negotiated features with {}: {:?}", self.address, negotiated);
        *self.negotiated.lock().unwrap() = negotiated.into_iter().collect();

        let response = self.send_request(message::open_connection(&name)).await?;
        if response.status() != Status::Success {
            return Err(ClientError::Protocol(format!(
                "open-connection refused with {}",
                response.status()
            )));
        }

        let controls = [
            (
                "connection_buffer_size",
                self.config.flow_control.connection_buffer_size.to_string(),
            ),
            (
                "enable_noop",
                self.config.flow_control.enable_noop.to_string(),
            ),
            (
                "set_noop_interval",
                self.config.flow_control.noop_interval.to_string(),
            ),
            (
                "send_stream_end_on_client_close_stream",
                "true".to_string(),
            ),
        ];
        for (key, value) in controls {
            let response = self.send_request(message::control(key, &value)).await?;
            if response.status() != Status::Success {
                return Err(ClientError::Protocol(format!(
                    "control `{}` refused with {}",
                    key,
                    response.status()
                )));
            }
        }

        if let Some(interval) = self.config.dead_connection_detection_interval() {
            tokio::spawn(Self::watchdog(Arc::clone(self), cancel, interval));
        }
        Ok(())
    }

    /// Write a request and await its response, bounded by the io timeout.
    async fn send_request(&self, mut frame: Frame) -> Result<Frame, ClientError> {
        let opaque = self.opaque.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        frame.opaque = opaque;

        let (tx, rx) = oneshot::channel();
        self.inflight.lock().unwrap().insert(opaque, tx);

        let writer = match self.writer() {
            Some(writer) => writer,
            None => {
                self.inflight.lock().unwrap().remove(&opaque);
                return Err(ClientError::ChannelClosed(self.address.to_string()));
            }
        };
        let opcode = frame.opcode;
        if writer.send(frame).is_err() {
            self.inflight.lock().unwrap().remove(&opaque);
            return Err(ClientError::ChannelClosed(self.address.to_string()));
        }
        trace!(
            "Wrote request[opcode={}] bound for {} using opaque={}",
            opcode,
            self.address,
            opaque
        );

        match timeout(self.config.io_timeout(), rx).await {
            Err(_) => {
                self.inflight.lock().unwrap().remove(&opaque);
                Err(ClientError::TimedOut)
            }
            Ok(Err(_)) => Err(ClientError::ChannelClosed(self.address.to_string())),
            Ok(Ok(response)) => Ok(response),
        }
    }

    async fn write_loop(
        mut writer: ChannelWriter,
        mut outbound: mpsc::UnboundedReceiver<Frame>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = outbound.recv() => match frame {
                    None => break,
                    Some(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            error!(
                                "Failed to write frame to {}. Cause: {:?}",
                                writer.peer_address(),
                                e
                            );
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        }
        trace!("Write loop for {} completed", writer.peer_address());
    }

    async fn read_loop(
        channel: Arc<DcpChannel>,
        mut reader: ChannelReader,
        cancel: CancellationToken,
    ) {
        trace!("Start read loop for channel {}", channel.address);
        let mut drop_cause: Option<String> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = reader.read_frame() => match res {
                    Ok(Some(frame)) => {
                        *channel.last_frame_at.lock().unwrap() = Instant::now();
                        channel.dispatch(frame);
                    }
                    Ok(None) => {
                        info!("Connection to {} closed by peer", channel.address);
                        drop_cause = Some("connection closed by peer".to_owned());
                        break;
                    }
                    Err(e) => {
                        error!("Read failure on channel {}: {}", channel.address, e);
                        drop_cause = Some(e.to_string());
                        break;
                    }
                }
            }
        }
        cancel.cancel();
        // Dropping the observers unblocks every pending request with a
        // channel-closed error.
        channel.inflight.lock().unwrap().clear();

        if let Some(cause) = drop_cause {
            let was_connected = {
                let mut state = channel.state.lock().unwrap();
                if *state == ChannelState::Connected {
                    *state = ChannelState::Disconnected;
                    true
                } else {
                    false
                }
            };
            if was_connected {
                let _ = channel.events.send(DcpEvent::ChannelDropped {
                    address: channel.address,
                    cause,
                });
            }
        }
        trace!("Read loop for channel {} completed", channel.address);
    }

    async fn watchdog(channel: Arc<DcpChannel>, cancel: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let idle = channel.last_frame_at.lock().unwrap().elapsed();
                    if idle < interval || channel.state() != ChannelState::Connected {
                        continue;
                    }
                    if channel.producer_dropped.swap(true, Ordering::SeqCst) {
                        return;
                    }
                    warn!(
                        "No frames from {} within {:?}; treating producer as dropped",
                        channel.address, interval
                    );
                    channel.teardown();
                    channel.set_state(ChannelState::Disconnected);
                    let _ = channel.events.send(DcpEvent::ChannelDropped {
                        address: channel.address,
                        cause: "dead connection detected".to_owned(),
                    });
                    return;
                }
            }
        }
    }

    /// Per-frame dispatch on the reader task. Must never block on embedder
    /// sinks.
    ///
    /// Stream-request responses are handled inline rather than through the
    /// in-flight map: the server queues the response and the first stream
    /// frames back to back, so the outcome has to land before the mutations
    /// behind it are dispatched.
    fn dispatch(self: &Arc<Self>, frame: Frame) {
        if frame.is_response() {
            if frame.opcode == OperationCode::StreamReq {
                self.on_stream_req_response(frame);
                return;
            }
            let observer = self.inflight.lock().unwrap().remove(&frame.opaque);
            match observer {
                Some(observer) => {
                    let _ = observer.send(frame);
                }
                None => warn!(
                    "Unmatched response from {}: opcode={}, opaque={}",
                    self.address, frame.opcode, frame.opaque
                ),
            }
            return;
        }

        match frame.opcode {
            OperationCode::Mutation | OperationCode::Deletion | OperationCode::Expiration => {
                self.on_data(frame);
            }
            OperationCode::SnapshotMarker => self.on_snapshot_marker(frame),
            OperationCode::StreamEnd => self.on_stream_end(frame),
            OperationCode::Noop => {
                trace!("Answering noop from {}", self.address);
                if let Some(writer) = self.writer() {
                    let _ = writer.send(message::noop_reply(frame.opaque));
                }
            }
            OperationCode::SetVbucketState | OperationCode::Flush => {
                debug!(
                    "Advisory {} from {} for vbucket {}",
                    frame.opcode,
                    self.address,
                    frame.vbucket()
                );
            }
            other => {
                warn!("Unsupported opcode {} from {}", other, self.address);
                let _ = self.events.send(DcpEvent::Fatal {
                    address: Some(self.address),
                    partition: None,
                    cause: format!("unsupported opcode {}", other),
                });
            }
        }
    }

    fn on_data(&self, frame: Frame) {
        let partition = frame.vbucket();
        // A partition migrated away from this node may still have frames in
        // flight on the old socket; they must not touch its state.
        if !self.opened.lock().unwrap().contains(&partition) {
            debug!(
                "Ignoring {} from {} for partition {} not owned here",
                frame.opcode, self.address, partition
            );
            return;
        }
        let wire_bytes = frame.wire_len() as u32;
        let parsed = match frame.opcode {
            OperationCode::Mutation => {
                message::MutationMessage::parse(&frame).map(DataMessage::Mutation)
            }
            OperationCode::Deletion => {
                message::DeletionMessage::parse(&frame).map(DataMessage::Deletion)
            }
            _ => message::DeletionMessage::parse(&frame).map(DataMessage::Expiration),
        };
        let data = match parsed {
            Ok(data) => data,
            Err(e) => {
                warn!("Dropping malformed {} from {}: {}", frame.opcode, self.address, e);
                return;
            }
        };
        let ps = match self.session.get(partition) {
            Some(ps) => ps,
            None => {
                warn!(
                    "Data message from {} for unknown partition {}",
                    self.address, partition
                );
                return;
            }
        };
        ps.advance_seqno(data.by_seqno());
        if let Some(flow) = self.flow() {
            self.data_handler.on_event(DataEvent {
                message: data,
                wire_bytes,
                ack: AckHandle::new(flow),
            });
        }
    }

    fn on_snapshot_marker(&self, frame: Frame) {
        let partition = frame.vbucket();
        if !self.opened.lock().unwrap().contains(&partition) {
            debug!(
                "Ignoring snapshot marker from {} for partition {} not owned here",
                self.address, partition
            );
            return;
        }
        let marker = match message::SnapshotMarkerMessage::parse(&frame) {
            Ok(marker) => marker,
            Err(e) => {
                warn!("Dropping malformed snapshot marker from {}: {}", self.address, e);
                return;
            }
        };
        if let Some(ps) = self.session.get(marker.partition) {
            ps.advance_snapshot(marker.start_seqno, marker.end_seqno);
        }
        self.control_handler.on_event(ControlEvent::SnapshotMarker {
            partition: marker.partition,
            start_seqno: marker.start_seqno,
            end_seqno: marker.end_seqno,
        });
    }

    fn on_stream_end(&self, frame: Frame) {
        let partition = frame.vbucket();
        let reason = match message::parse_stream_end_reason(&frame) {
            Ok(reason) => reason,
            Err(e) => {
                warn!("Dropping malformed stream-end from {}: {}", self.address, e);
                return;
            }
        };
        if !self.opened.lock().unwrap().remove(&partition) {
            debug!(
                "Ignoring stream-end from {} for partition {} not owned here",
                self.address, partition
            );
            return;
        }
        info!(
            "Stream for partition {} ended on {} with reason {:?}",
            partition, self.address, reason
        );
        if let Some(ps) = self.session.get(partition) {
            ps.set_end(reason);
        }
        self.control_handler
            .on_event(ControlEvent::StreamEnd { partition, reason });
        let _ = self.events.send(DcpEvent::StreamEnd { partition, reason });
    }

    /// Dispatch a stream-open for `partition` from its saved resume point.
    ///
    /// The request's opaque is the partition id; the reader task handles the
    /// response inline so success lands before the mutations queued behind
    /// it. Failures surface as events.
    pub(crate) fn open_stream(self: &Arc<Self>, partition: u16) {
        let ps = match self.session.get(partition) {
            Some(ps) => ps,
            None => return,
        };
        ps.set_state(StreamState::Connecting);
        self.opened.lock().unwrap().insert(partition);
        let request = ps.use_stream_request();
        debug!("Opening stream on {}: {}", self.address, request);
        let mut frame = message::stream_request_frame(&request);
        frame.opaque = partition as u32;
        let sent = match self.writer() {
            Some(writer) => writer.send(frame).is_ok(),
            None => false,
        };
        if !sent {
            warn!(
                "Stream request for partition {} could not reach {}; channel is down",
                partition, self.address
            );
            self.opened.lock().unwrap().remove(&partition);
            ps.set_state(StreamState::Disconnected);
            // The connection died underneath the request; repair as a
            // dropped stream once the channel is rebuilt.
            let _ = self.events.send(DcpEvent::StreamEnd {
                partition,
                reason: StreamEndReason::Disconnected,
            });
        }
    }

    /// Outcome of a stream request, on the reader task.
    fn on_stream_req_response(self: &Arc<Self>, response: Frame) {
        let partition = response.opaque as u16;
        let ps = match self.session.get(partition) {
            Some(ps) => ps,
            None => return,
        };
        match response.status() {
            Status::Success => {
                self.stream_attempts.lock().unwrap().remove(&partition);
                match message::parse_failover_log(&response.value) {
                    Ok(log) => {
                        ps.set_failover_log(log.clone());
                        self.control_handler.on_event(ControlEvent::FailoverLogUpdate {
                            partition,
                            failover_log: log,
                        });
                    }
                    Err(e) => {
                        warn!(
                            "Stream for partition {} opened with bad failover log: {}",
                            partition, e
                        );
                    }
                }
                ps.set_state(StreamState::Connected);
            }
            Status::Rollback => {
                let seqno = match message::parse_rollback_seqno(&response) {
                    Ok(seqno) => seqno,
                    Err(e) => {
                        self.fail_stream(partition, &e.to_string());
                        return;
                    }
                };
                info!(
                    "Server rolled partition {} back to seqno {}; reopening",
                    partition, seqno
                );
                ps.rollback(seqno);
                self.system_handler
                    .on_event(SystemEvent::Rollback { partition, seqno });
                self.open_stream(partition);
            }
            Status::NotMyVbucket => {
                info!(
                    "Node {} is not the master of partition {}; rerouting",
                    self.address, partition
                );
                self.opened.lock().unwrap().remove(&partition);
                self.stream_attempts.lock().unwrap().remove(&partition);
                ps.set_state(StreamState::Disconnected);
                let _ = self.events.send(DcpEvent::NotMyVbucket { partition });
            }
            status if status.is_transient() => {
                let attempt = {
                    let mut attempts = self.stream_attempts.lock().unwrap();
                    let attempt = attempts.entry(partition).or_insert(0);
                    *attempt += 1;
                    *attempt
                };
                let policy = RetryPolicy::from_config(&self.config);
                let error = ClientError::ServerStatus {
                    opcode: OperationCode::StreamReq,
                    status,
                };
                match policy.check(attempt, error) {
                    Verdict::Retry(delay) => {
                        debug!(
                            "Transient {} opening partition {}; attempt {} retries in {:?}",
                            status, partition, attempt, delay
                        );
                        let this = Arc::clone(self);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if this.state() == ChannelState::Connected {
                                this.open_stream(partition);
                            }
                        });
                    }
                    Verdict::Abort(error) => {
                        self.fail_stream(partition, &error.to_string());
                    }
                }
            }
            status => {
                error!(
                    "Stream request for partition {} refused with {}",
                    partition, status
                );
                self.fail_stream(partition, &format!("stream request refused with {}", status));
            }
        }
    }

    fn fail_stream(&self, partition: u16, cause: &str) {
        self.opened.lock().unwrap().remove(&partition);
        self.stream_attempts.lock().unwrap().remove(&partition);
        if let Some(ps) = self.session.get(partition) {
            ps.set_state(StreamState::Disconnected);
        }
        let _ = self.events.send(DcpEvent::Fatal {
            address: None,
            partition: Some(partition),
            cause: cause.to_owned(),
        });
    }

    /// Ask the server to end a stream; the STREAM_END flowing back performs
    /// the local bookkeeping.
    pub(crate) async fn close_stream(&self, partition: u16) -> Result<(), ClientError> {
        let response = self.send_request(message::close_stream(partition)).await?;
        match response.status() {
            Status::Success | Status::KeyNotFound => Ok(()),
            status => Err(ClientError::ServerStatus {
                opcode: OperationCode::CloseStream,
                status,
            }),
        }
    }

    /// Fire-and-forget close for a stream being moved to another node.
    pub(crate) fn close_stream_quiet(&self, partition: u16) {
        self.forget_partition(partition);
        if let Some(writer) = self.writer() {
            let mut frame = message::close_stream(partition);
            frame.opaque = self.opaque.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            let _ = writer.send(frame);
        }
    }

    /// Request the high seqno of every vbucket on this node. Responses
    /// update partition states in the background.
    pub(crate) fn get_seqnos(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.writer().is_none() {
            return Err(ClientError::ChannelClosed(self.address.to_string()));
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.send_request(message::get_all_vb_seqnos()).await {
                Ok(response) if response.status() == Status::Success => {
                    match message::parse_seqnos(&response.value) {
                        Ok(pairs) => {
                            for (partition, seqno) in pairs {
                                if let Some(ps) = this.session.get(partition) {
                                    ps.set_current_vbucket_seqno(seqno);
                                }
                            }
                        }
                        Err(e) => warn!("Bad get-seqnos body from {}: {}", this.address, e),
                    }
                }
                Ok(response) => warn!(
                    "get-seqnos refused by {} with {}",
                    this.address,
                    response.status()
                ),
                Err(e) => warn!("get-seqnos against {} failed: {}", this.address, e),
            }
        });
        Ok(())
    }

    /// Request the failover log of one partition. The response updates the
    /// partition state and notifies the control sink in the background.
    pub(crate) fn get_failover_log(self: &Arc<Self>, partition: u16) -> Result<(), ClientError> {
        if self.writer().is_none() {
            return Err(ClientError::ChannelClosed(self.address.to_string()));
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.send_request(message::get_failover_log(partition)).await {
                Ok(response) if response.status() == Status::Success => {
                    match message::parse_failover_log(&response.value) {
                        Ok(log) => {
                            if let Some(ps) = this.session.get(partition) {
                                ps.set_failover_log(log.clone());
                            }
                            this.control_handler.on_event(ControlEvent::FailoverLogUpdate {
                                partition,
                                failover_log: log,
                            });
                        }
                        Err(e) => warn!("Bad failover log from {}: {}", this.address, e),
                    }
                }
                Ok(response) => warn!(
                    "get-failover-log refused by {} with {}",
                    this.address,
                    response.status()
                ),
                Err(e) => warn!("get-failover-log against {} failed: {}", this.address, e),
            }
        });
        Ok(())
    }

    /// Tear the session down.
    ///
    /// A graceful disconnect asks the server to end every open stream first
    /// and waits (bounded) for the acknowledging STREAM_ENDs; an abrupt one
    /// closes the socket and marks owned partitions disconnected directly.
    pub(crate) async fn disconnect(&self, graceful: bool) {
        info!(
            "Disconnecting channel {} (graceful: {})",
            self.address, graceful
        );
        self.set_state(ChannelState::Disconnecting);
        if graceful {
            let partitions = self.owned_partitions();
            for partition in &partitions {
                if let Err(e) = self.close_stream(*partition).await {
                    debug!(
                        "close-stream for partition {} on {} failed during disconnect: {}",
                        partition, self.address, e
                    );
                }
            }
            for partition in &partitions {
                if let Some(ps) = self.session.get(*partition) {
                    let _ = ps
                        .wait_for_state(StreamState::Disconnected, self.config.io_timeout())
                        .await;
                }
            }
        }
        self.teardown();
        self.set_state(ChannelState::Disconnected);
        let leftover: Vec<u16> = {
            let mut opened = self.opened.lock().unwrap();
            let left = opened.iter().copied().collect();
            opened.clear();
            left
        };
        for partition in leftover {
            if let Some(ps) = self.session.get(partition) {
                ps.set_state(StreamState::Disconnected);
            }
        }
    }
}

impl std::fmt::Debug for DcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcpChannel")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("opened", &self.owned_partitions())
            .field("features", &self.negotiated_features())
            .finish()
    }
}
