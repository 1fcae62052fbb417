//! Scripted in-process DCP server for tests.
//!
//! Each instance plays one node: it answers the client handshake, serves
//! per-partition stream scripts (optional one-shot rollback, snapshot plus
//! mutation run, end reason, optional mid-stream connection drop), and keeps
//! counters tests assert against (accepted connections, acknowledged
//! flow-control bytes).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use codec::frame::{Frame, OperationCode, Status};
use log::{debug, info, trace, warn};
use model::message;
use model::stream::FailoverLogEntry;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use transport::{ChannelReader, ChannelWriter};

/// What one partition streams when asked.
#[derive(Debug, Clone)]
pub struct PartitionScript {
    pub failover_log: Vec<FailoverLogEntry>,

    /// Reply to the first stream request with a rollback to this seqno.
    pub rollback_to: Option<u64>,

    /// Fail this many stream requests with TMP_FAIL before accepting one.
    pub tmpfail_times: u32,

    /// Mutations as `(by_seqno, key)` pairs; only seqnos above the requested
    /// start (and at or below the requested end) are delivered.
    pub mutations: Vec<(u64, String)>,

    /// Upper bound of the snapshot marker; defaults to the last mutation.
    pub snapshot_end: Option<u64>,

    /// STREAM_END reason code sent once the run is delivered; `None` keeps
    /// the stream open forever.
    pub end_reason: Option<u32>,

    /// Kill the whole connection right after delivering this seqno, once.
    pub drop_connection_after: Option<u64>,

    /// Answer for GET_ALL_VB_SEQNOS; defaults to the last mutation seqno.
    pub high_seqno: Option<u64>,
}

impl Default for PartitionScript {
    fn default() -> Self {
        Self {
            failover_log: vec![FailoverLogEntry {
                uuid: 0xDEFA,
                seqno: 0,
            }],
            rollback_to: None,
            tmpfail_times: 0,
            mutations: Vec::new(),
            snapshot_end: None,
            end_reason: Some(0),
            drop_connection_after: None,
            high_seqno: None,
        }
    }
}

impl PartitionScript {
    /// `count` mutations with seqnos `1..=count`, ending with OK.
    pub fn counting(count: u64) -> Self {
        Self {
            mutations: (1..=count).map(|seqno| (seqno, format!("key-{}", seqno))).collect(),
            ..Default::default()
        }
    }

    fn last_seqno(&self) -> u64 {
        self.mutations.last().map(|(seqno, _)| *seqno).unwrap_or(0)
    }
}

enum Outbound {
    Frame(Frame),
    /// Flush what is queued, then slam the connection shut.
    Hangup,
}

struct ServerState {
    rollback_served: Mutex<HashSet<u16>>,
    drop_served: Mutex<HashSet<u16>>,
    tmpfail_left: Mutex<HashMap<u16, u32>>,
    acked_bytes: AtomicU64,
    connections: AtomicUsize,
}

pub struct MockDcpServer {
    address: SocketAddr,
    state: Arc<ServerState>,
    cancel: CancellationToken,
}

impl MockDcpServer {
    /// Bind an ephemeral port and serve `scripts` until shut down.
    pub async fn start(scripts: HashMap<u16, PartitionScript>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let tmpfail_left = scripts
            .iter()
            .filter(|(_, script)| script.tmpfail_times > 0)
            .map(|(partition, script)| (*partition, script.tmpfail_times))
            .collect();
        let state = Arc::new(ServerState {
            rollback_served: Mutex::new(HashSet::new()),
            drop_served: Mutex::new(HashSet::new()),
            tmpfail_left: Mutex::new(tmpfail_left),
            acked_bytes: AtomicU64::new(0),
            connections: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let scripts = Arc::new(scripts);

        let accept_state = Arc::clone(&state);
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            info!("Mock DCP server listening on {}", address);
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("Mock server accepted {}", peer);
                            accept_state.connections.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(serve_connection(
                                stream,
                                Arc::clone(&scripts),
                                Arc::clone(&accept_state),
                                accept_cancel.child_token(),
                            ));
                        }
                        Err(e) => {
                            warn!("Mock server accept failed: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            address,
            state,
            cancel,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Total bytes of flow-control credit clients returned.
    pub fn acked_bytes(&self) -> u64 {
        self.state.acked_bytes.load(Ordering::SeqCst)
    }

    /// Connections accepted over the server's lifetime.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MockDcpServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve_connection(
    stream: TcpStream,
    scripts: Arc<HashMap<u16, PartitionScript>>,
    state: Arc<ServerState>,
    cancel: CancellationToken,
) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_owned());
    let (read_half, write_half) = stream.into_split();
    let mut reader = ChannelReader::new(read_half, &peer);
    let mut writer = ChannelWriter::new(write_half, &peer);

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let writer_cancel = cancel.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    if writer.write_frame(&frame).await.is_err() {
                        break;
                    }
                }
                Outbound::Hangup => {
                    debug!("Mock server hanging up on {}", writer.peer_address());
                    break;
                }
            }
        }
        writer_cancel.cancel();
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = reader.read_frame() => match res {
                Ok(Some(frame)) => {
                    if frame.is_request() {
                        handle_request(frame, &tx, &scripts, &state);
                    }
                    // Responses (noop replies) need no action.
                }
                Ok(None) | Err(_) => break,
            }
        }
    }
    cancel.cancel();
    let _ = writer_task.await;
    trace!("Mock server connection to {} finished", peer);
}

fn respond(tx: &mpsc::UnboundedSender<Outbound>, frame: Frame) {
    let _ = tx.send(Outbound::Frame(frame));
}

fn handle_request(
    frame: Frame,
    tx: &mpsc::UnboundedSender<Outbound>,
    scripts: &HashMap<u16, PartitionScript>,
    state: &ServerState,
) {
    match frame.opcode {
        OperationCode::SaslAuth
        | OperationCode::SelectBucket
        | OperationCode::OpenConnection
        | OperationCode::Control => {
            respond(tx, Frame::response(frame.opcode, Status::Success, frame.opaque));
        }
        OperationCode::Helo => {
            // Accept every offered feature by echoing the request body.
            let mut response = Frame::response(frame.opcode, Status::Success, frame.opaque);
            response.value = frame.value.clone();
            respond(tx, response);
        }
        OperationCode::GetFailoverLog => {
            let partition = frame.vbucket();
            match scripts.get(&partition) {
                Some(script) => {
                    let mut response =
                        Frame::response(frame.opcode, Status::Success, frame.opaque);
                    response.value = message::encode_failover_log(&script.failover_log);
                    respond(tx, response);
                }
                None => {
                    respond(
                        tx,
                        Frame::response(frame.opcode, Status::NotMyVbucket, frame.opaque),
                    );
                }
            }
        }
        OperationCode::GetAllVbSeqnos => {
            let mut seqnos: Vec<(u16, u64)> = scripts
                .iter()
                .map(|(partition, script)| {
                    (*partition, script.high_seqno.unwrap_or(script.last_seqno()))
                })
                .collect();
            seqnos.sort_by_key(|(partition, _)| *partition);
            let mut response = Frame::response(frame.opcode, Status::Success, frame.opaque);
            response.value = message::encode_seqnos(&seqnos);
            respond(tx, response);
        }
        OperationCode::StreamReq => serve_stream_request(frame, tx, scripts, state),
        OperationCode::CloseStream => {
            respond(tx, Frame::response(frame.opcode, Status::Success, frame.opaque));
            // With stream-ends on client close enabled, the server follows
            // up with the terminating message.
            respond(tx, message::stream_end_frame(frame.vbucket(), 1));
        }
        OperationCode::BufferAcknowledgement => match message::parse_buffer_ack(&frame) {
            Ok(bytes) => {
                state.acked_bytes.fetch_add(bytes as u64, Ordering::SeqCst);
            }
            Err(e) => warn!("Mock server got a bad buffer-ack: {}", e),
        },
        other => {
            warn!("Mock server has no script for opcode {}", other);
            respond(
                tx,
                Frame::response(other, Status::UnknownCommand, frame.opaque),
            );
        }
    }
}

fn serve_stream_request(
    frame: Frame,
    tx: &mpsc::UnboundedSender<Outbound>,
    scripts: &HashMap<u16, PartitionScript>,
    state: &ServerState,
) {
    let request = match message::parse_stream_request(&frame) {
        Ok(request) => request,
        Err(e) => {
            warn!("Mock server got a bad stream request: {}", e);
            respond(
                tx,
                Frame::response(frame.opcode, Status::Unknown, frame.opaque),
            );
            return;
        }
    };
    let partition = request.partition;
    let script = match scripts.get(&partition) {
        Some(script) => script,
        None => {
            respond(
                tx,
                Frame::response(frame.opcode, Status::NotMyVbucket, frame.opaque),
            );
            return;
        }
    };

    {
        let mut tmpfail = state.tmpfail_left.lock().unwrap();
        if let Some(left) = tmpfail.get_mut(&partition) {
            if *left > 0 {
                *left -= 1;
                respond(
                    tx,
                    Frame::response(frame.opcode, Status::TmpFail, frame.opaque),
                );
                return;
            }
        }
    }

    if let Some(rollback_to) = script.rollback_to {
        if state.rollback_served.lock().unwrap().insert(partition) {
            info!(
                "Mock server rolling partition {} back to {}",
                partition, rollback_to
            );
            let mut response = Frame::response(frame.opcode, Status::Rollback, frame.opaque);
            let mut value = bytes::BytesMut::with_capacity(8);
            bytes::BufMut::put_u64(&mut value, rollback_to);
            response.value = value.freeze();
            respond(tx, response);
            return;
        }
    }

    let mut response = Frame::response(frame.opcode, Status::Success, frame.opaque);
    response.value = message::encode_failover_log(&script.failover_log);
    respond(tx, response);

    // The stream itself: one snapshot covering the remaining run.
    let deliverable: Vec<&(u64, String)> = script
        .mutations
        .iter()
        .filter(|(seqno, _)| *seqno > request.start_seqno && *seqno <= request.end_seqno)
        .collect();
    let snapshot_end = script
        .snapshot_end
        .unwrap_or_else(|| script.last_seqno())
        .max(request.start_seqno);
    respond(
        tx,
        message::snapshot_marker_frame(partition, request.start_seqno, snapshot_end),
    );

    let drop_after = script.drop_connection_after.filter(|_| {
        // The drop fires on the first connection that reaches the seqno.
        !state.drop_served.lock().unwrap().contains(&partition)
    });
    for (seqno, key) in deliverable {
        respond(
            tx,
            message::mutation_frame(partition, *seqno, 1, key.as_bytes(), b"{}"),
        );
        if Some(*seqno) == drop_after {
            state.drop_served.lock().unwrap().insert(partition);
            let _ = tx.send(Outbound::Hangup);
            return;
        }
    }

    if let Some(reason) = script.end_reason {
        respond(tx, message::stream_end_frame(partition, reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::stream::NO_END_SEQNO;
    use std::error::Error;

    async fn request_response(
        reader: &mut ChannelReader,
        writer: &mut ChannelWriter,
        frame: Frame,
    ) -> Result<Frame, Box<dyn Error>> {
        writer.write_frame(&frame).await?;
        Ok(reader.read_frame().await?.expect("response"))
    }

    #[tokio::test]
    async fn test_handshake_and_stream() -> Result<(), Box<dyn Error>> {
        ulog::try_init_log();
        let mut scripts = HashMap::new();
        scripts.insert(0u16, PartitionScript::counting(3));
        let server = MockDcpServer::start(scripts).await?;

        let stream = TcpStream::connect(server.address()).await?;
        let peer = server.address().to_string();
        let (read_half, write_half) = stream.into_split();
        let mut reader = ChannelReader::new(read_half, &peer);
        let mut writer = ChannelWriter::new(write_half, &peer);

        let mut select = message::select_bucket("default");
        select.opaque = 1;
        let response = request_response(&mut reader, &mut writer, select).await?;
        assert_eq!(Status::Success, response.status());

        let mut open = message::open_connection("test:1");
        open.opaque = 2;
        let response = request_response(&mut reader, &mut writer, open).await?;
        assert_eq!(Status::Success, response.status());

        let mut stream_req = message::stream_request_frame(&model::stream::StreamRequest::at(
            0,
            0xDEFA,
            0,
            NO_END_SEQNO,
        ));
        stream_req.opaque = 0;
        writer.write_frame(&stream_req).await?;

        let response = reader.read_frame().await?.expect("stream-req response");
        assert_eq!(OperationCode::StreamReq, response.opcode);
        assert_eq!(Status::Success, response.status());

        let marker = reader.read_frame().await?.expect("snapshot marker");
        assert_eq!(OperationCode::SnapshotMarker, marker.opcode);

        for seqno in 1..=3u64 {
            let mutation = reader.read_frame().await?.expect("mutation");
            let parsed = message::MutationMessage::parse(&mutation)?;
            assert_eq!(seqno, parsed.by_seqno);
        }

        let end = reader.read_frame().await?.expect("stream end");
        assert_eq!(OperationCode::StreamEnd, end.opcode);

        server.shutdown();
        Ok(())
    }
}
