//! End-to-end scenarios against the scripted mock server: stream delivery,
//! rollback, connection drops, topology changes, retry exhaustion, and
//! shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dcp_client::{
    ClientError, Conductor, ConfigProvider, ControlEventHandler, DataEvent, DataEventHandler,
    Delay, FixedConfigProvider, RetryPolicy, StreamState, SystemEventHandler,
};
use mock_server::{MockDcpServer, PartitionScript};
use model::bucket::{BucketConfig, NodeEndpoint};
use model::event::{ControlEvent, SystemEvent};
use model::stream::{StreamRequest, NO_END_SEQNO};

#[derive(Default)]
struct Recorder {
    data: Mutex<Vec<(u16, u64)>>,
    control: Mutex<Vec<ControlEvent>>,
    system: Mutex<Vec<SystemEvent>>,
}

impl Recorder {
    fn seqnos_of(&self, partition: u16) -> Vec<u64> {
        self.data
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, seqno)| *seqno)
            .collect()
    }

    fn rollbacks(&self) -> Vec<(u16, u64)> {
        self.system
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                SystemEvent::Rollback { partition, seqno } => Some((*partition, *seqno)),
                _ => None,
            })
            .collect()
    }
}

impl DataEventHandler for Recorder {
    fn on_event(&self, event: DataEvent) {
        self.data
            .lock()
            .unwrap()
            .push((event.message.partition(), event.message.by_seqno()));
        event.ack.ack(event.wire_bytes);
    }
}

impl ControlEventHandler for Recorder {
    fn on_event(&self, event: ControlEvent) {
        self.control.lock().unwrap().push(event);
    }
}

impl SystemEventHandler for Recorder {
    fn on_event(&self, event: SystemEvent) {
        self.system.lock().unwrap().push(event);
    }
}

fn test_config() -> config::Configuration {
    let mut config = config::Configuration::default();
    config.connection.connect_timeout = 5;
    config.connection.io_timeout = 5;
    config.retry.delay_millis = 20;
    config.retry.delay_cap_millis = 100;
    config
}

fn bucket(rev: u64, ports: &[u16], map: &[i16]) -> BucketConfig {
    BucketConfig {
        rev,
        nodes: ports
            .iter()
            .map(|port| NodeEndpoint::new("127.0.0.1", *port))
            .collect(),
        vbucket_map: map.to_vec(),
        fast_forward_map: None,
    }
}

fn client(
    config: config::Configuration,
    provider: Arc<dyn ConfigProvider>,
) -> (Arc<Conductor>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let conductor = Conductor::new(
        config,
        provider,
        Arc::clone(&recorder) as Arc<dyn DataEventHandler>,
        Arc::clone(&recorder) as Arc<dyn ControlEventHandler>,
        Arc::clone(&recorder) as Arc<dyn SystemEventHandler>,
    )
    .expect("conductor");
    (conductor, recorder)
}

async fn wait_for<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn assert_gapless(mut seqnos: Vec<u64>, from: u64, to: u64) {
    seqnos.sort_unstable();
    seqnos.dedup();
    let expected: Vec<u64> = (from..=to).collect();
    assert_eq!(expected, seqnos, "delivery must cover {}..={} without gaps", from, to);
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_single_partition() {
    ulog::try_init_log();
    let mut scripts = HashMap::new();
    scripts.insert(0u16, PartitionScript::counting(100));
    let server = MockDcpServer::start(scripts).await.unwrap();

    // A small buffer keeps the ack watermark low enough for this run to
    // cross it several times.
    let mut config = test_config();
    config.flow_control.connection_buffer_size = 512;

    let provider = Arc::new(FixedConfigProvider::new(bucket(1, &[server.port()], &[0])));
    let (conductor, recorder) = client(config, provider);

    conductor.connect().await.unwrap();
    conductor.establish_dcp_connections().await.unwrap();
    assert_eq!(1, conductor.channel_count().await);

    conductor
        .start_stream_for_partition(&StreamRequest {
            partition: 0,
            vbucket_uuid: 0xDEFA,
            start_seqno: 0,
            end_seqno: 100,
            snapshot_start_seqno: 0,
            snapshot_end_seqno: 0,
        })
        .await
        .unwrap();

    let session = conductor.session_state().unwrap();
    let ps = session.get(0).unwrap();
    ps.wait_for_state(StreamState::Disconnected, Duration::from_secs(10))
        .await
        .unwrap();

    let seqnos = recorder.seqnos_of(0);
    assert_eq!(100, seqnos.len());
    assert!(
        seqnos.windows(2).all(|pair| pair[0] < pair[1]),
        "per-partition delivery must be strictly increasing"
    );
    assert_eq!(100, ps.start_seqno());
    assert_eq!(
        Some(model::stream::StreamEndReason::Ok),
        ps.end_reason()
    );
    wait_for("buffer acks to reach the server", || server.acked_bytes() > 0).await;

    conductor.disconnect(true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rollback_rewinds_and_reopens() {
    ulog::try_init_log();
    let mut scripts = HashMap::new();
    scripts.insert(
        0u16,
        PartitionScript {
            rollback_to: Some(30),
            mutations: (31..=60).map(|seqno| (seqno, format!("key-{}", seqno))).collect(),
            ..Default::default()
        },
    );
    let server = MockDcpServer::start(scripts).await.unwrap();
    let provider = Arc::new(FixedConfigProvider::new(bucket(1, &[server.port()], &[0])));
    let (conductor, recorder) = client(test_config(), provider);

    conductor.connect().await.unwrap();
    conductor.establish_dcp_connections().await.unwrap();
    conductor
        .start_stream_for_partition(&StreamRequest {
            partition: 0,
            vbucket_uuid: 0xBAD,
            start_seqno: 50,
            end_seqno: NO_END_SEQNO,
            snapshot_start_seqno: 50,
            snapshot_end_seqno: 50,
        })
        .await
        .unwrap();

    let session = conductor.session_state().unwrap();
    let ps = session.get(0).unwrap();
    ps.wait_for_state(StreamState::Disconnected, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(vec![(0, 30)], recorder.rollbacks());
    let seqnos = recorder.seqnos_of(0);
    assert_eq!(Some(&31), seqnos.first(), "delivery resumes past the rollback point");
    assert_gapless(seqnos, 31, 60);
    assert_eq!(60, ps.start_seqno());

    conductor.disconnect(true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_drop_resumes_without_gaps() {
    ulog::try_init_log();
    let mut scripts = HashMap::new();
    scripts.insert(
        0u16,
        PartitionScript {
            drop_connection_after: Some(42),
            ..PartitionScript::counting(100)
        },
    );
    let server = MockDcpServer::start(scripts).await.unwrap();
    let provider = Arc::new(FixedConfigProvider::new(bucket(1, &[server.port()], &[0])));
    let (conductor, recorder) = client(test_config(), provider);

    conductor.connect().await.unwrap();
    conductor.establish_dcp_connections().await.unwrap();
    conductor
        .start_stream_for_partition(&StreamRequest::at(0, 0xDEFA, 0, NO_END_SEQNO))
        .await
        .unwrap();

    let session = conductor.session_state().unwrap();
    let ps = session.get(0).unwrap();
    // The partition dips through `Disconnected` while the fixer repairs, so
    // wait on delivery completing rather than on the state alone.
    wait_for("the stream to recover and finish", || {
        recorder.seqnos_of(0).iter().max() == Some(&100)
            && ps.state() == StreamState::Disconnected
    })
    .await;

    assert!(
        server.connections() >= 2,
        "the fixer must have reconnected after the drop"
    );
    assert!(
        recorder
            .system
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, SystemEvent::ChannelDropped { .. })),
        "the drop must surface as a system event"
    );
    assert_gapless(recorder.seqnos_of(0), 1, 100);
    assert_eq!(100, ps.start_seqno());

    conductor.disconnect(true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn topology_change_migrates_stream() {
    ulog::try_init_log();
    let mut scripts_a = HashMap::new();
    scripts_a.insert(
        0u16,
        PartitionScript {
            mutations: (1..=30).map(|seqno| (seqno, format!("key-{}", seqno))).collect(),
            end_reason: None,
            ..Default::default()
        },
    );
    let server_a = MockDcpServer::start(scripts_a).await.unwrap();

    let mut scripts_b = HashMap::new();
    scripts_b.insert(0u16, PartitionScript::counting(60));
    let server_b = MockDcpServer::start(scripts_b).await.unwrap();

    let ports = [server_a.port(), server_b.port()];
    let provider = Arc::new(FixedConfigProvider::new(bucket(1, &ports, &[0])));
    let (conductor, recorder) = client(test_config(), Arc::clone(&provider) as Arc<dyn ConfigProvider>);

    conductor.connect().await.unwrap();
    conductor.establish_dcp_connections().await.unwrap();
    assert_eq!(
        1,
        conductor.channel_count().await,
        "only the node with primaries gets a channel"
    );

    conductor
        .start_stream_for_partition(&StreamRequest::at(0, 0xDEFA, 0, NO_END_SEQNO))
        .await
        .unwrap();
    wait_for("the stream to progress on node A", || {
        recorder.seqnos_of(0).len() >= 30
    })
    .await;

    // Partition 0 moves to node B.
    provider.update(bucket(2, &ports, &[1]));

    let session = conductor.session_state().unwrap();
    let ps = session.get(0).unwrap();
    ps.wait_for_state(StreamState::Disconnected, Duration::from_secs(10))
        .await
        .unwrap();

    assert!(
        server_b.connections() >= 1,
        "a channel to the new master must exist"
    );
    assert_gapless(recorder.seqnos_of(0), 1, 60);
    assert!(
        recorder
            .system
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, SystemEvent::TopologyUpdated { rev: 2 })),
        "the new revision must surface as a system event"
    );

    conductor.disconnect(true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn migration_races_in_flight_mutations() {
    ulog::try_init_log();
    // Node A streams a long run of fat mutations so plenty of frames are
    // still in flight on its socket when the partition migrates away.
    let pad = "x".repeat(250);
    let mut scripts_a = HashMap::new();
    scripts_a.insert(
        0u16,
        PartitionScript {
            mutations: (1..=10_000)
                .map(|seqno| (seqno, format!("key-{}-{}", seqno, pad)))
                .collect(),
            end_reason: None,
            ..Default::default()
        },
    );
    let server_a = MockDcpServer::start(scripts_a).await.unwrap();

    let mut scripts_b = HashMap::new();
    scripts_b.insert(0u16, PartitionScript::counting(10_000));
    let server_b = MockDcpServer::start(scripts_b).await.unwrap();

    let ports = [server_a.port(), server_b.port()];
    let provider = Arc::new(FixedConfigProvider::new(bucket(1, &ports, &[0])));
    let (conductor, recorder) = client(test_config(), Arc::clone(&provider) as Arc<dyn ConfigProvider>);

    conductor.connect().await.unwrap();
    conductor.establish_dcp_connections().await.unwrap();
    conductor
        .start_stream_for_partition(&StreamRequest::at(0, 0xDEFA, 0, NO_END_SEQNO))
        .await
        .unwrap();

    // Migrate as soon as delivery has started; node A's remaining frames
    // race the stream now opening on node B and must be discarded, not
    // applied to the partition state.
    wait_for("first deliveries from node A", || {
        recorder.seqnos_of(0).len() >= 50
    })
    .await;
    provider.update(bucket(2, &ports, &[1]));

    let session = conductor.session_state().unwrap();
    let ps = session.get(0).unwrap();
    wait_for("the migrated stream to finish on node B", || {
        recorder.seqnos_of(0).iter().max() == Some(&10_000)
            && ps.state() == StreamState::Disconnected
    })
    .await;

    assert!(server_b.connections() >= 1);
    assert_gapless(recorder.seqnos_of(0), 1, 10_000);
    assert_eq!(10_000, ps.start_seqno());

    conductor.disconnect(true).await.unwrap();
}

struct FailingProvider {
    attempts_seen: AtomicU32,
}

#[async_trait]
impl ConfigProvider for FailingProvider {
    async fn refresh(
        &self,
        _timeout: Duration,
        attempts: u32,
        wait_between: Duration,
    ) -> Result<Arc<BucketConfig>, ClientError> {
        let policy = RetryPolicy::new(attempts, Delay::Fixed(wait_between));
        policy
            .run(|| async {
                self.attempts_seen.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::ConnectFailure(
                    "config-endpoint".to_owned(),
                    "connection refused".to_owned(),
                ))
            })
            .await
    }

    fn config(&self) -> Option<Arc<BucketConfig>> {
        None
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_exhaustion_fails_connect() {
    ulog::try_init_log();
    let provider = Arc::new(FailingProvider {
        attempts_seen: AtomicU32::new(0),
    });
    let (conductor, _recorder) = client(test_config(), Arc::clone(&provider) as Arc<dyn ConfigProvider>);

    match conductor.connect().await {
        Err(ClientError::CannotRetry { attempts, .. }) => assert_eq!(3, attempts),
        other => panic!("expected CannotRetry, got {:?}", other),
    }
    assert!(!conductor.is_connected());
    assert_eq!(0, conductor.channel_count().await);
    assert!(!conductor.fixer_is_running());
    assert_eq!(4, provider.attempts_seen.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_shutdown_unblocks_waiters() {
    ulog::try_init_log();
    let mut scripts = HashMap::new();
    scripts.insert(
        0u16,
        PartitionScript {
            mutations: (1..=10).map(|seqno| (seqno, format!("key-{}", seqno))).collect(),
            end_reason: None,
            ..Default::default()
        },
    );
    scripts.insert(1u16, PartitionScript::default());
    let server = MockDcpServer::start(scripts).await.unwrap();
    let provider = Arc::new(FixedConfigProvider::new(bucket(1, &[server.port()], &[0, 0])));
    let (conductor, recorder) = client(test_config(), provider);

    conductor.connect().await.unwrap();
    conductor.establish_dcp_connections().await.unwrap();
    conductor
        .start_stream_for_partition(&StreamRequest::at(0, 0xDEFA, 0, NO_END_SEQNO))
        .await
        .unwrap();
    wait_for("the stream to deliver", || !recorder.seqnos_of(0).is_empty()).await;

    // Park a waiter on a partition that never connects; disconnect must
    // fail it with SessionDisconnected rather than letting it time out.
    let session = conductor.session_state().unwrap();
    let parked = session.get(1).unwrap();
    let waiter = tokio::spawn(async move {
        parked
            .wait_for_state(StreamState::Connected, Duration::from_secs(30))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    conductor.disconnect(true).await.unwrap();

    match waiter.await.unwrap() {
        Err(ClientError::SessionDisconnected) => {}
        other => panic!("expected SessionDisconnected, got {:?}", other),
    }
    assert_eq!(0, conductor.channel_count().await);
    assert!(!conductor.is_connected());
    assert!(!conductor.fixer_is_running());
    for ps in session.partitions() {
        assert_eq!(StreamState::Disconnected, ps.state());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_stream_open_retries() {
    ulog::try_init_log();
    let mut scripts = HashMap::new();
    scripts.insert(
        0u16,
        PartitionScript {
            tmpfail_times: 2,
            ..PartitionScript::counting(5)
        },
    );
    let server = MockDcpServer::start(scripts).await.unwrap();
    let provider = Arc::new(FixedConfigProvider::new(bucket(1, &[server.port()], &[0])));
    let (conductor, recorder) = client(test_config(), provider);

    conductor.connect().await.unwrap();
    conductor.establish_dcp_connections().await.unwrap();
    conductor
        .start_stream_for_partition(&StreamRequest::at(0, 0xDEFA, 0, NO_END_SEQNO))
        .await
        .unwrap();

    let session = conductor.session_state().unwrap();
    let ps = session.get(0).unwrap();
    ps.wait_for_state(StreamState::Disconnected, Duration::from_secs(10))
        .await
        .unwrap();
    assert_gapless(recorder.seqnos_of(0), 1, 5);

    conductor.disconnect(true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn queries_update_partition_state() {
    ulog::try_init_log();
    let mut scripts = HashMap::new();
    scripts.insert(
        0u16,
        PartitionScript {
            high_seqno: Some(120),
            ..PartitionScript::counting(5)
        },
    );
    let server = MockDcpServer::start(scripts).await.unwrap();
    let provider = Arc::new(FixedConfigProvider::new(bucket(1, &[server.port()], &[0])));
    let (conductor, _recorder) = client(test_config(), provider);

    conductor.connect().await.unwrap();
    conductor.establish_dcp_connections().await.unwrap();

    conductor.get_seqnos().await.unwrap();
    let session = conductor.session_state().unwrap();
    let ps = session.get(0).unwrap();
    assert_eq!(120, ps.current_vbucket_seqno());

    conductor.get_failover_log(0).await.unwrap();
    let log = ps.failover_log();
    assert_eq!(1, log.len());
    assert_eq!(0xDEFA, log[0].uuid);

    conductor.disconnect(true).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_connection_detection_reconnects() {
    ulog::try_init_log();
    // A stream that never sends anything: only the watchdog can notice the
    // peer is gone.
    let mut scripts = HashMap::new();
    scripts.insert(
        0u16,
        PartitionScript {
            mutations: Vec::new(),
            end_reason: None,
            ..Default::default()
        },
    );
    let server = MockDcpServer::start(scripts).await.unwrap();

    let mut config = test_config();
    config.connection.dead_connection_detection_interval = 1;

    let provider = Arc::new(FixedConfigProvider::new(bucket(1, &[server.port()], &[0])));
    let (conductor, recorder) = client(config, provider);

    conductor.connect().await.unwrap();
    conductor.establish_dcp_connections().await.unwrap();
    conductor
        .start_stream_for_partition(&StreamRequest::at(0, 0xDEFA, 0, NO_END_SEQNO))
        .await
        .unwrap();

    wait_for("the watchdog to flag the silent peer", || {
        recorder
            .system
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, SystemEvent::ChannelDropped { .. }))
    })
    .await;
    wait_for("the fixer to reconnect", || server.connections() >= 2).await;

    conductor.disconnect(true).await.unwrap();
    assert_eq!(0, conductor.channel_count().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_and_disconnect_are_idempotent() {
    ulog::try_init_log();
    let mut scripts = HashMap::new();
    scripts.insert(0u16, PartitionScript::counting(1));
    let server = MockDcpServer::start(scripts).await.unwrap();
    let provider = Arc::new(FixedConfigProvider::new(bucket(1, &[server.port()], &[0])));
    let (conductor, _recorder) = client(test_config(), provider);

    // Disconnecting a client that never connected is a no-op.
    conductor.disconnect(true).await.unwrap();

    conductor.connect().await.unwrap();
    conductor.connect().await.unwrap();
    conductor.establish_dcp_connections().await.unwrap();
    conductor.establish_dcp_connections().await.unwrap();
    assert_eq!(1, conductor.channel_count().await);

    conductor.disconnect(true).await.unwrap();
    conductor.disconnect(true).await.unwrap();
    assert!(!conductor.is_connected());
}
