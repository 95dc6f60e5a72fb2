//! End-to-end tests: a real server on a loopback port and real consumers.

use async_trait::async_trait;
use linefeed_connectors::socket::{
    ConnectionState, ConsumerMode, EndReason, SocketConfig, SocketConsumer, StreamServer,
    StreamSummary,
};
use linefeed_core::source::{GeneratorSource, SharedRecords, VecSource};
use linefeed_core::{Error, FlowConfig, Framing, OverflowPolicy, Record, RecordSource, Result};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn local_config() -> SocketConfig {
    SocketConfig::new("127.0.0.1", 0)
}

async fn listen(config: SocketConfig) -> StreamServer {
    StreamServer::listen(config).await.unwrap()
}

fn consumer_config(server: &StreamServer) -> SocketConfig {
    SocketConfig::client("127.0.0.1", server.local_addr().port())
        .with_framing(server.config().framing)
        .with_read_timeout(5_000)
}

fn assert_accounted(summary: &StreamSummary) {
    assert_eq!(
        summary.records_pulled,
        summary.records_sent + summary.records_dropped + summary.records_lost,
        "{:?}",
        summary
    );
}

/// Unbounded source that counts how many records were pulled from it.
struct CountingSource {
    pulled: Arc<AtomicU64>,
    payload: String,
}

#[async_trait]
impl RecordSource for CountingSource {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        let n = self.pulled.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Record::text(format!("{}-{}", n, self.payload))))
    }
}

#[tokio::test]
async fn test_streams_json_records_in_order() {
    let server = listen(local_config()).await;
    let port = server.local_addr().port();

    let reader = tokio::spawn(async move {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        received
    });

    let mut connection = server.accept_one().await.unwrap();
    let mut source = VecSource::new(vec![
        Record::from(json!({"id": 1})),
        Record::from(json!({"id": 2})),
        Record::from(json!({"id": 3})),
    ]);
    let summary = server.stream_all(&mut connection, &mut source).await;

    assert_eq!(summary.records_sent, 3);
    assert_eq!(summary.records_dropped, 0);
    assert_eq!(summary.end, EndReason::SourceExhausted);
    assert!(summary.is_complete());
    assert_eq!(connection.state(), ConnectionState::Closed);

    let received = tokio::time::timeout(TEST_TIMEOUT, reader).await.unwrap().unwrap();
    assert_eq!(received, b"{\"id\":1}\n{\"id\":2}\n{\"id\":3}\n");
    assert_eq!(summary.bytes_sent, received.len() as u64);
}

#[tokio::test]
async fn test_unencodable_record_is_skipped() {
    let server = listen(local_config()).await;
    let config = consumer_config(&server);

    let reader = tokio::spawn(async move {
        let mut consumer = SocketConsumer::connect(&config).await.unwrap();
        consumer.collect(None).await.unwrap()
    });

    let mut connection = server.accept_one().await.unwrap();
    let mut source = VecSource::new(vec![
        Record::from(json!({"id": 1})),
        Record::text("broken\nrecord"),
        Record::from(json!({"id": 3})),
    ]);
    let summary = server.stream_all(&mut connection, &mut source).await;

    assert_eq!(summary.records_sent, 2);
    assert_eq!(summary.records_dropped, 1);
    assert_eq!(summary.end, EndReason::SourceExhausted);
    assert_accounted(&summary);

    let received = reader.await.unwrap();
    assert_eq!(received, vec![Record::text("{\"id\":1}"), Record::text("{\"id\":3}")]);
    assert_eq!(received[1].parse_json::<serde_json::Value>().unwrap(), json!({"id": 3}));
}

#[tokio::test]
async fn test_consumer_disconnect_stops_pulling() {
    let queue_depth = 2;
    let server = listen(
        local_config().with_flow(FlowConfig::default().with_queue_depth(queue_depth)),
    )
    .await;
    let port = server.local_addr().port();

    let reader = tokio::spawn(async move {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        for _ in 0..3 {
            lines.next_line().await.unwrap().unwrap();
        }
        // Dropping the reader closes the socket mid-stream.
    });

    let mut connection = server.accept_one().await.unwrap();
    let pulled = Arc::new(AtomicU64::new(0));
    let mut source = CountingSource {
        pulled: pulled.clone(),
        payload: "x".repeat(512),
    };

    let summary = tokio::time::timeout(TEST_TIMEOUT, server.stream_all(&mut connection, &mut source))
        .await
        .expect("session must end once the consumer is gone");
    reader.await.unwrap();

    assert!(matches!(summary.end, EndReason::ConnectionClosed { .. }), "{:?}", summary.end);
    assert!(summary.records_sent >= 3);
    assert_eq!(summary.records_pulled, pulled.load(Ordering::SeqCst));
    assert_accounted(&summary);
    // Read-ahead past the last accepted write is bounded by the queue.
    assert!(
        summary.records_lost <= queue_depth as u64 + 2,
        "{:?}",
        summary
    );

    // Nothing is pulled once the session has ended.
    let after = pulled.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pulled.load(Ordering::SeqCst), after);
}

#[tokio::test]
async fn test_close_cancels_pending_accept() {
    let server = Arc::new(listen(local_config()).await);
    let handle = server.listen_handle();

    let pending = tokio::spawn({
        let server = server.clone();
        async move { server.accept_one().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closed_at = Instant::now();
    handle.close();
    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("accept_one must not block after close")
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(closed_at.elapsed() < Duration::from_secs(1));

    // Later calls fail the same way.
    assert!(matches!(server.accept_one().await, Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_close_interrupts_blocked_write() {
    // A consumer that never reads, a long stall timeout: only close() can end it.
    let flow = FlowConfig::default()
        .with_queue_depth(4)
        .with_send_timeout(60_000)
        .with_stall_timeout(60_000);
    let server = Arc::new(listen(local_config().with_flow(flow)).await);
    let handle = server.listen_handle();
    let port = server.local_addr().port();

    let _idle = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut connection = server.accept_one().await.unwrap();

    let session = tokio::spawn({
        let server = server.clone();
        async move {
            let mut source = CountingSource {
                pulled: Arc::new(AtomicU64::new(0)),
                payload: "y".repeat(64 * 1024),
            };
            server.stream_all(&mut connection, &mut source).await
        }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.close();

    let summary = tokio::time::timeout(Duration::from_secs(2), session)
        .await
        .expect("in-flight write must fail promptly after close")
        .unwrap();
    assert_eq!(summary.end, EndReason::Cancelled);
    assert!(summary.records_lost > 0);
    assert_accounted(&summary);
}

#[tokio::test]
async fn test_backpressure_stalls_idle_consumer() {
    let flow = FlowConfig::default()
        .with_queue_depth(2)
        .with_send_timeout(100)
        .with_stall_timeout(200);
    let server = listen(local_config().with_flow(flow)).await;
    let port = server.local_addr().port();

    let _idle = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut connection = server.accept_one().await.unwrap();
    let mut source = CountingSource {
        pulled: Arc::new(AtomicU64::new(0)),
        payload: "z".repeat(64 * 1024),
    };

    let summary = tokio::time::timeout(TEST_TIMEOUT, server.stream_all(&mut connection, &mut source))
        .await
        .unwrap();
    assert_eq!(summary.end, EndReason::Stalled);
    assert_eq!(summary.records_dropped, 0);
    assert_accounted(&summary);
}

#[tokio::test]
async fn test_drop_policy_counts_dropped_records() {
    let flow = FlowConfig::default()
        .with_queue_depth(2)
        .with_send_timeout(5)
        .with_overflow(OverflowPolicy::Drop)
        .with_stall_timeout(500);
    let server = listen(local_config().with_flow(flow)).await;
    let port = server.local_addr().port();

    let _idle = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut connection = server.accept_one().await.unwrap();
    let mut source = CountingSource {
        pulled: Arc::new(AtomicU64::new(0)),
        payload: "d".repeat(64 * 1024),
    };

    let summary = tokio::time::timeout(TEST_TIMEOUT, server.stream_all(&mut connection, &mut source))
        .await
        .unwrap();
    assert_eq!(summary.end, EndReason::Stalled);
    assert!(summary.records_dropped > 0, "{:?}", summary);
    assert_accounted(&summary);
}

#[tokio::test]
async fn test_length_prefixed_carries_newlines() {
    let server = listen(local_config().with_framing(Framing::LengthPrefixed)).await;
    let config = consumer_config(&server);

    let reader = tokio::spawn(async move {
        let mut consumer = SocketConsumer::connect(&config).await.unwrap();
        consumer.collect(None).await.unwrap()
    });

    let records = vec![
        Record::text("first line\nsecond line"),
        Record::from(json!({"text": "tweet"})),
        Record::text(""),
    ];
    let mut connection = server.accept_one().await.unwrap();
    let summary = server
        .stream_all(&mut connection, &mut VecSource::new(records))
        .await;
    assert_eq!(summary.records_sent, 3);

    let received = reader.await.unwrap();
    assert_eq!(
        received,
        vec![
            Record::text("first line\nsecond line"),
            Record::text("{\"text\":\"tweet\"}"),
            Record::text(""),
        ]
    );
}

#[tokio::test]
async fn test_record_delay_paces_stream() {
    let server = listen(local_config().with_record_delay(50)).await;
    let config = consumer_config(&server);

    let reader = tokio::spawn(async move {
        let mut consumer = SocketConsumer::connect(&config).await.unwrap();
        consumer.collect(None).await.unwrap()
    });

    let mut connection = server.accept_one().await.unwrap();
    let mut source = GeneratorSource::new("tick", Some(3));
    let summary = server.stream_all(&mut connection, &mut source).await;

    assert_eq!(summary.records_sent, 3);
    assert!(summary.elapsed >= Duration::from_millis(100), "{:?}", summary.elapsed);
    assert_eq!(reader.await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_skipped_records_are_not_paced() {
    let server = listen(local_config().with_record_delay(150)).await;
    let config = consumer_config(&server);

    let reader = tokio::spawn(async move {
        let mut consumer = SocketConsumer::connect(&config).await.unwrap();
        consumer.collect(None).await.unwrap()
    });

    let mut connection = server.accept_one().await.unwrap();
    let mut source = VecSource::new(vec![
        Record::text("first"),
        Record::text("bad\none"),
        Record::text("bad\ntwo"),
        Record::text("bad\nthree"),
        Record::text("second"),
    ]);
    let summary = server.stream_all(&mut connection, &mut source).await;

    assert_eq!(summary.records_sent, 2);
    assert_eq!(summary.records_dropped, 3);
    // One delay between the two records that went out, none for the skipped ones.
    assert!(summary.elapsed >= Duration::from_millis(150), "{:?}", summary.elapsed);
    assert!(summary.elapsed < Duration::from_millis(450), "{:?}", summary.elapsed);
    assert_eq!(
        reader.await.unwrap(),
        vec![Record::text("first"), Record::text("second")]
    );
}

#[tokio::test]
async fn test_closed_connection_cannot_be_streamed_twice() {
    let server = listen(local_config()).await;
    let port = server.local_addr().port();
    let reader = tokio::spawn(async move {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut sink = Vec::new();
        stream.read_to_end(&mut sink).await.unwrap();
    });

    let mut connection = server.accept_one().await.unwrap();
    let first = server
        .stream_all(&mut connection, &mut VecSource::new(vec![Record::text("once")]))
        .await;
    assert!(first.is_complete());
    reader.await.unwrap();

    let mut source = VecSource::new(vec![Record::text("twice")]);
    let second = server.stream_all(&mut connection, &mut source).await;
    assert!(matches!(second.end, EndReason::ConnectionClosed { .. }));
    assert_eq!(second.records_pulled, 0);
    assert_eq!(source.position(), 0);
}

#[tokio::test]
async fn test_serve_single_consumer() {
    let server = listen(local_config()).await;
    let config = consumer_config(&server);

    let records: Vec<Record> = (0..20).map(|i| Record::from(json!({"id": i}))).collect();
    let serve = tokio::spawn(server.serve(Arc::new(SharedRecords::new(records))));

    let mut consumer = SocketConsumer::connect(&config).await.unwrap();
    let received = consumer.collect(None).await.unwrap();
    assert_eq!(received.len(), 20);
    assert_eq!(received[19].parse_json::<serde_json::Value>().unwrap(), json!({"id": 19}));

    let report = tokio::time::timeout(TEST_TIMEOUT, serve).await.unwrap().unwrap().unwrap();
    let last = report.last_session.unwrap();
    assert!(last.is_complete());
    assert_eq!(report.stats.connections_accepted, 1);
    assert_eq!(report.stats.records_sent, 20);
}

#[tokio::test]
async fn test_serve_multi_rejects_beyond_capacity() {
    let config = local_config()
        .with_mode(ConsumerMode::Multi)
        .with_max_connections(1)
        .with_record_delay(20);
    let server = listen(config).await;
    let handle = server.listen_handle();
    let consumer_config = consumer_config(&server);

    let serve = tokio::spawn(server.serve(Arc::new(GeneratorSource::new("tick", None))));

    // First consumer holds the only slot.
    let mut first = SocketConsumer::connect(&consumer_config).await.unwrap();
    assert!(first.next_record().await.unwrap().is_some());

    // Second consumer is closed without receiving anything.
    let mut second = SocketConsumer::connect(&consumer_config).await.unwrap();
    assert!(second.next_record().await.unwrap().is_none());

    // The first session keeps streaming meanwhile.
    assert!(first.next_record().await.unwrap().is_some());

    handle.close();
    let report = tokio::time::timeout(TEST_TIMEOUT, serve).await.unwrap().unwrap().unwrap();
    assert_eq!(report.stats.connections_accepted, 2);
    assert_eq!(report.stats.connections_rejected, 1);
    assert_eq!(report.stats.sessions_completed, 1);
    assert_eq!(report.last_session.unwrap().end, EndReason::Cancelled);
}

#[tokio::test]
async fn test_serve_multi_gives_each_consumer_its_own_cursor() {
    let config = local_config()
        .with_mode(ConsumerMode::Multi)
        .with_max_connections(4);
    let server = listen(config).await;
    let handle = server.listen_handle();
    let consumer_config = consumer_config(&server);

    let records: Vec<Record> = (0..5).map(|i| Record::text(format!("row-{}", i))).collect();
    let serve = tokio::spawn(server.serve(Arc::new(SharedRecords::new(records.clone()))));

    for _ in 0..3 {
        let mut consumer = SocketConsumer::connect(&consumer_config).await.unwrap();
        assert_eq!(consumer.collect(None).await.unwrap(), records);
    }

    handle.close();
    let report = tokio::time::timeout(TEST_TIMEOUT, serve).await.unwrap().unwrap().unwrap();
    assert_eq!(report.stats.sessions_completed, 3);
    assert_eq!(report.stats.records_sent, 15);
}
