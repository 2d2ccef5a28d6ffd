use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use ganglion::{
    net::{
        frame, AxonRegistry, Endpoint, Error, Hello, NetConfig, NetHandler,
        Origin, Protocol,
    },
    process::ProcessTable,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};

/// Accepts every well-formed origin under the id it claims and records what
/// happens.
struct Recorder {
    messages: mpsc::UnboundedSender<(String, Vec<u8>)>,
    closes: mpsc::UnboundedSender<(String, String)>,
    connects: AtomicUsize,
}

impl NetHandler for Recorder {
    fn check_node(&self, origin: &str) -> Result<String, Error> {
        Ok(origin.parse::<Origin>()?.node_id)
    }

    fn on_connect(&self, _node_id: &str) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message(&self, node_id: &str, msg: Vec<u8>) -> BoxFuture<'_, ()> {
        let _ = self.messages.send((node_id.to_string(), msg));
        async {}.boxed()
    }

    fn on_close(&self, node_id: &str, reason: &Error) {
        let _ = self.closes.send((node_id.to_string(), reason.to_string()));
    }
}

struct Side {
    endpoint: Endpoint,
    recorder: Arc<Recorder>,
    messages: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    closes: mpsc::UnboundedReceiver<(String, String)>,
}

/// Routes the crate's tracing output through the test harness, so a failing
/// test shows what the nodes logged.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn side(config: NetConfig) -> Side {
    init_tracing();
    let (msg_tx, messages) = mpsc::unbounded_channel();
    let (close_tx, closes) = mpsc::unbounded_channel();
    let recorder = Arc::new(Recorder {
        messages: msg_tx,
        closes: close_tx,
        connects: AtomicUsize::new(0),
    });
    let endpoint = Endpoint::new(
        config,
        recorder.clone(),
        Arc::new(AxonRegistry::new()),
        ProcessTable::default(),
    );
    Side {
        endpoint,
        recorder,
        messages,
        closes,
    }
}

fn origin(node_id: &str) -> String {
    Origin::new("tcp://127.0.0.1:1", node_id, "sig").to_string()
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

async fn talk_over(url: &str) {
    let mut server = side(NetConfig::default());
    let mut client = side(NetConfig::default());
    let bound = server.endpoint.listen(url).await.unwrap();
    assert_ne!(bound, url);

    client
        .endpoint
        .connect("srv#1", &bound, &origin("cli#1"))
        .await
        .unwrap();
    // admitted before the acknowledgement went out
    assert!(server.endpoint.axon("cli#1").is_some());
    assert_eq!(client.endpoint.axon("srv#1").unwrap().url(), bound);
    assert_eq!(client.recorder.connects.load(Ordering::SeqCst), 1);

    client.endpoint.send("srv#1", b"hello").await.unwrap();
    assert_eq!(
        next(&mut server.messages).await,
        ("cli#1".to_string(), b"hello".to_vec())
    );
    server.endpoint.send("cli#1", b"world").await.unwrap();
    assert_eq!(
        next(&mut client.messages).await,
        ("srv#1".to_string(), b"world".to_vec())
    );

    client.endpoint.close("srv#1").await.unwrap();
    assert_eq!(next(&mut client.closes).await.0, "srv#1");
    assert_eq!(next(&mut server.closes).await.0, "cli#1");
    assert!(server.endpoint.axon("cli#1").is_none());

    server.endpoint.shutdown().await;
    client.endpoint.shutdown().await;
}

#[tokio::test]
async fn tcp_handshake_and_payloads() {
    talk_over("tcp://127.0.0.1:0").await;
}

#[tokio::test]
async fn quic_handshake_and_payloads() {
    talk_over("quic://127.0.0.1:0").await;
}

#[tokio::test]
async fn ws_handshake_and_payloads() {
    talk_over("ws://127.0.0.1:0/ganglion").await;
}

#[tokio::test]
async fn large_payloads_cross_tcp_in_one_piece() {
    let mut server = side(NetConfig::default());
    let client = side(NetConfig::default());
    let bound = server.endpoint.listen("tcp://127.0.0.1:0").await.unwrap();
    client
        .endpoint
        .connect("srv#1", &bound, &origin("cli#1"))
        .await
        .unwrap();
    let big: Vec<u8> = (0..frame::MAX_PAYLOAD).map(|i| i as u8).collect();
    for _ in 0..3 {
        client.endpoint.send("srv#1", &big).await.unwrap();
    }
    for _ in 0..3 {
        assert_eq!(next(&mut server.messages).await.1, big);
    }
    let too_big = vec![0u8; frame::MAX_PAYLOAD + 1];
    assert!(matches!(
        client.endpoint.send("srv#1", &too_big).await,
        Err(Error::FrameTooLarge(_))
    ));
}

#[tokio::test]
async fn pings_are_answered_and_never_delivered() {
    let mut server = side(NetConfig::default());
    let client = side(NetConfig::default());
    let bound = server.endpoint.listen("tcp://127.0.0.1:0").await.unwrap();
    client
        .endpoint
        .connect("srv#1", &bound, &origin("cli#1"))
        .await
        .unwrap();

    let axon = client.endpoint.axon("srv#1").unwrap();
    axon.ping().await.unwrap();
    assert!(axon.awaiting_pong());
    timeout(Duration::from_secs(5), async {
        while axon.awaiting_pong() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    client.endpoint.send("srv#1", b"after").await.unwrap();
    assert_eq!(next(&mut server.messages).await.1, b"after");
}

#[tokio::test]
async fn concurrent_dials_admit_one_axon() {
    let server = side(NetConfig::default());
    let client = side(NetConfig::default());
    let bound = server.endpoint.listen("tcp://127.0.0.1:0").await.unwrap();
    let origin = origin("cli#1");
    let (a, b) = tokio::join!(
        client.endpoint.connect("srv#1", &bound, &origin),
        client.endpoint.connect("srv#1", &bound, &origin),
    );
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1, "{a:?} {b:?}");
    assert_eq!(client.endpoint.registry().len(), 1);
    assert_eq!(server.endpoint.registry().len(), 1);
    assert_eq!(server.recorder.connects.load(Ordering::SeqCst), 1);

    // same url again is a no-op, another url is refused
    client
        .endpoint
        .connect("srv#1", &bound, &origin)
        .await
        .unwrap();
    assert!(matches!(
        client
            .endpoint
            .connect("srv#1", "tcp://127.0.0.1:1", &origin)
            .await,
        Err(Error::Duplicate(_))
    ));
}

#[tokio::test]
async fn bad_origins_are_not_admitted() {
    let server = side(NetConfig::default());
    let client = side(NetConfig::default());
    let bound = server.endpoint.listen("tcp://127.0.0.1:0").await.unwrap();
    assert!(client
        .endpoint
        .connect("srv#1", &bound, "no origin here")
        .await
        .is_err());
    assert!(server.endpoint.registry().is_empty());
    assert!(client.endpoint.registry().is_empty());
}

#[tokio::test]
async fn garbage_is_dropped_and_the_link_stays_up() {
    let mut server = side(NetConfig::default());
    let bound = server.endpoint.listen("tcp://127.0.0.1:0").await.unwrap();

    let addr = bound.trim_start_matches("tcp://");
    let mut sock = TcpStream::connect(addr).await.unwrap();
    let hello = Hello::new(Protocol::Tcp, origin("noisy#1")).encode().unwrap();
    sock.write_all(&frame::encode(&hello).unwrap()).await.unwrap();
    let mut ack = [0u8; 5];
    sock.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack, frame::HANDSHAKE_ACK);

    sock.write_all(b"garbage!").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    sock.write_all(&frame::encode(b"after").unwrap()).await.unwrap();

    assert_eq!(
        next(&mut server.messages).await,
        ("noisy#1".to_string(), b"after".to_vec())
    );
    assert!(server.endpoint.axon("noisy#1").is_some());
    assert!(server.closes.try_recv().is_err());
}

#[tokio::test]
async fn silent_peers_are_closed_once_by_the_heartbeat() {
    let config = NetConfig::builder()
        .heartbeat_interval(Duration::from_millis(100))
        .idle_threshold(Duration::from_millis(100))
        .build();
    let mut server = side(config);
    let bound = server.endpoint.listen("tcp://127.0.0.1:0").await.unwrap();
    server.endpoint.start_heartbeat();
    server.endpoint.start_heartbeat();

    // a raw client that completes the handshake and then never answers
    let addr = bound.trim_start_matches("tcp://");
    let mut sock = TcpStream::connect(addr).await.unwrap();
    let hello = Hello::new(Protocol::Tcp, origin("mute#1")).encode().unwrap();
    sock.write_all(&frame::encode(&hello).unwrap()).await.unwrap();
    let mut ack = [0u8; 5];
    sock.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack, frame::HANDSHAKE_ACK);

    let (node_id, reason) = next(&mut server.closes).await;
    assert_eq!(node_id, "mute#1");
    assert_eq!(reason, Error::HeartbeatTimeout.to_string());
    assert!(server.endpoint.axon("mute#1").is_none());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(server.closes.try_recv().is_err());
    assert!(server.messages.try_recv().is_err());
}
