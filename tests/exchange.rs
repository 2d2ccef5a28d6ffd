use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use ganglion::{
    ident,
    peer::{Outcome, PreProc},
    Bean, DefaultPipeline, Dispatch, ExchangeConfig, Invocation, MemoryRegistry,
    MethodTable, Node, NodeConfig, PeerHandle, PeerOptions, PeerService,
    Registry, RpcError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::oneshot, time::timeout};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    msg: String,
}

impl Bean for Ping {}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct Pong {
    msg: String,
}

#[derive(Default)]
struct Echo {
    notes: Arc<AtomicUsize>,
    me: Arc<Mutex<Option<PeerHandle>>>,
}

impl PeerService for Echo {
    fn methods(table: &mut MethodTable<Self>) {
        table
            .call("Ping", |_: &Echo, ping: Ping, pong: &mut Pong| {
                pong.msg = ping.msg;
                Ok(())
            })
            .call("Fail", |_: &Echo, _: Ping, _: &mut Pong| {
                Err("out of pongs".into())
            })
            .event("Note", |echo: &Echo, _: Ping| {
                echo.notes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
    }

    fn attach(&self, handle: PeerHandle) {
        *self.me.lock() = Some(handle);
    }
}

/// Echo without a method table.
struct FastEcho;

impl Dispatch for FastEcho {
    fn dispatch(&self, inv: &mut Invocation) -> Outcome {
        match inv.func() {
            "Ping" => {
                let ping: Ping = inv.args()?;
                Ok(Some(Box::new(Pong { msg: ping.msg })))
            }
            "Fail" => Err(RpcError::Handler("out of pongs".into())),
            _ => Err(RpcError::NoSuchMethod(inv.method())),
        }
    }
}

struct Sleepy;

impl PeerService for Sleepy {
    fn methods(table: &mut MethodTable<Self>) {
        table.call("Nap", |_: &Sleepy, ping: Ping, pong: &mut Pong| {
            std::thread::sleep(Duration::from_millis(800));
            pong.msg = ping.msg;
            Ok(())
        });
    }
}

/// Routes the crate's tracing output through the test harness, so a failing
/// test shows what the nodes logged.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn node(
    name: &str,
    registry: &Arc<MemoryRegistry>,
    tweak: impl FnOnce(NodeConfig) -> NodeConfig,
) -> Node {
    init_tracing();
    let config = NodeConfig::builder()
        .name(name)
        .endpoints(vec!["tcp://127.0.0.1:0".into()])
        .build();
    let registry: Arc<dyn Registry> = registry.clone();
    Node::new(tweak(config), Some(registry), Arc::new(DefaultPipeline)).unwrap()
}

/// A gate and an echo node, served and connected.
async fn linked(
    gate_registry: &Arc<MemoryRegistry>,
    echo: Node,
) -> (Node, PeerHandle) {
    let gate = node("gate", gate_registry, |c| c);
    let caller = gate
        .exchange()
        .register(PeerOptions::new("Gate"), Echo::default())
        .unwrap();
    gate.serve().await.unwrap();
    echo.serve().await.unwrap();
    gate.connect(echo.node_id(), &echo.info().endpoints[0])
        .await
        .unwrap();
    (gate, caller)
}

#[tokio::test]
async fn ping_is_echoed_locally_and_remotely() {
    let registry = Arc::new(MemoryRegistry::new());
    let echo = node("echo", &registry, |c| c);
    let local = echo
        .exchange()
        .register(PeerOptions::new("Echo"), Echo::default())
        .unwrap();
    let (gate, caller) = linked(&registry, echo.clone()).await;
    assert!(echo.endpoint().axon(gate.node_id()).is_some());

    let ping = Ping { msg: "marco".into() };
    let remote: Pong = caller
        .invoke(echo.node_id(), "Echo.Ping", ping.clone())
        .await
        .unwrap();
    let here: Pong = local.invoke_local("Echo.Ping", ping).await.unwrap();
    assert_eq!(remote, Pong { msg: "marco".into() });
    assert_eq!(remote, here);
    assert_eq!(caller.pending_len(), 0);

    let err = caller
        .invoke::<_, Pong>(echo.node_id(), "Echo.Fail", Ping { msg: "x".into() })
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::Remote("out of pongs".into()));
}

#[tokio::test]
async fn calls_flow_both_ways() {
    let registry = Arc::new(MemoryRegistry::new());
    let echo = node("echo", &registry, |c| c);
    let service = Echo::default();
    let me = service.me.clone();
    echo.exchange()
        .register(PeerOptions::new("Echo"), service)
        .unwrap();
    let (gate, _caller) = linked(&registry, echo.clone()).await;

    // the echo peer calls back into the gate peer through its own handle
    let back = me.lock().clone().unwrap();
    assert_eq!(back.name(), "Echo");
    let pong: Pong = back
        .invoke(gate.node_id(), "Gate.Ping", Ping { msg: "polo".into() })
        .await
        .unwrap();
    assert_eq!(pong.msg, "polo");
    assert_eq!(echo.node_ids("gate"), [gate.node_id().to_string()]);
    assert_eq!(gate.node_ids("echo"), [echo.node_id().to_string()]);
}

#[tokio::test]
async fn table_and_hand_written_dispatch_answer_alike() {
    let registry = Arc::new(MemoryRegistry::new());
    let echo = node("echo", &registry, |c| c);
    echo.exchange()
        .register(PeerOptions::new("Table"), Echo::default())
        .unwrap();
    echo.exchange()
        .register_dispatch(PeerOptions::new("Fast"), Arc::new(FastEcho))
        .unwrap();
    let (_gate, caller) = linked(&registry, echo.clone()).await;
    let node = echo.node_id();

    for peer in ["Table", "Fast"] {
        let ping = Ping { msg: peer.into() };
        let pong: Pong = caller
            .invoke(node, &format!("{peer}.Ping"), ping)
            .await
            .unwrap();
        assert_eq!(pong.msg, peer);

        let err = caller
            .invoke::<_, Pong>(node, &format!("{peer}.Fail"), Ping { msg: "x".into() })
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Remote("out of pongs".into()));

        let err = caller
            .invoke::<_, Pong>(node, &format!("{peer}.Nope"), Ping { msg: "x".into() })
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::NoSuchMethod(format!("{peer}.Nope")));
    }
}

#[tokio::test]
async fn events_are_delivered_without_replies() {
    let registry = Arc::new(MemoryRegistry::new());
    let echo = node("echo", &registry, |c| c);
    let service = Echo::default();
    let notes = service.notes.clone();
    echo.exchange()
        .register(PeerOptions::new("Echo"), service)
        .unwrap();
    let (_gate, caller) = linked(&registry, echo.clone()).await;

    for _ in 0..3 {
        caller
            .send_event(echo.node_id(), "Echo.Note", Ping { msg: "n".into() })
            .await
            .unwrap();
    }
    assert_eq!(caller.pending_len(), 0);

    // a call after the events arrives after them on the same axon
    let _: Pong = caller
        .invoke(echo.node_id(), "Echo.Ping", Ping { msg: "sync".into() })
        .await
        .unwrap();
    assert_eq!(notes.load(Ordering::SeqCst), 3);

    let handle = echo.exchange().peer("Echo").unwrap();
    handle
        .send_event(echo.node_id(), "Echo.Note", Ping { msg: "n".into() })
        .await
        .unwrap();
    assert_eq!(notes.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn guests_are_kept_away_from_inner_peers() {
    let gate_registry = Arc::new(MemoryRegistry::new());
    // the echo node cannot vouch for the gate, which becomes a guest
    let echo_registry = Arc::new(MemoryRegistry::new());
    let echo = node("echo", &echo_registry, |mut c| {
        c.is_pub = true;
        c
    });
    let options = PeerOptions::builder().name("Vault").inner_only(true).build();
    echo.exchange().register(options, Echo::default()).unwrap();
    let (gate, caller) = linked(&gate_registry, echo.clone()).await;

    let guests = echo.node_ids(ident::GUEST_PREFIX);
    assert_eq!(guests.len(), 1);
    assert!(guests[0].ends_with(gate.node_id()));

    let err = caller
        .invoke::<_, Pong>(echo.node_id(), "Vault.Ping", Ping { msg: "x".into() })
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::PermissionDenied("Vault.Ping".into()));
}

#[tokio::test]
async fn private_nodes_refuse_strangers() {
    let echo = node("echo", &Arc::new(MemoryRegistry::new()), |c| c);
    echo.serve().await.unwrap();
    let gate = node("gate", &Arc::new(MemoryRegistry::new()), |c| c);
    gate.serve().await.unwrap();
    assert!(gate
        .connect(echo.node_id(), &echo.info().endpoints[0])
        .await
        .is_err());
    assert!(echo.node_ids("gate").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_replies_time_out_once_and_arrive_too_late() {
    let registry = Arc::new(MemoryRegistry::new());
    let echo = node("echo", &registry, |c| c);
    let napper = PeerOptions::builder()
        .name("Sleepy")
        .processor(echo.processes().spawn(8))
        .build();
    echo.exchange().register(napper, Sleepy).unwrap();
    echo.serve().await.unwrap();

    let gate = node("gate", &registry, |mut c| {
        c.exchange = ExchangeConfig::builder()
            .call_timeout(Duration::from_millis(300))
            .sweep_interval(Duration::from_millis(50))
            .build();
        c
    });
    let caller = gate
        .exchange()
        .register(PeerOptions::new("Gate"), Echo::default())
        .unwrap();
    gate.serve().await.unwrap();
    gate.connect(echo.node_id(), &echo.info().endpoints[0])
        .await
        .unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = oneshot::channel();
    let counter = fired.clone();
    caller
        .call(
            echo.node_id(),
            "Sleepy.Nap",
            Ping { msg: "zz".into() },
            move |reply: Result<Pong, RpcError>| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(reply);
            },
        )
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(reply, Err(RpcError::Timeout("Sleepy.Nap".into())));
    assert_eq!(caller.pending_len(), 0);

    // the nap ends and its reply finds nobody waiting
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(caller.pending_len(), 0);
}

#[tokio::test]
async fn pre_proc_sees_every_request() {
    let registry = Arc::new(MemoryRegistry::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook: PreProc = {
        let seen = seen.clone();
        Arc::new(move |node_id: &str, peer: &str, func: &str| {
            seen.lock().push(format!("{peer}.{func}"));
            if func == "Fail" {
                Err(RpcError::PermissionDenied(node_id.to_string()))
            } else {
                Ok(None)
            }
        })
    };
    let echo = node("echo", &registry, |mut c| {
        c.exchange = ExchangeConfig::builder().pre_proc(hook).build();
        c
    });
    echo.exchange()
        .register(PeerOptions::new("Echo"), Echo::default())
        .unwrap();
    let (gate, caller) = linked(&registry, echo.clone()).await;

    let _: Pong = caller
        .invoke(echo.node_id(), "Echo.Ping", Ping { msg: "x".into() })
        .await
        .unwrap();
    let err = caller
        .invoke::<_, Pong>(echo.node_id(), "Echo.Fail", Ping { msg: "x".into() })
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::PermissionDenied(gate.node_id().to_string()));
    assert_eq!(seen.lock().as_slice(), ["Echo.Ping", "Echo.Fail"]);
}

#[tokio::test]
async fn backends_are_discovered_and_dialed() {
    let registry = Arc::new(MemoryRegistry::new());
    let echo = node("echo", &registry, |c| c);
    echo.exchange()
        .register(PeerOptions::new("Echo"), Echo::default())
        .unwrap();
    echo.serve().await.unwrap();

    let gate = node("gate", &registry, |mut c| {
        c.backends = vec!["echo".into()];
        c.scan_interval = Duration::from_millis(50);
        c
    });
    let caller = gate
        .exchange()
        .register(PeerOptions::new("Gate"), Echo::default())
        .unwrap();
    gate.serve().await.unwrap();

    timeout(Duration::from_secs(5), async {
        while gate.node_ids("echo").is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    let pong: Pong = caller
        .invoke(echo.node_id(), "Echo.Ping", Ping { msg: "found".into() })
        .await
        .unwrap();
    assert_eq!(pong.msg, "found");

    gate.shutdown().await;
    timeout(Duration::from_secs(5), async {
        while !echo.node_ids("gate").is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(registry.select("gate").unwrap().len(), 0);
}
