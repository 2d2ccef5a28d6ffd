use std::{sync::Arc, time::Duration};

use ganglion::{
    DefaultPipeline, Error, MemoryRegistry, MethodTable, Node, NodeConfig,
    PeerOptions, PeerService, Registry,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    msg: String,
}

impl ganglion::Bean for Ping {}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Pong {
    msg: String,
    hops: u32,
}

struct Echo;

impl PeerService for Echo {
    fn methods(table: &mut MethodTable<Self>) {
        table.call("Ping", |_: &Echo, ping: Ping, pong: &mut Pong| {
            pong.msg = ping.msg;
            pong.hops = 1;
            Ok(())
        });
    }
}

struct Gate;

impl PeerService for Gate {
    fn methods(_: &mut MethodTable<Self>) {}
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());

    let echo = Node::new(
        NodeConfig::builder()
            .name("echo")
            .endpoints(vec!["tcp://127.0.0.1:0".into()])
            .build(),
        Some(registry.clone()),
        Arc::new(DefaultPipeline),
    )?;
    echo.exchange().register(PeerOptions::new("Echo"), Echo)?;
    echo.serve().await?;

    let gate = Node::new(
        NodeConfig::builder()
            .name("gate")
            .endpoints(vec!["tcp://127.0.0.1:0".into()])
            .backends(vec!["echo".into()])
            .scan_interval(Duration::from_millis(200))
            .build(),
        Some(registry),
        Arc::new(DefaultPipeline),
    )?;
    let caller = gate.exchange().register(PeerOptions::new("Gate"), Gate)?;
    gate.serve().await?;

    // backend discovery dials the echo node on its own
    while gate.node_ids("echo").is_empty() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for n in 0..3 {
        let pong: Pong = caller
            .invoke(echo.node_id(), "Echo.Ping", Ping { msg: format!("hello #{n}") })
            .await?;
        info!(msg = %pong.msg, hops = pong.hops, "reply");
    }

    gate.shutdown().await;
    echo.shutdown().await;
    Ok(())
}
