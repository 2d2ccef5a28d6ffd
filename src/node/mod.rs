//! A node: one process hosting peers, wired to the network.
//!
//! [`Node`] owns the scheduling units, the endpoint and the exchange and
//! connects them. Incoming payloads go to the exchange; dialers are verified
//! against the [`Registry`] before they are admitted; nodes of the configured
//! backend services are dialed as soon as the registry lists them.

use std::sync::{Arc, Weak};

use futures::{future::BoxFuture, FutureExt};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

mod config;
mod registry;

pub use config::{NodeConfig, NodeInfo};
pub use registry::{MemoryRegistry, Registry};

use crate::{
    error::{Error, ErrorSink},
    ident,
    net::{self, AxonRegistry, Endpoint, NetHandler, Origin},
    peer::{Exchange, Transport},
    process::{Plan, ProcessTable, Scheduler},
};

/// Host callbacks for connection events and errors nobody waits for.
pub trait Pipeline: Send + Sync + 'static {
    fn on_connect(&self, node_id: &str) {
        info!(node_id, "connected");
    }

    fn on_close(&self, node_id: &str, reason: &net::Error) {
        info!(node_id, %reason, "disconnected");
    }

    fn on_error(&self, err: Error) {
        error!("{}", err);
    }
}

/// Logs every event and does nothing else.
pub struct DefaultPipeline;

impl Pipeline for DefaultPipeline {}

struct NodeInner {
    node_id: String,
    config: NodeConfig,
    info: RwLock<NodeInfo>,
    registry: Option<Arc<dyn Registry>>,
    pipeline: Arc<dyn Pipeline>,
    processes: ProcessTable,
    endpoint: Endpoint,
    exchange: Exchange,
    scanner: Mutex<Option<Scheduler>>,
}

/// Can be cloned to obtain another handle to the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

/// Hands endpoint events to the node without keeping it alive.
struct Handler {
    node: Weak<NodeInner>,
}

impl Handler {
    fn node(&self) -> Option<Node> {
        self.node.upgrade().map(|inner| Node { inner })
    }
}

impl NetHandler for Handler {
    fn check_node(&self, origin: &str) -> Result<String, net::Error> {
        match self.node() {
            Some(node) => node.check_node(origin),
            None => Err(net::Error::Closed),
        }
    }

    fn on_connect(&self, node_id: &str) {
        if let Some(node) = self.node() {
            node.inner.pipeline.on_connect(node_id);
        }
    }

    fn on_message(&self, node_id: &str, msg: Vec<u8>) -> BoxFuture<'_, ()> {
        let node_id = node_id.to_string();
        async move {
            if let Some(node) = self.node() {
                node.inner.exchange.on_exchange(&node_id, msg).await;
            }
        }
        .boxed()
    }

    fn on_close(&self, node_id: &str, reason: &net::Error) {
        if let Some(node) = self.node() {
            node.inner.pipeline.on_close(node_id, reason);
        }
    }

    fn on_error(&self, err: net::Error) {
        if let Some(node) = self.node() {
            node.inner.pipeline.on_error(err.into());
        }
    }
}

impl Node {
    /// Builds a node with a fresh identity. Nothing is bound until
    /// [`Node::serve`].
    pub fn new(
        config: NodeConfig,
        registry: Option<Arc<dyn Registry>>,
        pipeline: Arc<dyn Pipeline>,
    ) -> Result<Self, Error> {
        if config.name.is_empty() || config.name.contains('#') {
            Err(Error::Config(format!("bad node name {:?}", config.name)))?
        }
        if config.endpoints.is_empty() {
            Err(Error::Config("a node needs at least one endpoint".into()))?
        }
        let node_id = match &config.node_id {
            Some(id) => ident::qualify(&config.name, id),
            None => ident::mint(&config.name),
        };
        let sig = ident::signature(&node_id, &config.name);
        let sink = {
            let pipeline = pipeline.clone();
            ErrorSink::new(move |err| pipeline.on_error(err))
        };
        let processes = ProcessTable::new(sink);
        let axons = Arc::new(AxonRegistry::new());
        let inner = Arc::new_cyclic(|weak: &Weak<NodeInner>| {
            let handler = Arc::new(Handler { node: weak.clone() });
            let endpoint = Endpoint::new(
                config.net.clone(),
                handler,
                axons.clone(),
                processes.clone(),
            );
            let transport: Arc<dyn Transport> = axons;
            let exchange = Exchange::new(
                node_id.clone(),
                config.exchange.clone(),
                transport,
                processes.clone(),
            );
            NodeInner {
                info: RwLock::new(NodeInfo::new(node_id.clone(), sig, &config)),
                node_id,
                config,
                registry,
                pipeline,
                processes,
                endpoint,
                exchange,
                scanner: Mutex::new(None),
            }
        });
        Ok(Self { inner })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn info(&self) -> NodeInfo {
        self.inner.info.read().clone()
    }

    pub fn exchange(&self) -> &Exchange {
        &self.inner.exchange
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.inner.processes
    }

    /// Listens on every endpoint, advertises the bound urls and starts the
    /// heartbeat, the call sweeper and backend discovery.
    pub async fn serve(&self) -> Result<(), Error> {
        let mut bound = Vec::with_capacity(self.inner.config.endpoints.len());
        for url in &self.inner.config.endpoints {
            bound.push(self.inner.endpoint.listen(url).await?);
        }
        self.inner.info.write().endpoints = bound.clone();
        if let Some(registry) = &self.inner.registry {
            registry.register(&self.info())?;
        }
        self.inner.endpoint.start_heartbeat();
        self.inner.exchange.start_sweeper();
        self.start_scanning();
        info!(node_id = %self.inner.node_id, endpoints = ?bound, "node serving");
        Ok(())
    }

    fn start_scanning(&self) {
        if self.inner.registry.is_none() || self.inner.config.backends.is_empty()
        {
            return;
        }
        let mut scanner = self.inner.scanner.lock();
        if scanner.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        *scanner = Some(self.inner.processes.schedule(
            move || {
                let node = weak.upgrade().map(|inner| Node { inner });
                async move {
                    if let Some(node) = node {
                        node.scan().await;
                    }
                }
            },
            Plan::every(self.inner.config.scan_interval),
            None,
        ));
    }

    /// Dials every listed backend node this node is not connected to yet.
    async fn scan(&self) {
        let Some(registry) = &self.inner.registry else {
            return;
        };
        for backend in &self.inner.config.backends {
            let infos = match registry.select(backend) {
                Ok(infos) => infos,
                Err(err) => {
                    self.inner.pipeline.on_error(err);
                    continue;
                }
            };
            for info in infos {
                if info.node_id == self.inner.node_id
                    || self.inner.endpoint.axon(&info.node_id).is_some()
                {
                    continue;
                }
                let Some(url) = info.endpoints.first() else {
                    continue;
                };
                debug!(node_id = %info.node_id, url, "backend discovered");
                if let Err(err) = self.connect(&info.node_id, url).await {
                    self.inner.pipeline.on_error(err);
                }
            }
        }
    }

    /// The origin this node presents when it dials.
    fn origin(&self) -> String {
        let info = self.inner.info.read();
        let endpoint = info.endpoints.first().cloned().unwrap_or_default();
        Origin::new(endpoint, info.node_id.clone(), info.sig.clone()).to_string()
    }

    /// Dials `node_id` at `url`. Already being connected to it through the
    /// same url is fine; through another url it is refused.
    pub async fn connect(&self, node_id: &str, url: &str) -> Result<(), Error> {
        let origin = self.origin();
        self.inner.endpoint.connect(node_id, url, &origin).await?;
        Ok(())
    }

    /// Decides under which id a dialer is admitted. Nodes the registry
    /// vouches for keep their own id and may only be connected once; anyone
    /// else becomes a guest if this node is public and is refused otherwise.
    fn check_node(&self, origin: &str) -> Result<String, net::Error> {
        let claimed = match origin.parse::<Origin>() {
            Ok(claimed) => claimed,
            Err(err) if !self.inner.config.is_pub => Err(err)?,
            Err(_) => return Ok(ident::guest_id(None)),
        };
        let verified = match &self.inner.registry {
            Some(registry) => registry
                .check_signature(&claimed.node_id, &claimed.signature)
                .map_err(|e| net::Error::Rejected(e.to_string()))?,
            None => false,
        };
        if verified {
            if self.inner.endpoint.axon(&claimed.node_id).is_some() {
                Err(net::Error::Duplicate(claimed.node_id.clone()))?
            }
            return Ok(claimed.node_id);
        }
        if !self.inner.config.is_pub {
            Err(net::Error::Rejected(format!(
                "signature mismatch for {}",
                claimed.node_id
            )))?
        }
        Ok(ident::guest_id(Some(&claimed.node_id)))
    }

    pub async fn send(&self, node_id: &str, payload: &[u8]) -> Result<(), Error> {
        self.inner.endpoint.send(node_id, payload).await?;
        Ok(())
    }

    pub async fn close(&self, node_id: &str) -> Result<(), Error> {
        self.inner.endpoint.close(node_id).await?;
        Ok(())
    }

    /// Ids of the connected nodes of the service `name`.
    pub fn node_ids(&self, name: &str) -> Vec<String> {
        self.inner.endpoint.node_ids(name)
    }

    /// Sets a value published with this node's info at the next
    /// registration.
    pub fn set_user_data(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.info.write().user_data.insert(key.into(), value);
    }

    /// The user data another node registered with.
    pub fn user_data_of(
        &self,
        node_id: &str,
    ) -> Result<Option<HashMap<String, serde_json::Value>>, Error>
    {
        let Some(registry) = &self.inner.registry else {
            return Ok(None);
        };
        Ok(registry.node(node_id)?.map(|info| info.user_data))
    }

    /// Stops discovery, disposes every peer, closes every axon and leaves
    /// the registry.
    pub async fn shutdown(&self) {
        if let Some(scanner) = self.inner.scanner.lock().take() {
            scanner.cancel();
        }
        self.inner.exchange.shutdown().await;
        self.inner.endpoint.shutdown().await;
        if let Some(registry) = &self.inner.registry {
            if let Err(err) = registry.deregister(&self.inner.node_id) {
                self.inner.pipeline.on_error(err);
            }
        }
        self.inner.processes.shutdown();
        debug!(node_id = %self.inner.node_id, "node shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(is_pub: bool, registry: Option<Arc<dyn Registry>>) -> Node {
        let config = NodeConfig::builder()
            .name("echo")
            .endpoints(vec!["tcp://127.0.0.1:0".into()])
            .is_pub(is_pub)
            .build();
        Node::new(config, registry, Arc::new(DefaultPipeline)).unwrap()
    }

    fn registered(registry: &MemoryRegistry, node_id: &str, sig: &str) {
        registry
            .register(&NodeInfo {
                node_id: node_id.into(),
                name: ident::node_name(node_id).into(),
                sig: sig.into(),
                ..NodeInfo::default()
            })
            .unwrap();
    }

    #[test]
    fn ids_carry_the_service_name() {
        let n = node(false, None);
        assert_eq!(ident::node_name(n.node_id()), "echo");
        assert_eq!(n.info().node_id, n.node_id());
        assert!(!n.info().sig.is_empty());

        let config = NodeConfig::builder()
            .name("echo")
            .node_id("7")
            .endpoints(vec!["tcp://127.0.0.1:0".into()])
            .build();
        let n = Node::new(config, None, Arc::new(DefaultPipeline)).unwrap();
        assert_eq!(n.node_id(), "echo#7");
    }

    #[test]
    fn bad_configs_are_refused() {
        for config in [
            NodeConfig::builder().name("echo").build(),
            NodeConfig::builder()
                .name("ec#ho")
                .endpoints(vec!["tcp://127.0.0.1:0".into()])
                .build(),
        ] {
            assert!(matches!(
                Node::new(config, None, Arc::new(DefaultPipeline)),
                Err(Error::Config(_))
            ));
        }
    }

    #[test]
    fn verified_nodes_keep_their_id() {
        let registry = Arc::new(MemoryRegistry::new());
        registered(&registry, "gate#1", "sig");
        let n = node(false, Some(registry));
        let origin = Origin::new("tcp://10.0.0.1:7000", "gate#1", "sig").to_string();
        assert_eq!(n.check_node(&origin).unwrap(), "gate#1");
    }

    #[test]
    fn strangers_are_refused_by_private_nodes() {
        let registry = Arc::new(MemoryRegistry::new());
        registered(&registry, "gate#1", "sig");
        let n = node(false, Some(registry));
        let forged = Origin::new("tcp://10.0.0.1:7000", "gate#1", "nope").to_string();
        assert!(matches!(n.check_node(&forged), Err(net::Error::Rejected(_))));
        assert!(matches!(
            n.check_node("garbage"),
            Err(net::Error::InvalidOrigin(_))
        ));
    }

    #[test]
    fn strangers_become_guests_of_public_nodes() {
        let n = node(true, None);
        let origin = Origin::new("ws://1.2.3.4:80/", "browser", "").to_string();
        assert_eq!(n.check_node(&origin).unwrap(), "!guest#browser");
        let anonymous = n.check_node("garbage").unwrap();
        assert!(ident::is_guest(&anonymous));
    }
}
