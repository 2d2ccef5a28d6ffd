use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{select, sync::Mutex as AsyncMutex, time};
use tracing::{debug, debug_span, trace, warn, Instrument, Span};

use super::{
    axon::Axon,
    frame::Control,
    handshake,
    link::{Incoming, LinkReader, LinkWriter, Listener},
    netwatch, quic, tcp, ws, AxonRegistry, Error, NetConfig, NetHandler,
    Protocol, Target,
};
use crate::process::{Hook, ProcessTable, Scheduler, Service};

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub(super) struct EndpointInner {
    pub(super) config: NetConfig,
    pub(super) handler: Arc<dyn NetHandler>,
    pub(super) registry: Arc<AxonRegistry>,
    pub(super) processes: ProcessTable,
    next_key: AtomicU64,
    listeners: Mutex<Vec<Service>>,
    quic_client: Mutex<Option<quinn::Endpoint>>,
    heartbeat: Mutex<Option<Scheduler>>,
}

/// Listens, dials and keeps track of every axon of a node.
///
/// Can be cloned to obtain another handle to the same endpoint.
#[derive(Clone)]
pub struct Endpoint {
    pub(super) inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub fn new(
        config: NetConfig,
        handler: Arc<dyn NetHandler>,
        registry: Arc<AxonRegistry>,
        processes: ProcessTable,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                config,
                handler,
                registry,
                processes,
                next_key: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
                quic_client: Mutex::new(None),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    pub(super) fn from_weak(weak: &Weak<EndpointInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &NetConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<AxonRegistry> {
        &self.inner.registry
    }

    /// Binds `url` and accepts connections on it until the endpoint shuts
    /// down. Returns the url actually bound, which differs from `url` when
    /// it asked for port 0.
    pub async fn listen(&self, url: &str) -> Result<String, Error> {
        let target: Target = url.parse()?;
        let (listener, port) = Listener::bind(&target, &self.inner.config).await?;
        let bound = target.with_port(port);
        debug!(url = %bound, "listening");

        let listener = Arc::new(listener);
        let boss = self.inner.processes.spawn_service();
        let recycle: Hook = {
            let listener = listener.clone();
            Box::new(move || listener.close())
        };
        let weak = Arc::downgrade(&self.inner);
        let this = boss.clone();
        boss.start(
            move || {
                let listener = listener.clone();
                let weak = weak.clone();
                let boss = this.clone();
                async move {
                    let accepted = select! {
                        accepted = listener.accept() => accepted,
                        _ = boss.terminated() => return,
                    };
                    let Some(endpoint) = Endpoint::from_weak(&weak) else {
                        boss.terminate();
                        return;
                    };
                    match accepted {
                        Ok(Some((incoming, remote))) => {
                            tokio::spawn(async move {
                                endpoint.accept(incoming, remote).await
                            });
                        }
                        Ok(None) => boss.terminate(),
                        Err(err) => {
                            endpoint.inner.handler.on_error(err);
                            time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
            },
            Some(recycle),
        );
        self.inner.listeners.lock().push(boss);
        Ok(bound)
    }

    async fn accept(&self, incoming: Incoming, remote: SocketAddr) {
        let proto = incoming.proto();
        let span = debug_span!("axon", %remote, %proto);
        async move {
            debug!("accepted connection");
            if let Err(err) = self.admit_incoming(incoming, remote).await {
                debug!(%err, "incoming handshake failed");
                if !err.is_eof() {
                    self.inner.handler.on_error(err);
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn admit_incoming(
        &self,
        incoming: Incoming,
        remote: SocketAddr,
    ) -> Result<(), Error> {
        let proto = incoming.proto();
        let timeout = self.inner.config.handshake_timeout;
        let (mut writer, mut reader) =
            time::timeout(timeout, incoming.open(&self.inner.config))
                .await
                .map_err(|_| Error::HandshakeTimeout)??;

        let verified = match handshake::receive(&mut reader, proto, timeout).await
        {
            Ok(hello) => self.inner.handler.check_node(&hello.origin),
            Err(err) => Err(err),
        };
        let node_id = match verified {
            Ok(node_id) => node_id,
            Err(err) => {
                writer.close().await;
                Err(err)?
            }
        };
        debug!(node_id, "origin verified");
        let url = format!("{}://{}", proto.scheme(), remote);
        self.establish(node_id, url, proto, writer, reader, true)
            .await?;
        Ok(())
    }

    /// Dials `url` and hands `origin` to the remote for verification. The
    /// axon is registered under `node_id`.
    ///
    /// Connecting to a node that is already connected through the same url
    /// succeeds without dialing; through another url it is refused.
    pub async fn connect(
        &self,
        node_id: &str,
        url: &str,
        origin: &str,
    ) -> Result<(), Error> {
        if let Some(existing) = self.inner.registry.get(node_id) {
            if existing.url() == url {
                return Ok(());
            }
            Err(Error::Duplicate(node_id.to_string()))?
        }
        let target: Target = url.parse()?;
        let span = debug_span!("axon", remote = %target.addr, proto = %target.proto);
        async move {
            debug!("dialing");
            let timeout = self.inner.config.handshake_timeout;
            let (mut writer, mut reader) = time::timeout(timeout, self.dial(&target))
                .await
                .map_err(|_| Error::HandshakeTimeout)??;
            if let Err(err) = handshake::offer(
                &mut writer,
                &mut reader,
                target.proto,
                origin,
                timeout,
            )
            .await
            {
                writer.close().await;
                Err(err)?
            }
            self.establish(
                node_id.to_string(),
                url.to_string(),
                target.proto,
                writer,
                reader,
                false,
            )
            .await?;
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn dial(
        &self,
        target: &Target,
    ) -> Result<(LinkWriter, LinkReader), Error> {
        let read_buffer = self.inner.config.read_buffer;
        match target.proto {
            Protocol::Tcp => tcp::dial(target, read_buffer).await,
            Protocol::Quic => {
                let ep = self.quic_client()?;
                quic::dial(&ep, target, read_buffer).await
            }
            Protocol::Ws => ws::dial(target).await,
        }
    }

    fn quic_client(&self) -> Result<quinn::Endpoint, Error> {
        let mut client = self.inner.quic_client.lock();
        if let Some(ep) = client.as_ref() {
            return Ok(ep.clone());
        }
        let ep = quic::client(&self.inner.config)?;
        *client = Some(ep.clone());
        Ok(ep)
    }

    /// Registers a handshaken link and starts reading from it. The acceptor
    /// registers before acknowledging so a dialer never sees `#hsuc` for a
    /// link that was refused as a duplicate.
    async fn establish(
        &self,
        node_id: String,
        url: String,
        proto: Protocol,
        writer: LinkWriter,
        reader: LinkReader,
        acknowledge: bool,
    ) -> Result<Arc<Axon>, Error> {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        let worker = self.inner.processes.spawn_service();
        let axon = Arc::new(Axon::new(node_id, url, proto, key, worker, writer));
        if let Err(err) = self.inner.registry.admit(axon.clone()) {
            axon.shutdown().await;
            Err(err)?
        }
        if acknowledge {
            if let Err(err) = axon.acknowledge().await {
                self.inner.registry.remove(axon.node_id(), key);
                axon.shutdown().await;
                Err(err)?
            }
        }
        debug!(node_id = axon.node_id(), key, "axon established");
        self.inner.handler.on_connect(axon.node_id());
        self.spawn_reader(&axon, reader);
        Ok(axon)
    }

    fn spawn_reader(&self, axon: &Arc<Axon>, reader: LinkReader) {
        let reader = Arc::new(AsyncMutex::new(reader));
        let weak = Arc::downgrade(&self.inner);
        let span = Span::current();
        let worker = axon.worker().clone();
        let axon = axon.clone();
        let this = worker.clone();
        worker.start(
            move || {
                let reader = reader.clone();
                let weak = weak.clone();
                let axon = axon.clone();
                let worker = this.clone();
                async move {
                    let mut reader = reader.lock().await;
                    let next = select! {
                        next = reader.next() => next,
                        _ = worker.terminated() => return,
                    };
                    drop(reader);
                    let Some(endpoint) = Endpoint::from_weak(&weak) else {
                        worker.terminate();
                        return;
                    };
                    match next {
                        Ok(Some(msg)) => endpoint.deliver(&axon, msg).await,
                        Ok(None) => endpoint.close_axon(&axon, Error::Eof).await,
                        Err(err) => endpoint.close_axon(&axon, err).await,
                    }
                }
                .instrument(span.clone())
            },
            None,
        );
    }

    async fn deliver(&self, axon: &Axon, msg: Vec<u8>) {
        match axon.intercept(&msg) {
            Some(Control::Ping) => {
                trace!("ping");
                if let Err(err) = axon.pong().await {
                    self.close_axon(axon, err).await;
                }
            }
            Some(Control::Pong) => trace!("pong"),
            Some(Control::HandshakeAck) => {
                warn!("stray handshake acknowledgement")
            }
            None => self.inner.handler.on_message(axon.node_id(), msg).await,
        }
    }

    /// Removes `axon` and tells the handler why. Whoever removes it from the
    /// registry does the rest; later callers do nothing.
    pub(super) async fn close_axon(&self, axon: &Axon, reason: Error) {
        let Some(axon) = self.inner.registry.remove(axon.node_id(), axon.key())
        else {
            return;
        };
        debug!(node_id = axon.node_id(), %reason, "axon closed");
        axon.shutdown().await;
        self.inner.handler.on_close(axon.node_id(), &reason);
    }

    pub async fn send(&self, node_id: &str, payload: &[u8]) -> Result<(), Error> {
        self.inner.registry.send(node_id, payload).await
    }

    /// Closes the axon of `node_id`. The handler sees [`Error::Closed`].
    pub async fn close(&self, node_id: &str) -> Result<(), Error> {
        let axon = self
            .inner
            .registry
            .get(node_id)
            .ok_or_else(|| Error::NotConnected(node_id.to_string()))?;
        self.close_axon(&axon, Error::Closed).await;
        Ok(())
    }

    pub fn node_ids(&self, name: &str) -> Vec<String> {
        self.inner.registry.node_ids(name)
    }

    pub fn axon(&self, node_id: &str) -> Option<Arc<Axon>> {
        self.inner.registry.get(node_id)
    }

    /// Starts pinging idle stream axons and closing the ones that stay
    /// silent. Calling it again has no effect.
    pub fn start_heartbeat(&self) {
        let mut heartbeat = self.inner.heartbeat.lock();
        if heartbeat.is_none() {
            *heartbeat = Some(netwatch::start(self));
        }
    }

    /// Stops listening and the heartbeat, and closes every axon.
    pub async fn shutdown(&self) {
        if let Some(heartbeat) = self.inner.heartbeat.lock().take() {
            heartbeat.cancel();
        }
        let listeners: Vec<Service> =
            self.inner.listeners.lock().drain(..).collect();
        for listener in listeners {
            listener.terminate();
        }
        for axon in self.inner.registry.axons() {
            self.close_axon(&axon, Error::Closed).await;
        }
        if let Some(ep) = self.inner.quic_client.lock().take() {
            ep.close(quinn::VarInt::from_u32(0), b"shutdown");
        }
        debug!("endpoint shut down");
    }
}
