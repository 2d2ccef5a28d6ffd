use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Weak},
};

use futures::{future::BoxFuture, FutureExt};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, trace, warn};

use super::{
    codec::Payload,
    dispatch::TableDispatch,
    pending::{Completion, PendingCall, PendingTable, Reply},
    Codec, Dispatch, Envelope, ExchangeConfig, Invocation, Message, Outcome,
    PeerOptions, PeerService, RpcError, Transport,
};
use crate::{
    error::Error,
    ident,
    process::{Plan, ProcessTable, Processor, Scheduler},
};

/// A registered peer.
struct Peer {
    name: String,
    inner_only: bool,
    processor: Option<Processor>,
    dispatch: Arc<dyn Dispatch>,
    pending: PendingTable,
}

struct ExchangeInner {
    node_id: String,
    config: ExchangeConfig,
    transport: Arc<dyn Transport>,
    processes: ProcessTable,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    sweeper: Mutex<Option<Scheduler>>,
}

/// The peer table of a node and the routing between its peers and the
/// peers of other nodes.
///
/// Can be cloned to obtain another handle to the same exchange.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<ExchangeInner>,
}

/// Splits `Peer.Func`. Anything but exactly two non-empty parts is refused.
fn split_method(method: &str) -> Result<(&str, &str), RpcError> {
    let mut parts = method.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(peer), Some(func), None) if !peer.is_empty() && !func.is_empty() => {
            Ok((peer, func))
        }
        _ => Err(RpcError::MalformedMethod(method.to_string())),
    }
}

impl Exchange {
    pub fn new(
        node_id: impl Into<String>,
        config: ExchangeConfig,
        transport: Arc<dyn Transport>,
        processes: ProcessTable,
    ) -> Self {
        Self {
            inner: Arc::new(ExchangeInner {
                node_id: node_id.into(),
                config,
                transport,
                processes,
                peers: RwLock::new(HashMap::new()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.inner.config
    }

    /// Registers `service` under `options.name` with table dispatch, then
    /// hands the service its own handle.
    pub fn register<S: PeerService>(
        &self,
        options: PeerOptions,
        service: S,
    ) -> Result<PeerHandle, RpcError> {
        let service = Arc::new(service);
        let dispatch = Arc::new(TableDispatch::new(service.clone()));
        let handle = self.register_dispatch(options, dispatch)?;
        service.attach(handle.clone());
        Ok(handle)
    }

    /// Registers a peer that dispatches requests itself.
    pub fn register_dispatch(
        &self,
        options: PeerOptions,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<PeerHandle, RpcError> {
        let mut peers = self.inner.peers.write();
        if peers.contains_key(&options.name) {
            Err(RpcError::DuplicatePeer(options.name.clone()))?
        }
        debug!(
            peer = %options.name,
            inner_only = options.inner_only,
            "peer registered"
        );
        peers.insert(
            options.name.clone(),
            Arc::new(Peer {
                name: options.name.clone(),
                inner_only: options.inner_only,
                processor: options.processor,
                dispatch,
                pending: PendingTable::new(),
            }),
        );
        Ok(PeerHandle {
            exchange: Arc::downgrade(&self.inner),
            name: options.name,
        })
    }

    pub fn peer(&self, name: &str) -> Option<PeerHandle> {
        self.inner.peers.read().get(name).map(|_| PeerHandle {
            exchange: Arc::downgrade(&self.inner),
            name: name.to_string(),
        })
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.inner.peers.read().keys().cloned().collect()
    }

    fn find(&self, name: &str) -> Option<Arc<Peer>> {
        self.inner.peers.read().get(name).cloned()
    }

    /// Removes a peer. Its outstanding calls fail with
    /// [`RpcError::Disposed`]; its processor is terminated when asked to.
    pub async fn dispose(&self, name: &str, with_processor: bool) -> bool {
        let Some(peer) = self.inner.peers.write().remove(name) else {
            return false;
        };
        for call in peer.pending.drain() {
            call.complete(
                Err(RpcError::Disposed(name.to_string())),
                peer.processor.as_ref(),
                self.inner.processes.sink(),
            )
            .await;
        }
        if with_processor {
            if let Some(processor) = &peer.processor {
                processor.terminate();
            }
        }
        debug!(peer = name, "peer disposed");
        true
    }

    fn codec_for(&self, node_id: &str) -> Codec {
        if ident::is_guest(node_id) {
            self.inner.config.outer_codec
        } else {
            self.inner.config.inner_codec
        }
    }

    fn report(&self, err: impl Into<Error>) {
        self.inner.processes.sink().report(err)
    }

    /// Entry point for envelopes that arrived from `node_id`.
    pub async fn on_exchange(&self, node_id: &str, bytes: Vec<u8>) {
        match Envelope::decode(&bytes) {
            Ok(env) => {
                trace!(
                    sender = node_id,
                    receiver = %self.inner.node_id,
                    from = %env.from,
                    to = %env.to,
                    func = %env.func,
                    seq = env.seq,
                    ret = ?env.ret,
                    "exchange in"
                );
                self.route(node_id, env).await
            }
            Err(err) => {
                warn!(node_id, %err, "undecodable exchange dropped");
                self.report(err)
            }
        }
    }

    /// Hands `env` to its target: locally when `node_id` is this node,
    /// otherwise encoded through the transport.
    async fn deliver(&self, node_id: &str, env: Envelope) -> Result<(), RpcError> {
        trace!(
            sender = %self.inner.node_id,
            receiver = node_id,
            from = %env.from,
            to = %env.to,
            func = %env.func,
            seq = env.seq,
            ret = ?env.ret,
            "exchange out"
        );
        if node_id == self.inner.node_id {
            self.route(node_id, env).await;
            return Ok(());
        }
        let bytes = env.encode(self.codec_for(node_id))?;
        self.inner.transport.send(node_id, bytes).await?;
        Ok(())
    }

    fn route<'a>(&'a self, node_id: &'a str, env: Envelope) -> BoxFuture<'a, ()> {
        async move {
            let Some(peer) = self.find(&env.to) else {
                return self.unroutable(node_id, env).await;
            };
            if !env.is_request() {
                return self.complete(node_id, &peer, env).await;
            }
            match &peer.processor {
                Some(processor) if processor.running() => {
                    let this = self.clone();
                    let caller = node_id.to_string();
                    let target = peer.clone();
                    let queued = processor
                        .execute(async move {
                            this.serve(&caller, &target, env).await
                        })
                        .await;
                    if !queued {
                        self.report(RpcError::Disposed(peer.name.clone()));
                    }
                }
                _ => {
                    let run = AssertUnwindSafe(self.serve(node_id, &peer, env));
                    if let Err(panic) = run.catch_unwind().await {
                        self.report(Error::from_panic(panic));
                    }
                }
            }
        }
        .boxed()
    }

    async fn unroutable(&self, node_id: &str, env: Envelope) {
        if !env.is_request() {
            warn!(to = %env.to, seq = env.seq, "reply for an unknown peer dropped");
            return;
        }
        let err = RpcError::NoSuchPeer(env.to.clone());
        if env.seq == 0 {
            self.report(err);
        } else {
            self.respond(node_id, env.to, env.from, env.seq, Err(err))
                .await;
        }
    }

    /// Runs a request on `peer` and answers it unless it is an event.
    async fn serve(&self, node_id: &str, peer: &Peer, env: Envelope) {
        let Envelope {
            from,
            to,
            func,
            seq,
            payload,
            ..
        } = env;
        let outcome = self.dispatch(node_id, peer, &func, payload);
        match (seq, outcome) {
            (0, Ok(_)) => {}
            (0, Err(err)) => {
                debug!(peer = %to, func, %err, "event failed");
                self.report(err);
            }
            (seq, outcome) => {
                let result = outcome.map(|reply| match reply {
                    Some(reply) => Payload::Local(reply),
                    None => Payload::Empty,
                });
                self.respond(node_id, to, from, seq, result).await;
            }
        }
    }

    fn dispatch(
        &self,
        node_id: &str,
        peer: &Peer,
        func: &str,
        payload: Payload,
    ) -> Outcome {
        if peer.inner_only && ident::is_guest(node_id) {
            Err(RpcError::PermissionDenied(format!("{}.{}", peer.name, func)))?
        }
        let context = match &self.inner.config.pre_proc {
            Some(pre_proc) => pre_proc(node_id, &peer.name, func)?,
            None => None,
        };
        let mut inv = Invocation::new(
            node_id,
            &peer.name,
            func,
            context,
            self.codec_for(node_id),
            payload,
        );
        match catch_unwind(AssertUnwindSafe(|| peer.dispatch.dispatch(&mut inv))) {
            Ok(outcome) => outcome,
            Err(panic) => {
                self.report(Error::from_panic(panic));
                Err(RpcError::Handler(format!("{} panicked", inv.method())))
            }
        }
    }

    /// Sends a reply from peer `from` back to peer `to` on `node_id`.
    async fn respond(
        &self,
        node_id: &str,
        from: String,
        to: String,
        seq: u64,
        result: Result<Payload, RpcError>,
    ) {
        let env = Envelope::response(from.clone(), to.clone(), seq, result);
        match self.deliver(node_id, env).await {
            Ok(()) => {}
            // the reply did not encode; the caller still gets an answer
            Err(err @ (RpcError::Codec(_) | RpcError::Wire(_))) => {
                let env = Envelope::response(from, to, seq, Err(err));
                if let Err(err) = self.deliver(node_id, env).await {
                    self.report(err);
                }
            }
            Err(err) => self.report(err),
        }
    }

    async fn complete(&self, node_id: &str, peer: &Peer, env: Envelope) {
        let Some(call) = peer.pending.take(env.seq) else {
            trace!(peer = %peer.name, seq = env.seq, "late reply discarded");
            return;
        };
        let reply = if env.err.is_empty() {
            Ok((env.payload, self.codec_for(node_id)))
        } else {
            Err(RpcError::from_wire(&env.err))
        };
        call.complete(reply, peer.processor.as_ref(), self.inner.processes.sink())
            .await;
    }

    /// Fails every call past its deadline with [`RpcError::Timeout`]. Returns
    /// how many there were.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let peers: Vec<Arc<Peer>> =
            self.inner.peers.read().values().cloned().collect();
        let mut swept = 0;
        for peer in peers {
            for call in peer.pending.expired(now) {
                debug!(peer = %peer.name, method = %call.method, "call timed out");
                let err = RpcError::Timeout(call.method.clone());
                call.complete(
                    Err(err),
                    peer.processor.as_ref(),
                    self.inner.processes.sink(),
                )
                .await;
                swept += 1;
            }
        }
        swept
    }

    /// Sweeps every `sweep_interval`. Calling it again has no effect.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval;
        *sweeper = Some(self.inner.processes.schedule(
            move || {
                let exchange = weak.upgrade().map(|inner| Exchange { inner });
                async move {
                    if let Some(exchange) = exchange {
                        exchange.sweep().await;
                    }
                }
            },
            Plan::every(interval).after(interval),
            None,
        ));
    }

    /// Stops the sweeper and disposes every peer.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.cancel();
        }
        for name in self.peer_names() {
            self.dispose(&name, true).await;
        }
    }
}

/// Non-owning handle to a registered peer, used to make calls from it.
///
/// The handle only names the peer; once the peer is disposed or the
/// exchange is gone every call fails with [`RpcError::Disposed`].
#[derive(Clone)]
pub struct PeerHandle {
    exchange: Weak<ExchangeInner>,
    name: String,
}

impl PeerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self) -> Result<(Exchange, Arc<Peer>), RpcError> {
        let disposed = || RpcError::Disposed(self.name.clone());
        let exchange = Exchange {
            inner: self.exchange.upgrade().ok_or_else(disposed)?,
        };
        let peer = exchange.find(&self.name).ok_or_else(disposed)?;
        Ok((exchange, peer))
    }

    async fn issue(
        &self,
        node_id: &str,
        method: &str,
        args: Box<dyn Message>,
        completion: Option<Completion>,
    ) -> Result<(), RpcError> {
        let (to, func) = split_method(method)?;
        let (exchange, me) = self.resolve()?;
        let seq = match completion {
            Some(completion) => {
                let seq = me.pending.next_seq();
                let deadline = Instant::now() + exchange.inner.config.call_timeout;
                me.pending
                    .insert(seq, PendingCall::new(method, deadline, completion));
                seq
            }
            None => 0,
        };
        let env = Envelope::request(&me.name, to, func, seq, Payload::Local(args));
        if let Err(err) = exchange.deliver(node_id, env).await {
            if seq != 0 {
                me.pending.take(seq);
            }
            Err(err)?
        }
        Ok(())
    }

    /// Calls `method` (`Peer.Func`) on `node_id` and waits for the reply or
    /// the timeout.
    pub async fn invoke<A, R>(
        &self,
        node_id: &str,
        method: &str,
        args: A,
    ) -> Result<R, RpcError>
    where
        A: Message,
        R: DeserializeOwned + Any,
    {
        let (tx, rx) = oneshot::channel::<Reply>();
        self.issue(node_id, method, Box::new(args), Some(Completion::Signal(tx)))
            .await?;
        let (payload, codec) = rx
            .await
            .map_err(|_| RpcError::Disposed(self.name.clone()))??;
        payload.take(codec)
    }

    /// [`PeerHandle::invoke`] on this node.
    pub async fn invoke_local<A, R>(
        &self,
        method: &str,
        args: A,
    ) -> Result<R, RpcError>
    where
        A: Message,
        R: DeserializeOwned + Any,
    {
        let exchange = self.resolve()?.0;
        self.invoke(exchange.node_id(), method, args).await
    }

    /// Calls `method` on `node_id` without waiting. `done` gets the reply or
    /// the timeout exactly once, on this peer's processor when it has one.
    pub async fn call<A, R, F>(
        &self,
        node_id: &str,
        method: &str,
        args: A,
        done: F,
    ) -> Result<(), RpcError>
    where
        A: Message,
        R: DeserializeOwned + Any,
        F: FnOnce(Result<R, RpcError>) + Send + 'static,
    {
        let completion = Completion::Callback(Box::new(move |reply: Reply| {
            done(reply.and_then(|(payload, codec)| payload.take::<R>(codec)))
        }));
        self.issue(node_id, method, Box::new(args), Some(completion))
            .await
    }

    /// Fires `method` on `node_id`. Nothing comes back.
    pub async fn send_event<A: Message>(
        &self,
        node_id: &str,
        method: &str,
        args: A,
    ) -> Result<(), RpcError> {
        self.issue(node_id, method, Box::new(args), None).await
    }

    /// Calls of this peer still waiting for a reply.
    pub fn pending_len(&self) -> usize {
        self.resolve().map_or(0, |(_, peer)| peer.pending.len())
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle").field("name", &self.name).finish()
    }
}
