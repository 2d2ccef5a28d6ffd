//! Calls between peers.
//!
//! A peer is a named service object registered with a node's [`Exchange`].
//! Peers talk through envelopes: a request names the target peer and
//! method, a reply carries the request's sequence number back so the
//! caller's pending call can be found. Events carry sequence number zero
//! and are never answered.
//!
//! When the target node is the local one the envelope never leaves the
//! process and its payload is handed over as the caller's own value.
//! Otherwise the envelope is encoded, with JSON bodies for guests and
//! bincode for everyone else, and given to the [`Transport`].

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use typed_builder::TypedBuilder;

mod codec;
mod dispatch;
mod envelope;
mod error;
mod exchange;
mod pending;

pub use codec::{Codec, Message};
pub use dispatch::{
    Bean, Context, Dispatch, Invocation, MethodTable, Outcome, PeerService,
};
pub use envelope::{Envelope, Ret};
pub use error::RpcError;
pub use exchange::{Exchange, PeerHandle};

use crate::{net, process::Processor};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Runs before every request is dispatched, with the calling node id, the
/// target peer and the method. An error is sent back instead of
/// dispatching; a context is handed to the arguments.
pub type PreProc = Arc<
    dyn Fn(&str, &str, &str) -> Result<Option<Context>, RpcError>
        + Send
        + Sync,
>;

/// Moves encoded envelopes to other nodes.
pub trait Transport: Send + Sync + 'static {
    fn send<'a>(
        &'a self,
        node_id: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), net::Error>>;
}

#[derive(Clone, TypedBuilder)]
pub struct ExchangeConfig {
    /// How long a call waits for its reply.
    #[builder(default = Duration::from_secs(15))]
    pub call_timeout: Duration,
    /// How often expired calls are failed.
    #[builder(default = Duration::from_secs(7))]
    pub sweep_interval: Duration,
    /// Payload codec between trusted nodes.
    #[builder(default = Codec::Bincode)]
    pub inner_codec: Codec,
    /// Payload codec for guests.
    #[builder(default = Codec::Json)]
    pub outer_codec: Codec,
    #[builder(default, setter(strip_option))]
    pub pre_proc: Option<PreProc>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl std::fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("call_timeout", &self.call_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .field("inner_codec", &self.inner_codec)
            .field("outer_codec", &self.outer_codec)
            .field("pre_proc", &self.pre_proc.is_some())
            .finish()
    }
}

/// How a peer is registered.
#[derive(Clone, TypedBuilder)]
pub struct PeerOptions {
    #[builder(setter(into))]
    pub name: String,
    /// Refuse requests from guest nodes.
    #[builder(default)]
    pub inner_only: bool,
    /// Where requests and reply callbacks run. Without one, or once it is
    /// terminated, they run on the task that received them.
    #[builder(default, setter(strip_option))]
    pub processor: Option<Processor>,
}

impl PeerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder().name(name).build()
    }
}
