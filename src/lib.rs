// GANGLION is a node-to-node RPC substrate for clustered services. Every
// process is a node that exposes named service objects (peers) which other
// nodes invoke over TCP, QUIC or WebSocket links.
//
// The crate is layered leaves first. `process` owns every scheduling unit
// (single-loop services, worker-pool processors and timers) and routes task
// panics to one error sink instead of tearing down the worker. `wire` is the
// tagged binary encoding used for exchange headers. `net` moves bytes: it
// frames, authenticates and keeps alive the axons (connections) between
// nodes. `peer` sits on top and pairs calls with replies by sequence number,
// dispatching locally without touching the network when the target node is
// ourselves.
//
// There is no hidden global state. A `Node` owns its process table, axon
// registry and exchange, and hands them to each other at construction.

pub mod error;
pub mod ident;
pub mod net;
pub mod node;
pub mod peer;
pub mod process;
pub mod wire;

pub use error::{Error, ErrorSink};
pub use node::{
    DefaultPipeline, MemoryRegistry, Node, NodeConfig, NodeInfo, Pipeline, Registry,
};
pub use peer::{
    Bean, BoxError, Codec, Dispatch, Exchange, ExchangeConfig, Invocation, MethodTable,
    PeerHandle, PeerOptions, PeerService, RpcError,
};
