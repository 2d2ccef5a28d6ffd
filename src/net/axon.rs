use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::{sync::Mutex as AsyncMutex, time::Instant};

use super::{
    frame::{Control, HANDSHAKE_ACK, PING, PONG},
    link::LinkWriter,
    Error, Protocol,
};
use crate::process::Service;

/// An admitted link to another node.
///
/// The axon owns the write half of its socket; the read half lives in the
/// worker [`Service`] that feeds incoming payloads to the endpoint's
/// handler. Terminating the worker ends the read loop.
pub struct Axon {
    node_id: String,
    url: String,
    proto: Protocol,
    key: u64,
    connected_at: DateTime<Utc>,
    worker: Service,
    writer: AsyncMutex<LinkWriter>,
    awaiting_pong: AtomicBool,
    last_active: Mutex<Instant>,
}

impl Axon {
    pub(crate) fn new(
        node_id: String,
        url: String,
        proto: Protocol,
        key: u64,
        worker: Service,
        writer: LinkWriter,
    ) -> Self {
        Self {
            node_id,
            url,
            proto,
            key,
            connected_at: Utc::now(),
            worker,
            writer: AsyncMutex::new(writer),
            awaiting_pong: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn proto(&self) -> Protocol {
        self.proto
    }

    /// Identifies the underlying socket. Unique per endpoint.
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn worker(&self) -> &Service {
        &self.worker
    }

    pub async fn send(&self, payload: &[u8]) -> Result<(), Error> {
        self.writer.lock().await.send(payload).await
    }

    pub(crate) async fn acknowledge(&self) -> Result<(), Error> {
        self.writer.lock().await.send_raw(HANDSHAKE_ACK).await
    }

    /// Sends a ping and marks the axon as waiting for the answer.
    pub async fn ping(&self) -> Result<(), Error> {
        self.awaiting_pong.store(true, Ordering::Release);
        self.send(PING).await
    }

    pub(crate) async fn pong(&self) -> Result<(), Error> {
        self.send(PONG).await
    }

    /// Records activity and picks out control messages. Any traffic counts
    /// as an answer to an outstanding ping.
    pub(crate) fn intercept(&self, msg: &[u8]) -> Option<Control> {
        self.awaiting_pong.store(false, Ordering::Release);
        *self.last_active.lock() = Instant::now();
        Control::parse(msg)
    }

    pub fn awaiting_pong(&self) -> bool {
        self.awaiting_pong.load(Ordering::Acquire)
    }

    /// Time since the last message arrived.
    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// Stops the read loop and closes the socket.
    pub(crate) async fn shutdown(&self) {
        self.worker.terminate();
        // a writer stuck on a full socket keeps the lock; dropping the last
        // handle closes the socket then
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.close().await;
        }
    }
}

impl std::fmt::Debug for Axon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Axon")
            .field("node_id", &self.node_id)
            .field("url", &self.url)
            .field("proto", &self.proto)
            .field("key", &self.key)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}
