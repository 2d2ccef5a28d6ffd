//! Heartbeat over stream axons.
//!
//! Every `heartbeat_interval` each TCP and QUIC axon is looked at once: if it
//! still owes a pong from the previous round it is closed with
//! [`Error::HeartbeatTimeout`], otherwise it is pinged when it has been
//! silent for longer than `idle_threshold`. WebSocket axons answer pings but
//! are never swept.

use std::sync::Arc;

use tracing::{debug, debug_span, trace, Instrument};

use super::{endpoint::Endpoint, Error};
use crate::process::{Plan, Scheduler};

pub(super) fn start(endpoint: &Endpoint) -> Scheduler {
    let weak = Arc::downgrade(&endpoint.inner);
    let interval = endpoint.inner.config.heartbeat_interval;
    debug!(?interval, "heartbeat started");
    endpoint.inner.processes.schedule(
        move || {
            let endpoint = Endpoint::from_weak(&weak);
            async move {
                if let Some(endpoint) = endpoint {
                    pulse(&endpoint).await;
                }
            }
            .instrument(debug_span!("netwatch"))
        },
        Plan::every(interval).after(interval),
        None,
    )
}

/// One round over every watched axon.
pub(super) async fn pulse(endpoint: &Endpoint) {
    let idle_threshold = endpoint.inner.config.idle_threshold;
    let axons = endpoint.inner.registry.axons();
    for axon in axons.into_iter().filter(|a| a.proto().keepalive()) {
        if axon.awaiting_pong() {
            debug!(node_id = axon.node_id(), "no pong since the last round");
            endpoint.close_axon(&axon, Error::HeartbeatTimeout).await;
        } else if axon.idle_for() > idle_threshold {
            trace!(node_id = axon.node_id(), "pinging idle axon");
            if let Err(err) = axon.ping().await {
                endpoint.close_axon(&axon, err).await;
            }
        }
    }
}
