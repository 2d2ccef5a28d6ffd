use std::{
    panic::AssertUnwindSafe,
    sync::atomic::{AtomicU64, Ordering},
};

use futures::FutureExt;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::{sync::oneshot, time::Instant};

use super::{codec::Payload, Codec, RpcError};
use crate::{
    error::{Error, ErrorSink},
    process::Processor,
};

/// What a reply resolves to before it is decoded into the caller's type.
pub(crate) type Reply = Result<(Payload, Codec), RpcError>;

pub(crate) enum Completion {
    /// A caller suspended in `invoke`.
    Signal(oneshot::Sender<Reply>),
    /// A callback handed to `call`.
    Callback(Box<dyn FnOnce(Reply) + Send>),
}

/// A call waiting for its reply.
pub(crate) struct PendingCall {
    pub(crate) method: String,
    pub(crate) deadline: Instant,
    completion: Completion,
}

impl PendingCall {
    pub(crate) fn new(
        method: &str,
        deadline: Instant,
        completion: Completion,
    ) -> Self {
        Self {
            method: method.to_string(),
            deadline,
            completion,
        }
    }

    /// Delivers the outcome. A waiting caller is woken directly; a callback
    /// runs on `processor` when it is running, otherwise right here.
    pub(crate) async fn complete(
        self,
        reply: Reply,
        processor: Option<&Processor>,
        sink: &ErrorSink,
    ) {
        match self.completion {
            Completion::Signal(tx) => {
                // the caller may have given up already
                let _ = tx.send(reply);
            }
            Completion::Callback(done) => match processor {
                Some(p) if p.running() => {
                    p.execute(async move { done(reply) }).await;
                }
                _ => {
                    let run = AssertUnwindSafe(async move { done(reply) });
                    if let Err(panic) = run.catch_unwind().await {
                        sink.report(Error::from_panic(panic));
                    }
                }
            },
        }
    }
}

/// The pending calls of one peer, keyed by sequence number.
pub(crate) struct PendingTable {
    calls: Mutex<HashMap<u64, PendingCall>>,
    next_seq: AtomicU64,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Next sequence number. Never zero, which marks events.
    pub(crate) fn next_seq(&self) -> u64 {
        loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    pub(crate) fn insert(&self, seq: u64, call: PendingCall) {
        self.calls.lock().insert(seq, call);
    }

    /// Removes the call waiting on `seq`. Whoever gets it delivers it.
    pub(crate) fn take(&self, seq: u64) -> Option<PendingCall> {
        self.calls.lock().remove(&seq)
    }

    /// Removes and returns every call whose deadline is before `now`.
    pub(crate) fn expired(&self, now: Instant) -> Vec<PendingCall> {
        let mut calls = self.calls.lock();
        let seqs: Vec<u64> = calls
            .iter()
            .filter(|(_, call)| call.deadline < now)
            .map(|(seq, _)| *seq)
            .collect();
        seqs.into_iter().filter_map(|seq| calls.remove(&seq)).collect()
    }

    pub(crate) fn drain(&self) -> Vec<PendingCall> {
        self.calls.lock().drain().map(|(_, call)| call).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }
}
