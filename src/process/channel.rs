use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use hashbrown::HashMap;
use parking_lot::RwLock;

use super::Processor;
use crate::error::{Error, ErrorSink};

type Payload = Arc<dyn Any + Send + Sync>;
type Callback = Arc<dyn Fn(&Payload) + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    callback: Callback,
    processor: Option<Processor>,
}

struct ChannelInner {
    name: String,
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    sink: ErrorSink,
}

/// Named in-process publish/subscribe. Delivery is best effort: a subscriber
/// whose processor is gone runs inline, and nothing is queued for
/// subscribers that join later.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(super) fn new(name: &str, sink: ErrorSink) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.to_string(),
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                sink,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Delivers `value` to every subscriber of type `T`.
    pub async fn publish<T: Any + Send + Sync>(&self, value: T) {
        let payload: Payload = Arc::new(value);
        let subscribers: Vec<Subscriber> =
            self.inner.subscribers.read().values().cloned().collect();
        for sub in subscribers {
            match sub.processor {
                Some(p) if p.running() => {
                    let payload = payload.clone();
                    let callback = sub.callback.clone();
                    p.execute(async move { callback(&payload) }).await;
                }
                _ => {
                    let run = AssertUnwindSafe(|| (sub.callback)(&payload));
                    if let Err(panic) = std::panic::catch_unwind(run) {
                        self.inner.sink.report(Error::from_panic(panic));
                    }
                }
            }
        }
    }

    /// Registers `f` for values of type `T`. Values of other types are
    /// skipped. Returns the id to unsubscribe with.
    pub fn subscribe<T, F>(&self, f: F, processor: Option<Processor>) -> u64
    where
        T: Any + Send + Sync,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(move |payload: &Payload| {
            if let Some(value) = (**payload).downcast_ref::<T>() {
                f(value)
            }
        });
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .insert(id, Subscriber { callback, processor });
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.subscribers.write().remove(&id);
    }

    pub fn unsubscribe_all(&self) {
        self.inner.subscribers.write().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}
