use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::{
    scheduler::{drive, Plan, Stop},
    Hook, TableInner,
};
use crate::error::{Error, ErrorSink};

struct ServiceInner {
    pid: u64,
    started: AtomicBool,
    stop: Stop,
    recycle: Mutex<Option<Hook>>,
    sink: ErrorSink,
    table: Weak<TableInner>,
}

/// A single logical loop. Cloning yields another handle to the same loop.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    pub(super) fn new(
        pid: u64,
        sink: ErrorSink,
        table: Weak<TableInner>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                pid,
                started: AtomicBool::new(false),
                stop: Stop::new(),
                recycle: Mutex::new(None),
                sink,
                table,
            }),
        }
    }

    pub fn pid(&self) -> u64 {
        self.inner.pid
    }

    /// Runs `body` over and over until the service is terminated. A service
    /// runs one loop; starting it again does nothing.
    pub fn start<F, Fut>(&self, body: F, recycle: Option<Hook>)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.run(body, Plan::default(), recycle)
    }

    /// Runs `body` every `interval` until the service is terminated.
    pub fn start_tick<F, Fut>(
        &self,
        body: F,
        interval: Duration,
        recycle: Option<Hook>,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.run(body, Plan::every(interval), recycle)
    }

    fn run<F, Fut>(&self, body: F, plan: Plan, recycle: Option<Hook>)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            warn!(pid = self.inner.pid, "service already started");
            return;
        }
        *self.inner.recycle.lock() = recycle;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            drive(plan, &inner.stop, &inner.sink, body).await;
        });
    }

    /// Waits until the service is terminated. Returns false right away if it
    /// was never started.
    pub async fn sync(&self) -> bool {
        if !self.inner.started.load(Ordering::Acquire) {
            return false;
        }
        self.inner.stop.wait().await;
        true
    }

    /// Resolves once the service has been terminated, started or not.
    pub async fn terminated(&self) {
        self.inner.stop.wait().await
    }

    pub fn running(&self) -> bool {
        !self.inner.stop.fired()
    }

    /// Stops the loop before its next iteration, runs the recycle hook and
    /// removes the service from its table. Only the first call has any
    /// effect.
    pub fn terminate(&self) {
        if !self.inner.stop.fire() {
            return;
        }
        let recycle = self.inner.recycle.lock().take();
        if let Some(recycle) = recycle {
            if let Err(panic) =
                std::panic::catch_unwind(AssertUnwindSafe(recycle))
            {
                self.inner.sink.report(Error::from_panic(panic));
            }
        }
        if let Some(table) = self.inner.table.upgrade() {
            table.remove(self.inner.pid);
        }
        trace!(pid = self.inner.pid, "service terminated");
    }
}
