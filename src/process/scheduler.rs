use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures::FutureExt;
use tokio::{select, sync::watch, time::sleep};

use crate::error::{Error, ErrorSink};

/// One-way stop flag that can be polled or awaited.
#[derive(Clone)]
pub(crate) struct Stop(Arc<watch::Sender<bool>>);

impl Stop {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    /// Raises the flag. Returns true only for the call that raised it.
    pub(crate) fn fire(&self) -> bool {
        !self.0.send_replace(true)
    }

    pub(crate) fn fired(&self) -> bool {
        *self.0.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.0.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // the sender lives in self, so this never errors
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// When and how often a scheduled task runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Wait before the first run.
    pub delay: Option<Duration>,
    /// Pause between runs. Without one the task is rescheduled right away.
    pub interval: Option<Duration>,
    /// Stop after this many runs. Without one the task runs until cancelled.
    pub repeat: Option<u64>,
}

impl Plan {
    pub fn once() -> Self {
        Self::default().times(1)
    }

    pub fn every(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            ..Self::default()
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn times(mut self, repeat: u64) -> Self {
        self.repeat = Some(repeat);
        self
    }
}

/// Runs `body` according to `plan` until it completes or `stop` fires.
/// Panics in `body` are reported to `sink` and the loop goes on. Returns true
/// if the plan ran to completion.
pub(crate) async fn drive<F, Fut>(
    plan: Plan,
    stop: &Stop,
    sink: &ErrorSink,
    mut body: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    if let Some(delay) = plan.delay {
        select! {
            _ = sleep(delay) => {}
            _ = stop.wait() => return false,
        }
    }
    let mut runs = 0u64;
    loop {
        if stop.fired() {
            return false;
        }
        let run = AssertUnwindSafe(async { body().await }).catch_unwind();
        if let Err(panic) = run.await {
            sink.report(Error::from_panic(panic));
        }
        runs += 1;
        if plan.repeat.map_or(false, |n| runs >= n) {
            return true;
        }
        match plan.interval {
            Some(interval) if !interval.is_zero() => select! {
                _ = sleep(interval) => {}
                _ = stop.wait() => return false,
            },
            _ => tokio::task::yield_now().await,
        }
    }
}

/// Handle to a delayed or repeating task.
#[derive(Clone)]
pub struct Scheduler {
    stop: Stop,
}

impl Scheduler {
    pub(crate) fn start<F, Fut>(
        task: F,
        plan: Plan,
        on_done: Option<super::Hook>,
        sink: ErrorSink,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = Stop::new();
        let handle = Self { stop: stop.clone() };
        tokio::spawn(async move {
            if drive(plan, &stop, &sink, task).await {
                if let Some(done) = on_done {
                    if let Err(panic) =
                        std::panic::catch_unwind(AssertUnwindSafe(done))
                    {
                        sink.report(Error::from_panic(panic));
                    }
                }
                stop.fire();
            }
        });
        handle
    }

    /// Stops the task before its next run. A run already in progress
    /// finishes.
    pub fn cancel(&self) {
        self.stop.fire();
    }

    pub fn cancelled(&self) -> bool {
        self.stop.fired()
    }
}
