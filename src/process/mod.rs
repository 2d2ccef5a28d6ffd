//! Scheduling units.
//!
//! Every long-lived task in a node runs inside one of the units owned by a
//! [`ProcessTable`]: a [`Service`] is a single loop, a [`Processor`] is a pool
//! of workers fed through bounded queues, a [`Scheduler`] is a delayed or
//! repeating timer and a [`Coroutine`] is a one-shot task with a result. Task
//! bodies never take their unit down; a panic is caught at the unit boundary
//! and handed to the table's [`ErrorSink`].

mod channel;
mod coroutine;
mod processor;
mod scheduler;
mod service;

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::error::ErrorSink;

pub use channel::Channel;
pub use coroutine::Coroutine;
pub use processor::Processor;
pub use scheduler::{Plan, Scheduler};
pub use service::Service;

pub(crate) use scheduler::Stop;

/// A callback run once when a unit or plan finishes.
pub type Hook = Box<dyn FnOnce() + Send>;

/// A registered scheduling unit.
#[derive(Clone)]
enum Unit {
    Processor(Processor),
    Service(Service),
}

impl Unit {
    fn terminate(&self) {
        match self {
            Unit::Processor(p) => p.terminate(),
            Unit::Service(s) => s.terminate(),
        }
    }

    fn coroutine_num(&self) -> usize {
        match self {
            Unit::Processor(p) => p.coroutine_num(),
            Unit::Service(_) => 1,
        }
    }
}

pub(crate) struct TableInner {
    units: RwLock<HashMap<u64, Unit>>,
    channels: RwLock<HashMap<String, Channel>>,
    next_pid: AtomicU64,
    sink: ErrorSink,
}

impl TableInner {
    pub(crate) fn remove(&self, pid: u64) {
        if self.units.write().remove(&pid).is_some() {
            trace!(pid, "process removed");
        }
    }
}

/// Owns every scheduling unit of a node and the error sink their panics go
/// to. Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct ProcessTable {
    inner: Arc<TableInner>,
}

impl ProcessTable {
    pub fn new(sink: ErrorSink) -> Self {
        Self {
            inner: Arc::new(TableInner {
                units: RwLock::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
                next_pid: AtomicU64::new(1),
                sink,
            }),
        }
    }

    pub fn sink(&self) -> &ErrorSink {
        &self.inner.sink
    }

    fn next_pid(&self) -> u64 {
        self.inner.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    fn handle(&self) -> Weak<TableInner> {
        Arc::downgrade(&self.inner)
    }

    /// Spawns a processor with a single worker whose queue holds `capacity`
    /// tasks.
    pub fn spawn(&self, capacity: usize) -> Processor {
        self.spawn_multi(1, capacity)
    }

    /// Spawns a processor with `workers` workers. With zero workers every
    /// task runs inline on the caller.
    pub fn spawn_multi(&self, workers: usize, capacity: usize) -> Processor {
        let pid = self.next_pid();
        let processor = Processor::new(
            pid,
            workers,
            capacity,
            self.inner.sink.clone(),
            self.handle(),
        );
        self.inner
            .units
            .write()
            .insert(pid, Unit::Processor(processor.clone()));
        trace!(pid, workers, capacity, "processor spawned");
        processor
    }

    pub fn spawn_service(&self) -> Service {
        let pid = self.next_pid();
        let service =
            Service::new(pid, self.inner.sink.clone(), self.handle());
        self.inner
            .units
            .write()
            .insert(pid, Unit::Service(service.clone()));
        trace!(pid, "service spawned");
        service
    }

    /// Runs `task` according to `plan`. `on_done` fires after the final
    /// repetition of a plan with a repeat count.
    pub fn schedule<F, Fut>(
        &self,
        task: F,
        plan: Plan,
        on_done: Option<Hook>,
    ) -> Scheduler
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Scheduler::start(task, plan, on_done, self.inner.sink.clone())
    }

    /// Runs a one-shot task whose result can be awaited later.
    pub fn go<Fut>(&self, task: Fut) -> Coroutine<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        Coroutine::spawn(task, self.inner.sink.clone())
    }

    pub fn processor(&self, pid: u64) -> Option<Processor> {
        match self.inner.units.read().get(&pid) {
            Some(Unit::Processor(p)) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn service(&self, pid: u64) -> Option<Service> {
        match self.inner.units.read().get(&pid) {
            Some(Unit::Service(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Terminates the unit registered under `pid`, if any.
    pub fn kill(&self, pid: u64) {
        let unit = self.inner.units.read().get(&pid).cloned();
        if let Some(unit) = unit {
            unit.terminate();
        }
    }

    /// Number of live scheduling units.
    pub fn process_num(&self) -> usize {
        self.inner.units.read().len()
    }

    /// Number of worker loops across all live units. A service counts as one.
    pub fn coroutine_num(&self) -> usize {
        self.inner
            .units
            .read()
            .values()
            .map(Unit::coroutine_num)
            .sum()
    }

    /// Returns the named local channel, creating it on first use.
    pub fn channel(&self, name: &str) -> Channel {
        if let Some(ch) = self.inner.channels.read().get(name) {
            return ch.clone();
        }
        self.inner
            .channels
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Channel::new(name, self.inner.sink.clone()))
            .clone()
    }

    /// Drops every subscriber of the named channel and forgets it.
    pub fn close_channel(&self, name: &str) {
        if let Some(ch) = self.inner.channels.write().remove(name) {
            ch.unsubscribe_all();
        }
    }

    /// Terminates every live unit.
    pub fn shutdown(&self) {
        let units: Vec<Unit> =
            self.inner.units.read().values().cloned().collect();
        for unit in units {
            unit.terminate();
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new(ErrorSink::default())
    }
}
