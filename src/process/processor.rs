use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use super::TableInner;
use crate::error::{Error, ErrorSink};

type Task = BoxFuture<'static, ()>;

struct Worker {
    tx: mpsc::Sender<Task>,
    capacity: usize,
}

impl Worker {
    fn boot(capacity: usize, sink: ErrorSink) -> Self {
        let (tx, mut rx) = mpsc::channel::<Task>(capacity);
        tokio::spawn(async move {
            // runs until every sender is gone and the queue is drained
            while let Some(task) = rx.recv().await {
                run_guarded(task, &sink).await;
            }
        });
        Self { tx, capacity }
    }

    fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }
}

async fn run_guarded(task: Task, sink: &ErrorSink) {
    if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
        sink.report(Error::from_panic(panic));
    }
}

struct ProcessorInner {
    pid: u64,
    multi: usize,
    // None once terminated; dropping the senders lets workers drain and stop
    workers: RwLock<Option<Vec<Worker>>>,
    sink: ErrorSink,
    table: Weak<TableInner>,
}

/// A pool of workers, each consuming its own bounded task queue.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

impl Processor {
    pub(super) fn new(
        pid: u64,
        multi: usize,
        capacity: usize,
        sink: ErrorSink,
        table: Weak<TableInner>,
    ) -> Self {
        let capacity = capacity.max(1);
        let workers = (0..multi)
            .map(|_| Worker::boot(capacity, sink.clone()))
            .collect();
        Self {
            inner: Arc::new(ProcessorInner {
                pid,
                multi,
                workers: RwLock::new(Some(workers)),
                sink,
                table,
            }),
        }
    }

    pub fn pid(&self) -> u64 {
        self.inner.pid
    }

    /// Submits a task. Returns false without running it if the processor has
    /// been terminated. Waits for room when the chosen queue is full.
    pub async fn execute<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = {
            let workers = self.inner.workers.read();
            let Some(workers) = workers.as_ref() else {
                return false;
            };
            match workers.len() {
                0 => None,
                1 => Some(workers[0].tx.clone()),
                _ => {
                    // shortest queue wins, the first one on ties
                    let mut best = &workers[0];
                    for worker in &workers[1..] {
                        if worker.queued() < best.queued() {
                            best = worker;
                        }
                    }
                    Some(best.tx.clone())
                }
            }
        };
        match tx {
            None => {
                run_guarded(task.boxed(), &self.inner.sink).await;
                true
            }
            Some(tx) => tx.send(task.boxed()).await.is_ok(),
        }
    }

    /// Stops accepting tasks and lets every worker finish what it has queued.
    /// Only the first call has any effect.
    pub fn terminate(&self) {
        if self.inner.workers.write().take().is_none() {
            return;
        }
        if let Some(table) = self.inner.table.upgrade() {
            table.remove(self.inner.pid);
        }
        trace!(pid = self.inner.pid, "processor terminated");
    }

    pub fn running(&self) -> bool {
        self.inner.workers.read().is_some()
    }

    /// Tasks queued across all workers and not yet picked up.
    pub fn task_len(&self) -> usize {
        self.inner
            .workers
            .read()
            .as_ref()
            .map_or(0, |ws| ws.iter().map(Worker::queued).sum())
    }

    pub fn coroutine_num(&self) -> usize {
        self.inner.multi
    }
}
