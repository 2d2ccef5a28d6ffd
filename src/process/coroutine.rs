use std::{future::Future, panic::AssertUnwindSafe};

use futures::FutureExt;
use tokio::sync::oneshot;

use crate::error::{Error, ErrorSink};

/// The pending result of a one-shot task.
pub struct Coroutine<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
}

impl<T: Send + 'static> Coroutine<T> {
    pub(super) fn spawn<Fut>(task: Fut, sink: ErrorSink) -> Self
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(value) => Ok(value),
                Err(panic) => {
                    let (message, backtrace) =
                        match Error::from_panic(panic) {
                            Error::Panic { message, backtrace } => {
                                (message, backtrace)
                            }
                            other => (other.to_string(), String::new()),
                        };
                    sink.report(Error::Panic {
                        message: message.clone(),
                        backtrace: backtrace.clone(),
                    });
                    Err(Error::Panic { message, backtrace })
                }
            };
            let _ = tx.send(result);
        });
        Self { rx }
    }

    /// Waits for the task to finish.
    pub async fn sync(self) -> Result<T, Error> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Panic {
                message: "coroutine dropped before completing".into(),
                backtrace: String::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::process::ProcessTable;

    #[tokio::test]
    async fn yields_the_task_result() {
        let table = ProcessTable::default();
        let co = table.go(async { 6 * 7 });
        assert_eq!(co.sync().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let table = ProcessTable::default();
        let co = table.go(async {
            if true {
                panic!("no answer");
            }
            0u8
        });
        let err = co.sync().await.unwrap_err();
        assert!(err.is_panic());
        assert!(err.to_string().contains("no answer"));
    }
}
