use std::{any::Any, backtrace::Backtrace, fmt, sync::Arc};

use thiserror::Error;
use tracing::error;

/// Everything that can end up in the process-wide [`ErrorSink`].
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Net(#[from] crate::net::Error),
    #[error(transparent)]
    Rpc(#[from] crate::peer::RpcError),
    #[error(transparent)]
    Wire(#[from] crate::wire::Error),
    /// A scheduled task panicked. The scheduling unit that ran it keeps going.
    #[error("task panicked: {message}\n{backtrace}")]
    Panic { message: String, backtrace: String },
    #[error("registry error: {0}")]
    Registry(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Converts a payload caught by `catch_unwind` into a reportable error,
    /// capturing the stack of the recovery point.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Error::Panic {
            message,
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Error::Panic { .. })
    }
}

/// The single place where errors nobody is waiting for are delivered: task
/// panics, failed fire-and-forget events, connection errors before admission.
#[derive(Clone)]
pub struct ErrorSink(Arc<dyn Fn(Error) + Send + Sync>);

impl ErrorSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn report(&self, err: impl Into<Error>) {
        (self.0)(err.into())
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new(|err| error!("{}", err))
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorSink")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn panic_payloads_keep_their_message() {
        let err = Error::from_panic(Box::new("boom"));
        assert!(matches!(&err, Error::Panic { message, .. } if message == "boom"));

        let err = Error::from_panic(Box::new(String::from("owned boom")));
        assert!(matches!(&err, Error::Panic { message, .. } if message == "owned boom"));

        let err = Error::from_panic(Box::new(42u32));
        assert!(err.is_panic());
    }

    #[test]
    fn sink_forwards_to_the_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            ErrorSink::new(move |err| seen.lock().push(err.to_string()))
        };
        sink.report(Error::Config("missing endpoint".into()));
        assert_eq!(seen.lock().as_slice(), ["invalid configuration: missing endpoint"]);
    }
}
