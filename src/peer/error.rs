use thiserror::Error;

use crate::wire;

/// Errors an RPC caller can get back.
///
/// Errors raised on the serving side cross the wire as their `Display`
/// text; [`RpcError::from_wire`] turns the well-known ones back into their
/// variant so local and remote calls fail the same way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("malformed method name: {0}")]
    MalformedMethod(String),
    #[error("no such peer: {0}")]
    NoSuchPeer(String),
    #[error("no such method: {0}")]
    NoSuchMethod(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("argument mismatch: {0}")]
    ArgumentMismatch(String),
    /// The method ran and returned an error.
    #[error("{0}")]
    Handler(String),
    /// An error text from the serving side with no better match.
    #[error("{0}")]
    Remote(String),
    #[error("call timed out: {0}")]
    Timeout(String),
    #[error("peer disposed: {0}")]
    Disposed(String),
    #[error("peer already registered: {0}")]
    DuplicatePeer(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error(transparent)]
    Wire(#[from] wire::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

impl RpcError {
    /// Rebuilds an error from the text carried in a reply.
    pub fn from_wire(text: &str) -> Self {
        type Ctor = fn(String) -> RpcError;
        const KNOWN: &[(&str, Ctor)] = &[
            ("malformed method name: ", RpcError::MalformedMethod),
            ("no such peer: ", RpcError::NoSuchPeer),
            ("no such method: ", RpcError::NoSuchMethod),
            ("permission denied: ", RpcError::PermissionDenied),
            ("argument mismatch: ", RpcError::ArgumentMismatch),
            ("call timed out: ", RpcError::Timeout),
            ("peer disposed: ", RpcError::Disposed),
            ("codec error: ", RpcError::Codec),
        ];
        for (prefix, ctor) in KNOWN {
            if let Some(rest) = text.strip_prefix(prefix) {
                return ctor(rest.to_string());
            }
        }
        RpcError::Remote(text.to_string())
    }
}

impl From<crate::net::Error> for RpcError {
    fn from(err: crate::net::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}
