use std::any::Any;

use serde::{de::DeserializeOwned, Serialize};

use super::RpcError;

/// Payload encoding of an exchange. Which one is used depends on whether
/// the remote node is a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Compact and fast, for traffic between trusted nodes.
    #[default]
    Bincode,
    /// Self-describing, for guests.
    Json,
}

impl Codec {
    pub fn encode<T: Serialize + ?Sized>(
        self,
        value: &T,
    ) -> Result<Vec<u8>, RpcError> {
        match self {
            Codec::Bincode => bincode::serialize(value)
                .map_err(|e| RpcError::Codec(e.to_string())),
            Codec::Json => serde_json::to_vec(value)
                .map_err(|e| RpcError::Codec(e.to_string())),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, RpcError> {
        match self {
            Codec::Bincode => bincode::deserialize(bytes)
                .map_err(|e| RpcError::ArgumentMismatch(e.to_string())),
            Codec::Json => serde_json::from_slice(bytes)
                .map_err(|e| RpcError::ArgumentMismatch(e.to_string())),
        }
    }
}

/// A value that can ride in an exchange, either as itself when caller and
/// callee share a node or encoded when they do not.
pub trait Message: Any + Send {
    fn encode(&self, codec: Codec) -> Result<Vec<u8>, RpcError>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Serialize + Any + Send> Message for T {
    fn encode(&self, codec: Codec) -> Result<Vec<u8>, RpcError> {
        codec.encode(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Body of an exchange.
pub(crate) enum Payload {
    Empty,
    /// An in-process value, never serialized.
    Local(Box<dyn Message>),
    Encoded(Vec<u8>),
}

impl Payload {
    /// Turns the payload into a `T`. A local value of exactly that type is
    /// moved out; anything else goes through `codec`. An empty body decodes
    /// only into types that encode to nothing, like `()` under bincode.
    pub(crate) fn take<T: DeserializeOwned + Any>(
        self,
        codec: Codec,
    ) -> Result<T, RpcError> {
        match self {
            Payload::Empty => codec.decode(&[]),
            Payload::Local(msg) if msg.as_any().is::<T>() => {
                match msg.into_any().downcast::<T>() {
                    Ok(value) => Ok(*value),
                    Err(_) => Err(RpcError::ArgumentMismatch(
                        std::any::type_name::<T>().to_string(),
                    )),
                }
            }
            Payload::Local(msg) => codec.decode(&msg.encode(codec)?),
            Payload::Encoded(bytes) => codec.decode(&bytes),
        }
    }

    pub(crate) fn to_bytes(&self, codec: Codec) -> Result<Vec<u8>, RpcError> {
        match self {
            Payload::Empty => Ok(Vec::new()),
            Payload::Local(msg) => msg.encode(codec),
            Payload::Encoded(bytes) => Ok(bytes.clone()),
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Empty => f.write_str("Empty"),
            Payload::Local(_) => f.write_str("Local(..)"),
            Payload::Encoded(bytes) => write!(f, "Encoded({} bytes)", bytes.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        msg: String,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Shout {
        msg: String,
    }

    #[test]
    fn local_values_move_without_encoding() {
        let payload = Payload::Local(Box::new(Ping { msg: "hi".into() }));
        let ping: Ping = payload.take(Codec::Json).unwrap();
        assert_eq!(ping.msg, "hi");
    }

    #[test]
    fn local_values_of_another_shape_are_converted() {
        let payload = Payload::Local(Box::new(Ping { msg: "hi".into() }));
        let shout: Shout = payload.take(Codec::Json).unwrap();
        assert_eq!(shout.msg, "hi");
    }

    #[test]
    fn both_codecs_decode_what_they_encode() {
        for codec in [Codec::Bincode, Codec::Json] {
            let bytes = codec.encode(&Ping { msg: "yo".into() }).unwrap();
            let back: Ping = Payload::Encoded(bytes).take(codec).unwrap();
            assert_eq!(back.msg, "yo");
        }
    }

    #[test]
    fn garbage_is_an_argument_mismatch() {
        let err = Payload::Encoded(b"{".to_vec())
            .take::<Ping>(Codec::Json)
            .unwrap_err();
        assert!(matches!(err, RpcError::ArgumentMismatch(_)));
        assert!(matches!(
            Payload::Empty.take::<Ping>(Codec::Json),
            Err(RpcError::ArgumentMismatch(_))
        ));
    }
}
