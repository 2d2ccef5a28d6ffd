use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::debug;

use super::{
    frame::Control,
    link::{LinkReader, LinkWriter},
    Error, Protocol, HEADER_PREFIX,
};

/// First payload a dialer sends: which protocol it speaks and who it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "Header")]
    pub header: String,
    #[serde(rename = "Origin")]
    pub origin: String,
}

impl Hello {
    pub fn new(proto: Protocol, origin: impl Into<String>) -> Self {
        Self {
            header: proto.header(),
            origin: origin.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|e| Error::Handshake(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let hello: Hello = serde_json::from_slice(bytes)
            .map_err(|e| Error::Handshake(format!("malformed hello: {e}")))?;
        if !hello.header.starts_with(HEADER_PREFIX) {
            Err(Error::Handshake(format!(
                "unexpected header {:?}",
                hello.header
            )))?
        }
        Ok(hello)
    }
}

/// Dialer side: sends the hello and waits for the acknowledgement.
pub(crate) async fn offer(
    writer: &mut LinkWriter,
    reader: &mut LinkReader,
    proto: Protocol,
    origin: &str,
    timeout: Duration,
) -> Result<(), Error> {
    writer.send(&Hello::new(proto, origin).encode()?).await?;
    debug!("sent hello, waiting for acknowledgement");
    let ack = time::timeout(timeout, reader.read_ack())
        .await
        .map_err(|_| Error::HandshakeTimeout)??;
    if Control::parse(&ack) != Some(Control::HandshakeAck) {
        Err(Error::Handshake(format!(
            "unexpected acknowledgement {:?}",
            String::from_utf8_lossy(&ack)
        )))?
    }
    debug!("handshake acknowledged");
    Ok(())
}

/// Acceptor side: waits for the dialer's hello.
pub(crate) async fn receive(
    reader: &mut LinkReader,
    proto: Protocol,
    timeout: Duration,
) -> Result<Hello, Error> {
    let msg = time::timeout(timeout, reader.next())
        .await
        .map_err(|_| Error::HandshakeTimeout)??
        .ok_or(Error::Eof)?;
    let hello = Hello::decode(&msg)?;
    if hello.header != proto.header() {
        Err(Error::Handshake(format!(
            "{} hello on a {} listener",
            hello.header, proto
        )))?
    }
    debug!(origin = %hello.origin, "received hello");
    Ok(hello)
}
