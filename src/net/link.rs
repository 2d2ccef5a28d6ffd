use std::{net::SocketAddr, sync::Arc};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use quinn::{ConnectionError, ReadError, VarInt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};
use tokio_tungstenite::{
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::{
    frame::{self, FrameBuffer},
    quic, tcp, ws, Error, NetConfig, Protocol, Target,
};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of an axon's socket.
pub(crate) enum LinkWriter {
    Tcp(OwnedWriteHalf),
    Quic {
        conn: quinn::Connection,
        send: quinn::SendStream,
    },
    Ws(SplitSink<WsStream, Message>),
}

impl LinkWriter {
    /// Writes one payload, framed on stream transports.
    pub(crate) async fn send(&mut self, payload: &[u8]) -> Result<(), Error> {
        match self {
            LinkWriter::Tcp(half) => {
                half.write_all(&frame::encode(payload)?).await?
            }
            LinkWriter::Quic { send, .. } => {
                send.write_all(&frame::encode(payload)?).await?
            }
            LinkWriter::Ws(sink) => {
                sink.send(Message::Binary(payload.to_vec())).await?
            }
        }
        Ok(())
    }

    /// Writes bytes with no framing. Only the handshake acknowledgement
    /// travels this way.
    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        match self {
            LinkWriter::Tcp(half) => half.write_all(bytes).await?,
            LinkWriter::Quic { send, .. } => send.write_all(bytes).await?,
            LinkWriter::Ws(sink) => {
                sink.send(Message::Binary(bytes.to_vec())).await?
            }
        }
        Ok(())
    }

    /// Closes the socket. Errors are ignored, the link is gone either way.
    pub(crate) async fn close(&mut self) {
        match self {
            LinkWriter::Tcp(half) => {
                let _ = half.shutdown().await;
            }
            LinkWriter::Quic { conn, .. } => {
                conn.close(VarInt::from_u32(0), b"closed");
            }
            LinkWriter::Ws(sink) => {
                let _ = sink.close().await;
            }
        }
    }
}

/// Read half of an axon's socket.
pub(crate) enum LinkReader {
    Tcp {
        half: OwnedReadHalf,
        frames: FrameBuffer,
        buf: Vec<u8>,
    },
    Quic {
        recv: quinn::RecvStream,
        frames: FrameBuffer,
        buf: Vec<u8>,
    },
    Ws(SplitStream<WsStream>),
}

impl LinkReader {
    pub(crate) fn tcp(half: OwnedReadHalf, read_buffer: usize) -> Self {
        LinkReader::Tcp {
            half,
            frames: FrameBuffer::new(),
            buf: vec![0; read_buffer.max(frame::HEADER_LEN)],
        }
    }

    pub(crate) fn quic(recv: quinn::RecvStream, read_buffer: usize) -> Self {
        LinkReader::Quic {
            recv,
            frames: FrameBuffer::new(),
            buf: vec![0; read_buffer.max(frame::HEADER_LEN)],
        }
    }

    /// Next payload from the remote, or `None` once it has closed the link.
    pub(crate) async fn next(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match self {
            LinkReader::Tcp { half, frames, buf } => loop {
                if let Some(payload) = frames.next_frame() {
                    return Ok(Some(payload));
                }
                let n = half.read(buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                frames.push(&buf[..n]);
            },
            LinkReader::Quic { recv, frames, buf } => loop {
                if let Some(payload) = frames.next_frame() {
                    return Ok(Some(payload));
                }
                match recv.read(buf).await {
                    Ok(Some(n)) => frames.push(&buf[..n]),
                    Ok(None) => return Ok(None),
                    Err(ReadError::ConnectionLost(
                        ConnectionError::ApplicationClosed(_)
                        | ConnectionError::LocallyClosed,
                    )) => return Ok(None),
                    Err(e) => Err(e)?,
                }
            },
            LinkReader::Ws(stream) => loop {
                match stream.next().await {
                    None | Some(Ok(Message::Close(_))) => return Ok(None),
                    Some(Ok(Message::Binary(bytes))) => return Ok(Some(bytes)),
                    Some(Ok(Message::Text(text))) => {
                        return Ok(Some(text.into_bytes()))
                    }
                    // protocol-level ping/pong is answered by tungstenite
                    Some(Ok(_)) => continue,
                    Some(Err(
                        tungstenite::Error::ConnectionClosed
                        | tungstenite::Error::AlreadyClosed,
                    )) => return Ok(None),
                    Some(Err(e)) => Err(e)?,
                }
            },
        }
    }

    /// Reads the raw 5-byte handshake acknowledgement.
    pub(crate) async fn read_ack(&mut self) -> Result<[u8; 5], Error> {
        let mut ack = [0u8; 5];
        match self {
            LinkReader::Tcp { half, .. } => {
                half.read_exact(&mut ack).await?;
            }
            LinkReader::Quic { recv, .. } => {
                recv.read_exact(&mut ack).await?;
            }
            LinkReader::Ws(_) => {
                let msg = self.next().await?.ok_or(Error::Eof)?;
                if msg.len() != ack.len() {
                    Err(Error::Handshake(format!(
                        "acknowledgement of {} bytes",
                        msg.len()
                    )))?
                }
                ack.copy_from_slice(&msg);
            }
        }
        Ok(ack)
    }
}

/// A bound listening socket.
pub(crate) enum Listener {
    Tcp(TcpListener),
    Quic(quinn::Endpoint),
    Ws { listener: TcpListener, path: String },
}

/// A connection accepted but not yet upgraded to a link.
pub(crate) enum Incoming {
    Tcp(TcpStream),
    Quic(quinn::Connecting),
    Ws(TcpStream, Arc<str>),
}

impl Listener {
    /// Binds `target` and returns the listener with the port it got.
    pub(crate) async fn bind(
        target: &Target,
        config: &NetConfig,
    ) -> Result<(Self, u16), Error> {
        let listener = match target.proto {
            Protocol::Tcp => Listener::Tcp(tcp::bind(target).await?),
            Protocol::Quic => Listener::Quic(quic::bind(target, config).await?),
            Protocol::Ws => Listener::Ws {
                listener: tcp::bind(target).await?,
                path: target.path.clone(),
            },
        };
        let port = listener.local_addr()?.port();
        Ok((listener, port))
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(match self {
            Listener::Tcp(l) | Listener::Ws { listener: l, .. } => {
                l.local_addr()?
            }
            Listener::Quic(ep) => ep.local_addr()?,
        })
    }

    /// Waits for the next connection. `None` means the listener was closed.
    pub(crate) async fn accept(
        &self,
    ) -> Result<Option<(Incoming, SocketAddr)>, Error> {
        match self {
            Listener::Tcp(l) => {
                let (stream, remote) = l.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Some((Incoming::Tcp(stream), remote)))
            }
            Listener::Quic(ep) => Ok(ep.accept().await.map(|connecting| {
                let remote = connecting.remote_address();
                (Incoming::Quic(connecting), remote)
            })),
            Listener::Ws { listener, path } => {
                let (stream, remote) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Some((Incoming::Ws(stream, path.as_str().into()), remote)))
            }
        }
    }

    pub(crate) fn close(&self) {
        if let Listener::Quic(ep) = self {
            ep.close(VarInt::from_u32(0), b"shutdown");
        }
    }
}

impl Incoming {
    pub(crate) fn proto(&self) -> Protocol {
        match self {
            Incoming::Tcp(_) => Protocol::Tcp,
            Incoming::Quic(_) => Protocol::Quic,
            Incoming::Ws(..) => Protocol::Ws,
        }
    }

    /// Finishes the transport-level setup: the QUIC handshake and stream, or
    /// the WebSocket upgrade.
    pub(crate) async fn open(
        self,
        config: &NetConfig,
    ) -> Result<(LinkWriter, LinkReader), Error> {
        match self {
            Incoming::Tcp(stream) => Ok(tcp::split(stream, config.read_buffer)),
            Incoming::Quic(connecting) => {
                quic::accept(connecting, config.read_buffer).await
            }
            Incoming::Ws(stream, path) => ws::upgrade(stream, &path).await,
        }
    }
}
