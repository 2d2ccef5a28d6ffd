use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    accept_hdr_async, connect_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
    MaybeTlsStream,
};
use tracing::{debug, warn};

use super::{
    link::{LinkReader, LinkWriter, WsStream},
    Error, Target,
};

fn split(stream: WsStream) -> (LinkWriter, LinkReader) {
    let (sink, stream) = stream.split();
    (LinkWriter::Ws(sink), LinkReader::Ws(stream))
}

pub(crate) async fn dial(
    target: &Target,
) -> Result<(LinkWriter, LinkReader), Error> {
    let (stream, _) = connect_async(target.to_string()).await?;
    debug!("websocket upgraded");
    Ok(split(stream))
}

/// Upgrades an accepted socket, refusing requests for any path other than
/// the one the listener was bound to.
pub(crate) async fn upgrade(
    stream: TcpStream,
    path: &str,
) -> Result<(LinkWriter, LinkReader), Error> {
    let expected = path.to_string();
    let check_path = move |req: &Request, resp: Response| {
        if req.uri().path() == expected {
            return Ok(resp);
        }
        warn!(path = req.uri().path(), "websocket request for unknown path");
        let mut refusal = ErrorResponse::new(Some("not found".to_string()));
        *refusal.status_mut() = StatusCode::NOT_FOUND;
        Err(refusal)
    };
    let stream =
        accept_hdr_async(MaybeTlsStream::Plain(stream), check_path).await?;
    debug!("websocket upgraded");
    Ok(split(stream))
}
