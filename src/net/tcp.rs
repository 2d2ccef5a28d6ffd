use tokio::net::{TcpListener, TcpStream};

use super::{
    link::{LinkReader, LinkWriter},
    Error, Target,
};

pub(crate) async fn bind(target: &Target) -> Result<TcpListener, Error> {
    Ok(TcpListener::bind(target.addr.as_str()).await?)
}

pub(crate) async fn dial(
    target: &Target,
    read_buffer: usize,
) -> Result<(LinkWriter, LinkReader), Error> {
    let stream = TcpStream::connect(target.addr.as_str()).await?;
    stream.set_nodelay(true)?;
    Ok(split(stream, read_buffer))
}

pub(crate) fn split(
    stream: TcpStream,
    read_buffer: usize,
) -> (LinkWriter, LinkReader) {
    let (read, write) = stream.into_split();
    (LinkWriter::Tcp(write), LinkReader::tcp(read, read_buffer))
}
