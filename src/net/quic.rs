use std::{
    io::{BufReader, Cursor},
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, SystemTime},
};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, PrivateKey, ServerName,
};
use tracing::debug;

use super::{
    link::{LinkReader, LinkWriter},
    Error, NetConfig, Target,
};

/// Server name presented when dialing. Certificates are not checked against
/// it; axons authenticate each other through the handshake origin.
const SERVER_NAME: &str = "localhost";

/// Transport settings shared by the server and client sides: quinn's
/// defaults with the BBR congestion controller, and QUIC keep-alives at the
/// heartbeat rate so idle axons are not timed out underneath the heartbeat.
fn transport_config(config: &NetConfig) -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    let bbr_config = quinn::congestion::BbrConfig::default();
    transport.congestion_controller_factory(Arc::new(bbr_config));
    transport.keep_alive_interval(Some(
        config.heartbeat_interval.max(Duration::from_millis(100)),
    ));
    Arc::new(transport)
}

/// Loads the configured PEM certificate and key, or generates a self-signed
/// pair for `localhost`.
fn identity(
    config: &NetConfig,
) -> Result<(Vec<Certificate>, PrivateKey), Error> {
    match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => {
            let certs =
                rustls_pemfile::certs(&mut BufReader::new(Cursor::new(cert)))?;
            let mut keys = rustls_pemfile::pkcs8_private_keys(
                &mut BufReader::new(Cursor::new(key)),
            )?;
            if keys.len() != 1 {
                Err(rustls::Error::General(format!(
                    "expected exactly one private key, found {}",
                    keys.len()
                )))?
            }
            Ok((
                certs.into_iter().map(Certificate).collect(),
                PrivateKey(keys.remove(0)),
            ))
        }
        _ => {
            debug!("generating self-signed certificate");
            let cert =
                rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])?;
            Ok((
                vec![Certificate(cert.serialize_der()?)],
                PrivateKey(cert.serialize_private_key_der()),
            ))
        }
    }
}

pub(crate) async fn bind(
    target: &Target,
    config: &NetConfig,
) -> Result<quinn::Endpoint, Error> {
    let addr = resolve(target).await?;
    let (certs, key) = identity(config)?;
    let mut server_config = quinn::ServerConfig::with_single_cert(certs, key)?;
    server_config.transport_config(transport_config(config));
    Ok(quinn::Endpoint::server(server_config, addr)?)
}

/// A client-only endpoint all outgoing QUIC axons share.
pub(crate) fn client(config: &NetConfig) -> Result<quinn::Endpoint, Error> {
    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(transport_config(config));
    let mut ep =
        quinn::Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    ep.set_default_client_config(client_config);
    Ok(ep)
}

pub(crate) async fn dial(
    ep: &quinn::Endpoint,
    target: &Target,
    read_buffer: usize,
) -> Result<(LinkWriter, LinkReader), Error> {
    let addr = resolve(target).await?;
    let conn = ep.connect(addr, SERVER_NAME)?.await?;
    debug!("connected via QUIC");
    let (send, recv) = conn.open_bi().await?;
    Ok((
        LinkWriter::Quic { conn, send },
        LinkReader::quic(recv, read_buffer),
    ))
}

pub(crate) async fn accept(
    connecting: quinn::Connecting,
    read_buffer: usize,
) -> Result<(LinkWriter, LinkReader), Error> {
    let conn = connecting.await?;
    debug!("connected via QUIC, waiting for the dialer's stream");
    let (send, recv) = conn.accept_bi().await?;
    Ok((
        LinkWriter::Quic { conn, send },
        LinkReader::quic(recv, read_buffer),
    ))
}

async fn resolve(target: &Target) -> Result<SocketAddr, Error> {
    tokio::net::lookup_host(target.addr.as_str())
        .await?
        .next()
        .ok_or_else(|| Error::InvalidUrl(target.to_string()))
}

struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_identity_when_unconfigured() {
        let (certs, key) = identity(&NetConfig::default()).unwrap();
        assert_eq!(certs.len(), 1);
        assert!(!key.0.is_empty());
    }

    #[test]
    fn key_count_is_checked() {
        let config = NetConfig::builder()
            .tls_cert(b"".to_vec())
            .tls_key(b"".to_vec())
            .build();
        assert!(matches!(identity(&config), Err(Error::Tls(_))));
    }
}
