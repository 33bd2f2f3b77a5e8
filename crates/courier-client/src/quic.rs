//! QUIC connector.
//!
//! Each outbound frame travels on its own bidirectional stream; the relay
//! pushes frames on unidirectional streams. This layer only moves frames:
//! everything else lives in [`Transport`](crate::Transport).

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::BytesMut;
use courier_proto::{Frame, FrameHeader};
use quinn::{ClientConfig, Endpoint, RecvStream, SendStream};
use tokio::sync::mpsc;

use crate::{
    error::TransportError,
    transport::{Connector, Link, LinkEvent},
};

/// ALPN protocol id spoken by the relay.
pub const ALPN: &[u8] = b"courier";

const LINK_BUFFER: usize = 64;
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Opens QUIC links to the relay.
pub struct QuicConnector {
    server_name: String,
    client_config: ClientConfig,
}

impl QuicConnector {
    /// Connector verifying the relay certificate against `roots`.
    pub fn with_roots(
        server_name: impl Into<String>,
        roots: rustls::RootCertStore,
    ) -> Result<Self, TransportError> {
        let crypto = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self { server_name: server_name.into(), client_config: client_config(crypto)? })
    }

    /// Connector that accepts any relay certificate.
    ///
    /// Development only: a relay with a self-signed certificate is
    /// indistinguishable from an attacker.
    pub fn insecure(server_name: impl Into<String>) -> Result<Self, TransportError> {
        tracing::warn!("relay certificate verification disabled");
        let crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth();
        Ok(Self { server_name: server_name.into(), client_config: client_config(crypto)? })
    }
}

fn client_config(mut crypto: rustls::ClientConfig) -> Result<ClientConfig, TransportError> {
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| TransportError::Connection(format!("invalid TLS config: {e}")))?;
    let mut config = ClientConfig::new(Arc::new(quic));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(IDLE_TIMEOUT.try_into().ok());
    config.transport_config(Arc::new(transport));

    Ok(config)
}

#[async_trait]
impl Connector for QuicConnector {
    async fn connect(&self, relay_address: &str) -> Result<Link, TransportError> {
        let addr: SocketAddr = relay_address
            .parse()
            .map_err(|e| TransportError::Connection(format!("invalid address: {e}")))?;

        let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
            .map_err(|e| TransportError::Connection(format!("endpoint creation failed: {e}")))?;
        endpoint.set_default_client_config(self.client_config.clone());

        let connection = endpoint
            .connect(addr, &self.server_name)
            .map_err(|e| TransportError::Connection(format!("connect failed: {e}")))?
            .await
            .map_err(|e| TransportError::Connection(format!("handshake failed: {e}")))?;

        let (to_relay_tx, to_relay_rx) = mpsc::channel::<Frame>(LINK_BUFFER);
        let (from_relay_tx, from_relay_rx) = mpsc::channel::<LinkEvent>(LINK_BUFFER);

        let handle = tokio::spawn(run_connection(connection, to_relay_rx, from_relay_tx));

        Ok(Link::new(to_relay_tx, from_relay_rx).with_abort(handle.abort_handle()))
    }
}

/// Bridge the link channels and the QUIC connection until either side ends.
async fn run_connection(
    connection: quinn::Connection,
    mut to_relay: mpsc::Receiver<Frame>,
    from_relay: mpsc::Sender<LinkEvent>,
) {
    let conn_recv = connection.clone();
    let events = from_relay.clone();
    let mut receiver = tokio::spawn(async move {
        loop {
            match conn_recv.accept_uni().await {
                Ok(recv) => {
                    let events = events.clone();
                    tokio::spawn(async move {
                        match read_frame(recv).await {
                            Ok(frame) => {
                                let _ = events.send(LinkEvent::Frame(frame)).await;
                            },
                            Err(e) => tracing::warn!(error = %e, "incoming stream error"),
                        }
                    });
                },
                Err(e) => return close_code(&e),
            }
        }
    });

    let code = loop {
        tokio::select! {
            outbound = to_relay.recv() => {
                let Some(frame) = outbound else {
                    // Transport dropped the link
                    connection.close(0u32.into(), b"client closed");
                    receiver.abort();
                    return;
                };
                match connection.open_bi().await {
                    Ok((send, _recv)) => {
                        if let Err(e) = write_frame(send, &frame).await {
                            tracing::warn!(error = %e, "send error");
                        }
                    },
                    Err(e) => {
                        receiver.abort();
                        break close_code(&e);
                    },
                }
            },
            closed = &mut receiver => break closed.unwrap_or(None),
        }
    };

    tracing::debug!(?code, "QUIC connection ended");
    let _ = from_relay.send(LinkEvent::Closed { code }).await;
}

fn close_code(error: &quinn::ConnectionError) -> Option<u32> {
    match error {
        quinn::ConnectionError::ApplicationClosed(close) => {
            u32::try_from(close.error_code.into_inner()).ok()
        },
        _ => None,
    }
}

/// Read one frame from a relay-initiated stream.
async fn read_frame(mut recv: RecvStream) -> Result<Frame, TransportError> {
    let mut buf = BytesMut::zeroed(FrameHeader::SIZE);
    recv.read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::Connection(format!("header read failed: {e}")))?;

    let payload_size = FrameHeader::from_bytes(&buf)?.payload_size() as usize;
    if payload_size > 0 {
        buf.resize(FrameHeader::SIZE + payload_size, 0);
        recv.read_exact(&mut buf[FrameHeader::SIZE..])
            .await
            .map_err(|e| TransportError::Connection(format!("payload read failed: {e}")))?;
    }

    Ok(Frame::decode(&buf)?)
}

/// Write one frame and finish the stream.
async fn write_frame(mut send: SendStream, frame: &Frame) -> Result<(), TransportError> {
    let buf = frame.to_vec()?;
    send.write_all(&buf)
        .await
        .map_err(|e| TransportError::Connection(format!("write failed: {e}")))?;
    send.finish().map_err(|e| TransportError::Connection(format!("finish failed: {e}")))?;
    Ok(())
}

/// Certificate verifier that accepts anything. See
/// [`QuicConnector::insecure`].
#[derive(Debug)]
struct AcceptAnyCertificate;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
