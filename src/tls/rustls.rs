#![cfg(feature = "tls-rustls")]

//! TLS session establishment over the pgwire SSLRequest negotiation.

use std::{fs::File, io::BufReader, sync::Arc};

use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};

use crate::config::{SslMode, TlsConfig};
use crate::error::{ReplicationError, Result};
use crate::protocol::framing::ssl_request;

pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// Negotiate TLS according to `tls.mode`.
///
/// Sends an SSLRequest and upgrades when the server answers `S`. `Prefer`
/// falls back to plaintext on refusal; stricter modes fail.
pub async fn maybe_upgrade(
    mut tcp: TcpStream,
    tls: &TlsConfig,
    host: &str,
) -> Result<MaybeTlsStream> {
    if tls.mode == SslMode::Disable {
        return Ok(MaybeTlsStream::Plain(tcp));
    }

    tcp.write_all(&ssl_request()).await?;
    tcp.flush().await?;
    let mut resp = [0u8; 1];
    tcp.read_exact(&mut resp).await?;

    if resp[0] != b'S' {
        return match tls.mode {
            SslMode::Prefer => Ok(MaybeTlsStream::Plain(tcp)),
            _ => Err(ReplicationError::Tls(
                "server does not support TLS (SSLRequest rejected)".into(),
            )),
        };
    }

    let cfg = client_config(tls, host)?;
    let connector = TlsConnector::from(Arc::new(cfg));

    let sni = tls.sni_hostname.as_deref().unwrap_or(host);
    let server_name = rustls::pki_types::ServerName::try_from(sni.to_string())
        .map_err(|_| ReplicationError::Tls(format!("invalid SNI hostname '{sni}'")))?;

    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ReplicationError::Tls(format!("tls handshake failed: {e}")))?;

    Ok(MaybeTlsStream::Tls(Box::new(stream)))
}

/// Verification semantics:
/// - VerifyFull: verify chain + hostname (rustls default verifier)
/// - VerifyCa: verify chain, ignore hostname mismatch
/// - Prefer/Require: encryption only, no verification
fn client_config(tls: &TlsConfig, host: &str) -> Result<ClientConfig> {
    if matches!(tls.mode, SslMode::VerifyFull)
        && host.parse::<std::net::IpAddr>().is_ok()
        && tls.sni_hostname.is_none()
    {
        return Err(ReplicationError::Tls(format!(
            "sslmode verify-full with IP host '{host}': use a DNS name matching the \
             certificate, set sni_hostname, or use verify-ca"
        )));
    }

    let roots = load_roots(tls)?;
    let roots_arc = Arc::new(roots.clone());
    let mut cfg = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    match tls.mode {
        SslMode::Prefer | SslMode::Require => {
            cfg.dangerous()
                .set_certificate_verifier(Arc::new(AcceptAnyCert));
        }
        SslMode::VerifyCa => {
            let inner = rustls::client::WebPkiServerVerifier::builder(roots_arc)
                .build()
                .map_err(|e| ReplicationError::Tls(format!("build verifier: {e}")))?;
            cfg.dangerous()
                .set_certificate_verifier(Arc::new(ChainOnlyVerifier { inner }));
        }
        SslMode::VerifyFull => {}
        SslMode::Disable => unreachable!("handled by caller"),
    }
    Ok(cfg)
}

fn load_roots(tls: &TlsConfig) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match &tls.ca_pem_path {
        Some(path) => {
            let f = File::open(path).map_err(|e| {
                ReplicationError::Tls(format!("failed to open CA PEM {}: {e}", path.display()))
            })?;
            let mut rd = BufReader::new(f);
            let certs = rustls_pemfile::certs(&mut rd)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| {
                    ReplicationError::Tls(format!(
                        "failed to parse CA PEM {}: {e}",
                        path.display()
                    ))
                })?;
            let (added, _ignored) = roots.add_parsable_certificates(certs);
            if added == 0 {
                return Err(ReplicationError::Tls(format!(
                    "no valid CA certificates found in {}",
                    path.display()
                )));
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }
    Ok(roots)
}

// ---------------- Verifiers ----------------

#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

#[derive(Debug)]
struct ChainOnlyVerifier {
    inner: Arc<dyn rustls::client::danger::ServerCertVerifier>,
}

impl rustls::client::danger::ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        intermediates: &[rustls::pki_types::CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        ocsp: &[u8],
        now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp, now)
        {
            Err(rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName)) => {
                // verify-ca keeps chain validation but not the hostname check.
                Ok(rustls::client::danger::ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
