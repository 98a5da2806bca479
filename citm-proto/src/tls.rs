//! TLS on both faces of the proxy: rustls client connections upstream,
//! and an acceptor for the operator-facing listener.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{ProtoError, TlsFailure};

/// Map a rustls error onto the compact failure taxonomy.
pub fn classify(err: &rustls::Error) -> TlsFailure {
    use rustls::CertificateError::*;
    match err {
        rustls::Error::InvalidCertificate(cert_err) => match cert_err {
            UnknownIssuer => TlsFailure::CaUnknown,
            Expired | NotValidYet => TlsFailure::CertExpired,
            NotValidForName => TlsFailure::HostnameMismatch,
            _ => TlsFailure::Handshake,
        },
        rustls::Error::NoCertificatesPresented => TlsFailure::NoCertPresented,
        rustls::Error::AlertReceived(_) => TlsFailure::Handshake,
        _ => TlsFailure::Other,
    }
}

fn io_to_tls(e: std::io::Error) -> ProtoError {
    match e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(tls_err) => ProtoError::Tls(classify(tls_err)),
        None => ProtoError::Os(e),
    }
}

fn root_store(extra_ca: Option<&Path>) -> Result<RootCertStore, ProtoError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = extra_ca {
        let pem = std::fs::read(path)?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert?;
            roots
                .add(cert)
                .map_err(|e| ProtoError::Param(format!("bad CA certificate: {e}")))?;
        }
    }
    Ok(roots)
}

/// Wrap an upstream TCP connection in verified TLS.  Verification
/// failures are fatal and never silently retried.
pub async fn connect(
    stream: TcpStream,
    hostname: &str,
    extra_ca: Option<&Path>,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ProtoError> {
    let config = ClientConfig::builder()
        .with_root_certificates(root_store(extra_ca)?)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(hostname.to_string())
        .map_err(|_| ProtoError::Param(format!("bad hostname: {hostname:?}")))?;
    connector.connect(name, stream).await.map_err(io_to_tls)
}

/// Build the acceptor for the downstream listener from PEM files.
pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ProtoError> {
    let cert_pem = std::fs::read(cert_path)?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(ProtoError::Param(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }
    let key_pem = std::fs::read(key_path)?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| ProtoError::Param(format!("no private key in {}", key_path.display())))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProtoError::Param(format!("bad certificate/key pair: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        use rustls::CertificateError;
        assert_eq!(
            classify(&rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)),
            TlsFailure::CaUnknown
        );
        assert_eq!(
            classify(&rustls::Error::InvalidCertificate(CertificateError::Expired)),
            TlsFailure::CertExpired
        );
        assert_eq!(
            classify(&rustls::Error::InvalidCertificate(CertificateError::NotValidForName)),
            TlsFailure::HostnameMismatch
        );
        assert_eq!(
            classify(&rustls::Error::NoCertificatesPresented),
            TlsFailure::NoCertPresented
        );
    }
}
