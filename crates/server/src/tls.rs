//! Builds a `rustls` server config from the certificate/key paths in
//! `session_options`.

use std::path::Path;
use std::sync::Arc;

use feathermail_config::SessionOptions;
use tokio_rustls::TlsAcceptor;

#[derive(Debug, thiserror::Error)]
pub enum TlsSetupError {
    #[error("TLS enabled but certfile/keyfile not configured")]
    MissingMaterial,
    #[error("failed to read `{0}`: {1}")]
    Read(std::path::PathBuf, #[source] std::io::Error),
    #[error("no certificates found in certfile")]
    NoCertificates,
    #[error("no private key found in keyfile")]
    NoPrivateKey,
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

fn load_certs(path: &Path) -> Result<Vec<rustls::Certificate>, TlsSetupError> {
    let file = std::fs::read(path).map_err(|error| TlsSetupError::Read(path.to_path_buf(), error))?;
    let mut reader = std::io::Cursor::new(file);
    let certs = rustls_pemfile::certs(&mut reader).map_err(|error| TlsSetupError::Read(path.to_path_buf(), error))?;
    if certs.is_empty() {
        return Err(TlsSetupError::NoCertificates);
    }
    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_key(path: &Path) -> Result<rustls::PrivateKey, TlsSetupError> {
    let file = std::fs::read(path).map_err(|error| TlsSetupError::Read(path.to_path_buf(), error))?;
    let mut reader = std::io::Cursor::new(file);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|error| TlsSetupError::Read(path.to_path_buf(), error))?;
    keys.into_iter().next().map(rustls::PrivateKey).ok_or(TlsSetupError::NoPrivateKey)
}

/// Builds a `TlsAcceptor` from `session_options`, for use on STARTTLS.
///
/// Returns `Ok(None)` when the configured TLS mode is `never` (no
/// certificate material required); callers should treat a `never` server
/// as never advertising or accepting STARTTLS.
pub fn build_acceptor(session_options: &SessionOptions) -> Result<Option<TlsAcceptor>, TlsSetupError> {
    use feathermail_pipeline::TlsMode;
    if session_options.tls_mode == TlsMode::Never {
        return Ok(None);
    }

    let certfile = session_options.certfile.as_deref().ok_or(TlsSetupError::MissingMaterial)?;
    let keyfile = session_options.keyfile.as_deref().ok_or(TlsSetupError::MissingMaterial)?;

    let certs = load_certs(certfile)?;
    let key = load_key(keyfile)?;

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
