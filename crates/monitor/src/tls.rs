//! Server certificate loading

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use monitor_lib::{config::TlsConfig, TlsMode};
use rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Distribution snakeoil pair, preferred for self-signed mode when present
pub const SNAKEOIL_CERT: &str = "/etc/ssl/certs/ssl-cert-snakeoil.pem";
pub const SNAKEOIL_KEY: &str = "/etc/ssl/private/ssl-cert-snakeoil.key";

/// Build the TLS acceptor for the configured mode; `None` means plain HTTP
pub fn acceptor(config: &TlsConfig) -> Result<Option<TlsAcceptor>> {
    let (certs, key) = match config.mode {
        TlsMode::None => return Ok(None),
        TlsMode::Custom => {
            let cert = config
                .cert_file
                .as_deref()
                .ok_or_else(|| anyhow!("tls.cert_file is required in custom mode"))?;
            let key = config
                .key_file
                .as_deref()
                .ok_or_else(|| anyhow!("tls.key_file is required in custom mode"))?;
            load_pem_pair(cert, key)?
        }
        TlsMode::SelfSigned => {
            let (cert, key) = (Path::new(SNAKEOIL_CERT), Path::new(SNAKEOIL_KEY));
            if cert.exists() && key.exists() {
                info!(cert = %cert.display(), "Using snakeoil certificate");
                load_pem_pair(cert, key)?
            } else {
                info!("Snakeoil certificate not found, generating self-signed certificate");
                generate_self_signed()?
            }
        }
    };

    let server = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid server certificate or key")?;
    Ok(Some(TlsAcceptor::from(Arc::new(server))))
}

/// Read a PEM certificate chain and the first private key found in `key_path`
pub fn load_pem_pair(cert_path: &Path, key_path: &Path) -> Result<(Vec<Certificate>, PrivateKey)> {
    let mut reader = BufReader::new(
        File::open(cert_path)
            .with_context(|| format!("failed to open certificate {}", cert_path.display()))?,
    );
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut reader)
        .with_context(|| format!("failed to parse certificate {}", cert_path.display()))?
        .into_iter()
        .map(Certificate)
        .collect();
    if certs.is_empty() {
        return Err(anyhow!("no certificates in {}", cert_path.display()));
    }

    let mut reader = BufReader::new(
        File::open(key_path)
            .with_context(|| format!("failed to open key {}", key_path.display()))?,
    );
    let items = rustls_pemfile::read_all(&mut reader)
        .with_context(|| format!("failed to parse key {}", key_path.display()))?;
    let key = items
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::PKCS8Key(k)
            | rustls_pemfile::Item::RSAKey(k)
            | rustls_pemfile::Item::ECKey(k) => Some(PrivateKey(k)),
            _ => None,
        })
        .ok_or_else(|| anyhow!("no private key in {}", key_path.display()))?;

    Ok((certs, key))
}

/// In-memory certificate for when no key material is on disk
pub fn generate_self_signed() -> Result<(Vec<Certificate>, PrivateKey)> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("failed to generate self-signed certificate")?;
    let der = cert
        .serialize_der()
        .context("failed to serialize self-signed certificate")?;
    Ok((
        vec![Certificate(der)],
        PrivateKey(cert.serialize_private_key_der()),
    ))
}
