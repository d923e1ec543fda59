//! Loads a PEM certificate chain and private key into a [`TlsAcceptor`] for
//! SMTP STARTTLS / POP3 STLS upgrades.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

pub fn load_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let cert_file = File::open(cert_path).with_context(|| format!("opening TLS certificate {cert_path}"))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect::<Result<_, _>>().with_context(|| format!("parsing TLS certificate {cert_path}"))?;

    let key_file = File::open(key_path).with_context(|| format!("opening TLS private key {key_path}"))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("parsing TLS private key {key_path}"))?
        .ok_or_else(|| anyhow!("no private key found in {key_path}"))?;

    let server_config = ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key).context("building TLS server configuration")?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
