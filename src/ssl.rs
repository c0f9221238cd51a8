//! rustls configuration plumbing (§4.7): the one place `TlsConfig` turns
//! into `rustls::ClientConfig`/`ServerConfig`, including certificate, key,
//! CA bundle, and ALPN loading.

use crate::config::TlsConfig;
use crate::error::{Error, Result};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

pub fn build_client_config(cfg: &TlsConfig) -> Result<Arc<rustls::ClientConfig>> {
    let roots = load_roots(cfg)?;
    let builder = rustls::ClientConfig::builder().with_safe_defaults().with_root_certificates(roots);
    let mut config = if !cfg.cert_file.is_empty() && !cfg.key_file.is_empty() {
        let certs = load_certs(&cfg.cert_file)?;
        let key = load_key(&cfg.key_file)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::config(format!("client auth cert rejected: {e}")))?
    } else {
        builder.with_no_client_auth()
    };
    config.alpn_protocols = cfg.alpn_protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(Arc::new(config))
}

pub fn build_server_config(cfg: &TlsConfig) -> Result<Arc<rustls::ServerConfig>> {
    if cfg.cert_file.is_empty() || cfg.key_file.is_empty() {
        return Err(Error::config("tls server role requires cert_file and key_file"));
    }
    let certs = load_certs(&cfg.cert_file)?;
    let key = load_key(&cfg.key_file)?;
    let builder = rustls::ServerConfig::builder().with_safe_defaults();

    let mut config = if cfg.client_auth {
        let roots = load_roots(cfg)?;
        let verifier = rustls::server::AllowAnyAuthenticatedClient::new(roots);
        builder
            .with_client_cert_verifier(Arc::new(verifier))
            .with_single_cert(certs, key)
            .map_err(|e| Error::config(format!("invalid server cert/key: {e}")))?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::config(format!("invalid server cert/key: {e}")))?
    };
    config.alpn_protocols = cfg.alpn_protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(Arc::new(config))
}

fn load_roots(cfg: &TlsConfig) -> Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    if let Some(ca_file) = &cfg.ca_file {
        let mut reader = BufReader::new(
            File::open(ca_file).map_err(|e| Error::config(format!("cannot open ca_file {ca_file}: {e}")))?,
        );
        let certs = rustls_pemfile::certs(&mut reader)
            .map_err(|e| Error::config(format!("invalid ca_file {ca_file}: {e}")))?;
        for cert in certs {
            roots
                .add(&rustls::Certificate(cert))
                .map_err(|e| Error::config(format!("invalid CA certificate in {ca_file}: {e}")))?;
        }
    } else {
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
    }
    Ok(roots)
}

fn load_certs(path: &str) -> Result<Vec<rustls::Certificate>> {
    let mut reader =
        BufReader::new(File::open(path).map_err(|e| Error::config(format!("cannot open cert_file {path}: {e}")))?);
    let certs =
        rustls_pemfile::certs(&mut reader).map_err(|e| Error::config(format!("invalid cert_file {path}: {e}")))?;
    if certs.is_empty() {
        return Err(Error::config(format!("no certificates found in {path}")));
    }
    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_key(path: &str) -> Result<rustls::PrivateKey> {
    let mut reader =
        BufReader::new(File::open(path).map_err(|e| Error::config(format!("cannot open key_file {path}: {e}")))?);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| Error::config(format!("invalid key_file {path}: {e}")))?;
    keys.into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| Error::config(format!("no PKCS#8 private key found in {path}")))
}
