use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, read_one, Item};
use tokio_rustls::TlsAcceptor;

use crate::config::CertificateConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no domain certificates are configured")]
    Unconfigured,
    #[error("client sent no server name and multiple domains are configured")]
    Ambiguous,
    #[error("no certificate configured for domain '{0}'")]
    UnknownDomain(String),
}

/// Per-domain certificate table, loaded once at startup and shared
/// read-only with every connection task.
pub struct CertStore {
    certs: HashMap<String, Arc<CertifiedKey>>,
}

impl CertStore {
    pub fn load(configs: &indexmap::IndexMap<String, CertificateConfig>) -> Result<Self> {
        let mut certs = HashMap::new();
        for (domain, cert) in configs {
            let key = load_certified_key(&cert.cert_file, &cert.private_key_file)
                .with_context(|| format!("loading certificate for domain '{}'", domain))?;
            certs.insert(domain.to_ascii_lowercase(), Arc::new(key));
        }
        Ok(Self { certs })
    }

    /// True if at least one domain certificate is configured. Controls
    /// whether STARTTLS is advertised and whether implicit-TLS listeners
    /// accept connections at all.
    pub fn is_configured(&self) -> bool {
        !self.certs.is_empty()
    }

    /// Selects the certificate for a requested server name.
    ///
    /// Exact domain match only. Without a server name the single
    /// configured certificate is used as a fallback; with several domains
    /// configured the request is ambiguous and the handshake must fail.
    pub fn resolve(&self, server_name: Option<&str>) -> Result<&Arc<CertifiedKey>, ResolveError> {
        select(&self.certs, server_name)
    }

    /// Builds a TLS acceptor whose certificate choice is made by
    /// [`CertStore::resolve`] from the SNI in the client hello.
    pub fn acceptor(self: Arc<Self>) -> TlsAcceptor {
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniCertResolver { store: self }));
        TlsAcceptor::from(Arc::new(config))
    }
}

fn select<'a, T>(
    table: &'a HashMap<String, T>,
    server_name: Option<&str>,
) -> Result<&'a T, ResolveError> {
    if table.is_empty() {
        return Err(ResolveError::Unconfigured);
    }
    match server_name {
        Some(name) => table
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| ResolveError::UnknownDomain(name.to_string())),
        None if table.len() == 1 => Ok(table.values().next().expect("len checked")),
        None => Err(ResolveError::Ambiguous),
    }
}

struct SniCertResolver {
    store: Arc<CertStore>,
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        match self.store.resolve(client_hello.server_name()) {
            Ok(key) => Some(Arc::clone(key)),
            Err(error) => {
                tracing::warn!(%error, "rejecting TLS handshake");
                None
            }
        }
    }
}

fn load_certified_key(cert_file: &Path, key_file: &Path) -> Result<CertifiedKey> {
    let file = File::open(cert_file)
        .with_context(|| format!("could not open certificate file {:?}", cert_file))?;
    let chain: Vec<Certificate> = certs(&mut BufReader::new(file))
        .with_context(|| format!("could not parse certificate file {:?}", cert_file))?
        .into_iter()
        .map(Certificate)
        .collect();
    if chain.is_empty() {
        bail!("no certificates found in {:?}", cert_file);
    }

    let file = File::open(key_file)
        .with_context(|| format!("could not open private key file {:?}", key_file))?;
    let mut reader = BufReader::new(file);
    let key = loop {
        match read_one(&mut reader)
            .with_context(|| format!("could not parse private key file {:?}", key_file))?
        {
            Some(Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key)) => {
                break PrivateKey(key)
            }
            Some(_) => continue,
            None => bail!("no private key found in {:?}", key_file),
        }
    };
    let signing_key = rustls::sign::any_supported_type(&key)
        .map_err(|_| anyhow::anyhow!("unsupported private key type in {:?}", key_file))?;

    Ok(CertifiedKey::new(chain, signing_key))
}
