//! Forward-proxy certificate authority
//!
//! When the proxy runs as a forward proxy, a CONNECT request asks it to
//! tunnel raw bytes to `host:443` with no visibility into the plaintext. To
//! inspect (and translate) that traffic the proxy instead terminates TLS
//! itself, presenting a leaf certificate for `host` signed by a CA the
//! operator has installed as trusted in their OS/browser. Leaf certificates
//! are minted lazily, per host, and cached for the life of the process.
//!
//! Grounded on the CA-minting approach in
//! `zed-industries-codex/codex-rs/network-proxy/src/certs.rs` (root `Issuer`
//! plus per-host `CertificateParams::signed_by`, ECDSA P-256 leaf keys), but
//! built on the mainstream `rcgen`/`rustls`/`tokio-rustls` stack rather than
//! that repo's `rama-tls-rustls` wrapper.

use crate::config::CaConfig;
use anyhow::{Context, Result};
use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

/// A loaded root CA, used to mint per-host leaf certificates on demand
pub struct CertificateAuthority {
    ca_cert_pem: String,
    ca_key: KeyPair,
    cache: Mutex<HashMap<String, Arc<rustls::ServerConfig>>>,
}

impl CertificateAuthority {
    /// Load root CA material from disk
    pub fn load(config: &CaConfig) -> Result<Self> {
        let ca_cert_pem = std::fs::read_to_string(&config.cert_path)
            .with_context(|| format!("reading CA cert at {}", config.cert_path.display()))?;
        let ca_key_pem = std::fs::read_to_string(&config.key_path)
            .with_context(|| format!("reading CA key at {}", config.key_path.display()))?;
        let ca_key = KeyPair::from_pem(&ca_key_pem).context("parsing CA private key")?;

        Ok(Self {
            ca_cert_pem,
            ca_key,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Get (minting and caching if necessary) a TLS server config presenting
    /// a leaf certificate valid for `host`
    pub fn ssl_context_for_host(&self, host: &str) -> Result<Arc<rustls::ServerConfig>> {
        if let Some(cached) = self.cache.lock().unwrap().get(host) {
            return Ok(cached.clone());
        }

        let ca_params = CertificateParams::from_ca_cert_pem(&self.ca_cert_pem)
            .context("reconstructing CA params for signing")?;
        let ca_cert = ca_params
            .self_signed(&self.ca_key)
            .context("re-deriving CA certificate for signing")?;

        let leaf_key = KeyPair::generate().context("generating leaf key")?;
        let mut leaf_params = CertificateParams::new(vec![host.to_string()])
            .context("building leaf certificate params")?;
        leaf_params.distinguished_name.push(DnType::CommonName, host);
        leaf_params.subject_alt_names = vec![host_san(host)?];

        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &ca_cert, &self.ca_key)
            .with_context(|| format!("signing leaf certificate for {host}"))?;

        let cert_der = CertificateDer::from(leaf_cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(leaf_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("encoding leaf key: {e}"))?;

        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .context("building rustls server config")?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let server_config = Arc::new(server_config);
        self.cache
            .lock()
            .unwrap()
            .insert(host.to_string(), server_config.clone());
        Ok(server_config)
    }
}

fn host_san(host: &str) -> Result<SanType> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        Ok(SanType::IpAddress(ip))
    } else {
        Ok(SanType::DnsName(host.to_string().try_into()?))
    }
}
