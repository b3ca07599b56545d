//! The two lookups the proxy runtime performs against the registry
//!
//! [`RuntimeAdapter::resolve_certificate`] runs once per TLS handshake keyed on
//! SNI, [`RuntimeAdapter::resolve_route`] once per request keyed on the Host
//! header. Neither writes to the registry. [`SniCertResolver`] plugs the first
//! into rustls.

use crate::db::{CertPaths, Database};
use crate::error::{RegistryError, Result};
use crate::resolver::{DomainResolver, Route};
use dashmap::DashMap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// PEM-encoded certificate chain and private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePem {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

#[derive(Clone)]
pub struct RuntimeAdapter {
    resolver: DomainResolver,
}

impl RuntimeAdapter {
    pub fn new(db: Arc<Database>, upstream_host: impl Into<String>) -> Self {
        Self {
            resolver: DomainResolver::new(db, upstream_host),
        }
    }

    pub fn resolver(&self) -> &DomainResolver {
        &self.resolver
    }

    /// Paths of the certificate to present for `sni`
    pub fn resolve_cert_paths(&self, sni: &str) -> Result<Option<CertPaths>> {
        match normalize_host(sni) {
            Some(host) => self.resolver.resolve_cert_paths(&host),
            None => Ok(None),
        }
    }

    /// PEM contents of the certificate to present for `sni`.
    ///
    /// A registered path whose files cannot be read counts as not found.
    pub fn resolve_certificate(&self, sni: &str) -> Result<Option<CertificatePem>> {
        let Some(paths) = self.resolve_cert_paths(sni)? else {
            return Ok(None);
        };

        match (std::fs::read(&paths.cert_path), std::fs::read(&paths.key_path)) {
            (Ok(cert_pem), Ok(key_pem)) => Ok(Some(CertificatePem { cert_pem, key_pem })),
            (Err(e), _) | (_, Err(e)) => {
                warn!(sni, cert = %paths.cert_path.display(), error = %e, "Registered certificate unreadable");
                Ok(None)
            }
        }
    }

    /// How to serve a request carrying `host_header`; `None` when unregistered
    pub fn resolve_route(&self, host_header: &str) -> Result<Option<Route>> {
        let Some(host) = normalize_host(host_header) else {
            return Ok(None);
        };

        match self.resolver.resolve_route(&host) {
            Ok(route) => Ok(Some(route)),
            Err(RegistryError::NotConfigured(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Strip any port, lower-case, and reject anything but a plain DNS name
pub fn normalize_host(raw: &str) -> Option<String> {
    let hostname = raw.trim().split(':').next()?.trim_end_matches('.');

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen and dot only; keeps log output clean
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

// ==================== rustls integration ====================

struct CachedKey {
    cert_modified: Option<SystemTime>,
    key_modified: Option<SystemTime>,
    key: Arc<CertifiedKey>,
}

/// Per-handshake certificate selection backed by the registry
pub struct SniCertResolver {
    adapter: RuntimeAdapter,
    default_key: Arc<CertifiedKey>,
    cache: DashMap<PathBuf, CachedKey>,
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl SniCertResolver {
    pub fn new(adapter: RuntimeAdapter, default_key: Arc<CertifiedKey>) -> Self {
        Self {
            adapter,
            default_key,
            cache: DashMap::new(),
        }
    }

    /// Load the fallback pair presented when no record matches
    pub fn with_default_files(adapter: RuntimeAdapter, cert: &Path, key: &Path) -> Result<Self> {
        let default_key = load_certified_key_files(&CertPaths {
            cert_path: cert.to_path_buf(),
            key_path: key.to_path_buf(),
        })?;
        Ok(Self::new(adapter, default_key))
    }

    /// Certificate for `sni`, falling back to the default pair
    pub fn certificate_for(&self, sni: Option<&str>) -> Arc<CertifiedKey> {
        let Some(sni) = sni else {
            return Arc::clone(&self.default_key);
        };

        let paths = match self.adapter.resolve_cert_paths(sni) {
            Ok(Some(paths)) => paths,
            Ok(None) => return Arc::clone(&self.default_key),
            Err(e) => {
                warn!(sni, error = %e, "Certificate lookup failed, using default");
                return Arc::clone(&self.default_key);
            }
        };

        match self.cached_or_load(&paths) {
            Ok(key) => key,
            Err(e) => {
                warn!(sni, cert = %paths.cert_path.display(), error = %e, "Certificate unusable, using default");
                Arc::clone(&self.default_key)
            }
        }
    }

    fn cached_or_load(&self, paths: &CertPaths) -> Result<Arc<CertifiedKey>> {
        let cert_modified = modified(&paths.cert_path);
        let key_modified = modified(&paths.key_path);

        if let Some(entry) = self.cache.get(&paths.cert_path) {
            if entry.cert_modified == cert_modified && entry.key_modified == key_modified {
                return Ok(Arc::clone(&entry.key));
            }
        }

        let key = load_certified_key_files(paths)?;
        debug!(cert = %paths.cert_path.display(), "Loaded certificate into cache");
        self.cache.insert(
            paths.cert_path.clone(),
            CachedKey {
                cert_modified,
                key_modified,
                key: Arc::clone(&key),
            },
        );
        Ok(key)
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.certificate_for(client_hello.server_name()))
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn invalid(path: &Path, message: impl std::fmt::Display) -> RegistryError {
    RegistryError::validation("certificate", format!("{}: {}", path.display(), message))
}

/// Parse a PEM chain and key into a rustls signing pair
pub fn load_certified_key(pem: &CertificatePem, origin: &Path) -> Result<Arc<CertifiedKey>> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(pem.cert_pem.as_slice()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| invalid(origin, e))?;

    if certs.is_empty() {
        return Err(invalid(origin, "no certificates found"));
    }

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(pem.key_pem.as_slice()))
            .map_err(|e| invalid(origin, e))?
            .ok_or_else(|| invalid(origin, "no private key found"))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| invalid(origin, format!("unsupported private key: {}", e)))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn load_certified_key_files(paths: &CertPaths) -> Result<Arc<CertifiedKey>> {
    let cert_pem = std::fs::read(&paths.cert_path)
        .map_err(|e| RegistryError::from_io(e, paths.cert_path.display()))?;
    let key_pem = std::fs::read(&paths.key_path)
        .map_err(|e| RegistryError::from_io(e, paths.key_path.display()))?;
    load_certified_key(&CertificatePem { cert_pem, key_pem }, &paths.cert_path)
}
