//! Two-phase hostname resolution against the registry
//!
//! The certificate phase runs once per TLS handshake keyed on SNI; the routing
//! phase runs once per request keyed on the Host header. Both do an exact
//! lookup first and then fall back to the `*.<suffix>` record for the
//! hostname with its leftmost label removed. Nothing is cached here, so every
//! answer reflects the registry as it is at call time.

use crate::db::{CertPaths, Database, DomainRecord, SiteType};
use crate::error::{RegistryError, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::trace;

/// Where a request should be sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Route {
    Static { root_path: PathBuf },
    Proxy { upstream: String },
}

/// Read-only resolver shared by every proxy worker
#[derive(Clone)]
pub struct DomainResolver {
    db: Arc<Database>,
    upstream_host: String,
}

impl DomainResolver {
    pub fn new(db: Arc<Database>, upstream_host: impl Into<String>) -> Self {
        Self {
            db,
            upstream_host: upstream_host.into(),
        }
    }

    /// Find the record governing `host`: exact name, else its wildcard
    pub fn lookup(&self, host: &str) -> Result<Option<DomainRecord>> {
        if let Some(record) = self.db.get_domain(host)? {
            trace!(host, "Exact registry match");
            return Ok(Some(record));
        }

        match wildcard_for(host) {
            Some(wildcard) => {
                let record = self.db.get_domain(&wildcard)?;
                if record.is_some() {
                    trace!(host, wildcard = %wildcard, "Wildcard registry match");
                }
                Ok(record)
            }
            None => Ok(None),
        }
    }

    /// Routing phase: decide how to serve a request for `host`
    pub fn resolve_route(&self, host: &str) -> Result<Route> {
        let record = self
            .lookup(host)?
            .ok_or_else(|| RegistryError::NotConfigured(host.to_string()))?;

        Ok(match record.site_type {
            SiteType::Static => Route::Static {
                root_path: PathBuf::from(&record.target),
            },
            SiteType::Server => Route::Proxy {
                upstream: format!("{}:{}", self.upstream_host, record.target),
            },
        })
    }

    /// Certificate phase: the files to present for SNI `host`.
    ///
    /// An exact record without a certificate still falls through to the
    /// wildcard record, since it is the wildcard's certificate that covers it.
    pub fn resolve_cert_paths(&self, host: &str) -> Result<Option<CertPaths>> {
        if let Some(paths) = self.db.get_domain(host)?.and_then(|r| r.cert_paths()) {
            return Ok(Some(paths));
        }

        match wildcard_for(host) {
            Some(wildcard) => Ok(self.db.get_domain(&wildcard)?.and_then(|r| r.cert_paths())),
            None => Ok(None),
        }
    }
}

/// `*.` plus `host` with its leftmost label removed.
///
/// Returns `None` for single-label hosts, which no wildcard can cover.
pub fn wildcard_for(host: &str) -> Option<String> {
    let (_, suffix) = host.split_once('.')?;
    if suffix.is_empty() {
        return None;
    }
    Some(format!("*.{}", suffix))
}
