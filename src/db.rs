//! SQLite registry of domain records
//!
//! The `domains` table is the single source of truth for both the control
//! plane (mutations) and the data plane (per-connection and per-request
//! resolution). All query text lives in this module; callers go through the
//! narrow operation set on [`Database`].

use crate::error::{RegistryError, Result};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

const DOMAIN_COLUMNS: &str = "domain, subdomain, email, owner, ssl_mode, ssl_certificate_path, \
     ssl_certificate_key_path, target, type, project_path, ssl_state, ssl_error, version, \
     created_at, COALESCE(updated_at, created_at)";

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RegistryError::from_io(e, parent.display()))?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL lets resolver reads proceed while the control plane writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.run_migrations()?;

        info!("Registry opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: the domains table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: domains table");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS domains (
                domain TEXT PRIMARY KEY,
                subdomain TEXT,
                email TEXT NOT NULL DEFAULT '',
                owner TEXT NOT NULL DEFAULT '',
                ssl_mode TEXT NOT NULL DEFAULT 'none',
                ssl_certificate_path TEXT,
                ssl_certificate_key_path TEXT,
                target TEXT NOT NULL,
                type TEXT NOT NULL DEFAULT 'server',
                project_path TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_domains_subdomain ON domains(subdomain);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Migration v2: certificate lifecycle state and optimistic versioning
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: lifecycle state and record versions");

        conn.execute_batch(
            r#"
            ALTER TABLE domains ADD COLUMN ssl_state TEXT NOT NULL DEFAULT 'none';
            ALTER TABLE domains ADD COLUMN ssl_error TEXT;
            ALTER TABLE domains ADD COLUMN version INTEGER NOT NULL DEFAULT 1;
            ALTER TABLE domains ADD COLUMN updated_at TEXT;

            UPDATE domains SET updated_at = created_at;
            UPDATE domains SET ssl_state = 'issued'
                WHERE ssl_certificate_path IS NOT NULL AND ssl_certificate_path != '';

            INSERT INTO schema_migrations (version) VALUES (2);
        "#,
        )?;

        Ok(())
    }

    // ==================== Reads ====================

    /// Get a record by its exact name
    pub fn get_domain(&self, domain: &str) -> Result<Option<DomainRecord>> {
        let conn = self.conn.lock();
        Ok(query_domain(&conn, domain)?)
    }

    /// List every record, each parent followed by its subdomains
    pub fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains
             ORDER BY COALESCE(NULLIF(subdomain, ''), domain),
                      CASE WHEN subdomain IS NULL OR subdomain = '' OR subdomain = domain THEN 0 ELSE 1 END,
                      domain"
        ))?;

        let records = stmt
            .query_map([], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// List the subdomains registered under `parent`
    pub fn list_children(&self, parent: &str) -> Result<Vec<DomainRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains
             WHERE subdomain = ?1 AND domain != ?1 ORDER BY domain"
        ))?;

        let records = stmt
            .query_map(params![parent], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    // ==================== Writes ====================

    /// Insert a new record; fails with `DuplicateDomain` if the name exists
    pub fn insert_domain(&self, new: &NewDomain) -> Result<DomainRecord> {
        let conn = self.conn.lock();

        let (cert_path, key_path) = match &new.certificate {
            Some(paths) => (
                Some(paths.cert_path.to_string_lossy().into_owned()),
                Some(paths.key_path.to_string_lossy().into_owned()),
            ),
            None => (None, None),
        };
        let ssl_state = if new.certificate.is_some() {
            SslState::Issued
        } else {
            SslState::None
        };

        let inserted = conn.execute(
            "INSERT INTO domains (domain, subdomain, email, owner, ssl_mode, ssl_certificate_path,
                                  ssl_certificate_key_path, target, type, project_path, ssl_state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, datetime('now'))",
            params![
                new.domain,
                new.subdomain,
                new.email,
                new.owner,
                new.ssl_mode,
                cert_path,
                key_path,
                new.target,
                new.site_type,
                new.project_path,
                ssl_state,
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(RegistryError::DuplicateDomain(new.domain.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        query_domain(&conn, &new.domain)?
            .ok_or_else(|| RegistryError::NotFound(new.domain.clone()))
    }

    /// Change how and where a record is served in one statement
    pub fn update_site(
        &self,
        domain: &str,
        site_type: SiteType,
        target: &str,
        expected_version: Option<i64>,
    ) -> Result<DomainRecord> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE domains SET type = ?1, target = ?2, version = version + 1, updated_at = datetime('now')
             WHERE domain = ?3 AND (?4 IS NULL OR version = ?4)",
            params![site_type, target, domain, expected_version],
        )?;
        finish_versioned_update(&conn, domain, changed, expected_version)
    }

    /// Record the outcome of certificate issuance
    pub fn update_ssl(
        &self,
        domain: &str,
        ssl_mode: SslMode,
        certificate: Option<&CertPaths>,
        state: SslState,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let (cert_path, key_path) = match certificate {
            Some(paths) => (
                Some(paths.cert_path.to_string_lossy().into_owned()),
                Some(paths.key_path.to_string_lossy().into_owned()),
            ),
            None => (None, None),
        };
        let changed = conn.execute(
            "UPDATE domains SET ssl_mode = ?1, ssl_certificate_path = ?2, ssl_certificate_key_path = ?3,
                    ssl_state = ?4, ssl_error = ?5, version = version + 1, updated_at = datetime('now')
             WHERE domain = ?6",
            params![ssl_mode, cert_path, key_path, state, error, domain],
        )?;
        if changed == 0 {
            return Err(RegistryError::NotFound(domain.to_string()));
        }
        Ok(())
    }

    /// Move a record's certificate lifecycle state without touching its paths
    pub fn set_ssl_state(&self, domain: &str, state: SslState, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE domains SET ssl_state = ?1, ssl_error = ?2, version = version + 1,
                    updated_at = datetime('now')
             WHERE domain = ?3",
            params![state, error, domain],
        )?;
        if changed == 0 {
            return Err(RegistryError::NotFound(domain.to_string()));
        }
        Ok(())
    }

    /// Link or unlink a local development project
    pub fn set_project_path(&self, domain: &str, project_path: Option<&str>) -> Result<DomainRecord> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE domains SET project_path = ?1, version = version + 1, updated_at = datetime('now')
             WHERE domain = ?2",
            params![project_path, domain],
        )?;
        finish_versioned_update(&conn, domain, changed, None)
    }

    /// Delete a record together with every record whose parent it is.
    ///
    /// One statement, so the cascade is atomic at the storage level.
    /// Returns the names that were removed.
    pub fn delete_domain(&self, domain: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("DELETE FROM domains WHERE domain = ?1 OR subdomain = ?1 RETURNING domain")?;
        let mut removed = stmt
            .query_map(params![domain], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        removed.sort();
        Ok(removed)
    }
}

fn query_domain(conn: &Connection, domain: &str) -> rusqlite::Result<Option<DomainRecord>> {
    conn.query_row(
        &format!("SELECT {DOMAIN_COLUMNS} FROM domains WHERE domain = ?1"),
        params![domain],
        row_to_record,
    )
    .optional()
}

fn finish_versioned_update(
    conn: &Connection,
    domain: &str,
    changed: usize,
    expected_version: Option<i64>,
) -> Result<DomainRecord> {
    let record = query_domain(conn, domain)?;
    match (changed, record, expected_version) {
        (0, None, _) => Err(RegistryError::NotFound(domain.to_string())),
        (0, Some(current), Some(expected)) => Err(RegistryError::Conflict {
            domain: domain.to_string(),
            expected,
            found: current.version,
        }),
        (_, Some(current), _) => Ok(current),
        (_, None, _) => Err(RegistryError::NotFound(domain.to_string())),
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<DomainRecord> {
    Ok(DomainRecord {
        domain: row.get(0)?,
        subdomain: row.get(1)?,
        email: row.get(2)?,
        owner: row.get(3)?,
        ssl_mode: row.get(4)?,
        ssl_certificate_path: row.get(5)?,
        ssl_certificate_key_path: row.get(6)?,
        target: row.get(7)?,
        site_type: row.get(8)?,
        project_path: row.get(9)?,
        ssl_state: row.get(10)?,
        ssl_error: row.get(11)?,
        version: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

// ==================== Record Types ====================

/// One row per domain or subdomain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub domain: String,
    /// Own name (or empty) for roots, the parent's name for children
    pub subdomain: Option<String>,
    pub email: String,
    pub owner: String,
    pub ssl_mode: SslMode,
    pub ssl_certificate_path: Option<String>,
    pub ssl_certificate_key_path: Option<String>,
    /// Port for `server`, directory for `static`
    pub target: String,
    #[serde(rename = "type")]
    pub site_type: SiteType,
    pub project_path: Option<String>,
    pub ssl_state: SslState,
    pub ssl_error: Option<String>,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl DomainRecord {
    pub fn is_wildcard(&self) -> bool {
        self.domain.starts_with("*.")
    }

    /// The parent record's name, if this is a subdomain
    pub fn parent(&self) -> Option<&str> {
        match self.subdomain.as_deref() {
            Some(parent) if !parent.is_empty() && parent != self.domain => Some(parent),
            _ => None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    /// Certificate paths, present only once issuance has completed
    pub fn cert_paths(&self) -> Option<CertPaths> {
        match (
            self.ssl_certificate_path.as_deref(),
            self.ssl_certificate_key_path.as_deref(),
        ) {
            (Some(cert), Some(key)) if !cert.is_empty() && !key.is_empty() => Some(CertPaths {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            _ => None,
        }
    }
}

/// Fields for a record about to be inserted
#[derive(Debug, Clone)]
pub struct NewDomain {
    pub domain: String,
    pub subdomain: Option<String>,
    pub email: String,
    pub owner: String,
    pub ssl_mode: SslMode,
    pub target: String,
    pub site_type: SiteType,
    pub project_path: Option<String>,
    /// Shared certificate inherited from the parent
    pub certificate: Option<CertPaths>,
}

/// Certificate and private key locations on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Error for text columns holding an unknown enum value
#[derive(Debug, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    None,
    SelfSigned,
    Letsencrypt,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::None => "none",
            SslMode::SelfSigned => "self-signed",
            SslMode::Letsencrypt => "letsencrypt",
        }
    }
}

impl FromStr for SslMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(SslMode::None),
            "self-signed" | "selfsigned" => Ok(SslMode::SelfSigned),
            "letsencrypt" | "lets-encrypt" => Ok(SslMode::Letsencrypt),
            other => Err(ParseEnumError::new("ssl mode", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteType {
    /// Files served from the `target` directory
    Static,
    /// Requests proxied to the `target` port
    Server,
}

impl SiteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteType::Static => "static",
            SiteType::Server => "server",
        }
    }
}

impl FromStr for SiteType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(SiteType::Static),
            "server" => Ok(SiteType::Server),
            other => Err(ParseEnumError::new("site type", other)),
        }
    }
}

/// Persisted certificate lifecycle state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslState {
    None,
    Pending,
    Issued,
    Failed,
}

impl SslState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslState::None => "none",
            SslState::Pending => "pending",
            SslState::Issued => "issued",
            SslState::Failed => "failed",
        }
    }
}

impl FromStr for SslState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(SslState::None),
            "pending" => Ok(SslState::Pending),
            "issued" => Ok(SslState::Issued),
            "failed" => Ok(SslState::Failed),
            other => Err(ParseEnumError::new("ssl state", other)),
        }
    }
}

macro_rules! text_column {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: ParseEnumError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_column!(SslMode);
text_column!(SiteType);
text_column!(SslState);
