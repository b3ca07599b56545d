use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the registry database path
pub const DB_PATH_ENV: &str = "HOSTGATE_DB";

/// Process-wide configuration, loaded once at startup and passed to each component
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    /// Default listener certificate
    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub acme: AcmeConfig,

    #[serde(default)]
    pub static_files: StaticFilesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// HTTPS port (default: 443, set to 0 to disable)
    #[serde(default = "default_tls_port")]
    pub tls_port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Host that `server` records are proxied to
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Force redirect from HTTP to HTTPS (default: false)
    #[serde(default)]
    pub force_https: bool,

    /// Maximum idle connections per upstream (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for an upstream response (default: 60)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            tls_port: default_tls_port(),
            bind: default_bind_address(),
            upstream_host: default_upstream_host(),
            force_https: false,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// SQLite database file holding the `domains` table
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

/// The process-default certificate used when SNI matches nothing
#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    #[serde(default = "default_cert_path")]
    pub default_cert: PathBuf,

    #[serde(default = "default_key_path")]
    pub default_key: PathBuf,

    #[serde(default = "default_common_name")]
    pub common_name: String,

    #[serde(default = "default_key_bits")]
    pub key_bits: u32,

    #[serde(default = "default_validity_days")]
    pub validity_days: u32,

    /// Generate the default pair at daemon start without asking (default: false)
    #[serde(default)]
    pub auto_generate: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            default_cert: default_cert_path(),
            default_key: default_key_path(),
            common_name: default_common_name(),
            key_bits: default_key_bits(),
            validity_days: default_validity_days(),
            auto_generate: false,
        }
    }
}

/// Which ACME client performs DNS-01 issuance
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AcmeClientKind {
    /// Shell out to certbot in manual DNS mode (default)
    #[default]
    Certbot,
    /// Talk to the ACME directory directly via instant-acme
    Native,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    #[serde(default)]
    pub client: AcmeClientKind,

    /// Issued certificates live at `<root>/<domain>/{fullchain,privkey}.pem`
    #[serde(default = "default_acme_root")]
    pub root: PathBuf,

    /// ACME client log shown by `hostctl ssl logs`
    #[serde(default = "default_acme_log")]
    pub log_file: PathBuf,

    #[serde(default = "default_certbot")]
    pub certbot_path: String,

    #[serde(default = "default_openssl")]
    pub openssl_path: String,

    #[serde(default = "default_dig")]
    pub dig_path: String,

    /// ACME directory URL for the native client (defaults to Let's Encrypt production)
    pub directory_url: Option<String>,

    /// Account credentials for the native client
    #[serde(default = "default_account_dir")]
    pub account_dir: PathBuf,

    /// Certificates expiring within this many days are due for renewal
    #[serde(default = "default_renewal_days")]
    pub renewal_days: u64,

    /// How often the daemon sweeps for due renewals (default: 12h)
    #[serde(default = "default_renewal_interval")]
    pub renewal_interval_secs: u64,

    /// Max time to wait for the client to print the DNS challenge
    #[serde(default = "default_challenge_timeout")]
    pub challenge_timeout_secs: u64,

    #[serde(default)]
    pub propagation: PropagationConfig,
}

impl AcmeConfig {
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }

    /// Directory holding the issued files for a (possibly wildcard) domain
    pub fn live_dir(&self, domain: &str) -> PathBuf {
        self.root.join(crate::tools::lineage_name(domain))
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            client: AcmeClientKind::default(),
            root: default_acme_root(),
            log_file: default_acme_log(),
            certbot_path: default_certbot(),
            openssl_path: default_openssl(),
            dig_path: default_dig(),
            directory_url: None,
            account_dir: default_account_dir(),
            renewal_days: default_renewal_days(),
            renewal_interval_secs: default_renewal_interval(),
            challenge_timeout_secs: default_challenge_timeout(),
            propagation: PropagationConfig::default(),
        }
    }
}

/// Bounds for polling DNS until the challenge TXT record is visible
#[derive(Debug, Deserialize, Clone)]
pub struct PropagationConfig {
    #[serde(default = "default_propagation_attempts")]
    pub attempts: u32,

    #[serde(default = "default_propagation_interval")]
    pub interval_secs: u64,

    /// Hard ceiling across all attempts
    #[serde(default = "default_propagation_timeout")]
    pub timeout_secs: u64,

    /// Query this nameserver instead of the system resolver
    pub nameserver: Option<String>,
}

impl PropagationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            attempts: default_propagation_attempts(),
            interval_secs: default_propagation_interval(),
            timeout_secs: default_propagation_timeout(),
            nameserver: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StaticFilesConfig {
    /// Index document, also the single-page-app fallback
    #[serde(default = "default_index")]
    pub index: String,
}

impl Default for StaticFilesConfig {
    fn default() -> Self {
        Self {
            index: default_index(),
        }
    }
}

fn default_listen_port() -> u16 {
    80
}

fn default_tls_port() -> u16 {
    443
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    60
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/hostgate/registry.db")
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("/etc/hostgate/ssl/default.crt")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/etc/hostgate/ssl/default.key")
}

fn default_common_name() -> String {
    "hostgate-default".to_string()
}

fn default_key_bits() -> u32 {
    2048
}

fn default_validity_days() -> u32 {
    365
}

fn default_acme_root() -> PathBuf {
    PathBuf::from("/etc/letsencrypt/live")
}

fn default_acme_log() -> PathBuf {
    PathBuf::from("/var/log/letsencrypt/letsencrypt.log")
}

fn default_certbot() -> String {
    "certbot".to_string()
}

fn default_openssl() -> String {
    "openssl".to_string()
}

fn default_dig() -> String {
    "dig".to_string()
}

fn default_account_dir() -> PathBuf {
    PathBuf::from("/var/lib/hostgate/acme")
}

fn default_renewal_days() -> u64 {
    30
}

fn default_renewal_interval() -> u64 {
    12 * 60 * 60
}

fn default_challenge_timeout() -> u64 {
    120
}

fn default_propagation_attempts() -> u32 {
    10
}

fn default_propagation_interval() -> u64 {
    60
}

fn default_propagation_timeout() -> u64 {
    600
}

fn default_index() -> String {
    "index.html".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides on top of the file contents
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            if !path.trim().is_empty() {
                self.registry.database = PathBuf::from(path);
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let propagation = &self.acme.propagation;
        if propagation.attempts == 0 {
            anyhow::bail!("acme.propagation.attempts must be at least 1");
        }
        if propagation.interval_secs == 0 {
            anyhow::bail!("acme.propagation.interval_secs must be greater than 0");
        }
        if propagation.timeout_secs < propagation.interval_secs {
            anyhow::bail!("acme.propagation.timeout_secs must cover at least one interval");
        }
        if self.server.port != 0 && self.server.port == self.server.tls_port {
            anyhow::bail!("server.port and server.tls_port must differ");
        }
        if self.tls.default_cert.as_os_str().is_empty() || self.tls.default_key.as_os_str().is_empty() {
            anyhow::bail!("tls.default_cert and tls.default_key must be set");
        }
        if self.static_files.index.is_empty() || self.static_files.index.contains('/') {
            anyhow::bail!("static_files.index must be a plain file name");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.tls_port, 443);
        assert_eq!(config.server.upstream_host, "127.0.0.1");
        assert_eq!(config.registry.database, PathBuf::from("/var/lib/hostgate/registry.db"));
        assert_eq!(config.tls.key_bits, 2048);
        assert_eq!(config.tls.validity_days, 365);
        assert!(!config.tls.auto_generate);
        assert_eq!(config.acme.client, AcmeClientKind::Certbot);
        assert_eq!(config.static_files.index, "index.html");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_propagation_defaults() {
        let config = PropagationConfig::default();
        assert_eq!(config.attempts, 10);
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(config.timeout(), Duration::from_secs(600));
        assert!(config.nameserver.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
tls_port = 8443
bind = "127.0.0.1"
force_https = true

[registry]
database = "/tmp/hostgate.db"

[tls]
default_cert = "/tmp/default.crt"
default_key = "/tmp/default.key"
common_name = "edge"

[acme]
client = "native"
root = "/srv/certs"
directory_url = "https://acme-staging-v02.api.letsencrypt.org/directory"

[acme.propagation]
attempts = 3
interval_secs = 5
timeout_secs = 30
nameserver = "1.1.1.1"

[static_files]
index = "app.html"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.tls_port, 8443);
        assert!(config.server.force_https);
        assert_eq!(config.registry.database, PathBuf::from("/tmp/hostgate.db"));
        assert_eq!(config.tls.common_name, "edge");
        assert_eq!(config.acme.client, AcmeClientKind::Native);
        assert_eq!(config.acme.propagation.attempts, 3);
        assert_eq!(config.acme.propagation.nameserver.as_deref(), Some("1.1.1.1"));
        assert_eq!(config.static_files.index, "app.html");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_live_dir_keeps_wildcard_lineage_apart() {
        let acme = AcmeConfig::default();
        assert_eq!(
            acme.live_dir("*.example.com"),
            PathBuf::from("/etc/letsencrypt/live/example.com-wildcard")
        );
        assert_eq!(
            acme.live_dir("example.com"),
            PathBuf::from("/etc/letsencrypt/live/example.com")
        );
        assert_eq!(
            acme.live_dir("api.example.com"),
            PathBuf::from("/etc/letsencrypt/live/api.example.com")
        );
    }

    #[test]
    fn test_validate_rejects_bad_propagation() {
        let mut config = Config::default();
        config.acme.propagation.attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.acme.propagation.interval_secs = 120;
        config.acme.propagation.timeout_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_port_clash() {
        let mut config = Config::default();
        config.server.port = 8443;
        config.server.tls_port = 8443;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_index_path() {
        let mut config = Config::default();
        config.static_files.index = "../index.html".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostgate.toml");
        std::fs::write(&path, "[server]\nport = 8081\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 8081);

        assert!(Config::load(dir.path().join("missing.toml")).is_err());
        assert!(Config::load_or_default(dir.path().join("missing.toml")).is_ok());
    }
}
