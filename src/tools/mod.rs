//! External certificate and DNS tooling behind one capability trait
//!
//! The certificate lifecycle only talks to a [`ToolRunner`]. Two backends ship:
//! [`ShellTools`] drives certbot, openssl and dig as child processes, and
//! [`NativeTools`] performs ACME DNS-01 in-process with instant-acme.
//! [`SystemTools`] picks one from configuration.

mod native;
mod shell;

pub use native::{NativePending, NativeTools};
pub use shell::{ShellPending, ShellTools};

use crate::config::{AcmeClientKind, AcmeConfig};
use crate::db::CertPaths;
use crate::error::{RegistryError, Result};
use std::future::Future;
use std::path::PathBuf;
use std::process::Output;
use tracing::error;

/// A DNS TXT record the operator has to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChallenge {
    /// Identifier being validated
    pub domain: String,
    /// Fully qualified record name, e.g. `_acme-challenge.example.com`
    pub record_name: String,
    pub value: String,
}

/// Parameters for one ACME order
#[derive(Debug, Clone)]
pub struct IssueRequest {
    /// Requested name, possibly `*.example.com`
    pub domain: String,
    pub email: String,
}

impl IssueRequest {
    /// Lineage the issued files are stored under
    pub fn cert_name(&self) -> String {
        lineage_name(&self.domain)
    }

    /// Names placed on the certificate; a wildcard also covers its base
    pub fn identifiers(&self) -> Vec<String> {
        if self.domain.starts_with("*.") {
            vec![self.domain.clone(), base_domain(&self.domain).to_string()]
        } else {
            vec![self.domain.clone()]
        }
    }
}

/// An issuance that is waiting for its challenges to be published
pub struct Issuance<P> {
    pub challenges: Vec<CertificateChallenge>,
    pub handle: P,
}

/// Default listener certificate parameters
#[derive(Debug, Clone)]
pub struct SelfSignedSpec {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub common_name: String,
    pub key_bits: u32,
    pub validity_days: u32,
}

/// Result of a live TLS handshake check
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub domain: String,
    pub verified: bool,
    /// Raw tool output for the operator
    pub output: String,
}

/// Capability interface for everything that leaves the process
pub trait ToolRunner: Send + Sync {
    /// Backend state carried between starting and finishing an issuance
    type Pending: Send;

    /// Start an ACME DNS-01 order and return the TXT records to publish
    fn issue_certificate(
        &self,
        request: &IssueRequest,
    ) -> impl Future<Output = Result<Issuance<Self::Pending>>> + Send;

    /// Finish an order whose challenges are visible in DNS
    fn complete_issuance(
        &self,
        pending: Self::Pending,
    ) -> impl Future<Output = Result<CertPaths>> + Send;

    /// Abandon an order the operator declined to continue
    fn cancel_issuance(&self, pending: Self::Pending) -> impl Future<Output = ()> + Send;

    /// Renew an existing certificate without interaction
    fn renew_certificate(&self, cert_name: &str) -> impl Future<Output = Result<()>> + Send;

    fn generate_self_signed(&self, spec: &SelfSignedSpec) -> impl Future<Output = Result<()>> + Send;

    /// Current TXT values for `name`
    fn query_txt_record(&self, name: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Handshake with `domain:443` and report whether the chain verifies
    fn verify_tls(&self, domain: &str) -> impl Future<Output = Result<VerifyReport>> + Send;
}

/// Backend selected by `[acme] client`
pub enum SystemTools {
    Shell(ShellTools),
    Native(NativeTools),
}

pub enum SystemPending {
    Shell(ShellPending),
    Native(NativePending),
}

impl SystemTools {
    pub fn from_config(config: &AcmeConfig) -> Self {
        match config.client {
            AcmeClientKind::Certbot => SystemTools::Shell(ShellTools::new(config.clone())),
            AcmeClientKind::Native => SystemTools::Native(NativeTools::new(config.clone())),
        }
    }
}

fn backend_mismatch() -> RegistryError {
    RegistryError::validation(
        "issuance",
        "pending issuance was started by a different tool backend",
    )
}

impl ToolRunner for SystemTools {
    type Pending = SystemPending;

    async fn issue_certificate(&self, request: &IssueRequest) -> Result<Issuance<SystemPending>> {
        match self {
            SystemTools::Shell(tools) => {
                let issuance = tools.issue_certificate(request).await?;
                Ok(Issuance {
                    challenges: issuance.challenges,
                    handle: SystemPending::Shell(issuance.handle),
                })
            }
            SystemTools::Native(tools) => {
                let issuance = tools.issue_certificate(request).await?;
                Ok(Issuance {
                    challenges: issuance.challenges,
                    handle: SystemPending::Native(issuance.handle),
                })
            }
        }
    }

    async fn complete_issuance(&self, pending: SystemPending) -> Result<CertPaths> {
        match (self, pending) {
            (SystemTools::Shell(tools), SystemPending::Shell(p)) => tools.complete_issuance(p).await,
            (SystemTools::Native(tools), SystemPending::Native(p)) => tools.complete_issuance(p).await,
            _ => Err(backend_mismatch()),
        }
    }

    async fn cancel_issuance(&self, pending: SystemPending) {
        match (self, pending) {
            (SystemTools::Shell(tools), SystemPending::Shell(p)) => tools.cancel_issuance(p).await,
            (SystemTools::Native(tools), SystemPending::Native(p)) => tools.cancel_issuance(p).await,
            _ => {}
        }
    }

    async fn renew_certificate(&self, cert_name: &str) -> Result<()> {
        match self {
            SystemTools::Shell(tools) => tools.renew_certificate(cert_name).await,
            SystemTools::Native(tools) => tools.renew_certificate(cert_name).await,
        }
    }

    async fn generate_self_signed(&self, spec: &SelfSignedSpec) -> Result<()> {
        match self {
            SystemTools::Shell(tools) => tools.generate_self_signed(spec).await,
            SystemTools::Native(tools) => tools.generate_self_signed(spec).await,
        }
    }

    async fn query_txt_record(&self, name: &str) -> Result<Vec<String>> {
        match self {
            SystemTools::Shell(tools) => tools.query_txt_record(name).await,
            SystemTools::Native(tools) => tools.query_txt_record(name).await,
        }
    }

    async fn verify_tls(&self, domain: &str) -> Result<VerifyReport> {
        match self {
            SystemTools::Shell(tools) => tools.verify_tls(domain).await,
            SystemTools::Native(tools) => tools.verify_tls(domain).await,
        }
    }
}

// ==================== Helpers ====================

/// `example.com` for both `example.com` and `*.example.com`
pub fn base_domain(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

/// Lineage (and live directory) name for `domain`.
///
/// `*.example.com` becomes `example.com-wildcard`, so the apex and its
/// wildcard never share certbot's `--cert-name`. The suffix can't collide
/// with a registrable name because a final label never contains `-`.
pub fn lineage_name(domain: &str) -> String {
    match domain.strip_prefix("*.") {
        Some(base) => format!("{}-wildcard", base),
        None => domain.to_string(),
    }
}

/// Record name the ACME server queries for `domain`
pub fn challenge_record_name(domain: &str) -> String {
    format!("_acme-challenge.{}", base_domain(domain))
}

/// Extract the TXT record name and value from certbot's manual-mode prompt.
///
/// certbot prints the name on the first non-empty line after "under the
/// name" and the value on the first non-empty line after "with the following
/// value". The name's trailing root dot is dropped.
pub fn parse_certbot_challenge(output: &str) -> Option<(String, String)> {
    enum Field {
        Name,
        Value,
    }

    let mut name = None;
    let mut value = None;
    let mut expecting = None;

    for line in output.lines() {
        let trimmed = line.trim();

        if trimmed.contains("under the name") {
            expecting = Some(Field::Name);
            continue;
        }
        if trimmed.contains("with the following value") {
            expecting = Some(Field::Value);
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }

        match expecting.take() {
            Some(Field::Name) => name = Some(trimmed.to_string()),
            Some(Field::Value) => value = Some(trimmed.to_string()),
            None => {}
        }

        if name.is_some() && value.is_some() {
            break;
        }
    }

    let name = name?.trim_end_matches('.').to_string();
    let value = value?;
    Some((name, value))
}

/// Render a command line for error messages and logs
pub fn render_command(program: &str, args: &[String]) -> String {
    let mut words = Vec::with_capacity(args.len() + 1);
    words.push(program);
    words.extend(args.iter().map(String::as_str));
    shell_words::join(words)
}

/// Combined stdout and stderr of a finished process
pub fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (false, false) => format!("{}\n{}", stdout.trim_end(), stderr.trim_end()),
        (false, true) => stdout.trim_end().to_string(),
        (true, _) => stderr.trim_end().to_string(),
    }
}

/// Build (and log) the error for a tool that exited unsuccessfully
pub fn tool_failure(command: String, status: impl ToString, output: String) -> RegistryError {
    let status = status.to_string();
    error!(command = %command, status = %status, output = %output, "External tool failed");
    RegistryError::ToolExecution {
        command,
        status,
        output,
    }
}

/// Map a failure to start a process
pub fn spawn_failure(command: String, err: std::io::Error) -> RegistryError {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        return RegistryError::from_io(err, &command);
    }
    tool_failure(command, "failed to start", err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERTBOT_PROMPT: &str = "\
Saving debug log to /var/log/letsencrypt/letsencrypt.log
Requesting a certificate for example.com

- - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - -
Please deploy a DNS TXT record under the name:

_acme-challenge.example.com.

with the following value:

gfj9Xq...Rg85nM

Before continuing, verify the TXT record has been deployed.
- - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - -
Press Enter to Continue
";

    #[test]
    fn test_parse_certbot_challenge() {
        let (name, value) = parse_certbot_challenge(CERTBOT_PROMPT).unwrap();
        assert_eq!(name, "_acme-challenge.example.com");
        assert_eq!(value, "gfj9Xq...Rg85nM");
    }

    #[test]
    fn test_parse_incomplete_prompt() {
        let partial = "Please deploy a DNS TXT record under the name:\n\n_acme-challenge.example.com.\n";
        assert!(parse_certbot_challenge(partial).is_none());
        assert!(parse_certbot_challenge("").is_none());
    }

    #[test]
    fn test_wildcard_identifiers() {
        let request = IssueRequest {
            domain: "*.example.com".to_string(),
            email: "ops@example.com".to_string(),
        };
        assert_eq!(request.cert_name(), "example.com-wildcard");
        assert_eq!(request.identifiers(), vec!["*.example.com", "example.com"]);
        assert_eq!(challenge_record_name(&request.domain), "_acme-challenge.example.com");

        let plain = IssueRequest {
            domain: "api.example.com".to_string(),
            email: String::new(),
        };
        assert_eq!(plain.identifiers(), vec!["api.example.com"]);
        assert_eq!(plain.cert_name(), "api.example.com");
    }

    #[test]
    fn test_render_command_quotes_arguments() {
        let rendered = render_command(
            "openssl",
            &["req".to_string(), "-subj".to_string(), "/CN=hostgate default".to_string()],
        );
        assert_eq!(rendered, "openssl req -subj '/CN=hostgate default'");
    }
}
