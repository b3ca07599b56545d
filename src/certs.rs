//! Certificate lifecycle: default bootstrap, DNS-01 issuance, renewal
//!
//! Issuance is split into stages so that no stage blocks on an operator:
//!
//! 1. [`decide_issuance`] says whether a parent wildcard could be reused.
//! 2. [`CertificateManager::reuse_parent_wildcard`] or
//!    [`CertificateManager::begin_issuance`], which returns the TXT records to
//!    publish.
//! 3. [`CertificateManager::complete_issuance`] polls DNS, lets the ACME client
//!    finish and persists the certificate paths.
//!
//! [`CertificateManager::obtain_certificate`] runs all of the stages, asking an
//! [`Operator`] wherever a human has to agree.

use crate::config::Config;
use crate::db::{CertPaths, Database, DomainRecord, SslMode, SslState};
use crate::domains::Confirmation;
use crate::error::{RegistryError, Result};
use crate::resolver::wildcard_for;
use crate::tools::{
    base_domain, lineage_name, CertificateChallenge, IssueRequest, SelfSignedSpec, ToolRunner, VerifyReport,
};
use chrono::{NaiveDateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use x509_parser::extensions::GeneralName;

/// Lifecycle state of a certificate as seen by operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertState {
    None,
    /// Only used for the process-wide default pair
    SelfSigned,
    PendingIssuance,
    Issued,
    RenewalDue,
    Failed,
}

impl fmt::Display for CertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CertState::None => "NONE",
            CertState::SelfSigned => "SELF_SIGNED",
            CertState::PendingIssuance => "PENDING_ISSUANCE",
            CertState::Issued => "ISSUED",
            CertState::RenewalDue => "RENEWAL_DUE",
            CertState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Outcome of [`decide_issuance`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuanceDecision {
    /// A parent wildcard covers the domain; ask before issuing anew
    OfferWildcardReuse(CertPaths),
    Issue,
}

/// Decide whether a new order is needed or a parent wildcard can be shared
pub fn decide_issuance(record: &DomainRecord, wildcard: Option<CertPaths>) -> IssuanceDecision {
    if record.is_wildcard() {
        return IssuanceDecision::Issue;
    }
    match wildcard {
        Some(paths) if record.cert_paths().as_ref() != Some(&paths) => {
            IssuanceDecision::OfferWildcardReuse(paths)
        }
        _ => IssuanceDecision::Issue,
    }
}

/// Find an issued wildcard certificate that covers `domain`.
///
/// Checks the `*.<parent>` record first, then whether the parent record's own
/// certificate carries `*.<parent>` among its names.
pub fn wildcard_source(db: &Database, domain: &str) -> Result<Option<CertPaths>> {
    let Some(wildcard) = wildcard_for(domain) else {
        return Ok(None);
    };

    if let Some(paths) = db.get_domain(&wildcard)?.and_then(|r| r.cert_paths()) {
        if paths.cert_path.exists() && paths.key_path.exists() {
            return Ok(Some(paths));
        }
    }

    let parent = base_domain(&wildcard);
    let Some(paths) = db.get_domain(parent)?.and_then(|r| r.cert_paths()) else {
        return Ok(None);
    };

    match certificate_names(&paths.cert_path) {
        Ok(names) if names.iter().any(|n| n == &wildcard) && paths.key_path.exists() => {
            Ok(Some(paths))
        }
        Ok(_) => Ok(None),
        Err(e) => {
            debug!(parent, error = %e, "Parent certificate unreadable, not offering reuse");
            Ok(None)
        }
    }
}

/// Something that can answer the operator-facing questions of issuance
pub trait Operator {
    fn confirm(&self, prompt: &Prompt<'_>) -> bool;
}

impl<F> Operator for F
where
    F: Fn(&Prompt<'_>) -> bool,
{
    fn confirm(&self, prompt: &Prompt<'_>) -> bool {
        self(prompt)
    }
}

#[derive(Debug)]
pub enum Prompt<'a> {
    ReuseWildcard {
        domain: &'a str,
        paths: &'a CertPaths,
    },
    /// Publish these records, then confirm
    PublishChallenge {
        domain: &'a str,
        challenges: &'a [CertificateChallenge],
    },
    GenerateDefaultCertificate {
        cert_path: &'a Path,
    },
}

#[derive(Debug)]
pub enum IssuanceOutcome {
    Reused(DomainRecord),
    Issued(DomainRecord),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfSignedStatus {
    Present,
    ConfirmationRequired,
    Generated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed,
    Failed { command: String, output: String },
}

/// What [`CertificateManager::reconcile`] changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records whose certificate files were gone
    pub missing_files: Vec<String>,
    /// Pending issuances left behind by a session that no longer runs
    pub abandoned: Vec<String>,
    /// Records left untouched because their files could not be checked
    pub unreadable: Vec<String>,
}

/// Whether a certificate file is known to be there
#[derive(Debug)]
enum FilePresence {
    Present,
    Missing,
    Unreadable(std::io::Error),
}

impl FilePresence {
    fn of(path: &Path) -> Self {
        Self::classify(path.try_exists())
    }

    fn classify(checked: std::io::Result<bool>) -> Self {
        match checked {
            Ok(true) => FilePresence::Present,
            Ok(false) => FilePresence::Missing,
            Err(e) => FilePresence::Unreadable(e),
        }
    }

    /// Combined presence of a certificate/key pair; unreadable wins over missing
    fn of_pair(paths: &CertPaths) -> Self {
        match (Self::of(&paths.cert_path), Self::of(&paths.key_path)) {
            (FilePresence::Unreadable(e), _) | (_, FilePresence::Unreadable(e)) => {
                FilePresence::Unreadable(e)
            }
            (FilePresence::Present, FilePresence::Present) => FilePresence::Present,
            _ => FilePresence::Missing,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CertificateStatus {
    pub domain: String,
    pub state: CertState,
    pub days_remaining: Option<i64>,
    pub error: Option<String>,
}

/// Timing and path settings for the lifecycle manager
#[derive(Debug, Clone)]
pub struct CertificateSettings {
    pub default_cert: PathBuf,
    pub default_key: PathBuf,
    pub common_name: String,
    pub key_bits: u32,
    pub validity_days: u32,
    pub renewal_days: i64,
    pub renewal_interval: Duration,
    pub propagation_attempts: u32,
    pub propagation_interval: Duration,
    pub propagation_timeout: Duration,
    pub log_file: PathBuf,
}

impl CertificateSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_cert: config.tls.default_cert.clone(),
            default_key: config.tls.default_key.clone(),
            common_name: config.tls.common_name.clone(),
            key_bits: config.tls.key_bits,
            validity_days: config.tls.validity_days,
            renewal_days: config.acme.renewal_days as i64,
            renewal_interval: config.acme.renewal_interval(),
            propagation_attempts: config.acme.propagation.attempts,
            propagation_interval: config.acme.propagation.interval(),
            propagation_timeout: config.acme.propagation.timeout(),
            log_file: config.acme.log_file.clone(),
        }
    }

    fn self_signed_spec(&self) -> SelfSignedSpec {
        SelfSignedSpec {
            cert_path: self.default_cert.clone(),
            key_path: self.default_key.clone(),
            common_name: self.common_name.clone(),
            key_bits: self.key_bits,
            validity_days: self.validity_days,
        }
    }
}

/// Releases a domain's single-flight slot when dropped
struct InFlightGuard {
    domain: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.domain);
    }
}

/// An issuance waiting for its TXT records to be published
pub struct PendingIssuance<P> {
    pub domain: String,
    pub challenges: Vec<CertificateChallenge>,
    handle: P,
    _guard: InFlightGuard,
}

impl<P> fmt::Debug for PendingIssuance<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingIssuance")
            .field("domain", &self.domain)
            .field("challenges", &self.challenges)
            .finish_non_exhaustive()
    }
}

pub struct CertificateManager<T> {
    db: Arc<Database>,
    tools: T,
    settings: CertificateSettings,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl<T: ToolRunner> CertificateManager<T> {
    pub fn new(db: Arc<Database>, tools: T, settings: CertificateSettings) -> Self {
        Self {
            db,
            tools,
            settings,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn settings(&self) -> &CertificateSettings {
        &self.settings
    }

    pub fn tools(&self) -> &T {
        &self.tools
    }

    // ==================== Default certificate ====================

    /// State of the process-wide default pair
    pub fn default_certificate_state(&self) -> CertState {
        if self.settings.default_cert.exists() && self.settings.default_key.exists() {
            CertState::SelfSigned
        } else {
            CertState::None
        }
    }

    /// Make sure the default listener pair exists.
    ///
    /// Generating it needs `Confirmation::Confirmed`; without it the call only
    /// reports that confirmation is required. Any failure is wrapped in
    /// `SelfSignedBootstrap`.
    pub async fn ensure_self_signed(&self, confirmation: Confirmation) -> Result<SelfSignedStatus> {
        if self.default_certificate_state() == CertState::SelfSigned {
            return Ok(SelfSignedStatus::Present);
        }
        if confirmation != Confirmation::Confirmed {
            return Ok(SelfSignedStatus::ConfirmationRequired);
        }

        let spec = self.settings.self_signed_spec();
        info!(cert = %spec.cert_path.display(), cn = %spec.common_name, "Generating default certificate");

        // Only files this call creates are removed again on failure
        let fresh: Vec<&Path> = [spec.cert_path.as_path(), spec.key_path.as_path()]
            .into_iter()
            .filter(|path| !matches!(path.try_exists(), Ok(true)))
            .collect();

        let generated: Result<()> = match self.tools.generate_self_signed(&spec).await {
            Ok(()) if self.default_certificate_state() == CertState::SelfSigned => Ok(()),
            Ok(()) => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} was not created", spec.cert_path.display()),
            )
            .into()),
            Err(e) => Err(e),
        };

        if let Err(e) = generated {
            for path in fresh {
                match std::fs::remove_file(path) {
                    Ok(()) => debug!(path = %path.display(), "Removed partial default certificate file"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!(path = %path.display(), error = %err, "Failed to remove partial file"),
                }
            }
            return Err(RegistryError::SelfSignedBootstrap(Box::new(e)));
        }

        Ok(SelfSignedStatus::Generated)
    }

    // ==================== Issuance ====================

    /// Current lifecycle state of a record's certificate
    pub fn certificate_state(&self, domain: &str) -> Result<CertState> {
        let record = self.record(domain)?;
        Ok(self.state_of(&record))
    }

    fn state_of(&self, record: &DomainRecord) -> CertState {
        match record.ssl_state {
            SslState::Pending => CertState::PendingIssuance,
            SslState::Failed => CertState::Failed,
            SslState::None => CertState::None,
            SslState::Issued => match record.cert_paths() {
                None => CertState::None,
                Some(paths) => match days_remaining(&paths.cert_path) {
                    Ok(days) if days <= self.settings.renewal_days => CertState::RenewalDue,
                    Ok(_) => CertState::Issued,
                    Err(_) => CertState::Failed,
                },
            },
        }
    }

    /// Point `domain` at its parent's wildcard certificate
    pub fn reuse_parent_wildcard(&self, domain: &str, paths: &CertPaths) -> Result<DomainRecord> {
        let record = self.record(domain)?;
        self.db.update_ssl(
            &record.domain,
            SslMode::Letsencrypt,
            Some(paths),
            SslState::Issued,
            None,
        )?;
        info!(domain = %record.domain, cert = %paths.cert_path.display(), "Reusing parent wildcard certificate");
        self.record(domain)
    }

    /// Start a DNS-01 order; at most one per domain at a time
    pub async fn begin_issuance(
        &self,
        domain: &str,
        email: &str,
    ) -> Result<PendingIssuance<T::Pending>> {
        let record = self.record(domain)?;
        let guard = self.claim(&record.domain)?;

        if record.ssl_state == SslState::Pending {
            if !self.is_abandoned(&record) {
                return Err(RegistryError::IssuanceInProgress(record.domain));
            }
            warn!(domain = %record.domain, "Taking over abandoned pending issuance");
        }

        let email = if email.trim().is_empty() {
            record.email.clone()
        } else {
            email.trim().to_string()
        };

        self.db.set_ssl_state(&record.domain, SslState::Pending, None)?;

        let request = IssueRequest {
            domain: record.domain.clone(),
            email,
        };
        let issuance = match self.tools.issue_certificate(&request).await {
            Ok(issuance) => issuance,
            Err(e) => {
                self.mark_failed(&record.domain, &e);
                return Err(e);
            }
        };

        for challenge in &issuance.challenges {
            info!(
                domain = %challenge.domain,
                record = %challenge.record_name,
                value = %challenge.value,
                "DNS challenge ready to publish"
            );
        }

        Ok(PendingIssuance {
            domain: record.domain,
            challenges: issuance.challenges,
            handle: issuance.handle,
            _guard: guard,
        })
    }

    /// Wait for the published records, finish the order and persist the result
    pub async fn complete_issuance(&self, pending: PendingIssuance<T::Pending>) -> Result<DomainRecord> {
        let PendingIssuance {
            domain,
            challenges,
            handle,
            _guard,
        } = pending;

        if let Err(e) = self.wait_for_propagation(&challenges).await {
            self.tools.cancel_issuance(handle).await;
            self.mark_failed(&domain, &e);
            return Err(e);
        }

        let paths = match self.tools.complete_issuance(handle).await {
            Ok(paths) => paths,
            Err(e) => {
                self.mark_failed(&domain, &e);
                return Err(e);
            }
        };

        for path in [&paths.cert_path, &paths.key_path] {
            if !path.exists() {
                let e = RegistryError::from_io(
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "issued file missing after successful issuance",
                    ),
                    path.display(),
                );
                self.mark_failed(&domain, &e);
                return Err(e);
            }
        }

        self.db
            .update_ssl(&domain, SslMode::Letsencrypt, Some(&paths), SslState::Issued, None)?;
        info!(domain = %domain, cert = %paths.cert_path.display(), "Certificate issued");

        self.record(&domain)
    }

    /// Abandon an issuance the operator declined to continue
    pub async fn cancel_issuance(&self, pending: PendingIssuance<T::Pending>) -> Result<()> {
        let PendingIssuance {
            domain,
            handle,
            _guard,
            ..
        } = pending;

        self.tools.cancel_issuance(handle).await;

        let restored = match self.db.get_domain(&domain)?.and_then(|r| r.cert_paths()) {
            Some(paths) if paths.cert_path.exists() => SslState::Issued,
            _ => SslState::None,
        };
        self.db.set_ssl_state(&domain, restored, None)?;
        info!(domain = %domain, "Issuance cancelled by operator");
        Ok(())
    }

    /// Run the whole issuance flow, asking `operator` wherever a decision is needed
    pub async fn obtain_certificate(
        &self,
        domain: &str,
        email: &str,
        operator: &impl Operator,
    ) -> Result<IssuanceOutcome> {
        self.reconcile()?;

        let record = self.record(domain)?;
        let source = wildcard_source(&self.db, &record.domain)?;

        if let IssuanceDecision::OfferWildcardReuse(paths) = decide_issuance(&record, source) {
            let prompt = Prompt::ReuseWildcard {
                domain: &record.domain,
                paths: &paths,
            };
            if operator.confirm(&prompt) {
                return Ok(IssuanceOutcome::Reused(
                    self.reuse_parent_wildcard(&record.domain, &paths)?,
                ));
            }
        }

        let pending = self.begin_issuance(&record.domain, email).await?;

        let prompt = Prompt::PublishChallenge {
            domain: &pending.domain,
            challenges: &pending.challenges,
        };
        if !operator.confirm(&prompt) {
            self.cancel_issuance(pending).await?;
            return Ok(IssuanceOutcome::Cancelled);
        }

        Ok(IssuanceOutcome::Issued(self.complete_issuance(pending).await?))
    }

    /// Poll DNS until every challenge value is visible, within the configured bounds
    pub async fn wait_for_propagation(&self, challenges: &[CertificateChallenge]) -> Result<()> {
        let attempts = self.settings.propagation_attempts.max(1);
        let interval = self.settings.propagation_interval;
        let deadline = Instant::now() + self.settings.propagation_timeout;

        let mut made = 0;
        while made < attempts {
            made += 1;

            let mut visible = true;
            for challenge in challenges {
                match self.tools.query_txt_record(&challenge.record_name).await {
                    Ok(values) if values.iter().any(|v| v == &challenge.value) => {}
                    Ok(values) => {
                        debug!(record = %challenge.record_name, found = ?values, attempt = made, "TXT record not visible yet");
                        visible = false;
                    }
                    Err(e) => {
                        warn!(record = %challenge.record_name, error = %e, attempt = made, "TXT lookup failed");
                        visible = false;
                    }
                }
            }

            if visible {
                info!(attempts = made, "DNS challenge records propagated");
                return Ok(());
            }

            if made == attempts || Instant::now() + interval > deadline {
                break;
            }
            tokio::time::sleep(interval).await;
        }

        let record = challenges
            .first()
            .map(|c| c.record_name.clone())
            .unwrap_or_default();
        warn!(record = %record, attempts = made, "DNS propagation timed out");
        Err(RegistryError::PropagationTimeout {
            record,
            attempts: made,
        })
    }

    // ==================== Renewal and diagnostics ====================

    /// Re-run the ACME client's renewal for the certificate `domain` uses
    pub async fn renew(&self, domain: &str) -> Result<RenewOutcome> {
        let record = self.record(domain)?;
        let paths = record.cert_paths().ok_or_else(|| {
            RegistryError::validation("domain", format!("{} has no issued certificate", record.domain))
        })?;
        let cert_name = cert_name_for(&paths, &record.domain);

        info!(domain = %record.domain, cert_name = %cert_name, "Renewing certificate");

        match self.tools.renew_certificate(&cert_name).await {
            Ok(()) => {
                self.db.set_ssl_state(&record.domain, SslState::Issued, None)?;
                Ok(RenewOutcome::Renewed)
            }
            Err(RegistryError::ToolExecution { command, output, .. }) => {
                let message = format!("renewal failed: {}", command);
                self.db
                    .set_ssl_state(&record.domain, record.ssl_state, Some(&message))?;
                Ok(RenewOutcome::Failed { command, output })
            }
            Err(e) => Err(e),
        }
    }

    /// Renew every certificate inside the renewal window, once per certificate file
    pub async fn renew_due(&self) -> Result<Vec<(String, RenewOutcome)>> {
        let mut seen = HashSet::new();
        let mut results = Vec::new();

        for record in self.db.list_domains()? {
            if self.state_of(&record) != CertState::RenewalDue {
                continue;
            }
            let Some(paths) = record.cert_paths() else {
                continue;
            };
            if !seen.insert(paths.cert_path.clone()) {
                continue;
            }

            let outcome = self.renew(&record.domain).await?;
            if let RenewOutcome::Failed { command, .. } = &outcome {
                error!(domain = %record.domain, command = %command, "Certificate renewal failed");
            }
            results.push((record.domain, outcome));
        }

        Ok(results)
    }

    /// Periodic renewal sweep until shutdown is signalled
    pub async fn run_renewal_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let period = self.settings.renewal_interval.max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.renew_due().await {
                        Ok(results) if results.is_empty() => debug!("No certificates due for renewal"),
                        Ok(results) => {
                            let renewed = results
                                .iter()
                                .filter(|(_, o)| *o == RenewOutcome::Renewed)
                                .count();
                            info!(renewed, attempted = results.len(), "Renewal sweep finished");
                        }
                        Err(e) => error!(error = %e, "Renewal sweep failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Renewal loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Live TLS handshake check; never changes registry state
    pub async fn verify(&self, domain: &str) -> Result<VerifyReport> {
        let record = self.record(domain)?;
        self.tools.verify_tls(base_domain(&record.domain)).await
    }

    /// Last `lines` lines of the ACME client log
    pub fn tail_logs(&self, lines: usize) -> Result<Vec<String>> {
        let path = &self.settings.log_file;
        let content =
            std::fs::read_to_string(path).map_err(|e| RegistryError::from_io(e, path.display()))?;
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].iter().map(|l| l.to_string()).collect())
    }

    /// One status line per record
    pub fn status_report(&self) -> Result<Vec<CertificateStatus>> {
        Ok(self
            .db
            .list_domains()?
            .into_iter()
            .map(|record| CertificateStatus {
                state: self.state_of(&record),
                days_remaining: record
                    .cert_paths()
                    .and_then(|p| days_remaining(&p.cert_path).ok()),
                error: record.ssl_error.clone(),
                domain: record.domain,
            })
            .collect())
    }

    // ==================== Recovery ====================

    /// Bring persisted state back in line with the filesystem.
    ///
    /// A record is only trusted as issued while both files exist; pending rows
    /// older than the propagation ceiling with no live issuance in this
    /// process are marked failed. A record whose files can't be checked (for
    /// example a live directory this user may not read) is left as it is.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for record in self.db.list_domains()? {
            if let Some(paths) = record.cert_paths() {
                match FilePresence::of_pair(&paths) {
                    FilePresence::Present => {}
                    FilePresence::Unreadable(e) => {
                        warn!(
                            domain = %record.domain,
                            cert = %paths.cert_path.display(),
                            error = %e,
                            "Cannot check certificate files, leaving record unchanged"
                        );
                        report.unreadable.push(record.domain);
                        continue;
                    }
                    FilePresence::Missing => {
                        let message = format!(
                            "certificate files missing: {}",
                            paths.cert_path.display()
                        );
                        warn!(domain = %record.domain, "{}", message);
                        self.db.update_ssl(
                            &record.domain,
                            record.ssl_mode,
                            None,
                            SslState::Failed,
                            Some(&message),
                        )?;
                        report.missing_files.push(record.domain);
                        continue;
                    }
                }
            }

            if record.ssl_state == SslState::Pending
                && !self.in_flight.lock().contains(&record.domain)
                && self.is_abandoned(&record)
            {
                warn!(domain = %record.domain, since = %record.updated_at, "Pending issuance abandoned");
                self.db.set_ssl_state(
                    &record.domain,
                    SslState::Failed,
                    Some("issuance did not complete"),
                )?;
                report.abandoned.push(record.domain);
            }
        }

        if !report.missing_files.is_empty() || !report.abandoned.is_empty() {
            info!(
                missing_files = report.missing_files.len(),
                abandoned = report.abandoned.len(),
                unreadable = report.unreadable.len(),
                "Registry reconciled with certificate files"
            );
        }
        Ok(report)
    }

    // ==================== Helpers ====================

    fn record(&self, domain: &str) -> Result<DomainRecord> {
        self.db
            .get_domain(domain)?
            .ok_or_else(|| RegistryError::NotFound(domain.to_string()))
    }

    fn claim(&self, domain: &str) -> Result<InFlightGuard> {
        if !self.in_flight.lock().insert(domain.to_string()) {
            return Err(RegistryError::IssuanceInProgress(domain.to_string()));
        }
        Ok(InFlightGuard {
            domain: domain.to_string(),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    fn is_abandoned(&self, record: &DomainRecord) -> bool {
        match NaiveDateTime::parse_from_str(&record.updated_at, "%Y-%m-%d %H:%M:%S") {
            Ok(at) => {
                let age = Utc::now().naive_utc() - at;
                age.to_std().unwrap_or_default() > self.settings.propagation_timeout
            }
            Err(_) => true,
        }
    }

    fn mark_failed(&self, domain: &str, err: &RegistryError) {
        error!(domain, error = %err, "Certificate issuance failed");
        if let Err(e) = self.db.set_ssl_state(domain, SslState::Failed, Some(&err.to_string())) {
            error!(domain, error = %e, "Failed to record issuance failure");
        }
    }
}

/// Directory name the ACME client filed the certificate under
fn cert_name_for(paths: &CertPaths, domain: &str) -> String {
    paths
        .cert_path
        .parent()
        .and_then(|dir| dir.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| lineage_name(domain))
}

// ==================== X.509 inspection ====================

fn read_certificate_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| RegistryError::from_io(e, path.display()))
}

fn invalid_certificate(path: &Path, err: impl fmt::Display) -> RegistryError {
    RegistryError::validation(
        "certificate",
        format!("{}: {}", path.display(), err),
    )
}

/// Whole days until the certificate's notAfter (negative once expired)
pub fn days_remaining(path: &Path) -> Result<i64> {
    let data = read_certificate_pem(path)?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&data).map_err(|e| invalid_certificate(path, e))?;
    let cert = pem.parse_x509().map_err(|e| invalid_certificate(path, e))?;

    let expires_at = cert.validity().not_after.timestamp();
    let now = Utc::now().timestamp();
    Ok((expires_at - now).div_euclid(86400))
}

/// DNS names on the certificate (SANs, falling back to the common name)
pub fn certificate_names(path: &Path) -> Result<Vec<String>> {
    let data = read_certificate_pem(path)?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&data).map_err(|e| invalid_certificate(path, e))?;
    let cert = pem.parse_x509().map_err(|e| invalid_certificate(path, e))?;

    let mut names: Vec<String> = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    if names.is_empty() {
        names.extend(
            cert.subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(str::to_ascii_lowercase),
        );
    }
    Ok(names)
}
