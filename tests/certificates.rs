//! Certificate lifecycle tests against an in-process tool backend

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hostgate::certs::{
    CertState, CertificateManager, CertificateSettings, IssuanceOutcome, Prompt, RenewOutcome,
    SelfSignedStatus,
};
use hostgate::db::{CertPaths, Database, SiteType, SslMode, SslState};
use hostgate::domains::{CertificateChoice, Confirmation, DomainRegistry, DomainSpec, SubdomainSpec};
use hostgate::error::{RegistryError, Result};
use hostgate::tools::{
    challenge_record_name, tool_failure, CertificateChallenge, IssueRequest, Issuance,
    SelfSignedSpec, ToolRunner, VerifyReport,
};

/// Shared view of what the fake backend was asked to do
#[derive(Default)]
struct Recorder {
    /// TXT record name -> published values
    dns: Mutex<HashMap<String, Vec<String>>>,
    issued: AtomicUsize,
    cancelled: AtomicUsize,
    renewed: Mutex<Vec<String>>,
    /// Lineage names orders were placed under
    lineages: Mutex<Vec<String>>,
    fail_renewals: AtomicBool,
    fail_issue: AtomicBool,
    fail_complete: AtomicBool,
    fail_self_signed: AtomicBool,
}

impl Recorder {
    fn publish(&self, challenges: &[CertificateChallenge]) {
        let mut dns = self.dns.lock().unwrap();
        for challenge in challenges {
            dns.entry(challenge.record_name.clone())
                .or_default()
                .push(challenge.value.clone());
        }
    }
}

struct FakeTools {
    root: PathBuf,
    recorder: Arc<Recorder>,
}

struct FakePending {
    identifiers: Vec<String>,
    cert_name: String,
}

fn write_pair(dir: &Path, names: Vec<String>) -> CertPaths {
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names).unwrap();
    std::fs::create_dir_all(dir).unwrap();
    let paths = CertPaths {
        cert_path: dir.join("fullchain.pem"),
        key_path: dir.join("privkey.pem"),
    };
    std::fs::write(&paths.cert_path, cert.pem()).unwrap();
    std::fs::write(&paths.key_path, key_pair.serialize_pem()).unwrap();
    paths
}

impl ToolRunner for FakeTools {
    type Pending = FakePending;

    async fn issue_certificate(&self, request: &IssueRequest) -> Result<Issuance<FakePending>> {
        self.recorder.issued.fetch_add(1, Ordering::SeqCst);
        if self.recorder.fail_issue.load(Ordering::SeqCst) {
            return Err(tool_failure(
                format!("certbot certonly --cert-name {}", request.cert_name()),
                "exit status: 1",
                "Error creating new order".to_string(),
            ));
        }
        self.recorder.lineages.lock().unwrap().push(request.cert_name());
        let challenges = request
            .identifiers()
            .iter()
            .map(|id| CertificateChallenge {
                domain: id.clone(),
                record_name: challenge_record_name(id),
                value: format!("token-for-{}", id),
            })
            .collect();
        Ok(Issuance {
            challenges,
            handle: FakePending {
                identifiers: request.identifiers(),
                cert_name: request.cert_name(),
            },
        })
    }

    async fn complete_issuance(&self, pending: FakePending) -> Result<CertPaths> {
        if self.recorder.fail_complete.load(Ordering::SeqCst) {
            return Err(tool_failure(
                format!("certbot certonly --cert-name {}", pending.cert_name),
                "exit status: 1",
                "Incorrect TXT record".to_string(),
            ));
        }
        Ok(write_pair(&self.root.join(&pending.cert_name), pending.identifiers))
    }

    async fn cancel_issuance(&self, _pending: FakePending) {
        self.recorder.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    async fn renew_certificate(&self, cert_name: &str) -> Result<()> {
        self.recorder.renewed.lock().unwrap().push(cert_name.to_string());
        if self.recorder.fail_renewals.load(Ordering::SeqCst) {
            return Err(tool_failure(
                format!("certbot renew --cert-name {}", cert_name),
                "exit status: 1",
                "Challenge failed".to_string(),
            ));
        }
        Ok(())
    }

    async fn generate_self_signed(&self, spec: &SelfSignedSpec) -> Result<()> {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![spec.common_name.clone()]).unwrap();
        if let Some(parent) = spec.cert_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&spec.cert_path, cert.pem()).unwrap();
        if self.recorder.fail_self_signed.load(Ordering::SeqCst) {
            // Dies after the certificate but before the key, like an interrupted openssl
            return Err(tool_failure(
                format!("openssl req -x509 -out {}", spec.cert_path.display()),
                "exit status: 1",
                "unable to write private key".to_string(),
            ));
        }
        std::fs::write(&spec.key_path, key_pair.serialize_pem()).unwrap();
        Ok(())
    }

    async fn query_txt_record(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.recorder.dns.lock().unwrap().get(name).cloned().unwrap_or_default())
    }

    async fn verify_tls(&self, domain: &str) -> Result<VerifyReport> {
        Ok(VerifyReport {
            domain: domain.to_string(),
            verified: true,
            output: "Verify return code: 0 (ok)".to_string(),
        })
    }
}

struct Harness {
    dir: tempfile::TempDir,
    registry: DomainRegistry,
    manager: CertificateManager<FakeTools>,
    recorder: Arc<Recorder>,
}

fn settings(dir: &Path) -> CertificateSettings {
    CertificateSettings {
        default_cert: dir.join("ssl").join("default.crt"),
        default_key: dir.join("ssl").join("default.key"),
        common_name: "hostgate-default".to_string(),
        key_bits: 2048,
        validity_days: 365,
        renewal_days: 30,
        renewal_interval: Duration::from_secs(3600),
        propagation_attempts: 3,
        propagation_interval: Duration::from_millis(10),
        propagation_timeout: Duration::from_secs(600),
        log_file: dir.join("letsencrypt.log"),
    }
}

fn harness_with(adjust: impl FnOnce(&mut CertificateSettings)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let recorder = Arc::new(Recorder::default());
    let tools = FakeTools {
        root: dir.path().join("live"),
        recorder: Arc::clone(&recorder),
    };
    let mut settings = settings(dir.path());
    adjust(&mut settings);

    Harness {
        registry: DomainRegistry::new(Arc::clone(&db)),
        manager: CertificateManager::new(db, tools, settings),
        recorder,
        dir,
    }
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn domain(name: &str) -> DomainSpec {
    DomainSpec {
        domain: name.to_string(),
        email: "ops@example.com".to_string(),
        owner: "ops".to_string(),
        site_type: SiteType::Server,
        target: "3000".to_string(),
        ssl_mode: SslMode::Letsencrypt,
    }
}

fn subdomain(name: &str, certificate: CertificateChoice) -> SubdomainSpec {
    SubdomainSpec {
        name: name.to_string(),
        site_type: SiteType::Server,
        target: "3001".to_string(),
        email: None,
        owner: None,
        ssl_mode: None,
        certificate,
    }
}

/// Publishes every challenge and accepts every offer
fn publishing_operator(recorder: &Arc<Recorder>) -> impl Fn(&Prompt<'_>) -> bool + '_ {
    move |prompt: &Prompt<'_>| {
        if let Prompt::PublishChallenge { challenges, .. } = prompt {
            recorder.publish(challenges);
        }
        true
    }
}

#[tokio::test]
async fn test_issue_certificate_for_root_domain() {
    let h = harness();
    h.registry.register_domain(&domain("example.com")).unwrap();

    let outcome = h
        .manager
        .obtain_certificate("example.com", "", &publishing_operator(&h.recorder))
        .await
        .unwrap();

    let IssuanceOutcome::Issued(record) = outcome else {
        panic!("expected a new certificate, got {:?}", outcome);
    };
    let paths = record.cert_paths().unwrap();
    assert!(paths.cert_path.exists());
    assert!(paths.key_path.exists());
    assert_eq!(record.ssl_state, SslState::Issued);
    assert_eq!(h.manager.certificate_state("example.com").unwrap(), CertState::Issued);
    assert_eq!(h.recorder.issued.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_wildcard_is_shared_with_subdomains() {
    let h = harness();
    h.registry.register_domain(&domain("example.com")).unwrap();
    h.registry.register_domain(&domain("*.example.com")).unwrap();

    h.manager
        .obtain_certificate("*.example.com", "", &publishing_operator(&h.recorder))
        .await
        .unwrap();
    let wildcard_paths = h.registry.get_domain("*.example.com").unwrap().cert_paths().unwrap();

    // New subdomains inherit the wildcard without any issuance
    let api = h
        .registry
        .add_subdomain("example.com", &subdomain("api", CertificateChoice::InheritFromParent))
        .unwrap();
    assert_eq!(api.cert_paths(), Some(wildcard_paths.clone()));

    // Existing subdomains are offered the wildcard before a new order
    h.registry
        .add_subdomain("example.com", &subdomain("www", CertificateChoice::Without))
        .unwrap();
    let outcome = h
        .manager
        .obtain_certificate("www.example.com", "", &publishing_operator(&h.recorder))
        .await
        .unwrap();

    let IssuanceOutcome::Reused(record) = outcome else {
        panic!("expected wildcard reuse, got {:?}", outcome);
    };
    assert_eq!(record.cert_paths(), Some(wildcard_paths));
    assert_eq!(h.recorder.issued.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_declining_wildcard_reuse_issues_dedicated_certificate() {
    let h = harness();
    h.registry.register_domain(&domain("example.com")).unwrap();
    h.registry.register_domain(&domain("*.example.com")).unwrap();
    h.manager
        .obtain_certificate("*.example.com", "", &publishing_operator(&h.recorder))
        .await
        .unwrap();
    h.registry
        .add_subdomain("example.com", &subdomain("shop", CertificateChoice::Without))
        .unwrap();

    let recorder = Arc::clone(&h.recorder);
    let operator = move |prompt: &Prompt<'_>| match prompt {
        Prompt::ReuseWildcard { .. } => false,
        Prompt::PublishChallenge { challenges, .. } => {
            recorder.publish(challenges);
            true
        }
        Prompt::GenerateDefaultCertificate { .. } => false,
    };

    let outcome = h
        .manager
        .obtain_certificate("shop.example.com", "", &operator)
        .await
        .unwrap();
    assert!(matches!(outcome, IssuanceOutcome::Issued(_)));
    assert_eq!(h.recorder.issued.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unpublished_challenge_times_out() {
    let h = harness();
    h.registry.register_domain(&domain("example.com")).unwrap();

    // Confirms without publishing anything
    let operator = |_: &Prompt<'_>| true;
    let err = h
        .manager
        .obtain_certificate("example.com", "", &operator)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RegistryError::PropagationTimeout { ref record, attempts: 3 } if record == "_acme-challenge.example.com"
    ));
    assert!(err.is_retryable());

    let record = h.registry.get_domain("example.com").unwrap();
    assert_eq!(record.ssl_state, SslState::Failed);
    assert!(record.ssl_error.is_some());
    assert!(record.cert_paths().is_none());
    assert_eq!(h.recorder.cancelled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_declined_challenge_cancels_issuance() {
    let h = harness();
    h.registry.register_domain(&domain("example.com")).unwrap();

    let operator = |_: &Prompt<'_>| false;
    let outcome = h
        .manager
        .obtain_certificate("example.com", "", &operator)
        .await
        .unwrap();

    assert!(matches!(outcome, IssuanceOutcome::Cancelled));
    assert_eq!(h.manager.certificate_state("example.com").unwrap(), CertState::None);
    assert_eq!(h.recorder.cancelled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_one_issuance_per_domain_at_a_time() {
    let h = harness();
    h.registry.register_domain(&domain("example.com")).unwrap();

    let pending = h.manager.begin_issuance("example.com", "").await.unwrap();
    assert_eq!(
        h.manager.certificate_state("example.com").unwrap(),
        CertState::PendingIssuance
    );

    let err = h.manager.begin_issuance("example.com", "").await.unwrap_err();
    assert!(matches!(err, RegistryError::IssuanceInProgress(ref d) if d == "example.com"));

    h.manager.cancel_issuance(pending).await.unwrap();
    let pending = h.manager.begin_issuance("example.com", "").await.unwrap();
    h.recorder.publish(&pending.challenges);
    let record = h.manager.complete_issuance(pending).await.unwrap();
    assert_eq!(record.ssl_state, SslState::Issued);
}

#[tokio::test]
async fn test_reconcile_marks_missing_files_failed() {
    let h = harness();
    h.registry.register_domain(&domain("example.com")).unwrap();
    h.manager
        .obtain_certificate("example.com", "", &publishing_operator(&h.recorder))
        .await
        .unwrap();

    let paths = h.registry.get_domain("example.com").unwrap().cert_paths().unwrap();
    std::fs::remove_file(&paths.cert_path).unwrap();

    let report = h.manager.reconcile().unwrap();
    assert_eq!(report.missing_files, vec!["example.com".to_string()]);

    let record = h.registry.get_domain("example.com").unwrap();
    assert_eq!(record.ssl_state, SslState::Failed);
    assert!(record.cert_paths().is_none());

    // Nothing left to fix on a second pass
    assert_eq!(h.manager.reconcile().unwrap().missing_files.len(), 0);
}

#[tokio::test]
async fn test_ensure_self_signed_needs_confirmation() {
    let h = harness();
    assert_eq!(h.manager.default_certificate_state(), CertState::None);

    let status = h.manager.ensure_self_signed(Confirmation::Declined).await.unwrap();
    assert_eq!(status, SelfSignedStatus::ConfirmationRequired);
    assert!(!h.manager.settings().default_cert.exists());

    let status = h.manager.ensure_self_signed(Confirmation::Confirmed).await.unwrap();
    assert_eq!(status, SelfSignedStatus::Generated);
    assert!(h.manager.settings().default_cert.exists());
    assert!(h.manager.settings().default_key.exists());
    assert_eq!(h.manager.default_certificate_state(), CertState::SelfSigned);

    let status = h.manager.ensure_self_signed(Confirmation::Declined).await.unwrap();
    assert_eq!(status, SelfSignedStatus::Present);
}

#[tokio::test]
async fn test_renew_reports_tool_failure() {
    let h = harness();
    h.registry.register_domain(&domain("example.com")).unwrap();
    h.manager
        .obtain_certificate("example.com", "", &publishing_operator(&h.recorder))
        .await
        .unwrap();

    assert_eq!(h.manager.renew("example.com").await.unwrap(), RenewOutcome::Renewed);
    assert_eq!(*h.recorder.renewed.lock().unwrap(), vec!["example.com".to_string()]);

    h.recorder.fail_renewals.store(true, Ordering::SeqCst);
    let outcome = h.manager.renew("example.com").await.unwrap();
    let RenewOutcome::Failed { command, output } = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert_eq!(command, "certbot renew --cert-name example.com");
    assert_eq!(output, "Challenge failed");

    let record = h.registry.get_domain("example.com").unwrap();
    assert_eq!(record.ssl_state, SslState::Issued);
    assert!(record.ssl_error.unwrap().contains("renewal failed"));
}

#[tokio::test]
async fn test_renew_due_renews_shared_certificate_once() {
    // rcgen certificates run for centuries, so widen the window to cover them
    let h = harness_with(|s| s.renewal_days = i64::MAX / 2);
    h.registry.register_domain(&domain("example.com")).unwrap();
    h.registry.register_domain(&domain("*.example.com")).unwrap();
    h.manager
        .obtain_certificate("*.example.com", "", &publishing_operator(&h.recorder))
        .await
        .unwrap();
    h.registry
        .add_subdomain("example.com", &subdomain("api", CertificateChoice::InheritFromParent))
        .unwrap();

    assert_eq!(
        h.manager.certificate_state("api.example.com").unwrap(),
        CertState::RenewalDue
    );

    let results = h.manager.renew_due().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(
        *h.recorder.renewed.lock().unwrap(),
        vec!["example.com-wildcard".to_string()]
    );
}

#[tokio::test]
async fn test_status_report_and_logs() {
    let h = harness();
    h.registry.register_domain(&domain("example.com")).unwrap();
    h.registry.register_domain(&domain("example.org")).unwrap();
    h.manager
        .obtain_certificate("example.com", "", &publishing_operator(&h.recorder))
        .await
        .unwrap();

    let report = h.manager.status_report().unwrap();
    let com = report.iter().find(|s| s.domain == "example.com").unwrap();
    assert_eq!(com.state, CertState::Issued);
    assert!(com.days_remaining.unwrap() > 30);
    let org = report.iter().find(|s| s.domain == "example.org").unwrap();
    assert_eq!(org.state, CertState::None);
    assert_eq!(org.days_remaining, None);

    let log = h.dir.path().join("letsencrypt.log");
    std::fs::write(&log, "one\ntwo\nthree\nfour\n").unwrap();
    assert_eq!(h.manager.tail_logs(2).unwrap(), vec!["three", "four"]);

    let report = h.manager.verify("example.com").await.unwrap();
    assert!(report.verified);
    assert_eq!(h.manager.certificate_state("example.com").unwrap(), CertState::Issued);
}

#[tokio::test]
async fn test_apex_and_wildcard_keep_separate_lineages() {
    let h = harness();
    h.registry.register_domain(&domain("example.com")).unwrap();
    h.registry.register_domain(&domain("*.example.com")).unwrap();

    h.manager
        .obtain_certificate("example.com", "", &publishing_operator(&h.recorder))
        .await
        .unwrap();
    let apex = h.registry.get_domain("example.com").unwrap().cert_paths().unwrap();
    let apex_pem = std::fs::read(&apex.cert_path).unwrap();

    h.manager
        .obtain_certificate("*.example.com", "", &publishing_operator(&h.recorder))
        .await
        .unwrap();
    let wildcard = h.registry.get_domain("*.example.com").unwrap().cert_paths().unwrap();

    assert_eq!(
        *h.recorder.lineages.lock().unwrap(),
        vec!["example.com".to_string(), "example.com-wildcard".to_string()]
    );
    assert_ne!(apex.cert_path, wildcard.cert_path);
    assert_ne!(apex.key_path, wildcard.key_path);

    // The apex pair is untouched by the wildcard order
    assert_eq!(std::fs::read(&apex.cert_path).unwrap(), apex_pem);
    assert_eq!(h.manager.certificate_state("example.com").unwrap(), CertState::Issued);
    assert!(h.manager.reconcile().unwrap().missing_files.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_reconcile_leaves_unreadable_certificates_alone() {
    use std::os::unix::fs::PermissionsExt;

    let h = harness();
    h.registry.register_domain(&domain("example.com")).unwrap();
    h.manager
        .obtain_certificate("example.com", "", &publishing_operator(&h.recorder))
        .await
        .unwrap();
    let before = h.registry.get_domain("example.com").unwrap();
    let paths = before.cert_paths().unwrap();
    let live = paths.cert_path.parent().unwrap().to_path_buf();

    std::fs::set_permissions(&live, std::fs::Permissions::from_mode(0o000)).unwrap();
    if paths.cert_path.try_exists().is_ok() {
        // Privileged users can still look inside; nothing to exercise here
        std::fs::set_permissions(&live, std::fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    let report = h.manager.reconcile();
    std::fs::set_permissions(&live, std::fs::Permissions::from_mode(0o755)).unwrap();

    let report = report.unwrap();
    assert_eq!(report.unreadable, vec!["example.com".to_string()]);
    assert!(report.missing_files.is_empty());

    let after = h.registry.get_domain("example.com").unwrap();
    assert_eq!(after.cert_paths(), Some(paths));
    assert_eq!(after.ssl_state, SslState::Issued);
    assert_eq!(after.version, before.version);
}

#[tokio::test]
async fn test_failed_self_signed_generation_leaves_no_files() {
    let h = harness();
    h.recorder.fail_self_signed.store(true, Ordering::SeqCst);

    let err = h
        .manager
        .ensure_self_signed(Confirmation::Confirmed)
        .await
        .unwrap_err();

    let RegistryError::SelfSignedBootstrap(inner) = &err else {
        panic!("expected a bootstrap failure, got {:?}", err);
    };
    assert!(matches!(**inner, RegistryError::ToolExecution { .. }), "{:?}", inner);
    assert!(!h.manager.settings().default_cert.exists());
    assert!(!h.manager.settings().default_key.exists());
    assert_eq!(h.manager.default_certificate_state(), CertState::None);

    h.recorder.fail_self_signed.store(false, Ordering::SeqCst);
    let status = h.manager.ensure_self_signed(Confirmation::Confirmed).await.unwrap();
    assert_eq!(status, SelfSignedStatus::Generated);
}

#[tokio::test]
async fn test_tool_failures_mark_record_failed_and_allow_retry() {
    let h = harness();
    h.registry.register_domain(&domain("example.com")).unwrap();

    // The order itself is refused
    h.recorder.fail_issue.store(true, Ordering::SeqCst);
    let err = h.manager.begin_issuance("example.com", "").await.unwrap_err();
    assert!(matches!(err, RegistryError::ToolExecution { .. }), "{:?}", err);
    let record = h.registry.get_domain("example.com").unwrap();
    assert_eq!(record.ssl_state, SslState::Failed);
    assert!(record.ssl_error.unwrap().contains("certbot certonly"));
    h.recorder.fail_issue.store(false, Ordering::SeqCst);

    // Validation fails after the challenge was published
    h.recorder.fail_complete.store(true, Ordering::SeqCst);
    let err = h
        .manager
        .obtain_certificate("example.com", "", &publishing_operator(&h.recorder))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::ToolExecution { .. }), "{:?}", err);
    let record = h.registry.get_domain("example.com").unwrap();
    assert_eq!(record.ssl_state, SslState::Failed);
    assert!(record.ssl_error.as_ref().unwrap().contains("Incorrect TXT record"));
    assert!(record.cert_paths().is_none());
    h.recorder.fail_complete.store(false, Ordering::SeqCst);

    // Neither failure keeps the domain claimed
    let outcome = h
        .manager
        .obtain_certificate("example.com", "", &publishing_operator(&h.recorder))
        .await
        .unwrap();
    assert!(matches!(outcome, IssuanceOutcome::Issued(_)));
    assert_eq!(h.manager.certificate_state("example.com").unwrap(), CertState::Issued);
    assert_eq!(h.recorder.issued.load(Ordering::SeqCst), 3);
}
