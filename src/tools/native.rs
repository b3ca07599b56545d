//! In-process ACME DNS-01 client built on instant-acme
//!
//! Issuance and self-signed generation happen natively; DNS lookups and the
//! live handshake check reuse the shell backend.

use super::{
    challenge_record_name, tool_failure, CertificateChallenge, IssueRequest, Issuance,
    SelfSignedSpec, ShellTools, ToolRunner, VerifyReport,
};
use crate::config::AcmeConfig;
use crate::db::CertPaths;
use crate::error::{RegistryError, Result};
use chrono::{Datelike, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLLS: u32 = 30;

pub struct NativeTools {
    config: AcmeConfig,
    shell: ShellTools,
}

/// An ACME order whose DNS-01 challenges have not been submitted yet
pub struct NativePending {
    order: Order,
    challenge_urls: Vec<String>,
    identifiers: Vec<String>,
    cert_name: String,
}

fn acme_failure(step: &str, target: &str, err: impl std::fmt::Display) -> RegistryError {
    tool_failure(format!("acme {} {}", step, target), "error", err.to_string())
}

impl NativeTools {
    pub fn new(config: AcmeConfig) -> Self {
        let shell = ShellTools::new(config.clone());
        Self { config, shell }
    }

    fn directory_url(&self) -> &str {
        self.config
            .directory_url
            .as_deref()
            .unwrap_or(LetsEncrypt::Production.url())
    }

    /// Load or create the ACME account
    async fn account(&self, email: &str) -> Result<Account> {
        let account_path = self.config.account_dir.join("account.json");

        if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = std::fs::read_to_string(&account_path)
                .map_err(|e| RegistryError::from_io(e, account_path.display()))?;
            let credentials: AccountCredentials = serde_json::from_str(&data)
                .map_err(|e| acme_failure("load-account", &account_path.display().to_string(), e))?;
            return Account::from_credentials(credentials)
                .await
                .map_err(|e| acme_failure("load-account", self.directory_url(), e));
        }

        info!(directory = %self.directory_url(), "Creating new ACME account");
        let contact = format!("mailto:{}", email);
        let contacts: Vec<&str> = if email.is_empty() {
            Vec::new()
        } else {
            vec![contact.as_str()]
        };

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contacts,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            self.directory_url(),
            None,
        )
        .await
        .map_err(|e| acme_failure("new-account", self.directory_url(), e))?;

        std::fs::create_dir_all(&self.config.account_dir)
            .map_err(|e| RegistryError::from_io(e, self.config.account_dir.display()))?;
        let data = serde_json::to_string_pretty(&credentials)
            .map_err(|e| acme_failure("save-account", &account_path.display().to_string(), e))?;
        write_private(&account_path, &data)?;
        info!(path = %account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    /// Poll until the order leaves the pending/processing states
    async fn wait_for_order(&self, order: &mut Order, name: &str, want: OrderStatus) -> Result<()> {
        for attempt in 1..=MAX_POLLS {
            let state = order
                .refresh()
                .await
                .map_err(|e| acme_failure("refresh-order", name, e))?;

            match state.status {
                status if status == want => return Ok(()),
                OrderStatus::Valid if want == OrderStatus::Ready => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(acme_failure("order", name, "order became invalid"));
                }
                status => {
                    debug!(cert_name = name, attempt, status = ?status, "Waiting for ACME order");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }

        Err(acme_failure("order", name, format!("not {:?} after {} polls", want, MAX_POLLS)))
    }
}

impl ToolRunner for NativeTools {
    type Pending = NativePending;

    async fn issue_certificate(&self, request: &IssueRequest) -> Result<Issuance<NativePending>> {
        let account = self.account(&request.email).await?;
        let identifiers = request.identifiers();
        let acme_ids: Vec<Identifier> = identifiers.iter().cloned().map(Identifier::Dns).collect();

        info!(domains = ?identifiers, "Requesting new certificate order");

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &acme_ids,
            })
            .await
            .map_err(|e| acme_failure("new-order", &request.domain, e))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| acme_failure("authorizations", &request.domain, e))?;

        let mut challenges = Vec::new();
        let mut challenge_urls = Vec::new();

        for authz in &authorizations {
            let Identifier::Dns(identifier) = &authz.identifier;

            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                ref status => {
                    return Err(acme_failure(
                        "authorization",
                        identifier,
                        format!("unexpected status {:?}", status),
                    ));
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| acme_failure("authorization", identifier, "no dns-01 challenge offered"))?;

            challenges.push(CertificateChallenge {
                domain: identifier.clone(),
                record_name: challenge_record_name(identifier),
                value: order.key_authorization(challenge).dns_value(),
            });
            challenge_urls.push(challenge.url.clone());
        }

        Ok(Issuance {
            challenges,
            handle: NativePending {
                order,
                challenge_urls,
                identifiers,
                cert_name: request.cert_name(),
            },
        })
    }

    async fn complete_issuance(&self, pending: NativePending) -> Result<CertPaths> {
        let NativePending {
            mut order,
            challenge_urls,
            identifiers,
            cert_name,
        } = pending;

        for url in &challenge_urls {
            order
                .set_challenge_ready(url)
                .await
                .map_err(|e| acme_failure("challenge-ready", &cert_name, e))?;
        }

        self.wait_for_order(&mut order, &cert_name, OrderStatus::Ready).await?;

        let mut params = CertificateParams::new(identifiers.clone())
            .map_err(|e| acme_failure("csr", &cert_name, e))?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, identifiers[0].clone());

        let private_key = KeyPair::generate().map_err(|e| acme_failure("csr", &cert_name, e))?;
        let csr = params
            .serialize_request(&private_key)
            .map_err(|e| acme_failure("csr", &cert_name, e))?;

        if order.state().status != OrderStatus::Valid {
            order
                .finalize(csr.der())
                .await
                .map_err(|e| acme_failure("finalize", &cert_name, e))?;
        }

        let mut cert_chain_pem = None;
        for _ in 0..MAX_POLLS {
            match order
                .certificate()
                .await
                .map_err(|e| acme_failure("certificate", &cert_name, e))?
            {
                Some(chain) => {
                    cert_chain_pem = Some(chain);
                    break;
                }
                None => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
        let cert_chain_pem = cert_chain_pem
            .ok_or_else(|| acme_failure("certificate", &cert_name, "certificate was never issued"))?;

        let live = self.config.live_dir(&cert_name);
        std::fs::create_dir_all(&live).map_err(|e| RegistryError::from_io(e, live.display()))?;

        let paths = CertPaths {
            cert_path: live.join("fullchain.pem"),
            key_path: live.join("privkey.pem"),
        };
        std::fs::write(&paths.cert_path, &cert_chain_pem)
            .map_err(|e| RegistryError::from_io(e, paths.cert_path.display()))?;
        write_private(&paths.key_path, &private_key.serialize_pem())?;

        info!(domains = ?identifiers, dir = %live.display(), "Certificate obtained");
        Ok(paths)
    }

    async fn cancel_issuance(&self, pending: NativePending) {
        // Unanswered authorizations expire server-side
        info!(cert_name = %pending.cert_name, "Abandoning ACME order");
    }

    async fn renew_certificate(&self, cert_name: &str) -> Result<()> {
        warn!(cert_name, "DNS-01 renewal needs the challenge published again");
        Err(tool_failure(
            format!("acme renew {}", cert_name),
            "unsupported",
            format!(
                "the native client cannot renew DNS-01 certificates unattended; run `hostctl ssl issue {}`",
                cert_name
            ),
        ))
    }

    async fn generate_self_signed(&self, spec: &SelfSignedSpec) -> Result<()> {
        let target = spec.cert_path.display().to_string();

        let mut params = CertificateParams::new(vec![spec.common_name.clone()])
            .map_err(|e| acme_failure("self-signed", &target, e))?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, spec.common_name.clone());

        let today = Utc::now();
        let expires = today + chrono::Duration::days(i64::from(spec.validity_days));
        params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
        params.not_after =
            rcgen::date_time_ymd(expires.year(), expires.month() as u8, expires.day() as u8);

        // ring only generates ECDSA/Ed25519 keys
        if spec.key_bits != 0 {
            debug!(key_bits = spec.key_bits, "Native generator uses ECDSA P-256 instead of RSA");
        }
        let key_pair = KeyPair::generate().map_err(|e| acme_failure("self-signed", &target, e))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| acme_failure("self-signed", &target, e))?;

        for path in [&spec.cert_path, &spec.key_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RegistryError::from_io(e, parent.display()))?;
            }
        }
        std::fs::write(&spec.cert_path, cert.pem())
            .map_err(|e| RegistryError::from_io(e, spec.cert_path.display()))?;
        write_private(&spec.key_path, &key_pair.serialize_pem())?;

        info!(cert = %spec.cert_path.display(), "Generated self-signed certificate");
        Ok(())
    }

    async fn query_txt_record(&self, name: &str) -> Result<Vec<String>> {
        self.shell.query_txt_record(name).await
    }

    async fn verify_tls(&self, domain: &str) -> Result<VerifyReport> {
        self.shell.verify_tls(domain).await
    }
}

/// Write a file readable only by its owner
fn write_private(path: &Path, contents: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| RegistryError::from_io(e, path.display()))?;
        std::io::Write::write_all(&mut file, contents.as_bytes())
            .map_err(|e| RegistryError::from_io(e, path.display()))?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, contents).map_err(|e| RegistryError::from_io(e, path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::pem::parse_x509_pem;

    #[tokio::test]
    async fn test_generate_self_signed_writes_pair() {
        let dir = tempfile::tempdir().unwrap();
        let tools = NativeTools::new(AcmeConfig::default());
        let spec = SelfSignedSpec {
            cert_path: dir.path().join("ssl").join("default.crt"),
            key_path: dir.path().join("ssl").join("default.key"),
            common_name: "hostgate-default".to_string(),
            key_bits: 2048,
            validity_days: 365,
        };

        tools.generate_self_signed(&spec).await.unwrap();

        let pem = std::fs::read(&spec.cert_path).unwrap();
        let (_, pem) = parse_x509_pem(&pem).unwrap();
        let cert = pem.parse_x509().unwrap();
        let cn = cert.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "hostgate-default");

        let lifetime = cert.validity().not_after.timestamp() - cert.validity().not_before.timestamp();
        assert!((364 * 86400..=366 * 86400).contains(&lifetime));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&spec.key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_renewal_is_reported_not_silent() {
        let tools = NativeTools::new(AcmeConfig::default());
        let err = tools.renew_certificate("example.com").await.unwrap_err();
        assert!(matches!(err, RegistryError::ToolExecution { .. }));
    }
}
