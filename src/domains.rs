//! Validated registry mutations for domains and subdomains
//!
//! Every input is normalised and validated before it reaches the store, so a
//! rejected call never leaves a partial write behind. Destructive operations
//! are split into a plan and an execution step; the execution only proceeds
//! with an explicit [`Confirmation`] supplied by the caller's frontend.

use crate::certs::wildcard_source;
use crate::db::{CertPaths, Database, DomainRecord, NewDomain, SiteType, SslMode};
use crate::error::{RegistryError, Result};
use regex::Regex;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,6}$")
        .expect("domain pattern compiles")
});

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern compiles"));

/// Operator answer to a confirmation-required signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Declined,
}

impl Confirmation {
    pub fn from_bool(confirmed: bool) -> Self {
        if confirmed {
            Confirmation::Confirmed
        } else {
            Confirmation::Declined
        }
    }
}

/// Input for a new root (or wildcard) record
#[derive(Debug, Clone)]
pub struct DomainSpec {
    pub domain: String,
    pub email: String,
    pub owner: String,
    pub site_type: SiteType,
    pub target: String,
    pub ssl_mode: SslMode,
}

/// Where a new subdomain's certificate comes from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CertificateChoice {
    /// Share the parent's wildcard certificate when one covers the child
    #[default]
    InheritFromParent,
    /// Use these files instead
    Explicit(CertPaths),
    /// Start without a certificate
    Without,
}

/// Input for a new subdomain under an existing parent
#[derive(Debug, Clone)]
pub struct SubdomainSpec {
    /// Either a bare label (`api`) or the full hostname (`api.example.com`)
    pub name: String,
    pub site_type: SiteType,
    pub target: String,
    /// Overrides the parent's email
    pub email: Option<String>,
    /// Overrides the parent's owner
    pub owner: Option<String>,
    pub ssl_mode: Option<SslMode>,
    pub certificate: CertificateChoice,
}

/// Fields an edit may change; nothing else on a record is editable here
#[derive(Debug, Clone, Default)]
pub struct DomainEdit {
    pub site_type: Option<SiteType>,
    pub target: Option<String>,
}

impl DomainEdit {
    pub fn is_empty(&self) -> bool {
        self.site_type.is_none() && self.target.is_none()
    }
}

/// What a delete would remove
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletePlan {
    pub domain: String,
    /// Subdomains removed along with `domain`
    pub cascaded: Vec<String>,
}

impl DeletePlan {
    pub fn affected(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.domain.as_str()).chain(self.cascaded.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Nothing was written; ask the operator and call again
    ConfirmationRequired(DeletePlan),
    /// Names actually removed
    Deleted(Vec<String>),
}

/// Control-plane entry point for registry writes
#[derive(Clone)]
pub struct DomainRegistry {
    db: Arc<Database>,
}

impl DomainRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Register a root domain or a `*.suffix` wildcard record
    pub fn register_domain(&self, spec: &DomainSpec) -> Result<DomainRecord> {
        let domain = validate_registrable(&spec.domain)?;
        let target = validate_target(spec.site_type, &spec.target)?;
        let email = validate_email(&spec.email)?;

        let record = self.db.insert_domain(&NewDomain {
            subdomain: Some(domain.clone()),
            domain,
            email,
            owner: spec.owner.trim().to_string(),
            ssl_mode: spec.ssl_mode,
            target,
            site_type: spec.site_type,
            project_path: None,
            certificate: None,
        })?;

        info!(
            domain = %record.domain,
            site_type = %record.site_type,
            target = %record.target,
            "Domain registered"
        );
        Ok(record)
    }

    /// Register a subdomain under an existing root record
    pub fn add_subdomain(&self, parent: &str, spec: &SubdomainSpec) -> Result<DomainRecord> {
        let parent_name = validate_domain(parent)?;
        let parent = self
            .db
            .get_domain(&parent_name)?
            .ok_or_else(|| RegistryError::ParentNotFound(parent_name.clone()))?;

        if !parent.is_root() {
            return Err(RegistryError::validation(
                "parent",
                format!("{} is itself a subdomain; nesting is not supported", parent.domain),
            ));
        }
        if parent.is_wildcard() {
            return Err(RegistryError::validation(
                "parent",
                "subdomains cannot be added under a wildcard record",
            ));
        }

        let domain = qualify_subdomain(&spec.name, &parent.domain)?;
        let target = validate_target(spec.site_type, &spec.target)?;
        let email = match &spec.email {
            Some(email) => validate_email(email)?,
            None => parent.email.clone(),
        };

        let certificate = match &spec.certificate {
            CertificateChoice::InheritFromParent => wildcard_source(&self.db, &domain)?,
            CertificateChoice::Explicit(paths) => Some(paths.clone()),
            CertificateChoice::Without => None,
        };
        let ssl_mode = match (spec.ssl_mode, &certificate) {
            (Some(mode), _) => mode,
            (None, Some(_)) => parent.ssl_mode,
            (None, None) => SslMode::None,
        };

        let record = self.db.insert_domain(&NewDomain {
            domain,
            subdomain: Some(parent.domain.clone()),
            email,
            owner: spec
                .owner
                .as_deref()
                .map(str::trim)
                .unwrap_or(&parent.owner)
                .to_string(),
            ssl_mode,
            target,
            site_type: spec.site_type,
            project_path: None,
            certificate,
        })?;

        info!(
            domain = %record.domain,
            parent = %parent.domain,
            shared_certificate = record.cert_paths().is_some(),
            "Subdomain added"
        );
        Ok(record)
    }

    /// Change a record's `type` and/or `target`
    pub fn edit_domain_details(
        &self,
        domain: &str,
        edit: &DomainEdit,
        expected_version: Option<i64>,
    ) -> Result<DomainRecord> {
        let domain = validate_registrable(domain)?;
        let current = self
            .db
            .get_domain(&domain)?
            .ok_or_else(|| RegistryError::NotFound(domain.clone()))?;

        if edit.is_empty() {
            return Ok(current);
        }

        let site_type = edit.site_type.unwrap_or(current.site_type);
        let target = validate_target(site_type, edit.target.as_deref().unwrap_or(&current.target))?;

        if site_type == current.site_type && target == current.target {
            return Ok(current);
        }
        let record = self
            .db
            .update_site(&domain, site_type, &target, expected_version)?;

        info!(
            domain = %record.domain,
            site_type = %record.site_type,
            target = %record.target,
            version = record.version,
            "Domain updated"
        );
        Ok(record)
    }

    /// Same as [`edit_domain_details`](Self::edit_domain_details), scoped to a child of `parent`
    pub fn edit_subdomain(
        &self,
        parent: &str,
        name: &str,
        edit: &DomainEdit,
        expected_version: Option<i64>,
    ) -> Result<DomainRecord> {
        let child = self.child_of(parent, name)?;
        self.edit_domain_details(&child.domain, edit, expected_version)
    }

    /// Work out what deleting `domain` would remove, without removing anything
    pub fn plan_delete(&self, domain: &str) -> Result<DeletePlan> {
        let domain = validate_registrable(domain)?;
        if self.db.get_domain(&domain)?.is_none() {
            return Err(RegistryError::NotFound(domain));
        }

        let cascaded = self
            .db
            .list_children(&domain)?
            .into_iter()
            .map(|child| child.domain)
            .collect();

        Ok(DeletePlan { domain, cascaded })
    }

    /// Execute a planned delete once the operator has confirmed it
    pub fn delete_domain(&self, plan: &DeletePlan, confirmation: Confirmation) -> Result<DeleteOutcome> {
        if confirmation != Confirmation::Confirmed {
            return Ok(DeleteOutcome::ConfirmationRequired(plan.clone()));
        }

        let removed = self.db.delete_domain(&plan.domain)?;
        if removed.is_empty() {
            return Err(RegistryError::NotFound(plan.domain.clone()));
        }

        let planned: Vec<&str> = plan.affected().collect();
        if removed.iter().any(|name| !planned.contains(&name.as_str())) {
            warn!(
                domain = %plan.domain,
                removed = ?removed,
                "Registry changed between plan and delete; removed additional records"
            );
        }

        info!(domain = %plan.domain, removed = removed.len(), "Domain deleted");
        Ok(DeleteOutcome::Deleted(removed))
    }

    /// Delete a single subdomain of `parent`
    pub fn delete_subdomain(
        &self,
        parent: &str,
        name: &str,
        confirmation: Confirmation,
    ) -> Result<DeleteOutcome> {
        let child = self.child_of(parent, name)?;
        let plan = DeletePlan {
            domain: child.domain,
            cascaded: Vec::new(),
        };
        self.delete_domain(&plan, confirmation)
    }

    /// Attach a local development project directory to a record
    pub fn link_project(&self, domain: &str, project: &Path) -> Result<DomainRecord> {
        let domain = validate_registrable(domain)?;
        if !project.is_dir() {
            return Err(RegistryError::validation(
                "project",
                format!("{} is not an existing directory", project.display()),
            ));
        }
        let project = project
            .canonicalize()
            .map_err(|e| RegistryError::from_io(e, project.display()))?;

        let record = self
            .db
            .set_project_path(&domain, Some(&project.to_string_lossy()))?;
        info!(domain = %record.domain, project = %project.display(), "Project linked");
        Ok(record)
    }

    pub fn unlink_project(&self, domain: &str) -> Result<DomainRecord> {
        let domain = validate_registrable(domain)?;
        self.db.set_project_path(&domain, None)
    }

    pub fn get_domain(&self, domain: &str) -> Result<DomainRecord> {
        let domain = validate_registrable(domain)?;
        self.db
            .get_domain(&domain)?
            .ok_or(RegistryError::NotFound(domain))
    }

    pub fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        self.db.list_domains()
    }

    fn child_of(&self, parent: &str, name: &str) -> Result<DomainRecord> {
        let parent = validate_domain(parent)?;
        let domain = qualify_subdomain(name, &parent)?;
        let record = self
            .db
            .get_domain(&domain)?
            .ok_or_else(|| RegistryError::NotFound(domain.clone()))?;

        if record.parent() != Some(parent.as_str()) {
            return Err(RegistryError::validation(
                "subdomain",
                format!("{} is not a subdomain of {}", domain, parent),
            ));
        }
        Ok(record)
    }
}

// ==================== Validation ====================

/// Trim, lower-case and drop a trailing root dot
pub fn normalize_hostname(input: &str) -> String {
    input.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Validate a concrete hostname, returning its normalised form
pub fn validate_domain(input: &str) -> Result<String> {
    let domain = normalize_hostname(input);

    if domain.is_empty() {
        return Err(RegistryError::validation("domain", "must not be empty"));
    }
    if domain.contains("://") {
        return Err(RegistryError::validation(
            "domain",
            format!("{} must not include a scheme", input.trim()),
        ));
    }
    if domain.len() > 253 {
        return Err(RegistryError::validation("domain", "longer than 253 characters"));
    }
    if !DOMAIN_RE.is_match(&domain) {
        return Err(RegistryError::validation(
            "domain",
            format!("{} is not a valid hostname", input.trim()),
        ));
    }

    Ok(domain)
}

/// Like [`validate_domain`] but also accepts a leading `*.` wildcard label
pub fn validate_registrable(input: &str) -> Result<String> {
    let domain = normalize_hostname(input);
    match domain.strip_prefix("*.") {
        Some(suffix) => Ok(format!("*.{}", validate_domain(suffix)?)),
        None => validate_domain(&domain),
    }
}

/// Validate a TCP port in 1..=65535
pub fn validate_port(input: &str) -> Result<u16> {
    let trimmed = input.trim();
    match trimmed.parse::<u32>() {
        Ok(port @ 1..=65535) => Ok(port as u16),
        Ok(_) => Err(RegistryError::validation(
            "port",
            format!("{} is outside 1-65535", trimmed),
        )),
        Err(_) => Err(RegistryError::validation(
            "port",
            format!("{} is not a number", trimmed),
        )),
    }
}

/// Basic email shape check; an empty value means "not provided"
pub fn validate_email(input: &str) -> Result<String> {
    let email = input.trim();
    if email.is_empty() || EMAIL_RE.is_match(email) {
        Ok(email.to_string())
    } else {
        Err(RegistryError::validation(
            "email",
            format!("{} is not a valid email address", email),
        ))
    }
}

/// Validate `target` against the site type it will be served as
pub fn validate_target(site_type: SiteType, target: &str) -> Result<String> {
    match site_type {
        SiteType::Server => Ok(validate_port(target)?.to_string()),
        SiteType::Static => {
            let root = target.trim();
            if root.is_empty() || !Path::new(root).is_absolute() {
                return Err(RegistryError::validation(
                    "target",
                    format!("static root `{}` must be an absolute path", root),
                ));
            }
            match root.trim_end_matches('/') {
                "" => Ok("/".to_string()),
                trimmed => Ok(trimmed.to_string()),
            }
        }
    }
}

fn qualify_subdomain(name: &str, parent: &str) -> Result<String> {
    let name = normalize_hostname(name);
    let full = if name.ends_with(&format!(".{}", parent)) {
        name
    } else {
        format!("{}.{}", name, parent)
    };

    let domain = validate_domain(&full)?;
    if domain == parent {
        return Err(RegistryError::validation(
            "subdomain",
            "subdomain must differ from its parent",
        ));
    }
    Ok(domain)
}
