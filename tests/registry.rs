//! Registry mutations observed through the runtime adapter

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hostgate::adapter::{RuntimeAdapter, SniCertResolver};
use hostgate::db::{CertPaths, Database, SiteType, SslMode, SslState};
use hostgate::domains::{
    CertificateChoice, Confirmation, DeleteOutcome, DomainEdit, DomainRegistry, DomainSpec,
    SubdomainSpec,
};
use hostgate::error::RegistryError;
use hostgate::resolver::Route;

struct Harness {
    db: Arc<Database>,
    registry: DomainRegistry,
    adapter: RuntimeAdapter,
}

fn harness() -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    Harness {
        registry: DomainRegistry::new(Arc::clone(&db)),
        adapter: RuntimeAdapter::new(Arc::clone(&db), "127.0.0.1"),
        db,
    }
}

fn domain(name: &str, site_type: SiteType, target: &str) -> DomainSpec {
    DomainSpec {
        domain: name.to_string(),
        email: "ops@example.com".to_string(),
        owner: "ops".to_string(),
        site_type,
        target: target.to_string(),
        ssl_mode: SslMode::None,
    }
}

fn subdomain(name: &str, site_type: SiteType, target: &str) -> SubdomainSpec {
    SubdomainSpec {
        name: name.to_string(),
        site_type,
        target: target.to_string(),
        email: None,
        owner: None,
        ssl_mode: None,
        certificate: CertificateChoice::InheritFromParent,
    }
}

fn proxy(upstream: &str) -> Option<Route> {
    Some(Route::Proxy {
        upstream: upstream.to_string(),
    })
}

fn write_pair(dir: &Path, names: &[&str]) -> CertPaths {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
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

fn attach_certificate(db: &Database, domain: &str, paths: &CertPaths) {
    db.update_ssl(domain, SslMode::Letsencrypt, Some(paths), SslState::Issued, None)
        .unwrap();
}

#[test]
fn test_register_subdomain_then_cascade_delete() {
    let h = harness();

    h.registry
        .register_domain(&domain("example.com", SiteType::Server, "3000"))
        .unwrap();
    assert_eq!(
        h.adapter.resolve_route("example.com").unwrap(),
        proxy("127.0.0.1:3000")
    );

    h.registry
        .add_subdomain("example.com", &subdomain("api.example.com", SiteType::Static, "/srv/api"))
        .unwrap();
    assert_eq!(
        h.adapter.resolve_route("api.example.com").unwrap(),
        Some(Route::Static {
            root_path: PathBuf::from("/srv/api")
        })
    );

    let plan = h.registry.plan_delete("example.com").unwrap();
    assert_eq!(plan.cascaded, vec!["api.example.com".to_string()]);

    let outcome = h.registry.delete_domain(&plan, Confirmation::Confirmed).unwrap();
    let DeleteOutcome::Deleted(mut removed) = outcome else {
        panic!("expected delete, got {:?}", outcome);
    };
    removed.sort();
    assert_eq!(removed, vec!["api.example.com", "example.com"]);

    assert_eq!(h.adapter.resolve_route("example.com").unwrap(), None);
    assert_eq!(h.adapter.resolve_route("api.example.com").unwrap(), None);
    assert!(matches!(
        h.adapter.resolver().resolve_route("api.example.com"),
        Err(RegistryError::NotConfigured(_))
    ));
}

#[test]
fn test_declined_delete_changes_nothing() {
    let h = harness();
    h.registry
        .register_domain(&domain("example.com", SiteType::Server, "3000"))
        .unwrap();

    let plan = h.registry.plan_delete("example.com").unwrap();
    let outcome = h.registry.delete_domain(&plan, Confirmation::Declined).unwrap();

    assert_eq!(outcome, DeleteOutcome::ConfirmationRequired(plan));
    assert_eq!(
        h.adapter.resolve_route("example.com").unwrap(),
        proxy("127.0.0.1:3000")
    );
}

#[test]
fn test_duplicate_registration_keeps_original_route() {
    let h = harness();
    h.registry
        .register_domain(&domain("example.com", SiteType::Server, "3000"))
        .unwrap();

    let err = h
        .registry
        .register_domain(&domain("Example.COM", SiteType::Server, "4000"))
        .unwrap_err();

    assert!(matches!(err, RegistryError::DuplicateDomain(ref d) if d == "example.com"), "{:?}", err);
    assert_eq!(
        h.adapter.resolve_route("example.com").unwrap(),
        proxy("127.0.0.1:3000")
    );
}

#[test]
fn test_invalid_input_is_never_written() {
    let h = harness();

    for spec in [
        domain("http://example.com", SiteType::Server, "3000"),
        domain("notld", SiteType::Server, "3000"),
        domain("example.com", SiteType::Server, "70000"),
        domain("example.com", SiteType::Static, "relative/dir"),
    ] {
        let err = h.registry.register_domain(&spec).unwrap_err();
        assert!(matches!(err, RegistryError::Validation { .. }), "{:?}", err);
    }

    assert!(h.registry.list_domains().unwrap().is_empty());
}

#[test]
fn test_wildcard_covers_children_until_a_specific_record_exists() {
    let h = harness();
    h.registry
        .register_domain(&domain("*.example.com", SiteType::Server, "4000"))
        .unwrap();

    assert_eq!(
        h.adapter.resolve_route("blog.example.com").unwrap(),
        proxy("127.0.0.1:4000")
    );
    // Only one label is stripped
    assert_eq!(h.adapter.resolve_route("a.b.example.com").unwrap(), None);

    h.registry
        .register_domain(&domain("example.com", SiteType::Server, "3000"))
        .unwrap();
    h.registry
        .add_subdomain("example.com", &subdomain("blog", SiteType::Server, "5000"))
        .unwrap();

    assert_eq!(
        h.adapter.resolve_route("blog.example.com").unwrap(),
        proxy("127.0.0.1:5000")
    );
    assert_eq!(
        h.adapter.resolve_route("shop.example.com").unwrap(),
        proxy("127.0.0.1:4000")
    );
}

#[test]
fn test_host_header_is_normalized_before_lookup() {
    let h = harness();
    h.registry
        .register_domain(&domain("example.com", SiteType::Server, "3000"))
        .unwrap();

    assert_eq!(
        h.adapter.resolve_route("EXAMPLE.com:8443").unwrap(),
        proxy("127.0.0.1:3000")
    );
    assert_eq!(
        h.adapter.resolve_route("example.com.").unwrap(),
        proxy("127.0.0.1:3000")
    );
    assert_eq!(h.adapter.resolve_route("exa mple.com").unwrap(), None);
}

#[test]
fn test_stale_version_edit_is_rejected() {
    let h = harness();
    let record = h
        .registry
        .register_domain(&domain("example.com", SiteType::Server, "3000"))
        .unwrap();

    let first = h
        .registry
        .edit_domain_details(
            "example.com",
            &DomainEdit {
                site_type: None,
                target: Some("3001".to_string()),
            },
            Some(record.version),
        )
        .unwrap();
    assert!(first.version > record.version);

    let err = h
        .registry
        .edit_domain_details(
            "example.com",
            &DomainEdit {
                site_type: None,
                target: Some("3002".to_string()),
            },
            Some(record.version),
        )
        .unwrap_err();

    assert!(matches!(err, RegistryError::Conflict { .. }), "{:?}", err);
    assert!(err.is_retryable());
    assert_eq!(
        h.adapter.resolve_route("example.com").unwrap(),
        proxy("127.0.0.1:3001")
    );
}

#[test]
fn test_edit_subdomain_is_scoped_to_its_parent() {
    let h = harness();
    h.registry
        .register_domain(&domain("example.com", SiteType::Server, "3000"))
        .unwrap();
    h.registry
        .register_domain(&domain("example.org", SiteType::Server, "3100"))
        .unwrap();
    h.registry
        .add_subdomain("example.com", &subdomain("api", SiteType::Server, "3200"))
        .unwrap();

    let edit = DomainEdit {
        site_type: None,
        target: Some("3300".to_string()),
    };
    assert!(h
        .registry
        .edit_subdomain("example.org", "api.example.com", &edit, None)
        .is_err());

    h.registry
        .edit_subdomain("example.com", "api", &edit, None)
        .unwrap();
    assert_eq!(
        h.adapter.resolve_route("api.example.com").unwrap(),
        proxy("127.0.0.1:3300")
    );
}

#[test]
fn test_certificate_paths_fall_through_to_wildcard() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let wildcard_pair = write_pair(&dir.path().join("wildcard"), &["*.example.com", "example.com"]);

    h.registry
        .register_domain(&domain("*.example.com", SiteType::Server, "4000"))
        .unwrap();
    attach_certificate(&h.db, "*.example.com", &wildcard_pair);
    h.registry
        .register_domain(&domain("example.com", SiteType::Server, "3000"))
        .unwrap();
    h.registry
        .add_subdomain(
            "example.com",
            &SubdomainSpec {
                certificate: CertificateChoice::Without,
                ..subdomain("api", SiteType::Server, "3200")
            },
        )
        .unwrap();

    // The child has no certificate of its own, so the wildcard's is presented
    assert_eq!(
        h.adapter.resolve_cert_paths("api.example.com").unwrap(),
        Some(wildcard_pair.clone())
    );
    assert_eq!(
        h.adapter.resolve_cert_paths("anything.example.com").unwrap(),
        Some(wildcard_pair.clone())
    );
    assert_eq!(h.adapter.resolve_cert_paths("example.org").unwrap(), None);

    let pem = h.adapter.resolve_certificate("api.example.com").unwrap().unwrap();
    assert_eq!(pem.cert_pem, std::fs::read(&wildcard_pair.cert_path).unwrap());
}

#[test]
fn test_subdomain_inherits_wildcard_certificate() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let wildcard_pair = write_pair(&dir.path().join("wildcard"), &["*.example.com"]);

    h.registry
        .register_domain(&domain("*.example.com", SiteType::Server, "4000"))
        .unwrap();
    attach_certificate(&h.db, "*.example.com", &wildcard_pair);
    h.registry
        .register_domain(&domain("example.com", SiteType::Server, "3000"))
        .unwrap();

    let child = h
        .registry
        .add_subdomain("example.com", &subdomain("api", SiteType::Server, "3200"))
        .unwrap();

    assert_eq!(child.cert_paths(), Some(wildcard_pair));
    assert_eq!(child.ssl_state, SslState::Issued);
}

#[test]
fn test_unreadable_certificate_counts_as_missing() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let pair = write_pair(&dir.path().join("example.com"), &["example.com"]);

    h.registry
        .register_domain(&domain("example.com", SiteType::Server, "3000"))
        .unwrap();
    attach_certificate(&h.db, "example.com", &pair);
    std::fs::remove_file(&pair.key_path).unwrap();

    assert_eq!(
        h.adapter.resolve_cert_paths("example.com").unwrap(),
        Some(pair)
    );
    assert!(h.adapter.resolve_certificate("example.com").unwrap().is_none());
}

#[test]
fn test_sni_resolver_picks_registered_certificate_or_default() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let default_pair = write_pair(&dir.path().join("default"), &["localhost"]);
    let site_pair = write_pair(&dir.path().join("example.com"), &["example.com"]);

    h.registry
        .register_domain(&domain("example.com", SiteType::Server, "3000"))
        .unwrap();
    attach_certificate(&h.db, "example.com", &site_pair);

    let resolver = SniCertResolver::with_default_files(
        h.adapter.clone(),
        &default_pair.cert_path,
        &default_pair.key_path,
    )
    .unwrap();

    let default_key = resolver.certificate_for(None);
    assert!(Arc::ptr_eq(&default_key, &resolver.certificate_for(Some("unknown.test"))));

    let site_key = resolver.certificate_for(Some("example.com"));
    assert!(!Arc::ptr_eq(&site_key, &default_key));
    // Served from the cache until the files change
    assert!(Arc::ptr_eq(&site_key, &resolver.certificate_for(Some("EXAMPLE.COM"))));

    // Removing the record takes effect on the next handshake
    let plan = h.registry.plan_delete("example.com").unwrap();
    h.registry.delete_domain(&plan, Confirmation::Confirmed).unwrap();
    assert!(Arc::ptr_eq(&default_key, &resolver.certificate_for(Some("example.com"))));
}

#[test]
fn test_link_and_unlink_project() {
    let h = harness();
    let project = tempfile::tempdir().unwrap();
    h.registry
        .register_domain(&domain("example.com", SiteType::Server, "3000"))
        .unwrap();

    let linked = h.registry.link_project("example.com", project.path()).unwrap();
    let expected = project.path().canonicalize().unwrap();
    assert_eq!(linked.project_path.as_deref(), Some(expected.to_str().unwrap()));

    let unlinked = h.registry.unlink_project("example.com").unwrap();
    assert_eq!(unlinked.project_path, None);

    // Linking never changes routing
    assert_eq!(
        h.adapter.resolve_route("example.com").unwrap(),
        proxy("127.0.0.1:3000")
    );
}
