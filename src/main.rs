use hostgate::adapter::{RuntimeAdapter, SniCertResolver};
use hostgate::certs::{CertificateManager, CertificateSettings, SelfSignedStatus};
use hostgate::config::Config;
use hostgate::db::Database;
use hostgate::domains::Confirmation;
use hostgate::pool::{ConnectionPool, PoolConfig};
use hostgate::proxy::ProxyServer;
use hostgate::static_files::StaticFiles;
use hostgate::tools::SystemTools;
use hostgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// Environment variable naming the configuration file
const CONFIG_PATH_ENV: &str = "HOSTGATE_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("hostgate.toml"));

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let db = Arc::new(Database::open(&config.registry.database)?);
    let certificates = Arc::new(CertificateManager::new(
        Arc::clone(&db),
        SystemTools::from_config(&config.acme),
        CertificateSettings::from_config(&config),
    ));

    let report = certificates.reconcile()?;
    if !report.missing_files.is_empty() {
        warn!(domains = ?report.missing_files, "Certificates missing on disk; records marked failed");
    }
    if !report.unreadable.is_empty() {
        warn!(domains = ?report.unreadable, "Certificate files not readable by this user; records left as they are");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let adapter = RuntimeAdapter::new(Arc::clone(&db), config.server.upstream_host.clone());
    let pool = Arc::new(ConnectionPool::new(PoolConfig::from(&config.server)));
    let static_files = StaticFiles::new(config.static_files.index.clone());

    let tls_acceptor = if config.server.tls_port > 0 {
        Some(build_tls_acceptor(&config, &certificates, adapter.clone()).await?)
    } else {
        None
    };

    let http_handle = if config.server.port > 0 {
        let http_addr = bind_addr(&config.server.bind, config.server.port)?;
        let mut http_proxy = ProxyServer::with_pool(http_addr, adapter.clone(), shutdown_rx.clone(), Arc::clone(&pool))
            .with_static_files(static_files.clone())
            .with_request_timeout(config.server.request_timeout());

        if config.server.force_https && tls_acceptor.is_some() {
            http_proxy = http_proxy.with_https_redirect(config.server.tls_port);
            info!(http_port = config.server.port, https_port = config.server.tls_port, "HTTP to HTTPS redirect enabled");
        }

        Some(tokio::spawn(async move {
            if let Err(e) = http_proxy.run().await {
                error!(error = %e, "HTTP proxy server error");
            }
        }))
    } else {
        None
    };

    let https_handle = match tls_acceptor {
        Some(acceptor) => {
            let https_addr = bind_addr(&config.server.bind, config.server.tls_port)?;
            let https_proxy = ProxyServer::with_pool(https_addr, adapter, shutdown_rx.clone(), pool)
                .with_static_files(static_files)
                .with_request_timeout(config.server.request_timeout())
                .with_tls(acceptor);

            Some(tokio::spawn(async move {
                if let Err(e) = https_proxy.run().await {
                    error!(error = %e, "HTTPS proxy server error");
                }
            }))
        }
        None => None,
    };

    let renewal_manager = Arc::clone(&certificates);
    let renewal_shutdown = shutdown_rx.clone();
    let renewal_handle = tokio::spawn(async move {
        renewal_manager.run_renewal_loop(renewal_shutdown).await;
    });

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
        let _ = renewal_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Default pair plus per-SNI lookups against the registry
async fn build_tls_acceptor(
    config: &Config,
    certificates: &CertificateManager<SystemTools>,
    adapter: RuntimeAdapter,
) -> anyhow::Result<TlsAcceptor> {
    let confirmation = Confirmation::from_bool(config.tls.auto_generate);
    match certificates.ensure_self_signed(confirmation).await? {
        SelfSignedStatus::Present => {}
        SelfSignedStatus::Generated => {
            warn!(cert = %config.tls.default_cert.display(), "Generated self-signed default certificate (not trusted by browsers)");
        }
        SelfSignedStatus::ConfirmationRequired => {
            anyhow::bail!(
                "default certificate {} is missing; run `hostctl ssl bootstrap` or set tls.auto_generate = true",
                config.tls.default_cert.display()
            );
        }
    }

    let resolver = SniCertResolver::with_default_files(adapter, &config.tls.default_cert, &config.tls.default_key)?;

    let mut tls_config =
        rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    info!(default_cert = %config.tls.default_cert.display(), "TLS enabled with SNI certificate selection");
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn bind_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        http_port = if config.server.port > 0 { Some(config.server.port) } else { None },
        https_port = if config.server.tls_port > 0 { Some(config.server.tls_port) } else { None },
        upstream_host = %config.server.upstream_host,
        force_https = config.server.force_https,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        "Connection pool settings"
    );
    info!(
        database = %config.registry.database.display(),
        acme_client = ?config.acme.client,
        renewal_days = config.acme.renewal_days,
        renewal_interval_secs = config.acme.renewal_interval_secs,
        "Certificate settings"
    );
}
