//! hostctl - operator CLI for the hostgate domain registry
//!
//! Usage:
//!   hostctl domain add <domain> --type server --target 3000
//!   hostctl domain edit <domain> [--type static] [--target /srv/site]
//!   hostctl domain delete <domain>
//!   hostctl domain list | show <domain>
//!
//!   hostctl subdomain add <parent> <name> --type server --target 3001
//!   hostctl subdomain edit <parent> <name> [--type] [--target]
//!   hostctl subdomain delete <parent> <name>
//!
//!   hostctl ssl bootstrap | issue <domain> | renew [<domain>] | verify <domain>
//!   hostctl ssl logs [-n 50] | status
//!
//!   hostctl link <domain> [<dir>] [--unlink]

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hostgate::certs::{
    CertificateManager, CertificateSettings, IssuanceOutcome, Operator, Prompt, RenewOutcome,
    SelfSignedStatus,
};
use hostgate::config::Config;
use hostgate::db::{CertPaths, Database, DomainRecord, SiteType, SslMode};
use hostgate::domains::{
    CertificateChoice, Confirmation, DeleteOutcome, DomainEdit, DomainRegistry, DomainSpec,
    SubdomainSpec,
};
use hostgate::error::RegistryError;
use hostgate::tools::SystemTools;
use std::error::Error as StdError;
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "hostctl")]
#[command(about = "Manage hostgate domains and certificates", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "HOSTGATE_CONFIG", default_value = "hostgate.toml")]
    config: PathBuf,

    /// Answer yes to every confirmation
    #[arg(short, long, global = true)]
    yes: bool,

    /// Log progress to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Root domains and wildcard records
    #[command(subcommand)]
    Domain(DomainCommand),
    /// Subdomains of an existing root domain
    #[command(subcommand)]
    Subdomain(SubdomainCommand),
    /// Certificates
    #[command(subcommand)]
    Ssl(SslCommand),
    /// Attach a local project directory to a domain
    Link {
        domain: String,
        /// Project directory (defaults to the current directory)
        dir: Option<PathBuf>,
        /// Remove the link instead
        #[arg(long)]
        unlink: bool,
    },
}

#[derive(Args, Debug)]
struct SiteArgs {
    /// `server` (proxied to a port) or `static` (files from a directory)
    #[arg(long = "type", default_value = "server")]
    site_type: SiteType,
    /// Port for `server`, absolute directory for `static`
    #[arg(long)]
    target: String,
}

#[derive(Args, Debug)]
struct EditArgs {
    #[arg(long = "type")]
    site_type: Option<SiteType>,
    #[arg(long)]
    target: Option<String>,
    /// Fail if the record changed since this version
    #[arg(long)]
    expect_version: Option<i64>,
}

impl EditArgs {
    fn edit(&self) -> DomainEdit {
        DomainEdit {
            site_type: self.site_type,
            target: self.target.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum DomainCommand {
    Add {
        domain: String,
        #[command(flatten)]
        site: SiteArgs,
        #[arg(long, default_value = "")]
        email: String,
        #[arg(long, default_value = "")]
        owner: String,
        /// none, self-signed or letsencrypt
        #[arg(long, default_value = "none")]
        ssl: SslMode,
    },
    Edit {
        domain: String,
        #[command(flatten)]
        edit: EditArgs,
    },
    /// Delete a domain and all of its subdomains
    Delete { domain: String },
    List {
        #[arg(long)]
        json: bool,
    },
    Show {
        domain: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SubdomainCommand {
    Add {
        parent: String,
        /// Label (`api`) or full name (`api.example.com`)
        name: String,
        #[command(flatten)]
        site: SiteArgs,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        ssl: Option<SslMode>,
        /// Do not share the parent's wildcard certificate
        #[arg(long, conflicts_with = "cert")]
        no_certificate: bool,
        /// Use this certificate chain instead
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
    },
    Edit {
        parent: String,
        name: String,
        #[command(flatten)]
        edit: EditArgs,
    },
    Delete { parent: String, name: String },
}

#[derive(Subcommand, Debug)]
enum SslCommand {
    /// Create the self-signed default certificate if it is missing
    Bootstrap,
    /// Obtain a Let's Encrypt certificate through a DNS-01 challenge
    Issue {
        domain: String,
        /// Contact email (defaults to the record's)
        #[arg(long, default_value = "")]
        email: String,
    },
    /// Renew one certificate, or every certificate that is due
    Renew { domain: Option<String> },
    /// Check the live TLS handshake
    Verify { domain: String },
    /// Show the ACME client log
    Logs {
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },
    Status {
        #[arg(long)]
        json: bool,
    },
}

/// Answers issuance prompts on the terminal
struct TerminalOperator {
    assume_yes: bool,
}

impl TerminalOperator {
    fn ask(&self, question: &str) -> bool {
        if self.assume_yes {
            println!("{} [y/N] y", question);
            return true;
        }
        print!("{} [y/N] ", question);
        if std::io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        match std::io::stdin().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}

impl Operator for TerminalOperator {
    fn confirm(&self, prompt: &Prompt<'_>) -> bool {
        match prompt {
            Prompt::ReuseWildcard { domain, paths } => {
                println!("A wildcard certificate already covers {}:", domain);
                println!("  {}", paths.cert_path.display());
                self.ask("Use it instead of issuing a new certificate?")
            }
            Prompt::PublishChallenge { domain, challenges } => {
                println!("Publish the following DNS TXT records for {}:", domain);
                println!();
                for challenge in challenges.iter() {
                    println!("  {}  TXT  \"{}\"", challenge.record_name, challenge.value);
                }
                println!();
                self.ask("Continue once the records are published?")
            }
            Prompt::GenerateDefaultCertificate { cert_path } => {
                println!("No default certificate at {}.", cert_path.display());
                self.ask("Generate a self-signed one now?")
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let directive = if cli.verbose { "hostgate=debug" } else { "hostgate=warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    let assume_yes = cli.yes;
    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        if let Some(detail) = e.chain().find_map(permission_denied) {
            if let Some(code) = offer_elevation(&detail, assume_yes) {
                std::process::exit(code);
            }
        }
        std::process::exit(1);
    }
}

/// Detail of a permission failure anywhere in an error chain
fn permission_denied(cause: &(dyn StdError + 'static)) -> Option<String> {
    let registry = cause
        .downcast_ref::<RegistryError>()
        .or_else(|| cause.downcast_ref::<Box<RegistryError>>().map(|boxed| &**boxed));
    if let Some(RegistryError::PermissionDenied(detail)) = registry {
        return Some(detail.clone());
    }
    cause
        .downcast_ref::<std::io::Error>()
        .filter(|e| e.kind() == std::io::ErrorKind::PermissionDenied)
        .map(|e| e.to_string())
}

/// The same invocation, prefixed with sudo
fn elevated_command(args: &[String]) -> String {
    format!("sudo {}", shell_words::join(args))
}

/// Tell the operator how to retry with privileges, and offer to do it.
///
/// Returns the exit code of the elevated run when one happened.
fn offer_elevation(detail: &str, assume_yes: bool) -> Option<i32> {
    let args: Vec<String> = std::env::args().collect();
    eprintln!();
    eprintln!("Permission denied: {}", detail);
    eprintln!("Re-run with elevated privileges:");
    eprintln!("  {}", elevated_command(&args));

    // Already elevated, or nobody to ask
    if std::env::var_os("SUDO_UID").is_some() || !std::io::stdin().is_terminal() {
        return None;
    }
    if !(TerminalOperator { assume_yes }).ask("Run it with sudo now?") {
        return None;
    }

    let (invoked, rest) = args.split_first()?;
    let program = std::env::current_exe()
        .map(|exe| exe.into_os_string())
        .unwrap_or_else(|_| invoked.into());
    match std::process::Command::new("sudo").arg(program).args(rest).status() {
        Ok(status) => Some(status.code().unwrap_or(1)),
        Err(e) => {
            eprintln!("Failed to run sudo: {}", e);
            None
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let db = Arc::new(
        Database::open(&config.registry.database)
            .with_context(|| format!("Failed to open registry {}", config.registry.database.display()))?,
    );
    let operator = TerminalOperator { assume_yes: cli.yes };

    match cli.command {
        Commands::Domain(cmd) => handle_domain(cmd, &DomainRegistry::new(db), &operator),
        Commands::Subdomain(cmd) => handle_subdomain(cmd, &DomainRegistry::new(db), &operator),
        Commands::Link { domain, dir, unlink } => {
            let registry = DomainRegistry::new(db);
            if unlink {
                let record = registry.unlink_project(&domain)?;
                println!("Unlinked project from {}", record.domain);
            } else {
                let dir = match dir {
                    Some(dir) => dir,
                    None => std::env::current_dir()?,
                };
                let record = registry.link_project(&domain, &dir)?;
                println!(
                    "Linked {} to {}",
                    record.domain,
                    record.project_path.unwrap_or_default()
                );
            }
            Ok(())
        }
        Commands::Ssl(cmd) => {
            let manager = CertificateManager::new(
                db,
                SystemTools::from_config(&config.acme),
                CertificateSettings::from_config(&config),
            );
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(handle_ssl(cmd, &manager, &operator))
        }
    }
}

fn handle_domain(cmd: DomainCommand, registry: &DomainRegistry, operator: &TerminalOperator) -> Result<()> {
    match cmd {
        DomainCommand::Add {
            domain,
            site,
            email,
            owner,
            ssl,
        } => {
            let record = registry.register_domain(&DomainSpec {
                domain,
                email,
                owner,
                site_type: site.site_type,
                target: site.target,
                ssl_mode: ssl,
            })?;
            println!("Added {} ({} -> {})", record.domain, record.site_type, record.target);
            if record.ssl_mode == SslMode::Letsencrypt {
                println!("Obtain its certificate with: hostctl ssl issue {}", record.domain);
            }
        }
        DomainCommand::Edit { domain, edit } => {
            let record = registry.edit_domain_details(&domain, &edit.edit(), edit.expect_version)?;
            println!(
                "Updated {} ({} -> {}, version {})",
                record.domain, record.site_type, record.target, record.version
            );
        }
        DomainCommand::Delete { domain } => {
            let plan = registry.plan_delete(&domain)?;
            println!("This will delete:");
            for name in plan.affected() {
                println!("  {}", name);
            }
            let confirmation = Confirmation::from_bool(operator.ask("Delete these records?"));
            print_delete_outcome(registry.delete_domain(&plan, confirmation)?);
        }
        DomainCommand::List { json } => {
            let records = registry.list_domains()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No domains yet. Add one with: hostctl domain add <domain> --target <port>");
            } else {
                print_table(&records);
            }
        }
        DomainCommand::Show { domain, json } => {
            let record = registry.get_domain(&domain)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_record(&record);
            }
        }
    }
    Ok(())
}

fn handle_subdomain(
    cmd: SubdomainCommand,
    registry: &DomainRegistry,
    operator: &TerminalOperator,
) -> Result<()> {
    match cmd {
        SubdomainCommand::Add {
            parent,
            name,
            site,
            email,
            owner,
            ssl,
            no_certificate,
            cert,
            key,
        } => {
            let certificate = match (cert, key) {
                (Some(cert_path), Some(key_path)) => CertificateChoice::Explicit(CertPaths { cert_path, key_path }),
                _ if no_certificate => CertificateChoice::Without,
                _ => CertificateChoice::InheritFromParent,
            };
            let record = registry.add_subdomain(
                &parent,
                &SubdomainSpec {
                    name,
                    site_type: site.site_type,
                    target: site.target,
                    email,
                    owner,
                    ssl_mode: ssl,
                    certificate,
                },
            )?;
            println!("Added {} ({} -> {})", record.domain, record.site_type, record.target);
            if let Some(paths) = record.cert_paths() {
                println!("Sharing certificate {}", paths.cert_path.display());
            }
        }
        SubdomainCommand::Edit { parent, name, edit } => {
            let record = registry.edit_subdomain(&parent, &name, &edit.edit(), edit.expect_version)?;
            println!(
                "Updated {} ({} -> {}, version {})",
                record.domain, record.site_type, record.target, record.version
            );
        }
        SubdomainCommand::Delete { parent, name } => {
            let confirmation = Confirmation::from_bool(operator.ask(&format!("Delete {} under {}?", name, parent)));
            print_delete_outcome(registry.delete_subdomain(&parent, &name, confirmation)?);
        }
    }
    Ok(())
}

async fn handle_ssl(
    cmd: SslCommand,
    manager: &CertificateManager<SystemTools>,
    operator: &TerminalOperator,
) -> Result<()> {
    match cmd {
        SslCommand::Bootstrap => {
            let mut status = manager.ensure_self_signed(Confirmation::Declined).await?;
            if status == SelfSignedStatus::ConfirmationRequired {
                let prompt = Prompt::GenerateDefaultCertificate {
                    cert_path: &manager.settings().default_cert,
                };
                let confirmation = Confirmation::from_bool(operator.confirm(&prompt));
                status = manager.ensure_self_signed(confirmation).await?;
            }
            match status {
                SelfSignedStatus::Present => println!(
                    "Default certificate present at {}",
                    manager.settings().default_cert.display()
                ),
                SelfSignedStatus::Generated => println!(
                    "Generated default certificate at {}",
                    manager.settings().default_cert.display()
                ),
                SelfSignedStatus::ConfirmationRequired => println!("Aborted; no certificate generated"),
            }
        }
        SslCommand::Issue { domain, email } => match manager.obtain_certificate(&domain, &email, operator).await? {
            IssuanceOutcome::Reused(record) | IssuanceOutcome::Issued(record) => {
                let paths = issued_paths(&record)?;
                println!("Certificate for {} ready:", record.domain);
                println!("  cert: {}", paths.cert_path.display());
                println!("  key:  {}", paths.key_path.display());
            }
            IssuanceOutcome::Cancelled => println!("Issuance cancelled; remove the TXT records if you added them"),
        },
        SslCommand::Renew { domain: Some(domain) } => {
            print_renew_outcome(&domain, &manager.renew(&domain).await?);
        }
        SslCommand::Renew { domain: None } => {
            let results = manager.renew_due().await?;
            if results.is_empty() {
                println!("No certificates are due for renewal");
            }
            for (domain, outcome) in &results {
                print_renew_outcome(domain, outcome);
            }
        }
        SslCommand::Verify { domain } => {
            let report = manager.verify(&domain).await?;
            println!("{}", report.output.trim_end());
            println!();
            if report.verified {
                println!("{}: certificate chain verified", report.domain);
            } else {
                anyhow::bail!("{}: certificate chain did not verify", report.domain);
            }
        }
        SslCommand::Logs { lines } => {
            for line in manager.tail_logs(lines)? {
                println!("{}", line);
            }
        }
        SslCommand::Status { json } => {
            let report = manager.status_report()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{:<40} {:<18} {:>6}  ERROR", "DOMAIN", "STATE", "DAYS");
                for status in report {
                    println!(
                        "{:<40} {:<18} {:>6}  {}",
                        status.domain,
                        status.state.to_string(),
                        status.days_remaining.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string()),
                        status.error.unwrap_or_default()
                    );
                }
            }
        }
    }
    Ok(())
}

fn print_delete_outcome(outcome: DeleteOutcome) {
    match outcome {
        DeleteOutcome::Deleted(removed) => {
            for name in removed {
                println!("Deleted {}", name);
            }
        }
        DeleteOutcome::ConfirmationRequired(_) => println!("Aborted; nothing deleted"),
    }
}

/// Certificate files of a record that was just issued or reused
fn issued_paths(record: &DomainRecord) -> Result<CertPaths> {
    record
        .cert_paths()
        .ok_or_else(|| anyhow::anyhow!("{} has no certificate paths after issuance", record.domain))
}

fn print_renew_outcome(domain: &str, outcome: &RenewOutcome) {
    match outcome {
        RenewOutcome::Renewed => println!("{}: renewed", domain),
        RenewOutcome::Failed { command, output } => {
            println!("{}: renewal failed", domain);
            println!("  command: {}", command);
            for line in output.lines() {
                println!("  {}", line);
            }
        }
    }
}

fn print_table(records: &[DomainRecord]) {
    println!("{:<40} {:<7} {:<30} {:<12} SSL", "DOMAIN", "TYPE", "TARGET", "STATE");
    for record in records {
        let name = if record.is_root() {
            record.domain.clone()
        } else {
            format!("  {}", record.domain)
        };
        println!(
            "{:<40} {:<7} {:<30} {:<12} {}",
            name, record.site_type, record.target, record.ssl_state, record.ssl_mode
        );
    }
}

fn print_record(record: &DomainRecord) {
    println!("Domain:      {}", record.domain);
    if let Some(parent) = record.parent() {
        println!("Parent:      {}", parent);
    }
    println!("Type:        {}", record.site_type);
    println!("Target:      {}", record.target);
    println!("Email:       {}", record.email);
    println!("Owner:       {}", record.owner);
    println!("SSL mode:    {}", record.ssl_mode);
    println!("SSL state:   {}", record.ssl_state);
    if let Some(paths) = record.cert_paths() {
        println!("Certificate: {}", paths.cert_path.display());
        println!("Key:         {}", paths.key_path.display());
    }
    if let Some(error) = &record.ssl_error {
        println!("SSL error:   {}", error);
    }
    if let Some(project) = &record.project_path {
        println!("Project:     {}", project);
    }
    println!("Version:     {}", record.version);
    println!("Created:     {}", record.created_at);
    println!("Updated:     {}", record.updated_at);
}
