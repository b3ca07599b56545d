//! certbot / openssl / dig backend

use super::{
    combined_output, parse_certbot_challenge, render_command, spawn_failure, tool_failure,
    CertificateChallenge, IssueRequest, Issuance, SelfSignedSpec, ToolRunner, VerifyReport,
};
use crate::config::AcmeConfig;
use crate::db::CertPaths;
use crate::error::{RegistryError, Result};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ShellTools {
    config: AcmeConfig,
}

/// A certbot process paused at its "Press Enter to Continue" prompt
pub struct ShellPending {
    cert_name: String,
    command: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    transcript: String,
    stderr: JoinHandle<String>,
}

impl ShellTools {
    pub fn new(config: AcmeConfig) -> Self {
        Self { config }
    }

    /// Run a tool to completion, failing on a non-zero exit
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let command = render_command(program, args);
        let output = self.capture(program, args, &command).await?;

        if !output.status.success() {
            return Err(tool_failure(command, output.status, combined_output(&output)));
        }
        Ok(combined_output(&output))
    }

    async fn capture(&self, program: &str, args: &[String], command: &str) -> Result<Output> {
        debug!(command = %command, "Running external tool");
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_failure(command.to_string(), e))
    }

    fn certonly_args(&self, request: &IssueRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "certonly",
            "--manual",
            "--preferred-challenges",
            "dns",
            "--agree-tos",
            "--no-eff-email",
            "--cert-name",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(request.cert_name());

        if request.email.is_empty() {
            args.push("--register-unsafely-without-email".to_string());
        } else {
            args.push("--email".to_string());
            args.push(request.email.clone());
        }

        if let Some(url) = &self.config.directory_url {
            args.push("--server".to_string());
            args.push(url.clone());
        }

        args.push("-d".to_string());
        args.push(request.domain.clone());
        args
    }
}

impl ToolRunner for ShellTools {
    type Pending = ShellPending;

    async fn issue_certificate(&self, request: &IssueRequest) -> Result<Issuance<ShellPending>> {
        let program = &self.config.certbot_path;
        let args = self.certonly_args(request);
        let command = render_command(program, &args);

        info!(domain = %request.domain, command = %command, "Starting certbot DNS-01 issuance");

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_failure(command.clone(), e))?;

        let (Some(stdin), Some(stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(tool_failure(command, "stdio unavailable", String::new()));
        };

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut stdout = BufReader::new(stdout);
        let mut transcript = String::new();

        let prompt = tokio::time::timeout(self.config.challenge_timeout(), async {
            let mut line = String::new();
            loop {
                line.clear();
                if stdout.read_line(&mut line).await? == 0 {
                    return Ok::<_, std::io::Error>(None);
                }
                transcript.push_str(&line);
                if let Some(found) = parse_certbot_challenge(&transcript) {
                    return Ok(Some(found));
                }
            }
        })
        .await;

        let (record_name, value) = match prompt {
            Ok(Ok(Some(found))) => found,
            Ok(Ok(None)) => {
                let status = child
                    .wait()
                    .await
                    .map(|s| s.to_string())
                    .unwrap_or_else(|e| e.to_string());
                let stderr = stderr_task.await.unwrap_or_default();
                return Err(tool_failure(
                    command,
                    format!("{} before printing a DNS challenge", status),
                    join_output(&transcript, &stderr),
                ));
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                let stderr = stderr_task.await.unwrap_or_default();
                return Err(tool_failure(
                    command,
                    format!("reading output failed: {}", e),
                    join_output(&transcript, &stderr),
                ));
            }
            Err(_) => {
                let _ = child.kill().await;
                let stderr = stderr_task.await.unwrap_or_default();
                return Err(tool_failure(
                    command,
                    "timed out waiting for the DNS challenge",
                    join_output(&transcript, &stderr),
                ));
            }
        };

        info!(domain = %request.domain, record = %record_name, "certbot is waiting for the TXT record");

        Ok(Issuance {
            challenges: vec![CertificateChallenge {
                domain: request.domain.clone(),
                record_name,
                value,
            }],
            handle: ShellPending {
                cert_name: request.cert_name(),
                command,
                child,
                stdin,
                stdout,
                transcript,
                stderr: stderr_task,
            },
        })
    }

    async fn complete_issuance(&self, pending: ShellPending) -> Result<CertPaths> {
        let ShellPending {
            cert_name,
            command,
            mut child,
            mut stdin,
            mut stdout,
            mut transcript,
            stderr,
        } = pending;

        // Answer "Press Enter to Continue"
        if let Err(e) = stdin.write_all(b"\n").await {
            let _ = child.kill().await;
            return Err(tool_failure(command, "stdin closed", e.to_string()));
        }
        let _ = stdin.flush().await;
        drop(stdin);

        let finished = tokio::time::timeout(self.config.challenge_timeout(), async {
            let mut rest = String::new();
            let _ = stdout.read_to_string(&mut rest).await;
            transcript.push_str(&rest);
            child.wait().await
        })
        .await;

        let status = match finished {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(tool_failure(command, "wait failed", e.to_string())),
            Err(_) => {
                let _ = child.kill().await;
                let stderr = stderr.await.unwrap_or_default();
                return Err(tool_failure(
                    command,
                    "timed out waiting for validation",
                    join_output(&transcript, &stderr),
                ));
            }
        };

        let stderr = stderr.await.unwrap_or_default();
        if !status.success() {
            return Err(tool_failure(command, status, join_output(&transcript, &stderr)));
        }

        let live = self.config.live_dir(&cert_name);
        info!(cert_name = %cert_name, dir = %live.display(), "certbot issued certificate");

        Ok(CertPaths {
            cert_path: live.join("fullchain.pem"),
            key_path: live.join("privkey.pem"),
        })
    }

    async fn cancel_issuance(&self, mut pending: ShellPending) {
        if let Err(e) = pending.child.kill().await {
            warn!(command = %pending.command, error = %e, "Failed to stop certbot");
        }
        info!(cert_name = %pending.cert_name, "Issuance cancelled");
    }

    async fn renew_certificate(&self, cert_name: &str) -> Result<()> {
        let args = vec![
            "renew".to_string(),
            "--cert-name".to_string(),
            cert_name.to_string(),
            "--non-interactive".to_string(),
        ];
        let output = self.run(&self.config.certbot_path, &args).await?;
        debug!(cert_name, output = %output, "certbot renew finished");
        Ok(())
    }

    async fn generate_self_signed(&self, spec: &SelfSignedSpec) -> Result<()> {
        for path in [&spec.cert_path, &spec.key_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RegistryError::from_io(e, parent.display()))?;
            }
        }

        let args = vec![
            "req".to_string(),
            "-x509".to_string(),
            "-nodes".to_string(),
            "-days".to_string(),
            spec.validity_days.to_string(),
            "-newkey".to_string(),
            format!("rsa:{}", spec.key_bits),
            "-keyout".to_string(),
            spec.key_path.to_string_lossy().into_owned(),
            "-out".to_string(),
            spec.cert_path.to_string_lossy().into_owned(),
            "-subj".to_string(),
            format!("/CN={}", spec.common_name),
        ];
        self.run(&self.config.openssl_path, &args).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&spec.key_path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| RegistryError::from_io(e, spec.key_path.display()))?;
        }

        info!(cert = %spec.cert_path.display(), "Generated self-signed certificate with openssl");
        Ok(())
    }

    async fn query_txt_record(&self, name: &str) -> Result<Vec<String>> {
        let mut args = vec!["+short".to_string(), "TXT".to_string(), name.to_string()];
        if let Some(ns) = &self.config.propagation.nameserver {
            args.push(format!("@{}", ns));
        }

        let output = self.run(&self.config.dig_path, &args).await?;
        Ok(parse_dig_txt(&output))
    }

    async fn verify_tls(&self, domain: &str) -> Result<VerifyReport> {
        let args = vec![
            "s_client".to_string(),
            "-connect".to_string(),
            format!("{}:443", domain),
            "-servername".to_string(),
            domain.to_string(),
            "-verify_return_error".to_string(),
        ];
        let command = render_command(&self.config.openssl_path, &args);

        let output = tokio::time::timeout(
            VERIFY_TIMEOUT,
            self.capture(&self.config.openssl_path, &args, &command),
        )
        .await
        .map_err(|_| tool_failure(command.clone(), "timed out", String::new()))??;

        let text = combined_output(&output);
        let verified = output.status.success() && text.contains("Verify return code: 0 (ok)");

        Ok(VerifyReport {
            domain: domain.to_string(),
            verified,
            output: text,
        })
    }
}

/// Values from `dig +short TXT`, with quoted chunks of long records joined
fn parse_dig_txt(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(';'))
        .map(|line| line.split("\" \"").collect::<String>().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn join_output(stdout: &str, stderr: &str) -> String {
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (false, false) => format!("{}\n{}", stdout.trim_end(), stderr.trim_end()),
        (false, true) => stdout.trim_end().to_string(),
        (true, _) => stderr.trim_end().to_string(),
    }
}
