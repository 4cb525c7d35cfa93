//! Certificate hint collaborator
//!
//! Before dispatching a request the proxy asks for a `<host>.pem` certificate
//! to exist in the certificate directory, invoking an external tool (for
//! example `mkcert`) when it does not. The proxy never terminates TLS, so the
//! outcome is ignored: the existence check and the tool both run on a
//! background task and failures are only logged.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Best-effort certificate provisioning for a hostname
pub trait CertificateHint: Send + Sync {
    /// Request a certificate for `host`. Must not block and never fails the caller.
    fn ensure_certificate(&self, host: &str);
}

/// Hint that does nothing, used when no certificate tool is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCertificateHint;

impl CertificateHint for NoopCertificateHint {
    fn ensure_certificate(&self, host: &str) {
        debug!("[CERT] No certificate tool configured, skipping {}", host);
    }
}

/// Runs an external tool as `<tool> <host>` inside the certificate directory
#[derive(Debug, Clone)]
pub struct CommandCertificateHint {
    tool: String,
    cert_dir: PathBuf,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl CommandCertificateHint {
    pub fn new(tool: impl Into<String>, cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            cert_dir: cert_dir.into(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Path of the certificate artifact for `host`
    pub fn cert_path(&self, host: &str) -> PathBuf {
        self.cert_dir.join(format!("{}.pem", host))
    }

    /// Whether a certificate has to be requested for `host`
    pub async fn needs_certificate(&self, host: &str) -> bool {
        is_valid_host(host)
            && !tokio::fs::try_exists(self.cert_path(host))
                .await
                .unwrap_or(false)
    }

    /// Install the tool's local CA (`<tool> -install`), logging failures
    pub async fn install(&self) {
        info!("[CERT] Installing local CA with {}", self.tool);
        run_tool(&self.tool, &self.cert_dir, "-install").await;
    }
}

impl CertificateHint for CommandCertificateHint {
    fn ensure_certificate(&self, host: &str) {
        if !is_valid_host(host) {
            debug!("[CERT] Skipping certificate for unusable host name {:?}", host);
            return;
        }
        {
            let mut in_flight = match self.in_flight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !in_flight.insert(host.to_string()) {
                debug!("[CERT] Certificate for {} already being created", host);
                return;
            }
        }

        let hint = self.clone();
        let host = host.to_string();
        tokio::spawn(async move {
            if hint.needs_certificate(&host).await {
                info!("[CERT] Creating certificate for {}", host);
                run_tool(&hint.tool, &hint.cert_dir, &host).await;
            } else {
                debug!("[CERT] Using cached certificate for {}", host);
            }
            let mut in_flight = match hint.in_flight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            in_flight.remove(&host);
        });
    }
}

/// Hostnames are passed to a command and used as a file name
fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && !host.starts_with('-')
        && !host.starts_with('.')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '_'))
}

async fn run_tool(tool: &str, dir: &Path, arg: &str) {
    let output = Command::new(tool)
        .arg(arg)
        .current_dir(dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            warn!("[CERT] Failed to run {} {}: {}", tool, arg, e);
            return;
        }
    };

    for line in String::from_utf8_lossy(&output.stdout)
        .lines()
        .chain(String::from_utf8_lossy(&output.stderr).lines())
    {
        debug!("[CERT] {}: {}", tool, line);
    }

    if output.status.success() {
        debug!("[CERT] {} {} finished", tool, arg);
    } else {
        warn!("[CERT] {} {} exited with {}", tool, arg, output.status);
    }
}
