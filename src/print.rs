//! Print-queue collaborators: hand a finished ZPL payload to a printer.
//!
//! [`LpPrintQueue`] drives the CUPS command-line tools: `lp -o raw` so the
//! scheduler passes the ZPL through untouched, and `lpstat -p -d` for
//! discovery. A remote scheduler is selected per child process through the
//! `CUPS_SERVER` variable; the parent environment is never modified.
//!
//! [`FileSink`] writes the payload to a file instead, for dry runs and for
//! printers reached some other way.

use crate::config::LabelConfig;
use crate::error::LabelError;
use crate::pipeline::zpl::ZplPayload;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

static REQUEST_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"request id is (\S+)").expect("valid regex"));

/// Receipt for an accepted print job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintJob {
    pub printer: String,
    /// Queue-assigned job identifier, when the queue reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// One print queue known to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterInfo {
    pub name: String,
    /// Scheduler status text, e.g. `"idle.  enabled since …"`.
    pub info: String,
    #[serde(default)]
    pub is_default: bool,
}

/// Discovery result: known queues plus the default destination.
///
/// The default need not appear in `printers`; a configured printer that the
/// scheduler does not (yet) list is still reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterListing {
    pub printers: Vec<PrinterInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl PrinterListing {
    /// Let `configured` take precedence over the scheduler's default, and
    /// re-flag `is_default` to match.
    pub fn with_configured_default(mut self, configured: Option<&str>) -> Self {
        if let Some(name) = configured {
            self.default = Some(name.to_string());
        }
        for p in &mut self.printers {
            p.is_default = self.default.as_deref() == Some(p.name.as_str());
        }
        self
    }
}

/// Destination for encoded labels.
#[async_trait]
pub trait PrintQueue: Send + Sync {
    /// Submit `payload` to `printer` as a raw job.
    async fn submit(&self, printer: &str, payload: &ZplPayload) -> Result<PrintJob, LabelError>;

    /// List the queues this destination knows about.
    async fn list_printers(&self) -> Result<Vec<PrinterInfo>, LabelError>;

    /// Queues plus the destination's own default.
    async fn discover(&self) -> Result<PrinterListing, LabelError> {
        let printers = self.list_printers().await?;
        let default = printers
            .iter()
            .find(|p| p.is_default)
            .map(|p| p.name.clone());
        Ok(PrinterListing { printers, default })
    }
}

// ── CUPS ─────────────────────────────────────────────────────────────────

/// CUPS via `lp` / `lpstat`.
#[derive(Debug, Clone)]
pub struct LpPrintQueue {
    cups_server: Option<String>,
    submit_timeout: Duration,
    list_timeout: Duration,
    lp_program: String,
    lpstat_program: String,
}

impl Default for LpPrintQueue {
    fn default() -> Self {
        Self {
            cups_server: None,
            submit_timeout: Duration::from_secs(10),
            list_timeout: Duration::from_secs(5),
            lp_program: "lp".into(),
            lpstat_program: "lpstat".into(),
        }
    }
}

impl LpPrintQueue {
    pub fn new(cups_server: Option<String>) -> Self {
        Self {
            cups_server,
            ..Default::default()
        }
    }

    pub fn from_config(config: &LabelConfig) -> Self {
        Self::new(config.cups_server.clone())
    }

    pub fn with_timeouts(mut self, submit: Duration, list: Duration) -> Self {
        self.submit_timeout = submit;
        self.list_timeout = list;
        self
    }

    /// Use different executables in place of `lp` and `lpstat`.
    pub fn with_programs(mut self, lp: impl Into<String>, lpstat: impl Into<String>) -> Self {
        self.lp_program = lp.into();
        self.lpstat_program = lpstat.into();
        self
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref server) = self.cups_server {
            cmd.env("CUPS_SERVER", server);
        }
        cmd
    }
}

#[async_trait]
impl PrintQueue for LpPrintQueue {
    async fn submit(&self, printer: &str, payload: &ZplPayload) -> Result<PrintJob, LabelError> {
        let fail = |detail: String| LabelError::PrintSubmission {
            printer: printer.to_string(),
            detail,
        };

        let mut cmd = self.command(&self.lp_program);
        cmd.arg("-d")
            .arg(printer)
            .arg("-o")
            .arg("raw")
            .arg("-t")
            .arg("shipping-label")
            .stdin(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| fail(format!("failed to run {}: {e}", self.lp_program)))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| fail("lp stdin unavailable".into()))?;

        let data = payload.as_bytes().to_vec();
        let run = async move {
            if let Err(e) = stdin.write_all(&data).await {
                // lp exiting early is judged by its status below.
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e);
                }
            }
            drop(stdin);
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.submit_timeout, run)
            .await
            .map_err(|_| fail(format!("lp timed out after {:?}", self.submit_timeout)))?
            .map_err(|e| fail(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let detail = match stderr.trim() {
                "" => format!("lp exited with {}", output.status),
                msg => msg.to_string(),
            };
            warn!("lp failed for {}: {}", printer, detail);
            return Err(fail(detail));
        }

        let job_id = parse_request_id(&stdout);
        info!(
            "Submitted {} bytes to {} (job {})",
            payload.len(),
            printer,
            job_id.as_deref().unwrap_or("?")
        );
        Ok(PrintJob {
            printer: printer.to_string(),
            job_id,
        })
    }

    async fn list_printers(&self) -> Result<Vec<PrinterInfo>, LabelError> {
        Ok(self.discover().await?.printers)
    }

    async fn discover(&self) -> Result<PrinterListing, LabelError> {
        let Some(stdout) = self.lpstat().await? else {
            return Ok(PrinterListing::default());
        };
        let listing = parse_lpstat_listing(&stdout);
        debug!(
            "lpstat reported {} printers, default {:?}",
            listing.printers.len(),
            listing.default
        );
        Ok(listing)
    }
}

impl LpPrintQueue {
    /// Stdout of `lpstat -p -d`, or `None` when no destinations exist.
    async fn lpstat(&self) -> Result<Option<String>, LabelError> {
        let mut cmd = self.command(&self.lpstat_program);
        cmd.arg("-p").arg("-d");
        let output = tokio::time::timeout(self.list_timeout, cmd.output())
            .await
            .map_err(|_| LabelError::PrinterDiscovery("lpstat timed out".into()))?
            .map_err(|e| {
                LabelError::PrinterDiscovery(format!("failed to run {}: {e}", self.lpstat_program))
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            if stderr.contains("No destinations added") || stderr.contains("No printers") {
                return Ok(None);
            }
            return Err(LabelError::PrinterDiscovery(format!(
                "lpstat -p -d failed: {}",
                stderr.trim()
            )));
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }
}

/// Job id from `lp` output such as `request id is Zebra-42 (0 file(s))`.
pub fn parse_request_id(stdout: &str) -> Option<String> {
    REQUEST_ID
        .captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Parse `lpstat -p -d` output, keeping the system default even when it
/// has no `printer` line of its own.
pub fn parse_lpstat_listing(stdout: &str) -> PrinterListing {
    PrinterListing {
        printers: parse_lpstat_output(stdout),
        default: system_default(stdout),
    }
}

fn system_default(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        line.trim()
            .strip_prefix("system default destination:")
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
    })
}

/// Parse the `printer …` lines of `lpstat -p -d` output.
pub fn parse_lpstat_output(stdout: &str) -> Vec<PrinterInfo> {
    let default = system_default(stdout);

    let mut printers = Vec::new();
    for line in stdout.lines() {
        let Some(rest) = line.trim().strip_prefix("printer ") else {
            continue;
        };
        let mut parts = rest.splitn(2, ' ');
        let Some(name) = parts.next().filter(|n| !n.is_empty()) else {
            continue;
        };
        let info = parts
            .next()
            .map(|s| s.trim().strip_prefix("is ").unwrap_or(s.trim()).to_string())
            .unwrap_or_default();
        printers.push(PrinterInfo {
            name: name.to_string(),
            info,
            is_default: default.as_deref() == Some(name),
        });
    }
    printers
}

// ── File sink ────────────────────────────────────────────────────────────

/// Writes each payload to a fixed file, replacing earlier contents.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl PrintQueue for FileSink {
    async fn submit(&self, printer: &str, payload: &ZplPayload) -> Result<PrintJob, LabelError> {
        tokio::fs::write(&self.path, payload.as_bytes())
            .await
            .map_err(|e| LabelError::PrintSubmission {
                printer: printer.to_string(),
                detail: format!("cannot write {}: {e}", self.path.display()),
            })?;
        info!("Wrote {} bytes of ZPL to {}", payload.len(), self.path.display());
        Ok(PrintJob {
            printer: printer.to_string(),
            job_id: Some(self.path.display().to_string()),
        })
    }

    async fn list_printers(&self) -> Result<Vec<PrinterInfo>, LabelError> {
        Ok(vec![PrinterInfo {
            name: "file".into(),
            info: self.path.display().to_string(),
            is_default: true,
        }])
    }
}
