use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::command::{escape_ps_single_quote, escape_ps_single_quote_path, powershell, run_command};
use crate::host::Transport;

const COPY_BUFFER_BYTES: usize = 64 * 1024;
const PROGRESS_STEP_PERCENT: u32 = 5;
const USER_AGENT: &str = concat!("uplift/", env!("CARGO_PKG_VERSION"));

/// Resumable partial file used by the primary transport.
pub fn partial_path(dest: &Path) -> PathBuf {
    sibling_with_suffix(dest, "part")
}

/// Scratch file used by the direct fallback transport.
pub fn direct_path(dest: &Path) -> PathBuf {
    sibling_with_suffix(dest, "direct")
}

fn sibling_with_suffix(dest: &Path, suffix: &str) -> PathBuf {
    let name = dest
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("artifact");
    dest.with_file_name(format!("{name}.{suffix}"))
}

/// Logs transfer progress whenever it has moved by at least five
/// percentage points since the last report.
#[derive(Debug)]
pub(crate) struct ProgressReporter {
    total: Option<u64>,
    last_reported: Option<u32>,
}

impl ProgressReporter {
    pub(crate) fn new(total: Option<u64>) -> Self {
        Self {
            total: total.filter(|value| *value > 0),
            last_reported: None,
        }
    }

    pub(crate) fn observe(&mut self, transferred: u64) -> Option<u32> {
        let total = self.total?;
        let percent = ((transferred.min(total) * 100) / total) as u32;
        let due = match self.last_reported {
            None => true,
            Some(last) => percent >= last + PROGRESS_STEP_PERCENT || (percent == 100 && last < 100),
        };
        if !due {
            return None;
        }
        self.last_reported = Some(percent);
        info!(percent, transferred, total, "download progress");
        Some(percent)
    }
}

/// In-process HTTP transfer with `Range` resume and a stall watchdog.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    watch_interval: Duration,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            watch_interval: Duration::from_secs(1),
        })
    }

    /// How often the watchdog samples progress. The grace period a cancelled
    /// worker gets to stop scales with it.
    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn fetch(&self, url: &str, dest: &Path, stall_timeout: Duration) -> Result<()> {
        let part = partial_path(dest);
        let transferred = Arc::new(AtomicU64::new(0));
        let cancelled = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();

        {
            let client = self.client.clone();
            let url = url.to_string();
            let part = part.clone();
            let transferred = Arc::clone(&transferred);
            let cancelled = Arc::clone(&cancelled);
            thread::Builder::new()
                .name("uplift-download".to_string())
                .spawn(move || {
                    let result = transfer(&client, &url, &part, &transferred, &cancelled);
                    let _ = done_tx.send(result);
                })
                .context("failed to start download worker")?;
        }

        let mut last_seen = transferred.load(Ordering::Relaxed);
        let mut last_change = Instant::now();
        loop {
            match done_rx.recv_timeout(self.watch_interval) {
                Ok(result) => {
                    result?;
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let now = transferred.load(Ordering::Relaxed);
                    if now != last_seen {
                        last_seen = now;
                        last_change = Instant::now();
                    } else if last_change.elapsed() >= stall_timeout {
                        cancelled.store(true, Ordering::Relaxed);
                        if done_rx.recv_timeout(self.watch_interval * 5).is_err() {
                            warn!("download worker still blocked after cancellation");
                        }
                        return Err(anyhow!(
                            "download stalled: no data for {}s at {} bytes",
                            stall_timeout.as_secs(),
                            now
                        ));
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("download worker exited without a result"));
                }
            }
        }

        fs::rename(&part, dest).with_context(|| {
            format!(
                "failed to move download into place: {} -> {}",
                part.display(),
                dest.display()
            )
        })
    }
}

fn transfer(
    client: &reqwest::blocking::Client,
    url: &str,
    part: &Path,
    transferred: &AtomicU64,
    cancelled: &AtomicBool,
) -> Result<()> {
    if let Some(parent) = part.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create download dir: {}", parent.display()))?;
    }

    let existing = fs::metadata(part).map(|meta| meta.len()).unwrap_or(0);
    let mut request = client.get(url);
    if existing > 0 {
        request = request.header(RANGE, format!("bytes={existing}-"));
    }
    let mut response = request
        .send()
        .with_context(|| format!("failed to request {url}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("download of {url} failed with status {status}"));
    }

    let resumed = existing > 0 && status == StatusCode::PARTIAL_CONTENT;
    let mut file = if resumed {
        info!(offset = existing, "resuming partial download");
        fs::OpenOptions::new()
            .append(true)
            .open(part)
            .with_context(|| format!("failed to reopen partial download: {}", part.display()))?
    } else {
        if existing > 0 {
            debug!("server ignored range request; restarting download");
        }
        fs::File::create(part)
            .with_context(|| format!("failed to create partial download: {}", part.display()))?
    };

    let offset = if resumed { existing } else { 0 };
    let total = response.content_length().map(|len| len + offset);
    transferred.store(offset, Ordering::Relaxed);
    let mut reporter = ProgressReporter::new(total);
    reporter.observe(offset);

    let mut buffer = vec![0_u8; COPY_BUFFER_BYTES];
    let mut written = offset;
    loop {
        if cancelled.load(Ordering::Relaxed) {
            return Err(anyhow!("download cancelled by stall watchdog"));
        }
        let read = response
            .read(&mut buffer)
            .with_context(|| format!("failed reading response body from {url}"))?;
        if read == 0 {
            break;
        }
        if cancelled.load(Ordering::Relaxed) {
            return Err(anyhow!("download cancelled by stall watchdog"));
        }
        file.write_all(&buffer[..read])
            .with_context(|| format!("failed writing partial download: {}", part.display()))?;
        written += read as u64;
        transferred.store(written, Ordering::Relaxed);
        reporter.observe(written);
    }

    file.sync_all()
        .with_context(|| format!("failed to flush partial download: {}", part.display()))?;
    if let Some(total) = total {
        if written != total {
            return Err(anyhow!(
                "download ended early: {written} of {total} bytes received"
            ));
        }
    }
    Ok(())
}

/// Direct, non-resumable transfer through `powershell` on Windows and
/// `curl` elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandTransport;

impl CommandTransport {
    pub(crate) fn build_command(url: &str, out_path: &Path, stall_timeout: Duration) -> Command {
        if cfg!(windows) {
            return powershell(&format!(
                "$ProgressPreference = 'SilentlyContinue'; Invoke-WebRequest -UseBasicParsing -Uri '{}' -OutFile '{}'",
                escape_ps_single_quote(url),
                escape_ps_single_quote_path(out_path)
            ));
        }

        let mut command = Command::new("curl");
        command
            .arg("-fL")
            .arg("--retry")
            .arg("2")
            .arg("--speed-limit")
            .arg("1")
            .arg("--speed-time")
            .arg(stall_timeout.as_secs().max(1).to_string())
            .arg("-o")
            .arg(out_path)
            .arg(url);
        command
    }
}

impl Transport for CommandTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn fetch(&self, url: &str, dest: &Path, stall_timeout: Duration) -> Result<()> {
        let scratch = direct_path(dest);
        let mut command = Self::build_command(url, &scratch, stall_timeout);
        if let Err(err) = run_command(&mut command, "direct download failed") {
            if let Err(remove_err) = fs::remove_file(&scratch) {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %remove_err, "failed to remove direct download scratch file");
                }
            }
            return Err(err);
        }
        fs::rename(&scratch, dest).with_context(|| {
            format!(
                "failed to move download into place: {} -> {}",
                scratch.display(),
                dest.display()
            )
        })
    }
}
