use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use uplift_core::{FailureKind, UpgradeConfig, UpgradeFailure};
use uplift_security::{is_sha256_hex, sha256_file};
use uplift_state::{remove_file_if_exists, write_file_synced};

use crate::gate::ensure_disk_space;
use crate::host::{CleanupHooks, SystemProbe, Transport};
use crate::transport::{direct_path, partial_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Reused,
    Downloaded { attempts: u32, transport: &'static str },
}

/// Sidecar holding the digest computed for a previously accepted image.
pub fn hash_sidecar_path(artifact: &Path) -> PathBuf {
    let name = artifact
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("artifact");
    artifact.with_file_name(format!("{name}.sha256"))
}

/// Removes the image, its cached digest and any partial transfers.
pub fn discard_artifact(artifact: &Path) -> Result<()> {
    for path in [
        artifact.to_path_buf(),
        hash_sidecar_path(artifact),
        partial_path(artifact),
        direct_path(artifact),
    ] {
        remove_file_if_exists(&path)
            .with_context(|| format!("failed to remove download artifact: {}", path.display()))?;
    }
    Ok(())
}

pub struct Downloader<'a> {
    config: &'a UpgradeConfig,
    probe: &'a dyn SystemProbe,
    cleanup: &'a dyn CleanupHooks,
    primary: &'a dyn Transport,
    fallback: &'a dyn Transport,
}

impl<'a> Downloader<'a> {
    pub fn new(
        config: &'a UpgradeConfig,
        probe: &'a dyn SystemProbe,
        cleanup: &'a dyn CleanupHooks,
        primary: &'a dyn Transport,
        fallback: &'a dyn Transport,
    ) -> Self {
        Self {
            config,
            probe,
            cleanup,
            primary,
            fallback,
        }
    }

    /// Fetches the configured image into its work-dir location.
    pub fn acquire(&self) -> Result<PathBuf> {
        let dest = self.config.iso_path();
        self.download(&self.config.iso_url, &dest)?;
        Ok(dest)
    }

    /// Reuses a healthy, hash-verified file at `dest`; otherwise downloads
    /// it, retrying up to the configured attempt bound.
    pub fn download(&self, url: &str, dest: &Path) -> Result<DownloadOutcome> {
        if dest.exists() {
            if self.reusable(dest)? {
                info!(path = %dest.display(), "reusing verified image; no transfer needed");
                return Ok(DownloadOutcome::Reused);
            }
            warn!(path = %dest.display(), "existing image failed reuse checks; discarding");
            self.discard_bad(dest)?;
        }

        if url.trim().is_empty() {
            return Err(UpgradeFailure::new(
                FailureKind::DownloadTransport,
                "no image URL is configured",
            )
            .into());
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create work dir: {}", parent.display()))?;
        }

        let attempts = self.config.download_attempts.max(1);
        let mut last_failure = None;
        for attempt in 1..=attempts {
            let space_root = dest.parent().unwrap_or(dest);
            ensure_disk_space(
                self.probe,
                self.cleanup,
                space_root,
                self.config.min_free_space_bytes(),
            )?;

            info!(attempt, attempts, url, "downloading image");
            match self.attempt(url, dest) {
                Ok(transport) => {
                    info!(attempt, transport, "image downloaded and verified");
                    return Ok(DownloadOutcome::Downloaded { attempts: attempt, transport });
                }
                Err(failure) => {
                    warn!(
                        attempt,
                        attempts,
                        kind = failure.kind.as_str(),
                        detail = %failure.detail,
                        "download attempt failed"
                    );
                    self.discard_bad(dest)?;
                    last_failure = Some(failure);
                }
            }
        }

        let failure = last_failure.unwrap_or_else(|| {
            UpgradeFailure::new(FailureKind::DownloadTransport, "no download attempt was made")
        });
        error!(kind = failure.kind.as_str(), "download failed after {attempts} attempts");
        Err(UpgradeFailure::new(
            failure.kind,
            format!("{} (after {attempts} attempts)", failure.detail),
        )
        .into())
    }

    fn attempt(
        &self,
        url: &str,
        dest: &Path,
    ) -> std::result::Result<&'static str, UpgradeFailure> {
        let stall = self.config.download_stall_timeout();
        let transport = match self.primary.fetch(url, dest, stall) {
            Ok(()) => self.primary.name(),
            Err(primary_err) => {
                warn!(
                    transport = self.primary.name(),
                    error = %format!("{primary_err:#}"),
                    "primary transfer failed; falling back"
                );
                match self.fallback.fetch(url, dest, stall) {
                    Ok(()) => self.fallback.name(),
                    Err(fallback_err) => {
                        return Err(UpgradeFailure::new(
                            FailureKind::DownloadTransport,
                            format!(
                                "transport unavailable: {}: {primary_err:#}; {}: {fallback_err:#}",
                                self.primary.name(),
                                self.fallback.name()
                            ),
                        ));
                    }
                }
            }
        };

        if !self.validate_healthy(dest) {
            let size = fs::metadata(dest).map(|meta| meta.len()).unwrap_or(0);
            return Err(UpgradeFailure::new(
                FailureKind::DownloadValidation,
                format!(
                    "validation failed: {size} bytes is below the {} byte minimum",
                    self.config.iso_min_size_bytes
                ),
            ));
        }
        match self.validate_hash(dest, true) {
            Ok(true) => Ok(transport),
            Ok(false) => Err(UpgradeFailure::new(
                FailureKind::DownloadHash,
                "sha256 hash mismatch for downloaded image",
            )),
            Err(err) => Err(UpgradeFailure::new(
                FailureKind::DownloadValidation,
                format!("validation failed: could not hash image: {err:#}"),
            )),
        }
    }

    /// Guards against error pages and truncated transfers saved under the
    /// image name.
    pub fn validate_healthy(&self, path: &Path) -> bool {
        match fs::metadata(path) {
            Ok(meta) => meta.is_file() && meta.len() >= self.config.iso_min_size_bytes,
            Err(_) => false,
        }
    }

    /// Checks `path` against the configured digest, else the cached one.
    /// With neither available and `allow_cache_new_hash` set, the computed
    /// digest is cached and accepted: trust on first use. That only proves
    /// later reuse matches the first download, not that the first download
    /// was genuine.
    pub fn validate_hash(&self, path: &Path, allow_cache_new_hash: bool) -> Result<bool> {
        let actual = sha256_file(path)?;
        if let Some(expected) = &self.config.iso_sha256 {
            let matches = actual.eq_ignore_ascii_case(expected);
            if !matches {
                warn!(
                    expected = %expected,
                    actual = %actual,
                    "image hash does not match configured hash"
                );
            }
            return Ok(matches);
        }

        let sidecar = hash_sidecar_path(path);
        if let Some(cached) = read_cached_hash(&sidecar)? {
            let matches = actual.eq_ignore_ascii_case(&cached);
            if !matches {
                warn!(cached = %cached, actual = %actual, "image hash does not match cached hash");
            }
            return Ok(matches);
        }

        if !allow_cache_new_hash {
            return Ok(false);
        }
        warn!(
            hash = %actual,
            "no expected hash configured; caching first-download hash (trust on first use)"
        );
        write_file_synced(&sidecar, format!("{actual}\n").as_bytes())
            .with_context(|| format!("failed to cache image hash: {}", sidecar.display()))?;
        Ok(true)
    }

    fn reusable(&self, path: &Path) -> Result<bool> {
        if !self.validate_healthy(path) {
            return Ok(false);
        }
        let has_reference = self.config.iso_sha256.is_some()
            || read_cached_hash(&hash_sidecar_path(path))?.is_some();
        if !has_reference {
            info!("existing image has no reference hash; it will be downloaded again");
            return Ok(false);
        }
        match self.validate_hash(path, false) {
            Ok(valid) => Ok(valid),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not hash existing image");
                Ok(false)
            }
        }
    }

    /// Deletes a rejected image together with its cached digest.
    fn discard_bad(&self, dest: &Path) -> Result<()> {
        remove_file_if_exists(dest)
            .with_context(|| format!("failed to remove rejected image: {}", dest.display()))?;
        let sidecar = hash_sidecar_path(dest);
        remove_file_if_exists(&sidecar)
            .with_context(|| format!("failed to remove cached hash: {}", sidecar.display()))
    }
}

fn read_cached_hash(sidecar: &Path) -> Result<Option<String>> {
    let raw = match fs::read_to_string(sidecar) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read cached hash: {}", sidecar.display()));
        }
    };
    let value = raw.trim().to_ascii_lowercase();
    if !is_sha256_hex(&value) {
        warn!(path = %sidecar.display(), "ignoring malformed cached hash");
        return Ok(None);
    }
    Ok(Some(value))
}
