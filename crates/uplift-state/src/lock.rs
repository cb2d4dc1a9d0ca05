use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::fs_utils::remove_file_if_exists;

/// Guard proving this process is the only running orchestrator. Released
/// on drop.
#[derive(Debug)]
pub struct InstanceLock {
    kind: LockKind,
}

#[derive(Debug)]
enum LockKind {
    #[cfg(windows)]
    Mutex(named_mutex::NamedMutex),
    File(PathBuf),
    /// No lock primitive was available; a process scan found no peer.
    Unguarded,
}

#[derive(Debug)]
pub enum LockOutcome {
    Acquired(InstanceLock),
    HeldElsewhere(String),
}

impl InstanceLock {
    /// Claims the system-wide lock `name`, falling back to an exclusive lock
    /// file and, when neither primitive works, to `peer_running`, a
    /// best-effort scan for another orchestrator process. The scan is not
    /// atomic: two processes starting together can both pass it.
    pub fn acquire<F>(name: &str, lock_file: &Path, peer_running: F) -> Result<LockOutcome>
    where
        F: FnOnce() -> Result<bool>,
    {
        #[cfg(windows)]
        {
            match named_mutex::claim(name) {
                named_mutex::MutexClaim::Owned(mutex) => {
                    debug!(lock = name, "named mutex acquired");
                    return Ok(LockOutcome::Acquired(Self {
                        kind: LockKind::Mutex(mutex),
                    }));
                }
                named_mutex::MutexClaim::Busy => {
                    return Ok(LockOutcome::HeldElsewhere(format!(
                        "named mutex Global\\{name} is held by another instance"
                    )));
                }
                named_mutex::MutexClaim::Unavailable(code) => {
                    warn!(lock = name, code, "named mutex unavailable; using lock file");
                }
            }
        }
        #[cfg(not(windows))]
        debug!(lock = name, "named mutex not supported on this host; using lock file");

        match claim_lock_file(lock_file) {
            Ok(Some(lock)) => Ok(LockOutcome::Acquired(lock)),
            Ok(None) => Ok(LockOutcome::HeldElsewhere(format!(
                "lock file {} is held by a running process",
                lock_file.display()
            ))),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "lock file unavailable; scanning processes");
                if peer_running().context("process scan for peer instance failed")? {
                    return Ok(LockOutcome::HeldElsewhere(
                        "another orchestrator process is running".to_string(),
                    ));
                }
                Ok(LockOutcome::Acquired(Self {
                    kind: LockKind::Unguarded,
                }))
            }
        }
    }

    pub fn describe(&self) -> &'static str {
        match &self.kind {
            #[cfg(windows)]
            LockKind::Mutex(_) => "named-mutex",
            LockKind::File(_) => "lock-file",
            LockKind::Unguarded => "process-scan",
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let LockKind::File(path) = &self.kind {
            let owned = read_lock_owner(path).ok().flatten() == Some(std::process::id());
            if owned {
                let _ = remove_file_if_exists(path);
            }
        }
    }
}

fn claim_lock_file(path: &Path) -> Result<Option<InstanceLock>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    for _ in 0..2 {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                file.write_all(format!("{}\n", std::process::id()).as_bytes())
                    .with_context(|| format!("failed to write lock file: {}", path.display()))?;
                file.flush()
                    .with_context(|| format!("failed to flush lock file: {}", path.display()))?;
                return Ok(Some(InstanceLock {
                    kind: LockKind::File(path.to_path_buf()),
                }));
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let owner = read_lock_owner(path)?;
                if owner.is_some_and(pid_is_running) {
                    return Ok(None);
                }
                warn!(
                    owner = ?owner,
                    path = %path.display(),
                    "removing stale lock file"
                );
                remove_file_if_exists(path).with_context(|| {
                    format!("failed to remove stale lock file: {}", path.display())
                })?;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to claim lock file: {}", path.display()));
            }
        }
    }
    Ok(None)
}

fn read_lock_owner(path: &Path) -> Result<Option<u32>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read lock file: {}", path.display()));
        }
    };
    Ok(raw.trim().parse().ok())
}

fn pid_is_running(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }

    let output = if cfg!(windows) {
        Command::new("tasklist")
            .arg("/FI")
            .arg(format!("PID eq {pid}"))
            .arg("/NH")
            .output()
    } else {
        Command::new("kill").arg("-0").arg(pid.to_string()).output()
    };

    match output {
        Ok(output) if cfg!(windows) => {
            String::from_utf8_lossy(&output.stdout).contains(&format!(" {pid} "))
        }
        Ok(output) => output.status.success(),
        // Unknown liveness keeps the lock rather than risking two owners.
        Err(_) => true,
    }
}

#[cfg(windows)]
mod named_mutex {
    use std::ffi::OsStr;
    use std::iter::once;
    use std::os::windows::ffi::OsStrExt;
    use std::ptr;

    use winapi::shared::winerror::ERROR_ALREADY_EXISTS;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::synchapi::{CreateMutexW, ReleaseMutex};
    use winapi::um::winnt::HANDLE;

    #[derive(Debug)]
    pub(crate) struct NamedMutex(HANDLE);

    pub(crate) enum MutexClaim {
        Owned(NamedMutex),
        Busy,
        Unavailable(u32),
    }

    pub(crate) fn claim(name: &str) -> MutexClaim {
        let wide: Vec<u16> = OsStr::new(&format!("Global\\{name}"))
            .encode_wide()
            .chain(once(0))
            .collect();

        // SAFETY: `wide` is NUL-terminated and outlives the call.
        let handle = unsafe { CreateMutexW(ptr::null_mut(), 1, wide.as_ptr()) };
        if handle.is_null() {
            // SAFETY: reads the calling thread's last-error value.
            return MutexClaim::Unavailable(unsafe { GetLastError() });
        }

        // SAFETY: reads the calling thread's last-error value.
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            // SAFETY: `handle` came from CreateMutexW and is closed once.
            unsafe { CloseHandle(handle) };
            return MutexClaim::Busy;
        }

        MutexClaim::Owned(NamedMutex(handle))
    }

    impl Drop for NamedMutex {
        fn drop(&mut self) {
            // SAFETY: the handle is owned by this guard and still open.
            unsafe {
                ReleaseMutex(self.0);
                CloseHandle(self.0);
            }
        }
    }
}
