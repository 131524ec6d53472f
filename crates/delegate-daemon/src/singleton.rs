//! Daemon singleton enforcement via `protected/daemon.lock`.
//!
//! The lock file is created exclusively at startup; a second instance
//! fails fast. A stale lock (pid no longer alive) is taken over.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use delegate_core::error::{DelegateError, Result};
use delegate_core::paths::Home;

/// Held for the daemon's lifetime; releases the lock and pid files on
/// drop.
pub struct DaemonSingleton {
    lock_path: PathBuf,
    pid_path: PathBuf,
}

fn pid_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        // Without procfs, assume a recorded pid is alive; the operator
        // removes a truly stale lock by hand.
        let _ = pid;
        true
    }
}

impl DaemonSingleton {
    /// Acquire the exclusive daemon lock, writing this process's pid.
    pub fn acquire(home: &Home) -> Result<Self> {
        let lock_path = home.daemon_lock_path();
        let pid_path = home.daemon_pid_path();
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut attempt = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path);

        if attempt.is_err() {
            // Lock exists: stale if the recorded pid is gone.
            let recorded: Option<u32> = std::fs::read_to_string(&pid_path)
                .ok()
                .and_then(|text| text.trim().parse().ok());
            match recorded {
                Some(pid) if pid_alive(pid) => {
                    return Err(DelegateError::Daemon(format!(
                        "daemon already running (pid {pid})"
                    )));
                }
                _ => {
                    tracing::warn!("removing stale daemon lock at {}", lock_path.display());
                    std::fs::remove_file(&lock_path).ok();
                    attempt = OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&lock_path);
                }
            }
        }

        let mut lock_file = attempt
            .map_err(|e| DelegateError::Daemon(format!("could not acquire daemon lock: {e}")))?;
        let pid = std::process::id();
        writeln!(lock_file, "{pid}")?;
        std::fs::write(&pid_path, format!("{pid}\n"))?;

        Ok(Self {
            lock_path,
            pid_path,
        })
    }
}

impl Drop for DaemonSingleton {
    fn drop(&mut self) {
        std::fs::remove_file(&self.pid_path).ok();
        std::fs::remove_file(&self.lock_path).ok();
    }
}
