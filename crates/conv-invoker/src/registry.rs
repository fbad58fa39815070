//! Host lock registry: cross-process mutual exclusion over a shared JSON
//! map of host -> state. A host key exists in the map for the entire
//! duration of exactly one active invocation against that host; absence
//! means the host is free. The map is only ever touched while the lock
//! file is held, and the lock is released after each read-modify-write.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::InvokerError;

pub const REGISTRY_FILE: &str = "invoker-status.json";
pub const LOCK_FILE: &str = "invoker-status.lock";

pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(5_000);
/// The lock is only ever held across a registry read-modify-write, never
/// across an install or run. Anything older than this is a crashed holder.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

const HOST_STATE_RUNNING: &str = "running";

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDoc {
    hosts: BTreeMap<String, String>,
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// File-backed registry of hosts with an active invocation. State lives
/// under an injected directory; nothing here is process-global.
pub struct HostRegistry {
    status_path: PathBuf,
    lock_path: PathBuf,
    lock_wait: Duration,
    stale_after: Duration,
}

impl HostRegistry {
    pub fn new(state_dir: &Path) -> Self {
        Self::with_timing(state_dir, DEFAULT_LOCK_WAIT, DEFAULT_STALE_AFTER)
    }

    pub fn with_timing(state_dir: &Path, lock_wait: Duration, stale_after: Duration) -> Self {
        Self {
            status_path: state_dir.join(REGISTRY_FILE),
            lock_path: state_dir.join(LOCK_FILE),
            lock_wait,
            stale_after,
        }
    }

    /// Claim `host` for this invocation. Fails with `Concurrency` if
    /// another invocation already owns it.
    pub fn register(&self, host: &str) -> Result<(), InvokerError> {
        let guard = self.acquire()?;
        let mut doc = self.load()?;
        if doc.hosts.contains_key(host) {
            return Err(InvokerError::Concurrency {
                host: host.to_string(),
            });
        }
        doc.hosts
            .insert(host.to_string(), HOST_STATE_RUNNING.to_string());
        self.store(&doc)?;
        drop(guard);
        debug!(host, "registered host");
        Ok(())
    }

    /// Release `host`. A no-op if the host was never registered, which
    /// covers cleanup after a failed registration.
    pub fn deregister(&self, host: &str) -> Result<(), InvokerError> {
        let guard = self.acquire()?;
        let mut doc = self.load()?;
        if doc.hosts.remove(host).is_some() {
            self.store(&doc)?;
            debug!(host, "deregistered host");
        }
        drop(guard);
        Ok(())
    }

    /// Lock-guarded snapshot of the currently registered hosts.
    pub fn hosts(&self) -> Result<BTreeMap<String, String>, InvokerError> {
        let _guard = self.acquire()?;
        Ok(self.load()?.hosts)
    }

    fn acquire(&self) -> Result<LockGuard, InvokerError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let started = Instant::now();
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    let payload = format!(
                        "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                        std::process::id(),
                        Utc::now().to_rfc3339()
                    );
                    let _ = file.write_all(payload.as_bytes());
                    let _ = file.sync_all();
                    return Ok(LockGuard {
                        path: self.lock_path.clone(),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if self.reclaim_if_stale()? {
                        continue;
                    }
                    if started.elapsed() >= self.lock_wait {
                        return Err(InvokerError::LockTimeout {
                            waited_ms: self.lock_wait.as_millis() as u64,
                        });
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn reclaim_if_stale(&self) -> Result<bool, InvokerError> {
        let modified = match fs::metadata(&self.lock_path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            // Holder released between our open attempt and this check.
            Err(_) => return Ok(true),
        };
        let age = modified.elapsed().unwrap_or(Duration::ZERO);
        if age < self.stale_after {
            return Ok(false);
        }
        warn!(
            lock = %self.lock_path.display(),
            age_secs = age.as_secs(),
            "reclaiming stale registry lock"
        );
        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(err.into()),
        }
    }

    fn load(&self) -> Result<RegistryDoc, InvokerError> {
        let raw = match fs::read_to_string(&self.status_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(RegistryDoc::default())
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(&raw).map_err(|err| {
            InvokerError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "malformed host registry at {}: {}",
                    self.status_path.display(),
                    err
                ),
            ))
        })
    }

    fn store(&self, doc: &RegistryDoc) -> Result<(), InvokerError> {
        let bytes = serde_json::to_vec(doc).map_err(|err| {
            InvokerError::Io(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
        })?;
        atomic_write(&self.status_path, &bytes)?;
        Ok(())
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}
