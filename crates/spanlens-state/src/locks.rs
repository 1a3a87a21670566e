//! Lease-based resource locks shared by independent agent processes.
//!
//! Contention is resolved with wound-wait: an older requester (earlier
//! `started_at`) wounds a younger holder and is told to retry, a younger
//! requester waits. Priority ties on `started_at` are broken by task id, so
//! precedence is a strict total order. Every grant draws a fresh fencing
//! token from a counter that only grows, letting downstream writers reject
//! writes from a holder that has since lost the lock.

use fs4::FileExt;
use serde::{Deserialize, Serialize};
use spanlens_core::error::{LockError, StateError};
use std::cmp::Ordering;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

const GUARD_FILE: &str = ".guard";
const FENCE_FILE: &str = ".fence";
const LOCK_FILE_SUFFIX: &str = ".lock.json";

/// On-disk lock state for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource: String,
    pub owner: String,
    pub started_at: f64,
    pub expires_at: f64,
    pub wounded: bool,
    #[serde(default)]
    pub fencing_token: u64,
}

impl LockRecord {
    pub fn is_expired(&self, now: f64) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockGrant {
    pub resource: String,
    pub owner: String,
    pub fencing_token: u64,
    pub expires_at: f64,
    /// Set when an older task has asked this holder to step aside.
    pub wounded: bool,
}

impl From<&LockRecord> for LockGrant {
    fn from(record: &LockRecord) -> Self {
        Self {
            resource: record.resource.clone(),
            owner: record.owner.clone(),
            fencing_token: record.fencing_token,
            expires_at: record.expires_at,
            wounded: record.wounded,
        }
    }
}

/// A task as the lock service sees it.
///
/// `started_at` is taken once when the task begins and reused on every
/// acquire, so a task that retries after `Wait` keeps its wound-wait
/// priority instead of looking younger each time.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskIdentity {
    pub task_id: String,
    pub started_at: f64,
}

impl TaskIdentity {
    pub fn new(task_id: impl Into<String>, started_at: f64) -> Self {
        Self {
            task_id: task_id.into(),
            started_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    Granted(LockGrant),
    Renewed(LockGrant),
    /// A younger request met an older holder.
    Wait { holder: String, retry_after: Duration },
    /// An older request wounded the younger holder; retry once it releases.
    Wounded { holder: String },
}

impl AcquireOutcome {
    pub fn grant(&self) -> Option<&LockGrant> {
        match self {
            Self::Granted(grant) | Self::Renewed(grant) => Some(grant),
            Self::Wait { .. } | Self::Wounded { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The caller does not hold the lock. `holder` is the live owner, if any.
    NotOwner { holder: Option<String> },
}

/// Mutual exclusion over named resources.
///
/// `acquire` never blocks on contention; callers drive their own retry loop
/// from the returned hint.
pub trait LockService: Send + Sync {
    fn acquire(
        &self,
        resource: &str,
        task_id: &str,
        ttl: Duration,
        started_at: f64,
    ) -> Result<AcquireOutcome, LockError>;

    fn release(&self, resource: &str, task_id: &str) -> Result<ReleaseOutcome, LockError>;

    /// The live (unexpired) lock for `resource`, if any.
    fn current(&self, resource: &str) -> Result<Option<LockRecord>, LockError>;

    fn is_wounded(&self, resource: &str, task_id: &str) -> Result<bool, LockError> {
        Ok(self
            .current(resource)?
            .is_some_and(|record| record.owner == task_id && record.wounded))
    }

    /// Whether `fencing_token` still identifies the live holder of `resource`.
    fn check_fence(&self, resource: &str, fencing_token: u64) -> Result<bool, LockError> {
        Ok(self
            .current(resource)?
            .is_some_and(|record| record.fencing_token == fencing_token))
    }
}

pub type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

/// `LockService` backed by one JSON file per resource in a lock directory.
///
/// Read-modify-write cycles are serialized across processes by an advisory
/// lock on a guard file in the same directory.
pub struct FileLockService {
    dir: PathBuf,
    backoff: Duration,
    clock: Clock,
}

impl FileLockService {
    pub fn new(dir: impl Into<PathBuf>, backoff: Duration) -> Self {
        Self::with_clock(dir, backoff, Arc::new(spanlens_core::time::now_epoch_secs))
    }

    pub fn with_clock(dir: impl Into<PathBuf>, backoff: Duration, clock: Clock) -> Self {
        Self {
            dir: dir.into(),
            backoff,
            clock,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lock file for a resource, named by a content hash of the resource string.
    pub fn lock_path(&self, resource: &str) -> PathBuf {
        let hash = blake3::hash(resource.as_bytes());
        self.dir
            .join(format!("{}{LOCK_FILE_SUFFIX}", &hash.to_hex()[..32]))
    }

    fn with_guard<T>(
        &self,
        body: impl FnOnce() -> Result<T, LockError>,
    ) -> Result<T, LockError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| LockError::io(self.dir.display().to_string(), e))?;
        let guard_path = self.dir.join(GUARD_FILE);
        let guard = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&guard_path)
            .map_err(|e| LockError::io(guard_path.display().to_string(), e))?;
        guard
            .lock_exclusive()
            .map_err(|e| LockError::io(guard_path.display().to_string(), e))?;
        let result = body();
        let _ = FileExt::unlock(&guard);
        result
    }

    fn read_record(&self, path: &Path) -> Result<Option<LockRecord>, LockError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(LockError::io(path.display().to_string(), err)),
        };
        match serde_json::from_str::<LockRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "discarding unreadable lock record");
                Ok(None)
            }
        }
    }

    fn write_record(&self, path: &Path, record: &LockRecord) -> Result<(), LockError> {
        let body = serde_json::to_vec_pretty(record).map_err(LockError::encoding)?;
        write_atomic(&self.dir, path, &body)
    }

    fn remove_record(&self, path: &Path) -> Result<(), LockError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LockError::io(path.display().to_string(), err)),
        }
    }

    fn next_fencing_token(&self) -> Result<u64, LockError> {
        let path = self.dir.join(FENCE_FILE);
        let current = match std::fs::read_to_string(&path) {
            Ok(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                warn!(path = %path.display(), "fence counter unreadable; restarting from wall clock");
                (self.clock)().max(0.0) as u64
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(LockError::io(path.display().to_string(), err)),
        };
        let next = current.saturating_add(1);
        write_atomic(&self.dir, &path, next.to_string().as_bytes())?;
        Ok(next)
    }

    fn retry_hint(&self, holder: &LockRecord, now: f64) -> Duration {
        let remaining = Duration::from_secs_f64((holder.expires_at - now).max(0.0));
        self.backoff.min(remaining).max(Duration::from_millis(1))
    }
}

fn write_atomic(dir: &Path, path: &Path, body: &[u8]) -> Result<(), LockError> {
    let mut temp =
        NamedTempFile::new_in(dir).map_err(|e| LockError::io(dir.display().to_string(), e))?;
    temp.write_all(body)
        .map_err(|e| LockError::io(path.display().to_string(), e))?;
    temp.as_file()
        .sync_data()
        .map_err(|e| LockError::io(path.display().to_string(), e))?;
    temp.persist(path)
        .map_err(|e| LockError::io(path.display().to_string(), e.error))?;
    Ok(())
}

/// Wound-wait priority: earlier start wins, task id breaks ties.
fn has_priority(started_at: f64, task_id: &str, holder: &LockRecord) -> bool {
    started_at
        .partial_cmp(&holder.started_at)
        .unwrap_or(Ordering::Equal)
        .then_with(|| task_id.cmp(&holder.owner))
        == Ordering::Less
}

impl LockService for FileLockService {
    fn acquire(
        &self,
        resource: &str,
        task_id: &str,
        ttl: Duration,
        started_at: f64,
    ) -> Result<AcquireOutcome, LockError> {
        if resource.is_empty() || task_id.is_empty() {
            return Err(LockError::InvalidRequest(
                "resource and task id must be non-empty".to_string(),
            ));
        }
        if ttl.is_zero() || !started_at.is_finite() {
            return Err(LockError::InvalidRequest(format!(
                "ttl must be positive and started_at finite (ttl={ttl:?}, started_at={started_at})"
            )));
        }

        let path = self.lock_path(resource);
        self.with_guard(|| {
            let now = (self.clock)();
            let expires_at = now + ttl.as_secs_f64();

            let existing = match self.read_record(&path)? {
                Some(record) if record.is_expired(now) => {
                    debug!(resource, previous_owner = %record.owner, "reclaiming expired lock");
                    None
                }
                other => other,
            };

            let Some(mut holder) = existing else {
                let record = LockRecord {
                    resource: resource.to_string(),
                    owner: task_id.to_string(),
                    started_at,
                    expires_at,
                    wounded: false,
                    fencing_token: self.next_fencing_token()?,
                };
                self.write_record(&path, &record)?;
                info!(resource, task_id, fencing_token = record.fencing_token, "lock granted");
                return Ok(AcquireOutcome::Granted(LockGrant::from(&record)));
            };

            if holder.owner == task_id {
                holder.expires_at = expires_at;
                self.write_record(&path, &holder)?;
                debug!(resource, task_id, wounded = holder.wounded, "lock renewed");
                return Ok(AcquireOutcome::Renewed(LockGrant::from(&holder)));
            }

            if has_priority(started_at, task_id, &holder) {
                if !holder.wounded {
                    holder.wounded = true;
                    self.write_record(&path, &holder)?;
                    info!(resource, task_id, holder = %holder.owner, "older task wounded lock holder");
                }
                return Ok(AcquireOutcome::Wounded {
                    holder: holder.owner,
                });
            }

            Ok(AcquireOutcome::Wait {
                retry_after: self.retry_hint(&holder, now),
                holder: holder.owner,
            })
        })
    }

    fn release(&self, resource: &str, task_id: &str) -> Result<ReleaseOutcome, LockError> {
        let path = self.lock_path(resource);
        self.with_guard(|| {
            let now = (self.clock)();
            match self.read_record(&path)? {
                Some(record) if record.owner == task_id => {
                    self.remove_record(&path)?;
                    info!(resource, task_id, "lock released");
                    Ok(ReleaseOutcome::Released)
                }
                Some(record) if !record.is_expired(now) => Ok(ReleaseOutcome::NotOwner {
                    holder: Some(record.owner),
                }),
                _ => Ok(ReleaseOutcome::NotOwner { holder: None }),
            }
        })
    }

    fn current(&self, resource: &str) -> Result<Option<LockRecord>, LockError> {
        let path = self.lock_path(resource);
        let now = (self.clock)();
        Ok(self
            .read_record(&path)?
            .filter(|record| !record.is_expired(now)))
    }
}

/// A granted lease that is released when dropped.
///
/// Long operations call [`HeldLock::renew`] between units of work; it extends
/// the lease and reports whether the caller may continue.
pub struct HeldLock<'a> {
    service: &'a dyn LockService,
    resource: String,
    task_id: String,
    ttl: Duration,
    started_at: f64,
    grant: LockGrant,
    released: bool,
}

impl<'a> HeldLock<'a> {
    /// Acquire without waiting. Contention surfaces as `ResourceBusy`.
    pub fn acquire(
        service: &'a dyn LockService,
        resource: &str,
        task_id: &str,
        ttl: Duration,
        started_at: f64,
    ) -> Result<Self, StateError> {
        match service.acquire(resource, task_id, ttl, started_at)? {
            AcquireOutcome::Granted(grant) | AcquireOutcome::Renewed(grant) => Ok(Self {
                service,
                resource: resource.to_string(),
                task_id: task_id.to_string(),
                ttl,
                started_at,
                grant,
                released: false,
            }),
            AcquireOutcome::Wait { holder, .. } | AcquireOutcome::Wounded { holder } => {
                Err(StateError::resource_busy(resource, holder))
            }
        }
    }

    /// [`HeldLock::acquire`] with the task's fixed priority.
    pub fn acquire_for(
        service: &'a dyn LockService,
        resource: &str,
        task: &TaskIdentity,
        ttl: Duration,
    ) -> Result<Self, StateError> {
        Self::acquire(service, resource, &task.task_id, ttl, task.started_at)
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn fencing_token(&self) -> u64 {
        self.grant.fencing_token
    }

    /// Extend the lease. Returns `false` once the holder has been wounded or
    /// has lost the lock, after which the caller should stop and release.
    pub fn renew(&mut self) -> Result<bool, LockError> {
        match self
            .service
            .acquire(&self.resource, &self.task_id, self.ttl, self.started_at)?
        {
            AcquireOutcome::Renewed(grant) if grant.fencing_token == self.grant.fencing_token => {
                let wounded = grant.wounded;
                self.grant = grant;
                if wounded {
                    warn!(resource = %self.resource, task_id = %self.task_id, "lock holder wounded; yielding");
                }
                Ok(!wounded)
            }
            AcquireOutcome::Granted(grant) | AcquireOutcome::Renewed(grant) => {
                warn!(
                    resource = %self.resource,
                    task_id = %self.task_id,
                    previous = self.grant.fencing_token,
                    current = grant.fencing_token,
                    "lease lapsed and was re-granted; yielding"
                );
                self.grant = grant;
                Ok(false)
            }
            AcquireOutcome::Wait { holder, .. } | AcquireOutcome::Wounded { holder } => {
                warn!(resource = %self.resource, task_id = %self.task_id, %holder, "lock lost to another task");
                self.released = true;
                Ok(false)
            }
        }
    }

    pub fn release(mut self) -> Result<ReleaseOutcome, LockError> {
        self.released = true;
        self.service.release(&self.resource, &self.task_id)
    }
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.service.release(&self.resource, &self.task_id) {
            warn!(resource = %self.resource, error = %err, "failed to release lock on drop");
        }
    }
}
