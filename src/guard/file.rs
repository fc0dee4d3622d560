use async_trait::async_trait;
use fd_lock::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::{Guard, GuardError, Lease};
use crate::config::GuardConfig;

const DIRECTORY_LOCK: &str = ".guard.lock";

/// Guard shared by every process that sees the same lease directory.
///
/// Each live lease is a `<pipeline>.lease` file created with an exclusive
/// create. Reading, reclaiming and deleting lease files happens under an
/// `fd-lock` write lock on the directory lock file.
#[derive(Debug, Clone)]
pub struct FileGuard {
    dir: PathBuf,
    ttl: Duration,
}

impl FileGuard {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn from_config(config: &GuardConfig) -> Self {
        Self::new(config.lock_dir.clone(), config.lease_ttl())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn locked<T, F>(&self, operation: F) -> Result<T, GuardError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, GuardError> + Send + 'static,
    {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&dir)?;
            let lock_file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(dir.join(DIRECTORY_LOCK))?;
            let mut lock = RwLock::new(lock_file);
            let _held = lock.write()?;
            operation(&dir)
        })
        .await
        .map_err(|e| GuardError::Storage(format!("guard task failed: {e}")))?
    }
}

/// Hex keeps distinct pipeline ids on distinct file names whatever
/// characters they contain.
fn lease_path(dir: &Path, pipeline_id: &str) -> PathBuf {
    dir.join(format!("{}.lease", hex::encode(pipeline_id)))
}

/// `None` for unreadable lease files, which count as stale.
fn read_lease(path: &Path) -> Result<Option<Lease>, GuardError> {
    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(lease) => Ok(Some(lease)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Ignoring corrupt lease file");
                Ok(None)
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_new(path: &Path, lease: &Lease) -> std::io::Result<()> {
    let mut file: File = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(&serde_json::to_vec(lease)?)?;
    file.sync_all()
}

fn replace(path: &Path, lease: &Lease) -> Result<(), GuardError> {
    let tmp = path.with_extension("lease.tmp");
    fs::write(&tmp, serde_json::to_vec(lease)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl Guard for FileGuard {
    async fn try_acquire(&self, pipeline_id: &str) -> Result<Lease, GuardError> {
        let lease = Lease::issue(pipeline_id, self.ttl);
        let pipeline_id = pipeline_id.to_string();
        self.locked(move |dir| {
            let path = lease_path(dir, &pipeline_id);
            match write_new(&path, &lease) {
                Ok(()) => return Ok(lease),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
            match read_lease(&path)? {
                Some(current) if !current.is_expired() => Err(current.conflict()),
                stale => {
                    if let Some(stale) = stale {
                        debug!(pipeline_id = %pipeline_id, holder = %stale.holder(), "Reclaiming expired lease");
                    }
                    replace(&path, &lease)?;
                    Ok(lease)
                }
            }
        })
        .await
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease, GuardError> {
        let lease = lease.clone();
        let ttl = self.ttl;
        self.locked(move |dir| {
            let path = lease_path(dir, lease.pipeline_id());
            match read_lease(&path)? {
                Some(current) if current.holder() == lease.holder() => {
                    let renewed = lease.renewed(ttl);
                    replace(&path, &renewed)?;
                    Ok(renewed)
                }
                _ => Err(lease.lost()),
            }
        })
        .await
    }

    async fn release(&self, lease: Lease) -> Result<(), GuardError> {
        self.locked(move |dir| {
            let path = lease_path(dir, lease.pipeline_id());
            match read_lease(&path)? {
                Some(current) if current.holder() == lease.holder() => {
                    fs::remove_file(&path)?;
                    Ok(())
                }
                _ => Err(lease.lost()),
            }
        })
        .await
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lease_file_excludes_second_holder() {
        let dir = TempDir::new().unwrap();
        let first = FileGuard::new(dir.path(), Duration::from_secs(60));
        let second = FileGuard::new(dir.path(), Duration::from_secs(60));

        let lease = first.try_acquire("pipeline/1").await.unwrap();
        assert!(lease_path(dir.path(), "pipeline/1").exists());

        let err = second.try_acquire("pipeline/1").await.unwrap_err();
        assert!(matches!(err, GuardError::AlreadyAcquired { .. }));

        first.release(lease).await.unwrap();
        assert!(!lease_path(dir.path(), "pipeline/1").exists());
        assert!(second.try_acquire("pipeline/1").await.is_ok());
    }

    #[test]
    fn config_sets_directory_and_ttl() {
        let config = GuardConfig {
            lease_ttl_seconds: 15,
            lock_dir: PathBuf::from("/tmp/leases"),
        };
        let guard = FileGuard::from_config(&config);
        assert_eq!(guard.dir(), Path::new("/tmp/leases"));
        assert_eq!(guard.ttl(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let crashed = FileGuard::new(dir.path(), Duration::ZERO);
        let stale = crashed.try_acquire("p").await.unwrap();

        let alive = FileGuard::new(dir.path(), Duration::from_secs(60));
        let lease = alive.try_acquire("p").await.unwrap();
        assert_ne!(lease.holder(), stale.holder());

        assert!(matches!(
            crashed.release(stale).await,
            Err(GuardError::LeaseLost { .. })
        ));
        assert!(alive.renew(&lease).await.is_ok());
    }

    #[tokio::test]
    async fn similar_ids_get_separate_leases() {
        let dir = TempDir::new().unwrap();
        let guard = FileGuard::new(dir.path(), Duration::from_secs(60));

        let slash = guard.try_acquire("team/1").await.unwrap();
        let underscore = guard.try_acquire("team_1").await.unwrap();
        let dotted = guard.try_acquire("team.1").await.unwrap();

        assert_ne!(
            lease_path(dir.path(), "team/1"),
            lease_path(dir.path(), "team_1")
        );
        guard.release(slash).await.unwrap();
        guard.release(underscore).await.unwrap();
        guard.release(dotted).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_lease_counts_as_stale() {
        let dir = TempDir::new().unwrap();
        fs::write(lease_path(dir.path(), "p"), b"not json").unwrap();

        let guard = FileGuard::new(dir.path(), Duration::from_secs(60));
        assert!(guard.try_acquire("p").await.is_ok());
    }
}
