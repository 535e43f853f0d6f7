//! The message store (§4.3): maps partition name to [`Partition`], lazily
//! creating partition directories on first reference.
//!
//! Grounded on the teacher's `Queue::open` directory-lifecycle pattern,
//! generalized from a single queue directory to a registry of named
//! partitions guarded by its own short-lived lock (partition I/O itself runs
//! outside that lock, per §4.3).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::partition::log::Partition;

/// Reports free space on the storage volume. Injectable so tests can fake
/// disk pressure without actually filling a filesystem.
pub trait DiskStats: Send + Sync {
    fn used_fraction(&self, path: &std::path::Path) -> std::io::Result<f64>;
}

/// Default implementation: queries `statvfs` on unix, reports 0% used
/// elsewhere.
pub struct RealDiskStats;

impl DiskStats for RealDiskStats {
    #[cfg(unix)]
    fn used_fraction(&self, path: &std::path::Path) -> std::io::Result<f64> {
        use std::ffi::CString;
        use std::mem::MaybeUninit;

        let c_path = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has NUL byte"))?;
        let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let stat = unsafe { stat.assume_init() };
        let total = stat.f_blocks as f64 * stat.f_frsize as f64;
        if total == 0.0 {
            return Ok(0.0);
        }
        let free = stat.f_bavail as f64 * stat.f_frsize as f64;
        Ok(1.0 - (free / total))
    }

    #[cfg(not(unix))]
    fn used_fraction(&self, _path: &std::path::Path) -> std::io::Result<f64> {
        Ok(0.0)
    }
}

pub struct MessageStore {
    basedir: PathBuf,
    segment_bytes: u64,
    partitions: RwLock<HashMap<String, Arc<Partition>>>,
    disk_stats: Box<dyn DiskStats>,
}

impl MessageStore {
    pub fn new(basedir: PathBuf, segment_bytes: u64) -> Self {
        Self::with_disk_stats(basedir, segment_bytes, Box::new(RealDiskStats))
    }

    pub fn with_disk_stats(
        basedir: PathBuf,
        segment_bytes: u64,
        disk_stats: Box<dyn DiskStats>,
    ) -> Self {
        MessageStore {
            basedir,
            segment_bytes,
            partitions: RwLock::new(HashMap::new()),
            disk_stats,
        }
    }

    /// Returns the partition for `name`, creating its directory (mode 0700)
    /// and opening it on first reference.
    pub async fn partition(&self, name: &str) -> Result<Arc<Partition>> {
        if let Some(partition) = self.partitions.read().await.get(name) {
            return Ok(partition.clone());
        }
        let mut partitions = self.partitions.write().await;
        if let Some(partition) = partitions.get(name) {
            return Ok(partition.clone());
        }
        let dir = self.basedir.join(name);
        create_partition_dir(&dir)?;
        let partition = Arc::new(Partition::open(name, dir, self.segment_bytes)?);
        partitions.insert(name.to_string(), partition.clone());
        Ok(partition)
    }

    /// Looks up an existing partition without creating one: fails with
    /// [`Error::UnknownPartition`] unless the partition is already cached or
    /// its directory already exists on disk from a prior reference.
    pub async fn existing_partition(&self, name: &str) -> Result<Arc<Partition>> {
        if let Some(partition) = self.partitions.read().await.get(name) {
            return Ok(partition.clone());
        }
        let mut partitions = self.partitions.write().await;
        if let Some(partition) = partitions.get(name) {
            return Ok(partition.clone());
        }
        let dir = self.basedir.join(name);
        if !dir.is_dir() {
            return Err(Error::UnknownPartition(name.to_string()));
        }
        let partition = Arc::new(Partition::open(name, dir, self.segment_bytes)?);
        partitions.insert(name.to_string(), partition.clone());
        Ok(partition)
    }

    /// Inspects free space on the storage volume; fails when used space
    /// exceeds 95%.
    pub fn check(&self) -> Result<()> {
        let used = self
            .disk_stats
            .used_fraction(&self.basedir)
            .unwrap_or(0.0);
        if used > 0.95 {
            return Err(crate::error::Error::DiskFull {
                used_pct: used * 100.0,
            });
        }
        Ok(())
    }

    /// Closes all open partitions. Collects errors but continues past any
    /// one partition's failure; returns the last error observed, if any.
    pub async fn stop(&self) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        let mut last_err = None;
        for (name, partition) in partitions.drain() {
            match partition.close().await {
                Ok(()) => log::info!("closed partition {name}"),
                Err(err) => {
                    log::warn!("failed to close partition {name}: {err}");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(unix)]
fn create_partition_dir(dir: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_partition_dir(dir: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}
