//! The persistent message partition (§4.2): an append-only log for one topic
//! partition with monotonic id allocation and lock-free concurrent fetches.
//!
//! Grounded on the teacher's `writer.rs`/`reader.rs` split (single writer
//! behind a lock, readers working off stable on-disk offsets) and
//! `segment.rs`'s index persistence, generalized from a single mmap'd ring
//! segment to the spec's rotating `index-<firstid>.idx` / `data-<firstid>.dat`
//! file pairs.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::partition::index::{self, IndexRecord};

fn data_path(dir: &Path, first_id: u64) -> PathBuf {
    dir.join(format!("data-{first_id}.dat"))
}

fn index_path(dir: &Path, first_id: u64) -> PathBuf {
    dir.join(format!("index-{first_id}.idx"))
}

/// Segments present on disk, sorted ascending by first id.
fn list_segments(dir: &Path) -> std::io::Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("index-").and_then(|s| s.strip_suffix(".idx")) {
            if let Ok(id) = rest.parse::<u64>() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

#[derive(Debug)]
struct WriterState {
    max_id: u64,
    current_first_id: u64,
    data_file: File,
    index_file: File,
    data_len: u64,
}

/// Where to start a replay fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPoint {
    /// Deliver messages with id `>= id`.
    Id(u64),
    /// Deliver (up to) the last `n` messages in the partition.
    LastN(usize),
}

/// A streamed (id, encoded-frame-bytes) fetch result.
pub type FetchItem = Result<(u64, Vec<u8>)>;

#[derive(Debug)]
pub struct Partition {
    pub name: String,
    dir: PathBuf,
    segment_bytes: u64,
    writer: Mutex<WriterState>,
}

impl Partition {
    /// Opens (creating if absent) the partition directory and recovers
    /// `max_id` from the newest index file's last record.
    pub fn open(name: &str, dir: PathBuf, segment_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let segments = list_segments(&dir)?;

        let (current_first_id, max_id, data_len) = match segments.last().copied() {
            None => (1u64, 0u64, 0u64),
            Some(first_id) => {
                let records = index::read_all(&index_path(&dir, first_id))?;
                let max_id = records.last().map(|r| r.id).unwrap_or(first_id.saturating_sub(1));
                let data_len = std::fs::metadata(data_path(&dir, first_id))
                    .map(|m| m.len())
                    .unwrap_or(0);
                (first_id, max_id, data_len)
            }
        };

        let data_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(data_path(&dir, current_first_id))?;
        let index_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(index_path(&dir, current_first_id))?;

        Ok(Partition {
            name: name.to_string(),
            dir,
            segment_bytes,
            writer: Mutex::new(WriterState {
                max_id,
                current_first_id,
                data_file,
                index_file,
                data_len,
            }),
        })
    }

    pub async fn max_id(&self) -> u64 {
        self.writer.lock().await.max_id
    }

    /// Primary write path: allocates the next id under the writer lock,
    /// lets `encode` stamp it into the payload, then appends data and index
    /// records atomically with respect to other writers of this partition.
    pub async fn store_tx<F>(&self, encode: F) -> Result<u64>
    where
        F: FnOnce(u64) -> Vec<u8>,
    {
        let mut state = self.writer.lock().await;
        let next_id = state.max_id + 1;
        let bytes = encode(next_id);
        self.append_locked(&mut state, next_id, &bytes)?;
        Ok(next_id)
    }

    /// Requires the caller to have already allocated `id == max_id + 1`.
    pub async fn store(&self, id: u64, bytes: &[u8]) -> Result<()> {
        let mut state = self.writer.lock().await;
        let expected = state.max_id + 1;
        if id != expected {
            return Err(Error::OutOfOrder { expected, got: id });
        }
        self.append_locked(&mut state, id, bytes)
    }

    /// Runs `f` under the writer lock with the current max id, for callers
    /// that need to allocate a block of ids before writing.
    pub async fn do_in_tx<F, T>(&self, f: F) -> T
    where
        F: FnOnce(u64) -> T,
    {
        let state = self.writer.lock().await;
        f(state.max_id)
    }

    fn append_locked(&self, state: &mut WriterState, id: u64, bytes: &[u8]) -> Result<()> {
        if state.data_len > 0 && state.data_len + bytes.len() as u64 > self.segment_bytes {
            self.roll_segment(state, id)?;
        }
        let offset = state.data_len;
        state.data_file.write_all(bytes).map_err(Error::PartitionIo)?;
        state
            .data_file
            .flush()
            .map_err(Error::PartitionIo)?;
        // Advance data_len as soon as the data bytes are physically on disk,
        // before the index write. Both files are opened append-only, so the
        // kernel always appends at the true end of file regardless of what
        // we believe data_len to be; if the index write below fails, the
        // next append must still compute its offset from where the data
        // file really ends, not from a stale pre-write value.
        state.data_len += bytes.len() as u64;
        index::append_record(
            &mut state.index_file,
            IndexRecord {
                id,
                offset,
                length: bytes.len() as u32,
            },
        )
        .map_err(Error::PartitionIo)?;
        state.index_file.flush().map_err(Error::PartitionIo)?;
        state.max_id = id;
        Ok(())
    }

    /// Flushes both files under the writer lock. Called during shutdown.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.writer.lock().await;
        state.data_file.flush().map_err(Error::PartitionIo)?;
        state.index_file.flush().map_err(Error::PartitionIo)?;
        Ok(())
    }

    fn roll_segment(&self, state: &mut WriterState, first_id: u64) -> Result<()> {
        let data_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(data_path(&self.dir, first_id))
            .map_err(Error::PartitionIo)?;
        let index_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(index_path(&self.dir, first_id))
            .map_err(Error::PartitionIo)?;
        state.data_file = data_file;
        state.index_file = index_file;
        state.current_first_id = first_id;
        state.data_len = 0;
        Ok(())
    }

    /// Streams up to `count` messages starting at `start` on a channel,
    /// checking `cancel` between each send. Never blocks new writes: it
    /// opens its own read-only file handles against the segment list
    /// snapshot taken when the fetch begins.
    pub async fn fetch(
        self: std::sync::Arc<Self>,
        start: StartPoint,
        count: usize,
        tx: mpsc::Sender<FetchItem>,
        mut cancel: tokio::sync::oneshot::Receiver<()>,
    ) {
        let result = self.fetch_inner(start, count, &tx, &mut cancel).await;
        if let Err(err) = result {
            let _ = tx.send(Err(err)).await;
        }
    }

    async fn fetch_inner(
        &self,
        start: StartPoint,
        count: usize,
        tx: &mpsc::Sender<FetchItem>,
        cancel: &mut tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let segments = list_segments(&self.dir)?;
        if segments.is_empty() {
            return Ok(());
        }

        let start_id = match start {
            StartPoint::Id(id) => id,
            StartPoint::LastN(n) => {
                let max_id = self.max_id().await;
                max_id.saturating_sub(n.saturating_sub(1) as u64).max(1)
            }
        };

        let mut sent = 0usize;
        for (segment_index, &first_id) in segments.iter().enumerate() {
            if sent >= count {
                break;
            }
            if cancel.try_recv().is_ok() {
                return Ok(());
            }
            let next_first_id = segments.get(segment_index + 1).copied();
            if let Some(next) = next_first_id {
                if next <= start_id {
                    continue;
                }
            }

            let records = index::read_all(&index_path(&self.dir, first_id))?;
            let start_index = index::seek(&records, start_id).unwrap_or(records.len());
            if start_index >= records.len() {
                continue;
            }

            let mut data_file = File::open(data_path(&self.dir, first_id))?;
            for record in &records[start_index..] {
                if sent >= count {
                    break;
                }
                if cancel.try_recv().is_ok() {
                    return Ok(());
                }
                let mut buf = vec![0u8; record.length as usize];
                data_file.seek(SeekFrom::Start(record.offset))?;
                data_file.read_exact(&mut buf)?;
                if tx.send(Ok((record.id, buf))).await.is_err() {
                    return Ok(());
                }
                sent += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_partition(segment_bytes: u64) -> (tempfile::TempDir, std::sync::Arc<Partition>) {
        let dir = tempdir().unwrap();
        let partition = Partition::open("x", dir.path().to_path_buf(), segment_bytes).unwrap();
        (dir, std::sync::Arc::new(partition))
    }

    #[tokio::test]
    async fn ids_allocate_monotonically() {
        let (_dir, partition) = open_partition(1 << 20).await;
        let id1 = partition.store_tx(|id| format!("m{id}").into_bytes()).await.unwrap();
        let id2 = partition.store_tx(|id| format!("m{id}").into_bytes()).await.unwrap();
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(partition.max_id().await, 2);
    }

    #[tokio::test]
    async fn store_rejects_out_of_order() {
        let (_dir, partition) = open_partition(1 << 20).await;
        partition.store_tx(|id| format!("m{id}").into_bytes()).await.unwrap();
        let err = partition.store(5, b"bad").await.unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { expected: 2, got: 5 }));
    }

    #[tokio::test]
    async fn fetch_replays_in_order() {
        let (_dir, partition) = open_partition(1 << 20).await;
        for _ in 0..5 {
            partition.store_tx(|id| format!("m{id}").into_bytes()).await.unwrap();
        }
        let (tx, mut rx) = mpsc::channel(16);
        let (_cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(partition.clone().fetch(StartPoint::Id(3), 10, tx, cancel_rx));
        let mut ids = Vec::new();
        while let Some(item) = rx.recv().await {
            ids.push(item.unwrap().0);
        }
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn fetch_beyond_max_returns_nothing() {
        let (_dir, partition) = open_partition(1 << 20).await;
        partition.store_tx(|id| format!("m{id}").into_bytes()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let (_cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(partition.clone().fetch(StartPoint::Id(100), 10, tx, cancel_rx));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn recovery_resumes_max_id_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let partition = Partition::open("x", dir.path().to_path_buf(), 1 << 20).unwrap();
            for _ in 0..100 {
                partition.store_tx(|id| format!("m{id}").into_bytes()).await.unwrap();
            }
        }
        let reopened = Partition::open("x", dir.path().to_path_buf(), 1 << 20).unwrap();
        assert_eq!(reopened.max_id().await, 100);
    }

    #[tokio::test]
    async fn do_in_tx_observes_current_max_id_under_lock() {
        let (_dir, partition) = open_partition(1 << 20).await;
        assert_eq!(partition.do_in_tx(|max_id| max_id).await, 0);
        partition.store_tx(|id| format!("m{id}").into_bytes()).await.unwrap();
        partition.store_tx(|id| format!("m{id}").into_bytes()).await.unwrap();
        assert_eq!(partition.do_in_tx(|max_id| max_id).await, 2);

        // Blocking on the writer lock within `f` would deadlock store_tx;
        // this proves do_in_tx releases the lock before returning.
        let allocated = partition.do_in_tx(|max_id| max_id + 1).await;
        let stored = partition.store_tx(|id| format!("m{id}").into_bytes()).await.unwrap();
        assert_eq!(allocated, stored);
    }

    #[tokio::test]
    async fn rotation_creates_new_segment_pair() {
        let (_dir, partition) = open_partition(64).await;
        for _ in 0..20 {
            partition.store_tx(|id| format!("message-body-{id}").into_bytes()).await.unwrap();
        }
        let segments = list_segments(&partition.dir).unwrap();
        assert!(segments.len() > 1, "expected rotation to create multiple segments");
        let (tx, mut rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(partition.clone().fetch(StartPoint::Id(1), 20, tx, cancel_rx));
        let mut ids = Vec::new();
        while let Some(item) = rx.recv().await {
            ids.push(item.unwrap().0);
        }
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
    }
}
