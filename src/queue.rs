//! Durable, many-producer, single-consumer work queue.
//!
//! Records are appended to numbered page files on disk; a pump task feeds a
//! bounded in-memory ring (`read_chan`). When the ring is full items simply
//! stay on their pages, so memory is bounded while the backlog is not.
//! Items survive a crash until consumed; pages are unlinked as soon as the
//! pump moves past them. Discovery outpacing scan throughput therefore
//! costs disk, never memory.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Page rotation threshold, bytes.
const PAGE_BYTES: u64 = 4 * 1024 * 1024;

/// Capacity of the in-memory ring between the pump and the consumer.
const RING_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("queue consumer channel was already taken")]
    ConsumerTaken,
}

struct QueueState {
    write_page: u64,
    write_offset: u64,
    writer: Option<File>,
    read_page: u64,
    read_offset: u64,
    records_written: u64,
    records_read: u64,
    finished: bool,
}

struct QueueInner {
    dir: PathBuf,
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Disk-backed FIFO. Clone handles freely; all clones share one queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

fn page_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("page-{index:06}.dat"))
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> QueueError + '_ {
    move |source| QueueError::Io { path: path.to_owned(), source }
}

impl WorkQueue {
    /// Open (or recover) a queue rooted at `dir`. Existing page files are
    /// picked up and their records become consumable again; a fresh run is
    /// expected to point at a fresh directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let mut pages: Vec<u64> = fs::read_dir(&dir)
            .map_err(io_err(&dir))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_prefix("page-")?.strip_suffix(".dat")?.parse().ok()
            })
            .collect();
        pages.sort_unstable();

        let (read_page, write_page) = match (pages.first(), pages.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => (0, 0),
        };

        // Count back any records left behind by a previous process.
        let mut records = 0u64;
        for page in &pages {
            records += count_records(&page_path(&dir, *page))?;
        }
        if records > 0 {
            debug!(records, "recovered unconsumed queue records");
        }
        let write_offset = if pages.is_empty() {
            0
        } else {
            fs::metadata(page_path(&dir, write_page)).map_err(io_err(&dir))?.len()
        };

        Ok(Self {
            inner: Arc::new(QueueInner {
                dir,
                state: Mutex::new(QueueState {
                    write_page,
                    write_offset,
                    writer: None,
                    read_page,
                    read_offset: 0,
                    records_written: records,
                    records_read: 0,
                    finished: false,
                }),
                notify: Notify::new(),
            }),
        })
    }

    /// Append one record. Durable once this returns.
    pub fn put(&self, bytes: &[u8]) -> Result<(), QueueError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if state.finished {
                warn!("put after finish; record dropped");
                return Ok(());
            }
            if state.writer.is_none() || state.write_offset >= PAGE_BYTES {
                if state.writer.is_some() {
                    state.write_page += 1;
                    state.write_offset = 0;
                }
                let path = page_path(&inner.dir, state.write_page);
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(io_err(&path))?;
                state.writer = Some(file);
            }
            let path = page_path(&inner.dir, state.write_page);
            let writer = state.writer.as_mut().expect("writer opened above");
            writer
                .write_u32::<LittleEndian>(bytes.len() as u32)
                .and_then(|()| writer.write_all(bytes))
                .and_then(|()| writer.flush())
                .map_err(io_err(&path))?;
            state.write_offset += 4 + bytes.len() as u64;
            state.records_written += 1;
        }
        inner.notify.notify_waiters();
        Ok(())
    }

    /// Records put but not yet handed to the consumer side.
    pub fn depth(&self) -> u64 {
        let state = self.inner.state.lock();
        state.records_written - state.records_read
    }

    /// No further puts; the consumer channel closes once the backlog drains.
    pub fn finish(&self) {
        self.inner.state.lock().finished = true;
        self.inner.notify.notify_waiters();
    }

    /// Purge all on-disk state. Call after the run is over.
    pub fn delete(&self) -> Result<(), QueueError> {
        let dir = &self.inner.dir;
        if dir.exists() {
            fs::remove_dir_all(dir).map_err(io_err(dir))?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Spawn the pump and return the single consumer channel. FIFO across
    /// producers is whatever order `put` serialized them in.
    pub fn read_chan(&self, cancel: CancellationToken) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(RING_CAPACITY);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let step = {
                    let mut state = inner.state.lock();
                    pump_next(&inner.dir, &mut state)
                };
                match step {
                    Ok(Some(record)) => {
                        let sent = tokio::select! {
                            _ = cancel.cancelled() => break,
                            sent = tx.send(record) => sent,
                        };
                        if sent.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let notified = inner.notify.notified();
                        {
                            let state = inner.state.lock();
                            if state.finished && state.records_read == state.records_written {
                                break;
                            }
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = notified => {}
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "queue pump failed; closing consumer channel");
                        break;
                    }
                }
            }
        });
        rx
    }
}

/// Pull the next record off disk, advancing the read cursor and unlinking
/// fully consumed pages. `None` means "nothing available right now".
fn pump_next(dir: &Path, state: &mut QueueState) -> Result<Option<Vec<u8>>, QueueError> {
    loop {
        if state.records_read == state.records_written {
            return Ok(None);
        }
        let path = page_path(dir, state.read_page);
        let page_len = fs::metadata(&path).map_err(io_err(&path))?.len();

        if state.read_offset >= page_len {
            if state.read_page >= state.write_page {
                // Writer is mid-page; nothing new yet.
                return Ok(None);
            }
            fs::remove_file(&path).map_err(io_err(&path))?;
            state.read_page += 1;
            state.read_offset = 0;
            continue;
        }

        let mut file = File::open(&path).map_err(io_err(&path))?;
        file.seek(SeekFrom::Start(state.read_offset)).map_err(io_err(&path))?;
        let len = file.read_u32::<LittleEndian>().map_err(io_err(&path))? as usize;
        let mut record = vec![0u8; len];
        file.read_exact(&mut record).map_err(io_err(&path))?;
        state.read_offset += 4 + len as u64;
        state.records_read += 1;
        return Ok(Some(record));
    }
}

fn count_records(path: &Path) -> Result<u64, QueueError> {
    let len = fs::metadata(path).map_err(io_err(path))?.len();
    let mut file = File::open(path).map_err(io_err(path))?;
    let mut offset = 0u64;
    let mut records = 0u64;
    while offset + 4 <= len {
        let record_len = file.read_u32::<LittleEndian>().map_err(io_err(path))? as u64;
        if offset + 4 + record_len > len {
            warn!(path = %path.display(), "truncated trailing record; ignoring");
            break;
        }
        file.seek(SeekFrom::Current(record_len as i64)).map_err(io_err(path))?;
        offset += 4 + record_len;
        records += 1;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    async fn drain(mut rx: mpsc::Receiver<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(record) = rx.recv().await {
            out.push(record);
        }
        out
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let queue = WorkQueue::open(dir.path().join("q")).unwrap();
        for i in 0..500u32 {
            queue.put(format!("item-{i}").as_bytes()).unwrap();
        }
        queue.finish();

        let records = drain(queue.read_chan(CancellationToken::new())).await;
        assert_eq!(records.len(), 500);
        assert_eq!(records[0], b"item-0");
        assert_eq!(records[499], b"item-499");
    }

    #[tokio::test]
    async fn records_larger_than_the_ring_still_arrive() {
        let dir = tempfile::tempdir().unwrap();
        let queue = WorkQueue::open(dir.path().join("q")).unwrap();
        // Far more items than RING_CAPACITY, consumed slowly.
        for i in 0..(RING_CAPACITY * 4) {
            queue.put(format!("{i}").as_bytes()).unwrap();
        }
        queue.finish();
        let records = drain(queue.read_chan(CancellationToken::new())).await;
        assert_eq!(records.len(), RING_CAPACITY * 4);
    }

    #[tokio::test]
    async fn pages_rotate_and_are_unlinked_after_consumption() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("q");
        let queue = WorkQueue::open(&root).unwrap();
        let big = vec![b'x'; 1024 * 1024];
        for _ in 0..10 {
            queue.put(&big).unwrap();
        }
        let pages = fs::read_dir(&root).unwrap().count();
        assert!(pages > 1, "expected page rotation, found {pages} page file(s)");

        queue.finish();
        let records = drain(queue.read_chan(CancellationToken::new())).await;
        assert_eq!(records.len(), 10);

        // Everything before the write page is gone.
        let remaining = fs::read_dir(&root).unwrap().count();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn unconsumed_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("q");
        {
            let queue = WorkQueue::open(&root).unwrap();
            queue.put(b"survivor-1").unwrap();
            queue.put(b"survivor-2").unwrap();
            // Dropped without consuming: simulates a crash.
        }

        let queue = WorkQueue::open(&root).unwrap();
        assert_eq!(queue.depth(), 2);
        queue.finish();
        let records = drain(queue.read_chan(CancellationToken::new())).await;
        assert_eq!(records, vec![b"survivor-1".to_vec(), b"survivor-2".to_vec()]);
    }

    #[tokio::test]
    async fn depth_tracks_pending_records() {
        let dir = tempfile::tempdir().unwrap();
        let queue = WorkQueue::open(dir.path().join("q")).unwrap();
        assert_eq!(queue.depth(), 0);
        queue.put(b"a").unwrap();
        queue.put(b"b").unwrap();
        assert_eq!(queue.depth(), 2);

        queue.finish();
        let records = drain(queue.read_chan(CancellationToken::new())).await;
        assert_eq!(records.len(), 2);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn delete_purges_disk_state() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("q");
        let queue = WorkQueue::open(&root).unwrap();
        queue.put(b"doomed").unwrap();
        assert!(root.exists());
        queue.delete().unwrap();
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn cancellation_stops_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let queue = WorkQueue::open(dir.path().join("q")).unwrap();
        for i in 0..100u32 {
            queue.put(&i.to_le_bytes()).unwrap();
        }
        let cancel = CancellationToken::new();
        let mut rx = queue.read_chan(cancel.clone());
        let first = rx.recv().await;
        assert!(first.is_some());
        cancel.cancel();
        // The pump exits; the channel drains whatever was already in the
        // ring and then closes.
        while rx.recv().await.is_some() {}
    }
}
