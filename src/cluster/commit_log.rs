//! Partition commit log on SlateDB.
//!
//! One SlateDB instance per partition replica, stored under its own object
//! store prefix. Entries are keyed by offset (see [`super::keys`]); offsets are
//! dense and start at the oldest retained offset.
//!
//! # Offsets
//!
//! - `oldest_offset()` first retained entry (0 for a fresh log)
//! - `newest_offset()` last appended entry (`-1` for a fresh log)
//! - `high_watermark()` last committed entry; readers never pass it
//!
//! # Lifecycle
//!
//! ```text
//!   Open ──close()──► Closed        (partition paused / node stopping)
//!     │
//!     └──delete()───► Deleted       (partition removed)
//! ```
//!
//! Readonly is an orthogonal, persisted flag: appends fail, readers drain to the
//! tail and then stop with [`CommitLogError::Readonly`].
//!
//! # Concurrency
//!
//! Appends are serialized by an internal lock. Readers never take it: they
//! observe atomics and wait on a `watch` channel that is bumped on every state
//! change, so any number of readers can tail the log alongside one writer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use slatedb::Db;
use slatedb::config::{PutOptions, Settings as SlateDbSettings, WriteOptions};
use tokio::sync::{Mutex, watch};
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::CommitLogError;
use super::keys::{
    HIGH_WATERMARK_KEY, NEWEST_OFFSET_KEY, OLDEST_OFFSET_KEY, READONLY_KEY, decode_offset,
    decode_record_offset, encode_offset, encode_record_key,
};
use crate::constants::{DEFAULT_CLEANER_INTERVAL, DEFAULT_LOG_FLUSH_INTERVAL};
use crate::protocol::{LogEntry, ReplicatedEntry};
use crate::types::{Offset, StreamConfig, now_nanos};

pub type CommitLogResult<T> = Result<T, CommitLogError>;

const STATUS_OPEN: u8 = 0;
const STATUS_CLOSED: u8 = 1;
const STATUS_DELETED: u8 = 2;

/// Retention limits. Unset or non-positive limits are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_messages: Option<i64>,
    pub max_age: Option<Duration>,
    pub max_bytes: Option<i64>,
    pub cleaner_interval: Option<Duration>,
}

impl RetentionPolicy {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            max_messages: config.retention_max_messages.filter(|n| *n > 0),
            max_age: config.retention_max_age.filter(|d| !d.is_zero()),
            max_bytes: config.retention_max_bytes.filter(|n| *n > 0),
            cleaner_interval: config.cleaner_interval.filter(|d| !d.is_zero()),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_messages.is_none() && self.max_age.is_none() && self.max_bytes.is_none()
    }

    fn interval(&self) -> Duration {
        self.cleaner_interval.unwrap_or(DEFAULT_CLEANER_INTERVAL)
    }
}

/// Options for opening a commit log.
#[derive(Debug, Clone)]
pub struct CommitLogOptions {
    pub flush_interval: Duration,
    pub await_durable: bool,
    pub retention: RetentionPolicy,
}

impl Default for CommitLogOptions {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_LOG_FLUSH_INTERVAL,
            await_durable: true,
            retention: RetentionPolicy::default(),
        }
    }
}

/// Result of a leader append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub offset: Offset,
    /// Timestamp stored with the entry, in nanoseconds.
    pub timestamp: i64,
}

/// An entry returned by a [`Reader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEntry {
    pub offset: Offset,
    pub entry: LogEntry,
}

pub struct CommitLog {
    name: String,
    path: String,
    db: Db,
    store: Arc<dyn ObjectStore>,
    oldest: AtomicI64,
    newest: AtomicI64,
    high_watermark: AtomicI64,
    last_timestamp: AtomicI64,
    status: AtomicU8,
    readonly: AtomicBool,
    changes: watch::Sender<u64>,
    write_lock: Mutex<()>,
    write_options: WriteOptions,
    cleaner: CancellationToken,
}

impl std::fmt::Debug for CommitLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLog")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("oldest", &self.oldest_offset())
            .field("newest", &self.newest_offset())
            .field("high_watermark", &self.high_watermark())
            .field("readonly", &self.is_readonly())
            .finish()
    }
}

struct Recovered {
    db: Db,
    oldest: Offset,
    newest: Offset,
    high_watermark: Offset,
    last_timestamp: i64,
    readonly: bool,
}

async fn recover(db: Db) -> CommitLogResult<Recovered> {
    let oldest = match db.get(OLDEST_OFFSET_KEY).await? {
        Some(bytes) => decode_offset(&bytes).unwrap_or(0),
        None => 0,
    };
    let checkpoint = match db.get(NEWEST_OFFSET_KEY).await? {
        Some(bytes) => decode_offset(&bytes).unwrap_or(-1),
        None => -1,
    };
    let readonly = matches!(db.get(READONLY_KEY).await?, Some(b) if b.first() == Some(&1));

    // The checkpoint is a lower bound. Walk forward while offsets stay dense;
    // anything past a gap is a leftover from an interrupted truncation.
    let mut newest = checkpoint.max(oldest - 1);
    let mut last_timestamp = 0;
    if newest >= oldest
        && let Some(bytes) = db.get(encode_record_key(newest)).await?
    {
        last_timestamp = decode_entry(newest, &bytes)?.timestamp;
    }
    {
        let start = encode_record_key(newest + 1);
        let end = encode_record_key(Offset::MAX);
        let mut iter = db.scan(start.as_slice()..end.as_slice()).await?;
        while let Some(item) = iter.next().await? {
            match decode_record_offset(&item.key) {
                Some(offset) if offset == newest + 1 => {
                    last_timestamp = decode_entry(offset, &item.value)?.timestamp;
                    newest = offset;
                }
                _ => break,
            }
        }
    }

    let persisted_hw = match db.get(HIGH_WATERMARK_KEY).await? {
        Some(bytes) => decode_offset(&bytes).unwrap_or(-1),
        None => -1,
    };

    Ok(Recovered {
        db,
        oldest,
        newest,
        high_watermark: persisted_hw.min(newest),
        last_timestamp,
        readonly,
    })
}

fn decode_entry(offset: Offset, bytes: &[u8]) -> CommitLogResult<LogEntry> {
    bincode::deserialize(bytes).map_err(|e| CommitLogError::Corrupt {
        offset,
        message: e.to_string(),
    })
}

fn encode_entry(offset: Offset, entry: &LogEntry) -> CommitLogResult<Vec<u8>> {
    bincode::serialize(entry).map_err(|e| CommitLogError::Corrupt {
        offset,
        message: e.to_string(),
    })
}

impl CommitLog {
    /// Open (or create) the log stored under `path`.
    ///
    /// Starts a retention cleaner when the policy sets any limit.
    pub async fn open(
        name: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        path: &str,
        options: CommitLogOptions,
    ) -> CommitLogResult<Arc<Self>> {
        let name = name.into();
        info!(log = %name, path, "Opening commit log");

        let settings = SlateDbSettings {
            flush_interval: Some(options.flush_interval),
            ..SlateDbSettings::default()
        };
        let path_for_task = path.to_string();
        let store_for_task = store.clone();

        // SlateDB's builder is driven from a blocking context so that its
        // background tasks attach to the current runtime.
        let recovered = spawn_blocking(move || {
            let handle = tokio::runtime::Handle::current();
            handle.block_on(async move {
                let db = Db::builder(ObjectPath::from(path_for_task.as_str()), store_for_task)
                    .with_settings(settings)
                    .build()
                    .await?;
                recover(db).await
            })
        })
        .await
        .map_err(|e| CommitLogError::Storage(format!("open task failed: {}", e)))??;

        let (changes, _) = watch::channel(0u64);
        let log = Arc::new(Self {
            name,
            path: path.to_string(),
            db: recovered.db,
            store,
            oldest: AtomicI64::new(recovered.oldest),
            newest: AtomicI64::new(recovered.newest),
            high_watermark: AtomicI64::new(recovered.high_watermark),
            last_timestamp: AtomicI64::new(recovered.last_timestamp),
            status: AtomicU8::new(STATUS_OPEN),
            readonly: AtomicBool::new(recovered.readonly),
            changes,
            write_lock: Mutex::new(()),
            write_options: WriteOptions {
                await_durable: options.await_durable,
            },
            cleaner: CancellationToken::new(),
        });

        debug!(
            log = %log.name,
            oldest = recovered.oldest,
            newest = recovered.newest,
            high_watermark = recovered.high_watermark,
            readonly = recovered.readonly,
            "Recovered commit log"
        );

        if !options.retention.is_unbounded() {
            spawn_cleaner(Arc::downgrade(&log), options.retention, log.cleaner.clone());
        }

        Ok(log)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn oldest_offset(&self) -> Offset {
        self.oldest.load(Ordering::Acquire)
    }

    /// Newest appended offset, `-1` when nothing was ever appended.
    pub fn newest_offset(&self) -> Offset {
        self.newest.load(Ordering::Acquire)
    }

    pub fn high_watermark(&self) -> Offset {
        self.high_watermark.load(Ordering::Acquire)
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.status.load(Ordering::Acquire) != STATUS_OPEN
    }

    /// Receiver bumped on every append, high-watermark move and status change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn check_open(&self) -> CommitLogResult<()> {
        match self.status.load(Ordering::Acquire) {
            STATUS_OPEN => Ok(()),
            STATUS_DELETED => Err(CommitLogError::Deleted),
            _ => Err(CommitLogError::Closed),
        }
    }

    /// Append an entry as leader, assigning the next offset.
    ///
    /// Timestamps are kept monotonic so that timestamp lookups can binary
    /// search.
    pub async fn append(&self, mut entry: LogEntry) -> CommitLogResult<Appended> {
        let _guard = self.write_lock.lock().await;
        self.check_open()?;
        if self.is_readonly() {
            return Err(CommitLogError::Readonly);
        }

        let offset = self.newest_offset() + 1;
        let last = self.last_timestamp.load(Ordering::Acquire);
        if entry.timestamp == 0 {
            entry.timestamp = now_nanos();
        }
        entry.timestamp = entry.timestamp.max(last);

        let value = encode_entry(offset, &entry)?;
        self.db
            .put_with_options(
                &encode_record_key(offset),
                &value,
                &PutOptions::default(),
                &self.write_options,
            )
            .await?;

        self.last_timestamp.store(entry.timestamp, Ordering::Release);
        self.newest.store(offset, Ordering::Release);
        self.notify();
        Ok(Appended {
            offset,
            timestamp: entry.timestamp,
        })
    }

    /// Copy an entry from the leader at a fixed offset.
    ///
    /// Returns `false` for an offset the log already holds. An empty log
    /// accepts any offset and moves its oldest offset there.
    pub async fn append_at(&self, offset: Offset, entry: &LogEntry) -> CommitLogResult<bool> {
        let _guard = self.write_lock.lock().await;
        self.check_open()?;

        let newest = self.newest_offset();
        if offset <= newest {
            return Ok(false);
        }
        let empty = newest < self.oldest_offset();
        if offset != newest + 1 && !empty {
            return Err(CommitLogError::OffsetGap {
                expected: newest + 1,
                actual: offset,
            });
        }
        if empty && offset != self.oldest_offset() {
            self.db
                .put_with_options(
                    OLDEST_OFFSET_KEY,
                    &encode_offset(offset),
                    &PutOptions::default(),
                    &self.write_options,
                )
                .await?;
            self.oldest.store(offset, Ordering::Release);
        }

        let value = encode_entry(offset, entry)?;
        self.db
            .put_with_options(
                &encode_record_key(offset),
                &value,
                &PutOptions::default(),
                &self.write_options,
            )
            .await?;

        self.last_timestamp
            .fetch_max(entry.timestamp, Ordering::AcqRel);
        self.newest.store(offset, Ordering::Release);
        self.notify();
        Ok(true)
    }

    /// Read the entry at `offset`, `None` if it is not retained.
    pub async fn read(&self, offset: Offset) -> CommitLogResult<Option<LogEntry>> {
        self.check_open()?;
        if offset < self.oldest_offset() || offset > self.newest_offset() {
            return Ok(None);
        }
        match self.db.get(encode_record_key(offset)).await? {
            Some(bytes) => Ok(Some(decode_entry(offset, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Entries in `(after, to]`, in offset order, at most `limit` of them.
    pub async fn read_range(
        &self,
        after: Offset,
        to: Offset,
        limit: usize,
    ) -> CommitLogResult<Vec<ReplicatedEntry>> {
        self.check_open()?;
        let from = (after + 1).max(self.oldest_offset());
        let to = to.min(self.newest_offset());
        if from > to || limit == 0 {
            return Ok(Vec::new());
        }

        let start = encode_record_key(from);
        let end = encode_record_key(to + 1);
        let mut iter = self.db.scan(start.as_slice()..end.as_slice()).await?;
        let mut entries = Vec::new();
        while let Some(item) = iter.next().await? {
            let Some(offset) = decode_record_offset(&item.key) else {
                continue;
            };
            entries.push(ReplicatedEntry {
                offset,
                entry: decode_entry(offset, &item.value)?,
            });
            if entries.len() >= limit {
                break;
            }
        }
        Ok(entries)
    }

    /// First offset whose timestamp is at or after `timestamp`.
    ///
    /// Returns `newest + 1` when every entry is older.
    pub async fn offset_for_timestamp(&self, timestamp: i64) -> CommitLogResult<Offset> {
        self.check_open()?;
        let mut lo = self.oldest_offset();
        let mut hi = self.newest_offset() + 1;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let ts = match self.read(mid).await? {
                Some(entry) => entry.timestamp,
                // Removed by retention since we started; search above it.
                None => i64::MIN,
            };
            if ts < timestamp {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Move the committed high-watermark and persist it.
    pub async fn set_high_watermark(&self, hw: Offset) -> CommitLogResult<()> {
        self.check_open()?;
        let hw = hw.min(self.newest_offset());
        if hw == self.high_watermark() {
            return Ok(());
        }
        self.db
            .put_with_options(
                HIGH_WATERMARK_KEY,
                &encode_offset(hw),
                &PutOptions::default(),
                &self.write_options,
            )
            .await?;
        self.high_watermark.store(hw, Ordering::Release);
        self.notify();
        Ok(())
    }

    /// Remove every entry after `after`.
    pub async fn truncate(&self, after: Offset) -> CommitLogResult<()> {
        let _guard = self.write_lock.lock().await;
        self.check_open()?;
        let newest = self.newest_offset();
        if after >= newest {
            return Ok(());
        }
        let after = after.max(self.oldest_offset() - 1);

        info!(log = %self.name, after, newest, "Truncating commit log");
        for offset in ((after + 1)..=newest).rev() {
            self.db.delete(encode_record_key(offset)).await?;
        }
        self.db
            .put_with_options(
                NEWEST_OFFSET_KEY,
                &encode_offset(after),
                &PutOptions::default(),
                &self.write_options,
            )
            .await?;
        if self.high_watermark() > after {
            self.db
                .put_with_options(
                    HIGH_WATERMARK_KEY,
                    &encode_offset(after),
                    &PutOptions::default(),
                    &self.write_options,
                )
                .await?;
            self.high_watermark.store(after, Ordering::Release);
        }
        self.newest.store(after, Ordering::Release);
        self.notify();
        Ok(())
    }

    pub async fn set_readonly(&self, readonly: bool) -> CommitLogResult<()> {
        let _guard = self.write_lock.lock().await;
        self.check_open()?;
        self.db
            .put_with_options(
                READONLY_KEY,
                &[u8::from(readonly)],
                &PutOptions::default(),
                &self.write_options,
            )
            .await?;
        self.readonly.store(readonly, Ordering::Release);
        self.notify();
        Ok(())
    }

    /// Drop entries older than the retention policy allows.
    ///
    /// The newest entry is always retained. Returns the new oldest offset.
    pub async fn enforce_retention(&self, policy: &RetentionPolicy) -> CommitLogResult<Offset> {
        let _guard = self.write_lock.lock().await;
        self.check_open()?;
        let oldest = self.oldest_offset();
        let newest = self.newest_offset();
        if newest < oldest {
            return Ok(oldest);
        }

        let mut new_oldest = oldest;
        if let Some(max) = policy.max_messages {
            new_oldest = new_oldest.max(newest - max + 1);
        }
        if let Some(age) = policy.max_age {
            let cutoff = now_nanos().saturating_sub(age.as_nanos() as i64);
            new_oldest = new_oldest.max(self.offset_for_timestamp(cutoff).await?);
        }
        if let Some(max_bytes) = policy.max_bytes {
            let entries = self.read_range(oldest - 1, newest, usize::MAX).await?;
            let mut retained: i64 = 0;
            let mut first_kept = newest + 1;
            for e in entries.iter().rev() {
                retained += e.entry.size_hint() as i64;
                if retained > max_bytes {
                    break;
                }
                first_kept = e.offset;
            }
            new_oldest = new_oldest.max(first_kept);
        }
        let new_oldest = new_oldest.min(newest);
        if new_oldest <= oldest {
            return Ok(oldest);
        }

        self.db
            .put_with_options(
                OLDEST_OFFSET_KEY,
                &encode_offset(new_oldest),
                &PutOptions::default(),
                &self.write_options,
            )
            .await?;
        self.oldest.store(new_oldest, Ordering::Release);
        for offset in oldest..new_oldest {
            self.db.delete(encode_record_key(offset)).await?;
        }
        debug!(log = %self.name, oldest, new_oldest, "Applied retention");
        self.notify();
        Ok(new_oldest)
    }

    pub async fn flush(&self) -> CommitLogResult<()> {
        self.check_open()?;
        self.db.flush().await?;
        Ok(())
    }

    async fn shutdown_db(&self) -> CommitLogResult<()> {
        self.cleaner.cancel();
        let _guard = self.write_lock.lock().await;
        self.db
            .put_with_options(
                NEWEST_OFFSET_KEY,
                &encode_offset(self.newest_offset()),
                &PutOptions::default(),
                &self.write_options,
            )
            .await?;
        self.db.flush().await?;
        self.db.close().await?;
        Ok(())
    }

    /// Close the log. Readers stop with [`CommitLogError::Closed`].
    ///
    /// Safe to call repeatedly.
    pub async fn close(&self) -> CommitLogResult<()> {
        if self
            .status
            .compare_exchange(STATUS_OPEN, STATUS_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        info!(log = %self.name, "Closing commit log");
        self.notify();
        self.shutdown_db().await
    }

    /// Delete the log and its stored data. Readers stop with
    /// [`CommitLogError::Deleted`].
    pub async fn delete(&self) -> CommitLogResult<()> {
        let previous = self.status.swap(STATUS_DELETED, Ordering::AcqRel);
        if previous == STATUS_DELETED {
            return Ok(());
        }
        info!(log = %self.name, "Deleting commit log");
        self.notify();
        if previous == STATUS_OPEN
            && let Err(e) = self.shutdown_db().await
        {
            warn!(log = %self.name, error = %e, "Failed to close commit log before delete");
        }

        let prefix = ObjectPath::from(self.path.as_str());
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        for meta in objects {
            self.store.delete(&meta.location).await?;
        }
        Ok(())
    }

    /// Wait until an entry after `after` exists or `timeout` elapses.
    ///
    /// Returns `true` when new data is available.
    pub async fn wait_for_append(
        &self,
        after: Offset,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut rx = self.changes.subscribe();
            if self.newest_offset() > after {
                return true;
            }
            if self.check_open().is_err() {
                return false;
            }
            tokio::select! {
                () = cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return false,
                r = rx.changed() => {
                    if r.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Reader starting at `start`. Readers see committed entries only.
    pub fn new_reader(self: &Arc<Self>, start: Offset) -> Reader {
        Reader {
            log: self.clone(),
            next: start,
        }
    }
}

fn spawn_cleaner(
    log: std::sync::Weak<CommitLog>,
    policy: RetentionPolicy,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(policy.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let Some(log) = log.upgrade() else {
                break;
            };
            if let Err(e) = log.enforce_retention(&policy).await {
                if matches!(e, CommitLogError::Closed | CommitLogError::Deleted) {
                    break;
                }
                warn!(log = %log.name, error = %e, "Retention pass failed");
            }
        }
    });
}

/// A tailing reader over a [`CommitLog`].
#[derive(Debug)]
pub struct Reader {
    log: Arc<CommitLog>,
    next: Offset,
}

impl Reader {
    /// Offset the next call will try to read.
    pub fn position(&self) -> Offset {
        self.next
    }

    /// Read the next committed entry, blocking at the tail.
    ///
    /// Fails with `Deleted` or `Closed` when the log goes away, `Readonly` when
    /// the log is readonly and fully drained, and `Canceled` when `cancel`
    /// fires first. Readers positioned before the oldest retained entry skip
    /// forward.
    pub async fn read_next(&mut self, cancel: &CancellationToken) -> CommitLogResult<ReadEntry> {
        loop {
            // Subscribe before checking state so no change can slip between.
            let mut rx = self.log.changes.subscribe();
            self.log.check_open()?;

            let oldest = self.log.oldest_offset();
            if self.next < oldest {
                self.next = oldest;
            }

            if self.next <= self.log.high_watermark() {
                match self.log.read(self.next).await {
                    Ok(Some(entry)) => {
                        let offset = self.next;
                        self.next += 1;
                        return Ok(ReadEntry { offset, entry });
                    }
                    Ok(None) => continue,
                    Err(e) => return Err(e),
                }
            }

            if self.log.is_readonly() && self.next > self.log.newest_offset() {
                return Err(CommitLogError::Readonly);
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(CommitLogError::Canceled),
                r = rx.changed() => {
                    if r.is_err() {
                        return Err(CommitLogError::Closed);
                    }
                }
            }
        }
    }
}

/// Entry payload helper for tests and benchmarks.
pub fn entry(value: impl Into<Bytes>) -> LogEntry {
    LogEntry {
        value: value.into(),
        ..Default::default()
    }
}
