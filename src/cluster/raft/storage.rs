//! Raft storage implementation using openraft's RaftStorage trait (v1 API).
//!
//! The Raft log and vote live in memory; applied operations flow into the
//! [`MetadataStateMachine`]. Snapshots are persisted to the object store so a
//! restarted node can rebuild its topology before rejoining.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use openraft::{
    BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, RaftStorage,
    Snapshot, SnapshotMeta, StorageError, StoredMembership, Vote,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::commands::MetadataResponse;
use super::state_machine::MetadataStateMachine;
use super::types::{RaftNodeId, TypeConfig};

/// Snapshot metadata stored alongside the snapshot data.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct SnapshotMetadata {
    last_log_id: Option<LogId<RaftNodeId>>,
    last_membership: StoredMembership<RaftNodeId, BasicNode>,
    snapshot_id: String,
}

#[derive(Clone)]
struct CachedSnapshot {
    meta: SnapshotMeta<RaftNodeId, BasicNode>,
    data: Vec<u8>,
}

fn storage_error(
    subject: ErrorSubject<RaftNodeId>,
    verb: ErrorVerb,
    message: impl Into<String>,
) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(subject, verb, std::io::Error::other(message.into()))
}

fn snapshot_error(verb: ErrorVerb, message: impl Into<String>) -> StorageError<RaftNodeId> {
    storage_error(ErrorSubject::Snapshot(None), verb, message)
}

/// Combined log and state machine storage for Raft.
pub struct RaftStore {
    vote: Arc<RwLock<Option<Vote<RaftNodeId>>>>,
    log: Arc<RwLock<BTreeMap<u64, Entry<TypeConfig>>>>,
    last_purged_log_id: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    sm: Arc<MetadataStateMachine>,
    last_applied_log: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    last_membership: Arc<RwLock<StoredMembership<RaftNodeId, BasicNode>>>,
    /// In-memory copy of the latest persisted snapshot.
    cached_snapshot: Arc<RwLock<Option<CachedSnapshot>>>,
    object_store: Arc<dyn ObjectStore>,
    snapshot_path: ObjectPath,
}

impl RaftStore {
    /// Create a store applying to `sm` and persisting snapshots under
    /// `snapshot_prefix`.
    pub fn new(
        sm: Arc<MetadataStateMachine>,
        object_store: Arc<dyn ObjectStore>,
        snapshot_prefix: &str,
    ) -> Self {
        Self {
            vote: Arc::new(RwLock::new(None)),
            log: Arc::new(RwLock::new(BTreeMap::new())),
            last_purged_log_id: Arc::new(RwLock::new(None)),
            sm,
            last_applied_log: Arc::new(RwLock::new(None)),
            last_membership: Arc::new(RwLock::new(StoredMembership::default())),
            cached_snapshot: Arc::new(RwLock::new(None)),
            object_store,
            snapshot_path: ObjectPath::from(snapshot_prefix),
        }
    }

    pub fn state_machine(&self) -> Arc<MetadataStateMachine> {
        self.sm.clone()
    }

    /// A second handle sharing all state, for log readers and snapshot
    /// builders.
    fn handle(&self) -> Self {
        Self {
            vote: self.vote.clone(),
            log: self.log.clone(),
            last_purged_log_id: self.last_purged_log_id.clone(),
            sm: self.sm.clone(),
            last_applied_log: self.last_applied_log.clone(),
            last_membership: self.last_membership.clone(),
            cached_snapshot: self.cached_snapshot.clone(),
            object_store: self.object_store.clone(),
            snapshot_path: self.snapshot_path.clone(),
        }
    }

    fn data_path(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/current.snapshot", self.snapshot_path))
    }

    fn meta_path(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/current.meta", self.snapshot_path))
    }

    /// Load the latest snapshot from the object store on startup.
    ///
    /// Returns `Ok(false)` on a clean start. A metadata file whose data is
    /// missing or unreadable is corruption and fails startup.
    pub async fn load_snapshot_from_store(&self) -> Result<bool, StorageError<RaftNodeId>> {
        self.cleanup_temp_files().await;

        let meta_path = self.meta_path();
        let meta_bytes = match self.object_store.get(&meta_path).await {
            Ok(result) => result.bytes().await.map_err(|e| {
                error!(error = %e, path = %meta_path, "Snapshot metadata exists but is unreadable");
                snapshot_error(ErrorVerb::Read, format!("snapshot metadata corruption: {}", e))
            })?,
            Err(object_store::Error::NotFound { .. }) => {
                debug!("No existing snapshot found in object store (clean start)");
                return Ok(false);
            }
            Err(e) => {
                error!(error = %e, "Failed to access snapshot metadata from object store");
                return Err(snapshot_error(ErrorVerb::Read, e.to_string()));
            }
        };

        let metadata: SnapshotMetadata = bincode::deserialize(&meta_bytes).map_err(|e| {
            error!(error = %e, path = %meta_path, "Snapshot metadata is corrupted");
            snapshot_error(
                ErrorVerb::Read,
                format!("snapshot metadata deserialization failed: {}", e),
            )
        })?;

        let data_path = self.data_path();
        let data = match self.object_store.get(&data_path).await {
            Ok(result) => result
                .bytes()
                .await
                .map_err(|e| {
                    snapshot_error(ErrorVerb::Read, format!("snapshot data corruption: {}", e))
                })?
                .to_vec(),
            Err(object_store::Error::NotFound { .. }) => {
                error!(
                    snapshot_id = %metadata.snapshot_id,
                    path = %data_path,
                    "Snapshot metadata exists but data file is missing"
                );
                return Err(snapshot_error(
                    ErrorVerb::Read,
                    "snapshot metadata exists but data file is missing",
                ));
            }
            Err(e) => return Err(snapshot_error(ErrorVerb::Read, e.to_string())),
        };

        self.sm
            .restore(&data)
            .await
            .map_err(|e| snapshot_error(ErrorVerb::Read, e.to_string()))?;
        *self.last_applied_log.write().await = metadata.last_log_id;
        *self.last_membership.write().await = metadata.last_membership.clone();

        let meta = SnapshotMeta {
            last_log_id: metadata.last_log_id,
            last_membership: metadata.last_membership,
            snapshot_id: metadata.snapshot_id,
        };
        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            "Restored snapshot from object store"
        );
        *self.cached_snapshot.write().await = Some(CachedSnapshot { meta, data });
        Ok(true)
    }

    /// Best-effort removal of `temp-*` files left by a crashed snapshot write.
    async fn cleanup_temp_files(&self) {
        let mut listing = self.object_store.list(Some(&self.snapshot_path));
        let mut temp_files = Vec::new();
        while let Some(result) = listing.next().await {
            match result {
                Ok(meta) => {
                    let path = meta.location.to_string();
                    if path.contains("/temp-")
                        && (path.ends_with(".snapshot") || path.ends_with(".meta"))
                    {
                        temp_files.push(meta.location);
                    }
                }
                Err(e) => debug!(error = %e, "Error listing files during temp cleanup"),
            }
        }
        for path in temp_files {
            match self.object_store.delete(&path).await {
                Ok(()) => info!(path = %path, "Cleaned up orphaned temp snapshot file"),
                Err(e) => debug!(error = %e, path = %path, "Failed to delete temp snapshot file"),
            }
        }
    }

    /// Move `from` to `to`, falling back to copy + delete for stores without
    /// rename.
    async fn promote(&self, from: &ObjectPath, to: &ObjectPath) -> Result<(), object_store::Error> {
        if let Err(e) = self.object_store.rename(from, to).await {
            self.object_store.copy(from, to).await?;
            let _ = self.object_store.delete(from).await;
            debug!(error = %e, "Used copy+delete fallback for snapshot file");
        }
        Ok(())
    }

    /// Persist a snapshot: write both files under temp names, then promote
    /// data before metadata. The metadata file is the commit marker.
    async fn persist_snapshot(
        &self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        data: &[u8],
    ) -> Result<(), StorageError<RaftNodeId>> {
        let temp_data = ObjectPath::from(format!(
            "{}/temp-{}.snapshot",
            self.snapshot_path, meta.snapshot_id
        ));
        let temp_meta = ObjectPath::from(format!(
            "{}/temp-{}.meta",
            self.snapshot_path, meta.snapshot_id
        ));

        let metadata = SnapshotMetadata {
            last_log_id: meta.last_log_id,
            last_membership: meta.last_membership.clone(),
            snapshot_id: meta.snapshot_id.clone(),
        };
        let meta_bytes = bincode::serialize(&metadata)
            .map_err(|e| snapshot_error(ErrorVerb::Write, e.to_string()))?;

        self.object_store
            .put(&temp_data, Bytes::copy_from_slice(data).into())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to write snapshot data to temp path");
                snapshot_error(ErrorVerb::Write, e.to_string())
            })?;

        if let Err(e) = self
            .object_store
            .put(&temp_meta, Bytes::from(meta_bytes).into())
            .await
        {
            error!(error = %e, "Failed to write snapshot metadata to temp path");
            let _ = self.object_store.delete(&temp_data).await;
            return Err(snapshot_error(ErrorVerb::Write, e.to_string()));
        }

        if let Err(e) = self.promote(&temp_data, &self.data_path()).await {
            error!(error = %e, "Failed to promote snapshot data");
            let _ = self.object_store.delete(&temp_data).await;
            let _ = self.object_store.delete(&temp_meta).await;
            return Err(snapshot_error(ErrorVerb::Write, e.to_string()));
        }
        if let Err(e) = self.promote(&temp_meta, &self.meta_path()).await {
            error!(error = %e, "Failed to promote snapshot metadata");
            let _ = self.object_store.delete(&temp_meta).await;
            return Err(snapshot_error(ErrorVerb::Write, e.to_string()));
        }

        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            size_bytes = data.len(),
            "Persisted metadata snapshot"
        );
        Ok(())
    }
}

impl RaftStorage<TypeConfig> for RaftStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.handle()
    }

    async fn save_vote(&mut self, vote: &Vote<RaftNodeId>) -> Result<(), StorageError<RaftNodeId>> {
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<RaftNodeId>>, StorageError<RaftNodeId>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_state(
        &mut self,
    ) -> Result<openraft::storage::LogState<TypeConfig>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        let last_purged = *self.last_purged_log_id.read().await;
        let last_log_id = log.values().last().map(|e| e.log_id).or(last_purged);

        Ok(openraft::storage::LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<RaftNodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let mut log = self.log.write().await;
        log.split_off(&log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        *self.last_purged_log_id.write().await = Some(log_id);
        let mut log = self.log.write().await;
        let kept = log.split_off(&(log_id.index + 1));
        *log = kept;
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<RaftNodeId>>,
            StoredMembership<RaftNodeId, BasicNode>,
        ),
        StorageError<RaftNodeId>,
    > {
        let last_applied = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<MetadataResponse>, StorageError<RaftNodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            let response = match &entry.payload {
                EntryPayload::Blank => MetadataResponse::Ok,
                EntryPayload::Normal(op) => self.sm.apply(op.clone()).await.map_err(|e| {
                    storage_error(ErrorSubject::StateMachine, ErrorVerb::Write, e.to_string())
                })?,
                EntryPayload::Membership(membership) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    MetadataResponse::Ok
                }
            };
            *self.last_applied_log.write().await = Some(entry.log_id);
            responses.push(response);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.handle()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<RaftNodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let data = snapshot.into_inner();

        self.sm
            .restore(&data)
            .await
            .map_err(|e| snapshot_error(ErrorVerb::Write, e.to_string()))?;
        *self.last_applied_log.write().await = meta.last_log_id;
        *self.last_membership.write().await =
            StoredMembership::new(meta.last_log_id, meta.last_membership.membership().clone());

        self.persist_snapshot(meta, &data).await?;
        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<RaftNodeId>> {
        Ok(self
            .cached_snapshot
            .read()
            .await
            .as_ref()
            .map(|cached| Snapshot {
                meta: cached.meta.clone(),
                snapshot: Box::new(Cursor::new(cached.data.clone())),
            }))
    }
}

impl openraft::RaftSnapshotBuilder<TypeConfig> for RaftStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<RaftNodeId>> {
        let data = self
            .sm
            .snapshot()
            .await
            .map_err(|e| snapshot_error(ErrorVerb::Write, e.to_string()))?;

        let last_applied = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id: format!("snapshot-{}", last_applied.map(|l| l.index).unwrap_or(0)),
        };

        self.persist_snapshot(&meta, &data).await?;
        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl openraft::RaftLogReader<TypeConfig> for RaftStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, e)| e.clone()).collect())
    }
}
