//! Offline-first repository
//!
//! Every write lands in the local store first. When the device is online the
//! write goes straight through to the remote store; otherwise (or when the
//! remote is unreachable) it is queued in `pending_operations` and replayed by
//! the sync service later. Reads are served from the cache, falling back to
//! the local store.
//!
//! Sensitive fields are encrypted before a record is written anywhere: local
//! documents, the pending queue, the cache, the conflict log and the remote.

use crate::cache::CacheService;
use crate::clock::Clock;
use crate::conflict_resolution::{ConflictDetector, ConflictResolver, SyncDecision};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::field_encryption::FieldEncryption;
use crate::local_db::{ConflictLogEntry, LocalDatabase, OperationType, PendingOperation};
use crate::models::Syncable;
use crate::remote::RemoteStore;
use async_trait::async_trait;
use logger_redacted::{redacted_error, redacted_warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Services shared by every repository of an engine
#[derive(Clone)]
pub struct RepositoryContext {
    pub db: LocalDatabase,
    pub remote: Arc<dyn RemoteStore>,
    pub connectivity: ConnectivityMonitor,
    pub encryption: Arc<FieldEncryption>,
    pub cache: Arc<CacheService>,
    pub clock: Arc<dyn Clock>,
}

/// Outcome of replaying one collection's pending queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub conflicts: u64,
}

impl std::ops::AddAssign for ReplayReport {
    fn add_assign(&mut self, other: Self) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.conflicts += other.conflicts;
    }
}

/// Outcome of reconciling one collection against the remote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub pulled: u64,
    pub pushed: u64,
    pub removed: u64,
    pub conflicts: u64,
}

impl std::ops::AddAssign for PullReport {
    fn add_assign(&mut self, other: Self) {
        self.pulled += other.pulled;
        self.pushed += other.pushed;
        self.removed += other.removed;
        self.conflicts += other.conflicts;
    }
}

/// Type-erased view of a repository used by the sync service
#[async_trait]
pub trait SyncTarget: Send + Sync {
    fn collection(&self) -> &'static str;

    async fn pending_count(&self) -> SyncResult<u64>;

    /// Replay queued writes in enqueue order.
    ///
    /// Stops at the first transient failure and returns it; other failures
    /// are recorded on the operation and the pass continues.
    async fn replay_pending(&self) -> SyncResult<ReplayReport>;

    async fn pull_and_reconcile(&self) -> SyncResult<PullReport>;
}

pub struct OfflineRepository<T: Syncable> {
    ctx: RepositoryContext,
    resolver: ConflictResolver<T>,
}

impl<T: Syncable> OfflineRepository<T> {
    pub fn new(ctx: RepositoryContext, resolver: ConflictResolver<T>) -> Self {
        Self { ctx, resolver }
    }

    pub fn context(&self) -> &RepositoryContext {
        &self.ctx
    }

    fn cache_key(id: Uuid) -> String {
        format!("{}:{}", T::COLLECTION, id)
    }

    fn list_key() -> String {
        format!("{}:all", T::COLLECTION)
    }

    fn cache_prefix() -> String {
        format!("{}:", T::COLLECTION)
    }

    fn encode(&self, record: &T) -> SyncResult<Value> {
        self.ctx.encryption.encrypt_fields(&record.to_json()?, T::SENSITIVE_FIELDS)
    }

    fn decode(&self, doc: &Value) -> SyncResult<T> {
        T::from_json(self.ctx.encryption.decrypt_fields(doc, T::SENSITIVE_FIELDS)?)
    }

    // ------------------------------------------------------------------
    // Local store
    // ------------------------------------------------------------------

    pub async fn save_locally(&self, record: &T) -> SyncResult<()> {
        let doc = self.encode(record)?;
        self.ctx.db.upsert_document(T::COLLECTION, record.id(), &doc).await?;
        self.ctx.cache.invalidate_prefix(&Self::cache_prefix()).await;
        Ok(())
    }

    pub async fn delete_locally(&self, id: Uuid) -> SyncResult<bool> {
        let existed = self.ctx.db.delete_document(T::COLLECTION, id).await?;
        self.ctx.cache.invalidate_prefix(&Self::cache_prefix()).await;
        Ok(existed)
    }

    pub async fn load_locally(&self, id: Uuid) -> SyncResult<Option<T>> {
        self.ctx
            .db
            .get_document(T::COLLECTION, id)
            .await?
            .map(|doc| self.decode(&doc))
            .transpose()
    }

    pub async fn load_all_locally(&self) -> SyncResult<Vec<T>> {
        self.ctx
            .db
            .list_documents(T::COLLECTION)
            .await?
            .iter()
            .map(|doc| self.decode(doc))
            .collect()
    }

    // ------------------------------------------------------------------
    // Remote store
    // ------------------------------------------------------------------

    /// Push `record` on top of the remote copy it was derived from.
    ///
    /// On success the local copy is marked synced and returned.
    pub async fn save_to_remote(&self, record: &T) -> SyncResult<T> {
        let synced = record.with_sync_state(record.version(), true);
        let doc = self.encode(&synced)?;
        self.ctx
            .remote
            .put(T::COLLECTION, record.id(), &doc, record.base_version())
            .await?;
        self.save_locally(&synced).await?;

        tracing::debug!(
            collection = T::COLLECTION,
            record_id = %record.id(),
            version = record.version(),
            "Record pushed to remote"
        );
        Ok(synced)
    }

    pub async fn delete_from_remote(&self, id: Uuid) -> SyncResult<()> {
        self.ctx.remote.delete(T::COLLECTION, id).await
    }

    pub async fn fetch_remote(&self, id: Uuid) -> SyncResult<Option<T>> {
        self.ctx
            .remote
            .fetch(T::COLLECTION, id)
            .await?
            .map(|doc| self.decode(&doc).map(|r| r.with_sync_state(r.version(), true)))
            .transpose()
    }

    pub async fn load_all_from_remote(&self) -> SyncResult<Vec<T>> {
        self.ctx
            .remote
            .fetch_all(T::COLLECTION)
            .await?
            .iter()
            .map(|doc| self.decode(doc).map(|r| r.with_sync_state(r.version(), true)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Offline-first operations
    // ------------------------------------------------------------------

    /// Save locally, then push if online or queue for later
    pub async fn save(&self, record: T) -> SyncResult<T> {
        self.save_locally(&record).await?;

        if !self.ctx.connectivity.is_online() || self.has_pending(record.id()).await? {
            self.enqueue_write(&record).await?;
            return Ok(record);
        }

        match self.save_to_remote(&record).await {
            Ok(synced) => Ok(synced),
            Err(SyncError::VersionMismatch { .. }) => self.reconcile_rejected(record).await,
            Err(e) if e.is_transient() => {
                redacted_warn!(
                    format!("Remote write failed, queued for sync: {}", e),
                    collection = T::COLLECTION,
                    record_id = record.id(),
                );
                self.enqueue_write(&record).await?;
                Ok(record)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply `change` to the stored record as a local edit and save it
    pub async fn update<F>(&self, id: Uuid, change: F) -> SyncResult<T>
    where
        F: FnOnce(&T) -> T + Send,
    {
        let current = self
            .load_locally(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("{}/{}", T::COLLECTION, id)))?;
        let edited = change(&current).edited(self.ctx.clock.now());
        self.save(edited).await
    }

    /// Delete locally, then remotely if online or queue for later
    pub async fn delete(&self, id: Uuid) -> SyncResult<bool> {
        let existed = self.delete_locally(id).await?;

        if self.ctx.connectivity.is_online() && !self.has_pending(id).await? {
            match self.delete_from_remote(id).await {
                Ok(()) => return Ok(existed),
                Err(e) if e.is_transient() => {
                    redacted_warn!(
                        format!("Remote delete failed, queued for sync: {}", e),
                        collection = T::COLLECTION,
                        record_id = id,
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.ctx
            .db
            .enqueue_operation(T::COLLECTION, id, OperationType::Delete, &json!({ "id": id }))
            .await?;
        Ok(existed)
    }

    pub async fn get(&self, id: Uuid) -> SyncResult<Option<T>> {
        let key = Self::cache_key(id);
        if let Some(doc) = self.ctx.cache.get(&key).await {
            return self.decode(&doc).map(Some);
        }

        let Some(doc) = self.ctx.db.get_document(T::COLLECTION, id).await? else {
            return Ok(None);
        };
        let record = self.decode(&doc)?;
        self.ctx.cache.put(&key, doc).await;
        Ok(Some(record))
    }

    pub async fn list(&self) -> SyncResult<Vec<T>> {
        let key = Self::list_key();
        if let Some(Value::Array(docs)) = self.ctx.cache.get(&key).await {
            return docs.iter().map(|doc| self.decode(doc)).collect();
        }

        let docs = self.ctx.db.list_documents(T::COLLECTION).await?;
        let records = docs.iter().map(|doc| self.decode(doc)).collect::<SyncResult<Vec<T>>>()?;
        self.ctx.cache.put(&key, Value::Array(docs)).await;
        Ok(records)
    }

    pub async fn pending_count(&self) -> SyncResult<u64> {
        self.ctx.db.pending_count(Some(T::COLLECTION)).await
    }

    pub async fn pending_operations(&self) -> SyncResult<Vec<PendingOperation>> {
        self.ctx.db.pending_operations(Some(T::COLLECTION)).await
    }

    async fn has_pending(&self, id: Uuid) -> SyncResult<bool> {
        Ok(self
            .pending_operations()
            .await?
            .iter()
            .any(|op| op.record_id == id))
    }

    async fn enqueue_write(&self, record: &T) -> SyncResult<()> {
        let operation = if record.base_version() == 0 {
            OperationType::Create
        } else {
            OperationType::Update
        };
        let doc = self.encode(record)?;
        self.ctx
            .db
            .enqueue_operation(T::COLLECTION, record.id(), operation, &doc)
            .await?;
        Ok(())
    }

    /// Push if online; queue on transient failure or a fresh version race
    async fn push_or_enqueue(&self, record: T) -> SyncResult<T> {
        if !self.ctx.connectivity.is_online() {
            self.enqueue_write(&record).await?;
            return Ok(record);
        }

        match self.save_to_remote(&record).await {
            Ok(synced) => Ok(synced),
            Err(e) if e.is_transient() || matches!(e, SyncError::VersionMismatch { .. }) => {
                redacted_warn!(
                    format!("Push deferred to next sync: {}", e),
                    collection = T::COLLECTION,
                    record_id = record.id(),
                );
                self.enqueue_write(&record).await?;
                Ok(record)
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Handle a push the remote rejected because its version moved on
    async fn reconcile_rejected(&self, record: T) -> SyncResult<T> {
        let local = self.load_locally(record.id()).await?.unwrap_or(record);

        match self.fetch_remote(local.id()).await? {
            Some(remote) => self.resolve_conflict(local, remote).await,
            None => {
                // Deleted remotely while edited here; the edit recreates it
                let recreated = local.with_sync_state(1, false);
                self.save_locally(&recreated).await?;
                self.push_or_enqueue(recreated).await
            }
        }
    }

    /// Resolve, log, store and push the winner of a conflict
    pub async fn resolve_conflict(&self, local: T, remote: T) -> SyncResult<T> {
        let now = self.ctx.clock.now();
        let conflict = self.resolver.create_conflict(local, remote, now)?;
        let resolved = self.resolver.resolve(&conflict, now).await?;

        self.ctx
            .db
            .log_conflict(&ConflictLogEntry {
                id: conflict.id,
                collection: T::COLLECTION.to_string(),
                record_id: conflict.record_id,
                local_version: self.encode(&conflict.local)?,
                remote_version: self.encode(&conflict.remote)?,
                strategy: resolved.label(),
                resolved_version: resolved.record.version(),
                created_at: now,
            })
            .await?;

        self.save_locally(&resolved.record).await?;
        self.push_or_enqueue(resolved.record).await
    }

    // ------------------------------------------------------------------
    // Sync passes
    // ------------------------------------------------------------------

    pub async fn replay_pending(&self) -> SyncResult<ReplayReport> {
        let mut report = ReplayReport::default();

        for op in self.pending_operations().await? {
            report.attempted += 1;

            let result = match op.operation {
                OperationType::Create | OperationType::Update => self.replay_write(&op).await,
                OperationType::Delete => self.delete_from_remote(op.record_id).await.map(|()| None),
            };

            match result {
                Ok(_) => {
                    self.ctx.db.mark_synced(op.id).await?;
                    report.succeeded += 1;
                }
                Err(SyncError::VersionMismatch { .. }) => {
                    // The resolved record is queued afresh if it cannot be pushed
                    self.ctx.db.mark_synced(op.id).await?;
                    report.conflicts += 1;

                    let queued = self.decode(&op.data)?;
                    if let Err(e) = self.reconcile_rejected(queued.clone()).await {
                        if let Some(local) = self.load_locally(queued.id()).await? {
                            self.enqueue_write(&local).await?;
                        }
                        return Err(e);
                    }
                }
                Err(e) if e.is_transient() => {
                    self.ctx.db.mark_failed(op.id, &e.to_string()).await?;
                    tracing::warn!(
                        collection = T::COLLECTION,
                        operation_id = %op.id,
                        seq = op.seq,
                        error = %e,
                        "Replay interrupted"
                    );
                    return Err(e);
                }
                Err(e) => {
                    self.ctx.db.mark_failed(op.id, &e.to_string()).await?;
                    report.failed += 1;
                    redacted_error!(
                        format!("Pending operation rejected: {}", e),
                        collection = T::COLLECTION,
                        operation_id = op.id,
                    );
                }
            }
        }

        if report.attempted > 0 {
            tracing::info!(
                collection = T::COLLECTION,
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                conflicts = report.conflicts,
                "Replayed pending operations"
            );
        }
        Ok(report)
    }

    async fn replay_write(&self, op: &PendingOperation) -> SyncResult<Option<T>> {
        let queued = self.decode(&op.data)?;
        let synced = queued.with_sync_state(queued.version(), true);
        self.ctx
            .remote
            .put(T::COLLECTION, queued.id(), &self.encode(&synced)?, queued.base_version())
            .await?;

        // Only mark synced if no newer local edit exists
        if let Some(local) = self.load_locally(queued.id()).await? {
            if !local.is_synced()
                && local.version() == queued.version()
                && local.updated_at() == queued.updated_at()
            {
                self.save_locally(&synced).await?;
            }
        }
        Ok(Some(synced))
    }

    pub async fn pull_and_reconcile(&self) -> SyncResult<PullReport> {
        let mut report = PullReport::default();
        let mut remote_by_id: HashMap<Uuid, T> = self
            .load_all_from_remote()
            .await?
            .into_iter()
            .map(|r| (r.id(), r))
            .collect();
        let pending: HashSet<Uuid> = self
            .pending_operations()
            .await?
            .into_iter()
            .map(|op| op.record_id)
            .collect();

        for local in self.load_all_locally().await? {
            let remote = remote_by_id.remove(&local.id());
            if pending.contains(&local.id()) {
                continue;
            }

            let decision = ConflictDetector::classify(Some(&local), remote.as_ref());
            match (decision, remote) {
                (SyncDecision::InSync, _) => {}
                (SyncDecision::PullRemote, Some(remote)) => {
                    self.save_locally(&remote).await?;
                    report.pulled += 1;
                }
                (SyncDecision::Conflict, Some(remote)) => {
                    self.resolve_conflict(local, remote).await?;
                    report.conflicts += 1;
                }
                (SyncDecision::RemoteDeleted, _) if local.is_synced() => {
                    self.delete_locally(local.id()).await?;
                    report.removed += 1;
                }
                (SyncDecision::RemoteDeleted, _) => {
                    let recreated = local.with_sync_state(1, false);
                    self.save_locally(&recreated).await?;
                    self.push_or_enqueue(recreated).await?;
                    report.pushed += 1;
                }
                (_, _) => {
                    self.push_or_enqueue(local).await?;
                    report.pushed += 1;
                }
            }
        }

        for (id, remote) in remote_by_id {
            if pending.contains(&id) {
                continue;
            }
            self.save_locally(&remote).await?;
            report.pulled += 1;
        }

        tracing::debug!(
            collection = T::COLLECTION,
            pulled = report.pulled,
            pushed = report.pushed,
            removed = report.removed,
            conflicts = report.conflicts,
            "Reconciled with remote"
        );
        Ok(report)
    }
}

#[async_trait]
impl<T: Syncable> SyncTarget for OfflineRepository<T> {
    fn collection(&self) -> &'static str {
        T::COLLECTION
    }

    async fn pending_count(&self) -> SyncResult<u64> {
        OfflineRepository::pending_count(self).await
    }

    async fn replay_pending(&self) -> SyncResult<ReplayReport> {
        OfflineRepository::replay_pending(self).await
    }

    async fn pull_and_reconcile(&self) -> SyncResult<PullReport> {
        OfflineRepository::pull_and_reconcile(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::clock::ManualClock;
    use crate::connectivity::ConnectivityStatus;
    use crate::field_encryption::FieldEncryptionConfig;
    use crate::models::{Medication, Prescription, PrescriptionChanges};
    use crate::remote::{InMemoryRemote, MockRemoteStore};
    use chrono::{Duration, NaiveDate};

    struct Fixture {
        repo: OfflineRepository<Prescription>,
        remote: Arc<InMemoryRemote>,
        connectivity: ConnectivityMonitor,
        clock: ManualClock,
        db: LocalDatabase,
    }

    async fn context(remote: Arc<dyn RemoteStore>, clock: &ManualClock) -> RepositoryContext {
        let db = LocalDatabase::in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        RepositoryContext {
            cache: Arc::new(
                CacheService::new(CacheConfig::default())
                    .with_disk(db.clone())
                    .with_clock(clock.clone()),
            ),
            db,
            remote,
            connectivity: ConnectivityMonitor::default(),
            encryption: Arc::new(
                FieldEncryption::new(FieldEncryptionConfig::default(), &[7u8; 32]).unwrap(),
            ),
            clock,
        }
    }

    async fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let remote = Arc::new(InMemoryRemote::new());
        let ctx = context(remote.clone(), &clock).await;
        Fixture {
            connectivity: ctx.connectivity.clone(),
            db: ctx.db.clone(),
            repo: OfflineRepository::new(ctx, ConflictResolver::newer_wins()),
            remote,
            clock,
        }
    }

    #[tokio::test]
    async fn test_online_save_writes_through() {
        let f = fixture().await;
        let rx = Prescription::new("Jane Roe", "dr.smith", f.clock.now());

        let saved = f.repo.save(rx.clone()).await.unwrap();
        assert!(saved.is_synced);
        assert_eq!(saved.version, 1);

        let remote_doc = f.remote.get_raw("prescriptions", rx.id).unwrap();
        assert_eq!(remote_doc["version"], 1);
        // Patient name never leaves the device in clear text
        assert!(remote_doc["patientName"].as_str().unwrap().starts_with("ENC:"));

        let local = f.repo.load_locally(rx.id).await.unwrap().unwrap();
        assert!(local.is_synced);
        assert_eq!(local.patient_name, "Jane Roe");
        assert_eq!(f.repo.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_save_queues_and_replay_pushes() {
        let f = fixture().await;
        f.connectivity.set_status(ConnectivityStatus::Offline);

        let rx = Prescription::new("Jane Roe", "dr.smith", f.clock.now());
        let saved = f.repo.save(rx.clone()).await.unwrap();
        assert!(!saved.is_synced);

        f.clock.advance(Duration::seconds(5));
        let edited = f
            .repo
            .update(rx.id, |r| {
                r.copy_with(PrescriptionChanges {
                    patient_name: Some("Jane Q. Roe".to_string()),
                    ..Default::default()
                })
            })
            .await
            .unwrap();
        assert_eq!(edited.version, 1);

        // The update coalesced into the queued create
        let pending = f.repo.pending_operations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, OperationType::Create);
        assert!(f.remote.get_raw("prescriptions", rx.id).is_none());

        f.connectivity.set_status(ConnectivityStatus::Online);
        let report = f.repo.replay_pending().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(f.repo.pending_count().await.unwrap(), 0);

        let local = f.repo.load_locally(rx.id).await.unwrap().unwrap();
        assert!(local.is_synced);
        assert_eq!(local.patient_name, "Jane Q. Roe");
        assert_eq!(f.remote.get_raw("prescriptions", rx.id).unwrap()["version"], 1);
    }

    #[tokio::test]
    async fn test_transient_failure_queues_write() {
        let f = fixture().await;
        f.remote.set_available(false);

        let rx = Prescription::new("Jane Roe", "dr.smith", f.clock.now());
        let saved = f.repo.save(rx.clone()).await.unwrap();
        assert!(!saved.is_synced);
        assert_eq!(f.repo.pending_count().await.unwrap(), 1);

        let err = f.repo.replay_pending().await.unwrap_err();
        assert!(err.is_transient());
        let pending = f.repo.pending_operations().await.unwrap();
        assert_eq!(pending[0].retry_count, 1);
        assert!(pending[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_get_and_list_use_cache_and_see_writes() {
        let f = fixture().await;
        let rx = f
            .repo
            .save(Prescription::new("Jane Roe", "dr.smith", f.clock.now()))
            .await
            .unwrap();

        assert_eq!(f.repo.list().await.unwrap().len(), 1);
        assert_eq!(f.repo.get(rx.id).await.unwrap().unwrap().patient_name, "Jane Roe");

        // A cached list must not hide a later write
        f.repo
            .save(Prescription::new("John Doe", "dr.smith", f.clock.now()))
            .await
            .unwrap();
        assert_eq!(f.repo.list().await.unwrap().len(), 2);

        let stats = f.repo.context().cache.stats();
        assert!(stats.misses >= 2);
    }

    #[tokio::test]
    async fn test_delete_offline_then_replay() {
        let f = fixture().await;
        let rx = f
            .repo
            .save(Prescription::new("Jane Roe", "dr.smith", f.clock.now()))
            .await
            .unwrap();

        f.connectivity.set_status(ConnectivityStatus::Offline);
        assert!(f.repo.delete(rx.id).await.unwrap());
        assert!(f.repo.get(rx.id).await.unwrap().is_none());
        assert!(f.remote.get_raw("prescriptions", rx.id).is_some());

        f.connectivity.set_status(ConnectivityStatus::Online);
        f.repo.replay_pending().await.unwrap();
        assert!(f.remote.get_raw("prescriptions", rx.id).is_none());
    }

    #[tokio::test]
    async fn test_conflict_on_save_resolves_and_logs() {
        let f = fixture().await;
        let rx = f
            .repo
            .save(Prescription::new("Jane Roe", "dr.smith", f.clock.now()))
            .await
            .unwrap();

        // Another device moves the remote to version 2 later in time
        f.clock.advance(Duration::seconds(60));
        let theirs = rx
            .copy_with(PrescriptionChanges {
                patient_name: Some("Jane Remote".to_string()),
                ..Default::default()
            })
            .with_sync_state(2, true)
            .touched(f.clock.now());
        let doc = f
            .repo
            .context()
            .encryption
            .encrypt_fields(&theirs.to_json().unwrap(), &["patientName"])
            .unwrap();
        f.remote.insert_raw("prescriptions", rx.id, doc);

        // Local edit made earlier than the remote one
        let mine = rx
            .copy_with(PrescriptionChanges {
                patient_name: Some("Jane Local".to_string()),
                ..Default::default()
            })
            .edited(f.clock.now() - Duration::seconds(30));
        let resolved = f.repo.save(mine).await.unwrap();

        assert_eq!(resolved.patient_name, "Jane Remote");
        assert_eq!(resolved.version, 3);
        assert!(resolved.is_synced);
        assert_eq!(f.remote.get_raw("prescriptions", rx.id).unwrap()["version"], 3);

        let log = f.db.conflicts(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].strategy, "newer_wins:kept_remote");
        assert_eq!(log[0].resolved_version, 3);
    }

    #[tokio::test]
    async fn test_pull_reconciles_remote_changes() {
        let f = fixture().await;
        let kept = f
            .repo
            .save(Prescription::new("Jane Roe", "dr.smith", f.clock.now()))
            .await
            .unwrap();
        let gone = f
            .repo
            .save(Prescription::new("John Doe", "dr.smith", f.clock.now()))
            .await
            .unwrap();

        // Remote: `kept` advanced, `gone` deleted, one new record
        let updated = kept.with_sync_state(2, true);
        f.remote.insert_raw("prescriptions", kept.id, updated.to_json().unwrap());
        f.remote.delete("prescriptions", gone.id).await.unwrap();
        let fresh =
            Prescription::new("New Patient", "dr.jones", f.clock.now()).with_sync_state(1, true);
        f.remote.insert_raw("prescriptions", fresh.id, fresh.to_json().unwrap());

        let report = f.repo.pull_and_reconcile().await.unwrap();
        assert_eq!(report.pulled, 2);
        assert_eq!(report.removed, 1);

        assert_eq!(f.repo.load_locally(kept.id).await.unwrap().unwrap().version, 2);
        assert!(f.repo.load_locally(gone.id).await.unwrap().is_none());
        assert!(f.repo.load_locally(fresh.id).await.unwrap().unwrap().is_synced);
    }

    fn rename(rx: &Prescription, name: &str) -> Prescription {
        rx.copy_with(PrescriptionChanges {
            patient_name: Some(name.to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_marker_like_plaintext_survives_save_list_and_pull() {
        let f = fixture().await;
        let rx = f
            .repo
            .save(Prescription::new("ENC:v1:Smith", "dr.smith", f.clock.now()))
            .await
            .unwrap();
        assert!(rx.is_synced);

        let medications = OfflineRepository::<Medication>::new(
            f.repo.context().clone(),
            ConflictResolver::newer_wins(),
        );
        let expires = NaiveDate::from_ymd_opt(2027, 1, 1).unwrap();
        let med = medications
            .save(Medication::new(
                rx.id,
                "Amoxicillin",
                "500mg",
                "ENC: see label",
                expires,
                f.clock.now(),
            ))
            .await
            .unwrap();

        assert_eq!(f.repo.list().await.unwrap()[0].patient_name, "ENC:v1:Smith");
        assert_eq!(medications.list().await.unwrap()[0].instructions, "ENC: see label");
        let remote_med = f.remote.get_raw(Medication::COLLECTION, med.id).unwrap();
        assert_eq!(remote_med["instructions"], "ENC: see label");

        assert_eq!(f.repo.pull_and_reconcile().await.unwrap().conflicts, 0);
        assert_eq!(medications.pull_and_reconcile().await.unwrap().conflicts, 0);
    }

    #[tokio::test]
    async fn test_edit_of_remotely_deleted_record_is_recreated() {
        let f = fixture().await;
        let rx = f
            .repo
            .save(Prescription::new("Jane Roe", "dr.smith", f.clock.now()))
            .await
            .unwrap();

        // Another device deletes it while this one edits offline
        f.remote.delete("prescriptions", rx.id).await.unwrap();
        f.connectivity.set_status(ConnectivityStatus::Offline);
        f.clock.advance(Duration::seconds(5));
        let edited = f.repo.update(rx.id, |r| rename(r, "Jane Q. Roe")).await.unwrap();
        assert_eq!(edited.version, 2);

        f.connectivity.set_status(ConnectivityStatus::Online);
        let report = f.repo.replay_pending().await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(f.repo.pending_count().await.unwrap(), 0);

        let local = f.repo.load_locally(rx.id).await.unwrap().unwrap();
        assert_eq!(local.version, 1);
        assert!(local.is_synced);
        assert_eq!(local.patient_name, "Jane Q. Roe");
        assert_eq!(f.remote.get_raw("prescriptions", rx.id).unwrap()["version"], 1);
    }

    #[tokio::test]
    async fn test_pull_recreates_unsynced_record_deleted_remotely() {
        let f = fixture().await;
        let rx = f
            .repo
            .save(Prescription::new("Jane Roe", "dr.smith", f.clock.now()))
            .await
            .unwrap();
        f.remote.delete("prescriptions", rx.id).await.unwrap();

        // Unsynced local edit with nothing queued
        let edited = rename(&rx, "Jane Q. Roe").edited(f.clock.now());
        f.repo.save_locally(&edited).await.unwrap();

        let report = f.repo.pull_and_reconcile().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.removed, 0);

        let local = f.repo.load_locally(rx.id).await.unwrap().unwrap();
        assert_eq!(local.version, 1);
        assert!(local.is_synced);
        assert_eq!(f.remote.get_raw("prescriptions", rx.id).unwrap()["version"], 1);
    }

    #[tokio::test]
    async fn test_rejected_operation_does_not_stop_replay() {
        let clock = ManualClock::default();
        let mut remote = MockRemoteStore::new();
        remote
            .expect_put()
            .times(2)
            .returning(|_, _, doc, _| {
                if doc["createdBy"] == "bad" {
                    Err(SyncError::Remote {
                        status: 422,
                        message: "invalid".to_string(),
                    })
                } else {
                    Ok(())
                }
            });
        let ctx = context(Arc::new(remote), &clock).await;
        ctx.connectivity.set_status(ConnectivityStatus::Offline);
        let repo =
            OfflineRepository::<Prescription>::new(ctx.clone(), ConflictResolver::newer_wins());

        repo.save(Prescription::new("Jane Roe", "bad", clock.now())).await.unwrap();
        repo.save(Prescription::new("John Doe", "dr.smith", clock.now())).await.unwrap();

        ctx.connectivity.set_status(ConnectivityStatus::Online);
        let report = repo.replay_pending().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(repo.pending_count().await.unwrap(), 1);
    }
}
