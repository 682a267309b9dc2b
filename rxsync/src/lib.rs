//! Offline-first prescription synchronization engine
//!
//! Provides:
//! - Local SQLite store for documents, the pending queue and the conflict log
//! - Field-level AES-GCM encryption of patient data
//! - Connectivity monitoring with broadcast of online/offline changes
//! - Two-tier TTL/LRU cache
//! - Offline repositories that write locally first and replay queued writes
//! - Version-based conflict detection with newer-wins or manual resolution
//! - A sync service with periodic, reconnect and manual triggers

pub mod cache;
pub mod clock;
pub mod config;
pub mod conflict_resolution;
pub mod connectivity;
pub mod error;
pub mod field_encryption;
pub mod local_db;
pub mod models;
pub mod remote;
pub mod reporting;
pub mod repository;
pub mod sync_service;

pub use cache::{CacheConfig, CacheService, CacheStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConnectivityConfig, RemoteKind, RemoteSettings, RxSyncConfig};
pub use conflict_resolution::{
    Conflict, ConflictDetector, ConflictDiff, ConflictResolver, ConflictStrategy, ManualResolver,
    Resolution, ResolutionOutcome, SyncDecision,
};
pub use connectivity::{
    ConnectivityChange, ConnectivityMonitor, ConnectivityProbe, ConnectivityStatus, HttpProbe,
};
pub use error::{SyncError, SyncResult};
pub use field_encryption::{
    FieldEncryption, FieldEncryptionConfig, FileKeyStore, KeyStore, MemoryKeyStore,
};
pub use local_db::{
    ConflictLogEntry, LocalDatabase, LocalDbConfig, OperationType, PendingOperation,
};
pub use models::{Medication, MedicationChanges, Prescription, PrescriptionChanges, Syncable};
pub use remote::{HttpRemote, HttpRemoteConfig, InMemoryRemote, RemoteStore};
pub use reporting::{ErrorReporter, ReportContext, TracingReporter};
pub use repository::{OfflineRepository, PullReport, ReplayReport, RepositoryContext, SyncTarget};
pub use sync_service::{SyncService, SyncServiceConfig, SyncStatus, SyncSummary};

use std::sync::Arc;
use uuid::Uuid;

/// Wired-up engine: repositories for every record type plus the sync service
pub struct SyncEngine {
    ctx: RepositoryContext,
    prescriptions: Arc<OfflineRepository<Prescription>>,
    medications: Arc<OfflineRepository<Medication>>,
    sync: SyncService,
    probe: Option<(Arc<dyn ConnectivityProbe>, std::time::Duration)>,
}

impl SyncEngine {
    pub fn builder(config: RxSyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    pub fn prescriptions(&self) -> &OfflineRepository<Prescription> {
        &self.prescriptions
    }

    pub fn medications(&self) -> &OfflineRepository<Medication> {
        &self.medications
    }

    /// Medications belonging to one prescription
    pub async fn medications_for(&self, prescription_id: Uuid) -> SyncResult<Vec<Medication>> {
        Ok(self
            .medications
            .list()
            .await?
            .into_iter()
            .filter(|m| m.prescription_id == prescription_id)
            .collect())
    }

    pub fn sync(&self) -> &SyncService {
        &self.sync
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.ctx.connectivity
    }

    pub fn cache(&self) -> &CacheService {
        &self.ctx.cache
    }

    pub fn local_db(&self) -> &LocalDatabase {
        &self.ctx.db
    }

    /// Most recent conflicts first
    pub async fn conflicts(&self, limit: i64) -> SyncResult<Vec<ConflictLogEntry>> {
        self.ctx.db.conflicts(limit).await
    }

    /// Start connectivity probing (if configured) and background sync
    pub fn start(&self) {
        if let Some((probe, interval)) = &self.probe {
            self.ctx.connectivity.spawn_probe(Arc::clone(probe), *interval);
        }
        self.sync.start();
    }

    pub fn shutdown(&self) {
        self.sync.shutdown();
        self.ctx.connectivity.shutdown();
    }
}

/// Builder for [`SyncEngine`]; anything not supplied comes from the config
pub struct SyncEngineBuilder {
    config: RxSyncConfig,
    remote: Option<Arc<dyn RemoteStore>>,
    key_store: Option<Arc<dyn KeyStore>>,
    clock: Option<Arc<dyn Clock>>,
    connectivity: Option<ConnectivityMonitor>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    prescription_resolver: Option<Arc<dyn ManualResolver<Prescription>>>,
    medication_resolver: Option<Arc<dyn ManualResolver<Medication>>>,
}

impl SyncEngineBuilder {
    pub fn new(config: RxSyncConfig) -> Self {
        Self {
            config,
            remote: None,
            key_store: None,
            clock: None,
            connectivity: None,
            probe: None,
            reporter: None,
            prescription_resolver: None,
            medication_resolver: None,
        }
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn key_store(mut self, key_store: Arc<dyn KeyStore>) -> Self {
        self.key_store = Some(key_store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn prescription_resolver(
        mut self,
        resolver: Arc<dyn ManualResolver<Prescription>>,
    ) -> Self {
        self.prescription_resolver = Some(resolver);
        self
    }

    pub fn medication_resolver(mut self, resolver: Arc<dyn ManualResolver<Medication>>) -> Self {
        self.medication_resolver = Some(resolver);
        self
    }

    fn resolver<T: Syncable>(
        strategy: ConflictStrategy,
        manual: Option<Arc<dyn ManualResolver<T>>>,
    ) -> SyncResult<ConflictResolver<T>> {
        match (strategy, manual) {
            (_, Some(resolver)) => Ok(ConflictResolver::manual(resolver)),
            (ConflictStrategy::NewerWins, None) => Ok(ConflictResolver::newer_wins()),
            (ConflictStrategy::Manual, None) => Err(SyncError::InvalidOperation(format!(
                "manual conflict strategy needs a resolver for {}",
                T::COLLECTION
            ))),
        }
    }

    pub async fn build(self) -> SyncResult<SyncEngine> {
        let config = self.config;

        let db = LocalDatabase::new(config.storage.clone()).await?;

        let key_store: Arc<dyn KeyStore> = match self.key_store {
            Some(store) => store,
            None => Arc::new(FileKeyStore::new(&config.encryption.key_dir)),
        };
        let encryption = Arc::new(FieldEncryption::from_key_store(
            config.encryption.clone(),
            key_store.as_ref(),
        )?);

        let remote: Arc<dyn RemoteStore> = match (self.remote, config.remote.kind) {
            (Some(remote), _) => remote,
            (None, RemoteKind::Http) => Arc::new(HttpRemote::new(&config.remote.http)?),
            (None, RemoteKind::Memory) => Arc::new(InMemoryRemote::new()),
        };

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache = Arc::new(
            CacheService::new(config.cache.clone())
                .with_disk(db.clone())
                .with_clock(Arc::clone(&clock)),
        );
        let connectivity = self.connectivity.unwrap_or_default();

        let probe_url = &config.connectivity.probe_url;
        let probe: Option<Arc<dyn ConnectivityProbe>> = match (self.probe, probe_url) {
            (Some(probe), _) => Some(probe),
            (None, Some(url)) => Some(Arc::new(HttpProbe::new(
                url.clone(),
                config.connectivity.probe_timeout(),
            )?)),
            (None, None) => None,
        };

        let ctx = RepositoryContext {
            db,
            remote,
            connectivity: connectivity.clone(),
            encryption,
            cache,
            clock,
        };

        let strategy = config.remote.conflict_strategy;
        let prescriptions = Arc::new(OfflineRepository::new(
            ctx.clone(),
            Self::resolver(strategy, self.prescription_resolver)?,
        ));
        let medications = Arc::new(OfflineRepository::new(
            ctx.clone(),
            Self::resolver(strategy, self.medication_resolver)?,
        ));

        // Prescriptions replay before the medications that reference them
        let targets: Vec<Arc<dyn SyncTarget>> = vec![prescriptions.clone(), medications.clone()];
        let mut sync = SyncService::new(targets, connectivity, config.sync.clone());
        if let Some(reporter) = self.reporter {
            sync = sync.with_reporter(reporter);
        }

        tracing::info!(
            db_path = %config.storage.db_path,
            remote = ?config.remote.kind,
            encryption = ctx.encryption.is_enabled(),
            "Sync engine ready"
        );

        Ok(SyncEngine {
            ctx,
            prescriptions,
            medications,
            sync,
            probe: probe.map(|p| (p, config.connectivity.probe_interval())),
        })
    }
}
