//! The engine facade and the async status workers.
//!
//! The engine is cheap to clone (per-field `Arc`) and is the only
//! public entry point: it validates input, resolves namespace/entity
//! containers, and exposes the synchronous orchestration API plus the
//! asynchronous status endpoint pair (`submit_status` /
//! `entity_status`) backed by one background worker per entity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use stagehand_store::{Store, StoreExt};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::{ControllerBinding, ControllerRegistry, MonitoringBinding};
use crate::entity::Entity;
use crate::error::{EngineError, EngineResult};
use crate::namespace::{Namespace, NamespaceRecord};
use crate::types::{ClientState, EntityTargetVersion, RolloutInfo, RolloutOptions};

/// Cadence of the per-entity background status workers.
pub const STATUS_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Latest submission for an entity, shared with its worker.
type LatestReports = Arc<StdMutex<Option<Vec<ClientState>>>>;

/// Per-entity status worker bookkeeping.
struct WorkerSlot {
    /// Handle to the background tick task.
    handle: JoinHandle<()>,
    /// Shutdown signal for this worker.
    shutdown_tx: watch::Sender<bool>,
    latest: LatestReports,
}

/// The rollout orchestration engine.
///
/// Holds authoritative rollout state in the store; it decides which
/// target should run which version but never performs upgrades itself.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    registry: Arc<ControllerRegistry>,
    namespaces: Arc<RwLock<HashMap<String, Arc<Namespace>>>>,
    /// Active status workers: "{namespace}/{entity}" → slot.
    workers: Arc<RwLock<HashMap<String, WorkerSlot>>>,
}

impl Engine {
    /// Create an engine over the given store. In-memory caches
    /// rehydrate lazily from store contents, so pointing a fresh
    /// engine at an existing store resumes any in-flight rollout.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            registry: Arc::new(ControllerRegistry::new()),
            namespaces: Arc::new(RwLock::new(HashMap::new())),
            workers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registry for custom controllers, consulted when resolving
    /// `registered` bindings. Register before the first tick that
    /// needs them.
    pub fn registry(&self) -> &ControllerRegistry {
        &self.registry
    }

    async fn namespace(&self, name: &str) -> EngineResult<Arc<Namespace>> {
        if name.is_empty() {
            return Err(EngineError::InvalidInput("namespace name is empty".into()));
        }

        if let Some(namespace) = self.namespaces.read().await.get(name) {
            return Ok(namespace.clone());
        }

        let mut namespaces = self.namespaces.write().await;
        if let Some(namespace) = namespaces.get(name) {
            return Ok(namespace.clone());
        }

        let record_key = format!("namespace/{name}");
        if self
            .store
            .load_optional::<NamespaceRecord>(&record_key)?
            .is_none()
        {
            self.store.save(
                &record_key,
                &NamespaceRecord {
                    name: name.to_string(),
                },
            )?;
            debug!(namespace = %name, "namespace created");
        }

        let namespace = Arc::new(Namespace::new(name, self.store.clone()));
        namespaces.insert(name.to_string(), namespace.clone());
        Ok(namespace)
    }

    async fn entity(&self, namespace: &str, entity: &str) -> EngineResult<Arc<Entity>> {
        self.namespace(namespace)
            .await?
            .find_or_create_entity(entity)
            .await
    }

    // ── Synchronous API ────────────────────────────────────────────

    /// Validate and persist rollout options for an entity, creating
    /// namespace and entity on demand.
    pub async fn set_rollout_options(
        &self,
        namespace: &str,
        entity: &str,
        options: &RolloutOptions,
    ) -> EngineResult<()> {
        self.entity(namespace, entity)
            .await?
            .set_rollout_options(options)
            .await
    }

    /// Set the desired version for an entity. Targeting the last known
    /// bad version requires `force`, which also abandons any in-flight
    /// rolling version.
    pub async fn set_target_version(
        &self,
        namespace: &str,
        entity: &str,
        version: EntityTargetVersion,
    ) -> EngineResult<()> {
        self.entity(namespace, entity)
            .await?
            .set_target_version(&version.version, version.force)
            .await
    }

    /// Run one orchestration tick for an entity and return the
    /// expected per-target state.
    pub async fn orchestrate(
        &self,
        namespace: &str,
        entity: &str,
        reports: &[ClientState],
    ) -> EngineResult<Vec<ClientState>> {
        let entity = self.entity(namespace, entity).await?;
        entity.orchestrate(&self.registry, reports, Utc::now()).await
    }

    /// Current rollout bookkeeping for an entity.
    pub async fn get_rollout_info(
        &self,
        namespace: &str,
        entity: &str,
    ) -> EngineResult<RolloutInfo> {
        self.entity(namespace, entity).await?.rollout_info()
    }

    /// Bind a target controller (selection, approval, monitoring,
    /// removal hooks) to an entity.
    pub async fn set_entity_target_controller(
        &self,
        namespace: &str,
        entity: &str,
        binding: ControllerBinding,
    ) -> EngineResult<()> {
        self.entity(namespace, entity)
            .await?
            .set_target_controller(binding)
            .await
    }

    /// Bind an external monitoring controller to an entity.
    pub async fn set_entity_monitoring_controller(
        &self,
        namespace: &str,
        entity: &str,
        binding: MonitoringBinding,
    ) -> EngineResult<()> {
        self.entity(namespace, entity)
            .await?
            .set_monitoring_controller(binding)
            .await
    }

    // ── Asynchronous status API ────────────────────────────────────

    /// Submit reports without waiting for a tick. A background worker
    /// per entity re-orchestrates the most recent submission at a
    /// fixed cadence; fetch the outcome with
    /// [`Engine::entity_status`].
    pub async fn submit_status(
        &self,
        namespace: &str,
        entity: &str,
        reports: Vec<ClientState>,
    ) -> EngineResult<()> {
        // Materialize the containers up front so the worker's ticks
        // cannot fail on lookup.
        self.entity(namespace, entity).await?;
        let key = format!("{namespace}/{entity}");

        {
            let workers = self.workers.read().await;
            if let Some(slot) = workers.get(&key) {
                *slot.latest.lock().expect("status submission poisoned") = Some(reports);
                return Ok(());
            }
        }

        let mut workers = self.workers.write().await;
        if let Some(slot) = workers.get(&key) {
            *slot.latest.lock().expect("status submission poisoned") = Some(reports);
            return Ok(());
        }

        let latest: LatestReports = Arc::new(StdMutex::new(Some(reports)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_status_loop(
            self.clone(),
            namespace.to_string(),
            entity.to_string(),
            latest.clone(),
            shutdown_rx,
        ));
        workers.insert(
            key.clone(),
            WorkerSlot {
                handle,
                shutdown_tx,
                latest,
            },
        );
        info!(entity = %key, "status worker started");
        Ok(())
    }

    /// Expected state for every target of an entity, optionally
    /// filtered by group.
    pub async fn entity_status(
        &self,
        namespace: &str,
        entity: &str,
        group: Option<&str>,
    ) -> EngineResult<Vec<ClientState>> {
        self.entity(namespace, entity).await?.client_states(group)
    }

    /// Stop all status workers. Idempotent; safe to call more than
    /// once.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.write().await;
        for (key, slot) in workers.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(entity = %key, "status worker stopped");
        }
        info!("engine shut down");
    }
}

/// Background tick loop for one entity: orchestrate the latest
/// submission once per interval until told to shut down.
async fn run_status_loop(
    engine: Engine,
    namespace: String,
    entity: String,
    latest: LatestReports,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%namespace, %entity, "status loop starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(STATUS_TICK_INTERVAL) => {
                let reports = latest
                    .lock()
                    .expect("status submission poisoned")
                    .clone();
                if let Some(reports) = reports {
                    if let Err(e) = engine.orchestrate(&namespace, &entity, &reports).await {
                        warn!(%namespace, %entity, error = %e, "status tick failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!(%namespace, %entity, "status loop shutting down");
                break;
            }
        }
    }
}
