//! Application state.

use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

use dubflow_config::RuntimeProfiles;
use dubflow_core::paths::PathManager;
use dubflow_db::{SqliteTaskStore, TaskStore};
use dubflow_scheduler::{BatchRunner, GlobalRunLock, ProgressBus, StageRunner, SubscriberRegistry};
use dubflow_worker::SubprocessWorker;

/// Shared application state. Everything process-wide that looks like a
/// singleton (run lock, batch runner, subscriber registry) lives here; the
/// durable truth is the task store.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub paths: PathManager,
    pub registry: Arc<SubscriberRegistry>,
    pub lock: Arc<GlobalRunLock>,
    pub bus: Arc<ProgressBus>,
    pub runner: Arc<StageRunner>,
    pub batch: Arc<BatchRunner>,
}

impl AppState {
    pub fn new(pool: SqlitePool, storage_root: PathBuf, profiles: RuntimeProfiles) -> Self {
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(pool));
        let paths = PathManager::new(storage_root);
        let registry = Arc::new(SubscriberRegistry::new());
        let lock = Arc::new(GlobalRunLock::new());
        let bus = Arc::new(ProgressBus::new(store.clone(), registry.clone(), lock.clone()));
        let worker = Arc::new(SubprocessWorker::new(profiles.clone()));
        let runner = Arc::new(StageRunner::new(
            store.clone(),
            bus.clone(),
            lock.clone(),
            worker,
            paths.clone(),
            profiles,
        ));
        let batch = Arc::new(BatchRunner::new(runner.clone(), registry.clone()));

        Self {
            store,
            paths,
            registry,
            lock,
            bus,
            runner,
            batch,
        }
    }
}
