//! Application context: constructs every service once and wires them
//! together.
//!
//! ```text
//!  AppContext
//!    ├── DurableStore ◄──────────────┬───────────────┐
//!    ├── NotificationCenter ◄──┬─────┤               │
//!    ├── SyncQueue ────────────┘     │               │
//!    ├── ReachabilityMonitor ──► drain on reconnect, periodic drain
//!    ├── CollaborationSession ──► Transport          │
//!    └── WorkflowStore ──────────────┴── generator ──┘
//! ```
//!
//! Nothing here is global; tests build a fresh context per case.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;

use flowdoc_core::NotificationCenter;
use flowdoc_sync::{
    CollaborationSession, DurableStore, KeyValueBackend, LoopbackTransport, MemoryBackend,
    ReachabilityMonitor, RecordingAuthority, RemoteAuthority, RocksBackend, RocksConfig,
    SimulatedAuthority, StoreError, SyncQueue, Transport, WebSocketTransport,
};

use crate::analysis::AnalysisGenerator;
use crate::config::{AppConfig, ConfigError};
use crate::store::{StoreServices, WorkflowStore};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// The pluggable edges of the application.
pub struct Services {
    pub backend: Arc<dyn KeyValueBackend>,
    pub transport: Arc<dyn Transport>,
    pub authority: Arc<dyn RemoteAuthority>,
    pub generator: Arc<dyn AnalysisGenerator>,
}

impl Services {
    /// RocksDB (or memory) storage, the WebSocket relay and a simulated
    /// sync backend.
    pub fn from_config(config: &AppConfig, generator: Arc<dyn AnalysisGenerator>) -> Result<Self, AppError> {
        let backend: Arc<dyn KeyValueBackend> = match &config.data_dir {
            Some(path) => Arc::new(RocksBackend::open(RocksConfig {
                path: path.clone(),
                ..RocksConfig::default()
            })?),
            None => Arc::new(MemoryBackend::new()),
        };
        Ok(Self {
            backend,
            transport: Arc::new(WebSocketTransport::new(config.server_url.clone())),
            authority: Arc::new(SimulatedAuthority::default()),
            generator,
        })
    }

    /// Everything in memory.
    pub fn in_memory(generator: Arc<dyn AnalysisGenerator>) -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            transport: Arc::new(LoopbackTransport::new()),
            authority: Arc::new(RecordingAuthority::new()),
            generator,
        }
    }
}

pub struct AppContext {
    config: AppConfig,
    durable: DurableStore,
    notifications: Arc<NotificationCenter>,
    reachability: ReachabilityMonitor,
    queue: Arc<SyncQueue>,
    store: Arc<WorkflowStore>,
    tasks: Vec<JoinHandle<()>>,
}

impl AppContext {
    /// Build the services, restore persisted state and start the
    /// background drains.
    pub async fn start(config: AppConfig, services: Services) -> Self {
        let durable = DurableStore::new(services.backend);
        let notifications = Arc::new(NotificationCenter::new());
        let reachability = ReachabilityMonitor::new(config.start_online);

        let queue = Arc::new(SyncQueue::new(
            durable.clone(),
            services.authority,
            Arc::clone(&notifications),
            config.queue.clone(),
        ));
        let restored = queue.restore().await;

        let report = durable.recovery_sweep().await;
        if !report.is_clean() {
            log::warn!(
                "recovery sweep: {} queued item(s) refer to workflows that are no longer stored",
                report.orphaned_queue_items.len()
            );
        }
        log::debug!("{} stored workflow(s) have nothing pending", report.unqueued_workflows.len());

        let session = CollaborationSession::new(services.transport, reachability.clone(), config.session.clone());
        let store = Arc::new(WorkflowStore::new(
            StoreServices {
                durable: durable.clone(),
                queue: Arc::clone(&queue),
                reachability: reachability.clone(),
                session,
                notifications: Arc::clone(&notifications),
                generator: services.generator,
            },
            config.store.clone(),
        ));
        let hydrated = store.hydrate().await;

        let tasks = vec![
            reachability.spawn_drain_on_reconnect(Arc::clone(&queue), config.reachability.settle),
            queue.spawn_periodic(reachability.clone()),
        ];

        log::info!(
            "flowdoc ready: {hydrated} workflow(s), {restored} pending sync item(s), {}",
            if reachability.is_online() { "online" } else { "offline" }
        );

        Self {
            config,
            durable,
            notifications,
            reachability,
            queue,
            store,
            tasks,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<WorkflowStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    pub fn reachability(&self) -> &ReachabilityMonitor {
        &self.reachability
    }

    pub fn durable(&self) -> &DurableStore {
        &self.durable
    }

    pub fn notifications(&self) -> &Arc<NotificationCenter> {
        &self.notifications
    }

    /// Leave any collaboration session and stop background work. Pending
    /// queue items stay persisted for the next start.
    pub async fn shutdown(mut self) {
        self.store.stop_collaboration().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        log::info!("flowdoc stopped with {} pending sync item(s)", self.queue.len());
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
