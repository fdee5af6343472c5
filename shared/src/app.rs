//! Wires the core together from a config, a store and an HTTP transport.

use crate::capabilities::{
    connectivity_channel, ConnectivitySender, HttpClient, KeyValueStore, NetworkStatus,
};
use crate::config::CoreConfig;
use crate::observer::NetworkObserver;
use crate::queue::ReportQueue;
use crate::resync::{ResyncMetrics, ResyncOrchestrator};
use crate::service::ReportService;
use crate::session::{Credentials, SessionStore};
use crate::submission::ReportSubmissionClient;
use crate::AppError;
use std::sync::Arc;
use tracing::info;

pub struct App<S, H> {
    config: CoreConfig,
    status: NetworkStatus,
    queue: Arc<ReportQueue<S>>,
    sessions: SessionStore<S>,
    orchestrator: Arc<ResyncOrchestrator<S, H>>,
    service: ReportService<S, H>,
}

impl<S: KeyValueStore, H: HttpClient> App<S, H> {
    pub fn new(config: CoreConfig, store: Arc<S>, http: Arc<H>) -> Result<Self, AppError> {
        config.validate()?;

        let base_url = config.base_url()?;
        let credentials = Credentials::new();
        let status = NetworkStatus::default();

        let queue = Arc::new(ReportQueue::new(
            store.clone(),
            &config.queue_key,
            config.max_queued_reports,
        )?);
        let sessions = SessionStore::new(store, credentials.clone());
        let client = Arc::new(ReportSubmissionClient::new(
            http,
            &base_url,
            config.request_timeout_ms,
            credentials.clone(),
        )?);
        let orchestrator = Arc::new(ResyncOrchestrator::new(
            queue.clone(),
            client.clone(),
            config.resync_options(),
        ));
        let service = ReportService::new(
            queue.clone(),
            client,
            orchestrator.clone(),
            status.clone(),
            credentials,
        );

        info!(api = %base_url.host(), "core initialized");

        Ok(Self {
            config,
            status,
            queue,
            sessions,
            orchestrator,
            service,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn service(&self) -> &ReportService<S, H> {
        &self.service
    }

    pub fn sessions(&self) -> &SessionStore<S> {
        &self.sessions
    }

    pub fn queue(&self) -> &Arc<ReportQueue<S>> {
        &self.queue
    }

    pub fn orchestrator(&self) -> &Arc<ResyncOrchestrator<S, H>> {
        &self.orchestrator
    }

    pub fn network_status(&self) -> &NetworkStatus {
        &self.status
    }

    pub fn metrics(&self) -> Arc<ResyncMetrics> {
        self.orchestrator.metrics()
    }
}

impl<S, H> App<S, H>
where
    S: KeyValueStore + 'static,
    H: HttpClient + 'static,
{
    /// Starts the observer. The shell forwards its connectivity callbacks to the sender.
    pub fn start_observer(&self) -> (ConnectivitySender, NetworkObserver) {
        let (sender, events) = connectivity_channel(self.config.connectivity_buffer);
        let observer =
            NetworkObserver::spawn(self.orchestrator.clone(), self.status.clone(), events);
        (sender, observer)
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub type NativeApp = App<crate::capabilities::SqliteKvStore, crate::capabilities::ReqwestHttpClient>;

#[cfg(not(target_arch = "wasm32"))]
impl NativeApp {
    /// SQLite at `db_path` plus the reqwest transport.
    pub fn open(
        config: CoreConfig,
        db_path: impl AsRef<std::path::Path>,
    ) -> Result<Self, AppError> {
        let store = crate::capabilities::SqliteKvStore::open(db_path)?;
        Self::new(
            config,
            Arc::new(store),
            Arc::new(crate::capabilities::ReqwestHttpClient::new()),
        )
    }
}
