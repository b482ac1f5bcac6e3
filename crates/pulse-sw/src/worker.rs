//! The offline worker: one cache generation moving through its lifecycle.
//!
//! ```text
//! Parsed → Installing → Installed → Activating → Activated
//!              │                        │
//!              └──→ Redundant           └──→ Installed (GC failed)
//! ```
//!
//! Fetches that reach a worker while it is `Activating` are held until
//! activation settles.

use std::sync::Arc;

use pulse_core::WorkerConfig;
use pulse_net::Fetcher;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::cache::CacheStorage;
use crate::gc::collect_stale_stores;
use crate::intercept::{FetchEvent, FetchResponse, Interceptor};
use crate::precache::precache;
use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState, WorkerEvent};

/// A worker bound to one [`WorkerConfig`] (and so one cache store).
pub struct OfflineWorker {
    id: ServiceWorkerId,
    config: Arc<WorkerConfig>,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    state: watch::Sender<ServiceWorkerState>,
    interceptor: Interceptor,
    event_tx: mpsc::Sender<WorkerEvent>,
}

impl std::fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("id", &self.id)
            .field("cache", &self.config.cache_name())
            .finish()
    }
}

impl OfflineWorker {
    /// Create a worker in the `Parsed` state. The configuration is validated
    /// up front.
    pub fn new(
        config: WorkerConfig,
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
        event_tx: mpsc::Sender<WorkerEvent>,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        if !config.fallback_precached() {
            warn!(
                fallback = %config.offline_fallback,
                "Offline document is not in the asset manifest"
            );
        }
        let config = Arc::new(config);
        let interceptor = Interceptor::new(Arc::clone(&config), storage.clone(), Arc::clone(&fetcher))
            .with_events(event_tx.clone());

        let worker = Self {
            id: ServiceWorkerId::new(),
            config,
            storage,
            fetcher,
            state: watch::Sender::new(ServiceWorkerState::Parsed),
            interceptor,
            event_tx,
        };
        debug!(id = worker.id.raw(), cache = %worker.cache_name(), "Worker created");
        Ok(worker)
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn cache_name(&self) -> String {
        self.config.cache_name()
    }

    pub async fn state(&self) -> ServiceWorkerState {
        *self.state.borrow()
    }

    /// Current state, waiting out an activation in progress.
    pub async fn settled_state(&self) -> ServiceWorkerState {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|s| *s != ServiceWorkerState::Activating)
            .await
            .map(|s| *s);
        // The sender lives in `self`, so the channel cannot close here.
        settled.unwrap_or(ServiceWorkerState::Redundant)
    }

    /// Precache the manifest. On failure the worker becomes redundant and
    /// nothing of this generation is left behind.
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        self.transition(&[ServiceWorkerState::Parsed], ServiceWorkerState::Installing)
            .await?;

        match precache(&self.config, &self.storage, self.fetcher.as_ref()).await {
            Ok(assets) => {
                self.emit(WorkerEvent::Precached {
                    cache_name: self.cache_name(),
                    assets,
                });
                self.set_state(ServiceWorkerState::Installed).await;
                Ok(())
            }
            Err(e) => {
                warn!(id = self.id.raw(), error = %e, "Install failed");
                self.set_state(ServiceWorkerState::Redundant).await;
                Err(e)
            }
        }
    }

    /// Delete superseded stores and start controlling fetches. If collection
    /// fails the worker stays installed and activation may be retried.
    pub async fn activate(&self) -> Result<(), ServiceWorkerError> {
        self.begin_activation().await?;
        self.finish_activation().await
    }

    /// `Installed → Activating`. From here on fetches wait for
    /// [`finish_activation`](Self::finish_activation).
    pub(crate) async fn begin_activation(&self) -> Result<(), ServiceWorkerError> {
        self.transition(&[ServiceWorkerState::Installed], ServiceWorkerState::Activating)
            .await
    }

    pub(crate) async fn finish_activation(&self) -> Result<(), ServiceWorkerError> {
        match collect_stale_stores(&self.config, &self.storage).await {
            Ok(names) => {
                if !names.is_empty() {
                    self.emit(WorkerEvent::StoresDeleted { names });
                }
                self.set_state(ServiceWorkerState::Activated).await;
                Ok(())
            }
            Err(e) => {
                warn!(id = self.id.raw(), error = %e, "Activation failed");
                self.set_state(ServiceWorkerState::Installed).await;
                Err(e)
            }
        }
    }

    /// Intercept a fetch. Only an activated worker intercepts; otherwise, and
    /// for requests the worker leaves alone, `None` is returned.
    pub async fn handle_fetch(&self, event: &FetchEvent) -> Option<FetchResponse> {
        let state = self.settled_state().await;
        if state != ServiceWorkerState::Activated {
            trace!(id = self.id.raw(), ?state, url = %event.request.url, "Not controlling");
            return None;
        }
        self.interceptor.handle(event).await
    }

    /// Retire the worker. It stops intercepting immediately.
    pub async fn mark_redundant(&self) {
        self.set_state(ServiceWorkerState::Redundant).await;
    }

    async fn transition(
        &self,
        from: &[ServiceWorkerState],
        to: ServiceWorkerState,
    ) -> Result<(), ServiceWorkerError> {
        let mut current = to;
        let moved = self.state.send_if_modified(|state| {
            current = *state;
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if !moved {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot move from {:?} to {:?}",
                current, to
            )));
        }

        self.announce(to);
        Ok(())
    }

    async fn set_state(&self, to: ServiceWorkerState) {
        let changed = self.state.send_if_modified(|state| {
            let changed = *state != to;
            *state = to;
            changed
        });
        if changed {
            self.announce(to);
        }
    }

    fn announce(&self, new_state: ServiceWorkerState) {
        info!(id = self.id.raw(), cache = %self.cache_name(), state = ?new_state, "Worker state changed");
        self.emit(WorkerEvent::StateChange {
            worker_id: self.id,
            cache_name: self.cache_name(),
            new_state,
        });
    }

    fn emit(&self, event: WorkerEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            trace!(id = self.id.raw(), error = %e, "Worker event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::ResponseSource;
    use crate::test_support::{origin_url, test_config, ScriptedFetcher};
    use pulse_net::Request;

    fn worker_with(
        storage: CacheStorage,
        fetcher: Arc<ScriptedFetcher>,
    ) -> (OfflineWorker, mpsc::Receiver<WorkerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let worker = OfflineWorker::new(test_config(), storage, fetcher, tx).unwrap();
        (worker, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_install_then_activate() {
        let storage = CacheStorage::in_memory();
        storage.open("ip-v1").await.unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.serve_manifest(&test_config());
        let (worker, mut rx) = worker_with(storage.clone(), fetcher);

        assert_eq!(worker.state().await, ServiceWorkerState::Parsed);
        worker.install().await.unwrap();
        assert_eq!(worker.state().await, ServiceWorkerState::Installed);
        worker.activate().await.unwrap();
        assert_eq!(worker.state().await, ServiceWorkerState::Activated);

        assert_eq!(storage.keys().await.unwrap(), vec!["ip-v2".to_string()]);

        let states: Vec<ServiceWorkerState> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::StateChange { new_state, .. } => Some(new_state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_install_is_redundant() {
        let storage = CacheStorage::in_memory();
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.serve_manifest(&test_config());
        fetcher.fail(origin_url("/style.css"));
        let (worker, _rx) = worker_with(storage.clone(), fetcher);

        assert!(matches!(
            worker.install().await,
            Err(ServiceWorkerError::InstallFailed { .. })
        ));
        assert_eq!(worker.state().await, ServiceWorkerState::Redundant);
        assert!(!storage.has("ip-v2").await.unwrap());
        assert!(matches!(
            worker.activate().await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_activate_requires_install() {
        let (worker, _rx) = worker_with(CacheStorage::in_memory(), Arc::new(ScriptedFetcher::new()));
        assert!(matches!(
            worker.activate().await,
            Err(ServiceWorkerError::StateError(_))
        ));
        assert_eq!(worker.state().await, ServiceWorkerState::Parsed);
    }

    #[tokio::test]
    async fn test_install_twice_is_rejected() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.serve_manifest(&test_config());
        let (worker, _rx) = worker_with(CacheStorage::in_memory(), fetcher);

        worker.install().await.unwrap();
        assert!(matches!(
            worker.install().await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_only_activated_worker_intercepts() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.serve_manifest(&test_config());
        let (worker, _rx) = worker_with(CacheStorage::in_memory(), fetcher.clone());
        let event = FetchEvent::new(Request::get(origin_url("/index.html")));

        assert!(worker.handle_fetch(&event).await.is_none());
        worker.install().await.unwrap();
        assert!(worker.handle_fetch(&event).await.is_none());

        worker.activate().await.unwrap();
        let calls = fetcher.total_calls();
        let response = worker.handle_fetch(&event).await.unwrap();
        assert_eq!(response.source, ResponseSource::Cache);
        assert_eq!(fetcher.total_calls(), calls);

        worker.mark_redundant().await;
        assert!(worker.handle_fetch(&event).await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_waits_while_activating() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.serve_manifest(&test_config());
        let (worker, _rx) = worker_with(CacheStorage::in_memory(), fetcher);
        worker.install().await.unwrap();
        worker.begin_activation().await.unwrap();
        assert_eq!(worker.state().await, ServiceWorkerState::Activating);

        let event = FetchEvent::new(Request::get(origin_url("/index.html")));
        let (response, activated) = tokio::join!(worker.handle_fetch(&event), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            worker.finish_activation().await
        });
        activated.unwrap();
        assert_eq!(response.unwrap().source, ResponseSource::Cache);
    }

    #[tokio::test]
    async fn test_activation_reports_deleted_stores() {
        let storage = CacheStorage::in_memory();
        storage.open("ip-v1").await.unwrap();
        storage.open("ip-v0").await.unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.serve_manifest(&test_config());
        let (worker, mut rx) = worker_with(storage, fetcher);

        worker.install().await.unwrap();
        worker.activate().await.unwrap();

        let deleted = drain(&mut rx).into_iter().find_map(|e| match e {
            WorkerEvent::StoresDeleted { names } => Some(names),
            _ => None,
        });
        let mut deleted = deleted.unwrap();
        deleted.sort();
        assert_eq!(deleted, vec!["ip-v0".to_string(), "ip-v1".to_string()]);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (tx, _rx) = mpsc::channel(8);
        let config = WorkerConfig {
            cache_prefix: String::new(),
            ..test_config()
        };
        assert!(matches!(
            OfflineWorker::new(
                config,
                CacheStorage::in_memory(),
                Arc::new(ScriptedFetcher::new()),
                tx
            ),
            Err(ServiceWorkerError::Pulse(_))
        ));
    }
}
