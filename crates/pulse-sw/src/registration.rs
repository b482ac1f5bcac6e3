//! Registration: the installing / waiting / active worker slots for one scope.
//!
//! A newly installed worker activates at once when nothing is active.
//! Otherwise it waits until [`Registration::skip_waiting`] or
//! [`Registration::clients_released`].
//!
//! On takeover the new worker enters the active slot before it deletes the
//! superseded stores, so no fetch reaches a worker whose store is being
//! deleted. Fetches arriving meanwhile wait for activation to settle. If
//! activation fails the previous worker is put back.

use std::sync::Arc;

use async_trait::async_trait;
use pulse_core::WorkerConfig;
use pulse_net::{Fetcher, NetError, Request, Response};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::intercept::{FetchEvent, FetchResponse};
use crate::worker::OfflineWorker;
use crate::{ServiceWorkerError, WorkerEvent};

#[derive(Default)]
struct Slots {
    installing: Option<Arc<OfflineWorker>>,
    waiting: Option<Arc<OfflineWorker>>,
    active: Option<Arc<OfflineWorker>>,
}

/// Workers registered for a scope.
pub struct Registration {
    scope: Url,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    slots: RwLock<Slots>,
    /// Serializes lifecycle changes; fetches only read `slots`.
    update_lock: Mutex<()>,
    event_tx: mpsc::Sender<WorkerEvent>,
}

/// Capacity of the lifecycle event channel.
pub const EVENT_BUFFER: usize = 64;

impl Registration {
    /// Create an empty registration. Lifecycle events are delivered on the
    /// returned receiver, which holds at most [`EVENT_BUFFER`] undelivered
    /// events. Events that find it full are dropped; workers never wait on
    /// the receiver.
    pub fn new(
        scope: Url,
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::Receiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        (
            Self {
                scope,
                storage,
                fetcher,
                slots: RwLock::new(Slots::default()),
                update_lock: Mutex::new(()),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Whether a page at `page` is controlled by this registration.
    pub fn controls(&self, page: &Url) -> bool {
        page.origin() == self.scope.origin() && page.path().starts_with(self.scope.path())
    }

    /// Install a worker for `config`.
    ///
    /// A failed install leaves the current active worker (if any) untouched.
    pub async fn register(
        &self,
        config: WorkerConfig,
    ) -> Result<Arc<OfflineWorker>, ServiceWorkerError> {
        let _guard = self.update_lock.lock().await;

        let worker = Arc::new(OfflineWorker::new(
            config,
            self.storage.clone(),
            Arc::clone(&self.fetcher),
            self.event_tx.clone(),
        )?);
        info!(scope = %self.scope, cache = %worker.cache_name(), "Registering worker");

        self.slots.write().await.installing = Some(Arc::clone(&worker));
        let installed = worker.install().await;
        let mut slots = self.slots.write().await;
        slots.installing = None;
        installed?;

        if let Some(previous) = slots.waiting.replace(Arc::clone(&worker)) {
            previous.mark_redundant().await;
        }
        let has_active = slots.active.is_some();
        drop(slots);

        if has_active {
            debug!(cache = %worker.cache_name(), "Worker waiting for clients to release");
        } else {
            self.activate_waiting().await?;
        }
        Ok(worker)
    }

    /// Activate the waiting worker without waiting for clients to go away.
    /// Returns whether a worker was activated.
    pub async fn skip_waiting(&self) -> Result<bool, ServiceWorkerError> {
        let _guard = self.update_lock.lock().await;
        self.activate_waiting().await
    }

    /// Every page controlled by the active worker has closed; a waiting
    /// worker may take over.
    pub async fn clients_released(&self) -> Result<bool, ServiceWorkerError> {
        self.skip_waiting().await
    }

    pub async fn active(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.active.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.waiting.clone()
    }

    pub async fn installing(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.installing.clone()
    }

    /// Route a fetch through the active worker. `None` means the host should
    /// perform the request itself.
    pub async fn handle_fetch(&self, event: &FetchEvent) -> Option<FetchResponse> {
        if let Some(ref page) = event.request.referrer {
            if !self.controls(page) {
                return None;
            }
        }
        let active = self.active().await?;
        if let Some(response) = active.handle_fetch(event).await {
            return Some(response);
        }
        // A failed takeover hands the slot back to the previous worker.
        let current = self.active().await?;
        if current.id() == active.id() {
            return None;
        }
        current.handle_fetch(event).await
    }

    /// Retire every worker. Cache stores are left in place.
    pub async fn unregister(&self) -> bool {
        let _guard = self.update_lock.lock().await;
        let mut slots = self.slots.write().await;
        let workers: Vec<Arc<OfflineWorker>> = [
            slots.installing.take(),
            slots.waiting.take(),
            slots.active.take(),
        ]
        .into_iter()
        .flatten()
        .collect();
        drop(slots);

        for worker in &workers {
            worker.mark_redundant().await;
        }
        info!(scope = %self.scope, workers = workers.len(), "Unregistered");
        !workers.is_empty()
    }

    /// Caller must hold `update_lock`.
    async fn activate_waiting(&self) -> Result<bool, ServiceWorkerError> {
        let mut slots = self.slots.write().await;
        let Some(worker) = slots.waiting.take() else {
            return Ok(false);
        };
        if let Err(e) = worker.begin_activation().await {
            slots.waiting = Some(worker);
            return Err(e);
        }
        let previous = slots.active.replace(Arc::clone(&worker));
        drop(slots);

        if let Err(e) = worker.finish_activation().await {
            warn!(cache = %worker.cache_name(), error = %e, "Waiting worker failed to activate");
            let mut slots = self.slots.write().await;
            slots.active = previous;
            slots.waiting = Some(worker);
            return Err(e);
        }

        if let Some(previous) = previous {
            previous.mark_redundant().await;
        }
        Ok(true)
    }
}

/// [`Fetcher`] that routes requests the way a controlled page's fetches go:
/// through the active worker when it intercepts, straight to the network
/// otherwise.
pub struct ControlledFetcher {
    registration: Arc<Registration>,
}

impl ControlledFetcher {
    pub fn new(registration: Arc<Registration>) -> Self {
        Self { registration }
    }
}

#[async_trait]
impl Fetcher for ControlledFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let event = FetchEvent::new(request.clone());
        match self.registration.handle_fetch(&event).await {
            Some(response) => response.into_response(request),
            None => self.registration.fetcher.fetch(request).await,
        }
    }
}
