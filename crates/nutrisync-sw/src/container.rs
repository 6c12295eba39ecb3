//! The host side: registers gateway versions, drives their lifecycle and
//! dispatches fetch and sync signals to the active one.

use futures::FutureExt;
use nutrisync_net::{Network, Request, Response};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::GatewayConfig;
use crate::event::{settle_all, ActivateEvent, ExtendableEvent, FetchEvent, InstallEvent, SyncEvent};
use crate::gateway::{Gateway, Intercept};
use crate::lifecycle::{Client, Clients, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState};
use crate::storage::CacheStore;
use crate::ServiceWorkerError;

/// Notifications from the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A worker failed to install; the previous active worker keeps serving.
    InstallFailed {
        worker_id: ServiceWorkerId,
        error: String,
    },
    /// A client is now controlled by another worker.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

/// Service worker host.
pub struct ServiceWorkerContainer {
    network: Arc<dyn Network>,
    store: Arc<dyn CacheStore>,
    registration: RwLock<ServiceWorkerRegistration>,
    clients: RwLock<Clients>,
    pending: Mutex<Vec<JoinHandle<Result<(), ServiceWorkerError>>>>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a container over a shared network and cache store.
    pub fn new(
        network: Arc<dyn Network>,
        store: Arc<dyn CacheStore>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                network,
                store,
                registration: RwLock::new(ServiceWorkerRegistration::new()),
                clients: RwLock::new(Clients::new()),
                pending: Mutex::new(Vec::new()),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker: &ServiceWorker) {
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: worker.id,
            new_state: worker.state,
        });
    }

    // ==================== Lifecycle ====================

    /// Install a new gateway version and, when it asks to skip waiting,
    /// activate it right away.
    ///
    /// A failed install leaves the current active worker in place.
    pub async fn register(&self, config: GatewayConfig) -> Result<ServiceWorkerId, ServiceWorkerError> {
        config.validate()?;
        let gateway = Arc::new(Gateway::new(
            config,
            Arc::clone(&self.network),
            Arc::clone(&self.store),
        ));
        let worker = ServiceWorker::new(Arc::clone(&gateway));
        let id = worker.id;

        {
            let mut registration = self.registration.write().await;
            if let Some(replaced) = registration.begin_install(worker) {
                self.emit_state(&replaced);
            }
            if let Some(installing) = registration.installing.as_ref() {
                self.emit_state(installing);
            }
        }

        let mut event = InstallEvent::new();
        gateway.on_install(&mut event);
        let (event, skip_waiting) = event.into_parts();
        let installed = event.settle().await;

        {
            let mut registration = self.registration.write().await;
            if registration.installing.as_ref().map(|w| w.id) != Some(id) {
                return Err(ServiceWorkerError::StateError(format!(
                    "worker {} superseded during install",
                    id.raw()
                )));
            }

            if let Err(e) = installed {
                error!(worker = id.raw(), error = %e, "Install failed");
                if let Some(failed) = registration.install_failed() {
                    self.emit_state(&failed);
                }
                self.emit(ServiceWorkerEvent::InstallFailed {
                    worker_id: id,
                    error: e.to_string(),
                });
                return Err(e);
            }

            if let Some(replaced) = registration.install_complete() {
                self.emit_state(&replaced);
            }
            if let Some(waiting) = registration.waiting.as_ref() {
                self.emit_state(waiting);
            }
        }

        info!(worker = id.raw(), version = %gateway.config().version, "Installed");

        if skip_waiting {
            self.activate_waiting().await?;
        }
        Ok(id)
    }

    /// Activate the waiting worker.
    ///
    /// Stale generations are swept first; clients are claimed only if the
    /// sweep succeeded. A failed sweep does not stop activation.
    pub async fn activate_waiting(&self) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let (id, gateway) = {
            let mut registration = self.registration.write().await;
            let gateway = registration
                .begin_activate()
                .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".into()))?;
            let waiting = registration
                .waiting
                .as_ref()
                .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".into()))?;
            self.emit_state(waiting);
            (waiting.id, gateway)
        };

        let mut event = ActivateEvent::new();
        gateway.on_activate(&mut event);
        let (event, claim) = event.into_parts();
        let swept = event.settle().await;
        if let Err(ref e) = swept {
            warn!(worker = id.raw(), error = %e, "Activation sweep failed");
        }

        {
            let mut registration = self.registration.write().await;
            if registration.waiting.as_ref().map(|w| w.id) != Some(id) {
                return Err(ServiceWorkerError::StateError(format!(
                    "worker {} superseded during activation",
                    id.raw()
                )));
            }
            if let Some(old) = registration.activate() {
                self.emit_state(&old);
            }
            if let Some(active) = registration.get_active() {
                self.emit_state(active);
            }
        }

        info!(worker = id.raw(), version = %gateway.config().version, "Activated");

        if claim && swept.is_ok() {
            let changed = self.clients.write().await.claim(id);
            for client_id in changed {
                self.emit(ServiceWorkerEvent::ControllerChange {
                    client_id,
                    worker_id: id,
                });
            }
        }
        Ok(id)
    }

    /// Id of the active worker.
    pub async fn active(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.get_active().map(|w| w.id)
    }

    /// Version token of the active worker.
    pub async fn active_version(&self) -> Option<String> {
        self.registration
            .read()
            .await
            .get_active()
            .map(|w| w.version().to_string())
    }

    async fn active_gateway(&self) -> Option<Arc<Gateway>> {
        self.registration
            .read()
            .await
            .get_active()
            .map(|w| Arc::clone(w.gateway()))
    }

    // ==================== Clients ====================

    /// Track a newly opened view. It is controlled by the active worker, if
    /// there is one.
    pub async fn open_client(&self, url: Url) -> Client {
        let controller = self.active().await;
        self.clients.write().await.open(url, controller)
    }

    pub async fn clients(&self) -> Vec<Client> {
        self.clients.read().await.all().into_iter().cloned().collect()
    }

    // ==================== Dispatch ====================

    /// Perform a request the way the page would see it: through the active
    /// gateway, or straight to the network when nothing intercepts it.
    pub async fn dispatch_fetch(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        let Some(gateway) = self.active_gateway().await else {
            return self.fetch_network(request).await;
        };

        let mut event = FetchEvent::new(request);
        let intercept = gateway.on_fetch(&mut event).await;
        let (event, request) = event.into_parts();
        self.track(event).await;

        match intercept {
            Intercept::Respond(result) => result,
            Intercept::Passthrough => self.fetch_network(request).await,
        }
    }

    async fn fetch_network(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        debug!(url = %request.url, "Not intercepted, fetching from network");
        self.network
            .fetch(request)
            .await
            .map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))
    }

    /// Deliver a background reconciliation signal to the active worker.
    pub async fn dispatch_sync(&self, tag: &str) -> Result<(), ServiceWorkerError> {
        let gateway = self
            .active_gateway()
            .await
            .ok_or_else(|| ServiceWorkerError::StateError("no active worker".into()))?;

        let mut event = SyncEvent::new(tag);
        gateway.on_sync(&mut event);
        event.into_base().settle().await
    }

    /// Keep a fetch event's extensions alive. Finished ones are reaped and
    /// their failures logged.
    async fn track(&self, event: ExtendableEvent) {
        let mut pending = self.pending.lock().await;
        pending.extend(event.into_extensions());

        let mut still_running = Vec::with_capacity(pending.len());
        for handle in pending.drain(..) {
            if !handle.is_finished() {
                still_running.push(handle);
                continue;
            }
            match handle.now_or_never() {
                Some(Ok(Err(e))) => warn!(error = %e, "Background cache write failed"),
                Some(Err(e)) => warn!(error = %e, "Background cache write panicked"),
                _ => {}
            }
        }
        *pending = still_running;
    }

    /// Wait for every tracked extension. Returns how many were awaited.
    pub async fn settle(&self) -> usize {
        let handles = std::mem::take(&mut *self.pending.lock().await);
        let count = handles.len();
        // Failures are logged inside; nobody is left to report them to.
        let _ = settle_all("fetch", handles).await;
        count
    }
}
