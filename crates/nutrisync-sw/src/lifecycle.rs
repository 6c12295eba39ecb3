//! Worker lifecycle: workers, the registration that holds them, and the
//! clients they control.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use url::Url;

use crate::gateway::Gateway;

// ==================== Worker ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and handling fetches.
    Activated,
    /// Replaced or failed to install.
    Redundant,
}

/// A service worker instance: one deployed version of the gateway.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,
    pub state: ServiceWorkerState,
    pub state_changed_at: Instant,
    gateway: Arc<Gateway>,
}

impl ServiceWorker {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
            gateway,
        }
    }

    pub fn set_state(&mut self, state: ServiceWorkerState) {
        debug!(worker = self.id.raw(), from = ?self.state, to = ?state, "Worker state change");
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Version token the worker's gateway was built with.
    pub fn version(&self) -> &str {
        &self.gateway.config().version
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// Slots for the installing, waiting and active worker.
#[derive(Debug, Default)]
pub struct ServiceWorkerRegistration {
    pub installing: Option<ServiceWorker>,
    pub waiting: Option<ServiceWorker>,
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Put a new worker in the installing slot. An older installing worker
    /// is returned as redundant.
    pub fn begin_install(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorker> {
        worker.set_state(ServiceWorkerState::Installing);
        let replaced = self.installing.replace(worker);
        replaced.map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Installing → waiting. A previously waiting worker becomes redundant.
    pub fn install_complete(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        let replaced = self.waiting.replace(worker);
        replaced.map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Drop the installing worker after a failed install.
    pub fn install_failed(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Redundant);
        Some(worker)
    }

    /// Move the waiting worker into the activating state. Returns its gateway.
    pub fn begin_activate(&mut self) -> Option<Arc<Gateway>> {
        let worker = self.waiting.as_mut()?;
        worker.set_state(ServiceWorkerState::Activating);
        Some(Arc::clone(&worker.gateway))
    }

    /// Activating → active. The previous active worker becomes redundant and
    /// is returned.
    pub fn activate(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activated);
        let old = self.active.replace(worker);
        old.map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }
}

// ==================== Clients ====================

/// An open application view.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub controller: Option<ServiceWorkerId>,
}

/// Open clients.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
    next_id: u64,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened view, controlled by `controller` if any.
    pub fn open(&mut self, url: Url, controller: Option<ServiceWorkerId>) -> Client {
        self.next_id += 1;
        let client = Client {
            id: format!("client-{}", self.next_id),
            url,
            controller,
        };
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// All clients, oldest first.
    pub fn all(&self) -> Vec<&Client> {
        let mut clients: Vec<&Client> = self.clients.values().collect();
        clients.sort_by(|a, b| open_order(&a.id, &b.id));
        clients
    }

    /// Make `worker` the controller of every client. Returns the ids of the
    /// clients whose controller changed.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect();
        changed.sort_by(|a, b| open_order(a, b));
        changed
    }
}

/// Ids share the `client-` prefix, so shorter ids were opened earlier.
fn open_order(a: &str, b: &str) -> std::cmp::Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::storage::MemoryStore;
    use futures::future::BoxFuture;
    use nutrisync_net::{NetError, Network, Request, Response};

    struct Offline;

    impl Network for Offline {
        fn fetch(&self, _request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
            Box::pin(async { Err(NetError::RequestFailed("offline".into())) })
        }
    }

    fn worker(version: &str) -> ServiceWorker {
        let gateway = Gateway::new(
            GatewayConfig::default().with_version(version),
            Arc::new(Offline),
            Arc::new(MemoryStore::new()),
        );
        ServiceWorker::new(Arc::new(gateway))
    }

    #[test]
    fn test_worker_creation() {
        let w = worker("v1");
        assert_eq!(w.state, ServiceWorkerState::Parsed);
        assert_eq!(w.version(), "v1");
        assert!(!w.is_active());
    }

    #[test]
    fn test_registration_lifecycle() {
        let mut registration = ServiceWorkerRegistration::new();

        assert!(registration.begin_install(worker("v1")).is_none());
        assert_eq!(
            registration.installing.as_ref().unwrap().state,
            ServiceWorkerState::Installing
        );

        assert!(registration.install_complete().is_none());
        assert!(registration.installing.is_none());
        assert_eq!(
            registration.waiting.as_ref().unwrap().state,
            ServiceWorkerState::Installed
        );

        assert!(registration.begin_activate().is_some());
        assert_eq!(
            registration.waiting.as_ref().unwrap().state,
            ServiceWorkerState::Activating
        );

        assert!(registration.activate().is_none());
        assert!(registration.get_active().unwrap().is_active());
        assert!(registration.waiting.is_none());
    }

    #[test]
    fn test_activation_supersedes_previous() {
        let mut registration = ServiceWorkerRegistration::new();
        registration.begin_install(worker("v1"));
        registration.install_complete();
        registration.activate();

        registration.begin_install(worker("v2"));
        registration.install_complete();
        let old = registration.activate().unwrap();

        assert!(old.is_redundant());
        assert_eq!(old.version(), "v1");
        assert_eq!(registration.get_active().unwrap().version(), "v2");
    }

    #[test]
    fn test_failed_install_keeps_active() {
        let mut registration = ServiceWorkerRegistration::new();
        registration.begin_install(worker("v1"));
        registration.install_complete();
        registration.activate();

        registration.begin_install(worker("v2"));
        let failed = registration.install_failed().unwrap();

        assert!(failed.is_redundant());
        assert!(registration.installing.is_none());
        assert_eq!(registration.get_active().unwrap().version(), "v1");
    }

    #[test]
    fn test_clients_claim() {
        let mut clients = Clients::new();
        let url = Url::parse("https://nutrisync.app/").unwrap();
        let a = clients.open(url.clone(), None);
        let w1 = worker("v1").id;
        let b = clients.open(url, Some(w1));

        let w2 = worker("v2").id;
        assert_eq!(clients.claim(w2), vec![a.id.clone(), b.id.clone()]);
        assert!(clients.claim(w2).is_empty());
        assert_eq!(clients.get(&a.id).unwrap().controller, Some(w2));
        assert_eq!(clients.get(&b.id).unwrap().controller, Some(w2));
    }

    #[test]
    fn test_clients_listed_in_open_order() {
        let mut clients = Clients::new();
        let url = Url::parse("https://nutrisync.app/").unwrap();
        let opened: Vec<String> = (0..12).map(|_| clients.open(url.clone(), None).id).collect();

        let listed: Vec<String> = clients.all().into_iter().map(|c| c.id.clone()).collect();
        assert_eq!(listed, opened);
        assert_eq!(clients.claim(worker("v1").id), opened);
    }
}
