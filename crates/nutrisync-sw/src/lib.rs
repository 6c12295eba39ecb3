//! # NutriSync Service Worker
//!
//! Offline interception-and-cache gateway for the NutriSync web app.
//!
//! ## Features
//!
//! - **Lifecycle**: install (precache), activate (stale generation sweep,
//!   client claim), fetch, background sync
//! - **Routing**: API traffic is network-first, everything else same-origin is
//!   cache-first, cross-origin traffic is not touched
//! - **Storage**: versioned static/dynamic generations over an injected
//!   [`CacheStore`] (in memory or on disk)
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing / waiting / active (ServiceWorker)
//!     │       │       └── Gateway
//!     │       │               ├── Router
//!     │       │               └── GenerationRegistry
//!     │       │                       ├── nutrisync-static-{version}
//!     │       │                       └── nutrisync-dynamic-{version}
//!     └── Clients
//!
//! CacheStore (shared, process-wide)
//!     └── generation name → CacheKey → CacheEntry
//! ```

use thiserror::Error;

pub mod cache;
pub mod config;
pub mod container;
pub mod event;
pub mod gateway;
pub mod lifecycle;
pub mod registry;
pub mod route;
pub mod storage;

pub use cache::{CacheEntry, CacheKey, StoredHeader};
pub use config::{ConfigError, GatewayConfig};
pub use container::{ServiceWorkerContainer, ServiceWorkerEvent};
pub use event::{ActivateEvent, ExtendableEvent, FetchEvent, InstallEvent, SyncEvent};
pub use gateway::{Gateway, Intercept};
pub use lifecycle::{Client, ServiceWorker, ServiceWorkerId, ServiceWorkerState};
pub use registry::{Generation, GenerationKind, GenerationRegistry};
pub use route::{ApiPattern, RequestClass, Router};
pub use storage::{CacheStore, DiskStore, MemoryStore, StorageError};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Precache failed for {url}: {reason}")]
    PrecacheFailed { url: String, reason: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("No response: {0}")]
    NoResponse(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
