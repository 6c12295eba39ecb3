//! The interception-and-cache gateway.
//!
//! One gateway is one deployed version: its config names the current
//! generations, and its handlers implement install (precache), activate
//! (sweep + claim), fetch (routing) and background sync.

use futures::future::try_join_all;
use nutrisync_net::{Network, Request, Response};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheKey};
use crate::config::GatewayConfig;
use crate::event::{ActivateEvent, FetchEvent, InstallEvent, SyncEvent};
use crate::registry::{Generation, GenerationKind, GenerationRegistry};
use crate::route::{RequestClass, Router};
use crate::storage::CacheStore;
use crate::ServiceWorkerError;

/// Outcome of the fetch handler.
#[derive(Debug)]
pub enum Intercept {
    /// Not handled; the host fetches from the network itself.
    Passthrough,
    /// Handled. An error is a failed fetch for the caller.
    Respond(Result<Response, ServiceWorkerError>),
}

/// Interception-and-cache gateway for one version.
pub struct Gateway {
    config: GatewayConfig,
    network: Arc<dyn Network>,
    generations: GenerationRegistry,
    router: Router,
}

impl Gateway {
    pub fn new(config: GatewayConfig, network: Arc<dyn Network>, store: Arc<dyn CacheStore>) -> Self {
        let generations = GenerationRegistry::new(&config, store);
        let router = Router::from_config(&config);
        Self {
            config,
            network,
            generations,
            router,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn generations(&self) -> &GenerationRegistry {
        &self.generations
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    // ==================== Install ====================

    /// Precache the static manifest, all or nothing, then skip waiting.
    pub fn on_install(&self, event: &mut InstallEvent) {
        info!(version = %self.config.version, "Installing");

        let urls: Result<Vec<Url>, _> = self
            .config
            .static_assets
            .iter()
            .map(|path| self.config.resolve(path))
            .collect();

        match urls {
            Ok(urls) => event.wait_until(precache(
                urls,
                Arc::clone(&self.network),
                self.generations.generation(GenerationKind::Static).clone(),
            )),
            Err(e) => event.wait_until(async move { Err(e.into()) }),
        }
        event.skip_waiting();
    }

    // ==================== Activate ====================

    /// Delete stale generations, then claim open clients.
    pub fn on_activate(&self, event: &mut ActivateEvent) {
        info!(version = %self.config.version, "Activating");

        let generations = self.generations.clone();
        event.wait_until(async move {
            let deleted = generations.sweep().await?;
            debug!(deleted = deleted.len(), "Activation sweep finished");
            Ok(())
        });
        event.claim_clients();
    }

    // ==================== Fetch ====================

    /// Route one intercepted request.
    pub async fn on_fetch(&self, event: &mut FetchEvent) -> Intercept {
        let class = self.router.classify(&event.request);
        let result = match class {
            RequestClass::CrossOrigin => return Intercept::Passthrough,
            RequestClass::Api => self.network_first(event).await,
            RequestClass::Static => self.cache_first(event).await,
        };

        if let Err(ref e) = result {
            debug!(url = %event.request.url, ?class, error = %e, "Intercepted fetch failed");
        }
        Intercept::Respond(result)
    }

    async fn network_first(&self, event: &mut FetchEvent) -> Result<Response, ServiceWorkerError> {
        let key = CacheKey::for_request(&event.request);

        let failure = match self.network.fetch(event.request.clone()).await {
            Ok(response) if !response.ok() => return Ok(response),
            Ok(response) => match response.tee().await {
                Ok((live, copy)) => {
                    self.store_later(event, key, copy);
                    return Ok(live);
                }
                Err(e) => e,
            },
            Err(e) => e,
        };

        debug!(key = %key, error = %failure, "Network failed, trying cache");
        self.match_cached(&key)
            .await
            .ok_or_else(|| ServiceWorkerError::NoResponse(format!("{key}: {failure}")))
    }

    async fn cache_first(&self, event: &mut FetchEvent) -> Result<Response, ServiceWorkerError> {
        let key = CacheKey::for_request(&event.request);
        if let Some(cached) = self.match_cached(&key).await {
            return Ok(cached);
        }

        let failure = match self.network.fetch(event.request.clone()).await {
            Ok(response) if !response.ok() => return Ok(response),
            Ok(response) => match response.tee().await {
                Ok((live, copy)) => {
                    self.store_later(event, key, copy);
                    return Ok(live);
                }
                Err(e) => e,
            },
            Err(e) => e,
        };

        if !event.request.is_navigation() {
            return Err(ServiceWorkerError::NetworkError(format!("{key}: {failure}")));
        }

        let fallback = CacheKey::get(&self.config.resolve(&self.config.offline_fallback)?);
        debug!(key = %key, fallback = %fallback, "Navigation offline, serving fallback document");
        self.match_cached(&fallback)
            .await
            .ok_or_else(|| ServiceWorkerError::NoResponse(format!("{key}: {failure}")))
    }

    /// Combined lookup. A storage read failure counts as a miss.
    async fn match_cached(&self, key: &CacheKey) -> Option<Response> {
        match self.generations.lookup(key).await {
            Ok(entry) => entry.map(|e| e.to_response()),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    /// Store `response` in the dynamic generation without delaying the caller.
    fn store_later(&self, event: &mut FetchEvent, key: CacheKey, response: Response) {
        let generation = self.generations.generation(GenerationKind::Dynamic).clone();
        event.wait_until(async move {
            let entry = CacheEntry::capture(&key, response)
                .await
                .map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))?;
            generation.put(&key, entry).await?;
            debug!(key = %key, generation = %generation.name(), "Cached response");
            Ok(())
        });
    }

    // ==================== Sync ====================

    /// Background reconciliation. Nothing is queued for replay yet, so the
    /// registered task completes immediately.
    pub fn on_sync(&self, event: &mut SyncEvent) {
        if event.tag != self.config.sync_tag {
            debug!(tag = %event.tag, "Ignoring sync for unknown tag");
            return;
        }
        info!(tag = %event.tag, "Background sync triggered");
        event.wait_until(async {
            debug!("No offline writes to replay");
            Ok(())
        });
    }
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("version", &self.config.version)
            .field("generations", &self.generations)
            .finish_non_exhaustive()
    }
}

/// Fetch every URL, then store them all. Nothing is written unless every
/// fetch succeeded with a 2xx status.
async fn precache(
    urls: Vec<Url>,
    network: Arc<dyn Network>,
    generation: Generation,
) -> Result<(), ServiceWorkerError> {
    let existed = generation.exists().await?;
    let count = urls.len();

    let entries = try_join_all(urls.into_iter().map(|url| fetch_asset(network.as_ref(), url))).await?;

    for (key, entry) in entries {
        if let Err(e) = generation.put(&key, entry).await {
            if !existed {
                match generation.delete().await {
                    Ok(_) => debug!(generation = %generation.name(), "Removed partial generation"),
                    Err(del) => warn!(generation = %generation.name(), error = %del, "Could not remove partial generation"),
                }
            }
            return Err(e.into());
        }
    }

    info!(generation = %generation.name(), assets = count, "Precached static assets");
    Ok(())
}

async fn fetch_asset(
    network: &dyn Network,
    url: Url,
) -> Result<(CacheKey, CacheEntry), ServiceWorkerError> {
    let key = CacheKey::get(&url);
    let failed = |reason: String| ServiceWorkerError::PrecacheFailed {
        url: url.to_string(),
        reason,
    };

    let response = network
        .fetch(Request::get(url.clone()))
        .await
        .map_err(|e| failed(e.to_string()))?;
    if !response.ok() {
        return Err(failed(format!("status {}", response.status)));
    }

    let entry = CacheEntry::capture(&key, response)
        .await
        .map_err(|e| failed(e.to_string()))?;
    Ok((key, entry))
}
