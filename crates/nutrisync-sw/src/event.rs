//! Lifecycle events and lifetime extension.
//!
//! Handlers return immediately; work that must outlive the handler is handed
//! to [`ExtendableEvent::wait_until`], which starts it right away on the tokio
//! runtime and keeps the handle so the host can wait for it.

use nutrisync_net::Request;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::ServiceWorkerError;

type Extension = JoinHandle<Result<(), ServiceWorkerError>>;

/// An event whose lifetime can be extended by pending work.
#[derive(Debug)]
pub struct ExtendableEvent {
    name: &'static str,
    extensions: Vec<Extension>,
}

impl ExtendableEvent {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            extensions: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Keep the event alive until `work` completes.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = Result<(), ServiceWorkerError>> + Send + 'static,
    {
        self.extensions.push(tokio::spawn(work));
    }

    /// Number of extensions registered so far.
    pub fn pending(&self) -> usize {
        self.extensions.len()
    }

    /// Hand the extensions over to the host.
    pub fn into_extensions(self) -> Vec<Extension> {
        self.extensions
    }

    /// Wait for every extension. Returns the first failure, after all of
    /// them have finished.
    pub async fn settle(self) -> Result<(), ServiceWorkerError> {
        settle_all(self.name, self.extensions).await
    }
}

pub(crate) async fn settle_all(
    name: &str,
    extensions: Vec<Extension>,
) -> Result<(), ServiceWorkerError> {
    let mut first_error = None;
    for handle in extensions {
        let outcome = match handle.await {
            Ok(result) => result,
            Err(e) => Err(ServiceWorkerError::Internal(format!("{name} task panicked: {e}"))),
        };
        if let Err(e) = outcome {
            warn!(event = name, error = %e, "Lifetime extension failed");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

macro_rules! extendable {
    ($ty:ident) => {
        impl Deref for $ty {
            type Target = ExtendableEvent;

            fn deref(&self) -> &ExtendableEvent {
                &self.base
            }
        }

        impl DerefMut for $ty {
            fn deref_mut(&mut self) -> &mut ExtendableEvent {
                &mut self.base
            }
        }
    };
}

/// Install event.
#[derive(Debug)]
pub struct InstallEvent {
    base: ExtendableEvent,
    skip_waiting: bool,
}

impl InstallEvent {
    pub fn new() -> Self {
        Self {
            base: ExtendableEvent::new("install"),
            skip_waiting: false,
        }
    }

    /// Activate as soon as install succeeds, without waiting.
    pub fn skip_waiting(&mut self) {
        self.skip_waiting = true;
    }

    pub fn skips_waiting(&self) -> bool {
        self.skip_waiting
    }

    pub fn into_parts(self) -> (ExtendableEvent, bool) {
        (self.base, self.skip_waiting)
    }
}

impl Default for InstallEvent {
    fn default() -> Self {
        Self::new()
    }
}

extendable!(InstallEvent);

/// Activate event.
#[derive(Debug)]
pub struct ActivateEvent {
    base: ExtendableEvent,
    claim: bool,
}

impl ActivateEvent {
    pub fn new() -> Self {
        Self {
            base: ExtendableEvent::new("activate"),
            claim: false,
        }
    }

    /// Take control of every open client once activation settles.
    pub fn claim_clients(&mut self) {
        self.claim = true;
    }

    pub fn into_parts(self) -> (ExtendableEvent, bool) {
        (self.base, self.claim)
    }
}

impl Default for ActivateEvent {
    fn default() -> Self {
        Self::new()
    }
}

extendable!(ActivateEvent);

/// Fetch event.
#[derive(Debug)]
pub struct FetchEvent {
    base: ExtendableEvent,
    pub request: Request,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            base: ExtendableEvent::new("fetch"),
            request,
        }
    }

    pub fn into_parts(self) -> (ExtendableEvent, Request) {
        (self.base, self.request)
    }
}

extendable!(FetchEvent);

/// Background sync event.
#[derive(Debug)]
pub struct SyncEvent {
    base: ExtendableEvent,
    pub tag: String,
}

impl SyncEvent {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            base: ExtendableEvent::new("sync"),
            tag: tag.into(),
        }
    }

    pub fn into_base(self) -> ExtendableEvent {
        self.base
    }
}

extendable!(SyncEvent);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_settle_runs_all_extensions() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut event = ExtendableEvent::new("fetch");
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            event.wait_until(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        assert_eq!(event.pending(), 3);
        event.settle().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_settle_reports_failure_after_all_finish() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut event = InstallEvent::new();
        event.wait_until(async { Err(ServiceWorkerError::NetworkError("offline".into())) });
        let c = Arc::clone(&counter);
        event.wait_until(async move {
            tokio::task::yield_now().await;
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (base, skip) = event.into_parts();
        assert!(!skip);
        assert!(matches!(
            base.settle().await,
            Err(ServiceWorkerError::NetworkError(_))
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flags() {
        let mut install = InstallEvent::new();
        install.skip_waiting();
        assert!(install.skips_waiting());

        let mut activate = ActivateEvent::new();
        activate.claim_clients();
        let (_, claim) = activate.into_parts();
        assert!(claim);
    }
}
