//! Persistence Port (component C6, §6).
//!
//! Concrete backends are external; this module defines the trait plus the
//! in-memory `NullPersistence` reference implementation used by tests and
//! as the default when no backend is configured. Every workspace always
//! has *some* persistence provider, just a no-op one by default, so the
//! Workspace Client Lifecycle always has something concrete to hold
//! (§4.8 point 4, "pre-seed an exports object with no-op lifecycles").

use std::future::Future;
use std::pin::Pin;

/// Future returned by `on_load` and `when_synced`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// External collaborator that loads persisted state before first mutation
/// and writes the update stream back out (§6 "Persistence port").
pub trait PersistenceProvider: Send + Sync {
    /// Apply persisted state to the document before it is externally
    /// observed. Called once during Workspace Client construction.
    fn on_load(&self) -> BoxFuture<'_, ()>;

    /// Register a callback invoked with every document update that should
    /// be durably written. The callback receives the opaque CRDT update
    /// bytes and the origin token that produced them.
    fn subscribe_updates(&self, handler: Box<dyn Fn(&[u8]) + Send + Sync>);

    /// Resolves once the initial load has completed.
    fn when_synced(&self) -> BoxFuture<'_, ()>;
}

/// No-op persistence: resolves immediately, stores nothing. Default backend
/// when `persistence.enabled = false` or no backend is configured.
#[derive(Debug, Default)]
pub struct NullPersistence;

impl PersistenceProvider for NullPersistence {
    fn on_load(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn subscribe_updates(&self, _handler: Box<dyn Fn(&[u8]) + Send + Sync>) {
        // Nothing to persist; updates are simply not retained.
    }

    fn when_synced(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_persistence_resolves_immediately() {
        let provider = NullPersistence;
        provider.on_load().await;
        provider.when_synced().await;
    }

    #[tokio::test]
    async fn null_persistence_subscribe_accepts_a_handler_without_calling_it() {
        let provider = NullPersistence;
        let called = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_clone = called.clone();
        provider.subscribe_updates(Box::new(move |_bytes| {
            called_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }
}
