//! Provider dispatch table with bounded outbound concurrency.

use super::{ProviderAdapter, ProviderId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default concurrent calls allowed per provider.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Dispatch table from [`ProviderId`] to adapter, with a per-provider
/// semaphore bounding outbound concurrency.
///
/// The concurrency bound protects a degrading dependency from being
/// overwhelmed; it is independent of, and composes with, the circuit
/// breaker.
pub struct ProviderRegistry {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    limits: HashMap<ProviderId, Arc<Semaphore>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /// Looks up the adapter for a provider.
    #[must_use]
    pub fn adapter(&self, id: ProviderId) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&id).cloned()
    }

    /// Returns the registered provider ids.
    #[must_use]
    pub fn providers(&self) -> Vec<ProviderId> {
        self.adapters.keys().copied().collect()
    }

    /// Acquires an outbound-concurrency permit for a provider.
    ///
    /// Waits until a slot is free; the permit is released when dropped.
    pub async fn acquire_slot(&self, id: ProviderId) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.limits.get(&id)?.clone();
        semaphore.acquire_owned().await.ok()
    }

    /// Returns the number of currently available slots for a provider.
    #[must_use]
    pub fn available_slots(&self, id: ProviderId) -> Option<usize> {
        self.limits.get(&id).map(|s| s.available_permits())
    }
}

/// Builder for [`ProviderRegistry`].
#[derive(Default)]
pub struct ProviderRegistryBuilder {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    concurrency: HashMap<ProviderId, usize>,
}

impl ProviderRegistryBuilder {
    /// Registers an adapter under its own id.
    #[must_use]
    pub fn register(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.id(), adapter);
        self
    }

    /// Overrides the outbound-concurrency bound for a provider.
    #[must_use]
    pub fn with_concurrency(mut self, id: ProviderId, limit: usize) -> Self {
        self.concurrency.insert(id, limit.max(1));
        self
    }

    /// Finalizes the registry.
    #[must_use]
    pub fn build(self) -> ProviderRegistry {
        let limits = self
            .adapters
            .keys()
            .map(|&id| {
                let limit = self
                    .concurrency
                    .get(&id)
                    .copied()
                    .unwrap_or(DEFAULT_MAX_CONCURRENCY);
                (id, Arc::new(Semaphore::new(limit)))
            })
            .collect();

        ProviderRegistry {
            adapters: self.adapters,
            limits,
        }
    }
}
