//! Provider catalog: configured descriptors joined with registered clients.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use gateway_core::{Capability, ProviderClient, ProviderDescriptor, ProviderId};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Descriptors (hot-reloadable) and the client for each provider.
///
/// Descriptors are shared by reference with every component; a reload swaps
/// the whole list atomically.
pub struct ProviderCatalog {
    descriptors: ArcSwap<Vec<Arc<ProviderDescriptor>>>,
    clients: DashMap<ProviderId, Arc<dyn ProviderClient>>,
}

impl fmt::Debug for ProviderCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCatalog")
            .field("descriptors", &self.descriptors.load().len())
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl Default for ProviderCatalog {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ProviderCatalog {
    /// Create a catalog from configured descriptors
    #[must_use]
    pub fn new(descriptors: Vec<ProviderDescriptor>) -> Self {
        Self {
            descriptors: ArcSwap::from_pointee(descriptors.into_iter().map(Arc::new).collect()),
            clients: DashMap::new(),
        }
    }

    /// Register the client for a provider, replacing any previous one
    pub fn register_client(&self, client: Arc<dyn ProviderClient>) {
        let id = client.id().clone();
        if !self.descriptors.load().iter().any(|d| d.id == id) {
            warn!(provider = %id, "Registered client has no configured descriptor");
        }
        debug!(provider = %id, "Provider client registered");
        self.clients.insert(id, client);
    }

    /// Client for `provider`
    #[must_use]
    pub fn client(&self, provider: &ProviderId) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(provider).map(|c| Arc::clone(c.value()))
    }

    /// Replace the descriptor list
    pub fn update_descriptors(&self, descriptors: Vec<ProviderDescriptor>) {
        self.descriptors
            .store(Arc::new(descriptors.into_iter().map(Arc::new).collect()));
    }

    /// Current descriptor list
    #[must_use]
    pub fn descriptors(&self) -> Arc<Vec<Arc<ProviderDescriptor>>> {
        self.descriptors.load_full()
    }

    /// Descriptor for `provider`
    #[must_use]
    pub fn descriptor(&self, provider: &ProviderId) -> Option<Arc<ProviderDescriptor>> {
        self.descriptors
            .load()
            .iter()
            .find(|d| &d.id == provider)
            .map(Arc::clone)
    }

    /// Enabled providers serving `capability` that have a registered client
    #[must_use]
    pub fn candidates(&self, capability: Capability) -> Vec<Arc<ProviderDescriptor>> {
        self.descriptors
            .load()
            .iter()
            .filter(|d| d.serves(capability))
            .filter(|d| {
                self.clients
                    .get(&d.id)
                    .is_some_and(|c| c.capabilities().supports(capability))
            })
            .map(Arc::clone)
            .collect()
    }

    /// Enabled providers with a registered client, paired with that client
    #[must_use]
    pub fn active(&self) -> Vec<(Arc<ProviderDescriptor>, Arc<dyn ProviderClient>)> {
        self.descriptors
            .load()
            .iter()
            .filter(|d| d.enabled)
            .filter_map(|d| self.client(&d.id).map(|c| (Arc::clone(d), c)))
            .collect()
    }
}
