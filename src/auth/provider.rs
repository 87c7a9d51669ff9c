// Provider selection
// Decides which cache namespace and refresh endpoint are authoritative

use std::sync::Arc;

use super::types::{ProviderFlag, PROVIDER_FLAG_KEY};
use crate::store::CredentialStore;

/// Refresh endpoints per provider
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEndpoints {
    pub primary_refresh_url: String,
    pub secondary_refresh_url: String,
}

impl ProviderEndpoints {
    pub fn refresh_url(&self, provider: ProviderFlag) -> &str {
        match provider {
            ProviderFlag::Primary => &self.primary_refresh_url,
            ProviderFlag::Secondary => &self.secondary_refresh_url,
        }
    }
}

/// Reads the provider flag for the current session
#[derive(Clone)]
pub struct ProviderSelector {
    store: Arc<dyn CredentialStore>,
    endpoints: Arc<ProviderEndpoints>,
}

impl ProviderSelector {
    pub fn new(store: Arc<dyn CredentialStore>, endpoints: Arc<ProviderEndpoints>) -> Self {
        Self { store, endpoints }
    }

    /// Active provider; `primary` when the flag is absent or unreadable
    pub async fn current(&self) -> ProviderFlag {
        match self.store.get(PROVIDER_FLAG_KEY).await {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!("{}, falling back to primary", e);
                ProviderFlag::Primary
            }),
            None => ProviderFlag::Primary,
        }
    }

    /// Cache key holding the active provider's token pair
    pub async fn active_key(&self) -> String {
        self.current().await.storage_key()
    }

    /// Refresh endpoint for a provider-qualified key.
    /// Keys that name no provider resolve through the stored flag.
    pub async fn refresh_url_for_key(&self, provider_key: &str) -> String {
        let provider = match ProviderFlag::from_storage_key(provider_key) {
            Some(provider) => provider,
            None => self.current().await,
        };
        self.endpoints.refresh_url(provider).to_string()
    }
}
