use reqwest::Client;
use std::sync::Arc;

use super::codec;
use super::expiry::{Clock, ExpiryPolicy};
use super::provider::{ProviderEndpoints, ProviderSelector};
use super::refresh::{RefreshCoordinator, RefreshFlights};
use super::types::{ProviderFlag, TokenPair, PROVIDER_FLAG_KEY};
use crate::error::AuthError;
use crate::gate::{GateRoutes, PresenceGate, RedirectThrottle};
use crate::http_client::AuthenticatedClient;
use crate::store::{self, CredentialStore};

/// Tunables for the credential lifecycle
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSettings {
    pub endpoints: ProviderEndpoints,
    pub whoami_url: String,

    /// Safety margin before token expiry (milliseconds)
    pub expiry_buffer_ms: i64,

    /// Endpoint calls per refresh
    pub refresh_max_attempts: u32,

    /// Base delay for refresh backoff (milliseconds)
    pub refresh_backoff_base_ms: u64,
}

/// Authentication manager
/// Wires store, selector, refresh and request execution for one session scope
#[derive(Clone)]
pub struct AuthManager {
    store: Arc<dyn CredentialStore>,
    selector: ProviderSelector,
    client: AuthenticatedClient,
}

impl AuthManager {
    /// `http` and `flights` are process-wide; `store` is bound to the session
    pub fn new(
        store: Arc<dyn CredentialStore>,
        http: Client,
        flights: RefreshFlights,
        clock: Arc<dyn Clock>,
        settings: &AuthSettings,
    ) -> Self {
        let selector = ProviderSelector::new(store.clone(), Arc::new(settings.endpoints.clone()));
        let policy = ExpiryPolicy::new(clock, settings.expiry_buffer_ms);
        let refresher = RefreshCoordinator::new(
            http.clone(),
            store.clone(),
            selector.clone(),
            flights,
            settings.refresh_backoff_base_ms,
        );
        let client = AuthenticatedClient::new(
            http,
            store.clone(),
            selector.clone(),
            policy,
            refresher,
            settings.refresh_max_attempts,
            settings.whoami_url.clone(),
        );

        Self {
            store,
            selector,
            client,
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn selector(&self) -> &ProviderSelector {
        &self.selector
    }

    /// Executor for outbound calls on behalf of this session
    pub fn client(&self) -> &AuthenticatedClient {
        &self.client
    }

    /// New gate for a page mounted in this session
    pub fn gate(&self, routes: GateRoutes, throttle: RedirectThrottle) -> PresenceGate {
        PresenceGate::new(
            self.store.clone(),
            self.selector.clone(),
            self.client.clone(),
            routes,
            throttle,
        )
    }

    /// Persist the credentials issued at the end of a login flow
    pub async fn sign_in(&self, provider: ProviderFlag, pair: &TokenPair) -> Result<(), AuthError> {
        if !pair.is_complete() {
            return Err(AuthError::MalformedRecord(
                "login produced an incomplete token pair".to_string(),
            ));
        }

        if !self.store.set(PROVIDER_FLAG_KEY, provider.as_str()).await {
            return Err(AuthError::Transport("could not store auth provider".to_string()));
        }

        let key = provider.storage_key();
        if !store::save_pair(self.store.as_ref(), &key, pair).await {
            return Err(AuthError::Transport("could not store credentials".to_string()));
        }

        tracing::info!(
            provider = %provider,
            subject = %codec::decode(&pair.access).ok().and_then(|c| c.subject).unwrap_or_default(),
            "Session credentials stored"
        );
        Ok(())
    }

    /// Remove the session's credentials and provider flag.
    /// Returns whether both deletes succeeded.
    pub async fn sign_out(&self) -> bool {
        let provider = self.selector.current().await;
        let pair_deleted = self.store.delete(&provider.storage_key()).await;
        let flag_deleted = self.store.delete(PROVIDER_FLAG_KEY).await;

        tracing::info!(provider = %provider, pair_deleted, flag_deleted, "Session credentials removed");
        pair_deleted && flag_deleted
    }

    /// `user_id` of the stored access token, if any
    pub async fn subject(&self) -> Option<String> {
        let key = self.selector.active_key().await;
        let pair = store::load_pair(self.store.as_ref(), &key).await.ok()?;
        codec::decode(&pair.access).ok()?.subject
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::codec::encode_unsigned;
    use crate::auth::expiry::SystemClock;
    use crate::cache::SharedCache;
    use serde_json::json;

    fn settings() -> AuthSettings {
        AuthSettings {
            endpoints: ProviderEndpoints {
                primary_refresh_url: "http://127.0.0.1:1/refresh".to_string(),
                secondary_refresh_url: "http://127.0.0.1:1/secondary/refresh".to_string(),
            },
            whoami_url: "http://127.0.0.1:1/whoami".to_string(),
            expiry_buffer_ms: 30_000,
            refresh_max_attempts: 1,
            refresh_backoff_base_ms: 0,
        }
    }

    fn manager(cache: &SharedCache) -> AuthManager {
        AuthManager::new(
            Arc::new(cache.scoped("session-1")),
            Client::new(),
            RefreshFlights::new(),
            Arc::new(SystemClock),
            &settings(),
        )
    }

    #[tokio::test]
    async fn test_sign_in_and_sign_out() {
        let cache = SharedCache::new();
        let manager = manager(&cache);
        let access = encode_unsigned(&json!({"exp": 4_000_000_000i64, "user_id": 99}));
        let pair = TokenPair::new(access, "refresh-1");

        manager.sign_in(ProviderFlag::Secondary, &pair).await.unwrap();
        assert_eq!(manager.selector().current().await, ProviderFlag::Secondary);
        assert_eq!(
            store::load_pair(manager.store().as_ref(), "secondary_auth").await,
            Ok(pair)
        );
        assert_eq!(manager.subject().await.as_deref(), Some("99"));

        assert!(manager.sign_out().await);
        assert!(cache.is_empty());
        assert_eq!(manager.selector().current().await, ProviderFlag::Primary);
    }

    #[tokio::test]
    async fn test_sign_in_rejects_incomplete_pair() {
        let cache = SharedCache::new();
        let manager = manager(&cache);

        let err = manager
            .sign_in(ProviderFlag::Primary, &TokenPair::new("access", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MalformedRecord(_)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_subject_without_session() {
        let cache = SharedCache::new();
        assert_eq!(manager(&cache).subject().await, None);
    }
}
