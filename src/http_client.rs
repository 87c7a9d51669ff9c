use anyhow::{Context, Result};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::codec::redact;
use crate::auth::expiry::ExpiryPolicy;
use crate::auth::provider::ProviderSelector;
use crate::auth::refresh::RefreshCoordinator;
use crate::error::AuthError;
use crate::store::{self, CredentialStore};

/// Build the pooled client used for refresh and authenticated calls
pub fn build_client(
    max_connections: usize,
    connect_timeout: u64,
    request_timeout: u64,
) -> Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(max_connections)
        .connect_timeout(Duration::from_secs(connect_timeout))
        .timeout(Duration::from_secs(request_timeout))
        .build()
        .context("Failed to create HTTP client")
}

/// HTTP client that attaches the session's backend access token
///
/// Refreshes proactively when the token is about to expire and reactively,
/// once, when the upstream answers 401. The reactive path covers clock skew
/// between this host and the issuer.
#[derive(Clone)]
pub struct AuthenticatedClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    store: Arc<dyn CredentialStore>,
    selector: ProviderSelector,
    policy: ExpiryPolicy,
    refresher: RefreshCoordinator,

    /// Attempts handed to the refresh coordinator per refresh
    refresh_max_attempts: u32,

    /// Lightweight endpoint used to confirm the credentials are accepted
    whoami_url: String,
}

impl AuthenticatedClient {
    pub fn new(
        client: Client,
        store: Arc<dyn CredentialStore>,
        selector: ProviderSelector,
        policy: ExpiryPolicy,
        refresher: RefreshCoordinator,
        refresh_max_attempts: u32,
        whoami_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            selector,
            policy,
            refresher,
            refresh_max_attempts,
            whoami_url: whoami_url.into(),
        }
    }

    /// Execute a request, retrying once after a 401
    pub async fn execute(&self, request: Request) -> Result<Response, AuthError> {
        self.execute_with_retries(request, 1).await
    }

    /// Execute a request with an explicit budget of post-401 retries.
    ///
    /// A 401 that survives the budget, or whose refresh fails, is returned to
    /// the caller as a response, not as an error.
    pub async fn execute_with_retries(
        &self,
        request: Request,
        max_retries: u32,
    ) -> Result<Response, AuthError> {
        let key = self.selector.active_key().await;
        let mut pair = store::load_pair(self.store.as_ref(), &key).await?;

        if self.policy.is_expired(&pair.access) {
            tracing::debug!(key = %key, "Access token expired, refreshing before request");
            if !self
                .refresher
                .refresh(&key, &pair.refresh, self.refresh_max_attempts)
                .await
            {
                return Err(AuthError::RefreshFailed);
            }
            pair = store::load_pair(self.store.as_ref(), &key).await?;
        }

        let method = request.method().clone();
        let url = request.url().clone();
        let mut retries_remaining = max_retries;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut req = request.try_clone().ok_or(AuthError::UnclonableRequest)?;
            let bearer = HeaderValue::from_str(&format!("Bearer {}", pair.access))
                .map_err(|_| AuthError::Decode("access token is not a valid header value".to_string()))?;
            req.headers_mut().insert(AUTHORIZATION, bearer);

            tracing::debug!(
                method = %method,
                url = %url,
                attempt,
                token = %redact(&pair.access),
                "Sending authenticated request"
            );

            let response = self.client.execute(req).await.map_err(|e| {
                tracing::warn!(url = %url, error = %e, "Authenticated request failed");
                AuthError::from(e)
            })?;

            if response.status() != StatusCode::UNAUTHORIZED || retries_remaining == 0 {
                return Ok(response);
            }
            retries_remaining -= 1;

            tracing::warn!(url = %url, attempt, "Received 401, refreshing token and retrying");

            // Pick up a refresh a concurrent caller may already have stored
            let current = match store::load_pair(self.store.as_ref(), &key).await {
                Ok(current) => current,
                Err(e) => {
                    tracing::warn!(error = %e, "Credentials disappeared after 401");
                    return Ok(response);
                }
            };

            if !self
                .refresher
                .refresh(&key, &current.refresh, self.refresh_max_attempts)
                .await
            {
                tracing::warn!(url = %url, "Refresh after 401 failed, surfacing response");
                return Ok(response);
            }

            pair = match store::load_pair(self.store.as_ref(), &key).await {
                Ok(refreshed) => refreshed,
                Err(_) => return Ok(response),
            };
        }
    }

    /// Full validate-and-refresh pass against the whoami endpoint
    pub async fn validate(&self) -> Result<(), AuthError> {
        let request = self
            .client
            .get(&self.whoami_url)
            .build()
            .map_err(AuthError::from)?;

        let response = self.execute(request).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AuthError::Rejected {
                status: status.as_u16(),
            })
        }
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}
