// Token refresh logic

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::codec::redact;
use super::provider::ProviderSelector;
use super::types::{RefreshRequest, RefreshResponse, TokenPair};
use crate::error::AuthError;
use crate::store::{self, CredentialStore};

/// Upper bound for a single backoff sleep
const MAX_BACKOFF_MS: u64 = 10_000;

type Flight = Shared<BoxFuture<'static, bool>>;

struct FlightEntry {
    id: u64,

    /// Refresh token the flight was started with
    refresh_token: String,

    /// Callers currently awaiting the flight
    waiters: usize,

    flight: Flight,
}

/// Process-wide table of refreshes currently in progress
///
/// Keyed by `<session scope>/<provider key>`. Callers arriving with the same
/// refresh token while a refresh for that key is running await it instead of
/// starting another. An entry lives only while someone awaits it: when the
/// last waiter finishes or is dropped, the entry and its operation go away.
#[derive(Clone, Default)]
pub struct RefreshFlights {
    inner: Arc<DashMap<String, FlightEntry>>,
    next_id: Arc<AtomicU64>,
}

/// Membership of one caller in a flight; leaving happens on drop
struct FlightGuard {
    flights: RefreshFlights,
    key: String,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flights.leave(&self.key, self.id);
    }
}

impl RefreshFlights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of refreshes in progress
    pub fn in_flight(&self) -> usize {
        self.inner.len()
    }

    fn join_or_start<F>(&self, key: &str, refresh_token: &str, start: F) -> (FlightGuard, Flight)
    where
        F: FnOnce() -> BoxFuture<'static, bool>,
    {
        let (id, flight) = match self.inner.entry(key.to_string()) {
            Entry::Occupied(mut entry) if entry.get().refresh_token == refresh_token => {
                tracing::debug!(flight = %key, "Joining in-flight token refresh");
                let joined = entry.get_mut();
                joined.waiters += 1;
                (joined.id, joined.flight.clone())
            }
            Entry::Occupied(mut entry) => {
                // Older token; its waiters keep their own handle to the old flight
                tracing::debug!(flight = %key, "Replacing in-flight refresh for a newer token");
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let flight = start().shared();
                entry.insert(FlightEntry {
                    id,
                    refresh_token: refresh_token.to_string(),
                    waiters: 1,
                    flight: flight.clone(),
                });
                (id, flight)
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let flight = start().shared();
                entry.insert(FlightEntry {
                    id,
                    refresh_token: refresh_token.to_string(),
                    waiters: 1,
                    flight: flight.clone(),
                });
                (id, flight)
            }
        };

        let guard = FlightGuard {
            flights: self.clone(),
            key: key.to_string(),
            id,
        };
        (guard, flight)
    }

    fn leave(&self, key: &str, id: u64) {
        if let Entry::Occupied(mut entry) = self.inner.entry(key.to_string()) {
            if entry.get().id != id {
                return;
            }
            let current = entry.get_mut();
            current.waiters = current.waiters.saturating_sub(1);
            if current.waiters == 0 {
                entry.remove();
            }
        }
    }
}

/// Exchanges refresh tokens for new access tokens and persists the result
#[derive(Clone)]
pub struct RefreshCoordinator {
    client: Client,
    store: Arc<dyn CredentialStore>,
    selector: ProviderSelector,
    flights: RefreshFlights,

    /// Base delay for exponential backoff between attempts (milliseconds)
    backoff_base_ms: u64,
}

impl RefreshCoordinator {
    pub fn new(
        client: Client,
        store: Arc<dyn CredentialStore>,
        selector: ProviderSelector,
        flights: RefreshFlights,
        backoff_base_ms: u64,
    ) -> Self {
        Self {
            client,
            store,
            selector,
            flights,
            backoff_base_ms,
        }
    }

    /// Refresh the pair stored under `provider_key`.
    ///
    /// Makes at most `max_attempts` endpoint calls (at least one). Returns
    /// `false` when every attempt failed; the stored pair is left untouched in
    /// that case so an endpoint outage does not log the user out.
    pub async fn refresh(&self, provider_key: &str, refresh_token: &str, max_attempts: u32) -> bool {
        let flight_key = format!("{}/{}", self.store.namespace(), provider_key);

        let (guard, flight) = self.flights.join_or_start(&flight_key, refresh_token, || {
            let this = self.clone();
            let key = provider_key.to_string();
            let token = refresh_token.to_string();
            async move { this.run(&key, &token, max_attempts).await }.boxed()
        });

        let refreshed = flight.await;
        drop(guard);
        refreshed
    }

    async fn run(&self, provider_key: &str, refresh_token: &str, max_attempts: u32) -> bool {
        // Idempotent per old refresh token: a racing caller may have rotated it already
        match store::load_pair(self.store.as_ref(), provider_key).await {
            Ok(current) if current.refresh != refresh_token => {
                tracing::info!(
                    key = %provider_key,
                    "Refresh token already rotated by another caller, skipping refresh"
                );
                return true;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(key = %provider_key, error = %e, "No refreshable record");
                return false;
            }
        }

        let url = self.selector.refresh_url_for_key(provider_key).await;
        let data = match self.refresh_with_retry(&url, refresh_token, max_attempts).await {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(key = %provider_key, url = %url, "Token refresh failed: {}", e);
                return false;
            }
        };

        let rotated = data.refresh.as_deref().is_some_and(|r| !r.is_empty());
        let pair = TokenPair {
            access: data.access,
            refresh: match data.refresh {
                Some(refresh) if !refresh.is_empty() => refresh,
                _ => refresh_token.to_string(),
            },
        };

        // Read-compare-write: a logout or re-login during the call wins
        match store::load_pair(self.store.as_ref(), provider_key).await {
            Ok(current) if current.refresh == refresh_token => {}
            Ok(_) => {
                tracing::info!(
                    key = %provider_key,
                    "Record replaced while refreshing, discarding refreshed token"
                );
                return true;
            }
            Err(e) => {
                tracing::info!(
                    key = %provider_key,
                    error = %e,
                    "Record removed while refreshing, discarding refreshed token"
                );
                return false;
            }
        }

        if !store::save_pair(self.store.as_ref(), provider_key, &pair).await {
            tracing::error!(key = %provider_key, "Refreshed token could not be persisted");
            return false;
        }

        tracing::info!(
            key = %provider_key,
            access = %redact(&pair.access),
            rotated,
            "Token refreshed"
        );
        true
    }

    /// Call the endpoint until it succeeds or the attempt budget is spent
    async fn refresh_with_retry(
        &self,
        url: &str,
        refresh_token: &str,
        max_attempts: u32,
    ) -> Result<RefreshResponse, AuthError> {
        let attempts = max_attempts.max(1);

        for attempt in 0..attempts {
            match self.request_refresh(url, refresh_token).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Refresh attempt failed"
                    );

                    if attempt + 1 < attempts {
                        let delay = self.calculate_backoff_delay(attempt);
                        if delay > 0 {
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                        }
                    }
                }
            }
        }

        Err(AuthError::RefreshExhausted { attempts })
    }

    async fn request_refresh(&self, url: &str, refresh_token: &str) -> Result<RefreshResponse, AuthError> {
        tracing::debug!(url = %url, "Sending refresh request");

        let response = self
            .client
            .post(url)
            .json(&RefreshRequest {
                refresh: refresh_token,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = %status, body = %body, "Refresh endpoint rejected request");
            return Err(AuthError::Rejected {
                status: status.as_u16(),
            });
        }

        let data: RefreshResponse = response.json().await?;
        if data.access.is_empty() {
            return Err(AuthError::Decode(
                "refresh response carries an empty access token".to_string(),
            ));
        }

        Ok(data)
    }

    /// Exponential backoff: base * 2^attempt plus up to 10% jitter, capped
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(MAX_BACKOFF_MS);
        let jitter = (delay as f64 * 0.1 * rand::random::<f64>()) as u64;
        delay + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::provider::ProviderEndpoints;
    use crate::auth::types::PROVIDER_FLAG_KEY;
    use crate::cache::{ScopedCache, SharedCache};
    use mockito::{Matcher, ServerGuard};
    use serde_json::json;

    fn coordinator(server: &ServerGuard, store: &ScopedCache, backoff_base_ms: u64) -> RefreshCoordinator {
        coordinator_at(&server.url(), store, backoff_base_ms)
    }

    fn coordinator_at(base_url: &str, store: &ScopedCache, backoff_base_ms: u64) -> RefreshCoordinator {
        let store: Arc<dyn CredentialStore> = Arc::new(store.clone());
        let endpoints = Arc::new(ProviderEndpoints {
            primary_refresh_url: format!("{}/primary/refresh", base_url),
            secondary_refresh_url: format!("{}/secondary/refresh", base_url),
        });
        let selector = ProviderSelector::new(store.clone(), endpoints);
        RefreshCoordinator::new(
            Client::new(),
            store,
            selector,
            RefreshFlights::new(),
            backoff_base_ms,
        )
    }

    async fn seeded_store(key: &str, access: &str, refresh: &str) -> ScopedCache {
        let store = SharedCache::new().scoped("session-1");
        assert!(store::save_pair(&store, key, &TokenPair::new(access, refresh)).await);
        store
    }

    #[tokio::test]
    async fn test_refresh_keeps_original_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/primary/refresh")
            .match_body(Matcher::Json(json!({"refresh": "refresh-1"})))
            .with_status(200)
            .with_body(r#"{"access":"access-2"}"#)
            .expect(1)
            .create_async()
            .await;

        let store = seeded_store("primary_auth", "access-1", "refresh-1").await;
        let coordinator = coordinator(&server, &store, 0);

        assert!(coordinator.refresh("primary_auth", "refresh-1", 3).await);
        assert_eq!(
            store::load_pair(&store, "primary_auth").await,
            Ok(TokenPair::new("access-2", "refresh-1"))
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_stores_rotated_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/primary/refresh")
            .with_status(200)
            .with_body(r#"{"access":"access-2","refresh":"refresh-2"}"#)
            .create_async()
            .await;

        let store = seeded_store("primary_auth", "access-1", "refresh-1").await;
        let coordinator = coordinator(&server, &store, 0);

        assert!(coordinator.refresh("primary_auth", "refresh-1", 1).await);
        assert_eq!(
            store::load_pair(&store, "primary_auth").await,
            Ok(TokenPair::new("access-2", "refresh-2"))
        );
    }

    #[tokio::test]
    async fn test_failing_endpoint_uses_exactly_max_attempts() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/primary/refresh")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let store = seeded_store("primary_auth", "access-1", "refresh-1").await;
        let coordinator = coordinator(&server, &store, 0);

        assert!(!coordinator.refresh("primary_auth", "refresh-1", 3).await);
        mock.assert_async().await;

        // Failure never clears or alters the stored pair
        assert_eq!(
            store::load_pair(&store, "primary_auth").await,
            Ok(TokenPair::new("access-1", "refresh-1"))
        );
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/primary/refresh")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let store = seeded_store("primary_auth", "access-1", "refresh-1").await;
        assert!(!coordinator(&server, &store, 0).refresh("primary_auth", "refresh-1", 0).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_access_in_response_is_a_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/primary/refresh")
            .with_status(200)
            .with_body(r#"{"access":""}"#)
            .create_async()
            .await;

        let store = seeded_store("primary_auth", "access-1", "refresh-1").await;
        assert!(!coordinator(&server, &store, 0).refresh("primary_auth", "refresh-1", 1).await);
        assert_eq!(
            store::load_pair(&store, "primary_auth").await,
            Ok(TokenPair::new("access-1", "refresh-1"))
        );
    }

    #[tokio::test]
    async fn test_secondary_key_uses_secondary_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/secondary/refresh")
            .with_status(200)
            .with_body(r#"{"access":"access-2"}"#)
            .expect(1)
            .create_async()
            .await;

        let store = seeded_store("secondary_auth", "access-1", "refresh-1").await;
        store.set(PROVIDER_FLAG_KEY, "secondary").await;

        assert!(coordinator(&server, &store, 0).refresh("secondary_auth", "refresh-1", 1).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/primary/refresh")
            .with_status(200)
            .with_body(r#"{"access":"access-2","refresh":"refresh-2"}"#)
            .expect(1)
            .create_async()
            .await;

        let store = seeded_store("primary_auth", "access-1", "refresh-1").await;
        let coordinator = coordinator(&server, &store, 0);

        let (a, b) = tokio::join!(
            coordinator.refresh("primary_auth", "refresh-1", 1),
            coordinator.refresh("primary_auth", "refresh-1", 1),
        );

        assert!(a && b);
        assert_eq!(coordinator.flights.in_flight(), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_already_rotated_refresh_token_is_not_reused() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/primary/refresh")
            .expect(0)
            .create_async()
            .await;

        // Another caller already replaced refresh-1 with refresh-2
        let store = seeded_store("primary_auth", "access-2", "refresh-2").await;

        assert!(coordinator(&server, &store, 0).refresh("primary_auth", "refresh-1", 3).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_record_is_not_resurrected() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/primary/refresh")
            .expect(0)
            .create_async()
            .await;

        let store = SharedCache::new().scoped("session-1");
        assert!(!coordinator(&server, &store, 0).refresh("primary_auth", "refresh-1", 3).await);
        assert_eq!(store.get("primary_auth").await, None);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_logout_during_refresh_is_not_undone() {
        let mut server = mockito::Server::new_async().await;
        let cache = SharedCache::new();
        let store = cache.scoped("session-1");
        assert!(store::save_pair(&store, "primary_auth", &TokenPair::new("access-1", "refresh-1")).await);

        let remote = cache.clone();
        let mock = server
            .mock("POST", "/primary/refresh")
            .with_status(200)
            .with_body_from_request(move |_| {
                // User logs out while the endpoint is answering
                remote.delete("session-1", "primary_auth");
                br#"{"access":"access-2"}"#.to_vec()
            })
            .expect(1)
            .create_async()
            .await;

        assert!(!coordinator(&server, &store, 0).refresh("primary_auth", "refresh-1", 1).await);
        assert_eq!(store.get("primary_auth").await, None);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_relogin_during_refresh_keeps_new_pair() {
        let mut server = mockito::Server::new_async().await;
        let cache = SharedCache::new();
        let store = cache.scoped("session-1");
        assert!(store::save_pair(&store, "primary_auth", &TokenPair::new("access-1", "refresh-1")).await);

        let remote = cache.clone();
        let _mock = server
            .mock("POST", "/primary/refresh")
            .with_status(200)
            .with_body_from_request(move |_| {
                remote.set(
                    "session-1",
                    "primary_auth",
                    r#"{"access":"access-9","refresh":"refresh-9"}"#,
                );
                br#"{"access":"access-2"}"#.to_vec()
            })
            .create_async()
            .await;

        assert!(coordinator(&server, &store, 0).refresh("primary_auth", "refresh-1", 1).await);
        assert_eq!(
            store::load_pair(&store, "primary_auth").await,
            Ok(TokenPair::new("access-9", "refresh-9"))
        );
    }

    #[tokio::test]
    async fn test_cancelled_refresh_leaves_no_flight_behind() {
        // Accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let store = seeded_store("primary_auth", "access-1", "refresh-1").await;
        let coordinator = coordinator_at(&base_url, &store, 0);

        let waited = tokio::time::timeout(
            Duration::from_millis(200),
            coordinator.refresh("primary_auth", "refresh-1", 1),
        )
        .await;

        assert!(waited.is_err());
        assert_eq!(coordinator.flights.in_flight(), 0);
        assert_eq!(
            store::load_pair(&store, "primary_auth").await,
            Ok(TokenPair::new("access-1", "refresh-1"))
        );
        silent.abort();
    }

    #[tokio::test]
    async fn test_flights_join_only_matching_refresh_token() {
        let flights = RefreshFlights::new();
        let key = "session-1/primary_auth";

        let (first, _pending) =
            flights.join_or_start(key, "refresh-1", || futures::future::pending::<bool>().boxed());
        let (joined, _same) = flights.join_or_start(key, "refresh-1", || -> BoxFuture<'static, bool> {
            unreachable!("a matching refresh is already running")
        });
        assert_eq!(flights.in_flight(), 1);

        let (newer, other) =
            flights.join_or_start(key, "refresh-2", || futures::future::ready(true).boxed());
        assert!(other.await);

        // Waiters of the replaced flight no longer own the entry
        drop(first);
        drop(joined);
        assert_eq!(flights.in_flight(), 1);

        drop(newer);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_backoff_calculation() {
        let server = mockito::Server::new_async().await;
        let store = SharedCache::new().scoped("session-1");
        let coordinator = coordinator(&server, &store, 100);

        let delay0 = coordinator.calculate_backoff_delay(0);
        let delay1 = coordinator.calculate_backoff_delay(1);
        let delay2 = coordinator.calculate_backoff_delay(2);

        assert!((100..=110).contains(&delay0));
        assert!((200..=220).contains(&delay1));
        assert!((400..=440).contains(&delay2));

        // Capped
        assert!(coordinator.calculate_backoff_delay(20) <= MAX_BACKOFF_MS + MAX_BACKOFF_MS / 10);
    }
}
