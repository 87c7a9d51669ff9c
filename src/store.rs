// Credential store
// Thin async access to the shared key-value cache holding token pairs

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::auth::types::{StoredRecord, TokenPair};
use crate::cache::SharedCache;
use crate::error::AuthError;

/// Header carrying the identity-session scope to the cache
pub const SESSION_HEADER: &str = "x-session-id";

/// Shared key-value cache
///
/// Implementations never surface transport errors: a failed read is `None`,
/// a failed write or delete is `false`, so callers fail closed.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    async fn set(&self, key: &str, value: &str) -> bool;

    async fn delete(&self, key: &str) -> bool;

    /// Scope this store is bound to (one identity session)
    fn namespace(&self) -> &str {
        ""
    }
}

/// Read and classify the token pair stored under `key`
pub async fn load_pair(store: &dyn CredentialStore, key: &str) -> Result<TokenPair, AuthError> {
    let raw = match store.get(key).await {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Err(AuthError::NoCredentials),
    };

    parse_pair(&raw)
}

/// Structural validation of a stored record
pub fn parse_pair(raw: &str) -> Result<TokenPair, AuthError> {
    let record: StoredRecord = serde_json::from_str(raw)
        .map_err(|e| AuthError::MalformedRecord(format!("invalid JSON: {}", e)))?;

    match (record.access, record.refresh) {
        (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
            Ok(TokenPair { access, refresh })
        }
        (access, refresh) => Err(AuthError::MalformedRecord(format!(
            "access {}, refresh {}",
            field_state(access.as_deref()),
            field_state(refresh.as_deref())
        ))),
    }
}

fn field_state(field: Option<&str>) -> &'static str {
    match field {
        None => "missing",
        Some("") => "empty",
        Some(_) => "present",
    }
}

/// Serialize and write a token pair under `key`
pub async fn save_pair(store: &dyn CredentialStore, key: &str, pair: &TokenPair) -> bool {
    match serde_json::to_string(pair) {
        Ok(value) => store.set(key, &value).await,
        Err(e) => {
            tracing::error!("Failed to serialize token pair: {}", e);
            false
        }
    }
}

/// `GET /cache` response
#[derive(Deserialize)]
struct CacheLookup {
    exists: bool,
    value: Option<String>,
}

/// Credential store backed by the HTTP cache protocol
#[derive(Clone)]
pub struct HttpCredentialStore {
    client: Client,
    cache_url: String,
    api_key: Option<String>,
    session: Option<String>,
}

impl HttpCredentialStore {
    /// Build a store sharing an existing connection pool
    pub fn with_client(client: Client, cache_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            cache_url: cache_url.into(),
            api_key,
            session: None,
        }
    }

    /// Copy of this store bound to one identity session
    pub fn scoped(&self, session: impl Into<String>) -> Self {
        Self {
            session: Some(session.into()),
            ..self.clone()
        }
    }

    fn decorate(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        if let Some(ref session) = self.session {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder
    }

    async fn lookup(&self, key: &str) -> Result<Option<String>, AuthError> {
        let response = self
            .decorate(self.client.get(&self.cache_url).query(&[("key", key)]))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Transport(format!("cache returned {}", status)));
        }

        let lookup: CacheLookup = response.json().await?;
        Ok(if lookup.exists { lookup.value } else { None })
    }
}

#[async_trait]
impl CredentialStore for HttpCredentialStore {
    async fn get(&self, key: &str) -> Option<String> {
        match self.lookup(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache read failed");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str) -> bool {
        let request = self
            .decorate(self.client.post(&self.cache_url))
            .json(&json!({ "key": key, "value": value }));

        match request.send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(key = %key, status = %response.status(), "Cache write rejected");
                false
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache write failed");
                false
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        let request = self
            .decorate(self.client.delete(&self.cache_url))
            .json(&json!({ "key": key }));

        match request.send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(key = %key, status = %response.status(), "Cache delete rejected");
                false
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache delete failed");
                false
            }
        }
    }

    fn namespace(&self) -> &str {
        self.session.as_deref().unwrap_or("")
    }
}

/// Where session stores come from
#[derive(Clone)]
pub enum CredentialBackend {
    /// The cache served by this process
    Local(SharedCache),

    /// A remote cache speaking the HTTP protocol
    Remote(HttpCredentialStore),
}

impl CredentialBackend {
    /// Store bound to one identity session
    pub fn store_for(&self, session: &str) -> Arc<dyn CredentialStore> {
        match self {
            CredentialBackend::Local(cache) => Arc::new(cache.scoped(session)),
            CredentialBackend::Remote(remote) => Arc::new(remote.scoped(session)),
        }
    }
}
