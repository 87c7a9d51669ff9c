// Authentication types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cache key holding the provider selector flag
pub const PROVIDER_FLAG_KEY: &str = "auth_provider";

/// Backend credential pair persisted per session
///
/// A stored record is either absent or carries both fields as non-empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }

    /// Both fields present and non-empty
    pub fn is_complete(&self) -> bool {
        !self.access.is_empty() && !self.refresh.is_empty()
    }
}

/// Loose shape used when reading a record back from the cache.
/// Missing fields are tolerated here so the caller can classify the record.
#[derive(Debug, Deserialize)]
pub(crate) struct StoredRecord {
    pub access: Option<String>,
    pub refresh: Option<String>,
}

/// Which backend issued the session's credentials
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFlag {
    /// Main classifieds backend
    #[default]
    Primary,

    /// Secondary/dummy provider
    Secondary,
}

impl ProviderFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFlag::Primary => "primary",
            ProviderFlag::Secondary => "secondary",
        }
    }

    /// Cache key under which this provider's token pair lives
    pub fn storage_key(&self) -> String {
        format!("{}_auth", self.as_str())
    }

    /// Inverse of [`ProviderFlag::storage_key`]
    pub fn from_storage_key(key: &str) -> Option<Self> {
        key.strip_suffix("_auth").and_then(|p| p.parse().ok())
    }
}

impl fmt::Display for ProviderFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "primary" => Ok(ProviderFlag::Primary),
            "secondary" => Ok(ProviderFlag::Secondary),
            other => Err(format!("unknown auth provider: {}", other)),
        }
    }
}

/// Claims read from a token payload
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    /// Expiry, seconds since epoch
    pub exp: i64,

    /// `user_id` claim, stringified
    pub subject: Option<String>,
}

/// Refresh endpoint request body
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh: &'a str,
}

/// Refresh endpoint response body
#[derive(Deserialize)]
pub struct RefreshResponse {
    pub access: String,
    pub refresh: Option<String>,
}
