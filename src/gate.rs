// Presence gate
// Blocks page rendering until the session's backend credentials check out

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::auth::provider::ProviderSelector;
use crate::error::AuthError;
use crate::http_client::AuthenticatedClient;
use crate::store::{self, CredentialStore};

/// Gate lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Checking,
    Authorized,
    Unauthorized,
}

/// Login and landing routes the gate redirects between
#[derive(Debug, Clone, PartialEq)]
pub struct GateRoutes {
    pub login_path: String,
    pub landing_path: String,
}

impl Default for GateRoutes {
    fn default() -> Self {
        Self {
            login_path: "/login".to_string(),
            landing_path: "/".to_string(),
        }
    }
}

/// Where to send the user and why; lives only in the redirect URL
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectContext {
    pub callback_url: Option<String>,
    pub error_code: String,
}

impl RedirectContext {
    /// The callback is dropped for the landing route and for the login page itself
    pub fn new(path: &str, error_code: &str, routes: &GateRoutes) -> Self {
        let route = path.split('?').next().unwrap_or(path);
        let callback_url = if path.is_empty()
            || route == routes.landing_path
            || route == routes.login_path
        {
            None
        } else {
            Some(path.to_string())
        };

        Self {
            callback_url,
            error_code: error_code.to_string(),
        }
    }

    /// `/login?callbackUrl=<path>&error=<code>`
    pub fn to_url(&self, login_path: &str) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        if let Some(ref callback) = self.callback_url {
            query.append_pair("callbackUrl", callback);
        }
        query.append_pair("error", &self.error_code);
        format!("{}?{}", login_path, query.finish())
    }
}

/// Result of one gate check
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Authorized,

    /// Navigate to `url`
    Redirect { url: String, context: RedirectContext },

    /// Unauthorized, but a redirect for this session was already fired
    Suppressed { context: RedirectContext },
}

/// Process-wide redirect throttle shared by every gate
///
/// Remembers the last redirect per session scope so two gates for the same
/// session cannot bounce the user to login twice within `window`.
#[derive(Clone)]
pub struct RedirectThrottle {
    last: Arc<DashMap<String, Instant>>,
    window: Duration,
}

impl RedirectThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            last: Arc::new(DashMap::new()),
            window,
        }
    }

    /// Claim the right to redirect `scope` now
    pub fn allow(&self, scope: &str) -> bool {
        let now = Instant::now();
        match self.last.entry(scope.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.window {
                    return false;
                }
                entry.insert(now);
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
            }
        }
        true
    }

    /// Drop entries older than the window
    pub fn prune(&self) {
        let window = self.window;
        self.last.retain(|_, at| at.elapsed() < window);
    }
}

/// Render-blocking credential guard for one mounted page
pub struct PresenceGate {
    store: Arc<dyn CredentialStore>,
    selector: ProviderSelector,
    client: AuthenticatedClient,
    routes: GateRoutes,
    throttle: RedirectThrottle,
    state: GateState,
    path: Option<String>,

    /// At most one redirect per mount
    redirected: bool,
}

impl PresenceGate {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        selector: ProviderSelector,
        client: AuthenticatedClient,
        routes: GateRoutes,
        throttle: RedirectThrottle,
    ) -> Self {
        Self {
            store,
            selector,
            client,
            routes,
            throttle,
            state: GateState::Checking,
            path: None,
            redirected: false,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// First check for a freshly mounted page
    pub async fn mount(&mut self, path: &str) -> GateOutcome {
        self.path = Some(path.to_string());
        self.redirected = false;
        self.check().await
    }

    /// Re-check on route change; a new route re-arms the redirect
    pub async fn navigate(&mut self, path: &str) -> GateOutcome {
        if self.path.as_deref() != Some(path) {
            self.redirected = false;
            self.path = Some(path.to_string());
        }
        self.check().await
    }

    async fn check(&mut self) -> GateOutcome {
        self.state = GateState::Checking;

        match self.verify().await {
            Ok(()) => {
                self.state = GateState::Authorized;
                GateOutcome::Authorized
            }
            Err(e) => {
                self.state = GateState::Unauthorized;
                tracing::info!(
                    path = self.path.as_deref().unwrap_or(""),
                    reason = e.error_code(),
                    "Gate denied access: {}",
                    e
                );
                self.redirect(&e)
            }
        }
    }

    async fn verify(&self) -> Result<(), AuthError> {
        let key = self.selector.active_key().await;

        let raw = match self.store.get(&key).await {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Err(AuthError::NoCredentials),
        };

        if let Err(e) = store::parse_pair(&raw) {
            // Corrupt records are removed so the next login starts clean
            if !self.store.delete(&key).await {
                tracing::warn!(key = %key, "Failed to delete corrupt credential record");
            }
            return Err(e);
        }

        self.client.validate().await
    }

    fn redirect(&mut self, error: &AuthError) -> GateOutcome {
        let path = self.path.as_deref().unwrap_or(&self.routes.landing_path);
        let context = RedirectContext::new(path, error.error_code(), &self.routes);

        if self.redirected || !self.throttle.allow(self.store.namespace()) {
            tracing::debug!("Redirect already fired, suppressing");
            return GateOutcome::Suppressed { context };
        }

        self.redirected = true;
        GateOutcome::Redirect {
            url: context.to_url(&self.routes.login_path),
            context,
        }
    }
}
