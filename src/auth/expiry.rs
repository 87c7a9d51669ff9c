// Token expiry policy

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use super::codec;

/// Default safety margin before the real expiry (milliseconds)
pub const DEFAULT_EXPIRY_BUFFER_MS: i64 = 30_000;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a fixed instant
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

#[cfg(any(test, feature = "test-utils"))]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Decides whether a token can still be sent
#[derive(Clone)]
pub struct ExpiryPolicy {
    clock: Arc<dyn Clock>,
    buffer: Duration,
}

impl ExpiryPolicy {
    pub fn new(clock: Arc<dyn Clock>, buffer_ms: i64) -> Self {
        Self {
            clock,
            buffer: Duration::milliseconds(buffer_ms),
        }
    }

    /// Policy on the wall clock with the default buffer
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock), DEFAULT_EXPIRY_BUFFER_MS)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// True once `now >= exp - buffer`. Undecodable tokens count as expired.
    pub fn is_expired(&self, token: &str) -> bool {
        let claims = match codec::decode(token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::debug!("Treating token as expired: {}", e);
                return true;
            }
        };

        let now_ms = self.clock.now().timestamp_millis();
        let exp_ms = claims.exp.saturating_mul(1000);
        now_ms >= exp_ms.saturating_sub(self.buffer.num_milliseconds())
    }
}
