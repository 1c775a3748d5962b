//! Shared pacing gate for external search queries
//!
//! The NVD API allows roughly one request per 6 seconds without an API key
//! and one per 0.6 seconds with one. A single gate instance is shared by
//! every resolution in flight, so external traffic stays paced no matter
//! how many callers are active.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Minimum spacing between queries without an NVD API key.
pub const UNAUTHENTICATED_DELAY: Duration = Duration::from_secs(6);
/// Minimum spacing between queries with an NVD API key.
pub const AUTHENTICATED_DELAY: Duration = Duration::from_millis(600);

pub struct RateGate {
    min_delay: Duration,
    last_dispatch: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_dispatch: Mutex::new(None),
        }
    }

    /// Pick the pacing mode once at startup from credential presence.
    pub fn for_credential(authenticated: bool) -> Self {
        if authenticated {
            Self::new(AUTHENTICATED_DELAY)
        } else {
            Self::new(UNAUTHENTICATED_DELAY)
        }
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Block until at least `min_delay` has elapsed since the previous
    /// `acquire` returned. The mutex is held across the pacing sleep, which
    /// serializes concurrent callers: two resolutions in flight still space
    /// their external queries by the configured minimum.
    pub async fn acquire(&self) {
        let mut last = self.last_dispatch.lock().await;

        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_delay {
                let wait = self.min_delay - elapsed;
                debug!("Rate gate pacing: waiting {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }

        *last = Some(Instant::now());
    }
}
