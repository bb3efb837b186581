//! An injectable clock so timers, ping timeouts, and quarantine
//! windows can be driven by `tokio::time::pause`/`advance` in tests
//! instead of real wall-clock sleeps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Abstracts "now" and "sleep" so the rest of the core never calls
/// `chrono::Utc::now()` or `tokio::time::sleep` directly.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, dur: Duration) -> futures_sleep::BoxSleep;
}

/// The production clock: real time, backed by `tokio::time::sleep` so
/// it still cooperates with `tokio::time::pause`/`advance` in tests
/// that want virtual time without swapping in a different `Clock`
/// impl.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, dur: Duration) -> futures_sleep::BoxSleep {
        Box::pin(tokio::time::sleep(dur))
    }
}

/// A shared handle to whichever clock the master was configured with.
pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Small module purely to keep the `BoxSleep` alias out of the trait
/// definition's line noise.
pub mod futures_sleep {
    use std::future::Future;
    use std::pin::Pin;

    pub type BoxSleep = Pin<Box<dyn Future<Output = ()> + Send>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_clock_now_is_monotonic_ish() {
        let clock = system_clock();
        let t1 = clock.now();
        clock.sleep(Duration::from_millis(5)).await;
        let t2 = clock.now();
        assert!(t2 >= t1);
    }
}
