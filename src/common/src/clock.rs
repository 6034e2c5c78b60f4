//! Time source for the pipelines.
//!
//! Everything that waits or reads the wall clock goes through [`Clock`], so
//! tests can drive batch windows, poll intervals and backoff sleeps with a
//! [`ManualClock`] instead of real time.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;

/// A pending [`Clock::sleep`]
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Complete once `duration` has passed on this clock.
    ///
    /// The deadline is fixed when this is called, not when the returned
    /// future is first polled.
    fn sleep(&self, duration: Duration) -> Sleep;

    /// Current time as unix nanoseconds, the unit records use for dates.
    fn unix_nanos(&self) -> i64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }

    /// Time elapsed since `earlier`, saturating at zero.
    fn since(&self, earlier: SystemTime) -> Duration {
        self.now().duration_since(earlier).unwrap_or_default()
    }
}

/// Real time, backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// A clock that only moves when [`ManualClock::advance`] is called.
///
/// Sleepers wake as soon as the accumulated advance reaches their deadline.
#[derive(Debug)]
pub struct ManualClock {
    start: SystemTime,
    elapsed: watch::Sender<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        let (elapsed, _) = watch::channel(Duration::ZERO);
        Self { start, elapsed }
    }

    /// Move time forward, waking every sleeper whose deadline has passed.
    pub fn advance(&self, by: Duration) {
        self.elapsed.send_modify(|elapsed| *elapsed += by);
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.borrow()
    }

    /// Number of sleeps currently waiting on this clock.
    pub fn pending_sleeps(&self) -> usize {
        self.elapsed.receiver_count()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        self.start + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let mut rx = self.elapsed.subscribe();
        let deadline = *rx.borrow_and_update() + duration;
        Box::pin(async move {
            loop {
                if *rx.borrow_and_update() >= deadline {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::timeout;

    #[test]
    fn test_unix_nanos() {
        let clock = ManualClock::new(UNIX_EPOCH + Duration::from_nanos(42));
        assert_eq!(clock.unix_nanos(), 42);

        clock.advance(Duration::from_nanos(8));
        assert_eq!(clock.unix_nanos(), 50);
    }

    #[test]
    fn test_since_saturates() {
        let clock = ManualClock::default();
        let later = clock.now() + Duration::from_secs(5);
        assert_eq!(clock.since(later), Duration::ZERO);

        let earlier = clock.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.since(earlier), Duration::from_millis(250));
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn test_manual_sleep_waits_for_advance() {
        let clock = Arc::new(ManualClock::default());

        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep(Duration::from_millis(10)).await })
        };

        while clock.pending_sleeps() == 0 {
            tokio::task::yield_now().await;
        }

        clock.advance(Duration::from_millis(5));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_millis(5));
        sleeper.await.unwrap();
        assert_eq!(clock.pending_sleeps(), 0);
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn test_sleep_deadline_is_fixed_when_created() {
        let clock = ManualClock::default();
        let sleep = clock.sleep(Duration::from_millis(10));
        assert_eq!(clock.pending_sleeps(), 1);

        // Time passes before the sleep is first polled.
        clock.advance(Duration::from_millis(10));
        sleep.await;
        assert_eq!(clock.pending_sleeps(), 0);
    }

    #[tokio::test]
    async fn test_zero_sleep_returns_immediately() {
        let clock = ManualClock::default();
        clock.sleep(Duration::ZERO).await;
    }

    #[tokio::test]
    async fn test_system_clock_sleeps() {
        let clock = SystemClock;
        let before = std::time::Instant::now();
        clock.sleep(Duration::from_millis(5)).await;
        assert!(before.elapsed() >= Duration::from_millis(5));
    }
}
