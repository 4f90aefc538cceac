//! Engine time source.

use std::time::Duration;
use taskmill_core::Time;
use tokio::time::Instant;

/// Wall-clock timestamps advanced by the tokio clock.
///
/// The wall time is sampled once; after that `now()` moves with
/// [`tokio::time::Instant`], so a paused test runtime controls both the
/// control loop and every recorded timestamp.
#[derive(Debug, Clone, Copy)]
pub struct EngineClock {
    wall_origin: Time,
    origin: Instant,
}

impl EngineClock {
    /// Clock anchored at the current wall time.
    pub fn new() -> Self {
        Self::starting_at(chrono::Utc::now())
    }

    /// Clock anchored at `wall_origin`.
    pub fn starting_at(wall_origin: Time) -> Self {
        Self {
            wall_origin,
            origin: Instant::now(),
        }
    }

    /// Current time.
    pub fn now(&self) -> Time {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_origin + elapsed
    }

    /// `at + delay`.
    pub fn after(at: Time, delay: Duration) -> Time {
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| at.checked_add_signed(d))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
    }

    /// Time from `earlier` to `later`, zero if negative.
    pub fn between(earlier: Time, later: Time) -> Duration {
        (later - earlier).to_std().unwrap_or_default()
    }
}

impl Default for EngineClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let start = chrono::Utc::now();
        let clock = EngineClock::starting_at(start);

        tokio::time::advance(Duration::from_secs(90)).await;

        let now = clock.now();
        assert_eq!(EngineClock::between(start, now), Duration::from_secs(90));
        assert_eq!(EngineClock::between(now, start), Duration::ZERO);
        assert_eq!(EngineClock::after(start, Duration::from_secs(90)), now);
    }
}
