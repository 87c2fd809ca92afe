//! Deadline bookkeeping for polling consume loops.

use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Default sleep between unsuccessful claims on a polling queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default sleep between unsuccessful claims on a reply channel.
pub const DEFAULT_REPLY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tracks the deadline of one consume call.
///
/// Loops claim without pausing while work is available and call
/// [`PollTimer::idle`] after an empty claim. The idle sleep never runs past
/// the deadline.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollTimer {
    deadline: Instant,
    interval: Duration,
}

impl PollTimer {
    pub(crate) fn start(timeout: Duration, interval: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            interval,
        }
    }

    pub(crate) fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Sleep for one poll interval, clamped to the deadline.
    ///
    /// Returns `false` once the deadline has been reached.
    pub(crate) async fn idle(&self) -> bool {
        let now = Instant::now();
        if now >= self.deadline {
            return false;
        }
        let remaining = self.deadline - now;
        sleep(self.interval.min(remaining)).await;
        !self.expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_idle_loop_stops_at_deadline() {
        let started = Instant::now();
        let timer = PollTimer::start(Duration::from_secs(1), Duration::from_millis(100));

        let mut polls = 0;
        loop {
            polls += 1;
            if !timer.idle().await {
                break;
            }
        }

        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(polls, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_is_clamped_to_deadline() {
        let started = Instant::now();
        let timer = PollTimer::start(Duration::from_millis(250), Duration::from_secs(5));

        assert!(!timer.idle().await);
        assert_eq!(started.elapsed(), Duration::from_millis(250));
        assert!(timer.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_is_expired_immediately() {
        let timer = PollTimer::start(Duration::ZERO, DEFAULT_POLL_INTERVAL);
        assert!(timer.expired());
        assert!(!timer.idle().await);
    }
}
