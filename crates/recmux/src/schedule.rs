//! Deferred stop scheduling.

use tokio::time::{Duration, Instant, sleep_until};

/// A worker's scheduled-stop deadline.
///
/// At most one deadline is armed at a time; arming again replaces the
/// previous one. The schedule is owned by its worker task and polled as
/// one arm of the task's event loop, so expiry can never race an
/// explicit command: whichever is applied first wins and the loser
/// becomes a no-op.
#[derive(Debug, Default)]
pub struct StopSchedule {
    deadline: Option<Instant>,
}

impl StopSchedule {
    /// Upper bound on a scheduled delay, roughly a century. Anything
    /// larger is effectively "never" and cannot overflow the platform
    /// `Instant` when added to now.
    pub const MAX_DELAY_SECS: u64 = 60 * 60 * 24 * 365 * 100;

    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Arm (or re-arm) the deadline `secs` from now.
    ///
    /// Delays too large to represent as an `Instant` are clamped to
    /// [`Self::MAX_DELAY_SECS`] rather than overflowing.
    pub fn arm(&mut self, secs: u64) {
        let delay = Duration::from_secs(secs.min(Self::MAX_DELAY_SECS));
        let now = Instant::now();
        self.deadline = Some(now.checked_add(delay).unwrap_or(now));
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolve when the armed deadline passes. Pending forever while
    /// disarmed; `select!` callers gate this arm on [`Self::is_armed`].
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disarmed() {
        let schedule = StopSchedule::new();
        assert!(!schedule.is_armed());
    }

    #[test]
    fn disarm_clears_the_deadline() {
        let mut schedule = StopSchedule::new();
        schedule.arm(10);
        assert!(schedule.is_armed());
        schedule.disarm();
        assert!(!schedule.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn expires_at_the_armed_deadline() {
        let mut schedule = StopSchedule::new();
        let started = Instant::now();
        schedule.arm(5);
        schedule.expired().await;
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_previous_deadline() {
        let mut schedule = StopSchedule::new();
        let started = Instant::now();
        schedule.arm(1);
        schedule.arm(3);
        schedule.expired().await;
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_schedule_never_expires() {
        let schedule = StopSchedule::new();
        let result =
            tokio::time::timeout(Duration::from_secs(60), schedule.expired()).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn maximum_delay_arms_without_overflow() {
        // STOP_AFTER accepts any u64; arming must clamp, not panic.
        let mut schedule = StopSchedule::new();
        schedule.arm(u64::MAX);
        assert!(schedule.is_armed());

        let result =
            tokio::time::timeout(Duration::from_secs(3600), schedule.expired()).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_seconds_expires_immediately() {
        let mut schedule = StopSchedule::new();
        schedule.arm(0);
        tokio::time::timeout(Duration::from_millis(1), schedule.expired())
            .await
            .unwrap();
    }
}
