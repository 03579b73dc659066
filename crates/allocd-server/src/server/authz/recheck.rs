use core::time::Duration;
use tokio::time::Instant;

/// Rate limit for re-running authorization on a long-lived stream.
///
/// A revoked capability is noticed at the first check after `period` has
/// elapsed since the last successful one, so in-flight streams may keep
/// serving for up to `period` after a revocation. Each stream owns its own
/// guard; the timestamp only moves forward.
#[derive(Clone, Debug)]
pub struct AuthRecheck {
    period: Duration,
    last_checked: Option<Instant>,
}

impl AuthRecheck {
    /// A guard that is due immediately.
    pub const fn new(period: Duration) -> Self {
        Self {
            period,
            last_checked: None,
        }
    }

    /// A guard whose first check already happened now.
    pub fn checked_now(period: Duration) -> Self {
        Self {
            period,
            last_checked: Some(Instant::now()),
        }
    }

    pub fn is_due(&self) -> bool {
        self.last_checked
            .is_none_or(|last| last.elapsed() >= self.period)
    }

    /// Records a successful check.
    pub fn mark_checked(&mut self) {
        let now = Instant::now();
        if self.last_checked.is_none_or(|last| now > last) {
            self.last_checked = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn due_once_per_period() {
        let period = Duration::from_secs(300);
        let mut guard = AuthRecheck::new(period);
        assert!(guard.is_due());

        guard.mark_checked();
        assert!(!guard.is_due());

        advance(Duration::from_secs(299)).await;
        assert!(!guard.is_due());

        advance(Duration::from_secs(1)).await;
        assert!(guard.is_due());
    }

    #[tokio::test(start_paused = true)]
    async fn checked_now_starts_a_window() {
        let guard = AuthRecheck::checked_now(Duration::from_secs(10));
        assert!(!guard.is_due());
        advance(Duration::from_secs(10)).await;
        assert!(guard.is_due());
    }
}
