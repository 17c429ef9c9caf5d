use std::time::Duration;

/// Exponential backoff for the push channel: `min(base * 2^attempt, cap)`,
/// giving up after `max_attempts` consecutive failed reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Hold time asked of the server for each long poll.
    pub poll_hold: Duration,
    /// Fixed pause after a failed poll before the next attempt.
    pub poll_retry_backoff: Duration,
    pub reconnect: ReconnectPolicy,
    /// Feature toggle for the calendar push channel.
    pub calendar_push: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_hold: Duration::from_secs(25),
            poll_retry_backoff: Duration::from_millis(1_200),
            reconnect: ReconnectPolicy::default(),
            calendar_push: true,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; unset or unparsable
    /// values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let poll_hold = number("CONSOLE_POLL_HOLD_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_hold);
        let poll_retry_backoff = number("CONSOLE_POLL_RETRY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_retry_backoff);
        let reconnect = ReconnectPolicy {
            base: number("CONSOLE_PUSH_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect.base),
            cap: number("CONSOLE_PUSH_CAP_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect.cap),
            max_attempts: number("CONSOLE_PUSH_MAX_ATTEMPTS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.reconnect.max_attempts),
        };
        let calendar_push = lookup("CONSOLE_CALENDAR_PUSH")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
            .unwrap_or(defaults.calendar_push);

        Self {
            poll_hold,
            poll_retry_backoff,
            reconnect,
            calendar_push,
        }
    }
}
