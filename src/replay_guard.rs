//! Replay protection
//!
//! A request timestamp is accepted only inside a symmetric window around
//! the current time, which rejects both stale and future-dated requests.

use std::time::Duration;

use crate::error::AuthError;

pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
pub struct ReplayGuard {
    window_secs: i64,
}

impl ReplayGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window_secs: window.as_secs().min(i64::MAX as u64) as i64,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs as u64)
    }

    /// Parse `header` as epoch seconds and check it against `now`.
    ///
    /// Returns the parsed timestamp on success.
    pub fn check(&self, header: &str, now: i64) -> Result<i64, AuthError> {
        let timestamp: i64 = header
            .trim()
            .parse()
            .map_err(|_| AuthError::InvalidTimestamp)?;

        let skew = now.checked_sub(timestamp).map(i64::unsigned_abs);
        match skew {
            Some(skew) if skew <= self.window_secs as u64 => Ok(timestamp),
            _ => Err(AuthError::ExpiredTimestamp),
        }
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_WINDOW)
    }
}
