//! Accept-loop back-off for the TCP server transport.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{config::ConnectionString, error::ConfigError};

/// Delay before the first retry after a failed `accept()`.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(10);
/// Ceiling for the doubled delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(1);

const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Wait schedule for a listener whose `accept()` keeps failing.
///
/// Each consecutive failure doubles the wait, up to `max_delay`; an accepted
/// peer resets it. Server connection strings override both bounds with
/// `backoff_ms` and `backoff_max_ms`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Wait after the first failure.
    pub initial_delay: Duration,
    /// Longest wait between attempts.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_BACKOFF,
            max_delay: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl BackoffConfig {
    /// Read `backoff_ms` and `backoff_max_ms` from `cs`, falling back to the
    /// defaults, and normalise the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidInteger`] when a value is not a
    /// millisecond count.
    pub fn from_connection_string(cs: &ConnectionString) -> Result<Self, ConfigError> {
        let millis = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
            Ok(Duration::from_millis(cs.get_int(key, default)?))
        };
        Ok(Self {
            initial_delay: millis("backoff_ms", DEFAULT_INITIAL_BACKOFF)?,
            max_delay: millis("backoff_max_ms", DEFAULT_MAX_BACKOFF)?,
        }
        .normalized())
    }

    /// Raise both bounds to at least a millisecond and put the smaller one
    /// first.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use linkroute::transport::BackoffConfig;
    ///
    /// let cfg = BackoffConfig {
    ///     initial_delay: Duration::from_millis(250),
    ///     max_delay: Duration::from_millis(40),
    /// }
    /// .normalized();
    /// assert_eq!(cfg.initial_delay, Duration::from_millis(40));
    /// assert_eq!(cfg.max_delay, Duration::from_millis(250));
    /// ```
    #[must_use]
    pub fn normalized(self) -> Self {
        let a = self.initial_delay.max(MIN_BACKOFF);
        let b = self.max_delay.max(MIN_BACKOFF);
        Self {
            initial_delay: a.min(b),
            max_delay: a.max(b),
        }
    }

    /// Wait that follows a failed attempt which itself waited `current`.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration { current.saturating_mul(2).min(self.max_delay) }
}
