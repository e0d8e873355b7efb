//! Engine configuration.
//!
//! All knobs are validated at set time: a value outside its allowed range
//! is silently replaced by the default, so a constructed [`Config`] is
//! always usable and never consulted for validity again.

use std::ops::RangeInclusive;

use chrono::Duration;

const DEFAULT_TOKEN_LENGTH: usize = 24;
const TOKEN_LENGTH_RANGE: RangeInclusive<usize> = 16..=64;

const DEFAULT_SESSION_TTL_SECONDS: i64 = 30 * 60;
const SESSION_TTL_RANGE: RangeInclusive<i64> = 5 * 60..=24 * 60 * 60;

const DEFAULT_VERIFY_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;
const VERIFY_TOKEN_TTL_RANGE: RangeInclusive<i64> = 30 * 60..=72 * 60 * 60;

const DEFAULT_VERIFY_COOLDOWN_SECONDS: i64 = 5 * 60;
const VERIFY_COOLDOWN_RANGE: RangeInclusive<i64> = 60..=15 * 60;

const DEFAULT_CHANGE_EMAIL_TOKEN_TTL_SECONDS: i64 = 3 * 60 * 60;
const CHANGE_EMAIL_TOKEN_TTL_RANGE: RangeInclusive<i64> = 15 * 60..=24 * 60 * 60;

const DEFAULT_RESET_TOKEN_TTL_SECONDS: i64 = 3 * 60 * 60;
const RESET_TOKEN_TTL_RANGE: RangeInclusive<i64> = 15 * 60..=24 * 60 * 60;

/// Immutable engine configuration.
///
/// The per-account session cap is fixed at
/// [`crate::session::SESSION_CAP`] and is deliberately not a knob.
#[derive(Clone, Debug)]
pub struct Config {
    token_length: usize,
    session_ttl_seconds: i64,
    verify_token_ttl_seconds: i64,
    verify_cooldown_seconds: i64,
    change_email_token_ttl_seconds: i64,
    reset_token_ttl_seconds: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self {
            token_length: DEFAULT_TOKEN_LENGTH,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            verify_token_ttl_seconds: DEFAULT_VERIFY_TOKEN_TTL_SECONDS,
            verify_cooldown_seconds: DEFAULT_VERIFY_COOLDOWN_SECONDS,
            change_email_token_ttl_seconds: DEFAULT_CHANGE_EMAIL_TOKEN_TTL_SECONDS,
            reset_token_ttl_seconds: DEFAULT_RESET_TOKEN_TTL_SECONDS,
        }
    }

    /// Length of generated bearer and single-use tokens (16..=64).
    #[must_use]
    pub fn with_token_length(mut self, length: usize) -> Self {
        self.token_length = clamp_or_default(length, TOKEN_LENGTH_RANGE, DEFAULT_TOKEN_LENGTH);
        self
    }

    /// Session lifetime in seconds (5 minutes..=24 hours).
    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds =
            clamp_or_default(seconds, SESSION_TTL_RANGE, DEFAULT_SESSION_TTL_SECONDS);
        self
    }

    /// Verification token lifetime in seconds (30 minutes..=72 hours).
    #[must_use]
    pub fn with_verify_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.verify_token_ttl_seconds = clamp_or_default(
            seconds,
            VERIFY_TOKEN_TTL_RANGE,
            DEFAULT_VERIFY_TOKEN_TTL_SECONDS,
        );
        self
    }

    /// Cool-down between verification token issuances (1..=15 minutes).
    #[must_use]
    pub fn with_verify_cooldown_seconds(mut self, seconds: i64) -> Self {
        self.verify_cooldown_seconds = clamp_or_default(
            seconds,
            VERIFY_COOLDOWN_RANGE,
            DEFAULT_VERIFY_COOLDOWN_SECONDS,
        );
        self
    }

    /// Change-email token lifetime in seconds (15 minutes..=24 hours).
    #[must_use]
    pub fn with_change_email_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.change_email_token_ttl_seconds = clamp_or_default(
            seconds,
            CHANGE_EMAIL_TOKEN_TTL_RANGE,
            DEFAULT_CHANGE_EMAIL_TOKEN_TTL_SECONDS,
        );
        self
    }

    /// Password-reset token lifetime in seconds (15 minutes..=24 hours).
    #[must_use]
    pub fn with_reset_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.reset_token_ttl_seconds = clamp_or_default(
            seconds,
            RESET_TOKEN_TTL_RANGE,
            DEFAULT_RESET_TOKEN_TTL_SECONDS,
        );
        self
    }

    #[must_use]
    pub fn token_length(&self) -> usize {
        self.token_length
    }

    pub(crate) fn session_ttl(&self) -> Duration {
        Duration::seconds(self.session_ttl_seconds)
    }

    pub(crate) fn verify_token_ttl(&self) -> Duration {
        Duration::seconds(self.verify_token_ttl_seconds)
    }

    pub(crate) fn verify_cooldown(&self) -> Duration {
        Duration::seconds(self.verify_cooldown_seconds)
    }

    pub(crate) fn change_email_token_ttl(&self) -> Duration {
        Duration::seconds(self.change_email_token_ttl_seconds)
    }

    pub(crate) fn reset_token_ttl(&self) -> Duration {
        Duration::seconds(self.reset_token_ttl_seconds)
    }
}

fn clamp_or_default<T: PartialOrd>(value: T, range: RangeInclusive<T>, default: T) -> T {
    if range.contains(&value) {
        value
    } else {
        default
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use chrono::Duration;

    #[test]
    fn defaults() {
        let config = Config::new();
        assert_eq!(config.token_length(), 24);
        assert_eq!(config.session_ttl(), Duration::minutes(30));
        assert_eq!(config.verify_token_ttl(), Duration::hours(24));
        assert_eq!(config.verify_cooldown(), Duration::minutes(5));
        assert_eq!(config.change_email_token_ttl(), Duration::hours(3));
        assert_eq!(config.reset_token_ttl(), Duration::hours(3));
    }

    #[test]
    fn in_range_values_stick() {
        let config = Config::new()
            .with_token_length(32)
            .with_session_ttl_seconds(60 * 60)
            .with_verify_cooldown_seconds(2 * 60);
        assert_eq!(config.token_length(), 32);
        assert_eq!(config.session_ttl(), Duration::hours(1));
        assert_eq!(config.verify_cooldown(), Duration::minutes(2));
    }

    #[test]
    fn out_of_range_values_fall_back_to_defaults() {
        let config = Config::new()
            .with_token_length(4)
            .with_session_ttl_seconds(1)
            .with_verify_token_ttl_seconds(0)
            .with_verify_cooldown_seconds(3600)
            .with_change_email_token_ttl_seconds(-5)
            .with_reset_token_ttl_seconds(i64::MAX);
        assert_eq!(config.token_length(), 24);
        assert_eq!(config.session_ttl(), Duration::minutes(30));
        assert_eq!(config.verify_token_ttl(), Duration::hours(24));
        assert_eq!(config.verify_cooldown(), Duration::minutes(5));
        assert_eq!(config.change_email_token_ttl(), Duration::hours(3));
        assert_eq!(config.reset_token_ttl(), Duration::hours(3));
    }
}
