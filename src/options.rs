use std::time::Duration;

use crate::error::LockError;
use crate::token::DEFAULT_TOKEN_LENGTH;

/// Tuning knobs for a [`LockManager`](crate::LockManager).
///
/// The defaults match the classic quorum-lock parameters; a manager
/// validates its options once at construction time.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Fraction of the TTL reserved to absorb clock drift between
    /// servers, subtracted from the apparent validity of every grant.
    /// Must lie within `0.0..=0.1`.
    pub drift_factor: f64,
    /// Fixed pause between acquisition attempts.
    pub retry_delay: Duration,
    /// Upper bound of the uniform random jitter added to
    /// `retry_delay` before each retry.
    pub retry_jitter: Duration,
    /// Number of retries after the initial attempt.
    pub max_retry_attempts: u32,
    /// Number of base64 characters in each ownership token. Must be
    /// positive.
    pub token_length: usize,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions {
            drift_factor: 0.01,
            retry_delay: Duration::from_millis(200),
            retry_jitter: Duration::from_millis(100),
            max_retry_attempts: 3,
            token_length: DEFAULT_TOKEN_LENGTH,
        }
    }
}

impl LockOptions {
    pub(crate) fn validate(&self) -> Result<(), LockError> {
        if !self.drift_factor.is_finite() || !(0.0..=0.1).contains(&self.drift_factor) {
            return Err(LockError::InvalidParameter(format!(
                "drift factor must lie within 0.0..=0.1, got {}",
                self.drift_factor
            )));
        }
        if self.token_length == 0 {
            return Err(LockError::InvalidParameter(
                "token length must be a positive integer".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = LockOptions::default();
        assert_eq!(options.drift_factor, 0.01);
        assert_eq!(options.retry_delay, Duration::from_millis(200));
        assert_eq!(options.retry_jitter, Duration::from_millis(100));
        assert_eq!(options.max_retry_attempts, 3);
        assert_eq!(options.token_length, 22);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn accepts_drift_factor_bounds() {
        for drift_factor in [0.0, 0.05, 0.1] {
            let options = LockOptions {
                drift_factor,
                ..LockOptions::default()
            };
            assert!(options.validate().is_ok());
        }
    }

    #[test]
    fn rejects_out_of_range_drift_factor() {
        for drift_factor in [-0.01, 0.11, f64::NAN, f64::INFINITY] {
            let options = LockOptions {
                drift_factor,
                ..LockOptions::default()
            };
            assert!(matches!(
                options.validate(),
                Err(LockError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn rejects_zero_token_length() {
        let options = LockOptions {
            token_length: 0,
            ..LockOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(LockError::InvalidParameter(_))
        ));
    }
}
