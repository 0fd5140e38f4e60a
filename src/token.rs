use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::{thread_rng, RngCore};

use crate::error::LockError;

/// Default number of base64 characters in an ownership token. 22
/// characters carry ~128 bits of entropy.
pub(crate) const DEFAULT_TOKEN_LENGTH: usize = 22;

/// Generate a fresh ownership token of exactly `length` URL-safe
/// base64 characters from the thread-local cryptographic RNG.
///
/// Every acquisition attempt, including each retry, gets its own
/// token; tokens are never reused.
pub(crate) fn generate_token(length: usize) -> Result<String, LockError> {
    if length == 0 {
        return Err(LockError::InvalidParameter(
            "token length must be a positive integer".into(),
        ));
    }

    // ceil(length * 3 / 4) raw bytes encode to at least `length` characters.
    let mut raw = vec![0u8; (length * 3).div_ceil(4)];
    thread_rng().fill_bytes(&mut raw);

    let mut token = URL_SAFE_NO_PAD.encode(&raw);
    token.truncate(length);
    Ok(token)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn generates_exact_length() {
        for length in [1, 2, 21, DEFAULT_TOKEN_LENGTH, 43, 64] {
            assert_eq!(generate_token(length).unwrap().len(), length);
        }
    }

    #[test]
    fn rejects_zero_length() {
        assert!(matches!(
            generate_token(0),
            Err(LockError::InvalidParameter(_))
        ));
    }

    #[test]
    fn stays_in_url_safe_alphabet() {
        let token = generate_token(256).unwrap();
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn no_collisions_over_ten_thousand_draws() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(generate_token(DEFAULT_TOKEN_LENGTH).unwrap()));
        }
    }
}
