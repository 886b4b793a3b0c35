//! Credential generation from the operating system's entropy source.
//!
//! Every token is an independent draw: keyspace suffixes, usernames and
//! passwords never derive from one another.

use thiserror::Error;

/// Bytes drawn for each generated identifier or secret.
pub const TOKEN_BYTES: usize = 10;

/// The OS entropy source could not be read.
///
/// Nothing can be provisioned without it, so callers treat this as a
/// process-level fault rather than a per-request failure.
#[derive(Debug, Error)]
#[error("entropy source unavailable: {0}")]
pub struct EntropyError(String);

/// Fill a fresh buffer of `len` bytes from the OS CSPRNG.
pub fn bytes(len: usize) -> Result<Vec<u8>, EntropyError> {
    let mut buf = vec![0u8; len];
    getrandom::getrandom(&mut buf).map_err(|e| EntropyError(e.to_string()))?;
    Ok(buf)
}

/// Lowercase hex token of `2 * len` characters.
pub fn token(len: usize) -> Result<String, EntropyError> {
    Ok(hex::encode(bytes(len)?))
}

/// Draw once so a broken entropy source is caught before serving requests.
pub fn probe() -> Result<(), EntropyError> {
    bytes(1).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn token_is_lowercase_hex_of_double_length() {
        let t = token(TOKEN_BYTES).unwrap();
        assert_eq!(t.len(), 2 * TOKEN_BYTES);
        assert!(t.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn zero_length_token_is_empty() {
        assert_eq!(token(0).unwrap(), "");
    }

    #[test]
    fn tokens_do_not_repeat() {
        let drawn: HashSet<String> = (0..1000).map(|_| token(TOKEN_BYTES).unwrap()).collect();
        assert_eq!(drawn.len(), 1000);
    }

    #[test]
    fn every_byte_value_is_reachable() {
        // A biased generator that never yields 0xff would fail this.
        let mut seen = [false; 256];
        for _ in 0..64 {
            for b in bytes(1024).unwrap() {
                seen[b as usize] = true;
            }
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn probe_succeeds() {
        probe().unwrap();
    }
}
