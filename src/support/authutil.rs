//! Credential hashing helpers for HTTP Basic auth and API tokens.

use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Lowercase hex sha-256 of the given input.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Constant-time equality over two digest strings.
pub fn digest_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// The `Authorization` header value a charger will present once provisioned
/// with the given key.
pub fn basic_auth_header(charger_id: &str, key: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{charger_id}:{key}"));
    format!("Basic {encoded}")
}

/// Generate a new 16-character AuthorizationKey value.
pub fn gen_authorization_key() -> String {
    const CHARS: &[u8] =
        b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!#$%&*+-=?@_";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_stable_and_lowercase() {
        let digest = sha256_hex("Basic dGVzdDp0ZXN0");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, digest.to_lowercase());
        assert_eq!(digest, sha256_hex("Basic dGVzdDp0ZXN0"));
    }

    #[test]
    fn digest_compare() {
        let a = sha256_hex("a");
        assert!(digest_eq(&a, &a));
        assert!(!digest_eq(&a, &sha256_hex("b")));
        assert!(!digest_eq(&a, "short"));
    }

    #[test]
    fn generated_keys_have_fixed_length() {
        let key = gen_authorization_key();
        assert_eq!(key.len(), 16);
        assert_ne!(key, gen_authorization_key());
    }
}
