//! Agent identity and bearer token primitives.
//!
//! Agent IDs and tokens are opaque random strings; the server persists only
//! the SHA-256 digest of a token, never the plaintext.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Prefix carried by every agent ID.
pub const AGENT_ID_PREFIX: &str = "ag_";

/// Prefix carried by every bearer token.
pub const TOKEN_PREFIX: &str = "ocb_";

/// Generate a new agent ID: `ag_` followed by 12 random bytes in lowercase hex.
///
/// 96 bits of entropy make collisions negligible; should one ever occur, the
/// unique constraint on the store insert fails fast and the caller retries.
pub fn generate_agent_id() -> String {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    format!("{AGENT_ID_PREFIX}{}", hex::encode(bytes))
}

/// Generate a new bearer token and return `(plaintext, sha256_hash)`.
///
/// The plaintext is shown to the agent exactly once; only the hash is stored.
pub fn generate_token() -> (String, String) {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let token = format!("{TOKEN_PREFIX}{}", hex::encode(bytes));
    let hash = hash_token(&token);
    (token, hash)
}

/// SHA-256 hex digest of a token string.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn agent_id_shape() {
        let id = generate_agent_id();
        assert!(id.starts_with("ag_"));
        assert_eq!(id.len(), 3 + 24);
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn token_shape_and_hash() {
        let (token, hash) = generate_token();
        assert!(token.starts_with("ocb_"));
        assert_eq!(token.len(), 4 + 64);
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token(&token));
    }

    #[test]
    fn hash_is_deterministic() {
        let h1 = hash_token("same-token");
        let h2 = hash_token("same-token");
        assert_eq!(h1, h2);

        let h3 = hash_token("different-token");
        assert_ne!(h1, h3);
    }

    #[test]
    fn ids_and_tokens_do_not_repeat() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(generate_agent_id()));
            assert!(seen.insert(generate_token().0));
        }
    }
}
