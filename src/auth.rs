//! Shared-token authentication for control sessions.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Domain-separation context mixed into every token tag.
const TAG_CONTEXT: &[u8] = b"porthole control auth v1";

/// Validates presented tokens against a configured allowlist.
///
/// Tokens are never stored in the clear: each configured token is reduced to
/// an HMAC tag keyed by its SHA-256 digest, and membership checks compare
/// tags in constant time. An empty allowlist accepts every token.
pub struct Authenticator {
    tags: Vec<Vec<u8>>,
}

impl Authenticator {
    /// Build an authenticator from the configured token list.
    ///
    /// ```
    /// use porthole::auth::Authenticator;
    ///
    /// let auth = Authenticator::new(&["secret".to_string()]);
    /// assert!(auth.validate("secret"));
    /// assert!(!auth.validate("wrong"));
    /// ```
    pub fn new(tokens: &[String]) -> Self {
        let tags = tokens
            .iter()
            .map(|token| token_mac(token).finalize().into_bytes().to_vec())
            .collect();
        Self { tags }
    }

    /// Whether the allowlist is empty, meaning all clients are accepted.
    pub fn is_open(&self) -> bool {
        self.tags.is_empty()
    }

    /// Check a presented token against the allowlist.
    pub fn validate(&self, token: &str) -> bool {
        if self.is_open() {
            return true;
        }
        let mac = token_mac(token);
        self.tags
            .iter()
            .any(|tag| mac.clone().verify_slice(tag).is_ok())
    }

    /// Short digest of a token, safe to put in logs.
    pub fn fingerprint(token: &str) -> String {
        hex::encode(&Sha256::digest(token.as_bytes())[..4])
    }
}

fn token_mac(token: &str) -> HmacSha256 {
    // Hash the token first so weak tokens still yield a uniform key.
    let key = Sha256::new().chain_update(token.as_bytes()).finalize();
    let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC can take key of any size");
    mac.update(TAG_CONTEXT);
    mac
}
