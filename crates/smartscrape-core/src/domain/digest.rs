//! SHA-256 digests of script source text.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of a revision's source text.
///
/// Two revisions with the same digest are byte-identical, which is what the
/// no-progress check relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceDigest(String);

impl SourceDigest {
    /// Compute the digest of `source`.
    pub fn of(source: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        SourceDigest(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars), for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for SourceDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_and_hex() {
        let a = SourceDigest::of("def scrape(url):\n    return []\n");
        let b = SourceDigest::of("def scrape(url):\n    return []\n");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn test_whitespace_changes_digest() {
        assert_ne!(SourceDigest::of("x = 1"), SourceDigest::of("x = 1 "));
    }
}
