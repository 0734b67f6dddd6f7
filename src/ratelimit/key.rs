//! Store key generation.

use super::limit::Algorithm;

/// Default namespace for all rate limit keys.
pub const DEFAULT_PREFIX: &str = "limiter";

/// A key that uniquely identifies one algorithm's state for a logical key.
///
/// The algorithm name is part of the key so the same logical key used under
/// two algorithms never shares state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    /// Namespace shared by every key of one limiter
    pub prefix: String,
    /// The algorithm whose state lives under this key
    pub algorithm: Algorithm,
    /// The caller's logical key
    pub key: String,
}

impl StoreKey {
    pub fn new(prefix: &str, algorithm: Algorithm, key: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            algorithm,
            key: key.to_string(),
        }
    }

    /// Render as `{prefix}:{algorithm}:{key}`.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}:{}", self.prefix, self.algorithm.name(), self.key)
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
