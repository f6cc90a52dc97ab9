//! Shared-secret access key embedded in the published URL.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use subtle::ConstantTimeEq;

/// Length of a generated access key.
pub const ACCESS_KEY_LENGTH: usize = 16;

/// Secret required as the `key` query parameter on every request.
///
/// Keys are drawn from the 62-symbol alphanumeric alphabet using the
/// operating system's CSPRNG. A new key is generated for every server start.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessKey(String);

impl AccessKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let key: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(ACCESS_KEY_LENGTH)
            .map(char::from)
            .collect();
        Self(key)
    }

    /// Returns the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compares `candidate` against this key in constant time.
    ///
    /// Only the length of the candidate can influence timing.
    pub fn matches(&self, candidate: &str) -> bool {
        let expected = self.0.as_bytes();
        let candidate = candidate.as_bytes();
        candidate.len() == expected.len() && bool::from(candidate.ct_eq(expected))
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessKey(<redacted>)")
    }
}

#[cfg(test)]
impl From<&str> for AccessKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}
