//! Random opaque tokens.
//!
//! Session identifiers must be unguessable, and group records carry a random
//! opaque password token. Both are 256-bit CSPRNG values serialized as hex;
//! identifiers received back from clients are compared in constant time.

use std::fmt;

use subtle::ConstantTimeEq;

/// 256-bit random token.
///
/// - Generated via OS CSPRNG (`getrandom` crate)
/// - Compared with constant-time equality
/// - Serialized as lowercase hex (64 chars)
#[derive(Clone, Copy)]
pub struct SecretToken([u8; 32]);

impl SecretToken {
    /// Generate a new cryptographically random token.
    ///
    /// Returns an error if the OS CSPRNG is unavailable.
    pub fn generate() -> Result<Self, getrandom::Error> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes)?;
        Ok(SecretToken(bytes))
    }

    /// Encode the token as a lowercase hex string (64 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Constant-time equality comparison.
impl PartialEq for SecretToken {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SecretToken {}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log the actual token value
        f.write_str("SecretToken(***)")
    }
}

/// Constant-time string comparison for identifiers received from clients.
///
/// Length is not hidden; session identifiers all have the same shape.
pub fn ct_str_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
