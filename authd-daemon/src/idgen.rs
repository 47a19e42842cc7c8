//! Deterministic UID/GID synthesis.
//!
//! IDs are derived from the lowercased name so that a user returning after a
//! cache clear receives the same UID on identically configured hosts. Only
//! the first candidate is deterministic per name; collisions resolve in
//! insertion order by rehashing the previous digest.

use sha2::{Digest, Sha256};

/// Everything below this is reserved for system accounts and ids issued by
/// adduser(8).
pub const ID_MIN: u32 = 65536;

/// Some software casts ids to i32; staying below i32::MAX avoids sign
/// ambiguity.
pub const ID_MAX: u32 = i32::MAX as u32;

/// How many candidates to try before giving up. The range holds two
/// billion ids, so running dry means something is broken, not full.
pub(crate) const MAX_ID_ATTEMPTS: usize = 100;

/// Source of UID/GID candidates for a name.
///
/// The stream is infinite; callers pull candidates until one is free in
/// both the identity store and the temporary tables.
pub trait IdGenerator: Send + Sync {
    fn candidates(&self, name: &str) -> Box<dyn Iterator<Item = u32> + Send>;
}

/// SHA-256 based generator used in production.
pub struct Sha256IdGenerator;

impl IdGenerator for Sha256IdGenerator {
    fn candidates(&self, name: &str) -> Box<dyn Iterator<Item = u32> + Send> {
        let digest: [u8; 32] = Sha256::digest(name.to_lowercase().as_bytes()).into();
        Box::new(Candidates { digest })
    }
}

struct Candidates {
    digest: [u8; 32],
}

impl Iterator for Candidates {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        // Project the first 4 bytes of the digest into [0, ID_MAX), then
        // rehash until the value clears ID_MIN. Rehashing instead of a
        // simple offset keeps the distribution uniform over the range.
        loop {
            let number =
                u32::from_be_bytes([self.digest[0], self.digest[1], self.digest[2], self.digest[3]])
                    % ID_MAX;
            self.digest = Sha256::digest(self.digest).into();
            if number >= ID_MIN {
                return Some(number);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_candidate_is_deterministic() {
        let generator = Sha256IdGenerator;
        let a = generator.candidates("alice").next().unwrap();
        let b = generator.candidates("alice").next().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn case_is_ignored() {
        let generator = Sha256IdGenerator;
        let lower = generator.candidates("alice").next().unwrap();
        let upper = generator.candidates("ALICE").next().unwrap();
        let mixed = generator.candidates("Alice").next().unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower, mixed);
    }

    #[test]
    fn candidates_stay_in_range() {
        let generator = Sha256IdGenerator;
        for name in ["alice", "bob", "x", "", "Ω-user", "a.very.long.name.indeed"] {
            for id in generator.candidates(name).take(50) {
                assert!((ID_MIN..ID_MAX).contains(&id), "{name}: {id} out of range");
            }
        }
    }

    #[test]
    fn collision_candidates_differ() {
        let generator = Sha256IdGenerator;
        let ids: Vec<u32> = generator.candidates("alice").take(10).collect();
        let mut deduped = ids.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), ids.len());
    }

    #[test]
    fn different_names_generally_differ() {
        let generator = Sha256IdGenerator;
        let a = generator.candidates("alice").next().unwrap();
        let b = generator.candidates("bob").next().unwrap();
        assert_ne!(a, b);
    }
}
