use crate::keys::IdentityPublicKey;
use sha2::{Digest, Sha512};
use std::fmt;

const FINGERPRINT_VERSION: [u8; 2] = [0, 1];
const ITERATIONS: usize = 1024;

/// A safety number two users compare out of band to verify each other's identity.
///
/// Both sides compute the same 60 digits regardless of who is "local".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    digits: String,
}

impl Fingerprint {
    /// Derive the safety number for a pair of identities.
    pub fn new(
        local_id: &str,
        local_key: &IdentityPublicKey,
        remote_id: &str,
        remote_key: &IdentityPublicKey,
    ) -> Self {
        let local = display_half(local_id, local_key);
        let remote = display_half(remote_id, remote_key);

        let digits = if local <= remote {
            local + &remote
        } else {
            remote + &local
        };

        Self { digits }
    }

    /// The 60 digits without separators.
    pub fn digits(&self) -> &str {
        &self.digits
    }
}

impl fmt::Display for Fingerprint {
    /// Groups of five digits separated by spaces.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for chunk in self.digits.as_bytes().chunks(5) {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            f.write_str(&String::from_utf8_lossy(chunk))?;
        }
        Ok(())
    }
}

fn display_half(user_id: &str, key: &IdentityPublicKey) -> String {
    let key_bytes = key.to_bytes();

    let mut hasher = Sha512::new();
    hasher.update(FINGERPRINT_VERSION);
    hasher.update(key_bytes);
    hasher.update(user_id.as_bytes());
    let mut hash = hasher.finalize();

    for _ in 0..ITERATIONS {
        let mut hasher = Sha512::new();
        hasher.update(hash);
        hasher.update(key_bytes);
        hash = hasher.finalize();
    }

    hash[..30]
        .chunks(5)
        .map(|chunk| {
            let value = chunk
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
            format!("{:05}", value % 100_000)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{OsEntropy, generate_identity};

    #[test]
    fn test_fingerprint_is_symmetric() {
        let alice = generate_identity("alice", &OsEntropy).unwrap();
        let bob = generate_identity("bob", &OsEntropy).unwrap();

        let seen_by_alice = Fingerprint::new("alice", &alice.public_key(), "bob", &bob.public_key());
        let seen_by_bob = Fingerprint::new("bob", &bob.public_key(), "alice", &alice.public_key());

        assert_eq!(seen_by_alice, seen_by_bob);
        assert_eq!(seen_by_alice.digits().len(), 60);
        assert!(seen_by_alice.digits().chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_fingerprint_changes_with_key() {
        let alice = generate_identity("alice", &OsEntropy).unwrap();
        let bob = generate_identity("bob", &OsEntropy).unwrap();
        let mallory = generate_identity("bob", &OsEntropy).unwrap();

        let genuine = Fingerprint::new("alice", &alice.public_key(), "bob", &bob.public_key());
        let forged = Fingerprint::new("alice", &alice.public_key(), "bob", &mallory.public_key());

        assert_ne!(genuine, forged);
    }

    #[test]
    fn test_display_groups_digits() {
        let alice = generate_identity("alice", &OsEntropy).unwrap();
        let bob = generate_identity("bob", &OsEntropy).unwrap();
        let fingerprint = Fingerprint::new("alice", &alice.public_key(), "bob", &bob.public_key());

        let shown = fingerprint.to_string();
        assert_eq!(shown.split(' ').count(), 12);
        assert_eq!(shown.replace(' ', ""), fingerprint.digits());
    }
}
