use crate::Error;
use crate::keys::IdentityPublicKey;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// An identity key remembered for a remote user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrustedIdentity {
    /// The accepted identity.
    pub identity: IdentityPublicKey,
    /// Whether the user compared fingerprints out of band.
    pub verified: bool,
}

/// Trust-on-first-use record of remote identities.
///
/// The first identity seen for a user is pinned. A different one is rejected
/// until the application replaces it through [`IdentityTrustStore::trust`].
#[derive(Default)]
pub(crate) struct IdentityTrustStore {
    identities: Mutex<HashMap<String, TrustedIdentity>>,
}

impl IdentityTrustStore {
    pub(crate) fn from_entries(entries: Vec<(String, TrustedIdentity)>) -> Self {
        Self {
            identities: Mutex::new(entries.into_iter().collect()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrustedIdentity>> {
        self.identities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn get(&self, user_id: &str) -> Option<TrustedIdentity> {
        self.lock().get(user_id).copied()
    }

    /// Fails with [`Error::UntrustedIdentity`] when `identity` differs from the
    /// pinned one. Unknown users pass.
    pub(crate) fn check(&self, user_id: &str, identity: &IdentityPublicKey) -> Result<(), Error> {
        match self.lock().get(user_id) {
            Some(trusted) if trusted.identity != *identity => {
                tracing::warn!(user_id, "identity key changed");
                Err(Error::UntrustedIdentity(user_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Pins `identity` if nothing is pinned yet. Returns whether the entry changed.
    pub(crate) fn record(&self, user_id: &str, identity: &IdentityPublicKey) -> bool {
        let mut identities = self.lock();
        if identities.contains_key(user_id) {
            return false;
        }
        identities.insert(
            user_id.to_string(),
            TrustedIdentity {
                identity: *identity,
                verified: false,
            },
        );
        true
    }

    /// Undoes a [`IdentityTrustStore::record`] that returned `true`.
    pub(crate) fn forget(&self, user_id: &str) {
        self.lock().remove(user_id);
    }

    /// Replaces whatever is pinned. The new entry starts unverified.
    pub(crate) fn trust(&self, user_id: &str, identity: &IdentityPublicKey) {
        self.lock().insert(
            user_id.to_string(),
            TrustedIdentity {
                identity: *identity,
                verified: false,
            },
        );
    }

    /// Marks the pinned identity as verified if it equals `identity`.
    pub(crate) fn mark_verified(
        &self,
        user_id: &str,
        identity: &IdentityPublicKey,
    ) -> Result<(), Error> {
        let mut identities = self.lock();
        let trusted = identities
            .entry(user_id.to_string())
            .or_insert(TrustedIdentity {
                identity: *identity,
                verified: false,
            });

        if trusted.identity != *identity {
            return Err(Error::UntrustedIdentity(user_id.to_string()));
        }
        trusted.verified = true;
        Ok(())
    }

    pub(crate) fn entries(&self) -> Vec<(String, TrustedIdentity)> {
        let mut entries: Vec<_> = self
            .lock()
            .iter()
            .map(|(user_id, trusted)| (user_id.clone(), *trusted))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
