//! # Connection Validators
//!
//! The accepting side of a handshake learns the caller's identity from the
//! caller's own claim. Before answering the challenge it asks a
//! [`ConnectionValidator`] whether that identity may connect at all.
//!
//! Validators are synchronous. An implementation backed by a slow lookup
//! should resolve the answer ahead of time (or on its own task) and serve
//! it from memory; the handshake does not wait on an async result.
//!
//! [`AllowList`] is the stock implementation: a bounded, lock-guarded set
//! that can be updated while handshakes are running.

use std::collections::HashSet;
use std::sync::RwLock;

use anyhow::Result;

use crate::identity::Identity;

/// Default upper bound on the number of identities an [`AllowList`] holds.
/// SECURITY: keeps a misbehaving configuration source from growing the set
/// without limit.
pub const DEFAULT_ALLOW_LIST_CAPACITY: usize = 4096;

/// Decides whether a claimed identity may complete a handshake.
pub trait ConnectionValidator: Send + Sync {
    /// `Ok(true)` admits the peer; `Ok(false)` or an error rejects it.
    fn validate(&self, claimed: &Identity) -> Result<bool>;
}

impl<F> ConnectionValidator for F
where
    F: Fn(&Identity) -> Result<bool> + Send + Sync,
{
    fn validate(&self, claimed: &Identity) -> Result<bool> {
        self(claimed)
    }
}

/// Admits every well-formed identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ConnectionValidator for AcceptAll {
    fn validate(&self, claimed: &Identity) -> Result<bool> {
        Ok(claimed.is_valid())
    }
}

/// Dynamically updatable allow-list consulted concurrently by handshakes.
#[derive(Debug)]
pub struct AllowList {
    identities: RwLock<HashSet<Identity>>,
    capacity: usize,
}

impl AllowList {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ALLOW_LIST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            identities: RwLock::new(HashSet::new()),
            capacity,
        }
    }

    /// Build a list from an iterator, truncating at the default capacity.
    pub fn from_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        let list = Self::new();
        for identity in identities {
            list.add(identity);
        }
        list
    }

    /// Insert an identity. Returns `false` if the list is full and the
    /// identity was not already present.
    pub fn add(&self, identity: Identity) -> bool {
        let mut set = self
            .identities
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if set.contains(&identity) {
            return true;
        }
        if set.len() >= self.capacity {
            return false;
        }
        set.insert(identity);
        true
    }

    /// Remove an identity. Returns whether it was present.
    pub fn remove(&self, identity: &Identity) -> bool {
        self.identities
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(identity)
    }

    pub fn check(&self, identity: &Identity) -> bool {
        self.identities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(identity)
    }

    pub fn len(&self) -> usize {
        self.identities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AllowList {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionValidator for AllowList {
    fn validate(&self, claimed: &Identity) -> Result<bool> {
        Ok(self.check(claimed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn allow_list_add_remove_check() {
        let list = AllowList::new();
        let id = Keypair::generate().identity();

        assert!(!list.check(&id));
        assert!(list.add(id));
        assert!(list.check(&id));
        assert_eq!(list.len(), 1);

        assert!(list.remove(&id));
        assert!(!list.remove(&id));
        assert!(list.is_empty());
    }

    #[test]
    fn allow_list_is_bounded() {
        let list = AllowList::with_capacity(2);
        let a = Keypair::generate().identity();
        let b = Keypair::generate().identity();
        let c = Keypair::generate().identity();

        assert!(list.add(a));
        assert!(list.add(b));
        assert!(!list.add(c), "third identity must be refused");
        assert!(list.add(a), "re-adding a member is not a growth");
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn closures_are_validators() {
        let allowed = Keypair::generate().identity();
        let validator = move |claimed: &Identity| -> Result<bool> { Ok(*claimed == allowed) };

        assert!(validator.validate(&allowed).unwrap());
        assert!(!validator.validate(&Keypair::generate().identity()).unwrap());
    }

    #[test]
    fn accept_all_rejects_malformed_identities() {
        assert!(AcceptAll.validate(&Keypair::generate().identity()).unwrap());
        assert!(!AcceptAll.validate(&Identity::from_bytes([0u8; 32])).unwrap());
    }
}
