//! Disk-secret derivation and the short-lived secret cache.
//!
//! The login password itself never reaches an external tool: the secret
//! handed to the encryption layer is its SHA-256 hex digest, written to the
//! tool's stdin. The cache exists for exactly one flow — an owner logs in
//! while a new blank disk is attached, and a follow-up expand request needs
//! the same secret without asking for the password again.

use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

/// How long a cached secret stays consumable after an owner login.
pub const EXPAND_SECRET_TTL: Duration = Duration::from_secs(5 * 60);

/// Derive the disk-encryption secret from a login password.
pub fn derive_disk_secret(password: &str) -> Zeroizing<String> {
    let digest = Sha256::digest(password.as_bytes());
    Zeroizing::new(hex::encode(digest))
}

struct CachedSecret {
    secret: Zeroizing<String>,
    deadline: Instant,
}

/// Single-slot, single-use cache with a hard TTL.
///
/// Expiry is checked on read, not by a background timer, so a stalled
/// process cannot serve a stale secret.
#[derive(Default)]
pub struct SecretCache {
    slot: Mutex<Option<CachedSecret>>,
}

impl SecretCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `secret` for `EXPAND_SECRET_TTL`, replacing any previous entry.
    pub fn store(&self, secret: Zeroizing<String>) {
        self.store_with_ttl(secret, EXPAND_SECRET_TTL);
    }

    fn store_with_ttl(&self, secret: Zeroizing<String>, ttl: Duration) {
        let mut slot = self.slot.lock().unwrap();
        *slot = Some(CachedSecret {
            secret,
            deadline: Instant::now() + ttl,
        });
    }

    /// Consume the cached secret. Returns `None` when the slot is empty or
    /// the deadline has passed; either way the slot is cleared.
    pub fn take(&self) -> Option<Zeroizing<String>> {
        let mut slot = self.slot.lock().unwrap();
        let entry = slot.take()?;
        if Instant::now() > entry.deadline {
            return None;
        }
        Some(entry.secret)
    }

    pub fn clear(&self) {
        *self.slot.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_hex_encoded() {
        let secret = derive_disk_secret("hunter2");
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(*secret, *derive_disk_secret("hunter2"));
        assert_ne!(*secret, *derive_disk_secret("hunter3"));
    }

    #[test]
    fn cache_is_single_use() {
        let cache = SecretCache::new();
        cache.store(derive_disk_secret("pw"));
        assert!(cache.take().is_some());
        assert!(cache.take().is_none());
    }

    #[test]
    fn expired_entries_are_not_served() {
        let cache = SecretCache::new();
        cache.store_with_ttl(derive_disk_secret("pw"), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.take().is_none());
    }

    #[test]
    fn clear_empties_the_slot() {
        let cache = SecretCache::new();
        cache.store(derive_disk_secret("pw"));
        cache.clear();
        assert!(cache.take().is_none());
    }
}
