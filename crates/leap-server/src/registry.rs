use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

use crate::tunnel::Tunnel;

/// Length of a generated subdomain
const RANDOM_SUBDOMAIN_LENGTH: usize = 6;

const HEX_DIGITS: &[u8] = b"0123456789abcdef";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("A tunnel on the subdomain {0:?} already exists")]
    Conflict(String),

    #[error("Invalid subdomain: {0:?}")]
    InvalidSubdomain(String),
}

/// Subdomain -> tunnel mapping for one server process
///
/// Creation, removal and token claims take the write lock, so a
/// check-and-insert can never interleave with another. Routing lookups only
/// hold the read lock for the map access itself.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a pending tunnel
    ///
    /// An empty `requested` name gets a random 6-character hex subdomain.
    pub fn create(&self, requested: &str) -> Result<Arc<Tunnel>, RegistryError> {
        let requested = requested.to_lowercase();
        if !requested.is_empty() && !is_valid_subdomain(&requested) {
            return Err(RegistryError::InvalidSubdomain(requested));
        }

        let mut tunnels = self.tunnels.write();

        let subdomain = if requested.is_empty() {
            let mut candidate = random_subdomain();
            while tunnels.contains_key(&candidate) {
                candidate = random_subdomain();
            }
            candidate
        } else if tunnels.contains_key(&requested) {
            return Err(RegistryError::Conflict(requested));
        } else {
            requested
        };

        let tunnel = Arc::new(Tunnel::new(subdomain.clone()));
        tunnels.insert(subdomain, tunnel.clone());
        Ok(tunnel)
    }

    /// Find the pending tunnel holding `token` and mark the token as used
    pub fn claim_by_token(&self, token: &str) -> Option<Arc<Tunnel>> {
        let tunnels = self.tunnels.write();
        tunnels
            .values()
            .find(|tunnel| tunnel.token() == token && !tunnel.is_claimed())
            .filter(|tunnel| tunnel.try_claim())
            .cloned()
    }

    /// Look up the tunnel serving `subdomain`
    pub fn get(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.read().get(subdomain).cloned()
    }

    /// Drop a tunnel; removing an unknown subdomain is a no-op
    pub fn remove(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.write().remove(subdomain)
    }

    /// Drop the tunnel only if it is still the same, never-connected one
    pub fn remove_if_pending(&self, subdomain: &str, token: &str) -> bool {
        let mut tunnels = self.tunnels.write();
        let stale = tunnels
            .get(subdomain)
            .is_some_and(|tunnel| tunnel.token() == token && !tunnel.is_claimed());
        if stale {
            tunnels.remove(subdomain);
        }
        stale
    }

    /// Number of registered tunnels, pending or connected
    pub fn count(&self) -> usize {
        self.tunnels.read().len()
    }

    /// Snapshot of tunnels with a live channel
    pub fn connected(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels
            .read()
            .values()
            .filter(|tunnel| tunnel.is_connected())
            .cloned()
            .collect()
    }
}

fn random_subdomain() -> String {
    let mut rng = rand::rng();
    (0..RANDOM_SUBDOMAIN_LENGTH)
        .map(|_| char::from(HEX_DIGITS[rng.random_range(0..HEX_DIGITS.len())]))
        .collect()
}

/// Validate subdomain format (lowercase alphanumeric and hyphens only)
fn is_valid_subdomain(subdomain: &str) -> bool {
    if subdomain.is_empty() || subdomain.len() > 63 {
        return false;
    }
    if subdomain.starts_with('-') || subdomain.ends_with('-') {
        return false;
    }
    subdomain
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn test_random_subdomain_shape() {
        let registry = TunnelRegistry::new();
        let tunnel = registry.create("").unwrap();
        assert_eq!(tunnel.subdomain().len(), 6);
        assert!(tunnel
            .subdomain()
            .bytes()
            .all(|b| HEX_DIGITS.contains(&b)));
        assert_eq!(tunnel.token().len(), 64);
    }

    #[test]
    fn test_requested_subdomain_is_lowercased() {
        let registry = TunnelRegistry::new();
        let tunnel = registry.create("MyApp").unwrap();
        assert_eq!(tunnel.subdomain(), "myapp");
        assert!(registry.get("myapp").is_some());
    }

    #[test]
    fn test_duplicate_subdomain_conflicts() {
        let registry = TunnelRegistry::new();
        registry.create("myapp").unwrap();
        assert!(matches!(
            registry.create("MYAPP"),
            Err(RegistryError::Conflict(name)) if name == "myapp"
        ));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_concurrent_create_has_one_winner() {
        let registry = TunnelRegistry::new();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.create("race").is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_invalid_subdomains_rejected() {
        let registry = TunnelRegistry::new();
        let too_long = "a".repeat(64);
        for name in ["-app", "app-", "my_app", "my.app", too_long.as_str()] {
            assert!(
                matches!(registry.create(name), Err(RegistryError::InvalidSubdomain(_))),
                "{} should be rejected",
                name
            );
        }
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_token_claims_once() {
        let registry = TunnelRegistry::new();
        let tunnel = registry.create("app").unwrap();
        let token = tunnel.token().to_string();

        let claimed = registry.claim_by_token(&token).unwrap();
        assert_eq!(claimed.subdomain(), "app");
        assert!(registry.claim_by_token(&token).is_none());
        assert!(registry.claim_by_token("bogus").is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = TunnelRegistry::new();
        registry.create("gone").unwrap();
        assert!(registry.remove("gone").is_some());
        assert!(registry.remove("gone").is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_remove_if_pending_spares_claimed() {
        let registry = TunnelRegistry::new();
        let pending = registry.create("pending").unwrap();
        let claimed = registry.create("claimed").unwrap();
        registry.claim_by_token(claimed.token()).unwrap();

        assert!(registry.remove_if_pending("pending", pending.token()));
        assert!(!registry.remove_if_pending("claimed", claimed.token()));
        assert_eq!(registry.count(), 1);
    }
}
