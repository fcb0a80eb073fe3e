//! Consistent hash ring used to shard jobs between instances
//!
//! Membership and health come from outside (a heartbeat or gossip layer);
//! this module only answers "who owns this key".

mod sharder;

pub use sharder::RingSharder;

use crate::config::RingConfig;
use crate::{Result, StrataError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Read-only view of ring ownership
pub trait Ring: Send + Sync {
    /// Healthy instance owning `key`, `None` if no instance is healthy
    fn owner(&self, key: &str) -> Option<String>;

    fn members(&self) -> BTreeSet<String>;
}

#[derive(Debug)]
struct Instance {
    healthy: bool,
    tokens: Vec<u32>,
}

#[derive(Debug, Default)]
struct RingState {
    tokens: BTreeMap<u32, String>,
    instances: HashMap<String, Instance>,
}

/// Ring of CRC32 tokens
///
/// A key is owned by the instance holding the first token at or after the
/// key's hash, skipping unhealthy instances and wrapping at the end.
#[derive(Debug, Default)]
pub struct HashRing {
    state: RwLock<RingState>,
}

fn hash(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ring with every configured member registered and healthy
    pub fn from_config(config: &RingConfig) -> Result<Self> {
        config.validate()?;
        let ring = Self::new();
        for member in config.all_members() {
            ring.register(&member, config.tokens_per_instance)?;
        }
        Ok(ring)
    }

    /// Add an instance with `n_tokens` tokens, replacing any previous ones
    ///
    /// Tokens depend only on the instance ID, so every process computing
    /// the ring from the same membership agrees on ownership.
    pub fn register(&self, instance: &str, n_tokens: usize) -> Result<()> {
        if n_tokens == 0 {
            return Err(StrataError::Config(format!(
                "instance {} registered with no tokens",
                instance
            )));
        }

        let mut state = self.state.write();
        remove_locked(&mut state, instance);

        let mut tokens = Vec::with_capacity(n_tokens);
        let mut seed = 0u64;
        while tokens.len() < n_tokens {
            let token = hash(&format!("{}-{}", instance, seed));
            seed += 1;
            // first registrant keeps a colliding token
            if state.tokens.contains_key(&token) {
                continue;
            }
            state.tokens.insert(token, instance.to_string());
            tokens.push(token);
        }

        state.instances.insert(
            instance.to_string(),
            Instance {
                healthy: true,
                tokens,
            },
        );
        Ok(())
    }

    /// Mark an instance healthy or not; unknown instances are ignored
    pub fn set_healthy(&self, instance: &str, healthy: bool) {
        if let Some(i) = self.state.write().instances.get_mut(instance) {
            i.healthy = healthy;
        }
    }

    pub fn remove(&self, instance: &str) {
        remove_locked(&mut self.state.write(), instance);
    }

    pub fn is_healthy(&self, instance: &str) -> bool {
        self.state
            .read()
            .instances
            .get(instance)
            .map(|i| i.healthy)
            .unwrap_or(false)
    }
}

fn remove_locked(state: &mut RingState, instance: &str) {
    if let Some(old) = state.instances.remove(instance) {
        for token in old.tokens {
            state.tokens.remove(&token);
        }
    }
}

impl Ring for HashRing {
    fn owner(&self, key: &str) -> Option<String> {
        let state = self.state.read();
        let start = hash(key);

        state
            .tokens
            .range(start..)
            .chain(state.tokens.range(..start))
            .map(|(_, instance)| instance)
            .find(|instance| {
                state
                    .instances
                    .get(instance.as_str())
                    .map(|i| i.healthy)
                    .unwrap_or(false)
            })
            .cloned()
    }

    fn members(&self) -> BTreeSet<String> {
        self.state.read().instances.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(members: &[&str]) -> HashRing {
        let ring = HashRing::new();
        for m in members {
            ring.register(m, 64).unwrap();
        }
        ring
    }

    #[test]
    fn test_every_key_has_one_owner() {
        let ring = ring(&["a", "b", "c"]);
        let mut owned: HashMap<String, usize> = HashMap::new();

        for i in 0..3000 {
            let owner = ring.owner(&format!("t1-0-{}", i)).unwrap();
            *owned.entry(owner).or_default() += 1;
        }

        assert_eq!(owned.len(), 3);
        // loose balance check, 64 tokens each
        for count in owned.values() {
            assert!(*count > 300, "unbalanced ring: {:?}", owned);
        }
    }

    #[test]
    fn test_ownership_is_deterministic() {
        let first = ring(&["a", "b", "c"]);
        let second = ring(&["c", "a", "b"]);
        for i in 0..200 {
            let key = format!("job-{}", i);
            assert_eq!(first.owner(&key), second.owner(&key));
        }
    }

    #[test]
    fn test_unhealthy_owner_hands_over() {
        let ring = ring(&["a", "b", "c"]);
        let key = "t1-0-1700000000";
        let owner = ring.owner(key).unwrap();

        ring.set_healthy(&owner, false);
        let next = ring.owner(key).unwrap();
        assert_ne!(next, owner);

        ring.set_healthy(&owner, true);
        assert_eq!(ring.owner(key).unwrap(), owner);
    }

    #[test]
    fn test_no_healthy_members() {
        let ring = ring(&["a"]);
        ring.set_healthy("a", false);
        assert_eq!(ring.owner("anything"), None);
        assert!(HashRing::new().owner("anything").is_none());
    }

    #[test]
    fn test_remove_and_members() {
        let ring = ring(&["a", "b"]);
        ring.remove("a");
        assert_eq!(ring.members(), BTreeSet::from(["b".to_string()]));
        assert_eq!(ring.owner("key").as_deref(), Some("b"));
        assert!(ring.register("a", 0).is_err());
    }

    #[test]
    fn test_from_config_includes_self() {
        let config = RingConfig {
            instance_id: "compactor-1".to_string(),
            members: vec!["compactor-0".to_string()],
            tokens_per_instance: 16,
        };
        let ring = HashRing::from_config(&config).unwrap();
        assert_eq!(ring.members().len(), 2);
        assert!(ring.is_healthy("compactor-1"));
    }
}
