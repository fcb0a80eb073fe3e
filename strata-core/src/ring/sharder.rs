use super::Ring;
use crate::index::JobSharder;
use std::sync::Arc;

/// Owns the jobs the ring assigns to this instance
#[derive(Clone)]
pub struct RingSharder {
    ring: Arc<dyn Ring>,
    instance_id: String,
}

impl RingSharder {
    pub fn new(ring: Arc<dyn Ring>, instance_id: impl Into<String>) -> Self {
        Self {
            ring,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl JobSharder for RingSharder {
    fn owns(&self, job: &str) -> bool {
        self.ring.owner(job).as_deref() == Some(self.instance_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::builder_job;
    use crate::ring::HashRing;
    use std::collections::HashSet;

    fn sharders(members: &[&str]) -> (Arc<HashRing>, Vec<RingSharder>) {
        let ring = Arc::new(HashRing::new());
        for m in members {
            ring.register(m, 32).unwrap();
        }
        let sharders = members
            .iter()
            .map(|m| RingSharder::new(ring.clone(), *m))
            .collect();
        (ring, sharders)
    }

    #[test]
    fn test_exactly_one_owner_per_job() {
        let (_, sharders) = sharders(&["a", "b", "c", "d"]);
        for i in 0..100 {
            let job = format!("t{}-0-1700000000", i);
            let owners = sharders.iter().filter(|s| s.owns(&job)).count();
            assert_eq!(owners, 1, "job {}", job);
        }
    }

    #[test]
    fn test_builder_slots_bound_builders() {
        let (_, sharders) = sharders(&["a", "b", "c", "d", "e"]);
        let builders = 2;
        for tenant in ["t1", "t2", "t3"] {
            let owners: HashSet<&str> = (0..builders)
                .flat_map(|slot| {
                    let job = builder_job(slot, tenant);
                    sharders
                        .iter()
                        .filter(move |s| s.owns(&job))
                        .map(|s| s.instance_id())
                        .collect::<Vec<_>>()
                })
                .collect();
            assert!(!owners.is_empty());
            assert!(owners.len() <= builders);
        }
    }

    #[test]
    fn test_ownership_moves_when_unhealthy() {
        let (ring, sharders) = sharders(&["a", "b"]);
        let job = "retention-t1";
        let owner = sharders.iter().find(|s| s.owns(job)).unwrap().instance_id().to_string();
        ring.set_healthy(&owner, false);
        let other = sharders.iter().find(|s| s.instance_id() != owner).unwrap();
        assert!(other.owns(job));
    }
}
