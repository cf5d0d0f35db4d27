// src/seed.rs
//
// Seed derivation for every random stream in a run.
//
// All randomness (environment reset, policy sampling, sticky actions) is
// derived from a single root seed. Derivation is a pure function:
//
//   seed = le_u64(SHA-256(DOMAIN || le(root) || le(len(tag)) || tag || le(index))[..8])
//
// so "environment reset of episode 7" and "policy sampling of episode 7" never
// collide and reproduce identically on any machine.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Domain separator for seed derivation. Changing it changes every seed.
const SEED_DOMAIN: &[u8] = b"arcade-replay/seed/v1";

/// Purpose of a derived random stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPurpose {
    /// Seed passed to the environment's `reset`.
    EnvReset,
    /// Seed passed to the policy's `reset`.
    PolicySampling,
    /// Seed for the wrapper's sticky-action stream.
    StickyAction,
}

impl SeedPurpose {
    pub fn tag(self) -> &'static str {
        match self {
            SeedPurpose::EnvReset => "env_reset",
            SeedPurpose::PolicySampling => "policy",
            SeedPurpose::StickyAction => "sticky_action",
        }
    }
}

/// Derive a seed from `root_seed`, a purpose tag and an index.
pub fn derive_seed(root_seed: u64, purpose_tag: &str, index: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(SEED_DOMAIN);
    hasher.update(root_seed.to_le_bytes());
    hasher.update((purpose_tag.len() as u64).to_le_bytes());
    hasher.update(purpose_tag.as_bytes());
    hasher.update(index.to_le_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

/// The derived seeds used by one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeSeeds {
    /// Environment reset seed (the episode's "derived seed").
    pub env: u64,
    /// Policy sampling seed.
    pub policy: u64,
    /// Sticky-action stream seed.
    pub sticky: u64,
}

/// Derives per-episode seeds from a run's root seed.
///
/// Holds no state beyond the root seed; cheap to copy and safe to share
/// between worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedManager {
    root_seed: u64,
}

impl SeedManager {
    pub fn new(root_seed: u64) -> Self {
        Self { root_seed }
    }

    pub fn root_seed(&self) -> u64 {
        self.root_seed
    }

    pub fn derive(&self, purpose: SeedPurpose, index: u64) -> u64 {
        derive_seed(self.root_seed, purpose.tag(), index)
    }

    pub fn episode_seeds(&self, episode_index: u64) -> EpisodeSeeds {
        EpisodeSeeds {
            env: self.derive(SeedPurpose::EnvReset, episode_index),
            policy: self.derive(SeedPurpose::PolicySampling, episode_index),
            sticky: self.derive(SeedPurpose::StickyAction, episode_index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_pure() {
        for root in [0_u64, 1, 42, u64::MAX] {
            for index in [0_u64, 1, 7, 1 << 40] {
                assert_eq!(
                    derive_seed(root, "env_reset", index),
                    derive_seed(root, "env_reset", index)
                );
            }
        }
    }

    #[test]
    fn purposes_do_not_collide() {
        let seeds = SeedManager::new(42).episode_seeds(7);
        assert_ne!(seeds.env, seeds.policy);
        assert_ne!(seeds.env, seeds.sticky);
        assert_ne!(seeds.policy, seeds.sticky);
    }

    #[test]
    fn tag_length_prefix_separates_ambiguous_inputs() {
        // "ab" + index vs "a" + different framing must not alias.
        assert_ne!(derive_seed(1, "ab", 0), derive_seed(1, "a", 0));
    }

    #[test]
    fn episodes_get_distinct_seeds() {
        let mgr = SeedManager::new(123);
        let a = mgr.episode_seeds(0);
        let b = mgr.episode_seeds(1);
        assert_ne!(a.env, b.env);
        assert_ne!(a.policy, b.policy);
    }
}
