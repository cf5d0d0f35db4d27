// src/env/gridchase.rs
//
// GridChase: a tiny deterministic maze-chase game used as the built-in
// reference environment (pellets, one chasing ghost, three lives).
//
// It stands in for an emulator behind the Environment trait: all randomness
// comes from a ChaCha8 stream seeded by reset(seed), and the 128-byte "RAM"
// plus the RNG position form the state checksum.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

use super::registry::ObsType;
use super::{Action, EnvError, EnvStep, Environment};
use crate::types::{ContentDigest, Observation};

const GRID: u8 = 8;
const PIXEL_SCALE: usize = 2;
const RAM_SIZE: usize = 128;
const START: (u8, u8) = (3, 7);
const START_LIVES: u8 = 3;
const PELLET_REWARD: f64 = 10.0;
const CHASE_PROB: f64 = 0.7;
const SPAWN_POINTS: [(u8, u8); 3] = [(0, 0), (7, 0), (0, 3)];

const ACTION_MEANINGS: [&str; 5] = ["NOOP", "UP", "RIGHT", "DOWN", "LEFT"];

/// Built-in deterministic environment.
#[derive(Debug, Clone)]
pub struct GridChase {
    obs_type: ObsType,
    rng: ChaCha8Rng,
    player: (u8, u8),
    ghost: (u8, u8),
    pellets: u64,
    lives: u8,
    score: u32,
    frame: u32,
    seeded: bool,
}

impl GridChase {
    pub fn new(obs_type: ObsType) -> Self {
        Self {
            obs_type,
            rng: ChaCha8Rng::seed_from_u64(0),
            player: START,
            ghost: SPAWN_POINTS[0],
            pellets: 0,
            lives: START_LIVES,
            score: 0,
            frame: 0,
            seeded: false,
        }
    }

    pub fn lives(&self) -> u8 {
        self.lives
    }

    pub fn pellets_left(&self) -> u32 {
        self.pellets.count_ones()
    }

    fn cell_bit(pos: (u8, u8)) -> u64 {
        1u64 << (pos.1 as u32 * GRID as u32 + pos.0 as u32)
    }

    fn moved(pos: (u8, u8), dir: Action) -> (u8, u8) {
        let (x, y) = pos;
        match dir {
            1 => (x, y.saturating_sub(1)),
            2 => ((x + 1).min(GRID - 1), y),
            3 => (x, (y + 1).min(GRID - 1)),
            4 => (x.saturating_sub(1), y),
            _ => (x, y),
        }
    }

    fn spawn_ghost(&mut self) -> (u8, u8) {
        SPAWN_POINTS[self.rng.gen_range(0..SPAWN_POINTS.len())]
    }

    fn move_ghost(&mut self) {
        let (gx, gy) = (self.ghost.0 as i16, self.ghost.1 as i16);
        let (px, py) = (self.player.0 as i16, self.player.1 as i16);

        let dir: Action = if self.rng.gen_bool(CHASE_PROB) {
            let (dx, dy) = (px - gx, py - gy);
            let horizontal = if dx.abs() == dy.abs() {
                self.rng.gen_bool(0.5)
            } else {
                dx.abs() > dy.abs()
            };
            match (horizontal, dx.signum(), dy.signum()) {
                (true, 1, _) => 2,
                (true, -1, _) => 4,
                (false, _, 1) => 3,
                (false, _, -1) => 1,
                _ => 0,
            }
        } else {
            self.rng.gen_range(1..=4)
        };
        self.ghost = Self::moved(self.ghost, dir);
    }

    fn ram(&self) -> [u8; RAM_SIZE] {
        let mut ram = [0u8; RAM_SIZE];
        ram[0] = self.player.0;
        ram[1] = self.player.1;
        ram[2] = self.ghost.0;
        ram[3] = self.ghost.1;
        ram[4] = self.lives;
        ram[5..9].copy_from_slice(&self.score.to_le_bytes());
        ram[9..13].copy_from_slice(&self.frame.to_le_bytes());
        ram[13..21].copy_from_slice(&self.pellets.to_le_bytes());
        ram
    }

    fn pixels(&self) -> Vec<u8> {
        let side = GRID as usize * PIXEL_SCALE;
        let mut out = vec![0u8; side * side];
        for y in 0..GRID {
            for x in 0..GRID {
                let value = if (x, y) == self.player {
                    255
                } else if (x, y) == self.ghost {
                    128
                } else if self.pellets & Self::cell_bit((x, y)) != 0 {
                    64
                } else {
                    0
                };
                for sy in 0..PIXEL_SCALE {
                    let row = (y as usize * PIXEL_SCALE + sy) * side;
                    let col = x as usize * PIXEL_SCALE;
                    out[row + col..row + col + PIXEL_SCALE].fill(value);
                }
            }
        }
        out
    }

    fn observe(&self) -> Observation {
        match self.obs_type {
            ObsType::Pixels => {
                let side = GRID as usize * PIXEL_SCALE;
                Observation::new(vec![side, side], self.pixels())
            }
            ObsType::State => Observation::new(vec![RAM_SIZE], self.ram().to_vec()),
        }
    }
}

impl Environment for GridChase {
    fn env_id(&self) -> &str {
        match self.obs_type {
            ObsType::Pixels => "GridChase-v0",
            ObsType::State => "GridChase-ram-v0",
        }
    }

    fn action_space_n(&self) -> u32 {
        ACTION_MEANINGS.len() as u32
    }

    fn action_meanings(&self) -> Vec<String> {
        ACTION_MEANINGS.iter().map(|s| s.to_string()).collect()
    }

    fn reset(&mut self, seed: u64) -> Result<Observation, EnvError> {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self.player = START;
        self.pellets = !Self::cell_bit(START);
        self.ghost = self.spawn_ghost();
        self.lives = START_LIVES;
        self.score = 0;
        self.frame = 0;
        self.seeded = true;
        Ok(self.observe())
    }

    fn step(&mut self, action: Action) -> Result<EnvStep, EnvError> {
        if !self.seeded {
            return Err(EnvError::NotReset);
        }
        if action >= self.action_space_n() {
            return Err(EnvError::InvalidAction {
                action,
                action_space_n: self.action_space_n(),
            });
        }

        let mut reward = 0.0;
        self.player = Self::moved(self.player, action);
        let bit = Self::cell_bit(self.player);
        if self.pellets & bit != 0 {
            self.pellets &= !bit;
            self.score += PELLET_REWARD as u32;
            reward += PELLET_REWARD;
        }

        self.move_ghost();
        if self.ghost == self.player {
            self.lives = self.lives.saturating_sub(1);
            self.player = START;
            self.ghost = self.spawn_ghost();
        }
        self.frame = self.frame.wrapping_add(1);

        Ok(EnvStep {
            observation: self.observe(),
            reward,
            terminated: self.lives == 0 || self.pellets == 0,
            truncated: false,
        })
    }

    fn state_checksum(&self) -> Option<ContentDigest> {
        let mut hasher = Sha256::new();
        hasher.update(self.ram());
        hasher.update(self.rng.get_word_pos().to_le_bytes());
        Some(ContentDigest::from_bytes(hasher.finalize().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rollout(seed: u64, steps: usize) -> Vec<(ContentDigest, f64, bool)> {
        let mut env = GridChase::new(ObsType::Pixels);
        env.reset(seed).unwrap();
        let mut out = Vec::new();
        for i in 0..steps {
            let s = env.step((i % 5) as Action).unwrap();
            out.push((s.observation.digest(), s.reward, s.terminated));
            if s.terminated {
                break;
            }
        }
        out
    }

    #[test]
    fn same_seed_same_rollout() {
        assert_eq!(rollout(11, 200), rollout(11, 200));
    }

    #[test]
    fn different_seeds_diverge() {
        assert_ne!(rollout(11, 200), rollout(12, 200));
    }

    #[test]
    fn pixel_and_ram_shapes() {
        let mut px = GridChase::new(ObsType::Pixels);
        let obs = px.reset(1).unwrap();
        assert_eq!(obs.shape, vec![16, 16]);
        assert_eq!(obs.data.len(), 256);

        let mut ram = GridChase::new(ObsType::State);
        let obs = ram.reset(1).unwrap();
        assert_eq!(obs.shape, vec![128]);
        assert_eq!(obs.data[4], START_LIVES);
    }

    #[test]
    fn start_cell_has_no_pellet() {
        let mut env = GridChase::new(ObsType::State);
        env.reset(3).unwrap();
        assert_eq!(env.pellets_left(), 63);
    }

    #[test]
    fn checksum_tracks_rng_position() {
        let mut a = GridChase::new(ObsType::State);
        a.reset(5).unwrap();
        let before = a.state_checksum();
        a.step(0).unwrap();
        assert_ne!(before, a.state_checksum());
    }
}
