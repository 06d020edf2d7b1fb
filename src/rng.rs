//! String-keyed deterministic randomness.
//!
//! Every random draw in the module is keyed by a seed string assembled from
//! stable identifiers: room id, game epoch, round index, purpose tag, and
//! where relevant player id and reroll counter. Hashing the key with blake3
//! and feeding the digest to a PCG generator gives each caller its own
//! stream with no shared cursor, so concurrent draws cannot perturb each
//! other and any value can be re-derived later from the same key.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

/// A deterministic value stream for one seed key.
pub struct SeedStream {
    rng: Pcg64,
}

impl SeedStream {
    pub fn new(seed_key: &str) -> Self {
        let digest = blake3::hash(seed_key.as_bytes());
        Self {
            rng: Pcg64::from_seed(*digest.as_bytes()),
        }
    }

    /// Next value in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Uniform integer in `[lo, hi]` inclusive.
    pub fn next_range(&mut self, lo: i32, hi: i32) -> i32 {
        debug_assert!(lo <= hi);
        self.rng.gen_range(lo..=hi)
    }

    /// `count` distinct indices out of `0..len`, via a partial Fisher-Yates
    /// shuffle. Returns fewer than `count` when the pool is smaller.
    pub fn pick_distinct(&mut self, len: usize, count: usize) -> Vec<usize> {
        let mut pool: Vec<usize> = (0..len).collect();
        let take = count.min(len);
        for i in 0..take {
            let j = self.rng.gen_range(i..pool.len());
            pool.swap(i, j);
        }
        pool.truncate(take);
        pool
    }
}

fn round_prefix(room_id: u64, game_epoch: u32, round: u32) -> String {
    format!("room:{}:game:{}:round:{}", room_id, game_epoch, round)
}

/// Seed key for the shared rarity tier of a round.
pub fn tier_seed(room_id: u64, game_epoch: u32, round: u32) -> String {
    format!("{}:tier", round_prefix(room_id, game_epoch, round))
}

/// Seed key for one player's offer draw. `reroll` is 0 for the initial
/// offer and counts up with each reroll, so every reroll is a fresh stream.
pub fn offer_seed(room_id: u64, game_epoch: u32, round: u32, player_id: &str, reroll: u32) -> String {
    format!(
        "{}:player:{}:offer:{}",
        round_prefix(room_id, game_epoch, round),
        player_id,
        reroll
    )
}

/// Seed key for one player's condition roll (one per player per round).
pub fn condition_seed(room_id: u64, game_epoch: u32, round: u32, player_id: &str) -> String {
    format!(
        "{}:player:{}:condition",
        round_prefix(room_id, game_epoch, round),
        player_id
    )
}
