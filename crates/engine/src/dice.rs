//! Hunger dice pool resolution.
//!
//! A pool of d10s is split into regular and hunger dice. The roll itself is a pure
//! computation; any "rolling..." delay or toast belongs to the caller, which reacts to
//! the flags on the returned [`RollResult`].

use chronicle_protocol::RollResult;
use rand::Rng;
use thiserror::Error;

/// Faces on every die in the pool.
pub const DIE_SIDES: u8 = 10;
/// Smallest face counted as a success.
pub const SUCCESS_THRESHOLD: u8 = 6;
/// Upper bound on a single pool; keeps a request-scoped roll from allocating without limit.
pub const MAX_POOL_SIZE: u32 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiceError {
    #[error("pool size must be at least 1")]
    EmptyPool,
    #[error("pool size {0} exceeds the maximum of {MAX_POOL_SIZE}")]
    PoolTooLarge(u32),
    #[error("hunger count {hunger} exceeds pool size {pool}")]
    TooMuchHunger { hunger: u32, pool: u32 },
}

/// A validated pool. Out-of-range inputs are rejected, never clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DicePool {
    pool_size: u32,
    hunger_count: u32,
}

impl DicePool {
    pub fn new(pool_size: u32, hunger_count: u32) -> Result<Self, DiceError> {
        if pool_size == 0 {
            return Err(DiceError::EmptyPool);
        }
        if pool_size > MAX_POOL_SIZE {
            return Err(DiceError::PoolTooLarge(pool_size));
        }
        if hunger_count > pool_size {
            return Err(DiceError::TooMuchHunger {
                hunger: hunger_count,
                pool: pool_size,
            });
        }
        Ok(Self {
            pool_size,
            hunger_count,
        })
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    pub fn hunger_count(&self) -> u32 {
        self.hunger_count
    }

    pub fn regular_count(&self) -> u32 {
        self.pool_size - self.hunger_count
    }
}

/// Roll a pool with the thread RNG.
pub fn roll(pool_size: u32, hunger_count: u32) -> Result<RollResult, DiceError> {
    let pool = DicePool::new(pool_size, hunger_count)?;
    Ok(roll_with_rng(&pool, &mut rand::thread_rng()))
}

/// Roll with a specific RNG (useful for testing).
pub fn roll_with_rng<R: Rng>(pool: &DicePool, rng: &mut R) -> RollResult {
    let normal_dice: Vec<u8> = (0..pool.regular_count())
        .map(|_| rng.gen_range(1..=DIE_SIDES))
        .collect();
    let hunger_dice: Vec<u8> = (0..pool.hunger_count())
        .map(|_| rng.gen_range(1..=DIE_SIDES))
        .collect();

    let result = classify(normal_dice, hunger_dice);
    tracing::debug!(
        pool = pool.pool_size(),
        hunger = pool.hunger_count(),
        successes = result.successes,
        critical_pairs = result.critical_pairs,
        messy = result.messy_critical,
        bestial = result.bestial_failure,
        "dice pool rolled"
    );
    result
}

/// Classify already-rolled faces.
pub fn classify(normal_dice: Vec<u8>, hunger_dice: Vec<u8>) -> RollResult {
    let all = || normal_dice.iter().chain(hunger_dice.iter());

    let successes = count(all(), |d| d >= SUCCESS_THRESHOLD);
    let tens = count(all(), |d| d == DIE_SIDES);
    let hunger_tens = count(hunger_dice.iter(), |d| d == DIE_SIDES);
    let hunger_ones = count(hunger_dice.iter(), |d| d == 1);

    RollResult {
        successes,
        critical_pairs: tens / 2,
        messy_critical: hunger_tens >= 2,
        bestial_failure: successes == 0 && hunger_ones >= 1,
        normal_dice,
        hunger_dice,
    }
}

fn count<'a>(dice: impl Iterator<Item = &'a u8>, pred: impl Fn(u8) -> bool) -> u32 {
    dice.filter(|d| pred(**d)).count() as u32
}

/// One-line summary for logs and panel headers.
pub fn headline(result: &RollResult) -> String {
    let mut s = match result.successes {
        1 => "1 success".to_string(),
        n => format!("{n} successes"),
    };
    if result.critical_pairs > 0 {
        s.push_str(&format!(", {} critical pair(s)", result.critical_pairs));
    }
    if result.messy_critical {
        s.push_str(" - messy critical");
    }
    if result.bestial_failure {
        s.push_str(" - bestial failure");
    }
    s
}
