//! Randomness used by every stochastic choice in the pipeline.
//!
//! Outputs are deliberately not replayable across runs, so the production
//! source reads the OS CSPRNG directly and there is no seed anywhere. Tests
//! substitute a [`ScriptedRandom`] through the same trait.

use std::collections::VecDeque;

use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::{GenError, Result};

/// Object-safe randomness primitive. The generic helpers (`choice`,
/// `weighted_choice`, `shuffle`, `randint`) live on `dyn RandomSource`.
pub trait RandomSource: Send + Sync {
    /// Uniform integer in `0..upper`. `upper == 0` is an `EmptyChoice` error.
    fn below(&self, upper: usize) -> Result<usize>;

    /// Uniform float in `[0, 1)`.
    fn unit(&self) -> Result<f64>;
}

/// CSPRNG-backed source reading `OsRng` through the fallible API so that an
/// unavailable entropy source surfaces as `InsufficientEntropy` instead of a panic.
#[derive(Debug, Default, Clone, Copy)]
pub struct SecureRandom;

impl SecureRandom {
    pub fn new() -> Self {
        Self
    }

    fn next_u64(&self) -> Result<u64> {
        let mut buf = [0u8; 8];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| GenError::InsufficientEntropy(e.to_string()))?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl RandomSource for SecureRandom {
    fn below(&self, upper: usize) -> Result<usize> {
        if upper == 0 {
            return Err(GenError::EmptyChoice);
        }
        let upper = upper as u64;
        // Largest multiple of `upper` representable; reject above it.
        let limit = u64::MAX - (u64::MAX % upper);
        loop {
            let v = self.next_u64()?;
            if v < limit {
                return Ok((v % upper) as usize);
            }
        }
    }

    fn unit(&self) -> Result<f64> {
        let v = self.next_u64()? >> 11;
        Ok(v as f64 / (1u64 << 53) as f64)
    }
}

impl<'r> dyn RandomSource + 'r {
    pub fn choice<'a, T>(&self, items: &'a [T]) -> Result<&'a T> {
        let idx = self.below(items.len())?;
        Ok(&items[idx])
    }

    pub fn weighted_choice<'a, T>(&self, items: &'a [T], weights: &[f64]) -> Result<&'a T> {
        if items.len() != weights.len() {
            return Err(GenError::InvalidWeights(format!(
                "{} items but {} weights",
                items.len(),
                weights.len()
            )));
        }
        let idx = self.weighted_index(weights)?;
        Ok(&items[idx])
    }

    /// Index drawn proportionally to `weights`. Zero-weight entries are never picked.
    pub fn weighted_index(&self, weights: &[f64]) -> Result<usize> {
        if weights.is_empty() {
            return Err(GenError::EmptyChoice);
        }
        let total = validate_weights(weights)?;

        let target = self.unit()? * total;
        let mut acc = 0.0;
        let mut last_positive = 0;
        for (i, w) in weights.iter().enumerate() {
            if *w <= 0.0 {
                continue;
            }
            acc += w;
            last_positive = i;
            if target < acc {
                return Ok(i);
            }
        }
        // Float rounding can leave target == total.
        Ok(last_positive)
    }

    /// Fisher-Yates into a fresh vector; the caller's slice is untouched.
    pub fn shuffle<T: Clone>(&self, items: &[T]) -> Result<Vec<T>> {
        let mut out = items.to_vec();
        for i in (1..out.len()).rev() {
            let j = self.below(i + 1)?;
            out.swap(i, j);
        }
        Ok(out)
    }

    /// Inclusive on both ends.
    pub fn randint(&self, min: i64, max: i64) -> Result<i64> {
        if min > max {
            return Err(GenError::InvalidWeights(format!(
                "randint range {min}..={max} is empty"
            )));
        }
        let span = (max - min) as usize + 1;
        Ok(min + self.below(span)? as i64)
    }
}

/// Sum of weights; rejects negative, non-finite and all-zero weight sets.
pub fn validate_weights(weights: &[f64]) -> Result<f64> {
    if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
        return Err(GenError::InvalidWeights(format!("weight {bad} is not a finite non-negative number")));
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(GenError::InvalidWeights("weights sum to zero".into()));
    }
    Ok(total)
}

/// Deterministic source for tests. Pops scripted values and falls back to
/// `0` / `0.0` once a script runs out; `below` results are clamped into range.
#[derive(Debug, Default)]
pub struct ScriptedRandom {
    belows: Mutex<VecDeque<usize>>,
    units: Mutex<VecDeque<f64>>,
}

impl ScriptedRandom {
    pub fn new(belows: impl IntoIterator<Item = usize>, units: impl IntoIterator<Item = f64>) -> Self {
        Self {
            belows: Mutex::new(belows.into_iter().collect()),
            units: Mutex::new(units.into_iter().collect()),
        }
    }

    /// Always picks the first candidate.
    pub fn zeros() -> Self {
        Self::default()
    }
}

impl RandomSource for ScriptedRandom {
    fn below(&self, upper: usize) -> Result<usize> {
        if upper == 0 {
            return Err(GenError::EmptyChoice);
        }
        let v = self.belows.lock().pop_front().unwrap_or(0);
        Ok(v.min(upper - 1))
    }

    fn unit(&self) -> Result<f64> {
        let v = self.units.lock().pop_front().unwrap_or(0.0);
        Ok(v.clamp(0.0, 0.999_999_999))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn secure() -> Arc<dyn RandomSource> {
        Arc::new(SecureRandom::new())
    }

    #[test]
    fn test_below_stays_in_range() {
        let rng = secure();
        for upper in [1usize, 2, 3, 7, 100] {
            for _ in 0..200 {
                assert!(rng.below(upper).unwrap() < upper);
            }
        }
    }

    #[test]
    fn test_choice_on_empty_fails() {
        let rng = secure();
        let empty: Vec<u8> = vec![];
        assert!(matches!(rng.choice(&empty), Err(GenError::EmptyChoice)));
    }

    #[test]
    fn test_shuffle_is_permutation_and_leaves_input() {
        let rng = secure();
        let input: Vec<u32> = (0..50).collect();
        let shuffled = rng.shuffle(&input).unwrap();
        assert_eq!(input, (0..50).collect::<Vec<_>>());
        let a: HashSet<_> = input.iter().collect();
        let b: HashSet<_> = shuffled.iter().collect();
        assert_eq!(a, b);
        assert_eq!(shuffled.len(), 50);
    }

    #[test]
    fn test_weighted_never_picks_zero_weight() {
        let rng = secure();
        let items = ["a", "b", "c"];
        for _ in 0..500 {
            let picked = rng.weighted_choice(&items, &[1.0, 0.0, 3.0]).unwrap();
            assert_ne!(*picked, "b");
        }
    }

    #[test]
    fn test_weighted_rejects_bad_weights() {
        let rng = secure();
        assert!(rng.weighted_index(&[0.0, 0.0]).is_err());
        assert!(rng.weighted_index(&[1.0, -1.0]).is_err());
        assert!(rng.weighted_index(&[f64::NAN]).is_err());
        assert!(rng.weighted_choice(&["a"], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_randint_inclusive() {
        let rng = secure();
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let v = rng.randint(18, 20).unwrap();
            assert!((18..=20).contains(&v));
            seen.insert(v);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_scripted_weighted_uses_unit() {
        let rng: Arc<dyn RandomSource> = Arc::new(ScriptedRandom::new([], [0.6]));
        // cumulative: 1.0, 2.0 of total 2.0 -> 0.6 * 2.0 = 1.2 lands in the second bucket
        assert_eq!(rng.weighted_index(&[1.0, 1.0]).unwrap(), 1);
    }
}
