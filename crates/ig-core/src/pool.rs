//! Element pools: weighted sets of prompt fragments per category, with
//! per-batch usage markers.
//!
//! All pool state sits behind one mutex. `select` picks and marks inside the
//! same critical section, so two workers racing for the last unused element
//! of a no-repeat pool can never both get it.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::element::{Element, ElementCategory, ElementId, ExhaustionPolicy, RepeatPolicy};
use crate::error::{GenError, Result};
use crate::history::PoolHistory;
use crate::random::{RandomSource, validate_weights};

/// Bonus used by `RecentWindow` to favour rarely picked elements.
const RARITY_BONUS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolPolicy {
    pub repeat: RepeatPolicy,
    pub on_exhausted: ExhaustionPolicy,
}

#[derive(Debug)]
struct PoolState {
    policy: PoolPolicy,
    elements: Vec<Element>,
    weights: Vec<f64>,
    /// Usage markers for the current batch.
    used: HashSet<ElementId>,
    /// Selection counts since registration.
    counts: HashMap<ElementId, u64>,
    recent: VecDeque<ElementId>,
    /// Bumped whenever usage markers are cleared.
    epoch: u64,
}

impl PoolState {
    fn clear_used(&mut self) {
        self.used.clear();
        self.epoch += 1;
    }

    fn candidates(&self, exclude: &HashSet<ElementId>) -> Vec<usize> {
        (0..self.elements.len())
            .filter(|&i| self.weights[i] > 0.0 && !exclude.contains(&self.elements[i].id))
            .collect()
    }

    fn count(&self, id: &str) -> u64 {
        self.counts.get(id).copied().unwrap_or(0)
    }
}

pub struct PoolManager {
    rng: Arc<dyn RandomSource>,
    pools: Mutex<HashMap<ElementCategory, PoolState>>,
}

impl PoolManager {
    pub fn new(rng: Arc<dyn RandomSource>) -> Self {
        Self {
            rng,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the pool for `category`. Usage markers and counts start fresh.
    pub fn register_pool(
        &self,
        category: ElementCategory,
        elements: Vec<Element>,
        weights: Vec<f64>,
        policy: PoolPolicy,
    ) -> Result<()> {
        let invalid = |reason: String| GenError::InvalidPool { category, reason };

        if elements.is_empty() {
            return Err(invalid("no elements".into()));
        }
        if elements.len() != weights.len() {
            return Err(invalid(format!(
                "{} elements but {} weights",
                elements.len(),
                weights.len()
            )));
        }
        validate_weights(&weights).map_err(|e| invalid(e.to_string()))?;

        let mut seen = HashSet::new();
        for element in &elements {
            if !seen.insert(element.id.as_str()) {
                return Err(invalid(format!("duplicate element id '{}'", element.id)));
            }
        }

        debug!(%category, elements = elements.len(), ?policy, "Registered element pool");

        self.pools.lock().insert(
            category,
            PoolState {
                policy,
                elements,
                weights,
                used: HashSet::new(),
                counts: HashMap::new(),
                recent: VecDeque::new(),
                epoch: 0,
            },
        );
        Ok(())
    }

    pub fn has_pool(&self, category: ElementCategory) -> bool {
        self.pools.lock().contains_key(&category)
    }

    pub fn policy(&self, category: ElementCategory) -> Option<PoolPolicy> {
        self.pools.lock().get(&category).map(|p| p.policy)
    }

    /// Pick one element and mark it used before returning it.
    ///
    /// `exclude` removes ids from consideration for this call. For
    /// `RepeatAllowedWeighted` and `RecentWindow` an exclude set that rules out
    /// every element is ignored; for `NoRepeatPerBatch` it yields `PoolExhausted`.
    pub fn select(&self, category: ElementCategory, exclude: &HashSet<ElementId>) -> Result<Element> {
        let mut pools = self.pools.lock();
        let pool = pools.get_mut(&category).ok_or_else(|| GenError::InvalidPool {
            category,
            reason: "no pool registered".into(),
        })?;

        let idx = match pool.policy.repeat {
            RepeatPolicy::NoRepeatPerBatch => {
                let candidates: Vec<usize> = pool
                    .candidates(exclude)
                    .into_iter()
                    .filter(|&i| !pool.used.contains(&pool.elements[i].id))
                    .collect();
                if candidates.is_empty() {
                    return Err(GenError::PoolExhausted(category));
                }
                let weights: Vec<f64> = candidates.iter().map(|&i| pool.weights[i]).collect();
                candidates[self.rng.weighted_index(&weights)?]
            }
            RepeatPolicy::RepeatAllowedWeighted => {
                let mut candidates = pool.candidates(exclude);
                if candidates.is_empty() {
                    candidates = pool.candidates(&HashSet::new());
                }
                let weights: Vec<f64> = candidates.iter().map(|&i| pool.weights[i]).collect();
                candidates[self.rng.weighted_index(&weights)?]
            }
            RepeatPolicy::RecentWindow { window } => {
                let mut base = pool.candidates(exclude);
                if base.is_empty() {
                    base = pool.candidates(&HashSet::new());
                }
                let mut candidates: Vec<usize> = base
                    .iter()
                    .copied()
                    .filter(|&i| !pool.recent.contains(&pool.elements[i].id))
                    .collect();
                if candidates.is_empty() {
                    pool.recent.clear();
                    candidates = base;
                }

                let min_count = candidates
                    .iter()
                    .map(|&i| pool.count(&pool.elements[i].id))
                    .min()
                    .unwrap_or(0);
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|&i| {
                        let count = pool.count(&pool.elements[i].id);
                        let rarity = (min_count + RARITY_BONUS).saturating_sub(count).max(1);
                        pool.weights[i] * rarity as f64
                    })
                    .collect();
                let idx = candidates[self.rng.weighted_index(&weights)?];

                if window > 0 {
                    pool.recent.push_back(pool.elements[idx].id.clone());
                    while pool.recent.len() > window {
                        pool.recent.pop_front();
                    }
                }
                idx
            }
        };

        let element = pool.elements[idx].clone();
        pool.used.insert(element.id.clone());
        *pool.counts.entry(element.id.clone()).or_default() += 1;

        debug!(%category, id = %element.id, "Selected element");
        Ok(element)
    }

    /// Undo a selection that was never consumed.
    pub fn release(&self, category: ElementCategory, id: &str) {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get_mut(&category) {
            if pool.used.remove(id) {
                if let Some(count) = pool.counts.get_mut(id) {
                    *count = count.saturating_sub(1);
                }
                if pool.recent.back().map(String::as_str) == Some(id) {
                    pool.recent.pop_back();
                }
            }
        }
    }

    /// Clear the usage markers of one category.
    pub fn reset(&self, category: ElementCategory) -> Result<()> {
        let mut pools = self.pools.lock();
        let pool = pools.get_mut(&category).ok_or_else(|| GenError::InvalidPool {
            category,
            reason: "no pool registered".into(),
        })?;
        info!(%category, used = pool.used.len(), "Resetting element pool");
        pool.clear_used();
        Ok(())
    }

    /// Reset generation of every pool, to pair with [`reset_if_unchanged`].
    ///
    /// [`reset_if_unchanged`]: PoolManager::reset_if_unchanged
    pub fn epochs(&self) -> HashMap<ElementCategory, u64> {
        self.pools.lock().iter().map(|(cat, p)| (*cat, p.epoch)).collect()
    }

    /// Reset `category` unless someone else already did since `seen` was
    /// read. Returns whether this call reset it. Check and reset share one
    /// critical section, so concurrent callers that saw the same exhaustion
    /// reset at most once and never wipe picks made after the first reset.
    pub fn reset_if_unchanged(&self, category: ElementCategory, seen: u64) -> Result<bool> {
        let mut pools = self.pools.lock();
        let pool = pools.get_mut(&category).ok_or_else(|| GenError::InvalidPool {
            category,
            reason: "no pool registered".into(),
        })?;
        if pool.epoch != seen {
            debug!(%category, seen, now = pool.epoch, "Pool already reset");
            return Ok(false);
        }
        info!(%category, used = pool.used.len(), "Resetting element pool");
        pool.clear_used();
        Ok(true)
    }

    /// Clear usage markers of every pool. Called when a new batch run starts.
    pub fn begin_batch(&self) {
        for pool in self.pools.lock().values_mut() {
            pool.clear_used();
        }
    }

    /// Unused elements left in a category for the current batch.
    pub fn remaining(&self, category: ElementCategory) -> Option<usize> {
        self.pools.lock().get(&category).map(|p| {
            p.elements
                .iter()
                .zip(&p.weights)
                .filter(|(e, w)| **w > 0.0 && !p.used.contains(&e.id))
                .count()
        })
    }

    /// Counts and recent windows of every pool, for saving across restarts.
    pub fn history(&self) -> PoolHistory {
        let pools = self.pools.lock();
        let mut history = PoolHistory {
            saved_at: Some(chrono::Utc::now()),
            ..PoolHistory::default()
        };
        for (category, pool) in pools.iter() {
            history
                .histories
                .insert(*category, pool.recent.iter().cloned().collect());
            history.counters.insert(
                *category,
                pool.counts.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            );
        }
        history
    }

    /// Take counts and recent windows from a saved history. Entries for
    /// unregistered categories or unknown element ids are dropped. Returns
    /// how many registered pools were touched.
    pub fn restore(&self, history: &PoolHistory) -> usize {
        let mut pools = self.pools.lock();
        let mut restored = 0;
        for (category, pool) in pools.iter_mut() {
            let counters = history.counters.get(category);
            let recent = history.histories.get(category);
            if counters.is_none() && recent.is_none() {
                continue;
            }
            let known: HashSet<&str> = pool.elements.iter().map(|e| e.id.as_str()).collect();

            if let Some(counters) = counters {
                pool.counts = counters
                    .iter()
                    .filter(|(id, _)| known.contains(id.as_str()))
                    .map(|(id, n)| (id.clone(), *n))
                    .collect();
            }
            pool.recent.clear();
            if let (Some(recent), RepeatPolicy::RecentWindow { window }) = (recent, pool.policy.repeat) {
                let kept: Vec<&ElementId> = recent.iter().filter(|id| known.contains(id.as_str())).collect();
                let skip = kept.len().saturating_sub(window);
                pool.recent.extend(kept.into_iter().skip(skip).cloned());
            }
            debug!(%category, counts = pool.counts.len(), recent = pool.recent.len(), "Restored pool history");
            restored += 1;
        }
        restored
    }

    pub fn usage_stats(&self) -> BTreeMap<ElementCategory, BTreeMap<ElementId, u64>> {
        self.pools
            .lock()
            .iter()
            .map(|(cat, p)| {
                let counts = p.counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
                (*cat, counts)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{ScriptedRandom, SecureRandom};
    use std::sync::Barrier;

    fn elements(n: usize) -> Vec<Element> {
        (0..n)
            .map(|i| Element::new(format!("e{i}"), format!("fragment {i}")))
            .collect()
    }

    fn no_repeat() -> PoolPolicy {
        PoolPolicy {
            repeat: RepeatPolicy::NoRepeatPerBatch,
            on_exhausted: ExhaustionPolicy::Skip,
        }
    }

    fn manager() -> PoolManager {
        PoolManager::new(Arc::new(SecureRandom::new()))
    }

    #[test]
    fn test_register_rejects_empty_and_mismatch() {
        let pools = manager();
        let err = pools
            .register_pool(ElementCategory::Pose, vec![], vec![], no_repeat())
            .unwrap_err();
        assert!(matches!(err, GenError::InvalidPool { .. }));

        let err = pools
            .register_pool(ElementCategory::Pose, elements(2), vec![1.0], no_repeat())
            .unwrap_err();
        assert!(matches!(err, GenError::InvalidPool { .. }));

        let dup = vec![Element::new("a", "x"), Element::new("a", "y")];
        assert!(pools
            .register_pool(ElementCategory::Pose, dup, vec![1.0, 1.0], no_repeat())
            .is_err());
    }

    #[test]
    fn test_no_repeat_hands_out_each_element_once() {
        let pools = manager();
        pools
            .register_pool(ElementCategory::Pose, elements(5), vec![1.0; 5], no_repeat())
            .unwrap();

        let mut seen = HashSet::new();
        for _ in 0..5 {
            let e = pools.select(ElementCategory::Pose, &HashSet::new()).unwrap();
            assert!(seen.insert(e.id));
        }
        assert_eq!(pools.remaining(ElementCategory::Pose), Some(0));
        let err = pools.select(ElementCategory::Pose, &HashSet::new()).unwrap_err();
        assert!(matches!(err, GenError::PoolExhausted(ElementCategory::Pose)));
    }

    #[test]
    fn test_reset_allows_fresh_selection() {
        let pools = manager();
        pools
            .register_pool(ElementCategory::Style, elements(1), vec![1.0], no_repeat())
            .unwrap();
        pools.select(ElementCategory::Style, &HashSet::new()).unwrap();
        assert!(pools.select(ElementCategory::Style, &HashSet::new()).is_err());

        pools.reset(ElementCategory::Style).unwrap();
        assert!(pools.select(ElementCategory::Style, &HashSet::new()).is_ok());
    }

    #[test]
    fn test_stale_reset_keeps_picks_made_after_first_reset() {
        let pools = manager();
        pools
            .register_pool(ElementCategory::Pose, elements(2), vec![1.0; 2], no_repeat())
            .unwrap();
        pools.select(ElementCategory::Pose, &HashSet::new()).unwrap();
        pools.select(ElementCategory::Pose, &HashSet::new()).unwrap();

        // Two workers both observe exhaustion at the same generation.
        let seen = pools.epochs()[&ElementCategory::Pose];
        assert!(pools.reset_if_unchanged(ElementCategory::Pose, seen).unwrap());
        pools.select(ElementCategory::Pose, &HashSet::new()).unwrap();

        assert!(!pools.reset_if_unchanged(ElementCategory::Pose, seen).unwrap());
        assert_eq!(pools.remaining(ElementCategory::Pose), Some(1));
    }

    #[test]
    fn test_exclude_and_release() {
        let pools = manager();
        pools
            .register_pool(ElementCategory::Background, elements(2), vec![1.0; 2], no_repeat())
            .unwrap();
        let exclude: HashSet<String> = ["e0".to_string()].into_iter().collect();
        let e = pools.select(ElementCategory::Background, &exclude).unwrap();
        assert_eq!(e.id, "e1");
        assert!(pools.select(ElementCategory::Background, &exclude).is_err());

        pools.release(ElementCategory::Background, "e1");
        assert_eq!(pools.remaining(ElementCategory::Background), Some(2));
        assert_eq!(pools.usage_stats()[&ElementCategory::Background]["e1"], 0);
    }

    #[test]
    fn test_concurrent_race_for_last_element() {
        let pools = Arc::new(manager());
        pools
            .register_pool(ElementCategory::Pose, elements(3), vec![1.0; 3], no_repeat())
            .unwrap();
        pools.select(ElementCategory::Pose, &HashSet::new()).unwrap();
        pools.select(ElementCategory::Pose, &HashSet::new()).unwrap();

        let workers = 8;
        let barrier = Barrier::new(workers);
        let outcomes: Vec<Result<Element>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        pools.select(ElementCategory::Pose, &HashSet::new())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let ok = outcomes.iter().filter(|o| o.is_ok()).count();
        let exhausted = outcomes
            .iter()
            .filter(|o| matches!(o, Err(GenError::PoolExhausted(_))))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(exhausted, workers - 1);
    }

    #[test]
    fn test_weighted_repeats_and_skips_zero_weight() {
        let pools = manager();
        pools
            .register_pool(
                ElementCategory::Outfit,
                elements(3),
                vec![1.0, 0.0, 1.0],
                PoolPolicy {
                    repeat: RepeatPolicy::RepeatAllowedWeighted,
                    on_exhausted: ExhaustionPolicy::Skip,
                },
            )
            .unwrap();
        for _ in 0..100 {
            let e = pools.select(ElementCategory::Outfit, &HashSet::new()).unwrap();
            assert_ne!(e.id, "e1");
        }
        let total: u64 = pools.usage_stats()[&ElementCategory::Outfit].values().sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_recent_window_avoids_last_picks() {
        // Scripted unit 0.0 always takes the first remaining candidate.
        let pools = PoolManager::new(Arc::new(ScriptedRandom::zeros()));
        pools
            .register_pool(
                ElementCategory::Hairstyle,
                elements(3),
                vec![1.0; 3],
                PoolPolicy {
                    repeat: RepeatPolicy::RecentWindow { window: 2 },
                    on_exhausted: ExhaustionPolicy::Skip,
                },
            )
            .unwrap();
        let picks: Vec<String> = (0..4)
            .map(|_| pools.select(ElementCategory::Hairstyle, &HashSet::new()).unwrap().id)
            .collect();
        assert_eq!(picks, vec!["e0", "e1", "e2", "e0"]);
    }

    #[test]
    fn test_unregistered_category() {
        let pools = manager();
        assert!(!pools.has_pool(ElementCategory::Expression));
        assert!(pools.select(ElementCategory::Expression, &HashSet::new()).is_err());
        assert!(pools.reset(ElementCategory::Expression).is_err());
    }
}
