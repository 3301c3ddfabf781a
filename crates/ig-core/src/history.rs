//! Pool usage carried across process restarts.
//!
//! Without it every start would forget which elements were picked recently
//! and how often, and a daily run could repeat yesterday's picks at once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::element::{ElementCategory, ElementId};
use crate::error::{GenError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolHistory {
    /// Recent-window contents per category, oldest first.
    #[serde(default)]
    pub histories: BTreeMap<ElementCategory, Vec<ElementId>>,
    /// Selection counts per category and element.
    #[serde(default)]
    pub counters: BTreeMap<ElementCategory, BTreeMap<ElementId, u64>>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl PoolHistory {
    /// Read a history file. A file that does not exist yet is `None`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No pool history yet");
                return Ok(None);
            }
            Err(e) => return Err(persistence(path, e)),
        };
        let history = serde_json::from_slice(&raw)
            .map_err(|e| GenError::Persistence(format!("{}: {e}", path.display())))?;
        Ok(Some(history))
    }

    /// Write to a sibling temp file, then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| persistence(parent, e))?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?).map_err(|e| persistence(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(persistence(path, e));
        }
        info!(
            path = %path.display(),
            selections = self.counters.values().flat_map(|c| c.values()).sum::<u64>(),
            "Saved pool history"
        );
        Ok(())
    }
}

fn persistence(path: &Path, e: std::io::Error) -> GenError {
    GenError::Persistence(format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use crate::element::{Element, ExhaustionPolicy, RepeatPolicy};
    use crate::pool::{PoolManager, PoolPolicy};
    use crate::random::ScriptedRandom;

    fn manager() -> PoolManager {
        let pools = PoolManager::new(Arc::new(ScriptedRandom::zeros()));
        let elements = (0..4).map(|i| Element::new(format!("bg{i}"), format!("place {i}"))).collect();
        pools
            .register_pool(
                ElementCategory::Background,
                elements,
                vec![1.0; 4],
                PoolPolicy {
                    repeat: RepeatPolicy::RecentWindow { window: 2 },
                    on_exhausted: ExhaustionPolicy::Reset,
                },
            )
            .unwrap();
        pools
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("element_history.json");

        let before = manager();
        for _ in 0..2 {
            before.select(ElementCategory::Background, &HashSet::new()).unwrap();
        }
        let history = before.history();
        assert_eq!(history.histories[&ElementCategory::Background], vec!["bg0", "bg1"]);
        history.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = PoolHistory::load(&path).unwrap().unwrap();
        assert_eq!(loaded.counters, history.counters);

        let after = manager();
        assert_eq!(after.restore(&loaded), 1);
        assert_eq!(after.usage_stats(), before.usage_stats());
        // The restored window still keeps bg0 and bg1 out; the rarity bias
        // favours the two never-picked elements.
        let next = after.select(ElementCategory::Background, &HashSet::new()).unwrap();
        assert_eq!(next.id, "bg2");
    }

    #[test]
    fn test_unknown_entries_are_dropped() {
        let mut history = PoolHistory::default();
        history.counters.insert(
            ElementCategory::Background,
            BTreeMap::from([("bg1".to_string(), 3), ("retired".to_string(), 9)]),
        );
        history.counters.insert(ElementCategory::Outfit, BTreeMap::from([("coat".to_string(), 1)]));
        history
            .histories
            .insert(ElementCategory::Background, vec!["retired".into(), "bg3".into()]);

        let pools = manager();
        assert_eq!(pools.restore(&history), 1);
        let usage = pools.usage_stats();
        assert_eq!(usage[&ElementCategory::Background].get("bg1"), Some(&3));
        assert!(!usage[&ElementCategory::Background].contains_key("retired"));
        assert_eq!(pools.history().histories[&ElementCategory::Background], vec!["bg3"]);
    }

    #[test]
    fn test_missing_file_and_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PoolHistory::load(&dir.path().join("none.json")).unwrap(), None);

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, b"{ not json").unwrap();
        assert!(matches!(
            PoolHistory::load(&corrupt).unwrap_err(),
            GenError::Persistence(_)
        ));
    }
}
