use std::collections::BTreeMap;

/// Split `batch_size` across `genres`.
///
/// Each genre gets `max(1, floor(batch_size * ratio))`, ratio defaulting to
/// an even share. Whatever the floors leave over goes to the first genre.
pub fn plan_daily(batch_size: u64, genres: &[String], distribution: &BTreeMap<String, f64>) -> Vec<(String, u64)> {
    if genres.is_empty() {
        return Vec::new();
    }
    let even = 1.0 / genres.len() as f64;
    let floors: Vec<u64> = genres
        .iter()
        .map(|g| {
            let ratio = distribution.get(g).copied().unwrap_or(even);
            (batch_size as f64 * ratio).floor().max(0.0) as u64
        })
        .collect();
    let remainder = batch_size as i64 - floors.iter().sum::<u64>() as i64;

    genres
        .iter()
        .zip(&floors)
        .enumerate()
        .map(|(idx, (genre, floor))| {
            let mut count = *floor as i64;
            if idx == 0 {
                count += remainder;
            }
            (genre.clone(), count.max(1) as u64)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_even_split_with_remainder_on_first() {
        let plan = plan_daily(10, &names(&["normal", "gyal", "seiso"]), &BTreeMap::new());
        assert_eq!(
            plan,
            vec![("normal".into(), 4), ("gyal".into(), 3), ("seiso".into(), 3)]
        );
    }

    #[test]
    fn test_explicit_ratios_and_minimum_one() {
        let dist = BTreeMap::from([("normal".to_string(), 0.95), ("gyal".to_string(), 0.01)]);
        let plan = plan_daily(20, &names(&["normal", "gyal"]), &dist);
        // floors 19 and 0, remainder 1 to the first; the second is lifted to 1
        assert_eq!(plan, vec![("normal".into(), 20), ("gyal".into(), 1)]);
    }

    #[test]
    fn test_no_genres() {
        assert!(plan_daily(10, &[], &BTreeMap::new()).is_empty());
    }
}
