//! Gatar distribution
//!
//! An allocation row records one aggregate quantity against an ordered set of gatars
//! (slots) plus an optional breakdown. [`distribute`] reconstructs the per-gatar
//! quantities from those three values alone; nothing about the split is stored, so the
//! output must be reproducible on every read.
//!
//! Rules, first match wins:
//!
//! 1. a single gatar receives everything;
//! 2. a breakdown with one entry per gatar maps positionally;
//! 3. a breakdown longer than the gatar list is poured in order into gatars of fixed
//!    capacity, the last gatar absorbing any excess;
//! 4. otherwise the quantity is split evenly, the first `quantity % n` gatars taking one
//!    extra unit.
//!
//! The comma-delimited encodings used by the `room_entries` table are parsed and
//! rendered here and nowhere else.

/// Units a gatar holds before rule 3 spills into the next one.
pub const DEFAULT_SLOT_CAPACITY: i64 = 200;

const DELIMITER: char = ',';

/// Per-gatar quantities using [`DEFAULT_SLOT_CAPACITY`].
pub fn distribute<S: AsRef<str>>(total: i64, slots: &[S], breakdown: Option<&[i64]>) -> Vec<i64> {
    distribute_with_capacity(total, slots, breakdown, DEFAULT_SLOT_CAPACITY)
}

pub fn distribute_with_capacity<S: AsRef<str>>(
    total: i64,
    slots: &[S],
    breakdown: Option<&[i64]>,
    capacity: i64,
) -> Vec<i64> {
    let n = slots.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![total];
    }

    match breakdown {
        Some(values) if values.len() == n => values.to_vec(),
        Some(values) if values.len() > n => pour(values, n, capacity),
        _ => even_split(total, n),
    }
}

fn pour(values: &[i64], n: usize, capacity: i64) -> Vec<i64> {
    let mut filled = vec![0i64; n];
    let last = n - 1;
    let mut current = 0usize;

    for &value in values {
        let mut remaining = value.max(0);
        while remaining > 0 {
            if current == last {
                filled[last] = filled[last].saturating_add(remaining);
                break;
            }
            let room = capacity - filled[current];
            if room <= 0 {
                current += 1;
                continue;
            }
            let take = room.min(remaining);
            filled[current] += take;
            remaining -= take;
            if filled[current] >= capacity {
                current += 1;
            }
        }
    }

    filled
}

fn even_split(total: i64, n: usize) -> Vec<i64> {
    let count = n as i64;
    let base = total.div_euclid(count);
    let remainder = total.rem_euclid(count) as usize;
    (0..n)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Per-gatar quantities after `amount` units leave `slot`.
///
/// Units come out of `slot` first, then from the remaining gatars in order. The result
/// has one entry per gatar, so rule 2 reproduces it exactly. Returns `None` when the
/// recorded split does not reconcile with the row quantity (legacy breakdowns that were
/// never kept in step), in which case callers drop the breakdown and let the even split
/// take over.
pub fn withdraw_from_slot<S: AsRef<str>>(
    quantity_before: i64,
    slots: &[S],
    breakdown: Option<&[i64]>,
    slot: &str,
    amount: i64,
    capacity: i64,
) -> Option<Vec<i64>> {
    let mut per_slot = distribute_with_capacity(quantity_before, slots, breakdown, capacity);
    if checked_total(&per_slot) != Some(quantity_before) || per_slot.iter().any(|&v| v < 0) {
        return None;
    }

    let mut remaining = amount;
    if let Some(i) = slots.iter().position(|s| s.as_ref() == slot) {
        let take = per_slot[i].min(remaining);
        per_slot[i] -= take;
        remaining -= take;
    }
    for value in per_slot.iter_mut() {
        if remaining == 0 {
            break;
        }
        let take = (*value).min(remaining);
        *value -= take;
        remaining -= take;
    }

    (remaining == 0).then_some(per_slot)
}

/// Sum of a breakdown, or `None` if it does not fit in an `i64`.
pub fn checked_total(values: &[i64]) -> Option<i64> {
    values.iter().try_fold(0i64, |acc, &v| acc.checked_add(v))
}

/// Splits a stored gatar list (`"10,11,12"`), trimming blanks.
pub fn parse_slots(encoded: &str) -> Vec<String> {
    encoded
        .split(DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn format_slots<S: AsRef<str>>(slots: &[S]) -> String {
    slots
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses a stored breakdown (`"200,200,100"`). Blank input is no breakdown.
///
/// # Errors
///
/// Returns the offending token when an entry is not an integer.
pub fn parse_breakdown(encoded: &str) -> Result<Option<Vec<i64>>, String> {
    let trimmed = encoded.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .split(DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|token| {
            token
                .parse::<i64>()
                .map_err(|_| format!("invalid breakdown entry '{token}'"))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

pub fn format_breakdown(values: &[i64]) -> String {
    values
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Checks a gatar list before it is written.
///
/// # Errors
///
/// Returns a description of the first problem found.
pub fn validate_slots<S: AsRef<str>>(slots: &[S]) -> Result<(), String> {
    if slots.is_empty() {
        return Err("at least one gatar is required".to_string());
    }
    for (i, slot) in slots.iter().enumerate() {
        let slot = slot.as_ref();
        if slot.trim().is_empty() {
            return Err(format!("gatar #{} is blank", i + 1));
        }
        if slot.contains(DELIMITER) {
            return Err(format!("gatar '{slot}' contains '{DELIMITER}'"));
        }
        if slots[..i].iter().any(|s| s.as_ref() == slot) {
            return Err(format!("gatar '{slot}' is listed twice"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn slots(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_slot_takes_everything() {
        assert_eq!(distribute(500, &["10"], None), vec![500]);
        assert_eq!(distribute(500, &["10"], Some(&[1, 2, 3])), vec![500]);
        assert_eq!(distribute(0, &["10"], Some(&[])), vec![0]);
    }

    #[test]
    fn test_exact_breakdown_maps_positionally() {
        let result = distribute(500, &slots(&["10", "11", "12"]), Some(&[200, 200, 100]));
        assert_eq!(result, vec![200, 200, 100]);
    }

    #[test]
    fn test_long_breakdown_fills_to_capacity() {
        // 150 + 150 + 100 + 50 poured into three gatars of 200
        let result = distribute(450, &slots(&["1", "2", "3"]), Some(&[150, 150, 100, 50]));
        assert_eq!(result, vec![200, 200, 50]);
        assert_eq!(result.iter().sum::<i64>(), 450);
    }

    #[test]
    fn test_long_breakdown_last_slot_absorbs_excess() {
        let result = distribute(700, &slots(&["1", "2"]), Some(&[300, 300, 100]));
        assert_eq!(result, vec![200, 500]);
    }

    #[test]
    fn test_long_breakdown_respects_custom_capacity() {
        let result =
            distribute_with_capacity(90, &slots(&["1", "2", "3"]), Some(&[30, 30, 30, 0]), 40);
        assert_eq!(result, vec![40, 40, 10]);
    }

    #[test]
    fn test_even_split_spreads_remainder_first() {
        assert_eq!(distribute(10, &slots(&["a", "b", "c"]), None), vec![4, 3, 3]);
        assert_eq!(distribute(11, &slots(&["a", "b", "c"]), None), vec![4, 4, 3]);
        assert_eq!(distribute(2, &slots(&["a", "b", "c"]), None), vec![1, 1, 0]);
    }

    #[test]
    fn test_short_breakdown_falls_back_to_even_split() {
        assert_eq!(
            distribute(9, &slots(&["a", "b", "c"]), Some(&[9])),
            vec![3, 3, 3]
        );
    }

    #[test]
    fn test_no_slots_yields_nothing() {
        let empty: Vec<String> = Vec::new();
        assert!(distribute(10, &empty, None).is_empty());
    }

    #[test]
    fn test_distribution_sums_to_total_for_random_inputs() {
        let mut rng = StdRng::seed_from_u64(0x6a7a);
        for _ in 0..2_000 {
            let n = rng.gen_range(1..8);
            let names: Vec<String> = (0..n).map(|i| i.to_string()).collect();
            let total: i64;
            let breakdown: Option<Vec<i64>> = match rng.gen_range(0..3) {
                0 => {
                    total = rng.gen_range(0..5_000);
                    None
                }
                1 => {
                    let values: Vec<i64> = (0..n).map(|_| rng.gen_range(0..400)).collect();
                    total = values.iter().sum();
                    Some(values)
                }
                _ => {
                    let len = n + rng.gen_range(1..6);
                    let values: Vec<i64> = (0..len).map(|_| rng.gen_range(0..400)).collect();
                    total = values.iter().sum();
                    Some(values)
                }
            };

            let result = distribute(total, &names, breakdown.as_deref());
            assert_eq!(result.len(), n);
            assert_eq!(result.iter().sum::<i64>(), total, "{names:?} {breakdown:?}");
            if breakdown.is_none() {
                let max = result.iter().max().copied().unwrap_or(0);
                let min = result.iter().min().copied().unwrap_or(0);
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn test_withdraw_prefers_named_slot_then_spills() {
        let names = slots(&["10", "11", "12"]);
        let after = withdraw_from_slot(500, &names, Some(&[200, 200, 100]), "12", 150, 200);
        assert_eq!(after, Some(vec![150, 200, 0]));
    }

    #[test]
    fn test_withdraw_from_unknown_slot_takes_in_order() {
        let names = slots(&["10", "11"]);
        let after = withdraw_from_slot(300, &names, Some(&[200, 100]), "99", 250, 200);
        assert_eq!(after, Some(vec![0, 50]));
    }

    #[test]
    fn test_withdraw_refuses_unreconciled_breakdown() {
        let names = slots(&["10", "11"]);
        // breakdown says 300 but the row only holds 250
        assert_eq!(
            withdraw_from_slot(250, &names, Some(&[200, 100]), "10", 10, 200),
            None
        );
    }

    #[test]
    fn test_oversized_breakdown_does_not_overflow() {
        let names = slots(&["10", "11"]);
        assert_eq!(checked_total(&[i64::MAX, 1]), None);
        assert_eq!(checked_total(&[200, 100]), Some(300));

        let poured = distribute_with_capacity(1, &names, Some(&[i64::MAX, i64::MAX, 3]), 200);
        assert_eq!(poured, vec![200, i64::MAX]);
        assert_eq!(
            withdraw_from_slot(1, &names, Some(&[i64::MAX, i64::MAX, 3]), "10", 1, 200),
            None
        );
    }

    #[test]
    fn test_slot_and_breakdown_codec() {
        assert_eq!(parse_slots("10, 11,,12 "), vec!["10", "11", "12"]);
        assert_eq!(format_slots(&["10", "11", "12"]), "10,11,12");
        assert_eq!(parse_breakdown("200, 200,100"), Ok(Some(vec![200, 200, 100])));
        assert_eq!(parse_breakdown("  "), Ok(None));
        assert!(parse_breakdown("200,x").is_err());
        assert_eq!(format_breakdown(&[200, 200, 100]), "200,200,100");
    }

    #[test]
    fn test_validate_slots() {
        assert!(validate_slots(&["10", "11"]).is_ok());
        assert!(validate_slots::<&str>(&[]).is_err());
        assert!(validate_slots(&["10", " "]).is_err());
        assert!(validate_slots(&["10,11"]).is_err());
        assert!(validate_slots(&["10", "10"]).is_err());
    }
}
