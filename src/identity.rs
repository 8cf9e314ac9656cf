//! Stable, human-memorable anomaly identifiers.
//!
//! An id is three words picked by slicing a 32-bit string hash: an adjective,
//! a color from a severity palette, and a car model. The tables below are
//! indexed by hash value, so their order must never change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const ADJECTIVES: [&str; 32] = [
    "agile", "bold", "brisk", "clever", "daring", "eager", "fearless", "gallant",
    "hardy", "intrepid", "jaunty", "keen", "lively", "mighty", "nimble", "opulent",
    "plucky", "quick", "rugged", "sleek", "spirited", "steady", "swift", "tenacious",
    "valiant", "vivid", "wild", "zesty", "breezy", "dashing", "fierce", "gleaming",
];

const RED_PALETTE: [&str; 16] = [
    "crimson", "scarlet", "ruby", "cherry", "garnet", "vermilion", "carmine", "cardinal",
    "maroon", "burgundy", "cerise", "claret", "oxblood", "raspberry", "rosewood", "sangria",
];

const ORANGE_PALETTE: [&str; 16] = [
    "amber", "tangerine", "apricot", "saffron", "marigold", "copper", "rust", "ochre",
    "pumpkin", "persimmon", "tawny", "ginger", "cinnamon", "honey", "mango", "sunset",
];

const COOL_PALETTE: [&str; 16] = [
    "azure", "cobalt", "teal", "jade", "sapphire", "cerulean", "indigo", "emerald",
    "sage", "slate", "navy", "aqua", "mint", "glacier", "lagoon", "arctic",
];

const VEHICLES: [&str; 32] = [
    "miata", "beetle", "mustang", "corvette", "impreza", "civic", "golf", "mini",
    "supra", "camaro", "charger", "bronco", "wrangler", "outback", "prius", "accord",
    "corolla", "roadster", "cayman", "boxster", "quattro", "countach", "testarossa", "stratos",
    "delorean", "cobra", "thunderbird", "firebird", "skyline", "integra", "celica", "defender",
];

const MINUTE_MS: i64 = 60_000;

/// Identifier of one detected anomaly within one query scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnomalyId(String);

impl AnomalyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AnomalyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<AnomalyId> for String {
    fn from(id: AnomalyId) -> Self {
        id.0
    }
}

/// 32-bit polynomial (`h * 31 + c`) hash over UTF-16 code units.
pub fn string_hash(input: &str) -> i32 {
    input
        .encode_utf16()
        .fold(0i32, |h, c| h.wrapping_shl(5).wrapping_sub(h).wrapping_add(c as i32))
}

/// Lowercase base-36 rendering of `value`.
pub fn to_base36(mut value: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn palette(category: &str) -> &'static [&'static str; 16] {
    match category {
        "red" => &RED_PALETTE,
        "yellow" => &ORANGE_PALETTE,
        _ => &COOL_PALETTE,
    }
}

fn round_to_minute(t: DateTime<Utc>) -> i64 {
    let ms = t.timestamp_millis();
    (ms + MINUTE_MS / 2).div_euclid(MINUTE_MS) * MINUTE_MS
}

/// Derive the id for an anomaly. Start and end are rounded to the nearest
/// minute so small jitter between chart refreshes keeps the same id.
pub fn generate_id(
    time_filter: &str,
    filter_string: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    category: &str,
) -> AnomalyId {
    let input = format!(
        "{}|{}|{}|{}|{}",
        time_filter,
        filter_string,
        round_to_minute(start),
        round_to_minute(end),
        category
    );
    let hash = string_hash(&input).unsigned_abs() as usize;

    let colors = palette(category);
    let adjective = ADJECTIVES[hash % ADJECTIVES.len()];
    let color = colors[(hash / ADJECTIVES.len()) % colors.len()];
    let vehicle = VEHICLES[(hash / (ADJECTIVES.len() * colors.len())) % VEHICLES.len()];

    AnomalyId(format!("{}-{}-{}", adjective, color, vehicle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, h, m, s).unwrap()
    }

    #[test]
    fn test_string_hash_matches_polynomial() {
        assert_eq!(string_hash(""), 0);
        assert_eq!(string_hash("a"), 97);
        assert_eq!(string_hash("ab"), 97 * 31 + 98);
        // Overflow wraps rather than panicking.
        let long = "x".repeat(1000);
        let _ = string_hash(&long);
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(u32::MAX), "1z141z3");
    }

    #[test]
    fn test_generate_id_is_deterministic() {
        let a = generate_id("last 1h", "{}", at(10, 0, 0), at(10, 5, 0), "red");
        let b = generate_id("last 1h", "{}", at(10, 0, 0), at(10, 5, 0), "red");
        assert_eq!(a, b);
        assert_eq!(a.as_str().split('-').count(), 3);
    }

    #[test]
    fn test_generate_id_tolerates_sub_minute_jitter() {
        let a = generate_id("t", "f", at(10, 0, 0), at(10, 5, 0), "yellow");
        let b = generate_id("t", "f", at(10, 0, 20), at(10, 4, 41), "yellow");
        assert_eq!(a, b);
    }

    #[test]
    fn test_palettes_follow_category_and_are_disjoint() {
        let red: HashSet<_> = RED_PALETTE.iter().collect();
        let orange: HashSet<_> = ORANGE_PALETTE.iter().collect();
        let cool: HashSet<_> = COOL_PALETTE.iter().collect();
        assert!(red.is_disjoint(&orange));
        assert!(red.is_disjoint(&cool));
        assert!(orange.is_disjoint(&cool));

        let mut start = at(0, 0, 0);
        for _ in 0..50 {
            let end = start + Duration::minutes(7);
            for (category, pool) in [("red", &red), ("yellow", &orange), ("green", &cool)] {
                let id = generate_id("range", "{}", start, end, category);
                let color = id.as_str().split('-').nth(1).unwrap();
                assert!(pool.contains(&color), "{} not in {} palette", color, category);
            }
            start += Duration::minutes(13);
        }
    }
}
