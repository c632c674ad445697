//! Loose dotted-version comparison for service version gates.
//!
//! Service versions look like `3.4.1`, `4.0.0b3` or `3.6`. Each dotted
//! component is compared numerically on its leading digits; missing
//! components count as zero. Pre-release suffixes are ignored.

use std::cmp::Ordering;

/// Compare two dotted version strings.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = components(a);
    let right = components(b);
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

/// Whether `version` is strictly older than `threshold`.
pub fn is_older_than(version: &str, threshold: &str) -> bool {
    compare_versions(version, threshold) == Ordering::Less
}

fn components(version: &str) -> Vec<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}
