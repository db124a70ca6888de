//! Forbidden-position interlocks.
//!
//! An interlock names a combination of axis ranges that must not be reached
//! together. It matches when every one of its ranges contains the current
//! position of its axis.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::AxisId;

/// Positions within this distance of a bound count as outside the range.
pub const INTERLOCK_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterlockRange {
    pub axis: AxisId,
    /// Open lower bound, unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Open upper bound, unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl InterlockRange {
    pub fn contains(&self, position: f64) -> bool {
        let above = self
            .min
            .is_none_or(|min| position > min + INTERLOCK_TOLERANCE);
        let below = self
            .max
            .is_none_or(|max| position < max - INTERLOCK_TOLERANCE);
        above && below
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interlock {
    pub label: String,
    #[serde(default)]
    pub description: String,
    pub ranges: Vec<InterlockRange>,
}

impl Interlock {
    pub fn matches(&self, positions: &HashMap<AxisId, f64>) -> bool {
        !self.ranges.is_empty()
            && self.ranges.iter().all(|range| {
                positions
                    .get(&range.axis)
                    .is_some_and(|&position| range.contains(position))
            })
    }
}

/// Labels of the interlocks matched by `positions`.
pub fn evaluate<'a>(interlocks: &'a [Interlock], positions: &HashMap<AxisId, f64>) -> Vec<&'a Interlock> {
    interlocks
        .iter()
        .filter(|interlock| interlock.matches(positions))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(axis: &str, min: Option<f64>, max: Option<f64>) -> InterlockRange {
        InterlockRange {
            axis: AxisId::from(axis),
            min,
            max,
        }
    }

    fn positions(values: &[(&str, f64)]) -> HashMap<AxisId, f64> {
        values
            .iter()
            .map(|&(axis, position)| (AxisId::from(axis), position))
            .collect()
    }

    #[test]
    fn bounds_are_strict_with_tolerance() {
        let r = range("PM1Y", Some(10.0), Some(20.0));
        assert!(r.contains(15.0));
        assert!(!r.contains(10.0));
        assert!(!r.contains(10.00005));
        assert!(r.contains(10.0002));
        assert!(!r.contains(20.0));
        assert!(!r.contains(f64::NAN));
    }

    #[test]
    fn missing_bound_is_open() {
        assert!(range("PM1Y", None, Some(5.0)).contains(-1e9));
        assert!(range("PM1Y", Some(5.0), None).contains(1e9));
        assert!(range("PM1Y", None, None).contains(0.0));
    }

    #[test]
    fn all_ranges_must_match() {
        let interlock = Interlock {
            label: "beam clip".to_string(),
            description: "mirror 1 in while mirror 2 is retracted".to_string(),
            ranges: vec![
                range("PM1Y", Some(100.0), None),
                range("PM2Y", None, Some(10.0)),
            ],
        };

        assert!(interlock.matches(&positions(&[("PM1Y", 150.0), ("PM2Y", 5.0)])));
        assert!(!interlock.matches(&positions(&[("PM1Y", 150.0), ("PM2Y", 50.0)])));
        assert!(!interlock.matches(&positions(&[("PM1Y", 150.0)])));

        let matched = evaluate(
            std::slice::from_ref(&interlock),
            &positions(&[("PM1Y", 150.0), ("PM2Y", 5.0)]),
        );
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn empty_interlock_never_matches() {
        let interlock = Interlock {
            label: "empty".to_string(),
            description: String::new(),
            ranges: Vec::new(),
        };
        assert!(!interlock.matches(&HashMap::new()));
    }
}
