//! Split specification and its resolution into contiguous index ranges.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitUnit {
    #[serde(rename = "%", alias = "percent")]
    Percent,
    #[serde(rename = "count", alias = "abs", alias = "absolute")]
    Count,
}

impl fmt::Display for SplitUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitUnit::Percent => write!(f, "%"),
            SplitUnit::Count => write!(f, "count"),
        }
    }
}

/// `[train, val, test, unit]`. The test share is informational: the test split always takes
/// whatever train and val leave over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, u64, u64, SplitUnit)", into = "(u64, u64, u64, SplitUnit)")]
pub struct SplitSpec {
    pub train: u64,
    pub val: u64,
    pub test: u64,
    pub unit: SplitUnit,
}

impl From<(u64, u64, u64, SplitUnit)> for SplitSpec {
    fn from((train, val, test, unit): (u64, u64, u64, SplitUnit)) -> Self {
        Self {
            train,
            val,
            test,
            unit,
        }
    }
}

impl From<SplitSpec> for (u64, u64, u64, SplitUnit) {
    fn from(s: SplitSpec) -> Self {
        (s.train, s.val, s.test, s.unit)
    }
}

impl Default for SplitSpec {
    fn default() -> Self {
        Self::percent(80, 10, 10)
    }
}

impl SplitSpec {
    pub fn percent(train: u64, val: u64, test: u64) -> Self {
        Self {
            train,
            val,
            test,
            unit: SplitUnit::Percent,
        }
    }

    pub fn count(train: u64, val: u64, test: u64) -> Self {
        Self {
            train,
            val,
            test,
            unit: SplitUnit::Count,
        }
    }

    fn invalid(&self, total: usize, msg: impl Into<String>) -> ConfigError {
        ConfigError::InvalidSplit {
            train: self.train,
            val: self.val,
            test: self.test,
            unit: self.unit.to_string(),
            total,
            msg: msg.into(),
        }
    }

    /// Resolve against a corpus of `total` records. Percentages are floored; the test split
    /// absorbs the remainder.
    pub fn resolve(&self, total: usize) -> Result<SplitRanges, ConfigError> {
        let n = total as u128;
        let (train_len, val_len) = match self.unit {
            SplitUnit::Percent => (
                self.train as u128 * n / 100,
                self.val as u128 * n / 100,
            ),
            SplitUnit::Count => (self.train as u128, self.val as u128),
        };
        if train_len + val_len > n {
            return Err(self.invalid(
                total,
                format!("train ({train_len}) + val ({val_len}) exceed the corpus"),
            ));
        }
        let test_len = n - train_len - val_len;
        if train_len + val_len + test_len != n {
            return Err(self.invalid(total, "split lengths do not cover the corpus"));
        }

        let declared_matches = match self.unit {
            SplitUnit::Percent => self.train + self.val + self.test == 100,
            SplitUnit::Count => self.test as u128 == test_len,
        };
        if !declared_matches {
            warn!(
                declared = self.test,
                unit = %self.unit,
                resolved = test_len as u64,
                "test split absorbs the remainder"
            );
        }

        let (train_len, val_len) = (train_len as usize, val_len as usize);
        Ok(SplitRanges {
            train: 0..train_len,
            val: train_len..train_len + val_len,
            test: train_len + val_len..total,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitRanges {
    pub train: Range<usize>,
    pub val: Range<usize>,
    pub test: Range<usize>,
}

impl SplitRanges {
    pub fn lens(&self) -> (usize, usize, usize) {
        (self.train.len(), self.val.len(), self.test.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_cover(r: &SplitRanges, n: usize) {
        assert_eq!(r.train.start, 0);
        assert_eq!(r.train.end, r.val.start);
        assert_eq!(r.val.end, r.test.start);
        assert_eq!(r.test.end, n);
        let (a, b, c) = r.lens();
        assert_eq!(a + b + c, n);
    }

    #[test]
    fn percent_split_of_hundred() {
        let r = SplitSpec::percent(80, 10, 10).resolve(100).unwrap();
        assert_eq!(r.train, 0..80);
        assert_eq!(r.val, 80..90);
        assert_eq!(r.test, 90..100);
    }

    #[test]
    fn count_split_of_hundred() {
        let r = SplitSpec::count(70, 20, 10).resolve(100).unwrap();
        assert_eq!(r.train, 0..70);
        assert_eq!(r.val, 70..90);
        assert_eq!(r.test, 90..100);
    }

    // Shares that do not add up to 100% are accepted: test takes the rest.
    #[test]
    fn test_split_absorbs_the_remainder() {
        let r = SplitSpec::percent(60, 10, 10).resolve(100).unwrap();
        assert_eq!(r.lens(), (60, 10, 30));

        let r = SplitSpec::count(5, 5, 0).resolve(17).unwrap();
        assert_eq!(r.lens(), (5, 5, 7));
    }

    #[test]
    fn percent_rounding_goes_to_test() {
        for n in [0usize, 1, 7, 9, 33, 101, 999, 1234] {
            for (a, b, c) in [(80, 10, 10), (70, 15, 15), (34, 33, 33), (0, 0, 100), (100, 0, 0)] {
                let r = SplitSpec::percent(a, b, c).resolve(n).unwrap();
                check_cover(&r, n);
                assert_eq!(r.train.len(), a as usize * n / 100);
                assert_eq!(r.val.len(), b as usize * n / 100);
            }
        }
    }

    #[test]
    fn count_splits_cover_the_corpus() {
        for n in [0usize, 3, 50] {
            for a in 0..=n.min(10) {
                for b in 0..=(n - a).min(10) {
                    let c = (n - a - b) as u64;
                    let r = SplitSpec::count(a as u64, b as u64, c).resolve(n).unwrap();
                    check_cover(&r, n);
                }
            }
        }
    }

    #[test]
    fn oversized_splits_are_rejected() {
        assert!(matches!(
            SplitSpec::count(70, 40, 0).resolve(100),
            Err(ConfigError::InvalidSplit { total: 100, .. })
        ));
        assert!(SplitSpec::percent(90, 20, 0).resolve(10).is_err());
        assert!(SplitSpec::percent(150, 0, 0).resolve(10).is_err());
    }

    #[test]
    fn parses_the_four_tuple_form() {
        let s: SplitSpec = serde_json::from_str(r#"[80, 10, 10, "%"]"#).unwrap();
        assert_eq!(s, SplitSpec::percent(80, 10, 10));
        let s: SplitSpec = serde_json::from_str(r#"[70, 20, 10, "count"]"#).unwrap();
        assert_eq!(s, SplitSpec::count(70, 20, 10));
        assert!(serde_json::from_str::<SplitSpec>(r#"[70, 20, 10, "ratio"]"#).is_err());
        assert!(serde_json::from_str::<SplitSpec>(r#"[-1, 20, 10, "count"]"#).is_err());
        assert_eq!(
            serde_json::to_string(&SplitSpec::default()).unwrap(),
            r#"[80,10,10,"%"]"#
        );
    }
}
