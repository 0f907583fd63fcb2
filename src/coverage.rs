//! C10 — CoverageTracker. Interval-merge bookkeeping used to avoid
//! rescanning already-analyzed ranges (SPEC_FULL.md §4.10). No direct
//! corpus precedent — a small self-contained data structure, following the
//! corpus's general habit of reaching for a focused helper rather than a
//! crate for a narrow, self-contained need.

const DEFAULT_MARGIN_SECS: f64 = 1.0;

/// A sorted, pairwise-disjoint set of closed intervals already analyzed by
/// one detector over one item's timeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageTracker {
    intervals: Vec<(f64, f64)>,
}

impl CoverageTracker {
    pub fn new() -> Self {
        CoverageTracker::default()
    }

    pub fn intervals(&self) -> &[(f64, f64)] {
        &self.intervals
    }

    /// Inserts `[start, end]`, then sorts and merges overlapping or
    /// touching intervals so the invariant (sorted, pairwise non-overlapping)
    /// holds after every mutation.
    pub fn add(&mut self, start: f64, end: f64) {
        if end <= start {
            return;
        }
        self.intervals.push((start, end));
        self.intervals.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut merged: Vec<(f64, f64)> = Vec::with_capacity(self.intervals.len());
        for &(s, e) in &self.intervals {
            if let Some(last) = merged.last_mut() {
                if s <= last.1 {
                    last.1 = last.1.max(e);
                    continue;
                }
            }
            merged.push((s, e));
        }
        self.intervals = merged;
    }

    /// Merges another tracker's intervals into this one (used when a
    /// partial silence-scan must consult the union of both trackers).
    pub fn merged_with(&self, other: &CoverageTracker) -> CoverageTracker {
        let mut combined = self.clone();
        for &(s, e) in &other.intervals {
            combined.add(s, e);
        }
        combined
    }

    /// True iff `[start + margin, end - margin]` lies entirely within the
    /// merged union (SPEC_FULL.md §4.10).
    pub fn is_covered(&self, start: f64, end: f64, margin: f64) -> bool {
        let inner_start = start + margin;
        let inner_end = end - margin;
        if inner_end <= inner_start {
            return true;
        }
        self.intervals
            .iter()
            .any(|&(s, e)| s <= inner_start && inner_end <= e)
    }

    pub fn is_covered_default_margin(&self, start: f64, end: f64) -> bool {
        self.is_covered(start, end, DEFAULT_MARGIN_SECS)
    }

    /// Returns the subranges of `[start, end]` not covered by any tracked
    /// interval. `uncovered(s, e) + merged_scanned = [s, e]` as a set.
    pub fn uncovered(&self, start: f64, end: f64) -> Vec<(f64, f64)> {
        if end <= start {
            return Vec::new();
        }

        let mut gaps = Vec::new();
        let mut cursor = start;

        for &(s, e) in &self.intervals {
            if e <= cursor {
                continue;
            }
            if s >= end {
                break;
            }
            let clipped_start = s.max(cursor);
            if clipped_start > cursor {
                gaps.push((cursor, clipped_start));
            }
            cursor = cursor.max(e.min(end));
            if cursor >= end {
                break;
            }
        }

        if cursor < end {
            gaps.push((cursor, end));
        }

        gaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_merges_overlapping_intervals() {
        let mut tracker = CoverageTracker::new();
        tracker.add(0.0, 10.0);
        tracker.add(5.0, 15.0);
        assert_eq!(tracker.intervals(), &[(0.0, 15.0)]);
    }

    #[test]
    fn add_merges_touching_intervals() {
        let mut tracker = CoverageTracker::new();
        tracker.add(0.0, 10.0);
        tracker.add(10.0, 20.0);
        assert_eq!(tracker.intervals(), &[(0.0, 20.0)]);
    }

    #[test]
    fn add_keeps_disjoint_intervals_separate() {
        let mut tracker = CoverageTracker::new();
        tracker.add(0.0, 10.0);
        tracker.add(20.0, 30.0);
        assert_eq!(tracker.intervals(), &[(0.0, 10.0), (20.0, 30.0)]);
    }

    #[test]
    fn add_out_of_order_still_sorts_and_merges() {
        let mut tracker = CoverageTracker::new();
        tracker.add(20.0, 30.0);
        tracker.add(0.0, 10.0);
        tracker.add(9.0, 21.0);
        assert_eq!(tracker.intervals(), &[(0.0, 30.0)]);
    }

    #[test]
    fn is_covered_respects_margin() {
        let mut tracker = CoverageTracker::new();
        tracker.add(2.0, 98.0);
        assert!(tracker.is_covered(1.0, 99.0, 1.0));
        assert!(!tracker.is_covered(0.0, 100.0, 1.0));
    }

    #[test]
    fn is_covered_false_when_gap_exists() {
        let mut tracker = CoverageTracker::new();
        tracker.add(0.0, 40.0);
        tracker.add(60.0, 100.0);
        assert!(!tracker.is_covered(0.0, 100.0, 1.0));
    }

    #[test]
    fn uncovered_returns_full_range_when_empty() {
        let tracker = CoverageTracker::new();
        assert_eq!(tracker.uncovered(0.0, 50.0), vec![(0.0, 50.0)]);
    }

    #[test]
    fn uncovered_returns_gaps_between_covered_ranges() {
        let mut tracker = CoverageTracker::new();
        tracker.add(10.0, 20.0);
        tracker.add(30.0, 40.0);
        assert_eq!(tracker.uncovered(0.0, 50.0), vec![(0.0, 10.0), (20.0, 30.0), (40.0, 50.0)]);
    }

    #[test]
    fn uncovered_is_empty_when_fully_covered() {
        let mut tracker = CoverageTracker::new();
        tracker.add(0.0, 100.0);
        assert!(tracker.uncovered(10.0, 90.0).is_empty());
    }

    #[test]
    fn rescanning_same_region_does_not_grow_coverage() {
        let mut tracker = CoverageTracker::new();
        tracker.add(0.0, 100.0);
        let before = tracker.clone();
        tracker.add(0.0, 100.0);
        assert_eq!(tracker, before);
    }

    #[test]
    fn merged_with_unions_two_trackers() {
        let mut a = CoverageTracker::new();
        a.add(0.0, 10.0);
        let mut b = CoverageTracker::new();
        b.add(20.0, 30.0);
        let merged = a.merged_with(&b);
        assert_eq!(merged.intervals(), &[(0.0, 10.0), (20.0, 30.0)]);
    }
}
