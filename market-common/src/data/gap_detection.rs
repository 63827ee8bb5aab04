//! Gap detection over stored price history
//!
//! Given the timestamps of a symbol's stored price points inside a window,
//! reports every span without coverage. Interior spans are measured between
//! consecutive points; the window edges are measured against the first and
//! last point.
//!
//! ```ignore
//! use market_common::data::gap_detection::{GapDetector, GapDetectionConfig};
//!
//! let detector = GapDetector::new(GapDetectionConfig::default());
//! let gaps = detector.detect_gaps("AAPL", &timestamps, from, to);
//! ```

use chrono::{DateTime, Duration, Utc};

use super::backfill::Gap;

/// Configuration for gap detection
#[derive(Debug, Clone)]
pub struct GapDetectionConfig {
    /// Two consecutive points further apart than this bound a gap (minutes)
    pub threshold_minutes: i64,
    /// A window edge left uncovered for longer than this is a gap (minutes)
    pub edge_threshold_minutes: i64,
}

impl Default for GapDetectionConfig {
    fn default() -> Self {
        Self {
            threshold_minutes: 15,
            edge_threshold_minutes: 5,
        }
    }
}

impl GapDetectionConfig {
    pub fn with_threshold(threshold_minutes: i64) -> Self {
        Self {
            threshold_minutes,
            ..Default::default()
        }
    }
}

/// Gap detector
pub struct GapDetector {
    config: GapDetectionConfig,
}

impl GapDetector {
    pub fn new(config: GapDetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GapDetectionConfig {
        &self.config
    }

    /// Detect gaps in `[from, to]` for one symbol.
    ///
    /// `timestamps` need not be sorted; points outside the window are ignored.
    /// An empty window yields one gap covering all of it.
    pub fn detect_gaps(
        &self,
        symbol: &str,
        timestamps: &[DateTime<Utc>],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Gap> {
        if from >= to {
            return Vec::new();
        }

        let mut points: Vec<DateTime<Utc>> = timestamps
            .iter()
            .copied()
            .filter(|ts| *ts >= from && *ts <= to)
            .collect();
        points.sort_unstable();
        points.dedup();

        let (first, last) = match (points.first(), points.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return vec![Gap::new(symbol, from, to)],
        };

        let threshold = Duration::minutes(self.config.threshold_minutes);
        let edge_threshold = Duration::minutes(self.config.edge_threshold_minutes);
        let one_minute = Duration::minutes(1);
        let mut gaps = Vec::new();

        if first - from > edge_threshold {
            gaps.push(Gap::new(symbol, from, first - one_minute));
        }

        for pair in points.windows(2) {
            let (prev, curr) = (pair[0], pair[1]);
            if curr - prev > threshold {
                gaps.push(Gap::new(symbol, prev + one_minute, curr - one_minute));
            }
        }

        if to - last > edge_threshold {
            gaps.push(Gap::new(symbol, last + one_minute, to));
        }

        // Spans narrower than the one-minute trim on each side cover nothing
        gaps.retain(|gap| gap.end >= gap.start);
        gaps
    }
}

impl Default for GapDetector {
    fn default() -> Self {
        Self::new(GapDetectionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
    }

    fn at(minute: i64) -> DateTime<Utc> {
        base() + Duration::minutes(minute)
    }

    #[test]
    fn test_empty_window_is_one_gap() {
        let detector = GapDetector::default();
        let gaps = detector.detect_gaps("AAPL", &[], at(0), at(60));

        assert_eq!(gaps, vec![Gap::new("AAPL", at(0), at(60))]);
    }

    #[test]
    fn test_interior_and_trailing_gaps() {
        let detector = GapDetector::default();
        let points = [at(0), at(5), at(30)];
        let gaps = detector.detect_gaps("AAPL", &points, at(0), at(40));

        assert_eq!(
            gaps,
            vec![
                Gap::new("AAPL", at(6), at(29)),
                Gap::new("AAPL", at(31), at(40)),
            ]
        );
    }

    #[test]
    fn test_evenly_spaced_points_have_no_gaps() {
        let detector = GapDetector::default();
        let points: Vec<_> = (0..=24).map(|i| at(i * 5)).collect();
        let gaps = detector.detect_gaps("MSFT", &points, at(0), at(120));

        assert!(gaps.is_empty());
    }

    #[test]
    fn test_leading_edge_gap() {
        let detector = GapDetector::default();
        let points = [at(20), at(25), at(30)];
        let gaps = detector.detect_gaps("MSFT", &points, at(0), at(30));

        assert_eq!(gaps, vec![Gap::new("MSFT", at(0), at(19))]);
    }

    #[test]
    fn test_unsorted_and_out_of_window_points() {
        let detector = GapDetector::new(GapDetectionConfig::with_threshold(10));
        let points = [at(50), at(-30), at(0), at(25), at(0), at(90)];
        let gaps = detector.detect_gaps("TSLA", &points, at(0), at(50));

        assert_eq!(
            gaps,
            vec![
                Gap::new("TSLA", at(1), at(24)),
                Gap::new("TSLA", at(26), at(49)),
            ]
        );
    }

    #[test]
    fn test_delta_equal_to_threshold_is_not_a_gap() {
        let detector = GapDetector::default();
        let points = [at(0), at(15), at(30)];
        assert!(detector
            .detect_gaps("AAPL", &points, at(0), at(30))
            .is_empty());
    }

    #[test]
    fn test_sub_minute_spans_never_yield_inverted_gaps() {
        let detector = GapDetector::new(GapDetectionConfig {
            threshold_minutes: 1,
            edge_threshold_minutes: 0,
        });
        let seconds = |s: i64| base() + Duration::seconds(s);
        let points = [seconds(30), seconds(120), seconds(210)];

        // Every span is under two minutes, so trimming a minute per side leaves nothing
        assert!(detector
            .detect_gaps("AAPL", &points, at(0), seconds(240))
            .is_empty());

        // A wide trailing span is still reported
        let gaps = detector.detect_gaps("AAPL", &points, at(0), seconds(400));
        assert_eq!(gaps, vec![Gap::new("AAPL", seconds(270), seconds(400))]);
    }

    #[test]
    fn test_inverted_window() {
        let detector = GapDetector::default();
        assert!(detector.detect_gaps("AAPL", &[], at(10), at(0)).is_empty());
    }
}
