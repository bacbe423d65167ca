//! Run statistics and the serializable report.
//!
//! Counters are cheap and always on: drop accounting from the decoder
//! gates, training tallies, and the confusion tally fed by testing sources.
//! The report is a deterministic snapshot of all of them, serialized by the
//! driver when asked for statistics.

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::{LABEL_COUNT, Label};

/// Confusion tally over endpoints of testing sources.
///
/// An endpoint contributes once, at eviction, comparing its final verdict
/// with the label its source was annotated with.
#[derive(Debug)]
pub struct ConfusionTally {
    /// Endpoints that produced a test verdict.
    pub all: u32,
    /// Endpoints whose verdict matched the source label.
    pub ok: u32,
    /// Endpoints per expected label.
    pub per_label: Box<[u32; LABEL_COUNT]>,
    /// Misclassifications counted against the expected label.
    pub false_neg: Box<[u32; LABEL_COUNT]>,
    /// Misclassifications counted against the predicted label.
    pub false_pos: Box<[u32; LABEL_COUNT]>,
}

impl Default for ConfusionTally {
    fn default() -> Self {
        ConfusionTally {
            all: 0,
            ok: 0,
            per_label: Box::new([0; LABEL_COUNT]),
            false_neg: Box::new([0; LABEL_COUNT]),
            false_pos: Box::new([0; LABEL_COUNT]),
        }
    }
}

impl ConfusionTally {
    pub(crate) fn record(&mut self, expected: Label, verdict: Label) {
        self.all += 1;
        self.per_label[expected as usize] += 1;
        if verdict == expected {
            self.ok += 1;
        } else {
            self.false_neg[expected as usize] += 1;
            self.false_pos[verdict as usize] += 1;
        }
    }

    /// Percentage of foreign test endpoints misclassified as `label`, or
    /// `None` when no foreign endpoints were tested.
    pub fn false_positive_pct(&self, label: Label) -> Option<f64> {
        let foreign = self.all - self.per_label[label as usize];
        if foreign == 0 {
            return None;
        }
        Some(self.false_pos[label as usize] as f64 * 100.0 / foreign as f64)
    }

    /// Percentage of `label`-endpoints that were not recognized, or `None`
    /// when none were tested.
    pub fn false_negative_pct(&self, label: Label) -> Option<f64> {
        let own = self.per_label[label as usize];
        if own == 0 {
            return None;
        }
        Some(self.false_neg[label as usize] as f64 * 100.0 / own as f64)
    }
}

/// Core-wide counters.
#[derive(Debug, Default)]
pub struct Stats {
    /// Signatures learned directly from packet sources.
    pub learned_pkt: u32,
    /// Signatures learned through the staging queue.
    pub learned_queue: u32,
    pub confusion: ConfusionTally,

    /// Frames dropped because some layer was truncated or malformed.
    pub truncated: u64,
    /// Frames dropped as not-inspected (non-Ethernet, non-IPv4, non-TCP/UDP).
    pub unsupported: u64,
    /// Packets dropped by the source's capture filter.
    pub filtered: u64,
    /// Packets dropped by the minimum-payload gate.
    pub short_payload: u64,
    /// TCP packets dropped by the per-flow cap.
    pub flow_capped: u64,
}

/// Deterministic snapshot of a run, for the `--stats` output.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub tool: ToolInfo,
    /// RFC3339 timestamp of report generation.
    pub generated_at: String,
    pub sources: Vec<SourceReport>,
    pub training_samples: usize,
    pub trained_classes: usize,
    pub learned_pkt: u32,
    pub learned_queue: u32,
    pub drops: DropReport,
    /// Per-label confusion results, only labels that were tested.
    pub confusion: Vec<LabelReport>,
}

#[derive(Debug, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct SourceReport {
    pub descr: String,
    pub label: Label,
    pub testing: bool,
    pub closed: bool,
    pub packets: u64,
    pub signatures: u64,
    pub learned: u64,
    pub endpoints: u64,
}

#[derive(Debug, Serialize)]
pub struct DropReport {
    pub truncated: u64,
    pub unsupported: u64,
    pub filtered: u64,
    pub short_payload: u64,
    pub flow_capped: u64,
}

#[derive(Debug, Serialize)]
pub struct LabelReport {
    pub label: Label,
    pub endpoints: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub false_positive_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub false_negative_pct: Option<f64>,
}

pub(crate) fn rfc3339_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::ConfusionTally;

    #[test]
    fn confusion_percentages() {
        let mut tally = ConfusionTally::default();
        // label 2: three endpoints, one missed as 3
        tally.record(2, 2);
        tally.record(2, 2);
        tally.record(2, 3);
        // label 3: one endpoint, classified correctly
        tally.record(3, 3);

        assert_eq!(tally.all, 4);
        assert_eq!(tally.ok, 3);

        let fn2 = tally.false_negative_pct(2).unwrap();
        assert!((fn2 - 100.0 / 3.0).abs() < 1e-9);
        // one of the single foreign (label-3) endpoint count was hit as 3
        let fp3 = tally.false_positive_pct(3).unwrap();
        assert!((fp3 - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(tally.false_positive_pct(2), Some(0.0));

        // label never tested
        assert_eq!(tally.false_negative_pct(9), None);
    }
}
