//! Verdict aggregation.
//!
//! A classification covers one window; the verdict is the endpoint-level
//! belief built from the stream of classifications. Confidence is the
//! margin between the two most probable labels. Three smoothing policies
//! are available, picked once at startup, and a probability threshold
//! pushes low-confidence verdicts back to "unknown".

use crate::endpoint::Endpoint;
use crate::{ClassProbs, Label};

/// How per-window classifications are folded into an endpoint verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictPolicy {
    /// Latest classification wins.
    Simple,
    /// Keep the most confident classification seen so far.
    Best,
    /// Exponentially-weighted moving average over the probability vectors.
    Ewma,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerdictConfig {
    pub policy: VerdictPolicy,
    /// EWMA length `L`; the newest vector enters with weight `1/L`.
    pub ewma_len: u32,
    /// Minimum confidence for a verdict to stand; below it the verdict is
    /// reset to unknown.
    pub threshold: f64,
}

impl Default for VerdictConfig {
    fn default() -> Self {
        VerdictConfig {
            policy: VerdictPolicy::Simple,
            ewma_len: 5,
            threshold: 0.0,
        }
    }
}

/// Top label and its margin over the runner-up.
pub(crate) fn top_margin(probs: &ClassProbs) -> (Label, f64) {
    let mut top = 0usize;
    let mut second = 0.0f64;
    for (label, &p) in probs.iter().enumerate().skip(1) {
        if p > probs[top] {
            second = probs[top];
            top = label;
        } else if p > second {
            second = p;
        }
    }
    (top as Label, probs[top] - second)
}

/// Applies one classification to the endpoint's verdict state. Returns true
/// when the verdict label changed (the change counter is already bumped).
pub(crate) fn apply(config: &VerdictConfig, ep: &mut Endpoint, probs: &ClassProbs) -> bool {
    let old = ep.verdict;

    match config.policy {
        VerdictPolicy::Simple => {
            let (label, margin) = top_margin(probs);
            ep.verdict = label;
            ep.verdict_prob = margin;
        }
        VerdictPolicy::Best => {
            let (label, margin) = top_margin(probs);
            if margin > ep.verdict_prob {
                ep.verdict = label;
                ep.verdict_prob = margin;
            }
        }
        VerdictPolicy::Ewma => {
            match ep.ewma.as_mut() {
                None => {
                    // first classification seeds the smoothing state
                    ep.ewma = Some(Box::new(*probs));
                }
                Some(state) => {
                    let len = config.ewma_len.max(1) as f64;
                    for (smoothed, &p) in state.iter_mut().zip(probs.iter()) {
                        *smoothed = (len - 1.0) / len * *smoothed + p / len;
                    }
                }
            }
            let state = ep.ewma.as_ref().unwrap();
            let (label, margin) = top_margin(state);
            if margin > ep.verdict_prob {
                ep.verdict = label;
                ep.verdict_prob = margin;
            }
        }
    }

    if ep.verdict_prob < config.threshold {
        ep.verdict = 0;
        ep.verdict_prob = 0.0;
    }

    let changed = old != ep.verdict;
    if changed {
        ep.verdict_changes += 1;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::{VerdictConfig, VerdictPolicy, apply, top_margin};
    use crate::addr::{EpAddr, Proto};
    use crate::endpoint::Endpoint;
    use crate::source::SourceId;
    use crate::{ClassProbs, LABEL_COUNT};
    use std::net::Ipv4Addr;

    fn endpoint() -> Endpoint {
        Endpoint {
            source: SourceId(0),
            addr: EpAddr::new(Proto::Udp, Ipv4Addr::new(10, 0, 0, 1), 53),
            last: 0.0,
            pkts: Default::default(),
            gc_lock: 0,
            verdict: 0,
            verdict_prob: 0.0,
            verdict_changes: 0,
            predictions: 0,
            ewma: None,
        }
    }

    fn probs(pairs: &[(usize, f64)]) -> ClassProbs {
        let mut p = [0.0; LABEL_COUNT];
        for &(label, value) in pairs {
            p[label] = value;
        }
        p
    }

    fn config(policy: VerdictPolicy, threshold: f64) -> VerdictConfig {
        VerdictConfig {
            policy,
            ewma_len: 5,
            threshold,
        }
    }

    #[test]
    fn margin_is_top1_minus_top2() {
        let p = probs(&[(2, 0.6), (3, 0.3), (4, 0.1)]);
        assert_eq!(top_margin(&p), (2, 0.6 - 0.3));
    }

    #[test]
    fn simple_tracks_latest_classification() {
        let mut ep = endpoint();
        let cfg = config(VerdictPolicy::Simple, 0.0);

        assert!(apply(&cfg, &mut ep, &probs(&[(2, 0.9), (3, 0.1)])));
        assert_eq!(ep.verdict, 2);
        assert!((ep.verdict_prob - 0.8).abs() < 1e-9);

        assert!(apply(&cfg, &mut ep, &probs(&[(2, 0.2), (3, 0.8)])));
        assert_eq!(ep.verdict, 3);
        assert_eq!(ep.verdict_changes, 2);
    }

    #[test]
    fn threshold_suppresses_weak_verdicts() {
        let mut ep = endpoint();
        let cfg = config(VerdictPolicy::Simple, 0.5);

        // top1=0.4, top2=0.35: margin 0.05 is below the threshold
        let changed = apply(&cfg, &mut ep, &probs(&[(2, 0.4), (3, 0.35)]));
        assert_eq!(ep.verdict, 0);
        assert_eq!(ep.verdict_prob, 0.0);
        // previous verdict was already unset, so nothing changed
        assert!(!changed);

        // strong verdict passes, then a weak one knocks it back to unknown
        assert!(apply(&cfg, &mut ep, &probs(&[(2, 0.9)])));
        assert_eq!(ep.verdict, 2);
        let changed = apply(&cfg, &mut ep, &probs(&[(2, 0.4), (3, 0.35)]));
        assert!(changed);
        assert_eq!(ep.verdict, 0);
    }

    #[test]
    fn nonzero_verdicts_always_meet_threshold() {
        let mut ep = endpoint();
        let cfg = config(VerdictPolicy::Simple, 0.3);
        let vectors = [
            probs(&[(2, 0.9)]),
            probs(&[(2, 0.5), (3, 0.4)]),
            probs(&[(4, 0.66), (2, 0.3)]),
            probs(&[(4, 0.51), (5, 0.49)]),
        ];
        for p in &vectors {
            apply(&cfg, &mut ep, p);
            if ep.verdict != 0 {
                assert!(ep.verdict_prob >= cfg.threshold);
            }
        }
    }

    #[test]
    fn best_confidence_is_monotone() {
        let mut ep = endpoint();
        let cfg = config(VerdictPolicy::Best, 0.0);

        apply(&cfg, &mut ep, &probs(&[(2, 0.7), (3, 0.3)]));
        assert_eq!(ep.verdict, 2);
        let first = ep.verdict_prob;

        // weaker classification, even of another label, is ignored
        apply(&cfg, &mut ep, &probs(&[(3, 0.6), (2, 0.4)]));
        assert_eq!(ep.verdict, 2);
        assert_eq!(ep.verdict_prob, first);

        // stronger one replaces it
        apply(&cfg, &mut ep, &probs(&[(3, 0.95), (2, 0.05)]));
        assert_eq!(ep.verdict, 3);
        assert!(ep.verdict_prob > first);
    }

    #[test]
    fn ewma_seeds_with_first_vector_then_blends() {
        let mut ep = endpoint();
        let cfg = config(VerdictPolicy::Ewma, 0.0);

        let p1 = probs(&[(1, 0.9), (2, 0.1)]);
        let changed = apply(&cfg, &mut ep, &p1);
        assert!(changed);
        assert_eq!(ep.verdict, 1);
        let state = ep.ewma.as_ref().unwrap();
        assert!((state[1] - 0.9).abs() < 1e-12);
        assert!((state[2] - 0.1).abs() < 1e-12);

        // second vector enters with weight 1/5
        let p2 = probs(&[(1, 0.2), (2, 0.8)]);
        let changed = apply(&cfg, &mut ep, &p2);
        let state = ep.ewma.as_ref().unwrap();
        assert!((state[1] - (0.8 * 0.9 + 0.2 * 0.2)).abs() < 1e-12);
        assert!((state[2] - (0.8 * 0.1 + 0.2 * 0.8)).abs() < 1e-12);
        // smoothed top is still label 1 (0.72 vs 0.24); no change event
        assert_eq!(ep.verdict, 1);
        assert!(!changed);
        assert_eq!(ep.verdict_changes, 1);
    }
}
