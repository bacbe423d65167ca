//! KISS / KISS+ feature extraction.
//!
//! One signature summarizes a window of `C` packets from a single endpoint.
//! The first `2N` features are chi-square-style divergences of nibble
//! frequencies from the uniform distribution, one per nibble position of
//! the first `N` payload bytes, normalized so that a constant nibble value
//! scores 1.0 and a perfectly uniform spread scores 0.0. KISS+ appends four
//! flow-statistics features: mean wire size, outlier-filtered mean
//! inter-arrival delay, mean jitter of the filtered delays, and a protocol
//! hint. All coordinates land in `[0, 1]`.

use crate::Config;
use crate::addr::Proto;
use crate::endpoint::Endpoint;
use crate::signature::Signature;

/// Z-score bound for the delay outlier filter: delays above
/// `mean + 1.645 * stddev` (the upper 5% of a normal fit) are discarded.
const OUTLIER_Z: f64 = 1.645;

/// Wire-size normalization ceiling, bytes.
const SIZE_CEILING: f64 = 1500.0;
/// Delay and jitter normalization ceiling, milliseconds.
const DELAY_CEILING_MS: f64 = 1000.0;

/// Window signature extractor.
#[derive(Debug, Clone, Copy)]
pub struct FeatureExtractor {
    payload_bytes: usize,
    window_packets: usize,
    kiss_std: bool,
}

impl FeatureExtractor {
    pub fn new(config: &Config) -> Self {
        FeatureExtractor {
            payload_bytes: config.payload_bytes,
            window_packets: config.window_packets,
            kiss_std: config.kiss_std,
        }
    }

    /// Signature dimensionality produced by this extractor.
    pub fn feature_count(&self) -> usize {
        if self.kiss_std {
            self.payload_bytes * 2
        } else {
            self.payload_bytes * 2 + crate::KISSP_EXTRA_FEATURES
        }
    }

    /// Consumes up to `C` packets from the front of the endpoint's window
    /// and derives one unlabeled signature.
    pub fn extract(&self, proto: Proto, ep: &mut Endpoint) -> Signature {
        let n = self.payload_bytes;
        let groups = n * 2;

        // occurrence counts per nibble position and nibble value
        let mut occ = vec![0u32; groups * 16];
        let mut delays: Vec<u64> = Vec::with_capacity(self.window_packets);

        let mut avg_size = 0.0f64;
        let mut prev_ts: Option<f64> = None;

        // Welford running mean/variance over the inter-arrival delays
        let mut mean = 0.0f64;
        let mut m2 = 0.0f64;

        let mut pktcnt = 0usize;
        while pktcnt < self.window_packets {
            let Some(pkt) = ep.pkts.pop_front() else { break };

            for i in 0..n {
                let byte = pkt.payload[i];
                occ[(2 * i) * 16 + (byte & 0x0f) as usize] += 1;
                occ[(2 * i + 1) * 16 + (byte >> 4) as usize] += 1;
            }

            avg_size += (pkt.wire_size as f64 - avg_size) / (pktcnt as f64 + 1.0);

            if pktcnt > 0 {
                let delay = millis_between(prev_ts.unwrap_or(pkt.ts), pkt.ts);
                delays.push(delay);

                let x = delay as f64;
                let next_mean = mean + (x - mean) / pktcnt as f64;
                m2 += (x - mean) * (x - next_mean);
                mean = next_mean;
            }
            prev_ts = Some(pkt.ts);
            pktcnt += 1;
        }

        let mut features = Vec::with_capacity(self.feature_count());
        if pktcnt == 0 {
            features.resize(self.feature_count(), 0.0);
            return Signature::from_features(&features);
        }

        // expected occurrences under a uniform nibble distribution, and the
        // divergence of the degenerate one-constant-value window
        let expected = pktcnt as f64 / 16.0;
        let max_divergence = ((expected - pktcnt as f64).powi(2) + 15.0 * expected.powi(2))
            / expected;

        for group in 0..groups {
            let mut value = 0.0;
            for nibble in 0..16 {
                value += (expected - occ[group * 16 + nibble] as f64).powi(2);
            }
            value /= expected;
            value /= max_divergence;
            features.push(value);
        }

        if !self.kiss_std {
            let stddev = (m2 / pktcnt as f64).sqrt();
            let limit = mean + OUTLIER_Z * stddev;

            let mut avg_delay = 0.0f64;
            let mut avg_jitter = 0.0f64;
            let mut delay_idx = 1u64;
            let mut jitter_idx = 1u64;
            let mut prev_delay = 0u64;
            for &delay in &delays {
                if delay as f64 > limit {
                    continue;
                }
                if delay_idx > 1 {
                    let diff = prev_delay.abs_diff(delay);
                    avg_jitter += (diff as f64 - avg_jitter) / jitter_idx as f64;
                    jitter_idx += 1;
                }
                avg_delay += (delay as f64 - avg_delay) / delay_idx as f64;
                delay_idx += 1;
                prev_delay = delay;
            }

            features.push(clamp_ratio(avg_size, SIZE_CEILING));
            features.push(clamp_ratio(avg_delay, DELAY_CEILING_MS));
            features.push(clamp_ratio(avg_jitter, DELAY_CEILING_MS));
            features.push(proto.number() as f64 / 2.0);
        }

        Signature::from_features(&features)
    }
}

fn clamp_ratio(value: f64, ceiling: f64) -> f64 {
    if value > ceiling {
        1.0
    } else {
        value / ceiling
    }
}

/// Whole milliseconds between two capture timestamps, clamped at zero for
/// out-of-order frames. Rounded at microsecond precision first, so
/// timestamps that came out of integer-microsecond capture headers divide
/// exactly.
fn millis_between(earlier: f64, later: f64) -> u64 {
    let diff = later - earlier;
    if diff <= 0.0 {
        0
    } else {
        ((diff * 1e6).round() as u64) / 1000
    }
}

#[cfg(test)]
mod tests {
    use super::FeatureExtractor;
    use crate::addr::{EpAddr, Proto};
    use crate::endpoint::{Endpoint, PacketRecord};
    use crate::source::SourceId;
    use crate::Config;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;

    const SRC: SourceId = SourceId(0);

    fn small_config() -> Config {
        Config {
            payload_bytes: 2,
            window_packets: 16,
            ..Config::default()
        }
    }

    fn filled_endpoint(
        config: &Config,
        payload_of: impl Fn(usize) -> Vec<u8>,
        ts_of: impl Fn(usize) -> f64,
        wire: u32,
    ) -> Endpoint {
        let addr = EpAddr::new(Proto::Udp, Ipv4Addr::new(10, 0, 0, 1), 4000);
        let mut pkts = VecDeque::new();
        for i in 0..config.window_packets {
            let mut bytes = vec![0u8; config.payload_bytes];
            let raw = payload_of(i);
            let take = raw.len().min(bytes.len());
            bytes[..take].copy_from_slice(&raw[..take]);
            pkts.push_back(PacketRecord {
                payload: bytes,
                wire_size: wire,
                ts: ts_of(i),
            });
        }
        Endpoint {
            source: SRC,
            addr,
            last: 0.0,
            pkts,
            gc_lock: 0,
            verdict: 0,
            verdict_prob: 0.0,
            verdict_changes: 0,
            predictions: 0,
            ewma: None,
        }
    }

    #[test]
    fn constant_payload_maxes_kiss_features() {
        let config = small_config();
        let extractor = FeatureExtractor::new(&config);
        let mut ep = filled_endpoint(&config, |_| vec![0u8; 2], |i| i as f64 * 0.001, 150);

        let sign = extractor.extract(Proto::Udp, &mut ep);
        let dense = sign.dense();
        assert_eq!(dense.len(), 8);
        // every nibble position holds a single constant value
        for value in &dense[..4] {
            assert!((value - 1.0).abs() < 1e-9, "{dense:?}");
        }
        // avg size 150/1500, avg delay 1ms/1000, zero jitter, udp = 2/2
        assert!((dense[4] - 0.1).abs() < 1e-9);
        assert!((dense[5] - 0.001).abs() < 1e-9);
        assert!(dense[6].abs() < 1e-9);
        assert!((dense[7] - 1.0).abs() < 1e-9);
        // window fully consumed
        assert!(ep.pkts.is_empty());
    }

    #[test]
    fn uniform_nibbles_score_zero() {
        let config = small_config();
        let extractor = FeatureExtractor::new(&config);
        // 16 packets, byte value i | (i << 4): every nibble value occurs
        // exactly once per position
        let mut ep = filled_endpoint(
            &config,
            |i| vec![(i as u8 & 0x0f) | ((i as u8 & 0x0f) << 4); 2],
            |i| i as f64 * 0.001,
            150,
        );

        let sign = extractor.extract(Proto::Udp, &mut ep);
        let dense = sign.dense();
        for value in &dense[..4] {
            assert!(value.abs() < 1e-9, "{dense:?}");
        }
    }

    #[test]
    fn features_stay_in_unit_interval() {
        let config = Config {
            payload_bytes: 4,
            window_packets: 32,
            ..Config::default()
        };
        let extractor = FeatureExtractor::new(&config);
        // deterministic pseudo-random payloads and bursty timing
        let mut state = 0x2545f491u32;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };
        let payloads: Vec<Vec<u8>> = (0..config.window_packets)
            .map(|_| (0..4).map(|_| (next() & 0xff) as u8).collect())
            .collect();
        let mut ep = filled_endpoint(
            &config,
            |i| payloads[i].clone(),
            // bursty but monotonic timing: a 2.5s pause every 7 packets
            |i| i as f64 * 0.004 + (i / 7) as f64 * 2.5,
            9000,
        );

        let sign = extractor.extract(Proto::Tcp, &mut ep);
        assert_eq!(sign.feature_count(), config.feature_count());
        for value in sign.features() {
            assert!((0.0..=1.0).contains(&value), "{value}");
        }
    }

    #[test]
    fn extraction_is_deterministic() {
        let config = small_config();
        let extractor = FeatureExtractor::new(&config);
        let build = || {
            filled_endpoint(
                &config,
                |i| vec![i as u8, (i * 3) as u8],
                |i| i as f64 * 0.010,
                400,
            )
        };

        let first = extractor.extract(Proto::Tcp, &mut build());
        let second = extractor.extract(Proto::Tcp, &mut build());
        assert_eq!(first, second);
    }

    #[test]
    fn standard_kiss_omits_flow_statistics() {
        let config = Config {
            kiss_std: true,
            ..small_config()
        };
        let extractor = FeatureExtractor::new(&config);
        let mut ep = filled_endpoint(&config, |_| vec![0u8; 2], |i| i as f64, 100);

        let sign = extractor.extract(Proto::Udp, &mut ep);
        assert_eq!(sign.feature_count(), 4);
        assert_eq!(
            sign.coords.last().unwrap().index,
            crate::signature::SENTINEL_INDEX
        );
    }

    #[test]
    fn outliers_are_excluded_from_delay_average() {
        let config = small_config();
        let extractor = FeatureExtractor::new(&config);
        // 15 delays of 10ms and one huge 5s gap in the middle; the gap is
        // past mean + 1.645 * stddev and must not drag the average up
        let mut ep = filled_endpoint(
            &config,
            |_| vec![0u8; 2],
            |i| {
                let base = i as f64 * 0.010;
                if i >= 8 { base + 5.0 } else { base }
            },
            100,
        );

        let sign = extractor.extract(Proto::Udp, &mut ep);
        let dense = sign.dense();
        let avg_delay_ms = dense[5] * 1000.0;
        assert!(avg_delay_ms < 50.0, "avg delay {avg_delay_ms}ms");
    }
}
