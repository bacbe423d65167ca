//! Protospect core library: statistical application-protocol classification.
//!
//! This crate implements a packet-inspection pipeline that labels network
//! endpoints with the application protocol they are speaking, using
//! byte-frequency and timing features instead of deep-packet-inspection
//! signatures. Packet sources feed a frame decoder, payload windows are
//! aggregated per endpoint, each completed window yields a numeric
//! signature, and a probabilistic classifier turns signatures into smoothed
//! per-endpoint verdicts.
//!
//! The whole pipeline is single-threaded and event-driven: an [`Engine`]
//! owns the state arena ([`Core`]) plus an event bus, and delivers named
//! events (`endpointPacketsReady`, `endpointClassification`, …) to
//! subscribers in a cooperative loop. I/O is isolated in `source` modules;
//! frame decoding is byte-oriented and side-effect free.
//!
//! # Examples
//! ```no_run
//! use protospect_core::{Config, Engine};
//!
//! let mut engine = Engine::new(Config::default());
//! engine.add_file_source("capture.pcap".as_ref(), None, 0, false)?;
//! engine.run();
//! # Ok::<(), protospect_core::SourceError>(())
//! ```

pub mod addr;
pub mod classifier;
pub mod endpoint;
pub mod engine;
pub mod events;
pub mod flow;
pub mod frame;
pub mod kiss;
pub mod report;
pub mod signature;
pub mod source;
pub mod verdict;

pub use addr::{EpAddr, Proto};
pub use classifier::svm::SvmParams;
pub use classifier::{ClassResult, Classifier, TrainError};
pub use endpoint::{Endpoint, EndpointTable, EpKey, PacketRecord};
pub use engine::{Core, Engine, LoopStatus};
pub use events::{Action, Event, EventKind};
pub use flow::{Flow, FlowKey, FlowTable};
pub use kiss::FeatureExtractor;
pub use report::{RunReport, Stats};
pub use signature::{Coordinate, SENTINEL_INDEX, Signature};
pub use source::{Batch, PacketSource, RawPacket, Source, SourceError, SourceId, SourceSpec};
pub use verdict::{VerdictConfig, VerdictPolicy};

/// Protocol label: `0` is unset/unknown, `1` is reserved for the literal
/// `"unknown"` protocol name. Label assignment is the caller's business; the
/// core treats labels as opaque small integers.
pub type Label = u8;

/// Number of distinct label values.
pub const LABEL_COUNT: usize = 256;

/// Per-label probability table.
pub type ClassProbs = [f64; LABEL_COUNT];

/// Payload bytes analysed per packet (`N`).
pub const DEFAULT_PAYLOAD_BYTES: usize = 12;
/// Per-TCP-flow packet cap (`P`).
pub const DEFAULT_FLOW_PACKET_CAP: u32 = 5;
/// Packets per endpoint window (`C`).
pub const DEFAULT_WINDOW_PACKETS: usize = 80;
/// Garbage collector interval, in seconds of wall or virtual time.
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 10;
/// Idle timeout for flows, seconds.
pub const DEFAULT_FLOW_TIMEOUT_SECS: u64 = 300;
/// Idle timeout for endpoints, seconds.
pub const DEFAULT_EP_TIMEOUT_SECS: u64 = 300;
/// Delay between the first new training sample and the actual retrain.
pub const DEFAULT_TRAINING_DELAY_MS: u64 = 3000;

/// Number of features the KISS+ extension appends after the 2N KISS
/// features (size, delay, jitter, protocol).
pub const KISSP_EXTRA_FEATURES: usize = 4;

/// Pipeline configuration, immutable after the engine starts.
///
/// # Examples
/// ```
/// use protospect_core::Config;
///
/// let config = Config::default();
/// assert_eq!(config.payload_bytes, 12);
/// assert_eq!(config.feature_count(), 28);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// `N`: payload bytes analysed per packet.
    pub payload_bytes: usize,
    /// `P`: packet cap per TCP flow.
    pub flow_packet_cap: u32,
    /// `C`: packets per endpoint window.
    pub window_packets: usize,
    /// Use standard KISS signatures (no size/delay/jitter/proto features).
    pub kiss_std: bool,
    /// Solver parameters for the underlying classifier.
    pub svm: SvmParams,
    /// Verdict policy and threshold.
    pub verdict: VerdictConfig,
    /// Delay-batching window for training, milliseconds.
    pub training_delay_ms: u64,
    pub gc_interval_secs: u64,
    pub flow_timeout_secs: u64,
    pub ep_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            payload_bytes: DEFAULT_PAYLOAD_BYTES,
            flow_packet_cap: DEFAULT_FLOW_PACKET_CAP,
            window_packets: DEFAULT_WINDOW_PACKETS,
            kiss_std: false,
            svm: SvmParams::default(),
            verdict: VerdictConfig::default(),
            training_delay_ms: DEFAULT_TRAINING_DELAY_MS,
            gc_interval_secs: DEFAULT_GC_INTERVAL_SECS,
            flow_timeout_secs: DEFAULT_FLOW_TIMEOUT_SECS,
            ep_timeout_secs: DEFAULT_EP_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Signature dimensionality implied by this configuration: `2N` for
    /// standard KISS, `2N + 4` for KISS+.
    pub fn feature_count(&self) -> usize {
        if self.kiss_std {
            self.payload_bytes * 2
        } else {
            self.payload_bytes * 2 + KISSP_EXTRA_FEATURES
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn feature_count_tracks_kiss_mode() {
        let mut config = Config::default();
        assert_eq!(config.feature_count(), 28);
        config.kiss_std = true;
        assert_eq!(config.feature_count(), 24);
        config.payload_bytes = 4;
        assert_eq!(config.feature_count(), 8);
    }
}
