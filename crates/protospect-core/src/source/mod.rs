//! Traffic sources.
//!
//! Sources abstract capture inputs and keep I/O separate from decoding. A
//! source yields raw packets in capture order; capture files additionally
//! drive a virtual clock (the timestamp of the last delivered packet) which
//! the garbage collector uses as "now" for entries created by that source.

mod filter;
#[cfg(feature = "live")]
mod live;
mod pcap;

pub use filter::{CaptureFilter, FilterError};
#[cfg(feature = "live")]
pub use live::LiveSource;
pub use pcap::PcapFileSource;

use std::time::{SystemTime, UNIX_EPOCH};

use pcap_parser::Linktype;
use thiserror::Error;

use crate::Label;

/// Stable identifier of a source inside one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub(crate) u32);

impl SourceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Raw packet delivered by a source.
#[derive(Debug, Clone)]
pub struct RawPacket {
    /// Capture timestamp in seconds.
    pub ts: f64,
    /// Link type of `data`.
    pub linktype: Linktype,
    /// Captured bytes.
    pub data: Vec<u8>,
    /// Original length on the wire (may exceed `data.len()`).
    pub wire_len: u32,
}

/// Result of one batched read.
#[derive(Debug, Default)]
pub struct Batch {
    pub packets: Vec<RawPacket>,
    /// True when the source has no more packets to deliver, ever.
    pub exhausted: bool,
}

/// Abstract packet source.
///
/// Implementations return at most `max` packets per call. An empty,
/// non-exhausted batch is a transient condition (live capture with nothing
/// queued); `exhausted` marks end of stream and makes the engine close the
/// source.
pub trait PacketSource {
    fn read_batch(&mut self, max: usize) -> Result<Batch, SourceError>;
}

/// Errors produced by sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("capture parse error: {0}")]
    Pcap(String),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("live capture error: {0}")]
    Capture(String),
    #[error("live capture support not built in (enable the `live` feature)")]
    LiveUnavailable,
}

/// Source specification: a capture file path or interface name, optionally
/// followed by a space-separated capture filter expression.
///
/// # Examples
/// ```
/// use protospect_core::SourceSpec;
///
/// let spec = SourceSpec::parse("dump.pcap udp");
/// assert_eq!(spec.target, "dump.pcap");
/// assert_eq!(spec.filter.as_deref(), Some("udp"));
///
/// let spec = SourceSpec::parse("eth0");
/// assert!(spec.filter.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub target: String,
    pub filter: Option<String>,
}

impl SourceSpec {
    pub fn parse(spec: &str) -> Self {
        match spec.split_once(' ') {
            Some((target, filter)) if !filter.trim().is_empty() => SourceSpec {
                target: target.to_string(),
                filter: Some(filter.trim().to_string()),
            },
            Some((target, _)) => SourceSpec {
                target: target.to_string(),
                filter: None,
            },
            None => SourceSpec {
                target: spec.to_string(),
                filter: None,
            },
        }
    }
}

pub(crate) enum SourceKind {
    File(PcapFileSource),
    #[cfg(feature = "live")]
    Live(LiveSource),
    Custom(Box<dyn PacketSource>),
}

/// A registered traffic source plus its per-source state.
pub struct Source {
    pub(crate) id: SourceId,
    pub(crate) kind: SourceKind,
    /// Human-readable description (file path or interface name).
    pub descr: String,
    /// Nonzero label makes this a training source (unless `testing`).
    pub label: Label,
    /// Testing sources feed the confusion tally instead of the model.
    pub testing: bool,
    pub(crate) filter: CaptureFilter,
    /// Live sources use wall time; everything else runs on the virtual
    /// clock below.
    pub(crate) wall_time: bool,
    pub closed: bool,
    /// Virtual "now": timestamp of the last delivered packet, or infinity
    /// once a file source is closed.
    pub(crate) vclock: f64,
    /// Virtual time of the last GC suggestion.
    pub(crate) gc_mark: f64,

    pub packets: u64,
    pub signatures: u64,
    pub learned: u64,
    pub endpoints: u64,
}

impl Source {
    pub(crate) fn new(
        id: SourceId,
        kind: SourceKind,
        descr: String,
        label: Label,
        testing: bool,
        filter: CaptureFilter,
        wall_time: bool,
    ) -> Self {
        Source {
            id,
            kind,
            descr,
            label,
            testing,
            filter,
            wall_time,
            closed: false,
            vclock: 0.0,
            gc_mark: 0.0,
            packets: 0,
            signatures: 0,
            learned: 0,
            endpoints: 0,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    /// The source's notion of "now", in seconds: wall time for live
    /// sources, the virtual clock otherwise.
    pub fn now(&self) -> f64 {
        if self.wall_time {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0)
        } else {
            self.vclock
        }
    }

    pub(crate) fn read_batch(&mut self, max: usize) -> Result<Batch, SourceError> {
        match &mut self.kind {
            SourceKind::File(reader) => reader.read_batch(max),
            #[cfg(feature = "live")]
            SourceKind::Live(capture) => capture.read_batch(max),
            SourceKind::Custom(custom) => custom.read_batch(max),
        }
    }
}
