//! Endpoint store.
//!
//! Each endpoint accumulates a FIFO window of accepted packets. When the
//! window reaches `C` packets and the endpoint is not already being
//! processed, the table takes the GC lock and reports the endpoint as
//! ready; feature extraction then consumes the window while the lock keeps
//! the garbage collector away. The lock is a counter: the classification
//! round-trip holds one more reference until the verdict side releases it.

use std::collections::{HashMap, VecDeque};

use crate::addr::EpAddr;
use crate::source::SourceId;
use crate::{ClassProbs, Label};

/// Key of an endpoint: creating source plus packed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpKey {
    pub source: SourceId,
    pub addr: EpAddr,
}

/// Information retained from a single accepted packet.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    /// Exactly `N` payload bytes.
    pub payload: Vec<u8>,
    /// Original packet length on the wire.
    pub wire_size: u32,
    /// Capture timestamp, seconds.
    pub ts: f64,
}

/// Per-endpoint state.
#[derive(Debug)]
pub struct Endpoint {
    pub source: SourceId,
    pub addr: EpAddr,
    /// Timestamp of the last accepted packet, for GC.
    pub last: f64,
    /// Collected packet window, oldest first.
    pub pkts: VecDeque<PacketRecord>,
    /// While nonzero the endpoint must not be evicted.
    pub gc_lock: u32,

    pub verdict: Label,
    pub verdict_prob: f64,
    /// Number of times the verdict label changed.
    pub verdict_changes: u32,
    /// Number of classifications produced for this endpoint.
    pub predictions: u32,
    /// Smoothing state of the EWMA verdict policy.
    pub(crate) ewma: Option<Box<ClassProbs>>,
}

impl Endpoint {
    fn new(source: SourceId, addr: EpAddr) -> Self {
        Endpoint {
            source,
            addr,
            last: 0.0,
            pkts: VecDeque::new(),
            gc_lock: 0,
            verdict: 0,
            verdict_prob: 0.0,
            verdict_changes: 0,
            predictions: 0,
            ewma: None,
        }
    }
}

/// Outcome of appending one packet to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The endpoint was created by this append.
    pub created: bool,
    /// The window just became complete and the GC lock was taken; the
    /// caller must announce the endpoint as ready exactly once.
    pub ready: bool,
}

/// Hash-indexed endpoint store.
#[derive(Debug, Default)]
pub struct EndpointTable {
    map: HashMap<EpKey, Endpoint>,
}

impl EndpointTable {
    pub fn new() -> Self {
        EndpointTable::default()
    }

    /// Appends a packet record, creating the endpoint lazily. The stored
    /// payload is truncated or zero-padded to exactly `payload_bytes`.
    pub fn append(
        &mut self,
        source: SourceId,
        addr: EpAddr,
        ts: f64,
        payload: &[u8],
        payload_bytes: usize,
        wire_size: u32,
        window_packets: usize,
    ) -> AppendOutcome {
        let key = EpKey { source, addr };
        let mut created = false;
        let ep = self.map.entry(key).or_insert_with(|| {
            created = true;
            Endpoint::new(source, addr)
        });

        let mut bytes = vec![0u8; payload_bytes];
        let take = payload.len().min(payload_bytes);
        bytes[..take].copy_from_slice(&payload[..take]);
        ep.pkts.push_back(PacketRecord {
            payload: bytes,
            wire_size,
            ts,
        });
        ep.last = ts;

        let mut ready = false;
        if ep.gc_lock == 0 && ep.pkts.len() >= window_packets {
            ep.gc_lock = 1;
            ready = true;
        }
        AppendOutcome { created, ready }
    }

    pub fn get(&self, key: &EpKey) -> Option<&Endpoint> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &EpKey) -> Option<&mut Endpoint> {
        self.map.get_mut(key)
    }

    pub fn contains(&self, key: &EpKey) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EpKey, &Endpoint)> {
        self.map.iter()
    }

    /// Drops the endpoint's GC lock by one after a downstream consumer is
    /// done with it.
    pub fn release(&mut self, key: &EpKey) {
        if let Some(ep) = self.map.get_mut(key) {
            ep.gc_lock = ep.gc_lock.saturating_sub(1);
        }
    }

    /// Evicts unlocked endpoints idle past `timeout_secs` (per the creating
    /// source's clock) and returns them, so the caller can finalize testing
    /// statistics.
    pub fn sweep(&mut self, now_by_source: &[f64], timeout_secs: u64) -> Vec<Endpoint> {
        let mut evicted = Vec::new();
        let keys: Vec<EpKey> = self
            .map
            .iter()
            .filter(|(key, ep)| {
                if ep.gc_lock > 0 {
                    return false;
                }
                let now = now_by_source
                    .get(key.source.index())
                    .copied()
                    .unwrap_or(0.0);
                ep.last + (timeout_secs as f64) < now
            })
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            if let Some(ep) = self.map.remove(&key) {
                evicted.push(ep);
            }
        }
        evicted
    }
}
