//! Flow accounting.
//!
//! A flow is the unordered endpoint pair of one transport conversation,
//! tracked per capture source. Flows exist to enforce the per-TCP-flow
//! packet cap and to detect teardown: a TCP flow whose RST or FIN bitmap
//! covers both directions is closed and collected on the next sweep.

use std::collections::HashMap;

use crate::addr::EpAddr;
use crate::source::SourceId;

/// Key of a flow: creating source plus the endpoint pair in numeric order.
///
/// The transport protocol needs no separate component because it is packed
/// into the endpoint addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub source: SourceId,
    pub lo: EpAddr,
    pub hi: EpAddr,
}

impl FlowKey {
    pub fn new(source: SourceId, a: EpAddr, b: EpAddr) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        FlowKey { source, lo, hi }
    }
}

/// Per-flow state.
#[derive(Debug, Default)]
pub struct Flow {
    /// Timestamp of the last counted packet, seconds.
    pub last: f64,
    /// Monotonically non-decreasing packet counter.
    pub counter: u32,
    /// Direction bitmap of observed RST flags (1 = lower endpoint sent,
    /// 2 = higher endpoint sent).
    pub rst: u8,
    /// Direction bitmap of observed FIN flags.
    pub fin: u8,
    /// Total FIN-flagged segments seen.
    pub fin_packets: u32,
}

impl Flow {
    /// A TCP flow is closed once RST or FIN has been seen in both
    /// directions.
    pub fn closed(&self) -> bool {
        self.rst == 3 || self.fin == 3
    }
}

/// Hash-indexed flow store.
#[derive(Debug, Default)]
pub struct FlowTable {
    map: HashMap<FlowKey, Flow>,
}

impl FlowTable {
    pub fn new() -> Self {
        FlowTable::default()
    }

    /// Records TCP RST/FIN flags for the flow between `src` and `dst`.
    /// No-op when the flow does not exist yet; flags on the very first
    /// segment of a conversation carry no teardown information.
    pub fn register_tcp_flags(
        &mut self,
        source: SourceId,
        src: EpAddr,
        dst: EpAddr,
        rst: bool,
        fin: bool,
    ) {
        let Some(flow) = self.map.get_mut(&FlowKey::new(source, src, dst)) else {
            return;
        };

        let bit = if src > dst { 2 } else { 1 };
        if rst {
            flow.rst |= bit;
            return;
        }
        if fin {
            flow.fin_packets += 1;
            flow.fin |= bit;
        }
    }

    /// Counts one packet into the flow, creating it lazily, and returns the
    /// updated counter.
    pub fn count(&mut self, source: SourceId, src: EpAddr, dst: EpAddr, ts: f64) -> u32 {
        let flow = self.map.entry(FlowKey::new(source, src, dst)).or_default();
        flow.last = ts;
        flow.counter += 1;
        flow.counter
    }

    pub fn get(&self, key: &FlowKey) -> Option<&Flow> {
        self.map.get(key)
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Evicts closed flows and flows idle past `timeout_secs`, where "now"
    /// is the creating source's clock. Returns the number of evictions.
    pub fn sweep(&mut self, now_by_source: &[f64], timeout_secs: u64) -> usize {
        let before = self.map.len();
        self.map.retain(|key, flow| {
            if flow.closed() {
                return false;
            }
            let now = now_by_source
                .get(key.source.index())
                .copied()
                .unwrap_or(0.0);
            flow.last + timeout_secs as f64 >= now
        });
        before - self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{FlowKey, FlowTable};
    use crate::addr::{EpAddr, Proto};
    use crate::source::SourceId;
    use std::net::Ipv4Addr;

    const SRC: SourceId = SourceId(0);

    fn pair() -> (EpAddr, EpAddr) {
        (
            EpAddr::new(Proto::Tcp, Ipv4Addr::new(10, 0, 0, 1), 1000),
            EpAddr::new(Proto::Tcp, Ipv4Addr::new(10, 0, 0, 2), 2000),
        )
    }

    #[test]
    fn counter_is_monotonic_and_direction_agnostic() {
        let (a, b) = pair();
        let mut flows = FlowTable::new();

        let mut prev = 0;
        for i in 0..10 {
            // alternate directions; both map to the same flow
            let n = if i % 2 == 0 {
                flows.count(SRC, a, b, i as f64)
            } else {
                flows.count(SRC, b, a, i as f64)
            };
            assert!(n > prev);
            prev = n;
        }
        assert_eq!(prev, 10);
        assert_eq!(flows.len(), 1);
    }

    #[test]
    fn flags_on_unknown_flow_are_ignored() {
        let (a, b) = pair();
        let mut flows = FlowTable::new();
        flows.register_tcp_flags(SRC, a, b, true, false);
        assert!(flows.is_empty());
    }

    #[test]
    fn rst_both_directions_closes() {
        let (a, b) = pair();
        let mut flows = FlowTable::new();
        flows.count(SRC, a, b, 0.0);

        flows.register_tcp_flags(SRC, a, b, true, false);
        let key = FlowKey::new(SRC, a, b);
        assert!(!flows.get(&key).unwrap().closed());

        flows.register_tcp_flags(SRC, b, a, true, false);
        assert!(flows.get(&key).unwrap().closed());
    }

    #[test]
    fn fin_both_directions_closes() {
        let (a, b) = pair();
        let mut flows = FlowTable::new();
        flows.count(SRC, a, b, 0.0);

        flows.register_tcp_flags(SRC, a, b, false, true);
        flows.register_tcp_flags(SRC, b, a, false, true);
        let flow = flows.get(&FlowKey::new(SRC, a, b)).unwrap();
        assert!(flow.closed());
        assert_eq!(flow.fin_packets, 2);
    }

    #[test]
    fn sweep_evicts_closed_regardless_of_recency() {
        let (a, b) = pair();
        let mut flows = FlowTable::new();
        flows.count(SRC, a, b, 100.0);
        flows.register_tcp_flags(SRC, a, b, true, false);
        flows.register_tcp_flags(SRC, b, a, true, false);

        // "now" equals the last packet time; only closure drives eviction
        assert_eq!(flows.sweep(&[100.0], 300), 1);
        assert!(!flows.contains(&FlowKey::new(SRC, a, b)));
    }

    #[test]
    fn sweep_evicts_idle_flows() {
        let (a, b) = pair();
        let mut flows = FlowTable::new();
        flows.count(SRC, a, b, 10.0);

        assert_eq!(flows.sweep(&[300.0], 300), 0);
        assert_eq!(flows.sweep(&[311.0], 300), 1);
        assert!(flows.is_empty());
    }
}
