//! Live interface source, available with the `live` cargo feature.
//!
//! Filtering is delegated to the capture library: whatever BPF expression
//! the source spec carries is compiled by libpcap, so live sources are not
//! limited to the file-source filter subset.

use pcap_parser::Linktype;

use super::{Batch, PacketSource, RawPacket, SourceError};
use crate::source::filter::DEFAULT_FILTER;

/// Snap length for live capture. Full frames: window features need the
/// wire length and the first payload bytes, and truncated frames would be
/// dropped by the decoder.
const SNAPLEN: i32 = 65535;

/// Read timeout handed to libpcap, in milliseconds.
const READ_TIMEOUT_MS: i32 = 10;

pub struct LiveSource {
    capture: pcap::Capture<pcap::Active>,
    linktype: Linktype,
}

impl LiveSource {
    pub fn open(ifname: &str, filter: Option<&str>) -> Result<Self, SourceError> {
        let device = pcap::Capture::from_device(ifname)
            .map_err(|e| SourceError::Capture(e.to_string()))?;
        let mut capture = device
            .promisc(true)
            .snaplen(SNAPLEN)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .map_err(|e| SourceError::Capture(e.to_string()))?;
        capture
            .filter(filter.unwrap_or(DEFAULT_FILTER), true)
            .map_err(|e| SourceError::Capture(e.to_string()))?;
        let linktype = Linktype(capture.get_datalink().0);
        Ok(LiveSource { capture, linktype })
    }
}

impl PacketSource for LiveSource {
    fn read_batch(&mut self, max: usize) -> Result<Batch, SourceError> {
        let mut batch = Batch::default();
        while batch.packets.len() < max {
            match self.capture.next_packet() {
                Ok(packet) => {
                    let header = packet.header;
                    let ts = header.ts.tv_sec as f64 + header.ts.tv_usec as f64 * 1e-6;
                    batch.packets.push(RawPacket {
                        ts,
                        linktype: self.linktype,
                        data: packet.data.to_vec(),
                        wire_len: header.len,
                    });
                }
                // transient empty read; wait for the next loop turn
                Err(pcap::Error::TimeoutExpired) => break,
                Err(pcap::Error::NoMorePackets) => {
                    batch.exhausted = true;
                    break;
                }
                Err(e) => return Err(SourceError::Capture(e.to_string())),
            }
        }
        Ok(batch)
    }
}
