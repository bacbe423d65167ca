//! Frame decoding.
//!
//! Turns one captured Ethernet frame into endpoint addresses plus the
//! transport payload. Decoding is side-effect free; flow accounting and
//! payload gates live in the engine. Supported shape is Ethernet II
//! (optionally 802.1Q tagged) carrying IPv4 with TCP or UDP; everything
//! else decodes to `Ok(None)` and is dropped silently by the caller, while
//! malformed or truncated frames surface as an error so they can be
//! counted separately.

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use thiserror::Error;

use crate::addr::{EpAddr, Proto};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame slice error: {0}")]
    Slice(String),
}

/// Decoded view of a routable frame.
#[derive(Debug)]
pub struct DecodedFrame<'a> {
    pub proto: Proto,
    pub src: EpAddr,
    pub dst: EpAddr,
    /// Transport payload (TCP data-offset or UDP header already skipped).
    pub payload: &'a [u8],
    /// TCP RST flag; always false for UDP.
    pub rst: bool,
    /// TCP FIN flag; always false for UDP.
    pub fin: bool,
}

/// Decodes an Ethernet frame down to the transport payload.
///
/// Returns `Ok(None)` for frames the pipeline does not inspect (ARP, IPv6,
/// EAPOL, unknown EtherTypes, ICMP and other transports) and an error for
/// frames that are malformed at some layer.
pub fn decode_ethernet(data: &[u8]) -> Result<Option<DecodedFrame<'_>>, FrameError> {
    let sliced =
        SlicedPacket::from_ethernet(data).map_err(|e| FrameError::Slice(e.to_string()))?;

    let ipv4 = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => ipv4,
        // ARP and EAPOL leave no network slice; IPv6 is out of scope
        _ => return Ok(None),
    };
    let src_ip = ipv4.header().source_addr();
    let dst_ip = ipv4.header().destination_addr();

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Ok(Some(DecodedFrame {
            proto: Proto::Tcp,
            src: EpAddr::new(Proto::Tcp, src_ip, tcp.source_port()),
            dst: EpAddr::new(Proto::Tcp, dst_ip, tcp.destination_port()),
            payload: tcp.payload(),
            rst: tcp.rst(),
            fin: tcp.fin(),
        })),
        Some(TransportSlice::Udp(udp)) => Ok(Some(DecodedFrame {
            proto: Proto::Udp,
            src: EpAddr::new(Proto::Udp, src_ip, udp.source_port()),
            dst: EpAddr::new(Proto::Udp, dst_ip, udp.destination_port()),
            payload: udp.payload(),
            rst: false,
            fin: false,
        })),
        _ => Ok(None),
    }
}
