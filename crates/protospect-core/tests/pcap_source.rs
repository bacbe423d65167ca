use std::fs;

use protospect_core::source::{PacketSource, PcapFileSource, SourceError};

mod util;

#[test]
fn file_source_reads_generated_capture() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.pcap");
    let packets: Vec<(f64, Vec<u8>)> = (0..5)
        .map(|i| {
            (
                i as f64 * 0.5,
                util::udp_packet([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000, &[i as u8; 16]),
            )
        })
        .collect();
    util::write_legacy_pcap(&path, &packets);

    let mut source = PcapFileSource::open(&path).unwrap();
    let batch = source.read_batch(100).unwrap();
    assert_eq!(batch.packets.len(), 5);
    assert!(batch.exhausted);

    let first = &batch.packets[0];
    assert_eq!(first.ts, 0.0);
    assert_eq!(first.wire_len, first.data.len() as u32);
    let last = &batch.packets[4];
    assert!((last.ts - 2.0).abs() < 1e-6);

    // once exhausted, further reads stay exhausted and empty
    let batch = source.read_batch(10).unwrap();
    assert!(batch.packets.is_empty());
    assert!(batch.exhausted);
}

#[test]
fn batched_reads_respect_max() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.pcap");
    let packets: Vec<(f64, Vec<u8>)> = (0..7)
        .map(|i| {
            (
                i as f64,
                util::udp_packet([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000, &[0u8; 12]),
            )
        })
        .collect();
    util::write_legacy_pcap(&path, &packets);

    let mut source = PcapFileSource::open(&path).unwrap();
    let batch = source.read_batch(3).unwrap();
    assert_eq!(batch.packets.len(), 3);
    assert!(!batch.exhausted);
    let batch = source.read_batch(3).unwrap();
    assert_eq!(batch.packets.len(), 3);
    let batch = source.read_batch(3).unwrap();
    assert_eq!(batch.packets.len(), 1);
    assert!(batch.exhausted);
}

#[test]
fn garbage_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("noise.pcap");
    fs::write(&path, [0x42u8; 64]).unwrap();

    let mut source = match PcapFileSource::open(&path) {
        // some garbage is only detected on the first read
        Ok(source) => source,
        Err(SourceError::Pcap(_)) => return,
        Err(other) => panic!("unexpected error: {other}"),
    };
    assert!(matches!(
        source.read_batch(1),
        Err(SourceError::Pcap(_))
    ));
}

#[test]
fn missing_file_is_an_io_error() {
    let err = PcapFileSource::open(std::path::Path::new("/nonexistent/capture.pcap"))
        .expect_err("open must fail");
    assert!(matches!(err, SourceError::Io(_)));
}
