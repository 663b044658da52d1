use std::sync::Arc;
use std::thread;
use std::time::Duration;

use packet_extractor::config::ExtractorConfig;
use packet_extractor::{
    BoundedQueue, FoundPacket, FrameExtractor, PacketErrorKind, QueueError, Wait,
};

const CONFIG: &str = r#"
ingress_capacity: 64
egress_capacity: 4
layout:
  - kind: header
    pattern: "AA 55"
  - kind: length
    width: 2
    byte_order: msb
  - kind: command
    size: 1
  - kind: data
  - kind: checksum
    algorithm: crc32
    covers: [length, command, data]
  - kind: footer
    pattern: "0D 0A"
commands:
  - { code: "01", name: ping, size: 0 }
  - { code: "02", name: telemetry, size: 0 }
"#;

fn start() -> FrameExtractor {
    let config = ExtractorConfig::from_str(CONFIG).unwrap();
    FrameExtractor::start(config.build_layout().unwrap(), config.options()).unwrap()
}

fn drain(extractor: &FrameExtractor) -> Vec<FoundPacket> {
    extractor.close_input();
    extractor.receiver().collect()
}

#[test]
fn test_stream_with_corruption_resyncs() {
    let extractor = start();
    let layout = extractor.current_layout().clone();

    let good1 = layout.build_packet(&[0x01], b"first").unwrap();
    let good2 = layout.build_packet(&[0x02], b"second").unwrap();
    let mut bad_crc = layout.build_packet(&[0x02], b"flipped").unwrap();
    let crc_at = bad_crc.len() - 3;
    bad_crc[crc_at] ^= 0x01;

    let mut stream = vec![0x13, 0x37, 0x00];
    stream.extend_from_slice(&good1);
    stream.extend_from_slice(&bad_crc);
    stream.extend_from_slice(&[0xFF; 3]);
    stream.extend_from_slice(&good2);

    let consumer = {
        let receiver = extractor.receiver();
        thread::spawn(move || receiver.collect::<Vec<FoundPacket>>())
    };
    extractor.feed(&stream).unwrap();
    extractor.close_input();
    let found = consumer.join().unwrap();

    let kinds: Vec<PacketErrorKind> = found.iter().map(|f| f.error).collect();
    assert_eq!(
        kinds,
        vec![
            PacketErrorKind::HeaderMismatch,
            PacketErrorKind::None,
            PacketErrorKind::ChecksumMismatch,
            PacketErrorKind::HeaderMismatch,
            PacketErrorKind::None,
        ]
    );
    assert_eq!(found[0].rejected_bytes(), Some(&[0x13, 0x37, 0x00][..]));
    assert_eq!(found[1].data(), Some(&b"first"[..]));
    assert_eq!(found[2].data(), Some(&b"flipped"[..]));
    assert_eq!(found[4].message().map(|m| m.name()), Some("telemetry"));
}

#[test]
fn test_byte_at_a_time() {
    let extractor = start();
    let packet = extractor
        .current_layout()
        .build_packet(&[0x01], b"hi")
        .unwrap();

    for byte in &packet {
        extractor.feed(&[*byte]).unwrap();
    }

    let found = drain(&extractor);
    assert_eq!(found.len(), 1);
    assert!(found[0].is_ok());
    assert_eq!(found[0].data(), Some(&b"hi"[..]));
}

#[test]
fn test_multiple_producers_keep_runs_whole() {
    let extractor = start();
    let layout = extractor.current_layout().clone();

    // every packet fits the ingress queue, so each feed lands as one run
    let producers: Vec<_> = (0..4u8)
        .map(|id| {
            let feeder = extractor.feeder();
            let packet = layout.build_packet(&[0x02], &[id; 16]).unwrap();
            thread::spawn(move || {
                for _ in 0..25 {
                    feeder.feed(&packet).unwrap();
                }
            })
        })
        .collect();

    let consumer = {
        let receiver = extractor.receiver();
        thread::spawn(move || receiver.collect::<Vec<FoundPacket>>())
    };

    for p in producers {
        p.join().unwrap();
    }
    extractor.close_input();
    let found = consumer.join().unwrap();

    assert_eq!(found.len(), 100);
    for pkt in &found {
        assert!(pkt.is_ok(), "{pkt}");
        let data = pkt.data().unwrap();
        assert!(data.iter().all(|&b| b == data[0]));
    }
    for id in 0..4u8 {
        let n = found.iter().filter(|p| p.data().map(|d| d[0]) == Some(id)).count();
        assert_eq!(n, 25);
    }
}

#[test]
fn test_backpressure_stalls_producer() {
    let extractor = Arc::new(start());
    let packet = extractor
        .current_layout()
        .build_packet(&[0x01], &[0u8; 40])
        .unwrap();

    // egress holds 4 records and ingress 64 bytes; nobody consumes yet
    let producer = {
        let extractor = Arc::clone(&extractor);
        let packet = packet.clone();
        thread::spawn(move || {
            for _ in 0..10 {
                extractor.feed(&packet).unwrap();
            }
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!producer.is_finished(), "producer should be stalled by backpressure");

    let mut received = 0;
    while received < 10 {
        let found = extractor.next_packet().unwrap();
        assert!(found.is_ok());
        received += 1;
    }
    producer.join().unwrap();
}

#[test]
fn test_try_feed_reports_full() {
    let extractor = start();
    let packet = extractor
        .current_layout()
        .build_packet(&[0x01], &[7u8; 40])
        .unwrap();

    let mut full = false;
    for _ in 0..50 {
        match extractor.feed_with(&packet, Wait::Immediate) {
            Ok(()) => {}
            Err(QueueError::Full) => {
                full = true;
                break;
            }
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert!(full);
}

#[test]
fn test_shutdown_discards_pending() {
    let extractor = start();
    let packet = extractor
        .current_layout()
        .build_packet(&[0x01], b"x")
        .unwrap();
    extractor.feed(&packet).unwrap();
    extractor.shutdown();
}

#[test]
fn test_queue_shared_between_threads() {
    let queue = Arc::new(BoundedQueue::new(16).unwrap());
    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            for i in 0..1000u32 {
                queue.push_blocking(i).unwrap();
            }
            queue.close();
        })
    };

    let mut expected = 0u32;
    while let Ok(v) = queue.pop_blocking() {
        assert_eq!(v, expected);
        assert!(queue.size() <= 16);
        expected += 1;
    }
    producer.join().unwrap();
    assert_eq!(expected, 1000);
}
