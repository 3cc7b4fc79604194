use std::net::SocketAddr;
use std::time::SystemTime;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use tinytel::{
    DataPacket, Datagram, Header, HeaderFlags, IngestConfig, IngestPipeline, MemorySink,
    MessageType, Reply, SnapshotKind,
};

const DEVICE: u16 = 42;

fn device_addr() -> SocketAddr {
    "127.0.0.1:50000".parse().unwrap()
}

fn data(device_id: u16, seq: u32, danger: bool) -> Datagram {
    let mut packet = DataPacket::single(device_id, seq, (seq % 50) as u16 + 1, danger);
    // A shared timestamp leaves the sequence number to decide commit order.
    packet.header = packet.header.with_timestamp(1_700_000_000);
    Datagram {
        bytes: packet.encode(),
        from: device_addr(),
        arrival: SystemTime::now(),
    }
}

fn pipeline(flush_threshold: usize) -> IngestPipeline<MemorySink> {
    IngestPipeline::new(IngestConfig { flush_threshold }, MemorySink::new())
}

fn deliver(pipeline: &mut IngestPipeline<MemorySink>, seqs: &[u32]) {
    for &seq in seqs {
        pipeline.handle_datagram(&data(DEVICE, seq, false)).unwrap();
    }
}

#[test]
fn test_permuted_arrival_commits_in_order() {
    let mut pipeline = pipeline(10);
    deliver(&mut pipeline, &[3, 1, 0, 2, 4, 6, 5, 7, 9, 8]);

    let rows = &pipeline.sink().rows;
    assert_eq!(
        rows.iter().map(|r| r.seq_num).collect::<Vec<_>>(),
        (0..10).collect::<Vec<_>>()
    );
    assert!(rows.iter().all(|r| !r.gap && !r.duplicate));

    let snapshot = pipeline.finish();
    assert_eq!(snapshot.loss_count, 0);
    assert_eq!(snapshot.dup_total, 0);
    assert_eq!(snapshot.readings_written, 10);
}

#[test]
fn test_large_packets_keep_buffer_bounded() {
    let mut pipeline = pipeline(10);

    for packet in 0..5u32 {
        let data = DataPacket {
            header: Header::new(DEVICE, packet * 200, MessageType::Data, HeaderFlags::empty())
                .with_timestamp(1_700_000_000),
            readings: vec![30; 200],
        };
        pipeline
            .handle_datagram(&Datagram {
                bytes: data.encode(),
                from: device_addr(),
                arrival: SystemTime::now(),
            })
            .unwrap();

        assert!(pipeline.stream(DEVICE).unwrap().pending_len() < 10);
        assert_eq!(pipeline.sink().rows.len(), 200 * (packet as usize + 1));
    }

    let snapshot = pipeline.finish();
    assert_eq!(snapshot.readings_written, 1000);
    assert_eq!(snapshot.loss_count, 0);
    assert!(pipeline.sink().rows.iter().all(|r| !r.gap));
}

#[test]
fn test_duplicate_written_once() {
    let mut pipeline = pipeline(10);
    deliver(&mut pipeline, &[0, 1, 1, 2]);

    let snapshot = pipeline.finish();

    assert_eq!(pipeline.sink().sequences(DEVICE), vec![0, 1, 2]);
    assert_eq!(snapshot.dup_total, 1);
    assert_eq!(snapshot.dup_seq_count, 1);
    assert_eq!(snapshot.packets_received, 3);
}

#[test]
fn test_gap_reported_as_loss_at_shutdown() {
    let mut pipeline = pipeline(10);
    deliver(&mut pipeline, &[0, 1, 4]);

    let snapshot = pipeline.finish();

    assert_eq!(snapshot.loss_count, 2);
    let rows = &pipeline.sink().rows;
    assert_eq!(rows.len(), 3);
    assert!(rows[2].gap);
    assert_eq!(pipeline.sink().flushes, 1);
}

#[test]
fn test_redelivery_after_commit_is_idempotent() {
    let mut pipeline = pipeline(3);
    deliver(&mut pipeline, &[0, 1, 2]);
    assert_eq!(pipeline.stream(DEVICE).unwrap().last_written(), Some(2));

    deliver(&mut pipeline, &[1, 1, 0, 2]);

    let stream = pipeline.stream(DEVICE).unwrap();
    assert_eq!(stream.last_written(), Some(2));
    assert_eq!(stream.pending_len(), 0);
    assert_eq!(pipeline.sink().rows.len(), 3);

    let snapshot = pipeline.snapshot(SnapshotKind::Checkpoint);
    assert_eq!(snapshot.dup_total, 4);
    assert_eq!(snapshot.dup_seq_count, 3);
}

#[test]
fn test_danger_duplicate_still_acknowledged() {
    let mut pipeline = pipeline(10);
    let first = pipeline.handle_datagram(&data(DEVICE, 5, true)).unwrap();
    let again = pipeline.handle_datagram(&data(DEVICE, 5, true)).unwrap();

    assert_eq!(first.reply, Some(Reply::Ack { seq: 5 }));
    assert_eq!(again.reply, Some(Reply::Ack { seq: 5 }));

    let snapshot = pipeline.snapshot(SnapshotKind::Checkpoint);
    assert_eq!(snapshot.acks_sent, 2);
    assert_eq!(snapshot.packets_received, 1);
}

#[test]
fn test_devices_are_independent() {
    let mut pipeline = pipeline(2);
    for seq in [0, 1, 2, 3] {
        pipeline.handle_datagram(&data(1, seq, false)).unwrap();
    }
    for seq in [0, 3] {
        pipeline.handle_datagram(&data(2, seq, false)).unwrap();
    }

    let snapshot = pipeline.finish();

    assert_eq!(pipeline.sink().sequences(1), vec![0, 1, 2, 3]);
    assert_eq!(pipeline.sink().sequences(2), vec![0, 3]);
    let lost: Vec<_> = snapshot.devices.iter().map(|d| (d.device_id, d.loss_count)).collect();
    assert_eq!(lost, vec![(1, 0), (2, 2)]);
}

#[test]
fn test_malformed_traffic_does_not_disturb_state() {
    let mut pipeline = pipeline(10);
    deliver(&mut pipeline, &[0, 1]);

    let short = Datagram {
        bytes: vec![0, 42, 0, 0],
        from: device_addr(),
        arrival: SystemTime::now(),
    };
    assert!(pipeline.handle_datagram(&short).is_err());

    deliver(&mut pipeline, &[2]);
    let snapshot = pipeline.finish();

    assert_eq!(snapshot.malformed, 1);
    assert_eq!(pipeline.sink().sequences(DEVICE), vec![0, 1, 2]);
}

#[test]
fn test_any_delivery_order_accounts_for_every_sequence() {
    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(seed);

        // Sequences 0..60 with some dropped and some sent two or three times.
        let mut arrivals = Vec::new();
        let mut extra_copies = 0u64;
        for seq in 0..60u32 {
            match (seq * 7 + seed as u32) % 11 {
                0 | 1 => {}
                2 => {
                    arrivals.extend([seq, seq]);
                    extra_copies += 1;
                }
                3 => {
                    arrivals.extend([seq, seq, seq]);
                    extra_copies += 2;
                }
                _ => arrivals.push(seq),
            }
        }
        arrivals.shuffle(&mut rng);
        let max_seq = *arrivals.iter().max().unwrap();

        // A threshold larger than the stream keeps everything buffered until shutdown.
        let mut pipeline = pipeline(1000);
        deliver(&mut pipeline, &arrivals);
        let snapshot = pipeline.finish();

        let written = pipeline.sink().rows.len() as u64;
        assert_eq!(
            written + snapshot.loss_count,
            max_seq as u64 + 1,
            "seed {seed}"
        );
        assert_eq!(snapshot.dup_total, extra_copies, "seed {seed}");

        let seqs = pipeline.sink().sequences(DEVICE);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seed {seed}");
    }
}
