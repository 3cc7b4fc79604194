use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use tinytel::{
    ClientSession, EndReason, Header, HeartbeatPolicy, Liveness, MessageType, Outbound,
    ReadingProfile, Reply, RetryPolicy, SessionConfig, SessionState, TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Behaviour {
    Silent,
    Answer,
    AckWrongSeq,
}

#[derive(Debug, Clone)]
struct Received {
    header: Header,
    bytes: Vec<u8>,
    at: Instant,
}

struct FakeCollector {
    addr: SocketAddr,
    log: Arc<Mutex<Vec<Received>>>,
    task: JoinHandle<()>,
}

impl FakeCollector {
    async fn start(behaviour: Behaviour) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let log = Arc::clone(&log);
            async move {
                let mut buf = [0u8; 1024];
                loop {
                    let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                        continue;
                    };
                    let Ok(header) = Header::decode(&buf[..len]) else {
                        continue;
                    };
                    log.lock().unwrap().push(Received {
                        header,
                        bytes: buf[..len].to_vec(),
                        at: Instant::now(),
                    });

                    let reply = match (behaviour, header.msg_type) {
                        (Behaviour::Answer, MessageType::Heartbeat) => Some(Reply::Alive),
                        (Behaviour::Answer, MessageType::Data) if header.is_danger() => {
                            Some(Reply::Ack {
                                seq: header.seq_num,
                            })
                        }
                        (Behaviour::AckWrongSeq, MessageType::Data) => Some(Reply::Ack {
                            seq: header.seq_num + 100,
                        }),
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        let _ = socket.send_to(&reply.encode(), from).await;
                    }
                }
            }
        });

        Self { addr, log, task }
    }

    fn received(&self, msg_type: MessageType) -> Vec<Received> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.header.msg_type == msg_type)
            .cloned()
            .collect()
    }
}

impl Drop for FakeCollector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn always_danger() -> ReadingProfile {
    ReadingProfile {
        elevated: 80..=80,
        elevated_probability: 1.0,
        ..Default::default()
    }
}

fn never_danger() -> ReadingProfile {
    ReadingProfile {
        elevated_probability: 0.0,
        ..Default::default()
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        initial_timeout: Duration::from_millis(20),
        max_timeout: Duration::from_millis(80),
    }
}

/// One danger reading, no heartbeats, and a run short enough that a second reading never starts.
fn single_danger_reading(collector: SocketAddr) -> SessionConfig {
    SessionConfig {
        run_duration: Duration::from_millis(600),
        settle_delay: Duration::ZERO,
        data_interval: Duration::from_secs(10),
        heartbeat: HeartbeatPolicy {
            warm_up: Duration::from_secs(60),
            ..Default::default()
        },
        retry: fast_retry(),
        profile: always_danger(),
        ..SessionConfig::new(7, collector)
    }
}

fn fast_heartbeats(device_id: u16, collector: SocketAddr) -> SessionConfig {
    SessionConfig {
        run_duration: Duration::from_secs(5),
        settle_delay: Duration::ZERO,
        data_interval: Duration::from_secs(10),
        heartbeat: HeartbeatPolicy {
            warm_up: Duration::ZERO,
            period: Duration::from_millis(40),
            reply_timeout: Duration::from_millis(30),
            miss_threshold: 3,
        },
        retry: fast_retry(),
        profile: never_danger(),
        ..SessionConfig::new(device_id, collector)
    }
}

#[tokio::test]
async fn test_unacknowledged_danger_reading_sent_five_times() {
    let collector = FakeCollector::start(Behaviour::Silent).await;
    let session = ClientSession::bind(
        single_danger_reading(collector.addr),
        Outbound::Direct,
        Liveness::new(),
    )
    .await
    .unwrap();

    let report = session.run().await.unwrap();

    let sends = collector.received(MessageType::Data);
    assert_eq!(sends.len(), 5);
    assert!(sends.iter().all(|r| r.header.seq_num == 0 && r.bytes == sends[0].bytes));

    // 20, 40, 80, 80 ms between the five sends, with slack for scheduling
    let expected = [20u64, 40, 80, 80];
    for (pair, min_ms) in sends.windows(2).zip(expected) {
        let gap = pair[1].at.duration_since(pair[0].at);
        assert!(
            gap >= Duration::from_millis(min_ms * 3 / 4),
            "gap {gap:?} shorter than {min_ms}ms"
        );
    }

    assert_eq!(report.readings_sent, 1);
    assert_eq!(report.data_sends, 5);
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.acknowledged, 0);
    assert_eq!(report.next_seq, 1);
    assert_eq!(report.end_reason, EndReason::RunComplete);
}

#[tokio::test]
async fn test_ack_stops_retries() {
    let collector = FakeCollector::start(Behaviour::Answer).await;
    let session = ClientSession::bind(
        single_danger_reading(collector.addr),
        Outbound::Direct,
        Liveness::new(),
    )
    .await
    .unwrap();

    let report = session.run().await.unwrap();

    assert_eq!(collector.received(MessageType::Data).len(), 1);
    assert_eq!(report.acknowledged, 1);
    assert_eq!(report.data_sends, 1);
    assert!(report.srtt_ms.is_some());
}

#[tokio::test]
async fn test_mismatched_ack_is_ignored() {
    let collector = FakeCollector::start(Behaviour::AckWrongSeq).await;
    let session = ClientSession::bind(
        single_danger_reading(collector.addr),
        Outbound::Direct,
        Liveness::new(),
    )
    .await
    .unwrap();

    let report = session.run().await.unwrap();

    assert_eq!(collector.received(MessageType::Data).len(), 5);
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.acknowledged, 0);
}

#[tokio::test]
async fn test_ack_from_other_source_is_ignored() {
    let collector = FakeCollector::start(Behaviour::Silent).await;
    let session = ClientSession::bind(
        single_danger_reading(collector.addr),
        Outbound::Direct,
        Liveness::new(),
    )
    .await
    .unwrap();
    let device_addr = SocketAddr::from(([127, 0, 0, 1], session.local_addr().unwrap().port()));

    let impostor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let spoofing = tokio::spawn(async move {
        let ack = Reply::Ack { seq: 0 }.encode();
        for _ in 0..30 {
            let _ = impostor.send_to(&ack, device_addr).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let report = session.run().await.unwrap();
    spoofing.abort();

    assert_eq!(collector.received(MessageType::Data).len(), 5);
    assert_eq!(report.abandoned, 1);
}

#[tokio::test]
async fn test_three_missed_heartbeats_stop_every_session() {
    let collector = FakeCollector::start(Behaviour::Silent).await;
    let liveness = Liveness::new();

    let watcher = ClientSession::bind(
        fast_heartbeats(1, collector.addr),
        Outbound::Direct,
        liveness.clone(),
    )
    .await
    .unwrap();

    let mut quiet = fast_heartbeats(2, collector.addr);
    quiet.heartbeat.warm_up = Duration::from_secs(60);
    let bystander = ClientSession::bind(quiet, Outbound::Direct, liveness.clone())
        .await
        .unwrap();

    let started = Instant::now();
    let (watcher, bystander) = tokio::join!(watcher.run(), bystander.run());
    let (watcher, bystander) = (watcher.unwrap(), bystander.unwrap());

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!liveness.is_alive());

    assert_eq!(watcher.heartbeats_sent, 3);
    assert_eq!(watcher.heartbeats_missed, 3);
    assert!(watcher.tripped_liveness);
    assert_eq!(watcher.end_reason, EndReason::LivenessLost);

    assert!(!bystander.tripped_liveness);
    assert_eq!(bystander.heartbeats_sent, 0);
    assert_eq!(bystander.end_reason, EndReason::LivenessLost);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let before = collector.log.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(collector.log.lock().unwrap().len(), before);
    assert_eq!(collector.received(MessageType::Heartbeat).len(), 3);
}

#[tokio::test]
async fn test_answered_heartbeats_keep_session_alive() {
    let collector = FakeCollector::start(Behaviour::Answer).await;
    let liveness = Liveness::new();
    let config = SessionConfig {
        run_duration: Duration::from_millis(400),
        ..fast_heartbeats(3, collector.addr)
    };

    let session = ClientSession::bind(config, Outbound::Direct, liveness.clone())
        .await
        .unwrap();
    let state = session.subscribe_state();

    let report = session.run().await.unwrap();

    assert!(liveness.is_alive());
    assert_eq!(report.end_reason, EndReason::RunComplete);
    assert!(report.heartbeats_sent >= 3);
    assert_eq!(report.heartbeats_missed, 0);
    assert!(report.heartbeats_answered + 1 >= report.heartbeats_sent);
    assert_eq!(*state.borrow(), SessionState::Closed);

    assert_eq!(collector.received(MessageType::Init).len(), 1);
}

#[tokio::test]
async fn test_refused_init_is_returned_as_error() {
    // Limited broadcast without SO_BROADCAST: the kernel refuses the INIT.
    let refused: SocketAddr = "255.255.255.255:9".parse().unwrap();
    let session = ClientSession::bind(
        SessionConfig::new(4, refused),
        Outbound::Direct,
        Liveness::new(),
    )
    .await
    .unwrap();
    let state = session.subscribe_state();

    let result = session.run().await;

    assert!(matches!(result, Err(TransportError::SendFailed { .. })));
    assert_eq!(*state.borrow(), SessionState::Closed);
}
