//! Device-side session: INIT, heartbeat liveness, periodic readings and reliable delivery of
//! danger readings.

mod heartbeat;
mod link;
mod liveness;
mod reading;
mod reliable;

use std::net::SocketAddr;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio::time::{Instant, sleep, sleep_until};

pub use heartbeat::{HeartbeatPolicy, HeartbeatStats};
pub use link::{Link, Outbound, Replies};
pub use liveness::Liveness;
pub use reading::{DANGER_THRESHOLD, Reading, ReadingProfile};
pub use reliable::{AckOutcome, RetryPolicy, RttEstimator};

use crate::error::{ConfigError, TransportError};
use crate::net::{DataPacket, init_packet};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub device_id: u16,
    pub collector: SocketAddr,
    pub run_duration: Duration,
    /// Pause after INIT before readings start, whether or not the collector answered.
    pub settle_delay: Duration,
    pub data_interval: Duration,
    pub heartbeat: HeartbeatPolicy,
    pub retry: RetryPolicy,
    pub profile: ReadingProfile,
}

impl SessionConfig {
    pub fn new(device_id: u16, collector: SocketAddr) -> Self {
        Self {
            device_id,
            collector,
            run_duration: Duration::from_secs(50),
            settle_delay: Duration::from_secs(2),
            data_interval: Duration::from_secs(4),
            heartbeat: HeartbeatPolicy::default(),
            retry: RetryPolicy::default(),
            profile: ReadingProfile::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run_duration.is_zero() {
            return Err(ConfigError::Zero("run_duration"));
        }
        if self.data_interval.is_zero() {
            return Err(ConfigError::Zero("data_interval"));
        }
        if !(0.0..=1.0).contains(&self.profile.elevated_probability) {
            return Err(ConfigError::ProbabilityOutOfRange {
                name: "elevated_probability",
                value: self.profile.elevated_probability,
            });
        }
        self.heartbeat.validate()?;
        self.retry.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    InitSending,
    Running,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    RunComplete,
    LivenessLost,
    TransportFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub device_id: u16,
    pub end_reason: EndReason,
    pub readings_sent: u64,
    pub data_sends: u64,
    pub danger_readings: u64,
    pub acknowledged: u64,
    pub abandoned: u64,
    pub dropped_by_impairment: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_answered: u64,
    pub heartbeats_missed: u64,
    pub tripped_liveness: bool,
    pub next_seq: u32,
    pub srtt_ms: Option<f64>,
    pub rtt_var_ms: f64,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct DataStats {
    readings_sent: u64,
    data_sends: u64,
    danger_readings: u64,
    acknowledged: u64,
    abandoned: u64,
    dropped: u64,
    next_seq: u32,
    rtt: RttEstimator,
}

/// Stop conditions shared by a session's duties: the run deadline, the process-wide liveness
/// flag, and the session's own flag (taken down when a duty hits a transport error).
#[derive(Debug, Clone)]
pub(crate) struct RunScope {
    deadline: Instant,
    liveness: Liveness,
    session: Liveness,
}

impl RunScope {
    fn new(deadline: Instant, liveness: Liveness) -> Self {
        Self {
            deadline,
            liveness,
            session: Liveness::new(),
        }
    }

    pub(crate) fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub(crate) fn should_stop(&self) -> bool {
        Instant::now() >= self.deadline || !self.liveness.is_alive() || !self.session.is_alive()
    }

    pub(crate) async fn stopped(&self) {
        tokio::select! {
            _ = sleep_until(self.deadline) => {}
            _ = self.liveness.tripped() => {}
            _ = self.session.tripped() => {}
        }
    }

    /// Returns `false` if the run stopped before `duration` passed.
    pub(crate) async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => !self.should_stop(),
            _ = self.stopped() => false,
        }
    }

    pub(crate) async fn pause_until(&self, at: Instant) -> bool {
        tokio::select! {
            _ = sleep_until(at) => !self.should_stop(),
            _ = self.stopped() => false,
        }
    }
}

/// One simulated device talking to the collector.
pub struct ClientSession {
    config: SessionConfig,
    link: Link,
    liveness: Liveness,
    rng: StdRng,
    state: watch::Sender<SessionState>,
}

impl ClientSession {
    pub async fn bind(
        config: SessionConfig,
        outbound: Outbound,
        liveness: Liveness,
    ) -> Result<Self, TransportError> {
        let link = Link::bind(config.device_id, config.collector, outbound).await?;
        let (state, _) = watch::channel(SessionState::InitSending);

        Ok(Self {
            config,
            link,
            liveness,
            rng: StdRng::from_entropy(),
            state,
        })
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn device_id(&self) -> u16 {
        self.config.device_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.link.local_addr()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn enter(&self, state: SessionState) {
        log::debug!("device {} -> {:?}", self.config.device_id, state);
        self.state.send_replace(state);
    }

    /// Runs until the run duration elapses or liveness is lost. Only a failure to announce the
    /// session is returned as an error; later transport errors end the session with
    /// [`EndReason::TransportFailure`].
    pub async fn run(self) -> Result<SessionReport, TransportError> {
        let started = Instant::now();
        let device_id = self.config.device_id;
        let scope = RunScope::new(started + self.config.run_duration, self.liveness.clone());
        let (router, replies) = self.link.spawn_router();

        self.enter(SessionState::InitSending);
        if let Err(e) = self.link.send(init_packet(device_id).to_vec(), None).await {
            router.abort();
            self.enter(SessionState::Closed);
            return Err(e);
        }
        log::info!("device {} sent INIT to {}", device_id, self.link.collector());

        let mut heartbeats = HeartbeatStats::default();
        let mut data = DataStats::default();

        if scope.pause(self.config.settle_delay).await {
            self.enter(SessionState::Running);
            (heartbeats, data) = self.run_duties(&scope, replies).await;
        }

        self.enter(SessionState::Draining);
        router.abort();

        let end_reason = self.end_reason(&scope);

        let report = SessionReport {
            device_id,
            end_reason,
            readings_sent: data.readings_sent,
            data_sends: data.data_sends,
            danger_readings: data.danger_readings,
            acknowledged: data.acknowledged,
            abandoned: data.abandoned,
            dropped_by_impairment: data.dropped,
            heartbeats_sent: heartbeats.sent,
            heartbeats_answered: heartbeats.answered,
            heartbeats_missed: heartbeats.missed,
            tripped_liveness: heartbeats.tripped_liveness,
            next_seq: data.next_seq,
            srtt_ms: data.rtt.srtt_ms(),
            rtt_var_ms: data.rtt.rtt_var_ms(),
            elapsed_secs: started.elapsed().as_secs_f64(),
        };

        self.enter(SessionState::Closed);
        log::info!(
            "device {} closed ({:?}): {} readings, {} danger, {} acked, {} abandoned",
            device_id,
            end_reason,
            report.readings_sent,
            report.danger_readings,
            report.acknowledged,
            report.abandoned
        );

        Ok(report)
    }

    fn end_reason(&self, scope: &RunScope) -> EndReason {
        if !scope.session.is_alive() {
            EndReason::TransportFailure
        } else if !self.liveness.is_alive() {
            EndReason::LivenessLost
        } else {
            EndReason::RunComplete
        }
    }

    async fn run_duties(&self, scope: &RunScope, replies: Replies) -> (HeartbeatStats, DataStats) {
        let Replies { alive, acks } = replies;

        let heartbeat_task = tokio::spawn({
            let link = self.link.clone();
            let policy = self.config.heartbeat;
            let scope = scope.clone();
            async move {
                let result = heartbeat::heartbeat_duty(link, policy, alive, scope.clone()).await;
                if result.is_err() {
                    scope.session.trip();
                }
                result
            }
        });

        let data_task = tokio::spawn({
            let duty = DataDuty {
                link: self.link.clone(),
                interval: self.config.data_interval,
                retry: self.config.retry,
                profile: self.config.profile.clone(),
                rng: self.rng.clone(),
            };
            let scope = scope.clone();
            async move {
                let result = duty.run(acks, &scope).await;
                if result.is_err() {
                    scope.session.trip();
                }
                result
            }
        });

        let (heartbeats, data) = tokio::join!(heartbeat_task, data_task);
        let device_id = self.config.device_id;
        (
            duty_stats(device_id, "heartbeat", heartbeats),
            duty_stats(device_id, "data", data),
        )
    }
}

fn duty_stats<T: Default>(
    device_id: u16,
    duty: &str,
    joined: Result<Result<T, TransportError>, JoinError>,
) -> T {
    match joined {
        Ok(Ok(stats)) => stats,
        Ok(Err(e)) => {
            log::error!("device {} {} duty stopped: {}", device_id, duty, e);
            T::default()
        }
        Err(e) => {
            log::error!("device {} {} duty aborted: {}", device_id, duty, e);
            T::default()
        }
    }
}

struct DataDuty {
    link: Link,
    interval: Duration,
    retry: RetryPolicy,
    profile: ReadingProfile,
    rng: StdRng,
}

impl DataDuty {
    async fn run(
        mut self,
        mut acks: mpsc::Receiver<u32>,
        scope: &RunScope,
    ) -> Result<DataStats, TransportError> {
        let device_id = self.link.device_id();
        let mut stats = DataStats::default();
        let mut seq: u32 = 0;

        while !scope.should_stop() {
            let tick = Instant::now();
            let reading = self.profile.sample(&mut self.rng);
            let bytes = DataPacket::single(device_id, seq, reading.value, reading.danger).encode();

            log::info!(
                "device {} DATA seq {} value {}{}",
                device_id,
                seq,
                reading.value,
                if reading.danger { " [danger]" } else { "" }
            );

            if reading.danger {
                stats.danger_readings += 1;
                let outcome =
                    reliable::send_reliable(&self.link, &bytes, seq, &self.retry, &mut acks, scope)
                        .await?;
                stats.data_sends += outcome.attempts() as u64;

                match outcome {
                    AckOutcome::Acked { rtt, .. } => {
                        stats.acknowledged += 1;
                        if let Some(rtt) = rtt {
                            stats.rtt.update(rtt);
                        }
                    }
                    AckOutcome::Exhausted { attempts } => {
                        stats.abandoned += 1;
                        log::warn!(
                            "device {} no ACK for seq {} after {} attempts, moving on",
                            device_id,
                            seq,
                            attempts
                        );
                    }
                    AckOutcome::Interrupted { .. } => {}
                }
            } else {
                if !self.link.send(bytes, Some(seq)).await? {
                    stats.dropped += 1;
                }
                stats.data_sends += 1;
            }

            stats.readings_sent += 1;
            seq = seq.wrapping_add(1);
            stats.next_seq = seq;

            if !scope.pause_until(tick + self.interval).await {
                break;
            }
        }

        Ok(stats)
    }
}
