use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};

use super::RunScope;
use super::link::Link;
use crate::error::{ConfigError, TransportError};
use crate::net::heartbeat_packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pub warm_up: Duration,
    pub period: Duration,
    pub reply_timeout: Duration,
    /// Consecutive unanswered heartbeats that declare the collector gone.
    pub miss_threshold: u32,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            warm_up: Duration::from_secs(5),
            period: Duration::from_secs(30),
            reply_timeout: Duration::from_secs(5),
            miss_threshold: 3,
        }
    }
}

impl HeartbeatPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period.is_zero() {
            return Err(ConfigError::Zero("heartbeat period"));
        }
        if self.reply_timeout.is_zero() {
            return Err(ConfigError::Zero("heartbeat reply_timeout"));
        }
        if self.miss_threshold == 0 {
            return Err(ConfigError::Zero("heartbeat miss_threshold"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub sent: u64,
    pub answered: u64,
    pub missed: u64,
    /// This duty was the one that took the process-wide liveness flag down.
    pub tripped_liveness: bool,
}

pub(crate) async fn heartbeat_duty(
    link: Link,
    policy: HeartbeatPolicy,
    mut alive: mpsc::Receiver<()>,
    scope: RunScope,
) -> Result<HeartbeatStats, TransportError> {
    let mut stats = HeartbeatStats::default();
    if !scope.pause(policy.warm_up).await {
        return Ok(stats);
    }

    let device_id = link.device_id();
    let mut consecutive_misses = 0;

    loop {
        // ALIVEs that showed up after an earlier timeout must not answer this heartbeat.
        while alive.try_recv().is_ok() {}

        let sent_at = Instant::now();
        link.send(heartbeat_packet(device_id).to_vec(), None).await?;
        stats.sent += 1;
        log::info!("device {} sent HEARTBEAT", device_id);

        let answered = tokio::select! {
            reply = timeout(policy.reply_timeout, alive.recv()) => matches!(reply, Ok(Some(()))),
            _ = scope.stopped() => return Ok(stats),
        };

        if answered {
            consecutive_misses = 0;
            stats.answered += 1;
            log::debug!("device {} got ALIVE", device_id);
        } else {
            consecutive_misses += 1;
            stats.missed += 1;
            log::warn!(
                "device {} missed heartbeat reply ({}/{})",
                device_id,
                consecutive_misses,
                policy.miss_threshold
            );

            if consecutive_misses >= policy.miss_threshold {
                if scope.liveness().trip() {
                    stats.tripped_liveness = true;
                    log::error!(
                        "device {}: collector silent for {} heartbeats, stopping all sessions",
                        device_id,
                        consecutive_misses
                    );
                }
                return Ok(stats);
            }
        }

        if !scope.pause_until(sent_at + policy.period).await {
            return Ok(stats);
        }
    }
}
