use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout_at};

use super::RunScope;
use super::link::Link;
use crate::error::{ConfigError, TransportError};

/// Per-attempt ACK timeouts for danger readings: `initial`, doubling up to `max_timeout`, for at
/// most `max_attempts` sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("retry max_attempts"));
        }
        if self.initial_timeout.is_zero() {
            return Err(ConfigError::Zero("retry initial_timeout"));
        }
        if self.initial_timeout > self.max_timeout {
            return Err(ConfigError::BackoffInverted {
                initial_ms: self.initial_timeout.as_millis(),
                cap_ms: self.max_timeout.as_millis(),
            });
        }
        Ok(())
    }

    pub fn timeout_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_timeout
            .saturating_mul(factor)
            .min(self.max_timeout)
    }

    pub fn timeouts(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map(|attempt| self.timeout_for(attempt))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// `rtt` is only sampled when the first send was the one acknowledged.
    Acked { attempts: u32, rtt: Option<Duration> },
    Exhausted { attempts: u32 },
    Interrupted { attempts: u32 },
}

impl AckOutcome {
    pub fn attempts(&self) -> u32 {
        match *self {
            AckOutcome::Acked { attempts, .. }
            | AckOutcome::Exhausted { attempts }
            | AckOutcome::Interrupted { attempts } => attempts,
        }
    }
}

/// Smoothed round-trip estimate for acknowledged danger readings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RttEstimator {
    srtt_ms: Option<f64>,
    rtt_var_ms: f64,
    samples: u64,
}

impl RttEstimator {
    const ALPHA: f64 = 0.125;
    const BETA: f64 = 0.25;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sample: Duration) {
        let rtt = sample.as_secs_f64() * 1000.0;
        self.samples += 1;

        match self.srtt_ms {
            None => {
                self.srtt_ms = Some(rtt);
                self.rtt_var_ms = rtt / 2.0;
            }
            Some(srtt) => {
                let diff = (rtt - srtt).abs();
                self.rtt_var_ms = (1.0 - Self::BETA) * self.rtt_var_ms + Self::BETA * diff;
                self.srtt_ms = Some((1.0 - Self::ALPHA) * srtt + Self::ALPHA * rtt);
            }
        }
    }

    pub fn srtt_ms(&self) -> Option<f64> {
        self.srtt_ms
    }

    pub fn rtt_var_ms(&self) -> f64 {
        self.rtt_var_ms
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Sends `bytes` and waits for an ACK carrying `seq`, resending the identical datagram after each
/// timeout until the policy runs out.
pub(crate) async fn send_reliable(
    link: &Link,
    bytes: &[u8],
    seq: u32,
    policy: &RetryPolicy,
    acks: &mut mpsc::Receiver<u32>,
    scope: &RunScope,
) -> Result<AckOutcome, TransportError> {
    // ACKs still queued belong to earlier readings.
    while acks.try_recv().is_ok() {}

    let mut attempts = 0;
    for wait in policy.timeouts() {
        attempts += 1;
        let sent_at = Instant::now();
        link.send(bytes.to_vec(), Some(seq)).await?;

        tokio::select! {
            acked = wait_for_ack(acks, seq, sent_at + wait) => {
                if acked {
                    let rtt = (attempts == 1).then(|| sent_at.elapsed());
                    return Ok(AckOutcome::Acked { attempts, rtt });
                }
                if attempts < policy.max_attempts {
                    log::info!(
                        "device {} seq {}: no ACK within {:?}, resending",
                        link.device_id(),
                        seq,
                        wait
                    );
                }
            }
            _ = scope.stopped() => return Ok(AckOutcome::Interrupted { attempts }),
        }
    }

    Ok(AckOutcome::Exhausted { attempts })
}

/// ACKs for other sequences are skipped without moving the deadline.
async fn wait_for_ack(acks: &mut mpsc::Receiver<u32>, seq: u32, deadline: Instant) -> bool {
    loop {
        match timeout_at(deadline, acks.recv()).await {
            Ok(Some(acked)) if acked == seq => return true,
            Ok(Some(other)) => {
                log::debug!("ignoring ACK {} while waiting for {}", other, seq);
            }
            Ok(None) => {
                sleep_until(deadline).await;
                return false;
            }
            Err(_) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_schedule() {
        let timeouts: Vec<_> = RetryPolicy::default()
            .timeouts()
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(timeouts, vec![1, 2, 4, 4, 4]);
        assert_eq!(
            RetryPolicy::default().timeouts().sum::<Duration>(),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn test_huge_attempt_index_saturates_at_cap() {
        let policy = RetryPolicy {
            max_attempts: 64,
            ..Default::default()
        };
        assert_eq!(policy.timeout_for(40), Duration::from_secs(4));
    }

    #[test]
    fn test_validation() {
        assert!(RetryPolicy::default().validate().is_ok());

        let inverted = RetryPolicy {
            initial_timeout: Duration::from_secs(8),
            ..Default::default()
        };
        assert_eq!(
            inverted.validate(),
            Err(ConfigError::BackoffInverted {
                initial_ms: 8000,
                cap_ms: 4000
            })
        );

        let none = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(none.validate().is_err());
    }

    #[test]
    fn test_rtt_smoothing() {
        let mut rtt = RttEstimator::new();
        assert_eq!(rtt.srtt_ms(), None);

        rtt.update(Duration::from_millis(80));
        assert_eq!(rtt.srtt_ms(), Some(80.0));

        rtt.update(Duration::from_millis(160));
        let srtt = rtt.srtt_ms().unwrap();
        assert!((srtt - 90.0).abs() < 1e-9);
        assert_eq!(rtt.samples(), 2);
    }

    #[tokio::test]
    async fn test_wait_skips_other_sequences() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(3).await.unwrap();
        tx.send(7).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(200);
        assert!(wait_for_ack(&mut rx, 7, deadline).await);
    }

    #[tokio::test]
    async fn test_wait_times_out_on_wrong_sequence() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(3).await.unwrap();

        let started = Instant::now();
        assert!(!wait_for_ack(&mut rx, 7, started + Duration::from_millis(50)).await);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
