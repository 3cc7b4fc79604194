use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::error::ConfigError;

pub const DEFAULT_REORDER_PROBABILITY: f64 = 0.3;

/// Network pathologies applied to outbound datagrams before they reach the socket.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpairmentConfig {
    pub enabled: bool,
    pub loss_probability: f64,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
    /// Chance that a delayed packet gets an extra `uniform(0, 2 * base)` push, which is what
    /// actually reorders it relative to its neighbours.
    pub reorder_probability: f64,
}

impl Default for ImpairmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            loss_probability: 0.0,
            base_delay_ms: 0,
            jitter_ms: 0,
            reorder_probability: DEFAULT_REORDER_PROBABILITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Impairment {
    Drop,
    SendNow,
    Delay(Duration),
}

impl ImpairmentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("loss_probability", self.loss_probability),
            ("reorder_probability", self.reorder_probability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ProbabilityOutOfRange { name, value });
            }
        }
        Ok(())
    }

    pub fn simulates_delay(&self) -> bool {
        self.enabled && (self.base_delay_ms > 0 || self.jitter_ms > 0)
    }

    pub fn should_drop<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        if !self.enabled || self.loss_probability <= 0.0 {
            return false;
        }
        rng.gen_range(0.0..1.0) < self.loss_probability
    }

    pub fn delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let base = self.base_delay_ms as f64;
        let jitter = self.jitter_ms as f64;

        let mut delay_ms = base;
        if jitter > 0.0 {
            delay_ms += rng.gen_range(-jitter..=jitter);
        }
        if base > 0.0 && rng.gen_bool(self.reorder_probability) {
            delay_ms += rng.gen_range(0.0..=2.0 * base);
        }

        Duration::from_secs_f64(delay_ms.max(0.0) / 1000.0)
    }

    pub fn decide<R: Rng + ?Sized>(&self, rng: &mut R) -> Impairment {
        if self.should_drop(rng) {
            Impairment::Drop
        } else if !self.simulates_delay() {
            Impairment::SendNow
        } else {
            Impairment::Delay(self.delay(rng))
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointStats {
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub malformed: u64,
    pub replies_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn lossy(loss_probability: f64) -> ImpairmentConfig {
        ImpairmentConfig {
            enabled: true,
            loss_probability,
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_never_drops_or_delays() {
        let config = ImpairmentConfig {
            enabled: false,
            loss_probability: 1.0,
            base_delay_ms: 100,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);

        for _ in 0..100 {
            assert_eq!(config.decide(&mut rng), Impairment::SendNow);
        }
    }

    #[test]
    fn test_full_loss_drops_everything() {
        let config = lossy(1.0);
        let mut rng = StdRng::seed_from_u64(2);
        assert!((0..1000).all(|_| config.decide(&mut rng) == Impairment::Drop));
    }

    #[test]
    fn test_loss_rate_is_roughly_honoured() {
        let config = lossy(0.25);
        let mut rng = StdRng::seed_from_u64(3);
        let dropped = (0..10_000).filter(|_| config.should_drop(&mut rng)).count();
        assert!((2_000..3_000).contains(&dropped), "dropped {dropped}");
    }

    #[test]
    fn test_delay_stays_within_bounds() {
        let config = ImpairmentConfig {
            enabled: true,
            base_delay_ms: 50,
            jitter_ms: 20,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(4);

        for _ in 0..1000 {
            let delay = config.delay(&mut rng);
            // base - jitter .. base + jitter + 2 * base
            assert!(delay >= Duration::from_millis(29), "{delay:?}");
            assert!(delay <= Duration::from_millis(171), "{delay:?}");
        }
    }

    #[test]
    fn test_jitter_larger_than_base_clamps_to_zero() {
        let config = ImpairmentConfig {
            enabled: true,
            base_delay_ms: 0,
            jitter_ms: 30,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        let zeros = (0..1000)
            .filter(|_| config.delay(&mut rng) == Duration::ZERO)
            .count();
        assert!(zeros > 0);
    }

    #[test]
    fn test_validate_rejects_bad_probabilities() {
        assert!(lossy(0.5).validate().is_ok());
        assert_eq!(
            lossy(1.5).validate(),
            Err(ConfigError::ProbabilityOutOfRange {
                name: "loss_probability",
                value: 1.5
            })
        );
    }
}
