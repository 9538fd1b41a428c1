//! Timing replay configuration and jitter math.
//!
//! Jitter is a bounded multiplicative perturbation applied once per request.
//! The functions are generic over the random source so tests can drive them
//! with a seeded generator.

use rand::Rng;

#[derive(Debug, Clone, Copy, Default)]
pub struct TimingConfig {
    /// Replay recorded latency (non-SSE delay sleep, SSE per-event timing).
    pub replay_timing: bool,
    /// Jitter fraction in `[0, 1]`; `0.1` means ±10%.
    pub jitter: f64,
}

/// Effective sleep for a non-SSE response: `delay × (1 + j·U[-1,1])`,
/// clamped to non-negative.
pub fn jittered_delay<R: Rng>(delay: f64, jitter: f64, rng: &mut R) -> f64 {
    if jitter <= 0.0 {
        return delay;
    }
    let amount = (rng.gen::<f64>() * 2.0 - 1.0) * jitter * delay;
    (delay + amount).max(0.0)
}

/// Per-request scale for SSE event offsets: `1 + j·U[-1,1]`, clamped to
/// non-negative.
pub fn jitter_scale<R: Rng>(jitter: f64, rng: &mut R) -> f64 {
    if jitter <= 0.0 {
        return 1.0;
    }
    let amount = (rng.gen::<f64>() * 2.0 - 1.0) * jitter;
    (1.0 + amount).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let delay = jittered_delay(0.1, 0.1, &mut rng);
            assert!((0.09..=0.11).contains(&delay), "delay {delay}");
        }
    }

    #[test]
    fn jitter_scale_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let scale = jitter_scale(0.05, &mut rng);
            assert!((0.95..=1.05).contains(&scale), "scale {scale}");
        }
    }

    #[test]
    fn zero_jitter_is_identity() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(jittered_delay(0.25, 0.0, &mut rng), 0.25);
        assert_eq!(jitter_scale(0.0, &mut rng), 1.0);
    }

    #[test]
    fn large_jitter_never_goes_negative() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert!(jittered_delay(0.01, 1.0, &mut rng) >= 0.0);
            assert!(jitter_scale(1.0, &mut rng) >= 0.0);
        }
    }
}
