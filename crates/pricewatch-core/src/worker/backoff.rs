//! Delay schedule for idle polling and transient retries

use rand::Rng;
use std::time::Duration;

/// `base * 2^attempt`, capped at `max`
pub fn exponential(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(max)
}

/// Spread a delay by up to ±20% so idle workers do not poll in lockstep
pub fn jittered(delay: Duration) -> Duration {
    let spread = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(spread)
}
