//! Exponential backoff for transient remote failures.

use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_millis(250);
const MAX_DELAY: Duration = Duration::from_secs(5 * 60);

/// Monotonic exponential delay generator.
///
/// The first call after a reset yields zero (retry immediately); each
/// subsequent call doubles, capped at five minutes. The generator never
/// reads a clock; the caller decides when and how to sleep.
#[derive(Debug, Default)]
pub struct Backoff {
    attempts: u32,
}

impl Backoff {
    /// A fresh generator at zero attempts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = if self.attempts == 0 {
            Duration::ZERO
        } else {
            // 2^(attempts-1) * base, saturating well past the cap.
            let exponent = (self.attempts - 1).min(20);
            let factor = 1u64 << exponent;
            MAX_DELAY.min(BASE_DELAY * u32::try_from(factor).unwrap_or(u32::MAX))
        };
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Forgets all failures; the next delay is zero again.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
