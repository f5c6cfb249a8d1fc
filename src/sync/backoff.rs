use std::time::Duration;

/// Exponential delay between re-attempts of a failing action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
  pub initial: Duration,
  pub max: Duration,
}

impl Default for Backoff {
  fn default() -> Self {
    Self {
      initial: Duration::from_secs(1),
      max: Duration::from_secs(60),
    }
  }
}

impl Backoff {
  pub fn new(initial: Duration, max: Duration) -> Self {
    Self { initial, max }
  }

  /// Delay after the `attempt`-th consecutive retryable failure (1-based):
  /// `initial * 2^(attempt - 1)`, capped at `max`.
  pub fn delay(&self, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    self
      .initial
      .checked_mul(factor)
      .map_or(self.max, |delay| delay.min(self.max))
  }
}
