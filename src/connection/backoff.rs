//! Accept Loop Backoff

use std::time::Duration;

/// Bounded exponential delay applied after consecutive failed accepts.
///
/// Starts at `initial`, doubles on every failure, never exceeds `max`, and
/// returns to `initial` after a successful accept.
#[derive(Debug, Clone)]
pub(crate) struct AcceptBackoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl AcceptBackoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: None,
        }
    }

    /// Delay to wait after another failure
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(previous) => previous.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}
