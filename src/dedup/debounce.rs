//! Debounce for user-triggered stop and interrupt actions

use std::time::Duration;

use tokio::time::Instant;

/// Accepts an action at most once per window
///
/// Only accepted actions move the window; rejected ones don't extend it.
#[derive(Debug)]
pub struct Debounce {
    window: Duration,
    last_fired: Option<Instant>,
}

impl Debounce {
    /// Create a debounce with the given window
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: None,
        }
    }

    /// Try to fire the action now
    ///
    /// Returns `false` if an accepted action happened less than one window ago.
    pub fn try_fire(&mut self) -> bool {
        let now = Instant::now();

        if let Some(last) = self.last_fired
            && now.duration_since(last) < self.window
        {
            return false;
        }

        self.last_fired = Some(now);
        true
    }

    /// Record an action that bypassed the debounce check
    pub fn mark(&mut self) {
        self.last_fired = Some(Instant::now());
    }

    /// Forget the last accepted action
    pub fn reset(&mut self) {
        self.last_fired = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_second_fire_within_window_rejected() {
        let mut debounce = Debounce::new(Duration::from_secs(1));

        assert!(debounce.try_fire());
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(!debounce.try_fire());

        // Rejected fire didn't extend the window
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(debounce.try_fire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_and_reset() {
        let mut debounce = Debounce::new(Duration::from_secs(1));

        debounce.mark();
        assert!(!debounce.try_fire());

        debounce.reset();
        assert!(debounce.try_fire());
    }
}
