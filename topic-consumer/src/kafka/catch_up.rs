//! Topic-wide catch-up signalling.
//!
//! A [`CaughtUpSignal`] is a countdown shared between the coordinator, which counts it up by
//! one per partition, and the partition loops, which each count it down exactly once
//! through a [`CatchUpToken`]. Waiters resolve once the count is back at zero.

use std::sync::Arc;

use tokio::sync::watch;

/// Countdown that resolves when every registered partition has caught up.
///
/// Clones share the same count. A fresh signal has nothing registered, so waiting on it
/// returns immediately.
#[derive(Debug, Clone)]
pub struct CaughtUpSignal {
    // The remaining count lives inside the watch channel so that updates and waiter
    // wake-ups happen under the same lock.
    remaining: Arc<watch::Sender<usize>>,
}

impl Default for CaughtUpSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CaughtUpSignal {
    pub fn new() -> Self {
        let (remaining, _) = watch::channel(0);
        Self {
            remaining: Arc::new(remaining),
        }
    }

    /// Number of partitions that have not caught up yet
    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    pub fn is_caught_up(&self) -> bool {
        self.remaining() == 0
    }

    /// Wait until every registered partition has caught up
    pub async fn wait(&self) {
        let mut rx = self.remaining.subscribe();
        // The sender is owned by self, so the channel cannot close while we wait
        if rx.wait_for(|remaining| *remaining == 0).await.is_err() {
            tracing::debug!("caught-up signal dropped while waiting");
        }
    }

    /// Register `count` partitions and hand out one token per partition
    pub(crate) fn register(&self, count: usize) -> Vec<CatchUpToken> {
        self.remaining.send_modify(|remaining| *remaining += count);
        (0..count)
            .map(|_| CatchUpToken::attached(self.clone()))
            .collect()
    }

    fn count_down(&self) {
        self.remaining.send_modify(|remaining| {
            *remaining = remaining.saturating_sub(1);
        });
    }
}

/// One partition's share of a `CaughtUpSignal`. Releasing it counts the signal down; only
/// the first release has an effect, and an unreleased token releases itself on drop.
#[derive(Debug)]
pub struct CatchUpToken {
    signal: Option<CaughtUpSignal>,
    released: bool,
}

impl CatchUpToken {
    fn attached(signal: CaughtUpSignal) -> Self {
        Self {
            signal: Some(signal),
            released: false,
        }
    }

    /// Token for a partition whose caller did not ask for catch-up notification
    pub fn detached() -> Self {
        Self {
            signal: None,
            released: false,
        }
    }

    /// Returns true if this call performed the release
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        if let Some(signal) = self.signal.take() {
            signal.count_down();
        }
        true
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for CatchUpToken {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_fresh_signal_is_already_caught_up() {
        let signal = CaughtUpSignal::new();
        assert!(signal.is_caught_up());
        timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("empty signal should not block");
    }

    #[tokio::test]
    async fn test_wait_resolves_after_every_token_releases() {
        let signal = CaughtUpSignal::new();
        let mut tokens = signal.register(3);
        assert_eq!(signal.remaining(), 3);

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        tokens[0].release();
        tokens[1].release();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(signal.remaining(), 1);

        tokens[2].release();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
        assert!(signal.is_caught_up());
    }

    #[tokio::test]
    async fn test_token_releases_only_once() {
        let signal = CaughtUpSignal::new();
        let mut tokens = signal.register(2);

        assert!(tokens[0].release());
        assert!(!tokens[0].release());
        assert!(tokens[0].is_released());
        assert_eq!(signal.remaining(), 1);

        // Dropping an already released token must not count down again
        let released = tokens.remove(0);
        drop(released);
        assert_eq!(signal.remaining(), 1);
    }

    #[tokio::test]
    async fn test_dropped_token_releases_itself() {
        let signal = CaughtUpSignal::new();
        let tokens = signal.register(2);
        drop(tokens);
        assert!(signal.is_caught_up());
    }

    #[test]
    fn test_detached_token_tracks_release_without_signal() {
        let mut token = CatchUpToken::detached();
        assert!(!token.is_released());
        assert!(token.release());
        assert!(!token.release());
    }
}
