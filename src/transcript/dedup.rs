//! Repeated-final suppression

use std::time::Duration;

use tokio::time::Instant;

/// Default window within which an identical final is a re-report
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_millis(1000);

/// Suppresses a final transcript equal to the immediately preceding one
///
/// Continuous-mode backends tend to re-report the same final utterance. Only
/// the last admitted text is remembered, so `A, B, A` admits all three.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    window: Duration,
    last: Option<(String, Instant)>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl Deduplicator {
    /// Create a deduplicator with the given window
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Record `text` and return whether it should be emitted
    ///
    /// Returns `false` for a duplicate of the previous text inside the window.
    pub fn admit(&mut self, text: &str) -> bool {
        let now = Instant::now();

        if let Some((last, at)) = &self.last
            && last == text
            && now.duration_since(*at) < self.window
        {
            return false;
        }

        self.last = Some((text.to_string(), now));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn suppresses_repeat_inside_window() {
        let mut dedup = Deduplicator::default();
        assert!(dedup.admit("안녕"));
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(!dedup.admit("안녕"));
    }

    #[tokio::test(start_paused = true)]
    async fn admits_repeat_after_window() {
        let mut dedup = Deduplicator::default();
        assert!(dedup.admit("안녕"));
        tokio::time::advance(Duration::from_millis(2000)).await;
        assert!(dedup.admit("안녕"));
    }

    #[tokio::test(start_paused = true)]
    async fn different_text_is_never_suppressed() {
        let mut dedup = Deduplicator::default();
        assert!(dedup.admit("안녕"));
        assert!(dedup.admit("다음"));
        assert!(dedup.admit("안녕"));
    }

    #[tokio::test(start_paused = true)]
    async fn suppressed_repeat_does_not_extend_window() {
        let mut dedup = Deduplicator::default();
        assert!(dedup.admit("안녕"));
        tokio::time::advance(Duration::from_millis(700)).await;
        assert!(!dedup.admit("안녕"));
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(dedup.admit("안녕"));
    }
}
