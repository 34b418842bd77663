//! Command matching on stable transcripts
//!
//! The coordinator never interprets what was said. Applications plug an
//! [`IntentMatcher`] in through [`spawn_intent_listener`], which watches the
//! bus for final transcripts.

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::events::{EventBus, VoiceEvent};
use crate::transcript::StableTranscript;

/// Decides whether a transcript is a known command
pub trait IntentMatcher: Send + Sync + 'static {
    /// Whether any alternative of `transcript` matches
    fn matches(&self, transcript: &StableTranscript) -> bool;
}

/// Case-insensitive substring match over every alternative
#[derive(Debug, Clone, Default)]
pub struct KeywordMatcher {
    keywords: Vec<String>,
}

impl KeywordMatcher {
    /// Match any of `keywords`; blank keywords are ignored
    #[must_use]
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keywords }
    }
}

impl IntentMatcher for KeywordMatcher {
    fn matches(&self, transcript: &StableTranscript) -> bool {
        transcript.texts().any(|text| {
            let text = text.to_lowercase();
            self.keywords.iter().any(|k| text.contains(k.as_str()))
        })
    }
}

/// Forward matching final transcripts from `bus`
///
/// Interim transcripts are ignored. The task ends when the bus closes or the
/// returned receiver is dropped.
pub fn spawn_intent_listener<M: IntentMatcher>(
    bus: &EventBus,
    matcher: M,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<StableTranscript>) {
    let mut events = bus.subscribe();
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "intent listener lagged behind the bus");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let VoiceEvent::Transcript {
                alternatives,
                is_final: true,
                ..
            } = event
            else {
                continue;
            };
            let Some(transcript) = StableTranscript::from_alternatives(alternatives) else {
                continue;
            };

            if !matcher.matches(&transcript) {
                tracing::debug!(text = %transcript.text, "no intent matched");
                continue;
            }
            if tx.send(transcript).is_err() {
                break;
            }
        }
        tracing::trace!("intent listener finished");
    });

    (handle, rx)
}
