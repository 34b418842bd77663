//! Transcript stabilization
//!
//! Turns the noisy, incremental output of a recognition provider into at most
//! one stable final transcript per utterance.

mod corrections;
mod dedup;
mod pipeline;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use corrections::{Corrections, DEFAULT_CORRECTIONS};
pub use dedup::{DEFAULT_DEDUP_WINDOW, Deduplicator};
pub use pipeline::{DEFAULT_PROMOTION_CONFIDENCE, TranscriptPipeline};

/// One candidate transcription of part or all of an utterance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Candidate text
    pub text: String,
    /// Confidence in `0..=1`, if the backend reported one
    pub confidence: Option<f32>,
    /// Whether the backend will not revise this hypothesis further
    pub is_final: bool,
}

impl Hypothesis {
    /// Create an interim hypothesis
    #[must_use]
    pub fn interim(text: impl Into<String>, confidence: Option<f32>) -> Self {
        Self {
            text: text.into(),
            confidence,
            is_final: false,
        }
    }

    /// Create a final hypothesis
    #[must_use]
    pub fn final_(text: impl Into<String>, confidence: Option<f32>) -> Self {
        Self {
            text: text.into(),
            confidence,
            is_final: true,
        }
    }

    /// Confidence clamped to `0..=1`; missing or NaN becomes `None`
    #[must_use]
    pub fn clamped_confidence(&self) -> Option<f32> {
        self.confidence
            .filter(|c| !c.is_nan())
            .map(|c| c.clamp(0.0, 1.0))
    }
}

/// Hypotheses for one recognition increment, best guess first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HypothesisBatch {
    /// Hypotheses in provider rank order
    pub hypotheses: Vec<Hypothesis>,
}

impl HypothesisBatch {
    /// Create a batch from ranked hypotheses
    #[must_use]
    pub const fn new(hypotheses: Vec<Hypothesis>) -> Self {
        Self { hypotheses }
    }

    /// Build a batch where every hypothesis shares the same finality
    #[must_use]
    pub fn from_alternatives<I, S>(is_final: bool, alternatives: I) -> Self
    where
        I: IntoIterator<Item = (S, Option<f32>)>,
        S: Into<String>,
    {
        Self {
            hypotheses: alternatives
                .into_iter()
                .map(|(text, confidence)| Hypothesis {
                    text: text.into(),
                    confidence,
                    is_final,
                })
                .collect(),
        }
    }

    /// Whether any hypothesis is marked final
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.hypotheses.iter().any(|h| h.is_final)
    }

    /// Provider's best guess
    #[must_use]
    pub fn top(&self) -> Option<&Hypothesis> {
        self.hypotheses.first()
    }

    /// Whether the batch carries no hypotheses
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hypotheses.is_empty()
    }
}

/// A ranked alternative of a stable transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    /// Alternative text
    pub text: String,
    /// Confidence in `0..=1`
    pub confidence: f32,
}

/// The pipeline's sole output: one completed utterance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StableTranscript {
    /// Best text (first alternative)
    pub text: String,
    /// Alternatives, confidence descending, ties in provider order
    pub alternatives: Vec<Alternative>,
    /// When the transcript was stabilized
    pub timestamp: DateTime<Utc>,
}

impl StableTranscript {
    /// Build from alternatives, ranking them by confidence
    ///
    /// Returns `None` when there is no non-empty alternative.
    #[must_use]
    pub fn from_alternatives(mut alternatives: Vec<Alternative>) -> Option<Self> {
        alternatives.retain(|a| !a.text.is_empty());
        // Stable sort keeps provider order for equal confidence
        alternatives.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let text = alternatives.first()?.text.clone();

        Some(Self {
            text,
            alternatives,
            timestamp: Utc::now(),
        })
    }

    /// Iterate over every alternative text, best first
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.alternatives.iter().map(|a| a.text.as_str())
    }
}
