//! Transcript stabilization pipeline
//!
//! Per utterance the pipeline remembers only the last interim hypothesis.
//! Interims are published as display-only updates; a final batch or a
//! provider terminal signal produces the single [`StableTranscript`].
//! Nothing here returns an error: malformed or empty input simply emits
//! nothing.

use crate::events::{EventBus, VoiceEvent};

use super::{Alternative, Corrections, Deduplicator, Hypothesis, HypothesisBatch, StableTranscript};

/// Confidence given to a promoted interim that carried none
pub const DEFAULT_PROMOTION_CONFIDENCE: f32 = 0.8;

/// Stabilizes provider hypotheses into final transcripts
#[derive(Debug)]
pub struct TranscriptPipeline {
    bus: EventBus,
    corrections: Corrections,
    dedup: Deduplicator,
    promotion_confidence: f32,
    last_interim: Option<Hypothesis>,
}

impl TranscriptPipeline {
    /// Create a pipeline publishing to `bus`
    #[must_use]
    pub fn new(bus: EventBus, corrections: Corrections, dedup: Deduplicator) -> Self {
        Self {
            bus,
            corrections,
            dedup,
            promotion_confidence: DEFAULT_PROMOTION_CONFIDENCE,
            last_interim: None,
        }
    }

    /// Override the confidence used when promoting an interim without one
    #[must_use]
    pub const fn with_promotion_confidence(mut self, confidence: f32) -> Self {
        self.promotion_confidence = confidence;
        self
    }

    /// Last interim hypothesis of the current utterance
    #[must_use]
    pub const fn last_interim(&self) -> Option<&Hypothesis> {
        self.last_interim.as_ref()
    }

    /// Route a batch to the interim or final path
    pub fn process(&mut self, batch: &HypothesisBatch) -> Option<StableTranscript> {
        if batch.is_final() {
            self.process_final(batch)
        } else {
            self.process_interim(batch);
            None
        }
    }

    /// Correct and remember the top interim hypothesis, publishing it for display
    pub fn process_interim(&mut self, batch: &HypothesisBatch) {
        let Some(top) = batch.top() else {
            tracing::trace!("ignoring empty interim batch");
            return;
        };

        let text = self.corrections.apply(&top.text);
        if text.is_empty() {
            return;
        }

        let confidence = top.clamped_confidence();
        self.bus.publish(VoiceEvent::interim(
            &text,
            confidence.unwrap_or(self.promotion_confidence),
        ));
        self.last_interim = Some(Hypothesis::interim(text, confidence));
    }

    /// Emit one stable transcript from the final hypotheses of `batch`
    ///
    /// Returns the transcript when it was emitted, `None` when the batch had
    /// no usable final hypothesis or it was a re-reported duplicate.
    pub fn process_final(&mut self, batch: &HypothesisBatch) -> Option<StableTranscript> {
        let alternatives: Vec<Alternative> = batch
            .hypotheses
            .iter()
            .filter(|h| h.is_final)
            .map(|h| Alternative {
                text: self.corrections.apply(&h.text),
                confidence: h.clamped_confidence().unwrap_or(0.0),
            })
            .collect();

        if alternatives.is_empty() {
            tracing::trace!("batch has no final hypothesis");
            return None;
        }

        let transcript = StableTranscript::from_alternatives(alternatives)?;
        self.last_interim = None;
        self.emit(transcript)
    }

    /// Promote the trailing interim to a final after a terminal signal
    ///
    /// Emits nothing when no interim is pending.
    pub fn promote_interim_to_final(&mut self) -> Option<StableTranscript> {
        let interim = self.last_interim.take()?;
        let confidence = interim
            .clamped_confidence()
            .unwrap_or(self.promotion_confidence);

        tracing::debug!(text = %interim.text, confidence, "promoting trailing interim");

        let transcript = StableTranscript::from_alternatives(vec![Alternative {
            text: interim.text,
            confidence,
        }])?;
        self.emit(transcript)
    }

    /// Drop any pending interim without emitting it
    pub fn reset_utterance(&mut self) {
        self.last_interim = None;
    }

    fn emit(&mut self, transcript: StableTranscript) -> Option<StableTranscript> {
        if !self.dedup.admit(&transcript.text) {
            tracing::debug!(text = %transcript.text, "suppressed duplicate final");
            return None;
        }

        tracing::info!(
            text = %transcript.text,
            alternatives = transcript.alternatives.len(),
            "stable transcript"
        );
        self.bus.publish(VoiceEvent::stable(&transcript));
        Some(transcript)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::broadcast::Receiver;

    use super::*;
    use crate::transcript::DEFAULT_DEDUP_WINDOW;

    fn pipeline() -> (TranscriptPipeline, Receiver<VoiceEvent>) {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let pipeline = TranscriptPipeline::new(
            bus,
            Corrections::default(),
            Deduplicator::new(DEFAULT_DEDUP_WINDOW),
        );
        (pipeline, rx)
    }

    fn drain(rx: &mut Receiver<VoiceEvent>) -> Vec<VoiceEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn finals(events: &[VoiceEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                VoiceEvent::Transcript {
                    text,
                    is_final: true,
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn interim_then_terminal_yields_one_final() {
        let (mut p, mut rx) = pipeline();

        p.process(&HypothesisBatch::from_alternatives(false, [("학교", Some(0.4))]));
        let promoted = p.promote_interim_to_final().unwrap();

        assert_eq!(promoted.text, "학교");
        assert!((promoted.alternatives[0].confidence - 0.4).abs() < f32::EPSILON);
        assert_eq!(finals(&drain(&mut rx)), ["학교"]);
        assert!(p.promote_interim_to_final().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn interim_is_display_only() {
        let (mut p, mut rx) = pipeline();
        p.process_interim(&HypothesisBatch::from_alternatives(false, [("다음", None)]));

        let events = drain(&mut rx);
        assert!(finals(&events).is_empty());
        assert!(matches!(
            &events[0],
            VoiceEvent::Transcript { text, is_final: false, .. } if text == "다음"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn promotion_defaults_missing_confidence() {
        let (mut p, _rx) = pipeline();
        p.process_interim(&HypothesisBatch::from_alternatives(false, [("반복", None)]));
        let t = p.promote_interim_to_final().unwrap();
        assert!((t.alternatives[0].confidence - DEFAULT_PROMOTION_CONFIDENCE).abs() < f32::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn final_clears_pending_interim() {
        let (mut p, mut rx) = pipeline();
        p.process(&HypothesisBatch::from_alternatives(false, [("홈으", Some(0.3))]));
        p.process(&HypothesisBatch::from_alternatives(true, [("홈으로", Some(0.9))]));

        assert!(p.last_interim().is_none());
        assert!(p.promote_interim_to_final().is_none());
        assert_eq!(finals(&drain(&mut rx)), ["홈으로"]);
    }

    #[tokio::test(start_paused = true)]
    async fn final_ranks_alternatives() {
        let (mut p, _rx) = pipeline();
        let t = p
            .process_final(&HypothesisBatch::from_alternatives(
                true,
                [("서울", Some(0.3)), ("소울", Some(0.9))],
            ))
            .unwrap();
        assert_eq!(t.alternatives[0].text, "소울");
    }

    #[tokio::test(start_paused = true)]
    async fn corrections_apply_to_interim_and_final() {
        let (mut p, _rx) = pipeline();
        p.process_interim(&HypothesisBatch::from_alternatives(false, [("자무", Some(0.5))]));
        assert_eq!(p.last_interim().unwrap().text, "자모");

        let t = p
            .process_final(&HypothesisBatch::from_alternatives(
                true,
                [("암호", Some(0.6)), ("단어", Some(0.5))],
            ))
            .unwrap();
        assert_eq!(t.texts().collect::<Vec<_>>(), ["단어", "단어"]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_finals_inside_window_are_suppressed() {
        let (mut p, mut rx) = pipeline();
        let batch = HypothesisBatch::from_alternatives(true, [("안녕", Some(0.9))]);

        assert!(p.process(&batch).is_some());
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(p.process(&batch).is_none());
        assert_eq!(finals(&drain(&mut rx)), ["안녕"]);

        tokio::time::advance(Duration::from_millis(2000)).await;
        assert!(p.process(&batch).is_some());
        assert_eq!(finals(&drain(&mut rx)), ["안녕"]);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_batches_emit_nothing() {
        let (mut p, mut rx) = pipeline();
        p.process(&HypothesisBatch::default());
        p.process(&HypothesisBatch::from_alternatives(false, [("   ", Some(0.9))]));
        assert!(p.process(&HypothesisBatch::from_alternatives(true, [("", None)])).is_none());
        assert!(p.promote_interim_to_final().is_none());
        assert!(drain(&mut rx).is_empty());
    }
}
