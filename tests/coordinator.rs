//! Coordinator integration tests
//!
//! Drive the session state machine through a scripted recognizer and a fake
//! speech output; no audio hardware or network.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use voice_channel::breaker::CircuitBreaker;
use voice_channel::coordinator::CoordinatorOptions;
use voice_channel::provider::{LocalProvider, RemoteProvider};
use voice_channel::{
    Backend, Coordinator, Error, EventBus, Provider, SessionState, SpeakOutcome, StartOutcome, StopOutcome,
    VoiceEvent,
};

mod common;

use common::{CallLog, ChannelSource, FakeSpeech, Script, drain, local_coordinator, options, settle};

fn finals(events: &[VoiceEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            VoiceEvent::Transcript {
                text, is_final: true, ..
            } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn mic_changes(events: &[VoiceEvent]) -> Vec<bool> {
    events
        .iter()
        .filter_map(|e| match e {
            VoiceEvent::MicMode { active } => Some(*active),
            _ => None,
        })
        .collect()
}

fn error_codes(events: &[VoiceEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            VoiceEvent::Error { code, .. } => Some(code.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_listen_transcribe_stop() {
    let script = Script::new();
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options());
    let mut rx = coordinator.bus().subscribe();

    assert_eq!(coordinator.request_start().await.unwrap(), StartOutcome::Started);
    assert_eq!(coordinator.state().await, SessionState::Listening);

    script.final_(&[("자무 학습", 0.9)]);
    settle().await;

    assert_eq!(coordinator.request_stop().await, StopOutcome::Stopped);
    settle().await;

    let events = drain(&mut rx);
    assert_eq!(mic_changes(&events), [true, false]);
    assert_eq!(finals(&events), ["자모 학습"]);

    let diagnostics = coordinator.diagnostics().await;
    assert_eq!(diagnostics.state, SessionState::Idle);
    assert_eq!(diagnostics.sessions_started, 1);
    assert_eq!(diagnostics.terminals_observed, 1);
    assert!(!diagnostics.draining);
    assert_eq!(script.live(), 0);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let script = Script::new();
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options());
    let mut rx = coordinator.bus().subscribe();

    assert_eq!(coordinator.request_stop().await, StopOutcome::NotListening);

    coordinator.request_start().await.unwrap();
    assert_eq!(coordinator.request_stop().await, StopOutcome::Stopped);
    assert_eq!(coordinator.request_stop().await, StopOutcome::NotListening);
    settle().await;

    assert_eq!(mic_changes(&drain(&mut rx)), [true, false]);
    assert_eq!(coordinator.diagnostics().await.terminals_observed, 1);
}

#[tokio::test]
async fn test_start_while_listening_is_ignored() {
    let script = Script::new();
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options());

    coordinator.request_start().await.unwrap();
    assert_eq!(
        coordinator.request_start().await.unwrap(),
        StartOutcome::AlreadyListening
    );
    assert_eq!(script.starts(), 1);
    assert_eq!(script.max_live(), 1);
}

#[tokio::test]
async fn test_speech_stops_before_listening() {
    let log = CallLog::default();
    let script = Script::new();
    script.log_to(&log);
    let speech = FakeSpeech::logged(Duration::from_secs(60), &log);
    let coordinator = local_coordinator(&script, Arc::clone(&speech), options());

    assert_eq!(
        coordinator.speak(vec!["안녕하세요".into()]).await,
        SpeakOutcome::Speaking
    );
    settle().await;
    assert_eq!(coordinator.state().await, SessionState::Speaking);
    assert!(speech.is_speaking_now());

    assert_eq!(coordinator.request_start().await.unwrap(), StartOutcome::Started);
    settle().await;

    assert_eq!(speech.stops(), 1);
    assert_eq!(log.calls(), ["speech.stop", "recognizer.start"]);
    assert!(!speech.is_speaking_now());
    assert_eq!(coordinator.state().await, SessionState::Listening);
}

#[tokio::test]
async fn test_speech_refused_while_listening() {
    let script = Script::new();
    let speech = FakeSpeech::new(Duration::from_secs(1));
    let coordinator = local_coordinator(&script, Arc::clone(&speech), options());

    coordinator.request_start().await.unwrap();
    assert_eq!(coordinator.speak(vec!["테스트".into()]).await, SpeakOutcome::Refused);
    assert_eq!(coordinator.speak(vec!["  ".into()]).await, SpeakOutcome::Empty);
    settle().await;

    assert!(speech.spoken().is_empty());
    assert_eq!(coordinator.state().await, SessionState::Listening);
}

#[tokio::test]
async fn test_speech_queued_until_stopped_session_ends() {
    let script = Script::new();
    let speech = FakeSpeech::new(Duration::from_secs(60));
    let coordinator = local_coordinator(&script, Arc::clone(&speech), options());

    coordinator.request_start().await.unwrap();
    coordinator.request_stop().await;

    // The terminal signal of the stopped session has not been processed yet
    assert_eq!(
        coordinator.speak(vec!["다음 문장".into()]).await,
        SpeakOutcome::Queued
    );
    assert!(coordinator.diagnostics().await.speech_pending);

    settle().await;

    assert_eq!(speech.spoken(), [vec!["다음 문장".to_string()]]);
    let diagnostics = coordinator.diagnostics().await;
    assert_eq!(diagnostics.state, SessionState::Speaking);
    assert!(!diagnostics.draining);
    assert!(!diagnostics.speech_pending);
}

#[tokio::test]
async fn test_events_after_stop_are_discarded() {
    let script = Script::new();
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options());
    let mut rx = coordinator.bus().subscribe();

    coordinator.request_start().await.unwrap();
    script.final_(&[("늦은 결과", 0.9)]);
    coordinator.request_stop().await;
    settle().await;

    let events = drain(&mut rx);
    assert!(finals(&events).is_empty());
    assert!(error_codes(&events).is_empty());
    assert_eq!(coordinator.diagnostics().await.terminals_observed, 1);
}

#[tokio::test]
async fn test_provider_end_promotes_interim() {
    let script = Script::new();
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options());
    let mut rx = coordinator.bus().subscribe();

    coordinator.request_start().await.unwrap();
    script.interim("단어 연습");
    settle().await;
    script.end();
    settle().await;

    let events = drain(&mut rx);
    assert_eq!(finals(&events), ["단어 연습"]);
    assert_eq!(mic_changes(&events), [true, false]);
    assert_eq!(coordinator.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_critical_error_stops_and_is_surfaced() {
    let script = Script::new();
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options());
    let mut rx = coordinator.bus().subscribe();

    coordinator.request_start().await.unwrap();
    script.fail("network");
    settle().await;

    let events = drain(&mut rx);
    assert_eq!(error_codes(&events), ["network"]);
    assert_eq!(mic_changes(&events), [true, false]);

    let diagnostics = coordinator.diagnostics().await;
    assert_eq!(diagnostics.state, SessionState::Idle);
    assert_eq!(diagnostics.breaker.consecutive_failures, 1);
    assert_eq!(diagnostics.terminals_observed, 1);
}

#[tokio::test]
async fn test_benign_end_is_not_surfaced() {
    let script = Script::new();
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options());
    let mut rx = coordinator.bus().subscribe();

    coordinator.request_start().await.unwrap();
    script.fail("no-speech");
    settle().await;

    let events = drain(&mut rx);
    assert!(error_codes(&events).is_empty());
    assert_eq!(coordinator.state().await, SessionState::Idle);
    assert_eq!(coordinator.diagnostics().await.breaker.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_repeated_start_failures() {
    let script = Script::new();
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options());
    let mut rx = coordinator.bus().subscribe();

    script.fail_starts_with(Some("not-allowed"));
    for _ in 0..3 {
        let err = coordinator.request_start().await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }

    let err = coordinator.request_start().await.unwrap_err();
    assert!(err.is_breaker_open());
    assert_eq!(script.starts(), 3);

    let codes = error_codes(&drain(&mut rx));
    assert_eq!(codes, ["not-allowed", "not-allowed", "not-allowed", "breaker-open"]);
    assert_eq!(coordinator.state().await, SessionState::Idle);

    tokio::time::advance(Duration::from_secs(10)).await;
    script.fail_starts_with(None);

    assert_eq!(coordinator.request_start().await.unwrap(), StartOutcome::Started);
    // Acknowledged but not yet proven healthy
    assert_eq!(coordinator.diagnostics().await.breaker.consecutive_failures, 3);

    script.final_(&[("복구", 0.9)]);
    settle().await;
    assert_eq!(coordinator.diagnostics().await.breaker.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_when_sessions_fail_right_after_starting() {
    let script = Script::new();
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options());

    for attempt in 0..3 {
        assert_eq!(
            coordinator.request_start().await.unwrap(),
            StartOutcome::Started,
            "attempt {attempt}"
        );
        script.fail("network");
        settle().await;
        assert_eq!(coordinator.state().await, SessionState::Idle);
    }

    let err = coordinator.request_start().await.unwrap_err();
    assert!(err.is_breaker_open());
    assert_eq!(script.starts(), 3);

    // The probe after the cooldown re-opens on the same failure
    tokio::time::advance(Duration::from_secs(10)).await;
    coordinator.request_start().await.unwrap();
    script.fail("network");
    settle().await;
    assert!(coordinator.request_start().await.unwrap_err().is_breaker_open());
}

#[tokio::test]
async fn test_clean_session_end_resets_breaker() {
    let script = Script::new();
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options());

    coordinator.request_start().await.unwrap();
    script.fail("network");
    settle().await;
    assert_eq!(coordinator.diagnostics().await.breaker.consecutive_failures, 1);

    coordinator.request_start().await.unwrap();
    coordinator.request_stop().await;
    settle().await;
    assert_eq!(coordinator.diagnostics().await.breaker.consecutive_failures, 0);
}

#[tokio::test]
async fn test_benign_code_at_start_is_a_quiet_end() {
    let script = Script::new();
    script.fail_starts_with(Some("no-speech"));
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options());
    let mut rx = coordinator.bus().subscribe();

    assert_eq!(coordinator.request_start().await.unwrap(), StartOutcome::Started);
    settle().await;

    let events = drain(&mut rx);
    assert!(error_codes(&events).is_empty());
    assert_eq!(mic_changes(&events), [true, false]);

    let diagnostics = coordinator.diagnostics().await;
    assert_eq!(diagnostics.state, SessionState::Idle);
    assert_eq!(diagnostics.breaker.consecutive_failures, 0);
    assert_eq!(diagnostics.terminals_observed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_quick_restart_waits_for_previous_session() {
    let script = Script::new();
    script.abort_after(Duration::from_millis(200));
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options());

    coordinator.request_start().await.unwrap();
    coordinator.request_stop().await;
    assert_eq!(script.live(), 1, "abort still in progress");

    assert_eq!(coordinator.request_start().await.unwrap(), StartOutcome::Started);
    assert_eq!(script.starts(), 2);
    assert_eq!(script.max_live(), 1);

    coordinator.request_stop().await;
    tokio::time::advance(Duration::from_millis(200)).await;
    settle().await;

    let diagnostics = coordinator.diagnostics().await;
    assert_eq!(script.live(), 0);
    assert_eq!(diagnostics.sessions_started, diagnostics.terminals_observed);
}

#[tokio::test(start_paused = true)]
async fn test_start_timeout_is_critical() {
    let script = Script::new();
    script.stay_silent(true);
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options());

    let err = coordinator.request_start().await.unwrap_err();
    let Error::Provider(err) = err else {
        panic!("expected a provider error, got {err:?}");
    };
    assert_eq!(err.code(), "timeout");
    assert_eq!(script.live(), 0);
    assert_eq!(coordinator.diagnostics().await.breaker.consecutive_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_cooldown_throttles_starts() {
    let script = Script::new();
    let options = CoordinatorOptions::default();
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options);

    coordinator.request_start().await.unwrap();
    coordinator.request_stop().await;
    settle().await;

    assert_eq!(coordinator.request_start().await.unwrap(), StartOutcome::Throttled);

    tokio::time::advance(Duration::from_millis(600)).await;
    assert_eq!(coordinator.request_start().await.unwrap(), StartOutcome::Started);
    assert_eq!(script.starts(), 2);
}

#[tokio::test]
async fn test_auto_stop_after_final() {
    let script = Script::new();
    let options = CoordinatorOptions {
        auto_stop_after_final: true,
        ..options()
    };
    let coordinator = local_coordinator(&script, FakeSpeech::new(Duration::from_secs(1)), options);

    coordinator.request_start().await.unwrap();
    script.interim("문장");
    settle().await;
    assert_eq!(coordinator.state().await, SessionState::Listening);

    script.final_(&[("문장 모드", 0.8)]);
    settle().await;

    assert_eq!(coordinator.state().await, SessionState::Idle);
    assert_eq!(script.live(), 0);
}

#[tokio::test]
async fn test_remote_start_failure_falls_back_to_local() {
    let script = Script::new();
    let remote = RemoteProvider::new(None, ChannelSource::new());
    let fallback = LocalProvider::new(script.recognizer());
    let coordinator = Coordinator::new(
        Provider::Remote(remote),
        Some(fallback),
        FakeSpeech::new(Duration::from_secs(1)),
        EventBus::new(),
        options(),
    );
    let mut rx = coordinator.bus().subscribe();

    assert_eq!(coordinator.request_start().await.unwrap(), StartOutcome::Started);

    let diagnostics = coordinator.diagnostics().await;
    assert_eq!(diagnostics.backend, Backend::Local);
    assert_eq!(diagnostics.breaker.consecutive_failures, 0);

    script.final_(&[("폴백", 0.9)]);
    settle().await;
    assert_eq!(finals(&drain(&mut rx)), ["폴백"]);

    // The swap is permanent
    coordinator.request_stop().await;
    settle().await;
    coordinator.request_start().await.unwrap();
    assert_eq!(coordinator.diagnostics().await.backend, Backend::Local);
    assert_eq!(script.starts(), 2);
}

#[tokio::test]
async fn test_remote_without_fallback_reports_start_failed() {
    let coordinator = Coordinator::new(
        Provider::Remote(RemoteProvider::new(None, ChannelSource::new())),
        None,
        FakeSpeech::new(Duration::from_secs(1)),
        EventBus::new(),
        options(),
    );

    let Error::Provider(err) = coordinator.request_start().await.unwrap_err() else {
        panic!("expected a provider error");
    };
    assert_eq!(err.code(), "start_failed");
    assert_eq!(coordinator.state().await, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_random_interleaving_keeps_invariants() {
    let script = Script::new();
    let speech = FakeSpeech::new(Duration::from_millis(300));
    let options = CoordinatorOptions {
        breaker: CircuitBreaker::new(u32::MAX, Duration::from_secs(1)),
        ..options()
    };
    let coordinator = local_coordinator(&script, Arc::clone(&speech), options);
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for step in 0..1000 {
        match rng.gen_range(0..10) {
            0 | 1 => {
                let _ = coordinator.request_start().await;
            }
            2 | 3 => {
                coordinator.request_stop().await;
            }
            4 => {
                coordinator.speak(vec![format!("문장 {step}")]).await;
            }
            5 => script.interim("중간"),
            6 => script.final_(&[("결과", 0.9), ("결고", 0.4)]),
            7 => match rng.gen_range(0..3) {
                0 => script.end(),
                1 => script.fail("network"),
                _ => script.fail("no-speech"),
            },
            8 => coordinator.stop_speaking().await,
            _ => tokio::time::advance(Duration::from_millis(rng.gen_range(1..400))).await,
        }

        if rng.gen_bool(0.5) {
            settle().await;
        }

        assert!(script.live() <= 1, "step {step}: overlapping sessions");
        let state = coordinator.state().await;
        if state == SessionState::Listening {
            settle().await;
            assert!(!speech.is_speaking_now(), "step {step}: speaking while listening");
        }
    }

    coordinator.request_stop().await;
    coordinator.stop_speaking().await;
    settle().await;

    let diagnostics = coordinator.diagnostics().await;
    assert_eq!(script.max_live(), 1);
    assert_eq!(script.live(), 0, "leaked recognizer session");
    assert!(!diagnostics.draining);
    assert_eq!(diagnostics.state, SessionState::Idle);
    assert_eq!(diagnostics.sessions_started, diagnostics.terminals_observed);
}
