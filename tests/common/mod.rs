//! Shared test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast, mpsc};

use voice_channel::coordinator::CoordinatorOptions;
use voice_channel::provider::{
    ContinuousRecognizer, LocalProvider, ProviderError, RecognitionResult, RecognizerEvent,
};
use voice_channel::voice::{AudioSource, AudioStream, CaptureFormat, SpeechOptions, SpeechOutput};
use voice_channel::{Coordinator, EventBus, Provider, VoiceEvent};

/// Let spawned tasks run until the runtime is idle
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Drain every event currently buffered on `rx`
pub fn drain(rx: &mut broadcast::Receiver<VoiceEvent>) -> Vec<VoiceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Ordered record of calls across test doubles
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<&'static str>>>);

impl CallLog {
    pub fn record(&self, call: &'static str) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct ScriptState {
    current: Option<mpsc::UnboundedSender<RecognizerEvent>>,
    fail_with: Option<String>,
    silent: bool,
    abort_delay: Option<Duration>,
    log: Option<CallLog>,
    starts: usize,
    live: usize,
    max_live: usize,
}

/// Test handle over a [`ScriptedRecognizer`]
///
/// Events are pushed by the test; the recognizer keeps count of live
/// sessions so tests can assert that handles never leak or overlap.
#[derive(Clone, Default)]
pub struct Script {
    state: Arc<Mutex<ScriptState>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recognizer to hand to a provider
    pub fn recognizer(&self) -> Box<dyn ContinuousRecognizer> {
        Box::new(ScriptedRecognizer {
            script: self.clone(),
        })
    }

    /// Fail every following start with `code`; `None` starts normally
    pub fn fail_starts_with(&self, code: Option<&str>) {
        self.state.lock().unwrap().fail_with = code.map(str::to_string);
    }

    /// Never acknowledge following starts
    pub fn stay_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    /// Let aborts take effect only after `delay`, like a real capture device
    pub fn abort_after(&self, delay: Duration) {
        self.state.lock().unwrap().abort_delay = Some(delay);
    }

    /// Record recognizer starts to `log`
    pub fn log_to(&self, log: &CallLog) {
        self.state.lock().unwrap().log = Some(log.clone());
    }

    pub fn interim(&self, text: &str) {
        self.send(RecognizerEvent::Result(vec![RecognitionResult::interim(text, Some(0.6))]));
    }

    pub fn final_(&self, alternatives: &[(&str, f32)]) {
        let alternatives = alternatives.iter().map(|(t, c)| (*t, Some(*c)));
        self.send(RecognizerEvent::Result(vec![RecognitionResult::final_(alternatives)]));
    }

    /// Report `code` and end the session
    pub fn fail(&self, code: &str) {
        self.send(RecognizerEvent::Error {
            code: code.to_string(),
            message: None,
        });
        self.end();
    }

    fn finish_abort(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = state.current.take() {
            let _ = tx.send(RecognizerEvent::Error {
                code: "aborted".to_string(),
                message: None,
            });
            let _ = tx.send(RecognizerEvent::End);
            state.live -= 1;
        }
    }

    /// End the session on the recognizer's own initiative
    pub fn end(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = state.current.take() {
            let _ = tx.send(RecognizerEvent::End);
            state.live -= 1;
        }
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live
    }

    pub fn max_live(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    fn send(&self, event: RecognizerEvent) {
        if let Some(tx) = &self.state.lock().unwrap().current {
            let _ = tx.send(event);
        }
    }
}

struct ScriptedRecognizer {
    script: Script,
}

impl ContinuousRecognizer for ScriptedRecognizer {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn start(&mut self, events: mpsc::UnboundedSender<RecognizerEvent>) -> Result<(), ProviderError> {
        let mut state = self.script.state.lock().unwrap();
        state.starts += 1;
        if let Some(log) = &state.log {
            log.record("recognizer.start");
        }

        if let Some(code) = state.fail_with.clone() {
            let _ = events.send(RecognizerEvent::Error { code, message: None });
            let _ = events.send(RecognizerEvent::End);
            return Ok(());
        }

        assert!(state.current.is_none(), "recognizer started while a session is live");
        if !state.silent {
            let _ = events.send(RecognizerEvent::Started);
        }
        state.current = Some(events);
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        Ok(())
    }

    fn abort(&mut self) {
        let delay = self.script.state.lock().unwrap().abort_delay;
        match delay {
            Some(delay) => {
                let script = self.script.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    script.finish_abort();
                });
            }
            None => self.script.finish_abort(),
        }
    }
}

/// Speech output that records requests and "plays" for a fixed time
pub struct FakeSpeech {
    duration: Duration,
    spoken: Mutex<Vec<Vec<String>>>,
    speaking: AtomicBool,
    stops: AtomicUsize,
    interrupted: Notify,
    log: Option<CallLog>,
}

impl FakeSpeech {
    pub fn new(duration: Duration) -> Arc<Self> {
        Self::build(duration, None)
    }

    /// Speech that records its stops to `log`
    pub fn logged(duration: Duration, log: &CallLog) -> Arc<Self> {
        Self::build(duration, Some(log.clone()))
    }

    fn build(duration: Duration, log: Option<CallLog>) -> Arc<Self> {
        Arc::new(Self {
            duration,
            spoken: Mutex::new(Vec::new()),
            speaking: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
            interrupted: Notify::new(),
            log,
        })
    }

    pub fn spoken(&self) -> Vec<Vec<String>> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_speaking_now(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechOutput for FakeSpeech {
    async fn speak(&self, texts: &[String], _options: &SpeechOptions) -> voice_channel::Result<()> {
        self.spoken.lock().unwrap().push(texts.to_vec());
        self.speaking.store(true, Ordering::SeqCst);
        tokio::select! {
            () = tokio::time::sleep(self.duration) => {}
            () = self.interrupted.notified() => {}
        }
        self.speaking.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        if let Some(log) = &self.log {
            log.record("speech.stop");
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.speaking.store(false, Ordering::SeqCst);
        self.interrupted.notify_waiters();
    }

    fn pause(&self) {}

    fn resume(&self) {}

    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }
}

/// Options with the restart cool-down disabled
pub fn options() -> CoordinatorOptions {
    CoordinatorOptions {
        restart_cooldown: Duration::ZERO,
        ..CoordinatorOptions::default()
    }
}

/// Coordinator over a scripted local recognizer
pub fn local_coordinator(script: &Script, speech: Arc<FakeSpeech>, options: CoordinatorOptions) -> Coordinator {
    let provider = Provider::Local(LocalProvider::new(script.recognizer()));
    Coordinator::new(provider, None, speech, EventBus::new(), options)
}

/// Audio source that feeds frames pushed by the test
#[derive(Default)]
pub struct ChannelSource {
    senders: Mutex<Vec<mpsc::Sender<Vec<f32>>>>,
    unavailable: AtomicBool,
}

impl ChannelSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unavailable() -> Arc<Self> {
        let source = Self::default();
        source.unavailable.store(true, Ordering::SeqCst);
        Arc::new(source)
    }

    /// Push a frame to the latest opened stream
    pub async fn push(&self, frame: Vec<f32>) {
        let tx = self.senders.lock().unwrap().last().cloned();
        if let Some(tx) = tx {
            let _ = tx.send(frame).await;
        }
    }

    pub fn opened(&self) -> usize {
        self.senders.lock().unwrap().len()
    }
}

impl AudioSource for ChannelSource {
    fn open(&self, _format: CaptureFormat) -> voice_channel::Result<AudioStream> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(voice_channel::Error::Audio("no input device available".into()));
        }
        let (tx, stream) = AudioStream::channel(16);
        self.senders.lock().unwrap().push(tx);
        Ok(stream)
    }
}
