//! Provider streaming to a remote transcription service
//!
//! Opens a WebSocket to the configured endpoint, streams captured audio as
//! binary PCM16LE frames and forwards decoded results. `stop` halts capture
//! and closes the socket; the session ends when the server completes the
//! close or the stop grace expires.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::wire::{Decoded, decode_server_message};
use super::{EventSink, ProviderError, ProviderEvent, SessionId, Termination, emit};
use crate::voice::{AudioSource, AudioStream, CaptureFormat, pcm16le};

/// Default bound on establishing the connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for the server to close after a stop
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct ActiveSession {
    id: SessionId,
    stop: oneshot::Sender<()>,
    live: Arc<AtomicBool>,
}

/// Remote streaming recognition provider
pub struct RemoteProvider {
    endpoint: Option<String>,
    source: Arc<dyn AudioSource>,
    format: CaptureFormat,
    connect_timeout: Duration,
    stop_grace: Duration,
    sink: Option<EventSink>,
    active: Option<ActiveSession>,
}

impl RemoteProvider {
    /// Create a provider for `endpoint` capturing from `source`
    ///
    /// A missing endpoint is not an error here; `start` reports it as
    /// `start_failed` so the caller can fall back.
    #[must_use]
    pub fn new(endpoint: Option<String>, source: Arc<dyn AudioSource>) -> Self {
        Self {
            endpoint,
            source,
            format: CaptureFormat::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            sink: None,
            active: None,
        }
    }

    /// Override the capture format
    #[must_use]
    pub const fn with_format(mut self, format: CaptureFormat) -> Self {
        self.format = format;
        self
    }

    /// Override the connect timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the stop grace
    #[must_use]
    pub const fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Register the event sink; the last registration wins
    pub fn set_event_sink(&mut self, sink: EventSink) {
        self.sink = Some(sink);
    }

    /// Whether a session handle is live
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|s| s.live.load(Ordering::Acquire))
    }

    /// Connect, open capture and begin streaming
    ///
    /// # Errors
    ///
    /// `start_failed` for a missing or invalid endpoint, `timeout` when the
    /// connection is not established in time, `ws_error` when it is refused,
    /// `audio-capture` when no input device can be opened.
    pub async fn start(&mut self) -> Result<SessionId, ProviderError> {
        if self.is_active() {
            return Err(ProviderError::already_active());
        }
        self.active = None;

        let url = self.endpoint()?;

        let mut socket = match tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(e)) => return Err(connect_error(&e)),
            Err(_) => {
                return Err(ProviderError::timeout(format!(
                    "no connection to {url} within {}ms",
                    self.connect_timeout.as_millis()
                )));
            }
        };

        let source = Arc::clone(&self.source);
        let format = self.format;
        let audio = match tokio::task::spawn_blocking(move || source.open(format)).await {
            Ok(Ok(audio)) => audio,
            Ok(Err(e)) => {
                let _ = socket.close(None).await;
                return Err(ProviderError::device_unavailable(e.to_string()));
            }
            Err(e) => {
                let _ = socket.close(None).await;
                return Err(ProviderError::device_unavailable(e.to_string()));
            }
        };

        let id = SessionId::next();
        let (stop, stop_rx) = oneshot::channel();
        let live = Arc::new(AtomicBool::new(true));

        let session = StreamSession {
            id,
            sink: self.sink.clone(),
            grace: self.stop_grace,
            live: Arc::clone(&live),
        };
        tokio::spawn(session.run(socket, audio, stop_rx));

        tracing::debug!(session = %id, endpoint = %url, "remote session started");
        self.active = Some(ActiveSession { id, stop, live });
        Ok(id)
    }

    /// Stop streaming and close the socket; no-op when idle
    pub fn stop(&mut self) {
        if let Some(session) = self.active.take() {
            tracing::debug!(session = %session.id, "stopping remote session");
            let _ = session.stop.send(());
        }
    }

    fn endpoint(&self) -> Result<Url, ProviderError> {
        let raw = self
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ProviderError::start_failed("remote endpoint not configured"))?;

        let url = Url::parse(raw).map_err(|e| ProviderError::start_failed(format!("invalid endpoint {raw}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ProviderError::start_failed(format!(
                "unsupported endpoint scheme {other}"
            ))),
        }
    }
}

fn connect_error(error: &tungstenite::Error) -> ProviderError {
    match error {
        tungstenite::Error::Url(e) => ProviderError::start_failed(e.to_string()),
        other => ProviderError::network(other.to_string()),
    }
}

/// One streaming session, owned by its task
struct StreamSession {
    id: SessionId,
    sink: Option<EventSink>,
    grace: Duration,
    live: Arc<AtomicBool>,
}

impl StreamSession {
    async fn run(self, socket: Socket, mut audio: AudioStream, mut stop: oneshot::Receiver<()>) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let mut closing_by: Option<Instant> = None;
        let mut capturing = true;
        let mut termination = Termination::Clean;

        loop {
            tokio::select! {
                _ = &mut stop, if closing_by.is_none() => {
                    audio.stop();
                    capturing = false;
                    let _ = ws_tx.send(Message::Close(None)).await;
                    closing_by = Some(Instant::now() + self.grace);
                }
                frame = audio.next_frame(), if capturing => {
                    let Some(frame) = frame else {
                        capturing = false;
                        if closing_by.is_none() {
                            self.fail(&mut termination, ProviderError::device_unavailable("capture stream ended"));
                            let _ = ws_tx.send(Message::Close(None)).await;
                            closing_by = Some(Instant::now() + self.grace);
                        }
                        continue;
                    };

                    if let Err(e) = ws_tx.send(Message::Binary(pcm16le(&frame).into())).await {
                        if closing_by.is_none() {
                            self.fail(&mut termination, ProviderError::network(e.to_string()));
                        }
                        break;
                    }
                }
                message = ws_rx.next() => match message {
                    Some(Ok(Message::Text(text))) => match decode_server_message(text.as_str()) {
                        Some(Decoded::Batch(batch)) => {
                            emit(self.sink.as_ref(), ProviderEvent::Batch { session: self.id, batch });
                        }
                        Some(Decoded::Error(error)) if closing_by.is_none() => {
                            self.fail(&mut termination, error);
                        }
                        Some(Decoded::Error(error)) => {
                            tracing::debug!(session = %self.id, error = %error, "service error while closing");
                        }
                        None => {}
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(session = %self.id, ?frame, "server closed stream");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        if closing_by.is_none() && !matches!(termination, Termination::Failed { .. }) {
                            self.fail(&mut termination, ProviderError::network(e.to_string()));
                        }
                        break;
                    }
                    None => break,
                },
                () = until(closing_by) => {
                    tracing::warn!(session = %self.id, grace_ms = self.grace.as_millis(), "server did not close in time");
                    break;
                }
            }
        }

        audio.stop();
        self.live.store(false, Ordering::Release);
        tracing::debug!(session = %self.id, ?termination, "remote session ended");
        emit(
            self.sink.as_ref(),
            ProviderEvent::Ended {
                session: self.id,
                termination,
            },
        );
    }

    fn fail(&self, termination: &mut Termination, error: ProviderError) {
        tracing::warn!(session = %self.id, error = %error, "remote recognition failure");
        if !matches!(termination, Termination::Failed { .. }) {
            *termination = Termination::Failed {
                code: error.code().to_string(),
            };
        }
        emit(
            self.sink.as_ref(),
            ProviderEvent::Error {
                session: self.id,
                error,
            },
        );
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
