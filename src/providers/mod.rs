//! # Speech and Language Providers
//!
//! The relay talks to three external services. Each one sits behind a small
//! trait so a session can be driven by the real WebSocket/HTTP adapters in
//! production and by recording fakes in tests.
//!
//! ## Provider Seams:
//! - **SpeechToText**: factory for streaming STT handles (`SttStream`)
//! - **TextToSpeech**: one connection per session, one `TtsStream` per reply
//! - **LanguageModel**: request/response chat completion
//!
//! ## Concrete Adapters:
//! - `cartesia_stt`: Cartesia STT WebSocket
//! - `cartesia_tts`: Cartesia TTS WebSocket (context multiplexed)
//! - `openai`: OpenAI Chat Completions over HTTPS

pub mod cartesia_stt;
pub mod cartesia_tts;
pub mod openai;

use crate::session::conversation::Turn;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

pub use cartesia_stt::CartesiaStt;
pub use cartesia_tts::CartesiaTts;
pub use openai::OpenAiChat;

/// Failure reported by any provider adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Stream closed")]
    Closed,
}

/// One event produced by a live STT stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    Transcript { text: String, is_final: bool },
    Error { message: String },
}

/// Receiving half of an STT stream's event subscription.
pub type TranscriptSubscription = mpsc::UnboundedReceiver<TranscriptEvent>;

/// Builds fresh STT stream handles. Handles are never reused across restarts.
pub trait SpeechToText: Send + Sync {
    fn stream(&self) -> Box<dyn SttStream>;
}

/// A single streaming recognition session with the STT service.
#[async_trait]
pub trait SttStream: Send {
    async fn connect(&mut self) -> Result<(), ProviderError>;

    /// Take the transcript event subscription. Only the first call succeeds.
    fn subscribe(&mut self) -> Result<TranscriptSubscription, ProviderError>;

    async fn send(&mut self, audio: Vec<u8>) -> Result<(), ProviderError>;

    /// Ask the service to flush any pending partial transcript as final.
    async fn finalize(&mut self) -> Result<(), ProviderError>;

    async fn disconnect(&mut self) -> Result<(), ProviderError>;
}

/// Parameters of one synthesis request.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub model: String,
    pub text: String,
    pub voice: String,
}

/// A frame delivered by a TTS stream, exactly as it arrived on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Events emitted by a TTS stream. A closed event channel means the
/// underlying transport went away.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsEvent {
    Message(TtsFrame),
    Error(String),
    Abort,
}

/// How a TTS stream reached its end.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsCompletion {
    Done,
    Error(String),
    Aborted,
    TransportClosed,
}

/// Next thing a TTS stream has to say.
#[derive(Debug)]
pub enum TtsSignal {
    Frame(TtsFrame),
    Finished(TtsCompletion),
}

/// Subscription to one synthesis response.
///
/// The stream owns its event receiver and an optional release hook that
/// unregisters it from the connection. Release runs exactly once, either
/// through [`TtsStream::release`] or when the stream is dropped.
pub struct TtsStream {
    events: mpsc::UnboundedReceiver<TtsEvent>,
    transport_closed: Option<oneshot::Receiver<()>>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl TtsStream {
    pub fn new(events: mpsc::UnboundedReceiver<TtsEvent>) -> Self {
        Self {
            events,
            transport_closed: None,
            on_release: None,
        }
    }

    /// Attach a transport close signal separate from the event channel.
    pub fn with_transport_close(mut self, closed: oneshot::Receiver<()>) -> Self {
        self.transport_closed = Some(closed);
        self
    }

    pub fn with_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(release));
        self
    }

    /// Wait for the next frame or for the stream to finish.
    ///
    /// Queued frames win over a simultaneous transport close so audio that
    /// already arrived is never discarded.
    pub async fn next_signal(&mut self) -> TtsSignal {
        let Self {
            events,
            transport_closed,
            ..
        } = self;

        let closed = async {
            if let Some(rx) = transport_closed.as_mut() {
                let _ = rx.await;
                *transport_closed = None;
            } else {
                std::future::pending::<()>().await
            }
        };

        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(TtsEvent::Message(frame)) => TtsSignal::Frame(frame),
                Some(TtsEvent::Error(message)) => TtsSignal::Finished(TtsCompletion::Error(message)),
                Some(TtsEvent::Abort) => TtsSignal::Finished(TtsCompletion::Aborted),
                None => TtsSignal::Finished(TtsCompletion::TransportClosed),
            },
            _ = closed => TtsSignal::Finished(TtsCompletion::TransportClosed),
        }
    }

    /// Drop the stream's event subscriptions.
    pub fn release(&mut self) {
        self.events.close();
        self.transport_closed = None;
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

impl Drop for TtsStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Per-session text-to-speech connection.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn connect(&self) -> Result<(), ProviderError>;

    async fn synthesize(&self, request: SynthesisRequest) -> Result<TtsStream, ProviderError>;

    async fn disconnect(&self) -> Result<(), ProviderError>;
}

/// Chat completion over the full ordered turn sequence.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, model: &str, turns: &[Turn]) -> Result<String, ProviderError>;
}
