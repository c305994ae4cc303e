//! # Cartesia Streaming STT
//!
//! One WebSocket per `SttStream`. Audio goes out as raw binary frames (not
//! base64); control commands go out as plain text frames:
//! - `finalize`: flush buffered audio, answered with `flush_done`
//! - `done`: flush and end the session, answered with `done` then close
//!
//! Inbound JSON messages are mapped to [`TranscriptEvent`]s:
//!
//! | `type`         | Event                                   |
//! |----------------|-----------------------------------------|
//! | `"transcript"` | `Transcript { text, is_final }`         |
//! | `"error"`      | `Error { message }`                     |
//! | `"flush_done"` | logged only                             |
//! | `"done"`       | ends the stream                         |

use super::{ProviderError, SpeechToText, SttStream, TranscriptEvent, TranscriptSubscription};
use crate::config::SttConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

/// How long `disconnect` waits for the socket task to wind down.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(1);

/// Factory for Cartesia STT streams sharing one configuration.
#[derive(Debug, Clone)]
pub struct CartesiaStt {
    config: SttConfig,
}

impl CartesiaStt {
    pub fn new(config: SttConfig) -> Self {
        Self { config }
    }
}

impl SpeechToText for CartesiaStt {
    fn stream(&self) -> Box<dyn SttStream> {
        Box::new(CartesiaSttStream::new(self.config.clone()))
    }
}

/// Build the WebSocket URL; authentication travels in the query string.
pub fn build_stt_url(config: &SttConfig) -> Result<reqwest::Url, ProviderError> {
    let sample_rate = config.sample_rate.to_string();
    reqwest::Url::parse_with_params(
        &config.url,
        &[
            ("api_key", config.api_key.as_str()),
            ("cartesia_version", config.api_version.as_str()),
            ("model", config.model.as_str()),
            ("language", config.language.as_str()),
            ("encoding", config.encoding.as_str()),
            ("sample_rate", sample_rate.as_str()),
        ],
    )
    .map_err(|e| ProviderError::Connection(format!("Invalid STT url: {}", e)))
}

/// Messages received from Cartesia.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundMessage {
    Transcript {
        #[serde(default)]
        text: String,
        #[serde(default)]
        is_final: bool,
    },
    FlushDone,
    Done,
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

enum Command {
    Audio(Vec<u8>),
    Finalize,
    Done,
}

impl Command {
    fn into_message(self) -> Message {
        match self {
            Command::Audio(audio) => Message::Binary(audio),
            Command::Finalize => Message::Text("finalize".to_string()),
            Command::Done => Message::Text("done".to_string()),
        }
    }
}

/// Whether the socket loop should keep reading after a message.
#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Stop,
}

fn handle_text(text: &str, events: &mpsc::UnboundedSender<TranscriptEvent>) -> Flow {
    let message = match serde_json::from_str::<InboundMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            warn!("Unparseable STT message: {} ({})", text, err);
            return Flow::Continue;
        }
    };

    match message {
        InboundMessage::Transcript { text, is_final } => {
            let _ = events.send(TranscriptEvent::Transcript { text, is_final });
            Flow::Continue
        }
        InboundMessage::Error { message } => {
            let message = message.unwrap_or_default();
            error!("STT service error: {}", message);
            let _ = events.send(TranscriptEvent::Error { message });
            Flow::Continue
        }
        InboundMessage::FlushDone => {
            debug!("STT flush acknowledged");
            Flow::Continue
        }
        InboundMessage::Done => Flow::Stop,
        InboundMessage::Unknown => Flow::Continue,
    }
}

pub struct CartesiaSttStream {
    config: SttConfig,
    events_tx: Option<mpsc::UnboundedSender<TranscriptEvent>>,
    events_rx: Option<TranscriptSubscription>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
}

impl CartesiaSttStream {
    pub fn new(config: SttConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            events_tx: Some(events_tx),
            events_rx: Some(events_rx),
            commands: None,
            task: None,
        }
    }

    fn command(&self, command: Command) -> Result<(), ProviderError> {
        let commands = self.commands.as_ref().ok_or(ProviderError::NotConnected)?;
        commands.send(command).map_err(|_| ProviderError::Closed)
    }
}

#[async_trait]
impl SttStream for CartesiaSttStream {
    async fn connect(&mut self) -> Result<(), ProviderError> {
        if self.commands.is_some() {
            return Ok(());
        }
        let events = self.events_tx.take().ok_or(ProviderError::Closed)?;
        let url = build_stt_url(&self.config)?;

        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ProviderError::Connection(format!("Failed to connect to Cartesia STT: {}", e)))?;
        info!("Connected to Cartesia STT ({})", self.config.model);

        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel::<Command>();
        let (mut ws_sink, mut ws_stream) = socket.split();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = commands_rx.recv() => {
                        let Some(command) = command else {
                            let _ = ws_sink.close().await;
                            break;
                        };
                        if let Err(e) = ws_sink.send(command.into_message()).await {
                            error!("Failed to send to Cartesia STT: {}", e);
                            let _ = events.send(TranscriptEvent::Error { message: e.to_string() });
                            break;
                        }
                    }

                    message = ws_stream.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if handle_text(&text, &events) == Flow::Stop {
                                debug!("Cartesia STT session done");
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!("Cartesia STT closed the connection: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("Cartesia STT WebSocket error: {}", e);
                            let _ = events.send(TranscriptEvent::Error { message: e.to_string() });
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!("Cartesia STT connection closed");
        });

        self.commands = Some(commands_tx);
        self.task = Some(task);
        Ok(())
    }

    fn subscribe(&mut self) -> Result<TranscriptSubscription, ProviderError> {
        self.events_rx.take().ok_or(ProviderError::Closed)
    }

    async fn send(&mut self, audio: Vec<u8>) -> Result<(), ProviderError> {
        self.command(Command::Audio(audio))
    }

    async fn finalize(&mut self) -> Result<(), ProviderError> {
        self.command(Command::Finalize)
    }

    async fn disconnect(&mut self) -> Result<(), ProviderError> {
        let Some(commands) = self.commands.take() else {
            self.events_tx = None;
            return Ok(());
        };

        let _ = commands.send(Command::Done);
        drop(commands);

        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_WAIT, &mut task).await.is_err() {
                warn!("Cartesia STT connection did not close in time, aborting");
                task.abort();
            }
        }
        Ok(())
    }
}

impl Drop for CartesiaSttStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
