//! # Cartesia Streaming TTS
//!
//! One WebSocket per session, multiplexed into one context per synthesis
//! request. Each request carries a fresh `context_id`; every inbound frame is
//! routed to the context it names and handed over untouched, so the
//! pipeline sees exactly what the service sent (JSON or raw binary audio).
//!
//! ## Context lifecycle:
//! - registered by `synthesize`, before the request is written
//! - removed when a `done` frame for it arrives, or when its `TtsStream` is released
//! - on a socket error every open context receives `TtsEvent::Error`
//! - on socket close every open context receives its transport close signal
//! - `disconnect` sends `TtsEvent::Abort` to every open context

use super::{ProviderError, SynthesisRequest, TextToSpeech, TtsEvent, TtsFrame, TtsStream};
use crate::config::TtsConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct ContextEntry {
    events: mpsc::UnboundedSender<TtsEvent>,
    transport_closed: oneshot::Sender<()>,
}

/// Open synthesis contexts of one connection.
#[derive(Default)]
struct Contexts {
    entries: HashMap<String, ContextEntry>,
    /// Most recently registered context; receives untagged binary frames.
    latest: Option<String>,
}

impl Contexts {
    fn register(&mut self, id: String, entry: ContextEntry) {
        self.latest = Some(id.clone());
        self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: &str) {
        self.entries.remove(id);
        if self.latest.as_deref() == Some(id) {
            self.latest = None;
        }
    }

    fn deliver(&self, id: &str, frame: TtsFrame) -> bool {
        match self.entries.get(id) {
            Some(entry) => entry.events.send(TtsEvent::Message(frame)).is_ok(),
            None => false,
        }
    }

    fn broadcast(&self, event: TtsEvent) {
        for entry in self.entries.values() {
            let _ = entry.events.send(event.clone());
        }
    }

    /// Signal transport close to every open context and forget them.
    fn close_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            let _ = entry.transport_closed.send(());
        }
        self.latest = None;
    }
}

type SharedContexts = Arc<Mutex<Contexts>>;

fn with_contexts<R>(contexts: &SharedContexts, f: impl FnOnce(&mut Contexts) -> R) -> Option<R> {
    match contexts.lock() {
        Ok(mut guard) => Some(f(&mut guard)),
        Err(_) => {
            error!("TTS context registry poisoned");
            None
        }
    }
}

struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

pub struct CartesiaTts {
    config: TtsConfig,
    contexts: SharedContexts,
    connection: tokio::sync::Mutex<Option<Connection>>,
}

impl CartesiaTts {
    pub fn new(config: TtsConfig) -> Self {
        Self {
            config,
            contexts: Arc::new(Mutex::new(Contexts::default())),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    fn request_body(&self, request: &SynthesisRequest, context_id: &str) -> Value {
        json!({
            "model_id": request.model,
            "transcript": request.text,
            "voice": { "mode": "id", "id": request.voice },
            "output_format": {
                "container": "raw",
                "encoding": self.config.encoding,
                "sample_rate": self.config.sample_rate,
            },
            "context_id": context_id,
            "continue": false,
        })
    }
}

pub fn build_tts_url(config: &TtsConfig) -> Result<reqwest::Url, ProviderError> {
    reqwest::Url::parse_with_params(
        &config.url,
        &[
            ("api_key", config.api_key.as_str()),
            ("cartesia_version", config.api_version.as_str()),
        ],
    )
    .map_err(|e| ProviderError::Connection(format!("Invalid TTS url: {}", e)))
}

/// Route one text frame to the context it names.
fn route_text(contexts: &mut Contexts, text: String) {
    let parsed = serde_json::from_str::<Value>(&text).ok();
    let context_id = parsed
        .as_ref()
        .and_then(|v| v.get("context_id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let is_done = parsed.as_ref().map_or(false, |v| {
        v.get("done").and_then(Value::as_bool) == Some(true)
            || v.get("type").and_then(Value::as_str) == Some("done")
    });

    match context_id {
        Some(id) => {
            if !contexts.deliver(&id, TtsFrame::Text(text)) {
                debug!("Dropping TTS frame for unknown context {}", id);
            }
            if is_done {
                contexts.remove(&id);
            }
        }
        None => {
            let is_error = parsed
                .as_ref()
                .and_then(|v| v.get("type"))
                .and_then(Value::as_str)
                == Some("error");
            if is_error {
                // Connection-level error without a context: every request fails.
                let message = parsed
                    .as_ref()
                    .and_then(|v| v.get("message").or_else(|| v.get("error")))
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown TTS error")
                    .to_string();
                contexts.broadcast(TtsEvent::Error(message));
            } else {
                debug!("Dropping untagged TTS frame");
            }
        }
    }
}

fn route_binary(contexts: &mut Contexts, bytes: Vec<u8>) {
    match contexts.latest.clone() {
        Some(id) => {
            contexts.deliver(&id, TtsFrame::Binary(bytes));
        }
        None => debug!("Dropping binary TTS frame with no open context"),
    }
}

async fn read_loop<S>(mut stream: S, contexts: SharedContexts)
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                with_contexts(&contexts, |c| route_text(c, text));
            }
            Ok(Message::Binary(bytes)) => {
                with_contexts(&contexts, |c| route_binary(c, bytes));
            }
            Ok(Message::Close(frame)) => {
                debug!("Cartesia TTS closed the connection: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Cartesia TTS WebSocket error: {}", e);
                with_contexts(&contexts, |c| c.broadcast(TtsEvent::Error(e.to_string())));
                break;
            }
        }
    }

    with_contexts(&contexts, Contexts::close_all);
    debug!("Cartesia TTS connection closed");
}

#[async_trait]
impl TextToSpeech for CartesiaTts {
    async fn connect(&self) -> Result<(), ProviderError> {
        let mut connection = self.connection.lock().await;
        if connection.as_ref().map_or(false, |c| !c.reader.is_finished()) {
            return Ok(());
        }

        let url = build_tts_url(&self.config)?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ProviderError::Connection(format!("Failed to connect to Cartesia TTS: {}", e)))?;
        info!("Connected to Cartesia TTS ({})", self.config.model);

        let (mut ws_sink, ws_stream) = socket.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = ws_sink.send(message).await {
                    error!("Failed to send to Cartesia TTS: {}", e);
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        let reader = tokio::spawn(read_loop(ws_stream, self.contexts.clone()));

        *connection = Some(Connection { outgoing, reader });
        Ok(())
    }

    async fn synthesize(&self, request: SynthesisRequest) -> Result<TtsStream, ProviderError> {
        let connection = self.connection.lock().await;
        let connection = connection
            .as_ref()
            .filter(|c| !c.reader.is_finished())
            .ok_or(ProviderError::NotConnected)?;

        let context_id = Uuid::new_v4().to_string();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (transport_closed, closed_rx) = oneshot::channel();

        with_contexts(&self.contexts, |c| {
            c.register(context_id.clone(), ContextEntry { events, transport_closed })
        })
        .ok_or_else(|| ProviderError::Protocol("TTS context registry unavailable".to_string()))?;

        let body = self.request_body(&request, &context_id).to_string();
        if connection.outgoing.send(Message::Text(body)).is_err() {
            with_contexts(&self.contexts, |c| c.remove(&context_id));
            return Err(ProviderError::Send("TTS connection writer stopped".to_string()));
        }
        debug!("Started TTS context {} ({} chars)", context_id, request.text.len());

        let contexts = self.contexts.clone();
        Ok(TtsStream::new(events_rx)
            .with_transport_close(closed_rx)
            .with_release(move || {
                with_contexts(&contexts, |c| c.remove(&context_id));
            }))
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        let Some(connection) = self.connection.lock().await.take() else {
            return Ok(());
        };

        with_contexts(&self.contexts, |c| {
            c.broadcast(TtsEvent::Abort);
            c.entries.clear();
            c.latest = None;
        });

        if connection.outgoing.send(Message::Close(None)).is_err() {
            warn!("Cartesia TTS writer already stopped");
        }
        connection.reader.abort();
        Ok(())
    }
}
