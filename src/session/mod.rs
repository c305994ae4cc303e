//! # Voice Session Core
//!
//! Everything that happens between one browser channel opening and closing.
//!
//! ## Key Components:
//! - **Orchestrator** (`orchestrator`): owns the STT/TTS handles, handles
//!   client input in order and manages stream restart and teardown
//! - **Transcript Aggregator** (`transcript`): STT events → client events
//! - **Response Pipeline** (`pipeline`): utterance → LLM → TTS → client audio
//! - **Conversation** (`conversation`): append-only turn history
//!
//! ## Rust Concepts:
//! - The orchestrator is a plain tokio task fed by an `mpsc` inbox, so a
//!   session's handlers never run in parallel with each other
//! - `ClientSink` hides the transport: the WebSocket actor implements it in
//!   production, a recording sink implements it in tests

pub mod conversation;
pub mod messages;
pub mod orchestrator;
pub mod pipeline;
pub mod transcript;

#[cfg(test)]
pub(crate) mod testing;

use crate::audio::AudioEncoder;
use crate::config::AppConfig;
use crate::providers::{LanguageModel, SpeechToText, TextToSpeech};
use messages::ServerEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

pub use orchestrator::{AudioPayload, Session, SessionInput};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Client channel is closed")]
    Closed,
}

/// Outbound half of a client channel.
pub trait ClientSink: Send + Sync {
    fn send(&self, event: ServerEvent) -> Result<(), SinkError>;

    /// Close the channel from the server side.
    fn close(&self);
}

/// Send an event, tolerating a channel that has already gone away.
pub(crate) fn emit(sink: &dyn ClientSink, event: ServerEvent) {
    let kind = event.kind();
    if let Err(err) = sink.send(event) {
        debug!("Dropped {} event: {}", kind, err);
    }
}

/// Resolves once the session's closed flag is raised (or its owner is gone).
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Collaborator clients constructed for one session.
#[derive(Clone)]
pub struct SessionServices {
    pub stt: Arc<dyn SpeechToText>,
    pub tts: Arc<dyn TextToSpeech>,
    pub llm: Arc<dyn LanguageModel>,
}

/// Immutable per-session settings derived from the application config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub system_prompt: String,
    pub llm_model: String,
    pub tts_model: String,
    pub voice_id: String,
    pub encoder: AudioEncoder,
    pub stt_sample_rate: u32,
    pub stt_connect_timeout: Duration,
    pub tts_connect_timeout: Duration,
    pub finalize_grace: Duration,
    pub max_context_turns: Option<usize>,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig, system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            llm_model: config.llm.model.clone(),
            tts_model: config.tts.model.clone(),
            voice_id: config.tts.voice_id.clone(),
            encoder: AudioEncoder::from_config(&config.tts),
            stt_sample_rate: config.stt.sample_rate,
            stt_connect_timeout: config.stt.connect_timeout(),
            tts_connect_timeout: config.tts.connect_timeout(),
            finalize_grace: config.stt.finalize_grace(),
            max_context_turns: config.conversation.max_context_turns,
        }
    }
}
