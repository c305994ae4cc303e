//! WebSocket message types exchanged with the browser client.
//!
//! ## Client → Server:
//! - `{"type":"audio_chunk","audio":"<base64 PCM>"}`
//! - `{"type":"audio_end"}`
//!
//! ## Server → Client:
//! - `stt-interim` / `stt-final` / `stt-error`: recognition progress
//! - `user_text` / `assistant_text`: the two sides of a turn
//! - `audio_chunk` / `audio_end`: synthesized reply audio
//! - `server-error`: recoverable failure, the session stays usable

use serde::{Deserialize, Serialize};

/// Messages sent by the browser.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "audio_chunk")]
    AudioChunk {
        #[serde(default)]
        audio: Option<String>,
    },

    #[serde(rename = "audio_end")]
    AudioEnd,

    /// Any other message type; ignored.
    #[serde(other)]
    Unknown,
}

/// Events sent to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "stt-interim")]
    SttInterim { text: String },

    #[serde(rename = "stt-final")]
    SttFinal { text: String },

    #[serde(rename = "stt-error")]
    SttError { message: String },

    #[serde(rename = "user_text")]
    UserText { text: String },

    #[serde(rename = "assistant_text")]
    AssistantText { text: String },

    #[serde(rename = "audio_chunk")]
    AudioChunk {
        /// Base64 encoded audio payload
        audio: String,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        encoding: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        container: Option<String>,
    },

    #[serde(rename = "audio_end")]
    AudioEnd,

    #[serde(rename = "server-error")]
    ServerError { message: String },
}

impl ServerEvent {
    pub fn server_error(message: impl Into<String>) -> Self {
        ServerEvent::ServerError { message: message.into() }
    }

    /// Wire name of the event, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::SttInterim { .. } => "stt-interim",
            ServerEvent::SttFinal { .. } => "stt-final",
            ServerEvent::SttError { .. } => "stt-error",
            ServerEvent::UserText { .. } => "user_text",
            ServerEvent::AssistantText { .. } => "assistant_text",
            ServerEvent::AudioChunk { .. } => "audio_chunk",
            ServerEvent::AudioEnd => "audio_end",
            ServerEvent::ServerError { .. } => "server-error",
        }
    }
}
