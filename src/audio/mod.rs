//! # Audio Module
//!
//! PCM/WAV framing for the voice relay. The relay never transcodes: audio
//! stays PCM s16le mono end to end, only its envelope changes.
//!
//! ## Audio Format:
//! - **Inbound**: 16kHz (configurable) PCM s16le from the browser, raw or WAV wrapped
//! - **Outbound**: 24kHz (configurable) PCM s16le from TTS, raw or WAV wrapped per chunk
//! - **Transport**: base64 inside JSON `audio_chunk` events

pub mod codec;

pub use codec::AudioEncoder;
