//! # Audio Framing Codec
//!
//! Stateless conversions between the transport envelopes used by the relay
//! and raw PCM audio.
//!
//! ## Inbound (client → STT):
//! - Base64 JSON payloads are decoded to bytes
//! - A RIFF/WAV payload is unwrapped to its 16-bit PCM samples
//! - Anything else is assumed to already be raw PCM s16le
//!
//! ## Outbound (TTS → client):
//! - TTS frames are sniffed: text is always JSON, binary is JSON only when it
//!   starts with `{` or `[` (after leading whitespace), otherwise raw audio
//! - Raw PCM is base64 encoded into `audio_chunk` events, optionally wrapped
//!   as a standalone WAV per chunk
//!
//! ## Rust Concepts:
//! - `byteorder` reads/writes little-endian samples through `io::Cursor`
//! - The `wav` crate needs `Read + Seek` / `Write + Seek`, which `Cursor`
//!   provides over in-memory buffers

use crate::config::TtsConfig;
use crate::providers::TtsFrame;
use crate::session::messages::ServerEvent;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde_json::Value;
use std::io::Cursor;

const RIFF_MAGIC: &[u8; 4] = b"RIFF";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM data length must be even for 16-bit samples, got {0} bytes")]
    OddLength(usize),

    #[error("Invalid WAV container: {0}")]
    Wav(#[from] std::io::Error),

    #[error("Unsupported WAV format: {0}")]
    UnsupportedWav(String),

    #[error("Invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Audio received from the client, ready for the STT stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientAudio {
    pub pcm: Vec<u8>,
    /// Sample rate declared by a WAV header, if the payload carried one.
    pub sample_rate: Option<u32>,
}

/// Decode a base64 `audio_chunk` payload.
pub fn decode_client_audio(payload: &str) -> Result<ClientAudio, CodecError> {
    let bytes = STANDARD.decode(payload.trim())?;
    normalize_client_audio(bytes)
}

/// Accept raw PCM as-is and unwrap WAV containers.
pub fn normalize_client_audio(bytes: Vec<u8>) -> Result<ClientAudio, CodecError> {
    if bytes.starts_with(RIFF_MAGIC) {
        let (pcm, sample_rate) = unwrap_wav(&bytes)?;
        return Ok(ClientAudio { pcm, sample_rate: Some(sample_rate) });
    }
    Ok(ClientAudio { pcm: bytes, sample_rate: None })
}

/// Extract mono 16-bit PCM bytes and the sample rate from a WAV file.
pub fn unwrap_wav(bytes: &[u8]) -> Result<(Vec<u8>, u32), CodecError> {
    let (header, data) = wav::read(&mut Cursor::new(bytes))?;

    if header.channel_count != 1 {
        return Err(CodecError::UnsupportedWav(format!(
            "expected mono audio, got {} channels",
            header.channel_count
        )));
    }

    let samples = data.try_into_sixteen().map_err(|_| {
        CodecError::UnsupportedWav(format!(
            "expected 16-bit samples, got {} bits",
            header.bits_per_sample
        ))
    })?;

    Ok((samples_to_pcm(&samples), header.sampling_rate))
}

/// Wrap raw PCM s16le mono audio in a standalone WAV container.
pub fn wrap_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>, CodecError> {
    let samples = pcm_to_samples(pcm)?;
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, sample_rate, 16);
    let mut out = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    wav::write(header, &wav::BitDepth::Sixteen(samples), &mut out)?;
    Ok(out.into_inner())
}

pub fn pcm_to_samples(pcm: &[u8]) -> Result<Vec<i16>, CodecError> {
    if pcm.len() % 2 != 0 {
        return Err(CodecError::OddLength(pcm.len()));
    }

    let mut cursor = Cursor::new(pcm);
    let mut samples = Vec::with_capacity(pcm.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

pub fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail.
        let _ = pcm.write_i16::<LittleEndian>(sample);
    }
    pcm
}

/// Container used for audio frames sent to the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Raw,
    Wav,
}

impl Container {
    pub fn parse(value: &str) -> Self {
        match value {
            "wav" => Container::Wav,
            _ => Container::Raw,
        }
    }
}

/// Encodes synthesized audio into client `audio_chunk` events.
#[derive(Debug, Clone)]
pub struct AudioEncoder {
    sample_rate: u32,
    encoding: String,
    container: Container,
}

impl AudioEncoder {
    pub fn new(sample_rate: u32, encoding: impl Into<String>, container: Container) -> Self {
        Self {
            sample_rate,
            encoding: encoding.into(),
            container,
        }
    }

    pub fn from_config(config: &TtsConfig) -> Self {
        Self::new(
            config.sample_rate,
            config.encoding.clone(),
            Container::parse(&config.client_container),
        )
    }

    /// Encode raw PCM bytes. Empty input produces no event.
    pub fn encode_pcm(&self, pcm: &[u8]) -> Result<Option<ServerEvent>, CodecError> {
        if pcm.is_empty() {
            return Ok(None);
        }

        let event = match self.container {
            Container::Raw => self.event(STANDARD.encode(pcm)),
            Container::Wav => self.event(STANDARD.encode(wrap_wav(pcm, self.sample_rate)?)),
        };
        Ok(Some(event))
    }

    /// Encode audio that is already base64 encoded PCM.
    ///
    /// With the raw container the payload is passed through untouched.
    pub fn encode_base64(&self, data: &str) -> Result<Option<ServerEvent>, CodecError> {
        if data.is_empty() {
            return Ok(None);
        }

        match self.container {
            Container::Raw => Ok(Some(self.event(data.to_string()))),
            Container::Wav => self.encode_pcm(&STANDARD.decode(data)?),
        }
    }

    fn event(&self, audio: String) -> ServerEvent {
        ServerEvent::AudioChunk {
            audio,
            sample_rate: self.sample_rate,
            encoding: self.encoding.clone(),
            container: match self.container {
                Container::Raw => None,
                Container::Wav => Some("wav".to_string()),
            },
        }
    }
}

/// A structured message carried by a JSON TTS frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Base64 encoded PCM audio.
    Chunk(String),
    Done,
    Error(String),
    /// Anything else (timestamps, keep-alives, unknown types).
    Other,
}

impl ControlMessage {
    fn from_value(value: &Value) -> Self {
        let kind = value.get("type").and_then(Value::as_str);

        if kind == Some("chunk") {
            if let Some(data) = value.get("data").and_then(Value::as_str) {
                if !data.is_empty() {
                    return ControlMessage::Chunk(data.to_string());
                }
            }
        }

        // Error frames also carry `done: true`.
        if kind == Some("error") {
            let message = value
                .get("message")
                .or_else(|| value.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("Unknown TTS error");
            return ControlMessage::Error(message.to_string());
        }

        if value.get("done").and_then(Value::as_bool) == Some(true) || kind == Some("done") {
            return ControlMessage::Done;
        }

        ControlMessage::Other
    }
}

/// Classified content of one TTS frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsPayload {
    Control(Vec<ControlMessage>),
    Audio(Vec<u8>),
    Empty,
}

/// Decide whether a TTS frame is JSON control or raw audio, and parse it.
pub fn classify_frame(frame: TtsFrame) -> Result<TtsPayload, CodecError> {
    match frame {
        TtsFrame::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(TtsPayload::Empty);
            }
            parse_control(trimmed.as_bytes())
        }
        TtsFrame::Binary(bytes) => {
            if bytes.is_empty() {
                return Ok(TtsPayload::Empty);
            }
            let first = bytes.iter().find(|b| !b.is_ascii_whitespace());
            match first {
                Some(b'{') | Some(b'[') => parse_control(&bytes),
                _ => Ok(TtsPayload::Audio(bytes)),
            }
        }
    }
}

fn parse_control(bytes: &[u8]) -> Result<TtsPayload, CodecError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let messages = match &value {
        Value::Array(items) => items.iter().map(ControlMessage::from_value).collect(),
        other => vec![ControlMessage::from_value(other)],
    };
    Ok(TtsPayload::Control(messages))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_pcm(len: usize) -> Vec<u8> {
        let samples: Vec<i16> = (0..len).map(|i| ((i as f32 * 0.3).sin() * 8000.0) as i16).collect();
        samples_to_pcm(&samples)
    }

    #[test]
    fn test_decode_raw_pcm_payload() {
        let pcm = sine_pcm(32);
        let audio = decode_client_audio(&STANDARD.encode(&pcm)).unwrap();
        assert_eq!(audio.pcm, pcm);
        assert_eq!(audio.sample_rate, None);
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        assert!(matches!(decode_client_audio("not base64!!"), Err(CodecError::Base64(_))));
    }

    #[test]
    fn test_wav_payload_is_unwrapped() {
        let pcm = sine_pcm(160);
        let wav_bytes = wrap_wav(&pcm, 16000).unwrap();
        assert!(wav_bytes.starts_with(RIFF_MAGIC));

        let audio = decode_client_audio(&STANDARD.encode(&wav_bytes)).unwrap();
        assert_eq!(audio.pcm, pcm);
        assert_eq!(audio.sample_rate, Some(16000));
    }

    #[test]
    fn test_odd_length_pcm_rejected() {
        assert!(matches!(pcm_to_samples(&[1, 2, 3]), Err(CodecError::OddLength(3))));
    }

    #[test]
    fn test_encoder_raw_container() {
        let encoder = AudioEncoder::new(24000, "pcm_s16le", Container::Raw);
        let event = encoder.encode_pcm(&[1, 0, 2, 0]).unwrap().unwrap();
        assert_eq!(
            event,
            ServerEvent::AudioChunk {
                audio: STANDARD.encode([1u8, 0, 2, 0]),
                sample_rate: 24000,
                encoding: "pcm_s16le".into(),
                container: None,
            }
        );
        assert_eq!(encoder.encode_pcm(&[]).unwrap(), None);
        assert_eq!(encoder.encode_base64("").unwrap(), None);
    }

    #[test]
    fn test_encoder_wav_container_wraps_each_chunk() {
        let encoder = AudioEncoder::new(24000, "pcm_s16le", Container::Wav);
        let pcm = sine_pcm(48);
        let event = encoder.encode_base64(&STANDARD.encode(&pcm)).unwrap().unwrap();

        let ServerEvent::AudioChunk { audio, container, .. } = event else {
            panic!("expected audio chunk");
        };
        assert_eq!(container.as_deref(), Some("wav"));
        let (unwrapped, rate) = unwrap_wav(&STANDARD.decode(audio).unwrap()).unwrap();
        assert_eq!(unwrapped, pcm);
        assert_eq!(rate, 24000);
    }

    #[test]
    fn test_classify_binary_frames() {
        let audio = classify_frame(TtsFrame::Binary(vec![0x10, 0x00, 0x7b])).unwrap();
        assert_eq!(audio, TtsPayload::Audio(vec![0x10, 0x00, 0x7b]));

        let json = classify_frame(TtsFrame::Binary(b"  {\"type\":\"done\",\"done\":true}".to_vec())).unwrap();
        assert_eq!(json, TtsPayload::Control(vec![ControlMessage::Done]));

        assert_eq!(classify_frame(TtsFrame::Binary(Vec::new())).unwrap(), TtsPayload::Empty);
    }

    #[test]
    fn test_classify_text_frames() {
        let chunk = classify_frame(TtsFrame::Text(r#"{"type":"chunk","data":"AAEC","done":false}"#.into())).unwrap();
        assert_eq!(chunk, TtsPayload::Control(vec![ControlMessage::Chunk("AAEC".into())]));

        let error = classify_frame(TtsFrame::Text(r#"{"type":"error","message":"quota"}"#.into())).unwrap();
        assert_eq!(error, TtsPayload::Control(vec![ControlMessage::Error("quota".into())]));

        let terminal_error = classify_frame(TtsFrame::Text(
            r#"{"type":"error","context_id":"c","status_code":400,"done":true,"error":"Invalid voice id"}"#.into(),
        ))
        .unwrap();
        assert_eq!(
            terminal_error,
            TtsPayload::Control(vec![ControlMessage::Error("Invalid voice id".into())])
        );

        let batch = classify_frame(TtsFrame::Text(
            r#"[{"type":"timestamps"},{"type":"chunk","data":"AA"},{"done":true}]"#.into(),
        ))
        .unwrap();
        assert_eq!(
            batch,
            TtsPayload::Control(vec![
                ControlMessage::Other,
                ControlMessage::Chunk("AA".into()),
                ControlMessage::Done,
            ])
        );

        assert_eq!(classify_frame(TtsFrame::Text("   ".into())).unwrap(), TtsPayload::Empty);
        assert!(classify_frame(TtsFrame::Text("not json".into())).is_err());
    }
}
