//! Translates STT transcript events into client events.
//!
//! An aggregator lives exactly as long as one STT stream. A restarted stream
//! gets a fresh aggregator, so nothing recognized before a restart can leak
//! into the next utterance.

use super::messages::ServerEvent;
use crate::providers::TranscriptEvent;

const UNKNOWN_STT_ERROR: &str = "Unknown STT error";

/// What the session should do with one transcript event.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptOutcome {
    /// Event to forward to the client.
    pub event: ServerEvent,
    /// Finalized, trimmed, non-empty utterance ready for a pipeline run.
    pub utterance: Option<String>,
}

#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    interim_count: usize,
    final_count: usize,
    utterance_count: usize,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, event: TranscriptEvent) -> TranscriptOutcome {
        match event {
            TranscriptEvent::Transcript { text, is_final: false } => {
                self.interim_count += 1;
                TranscriptOutcome {
                    event: ServerEvent::SttInterim { text },
                    utterance: None,
                }
            }
            TranscriptEvent::Transcript { text, is_final: true } => {
                self.final_count += 1;
                let trimmed = text.trim();
                let utterance = if trimmed.is_empty() {
                    None
                } else {
                    self.utterance_count += 1;
                    Some(trimmed.to_string())
                };
                TranscriptOutcome {
                    event: ServerEvent::SttFinal { text },
                    utterance,
                }
            }
            TranscriptEvent::Error { message } => {
                let message = if message.is_empty() {
                    UNKNOWN_STT_ERROR.to_string()
                } else {
                    message
                };
                TranscriptOutcome {
                    event: ServerEvent::SttError { message },
                    utterance: None,
                }
            }
        }
    }

    /// (interim, final, utterance) counts seen by this aggregator.
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.interim_count, self.final_count, self.utterance_count)
    }
}
