//! # Response Synthesis Pipeline
//!
//! Turns one finalized utterance into an assistant reply and streams the
//! synthesized audio back to the client.
//!
//! ## Steps of one run:
//! 1. Echo `user_text` and record the user turn
//! 2. Ask the language model for a reply over the conversation context
//! 3. Record the assistant turn and send `assistant_text`
//! 4. Open a TTS stream and relay its audio as `audio_chunk` events
//! 5. Send exactly one `audio_end` and release the TTS stream
//!
//! Runs are serialized by [`run_worker`]: one queue per session, one run in
//! flight at a time, in the order utterances were finalized.

use super::conversation::{Conversation, Turn};
use super::messages::ServerEvent;
use super::{emit, wait_closed, ClientSink, SessionServices, SessionSettings};
use crate::audio::codec::{self, ControlMessage, TtsPayload};
use crate::providers::{
    LanguageModel, SynthesisRequest, TextToSpeech, TtsCompletion, TtsFrame, TtsSignal,
};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const LLM_FAILURE_MESSAGE: &str = "Failed to generate response";
pub const TTS_FAILURE_MESSAGE: &str = "Failed to synthesize speech";

/// How one pipeline run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Reply spoken; `chunks` audio events relayed before completion.
    Spoken { chunks: usize, completion: TtsCompletion },
    /// The model answered with nothing to say.
    Silent,
    LlmFailed,
    SynthesisFailed,
}

pub struct ResponsePipeline {
    sink: Arc<dyn ClientSink>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    settings: Arc<SessionSettings>,
    conversation: Conversation,
}

impl ResponsePipeline {
    pub fn new(
        sink: Arc<dyn ClientSink>,
        services: &SessionServices,
        settings: Arc<SessionSettings>,
    ) -> Self {
        let conversation = Conversation::new(settings.system_prompt.clone())
            .with_context_window(settings.max_context_turns);
        Self {
            sink,
            llm: services.llm.clone(),
            tts: services.tts.clone(),
            settings,
            conversation,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub async fn run(&mut self, utterance: String) -> PipelineOutcome {
        self.emit(ServerEvent::UserText { text: utterance.clone() });
        self.conversation.push(Turn::user(utterance));

        let reply = match self
            .llm
            .complete(&self.settings.llm_model, &self.conversation.context())
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                error!("Language model request failed: {}", err);
                self.emit(ServerEvent::server_error(LLM_FAILURE_MESSAGE));
                return PipelineOutcome::LlmFailed;
            }
        };

        let reply = reply.trim();
        if reply.is_empty() {
            debug!("Language model returned an empty reply");
            return PipelineOutcome::Silent;
        }

        self.conversation.push(Turn::assistant(reply));
        self.emit(ServerEvent::AssistantText { text: reply.to_string() });

        self.speak(reply.to_string()).await
    }

    async fn speak(&self, text: String) -> PipelineOutcome {
        let request = SynthesisRequest {
            model: self.settings.tts_model.clone(),
            text,
            voice: self.settings.voice_id.clone(),
        };

        let mut stream = match self.tts.synthesize(request).await {
            Ok(stream) => stream,
            Err(err) => {
                error!("Failed to start speech synthesis: {}", err);
                self.emit(ServerEvent::server_error(TTS_FAILURE_MESSAGE));
                self.emit(ServerEvent::AudioEnd);
                return PipelineOutcome::SynthesisFailed;
            }
        };

        let mut chunks = 0;
        let completion = loop {
            match stream.next_signal().await {
                TtsSignal::Frame(frame) => {
                    if let Some(completion) = self.relay_frame(frame, &mut chunks) {
                        break completion;
                    }
                }
                TtsSignal::Finished(completion) => break completion,
            }
        };

        match &completion {
            TtsCompletion::Done => debug!("Synthesis finished after {} chunks", chunks),
            TtsCompletion::Aborted => info!("Synthesis aborted after {} chunks", chunks),
            TtsCompletion::TransportClosed => {
                warn!("TTS transport closed after {} chunks", chunks)
            }
            TtsCompletion::Error(message) => {
                error!("TTS stream error: {}", message);
                self.emit(ServerEvent::server_error(TTS_FAILURE_MESSAGE));
            }
        }

        // audio_end is always the last event of a run that reached synthesis.
        self.emit(ServerEvent::AudioEnd);
        stream.release();

        PipelineOutcome::Spoken { chunks, completion }
    }

    /// Relay one frame; returns a completion when the frame carries one.
    fn relay_frame(&self, frame: TtsFrame, chunks: &mut usize) -> Option<TtsCompletion> {
        let payload = match codec::classify_frame(frame) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Failed to process TTS chunk: {}", err);
                return None;
            }
        };

        let encoder = &self.settings.encoder;
        match payload {
            TtsPayload::Empty => None,
            TtsPayload::Audio(pcm) => {
                self.relay_audio(encoder.encode_pcm(&pcm), chunks);
                None
            }
            TtsPayload::Control(messages) => {
                for message in messages {
                    match message {
                        ControlMessage::Chunk(data) => {
                            self.relay_audio(encoder.encode_base64(&data), chunks)
                        }
                        ControlMessage::Done => return Some(TtsCompletion::Done),
                        ControlMessage::Error(message) => {
                            return Some(TtsCompletion::Error(message))
                        }
                        ControlMessage::Other => {}
                    }
                }
                None
            }
        }
    }

    fn relay_audio(
        &self,
        encoded: Result<Option<ServerEvent>, codec::CodecError>,
        chunks: &mut usize,
    ) {
        match encoded {
            Ok(Some(event)) => {
                *chunks += 1;
                self.emit(event);
            }
            Ok(None) => {}
            Err(err) => warn!("Failed to encode TTS audio: {}", err),
        }
    }

    fn emit(&self, event: ServerEvent) {
        emit(self.sink.as_ref(), event);
    }
}

/// Serialized processing queue of one session.
///
/// Takes utterances in order and runs them one at a time. A failing or
/// panicking run is logged and the next utterance still runs. Once the
/// session is closed no further utterances are taken; a run already in
/// flight is left to finish on its own.
pub async fn run_worker(
    mut pipeline: ResponsePipeline,
    mut utterances: mpsc::UnboundedReceiver<String>,
    mut closed: watch::Receiver<bool>,
) -> ResponsePipeline {
    let mut seq: u64 = 0;

    loop {
        let utterance = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            next = utterances.recv() => match next {
                Some(utterance) => utterance,
                None => break,
            },
        };

        seq += 1;
        let span = info_span!("utterance", seq);
        let result = AssertUnwindSafe(pipeline.run(utterance))
            .catch_unwind()
            .instrument(span)
            .await;

        match result {
            Ok(outcome) => debug!("Utterance {} finished: {:?}", seq, outcome),
            Err(_) => error!("Utterance {} panicked, continuing with the next one", seq),
        }
    }

    debug!("Response queue stopped after {} utterances", seq);
    pipeline
}
