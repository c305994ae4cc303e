//! # Session Orchestrator
//!
//! Drives one client channel from open to teardown.
//!
//! ## Lifecycle:
//! 1. **Open**: connect a fresh STT stream and the TTS connection concurrently;
//!    if either fails the client gets one `server-error` and the channel is closed
//! 2. **Active**: client input is handled strictly in arrival order
//!    - `audio_chunk` is forwarded to the live STT stream, or dropped if none
//!    - `audio_end` finalizes the live stream and immediately opens a new one
//! 3. **Teardown**: runs once, disconnects the live STT stream and the TTS connection
//!
//! ## Tasks per session:
//! - the session task itself (this module), consuming `SessionInput`
//! - one transcript relay per STT stream, feeding the client and the queue
//! - one response worker (`pipeline::run_worker`) draining the queue
//! - short-lived retire tasks that disconnect finalized STT streams
//!
//! Every task watches the same `closed` flag, so nothing reaches the client
//! from a stream after teardown.

use super::pipeline::{run_worker, ResponsePipeline};
use super::transcript::TranscriptAggregator;
use super::{emit, wait_closed, ClientSink, SessionServices, SessionSettings};
use crate::audio::codec::{self, ClientAudio, CodecError};
use crate::providers::{ProviderError, SpeechToText, SttStream, TranscriptSubscription};
use crate::session::messages::ServerEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CONNECT_FAILURE_MESSAGE: &str = "Failed to connect to voice services";
pub const RESTART_FAILURE_MESSAGE: &str = "Failed to restart speech recognition";

/// Audio received from the client channel.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioPayload {
    /// `audio` field of a JSON `audio_chunk` message.
    Base64(String),
    /// Binary WebSocket frame.
    Raw(Vec<u8>),
}

/// Input delivered to a session, in channel order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Audio(AudioPayload),
    AudioEnd,
    /// The client channel closed or failed.
    Closed,
}

/// A connected STT stream and the task relaying its transcripts.
struct LiveStt {
    seq: u64,
    stream: Box<dyn SttStream>,
    relay: JoinHandle<()>,
}

/// Everything needed to open a fresh STT stream, detached from the session
/// so connecting does not borrow it.
#[derive(Clone)]
struct StreamFactory {
    stt: Arc<dyn SpeechToText>,
    connect_timeout: Duration,
    sink: Arc<dyn ClientSink>,
    utterances: mpsc::UnboundedSender<String>,
    closed: watch::Receiver<bool>,
}

impl StreamFactory {
    /// Connect a new stream and start relaying its transcripts.
    async fn open(self, seq: u64) -> Result<LiveStt, ProviderError> {
        let mut stream = self.stt.stream();

        let connected = match timeout(self.connect_timeout, stream.connect()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout("STT connect".to_string())),
        };
        let subscription = connected.and_then(|_| stream.subscribe());

        let events = match subscription {
            Ok(events) => events,
            Err(err) => {
                if let Err(disconnect_err) = stream.disconnect().await {
                    debug!("Disconnect after failed STT connect: {}", disconnect_err);
                }
                return Err(err);
            }
        };

        let relay = tokio::spawn(
            relay_transcripts(seq, events, self.sink, self.utterances, self.closed)
                .in_current_span(),
        );

        debug!("STT stream {} connected", seq);
        Ok(LiveStt { seq, stream, relay })
    }
}

pub struct Session {
    id: Uuid,
    sink: Arc<dyn ClientSink>,
    services: SessionServices,
    settings: Arc<SessionSettings>,
    stt: Option<LiveStt>,
    stream_seq: u64,
    streams: StreamFactory,
    queue: Option<(ResponsePipeline, mpsc::UnboundedReceiver<String>)>,
    closed: bool,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    pub fn new(
        id: Uuid,
        sink: Arc<dyn ClientSink>,
        services: SessionServices,
        settings: Arc<SessionSettings>,
    ) -> Self {
        let (utterances, queue) = mpsc::unbounded_channel();
        let (closed_tx, closed) = watch::channel(false);
        let pipeline = ResponsePipeline::new(sink.clone(), &services, settings.clone());
        let streams = StreamFactory {
            stt: services.stt.clone(),
            connect_timeout: settings.stt_connect_timeout,
            sink: sink.clone(),
            utterances,
            closed,
        };

        Self {
            id,
            sink,
            services,
            settings,
            stt: None,
            stream_seq: 0,
            streams,
            queue: Some((pipeline, queue)),
            closed: false,
            closed_tx,
        }
    }

    /// Run the session until its channel closes.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionInput>) {
        let span = info_span!("session", id = %self.id);

        async move {
            info!("Voice session opened");

            if let Some((pipeline, queue)) = self.queue.take() {
                tokio::spawn(
                    run_worker(pipeline, queue, self.closed_tx.subscribe()).in_current_span(),
                );
            }

            if let Err(err) = self.start().await {
                error!("Failed to connect to voice services: {}", err);
                self.emit(ServerEvent::server_error(CONNECT_FAILURE_MESSAGE));
                self.cleanup().await;
                self.sink.close();
                return;
            }

            while let Some(input) = inbox.recv().await {
                match input {
                    SessionInput::Audio(payload) => self.handle_audio_chunk(payload).await,
                    SessionInput::AudioEnd => self.handle_audio_end().await,
                    SessionInput::Closed => break,
                }
            }

            self.cleanup().await;
            info!("Voice session closed");
        }
        .instrument(span)
        .await
    }

    /// Connect the first STT stream and the TTS connection concurrently.
    ///
    /// A stream that connected while its sibling failed is kept so that
    /// teardown disconnects it.
    pub(crate) async fn start(&mut self) -> Result<(), ProviderError> {
        let seq = self.next_stream_seq();
        let tts = self.services.tts.clone();
        let tts_timeout = self.settings.tts_connect_timeout;
        let tts_connect = async move {
            match timeout(tts_timeout, tts.connect()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout("TTS connect".to_string())),
            }
        };

        let (stt, tts) = tokio::join!(self.streams.clone().open(seq), tts_connect);

        match stt {
            Ok(live) => self.stt = Some(live),
            Err(err) => return Err(err),
        }
        tts?;

        debug!("Voice services connected");
        Ok(())
    }

    pub(crate) async fn handle_audio_chunk(&mut self, payload: AudioPayload) {
        if self.closed {
            return;
        }

        let audio = match decode_payload(payload) {
            Ok(audio) => audio,
            Err(err) => {
                warn!("Ignoring undecodable audio chunk: {}", err);
                return;
            }
        };

        if audio.pcm.is_empty() {
            return;
        }

        if let Some(rate) = audio.sample_rate {
            if rate != self.settings.stt_sample_rate {
                warn!(
                    "Client WAV is {} Hz, STT expects {} Hz",
                    rate, self.settings.stt_sample_rate
                );
            }
        }

        let Some(live) = self.stt.as_mut() else {
            debug!("No live STT stream, dropping {} bytes", audio.pcm.len());
            return;
        };

        if let Err(err) = live.stream.send(audio.pcm).await {
            error!("Failed to forward audio chunk to STT stream {}: {}", live.seq, err);
        }
    }

    pub(crate) async fn handle_audio_end(&mut self) {
        if self.closed {
            return;
        }

        if let Some(mut live) = self.stt.take() {
            if let Err(err) = live.stream.finalize().await {
                warn!("Failed to finalize STT stream {}: {}", live.seq, err);
            }
            self.retire(live);
        }

        let seq = self.next_stream_seq();
        match self.streams.clone().open(seq).await {
            Ok(live) => self.stt = Some(live),
            Err(err) => {
                error!("Failed to restart STT stream: {}", err);
                self.emit(ServerEvent::server_error(RESTART_FAILURE_MESSAGE));
            }
        }
    }

    /// Tear the session down. Only the first call has any effect.
    pub(crate) async fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.closed_tx.send_replace(true);

        if let Some(mut live) = self.stt.take() {
            if let Err(err) = live.stream.disconnect().await {
                warn!("Failed to disconnect STT stream {}: {}", live.seq, err);
            }
        }

        if let Err(err) = self.services.tts.disconnect().await {
            warn!("Failed to disconnect TTS connection: {}", err);
        }
    }

    /// Keep a finalized stream open long enough to deliver its trailing
    /// transcript, then disconnect it.
    fn retire(&self, live: LiveStt) {
        let grace = self.settings.finalize_grace;
        let mut closed = self.closed_tx.subscribe();

        tokio::spawn(
            async move {
                let LiveStt { seq, mut stream, relay } = live;
                tokio::select! {
                    _ = relay => debug!("STT stream {} ended after finalize", seq),
                    _ = tokio::time::sleep(grace) => {}
                    _ = wait_closed(&mut closed) => {}
                }
                if let Err(err) = stream.disconnect().await {
                    warn!("Failed to disconnect STT stream {}: {}", seq, err);
                }
            }
            .in_current_span(),
        );
    }

    fn next_stream_seq(&mut self) -> u64 {
        self.stream_seq += 1;
        self.stream_seq
    }

    fn emit(&self, event: ServerEvent) {
        emit(self.sink.as_ref(), event);
    }
}

fn decode_payload(payload: AudioPayload) -> Result<ClientAudio, CodecError> {
    match payload {
        AudioPayload::Base64(data) => codec::decode_client_audio(&data),
        AudioPayload::Raw(bytes) => codec::normalize_client_audio(bytes),
    }
}

/// Forward one STT stream's events to the client until the stream ends or
/// the session closes. Non-empty finals are queued for a pipeline run.
async fn relay_transcripts(
    seq: u64,
    mut events: TranscriptSubscription,
    sink: Arc<dyn ClientSink>,
    utterances: mpsc::UnboundedSender<String>,
    mut closed: watch::Receiver<bool>,
) {
    let mut aggregator = TranscriptAggregator::new();

    loop {
        let event = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let outcome = aggregator.handle(event);
        emit(sink.as_ref(), outcome.event);

        if let Some(utterance) = outcome.utterance {
            if utterances.send(utterance).is_err() {
                break;
            }
        }
    }

    let (interim, finals, queued) = aggregator.counts();
    debug!(
        "STT stream {} relay stopped ({} interim, {} final, {} queued)",
        seq, interim, finals, queued
    );
}
