//! In-memory collaborators for session tests.

use super::messages::ServerEvent;
use super::{ClientSink, SessionServices, SessionSettings, SinkError};
use crate::config::AppConfig;
use crate::providers::{
    LanguageModel, ProviderError, SpeechToText, SttStream, SynthesisRequest, TextToSpeech,
    TranscriptEvent, TranscriptSubscription, TtsEvent, TtsFrame, TtsStream,
};
use crate::session::conversation::Turn;
use crate::state::ServiceFactory;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub fn test_settings() -> SessionSettings {
    let mut settings = SessionSettings::from_config(&AppConfig::default(), "You are a test agent.");
    settings.stt_connect_timeout = Duration::from_millis(500);
    settings.tts_connect_timeout = Duration::from_millis(500);
    settings.finalize_grace = Duration::from_millis(100);
    settings
}

pub fn services(
    stt: Option<Arc<MockStt>>,
    tts: Option<Arc<MockTts>>,
    llm: Option<Arc<MockLlm>>,
) -> SessionServices {
    SessionServices {
        stt: stt.unwrap_or_else(|| Arc::new(MockStt::new())),
        tts: tts.unwrap_or_else(|| Arc::new(MockTts::scripted(vec![]))),
        llm: llm.unwrap_or_else(|| Arc::new(MockLlm::replying(["ok"]))),
    }
}

/// Factory handing every new session default mocks.
pub fn service_factory() -> ServiceFactory {
    Arc::new(|| Ok::<_, ProviderError>(services(None, None, None)))
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ServerEvent>>,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ClientSink for RecordingSink {
    fn send(&self, event: ServerEvent) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// What happened to one STT stream handle.
#[derive(Default)]
pub struct SttRecord {
    sent: Mutex<Vec<Vec<u8>>>,
    finalized: AtomicUsize,
    disconnected: AtomicUsize,
    events: Mutex<Option<mpsc::UnboundedSender<TranscriptEvent>>>,
}

impl SttRecord {
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn finalized(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }

    pub fn disconnected(&self) -> usize {
        self.disconnected.load(Ordering::SeqCst)
    }
}

pub struct MockStt {
    records: Mutex<Vec<Arc<SttRecord>>>,
    connect_results: Arc<Mutex<VecDeque<bool>>>,
    failing_sends: Arc<AtomicUsize>,
}

impl MockStt {
    pub fn new() -> Self {
        Self::with_connect_results(vec![])
    }

    pub fn failing() -> Self {
        Self::with_connect_results(vec![false])
    }

    /// Scripted connect outcomes in stream order; later streams connect.
    pub fn with_connect_results(results: Vec<bool>) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            connect_results: Arc::new(Mutex::new(results.into())),
            failing_sends: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `count` sends on any connected stream fail.
    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn record(&self, index: usize) -> Arc<SttRecord> {
        self.records.lock().unwrap()[index].clone()
    }

    /// Push a transcript event out of stream `index`.
    pub fn emit(&self, index: usize, event: TranscriptEvent) {
        let record = self.record(index);
        let sender = record.events.lock().unwrap();
        if let Some(sender) = sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

impl SpeechToText for MockStt {
    fn stream(&self) -> Box<dyn SttStream> {
        let record = Arc::new(SttRecord::default());
        let (tx, rx) = mpsc::unbounded_channel();
        *record.events.lock().unwrap() = Some(tx);
        self.records.lock().unwrap().push(record.clone());

        Box::new(MockSttStream {
            record,
            subscription: Some(rx),
            connect_results: self.connect_results.clone(),
            failing_sends: self.failing_sends.clone(),
            connected: false,
        })
    }
}

struct MockSttStream {
    record: Arc<SttRecord>,
    subscription: Option<TranscriptSubscription>,
    connect_results: Arc<Mutex<VecDeque<bool>>>,
    failing_sends: Arc<AtomicUsize>,
    connected: bool,
}

#[async_trait]
impl SttStream for MockSttStream {
    async fn connect(&mut self) -> Result<(), ProviderError> {
        let succeed = self.connect_results.lock().unwrap().pop_front().unwrap_or(true);
        if !succeed {
            return Err(ProviderError::Connection("scripted failure".into()));
        }
        self.connected = true;
        Ok(())
    }

    fn subscribe(&mut self) -> Result<TranscriptSubscription, ProviderError> {
        self.subscription.take().ok_or(ProviderError::Closed)
    }

    async fn send(&mut self, audio: Vec<u8>) -> Result<(), ProviderError> {
        if !self.connected {
            return Err(ProviderError::NotConnected);
        }
        let scripted_failure = self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(ProviderError::Send("scripted send failure".into()));
        }
        self.record.sent.lock().unwrap().push(audio);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<(), ProviderError> {
        self.record.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ProviderError> {
        self.connected = false;
        self.record.disconnected.fetch_add(1, Ordering::SeqCst);
        self.record.events.lock().unwrap().take();
        Ok(())
    }
}

enum ScriptEnd {
    /// Leave the stream open until the connection is disconnected.
    Open,
    Done,
    Close,
}

/// Frames one synthesis request will produce.
pub struct TtsScript {
    events: Vec<TtsEvent>,
    delay: Option<Duration>,
    end: ScriptEnd,
}

impl TtsScript {
    pub fn events(events: Vec<TtsEvent>) -> Self {
        Self { events, delay: None, end: ScriptEnd::Open }
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Some(Duration::from_millis(ms));
        self
    }

    pub fn then_done(mut self) -> Self {
        self.end = ScriptEnd::Done;
        self
    }

    pub fn then_close(mut self) -> Self {
        self.end = ScriptEnd::Close;
        self
    }
}

type OpenContext = (mpsc::UnboundedSender<TtsEvent>, oneshot::Sender<()>);

pub struct MockTts {
    scripts: Mutex<VecDeque<TtsScript>>,
    requests: Mutex<Vec<SynthesisRequest>>,
    open: Arc<Mutex<Vec<OpenContext>>>,
    released: Arc<AtomicUsize>,
    disconnects: AtomicUsize,
    fail_connect: bool,
    fail_synthesis: bool,
}

impl MockTts {
    pub fn scripted(scripts: Vec<TtsScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            open: Arc::new(Mutex::new(Vec::new())),
            released: Arc::new(AtomicUsize::new(0)),
            disconnects: AtomicUsize::new(0),
            fail_connect: false,
            fail_synthesis: false,
        }
    }

    pub fn failing_connect() -> Self {
        Self { fail_connect: true, ..Self::scripted(vec![]) }
    }

    pub fn failing_synthesis() -> Self {
        Self { fail_synthesis: true, ..Self::scripted(vec![]) }
    }

    pub fn requests(&self) -> Vec<SynthesisRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextToSpeech for MockTts {
    async fn connect(&self) -> Result<(), ProviderError> {
        if self.fail_connect {
            return Err(ProviderError::Connection("scripted failure".into()));
        }
        Ok(())
    }

    async fn synthesize(&self, request: SynthesisRequest) -> Result<TtsStream, ProviderError> {
        self.requests.lock().unwrap().push(request);
        if self.fail_synthesis {
            return Err(ProviderError::NotConnected);
        }

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| TtsScript::events(vec![]).then_done());
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let released = self.released.clone();
        let open = self.open.clone();

        tokio::spawn(async move {
            for event in script.events {
                if let Some(delay) = script.delay {
                    tokio::time::sleep(delay).await;
                }
                let _ = tx.send(event);
            }
            match script.end {
                ScriptEnd::Open => open.lock().unwrap().push((tx, close_tx)),
                ScriptEnd::Done => {
                    let _ = tx.send(TtsEvent::Message(TtsFrame::Text(
                        r#"{"type":"done","done":true}"#.to_string(),
                    )));
                    open.lock().unwrap().push((tx, close_tx));
                }
                ScriptEnd::Close => {
                    let _ = close_tx.send(());
                }
            }
        });

        Ok(TtsStream::new(rx)
            .with_transport_close(close_rx)
            .with_release(move || {
                released.fetch_add(1, Ordering::SeqCst);
            }))
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        for (tx, _close) in self.open.lock().unwrap().drain(..) {
            let _ = tx.send(TtsEvent::Abort);
        }
        Ok(())
    }
}

pub struct MockLlm {
    replies: Mutex<VecDeque<Result<String, ()>>>,
    calls: Mutex<Vec<Vec<Turn>>>,
    delay: Option<Duration>,
}

impl MockLlm {
    pub fn replying<'a>(replies: impl IntoIterator<Item = &'a str>) -> Self {
        Self::scripted(replies.into_iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn failing() -> Self {
        Self::scripted(vec![Err(())])
    }

    /// Replies in call order; the last one repeats.
    pub fn scripted(replies: Vec<Result<String, ()>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Some(Duration::from_millis(ms));
        self
    }

    pub fn calls(&self) -> Vec<Vec<Turn>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for MockLlm {
    async fn complete(&self, _model: &str, turns: &[Turn]) -> Result<String, ProviderError> {
        self.calls.lock().unwrap().push(turns.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front()
            } else {
                replies.front().cloned()
            }
        };

        match reply {
            Some(Ok(text)) => Ok(text),
            Some(Err(())) | None => Err(ProviderError::Request("scripted failure".into())),
        }
    }
}
