//! # WebSocket Voice Channel
//!
//! Browser clients connect to `/ws/audio`; each connection is one voice
//! session.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the upgrade is refused with 503 when the server is full
//! 2. **Startup**: STT and TTS connect in the background; a failure produces
//!    a `server-error` event and the server closes the channel
//! 3. **Audio**: `audio_chunk` JSON messages (base64 PCM) or binary frames
//!    (raw PCM), followed by `audio_end` once the user stops talking
//! 4. **Replies**: transcripts, assistant text and synthesized audio flow
//!    back as JSON events (see `session::messages`)
//!
//! ## Actor Model:
//! The actor only moves frames. Every inbound message is pushed onto the
//! session's inbox and handled in order by the session task; the session
//! talks back through [`ActorSink`], which forwards events to the actor's
//! mailbox.

use crate::error::{AppError, AppResult};
use crate::session::messages::{ClientMessage, ServerEvent};
use crate::session::orchestrator::CONNECT_FAILURE_MESSAGE;
use crate::session::{emit, AudioPayload, ClientSink, Session, SessionInput, SinkError};
use crate::state::{AppState, SessionPermit};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Server event to deliver to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct Outbound(ServerEvent);

/// Close the channel from the server side.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseChannel;

/// [`ClientSink`] backed by the WebSocket actor's mailbox.
pub struct ActorSink {
    addr: Addr<AudioWebSocket>,
}

impl ClientSink for ActorSink {
    fn send(&self, event: ServerEvent) -> Result<(), SinkError> {
        if !self.addr.connected() {
            return Err(SinkError::Closed);
        }
        self.addr.do_send(Outbound(event));
        Ok(())
    }

    fn close(&self) {
        self.addr.do_send(CloseChannel);
    }
}

/// WebSocket actor for one voice session.
pub struct AudioWebSocket {
    session_id: Uuid,

    /// Session construction inputs, consumed when the actor starts
    state: web::Data<AppState>,

    /// Inbox of the running session task
    inbox: Option<mpsc::UnboundedSender<SessionInput>>,

    /// Last ping/pong/message seen from the client
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,

    /// Admission slot, freed when the actor is dropped
    _permit: SessionPermit,
}

impl AudioWebSocket {
    pub fn new(state: web::Data<AppState>, permit: SessionPermit) -> Self {
        let server = &state.config.server;
        let heartbeat_interval = Duration::from_secs(server.heartbeat_interval_secs);
        let client_timeout = Duration::from_secs(server.client_timeout_secs);

        Self {
            session_id: Uuid::new_v4(),
            state,
            inbox: None,
            last_heartbeat: Instant::now(),
            heartbeat_interval,
            client_timeout,
            _permit: permit,
        }
    }

    /// Hand an input to the session task. Inputs after the session ended are dropped.
    fn forward(&self, input: SessionInput) {
        if let Some(inbox) = &self.inbox {
            if inbox.send(input).is_err() {
                debug!("Session {} already finished, dropping input", self.session_id);
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::AudioChunk { audio: Some(audio) }) => {
                self.forward(SessionInput::Audio(AudioPayload::Base64(audio)));
            }
            Ok(ClientMessage::AudioChunk { audio: None }) => {
                debug!("audio_chunk without audio payload ignored");
            }
            Ok(ClientMessage::AudioEnd) => self.forward(SessionInput::AudioEnd),
            Ok(ClientMessage::Unknown) => debug!("Ignoring unknown client message type"),
            Err(err) => warn!("Malformed client message ignored: {}", err),
        }
    }

    /// Ping the client and drop it once it has been silent too long.
    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!("WebSocket heartbeat timeout for session {}, closing", act.session_id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for AudioWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket connection started for session {}", self.session_id);
        self.heartbeat(ctx);

        let services = match self.state.session_services() {
            Ok(services) => services,
            Err(err) => {
                error!("Failed to construct voice services: {}", err);
                let sink = ActorSink { addr: ctx.address() };
                emit(&sink, ServerEvent::server_error(CONNECT_FAILURE_MESSAGE));
                sink.close();
                return;
            }
        };

        let (inbox, inputs) = mpsc::unbounded_channel();
        let sink: Arc<dyn ClientSink> = Arc::new(ActorSink { addr: ctx.address() });
        let session = Session::new(self.session_id, sink, services, self.state.session_settings());

        tokio::spawn(session.run(inputs));
        self.inbox = Some(inbox);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("WebSocket connection stopped for session {}", self.session_id);
        self.forward(SessionInput::Closed);
        self.inbox = None;
    }
}

/// Handle incoming WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.forward(SessionInput::Audio(AudioPayload::Raw(data.to_vec())));
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Client closed session {}: {:?}", self.session_id, reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Fragmented frames are not supported, ignoring");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error on session {}: {}", self.session_id, err);
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!("Client stream ended for session {}", self.session_id);
        ctx.stop();
    }
}

impl Handler<Outbound> for AudioWebSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match serde_json::to_string(&msg.0) {
            Ok(json) => ctx.text(json),
            Err(err) => error!("Failed to serialize {} event: {}", msg.0.kind(), err),
        }
    }
}

impl Handler<CloseChannel> for AudioWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseChannel, ctx: &mut Self::Context) {
        info!("Closing session {} from the server side", self.session_id);
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Error,
            description: Some("voice services unavailable".to_string()),
        }));
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Admission is checked before the handshake so a full server answers with a
/// plain 503 JSON error instead of accepting and immediately closing.
pub async fn ws_audio(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    debug!("WebSocket upgrade request from {:?}", req.connection_info().peer_addr());

    let Some(permit) = state.try_acquire_session() else {
        let limit = state.config.performance.max_concurrent_sessions;
        warn!("Rejecting voice session, {} sessions already active", limit);
        return Err(AppError::ServiceUnavailable(format!(
            "Maximum concurrent sessions ({}) reached",
            limit
        )));
    };

    let response = ws::start(AudioWebSocket::new(state, permit), &req, stream)?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::session::testing;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};

    fn app_state(limit: usize) -> AppState {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = limit;
        AppState::with_services(config, "prompt", testing::service_factory())
    }

    fn upgrade_request() -> test::TestRequest {
        test::TestRequest::get()
            .uri("/ws/audio")
            .insert_header(("upgrade", "websocket"))
            .insert_header(("connection", "upgrade"))
            .insert_header(("sec-websocket-version", "13"))
            .insert_header(("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="))
    }

    #[actix_web::test]
    async fn test_upgrade_switches_protocols() {
        let state = app_state(2);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/audio", web::get().to(ws_audio)),
        )
        .await;

        let response = test::call_service(&app, upgrade_request().to_request()).await;
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(state.get_metrics_snapshot().total_sessions, 1);
    }

    #[actix_web::test]
    async fn test_upgrade_refused_at_capacity() {
        let state = app_state(1);
        let _held = state.try_acquire_session().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/audio", web::get().to(ws_audio)),
        )
        .await;

        let response = test::call_service(&app, upgrade_request().to_request()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: serde_json::Value = test::read_body_json(response).await;
        assert_eq!(body["error"]["type"], "service_unavailable");
        assert_eq!(state.get_metrics_snapshot().rejected_sessions, 1);
    }

    #[actix_web::test]
    async fn test_plain_get_is_a_bad_request_and_frees_its_slot() {
        let state = app_state(1);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws/audio", web::get().to(ws_audio)),
        )
        .await;

        let req = test::TestRequest::get().uri("/ws/audio").to_request();
        let response = test::call_service(&app, req).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }
}
