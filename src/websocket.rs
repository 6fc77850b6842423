//! # WebSocket Session Event Stream
//!
//! Pushes every session event to connected UIs and accepts the same commands
//! the REST API offers. Clients connect to `/ws/events`.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the server immediately sends a `snapshot` with the full
//!    session view
//! 2. **Events**: every session event is forwarded as JSON, tagged by `type`
//!    (`status`, `ready`, `bot_talking`, `user_speaking`, `transcript`,
//!    `metrics`, `mic_enabled`, `device_selected`, `devices_updated`, `timer`,
//!    `error`)
//! 3. **Commands**: the client may send `connect`, `disconnect`, `set_mic`,
//!    `toggle_mic`, `select_device`, `snapshot` or `ping`
//! 4. **Heartbeat**: the server pings every 30 seconds and drops clients that
//!    stay silent for 60
//!
//! ## Key Rust Concepts Used:
//! - **Actor model**: each connection is an `actix` actor; session callbacks
//!   run on other threads and reach it only through `Addr::do_send`
//! - **Ownership across tasks**: async commands clone the `Arc<VoiceSession>`
//!   into a spawned future instead of borrowing the actor

use crate::events::ListenerId;
use crate::session::{SessionEvent, SessionView};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Commands accepted from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Connect {
        #[serde(default)]
        language: Option<String>,
    },
    Disconnect,
    SetMic {
        enabled: bool,
    },
    ToggleMic,
    SelectDevice {
        device_id: Option<String>,
    },
    Snapshot,
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
}

impl ClientCommand {
    fn name(&self) -> &'static str {
        match self {
            ClientCommand::Connect { .. } => "connect",
            ClientCommand::Disconnect => "disconnect",
            ClientCommand::SetMic { .. } => "set_mic",
            ClientCommand::ToggleMic => "toggle_mic",
            ClientCommand::SelectDevice { .. } => "select_device",
            ClientCommand::Snapshot => "snapshot",
            ClientCommand::Ping { .. } => "ping",
        }
    }
}

/// Replies that are not session events.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot { session: SessionView },
    Pong { timestamp: u64 },
    CommandError {
        command: String,
        kind: String,
        message: String,
    },
}

impl ServerMessage {
    fn command_error(command: &str, kind: &str, message: impl Into<String>) -> Self {
        ServerMessage::CommandError {
            command: command.to_string(),
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

/// Pre-serialized frame for the client.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

impl SendText {
    fn json<T: Serialize>(value: &T) -> Option<Self> {
        match serde_json::to_string(value) {
            Ok(json) => Some(SendText(json)),
            Err(e) => {
                error!("Failed to serialize outbound frame: {}", e);
                None
            }
        }
    }
}

/// One connected UI.
///
/// ## Fields:
/// - `state`: shared app state; the session lives here
/// - `listeners`: session subscriptions, removed when the actor stops
/// - `last_heartbeat`: last time the client proved it is alive
pub struct SessionEventStream {
    state: web::Data<AppState>,
    listeners: Vec<ListenerId>,
    last_heartbeat: Instant,
}

impl SessionEventStream {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            listeners: Vec::new(),
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, message: &ServerMessage, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(SendText(json)) = SendText::json(message) {
            ctx.text(json);
        }
    }

    fn send_snapshot(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let session = self.state.session.snapshot();
        self.send(&ServerMessage::Snapshot { session }, ctx);
    }

    fn handle_command(&mut self, command: ClientCommand, ctx: &mut ws::WebsocketContext<Self>) {
        debug!(command = command.name(), "Event stream command");
        let session = self.state.session.clone();
        let addr = ctx.address();

        match command {
            ClientCommand::Ping { timestamp } => {
                self.last_heartbeat = Instant::now();
                self.send(&ServerMessage::Pong { timestamp }, ctx);
            }
            ClientCommand::Snapshot => self.send_snapshot(ctx),
            ClientCommand::SetMic { enabled } => {
                session.set_mic_enabled(enabled);
            }
            ClientCommand::ToggleMic => {
                session.toggle_mic();
            }
            ClientCommand::Connect { language } => {
                let Some(guard) = self.state.begin_connect() else {
                    let reply = ServerMessage::command_error(
                        "connect",
                        "conflict",
                        "A connect is already in progress",
                    );
                    self.send(&reply, ctx);
                    return;
                };
                let current = session.transport().state();
                if current.is_active() {
                    let message = format!("Session is already {}", current);
                    self.send(&ServerMessage::command_error("connect", "conflict", message), ctx);
                    return;
                }
                let language = language
                    .filter(|l| !l.trim().is_empty())
                    .unwrap_or_else(|| self.state.default_language());
                // Failures also reach the client as an `error` session event.
                actix::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = session.connect(Some(language)).await {
                        let reply = ServerMessage::command_error("connect", e.kind(), e.to_string());
                        if let Some(msg) = SendText::json(&reply) {
                            addr.do_send(msg);
                        }
                    }
                });
            }
            ClientCommand::Disconnect => {
                actix::spawn(async move {
                    if let Err(e) = session.end_session().await {
                        warn!(error = %e, "Disconnect from event stream failed");
                    }
                });
            }
            ClientCommand::SelectDevice { device_id } => {
                actix::spawn(async move {
                    if let Err(e) = session.select_device(device_id.as_deref()).await {
                        let reply =
                            ServerMessage::command_error("select_device", e.kind(), e.to_string());
                        if let Some(msg) = SendText::json(&reply) {
                            addr.do_send(msg);
                        }
                    }
                });
            }
        }
    }
}

impl Actor for SessionEventStream {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Event stream connected");
        self.state.stream_opened();

        let addr = ctx.address();
        self.listeners = self.state.session.on_any(move |event: &SessionEvent| {
            if let Some(msg) = SendText::json(event) {
                addr.do_send(msg);
            }
        });

        self.send_snapshot(ctx);

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Event stream heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        for id in self.listeners.drain(..) {
            self.state.session.off(id);
        }
        self.state.stream_closed();
        info!("Event stream disconnected");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionEventStream {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => self.handle_command(command, ctx),
                Err(e) => {
                    debug!("Unparseable event stream command: {}", e);
                    let reply = ServerMessage::command_error("unknown", "bad_request", e.to_string());
                    self.send(&reply, ctx);
                }
            },
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!("Event stream closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Binary(_)) => {
                let reply = ServerMessage::command_error("binary", "bad_request", "Binary frames are not supported");
                self.send(&reply, ctx);
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for SessionEventStream {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// Upgrade `GET /ws/events` to a session event stream.
pub async fn ws_events(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New event stream request from: {:?}", req.connection_info().peer_addr());
    ws::start(SessionEventStream::new(state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_command_parsing() {
        let command: ClientCommand =
            serde_json::from_str(r#"{"type": "connect", "language": "ta"}"#).unwrap();
        match command {
            ClientCommand::Connect { language } => assert_eq!(language.as_deref(), Some("ta")),
            other => panic!("Wrong command: {:?}", other),
        }

        let command: ClientCommand = serde_json::from_str(r#"{"type": "connect"}"#).unwrap();
        assert!(matches!(command, ClientCommand::Connect { language: None }));

        let command: ClientCommand =
            serde_json::from_str(r#"{"type": "select_device", "device_id": null}"#).unwrap();
        assert!(matches!(command, ClientCommand::SelectDevice { device_id: None }));
        assert_eq!(command.name(), "select_device");

        assert!(serde_json::from_str::<ClientCommand>(r#"{"type": "dance"}"#).is_err());
    }

    #[test]
    fn test_server_message_shape() {
        let json = serde_json::to_value(ServerMessage::command_error(
            "connect",
            "no_local_track",
            "No local audio track available",
        ))
        .unwrap();
        assert_eq!(json["type"], "command_error");
        assert_eq!(json["kind"], "no_local_track");

        let json = serde_json::to_value(ServerMessage::Pong { timestamp: 7 }).unwrap();
        assert_eq!(json["type"], "pong");
        assert_eq!(json["timestamp"], 7);
    }

    #[test]
    fn test_session_events_forward_as_tagged_json() {
        let frame = SendText::json(&SessionEvent::BotTalking { talking: true }).unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame.0).unwrap();
        assert_eq!(json["type"], "bot_talking");
        assert_eq!(json["talking"], true);
    }
}
