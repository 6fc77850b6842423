//! # Event Protocol Client
//!
//! Turns raw control-channel frames into typed [`ProtocolEvent`]s and wraps
//! outbound intents in the protocol envelope.
//!
//! ## Wire Format:
//! ```json
//! { "label": "rtvi-ai", "type": "metrics", "data": { "ttfb": [...] } }
//! ```
//! Frames with another label, without a `type`, with a type this client does
//! not know, or with unusable `data` are logged and dropped. Nothing inbound
//! is ever propagated as an error.
//!
//! ## Key Rust Concepts Used:
//! - **serde defaults**: metrics series and figures may be missing or `null`
//!   on the wire and default to empty or zero
//! - **Weak references**: transport listeners hold a `Weak<ProtocolClient>`
//!   so the transport's listener table does not keep the client alive

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::events::{BusEvent, EventBus, ListenerId};
use crate::transport::{Transport, TransportEvent, TransportEventKind, TransportState};

/// Servers send `null` for figures they have not measured yet.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// One timing or usage figure reported by a pipeline processor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    #[serde(default, deserialize_with = "null_as_default")]
    pub processor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub processor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub prompt_tokens: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub completion_tokens: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_tokens: u64,
}

/// Latency and usage telemetry from the server. Each update replaces the
/// previous snapshot wholesale.
///
/// ## Fields:
/// - `ttfb`: time to first byte per processor, in seconds
/// - `processing`: processing time per processor, in seconds
/// - `tokens`: LLM token usage
/// - `characters`: TTS character counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(default, deserialize_with = "null_as_default")]
    pub ttfb: Vec<MetricValue>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub processing: Vec<MetricValue>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tokens: Vec<TokenUsage>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub characters: Vec<MetricValue>,
}

impl MetricsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.ttfb.is_empty()
            && self.processing.is_empty()
            && self.tokens.is_empty()
            && self.characters.is_empty()
    }

    pub fn ttfb_for(&self, processor: &str) -> Option<f64> {
        self.ttfb.iter().find(|m| m.processor == processor).map(|m| m.value)
    }

    pub fn processing_for(&self, processor: &str) -> Option<f64> {
        self.processing
            .iter()
            .find(|m| m.processor == processor)
            .map(|m| m.value)
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens.iter().map(|t| t.total_tokens).sum()
    }

    pub fn total_characters(&self) -> u64 {
        self.characters.iter().map(|c| c.value.max(0.0) as u64).sum()
    }
}

/// What the server heard the user say.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(rename = "final", default, skip_serializing_if = "Option::is_none")]
    pub is_final: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    Metrics(MetricsSnapshot),
    UserTranscript(Transcript),
    BotLlmStarted,
    BotLlmStopped,
    BotStartedSpeaking,
    BotStoppedSpeaking,
    UserStartedSpeaking,
    UserStoppedSpeaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolEventKind {
    Metrics,
    UserTranscript,
    BotLlmStarted,
    BotLlmStopped,
    BotStartedSpeaking,
    BotStoppedSpeaking,
    UserStartedSpeaking,
    UserStoppedSpeaking,
}

impl ProtocolEventKind {
    pub const ALL: [ProtocolEventKind; 8] = [
        ProtocolEventKind::Metrics,
        ProtocolEventKind::UserTranscript,
        ProtocolEventKind::BotLlmStarted,
        ProtocolEventKind::BotLlmStopped,
        ProtocolEventKind::BotStartedSpeaking,
        ProtocolEventKind::BotStoppedSpeaking,
        ProtocolEventKind::UserStartedSpeaking,
        ProtocolEventKind::UserStoppedSpeaking,
    ];
}

impl BusEvent for ProtocolEvent {
    type Kind = ProtocolEventKind;

    fn kind(&self) -> ProtocolEventKind {
        match self {
            ProtocolEvent::Metrics(_) => ProtocolEventKind::Metrics,
            ProtocolEvent::UserTranscript(_) => ProtocolEventKind::UserTranscript,
            ProtocolEvent::BotLlmStarted => ProtocolEventKind::BotLlmStarted,
            ProtocolEvent::BotLlmStopped => ProtocolEventKind::BotLlmStopped,
            ProtocolEvent::BotStartedSpeaking => ProtocolEventKind::BotStartedSpeaking,
            ProtocolEvent::BotStoppedSpeaking => ProtocolEventKind::BotStoppedSpeaking,
            ProtocolEvent::UserStartedSpeaking => ProtocolEventKind::UserStartedSpeaking,
            ProtocolEvent::UserStoppedSpeaking => ProtocolEventKind::UserStoppedSpeaking,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ControlFrame {
    label: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Value,
}

fn data_as<T: for<'de> Deserialize<'de>>(kind: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::Malformed(format!("{} data: {}", kind, e)))
}

/// Classify one inbound frame.
pub fn parse_frame(text: &str, label: &str) -> Result<ProtocolEvent, ProtocolError> {
    let frame: ControlFrame =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if frame.label.as_deref() != Some(label) {
        return Err(ProtocolError::UnexpectedLabel(frame.label));
    }
    let kind = frame
        .kind
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ProtocolError::Malformed("missing type".to_string()))?;

    let event = match kind.as_str() {
        "metrics" if frame.data.is_null() => ProtocolEvent::Metrics(MetricsSnapshot::default()),
        "metrics" => ProtocolEvent::Metrics(data_as(&kind, frame.data)?),
        "user-transcription" => ProtocolEvent::UserTranscript(data_as(&kind, frame.data)?),
        "bot-llm-started" => ProtocolEvent::BotLlmStarted,
        "bot-llm-stopped" => ProtocolEvent::BotLlmStopped,
        "bot-started-speaking" => ProtocolEvent::BotStartedSpeaking,
        "bot-stopped-speaking" => ProtocolEvent::BotStoppedSpeaking,
        "user-started-speaking" => ProtocolEvent::UserStartedSpeaking,
        "user-stopped-speaking" => ProtocolEvent::UserStoppedSpeaking,
        _ => return Err(ProtocolError::UnrecognizedKind(kind)),
    };
    Ok(event)
}

/// An outbound intent. The envelope label is added when sending.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl OutboundMessage {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn client_ready() -> Self {
        Self::new("client-ready")
    }

    pub fn test() -> Self {
        Self::new("test")
    }

    pub fn to_frame(&self, label: &str) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            label: &'a str,
            #[serde(flatten)]
            message: &'a OutboundMessage,
        }
        serde_json::to_string(&Envelope {
            label,
            message: self,
        })
    }
}

pub struct ProtocolClient {
    transport: Arc<Transport>,
    bus: EventBus<ProtocolEvent>,
    ready_sent: AtomicBool,
    subscriptions: Mutex<Vec<ListenerId>>,
}

impl ProtocolClient {
    /// Create a client listening to `transport`'s control frames.
    pub fn attach(transport: Arc<Transport>) -> Arc<Self> {
        let client = Arc::new(Self {
            transport: transport.clone(),
            bus: EventBus::new(),
            ready_sent: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&client);
        let frames = transport.on(TransportEventKind::ControlFrame, {
            let weak = weak.clone();
            move |event| {
                if let (Some(client), TransportEvent::ControlFrame(text)) = (weak.upgrade(), event) {
                    client.handle_frame(text);
                }
            }
        });
        let ready = transport.on(TransportEventKind::BotReady, {
            let weak = weak.clone();
            move |_| {
                if let Some(client) = weak.upgrade() {
                    tokio::spawn(async move {
                        client.client_ready().await;
                    });
                }
            }
        });
        let states = transport.on(TransportEventKind::StateChange, move |event| {
            if let (Some(client), TransportEvent::StateChange(TransportState::Disconnected)) =
                (Weak::upgrade(&weak), event)
            {
                client.ready_sent.store(false, Ordering::SeqCst);
            }
        });

        client
            .subscriptions
            .lock()
            .unwrap()
            .extend([frames, ready, states]);
        client
    }

    /// Stop listening to the transport.
    pub fn detach(&self) {
        for id in self.subscriptions.lock().unwrap().drain(..) {
            self.transport.off(id);
        }
    }

    pub fn on<F>(&self, kind: ProtocolEventKind, callback: F) -> ListenerId
    where
        F: Fn(&ProtocolEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, callback)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.bus.off(id)
    }

    pub fn label(&self) -> &str {
        &self.transport.options().control_channel_label
    }

    pub fn is_ready_sent(&self) -> bool {
        self.ready_sent.load(Ordering::SeqCst)
    }

    /// Dispatch one raw frame. Anything unusable is logged and dropped.
    pub fn handle_frame(&self, text: &str) {
        match parse_frame(text, self.label()) {
            Ok(event) => {
                debug!(kind = ?event.kind(), "Control message");
                self.bus.emit(&event);
            }
            Err(ProtocolError::UnrecognizedKind(kind)) => {
                info!(kind = %kind, "Unhandled control message type");
            }
            Err(e @ ProtocolError::UnexpectedLabel(_)) => {
                debug!(error = %e, "Ignoring frame for another protocol");
            }
            Err(e) => {
                warn!(error = %e, "Dropping control frame");
            }
        }
    }

    /// Send `message` if the control channel is open. Returns whether it was sent.
    pub async fn send(&self, message: OutboundMessage) -> bool {
        if !self.transport.is_control_channel_open() {
            warn!(kind = %message.kind, "Control channel not available, dropping message");
            return false;
        }
        let frame = match message.to_frame(self.label()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = %message.kind, error = %e, "Could not encode control message");
                return false;
            }
        };
        debug!(frame = %frame, "Sending control message");
        match self.transport.send_control(frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = %message.kind, error = %e, "Control message not sent");
                false
            }
        }
    }

    /// Announce readiness. Only the first call per connection sends.
    pub async fn client_ready(&self) -> bool {
        if self.ready_sent.swap(true, Ordering::SeqCst) {
            debug!("client-ready already sent for this connection");
            return false;
        }
        info!("Sending client-ready");
        let sent = self.send(OutboundMessage::client_ready()).await;
        if !sent {
            self.ready_sent.store(false, Ordering::SeqCst);
        }
        sent
    }

    pub async fn send_test(&self) -> bool {
        self.send(OutboundMessage::test()).await
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::{FakeChannel, FakeDevices, FakeFactory, FakeNegotiator};
    use crate::platform::{PeerEvent, PeerState};
    use crate::transport::{ConnectParams, TransportOptions};
    use serde_json::json;
    use std::time::Duration;

    fn collect(client: &ProtocolClient) -> Arc<Mutex<Vec<ProtocolEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in ProtocolEventKind::ALL {
            let sink = events.clone();
            client.on(kind, move |e| sink.lock().unwrap().push(e.clone()));
        }
        events
    }

    fn client() -> (Arc<Transport>, Arc<FakeFactory>, Arc<ProtocolClient>) {
        let factory = FakeFactory::new();
        let transport = Transport::new(
            FakeDevices::with_devices(&["usb"]),
            factory.clone(),
            FakeNegotiator::new(),
            TransportOptions::default(),
        );
        let client = ProtocolClient::attach(transport.clone());
        (transport, factory, client)
    }

    #[test]
    fn test_metrics_frame_yields_one_event() {
        let (_transport, _factory, client) = client();
        let events = collect(&client);

        let frame = json!({
            "label": "rtvi-ai",
            "type": "metrics",
            "data": {
                "ttfb": [{"processor": "llm", "model": "m1", "value": 0.25}],
                "tokens": [{"processor": "llm", "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}]
            }
        });
        client.handle_frame(&frame.to_string());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let ProtocolEvent::Metrics(snapshot) = &events[0] else {
            panic!("expected metrics, got {:?}", events[0]);
        };
        assert_eq!(snapshot.ttfb_for("llm"), Some(0.25));
        assert_eq!(snapshot.total_tokens(), 15);
        assert!(snapshot.processing.is_empty());
    }

    #[test]
    fn test_unknown_and_foreign_frames_are_dropped() {
        let (_transport, _factory, client) = client();
        let events = collect(&client);

        client.handle_frame(r#"{"label":"rtvi-ai","type":"unknown-future-kind"}"#);
        client.handle_frame(r#"{"label":"other","type":"metrics","data":{}}"#);
        client.handle_frame(r#"{"label":"rtvi-ai"}"#);
        client.handle_frame(r#"{"label":"rtvi-ai","type":"user-transcription","data":{"final":true}}"#);
        client.handle_frame("[1, 2");

        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_parse_frame_kinds() {
        assert_eq!(
            parse_frame(r#"{"label":"rtvi-ai","type":"bot-llm-started"}"#, "rtvi-ai").unwrap(),
            ProtocolEvent::BotLlmStarted
        );
        assert_eq!(
            parse_frame(r#"{"label":"rtvi-ai","type":"user-stopped-speaking"}"#, "rtvi-ai").unwrap(),
            ProtocolEvent::UserStoppedSpeaking
        );
        let transcript = parse_frame(
            r#"{"label":"rtvi-ai","type":"user-transcription","data":{"text":"hello","final":true}}"#,
            "rtvi-ai",
        )
        .unwrap();
        assert!(matches!(
            transcript,
            ProtocolEvent::UserTranscript(Transcript { ref text, is_final: Some(true), .. }) if text == "hello"
        ));
        assert_eq!(
            parse_frame(r#"{"type":"metrics"}"#, "rtvi-ai"),
            Err(ProtocolError::UnexpectedLabel(None))
        );
    }

    #[test]
    fn test_outbound_envelope() {
        let frame = OutboundMessage::client_ready().to_frame("rtvi-ai").unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({"label": "rtvi-ai", "type": "client-ready"}));

        let frame = OutboundMessage::new("action")
            .with_data(json!({"name": "mute"}))
            .to_frame("rtvi-ai")
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["data"]["name"], "mute");
    }

    #[test]
    fn test_metrics_helpers() {
        let snapshot: MetricsSnapshot = serde_json::from_value(json!({
            "characters": [{"processor": "tts", "value": 42}]
        }))
        .unwrap();
        assert!(!snapshot.is_empty());
        assert_eq!(snapshot.total_characters(), 42);
        assert!(MetricsSnapshot::default().is_empty());
    }

    #[test]
    fn test_null_metrics_still_yield_one_event() {
        let (_transport, _factory, client) = client();
        let events = collect(&client);

        let frame = json!({
            "label": "rtvi-ai",
            "type": "metrics",
            "data": {
                "ttfb": [{"processor": "llm", "model": null, "value": null}],
                "processing": null,
                "tokens": [{"processor": "llm", "prompt_tokens": null, "total_tokens": 3}],
                "characters": null
            }
        });
        client.handle_frame(&frame.to_string());
        client.handle_frame(r#"{"label":"rtvi-ai","type":"metrics","data":null}"#);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        let ProtocolEvent::Metrics(snapshot) = &events[0] else {
            panic!("expected metrics, got {:?}", events[0]);
        };
        assert_eq!(snapshot.ttfb_for("llm"), Some(0.0));
        assert!(snapshot.processing.is_empty());
        assert_eq!(snapshot.tokens[0].prompt_tokens, 0);
        assert_eq!(snapshot.total_tokens(), 3);
        assert_eq!(events[1], ProtocolEvent::Metrics(MetricsSnapshot::default()));
    }

    #[tokio::test]
    async fn test_send_drops_when_channel_closed() {
        let (_transport, _factory, client) = client();
        assert!(!client.send_test().await);
    }

    #[tokio::test]
    async fn test_client_ready_sent_once_per_connection() {
        let (transport, factory, client) = client();
        transport.start().await.unwrap();
        transport.connect(ConnectParams::default()).await.unwrap();

        let peer = factory.last_peer().unwrap();
        let channel = peer.channels.lock().unwrap()[0].clone();
        channel.open.store(true, Ordering::SeqCst);

        let generation = transport.generation();
        transport.handle_peer_event(generation, PeerEvent::ConnectionState(PeerState::Connected));
        transport.handle_peer_event(generation, PeerEvent::ChannelOpen { label: "rtvi-ai".into() });

        for _ in 0..50 {
            if !channel.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(channel.sent().len(), 1);
        assert!(channel.sent()[0].contains("client-ready"));

        assert!(!client.client_ready().await);
        assert_eq!(channel.sent().len(), 1);

        assert!(client.send_test().await);
        assert_eq!(channel.sent().len(), 2);

        transport.disconnect().await.unwrap();
        assert!(!client.is_ready_sent());
    }

    #[tokio::test]
    async fn test_client_ready_retried_after_failed_send() {
        let (transport, _factory, client) = client();
        transport.start().await.unwrap();
        transport.connect(ConnectParams::default()).await.unwrap();

        assert!(!client.client_ready().await);
        assert!(!client.is_ready_sent());
    }

    #[tokio::test]
    async fn test_client_ready_reaches_remote_announced_channel() {
        let factory = FakeFactory::new();
        let transport = Transport::new(
            FakeDevices::with_devices(&["usb"]),
            factory.clone(),
            FakeNegotiator::new(),
            TransportOptions {
                create_control_channel: false,
                ..TransportOptions::default()
            },
        );
        let client = ProtocolClient::attach(transport.clone());
        transport.start().await.unwrap();
        transport.connect(ConnectParams::default()).await.unwrap();

        let generation = transport.generation();
        transport.handle_peer_event(generation, PeerEvent::ConnectionState(PeerState::Connected));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!client.is_ready_sent());

        let channel = FakeChannel::new("rtvi-ai", true);
        transport.handle_peer_event(generation, PeerEvent::DataChannel(channel.clone()));
        for _ in 0..50 {
            if !channel.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(channel.sent().len(), 1);
        assert!(channel.sent()[0].contains("client-ready"));
        assert!(client.is_ready_sent());
    }
}
