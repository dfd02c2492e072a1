//! Gateway session management.
//!
//! Owns one streaming connection at a time and runs its event loop for the
//! lifetime of the process: handshake (identify or resume), heartbeating
//! with zombie detection, sequence tracking, and server-directed
//! reconnects. Decoded events are published on the shared [`Signals`]
//! broadcaster; locally-originated control requests arrive on its typed
//! control lane and are translated 1:1 into outbound frames.

use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use corvid_core::{ControlSignal, MemberRequest, Signals, StatusUpdate, VoiceStateUpdate};
use corvid_rest::RestClient;

use crate::error::{GatewayError, Result};
use crate::frame::{Frame, Intents, Opcode};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Close code used when abandoning a connection that stopped acking
/// heartbeats.
const ZOMBIE_CLOSE: u16 = 4000;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Identification block sent in the identify frame.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionProperties {
    #[serde(rename = "$os")]
    pub os: String,
    #[serde(rename = "$browser")]
    pub browser: String,
    #[serde(rename = "$device")]
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "corvid".to_string(),
            device: "corvid".to_string(),
        }
    }
}

/// Configuration for a gateway session.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bot token used for identify and resume frames.
    pub token: String,
    /// Event groups to subscribe to; omitted from identify when `None`.
    pub intents: Option<Intents>,
    /// Protocol version requested from the endpoint.
    pub gateway_version: u8,
    /// Delay before reconnecting after an invalid-session frame.
    pub invalid_session_delay: Duration,
    /// Identification block for the identify frame.
    pub properties: ConnectionProperties,
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            intents: None,
            gateway_version: 6,
            invalid_session_delay: Duration::from_secs(5),
            properties: ConnectionProperties::default(),
        }
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Handle to a running gateway session.
///
/// Control methods are non-blocking: they queue an outbound frame on the
/// current connection generation. Event delivery happens through the shared
/// [`Signals`] broadcaster.
pub struct Gateway {
    signals: Arc<Signals>,
    closed: Arc<AtomicBool>,
}

impl Gateway {
    /// Update the client's presence information.
    pub fn update_status(&self, status: StatusUpdate) {
        self.signals
            .emit_control(&ControlSignal::UpdateStatus(status));
    }

    /// Update the client's voice connection for a guild.
    pub fn update_voice_state(&self, state: VoiceStateUpdate) {
        self.signals
            .emit_control(&ControlSignal::UpdateVoiceState(state));
    }

    /// Request an extended guild member listing.
    pub fn request_members(&self, request: MemberRequest) {
        self.signals
            .emit_control(&ControlSignal::RequestMembers(request));
    }

    /// Connect a handler to a named event.
    pub fn on<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.signals.connect(name, handler);
    }

    /// Connect a handler to every event; it also receives the event name.
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.signals.connect_any(handler);
    }

    /// Shared broadcaster delivering this session's events.
    pub fn signals(&self) -> Arc<Signals> {
        Arc::clone(&self.signals)
    }

    /// Terminate the session and suppress auto-reconnect.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.signals.emit_control(&ControlSignal::Close);
    }
}

// ----------------------------------------------------------------------------
// Session Entry Points
// ----------------------------------------------------------------------------

/// Open a gateway session, resolving the endpoint through the REST
/// dispatcher first.
pub async fn open(rest: &RestClient, config: GatewayConfig) -> Result<Gateway> {
    let endpoint = rest.get_gateway().await?;
    open_url(&endpoint.url, config)
}

/// Open a gateway session against an already-resolved endpoint.
pub fn open_url(url: &str, config: GatewayConfig) -> Result<Gateway> {
    let url = format!("{url}?v={}&encoding=json", config.gateway_version);
    Url::parse(&url)?;

    let signals = Arc::new(Signals::new());
    let closed = Arc::new(AtomicBool::new(false));
    tokio::spawn(run_session(
        url,
        config,
        Arc::clone(&signals),
        Arc::clone(&closed),
    ));

    Ok(Gateway { signals, closed })
}

// ----------------------------------------------------------------------------
// Session Loop
// ----------------------------------------------------------------------------

/// Session state handed forward across reconnect attempts.
#[derive(Debug, Clone)]
struct SessionState {
    session_id: String,
    seq: Option<u64>,
}

impl SessionState {
    fn fresh() -> Self {
        Self {
            session_id: String::new(),
            seq: None,
        }
    }
}

/// What to do after one connection generation ends.
enum Next {
    /// Re-enter the connect loop, resuming when state is carried forward.
    Reconnect {
        resume: Option<SessionState>,
        delay: Option<Duration>,
    },
    /// Stop the session task.
    Shutdown,
}

async fn run_session(
    url: String,
    config: GatewayConfig,
    signals: Arc<Signals>,
    closed: Arc<AtomicBool>,
) {
    let mut resume: Option<SessionState> = None;
    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let outcome = run_connection(&url, &config, &signals, resume.take()).await;
        signals.emit("disconnect", &Value::Null);
        match outcome {
            Ok(Next::Reconnect {
                resume: state,
                delay,
            }) => {
                if let Some(delay) = delay {
                    sleep(delay).await;
                }
                resume = state;
            }
            Ok(Next::Shutdown) => break,
            Err(e) => {
                warn!("gateway connection failed: {e}");
                break;
            }
        }
    }
    signals.clear_control();
    info!("gateway session task stopped");
}

/// Run one connection generation until it ends.
async fn run_connection(
    url: &str,
    config: &GatewayConfig,
    signals: &Signals,
    resume: Option<SessionState>,
) -> Result<Next> {
    let resuming = resume.is_some();
    let mut state = resume.unwrap_or_else(SessionState::fresh);

    // Fresh control channel per generation; re-subscribing here keeps stale
    // handles from emitting onto a closed transport.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ControlSignal>();
    signals.clear_control();
    signals.connect_control(move |signal| {
        let _ = out_tx.send(signal.clone());
    });

    info!(resuming, "connecting to gateway");
    let (ws, _) = connect_async(url).await?;
    let (mut sink, mut stream) = ws.split();

    // Heartbeat schedule; armed once the configuration frame arrives.
    let mut period: Option<Duration> = None;
    let mut next_beat: Option<Instant> = None;
    let mut acked = true;

    loop {
        let deadline = next_beat;
        tokio::select! {
            // Heartbeat timer tick.
            _ = heartbeat_wait(deadline), if deadline.is_some() => {
                if acked {
                    acked = false;
                    send(&mut sink, &heartbeat_frame(state.seq)).await?;
                } else {
                    // Zombie connection: the previous beat was never acked.
                    warn!("heartbeat ack missing, abandoning connection");
                    close(&mut sink, CloseCode::from(ZOMBIE_CLOSE)).await;
                    return Ok(Next::Reconnect {
                        resume: Some(state),
                        delay: None,
                    });
                }
                if let Some(period) = period {
                    next_beat = Some(Instant::now() + period);
                }
            }

            // Locally-originated control signals.
            signal = out_rx.recv() => {
                match signal {
                    Some(ControlSignal::Close) | None => {
                        signals.clear_control();
                        close(&mut sink, CloseCode::Normal).await;
                        return Ok(Next::Shutdown);
                    }
                    Some(signal) => {
                        if let Some(frame) = control_frame(&signal)? {
                            send(&mut sink, &frame).await?;
                        }
                    }
                }
            }

            // Inbound transport frames.
            message = stream.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!("transport error: {e}");
                        return Ok(Next::Shutdown);
                    }
                    None => return Ok(Next::Shutdown),
                };
                let frame: Frame = match message {
                    Message::Text(text) => serde_json::from_str(&text)?,
                    Message::Close(reason) => {
                        debug!(?reason, "gateway closed the connection");
                        return Ok(Next::Shutdown);
                    }
                    // Transport-level ping/pong and binary frames carry no
                    // protocol payload here.
                    _ => continue,
                };

                match frame.op {
                    Opcode::Hello => {
                        let interval = frame
                            .d
                            .get("heartbeat_interval")
                            .and_then(Value::as_u64)
                            .ok_or_else(|| {
                                GatewayError::Protocol(
                                    "hello frame missing heartbeat_interval".to_string(),
                                )
                            })?;
                        let interval = Duration::from_millis(interval);
                        period = Some(interval);
                        next_beat = Some(Instant::now() + interval);

                        let handshake = if resuming {
                            resume_frame(&config.token, &state)
                        } else {
                            identify_frame(config)
                        };
                        send(&mut sink, &handshake).await?;
                    }
                    Opcode::Heartbeat => {
                        // Server-initiated request; answer immediately.
                        send(&mut sink, &heartbeat_frame(state.seq)).await?;
                    }
                    Opcode::HeartbeatAck => acked = true,
                    Opcode::Reconnect => {
                        debug!("server requested reconnect");
                        close(&mut sink, CloseCode::Normal).await;
                        return Ok(Next::Reconnect {
                            resume: Some(state),
                            delay: None,
                        });
                    }
                    Opcode::InvalidSession => {
                        // The payload says whether the session may still be
                        // resumed or must be re-identified.
                        let resumable = frame.d.as_bool().unwrap_or(false);
                        warn!(resumable, "session invalidated");
                        close(&mut sink, CloseCode::Normal).await;
                        return Ok(Next::Reconnect {
                            resume: resumable.then(|| state.clone()),
                            delay: Some(config.invalid_session_delay),
                        });
                    }
                    Opcode::Dispatch => {
                        if let Some(s) = frame.s {
                            state.seq = Some(s);
                        }
                        if let Some(name) = frame.t.as_deref() {
                            if name == "READY" {
                                if let Some(id) =
                                    frame.d.get("session_id").and_then(Value::as_str)
                                {
                                    state.session_id = id.to_string();
                                }
                            }
                            signals.emit(&name.to_lowercase(), &frame.d);
                        }
                    }
                    op => debug!(?op, "ignoring unexpected gateway opcode"),
                }
            }
        }
    }
}

async fn heartbeat_wait(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending::<()>().await,
    }
}

// ----------------------------------------------------------------------------
// Frame Construction
// ----------------------------------------------------------------------------

fn bot_token(token: &str) -> String {
    format!("Bot {}", token.trim())
}

fn heartbeat_frame(seq: Option<u64>) -> Frame {
    Frame::new(Opcode::Heartbeat, json!(seq))
}

fn identify_frame(config: &GatewayConfig) -> Frame {
    let mut d = json!({
        "token": bot_token(&config.token),
        "properties": config.properties,
    });
    if let Some(intents) = config.intents {
        d["intents"] = json!(intents.bits());
    }
    Frame::new(Opcode::Identify, d)
}

fn resume_frame(token: &str, state: &SessionState) -> Frame {
    Frame::new(
        Opcode::Resume,
        json!({
            "token": bot_token(token),
            "session_id": state.session_id,
            "seq": state.seq,
        }),
    )
}

fn control_frame(signal: &ControlSignal) -> Result<Option<Frame>> {
    let frame = match signal {
        ControlSignal::UpdateStatus(status) => {
            Frame::new(Opcode::PresenceUpdate, serde_json::to_value(status)?)
        }
        ControlSignal::UpdateVoiceState(state) => {
            Frame::new(Opcode::VoiceStateUpdate, serde_json::to_value(state)?)
        }
        ControlSignal::RequestMembers(request) => {
            Frame::new(Opcode::RequestGuildMembers, serde_json::to_value(request)?)
        }
        ControlSignal::Close => return Ok(None),
    };
    Ok(Some(frame))
}

// ----------------------------------------------------------------------------
// Transport Helpers
// ----------------------------------------------------------------------------

async fn send(sink: &mut WsSink, frame: &Frame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

/// Best-effort close; the connection is being abandoned either way.
async fn close(sink: &mut WsSink, code: CloseCode) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })))
        .await;
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
