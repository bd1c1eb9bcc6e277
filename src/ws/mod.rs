pub mod demux;
pub mod messages;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::identity::mask;
use crate::state::{DeviceState, StateMachine};
use demux::{Demuxed, FrameDemux};
use messages::{classify, ClientMessage, InboundMessage, ServerMessage};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(45);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(15);
pub const MAX_HEARTBEAT_MISSES: u32 = 5;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

const RECONNECT_LADDER: [u64; 5] = [1, 2, 4, 8, 15];

/// Delay before reconnect attempt `attempt` (0-based), saturating at 15 s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_secs(RECONNECT_LADDER[attempt.min(4) as usize])
}

/// Consecutive-miss pong counter. Any pong clears it; the fifth consecutive
/// miss tears the connection down.
struct Heartbeat {
    misses: u32,
}

impl Heartbeat {
    fn new() -> Self {
        Self { misses: 0 }
    }

    fn on_pong(&mut self) {
        self.misses = 0;
    }

    /// Returns true when the connection must be closed.
    fn on_miss(&mut self) -> bool {
        self.misses += 1;
        warn!("heartbeat pong missed ({}/{})", self.misses, MAX_HEARTBEAT_MISSES);
        self.misses >= MAX_HEARTBEAT_MISSES
    }
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    pub token: Option<String>,
    pub device_id: String,
    pub client_id: String,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
}

impl WsConfig {
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        device_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            token,
            device_id: device_id.into(),
            client_id: client_id.into(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            pong_timeout: PONG_TIMEOUT,
        }
    }
}

/// Events delivered to the engine, in wire order within each kind.
#[derive(Debug)]
pub enum WsEvent {
    /// Server hello received; the session is usable.
    Ready {
        session_id: Option<String>,
        sample_rate: u32,
    },
    /// A non-hello control message (tts, llm, mcp).
    Message(ServerMessage),
    /// One Opus packet.
    Audio(Vec<u8>),
    /// An error surfaced per the propagation policy.
    Error(EngineError),
    /// The connection task has exited; state is back to `Activated`.
    Closed,
}

enum WsCommand {
    Send(ClientMessage),
    Shutdown,
}

enum SessionEnd {
    Shutdown,
    ConnectionLost(String),
    HeartbeatTimeout,
    ProtocolError(String),
}

/// Handle to the connection task. Dropping the handle leaves the task
/// running; call [`WsClient::shutdown`] to tear it down.
pub struct WsClient {
    cmd_tx: mpsc::Sender<WsCommand>,
    state: Arc<StateMachine>,
    task: JoinHandle<()>,
}

impl WsClient {
    /// Validates gating and the URL contract, then spawns the connection
    /// task. Refused outright when the device state forbids a connection or
    /// the URL does not end with `/`.
    pub fn connect(
        config: WsConfig,
        state: Arc<StateMachine>,
        events: mpsc::Sender<WsEvent>,
    ) -> Result<Self> {
        let current = state.current();
        if !current.may_connect() {
            return Err(EngineError::State {
                op: "ws connect",
                state: current.to_string(),
            });
        }
        if !config.url.ends_with('/') {
            return Err(EngineError::Config(format!(
                "websocket url must end with '/': {}",
                config.url
            )));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let task = tokio::spawn(run(config, state.clone(), events, cmd_rx));
        Ok(Self {
            cmd_tx,
            state,
            task,
        })
    }

    /// Enqueues a control message. Refused unless the session is ready.
    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        let current = self.state.current();
        if !current.may_send() {
            return Err(EngineError::State {
                op: "ws send",
                state: current.to_string(),
            });
        }
        self.cmd_tx
            .send(WsCommand::Send(msg))
            .await
            .map_err(|_| EngineError::Network("connection task gone".to_string()))
    }

    /// Closes the connection and cancels heartbeat/reconnect. In-flight
    /// reconnect waits are aborted.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(WsCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect_socket(config: &WsConfig) -> Result<WsStream> {
    let mut request = config.url.as_str().into_client_request()?;
    let bearer = format!("Bearer {}", config.token.as_deref().unwrap_or("placeholder"));
    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        HeaderValue::from_str(&bearer)
            .map_err(|e| EngineError::Config(format!("invalid token: {}", e)))?,
    );
    headers.insert("Protocol-Version", HeaderValue::from_static("1"));
    headers.insert(
        "Device-Id",
        HeaderValue::from_str(&config.device_id)
            .map_err(|e| EngineError::Config(format!("invalid device id: {}", e)))?,
    );
    headers.insert(
        "Client-Id",
        HeaderValue::from_str(&config.client_id)
            .map_err(|e| EngineError::Config(format!("invalid client id: {}", e)))?,
    );
    // Fixed literal required by the service, never substituted.
    headers.insert("Origin", HeaderValue::from_static("https://xiaozhi.me"));

    let (ws, _resp) = connect_async(request).await?;
    Ok(ws)
}

async fn run(
    config: WsConfig,
    state: Arc<StateMachine>,
    events: mpsc::Sender<WsEvent>,
    mut cmd_rx: mpsc::Receiver<WsCommand>,
) {
    let mut ever_ready = false;
    let mut attempts: u32 = 0;

    loop {
        state.set(DeviceState::WsConnecting);
        let session = match connect_socket(&config).await {
            Ok(ws) => {
                drive_session(
                    ws,
                    &config,
                    &state,
                    &events,
                    &mut cmd_rx,
                    &mut ever_ready,
                    &mut attempts,
                )
                .await
            }
            Err(e) => SessionEnd::ConnectionLost(e.to_string()),
        };

        match session {
            SessionEnd::Shutdown => {
                state.set(DeviceState::Activated);
                let _ = events.send(WsEvent::Closed).await;
                return;
            }
            SessionEnd::ConnectionLost(detail) => {
                debug!("connection lost: {}", detail);
                if !ever_ready {
                    // No reconnect ladder before the first successful hello.
                    state.set(DeviceState::Activated);
                    let _ = events.send(WsEvent::Error(EngineError::Network(detail))).await;
                    let _ = events.send(WsEvent::Closed).await;
                    return;
                }
            }
            SessionEnd::HeartbeatTimeout => {
                let _ = events
                    .send(WsEvent::Error(EngineError::HeartbeatTimeout(
                        MAX_HEARTBEAT_MISSES,
                    )))
                    .await;
            }
            SessionEnd::ProtocolError(detail) => {
                let _ = events
                    .send(WsEvent::Error(EngineError::Protocol(detail.clone())))
                    .await;
                if !ever_ready {
                    state.set(DeviceState::Activated);
                    let _ = events.send(WsEvent::Closed).await;
                    return;
                }
            }
        }

        if attempts >= MAX_RECONNECT_ATTEMPTS {
            error!("giving up after {} reconnect attempts", attempts);
            state.set(DeviceState::Activated);
            let _ = events
                .send(WsEvent::Error(EngineError::Network(format!(
                    "reconnect failed after {} attempts",
                    attempts
                ))))
                .await;
            let _ = events.send(WsEvent::Closed).await;
            return;
        }

        let delay = reconnect_delay(attempts);
        attempts += 1;
        info!(
            "reconnecting in {:?} (attempt {}/{})",
            delay, attempts, MAX_RECONNECT_ATTEMPTS
        );
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(WsCommand::Shutdown) => {
                        state.set(DeviceState::Activated);
                        let _ = events.send(WsEvent::Closed).await;
                        return;
                    }
                    Some(WsCommand::Send(_)) => {
                        warn!("dropping outbound message while disconnected");
                    }
                },
            }
        }
    }
}

fn send_nowait(tx: &mpsc::Sender<Message>, msg: Message) -> bool {
    match tx.try_send(msg) {
        Ok(_) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("outbound buffer full, dropping frame to avoid blocking loop");
            false
        }
        Err(e) => {
            error!("outbound channel closed: {}", e);
            false
        }
    }
}

async fn drive_session(
    ws: WsStream,
    config: &WsConfig,
    state: &Arc<StateMachine>,
    events: &mpsc::Sender<WsEvent>,
    cmd_rx: &mut mpsc::Receiver<WsCommand>,
    ever_ready: &mut bool,
    attempts: &mut u32,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    // 256 buffer
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let hello = serde_json::to_string(&ClientMessage::hello()).expect("Serialize failed");
    debug!("sending client hello");
    if out_tx.send(Message::Text(hello.into())).await.is_err() {
        writer.abort();
        return SessionEnd::ConnectionLost("writer gone before hello".to_string());
    }

    let mut demux = FrameDemux::new();
    let mut heartbeat = Heartbeat::new();
    let mut session_ready = false;

    let mut ping_timer = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline = Box::pin(sleep(Duration::from_secs(3600 * 24)));
    let mut awaiting_pong = false;

    let end = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(WsCommand::Shutdown) => {
                    let _ = out_tx.send(Message::Close(None)).await;
                    break SessionEnd::Shutdown;
                }
                Some(WsCommand::Send(msg)) => {
                    let text = serde_json::to_string(&msg).expect("Serialize failed");
                    debug!("sending: {}", text);
                    if out_tx.send(Message::Text(text.into())).await.is_err() {
                        break SessionEnd::ConnectionLost("writer gone".to_string());
                    }
                }
            },

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Value>(text.as_str()) {
                        Ok(value) => {
                            match route_json(
                                value, state, events, &mut session_ready,
                                ever_ready, attempts,
                            ).await {
                                Ok(()) => {}
                                Err(detail) => break SessionEnd::ProtocolError(detail),
                            }
                        }
                        Err(e) => {
                            break SessionEnd::ProtocolError(
                                format!("malformed JSON text frame: {}", e),
                            );
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    match demux.on_binary(data.to_vec()) {
                        Demuxed::Json(value) => {
                            match route_json(
                                value, state, events, &mut session_ready,
                                ever_ready, attempts,
                            ).await {
                                Ok(()) => {}
                                Err(detail) => break SessionEnd::ProtocolError(detail),
                            }
                        }
                        Demuxed::Audio(bytes) => {
                            let _ = events.send(WsEvent::Audio(bytes)).await;
                        }
                        Demuxed::Partial => {}
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    heartbeat.on_pong();
                    awaiting_pong = false;
                }
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite queues the protocol-level pong itself.
                }
                Some(Ok(Message::Close(frame))) => {
                    break SessionEnd::ConnectionLost(format!("closed by server: {:?}", frame));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break SessionEnd::ConnectionLost(e.to_string()),
                None => break SessionEnd::ConnectionLost("stream ended".to_string()),
            },

            _ = ping_timer.tick(), if session_ready => {
                send_nowait(&out_tx, Message::Ping(Bytes::new()));
                if !awaiting_pong {
                    awaiting_pong = true;
                    pong_deadline.as_mut().reset(Instant::now() + config.pong_timeout);
                }
            },

            _ = pong_deadline.as_mut(), if awaiting_pong => {
                awaiting_pong = false;
                if heartbeat.on_miss() {
                    let _ = out_tx.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Away,
                        reason: "heartbeat_timeout".into(),
                    }))).await;
                    break SessionEnd::HeartbeatTimeout;
                }
            },
        }
    };

    // Dropping out_tx lets the writer flush queued frames and close the sink.
    drop(out_tx);
    let _ = writer.await;
    end
}

async fn route_json(
    value: Value,
    state: &Arc<StateMachine>,
    events: &mpsc::Sender<WsEvent>,
    session_ready: &mut bool,
    ever_ready: &mut bool,
    attempts: &mut u32,
) -> std::result::Result<(), String> {
    match classify(value) {
        Ok(InboundMessage::Known(ServerMessage::Hello {
            session_id,
            audio_params,
            ..
        })) => {
            let sample_rate = audio_params
                .and_then(|p| p.sample_rate)
                .unwrap_or(16000);
            *session_ready = true;
            *ever_ready = true;
            *attempts = 0;
            state.set(DeviceState::WsReady);
            info!(
                "server hello: session={} downstream={} Hz",
                session_id.as_deref().map(mask).unwrap_or_else(|| "-".to_string()),
                sample_rate
            );
            let _ = events
                .send(WsEvent::Ready {
                    session_id,
                    sample_rate,
                })
                .await;
            Ok(())
        }
        Ok(InboundMessage::Known(msg)) => {
            let _ = events.send(WsEvent::Message(msg)).await;
            Ok(())
        }
        Ok(InboundMessage::Unknown(value)) => {
            debug!(
                "ignoring message of unknown type {:?}",
                value.get("type").and_then(Value::as_str)
            );
            Ok(())
        }
        Err(EngineError::Protocol(detail)) => Err(detail),
        Err(e) => Err(e.to_string()),
    }
}
