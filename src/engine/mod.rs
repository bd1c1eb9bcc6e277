use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activation::{ActivationOutcome, Activator};
use crate::audio::{AudioSink, DEFAULT_SAMPLE_RATE};
use crate::config::ClientConfig;
use crate::error::{EngineError, ErrorKind, Result};
use crate::identity::IdentityManager;
use crate::ota::OtaClient;
use crate::state::{ActivationStage, DeviceState, StateMachine};
use crate::store::{SecureStore, KEY_WS_TOKEN, KEY_WS_URL};
use crate::ws::messages::{ClientMessage, ListenMode, ServerMessage};
use crate::ws::{WsClient, WsConfig, WsEvent};

/// Debug switch: set to `1` to force identity regeneration on boot. The only
/// environment variable the engine itself reads.
const ENV_FORCE_REPROVISION: &str = "XIAOZHI_FORCE_REPROVISION";

/// Typed event stream delivered to the host. Subscribe once with
/// [`Engine::take_events`].
#[derive(Debug)]
pub enum EngineEvent {
    /// Show `code` to the user, then call
    /// [`Engine::complete_activation`] with `challenge`. `timeout_ms` is the
    /// server-reported code lifetime, when it sends one.
    ActivationCode {
        code: String,
        challenge: String,
        timeout_ms: Option<u64>,
    },
    WebSocketReady {
        session_id: Option<String>,
        sample_rate: u32,
    },
    Tts {
        state: String,
        text: Option<String>,
    },
    Emotion(String),
    /// Opaque tool-protocol message, passed through verbatim.
    Mcp(Value),
    /// Raw Opus packet; the internal sink also consumes it.
    AudioReceived(Vec<u8>),
    /// The connection task has exited.
    Disconnected,
    Error { kind: ErrorKind, detail: String },
}

/// What `boot` resolved to.
#[derive(Debug)]
pub enum BootOutcome {
    /// Activated and connected; the session is coming up.
    Ready,
    /// The user must bind the verification code externally.
    AwaitingActivation {
        code: String,
        challenge: String,
        timeout_ms: Option<u64>,
    },
}

/// Top-level orchestrator. Owns every sub-component; the host holds exactly
/// one `Engine` and one event receiver.
pub struct Engine {
    store: Arc<SecureStore>,
    identity: Arc<IdentityManager>,
    state: Arc<StateMachine>,
    activator: Activator,
    sink: Arc<AudioSink>,
    ws: Option<WsClient>,
    session_id: Arc<Mutex<Option<String>>>,
    event_tx: mpsc::Sender<EngineEvent>,
    event_rx: Option<mpsc::Receiver<EngineEvent>>,
    router: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn new(config: ClientConfig) -> Self {
        let store = Arc::new(SecureStore::open(&config.storage.path));
        let identity = Arc::new(IdentityManager::new(store.clone()));
        let state = Arc::new(StateMachine::new());
        let ota = Arc::new(OtaClient::new(&config));
        let activator = Activator::new(
            store.clone(),
            identity.clone(),
            ota,
            state.clone(),
        );
        let sink = if config.audio.enable {
            AudioSink::new(DEFAULT_SAMPLE_RATE)
        } else {
            AudioSink::disabled()
        };
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            store,
            identity,
            state,
            activator,
            sink,
            ws: None,
            session_id: Arc::new(Mutex::new(None)),
            event_tx,
            event_rx: Some(event_rx),
            router: None,
        }
    }

    /// Takes the event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.event_rx.take()
    }

    pub fn current_state(&self) -> DeviceState {
        self.state.current()
    }

    pub fn activation_stage(&self) -> ActivationStage {
        self.state.stage()
    }

    /// Orchestrates identity, activation and the WebSocket connection.
    pub async fn boot(&mut self, force_new: bool) -> Result<BootOutcome> {
        let force_new = force_new
            || std::env::var(ENV_FORCE_REPROVISION).is_ok_and(|v| v == "1" || v == "true");

        match self.activator.begin(force_new).await {
            Ok(ActivationOutcome::Activated) => {
                self.connect().await?;
                Ok(BootOutcome::Ready)
            }
            Ok(ActivationOutcome::NeedCode {
                code,
                challenge,
                timeout_ms,
                ..
            }) => {
                // The verification code is the one identifier shown verbatim.
                info!("activation code: {}", code);
                self.emit(EngineEvent::ActivationCode {
                    code: code.clone(),
                    challenge: challenge.clone(),
                    timeout_ms,
                })
                .await;
                Ok(BootOutcome::AwaitingActivation {
                    code,
                    challenge,
                    timeout_ms,
                })
            }
            Err(e) => {
                self.report(&e).await;
                Err(e)
            }
        }
    }

    /// Finishes the code branch after the user bound the code, then connects.
    pub async fn complete_activation(&mut self, challenge: &str) -> Result<()> {
        if let Err(e) = self.activator.submit(challenge).await {
            self.report(&e).await;
            return Err(e);
        }
        self.connect().await
    }

    /// Emits a `listen/detect` with the current session id, injecting a
    /// textual utterance.
    pub async fn send_text_message(&self, text: impl Into<String>) -> Result<()> {
        let msg = ClientMessage::listen_detect(self.session_id_or_empty(), text);
        self.ws_send(msg).await
    }

    pub async fn start_listening(&self, mode: ListenMode) -> Result<()> {
        let msg = ClientMessage::listen_start(self.session_id_or_empty(), mode);
        self.ws_send(msg).await?;
        self.state.set(DeviceState::Streaming);
        Ok(())
    }

    pub async fn stop_listening(&self) -> Result<()> {
        let msg = ClientMessage::listen_stop(self.session_id_or_empty());
        self.ws_send(msg).await?;
        self.state.set(DeviceState::WsReady);
        Ok(())
    }

    /// Sends an opaque `mcp` reply. The tool protocol itself lives in the
    /// host; the engine only carries the frames.
    pub async fn send_mcp(&self, payload: Value) -> Result<()> {
        let session_id = self.session_id.lock().unwrap().clone();
        self.ws_send(ClientMessage::mcp(payload, session_id)).await
    }

    /// Closes the connection and cancels heartbeat and reconnect tasks.
    pub async fn disconnect(&mut self) {
        if let Some(ws) = self.ws.take() {
            ws.shutdown().await;
        }
        if let Some(router) = self.router.take() {
            let _ = router.await;
        }
        self.session_id.lock().unwrap().take();
    }

    /// Factory reset: drops the connection and every persisted key.
    pub async fn reset(&mut self) -> Result<()> {
        self.disconnect().await;
        self.identity.reset_all()?;
        self.state.set(DeviceState::Uninitialized);
        self.state.set_stage(ActivationStage::Idle);
        Ok(())
    }

    /// Opens the WebSocket once activation and session config are in place.
    async fn connect(&mut self) -> Result<()> {
        let result = self.try_connect().await;
        if let Err(e) = &result {
            self.report(e).await;
        }
        result
    }

    async fn try_connect(&mut self) -> Result<()> {
        if self.ws.is_some() {
            self.disconnect().await;
        }
        let identity = self.identity.current(false)?;
        if !identity.activated {
            return Err(EngineError::State {
                op: "ws connect",
                state: self.state.current().to_string(),
            });
        }
        let url = self
            .store
            .get(KEY_WS_URL)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                EngineError::Config("no persisted websocket url; re-run activation".to_string())
            })?;
        let token = self.store.get(KEY_WS_TOKEN).filter(|t| !t.is_empty());

        let config = WsConfig::new(url, token, identity.device_id, identity.client_id);
        let (ws_tx, ws_rx) = mpsc::channel(256);
        let ws = WsClient::connect(config, self.state.clone(), ws_tx)?;

        self.router = Some(tokio::spawn(route_ws_events(
            ws_rx,
            self.event_tx.clone(),
            self.sink.clone(),
            self.session_id.clone(),
        )));
        self.ws = Some(ws);
        Ok(())
    }

    async fn ws_send(&self, msg: ClientMessage) -> Result<()> {
        let result = match &self.ws {
            Some(ws) => ws.send(msg).await,
            None => Err(EngineError::State {
                op: "ws send",
                state: self.state.current().to_string(),
            }),
        };
        if let Err(e) = &result {
            self.report(e).await;
        }
        result
    }

    fn session_id_or_empty(&self) -> String {
        self.session_id.lock().unwrap().clone().unwrap_or_default()
    }

    async fn emit(&self, event: EngineEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }

    async fn report(&self, e: &EngineError) {
        warn!("{}", e);
        self.emit(EngineEvent::Error {
            kind: e.kind(),
            detail: e.to_string(),
        })
        .await;
    }
}

/// Bridges connection events onto the host stream and the audio sink.
/// Runs until the connection task signals `Closed`.
async fn route_ws_events(
    mut ws_rx: mpsc::Receiver<WsEvent>,
    event_tx: mpsc::Sender<EngineEvent>,
    sink: Arc<AudioSink>,
    session_id: Arc<Mutex<Option<String>>>,
) {
    while let Some(event) = ws_rx.recv().await {
        match event {
            WsEvent::Ready {
                session_id: sid,
                sample_rate,
            } => {
                *session_id.lock().unwrap() = sid.clone();
                sink.update_sample_rate(sample_rate);
                let _ = event_tx
                    .send(EngineEvent::WebSocketReady {
                        session_id: sid,
                        sample_rate,
                    })
                    .await;
            }
            WsEvent::Message(ServerMessage::Tts { state, text }) => {
                let _ = event_tx.send(EngineEvent::Tts { state, text }).await;
            }
            WsEvent::Message(ServerMessage::Llm { emotion, .. }) => {
                if let Some(emotion) = emotion {
                    let _ = event_tx.send(EngineEvent::Emotion(emotion)).await;
                }
            }
            WsEvent::Message(ServerMessage::Mcp { payload, .. }) => {
                let _ = event_tx.send(EngineEvent::Mcp(payload)).await;
            }
            WsEvent::Message(ServerMessage::Hello { .. }) => {
                // Consumed by the connection task; never forwarded.
            }
            WsEvent::Audio(bytes) => {
                sink.push(bytes.clone());
                let _ = event_tx.send(EngineEvent::AudioReceived(bytes)).await;
            }
            WsEvent::Error(e) => {
                let _ = event_tx
                    .send(EngineEvent::Error {
                        kind: e.kind(),
                        detail: e.to_string(),
                    })
                    .await;
            }
            WsEvent::Closed => {
                session_id.lock().unwrap().take();
                let _ = event_tx.send(EngineEvent::Disconnected).await;
                return;
            }
        }
    }
}
