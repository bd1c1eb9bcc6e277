use std::sync::Mutex;
use tracing::{debug, info};

/// Device lifecycle state. Exactly one value per process; every transition
/// goes through [`StateMachine::set`] so the engine loop serializes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    PendingActivation,
    Activated,
    WsConnecting,
    WsReady,
    Streaming,
}

impl DeviceState {
    /// Only these states may open a WebSocket.
    pub fn may_connect(self) -> bool {
        matches!(
            self,
            DeviceState::Activated
                | DeviceState::WsConnecting
                | DeviceState::WsReady
                | DeviceState::Streaming
        )
    }

    /// Only these states may send data over the socket.
    pub fn may_send(self) -> bool {
        matches!(self, DeviceState::WsReady | DeviceState::Streaming)
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Uninitialized => "uninitialized",
            DeviceState::PendingActivation => "pending_activation",
            DeviceState::Activated => "activated",
            DeviceState::WsConnecting => "ws_connecting",
            DeviceState::WsReady => "ws_ready",
            DeviceState::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

/// Sub-state while the device sits in `PendingActivation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationStage {
    Idle,
    NeedCode,
    Polling,
    Activated,
}

pub struct StateMachine {
    state: Mutex<DeviceState>,
    stage: Mutex<ActivationStage>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState::Uninitialized),
            stage: Mutex::new(ActivationStage::Idle),
        }
    }

    pub fn current(&self) -> DeviceState {
        *self.state.lock().unwrap()
    }

    pub fn set(&self, next: DeviceState) {
        let mut state = self.state.lock().unwrap();
        if *state != next {
            info!("device state: {} -> {}", *state, next);
            *state = next;
        }
    }

    pub fn stage(&self) -> ActivationStage {
        *self.stage.lock().unwrap()
    }

    pub fn set_stage(&self, next: ActivationStage) {
        let mut stage = self.stage.lock().unwrap();
        if *stage != next {
            debug!("activation stage: {:?} -> {:?}", *stage, next);
            *stage = next;
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
