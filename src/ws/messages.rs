use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{EngineError, Result};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus".to_string(),
            sample_rate: 16000,
            channels: 1,
            frame_duration: 60,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AudioParamsResponse {
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub frame_duration: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    Auto,
    Manual,
}

impl ListenMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenMode::Auto => "auto",
            ListenMode::Manual => "manual",
        }
    }
}

/// Messages the device sends to the server.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        version: u32,
        transport: String,
        features: Value,
        audio_params: AudioParams,
    },
    Listen {
        session_id: String,
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Mcp {
        payload: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn hello() -> Self {
        ClientMessage::Hello {
            version: 1,
            transport: "websocket".to_string(),
            features: json!({ "mcp": true }),
            audio_params: AudioParams::default(),
        }
    }

    pub fn listen_start(session_id: impl Into<String>, mode: ListenMode) -> Self {
        ClientMessage::Listen {
            session_id: session_id.into(),
            state: "start".to_string(),
            mode: Some(mode.as_str().to_string()),
            text: None,
        }
    }

    pub fn listen_stop(session_id: impl Into<String>) -> Self {
        ClientMessage::Listen {
            session_id: session_id.into(),
            state: "stop".to_string(),
            mode: None,
            text: None,
        }
    }

    /// Injects a textual utterance as if it had been detected by the wake
    /// pipeline.
    pub fn listen_detect(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        ClientMessage::Listen {
            session_id: session_id.into(),
            state: "detect".to_string(),
            mode: None,
            text: Some(text.into()),
        }
    }

    pub fn mcp(payload: Value, session_id: Option<String>) -> Self {
        ClientMessage::Mcp {
            payload,
            session_id,
        }
    }
}

/// Known messages the server sends to the device.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        transport: Option<String>,
        #[serde(default)]
        audio_params: Option<AudioParamsResponse>,
    },
    Tts {
        state: String,
        #[serde(default)]
        text: Option<String>,
    },
    Llm {
        #[serde(default)]
        emotion: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    Mcp {
        payload: Value,
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// Classification of an inbound JSON value: a known server message or an
/// opaque payload carried through for logging.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Known(ServerMessage),
    Unknown(Value),
}

/// A recognized `type` tag with a body that fails to deserialize is a
/// protocol error; an unrecognized tag is not.
pub fn classify(value: Value) -> Result<InboundMessage> {
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string);
    let known = matches!(
        tag.as_deref(),
        Some("hello") | Some("tts") | Some("llm") | Some("mcp")
    );
    if !known {
        return Ok(InboundMessage::Unknown(value));
    }
    let tag = tag.unwrap_or_default();
    let msg = serde_json::from_value::<ServerMessage>(value)
        .map_err(|e| EngineError::Protocol(format!("malformed {} message: {}", tag, e)))?;
    Ok(InboundMessage::Known(msg))
}
