use serde::{Deserialize, Serialize};

// Request bodies.

#[derive(Serialize, Debug)]
pub struct ConfigRequest {
    pub application: ApplicationInfo,
    pub board: BoardInfo,
}

#[derive(Serialize, Debug)]
pub struct ApplicationInfo {
    pub version: String,
    /// The service repurposes this firmware-checksum field to carry the
    /// device's HMAC key in hex.
    pub elf_sha256: String,
}

#[derive(Serialize, Debug)]
pub struct BoardInfo {
    #[serde(rename = "type")]
    pub board_type: String,
    pub name: String,
    pub ip: String,
    pub mac: String,
}

#[derive(Serialize, Debug)]
pub struct ActivateRequest {
    #[serde(rename = "Payload")]
    pub payload: ActivatePayload,
}

#[derive(Serialize, Debug)]
pub struct ActivatePayload {
    pub algorithm: String,
    pub serial_number: String,
    pub challenge: String,
    pub hmac: String,
}

// Response payloads. The public service emits lowercase keys; the open-source
// server emits PascalCase. Aliases accept both.

#[derive(Deserialize, Debug, Default)]
pub struct OtaResponse {
    #[serde(default, alias = "Activation")]
    pub activation: Option<ActivationInfo>,
    #[serde(default, alias = "Websocket", alias = "WebSocket")]
    pub websocket: Option<WebsocketInfo>,
    #[serde(default, alias = "Firmware")]
    pub firmware: Option<FirmwareInfo>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ActivationInfo {
    #[serde(alias = "Code")]
    pub code: String,
    #[serde(alias = "Challenge")]
    pub challenge: String,
    #[serde(default, alias = "TimeoutMs")]
    pub timeout_ms: Option<u64>,
    #[serde(default, alias = "Message")]
    pub message: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct WebsocketInfo {
    #[serde(alias = "Url")]
    pub url: String,
    #[serde(alias = "Token")]
    pub token: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FirmwareInfo {
    #[serde(default, alias = "Version")]
    pub version: String,
    #[serde(default, alias = "Url")]
    pub url: String,
}
