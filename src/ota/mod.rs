pub mod types;

use reqwest::StatusCode;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{EngineError, Result};
use crate::identity::{mask, DeviceIdentity};
use types::*;

/// Outcome of one `poll_activate` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateStatus {
    /// 200: the user bound the code; activation is complete.
    Done,
    /// 202: the user has not entered the code yet.
    Pending,
    /// Any other status: permanent failure for this attempt.
    Rejected(u16),
}

/// HTTPS client for the two OTA endpoints: `<base>ota/` and
/// `<base>ota/activate`.
pub struct OtaClient {
    http: reqwest::Client,
    base_url: String,
    user_agent: String,
    board_type: String,
    board_name: String,
    app_version: String,
}

impl OtaClient {
    pub fn new(config: &ClientConfig) -> Self {
        let user_agent = format!(
            "{}/{}-{}",
            config.board.board_type, config.board.name, config.application.version
        );
        Self {
            http: reqwest::Client::new(),
            base_url: config.ota.base_url.clone(),
            user_agent,
            board_type: config.board.board_type.clone(),
            board_name: config.board.name.clone(),
            app_version: config.application.version.clone(),
        }
    }

    /// POST `<base>ota/`. Returns the parsed response; the caller decides
    /// between the activation branch and the websocket branch.
    pub async fn request_config(&self, identity: &DeviceIdentity) -> Result<OtaResponse> {
        let url = format!("{}ota/", self.base_url);
        let body = ConfigRequest {
            application: ApplicationInfo {
                version: self.app_version.clone(),
                elf_sha256: identity.hmac_key.clone(),
            },
            board: BoardInfo {
                board_type: self.board_type.clone(),
                name: self.board_name.clone(),
                ip: "0.0.0.0".to_string(),
                mac: identity.device_id.clone(),
            },
        };

        debug!("requesting OTA config for device {}", identity.device_id);
        let resp = self
            .http
            .post(&url)
            .header("Device-Id", &identity.device_id)
            .header("Client-Id", &identity.client_id)
            .header("Activation-Version", "2")
            .header("User-Agent", &self.user_agent)
            .header("Accept-Language", "zh-CN")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::Network(format!(
                "OTA config request returned {}",
                status
            )));
        }

        let parsed: OtaResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Protocol(format!("malformed OTA response: {}", e)))?;

        if let Some(fw) = &parsed.firmware {
            if !fw.version.is_empty() {
                info!("server advertises firmware version {}", fw.version);
            }
        }
        Ok(parsed)
    }

    /// POST `<base>ota/activate` with the HMAC proof of key possession.
    pub async fn poll_activate(
        &self,
        identity: &DeviceIdentity,
        challenge: &str,
        hmac_hex: &str,
    ) -> Result<ActivateStatus> {
        let url = format!("{}ota/activate", self.base_url);
        let body = ActivateRequest {
            payload: ActivatePayload {
                algorithm: "hmac-sha256".to_string(),
                serial_number: identity.serial.clone(),
                challenge: challenge.to_string(),
                hmac: hmac_hex.to_string(),
            },
        };

        debug!(
            "polling activation for serial {} (hmac {})",
            identity.serial,
            mask(hmac_hex)
        );
        let resp = self
            .http
            .post(&url)
            .header("Device-Id", &identity.device_id)
            .header("Client-Id", &identity.client_id)
            .header("Activation-Version", "2")
            .header("User-Agent", &self.user_agent)
            .header("Accept-Language", "zh-CN")
            .json(&body)
            .send()
            .await?;

        Ok(match resp.status() {
            StatusCode::OK => ActivateStatus::Done,
            StatusCode::ACCEPTED => ActivateStatus::Pending,
            other => ActivateStatus::Rejected(other.as_u16()),
        })
    }
}
