use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::identity::{mask, DeviceIdentity, IdentityManager};
use crate::ota::{ActivateStatus, OtaClient};
use crate::state::{ActivationStage, DeviceState, StateMachine};
use crate::store::{SecureStore, KEY_WS_TOKEN, KEY_WS_URL};

const MAX_POLL_ATTEMPTS: u32 = 60;
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What `begin` resolved to.
#[derive(Debug, Clone)]
pub enum ActivationOutcome {
    /// The device is bound and the session config is persisted (or was
    /// already); the engine may connect.
    Activated,
    /// The user must enter `code` externally, then the host calls
    /// `complete_activation(challenge)`.
    NeedCode {
        code: String,
        challenge: String,
        timeout_ms: Option<u64>,
        /// Server-provided prompt accompanying the code, shown as-is.
        message: Option<String>,
    },
}

/// Drives the two-phase activation handshake end-to-end.
pub struct Activator {
    store: Arc<SecureStore>,
    identity: Arc<IdentityManager>,
    ota: Arc<OtaClient>,
    state: Arc<StateMachine>,
    max_attempts: u32,
    poll_interval: Duration,
}

impl Activator {
    pub fn new(
        store: Arc<SecureStore>,
        identity: Arc<IdentityManager>,
        ota: Arc<OtaClient>,
        state: Arc<StateMachine>,
    ) -> Self {
        Self {
            store,
            identity,
            ota,
            state,
            max_attempts: MAX_POLL_ATTEMPTS,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Overrides the polling cadence. Tests only; the protocol bound is
    /// 60 attempts at 5 s.
    #[doc(hidden)]
    pub fn with_polling(mut self, max_attempts: u32, poll_interval: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.poll_interval = poll_interval;
        self
    }

    /// Gateway decision: loads (or provisions) the identity, asks the OTA
    /// endpoint for config, and either finishes activation (direct grant) or
    /// surfaces the verification code.
    pub async fn begin(&self, force_new: bool) -> Result<ActivationOutcome> {
        if force_new {
            self.identity.reset_all()?;
            self.state.set(DeviceState::Uninitialized);
            self.state.set_stage(ActivationStage::Idle);
        }

        let identity = self.identity.current(force_new)?;
        if identity.activated {
            info!("device {} already activated", identity.device_id);
            self.state.set(DeviceState::Activated);
            self.state.set_stage(ActivationStage::Activated);
            return Ok(ActivationOutcome::Activated);
        }

        self.state.set(DeviceState::PendingActivation);
        let resp = self.ota.request_config(&identity).await?;

        // The activation branch wins when both are present: an unbound device must prove
        // key possession before using the session config.
        if let Some(act) = resp.activation {
            info!("activation required, verification code {}", act.code);
            if let Some(message) = &act.message {
                info!("activation message: {}", message);
            }
            if let Some(timeout_ms) = act.timeout_ms {
                info!("code expires in {} ms", timeout_ms);
            }
            self.state.set_stage(ActivationStage::NeedCode);
            return Ok(ActivationOutcome::NeedCode {
                code: act.code,
                challenge: act.challenge,
                timeout_ms: act.timeout_ms,
                message: act.message,
            });
        }

        if let Some(ws) = resp.websocket {
            self.persist_session(&ws.url, &ws.token)?;
            self.identity.mark_activated()?;
            self.state.set(DeviceState::Activated);
            self.state.set_stage(ActivationStage::Activated);
            info!("device authorized directly, ws endpoint {}", ws.url);
            return Ok(ActivationOutcome::Activated);
        }

        Err(EngineError::Protocol(
            "OTA response carried neither activation nor websocket".to_string(),
        ))
    }

    /// Code-branch completion: signs the challenge and polls `ota/activate`
    /// until the user has bound the code, then fetches the session config.
    pub async fn submit(&self, challenge: &str) -> Result<()> {
        let identity = self.identity.current(false)?;

        // Completeness check before the first request; missing parameters
        // fail fast and are not retried.
        if identity.serial.is_empty() || challenge.is_empty() || identity.hmac_key.is_empty() {
            self.state.set_stage(ActivationStage::Idle);
            return Err(EngineError::Activation(
                "missing serial, challenge or hmac key".to_string(),
            ));
        }

        let hmac_hex = sign_challenge(&identity.hmac_key, challenge)?;
        info!(
            "submitting activation: serial={} challenge={} hmac={}",
            identity.serial,
            mask(challenge),
            mask(&hmac_hex)
        );

        self.state.set_stage(ActivationStage::Polling);
        for attempt in 1..=self.max_attempts {
            let status = match self.ota.poll_activate(&identity, challenge, &hmac_hex).await {
                Ok(status) => status,
                Err(e) => {
                    self.state.set_stage(ActivationStage::Idle);
                    return Err(e);
                }
            };
            match status {
                ActivateStatus::Done => {
                    info!("activation confirmed after {} attempts", attempt);
                    return self.finish(&identity).await;
                }
                ActivateStatus::Pending => {
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
                ActivateStatus::Rejected(status) => {
                    self.state.set_stage(ActivationStage::Idle);
                    return Err(EngineError::Activation(format!(
                        "activation rejected with status {}",
                        status
                    )));
                }
            }
        }

        self.state.set_stage(ActivationStage::Idle);
        Err(EngineError::Activation(format!(
            "activation not confirmed after {} attempts",
            self.max_attempts
        )))
    }

    /// After a 200, a second `request_config` must yield the websocket
    /// config. If it does not, the device counts as activated but the engine
    /// must not attempt a connection.
    async fn finish(&self, identity: &DeviceIdentity) -> Result<()> {
        let resp = match self.ota.request_config(identity).await {
            Ok(resp) => resp,
            Err(e) => {
                self.state.set_stage(ActivationStage::Idle);
                return Err(e);
            }
        };
        match resp.websocket {
            Some(ws) => {
                self.persist_session(&ws.url, &ws.token)?;
                self.identity.mark_activated()?;
                self.state.set(DeviceState::Activated);
                self.state.set_stage(ActivationStage::Activated);
                Ok(())
            }
            None => {
                warn!("activated but OTA config still lacks a websocket section");
                self.identity.mark_activated()?;
                self.state.set(DeviceState::Activated);
                self.state.set_stage(ActivationStage::Activated);
                Err(EngineError::Config(
                    "no websocket config after activation".to_string(),
                ))
            }
        }
    }

    fn persist_session(&self, url: &str, token: &str) -> Result<()> {
        self.store
            .set_many(&[(KEY_WS_URL, url), (KEY_WS_TOKEN, token)])
    }
}

/// `HMAC-SHA256(hex_decode(hmac_key), challenge)` as lowercase hex.
pub fn sign_challenge(hmac_key_hex: &str, challenge: &str) -> Result<String> {
    let key = hex::decode(hmac_key_hex)
        .map_err(|e| EngineError::Activation(format!("hmac key is not hex: {}", e)))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&key)
        .map_err(|e| EngineError::Activation(format!("hmac init: {}", e)))?;
    mac.update(challenge.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_challenge_matches_rfc4231_vector() {
        // RFC 4231 test case 2: key "Jefe", data "what do ya want for nothing?".
        let sig = sign_challenge("4a656665", "what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn sign_challenge_is_lowercase_hex() {
        let key = hex::encode([7u8; 32]);
        let sig = sign_challenge(&key, "challenge").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn sign_challenge_rejects_non_hex_key() {
        assert!(sign_challenge("zz", "c").is_err());
    }
}
