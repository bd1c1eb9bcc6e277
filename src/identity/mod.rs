use rand::Rng;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{
    SecureStore, KEY_ACTIVATED, KEY_CLIENT_ID, KEY_DEVICE_ID, KEY_HMAC_KEY, KEY_SERIAL,
};

/// The persisted device identity tuple. Created once per factory reset and
/// stable across restarts; the server binds an account to it without ever
/// seeing the symmetric key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Locally-administered MAC, `02:00:00:xx:xx:xx`, lowercase hex.
    pub device_id: String,
    /// RFC-4122 v4 UUID, lowercase hyphenated.
    pub client_id: String,
    /// `SN-<8 uppercase hex>-<12 uppercase hex>`; the tail is derived from
    /// `device_id` with colons removed.
    pub serial: String,
    /// 32 random bytes as 64 lowercase hex chars.
    pub hmac_key: String,
    pub activated: bool,
}

pub struct IdentityManager {
    store: Arc<SecureStore>,
}

impl IdentityManager {
    pub fn new(store: Arc<SecureStore>) -> Self {
        Self { store }
    }

    /// Returns the stored identity, generating and persisting a fresh one if
    /// `force_new` is set or any of the four identity fields is missing.
    pub fn current(&self, force_new: bool) -> Result<DeviceIdentity> {
        if !force_new {
            if let Some(identity) = self.load() {
                return Ok(identity);
            }
        }

        let identity = generate_identity();
        // All five fields land in one atomic file replacement.
        self.store.set_many(&[
            (KEY_DEVICE_ID, &identity.device_id),
            (KEY_CLIENT_ID, &identity.client_id),
            (KEY_SERIAL, &identity.serial),
            (KEY_HMAC_KEY, &identity.hmac_key),
            (KEY_ACTIVATED, "false"),
        ])?;
        info!(
            "provisioned new device identity: mac={} serial={}",
            identity.device_id, identity.serial
        );
        Ok(identity)
    }

    pub fn mark_activated(&self) -> Result<()> {
        self.store.set(KEY_ACTIVATED, "true")
    }

    pub fn reset_all(&self) -> Result<()> {
        info!("resetting device identity and session config");
        self.store.clear_all()
    }

    fn load(&self) -> Option<DeviceIdentity> {
        let device_id = non_empty(self.store.get(KEY_DEVICE_ID)?)?;
        let client_id = non_empty(self.store.get(KEY_CLIENT_ID)?)?;
        let serial = non_empty(self.store.get(KEY_SERIAL)?)?;
        let hmac_key = non_empty(self.store.get(KEY_HMAC_KEY)?)?;
        let activated = self.store.get(KEY_ACTIVATED).as_deref() == Some("true");
        Some(DeviceIdentity {
            device_id,
            client_id,
            serial,
            hmac_key,
            activated,
        })
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn generate_identity() -> DeviceIdentity {
    let mut rng = rand::rng();

    let tail: [u8; 3] = rng.random();
    let device_id = format!(
        "02:00:00:{:02x}:{:02x}:{:02x}",
        tail[0], tail[1], tail[2]
    );

    let client_id = Uuid::new_v4().to_string();

    let sn_prefix: [u8; 4] = rng.random();
    let serial = format!(
        "SN-{}-{}",
        hex::encode_upper(sn_prefix),
        serial_tail(&device_id)
    );

    let mut key = [0u8; 32];
    rng.fill(&mut key);
    let hmac_key = hex::encode(key);

    DeviceIdentity {
        device_id,
        client_id,
        serial,
        hmac_key,
        activated: false,
    }
}

/// Last 12 hex chars of the MAC with colons removed, uppercased, right-padded
/// with `0` if shorter.
fn serial_tail(device_id: &str) -> String {
    let mut hex: String = device_id
        .chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_uppercase();
    while hex.len() < 12 {
        hex.push('0');
    }
    hex.split_off(hex.len() - 12)
}

/// Masks an identifier for logs, keeping the first and last four characters.
/// The six-character activation code is the only secret shown verbatim.
pub fn mask(s: &str) -> String {
    if s.len() <= 8 {
        return "****".to_string();
    }
    format!("{}****{}", &s[..4], &s[s.len() - 4..])
}
