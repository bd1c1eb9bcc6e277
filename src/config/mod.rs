use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default)]
    pub ota: OtaSettings,
    #[serde(default)]
    pub board: BoardSettings,
    #[serde(default)]
    pub application: ApplicationSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub audio: AudioSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OtaSettings {
    /// Base URL of the OTA surface. Must end with `/`; the two endpoint
    /// paths `ota/` and `ota/activate` are appended to it.
    #[serde(default = "default_ota_base")]
    pub base_url: String,
}

fn default_ota_base() -> String {
    "https://api.tenclass.net/xiaozhi/".to_string()
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            base_url: default_ota_base(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BoardSettings {
    #[serde(rename = "type", default = "default_board_type")]
    pub board_type: String,
    #[serde(default = "default_board_name")]
    pub name: String,
}

fn default_board_type() -> String {
    "virtual-device".to_string()
}

fn default_board_name() -> String {
    "xiaozhi-client".to_string()
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            board_type: default_board_type(),
            name: default_board_name(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationSettings {
    #[serde(default = "default_app_version")]
    pub version: String,
}

fn default_app_version() -> String {
    "1.0.0".to_string()
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            version: default_app_version(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Path of the persisted device-identity file.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_path() -> String {
    "xiaozhi_device.json".to_string()
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AudioSettings {
    #[serde(default = "default_audio_enable")]
    pub enable: bool,
}

fn default_audio_enable() -> bool {
    true
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            enable: default_audio_enable(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("Settings.toml").required(false))
            .add_source(config::Environment::with_prefix("XIAOZHI").separator("__"));

        builder.build()?.try_deserialize()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ota: OtaSettings::default(),
            board: BoardSettings::default(),
            application: ApplicationSettings::default(),
            storage: StorageSettings::default(),
            audio: AudioSettings::default(),
        }
    }
}
