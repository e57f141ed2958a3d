use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use docchat_client::config::DEFAULT_REQUEST_TIMEOUT;
use docchat_client::stream::ReconnectPolicy;
use docchat_client::{ClientConfig, ClientResult, TransportMode};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "docchat";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const STORAGE_FILE_NAME: &str = "storage.db";
pub const ENV_PREFIX: &str = "DOCCHAT_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredTransport {
    #[default]
    Rest,
    Streaming,
}

impl From<PreferredTransport> for TransportMode {
    fn from(value: PreferredTransport) -> Self {
        match value {
            PreferredTransport::Rest => Self::Rest,
            PreferredTransport::Streaming => Self::Streaming,
        }
    }
}

impl From<TransportMode> for PreferredTransport {
    fn from(value: TransportMode) -> Self {
        match value {
            TransportMode::Rest => Self::Rest,
            TransportMode::Streaming => Self::Streaming,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Backend origin; falls back to `DOCCHAT_ORIGIN`, then the built-in default.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub stream_base_url: Option<String>,
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
    #[serde(default)]
    pub transport: PreferredTransport,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            stream_base_url: None,
            storage_path: None,
            transport: PreferredTransport::default(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl AppSettings {
    pub fn normalized(mut self) -> Self {
        self.base_url = non_blank(self.base_url);
        self.stream_base_url = non_blank(self.stream_base_url);
        self.storage_path = self
            .storage_path
            .filter(|path| !path.as_os_str().is_empty());
        if self.reconnect_delay_ms == 0 {
            self.reconnect_delay_ms = default_reconnect_delay_ms();
        }
        if self.reconnect_attempts == 0 {
            self.reconnect_attempts = default_reconnect_attempts();
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }
        self
    }

    pub fn client_config(&self) -> ClientResult<ClientConfig> {
        let config =
            ClientConfig::resolve(self.base_url.as_deref(), self.stream_base_url.as_deref())?;
        Ok(config
            .with_reconnect(ReconnectPolicy::new(
                Duration::from_millis(self.reconnect_delay_ms),
                self.reconnect_attempts,
            ))
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs)))
    }

    pub fn storage_location(&self) -> PathBuf {
        self.storage_path
            .clone()
            .unwrap_or_else(SettingsStore::default_storage_path)
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".docchat"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn default_storage_path() -> PathBuf {
        dirs::data_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".docchat"))
            .join(STORAGE_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Defaults, then the JSON file if present, then `DOCCHAT_*` variables.
    fn load_from_disk(path: &Path) -> AppSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(AppSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_reconnect_delay_ms() -> u64 {
    ReconnectPolicy::default().base_delay.as_millis() as u64
}

fn default_reconnect_attempts() -> u32 {
    ReconnectPolicy::default().max_attempts
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}
