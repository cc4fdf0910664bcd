use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use murmur_llm::{ProviderConfig, RIG_OPENAI_PROVIDER_ID};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::atomic::write_atomically;
use crate::error::AtomicWriteError;
use crate::session::{DEFAULT_MASK_NAME, Mask, ModelConfig};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_CHAT_PAGE_SIZE: usize = 15;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const SETTINGS_DIRECTORY_NAME: &str = "murmur";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "MURMUR_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSettings {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub model_config: ModelConfig,
    pub request_timeout_ms: u64,
    pub chat_page_size: usize,
    pub send_preview_bubble: bool,
    pub masks: Vec<Mask>,
    pub log_level: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            provider_id: RIG_OPENAI_PROVIDER_ID.to_string(),
            api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model_config: ModelConfig::default(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            chat_page_size: DEFAULT_CHAT_PAGE_SIZE,
            send_preview_bubble: true,
            masks: Vec::new(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.provider_id = if self.provider_id.trim().is_empty() {
            RIG_OPENAI_PROVIDER_ID.to_string()
        } else {
            self.provider_id.trim().to_string()
        };
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = self.endpoint.trim().to_string();
        self.model_config.model = self.model_config.model.trim().to_string();
        if self.model_config.model.is_empty() {
            self.model_config.model = ModelConfig::default().model;
        }
        if self.request_timeout_ms == 0 {
            self.request_timeout_ms = DEFAULT_REQUEST_TIMEOUT_MS;
        }
        self.chat_page_size = self.chat_page_size.max(1);
        self.log_level = self.log_level.trim().to_string();
        if self.log_level.is_empty() {
            self.log_level = DEFAULT_LOG_LEVEL.to_string();
        }

        // Presets without a name cannot be picked by `newm`.
        self.masks.retain(|mask| !mask.name.trim().is_empty());
        self
    }

    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint)
    }

    /// Mask for a fresh session: empty context, global model parameters.
    pub fn default_mask(&self) -> Mask {
        Mask::new(DEFAULT_MASK_NAME, self.model_config.clone())
    }

    pub fn find_mask(&self, name: &str) -> Option<Mask> {
        let name = name.trim();
        let mut mask = self
            .masks
            .iter()
            .find(|mask| mask.name.eq_ignore_ascii_case(name))
            .cloned()?;
        if mask.sync_global_config {
            mask.model_config = self.model_config.clone();
        }
        Some(mask)
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".murmur"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self::with_settings(config_path, settings)
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    /// Store seeded with explicit settings; nothing is read from disk.
    pub fn with_settings(config_path: PathBuf, settings: ChatSettings) -> Self {
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings.normalized())),
            config_path,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ChatSettings::default()))
            .merge(Json::file(path))
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .split("__")
                    .map(|key| camel_case_key(key.as_str()).into())
                    .lowercase(false),
            )
    }

    fn load_from_disk(path: &Path) -> ChatSettings {
        if !path.exists() {
            tracing::info!(?path, "settings file not found, using defaults and environment");
        }

        match Self::figment(path).extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(?path, %error, "failed to parse settings, using defaults");
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;
        write_atomically(&self.config_path, &content).context(SaveConfigSnafu {
            stage: "save-settings-file",
            path: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

/// `MODEL_CONFIG.SEND_MEMORY` -> `modelConfig.sendMemory`.
fn camel_case_key(raw: &str) -> String {
    let mut key = String::with_capacity(raw.len());
    let mut upper_next = false;
    for ch in raw.chars() {
        match ch {
            '_' => upper_next = true,
            '.' => {
                upper_next = false;
                key.push('.');
            }
            _ if upper_next => {
                upper_next = false;
                key.push(ch.to_ascii_uppercase());
            }
            _ => key.push(ch.to_ascii_lowercase()),
        }
    }
    key
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to save settings to {path:?} on `{stage}`: {source}"))]
    SaveConfig {
        stage: &'static str,
        path: PathBuf,
        source: AtomicWriteError,
    },
}
