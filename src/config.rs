// Конфигурация звонка
// Все поля имеют значения по умолчанию и могут быть загружены из JSON файла

use crate::error::ConfigError;
use crate::peer::state::{DEFAULT_WINDOW, GRACE_PERIOD};
use crate::peer::types::ServerConfig;
use crate::store::StoreLayout;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "docrtc.config.json";
const DEFAULT_POOL_SIZE: u8 = 10;
const DEFAULT_GRACE_PERIOD_SECS: u64 = GRACE_PERIOD.as_secs();
const DEFAULT_WINDOW_MS: u64 = DEFAULT_WINDOW.as_millis() as u64;
const DEFAULT_MODEL: &str = "whisper-1";
const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Settings for one call client.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub ice_candidate_pool_size: u8,
    pub layout: StoreLayout,
    /// Seconds to wait for a disconnected transport to recover.
    pub grace_period_secs: u64,
    pub transcription: TranscriptionConfig,
    pub log: LogConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_candidate_pool_size: DEFAULT_POOL_SIZE,
            layout: StoreLayout::default(),
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            transcription: TranscriptionConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub window_ms: u64,
    /// OpenAI-compatible transcription endpoint.
    pub endpoint: String,
    pub model: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            // В режиме отладки логирование включено
            enabled: cfg!(debug_assertions),
            filter: "docrtc=debug".to_string(),
        }
    }
}

fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-2".into(),
            r#type: "stun".into(),
            url: "stun:stun2.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

impl CallConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `docrtc.config.json` from the working directory when it exists.
    pub fn load_or_default() -> Result<(Self, Option<PathBuf>), ConfigError> {
        let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            let config = Self::from_file(&default_path)?;
            Ok((config, Some(default_path)))
        } else {
            Ok((Self::default(), None))
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "ICE server {} has an empty URL",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        if self.transcription.window_ms == 0 {
            return Err(ConfigError::Invalid(
                "transcription window must be longer than 0 ms".into(),
            ));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn transcription_window(&self) -> Duration {
        Duration::from_millis(self.transcription.window_ms)
    }
}
