// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::ConfigError;
use crate::media::MediaConstraints;
use crate::peer::types::ServerConfig;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Публичные STUN серверы по умолчанию
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Настройки сессии меша
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    /// Имя, которое получат остальные через `user-info`
    pub display_name: String,
    /// Заданный id делает эту сессию лидером
    pub rendezvous_id: Option<String>,
    pub ice_servers: Vec<ServerConfig>,
    pub media: MediaConstraints,
    /// Ёмкость буфера уведомлений для подписчиков
    pub change_buffer: usize,
    pub log_filter: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            display_name: "anonymous".into(),
            rendezvous_id: None,
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            media: MediaConstraints::default(),
            change_buffer: 64,
            log_filter: "info".into(),
        }
    }
}

impl MeshConfig {
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.display_name.trim().is_empty() {
            return Err(ConfigError::Invalid("display name cannot be empty".into()));
        }
        if self.change_buffer == 0 {
            return Err(ConfigError::Invalid("change buffer must be positive".into()));
        }

        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "ICE server `{}` has an empty URL",
                    server.id
                )));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
                return Err(ConfigError::Invalid(format!(
                    "TURN server `{}` requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }
}
