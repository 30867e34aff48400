use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
    #[serde(default = "default_database_config")]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscordConfig {
    pub bot_token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatrixConfig {
    /// Home server host name, without scheme (e.g. "matrix.org")
    #[serde(default = "default_home_server")]
    pub home_server: String,
    /// Not validated here; a bad token surfaces as whoami failures.
    #[serde(default)]
    pub access_token: String,
}

impl MatrixConfig {
    /// Base URL for client-server API requests. Accepts a bare host or a full URL.
    pub fn base_url(&self) -> String {
        let hs = self.home_server.trim_end_matches('/');
        if hs.starts_with("http://") || hs.starts_with("https://") {
            hs.to_string()
        } else {
            format!("https://{}", hs)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BridgeConfig {
    /// Telegram chat <-> Matrix room pairs
    #[serde(default)]
    pub matrix_rooms: Vec<MatrixRoomLink>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MatrixRoomLink {
    pub chat_id: String,
    pub room_id: String,
}

fn default_home_server() -> String {
    "matrix.org".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("chatbridge.db")
}

fn default_database_config() -> DatabaseConfig {
    DatabaseConfig {
        path: default_db_path(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }
}

impl BridgeConfig {
    /// Matrix room paired with a Telegram chat, if any
    pub fn matrix_room_for_chat(&self, chat_id: &str) -> Option<&str> {
        self.matrix_rooms
            .iter()
            .find(|l| l.chat_id == chat_id)
            .map(|l| l.room_id.as_str())
    }

    /// Telegram chat paired with a Matrix room, if any
    pub fn chat_for_matrix_room(&self, room_id: &str) -> Option<&str> {
        self.matrix_rooms
            .iter()
            .find(|l| l.room_id == room_id)
            .map(|l| l.chat_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = Config::parse(
            r#"
            [telegram]
            bot_token = "tg"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.telegram.bot_token, "tg");
        assert!(cfg.discord.is_none());
        assert!(cfg.matrix.is_none());
        assert_eq!(cfg.database.path, PathBuf::from("chatbridge.db"));
        assert!(cfg.bridge.matrix_rooms.is_empty());
    }

    #[test]
    fn test_matrix_home_server_defaults_to_matrix_org() {
        let cfg = Config::parse(
            r#"
            [telegram]
            bot_token = "tg"

            [matrix]
            access_token = "secret"
            "#,
        )
        .unwrap();
        let matrix = cfg.matrix.unwrap();
        assert_eq!(matrix.home_server, "matrix.org");
        assert_eq!(matrix.base_url(), "https://matrix.org");
    }

    #[test]
    fn test_matrix_base_url_keeps_explicit_scheme() {
        let matrix = MatrixConfig {
            home_server: "http://localhost:8008/".to_string(),
            access_token: String::new(),
        };
        assert_eq!(matrix.base_url(), "http://localhost:8008");
    }

    #[test]
    fn test_missing_access_token_is_accepted() {
        let cfg = Config::parse(
            r#"
            [telegram]
            bot_token = "tg"

            [matrix]
            home_server = "example.org"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.matrix.unwrap().access_token, "");
    }

    #[test]
    fn test_matrix_room_lookup_both_directions() {
        let cfg = Config::parse(
            r#"
            [telegram]
            bot_token = "tg"

            [[bridge.matrix_rooms]]
            chat_id = "-100123"
            room_id = "!abc:matrix.org"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.bridge.matrix_room_for_chat("-100123"), Some("!abc:matrix.org"));
        assert_eq!(cfg.bridge.chat_for_matrix_room("!abc:matrix.org"), Some("-100123"));
        assert_eq!(cfg.bridge.matrix_room_for_chat("-1"), None);
    }

    #[test]
    fn test_example_config_parses() {
        let cfg = Config::parse(include_str!("../config.example.toml")).unwrap();
        assert!(cfg.discord.is_some());
        assert_eq!(cfg.bridge.matrix_rooms.len(), 1);
    }

    #[test]
    fn test_missing_telegram_section_fails() {
        assert!(Config::parse("[database]\npath = \"x.db\"\n").is_err());
    }
}
