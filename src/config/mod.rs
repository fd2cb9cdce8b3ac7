use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub album: AlbumConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbumConfig {
    /// Silence required before an album is considered complete.
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
    /// Reply to albums still pending at shutdown instead of dropping them.
    #[serde(default = "default_flush_on_shutdown")]
    pub flush_on_shutdown: bool,
}

fn default_quiet_period_ms() -> u64 {
    300
}

fn default_flush_on_shutdown() -> bool {
    true
}

impl Default for AlbumConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
            flush_on_shutdown: default_flush_on_shutdown(),
        }
    }
}

impl AlbumConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    pub bot_token: Option<String>,
    #[serde(default)]
    pub allowed_users: Vec<i64>,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u32,
}

fn default_poll_timeout() -> u32 {
    30
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content);
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.album.quiet_period_ms == 0 {
            return Err(RelayError::Config(
                "album.quiet_period_ms must be greater than zero".to_string(),
            ));
        }
        if let Some(tg) = &self.channels.telegram {
            if tg.enabled && tg.bot_token.as_deref().map_or(true, str::is_empty) {
                return Err(RelayError::Config(
                    "channels.telegram.bot_token is required when telegram is enabled"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".album-relay")
            .join("config.toml")
    }

    pub fn default_toml() -> &'static str {
        r#"[album]
quiet_period_ms = 300
flush_on_shutdown = true

[channels.telegram]
enabled = true
bot_token = "${BOT_TOKEN}"
allowed_users = []
poll_timeout_secs = 30
"#
    }
}

/// Substitute `${VAR_NAME}` patterns with environment variable values.
pub fn substitute_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_parses() {
        let config: Config = toml::from_str(Config::default_toml()).unwrap();
        assert_eq!(config.album.quiet_period_ms, 300);
        assert!(config.album.flush_on_shutdown);
        let tg = config.channels.telegram.unwrap();
        assert!(tg.enabled);
        assert_eq!(tg.poll_timeout_secs, 30);
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("ALBUM_RELAY_TEST_VAR", "hello123");
        let result = substitute_env_vars("key = \"${ALBUM_RELAY_TEST_VAR}\"");
        assert_eq!(result, "key = \"hello123\"");
        std::env::remove_var("ALBUM_RELAY_TEST_VAR");
    }

    #[test]
    fn test_missing_env_var_becomes_empty() {
        let result = substitute_env_vars("key = \"${NONEXISTENT_VAR_XYZ}\"");
        assert_eq!(result, "key = \"\"");
    }

    #[test]
    fn test_empty_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.album.quiet_period(), Duration::from_millis(300));
        assert!(config.channels.telegram.is_none());
    }

    #[test]
    fn test_zero_quiet_period_rejected() {
        let result = Config::parse("[album]\nquiet_period_ms = 0\n");
        assert!(matches!(result, Err(RelayError::Config(_))));
    }

    #[test]
    fn test_enabled_telegram_needs_token() {
        let result = Config::parse(
            "[channels.telegram]\nenabled = true\nbot_token = \"${ALBUM_RELAY_UNSET_TOKEN}\"\n",
        );
        assert!(matches!(result, Err(RelayError::Config(_))));

        let config = Config::parse("[channels.telegram]\nenabled = false\n").unwrap();
        assert!(!config.channels.telegram.unwrap().enabled);
    }

    #[test]
    fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[album]\nquiet_period_ms = 750\nflush_on_shutdown = false\n\n[channels.telegram]\nbot_token = \"abc\"\nallowed_users = [42]\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.album.quiet_period(), Duration::from_millis(750));
        assert!(!config.album.flush_on_shutdown);
        let tg = config.channels.telegram.unwrap();
        assert!(!tg.enabled);
        assert_eq!(tg.allowed_users, vec![42]);
    }

    #[test]
    fn test_load_missing_file() {
        let tmp = TempDir::new().unwrap();
        let result = Config::load(&tmp.path().join("nope.toml"));
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}
