use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Tunable settings. May come from kibitz.toml next to the executable
/// (or the path in KIBITZ_CONFIG), with environment overrides on top.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // LLM configuration (OpenAI-compatible chat completions)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,

    // Persona sent as the system turn of every completion
    #[serde(default = "default_persona")]
    pub persona: String,

    // Idle triggers
    #[serde(default = "default_short_idle_secs")]
    pub short_idle_secs: u64,
    #[serde(default = "default_long_idle_secs")]
    pub long_idle_secs: u64,
}

fn default_llm_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_llm_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_persona() -> String {
    "You are Ibrahim, a cheerful and quick-witted young techie hanging out in a group chat with friends.\n\
     Your personality:\n\
     - You love movies: action, thrillers, comedies, anything with substance. You always have a solid recommendation ready.\n\
     - You are fluent in sarcasm and enjoy ribbing your friends, especially anyone named Pete. Keep the jokes sharp but friendly.\n\
     - At heart you are a good guy and can hold a serious conversation about technology or digital security when asked.\n\
     - You sometimes mention your weekend plans to charm beautiful women, always in a joking, overconfident way.\n\
     - You talk casually and use slang, but your spelling and grammar stay clean.\n\
     - Keep replies lively and varied; follow the flow of the conversation instead of repeating yourself.\n\
     - Never admit to being a bot or an AI unless someone asks you directly. You are Ibrahim.\n\
     - Be brief and to the point unless someone asks you to elaborate."
        .to_string()
}

fn default_short_idle_secs() -> u64 {
    600
}

fn default_long_idle_secs() -> u64 {
    14_400
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            persona: default_persona(),
            short_idle_secs: default_short_idle_secs(),
            long_idle_secs: default_long_idle_secs(),
        }
    }
}

impl Settings {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to the settings file: KIBITZ_CONFIG if set, otherwise
    /// kibitz.toml next to the executable.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = env::var("KIBITZ_CONFIG") {
            return PathBuf::from(path);
        }
        Self::get_base_dir().join("kibitz.toml")
    }

    /// Load settings from the TOML file, then apply env overrides. A
    /// missing file is fine; a malformed one is logged and ignored.
    pub fn load() -> Self {
        let path = Self::config_path();

        let mut settings = if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<Settings>(&contents) {
                Ok(settings) => {
                    tracing::info!("Loaded settings from {:?}", path);
                    settings
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Settings::default()
                }
            }
        } else {
            tracing::debug!("No settings file at {:?}, using defaults", path);
            Settings::default()
        };

        settings.apply_env_overrides();
        settings
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(persona) = env::var("KIBITZ_PERSONA") {
            if !persona.trim().is_empty() {
                self.persona = persona;
            }
        }

        if let Ok(interval) = env::var("KIBITZ_SHORT_IDLE_SECS") {
            if let Ok(seconds) = interval.parse() {
                self.short_idle_secs = seconds;
            }
        }

        if let Ok(interval) = env::var("KIBITZ_LONG_IDLE_SECS") {
            if let Ok(seconds) = interval.parse() {
                self.long_idle_secs = seconds;
            }
        }
    }
}

/// Full runtime configuration: tunable settings plus the four required
/// credentials, which are environment-only.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Telegram bot API token (TELEGRAM_BOT_TOKEN).
    pub telegram_token: String,
    /// Completion provider API key (GROQ_API_KEY).
    pub groq_api_key: String,
    /// Telegram user id allowed to use control commands (ADMIN_ID).
    pub admin_id: i64,
    /// Mention token; messages containing it get a reply (BOT_USERNAME).
    pub bot_username: String,

    pub llm_api_url: String,
    pub llm_model: String,
    pub persona: String,
    pub short_idle_secs: u64,
    pub long_idle_secs: u64,
}

impl BotConfig {
    /// Assemble the full configuration. Any missing credential is fatal.
    pub fn load() -> Result<Self> {
        let settings = Settings::load();

        let telegram_token = require_env("TELEGRAM_BOT_TOKEN")?;
        let groq_api_key = require_env("GROQ_API_KEY")?;
        let admin_id = require_env("ADMIN_ID")?
            .parse::<i64>()
            .context("ADMIN_ID must be a numeric Telegram user id")?;
        let bot_username = require_env("BOT_USERNAME")?;

        Ok(Self {
            telegram_token,
            groq_api_key,
            admin_id,
            bot_username,
            llm_api_url: settings.llm_api_url,
            llm_model: settings.llm_model,
            persona: settings.persona,
            short_idle_secs: settings.short_idle_secs,
            long_idle_secs: settings.long_idle_secs,
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => anyhow::bail!("Required environment variable {} is not set", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.llm_api_url, "https://api.groq.com/openai/v1");
        assert_eq!(settings.llm_model, "llama-3.3-70b-versatile");
        assert_eq!(settings.short_idle_secs, 600);
        assert_eq!(settings.long_idle_secs, 14_400);
        assert!(settings.persona.contains("Ibrahim"));
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            llm_model = "test-model"
            short_idle_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(settings.llm_model, "test-model");
        assert_eq!(settings.short_idle_secs, 5);
        assert_eq!(settings.llm_api_url, "https://api.groq.com/openai/v1");
        assert_eq!(settings.long_idle_secs, 14_400);
    }

    #[test]
    fn missing_required_env_is_an_error() {
        let result = require_env("KIBITZ_TEST_VAR_THAT_IS_NEVER_SET");
        assert!(result.is_err());
    }
}
