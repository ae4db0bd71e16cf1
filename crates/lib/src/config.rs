//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.harbor/config.json`) and environment.
//! Missing file means defaults; env vars override individual secrets.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Agent defaults (model, token ceiling, tool toggles).
    #[serde(default)]
    pub agent: AgentConfig,

    /// Channel settings (e.g. Telegram).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Skills load paths.
    #[serde(default)]
    pub skills: SkillsConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 18789).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require connect.auth.token.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for WebSocket connect. Overridden by HARBOR_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require connect.auth.token to match configured token.
    Token,
}

fn default_gateway_port() -> u16 {
    18789
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Agent defaults (model, max tokens, browser tool).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Model name for the backend, exact name from `ollama list` (e.g. "llama3.2:latest").
    /// When unset, the gateway answers with a fixed "not configured" reply instead of
    /// calling a backend.
    pub model: Option<String>,

    /// Max tokens requested per model call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Browser automation tool settings.
    #[serde(default)]
    pub browser: BrowserConfig,
}

fn default_max_tokens() -> u32 {
    8192
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: default_max_tokens(),
            browser: BrowserConfig::default(),
        }
    }
}

/// Browser tool config: enable flag and the automation service endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    /// When true, the browser tool is offered to the model.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint of the automation service the tool delegates to.
    pub endpoint: Option<String>,
}

/// Per-channel config (e.g. Telegram bot token).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
}

/// Access policy for direct messages arriving from a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// First-time users receive a pairing code and must be approved before the
    /// agent sees their messages.
    #[default]
    Pairing,

    /// No pairing; optionally restricted by allowFrom.
    Open,
}

/// Telegram channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,

    /// Public URL Telegram POSTs updates to. The channel stays inactive without it.
    pub webhook_url: Option<String>,

    /// Optional secret for webhook verification (X-Telegram-Bot-Api-Secret-Token).
    pub webhook_secret: Option<String>,

    /// Who may talk to the assistant: "pairing" (default) or "open".
    #[serde(default)]
    pub dm_policy: DmPolicy,

    /// User ids allowed when dmPolicy is "open". Empty or "*" = everyone.
    #[serde(default)]
    pub allow_from: Vec<String>,
}

/// Skills load config (dirs).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillsConfig {
    /// Override the default skill root. Relative paths are resolved against the
    /// config file's parent. Omit or leave empty to use the default `skills`
    /// subdirectory (~/.harbor/skills when config is ~/.harbor/config.json).
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Extra skill directories (lowest precedence).
    #[serde(default)]
    pub extra_dirs: Vec<PathBuf>,
}

/// Resolve the gateway token: env HARBOR_GATEWAY_TOKEN overrides config.
/// Returns None when auth mode is "none" and no env token is set.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    std::env::var("HARBOR_GATEWAY_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            if config.gateway.auth.mode != GatewayAuthMode::Token {
                return None;
            }
            config
                .gateway
                .auth
                .token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    std::env::var("TELEGRAM_BOT_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .channels
                .telegram
                .bot_token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the Ollama base URL override from OLLAMA_BASE_URL, if set.
pub fn resolve_ollama_base_url() -> Option<String> {
    std::env::var("OLLAMA_BASE_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("HARBOR_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".harbor").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the default path (or HARBOR_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the config directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// File the session/pairing state is mirrored to: `state/sessions.json` next to the config file.
pub fn sessions_file(config_path: &Path) -> PathBuf {
    config_parent(config_path).join("state").join("sessions.json")
}

/// Default skill root when no override is set: `skills` subdirectory of the config file's parent.
pub fn skills_dir(config_path: &Path) -> PathBuf {
    config_parent(config_path).join("skills")
}

/// Resolve the primary skill root: uses `config.skills.directory` if set (relative paths resolved against the config file's parent), otherwise the default `skills` subdirectory.
pub fn resolve_skills_dir(config: &Config, config_path: &Path) -> PathBuf {
    match &config.skills.directory {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_parent(config_path).join(d)
            }
        }
        _ => skills_dir(config_path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 18789);
        assert_eq!(g.bind, "127.0.0.1");
        assert_eq!(g.auth.mode, GatewayAuthMode::None);
    }

    #[test]
    fn token_ignored_when_auth_mode_none() {
        let mut config = Config::default();
        config.gateway.auth.token = Some("secret".to_string());
        assert_eq!(resolve_gateway_token(&config), None);
        config.gateway.auth.mode = GatewayAuthMode::Token;
        assert_eq!(resolve_gateway_token(&config), Some("secret".to_string()));
    }

    #[test]
    fn sessions_file_lives_next_to_config() {
        let path = Path::new("/home/user/.harbor/config.json");
        assert_eq!(
            sessions_file(path),
            PathBuf::from("/home/user/.harbor/state/sessions.json")
        );
    }

    #[test]
    fn resolve_skills_dir_default() {
        let config = Config::default();
        let path = Path::new("/home/user/.harbor/config.json");
        assert_eq!(
            resolve_skills_dir(&config, path),
            PathBuf::from("/home/user/.harbor/skills")
        );
    }

    #[test]
    fn resolve_skills_dir_override_relative() {
        let mut config = Config::default();
        config.skills.directory = Some(PathBuf::from("custom/skills"));
        let path = Path::new("/home/user/.harbor/config.json");
        assert_eq!(
            resolve_skills_dir(&config, path),
            PathBuf::from("/home/user/.harbor/custom/skills")
        );
    }

    #[test]
    fn parses_channel_config() {
        let raw = r#"{
            "channels": {
                "telegram": { "dmPolicy": "open", "allowFrom": ["42", "*"] }
            }
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.channels.telegram.dm_policy, DmPolicy::Open);
        assert_eq!(config.channels.telegram.allow_from, vec!["42", "*"]);
    }
}
