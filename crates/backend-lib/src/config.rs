// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Application settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Log level
    pub log_level: String,
    /// Canvas geometry bounds for draw validation
    pub canvas: CanvasSettings,
    /// Chat relay limits
    pub chat: ChatSettings,
    /// Room admission control
    pub room: RoomSettings,
    /// Vision model gate
    pub ai: AiSettings,
}

/// Draw events outside these bounds are dropped, not clamped.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CanvasSettings {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// Maximum chat body length in characters; longer bodies are truncated
    pub max_message_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoomSettings {
    /// Distinct-participant cap per room; `None` means unbounded
    pub max_participants: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    /// API key for the vision model provider
    pub api_key: String,
    /// Model name
    pub model: String,
    /// Full endpoint override, mainly for tests and proxies
    pub endpoint: Option<String>,
    /// Hard budget for one model call
    pub timeout_secs: u64,
    /// Minimum interval between submissions from the same room
    pub cooldown_secs: u64,
    /// Byte ceiling for the decoded image payload
    pub max_image_bytes: usize,
    /// Below this the sketch is treated as effectively blank
    pub min_image_bytes: usize,
    /// Token budget passed to the model
    pub max_output_tokens: u32,
    /// Sampling temperature; low for deterministic-ish answers
    pub temperature: f32,
    /// Prompt used when the client supplies none
    pub prompt: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().unwrap(),
            log_level: "info".to_string(),
            canvas: CanvasSettings::default(),
            chat: ChatSettings::default(),
            room: RoomSettings::default(),
            ai: AiSettings::default(),
        }
    }
}

impl Default for CanvasSettings {
    fn default() -> Self {
        Self {
            width: 1920.0,
            height: 1080.0,
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_message_len: 200,
        }
    }
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_participants: None,
        }
    }
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-1.5-flash".to_string(),
            endpoint: None,
            timeout_secs: 15,
            cooldown_secs: 10,
            max_image_bytes: 4 * 1024 * 1024,
            min_image_bytes: 1024,
            max_output_tokens: 1024,
            temperature: 0.2,
            prompt: "Solve the problem shown in this sketch step by step. \
                     Number each step and state the final answer on its own line."
                .to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `config.toml` and `SKETCHSYNC_`-prefixed
    /// environment variables; env vars win.
    pub fn load() -> Result<Self> {
        let settings = Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("SKETCHSYNC_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Load settings from an explicit file path, still honoring env vars.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SKETCHSYNC_").split("__"))
            .extract()?;
        Ok(settings)
    }
}
