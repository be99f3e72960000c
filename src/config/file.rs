// src/config/file.rs
// Optional ~/.torbo/config.toml for prompt and model preferences

use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Contents of the optional config file. Everything here can also come
/// from environment variables; the file wins when both are set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    /// Server-configured system prompt
    pub system_prompt: Option<String>,
    /// Default chat model
    pub default_model: Option<String>,
    /// Small model for background summarization
    pub summarizer_model: Option<String>,
}

impl FileConfig {
    /// Load from ~/.torbo/config.toml; missing file is not an error.
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            return Self::default();
        };
        Self::load_from(&path)
    }

    fn path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".torbo").join("config.toml"))
    }

    fn load_from(path: &PathBuf) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            debug!(path = %path.display(), "No config file, using defaults");
            return Self::default();
        };
        match toml::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse config file");
                Self::default()
            }
        }
    }
}
