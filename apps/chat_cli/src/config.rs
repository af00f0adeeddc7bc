use std::{fs, path::Path};

use anyhow::Context;
use client_core::config::{ClientConfig, ConversationWindow, DEFAULT_API_BASE, DEFAULT_PAGE_SIZE};
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "chat-client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_base: String,
    pub page_size: u32,
    pub log_filter: String,
    pub window: ConversationWindow,
    pub auto_reply: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.into(),
            page_size: DEFAULT_PAGE_SIZE,
            log_filter: "info".into(),
            window: ConversationWindow::default(),
            auto_reply: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base: Option<String>,
    page_size: Option<u32>,
    log_filter: Option<String>,
    upper_limit: Option<u32>,
    lower_limit: Option<u32>,
    auto_reply: Option<bool>,
}

impl Settings {
    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = ClientConfig::new(&self.api_base)
            .with_context(|| format!("invalid api base '{}'", self.api_base))?;
        config.page_size = self.page_size;
        config.conversation_window = self.window;
        Ok(config)
    }
}

/// Defaults, then `path` when it exists, then `CHAT_API_BASE` / `APP__*` variables.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
        apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid settings file '{}'", path.display()))?;
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file_cfg.api_base {
        settings.api_base = v;
    }
    if let Some(v) = file_cfg.page_size {
        settings.page_size = v;
    }
    if let Some(v) = file_cfg.log_filter {
        settings.log_filter = v;
    }
    if let Some(v) = file_cfg.upper_limit {
        settings.window.upper_limit = v;
    }
    if let Some(v) = file_cfg.lower_limit {
        settings.window.lower_limit = v;
    }
    if let Some(v) = file_cfg.auto_reply {
        settings.auto_reply = v;
    }
    Ok(())
}

fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("CHAT_API_BASE") {
        settings.api_base = v;
    }
    if let Some(v) = lookup("APP__API_BASE") {
        settings.api_base = v;
    }

    if let Some(v) = lookup("APP__PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.page_size = parsed;
        }
    }

    if let Some(v) = lookup("APP__LOG_FILTER") {
        settings.log_filter = v;
    }

    if let Some(v) = lookup("APP__AUTO_REPLY") {
        if let Ok(parsed) = v.parse::<bool>() {
            settings.auto_reply = parsed;
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
