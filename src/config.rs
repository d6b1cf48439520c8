// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section has defaults, so a missing file or a missing key is fine.
// A file that fails to parse is replaced by the defaults. Loading runs before
// the logger exists, so problems come back as notes for the caller to log.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub runtime: RuntimeConfig,
    pub debug: DebugConfig,
    pub demo: DemoConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vk-runtime".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Settings consumed by `VulkanRuntime::new`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub app_name: String,
    /// Vendor id accepted for integrated GPUs when no discrete GPU exists
    pub preferred_integrated_vendor: u32,
    pub validation_layers: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            app_name: "vk-runtime".to_string(),
            preferred_integrated_vendor: 0x8086,
            validation_layers: cfg!(debug_assertions),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// `error`, `warn`, `info`, `debug` or `trace`; `RUST_LOG` wins if set
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Smoke-test binary settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub clear_color: [f32; 4],
    /// SPIR-V file loaded once at startup to check the shader path
    pub shader: Option<PathBuf>,
    /// Stop after this many frames; 0 runs until the window closes
    pub frame_limit: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.1, 0.2, 0.8, 1.0],
            shader: None,
            frame_limit: 0,
        }
    }
}

impl Config {
    /// Load `config.toml`, falling back to defaults if it is missing or broken.
    /// The notes describe anything that was ignored.
    pub fn load() -> (Self, Vec<String>) {
        Self::load_or_default("config.toml")
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Vec<String>) {
        let path = path.as_ref();
        let mut notes = Vec::new();

        let config = Self::load_from_path(path).unwrap_or_else(|e| {
            notes.push(format!("Failed to load {:?}: {:#}. Using defaults.", path, e));
            Config::default()
        });
        if config.debug.log_level.parse::<log::LevelFilter>().is_err() {
            notes.push(format!(
                "Unknown log level '{}', defaulting to info",
                config.debug.log_level
            ));
        }

        (config, notes)
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Log level filter for `env_logger`
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug
            .log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }
}
