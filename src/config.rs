// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Window, presentation, debug and shader settings for the demo. Missing or
// malformed files fall back to defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub shaders: ShaderConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Stimulus Render Graph".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Requested swapchain image count; the render graph records one
    /// command buffer per image it actually gets.
    pub frames_in_flight: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            frames_in_flight: 3,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "stimulus_render.log".to_string(),
            show_fps: true,
        }
    }
}

/// Where the demo's compiled shaders live
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub directory: PathBuf,
    /// Watch `directory` and recompile the graph when a `.spv` changes
    pub hot_reload: bool,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("shaders"),
            hot_reload: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!("Unknown present mode '{}', defaulting to FIFO", self.graphics.present_mode);
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }

    pub fn shader_path(&self, file: &str) -> PathBuf {
        self.shaders.directory.join(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::parse("[graphics]\nframes_in_flight = 2\n[shaders]\nhot_reload = false\n").unwrap();
        assert_eq!(config.graphics.frames_in_flight, 2);
        assert_eq!(config.graphics.present_mode, "fifo");
        assert!(!config.shaders.hot_reload);
        assert_eq!(config.shader_path("a.spv"), PathBuf::from("shaders").join("a.spv"));
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window\nwidth = ").is_err());
    }

    #[rstest]
    #[case("immediate", ash::vk::PresentModeKHR::IMMEDIATE)]
    #[case("Mailbox", ash::vk::PresentModeKHR::MAILBOX)]
    #[case("fifo_relaxed", ash::vk::PresentModeKHR::FIFO_RELAXED)]
    #[case("vsync-please", ash::vk::PresentModeKHR::FIFO)]
    fn present_mode_names(#[case] name: &str, #[case] expected: ash::vk::PresentModeKHR) {
        let mut config = Config::default();
        config.graphics.present_mode = name.to_string();
        assert_eq!(config.get_present_mode(), expected);
    }
}
