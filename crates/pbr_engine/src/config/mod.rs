//! Configuration system
//!
//! TOML-backed render configuration with sensible defaults, loaded at
//! application startup.

use serde::{Deserialize, Serialize};

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Initial window width in pixels
    pub width: u32,
    /// Initial window height in pixels
    pub height: u32,
    /// Window title
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: "PBR Engine".to_string(),
        }
    }
}

/// Top-level render configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Window settings
    pub window: WindowConfig,
    /// Path to the equirectangular HDR environment panorama
    pub environment: String,
    /// Directory containing precompiled SPIR-V shader binaries
    pub shader_dir: String,
    /// Directory containing OBJ meshes
    pub model_dir: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            environment: "textures/spruit_sunrise_2k.hdr".to_string(),
            shader_dir: "shaders".to_string(),
            model_dir: "models".to_string(),
        }
    }
}

impl RenderConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Resolve a shader name against the configured shader directory
    pub fn shader_path(&self, name: &str) -> String {
        format!("{}/{}", self.shader_dir, name)
    }

    /// Resolve a model name against the configured model directory
    pub fn model_path(&self, name: &str) -> String {
        format!("{}/{}", self.model_dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: RenderConfig = toml::from_str("environment = \"sky.hdr\"").unwrap();
        assert_eq!(config.environment, "sky.hdr");
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.shader_dir, "shaders");
    }

    #[test]
    fn path_helpers_join_directories() {
        let config = RenderConfig::default();
        assert_eq!(config.shader_path("pbr.vert.spv"), "shaders/pbr.vert.spv");
        assert_eq!(config.model_path("sphere.obj"), "models/sphere.obj");
    }
}
