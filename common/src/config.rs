use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::frame::Geometry;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    pub film: FilmConfig,
    #[serde(default)]
    pub frame: FrameConfig,
    #[serde(default)]
    pub chroma_key: ChromaKeyConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// "http" polls a snapshot endpoint, "still" replays a single image file.
    #[serde(default = "default_camera_device")]
    pub device: String,
    pub url: Option<String>,
    pub path: Option<PathBuf>,
    #[serde(default = "default_quality")]
    pub quality: u32,
    #[serde(default = "default_camera_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilmConfig {
    pub dir: PathBuf,
    #[serde(default = "default_film_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameConfig {
    #[serde(default = "default_frame_width")]
    pub width: u32,
    /// Width divided by height.
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromaKeyConfig {
    #[serde(default = "default_key_lower")]
    pub lower: [u8; 3],
    #[serde(default = "default_key_upper")]
    pub upper: [u8; 3],
    /// Solid color used before the first AI frame and after a content-safety rejection.
    #[serde(default = "default_placeholder_color")]
    pub placeholder_color: [u8; 3],
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// "http" or "passthrough".
    #[serde(default = "default_backend")]
    pub backend: String,
    pub endpoint: Option<String>,
    #[serde(default = "default_strength")]
    pub strength: f32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub breathe: bool,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptsConfig {
    #[serde(default)]
    pub suffix: String,
    pub schedule: Vec<PromptEntryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptEntryConfig {
    pub threshold: u32,
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// "file" or "null".
    #[serde(default = "default_sink")]
    pub sink: String,
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    #[serde(default = "default_viewport_width")]
    pub viewport_width: u32,
    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,
    /// Stop after this many ticks. Runs until Ctrl-C when unset.
    pub max_ticks: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            width: default_frame_width(),
            aspect_ratio: default_aspect_ratio(),
        }
    }
}

impl Default for ChromaKeyConfig {
    fn default() -> Self {
        Self {
            lower: default_key_lower(),
            upper: default_key_upper(),
            placeholder_color: default_placeholder_color(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            endpoint: None,
            strength: default_strength(),
            steps: default_steps(),
            seed: default_seed(),
            breathe: false,
            negative_prompt: default_negative_prompt(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            sink: default_sink(),
            output_path: default_output_path(),
            viewport_width: default_viewport_width(),
            viewport_height: default_viewport_height(),
            max_ticks: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl FrameConfig {
    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.width, self.aspect_ratio)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame.width == 0 {
            return Err(ConfigError::Invalid("frame.width must be positive".into()));
        }
        if !(self.frame.aspect_ratio.is_finite() && self.frame.aspect_ratio > 0.0) {
            return Err(ConfigError::Invalid(
                "frame.aspect_ratio must be a positive number".into(),
            ));
        }
        if !(self.inference.strength > 0.0 && self.inference.strength <= 1.0) {
            return Err(ConfigError::Invalid(
                "inference.strength must be in (0, 1]".into(),
            ));
        }
        if self.inference.steps == 0 {
            return Err(ConfigError::Invalid("inference.steps must be positive".into()));
        }
        if !(self.display.fps.is_finite() && self.display.fps > 0.0) {
            return Err(ConfigError::Invalid("display.fps must be positive".into()));
        }
        for channel in 0..3 {
            if self.chroma_key.lower[channel] > self.chroma_key.upper[channel] {
                return Err(ConfigError::Invalid(format!(
                    "chroma_key.lower[{channel}] exceeds chroma_key.upper[{channel}]"
                )));
            }
        }
        match self.camera.device.as_str() {
            "http" if self.camera.url.is_none() => {
                return Err(ConfigError::Invalid(
                    "camera.url is required for the http device".into(),
                ))
            }
            "still" if self.camera.path.is_none() => {
                return Err(ConfigError::Invalid(
                    "camera.path is required for the still device".into(),
                ))
            }
            "http" | "still" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown camera.device '{other}', expected 'http' or 'still'"
                )))
            }
        }
        match self.inference.backend.as_str() {
            "http" if self.inference.endpoint.is_none() => {
                return Err(ConfigError::Invalid(
                    "inference.endpoint is required for the http backend".into(),
                ))
            }
            "http" | "passthrough" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown inference.backend '{other}', expected 'http' or 'passthrough'"
                )))
            }
        }
        match self.display.sink.as_str() {
            "file" | "null" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown display.sink '{other}', expected 'file' or 'null'"
                )))
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_camera_device() -> String {
    "http".into()
}
fn default_quality() -> u32 {
    80
}
fn default_camera_timeout() -> u64 {
    5
}
fn default_film_prefix() -> String {
    "frame".into()
}
fn default_frame_width() -> u32 {
    256
}
fn default_aspect_ratio() -> f64 {
    4.0 / 3.0
}
fn default_key_lower() -> [u8; 3] {
    [40, 40, 40]
}
fn default_key_upper() -> [u8; 3] {
    [80, 255, 80]
}
fn default_placeholder_color() -> [u8; 3] {
    [60, 200, 60]
}
fn default_backend() -> String {
    "http".into()
}
fn default_strength() -> f32 {
    0.8
}
fn default_steps() -> u32 {
    1
}
fn default_seed() -> u64 {
    1231231
}
fn default_negative_prompt() -> String {
    "detailed background, colorful background".into()
}
fn default_fps() -> f64 {
    10.0
}
fn default_sink() -> String {
    "file".into()
}
fn default_output_path() -> PathBuf {
    PathBuf::from("display.png")
}
fn default_viewport_width() -> u32 {
    1920
}
fn default_viewport_height() -> u32 {
    1080
}
fn default_log_level() -> String {
    "info".into()
}
