use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::client::LlmConfig;
use crate::error::Result;
use crate::PipelineError;

/// Application configuration, read from a YAML file.
///
/// Every field has a default, so an absent file or an empty document gives a
/// working setup against local Ollama and AUTOMATIC1111 servers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// Each run owns `<runs_dir>/<run_id>/`.
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,

    #[serde(default)]
    pub text: TextConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub document: DocumentConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TextConfig {
    #[serde(default = "default_text_url")]
    pub base_url: String,
    #[serde(default = "default_text_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Models offered when creating a run.
    #[serde(default = "default_models")]
    pub models: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ImageConfig {
    #[serde(default = "default_image_url")]
    pub base_url: String,
    #[serde(default = "default_image_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_image_size")]
    pub width: u32,
    #[serde(default = "default_image_size")]
    pub height: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DocumentConfig {
    /// Edge length of the square pages in PDF points.
    #[serde(default = "default_page_size")]
    pub page_size_pt: f32,
    /// Overlay the title on the cover page.
    #[serde(default)]
    pub title_caption: bool,
    #[serde(default = "default_file_name")]
    pub file_name: String,
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("runs")
}
fn default_text_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_text_timeout() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_models() -> Vec<String> {
    ["gemma3n:e4b", "llama3.1:8b", "gemma3:12b", "phi4", "qwen3:14b"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}
fn default_image_url() -> String {
    "http://localhost:7860".to_string()
}
fn default_image_timeout() -> u64 {
    600
}
fn default_image_size() -> u32 {
    1024
}
fn default_page_size() -> f32 {
    576.0
}
fn default_file_name() -> String {
    "kinderbuch.pdf".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            text: TextConfig::default(),
            image: ImageConfig::default(),
            document: DocumentConfig::default(),
        }
    }
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            base_url: default_text_url(),
            timeout_secs: default_text_timeout(),
            streaming: true,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            models: default_models(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            base_url: default_image_url(),
            timeout_secs: default_image_timeout(),
            width: default_image_size(),
            height: default_image_size(),
        }
    }
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            page_size_pt: default_page_size(),
            title_caption: false,
            file_name: default_file_name(),
        }
    }
}

impl TextConfig {
    /// Sampling options forwarded with every text-generation request.
    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig::default()
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
    }
}

impl Config {
    /// Load configuration from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML document. An empty document yields the defaults.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.text.base_url.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("text.base_url is empty".into()));
        }
        if self.image.base_url.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("image.base_url is empty".into()));
        }
        if self.text.timeout_secs == 0 || self.image.timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "timeouts must be greater than zero".into(),
            ));
        }
        if self.image.width == 0 || self.image.height == 0 {
            return Err(PipelineError::InvalidConfig("image size must be non-zero".into()));
        }
        if !(self.document.page_size_pt > 0.0) {
            return Err(PipelineError::InvalidConfig(
                "document.page_size_pt must be positive".into(),
            ));
        }
        if self.document.file_name.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("document.file_name is empty".into()));
        }
        Ok(())
    }
}
