// This module handles config.toml.
// Every value has a default matching the stock LCM workflow, so a missing or
// partial config file still yields a runnable pipeline.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client id announced to the backend. Defaults to a fresh UUID per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_checkpoint")]
    pub checkpoint: String,
    #[serde(default = "default_lora")]
    pub lora: String,
    #[serde(default = "default_strength")]
    pub strength_model: f64,
    #[serde(default = "default_strength")]
    pub strength_clip: f64,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplerConfig {
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg")]
    pub cfg: f64,
    #[serde(default = "default_sampler_name")]
    pub sampler_name: String,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default = "default_denoise")]
    pub denoise: f64,
    /// Sampling parameterization for ModelSamplingDiscrete.
    #[serde(default = "default_sampling")]
    pub sampling: String,
    #[serde(default)]
    pub zsnr: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    #[serde(default = "default_filename_prefix")]
    pub filename_prefix: String,
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
}

// The stock negative prompt, tuned for period backgrounds.
const DEFAULT_NEGATIVE_PROMPT: &str = "no modern technology, no futuristic elements, \
no neon lights, no contemporary furniture, no plastic, no vehicles, no bright daylight, \
no sci-fi details, no electronic devices, no modern bar items, no overly clean or \
polished surfaces, no smooth metal, no characters, no modern drinks or glassware, \
no cityscape, no overly bright or colorful elements, no clutter or random objects, \
no modern clothing or accessories.";

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8188
}
fn default_checkpoint() -> String {
    "theAllysMixXSDXL_v10.safetensors".to_string()
}
fn default_lora() -> String {
    "lcm_lora_sdxl.safetensors".to_string()
}
fn default_strength() -> f64 {
    1.0
}
fn default_dimension() -> u32 {
    1024
}
fn default_batch_size() -> u32 {
    1
}
fn default_steps() -> u32 {
    4
}
fn default_cfg() -> f64 {
    1.0
}
fn default_sampler_name() -> String {
    "lcm".to_string()
}
fn default_scheduler() -> String {
    "sgm_uniform".to_string()
}
fn default_denoise() -> f64 {
    1.0
}
fn default_sampling() -> String {
    "eps".to_string()
}
fn default_filename_prefix() -> String {
    "ComfyUI".to_string()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_negative_prompt() -> String {
    DEFAULT_NEGATIVE_PROMPT.to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty backend config must deserialize")
    }
}
impl Default for ModelConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty model config must deserialize")
    }
}
impl Default for SamplerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty sampler config must deserialize")
    }
}
impl Default for OutputConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty output config must deserialize")
    }
}

impl GenConfig {
    /// Loads config.toml from the given path. A missing file (or no path at
    /// all) falls back to the defaults with a warning; a file that exists but
    /// doesn't parse is fatal.
    pub fn load(path: Option<&Path>) -> Result<GenConfig> {
        let path = match path {
            Some(path) => path,
            None => {
                warn!("No config file given, using defaults");
                return Ok(GenConfig::default());
            }
        };
        if !path.exists() {
            warn!("{} does not exist, using defaults", path.display());
            return Ok(GenConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Error reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Error parsing {}", path.display()))
    }
}
