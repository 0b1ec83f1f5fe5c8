use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_schema_retry_count")]
    pub schema_retry_count: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_schema_base_delay_ms")]
    pub schema_base_delay_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            retry_count: default_retry_count(),
            schema_retry_count: default_schema_retry_count(),
            base_delay_ms: default_base_delay_ms(),
            schema_base_delay_ms: default_schema_base_delay_ms(),
            request_timeout_secs: default_request_timeout(),
            stream_timeout_secs: default_stream_timeout(),
        }
    }
}

/// Tuning thresholds for the chapter pipeline. Every bound the pipeline
/// branches on lives here instead of being a literal at the call site.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_num_chapters")]
    pub num_chapters: usize,
    #[serde(default = "default_target_words")]
    pub target_chapter_words: usize,
    #[serde(default)]
    pub genre: Option<String>,

    /// Maximum decide/execute/evaluate iterations of the editing agent.
    #[serde(default = "default_editing_iterations")]
    pub max_editing_iterations: usize,
    /// Editing stops once the evaluated score reaches this value.
    #[serde(default = "default_quality_gate")]
    pub quality_gate: u32,
    /// Decisions below this confidence escalate toward regeneration.
    #[serde(default = "default_confidence_gate")]
    pub confidence_gate: u32,
    /// Attempts to get a parseable chapter-plan JSON out of the model.
    #[serde(default = "default_plan_attempts")]
    pub plan_parse_attempts: usize,

    #[serde(default = "default_true")]
    pub enable_light_polish: bool,
    #[serde(default = "default_true")]
    pub enable_final_pass: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            num_chapters: default_num_chapters(),
            target_chapter_words: default_target_words(),
            genre: None,
            max_editing_iterations: default_editing_iterations(),
            quality_gate: default_quality_gate(),
            confidence_gate: default_confidence_gate(),
            plan_parse_attempts: default_plan_attempts(),
            enable_light_polish: true,
            enable_final_pass: true,
        }
    }
}

fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_base_url() -> String {
    "http://127.0.0.1:1234/v1".to_string()
}
fn default_model() -> String {
    "llama-3.1-instruct-13b".to_string()
}
fn default_retry_count() -> usize {
    5
}
fn default_schema_retry_count() -> usize {
    7
}
fn default_base_delay_ms() -> u64 {
    2000
}
fn default_schema_base_delay_ms() -> u64 {
    3000
}
fn default_request_timeout() -> u64 {
    30
}
fn default_stream_timeout() -> u64 {
    60
}
fn default_num_chapters() -> usize {
    10
}
fn default_target_words() -> usize {
    5000
}
fn default_editing_iterations() -> usize {
    2
}
fn default_quality_gate() -> u32 {
    70
}
fn default_confidence_gate() -> u32 {
    60
}
fn default_plan_attempts() -> usize {
    3
}
fn default_true() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        if !path.exists() {
            anyhow::bail!("config.yml not found. Please create one.");
        }

        let content = fs::read_to_string(path).context("Failed to read config.yml")?;
        let config: Config =
            serde_yaml_ng::from_str(&content).context("Failed to parse config.yml")?;
        Ok(config)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }
}
