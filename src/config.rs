use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

const API_KEY_ENV: &str = "ASSEMBLYAI_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: Paths,
    pub logging: Logging,
    pub retry: RetryCfg,
    pub batch: BatchCfg,
    pub whisper: WhisperCfg,
    pub assemblyai: AssemblyAiCfg,
}

impl Config {
    pub fn load(path_opt: Option<&Path>) -> Result<Self> {
        let default_path = Path::new("config.toml");
        let path = match path_opt {
            Some(p) => Some(p),
            None if default_path.exists() => Some(default_path),
            None => None,
        };

        let mut cfg = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("read config file '{}'", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parse config file '{}'", path.display()))?
            }
            None => Config::default(),
        };

        if cfg.assemblyai.api_key.is_none() {
            cfg.assemblyai.api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        }

        Ok(cfg)
    }

    pub fn to_toml_pretty(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serialize config as TOML")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub audio_dir: PathBuf,
    pub output_dir: PathBuf,
    /// File extensions (without the dot) considered audio.
    pub extensions: Vec<String>,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            audio_dir: PathBuf::from("audio_extracted"),
            output_dir: PathBuf::from("transcripts"),
            extensions: vec!["wav".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub format: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryCfg {
    pub max_attempts: u32,
    pub initial_delay_secs: u64,
}

impl Default for RetryCfg {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_secs: policy.initial_delay.as_secs(),
        }
    }
}

impl RetryCfg {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_secs(self.initial_delay_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchCfg {
    /// Pause between two items that reached the backend.
    pub pause_ms: u64,
}

impl Default for BatchCfg {
    fn default() -> Self {
        Self { pause_ms: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperCfg {
    pub binary: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    /// Load `<audio>.json` left behind by an earlier run instead of re-running whisper.
    pub reuse_existing_output: bool,
    pub extra_args: Vec<String>,
}

impl Default for WhisperCfg {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("whisper-cli"),
            working_dir: None,
            timeout_secs: 600,
            reuse_existing_output: true,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyAiCfg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub base_url: String,
    pub speaker_labels: bool,
    pub speakers_expected: u32,
    pub language_code: String,
    pub speech_model: String,
    pub punctuate: bool,
    pub format_text: bool,
    pub poll_interval_secs: u64,
    /// Give up polling (transiently) after this long.
    pub processing_timeout_secs: u64,
    pub price_per_hour: f64,
}

impl Default for AssemblyAiCfg {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.assemblyai.com".to_string(),
            speaker_labels: true,
            speakers_expected: 6,
            language_code: "en_us".to_string(),
            speech_model: "best".to_string(),
            punctuate: true,
            format_text: true,
            poll_interval_secs: 3,
            processing_timeout_secs: 1800,
            price_per_hour: 0.37,
        }
    }
}

pub fn init_tracing(logging: &Logging, cli_override_level: Option<&str>) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = cli_override_level.unwrap_or(logging.level.as_str());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level '{level}'"))?;

    if logging.format.eq_ignore_ascii_case("json") {
        fmt()
            .with_env_filter(filter)
            .event_format(fmt::format().json())
            .with_target(false)
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))
            .context("install json subscriber")?;
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))
            .context("install subscriber")?;
    }

    tracing::debug!(level, format = logging.format.as_str(), "logging initialized");
    Ok(())
}
