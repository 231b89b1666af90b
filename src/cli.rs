use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "episode-transcriber")]
#[command(about = "Transcribe a directory of season_XX/SxxEyy.wav episodes into one JSON file each.")]
pub struct Args {
    /// Path to config TOML (defaults to ./config.toml if present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Process at most this many episodes (in discovery order)
    #[arg(long, value_parser = parse_limit)]
    pub limit: Option<usize>,

    /// Root directory holding the season_* directories
    #[arg(long)]
    pub audio_dir: Option<PathBuf>,

    /// Directory transcripts are written to
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Transcription backend
    #[arg(long, value_enum, default_value_t = BackendKind::Whisper)]
    pub backend: BackendKind,

    /// Path to the whisper-cli binary
    #[arg(long)]
    pub whisper_path: Option<PathBuf>,

    /// AssemblyAI API key (otherwise taken from config or ASSEMBLYAI_API_KEY)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Print the effective config as TOML and exit
    #[arg(long)]
    pub print_default_config: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum BackendKind {
    Whisper,
    Assemblyai,
}

fn parse_limit(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}
