use anyhow::Context;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod batch;
mod cli;
mod config;
mod discovery;
mod model;
mod normalize;
mod retry;
mod store;
mod transcribe;

use batch::BatchRunner;
use cli::BackendKind;
use model::BatchStats;
use retry::TokioClock;
use store::ResultStore;
use transcribe::{AssemblyAi, Backend, WhisperCli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    let mut cfg = config::Config::load(args.config.as_deref())?;
    if let Some(dir) = args.audio_dir {
        cfg.paths.audio_dir = dir;
    }
    if let Some(dir) = args.output_dir {
        cfg.paths.output_dir = dir;
    }
    if let Some(path) = args.whisper_path {
        cfg.whisper.binary = path;
    }
    if let Some(key) = args.api_key {
        cfg.assemblyai.api_key = Some(key);
    }

    if args.print_default_config {
        let mut shown = cfg.clone();
        shown.assemblyai.api_key = None;
        print!("{}", shown.to_toml_pretty()?);
        return Ok(());
    }

    config::init_tracing(&cfg.logging, args.log_level.as_deref())?;
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "starting");

    let backend = match args.backend {
        BackendKind::Whisper => {
            let whisper = WhisperCli::new(&cfg.whisper);
            // a bare name is looked up on PATH at spawn time
            if whisper.binary().components().count() > 1 {
                anyhow::ensure!(
                    whisper.binary().exists(),
                    "whisper-cli not found at '{}' (pass --whisper-path)",
                    whisper.binary().display()
                );
            }
            Backend::Whisper(whisper)
        }
        BackendKind::Assemblyai => {
            Backend::AssemblyAi(AssemblyAi::new(&cfg.assemblyai).context("set up AssemblyAI")?)
        }
    };

    let store = ResultStore::open(&cfg.paths.output_dir)
        .await
        .context("open output directory")?;

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            eprintln!(" -> interrupt received, finishing the current episode (again to abort)");
            interrupted.store(true, Ordering::Release);
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    }

    let runner = BatchRunner::new(&backend, &store, TokioClock)
        .retry_policy(cfg.retry.policy())
        .pause(Duration::from_millis(cfg.batch.pause_ms))
        .extensions(cfg.paths.extensions.clone())
        .interrupt_flag(interrupted);

    let stats = runner
        .run(&cfg.paths.audio_dir, args.limit)
        .await
        .context("transcription run")?;

    print_summary(&stats, &store, &cfg, args.backend);
    Ok(())
}

fn print_summary(stats: &BatchStats, store: &ResultStore, cfg: &config::Config, backend: BackendKind) {
    println!("==> summary");
    println!(" -> episodes processed: {}", stats.processed);
    println!(" -> already done:       {}", stats.skipped);
    println!(" -> errors:             {}", stats.errors);
    println!(
        " -> total duration:     {:.1} seconds",
        stats.total_duration_seconds
    );
    println!(" -> total words:        {}", stats.total_words);
    if let Some(avg) = stats.average_words() {
        println!(" -> avg words/episode:  {avg:.0}");
    }
    if backend == BackendKind::Assemblyai {
        let cost = stats.total_duration_seconds / 3600.0 * cfg.assemblyai.price_per_hour;
        println!(" -> approximate cost:   ${cost:.2}");
    }
    println!(" -> transcripts in {}", store.dir().display());
}
