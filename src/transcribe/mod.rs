use std::future::Future;
use std::path::Path;

pub mod assemblyai;
pub mod whisper;

pub use assemblyai::AssemblyAi;
pub use whisper::WhisperCli;

/// The untouched output of a backend. Each variant is only ever interpreted
/// by the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// whisper.cpp `--output-json` document with timed segments.
    Segments(serde_json::Value),
    /// AssemblyAI transcript with speaker-labeled utterances.
    Utterances(serde_json::Value),
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    /// Worth another attempt: timeouts, network errors, non-zero exits.
    #[error("transient: {0:#}")]
    Transient(anyhow::Error),
    /// Retrying will not help: bad credentials, invalid audio, broken tool contract.
    #[error("fatal: {0:#}")]
    Fatal(anyhow::Error),
}

pub trait Transcriber {
    fn name(&self) -> &'static str;

    fn transcribe(
        &self,
        audio: &Path,
    ) -> impl Future<Output = Result<RawPayload, TranscriptionError>>;
}

/// The backend chosen at startup.
pub enum Backend {
    Whisper(WhisperCli),
    AssemblyAi(AssemblyAi),
}

impl Transcriber for Backend {
    fn name(&self) -> &'static str {
        match self {
            Backend::Whisper(w) => w.name(),
            Backend::AssemblyAi(a) => a.name(),
        }
    }

    async fn transcribe(&self, audio: &Path) -> Result<RawPayload, TranscriptionError> {
        match self {
            Backend::Whisper(w) => w.transcribe(audio).await,
            Backend::AssemblyAi(a) => a.transcribe(audio).await,
        }
    }
}
