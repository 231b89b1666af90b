use anyhow::{anyhow, Context};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use super::{RawPayload, Transcriber, TranscriptionError};
use crate::config::WhisperCfg;

/// Runs a local whisper.cpp `whisper-cli` binary and reads the JSON file it
/// writes next to the input.
#[derive(Debug, Clone)]
pub struct WhisperCli {
    binary: PathBuf,
    working_dir: Option<PathBuf>,
    timeout: Duration,
    reuse_existing_output: bool,
    extra_args: Vec<String>,
}

impl WhisperCli {
    pub fn new(cfg: &WhisperCfg) -> Self {
        Self {
            binary: cfg.binary.clone(),
            working_dir: cfg.working_dir.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            reuse_existing_output: cfg.reuse_existing_output,
            extra_args: cfg.extra_args.clone(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// whisper-cli writes `<input>.json` when asked for JSON output.
    pub fn output_path(audio: &Path) -> PathBuf {
        let mut p = OsString::from(audio.as_os_str());
        p.push(".json");
        PathBuf::from(p)
    }

    async fn run(&self, audio: &Path, output: &Path) -> Result<(), TranscriptionError> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("-f")
            .arg(audio)
            .arg("--output-json")
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        // a killed earlier attempt may have left a partial file behind
        discard_output(output)
            .await
            .map_err(TranscriptionError::Transient)?;

        let child = cmd
            .spawn()
            .with_context(|| format!("spawn '{}'", self.binary.display()))
            .map_err(TranscriptionError::Fatal)?;

        // dropping the wait future on timeout kills the child
        let out = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(out) => out
                .context("wait for whisper-cli")
                .map_err(TranscriptionError::Transient)?,
            Err(_) => {
                let _ = discard_output(output).await;
                return Err(TranscriptionError::Transient(anyhow!(
                    "whisper-cli timed out after {:?}",
                    self.timeout
                )))
            }
        };

        if !out.status.success() {
            let _ = discard_output(output).await;
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(TranscriptionError::Transient(anyhow!(
                "whisper-cli failed with {}: {}",
                out.status,
                stderr.trim()
            )));
        }

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(TranscriptionError::Fatal(anyhow!(
                "whisper-cli exited successfully but expected output '{}' is missing",
                output.display()
            )));
        }
        Ok(())
    }

    /// Returns an output left by an earlier run if it still parses.
    async fn earlier_output(&self, output: &Path) -> Option<serde_json::Value> {
        let bytes = tokio::fs::read(output).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::warn!(output = %output.display(), "ignoring unreadable whisper output: {e}");
                None
            }
        }
    }
}

async fn discard_output(output: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(output).await {
        Ok(()) => {
            tracing::debug!(output = %output.display(), "removed stale whisper output");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove stale '{}'", output.display())),
    }
}

impl Transcriber for WhisperCli {
    fn name(&self) -> &'static str {
        "whisper-cli"
    }

    async fn transcribe(&self, audio: &Path) -> Result<RawPayload, TranscriptionError> {
        let audio = tokio::fs::canonicalize(audio)
            .await
            .with_context(|| format!("resolve '{}'", audio.display()))
            .map_err(TranscriptionError::Fatal)?;
        let output = Self::output_path(&audio);

        if self.reuse_existing_output {
            if let Some(json) = self.earlier_output(&output).await {
                tracing::info!(output = %output.display(), "using existing whisper output");
                return Ok(RawPayload::Segments(json));
            }
        }
        self.run(&audio, &output).await?;

        let json = tokio::fs::read(&output)
            .await
            .with_context(|| format!("read whisper output '{}'", output.display()))
            .map_err(TranscriptionError::Transient)?;
        let json: serde_json::Value = serde_json::from_slice(&json)
            .with_context(|| format!("parse whisper output '{}'", output.display()))
            .map_err(TranscriptionError::Fatal)?;
        Ok(RawPayload::Segments(json))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::retry::tests::RecordingClock;
    use crate::retry::{with_retries, RetryError, RetryPolicy};
    use std::os::unix::fs::PermissionsExt;

    const SAMPLE: &str = r#"{"transcription":[{"timestamps":{"from":"00:00:00,000","to":"00:00:02,000"},"offsets":{"from":0,"to":2000},"text":" Hello, Little Bear."}]}"#;

    /// Writes an executable shell script standing in for whisper-cli.
    fn fake_whisper(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("whisper-cli");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn whisper(binary: PathBuf, timeout: Duration) -> WhisperCli {
        WhisperCli::new(&WhisperCfg {
            binary,
            working_dir: None,
            timeout_secs: 600,
            reuse_existing_output: true,
            extra_args: Vec::new(),
        })
        .with_timeout(timeout)
    }

    impl WhisperCli {
        fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }
    }

    fn audio(dir: &Path) -> PathBuf {
        let p = dir.join("S01E01.wav");
        std::fs::write(&p, b"RIFF").unwrap();
        std::fs::canonicalize(p).unwrap()
    }

    #[tokio::test]
    async fn reads_json_written_next_to_audio() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_whisper(
            dir.path(),
            &format!("[ \"$1\" = \"-f\" ] || exit 2\n[ \"$3\" = \"--output-json\" ] || exit 3\necho '{SAMPLE}' > \"$2.json\""),
        );
        let audio = audio(dir.path());
        let w = whisper(bin, Duration::from_secs(10));
        let payload = w.transcribe(&audio).await.unwrap();
        let RawPayload::Segments(json) = payload else {
            panic!("wrong variant");
        };
        assert_eq!(json["transcription"][0]["offsets"]["to"], 2000);
    }

    #[tokio::test]
    async fn nonzero_exit_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_whisper(dir.path(), "echo 'model not loaded' >&2\nexit 1");
        let audio = audio(dir.path());
        let err = whisper(bin, Duration::from_secs(10))
            .transcribe(&audio)
            .await
            .unwrap_err();
        assert!(matches!(err, TranscriptionError::Transient(_)));
        assert!(err.to_string().contains("model not loaded"));
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_whisper(dir.path(), "sleep 5");
        let audio = audio(dir.path());
        let err = whisper(bin, Duration::from_millis(100))
            .transcribe(&audio)
            .await
            .unwrap_err();
        assert!(matches!(err, TranscriptionError::Transient(_)));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_output_after_success_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_whisper(dir.path(), "exit 0");
        let audio = audio(dir.path());
        let err = whisper(bin, Duration::from_secs(10))
            .transcribe(&audio)
            .await
            .unwrap_err();
        assert!(matches!(err, TranscriptionError::Fatal(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let audio = audio(dir.path());
        let err = whisper(dir.path().join("nope"), Duration::from_secs(10))
            .transcribe(&audio)
            .await
            .unwrap_err();
        assert!(matches!(err, TranscriptionError::Fatal(_)));
    }

    #[tokio::test]
    async fn reuses_output_from_earlier_run() {
        let dir = tempfile::tempdir().unwrap();
        // would fail if it were invoked
        let bin = fake_whisper(dir.path(), "exit 1");
        let audio = audio(dir.path());
        std::fs::write(WhisperCli::output_path(&audio), SAMPLE).unwrap();
        let payload = whisper(bin, Duration::from_secs(10))
            .transcribe(&audio)
            .await
            .unwrap();
        assert!(matches!(payload, RawPayload::Segments(_)));
    }

    fn invocations(counter: &Path) -> usize {
        std::fs::read_to_string(counter)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn partial_output_from_timed_out_run_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("runs");
        let bin = fake_whisper(
            dir.path(),
            &format!(
                "echo run >> '{}'\nprintf '{{\"transcription\": [' > \"$2.json\"\nsleep 5",
                counter.display()
            ),
        );
        let audio = audio(dir.path());
        let w = whisper(bin, Duration::from_millis(300));
        let clock = RecordingClock::default();

        let res = with_retries(&RetryPolicy::default(), &clock, "S01E01", |_| {
            w.transcribe(&audio)
        })
        .await;

        assert!(
            matches!(res, Err(RetryError::RetriesExhausted { attempts: 3, .. })),
            "{res:?}"
        );
        assert_eq!(invocations(&counter), 3);
        assert_eq!(
            clock.recorded(),
            vec![Duration::from_secs(30), Duration::from_secs(60)]
        );
        assert!(!WhisperCli::output_path(&audio).exists());
    }

    #[tokio::test]
    async fn unreadable_earlier_output_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("runs");
        let bin = fake_whisper(
            dir.path(),
            &format!(
                "echo run >> '{}'\necho '{SAMPLE}' > \"$2.json\"",
                counter.display()
            ),
        );
        let audio = audio(dir.path());
        std::fs::write(WhisperCli::output_path(&audio), "{\"transcription\": [").unwrap();

        let payload = whisper(bin, Duration::from_secs(10))
            .transcribe(&audio)
            .await
            .unwrap();

        let RawPayload::Segments(json) = payload else {
            panic!("wrong variant");
        };
        assert_eq!(json["transcription"][0]["offsets"]["to"], 2000);
        assert_eq!(invocations(&counter), 1);
    }
}
