use anyhow::{anyhow, Context};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::codec::{BytesCodec, FramedRead};

use super::{RawPayload, Transcriber, TranscriptionError};
use crate::config::AssemblyAiCfg;

/// Options sent with every transcription job.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TranscriptionOptions {
    pub speaker_labels: bool,
    pub speakers_expected: u32,
    pub language_code: String,
    pub speech_model: String,
    pub punctuate: bool,
    pub format_text: bool,
}

#[derive(Serialize, Debug)]
struct TranscriptRequest<'a> {
    audio_url: &'a str,
    #[serde(flatten)]
    options: &'a TranscriptionOptions,
}

#[derive(Deserialize, Debug)]
struct UploadResponse {
    upload_url: String,
}

#[derive(Deserialize, Debug)]
struct JobStatus {
    id: String,
    status: String,
    #[serde(default)]
    error: Option<String>,
}

/// Hosted transcription through the AssemblyAI REST API.
#[derive(Debug, Clone)]
pub struct AssemblyAi {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    options: TranscriptionOptions,
    poll_interval: Duration,
    processing_timeout: Duration,
}

impl AssemblyAi {
    pub fn new(cfg: &AssemblyAiCfg) -> anyhow::Result<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .context("no AssemblyAI API key (set assemblyai.api_key, --api-key or ASSEMBLYAI_API_KEY)")?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            options: TranscriptionOptions {
                speaker_labels: cfg.speaker_labels,
                speakers_expected: cfg.speakers_expected,
                language_code: cfg.language_code.clone(),
                speech_model: cfg.speech_model.clone(),
                punctuate: cfg.punctuate,
                format_text: cfg.format_text,
            },
            poll_interval: Duration::from_secs(cfg.poll_interval_secs),
            processing_timeout: Duration::from_secs(cfg.processing_timeout_secs),
        })
    }

    async fn upload(&self, audio: &Path) -> Result<String, TranscriptionError> {
        let file = tokio::fs::File::open(audio)
            .await
            .with_context(|| format!("open '{}'", audio.display()))
            .map_err(TranscriptionError::Fatal)?;
        let res = self
            .client
            .post(format!("{}/v2/upload", self.base_url))
            .header("authorization", &self.api_key)
            .header("Accept", "application/json")
            .body(reqwest::Body::wrap_stream(FramedRead::new(
                file,
                BytesCodec::new(),
            )))
            .send()
            .await
            .context("issue upload request")
            .map_err(TranscriptionError::Transient)?;
        let res: UploadResponse = json_or_classify(res, "upload audio").await?;
        Ok(res.upload_url)
    }

    async fn submit(&self, audio_url: &str) -> Result<JobStatus, TranscriptionError> {
        let res = self
            .client
            .post(format!("{}/v2/transcript", self.base_url))
            .header("authorization", &self.api_key)
            .header("Accept", "application/json")
            .json(&TranscriptRequest {
                audio_url,
                options: &self.options,
            })
            .send()
            .await
            .context("issue transcript request")
            .map_err(TranscriptionError::Transient)?;
        json_or_classify(res, "create transcript").await
    }

    async fn poll(&self, id: &str) -> Result<serde_json::Value, TranscriptionError> {
        let url = format!("{}/v2/transcript/{}", self.base_url, id);
        let deadline = Instant::now() + self.processing_timeout;
        loop {
            let res = self
                .client
                .get(&url)
                .header("authorization", &self.api_key)
                .header("Accept", "application/json")
                .send()
                .await
                .context("issue poll request")
                .map_err(TranscriptionError::Transient)?;
            let json: serde_json::Value = json_or_classify(res, "poll transcript").await?;
            let job: JobStatus = serde_json::from_value(json.clone())
                .context("type poll response")
                .map_err(TranscriptionError::Transient)?;
            match job.status.as_str() {
                "completed" => return Ok(json),
                "error" => {
                    return Err(TranscriptionError::Fatal(anyhow!(
                        "transcript {} failed: {}",
                        job.id,
                        job.error.as_deref().unwrap_or("<no error message>")
                    )))
                }
                status => {
                    tracing::debug!(job = %job.id, status, "still processing");
                }
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(TranscriptionError::Transient(anyhow!(
                    "transcript {id} still not finished after {:?}",
                    self.processing_timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Parses a successful response, or sorts a failed one into transient
/// (throttling, timeouts, server trouble) and fatal (everything else).
async fn json_or_classify<T>(res: reqwest::Response, what: &str) -> Result<T, TranscriptionError>
where
    T: serde::de::DeserializeOwned,
{
    let code = res.status();
    if code.is_success() {
        return res
            .json()
            .await
            .with_context(|| format!("parse {what} response"))
            .map_err(TranscriptionError::Transient);
    }

    let body = res
        .text()
        .await
        .unwrap_or_else(|_| String::from("<failed to read>"));
    let err = anyhow!(body)
        .context(format!("HTTP status: {code}"))
        .context(format!("{what} rejected"));
    if code.is_server_error()
        || code == StatusCode::TOO_MANY_REQUESTS
        || code == StatusCode::REQUEST_TIMEOUT
    {
        Err(TranscriptionError::Transient(err))
    } else {
        Err(TranscriptionError::Fatal(err))
    }
}

impl Transcriber for AssemblyAi {
    fn name(&self) -> &'static str {
        "assemblyai"
    }

    async fn transcribe(&self, audio: &Path) -> Result<RawPayload, TranscriptionError> {
        let upload_url = self.upload(audio).await?;
        tracing::debug!(audio = %audio.display(), "uploaded");
        let job = self.submit(&upload_url).await?;
        tracing::info!(job = %job.id, status = %job.status, "transcript queued");
        let json = self.poll(&job.id).await?;
        Ok(RawPayload::Utterances(json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> AssemblyAi {
        AssemblyAi::new(&AssemblyAiCfg {
            api_key: Some("test-key".to_string()),
            base_url: server.uri(),
            poll_interval_secs: 0,
            processing_timeout_secs: 5,
            ..AssemblyAiCfg::default()
        })
        .unwrap()
    }

    fn audio() -> tempfile::NamedTempFile {
        let f = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(f.path(), b"RIFF....WAVE").unwrap();
        f
    }

    async fn mount_upload(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v2/upload"))
            .and(header("authorization", "test-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "upload_url": "https://cdn.example/abc" })),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn uploads_submits_and_polls() {
        let server = MockServer::start().await;
        mount_upload(&server).await;
        Mock::given(method("POST"))
            .and(path("/v2/transcript"))
            .and(body_partial_json(json!({
                "audio_url": "https://cdn.example/abc",
                "speaker_labels": true,
                "speakers_expected": 6,
                "language_code": "en_us",
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "id": "t1", "status": "queued" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/transcript/t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "t1",
                "status": "completed",
                "audio_duration": 12,
                "utterances": [
                    { "speaker": "A", "text": "Hello.", "start": 0, "end": 900, "confidence": 0.9 }
                ]
            })))
            .mount(&server)
            .await;

        let f = audio();
        let payload = client(&server).transcribe(f.path()).await.unwrap();
        let RawPayload::Utterances(json) = payload else {
            panic!("wrong variant");
        };
        assert_eq!(json["utterances"][0]["speaker"], "A");
    }

    #[tokio::test]
    async fn bad_key_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/upload"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Invalid API key"))
            .mount(&server)
            .await;
        let f = audio();
        let err = client(&server).transcribe(f.path()).await.unwrap_err();
        assert!(matches!(err, TranscriptionError::Fatal(_)));
        assert!(format!("{err}").contains("401"));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/upload"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let f = audio();
        let err = client(&server).transcribe(f.path()).await.unwrap_err();
        assert!(matches!(err, TranscriptionError::Transient(_)));
    }

    #[tokio::test]
    async fn job_error_is_fatal() {
        let server = MockServer::start().await;
        mount_upload(&server).await;
        Mock::given(method("POST"))
            .and(path("/v2/transcript"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "id": "t2", "status": "queued" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/transcript/t2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "t2",
                "status": "error",
                "error": "File does not appear to contain audio."
            })))
            .mount(&server)
            .await;
        let f = audio();
        let err = client(&server).transcribe(f.path()).await.unwrap_err();
        assert!(matches!(err, TranscriptionError::Fatal(_)));
        assert!(format!("{err}").contains("does not appear to contain audio"));
    }

    #[tokio::test]
    async fn stuck_job_times_out_transiently() {
        let server = MockServer::start().await;
        mount_upload(&server).await;
        Mock::given(method("POST"))
            .and(path("/v2/transcript"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "id": "t3", "status": "queued" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/transcript/t3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": "t3", "status": "processing" })),
            )
            .mount(&server)
            .await;
        let mut ai = client(&server);
        ai.processing_timeout = Duration::from_millis(50);
        ai.poll_interval = Duration::from_millis(20);
        let err = ai.transcribe(audio().path()).await.unwrap_err();
        assert!(matches!(err, TranscriptionError::Transient(_)));
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let cfg = AssemblyAiCfg::default();
        assert!(AssemblyAi::new(&AssemblyAiCfg {
            api_key: Some("  ".into()),
            ..cfg.clone()
        })
        .is_err());
        assert!(AssemblyAi::new(&cfg).is_err());
    }
}
