//! Fixed-window capture of remote audio and speech-to-text.

use crate::config::TranscriptionConfig;
use crate::error::{CallError, Result};
use crate::media::RemoteStream;
use crate::peer::types::RemoteTrack;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use serde::Deserialize;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One recorded window of remote audio, as a WAV file.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioWindow {
    pub data: Bytes,
    pub duration: Duration,
    pub captured_at: DateTime<Utc>,
}

impl AudioWindow {
    pub fn new(wav: Vec<u8>, duration: Duration) -> Self {
        Self {
            data: Bytes::from(wav),
            duration,
            captured_at: Utc::now(),
        }
    }
}

/// Records a fixed-length window from a remote track.
#[async_trait]
pub trait AudioRecorder: Send + Sync {
    async fn record(&self, track: &RemoteTrack, duration: Duration) -> Result<AudioWindow>;
}

/// Speech recognizer output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transcript {
    Text(String),
    Segments(Vec<String>),
}

impl Transcript {
    /// Segments trimmed and joined with single spaces.
    pub fn into_text(self) -> String {
        match self {
            Transcript::Text(text) => text.trim().to_string(),
            Transcript::Segments(segments) => segments
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Speech-to-text over mono `f32` samples in `[-1, 1]`.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<Transcript>;
}

/// Connects a remote stream to a recorder and a transcriber.
#[derive(Clone)]
pub struct TranscriptionBridge {
    recorder: Arc<dyn AudioRecorder>,
    transcriber: Arc<dyn Transcriber>,
}

impl TranscriptionBridge {
    pub fn new(recorder: Arc<dyn AudioRecorder>, transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            recorder,
            transcriber,
        }
    }

    /// Records `duration` of the first audio track of `stream`.
    pub async fn capture_window(
        &self,
        stream: &RemoteStream,
        duration: Duration,
    ) -> Result<AudioWindow> {
        let track = stream.first_audio_track().ok_or(CallError::NoAudioTrack)?;
        info!(
            "recording {} ms from remote track {}",
            duration.as_millis(),
            track.id
        );
        self.recorder.record(track, duration).await
    }

    pub async fn transcribe(&self, window: &AudioWindow) -> Result<String> {
        let (samples, sample_rate) = decode_wav(&window.data)?;
        debug!(
            "transcribing {} samples at {} Hz captured {}",
            samples.len(),
            sample_rate,
            window.captured_at
        );
        let text = self
            .transcriber
            .transcribe(&samples, sample_rate)
            .await?
            .into_text();
        info!("transcribed {} characters", text.len());
        Ok(text)
    }

    /// Capture then transcribe.
    pub async fn run(&self, stream: &RemoteStream, duration: Duration) -> Result<String> {
        let window = self.capture_window(stream, duration).await?;
        self.transcribe(&window).await
    }
}

/// Encodes normalized samples as a 16-bit PCM WAV file.
pub(crate) fn encode_wav(samples: &[f32], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut buffer, spec).map_err(wav_error)?;
        for &sample in samples {
            let clipped = sample.clamp(-1.0, 1.0);
            let amplitude = (clipped * i16::MAX as f32) as i16;
            writer.write_sample(amplitude).map_err(wav_error)?;
        }
        writer.finalize().map_err(wav_error)?;
    }
    Ok(buffer.into_inner())
}

/// Decodes a WAV file to channel-0 samples in `[-1, 1]` and its sample rate.
pub(crate) fn decode_wav(data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader = WavReader::new(Cursor::new(data)).map_err(wav_error)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(wav_error)?,
        SampleFormat::Int => {
            let scale = (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(wav_error)?
        }
    };

    let samples = interleaved.into_iter().step_by(channels).collect();
    Ok((samples, spec.sample_rate))
}

fn wav_error(e: hound::Error) -> CallError {
    CallError::Transcription(format!("wav: {e}"))
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    segments: Option<Vec<Segment>>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    text: String,
}

impl TranscriptionResponse {
    fn into_transcript(self) -> Transcript {
        match self.segments {
            Some(segments) if !segments.is_empty() => {
                Transcript::Segments(segments.into_iter().map(|s| s.text).collect())
            }
            _ => Transcript::Text(self.text.unwrap_or_default()),
        }
    }
}

/// [`Transcriber`] for an OpenAI-compatible `audio/transcriptions` endpoint.
pub struct HttpTranscriber {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpTranscriber {
    pub fn new(config: &TranscriptionConfig, api_key: Option<String>) -> Self {
        if api_key.is_none() {
            warn!("no API key for {}, requests go without Authorization", config.endpoint);
        }
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
        }
    }

    /// Reads the key from `OPENAI_API_KEY`.
    pub fn from_env(config: &TranscriptionConfig) -> Self {
        Self::new(config, std::env::var("OPENAI_API_KEY").ok())
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<Transcript> {
        let wav = encode_wav(samples, sample_rate, 1)?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("window.wav")
            .mime_str("audio/wav")
            .map_err(|e| CallError::Transcription(format!("invalid MIME type: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", part);

        let mut request = self.client.post(self.endpoint.as_str()).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CallError::Transcription(format!("request failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CallError::Transcription(format!("reading response: {e}")))?;
        if !status.is_success() {
            return Err(CallError::Transcription(format!(
                "endpoint returned {status}: {body}"
            )));
        }

        let parsed: TranscriptionResponse = serde_json::from_str(&body)
            .map_err(|e| CallError::Transcription(format!("parsing response: {e}")))?;
        Ok(parsed.into_transcript())
    }
}
