//! **Text-to-Speech (TTS)**: one call per span of committed text, returning
//! fixed-size audio chunks for incremental playback.

use crate::audio::{downmix, pcm16_to_f32, AudioChunk};
use crate::config::TtsSettings;
use crate::error::{VoiceError, VoiceResult};
use crate::llm::ActiveStream;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::Serialize;
use std::borrow::Cow;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Audio chunks in playback order.
pub type AudioStream = BoxStream<'static, VoiceResult<AudioChunk>>;

/// Samples per chunk handed to playback.
pub const TTS_CHUNK_SIZE: usize = 1024;

const CARTESIA_VERSION: &str = "2024-06-10";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtsCapabilities {
    pub streaming: bool,
    pub sample_rate: u32,
    pub channels: u16,
}

#[async_trait]
pub trait Tts: Send + Sync {
    fn capabilities(&self) -> TtsCapabilities;

    fn sample_rate(&self) -> u32 {
        self.capabilities().sample_rate
    }

    fn is_synthesizing(&self) -> bool;

    /// Audio for one span. Whitespace-only text yields an empty stream without
    /// contacting the provider.
    async fn synthesize(&self, text: &str) -> VoiceResult<AudioStream>;

    async fn reset(&self) {}

    /// Idempotent.
    async fn aclose(&self);
}

/// Decoded WAV payload, downmixed to mono.
#[derive(Debug, Clone, PartialEq)]
pub struct WavAudio {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

fn format_error(e: hound::Error) -> VoiceError {
    VoiceError::Format(format!("WAV decode failed: {}", e))
}

/// Streamed bodies declare a placeholder data length (0 or u32::MAX). Rewrite
/// it to the whole frames that actually arrived so hound accepts the body.
fn with_arrived_data_len(bytes: &[u8]) -> VoiceResult<Cow<'_, [u8]>> {
    let Some(tag) = bytes.windows(4).position(|w| w == b"data") else {
        return Ok(Cow::Borrowed(bytes));
    };
    let (len_at, body) = (tag + 4, tag + 8);
    if body > bytes.len() {
        return Ok(Cow::Borrowed(bytes));
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[len_at..body]);
    let declared = u32::from_le_bytes(raw) as usize;
    let arrived = bytes.len() - body;
    if declared != 0 && declared <= arrived {
        return Ok(Cow::Borrowed(bytes));
    }

    let mut patched = bytes.to_vec();
    patched[len_at..body].copy_from_slice(&0u32.to_le_bytes());
    let spec = hound::WavReader::new(Cursor::new(&patched[..]))
        .map_err(format_error)?
        .spec();
    let frame = spec.channels as usize * (spec.bits_per_sample as usize).div_ceil(8);
    let usable = if frame == 0 { 0 } else { arrived - arrived % frame };
    patched[len_at..body].copy_from_slice(&(usable as u32).to_le_bytes());
    Ok(Cow::Owned(patched))
}

/// Decode a float32 or PCM16 WAV body, downmixed to mono.
pub fn decode_wav(bytes: &[u8]) -> VoiceResult<WavAudio> {
    let bytes = with_arrived_data_len(bytes)?;
    let reader = hound::WavReader::new(Cursor::new(&bytes[..])).map_err(format_error)?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(VoiceError::Format("WAV declares zero channels or rate".to_string()));
    }

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(format_error)?,
        (hound::SampleFormat::Int, 16) => reader
            .into_samples::<i16>()
            .map(|sample| sample.map(pcm16_to_f32))
            .collect::<Result<_, _>>()
            .map_err(format_error)?,
        (format, bits) => {
            return Err(VoiceError::Format(format!(
                "unsupported WAV encoding ({:?}, {} bits)",
                format, bits
            )))
        }
    };

    Ok(WavAudio {
        sample_rate: spec.sample_rate,
        samples: downmix(&interleaved, spec.channels as usize),
    })
}

/// Split samples into `chunk_size` pieces. The total is zero-padded up to a
/// multiple of 4.
pub fn rechunk(mut samples: Vec<f32>, sample_rate: u32, chunk_size: usize) -> Vec<AudioChunk> {
    let padded = samples.len().div_ceil(4) * 4;
    samples.resize(padded, 0.0);
    samples
        .chunks(chunk_size.max(1))
        .map(|piece| AudioChunk::new(piece.to_vec(), sample_rate))
        .collect()
}

/// Cartesia voice settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TtsConfig {
    pub base_url: String,
    /// Model (default: sonic-2024-12-12)
    pub model_id: String,
    pub voice_id: String,
    /// Output rate requested from the provider (default: 44100)
    pub sample_rate: u32,
    pub language: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self::from(&TtsSettings::default())
    }
}

impl From<&TtsSettings> for TtsConfig {
    fn from(settings: &TtsSettings) -> Self {
        Self {
            base_url: settings.base_url.clone(),
            model_id: settings.model_id.clone(),
            voice_id: settings.voice_id.clone(),
            sample_rate: settings.sample_rate,
            language: "en".to_string(),
        }
    }
}

#[derive(Serialize)]
struct BytesRequest<'a> {
    model_id: &'a str,
    transcript: &'a str,
    voice: VoiceSpec<'a>,
    output_format: OutputFormat,
    language: &'a str,
}

#[derive(Serialize)]
struct VoiceSpec<'a> {
    mode: &'static str,
    id: &'a str,
}

#[derive(Serialize)]
struct OutputFormat {
    container: &'static str,
    encoding: &'static str,
    sample_rate: u32,
}

/// Cartesia `/tts/bytes`, requesting a float32 WAV.
pub struct CartesiaTts {
    client: reqwest::Client,
    api_key: String,
    config: TtsConfig,
    active: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl CartesiaTts {
    pub fn new(api_key: impl Into<String>, config: TtsConfig) -> VoiceResult<Self> {
        if config.voice_id.trim().is_empty() {
            return Err(VoiceError::Config("Cartesia voice_id is required".to_string()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        info!("🔊 Cartesia TTS ready (model: {}, {}Hz)", config.model_id, config.sample_rate);
        Ok(Self {
            client,
            api_key: api_key.into(),
            config,
            active: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/tts/bytes", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Tts for CartesiaTts {
    fn capabilities(&self) -> TtsCapabilities {
        TtsCapabilities {
            streaming: false,
            sample_rate: self.config.sample_rate,
            channels: 1,
        }
    }

    fn is_synthesizing(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    async fn synthesize(&self, text: &str) -> VoiceResult<AudioStream> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(stream::empty().boxed());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::Tts("TTS client is closed".to_string()));
        }

        let _active = ActiveStream::enter(&self.active);
        let request = BytesRequest {
            model_id: &self.config.model_id,
            transcript: text,
            voice: VoiceSpec {
                mode: "id",
                id: &self.config.voice_id,
            },
            output_format: OutputFormat {
                container: "wav",
                encoding: "pcm_f32le",
                sample_rate: self.config.sample_rate,
            },
            language: &self.config.language,
        };
        debug!(chars = text.len(), "Synthesizing span");

        let response = self
            .client
            .post(self.endpoint())
            .header("X-API-Key", &self.api_key)
            .header("Cartesia-Version", CARTESIA_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            error!(status = %status, "TTS HTTP {}: {}", status, body);
            return Err(VoiceError::Tts(format!("synthesis failed ({}): {}", status, body)));
        }

        let bytes = response.bytes().await?;
        let wav = decode_wav(&bytes)?;
        let chunks = rechunk(wav.samples, wav.sample_rate, TTS_CHUNK_SIZE);
        debug!(chunks = chunks.len(), rate = wav.sample_rate, "Span synthesized");
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    async fn aclose(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
