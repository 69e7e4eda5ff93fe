//! Pipeline configuration, provider settings, and credentials.
//!
//! `PipelineSettings::load()` layers defaults, an optional TOML file, and
//! `VOICE__*` environment variables (e.g. `VOICE__PIPELINE__ALLOW_INTERRUPTIONS=false`).

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Env var naming the settings file (the extension may be omitted).
pub const ENV_CONFIG_PATH: &str = "VOICE_PIPELINE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/voice";

/// Device sample format for capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    #[serde(alias = "i16")]
    Int16,
    #[serde(alias = "f32")]
    Float32,
}

/// Construction-time configuration of the voice pipeline. Immutable once the
/// agent is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Whether user speech may interrupt the agent mid-utterance.
    pub allow_interruptions: bool,
    /// Debounce (seconds) between a barge-in `speech_start` and the interruption check.
    pub interrupt_speech_duration: f64,
    /// Interim words required to interrupt; raised to [`MIN_INTERRUPT_WORDS`] when lower.
    ///
    /// [`MIN_INTERRUPT_WORDS`]: crate::turn::MIN_INTERRUPT_WORDS
    pub interrupt_min_words: usize,
    /// Silence (seconds) after a final transcript before the utterance is committed.
    pub min_endpointing_delay: f64,
    /// Upper bound (seconds) on waiting for the user to go quiet after a final transcript.
    pub max_endpointing_delay: f64,
    /// Tool-call nesting limit handed to hosts that run tools; the pipeline itself makes none.
    pub max_nested_fnc_calls: u32,
    /// Start responding on VAD `speech_end` instead of waiting for endpointing.
    pub preemptive_synthesis: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub dtype: SampleFormat,
    /// Capture block size in frames.
    pub blocksize: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            allow_interruptions: true,
            interrupt_speech_duration: 0.2,
            interrupt_min_words: 0,
            min_endpointing_delay: 0.5,
            max_endpointing_delay: 6.0,
            max_nested_fnc_calls: 1,
            preemptive_synthesis: false,
            sample_rate: 16000,
            channels: 1,
            dtype: SampleFormat::Int16,
            blocksize: 1024,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> VoiceResult<()> {
        if self.sample_rate == 0 {
            return Err(VoiceError::Config("sample_rate must be > 0".to_string()));
        }
        if self.channels == 0 {
            return Err(VoiceError::Config("channels must be > 0".to_string()));
        }
        if self.blocksize == 0 {
            return Err(VoiceError::Config("blocksize must be > 0".to_string()));
        }
        for (name, value) in [
            ("interrupt_speech_duration", self.interrupt_speech_duration),
            ("min_endpointing_delay", self.min_endpointing_delay),
            ("max_endpointing_delay", self.max_endpointing_delay),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(VoiceError::Config(format!("{} must be a non-negative number of seconds, got {}", name, value)));
            }
        }
        if self.min_endpointing_delay > self.max_endpointing_delay {
            return Err(VoiceError::Config(format!(
                "min_endpointing_delay ({}) exceeds max_endpointing_delay ({})",
                self.min_endpointing_delay, self.max_endpointing_delay
            )));
        }
        Ok(())
    }

    pub fn interruption_debounce(&self) -> Duration {
        Duration::from_secs_f64(self.interrupt_speech_duration)
    }

    pub fn min_endpointing(&self) -> Duration {
        Duration::from_secs_f64(self.min_endpointing_delay)
    }

    pub fn max_endpointing(&self) -> Duration {
        Duration::from_secs_f64(self.max_endpointing_delay)
    }
}

/// Which VAD implementation the factory builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadBackend {
    WebRtc,
    Deepgram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadSettings {
    pub backend: VadBackend,
    /// Probability at or above which a window counts as speech.
    pub threshold: f32,
    /// WebRTC aggressiveness, 0-3.
    pub mode: u8,
    pub min_speech_duration_ms: u32,
    pub min_silence_duration_ms: u32,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            backend: VadBackend::WebRtc,
            threshold: 0.5,
            mode: 3,
            min_speech_duration_ms: 90,
            min_silence_duration_ms: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SttSettings {
    pub model: String,
    pub language: String,
    /// Provider-side endpointing silence, in milliseconds.
    pub endpointing_ms: u32,
    pub utterance_end_ms: u32,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            model: "nova-2".to_string(),
            language: "en".to_string(),
            endpointing_ms: 25,
            utterance_end_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini-2024-07-18".to_string(),
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    pub base_url: String,
    pub model_id: String,
    pub voice_id: String,
    pub sample_rate: u32,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.cartesia.ai".to_string(),
            model_id: "sonic-2024-12-12".to_string(),
            voice_id: String::new(),
            sample_rate: 44100,
        }
    }
}

/// Everything the factory needs besides credentials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub pipeline: PipelineConfig,
    pub vad: VadSettings,
    pub stt: SttSettings,
    pub llm: LlmSettings,
    pub tts: TtsSettings,
    /// Optional system prompt seeded into the chat context.
    pub system_prompt: Option<String>,
}

impl PipelineSettings {
    /// Load settings. Precedence: `VOICE__*` env > file at `VOICE_PIPELINE_CONFIG`
    /// (default `config/voice`) > defaults.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = config::Config::builder();

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder.add_source(config::File::with_name(&config_path).required(false))
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("VOICE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: PipelineSettings = built.try_deserialize()?;
        settings.pipeline.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(raw: &str) -> VoiceResult<Self> {
        let settings: PipelineSettings =
            toml::from_str(raw).map_err(|e| VoiceError::Config(e.to_string()))?;
        settings.pipeline.validate()?;
        Ok(settings)
    }
}

/// Provider API keys. Opaque to the pipeline; only the providers validate them.
#[derive(Clone)]
pub struct PipelineCredentials {
    pub deepgram_api_key: String,
    pub cartesia_api_key: String,
    pub openai_api_key: String,
}

impl PipelineCredentials {
    /// Read `DEEPGRAM_API_KEY`, `CARTESIA_API_KEY`, and `OPENAI_API_KEY`.
    pub fn from_env() -> VoiceResult<Self> {
        Ok(Self {
            deepgram_api_key: required_env("DEEPGRAM_API_KEY")?,
            cartesia_api_key: required_env("CARTESIA_API_KEY")?,
            openai_api_key: required_env("OPENAI_API_KEY")?,
        })
    }
}

impl fmt::Debug for PipelineCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCredentials")
            .field("deepgram_api_key", &"<redacted>")
            .field("cartesia_api_key", &"<redacted>")
            .field("openai_api_key", &"<redacted>")
            .finish()
    }
}

fn required_env(name: &str) -> VoiceResult<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(VoiceError::Config(format!("{} not set", name))),
    }
}
