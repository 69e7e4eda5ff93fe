//! Error types for the voice pipeline

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice pipeline
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("VAD error: {0}")]
    Vad(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("TTS error: {0}")]
    Tts(String),

    /// Transient network failure talking to a provider.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed provider payload (bad JSON, truncated WAV, ...).
    #[error("Format error: {0}")]
    Format(String),

    #[error("Resampling error: {0}")]
    Resample(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Connection errors are retried for persistent streams.
    pub fn is_transient(&self) -> bool {
        matches!(self, VoiceError::Connection(_))
    }

    /// Format errors drop the affected unit (one chunk or one span) and move on.
    pub fn is_format(&self) -> bool {
        matches!(self, VoiceError::Format(_))
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Format(err.to_string())
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            VoiceError::Format(err.to_string())
        } else {
            VoiceError::Connection(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Connection(err.to_string())
    }
}

impl From<rubato::ResampleError> for VoiceError {
    fn from(err: rubato::ResampleError) -> Self {
        VoiceError::Resample(err.to_string())
    }
}

impl From<rubato::ResamplerConstructionError> for VoiceError {
    fn from(err: rubato::ResamplerConstructionError) -> Self {
        VoiceError::Resample(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_taxonomy() {
        assert!(VoiceError::Connection("reset".into()).is_transient());
        assert!(!VoiceError::Tts("boom".into()).is_transient());
        assert!(VoiceError::Format("bad wav".into()).is_format());

        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(VoiceError::from(json_err).is_format());
    }
}
