//! # Voice Pipeline - Real-Time Spoken Dialogue
//!
//! Listens to a microphone, detects when the user speaks, transcribes the
//! speech, streams a reply from a language model, and speaks it back, with
//! natural turn-taking and barge-in.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      VoicePipelineAgent                          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐          │
//! │  │   Audio In   │ → │     VAD      │ → │  Barge-in /  │          │
//! │  │    (cpal)    │ → │     STT      │ → │ Endpointing  │          │
//! │  └──────────────┘   └──────────────┘   └──────────────┘          │
//! │                                               ↓                  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐          │
//! │  │  Audio Out   │ ← │     TTS      │ ← │  LLM stream  │          │
//! │  │   (rodio)    │   │  (per span)  │   │ (SpanBuffer) │          │
//! │  └──────────────┘   └──────────────┘   └──────────────┘          │
//! │         ↑                                                        │
//! │         └──────────── cancel on interruption ────────────────────│
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Components talk to the agent through [`EventEmitter`]s; the agent publishes
//! its own lifecycle through [`VoicePipelineAgent::events`].

pub mod audio;
pub mod config;
pub mod deepgram;
pub mod error;
pub mod events;
pub mod factory;
pub mod llm;
pub mod orchestrator;
pub mod stt;
pub mod tts;
pub mod turn;
pub mod vad;
pub mod voice_output;

pub use audio::{AudioChunk, AudioConfig, AudioSource, CpalCapture, StreamResampler};
pub use config::{
    LlmSettings, PipelineConfig, PipelineCredentials, PipelineSettings, SampleFormat,
    SttSettings, TtsSettings, VadBackend, VadSettings,
};
pub use error::{VoiceError, VoiceResult};
pub use events::{EventEmitter, HandlerId};
pub use factory::PipelineFactory;
pub use llm::{ChatContext, Llm, Message, OpenAiLlm, Role, ScriptedLlm, TextStream};
pub use orchestrator::{AgentEvent, AgentEventType, AgentState, VoicePipelineAgent};
pub use stt::{DeepgramStt, SpeechEvent, Stt, SttEventType, TranscriptionAlternative};
pub use tts::{AudioStream, CartesiaTts, Tts, TtsConfig};
pub use turn::{BargeIn, SpanBuffer};
pub use vad::{DeepgramVad, Vad, VadConfig, VadEvent, VadEventType, WebRtcVad};
pub use voice_output::{AudioSink, RodioOutput};
