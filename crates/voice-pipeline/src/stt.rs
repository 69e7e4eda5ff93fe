//! **Speech-to-Text (STT)**: stream captured audio to a recognizer and publish
//! interim and final transcripts.
//!
//! Implement [`Stt`] for any streaming backend. `DeepgramStt` holds one live
//! WebSocket, reconnects on drop, and translates server messages into
//! [`SttEventType`] events.

use crate::audio::{f32_to_pcm16_bytes, AudioChunk, StreamResampler};
use crate::config::SttSettings;
use crate::deepgram::{LiveConnection, LiveMessage, LiveOptions};
use crate::error::{VoiceError, VoiceResult};
use crate::events::EventEmitter;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reconnect attempts per chunk before it is dropped.
pub const STT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SttEventType {
    /// Provider detected the start of speech.
    SpeechStarted,
    /// Revisable partial transcript.
    InterimTranscript,
    /// Authoritative transcript for a stretch of audio.
    FinalTranscript,
    /// Provider-signaled end of utterance.
    EndOfSpeech,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionAlternative {
    pub text: String,
    pub confidence: f32,
    pub language: Option<String>,
}

/// Ranked alternatives, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechEvent {
    pub event_type: SttEventType,
    pub alternatives: Vec<TranscriptionAlternative>,
    pub is_final: bool,
}

impl SpeechEvent {
    pub fn transcript(event_type: SttEventType, text: impl Into<String>, confidence: f32) -> Self {
        Self {
            event_type,
            alternatives: vec![TranscriptionAlternative {
                text: text.into(),
                confidence,
                language: None,
            }],
            is_final: event_type == SttEventType::FinalTranscript,
        }
    }

    /// A boundary event with no text.
    pub fn signal(event_type: SttEventType) -> Self {
        Self {
            event_type,
            alternatives: Vec::new(),
            is_final: false,
        }
    }

    /// Text of the best alternative, or `""`.
    pub fn text(&self) -> &str {
        self.alternatives.first().map_or("", |alt| alt.text.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SttCapabilities {
    pub streaming: bool,
    pub interim_results: bool,
}

pub type SttEmitter = EventEmitter<SttEventType, SpeechEvent>;

#[async_trait]
pub trait Stt: Send + Sync {
    fn events(&self) -> &Arc<SttEmitter>;

    fn capabilities(&self) -> SttCapabilities;

    /// Text of the most recent final transcript.
    fn current_text(&self) -> String;

    /// True between an interim transcript and the final that settles it.
    fn is_processing(&self) -> bool;

    async fn process_chunk(&self, chunk: &AudioChunk) -> VoiceResult<()>;

    async fn reset(&self);

    /// Release the connection. Idempotent.
    async fn aclose(&self);
}

#[derive(Default)]
struct SttShared {
    current_text: StdMutex<String>,
    processing: AtomicBool,
}

impl SttShared {
    fn set_text(&self, text: &str) {
        *self.current_text.lock().unwrap_or_else(PoisonError::into_inner) = text.to_string();
    }

    fn text(&self) -> String {
        self.current_text.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct SttLink {
    connection: LiveConnection,
    dispatcher: JoinHandle<()>,
}

impl SttLink {
    async fn shutdown(self) {
        self.connection.close().await;
        self.dispatcher.abort();
    }
}

/// Deepgram live transcription.
pub struct DeepgramStt {
    api_key: String,
    options: LiveOptions,
    events: Arc<SttEmitter>,
    shared: Arc<SttShared>,
    link: Mutex<Option<SttLink>>,
    resampler: StdMutex<StreamResampler>,
    closed: AtomicBool,
    max_retries: u32,
}

impl DeepgramStt {
    pub fn new(api_key: impl Into<String>, options: LiveOptions) -> Self {
        let target_rate = options.sample_rate;
        Self {
            api_key: api_key.into(),
            options,
            events: Arc::new(EventEmitter::new()),
            shared: Arc::new(SttShared::default()),
            link: Mutex::new(None),
            resampler: StdMutex::new(StreamResampler::new(target_rate)),
            closed: AtomicBool::new(false),
            max_retries: STT_MAX_RETRIES,
        }
    }

    pub fn from_settings(api_key: impl Into<String>, settings: &SttSettings) -> Self {
        let options = LiveOptions {
            model: settings.model.clone(),
            language: settings.language.clone(),
            endpointing_ms: Some(settings.endpointing_ms),
            utterance_end_ms: Some(settings.utterance_end_ms),
            ..Default::default()
        };
        Self::new(api_key, options)
    }

    /// Open a connection if there is none or the last one dropped.
    async fn ensure_connected(&self, link: &mut Option<SttLink>) -> VoiceResult<()> {
        if link.as_ref().map_or(false, |l| l.connection.is_alive()) {
            return Ok(());
        }
        if let Some(stale) = link.take() {
            stale.shutdown().await;
        }

        let (connection, messages) = LiveConnection::connect(&self.api_key, &self.options).await?;
        let dispatcher = tokio::spawn(dispatch(messages, Arc::clone(&self.events), Arc::clone(&self.shared)));
        info!("🎧 Deepgram STT stream open");
        *link = Some(SttLink { connection, dispatcher });
        Ok(())
    }

    async fn send_with_retry(&self, pcm: Vec<u8>) -> VoiceResult<()> {
        let mut link = self.link.lock().await;
        for attempt in 1..=self.max_retries {
            let result = match self.ensure_connected(&mut link).await {
                Ok(()) => match link.as_ref() {
                    Some(l) => l.connection.send_audio(pcm.clone()).await,
                    None => Err(VoiceError::Connection("no STT connection".to_string())),
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    warn!(attempt, max = self.max_retries, "STT connection error: {}", e);
                    if let Some(stale) = link.take() {
                        stale.shutdown().await;
                    }
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
        warn!("STT giving up on chunk after {} attempts", self.max_retries);
        Ok(())
    }

    async fn teardown(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.shutdown().await;
        }
        self.shared.set_text("");
        self.shared.processing.store(false, Ordering::SeqCst);
        self.resampler.lock().unwrap_or_else(PoisonError::into_inner).reset();
    }
}

async fn dispatch(
    mut messages: mpsc::UnboundedReceiver<LiveMessage>,
    events: Arc<SttEmitter>,
    shared: Arc<SttShared>,
) {
    while let Some(message) = messages.recv().await {
        match message {
            LiveMessage::Results {
                alternatives,
                is_final,
                speech_final,
                ..
            } => {
                let text = alternatives.first().map_or("", |a| a.text.trim());
                if !text.is_empty() {
                    let event_type = if is_final {
                        shared.set_text(text);
                        shared.processing.store(false, Ordering::SeqCst);
                        SttEventType::FinalTranscript
                    } else {
                        shared.processing.store(true, Ordering::SeqCst);
                        SttEventType::InterimTranscript
                    };
                    debug!(final_ = is_final, "📝 {}", text);
                    let event = SpeechEvent {
                        event_type,
                        alternatives,
                        is_final,
                    };
                    events.emit(event_type, event).await;
                }
                if speech_final {
                    events
                        .emit(SttEventType::EndOfSpeech, SpeechEvent::signal(SttEventType::EndOfSpeech))
                        .await;
                }
            }
            LiveMessage::SpeechStarted { .. } => {
                events
                    .emit(SttEventType::SpeechStarted, SpeechEvent::signal(SttEventType::SpeechStarted))
                    .await;
            }
            LiveMessage::UtteranceEnd { .. } => {
                events
                    .emit(SttEventType::EndOfSpeech, SpeechEvent::signal(SttEventType::EndOfSpeech))
                    .await;
            }
            LiveMessage::Metadata { request_id } => {
                debug!("Deepgram STT session {:?}", request_id);
            }
            LiveMessage::Other => {}
        }
    }
    debug!("STT dispatcher finished");
}

#[async_trait]
impl Stt for DeepgramStt {
    fn events(&self) -> &Arc<SttEmitter> {
        &self.events
    }

    fn capabilities(&self) -> SttCapabilities {
        SttCapabilities {
            streaming: true,
            interim_results: self.options.interim_results,
        }
    }

    fn current_text(&self) -> String {
        self.shared.text()
    }

    fn is_processing(&self) -> bool {
        self.shared.processing.load(Ordering::SeqCst)
    }

    async fn process_chunk(&self, chunk: &AudioChunk) -> VoiceResult<()> {
        if self.closed.load(Ordering::SeqCst) || chunk.is_empty() {
            return Ok(());
        }
        let samples = self
            .resampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process(&chunk.samples, chunk.sample_rate)?;
        if samples.is_empty() {
            return Ok(());
        }
        self.send_with_retry(f32_to_pcm16_bytes(&samples)).await
    }

    async fn reset(&self) {
        self.teardown().await;
    }

    async fn aclose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown().await;
        info!("🎧 Deepgram STT closed");
    }
}
