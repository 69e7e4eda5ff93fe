//! Scriptable stand-ins for the pipeline components.
//!
//! VAD and STT mocks never look at audio; tests drive their events directly,
//! which runs the agent's handlers inline just like a real provider callback.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use voice_pipeline::events::EventEmitter;
use voice_pipeline::stt::{SpeechEvent, SttCapabilities, SttEmitter};
use voice_pipeline::tts::{AudioStream, TtsCapabilities};
use voice_pipeline::vad::{VadCapabilities, VadEmitter};
use voice_pipeline::{
    AudioChunk, AudioSink, AudioSource, Stt, SttEventType, Tts, Vad, VadEvent, VadEventType,
    VoiceError, VoiceResult,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Default)]
pub struct MockVad {
    events: Arc<VadEmitter>,
    speaking: AtomicBool,
    pub chunks: AtomicUsize,
    pub closes: AtomicUsize,
}

impl MockVad {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Arc::new(EventEmitter::new()),
            ..Default::default()
        })
    }

    fn event(event_type: VadEventType, probability: f32) -> VadEvent {
        VadEvent {
            event_type,
            timestamp: Duration::ZERO,
            speech_probability: probability,
            speech_duration: Duration::ZERO,
            silence_duration: Duration::ZERO,
            speech_samples: 0,
            silence_samples: 0,
        }
    }

    pub async fn speech_start(&self, probability: f32) {
        self.speaking.store(true, Ordering::SeqCst);
        self.events
            .emit(VadEventType::SpeechStart, Self::event(VadEventType::SpeechStart, probability))
            .await;
    }

    pub async fn vad_data(&self, probability: f32) {
        self.events
            .emit(VadEventType::VadData, Self::event(VadEventType::VadData, probability))
            .await;
    }

    pub async fn speech_end(&self) {
        self.speaking.store(false, Ordering::SeqCst);
        self.events
            .emit(VadEventType::SpeechEnd, Self::event(VadEventType::SpeechEnd, 0.0))
            .await;
    }
}

#[async_trait]
impl Vad for MockVad {
    fn events(&self) -> &Arc<VadEmitter> {
        &self.events
    }

    fn capabilities(&self) -> VadCapabilities {
        VadCapabilities {
            update_interval: Duration::from_millis(32),
            sample_rate: 16_000,
        }
    }

    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    async fn process_chunk(&self, _chunk: &AudioChunk) -> VoiceResult<()> {
        self.chunks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&self) {
        self.speaking.store(false, Ordering::SeqCst);
    }

    async fn aclose(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockStt {
    events: Arc<SttEmitter>,
    text: Mutex<String>,
    pub chunks: AtomicUsize,
    pub closes: AtomicUsize,
}

impl MockStt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Arc::new(EventEmitter::new()),
            ..Default::default()
        })
    }

    pub async fn interim(&self, text: &str) {
        self.events
            .emit(
                SttEventType::InterimTranscript,
                SpeechEvent::transcript(SttEventType::InterimTranscript, text, 0.8),
            )
            .await;
    }

    pub async fn final_transcript(&self, text: &str) {
        *self.text.lock().unwrap() = text.to_string();
        self.events
            .emit(
                SttEventType::FinalTranscript,
                SpeechEvent::transcript(SttEventType::FinalTranscript, text, 0.95),
            )
            .await;
    }

    pub async fn end_of_speech(&self) {
        self.events
            .emit(
                SttEventType::EndOfSpeech,
                SpeechEvent::signal(SttEventType::EndOfSpeech),
            )
            .await;
    }
}

#[async_trait]
impl Stt for MockStt {
    fn events(&self) -> &Arc<SttEmitter> {
        &self.events
    }

    fn capabilities(&self) -> SttCapabilities {
        SttCapabilities {
            streaming: true,
            interim_results: true,
        }
    }

    fn current_text(&self) -> String {
        self.text.lock().unwrap().clone()
    }

    fn is_processing(&self) -> bool {
        false
    }

    async fn process_chunk(&self, _chunk: &AudioChunk) -> VoiceResult<()> {
        self.chunks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&self) {
        self.text.lock().unwrap().clear();
    }

    async fn aclose(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Produces `seconds_per_span` of a quiet tone for every span.
pub struct MockTts {
    sample_rate: u32,
    seconds_per_span: f32,
    pub texts: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
}

impl MockTts {
    pub fn new(seconds_per_span: f32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate: 16_000,
            seconds_per_span,
            texts: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tts for MockTts {
    fn capabilities(&self) -> TtsCapabilities {
        TtsCapabilities {
            streaming: false,
            sample_rate: self.sample_rate,
            channels: 1,
        }
    }

    fn is_synthesizing(&self) -> bool {
        false
    }

    async fn synthesize(&self, text: &str) -> VoiceResult<AudioStream> {
        self.texts.lock().unwrap().push(text.to_string());
        let total = (self.sample_rate as f32 * self.seconds_per_span) as usize;
        let chunks: Vec<VoiceResult<AudioChunk>> = vec![0.2f32; total]
            .chunks(1024)
            .map(|c| Ok(AudioChunk::new(c.to_vec(), self.sample_rate)))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn aclose(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Plays in virtual time: each chunk takes its real duration unless stopped.
#[derive(Default)]
pub struct RecordingSink {
    played: Mutex<Vec<AudioChunk>>,
    playing: AtomicBool,
    halt: Notify,
    pub stops: AtomicUsize,
    pub closes: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn played(&self) -> Vec<AudioChunk> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, chunk: AudioChunk) -> VoiceResult<()> {
        let halted = self.halt.notified();
        let duration = chunk.duration();
        self.played.lock().unwrap().push(chunk);
        self.playing.store(true, Ordering::SeqCst);
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = halted => {}
        }
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
        self.halt.notify_waiters();
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    async fn aclose(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Capture stand-in; tests push chunks by hand.
#[derive(Default)]
pub struct ChannelSource {
    sender: Mutex<Option<mpsc::UnboundedSender<AudioChunk>>>,
    fail_start: bool,
    pub stops: AtomicUsize,
}

impl ChannelSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_start: true,
            ..Default::default()
        })
    }

    pub fn push(&self, chunk: AudioChunk) -> bool {
        match self.sender.lock().unwrap().as_ref() {
            Some(tx) => tx.send(chunk).is_ok(),
            None => false,
        }
    }
}

impl AudioSource for ChannelSource {
    fn start(&self, sender: mpsc::UnboundedSender<AudioChunk>) -> VoiceResult<()> {
        if self.fail_start {
            return Err(VoiceError::AudioDevice("no input device".to_string()));
        }
        *self.sender.lock().unwrap() = Some(sender);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.sender.lock().unwrap().take();
    }
}
