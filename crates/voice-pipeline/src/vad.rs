//! Voice Activity Detection.
//!
//! `StreamingVad` does the bookkeeping every local detector needs (buffering
//! into analysis windows, resampling, run-length counters, hysteresis) and is
//! generic over a [`VadModel`] that scores one window. `WebRtcModel` is the
//! bundled local model. `DeepgramVad` takes speech boundaries from the Deepgram
//! live stream instead.

use crate::audio::{f32_to_pcm16_bytes, AudioChunk, StreamResampler};
use crate::config::VadSettings;
use crate::deepgram::{LiveConnection, LiveMessage, LiveOptions};
use crate::error::{VoiceError, VoiceResult};
use crate::events::EventEmitter;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc_vad::{SampleRate, VadMode};

/// Reconnect attempts per chunk for the remote detector.
pub const VAD_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VadEventType {
    SpeechStart,
    SpeechEnd,
    /// Emitted for every scored window.
    VadData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VadEvent {
    pub event_type: VadEventType,
    /// Stream position of the end of the scored window.
    pub timestamp: Duration,
    pub speech_probability: f32,
    /// Length of the current raw speech run.
    pub speech_duration: Duration,
    /// Length of the current raw silence run.
    pub silence_duration: Duration,
    /// Raw run counters in model-rate samples. Exactly one is non-zero after a
    /// window is scored; each resets when the thresholded window state flips.
    pub speech_samples: u64,
    pub silence_samples: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadCapabilities {
    /// How often `vad_data` fires.
    pub update_interval: Duration,
    pub sample_rate: u32,
}

pub type VadEmitter = EventEmitter<VadEventType, VadEvent>;

#[async_trait]
pub trait Vad: Send + Sync {
    fn events(&self) -> &Arc<VadEmitter>;

    fn capabilities(&self) -> VadCapabilities;

    /// True inside a `speech_start`..`speech_end` region.
    fn is_speaking(&self) -> bool;

    async fn process_chunk(&self, chunk: &AudioChunk) -> VoiceResult<()>;

    /// Drop buffered audio and counters. An open speech region is closed first.
    async fn reset(&self);

    /// Idempotent.
    async fn aclose(&self);
}

/// Scores fixed-size windows of mono audio.
pub trait VadModel: Send {
    /// Rate the model expects; input is resampled to it.
    fn sample_rate(&self) -> u32;

    /// Samples per analysis window at [`VadModel::sample_rate`].
    fn window_size(&self) -> usize;

    /// Speech probability in `0.0..=1.0`.
    fn score(&mut self, window: &[f32]) -> VoiceResult<f32>;

    fn reset(&mut self) {}
}

/// Thresholds for `StreamingVad`.
#[derive(Debug, Clone, PartialEq)]
pub struct VadConfig {
    /// Probability at or above which a window counts as speech (default: 0.5)
    pub threshold: f32,
    /// Speech run needed before `speech_start` fires (default: 90ms)
    pub min_speech_duration: Duration,
    /// Silence run needed before `speech_end` fires (default: 300ms)
    pub min_silence_duration: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_speech_duration: Duration::from_millis(90),
            min_silence_duration: Duration::from_millis(300),
        }
    }
}

impl From<&VadSettings> for VadConfig {
    fn from(settings: &VadSettings) -> Self {
        Self {
            threshold: settings.threshold,
            min_speech_duration: Duration::from_millis(settings.min_speech_duration_ms as u64),
            min_silence_duration: Duration::from_millis(settings.min_silence_duration_ms as u64),
        }
    }
}

struct VadSession<M> {
    model: M,
    resampler: StreamResampler,
    buffer: Vec<f32>,
    speaking: bool,
    speech_samples: u64,
    silence_samples: u64,
    /// Highest score in the current run of speech windows.
    speech_peak: f32,
    position_samples: u64,
}

impl<M: VadModel> VadSession<M> {
    fn new(model: M) -> Self {
        let rate = model.sample_rate();
        Self {
            model,
            resampler: StreamResampler::new(rate),
            buffer: Vec::new(),
            speaking: false,
            speech_samples: 0,
            silence_samples: 0,
            speech_peak: 0.0,
            position_samples: 0,
        }
    }

    fn duration_of(&self, samples: u64) -> Duration {
        Duration::from_secs_f64(samples as f64 / self.model.sample_rate() as f64)
    }

    fn event(&self, event_type: VadEventType, probability: f32) -> VadEvent {
        VadEvent {
            event_type,
            timestamp: self.duration_of(self.position_samples),
            speech_probability: probability,
            speech_duration: self.duration_of(self.speech_samples),
            silence_duration: self.duration_of(self.silence_samples),
            speech_samples: self.speech_samples,
            silence_samples: self.silence_samples,
        }
    }

    /// Score every complete window and return the events to emit, in order.
    /// A window the model fails to score is dropped without touching the
    /// counters, so events already produced for this chunk are still returned.
    fn ingest(&mut self, chunk: &AudioChunk, config: &VadConfig) -> VoiceResult<Vec<VadEvent>> {
        let samples = self.resampler.process(&chunk.samples, chunk.sample_rate)?;
        self.buffer.extend_from_slice(&samples);

        let window = self.model.window_size();
        let min_speech = (config.min_speech_duration.as_secs_f64() * self.model.sample_rate() as f64) as u64;
        let min_silence = (config.min_silence_duration.as_secs_f64() * self.model.sample_rate() as f64) as u64;
        let mut out = Vec::new();

        while window > 0 && self.buffer.len() >= window {
            let frame: Vec<f32> = self.buffer.drain(..window).collect();
            self.position_samples += window as u64;
            let probability = match self.model.score(&frame) {
                Ok(p) => p.clamp(0.0, 1.0),
                Err(e) => {
                    warn!("VAD skipped a window: {}", e);
                    continue;
                }
            };

            if probability >= config.threshold {
                self.speech_samples += window as u64;
                self.silence_samples = 0;
                self.speech_peak = self.speech_peak.max(probability);
            } else {
                self.silence_samples += window as u64;
                self.speech_samples = 0;
                self.speech_peak = 0.0;
            }

            out.push(self.event(VadEventType::VadData, probability));

            // Onset carries the run's peak; frame-quantized models dip mid-run.
            if !self.speaking && self.speech_samples > 0 && self.speech_samples >= min_speech {
                self.speaking = true;
                out.push(self.event(VadEventType::SpeechStart, self.speech_peak));
            } else if self.speaking && self.silence_samples > 0 && self.silence_samples >= min_silence {
                self.speaking = false;
                out.push(self.event(VadEventType::SpeechEnd, probability));
            }
        }
        Ok(out)
    }

    /// Close an open region and clear all per-session state.
    fn flush(&mut self) -> Option<VadEvent> {
        let closing = self.speaking.then(|| self.event(VadEventType::SpeechEnd, 0.0));
        self.speaking = false;
        self.buffer.clear();
        self.speech_samples = 0;
        self.silence_samples = 0;
        self.speech_peak = 0.0;
        self.resampler.reset();
        self.model.reset();
        closing
    }
}

/// Local detector: window bookkeeping around a [`VadModel`].
pub struct StreamingVad<M: VadModel> {
    config: VadConfig,
    session: StdMutex<VadSession<M>>,
    events: Arc<VadEmitter>,
    speaking: AtomicBool,
    closed: AtomicBool,
}

impl<M: VadModel> StreamingVad<M> {
    pub fn new(model: M, config: VadConfig) -> Self {
        info!(
            "🎙️ VAD ready ({}Hz, {} sample windows, threshold {})",
            model.sample_rate(),
            model.window_size(),
            config.threshold
        );
        Self {
            config,
            session: StdMutex::new(VadSession::new(model)),
            events: Arc::new(EventEmitter::new()),
            speaking: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Close a dangling speech region so every `speech_start` has its `speech_end`.
    pub async fn flush(&self) {
        let closing = self.lock().flush();
        self.speaking.store(false, Ordering::SeqCst);
        if let Some(event) = closing {
            debug!("VAD flush closed an open speech region");
            self.events.emit(VadEventType::SpeechEnd, event).await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, VadSession<M>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<M: VadModel + 'static> Vad for StreamingVad<M> {
    fn events(&self) -> &Arc<VadEmitter> {
        &self.events
    }

    fn capabilities(&self) -> VadCapabilities {
        let session = self.lock();
        let rate = session.model.sample_rate();
        VadCapabilities {
            update_interval: Duration::from_secs_f64(session.model.window_size() as f64 / rate as f64),
            sample_rate: rate,
        }
    }

    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    async fn process_chunk(&self, chunk: &AudioChunk) -> VoiceResult<()> {
        if self.closed.load(Ordering::SeqCst) || chunk.is_empty() {
            return Ok(());
        }
        let pending = {
            let mut session = self.lock();
            let pending = session.ingest(chunk, &self.config)?;
            self.speaking.store(session.speaking, Ordering::SeqCst);
            pending
        };
        for event in pending {
            if event.event_type != VadEventType::VadData {
                debug!(
                    probability = event.speech_probability,
                    "VAD {:?} at {:?}",
                    event.event_type,
                    event.timestamp
                );
            }
            self.events.emit(event.event_type, event).await;
        }
        Ok(())
    }

    async fn reset(&self) {
        self.flush().await;
    }

    async fn aclose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flush().await;
    }
}

/// `webrtc_vad::Vad` wraps a raw `Fvad` pointer.
struct FvadHandle(webrtc_vad::Vad);

// SAFETY: the fvad instance has no thread affinity; it is only touched through
// `&mut self` while StreamingVad holds its session mutex.
unsafe impl Send for FvadHandle {}

/// WebRTC VAD scoring 30 ms windows. The probability is the fraction of the
/// window's three 10 ms frames classified as voiced.
pub struct WebRtcModel {
    vad: FvadHandle,
    sample_rate: u32,
    mode: u8,
}

impl WebRtcModel {
    /// `sample_rate` must be 8000, 16000, 32000, or 48000 Hz; `mode` 0-3 (3 most aggressive).
    pub fn new(sample_rate: u32, mode: u8) -> VoiceResult<Self> {
        Ok(Self {
            vad: FvadHandle(Self::build(sample_rate, mode)?),
            sample_rate,
            mode,
        })
    }

    fn build(sample_rate: u32, mode: u8) -> VoiceResult<webrtc_vad::Vad> {
        let rate = match sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => {
                return Err(VoiceError::Config(format!(
                    "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                    other
                )))
            }
        };
        let vad_mode = match mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => return Err(VoiceError::Config(format!("VAD mode must be 0-3, got {}", other))),
        };

        let mut vad = webrtc_vad::Vad::new();
        vad.set_mode(vad_mode);
        vad.set_sample_rate(rate);
        Ok(vad)
    }

    fn frame_size(&self) -> usize {
        (self.sample_rate / 100) as usize
    }
}

impl VadModel for WebRtcModel {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn window_size(&self) -> usize {
        self.frame_size() * 3
    }

    fn score(&mut self, window: &[f32]) -> VoiceResult<f32> {
        let frame = self.frame_size();
        if window.len() != frame * 3 {
            return Err(VoiceError::Vad(format!("expected {} samples, got {}", frame * 3, window.len())));
        }

        let pcm: Vec<i16> = window
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect();
        let mut voiced = 0u32;
        for part in pcm.chunks(frame) {
            let is_speech = self
                .vad
                .0
                .is_voice_segment(part)
                .map_err(|_| VoiceError::Vad("WebRTC VAD rejected frame".to_string()))?;
            if is_speech {
                voiced += 1;
            }
        }
        Ok(voiced as f32 / 3.0)
    }

    fn reset(&mut self) {
        // fvad has no reset of its own; rebuild with the validated settings.
        if let Ok(vad) = Self::build(self.sample_rate, self.mode) {
            self.vad = FvadHandle(vad);
        }
    }
}

/// The bundled local detector.
pub type WebRtcVad = StreamingVad<WebRtcModel>;

impl WebRtcVad {
    pub fn from_settings(settings: &VadSettings, sample_rate: u32) -> VoiceResult<Self> {
        Ok(StreamingVad::new(WebRtcModel::new(sample_rate, settings.mode)?, settings.into()))
    }
}

struct RemoteState {
    speaking: AtomicBool,
    events: Arc<VadEmitter>,
}

impl RemoteState {
    fn boundary(&self, event_type: VadEventType, probability: f32, timestamp: f64) -> VadEvent {
        VadEvent {
            event_type,
            timestamp: Duration::from_secs_f64(timestamp.max(0.0)),
            speech_probability: probability,
            speech_duration: Duration::ZERO,
            silence_duration: Duration::ZERO,
            speech_samples: 0,
            silence_samples: 0,
        }
    }

    async fn open(&self, timestamp: f64) {
        if !self.speaking.swap(true, Ordering::SeqCst) {
            let event = self.boundary(VadEventType::SpeechStart, 1.0, timestamp);
            self.events.emit(VadEventType::VadData, event.clone()).await;
            self.events.emit(VadEventType::SpeechStart, event).await;
        }
    }

    async fn close(&self, timestamp: f64) {
        if self.speaking.swap(false, Ordering::SeqCst) {
            let event = self.boundary(VadEventType::SpeechEnd, 0.0, timestamp);
            self.events.emit(VadEventType::VadData, event.clone()).await;
            self.events.emit(VadEventType::SpeechEnd, event).await;
        }
    }
}

struct VadLink {
    connection: LiveConnection,
    dispatcher: JoinHandle<()>,
}

/// Speech boundaries from Deepgram's `vad_events` stream.
///
/// `SpeechStarted` opens a region; `UtteranceEnd` or an endpointed result
/// closes it. No per-window probabilities exist, so `vad_data` only fires on
/// boundaries.
pub struct DeepgramVad {
    api_key: String,
    options: LiveOptions,
    state: Arc<RemoteState>,
    link: Mutex<Option<VadLink>>,
    resampler: StdMutex<StreamResampler>,
    closed: AtomicBool,
    max_retries: u32,
}

impl DeepgramVad {
    pub fn new(api_key: impl Into<String>, options: LiveOptions) -> Self {
        let rate = options.sample_rate;
        Self {
            api_key: api_key.into(),
            options,
            state: Arc::new(RemoteState {
                speaking: AtomicBool::new(false),
                events: Arc::new(EventEmitter::new()),
            }),
            link: Mutex::new(None),
            resampler: StdMutex::new(StreamResampler::new(rate)),
            closed: AtomicBool::new(false),
            max_retries: VAD_MAX_RETRIES,
        }
    }

    async fn send_with_retry(&self, pcm: Vec<u8>) {
        let mut link = self.link.lock().await;
        for attempt in 1..=self.max_retries {
            if !link.as_ref().map_or(false, |l| l.connection.is_alive()) {
                if let Some(stale) = link.take() {
                    stale.connection.close().await;
                    stale.dispatcher.abort();
                }
                match LiveConnection::connect(&self.api_key, &self.options).await {
                    Ok((connection, messages)) => {
                        let dispatcher = tokio::spawn(remote_dispatch(messages, Arc::clone(&self.state)));
                        *link = Some(VadLink { connection, dispatcher });
                    }
                    Err(e) => {
                        warn!(attempt, max = self.max_retries, "VAD connect failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                        continue;
                    }
                }
            }

            if let Some(l) = link.as_ref() {
                match l.connection.send_audio(pcm.clone()).await {
                    Ok(()) => return,
                    Err(e) => warn!(attempt, max = self.max_retries, "VAD send failed: {}", e),
                }
            }
        }
        warn!("VAD giving up on chunk after {} attempts", self.max_retries);
    }

    async fn teardown(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.connection.close().await;
            link.dispatcher.abort();
        }
        self.resampler.lock().unwrap_or_else(PoisonError::into_inner).reset();
        self.state.close(0.0).await;
    }
}

async fn remote_dispatch(mut messages: mpsc::UnboundedReceiver<LiveMessage>, state: Arc<RemoteState>) {
    while let Some(message) = messages.recv().await {
        match message {
            LiveMessage::SpeechStarted { timestamp } => state.open(timestamp).await,
            LiveMessage::UtteranceEnd { last_word_end } => state.close(last_word_end).await,
            LiveMessage::Results {
                speech_final: true,
                start,
                duration,
                ..
            } => state.close(start + duration).await,
            _ => {}
        }
    }
}

#[async_trait]
impl Vad for DeepgramVad {
    fn events(&self) -> &Arc<VadEmitter> {
        &self.state.events
    }

    fn capabilities(&self) -> VadCapabilities {
        VadCapabilities {
            update_interval: Duration::ZERO,
            sample_rate: self.options.sample_rate,
        }
    }

    fn is_speaking(&self) -> bool {
        self.state.speaking.load(Ordering::SeqCst)
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
        self.send_with_retry(f32_to_pcm16_bytes(&samples)).await;
        Ok(())
    }

    async fn reset(&self) {
        self.teardown().await;
    }

    async fn aclose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown().await;
        info!("🎙️ Deepgram VAD closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;
    use std::sync::atomic::AtomicUsize;

    /// Deterministic stand-in: loud windows are speech.
    struct EnergyModel;

    impl VadModel for EnergyModel {
        fn sample_rate(&self) -> u32 {
            16000
        }

        fn window_size(&self) -> usize {
            512
        }

        fn score(&mut self, window: &[f32]) -> VoiceResult<f32> {
            Ok(if crate::audio::rms(window) > 0.05 { 0.95 } else { 0.02 })
        }
    }

    fn speech_like(seconds: f32, rate: u32) -> Vec<f32> {
        let n = (seconds * rate as f32) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / rate as f32;
                // Syllable-rate envelope over a voiced fundamental.
                let envelope = 0.7 + 0.3 * (2.0 * PI * 4.0 * t).sin();
                0.4 * envelope * (2.0 * PI * 180.0 * t).sin()
            })
            .collect()
    }

    /// Replays queued scores, then reports silence.
    struct ScriptedModel(std::collections::VecDeque<VoiceResult<f32>>);

    impl ScriptedModel {
        fn new(scores: impl IntoIterator<Item = VoiceResult<f32>>) -> Self {
            Self(scores.into_iter().collect())
        }
    }

    impl VadModel for ScriptedModel {
        fn sample_rate(&self) -> u32 {
            16000
        }

        fn window_size(&self) -> usize {
            512
        }

        fn score(&mut self, _window: &[f32]) -> VoiceResult<f32> {
            self.0.pop_front().unwrap_or(Ok(0.0))
        }
    }

    fn counters<M: VadModel + 'static>(vad: &StreamingVad<M>) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let starts = Arc::new(AtomicUsize::new(0));
        let ends = Arc::new(AtomicUsize::new(0));
        let s = starts.clone();
        vad.events().on(VadEventType::SpeechStart, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let e = ends.clone();
        vad.events().on(VadEventType::SpeechEnd, move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });
        (starts, ends)
    }

    async fn feed<M: VadModel + 'static>(vad: &StreamingVad<M>, samples: &[f32], rate: u32, block: usize) {
        for piece in samples.chunks(block) {
            vad.process_chunk(&AudioChunk::new(piece.to_vec(), rate)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn speech_then_silence_yields_one_pair() {
        let vad = StreamingVad::new(EnergyModel, VadConfig::default());
        let (starts, ends) = counters(&vad);

        let mut audio = speech_like(3.0, 16000);
        audio.extend(std::iter::repeat(0.0).take(3 * 16000));
        feed(&vad, &audio, 16000, 1024).await;

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert!(!vad.is_speaking());
    }

    #[tokio::test]
    async fn resamples_device_rate_input() {
        let vad = StreamingVad::new(EnergyModel, VadConfig::default());
        let (starts, ends) = counters(&vad);

        let mut audio = speech_like(1.0, 48000);
        audio.extend(std::iter::repeat(0.0).take(48000));
        feed(&vad, &audio, 48000, 960).await;

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flush_closes_open_region() {
        let vad = StreamingVad::new(EnergyModel, VadConfig::default());
        let (starts, ends) = counters(&vad);

        feed(&vad, &speech_like(1.0, 16000), 16000, 1024).await;
        assert!(vad.is_speaking());

        vad.aclose().await;
        vad.aclose().await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert!(!vad.is_speaking());
    }

    #[tokio::test]
    async fn counters_reset_when_window_state_flips() {
        let config = VadConfig {
            min_speech_duration: Duration::ZERO,
            min_silence_duration: Duration::ZERO,
            ..Default::default()
        };
        let vad = StreamingVad::new(EnergyModel, config);
        let data = Arc::new(StdMutex::new(Vec::new()));
        let d = data.clone();
        vad.events().on(VadEventType::VadData, move |e: &VadEvent| {
            d.lock().unwrap().push((e.speech_samples, e.silence_samples));
        });

        let mut audio = speech_like(0.1, 16000);
        audio.truncate(1024);
        audio.extend(std::iter::repeat(0.0).take(1024));
        feed(&vad, &audio, 16000, 2048).await;

        assert_eq!(*data.lock().unwrap(), vec![(512, 0), (1024, 0), (0, 512), (0, 1024)]);
    }

    #[tokio::test]
    async fn short_blip_is_ignored_by_hysteresis() {
        let vad = StreamingVad::new(EnergyModel, VadConfig::default());
        let (starts, _) = counters(&vad);

        // One 32 ms window of speech is under the 90 ms minimum.
        let mut audio = speech_like(0.1, 16000);
        audio.truncate(512);
        audio.extend(std::iter::repeat(0.0).take(16000));
        feed(&vad, &audio, 16000, 512).await;

        assert_eq!(starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scoring_error_skips_only_that_window() {
        let mut scores: Vec<VoiceResult<f32>> = (0..3).map(|_| Ok(0.9)).collect();
        scores.push(Err(VoiceError::Vad("model hiccup".to_string())));
        scores.push(Ok(0.9));
        let vad = StreamingVad::new(ScriptedModel::new(scores), VadConfig::default());
        let (starts, ends) = counters(&vad);
        let data = Arc::new(AtomicUsize::new(0));
        let d = data.clone();
        vad.events().on(VadEventType::VadData, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        // Speech, the failing window, then enough silence to close the region,
        // all in a single chunk.
        feed(&vad, &[0.0; 17 * 512], 16000, 17 * 512).await;

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert_eq!(data.load(Ordering::SeqCst), 16);
        assert!(!vad.is_speaking());
    }

    #[tokio::test]
    async fn speech_start_reports_run_peak() {
        let scores = [0.67, 1.0, 0.67].map(Ok);
        let vad = StreamingVad::new(ScriptedModel::new(scores), VadConfig::default());
        let onset = Arc::new(StdMutex::new(Vec::new()));
        let o = onset.clone();
        vad.events().on(VadEventType::SpeechStart, move |e: &VadEvent| {
            o.lock().unwrap().push(e.speech_probability);
        });

        feed(&vad, &[0.0; 3 * 512], 16000, 512).await;

        assert_eq!(*onset.lock().unwrap(), vec![1.0]);
    }

    #[test]
    fn webrtc_model_validates_settings() {
        assert!(WebRtcModel::new(44100, 3).is_err());
        assert!(WebRtcModel::new(16000, 4).is_err());

        let mut model = WebRtcModel::new(16000, 3).unwrap();
        assert_eq!(model.window_size(), 480);
        assert!(model.score(&[0.0; 100]).is_err());

        let p = model.score(&[0.0; 480]).unwrap();
        assert!((0.0..=1.0).contains(&p));
    }

    #[tokio::test]
    async fn deepgram_vad_aclose_without_connection() {
        let vad = DeepgramVad::new("test-key", LiveOptions::vad_only());
        vad.aclose().await;
        vad.aclose().await;
        assert!(!vad.is_speaking());
    }

    #[tokio::test]
    async fn remote_boundaries_are_paired() {
        let state = Arc::new(RemoteState {
            speaking: AtomicBool::new(false),
            events: Arc::new(EventEmitter::new()),
        });
        let log = Arc::new(StdMutex::new(Vec::new()));
        for kind in [VadEventType::SpeechStart, VadEventType::SpeechEnd] {
            let l = log.clone();
            state.events.on(kind, move |e: &VadEvent| l.lock().unwrap().push(e.event_type));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(LiveMessage::SpeechStarted { timestamp: 0.5 }).unwrap();
        tx.send(LiveMessage::SpeechStarted { timestamp: 0.7 }).unwrap();
        tx.send(LiveMessage::UtteranceEnd { last_word_end: 1.5 }).unwrap();
        tx.send(LiveMessage::UtteranceEnd { last_word_end: 1.6 }).unwrap();
        drop(tx);
        remote_dispatch(rx, state).await;

        assert_eq!(*log.lock().unwrap(), vec![VadEventType::SpeechStart, VadEventType::SpeechEnd]);
    }
}
