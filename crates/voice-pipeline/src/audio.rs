//! Audio capture using CPAL, plus the small amount of DSP the pipeline needs.
//!
//! Capture runs on a dedicated thread: the CPAL stream is `!Send` on some
//! platforms, so the thread opens it, reports success or failure back to
//! `start()`, and then parks until `stop()`. The device callback is the single
//! producer of the capture queue.

use crate::config::{PipelineConfig, SampleFormat};
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SizedSample, Stream, StreamConfig};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::sync::{mpsc as std_mpsc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// RMS below which synthesized audio is considered inaudible (100 on the PCM16 scale).
pub const QUIET_RMS_FLOOR: f32 = 100.0 / 32768.0;

/// Gain applied to audio under [`QUIET_RMS_FLOOR`].
pub const QUIET_GAIN: f32 = 50.0;

/// Ordered mono samples (f32, normalized to -1.0..=1.0) at a sample rate.
///
/// Empty chunks are valid but carry no signal.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        debug_assert!(sample_rate > 0, "sample rate must be positive");
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    /// Join chunks end to end. The first chunk's sample rate wins.
    pub fn concat(chunks: &[AudioChunk]) -> Option<AudioChunk> {
        let first = chunks.first()?;
        let total = chunks.iter().map(AudioChunk::len).sum();
        let mut samples = Vec::with_capacity(total);
        for chunk in chunks {
            if chunk.sample_rate != first.sample_rate {
                warn!(
                    expected = first.sample_rate,
                    got = chunk.sample_rate,
                    "Concatenating chunks with mismatched sample rates"
                );
            }
            samples.extend_from_slice(&chunk.samples);
        }
        Some(AudioChunk::new(samples, first.sample_rate))
    }
}

/// Root-mean-square level of a block.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Apply [`QUIET_GAIN`] (clipped to the valid range) when the block is under the
/// audibility floor. Returns whether gain was applied.
pub fn boost_if_quiet(samples: &mut [f32]) -> bool {
    let level = rms(samples);
    if samples.is_empty() || level >= QUIET_RMS_FLOOR {
        return false;
    }
    for s in samples.iter_mut() {
        *s = (*s * QUIET_GAIN).clamp(-1.0, 1.0);
    }
    debug!(rms = level, boosted = rms(samples), "Boosted quiet audio");
    true
}

/// Average interleaved frames down to one channel.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Little-endian signed 16-bit PCM, the wire format streaming providers expect.
pub fn f32_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn pcm16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Stateful resampler for a stream of blocks.
///
/// Rebuilt whenever the source rate or block length changes; otherwise the
/// filter state carries across blocks so block edges stay clean.
pub struct StreamResampler {
    target_rate: u32,
    source_rate: u32,
    block_len: usize,
    inner: Option<FastFixedIn<f32>>,
}

impl StreamResampler {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            source_rate: 0,
            block_len: 0,
            inner: None,
        }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Resample one block to the target rate. Blocks already at the target rate
    /// are passed through untouched.
    pub fn process(&mut self, samples: &[f32], source_rate: u32) -> VoiceResult<Vec<f32>> {
        if source_rate == 0 {
            return Err(VoiceError::Resample("source sample rate is zero".to_string()));
        }
        if source_rate == self.target_rate || samples.is_empty() {
            return Ok(samples.to_vec());
        }

        if self.inner.is_none() || self.source_rate != source_rate || self.block_len != samples.len() {
            debug!(
                from = source_rate,
                to = self.target_rate,
                block = samples.len(),
                "Building resampler"
            );
            let ratio = self.target_rate as f64 / source_rate as f64;
            self.inner = Some(FastFixedIn::<f32>::new(
                ratio,
                1.0,
                PolynomialDegree::Cubic,
                samples.len(),
                1,
            )?);
            self.source_rate = source_rate;
            self.block_len = samples.len();
        }

        let resampler = match self.inner.as_mut() {
            Some(r) => r,
            None => return Ok(samples.to_vec()),
        };
        let out = resampler.process(&[samples], None)?;
        Ok(out.into_iter().next().unwrap_or_default())
    }

    pub fn reset(&mut self) {
        self.inner = None;
        self.source_rate = 0;
        self.block_len = 0;
    }
}

/// Device parameters for capture.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono). Frames are downmixed to mono.
    pub channels: u16,

    /// Block size in frames (default: 1024)
    pub buffer_size: usize,

    /// Device sample format
    pub format: SampleFormat,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            buffer_size: 1024,
            format: SampleFormat::Int16,
        }
    }
}

impl From<&PipelineConfig> for AudioConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            buffer_size: config.blocksize,
            format: config.dtype,
        }
    }
}

/// A continuous audio input. `start` begins pushing blocks onto `sender`;
/// device errors are returned from `start` itself.
pub trait AudioSource: Send + Sync {
    fn start(&self, sender: mpsc::UnboundedSender<AudioChunk>) -> VoiceResult<()>;

    /// Stop capturing and release the device. Idempotent.
    fn stop(&self);
}

struct CaptureWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// Microphone capture through the default CPAL input device.
pub struct CpalCapture {
    config: AudioConfig,
    worker: Mutex<Option<CaptureWorker>>,
}

impl CpalCapture {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            worker: Mutex::new(None),
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl AudioSource for CpalCapture {
    fn start(&self, sender: mpsc::UnboundedSender<AudioChunk>) -> VoiceResult<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Err(VoiceError::AudioStream("Audio capture already started".to_string()));
        }

        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let config = self.config.clone();

        let thread = thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || match open_input_stream(&config, sender) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Parked until stop() (or the agent is dropped).
                    let _ = stop_rx.recv();
                    drop(stream);
                    info!("⏹️ Audio capture stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *worker = Some(CaptureWorker { stop_tx, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::AudioDevice("Capture thread exited before opening the device".to_string()))
            }
        }
    }

    fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(());
            if worker.thread.join().is_err() {
                warn!("Capture thread panicked during shutdown");
            }
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input_stream(
    config: &AudioConfig,
    sender: mpsc::UnboundedSender<AudioChunk>,
) -> VoiceResult<Stream> {
    info!(
        "🎤 Initializing audio capture ({}Hz, {} channels, {} frames/block, {:?})",
        config.sample_rate, config.channels, config.buffer_size, config.format
    );

    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

    info!("📱 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(config.buffer_size as u32),
    };

    let stream = match config.format {
        SampleFormat::Int16 => build_stream::<i16, _>(&device, &stream_config, config, sender, pcm16_to_f32)?,
        SampleFormat::Float32 => build_stream::<f32, _>(&device, &stream_config, config, sender, |s| s)?,
    };

    stream.play()?;
    info!("✅ Audio capture started");
    Ok(stream)
}

fn build_stream<T, F>(
    device: &Device,
    stream_config: &StreamConfig,
    config: &AudioConfig,
    sender: mpsc::UnboundedSender<AudioChunk>,
    convert: F,
) -> VoiceResult<Stream>
where
    T: SizedSample,
    F: Fn(T) -> f32 + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let block = config.buffer_size.max(1);
    let sample_rate = config.sample_rate;
    let mut interleaved: Vec<f32> = Vec::with_capacity(block * channels);
    let mut receiver_gone = false;

    let stream = device.build_input_stream(
        stream_config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                interleaved.push(convert(sample));

                if interleaved.len() >= block * channels {
                    let chunk = AudioChunk::new(downmix(&interleaved, channels), sample_rate);
                    interleaved.clear();

                    if sender.send(chunk).is_err() && !receiver_gone {
                        receiver_gone = true;
                        warn!("Capture queue closed; dropping audio blocks");
                    }
                }
            }
        },
        move |err| {
            warn!("Audio stream error: {}", err);
        },
        None,
    )?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_config_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.buffer_size, 1024);
    }

    #[test]
    fn chunk_duration_and_concat() {
        let a = AudioChunk::new(vec![0.1; 8000], 16000);
        let b = AudioChunk::new(vec![0.2; 8000], 16000);
        assert_eq!(a.duration(), Duration::from_millis(500));

        let joined = AudioChunk::concat(&[a, b]).unwrap();
        assert_eq!(joined.len(), 16000);
        assert_eq!(joined.duration(), Duration::from_secs(1));
        assert!(AudioChunk::concat(&[]).is_none());
    }

    #[test]
    fn quiet_audio_is_boosted_and_clipped() {
        let mut mixed = vec![0.001f32, -0.001, 0.002, -0.05];
        assert!(!boost_if_quiet(&mut mixed));

        let mut whisper = vec![0.001f32, -0.001, 0.002, -0.002];
        assert!(boost_if_quiet(&mut whisper));
        assert!((whisper[0] - 0.05).abs() < 1e-6);
        assert!((whisper[2] - 0.1).abs() < 1e-6);

        let mut loud = vec![0.5f32; 16];
        assert!(!boost_if_quiet(&mut loud));
        assert_eq!(loud[0], 0.5);
    }

    #[test]
    fn boost_clips_to_valid_range() {
        let mut spiky = vec![0.0f32; 1000];
        spiky[0] = 0.05;
        assert!(boost_if_quiet(&mut spiky));
        assert_eq!(spiky[0], 1.0);
    }

    #[test]
    fn downmix_averages_frames() {
        let stereo = [1.0f32, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(downmix(&stereo, 2), vec![0.5, 0.5, 0.0]);
        assert_eq!(downmix(&stereo, 1), stereo.to_vec());
    }

    #[test]
    fn pcm16_encoding_clamps() {
        let bytes = f32_to_pcm16_bytes(&[0.0, 1.0, -2.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), 32767);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), -32767);
        assert_eq!(pcm16_to_f32(-32768), -1.0);
    }

    #[test]
    fn resampler_passes_through_matching_rate() {
        let mut r = StreamResampler::new(16000);
        let block = vec![0.25f32; 480];
        assert_eq!(r.process(&block, 16000).unwrap(), block);
        assert!(r.process(&block, 0).is_err());
    }

    #[test]
    fn resampler_changes_length_by_ratio() {
        let mut r = StreamResampler::new(16000);
        let block = vec![0.0f32; 960];
        let mut total = 0;
        for _ in 0..10 {
            total += r.process(&block, 48000).unwrap().len();
        }
        // 9600 input frames at 48 kHz come out near 3200 at 16 kHz (minus filter delay).
        assert!(total > 2800 && total <= 3300, "got {total}");
    }

    #[test]
    fn test_list_devices() {
        // This might fail in CI environments without audio devices
        let result = CpalCapture::list_input_devices();
        if let Ok(devices) = result {
            println!("Available input devices: {:?}", devices);
        }
    }
}
