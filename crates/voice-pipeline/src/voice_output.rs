//! **Playback**: synthesized audio out to the speakers, with an immediate
//! kill-switch for barge-in.
//!
//! `RodioOutput` keeps the `rodio::OutputStream` on a dedicated thread (it is
//! `!Send`) and drives a shared `rodio::Sink` from async code. `play` awaits
//! the end of the chunk by polling the sink, so the runtime never blocks.

use crate::audio::AudioChunk;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on waiting for a stopped sink to drain its dropped sources.
const STOP_SETTLE_TIMEOUT: Duration = Duration::from_millis(250);

/// Where the agent's speech goes.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Queue a chunk and resolve once it has finished playing or `stop` was called.
    async fn play(&self, chunk: AudioChunk) -> VoiceResult<()>;

    /// Silence output now and drop anything queued.
    fn stop(&self);

    fn is_playing(&self) -> bool;

    /// Release the device. Idempotent.
    async fn aclose(&self);
}

struct OutputWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// Default output device via rodio.
pub struct RodioOutput {
    sink: Arc<Sink>,
    /// Bumped by `stop` so pending `play` calls return.
    generation: AtomicU64,
    stopped: AtomicBool,
    closed: AtomicBool,
    worker: Mutex<Option<OutputWorker>>,
}

impl RodioOutput {
    /// Open the default output device.
    pub fn new() -> VoiceResult<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<Arc<Sink>>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(sink) => Arc::new(sink),
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };
                if ready_tx.send(Ok(Arc::clone(&sink))).is_err() {
                    return;
                }
                // Park until close; the stream must outlive every append.
                let _ = stop_rx.recv();
                sink.stop();
                drop(handle);
                drop(stream);
                debug!("Playback thread exiting");
            })?;

        let sink = ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("playback thread exited during setup".to_string()))??;
        info!("🔈 Output sink ready for TTS playback");

        Ok(Self {
            sink,
            generation: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            worker: Mutex::new(Some(OutputWorker { stop_tx, thread })),
        })
    }

    /// A stopped rodio sink resumes on the next append once its old sources
    /// are gone; wait for that here instead of letting `append` block.
    async fn settle_after_stop(&self) {
        if !self.stopped.swap(false, Ordering::SeqCst) {
            return;
        }
        let deadline = tokio::time::Instant::now() + STOP_SETTLE_TIMEOUT;
        while !self.sink.empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl AudioSink for RodioOutput {
    async fn play(&self, chunk: AudioChunk) -> VoiceResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::Playback("output is closed".to_string()));
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.settle_after_stop().await;

        let generation = self.generation.load(Ordering::SeqCst);
        self.sink
            .append(SamplesBuffer::new(1, chunk.sample_rate, chunk.samples));
        self.sink.play();

        while !self.sink.empty() {
            if self.generation.load(Ordering::SeqCst) != generation {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        self.sink.stop();
        debug!("Output stopped");
    }

    fn is_playing(&self) -> bool {
        !self.sink.empty()
    }

    async fn aclose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(());
            let _ = worker.thread.join();
        }
        info!("🔈 Output closed");
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(());
            let _ = worker.thread.join();
        }
    }
}
