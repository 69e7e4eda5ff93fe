//! Voice Pipeline Agent - the turn-taking state machine
//!
//! Ties capture, VAD, STT, LLM, TTS, and playback into one conversational loop:
//!
//! ```text
//! initializing → listening → thinking → speaking → listening → ...
//! ```
//!
//! One consumer task drains the capture queue, always feeding VAD and feeding
//! STT while listening (or while a barge-in window is open). Finalized user text
//! is endpointed into a turn; each turn runs on its own task with a
//! `CancellationToken` so barge-in can abort the LLM and TTS calls in flight.

use crate::audio::{boost_if_quiet, AudioChunk, AudioSource};
use crate::config::PipelineConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::events::{EventEmitter, HandlerId};
use crate::llm::{ChatContext, Llm, Message};
use crate::stt::{SpeechEvent, Stt, SttEventType};
use crate::tts::Tts;
use crate::turn::{remainder_after, BargeIn, SpanBuffer};
use crate::vad::{Vad, VadEvent, VadEventType};
use crate::voice_output::AudioSink;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// VAD confidence required before speech during playback counts as barge-in.
pub const INTERRUPT_PROBABILITY: f32 = 0.8;

/// Content of the system message carried by `AgentSpeechInterrupted`.
pub const INTERRUPTION_MESSAGE: &str = "Speech interrupted by user";

/// Synthesized spans buffered ahead of playback.
const PLAYBACK_QUEUE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Initializing,
    Listening,
    Thinking,
    Speaking,
}

/// Lifecycle events published to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentEventType {
    UserStartedSpeaking,
    UserStoppedSpeaking,
    /// The LLM request for a committed utterance went out.
    AgentThinking,
    /// The first span went to TTS; playback follows.
    AgentStartedSpeaking,
    AgentStoppedSpeaking,
    UserSpeechCommitted,
    AgentSpeechCommitted,
    AgentSpeechInterrupted,
    /// Every scored VAD window, forwarded.
    VadData,
    StateChanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Signal,
    Vad(VadEvent),
    Message(Message),
    State(AgentState),
}

impl AgentEvent {
    pub fn message(&self) -> Option<&Message> {
        match self {
            AgentEvent::Message(message) => Some(message),
            _ => None,
        }
    }

    pub fn state(&self) -> Option<AgentState> {
        match self {
            AgentEvent::State(state) => Some(*state),
            _ => None,
        }
    }
}

pub type AgentEmitter = EventEmitter<AgentEventType, AgentEvent>;

struct ActiveTurn {
    id: u64,
    cancel: CancellationToken,
}

/// Mutable turn-taking state. Guarded by one mutex; never held across `.await`.
#[derive(Default)]
struct TurnSlot {
    /// Final transcripts not yet committed as a user message.
    pending_text: String,
    latest_interim: String,
    /// Interim text a preemptive commit already used. The next final is
    /// matched against it so the same words are not committed twice.
    absorb_final: Option<String>,
    user_speaking: bool,
    /// Bumped whenever a scheduled endpoint becomes obsolete.
    endpoint_seq: u64,
    endpoint_deadline: Option<Instant>,
    next_turn_id: u64,
    active: Option<ActiveTurn>,
    barge_in: Option<BargeIn>,
}

impl TurnSlot {
    fn is_current(&self, id: u64) -> bool {
        self.active.as_ref().map(|a| a.id) == Some(id)
    }

    fn clear_endpoint(&mut self) {
        self.endpoint_seq += 1;
        self.endpoint_deadline = None;
    }
}

enum Registration {
    Vad(VadEventType, HandlerId),
    Stt(SttEventType, HandlerId),
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    consumer: Option<JoinHandle<()>>,
    registrations: Vec<Registration>,
}

/// Stops the output on every exit path of a response, including cancellation.
struct PlaybackGuard(Arc<dyn AudioSink>);

impl Drop for PlaybackGuard {
    fn drop(&mut self) {
        self.0.stop();
    }
}

struct AgentInner {
    config: PipelineConfig,
    vad: Arc<dyn Vad>,
    stt: Arc<dyn Stt>,
    llm: Arc<dyn Llm>,
    tts: Arc<dyn Tts>,
    output: Arc<dyn AudioSink>,
    source: Arc<dyn AudioSource>,
    events: Arc<AgentEmitter>,
    state: Mutex<AgentState>,
    chat: Mutex<ChatContext>,
    slot: Mutex<TurnSlot>,
    lifecycle: Mutex<Lifecycle>,
    stopped: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Real-time voice agent composed from the four pipeline components.
pub struct VoicePipelineAgent {
    inner: Arc<AgentInner>,
}

impl VoicePipelineAgent {
    pub fn new(
        vad: Arc<dyn Vad>,
        stt: Arc<dyn Stt>,
        llm: Arc<dyn Llm>,
        tts: Arc<dyn Tts>,
        output: Arc<dyn AudioSink>,
        source: Arc<dyn AudioSource>,
        config: PipelineConfig,
    ) -> VoiceResult<Self> {
        config.validate()?;
        info!("🎭 Initializing voice pipeline agent");
        Ok(Self {
            inner: Arc::new(AgentInner {
                config,
                vad,
                stt,
                llm,
                tts,
                output,
                source,
                events: Arc::new(EventEmitter::new()),
                state: Mutex::new(AgentState::Initializing),
                chat: Mutex::new(ChatContext::new()),
                slot: Mutex::new(TurnSlot::default()),
                lifecycle: Mutex::new(Lifecycle::default()),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn events(&self) -> &Arc<AgentEmitter> {
        &self.inner.events
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn state(&self) -> AgentState {
        *lock(&self.inner.state)
    }

    /// Snapshot of the conversation so far.
    pub fn chat_context(&self) -> ChatContext {
        lock(&self.inner.chat).clone()
    }

    pub fn set_chat_context(&self, ctx: ChatContext) {
        *lock(&self.inner.chat) = ctx;
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        lock(&self.inner.chat).system_prompt = Some(prompt.into());
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.lifecycle).started && !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Start capture and begin listening. Not reentrant: a second call fails.
    pub async fn start(&self) -> VoiceResult<()> {
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.started {
                return Err(VoiceError::Config("voice pipeline already started".to_string()));
            }
            lifecycle.started = true;
        }
        info!("🚀 Starting voice pipeline agent");

        let registrations = register_handlers(&self.inner);
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.inner.source.start(audio_tx) {
            error!("Audio capture failed to start: {}", e);
            unregister_handlers(&self.inner, registrations);
            lock(&self.inner.lifecycle).started = false;
            return Err(e);
        }

        let consumer = tokio::spawn(consume(Arc::downgrade(&self.inner), audio_rx));
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.consumer = Some(consumer);
            lifecycle.registrations = registrations;
        }

        self.inner.set_state(AgentState::Listening).await;
        info!("✅ Voice pipeline agent listening");
        Ok(())
    }

    /// Host-initiated barge-in. Returns whether a response was interrupted.
    pub async fn interrupt(&self) -> bool {
        self.inner.interrupt().await
    }

    /// Shut everything down. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("🛑 Stopping voice pipeline agent");

        let (consumer, registrations) = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            (lifecycle.consumer.take(), std::mem::take(&mut lifecycle.registrations))
        };
        if let Some(handle) = consumer {
            handle.abort();
        }
        self.inner.source.stop();

        let active = lock(&self.inner.slot).active.take();
        if let Some(active) = active {
            active.cancel.cancel();
        }
        self.inner.output.stop();
        unregister_handlers(&self.inner, registrations);

        self.inner.output.aclose().await;
        self.inner.vad.aclose().await;
        self.inner.stt.aclose().await;
        self.inner.llm.aclose().await;
        self.inner.tts.aclose().await;
        info!("✅ Voice pipeline agent stopped");
    }
}

impl Drop for VoicePipelineAgent {
    fn drop(&mut self) {
        if !self.inner.stopped.load(Ordering::SeqCst) {
            if let Some(handle) = lock(&self.inner.lifecycle).consumer.take() {
                handle.abort();
            }
            self.inner.source.stop();
        }
    }
}

fn register_handlers(inner: &Arc<AgentInner>) -> Vec<Registration> {
    let mut registrations = Vec::new();

    for kind in [VadEventType::SpeechStart, VadEventType::SpeechEnd, VadEventType::VadData] {
        let weak = Arc::downgrade(inner);
        let id = inner.vad.events().on_async(kind, move |event: VadEvent| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_vad_event(event).await;
                }
            }
        });
        registrations.push(Registration::Vad(kind, id));
    }

    for kind in [
        SttEventType::SpeechStarted,
        SttEventType::InterimTranscript,
        SttEventType::FinalTranscript,
        SttEventType::EndOfSpeech,
    ] {
        let weak = Arc::downgrade(inner);
        let id = inner.stt.events().on_async(kind, move |event: SpeechEvent| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_stt_event(event).await;
                }
            }
        });
        registrations.push(Registration::Stt(kind, id));
    }

    registrations
}

fn unregister_handlers(inner: &AgentInner, registrations: Vec<Registration>) {
    for registration in registrations {
        match registration {
            Registration::Vad(kind, id) => {
                inner.vad.events().off(kind, id);
            }
            Registration::Stt(kind, id) => {
                inner.stt.events().off(kind, id);
            }
        }
    }
}

/// Single consumer of the capture queue.
async fn consume(agent: Weak<AgentInner>, mut audio_rx: mpsc::UnboundedReceiver<AudioChunk>) {
    info!("🔄 Audio consumer started");
    while let Some(chunk) = audio_rx.recv().await {
        let Some(inner) = agent.upgrade() else { break };

        if let Err(e) = inner.vad.process_chunk(&chunk).await {
            warn!("VAD dropped a chunk: {}", e);
        }
        if inner.should_feed_stt() {
            if let Err(e) = inner.stt.process_chunk(&chunk).await {
                warn!("STT dropped a chunk: {}", e);
            }
        }
    }
    debug!("Audio consumer finished");
}

impl AgentInner {
    fn should_feed_stt(&self) -> bool {
        let state = *lock(&self.state);
        state == AgentState::Listening || lock(&self.slot).barge_in.is_some()
    }

    async fn emit(&self, kind: AgentEventType, event: AgentEvent) {
        self.events.emit(kind, event).await;
    }

    async fn set_state(&self, new: AgentState) -> AgentState {
        let old = std::mem::replace(&mut *lock(&self.state), new);
        if old != new {
            debug!("State {:?} → {:?}", old, new);
            self.emit(AgentEventType::StateChanged, AgentEvent::State(new)).await;
        }
        old
    }

    /// Change state only while `id` is still the active turn.
    async fn set_state_if_current(&self, id: u64, new: AgentState) -> bool {
        let old = {
            let slot = lock(&self.slot);
            if !slot.is_current(id) {
                return false;
            }
            std::mem::replace(&mut *lock(&self.state), new)
        };
        if old != new {
            debug!("State {:?} → {:?}", old, new);
            self.emit(AgentEventType::StateChanged, AgentEvent::State(new)).await;
        }
        true
    }

    async fn on_vad_event(self: &Arc<Self>, event: VadEvent) {
        match event.event_type {
            VadEventType::VadData => {
                self.emit(AgentEventType::VadData, AgentEvent::Vad(event)).await;
            }
            VadEventType::SpeechStart => {
                let barge_window = {
                    let mut slot = lock(&self.slot);
                    slot.user_speaking = true;
                    let speaking = *lock(&self.state) == AgentState::Speaking;
                    if speaking
                        && self.config.allow_interruptions
                        && event.speech_probability >= INTERRUPT_PROBABILITY
                        && slot.barge_in.is_none()
                        && slot.active.is_some()
                    {
                        let window = BargeIn::open(
                            self.config.interrupt_min_words,
                            self.config.interruption_debounce(),
                        );
                        let ready_at = window.ready_at();
                        slot.barge_in = Some(window);
                        Some(ready_at)
                    } else {
                        None
                    }
                };

                self.emit(AgentEventType::UserStartedSpeaking, AgentEvent::Signal).await;

                if let Some(ready_at) = barge_window {
                    debug!(probability = event.speech_probability, "⚡ Barge-in window opened");
                    let weak = Arc::downgrade(self);
                    tokio::spawn(async move {
                        tokio::time::sleep_until(ready_at).await;
                        if let Some(inner) = weak.upgrade() {
                            inner.check_barge_in().await;
                        }
                    });
                }
                // The user resumed; hold a pending endpoint until they pause again.
                self.schedule_endpoint();
            }
            VadEventType::SpeechEnd => {
                lock(&self.slot).user_speaking = false;
                self.emit(AgentEventType::UserStoppedSpeaking, AgentEvent::Signal).await;

                if self.config.preemptive_synthesis {
                    self.commit_pending(true);
                } else {
                    self.schedule_endpoint();
                }
            }
        }
    }

    async fn on_stt_event(self: &Arc<Self>, event: SpeechEvent) {
        let text = event.text().trim().to_string();
        match event.event_type {
            SttEventType::SpeechStarted => {
                debug!("STT detected speech");
            }
            SttEventType::InterimTranscript => {
                let check = {
                    let mut slot = lock(&self.slot);
                    slot.latest_interim = text;
                    let interim = slot.latest_interim.clone();
                    match slot.barge_in.as_mut() {
                        Some(window) => {
                            window.on_interim(&interim);
                            true
                        }
                        None => false,
                    }
                };
                if check {
                    self.check_barge_in().await;
                }
            }
            SttEventType::FinalTranscript => {
                let (text, check) = {
                    let mut slot = lock(&self.slot);
                    slot.latest_interim.clear();
                    let text = match slot.absorb_final.take() {
                        Some(committed) => match remainder_after(&committed, &text) {
                            Some(rest) => {
                                debug!("Final transcript already committed preemptively");
                                rest
                            }
                            None => text,
                        },
                        None => text,
                    };
                    if text.is_empty() {
                        return;
                    }
                    if !slot.pending_text.is_empty() {
                        slot.pending_text.push(' ');
                    }
                    slot.pending_text.push_str(&text);
                    let check = match slot.barge_in.as_mut() {
                        Some(window) => {
                            window.on_final(&text);
                            true
                        }
                        None => false,
                    };
                    (text, check)
                };
                info!("📝 User: {}", text);
                if check {
                    self.check_barge_in().await;
                }
                self.schedule_endpoint();
            }
            SttEventType::EndOfSpeech => {
                self.commit_pending(false);
            }
        }
    }

    async fn check_barge_in(self: &Arc<Self>) {
        let due = {
            let slot = lock(&self.slot);
            let speaking = *lock(&self.state) == AgentState::Speaking;
            speaking
                && slot
                    .barge_in
                    .as_ref()
                    .map_or(false, |window| window.should_interrupt(Instant::now()))
        };
        if due {
            self.interrupt().await;
        }
    }

    /// Cancel the active response and return to listening.
    async fn interrupt(&self) -> bool {
        if !self.config.allow_interruptions {
            return false;
        }
        let interrupted = {
            let mut slot = lock(&self.slot);
            match slot.active.take() {
                Some(active) => {
                    active.cancel.cancel();
                    slot.pending_text.clear();
                    slot.latest_interim.clear();
                    slot.absorb_final = None;
                    slot.barge_in = None;
                    slot.clear_endpoint();
                    true
                }
                None => false,
            }
        };
        if !interrupted {
            return false;
        }

        self.output.stop();
        info!("⚡ Interrupted by user, silencing output");
        self.emit(
            AgentEventType::AgentSpeechInterrupted,
            AgentEvent::Message(Message::system(INTERRUPTION_MESSAGE)),
        )
        .await;

        if self.set_state(AgentState::Listening).await == AgentState::Speaking {
            self.emit(AgentEventType::AgentStoppedSpeaking, AgentEvent::Signal).await;
        }
        true
    }

    /// Arm (or re-arm) the endpoint timer for pending text.
    fn schedule_endpoint(self: &Arc<Self>) {
        let (seq, at) = {
            let mut slot = lock(&self.slot);
            if slot.pending_text.trim().is_empty() || slot.active.is_some() {
                return;
            }
            let now = Instant::now();
            let max = self.config.max_endpointing();
            let deadline = *slot.endpoint_deadline.get_or_insert(now + max);
            let at = if slot.user_speaking {
                deadline
            } else {
                (now + self.config.min_endpointing()).min(deadline)
            };
            slot.endpoint_seq += 1;
            (slot.endpoint_seq, at)
        };

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if let Some(inner) = weak.upgrade() {
                let current = lock(&inner.slot).endpoint_seq == seq;
                if current {
                    inner.commit_pending(false);
                }
            }
        });
    }

    /// Turn pending text into a response turn, unless one is already running.
    fn commit_pending(self: &Arc<Self>, include_interim: bool) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let (id, text, cancel) = {
            let mut slot = lock(&self.slot);
            if slot.active.is_some() {
                return;
            }
            let mut text = std::mem::take(&mut slot.pending_text);
            if include_interim && !slot.latest_interim.is_empty() {
                let interim = std::mem::take(&mut slot.latest_interim);
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(&interim);
                slot.absorb_final = Some(interim);
            }
            let text = text.trim().to_string();
            if text.is_empty() {
                return;
            }
            slot.clear_endpoint();
            slot.next_turn_id += 1;
            let id = slot.next_turn_id;
            let cancel = CancellationToken::new();
            slot.active = Some(ActiveTurn {
                id,
                cancel: cancel.clone(),
            });
            (id, text, cancel)
        };
        tokio::spawn(Arc::clone(self).run_turn(id, text, cancel));
    }

    async fn run_turn(self: Arc<Self>, id: u64, text: String, cancel: CancellationToken) {
        if !self.set_state_if_current(id, AgentState::Thinking).await {
            return;
        }
        let user_message = Message::user(text);
        let ctx = {
            let mut chat = lock(&self.chat);
            chat.append(user_message.clone());
            chat.clone()
        };
        self.emit(AgentEventType::UserSpeechCommitted, AgentEvent::Message(user_message))
            .await;
        self.emit(AgentEventType::AgentThinking, AgentEvent::Signal).await;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.respond(id, &ctx) => Some(result),
        };
        self.finish_turn(id, outcome).await;
    }

    /// LLM → span buffer → TTS on one side, playback on the other, joined.
    async fn respond(self: &Arc<Self>, id: u64, ctx: &ChatContext) -> VoiceResult<String> {
        let _guard = PlaybackGuard(Arc::clone(&self.output));
        let (audio_tx, mut audio_rx) = mpsc::channel::<AudioChunk>(PLAYBACK_QUEUE);

        let generate = async move {
            let mut deltas = self.llm.chat(ctx).await?;
            let mut spans = SpanBuffer::new();
            let mut announced = false;

            while let Some(delta) = deltas.next().await {
                for span in spans.push(&delta?) {
                    self.speak_span(id, &span, &mut announced, &audio_tx).await?;
                }
            }
            if let Some(rest) = spans.finish() {
                self.speak_span(id, &rest, &mut announced, &audio_tx).await?;
            }
            Ok::<String, VoiceError>(spans.full_text().to_string())
        };

        let playback = async {
            while let Some(audio) = audio_rx.recv().await {
                self.output.play(audio).await?;
            }
            Ok::<(), VoiceError>(())
        };

        let (text, ()) = tokio::try_join!(generate, playback)?;
        Ok(text)
    }

    async fn speak_span(
        &self,
        id: u64,
        span: &str,
        announced: &mut bool,
        audio_tx: &mpsc::Sender<AudioChunk>,
    ) -> VoiceResult<()> {
        if !*announced {
            *announced = true;
            if self.set_state_if_current(id, AgentState::Speaking).await {
                self.emit(AgentEventType::AgentStartedSpeaking, AgentEvent::Signal).await;
            }
        }

        let mut stream = match self.tts.synthesize(span).await {
            Ok(stream) => stream,
            Err(e) if e.is_format() => {
                warn!("Skipping span after malformed TTS audio: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => chunks.push(chunk),
                Err(e) if e.is_format() => warn!("Dropping malformed TTS chunk: {}", e),
                Err(e) => return Err(e),
            }
        }

        let Some(mut audio) = AudioChunk::concat(&chunks) else {
            return Ok(());
        };
        if boost_if_quiet(&mut audio.samples) {
            debug!("Boosted quiet TTS audio for span");
        }
        audio_tx
            .send(audio)
            .await
            .map_err(|_| VoiceError::Channel("playback ended early".to_string()))
    }

    async fn finish_turn(self: &Arc<Self>, id: u64, outcome: Option<VoiceResult<String>>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let current = {
            let mut slot = lock(&self.slot);
            if slot.is_current(id) {
                slot.active = None;
                slot.barge_in = None;
                true
            } else {
                false
            }
        };
        if !current {
            debug!(turn = id, "Discarding result of interrupted turn");
            return;
        }

        match outcome {
            Some(Ok(text)) if !text.is_empty() => {
                info!("🗣️ Agent: {}", text);
                let message = Message::assistant(text);
                lock(&self.chat).append(message.clone());
                self.emit(AgentEventType::AgentSpeechCommitted, AgentEvent::Message(message))
                    .await;
            }
            Some(Ok(_)) => debug!("LLM returned an empty response"),
            Some(Err(e)) => error!("Turn failed, returning to listening: {}", e),
            None => debug!(turn = id, "Turn cancelled"),
        }

        if self.set_state(AgentState::Listening).await == AgentState::Speaking {
            self.emit(AgentEventType::AgentStoppedSpeaking, AgentEvent::Signal).await;
        }
        // Finals that arrived while responding start the next turn.
        self.schedule_endpoint();
    }
}
