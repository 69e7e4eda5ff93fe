//! Deepgram live-streaming connection shared by `DeepgramStt` and `DeepgramVad`.
//!
//! Each component owns its own `LiveConnection`; there is no process-wide
//! connection manager. Audio goes up as binary PCM16 frames, protocol messages
//! come back as JSON text frames and are parsed into [`LiveMessage`]s.

use crate::error::{VoiceError, VoiceResult};
use crate::stt::TranscriptionAlternative;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub const DEEPGRAM_LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";

/// Idle streams are closed by the server after ~10 s without data.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on the TCP, TLS and WebSocket handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Query options for `/v1/listen`.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveOptions {
    pub base_url: String,
    pub model: String,
    pub language: String,
    /// Sample rate of the PCM16 frames we send.
    pub sample_rate: u32,
    pub channels: u16,
    pub interim_results: bool,
    pub punctuate: bool,
    pub smart_format: bool,
    pub filler_words: bool,
    /// Emit `SpeechStarted` messages.
    pub vad_events: bool,
    /// Provider endpointing silence in ms; `None` disables it.
    pub endpointing_ms: Option<u32>,
    /// Emit `UtteranceEnd` after this many ms without words; requires interim results.
    pub utterance_end_ms: Option<u32>,
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self {
            base_url: DEEPGRAM_LISTEN_URL.to_string(),
            model: "nova-2".to_string(),
            language: "en".to_string(),
            sample_rate: 16000,
            channels: 1,
            interim_results: true,
            punctuate: true,
            smart_format: true,
            filler_words: true,
            vad_events: true,
            endpointing_ms: Some(25),
            utterance_end_ms: None,
        }
    }
}

impl LiveOptions {
    /// Options for a stream used only for speech boundaries.
    pub fn vad_only() -> Self {
        Self {
            punctuate: false,
            smart_format: false,
            filler_words: false,
            endpointing_ms: Some(300),
            utterance_end_ms: Some(1000),
            ..Default::default()
        }
    }

    pub fn url(&self) -> VoiceResult<reqwest::Url> {
        let mut params: Vec<(&str, String)> = vec![
            ("encoding", "linear16".to_string()),
            ("sample_rate", self.sample_rate.to_string()),
            ("channels", self.channels.to_string()),
            ("model", self.model.clone()),
            ("language", self.language.clone()),
            ("interim_results", self.interim_results.to_string()),
            ("punctuate", self.punctuate.to_string()),
            ("smart_format", self.smart_format.to_string()),
            ("filler_words", self.filler_words.to_string()),
            ("vad_events", self.vad_events.to_string()),
        ];
        match self.endpointing_ms {
            Some(ms) => params.push(("endpointing", ms.to_string())),
            None => params.push(("endpointing", "false".to_string())),
        }
        if let Some(ms) = self.utterance_end_ms {
            params.push(("utterance_end_ms", ms.to_string()));
        }

        reqwest::Url::parse_with_params(&self.base_url, &params)
            .map_err(|e| VoiceError::Config(format!("invalid Deepgram URL {}: {}", self.base_url, e)))
    }
}

/// A server message, reduced to what the pipeline consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveMessage {
    Results {
        alternatives: Vec<TranscriptionAlternative>,
        is_final: bool,
        /// Provider endpointing decided the utterance is over.
        speech_final: bool,
        start: f64,
        duration: f64,
    },
    SpeechStarted {
        timestamp: f64,
    },
    UtteranceEnd {
        last_word_end: f64,
    },
    Metadata {
        request_id: Option<String>,
    },
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireMessage {
    Results(WireResults),
    SpeechStarted {
        #[serde(default)]
        timestamp: f64,
    },
    UtteranceEnd {
        #[serde(default)]
        last_word_end: f64,
    },
    Metadata {
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireResults {
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    duration: f64,
    channel: WireChannel,
}

#[derive(Deserialize)]
struct WireChannel {
    #[serde(default)]
    alternatives: Vec<WireAlternative>,
}

#[derive(Deserialize)]
struct WireAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    languages: Vec<String>,
}

/// Parse one JSON text frame.
pub fn parse_message(raw: &str) -> VoiceResult<LiveMessage> {
    let wire: WireMessage = serde_json::from_str(raw)?;
    Ok(match wire {
        WireMessage::Results(results) => LiveMessage::Results {
            alternatives: results
                .channel
                .alternatives
                .into_iter()
                .map(|alt| TranscriptionAlternative {
                    text: alt.transcript,
                    confidence: alt.confidence,
                    language: alt.languages.into_iter().next(),
                })
                .collect(),
            is_final: results.is_final,
            speech_final: results.speech_final,
            start: results.start,
            duration: results.duration,
        },
        WireMessage::SpeechStarted { timestamp } => LiveMessage::SpeechStarted { timestamp },
        WireMessage::UtteranceEnd { last_word_end } => LiveMessage::UtteranceEnd { last_word_end },
        WireMessage::Metadata { request_id } => LiveMessage::Metadata { request_id },
        WireMessage::Other => LiveMessage::Other,
    })
}

fn control_frame(kind: &str) -> Message {
    Message::Text(format!(r#"{{"type":"{}"}}"#, kind).into())
}

/// One open `/v1/listen` socket with its reader and keepalive tasks.
pub struct LiveConnection {
    writer: Arc<Mutex<WsSink>>,
    alive: Arc<AtomicBool>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    keepalive: StdMutex<Option<JoinHandle<()>>>,
}

impl LiveConnection {
    /// Open the socket. Parsed messages arrive on the returned receiver, which
    /// closes when the server goes away.
    pub async fn connect(
        api_key: &str,
        options: &LiveOptions,
    ) -> VoiceResult<(Self, mpsc::UnboundedReceiver<LiveMessage>)> {
        let url = options.url()?;
        info!("🌐 Connecting to Deepgram live ({})", options.model);

        let mut request = url.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&format!("Token {}", api_key))
            .map_err(|e| VoiceError::Config(format!("invalid Deepgram API key header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| {
                VoiceError::Connection(format!("Deepgram handshake timed out after {:?}", CONNECT_TIMEOUT))
            })??;
        let (writer, reader) = ws_stream.split();
        let writer = Arc::new(Mutex::new(writer));
        let alive = Arc::new(AtomicBool::new(true));
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let reader_handle = tokio::spawn(Self::read_loop(reader, message_tx, Arc::clone(&alive)));
        let keepalive_handle = tokio::spawn(Self::keepalive_loop(Arc::clone(&writer), Arc::clone(&alive)));

        debug!("Deepgram live connection established");
        Ok((
            Self {
                writer,
                alive,
                reader: StdMutex::new(Some(reader_handle)),
                keepalive: StdMutex::new(Some(keepalive_handle)),
            },
            message_rx,
        ))
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send one PCM16 little-endian frame.
    pub async fn send_audio(&self, pcm: Vec<u8>) -> VoiceResult<()> {
        self.send(Message::Binary(pcm.into())).await
    }

    /// Ask the server to flush pending results without closing.
    pub async fn finalize(&self) -> VoiceResult<()> {
        self.send(control_frame("Finalize")).await
    }

    /// Finalize, request a graceful close, and stop the background tasks. Idempotent.
    pub async fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let mut writer = self.writer.lock().await;
            for kind in ["Finalize", "CloseStream"] {
                if let Err(e) = writer.send(control_frame(kind)).await {
                    debug!("Deepgram {} not delivered: {}", kind, e);
                    break;
                }
            }
            let _ = writer.close().await;
        }

        if let Some(handle) = take_handle(&self.keepalive) {
            handle.abort();
        }
        if let Some(mut handle) = take_handle(&self.reader) {
            if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }

    async fn send(&self, message: Message) -> VoiceResult<()> {
        if !self.is_alive() {
            return Err(VoiceError::Connection("Deepgram connection is closed".to_string()));
        }
        let result = self.writer.lock().await.send(message).await;
        if let Err(e) = result {
            self.alive.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_loop(
        mut reader: SplitStream<WsStream>,
        message_tx: mpsc::UnboundedSender<LiveMessage>,
        alive: Arc<AtomicBool>,
    ) {
        while let Some(frame) = reader.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(reason)) => {
                    debug!("Deepgram closed the stream: {:?}", reason);
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("Deepgram read error, dropping connection: {}", e);
                    break;
                }
            };

            match parse_message(text.as_str()) {
                Ok(message) => {
                    if message_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => debug!("Skipping malformed Deepgram message: {}", e),
            }
        }
        alive.store(false, Ordering::SeqCst);
    }

    async fn keepalive_loop(writer: Arc<Mutex<WsSink>>, alive: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !alive.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = writer.lock().await.send(control_frame("KeepAlive")).await {
                warn!("Deepgram keepalive failed: {}", e);
                alive.store(false, Ordering::SeqCst);
                break;
            }
        }
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        for slot in [&self.keepalive, &self.reader] {
            if let Some(handle) = take_handle(slot) {
                handle.abort();
            }
        }
    }
}

fn take_handle(slot: &StdMutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}
