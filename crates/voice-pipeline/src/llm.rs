//! Chat model abstraction: conversation history in, a stream of text deltas out.
//!
//! Streams are pull-based. Nothing is read from the network until the consumer
//! polls, and dropping the stream drops the HTTP response, which closes the
//! connection.

use crate::config::LlmSettings;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info};

/// Text deltas in arrival order.
pub type TextStream = BoxStream<'static, VoiceResult<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as the model produced them.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            function_call: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Conversation state handed to [`Llm::chat`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatContext {
    pub messages: Vec<Message>,
    /// Sent ahead of `messages` on every request; never stored in them.
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Messages as sent to the model: system prompt first, then history.
    pub fn request_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = self.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            out.push(Message::system(prompt));
        }
        out.extend(self.messages.iter().cloned());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LlmCapabilities {
    pub streaming: bool,
    pub function_calling: bool,
}

#[async_trait]
pub trait Llm: Send + Sync {
    fn capabilities(&self) -> LlmCapabilities;

    /// True while any stream returned by `chat` is still alive.
    fn is_processing(&self) -> bool;

    /// Start a completion. Errors here are request-level (connect, auth, HTTP
    /// status); errors mid-stream arrive as stream items.
    async fn chat(&self, ctx: &ChatContext) -> VoiceResult<TextStream>;

    async fn reset(&self) {}

    /// Idempotent.
    async fn aclose(&self);
}

/// Counts live streams; decremented when the stream is dropped.
pub(crate) struct ActiveStream(Arc<AtomicUsize>);

impl ActiveStream {
    pub(crate) fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// OpenAI-compatible request/response structures
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Debug, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into SSE `data:` payloads. Lines may span network
/// chunks, and so may multi-byte characters, so framing happens on bytes.
#[derive(Debug, Default)]
struct SseFramer {
    buffer: Vec<u8>,
}

impl SseFramer {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if data == "[DONE]" {
                    events.push(SseEvent::Done);
                } else if !data.is_empty() {
                    events.push(SseEvent::Data(data.to_string()));
                }
            }
        }
        events
    }
}

fn parse_delta(payload: &str) -> VoiceResult<Option<String>> {
    let chunk: StreamChunk = serde_json::from_str(payload)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty()))
}

/// OpenAI-compatible `/chat/completions` with `stream: true`.
pub struct OpenAiLlm {
    client: reqwest::Client,
    api_key: String,
    settings: LlmSettings,
    active: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl OpenAiLlm {
    pub fn new(api_key: impl Into<String>, settings: LlmSettings) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| VoiceError::Llm(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            settings,
            active: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Llm for OpenAiLlm {
    fn capabilities(&self) -> LlmCapabilities {
        LlmCapabilities {
            streaming: true,
            function_calling: false,
        }
    }

    fn is_processing(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    async fn chat(&self, ctx: &ChatContext) -> VoiceResult<TextStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::Llm("LLM client is closed".to_string()));
        }

        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages: ctx.request_messages(),
            temperature: ctx.temperature.or(Some(self.settings.temperature)),
            max_tokens: ctx.max_tokens.or(self.settings.max_tokens),
            stream: true,
        };
        info!(model = %request.model, messages = request.messages.len(), "🧠 Streaming chat completion");

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            error!(status = %status, "LLM HTTP {}: {}", status, body);
            return Err(VoiceError::Llm(format!("chat completion failed ({}): {}", status, body)));
        }

        let active = ActiveStream::enter(&self.active);
        let stream = async_stream::stream! {
            let _active = active;
            let mut body = response.bytes_stream();
            let mut framer = SseFramer::default();

            'read: while let Some(next) = body.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(VoiceError::from(e));
                        break 'read;
                    }
                };
                for event in framer.push(&bytes) {
                    match event {
                        SseEvent::Done => break 'read,
                        SseEvent::Data(payload) => match parse_delta(&payload) {
                            Ok(Some(delta)) => {
                                yield Ok(delta);
                            }
                            Ok(None) => {}
                            Err(e) => debug!("Skipping malformed SSE chunk: {} - data: {}", e, payload),
                        },
                    }
                }
            }
            debug!("LLM stream finished");
        };
        Ok(stream.boxed())
    }

    async fn aclose(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

enum Script {
    Reply(String),
    Fail(String),
}

/// Canned replies streamed word by word. Used by the demo binary and tests.
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Script>>,
    fallback: String,
    delay: Duration,
    active: Arc<AtomicUsize>,
    calls: AtomicUsize,
    contexts: Mutex<Vec<ChatContext>>,
    closed: AtomicBool,
}

impl ScriptedLlm {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(replies.into_iter().map(|r| Script::Reply(r.into())).collect()),
            fallback: "Sorry, I have nothing more to say.".to_string(),
            delay: Duration::from_millis(20),
            active: Arc::new(AtomicUsize::new(0)),
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Pause between deltas.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue a request-level failure after the replies queued so far.
    pub fn then_fail(self, reason: impl Into<String>) -> Self {
        self.script_lock().push_back(Script::Fail(reason.into()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every context `chat` was called with, oldest first.
    pub fn contexts(&self) -> Vec<ChatContext> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn script_lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Script>> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Llm for ScriptedLlm {
    fn capabilities(&self) -> LlmCapabilities {
        LlmCapabilities {
            streaming: true,
            function_calling: false,
        }
    }

    fn is_processing(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    async fn chat(&self, ctx: &ChatContext) -> VoiceResult<TextStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::Llm("LLM client is closed".to_string()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner).push(ctx.clone());

        let next = self.script_lock().pop_front();
        let reply = match next {
            Some(Script::Reply(text)) => text,
            Some(Script::Fail(reason)) => return Err(VoiceError::Llm(reason)),
            None => self.fallback.clone(),
        };

        let words: Vec<String> = reply.split_inclusive(' ').map(str::to_string).collect();
        let delay = self.delay;
        let active = ActiveStream::enter(&self.active);
        let stream = async_stream::stream! {
            let _active = active;
            for word in words {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok::<String, VoiceError>(word);
            }
        };
        Ok(stream.boxed())
    }

    async fn aclose(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[test]
    fn system_prompt_is_prepended_not_stored() {
        let mut ctx = ChatContext::new().with_system_prompt("Be brief.");
        ctx.append(Message::user("hello"));

        let sent = ctx.request_messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], Message::system("Be brief."));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn message_serializes_openai_shape() {
        let json = serde_json::to_value(Message::assistant("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "assistant", "content": "hi"}));
    }

    #[test]
    fn sse_framer_handles_split_lines_and_done() {
        let mut framer = SseFramer::default();
        let first = br#"data: {"choices":[{"delta":{"content":"Hel"#;
        assert!(framer.push(first).is_empty());

        let events = framer.push(b"lo\"}}]}\n\n: keep-alive\ndata: [DONE]\n");
        assert_eq!(
            events,
            vec![
                SseEvent::Data(r#"{"choices":[{"delta":{"content":"Hello"}}]}"#.to_string()),
                SseEvent::Done,
            ]
        );
    }

    #[test]
    fn sse_framer_keeps_multibyte_characters_intact() {
        let mut framer = SseFramer::default();
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"é\"}}]}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;
        assert!(framer.push(&line[..split]).is_empty());
        let events = framer.push(&line[split..]);
        match &events[..] {
            [SseEvent::Data(payload)] => assert_eq!(parse_delta(payload).unwrap().as_deref(), Some("é")),
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn parse_delta_skips_role_only_chunks() {
        assert_eq!(
            parse_delta(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            None
        );
        assert!(parse_delta("{oops").is_err());
    }

    #[tokio::test]
    async fn scripted_llm_streams_words_and_tracks_activity() {
        let llm = ScriptedLlm::new(["Hello there. How are you?"])
            .with_delay(Duration::ZERO)
            .then_fail("quota");
        let ctx = ChatContext::new();

        let stream = llm.chat(&ctx).await.unwrap();
        assert!(llm.is_processing());
        let deltas: Vec<String> = stream.try_collect().await.unwrap();
        assert_eq!(deltas.concat(), "Hello there. How are you?");
        assert!(deltas.len() > 1);
        assert!(!llm.is_processing());

        assert!(llm.chat(&ctx).await.is_err());
        assert_eq!(llm.calls(), 2);

        llm.aclose().await;
        llm.aclose().await;
        assert!(llm.chat(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn dropping_stream_releases_it() {
        let llm = ScriptedLlm::new(["one two three four"]).with_delay(Duration::ZERO);
        let mut stream = llm.chat(&ChatContext::new()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "one ");
        drop(stream);
        assert!(!llm.is_processing());
    }
}
