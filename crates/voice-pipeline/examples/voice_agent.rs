//! Example: Voice Agent
//!
//! Talk to an LLM through your microphone and speakers. Interrupt it any time
//! by speaking over it.
//!
//! Needs `DEEPGRAM_API_KEY`, `CARTESIA_API_KEY`, and `OPENAI_API_KEY` (a `.env`
//! file works), plus `VOICE__TTS__VOICE_ID` or a `config/voice.toml` naming a
//! Cartesia voice.

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voice_pipeline::{
    AgentEvent, AgentEventType, PipelineCredentials, PipelineFactory, PipelineSettings,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🎤 Voice Agent");
    info!("==============");
    info!("Speak into your microphone. Press Ctrl+C to stop.");
    info!("");

    let settings = PipelineSettings::load()?;
    let credentials = PipelineCredentials::from_env()?;
    let agent = PipelineFactory::create_pipeline(&credentials, &settings)?;

    let events = agent.events();
    events.on(AgentEventType::UserSpeechCommitted, |event: &AgentEvent| {
        if let Some(message) = event.message() {
            info!("🧑 You: {}", message.content);
        }
    });
    events.on(AgentEventType::AgentSpeechCommitted, |event: &AgentEvent| {
        if let Some(message) = event.message() {
            info!("🤖 Agent: {}", message.content);
        }
    });
    events.on(AgentEventType::AgentSpeechInterrupted, |_: &AgentEvent| {
        warn!("⚡ Agent interrupted");
    });
    events.on(AgentEventType::StateChanged, |event: &AgentEvent| {
        if let Some(state) = event.state() {
            info!("🔁 {:?}", state);
        }
    });

    agent.start().await?;
    info!("✅ Listening... speak into your microphone!");

    tokio::signal::ctrl_c().await?;
    info!("");
    info!("🛑 Shutting down...");
    agent.stop().await;

    Ok(())
}
