//! Builds a production pipeline from settings and credentials.
//!
//! Every call constructs fresh component instances; nothing is shared between
//! pipelines.

use crate::audio::{AudioConfig, AudioSource, CpalCapture};
use crate::config::{PipelineCredentials, PipelineSettings, VadBackend};
use crate::deepgram::LiveOptions;
use crate::error::VoiceResult;
use crate::llm::{ChatContext, Llm, OpenAiLlm};
use crate::orchestrator::VoicePipelineAgent;
use crate::stt::{DeepgramStt, Stt};
use crate::tts::{CartesiaTts, Tts, TtsConfig};
use crate::vad::{DeepgramVad, Vad, WebRtcVad};
use crate::voice_output::{AudioSink, RodioOutput};
use std::sync::Arc;
use tracing::info;

/// Rate the local detector scores at; capture blocks are resampled to it.
const LOCAL_VAD_SAMPLE_RATE: u32 = 16_000;

pub struct PipelineFactory;

impl PipelineFactory {
    /// WebRTC or Deepgram VAD (per settings), Deepgram STT, OpenAI-compatible
    /// LLM, Cartesia TTS, default input and output devices.
    pub fn create_pipeline(
        credentials: &PipelineCredentials,
        settings: &PipelineSettings,
    ) -> VoiceResult<VoicePipelineAgent> {
        settings.pipeline.validate()?;

        let vad = Self::create_vad(credentials, settings)?;
        let stt: Arc<dyn Stt> = Arc::new(DeepgramStt::from_settings(
            credentials.deepgram_api_key.clone(),
            &settings.stt,
        ));
        let llm: Arc<dyn Llm> = Arc::new(OpenAiLlm::new(
            credentials.openai_api_key.clone(),
            settings.llm.clone(),
        )?);
        let tts: Arc<dyn Tts> = Arc::new(CartesiaTts::new(
            credentials.cartesia_api_key.clone(),
            TtsConfig::from(&settings.tts),
        )?);
        let output: Arc<dyn AudioSink> = Arc::new(RodioOutput::new()?);
        let source: Arc<dyn AudioSource> =
            Arc::new(CpalCapture::new(AudioConfig::from(&settings.pipeline)));

        let agent = VoicePipelineAgent::new(
            vad,
            stt,
            llm,
            tts,
            output,
            source,
            settings.pipeline.clone(),
        )?;
        if let Some(prompt) = &settings.system_prompt {
            agent.set_chat_context(ChatContext::new().with_system_prompt(prompt.clone()));
        }

        info!(
            vad = ?settings.vad.backend,
            llm = %settings.llm.model,
            tts = %settings.tts.model_id,
            "🏭 Voice pipeline assembled"
        );
        Ok(agent)
    }

    fn create_vad(
        credentials: &PipelineCredentials,
        settings: &PipelineSettings,
    ) -> VoiceResult<Arc<dyn Vad>> {
        Ok(match settings.vad.backend {
            VadBackend::WebRtc => Arc::new(WebRtcVad::from_settings(
                &settings.vad,
                LOCAL_VAD_SAMPLE_RATE,
            )?),
            VadBackend::Deepgram => Arc::new(DeepgramVad::new(
                credentials.deepgram_api_key.clone(),
                LiveOptions {
                    language: settings.stt.language.clone(),
                    ..LiveOptions::vad_only()
                },
            )),
        })
    }
}
