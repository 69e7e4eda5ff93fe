//! Integration tests against real audio devices and providers
//!
//! Note: Most of these tests require audio hardware or API keys and are ignored
//! by default. Run them with `cargo test -- --ignored` on a machine with a mic.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use voice_pipeline::{
    AudioChunk, AudioConfig, AudioSink, AudioSource, CpalCapture, PipelineCredentials,
    PipelineFactory, PipelineSettings, RodioOutput,
};

#[tokio::test]
#[ignore] // Ignore by default since it requires audio hardware
async fn test_capture_lifecycle() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let capture = CpalCapture::new(AudioConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();

    capture.start(tx).expect("Failed to open input device");
    assert!(capture.is_running());

    let block = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("No audio block within 2s")
        .expect("Capture channel closed");
    assert_eq!(block.sample_rate, 16_000);
    assert!(!block.is_empty());

    capture.stop();
    assert!(!capture.is_running());
}

#[tokio::test]
#[ignore] // Requires an output device
async fn test_playback_and_stop() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let output = RodioOutput::new().expect("Failed to open output device");

    // 200 ms of a 440 Hz tone plays to completion.
    let tone: Vec<f32> = (0..4_800)
        .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 24_000.0).sin() * 0.2)
        .collect();
    output
        .play(AudioChunk::new(tone.clone(), 24_000))
        .await
        .expect("Playback failed");
    assert!(!output.is_playing());

    // A long chunk returns promptly once stopped.
    let long = AudioChunk::new(tone.repeat(50), 24_000);
    let stopper = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        output.stop();
    };
    let (played, ()) = tokio::join!(
        timeout(Duration::from_secs(2), output.play(long)),
        stopper
    );
    assert!(played.is_ok(), "play did not return after stop");

    output.aclose().await;
    output.aclose().await;
    assert!(output.play(AudioChunk::new(vec![0.0; 16], 24_000)).await.is_err());
}

#[tokio::test]
#[ignore] // Requires API keys, audio hardware, and manual speech
async fn test_live_conversation_turn() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let _ = dotenvy::dotenv();

    println!("\n🎤 Live Turn Test");
    println!("=================");
    println!("Say something into your microphone within 15 seconds...\n");

    let credentials = PipelineCredentials::from_env()?;
    let settings = PipelineSettings::load()?;
    let agent = PipelineFactory::create_pipeline(&credentials, &settings)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    agent.events().on(
        voice_pipeline::AgentEventType::AgentSpeechCommitted,
        move |event: &voice_pipeline::AgentEvent| {
            if let Some(message) = event.message() {
                let _ = tx.send(message.content.clone());
            }
        },
    );

    agent.start().await?;
    let reply = timeout(Duration::from_secs(15), rx.recv()).await;
    agent.stop().await;

    match reply {
        Ok(Some(text)) => println!("\n✅ Agent replied: {}", text),
        _ => println!("\n⏱️ Timeout - no turn completed within 15 seconds"),
    }
    Ok(())
}

#[test]
fn test_settings_file_overrides_defaults() {
    let settings = tokio_test::assert_ok!(PipelineSettings::from_toml_str(
        r#"
        system_prompt = "Be brief."

        [pipeline]
        allow_interruptions = false
        min_endpointing_delay = 0.8

        [vad]
        backend = "deepgram"
        "#,
    ));

    assert!(!settings.pipeline.allow_interruptions);
    assert_eq!(settings.pipeline.min_endpointing_delay, 0.8);
    assert_eq!(settings.pipeline.max_endpointing_delay, 6.0);
    assert_eq!(settings.vad.backend, voice_pipeline::VadBackend::Deepgram);
    assert_eq!(settings.system_prompt.as_deref(), Some("Be brief."));
}
