//! Speech capabilities: audio transcription over HTTP and an owned,
//! cancellable text-to-speech session.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{multipart, Client};
use shared::protocol::Transcription;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{config::ClientConfig, events::ClientEvent};

pub const DEFAULT_SPEECH_LANG: &str = "en-US";
pub const DEFAULT_SPEECH_VOICE: &str = "Eddy (English (US))";
pub const DEFAULT_SPEECH_RATE: f32 = 0.9;

/// Recorded audio handed to a [`Transcriber`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>, file_name: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            file_name: file_name.into(),
            mime_type: mime_type.into(),
        }
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, clip: AudioClip) -> Result<Transcription>;
}

pub struct MissingTranscriber;

#[async_trait]
impl Transcriber for MissingTranscriber {
    async fn transcribe(&self, _clip: AudioClip) -> Result<Transcription> {
        Err(anyhow!("audio transcription is unavailable"))
    }
}

/// Posts the clip as the multipart `audio` part of `POST /audio/transcription`.
pub struct HttpTranscriber {
    http: Client,
    config: ClientConfig,
}

impl HttpTranscriber {
    pub fn new(http: Client, config: ClientConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, clip: AudioClip) -> Result<Transcription> {
        let size = clip.bytes.len();
        let part = multipart::Part::bytes(clip.bytes)
            .file_name(clip.file_name)
            .mime_str(&clip.mime_type)
            .with_context(|| format!("invalid audio mime type '{}'", clip.mime_type))?;
        let form = multipart::Form::new().part("audio", part);

        let transcription: Transcription = self
            .http
            .post(self.config.endpoint("audio/transcription"))
            .multipart(form)
            .send()
            .await
            .context("failed to upload audio")?
            .error_for_status()
            .context("transcription request rejected")?
            .json()
            .await
            .context("failed to decode transcription")?;
        debug!(bytes = size, chars = transcription.text.len(), "audio transcribed");
        Ok(transcription)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    pub lang: String,
    /// Preferred voice; synthesizers fall back to the last voice for `lang`.
    pub voice_name: Option<String>,
    pub rate: f32,
}

impl SpeechRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            lang: DEFAULT_SPEECH_LANG.to_string(),
            voice_name: Some(DEFAULT_SPEECH_VOICE.to_string()),
            rate: DEFAULT_SPEECH_RATE,
        }
    }
}

/// Text-to-speech backend. `speak` resolves once the utterance ends.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn speak(&self, request: &SpeechRequest) -> Result<()>;
    fn cancel(&self);
}

#[derive(Default)]
struct SpeechState {
    generation: u64,
    utterance: Option<JoinHandle<()>>,
    speaking: bool,
}

/// At most one utterance at a time; speaking again cancels the previous one.
pub struct SpeechSession {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    state: Arc<Mutex<SpeechState>>,
    auto_reply: AtomicBool,
}

impl SpeechSession {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        Self {
            synthesizer,
            state: Arc::new(Mutex::new(SpeechState::default())),
            auto_reply: AtomicBool::new(false),
        }
    }

    pub fn auto_reply(&self) -> bool {
        self.auto_reply.load(Ordering::SeqCst)
    }

    pub fn set_auto_reply(&self, enabled: bool) {
        self.auto_reply.store(enabled, Ordering::SeqCst);
    }

    pub async fn is_speaking(&self) -> bool {
        self.state.lock().await.speaking
    }

    pub async fn speak(&self, request: SpeechRequest) {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.utterance.take() {
            self.synthesizer.cancel();
            previous.abort();
        }
        state.generation += 1;
        state.speaking = true;

        let generation = state.generation;
        let synthesizer = Arc::clone(&self.synthesizer);
        let shared_state = Arc::clone(&self.state);
        state.utterance = Some(tokio::spawn(async move {
            if let Err(err) = synthesizer.speak(&request).await {
                warn!(error = %err, "speech synthesis failed");
            }
            let mut state = shared_state.lock().await;
            if state.generation == generation {
                state.speaking = false;
                state.utterance = None;
            }
        }));
    }

    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.speaking {
            return;
        }
        self.synthesizer.cancel();
        if let Some(utterance) = state.utterance.take() {
            utterance.abort();
        }
        state.generation += 1;
        state.speaking = false;
    }

    /// Speaks every finalized assistant reply while auto reply is enabled.
    pub fn follow(self: &Arc<Self>, mut events: broadcast::Receiver<ClientEvent>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::MessageFinalized { node_id, text, .. }) => {
                        if !session.auto_reply() || text.trim().is_empty() {
                            continue;
                        }
                        debug!(node_id = %node_id, "speaking finalized reply");
                        session.speak(SpeechRequest::new(text)).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "speech follower lagged behind client events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("client events closed; speech follower exiting");
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/speech_tests.rs"]
mod tests;
