use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use client_core::speech::{SpeechRequest, SpeechSynthesizer};
use tokio::process::Command;

/// Base speaking rate of `espeak-ng`, in words per minute.
const BASE_WORDS_PER_MINUTE: f32 = 175.0;

/// Speaks through the `espeak-ng` binary. Dropping an utterance kills the process.
pub struct EspeakSynthesizer {
    program: String,
}

impl EspeakSynthesizer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for EspeakSynthesizer {
    fn default() -> Self {
        Self::new("espeak-ng")
    }
}

#[async_trait]
impl SpeechSynthesizer for EspeakSynthesizer {
    async fn speak(&self, request: &SpeechRequest) -> Result<()> {
        let words_per_minute = (BASE_WORDS_PER_MINUTE * request.rate).round() as u32;
        let status = Command::new(&self.program)
            .arg("-v")
            .arg(request.lang.to_lowercase())
            .arg("-s")
            .arg(words_per_minute.to_string())
            .arg(&request.text)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to run {}", self.program))?;
        if !status.success() {
            bail!("{} exited with {status}", self.program);
        }
        Ok(())
    }

    // The session aborts the running utterance, which drops and kills the child.
    fn cancel(&self) {}
}
