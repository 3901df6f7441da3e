//! Abstract ASR provider capabilities consumed by the two `AudioProcessor`
//! strategies. Concrete provider adapters (Groq, Deepgram, ...) are out of
//! scope (§1); this module specifies the trait contract plus one reference
//! HTTP implementation of each so the contract is exercised.

pub mod batch;
pub mod streaming;

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct BatchTranscript {
    pub text: String,
    pub language: Option<String>,
    pub confidence: f32,
}

/// A batch (request/response) speech-to-text call, used by
/// `SimulatedProcessor`.
#[async_trait]
pub trait BatchAsrProvider: Send + Sync {
    async fn transcribe(&self, wav_bytes: Vec<u8>, source_lang: &str) -> Result<BatchTranscript>;
}

/// One message surfaced from an upstream streaming ASR connection,
/// independent of wire format (§4.3).
#[derive(Debug, Clone)]
pub enum StreamingAsrMessage {
    Result {
        text: String,
        is_final: bool,
        start: f64,
        duration: f64,
        confidence: f32,
        speaker: Option<String>,
    },
    SpeechStarted,
    UtteranceEnd,
    Metadata,
}

/// A live connection to an upstream streaming ASR, used by
/// `TrueStreamingProcessor`. `send_audio`/`recv` are the two suspension
/// points; `close` sends the provider's close sentinel.
#[async_trait]
pub trait StreamingAsrSession: Send {
    async fn send_audio(&mut self, chunk: &[u8]) -> Result<()>;
    async fn send_keepalive(&mut self) -> Result<()>;
    async fn recv(&mut self) -> Option<Result<StreamingAsrMessage>>;
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait StreamingAsrProvider: Send + Sync {
    async fn connect(&self, model: &str, source_lang: &str, diarization: bool)
        -> Result<Box<dyn StreamingAsrSession>>;
}
