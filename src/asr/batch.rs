//! Reference `BatchAsrProvider`: an OpenAI-compatible `/audio/transcriptions`
//! HTTP endpoint (the shape Groq, OpenAI, and SiliconFlow all share).
//!
//! Grounded on `meet-scribe`'s adapter style (reqwest client held per
//! session, constructed from effective configuration) generalized away
//! from any one vendor.

use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;

use super::{BatchAsrProvider, BatchTranscript};
use crate::error::{CoreError, Result};

pub struct HttpBatchAsrProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpBatchAsrProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
    language: Option<String>,
}

#[async_trait]
impl BatchAsrProvider for HttpBatchAsrProvider {
    async fn transcribe(&self, wav_bytes: Vec<u8>, source_lang: &str) -> Result<BatchTranscript> {
        let part = multipart::Part::bytes(wav_bytes)
            .file_name("speech.wav")
            .mime_str("audio/wav")
            .map_err(|e| CoreError::Stt(e.to_string()))?;

        let form = multipart::Form::new()
            .text("model", self.model.clone())
            .text("language", source_lang.to_string())
            .part("file", part);

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| CoreError::Stt(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::Stt(format!(
                "provider returned status {}",
                response.status()
            )));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Stt(e.to_string()))?;

        Ok(BatchTranscript {
            text: parsed.text,
            language: parsed.language,
            confidence: 0.9,
        })
    }
}
