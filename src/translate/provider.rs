//! Abstract LLM translation capability + one reference HTTP implementation.
//!
//! Narrower than `meet-scribe`'s `LlmServicePort` (which also covers
//! insight/summary generation): this core only needs `translate`.

use async_trait::async_trait;

use crate::error::{CoreError, Result};

#[async_trait]
pub trait TranslationProvider: Send + Sync {
    async fn translate(
        &self,
        source_lang: &str,
        target_lang: &str,
        text: &str,
        last_context: Option<&str>,
    ) -> Result<String>;
}

/// Reference implementation: a chat-completions-shaped endpoint (the
/// OpenAI-compatible shape SiliconFlow/DeepSeek/most LLM providers share).
pub struct HttpTranslationProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpTranslationProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl TranslationProvider for HttpTranslationProvider {
    async fn translate(
        &self,
        source_lang: &str,
        target_lang: &str,
        text: &str,
        last_context: Option<&str>,
    ) -> Result<String> {
        let mut prompt = format!(
            "Translate the following {source_lang} text to {target_lang}. Respond with only the translation.\n\n{text}"
        );
        if let Some(ctx) = last_context {
            prompt = format!("Prior sentence for context: {ctx}\n\n{prompt}");
        }

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.3,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Llm(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::Llm(format!(
                "provider returned status {}",
                response.status()
            )));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::Llm(e.to_string()))?;

        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| CoreError::Llm("missing choices[0].message.content".into()))
    }
}
