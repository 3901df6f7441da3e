//! TranslationDispatcher (§4.6): fires one concurrent, rate-limited
//! translation task per sentence; ordering is the OrderedSender's job, not
//! this dispatcher's.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, warn};

use super::provider::TranslationProvider;
use super::token_bucket::TokenBucket;
use crate::model::{Sentence, TranslationResult};

const TRANSLATION_TIMEOUT: Duration = Duration::from_secs(15);

pub struct TranslationDispatcher {
    provider: Arc<dyn TranslationProvider>,
    bucket: Arc<TokenBucket>,
    source_lang: String,
    target_lang: String,
    last_context: tokio::sync::Mutex<Option<String>>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl TranslationDispatcher {
    pub fn new(
        provider: Arc<dyn TranslationProvider>,
        rpm_limit: u32,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            bucket: Arc::new(TokenBucket::with_default_capacity(rpm_limit)),
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
            last_context: tokio::sync::Mutex::new(None),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Spawn a background task that acquires a rate-limit token, calls the
    /// translation provider, and invokes `on_complete` with the result
    /// regardless of success, timeout, or callback error.
    pub async fn translate_sentence<F, Fut>(self: &Arc<Self>, sentence: Sentence, on_complete: F)
    where
        F: FnOnce(TranslationResult) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let this = Arc::clone(self);
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(async move {
            this.bucket.acquire().await;

            let last_context = this.last_context.lock().await.clone();
            let call = this.provider.translate(
                &this.source_lang,
                &this.target_lang,
                &sentence.text,
                last_context.as_deref(),
            );

            let result = match timeout(TRANSLATION_TIMEOUT, call).await {
                Ok(Ok(text)) => {
                    *this.last_context.lock().await = Some(sentence.text.clone());
                    TranslationResult {
                        text,
                        segment_id: sentence.segment_id,
                        sentence_index: sentence.sentence_index,
                        is_final: true,
                        error: false,
                    }
                }
                Ok(Err(e)) => {
                    warn!("translation failed: {e}");
                    TranslationResult {
                        text: "[translation failed]".into(),
                        segment_id: sentence.segment_id,
                        sentence_index: sentence.sentence_index,
                        is_final: true,
                        error: true,
                    }
                }
                Err(_) => TranslationResult {
                    text: "[translation timeout]".into(),
                    segment_id: sentence.segment_id,
                    sentence_index: sentence.sentence_index,
                    is_final: true,
                    error: true,
                },
            };

            on_complete(result).await;
        });
    }

    /// Translate an entire blob of text as a single unit, bypassing
    /// sentence-splitting — the simulated-path legacy translation mode
    /// (§4.8, §9 Open Question (a)).
    pub async fn translate_blob<F, Fut>(self: &Arc<Self>, text: String, segment_id: crate::id::SegmentId, on_complete: F)
    where
        F: FnOnce(TranslationResult) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let sentence = Sentence {
            text,
            segment_id,
            sentence_index: 0,
        };
        self.translate_sentence(sentence, on_complete).await;
    }

    /// Await all in-flight translation tasks, bounded by `bound`. Errors
    /// from joined tasks are logged, not propagated — a panicking
    /// translation task must not take down the session.
    pub async fn drain(&self, bound: Duration) {
        let mut tasks = self.tasks.lock().await;
        let drain_all = async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!("translation task panicked: {e}");
                }
            }
        };
        if timeout(bound, drain_all).await.is_err() {
            warn!("translation drain exceeded {bound:?}, abandoning remaining tasks");
        }
    }
}
