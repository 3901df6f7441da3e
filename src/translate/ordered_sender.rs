//! OrderedSender (§4.7): delivers `TranslationResult`s for one segment in
//! strictly ascending `sentence_index` order, even though translations
//! complete out of order.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::model::TranslationResult;

/// The delivery sink. A trait object so the sender doesn't hold a
/// back-pointer to the owning Session (§9 "Cyclic references") — the
/// Session hands it a closure-like sink instead.
#[async_trait]
pub trait TranslationSink: Send + Sync {
    async fn send(&self, result: TranslationResult);
}

struct State {
    pending: BTreeMap<u32, TranslationResult>,
    next_to_send: u32,
}

pub struct OrderedSender<S: TranslationSink> {
    sink: S,
    state: Mutex<State>,
}

impl<S: TranslationSink> OrderedSender<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            state: Mutex::new(State {
                pending: BTreeMap::new(),
                next_to_send: 0,
            }),
        }
    }

    pub async fn on_translation_complete(&self, result: TranslationResult) {
        let mut state = self.state.lock().await;
        state.pending.insert(result.sentence_index, result);
        self.flush_ready(&mut state).await;
    }

    async fn flush_ready(&self, state: &mut State) {
        while let Some(result) = state.pending.remove(&state.next_to_send) {
            self.sink.send(result).await;
            state.next_to_send += 1;
        }
    }

    /// Force-send everything pending, in ascending index order, even if a
    /// gap remains. Used on stop and on segment close.
    pub async fn flush_all(&self) {
        let mut state = self.state.lock().await;
        let pending = std::mem::take(&mut state.pending);
        for (_, result) in pending {
            self.sink.send(result).await;
        }
    }

    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.pending.clear();
        state.next_to_send = 0;
    }

    pub async fn has_pending(&self) -> bool {
        !self.state.lock().await.pending.is_empty()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}
