//! Session (§3, §4.8): per-connection state that wires the audio processor,
//! sentence/segment pipeline, and translation dispatcher together and fans
//! results out to the client and to persistence.
//!
//! A `Session` is the `ProcessorSink` its `AudioProcessor` reports to. Its
//! mutable pipeline state (`SentenceBuilder`, `SegmentSupervisor`, the
//! per-segment `OrderedSender`s) lives behind one `tokio::sync::Mutex` since
//! `ProcessorSink` methods take `&self` — grounded on `ws_audio.rs`'s
//! `VoiceSession`, which holds its mutable fields behind `Arc<Mutex<_>>` for
//! the same reason.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::error;

use super::protocol::ServerMessage;
use crate::audio::processor::ProcessorSink;
use crate::error::Result;
use crate::id::{SegmentId, TranscriptId};
use crate::model::{ClosedSegmentDescriptor, TranscriptEvent, TranslationResult};
use crate::persistence::adapter::PersistenceAdapter;
use crate::transcript::segment_supervisor::{SegmentEvent, SegmentSupervisor};
use crate::transcript::sentence_builder::SentenceBuilder;
use crate::translate::dispatcher::TranslationDispatcher;
use crate::translate::ordered_sender::{OrderedSender, TranslationSink};

/// Delivers one segment's translations, in order, to the client, persisting
/// each as it's sent. A trait object so `OrderedSender` never holds a
/// back-pointer to `Session` (§9 "Cyclic references").
struct ClientSink {
    outbound: mpsc::UnboundedSender<ServerMessage>,
    persistence: Arc<dyn PersistenceAdapter>,
    recording_id: String,
    target_lang: String,
}

#[async_trait]
impl TranslationSink for ClientSink {
    async fn send(&self, result: TranslationResult) {
        let frame = ServerMessage::TranslationV2 {
            text: result.text.clone(),
            segment_id: result.segment_id,
            sentence_index: result.sentence_index,
            is_final: result.is_final,
            error: result.error,
        };
        let _ = self.outbound.send(frame);

        if !result.error {
            if let Err(e) = self
                .persistence
                .update_translation(&self.recording_id, &self.target_lang, result)
                .await
            {
                error!("failed to persist translation: {e}");
            }
        }
    }
}

struct Pipeline {
    sentence_builder: SentenceBuilder,
    segment_supervisor: SegmentSupervisor,
    ordered_senders: HashMap<SegmentId, Arc<OrderedSender<ClientSink>>>,
}

pub struct Session {
    recording_id: String,
    source_lang: String,
    target_lang: String,
    is_true_streaming: bool,
    dispatcher: Arc<TranslationDispatcher>,
    persistence: Arc<dyn PersistenceAdapter>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    pipeline: Mutex<Pipeline>,
}

impl Session {
    pub fn new(
        recording_id: impl Into<String>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
        is_true_streaming: bool,
        dispatcher: Arc<TranslationDispatcher>,
        persistence: Arc<dyn PersistenceAdapter>,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        segment_soft_threshold: usize,
        segment_hard_threshold: usize,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            recording_id: recording_id.into(),
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
            is_true_streaming,
            dispatcher,
            persistence,
            outbound,
            pipeline: Mutex::new(Pipeline {
                sentence_builder: SentenceBuilder::new(),
                segment_supervisor: SegmentSupervisor::new(segment_soft_threshold, segment_hard_threshold)?,
                ordered_senders: HashMap::new(),
            }),
        }))
    }

    fn sender_for(&self, pipeline: &mut Pipeline, segment_id: SegmentId) -> Arc<OrderedSender<ClientSink>> {
        pipeline
            .ordered_senders
            .entry(segment_id)
            .or_insert_with(|| {
                Arc::new(OrderedSender::new(ClientSink {
                    outbound: self.outbound.clone(),
                    persistence: self.persistence.clone(),
                    recording_id: self.recording_id.clone(),
                    target_lang: self.target_lang.clone(),
                }))
            })
            .clone()
    }

    /// Stop sequence (§4.8, §5): flush the pending sentence, force-close the
    /// open card, flush every outstanding `OrderedSender`, then await
    /// in-flight translation tasks bounded by the drain timeout. Called
    /// before `AudioProcessor::stop` so translations for the last card still
    /// go out before the connection closes.
    pub async fn finalize(&self) {
        let mut pipeline = self.pipeline.lock().await;

        for sentence in pipeline.sentence_builder.flush() {
            let sender = self.sender_for(&mut pipeline, sentence.segment_id);
            self.dispatcher
                .translate_sentence(sentence, move |result| async move {
                    sender.on_translation_complete(result).await;
                })
                .await;
        }

        for event in pipeline.segment_supervisor.force_close() {
            if let SegmentEvent::Closed(closed) = event {
                let _ = self.outbound.send(ServerMessage::SegmentComplete {
                    segment_id: closed.segment_id,
                    text: closed.text,
                    start: closed.start,
                    end: closed.end,
                });
            }
        }

        for (_, sender) in pipeline.ordered_senders.drain() {
            sender.flush_all().await;
        }
        drop(pipeline);

        self.dispatcher.drain(Duration::from_secs(60)).await;
    }
}

#[async_trait]
impl ProcessorSink for Session {
    async fn on_transcript(&self, event: TranscriptEvent) {
        let mut pipeline = self.pipeline.lock().await;
        // Captured before this fragment can rotate the card, so the
        // transcript frame and its persisted descriptor are always tagged
        // with the card they actually belong to (§4.8).
        let segment_id_for_text = pipeline.segment_supervisor.current_segment_id();
        let transcript_id = TranscriptId::new();

        let _ = self.outbound.send(ServerMessage::Transcript {
            text: event.text.clone(),
            is_final: event.is_final,
            speaker: event.speaker.clone(),
            start_time: event.start,
            end_time: event.end,
            transcript_id: Some(transcript_id),
            segment_id: Some(segment_id_for_text),
        });

        if !event.is_final {
            return;
        }

        let descriptor = ClosedSegmentDescriptor {
            text: event.text.clone(),
            start: event.start,
            end: event.end,
            is_final: true,
            speaker: event.speaker.clone(),
        };
        if let Err(e) = self
            .persistence
            .append_transcript(&self.recording_id, &self.source_lang, descriptor)
            .await
        {
            error!("failed to persist transcript: {e}");
        }

        if self.is_true_streaming {
            let sentences = pipeline.sentence_builder.add_final(&event.text, segment_id_for_text);
            for sentence in sentences {
                let sender = self.sender_for(&mut pipeline, sentence.segment_id);
                self.dispatcher
                    .translate_sentence(sentence, move |result| async move {
                        sender.on_translation_complete(result).await;
                    })
                    .await;
            }

            for seg_event in pipeline.segment_supervisor.add_transcript(&event.text, event.start, event.end) {
                if let SegmentEvent::Closed(closed) = seg_event {
                    // The supervisor has already rotated to the new card by
                    // the time this event is observed, so its current id is
                    // exactly the `new_segment_id` the flushed tail resets to.
                    let new_segment_id = pipeline.segment_supervisor.current_segment_id();
                    for sentence in pipeline.sentence_builder.reset_for_new_segment(new_segment_id) {
                        let sender = self.sender_for(&mut pipeline, sentence.segment_id);
                        self.dispatcher
                            .translate_sentence(sentence, move |result| async move {
                                sender.on_translation_complete(result).await;
                            })
                            .await;
                    }

                    if let Some(sender) = pipeline.ordered_senders.remove(&closed.segment_id) {
                        sender.flush_all().await;
                    }
                    let _ = self.outbound.send(ServerMessage::SegmentComplete {
                        segment_id: closed.segment_id,
                        text: closed.text,
                        start: closed.start,
                        end: closed.end,
                    });
                }
            }
        } else {
            // Simulated path (§9 Open Question (a)): translate the whole
            // final blob as one unit, bypassing sentence splitting.
            let dispatcher = self.dispatcher.clone();
            let outbound = self.outbound.clone();
            let persistence = self.persistence.clone();
            let recording_id = self.recording_id.clone();
            let target_lang = self.target_lang.clone();
            dispatcher
                .translate_blob(event.text.clone(), segment_id_for_text, move |result| async move {
                    let _ = outbound.send(ServerMessage::Translation {
                        text: result.text.clone(),
                        is_final: result.is_final,
                        transcript_id: Some(transcript_id),
                    });
                    if !result.error {
                        if let Err(e) = persistence.update_translation(&recording_id, &target_lang, result).await {
                            error!("failed to persist translation: {e}");
                        }
                    }
                })
                .await;
        }
    }

    async fn on_error(&self, message: String) {
        let _ = self.outbound.send(ServerMessage::Error { message });
    }
}
