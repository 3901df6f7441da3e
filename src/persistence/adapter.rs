//! PersistenceAdapter (§4.9): durable store for audio bytes, transcripts,
//! and translations tied to a Recording.

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::error::Result;
use crate::model::{ClosedSegmentDescriptor, TranslationResult};

/// Exactly one variant is populated per recording — the audio storage
/// abstraction is a sum type, not two optional fields, so callers can't
/// construct the invalid "both populated" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioRef {
    LargeObject(i64),
    Blob(uuid::Uuid),
}

#[async_trait]
pub trait AudioStorageBackend: Send + Sync {
    async fn save_audio(&self, bytes: Vec<u8>) -> Result<AudioRef>;
    async fn read_audio(&self, audio_ref: AudioRef, offset: u64, length: u64) -> Result<Vec<u8>>;
    async fn stream_audio_chunks(
        &self,
        audio_ref: AudioRef,
        chunk_size: usize,
    ) -> Result<std::pin::Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>>;
    async fn get_audio_size(&self, audio_ref: AudioRef) -> Result<u64>;
    async fn delete_audio(&self, audio_ref: AudioRef) -> Result<bool>;
}

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Locate-or-create the Transcript row; append text to `full_text`;
    /// append the segment descriptor to the segment list.
    async fn append_transcript(&self, recording_id: &str, language: &str, segment: ClosedSegmentDescriptor) -> Result<()>;

    /// Locate-or-create the Translation row; find the existing segment by
    /// `segment_id`, appending to it; adopt a trailing "phantom" segment
    /// (no `segment_id` yet) if the new segment has none to match; otherwise
    /// append a new segment. Executes in its own transaction — translations
    /// outlive the request that triggered them.
    async fn update_translation(&self, recording_id: &str, target_lang: &str, result: TranslationResult) -> Result<()>;

    async fn update_recording_audio(
        &self,
        recording_id: &str,
        audio_ref: AudioRef,
        audio_size: u64,
        audio_format: &str,
        duration_seconds: Option<f64>,
    ) -> Result<()>;
}
