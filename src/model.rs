//! Wire-and-storage data model (§3).

use serde::{Deserialize, Serialize};

use crate::id::{SegmentId, TranscriptId};

/// Immutable record of one ASR result, interim or final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    pub speaker: Option<String>,
    pub start: f64,
    pub end: f64,
    pub confidence: f32,
    pub transcript_id: Option<TranscriptId>,
    pub segment_id: Option<SegmentId>,
}

impl TranscriptEvent {
    pub fn new(text: impl Into<String>, is_final: bool, start: f64, end: f64) -> Self {
        Self {
            text: text.into(),
            is_final,
            speaker: None,
            start,
            end,
            confidence: 1.0,
            transcript_id: None,
            segment_id: None,
        }
    }

    pub fn with_speaker(mut self, speaker: impl Into<String>) -> Self {
        self.speaker = Some(speaker.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_transcript_id(mut self, id: TranscriptId) -> Self {
        self.transcript_id = Some(id);
        self
    }

    pub fn with_segment_id(mut self, id: SegmentId) -> Self {
        self.segment_id = Some(id);
        self
    }
}

/// A complete, sentence-terminated unit of text ready for translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub text: String,
    pub segment_id: SegmentId,
    pub sentence_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Open,
    Closed,
}

/// One UI "card": a bounded slice of the transcript.
#[derive(Debug, Clone)]
pub struct Segment {
    pub segment_id: SegmentId,
    pub text: String,
    pub start: f64,
    pub end: f64,
    pub word_count: usize,
    pub state: SegmentState,
}

/// A finalized transcript fragment as persisted into a Transcript's segment
/// list (§4.9, §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedSegmentDescriptor {
    pub text: String,
    pub start: f64,
    pub end: f64,
    pub is_final: bool,
    pub speaker: Option<String>,
}

/// Result of translating one `Sentence`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationResult {
    pub text: String,
    pub segment_id: SegmentId,
    pub sentence_index: u32,
    pub is_final: bool,
    pub error: bool,
}

/// Per-connection session state (§3 `Session`).
#[derive(Debug, Clone)]
pub struct SessionState {
    pub client_id: String,
    pub user_id: String,
    pub recording_id: Option<String>,
    pub source_lang: String,
    pub target_lang: String,
    pub is_recording: bool,
    pub audio_saved: bool,
    pub buffer_duration: f64,
    pub silence_threshold: f64,
    pub segment_soft_threshold: usize,
    pub segment_hard_threshold: usize,
    pub rpm_limit: u32,
}

impl SessionState {
    pub fn new(client_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            user_id: user_id.into(),
            recording_id: None,
            source_lang: "en".into(),
            target_lang: "zh".into(),
            is_recording: false,
            audio_saved: false,
            buffer_duration: 6.0,
            silence_threshold: 30.0,
            segment_soft_threshold: 30,
            segment_hard_threshold: 60,
            rpm_limit: 100,
        }
    }

    pub fn start_recording(&mut self, recording_id: Option<String>) {
        self.is_recording = true;
        self.audio_saved = false;
        self.recording_id = recording_id;
    }

    pub fn stop_recording(&mut self) {
        self.is_recording = false;
    }

    pub fn mark_audio_saved(&mut self) {
        self.audio_saved = true;
    }
}
