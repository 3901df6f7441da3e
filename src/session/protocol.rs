//! Client control channel wire protocol (§6.1).
//!
//! Grounded on `ws_audio.rs`'s `WsJsonMessage`/`call_server.rs`'s
//! `CallMessage`: a single `#[serde(tag = "...")]` enum per direction rather
//! than a hand-rolled dispatch on a raw `serde_json::Value`.

use serde::{Deserialize, Serialize};

use crate::id::{SegmentId, TranscriptId};

/// Text frames sent by the client. Binary frames carry raw audio and never
/// reach this type — they're routed straight to the active processor.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Start {
        #[serde(default)]
        recording_id: Option<String>,
        #[serde(default = "default_lang")]
        source_lang: String,
        #[serde(default = "default_target_lang")]
        target_lang: String,
        #[serde(default)]
        silence_threshold: Option<f64>,
        #[serde(default)]
        diarization: bool,
    },
    Stop,
    Ping,
    Pause,
    Resume,
}

fn default_lang() -> String {
    "en".into()
}

fn default_target_lang() -> String {
    "zh".into()
}

/// JSON frames sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        message: String,
    },
    Error {
        message: String,
    },
    Pong,
    Transcript {
        text: String,
        is_final: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        speaker: Option<String>,
        start_time: f64,
        end_time: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcript_id: Option<TranscriptId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        segment_id: Option<SegmentId>,
    },
    Translation {
        text: String,
        is_final: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcript_id: Option<TranscriptId>,
    },
    TranslationV2 {
        text: String,
        segment_id: SegmentId,
        sentence_index: u32,
        is_final: bool,
        error: bool,
    },
    SegmentComplete {
        segment_id: SegmentId,
        text: String,
        start: f64,
        end: f64,
    },
    AudioSaved {
        recording_id: String,
        audio_size: u64,
    },
}
