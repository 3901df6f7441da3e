//! Turns raw ASR finals into sentences ready for translation (§4.4) and
//! into UI-facing cards with a soft/hard split policy (§4.5).

pub mod segment_supervisor;
pub mod sentence_builder;
