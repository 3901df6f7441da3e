//! echo-relay-core
//!
//! Real-time streaming transcription and translation core (§1-§9).
//!
//! # Architecture
//!
//! One WebSocket connection per recording session. Audio frames flow in;
//! transcript and translation frames flow out. Two `AudioProcessor`
//! strategies cover the two shapes an upstream ASR vendor can take:
//!
//! - [`audio::true_streaming::TrueStreamingProcessor`]: zero-buffering
//!   passthrough to a provider that streams partial/final results itself.
//! - [`audio::simulated::SimulatedProcessor`]: batches audio over natural
//!   pauses (via VAD) and calls a batch (request/response) ASR endpoint.
//!
//! [`registry`] is the sole source of truth for which strategy a given
//! `(provider, model)` pair uses. [`session`] owns the per-connection wiring:
//! the processor, the sentence/segment pipeline ([`transcript`]), the
//! rate-limited translator ([`translate`]), and persistence ([`persistence`]).

pub mod asr;
pub mod audio;
pub mod config;
pub mod error;
pub mod id;
pub mod model;
pub mod persistence;
pub mod registry;
pub mod session;
pub mod transcript;
pub mod translate;
pub mod vad;
