//! `AudioProcessor`: the polymorphic audio-ingress contract (§9 "Polymorphism").
//!
//! Modeled as a sum type over an interface trait rather than dynamic
//! inheritance, per the design notes: `SimulatedProcessor` and
//! `TrueStreamingProcessor` both implement this trait; the Session holds a
//! `Box<dyn AudioProcessor>` and never downcasts.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::TranscriptEvent;

/// Emitted whenever the processor produces or fails to produce a
/// transcript event. The Session supplies an implementation that fans out
/// to the client, persistence, and the sentence/segment pipeline.
#[async_trait]
pub trait ProcessorSink: Send + Sync {
    async fn on_transcript(&self, event: TranscriptEvent);
    async fn on_error(&self, message: String);
}

#[async_trait]
pub trait AudioProcessor: Send {
    async fn start(&mut self) -> Result<()>;

    /// Process one raw audio frame. The base buffering guarantee (every
    /// frame is retained for `stop()`/AudioSaver) is implemented by each
    /// concrete processor via its embedded `AudioBuffer`, not by this
    /// trait, so callers must route frames through a single processor
    /// instance rather than duplicating them.
    async fn process_audio(&mut self, chunk: Vec<u8>) -> Result<()>;

    /// Stop the processor and return `(header, all_bytes)` for AudioSaver.
    /// `header` is `None` if no frames were ever buffered.
    async fn stop(&mut self) -> Result<(Option<Vec<u8>>, Vec<u8>)>;

    async fn pause(&mut self) -> Result<()> {
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_active(&self) -> bool;

    fn elapsed_time(&self) -> f64;
}
