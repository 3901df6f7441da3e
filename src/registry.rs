//! Model-to-strategy registry (§6.3).
//!
//! A static table is the sole source of truth for whether a given
//! `(provider, model)` pair uses the true-streaming or simulated-streaming
//! `AudioProcessor`. The Session never branches on provider name directly.

use std::collections::HashMap;

use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingType {
    TrueStreaming,
    SimulatedStreaming,
}

static MODEL_STREAMING_TYPE: Lazy<HashMap<&'static str, StreamingType>> = Lazy::new(|| {
    use StreamingType::*;
    HashMap::from([
        ("nova-2", TrueStreaming),
        ("nova-2-general", TrueStreaming),
        ("nova-2-meeting", TrueStreaming),
        ("nova-2-phonecall", TrueStreaming),
        ("nova-2-finance", TrueStreaming),
        ("nova-2-conversationalai", TrueStreaming),
        ("nova-2-voicemail", TrueStreaming),
        ("nova-2-video", TrueStreaming),
        ("nova-2-medical", TrueStreaming),
        ("nova-2-drivethru", TrueStreaming),
        ("nova-2-automotive", TrueStreaming),
        ("nova-3", TrueStreaming),
        ("flux-1-nova", TrueStreaming),
        ("whisper-large", SimulatedStreaming),
        ("whisper-medium", SimulatedStreaming),
        ("whisper-small", SimulatedStreaming),
        ("whisper-base", SimulatedStreaming),
        ("whisper-tiny", SimulatedStreaming),
        ("whisper-large-v3-turbo", SimulatedStreaming),
        ("whisper-large-v3", SimulatedStreaming),
        ("distil-whisper-large-v3-en", SimulatedStreaming),
        ("whisper-1", SimulatedStreaming),
        ("sensevoice", SimulatedStreaming),
        ("sensevoice-small", SimulatedStreaming),
    ])
});

static PROVIDER_DEFAULT_STREAMING_TYPE: Lazy<HashMap<&'static str, StreamingType>> =
    Lazy::new(|| {
        use StreamingType::*;
        HashMap::from([
            ("deepgram", TrueStreaming),
            ("groq", SimulatedStreaming),
            ("openai", SimulatedStreaming),
            ("siliconflow", SimulatedStreaming),
        ])
    });

/// Whether a model requires an endpoint variant used by "Flux"-family
/// models (spec §4.3: one endpoint for general models, one for a specific
/// low-latency family).
pub fn is_flux_model(model: &str) -> bool {
    model.starts_with("flux")
}

pub fn get_streaming_type(provider: &str, model: &str) -> StreamingType {
    let model_lower = model.to_lowercase();
    if let Some(t) = MODEL_STREAMING_TYPE.get(model_lower.as_str()) {
        return *t;
    }
    let provider_lower = provider.to_lowercase();
    PROVIDER_DEFAULT_STREAMING_TYPE
        .get(provider_lower.as_str())
        .copied()
        .unwrap_or(StreamingType::SimulatedStreaming)
}

pub fn is_true_streaming(provider: &str, model: &str) -> bool {
    matches!(get_streaming_type(provider, model), StreamingType::TrueStreaming)
}
