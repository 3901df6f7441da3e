//! Audio ingress: buffering, the two processor strategies, and the
//! post-recording save pipeline (§4.1-§4.3, §4.10).

pub mod buffer;
pub mod processor;
pub mod saver;
pub mod simulated;
pub mod transcode;
pub mod true_streaming;
