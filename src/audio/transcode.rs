//! Compressed-container to canonical-WAV transcoding (§4.2, §4.10).
//!
//! The client streams compressed audio frames (e.g. WebM/Opus), but the VAD
//! and the WAV-based canonicalization in [`super::saver`] only understand a
//! RIFF/WAV container. `AudioTranscoder` is the missing leg between the two.
//! A trait, not a bare function, so tests can swap in a pass-through double
//! instead of shelling out to a real `ffmpeg` binary — the same seam this
//! module uses for `BatchAsrProvider`/`VoiceActivityDetector`.

use std::process::Stdio;

use async_trait::async_trait;
use tempfile::Builder;
use tokio::process::Command;

use crate::error::{CoreError, Result};

const CANONICAL_SAMPLE_RATE: &str = "16000";

#[async_trait]
pub trait AudioTranscoder: Send + Sync {
    /// Transcode an arbitrary compressed audio payload to 16kHz mono WAV.
    async fn transcode_to_wav(&self, compressed: &[u8]) -> Result<Vec<u8>>;
}

/// Shells out to `ffmpeg`, mirroring the subprocess-invocation pattern this
/// codebase already uses for external binaries (`git_bridge`, `phonemizer`).
pub struct FfmpegTranscoder;

#[async_trait]
impl AudioTranscoder for FfmpegTranscoder {
    async fn transcode_to_wav(&self, compressed: &[u8]) -> Result<Vec<u8>> {
        // ffmpeg needs to seek the container's header/cues, so the input is
        // written to a scratch file rather than piped; both scratch files
        // are removed once this returns.
        let input = Builder::new()
            .suffix(".webm")
            .tempfile()
            .map_err(|e| CoreError::AudioConversion(format!("scratch input file: {e}")))?;
        tokio::fs::write(input.path(), compressed)
            .await
            .map_err(|e| CoreError::AudioConversion(format!("writing scratch input: {e}")))?;

        let output = Builder::new()
            .suffix(".wav")
            .tempfile()
            .map_err(|e| CoreError::AudioConversion(format!("scratch output file: {e}")))?;

        let result = Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(input.path())
            .args(["-ar", CANONICAL_SAMPLE_RATE, "-ac", "1", "-f", "wav"])
            .arg(output.path())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CoreError::AudioConversion(format!("failed to run ffmpeg: {e}")))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(CoreError::AudioConversion(format!(
                "ffmpeg exited with {}: {stderr}",
                result.status
            )));
        }

        tokio::fs::read(output.path())
            .await
            .map_err(|e| CoreError::AudioConversion(format!("reading transcoded output: {e}")))
    }
}
