//! AudioSaver (§4.10): transcodes a processor's accumulated frames into a
//! durable, compressed artifact and persists it.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::warn;

use super::transcode::AudioTranscoder;
use crate::error::Result;
use crate::persistence::adapter::{AudioStorageBackend, PersistenceAdapter};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const CANONICAL_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub success: bool,
    pub size: usize,
    pub format: String,
    pub duration_seconds: f64,
    pub error: Option<String>,
}

pub struct AudioSaver {
    storage: Arc<dyn AudioStorageBackend>,
    persistence: Arc<dyn PersistenceAdapter>,
    transcoder: Arc<dyn AudioTranscoder>,
    timeout: Duration,
}

impl AudioSaver {
    pub fn new(
        storage: Arc<dyn AudioStorageBackend>,
        persistence: Arc<dyn PersistenceAdapter>,
        transcoder: Arc<dyn AudioTranscoder>,
    ) -> Self {
        Self {
            storage,
            persistence,
            transcoder,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `(header, all_bytes)` as returned by `AudioProcessor::stop`.
    pub async fn save(
        &self,
        header: Option<Vec<u8>>,
        all_bytes: Vec<u8>,
        recording_id: &str,
    ) -> Result<SaveOutcome> {
        if all_bytes.is_empty() {
            return Ok(SaveOutcome {
                success: false,
                size: 0,
                format: String::new(),
                duration_seconds: 0.0,
                error: Some("No audio data".into()),
            });
        }

        let raw = match &header {
            Some(h) if !all_bytes.starts_with(h) => {
                let mut joined = h.clone();
                joined.extend_from_slice(&all_bytes);
                joined
            }
            _ => all_bytes,
        };

        let (canonical_wav, final_audio, format) = self.convert(raw).await;

        let audio_ref = self.storage.save_audio(final_audio.clone()).await?;
        let duration = canonical_wav
            .as_ref()
            .and_then(|wav| wav_duration_seconds(wav).ok())
            .unwrap_or(0.0);

        self.persistence
            .update_recording_audio(
                recording_id,
                audio_ref,
                final_audio.len() as u64,
                &format,
                if duration > 0.0 { Some(duration) } else { None },
            )
            .await?;

        Ok(SaveOutcome {
            success: true,
            size: final_audio.len(),
            format,
            duration_seconds: duration,
            error: None,
        })
    }

    /// Transcode the compressed payload to WAV, canonicalize to 16kHz mono,
    /// then recompress to Opus at 48kbps. Falls back to storing the raw
    /// payload verbatim (format "raw") on any stage's failure or timeout.
    async fn convert(&self, raw: Vec<u8>) -> (Option<Vec<u8>>, Vec<u8>, String) {
        let timeout = self.timeout;
        let raw_for_fallback = raw.clone();

        let transcoded = match tokio::time::timeout(timeout, self.transcoder.transcode_to_wav(&raw)).await {
            Ok(Ok(wav)) => wav,
            Ok(Err(e)) => {
                warn!("audio transcode failed: {e}, saving raw payload");
                return (None, raw_for_fallback, "raw".into());
            }
            Err(_) => {
                warn!("audio transcode timed out, saving raw payload");
                return (None, raw_for_fallback, "raw".into());
            }
        };

        let decode = tokio::task::spawn_blocking(move || decode_to_canonical_wav(&transcoded));
        let wav_data = match tokio::time::timeout(timeout, decode).await {
            Ok(Ok(Ok(wav))) => wav,
            Ok(Ok(Err(e))) => {
                warn!("audio decode failed: {e}, saving raw payload");
                return (None, raw_for_fallback, "raw".into());
            }
            Ok(Err(e)) => {
                warn!("audio decode task panicked: {e}, saving raw payload");
                return (None, raw_for_fallback, "raw".into());
            }
            Err(_) => {
                warn!("audio decode timed out, saving raw payload");
                return (None, raw_for_fallback, "raw".into());
            }
        };

        let wav_for_encode = wav_data.clone();
        let encode = tokio::task::spawn_blocking(move || encode_opus(&wav_for_encode));
        match tokio::time::timeout(timeout, encode).await {
            Ok(Ok(Ok(opus))) => (Some(wav_data), opus, "opus".into()),
            Ok(Ok(Err(e))) => {
                warn!("opus encode failed: {e}, saving raw payload");
                (Some(wav_data), raw_for_fallback, "raw".into())
            }
            Ok(Err(e)) => {
                warn!("opus encode task panicked: {e}, saving raw payload");
                (Some(wav_data), raw_for_fallback, "raw".into())
            }
            Err(_) => {
                warn!("opus encode timed out, saving raw payload");
                (Some(wav_data), raw_for_fallback, "raw".into())
            }
        }
    }
}

fn decode_to_canonical_wav(raw: &[u8]) -> Result<Vec<u8>> {
    use crate::error::CoreError;

    let mut reader = WavReader::new(Cursor::new(raw))
        .map_err(|e| CoreError::AudioConversion(format!("not a wav container: {e}")))?;
    let spec = reader.spec();

    let samples: Vec<i16> = match spec.sample_format {
        SampleFormat::Int => reader
            .samples::<i32>()
            .map(|s| s.map(|v| (v >> (spec.bits_per_sample.saturating_sub(16))) as i16))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| CoreError::AudioConversion(e.to_string()))?,
        SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v * i16::MAX as f32) as i16))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| CoreError::AudioConversion(e.to_string()))?,
    };

    let mono: Vec<i16> = if spec.channels > 1 {
        samples
            .chunks(spec.channels as usize)
            .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / frame.len() as i32) as i16)
            .collect()
    } else {
        samples
    };

    let resampled = if spec.sample_rate != CANONICAL_SAMPLE_RATE {
        resample_to_canonical(&mono, spec.sample_rate)?
    } else {
        mono
    };

    let out_spec = WavSpec {
        channels: 1,
        sample_rate: CANONICAL_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, out_spec)
            .map_err(|e| CoreError::AudioConversion(e.to_string()))?;
        for sample in resampled {
            writer
                .write_sample(sample)
                .map_err(|e| CoreError::AudioConversion(e.to_string()))?;
        }
        writer.finalize().map_err(|e| CoreError::AudioConversion(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

fn resample_to_canonical(samples: &[i16], source_rate: u32) -> Result<Vec<i16>> {
    use crate::error::CoreError;
    use rubato::{FftFixedIn, Resampler};

    let input: Vec<f64> = samples.iter().map(|&s| s as f64 / i16::MAX as f64).collect();
    let mut resampler = FftFixedIn::<f64>::new(
        source_rate as usize,
        CANONICAL_SAMPLE_RATE as usize,
        input.len().max(1),
        1,
        1,
    )
    .map_err(|e| CoreError::AudioConversion(format!("resampler init: {e}")))?;

    let output = resampler
        .process(&[input], None)
        .map_err(|e| CoreError::AudioConversion(format!("resample: {e}")))?;

    Ok(output[0]
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f64) as i16)
        .collect())
}

fn encode_opus(wav_bytes: &[u8]) -> Result<Vec<u8>> {
    use crate::error::CoreError;
    use opus::{Application, Channels, Encoder};

    let mut reader = WavReader::new(Cursor::new(wav_bytes))
        .map_err(|e| CoreError::AudioConversion(format!("re-reading canonical wav: {e}")))?;
    let samples: Vec<i16> = reader
        .samples::<i16>()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| CoreError::AudioConversion(e.to_string()))?;

    let mut encoder = Encoder::new(CANONICAL_SAMPLE_RATE, Channels::Mono, Application::Voip)
        .map_err(|e| CoreError::AudioConversion(format!("opus encoder init: {e}")))?;

    // 20ms frames at 16kHz.
    const FRAME_SAMPLES: usize = 320;
    let mut out = Vec::new();
    for frame in samples.chunks(FRAME_SAMPLES) {
        let mut padded = frame.to_vec();
        padded.resize(FRAME_SAMPLES, 0);
        let mut buf = [0u8; 4000];
        let written = encoder
            .encode(&padded, &mut buf)
            .map_err(|e| CoreError::AudioConversion(format!("opus encode: {e}")))?;
        out.extend_from_slice(&(written as u32).to_le_bytes());
        out.extend_from_slice(&buf[..written]);
    }
    Ok(out)
}

fn wav_duration_seconds(wav_bytes: &[u8]) -> Result<f64> {
    use crate::error::CoreError;
    let reader = WavReader::new(Cursor::new(wav_bytes))
        .map_err(|e| CoreError::AudioConversion(e.to_string()))?;
    let spec = reader.spec();
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioStorageBackend as BackendChoice;
    use crate::persistence::sqlite::SqlitePersistence;

    /// Treats its input as already-canonical WAV — stands in for a real
    /// transcoder in tests that only care about the downstream pipeline.
    struct PassthroughTranscoder;

    #[async_trait::async_trait]
    impl AudioTranscoder for PassthroughTranscoder {
        async fn transcode_to_wav(&self, compressed: &[u8]) -> Result<Vec<u8>> {
            Ok(compressed.to_vec())
        }
    }

    struct FailingTranscoder;

    #[async_trait::async_trait]
    impl AudioTranscoder for FailingTranscoder {
        async fn transcode_to_wav(&self, _compressed: &[u8]) -> Result<Vec<u8>> {
            Err(crate::error::CoreError::AudioConversion("no decoder available".into()))
        }
    }

    fn open_test_db() -> Arc<SqlitePersistence> {
        let db = SqlitePersistence::open(std::path::Path::new(":memory:"), BackendChoice::LargeObject).unwrap();
        db.run_migrations().unwrap();
        db.create_recording("rec-1", "user-1", "en", "zh").unwrap();
        Arc::new(db)
    }

    #[tokio::test]
    async fn transcode_failure_falls_back_to_raw_payload() {
        let db = open_test_db();
        let saver = AudioSaver::new(
            db.clone() as Arc<dyn AudioStorageBackend>,
            db.clone() as Arc<dyn PersistenceAdapter>,
            Arc::new(FailingTranscoder),
        );

        let outcome = saver.save(None, vec![1, 2, 3, 4], "rec-1").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.format, "raw");
        assert_eq!(outcome.size, 4);
    }

    #[tokio::test]
    async fn successful_transcode_produces_opus() {
        let db = open_test_db();
        let saver = AudioSaver::new(
            db.clone() as Arc<dyn AudioStorageBackend>,
            db.clone() as Arc<dyn PersistenceAdapter>,
            Arc::new(PassthroughTranscoder),
        );

        let wav = make_wav(&[500; 16000], CANONICAL_SAMPLE_RATE);
        let outcome = saver.save(None, wav, "rec-1").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.format, "opus");
        assert!(outcome.duration_seconds > 0.0);
    }

    fn make_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn decode_is_noop_for_already_canonical_audio() {
        let wav = make_wav(&[100; 1600], CANONICAL_SAMPLE_RATE);
        let decoded = decode_to_canonical_wav(&wav).unwrap();
        let spec = WavReader::new(Cursor::new(&decoded)).unwrap().spec();
        assert_eq!(spec.sample_rate, CANONICAL_SAMPLE_RATE);
        assert_eq!(spec.channels, 1);
    }

    #[test]
    fn decode_resamples_non_canonical_rate() {
        let wav = make_wav(&[100; 4800], 48_000);
        let decoded = decode_to_canonical_wav(&wav).unwrap();
        let spec = WavReader::new(Cursor::new(&decoded)).unwrap().spec();
        assert_eq!(spec.sample_rate, CANONICAL_SAMPLE_RATE);
    }

    #[test]
    fn decode_rejects_non_wav_payload() {
        let garbage = vec![0u8, 1, 2, 3, 4, 5];
        assert!(decode_to_canonical_wav(&garbage).is_err());
    }

    #[test]
    fn opus_round_trip_produces_nonempty_output() {
        let wav = make_wav(&[500; 16000], CANONICAL_SAMPLE_RATE);
        let opus_bytes = encode_opus(&wav).unwrap();
        assert!(!opus_bytes.is_empty());
    }

    #[test]
    fn wav_duration_matches_sample_count() {
        let wav = make_wav(&[0; 32000], CANONICAL_SAMPLE_RATE);
        let duration = wav_duration_seconds(&wav).unwrap();
        assert!((duration - 2.0).abs() < 0.01);
    }
}
