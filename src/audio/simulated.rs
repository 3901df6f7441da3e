//! SimulatedProcessor (§4.2): batch ASR over an elastic window.
//!
//! Every frame lands in the shared `AudioBuffer`. Once enough frames have
//! accumulated the processor looks for a natural pause (via VAD) to flush a
//! batch to the STT provider; past a hard ceiling it flushes unconditionally
//! so a talker who never pauses still gets transcripts. Each flush runs as
//! an independent background task so a slow STT call never blocks new audio
//! from being buffered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{error, warn};

use super::buffer::AudioBuffer;
use super::processor::{AudioProcessor, ProcessorSink};
use super::transcode::AudioTranscoder;
use crate::asr::BatchAsrProvider;
use crate::error::Result;
use crate::model::TranscriptEvent;
use crate::vad::VoiceActivityDetector;

const CHECK_SILENCE_TIMEOUT: Duration = Duration::from_secs(3);
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_SPEECH_DURATION: f64 = 0.3;

const HALLUCINATION_BLACKLIST: &[&str] = &[
    "thank you.",
    "thank you",
    "thanks.",
    "thanks",
    "so.",
    "so",
    "you.",
    "you",
    "yeah.",
    "yeah",
    "okay.",
    "okay",
    "ok.",
    "ok",
    "bye.",
    "bye",
    "谢谢。",
    "谢谢",
    "好的。",
    "好的",
    "嗯。",
    "嗯",
];

const PUNCTUATION_ONLY: &str = ".?!,;:。？！，；：";

fn is_valid_text(text: &str) -> bool {
    if text.chars().count() <= 3 {
        return false;
    }
    if text.chars().all(|c| PUNCTUATION_ONLY.contains(c)) {
        return false;
    }
    !HALLUCINATION_BLACKLIST.contains(&text.to_lowercase().as_str())
}

pub struct SimulatedProcessor {
    buffer: AudioBuffer,
    stt: Arc<dyn BatchAsrProvider>,
    vad: Arc<dyn VoiceActivityDetector>,
    transcoder: Arc<dyn AudioTranscoder>,
    sink: Arc<dyn ProcessorSink>,
    source_lang: String,
    silence_threshold: f64,
    min_chunks: usize,
    max_chunks: usize,
    stt_last_index: usize,
    pending: JoinSet<()>,
    started_at: Option<Instant>,
    active: bool,
}

impl SimulatedProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buffer_duration: f64,
        silence_threshold: f64,
        source_lang: impl Into<String>,
        stt: Arc<dyn BatchAsrProvider>,
        vad: Arc<dyn VoiceActivityDetector>,
        transcoder: Arc<dyn AudioTranscoder>,
        sink: Arc<dyn ProcessorSink>,
    ) -> Self {
        let buffer_duration = buffer_duration.max(3.0);
        let min_chunks = 4usize.max((buffer_duration * 2.0).ceil() as usize);
        Self {
            buffer: AudioBuffer::new(),
            stt,
            vad,
            transcoder,
            sink,
            source_lang: source_lang.into(),
            silence_threshold,
            min_chunks,
            max_chunks: min_chunks * 2,
            stt_last_index: 0,
            pending: JoinSet::new(),
            started_at: None,
            active: false,
        }
    }

    fn vad_threshold(&self) -> f32 {
        (self.silence_threshold / 100.0).clamp(0.0, 1.0) as f32
    }

    /// Whether the last couple of chunks look like trailing silence, i.e.
    /// a natural place to flush. Errors and timeouts are treated as "keep
    /// buffering" rather than forcing a flush on a VAD hiccup.
    async fn check_silence(&self) -> bool {
        let offset = self.buffer.count().saturating_sub(2);
        let recent = match self.buffer.snapshot_from(offset) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            _ => return false,
        };

        let vad = self.vad.clone();
        let transcoder = self.transcoder.clone();
        match tokio::time::timeout(CHECK_SILENCE_TIMEOUT, async move {
            let wav = transcoder.transcode_to_wav(&recent).await?;
            vad.get_speech_probability(&wav, 16_000).await
        })
        .await
        {
            Ok(Ok(prob)) => prob < self.vad_threshold(),
            _ => false,
        }
    }

    fn send_for_transcription(&mut self) -> Result<()> {
        let new_chunks = self.buffer.snapshot_from(self.stt_last_index)?;
        self.stt_last_index = self.buffer.count();

        let elapsed = self.elapsed_time();
        let stt = self.stt.clone();
        let vad = self.vad.clone();
        let transcoder = self.transcoder.clone();
        let sink = self.sink.clone();
        let source_lang = self.source_lang.clone();
        let vad_threshold = self.vad_threshold();

        self.pending.spawn(async move {
            process_audio_batch(new_chunks, elapsed, stt, vad, transcoder, sink, source_lang, vad_threshold).await;
        });

        while let Some(result) = self.pending.try_join_next() {
            if let Err(e) = result {
                error!("simulated processor: batch task panicked: {e}");
            }
        }
        Ok(())
    }

    async fn drain_pending(&mut self, bound: Duration) {
        let deadline = tokio::time::Instant::now() + bound;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                if !self.pending.is_empty() {
                    warn!("simulated processor: timed out draining pending batches on stop");
                }
                break;
            }
            match tokio::time::timeout(remaining, self.pending.join_next()).await {
                Ok(Some(Err(e))) => error!("simulated processor: batch task panicked: {e}"),
                Ok(Some(Ok(()))) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!("simulated processor: timed out draining pending batches on stop");
                    break;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_audio_batch(
    audio_data: Vec<u8>,
    elapsed_time: f64,
    stt: Arc<dyn BatchAsrProvider>,
    vad: Arc<dyn VoiceActivityDetector>,
    transcoder: Arc<dyn AudioTranscoder>,
    sink: Arc<dyn ProcessorSink>,
    source_lang: String,
    vad_threshold: f32,
) {
    if audio_data.is_empty() {
        return;
    }

    let vad_for_extract = vad.clone();
    let extracted = tokio::time::timeout(EXTRACT_TIMEOUT, async move {
        let wav = transcoder.transcode_to_wav(&audio_data).await?;
        tokio::task::spawn_blocking(move || {
            vad_for_extract.extract_speech_audio(&wav, 16_000, vad_threshold, 250, 200)
        })
        .await
        .map_err(|e| crate::error::CoreError::Internal(format!("speech extraction task panicked: {e}")))?
    })
    .await;

    let (speech_audio, speech_duration) = match extracted {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!("simulated processor: speech extraction failed: {e}");
            return;
        }
        Err(_) => {
            sink.on_error("处理超时".into()).await;
            return;
        }
    };

    if speech_audio.is_empty() || speech_duration <= MIN_SPEECH_DURATION {
        return;
    }

    let transcript = match tokio::time::timeout(TRANSCRIBE_TIMEOUT, stt.transcribe(speech_audio, &source_lang)).await
    {
        Ok(Ok(t)) => t,
        Ok(Err(e)) => {
            warn!("simulated processor: transcription failed: {e}");
            return;
        }
        Err(_) => {
            sink.on_error("处理超时".into()).await;
            return;
        }
    };

    let text = transcript.text.trim().to_string();
    if text.is_empty() || !is_valid_text(&text) {
        return;
    }

    sink.on_transcript(TranscriptEvent::new(
        text,
        true,
        elapsed_time,
        elapsed_time + speech_duration,
    ))
    .await;
}

#[async_trait::async_trait]
impl AudioProcessor for SimulatedProcessor {
    async fn start(&mut self) -> Result<()> {
        self.stt_last_index = 0;
        self.pending = JoinSet::new();
        self.vad.reset_states();
        self.started_at = Some(Instant::now());
        self.active = true;
        Ok(())
    }

    async fn process_audio(&mut self, chunk: Vec<u8>) -> Result<()> {
        self.buffer.append(chunk);
        if !self.active {
            return Ok(());
        }

        let new_chunk_count = self.buffer.count() - self.stt_last_index;
        let should_send = if new_chunk_count < self.min_chunks {
            false
        } else if new_chunk_count < self.max_chunks {
            self.check_silence().await
        } else {
            true
        };

        if should_send {
            self.send_for_transcription()?;
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.active = false;

        let remaining = self.buffer.count() - self.stt_last_index;
        if remaining > 0 {
            self.send_for_transcription()?;
        }
        self.drain_pending(STOP_DRAIN_TIMEOUT).await;

        let header = self.buffer.header().map(|h| h.to_vec());
        Ok((header, self.buffer.full_payload()))
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn elapsed_time(&self) -> f64 {
        self.started_at.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::asr::BatchTranscript;

    /// Treats its input as already-canonical WAV, so tests can drive the
    /// buffering/flush logic with arbitrary byte chunks without a real
    /// `ffmpeg` on the test machine.
    struct NoopTranscoder;

    #[async_trait]
    impl AudioTranscoder for NoopTranscoder {
        async fn transcode_to_wav(&self, compressed: &[u8]) -> Result<Vec<u8>> {
            Ok(compressed.to_vec())
        }
    }

    struct MockStt {
        calls: Arc<AtomicUsize>,
        response: String,
    }

    #[async_trait]
    impl BatchAsrProvider for MockStt {
        async fn transcribe(&self, _wav_bytes: Vec<u8>, _source_lang: &str) -> Result<BatchTranscript> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BatchTranscript {
                text: self.response.clone(),
                language: None,
                confidence: 1.0,
            })
        }
    }

    struct MockVad {
        speech_prob: f32,
    }

    #[async_trait]
    impl VoiceActivityDetector for MockVad {
        async fn get_speech_probability(&self, _wav_bytes: &[u8], _sample_rate: u32) -> Result<f32> {
            Ok(self.speech_prob)
        }

        fn reset_states(&self) {}

        fn get_speech_timestamps(
            &self,
            wav_bytes: &[u8],
            _sample_rate: u32,
            _threshold: f32,
            _min_speech_ms: u32,
            _min_silence_ms: u32,
        ) -> Result<Vec<(usize, usize)>> {
            if wav_bytes.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![(0, wav_bytes.len())])
            }
        }

        fn extract_speech_audio(
            &self,
            wav_bytes: &[u8],
            _sample_rate: u32,
            _threshold: f32,
            _min_speech_ms: u32,
            _min_silence_ms: u32,
        ) -> Result<(Vec<u8>, f64)> {
            if wav_bytes.is_empty() {
                Ok((Vec::new(), 0.0))
            } else {
                Ok((wav_bytes.to_vec(), 1.0))
            }
        }
    }

    struct MockSink {
        events: Mutex<Vec<TranscriptEvent>>,
        errors: Mutex<Vec<String>>,
    }

    impl MockSink {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ProcessorSink for MockSink {
        async fn on_transcript(&self, event: TranscriptEvent) {
            self.events.lock().unwrap().push(event);
        }

        async fn on_error(&self, message: String) {
            self.errors.lock().unwrap().push(message);
        }
    }

    fn make_processor(speech_prob: f32, response: &str) -> (SimulatedProcessor, Arc<AtomicUsize>, Arc<MockSink>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(MockSink::new());
        let stt = Arc::new(MockStt {
            calls: calls.clone(),
            response: response.to_string(),
        });
        let vad = Arc::new(MockVad { speech_prob });
        let processor = SimulatedProcessor::new(3.0, 30.0, "en", stt, vad, Arc::new(NoopTranscoder), sink.clone());
        (processor, calls, sink)
    }

    #[tokio::test]
    async fn buffering_phase_never_sends_below_min_chunks() {
        let (mut processor, calls, _sink) = make_processor(0.9, "a transcript worth keeping");
        processor.start().await.unwrap();
        for _ in 0..processor.min_chunks - 1 {
            processor.process_audio(vec![1, 2, 3]).await.unwrap();
        }
        processor.drain_pending(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn quiet_window_flushes_once_min_chunks_reached() {
        let (mut processor, calls, sink) = make_processor(0.1, "a transcript worth keeping");
        processor.start().await.unwrap();
        for _ in 0..processor.min_chunks {
            processor.process_audio(vec![1, 2, 3]).await.unwrap();
        }
        processor.drain_pending(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn loud_window_forces_flush_at_hard_ceiling() {
        let (mut processor, calls, _sink) = make_processor(0.9, "a transcript worth keeping");
        processor.start().await.unwrap();
        for i in 0..processor.max_chunks {
            processor.process_audio(vec![1, 2, 3]).await.unwrap();
            if i + 1 < processor.max_chunks {
                processor.drain_pending(Duration::from_millis(50)).await;
                assert_eq!(calls.load(Ordering::SeqCst), 0, "should not flush before hard ceiling");
            }
        }
        processor.drain_pending(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_flushes_remaining_audio() {
        let (mut processor, calls, sink) = make_processor(0.9, "a transcript worth keeping");
        processor.start().await.unwrap();
        for _ in 0..3 {
            processor.process_audio(vec![1, 2, 3]).await.unwrap();
        }
        let (header, all) = processor.stop().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.events.lock().unwrap().len(), 1);
        assert_eq!(header, Some(vec![1, 2, 3]));
        assert_eq!(all, vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
    }

    #[tokio::test]
    async fn short_speech_below_floor_is_skipped() {
        struct FlatVad;
        #[async_trait]
        impl VoiceActivityDetector for FlatVad {
            async fn get_speech_probability(&self, _w: &[u8], _s: u32) -> Result<f32> {
                Ok(0.1)
            }
            fn reset_states(&self) {}
            fn get_speech_timestamps(&self, _w: &[u8], _s: u32, _t: f32, _a: u32, _b: u32) -> Result<Vec<(usize, usize)>> {
                Ok(vec![(0, 1)])
            }
            fn extract_speech_audio(
                &self,
                wav_bytes: &[u8],
                _sample_rate: u32,
                _threshold: f32,
                _min_speech_ms: u32,
                _min_silence_ms: u32,
            ) -> Result<(Vec<u8>, f64)> {
                Ok((wav_bytes.to_vec(), 0.1))
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(MockSink::new());
        let stt = Arc::new(MockStt {
            calls: calls.clone(),
            response: "a transcript worth keeping".into(),
        });
        let mut processor =
            SimulatedProcessor::new(3.0, 30.0, "en", stt, Arc::new(FlatVad), Arc::new(NoopTranscoder), sink.clone());
        processor.start().await.unwrap();
        for _ in 0..processor.min_chunks {
            processor.process_audio(vec![1, 2, 3]).await.unwrap();
        }
        processor.drain_pending(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0, "speech below 0.3s floor must not reach STT");
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn valid_text_rejects_short_fragments() {
        assert!(!is_valid_text("ok"));
        assert!(!is_valid_text("hi."));
    }

    #[test]
    fn valid_text_rejects_punctuation_only() {
        assert!(!is_valid_text("...?!"));
    }

    #[test]
    fn valid_text_rejects_hallucination_blacklist() {
        assert!(!is_valid_text("Thank you."));
        assert!(!is_valid_text("谢谢"));
        assert!(!is_valid_text("Yeah"));
    }

    #[test]
    fn valid_text_accepts_real_content() {
        assert!(is_valid_text("The meeting starts at noon."));
    }
}
