//! TrueStreamingProcessor (§4.3): zero-buffering passthrough to an upstream
//! streaming ASR connection.
//!
//! Audio is forwarded to the upstream session as it arrives; the upstream
//! pushes interim and final results back asynchronously. A single task owns
//! the session exclusively and `tokio::select!`s between outgoing audio and
//! incoming results, so `send_audio`/`recv` (both `&mut self` on the trait
//! object) never race each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::processor::{AudioProcessor, ProcessorSink};
use crate::asr::{StreamingAsrMessage, StreamingAsrProvider};
use crate::error::{CoreError, Result};
use crate::model::TranscriptEvent;

/// Below this RMS the frame is treated as absolute silence and may be
/// skipped; real VAD is the upstream provider's job, this only saves
/// bandwidth on a connection that never has anything to say.
const SILENCE_RMS_GATE: f64 = 100.0;
/// Every Nth silent frame is still forwarded so the upstream doesn't see a
/// dead socket and so client-side audio meters keep moving.
const SILENCE_KEEPALIVE_STRIDE: u32 = 10;
const ZOMBIE_TIMEOUT: Duration = Duration::from_secs(300);
const PAUSE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const PAUSE_TIMEOUT: Duration = Duration::from_secs(600);
const CLOSE_DRAIN_DELAY: Duration = Duration::from_millis(500);

enum Command {
    Audio(Vec<u8>),
    Keepalive,
    Close,
}

fn is_silence(chunk: &[u8]) -> bool {
    if chunk.len() < 2 {
        return true;
    }
    let samples: Vec<i16> = chunk
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    if samples.is_empty() {
        return true;
    }
    let mean_sq = samples.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / samples.len() as f64;
    mean_sq.sqrt() < SILENCE_RMS_GATE
}

pub struct TrueStreamingProcessor {
    provider: Arc<dyn StreamingAsrProvider>,
    sink: Arc<dyn ProcessorSink>,
    model: String,
    source_lang: String,
    diarization: bool,

    buffer: super::buffer::AudioBuffer,
    commands: Option<mpsc::UnboundedSender<Command>>,
    worker: Option<tokio::task::JoinHandle<()>>,
    paused: Arc<AtomicBool>,
    active: bool,
    started_at: Option<Instant>,
    silence_run: u32,
    last_speech_at: Option<Instant>,
}

impl TrueStreamingProcessor {
    pub fn new(
        provider: Arc<dyn StreamingAsrProvider>,
        sink: Arc<dyn ProcessorSink>,
        model: impl Into<String>,
        source_lang: impl Into<String>,
        diarization: bool,
    ) -> Self {
        Self {
            provider,
            sink,
            model: model.into(),
            source_lang: source_lang.into(),
            diarization,
            buffer: super::buffer::AudioBuffer::new(),
            commands: None,
            worker: None,
            paused: Arc::new(AtomicBool::new(false)),
            active: false,
            started_at: None,
            silence_run: 0,
            last_speech_at: None,
        }
    }
}

#[async_trait::async_trait]
impl AudioProcessor for TrueStreamingProcessor {
    async fn start(&mut self) -> Result<()> {
        let mut session = self
            .provider
            .connect(&self.model, &self.source_lang, self.diarization)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let sink = self.sink.clone();

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = rx.recv() => {
                        match cmd {
                            Some(Command::Audio(chunk)) => {
                                if let Err(e) = session.send_audio(&chunk).await {
                                    warn!("true streaming: send_audio failed: {e}");
                                }
                            }
                            Some(Command::Keepalive) => {
                                if let Err(e) = session.send_keepalive().await {
                                    warn!("true streaming: keepalive failed: {e}");
                                }
                            }
                            Some(Command::Close) | None => {
                                let _ = session.close().await;
                                tokio::time::sleep(CLOSE_DRAIN_DELAY).await;
                                break;
                            }
                        }
                    }
                    msg = session.recv() => {
                        match msg {
                            Some(Ok(StreamingAsrMessage::Result { text, is_final, start, duration, confidence, speaker })) => {
                                if text.trim().is_empty() {
                                    continue;
                                }
                                let mut event = TranscriptEvent::new(text, is_final, start, start + duration)
                                    .with_confidence(confidence);
                                if let Some(speaker) = speaker {
                                    event = event.with_speaker(speaker);
                                }
                                sink.on_transcript(event).await;
                            }
                            Some(Ok(StreamingAsrMessage::SpeechStarted | StreamingAsrMessage::UtteranceEnd | StreamingAsrMessage::Metadata)) => {}
                            Some(Err(e)) => {
                                error!("true streaming: upstream error: {e}");
                                sink.on_error(format!("上游连接错误: {e}")).await;
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        self.commands = Some(tx);
        self.worker = Some(worker);
        self.active = true;
        self.started_at = Some(Instant::now());
        self.silence_run = 0;
        self.last_speech_at = Some(Instant::now());
        Ok(())
    }

    async fn process_audio(&mut self, chunk: Vec<u8>) -> Result<()> {
        self.buffer.append(chunk.clone());
        if !self.active {
            return Ok(());
        }

        if is_silence(&chunk) {
            self.silence_run += 1;

            if self
                .last_speech_at
                .is_some_and(|t| t.elapsed() > ZOMBIE_TIMEOUT)
            {
                warn!("true streaming: zombie connection, no speech in {ZOMBIE_TIMEOUT:?}");
                self.sink.on_error("长时间无语音，连接已断开".into()).await;
                self.stop().await?;
                return Ok(());
            }

            if self.silence_run % SILENCE_KEEPALIVE_STRIDE != 0 {
                return Ok(());
            }
        } else {
            self.silence_run = 0;
            self.last_speech_at = Some(Instant::now());
        }

        if let Some(tx) = &self.commands {
            let _ = tx.send(Command::Audio(chunk));
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.active = false;
        self.paused.store(false, Ordering::SeqCst);

        if let Some(tx) = self.commands.take() {
            let _ = tx.send(Command::Close);
        }
        if let Some(worker) = self.worker.take() {
            if tokio::time::timeout(Duration::from_secs(5), worker).await.is_err() {
                warn!("true streaming: worker task did not shut down in time");
            }
        }

        let header = self.buffer.header().map(|h| h.to_vec());
        Ok((header, self.buffer.full_payload()))
    }

    async fn pause(&mut self) -> Result<()> {
        if self.paused.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let tx = self
            .commands
            .clone()
            .ok_or_else(|| CoreError::Internal("pause called before start".into()))?;
        let paused = self.paused.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            loop {
                if !paused.load(Ordering::SeqCst) {
                    break;
                }
                if started.elapsed() > PAUSE_TIMEOUT {
                    warn!("true streaming: pause timeout ({PAUSE_TIMEOUT:?}), letting connection lapse");
                    break;
                }
                if tx.send(Command::Keepalive).is_err() {
                    break;
                }
                tokio::time::sleep(PAUSE_KEEPALIVE_INTERVAL).await;
            }
        });

        info!("true streaming: paused, keepalive loop started");
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
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
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::asr::{StreamingAsrSession};

    struct MockSession {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        results: Mutex<Vec<StreamingAsrMessage>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl StreamingAsrSession for MockSession {
        async fn send_audio(&mut self, chunk: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(chunk.to_vec());
            Ok(())
        }
        async fn send_keepalive(&mut self) -> Result<()> {
            Ok(())
        }
        async fn recv(&mut self) -> Option<Result<StreamingAsrMessage>> {
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                None
            } else {
                Some(Ok(results.remove(0)))
            }
        }
        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockProvider {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl StreamingAsrProvider for MockProvider {
        async fn connect(
            &self,
            _model: &str,
            _source_lang: &str,
            _diarization: bool,
        ) -> Result<Box<dyn StreamingAsrSession>> {
            Ok(Box::new(MockSession {
                sent: self.sent.clone(),
                results: Mutex::new(vec![StreamingAsrMessage::Result {
                    text: "hello there".into(),
                    is_final: true,
                    start: 0.0,
                    duration: 1.0,
                    confidence: 0.9,
                    speaker: None,
                }]),
                closed: self.closed.clone(),
            }))
        }
    }

    struct MockSink {
        events: Mutex<Vec<TranscriptEvent>>,
    }

    #[async_trait]
    impl ProcessorSink for MockSink {
        async fn on_transcript(&self, event: TranscriptEvent) {
            self.events.lock().unwrap().push(event);
        }
        async fn on_error(&self, _message: String) {}
    }

    #[tokio::test]
    async fn loud_audio_is_forwarded_and_results_surface() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(MockProvider {
            sent: sent.clone(),
            closed: closed.clone(),
        });
        let sink = Arc::new(MockSink { events: Mutex::new(Vec::new()) });

        let mut processor = TrueStreamingProcessor::new(provider, sink.clone(), "nova-2", "en", false);
        processor.start().await.unwrap();

        let loud: Vec<u8> = (0i16..200).flat_map(|i| (i * 1000).to_le_bytes()).collect();
        processor.process_audio(loud).await.unwrap();

        for _ in 0..20 {
            if !sink.events.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(sink.events.lock().unwrap().len(), 1);

        processor.stop().await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn silence_is_gated_except_every_nth_frame() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(MockProvider { sent: sent.clone(), closed });
        let sink = Arc::new(MockSink { events: Mutex::new(Vec::new()) });

        let mut processor = TrueStreamingProcessor::new(provider, sink, "nova-2", "en", false);
        processor.start().await.unwrap();

        let silent = vec![0u8; 400];
        for _ in 0..SILENCE_KEEPALIVE_STRIDE - 1 {
            processor.process_audio(silent.clone()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sent.lock().unwrap().is_empty());

        processor.process_audio(silent).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn silence_detector_gates_on_rms() {
        assert!(is_silence(&vec![0u8; 400]));
        let loud: Vec<u8> = (0..200).flat_map(|_| 20_000i16.to_le_bytes()).collect();
        assert!(!is_silence(&loud));
    }
}
