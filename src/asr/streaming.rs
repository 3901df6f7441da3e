//! Reference `StreamingAsrProvider`: a generic streaming-ASR WebSocket
//! client in the shape of `meet-scribe`'s `deepgram_streaming.rs` —
//! connect, split, spawn a receiver task, forward parsed messages over an
//! mpsc channel — generalized away from any one vendor's wire format.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::{StreamingAsrMessage, StreamingAsrProvider, StreamingAsrSession};
use crate::error::{CoreError, Result};
use crate::registry::is_flux_model;

pub struct WsStreamingAsrProvider {
    base_url_v1: String,
    base_url_v2: String,
    api_key: String,
}

impl WsStreamingAsrProvider {
    pub fn new(base_url_v1: impl Into<String>, base_url_v2: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url_v1: base_url_v1.into(),
            base_url_v2: base_url_v2.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl StreamingAsrProvider for WsStreamingAsrProvider {
    async fn connect(
        &self,
        model: &str,
        source_lang: &str,
        diarization: bool,
    ) -> Result<Box<dyn StreamingAsrSession>> {
        let is_flux = is_flux_model(model);
        let base_url = if is_flux { &self.base_url_v2 } else { &self.base_url_v1 };

        let mut params = vec![
            ("model".to_string(), model.to_string()),
            ("language".to_string(), source_lang.to_string()),
            ("punctuate".to_string(), "true".to_string()),
            ("interim_results".to_string(), "true".to_string()),
            ("smart_format".to_string(), "true".to_string()),
        ];
        if diarization && !is_flux {
            params.push(("diarize".to_string(), "true".to_string()));
        }
        let query: String = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let url = format!("{base_url}?{query}");
        let mut request = url
            .into_client_request()
            .map_err(|e| CoreError::Stt(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {}", self.api_key))
                .map_err(|e| CoreError::Stt(e.to_string()))?,
        );

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| CoreError::Stt(format!("connect failed: {e}")))?;

        let (mut sink, mut stream) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let receiver_task = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let parsed = parse_message(&text);
                        if tx.send(parsed).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        // The sink half is moved into the session struct; a second channel
        // isn't needed since `send_audio`/`send_keepalive` write directly.
        let _ = &mut sink;

        Ok(Box::new(WsStreamingAsrSession {
            sink,
            rx,
            receiver_task: Some(receiver_task),
        }))
    }
}

fn parse_message(text: &str) -> Result<StreamingAsrMessage> {
    #[derive(Deserialize)]
    struct Word {
        speaker: Option<u32>,
    }
    #[derive(Deserialize)]
    struct Alternative {
        transcript: String,
        confidence: Option<f32>,
        #[serde(default)]
        words: Vec<Word>,
    }
    #[derive(Deserialize)]
    struct Channel {
        alternatives: Vec<Alternative>,
    }
    #[derive(Deserialize)]
    struct Envelope {
        #[serde(rename = "type")]
        kind: String,
        channel: Option<Channel>,
        is_final: Option<bool>,
        start: Option<f64>,
        duration: Option<f64>,
    }

    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| CoreError::Stt(format!("bad upstream json: {e}")))?;

    match envelope.kind.as_str() {
        "Results" => {
            let alt = envelope
                .channel
                .and_then(|c| c.alternatives.into_iter().next())
                .ok_or_else(|| CoreError::Stt("Results message had no alternatives".into()))?;
            let speaker = alt
                .words
                .first()
                .and_then(|w| w.speaker)
                .map(|s| format!("Speaker {s}"));
            Ok(StreamingAsrMessage::Result {
                text: alt.transcript,
                is_final: envelope.is_final.unwrap_or(false),
                start: envelope.start.unwrap_or(0.0),
                duration: envelope.duration.unwrap_or(0.0),
                confidence: alt.confidence.unwrap_or(1.0),
                speaker,
            })
        }
        "SpeechStarted" => Ok(StreamingAsrMessage::SpeechStarted),
        "UtteranceEnd" => Ok(StreamingAsrMessage::UtteranceEnd),
        _ => Ok(StreamingAsrMessage::Metadata),
    }
}

struct WsStreamingAsrSession {
    sink: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    rx: mpsc::UnboundedReceiver<Result<StreamingAsrMessage>>,
    receiver_task: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl StreamingAsrSession for WsStreamingAsrSession {
    async fn send_audio(&mut self, chunk: &[u8]) -> Result<()> {
        self.sink
            .send(Message::Binary(chunk.to_vec()))
            .await
            .map_err(CoreError::from)
    }

    async fn send_keepalive(&mut self) -> Result<()> {
        let payload = serde_json::json!({ "type": "KeepAlive" }).to_string();
        self.sink
            .send(Message::Text(payload))
            .await
            .map_err(CoreError::from)
    }

    async fn recv(&mut self) -> Option<Result<StreamingAsrMessage>> {
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        let payload = serde_json::json!({ "type": "CloseStream" }).to_string();
        let _ = self.sink.send(Message::Text(payload)).await;
        let _ = self.sink.close().await;
        if let Some(task) = self.receiver_task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for WsStreamingAsrSession {
    fn drop(&mut self) {
        if let Some(task) = self.receiver_task.take() {
            task.abort();
        }
    }
}
