//! WebSocket accept loop and per-connection control-message dispatch
//! (§4.8, §6.1).
//!
//! Grounded on `call_server.rs`'s `start_call_server`/`handle_connection`:
//! a `TcpListener::bind` + `accept()` loop, `tokio::spawn` per connection,
//! stripped of call-mixing — this core has one client per connection, not a
//! multi-participant mixer.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use super::connection::Session;
use super::protocol::{ClientMessage, ServerMessage};
use crate::asr::batch::HttpBatchAsrProvider;
use crate::asr::streaming::WsStreamingAsrProvider;
use crate::asr::{BatchAsrProvider, StreamingAsrProvider};
use crate::audio::processor::AudioProcessor;
use crate::audio::simulated::SimulatedProcessor;
use crate::audio::transcode::{AudioTranscoder, FfmpegTranscoder};
use crate::audio::true_streaming::TrueStreamingProcessor;
use crate::audio::saver::AudioSaver;
use crate::config::{Config, SessionConfig};
use crate::error::{CoreError, Result};
use crate::id::RecordingId;
use crate::persistence::adapter::{AudioStorageBackend, PersistenceAdapter};
use crate::persistence::sqlite::SqlitePersistence;
use crate::registry;
use crate::translate::dispatcher::TranslationDispatcher;
use crate::translate::provider::{HttpTranslationProvider, TranslationProvider};
use crate::vad::{EnergyVad, VoiceActivityDetector};

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

fn decode_bearer_token(secret: &str, token: &str) -> Result<Claims> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
        &jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256),
    )
    .map_err(|e| CoreError::Authentication(e.to_string()))?;
    Ok(data.claims)
}

pub struct AppState {
    pub config: Config,
    pub db: Arc<SqlitePersistence>,
}

pub async fn start_server(config: Config) -> Result<()> {
    let db = SqlitePersistence::open(std::path::Path::new(&config.database_path), config.audio_storage_backend)?;
    db.run_migrations()?;
    let bind_addr = config.bind_addr.clone();

    let state = Arc::new(AppState { config, db: Arc::new(db) });

    let listener = TcpListener::bind(&bind_addr).await?;
    info!("listening on {bind_addr}");

    loop {
        let (stream, addr) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, state).await {
                warn!("connection {addr} ended with error: {e}");
            }
        });
    }
}

async fn handle_connection(raw_stream: TcpStream, addr: SocketAddr, state: Arc<AppState>) -> Result<()> {
    let path = Arc::new(std::sync::Mutex::new(String::new()));
    let captured = path.clone();
    let callback = move |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
                          response: tokio_tungstenite::tungstenite::handshake::server::Response| {
        *captured.lock().unwrap() = req.uri().path().to_string();
        Ok(response)
    };

    let mut ws_stream = tokio_tungstenite::accept_hdr_async(raw_stream, callback).await?;

    let path = path.lock().unwrap().clone();
    let token = path.rsplit('/').next().unwrap_or("");
    let user_id = match decode_bearer_token(&state.config.jwt_secret, token) {
        Ok(claims) => claims.sub,
        Err(_) => {
            let _ = ws_stream
                .close(Some(CloseFrame {
                    code: CloseCode::Library(4001),
                    reason: "Invalid token".into(),
                }))
                .await;
            return Ok(());
        }
    };
    info!("client {addr} authenticated as {user_id}");

    let (mut ws_sink, mut ws_source) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let forwarder = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("failed to serialize server message: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut processor: Option<Box<dyn AudioProcessor>> = None;
    let mut session: Option<Arc<Session>> = None;
    let mut recording_id: Option<String> = None;

    while let Some(msg) = ws_source.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("client {addr}: websocket error: {e}");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let parsed: std::result::Result<ClientMessage, _> = serde_json::from_str(&text);
                let client_msg = match parsed {
                    Ok(m) => m,
                    Err(e) => {
                        let _ = outbound_tx.send(ServerMessage::Error { message: format!("malformed message: {e}") });
                        continue;
                    }
                };

                match client_msg {
                    ClientMessage::Start { recording_id: requested_id, source_lang, target_lang, silence_threshold, diarization } => {
                        if processor.is_some() {
                            let _ = outbound_tx.send(ServerMessage::Error { message: "recording already in progress".into() });
                            continue;
                        }
                        let stt_provider = state.config.default_stt_provider.clone();
                        match start_recording(
                            &state,
                            &user_id,
                            requested_id,
                            source_lang,
                            target_lang,
                            silence_threshold,
                            diarization,
                            outbound_tx.clone(),
                        )
                        .await
                        {
                            Ok((new_session, new_processor, new_recording_id)) => {
                                session = Some(new_session);
                                processor = Some(new_processor);
                                recording_id = Some(new_recording_id);
                                let _ = outbound_tx.send(ServerMessage::Status {
                                    message: format!("Recording started ({stt_provider})"),
                                });
                            }
                            Err(e) => {
                                error!("client {addr}: failed to start recording: {e}");
                                let _ = outbound_tx.send(ServerMessage::Error { message: e.to_string() });
                            }
                        }
                    }
                    ClientMessage::Stop => {
                        finish_recording(&mut session, &mut processor, &recording_id, &state, &outbound_tx).await;
                        recording_id = None;
                    }
                    ClientMessage::Ping => {
                        let _ = outbound_tx.send(ServerMessage::Pong);
                    }
                    ClientMessage::Pause => {
                        if let Some(p) = processor.as_mut() {
                            if let Err(e) = p.pause().await {
                                warn!("client {addr}: pause failed: {e}");
                            }
                        }
                    }
                    ClientMessage::Resume => {
                        if let Some(p) = processor.as_mut() {
                            if let Err(e) = p.resume().await {
                                warn!("client {addr}: resume failed: {e}");
                            }
                        }
                    }
                }
            }
            Message::Binary(chunk) => {
                if let Some(p) = processor.as_mut() {
                    if let Err(e) = p.process_audio(chunk).await {
                        warn!("client {addr}: process_audio failed: {e}");
                        let _ = outbound_tx.send(ServerMessage::Error { message: e.to_string() });
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    finish_recording(&mut session, &mut processor, &recording_id, &state, &outbound_tx).await;
    drop(outbound_tx);
    let _ = forwarder.await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn start_recording(
    state: &Arc<AppState>,
    user_id: &str,
    requested_id: Option<String>,
    source_lang: String,
    target_lang: String,
    silence_threshold: Option<f64>,
    diarization: bool,
    outbound: mpsc::UnboundedSender<ServerMessage>,
) -> Result<(Arc<Session>, Box<dyn AudioProcessor>, String)> {
    let defaults = SessionConfig::defaults(&state.config);
    let silence_threshold = silence_threshold.unwrap_or(defaults.silence_threshold);
    let recording_id = requested_id.unwrap_or_else(|| RecordingId::new().to_string());

    state.db.create_recording(&recording_id, user_id, &source_lang, &target_lang)?;

    let is_true_streaming = registry::is_true_streaming(&defaults.stt_provider, &defaults.stt_model);

    let translation_provider: Arc<dyn TranslationProvider> = Arc::new(HttpTranslationProvider::new(
        defaults.llm_base_url.clone(),
        defaults.llm_api_key.clone(),
        defaults.llm_model.clone(),
    ));
    let dispatcher = Arc::new(TranslationDispatcher::new(
        translation_provider,
        defaults.rpm_limit,
        source_lang.clone(),
        target_lang.clone(),
    ));

    let session = Session::new(
        recording_id.clone(),
        source_lang.clone(),
        target_lang.clone(),
        is_true_streaming,
        dispatcher,
        state.db.clone() as Arc<dyn PersistenceAdapter>,
        outbound,
        defaults.segment_soft_threshold,
        defaults.segment_hard_threshold,
    )?;

    let mut processor: Box<dyn AudioProcessor> = if is_true_streaming {
        let provider: Arc<dyn StreamingAsrProvider> = Arc::new(WsStreamingAsrProvider::new(
            defaults.stt_stream_url_v1.clone(),
            defaults.stt_stream_url_v2.clone(),
            defaults.stt_api_key.clone(),
        ));
        Box::new(TrueStreamingProcessor::new(
            provider,
            session.clone(),
            defaults.stt_model.clone(),
            source_lang.clone(),
            diarization,
        ))
    } else {
        let stt: Arc<dyn BatchAsrProvider> = Arc::new(HttpBatchAsrProvider::new(
            defaults.stt_base_url.clone(),
            defaults.stt_api_key.clone(),
            defaults.stt_model.clone(),
        ));
        let vad: Arc<dyn VoiceActivityDetector> = Arc::new(EnergyVad::new());
        let transcoder: Arc<dyn AudioTranscoder> = Arc::new(FfmpegTranscoder);
        Box::new(SimulatedProcessor::new(
            defaults.buffer_duration,
            silence_threshold,
            source_lang.clone(),
            stt,
            vad,
            transcoder,
            session.clone(),
        ))
    };

    processor.start().await?;
    Ok((session, processor, recording_id))
}

async fn finish_recording(
    session: &mut Option<Arc<Session>>,
    processor: &mut Option<Box<dyn AudioProcessor>>,
    recording_id: &Option<String>,
    state: &Arc<AppState>,
    outbound: &mpsc::UnboundedSender<ServerMessage>,
) {
    let (Some(session), Some(mut processor), Some(recording_id)) =
        (session.take(), processor.take(), recording_id.clone())
    else {
        return;
    };

    session.finalize().await;

    let (header, all_bytes) = match processor.stop().await {
        Ok(v) => v,
        Err(e) => {
            error!("processor stop failed: {e}");
            let _ = outbound.send(ServerMessage::Error { message: e.to_string() });
            return;
        }
    };

    let saver = AudioSaver::new(
        state.db.clone() as Arc<dyn AudioStorageBackend>,
        state.db.clone() as Arc<dyn PersistenceAdapter>,
        Arc::new(FfmpegTranscoder),
    );
    match saver.save(header, all_bytes, &recording_id).await {
        Ok(outcome) if outcome.success => {
            let _ = outbound.send(ServerMessage::AudioSaved {
                recording_id,
                audio_size: outcome.size as u64,
            });
        }
        Ok(outcome) => {
            if let Some(err) = outcome.error {
                warn!("audio not saved: {err}");
            }
        }
        Err(e) => {
            error!("audio save failed: {e}");
            let _ = outbound.send(ServerMessage::Error { message: e.to_string() });
        }
    }
}
