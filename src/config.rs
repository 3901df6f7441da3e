//! Process bootstrap configuration, loaded from the environment.
//!
//! No settings crate is pulled in here: the teacher carries none either,
//! and among the rest of the pack only Tauri apps (which read config from
//! a local settings store, not env) touch this concern. Plain `env::var`
//! with typed defaults matches the corpus.

use std::env;

use crate::error::{CoreError, Result};

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioStorageBackend {
    LargeObject,
    Blob,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_path: String,
    pub jwt_secret: String,
    pub audio_storage_backend: AudioStorageBackend,

    pub default_stt_provider: String,
    pub default_stt_base_url: String,
    pub default_stt_model: String,

    /// True-streaming providers (§4.3) speak two WebSocket endpoint
    /// variants: a general one and a low-latency "Flux"-family one
    /// (`registry::is_flux_model` picks between them).
    pub default_stt_stream_url_v1: String,
    pub default_stt_stream_url_v2: String,

    pub default_llm_provider: String,
    pub default_llm_base_url: String,
    pub default_llm_model: String,

    /// Admin's own credential set, used when a user has opted into
    /// "use admin's keys" (§6.2).
    pub admin_stt_api_key: String,
    pub admin_llm_api_key: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let jwt_secret = env::var("AUTH_JWT_SECRET")
            .map_err(|_| CoreError::ConfigMissing("AUTH_JWT_SECRET".into()))?;

        let audio_storage_backend = match env_or("AUDIO_STORAGE_BACKEND", "large_object").as_str()
        {
            "large_object" => AudioStorageBackend::LargeObject,
            "blob" => AudioStorageBackend::Blob,
            other => {
                return Err(CoreError::ConfigInvalid(format!(
                    "AUDIO_STORAGE_BACKEND: unknown value '{other}'"
                )))
            }
        };

        Ok(Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8000"),
            database_path: env_or("DATABASE_PATH", "./echo-relay.db"),
            jwt_secret,
            audio_storage_backend,
            default_stt_provider: env_or("DEFAULT_STT_PROVIDER", "groq"),
            default_stt_base_url: env_or("DEFAULT_STT_BASE_URL", "https://api.groq.com/openai/v1"),
            default_stt_model: env_or("DEFAULT_STT_MODEL", "whisper-large-v3-turbo"),
            default_stt_stream_url_v1: env_or(
                "DEFAULT_STT_STREAM_URL_V1",
                "wss://api.deepgram.com/v1/listen",
            ),
            default_stt_stream_url_v2: env_or(
                "DEFAULT_STT_STREAM_URL_V2",
                "wss://api.deepgram.com/v2/listen",
            ),
            default_llm_provider: env_or("DEFAULT_LLM_PROVIDER", "siliconflow"),
            default_llm_base_url: env_or(
                "DEFAULT_LLM_BASE_URL",
                "https://api.siliconflow.cn/v1",
            ),
            default_llm_model: env_or("DEFAULT_LLM_MODEL", "deepseek-ai/DeepSeek-V3"),
            admin_stt_api_key: env_or("ADMIN_STT_API_KEY", ""),
            admin_llm_api_key: env_or("ADMIN_LLM_API_KEY", ""),
        })
    }
}

/// Per-session effective settings, resolved from `start` control message
/// fields plus process configuration (§6.2).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub stt_provider: String,
    pub stt_model: String,
    pub stt_base_url: String,
    pub stt_stream_url_v1: String,
    pub stt_stream_url_v2: String,
    pub stt_api_key: String,
    pub llm_provider: String,
    pub llm_model: String,
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub source_lang: String,
    pub target_lang: String,
    pub diarization: bool,
    pub buffer_duration: f64,
    pub silence_threshold: f64,
    pub segment_soft_threshold: usize,
    pub segment_hard_threshold: usize,
    pub rpm_limit: u32,
}

/// `recording.translation_mode` repurposed as RPM, per §6.2: clamp to
/// `[10, 300]`; values below 10 (including historical 0/6) collapse to 100.
pub fn normalize_rpm(raw: i64) -> u32 {
    if raw < 10 {
        100
    } else if raw > 300 {
        300
    } else {
        raw as u32
    }
}

impl SessionConfig {
    pub fn defaults(config: &Config) -> Self {
        Self {
            stt_provider: config.default_stt_provider.clone(),
            stt_model: config.default_stt_model.clone(),
            stt_base_url: config.default_stt_base_url.clone(),
            stt_stream_url_v1: config.default_stt_stream_url_v1.clone(),
            stt_stream_url_v2: config.default_stt_stream_url_v2.clone(),
            stt_api_key: config.admin_stt_api_key.clone(),
            llm_provider: config.default_llm_provider.clone(),
            llm_model: config.default_llm_model.clone(),
            llm_base_url: config.default_llm_base_url.clone(),
            llm_api_key: config.admin_llm_api_key.clone(),
            source_lang: "en".into(),
            target_lang: "zh".into(),
            diarization: false,
            buffer_duration: 6.0,
            silence_threshold: 30.0,
            segment_soft_threshold: 30,
            segment_hard_threshold: 60,
            rpm_limit: normalize_rpm(100),
        }
    }
}
