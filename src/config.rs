//! # Configuration Management
//!
//! Loads the relay configuration from several layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables prefixed with `APP__` (e.g. `APP__SERVER__PORT`)
//! - The conventional provider variables (`CARTESIA_API_KEY`, `OPENAI_MODEL`, ...)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Provider variables and `HOST` / `PORT`
//! 2. `APP__`-prefixed environment variables
//! 3. Configuration file (config.toml)
//! 4. Default values
//!
//! The configuration is loaded once at startup and shared read-only with every
//! session. Nothing in here changes while the server runs.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Sample rates accepted by the speech providers (Hz).
pub const SUPPORTED_SAMPLE_RATES: &[u32] = &[8000, 16000, 22050, 24000, 44100, 48000];

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each collaborator (STT, TTS, LLM) gets its own section so a session can
/// hand exactly one section to the adapter it constructs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub stt: SttConfig,
    pub tts: TtsConfig,
    pub llm: LlmConfig,
    pub conversation: ConversationConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host` / `port`: bind address of the HTTP server
/// - `heartbeat_interval_secs`: how often the server pings each WebSocket client
/// - `client_timeout_secs`: silence after which a client is considered gone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Streaming speech-to-text settings (Cartesia STT WebSocket).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    pub api_key: String,
    pub url: String,
    pub api_version: String,
    pub model: String,
    pub language: String,
    pub encoding: String,
    pub sample_rate: u32,
    /// Upper bound for establishing one STT stream.
    pub connect_timeout_ms: u64,
    /// How long a finalized stream is kept open to deliver its trailing
    /// transcript before it is disconnected.
    pub finalize_grace_ms: u64,
}

/// Streaming text-to-speech settings (Cartesia TTS WebSocket).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    pub api_key: String,
    pub url: String,
    pub api_version: String,
    pub model: String,
    pub voice_id: String,
    pub encoding: String,
    pub sample_rate: u32,
    /// Container used for audio frames sent to the browser: `raw` or `wav`.
    pub client_container: String,
    pub connect_timeout_ms: u64,
}

/// Language model settings (OpenAI Chat Completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub request_timeout_secs: u64,
}

/// Conversation seeding and context settings.
///
/// ## Fields:
/// - `company_details_path`: text file appended to the system prompt
/// - `prompt_preamble`: instructions placed before the company details
/// - `max_context_turns`: optional bound on turns sent to the LLM (history is kept in full)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    pub company_details_path: PathBuf,
    pub prompt_preamble: String,
    pub max_context_turns: Option<usize>,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 4000,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            stt: SttConfig {
                api_key: String::new(),
                url: "wss://api.cartesia.ai/stt/websocket".to_string(),
                api_version: "2025-04-16".to_string(),
                model: "ink-whisper".to_string(),
                language: "en".to_string(),
                encoding: "pcm_s16le".to_string(),
                sample_rate: 16000,
                connect_timeout_ms: 10_000,
                finalize_grace_ms: 3_000,
            },
            tts: TtsConfig {
                api_key: String::new(),
                url: "wss://api.cartesia.ai/tts/websocket".to_string(),
                api_version: "2025-04-16".to_string(),
                model: "sonic-en-v1".to_string(),
                voice_id: "alloy".to_string(),
                encoding: "pcm_s16le".to_string(),
                sample_rate: 24000,
                client_container: "raw".to_string(),
                connect_timeout_ms: 10_000,
            },
            llm: LlmConfig {
                api_key: String::new(),
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o-mini".to_string(),
                request_timeout_secs: 30,
            },
            conversation: ConversationConfig {
                company_details_path: PathBuf::from("company_details.txt"),
                prompt_preamble: "You are a helpful customer service agent. \
                    Use the following company details to answer questions accurately:"
                    .to_string(),
                max_context_turns: None,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 32,
            },
        }
    }
}

/// Environment variables understood without the `APP__` prefix, mapped to
/// the configuration key they override.
const PROVIDER_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("CARTESIA_API_KEY", "stt.api_key"),
    ("CARTESIA_API_KEY", "tts.api_key"),
    ("CARTESIA_STT_MODEL", "stt.model"),
    ("CARTESIA_LANGUAGE", "stt.language"),
    ("CARTESIA_STT_SAMPLE_RATE", "stt.sample_rate"),
    ("CARTESIA_TTS_MODEL", "tts.model"),
    ("CARTESIA_VOICE_ID", "tts.voice_id"),
    ("CARTESIA_TTS_SAMPLE_RATE", "tts.sample_rate"),
    ("OPENAI_API_KEY", "llm.api_key"),
    ("OPENAI_MODEL", "llm.model"),
];

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=5000`: Override server port
    /// - `APP__CONVERSATION__MAX_CONTEXT_TURNS=20`: Bound the LLM context
    /// - `CARTESIA_API_KEY=...`: API key for both speech directions
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        for (variable, key) in PROVIDER_ENV_OVERRIDES {
            if let Ok(value) = env::var(variable) {
                settings = settings.set_override(*key, value)?;
            }
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Missing API keys are only reported as warnings: the server can still
    /// start, and each session reports the provider failure to its client.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.heartbeat_interval_secs == 0
            || self.server.client_timeout_secs <= self.server.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than a non-zero heartbeat interval"
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        for (name, rate) in [("stt", self.stt.sample_rate), ("tts", self.tts.sample_rate)] {
            if !SUPPORTED_SAMPLE_RATES.contains(&rate) {
                return Err(anyhow::anyhow!("Unsupported {} sample rate: {}", name, rate));
            }
        }

        for (name, model) in [
            ("stt.model", &self.stt.model),
            ("tts.model", &self.tts.model),
            ("tts.voice_id", &self.tts.voice_id),
            ("llm.model", &self.llm.model),
        ] {
            if model.trim().is_empty() {
                return Err(anyhow::anyhow!("{} cannot be empty", name));
            }
        }

        if self.stt.connect_timeout_ms == 0
            || self.tts.connect_timeout_ms == 0
            || self.llm.request_timeout_secs == 0
        {
            return Err(anyhow::anyhow!("Provider timeouts must be greater than 0"));
        }

        if !matches!(self.tts.client_container.as_str(), "raw" | "wav") {
            return Err(anyhow::anyhow!(
                "Unsupported client container '{}', expected raw or wav",
                self.tts.client_container
            ));
        }

        if self.conversation.max_context_turns == Some(0) {
            return Err(anyhow::anyhow!("max_context_turns must be greater than 0 when set"));
        }

        if self.stt.api_key.is_empty() || self.tts.api_key.is_empty() {
            warn!("Missing CARTESIA_API_KEY in environment");
        }
        if self.llm.api_key.is_empty() {
            warn!("Missing OPENAI_API_KEY in environment");
        }

        Ok(())
    }

    /// Build the system prompt that seeds every conversation.
    ///
    /// Reads the company details file once; an unreadable file is logged and
    /// treated as empty so the service still starts.
    pub fn load_system_prompt(&self) -> String {
        let path = &self.conversation.company_details_path;
        let details = match std::fs::read_to_string(path) {
            Ok(details) => details,
            Err(err) => {
                warn!("Could not read company details at {}: {}", path.display(), err);
                String::new()
            }
        };

        format!("{}\n\n{}", self.conversation.prompt_preamble, details)
    }
}

impl SttConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn finalize_grace(&self) -> Duration {
        Duration::from_millis(self.finalize_grace_ms)
    }
}

impl TtsConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
