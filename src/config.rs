//! Configuration management for the voxrelay gateway
//!
//! Configuration is a single YAML file. It is loaded once at startup and
//! hot-reloaded on file change: readers hold an [`Arc`] snapshot taken from
//! [`ConfigHandle::snapshot`], and a reload swaps the whole snapshot at once,
//! so a torn configuration is never observable. Unknown keys are ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{RecursiveMode, Watcher};
use serde::Deserialize;

use crate::ratelimit::RateLimitMode;
use crate::{Error, Result};

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application environment
    pub app: AppConfig,

    /// Administrative HTTP server
    pub http: HttpConfig,

    /// MQTT broker and credentials
    pub mqtt: MqttConfig,

    /// Topics to subscribe on connect
    pub topics: Vec<String>,

    /// Inbound message routing
    pub rule: RuleConfig,

    /// Speech recognition service
    pub asr: AsrConfig,

    /// Intent classification service
    pub nlu: NluConfig,

    /// Chat model selection
    pub agent: AgentConfig,

    /// Qwen chat model profile
    pub qwen: QwenConfig,

    /// Speech synthesis services
    pub tts: TtsConfig,

    /// Audio archival
    pub audio: AudioConfig,

    /// Token pricing rules per model
    pub pricing: PricingConfig,

    /// Redis, used by the distributed rate limiter
    pub redis: RedisConfig,

    /// Embedded database
    pub database: DatabaseConfig,

    /// Log output
    pub logger: LoggerConfig,

    /// Per-device ingress rate limiting
    pub rate_limit: RateLimitConfig,
}

/// Application environment
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Environment name, e.g. `dev` or `prod`
    pub env: String,
    /// Verbose diagnostics
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            env: "dev".to_string(),
            debug: false,
        }
    }
}

/// Administrative HTTP server
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Port to listen on
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// MQTT broker and client credentials
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker address, e.g. `tcp://127.0.0.1:1883`
    pub address: String,
    /// Client credentials
    pub client: MqttClientConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            address: "tcp://127.0.0.1:1883".to_string(),
            client: MqttClientConfig::default(),
        }
    }
}

/// MQTT client credentials
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MqttClientConfig {
    pub username: String,
    pub password: String,
}

/// Inbound message routing
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Forwarding strategy name; empty runs the in-process pipeline
    pub model: String,
}

/// Speech recognition service
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// Client variant, currently `local`
    pub model: String,
    /// Service endpoint URL
    pub endpoint: String,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            model: "local".to_string(),
            endpoint: "http://127.0.0.1:8001/asr".to_string(),
        }
    }
}

/// Intent classification service
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NluConfig {
    /// Client variant, currently `local`
    pub model: String,
    /// Service endpoint URL
    pub endpoint: String,
}

impl Default for NluConfig {
    fn default() -> Self {
        Self {
            model: "local".to_string(),
            endpoint: "http://127.0.0.1:8002/nlu".to_string(),
        }
    }
}

/// Chat model selection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Strategy name, e.g. `qwen`
    pub model: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "qwen".to_string(),
        }
    }
}

/// Qwen chat model profile
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QwenConfig {
    /// Chat completions endpoint
    pub endpoint: String,
    /// Bearer token
    pub api_key: String,
    /// Model identifier, e.g. `qwen-flash`
    pub model: String,
    /// System prompt
    #[serde(rename = "systemDesc")]
    pub system_desc: String,
    /// Request parameters
    pub params: QwenParams,
}

impl Default for QwenConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            model: "qwen-flash".to_string(),
            system_desc: String::new(),
            params: QwenParams::default(),
        }
    }
}

/// Qwen request parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QwenParams {
    /// Role for the user message
    pub role: String,
    /// Streamed responses
    pub stream: bool,
}

impl Default for QwenParams {
    fn default() -> Self {
        Self {
            role: "user".to_string(),
            stream: true,
        }
    }
}

/// Speech synthesis services
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Variant selection: `edge` or `chat`
    pub model: String,
    /// Edge TTS profile
    pub edge: TtsEndpointConfig,
    /// ChatTTS profile
    pub chat: TtsEndpointConfig,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            model: "edge".to_string(),
            edge: TtsEndpointConfig::default(),
            chat: TtsEndpointConfig::default(),
        }
    }
}

/// One TTS service profile
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TtsEndpointConfig {
    /// Service endpoint URL
    pub endpoint: String,
    /// Synthesis parameters
    pub params: TtsParams,
}

/// Synthesis parameters forwarded to the TTS service
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsParams {
    /// Voice identifier
    pub voice: String,
    /// Rate adjustment, e.g. `+0%`
    pub rate: String,
    /// Pitch adjustment, e.g. `+0Hz`
    pub pitch: String,
    /// Volume adjustment, e.g. `+0%`
    pub volume: String,
    /// Sampling temperature (ChatTTS only)
    pub temperature: String,
}

impl Default for TtsParams {
    fn default() -> Self {
        Self {
            voice: "zh-CN-XiaoxiaoNeural".to_string(),
            rate: "+0%".to_string(),
            pitch: "+0Hz".to_string(),
            volume: "+0%".to_string(),
            temperature: String::new(),
        }
    }
}

/// Audio archival
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Directory for archived utterances; empty disables archival
    pub storage: String,
}

/// Token pricing rules
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Per-model pricing, keyed by model identifier
    pub models: HashMap<String, PriceRule>,
}

/// Pricing for one model, per thousand tokens
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PriceRule {
    /// Price per 1K prompt tokens
    pub input_price: f64,
    /// Price per 1K completion tokens
    pub output_price: f64,
    /// ISO currency code
    pub currency: String,
}

impl Default for PriceRule {
    fn default() -> Self {
        Self {
            input_price: 0.0,
            output_price: 0.0,
            currency: "CNY".to_string(),
        }
    }
}

/// Redis connection, used by the distributed rate limiter
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Host and port
    pub addr: String,
    /// Password, empty for none
    pub password: String,
    /// Database index
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            password: String::new(),
            db: 0,
        }
    }
}

/// Embedded database
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the `SQLite` file
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/voxrelay.db".to_string(),
        }
    }
}

/// Log output
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Default log level when `-v` is not given
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Per-device ingress rate limiting
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Backend: `local` or `distributed`
    pub mode: RateLimitMode,
    /// Token refill rate
    pub requests_per_second: u32,
    /// Bucket capacity
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            mode: RateLimitMode::Local,
            requests_per_second: 1,
            burst: 5,
        }
    }
}

impl Config {
    /// Parse a configuration from YAML text
    ///
    /// # Errors
    ///
    /// Returns an error when the YAML is malformed.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load a configuration file
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }
}

/// Shared handle to the live configuration snapshot
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    /// Wrap an initial configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// The current immutable snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<Config> {
        Arc::clone(&self.inner.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Swap in a new snapshot; in-flight readers keep the one they hold
    pub fn replace(&self, config: Config) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }
}

/// Keeps the configuration file watcher alive
pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
}

/// Watch a configuration file and swap the handle's snapshot on change.
///
/// A reload that fails to parse keeps the previous snapshot and logs the
/// error.
///
/// # Errors
///
/// Returns an error when the watcher cannot be installed.
pub fn watch<P: Into<PathBuf>>(path: P, handle: ConfigHandle) -> Result<ConfigWatcher> {
    let path = path.into();
    let reload_path = path.clone();

    let mut watcher =
        notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let Ok(event) = event else { return };
            if !(event.kind.is_modify() || event.kind.is_create()) {
                return;
            }
            match Config::load(&reload_path) {
                Ok(config) => {
                    handle.replace(config);
                    tracing::info!(path = %reload_path.display(), "configuration reloaded");
                }
                Err(e) => {
                    tracing::error!(error = %e, path = %reload_path.display(), "configuration reload failed, keeping previous snapshot");
                }
            }
        })
        .map_err(|e| Error::Config(e.to_string()))?;

    watcher
        .watch(&path, RecursiveMode::NonRecursive)
        .map_err(|e| Error::Config(e.to_string()))?;

    Ok(ConfigWatcher { _watcher: watcher })
}
