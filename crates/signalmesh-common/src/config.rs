//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG
        .get()
        .expect("Config not initialized. Call signalmesh_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("queue.signal_queue_capacity", 32)?
        .set_default("queue.subscriber_queue_capacity", 32)?
        .set_default("heartbeat.ping_interval_secs", 54)?
        .set_default("heartbeat.pong_timeout_secs", 60)?
        .set_default("heartbeat.write_deadline_secs", 10)?
        .set_default("heartbeat.max_frame_bytes", 8192)?
        .set_default(
            "ice.stun_urls",
            vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        )?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (SIGNALMESH_SERVER__HOST, SIGNALMESH_QUEUE__SIGNAL_QUEUE_CAPACITY, etc.)
        .add_source(
            config::Environment::with_prefix("SIGNALMESH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub heartbeat: HeartbeatConfig,
    pub ice: IceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Bounded-queue capacities (spec §3/§4.3 — 32 packets, 32 signalling messages).
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    pub signal_queue_capacity: usize,
    pub subscriber_queue_capacity: usize,
}

/// Control-channel heartbeat and framing limits (spec §4.4, §6).
///
/// `max_frame_bytes` is raised from the reference's 512 bytes — too small for
/// real SDP offers — to 8 KiB by default.
#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatConfig {
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub write_deadline_secs: u64,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
}
