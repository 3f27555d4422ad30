//! Configuration management for the Presence gateway

use std::time::Duration;

use crate::{Error, Result};

/// Default gateway port
pub const DEFAULT_PORT: u16 = 18790;

/// Fixed audio batch interval for the capture uplink
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 100;

/// Shared sample rate for capture and bridge format conversion (16kHz speech)
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

/// Presence gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Gateway HTTP/websocket server configuration
    pub server: ServerConfig,

    /// Audio capture and format configuration
    pub audio: AudioConfig,

    /// Avatar rendering service configuration
    pub avatar: AvatarConfig,

    /// Hosted speech pipeline configuration
    pub pipeline: PipelineConfig,
}

/// Gateway server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Require a per-session credential on session creation
    /// (rejected before any session state is created when absent)
    pub require_credential: bool,
}

/// Audio configuration shared by capture and synthesis routing
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Capture uplink batch interval in milliseconds
    pub batch_interval_ms: u64,

    /// One consistent sample rate shared by capture and bridge conversion
    pub sample_rate: u32,
}

/// Avatar rendering service configuration
#[derive(Debug, Clone)]
pub struct AvatarConfig {
    /// Base URL of the avatar rendering service
    pub base_url: String,

    /// Server-default credential used when a session supplies none
    pub default_credential: Option<String>,

    /// Honor `CANCEL_RESPONSE` packets automatically
    pub auto_interrupt: bool,
}

/// Hosted speech pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Base URL of the hosted recognition/generation/synthesis service
    pub base_url: String,

    /// Voice identifier used when a session requests none
    pub default_voice: String,

    /// Avatar identifier used when a session requests none
    pub default_avatar: String,
}

impl AudioConfig {
    /// Batch interval as a [`Duration`]
    #[must_use]
    pub const fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: DEFAULT_BATCH_INTERVAL_MS,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            require_credential: false,
        }
    }
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:18791".to_string(),
            default_credential: None,
            auto_interrupt: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:18792".to_string(),
            default_voice: "default".to_string(),
            default_avatar: "default".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            audio: AudioConfig::default(),
            avatar: AvatarConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables,
    /// falling back to defaults
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but unparseable, or if the
    /// resulting configuration is invalid
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PRESENCE_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid PRESENCE_PORT: {port}")))?;
        }
        if let Ok(interval) = std::env::var("PRESENCE_BATCH_INTERVAL_MS") {
            config.audio.batch_interval_ms = interval.parse().map_err(|_| {
                Error::Config(format!("invalid PRESENCE_BATCH_INTERVAL_MS: {interval}"))
            })?;
        }
        if let Ok(rate) = std::env::var("PRESENCE_SAMPLE_RATE") {
            config.audio.sample_rate = rate
                .parse()
                .map_err(|_| Error::Config(format!("invalid PRESENCE_SAMPLE_RATE: {rate}")))?;
        }
        if let Ok(url) = std::env::var("PRESENCE_AVATAR_URL") {
            config.avatar.base_url = url;
        }
        if let Ok(credential) = std::env::var("PRESENCE_AVATAR_CREDENTIAL") {
            config.avatar.default_credential = Some(credential);
        }
        if let Ok(auto) = std::env::var("PRESENCE_AUTO_INTERRUPT") {
            config.avatar.auto_interrupt = matches!(auto.as_str(), "1" | "true" | "yes");
        }
        if let Ok(require) = std::env::var("PRESENCE_REQUIRE_CREDENTIAL") {
            config.server.require_credential = matches!(require.as_str(), "1" | "true" | "yes");
        }
        if let Ok(url) = std::env::var("PRESENCE_PIPELINE_URL") {
            config.pipeline.base_url = url;
        }
        if let Ok(voice) = std::env::var("PRESENCE_DEFAULT_VOICE") {
            config.pipeline.default_voice = voice;
        }
        if let Ok(avatar) = std::env::var("PRESENCE_DEFAULT_AVATAR") {
            config.pipeline.default_avatar = avatar;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error for a zero batch interval or sample rate
    pub fn validate(&self) -> Result<()> {
        if self.audio.batch_interval_ms == 0 {
            return Err(Error::Config(
                "audio batch interval must be non-zero".to_string(),
            ));
        }
        if self.audio.sample_rate == 0 {
            return Err(Error::Config("sample rate must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio.batch_interval_ms, 100);
        assert_eq!(config.audio.sample_rate, 16000);
        assert!(config.avatar.auto_interrupt);
    }

    #[test]
    fn zero_batch_interval_is_rejected() {
        let mut config = Config::default();
        config.audio.batch_interval_ms = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
