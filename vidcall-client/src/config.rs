use anyhow::Context;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vidcall_webrtc::config::{IceConfig, MediaConfig};

pub const DEFAULT_SETTINGS_FILE_NAME: &str = "config.toml";
pub const EVENT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 64;
/// Per-sender cap on ICE candidates held while idle.
pub const EARLY_CANDIDATES_LIMIT: usize = 64;
pub const EARLY_CANDIDATE_SENDERS_LIMIT: usize = 8;
pub const REMOTE_FRAME_BUFFER_SIZE: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Local endpoint id announced to the relay.
    pub identity: String,
    pub signaling: SignalingConfig,
    pub ice: IceConfig,
    pub media: MediaConfig,
    pub call: CallConfig,
    pub logging: LoggingConfig,
}

/// Values given on the command line, taking precedence over every other source.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub identity: Option<String>,
    pub relay_url: Option<String>,
}

impl AppConfig {
    pub fn parse(overrides: &ConfigOverrides) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(
                File::with_name(config_file_path(DEFAULT_SETTINGS_FILE_NAME)?.as_str())
                    .required(false),
            )
            .add_source(File::with_name(DEFAULT_SETTINGS_FILE_NAME).required(false));

        if let Some(path) = &overrides.config_file {
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("vidcall")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("identity", overrides.identity.clone())?
            .set_override_option("signaling.relay_url", overrides.relay_url.clone())?
            .build()
            .context("Failed to build config")?
            .try_deserialize::<Self>()
            .context("Failed to deserialize config")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.identity.trim().is_empty() {
            anyhow::bail!("Identity is empty");
        } else if self.signaling.relay_url.is_empty() {
            anyhow::bail!("Relay URL is empty");
        } else if !self.media.audio && !self.media.video {
            anyhow::bail!("Both audio and video are disabled");
        }
        Ok(())
    }
}

pub fn config_file_path(file_name: impl AsRef<Path>) -> anyhow::Result<String> {
    Ok(Path::new("/etc")
        .join("vidcall")
        .join(file_name)
        .to_str()
        .context("Failed to build config file path")?
        .to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    pub relay_url: String,
    /// Reconnect attempts after the relay connection dropped, 0 disables reconnecting.
    pub reconnect_max_tries: u8,
    /// Seconds of silence from the relay before it is pinged.
    pub ping_interval_secs: u64,
    /// Seconds to wait for any reply to a ping before the connection counts as lost.
    pub pong_timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:3000/ws".to_string(),
            reconnect_max_tries: 8,
            ping_interval_secs: 15,
            pong_timeout_secs: 5,
        }
    }
}

impl SignalingConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Seconds an outgoing or incoming call may ring before it is ended. Unset rings forever.
    pub ring_timeout_secs: Option<u64>,
    pub event_channel_size: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: Some(45),
            event_channel_size: DEFAULT_EVENT_CHANNEL_SIZE,
        }
    }
}

impl CallConfig {
    pub fn ring_timeout(&self) -> Option<Duration> {
        self.ring_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is not set.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "vidcall=info,vidcall_client=debug,vidcall_signaling=info,vidcall_webrtc=info"
                .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid() -> AppConfig {
        AppConfig {
            identity: "alice".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn default_requires_identity() {
        assert!(AppConfig::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn blank_identity_is_rejected() {
        let config = AppConfig {
            identity: "   ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn media_must_not_be_fully_disabled() {
        let mut config = valid();
        config.media = MediaConfig {
            audio: false,
            video: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn ring_timeout_zero_disables() {
        let mut call = CallConfig::default();
        assert_eq!(call.ring_timeout(), Some(Duration::from_secs(45)));

        call.ring_timeout_secs = Some(0);
        assert_eq!(call.ring_timeout(), None);

        call.ring_timeout_secs = None;
        assert_eq!(call.ring_timeout(), None);
    }

    #[test]
    fn heartbeat_never_zero() {
        let mut signaling = SignalingConfig::default();
        assert_eq!(signaling.ping_interval(), Duration::from_secs(15));

        signaling.ping_interval_secs = 0;
        signaling.pong_timeout_secs = 0;
        assert_eq!(signaling.ping_interval(), Duration::from_secs(1));
        assert_eq!(signaling.pong_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn overrides_take_precedence() {
        let config = AppConfig::parse(&ConfigOverrides {
            config_file: None,
            identity: Some("bob".to_string()),
            relay_url: Some("ws://relay.example:9000/ws".to_string()),
        })
        .unwrap();

        assert_eq!(config.identity, "bob");
        assert_eq!(config.signaling.relay_url, "ws://relay.example:9000/ws");
        assert_eq!(config.ice, IceConfig::default());
    }
}
