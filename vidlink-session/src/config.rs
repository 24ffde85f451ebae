use anyhow::Context;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use vidlink_protocol::webrtc::IceConfig;

pub const CONFIG_FILE_NAME: &str = "vidlink.toml";

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct CallConfig {
    pub signaling: SignalingConfig,
    pub ice: IceConfig,
    pub media: MediaConfig,
    pub session: SessionConfig,
}

impl CallConfig {
    /// Layers the defaults, `<config_dir>/vidlink.toml`, a `vidlink.toml` in the working directory
    /// and `VIDLINK_*` environment variables (`VIDLINK_SIGNALING__PARTY_ID=alice`).
    pub fn parse(config_dir: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&CallConfig::default())?);
        if let Some(config_dir) = config_dir {
            builder =
                builder.add_source(File::from(config_dir.join(CONFIG_FILE_NAME)).required(false));
        }

        let config = builder
            .add_source(File::with_name(CONFIG_FILE_NAME).required(false))
            .add_source(
                Environment::with_prefix("vidlink")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build config")?
            .try_deserialize::<Self>()
            .context("Failed to deserialize config")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.ice.validate().context("Invalid ICE config")?;

        if self.signaling.url.is_empty() {
            anyhow::bail!("Signaling URL is empty");
        } else if self.media.frame_buffer_size == 0 {
            anyhow::bail!("Media frame buffer size must be positive");
        } else if self.media.remote_frame_buffer_size == 0 {
            anyhow::bail!("Remote frame buffer size must be positive");
        } else if self.session.command_channel_capacity == 0 {
            anyhow::bail!("Command channel capacity must be positive");
        } else if self.session.event_channel_capacity == 0 {
            anyhow::bail!("Event channel capacity must be positive");
        } else if self.session.candidate_buffer_limit == 0 {
            anyhow::bail!("Candidate buffer limit must be positive");
        }

        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SignalingConfig {
    /// Websocket endpoint of the signaling server, the party ID is appended as query parameter.
    pub url: String,
    /// ID the local party is reachable under. Required by the `vidlink` binary.
    pub party_id: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/ws".to_string(),
            party_id: "".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MediaConfig {
    /// Captured frames buffered per local track.
    pub frame_buffer_size: usize,
    /// Remote frames buffered for the renderer.
    pub remote_frame_buffer_size: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            frame_buffer_size: 32,
            remote_frame_buffer_size: 256,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SessionConfig {
    pub command_channel_capacity: usize,
    pub event_channel_capacity: usize,
    /// Remote ICE candidates held until the remote description is applied. The oldest is dropped
    /// once the limit is reached.
    pub candidate_buffer_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_channel_capacity: 16,
            event_channel_capacity: 64,
            candidate_buffer_limit: 64,
        }
    }
}
