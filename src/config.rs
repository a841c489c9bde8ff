use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use simulcast_encoder::codec::{
    EncoderConfig, EncoderSettings, SimulcastStream, VideoCodec, VideoCodecType,
};

/// Top-level JSON configuration of the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub codec_type: VideoCodecType,
    pub enabled: bool,
    /// Negotiated format parameters, e.g. `{"packetization-mode": "1"}`.
    pub fmtp: HashMap<String, String>,
    pub codec: VideoCodec,
    pub settings: EncoderSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            codec_type: VideoCodecType::H264,
            enabled: true,
            fmtp: HashMap::from([("packetization-mode".to_string(), "1".to_string())]),
            codec: default_codec(1280, 720),
            settings: EncoderSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let json = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {}", path.display(), e))?;
        let config: AppConfig = serde_json::from_str(&json)?;
        log::info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn encoder_config(&self) -> EncoderConfig {
        let mut config = EncoderConfig::from_fmtp(self.codec_type, &self.fmtp);
        config.enabled = self.enabled;
        config
    }

    /// Rebuilds the three-stream cascade for a new top resolution.
    pub fn resize(&mut self, width: u32, height: u32) {
        let start = self.codec.start_bitrate_kbps;
        let framerate = self.codec.max_framerate;
        self.codec = VideoCodec {
            start_bitrate_kbps: start,
            max_framerate: framerate,
            ..default_codec(width, height)
        };
    }
}

/// Full, half and quarter resolution streams.
pub fn default_codec(width: u32, height: u32) -> VideoCodec {
    VideoCodec::builder()
        .codec_type(VideoCodecType::H264)
        .resolution(width, height)
        .max_framerate(30)
        .start_bitrate_kbps(2500)
        .bitrate_range_kbps(30, 3200)
        .add_simulcast_stream(SimulcastStream::new(width / 4, height / 4).bitrate_kbps(30, 150, 200))
        .add_simulcast_stream(SimulcastStream::new(width / 2, height / 2).bitrate_kbps(150, 500, 700))
        .add_simulcast_stream(SimulcastStream::new(width, height).bitrate_kbps(600, 1500, 2500))
        .build()
}
