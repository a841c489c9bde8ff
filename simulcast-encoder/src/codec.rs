use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const MAX_SIMULCAST_STREAMS: usize = 3;
pub const MAX_TEMPORAL_STREAMS: usize = 4;

/// Format parameter name carrying the H.264/H.265 packetization mode.
pub const FMTP_PACKETIZATION_MODE: &str = "packetization-mode";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodecType {
    H264,
    H265,
}

impl VideoCodecType {
    pub fn name(&self) -> &'static str {
        match self {
            VideoCodecType::H264 => "H264",
            VideoCodecType::H265 => "H265",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum H264PacketizationMode {
    /// Mode 1: STAP-A, FU-A allowed.
    NonInterleaved,
    /// Mode 0: only single NAL unit packets.
    #[default]
    SingleNalUnit,
}

impl H264PacketizationMode {
    /// Reads the packetization mode from negotiated format parameters.
    pub fn from_fmtp(params: &HashMap<String, String>) -> Self {
        match params.get(FMTP_PACKETIZATION_MODE).map(String::as_str) {
            Some("1") => H264PacketizationMode::NonInterleaved,
            _ => H264PacketizationMode::SingleNalUnit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalabilityMode {
    L1T1,
    L1T2,
    L1T3,
}

pub const SUPPORTED_SCALABILITY_MODES: [ScalabilityMode; 3] = [
    ScalabilityMode::L1T1,
    ScalabilityMode::L1T2,
    ScalabilityMode::L1T3,
];

impl ScalabilityMode {
    /// Maps a temporal layer count to a mode. Zero means "no scalability
    /// structure"; counts above three are not representable.
    pub fn from_temporal_layers(num_temporal_layers: u8) -> Option<Self> {
        match num_temporal_layers {
            1 => Some(ScalabilityMode::L1T1),
            2 => Some(ScalabilityMode::L1T2),
            3 => Some(ScalabilityMode::L1T3),
            _ => None,
        }
    }

    pub fn num_temporal_layers(&self) -> u8 {
        match self {
            ScalabilityMode::L1T1 => 1,
            ScalabilityMode::L1T2 => 2,
            ScalabilityMode::L1T3 => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScalabilityMode::L1T1 => "L1T1",
            ScalabilityMode::L1T2 => "L1T2",
            ScalabilityMode::L1T3 => "L1T3",
        }
    }
}

pub fn supports_scalability_mode(mode: ScalabilityMode) -> bool {
    SUPPORTED_SCALABILITY_MODES.contains(&mode)
}

/// One entry of the simulcast stream descriptor. Index 0 is the lowest
/// resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulcastStream {
    pub width: u32,
    pub height: u32,
    pub max_framerate: f64,
    pub number_of_temporal_layers: u8,
    // kbps
    pub min_bitrate_kbps: u32,
    // kbps
    pub target_bitrate_kbps: u32,
    // kbps
    pub max_bitrate_kbps: u32,
    pub active: bool,
}

impl Default for SimulcastStream {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            max_framerate: 30.0,
            number_of_temporal_layers: 1,
            min_bitrate_kbps: 0,
            target_bitrate_kbps: 0,
            max_bitrate_kbps: 0,
            active: true,
        }
    }
}

impl SimulcastStream {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn bitrate_kbps(mut self, min: u32, target: u32, max: u32) -> Self {
        self.min_bitrate_kbps = min;
        self.target_bitrate_kbps = target;
        self.max_bitrate_kbps = max;
        self
    }

    pub fn temporal_layers(mut self, n: u8) -> Self {
        self.number_of_temporal_layers = n;
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Target codec parameters handed to `init_encode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoCodec {
    pub codec_type: VideoCodecType,
    pub width: u32,
    pub height: u32,
    pub max_framerate: u32,
    // kbps
    pub start_bitrate_kbps: u32,
    // kbps
    pub min_bitrate_kbps: u32,
    // kbps
    pub max_bitrate_kbps: u32,
    pub number_of_temporal_layers: u8,
    pub key_frame_interval: u32,
    pub frame_drop_enabled: bool,
    /// Ascending resolution order: index 0 is the lowest stream.
    pub simulcast_streams: Vec<SimulcastStream>,
}

impl Default for VideoCodec {
    fn default() -> Self {
        Self {
            codec_type: VideoCodecType::H264,
            width: 1280,
            height: 720,
            max_framerate: 30,
            start_bitrate_kbps: 300,
            min_bitrate_kbps: 30,
            max_bitrate_kbps: 2500,
            number_of_temporal_layers: 1,
            key_frame_interval: 3000,
            frame_drop_enabled: true,
            simulcast_streams: Vec::new(),
        }
    }
}

impl VideoCodec {
    pub fn builder() -> VideoCodecBuilder {
        VideoCodecBuilder::new()
    }

    pub fn number_of_simulcast_streams(&self) -> usize {
        self.simulcast_streams.len()
    }

    /// Returns the descriptor of stream `idx`. When no simulcast streams
    /// are configured, stream 0 mirrors the top-level resolution and rates.
    pub fn simulcast_stream(&self, idx: usize) -> SimulcastStream {
        match self.simulcast_streams.get(idx) {
            Some(stream) => stream.clone(),
            None => SimulcastStream {
                width: self.width,
                height: self.height,
                max_framerate: self.max_framerate as f64,
                number_of_temporal_layers: self.number_of_temporal_layers,
                min_bitrate_kbps: self.min_bitrate_kbps,
                target_bitrate_kbps: self.start_bitrate_kbps,
                max_bitrate_kbps: self.max_bitrate_kbps,
                active: true,
            },
        }
    }
}

pub struct VideoCodecBuilder {
    codec: VideoCodec,
}

impl VideoCodecBuilder {
    pub fn new() -> Self {
        Self {
            codec: VideoCodec::default(),
        }
    }

    pub fn codec_type(mut self, codec_type: VideoCodecType) -> Self {
        self.codec.codec_type = codec_type;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.codec.width = width;
        self.codec.height = height;
        self
    }

    pub fn max_framerate(mut self, fps: u32) -> Self {
        self.codec.max_framerate = fps;
        self
    }

    pub fn start_bitrate_kbps(mut self, kbps: u32) -> Self {
        self.codec.start_bitrate_kbps = kbps;
        self
    }

    pub fn bitrate_range_kbps(mut self, min: u32, max: u32) -> Self {
        self.codec.min_bitrate_kbps = min;
        self.codec.max_bitrate_kbps = max;
        self
    }

    pub fn temporal_layers(mut self, n: u8) -> Self {
        self.codec.number_of_temporal_layers = n;
        self
    }

    pub fn key_frame_interval(mut self, interval: u32) -> Self {
        self.codec.key_frame_interval = interval;
        self
    }

    pub fn frame_drop(mut self, enabled: bool) -> Self {
        self.codec.frame_drop_enabled = enabled;
        self
    }

    pub fn add_simulcast_stream(mut self, stream: SimulcastStream) -> Self {
        self.codec.simulcast_streams.push(stream);
        self
    }

    pub fn build(self) -> VideoCodec {
        self.codec
    }
}

impl Default for VideoCodecBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability hint passed alongside the codec parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub number_of_cores: u32,
    pub max_payload_size: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            number_of_cores: 1,
            max_payload_size: 1200,
        }
    }
}

/// Construction-time configuration of a multi-layer encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    pub codec_type: VideoCodecType,
    /// Whether this codec may be used at all in this process.
    pub enabled: bool,
    pub packetization_mode: H264PacketizationMode,
}

impl EncoderConfig {
    pub fn new(codec_type: VideoCodecType) -> Self {
        Self {
            codec_type,
            enabled: true,
            packetization_mode: H264PacketizationMode::SingleNalUnit,
        }
    }

    /// Builds a config from negotiated format parameters.
    pub fn from_fmtp(codec_type: VideoCodecType, params: &HashMap<String, String>) -> Self {
        Self {
            packetization_mode: H264PacketizationMode::from_fmtp(params),
            ..Self::new(codec_type)
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::new(VideoCodecType::H264)
    }
}
