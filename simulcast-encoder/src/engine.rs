//! Codec Engine boundary.
//!
//! The compression algorithm lives behind [`CodecEngine`]; the multi-layer
//! encoder only ever talks to one engine session per layer through this
//! trait. [`RawEngine`] is an always-available software engine that emits
//! the uncompressed I420 planes, the FFmpeg engine lives in `crate::ffmpeg`.

use bytes::Bytes;

use crate::codec::VideoCodecType;
use crate::frame::{I420Buffer, PixelFormat, VIDEO_CLOCK_RATE};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub codec_type: VideoCodecType,
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
    pub target_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
    pub pixel_format: PixelFormat,
    pub key_frame_interval: u32,
    pub number_of_cores: u32,
    /// Ticks per second of the timestamps handed to `encode`.
    pub clock_rate: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            codec_type: VideoCodecType::H264,
            width: 0,
            height: 0,
            framerate: 30.0,
            target_bitrate_bps: 0,
            max_bitrate_bps: 0,
            pixel_format: PixelFormat::I420,
            key_frame_interval: 0,
            number_of_cores: 1,
            clock_rate: VIDEO_CLOCK_RATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedPacket {
    data: Bytes,
    is_key: bool,
}

impl CompressedPacket {
    pub fn new(data: Bytes, is_key: bool) -> Self {
        Self { data, is_key }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }
}

/// One codec session. Calls are synchronous and never re-entered.
pub trait CodecEngine: Send {
    /// Opens the session for the given geometry and initial rates.
    fn configure(&mut self, config: &EngineConfig) -> anyhow::Result<()>;

    /// Submits one planar image. `force_key_frame` asks for an IDR.
    fn encode(&mut self, image: &I420Buffer, timestamp: u32, force_key_frame: bool)
    -> anyhow::Result<()>;

    /// Pulls the next compressed packet. `Ok(None)` means the session
    /// wants more input before it can produce output.
    fn receive_packet(&mut self) -> anyhow::Result<Option<CompressedPacket>>;

    /// Hot-updates the target bitrate without reopening the session.
    fn set_bitrate(&mut self, bps: u32);

    /// Hot-updates the framerate without reopening the session.
    fn set_framerate(&mut self, fps: f64);

    /// Releases every native resource. Must tolerate repeated calls.
    fn destroy(&mut self);

    fn implementation_name(&self) -> &str {
        "unknown"
    }

    fn is_hardware_accelerated(&self) -> bool {
        false
    }
}

/// Creates engine sessions, one per layer.
pub trait EngineFactory: Send {
    fn create(&self, codec_type: VideoCodecType) -> anyhow::Result<Box<dyn CodecEngine>>;
}

impl<F> EngineFactory for F
where
    F: Fn(VideoCodecType) -> anyhow::Result<Box<dyn CodecEngine>> + Send,
{
    fn create(&self, codec_type: VideoCodecType) -> anyhow::Result<Box<dyn CodecEngine>> {
        self(codec_type)
    }
}

/// Emits each submitted image as its packed I420 bytes.
#[derive(Debug, Default)]
pub struct RawEngine {
    config: Option<EngineConfig>,
    pending: Option<CompressedPacket>,
    frames_since_key: u32,
}

impl RawEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> Option<&EngineConfig> {
        self.config.as_ref()
    }
}

impl CodecEngine for RawEngine {
    fn configure(&mut self, config: &EngineConfig) -> anyhow::Result<()> {
        if config.width == 0 || config.height == 0 {
            anyhow::bail!("invalid video size {}x{}", config.width, config.height);
        }
        if config.pixel_format != PixelFormat::I420 {
            anyhow::bail!("unsupported pixel format {}", config.pixel_format.name());
        }
        self.config = Some(config.clone());
        self.pending = None;
        self.frames_since_key = 0;
        Ok(())
    }

    fn encode(
        &mut self,
        image: &I420Buffer,
        _timestamp: u32,
        force_key_frame: bool,
    ) -> anyhow::Result<()> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("raw engine not configured"))?;
        if image.width() != config.width || image.height() != config.height {
            anyhow::bail!(
                "image {}x{} does not match session {}x{}",
                image.width(),
                image.height(),
                config.width,
                config.height
            );
        }

        let interval_elapsed =
            config.key_frame_interval > 0 && self.frames_since_key >= config.key_frame_interval;
        // A fresh session always opens on a key frame.
        let is_key = force_key_frame || interval_elapsed || self.frames_since_key == 0;
        self.frames_since_key = if is_key { 1 } else { self.frames_since_key + 1 };
        self.pending = Some(CompressedPacket::new(image.to_packed_bytes(), is_key));
        Ok(())
    }

    fn receive_packet(&mut self) -> anyhow::Result<Option<CompressedPacket>> {
        Ok(self.pending.take())
    }

    fn set_bitrate(&mut self, bps: u32) {
        if let Some(config) = self.config.as_mut() {
            config.target_bitrate_bps = bps;
        }
    }

    fn set_framerate(&mut self, fps: f64) {
        if let Some(config) = self.config.as_mut() {
            config.framerate = fps;
        }
    }

    fn destroy(&mut self) {
        self.config = None;
        self.pending = None;
    }

    fn implementation_name(&self) -> &str {
        "raw"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RawEngineFactory;

impl EngineFactory for RawEngineFactory {
    fn create(&self, _codec_type: VideoCodecType) -> anyhow::Result<Box<dyn CodecEngine>> {
        Ok(Box::new(RawEngine::new()))
    }
}
