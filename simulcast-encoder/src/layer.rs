//! One simulcast layer: its configuration, its codec engine session, its
//! scalability controller and its reusable output image, owned together so
//! that rate updates never need to recreate the session.

use crate::engine::{CodecEngine, CompressedPacket};
use crate::frame::{I420Buffer, VideoFrame, VideoFrameType};
use crate::packet::EncodedImage;
use crate::svc::{NO_TEMPORAL_IDX, ScalabilityController};

#[derive(Debug, Clone, PartialEq)]
pub struct LayerConfig {
    /// Identity used for rate allocation and receiver-side stream lookup.
    /// Layer 0 (highest resolution) carries `num_layers - 1`.
    pub simulcast_index: usize,
    pub width: u32,
    pub height: u32,
    pub sending: bool,
    pub key_frame_request: bool,
    pub max_framerate: f64,
    pub target_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
    pub frame_dropping_on: bool,
    pub key_frame_interval: u32,
    pub num_temporal_layers: u8,
}

impl LayerConfig {
    pub fn new(simulcast_index: usize, width: u32, height: u32) -> Self {
        Self {
            simulcast_index,
            width,
            height,
            sending: false,
            key_frame_request: false,
            max_framerate: 0.0,
            target_bitrate_bps: 0,
            max_bitrate_bps: 0,
            frame_dropping_on: false,
            key_frame_interval: 0,
            num_temporal_layers: 1,
        }
    }

    /// paused -> sending raises a key frame request; every other
    /// transition only records the new state.
    pub fn set_stream_state(&mut self, send_stream: bool) {
        if send_stream && !self.sending {
            self.key_frame_request = true;
        }
        self.sending = send_stream;
    }
}

/// Temporal metadata attached to one produced frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalInfo {
    pub temporal_idx: u8,
    pub base_layer_sync: bool,
}

pub struct Layer {
    config: LayerConfig,
    engine: Option<Box<dyn CodecEngine>>,
    controller: Option<Box<dyn ScalabilityController>>,
    image: EncodedImage,
    tl0sync_limit: u8,
}

impl Layer {
    pub fn new(
        config: LayerConfig,
        engine: Box<dyn CodecEngine>,
        controller: Option<Box<dyn ScalabilityController>>,
    ) -> Self {
        let image = EncodedImage::new(config.width, config.height);
        let tl0sync_limit = config.num_temporal_layers;
        Self {
            config,
            engine: Some(engine),
            controller,
            image,
            tl0sync_limit,
        }
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn simulcast_index(&self) -> usize {
        self.config.simulcast_index
    }

    pub fn is_sending(&self) -> bool {
        self.config.sending
    }

    pub fn has_controller(&self) -> bool {
        self.controller.is_some()
    }

    pub fn engine(&self) -> Option<&dyn CodecEngine> {
        self.engine.as_deref()
    }

    pub fn image(&self) -> &EncodedImage {
        &self.image
    }

    /// Applies a new bitrate share. A zero share pauses the layer and leaves
    /// the engine untouched.
    pub fn update_rates(&mut self, bitrate_bps: u32, framerate: f64) {
        self.config.target_bitrate_bps = bitrate_bps;
        self.config.max_framerate = framerate;

        if bitrate_bps == 0 {
            self.config.set_stream_state(false);
            return;
        }

        self.config.set_stream_state(true);
        if let Some(engine) = self.engine.as_mut() {
            engine.set_bitrate(bitrate_bps);
            engine.set_framerate(framerate);
        }
    }

    pub fn pause(&mut self) {
        self.config.set_stream_state(false);
    }

    /// Pushes one image through the engine and pulls at most one packet.
    /// The pending key frame request is consumed once the engine accepted
    /// the image.
    pub fn encode(
        &mut self,
        source: &I420Buffer,
        timestamp: u32,
        key_frame_hint: bool,
    ) -> anyhow::Result<Option<CompressedPacket>> {
        let engine = self.engine.as_mut().ok_or_else(|| {
            anyhow::anyhow!("layer {} has no engine session", self.config.simulcast_index)
        })?;
        let force_key_frame = self.config.key_frame_request || key_frame_hint;
        engine.encode(source, timestamp, force_key_frame)?;
        self.config.key_frame_request = false;
        engine.receive_packet()
    }

    /// Overwrites the reusable output image with `packet` and the frame
    /// metadata of `input`.
    pub fn populate_image(
        &mut self,
        packet: CompressedPacket,
        input: &VideoFrame,
        qp: i32,
    ) -> &EncodedImage {
        self.image.encoded_width = self.config.width;
        self.image.encoded_height = self.config.height;
        self.image.timestamp = input.timestamp();
        self.image.capture_time_ms = input.render_time_ms();
        self.image.color_space = input.color_space();
        self.image.frame_type = if packet.is_key() {
            VideoFrameType::Key
        } else {
            VideoFrameType::Delta
        };
        self.image.spatial_index = Some(self.config.simulcast_index);
        self.image.qp = qp;
        self.image.data = packet.data().clone();
        &self.image
    }

    /// Advances the scalability controller for a produced frame.
    pub fn next_temporal_info(&mut self, is_key: bool) -> TemporalInfo {
        let Some(controller) = self.controller.as_mut() else {
            return TemporalInfo {
                temporal_idx: NO_TEMPORAL_IDX,
                base_layer_sync: false,
            };
        };

        let tid = controller.next_temporal_idx(is_key);
        let base_layer_sync = tid > 0 && tid < self.tl0sync_limit;
        if base_layer_sync {
            self.tl0sync_limit = tid;
        }
        if tid == 0 {
            self.tl0sync_limit = self.config.num_temporal_layers;
        }
        TemporalInfo {
            temporal_idx: tid,
            base_layer_sync,
        }
    }

    /// Tears down the engine session. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.destroy();
        }
        self.controller = None;
    }
}

impl Drop for Layer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("config", &self.config)
            .field("has_engine", &self.engine.is_some())
            .field("has_controller", &self.controller.is_some())
            .finish()
    }
}
