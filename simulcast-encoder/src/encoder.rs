//! Multi-layer (simulcast) encoder.
//!
//! One input frame is converted once to I420 and fanned out to one codec
//! engine session per simulcast layer. Layers are ordered by descending
//! resolution: layer 0 is the full-resolution stream and encodes straight
//! from the converted input, every other layer encodes from its downscale
//! buffer.

use log::{debug, error, info, trace, warn};

use crate::codec::{
    EncoderConfig, EncoderSettings, MAX_SIMULCAST_STREAMS, ScalabilityMode, VideoCodec,
};
use crate::downscale::DownscalePool;
use crate::engine::{EngineConfig, EngineFactory, RawEngineFactory};
use crate::error::{CodecError, CodecResult};
use crate::frame::{I420Buffer, PixelFormat, VideoFrame, VideoFrameType};
use crate::layer::{Layer, LayerConfig};
use crate::packet::{CodecSpecificInfo, EncodedImageCallback, NoQpParser, QpParser};
use crate::rate::{RateAllocator, RateControlParameters, SimulcastRateAllocator};
use crate::scaler::{ImageUtility, SoftwareImageUtility};
use crate::simulcast::{DefaultSimulcastValidator, SimulcastValidator, number_of_simulcast_streams};
use crate::svc::create_scalability_structure;

pub const LOW_H264_QP_THRESHOLD: i32 = 24;
pub const HIGH_H264_QP_THRESHOLD: i32 = 37;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpThresholds {
    pub low: i32,
    pub high: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub implementation_name: String,
    pub scaling_settings: Option<QpThresholds>,
    pub is_hardware_accelerated: bool,
    pub supports_native_handle: bool,
    pub supports_simulcast: bool,
    pub preferred_pixel_formats: Vec<PixelFormat>,
}

/// Init and error events, each reported at most once per encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderEvents {
    pub init_reported: bool,
    pub error_reported: bool,
    pub init_attempts: u32,
    pub errors: u32,
}

/// What happened to one layer during the last `encode` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerOutcome {
    /// Layer is paused.
    Skipped,
    /// Engine wants more input before producing a packet.
    Deferred,
    /// Engine produced an empty payload.
    Dropped,
    Delivered { size: usize, key_frame: bool },
    Failed,
}

pub struct MultiLayerEncoder {
    config: EncoderConfig,
    engine_factory: Box<dyn EngineFactory>,
    image: Box<dyn ImageUtility>,
    rate_allocator: Box<dyn RateAllocator>,
    validator: Box<dyn SimulcastValidator>,
    qp_parser: Box<dyn QpParser>,
    callback: Option<Box<dyn EncodedImageCallback>>,

    codec: VideoCodec,
    settings: EncoderSettings,
    layers: Vec<Layer>,
    downscale: DownscalePool,
    outcomes: Vec<LayerOutcome>,
    events: EncoderEvents,
}

impl MultiLayerEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        info!(
            "creating {} multi-layer encoder, packetization mode {:?}",
            config.codec_type.name(),
            config.packetization_mode
        );
        Self {
            config,
            engine_factory: Box::new(RawEngineFactory),
            image: Box::new(SoftwareImageUtility::new()),
            rate_allocator: Box::new(SimulcastRateAllocator::new()),
            validator: Box::new(DefaultSimulcastValidator),
            qp_parser: Box::new(NoQpParser),
            callback: None,
            codec: VideoCodec::default(),
            settings: EncoderSettings::default(),
            layers: Vec::with_capacity(MAX_SIMULCAST_STREAMS),
            downscale: DownscalePool::new(),
            outcomes: Vec::with_capacity(MAX_SIMULCAST_STREAMS),
            events: EncoderEvents::default(),
        }
    }

    pub fn with_engine_factory(mut self, factory: impl EngineFactory + 'static) -> Self {
        self.engine_factory = Box::new(factory);
        self
    }

    pub fn with_image_utility(mut self, image: impl ImageUtility + 'static) -> Self {
        self.image = Box::new(image);
        self
    }

    pub fn with_rate_allocator(mut self, allocator: impl RateAllocator + 'static) -> Self {
        self.rate_allocator = Box::new(allocator);
        self
    }

    pub fn with_simulcast_validator(mut self, validator: impl SimulcastValidator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    pub fn with_qp_parser(mut self, parser: impl QpParser + 'static) -> Self {
        self.qp_parser = Box::new(parser);
        self
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn codec(&self) -> &VideoCodec {
        &self.codec
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn is_initialized(&self) -> bool {
        !self.layers.is_empty()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer_config(&self, index: usize) -> Option<&LayerConfig> {
        self.layers.get(index).map(Layer::config)
    }

    pub fn num_downscale_buffers(&self) -> usize {
        self.downscale.len()
    }

    pub fn downscale_buffer(&self, layer_index: usize) -> Option<&I420Buffer> {
        self.downscale.buffer(layer_index)
    }

    /// Per-layer results of the last `encode` call, in layer order. Layers
    /// after a hard failure have no entry.
    pub fn last_layer_outcomes(&self) -> &[LayerOutcome] {
        &self.outcomes
    }

    pub fn events(&self) -> EncoderEvents {
        self.events
    }

    pub fn register_encode_complete_callback(
        &mut self,
        callback: impl EncodedImageCallback + 'static,
    ) -> CodecResult {
        self.callback = Some(Box::new(callback));
        Ok(())
    }

    pub fn init_encode(&mut self, codec: &VideoCodec, settings: &EncoderSettings) -> CodecResult {
        self.report_init();

        if !self.config.enabled {
            error!("{} encoding is disabled", self.config.codec_type.name());
            return self.fail(CodecError::InvalidParameter);
        }
        if codec.codec_type != self.config.codec_type {
            error!(
                "codec type mismatch: got {}, expected {}",
                codec.codec_type.name(),
                self.config.codec_type.name()
            );
            return self.fail(CodecError::InvalidParameter);
        }
        if codec.max_framerate == 0 {
            error!("invalid max framerate 0");
            return self.fail(CodecError::InvalidParameter);
        }
        if codec.width < 1 || codec.height < 1 {
            error!("invalid video size {}x{}", codec.width, codec.height);
            return self.fail(CodecError::InvalidParameter);
        }

        self.release()?;

        let num_streams = number_of_simulcast_streams(codec);
        if num_streams > MAX_SIMULCAST_STREAMS
            || (num_streams > 1 && !self.validator.is_valid(codec, num_streams))
        {
            warn!("simulcast parameters not supported for {} streams", num_streams);
            return Err(CodecError::SimulcastParametersUnsupported);
        }

        self.settings = *settings;
        self.codec = codec.clone();

        for i in 0..num_streams {
            let simulcast_index = num_streams - 1 - i;
            let stream = self.codec.simulcast_stream(simulcast_index);

            let mut config = LayerConfig::new(simulcast_index, stream.width, stream.height);
            config.max_framerate = self.codec.max_framerate as f64;
            config.frame_dropping_on = self.codec.frame_drop_enabled;
            config.key_frame_interval = self.codec.key_frame_interval;
            config.num_temporal_layers = self
                .codec
                .number_of_temporal_layers
                .max(stream.number_of_temporal_layers);
            config.max_bitrate_bps = self.codec.max_bitrate_kbps.saturating_mul(1000);
            config.target_bitrate_bps = self.codec.start_bitrate_kbps.saturating_mul(1000);

            let controller = match config.num_temporal_layers {
                0 => None,
                n => match ScalabilityMode::from_temporal_layers(n) {
                    Some(mode) => Some(create_scalability_structure(mode)),
                    None => panic!("unsupported number of temporal layers: {}", n),
                },
            };

            let engine_config = EngineConfig {
                codec_type: self.codec.codec_type,
                width: config.width,
                height: config.height,
                framerate: config.max_framerate,
                target_bitrate_bps: config.target_bitrate_bps,
                max_bitrate_bps: config.max_bitrate_bps,
                pixel_format: PixelFormat::I420,
                key_frame_interval: config.key_frame_interval,
                number_of_cores: self.settings.number_of_cores,
                ..Default::default()
            };
            let engine = self
                .engine_factory
                .create(self.codec.codec_type)
                .and_then(|mut engine| {
                    engine.configure(&engine_config)?;
                    Ok(engine)
                });
            let engine = match engine {
                Ok(engine) => engine,
                Err(e) => {
                    error!(
                        "failed to open engine for layer {} ({}x{}): {:#}",
                        i, config.width, config.height, e
                    );
                    self.clear();
                    return self.fail(CodecError::EncoderUnavailable);
                }
            };
            debug!(
                "layer {} simulcast_index {} {}x{} opened with {} engine, {} temporal layers",
                i,
                simulcast_index,
                config.width,
                config.height,
                engine.implementation_name(),
                config.num_temporal_layers
            );

            if i > 0 {
                self.downscale.allocate(config.width, config.height);
            }
            self.layers.push(Layer::new(config, engine, controller));
        }

        let framerate = self.codec.max_framerate as f64;
        let allocation = self.rate_allocator.allocate(
            &self.codec,
            self.codec.start_bitrate_kbps.saturating_mul(1000),
            framerate,
        );
        self.set_rates(&RateControlParameters::new(allocation, framerate));

        info!(
            "initialized {} encoder with {} layer(s), {}x{} @ {} fps",
            self.codec.codec_type.name(),
            self.layers.len(),
            self.codec.width,
            self.codec.height,
            self.codec.max_framerate
        );
        Ok(())
    }

    pub fn set_rates(&mut self, parameters: &RateControlParameters) {
        if self.layers.is_empty() {
            warn!("set_rates() while uninitialized");
            return;
        }
        if !(parameters.framerate_fps.is_finite() && parameters.framerate_fps >= 1.0) {
            warn!("invalid frame rate: {}", parameters.framerate_fps);
            return;
        }

        if parameters.bitrate.get_sum_bps() == 0 {
            debug!("encoder paused, turning off all layers");
            for layer in self.layers.iter_mut() {
                layer.pause();
            }
            return;
        }

        self.codec.max_framerate = parameters.framerate_fps as u32;
        for layer in self.layers.iter_mut() {
            let bps = parameters
                .bitrate
                .get_spatial_layer_sum(layer.simulcast_index());
            layer.update_rates(bps, parameters.framerate_fps);
            trace!(
                "simulcast_index {} target {} bps, sending {}",
                layer.simulcast_index(),
                bps,
                layer.is_sending()
            );
        }
    }

    /// Encodes `frame` on every sending layer, delivering each produced
    /// image before moving to the next layer. A hard failure stops the
    /// remaining layers; images already delivered in the same call stand.
    pub fn encode(
        &mut self,
        frame: &VideoFrame,
        frame_types: Option<&[VideoFrameType]>,
    ) -> CodecResult {
        self.outcomes.clear();

        if self.layers.is_empty() {
            return self.fail(CodecError::Uninitialized);
        }
        if self.callback.is_none() {
            warn!(
                "init_encode() has been called, but no callback has been set with register_encode_complete_callback()"
            );
            return self.fail(CodecError::Uninitialized);
        }

        let source = match self.image.to_i420(frame.buffer()) {
            Ok(source) => source,
            Err(e) => {
                error!(
                    "failed to convert {} image to I420: {:#}",
                    frame.buffer().pixel_format().name(),
                    e
                );
                return self.fail(CodecError::EncoderFailure);
            }
        };
        let (top_width, top_height) = {
            let top = self.layers[0].config();
            (top.width, top.height)
        };
        if source.width() != top_width || source.height() != top_height {
            error!(
                "input frame {}x{} does not match configured size {}x{}",
                source.width(),
                source.height(),
                top_width,
                top_height
            );
            return self.fail(CodecError::EncoderFailure);
        }

        let codec_type = self.config.codec_type;
        let packetization_mode = self.config.packetization_mode;

        for i in 0..self.layers.len() {
            let layer = &mut self.layers[i];
            if !layer.is_sending() {
                self.outcomes.push(LayerOutcome::Skipped);
                continue;
            }

            let picture = if i == 0 {
                Ok(&*source)
            } else {
                self.downscale.refresh(i, &source, self.image.as_mut())
            };
            let key_hint = frame_types
                .and_then(|types| types.get(layer.simulcast_index()))
                .is_some_and(|t| *t == VideoFrameType::Key);

            let packet = match picture.and_then(|p| layer.encode(p, frame.timestamp(), key_hint)) {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    trace!("layer {} deferred output", i);
                    self.outcomes.push(LayerOutcome::Deferred);
                    continue;
                }
                Err(e) => {
                    error!("failed to encode frame on layer {}: {:#}", i, e);
                    self.outcomes.push(LayerOutcome::Failed);
                    return self.fail(CodecError::EncoderFailure);
                }
            };

            let size = packet.size();
            let key_frame = packet.is_key();
            let qp = if size > 0 {
                self.qp_parser
                    .parse(codec_type, packet.data())
                    .unwrap_or(-1)
            } else {
                -1
            };
            layer.populate_image(packet, frame, qp);

            // Empty payload: the engine dropped the frame to save bandwidth.
            if size == 0 {
                self.outcomes.push(LayerOutcome::Dropped);
                continue;
            }

            let temporal = layer.next_temporal_info(key_frame);
            let mut info = CodecSpecificInfo::new(codec_type, packetization_mode);
            info.temporal_idx = temporal.temporal_idx;
            info.base_layer_sync = temporal.base_layer_sync;
            info.idr_frame = key_frame;

            if let Some(callback) = self.callback.as_mut() {
                callback.on_encoded_image(layer.image(), &info);
            }
            self.outcomes.push(LayerOutcome::Delivered { size, key_frame });
        }

        Ok(())
    }

    /// Destroys every engine session and clears all per-layer state.
    pub fn release(&mut self) -> CodecResult {
        if !self.layers.is_empty() {
            debug!("releasing {} layer(s)", self.layers.len());
        }
        self.clear();
        Ok(())
    }

    pub fn encoder_info(&self) -> EncoderInfo {
        let engine = self.layers.first().and_then(Layer::engine);
        EncoderInfo {
            implementation_name: engine
                .map(|e| e.implementation_name().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            scaling_settings: Some(QpThresholds {
                low: LOW_H264_QP_THRESHOLD,
                high: HIGH_H264_QP_THRESHOLD,
            }),
            is_hardware_accelerated: engine.is_some_and(|e| e.is_hardware_accelerated()),
            supports_native_handle: false,
            supports_simulcast: true,
            preferred_pixel_formats: vec![PixelFormat::I420],
        }
    }

    fn clear(&mut self) {
        // Highest index first, mirroring construction order.
        while let Some(mut layer) = self.layers.pop() {
            layer.destroy();
        }
        self.downscale.clear();
        self.outcomes.clear();
    }

    fn fail(&mut self, err: CodecError) -> CodecResult {
        self.report_error();
        Err(err)
    }

    fn report_init(&mut self) {
        self.events.init_attempts += 1;
        if self.events.init_reported {
            return;
        }
        self.events.init_reported = true;
        info!("{} encoder init event", self.config.codec_type.name());
    }

    fn report_error(&mut self) {
        self.events.errors += 1;
        if self.events.error_reported {
            return;
        }
        self.events.error_reported = true;
        warn!("{} encoder error event", self.config.codec_type.name());
    }
}

impl Drop for MultiLayerEncoder {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
