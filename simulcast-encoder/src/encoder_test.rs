use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::*;
use crate::codec::{H264PacketizationMode, SimulcastStream, VideoCodecType};
use crate::engine::{CodecEngine, CompressedPacket};
use crate::frame::{FrameBuffer, Nv12Buffer, PackedBuffer};
use crate::packet::EncodedImage;
use crate::rate::BitrateAllocation;
use crate::svc::NO_TEMPORAL_IDX;

#[derive(Debug, Clone, PartialEq)]
enum EngineCall {
    Configure { width: u32, height: u32 },
    Encode {
        width: u32,
        height: u32,
        timestamp: u32,
        force_key_frame: bool,
    },
    SetBitrate(u32),
    SetFramerate(f64),
    Destroy,
}

type CallLog = Arc<Mutex<Vec<(usize, EngineCall)>>>;

/// Per-session behaviour, keyed by creation order.
#[derive(Debug, Default)]
struct Script {
    // None defers output; missing entries produce 100 bytes
    packet_sizes: HashMap<usize, Option<usize>>,
    fail_configure: Option<usize>,
    fail_encode: Option<usize>,
}

struct MockEngine {
    id: usize,
    log: CallLog,
    script: Arc<Mutex<Script>>,
    pending: Option<CompressedPacket>,
}

impl MockEngine {
    fn record(&self, call: EngineCall) {
        self.log.lock().unwrap().push((self.id, call));
    }
}

impl CodecEngine for MockEngine {
    fn configure(&mut self, config: &EngineConfig) -> anyhow::Result<()> {
        self.record(EngineCall::Configure {
            width: config.width,
            height: config.height,
        });
        if self.script.lock().unwrap().fail_configure == Some(self.id) {
            anyhow::bail!("configure failed");
        }
        Ok(())
    }

    fn encode(
        &mut self,
        image: &I420Buffer,
        timestamp: u32,
        force_key_frame: bool,
    ) -> anyhow::Result<()> {
        self.record(EngineCall::Encode {
            width: image.width(),
            height: image.height(),
            timestamp,
            force_key_frame,
        });
        let script = self.script.lock().unwrap();
        if script.fail_encode == Some(self.id) {
            anyhow::bail!("encode failed");
        }
        let size = script.packet_sizes.get(&self.id).copied().unwrap_or(Some(100));
        self.pending =
            size.map(|size| CompressedPacket::new(Bytes::from(vec![0u8; size]), force_key_frame));
        Ok(())
    }

    fn receive_packet(&mut self) -> anyhow::Result<Option<CompressedPacket>> {
        Ok(self.pending.take())
    }

    fn set_bitrate(&mut self, bps: u32) {
        self.record(EngineCall::SetBitrate(bps));
    }

    fn set_framerate(&mut self, fps: f64) {
        self.record(EngineCall::SetFramerate(fps));
    }

    fn destroy(&mut self) {
        self.record(EngineCall::Destroy);
    }

    fn implementation_name(&self) -> &str {
        "mock"
    }
}

#[derive(Clone, Default)]
struct MockFactory {
    log: CallLog,
    script: Arc<Mutex<Script>>,
    next_id: Arc<AtomicUsize>,
}

impl EngineFactory for MockFactory {
    fn create(&self, _codec_type: VideoCodecType) -> anyhow::Result<Box<dyn CodecEngine>> {
        Ok(Box::new(MockEngine {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            log: self.log.clone(),
            script: self.script.clone(),
            pending: None,
        }))
    }
}

struct FixedQp(i32);

impl QpParser for FixedQp {
    fn parse(&mut self, _codec_type: VideoCodecType, _payload: &[u8]) -> Option<i32> {
        Some(self.0)
    }
}

type Delivered = Arc<Mutex<Vec<(EncodedImage, CodecSpecificInfo)>>>;

struct Harness {
    encoder: MultiLayerEncoder,
    factory: MockFactory,
    delivered: Delivered,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(EncoderConfig::new(VideoCodecType::H264))
    }

    fn with_config(config: EncoderConfig) -> Self {
        let factory = MockFactory::default();
        let encoder = MultiLayerEncoder::new(config).with_engine_factory(factory.clone());
        let mut harness = Self {
            encoder,
            factory,
            delivered: Arc::default(),
        };
        harness.register_callback();
        harness
    }

    fn register_callback(&mut self) {
        let sink = self.delivered.clone();
        self.encoder
            .register_encode_complete_callback(
                move |image: &EncodedImage, info: &CodecSpecificInfo| {
                    sink.lock().unwrap().push((image.clone(), *info));
                },
            )
            .unwrap();
    }

    fn calls(&self) -> Vec<(usize, EngineCall)> {
        self.factory.log.lock().unwrap().clone()
    }

    fn clear_calls(&self) {
        self.factory.log.lock().unwrap().clear();
    }

    fn encode_calls(&self) -> Vec<(usize, EngineCall)> {
        self.calls()
            .into_iter()
            .filter(|(_, call)| matches!(call, EngineCall::Encode { .. }))
            .collect()
    }

    fn delivered(&self) -> Vec<(EncodedImage, CodecSpecificInfo)> {
        self.delivered.lock().unwrap().clone()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.factory.script.lock().unwrap()
    }

    fn sending(&self) -> Vec<bool> {
        self.encoder.layers().iter().map(Layer::is_sending).collect()
    }

    /// Turns every layer on with distinct per-stream rates.
    fn send_all(&mut self) {
        self.encoder
            .set_rates(&RateControlParameters::new(allocation(&[150_000, 500_000, 1_500_000]), 30.0));
    }
}

fn three_layer_codec() -> VideoCodec {
    VideoCodec::builder()
        .resolution(1280, 720)
        .max_framerate(30)
        .start_bitrate_kbps(1000)
        .add_simulcast_stream(SimulcastStream::new(320, 180).bitrate_kbps(30, 150, 200))
        .add_simulcast_stream(SimulcastStream::new(640, 360).bitrate_kbps(150, 500, 700))
        .add_simulcast_stream(SimulcastStream::new(1280, 720).bitrate_kbps(600, 1500, 2500))
        .build()
}

fn allocation(per_stream_bps: &[u32]) -> BitrateAllocation {
    let mut allocation = BitrateAllocation::new();
    for (si, bps) in per_stream_bps.iter().enumerate() {
        allocation.set_bitrate(si, 0, *bps);
    }
    allocation
}

fn frame(width: u32, height: u32, timestamp: u32) -> VideoFrame {
    VideoFrame::new(FrameBuffer::I420(I420Buffer::new(width, height)), timestamp)
}

fn init_three(harness: &mut Harness) {
    harness
        .encoder
        .init_encode(&three_layer_codec(), &EncoderSettings::default())
        .unwrap();
}

// ===
// init_encode
// ===

#[test]
fn test_init_three_layers() {
    let mut h = Harness::new();
    init_three(&mut h);

    assert_eq!(h.encoder.num_layers(), 3);
    assert_eq!(h.encoder.num_downscale_buffers(), 2);
    let configures: Vec<_> = h
        .calls()
        .into_iter()
        .filter(|(_, call)| matches!(call, EngineCall::Configure { .. }))
        .collect();
    assert_eq!(
        configures,
        vec![
            (0, EngineCall::Configure { width: 1280, height: 720 }),
            (1, EngineCall::Configure { width: 640, height: 360 }),
            (2, EngineCall::Configure { width: 320, height: 180 }),
        ]
    );

    let sizes: Vec<(u32, u32)> = h
        .encoder
        .layers()
        .iter()
        .map(|l| (l.config().width, l.config().height))
        .collect();
    assert_eq!(sizes, vec![(1280, 720), (640, 360), (320, 180)]);
    assert_eq!(
        h.encoder.downscale_buffer(1).map(|b| (b.width(), b.height())),
        Some((640, 360))
    );
    assert_eq!(
        h.encoder.downscale_buffer(2).map(|b| (b.width(), b.height())),
        Some((320, 180))
    );
    assert!(h.encoder.downscale_buffer(0).is_none());
}

#[test]
fn test_simulcast_index_is_descending_permutation() {
    let mut h = Harness::new();
    init_three(&mut h);

    let indices: Vec<usize> = h.encoder.layers().iter().map(Layer::simulcast_index).collect();
    assert_eq!(indices, vec![2, 1, 0]);

    let mut sorted = indices.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![0, 1, 2]);

    let top = h.encoder.layer_config(0).unwrap();
    assert!(h
        .encoder
        .layers()
        .iter()
        .all(|l| l.config().width <= top.width && l.config().height <= top.height));
}

#[test]
fn test_init_applies_start_bitrate() {
    let mut h = Harness::new();
    init_three(&mut h);

    // 1000 kbps covers streams 0 and 1 only: 150 + 500, leftover tops
    // stream 1 up to its 700 kbps max.
    assert_eq!(h.sending(), vec![false, true, true]);
    assert_eq!(h.encoder.layer_config(1).unwrap().target_bitrate_bps, 700_000);
    assert_eq!(h.encoder.layer_config(2).unwrap().target_bitrate_bps, 150_000);
    assert!(h.encoder.layer_config(1).unwrap().key_frame_request);
    assert!(!h.encoder.layer_config(0).unwrap().key_frame_request);
    assert!(h.calls().contains(&(1, EngineCall::SetBitrate(700_000))));
    assert!(h.calls().contains(&(2, EngineCall::SetBitrate(150_000))));
}

#[test]
fn test_init_single_layer_without_simulcast() {
    let mut h = Harness::new();
    let codec = VideoCodec::builder()
        .resolution(640, 480)
        .start_bitrate_kbps(500)
        .build();
    h.encoder
        .init_encode(&codec, &EncoderSettings::default())
        .unwrap();

    assert_eq!(h.encoder.num_layers(), 1);
    assert_eq!(h.encoder.num_downscale_buffers(), 0);
    let layer = h.encoder.layer_config(0).unwrap();
    assert_eq!(layer.simulcast_index, 0);
    assert_eq!((layer.width, layer.height), (640, 480));
    assert!(layer.sending);
    assert_eq!(layer.target_bitrate_bps, 500_000);
}

#[test]
fn test_init_layer_bookkeeping() {
    let mut h = Harness::new();
    let mut codec = three_layer_codec();
    codec.key_frame_interval = 90;
    codec.frame_drop_enabled = false;
    codec.max_bitrate_kbps = 3000;
    codec.number_of_temporal_layers = 1;
    for stream in codec.simulcast_streams.iter_mut() {
        stream.number_of_temporal_layers = 2;
    }
    h.encoder.init_encode(&codec, &EncoderSettings::default()).unwrap();

    for layer in h.encoder.layers() {
        let config = layer.config();
        assert_eq!(config.key_frame_interval, 90);
        assert!(!config.frame_dropping_on);
        assert_eq!(config.max_bitrate_bps, 3_000_000);
        assert_eq!(config.num_temporal_layers, 2);
        assert!(layer.has_controller());
    }
}

#[test]
fn test_init_rejects_codec_mismatch() {
    let mut h = Harness::with_config(EncoderConfig::new(VideoCodecType::H265));
    let result = h.encoder.init_encode(&three_layer_codec(), &EncoderSettings::default());
    assert_eq!(result, Err(CodecError::InvalidParameter));
    assert_eq!(h.encoder.num_layers(), 0);
    assert!(h.calls().is_empty());
}

#[test]
fn test_init_rejects_disabled_codec() {
    let mut h = Harness::with_config(EncoderConfig::new(VideoCodecType::H264).disabled());
    let result = h.encoder.init_encode(&three_layer_codec(), &EncoderSettings::default());
    assert_eq!(result, Err(CodecError::InvalidParameter));
}

#[test]
fn test_init_rejects_bad_parameters() {
    let mut h = Harness::new();

    let mut codec = three_layer_codec();
    codec.max_framerate = 0;
    assert_eq!(
        h.encoder.init_encode(&codec, &EncoderSettings::default()),
        Err(CodecError::InvalidParameter)
    );

    let mut codec = three_layer_codec();
    codec.width = 0;
    assert_eq!(
        h.encoder.init_encode(&codec, &EncoderSettings::default()),
        Err(CodecError::InvalidParameter)
    );
    assert!(h.calls().is_empty());
}

#[test]
fn test_bad_parameters_keep_previous_session() {
    let mut h = Harness::new();
    init_three(&mut h);

    let mut codec = three_layer_codec();
    codec.height = 0;
    assert!(h.encoder.init_encode(&codec, &EncoderSettings::default()).is_err());
    assert_eq!(h.encoder.num_layers(), 3);
}

#[test]
fn test_init_simulcast_unsupported() {
    let factory = MockFactory::default();
    let mut encoder = MultiLayerEncoder::new(EncoderConfig::default())
        .with_engine_factory(factory.clone())
        .with_simulcast_validator(|_: &VideoCodec, _: usize| false);

    let result = encoder.init_encode(&three_layer_codec(), &EncoderSettings::default());
    assert_eq!(result, Err(CodecError::SimulcastParametersUnsupported));
    assert_eq!(encoder.num_layers(), 0);
    assert!(factory.log.lock().unwrap().is_empty());
}

#[test]
fn test_init_invalid_cascade_with_default_validator() {
    let mut h = Harness::new();
    let mut codec = three_layer_codec();
    codec.simulcast_streams[0].height = 240;
    assert_eq!(
        h.encoder.init_encode(&codec, &EncoderSettings::default()),
        Err(CodecError::SimulcastParametersUnsupported)
    );
}

#[test]
fn test_init_engine_failure_releases_everything() {
    let mut h = Harness::new();
    h.script().fail_configure = Some(1);

    let result = h.encoder.init_encode(&three_layer_codec(), &EncoderSettings::default());
    assert_eq!(result, Err(CodecError::EncoderUnavailable));
    assert_eq!(h.encoder.num_layers(), 0);
    assert_eq!(h.encoder.num_downscale_buffers(), 0);
    assert!(h.calls().contains(&(0, EngineCall::Destroy)));
    assert!(!h.calls().iter().any(|(id, _)| *id == 2));
    assert!(h.encoder.events().error_reported);
}

#[test]
fn test_factory_failure_is_unavailable() {
    let mut encoder = MultiLayerEncoder::new(EncoderConfig::default()).with_engine_factory(
        |_: VideoCodecType| -> anyhow::Result<Box<dyn CodecEngine>> {
            anyhow::bail!("no encoder")
        },
    );
    assert_eq!(
        encoder.init_encode(&three_layer_codec(), &EncoderSettings::default()),
        Err(CodecError::EncoderUnavailable)
    );
}

#[test]
fn test_reinit_releases_previous_sessions() {
    let mut h = Harness::new();
    init_three(&mut h);
    init_three(&mut h);

    let calls = h.calls();
    for id in 0..3 {
        assert!(calls.contains(&(id, EngineCall::Destroy)));
    }
    assert!(calls.contains(&(3, EngineCall::Configure { width: 1280, height: 720 })));
    assert_eq!(h.encoder.num_layers(), 3);
    assert_eq!(h.encoder.num_downscale_buffers(), 2);
    assert_eq!(h.encoder.events().init_attempts, 2);
}

#[test]
#[should_panic(expected = "unsupported number of temporal layers")]
fn test_too_many_temporal_layers_panics() {
    let mut h = Harness::new();
    let codec = VideoCodec::builder().resolution(320, 180).temporal_layers(4).build();
    let _ = h.encoder.init_encode(&codec, &EncoderSettings::default());
}

// ===
// release
// ===

#[test]
fn test_release_before_init() {
    let mut h = Harness::new();
    assert_eq!(h.encoder.release(), Ok(()));
    assert_eq!(h.encoder.release(), Ok(()));
    assert!(!h.encoder.is_initialized());
    assert!(h.calls().is_empty());
}

#[test]
fn test_release_twice() {
    let mut h = Harness::new();
    init_three(&mut h);

    assert_eq!(h.encoder.release(), Ok(()));
    assert_eq!(h.encoder.release(), Ok(()));
    assert_eq!(h.encoder.num_layers(), 0);
    assert_eq!(h.encoder.num_downscale_buffers(), 0);

    let destroys = h
        .calls()
        .iter()
        .filter(|(_, call)| *call == EngineCall::Destroy)
        .count();
    assert_eq!(destroys, 3);
}

#[test]
fn test_drop_destroys_sessions() {
    let h = Harness::new();
    let log = h.factory.log.clone();
    let mut encoder = h.encoder;
    encoder
        .init_encode(&three_layer_codec(), &EncoderSettings::default())
        .unwrap();
    drop(encoder);
    let destroys = log
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, call)| *call == EngineCall::Destroy)
        .count();
    assert_eq!(destroys, 3);
}

// ===
// set_rates
// ===

#[test]
fn test_set_rates_zero_pauses_without_engine_calls() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.send_all();
    h.clear_calls();

    h.encoder
        .set_rates(&RateControlParameters::new(BitrateAllocation::new(), 30.0));
    assert_eq!(h.sending(), vec![false, false, false]);
    assert!(h.calls().is_empty());
}

#[test]
fn test_set_rates_uninitialized_is_noop() {
    let mut h = Harness::new();
    h.send_all();
    assert!(h.calls().is_empty());
    assert!(!h.encoder.is_initialized());
}

#[test]
fn test_set_rates_rejects_low_framerate() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.clear_calls();
    let before = h.sending();

    h.encoder.set_rates(&RateControlParameters::new(
        allocation(&[150_000, 500_000, 1_500_000]),
        0.5,
    ));
    assert_eq!(h.sending(), before);
    assert!(h.calls().is_empty());
}

#[test]
fn test_set_rates_rejects_non_finite_framerate() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.clear_calls();
    let before = h.sending();

    for fps in [f64::NAN, f64::INFINITY] {
        h.encoder.set_rates(&RateControlParameters::new(
            allocation(&[100_000, 300_000, 900_000]),
            fps,
        ));
    }
    assert_eq!(h.sending(), before);
    assert!(h.calls().is_empty());
    assert_eq!(h.encoder.codec().max_framerate, 30);
}

#[test]
fn test_set_rates_uses_simulcast_index() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.send_all();
    h.clear_calls();

    h.encoder
        .set_rates(&RateControlParameters::new(allocation(&[0, 500_000, 1_500_000]), 25.0));

    // simulcast_index 0 is the last layer
    assert_eq!(h.sending(), vec![true, true, false]);
    assert_eq!(h.encoder.layer_config(0).unwrap().target_bitrate_bps, 1_500_000);
    assert_eq!(h.encoder.layer_config(1).unwrap().target_bitrate_bps, 500_000);
    assert_eq!(h.encoder.layer_config(2).unwrap().target_bitrate_bps, 0);
    assert_eq!(h.encoder.codec().max_framerate, 25);

    assert_eq!(
        h.calls(),
        vec![
            (0, EngineCall::SetBitrate(1_500_000)),
            (0, EngineCall::SetFramerate(25.0)),
            (1, EngineCall::SetBitrate(500_000)),
            (1, EngineCall::SetFramerate(25.0)),
        ]
    );
}

#[test]
fn test_set_rates_never_recreates_sessions() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.clear_calls();

    for _ in 0..3 {
        h.send_all();
        h.encoder
            .set_rates(&RateControlParameters::new(BitrateAllocation::new(), 30.0));
    }
    assert!(
        !h.calls()
            .iter()
            .any(|(_, call)| matches!(call, EngineCall::Configure { .. } | EngineCall::Destroy))
    );
    assert_eq!(h.factory.next_id.load(Ordering::SeqCst), 3);
}

// ===
// encode
// ===

#[test]
fn test_encode_delivers_every_layer() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.send_all();
    {
        let mut script = h.script();
        script.packet_sizes.insert(0, Some(500));
        script.packet_sizes.insert(1, Some(200));
        script.packet_sizes.insert(2, Some(80));
    }

    let input = frame(1280, 720, 90_000).with_render_time_ms(1_000);
    assert_eq!(h.encoder.encode(&input, None), Ok(()));

    let delivered = h.delivered();
    assert_eq!(delivered.len(), 3);
    let sizes: Vec<usize> = delivered.iter().map(|(image, _)| image.size()).collect();
    assert_eq!(sizes, vec![500, 200, 80]);
    for ((image, _), layer) in delivered.iter().zip(h.encoder.layers()) {
        assert_eq!(image.spatial_index, Some(layer.simulcast_index()));
        assert_eq!(image.timestamp, 90_000);
        assert_eq!(image.capture_time_ms, 1_000);
        assert_eq!(
            (image.encoded_width, image.encoded_height),
            (layer.config().width, layer.config().height)
        );
        assert_eq!(image.qp, -1);
    }
    assert_eq!(
        h.encoder.last_layer_outcomes(),
        &[
            LayerOutcome::Delivered { size: 500, key_frame: true },
            LayerOutcome::Delivered { size: 200, key_frame: true },
            LayerOutcome::Delivered { size: 80, key_frame: true },
        ]
    );
}

#[test]
fn test_lower_layers_encode_downscaled_images() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.send_all();
    h.clear_calls();

    h.encoder.encode(&frame(1280, 720, 3000), None).unwrap();

    let sizes: Vec<(usize, u32, u32)> = h
        .encode_calls()
        .into_iter()
        .filter_map(|(id, call)| match call {
            EngineCall::Encode { width, height, timestamp, .. } => {
                assert_eq!(timestamp, 3000);
                Some((id, width, height))
            }
            _ => None,
        })
        .collect();
    assert_eq!(sizes, vec![(0, 1280, 720), (1, 640, 360), (2, 320, 180)]);
}

#[test]
fn test_encode_skips_zero_size_payload() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.send_all();
    h.script().packet_sizes.insert(1, Some(0));

    assert_eq!(h.encoder.encode(&frame(1280, 720, 0), None), Ok(()));

    let delivered = h.delivered();
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|(image, _)| image.size() > 0));
    assert_eq!(h.encoder.last_layer_outcomes()[1], LayerOutcome::Dropped);
}

#[test]
fn test_deferred_output_is_not_an_error() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.send_all();
    h.script().packet_sizes.insert(0, None);

    assert_eq!(h.encoder.encode(&frame(1280, 720, 0), None), Ok(()));
    assert_eq!(h.delivered().len(), 2);
    assert_eq!(h.encoder.last_layer_outcomes()[0], LayerOutcome::Deferred);
}

#[test]
fn test_failure_keeps_earlier_deliveries() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.send_all();
    h.script().fail_encode = Some(2);

    assert_eq!(
        h.encoder.encode(&frame(1280, 720, 0), None),
        Err(CodecError::EncoderFailure)
    );
    assert_eq!(h.delivered().len(), 2);
    assert_eq!(
        h.encoder.last_layer_outcomes(),
        &[
            LayerOutcome::Delivered { size: 100, key_frame: true },
            LayerOutcome::Delivered { size: 100, key_frame: true },
            LayerOutcome::Failed,
        ]
    );
}

#[test]
fn test_failure_stops_remaining_layers() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.send_all();
    h.script().fail_encode = Some(1);
    h.clear_calls();

    assert_eq!(
        h.encoder.encode(&frame(1280, 720, 0), None),
        Err(CodecError::EncoderFailure)
    );
    assert_eq!(h.delivered().len(), 1);
    assert!(!h.encode_calls().iter().any(|(id, _)| *id == 2));
    assert_eq!(h.encoder.last_layer_outcomes().len(), 2);
}

#[test]
fn test_encode_uninitialized() {
    let mut h = Harness::new();
    assert_eq!(
        h.encoder.encode(&frame(1280, 720, 0), None),
        Err(CodecError::Uninitialized)
    );
    assert!(h.encoder.events().error_reported);
}

#[test]
fn test_encode_without_callback() {
    let factory = MockFactory::default();
    let mut encoder =
        MultiLayerEncoder::new(EncoderConfig::default()).with_engine_factory(factory.clone());
    encoder
        .init_encode(&three_layer_codec(), &EncoderSettings::default())
        .unwrap();
    assert_eq!(
        encoder.encode(&frame(1280, 720, 0), None),
        Err(CodecError::Uninitialized)
    );
}

#[test]
fn test_encode_with_all_layers_paused() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.encoder
        .set_rates(&RateControlParameters::new(BitrateAllocation::new(), 30.0));
    h.clear_calls();

    assert_eq!(h.encoder.encode(&frame(1280, 720, 0), None), Ok(()));
    assert!(h.delivered().is_empty());
    assert!(h.calls().is_empty());
    assert_eq!(
        h.encoder.last_layer_outcomes(),
        &[LayerOutcome::Skipped, LayerOutcome::Skipped, LayerOutcome::Skipped]
    );
}

#[test]
fn test_conversion_failure_aborts_call() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.send_all();
    h.clear_calls();

    let broken = VideoFrame::new(
        FrameBuffer::Bgra(PackedBuffer {
            width: 1280,
            height: 720,
            stride: 1280 * 4,
            data: Bytes::from_static(&[0u8; 16]),
        }),
        0,
    );
    assert_eq!(h.encoder.encode(&broken, None), Err(CodecError::EncoderFailure));
    assert!(h.encode_calls().is_empty());
    assert!(h.delivered().is_empty());
}

#[test]
fn test_malformed_input_is_failure() {
    let mut h = Harness::new();
    let codec = VideoCodec::builder()
        .resolution(4, 4)
        .start_bitrate_kbps(500)
        .build();
    h.encoder
        .init_encode(&codec, &EncoderSettings::default())
        .unwrap();
    h.clear_calls();

    let nv12 = |height: u32, stride_y: usize| {
        FrameBuffer::Nv12(Nv12Buffer {
            width: 4,
            height,
            stride_y,
            stride_uv: 4,
            data_y: Bytes::from_static(&[0u8; 16]),
            data_uv: Bytes::from_static(&[0u8; 8]),
        })
    };
    let inputs = [
        FrameBuffer::Bgra(PackedBuffer {
            width: 4,
            height: 4,
            stride: 8,
            data: Bytes::from_static(&[0u8; 64]),
        }),
        nv12(4, 2),
        nv12(0, 4),
    ];
    for buffer in inputs {
        let input = VideoFrame::new(buffer, 0);
        assert_eq!(h.encoder.encode(&input, None), Err(CodecError::EncoderFailure));
    }
    assert!(h.encode_calls().is_empty());
    assert!(h.delivered().is_empty());
}

#[test]
fn test_input_size_mismatch_is_failure() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.send_all();
    assert_eq!(
        h.encoder.encode(&frame(640, 360, 0), None),
        Err(CodecError::EncoderFailure)
    );
    assert!(h.encode_calls().is_empty());
}

// ===
// key frames and codec specific info
// ===

#[test]
fn test_resumed_layer_forces_key_frame_once() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.send_all();
    h.encoder.encode(&frame(1280, 720, 0), None).unwrap();
    assert!(h.encoder.layers().iter().all(|l| !l.config().key_frame_request));

    h.encoder
        .set_rates(&RateControlParameters::new(allocation(&[0, 500_000, 1_500_000]), 30.0));
    h.send_all();
    assert!(h.encoder.layer_config(2).unwrap().key_frame_request);
    assert!(!h.encoder.layer_config(0).unwrap().key_frame_request);
    h.clear_calls();

    h.encoder.encode(&frame(1280, 720, 3000), None).unwrap();
    let forced: Vec<(usize, bool)> = h
        .encode_calls()
        .into_iter()
        .filter_map(|(id, call)| match call {
            EngineCall::Encode { force_key_frame, .. } => Some((id, force_key_frame)),
            _ => None,
        })
        .collect();
    assert_eq!(forced, vec![(0, false), (1, false), (2, true)]);

    let delivered = h.delivered();
    let last = &delivered[delivered.len() - 1];
    assert!(last.0.is_key());
    assert!(last.1.idr_frame);
}

#[test]
fn test_key_frame_hint_by_simulcast_index() {
    let mut h = Harness::new();
    init_three(&mut h);
    h.send_all();
    h.encoder.encode(&frame(1280, 720, 0), None).unwrap();
    h.clear_calls();

    let hints = [VideoFrameType::Delta, VideoFrameType::Key, VideoFrameType::Delta];
    h.encoder
        .encode(&frame(1280, 720, 3000), Some(&hints))
        .unwrap();
    let forced: Vec<bool> = h
        .encode_calls()
        .into_iter()
        .map(|(_, call)| matches!(call, EngineCall::Encode { force_key_frame: true, .. }))
        .collect();
    // simulcast_index 1 is the middle layer
    assert_eq!(forced, vec![false, true, false]);
}

#[test]
fn test_codec_specific_info() {
    let mut h = Harness::with_config(EncoderConfig {
        packetization_mode: H264PacketizationMode::NonInterleaved,
        ..EncoderConfig::default()
    });
    init_three(&mut h);
    h.send_all();
    h.encoder.encode(&frame(1280, 720, 0), None).unwrap();
    h.encoder.encode(&frame(1280, 720, 3000), None).unwrap();

    let delivered = h.delivered();
    assert_eq!(delivered.len(), 6);
    for (i, (image, info)) in delivered.iter().enumerate() {
        assert_eq!(info.codec_type, VideoCodecType::H264);
        assert_eq!(info.packetization_mode, H264PacketizationMode::NonInterleaved);
        assert_eq!(info.temporal_idx, 0);
        assert!(!info.base_layer_sync);
        assert_eq!(info.idr_frame, i < 3);
        assert_eq!(image.is_key(), i < 3);
    }
}

#[test]
fn test_no_temporal_layers_reports_no_temporal_idx() {
    let mut h = Harness::new();
    let codec = VideoCodec::builder()
        .resolution(320, 180)
        .temporal_layers(0)
        .build();
    h.encoder.init_encode(&codec, &EncoderSettings::default()).unwrap();
    assert!(!h.encoder.layers()[0].has_controller());

    h.encoder.encode(&frame(320, 180, 0), None).unwrap();
    let delivered = h.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].1.temporal_idx, NO_TEMPORAL_IDX);
    assert!(!delivered[0].1.has_temporal_idx());
}

#[test]
fn test_three_temporal_layers_pattern() {
    let mut h = Harness::new();
    let codec = VideoCodec::builder()
        .resolution(320, 180)
        .temporal_layers(3)
        .build();
    h.encoder.init_encode(&codec, &EncoderSettings::default()).unwrap();

    for i in 0..5 {
        h.encoder.encode(&frame(320, 180, i * 3000), None).unwrap();
    }
    let pattern: Vec<(u8, bool)> = h
        .delivered()
        .iter()
        .map(|(_, info)| (info.temporal_idx, info.base_layer_sync))
        .collect();
    assert_eq!(
        pattern,
        vec![(0, false), (2, true), (1, true), (2, false), (0, false)]
    );
}

#[test]
fn test_qp_parser_result_is_attached() {
    let factory = MockFactory::default();
    let delivered: Delivered = Arc::default();
    let sink = delivered.clone();
    let mut encoder = MultiLayerEncoder::new(EncoderConfig::default())
        .with_engine_factory(factory)
        .with_qp_parser(FixedQp(31));
    encoder
        .register_encode_complete_callback(move |image: &EncodedImage, info: &CodecSpecificInfo| {
            sink.lock().unwrap().push((image.clone(), *info));
        })
        .unwrap();
    let codec = VideoCodec::builder().resolution(320, 180).build();
    encoder.init_encode(&codec, &EncoderSettings::default()).unwrap();
    encoder.encode(&frame(320, 180, 0), None).unwrap();

    assert_eq!(delivered.lock().unwrap()[0].0.qp, 31);
}

// ===
// encoder_info and events
// ===

#[test]
fn test_encoder_info() {
    let mut h = Harness::new();
    assert_eq!(h.encoder.encoder_info().implementation_name, "unknown");

    init_three(&mut h);
    let info = h.encoder.encoder_info();
    assert_eq!(info.implementation_name, "mock");
    assert_eq!(info.scaling_settings, Some(QpThresholds { low: 24, high: 37 }));
    assert!(info.supports_simulcast);
    assert!(!info.is_hardware_accelerated);
    assert!(!info.supports_native_handle);
    assert_eq!(info.preferred_pixel_formats, vec![PixelFormat::I420]);
}

#[test]
fn test_events_latch() {
    let mut h = Harness::new();
    let mut codec = three_layer_codec();
    codec.max_framerate = 0;
    let _ = h.encoder.init_encode(&codec, &EncoderSettings::default());
    let _ = h.encoder.init_encode(&codec, &EncoderSettings::default());

    let events = h.encoder.events();
    assert!(events.init_reported);
    assert!(events.error_reported);
    assert_eq!(events.init_attempts, 2);
    assert_eq!(events.errors, 2);
}

#[test]
fn test_raw_engine_default_factory() {
    let delivered: Delivered = Arc::default();
    let sink = delivered.clone();
    let mut encoder = MultiLayerEncoder::new(EncoderConfig::default());
    encoder
        .register_encode_complete_callback(move |image: &EncodedImage, info: &CodecSpecificInfo| {
            sink.lock().unwrap().push((image.clone(), *info));
        })
        .unwrap();
    let codec = VideoCodec::builder()
        .resolution(64, 36)
        .start_bitrate_kbps(2000)
        .add_simulcast_stream(SimulcastStream::new(32, 18).bitrate_kbps(30, 100, 200))
        .add_simulcast_stream(SimulcastStream::new(64, 36).bitrate_kbps(100, 300, 600))
        .build();
    encoder.init_encode(&codec, &EncoderSettings::default()).unwrap();
    assert_eq!(encoder.encoder_info().implementation_name, "raw");

    encoder.encode(&frame(64, 36, 0), None).unwrap();
    let delivered = delivered.lock().unwrap();
    let sizes: Vec<usize> = delivered.iter().map(|(image, _)| image.size()).collect();
    assert_eq!(sizes, vec![64 * 36 + 2 * 32 * 18, 32 * 18 + 2 * 16 * 9]);
}

#[test]
fn test_odd_size_cascade() {
    let delivered: Delivered = Arc::default();
    let sink = delivered.clone();
    let mut encoder = MultiLayerEncoder::new(EncoderConfig::default())
        .with_simulcast_validator(|_: &VideoCodec, _: usize| true);
    encoder
        .register_encode_complete_callback(move |image: &EncodedImage, info: &CodecSpecificInfo| {
            sink.lock().unwrap().push((image.clone(), *info));
        })
        .unwrap();
    let codec = VideoCodec::builder()
        .resolution(9, 5)
        .start_bitrate_kbps(3000)
        .add_simulcast_stream(SimulcastStream::new(3, 2).bitrate_kbps(30, 100, 200))
        .add_simulcast_stream(SimulcastStream::new(5, 3).bitrate_kbps(100, 300, 600))
        .add_simulcast_stream(SimulcastStream::new(9, 5).bitrate_kbps(300, 1000, 2000))
        .build();
    encoder.init_encode(&codec, &EncoderSettings::default()).unwrap();

    let downscaled = encoder.downscale_buffer(1).unwrap();
    assert_eq!((downscaled.chroma_width(), downscaled.chroma_height()), (3, 2));
    let downscaled = encoder.downscale_buffer(2).unwrap();
    assert_eq!((downscaled.chroma_width(), downscaled.chroma_height()), (2, 1));

    encoder.encode(&frame(9, 5, 0), None).unwrap();
    let delivered = delivered.lock().unwrap();
    let sizes: Vec<usize> = delivered.iter().map(|(image, _)| image.size()).collect();
    assert_eq!(sizes, vec![9 * 5 + 2 * 5 * 3, 5 * 3 + 2 * 3 * 2, 3 * 2 + 2 * 2 * 1]);
    let dims: Vec<(u32, u32)> = delivered
        .iter()
        .map(|(image, _)| (image.encoded_width, image.encoded_height))
        .collect();
    assert_eq!(dims, vec![(9, 5), (5, 3), (3, 2)]);
}
