//! Multi-layer (simulcast) video encoding.
//!
//! [`MultiLayerEncoder`] drives one codec engine session per simulcast
//! layer from a single input frame; [`task::EncoderTask`] runs it on a
//! blocking worker for async hosts.

pub mod codec;
pub mod downscale;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod frame;
pub mod layer;
pub mod packet;
pub mod rate;
pub mod scaler;
pub mod simulcast;
pub mod svc;
pub mod task;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
#[cfg(feature = "ffmpeg")]
pub mod hw;

pub use codec::{
    EncoderConfig, EncoderSettings, H264PacketizationMode, ScalabilityMode, SimulcastStream,
    VideoCodec, VideoCodecType,
};
pub use encoder::{EncoderEvents, EncoderInfo, LayerOutcome, MultiLayerEncoder};
pub use engine::{CodecEngine, CompressedPacket, EngineConfig, EngineFactory, RawEngineFactory};
pub use error::{CodecError, CodecResult};
pub use frame::{FrameBuffer, I420Buffer, PixelFormat, VideoFrame, VideoFrameType};
pub use packet::{CodecSpecificInfo, EncodedImage, EncodedImageCallback};
pub use rate::{BitrateAllocation, RateControlParameters};
