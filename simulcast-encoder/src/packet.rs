use std::fmt::{Display, Formatter};

use bytes::Bytes;

use crate::codec::{H264PacketizationMode, VideoCodecType};
use crate::frame::{ColorSpace, VideoFrameType};
use crate::svc::NO_TEMPORAL_IDX;

/// Per-layer encoder output. One instance per layer is reused across
/// frames; callbacks must copy what they need before returning.
#[derive(Debug, Clone, Default)]
pub struct EncodedImage {
    pub data: Bytes,
    pub encoded_width: u32,
    pub encoded_height: u32,
    // 90 kHz RTP timestamp, copied from the input frame
    pub timestamp: u32,
    /// Render time of the input frame in milliseconds.
    pub capture_time_ms: i64,
    pub color_space: Option<ColorSpace>,
    pub frame_type: VideoFrameType,
    /// Simulcast index of the layer that produced this image.
    pub spatial_index: Option<usize>,
    /// -1 when the bitstream QP is unknown.
    pub qp: i32,
}

impl EncodedImage {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            encoded_width: width,
            encoded_height: height,
            qp: -1,
            ..Default::default()
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_key(&self) -> bool {
        self.frame_type == VideoFrameType::Key
    }
}

impl Display for EncodedImage {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "EncodedImage size: {}, width: {}, height: {}, timestamp: {}, frame_type: {:?}, spatial_index: {:?}, qp: {}",
            self.data.len(),
            self.encoded_width,
            self.encoded_height,
            self.timestamp,
            self.frame_type,
            self.spatial_index,
            self.qp
        )
    }
}

/// Codec-specific metadata delivered with every encoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecSpecificInfo {
    pub codec_type: VideoCodecType,
    pub packetization_mode: H264PacketizationMode,
    pub temporal_idx: u8,
    pub idr_frame: bool,
    pub base_layer_sync: bool,
}

impl CodecSpecificInfo {
    pub fn new(codec_type: VideoCodecType, packetization_mode: H264PacketizationMode) -> Self {
        Self {
            codec_type,
            packetization_mode,
            temporal_idx: NO_TEMPORAL_IDX,
            idr_frame: false,
            base_layer_sync: false,
        }
    }

    pub fn has_temporal_idx(&self) -> bool {
        self.temporal_idx != NO_TEMPORAL_IDX
    }
}

/// Receives encoded images synchronously, in layer index order.
pub trait EncodedImageCallback: Send {
    fn on_encoded_image(&mut self, image: &EncodedImage, info: &CodecSpecificInfo);
}

impl<F> EncodedImageCallback for F
where
    F: FnMut(&EncodedImage, &CodecSpecificInfo) + Send,
{
    fn on_encoded_image(&mut self, image: &EncodedImage, info: &CodecSpecificInfo) {
        self(image, info)
    }
}

/// Best-effort slice QP extraction from an encoded payload.
pub trait QpParser: Send {
    fn parse(&mut self, codec_type: VideoCodecType, payload: &[u8]) -> Option<i32>;
}

/// Never knows the QP.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoQpParser;

impl QpParser for NoQpParser {
    fn parse(&mut self, _codec_type: VideoCodecType, _payload: &[u8]) -> Option<i32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_image_has_unknown_qp() {
        let image = EncodedImage::new(640, 360);
        assert_eq!(image.qp, -1);
        assert_eq!(image.size(), 0);
        assert!(!image.is_key());
        assert!(image.to_string().contains("width: 640"));
    }

    #[test]
    fn test_default_info_has_no_temporal_idx() {
        let info = CodecSpecificInfo::new(VideoCodecType::H264, H264PacketizationMode::NonInterleaved);
        assert!(!info.has_temporal_idx());
        assert!(!info.base_layer_sync);
    }
}
