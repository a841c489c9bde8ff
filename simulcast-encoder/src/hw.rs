//! Hardware-accelerated encoder discovery.
//!
//! Hardware encoders (NVENC/VAAPI/QSV/V4L2M2M) are tried first, callers
//! fall back to the software encoder when none is present or it fails to
//! open.

use crate::codec::VideoCodecType;

/// Software encoder used when no hardware encoder can be opened.
pub fn software_encoder_name(codec_type: VideoCodecType) -> &'static str {
    match codec_type {
        VideoCodecType::H264 => "libx264",
        VideoCodecType::H265 => "libx265",
    }
}

fn hw_encoder_names(codec_type: VideoCodecType) -> &'static [&'static str] {
    match codec_type {
        VideoCodecType::H264 => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        VideoCodecType::H265 => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
    }
}

pub fn is_hw_encoder_name(codec_name: &str) -> bool {
    codec_name.contains("nvenc")
        || codec_name.contains("vaapi")
        || codec_name.contains("qsv")
        || codec_name.contains("v4l2m2m")
}

/// Returns the first available hardware encoder for `codec_type`.
pub fn find_hw_encoder(codec_type: VideoCodecType) -> Option<ffmpeg_next::Codec> {
    for name in hw_encoder_names(codec_type) {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

pub fn find_sw_encoder(codec_type: VideoCodecType) -> anyhow::Result<ffmpeg_next::Codec> {
    let name = software_encoder_name(codec_type);
    ffmpeg_next::encoder::find_by_name(name)
        .ok_or_else(|| anyhow::anyhow!("codec not found: {}", name))
}
