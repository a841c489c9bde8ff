//! FFmpeg-backed codec engine.

use bytes::Bytes;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::{Dictionary, Rational, picture};

use crate::codec::VideoCodecType;
use crate::engine::{CodecEngine, CompressedPacket, EngineConfig, EngineFactory};
use crate::frame::{I420Buffer, PixelFormat, chroma_size};
use crate::hw::{find_hw_encoder, find_sw_encoder, is_hw_encoder_name, software_encoder_name};

/// Registers FFmpeg components. Call once at startup.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub struct FfmpegEngine {
    encoder: Option<ffmpeg_next::codec::encoder::Video>,
    codec_name: String,
    hardware: bool,
}

// The codec context is only ever touched by the layer that owns it.
unsafe impl Send for FfmpegEngine {}

impl FfmpegEngine {
    pub fn new() -> Self {
        Self {
            encoder: None,
            codec_name: String::new(),
            hardware: false,
        }
    }

    fn open_encoder(
        ctx: ffmpeg_next::codec::Context,
        config: &EngineConfig,
        software: bool,
    ) -> anyhow::Result<ffmpeg_next::codec::encoder::Video> {
        let mut encoder = ctx.encoder().video()?;
        encoder.set_width(config.width);
        encoder.set_height(config.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_frame_rate(Some(Rational::new(config.framerate.round().max(1.0) as i32, 1)));
        encoder.set_time_base(Rational::new(1, config.clock_rate as i32));
        encoder.set_bit_rate(config.target_bitrate_bps as usize);
        if config.max_bitrate_bps > 0 {
            encoder.set_max_bit_rate(config.max_bitrate_bps as usize);
        }
        if config.key_frame_interval > 0 {
            encoder.set_gop(config.key_frame_interval);
        }

        let mut opts = Dictionary::new();
        if software {
            opts.set("preset", "ultrafast");
            opts.set("tune", "zerolatency");
        }
        opts.set("threads", &config.number_of_cores.max(1).to_string());
        Ok(encoder.open_with(opts)?)
    }
}

impl Default for FfmpegEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecEngine for FfmpegEngine {
    fn configure(&mut self, config: &EngineConfig) -> anyhow::Result<()> {
        if config.pixel_format != PixelFormat::I420 {
            anyhow::bail!("unsupported pixel format {}", config.pixel_format.name());
        }
        self.destroy();

        let software = software_encoder_name(config.codec_type);
        let open_software = || -> anyhow::Result<ffmpeg_next::codec::encoder::Video> {
            let codec = find_sw_encoder(config.codec_type)?;
            Self::open_encoder(ffmpeg_next::codec::Context::new_with_codec(codec), config, true)
        };

        // Try hardware encoder first, then fall back to software encoder.
        let (encoder, name) = match find_hw_encoder(config.codec_type) {
            Some(hw_codec) => {
                let hw_name = hw_codec.name().to_string();
                log::info!("attempting hardware encoder: {}", hw_name);
                match Self::open_encoder(
                    ffmpeg_next::codec::Context::new_with_codec(hw_codec),
                    config,
                    false,
                ) {
                    Ok(encoder) => (encoder, hw_name),
                    Err(e) => {
                        log::warn!(
                            "hardware encoder {} failed: {}, falling back to {}",
                            hw_name,
                            e,
                            software
                        );
                        (open_software()?, software.to_string())
                    }
                }
            }
            None => {
                log::info!("no hardware encoder found, using software encoder: {}", software);
                (open_software()?, software.to_string())
            }
        };

        log::info!(
            "encoder opened successfully: {} {}x{} @ {} bps",
            name,
            config.width,
            config.height,
            config.target_bitrate_bps
        );
        self.hardware = is_hw_encoder_name(&name);
        self.encoder = Some(encoder);
        self.codec_name = name;
        Ok(())
    }

    fn encode(
        &mut self,
        image: &I420Buffer,
        timestamp: u32,
        force_key_frame: bool,
    ) -> anyhow::Result<()> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("encoder not opened"))?;
        let mut frame = av_frame_from_i420(image);
        frame.set_pts(Some(timestamp as i64));
        if force_key_frame {
            frame.set_kind(picture::Type::I);
        }
        encoder.send_frame(&frame)?;
        Ok(())
    }

    fn receive_packet(&mut self) -> anyhow::Result<Option<CompressedPacket>> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("encoder not opened"))?;
        let mut packet = ffmpeg_next::codec::packet::Packet::empty();
        match encoder.receive_packet(&mut packet) {
            Ok(()) => Ok(Some(CompressedPacket::new(
                Bytes::copy_from_slice(packet.data().unwrap_or_default()),
                packet.is_key(),
            ))),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set_bitrate(&mut self, bps: u32) {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.set_bit_rate(bps as usize);
        }
    }

    fn set_framerate(&mut self, fps: f64) {
        if let Some(encoder) = self.encoder.as_mut() {
            let rate: ffmpeg_next::ffi::AVRational = Rational::new(fps.round().max(1.0) as i32, 1).into();
            // No safe setter exists once the context is open.
            unsafe {
                (*encoder.as_mut_ptr()).framerate = rate;
            }
        }
    }

    fn destroy(&mut self) {
        if self.encoder.take().is_some() {
            log::debug!("closed encoder {}", self.codec_name);
        }
    }

    fn implementation_name(&self) -> &str {
        "FFmpeg"
    }

    fn is_hardware_accelerated(&self) -> bool {
        self.hardware
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegEngineFactory;

impl EngineFactory for FfmpegEngineFactory {
    fn create(&self, _codec_type: VideoCodecType) -> anyhow::Result<Box<dyn CodecEngine>> {
        Ok(Box::new(FfmpegEngine::new()))
    }
}

/// Copies an I420 image into a newly allocated YUV420P frame.
pub fn av_frame_from_i420(buffer: &I420Buffer) -> ffmpeg_next::frame::Video {
    let mut frame = ffmpeg_next::frame::Video::new(Pixel::YUV420P, buffer.width(), buffer.height());
    let planes = [
        (buffer.data_y(), buffer.stride_y(), buffer.width() as usize, buffer.height() as usize),
        (buffer.data_u(), buffer.stride_u(), buffer.chroma_width() as usize, buffer.chroma_height() as usize),
        (buffer.data_v(), buffer.stride_v(), buffer.chroma_width() as usize, buffer.chroma_height() as usize),
    ];
    for (index, (src, src_stride, width, height)) in planes.into_iter().enumerate() {
        let dst_stride = frame.stride(index);
        let dst = frame.data_mut(index);
        for (d, s) in dst.chunks_mut(dst_stride).zip(src.chunks(src_stride)).take(height) {
            d[..width].copy_from_slice(&s[..width]);
        }
    }
    frame
}

/// Copies raw planes with the given strides into a new frame of `format`.
pub fn av_frame_from_planes(
    format: Pixel,
    width: u32,
    height: u32,
    planes: &[(&[u8], usize)],
) -> anyhow::Result<ffmpeg_next::frame::Video> {
    let mut frame = ffmpeg_next::frame::Video::new(format, width, height);
    if planes.len() != frame.planes() {
        anyhow::bail!(
            "{:?} expects {} planes, got {}",
            format,
            frame.planes(),
            planes.len()
        );
    }
    for (index, (src, src_stride)) in planes.iter().enumerate() {
        let rows = frame.plane_height(index) as usize;
        let dst_stride = frame.stride(index);
        let row_bytes = dst_stride.min(*src_stride);
        if rows > 0 && src.len() < src_stride * (rows - 1) + row_bytes {
            anyhow::bail!("plane {} too small for {}x{}", index, width, height);
        }
        let dst = frame.data_mut(index);
        for (d, s) in dst.chunks_mut(dst_stride).zip(src.chunks(*src_stride)).take(rows) {
            d[..row_bytes].copy_from_slice(&s[..row_bytes]);
        }
    }
    Ok(frame)
}

/// Copies the visible area of a YUV420P frame into a packed I420 buffer.
pub fn i420_from_av_frame(frame: &ffmpeg_next::frame::Video) -> anyhow::Result<I420Buffer> {
    if frame.format() != Pixel::YUV420P {
        anyhow::bail!("expected yuv420p frame, got {:?}", frame.format());
    }
    let (width, height) = (frame.width(), frame.height());
    let sizes = [
        (width as usize, height as usize),
        (chroma_size(width), chroma_size(height)),
        (chroma_size(width), chroma_size(height)),
    ];
    let mut planes: [Vec<u8>; 3] = Default::default();
    for (index, (plane_width, plane_height)) in sizes.into_iter().enumerate() {
        let out = &mut planes[index];
        out.reserve(plane_width * plane_height);
        for row in frame.data(index).chunks(frame.stride(index)).take(plane_height) {
            out.extend_from_slice(&row[..plane_width]);
        }
    }
    let [y, u, v] = planes;
    I420Buffer::from_planes(width, height, y, u, v)
}
