//! Image Utility: canonical format conversion and plane scaling.

use std::borrow::Cow;
use std::sync::Once;

use dcv_color_primitives as dcp;
use image::GrayImage;
use image::imageops::{self, FilterType};

use crate::frame::{FrameBuffer, I420Buffer, Nv12Buffer, PackedBuffer, chroma_size};

/// Pixel conversion and scaling used by the encoder. Implementations must
/// produce deterministic, correctly strided 4:2:0 output.
pub trait ImageUtility: Send {
    /// Converts any supported input to I420. I420 input is borrowed as-is.
    fn to_i420<'a>(&mut self, buffer: &'a FrameBuffer) -> anyhow::Result<Cow<'a, I420Buffer>>;

    /// Scales `src` into `dst`, keeping `dst`'s size and strides.
    fn scale(&mut self, src: &I420Buffer, dst: &mut I420Buffer) -> anyhow::Result<()>;
}

static DCP_INIT: Once = Once::new();

/// Pure software implementation: `dcv-color-primitives` for RGB sources,
/// `image` resampling for scaling.
pub struct SoftwareImageUtility {
    filter: FilterType,
    scratch: Vec<u8>,
}

impl SoftwareImageUtility {
    pub fn new() -> Self {
        DCP_INIT.call_once(dcp::initialize);
        Self {
            filter: FilterType::Triangle,
            scratch: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    fn nv12_to_i420(buffer: &Nv12Buffer) -> anyhow::Result<I420Buffer> {
        let (w, h) = (buffer.width as usize, buffer.height as usize);
        let (cw, ch) = (chroma_size(buffer.width), chroma_size(buffer.height));
        if w == 0 || h == 0 {
            anyhow::bail!("invalid video size {}x{}", w, h);
        }
        if buffer.stride_y < w || buffer.stride_uv < cw * 2 {
            anyhow::bail!(
                "nv12 strides {}/{} too small for {}x{}",
                buffer.stride_y,
                buffer.stride_uv,
                w,
                h
            );
        }
        if buffer.data_y.len() < buffer.stride_y * (h - 1) + w
            || buffer.data_uv.len() < buffer.stride_uv * (ch - 1) + cw * 2
        {
            anyhow::bail!("nv12 buffer too small for {}x{}", w, h);
        }

        let mut out = I420Buffer::new(buffer.width, buffer.height);
        let (y, u, v) = out.planes_mut();
        for (dst, src) in y.chunks_mut(w).zip(buffer.data_y.chunks(buffer.stride_y)) {
            dst.copy_from_slice(&src[..w]);
        }
        for row in 0..ch {
            let src = &buffer.data_uv[row * buffer.stride_uv..];
            for col in 0..cw {
                u[row * cw + col] = src[col * 2];
                v[row * cw + col] = src[col * 2 + 1];
            }
        }
        Ok(out)
    }

    fn rgb_to_i420(&mut self, buffer: &PackedBuffer, swap_rb: bool) -> anyhow::Result<I420Buffer> {
        let (w, h) = (buffer.width as usize, buffer.height as usize);
        if w == 0 || h == 0 {
            anyhow::bail!("invalid video size {}x{}", w, h);
        }
        if buffer.stride < w * 4 {
            anyhow::bail!("rgb stride {} too small for width {}", buffer.stride, w);
        }
        if buffer.data.len() < buffer.stride * (h - 1) + w * 4 {
            anyhow::bail!("rgb buffer too small for {}x{}", w, h);
        }

        // Repack into tightly packed BGRA.
        self.scratch.clear();
        for row in buffer.data.chunks(buffer.stride).take(h) {
            if swap_rb {
                for px in row[..w * 4].chunks_exact(4) {
                    self.scratch.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
                }
            } else {
                self.scratch.extend_from_slice(&row[..w * 4]);
            }
        }

        let src_format = dcp::ImageFormat {
            pixel_format: dcp::PixelFormat::Bgra,
            color_space: dcp::ColorSpace::Rgb,
            num_planes: 1,
        };
        let dst_format = dcp::ImageFormat {
            pixel_format: dcp::PixelFormat::I420,
            color_space: dcp::ColorSpace::Bt601,
            num_planes: 3,
        };

        let mut out = I420Buffer::new(buffer.width, buffer.height);
        let (y, u, v) = out.planes_mut();
        dcp::convert_image(
            buffer.width,
            buffer.height,
            &src_format,
            None,
            &[self.scratch.as_slice()],
            &dst_format,
            None,
            &mut [y, u, v],
        )?;
        Ok(out)
    }

    fn scale_plane(
        &self,
        src: &[u8],
        src_stride: usize,
        (src_w, src_h): (usize, usize),
        dst: &mut [u8],
        dst_stride: usize,
        (dst_w, dst_h): (usize, usize),
    ) -> anyhow::Result<()> {
        let mut packed = Vec::with_capacity(src_w * src_h);
        for row in src.chunks(src_stride).take(src_h) {
            packed.extend_from_slice(&row[..src_w]);
        }
        let plane = GrayImage::from_raw(src_w as u32, src_h as u32, packed)
            .ok_or_else(|| anyhow::anyhow!("source plane too small for {}x{}", src_w, src_h))?;
        let scaled = imageops::resize(&plane, dst_w as u32, dst_h as u32, self.filter);
        for (dst_row, src_row) in dst
            .chunks_mut(dst_stride)
            .zip(scaled.as_raw().chunks(dst_w))
            .take(dst_h)
        {
            dst_row[..dst_w].copy_from_slice(src_row);
        }
        Ok(())
    }
}

impl Default for SoftwareImageUtility {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageUtility for SoftwareImageUtility {
    fn to_i420<'a>(&mut self, buffer: &'a FrameBuffer) -> anyhow::Result<Cow<'a, I420Buffer>> {
        match buffer {
            FrameBuffer::I420(b) => Ok(Cow::Borrowed(b)),
            FrameBuffer::Nv12(b) => Ok(Cow::Owned(Self::nv12_to_i420(b)?)),
            FrameBuffer::Bgra(b) => Ok(Cow::Owned(self.rgb_to_i420(b, false)?)),
            FrameBuffer::Rgba(b) => Ok(Cow::Owned(self.rgb_to_i420(b, true)?)),
        }
    }

    fn scale(&mut self, src: &I420Buffer, dst: &mut I420Buffer) -> anyhow::Result<()> {
        let src_luma = (src.width() as usize, src.height() as usize);
        let dst_luma = (dst.width() as usize, dst.height() as usize);
        let src_chroma = (src.chroma_width() as usize, src.chroma_height() as usize);
        let dst_chroma = (dst.chroma_width() as usize, dst.chroma_height() as usize);
        let (dst_stride_y, dst_stride_u, dst_stride_v) =
            (dst.stride_y(), dst.stride_u(), dst.stride_v());

        let (y, u, v) = dst.planes_mut();
        self.scale_plane(src.data_y(), src.stride_y(), src_luma, y, dst_stride_y, dst_luma)?;
        self.scale_plane(src.data_u(), src.stride_u(), src_chroma, u, dst_stride_u, dst_chroma)?;
        self.scale_plane(src.data_v(), src.stride_v(), src_chroma, v, dst_stride_v, dst_chroma)?;
        Ok(())
    }
}

#[cfg(feature = "ffmpeg")]
pub use sws::SwsImageUtility;

#[cfg(feature = "ffmpeg")]
mod sws {
    use std::borrow::Cow;
    use std::collections::HashMap;

    use ffmpeg_next::format::Pixel;
    use ffmpeg_next::software::scaling::{Context, flag::Flags};

    use super::ImageUtility;
    use crate::ffmpeg::{av_frame_from_i420, av_frame_from_planes, i420_from_av_frame};
    use crate::frame::{FrameBuffer, I420Buffer};

    // Keyed by the raw AVPixelFormat value, `Pixel` is not hashable.
    type ScalerKey = (i32, u32, u32, u32, u32);

    pub struct Scaler {
        context: Context,
    }

    impl Scaler {
        pub fn new(context: Context) -> Self {
            Self { context }
        }

        pub fn run(
            &mut self,
            frame: &ffmpeg_next::frame::Video,
            dst: &mut ffmpeg_next::frame::Video,
        ) -> anyhow::Result<()> {
            self.context.run(frame, dst).map_err(|e| e.into())
        }
    }

    unsafe impl Send for Scaler {}

    /// FFmpeg `swscale` implementation. One scaling context is cached per
    /// (source format, source size, destination size).
    pub struct SwsImageUtility {
        scalers: HashMap<ScalerKey, Scaler>,
        flags: Flags,
    }

    impl SwsImageUtility {
        pub fn new() -> Self {
            Self {
                scalers: HashMap::new(),
                flags: Flags::BILINEAR,
            }
        }

        fn run(
            &mut self,
            src: &ffmpeg_next::frame::Video,
            dst_width: u32,
            dst_height: u32,
        ) -> anyhow::Result<I420Buffer> {
            let raw_format: ffmpeg_next::ffi::AVPixelFormat = src.format().into();
            let key = (raw_format as i32, src.width(), src.height(), dst_width, dst_height);
            if !self.scalers.contains_key(&key) {
                let context = Context::get(
                    src.format(),
                    src.width(),
                    src.height(),
                    Pixel::YUV420P,
                    dst_width,
                    dst_height,
                    self.flags,
                )?;
                self.scalers.insert(key, Scaler::new(context));
            }
            let scaler = self
                .scalers
                .get_mut(&key)
                .ok_or_else(|| anyhow::anyhow!("scaler missing for {:?}", key))?;
            let mut converted = ffmpeg_next::frame::Video::empty();
            scaler.run(src, &mut converted)?;
            i420_from_av_frame(&converted)
        }
    }

    impl Default for SwsImageUtility {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ImageUtility for SwsImageUtility {
        fn to_i420<'a>(
            &mut self,
            buffer: &'a FrameBuffer,
        ) -> anyhow::Result<Cow<'a, I420Buffer>> {
            let source = match buffer {
                FrameBuffer::I420(b) => return Ok(Cow::Borrowed(b)),
                FrameBuffer::Nv12(b) => av_frame_from_planes(
                    Pixel::NV12,
                    b.width,
                    b.height,
                    &[(&b.data_y[..], b.stride_y), (&b.data_uv[..], b.stride_uv)],
                )?,
                FrameBuffer::Bgra(b) => av_frame_from_planes(
                    Pixel::BGRA,
                    b.width,
                    b.height,
                    &[(&b.data[..], b.stride)],
                )?,
                FrameBuffer::Rgba(b) => av_frame_from_planes(
                    Pixel::RGBA,
                    b.width,
                    b.height,
                    &[(&b.data[..], b.stride)],
                )?,
            };
            let (w, h) = (source.width(), source.height());
            Ok(Cow::Owned(self.run(&source, w, h)?))
        }

        fn scale(&mut self, src: &I420Buffer, dst: &mut I420Buffer) -> anyhow::Result<()> {
            let source = av_frame_from_i420(src);
            let scaled = self.run(&source, dst.width(), dst.height())?;
            copy_into(&scaled, dst);
            Ok(())
        }
    }

    fn copy_into(src: &I420Buffer, dst: &mut I420Buffer) {
        let rows = [
            (src.height() as usize, src.width() as usize, src.stride_y(), dst.stride_y()),
            (src.chroma_height() as usize, src.chroma_width() as usize, src.stride_u(), dst.stride_u()),
            (src.chroma_height() as usize, src.chroma_width() as usize, src.stride_v(), dst.stride_v()),
        ];
        let src_planes = [src.data_y(), src.data_u(), src.data_v()];
        let (y, u, v) = dst.planes_mut();
        let dst_planes: [&mut [u8]; 3] = [y, u, v];
        for ((dst_plane, src_plane), (height, width, src_stride, dst_stride)) in
            dst_planes.into_iter().zip(src_planes).zip(rows)
        {
            for (d, s) in dst_plane
                .chunks_mut(dst_stride)
                .zip(src_plane.chunks(src_stride))
                .take(height)
            {
                d[..width].copy_from_slice(&s[..width]);
            }
        }
    }
}
