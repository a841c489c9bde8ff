use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// RTP video clock rate.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    I420,
    Nv12,
    Bgra,
    Rgba,
}

impl PixelFormat {
    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::I420 => "i420",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Bgra => "bgra",
            PixelFormat::Rgba => "rgba",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorRange {
    #[default]
    Invalid,
    Limited,
    Full,
    Derived,
}

/// Color description carried alongside a frame. The encoder copies it to
/// its output verbatim and never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColorSpace {
    // ISO/IEC 23001-8 ColourPrimaries
    pub primaries: u8,
    // ISO/IEC 23001-8 TransferCharacteristics
    pub transfer: u8,
    // ISO/IEC 23001-8 MatrixCoefficients
    pub matrix: u8,
    pub range: ColorRange,
}

impl ColorSpace {
    pub const BT709_LIMITED: ColorSpace = ColorSpace {
        primaries: 1,
        transfer: 1,
        matrix: 1,
        range: ColorRange::Limited,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoFrameType {
    #[default]
    Empty,
    Key,
    Delta,
}

/// Planar 4:2:0 image, the canonical format every codec engine consumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct I420Buffer {
    width: u32,
    height: u32,
    stride_y: usize,
    stride_u: usize,
    stride_v: usize,
    data_y: Vec<u8>,
    data_u: Vec<u8>,
    data_v: Vec<u8>,
}

impl I420Buffer {
    /// Allocates a tightly packed buffer filled with black.
    pub fn new(width: u32, height: u32) -> Self {
        let chroma_width = chroma_size(width);
        Self::blank(width, height, width as usize, chroma_width, chroma_width)
    }

    pub fn with_strides(
        width: u32,
        height: u32,
        stride_y: usize,
        stride_u: usize,
        stride_v: usize,
    ) -> anyhow::Result<Self> {
        let chroma_width = chroma_size(width);
        if stride_y < width as usize || stride_u < chroma_width || stride_v < chroma_width {
            anyhow::bail!(
                "invalid strides {}/{}/{} for {}x{}",
                stride_y,
                stride_u,
                stride_v,
                width,
                height
            );
        }
        Ok(Self::blank(width, height, stride_y, stride_u, stride_v))
    }

    fn blank(width: u32, height: u32, stride_y: usize, stride_u: usize, stride_v: usize) -> Self {
        let chroma_height = chroma_size(height);
        Self {
            width,
            height,
            stride_y,
            stride_u,
            stride_v,
            data_y: vec![0; stride_y * height as usize],
            data_u: vec![128; stride_u * chroma_height],
            data_v: vec![128; stride_v * chroma_height],
        }
    }

    /// Wraps tightly packed planes.
    pub fn from_planes(
        width: u32,
        height: u32,
        y: Vec<u8>,
        u: Vec<u8>,
        v: Vec<u8>,
    ) -> anyhow::Result<Self> {
        if width == 0 || height == 0 {
            anyhow::bail!("invalid video size {}x{}", width, height);
        }
        let luma = width as usize * height as usize;
        let chroma = chroma_size(width) * chroma_size(height);
        if y.len() < luma || u.len() < chroma || v.len() < chroma {
            anyhow::bail!(
                "plane sizes {}/{}/{} too small for {}x{}",
                y.len(),
                u.len(),
                v.len(),
                width,
                height
            );
        }
        Ok(Self {
            width,
            height,
            stride_y: width as usize,
            stride_u: chroma_size(width),
            stride_v: chroma_size(width),
            data_y: y,
            data_u: u,
            data_v: v,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn chroma_width(&self) -> u32 {
        chroma_size(self.width) as u32
    }

    pub fn chroma_height(&self) -> u32 {
        chroma_size(self.height) as u32
    }

    pub fn stride_y(&self) -> usize {
        self.stride_y
    }

    pub fn stride_u(&self) -> usize {
        self.stride_u
    }

    pub fn stride_v(&self) -> usize {
        self.stride_v
    }

    pub fn data_y(&self) -> &[u8] {
        &self.data_y
    }

    pub fn data_u(&self) -> &[u8] {
        &self.data_u
    }

    pub fn data_v(&self) -> &[u8] {
        &self.data_v
    }

    pub fn is_packed(&self) -> bool {
        self.stride_y == self.width as usize
            && self.stride_u == chroma_size(self.width)
            && self.stride_v == chroma_size(self.width)
    }

    /// Mutable access to all three planes at once.
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        (&mut self.data_y, &mut self.data_u, &mut self.data_v)
    }

    /// Copies the visible area into a contiguous Y, U, V byte string.
    pub fn to_packed_bytes(&self) -> Bytes {
        let (w, h) = (self.width as usize, self.height as usize);
        let (cw, ch) = (chroma_size(self.width), chroma_size(self.height));
        let mut out = Vec::with_capacity(w * h + 2 * cw * ch);
        copy_rows(&self.data_y, self.stride_y, w, h, &mut out);
        copy_rows(&self.data_u, self.stride_u, cw, ch, &mut out);
        copy_rows(&self.data_v, self.stride_v, cw, ch, &mut out);
        Bytes::from(out)
    }
}

fn copy_rows(src: &[u8], stride: usize, width: usize, height: usize, out: &mut Vec<u8>) {
    for row in src.chunks(stride).take(height) {
        out.extend_from_slice(&row[..width]);
    }
}

pub fn chroma_size(luma: u32) -> usize {
    luma.div_ceil(2) as usize
}

/// Semi-planar 4:2:0 image with interleaved chroma.
#[derive(Clone, Debug)]
pub struct Nv12Buffer {
    pub width: u32,
    pub height: u32,
    pub stride_y: usize,
    pub stride_uv: usize,
    pub data_y: Bytes,
    pub data_uv: Bytes,
}

/// Single-plane 32-bit RGB image.
#[derive(Clone, Debug)]
pub struct PackedBuffer {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub data: Bytes,
}

#[derive(Clone, Debug)]
pub enum FrameBuffer {
    I420(I420Buffer),
    Nv12(Nv12Buffer),
    Bgra(PackedBuffer),
    Rgba(PackedBuffer),
}

impl FrameBuffer {
    pub fn width(&self) -> u32 {
        match self {
            FrameBuffer::I420(b) => b.width(),
            FrameBuffer::Nv12(b) => b.width,
            FrameBuffer::Bgra(b) | FrameBuffer::Rgba(b) => b.width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            FrameBuffer::I420(b) => b.height(),
            FrameBuffer::Nv12(b) => b.height,
            FrameBuffer::Bgra(b) | FrameBuffer::Rgba(b) => b.height,
        }
    }

    pub fn pixel_format(&self) -> PixelFormat {
        match self {
            FrameBuffer::I420(_) => PixelFormat::I420,
            FrameBuffer::Nv12(_) => PixelFormat::Nv12,
            FrameBuffer::Bgra(_) => PixelFormat::Bgra,
            FrameBuffer::Rgba(_) => PixelFormat::Rgba,
        }
    }
}

/// Raw input frame handed to the encoder.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    buffer: FrameBuffer,
    // 90 kHz RTP timestamp
    timestamp: u32,
    render_time_ms: i64,
    color_space: Option<ColorSpace>,
}

impl VideoFrame {
    pub fn new(buffer: FrameBuffer, timestamp: u32) -> Self {
        Self {
            buffer,
            timestamp,
            render_time_ms: 0,
            color_space: None,
        }
    }

    pub fn with_color_space(mut self, color_space: ColorSpace) -> Self {
        self.color_space = Some(color_space);
        self
    }

    pub fn with_render_time_ms(mut self, render_time_ms: i64) -> Self {
        self.render_time_ms = render_time_ms;
        self
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp as u64 * 1000 / VIDEO_CLOCK_RATE as u64
    }

    pub fn render_time_ms(&self) -> i64 {
        self.render_time_ms
    }

    pub fn color_space(&self) -> Option<ColorSpace> {
        self.color_space
    }
}

impl Display for VideoFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "VideoFrame width: {}, height: {}, format: {}, timestamp: {}, render_time_ms: {}",
            self.width(),
            self.height(),
            self.buffer.pixel_format().name(),
            self.timestamp,
            self.render_time_ms
        )
    }
}
