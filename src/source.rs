use bytes::Bytes;
use simulcast_encoder::frame::{
    ColorSpace, FrameBuffer, I420Buffer, Nv12Buffer, PackedBuffer, VIDEO_CLOCK_RATE, VideoFrame,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SourceFormat {
    I420,
    Nv12,
    Bgra,
}

/// Moving gradient test pattern.
pub struct TestSource {
    width: u32,
    height: u32,
    fps: u32,
    format: SourceFormat,
    index: u32,
}

impl TestSource {
    pub fn new(width: u32, height: u32, fps: u32, format: SourceFormat) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
            format,
            index: 0,
        }
    }

    pub fn next_frame(&mut self) -> VideoFrame {
        let (w, h) = (self.width as usize, self.height as usize);
        let shift = self.index as usize * 4;
        let luma: Vec<u8> = (0..h)
            .flat_map(|y| (0..w).map(move |x| ((x + y + shift) % 256) as u8))
            .collect();

        let buffer = match self.format {
            SourceFormat::I420 => {
                let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
                let mut image = I420Buffer::new(self.width, self.height);
                let (y, u, v) = image.planes_mut();
                y.copy_from_slice(&luma);
                u[..cw * ch].fill((64 + self.index % 128) as u8);
                v[..cw * ch].fill(160);
                FrameBuffer::I420(image)
            }
            SourceFormat::Nv12 => {
                let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
                let uv: Vec<u8> = (0..cw * ch)
                    .flat_map(|_| [(64 + self.index % 128) as u8, 160])
                    .collect();
                FrameBuffer::Nv12(Nv12Buffer {
                    width: self.width,
                    height: self.height,
                    stride_y: w,
                    stride_uv: cw * 2,
                    data_y: Bytes::from(luma),
                    data_uv: Bytes::from(uv),
                })
            }
            SourceFormat::Bgra => {
                let data: Vec<u8> = luma.iter().flat_map(|l| [*l, *l / 2, 255 - *l, 255]).collect();
                FrameBuffer::Bgra(PackedBuffer {
                    width: self.width,
                    height: self.height,
                    stride: w * 4,
                    data: Bytes::from(data),
                })
            }
        };

        let timestamp = self.index.wrapping_mul(VIDEO_CLOCK_RATE / self.fps);
        let render_time_ms = self.index as i64 * 1000 / self.fps as i64;
        self.index += 1;
        VideoFrame::new(buffer, timestamp)
            .with_color_space(ColorSpace::BT709_LIMITED)
            .with_render_time_ms(render_time_ms)
    }
}
