//! Scratch buffers holding the reduced-resolution copies of the input frame.
//!
//! Layer 0 encodes straight from the canonical full-resolution planes, so
//! the pool holds one buffer per layer starting at layer 1. Buffers are
//! allocated once per init cycle and overwritten in place on every frame.

use crate::frame::I420Buffer;
use crate::scaler::ImageUtility;

#[derive(Debug, Default)]
pub struct DownscalePool {
    buffers: Vec<I420Buffer>,
}

impl DownscalePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the buffer for the next layer below the top one.
    pub fn allocate(&mut self, width: u32, height: u32) {
        self.buffers.push(I420Buffer::new(width, height));
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Buffer backing `layer_index`. Layer 0 has none.
    pub fn buffer(&self, layer_index: usize) -> Option<&I420Buffer> {
        layer_index
            .checked_sub(1)
            .and_then(|slot| self.buffers.get(slot))
    }

    /// Rewrites the buffer of `layer_index` from `source` and returns it.
    pub fn refresh(
        &mut self,
        layer_index: usize,
        source: &I420Buffer,
        image: &mut dyn ImageUtility,
    ) -> anyhow::Result<&I420Buffer> {
        let buffer = layer_index
            .checked_sub(1)
            .and_then(|slot| self.buffers.get_mut(slot))
            .ok_or_else(|| anyhow::anyhow!("no downscale buffer for layer {}", layer_index))?;
        image.scale(source, buffer)?;
        Ok(buffer)
    }
}
