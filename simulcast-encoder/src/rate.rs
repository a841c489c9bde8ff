//! Bitrate allocation types and the default simulcast rate allocator.

use crate::codec::{MAX_TEMPORAL_STREAMS, VideoCodec};
use crate::simulcast::number_of_simulcast_streams;

pub const MAX_SPATIAL_LAYERS: usize = 5;

/// Bits per second, per spatial layer (keyed by simulcast index) and
/// temporal layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitrateAllocation {
    bitrates: [[u32; MAX_TEMPORAL_STREAMS]; MAX_SPATIAL_LAYERS],
}

impl BitrateAllocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bitrate(&mut self, spatial_index: usize, temporal_index: usize, bps: u32) -> bool {
        if spatial_index >= MAX_SPATIAL_LAYERS || temporal_index >= MAX_TEMPORAL_STREAMS {
            return false;
        }
        self.bitrates[spatial_index][temporal_index] = bps;
        true
    }

    pub fn get_bitrate(&self, spatial_index: usize, temporal_index: usize) -> u32 {
        self.bitrates
            .get(spatial_index)
            .and_then(|layer| layer.get(temporal_index))
            .copied()
            .unwrap_or(0)
    }

    /// Sum over all temporal layers of one spatial layer.
    pub fn get_spatial_layer_sum(&self, spatial_index: usize) -> u32 {
        self.bitrates
            .get(spatial_index)
            .map(|layer| layer.iter().fold(0u32, |acc, b| acc.saturating_add(*b)))
            .unwrap_or(0)
    }

    pub fn get_sum_bps(&self) -> u32 {
        (0..MAX_SPATIAL_LAYERS).fold(0u32, |acc, si| {
            acc.saturating_add(self.get_spatial_layer_sum(si))
        })
    }

    pub fn is_spatial_layer_used(&self, spatial_index: usize) -> bool {
        self.get_spatial_layer_sum(spatial_index) > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateControlParameters {
    pub bitrate: BitrateAllocation,
    pub framerate_fps: f64,
}

impl RateControlParameters {
    pub fn new(bitrate: BitrateAllocation, framerate_fps: f64) -> Self {
        Self {
            bitrate,
            framerate_fps,
        }
    }
}

/// Converts a total target bitrate into per-spatial-layer shares keyed by
/// simulcast index.
pub trait RateAllocator: Send {
    fn allocate(&mut self, codec: &VideoCodec, total_bps: u32, framerate: f64) -> BitrateAllocation;
}

impl<F> RateAllocator for F
where
    F: FnMut(&VideoCodec, u32, f64) -> BitrateAllocation + Send,
{
    fn allocate(&mut self, codec: &VideoCodec, total_bps: u32, framerate: f64) -> BitrateAllocation {
        self(codec, total_bps, framerate)
    }
}

/// Fills streams from the lowest resolution upwards, each up to its target,
/// then hands leftover bitrate to the highest allocated stream up to its max.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulcastRateAllocator;

impl SimulcastRateAllocator {
    pub fn new() -> Self {
        Self
    }

    fn distribute_simulcast(codec: &VideoCodec, num_streams: usize, total_bps: u32) -> Vec<u32> {
        let mut per_stream = vec![0u32; num_streams];
        let mut left = total_bps;
        let mut top: Option<usize> = None;

        for (si, stream) in codec.simulcast_streams.iter().take(num_streams).enumerate() {
            if !stream.active {
                continue;
            }
            let min_bps = stream.min_bitrate_kbps.saturating_mul(1000);
            let target_bps = stream.target_bitrate_kbps.saturating_mul(1000);
            let first = top.is_none();
            if !first && left < min_bps {
                break;
            }
            // The lowest active stream always gets at least its min.
            let mut allocated = left.min(target_bps);
            if first {
                allocated = allocated.max(min_bps);
            }
            per_stream[si] = allocated;
            left = left.saturating_sub(allocated);
            top = Some(si);
        }

        if let Some(top) = top {
            if left > 0 {
                let max_bps = codec.simulcast_streams[top]
                    .max_bitrate_kbps
                    .saturating_mul(1000);
                let headroom = max_bps.saturating_sub(per_stream[top]);
                per_stream[top] += left.min(headroom);
            }
        }
        per_stream
    }

    fn distribute_single(codec: &VideoCodec, total_bps: u32) -> u32 {
        let mut allocated = total_bps.max(codec.min_bitrate_kbps.saturating_mul(1000));
        if codec.max_bitrate_kbps > 0 {
            allocated = allocated.min(codec.max_bitrate_kbps.saturating_mul(1000));
        }
        allocated
    }
}

/// Splits one stream's bitrate over its temporal layers.
pub fn split_temporal_layers(stream_bps: u32, num_temporal_layers: u8) -> Vec<u32> {
    const TWO_LAYERS: [u32; 2] = [60, 40];
    const THREE_LAYERS: [u32; 3] = [40, 20, 40];
    const FOUR_LAYERS: [u32; 4] = [25, 15, 20, 40];

    let shares: &[u32] = match num_temporal_layers {
        0 | 1 => return vec![stream_bps],
        2 => &TWO_LAYERS,
        3 => &THREE_LAYERS,
        _ => &FOUR_LAYERS,
    };
    let mut out: Vec<u32> = shares
        .iter()
        .map(|share| (stream_bps as u64 * *share as u64 / 100) as u32)
        .collect();
    // Rounding remainder goes to the base layer.
    let assigned: u32 = out.iter().sum();
    out[0] += stream_bps - assigned;
    out
}

impl RateAllocator for SimulcastRateAllocator {
    fn allocate(&mut self, codec: &VideoCodec, total_bps: u32, _framerate: f64) -> BitrateAllocation {
        let mut allocation = BitrateAllocation::new();
        if total_bps == 0 {
            return allocation;
        }

        let num_streams = number_of_simulcast_streams(codec);
        let per_stream = if num_streams > 1 {
            Self::distribute_simulcast(codec, num_streams, total_bps)
        } else {
            vec![Self::distribute_single(codec, total_bps)]
        };

        for (si, stream_bps) in per_stream.into_iter().enumerate() {
            if stream_bps == 0 {
                continue;
            }
            let temporal_layers = codec
                .number_of_temporal_layers
                .max(codec.simulcast_stream(si).number_of_temporal_layers);
            for (ti, bps) in split_temporal_layers(stream_bps, temporal_layers)
                .into_iter()
                .enumerate()
            {
                allocation.set_bitrate(si, ti, bps);
            }
        }
        allocation
    }
}
