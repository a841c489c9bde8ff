//! Simulcast stream counting and parameter validation.

use crate::codec::VideoCodec;

/// Number of simulcast streams the codec asks for. A descriptor list whose
/// max bitrates sum to zero is treated as "no simulcast".
pub fn number_of_simulcast_streams(codec: &VideoCodec) -> usize {
    let streams = codec.number_of_simulcast_streams().max(1);
    let max_bitrate_sum: u64 = codec
        .simulcast_streams
        .iter()
        .take(streams)
        .map(|s| s.max_bitrate_kbps as u64)
        .sum();
    if max_bitrate_sum == 0 { 1 } else { streams }
}

/// Decides whether a simulcast cascade can be served by the rate allocator.
pub trait SimulcastValidator: Send {
    fn is_valid(&self, codec: &VideoCodec, num_streams: usize) -> bool;
}

/// Requires the top stream to match the codec resolution, a common aspect
/// ratio, non-decreasing widths, equal framerates and equal temporal layer
/// counts across streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSimulcastValidator;

impl SimulcastValidator for DefaultSimulcastValidator {
    fn is_valid(&self, codec: &VideoCodec, num_streams: usize) -> bool {
        if num_streams == 0 || num_streams > codec.simulcast_streams.len() {
            return false;
        }
        let streams = &codec.simulcast_streams[..num_streams];
        let top = &streams[num_streams - 1];
        if codec.width != top.width || codec.height != top.height {
            return false;
        }

        let aspect_matches = streams.iter().all(|s| {
            codec.width as u64 * s.height as u64 == codec.height as u64 * s.width as u64
        });
        if !aspect_matches {
            return false;
        }

        streams.windows(2).all(|pair| {
            pair[1].width >= pair[0].width
                && (pair[1].max_framerate - pair[0].max_framerate).abs() <= 1e-9
                && pair[1].number_of_temporal_layers == pair[0].number_of_temporal_layers
        })
    }
}

impl<F> SimulcastValidator for F
where
    F: Fn(&VideoCodec, usize) -> bool + Send,
{
    fn is_valid(&self, codec: &VideoCodec, num_streams: usize) -> bool {
        self(codec, num_streams)
    }
}
