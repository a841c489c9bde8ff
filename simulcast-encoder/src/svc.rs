//! Temporal scalability structures (L1T1, L1T2, L1T3).

use crate::codec::ScalabilityMode;

/// Temporal index reported when a layer has no scalability structure.
pub const NO_TEMPORAL_IDX: u8 = 0xFF;

/// Assigns temporal-layer metadata to the frames of one simulcast layer.
pub trait ScalabilityController: Send {
    fn mode(&self) -> ScalabilityMode;

    /// Temporal index of the next produced frame. `restart` rewinds the
    /// pattern, as happens on every key frame.
    fn next_temporal_idx(&mut self, restart: bool) -> u8;
}

/// Dyadic temporal pattern: `0` for L1T1, `0 1` for L1T2, `0 2 1 2` for L1T3.
#[derive(Debug, Clone)]
pub struct TemporalStructure {
    mode: ScalabilityMode,
    pattern: &'static [u8],
    position: usize,
}

impl TemporalStructure {
    pub fn new(mode: ScalabilityMode) -> Self {
        let pattern: &'static [u8] = match mode {
            ScalabilityMode::L1T1 => &[0],
            ScalabilityMode::L1T2 => &[0, 1],
            ScalabilityMode::L1T3 => &[0, 2, 1, 2],
        };
        Self {
            mode,
            pattern,
            position: 0,
        }
    }
}

impl ScalabilityController for TemporalStructure {
    fn mode(&self) -> ScalabilityMode {
        self.mode
    }

    fn next_temporal_idx(&mut self, restart: bool) -> u8 {
        if restart {
            self.position = 0;
        }
        let tid = self.pattern[self.position];
        self.position = (self.position + 1) % self.pattern.len();
        tid
    }
}

pub fn create_scalability_structure(mode: ScalabilityMode) -> Box<dyn ScalabilityController> {
    Box::new(TemporalStructure::new(mode))
}
