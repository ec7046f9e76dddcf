use anyhow::{bail, Result};
use rxcl_spec::{
    ProtocolParams, COMPILED_PROGRAM_SIZE, ENTROPY_SIZE, INITIAL_HASH_SIZE,
    INTERMEDIATE_PROGRAM_SIZE, LOCAL_GROUP_SIZE, ROUNDING_SIZE,
};

use super::strategy::ComputeStrategy;
use crate::device::LaneFootprint;

/// Per-lane working buffers owned by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BufferKind {
    Hashes,
    Template,
    Entropy,
    Scratchpads,
    VmStates,
    Rounding,
    IntermediatePrograms,
    CompiledPrograms,
}

impl BufferKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Hashes => "hashes",
            Self::Template => "block template",
            Self::Entropy => "entropy",
            Self::Scratchpads => "scratchpads",
            Self::VmStates => "VM states",
            Self::Rounding => "rounding",
            Self::IntermediatePrograms => "intermediate programs",
            Self::CompiledPrograms => "compiled programs",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferLayout {
    intensity: usize,
    per_lane: Vec<(BufferKind, usize)>,
}

impl BufferLayout {
    pub fn new(
        intensity: usize,
        params: &ProtocolParams,
        strategy: &ComputeStrategy,
        template_len: usize,
    ) -> Result<Self> {
        if intensity == 0 || !intensity.is_multiple_of(LOCAL_GROUP_SIZE) {
            bail!("intensity must be a non-zero multiple of {LOCAL_GROUP_SIZE} (got {intensity})");
        }
        Ok(Self {
            intensity,
            per_lane: Self::lane_sizes(params, strategy, template_len),
        })
    }

    /// What one lane costs on the device, for sizing the batch.
    pub fn lane_footprint(
        params: &ProtocolParams,
        strategy: &ComputeStrategy,
        template_len: usize,
    ) -> LaneFootprint {
        LaneFootprint::from_sizes(
            Self::lane_sizes(params, strategy, template_len)
                .into_iter()
                .map(|(_, size)| size),
        )
    }

    fn lane_sizes(
        params: &ProtocolParams,
        strategy: &ComputeStrategy,
        template_len: usize,
    ) -> Vec<(BufferKind, usize)> {
        let mut per_lane = vec![
            (BufferKind::Hashes, INITIAL_HASH_SIZE),
            (BufferKind::Template, template_len),
            (BufferKind::Entropy, ENTROPY_SIZE),
            (BufferKind::Scratchpads, params.scratchpad_stride()),
            (BufferKind::VmStates, strategy.register_stride()),
            (BufferKind::Rounding, ROUNDING_SIZE),
        ];
        if strategy.is_native() {
            per_lane.push((BufferKind::IntermediatePrograms, INTERMEDIATE_PROGRAM_SIZE));
            per_lane.push((BufferKind::CompiledPrograms, COMPILED_PROGRAM_SIZE));
        }
        per_lane
    }

    pub fn intensity(&self) -> usize {
        self.intensity
    }

    pub fn per_lane(&self, kind: BufferKind) -> Option<usize> {
        self.per_lane
            .iter()
            .find(|(candidate, _)| *candidate == kind)
            .map(|(_, size)| *size)
    }

    pub fn size(&self, kind: BufferKind) -> Option<usize> {
        self.per_lane(kind).map(|size| size * self.intensity)
    }

    pub fn buffers(&self) -> impl Iterator<Item = (BufferKind, usize)> + '_ {
        self.per_lane
            .iter()
            .map(move |(kind, size)| (*kind, size * self.intensity))
    }

    pub fn bytes_per_lane(&self) -> usize {
        self.per_lane.iter().map(|(_, size)| size).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_per_lane() as u64 * self.intensity as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rxcl_spec::{REGISTERS_SIZE, SCRATCHPAD_SLACK, VM_STATE_SIZE};

    const PORTABLE: ComputeStrategy = ComputeStrategy::Portable {
        bfactor: 0,
        workers_per_hash: 8,
    };

    #[test]
    fn every_buffer_scales_with_intensity() {
        let params = ProtocolParams::RANDOMX;
        for intensity in [64usize, 128, 1024, 4096] {
            for strategy in [ComputeStrategy::Native, PORTABLE] {
                let layout = BufferLayout::new(intensity, &params, &strategy, 76).expect("layout");
                for (kind, size) in layout.buffers() {
                    assert_eq!(size, intensity * layout.per_lane(kind).expect("per lane"));
                }
            }
        }
    }

    #[test]
    fn strategy_selects_state_stride_and_program_buffers() {
        let params = ProtocolParams::RANDOMX;
        let native = BufferLayout::new(64, &params, &ComputeStrategy::Native, 76).expect("native");
        assert_eq!(native.per_lane(BufferKind::VmStates), Some(REGISTERS_SIZE));
        assert_eq!(native.size(BufferKind::CompiledPrograms), Some(64 * COMPILED_PROGRAM_SIZE));

        let portable = BufferLayout::new(64, &params, &PORTABLE, 76).expect("portable");
        assert_eq!(portable.per_lane(BufferKind::VmStates), Some(VM_STATE_SIZE));
        assert_eq!(portable.size(BufferKind::IntermediatePrograms), None);
        assert_eq!(
            portable.size(BufferKind::Scratchpads),
            Some(64 * (params.scratchpad_l3 + SCRATCHPAD_SLACK))
        );
    }

    #[test]
    fn misaligned_intensity_is_rejected() {
        let params = ProtocolParams::RANDOMX;
        assert!(BufferLayout::new(0, &params, &PORTABLE, 76).is_err());
        assert!(BufferLayout::new(96, &params, &PORTABLE, 76).is_err());
    }

    #[test]
    fn totals_sum_per_lane_sizes() {
        let params = ProtocolParams::RANDOMX;
        let layout = BufferLayout::new(128, &params, &ComputeStrategy::Native, 76).expect("layout");
        let summed: u64 = layout.buffers().map(|(_, size)| size as u64).sum();
        assert_eq!(layout.total_bytes(), summed);
    }

    #[test]
    fn footprint_matches_layout_per_lane() {
        let params = ProtocolParams::RANDOMX;
        for strategy in [ComputeStrategy::Native, PORTABLE] {
            let layout = BufferLayout::new(64, &params, &strategy, 76).expect("layout");
            let footprint = BufferLayout::lane_footprint(&params, &strategy, 76);
            assert_eq!(footprint.total, layout.bytes_per_lane());
            assert_eq!(footprint.largest, params.scratchpad_stride());
        }
    }
}
