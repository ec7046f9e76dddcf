//! Batch hashing pipeline.
//!
//! A [`Pipeline`] owns the working buffers of one device and sequences the
//! kernel chain for a batch of lanes. Kernel arguments are bound once at
//! construction; a round only updates the base nonce and, on the portable
//! path, the substep flags. The device queue is in order, so the only
//! explicit synchronisation is the drain before each native program run and
//! the one at the end of the round.

pub mod layout;
pub mod strategy;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rxcl_spec::{
    kernels as entry, ProtocolParams, LOCAL_GROUP_SIZE, NONCE_LEN, NONCE_OFFSET,
    OUTPUT_HASH_SIZE, REGISTER_FOLD_OFFSET, ROUNDING_SIZE, WORKERS_PER_HASH_CHOICES,
};

use crate::dataset::Dataset;
use crate::device::{BufferAccess, BufferId, ComputeDevice, DevicePool, KernelArg, KernelId};
use crate::kernels::KernelSet;
use crate::ui;

pub use layout::{BufferKind, BufferLayout};
pub use strategy::{base_program, ComputeStrategy};
use strategy::{bind_args, StrategyKernels};

pub const DATASET_BUFFER: &str = "dataset";

const INITIAL_HASH_NONCE_ARG: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Idle,
    RoundStart,
    StageHash,
    StageFill,
    StageCompute { iteration: u32, substep: u32 },
    StageFinalize,
    RoundDone,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub intensity: usize,
    pub params: ProtocolParams,
    pub strategy: ComputeStrategy,
    pub template: Vec<u8>,
}

struct WorkingBuffers {
    hashes: BufferId,
    template: BufferId,
    entropy: BufferId,
    scratchpads: BufferId,
    vm_states: BufferId,
    rounding: BufferId,
    dataset: BufferId,
    intermediate: Option<BufferId>,
    compiled: Option<BufferId>,
}

struct BaseKernels {
    initial_hash: KernelId,
    fill_scratchpad: KernelId,
    fill_entropy: KernelId,
    fold_scratchpad: KernelId,
    hash_registers_32: KernelId,
    hash_registers_64: KernelId,
}

pub struct Pipeline<D: ComputeDevice> {
    pool: DevicePool<D>,
    config: PipelineConfig,
    layout: BufferLayout,
    buffers: WorkingBuffers,
    base: BaseKernels,
    compute: StrategyKernels,
    stage: Stage,
}

/// Allocates the device-resident dataset buffer ahead of the dataset build.
pub fn reserve_device_dataset<D: ComputeDevice>(pool: &mut DevicePool<D>, len: usize) -> Result<BufferId> {
    pool.allocate(DATASET_BUFFER, len, BufferAccess::ReadOnly)
}

pub fn upload_dataset<D: ComputeDevice>(pool: &mut DevicePool<D>, dataset: &Dataset) -> Result<()> {
    let buffer = pool.buffer(DATASET_BUFFER)?;
    let reserved = pool.buffer_size(DATASET_BUFFER).unwrap_or(0);
    if reserved != dataset.len() {
        bail!(
            "dataset is {} bytes but {reserved} were reserved on the device",
            dataset.len()
        );
    }
    let device = pool.device_mut();
    device
        .write_buffer(buffer, 0, dataset.bytes())
        .context("failed to upload dataset")?;
    device.finish().context("failed to upload dataset")?;
    ui::success(
        "DATASET",
        format!("uploaded {} to the device", ui::format_bytes(dataset.len() as u64)),
    );
    Ok(())
}

/// Lets kernels read a host-resident dataset in place.
pub fn map_host_dataset<D: ComputeDevice>(pool: &mut DevicePool<D>, dataset: Arc<Dataset>) -> Result<BufferId> {
    let len = dataset.len() as u64;
    let buffer = pool.map_host(DATASET_BUFFER, dataset)?;
    ui::info(
        "DATASET",
        format!("using {} dataset in host memory", ui::format_bytes(len)),
    );
    Ok(buffer)
}

impl<D: ComputeDevice> Pipeline<D> {
    /// Allocates the working buffers and binds every kernel argument.
    ///
    /// The dataset must already be bound under [`DATASET_BUFFER`].
    pub fn new(mut pool: DevicePool<D>, kernels: &KernelSet, config: PipelineConfig) -> Result<Self> {
        config.params.validate()?;
        if config.template.len() < NONCE_OFFSET + NONCE_LEN {
            bail!(
                "block template is {} bytes, the nonce field needs at least {}",
                config.template.len(),
                NONCE_OFFSET + NONCE_LEN
            );
        }
        if let ComputeStrategy::Portable {
            bfactor,
            workers_per_hash,
        } = config.strategy
        {
            if bfactor > config.params.max_bfactor() {
                bail!(
                    "bfactor {bfactor} exceeds {} for {} program iterations",
                    config.params.max_bfactor(),
                    config.params.program_iterations
                );
            }
            if !WORKERS_PER_HASH_CHOICES.contains(&workers_per_hash) {
                bail!("workers per hash must be one of {WORKERS_PER_HASH_CHOICES:?}");
            }
        }

        let layout = BufferLayout::new(
            config.intensity,
            &config.params,
            &config.strategy,
            config.template.len(),
        )?;
        let dataset = pool
            .buffer(DATASET_BUFFER)
            .context("the dataset must be bound before the pipeline is built")?;

        let native = config.strategy.is_native();
        let buffers = WorkingBuffers {
            scratchpads: allocate(&mut pool, &layout, BufferKind::Scratchpads)?,
            hashes: allocate(&mut pool, &layout, BufferKind::Hashes)?,
            template: allocate(&mut pool, &layout, BufferKind::Template)?,
            entropy: allocate(&mut pool, &layout, BufferKind::Entropy)?,
            vm_states: allocate(&mut pool, &layout, BufferKind::VmStates)?,
            rounding: allocate(&mut pool, &layout, BufferKind::Rounding)?,
            dataset,
            intermediate: native
                .then(|| allocate(&mut pool, &layout, BufferKind::IntermediatePrograms))
                .transpose()?,
            compiled: native
                .then(|| allocate(&mut pool, &layout, BufferKind::CompiledPrograms))
                .transpose()?,
        };

        let base = BaseKernels {
            initial_hash: kernels.get(entry::INITIAL_HASH)?,
            fill_scratchpad: kernels.get(entry::FILL_SCRATCHPAD)?,
            fill_entropy: kernels.get(entry::FILL_ENTROPY)?,
            fold_scratchpad: kernels.get(entry::FOLD_SCRATCHPAD)?,
            hash_registers_32: kernels.get(entry::HASH_REGISTERS_32)?,
            hash_registers_64: kernels.get(entry::HASH_REGISTERS_64)?,
        };
        let compute = config.strategy.kernels(kernels)?;

        let lanes = layout.intensity();
        let device = pool.device_mut();
        device
            .write_buffer(buffers.template, 0, &config.template)
            .context("failed to upload block template")?;
        bind_base(device, &base, &buffers, &config.strategy, lanes)?;
        compute.bind(device, &buffers, &config.params, lanes)?;

        ui::info(
            "PIPELINE",
            format!(
                "{lanes} lanes, {} path, {} of working buffers",
                config.strategy.describe(),
                ui::format_bytes(layout.total_bytes())
            ),
        );

        Ok(Self {
            pool,
            config,
            layout,
            buffers,
            base,
            compute,
            stage: Stage::Idle,
        })
    }

    pub fn intensity(&self) -> usize {
        self.layout.intensity()
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn pool(&self) -> &DevicePool<D> {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut DevicePool<D> {
        &mut self.pool
    }

    /// Hashes nonces `base_nonce .. base_nonce + intensity` and waits for the device.
    pub fn run_round(&mut self, base_nonce: u32) -> Result<()> {
        let lanes = self.layout.intensity();
        let programs = self.config.params.program_count;
        let base = &self.base;
        let device = self.pool.device_mut();

        self.stage = Stage::RoundStart;
        device
            .set_kernel_arg(
                base.initial_hash,
                INITIAL_HASH_NONCE_ARG,
                KernelArg::U32(base_nonce),
            )
            .context("failed to set the round nonce")?;

        self.stage = Stage::StageHash;
        launch(device, base.initial_hash, entry::INITIAL_HASH, lanes, LOCAL_GROUP_SIZE)?;

        self.stage = Stage::StageFill;
        launch(device, base.fill_scratchpad, entry::FILL_SCRATCHPAD, lanes * 4, LOCAL_GROUP_SIZE)?;
        device
            .fill_buffer(self.buffers.rounding, 0, 0, lanes * ROUNDING_SIZE)
            .context("failed to clear rounding counters")?;

        for iteration in 0..programs {
            self.stage = Stage::StageFill;
            launch(device, base.fill_entropy, entry::FILL_ENTROPY, lanes * 4, LOCAL_GROUP_SIZE)?;

            self.stage = Stage::StageCompute {
                iteration,
                substep: 0,
            };
            self.compute.enqueue_init(device, lanes)?;
            for substep in 0..self.compute.substeps() {
                self.stage = Stage::StageCompute { iteration, substep };
                self.compute.enqueue_substep(device, lanes, substep)?;
            }

            if iteration + 1 == programs {
                self.stage = Stage::StageFinalize;
                launch(device, base.fold_scratchpad, entry::FOLD_SCRATCHPAD, lanes * 4, LOCAL_GROUP_SIZE)?;
                launch(device, base.hash_registers_32, entry::HASH_REGISTERS_32, lanes, LOCAL_GROUP_SIZE)?;
            } else {
                launch(device, base.hash_registers_64, entry::HASH_REGISTERS_64, lanes, LOCAL_GROUP_SIZE)?;
            }
        }

        device.finish().context("failed to finish round")?;
        self.stage = Stage::RoundDone;
        Ok(())
    }

    /// Copies the packed 32-byte lane hashes of the last completed round into `out`.
    pub fn read_hashes(&mut self, out: &mut [u8]) -> Result<()> {
        if self.stage != Stage::RoundDone {
            bail!("no completed round to read (pipeline is at {:?})", self.stage);
        }
        let expected = self.layout.intensity() * OUTPUT_HASH_SIZE;
        if out.len() != expected {
            bail!("hash output holds {} bytes, expected {expected}", out.len());
        }
        self.pool
            .device_mut()
            .read_buffer(self.buffers.hashes, 0, out)
            .context("failed to read lane hashes")
    }
}

fn allocate<D: ComputeDevice>(
    pool: &mut DevicePool<D>,
    layout: &BufferLayout,
    kind: BufferKind,
) -> Result<BufferId> {
    let size = layout
        .size(kind)
        .with_context(|| format!("{} buffer is not part of this layout", kind.name()))?;
    let access = match kind {
        BufferKind::Template => BufferAccess::ReadOnly,
        _ => BufferAccess::ReadWrite,
    };
    pool.allocate(kind.name(), size, access)
}

fn bind_base<D: ComputeDevice>(
    device: &mut D,
    base: &BaseKernels,
    buffers: &WorkingBuffers,
    strategy: &ComputeStrategy,
    lanes: usize,
) -> Result<()> {
    let batch = KernelArg::U32(lanes as u32);
    let stride = KernelArg::U32(strategy.register_stride() as u32);

    bind_args(
        device,
        base.initial_hash,
        entry::INITIAL_HASH,
        &[
            KernelArg::Buffer(buffers.hashes),
            KernelArg::Buffer(buffers.template),
            KernelArg::U32(0),
        ],
    )?;
    bind_args(
        device,
        base.fill_scratchpad,
        entry::FILL_SCRATCHPAD,
        &[
            KernelArg::Buffer(buffers.hashes),
            KernelArg::Buffer(buffers.scratchpads),
            batch,
        ],
    )?;
    bind_args(
        device,
        base.fill_entropy,
        entry::FILL_ENTROPY,
        &[
            KernelArg::Buffer(buffers.hashes),
            KernelArg::Buffer(buffers.entropy),
            batch,
        ],
    )?;
    bind_args(
        device,
        base.fold_scratchpad,
        entry::FOLD_SCRATCHPAD,
        &[
            KernelArg::Buffer(buffers.scratchpads),
            KernelArg::Buffer(buffers.vm_states),
            KernelArg::U32(REGISTER_FOLD_OFFSET),
            stride,
            batch,
        ],
    )?;
    for (kernel, name) in [
        (base.hash_registers_32, entry::HASH_REGISTERS_32),
        (base.hash_registers_64, entry::HASH_REGISTERS_64),
    ] {
        bind_args(
            device,
            kernel,
            name,
            &[
                KernelArg::Buffer(buffers.hashes),
                KernelArg::Buffer(buffers.vm_states),
                stride,
            ],
        )?;
    }
    Ok(())
}

fn launch<D: ComputeDevice>(
    device: &mut D,
    kernel: KernelId,
    name: &str,
    global: usize,
    local: usize,
) -> Result<()> {
    device
        .enqueue_kernel(kernel, global, local)
        .with_context(|| format!("failed to launch {name}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;
    use crate::dataset::tests::unique_temp_file;
    use crate::dataset::{DatasetBuilder, LargePages};
    use crate::device::host::{HostDevice, HostDeviceOptions, TraceEvent};
    use crate::kernels::KernelCompiler;
    use crate::refhash::{ReferenceEngine, ReferenceOracle};
    use crate::validator::{HashOracle, OracleVm, VmFlags};
    use rxcl_spec::{set_nonce, DEFAULT_BLOCK_TEMPLATE};

    pub(crate) const TEST_PARAMS: ProtocolParams = ProtocolParams {
        scratchpad_l1: 256,
        scratchpad_l2: 1024,
        scratchpad_l3: 4096,
        program_iterations: 256,
        program_count: 8,
    };

    pub(crate) struct TempDir(pub(crate) PathBuf);

    impl TempDir {
        pub(crate) fn new(name: &str) -> Self {
            let path = unique_temp_file(name);
            fs::create_dir_all(&path).expect("temp dir");
            Self(path)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    pub(crate) fn test_dataset() -> Arc<Dataset> {
        let engine = ReferenceEngine::new(64).with_cache_items(16);
        let dataset = DatasetBuilder::new(engine, LargePages::new(false))
            .threads(2)
            .build(b"pipeline test seed")
            .expect("dataset");
        Arc::new(dataset)
    }

    pub(crate) fn test_pipeline(
        strategy: ComputeStrategy,
        dataset: &Arc<Dataset>,
        host_dataset: bool,
        intensity: usize,
    ) -> Pipeline<HostDevice> {
        let dirs = TempDir::new("pipeline-kernels");
        let device = HostDevice::open(0, 0, HostDeviceOptions::default()).expect("host device");
        let mut pool = DevicePool::new(device);

        let compiler = KernelCompiler::new(dirs.0.join("CL"), dirs.0.join("cache"));
        let device_name = pool.info().name.clone();
        let mut kernels = KernelSet::default();
        for spec in strategy.programs(&device_name, &TEST_PARAMS) {
            kernels.extend(compiler.compile(pool.device_mut(), &spec).expect("compile"));
        }

        if host_dataset {
            map_host_dataset(&mut pool, Arc::clone(dataset)).expect("map dataset");
        } else {
            reserve_device_dataset(&mut pool, dataset.len()).expect("reserve dataset");
            upload_dataset(&mut pool, dataset).expect("upload dataset");
        }

        let config = PipelineConfig {
            intensity,
            params: TEST_PARAMS,
            strategy,
            template: DEFAULT_BLOCK_TEMPLATE.to_vec(),
        };
        Pipeline::new(pool, &kernels, config).expect("pipeline")
    }

    fn round_hashes(pipeline: &mut Pipeline<HostDevice>, base_nonce: u32) -> Vec<u8> {
        pipeline.run_round(base_nonce).expect("round");
        let mut out = vec![0u8; pipeline.intensity() * OUTPUT_HASH_SIZE];
        pipeline.read_hashes(&mut out).expect("read");
        out
    }

    fn oracle_hash(dataset: &Arc<Dataset>, nonce: u32) -> Vec<u8> {
        let mut vm = ReferenceOracle::new(TEST_PARAMS)
            .create_vm(dataset, VmFlags::default())
            .expect("vm");
        let mut message = DEFAULT_BLOCK_TEMPLATE;
        set_nonce(&mut message, nonce);
        vm.hash(&message).to_vec()
    }

    fn lane(hashes: &[u8], lane: usize) -> &[u8] {
        &hashes[lane * OUTPUT_HASH_SIZE..(lane + 1) * OUTPUT_HASH_SIZE]
    }

    fn portable(bfactor: u32, workers_per_hash: u32) -> ComputeStrategy {
        ComputeStrategy::Portable {
            bfactor,
            workers_per_hash,
        }
    }

    fn launches(trace: &[TraceEvent]) -> Vec<&'static str> {
        trace
            .iter()
            .filter_map(|event| match event {
                TraceEvent::Launch { kernel, .. } => Some(*kernel),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn native_lanes_match_cpu_oracle() {
        let dataset = test_dataset();
        let mut pipeline = test_pipeline(ComputeStrategy::Native, &dataset, false, 64);
        let hashes = round_hashes(&mut pipeline, 0);

        assert_eq!(lane(&hashes, 0), &oracle_hash(&dataset, 0)[..]);
        assert_eq!(lane(&hashes, 63), &oracle_hash(&dataset, 63)[..]);
        assert_ne!(lane(&hashes, 0), lane(&hashes, 1));
        assert_eq!(pipeline.stage(), Stage::RoundDone);
    }

    #[test]
    fn bfactor_does_not_change_results() {
        let dataset = test_dataset();
        let single = round_hashes(&mut test_pipeline(portable(0, 8), &dataset, false, 64), 0);
        let split = round_hashes(&mut test_pipeline(portable(5, 8), &dataset, false, 64), 0);
        let wide = round_hashes(&mut test_pipeline(portable(3, 16), &dataset, false, 64), 0);
        let native = round_hashes(&mut test_pipeline(ComputeStrategy::Native, &dataset, false, 64), 0);

        assert_eq!(single, split);
        assert_eq!(single, wide);
        assert_eq!(single, native);
    }

    #[test]
    fn host_mapped_dataset_gives_same_hashes() {
        let dataset = test_dataset();
        let on_device = round_hashes(&mut test_pipeline(portable(1, 8), &dataset, false, 64), 500);
        let on_host = round_hashes(&mut test_pipeline(portable(1, 8), &dataset, true, 64), 500);
        assert_eq!(on_device, on_host);
        assert_eq!(lane(&on_host, 10), &oracle_hash(&dataset, 510)[..]);
    }

    #[test]
    fn consecutive_rounds_hash_consecutive_nonces() {
        let dataset = test_dataset();
        let mut pipeline = test_pipeline(ComputeStrategy::Native, &dataset, true, 128);
        let first = round_hashes(&mut pipeline, 1000);
        let second = round_hashes(&mut pipeline, 1128);
        assert_eq!(lane(&first, 127), &oracle_hash(&dataset, 1127)[..]);
        assert_eq!(lane(&second, 0), &oracle_hash(&dataset, 1128)[..]);
        assert_eq!(lane(&second, 5), &oracle_hash(&dataset, 1133)[..]);
    }

    #[test]
    fn native_round_drains_queue_before_each_program_run() {
        let dataset = test_dataset();
        let mut pipeline = test_pipeline(ComputeStrategy::Native, &dataset, true, 64);
        pipeline.pool_mut().device_mut().enable_trace();
        pipeline.run_round(0).expect("round");
        let trace = pipeline.pool_mut().device_mut().take_trace();

        let mut runs = 0;
        for (idx, event) in trace.iter().enumerate() {
            if let TraceEvent::Launch { kernel, .. } = event {
                if *kernel == entry::NATIVE_RUN {
                    runs += 1;
                    assert_eq!(trace[idx - 1], TraceEvent::Finish);
                }
            }
        }
        assert_eq!(runs, TEST_PARAMS.program_count);
        assert_eq!(trace.last(), Some(&TraceEvent::Finish));
    }

    #[test]
    fn narrow_compression_only_after_last_program() {
        let dataset = test_dataset();
        let mut pipeline = test_pipeline(portable(0, 8), &dataset, true, 64);
        pipeline.pool_mut().device_mut().enable_trace();
        pipeline.run_round(0).expect("round");
        let trace = pipeline.pool_mut().device_mut().take_trace();
        let names = launches(&trace);

        let wide = names.iter().filter(|name| **name == entry::HASH_REGISTERS_64).count();
        assert_eq!(wide, TEST_PARAMS.program_count as usize - 1);
        assert_eq!(
            &names[names.len() - 2..],
            &[entry::FOLD_SCRATCHPAD, entry::HASH_REGISTERS_32]
        );
        assert_eq!(names[0], entry::INITIAL_HASH);
        assert_eq!(names[1], entry::FILL_SCRATCHPAD);
    }

    #[test]
    fn substep_flags_mark_first_and_last() {
        let dataset = test_dataset();
        let mut pipeline = test_pipeline(portable(2, 8), &dataset, true, 64);
        pipeline.pool_mut().device_mut().enable_trace();
        pipeline.run_round(0).expect("round");
        let trace = pipeline.pool_mut().device_mut().take_trace();

        let flags: Vec<(KernelArg, KernelArg)> = trace
            .iter()
            .filter_map(|event| match event {
                TraceEvent::Launch { kernel, args, .. } if *kernel == entry::PORTABLE_EXECUTE => {
                    Some((args[6], args[7]))
                }
                _ => None,
            })
            .collect();
        assert_eq!(flags.len(), 4 * TEST_PARAMS.program_count as usize);
        let (on, off) = (KernelArg::U32(1), KernelArg::U32(0));
        for program in flags.chunks(4) {
            assert_eq!(program, &[(on, off), (off, off), (off, off), (off, on)]);
        }
    }

    #[test]
    fn rounding_counters_are_cleared_every_round() {
        let dataset = test_dataset();
        let mut pipeline = test_pipeline(ComputeStrategy::Native, &dataset, true, 64);
        pipeline.pool_mut().device_mut().enable_trace();
        let first = round_hashes(&mut pipeline, 77);
        let second = round_hashes(&mut pipeline, 77);
        assert_eq!(first, second);

        let trace = pipeline.pool_mut().device_mut().take_trace();
        let clears = trace
            .iter()
            .filter(|event| matches!(event, TraceEvent::Fill { len, .. } if *len == 64 * ROUNDING_SIZE))
            .count();
        assert_eq!(clears, 2);
    }

    #[test]
    fn hashes_are_unavailable_before_a_round() {
        let dataset = test_dataset();
        let mut pipeline = test_pipeline(portable(0, 8), &dataset, true, 64);
        let mut out = vec![0u8; 64 * OUTPUT_HASH_SIZE];
        assert!(pipeline.read_hashes(&mut out).is_err());
        pipeline.run_round(0).expect("round");
        assert!(pipeline.read_hashes(&mut out[..32]).is_err());
        pipeline.read_hashes(&mut out).expect("read");
    }

    #[test]
    fn construction_rejects_bad_settings() {
        let dataset = test_dataset();
        let device = HostDevice::open(0, 0, HostDeviceOptions::default()).expect("host device");
        let mut pool = DevicePool::new(device);
        let kernels = KernelSet::default();
        let config = PipelineConfig {
            intensity: 64,
            params: TEST_PARAMS,
            strategy: portable(9, 8),
            template: DEFAULT_BLOCK_TEMPLATE.to_vec(),
        };
        let err = Pipeline::new(pool, &kernels, config.clone()).err().expect("bfactor");
        assert!(err.to_string().contains("bfactor 9"));

        let device = HostDevice::open(0, 0, HostDeviceOptions::default()).expect("host device");
        pool = DevicePool::new(device);
        let err = Pipeline::new(
            pool,
            &kernels,
            PipelineConfig {
                strategy: portable(0, 8),
                ..config.clone()
            },
        )
        .err()
        .expect("no dataset");
        assert!(format!("{err:#}").contains("dataset must be bound"));

        let device = HostDevice::open(0, 0, HostDeviceOptions::default()).expect("host device");
        pool = DevicePool::new(device);
        map_host_dataset(&mut pool, dataset).expect("map");
        let err = Pipeline::new(
            pool,
            &kernels,
            PipelineConfig {
                strategy: portable(0, 8),
                template: vec![0u8; 40],
                ..config
            },
        )
        .err()
        .expect("short template");
        assert!(err.to_string().contains("nonce field"));
    }

    #[test]
    fn working_buffers_that_do_not_fit_fail_setup() {
        let dataset = test_dataset();
        let device = HostDevice::open(
            0,
            0,
            HostDeviceOptions {
                global_mem: 1 << 20,
                max_alloc: 1 << 20,
                builtin_binaries: true,
            },
        )
        .expect("host device");
        let mut pool = DevicePool::new(device);
        map_host_dataset(&mut pool, dataset).expect("map");

        let dirs = TempDir::new("pipeline-oom");
        let compiler = KernelCompiler::new(dirs.0.join("CL"), dirs.0.join("cache"));
        let mut kernels = KernelSet::default();
        for spec in portable(0, 8).programs("host", &TEST_PARAMS) {
            kernels.extend(compiler.compile(pool.device_mut(), &spec).expect("compile"));
        }
        let config = PipelineConfig {
            intensity: 512,
            params: TEST_PARAMS,
            strategy: portable(0, 8),
            template: DEFAULT_BLOCK_TEMPLATE.to_vec(),
        };
        let err = Pipeline::new(pool, &kernels, config).err().expect("out of memory");
        let text = format!("{err:#}");
        assert!(text.contains("scratchpads"));
        assert!(text.contains("out of device memory"));
    }
}
