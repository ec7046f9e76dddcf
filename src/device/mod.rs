pub mod host;
#[cfg(feature = "opencl")]
pub mod opencl;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rxcl_spec::LOCAL_GROUP_SIZE;
use thiserror::Error;

use crate::dataset::Dataset;
use crate::ui;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferAccess {
    ReadWrite,
    ReadOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelArg {
    Buffer(BufferId),
    U32(u32),
}

#[derive(Clone, Copy, Debug)]
pub enum ProgramInput<'a> {
    Source(&'a [String]),
    Binary(&'a [u8]),
}

#[derive(Clone, Debug, Default)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub global_mem: u64,
    pub max_alloc: u64,
    pub local_mem: u64,
    pub clock_mhz: u32,
    pub compute_units: u32,
    pub version: String,
    pub driver_version: String,
    pub extensions: String,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("invalid platform ID ({requested}), {available} platforms available")]
    NoSuchPlatform { requested: usize, available: usize },
    #[error("invalid device ID ({requested}), {available} devices available")]
    NoSuchDevice { requested: usize, available: usize },
    #[error("out of device memory allocating {size} bytes")]
    OutOfMemory { size: usize },
    #[error("failed to build program {program}\n{log}")]
    Build { program: String, log: String },
    #[error("kernel entry point {0} not found")]
    MissingKernel(String),
    #[error("{call} failed: {message}")]
    Api { call: &'static str, message: String },
}

/// One compute device plus its in-order command queue.
///
/// Launches and transfers are executed in submission order. Reads block until
/// every earlier command has completed, so a read directly after the final
/// launch of a round observes the finished round.
pub trait ComputeDevice {
    fn info(&self) -> &DeviceInfo;

    fn create_buffer(&mut self, size: usize, access: BufferAccess) -> Result<BufferId, DeviceError>;

    /// Exposes host memory to kernels without a device copy.
    fn map_host(&mut self, dataset: Arc<Dataset>) -> Result<BufferId, DeviceError>;

    fn release_buffer(&mut self, buffer: BufferId);

    fn write_buffer(&mut self, buffer: BufferId, offset: usize, data: &[u8])
        -> Result<(), DeviceError>;

    fn read_buffer(&mut self, buffer: BufferId, offset: usize, out: &mut [u8])
        -> Result<(), DeviceError>;

    fn fill_buffer(
        &mut self,
        buffer: BufferId,
        pattern: u8,
        offset: usize,
        len: usize,
    ) -> Result<(), DeviceError>;

    fn build_program(
        &mut self,
        name: &str,
        input: ProgramInput<'_>,
        options: &str,
    ) -> Result<ProgramId, DeviceError>;

    fn program_binary(&self, program: ProgramId) -> Result<Vec<u8>, DeviceError>;

    fn release_program(&mut self, program: ProgramId);

    fn create_kernel(&mut self, program: ProgramId, entry_point: &str)
        -> Result<KernelId, DeviceError>;

    fn set_kernel_arg(&mut self, kernel: KernelId, index: u32, arg: KernelArg)
        -> Result<(), DeviceError>;

    fn enqueue_kernel(&mut self, kernel: KernelId, global: usize, local: usize)
        -> Result<(), DeviceError>;

    /// Blocks until the queue is drained.
    fn finish(&mut self) -> Result<(), DeviceError>;

    /// Source text the device can supply for `source_id` when no file exists.
    fn builtin_source(&self, _source_id: &str) -> Option<String> {
        None
    }

    /// Prebuilt binary the device can supply when the cache holds none.
    fn builtin_binary(&self, _cache_name: &str) -> Option<Vec<u8>> {
        None
    }
}

struct PoolBuffer {
    id: BufferId,
    size: usize,
}

/// A device together with the named buffers allocated on it.
///
/// Buffers are released when the pool is dropped.
pub struct DevicePool<D: ComputeDevice> {
    device: D,
    buffers: BTreeMap<String, PoolBuffer>,
}

impl<D: ComputeDevice> DevicePool<D> {
    pub fn new(device: D) -> Self {
        print_device_info(device.info());
        Self {
            device,
            buffers: BTreeMap::new(),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        self.device.info()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Picks the batch width, honouring a caller override.
    ///
    /// The automatic width is sized from the memory left after every buffer
    /// already in the pool, so the dataset must be reserved first.
    pub fn choose_intensity(&self, requested: Option<usize>, lane: LaneFootprint) -> Result<usize> {
        if let Some(intensity) = requested {
            if intensity == 0 || !intensity.is_multiple_of(LOCAL_GROUP_SIZE) {
                bail!("intensity must be a non-zero multiple of {LOCAL_GROUP_SIZE} (got {intensity})");
            }
            return Ok(intensity);
        }

        let info = self.info();
        let reserved = self.allocated_bytes();
        let intensity = intensity_within(info, reserved, lane);
        if intensity == 0 {
            bail!(
                "device {} cannot hold a single work group ({} free after {} reserved, {} per lane)",
                info.name,
                ui::format_bytes(info.global_mem.saturating_sub(reserved)),
                ui::format_bytes(reserved),
                ui::format_bytes(lane.total as u64)
            );
        }
        Ok(intensity)
    }

    pub fn allocate(&mut self, name: &str, size: usize, access: BufferAccess) -> Result<BufferId> {
        if self.buffers.contains_key(name) {
            bail!("buffer {name} is already allocated");
        }
        ui::info(
            "GPU",
            format!("allocating {name} ({})", ui::format_bytes(size as u64)),
        );
        let id = self
            .device
            .create_buffer(size, access)
            .with_context(|| format!("failed to allocate buffer {name}"))?;
        self.buffers.insert(name.to_string(), PoolBuffer { id, size });
        Ok(id)
    }

    pub fn map_host(&mut self, name: &str, dataset: Arc<Dataset>) -> Result<BufferId> {
        if self.buffers.contains_key(name) {
            bail!("buffer {name} is already allocated");
        }
        let size = dataset.len();
        let id = self
            .device
            .map_host(dataset)
            .with_context(|| format!("failed to map host buffer {name}"))?;
        self.buffers.insert(name.to_string(), PoolBuffer { id, size });
        Ok(id)
    }

    pub fn buffer(&self, name: &str) -> Result<BufferId> {
        self.buffers
            .get(name)
            .map(|buffer| buffer.id)
            .with_context(|| format!("no buffer named {name}"))
    }

    pub fn buffer_size(&self, name: &str) -> Option<usize> {
        self.buffers.get(name).map(|buffer| buffer.size)
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.buffers.values().map(|buffer| buffer.size as u64).sum()
    }

    pub fn release(&mut self, name: &str) {
        if let Some(buffer) = self.buffers.remove(name) {
            self.device.release_buffer(buffer.id);
        }
    }
}

impl<D: ComputeDevice> Drop for DevicePool<D> {
    fn drop(&mut self) {
        for (_, buffer) in std::mem::take(&mut self.buffers) {
            self.device.release_buffer(buffer.id);
        }
    }
}

/// Device memory one lane of a batch needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaneFootprint {
    /// Per-lane share of the largest single buffer.
    pub largest: usize,
    /// Per-lane share of all buffers together.
    pub total: usize,
}

impl LaneFootprint {
    pub fn from_sizes(sizes: impl IntoIterator<Item = usize>) -> Self {
        sizes.into_iter().fold(
            Self {
                largest: 0,
                total: 0,
            },
            |acc, size| Self {
                largest: acc.largest.max(size),
                total: acc.total + size,
            },
        )
    }
}

/// Widest batch whose largest buffer fits one allocation and whose buffers
/// together fit the memory left after `reserved` bytes.
pub fn intensity_within(info: &DeviceInfo, reserved: u64, lane: LaneFootprint) -> usize {
    let per_buffer = intensity_for(info.max_alloc, lane.largest);
    let overall = intensity_for(info.global_mem.saturating_sub(reserved), lane.total);
    per_buffer.min(overall)
}

/// Lanes that fit in `limit_bytes`, rounded down to whole work groups.
pub fn intensity_for(limit_bytes: u64, bytes_per_lane: usize) -> usize {
    if bytes_per_lane == 0 {
        return 0;
    }
    let lanes = (limit_bytes / bytes_per_lane as u64) as usize;
    lanes - lanes % LOCAL_GROUP_SIZE
}

fn print_device_info(info: &DeviceInfo) {
    ui::info("GPU", format!("device: {} ({})", info.name, info.vendor));
    ui::key_values(&[
        ("global memory", ui::format_bytes(info.global_mem)),
        ("max alloc", ui::format_bytes(info.max_alloc)),
        ("local memory", ui::format_bytes(info.local_mem)),
        ("clock", format!("{} MHz", info.clock_mhz)),
        ("compute units", info.compute_units.to_string()),
        ("version", info.version.clone()),
        ("driver", info.driver_version.clone()),
        ("extensions", info.extensions.clone()),
    ]);
}

#[cfg(test)]
mod tests {
    use super::host::{HostDevice, HostDeviceOptions};
    use super::*;

    fn small_pool(global_mem: u64, max_alloc: u64) -> DevicePool<HostDevice> {
        let device = HostDevice::open(
            0,
            0,
            HostDeviceOptions {
                global_mem,
                max_alloc,
                ..HostDeviceOptions::default()
            },
        )
        .expect("host device");
        DevicePool::new(device)
    }

    #[test]
    fn intensity_rounds_down_to_work_groups() {
        assert_eq!(intensity_for(100 * 1024, 1024), 64);
        assert_eq!(intensity_for(127 * 1024, 1024), 64);
        assert_eq!(intensity_for(128 * 1024, 1024), 128);
        assert_eq!(intensity_for(63 * 1024, 1024), 0);
        assert_eq!(intensity_for(1 << 30, 0), 0);
    }

    const SINGLE: LaneFootprint = LaneFootprint {
        largest: 4096,
        total: 4096,
    };

    #[test]
    fn automatic_intensity_uses_smaller_memory_limit() {
        let pool = small_pool(1 << 30, 200 * 4096);
        assert_eq!(pool.choose_intensity(None, SINGLE).expect("intensity"), 192);

        let pool = small_pool(130 * 4096, 1 << 30);
        assert_eq!(pool.choose_intensity(None, SINGLE).expect("intensity"), 128);
    }

    #[test]
    fn allocation_limit_applies_to_largest_buffer_only() {
        let lane = LaneFootprint::from_sizes([4096, 1024, 3072]);
        assert_eq!(lane, LaneFootprint { largest: 4096, total: 8192 });

        let pool = small_pool(1 << 30, 200 * 4096);
        assert_eq!(pool.choose_intensity(None, lane).expect("intensity"), 192);

        let pool = small_pool(200 * 8192, 1 << 30);
        assert_eq!(pool.choose_intensity(None, lane).expect("intensity"), 192);
    }

    #[test]
    fn reserved_buffers_shrink_automatic_intensity() {
        let mut pool = small_pool(300 * 4096, 1 << 30);
        assert_eq!(pool.choose_intensity(None, SINGLE).expect("intensity"), 256);

        pool.allocate("dataset", 150 * 4096, BufferAccess::ReadOnly)
            .expect("dataset");
        assert_eq!(pool.choose_intensity(None, SINGLE).expect("intensity"), 128);

        pool.allocate("more", 100 * 4096, BufferAccess::ReadOnly)
            .expect("second reservation");
        let err = pool.choose_intensity(None, SINGLE).expect_err("no room left");
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn intensity_override_must_be_group_aligned() {
        let pool = small_pool(1 << 30, 1 << 30);
        assert_eq!(pool.choose_intensity(Some(320), SINGLE).expect("intensity"), 320);
        assert!(pool.choose_intensity(Some(100), SINGLE).is_err());
        assert!(pool.choose_intensity(Some(0), SINGLE).is_err());
    }

    #[test]
    fn tiny_device_cannot_choose_intensity() {
        let pool = small_pool(4096, 4096);
        let err = pool.choose_intensity(None, SINGLE).expect_err("too small");
        assert!(err.to_string().contains("cannot hold a single work group"));
    }

    #[test]
    fn allocation_failure_names_the_buffer() {
        let mut pool = small_pool(1 << 20, 1 << 20);
        pool.allocate("hashes", 1024, BufferAccess::ReadWrite)
            .expect("small allocation");
        let err = pool
            .allocate("scratchpads", 2 << 20, BufferAccess::ReadWrite)
            .expect_err("over budget");
        let text = format!("{err:#}");
        assert!(text.contains("scratchpads"));
        assert!(text.contains("out of device memory"));
    }

    #[test]
    fn named_buffers_are_unique_and_released() {
        let mut pool = small_pool(1 << 20, 1 << 20);
        pool.allocate("entropy", 4096, BufferAccess::ReadWrite)
            .expect("allocate");
        assert!(pool.allocate("entropy", 4096, BufferAccess::ReadWrite).is_err());
        assert_eq!(pool.buffer_size("entropy"), Some(4096));
        assert_eq!(pool.allocated_bytes(), 4096);

        pool.release("entropy");
        assert!(pool.buffer("entropy").is_err());
        assert_eq!(pool.device().live_bytes(), 0);
        pool.allocate("entropy", 2048, BufferAccess::ReadWrite)
            .expect("reallocate");
    }
}
