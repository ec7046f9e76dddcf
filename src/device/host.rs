//! In-process compute device.
//!
//! Kernels are looked up by entry-point name in a table of host functions
//! implementing the reference hash family. Launch geometry, buffer bounds and
//! memory limits are checked the way a real device would reject them, which
//! makes this the device the pipeline tests run on.

mod kernels;

use std::sync::Arc;
use std::thread;

use rxcl_spec::{kernels as entry, OUTPUT_HASH_SIZE};

use self::kernels::{HostKernelFn, HostMemory, Launch, Slot};
use super::{
    BufferAccess, BufferId, ComputeDevice, DeviceError, DeviceInfo, KernelArg, KernelId,
    ProgramId, ProgramInput,
};
use crate::dataset::Dataset;

const BINARY_MAGIC: &[u8] = b"RXCL-HOST-PROGRAM\0";
const MAX_KERNEL_ARGS: u32 = 16;

#[derive(Clone, Debug)]
pub struct HostDeviceOptions {
    pub global_mem: u64,
    pub max_alloc: u64,
    /// Serve prebuilt binaries for cache names that have no file.
    pub builtin_binaries: bool,
}

impl Default for HostDeviceOptions {
    fn default() -> Self {
        Self {
            global_mem: 1 << 30,
            max_alloc: 512 << 20,
            builtin_binaries: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    Write { buffer: BufferId, offset: usize, len: usize },
    Read { buffer: BufferId, offset: usize, len: usize },
    Fill { buffer: BufferId, offset: usize, len: usize },
    Launch {
        kernel: &'static str,
        global: usize,
        local: usize,
        args: Vec<KernelArg>,
    },
    Finish,
    Build {
        program: String,
        options: String,
        from_binary: bool,
    },
}

struct HostProgram {
    options: String,
}

struct HostKernel {
    entry: &'static str,
    run: HostKernelFn,
    args: Vec<Option<KernelArg>>,
}

pub struct HostDevice {
    info: DeviceInfo,
    options: HostDeviceOptions,
    memory: HostMemory,
    live_bytes: u64,
    programs: Vec<Option<HostProgram>>,
    kernels: Vec<HostKernel>,
    trace: Option<Vec<TraceEvent>>,
    corruptions: Vec<Corruption>,
}

/// A byte of a kernel's output argument that is flipped after every launch.
#[derive(Clone, Copy, Debug)]
struct Corruption {
    entry: &'static str,
    arg: usize,
    offset: usize,
}

impl HostDevice {
    /// The host exposes exactly one platform with one device.
    pub fn open(
        platform: usize,
        device: usize,
        options: HostDeviceOptions,
    ) -> Result<Self, DeviceError> {
        if platform != 0 {
            return Err(DeviceError::NoSuchPlatform {
                requested: platform,
                available: 1,
            });
        }
        if device != 0 {
            return Err(DeviceError::NoSuchDevice {
                requested: device,
                available: 1,
            });
        }
        let compute_units = thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let info = DeviceInfo {
            name: "rxcl host device".to_string(),
            vendor: "rxcl".to_string(),
            global_mem: options.global_mem,
            max_alloc: options.max_alloc,
            local_mem: 64 * 1024,
            clock_mhz: 0,
            compute_units,
            version: "host reference kernels".to_string(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            extensions: String::new(),
        };
        Ok(Self {
            info,
            options,
            memory: HostMemory::default(),
            live_bytes: 0,
            programs: Vec::new(),
            kernels: Vec::new(),
            trace: None,
            corruptions: Vec::new(),
        })
    }

    pub fn enable_trace(&mut self) {
        self.trace.get_or_insert_with(Vec::new);
    }

    pub fn take_trace(&mut self) -> Vec<TraceEvent> {
        self.trace.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Flips a bit of `lane`'s final hash after every 32-byte compression.
    pub fn corrupt_final_hash(&mut self, lane: usize) {
        self.corrupt_output(entry::HASH_REGISTERS_32, 0, lane * OUTPUT_HASH_SIZE);
    }

    /// Flips the low bit of byte `offset` in buffer argument `arg` after every
    /// launch of `kernel`.
    pub fn corrupt_output(&mut self, kernel: &'static str, arg: usize, offset: usize) {
        self.corruptions.push(Corruption {
            entry: kernel,
            arg,
            offset,
        });
    }

    /// Bytes held by owned buffers; host-mapped buffers are not counted.
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    pub fn binary_image(options: &str) -> Vec<u8> {
        let mut image = BINARY_MAGIC.to_vec();
        image.extend_from_slice(options.as_bytes());
        image
    }

    fn record(&mut self, event: TraceEvent) {
        if let Some(trace) = self.trace.as_mut() {
            trace.push(event);
        }
    }

    fn kernel_mut(&mut self, kernel: KernelId) -> Result<&mut HostKernel, DeviceError> {
        self.kernels.get_mut(kernel.0).ok_or_else(|| DeviceError::Api {
            call: "kernel",
            message: format!("unknown kernel handle {}", kernel.0),
        })
    }

    fn range_error(call: &'static str, offset: usize, len: usize, size: usize) -> DeviceError {
        DeviceError::Api {
            call,
            message: format!("range {offset}..{} exceeds buffer of {size} bytes", offset + len),
        }
    }

    fn apply_corruption(&mut self, entry: &str, launch_args: &[Option<KernelArg>]) -> Result<(), DeviceError> {
        for corruption in self.corruptions.clone() {
            if corruption.entry != entry {
                continue;
            }
            let Some(Some(KernelArg::Buffer(buffer))) = launch_args.get(corruption.arg) else {
                continue;
            };
            let bytes = self.memory.slot_mut(*buffer)?.bytes_mut()?;
            if let Some(byte) = bytes.get_mut(corruption.offset) {
                *byte ^= 0x01;
            }
        }
        Ok(())
    }
}

impl ComputeDevice for HostDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(&mut self, size: usize, _access: BufferAccess) -> Result<BufferId, DeviceError> {
        let size64 = size as u64;
        if size64 > self.options.max_alloc || self.live_bytes + size64 > self.options.global_mem {
            return Err(DeviceError::OutOfMemory { size });
        }
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| DeviceError::OutOfMemory { size })?;
        bytes.resize(size, 0);
        self.live_bytes += size64;
        Ok(self.memory.insert(Slot::Owned(bytes)))
    }

    fn map_host(&mut self, dataset: Arc<Dataset>) -> Result<BufferId, DeviceError> {
        Ok(self.memory.insert(Slot::Mapped(dataset)))
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        if let Some(Slot::Owned(bytes)) = self.memory.remove(buffer) {
            self.live_bytes -= bytes.len() as u64;
        }
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: usize, data: &[u8]) -> Result<(), DeviceError> {
        let bytes = self.memory.slot_mut(buffer)?.bytes_mut()?;
        let size = bytes.len();
        let target = bytes
            .get_mut(offset..offset + data.len())
            .ok_or_else(|| Self::range_error("write_buffer", offset, data.len(), size))?;
        target.copy_from_slice(data);
        self.record(TraceEvent::Write {
            buffer,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<(), DeviceError> {
        let bytes = self.memory.slot(buffer)?.bytes();
        let source = bytes
            .get(offset..offset + out.len())
            .ok_or_else(|| Self::range_error("read_buffer", offset, out.len(), bytes.len()))?;
        out.copy_from_slice(source);
        self.record(TraceEvent::Read {
            buffer,
            offset,
            len: out.len(),
        });
        Ok(())
    }

    fn fill_buffer(&mut self, buffer: BufferId, pattern: u8, offset: usize, len: usize) -> Result<(), DeviceError> {
        let bytes = self.memory.slot_mut(buffer)?.bytes_mut()?;
        let size = bytes.len();
        bytes
            .get_mut(offset..offset + len)
            .ok_or_else(|| Self::range_error("fill_buffer", offset, len, size))?
            .fill(pattern);
        self.record(TraceEvent::Fill { buffer, offset, len });
        Ok(())
    }

    fn build_program(
        &mut self,
        name: &str,
        input: ProgramInput<'_>,
        options: &str,
    ) -> Result<ProgramId, DeviceError> {
        let from_binary = match input {
            ProgramInput::Source(sources) => {
                let mut log = Vec::new();
                for (idx, source) in sources.iter().enumerate() {
                    for (line_no, line) in source.lines().enumerate() {
                        if let Some(message) = line.trim_start().strip_prefix("#error") {
                            log.push(format!(
                                "source {idx}:{}: error: {}",
                                line_no + 1,
                                message.trim()
                            ));
                        }
                    }
                }
                if !log.is_empty() {
                    return Err(DeviceError::Build {
                        program: name.to_string(),
                        log: log.join("\n"),
                    });
                }
                false
            }
            ProgramInput::Binary(binary) => {
                if !binary.starts_with(BINARY_MAGIC) {
                    return Err(DeviceError::Build {
                        program: name.to_string(),
                        log: "binary was not produced for this device".to_string(),
                    });
                }
                true
            }
        };

        self.programs.push(Some(HostProgram {
            options: options.to_string(),
        }));
        self.record(TraceEvent::Build {
            program: name.to_string(),
            options: options.to_string(),
            from_binary,
        });
        Ok(ProgramId(self.programs.len() - 1))
    }

    fn program_binary(&self, program: ProgramId) -> Result<Vec<u8>, DeviceError> {
        let program = self
            .programs
            .get(program.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| DeviceError::Api {
                call: "program_binary",
                message: format!("unknown program handle {}", program.0),
            })?;
        Ok(Self::binary_image(&program.options))
    }

    fn release_program(&mut self, program: ProgramId) {
        if let Some(slot) = self.programs.get_mut(program.0) {
            *slot = None;
        }
    }

    fn create_kernel(&mut self, program: ProgramId, entry_point: &str) -> Result<KernelId, DeviceError> {
        if self.programs.get(program.0).and_then(Option::as_ref).is_none() {
            return Err(DeviceError::Api {
                call: "create_kernel",
                message: format!("unknown program handle {}", program.0),
            });
        }
        let (entry, run) = kernels::lookup(entry_point)
            .ok_or_else(|| DeviceError::MissingKernel(entry_point.to_string()))?;
        self.kernels.push(HostKernel {
            entry,
            run,
            args: Vec::new(),
        });
        Ok(KernelId(self.kernels.len() - 1))
    }

    fn set_kernel_arg(&mut self, kernel: KernelId, index: u32, arg: KernelArg) -> Result<(), DeviceError> {
        if index >= MAX_KERNEL_ARGS {
            return Err(DeviceError::Api {
                call: "set_kernel_arg",
                message: format!("argument index {index} out of range"),
            });
        }
        let kernel = self.kernel_mut(kernel)?;
        let index = index as usize;
        if kernel.args.len() <= index {
            kernel.args.resize(index + 1, None);
        }
        kernel.args[index] = Some(arg);
        Ok(())
    }

    fn enqueue_kernel(&mut self, kernel: KernelId, global: usize, local: usize) -> Result<(), DeviceError> {
        let (entry, run, args) = {
            let kernel = self.kernel_mut(kernel)?;
            (kernel.entry, kernel.run, kernel.args.clone())
        };
        if local == 0 || !global.is_multiple_of(local) {
            return Err(DeviceError::Api {
                call: "enqueue_kernel",
                message: format!("{entry}: global size {global} is not a multiple of local size {local}"),
            });
        }
        let launch = Launch {
            entry,
            global,
            local,
            args: &args,
        };
        run(&launch, &mut self.memory)?;
        self.apply_corruption(entry, &args)?;
        self.record(TraceEvent::Launch {
            kernel: entry,
            global,
            local,
            args: args.iter().flatten().copied().collect(),
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<(), DeviceError> {
        self.record(TraceEvent::Finish);
        Ok(())
    }

    fn builtin_source(&self, source_id: &str) -> Option<String> {
        Some(format!("// {source_id}: executed by the host device\n"))
    }

    fn builtin_binary(&self, _cache_name: &str) -> Option<Vec<u8>> {
        self.options
            .builtin_binaries
            .then(|| Self::binary_image(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refhash::{blake2b_256, blake2b_512};
    use rxcl_spec::{set_nonce, DEFAULT_BLOCK_TEMPLATE, REGISTERS_SIZE};

    fn device() -> HostDevice {
        HostDevice::open(0, 0, HostDeviceOptions::default()).expect("host device")
    }

    fn kernel(device: &mut HostDevice, name: &str) -> KernelId {
        let sources = vec![String::from("// test")];
        let program = device
            .build_program("test", ProgramInput::Source(&sources), "")
            .expect("build");
        device.create_kernel(program, name).expect("kernel")
    }

    #[test]
    fn open_rejects_unknown_indices() {
        let err = HostDevice::open(2, 0, HostDeviceOptions::default()).err().expect("platform");
        assert!(matches!(err, DeviceError::NoSuchPlatform { requested: 2, available: 1 }));
        assert_eq!(err.to_string(), "invalid platform ID (2), 1 platforms available");

        let err = HostDevice::open(0, 3, HostDeviceOptions::default()).err().expect("device");
        assert!(matches!(err, DeviceError::NoSuchDevice { requested: 3, available: 1 }));
    }

    #[test]
    fn allocations_respect_device_limits() {
        let mut device = HostDevice::open(
            0,
            0,
            HostDeviceOptions {
                global_mem: 4096,
                max_alloc: 3000,
                builtin_binaries: true,
            },
        )
        .expect("device");
        assert!(matches!(
            device.create_buffer(3001, BufferAccess::ReadWrite),
            Err(DeviceError::OutOfMemory { size: 3001 })
        ));
        let a = device.create_buffer(3000, BufferAccess::ReadWrite).expect("a");
        assert!(device.create_buffer(2000, BufferAccess::ReadWrite).is_err());
        device.release_buffer(a);
        assert_eq!(device.live_bytes(), 0);
        device.create_buffer(2000, BufferAccess::ReadWrite).expect("after release");
    }

    #[test]
    fn buffer_transfers_are_bounds_checked() {
        let mut device = device();
        let buffer = device.create_buffer(16, BufferAccess::ReadWrite).expect("buffer");
        device.write_buffer(buffer, 4, &[1, 2, 3, 4]).expect("write");
        device.fill_buffer(buffer, 0xaa, 12, 4).expect("fill");
        let mut out = [0u8; 16];
        device.read_buffer(buffer, 0, &mut out).expect("read");
        assert_eq!(&out[4..8], &[1, 2, 3, 4]);
        assert_eq!(&out[12..], &[0xaa; 4]);
        assert!(device.write_buffer(buffer, 14, &[0; 4]).is_err());
        assert!(device.read_buffer(buffer, 8, &mut [0u8; 9]).is_err());
    }

    #[test]
    fn build_failure_carries_log() {
        let mut device = device();
        let sources = vec![String::from("kernel void a() {}\n  #error missing GCN_VERSION\n")];
        let err = device
            .build_program("randomx_init.bin", ProgramInput::Source(&sources), "-Werror")
            .err()
            .expect("build error");
        let text = err.to_string();
        assert!(text.contains("randomx_init.bin"));
        assert!(text.contains("source 0:2: error: missing GCN_VERSION"));
    }

    #[test]
    fn foreign_binaries_are_rejected() {
        let mut device = device();
        let err = device
            .build_program("x", ProgramInput::Binary(b"\x7fELF"), "")
            .err()
            .expect("foreign binary");
        assert!(matches!(err, DeviceError::Build { .. }));

        let image = HostDevice::binary_image("-D X=1");
        let program = device
            .build_program("x", ProgramInput::Binary(&image), "-D X=1")
            .expect("own binary");
        assert_eq!(device.program_binary(program).expect("binary"), image);
    }

    #[test]
    fn unknown_entry_point_is_missing_kernel() {
        let mut device = device();
        let sources = vec![String::new()];
        let program = device
            .build_program("p", ProgramInput::Source(&sources), "")
            .expect("build");
        assert!(matches!(
            device.create_kernel(program, "blake2b_512_double_block_bench"),
            Err(DeviceError::MissingKernel(_))
        ));
    }

    #[test]
    fn initial_hash_offsets_nonce_per_lane() {
        let mut device = device();
        let lanes = 64;
        let hashes = device.create_buffer(lanes * 64, BufferAccess::ReadWrite).expect("hashes");
        let template = device
            .create_buffer(lanes * DEFAULT_BLOCK_TEMPLATE.len(), BufferAccess::ReadOnly)
            .expect("template");
        device.write_buffer(template, 0, &DEFAULT_BLOCK_TEMPLATE).expect("write");
        let k = kernel(&mut device, entry::INITIAL_HASH);
        device.set_kernel_arg(k, 0, KernelArg::Buffer(hashes)).expect("arg");
        device.set_kernel_arg(k, 1, KernelArg::Buffer(template)).expect("arg");
        device.set_kernel_arg(k, 2, KernelArg::U32(7000)).expect("arg");
        device.enqueue_kernel(k, lanes, 64).expect("launch");

        let mut out = vec![0u8; lanes * 64];
        device.read_buffer(hashes, 0, &mut out).expect("read");
        for lane in [0usize, 1, 63] {
            let mut message = DEFAULT_BLOCK_TEMPLATE;
            set_nonce(&mut message, 7000 + lane as u32);
            assert_eq!(&out[lane * 64..(lane + 1) * 64], &blake2b_512(&message)[..]);
        }
    }

    #[test]
    fn launch_geometry_is_enforced() {
        let mut device = device();
        let hashes = device.create_buffer(64 * 64, BufferAccess::ReadWrite).expect("hashes");
        let scratch = device.create_buffer(64 * 2112, BufferAccess::ReadWrite).expect("scratch");
        let k = kernel(&mut device, entry::FILL_SCRATCHPAD);
        device.set_kernel_arg(k, 0, KernelArg::Buffer(hashes)).expect("arg");
        device.set_kernel_arg(k, 1, KernelArg::Buffer(scratch)).expect("arg");
        device.set_kernel_arg(k, 2, KernelArg::U32(64)).expect("arg");

        assert!(device.enqueue_kernel(k, 64, 64).is_err());
        assert!(device.enqueue_kernel(k, 256, 32).is_err());
        device.enqueue_kernel(k, 256, 64).expect("W*4 threads");
    }

    #[test]
    fn corrupted_lane_changes_only_that_hash() {
        let mut device = device();
        let lanes = 64;
        let hashes = device.create_buffer(lanes * 64, BufferAccess::ReadWrite).expect("hashes");
        let registers = device
            .create_buffer(lanes * REGISTERS_SIZE, BufferAccess::ReadWrite)
            .expect("registers");
        let pattern: Vec<u8> = (0..lanes * REGISTERS_SIZE).map(|i| (i % 251) as u8).collect();
        device.write_buffer(registers, 0, &pattern).expect("write");
        device.corrupt_final_hash(5);

        let k = kernel(&mut device, entry::HASH_REGISTERS_32);
        device.set_kernel_arg(k, 0, KernelArg::Buffer(hashes)).expect("arg");
        device.set_kernel_arg(k, 1, KernelArg::Buffer(registers)).expect("arg");
        device.set_kernel_arg(k, 2, KernelArg::U32(REGISTERS_SIZE as u32)).expect("arg");
        device.enqueue_kernel(k, lanes, 64).expect("launch");

        let mut out = vec![0u8; lanes * 32];
        device.read_buffer(hashes, 0, &mut out).expect("read");
        let lane_hash = |lane: usize| blake2b_256(&pattern[lane * REGISTERS_SIZE..(lane + 1) * REGISTERS_SIZE]);
        assert_eq!(&out[4 * 32..5 * 32], &lane_hash(4)[..]);
        assert_ne!(&out[5 * 32..6 * 32], &lane_hash(5)[..]);
    }

    #[test]
    fn trace_records_commands_in_order() {
        let mut device = device();
        device.enable_trace();
        let buffer = device.create_buffer(8, BufferAccess::ReadWrite).expect("buffer");
        device.fill_buffer(buffer, 0, 0, 8).expect("fill");
        device.finish().expect("finish");
        assert_eq!(
            device.take_trace(),
            vec![
                TraceEvent::Fill { buffer, offset: 0, len: 8 },
                TraceEvent::Finish,
            ]
        );
        assert!(device.take_trace().is_empty());
    }

    #[test]
    fn mapped_buffers_are_read_only() {
        use crate::dataset::{DatasetBuilder, LargePages};
        use crate::refhash::ReferenceEngine;

        let dataset = DatasetBuilder::new(ReferenceEngine::new(2).with_cache_items(2), LargePages::new(false))
            .threads(1)
            .build(b"seed")
            .expect("dataset");
        let expected = dataset.bytes().to_vec();
        let mut device = device();
        let mapped = device.map_host(Arc::new(dataset)).expect("map");
        let mut out = vec![0u8; expected.len()];
        device.read_buffer(mapped, 0, &mut out).expect("read");
        assert_eq!(out, expected);
        assert!(device.write_buffer(mapped, 0, &[1]).is_err());
        assert_eq!(device.live_bytes(), 0);
    }
}
