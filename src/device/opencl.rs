//! OpenCL device on top of the `ocl` crate.
//!
//! Buffers and programs go through the high-level `ocl` types. Kernels use
//! `ocl::core` directly because their argument lists are only known at
//! runtime.

use std::sync::Arc;

use ocl::core::{self, ArgVal, Event, Status};
use ocl::enums::{DeviceInfo as ClDeviceInfo, DeviceInfoResult, ProgramInfo, ProgramInfoResult};
use ocl::flags::MemFlags;
use ocl::{Buffer, Context, Device, Platform, Program, Queue};

use super::{
    BufferAccess, BufferId, ComputeDevice, DeviceError, DeviceInfo, KernelArg, KernelId,
    ProgramId, ProgramInput,
};
use crate::dataset::Dataset;

enum ClBuffer {
    Owned(Buffer<u8>),
    /// Reads the dataset in place; the `Arc` keeps the host memory alive.
    Mapped(Buffer<u8>, Arc<Dataset>),
}

impl ClBuffer {
    fn buffer(&self) -> &Buffer<u8> {
        match self {
            Self::Owned(buffer) | Self::Mapped(buffer, _) => buffer,
        }
    }
}

pub struct OpenClDevice {
    info: DeviceInfo,
    device: Device,
    context: Context,
    queue: Queue,
    buffers: Vec<Option<ClBuffer>>,
    programs: Vec<Option<Program>>,
    kernels: Vec<core::Kernel>,
}

impl OpenClDevice {
    pub fn open(platform_id: usize, device_id: usize) -> Result<Self, DeviceError> {
        let platforms = Platform::list();
        let platform = *platforms
            .get(platform_id)
            .ok_or(DeviceError::NoSuchPlatform {
                requested: platform_id,
                available: platforms.len(),
            })?;

        let devices = Device::list_all(platform).map_err(api("clGetDeviceIDs"))?;
        let device = *devices.get(device_id).ok_or(DeviceError::NoSuchDevice {
            requested: device_id,
            available: devices.len(),
        })?;

        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()
            .map_err(api("clCreateContext"))?;
        let queue = Queue::new(&context, device, None).map_err(api("clCreateCommandQueue"))?;

        let info = DeviceInfo {
            name: device.name().map_err(api("clGetDeviceInfo"))?,
            vendor: device.vendor().map_err(api("clGetDeviceInfo"))?,
            global_mem: info_u64(&device, ClDeviceInfo::GlobalMemSize),
            max_alloc: info_u64(&device, ClDeviceInfo::MaxMemAllocSize),
            local_mem: info_u64(&device, ClDeviceInfo::LocalMemSize),
            clock_mhz: info_u64(&device, ClDeviceInfo::MaxClockFrequency) as u32,
            compute_units: info_u64(&device, ClDeviceInfo::MaxComputeUnits) as u32,
            version: info_text(&device, ClDeviceInfo::Version),
            driver_version: info_text(&device, ClDeviceInfo::DriverVersion),
            extensions: info_text(&device, ClDeviceInfo::Extensions),
        };

        Ok(Self {
            info,
            device,
            context,
            queue,
            buffers: Vec::new(),
            programs: Vec::new(),
            kernels: Vec::new(),
        })
    }

    fn insert_buffer(&mut self, buffer: ClBuffer) -> BufferId {
        if let Some(index) = self.buffers.iter().position(Option::is_none) {
            self.buffers[index] = Some(buffer);
            return BufferId(index);
        }
        self.buffers.push(Some(buffer));
        BufferId(self.buffers.len() - 1)
    }

    fn buffer(&self, id: BufferId, call: &'static str) -> Result<&Buffer<u8>, DeviceError> {
        self.buffers
            .get(id.0)
            .and_then(Option::as_ref)
            .map(ClBuffer::buffer)
            .ok_or_else(|| DeviceError::Api {
                call,
                message: format!("unknown buffer handle {}", id.0),
            })
    }

    fn program(&self, id: ProgramId, call: &'static str) -> Result<&Program, DeviceError> {
        self.programs
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| DeviceError::Api {
                call,
                message: format!("unknown program handle {}", id.0),
            })
    }

    fn kernel(&self, id: KernelId, call: &'static str) -> Result<&core::Kernel, DeviceError> {
        self.kernels.get(id.0).ok_or_else(|| DeviceError::Api {
            call,
            message: format!("unknown kernel handle {}", id.0),
        })
    }
}

impl ComputeDevice for OpenClDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(&mut self, size: usize, access: BufferAccess) -> Result<BufferId, DeviceError> {
        if size as u64 > self.info.max_alloc {
            return Err(DeviceError::OutOfMemory { size });
        }
        let flags = match access {
            BufferAccess::ReadWrite => MemFlags::new().read_write(),
            BufferAccess::ReadOnly => MemFlags::new().read_only(),
        };
        let buffer = Buffer::<u8>::builder()
            .queue(self.queue.clone())
            .flags(flags)
            .len(size)
            .build()
            .map_err(|err| out_of_memory_or(err, size, "clCreateBuffer"))?;
        Ok(self.insert_buffer(ClBuffer::Owned(buffer)))
    }

    fn map_host(&mut self, dataset: Arc<Dataset>) -> Result<BufferId, DeviceError> {
        let buffer = Buffer::<u8>::builder()
            .queue(self.queue.clone())
            .flags(MemFlags::new().read_only().use_host_ptr())
            .len(dataset.len())
            .use_host_slice(dataset.bytes())
            .build()
            .map_err(|err| out_of_memory_or(err, dataset.len(), "clCreateBuffer"))?;
        Ok(self.insert_buffer(ClBuffer::Mapped(buffer, dataset)))
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        if let Some(slot) = self.buffers.get_mut(buffer.0) {
            *slot = None;
        }
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: usize, data: &[u8]) -> Result<(), DeviceError> {
        if data.is_empty() {
            return Ok(());
        }
        self.buffer(buffer, "clEnqueueWriteBuffer")?
            .cmd()
            .offset(offset)
            .write(data)
            .enq()
            .map_err(api("clEnqueueWriteBuffer"))
    }

    fn read_buffer(&mut self, buffer: BufferId, offset: usize, out: &mut [u8]) -> Result<(), DeviceError> {
        if out.is_empty() {
            return Ok(());
        }
        self.buffer(buffer, "clEnqueueReadBuffer")?
            .cmd()
            .offset(offset)
            .read(out)
            .enq()
            .map_err(api("clEnqueueReadBuffer"))
    }

    fn fill_buffer(&mut self, buffer: BufferId, pattern: u8, offset: usize, len: usize) -> Result<(), DeviceError> {
        if len == 0 {
            return Ok(());
        }
        self.buffer(buffer, "clEnqueueFillBuffer")?
            .cmd()
            .offset(offset)
            .fill(pattern, Some(len))
            .enq()
            .map_err(api("clEnqueueFillBuffer"))
    }

    fn build_program(
        &mut self,
        name: &str,
        input: ProgramInput<'_>,
        options: &str,
    ) -> Result<ProgramId, DeviceError> {
        let built = match input {
            ProgramInput::Source(sources) => Program::builder()
                .devices(self.device)
                .src(sources.join("\n"))
                .cmplr_opt(options)
                .build(&self.context),
            ProgramInput::Binary(binary) => {
                let binaries = [binary];
                Program::builder()
                    .devices(self.device)
                    .binaries(&binaries)
                    .cmplr_opt(options)
                    .build(&self.context)
            }
        };
        let program = built.map_err(|err| DeviceError::Build {
            program: name.to_string(),
            log: err.to_string(),
        })?;
        self.programs.push(Some(program));
        Ok(ProgramId(self.programs.len() - 1))
    }

    fn program_binary(&self, program: ProgramId) -> Result<Vec<u8>, DeviceError> {
        let program = self.program(program, "clGetProgramInfo")?;
        match program
            .info(ProgramInfo::Binaries)
            .map_err(api("clGetProgramInfo"))?
        {
            ProgramInfoResult::Binaries(mut binaries) if !binaries.is_empty() => {
                Ok(binaries.swap_remove(0))
            }
            _ => Err(DeviceError::Api {
                call: "clGetProgramInfo",
                message: "program has no binary for this device".to_string(),
            }),
        }
    }

    fn release_program(&mut self, program: ProgramId) {
        if let Some(slot) = self.programs.get_mut(program.0) {
            *slot = None;
        }
    }

    fn create_kernel(&mut self, program: ProgramId, entry_point: &str) -> Result<KernelId, DeviceError> {
        let program = self.program(program, "clCreateKernel")?;
        let kernel = core::create_kernel(program.as_core(), entry_point)
            .map_err(|_| DeviceError::MissingKernel(entry_point.to_string()))?;
        self.kernels.push(kernel);
        Ok(KernelId(self.kernels.len() - 1))
    }

    fn set_kernel_arg(&mut self, kernel: KernelId, index: u32, arg: KernelArg) -> Result<(), DeviceError> {
        let handle = self.kernel(kernel, "clSetKernelArg")?;
        match arg {
            KernelArg::Buffer(buffer) => {
                let buffer = self.buffer(buffer, "clSetKernelArg")?;
                core::set_kernel_arg(handle, index, ArgVal::mem(buffer.as_core()))
            }
            KernelArg::U32(value) => core::set_kernel_arg(handle, index, ArgVal::scalar(&value)),
        }
        .map_err(|err| DeviceError::Api {
            call: "clSetKernelArg",
            message: format!("argument {index}: {err}"),
        })
    }

    fn enqueue_kernel(&mut self, kernel: KernelId, global: usize, local: usize) -> Result<(), DeviceError> {
        let handle = self.kernel(kernel, "clEnqueueNDRangeKernel")?;
        // Every argument is bound before launch and buffers outlive the queue.
        unsafe {
            core::enqueue_kernel(
                self.queue.as_core(),
                handle,
                1,
                None,
                &[global, 1, 1],
                Some([local, 1, 1]),
                None::<&Event>,
                None::<&mut Event>,
            )
        }
        .map_err(|err| match err.api_status() {
            Some(Status::CL_MEM_OBJECT_ALLOCATION_FAILURE) | Some(Status::CL_OUT_OF_RESOURCES) => {
                DeviceError::OutOfMemory { size: 0 }
            }
            _ => DeviceError::Api {
                call: "clEnqueueNDRangeKernel",
                message: err.to_string(),
            },
        })
    }

    fn finish(&mut self) -> Result<(), DeviceError> {
        self.queue.finish().map_err(api("clFinish"))
    }
}

fn api<E: std::fmt::Display>(call: &'static str) -> impl Fn(E) -> DeviceError {
    move |err| DeviceError::Api {
        call,
        message: err.to_string(),
    }
}

fn out_of_memory_or(err: ocl::Error, size: usize, call: &'static str) -> DeviceError {
    match err.api_status() {
        Some(Status::CL_MEM_OBJECT_ALLOCATION_FAILURE)
        | Some(Status::CL_OUT_OF_RESOURCES)
        | Some(Status::CL_OUT_OF_HOST_MEMORY)
        | Some(Status::CL_INVALID_BUFFER_SIZE) => DeviceError::OutOfMemory { size },
        _ => DeviceError::Api {
            call,
            message: err.to_string(),
        },
    }
}

fn info_u64(device: &Device, kind: ClDeviceInfo) -> u64 {
    match device.info(kind) {
        Ok(DeviceInfoResult::GlobalMemSize(value))
        | Ok(DeviceInfoResult::MaxMemAllocSize(value))
        | Ok(DeviceInfoResult::LocalMemSize(value)) => value,
        Ok(DeviceInfoResult::MaxClockFrequency(value))
        | Ok(DeviceInfoResult::MaxComputeUnits(value)) => u64::from(value),
        _ => 0,
    }
}

fn info_text(device: &Device, kind: ClDeviceInfo) -> String {
    device
        .info(kind)
        .map(|result| result.to_string())
        .unwrap_or_default()
}
