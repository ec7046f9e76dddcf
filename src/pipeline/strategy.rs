use anyhow::{bail, Context, Result};
use rxcl_spec::{
    kernels as entry, ProtocolParams, LOCAL_GROUP_SIZE, REGISTERS_SIZE, VM_STATE_SIZE,
};

use super::WorkingBuffers;
use crate::device::{ComputeDevice, KernelArg, KernelId};
use crate::kernels::{CachePolicy, KernelSet, ProgramSpec};

const EXECUTE_FIRST_ARG: u32 = 6;
const EXECUTE_LAST_ARG: u32 = 7;

/// How the program stage runs on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputeStrategy {
    /// Each lane's program is compiled to device code and run in one launch.
    Native,
    /// The program is interpreted in `2^bfactor` launches per program.
    Portable { bfactor: u32, workers_per_hash: u32 },
}

impl ComputeStrategy {
    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native)
    }

    /// Bytes between consecutive lanes' register files in the VM state buffer.
    pub fn register_stride(&self) -> usize {
        match self {
            Self::Native => REGISTERS_SIZE,
            Self::Portable { .. } => VM_STATE_SIZE,
        }
    }

    pub fn substeps(&self) -> u32 {
        match self {
            Self::Native => 1,
            Self::Portable { bfactor, .. } => 1 << bfactor,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Native => "native".to_string(),
            Self::Portable {
                bfactor,
                workers_per_hash,
            } => format!("portable (bfactor {bfactor}, {workers_per_hash} workers per hash)"),
        }
    }

    /// Programs to build for this strategy, base kernels first.
    pub fn programs(&self, device_name: &str, params: &ProtocolParams) -> Vec<ProgramSpec<'static>> {
        let mut programs = vec![base_program()];

        match self {
            Self::Portable {
                workers_per_hash, ..
            } => programs.push(ProgramSpec {
                cache_name: entry::PORTABLE_CACHE,
                sources: &[entry::PORTABLE_SOURCE],
                entry_points: &[entry::PORTABLE_INIT, entry::PORTABLE_EXECUTE],
                options: format!("-D WORKERS_PER_HASH={workers_per_hash}"),
                policy: CachePolicy::CompileThenCache,
            }),
            Self::Native => {
                let (run_binary, gcn_version) = if device_name.to_uppercase() == "GFX900" {
                    (entry::NATIVE_RUN_GFX900, 14)
                } else {
                    (entry::NATIVE_RUN_GFX803, 12)
                };
                programs.push(ProgramSpec {
                    cache_name: entry::NATIVE_INIT_CACHE,
                    sources: &[entry::NATIVE_INIT_SOURCE],
                    entry_points: &[entry::NATIVE_INIT],
                    options: format!("-D GCN_VERSION={gcn_version}"),
                    policy: CachePolicy::AlwaysCompile,
                });
                programs.push(ProgramSpec {
                    cache_name: run_binary,
                    sources: &[entry::NATIVE_RUN_SOURCE],
                    entry_points: &[entry::NATIVE_RUN],
                    options: format!("-D RANDOMX_PROGRAM_ITERATIONS={}", params.program_iterations),
                    policy: CachePolicy::AlwaysUseBinary,
                });
            }
        }
        programs
    }

    pub(super) fn kernels(&self, kernels: &KernelSet) -> Result<StrategyKernels> {
        Ok(match self {
            Self::Native => StrategyKernels::Native {
                init: kernels.get(entry::NATIVE_INIT)?,
                run: kernels.get(entry::NATIVE_RUN)?,
            },
            Self::Portable {
                bfactor,
                workers_per_hash,
            } => StrategyKernels::Portable {
                init: kernels.get(entry::PORTABLE_INIT)?,
                execute: kernels.get(entry::PORTABLE_EXECUTE)?,
                bfactor: *bfactor,
                workers_per_hash: *workers_per_hash,
            },
        })
    }
}

/// Hashing and fill kernels shared by both strategies and the self-test.
pub fn base_program() -> ProgramSpec<'static> {
    ProgramSpec {
        cache_name: entry::BASE_CACHE,
        sources: &entry::BASE_SOURCES,
        entry_points: &entry::BASE_ENTRY_POINTS,
        options: String::new(),
        policy: CachePolicy::CompileThenCache,
    }
}

/// Program-stage kernels with their run-wide arguments bound.
pub(super) enum StrategyKernels {
    Native {
        init: KernelId,
        run: KernelId,
    },
    Portable {
        init: KernelId,
        execute: KernelId,
        bfactor: u32,
        workers_per_hash: u32,
    },
}

impl StrategyKernels {
    pub(super) fn substeps(&self) -> u32 {
        match self {
            Self::Native { .. } => 1,
            Self::Portable { bfactor, .. } => 1 << bfactor,
        }
    }

    pub(super) fn bind<D: ComputeDevice>(
        &self,
        device: &mut D,
        buffers: &WorkingBuffers,
        params: &ProtocolParams,
        lanes: usize,
    ) -> Result<()> {
        let batch = KernelArg::U32(lanes as u32);
        match self {
            Self::Native { init, run } => {
                let (Some(intermediate), Some(compiled)) = (buffers.intermediate, buffers.compiled) else {
                    bail!("native strategy needs program buffers");
                };
                bind_args(
                    device,
                    *init,
                    entry::NATIVE_INIT,
                    &[
                        KernelArg::Buffer(buffers.entropy),
                        KernelArg::Buffer(buffers.vm_states),
                        KernelArg::Buffer(intermediate),
                        KernelArg::Buffer(compiled),
                        batch,
                    ],
                )?;
                bind_args(
                    device,
                    *run,
                    entry::NATIVE_RUN,
                    &[
                        KernelArg::Buffer(buffers.dataset),
                        KernelArg::Buffer(buffers.scratchpads),
                        KernelArg::Buffer(buffers.vm_states),
                        KernelArg::Buffer(buffers.rounding),
                        KernelArg::Buffer(compiled),
                        batch,
                        KernelArg::U32(params.rx_parameters()),
                    ],
                )
            }
            Self::Portable {
                init,
                execute,
                bfactor,
                ..
            } => {
                bind_args(
                    device,
                    *init,
                    entry::PORTABLE_INIT,
                    &[
                        KernelArg::Buffer(buffers.entropy),
                        KernelArg::Buffer(buffers.vm_states),
                    ],
                )?;
                bind_args(
                    device,
                    *execute,
                    entry::PORTABLE_EXECUTE,
                    &[
                        KernelArg::Buffer(buffers.vm_states),
                        KernelArg::Buffer(buffers.rounding),
                        KernelArg::Buffer(buffers.scratchpads),
                        KernelArg::Buffer(buffers.dataset),
                        batch,
                        KernelArg::U32(params.program_iterations >> bfactor),
                        KernelArg::U32(0),
                        KernelArg::U32(0),
                    ],
                )
            }
        }
    }

    /// Loads the lane programs from the entropy buffer.
    pub(super) fn enqueue_init<D: ComputeDevice>(&self, device: &mut D, lanes: usize) -> Result<()> {
        match self {
            Self::Native { init, .. } => {
                device
                    .enqueue_kernel(*init, lanes, LOCAL_GROUP_SIZE)
                    .context(entry::NATIVE_INIT)?;
                // Compiled programs must be complete before the run kernel reads them.
                device
                    .finish()
                    .context("failed to drain the queue before the program run")?;
            }
            Self::Portable { init, .. } => {
                device
                    .enqueue_kernel(*init, lanes * 8, 32)
                    .context(entry::PORTABLE_INIT)?;
            }
        }
        Ok(())
    }

    pub(super) fn enqueue_substep<D: ComputeDevice>(
        &self,
        device: &mut D,
        lanes: usize,
        substep: u32,
    ) -> Result<()> {
        match self {
            Self::Native { run, .. } => {
                device
                    .enqueue_kernel(*run, lanes * 64, LOCAL_GROUP_SIZE)
                    .context(entry::NATIVE_RUN)?;
            }
            Self::Portable {
                execute,
                workers_per_hash,
                ..
            } => {
                let first = u32::from(substep == 0);
                let last = u32::from(substep + 1 == self.substeps());
                device
                    .set_kernel_arg(*execute, EXECUTE_FIRST_ARG, KernelArg::U32(first))
                    .context(entry::PORTABLE_EXECUTE)?;
                device
                    .set_kernel_arg(*execute, EXECUTE_LAST_ARG, KernelArg::U32(last))
                    .context(entry::PORTABLE_EXECUTE)?;
                let (global, local) = if *workers_per_hash == 16 {
                    (lanes * 16, 32)
                } else {
                    (lanes * 8, 16)
                };
                device
                    .enqueue_kernel(*execute, global, local)
                    .context(entry::PORTABLE_EXECUTE)?;
            }
        }
        Ok(())
    }
}

pub(super) fn bind_args<D: ComputeDevice>(
    device: &mut D,
    kernel: KernelId,
    name: &str,
    args: &[KernelArg],
) -> Result<()> {
    for (index, arg) in args.iter().enumerate() {
        device
            .set_kernel_arg(kernel, index as u32, *arg)
            .with_context(|| format!("failed to set argument {index} of {name}"))?;
    }
    Ok(())
}
