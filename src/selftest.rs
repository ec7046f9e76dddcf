//! Kernel self-test (`--test`).
//!
//! Every base kernel is launched once over a small batch and its output is
//! compared lane by lane with the CPU implementation. The scratchpad fill and
//! fold kernels are then timed.

use std::time::Instant;

use anyhow::{bail, Context, Result};
use rxcl_spec::{
    kernels as entry, set_nonce, ProtocolParams, ENTROPY_SIZE, INITIAL_HASH_SIZE,
    LOCAL_GROUP_SIZE, OUTPUT_HASH_SIZE, REGISTERS_SIZE, REGISTER_FOLD_OFFSET, SCRATCHPAD_SLACK,
};
use serde::Serialize;

use crate::device::{
    BufferAccess, BufferId, ComputeDevice, DevicePool, KernelArg, KernelId, LaneFootprint,
};
use crate::kernels::KernelSet;
use crate::refhash::{self, blake2b_256, blake2b_512};
use crate::ui;

const HASHES: &str = "test hashes";
const TEMPLATE: &str = "test template";
const REGISTERS: &str = "test registers";
const SCRATCHPADS: &str = "test scratchpads";
const ENTROPY: &str = "test entropy";

#[derive(Clone, Debug, Serialize)]
pub struct SelfTestReport {
    pub lanes: usize,
    pub passed: Vec<&'static str>,
    pub fill_scratchpads_per_sec: f64,
    pub fold_scratchpads_per_sec: f64,
}

struct Buffers {
    hashes: BufferId,
    template: BufferId,
    registers: BufferId,
    scratchpads: BufferId,
    entropy: BufferId,
}

/// Memory one self-test lane occupies on the device.
pub fn lane_footprint(params: &ProtocolParams, template_len: usize) -> LaneFootprint {
    LaneFootprint::from_sizes([
        INITIAL_HASH_SIZE,
        template_len,
        REGISTERS_SIZE,
        params.scratchpad_stride(),
        ENTROPY_SIZE,
    ])
}

pub fn run_self_test<D: ComputeDevice>(
    pool: &mut DevicePool<D>,
    kernels: &KernelSet,
    lanes: usize,
    params: &ProtocolParams,
    template: &[u8],
    bench_iterations: u32,
) -> Result<SelfTestReport> {
    if lanes == 0 || !lanes.is_multiple_of(LOCAL_GROUP_SIZE) {
        bail!("self-test lane count must be a non-zero multiple of {LOCAL_GROUP_SIZE}");
    }
    let result = allocate(pool, lanes, params, template.len()).and_then(|buffers| {
        run_checks(
            pool.device_mut(),
            kernels,
            &buffers,
            lanes,
            params,
            template,
            bench_iterations,
        )
    });
    for name in [HASHES, TEMPLATE, REGISTERS, SCRATCHPADS, ENTROPY] {
        pool.release(name);
    }
    result
}

fn allocate<D: ComputeDevice>(
    pool: &mut DevicePool<D>,
    lanes: usize,
    params: &ProtocolParams,
    template_len: usize,
) -> Result<Buffers> {
    Ok(Buffers {
        hashes: pool.allocate(HASHES, lanes * INITIAL_HASH_SIZE, BufferAccess::ReadWrite)?,
        template: pool.allocate(TEMPLATE, lanes * template_len, BufferAccess::ReadOnly)?,
        registers: pool.allocate(REGISTERS, lanes * REGISTERS_SIZE, BufferAccess::ReadWrite)?,
        scratchpads: pool.allocate(
            SCRATCHPADS,
            lanes * params.scratchpad_stride(),
            BufferAccess::ReadWrite,
        )?,
        entropy: pool.allocate(ENTROPY, lanes * ENTROPY_SIZE, BufferAccess::ReadWrite)?,
    })
}

fn run_checks<D: ComputeDevice>(
    device: &mut D,
    kernels: &KernelSet,
    buffers: &Buffers,
    lanes: usize,
    params: &ProtocolParams,
    template: &[u8],
    bench_iterations: u32,
) -> Result<SelfTestReport> {
    let mut passed = Vec::new();
    let batch = KernelArg::U32(lanes as u32);
    let stride = params.scratchpad_stride();
    let scratchpad_size = stride - SCRATCHPAD_SLACK;

    device.write_buffer(buffers.template, 0, template)?;
    let initial = kernels.get(entry::INITIAL_HASH)?;
    set_args(
        device,
        initial,
        &[
            KernelArg::Buffer(buffers.hashes),
            KernelArg::Buffer(buffers.template),
            KernelArg::U32(0),
        ],
    )?;
    device.enqueue_kernel(initial, lanes, LOCAL_GROUP_SIZE)?;
    let gpu = read(device, buffers.hashes, lanes * INITIAL_HASH_SIZE)?;
    let mut message = template.to_vec();
    for lane in 0..lanes {
        set_nonce(&mut message, lane as u32);
        compare(entry::INITIAL_HASH, lane, &gpu, INITIAL_HASH_SIZE, &blake2b_512(&message))?;
    }
    pass(&mut passed, entry::INITIAL_HASH);

    let pattern: Vec<u8> = (0..lanes * REGISTERS_SIZE)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8)
        .collect();
    for (name, width) in [
        (entry::HASH_REGISTERS_32, OUTPUT_HASH_SIZE),
        (entry::HASH_REGISTERS_64, INITIAL_HASH_SIZE),
    ] {
        device.write_buffer(buffers.registers, 0, &pattern)?;
        let kernel = kernels.get(name)?;
        set_args(
            device,
            kernel,
            &[
                KernelArg::Buffer(buffers.hashes),
                KernelArg::Buffer(buffers.registers),
                KernelArg::U32(REGISTERS_SIZE as u32),
            ],
        )?;
        device.enqueue_kernel(kernel, lanes, LOCAL_GROUP_SIZE)?;
        let gpu = read(device, buffers.hashes, lanes * width)?;
        for lane in 0..lanes {
            let registers = &pattern[lane * REGISTERS_SIZE..(lane + 1) * REGISTERS_SIZE];
            if width == OUTPUT_HASH_SIZE {
                compare(name, lane, &gpu, width, &blake2b_256(registers))?;
            } else {
                compare(name, lane, &gpu, width, &blake2b_512(registers))?;
            }
        }
        pass(&mut passed, name);
    }

    // The 64-byte register hashes left in the hash buffer seed the fill.
    let seeds = read(device, buffers.hashes, lanes * INITIAL_HASH_SIZE)?;
    let fill = kernels.get(entry::FILL_SCRATCHPAD)?;
    set_args(
        device,
        fill,
        &[
            KernelArg::Buffer(buffers.hashes),
            KernelArg::Buffer(buffers.scratchpads),
            batch,
        ],
    )?;
    device.enqueue_kernel(fill, lanes * 4, LOCAL_GROUP_SIZE)?;
    let scratchpads = read(device, buffers.scratchpads, lanes * stride)?;
    let hashes = read(device, buffers.hashes, lanes * INITIAL_HASH_SIZE)?;
    let mut expected = vec![0u8; scratchpad_size];
    for lane in 0..lanes {
        let mut hash = lane_hash(&seeds, lane);
        refhash::fill_scratchpad(&mut hash, &mut expected);
        compare(entry::FILL_SCRATCHPAD, lane, &scratchpads, stride, &expected)?;
        compare(entry::FILL_SCRATCHPAD, lane, &hashes, INITIAL_HASH_SIZE, &hash)?;
    }
    pass(&mut passed, entry::FILL_SCRATCHPAD);

    let entropy_kernel = kernels.get(entry::FILL_ENTROPY)?;
    set_args(
        device,
        entropy_kernel,
        &[
            KernelArg::Buffer(buffers.hashes),
            KernelArg::Buffer(buffers.entropy),
            batch,
        ],
    )?;
    device.enqueue_kernel(entropy_kernel, lanes * 4, LOCAL_GROUP_SIZE)?;
    let entropy = read(device, buffers.entropy, lanes * ENTROPY_SIZE)?;
    let mut expected = vec![0u8; ENTROPY_SIZE];
    for lane in 0..lanes {
        refhash::fill_entropy(&lane_hash(&hashes, lane), &mut expected);
        compare(entry::FILL_ENTROPY, lane, &entropy, ENTROPY_SIZE, &expected)?;
    }
    pass(&mut passed, entry::FILL_ENTROPY);

    device.write_buffer(buffers.registers, 0, &pattern)?;
    let fold = kernels.get(entry::FOLD_SCRATCHPAD)?;
    set_args(
        device,
        fold,
        &[
            KernelArg::Buffer(buffers.scratchpads),
            KernelArg::Buffer(buffers.registers),
            KernelArg::U32(REGISTER_FOLD_OFFSET),
            KernelArg::U32(REGISTERS_SIZE as u32),
            batch,
        ],
    )?;
    device.enqueue_kernel(fold, lanes * 4, LOCAL_GROUP_SIZE)?;
    let registers = read(device, buffers.registers, lanes * REGISTERS_SIZE)?;
    for lane in 0..lanes {
        let mut expected = pattern[lane * REGISTERS_SIZE..(lane + 1) * REGISTERS_SIZE].to_vec();
        let scratchpad = &scratchpads[lane * stride..lane * stride + scratchpad_size];
        refhash::fold_scratchpad(scratchpad, &mut expected);
        compare(entry::FOLD_SCRATCHPAD, lane, &registers, REGISTERS_SIZE, &expected)?;
    }
    pass(&mut passed, entry::FOLD_SCRATCHPAD);

    let fill_scratchpads_per_sec = bench(device, fill, lanes, bench_iterations)?;
    ui::info(
        "TEST",
        format!("{} | {fill_scratchpads_per_sec:.0} scratchpads/s", entry::FILL_SCRATCHPAD),
    );
    let fold_scratchpads_per_sec = bench(device, fold, lanes, bench_iterations)?;
    ui::info(
        "TEST",
        format!("{} | {fold_scratchpads_per_sec:.0} scratchpads/s", entry::FOLD_SCRATCHPAD),
    );

    Ok(SelfTestReport {
        lanes,
        passed,
        fill_scratchpads_per_sec,
        fold_scratchpads_per_sec,
    })
}

fn lane_hash(hashes: &[u8], lane: usize) -> [u8; INITIAL_HASH_SIZE] {
    let mut hash = [0u8; INITIAL_HASH_SIZE];
    hash.copy_from_slice(&hashes[lane * INITIAL_HASH_SIZE..(lane + 1) * INITIAL_HASH_SIZE]);
    hash
}

fn set_args<D: ComputeDevice>(device: &mut D, kernel: KernelId, args: &[KernelArg]) -> Result<()> {
    for (index, arg) in args.iter().enumerate() {
        device.set_kernel_arg(kernel, index as u32, *arg)?;
    }
    Ok(())
}

fn read<D: ComputeDevice>(device: &mut D, buffer: BufferId, len: usize) -> Result<Vec<u8>> {
    device.finish()?;
    let mut out = vec![0u8; len];
    device.read_buffer(buffer, 0, &mut out)?;
    Ok(out)
}

/// Compares the start of `lane`'s `width`-byte slot with `expected`.
fn compare(name: &str, lane: usize, gpu: &[u8], width: usize, expected: &[u8]) -> Result<()> {
    let actual = gpu
        .get(lane * width..lane * width + expected.len())
        .with_context(|| format!("{name} produced no output for lane {lane}"))?;
    if actual != expected {
        bail!("{name} test failed at lane {lane}");
    }
    Ok(())
}

fn pass(passed: &mut Vec<&'static str>, name: &'static str) {
    ui::success("TEST", format!("{name} test passed"));
    passed.push(name);
}

fn bench<D: ComputeDevice>(device: &mut D, kernel: KernelId, lanes: usize, iterations: u32) -> Result<f64> {
    let iterations = iterations.max(1);
    let started = Instant::now();
    for _ in 0..iterations {
        device.enqueue_kernel(kernel, lanes * 4, LOCAL_GROUP_SIZE)?;
    }
    device.finish()?;
    let elapsed = started.elapsed().as_secs_f64().max(1e-6);
    Ok(lanes as f64 * f64::from(iterations) / elapsed)
}
