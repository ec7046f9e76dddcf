//! Reference hash family shared by the host device kernels and the CPU oracle.
//!
//! The lane pipeline mirrors the RandomX round structure (initial hash,
//! scratchpad fill, per-program entropy, VM execution, scratchpad fold, final
//! compression), with cheap mixing in place of the AES and VM internals. The
//! BLAKE2b stages are the real ones, so the kernel self-test applies to them
//! unchanged.

use std::sync::Arc;

use anyhow::{bail, Result};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Blake2b512, Digest};
use rxcl_spec::{
    ProtocolParams, DATASET_ITEM_SIZE, ENTROPY_SIZE, OUTPUT_HASH_SIZE, REGISTERS_SIZE,
    REGISTER_FOLD_OFFSET, VM_STATE_SIZE,
};

use crate::dataset::{Dataset, DatasetEngine};
use crate::validator::{HashOracle, OracleVm, VmFlags};

type Blake2b256 = Blake2b<U32>;

pub const PROGRAM_SIZE: usize = VM_STATE_SIZE - REGISTERS_SIZE;
const REGISTER_COUNT: usize = 16;
const REGISTER_SEED_SIZE: usize = REGISTER_COUNT * 8;
const MA_OFFSET: usize = 128;
const MX_OFFSET: usize = 136;
const IC_OFFSET: usize = 144;

const SCRATCHPAD_DOMAIN: u64 = 0x7363_7261_7463_6870;
const ENTROPY_DOMAIN: u64 = 0x656e_7472_6f70_7921;
const DATASET_DOMAIN: u64 = 0x6461_7461_7365_7473;
const DEFAULT_CACHE_ITEMS: usize = 1 << 14;

pub fn blake2b_512(data: &[u8]) -> [u8; 64] {
    let digest = Blake2b512::digest(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

pub fn blake2b_256(data: &[u8]) -> [u8; OUTPUT_HASH_SIZE] {
    let digest = Blake2b256::digest(data);
    let mut out = [0u8; OUTPUT_HASH_SIZE];
    out.copy_from_slice(&digest);
    out
}

pub fn initial_hash(message: &[u8]) -> [u8; 64] {
    blake2b_512(message)
}

/// Expands `hash` over the scratchpad and advances `hash` to the generator state.
pub fn fill_scratchpad(hash: &mut [u8; 64], scratchpad: &mut [u8]) {
    *hash = expand(hash, SCRATCHPAD_DOMAIN, scratchpad);
}

pub fn fill_entropy(hash: &[u8; 64], entropy: &mut [u8]) {
    expand(hash, ENTROPY_DOMAIN, &mut entropy[..ENTROPY_SIZE]);
}

/// Seeds the register file from entropy and clears the VM bookkeeping words.
pub fn load_registers(entropy: &[u8], registers: &mut [u8]) {
    registers[..REGISTER_SEED_SIZE].copy_from_slice(&entropy[..REGISTER_SEED_SIZE]);
    registers[REGISTER_SEED_SIZE..REGISTERS_SIZE].fill(0);
}

pub fn load_program(entropy: &[u8], program: &mut [u8]) {
    program[..PROGRAM_SIZE]
        .copy_from_slice(&entropy[REGISTER_SEED_SIZE..REGISTER_SEED_SIZE + PROGRAM_SIZE]);
}

pub fn begin_program(registers: &mut [u8]) {
    let ma = register(registers, 0) ^ register(registers, 1);
    let mx = register(registers, 2) ^ register(registers, 3);
    write_u64(registers, MA_OFFSET, ma);
    write_u64(registers, MX_OFFSET, mx);
    write_u32(registers, IC_OFFSET, 0);
}

/// Runs `count` VM iterations, resuming from the iteration counter in `registers`.
pub fn run_iterations(
    registers: &mut [u8],
    program: &[u8],
    scratchpad: &mut [u8],
    dataset: &[u8],
    count: u32,
) {
    let words = (PROGRAM_SIZE / 8) as u64;
    let scratch_words = (scratchpad.len() / 8) as u64;
    let items = (dataset.len() / DATASET_ITEM_SIZE) as u64;
    let mut ma = read_u64(registers, MA_OFFSET);
    let mut mx = read_u64(registers, MX_OFFSET);
    let mut ic = read_u32(registers, IC_OFFSET);

    for _ in 0..count {
        let word = read_u64(program, ((u64::from(ic) % words) * 8) as usize);
        let dst = (word & 15) as usize;
        let src = ((word >> 4) & 15) as usize;
        let dst_value = register(registers, dst);
        let src_value = register(registers, src);

        let scratch_at = (((ma ^ word) % scratch_words) * 8) as usize;
        let scratch_value = read_u64(scratchpad, scratch_at);
        let dataset_value = if items == 0 {
            0
        } else {
            let item = (mx ^ dst_value) % items;
            read_u64(
                dataset,
                item as usize * DATASET_ITEM_SIZE + (ic as usize % 8) * 8,
            )
        };

        let value = dst_value
            .wrapping_mul(word | 1)
            .rotate_left(((word >> 8) & 63) as u32)
            ^ scratch_value
            ^ dataset_value
            ^ src_value;
        set_register(registers, dst, value);
        write_u64(scratchpad, scratch_at, scratch_value ^ value);
        ma = ma.wrapping_add(value);
        mx ^= src_value.rotate_right(13);
        ic = ic.wrapping_add(1);
    }

    write_u64(registers, MA_OFFSET, ma);
    write_u64(registers, MX_OFFSET, mx);
    write_u32(registers, IC_OFFSET, ic);
}

/// Folds the program result into the lane's rounding counter and back into r15.
pub fn end_program(registers: &mut [u8], rounding: &mut u32) {
    let mode = (register(registers, 0) & 3) as u32;
    *rounding = rounding.wrapping_add(mode + 1);
    let r15 = register(registers, 15) ^ u64::from(*rounding);
    set_register(registers, 15, r15);
}

/// Mixes the scratchpad into the 64 bytes at `REGISTER_FOLD_OFFSET`.
pub fn fold_scratchpad(scratchpad: &[u8], registers: &mut [u8]) {
    let mut acc = [0u64; 8];
    for (k, slot) in acc.iter_mut().enumerate() {
        *slot = 0x9e37_79b9_7f4a_7c15u64.wrapping_mul(k as u64 + 1);
    }
    for row in scratchpad.chunks_exact(64) {
        for (k, slot) in acc.iter_mut().enumerate() {
            *slot = (*slot ^ read_u64(row, k * 8))
                .rotate_left(7)
                .wrapping_mul(0xff51_afd7_ed55_8ccd);
        }
    }
    let base = REGISTER_FOLD_OFFSET as usize;
    for (k, value) in acc.iter().enumerate() {
        write_u64(registers, base + k * 8, mix64(*value));
    }
}

pub fn hash_registers_64(registers: &[u8]) -> [u8; 64] {
    blake2b_512(&registers[..REGISTERS_SIZE])
}

pub fn hash_registers_32(registers: &[u8]) -> [u8; OUTPUT_HASH_SIZE] {
    blake2b_256(&registers[..REGISTERS_SIZE])
}

fn expand(seed: &[u8; 64], domain: u64, out: &mut [u8]) -> [u8; 64] {
    let mut state = [0u64; 8];
    for (k, word) in state.iter_mut().enumerate() {
        *word = read_u64(seed, k * 8) ^ domain.rotate_left(k as u32 * 8);
    }
    for row in out.chunks_mut(64) {
        for k in 0..8 {
            state[k] = mix64(state[k] ^ state[(k + 1) % 8].rotate_left(17));
        }
        for (k, chunk) in row.chunks_mut(8).enumerate() {
            let bytes = state[k].to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
    let mut next = [0u8; 64];
    for (k, word) in state.iter().enumerate() {
        write_u64(&mut next, k * 8, *word);
    }
    next
}

fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

fn register(registers: &[u8], index: usize) -> u64 {
    read_u64(registers, index * 8)
}

fn set_register(registers: &mut [u8], index: usize, value: u64) {
    write_u64(registers, index * 8, value);
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(word)
}

fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Keyed dataset derivation matching the host kernels.
#[derive(Clone, Debug)]
pub struct ReferenceEngine {
    item_count: u64,
    cache_items: usize,
}

pub struct ReferenceCache {
    items: Vec<[u8; 64]>,
}

impl ReferenceEngine {
    pub fn new(item_count: u64) -> Self {
        Self {
            item_count,
            cache_items: DEFAULT_CACHE_ITEMS,
        }
    }

    pub fn with_cache_items(mut self, cache_items: usize) -> Self {
        self.cache_items = cache_items.max(1);
        self
    }
}

impl DatasetEngine for ReferenceEngine {
    type Cache = ReferenceCache;

    fn item_count(&self) -> u64 {
        self.item_count
    }

    fn init_cache(&self, seed: &[u8], _large_pages: bool) -> Result<ReferenceCache> {
        if seed.is_empty() {
            bail!("dataset seed must not be empty");
        }
        let mut items = Vec::new();
        items
            .try_reserve_exact(self.cache_items)
            .map_err(|err| anyhow::anyhow!("failed to reserve dataset cache: {err}"))?;
        let mut state = blake2b_512(seed);
        for _ in 0..self.cache_items {
            items.push(state);
            state = blake2b_512(&state);
        }
        Ok(ReferenceCache { items })
    }

    fn init_items(&self, cache: &ReferenceCache, first_item: u64, out: &mut [u8]) {
        let n = cache.items.len() as u64;
        for (offset, item) in out.chunks_exact_mut(DATASET_ITEM_SIZE).enumerate() {
            let index = first_item + offset as u64;
            let a = &cache.items[(index % n) as usize];
            let b = &cache.items[(index.wrapping_mul(7).wrapping_add(3) % n) as usize];
            let mut seed = [0u8; 64];
            for k in 0..64 {
                seed[k] = a[k] ^ b[63 - k];
            }
            let mixed = read_u64(&seed, 0) ^ index;
            write_u64(&mut seed, 0, mixed);
            expand(&seed, DATASET_DOMAIN, item);
        }
    }
}

/// CPU oracle for the reference hash family.
#[derive(Clone, Copy, Debug)]
pub struct ReferenceOracle {
    params: ProtocolParams,
}

impl ReferenceOracle {
    pub fn new(params: ProtocolParams) -> Self {
        Self { params }
    }
}

pub struct ReferenceVm {
    params: ProtocolParams,
    dataset: Arc<Dataset>,
    scratchpad: Vec<u8>,
    entropy: Vec<u8>,
    registers: [u8; REGISTERS_SIZE],
    program: Vec<u8>,
}

impl HashOracle for ReferenceOracle {
    type Vm = ReferenceVm;

    fn create_vm(&self, dataset: &Arc<Dataset>, _flags: VmFlags) -> Result<ReferenceVm> {
        Ok(ReferenceVm {
            params: self.params,
            dataset: Arc::clone(dataset),
            scratchpad: vec![0u8; self.params.scratchpad_l3],
            entropy: vec![0u8; ENTROPY_SIZE],
            registers: [0u8; REGISTERS_SIZE],
            program: vec![0u8; PROGRAM_SIZE],
        })
    }
}

impl OracleVm for ReferenceVm {
    fn hash(&mut self, message: &[u8]) -> [u8; OUTPUT_HASH_SIZE] {
        let mut hash = initial_hash(message);
        fill_scratchpad(&mut hash, &mut self.scratchpad);
        let mut rounding = 0u32;
        let dataset = self.dataset.bytes();

        for program_index in 0..self.params.program_count {
            fill_entropy(&hash, &mut self.entropy);
            load_registers(&self.entropy, &mut self.registers);
            load_program(&self.entropy, &mut self.program);
            begin_program(&mut self.registers);
            run_iterations(
                &mut self.registers,
                &self.program,
                &mut self.scratchpad,
                dataset,
                self.params.program_iterations,
            );
            end_program(&mut self.registers, &mut rounding);
            if program_index + 1 < self.params.program_count {
                hash = hash_registers_64(&self.registers);
            }
        }

        fold_scratchpad(&self.scratchpad, &mut self.registers);
        hash_registers_32(&self.registers)
    }
}
