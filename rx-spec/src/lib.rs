use std::fmt;

pub const RANDOMX_SCRATCHPAD_L1: usize = 16 * 1024;
pub const RANDOMX_SCRATCHPAD_L2: usize = 256 * 1024;
pub const RANDOMX_SCRATCHPAD_L3: usize = 2 * 1024 * 1024;
pub const RANDOMX_PROGRAM_ITERATIONS: u32 = 2048;
pub const RANDOMX_PROGRAM_COUNT: u32 = 8;
pub const RANDOMX_SEED: &[u8] = b"RandomX example seed";
/// Items in a full dataset (2 GiB base plus 32 MiB extra, minus one item).
pub const RANDOMX_DATASET_ITEM_COUNT: u64 = 34_078_719;

pub const LOCAL_GROUP_SIZE: usize = 64;
pub const MAX_BFACTOR: u32 = 10;
pub const DEFAULT_WORKERS_PER_HASH: u32 = 8;
pub const WORKERS_PER_HASH_CHOICES: [u32; 4] = [2, 4, 8, 16];

/// Extra bytes after each lane's scratchpad, read by the vectorised fill kernels.
pub const SCRATCHPAD_SLACK: usize = 64;
pub const INITIAL_HASH_SIZE: usize = 64;
pub const OUTPUT_HASH_SIZE: usize = 32;
pub const ENTROPY_SIZE: usize = 128 + 2048;
pub const REGISTERS_SIZE: usize = 256;
pub const VM_STATE_SIZE: usize = 2048;
pub const ROUNDING_SIZE: usize = 4;
pub const INTERMEDIATE_PROGRAM_SIZE: usize = 4096;
pub const COMPILED_PROGRAM_SIZE: usize = 10048;
pub const DATASET_ITEM_SIZE: usize = 64;

/// Offset of the scratchpad fold inside a lane's register file.
pub const REGISTER_FOLD_OFFSET: u32 = 192;

pub const NONCE_OFFSET: usize = 39;
pub const NONCE_LEN: usize = 4;

pub const DEFAULT_BLOCK_TEMPLATE: [u8; 76] = [
    0x07, 0x07, 0xf7, 0xa4, 0xf0, 0xd6, 0x05, 0xb3, 0x03, 0x26, 0x08, 0x16, 0xba, 0x3f, 0x10, 0x90,
    0x2e, 0x1a, 0x14, 0x5a, 0xc5, 0xfa, 0xd3, 0xaa, 0x3a, 0xf6, 0xea, 0x44, 0xc1, 0x18, 0x69, 0xdc,
    0x4f, 0x85, 0x3f, 0x00, 0x2b, 0x2e, 0xea, 0x00, 0x00, 0x00, 0x00, 0x77, 0xb2, 0x06, 0xa0, 0x2c,
    0xa5, 0xb1, 0xd4, 0xce, 0x6b, 0xbf, 0xdf, 0x0a, 0xca, 0xc3, 0x8b, 0xde, 0xd3, 0x4d, 0x2d, 0xcd,
    0xee, 0xf9, 0x5c, 0xd2, 0x0c, 0xef, 0xc1, 0x2f, 0x61, 0xd5, 0x61, 0x09,
];

pub mod kernels {
    pub const INITIAL_HASH: &str = "blake2b_initial_hash";
    pub const FILL_SCRATCHPAD: &str = "fillAes1Rx4_scratchpad";
    pub const FILL_ENTROPY: &str = "fillAes4Rx4_entropy";
    pub const FOLD_SCRATCHPAD: &str = "hashAes1Rx4";
    pub const HASH_REGISTERS_32: &str = "blake2b_hash_registers_32";
    pub const HASH_REGISTERS_64: &str = "blake2b_hash_registers_64";
    pub const PORTABLE_INIT: &str = "init_vm";
    pub const PORTABLE_EXECUTE: &str = "execute_vm";
    pub const NATIVE_INIT: &str = "randomx_init";
    pub const NATIVE_RUN: &str = "randomx_run";

    pub const BASE_ENTRY_POINTS: [&str; 6] = [
        INITIAL_HASH,
        FILL_SCRATCHPAD,
        FILL_ENTROPY,
        FOLD_SCRATCHPAD,
        HASH_REGISTERS_32,
        HASH_REGISTERS_64,
    ];

    pub const BASE_SOURCES: [&str; 2] = ["aes.cl", "blake2b.cl"];
    pub const BASE_CACHE: &str = "base_kernels.bin";
    pub const PORTABLE_SOURCE: &str = "randomx_vm.cl";
    pub const PORTABLE_CACHE: &str = "randomx_vm.bin";
    pub const NATIVE_INIT_SOURCE: &str = "randomx_init.cl";
    pub const NATIVE_INIT_CACHE: &str = "randomx_init.bin";
    pub const NATIVE_RUN_SOURCE: &str = "randomx_run.cl";
    pub const NATIVE_RUN_GFX803: &str = "randomx_run_gfx803.bin";
    pub const NATIVE_RUN_GFX900: &str = "randomx_run_gfx900.bin";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolParams {
    pub scratchpad_l1: usize,
    pub scratchpad_l2: usize,
    pub scratchpad_l3: usize,
    pub program_iterations: u32,
    pub program_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamsError {
    InvalidSize { field: &'static str, value: u64 },
    CacheOrder,
    ZeroPrograms,
}

impl fmt::Display for ParamsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSize { field, value } => {
                write!(f, "{field} must be a power of two no smaller than 64 (got {value})")
            }
            Self::CacheOrder => write!(f, "scratchpad levels must satisfy L1 <= L2 <= L3"),
            Self::ZeroPrograms => write!(f, "program count must be at least 1"),
        }
    }
}

impl std::error::Error for ParamsError {}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self::RANDOMX
    }
}

impl ProtocolParams {
    pub const RANDOMX: Self = Self {
        scratchpad_l1: RANDOMX_SCRATCHPAD_L1,
        scratchpad_l2: RANDOMX_SCRATCHPAD_L2,
        scratchpad_l3: RANDOMX_SCRATCHPAD_L3,
        program_iterations: RANDOMX_PROGRAM_ITERATIONS,
        program_count: RANDOMX_PROGRAM_COUNT,
    };

    pub fn validate(&self) -> Result<(), ParamsError> {
        let checks = [
            ("scratchpad L1", self.scratchpad_l1 as u64),
            ("scratchpad L2", self.scratchpad_l2 as u64),
            ("scratchpad L3", self.scratchpad_l3 as u64),
            ("program iterations", u64::from(self.program_iterations)),
        ];
        for (field, value) in checks {
            if !value.is_power_of_two() || value < 64 {
                return Err(ParamsError::InvalidSize { field, value });
            }
        }
        if self.scratchpad_l1 > self.scratchpad_l2 || self.scratchpad_l2 > self.scratchpad_l3 {
            return Err(ParamsError::CacheOrder);
        }
        if self.program_count == 0 {
            return Err(ParamsError::ZeroPrograms);
        }
        Ok(())
    }

    /// Per-lane stride of the scratchpad buffer.
    pub fn scratchpad_stride(&self) -> usize {
        self.scratchpad_l3 + SCRATCHPAD_SLACK
    }

    /// Largest substep exponent the portable path can use without a zero-length substep.
    pub fn max_bfactor(&self) -> u32 {
        self.program_iterations.trailing_zeros().min(MAX_BFACTOR)
    }

    /// Packed parameter word consumed by the native run kernel.
    pub fn rx_parameters(&self) -> u32 {
        log2(self.scratchpad_l1)
            | (log2(self.scratchpad_l2) << 5)
            | (log2(self.scratchpad_l3) << 10)
            | (self.program_iterations.trailing_zeros() << 15)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunParameters {
    pub scratchpad_l1: usize,
    pub scratchpad_l2: usize,
    pub scratchpad_l3: usize,
    pub program_iterations: u32,
}

pub fn decode_rx_parameters(word: u32) -> RunParameters {
    RunParameters {
        scratchpad_l1: 1usize << (word & 31),
        scratchpad_l2: 1usize << ((word >> 5) & 31),
        scratchpad_l3: 1usize << ((word >> 10) & 31),
        program_iterations: 1u32 << ((word >> 15) & 31),
    }
}

/// Writes `nonce` into the template's nonce field.
pub fn set_nonce(template: &mut [u8], nonce: u32) {
    template[NONCE_OFFSET..NONCE_OFFSET + NONCE_LEN].copy_from_slice(&nonce.to_le_bytes());
}

fn log2(value: usize) -> u32 {
    value.trailing_zeros()
}
