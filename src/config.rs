use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use rxcl_spec::{
    ProtocolParams, DEFAULT_BLOCK_TEMPLATE, DEFAULT_WORKERS_PER_HASH, LOCAL_GROUP_SIZE,
    MAX_BFACTOR, NONCE_LEN, NONCE_OFFSET, RANDOMX_DATASET_ITEM_COUNT, RANDOMX_SEED,
    WORKERS_PER_HASH_CHOICES,
};

use crate::pipeline::ComputeStrategy;
use crate::ui;
use crate::validator;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DeviceKind {
    /// In-process reference device, no GPU required.
    Host,
    /// OpenCL device selected by platform and device index.
    Opencl,
}

impl DeviceKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Opencl => "opencl",
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "rxcl",
    version,
    about = "Batch RandomX hashing on OpenCL devices with CPU cross-validation"
)]
struct Cli {
    /// Compute device backend.
    #[arg(long, value_enum, default_value_t = DeviceKind::Host)]
    device: DeviceKind,

    #[arg(long, default_value_t = 0)]
    platform_id: usize,

    #[arg(long, default_value_t = 0)]
    device_id: usize,

    /// Lanes per round (multiple of 64). Derived from device memory when omitted.
    #[arg(long)]
    intensity: Option<usize>,

    #[arg(long, default_value_t = 0)]
    start_nonce: u32,

    /// Interpret programs instead of running prebuilt native code.
    #[arg(long)]
    portable: bool,

    /// Split each program run into 2^bfactor launches (portable only).
    #[arg(long, default_value_t = 0)]
    bfactor: u32,

    #[arg(long, default_value_t = DEFAULT_WORKERS_PER_HASH)]
    workers_per_hash: u32,

    /// Recompute device hashes on the CPU and compare (host device only).
    #[arg(long)]
    validate: bool,

    /// CPU validation threads (defaults to half the cores).
    #[arg(long)]
    validate_threads: Option<usize>,

    /// Validate every Nth lane.
    #[arg(long, default_value_t = 1)]
    validate_stride: usize,

    /// Keep the dataset in host memory and let the device read it in place.
    #[arg(long)]
    dataset_host: bool,

    #[arg(long, default_value = "dataset.bin")]
    dataset_file: PathBuf,

    /// Neither read nor write the dataset cache file.
    #[arg(long)]
    no_dataset_cache: bool,

    #[arg(long, default_value_t = RANDOMX_DATASET_ITEM_COUNT)]
    dataset_items: u64,

    /// Dataset initialisation threads (defaults to all cores).
    #[arg(long)]
    dataset_threads: Option<usize>,

    #[arg(long, default_value_t = String::from_utf8_lossy(RANDOMX_SEED).into_owned())]
    seed: String,

    #[arg(long)]
    no_large_pages: bool,

    /// Directory holding the kernel sources.
    #[arg(long, default_value = "CL")]
    kernel_dir: PathBuf,

    /// Directory for compiled kernel binaries.
    #[arg(long, default_value = ".")]
    kernel_cache_dir: PathBuf,

    /// Block template as hex (nonce at byte 39).
    #[arg(long)]
    template: Option<String>,

    /// Stop after this many rounds.
    #[arg(long)]
    rounds: Option<u64>,

    /// Write a JSON run report to this path.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Check the hashing kernels against the CPU and benchmark them.
    #[arg(long)]
    test: bool,

    #[arg(long, default_value_t = 16)]
    bench_iterations: u32,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub device: DeviceKind,
    pub platform_id: usize,
    pub device_id: usize,
    pub intensity: Option<usize>,
    pub start_nonce: u32,
    pub params: ProtocolParams,
    pub strategy: ComputeStrategy,
    pub validate: bool,
    pub validate_threads: usize,
    pub validate_stride: usize,
    pub dataset_host: bool,
    pub dataset_file: Option<PathBuf>,
    pub dataset_items: u64,
    pub dataset_threads: Option<usize>,
    pub seed: Vec<u8>,
    pub large_pages: bool,
    pub kernel_dir: PathBuf,
    pub kernel_cache_dir: PathBuf,
    pub template: Vec<u8>,
    pub rounds: Option<u64>,
    pub report: Option<PathBuf>,
    pub self_test: bool,
    pub bench_iterations: u32,
}

impl Config {
    pub fn parse() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    #[cfg(test)]
    pub(crate) fn from_args(args: &[&str]) -> Result<Self> {
        let mut argv = vec!["rxcl"];
        argv.extend_from_slice(args);
        Self::from_cli(Cli::try_parse_from(argv)?)
    }

    fn from_cli(cli: Cli) -> Result<Self> {
        if let Some(intensity) = cli.intensity {
            if intensity == 0 || !intensity.is_multiple_of(LOCAL_GROUP_SIZE) {
                bail!("--intensity must be a non-zero multiple of {LOCAL_GROUP_SIZE} (got {intensity})");
            }
        }
        if !WORKERS_PER_HASH_CHOICES.contains(&cli.workers_per_hash) {
            bail!(
                "--workers-per-hash must be one of {:?} (got {})",
                WORKERS_PER_HASH_CHOICES,
                cli.workers_per_hash
            );
        }
        if cli.validate_stride == 0 {
            bail!("--validate-stride must be at least 1");
        }
        if cli.validate_threads == Some(0) {
            bail!("--validate-threads must be at least 1");
        }
        if cli.dataset_items == 0 {
            bail!("--dataset-items must be at least 1");
        }
        if cli.seed.is_empty() {
            bail!("--seed must not be empty");
        }
        if cli.rounds == Some(0) {
            bail!("--rounds must be at least 1");
        }
        // The CPU oracle and the dataset builder implement the reference hash
        // family, which only the host device's kernels compute.
        if cli.device == DeviceKind::Opencl && !cli.test {
            if cli.validate {
                bail!(
                    "--validate is only available on the host device: the CPU oracle \
                     computes the reference hash family, not the RandomX kernels an \
                     OpenCL device runs"
                );
            }
            ui::warn(
                "CONFIG",
                "the dataset is a reference derivation, OpenCL hashes will not match RandomX",
            );
        }

        let params = ProtocolParams::RANDOMX;
        params.validate().context("invalid protocol parameters")?;

        let bfactor = if cli.bfactor > MAX_BFACTOR {
            ui::warn(
                "CONFIG",
                format!("bfactor {} is too large, using {MAX_BFACTOR}", cli.bfactor),
            );
            MAX_BFACTOR
        } else {
            cli.bfactor
        };
        if !cli.portable && cli.bfactor != 0 {
            ui::warn("CONFIG", "--bfactor only applies to the portable strategy");
        }
        let strategy = if cli.portable {
            ComputeStrategy::Portable {
                bfactor: bfactor.min(params.max_bfactor()),
                workers_per_hash: cli.workers_per_hash,
            }
        } else {
            ComputeStrategy::Native
        };

        let template = match cli.template {
            Some(text) => hex::decode(text.trim()).context("--template is not valid hex")?,
            None => DEFAULT_BLOCK_TEMPLATE.to_vec(),
        };
        if template.len() < NONCE_OFFSET + NONCE_LEN {
            bail!(
                "block template is {} bytes, the nonce field needs at least {}",
                template.len(),
                NONCE_OFFSET + NONCE_LEN
            );
        }

        Ok(Self {
            device: cli.device,
            platform_id: cli.platform_id,
            device_id: cli.device_id,
            intensity: cli.intensity,
            start_nonce: cli.start_nonce,
            params,
            strategy,
            validate: cli.validate,
            validate_threads: cli.validate_threads.unwrap_or_else(validator::default_threads),
            validate_stride: cli.validate_stride,
            dataset_host: cli.dataset_host,
            dataset_file: (!cli.no_dataset_cache).then_some(cli.dataset_file),
            dataset_items: cli.dataset_items,
            dataset_threads: cli.dataset_threads,
            seed: cli.seed.into_bytes(),
            large_pages: !cli.no_large_pages,
            kernel_dir: cli.kernel_dir,
            kernel_cache_dir: cli.kernel_cache_dir,
            template,
            rounds: cli.rounds,
            report: cli.report,
            self_test: cli.test,
            bench_iterations: cli.bench_iterations,
        })
    }

    /// Key/value lines for the startup banner.
    pub fn summary(&self) -> Vec<(&'static str, String)> {
        let mut lines = vec![
            (
                "device",
                format!(
                    "{} (platform {}, device {})",
                    self.device.name(),
                    self.platform_id,
                    self.device_id
                ),
            ),
            (
                "intensity",
                self.intensity
                    .map_or_else(|| "auto".to_string(), |lanes| lanes.to_string()),
            ),
            ("strategy", self.strategy.describe()),
            ("start nonce", self.start_nonce.to_string()),
            (
                "dataset",
                format!(
                    "{} items in {} memory",
                    self.dataset_items,
                    if self.dataset_host { "host" } else { "device" }
                ),
            ),
            (
                "dataset cache",
                self.dataset_file
                    .as_ref()
                    .map_or_else(|| "off".to_string(), |path| path.display().to_string()),
            ),
            ("large pages", on_off(self.large_pages).to_string()),
            ("kernels", self.kernel_dir.display().to_string()),
        ];
        if self.validate {
            lines.push((
                "validation",
                format!(
                    "{} threads, every {} lane(s)",
                    self.validate_threads, self.validate_stride
                ),
            ));
        } else {
            lines.push(("validation", "off".to_string()));
        }
        if let Some(rounds) = self.rounds {
            lines.push(("rounds", rounds.to_string()));
        }
        lines
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}
