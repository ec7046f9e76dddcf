mod config;
mod dataset;
mod device;
mod kernels;
mod pipeline;
mod refhash;
mod round_driver;
mod selftest;
mod ui;
mod validator;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use rxcl_spec::DATASET_ITEM_SIZE;

use config::{Config, DeviceKind};
use dataset::{DatasetBuilder, LargePages};
use device::host::{HostDevice, HostDeviceOptions};
use device::{ComputeDevice, DevicePool, LaneFootprint};
use kernels::{KernelCompiler, KernelSet, ProgramSpec};
use pipeline::{
    base_program, map_host_dataset, reserve_device_dataset, upload_dataset, BufferLayout,
    Pipeline, PipelineConfig,
};
use refhash::{ReferenceEngine, ReferenceOracle};
use round_driver::{
    format_rate, format_round, run_rounds, write_report, DriverOptions, RunReport,
};
use validator::CrossValidator;

fn main() {
    if let Err(err) = run() {
        ui::error("MAIN", format!("fatal: {err:#}"));
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cfg = Config::parse()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    ui::startup_banner(
        &format!("rxcl {}", env!("CARGO_PKG_VERSION")),
        if cfg.self_test {
            "kernel self-test"
        } else {
            "batch RandomX hashing pipeline"
        },
        &cfg.summary(),
    );

    match cfg.device {
        DeviceKind::Host => {
            let device = HostDevice::open(cfg.platform_id, cfg.device_id, host_options(&cfg)?)?;
            execute(device, &cfg, &shutdown)
        }
        DeviceKind::Opencl => run_opencl(&cfg, &shutdown),
    }
}

#[cfg(feature = "opencl")]
fn run_opencl(cfg: &Config, shutdown: &AtomicBool) -> Result<()> {
    let device = device::opencl::OpenClDevice::open(cfg.platform_id, cfg.device_id)?;
    execute(device, cfg, shutdown)
}

#[cfg(not(feature = "opencl"))]
fn run_opencl(_cfg: &Config, _shutdown: &AtomicBool) -> Result<()> {
    anyhow::bail!("this build has no OpenCL support, rebuild with --features opencl")
}

/// Sizes the host device so a device-resident dataset fits next to the working buffers.
fn host_options(cfg: &Config) -> Result<HostDeviceOptions> {
    let defaults = HostDeviceOptions::default();
    let dataset_bytes = cfg
        .dataset_items
        .checked_mul(DATASET_ITEM_SIZE as u64)
        .context("dataset item count overflows")?;
    if cfg.self_test || cfg.dataset_host {
        return Ok(defaults);
    }
    Ok(HostDeviceOptions {
        global_mem: defaults.global_mem.saturating_add(dataset_bytes),
        max_alloc: defaults.max_alloc.max(dataset_bytes),
        ..defaults
    })
}

fn execute<D: ComputeDevice>(device: D, cfg: &Config, shutdown: &AtomicBool) -> Result<()> {
    let mut pool = DevicePool::new(device);
    let compiler = KernelCompiler::new(&cfg.kernel_dir, &cfg.kernel_cache_dir);

    if cfg.self_test {
        let intensity = pool.choose_intensity(cfg.intensity, lane_footprint(cfg))?;
        let kernels = compile_all(&mut pool, &compiler, &[base_program()])?;
        let report = selftest::run_self_test(
            &mut pool,
            &kernels,
            intensity,
            &cfg.params,
            &cfg.template,
            cfg.bench_iterations,
        )?;
        ui::success(
            "TEST",
            format!("all {} kernel checks passed on {intensity} lanes", report.passed.len()),
        );
        if let Some(path) = &cfg.report {
            write_report(path, &report)?;
        }
        return Ok(());
    }

    let device_name = pool.info().name.clone();
    let kernels = compile_all(
        &mut pool,
        &compiler,
        &cfg.strategy.programs(&device_name, &cfg.params),
    )?;

    let large_pages = LargePages::new(cfg.large_pages);
    let mut builder = DatasetBuilder::new(ReferenceEngine::new(cfg.dataset_items), large_pages.clone());
    if let Some(path) = &cfg.dataset_file {
        builder = builder.cache_file(path);
    }
    if let Some(threads) = cfg.dataset_threads {
        builder = builder.threads(threads);
    }
    // Claim device memory for the dataset before sizing the batch and before
    // spending time deriving it.
    if !cfg.dataset_host {
        reserve_device_dataset(&mut pool, builder.byte_len()?)?;
    }
    let intensity = pool.choose_intensity(cfg.intensity, lane_footprint(cfg))?;
    let dataset = Arc::new(builder.build(&cfg.seed)?);
    if dataset.uses_large_pages() {
        ui::info("MEM", "dataset is backed by large pages");
    }
    if cfg.dataset_host {
        map_host_dataset(&mut pool, Arc::clone(&dataset))?;
    } else {
        upload_dataset(&mut pool, &dataset)?;
    }

    let mut pipeline = Pipeline::new(
        pool,
        &kernels,
        PipelineConfig {
            intensity,
            params: cfg.params,
            strategy: cfg.strategy,
            template: cfg.template.clone(),
        },
    )?;
    ui::info(
        "GPU",
        format!(
            "{} allocated on {}",
            ui::format_bytes(pipeline.pool().allocated_bytes()),
            pipeline.pool().info().name
        ),
    );

    let mut validator = if cfg.validate {
        let validator = CrossValidator::new(
            ReferenceOracle::new(cfg.params),
            Arc::clone(&dataset),
            &cfg.template,
            cfg.validate_threads,
            cfg.validate_stride,
            large_pages,
        )?;
        ui::info(
            "VALIDATE",
            format!(
                "{} CPU threads checking {} of {intensity} lanes per round",
                validator.threads(),
                validator.sampled_lanes(intensity)
            ),
        );
        Some(validator)
    } else {
        None
    };

    let report = run_rounds(
        &mut pipeline,
        validator.as_mut(),
        &DriverOptions {
            start_nonce: cfg.start_nonce,
            max_rounds: cfg.rounds,
        },
        shutdown,
    )?;
    summarize(&report);
    if let Some(path) = &cfg.report {
        write_report(path, &report)?;
    }
    Ok(())
}

fn lane_footprint(cfg: &Config) -> LaneFootprint {
    if cfg.self_test {
        selftest::lane_footprint(&cfg.params, cfg.template.len())
    } else {
        BufferLayout::lane_footprint(&cfg.params, &cfg.strategy, cfg.template.len())
    }
}

fn compile_all<D: ComputeDevice>(
    pool: &mut DevicePool<D>,
    compiler: &KernelCompiler,
    programs: &[ProgramSpec<'_>],
) -> Result<KernelSet> {
    let mut kernels = KernelSet::default();
    for program in programs {
        kernels.extend(compiler.compile(pool.device_mut(), program)?);
    }
    ui::success("KERNELS", format!("{} kernels ready", kernels.len()));
    Ok(kernels)
}

fn summarize(report: &RunReport) {
    if report.rounds == 0 {
        ui::warn("SUMMARY", "stopped before the first round");
        return;
    }
    ui::info(
        "SUMMARY",
        format!(
            "{} rounds | {} hashes in {:.1}s | avg={} | median round {} | stopped: {:?}",
            report.rounds,
            report.hashes,
            report.elapsed_secs,
            format_rate(report.avg_hps),
            format_round(report.intensity, report.median_round_secs),
            report.stop_reason,
        ),
    );
    if let Some(stats) = &report.validation {
        if stats.failed == 0 {
            ui::success(
                "SUMMARY",
                format!("all {} validated hashes matched the CPU", stats.checked),
            );
        } else {
            ui::warn(
                "SUMMARY",
                format!(
                    "{} of {} validated hashes differ from the CPU, first nonces: {:?}",
                    stats.failed, stats.checked, stats.failing_nonces
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::intensity_within;
    use rxcl_spec::LOCAL_GROUP_SIZE;

    #[test]
    fn default_batch_fits_next_to_device_dataset() {
        let cfg = Config::from_args(&[]).expect("defaults");
        assert!(!cfg.dataset_host);
        let device = HostDevice::open(0, 0, host_options(&cfg).expect("options")).expect("host");
        let info = device.info();
        let dataset_bytes = cfg.dataset_items * DATASET_ITEM_SIZE as u64;

        let intensity = intensity_within(info, dataset_bytes, lane_footprint(&cfg));
        assert!(intensity >= LOCAL_GROUP_SIZE);

        let layout = BufferLayout::new(intensity, &cfg.params, &cfg.strategy, cfg.template.len())
            .expect("layout");
        assert!(dataset_bytes + layout.total_bytes() <= info.global_mem);
        assert!(dataset_bytes <= info.max_alloc);
        for (kind, size) in layout.buffers() {
            assert!(size as u64 <= info.max_alloc, "{} exceeds one allocation", kind.name());
        }

        // Sizing from the whole device would not have left room for the dataset.
        let unreserved = intensity_within(info, 0, lane_footprint(&cfg));
        let layout = BufferLayout::new(unreserved, &cfg.params, &cfg.strategy, cfg.template.len())
            .expect("layout");
        assert!(dataset_bytes + layout.total_bytes() > info.global_mem);
    }

    #[test]
    fn host_dataset_leaves_device_defaults() {
        let cfg = Config::from_args(&["--dataset-host"]).expect("host dataset");
        let options = host_options(&cfg).expect("options");
        assert_eq!(options.global_mem, HostDeviceOptions::default().global_mem);

        let device = HostDevice::open(0, 0, options).expect("host");
        let intensity = intensity_within(device.info(), 0, lane_footprint(&cfg));
        let layout = BufferLayout::new(intensity, &cfg.params, &cfg.strategy, cfg.template.len())
            .expect("layout");
        assert!(layout.total_bytes() <= device.info().global_mem);
    }
}
