use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, Scope, ScopedJoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use rxcl_spec::{set_nonce, NONCE_LEN, NONCE_OFFSET, OUTPUT_HASH_SIZE};
use serde::Serialize;

use crate::dataset::{Dataset, LargePages};
use crate::ui;

const MAX_REPORTED_NONCES: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmFlags {
    pub large_pages: bool,
}

/// Trusted CPU implementation of the lane hash.
pub trait HashOracle: Sync {
    type Vm: OracleVm;

    fn create_vm(&self, dataset: &Arc<Dataset>, flags: VmFlags) -> Result<Self::Vm>;
}

pub trait OracleVm {
    fn hash(&mut self, message: &[u8]) -> [u8; OUTPUT_HASH_SIZE];
}

pub fn default_threads() -> usize {
    let cores = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores / 2).max(1)
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ValidationStats {
    pub rounds: u64,
    pub checked: u64,
    pub failed: u64,
    pub cpu_limited_rounds: u64,
    pub failing_nonces: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundVerdict {
    pub base_nonce: u32,
    pub checked: usize,
    pub failing_nonces: Vec<u32>,
    pub cpu_limited: bool,
}

pub struct CrossValidator<O: HashOracle> {
    oracle: O,
    dataset: Arc<Dataset>,
    template: Vec<u8>,
    threads: usize,
    stride: usize,
    large_pages: LargePages,
    stats: ValidationStats,
}

impl<O: HashOracle> CrossValidator<O> {
    pub fn new(
        oracle: O,
        dataset: Arc<Dataset>,
        template: &[u8],
        threads: usize,
        stride: usize,
        large_pages: LargePages,
    ) -> Result<Self> {
        if template.len() < NONCE_OFFSET + NONCE_LEN {
            bail!(
                "block template is {} bytes, the nonce field needs at least {}",
                template.len(),
                NONCE_OFFSET + NONCE_LEN
            );
        }
        if threads == 0 {
            bail!("validation needs at least one thread");
        }
        if stride == 0 {
            bail!("validation stride must be at least 1");
        }
        Ok(Self {
            oracle,
            dataset,
            template: template.to_vec(),
            threads,
            stride,
            large_pages,
            stats: ValidationStats::default(),
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn stats(&self) -> &ValidationStats {
        &self.stats
    }

    pub fn sampled_lanes(&self, lanes: usize) -> usize {
        lanes.div_ceil(self.stride)
    }

    /// Starts the CPU side of one round on `scope`.
    ///
    /// Workers claim sampled lanes from a shared counter until every lane is
    /// taken. The returned round must be finished or abandoned before the
    /// next round starts.
    pub fn spawn_round<'scope, 'env>(
        &'env self,
        scope: &'scope Scope<'scope, 'env>,
        base_nonce: u32,
        lanes: usize,
    ) -> Result<ValidationRound<'scope>> {
        let sampled = self.sampled_lanes(lanes);
        let claimed = Arc::new(AtomicUsize::new(0));
        let abort = Arc::new(AtomicBool::new(false));
        let mut round = ValidationRound {
            base_nonce,
            sampled,
            claimed: Arc::clone(&claimed),
            abort: Arc::clone(&abort),
            workers: Vec::with_capacity(self.threads),
        };

        for idx in 0..self.threads {
            let claimed = Arc::clone(&claimed);
            let abort = Arc::clone(&abort);
            let spawned = thread::Builder::new()
                .name(format!("rxcl-validate-{idx}"))
                .spawn_scoped(scope, move || {
                    self.validate_lanes(base_nonce, sampled, &claimed, &abort)
                });
            match spawned {
                Ok(handle) => round.workers.push(handle),
                Err(err) => {
                    round.abandon();
                    return Err(err).context("failed to spawn validation thread");
                }
            }
        }
        Ok(round)
    }

    pub fn record(&mut self, verdict: &RoundVerdict) {
        self.stats.rounds += 1;
        self.stats.checked += verdict.checked as u64;
        self.stats.failed += verdict.failing_nonces.len() as u64;
        if verdict.cpu_limited {
            self.stats.cpu_limited_rounds += 1;
        }
        for nonce in &verdict.failing_nonces {
            ui::error("VALIDATE", format!("CPU validation error, failing nonce = {nonce}"));
            if self.stats.failing_nonces.len() < MAX_REPORTED_NONCES {
                self.stats.failing_nonces.push(*nonce);
            }
        }
    }

    fn validate_lanes(
        &self,
        base_nonce: u32,
        sampled: usize,
        claimed: &AtomicUsize,
        abort: &AtomicBool,
    ) -> Result<Vec<(usize, [u8; OUTPUT_HASH_SIZE])>> {
        let mut vm = create_vm(&self.oracle, &self.dataset, &self.large_pages)?;
        let mut message = self.template.clone();
        let mut results = Vec::new();
        loop {
            if abort.load(Ordering::Relaxed) {
                break;
            }
            let claim = claimed.fetch_add(1, Ordering::AcqRel);
            if claim >= sampled {
                break;
            }
            let lane = claim * self.stride;
            set_nonce(&mut message, base_nonce.wrapping_add(lane as u32));
            results.push((lane, vm.hash(&message)));
        }
        Ok(results)
    }
}

/// Creates a VM, retrying without large pages and recording the downgrade.
pub fn create_vm<O: HashOracle>(
    oracle: &O,
    dataset: &Arc<Dataset>,
    large_pages: &LargePages,
) -> Result<O::Vm> {
    let flags = VmFlags {
        large_pages: large_pages.available(),
    };
    match oracle.create_vm(dataset, flags) {
        Ok(vm) => Ok(vm),
        Err(err) if flags.large_pages => {
            ui::warn("VALIDATE", format!("VM creation with large pages failed: {err:#}"));
            large_pages.disable("validation VMs");
            oracle
                .create_vm(dataset, VmFlags { large_pages: false })
                .context("failed to create validation VM")
        }
        Err(err) => Err(err.context("failed to create validation VM")),
    }
}

type WorkerResult = Result<Vec<(usize, [u8; OUTPUT_HASH_SIZE])>>;

pub struct ValidationRound<'scope> {
    base_nonce: u32,
    sampled: usize,
    claimed: Arc<AtomicUsize>,
    abort: Arc<AtomicBool>,
    workers: Vec<ScopedJoinHandle<'scope, WorkerResult>>,
}

impl ValidationRound<'_> {
    pub fn sampled(&self) -> usize {
        self.sampled
    }

    pub fn claimed(&self) -> usize {
        self.claimed.load(Ordering::Acquire).min(self.sampled)
    }

    /// Joins the workers and compares their hashes with the device output.
    ///
    /// `device_hashes` holds one packed 32-byte hash per lane.
    pub fn finish(self, device_hashes: &[u8]) -> Result<RoundVerdict> {
        let cpu_limited = self.claimed() < self.sampled;

        let mut cpu_hashes = Vec::with_capacity(self.sampled);
        let mut failure = None;
        for worker in self.workers {
            match worker.join() {
                Ok(Ok(results)) => cpu_hashes.extend(results),
                Ok(Err(err)) => {
                    self.abort.store(true, Ordering::Relaxed);
                    failure.get_or_insert(err);
                }
                Err(_) => {
                    self.abort.store(true, Ordering::Relaxed);
                    failure.get_or_insert(anyhow!("validation thread panicked"));
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let failing_nonces = compare_lanes(self.base_nonce, &mut cpu_hashes, device_hashes)?;
        Ok(RoundVerdict {
            base_nonce: self.base_nonce,
            checked: cpu_hashes.len(),
            failing_nonces,
            cpu_limited,
        })
    }

    /// Stops the workers early and discards their results.
    pub fn abandon(self) {
        self.abort.store(true, Ordering::Relaxed);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

fn compare_lanes(
    base_nonce: u32,
    cpu_hashes: &mut [(usize, [u8; OUTPUT_HASH_SIZE])],
    device_hashes: &[u8],
) -> Result<Vec<u32>> {
    cpu_hashes.sort_unstable_by_key(|(lane, _)| *lane);
    let mut failing = Vec::new();
    for (lane, expected) in cpu_hashes.iter() {
        let start = lane * OUTPUT_HASH_SIZE;
        let actual = device_hashes
            .get(start..start + OUTPUT_HASH_SIZE)
            .with_context(|| format!("device output has no hash for lane {lane}"))?;
        if actual != expected {
            failing.push(base_nonce.wrapping_add(*lane as u32));
        }
    }
    Ok(failing)
}
