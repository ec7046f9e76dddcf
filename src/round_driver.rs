use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use rxcl_spec::OUTPUT_HASH_SIZE;
use serde::Serialize;

use crate::device::ComputeDevice;
use crate::pipeline::Pipeline;
use crate::ui;
use crate::validator::{CrossValidator, HashOracle, RoundVerdict, ValidationStats};

const NONCE_SPACE: u64 = 1 << 32;
/// Rounds kept for the median and the report.
pub const RECENT_ROUNDS: usize = 512;
const RATE_UNITS: [(f64, &str); 3] = [(1e6, "MH/s"), (1e3, "kH/s"), (1.0, "H/s")];

/// Base nonces of consecutive rounds.
///
/// Round `k` covers `start + k*lanes .. start + (k+1)*lanes`. The schedule
/// ends before a round would leave the 32-bit nonce space.
#[derive(Clone, Debug)]
pub struct NonceSchedule {
    next: u64,
    lanes: u64,
    issued: u64,
}

impl NonceSchedule {
    pub fn new(start_nonce: u32, lanes: usize) -> Self {
        Self {
            next: u64::from(start_nonce),
            lanes: lanes as u64,
            issued: 0,
        }
    }

    pub fn next_round(&mut self) -> Option<u32> {
        if self.lanes == 0 || self.next + self.lanes > NONCE_SPACE {
            return None;
        }
        let base = self.next as u32;
        self.next += self.lanes;
        self.issued += 1;
        Some(base)
    }

    pub fn rounds_issued(&self) -> u64 {
        self.issued
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NonceSpaceExhausted,
    Cancelled,
    RoundLimit,
}

#[derive(Clone, Debug, Default)]
pub struct DriverOptions {
    pub start_nonce: u32,
    pub max_rounds: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoundSample {
    pub round: u64,
    pub base_nonce: u32,
    pub elapsed_secs: f64,
    pub hps: f64,
}

/// The most recent round samples plus the count of every round recorded.
#[derive(Clone, Debug)]
pub struct RoundWindow {
    capacity: usize,
    recent: VecDeque<RoundSample>,
    recorded: u64,
}

impl RoundWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            recent: VecDeque::with_capacity(capacity),
            recorded: 0,
        }
    }

    pub fn record(&mut self, sample: RoundSample) {
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(sample);
        self.recorded += 1;
    }

    pub fn rounds(&self) -> u64 {
        self.recorded
    }

    /// Median round time over the window, 0 when nothing was recorded.
    pub fn median_round_secs(&self) -> f64 {
        let mut secs: Vec<f64> = self.recent.iter().map(|sample| sample.elapsed_secs).collect();
        if secs.is_empty() {
            return 0.0;
        }
        secs.sort_by(f64::total_cmp);
        let mid = secs.len() / 2;
        if secs.len().is_multiple_of(2) {
            (secs[mid - 1] + secs[mid]) / 2.0
        } else {
            secs[mid]
        }
    }

    pub fn into_samples(self) -> Vec<RoundSample> {
        self.recent.into()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub device: String,
    pub strategy: String,
    pub intensity: usize,
    pub start_nonce: u32,
    pub rounds: u64,
    pub hashes: u64,
    pub elapsed_secs: f64,
    pub avg_hps: f64,
    pub median_hps: f64,
    pub median_round_secs: f64,
    pub validation: Option<ValidationStats>,
    pub stop_reason: StopReason,
    /// The last rounds, at most `RECENT_ROUNDS` of them.
    pub samples: Vec<RoundSample>,
}

/// Runs rounds until the schedule ends, `cancel` is raised or the round limit is hit.
///
/// With a validator, the CPU side of a round runs on scoped threads while the
/// device executes it, and is joined before the round's hashes are compared.
pub fn run_rounds<D: ComputeDevice, O: HashOracle>(
    pipeline: &mut Pipeline<D>,
    mut validator: Option<&mut CrossValidator<O>>,
    options: &DriverOptions,
    cancel: &AtomicBool,
) -> Result<RunReport> {
    let lanes = pipeline.intensity();
    let mut schedule = NonceSchedule::new(options.start_nonce, lanes);
    let mut hashes = vec![0u8; lanes * OUTPUT_HASH_SIZE];
    let mut window = RoundWindow::new(RECENT_ROUNDS);
    let started_at = Instant::now();

    let stop_reason = loop {
        if cancel.load(Ordering::Relaxed) {
            break StopReason::Cancelled;
        }
        if options
            .max_rounds
            .is_some_and(|limit| schedule.rounds_issued() >= limit)
        {
            break StopReason::RoundLimit;
        }
        let Some(base_nonce) = schedule.next_round() else {
            break StopReason::NonceSpaceExhausted;
        };

        let round_start = Instant::now();
        let verdict = run_one_round(pipeline, validator.as_deref(), base_nonce, &mut hashes)
            .with_context(|| format!("round at nonce {base_nonce} failed"))?;
        let elapsed = round_start.elapsed().as_secs_f64().max(0.001);

        if let (Some(validator), Some(verdict)) = (validator.as_deref_mut(), verdict.as_ref()) {
            validator.record(verdict);
        }
        log_round(
            schedule.rounds_issued(),
            lanes,
            elapsed,
            verdict.as_ref(),
            validator.as_deref().map(CrossValidator::stats),
        );
        window.record(RoundSample {
            round: schedule.rounds_issued(),
            base_nonce,
            elapsed_secs: elapsed,
            hps: lanes as f64 / elapsed,
        });
    };

    let elapsed_secs = started_at.elapsed().as_secs_f64();
    let rounds = window.rounds();
    let hashes_done = rounds * lanes as u64;
    let median_round_secs = window.median_round_secs();

    Ok(RunReport {
        device: pipeline.pool().info().name.clone(),
        strategy: pipeline.config().strategy.describe(),
        intensity: lanes,
        start_nonce: options.start_nonce,
        rounds,
        hashes: hashes_done,
        elapsed_secs,
        avg_hps: if elapsed_secs > 0.0 {
            hashes_done as f64 / elapsed_secs
        } else {
            0.0
        },
        median_hps: if median_round_secs > 0.0 {
            lanes as f64 / median_round_secs
        } else {
            0.0
        },
        median_round_secs,
        validation: validator.map(|validator| validator.stats().clone()),
        stop_reason,
        samples: window.into_samples(),
    })
}

fn run_one_round<D: ComputeDevice, O: HashOracle>(
    pipeline: &mut Pipeline<D>,
    validator: Option<&CrossValidator<O>>,
    base_nonce: u32,
    hashes: &mut [u8],
) -> Result<Option<RoundVerdict>> {
    let lanes = pipeline.intensity();
    thread::scope(|scope| {
        let round = match validator {
            Some(validator) => Some(validator.spawn_round(scope, base_nonce, lanes)?),
            None => None,
        };

        let device_result = pipeline
            .run_round(base_nonce)
            .and_then(|()| pipeline.read_hashes(hashes));
        match (device_result, round) {
            (Ok(()), Some(round)) => round.finish(hashes).map(Some),
            (Ok(()), None) => Ok(None),
            (Err(err), Some(round)) => {
                round.abandon();
                Err(err)
            }
            (Err(err), None) => Err(err),
        }
    })
}

fn log_round(
    round: u64,
    lanes: usize,
    round_secs: f64,
    verdict: Option<&RoundVerdict>,
    totals: Option<&ValidationStats>,
) {
    let (Some(verdict), Some(totals)) = (verdict, totals) else {
        ui::info("ROUND", format!("round {round} | {}", format_round(lanes, round_secs)));
        return;
    };
    let hashed = round * lanes as u64;
    ui::info(
        "ROUND",
        format!(
            "round {round} | {} | validated {}/{hashed} ({:.2}%) | failed {} ({:.4}%){}",
            format_round(lanes, round_secs),
            totals.checked,
            percent(totals.checked, hashed),
            totals.failed,
            percent(totals.failed, totals.checked),
            if verdict.cpu_limited { ", limited by CPU" } else { "" },
        ),
    );
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / whole as f64
}

pub fn write_report<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("failed to serialize run report")?;
    fs::write(path, json).with_context(|| format!("failed to write run report {}", path.display()))?;
    ui::success("REPORT", format!("wrote run report to {}", path.display()));
    Ok(())
}

pub fn format_rate(hps: f64) -> String {
    let (scale, unit) = RATE_UNITS
        .into_iter()
        .find(|(scale, _)| hps >= *scale)
        .unwrap_or(RATE_UNITS[RATE_UNITS.len() - 1]);
    format!("{:.2} {unit}", hps / scale)
}

/// One round of `lanes` hashes: its rate, wall time and cost per lane.
pub fn format_round(lanes: usize, round_secs: f64) -> String {
    let lanes = lanes.max(1) as f64;
    let round_secs = round_secs.max(1e-9);
    format!(
        "{} | {:.1} ms/round | {:.1} us/lane",
        format_rate(lanes / round_secs),
        round_secs * 1e3,
        round_secs * 1e6 / lanes
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dataset::{Dataset, LargePages};
    use crate::device::host::HostDevice;
    use crate::pipeline::tests::{test_dataset, test_pipeline, TempDir, TEST_PARAMS};
    use crate::pipeline::ComputeStrategy;
    use crate::refhash::ReferenceOracle;
    use rxcl_spec::DEFAULT_BLOCK_TEMPLATE;

    fn validator(dataset: &Arc<Dataset>, stride: usize) -> CrossValidator<ReferenceOracle> {
        CrossValidator::new(
            ReferenceOracle::new(TEST_PARAMS),
            Arc::clone(dataset),
            &DEFAULT_BLOCK_TEMPLATE,
            2,
            stride,
            LargePages::new(false),
        )
        .expect("validator")
    }

    fn native_pipeline(dataset: &Arc<Dataset>) -> Pipeline<HostDevice> {
        test_pipeline(ComputeStrategy::Native, dataset, true, 64)
    }

    #[test]
    fn schedule_advances_by_batch_width() {
        let mut schedule = NonceSchedule::new(10, 64);
        assert_eq!(schedule.next_round(), Some(10));
        assert_eq!(schedule.next_round(), Some(74));
        assert_eq!(schedule.next_round(), Some(138));
        assert_eq!(schedule.rounds_issued(), 3);
    }

    #[test]
    fn schedule_stops_before_leaving_nonce_space() {
        let mut schedule = NonceSchedule::new(u32::MAX - 127, 64);
        assert_eq!(schedule.next_round(), Some(u32::MAX - 127));
        assert_eq!(schedule.next_round(), Some(u32::MAX - 63));
        assert_eq!(schedule.next_round(), None);

        let mut tail = NonceSchedule::new(u32::MAX - 10, 64);
        assert_eq!(tail.next_round(), None);
        assert_eq!(tail.rounds_issued(), 0);
    }

    #[test]
    fn validated_rounds_have_no_failures() {
        let dataset = test_dataset();
        let mut pipeline = native_pipeline(&dataset);
        let mut validator = validator(&dataset, 1);
        let report = run_rounds(
            &mut pipeline,
            Some(&mut validator),
            &DriverOptions {
                start_nonce: 0,
                max_rounds: Some(2),
            },
            &AtomicBool::new(false),
        )
        .expect("run");

        assert_eq!(report.stop_reason, StopReason::RoundLimit);
        assert_eq!(report.rounds, 2);
        assert_eq!(report.hashes, 128);
        let stats = report.validation.expect("validation stats");
        assert_eq!(stats.rounds, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.checked, 128);
        assert_eq!(report.samples[1].base_nonce, 64);
    }

    #[test]
    fn corrupted_lane_is_reported_with_its_nonce() {
        let dataset = test_dataset();
        let mut pipeline = native_pipeline(&dataset);
        pipeline.pool_mut().device_mut().corrupt_final_hash(3);
        let mut validator = validator(&dataset, 1);
        let report = run_rounds(
            &mut pipeline,
            Some(&mut validator),
            &DriverOptions {
                start_nonce: 1000,
                max_rounds: Some(2),
            },
            &AtomicBool::new(false),
        )
        .expect("mismatches are not fatal");

        let stats = report.validation.expect("validation stats");
        assert_eq!(stats.rounds, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.failing_nonces, vec![1003, 1067]);
    }

    #[test]
    fn strided_validation_checks_every_nth_lane() {
        let dataset = test_dataset();
        let mut pipeline = native_pipeline(&dataset);
        pipeline.pool_mut().device_mut().corrupt_final_hash(5);
        let mut validator = validator(&dataset, 4);
        let report = run_rounds(
            &mut pipeline,
            Some(&mut validator),
            &DriverOptions {
                start_nonce: 0,
                max_rounds: Some(1),
            },
            &AtomicBool::new(false),
        )
        .expect("run");
        let stats = report.validation.expect("validation stats");
        assert_eq!(stats.checked, 16);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn cancellation_is_checked_before_each_round() {
        let dataset = test_dataset();
        let mut pipeline = native_pipeline(&dataset);
        let report = run_rounds::<_, ReferenceOracle>(
            &mut pipeline,
            None,
            &DriverOptions::default(),
            &AtomicBool::new(true),
        )
        .expect("run");
        assert_eq!(report.stop_reason, StopReason::Cancelled);
        assert_eq!(report.rounds, 0);
        assert!(report.validation.is_none());
    }

    #[test]
    fn run_ends_when_nonce_space_is_exhausted() {
        let dataset = test_dataset();
        let mut pipeline = native_pipeline(&dataset);
        let report = run_rounds::<_, ReferenceOracle>(
            &mut pipeline,
            None,
            &DriverOptions {
                start_nonce: u32::MAX - 127,
                max_rounds: None,
            },
            &AtomicBool::new(false),
        )
        .expect("run");
        assert_eq!(report.stop_reason, StopReason::NonceSpaceExhausted);
        assert_eq!(report.rounds, 2);
    }

    #[test]
    fn report_is_written_as_json() {
        let dataset = test_dataset();
        let mut pipeline = native_pipeline(&dataset);
        let report = run_rounds::<_, ReferenceOracle>(
            &mut pipeline,
            None,
            &DriverOptions {
                start_nonce: 0,
                max_rounds: Some(1),
            },
            &AtomicBool::new(false),
        )
        .expect("run");

        let dir = TempDir::new("report");
        let path = dir.0.join("report.json");
        write_report(&path, &report).expect("write");
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["stop_reason"], "round_limit");
        assert_eq!(value["intensity"], 64);
        assert_eq!(value["rounds"], 1);
        assert!(value["validation"].is_null());
    }

    fn sample(round: u64, elapsed_secs: f64) -> RoundSample {
        RoundSample {
            round,
            base_nonce: (round * 64) as u32,
            elapsed_secs,
            hps: 64.0 / elapsed_secs,
        }
    }

    #[test]
    fn round_window_keeps_only_recent_rounds() {
        let mut window = RoundWindow::new(4);
        for round in 1..=10 {
            window.record(sample(round, round as f64));
        }
        assert_eq!(window.rounds(), 10);
        // Rounds 7..=10 remain.
        assert_eq!(window.median_round_secs(), 8.5);
        let kept: Vec<u64> = window.into_samples().iter().map(|s| s.round).collect();
        assert_eq!(kept, vec![7, 8, 9, 10]);
    }

    #[test]
    fn median_round_time_over_odd_window() {
        let mut window = RoundWindow::new(RECENT_ROUNDS);
        assert_eq!(window.median_round_secs(), 0.0);
        for (round, secs) in [(1, 0.5), (2, 0.1), (3, 0.3)] {
            window.record(sample(round, secs));
        }
        assert_eq!(window.median_round_secs(), 0.3);
    }

    #[test]
    fn round_figures_show_rate_and_costs() {
        assert_eq!(format_rate(512.0), "512.00 H/s");
        assert_eq!(format_rate(2_500.0), "2.50 kH/s");
        assert_eq!(format_rate(3_000_000.0), "3.00 MH/s");
        assert_eq!(format_rate(0.0), "0.00 H/s");
        assert_eq!(
            format_round(1024, 0.5),
            "2.05 kH/s | 500.0 ms/round | 488.3 us/lane"
        );
    }
}
