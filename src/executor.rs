//! Physical transform execution.
//!
//! Every planned rename runs as its own blocking task on a fixed-size pool;
//! one asset's failure never aborts the batch. Aggregation into the run
//! report happens single-threaded after the join point.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::logging::hash_path;
use crate::planner::{ConversionMap, PhysicalOp, PlannedRename};
use crate::{AppError, AppResult};

pub const SKIP_REASON_SAME_PATH: &str = "same_path";
pub const SKIP_REASON_ALREADY_CONVERTED: &str = "already_converted";
pub const SKIP_REASON_ALREADY_MOVED: &str = "already_moved";
pub const SKIP_REASON_CANCELLED: &str = "cancelled";
pub const SKIP_REASON_ORIGINAL_RETAINED: &str = "original_retained";
pub const ERROR_REASON_MISSING_SOURCE: &str = "missing_source";
pub const ERROR_REASON_TARGET_OCCUPIED: &str = "target_occupied";

/// Cooperative stop flag: trips between items, never mid-write.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum Outcome {
    Success,
    Skipped(String),
    Error(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformOutcome {
    pub rename: PlannedRename,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub processed: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub errored: u64,
    #[serde(default)]
    pub reasons: BTreeMap<String, u64>,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: &Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Success => self.succeeded += 1,
            Outcome::Skipped(reason) => {
                self.skipped += 1;
                *self.reasons.entry(reason.clone()).or_insert(0) += 1;
            }
            Outcome::Error(reason) => {
                self.errored += 1;
                *self.reasons.entry(reason.clone()).or_insert(0) += 1;
            }
        }
    }

    pub fn record_skip(&mut self, reason: &str) {
        self.skipped += 1;
        *self.reasons.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn record_error(&mut self, reason: &str) {
        self.errored += 1;
        *self.reasons.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &OutcomeCounts) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.errored += other.errored;
        for (reason, count) in &other.reasons {
            *self.reasons.entry(reason.clone()).or_insert(0) += count;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub dry_run: bool,
    pub force: bool,
    pub quality: u8,
    pub workers: usize,
}

#[derive(Debug)]
pub struct ExecReport {
    pub outcomes: Vec<TransformOutcome>,
    pub counts: OutcomeCounts,
}

/// Execute every rename in the map on the worker pool.
///
/// Dry-run threads through the same per-item code path; only the mutation
/// points are gated, so the returned outcomes reflect exactly what a real
/// run would do.
pub async fn execute(
    map: &ConversionMap,
    opts: &ExecOptions,
    cancel: &CancelFlag,
) -> AppResult<ExecReport> {
    let workers = opts.workers.max(1);
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut join_set: JoinSet<(usize, Outcome)> = JoinSet::new();
    // Pre-filled with the cancellation outcome; tasks that run overwrite it.
    let mut outcomes: Vec<TransformOutcome> = map
        .renames()
        .iter()
        .map(|rename| TransformOutcome {
            rename: rename.clone(),
            outcome: Outcome::Skipped(SKIP_REASON_CANCELLED.to_string()),
        })
        .collect();

    tracing::info!(
        target: "mediamend",
        event = "transform_batch_started",
        renames = map.len(),
        workers,
        dry_run = opts.dry_run,
    );

    for (index, rename) in map.renames().iter().enumerate() {
        if cancel.is_cancelled() {
            continue;
        }

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::new("TRANSFORM/POOL", "Worker pool closed unexpectedly."))?;

        if cancel.is_cancelled() {
            continue;
        }

        let task_rename = rename.clone();
        let task_opts = opts.clone();
        join_set.spawn(async move {
            let _permit = permit;
            let result = tokio::task::spawn_blocking(move || {
                perform_rename(&task_rename, &task_opts)
            })
            .await;
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(join_err) => Outcome::Error(format!("worker panicked: {join_err}")),
            };
            (index, outcome)
        });
    }

    while let Some(joined) = join_set.join_next().await {
        if let Ok((index, outcome)) = joined {
            outcomes[index].outcome = outcome;
        }
    }

    let mut counts = OutcomeCounts::default();
    for item in &outcomes {
        counts.record(&item.outcome);
        if let Outcome::Error(reason) = &item.outcome {
            tracing::warn!(
                target: "mediamend",
                event = "transform_failed",
                asset_hash = %hash_path(&item.rename.old_fs),
                reason = %reason,
            );
        }
    }

    tracing::info!(
        target: "mediamend",
        event = "transform_batch_finished",
        succeeded = counts.succeeded,
        skipped = counts.skipped,
        errored = counts.errored,
    );

    Ok(ExecReport { outcomes, counts })
}

fn perform_rename(rename: &PlannedRename, opts: &ExecOptions) -> Outcome {
    match rename.op {
        PhysicalOp::Reencode => reencode_asset(rename, opts),
        PhysicalOp::Move => move_asset(rename, opts),
    }
}

fn reencode_asset(rename: &PlannedRename, opts: &ExecOptions) -> Outcome {
    if rename.new_fs == rename.old_fs {
        return Outcome::Skipped(SKIP_REASON_SAME_PATH.to_string());
    }
    if !rename.old_fs.exists() {
        return Outcome::Error(ERROR_REASON_MISSING_SOURCE.to_string());
    }
    if rename.new_fs.exists() && !opts.force {
        return Outcome::Skipped(SKIP_REASON_ALREADY_CONVERTED.to_string());
    }
    if opts.dry_run {
        return Outcome::Success;
    }

    match encode_webp(&rename.old_fs, &rename.new_fs, opts.quality) {
        Ok(()) => Outcome::Success,
        Err(err) => Outcome::Error(err.to_string()),
    }
}

fn move_asset(rename: &PlannedRename, opts: &ExecOptions) -> Outcome {
    if rename.new_fs == rename.old_fs {
        return Outcome::Skipped(SKIP_REASON_SAME_PATH.to_string());
    }
    if !rename.old_fs.exists() {
        if rename.new_fs.exists() {
            return Outcome::Skipped(SKIP_REASON_ALREADY_MOVED.to_string());
        }
        return Outcome::Error(ERROR_REASON_MISSING_SOURCE.to_string());
    }
    if rename.new_fs.exists() {
        return Outcome::Error(ERROR_REASON_TARGET_OCCUPIED.to_string());
    }
    if opts.dry_run {
        return Outcome::Success;
    }

    match crate::fsops::move_file(&rename.old_fs, &rename.new_fs) {
        Ok(()) => Outcome::Success,
        Err(err) => Outcome::Error(err.to_string()),
    }
}

/// Decode, normalize color mode, encode lossy WebP, and swap the result in
/// atomically. The source file is left in place.
fn encode_webp(source: &Path, target: &Path, quality: u8) -> AppResult<()> {
    let decoded = image::open(source).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "reencode_decode")
            .with_context("path", source.display().to_string())
    })?;

    // libwebp accepts 8-bit RGB/RGBA only; flatten everything else to RGB.
    let encoded = match decoded {
        DynamicImage::ImageRgba8(ref rgba) => {
            webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height())
                .encode(quality as f32)
        }
        DynamicImage::ImageRgb8(ref rgb) => {
            webp::Encoder::from_rgb(rgb.as_raw(), rgb.width(), rgb.height())
                .encode(quality as f32)
        }
        other => {
            let rgb = other.to_rgb8();
            webp::Encoder::from_rgb(rgb.as_raw(), rgb.width(), rgb.height())
                .encode(quality as f32)
        }
    };

    crate::fsops::write_atomic(target, &encoded)
        .map_err(|err| err.with_context("operation", "reencode_write"))
}
