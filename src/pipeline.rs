//! Run orchestration.
//!
//! Thin, policy-free sequencing of the engine components: inventory, plan,
//! persist plan, execute, ledger, rewrite. Per-item failures are isolated
//! and counted; only structurally fatal conditions (unwritable plan or
//! ledger, unreadable asset root, unreadable restore ledger) abort a run,
//! and only before mutation begins.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::canonical::{MediaIdentity, RefScheme};
use crate::config::EngineConfig;
use crate::executor::{
    self, CancelFlag, ExecOptions, Outcome, OutcomeCounts, SKIP_REASON_ALREADY_CONVERTED,
    SKIP_REASON_ALREADY_MOVED, SKIP_REASON_ORIGINAL_RETAINED,
};
use crate::inventory;
use crate::ledger::{self, ChangeKind, ChangeRecord, LedgerWriter};
use crate::planner::{self, ConversionMap, NamingPolicy, PhysicalOp, PlannedRename};
use crate::rewrite;
use crate::store::{ContentStore, StatusFilter};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    Apply,
}

impl RunMode {
    pub const fn is_apply(self) -> bool {
        matches!(self, RunMode::Apply)
    }
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::DryRun
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: RunMode,
    pub force: bool,
    pub write_plan: bool,
    pub status: StatusFilter,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            mode: RunMode::DryRun,
            force: false,
            write_plan: true,
            status: StatusFilter::All,
        }
    }
}

/// The complete outcome report a run always produces, no matter how many
/// individual items failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub mode: Option<RunMode>,
    pub policy: Option<NamingPolicy>,
    pub plan_path: Option<PathBuf>,
    pub ledger_path: Option<PathBuf>,
    pub planning: OutcomeCounts,
    pub transforms: OutcomeCounts,
    pub items_checked: u64,
    pub items_changed: u64,
    pub items_failed: u64,
    pub settings_changed: bool,
    pub warnings: u64,
}

impl RunSummary {
    fn new(mode: RunMode, policy: Option<NamingPolicy>) -> Self {
        RunSummary {
            mode: Some(mode),
            policy,
            ..RunSummary::default()
        }
    }
}

/// Convert every image under the images root to WebP and rewrite all
/// references through the resulting map.
pub async fn convert_run(
    cfg: &EngineConfig,
    store: &mut dyn ContentStore,
    opts: &RunOptions,
    cancel: &CancelFlag,
) -> AppResult<RunSummary> {
    cfg.validate_roots()?;
    let scheme = RefScheme::from_config(cfg);
    let mut summary = RunSummary::new(opts.mode, Some(NamingPolicy::ReencodeInPlace));

    let scanned = inventory::scan_images(&scheme)?;
    if let Err(err) = inventory::persist_listing(&scanned, &cfg.log_dir) {
        tracing::warn!(
            target: "mediamend",
            event = "inventory_listing_failed",
            error = %err,
        );
    }
    if scanned.assets.is_empty() {
        tracing::info!(target: "mediamend", event = "convert_nothing_to_do");
        return Ok(summary);
    }

    let plan = planner::plan_reencode(&scanned, &scheme, opts.force);
    summary.planning = plan.counts.clone();
    summary.warnings += plan.failures.len() as u64;
    if plan.map.is_empty() {
        return Ok(summary);
    }

    finish_transform_run(cfg, store, opts, cancel, plan.map, &mut summary).await?;
    Ok(summary)
}

/// Relocate every referenced asset into its owning item's slug folder and
/// rewrite all references through the resulting map.
pub async fn reorganize_run(
    cfg: &EngineConfig,
    store: &mut dyn ContentStore,
    opts: &RunOptions,
    cancel: &CancelFlag,
) -> AppResult<RunSummary> {
    cfg.validate_roots()?;
    let scheme = RefScheme::from_config(cfg);
    let mut summary = RunSummary::new(opts.mode, Some(NamingPolicy::RelocateToItemFolder));

    let items = store.list_items(opts.status).map_err(AppError::from)?;
    let references = inventory::referenced_assets(&items, &scheme);
    let plan = planner::plan_relocate(&references, &scheme);
    summary.planning = plan.counts.clone();
    if plan.map.is_empty() {
        tracing::info!(target: "mediamend", event = "reorganize_nothing_to_do");
        return Ok(summary);
    }

    finish_transform_run(cfg, store, opts, cancel, plan.map, &mut summary).await?;
    Ok(summary)
}

/// Shared tail of convert/reorganize: persist the plan, run the executor,
/// record the ledger, rewrite content, finalize.
async fn finish_transform_run(
    cfg: &EngineConfig,
    store: &mut dyn ContentStore,
    opts: &RunOptions,
    cancel: &CancelFlag,
    map: ConversionMap,
    summary: &mut RunSummary,
) -> AppResult<()> {
    let policy = summary.policy.unwrap_or(NamingPolicy::ReencodeInPlace);
    if opts.write_plan {
        summary.plan_path = Some(planner::persist_plan(&map, policy, &cfg.log_dir)?);
    }

    let mut ledger = if opts.mode.is_apply() {
        Some(LedgerWriter::create(&cfg.log_dir)?)
    } else {
        None
    };

    let exec_opts = ExecOptions {
        dry_run: !opts.mode.is_apply(),
        force: opts.force,
        quality: cfg.webp_quality,
        workers: cfg.effective_workers(),
    };
    let exec = executor::execute(&map, &exec_opts, cancel).await?;
    summary.transforms = exec.counts.clone();
    summary.warnings += exec.counts.errored;

    // Only physically settled renames drive reference rewriting; an errored
    // or cancelled asset keeps its old references.
    let mut applied = ConversionMap::new(map.scheme.clone());
    for outcome in &exec.outcomes {
        let settled = match &outcome.outcome {
            Outcome::Success => true,
            Outcome::Skipped(reason) => {
                reason == SKIP_REASON_ALREADY_CONVERTED || reason == SKIP_REASON_ALREADY_MOVED
            }
            Outcome::Error(_) => false,
        };
        if !settled {
            continue;
        }
        if let (Some(ledger), Outcome::Success) = (ledger.as_mut(), &outcome.outcome) {
            ledger.push(ChangeRecord::rename(
                outcome.rename.old_fs.display().to_string(),
                outcome.rename.op,
                outcome.rename.old_identity.to_string(),
                outcome.rename.new_identity.to_string(),
            ));
        }
        applied.insert(outcome.rename.clone());
    }
    if let Some(ledger) = ledger.as_mut() {
        ledger.flush()?;
    }

    if !applied.is_empty() {
        let pass = apply_map_to_content(store, &applied, opts.mode, opts.status, &mut ledger)?;
        summary.items_checked = pass.checked;
        summary.items_changed = pass.changed;
        summary.items_failed = pass.failed;
        summary.settings_changed = pass.settings_changed;
        summary.warnings += pass.failed;
    }

    if let Some(ledger) = ledger {
        summary.ledger_path = Some(ledger.finalize()?);
    }

    tracing::info!(
        target: "mediamend",
        event = "run_finished",
        mode = ?opts.mode,
        policy = ?policy,
        transformed = summary.transforms.succeeded,
        items_changed = summary.items_changed,
        warnings = summary.warnings,
    );
    Ok(())
}

struct ContentPass {
    checked: u64,
    changed: u64,
    failed: u64,
    settings_changed: bool,
}

/// One rewrite pass over every content item and the site settings.
/// Per-item rewrite failures leave the item unmodified and count as
/// warnings; the pass always completes.
fn apply_map_to_content(
    store: &mut dyn ContentStore,
    map: &ConversionMap,
    mode: RunMode,
    status: StatusFilter,
    ledger: &mut Option<LedgerWriter>,
) -> AppResult<ContentPass> {
    let mut pass = ContentPass {
        checked: 0,
        changed: 0,
        failed: 0,
        settings_changed: false,
    };

    let items = store.list_items(status).map_err(AppError::from)?;
    for item in items {
        pass.checked += 1;

        let body = match rewrite::rewrite_html(&item.html, map, &item.id) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    target: "mediamend",
                    event = "item_rewrite_failed",
                    item = %item.id,
                    error = %err,
                );
                pass.failed += 1;
                continue;
            }
        };

        let mut records = body.changes;
        let mut feature_image = item.feature_image.clone();
        if let Some(old) = &item.feature_image {
            if let Some(new) = rewrite::rewrite_reference(old, map) {
                records.push(ChangeRecord::field_rewrite(
                    &item.id,
                    "feature_image",
                    old,
                    &new,
                ));
                feature_image = Some(new);
            }
        }

        let body_changed = body.changed;
        let feature_changed = feature_image != item.feature_image;
        if !body_changed && !feature_changed {
            continue;
        }

        if let Some(ledger) = ledger.as_mut() {
            ledger.extend(records);
            ledger.flush_if_needed()?;
        }

        if mode.is_apply() {
            let mut updated = item.clone();
            updated.html = body.html;
            updated.feature_image = feature_image;
            match store.update_item(&updated) {
                Ok(()) => pass.changed += 1,
                Err(err) => {
                    tracing::warn!(
                        target: "mediamend",
                        event = "item_update_failed",
                        item = %item.id,
                        error = %AppError::from(err),
                    );
                    pass.failed += 1;
                }
            }
        } else {
            pass.changed += 1;
        }
    }

    // Site settings carry flat references too.
    let settings = store.settings().map_err(AppError::from)?;
    let mut updated_settings = settings.clone();
    let mut settings_records = Vec::new();
    for (name, value) in settings.fields() {
        if let Some(old) = value {
            if let Some(new) = rewrite::rewrite_reference(old, map) {
                settings_records.push(ChangeRecord::field_rewrite("settings", name, old, &new));
                updated_settings.set_field(name, new);
            }
        }
    }
    if !settings_records.is_empty() {
        if let Some(ledger) = ledger.as_mut() {
            ledger.extend(settings_records);
            ledger.flush_if_needed()?;
        }
        if mode.is_apply() {
            match store.update_settings(&updated_settings) {
                Ok(()) => pass.settings_changed = true,
                Err(err) => {
                    tracing::warn!(
                        target: "mediamend",
                        event = "settings_update_failed",
                        error = %AppError::from(err),
                    );
                    pass.failed += 1;
                }
            }
        } else {
            pass.settings_changed = true;
        }
    }

    Ok(pass)
}

/// Replay a ledger backward: reverse the moves, rewrite every reference
/// through the inverted map, and put alt text back.
pub async fn restore_run(
    cfg: &EngineConfig,
    store: &mut dyn ContentStore,
    ledger_path: &Path,
    opts: &RunOptions,
    cancel: &CancelFlag,
) -> AppResult<RunSummary> {
    let entries = ledger::load(ledger_path)?;
    let inverted = ledger::invert(&entries);
    let scheme = RefScheme::from_config(cfg);
    let mut summary = RunSummary::new(opts.mode, None);

    let mut physical = ConversionMap::new(scheme.clone());
    let mut reference_map = ConversionMap::new(scheme.clone());
    let mut alt_entries: Vec<ChangeRecord> = Vec::new();
    let mut retained = 0u64;

    for entry in &inverted {
        match entry.kind {
            ChangeKind::Rename => {
                let old_identity = parse_identity(&entry.old)?;
                let new_identity = parse_identity(&entry.new)?;
                let op = entry.op.unwrap_or(PhysicalOp::Move);
                let rename = PlannedRename {
                    op,
                    old_fs: scheme.fs_path(&old_identity),
                    new_fs: scheme.fs_path(&new_identity),
                    old_identity,
                    new_identity,
                };
                if op == PhysicalOp::Move {
                    physical.insert(rename.clone());
                } else {
                    // The convert step never deleted the original, so there
                    // is nothing physical to reverse.
                    retained += 1;
                }
                reference_map.insert(rename);
            }
            ChangeKind::FieldRewrite => {
                if entry
                    .field
                    .as_deref()
                    .is_some_and(|field| field.starts_with("alt:"))
                {
                    alt_entries.push(entry.clone());
                }
            }
        }
    }

    if !physical.is_empty() {
        let exec_opts = ExecOptions {
            dry_run: !opts.mode.is_apply(),
            force: false,
            quality: cfg.webp_quality,
            workers: cfg.effective_workers(),
        };
        let exec = executor::execute(&physical, &exec_opts, cancel).await?;
        summary.transforms = exec.counts.clone();
        // A missing artifact at restore time is a warning, not a failure of
        // the whole restore.
        summary.warnings += exec.counts.errored;
    }
    for _ in 0..retained {
        summary
            .transforms
            .record_skip(SKIP_REASON_ORIGINAL_RETAINED);
    }

    if !reference_map.is_empty() {
        let mut no_ledger = None;
        let pass =
            apply_map_to_content(store, &reference_map, opts.mode, opts.status, &mut no_ledger)?;
        summary.items_checked = pass.checked;
        summary.items_changed = pass.changed;
        summary.items_failed = pass.failed;
        summary.settings_changed = pass.settings_changed;
        summary.warnings += pass.failed;
    }

    if !alt_entries.is_empty() {
        restore_alt_entries(store, &alt_entries, opts.mode, &mut summary)?;
    }

    tracing::info!(
        target: "mediamend",
        event = "restore_finished",
        mode = ?opts.mode,
        moves_reversed = summary.transforms.succeeded,
        items_changed = summary.items_changed,
        warnings = summary.warnings,
    );
    Ok(summary)
}

fn parse_identity(value: &str) -> AppResult<MediaIdentity> {
    MediaIdentity::try_from(value.to_string()).map_err(|err| {
        AppError::new("LEDGER/ENTRY", "Ledger entry carries an unparseable identity.")
            .with_context("value", value.to_string())
            .with_context("error", err)
    })
}

fn restore_alt_entries(
    store: &mut dyn ContentStore,
    entries: &[ChangeRecord],
    mode: RunMode,
    summary: &mut RunSummary,
) -> AppResult<()> {
    let items = store.list_items(StatusFilter::All).map_err(AppError::from)?;
    for item in items {
        let mut html = item.html.clone();
        let mut item_changed = false;
        for entry in entries.iter().filter(|entry| entry.scope == item.id) {
            let Some(anchor) = entry
                .field
                .as_deref()
                .and_then(|field| field.strip_prefix("alt:"))
            else {
                continue;
            };
            // Inverted entry: `old` is the value we expect to find now,
            // `new` is the value to put back.
            let (rewritten, changed) =
                rewrite::restore_alt_text(&html, anchor, &entry.old, &entry.new)?;
            if changed {
                html = rewritten;
                item_changed = true;
            } else {
                summary.warnings += 1;
            }
        }
        if item_changed {
            if mode.is_apply() {
                let mut updated = item.clone();
                updated.html = html;
                store.update_item(&updated).map_err(AppError::from)?;
            }
            summary.items_changed += 1;
        }
    }
    Ok(())
}

/// Autofill image alt text across all items; the changes land in a ledger
/// of their own so they reverse like everything else.
pub fn alt_text_run(
    cfg: &EngineConfig,
    store: &mut dyn ContentStore,
    force: bool,
    mode: RunMode,
) -> AppResult<RunSummary> {
    let mut summary = RunSummary::new(mode, None);
    let mut ledger = if mode.is_apply() {
        Some(LedgerWriter::create(&cfg.log_dir)?)
    } else {
        None
    };

    let items = store.list_items(StatusFilter::All).map_err(AppError::from)?;
    for item in items {
        summary.items_checked += 1;
        let outcome = match rewrite::fill_alt_text(&item.html, force, &item.id) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    target: "mediamend",
                    event = "alt_fill_failed",
                    item = %item.id,
                    error = %err,
                );
                summary.items_failed += 1;
                summary.warnings += 1;
                continue;
            }
        };
        if !outcome.changed {
            continue;
        }
        if let Some(ledger) = ledger.as_mut() {
            ledger.extend(outcome.changes);
            ledger.flush_if_needed()?;
        }
        if mode.is_apply() {
            let mut updated = item.clone();
            updated.html = outcome.html;
            match store.update_item(&updated) {
                Ok(()) => summary.items_changed += 1,
                Err(err) => {
                    tracing::warn!(
                        target: "mediamend",
                        event = "item_update_failed",
                        item = %item.id,
                        error = %AppError::from(err),
                    );
                    summary.items_failed += 1;
                }
            }
        } else {
            summary.items_changed += 1;
        }
    }

    if let Some(ledger) = ledger {
        summary.ledger_path = Some(ledger.finalize()?);
    }
    Ok(summary)
}
