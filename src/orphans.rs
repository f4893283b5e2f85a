//! Orphan detection.
//!
//! An orphan is an on-disk asset whose identity never appears, under any
//! variant spelling, in current content. Detection is report-only: nothing
//! here deletes, that is the archival subsystem's call.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::canonical::{canonicalize, MediaIdentity, RefScheme};
use crate::fsops::write_atomic;
use crate::rewrite::collect_html_references;
use crate::store::{ContentStore, StatusFilter};
use crate::{AppError, AppResult};

/// Catch-all sweep for references the element scan cannot see, e.g. inline
/// `background-image` styles.
static CONTENT_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?://[^/\s"')]+/content/(?:images|media)/[^\s"')]+"#)
        .expect("content url regex")
});

#[derive(Debug, Serialize)]
pub struct OrphanReport {
    pub scanned_files: u64,
    pub used_identities: u64,
    pub orphans: Vec<PathBuf>,
    pub used_listing: Option<PathBuf>,
    pub orphan_listing: Option<PathBuf>,
}

/// Compare on-disk assets against every reference in content and settings.
pub fn find_orphans(
    store: &dyn ContentStore,
    scheme: &RefScheme,
    log_dir: &Path,
) -> AppResult<OrphanReport> {
    let used = collect_used_identities(store, scheme)?;

    let mut scanned = 0u64;
    let mut orphans = Vec::new();
    for root in [&scheme.images_root, &scheme.media_root] {
        if !root.is_dir() {
            continue;
        }
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(
                        target: "mediamend",
                        event = "orphan_scan_entry_unreadable",
                        error = %err,
                    );
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            // Extensionless and icon files never participate in matching.
            let Some(identity) = scheme.identity_for_fs(&path) else {
                continue;
            };
            scanned += 1;
            if is_used(&identity, &used) {
                continue;
            }
            orphans.push(path);
        }
    }
    orphans.sort();

    let (used_listing, orphan_listing) = persist_listings(&used, &orphans, log_dir)?;

    tracing::info!(
        target: "mediamend",
        event = "orphan_scan_finished",
        scanned,
        used = used.len(),
        orphans = orphans.len(),
    );

    Ok(OrphanReport {
        scanned_files: scanned,
        used_identities: used.len() as u64,
        orphans,
        used_listing: Some(used_listing),
        orphan_listing: Some(orphan_listing),
    })
}

/// Exact identity match, then the directional `_o` fallback.
fn is_used(identity: &MediaIdentity, used: &BTreeSet<String>) -> bool {
    if used.contains(&identity.to_string()) {
        return true;
    }
    identity
        .strip_original_suffix()
        .is_some_and(|stripped| used.contains(&stripped.to_string()))
}

fn collect_used_identities(
    store: &dyn ContentStore,
    scheme: &RefScheme,
) -> AppResult<BTreeSet<String>> {
    let mut used = BTreeSet::new();
    let mut add = |raw: &str, used: &mut BTreeSet<String>| {
        if let Some(parts) = canonicalize(raw, scheme) {
            used.insert(parts.identity.to_string());
        }
    };

    let items = store.list_items(StatusFilter::All).map_err(AppError::from)?;
    for item in &items {
        match collect_html_references(&item.html) {
            Ok(refs) => {
                for reference in refs {
                    add(&reference, &mut used);
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "mediamend",
                    event = "orphan_item_scan_failed",
                    item = %item.id,
                    error = %err,
                );
            }
        }
        for capture in CONTENT_URL.find_iter(&item.html) {
            add(capture.as_str(), &mut used);
        }
        if let Some(feature) = &item.feature_image {
            add(feature, &mut used);
        }
    }

    let settings = store.settings().map_err(AppError::from)?;
    for (_, value) in settings.fields() {
        if let Some(value) = value {
            add(value, &mut used);
        }
    }

    Ok(used)
}

fn persist_listings(
    used: &BTreeSet<String>,
    orphans: &[PathBuf],
    log_dir: &Path,
) -> AppResult<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(log_dir).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "orphan_create_log_dir")
            .with_context("path", log_dir.display().to_string())
    })?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");

    let used_path = log_dir.join(format!("used_assets_{stamp}.json"));
    let used_vec: Vec<&String> = used.iter().collect();
    write_atomic(&used_path, &serde_json::to_vec_pretty(&used_vec)?)?;

    let orphan_path = log_dir.join(format!("orphaned_assets_{stamp}.json"));
    write_atomic(&orphan_path, &serde_json::to_vec_pretty(&orphans)?)?;

    Ok((used_path, orphan_path))
}
