//! Asset inventory.
//!
//! Two sources of truth: the filesystem (convert policy walks the images
//! root) and live content (relocate policy derives assets from each item's
//! references). Both reduce to identities through the canonicalizer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use walkdir::WalkDir;

use crate::canonical::{canonicalize, is_convertible_extension, MediaIdentity, RefScheme};
use crate::fsops::write_atomic;
use crate::logging::hash_path;
use crate::rewrite::collect_html_references;
use crate::store::ContentItem;
use crate::{AppError, AppResult};

/// Directories holding generated variants; never part of the inventory.
const VARIANT_DIRS: &[&str] = &["size", "format"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Asset {
    pub path: PathBuf,
    pub identity: MediaIdentity,
}

/// Duplicate-name collision groups, keyed by identity minus extension.
pub type DuplicateGroups = BTreeMap<String, Vec<PathBuf>>;

#[derive(Debug, Clone, Serialize)]
pub struct Inventory {
    pub assets: Vec<Asset>,
    pub duplicates: DuplicateGroups,
}

/// One item's ordered, deduplicated media references: feature image first,
/// then body references in document order.
#[derive(Debug, Clone)]
pub struct ItemReferences {
    pub id: String,
    pub slug: String,
    pub identities: Vec<MediaIdentity>,
}

/// Walk the images root collecting every convertible asset.
///
/// An unreadable root is fatal; unreadable entries deeper down are logged
/// and skipped. The returned asset list is path-sorted and free of
/// duplicates by construction.
pub fn scan_images(scheme: &RefScheme) -> AppResult<Inventory> {
    let root = &scheme.images_root;
    if !root.is_dir() {
        return Err(AppError::new(
            "INVENTORY/ROOT",
            "Images directory could not be enumerated.",
        )
        .with_context("path", root.display().to_string()));
    }

    let mut assets = Vec::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter();
    let mut iter = walker.filter_entry(|entry| {
        !(entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| VARIANT_DIRS.contains(&name)))
    });

    while let Some(entry) = iter.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(
                    target: "mediamend",
                    event = "inventory_entry_unreadable",
                    error = %err,
                );
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !is_convertible_extension(ext) {
            continue;
        }
        let Some(identity) = scheme.identity_for_fs(&path) else {
            continue;
        };
        assets.push(Asset { path, identity });
    }

    assets.sort_by(|a, b| a.path.cmp(&b.path));

    let mut groups: DuplicateGroups = BTreeMap::new();
    for asset in &assets {
        groups
            .entry(asset.identity.without_extension())
            .or_default()
            .push(asset.path.clone());
    }
    groups.retain(|_, members| members.len() > 1);

    tracing::info!(
        target: "mediamend",
        event = "inventory_scanned",
        assets = assets.len(),
        duplicate_groups = groups.len(),
    );

    Ok(Inventory {
        assets,
        duplicates: groups,
    })
}

/// Derive per-item asset references from live content, resolving each to a
/// local file. Items come back in input order; the planner imposes its own
/// stable ordering.
pub fn referenced_assets(items: &[ContentItem], scheme: &RefScheme) -> Vec<ItemReferences> {
    let mut collected = Vec::with_capacity(items.len());

    for item in items {
        let mut raw_refs: Vec<String> = Vec::new();
        if let Some(feature) = &item.feature_image {
            raw_refs.push(feature.clone());
        }
        match collect_html_references(&item.html) {
            Ok(body_refs) => raw_refs.extend(body_refs),
            Err(err) => {
                tracing::warn!(
                    target: "mediamend",
                    event = "reference_scan_failed",
                    item = %item.id,
                    error = %err,
                );
            }
        }

        let mut identities: Vec<MediaIdentity> = Vec::new();
        for raw in raw_refs {
            let Some(parts) = canonicalize(&raw, scheme) else {
                continue;
            };
            let identity = parts.identity;
            if identities.contains(&identity) {
                continue;
            }
            let path = scheme.fs_path(&identity);
            if !path.is_file() || !is_media_file(&path) {
                continue;
            }
            identities.push(identity);
        }

        collected.push(ItemReferences {
            id: item.id.clone(),
            slug: item.slug.clone(),
            identities,
        });
    }

    collected
}

fn is_media_file(path: &Path) -> bool {
    mime_guess::from_path(path)
        .first()
        .map(|mime| {
            let top = mime.type_();
            top == mime_guess::mime::IMAGE
                || top == mime_guess::mime::VIDEO
                || top == mime_guess::mime::AUDIO
        })
        .unwrap_or(false)
}

#[derive(Serialize)]
struct InventoryListing<'a> {
    created_at: String,
    assets: Vec<&'a Path>,
    duplicates: &'a DuplicateGroups,
}

/// Persist the scan result beside the plans and ledgers. Diagnostic only;
/// restore never reads this.
pub fn persist_listing(inventory: &Inventory, log_dir: &Path) -> AppResult<PathBuf> {
    std::fs::create_dir_all(log_dir).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "inventory_create_log_dir")
            .with_context("path", log_dir.display().to_string())
    })?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let path = log_dir.join(format!("asset_inventory_{stamp}.json"));
    let listing = InventoryListing {
        created_at: Utc::now().to_rfc3339(),
        assets: inventory.assets.iter().map(|a| a.path.as_path()).collect(),
        duplicates: &inventory.duplicates,
    };
    let serialized = serde_json::to_vec_pretty(&listing)
        .map_err(|err| AppError::from(err).with_context("operation", "inventory_encode"))?;
    write_atomic(&path, &serialized)?;
    tracing::info!(
        target: "mediamend",
        event = "inventory_listing_written",
        path_hash = %hash_path(&path),
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn scheme_at(root: &Path) -> RefScheme {
        RefScheme {
            site_origin: "https://host".into(),
            placeholder: "__GHOST_URL__".into(),
            images_root: root.join("images"),
            media_root: root.join("media"),
        }
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn scan_collects_convertible_files_and_skips_variant_dirs() {
        let dir = tempdir().unwrap();
        let scheme = scheme_at(dir.path());
        touch(&scheme.images_root.join("2024/a.png"));
        touch(&scheme.images_root.join("2024/b.jpeg"));
        touch(&scheme.images_root.join("2024/c.webp"));
        touch(&scheme.images_root.join("2024/notes.txt"));
        touch(&scheme.images_root.join("favicon.ico"));
        touch(&scheme.images_root.join("size/w600/2024/a.png"));
        touch(&scheme.images_root.join("format/webp/2024/a.png"));

        let inventory = scan_images(&scheme).unwrap();
        let tails: Vec<String> = inventory
            .assets
            .iter()
            .map(|a| a.identity.to_string())
            .collect();
        assert_eq!(tails, vec!["images/2024/a.png", "images/2024/b.jpeg"]);
        assert!(inventory.duplicates.is_empty());
    }

    #[test]
    fn same_stem_different_extension_forms_a_duplicate_group() {
        let dir = tempdir().unwrap();
        let scheme = scheme_at(dir.path());
        touch(&scheme.images_root.join("2024/a.png"));
        touch(&scheme.images_root.join("2024/a.jpg"));
        touch(&scheme.images_root.join("2023/a.png"));

        let inventory = scan_images(&scheme).unwrap();
        assert_eq!(inventory.duplicates.len(), 1);
        let members = inventory.duplicates.get("images/2024/a").unwrap();
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn missing_root_is_fatal() {
        let dir = tempdir().unwrap();
        let scheme = scheme_at(dir.path());
        let err = scan_images(&scheme).unwrap_err();
        assert_eq!(err.code(), "INVENTORY/ROOT");
    }

    #[test]
    fn referenced_assets_order_feature_first_and_deduplicate() {
        let dir = tempdir().unwrap();
        let scheme = scheme_at(dir.path());
        touch(&scheme.images_root.join("2024/hero.png"));
        touch(&scheme.images_root.join("2024/body.png"));

        let item = ContentItem {
            id: "1".into(),
            slug: "alpha".into(),
            status: Some("published".into()),
            html: concat!(
                "<img src=\"/content/images/2024/body.png\">",
                "<img src=\"https://host/content/images/size/w300/2024/hero.png\">",
                "<img src=\"/content/images/2024/missing.png\">",
            )
            .into(),
            feature_image: Some("https://host/content/images/2024/hero.png".into()),
        };

        let refs = referenced_assets(&[item], &scheme);
        let ids: Vec<String> = refs[0].identities.iter().map(|i| i.to_string()).collect();
        // Feature image claims position one; the size-variant spelling of the
        // same asset collapses into it; missing files drop out.
        assert_eq!(ids, vec!["images/2024/hero.png", "images/2024/body.png"]);
    }

    #[test]
    fn listing_persists_assets_and_groups() {
        let dir = tempdir().unwrap();
        let scheme = scheme_at(dir.path());
        touch(&scheme.images_root.join("2024/a.png"));
        let inventory = scan_images(&scheme).unwrap();

        let log_dir = dir.path().join("logs");
        let path = persist_listing(&inventory, &log_dir).unwrap();
        let data = fs::read_to_string(&path).unwrap();
        assert!(data.contains("2024/a.png"));
    }
}
