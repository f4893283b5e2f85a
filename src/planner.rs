//! Conversion planning.
//!
//! The planner decides, per asset, the new identity — a re-encoded filename
//! beside the original, or a slug-folder destination — and expands every
//! decision into the three representations the rewriter matches against:
//! filesystem path, relative URL, and absolute URL.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::canonical::{canonicalize, MediaIdentity, RefScheme};
use crate::executor::OutcomeCounts;
use crate::fsops::write_atomic;
use crate::inventory::{Inventory, ItemReferences};
use crate::logging::hash_path;
use crate::{AppError, AppResult};

const DISAMBIGUATION_ATTEMPTS: u32 = 100;

pub const SKIP_REASON_SAME_PATH: &str = "same_path";
pub const SKIP_REASON_ALREADY_IN_SLUG_FOLDER: &str = "already_in_slug_folder";
pub const FAIL_REASON_DISAMBIGUATION: &str = "disambiguation_exhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalOp {
    Reencode,
    Move,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingPolicy {
    ReencodeInPlace,
    RelocateToItemFolder,
}

/// One planned rename, in every representation the executor and rewriter need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRename {
    pub op: PhysicalOp,
    pub old_identity: MediaIdentity,
    pub new_identity: MediaIdentity,
    pub old_fs: PathBuf,
    pub new_fs: PathBuf,
}

/// Bidirectional conversion map: every representation of an old identity
/// (filesystem path, relative URL, absolute URL) keyed to its new
/// counterpart, plus the ordered rename list driving the executor.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionMap {
    pub scheme: RefScheme,
    renames: Vec<PlannedRename>,
    entries: BTreeMap<String, String>,
    #[serde(skip)]
    old_identities: HashSet<MediaIdentity>,
}

impl ConversionMap {
    pub fn new(scheme: RefScheme) -> Self {
        ConversionMap {
            scheme,
            renames: Vec::new(),
            entries: BTreeMap::new(),
            old_identities: HashSet::new(),
        }
    }

    pub fn insert(&mut self, rename: PlannedRename) {
        let old = &rename.old_identity;
        let new = &rename.new_identity;
        self.entries.insert(
            self.scheme.fs_string(old),
            self.scheme.fs_string(new),
        );
        self.entries
            .insert(old.relative_url(), new.relative_url());
        self.entries
            .insert(self.scheme.absolute_url(old), self.scheme.absolute_url(new));
        self.old_identities.insert(old.clone());
        self.renames.push(rename);
    }

    pub fn renames(&self) -> &[PlannedRename] {
        &self.renames
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.renames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.renames.len()
    }

    /// Whether an old identity is already spoken for.
    pub fn claims(&self, identity: &MediaIdentity) -> bool {
        self.old_identities.contains(identity)
    }

    /// Map an old identity to its planned replacement.
    ///
    /// Lookup order: filesystem-path form, relative-URL form, absolute-URL
    /// form. On a miss the `_o`-stripped sibling is tried, and a `.webp`
    /// identity is additionally retried with each original extension
    /// substituted, in trial order.
    pub fn resolve(&self, identity: &MediaIdentity) -> Option<MediaIdentity> {
        if let Some(found) = self.lookup_exact(identity) {
            return Some(found);
        }
        if let Some(stripped) = identity.strip_original_suffix() {
            if let Some(found) = self.lookup_exact(&stripped) {
                return Some(found);
            }
        }
        if identity
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("webp"))
        {
            for ext in crate::canonical::ORIGINAL_EXTENSION_TRIALS {
                if let Some(found) = self.lookup_exact(&identity.with_extension(ext)) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn lookup_exact(&self, identity: &MediaIdentity) -> Option<MediaIdentity> {
        if let Some(value) = self.entries.get(&self.scheme.fs_string(identity)) {
            return self.scheme.identity_for_fs(Path::new(value));
        }
        if let Some(value) = self.entries.get(&identity.relative_url()) {
            return canonicalize(value, &self.scheme).map(|parts| parts.identity);
        }
        if let Some(value) = self.entries.get(&self.scheme.absolute_url(identity)) {
            return canonicalize(value, &self.scheme).map(|parts| parts.identity);
        }
        None
    }
}

#[derive(Debug)]
pub struct PlanReport {
    pub map: ConversionMap,
    pub counts: OutcomeCounts,
    pub failures: Vec<AppError>,
}

/// Plan the re-encode policy: every inventory asset converts to a `.webp`
/// file beside the original. Duplicate-group members encode their extension
/// into the stem; an occupied target gets a bounded numeric disambiguator,
/// unless `force` says to overwrite it.
pub fn plan_reencode(inventory: &Inventory, scheme: &RefScheme, force: bool) -> PlanReport {
    let mut map = ConversionMap::new(scheme.clone());
    let mut counts = OutcomeCounts::default();
    let mut failures = Vec::new();
    let mut planned_targets: HashSet<PathBuf> = HashSet::new();

    for asset in &inventory.assets {
        counts.processed += 1;

        let file_name = asset.identity.file_name().to_string();
        let Some((stem, ext)) = file_name.rsplit_once('.') else {
            counts.record_skip("missing_extension");
            continue;
        };

        let in_duplicate_group = inventory
            .duplicates
            .contains_key(&asset.identity.without_extension());
        let base_stem = if in_duplicate_group {
            append_before_original_suffix(stem, &format!("_{}", ext.to_ascii_lowercase()))
        } else {
            stem.to_string()
        };

        let dir = match asset.identity.tail().rsplit_once('/') {
            Some((dir, _)) => Some(dir.to_string()),
            None => None,
        };

        let mut resolved = None;
        for attempt in 0..=DISAMBIGUATION_ATTEMPTS {
            let candidate_stem = if attempt == 0 {
                base_stem.clone()
            } else {
                append_before_original_suffix(&base_stem, &format!("-{attempt}"))
            };
            let candidate_name = format!("{candidate_stem}.webp");
            let tail = match &dir {
                Some(dir) => format!("{dir}/{candidate_name}"),
                None => candidate_name,
            };
            let candidate = MediaIdentity::new(asset.identity.category(), tail);
            let candidate_fs = scheme.fs_path(&candidate);
            if planned_targets.contains(&candidate_fs) || (!force && candidate_fs.exists()) {
                continue;
            }
            resolved = Some((candidate, candidate_fs));
            break;
        }

        let Some((new_identity, new_fs)) = resolved else {
            let err = AppError::new(
                "PLAN/DISAMBIGUATION_EXHAUSTED",
                "Could not find a free target name for the asset.",
            )
            .with_context("asset", asset.identity.to_string())
            .with_context("attempts", DISAMBIGUATION_ATTEMPTS.to_string());
            tracing::warn!(
                target: "mediamend",
                event = "plan_disambiguation_exhausted",
                asset_hash = %hash_path(&asset.path),
            );
            counts.record_error(FAIL_REASON_DISAMBIGUATION);
            failures.push(err);
            continue;
        };

        if new_fs == asset.path {
            counts.record_skip(SKIP_REASON_SAME_PATH);
            continue;
        }

        planned_targets.insert(new_fs.clone());
        counts.succeeded += 1;
        map.insert(PlannedRename {
            op: PhysicalOp::Reencode,
            old_identity: asset.identity.clone(),
            new_identity,
            old_fs: asset.path.clone(),
            new_fs,
        });
    }

    PlanReport {
        map,
        counts,
        failures,
    }
}

/// Plan the relocate policy: each referenced asset moves into its owning
/// item's slug folder as `{slug}-{ordinal}`. Items are processed in stable
/// lexicographic slug order, and an asset claimed by an earlier item is
/// never re-planned.
pub fn plan_relocate(items: &[ItemReferences], scheme: &RefScheme) -> PlanReport {
    let mut ordered: Vec<&ItemReferences> = items.iter().collect();
    ordered.sort_by(|a, b| a.slug.cmp(&b.slug).then_with(|| a.id.cmp(&b.id)));

    let mut map = ConversionMap::new(scheme.clone());
    let mut counts = OutcomeCounts::default();
    let mut claimed: HashSet<MediaIdentity> = HashSet::new();

    for item in ordered {
        let mut ordinal = 0u32;
        for identity in &item.identities {
            if claimed.contains(identity) || map.claims(identity) {
                continue;
            }
            counts.processed += 1;

            if identity
                .tail()
                .starts_with(&format!("{}/", item.slug))
            {
                counts.record_skip(SKIP_REASON_ALREADY_IN_SLUG_FOLDER);
                claimed.insert(identity.clone());
                continue;
            }

            let file_name = identity.file_name();
            let Some((stem, ext)) = file_name.rsplit_once('.') else {
                counts.record_skip("missing_extension");
                claimed.insert(identity.clone());
                continue;
            };
            let original_suffix = if stem.to_ascii_lowercase().ends_with("_o") {
                "_o"
            } else {
                ""
            };

            ordinal += 1;
            let new_identity = MediaIdentity::new(
                identity.category(),
                format!("{slug}/{slug}-{ordinal}{original_suffix}.{ext}", slug = item.slug),
            );
            let old_fs = scheme.fs_path(identity);
            let new_fs = scheme.fs_path(&new_identity);

            if new_fs == old_fs {
                counts.record_skip(SKIP_REASON_SAME_PATH);
                claimed.insert(identity.clone());
                continue;
            }

            counts.succeeded += 1;
            claimed.insert(identity.clone());
            map.insert(PlannedRename {
                op: PhysicalOp::Move,
                old_identity: identity.clone(),
                new_identity,
                old_fs,
                new_fs,
            });
        }
    }

    PlanReport {
        map,
        counts,
        failures: Vec::new(),
    }
}

/// Keep a trailing `_o` token trailing: `a_o` + `_png` -> `a_png_o`.
fn append_before_original_suffix(stem: &str, suffix: &str) -> String {
    if let Some(trimmed) = stem
        .strip_suffix("_o")
        .or_else(|| stem.strip_suffix("_O"))
    {
        format!("{trimmed}{suffix}_o")
    } else {
        format!("{stem}{suffix}")
    }
}

#[derive(Debug, Serialize)]
struct PlanArtifact<'a> {
    created_at: String,
    policy: NamingPolicy,
    renames: usize,
    map: &'a ConversionMap,
}

/// Persist the plan snapshot before anything destructive happens, so an
/// interrupted run still leaves an inspectable record.
pub fn persist_plan(
    map: &ConversionMap,
    policy: NamingPolicy,
    log_dir: &Path,
) -> AppResult<PathBuf> {
    std::fs::create_dir_all(log_dir).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "plan_create_log_dir")
            .with_context("path", log_dir.display().to_string())
    })?;

    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let path = log_dir.join(format!("conversion_plan_{stamp}.json"));
    let artifact = PlanArtifact {
        created_at: Utc::now().to_rfc3339(),
        policy,
        renames: map.len(),
        map,
    };
    let serialized = serde_json::to_vec_pretty(&artifact)
        .map_err(|err| AppError::from(err).with_context("operation", "plan_encode"))?;
    write_atomic(&path, &serialized)
        .map_err(|err| err.with_context("operation", "plan_persist"))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::MediaCategory;
    use crate::inventory::Asset;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn scheme_at(root: &Path) -> RefScheme {
        RefScheme {
            site_origin: "https://host".into(),
            placeholder: "__GHOST_URL__".into(),
            images_root: root.join("images"),
            media_root: root.join("media"),
        }
    }

    fn asset(scheme: &RefScheme, tail: &str) -> Asset {
        let identity = MediaIdentity::new(MediaCategory::Images, tail);
        Asset {
            path: scheme.fs_path(&identity),
            identity,
        }
    }

    #[test]
    fn duplicate_group_members_encode_their_extension() {
        let dir = tempdir().unwrap();
        let scheme = scheme_at(dir.path());
        let a_png = asset(&scheme, "2024/a.png");
        let a_jpg = asset(&scheme, "2024/a.jpg");

        let mut duplicates = BTreeMap::new();
        duplicates.insert(
            "images/2024/a".to_string(),
            vec![a_png.path.clone(), a_jpg.path.clone()],
        );
        let inventory = Inventory {
            assets: vec![a_png, a_jpg],
            duplicates,
        };

        let report = plan_reencode(&inventory, &scheme, false);
        let targets: Vec<String> = report
            .map
            .renames()
            .iter()
            .map(|r| r.new_identity.to_string())
            .collect();
        assert_eq!(
            targets,
            vec!["images/2024/a_png.webp", "images/2024/a_jpg.webp"]
        );
    }

    #[test]
    fn trailing_original_token_stays_trailing() {
        let dir = tempdir().unwrap();
        let scheme = scheme_at(dir.path());
        let a = asset(&scheme, "2024/photo_o.png");
        let b = asset(&scheme, "2024/photo_o.jpg");

        let mut duplicates = BTreeMap::new();
        duplicates.insert(
            "images/2024/photo_o".to_string(),
            vec![a.path.clone(), b.path.clone()],
        );
        let inventory = Inventory {
            assets: vec![a, b],
            duplicates,
        };

        let report = plan_reencode(&inventory, &scheme, false);
        assert_eq!(
            report.map.renames()[0].new_identity.to_string(),
            "images/2024/photo_png_o.webp"
        );
    }

    #[test]
    fn occupied_target_gets_a_numeric_disambiguator() {
        let dir = tempdir().unwrap();
        let scheme = scheme_at(dir.path());
        let a = asset(&scheme, "2024/a.png");
        std::fs::create_dir_all(a.path.parent().unwrap()).unwrap();
        std::fs::write(scheme.images_root.join("2024/a.webp"), b"occupied").unwrap();

        let inventory = Inventory {
            assets: vec![a],
            duplicates: BTreeMap::new(),
        };
        let report = plan_reencode(&inventory, &scheme, false);
        assert_eq!(
            report.map.renames()[0].new_identity.to_string(),
            "images/2024/a-1.webp"
        );
    }

    #[test]
    fn map_entries_agree_across_representations() {
        let dir = tempdir().unwrap();
        let scheme = scheme_at(dir.path());
        let a = asset(&scheme, "2024/a.png");
        let inventory = Inventory {
            assets: vec![a],
            duplicates: BTreeMap::new(),
        };
        let report = plan_reencode(&inventory, &scheme, false);
        let map = &report.map;
        assert_eq!(map.entries().len(), 3);

        let decode = |value: &str| -> MediaIdentity {
            if value.starts_with("/content/") || value.starts_with("http") {
                canonicalize(value, &map.scheme).map(|p| p.identity).unwrap()
            } else {
                map.scheme.identity_for_fs(Path::new(value)).unwrap()
            }
        };

        let old = MediaIdentity::new(MediaCategory::Images, "2024/a.png");
        let mut resolved = std::collections::BTreeSet::new();
        for (key, value) in map.entries() {
            assert_eq!(decode(key), old);
            resolved.insert(decode(value).to_string());
        }
        assert_eq!(resolved.len(), 1, "all representations agree on the new identity");
    }

    #[test]
    fn relocate_assigns_ordinals_and_honors_first_writer() {
        let dir = tempdir().unwrap();
        let scheme = scheme_at(dir.path());
        let hero = MediaIdentity::new(MediaCategory::Images, "2024/hero.png");
        let shared = MediaIdentity::new(MediaCategory::Images, "2024/shared.png");
        let clip = MediaIdentity::new(MediaCategory::Media, "2024/clip.mp4");

        let items = vec![
            ItemReferences {
                id: "2".into(),
                slug: "zebra".into(),
                identities: vec![shared.clone()],
            },
            ItemReferences {
                id: "1".into(),
                slug: "alpha".into(),
                identities: vec![hero.clone(), shared.clone(), clip.clone(), hero.clone()],
            },
        ];

        let report = plan_relocate(&items, &scheme);
        let renames = report.map.renames();
        // alpha sorts first and claims the shared asset.
        assert_eq!(renames[0].old_identity, hero);
        assert_eq!(renames[0].new_identity.to_string(), "images/alpha/alpha-1.png");
        assert_eq!(renames[1].old_identity, shared);
        assert_eq!(
            renames[1].new_identity.to_string(),
            "images/alpha/alpha-2.png"
        );
        assert_eq!(renames[2].old_identity, clip);
        assert_eq!(renames[2].new_identity.to_string(), "media/alpha/alpha-3.mp4");
        assert_eq!(renames.len(), 3, "zebra does not re-plan the shared asset");
    }

    #[test]
    fn relocate_skips_assets_already_in_their_slug_folder() {
        let dir = tempdir().unwrap();
        let scheme = scheme_at(dir.path());
        let settled = MediaIdentity::new(MediaCategory::Images, "alpha/alpha-1.png");
        let items = vec![ItemReferences {
            id: "1".into(),
            slug: "alpha".into(),
            identities: vec![settled],
        }];
        let report = plan_relocate(&items, &scheme);
        assert!(report.map.is_empty());
        assert_eq!(
            report.counts.reasons.get(SKIP_REASON_ALREADY_IN_SLUG_FOLDER),
            Some(&1)
        );
    }

    #[test]
    fn resolve_supports_o_suffix_and_webp_extension_fallbacks() {
        let dir = tempdir().unwrap();
        let scheme = scheme_at(dir.path());
        let mut map = ConversionMap::new(scheme.clone());
        let old = MediaIdentity::new(MediaCategory::Images, "2024/a.png");
        let new = MediaIdentity::new(MediaCategory::Images, "2024/a_png.webp");
        map.insert(PlannedRename {
            op: PhysicalOp::Reencode,
            old_identity: old.clone(),
            new_identity: new.clone(),
            old_fs: scheme.fs_path(&old),
            new_fs: scheme.fs_path(&new),
        });

        // Exact hit.
        assert_eq!(map.resolve(&old), Some(new.clone()));
        // `_o` alias falls back onto the plain entry.
        let alias = MediaIdentity::new(MediaCategory::Images, "2024/a_o.png");
        assert_eq!(map.resolve(&alias), Some(new.clone()));
        // A stale `.webp` spelling retries original extensions.
        let stale = MediaIdentity::new(MediaCategory::Images, "2024/a.webp");
        assert_eq!(map.resolve(&stale), Some(new));
        // Never the reverse direction for `_o`.
        let mut reverse = ConversionMap::new(scheme);
        let old_o = MediaIdentity::new(MediaCategory::Images, "2024/b_o.png");
        let new_o = MediaIdentity::new(MediaCategory::Images, "2024/b_o.webp");
        reverse.insert(PlannedRename {
            op: PhysicalOp::Reencode,
            old_identity: old_o.clone(),
            new_identity: new_o,
            old_fs: reverse.scheme.fs_path(&old_o),
            new_fs: reverse.scheme.fs_path(&old_o),
        });
        let plain_b = MediaIdentity::new(MediaCategory::Images, "2024/b.png");
        assert_eq!(reverse.resolve(&plain_b), None);
    }
}
