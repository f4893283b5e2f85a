//! Content rewriting.
//!
//! HTML bodies stream through lol_html, which leaves every untouched byte
//! exactly as it was; that is what lets an unchanged item come back
//! byte-identical. Flat fields (feature image, site settings) go through the
//! same reference lookup.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use lol_html::{element, rewrite_str, RewriteStrSettings};
use percent_encoding::percent_decode_str;

use crate::canonical::{canonicalize, reconstruct};
use crate::ledger::ChangeRecord;
use crate::planner::ConversionMap;
use crate::{AppError, AppResult};

const SRC_TAGS: &[&str] = &["img", "video", "audio", "source"];
const SRCSET_TAGS: &[&str] = &["img", "source"];

/// Result of one item-body pass.
#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub html: String,
    pub changed: bool,
    pub changes: Vec<ChangeRecord>,
}

/// Rewrite a single reference through the map, preserving the original's
/// prefix and size segment. `None` means the reference does not match.
pub fn rewrite_reference(raw: &str, map: &ConversionMap) -> Option<String> {
    let parts = canonicalize(raw, &map.scheme)?;
    let new_identity = map.resolve(&parts.identity)?;
    let rebuilt = reconstruct(&parts, &new_identity);
    if rebuilt == raw {
        None
    } else {
        Some(rebuilt)
    }
}

/// Rewrite a `srcset` list. Entries split on commas, each into (url,
/// descriptor) on the last space; descriptors and order are preserved and
/// non-matching entries are left alone. `None` when nothing matched.
pub fn rewrite_srcset(raw: &str, map: &ConversionMap) -> Option<String> {
    let mut any_changed = false;
    let mut parts = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (url, descriptor) = match entry.rsplit_once(' ') {
            Some((url, descriptor)) => (url.trim(), Some(descriptor.trim())),
            None => (entry, None),
        };
        let rewritten = rewrite_reference(url, map);
        if rewritten.is_some() {
            any_changed = true;
        }
        let url = rewritten.unwrap_or_else(|| url.to_string());
        match descriptor {
            Some(descriptor) => parts.push(format!("{url} {descriptor}")),
            None => parts.push(url),
        }
    }
    if any_changed {
        Some(parts.join(", "))
    } else {
        None
    }
}

/// Rewrite every media reference in an HTML body.
///
/// `scope` tags the produced change records with the owning item. Unchanged
/// input comes back byte-identical with `changed == false`.
pub fn rewrite_html(html: &str, map: &ConversionMap, scope: &str) -> AppResult<RewriteOutcome> {
    let changes: Rc<RefCell<Vec<ChangeRecord>>> = Rc::new(RefCell::new(Vec::new()));
    let changed = Rc::new(Cell::new(false));

    let mut handlers = Vec::new();
    for tag in SRC_TAGS {
        let changes = changes.clone();
        let changed = changed.clone();
        handlers.push(element!(format!("{tag}[src]"), move |el| {
            if let Some(old) = el.get_attribute("src") {
                if let Some(new) = rewrite_reference(&old, map) {
                    el.set_attribute("src", &new)?;
                    changes
                        .borrow_mut()
                        .push(ChangeRecord::field_rewrite(scope, "html", &old, &new));
                    changed.set(true);
                }
            }
            Ok(())
        }));
    }
    for tag in SRCSET_TAGS {
        let changes = changes.clone();
        let changed = changed.clone();
        handlers.push(element!(format!("{tag}[srcset]"), move |el| {
            if let Some(old) = el.get_attribute("srcset") {
                if let Some(new) = rewrite_srcset(&old, map) {
                    el.set_attribute("srcset", &new)?;
                    changes
                        .borrow_mut()
                        .push(ChangeRecord::field_rewrite(scope, "html", &old, &new));
                    changed.set(true);
                }
            }
            Ok(())
        }));
    }

    let output = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| {
        AppError::new("REWRITE/PARSE", "HTML body could not be rewritten.")
            .with_context("scope", scope.to_string())
            .with_context("error", err.to_string())
    })?;

    if !changed.get() {
        // No handler fired; hand the caller back the exact input.
        return Ok(RewriteOutcome {
            html: html.to_string(),
            changed: false,
            changes: Vec::new(),
        });
    }

    let changes = Rc::try_unwrap(changes)
        .map(|cell| cell.into_inner())
        .unwrap_or_default();
    Ok(RewriteOutcome {
        html: output,
        changed: true,
        changes,
    })
}

/// Collect every media reference in an HTML body, in document order: per
/// element, `src` before its `srcset` entries.
pub fn collect_html_references(html: &str) -> AppResult<Vec<String>> {
    let found: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let mut handlers = Vec::new();
    for tag in SRC_TAGS {
        let found = found.clone();
        handlers.push(element!(format!("{tag}"), move |el| {
            if let Some(src) = el.get_attribute("src") {
                found.borrow_mut().push(src);
            }
            if let Some(srcset) = el.get_attribute("srcset") {
                for entry in srcset.split(',') {
                    let entry = entry.trim();
                    if entry.is_empty() {
                        continue;
                    }
                    let url = match entry.rsplit_once(' ') {
                        Some((url, _)) => url.trim(),
                        None => entry,
                    };
                    found.borrow_mut().push(url.to_string());
                }
            }
            Ok(())
        }));
    }

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| {
        AppError::new("REWRITE/PARSE", "HTML body could not be scanned.")
            .with_context("error", err.to_string())
    })?;

    Ok(Rc::try_unwrap(found)
        .map(|cell| cell.into_inner())
        .unwrap_or_default())
}

/// Derive `alt` text for images that have none (or, with `force`, replace
/// what is there): `image-{filename}` from the `src` basename.
pub fn fill_alt_text(html: &str, force: bool, scope: &str) -> AppResult<RewriteOutcome> {
    let changes: Rc<RefCell<Vec<ChangeRecord>>> = Rc::new(RefCell::new(Vec::new()));
    let changed = Rc::new(Cell::new(false));

    let handler = {
        let changes = changes.clone();
        let changed = changed.clone();
        element!("img", move |el| {
            let old_alt = el.get_attribute("alt").unwrap_or_default();
            if !force && !old_alt.trim().is_empty() {
                return Ok(());
            }
            let Some(src) = el.get_attribute("src") else {
                return Ok(());
            };
            let Some(filename) = reference_basename(&src) else {
                return Ok(());
            };
            let new_alt = format!("image-{filename}");
            if new_alt == old_alt {
                return Ok(());
            }
            el.set_attribute("alt", &new_alt)?;
            changes.borrow_mut().push(ChangeRecord::field_rewrite(
                scope,
                format!("alt:{src}"),
                &old_alt,
                &new_alt,
            ));
            changed.set(true);
            Ok(())
        })
    };

    let output = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![handler],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| {
        AppError::new("REWRITE/PARSE", "HTML body could not be rewritten.")
            .with_context("scope", scope.to_string())
            .with_context("error", err.to_string())
    })?;

    if !changed.get() {
        return Ok(RewriteOutcome {
            html: html.to_string(),
            changed: false,
            changes: Vec::new(),
        });
    }

    let changes = Rc::try_unwrap(changes)
        .map(|cell| cell.into_inner())
        .unwrap_or_default();
    Ok(RewriteOutcome {
        html: output,
        changed: true,
        changes,
    })
}

/// Put an image's `alt` back to a previous value, matched by `src` anchor and
/// the currently expected text. Used on the restore path.
pub fn restore_alt_text(
    html: &str,
    anchor_src: &str,
    from_alt: &str,
    to_alt: &str,
) -> AppResult<(String, bool)> {
    let changed = Rc::new(Cell::new(false));

    let handler = {
        let changed = changed.clone();
        element!("img", move |el| {
            if el.get_attribute("src").as_deref() != Some(anchor_src) {
                return Ok(());
            }
            if el.get_attribute("alt").unwrap_or_default() != from_alt {
                return Ok(());
            }
            if to_alt.is_empty() {
                el.remove_attribute("alt");
            } else {
                el.set_attribute("alt", to_alt)?;
            }
            changed.set(true);
            Ok(())
        })
    };

    let output = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![handler],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| {
        AppError::new("REWRITE/PARSE", "HTML body could not be rewritten.")
            .with_context("error", err.to_string())
    })?;

    if changed.get() {
        Ok((output, true))
    } else {
        Ok((html.to_string(), false))
    }
}

fn reference_basename(reference: &str) -> Option<String> {
    let path = reference
        .split(['?', '#'])
        .next()
        .unwrap_or(reference);
    let name = path.rsplit('/').next()?;
    if name.is_empty() {
        return None;
    }
    percent_decode_str(name)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}
