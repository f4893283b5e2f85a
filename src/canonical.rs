//! Reference canonicalization.
//!
//! Content references arrive in many equivalent spellings: filesystem paths,
//! relative URLs, absolute URLs, size-variant URLs (`size/w600/`), format
//! variants (`format/webp/`), percent-encoded paths, and placeholder-prefixed
//! URLs. Everything in this module is pure: it reduces any spelling to a
//! [`MediaIdentity`] and reconstructs a concrete spelling from an identity
//! plus the decomposed template of the original reference.

use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::EngineConfig;

static SIZE_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"size/w(\d+)/").expect("size regex"));
static FORMAT_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"format/[A-Za-z0-9]+/").expect("format regex"));

/// Extensions the convert policy will re-encode.
pub const CONVERTIBLE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tiff"];

/// Trial order for matching an already-converted `.webp` reference back to a
/// map keyed by the pre-conversion file.
pub const ORIGINAL_EXTENSION_TRIALS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tiff"];

const ICON_EXTENSION: &str = "ico";
const CONTENT_MOUNT: &str = "/content/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaCategory {
    Images,
    Media,
}

impl MediaCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            MediaCategory::Images => "images",
            MediaCategory::Media => "media",
        }
    }

    pub const fn url_prefix(self) -> &'static str {
        match self {
            MediaCategory::Images => "/content/images",
            MediaCategory::Media => "/content/media",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "images" => Some(MediaCategory::Images),
            "media" => Some(MediaCategory::Media),
            _ => None,
        }
    }
}

impl fmt::Display for MediaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical, representation-independent form of a media reference.
///
/// Two references denote the same underlying asset iff their identities are
/// equal; the `_o` original-suffix alias is a lookup fallback, never part of
/// the identity itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MediaIdentity {
    category: MediaCategory,
    tail: String,
}

impl MediaIdentity {
    pub fn new(category: MediaCategory, tail: impl Into<String>) -> Self {
        let tail = tail.into();
        let tail = tail.trim_matches('/').to_string();
        MediaIdentity { category, tail }
    }

    pub fn category(&self) -> MediaCategory {
        self.category
    }

    /// Path below the category root, e.g. `2024/05/photo.png`.
    pub fn tail(&self) -> &str {
        &self.tail
    }

    /// Site-relative URL form, e.g. `/content/images/2024/05/photo.png`.
    pub fn relative_url(&self) -> String {
        format!("{}/{}", self.category.url_prefix(), self.tail)
    }

    pub fn file_name(&self) -> &str {
        self.tail.rsplit('/').next().unwrap_or(&self.tail)
    }

    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
            _ => None,
        }
    }

    /// Identity string without its extension; duplicate-name collision key.
    pub fn without_extension(&self) -> String {
        let full = self.to_string();
        match self.extension() {
            Some(ext) => full[..full.len() - ext.len() - 1].to_string(),
            None => full,
        }
    }

    /// Sibling identity with the extension replaced.
    pub fn with_extension(&self, ext: &str) -> MediaIdentity {
        let stem = match self.extension() {
            Some(old) => &self.tail[..self.tail.len() - old.len() - 1],
            None => self.tail.as_str(),
        };
        MediaIdentity::new(self.category, format!("{stem}.{ext}"))
    }

    /// The `_o`-less sibling of a filename carrying the original-suffix
    /// token, e.g. `a_o.png` -> `a.png`. Returns `None` when the token is
    /// absent. Directional: there is no operation that adds the suffix.
    pub fn strip_original_suffix(&self) -> Option<MediaIdentity> {
        let ext = self.extension()?;
        let stem_end = self.tail.len() - ext.len() - 1;
        let stem = &self.tail[..stem_end];
        if stem.to_ascii_lowercase().ends_with("_o") {
            let trimmed = &stem[..stem.len() - 2];
            if trimmed.is_empty() || trimmed.ends_with('/') {
                return None;
            }
            Some(MediaIdentity::new(
                self.category,
                format!("{trimmed}.{ext}"),
            ))
        } else {
            None
        }
    }
}

impl fmt::Display for MediaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category.as_str(), self.tail)
    }
}

impl From<MediaIdentity> for String {
    fn from(id: MediaIdentity) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for MediaIdentity {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (head, tail) = value
            .split_once('/')
            .ok_or_else(|| format!("identity has no category: {value}"))?;
        let category = MediaCategory::from_segment(head)
            .ok_or_else(|| format!("unknown media category: {head}"))?;
        if tail.is_empty() {
            return Err(format!("identity has an empty tail: {value}"));
        }
        Ok(MediaIdentity::new(category, tail))
    }
}

/// How a concrete reference was rooted before its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantPrefix {
    /// Site-relative, starting at `/content/...`.
    Relative,
    /// The CMS-internal URL placeholder, carried verbatim.
    Placeholder(String),
    /// Scheme + host (+ port), e.g. `https://blog.example.com`.
    Absolute(String),
}

/// Lossless decomposition of one concrete reference spelling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantParts {
    pub prefix: VariantPrefix,
    /// Width of a `size/w<N>/` segment, when the variant carried one.
    pub size: Option<u32>,
    pub identity: MediaIdentity,
}

/// The run's view of how identities map to concrete representations:
/// site origin, placeholder literal, and per-category filesystem roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefScheme {
    pub site_origin: String,
    pub placeholder: String,
    pub images_root: PathBuf,
    pub media_root: PathBuf,
}

impl RefScheme {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        RefScheme {
            site_origin: cfg.site_url.trim_end_matches('/').to_string(),
            placeholder: cfg.url_placeholder.clone(),
            images_root: cfg.images_root(),
            media_root: cfg.media_root(),
        }
    }

    pub fn root_for(&self, category: MediaCategory) -> &Path {
        match category {
            MediaCategory::Images => &self.images_root,
            MediaCategory::Media => &self.media_root,
        }
    }

    pub fn fs_path(&self, id: &MediaIdentity) -> PathBuf {
        self.root_for(id.category()).join(id.tail())
    }

    pub fn fs_string(&self, id: &MediaIdentity) -> String {
        self.fs_path(id).to_string_lossy().replace('\\', "/")
    }

    pub fn absolute_url(&self, id: &MediaIdentity) -> String {
        format!("{}{}", self.site_origin, id.relative_url())
    }

    /// Identity of an on-disk file under one of the category roots.
    ///
    /// Size/format variant directories normalize away exactly as they do for
    /// URLs, so a generated `size/w600/...` file resolves to its base asset.
    pub fn identity_for_fs(&self, path: &Path) -> Option<MediaIdentity> {
        for category in [MediaCategory::Images, MediaCategory::Media] {
            if let Ok(rel) = path.strip_prefix(self.root_for(category)) {
                let tail = rel.to_string_lossy().replace('\\', "/");
                return identity_from_tail(category, &tail).map(|(id, _)| id);
            }
        }
        None
    }
}

/// Reduce any reference spelling to its decomposed parts.
///
/// Returns `None` for references outside the content categories, references
/// without an extension, and icon references; callers must treat those as
/// never matching and never convertible.
pub fn canonicalize(raw: &str, scheme: &RefScheme) -> Option<VariantParts> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let placeholder_rest = (!scheme.placeholder.is_empty())
        .then(|| raw.strip_prefix(scheme.placeholder.as_str()))
        .flatten();
    let (prefix, rest) = if let Some(stripped) = placeholder_rest {
        (
            VariantPrefix::Placeholder(scheme.placeholder.clone()),
            strip_query(stripped).to_string(),
        )
    } else if raw.starts_with("http://") || raw.starts_with("https://") {
        let parsed = Url::parse(raw).ok()?;
        let origin = parsed.origin().ascii_serialization();
        (VariantPrefix::Absolute(origin), parsed.path().to_string())
    } else {
        (VariantPrefix::Relative, strip_query(raw).to_string())
    };

    let decoded = percent_decode_str(&rest).decode_utf8().ok()?;
    let path = decoded.as_ref();

    let tail = path.strip_prefix(CONTENT_MOUNT)?;
    let (segment, remainder) = tail.split_once('/')?;
    let category = MediaCategory::from_segment(segment)?;

    let (identity, size) = identity_from_tail(category, remainder)?;
    Some(VariantParts {
        prefix,
        size,
        identity,
    })
}

/// Recompose a concrete spelling: the new identity rendered with the
/// template's prefix and size segment. Format segments are never re-emitted;
/// a converted file serves its format natively.
pub fn reconstruct(template: &VariantParts, identity: &MediaIdentity) -> String {
    let mut path = String::from(identity.category().url_prefix());
    if let Some(width) = template.size {
        path.push_str("/size/w");
        path.push_str(&width.to_string());
    }
    path.push('/');
    path.push_str(identity.tail());

    match &template.prefix {
        VariantPrefix::Relative => path,
        VariantPrefix::Placeholder(placeholder) => format!("{placeholder}{path}"),
        VariantPrefix::Absolute(origin) => format!("{origin}{path}"),
    }
}

/// True when the extension is one the convert policy re-encodes.
pub fn is_convertible_extension(ext: &str) -> bool {
    CONVERTIBLE_EXTENSIONS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(ext))
}

fn strip_query(raw: &str) -> &str {
    let end = raw.find(['?', '#']).unwrap_or(raw.len());
    &raw[..end]
}

fn identity_from_tail(category: MediaCategory, tail: &str) -> Option<(MediaIdentity, Option<u32>)> {
    let size = SIZE_SEGMENT
        .captures(tail)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok());

    let stripped = SIZE_SEGMENT.replace_all(tail, "");
    let stripped = FORMAT_SEGMENT.replace_all(&stripped, "");
    let mut normalized = stripped.into_owned();
    while normalized.contains("//") {
        normalized = normalized.replace("//", "/");
    }
    let normalized = normalized.trim_matches('/');
    if normalized.is_empty() {
        return None;
    }

    let identity = MediaIdentity::new(category, normalized);
    match identity.extension() {
        None => None,
        Some(ext) if ext.eq_ignore_ascii_case(ICON_EXTENSION) => None,
        Some(_) => Some((identity, size)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> RefScheme {
        RefScheme {
            site_origin: "https://blog.example.com".into(),
            placeholder: "__GHOST_URL__".into(),
            images_root: PathBuf::from("/var/lib/ghost/content/images"),
            media_root: PathBuf::from("/var/lib/ghost/content/media"),
        }
    }

    #[test]
    fn canonicalizes_relative_reference() {
        let parts = canonicalize("/content/images/2024/05/photo.png", &scheme()).unwrap();
        assert_eq!(parts.prefix, VariantPrefix::Relative);
        assert_eq!(parts.size, None);
        assert_eq!(parts.identity.to_string(), "images/2024/05/photo.png");
    }

    #[test]
    fn strips_size_and_format_segments_in_either_order() {
        let a = canonicalize(
            "/content/images/size/w600/format/webp/2024/photo.png",
            &scheme(),
        )
        .unwrap();
        let b = canonicalize(
            "/content/images/format/webp/size/w600/2024/photo.png",
            &scheme(),
        )
        .unwrap();
        assert_eq!(a.identity, b.identity);
        assert_eq!(a.size, Some(600));
        assert_eq!(b.size, Some(600));
        assert_eq!(a.identity.to_string(), "images/2024/photo.png");
    }

    #[test]
    fn absolute_and_placeholder_prefixes_round_trip() {
        let s = scheme();
        let abs =
            canonicalize("https://blog.example.com/content/images/2024/a.png", &s).unwrap();
        assert_eq!(
            abs.prefix,
            VariantPrefix::Absolute("https://blog.example.com".into())
        );
        assert_eq!(
            reconstruct(&abs, &abs.identity),
            "https://blog.example.com/content/images/2024/a.png"
        );

        let ph = canonicalize("__GHOST_URL__/content/media/clips/intro.mp4", &s).unwrap();
        assert_eq!(ph.prefix, VariantPrefix::Placeholder("__GHOST_URL__".into()));
        assert_eq!(
            reconstruct(&ph, &ph.identity),
            "__GHOST_URL__/content/media/clips/intro.mp4"
        );
    }

    #[test]
    fn size_segment_is_reinserted_on_reconstruction() {
        let s = scheme();
        let parts =
            canonicalize("https://host/content/images/size/w600/2024/a.png", &s).unwrap();
        let new_id = MediaIdentity::new(MediaCategory::Images, "2024/a_png.webp");
        assert_eq!(
            reconstruct(&parts, &new_id),
            "https://host/content/images/size/w600/2024/a_png.webp"
        );
    }

    #[test]
    fn percent_encoding_differences_collapse() {
        let s = scheme();
        let plain = canonicalize("/content/images/2024/my photo.png", &s).unwrap();
        let encoded = canonicalize("/content/images/2024/my%20photo.png", &s).unwrap();
        assert_eq!(plain.identity, encoded.identity);
    }

    #[test]
    fn excludes_non_content_icon_and_extensionless_references() {
        let s = scheme();
        assert!(canonicalize("/other/images/2024/a.png", &s).is_none());
        assert!(canonicalize("/content/images/2024/favicon.ico", &s).is_none());
        assert!(canonicalize("/content/images/2024/README", &s).is_none());
        assert!(canonicalize("https://elsewhere.example/about", &s).is_none());
    }

    #[test]
    fn original_suffix_strips_directionally() {
        let id = MediaIdentity::new(MediaCategory::Images, "2024/a_o.png");
        assert_eq!(
            id.strip_original_suffix().unwrap().to_string(),
            "images/2024/a.png"
        );

        let plain = MediaIdentity::new(MediaCategory::Images, "2024/a.png");
        assert!(plain.strip_original_suffix().is_none());
    }

    #[test]
    fn identity_for_fs_normalizes_generated_variants() {
        let s = scheme();
        let base = s
            .identity_for_fs(Path::new(
                "/var/lib/ghost/content/images/size/w300/2024/b.png",
            ))
            .unwrap();
        assert_eq!(base.to_string(), "images/2024/b.png");
    }

    #[test]
    fn canonicalize_reconstruct_canonicalize_is_idempotent() {
        let s = scheme();
        for raw in [
            "/content/images/2024/a.png",
            "https://blog.example.com/content/images/size/w1000/2024/a.png",
            "__GHOST_URL__/content/media/size/w300/clips/a%20b.mp4",
        ] {
            let first = canonicalize(raw, &s).unwrap();
            let rebuilt = reconstruct(&first, &first.identity);
            let second = canonicalize(&rebuilt, &s).unwrap();
            assert_eq!(first.identity, second.identity);
            assert_eq!(first.size, second.size);
        }
    }

    #[test]
    fn with_extension_swaps_only_the_extension() {
        let id = MediaIdentity::new(MediaCategory::Images, "2024/a.webp");
        assert_eq!(id.with_extension("png").to_string(), "images/2024/a.png");
        assert_eq!(id.without_extension(), "images/2024/a");
    }
}
