//! The content-store seam.
//!
//! The engine never owns documents: it lists them, rewrites references, and
//! hands them back. A real deployment adapts its CMS behind [`ContentStore`];
//! the bundled [`JsonContentStore`] backs the CLI and the test suites with a
//! single JSON documents file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsops::write_atomic;

/// An externally-owned document: HTML body plus flat reference fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_image: Option<String>,
}

/// Site-wide flat reference fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl SiteSettings {
    /// The rewritable fields as (name, value) pairs.
    pub fn fields(&self) -> [(&'static str, Option<&String>); 3] {
        [
            ("logo", self.logo.as_ref()),
            ("cover_image", self.cover_image.as_ref()),
            ("icon", self.icon.as_ref()),
        ]
    }

    pub fn set_field(&mut self, name: &str, value: String) {
        match name {
            "logo" => self.logo = Some(value),
            "cover_image" => self.cover_image = Some(value),
            "icon" => self.icon = Some(value),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    Published,
}

impl StatusFilter {
    fn matches(self, item: &ContentItem) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Published => {
                matches!(item.status.as_deref(), Some("published"))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("store payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("item not found: {0}")]
    NotFound(String),
}

/// What the engine requires of a content store. Item identifiers must be
/// stable across a list-then-update sequence within one run.
pub trait ContentStore {
    fn list_items(&self, filter: StatusFilter) -> Result<Vec<ContentItem>, StoreError>;
    fn update_item(&mut self, item: &ContentItem) -> Result<(), StoreError>;
    fn settings(&self) -> Result<SiteSettings, StoreError>;
    fn update_settings(&mut self, settings: &SiteSettings) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Documents {
    #[serde(default)]
    items: Vec<ContentItem>,
    #[serde(default)]
    settings: SiteSettings,
}

/// File-backed store: one JSON document holding every item plus settings,
/// rewritten atomically on every update.
#[derive(Debug)]
pub struct JsonContentStore {
    path: PathBuf,
    documents: Documents,
}

impl JsonContentStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let data = fs::read(path)?;
        let documents = serde_json::from_slice(&data)?;
        Ok(JsonContentStore {
            path: path.to_path_buf(),
            documents,
        })
    }

    /// Create a store file with the given items; used by tests and fixtures.
    pub fn create(
        path: &Path,
        items: Vec<ContentItem>,
        settings: SiteSettings,
    ) -> Result<Self, StoreError> {
        let mut store = JsonContentStore {
            path: path.to_path_buf(),
            documents: Documents { items, settings },
        };
        store.persist()?;
        Ok(store)
    }

    fn persist(&mut self) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec_pretty(&self.documents)?;
        write_atomic(&self.path, &serialized)
            .map_err(|err| StoreError::Io(std::io::Error::other(err.to_string())))
    }
}

impl ContentStore for JsonContentStore {
    fn list_items(&self, filter: StatusFilter) -> Result<Vec<ContentItem>, StoreError> {
        Ok(self
            .documents
            .items
            .iter()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect())
    }

    fn update_item(&mut self, item: &ContentItem) -> Result<(), StoreError> {
        let slot = self
            .documents
            .items
            .iter_mut()
            .find(|candidate| candidate.id == item.id)
            .ok_or_else(|| StoreError::NotFound(item.id.clone()))?;
        *slot = item.clone();
        self.persist()
    }

    fn settings(&self) -> Result<SiteSettings, StoreError> {
        Ok(self.documents.settings.clone())
    }

    fn update_settings(&mut self, settings: &SiteSettings) -> Result<(), StoreError> {
        self.documents.settings = settings.clone();
        self.persist()
    }
}
