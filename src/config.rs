//! Engine configuration.
//!
//! One immutable value loaded up front and passed by reference to every
//! component; nothing here is process-global.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{AppError, AppResult};

pub const DEFAULT_URL_PLACEHOLDER: &str = "__GHOST_URL__";
const DEFAULT_WEBP_QUALITY: u8 = 80;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Public site origin, e.g. `https://blog.example.com`.
    pub site_url: String,
    /// Root of the CMS content tree (the directory holding `images/` and `media/`).
    pub content_root: PathBuf,
    /// Explicit images directory; defaults to `{content_root}/images`.
    pub images_dir: Option<PathBuf>,
    /// Explicit media directory; defaults to `{content_root}/media`.
    pub media_dir: Option<PathBuf>,
    /// Where plans, ledgers, and inventory listings are written.
    pub log_dir: PathBuf,
    /// Lossy WebP quality, 0..=100.
    pub webp_quality: u8,
    /// Worker pool size for physical transforms. 0 means "number of cores".
    pub workers: usize,
    /// CMS-internal URL placeholder stripped before path inspection.
    pub url_placeholder: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            site_url: String::new(),
            content_root: PathBuf::new(),
            images_dir: None,
            media_dir: None,
            log_dir: default_log_dir(),
            webp_quality: DEFAULT_WEBP_QUALITY,
            workers: 0,
            url_placeholder: DEFAULT_URL_PLACEHOLDER.to_string(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|base| base.join("mediamend").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

impl EngineConfig {
    /// Load from an optional JSON file, then apply `MEDIAMEND_*` environment
    /// overrides, then validate.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut config = match path {
            Some(path) => {
                let data = fs::read(path).map_err(|err| {
                    AppError::from(err)
                        .with_context("operation", "config_read")
                        .with_context("path", path.display().to_string())
                })?;
                serde_json::from_slice::<EngineConfig>(&data).map_err(|err| {
                    AppError::from(err)
                        .with_context("operation", "config_decode")
                        .with_context("path", path.display().to_string())
                })?
            }
            None => EngineConfig::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> AppResult<()> {
        if let Ok(value) = env::var("MEDIAMEND_SITE_URL") {
            self.site_url = value;
        }
        if let Ok(value) = env::var("MEDIAMEND_CONTENT_ROOT") {
            self.content_root = PathBuf::from(value);
        }
        if let Ok(value) = env::var("MEDIAMEND_LOG_DIR") {
            self.log_dir = PathBuf::from(value);
        }
        if let Ok(value) = env::var("MEDIAMEND_QUALITY") {
            self.webp_quality = value.parse().map_err(|_| {
                AppError::new("CONFIG/QUALITY", "MEDIAMEND_QUALITY is not a number in 0..=100.")
                    .with_context("value", value.clone())
            })?;
        }
        if let Ok(value) = env::var("MEDIAMEND_WORKERS") {
            self.workers = value.parse().map_err(|_| {
                AppError::new("CONFIG/WORKERS", "MEDIAMEND_WORKERS is not a number.")
                    .with_context("value", value.clone())
            })?;
        }
        if let Ok(value) = env::var("MEDIAMEND_URL_PLACEHOLDER") {
            self.url_placeholder = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.site_url.is_empty() {
            return Err(AppError::new(
                "CONFIG/SITE_URL",
                "site_url is required (e.g. https://blog.example.com).",
            ));
        }
        let parsed = Url::parse(&self.site_url).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "config_site_url")
                .with_context("value", self.site_url.clone())
        })?;
        if parsed.host_str().is_none() {
            return Err(AppError::new(
                "CONFIG/SITE_URL",
                "site_url must carry a host.",
            )
            .with_context("value", self.site_url.clone()));
        }
        if self.content_root.as_os_str().is_empty() {
            return Err(AppError::new(
                "CONFIG/CONTENT_ROOT",
                "content_root is required.",
            ));
        }
        if self.webp_quality > 100 {
            return Err(AppError::new(
                "CONFIG/QUALITY",
                "webp_quality must be within 0..=100.",
            )
            .with_context("value", self.webp_quality.to_string()));
        }
        Ok(())
    }

    /// Structural preflight before a mutating run: asset roots must exist.
    pub fn validate_roots(&self) -> AppResult<()> {
        let images = self.images_root();
        if !images.is_dir() {
            return Err(AppError::new(
                "CONFIG/IMAGES_ROOT",
                "Images directory does not exist.",
            )
            .with_context("path", images.display().to_string()));
        }
        Ok(())
    }

    pub fn images_root(&self) -> PathBuf {
        self.images_dir
            .clone()
            .unwrap_or_else(|| self.content_root.join("images"))
    }

    pub fn media_root(&self) -> PathBuf {
        self.media_dir
            .clone()
            .unwrap_or_else(|| self.content_root.join("media"))
    }

    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
