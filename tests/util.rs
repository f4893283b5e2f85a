#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::path::{Path, PathBuf};

use image::{ImageBuffer, Rgb};
use tempfile::TempDir;

use mediamend::canonical::RefScheme;
use mediamend::config::EngineConfig;
use mediamend::store::{ContentItem, JsonContentStore, SiteSettings};

pub struct Fixture {
    pub root: TempDir,
    pub cfg: EngineConfig,
    pub store_path: PathBuf,
}

impl Fixture {
    pub fn scheme(&self) -> RefScheme {
        RefScheme::from_config(&self.cfg)
    }

    pub fn images_root(&self) -> PathBuf {
        self.cfg.images_root()
    }

    pub fn media_root(&self) -> PathBuf {
        self.cfg.media_root()
    }

    pub fn store(
        &self,
        items: Vec<ContentItem>,
        settings: SiteSettings,
    ) -> JsonContentStore {
        JsonContentStore::create(&self.store_path, items, settings).expect("create store")
    }
}

pub fn fixture() -> Fixture {
    let root = TempDir::new().expect("tempdir");
    let content_root = root.path().join("content");
    std::fs::create_dir_all(content_root.join("images")).unwrap();
    std::fs::create_dir_all(content_root.join("media")).unwrap();

    let cfg = EngineConfig {
        site_url: "https://blog.example.com".into(),
        content_root,
        images_dir: None,
        media_dir: None,
        log_dir: root.path().join("logs"),
        webp_quality: 80,
        workers: 2,
        url_placeholder: "__GHOST_URL__".into(),
    };
    let store_path = root.path().join("documents.json");

    Fixture {
        root,
        cfg,
        store_path,
    }
}

/// A tiny but real PNG the executor can decode.
pub fn write_png(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_fn(8, 8, |x, y| Rgb([x as u8 * 30, y as u8 * 30, 200]));
    img.save(path).unwrap();
}

pub fn write_jpeg(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_fn(8, 8, |x, y| Rgb([200, x as u8 * 30, y as u8 * 30]));
    img.save(path).unwrap();
}

pub fn write_bytes(path: &Path, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

pub fn item(id: &str, slug: &str, html: &str, feature_image: Option<&str>) -> ContentItem {
    ContentItem {
        id: id.into(),
        slug: slug.into(),
        status: Some("published".into()),
        html: html.into(),
        feature_image: feature_image.map(|s| s.into()),
    }
}
