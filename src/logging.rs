//! Diagnostic logging. Free-form and never load-bearing: restore depends on
//! the change ledger alone.

use std::path::Path;

use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

/// Install the tracing subscriber. `MEDIAMEND_LOG` controls the filter
/// (standard env-filter syntax); the default is `info`.
pub fn init() {
    let filter =
        EnvFilter::try_from_env("MEDIAMEND_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .ok();
}

/// Paths in log events are hashed, not printed.
pub fn hash_path(p: &Path) -> String {
    let mut h = Sha256::new();
    h.update(p.as_os_str().to_string_lossy().as_bytes());
    format!("{:x}", h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_hex() {
        let a = hash_path(Path::new("/content/images/2024/a.png"));
        let b = hash_path(Path::new("/content/images/2024/a.png"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let other = hash_path(Path::new("/content/images/2024/b.png"));
        assert_ne!(a, other);
    }
}
