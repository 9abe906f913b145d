use std::{
    env,
    path::{Path, PathBuf},
};

pub const DEFAULT_SOURCE_DIR: &str = "test_photos";

/// Resolves the directory archives are built from.
#[derive(Clone, Debug)]
pub struct Locator {
    configured: PathBuf,
}

impl Locator {
    pub fn new<P: Into<PathBuf>>(configured: P) -> Self {
        Self {
            configured: configured.into(),
        }
    }

    /// Returns the configured directory if it exists, otherwise the default one next to the
    /// executable. Never fails: a missing fallback is reported later as a missing archive.
    pub async fn resolve(&self) -> PathBuf {
        let is_dir = tokio::fs::metadata(&self.configured)
            .await
            .map(|md| md.is_dir())
            .unwrap_or(false);
        if is_dir {
            return absolute(&self.configured);
        }
        default_dir()
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(err) => {
            log::warn!("Cannot determine working directory: {}", err);
            path.to_path_buf()
        }
    }
}

fn default_dir() -> PathBuf {
    let root = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    match root {
        Some(root) => root.join(DEFAULT_SOURCE_DIR),
        None => absolute(Path::new(DEFAULT_SOURCE_DIR)),
    }
}
