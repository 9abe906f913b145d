use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use tempfile::TempDir;

use super::{ArchiveConfig, Bundler, Locator};

/// Writes a local file header signature followed by 64KiB of padding.
pub const ZIP_SCRIPT: &str = r"printf 'PK\003\004'; head -c 65536 /dev/zero";

/// Temporary source directory holding albums.
pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("photos")).unwrap();
        Self { dir }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("photos")
    }

    pub fn album(&self, name: &str) -> PathBuf {
        let path = self.root().join(name);
        fs::create_dir(&path).unwrap();
        fs::write(path.join("IMG_0001.jpg"), b"\xff\xd8\xff\xe0 not really a jpeg").unwrap();
        path
    }

    pub fn config(&self, bundler: Bundler, chunk_size: usize, delay: Duration) -> ArchiveConfig {
        ArchiveConfig {
            locator: Locator::new(self.root()),
            bundler,
            chunk_size,
            delay,
        }
    }
}

pub async fn read_pid(path: &Path) -> i32 {
    for _ in 0..100 {
        if let Ok(pid) = tokio::fs::read_to_string(path).await {
            if let Ok(pid) = pid.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no pid written to {}", path.display());
}

/// Whether `pid` is running. Zombies count as gone.
pub fn is_alive(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(|rest| !rest.trim_start().starts_with(|c: char| c == 'Z' || c == 'X'))
            .unwrap_or(true),
        Err(_) => false,
    }
}

pub async fn wait_gone(pid: i32) -> bool {
    for _ in 0..100 {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
