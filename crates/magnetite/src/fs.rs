//! Filesystem abstraction for recording-directory setup.
//!
//! Mirrors the handful of operations the endpoint needs so tests can run
//! the setup logic against an in-memory tree.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The filesystem operations the endpoint performs at construction.
pub trait Filesystem {
    /// Whether `path` exists (file or directory).
    fn exists(&self, path: &Path) -> bool;

    /// Whether `path` is a directory.
    fn is_directory(&self, path: &Path) -> bool;

    /// Removes a file or empty directory. Returns success.
    fn remove(&self, path: &Path) -> bool;

    /// Removes `path` recursively. Returns success.
    fn remove_all(&self, path: &Path) -> bool;

    /// Creates `path` and any missing parents. Returns success.
    fn mkdirs(&self, path: &Path) -> bool;

    /// Writes `contents` to `path`, replacing any previous file.
    fn write(&self, path: &Path, contents: &[u8]) -> std::io::Result<()>;
}

/// The real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFilesystem;

impl Filesystem for StdFilesystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_directory(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn remove(&self, path: &Path) -> bool {
        if path.is_dir() {
            std::fs::remove_dir(path).is_ok()
        } else {
            std::fs::remove_file(path).is_ok()
        }
    }

    fn remove_all(&self, path: &Path) -> bool {
        std::fs::remove_dir_all(path).is_ok()
    }

    fn mkdirs(&self, path: &Path) -> bool {
        std::fs::create_dir_all(path).is_ok()
    }

    fn write(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
        std::fs::write(path, contents)
    }
}

/// An in-memory tree for exercising the setup logic in tests.
#[derive(Debug, Default)]
pub struct MemoryFilesystem {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    dirs: HashSet<PathBuf>,
    files: HashMap<PathBuf, Vec<u8>>,
}

impl MemoryFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a file back out, for assertions.
    pub fn read(&self, path: &Path) -> Option<Vec<u8>> {
        self.state
            .lock()
            .expect("fs mutex")
            .files
            .get(path)
            .cloned()
    }

    /// Lists every directory currently present.
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<_> = self
            .state
            .lock()
            .expect("fs mutex")
            .dirs
            .iter()
            .cloned()
            .collect();
        dirs.sort();
        dirs
    }
}

impl Filesystem for MemoryFilesystem {
    fn exists(&self, path: &Path) -> bool {
        let state = self.state.lock().expect("fs mutex");
        state.dirs.contains(path) || state.files.contains_key(path)
    }

    fn is_directory(&self, path: &Path) -> bool {
        self.state.lock().expect("fs mutex").dirs.contains(path)
    }

    fn remove(&self, path: &Path) -> bool {
        let mut state = self.state.lock().expect("fs mutex");
        state.files.remove(path).is_some() || state.dirs.remove(path)
    }

    fn remove_all(&self, path: &Path) -> bool {
        let mut state = self.state.lock().expect("fs mutex");
        state.dirs.retain(|d| !d.starts_with(path));
        state.files.retain(|f, _| !f.starts_with(path));
        true
    }

    fn mkdirs(&self, path: &Path) -> bool {
        let mut state = self.state.lock().expect("fs mutex");
        let mut current = PathBuf::new();
        for part in path.components() {
            current.push(part);
            state.dirs.insert(current.clone());
        }
        true
    }

    fn write(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
        let mut state = self.state.lock().expect("fs mutex");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !state.dirs.contains(parent) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "parent directory missing",
                ));
            }
        }
        state.files.insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }
}
