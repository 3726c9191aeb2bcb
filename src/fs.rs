//! The small filesystem seam the incremental core reads and writes through.
//!
//! Everything on-disk (artifacts, priors, the build record, compile outputs)
//! is reached via [`FileSystem`] so that planning decisions can be exercised
//! against a virtual filesystem in tests.

use crate::utils::TimePoint;
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

/// Synchronous, bounded file access used by the incremental core.
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Reads the entire contents of `path`.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Writes `contents` to `path`, creating parent directories as needed.
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Removes the file at `path`.
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Whether a file exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// The modification time of `path`.
    fn mod_time(&self, path: &Path) -> io::Result<TimePoint>;

    /// The modification time of `path`, or [`TimePoint::DISTANT_FUTURE`] if
    /// the file cannot be statted so that it always counts as changed.
    fn mod_time_or_distant_future(&self, path: &Path) -> TimePoint {
        self.mod_time(path).unwrap_or(TimePoint::DISTANT_FUTURE)
    }
}

/// The real local filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        create_parent_dir_all(path)?;
        fs::write(path, contents)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn mod_time(&self, path: &Path) -> io::Result<TimePoint> {
        let modified = fs::metadata(path)?.modified()?;
        Ok(TimePoint::from_system_time(modified))
    }
}

/// Creates all parent directories of the given file path.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> io::Result<()> {
    if let Some(parent) = file.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// An in-memory filesystem with explicit modification times.
///
/// Intended for tests that need to steer mod-time comparisons without
/// sleeping between writes; [`FileSystem::write`] stamps files with the
/// virtual clock set via [`MemoryFileSystem::set_now`].
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: parking_lot::Mutex<std::collections::BTreeMap<PathBuf, (Vec<u8>, TimePoint)>>,
    now: parking_lot::Mutex<TimePoint>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the virtual clock used to stamp subsequent writes.
    pub fn set_now(&self, now: TimePoint) {
        *self.now.lock() = now;
    }

    /// Adds or replaces a file with the given contents and mod time.
    pub fn add(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>, time: TimePoint) {
        self.files.lock().insert(path.into(), (contents.into(), time));
    }

    /// Overrides the mod time of an existing file.
    pub fn touch(&self, path: &Path, time: TimePoint) {
        if let Some(entry) = self.files.lock().get_mut(path) {
            entry.1 = time;
        }
    }

    pub fn remove(&self, path: &Path) {
        self.files.lock().remove(path);
    }
}

impl FileSystem for MemoryFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files
            .lock()
            .get(path)
            .map(|(contents, _)| contents.clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.add(path, contents, *self.now.lock());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.files
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }

    fn mod_time(&self, path: &Path) -> io::Result<TimePoint> {
        self.files
            .lock()
            .get(path)
            .map(|(_, time)| *time)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }
}
