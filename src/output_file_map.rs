//! The output file map: where each input's compile outputs live.
//!
//! The driver resolves an input path to its dependency artifact and object
//! file through this map. On disk it is the JSON document passed to the
//! frontend via `-output-file-map`.

use crate::{
    error::{IncrementalError, Result},
    fs::FileSystem,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// Per-input output paths. Unset entries simply have no such output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct OutputEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swift_dependencies: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swiftmodule: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<PathBuf>,
}

/// Mapping from input path to its [`OutputEntry`].
///
/// The entry under the empty key holds module-wide outputs (e.g. the build
/// record's master swiftdeps); per-input lookups never consult it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputFileMap {
    pub entries: BTreeMap<PathBuf, OutputEntry>,
}

impl OutputFileMap {
    /// Reads and parses the JSON document at `path`.
    pub fn read(path: &Path, fs: &dyn FileSystem) -> Result<Self> {
        let bytes = fs.read(path).map_err(|e| IncrementalError::read_failure(path, e))?;
        let map = serde_json::from_slice(&bytes)?;
        trace!("read output file map at {}", path.display());
        Ok(map)
    }

    pub fn write(&self, path: &Path, fs: &dyn FileSystem) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        fs.write(path, &bytes).map_err(|e| IncrementalError::write_failure(path, e))?;
        Ok(())
    }

    /// The dependency artifact recording what `input` provides and uses.
    pub fn dependencies_file(&self, input: &Path) -> Option<&Path> {
        self.entries.get(input)?.swift_dependencies.as_deref()
    }

    /// The object file produced by compiling `input`.
    pub fn object_file(&self, input: &Path) -> Option<&Path> {
        self.entries.get(input)?.object.as_deref()
    }

    /// All compile outputs expected for `input`, in map order.
    pub fn outputs_for(&self, input: &Path) -> Vec<&Path> {
        let Some(entry) = self.entries.get(input) else { return Vec::new() };
        [&entry.object, &entry.swift_dependencies, &entry.swiftmodule]
            .into_iter()
            .filter_map(|o| o.as_deref())
            .collect()
    }

    pub fn insert(&mut self, input: impl Into<PathBuf>, entry: OutputEntry) {
        self.entries.insert(input.into(), entry);
    }
}
