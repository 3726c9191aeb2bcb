#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{IncrementalError, Result};

pub mod bitstream;

mod interner;
pub use interner::{StringId, StringTable};

pub mod keys;
pub use keys::{
    DeclAspect, DependencyKey, DependencySource, Designator, ExternalDependency, Fingerprint,
    FingerprintedExternalDependency,
};

mod containers;
pub use containers::{BidirectionalMap, Multidictionary, TwoDMap, TwoLevelMap};

pub mod swiftdeps;
pub use swiftdeps::SourceFileDependencyGraph;

pub mod graph;
pub use graph::{ModuleDependencyGraph, Phase};

pub mod build_record;
pub use build_record::{BuildRecord, InputInfo, InputStatus};

pub mod output_file_map;
pub use output_file_map::{OutputEntry, OutputFileMap};

pub mod jobs;
pub use jobs::{Job, JobKind, JobRunner, JobsInPhases, ProcessResult};

pub mod fs;
pub use fs::{FileSystem, RealFileSystem};

pub mod report;
pub use report::{NullReporter, Reporter, TracingReporter};

pub mod plan;
pub use plan::Plan;

pub mod state;
pub use state::{IncrementalState, PlanningContext};

pub mod utils;
pub use utils::TimePoint;

use std::path::PathBuf;

// dev-only dependencies used from the tests/ directory
#[cfg(test)]
use pretty_assertions as _;
#[cfg(test)]
use rand as _;
#[cfg(test)]
use tempfile as _;
#[cfg(test)]
use tracing_subscriber as _;

/// The parsed-options view the planner consumes; the surrounding driver
/// distills it from its own option model.
#[derive(Clone, Debug)]
pub struct IncrementalOptions {
    /// Whether incremental compilation was requested at all.
    pub enabled: bool,
    /// Also schedule the dependents of externally invalidated inputs
    /// speculatively, even when those inputs are otherwise up to date.
    pub always_rebuild_dependents: bool,
    /// Where the build record lives. `None` disables incremental mode.
    pub build_record_path: Option<PathBuf>,
    /// Where the serialized module graph lives. Defaults to the build record
    /// path with a `priors` extension.
    pub priors_path: Option<PathBuf>,
    /// The compiler version string, compared for equality with the record.
    pub swift_version: String,
    /// Descriptions of the options that affect incremental builds, input
    /// options excluded; hashed into the build record.
    pub args_for_hash: Vec<String>,
}

impl Default for IncrementalOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            always_rebuild_dependents: false,
            build_record_path: None,
            priors_path: None,
            swift_version: String::new(),
            args_for_hash: Vec::new(),
        }
    }
}
