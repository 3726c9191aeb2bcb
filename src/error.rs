//! Error types emitted by the incremental build machinery.

use crate::{bitstream::BitstreamError, utils::TimePoint};
use std::path::PathBuf;

pub type Result<T, E = IncrementalError> = std::result::Result<T, E>;

/// Version pair `(major, minor)` of a serialized module dependency graph.
pub type GraphFormatVersion = (u16, u16);

/// Various errors raised while planning or updating an incremental build.
///
/// Format errors raised while reading priors or a per-file artifact are
/// recoverable: the planner degrades to a coarser rebuild instead of failing
/// the build. See [`IncrementalError::is_recoverable_format_error`].
#[derive(Debug, thiserror::Error)]
pub enum IncrementalError {
    // ---- format errors -----------------------------------------------------
    #[error("bad magic number in {}", .0.display())]
    BadMagic(PathBuf),
    #[error("unknown record id {0}")]
    UnknownRecord(u64),
    #[error("malformed metadata record")]
    MalformedMetadataRecord,
    #[error("malformed fingerprint record")]
    MalformedFingerprintRecord,
    #[error("unknown dependency key kind {0}")]
    UnknownKind(u64),
    #[error("bogus name or context in dependency key")]
    BogusNameOrContext,
    #[error("unknown dependency source extension: {0:?}")]
    UnknownDependencySourceExtension(String),
    #[error("serialized graph version mismatch: expected {expected:?}, read {read:?}")]
    MismatchedSerializedGraphVersion { expected: GraphFormatVersion, read: GraphFormatVersion },
    #[error(
        "priors were modified at {priors_mod_time}, after the build started at {build_start_time}"
    )]
    TimeTravellingPriors { priors_mod_time: TimePoint, build_start_time: TimePoint },
    /// A semantic invariant violation demoted to a format error in release
    /// builds; the caller falls back conservatively.
    #[error("unexpected internal state: {0}")]
    UnexpectedInternalState(String),
    #[error(transparent)]
    Bitstream(#[from] BitstreamError),

    // ---- semantic errors ---------------------------------------------------
    #[error("external dependency nodes must have the interface aspect")]
    ExternalDepsMustBeInterface,
    #[error("only module summaries may carry an external-dependency fingerprint: {0:?}")]
    ExternalDepWithFingerprintMustPointToModuleSummary(String),
    #[error("node missing from map: {0}")]
    NodeMissingFromMap(String),

    // ---- operational errors ------------------------------------------------
    #[error("no build record path")]
    NoBuildRecordPath,
    #[error("no swift-dependencies entry in the output file map for {}", .0.display())]
    NoDependenciesEntry(PathBuf),
    #[error("could not read {}: {cause}", .path.display())]
    CouldNotReadArtifact { path: PathBuf, cause: String },
    #[error("could not write {}: {cause}", .path.display())]
    CouldNotWriteArtifact { path: PathBuf, cause: String },
    #[error("the build record was produced by a different compiler version: {0}")]
    IncompatibleCompilerVersion(String),
    #[error("the hash of the compiler arguments changed since the previous build")]
    ArgsHashMismatch,
    #[error(
        "the following inputs were used in the previous compilation but not in this one: {}",
        format_paths(.0)
    )]
    DisappearedInputs(Vec<PathBuf>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Message(String),
}

impl IncrementalError {
    pub(crate) fn msg(msg: impl std::fmt::Display) -> Self {
        IncrementalError::Message(msg.to_string())
    }

    pub(crate) fn read_failure(path: impl Into<PathBuf>, cause: impl std::fmt::Display) -> Self {
        IncrementalError::CouldNotReadArtifact { path: path.into(), cause: cause.to_string() }
    }

    pub(crate) fn write_failure(path: impl Into<PathBuf>, cause: impl std::fmt::Display) -> Self {
        IncrementalError::CouldNotWriteArtifact { path: path.into(), cause: cause.to_string() }
    }

    /// Whether this error means "the artifact on disk is unusable" rather than
    /// "the build is misconfigured".
    ///
    /// Recoverable format errors make the planner fall back to a full rebuild
    /// (priors) or a conservative group rebuild (per-file artifacts) instead
    /// of surfacing the failure.
    pub fn is_recoverable_format_error(&self) -> bool {
        matches!(
            self,
            IncrementalError::BadMagic(_)
                | IncrementalError::UnknownRecord(_)
                | IncrementalError::MalformedMetadataRecord
                | IncrementalError::MalformedFingerprintRecord
                | IncrementalError::UnknownKind(_)
                | IncrementalError::BogusNameOrContext
                | IncrementalError::UnknownDependencySourceExtension(_)
                | IncrementalError::MismatchedSerializedGraphVersion { .. }
                | IncrementalError::TimeTravellingPriors { .. }
                | IncrementalError::UnexpectedInternalState(_)
                | IncrementalError::Bitstream(_)
        )
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    let mut out = String::new();
    for (i, path) in paths.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&path.display().to_string());
    }
    out
}
