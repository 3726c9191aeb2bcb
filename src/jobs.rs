//! The driver-facing job model.
//!
//! The incremental core never launches processes; it decides which [`Job`]s
//! are mandatory and hands them to the driver, which executes them through
//! its own pool and reports completions back via
//! [`IncrementalState::after_job`](crate::state::IncrementalState::after_job).

use std::path::{Path, PathBuf};

/// What a job does, which also determines its scheduling group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Precompile a bridging header. Runs before any compile.
    GeneratePch,
    /// Emit the module's supplementary outputs. Runs before any compile.
    EmitModule,
    /// Compile one or more primary inputs.
    Compile,
    /// Link the final product. Runs after all compiles.
    Link,
    /// Verify the emitted module interface. Runs after all compiles but
    /// consumes no compile outputs worth forcing the first wave for.
    VerifyModuleInterface,
}

/// Coarse ordering groups within one build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobGroup {
    BeforeCompiles,
    Compiles,
    AfterCompiles,
}

impl JobKind {
    pub fn group(self) -> JobGroup {
        match self {
            JobKind::GeneratePch | JobKind::EmitModule => JobGroup::BeforeCompiles,
            JobKind::Compile => JobGroup::Compiles,
            JobKind::Link | JobKind::VerifyModuleInterface => JobGroup::AfterCompiles,
        }
    }
}

/// One unit of work the driver can run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub kind: JobKind,
    /// The inputs this job exists for; compile jobs list their primary
    /// source files here in command-line order.
    pub primary_inputs: Vec<PathBuf>,
    /// Everything the job reads, including non-primary inputs.
    pub inputs: Vec<PathBuf>,
    /// Everything the job writes.
    pub outputs: Vec<PathBuf>,
}

impl Job {
    pub fn new(
        kind: JobKind,
        primary_inputs: Vec<PathBuf>,
        inputs: Vec<PathBuf>,
        outputs: Vec<PathBuf>,
    ) -> Self {
        Self { kind, primary_inputs, inputs, outputs }
    }

    /// A compile job over a single primary input.
    pub fn compiling(input: impl Into<PathBuf>, outputs: Vec<PathBuf>) -> Self {
        let input = input.into();
        Self {
            kind: JobKind::Compile,
            primary_inputs: vec![input.clone()],
            inputs: vec![input],
            outputs,
        }
    }

    pub fn is_compile(&self) -> bool {
        self.kind == JobKind::Compile
    }

    pub fn is_verification(&self) -> bool {
        self.kind == JobKind::VerifyModuleInterface
    }

    pub fn contains_primary(&self, input: &Path) -> bool {
        self.primary_inputs.iter().any(|p| p == input)
    }

    /// Whether this job reads any of `outputs`.
    pub fn reads_any_of(&self, outputs: &[PathBuf]) -> bool {
        self.inputs.iter().any(|input| outputs.contains(input))
    }
}

/// The driver's full job set for one invocation, split by scheduling group.
#[derive(Clone, Debug, Default)]
pub struct JobsInPhases {
    pub before_compiles: Vec<Job>,
    /// Compile jobs in command-line order of their first primary input.
    pub compile_jobs: Vec<Job>,
    pub after_compiles: Vec<Job>,
}

impl JobsInPhases {
    /// The compile job whose primaries include `input`.
    pub fn compile_job_for(&self, input: &Path) -> Option<&Job> {
        self.compile_jobs.iter().find(|job| job.contains_primary(input))
    }
}

/// Exit status of a finished job, as observed by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessResult {
    pub exit_code: i32,
}

impl ProcessResult {
    pub const SUCCESS: Self = Self { exit_code: 0 };

    pub fn success(self) -> bool {
        self.exit_code == 0
    }
}

/// Executes jobs on behalf of the incremental core's surrounding driver.
///
/// The core itself never calls this; it exists so that drivers and tests can
/// be written against one interface.
pub trait JobRunner {
    fn run(&self, job: &Job) -> std::io::Result<ProcessResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_groups() {
        assert_eq!(JobKind::EmitModule.group(), JobGroup::BeforeCompiles);
        assert_eq!(JobKind::Compile.group(), JobGroup::Compiles);
        assert_eq!(JobKind::VerifyModuleInterface.group(), JobGroup::AfterCompiles);
    }

    #[test]
    fn compile_job_lookup_respects_primaries() {
        let jobs = JobsInPhases {
            compile_jobs: vec![
                Job::compiling("a.swift", vec!["a.o".into()]),
                Job::compiling("b.swift", vec!["b.o".into()]),
            ],
            ..Default::default()
        };
        assert!(jobs.compile_job_for(Path::new("b.swift")).is_some());
        assert!(jobs.compile_job_for(Path::new("c.swift")).is_none());
    }
}
