//! Cross-thread state of one incremental build.
//!
//! [`IncrementalState::plan`] decides the first wave and either hands back a
//! [`Plan`] or `None` when incremental compilation cannot be used. As the
//! driver's pool finishes compile jobs, [`IncrementalState::after_job`]
//! integrates their updated artifacts and promotes skipped jobs (the second
//! wave). The module graph, the skipped-jobs map and the unfinished-job set
//! form the protected state: readers share, writers exclude, and every
//! mutating entry point takes the write lock for its whole critical section.

use crate::{
    build_record::{BuildRecord, InputInfo, InputStatus},
    error::{IncrementalError, Result},
    fs::FileSystem,
    graph::{InvalidatedInputs, MapPopulationPurpose, ModuleDependencyGraph, Phase},
    jobs::{Job, JobsInPhases, ProcessResult},
    output_file_map::OutputFileMap,
    plan::{self, FirstWave, Plan},
    report::Reporter,
    utils::TimePoint,
    IncrementalOptions,
};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Everything [`IncrementalState::plan`] consumes.
pub struct PlanningContext {
    /// Source files in command-line order.
    pub inputs: Vec<PathBuf>,
    /// The driver's full job set for this invocation.
    pub jobs: JobsInPhases,
    /// `None` disables incremental compilation with a remark.
    pub output_file_map: Option<OutputFileMap>,
    pub options: IncrementalOptions,
    pub fs: Arc<dyn FileSystem>,
    pub reporter: Arc<dyn Reporter>,
    /// When the build started; defaults to the wall clock. The driver passes
    /// its own notion so that all timestamps in one build agree.
    pub build_start_time: Option<TimePoint>,
}

/// State guarded by the reader-writer lock.
#[derive(Debug)]
struct ProtectedState {
    graph: ModuleDependencyGraph,
    /// Initially skipped compile jobs by primary input; the second wave
    /// drains from here.
    skipped_compile_jobs: BTreeMap<PathBuf, Job>,
    /// Primaries of scheduled compile jobs that have not finished yet.
    unfinished_compile_inputs: BTreeSet<PathBuf>,
    succeeded: BTreeSet<PathBuf>,
    failed: BTreeSet<PathBuf>,
}

/// The incremental build's cross-invocation brain, owned by the driver for
/// the duration of one build.
pub struct IncrementalState {
    protected: RwLock<ProtectedState>,
    fs: Arc<dyn FileSystem>,
    reporter: Arc<dyn Reporter>,
    inputs: Vec<PathBuf>,
    build_start_time: TimePoint,
    build_record_path: PathBuf,
    priors_path: PathBuf,
    swift_version: String,
    args_hash: String,
    prior_input_infos: BTreeMap<PathBuf, InputInfo>,
    /// Set when writing the graph failed; the next record then demands a
    /// full re-scan.
    graph_write_failed: AtomicBool,
}

impl IncrementalState {
    /// Plans the first wave.
    ///
    /// Returns `None` (with a remark) when incremental compilation cannot be
    /// used this invocation: disabled, no output file map, compiler-version
    /// or argument mismatch, or disappeared inputs. The driver then
    /// schedules everything itself.
    pub fn plan(ctx: PlanningContext) -> Result<Option<(Self, Plan)>> {
        let PlanningContext { inputs, jobs, output_file_map, options, fs, reporter, build_start_time } =
            ctx;

        if !options.enabled {
            debug!("incremental compilation not requested");
            return Ok(None);
        }
        let Some(build_record_path) = options.build_record_path.clone() else {
            reporter.report_disabling(&IncrementalError::NoBuildRecordPath.to_string());
            return Ok(None);
        };
        let Some(output_file_map) = output_file_map else {
            reporter.report_disabling("the driver has no output file map");
            return Ok(None);
        };

        let build_start_time = build_start_time.unwrap_or_else(TimePoint::now);
        let args_hash = BuildRecord::args_hash_of(options.args_for_hash.iter().map(String::as_str));
        let priors_path = options
            .priors_path
            .clone()
            .unwrap_or_else(|| build_record_path.with_extension("priors"));

        // the previous build record gates everything
        let prior_record = Self::read_prior_record(&build_record_path, &*fs, &*reporter);
        if let Some(record) = &prior_record {
            if let Some(reason) =
                Self::record_mismatch(record, &options.swift_version, &args_hash, &inputs)
            {
                reporter.report_disabling(&reason.to_string());
                return Ok(None);
            }
        }

        let (graph, wave) = match Self::build_graph_and_first_wave(
            prior_record.as_ref(),
            &inputs,
            &jobs,
            &output_file_map,
            &options,
            &priors_path,
            build_start_time,
            &*fs,
            &*reporter,
        ) {
            Ok(built) => built,
            Err(e @ IncrementalError::NoDependenciesEntry(_)) => {
                reporter.report_disabling(&e.to_string());
                return Ok(None);
            }
            Err(other) => return Err(other),
        };

        let plan = wave.to_plan();
        let unfinished_compile_inputs = wave.scheduled_inputs.clone();
        let state = Self {
            protected: RwLock::new(ProtectedState {
                graph,
                skipped_compile_jobs: wave.skipped_compile_jobs,
                unfinished_compile_inputs,
                succeeded: BTreeSet::new(),
                failed: BTreeSet::new(),
            }),
            fs,
            reporter,
            inputs,
            build_start_time,
            build_record_path,
            priors_path,
            swift_version: options.swift_version.clone(),
            args_hash,
            prior_input_infos: prior_record.map(|r| r.input_infos).unwrap_or_default(),
            graph_write_failed: AtomicBool::new(false),
        };
        Ok(Some((state, plan)))
    }

    fn read_prior_record(
        path: &Path,
        fs: &dyn FileSystem,
        reporter: &dyn Reporter,
    ) -> Option<BuildRecord> {
        if !fs.exists(path) {
            debug!("no build record at {}", path.display());
            return None;
        }
        match BuildRecord::read(path, fs) {
            Ok(record) => Some(record),
            Err(e) => {
                // a malformed record is not trustworthy; rebuild from scratch
                reporter.report(
                    &format!("Incremental compilation could not read the build record: {e}"),
                    None,
                );
                None
            }
        }
    }

    /// A reason to disable incremental compilation entirely, if any.
    fn record_mismatch(
        record: &BuildRecord,
        swift_version: &str,
        args_hash: &str,
        inputs: &[PathBuf],
    ) -> Option<IncrementalError> {
        if record.swift_version != swift_version {
            return Some(IncrementalError::IncompatibleCompilerVersion(
                record.swift_version.clone(),
            ));
        }
        // records from older drivers carry no hash; tolerated
        if let Some(prior_hash) = &record.args_hash {
            if prior_hash != args_hash {
                return Some(IncrementalError::ArgsHashMismatch);
            }
        }
        let disappeared: Vec<PathBuf> = record
            .input_infos
            .keys()
            .filter(|prior| !inputs.contains(prior))
            .cloned()
            .collect();
        if !disappeared.is_empty() {
            return Some(IncrementalError::DisappearedInputs(disappeared));
        }
        None
    }

    /// Acquires a graph (priors, reconstruction, or empty) and computes the
    /// first wave accordingly.
    #[allow(clippy::too_many_arguments)]
    fn build_graph_and_first_wave(
        prior_record: Option<&BuildRecord>,
        inputs: &[PathBuf],
        jobs: &JobsInPhases,
        output_file_map: &OutputFileMap,
        options: &IncrementalOptions,
        priors_path: &Path,
        build_start_time: TimePoint,
        fs: &dyn FileSystem,
        reporter: &dyn Reporter,
    ) -> Result<(ModuleDependencyGraph, FirstWave)> {
        let everything = |reporter: &dyn Reporter| -> Result<(ModuleDependencyGraph, FirstWave)> {
            let mut graph = ModuleDependencyGraph::new(Phase::BuildingAfterEachCompilation);
            graph.populate_input_dependency_source_map(
                inputs,
                output_file_map,
                MapPopulationPurpose::BuildingFromSwiftDeps,
            )?;
            Ok((graph, plan::everything_is_mandatory(inputs, jobs, reporter)))
        };

        let Some(record) = prior_record else {
            return everything(reporter);
        };

        // priors, if they exist and parse, give precise external state
        if fs.exists(priors_path) {
            match ModuleDependencyGraph::read_from_path(priors_path, build_start_time, fs) {
                Ok(mut graph) => {
                    debug!("loaded priors from {}", priors_path.display());
                    graph.populate_input_dependency_source_map(
                        inputs,
                        output_file_map,
                        MapPopulationPurpose::ReadingPriors,
                    )?;
                    let externally_invalidated = match Self::inputs_invalidated_by_externals(
                        &mut graph,
                        record.build_start_time,
                        fs,
                        reporter,
                    ) {
                        Ok(invalidated) => invalidated,
                        Err(e) => {
                            reporter.report(
                                &format!(
                                    "Incremental compilation state drifted, rebuilding: {e}"
                                ),
                                None,
                            );
                            return everything(reporter);
                        }
                    };
                    graph.set_phase(Phase::UpdatingAfterCompilation);
                    match Self::first_wave_or_drift(
                        &mut graph,
                        record,
                        &externally_invalidated,
                        inputs,
                        jobs,
                        output_file_map,
                        options,
                        fs,
                        reporter,
                    )? {
                        Some(wave) => return Ok((graph, wave)),
                        None => return everything(reporter),
                    }
                }
                Err(e) => {
                    warn!("could not read priors: {e}");
                    reporter.report(
                        &format!(
                            "Incremental compilation could not read the priors at {}, \
                             rebuilding everything: {e}",
                            priors_path.display()
                        ),
                        None,
                    );
                    if e.is_recoverable_format_error() {
                        // a corrupt file would fail the same way next build
                        let _ = fs.remove_file(priors_path);
                    }
                    return everything(reporter);
                }
            }
        }

        // no priors: reconstruct the graph by reading every input's artifact
        debug!("no priors at {}, rebuilding the graph from swiftdeps", priors_path.display());
        let mut graph = ModuleDependencyGraph::new(Phase::BuildingWithoutAPrior);
        graph.populate_input_dependency_source_map(
            inputs,
            output_file_map,
            MapPopulationPurpose::BuildingFromSwiftDeps,
        )?;
        let mut externally_invalidated = InvalidatedInputs::new();
        for input in inputs {
            match graph
                .collect_inputs_requiring_compilation_from_externals_found_by_compiling(input, fs)
            {
                Ok(invalidated) => externally_invalidated.extend(invalidated),
                Err(e) => {
                    // the input has no usable artifact; it is absent from the
                    // graph and step 4 of the first wave schedules it
                    reporter.report(
                        &format!("Incremental compilation could not read the artifact: {e}"),
                        Some(input),
                    );
                }
            }
        }
        match Self::inputs_invalidated_by_externals(&mut graph, record.build_start_time, fs, reporter)
        {
            Ok(changed_externals) => externally_invalidated.extend(changed_externals),
            Err(e) => {
                reporter.report(
                    &format!("Incremental compilation state drifted, rebuilding: {e}"),
                    None,
                );
                return everything(reporter);
            }
        }
        graph.set_phase(Phase::BuildingAfterEachCompilation);
        match Self::first_wave_or_drift(
            &mut graph,
            record,
            &externally_invalidated,
            inputs,
            jobs,
            output_file_map,
            options,
            fs,
            reporter,
        )? {
            Some(wave) => Ok((graph, wave)),
            None => everything(reporter),
        }
    }

    /// Externally invalidated inputs: changed externals → directly
    /// invalidated nodes → traced uses → inputs.
    fn inputs_invalidated_by_externals(
        graph: &mut ModuleDependencyGraph,
        last_build_start: TimePoint,
        fs: &dyn FileSystem,
        reporter: &dyn Reporter,
    ) -> Result<InvalidatedInputs> {
        let invalidated =
            graph.collect_nodes_invalidated_by_changed_or_added_externals(last_build_start, fs, reporter);
        if invalidated.is_empty() {
            return Ok(InvalidatedInputs::new());
        }
        let traced = crate::graph::trace::trace_uses(graph, &invalidated);
        graph.inputs_of_nodes(traced)
    }

    /// Runs the first-wave decision procedure; `Ok(None)` means the graph
    /// drifted from the inputs and the caller should rebuild everything.
    #[allow(clippy::too_many_arguments)]
    fn first_wave_or_drift(
        graph: &mut ModuleDependencyGraph,
        record: &BuildRecord,
        externally_invalidated: &InvalidatedInputs,
        inputs: &[PathBuf],
        jobs: &JobsInPhases,
        output_file_map: &OutputFileMap,
        options: &IncrementalOptions,
        fs: &dyn FileSystem,
        reporter: &dyn Reporter,
    ) -> Result<Option<FirstWave>> {
        match plan::compute_first_wave(plan::FirstWaveContext {
            graph,
            record,
            externally_invalidated,
            inputs,
            jobs,
            output_file_map,
            fs,
            reporter,
            always_rebuild_dependents: options.always_rebuild_dependents,
        }) {
            Ok(wave) => Ok(Some(wave)),
            Err(e) if e.is_recoverable_format_error() => {
                reporter.report(
                    &format!("Incremental compilation state is unusable, rebuilding: {e}"),
                    None,
                );
                Ok(None)
            }
            Err(IncrementalError::NodeMissingFromMap(detail)) => {
                reporter.report(
                    &format!("Incremental compilation state drifted, rebuilding: {detail}"),
                    None,
                );
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    /// Second wave: integrates the finished job's updated artifacts and
    /// promotes any skipped jobs they invalidate.
    ///
    /// Returns `None` once no unfinished compile jobs remain (the build is
    /// complete); otherwise `Some(newly discovered jobs)`, possibly empty.
    pub fn after_job(&self, job: &Job, result: ProcessResult) -> Option<Vec<Job>> {
        if !job.is_compile() {
            return Some(Vec::new());
        }

        // barrier: integration must see and produce a consistent graph
        let mut protected = self.protected.write();
        for primary in &job.primary_inputs {
            protected.unfinished_compile_inputs.remove(primary);
        }

        if !result.success() {
            // leave the inputs' skipped status untouched so the next build
            // record schedules them again
            for primary in &job.primary_inputs {
                protected.failed.insert(primary.clone());
            }
            trace!("compile failed with {}, no second-wave work", result.exit_code);
            return Some(Vec::new());
        }
        for primary in &job.primary_inputs {
            protected.succeeded.insert(primary.clone());
        }

        let mut discovered: Vec<Job> = Vec::new();
        for primary in &job.primary_inputs {
            let invalidated = match protected
                .graph
                .collect_inputs_requiring_compilation_by_compiling(primary, &*self.fs)
            {
                Ok(invalidated) => invalidated,
                Err(e) => {
                    // never silently drop information: rebuild everything
                    // still skipped
                    self.reporter.report(
                        &format!(
                            "Incremental compilation could not re-read the dependency \
                             artifact, scheduling all remaining inputs: {e}"
                        ),
                        Some(primary),
                    );
                    let remaining = std::mem::take(&mut protected.skipped_compile_jobs);
                    discovered.extend(remaining.into_values());
                    continue;
                }
            };
            for invalidated_input in invalidated {
                if let Some(job) = protected.skipped_compile_jobs.remove(&invalidated_input) {
                    self.reporter.report(
                        "Queuing because of dependencies discovered later",
                        Some(&invalidated_input),
                    );
                    discovered.push(job);
                }
            }
        }

        // de-duplicate jobs discovered through several primaries
        let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
        discovered.retain(|job| {
            job.primary_inputs.first().map_or(false, |first| seen.insert(first.clone()))
        });
        for job in &discovered {
            for primary in &job.primary_inputs {
                protected.unfinished_compile_inputs.insert(primary.clone());
            }
        }

        if discovered.is_empty() && protected.unfinished_compile_inputs.is_empty() {
            trace!("all compile jobs finished");
            None
        } else {
            Some(discovered)
        }
    }

    /// Whether an after-compile job's outputs are all newer than its inputs.
    pub fn can_skip_post_compile(&self, job: &Job) -> bool {
        let mut oldest_output: Option<TimePoint> = None;
        for output in &job.outputs {
            match self.fs.mod_time(output) {
                Ok(time) => {
                    oldest_output =
                        Some(oldest_output.map_or(time, |oldest| oldest.min(time)));
                }
                Err(_) => return false,
            }
        }
        let Some(oldest_output) = oldest_output else { return false };
        let newest_input = job
            .inputs
            .iter()
            .map(|input| self.fs.mod_time_or_distant_future(input))
            .max()
            .unwrap_or(TimePoint::ZERO);
        oldest_output >= newest_input
    }

    /// Serializes the module graph for the next invocation.
    ///
    /// Failure is a warning, not a build failure; the next build record then
    /// records every input as needing a rebuild so nothing is skipped on
    /// stale information.
    pub fn write_dependency_graph(&self) -> Result<()> {
        let protected = self.protected.write();
        match protected.graph.write_to_path(&self.priors_path, &self.swift_version, &*self.fs) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.graph_write_failed.store(true, Ordering::Release);
                warn!("could not write the dependency graph: {e}");
                Err(e)
            }
        }
    }

    /// The record describing this build, for the next invocation.
    pub fn build_record(&self, build_end_time: TimePoint) -> BuildRecord {
        let protected = self.protected.read();
        let graph_write_failed = self.graph_write_failed.load(Ordering::Acquire);
        let mut input_infos = BTreeMap::new();
        for input in &self.inputs {
            let prior = self.prior_input_infos.get(input);
            let info = if graph_write_failed {
                // stale graph on disk: force a full re-scan next time
                InputInfo::new(
                    InputStatus::NeedsCascadingBuild,
                    self.fs.mod_time_or_distant_future(input),
                )
            } else if protected.succeeded.contains(input) {
                InputInfo::new(InputStatus::UpToDate, self.fs.mod_time_or_distant_future(input))
            } else if protected.failed.contains(input)
                || protected.unfinished_compile_inputs.contains(input)
            {
                InputInfo::new(
                    InputStatus::NeedsCascadingBuild,
                    self.fs.mod_time_or_distant_future(input),
                )
            } else if let Some(prior) = prior {
                // skipped: carry the previous state forward
                *prior
            } else {
                InputInfo::new(
                    InputStatus::NewlyAdded,
                    self.fs.mod_time_or_distant_future(input),
                )
            };
            input_infos.insert(input.clone(), info);
        }
        BuildRecord::new(
            self.swift_version.clone(),
            Some(self.args_hash.clone()),
            self.build_start_time,
            build_end_time,
            input_infos,
        )
    }

    /// Writes the build record for the next invocation.
    pub fn write_build_record(&self, build_end_time: TimePoint) -> Result<()> {
        self.build_record(build_end_time).write(&self.build_record_path, &*self.fs)
    }

    /// The compile jobs still skipped, for post-build reporting.
    pub fn skipped_jobs(&self) -> Vec<Job> {
        self.protected.read().skipped_compile_jobs.values().cloned().collect()
    }

    /// The inputs still skipped.
    pub fn skipped_inputs(&self) -> Vec<PathBuf> {
        self.protected.read().skipped_compile_jobs.keys().cloned().collect()
    }

    /// Runs the graph's invariant check under a read lock.
    pub fn verify_graph(&self) -> Result<()> {
        let protected = self.protected.read();
        let result = protected.graph.verify();
        debug_assert!(result.is_ok(), "graph invariant violation: {result:?}");
        result
    }

    pub fn build_start_time(&self) -> TimePoint {
        self.build_start_time
    }

    /// The graph's current lifecycle phase, for diagnostics.
    pub fn graph_phase(&self) -> Phase {
        self.protected.read().graph.phase()
    }
}

impl std::fmt::Debug for IncrementalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalState")
            .field("inputs", &self.inputs.len())
            .field("build_start_time", &self.build_start_time)
            .field("build_record_path", &self.build_record_path)
            .finish_non_exhaustive()
    }
}
