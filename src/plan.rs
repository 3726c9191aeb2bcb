//! First-wave planning: which jobs must run before anything has compiled.
//!
//! The decision procedure classifies each input against the previous build
//! record and the filesystem (changed, newly added, externally invalidated,
//! outputs missing, absent from the graph), schedules the transitive
//! dependents of cascading changes up front, and leaves the rest as
//! initially skipped jobs for the second wave to draw from.

use crate::{
    build_record::{BuildRecord, InputStatus},
    error::Result,
    fs::FileSystem,
    graph::{InvalidatedInputs, ModuleDependencyGraph},
    jobs::{Job, JobsInPhases},
    output_file_map::OutputFileMap,
    report::Reporter,
};
use rayon::prelude::*;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::{Path, PathBuf},
};

/// What the driver runs, and what it holds back.
#[derive(Clone, Debug, Default)]
pub struct Plan {
    /// Jobs to run up front, before-compile jobs first, then compile jobs in
    /// command-line order of their primary inputs.
    pub mandatory_jobs: Vec<Job>,
    /// Compile jobs held back; the second wave may promote them.
    pub skipped_jobs: Vec<Job>,
}

/// Result of first-wave planning, with the bookkeeping the scheduler keeps.
#[derive(Debug, Default)]
pub(crate) struct FirstWave {
    pub mandatory_jobs: Vec<Job>,
    pub skipped_compile_jobs: BTreeMap<PathBuf, Job>,
    /// Inputs scheduled in the first wave, for diagnostics and the build
    /// record write-back.
    pub scheduled_inputs: BTreeSet<PathBuf>,
}

impl FirstWave {
    pub(crate) fn to_plan(&self) -> Plan {
        Plan {
            mandatory_jobs: self.mandatory_jobs.clone(),
            skipped_jobs: self.skipped_compile_jobs.values().cloned().collect(),
        }
    }
}

/// Schedules everything: the fallback whenever there is no usable prior
/// state.
pub(crate) fn everything_is_mandatory(
    inputs: &[PathBuf],
    jobs: &JobsInPhases,
    reporter: &dyn Reporter,
) -> FirstWave {
    debug!("scheduling all {} input(s), nothing to go on", inputs.len());
    let mut wave = FirstWave::default();
    wave.mandatory_jobs.extend(jobs.before_compiles.iter().cloned());
    let mut added: HashSet<usize> = HashSet::new();
    for input in inputs {
        if let Some((index, job)) = find_compile_job(jobs, input) {
            if added.insert(index) {
                wave.mandatory_jobs.push(job.clone());
            }
        }
        wave.scheduled_inputs.insert(input.clone());
        reporter.report("Queuing (initial): full build", Some(input));
    }
    wave
}

/// Everything [`compute_first_wave`] looks at.
pub(crate) struct FirstWaveContext<'a> {
    pub graph: &'a mut ModuleDependencyGraph,
    pub record: &'a BuildRecord,
    pub externally_invalidated: &'a InvalidatedInputs,
    pub inputs: &'a [PathBuf],
    pub jobs: &'a JobsInPhases,
    pub output_file_map: &'a OutputFileMap,
    pub fs: &'a dyn FileSystem,
    pub reporter: &'a dyn Reporter,
    pub always_rebuild_dependents: bool,
}

/// One scheduled input and why, for remarks.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ScheduleReason {
    Changed,
    NewlyAdded,
    PreviouslyScheduled,
    MissingOutputs,
    InvalidatedExternally,
    MissingFromGraph,
    Speculative,
}

impl ScheduleReason {
    fn describe(&self) -> &'static str {
        match self {
            ScheduleReason::Changed => "Queuing (initial): changed",
            ScheduleReason::NewlyAdded => "Queuing (initial): newly added",
            ScheduleReason::PreviouslyScheduled => {
                "Queuing (initial): not compiled in the previous build"
            }
            ScheduleReason::MissingOutputs => "Queuing (initial): missing outputs",
            ScheduleReason::InvalidatedExternally => "Invalidated externally",
            ScheduleReason::MissingFromGraph => {
                "Queuing (initial): no entries in the module dependency graph"
            }
            ScheduleReason::Speculative => "Queuing because of a dependency on a changed input",
        }
    }
}

/// The §-by-§ decision procedure over a usable build record.
pub(crate) fn compute_first_wave(ctx: FirstWaveContext<'_>) -> Result<FirstWave> {
    let FirstWaveContext {
        graph,
        record,
        externally_invalidated,
        inputs,
        jobs,
        output_file_map,
        fs,
        reporter,
        always_rebuild_dependents,
    } = ctx;

    let mut scheduled: BTreeMap<PathBuf, ScheduleReason> = BTreeMap::new();

    // 1. changed inputs, classified by their previous status
    let mut cascading_changed: Vec<PathBuf> = Vec::new();
    for input in inputs {
        match record.input_infos.get(input) {
            None => {
                // present now, absent from the record: newly added, nothing
                // depends on it yet
                schedule(&mut scheduled, input, ScheduleReason::NewlyAdded);
            }
            Some(info) => {
                let current = fs.mod_time_or_distant_future(input);
                match info.status {
                    InputStatus::UpToDate if current == info.previous_mod_time => {}
                    InputStatus::UpToDate => {
                        // modified since the last successful compile; its
                        // deps are known, so no cascade until the second
                        // wave proves otherwise
                        schedule(&mut scheduled, input, ScheduleReason::Changed);
                    }
                    InputStatus::NewlyAdded => {
                        schedule(&mut scheduled, input, ScheduleReason::NewlyAdded);
                    }
                    InputStatus::NeedsNonCascadingBuild => {
                        schedule(&mut scheduled, input, ScheduleReason::PreviouslyScheduled);
                    }
                    InputStatus::NeedsCascadingBuild => {
                        schedule(&mut scheduled, input, ScheduleReason::PreviouslyScheduled);
                        cascading_changed.push(input.clone());
                    }
                }
            }
        }
    }

    // 2. missing outputs; the stat-heavy scan runs in parallel
    let missing_outputs: Vec<&PathBuf> = inputs
        .par_iter()
        .filter(|input| {
            output_file_map.outputs_for(input).into_iter().any(|output| !fs.exists(output))
        })
        .collect();
    for input in missing_outputs {
        schedule(&mut scheduled, input, ScheduleReason::MissingOutputs);
    }

    // 3. externally invalidated inputs
    for input in externally_invalidated {
        schedule(&mut scheduled, input, ScheduleReason::InvalidatedExternally);
    }

    // 4. inputs with no graph data; their artifacts must be rebuilt
    for input in inputs {
        if !graph.contains_nodes_for_source_file(input)
            && !matches!(scheduled.get(input), Some(ScheduleReason::NewlyAdded))
        {
            schedule(&mut scheduled, input, ScheduleReason::MissingFromGraph);
        }
    }

    // 5. speculative dependents of cascading changes (and, if configured, of
    // externally invalidated inputs even though they are otherwise up to
    // date)
    let mut speculation_roots = cascading_changed;
    if always_rebuild_dependents {
        speculation_roots.extend(externally_invalidated.iter().cloned());
    }
    for root in speculation_roots {
        for dependent in graph.collect_inputs_invalidated_by(&root)? {
            schedule(&mut scheduled, &dependent, ScheduleReason::Speculative);
        }
    }

    for (input, reason) in &scheduled {
        reporter.report(reason.describe(), Some(input));
    }

    // 6. everything else is initially skipped
    let mut wave = FirstWave::default();
    let mut mandatory_compiles: Vec<Job> = Vec::new();
    let mut added: HashSet<usize> = HashSet::new();
    for input in inputs {
        let Some((index, job)) = find_compile_job(jobs, input) else { continue };
        if scheduled.contains_key(input) {
            if added.insert(index) {
                mandatory_compiles.push(job.clone());
                // a batched job compiles all of its primaries
                for primary in &job.primary_inputs {
                    wave.scheduled_inputs.insert(primary.clone());
                }
            }
        } else if !added.contains(&index) {
            wave.skipped_compile_jobs.insert(input.clone(), job.clone());
        }
    }
    // a primary batched together with a scheduled one is not skipped
    wave.skipped_compile_jobs.retain(|input, _| !wave.scheduled_inputs.contains(input));

    // before-compile jobs may be skipped when nothing compiles and no
    // after-compile job other than verification consumes their outputs
    let before_outputs: Vec<PathBuf> =
        jobs.before_compiles.iter().flat_map(|j| j.outputs.iter().cloned()).collect();
    let before_needed = !mandatory_compiles.is_empty()
        || jobs
            .after_compiles
            .iter()
            .any(|job| !job.is_verification() && job.reads_any_of(&before_outputs));
    if before_needed {
        wave.mandatory_jobs.extend(jobs.before_compiles.iter().cloned());
    } else {
        trace!("skipping {} before-compile job(s)", jobs.before_compiles.len());
    }
    wave.mandatory_jobs.extend(mandatory_compiles);

    debug!(
        "first wave: {} mandatory job(s), {} skipped input(s)",
        wave.mandatory_jobs.len(),
        wave.skipped_compile_jobs.len()
    );
    Ok(wave)
}

fn schedule(
    scheduled: &mut BTreeMap<PathBuf, ScheduleReason>,
    input: &Path,
    reason: ScheduleReason,
) {
    if !scheduled.contains_key(input) {
        scheduled.insert(input.to_path_buf(), reason);
    }
}

fn find_compile_job<'j>(jobs: &'j JobsInPhases, input: &Path) -> Option<(usize, &'j Job)> {
    jobs.compile_jobs
        .iter()
        .enumerate()
        .find(|(_, job)| job.contains_primary(input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_record::InputInfo;
    use crate::fs::MemoryFileSystem;
    use crate::graph::Phase;
    use crate::output_file_map::OutputEntry;
    use crate::report::NullReporter;
    use crate::utils::TimePoint;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn inputs() -> Vec<PathBuf> {
        vec!["a.swift".into(), "b.swift".into(), "c.swift".into()]
    }

    fn jobs_for(inputs: &[PathBuf]) -> JobsInPhases {
        JobsInPhases {
            before_compiles: vec![Job::new(
                crate::jobs::JobKind::EmitModule,
                vec![],
                inputs.to_vec(),
                vec!["build/Mod.swiftmodule".into()],
            )],
            compile_jobs: inputs
                .iter()
                .map(|i| {
                    let stem = i.file_stem().unwrap().to_string_lossy().into_owned();
                    Job::compiling(
                        i.clone(),
                        vec![
                            PathBuf::from(format!("build/{stem}.o")),
                            PathBuf::from(format!("build/{stem}.swiftdeps")),
                        ],
                    )
                })
                .collect(),
            after_compiles: vec![],
        }
    }

    fn map_for(inputs: &[PathBuf]) -> OutputFileMap {
        let mut map = OutputFileMap::default();
        for input in inputs {
            let stem = input.file_stem().unwrap().to_string_lossy().into_owned();
            map.insert(
                input.clone(),
                OutputEntry {
                    object: Some(PathBuf::from(format!("build/{stem}.o"))),
                    swift_dependencies: Some(PathBuf::from(format!("build/{stem}.swiftdeps"))),
                    ..Default::default()
                },
            );
        }
        map
    }

    fn fs_with_everything(inputs: &[PathBuf], map: &OutputFileMap, at: TimePoint) -> MemoryFileSystem {
        let fs = MemoryFileSystem::new();
        for input in inputs {
            fs.add(input.clone(), b"source".to_vec(), at);
            for output in map.outputs_for(input) {
                fs.add(output.to_path_buf(), b"out".to_vec(), at);
            }
        }
        fs
    }

    fn record_all_up_to_date(inputs: &[PathBuf], at: TimePoint) -> BuildRecord {
        let infos = inputs
            .iter()
            .map(|i| (i.clone(), InputInfo::new(InputStatus::UpToDate, at)))
            .collect();
        BuildRecord::new("swiftc-test", None, at, at, infos)
    }

    #[test]
    fn no_changes_schedules_nothing() {
        let inputs = inputs();
        let jobs = jobs_for(&inputs);
        let map = map_for(&inputs);
        let t = TimePoint::new(100, 0);
        let fs = fs_with_everything(&inputs, &map, t);
        let record = record_all_up_to_date(&inputs, t);
        let mut graph = graph_with_inputs(&inputs, &map);

        let wave = compute_first_wave(FirstWaveContext {
            graph: &mut graph,
            record: &record,
            externally_invalidated: &InvalidatedInputs::new(),
            inputs: &inputs,
            jobs: &jobs,
            output_file_map: &map,
            fs: &fs,
            reporter: &NullReporter,
            always_rebuild_dependents: false,
        })
        .unwrap();

        assert!(wave.mandatory_jobs.is_empty(), "{:?}", wave.mandatory_jobs);
        assert_eq!(wave.skipped_compile_jobs.len(), 3);
    }

    #[test]
    fn changed_input_is_scheduled_without_cascading() {
        let inputs = inputs();
        let jobs = jobs_for(&inputs);
        let map = map_for(&inputs);
        let t = TimePoint::new(100, 0);
        let fs = fs_with_everything(&inputs, &map, t);
        // a.swift was touched after the record was written
        fs.touch(Path::new("a.swift"), TimePoint::new(200, 0));
        let record = record_all_up_to_date(&inputs, t);
        let mut graph = graph_with_inputs(&inputs, &map);

        let wave = compute_first_wave(FirstWaveContext {
            graph: &mut graph,
            record: &record,
            externally_invalidated: &InvalidatedInputs::new(),
            inputs: &inputs,
            jobs: &jobs,
            output_file_map: &map,
            fs: &fs,
            reporter: &NullReporter,
            always_rebuild_dependents: false,
        })
        .unwrap();

        let compiled: Vec<_> = wave
            .mandatory_jobs
            .iter()
            .filter(|j| j.is_compile())
            .flat_map(|j| j.primary_inputs.clone())
            .collect();
        assert_eq!(compiled, vec![PathBuf::from("a.swift")]);
        assert!(wave.skipped_compile_jobs.contains_key(Path::new("b.swift")));
        assert!(wave.skipped_compile_jobs.contains_key(Path::new("c.swift")));
    }

    #[test]
    fn missing_output_forces_recompilation() {
        let inputs = inputs();
        let jobs = jobs_for(&inputs);
        let map = map_for(&inputs);
        let t = TimePoint::new(100, 0);
        let fs = fs_with_everything(&inputs, &map, t);
        fs.remove(Path::new("build/b.o"));
        let record = record_all_up_to_date(&inputs, t);
        let mut graph = graph_with_inputs(&inputs, &map);

        let wave = compute_first_wave(FirstWaveContext {
            graph: &mut graph,
            record: &record,
            externally_invalidated: &InvalidatedInputs::new(),
            inputs: &inputs,
            jobs: &jobs,
            output_file_map: &map,
            fs: &fs,
            reporter: &NullReporter,
            always_rebuild_dependents: false,
        })
        .unwrap();

        assert!(wave.scheduled_inputs.contains(Path::new("b.swift")));
        assert!(!wave.skipped_compile_jobs.contains_key(Path::new("b.swift")));
    }

    #[test]
    fn cascading_status_schedules_dependents() {
        let inputs = inputs();
        let jobs = jobs_for(&inputs);
        let map = map_for(&inputs);
        let t = TimePoint::new(100, 0);
        let fs = fs_with_everything(&inputs, &map, t);
        let mut record = record_all_up_to_date(&inputs, t);
        record
            .input_infos
            .insert("a.swift".into(), InputInfo::new(InputStatus::NeedsCascadingBuild, t));
        // b uses what a provides; c is unrelated
        let mut graph = graph_with_inputs(&inputs, &map);
        integrate_chain(&mut graph);

        let wave = compute_first_wave(FirstWaveContext {
            graph: &mut graph,
            record: &record,
            externally_invalidated: &InvalidatedInputs::new(),
            inputs: &inputs,
            jobs: &jobs,
            output_file_map: &map,
            fs: &fs,
            reporter: &NullReporter,
            always_rebuild_dependents: false,
        })
        .unwrap();

        assert!(wave.scheduled_inputs.contains(Path::new("a.swift")));
        assert!(wave.scheduled_inputs.contains(Path::new("b.swift")), "{wave:?}");
        assert!(wave.skipped_compile_jobs.contains_key(Path::new("c.swift")));
    }

    fn graph_with_inputs(inputs: &[PathBuf], map: &OutputFileMap) -> ModuleDependencyGraph {
        let mut graph = ModuleDependencyGraph::new(Phase::UpdatingAfterCompilation);
        graph
            .populate_input_dependency_source_map(
                inputs,
                map,
                crate::graph::MapPopulationPurpose::ReadingPriors,
            )
            .unwrap();
        // give every input at least its synthetic file nodes
        for input in inputs {
            let stem = input.file_stem().unwrap().to_string_lossy().into_owned();
            let per_file = crate::graph::testing::file_graph(
                &mut graph.strings,
                &input.to_string_lossy(),
                "fp",
                &[],
                &[],
            );
            let source = crate::keys::DependencySource::new(
                Path::new(&format!("build/{stem}.swiftdeps")),
                &mut graph.strings,
            )
            .unwrap();
            crate::graph::integrate::integrate(&mut graph, &per_file, source).unwrap();
        }
        graph.ensure_graph_will_retrace();
        graph
    }

    /// a provides `base`, b uses it.
    fn integrate_chain(graph: &mut ModuleDependencyGraph) {
        let a = crate::graph::testing::file_graph(
            &mut graph.strings,
            "a.swift",
            "fpa",
            &[("base", "f0")],
            &[],
        );
        let b = crate::graph::testing::file_graph(
            &mut graph.strings,
            "b.swift",
            "fpb",
            &[],
            &["base"],
        );
        for (name, per_file) in [("a", a), ("b", b)] {
            let source = crate::keys::DependencySource::new(
                Path::new(&format!("build/{name}.swiftdeps")),
                &mut graph.strings,
            )
            .unwrap();
            crate::graph::integrate::integrate(graph, &per_file, source).unwrap();
        }
        graph.ensure_graph_will_retrace();
    }
}
