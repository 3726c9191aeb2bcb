//! The module dependency graph.
//!
//! Fine-grained definition/use relationships across the whole module,
//! accumulated from per-file dependency artifacts. Nodes live in an arena and
//! every edge is an index; two side structures make lookups fast in both
//! directions: the primary [`TwoDMap`] keyed by `(dependency source, key)`
//! and the def→use [`Multidictionary`] keyed by [`DependencyKey`].

pub mod integrate;
pub mod serialize;
pub mod trace;

use crate::{
    containers::{BidirectionalMap, Multidictionary, TwoDMap},
    error::{IncrementalError, Result},
    fs::FileSystem,
    interner::StringTable,
    keys::{
        DependencyKey, DependencySource, DependencySourceKind, ExternalDependency, Fingerprint,
        FingerprintedExternalDependency,
    },
    output_file_map::OutputFileMap,
    report::Reporter,
    swiftdeps::SourceFileDependencyGraph,
    utils::TimePoint,
};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
};

/// Index of a node in the graph's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIndex(u32);

impl NodeIndex {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Nodes the integrator decided are directly affected by new information.
pub type DirectlyInvalidatedNodeSet = BTreeSet<NodeIndex>;

/// Use nodes reached by tracing def→use arcs from an invalidated seed.
pub type TransitivelyInvalidatedNodeSet = BTreeSet<NodeIndex>;

/// Inputs that must be scheduled for compilation.
pub type InvalidatedInputs = BTreeSet<PathBuf>;

/// Where a node's definition was observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DefinitionLocation {
    /// Defined in the artifact read from this source.
    Known(DependencySource),
    /// Used somewhere, definition not yet observed (an "expat").
    Unknown,
}

impl DefinitionLocation {
    pub fn source(self) -> Option<DependencySource> {
        match self {
            DefinitionLocation::Known(source) => Some(source),
            DefinitionLocation::Unknown => None,
        }
    }
}

/// One declaration facet tracked across the module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub key: DependencyKey,
    pub fingerprint: Option<Fingerprint>,
    pub definition_location: DefinitionLocation,
    /// Set once the node participated in a closure computation this build.
    pub(crate) is_traced: bool,
}

impl Node {
    pub fn new(
        key: DependencyKey,
        fingerprint: Option<Fingerprint>,
        definition_location: DefinitionLocation,
    ) -> Self {
        Self { key, fingerprint, definition_location, is_traced: false }
    }
}

/// Lifecycle stage of the graph, which gates how new information is treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Reconstructing the graph from each input's artifact; no priors.
    BuildingWithoutAPrior,
    /// Deserializing priors left by a previous build.
    UpdatingFromAPrior,
    /// Priors (or the reconstructed graph) loaded; integrating artifacts as
    /// compile jobs finish.
    UpdatingAfterCompilation,
    /// Full rebuild: every input compiles and the graph is populated from
    /// each finished compilation.
    BuildingAfterEachCompilation,
}

impl Phase {
    /// Whether the graph carries prior state that new information can
    /// contradict. While the graph itself is being built, every def and
    /// external is unseen and means nothing.
    pub fn is_updating(self) -> bool {
        match self {
            Phase::UpdatingFromAPrior | Phase::UpdatingAfterCompilation => true,
            Phase::BuildingWithoutAPrior | Phase::BuildingAfterEachCompilation => false,
        }
    }

    /// In the updating phases a previously unseen external dependency is new
    /// information and must invalidate its users.
    pub fn should_new_external_dependencies_trigger_invalidation(self) -> bool {
        self.is_updating()
    }

    /// When every input compiles anyway, invalidation results would be
    /// ignored, so integration skips computing them.
    pub fn is_compiling_all_inputs_no_matter_what(self) -> bool {
        self == Phase::BuildingAfterEachCompilation
    }
}

/// Why the input↔source map is being populated; used in diagnostics.
#[derive(Clone, Copy, Debug)]
pub enum MapPopulationPurpose {
    BuildingFromSwiftDeps,
    ReadingPriors,
}

/// Arena plus the two indices over it.
#[derive(Clone, Debug, Default)]
pub(crate) struct NodeFinder {
    nodes: Vec<Option<Node>>,
    /// Primary index: `(definition source, key) -> node`. Expats live under
    /// `None`.
    node_map: TwoDMap<Option<DependencySource>, DependencyKey, NodeIndex>,
    /// Secondary index for def→use arcs: key of the def -> its use nodes.
    uses_by_def: Multidictionary<DependencyKey, NodeIndex>,
}

impl NodeFinder {
    pub(crate) fn node(&self, index: NodeIndex) -> &Node {
        self.nodes[index.index()].as_ref().expect("index refers to a removed node")
    }

    pub(crate) fn node_mut(&mut self, index: NodeIndex) -> &mut Node {
        self.nodes[index.index()].as_mut().expect("index refers to a removed node")
    }

    pub(crate) fn find(
        &self,
        source: Option<DependencySource>,
        key: &DependencyKey,
    ) -> Option<NodeIndex> {
        self.node_map.get(&source, key).copied()
    }

    /// All nodes carrying `key`, by definition source.
    pub(crate) fn nodes_with_key(
        &self,
        key: &DependencyKey,
    ) -> Option<&HashMap<Option<DependencySource>, NodeIndex>> {
        self.node_map.by_k2(key)
    }

    /// Keys defined by `source`, with their nodes.
    pub(crate) fn defs_in(
        &self,
        source: DependencySource,
    ) -> Option<&HashMap<DependencyKey, NodeIndex>> {
        self.node_map.by_k1(&Some(source))
    }

    pub(crate) fn insert(&mut self, node: Node) -> NodeIndex {
        let index = NodeIndex(self.nodes.len() as u32);
        let coords = node.definition_location.source();
        let key = node.key;
        self.nodes.push(Some(node));
        let displaced = self.node_map.insert(coords, key, index);
        debug_assert!(displaced.is_none(), "inserted over an existing (source, key) node");
        index
    }

    /// Records a def→use arc. Returns `true` if it was new.
    pub(crate) fn record_def_use(&mut self, def: DependencyKey, user: NodeIndex) -> bool {
        self.uses_by_def.insert(def, user)
    }

    pub(crate) fn uses_of(&self, def: &DependencyKey) -> Option<&HashSet<NodeIndex>> {
        self.uses_by_def.get(def)
    }

    /// The replacement protocol: re-keys `index` from its current definition
    /// location to `source`, transferring its def→use arcs untouched (they
    /// are index-based).
    pub(crate) fn set_definition_location(&mut self, index: NodeIndex, source: DependencySource) {
        let (old_coords, key) = {
            let node = self.node(index);
            (node.definition_location.source(), node.key)
        };
        let removed = self.node_map.remove(&old_coords, &key);
        debug_assert_eq!(removed, Some(index));
        self.node_mut(index).definition_location = DefinitionLocation::Known(source);
        self.node_map.insert(Some(source), key, index);
    }

    /// Removes a node. Its arcs must already be gone, except for its own
    /// appearances as a user, which are dropped here.
    pub(crate) fn remove(&mut self, index: NodeIndex) -> Node {
        let node = self.nodes[index.index()].take().expect("node removed twice");
        self.node_map.remove(&node.definition_location.source(), &node.key);
        self.uses_by_def.remove_occurrences_of(&index);
        node
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (NodeIndex, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|node| (NodeIndex(i as u32), node)))
    }

    pub(crate) fn live_count(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn arcs(&self) -> impl Iterator<Item = (&DependencyKey, &HashSet<NodeIndex>)> {
        self.uses_by_def.iter()
    }
}

/// The module-wide dependency graph and its cross-invocation state.
#[derive(Debug)]
pub struct ModuleDependencyGraph {
    pub(crate) strings: StringTable,
    pub(crate) nodes: NodeFinder,
    /// input source file ↔ its dependency artifact.
    pub(crate) input_map: BidirectionalMap<PathBuf, DependencySource>,
    pub(crate) fingerprinted_external_dependencies: HashSet<FingerprintedExternalDependency>,
    phase: Phase,
    /// Phase at construction; kept for diagnostics.
    creation_phase: Phase,
    external_mod_time_cache: HashMap<ExternalDependency, TimePoint>,
}

impl ModuleDependencyGraph {
    pub fn new(phase: Phase) -> Self {
        Self {
            strings: StringTable::new(),
            nodes: NodeFinder::default(),
            input_map: BidirectionalMap::new(),
            fingerprinted_external_dependencies: HashSet::new(),
            phase,
            creation_phase: phase,
            external_mod_time_cache: HashMap::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn creation_phase(&self) -> Phase {
        self.creation_phase
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        trace!("graph phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    pub fn node(&self, index: NodeIndex) -> &Node {
        self.nodes.node(index)
    }

    /// The dependency source whose artifact describes `input`.
    ///
    /// The map is populated up front, so a missing entry means the graph
    /// drifted from the inputs; the caller degrades to a full rebuild.
    pub fn source_required_for(&self, input: &Path) -> Result<DependencySource> {
        debug_assert!(
            self.input_map.contains_key(input),
            "input {} missing from the dependency source map",
            input.display()
        );
        self.input_map.forward(input).copied().ok_or_else(|| {
            IncrementalError::NodeMissingFromMap(format!(
                "no dependency source for input {}",
                input.display()
            ))
        })
    }

    /// The input whose artifact `source` is, if any. `None` indicates drift;
    /// callers fall back to a full rebuild.
    pub fn input_needed_for(&self, source: DependencySource) -> Option<&Path> {
        self.input_map.reverse(&source).map(PathBuf::as_path)
    }

    /// Whether any node is defined by `input`'s artifact.
    pub fn contains_nodes_for_source_file(&self, input: &Path) -> bool {
        self.input_map
            .forward(input)
            .and_then(|source| self.nodes.defs_in(*source))
            .is_some_and(|defs| !defs.is_empty())
    }

    /// Fills the input↔artifact map from the output file map. Every input
    /// must have a dependencies entry.
    pub fn populate_input_dependency_source_map(
        &mut self,
        inputs: &[PathBuf],
        output_file_map: &OutputFileMap,
        purpose: MapPopulationPurpose,
    ) -> Result<()> {
        trace!("populating input map for {} inputs ({purpose:?})", inputs.len());
        for input in inputs {
            let artifact = output_file_map
                .dependencies_file(input)
                .ok_or_else(|| IncrementalError::NoDependenciesEntry(input.clone()))?;
            let source = DependencySource::new(artifact, &mut self.strings)?;
            self.input_map.insert(input.clone(), source);
        }
        Ok(())
    }

    /// Registers an external dependency. Returns `true` if it was not known
    /// before.
    pub(crate) fn register_external(
        &mut self,
        external: FingerprintedExternalDependency,
    ) -> Result<bool> {
        external.validate(&self.strings)?;
        Ok(self.fingerprinted_external_dependencies.insert(external))
    }

    /// The memoised modification time of an external dependency.
    pub(crate) fn external_mod_time(
        &mut self,
        external: ExternalDependency,
        fs: &dyn FileSystem,
    ) -> TimePoint {
        if let Some(&cached) = self.external_mod_time_cache.get(&external) {
            return cached;
        }
        let path = Path::new(self.strings.resolve(external.path_id())).to_path_buf();
        let time = fs.mod_time_or_distant_future(&path);
        self.external_mod_time_cache.insert(external, time);
        time
    }

    /// Reads and integrates `input`'s dependency artifact, returning the
    /// invalidated inputs it implies. Entry point of the second wave.
    pub fn collect_inputs_requiring_compilation_by_compiling(
        &mut self,
        input: &Path,
        fs: &dyn FileSystem,
    ) -> Result<InvalidatedInputs> {
        let source = self.source_required_for(input)?;
        let artifact = PathBuf::from(source.path_str(&self.strings));
        let bytes =
            fs.read(&artifact).map_err(|e| IncrementalError::read_failure(&artifact, e))?;
        let per_file = SourceFileDependencyGraph::read(&bytes, source, &mut self.strings)?;
        let invalidated = integrate::integrate(self, &per_file, source)?;
        if self.phase.is_compiling_all_inputs_no_matter_what() {
            return Ok(InvalidatedInputs::new());
        }
        let traced = trace::trace_uses(self, &invalidated);
        self.inputs_of_nodes(traced)
    }

    /// Reads and integrates `input`'s artifact during the initial swiftdeps
    /// scan. New inputs (no artifact on disk yet) short-circuit to an empty
    /// set; so does a graph that compiles everything anyway.
    pub fn collect_inputs_requiring_compilation_from_externals_found_by_compiling(
        &mut self,
        input: &Path,
        fs: &dyn FileSystem,
    ) -> Result<InvalidatedInputs> {
        let source = self.source_required_for(input)?;
        let artifact = PathBuf::from(source.path_str(&self.strings));
        if !fs.exists(&artifact) {
            trace!("no artifact yet for {}, newly added", input.display());
            return Ok(InvalidatedInputs::new());
        }
        let bytes =
            fs.read(&artifact).map_err(|e| IncrementalError::read_failure(&artifact, e))?;
        let per_file = SourceFileDependencyGraph::read(&bytes, source, &mut self.strings)?;
        let invalidated = integrate::integrate(self, &per_file, source)?;
        if self.phase.is_compiling_all_inputs_no_matter_what() {
            return Ok(InvalidatedInputs::new());
        }
        let traced = trace::trace_uses(self, &invalidated);
        self.inputs_of_nodes(traced)
    }

    /// Walks the fingerprinted external dependencies and returns the nodes
    /// directly invalidated by those that changed since `last_build_start`.
    ///
    /// Fingerprinted module summaries are re-integrated precisely through
    /// their incremental section; everything else invalidates all users of
    /// the external's key.
    pub fn collect_nodes_invalidated_by_changed_or_added_externals(
        &mut self,
        last_build_start: TimePoint,
        fs: &dyn FileSystem,
        reporter: &dyn Reporter,
    ) -> DirectlyInvalidatedNodeSet {
        let externals: Vec<FingerprintedExternalDependency> =
            self.fingerprinted_external_dependencies.iter().cloned().collect();
        let mut invalidated = DirectlyInvalidatedNodeSet::new();
        for external in externals {
            let mod_time = self.external_mod_time(external.external, fs);
            if mod_time < last_build_start {
                continue;
            }
            let newly = self.invalidate_nodes_using_external(&external, fs, reporter);
            invalidated.extend(newly);
        }
        invalidated
    }

    fn invalidate_nodes_using_external(
        &mut self,
        external: &FingerprintedExternalDependency,
        fs: &dyn FileSystem,
        reporter: &dyn Reporter,
    ) -> DirectlyInvalidatedNodeSet {
        let path = self.strings.resolve(external.external.path_id()).to_string();

        // a fingerprinted module summary carries its own incremental section;
        // integrating it invalidates exactly what changed
        if external.fingerprint.is_some() && external.external.is_module_summary() {
            match self.integrate_external_summary(&path, fs) {
                Ok(invalidated) => {
                    let names = self.node_names(&invalidated);
                    reporter.report_invalidated(&names, &path, "has changed");
                    return invalidated;
                }
                Err(e) => {
                    trace!("failed to integrate module summary {path}: {e}");
                    // fall through to coarse invalidation
                }
            }
        }

        let key =
            DependencyKey::external(ExternalDependency::from_interned(
                external.external.path_id(),
                &self.strings,
            ));
        let invalidated: DirectlyInvalidatedNodeSet =
            self.nodes.uses_of(&key).map(|uses| uses.iter().copied().collect()).unwrap_or_default();
        let names = self.node_names(&invalidated);
        reporter.report_invalidated(&names, &path, "is newer than the last build");
        invalidated
    }

    fn integrate_external_summary(
        &mut self,
        path: &str,
        fs: &dyn FileSystem,
    ) -> Result<DirectlyInvalidatedNodeSet> {
        let path = PathBuf::from(path);
        let source = DependencySource::new(&path, &mut self.strings)?;
        debug_assert_eq!(source.kind(), DependencySourceKind::SwiftModule);
        let bytes = fs.read(&path).map_err(|e| IncrementalError::read_failure(&path, e))?;
        let per_file = SourceFileDependencyGraph::read(&bytes, source, &mut self.strings)?;
        integrate::integrate(self, &per_file, source)
    }

    /// All other inputs transitively using anything `input` defines.
    pub fn collect_inputs_invalidated_by(&mut self, input: &Path) -> Result<InvalidatedInputs> {
        let source = self.source_required_for(input)?;
        let seeds: DirectlyInvalidatedNodeSet = self
            .nodes
            .defs_in(source)
            .map(|defs| defs.values().copied().collect())
            .unwrap_or_default();
        let traced = trace::trace_uses(self, &seeds);
        let mut inputs = self.inputs_of_nodes(traced)?;
        inputs.remove(input);
        Ok(inputs)
    }

    /// Maps invalidated nodes back to the inputs that must recompile.
    ///
    /// Nodes defined by module summaries are not inputs and are skipped; a
    /// swiftdeps-defined node whose source has no input is drift and errors.
    pub(crate) fn inputs_of_nodes(
        &self,
        nodes: impl IntoIterator<Item = NodeIndex>,
    ) -> Result<InvalidatedInputs> {
        let mut inputs = InvalidatedInputs::new();
        for index in nodes {
            let node = self.nodes.node(index);
            let source = match node.definition_location {
                DefinitionLocation::Known(source) => source,
                // a traced use node must have a known location; treat the
                // violation as recoverable drift
                DefinitionLocation::Unknown => {
                    return Err(IncrementalError::UnexpectedInternalState(format!(
                        "invalidated use node {} has no definition location",
                        node.key.display(&self.strings)
                    )))
                }
            };
            match source.kind() {
                DependencySourceKind::SwiftModule => continue,
                DependencySourceKind::SwiftDeps => match self.input_needed_for(source) {
                    Some(input) => {
                        inputs.insert(input.to_path_buf());
                    }
                    None => {
                        return Err(IncrementalError::NodeMissingFromMap(format!(
                            "dependency source {} has no input",
                            source.path_str(&self.strings)
                        )))
                    }
                },
            }
        }
        Ok(inputs)
    }

    /// Display names for a node set, for remarks.
    pub(crate) fn node_names(&self, nodes: &DirectlyInvalidatedNodeSet) -> Vec<String> {
        nodes
            .iter()
            .map(|&index| self.nodes.node(index).key.display(&self.strings).to_string())
            .collect()
    }

    /// Checks the graph's internal invariants.
    ///
    /// In release builds a violation is reported as a recoverable
    /// format-style error; debug builds abort on the same condition.
    pub fn verify(&self) -> Result<()> {
        // primary index and arena agree
        let mut mapped = 0usize;
        for (source, key, &index) in self.nodes.node_map.iter() {
            mapped += 1;
            let node = self.nodes.nodes.get(index.index()).and_then(Option::as_ref).ok_or_else(
                || {
                    IncrementalError::UnexpectedInternalState(format!(
                        "index {index:?} in the node map refers to a removed node"
                    ))
                },
            )?;
            if node.definition_location.source() != *source || node.key != *key {
                return Err(IncrementalError::UnexpectedInternalState(format!(
                    "node {} is filed under the wrong coordinates",
                    node.key.display(&self.strings)
                )));
            }
        }
        if mapped != self.nodes.live_count() {
            return Err(IncrementalError::UnexpectedInternalState(
                "node map and arena disagree about the live node count".into(),
            ));
        }
        if !self.nodes.node_map.is_consistent() {
            return Err(IncrementalError::UnexpectedInternalState(
                "the two mirrors of the node map diverged".into(),
            ));
        }

        // every use is live, findable under its coordinates, and has a
        // known definition location
        for (_, users) in self.nodes.arcs() {
            for &user in users {
                let node =
                    self.nodes.nodes.get(user.index()).and_then(Option::as_ref).ok_or_else(
                        || {
                            IncrementalError::UnexpectedInternalState(
                                "a use arc refers to a removed node".into(),
                            )
                        },
                    )?;
                let source = match node.definition_location {
                    DefinitionLocation::Known(source) => Some(source),
                    DefinitionLocation::Unknown => {
                        return Err(IncrementalError::UnexpectedInternalState(format!(
                            "use node {} has no definition location",
                            node.key.display(&self.strings)
                        )))
                    }
                };
                if self.nodes.find(source, &node.key) != Some(user) {
                    return Err(IncrementalError::UnexpectedInternalState(format!(
                        "use node {} is not indexed under its coordinates",
                        node.key.display(&self.strings)
                    )));
                }
            }
        }

        for external in &self.fingerprinted_external_dependencies {
            external.validate(&self.strings)?;
        }
        Ok(())
    }

    /// Structural equality across graphs with different interners: compares
    /// the node set, the input↔source map and the external-dependency set.
    pub fn matches(&self, other: &Self) -> bool {
        let canon = |graph: &Self| -> BTreeSet<(u64, u64, String, String, Option<String>, Option<String>)> {
            graph
                .nodes
                .iter()
                .map(|(_, node)| {
                    (
                        node.key.designator.kind_code(),
                        node.key.aspect.code(),
                        graph.strings.resolve(node.key.designator.context()).to_string(),
                        graph.strings.resolve(node.key.designator.name()).to_string(),
                        node.fingerprint.as_ref().map(|f| f.as_str().to_string()),
                        node.definition_location
                            .source()
                            .map(|s| s.path_str(&graph.strings).to_string()),
                    )
                })
                .collect()
        };
        let canon_arcs = |graph: &Self| -> BTreeSet<(String, String)> {
            graph
                .nodes
                .arcs()
                .flat_map(|(def, users)| {
                    let def_repr = format!("{}", def.display(&graph.strings));
                    users.iter().map(move |&user| {
                        (
                            def_repr.clone(),
                            format!("{}", graph.nodes.node(user).key.display(&graph.strings)),
                        )
                    })
                })
                .collect()
        };
        let canon_inputs = |graph: &Self| -> BTreeSet<(PathBuf, String)> {
            graph
                .input_map
                .iter()
                .map(|(input, source)| (input.clone(), source.path_str(&graph.strings).to_string()))
                .collect()
        };
        let canon_externals = |graph: &Self| -> BTreeSet<(String, Option<String>)> {
            graph
                .fingerprinted_external_dependencies
                .iter()
                .map(|e| {
                    (
                        e.external.path_str(&graph.strings).to_string(),
                        e.fingerprint.as_ref().map(|f| f.as_str().to_string()),
                    )
                })
                .collect()
        };
        canon(self) == canon(other)
            && canon_arcs(self) == canon_arcs(other)
            && canon_inputs(self) == canon_inputs(other)
            && canon_externals(self) == canon_externals(other)
    }
}
