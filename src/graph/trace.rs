//! Transitive closure over def→use arcs.
//!
//! Tracing marks every visited node so that repeated calls during one build
//! do no redundant work and two waves cannot double-schedule an input. The
//! marks survive until [`ModuleDependencyGraph::ensure_graph_will_retrace`]
//! explicitly clears them.

use super::{
    DirectlyInvalidatedNodeSet, ModuleDependencyGraph, NodeIndex, TransitivelyInvalidatedNodeSet,
};
use std::collections::VecDeque;

/// Breadth-first walk from `seeds` along def→use arcs.
///
/// Returns every node newly marked traced, the seeds included; nodes traced
/// by an earlier call are skipped along with everything behind them.
pub(crate) fn trace_uses(
    graph: &mut ModuleDependencyGraph,
    seeds: &DirectlyInvalidatedNodeSet,
) -> TransitivelyInvalidatedNodeSet {
    let mut newly_traced = TransitivelyInvalidatedNodeSet::new();
    let mut queue: VecDeque<NodeIndex> = seeds.iter().copied().collect();

    while let Some(index) = queue.pop_front() {
        if graph.nodes.node(index).is_traced {
            continue;
        }
        graph.nodes.node_mut(index).is_traced = true;
        newly_traced.insert(index);

        let key = graph.nodes.node(index).key;
        if let Some(uses) = graph.nodes.uses_of(&key) {
            queue.extend(uses.iter().copied());
        }
    }

    trace!("traced {} node(s) from {} seed(s)", newly_traced.len(), seeds.len());
    newly_traced
}

impl ModuleDependencyGraph {
    /// Clears all traced marks so the next closure computation starts fresh.
    pub fn ensure_graph_will_retrace(&mut self) {
        for slot in &mut self.nodes.nodes {
            if let Some(node) = slot {
                node.is_traced = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{integrate, testing::file_graph, Phase};
    use crate::keys::DependencySource;
    use std::path::Path;

    fn graph_with_chain() -> (ModuleDependencyGraph, DirectlyInvalidatedNodeSet) {
        // a defines `base`; b uses `base` and defines `mid`; c uses `mid`
        let mut graph = ModuleDependencyGraph::new(Phase::UpdatingAfterCompilation);
        for (file, provides, depends) in [
            ("a", &[("base", "f0")][..], &[][..]),
            ("b", &[("mid", "f1")][..], &["base"][..]),
            ("c", &[][..], &["mid"][..]),
        ] {
            let per_file =
                file_graph(&mut graph.strings, &format!("{file}.swift"), "fp", provides, depends);
            let source = DependencySource::new(
                Path::new(&format!("{file}.swiftdeps")),
                &mut graph.strings,
            )
            .unwrap();
            integrate::integrate(&mut graph, &per_file, source).unwrap();
        }
        // seed with what `a` defines
        let source =
            DependencySource::new(Path::new("a.swiftdeps"), &mut graph.strings).unwrap();
        let seeds: DirectlyInvalidatedNodeSet =
            graph.nodes.defs_in(source).unwrap().values().copied().collect();
        (graph, seeds)
    }

    #[test]
    fn trace_reaches_direct_uses() {
        let (mut graph, seeds) = graph_with_chain();
        graph.ensure_graph_will_retrace();
        let traced = trace_uses(&mut graph, &seeds);
        // everything traced is reachable from the seeds
        assert!(traced.is_superset(&seeds));
        // one wave reaches b's direct use of `base` and nothing further;
        // the cascade to c happens across waves, once b's recompiled
        // artifact is re-integrated and traced again
        let touched_sources: std::collections::BTreeSet<String> = traced
            .iter()
            .filter_map(|&i| graph.node(i).definition_location.source())
            .map(|s| s.path_str(graph.strings()).to_string())
            .collect();
        assert!(touched_sources.contains("b.swiftdeps"));
    }

    #[test]
    fn tracing_is_idempotent_until_reset() {
        let (mut graph, seeds) = graph_with_chain();
        graph.ensure_graph_will_retrace();
        let first = trace_uses(&mut graph, &seeds);
        assert!(!first.is_empty());

        let second = trace_uses(&mut graph, &seeds);
        assert!(second.is_empty());

        graph.ensure_graph_will_retrace();
        let third = trace_uses(&mut graph, &seeds);
        assert_eq!(first, third);
    }
}
