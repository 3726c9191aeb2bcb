//! Merging a freshly read per-file graph into the module graph.
//!
//! Integration reconciles what an artifact now says a file provides and uses
//! with what the module graph remembered, and returns the set of nodes the
//! new information directly invalidates. The caller traces that set to
//! discover which inputs must recompile.

use super::{
    DefinitionLocation, DirectlyInvalidatedNodeSet, ModuleDependencyGraph, Node, NodeIndex,
};
use crate::{
    error::{IncrementalError, Result},
    keys::{DeclAspect, DependencyKey, DependencySource, Designator,
        FingerprintedExternalDependency},
    swiftdeps::SourceFileDependencyGraph,
};
use std::collections::HashMap;

/// Integrates `per_file` (just read from `source`) into `graph`.
///
/// The per-file graph's strings must already be interned in the module
/// graph's table; the artifact readers guarantee this when handed the
/// graph's interner.
pub(crate) fn integrate(
    graph: &mut ModuleDependencyGraph,
    per_file: &SourceFileDependencyGraph,
    source: DependencySource,
) -> Result<DirectlyInvalidatedNodeSet> {
    let reintegrating = graph.nodes.defs_in(source).is_some();
    trace!(
        "integrating {} ({} nodes, reintegrating: {reintegrating})",
        source.path_str(&graph.strings),
        per_file.nodes.len(),
    );

    let mut invalidated = DirectlyInvalidatedNodeSet::new();

    // defs the prior state attributed to this source; whatever the incoming
    // file no longer defines disappears at the end
    let mut disappeared: HashMap<DependencyKey, NodeIndex> =
        graph.nodes.defs_in(source).cloned().unwrap_or_default();

    // per-file sequence number -> module graph node, for arc resolution
    let mut node_for_seq: Vec<Option<NodeIndex>> = vec![None; per_file.nodes.len()];

    for (seq, incoming) in per_file.nodes.iter().enumerate() {
        incoming.key.verify()?;
        if incoming.is_provides {
            disappeared.remove(&incoming.key);
            node_for_seq[seq] =
                Some(integrate_def(graph, source, incoming.key, &incoming.fingerprint, &mut invalidated));
        } else if !incoming.key.is_external() {
            // a use-only occurrence; make sure an expat exists so that a
            // definition appearing later has something to promote
            if graph.nodes.nodes_with_key(&incoming.key).is_none() {
                graph.nodes.insert(Node::new(
                    incoming.key,
                    None,
                    DefinitionLocation::Unknown,
                ));
            }
        }
    }

    // def -> use arcs, deduplicated by the multimap
    let mut arc_error = None;
    per_file.for_each_arc(|def_seq, use_seq| {
        if arc_error.is_some() {
            return;
        }
        let def_key = per_file.nodes[def_seq].key;
        match node_for_seq.get(use_seq).copied().flatten() {
            Some(user) => {
                graph.nodes.record_def_use(def_key, user);
            }
            None => {
                arc_error = Some(IncrementalError::NodeMissingFromMap(format!(
                    "use node {use_seq} of {} is not defined by the file",
                    source.path_str(&graph.strings)
                )));
            }
        }
    });
    if let Some(e) = arc_error {
        return Err(e);
    }

    // external dependencies referenced by this file
    for incoming in &per_file.nodes {
        let Designator::ExternalDepend(external) = incoming.key.designator else { continue };
        let fingerprinted =
            FingerprintedExternalDependency::new(external, incoming.fingerprint.clone());
        let is_new = graph.register_external(fingerprinted)?;
        if is_new && graph.phase().should_new_external_dependencies_trigger_invalidation() {
            if let Some(uses) = graph.nodes.uses_of(&incoming.key) {
                invalidated.extend(uses.iter().copied());
            }
        }
    }

    // defs this source no longer provides: their users are invalidated, then
    // the node goes away (its own use arcs first, inside remove)
    for (key, index) in disappeared {
        if let Some(uses) = graph.nodes.uses_of(&key) {
            invalidated.extend(uses.iter().copied());
        }
        invalidated.remove(&index);
        trace!("removing disappeared def {}", key.display(&graph.strings));
        graph.nodes.remove(index);
    }

    Ok(invalidated)
}

/// Integrates one provided key, returning its module-graph node.
///
/// While the graph itself is being reconstructed, defs appearing for the
/// first time are not news and invalidate nothing; only fingerprint changes
/// against remembered state do.
fn integrate_def(
    graph: &mut ModuleDependencyGraph,
    source: DependencySource,
    key: DependencyKey,
    fingerprint: &Option<crate::keys::Fingerprint>,
    invalidated: &mut DirectlyInvalidatedNodeSet,
) -> NodeIndex {
    let is_updating = graph.phase().is_updating();

    // the same file provided it before
    if let Some(existing) = graph.nodes.find(Some(source), &key) {
        if graph.nodes.node(existing).fingerprint != *fingerprint {
            trace!("fingerprint changed for {}", key.display(&graph.strings));
            graph.nodes.node_mut(existing).fingerprint = fingerprint.clone();
            invalidated.insert(existing);
        }
        return existing;
    }

    // an expat: the key was used before its definition was observed; promote
    // it via the replacement protocol, which transfers the def→use arcs
    if let Some(expat) = graph.nodes.find(None, &key) {
        trace!("promoting expat {}", key.display(&graph.strings));
        graph.nodes.set_definition_location(expat, source);
        graph.nodes.node_mut(expat).fingerprint = fingerprint.clone();
        if is_updating {
            invalidated.insert(expat);
        }
        return expat;
    }

    // brand new definition; an interface appearing is new information for
    // anything that may look the name up
    let index = graph.nodes.insert(Node::new(
        key,
        fingerprint.clone(),
        DefinitionLocation::Known(source),
    ));
    if is_updating && key.aspect == DeclAspect::Interface {
        invalidated.insert(index);
    }
    index
}
