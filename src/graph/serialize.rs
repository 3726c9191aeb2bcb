//! Persisting the module dependency graph ("priors").
//!
//! The on-disk layout is one application block in the bitstream container:
//! metadata, the identifier table, the input↔artifact map, one record per
//! node, the def→use arcs (one `dependsOn` record naming the def key followed
//! by a run of `useID` records), and the external-dependency set.

use super::{
    DefinitionLocation, ModuleDependencyGraph, Node, NodeIndex, Phase,
};
use crate::{
    bitstream::{
        read_bitstream, Abbreviation, BitstreamError, BitstreamVisitor, BitstreamWriter, Operand,
        Record, FIRST_APPLICATION_BLOCK_ID,
    },
    error::{GraphFormatVersion, IncrementalError, Result},
    fs::FileSystem,
    keys::{
        DeclAspect, DependencyKey, DependencySource, Designator, ExternalDependency, Fingerprint,
        FingerprintedExternalDependency,
    },
    swiftdeps::LocalIdentifierTable,
    utils::TimePoint,
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

/// Four-byte ASCII signature of serialized module dependency graphs.
pub const MODULE_DEP_GRAPH_SIGNATURE: u32 = u32::from_le_bytes(*b"DDEP");

/// Format version written and accepted.
pub const GRAPH_VERSION: GraphFormatVersion = (1, 0);

mod record {
    pub const METADATA: u64 = 1;
    pub const MODULE_DEP_GRAPH_NODE: u64 = 2;
    pub const DEPENDS_ON_NODE: u64 = 3;
    pub const USE_ID_NODE: u64 = 4;
    pub const EXTERNAL_DEP_NODE: u64 = 5;
    pub const IDENTIFIER_NODE: u64 = 6;
    pub const MAP_NODE: u64 = 7;
}

impl ModuleDependencyGraph {
    /// Serializes the graph.
    pub fn to_bytes(&self, compiler_version: &str) -> Vec<u8> {
        let mut writer = BitstreamWriter::new(MODULE_DEP_GRAPH_SIGNATURE);
        writer.enter_subblock(FIRST_APPLICATION_BLOCK_ID, 8);

        let metadata_abbrev = writer
            .define_abbreviation(&Abbreviation::new(vec![
                Operand::Literal(record::METADATA),
                Operand::Fixed(16),
                Operand::Fixed(16),
                Operand::Blob,
            ]))
            .expect("static abbreviation");
        let node_abbrev = writer
            .define_abbreviation(&Abbreviation::new(vec![
                Operand::Literal(record::MODULE_DEP_GRAPH_NODE),
                Operand::Fixed(3),
                Operand::Fixed(1),
                Operand::Vbr(13),
                Operand::Vbr(13),
                Operand::Fixed(1),
                Operand::Vbr(13),
                Operand::Fixed(1),
                Operand::Blob,
            ]))
            .expect("static abbreviation");
        let depends_abbrev = writer
            .define_abbreviation(&Abbreviation::new(vec![
                Operand::Literal(record::DEPENDS_ON_NODE),
                Operand::Fixed(3),
                Operand::Fixed(1),
                Operand::Vbr(13),
                Operand::Vbr(13),
            ]))
            .expect("static abbreviation");
        let use_abbrev = writer
            .define_abbreviation(&Abbreviation::new(vec![
                Operand::Literal(record::USE_ID_NODE),
                Operand::Vbr(13),
            ]))
            .expect("static abbreviation");
        let external_abbrev = writer
            .define_abbreviation(&Abbreviation::new(vec![
                Operand::Literal(record::EXTERNAL_DEP_NODE),
                Operand::Vbr(13),
                Operand::Fixed(1),
                Operand::Blob,
            ]))
            .expect("static abbreviation");
        let identifier_abbrev = writer
            .define_abbreviation(&Abbreviation::new(vec![
                Operand::Literal(record::IDENTIFIER_NODE),
                Operand::Blob,
            ]))
            .expect("static abbreviation");
        let map_abbrev = writer
            .define_abbreviation(&Abbreviation::new(vec![
                Operand::Literal(record::MAP_NODE),
                Operand::Vbr(13),
                Operand::Vbr(13),
            ]))
            .expect("static abbreviation");

        writer
            .emit_record(
                metadata_abbrev,
                record::METADATA,
                &[GRAPH_VERSION.0 as u64, GRAPH_VERSION.1 as u64],
                Some(compiler_version.as_bytes()),
            )
            .expect("metadata layout is static");

        // deterministic orders: nodes by arena index, inputs and externals by
        // resolved path
        let nodes: Vec<(NodeIndex, &Node)> = self.nodes.iter().collect();
        let seq_of_node: HashMap<NodeIndex, u64> =
            nodes.iter().enumerate().map(|(seq, (index, _))| (*index, seq as u64)).collect();
        let mut inputs: Vec<(&PathBuf, &DependencySource)> = self.input_map.iter().collect();
        inputs.sort_by(|a, b| a.0.cmp(b.0));
        let mut externals: Vec<&FingerprintedExternalDependency> =
            self.fingerprinted_external_dependencies.iter().collect();
        externals.sort_by_key(|e| self.strings.resolve(e.external.path_id()));
        let mut arcs: Vec<(&DependencyKey, Vec<u64>)> = self
            .nodes
            .arcs()
            .map(|(def, users)| {
                let mut seqs: Vec<u64> =
                    users.iter().filter_map(|user| seq_of_node.get(user).copied()).collect();
                seqs.sort_unstable();
                (def, seqs)
            })
            .collect();
        arcs.sort_by_key(|(def, _)| {
            (
                def.designator.kind_code(),
                def.aspect.code(),
                self.strings.resolve(def.designator.context()),
                self.strings.resolve(def.designator.name()),
            )
        });

        // the identifier table covers every string any record references
        let mut identifiers = LocalIdentifierTable::default();
        for (_, node) in &nodes {
            identifiers.id_for(self.strings.resolve(node.key.designator.context()));
            identifiers.id_for(self.strings.resolve(node.key.designator.name()));
            if let Some(source) = node.definition_location.source() {
                identifiers.id_for(source.path_str(&self.strings));
            }
        }
        for (def, _) in &arcs {
            identifiers.id_for(self.strings.resolve(def.designator.context()));
            identifiers.id_for(self.strings.resolve(def.designator.name()));
        }
        for (input, source) in &inputs {
            identifiers.id_for(&input.to_string_lossy());
            identifiers.id_for(source.path_str(&self.strings));
        }
        for external in &externals {
            identifiers.id_for(self.strings.resolve(external.external.path_id()));
        }
        for identifier in &identifiers.in_order {
            writer
                .emit_record(
                    identifier_abbrev,
                    record::IDENTIFIER_NODE,
                    &[],
                    Some(identifier.as_bytes()),
                )
                .expect("identifier layout is static");
        }

        for (input, source) in &inputs {
            let input_id = identifiers.id_for(&input.to_string_lossy());
            let source_id = identifiers.id_for(source.path_str(&self.strings));
            writer
                .emit_record(map_abbrev, record::MAP_NODE, &[input_id, source_id], None)
                .expect("map layout is static");
        }

        for (_, node) in &nodes {
            let context = identifiers.id_for(self.strings.resolve(node.key.designator.context()));
            let name = identifiers.id_for(self.strings.resolve(node.key.designator.name()));
            let (has_source, source_id) = match node.definition_location.source() {
                Some(source) => (1, identifiers.id_for(source.path_str(&self.strings))),
                None => (0, 0),
            };
            let fingerprint =
                node.fingerprint.as_ref().map(|f| f.as_str().as_bytes()).unwrap_or_default();
            writer
                .emit_record(
                    node_abbrev,
                    record::MODULE_DEP_GRAPH_NODE,
                    &[
                        node.key.designator.kind_code(),
                        node.key.aspect.code(),
                        context,
                        name,
                        has_source,
                        source_id,
                        node.fingerprint.is_some() as u64,
                    ],
                    Some(fingerprint),
                )
                .expect("node layout is static");
        }

        for (def, users) in arcs {
            let context = identifiers.id_for(self.strings.resolve(def.designator.context()));
            let name = identifiers.id_for(self.strings.resolve(def.designator.name()));
            writer
                .emit_record(
                    depends_abbrev,
                    record::DEPENDS_ON_NODE,
                    &[def.designator.kind_code(), def.aspect.code(), context, name],
                    None,
                )
                .expect("depends-on layout is static");
            for user in users {
                writer
                    .emit_record(use_abbrev, record::USE_ID_NODE, &[user], None)
                    .expect("use-id layout is static");
            }
        }

        for external in &externals {
            let path = identifiers.id_for(self.strings.resolve(external.external.path_id()));
            let fingerprint =
                external.fingerprint.as_ref().map(|f| f.as_str().as_bytes()).unwrap_or_default();
            writer
                .emit_record(
                    external_abbrev,
                    record::EXTERNAL_DEP_NODE,
                    &[path, external.fingerprint.is_some() as u64],
                    Some(fingerprint),
                )
                .expect("external-dep layout is static");
        }

        writer.end_block();
        writer.into_bytes()
    }

    /// Deserializes a graph; its phase starts at
    /// [`Phase::UpdatingFromAPrior`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut visitor = GraphVisitor::new();
        read_bitstream(bytes, &mut visitor)?;
        visitor.finish()
    }

    /// Writes the graph to `path`.
    pub fn write_to_path(
        &self,
        path: &Path,
        compiler_version: &str,
        fs: &dyn FileSystem,
    ) -> Result<()> {
        let bytes = self.to_bytes(compiler_version);
        fs.write(path, &bytes).map_err(|e| IncrementalError::write_failure(path, e))?;
        debug!("wrote dependency graph to {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    /// Reads priors from `path`, rejecting files modified after
    /// `build_start_time` (clock skew or concurrent writers).
    pub fn read_from_path(
        path: &Path,
        build_start_time: TimePoint,
        fs: &dyn FileSystem,
    ) -> Result<Self> {
        let priors_mod_time = fs
            .mod_time(path)
            .map_err(|e| IncrementalError::read_failure(path, e))?;
        if priors_mod_time > build_start_time {
            return Err(IncrementalError::TimeTravellingPriors {
                priors_mod_time,
                build_start_time,
            });
        }
        let bytes = fs.read(path).map_err(|e| IncrementalError::read_failure(path, e))?;
        Self::from_bytes(&bytes).map_err(|e| match e {
            IncrementalError::Bitstream(BitstreamError::InvalidSignature(_)) => {
                IncrementalError::BadMagic(path.to_path_buf())
            }
            other => other,
        })
    }
}

#[derive(Clone, Copy, Debug)]
struct RawKeyParts {
    kind: u64,
    aspect: u64,
    context: usize,
    name: usize,
}

#[derive(Debug)]
struct RawGraphNode {
    parts: RawKeyParts,
    source: Option<usize>,
    fingerprint: Option<String>,
}

#[derive(Default)]
struct GraphVisitor {
    metadata: Option<String>,
    identifiers: Vec<String>,
    raw_nodes: Vec<RawGraphNode>,
    current_def: Option<RawKeyParts>,
    arcs: Vec<(RawKeyParts, u64)>,
    externals: Vec<(usize, Option<String>)>,
    map_entries: Vec<(usize, usize)>,
}

impl GraphVisitor {
    fn key_from_parts(
        &self,
        parts: RawKeyParts,
        graph: &mut ModuleDependencyGraph,
    ) -> Result<DependencyKey> {
        let context = self
            .identifiers
            .get(parts.context)
            .ok_or(IncrementalError::BogusNameOrContext)?
            .clone();
        let name =
            self.identifiers.get(parts.name).ok_or(IncrementalError::BogusNameOrContext)?.clone();
        let context = graph.strings.intern(&context);
        let name = graph.strings.intern(&name);
        let designator = Designator::from_parts(parts.kind, context, name, &graph.strings)?;
        let key = DependencyKey::new(DeclAspect::from_code(parts.aspect)?, designator);
        key.verify()?;
        Ok(key)
    }

    fn finish(self) -> Result<ModuleDependencyGraph> {
        if self.metadata.is_none() {
            return Err(IncrementalError::MalformedMetadataRecord);
        }
        let mut graph = ModuleDependencyGraph::new(Phase::UpdatingFromAPrior);

        let mut index_of_seq: Vec<NodeIndex> = Vec::with_capacity(self.raw_nodes.len());
        for raw in &self.raw_nodes {
            let key = self.key_from_parts(raw.parts, &mut graph)?;
            let location = match raw.source {
                Some(idx) => {
                    let path = self
                        .identifiers
                        .get(idx)
                        .ok_or(IncrementalError::BogusNameOrContext)?
                        .clone();
                    let id = graph.strings.intern(&path);
                    DefinitionLocation::Known(DependencySource::from_interned(
                        id,
                        &graph.strings,
                    )?)
                }
                None => DefinitionLocation::Unknown,
            };
            if graph.nodes.find(location.source(), &key).is_some() {
                return Err(IncrementalError::UnexpectedInternalState(format!(
                    "duplicate node {} in serialized graph",
                    key.display(&graph.strings)
                )));
            }
            let fingerprint = raw.fingerprint.as_deref().map(Fingerprint::new);
            index_of_seq.push(graph.nodes.insert(Node::new(key, fingerprint, location)));
        }

        for (parts, use_seq) in &self.arcs {
            let def = self.key_from_parts(*parts, &mut graph)?;
            let user = index_of_seq.get(*use_seq as usize).copied().ok_or_else(|| {
                IncrementalError::NodeMissingFromMap(format!(
                    "use id {use_seq} is out of range"
                ))
            })?;
            graph.nodes.record_def_use(def, user);
        }

        for (input_idx, source_idx) in &self.map_entries {
            let input = self
                .identifiers
                .get(*input_idx)
                .ok_or(IncrementalError::BogusNameOrContext)?
                .clone();
            let source_path = self
                .identifiers
                .get(*source_idx)
                .ok_or(IncrementalError::BogusNameOrContext)?
                .clone();
            let id = graph.strings.intern(&source_path);
            let source = DependencySource::from_interned(id, &graph.strings)?;
            graph.input_map.insert(PathBuf::from(input), source);
        }

        for (path_idx, fingerprint) in &self.externals {
            let path = self
                .identifiers
                .get(*path_idx)
                .ok_or(IncrementalError::BogusNameOrContext)?
                .clone();
            let external = ExternalDependency::new(&path, &mut graph.strings);
            let fingerprinted = FingerprintedExternalDependency::new(
                external,
                fingerprint.as_deref().map(Fingerprint::new),
            );
            fingerprinted.validate(&graph.strings)?;
            graph.fingerprinted_external_dependencies.insert(fingerprinted);
        }

        graph.verify()?;
        Ok(graph)
    }
}

impl BitstreamVisitor for GraphVisitor {
    type Error = IncrementalError;

    fn validate_signature(&mut self, signature: u32) -> Result<()> {
        if signature != MODULE_DEP_GRAPH_SIGNATURE {
            return Err(BitstreamError::InvalidSignature(signature).into());
        }
        Ok(())
    }

    fn should_enter_block(&mut self, id: u64) -> Result<bool> {
        Ok(id == FIRST_APPLICATION_BLOCK_ID)
    }

    fn did_exit_block(&mut self) -> Result<()> {
        Ok(())
    }

    fn visit(&mut self, record: &Record) -> Result<()> {
        match record.id {
            record::METADATA => {
                if self.metadata.is_some() || record.fields.len() < 2 {
                    return Err(IncrementalError::MalformedMetadataRecord);
                }
                let read = (record.fields[0] as u16, record.fields[1] as u16);
                if read != GRAPH_VERSION {
                    return Err(IncrementalError::MismatchedSerializedGraphVersion {
                        expected: GRAPH_VERSION,
                        read,
                    });
                }
                self.metadata =
                    Some(String::from_utf8_lossy(record.blob_bytes()).into_owned());
            }
            record::MODULE_DEP_GRAPH_NODE => {
                if record.fields.len() < 7 {
                    return Err(IncrementalError::UnknownRecord(record.id));
                }
                let parts = RawKeyParts {
                    kind: record.fields[0],
                    aspect: record.fields[1],
                    context: record.fields[2] as usize,
                    name: record.fields[3] as usize,
                };
                let source = (record.fields[4] != 0).then_some(record.fields[5] as usize);
                let fingerprint = if record.fields[6] != 0 {
                    Some(
                        std::str::from_utf8(record.blob_bytes())
                            .map_err(|_| IncrementalError::MalformedFingerprintRecord)?
                            .to_string(),
                    )
                } else {
                    None
                };
                self.raw_nodes.push(RawGraphNode { parts, source, fingerprint });
            }
            record::DEPENDS_ON_NODE => {
                if record.fields.len() < 4 {
                    return Err(IncrementalError::UnknownRecord(record.id));
                }
                self.current_def = Some(RawKeyParts {
                    kind: record.fields[0],
                    aspect: record.fields[1],
                    context: record.fields[2] as usize,
                    name: record.fields[3] as usize,
                });
            }
            record::USE_ID_NODE => {
                let def = self.current_def.ok_or_else(|| {
                    IncrementalError::UnexpectedInternalState(
                        "useID record without a preceding dependsOn record".into(),
                    )
                })?;
                self.arcs.push((def, record.field(0)?));
            }
            record::EXTERNAL_DEP_NODE => {
                if record.fields.len() < 2 {
                    return Err(IncrementalError::UnknownRecord(record.id));
                }
                let fingerprint = if record.fields[1] != 0 {
                    Some(
                        std::str::from_utf8(record.blob_bytes())
                            .map_err(|_| IncrementalError::MalformedFingerprintRecord)?
                            .to_string(),
                    )
                } else {
                    None
                };
                self.externals.push((record.fields[0] as usize, fingerprint));
            }
            record::IDENTIFIER_NODE => {
                self.identifiers
                    .push(String::from_utf8_lossy(record.blob_bytes()).into_owned());
            }
            record::MAP_NODE => {
                if record.fields.len() < 2 {
                    return Err(IncrementalError::UnknownRecord(record.id));
                }
                self.map_entries
                    .push((record.fields[0] as usize, record.fields[1] as usize));
            }
            other => return Err(IncrementalError::UnknownRecord(other)),
        }
        Ok(())
    }
}

impl GraphVisitor {
    fn new() -> Self {
        Self {
            // identifier 0 is the empty string
            identifiers: vec![String::new()],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;
    use crate::graph::{integrate, testing::file_graph};
    use pretty_assertions::assert_eq;

    fn populated_graph() -> ModuleDependencyGraph {
        let mut graph = ModuleDependencyGraph::new(Phase::UpdatingAfterCompilation);
        let a = file_graph(&mut graph.strings, "a.swift", "fpa", &[("base", "f0")], &[]);
        let b = file_graph(&mut graph.strings, "b.swift", "fpb", &[("mid", "f1")], &["base"]);
        for (name, per_file) in [("a", a), ("b", b)] {
            let source = DependencySource::new(
                Path::new(&format!("build/{name}.swiftdeps")),
                &mut graph.strings,
            )
            .unwrap();
            integrate::integrate(&mut graph, &per_file, source).unwrap();
            graph.input_map.insert(PathBuf::from(format!("{name}.swift")), source);
        }
        let external =
            ExternalDependency::new("lib/Foreign.swiftmodule", &mut graph.strings);
        graph
            .fingerprinted_external_dependencies
            .insert(FingerprintedExternalDependency::new(external, Some(Fingerprint::new("x1"))));
        graph.verify().unwrap();
        graph
    }

    #[test]
    fn roundtrip_matches() {
        let graph = populated_graph();
        let bytes = graph.to_bytes("test swiftc 5.7");
        let decoded = ModuleDependencyGraph::from_bytes(&bytes).unwrap();
        assert!(graph.matches(&decoded), "decoded graph differs from the original");
        assert_eq!(decoded.phase(), Phase::UpdatingFromAPrior);
        decoded.verify().unwrap();
    }

    #[test]
    fn serialization_is_deterministic() {
        let graph = populated_graph();
        assert_eq!(graph.to_bytes("v"), graph.to_bytes("v"));
    }

    #[test]
    fn version_mismatch_is_detected() {
        let mut writer = BitstreamWriter::new(MODULE_DEP_GRAPH_SIGNATURE);
        writer.enter_subblock(FIRST_APPLICATION_BLOCK_ID, 8);
        writer.emit_unabbreviated_record(record::METADATA, &[2, 0]);
        writer.end_block();
        let err = ModuleDependencyGraph::from_bytes(&writer.into_bytes()).unwrap_err();
        assert!(matches!(
            err,
            IncrementalError::MismatchedSerializedGraphVersion { expected: (1, 0), read: (2, 0) }
        ));
    }

    #[test]
    fn bad_magic_is_reported_with_the_path() {
        let fs = MemoryFileSystem::new();
        fs.add("stale.priors", b"not a bitstream at all".to_vec(), TimePoint::new(1, 0));
        let err = ModuleDependencyGraph::read_from_path(
            Path::new("stale.priors"),
            TimePoint::new(100, 0),
            &fs,
        )
        .unwrap_err();
        assert!(matches!(err, IncrementalError::BadMagic(_)));
    }

    #[test]
    fn time_travelling_priors_are_rejected() {
        let graph = populated_graph();
        let fs = MemoryFileSystem::new();
        fs.add("g.priors", graph.to_bytes("v"), TimePoint::new(200, 0));
        let err = ModuleDependencyGraph::read_from_path(
            Path::new("g.priors"),
            TimePoint::new(100, 0),
            &fs,
        )
        .unwrap_err();
        assert!(matches!(err, IncrementalError::TimeTravellingPriors { .. }));
    }
}
