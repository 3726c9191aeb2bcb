//! Reading per-file dependency artifacts.
//!
//! Every frontend compilation leaves a `.swiftdeps` artifact describing what
//! the file provides and depends on. Binary module summaries embed the same
//! record set in an incremental section nested inside the module block. Both
//! use the bitstream container of [`crate::bitstream`].
//!
//! A writer dual is provided so that drivers and tests can fabricate
//! artifacts without a frontend.

use crate::{
    bitstream::{
        read_bitstream, Abbreviation, BitstreamError, BitstreamVisitor, BitstreamWriter, Operand,
        Record, FIRST_APPLICATION_BLOCK_ID,
    },
    error::{IncrementalError, Result},
    interner::{StringId, StringTable},
    keys::{
        DeclAspect, DependencyKey, DependencySource, DependencySourceKind, Designator, Fingerprint,
    },
};

/// Four-byte ASCII signature of `.swiftdeps` artifacts.
pub const SWIFTDEPS_SIGNATURE: u32 = u32::from_le_bytes(*b"DEPS");

/// Signature marking a binary module summary; its dependency records live in
/// the incremental-information block nested in the module block.
pub const MODULE_SUMMARY_SIGNATURE: u32 = 0x0EA8_9CE2;

/// Top-level block of a module summary.
pub const MODULE_BLOCK_ID: u64 = 8;

/// The incremental-information block nested inside [`MODULE_BLOCK_ID`].
pub const INCREMENTAL_INFORMATION_BLOCK_ID: u64 = 196;

/// Format version this reader understands.
pub const FORMAT_VERSION: (u16, u16) = (1, 0);

mod record {
    pub const METADATA: u64 = 1;
    pub const SOURCE_FILE_DEP_GRAPH_NODE: u64 = 2;
    pub const FINGERPRINT_NODE: u64 = 3;
    pub const DEPENDS_ON_DEFINITION_NODE: u64 = 4;
    pub const IDENTIFIER_NODE: u64 = 5;
}

/// One node of a per-file graph, numbered by appearance order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFileDepGraphNode {
    pub key: DependencyKey,
    pub fingerprint: Option<Fingerprint>,
    /// Whether this file defines the key (as opposed to merely depending on
    /// it).
    pub is_provides: bool,
    /// Sequence numbers of the nodes in this file this node depends on.
    pub defs_i_depend_on: Vec<usize>,
}

/// A decoded per-file dependency graph.
///
/// Positions 0 and 1 are always the synthetic interface and implementation
/// nodes standing for the source file as a whole.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFileDependencyGraph {
    pub major_version: u16,
    pub minor_version: u16,
    pub compiler_version: String,
    pub nodes: Vec<SourceFileDepGraphNode>,
}

impl SourceFileDependencyGraph {
    pub const SOURCE_FILE_INTERFACE_SEQ: usize = 0;
    pub const SOURCE_FILE_IMPLEMENTATION_SEQ: usize = 1;

    /// Decodes the artifact `source` points at from `data`, interning all
    /// strings into `strings`.
    pub fn read(data: &[u8], source: DependencySource, strings: &mut StringTable) -> Result<Self> {
        let mut visitor = ArtifactVisitor::new(source.kind(), strings);
        read_bitstream(data, &mut visitor)?;
        let graph = visitor.finish()?;
        graph.verify()?;
        Ok(graph)
    }

    /// The synthetic whole-file interface node.
    pub fn source_file_interface_node(&self) -> &SourceFileDepGraphNode {
        &self.nodes[Self::SOURCE_FILE_INTERFACE_SEQ]
    }

    /// Calls `f` with every `(def_seq, use_seq)` arc recorded in this file.
    pub fn for_each_arc(&self, mut f: impl FnMut(usize, usize)) {
        for (use_seq, node) in self.nodes.iter().enumerate() {
            for &def_seq in &node.defs_i_depend_on {
                f(def_seq, use_seq);
            }
        }
    }

    fn verify(&self) -> Result<()> {
        if self.nodes.len() < 2 {
            return Err(IncrementalError::UnexpectedInternalState(
                "a per-file graph must contain the two synthetic source-file nodes".into(),
            ));
        }
        for (seq, aspect) in [
            (Self::SOURCE_FILE_INTERFACE_SEQ, DeclAspect::Interface),
            (Self::SOURCE_FILE_IMPLEMENTATION_SEQ, DeclAspect::Implementation),
        ] {
            let node = &self.nodes[seq];
            let good = node.is_provides
                && node.key.aspect == aspect
                && matches!(node.key.designator, Designator::SourceFileProvide { .. });
            if !good {
                return Err(IncrementalError::UnexpectedInternalState(format!(
                    "node {seq} is not the synthetic {aspect} source-file node"
                )));
            }
        }
        for node in &self.nodes {
            node.key.verify()?;
            for &def_seq in &node.defs_i_depend_on {
                if def_seq >= self.nodes.len() {
                    return Err(IncrementalError::NodeMissingFromMap(format!(
                        "dependency on out-of-range node {def_seq}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Encodes this graph as a `.swiftdeps` artifact.
    pub fn to_bytes(&self, strings: &StringTable) -> Vec<u8> {
        let mut writer = BitstreamWriter::new(SWIFTDEPS_SIGNATURE);
        writer.enter_subblock(FIRST_APPLICATION_BLOCK_ID, 5);
        self.emit_records(&mut writer, strings);
        writer.end_block();
        writer.into_bytes()
    }

    /// Encodes this graph as the incremental section of a mock module
    /// summary, the way a compiled `.swiftmodule` carries it.
    pub fn to_module_summary_bytes(&self, strings: &StringTable) -> Vec<u8> {
        let mut writer = BitstreamWriter::new(MODULE_SUMMARY_SIGNATURE);
        writer.enter_subblock(MODULE_BLOCK_ID, 5);
        // a real summary stores the module contents ahead of the incremental
        // section; stand in with an opaque record
        writer.emit_unabbreviated_record(63, &[0]);
        writer.enter_subblock(INCREMENTAL_INFORMATION_BLOCK_ID, 5);
        self.emit_records(&mut writer, strings);
        writer.end_block();
        writer.end_block();
        writer.into_bytes()
    }

    fn emit_records(&self, writer: &mut BitstreamWriter, strings: &StringTable) {
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
                Operand::Literal(record::SOURCE_FILE_DEP_GRAPH_NODE),
                Operand::Fixed(3),
                Operand::Fixed(1),
                Operand::Vbr(13),
                Operand::Vbr(13),
                Operand::Fixed(1),
            ]))
            .expect("static abbreviation");
        let fingerprint_abbrev = writer
            .define_abbreviation(&Abbreviation::new(vec![
                Operand::Literal(record::FINGERPRINT_NODE),
                Operand::Blob,
            ]))
            .expect("static abbreviation");
        let depends_abbrev = writer
            .define_abbreviation(&Abbreviation::new(vec![
                Operand::Literal(record::DEPENDS_ON_DEFINITION_NODE),
                Operand::Vbr(13),
            ]))
            .expect("static abbreviation");
        let identifier_abbrev = writer
            .define_abbreviation(&Abbreviation::new(vec![
                Operand::Literal(record::IDENTIFIER_NODE),
                Operand::Blob,
            ]))
            .expect("static abbreviation");

        writer
            .emit_record(
                metadata_abbrev,
                record::METADATA,
                &[self.major_version as u64, self.minor_version as u64],
                Some(self.compiler_version.as_bytes()),
            )
            .expect("metadata layout is static");

        // identifier 0 is hard-coded empty and never emitted
        let mut local = LocalIdentifierTable::default();
        for node in &self.nodes {
            local.id_for(strings.resolve(node.key.designator.context()));
            local.id_for(strings.resolve(node.key.designator.name()));
        }
        for identifier in &local.in_order {
            writer
                .emit_record(identifier_abbrev, record::IDENTIFIER_NODE, &[], Some(identifier.as_bytes()))
                .expect("identifier layout is static");
        }

        for node in &self.nodes {
            let context = local.id_for(strings.resolve(node.key.designator.context()));
            let name = local.id_for(strings.resolve(node.key.designator.name()));
            writer
                .emit_record(
                    node_abbrev,
                    record::SOURCE_FILE_DEP_GRAPH_NODE,
                    &[
                        node.key.designator.kind_code(),
                        node.key.aspect.code(),
                        context,
                        name,
                        node.is_provides as u64,
                    ],
                    None,
                )
                .expect("node layout is static");
            if let Some(fingerprint) = &node.fingerprint {
                writer
                    .emit_record(
                        fingerprint_abbrev,
                        record::FINGERPRINT_NODE,
                        &[],
                        Some(fingerprint.as_str().as_bytes()),
                    )
                    .expect("fingerprint layout is static");
            }
            for &def_seq in &node.defs_i_depend_on {
                writer
                    .emit_record(
                        depends_abbrev,
                        record::DEPENDS_ON_DEFINITION_NODE,
                        &[def_seq as u64],
                        None,
                    )
                    .expect("depends-on layout is static");
            }
        }
    }
}

/// Assigns dense identifier indices starting at 1; 0 is the empty string.
#[derive(Default)]
pub(crate) struct LocalIdentifierTable {
    pub(crate) in_order: Vec<String>,
    ids: std::collections::HashMap<String, u64>,
}

impl LocalIdentifierTable {
    pub(crate) fn id_for(&mut self, identifier: &str) -> u64 {
        if identifier.is_empty() {
            return 0;
        }
        if let Some(&id) = self.ids.get(identifier) {
            return id;
        }
        self.in_order.push(identifier.to_string());
        let id = self.in_order.len() as u64;
        self.ids.insert(identifier.to_string(), id);
        id
    }
}

/// A node as it appears on the wire, before identifier resolution.
struct RawNode {
    kind_code: u64,
    aspect_code: u64,
    context_index: usize,
    name_index: usize,
    is_provides: bool,
    fingerprint: Option<Fingerprint>,
    defs_i_depend_on: Vec<usize>,
}

struct ArtifactVisitor<'t> {
    kind: DependencySourceKind,
    strings: &'t mut StringTable,
    /// Ids of the blocks the decoder entered, innermost last.
    block_stack: Vec<u64>,
    metadata: Option<(u16, u16, String)>,
    identifiers: Vec<String>,
    raw_nodes: Vec<RawNode>,
}

impl<'t> ArtifactVisitor<'t> {
    fn new(kind: DependencySourceKind, strings: &'t mut StringTable) -> Self {
        Self {
            kind,
            strings,
            block_stack: Vec::new(),
            metadata: None,
            // identifier 0 is the empty string
            identifiers: vec![String::new()],
            raw_nodes: Vec::new(),
        }
    }

    /// Whether records at the current position belong to the dependency
    /// section.
    fn collecting(&self) -> bool {
        match self.kind {
            DependencySourceKind::SwiftDeps => {
                self.block_stack.last() == Some(&FIRST_APPLICATION_BLOCK_ID)
            }
            DependencySourceKind::SwiftModule => {
                self.block_stack.last() == Some(&INCREMENTAL_INFORMATION_BLOCK_ID)
            }
        }
    }

    fn finish(self) -> Result<SourceFileDependencyGraph> {
        let (major, minor, compiler_version) =
            self.metadata.ok_or(IncrementalError::MalformedMetadataRecord)?;
        let identifiers = self.identifiers;
        let mut nodes = Vec::with_capacity(self.raw_nodes.len());
        for raw in self.raw_nodes {
            let context = identifiers
                .get(raw.context_index)
                .ok_or(IncrementalError::BogusNameOrContext)?;
            let name =
                identifiers.get(raw.name_index).ok_or(IncrementalError::BogusNameOrContext)?;
            let context = self.strings.intern(context);
            let name = self.strings.intern(name);
            let designator = Designator::from_parts(raw.kind_code, context, name, self.strings)?;
            let key = DependencyKey::new(DeclAspect::from_code(raw.aspect_code)?, designator);
            nodes.push(SourceFileDepGraphNode {
                key,
                fingerprint: raw.fingerprint,
                is_provides: raw.is_provides,
                defs_i_depend_on: raw.defs_i_depend_on,
            });
        }
        Ok(SourceFileDependencyGraph {
            major_version: major,
            minor_version: minor,
            compiler_version,
            nodes,
        })
    }
}

impl BitstreamVisitor for ArtifactVisitor<'_> {
    type Error = IncrementalError;

    fn validate_signature(&mut self, signature: u32) -> Result<()> {
        let expected = match self.kind {
            DependencySourceKind::SwiftDeps => SWIFTDEPS_SIGNATURE,
            DependencySourceKind::SwiftModule => MODULE_SUMMARY_SIGNATURE,
        };
        if signature != expected {
            return Err(BitstreamError::InvalidSignature(signature).into());
        }
        Ok(())
    }

    fn should_enter_block(&mut self, id: u64) -> Result<bool> {
        let enter = match self.kind {
            DependencySourceKind::SwiftDeps => id == FIRST_APPLICATION_BLOCK_ID,
            DependencySourceKind::SwiftModule => {
                id == MODULE_BLOCK_ID
                    || (self.block_stack.last() == Some(&MODULE_BLOCK_ID)
                        && id == INCREMENTAL_INFORMATION_BLOCK_ID)
            }
        };
        if enter {
            self.block_stack.push(id);
        }
        Ok(enter)
    }

    fn did_exit_block(&mut self) -> Result<()> {
        self.block_stack.pop();
        Ok(())
    }

    fn visit(&mut self, record: &Record) -> Result<()> {
        if !self.collecting() {
            // module-summary records outside the incremental section
            return Ok(());
        }
        match record.id {
            record::METADATA => {
                if self.metadata.is_some() || record.fields.len() < 2 {
                    return Err(IncrementalError::MalformedMetadataRecord);
                }
                let major = record.fields[0] as u16;
                let minor = record.fields[1] as u16;
                if (major, minor) != FORMAT_VERSION {
                    return Err(IncrementalError::MismatchedSerializedGraphVersion {
                        expected: FORMAT_VERSION,
                        read: (major, minor),
                    });
                }
                let compiler_version =
                    String::from_utf8_lossy(record.blob_bytes()).into_owned();
                self.metadata = Some((major, minor, compiler_version));
            }
            record::SOURCE_FILE_DEP_GRAPH_NODE => {
                if self.metadata.is_none() {
                    return Err(IncrementalError::MalformedMetadataRecord);
                }
                if record.fields.len() < 5 {
                    return Err(IncrementalError::UnknownRecord(record.id));
                }
                self.raw_nodes.push(RawNode {
                    kind_code: record.fields[0],
                    aspect_code: record.fields[1],
                    context_index: record.fields[2] as usize,
                    name_index: record.fields[3] as usize,
                    is_provides: record.fields[4] != 0,
                    fingerprint: None,
                    defs_i_depend_on: Vec::new(),
                });
            }
            record::FINGERPRINT_NODE => {
                let node = self
                    .raw_nodes
                    .last_mut()
                    .ok_or(IncrementalError::MalformedFingerprintRecord)?;
                let text = std::str::from_utf8(record.blob_bytes())
                    .map_err(|_| IncrementalError::MalformedFingerprintRecord)?;
                node.fingerprint = Some(Fingerprint::new(text));
            }
            record::DEPENDS_ON_DEFINITION_NODE => {
                let def_seq = record.field(0)? as usize;
                let node = self
                    .raw_nodes
                    .last_mut()
                    .ok_or_else(|| IncrementalError::UnknownRecord(record.id))?;
                node.defs_i_depend_on.push(def_seq);
            }
            record::IDENTIFIER_NODE => {
                self.identifiers
                    .push(String::from_utf8_lossy(record.blob_bytes()).into_owned());
            }
            other => return Err(IncrementalError::UnknownRecord(other)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ExternalDependency;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn sample_graph(strings: &mut StringTable) -> SourceFileDependencyGraph {
        let file = strings.intern("a.swift");
        let top = strings.intern("funcFoo");
        let external = ExternalDependency::new("Foreign.swiftmodule", strings);
        SourceFileDependencyGraph {
            major_version: 1,
            minor_version: 0,
            compiler_version: "Swift 5.7-dev".into(),
            nodes: vec![
                SourceFileDepGraphNode {
                    key: DependencyKey::source_file_provide(DeclAspect::Interface, file),
                    fingerprint: Some(Fingerprint::new("aaaa1111")),
                    is_provides: true,
                    defs_i_depend_on: vec![],
                },
                SourceFileDepGraphNode {
                    key: DependencyKey::source_file_provide(DeclAspect::Implementation, file),
                    fingerprint: Some(Fingerprint::new("aaaa1111")),
                    is_provides: true,
                    defs_i_depend_on: vec![0],
                },
                SourceFileDepGraphNode {
                    key: DependencyKey::new(
                        DeclAspect::Interface,
                        Designator::TopLevel { name: top },
                    ),
                    fingerprint: Some(Fingerprint::new("bbbb2222")),
                    is_provides: true,
                    defs_i_depend_on: vec![],
                },
                SourceFileDepGraphNode {
                    key: DependencyKey::external(external),
                    fingerprint: None,
                    is_provides: false,
                    defs_i_depend_on: vec![],
                },
            ],
        }
    }

    #[test]
    fn swiftdeps_roundtrip() {
        let mut strings = StringTable::new();
        let graph = sample_graph(&mut strings);
        let bytes = graph.to_bytes(&strings);

        let mut read_strings = StringTable::new();
        let source =
            DependencySource::new(Path::new("a.swiftdeps"), &mut read_strings).unwrap();
        let decoded =
            SourceFileDependencyGraph::read(&bytes, source, &mut read_strings).unwrap();

        assert_eq!(decoded.compiler_version, "Swift 5.7-dev");
        assert_eq!(decoded.nodes.len(), graph.nodes.len());
        for (a, b) in decoded.nodes.iter().zip(&graph.nodes) {
            assert_eq!(a.is_provides, b.is_provides);
            assert_eq!(a.fingerprint, b.fingerprint);
            assert_eq!(a.defs_i_depend_on, b.defs_i_depend_on);
            assert_eq!(a.key.aspect, b.key.aspect);
            assert_eq!(a.key.designator.kind_code(), b.key.designator.kind_code());
            assert_eq!(
                read_strings.resolve(a.key.designator.name()),
                strings.resolve(b.key.designator.name())
            );
        }
    }

    #[test]
    fn module_summary_roundtrip() {
        let mut strings = StringTable::new();
        let graph = sample_graph(&mut strings);
        let bytes = graph.to_module_summary_bytes(&strings);

        let mut read_strings = StringTable::new();
        let source =
            DependencySource::new(Path::new("Foreign.swiftmodule"), &mut read_strings).unwrap();
        let decoded =
            SourceFileDependencyGraph::read(&bytes, source, &mut read_strings).unwrap();
        assert_eq!(decoded.nodes.len(), graph.nodes.len());
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let mut strings = StringTable::new();
        let graph = sample_graph(&mut strings);
        let bytes = graph.to_bytes(&strings);

        let mut read_strings = StringTable::new();
        let source =
            DependencySource::new(Path::new("Foreign.swiftmodule"), &mut read_strings).unwrap();
        let err = SourceFileDependencyGraph::read(&bytes, source, &mut read_strings).unwrap_err();
        assert!(matches!(
            err,
            IncrementalError::Bitstream(BitstreamError::InvalidSignature(_))
        ));
    }

    #[test]
    fn missing_metadata_is_rejected() {
        let mut writer = BitstreamWriter::new(SWIFTDEPS_SIGNATURE);
        writer.enter_subblock(FIRST_APPLICATION_BLOCK_ID, 5);
        writer.end_block();
        let bytes = writer.into_bytes();

        let mut strings = StringTable::new();
        let source = DependencySource::new(Path::new("a.swiftdeps"), &mut strings).unwrap();
        let err = SourceFileDependencyGraph::read(&bytes, source, &mut strings).unwrap_err();
        assert!(matches!(err, IncrementalError::MalformedMetadataRecord));
    }

    #[test]
    fn version_mismatch_is_reported() {
        let mut strings = StringTable::new();
        let mut graph = sample_graph(&mut strings);
        graph.major_version = 2;
        let bytes = graph.to_bytes(&strings);

        let mut read_strings = StringTable::new();
        let source = DependencySource::new(Path::new("a.swiftdeps"), &mut read_strings).unwrap();
        let err = SourceFileDependencyGraph::read(&bytes, source, &mut read_strings).unwrap_err();
        assert!(matches!(
            err,
            IncrementalError::MismatchedSerializedGraphVersion { expected: (1, 0), read: (2, 0) }
        ));
    }

    #[test]
    fn arcs_enumerate_def_use_pairs() {
        let mut strings = StringTable::new();
        let graph = sample_graph(&mut strings);
        let mut arcs = Vec::new();
        graph.for_each_arc(|def, use_| arcs.push((def, use_)));
        assert_eq!(arcs, vec![(0, 1)]);
    }
}
