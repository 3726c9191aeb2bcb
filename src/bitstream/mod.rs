//! An LLVM-compatible bitstream container codec.
//!
//! Both the persisted module dependency graph and the per-file dependency
//! artifacts produced by the frontend use this container: a 32-bit signature
//! followed by nested blocks of abbreviated records. The decoder is driven by
//! a [`BitstreamVisitor`]; the encoder is its dual and backpatches block
//! lengths as blocks close.
//!
//! Bit-exactness with the LLVM bitcode format matters: artifacts written by
//! any frontend with the same record layout must parse identically here.

mod read;
mod write;

pub use read::{read_bitstream, BitstreamReader};
pub use write::BitstreamWriter;

/// Reserved abbreviation id: ends the current block.
pub const END_BLOCK: u64 = 0;
/// Reserved abbreviation id: begins a nested block.
pub const ENTER_SUBBLOCK: u64 = 1;
/// Reserved abbreviation id: defines an abbreviation in the current scope.
pub const DEFINE_ABBREV: u64 = 2;
/// Reserved abbreviation id: a record with VBR6-encoded operands.
pub const UNABBREV_RECORD: u64 = 3;
/// The first id available to user-defined abbreviations.
pub const FIRST_APPLICATION_ABBREV_ID: u64 = 4;

/// The reserved block holding cross-block abbreviations and naming metadata.
pub const BLOCKINFO_BLOCK_ID: u64 = 0;
/// The first block id available to applications.
pub const FIRST_APPLICATION_BLOCK_ID: u64 = 8;

/// Record code inside `BLOCKINFO` selecting the block subsequent
/// abbreviations belong to.
pub const BLOCKINFO_SETBID: u64 = 1;

/// The abbreviation width in effect at the top level of a stream.
pub const TOP_LEVEL_ABBREV_WIDTH: u32 = 2;

/// One operand of an abbreviation definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    /// A value baked into the abbreviation; occupies no bits in records.
    Literal(u64),
    /// A fixed-width unsigned integer.
    Fixed(u32),
    /// A variable-bit-rate integer with the given chunk width.
    Vbr(u32),
    /// A VBR6-length-prefixed run of the element operand.
    Array(Box<Operand>),
    /// One character of the 6-bit alphabet `[a-zA-Z0-9._]`.
    Char6,
    /// A VBR6-length-prefixed, 32-bit-aligned run of raw bytes.
    Blob,
}

impl Operand {
    /// Encoding code used inside `DEFINE_ABBREV`.
    fn encoding_code(&self) -> u64 {
        match self {
            Operand::Literal(_) => unreachable!("literals are flagged, not encoded"),
            Operand::Fixed(_) => 1,
            Operand::Vbr(_) => 2,
            Operand::Array(_) => 3,
            Operand::Char6 => 4,
            Operand::Blob => 5,
        }
    }
}

/// A sequence of operands describing how a record is laid out on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Abbreviation {
    pub operands: Vec<Operand>,
}

impl Abbreviation {
    pub fn new(operands: Vec<Operand>) -> Self {
        Self { operands }
    }
}

/// A decoded record: its code, scalar fields, and trailing blob if the
/// abbreviation carried one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    pub id: u64,
    pub fields: Vec<u64>,
    pub blob: Option<Vec<u8>>,
}

impl Record {
    pub fn field(&self, index: usize) -> Result<u64, BitstreamError> {
        self.fields.get(index).copied().ok_or(BitstreamError::MissingOperand)
    }

    pub fn blob_bytes(&self) -> &[u8] {
        self.blob.as_deref().unwrap_or_default()
    }
}

/// Typed decode failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BitstreamError {
    #[error("unexpected end of bitstream")]
    UnexpectedEof,
    #[error("VBR value overflows 64 bits")]
    VbrOverflow,
    #[error("invalid abbreviation id {0}")]
    InvalidAbbreviationId(u64),
    #[error("invalid abbreviation operand encoding {0}")]
    InvalidAbbrevOperand(u64),
    #[error("invalid abbreviation width {0}")]
    InvalidAbbrevWidth(u64),
    #[error("abbreviated record is missing an operand")]
    MissingOperand,
    #[error("value {0} is not a char6")]
    InvalidChar6(u64),
    #[error("block was not terminated by END_BLOCK")]
    MissingEndBlock,
    #[error("nested block length overruns the stream")]
    BlockLengthOverrun,
    #[error("malformed BLOCKINFO block")]
    MalformedBlockInfo,
    #[error("invalid signature 0x{0:08x}")]
    InvalidSignature(u32),
}

/// Callbacks driving the decoder.
///
/// The per-file artifact readers and the module-graph reader implement this;
/// their error types embed [`BitstreamError`].
pub trait BitstreamVisitor {
    type Error: From<BitstreamError>;

    /// Inspect the leading 32-bit signature; reject the stream by returning
    /// an error.
    fn validate_signature(&mut self, signature: u32) -> Result<(), Self::Error>;

    /// Whether the decoder should descend into the block or skip it wholesale.
    fn should_enter_block(&mut self, id: u64) -> Result<bool, Self::Error>;

    /// Called when a block the visitor entered ends.
    fn did_exit_block(&mut self) -> Result<(), Self::Error>;

    /// Called for every record inside entered blocks.
    fn visit(&mut self, record: &Record) -> Result<(), Self::Error>;
}

/// Encodes one byte of the char6 alphabet.
pub fn encode_char6(byte: u8) -> Option<u64> {
    match byte {
        b'a'..=b'z' => Some((byte - b'a') as u64),
        b'A'..=b'Z' => Some((byte - b'A') as u64 + 26),
        b'0'..=b'9' => Some((byte - b'0') as u64 + 52),
        b'.' => Some(62),
        b'_' => Some(63),
        _ => None,
    }
}

/// Decodes a char6 value back to its byte.
pub fn decode_char6(value: u64) -> Result<u8, BitstreamError> {
    match value {
        0..=25 => Ok(b'a' + value as u8),
        26..=51 => Ok(b'A' + (value - 26) as u8),
        52..=61 => Ok(b'0' + (value - 52) as u8),
        62 => Ok(b'.'),
        63 => Ok(b'_'),
        other => Err(BitstreamError::InvalidChar6(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Collects everything the decoder reports.
    #[derive(Default)]
    struct CollectingVisitor {
        signature: u32,
        records: Vec<Record>,
        entered: Vec<u64>,
        exits: usize,
        skip_blocks: Vec<u64>,
    }

    impl BitstreamVisitor for CollectingVisitor {
        type Error = BitstreamError;

        fn validate_signature(&mut self, signature: u32) -> Result<(), BitstreamError> {
            self.signature = signature;
            Ok(())
        }

        fn should_enter_block(&mut self, id: u64) -> Result<bool, BitstreamError> {
            self.entered.push(id);
            Ok(!self.skip_blocks.contains(&id))
        }

        fn did_exit_block(&mut self) -> Result<(), BitstreamError> {
            self.exits += 1;
            Ok(())
        }

        fn visit(&mut self, record: &Record) -> Result<(), BitstreamError> {
            self.records.push(record.clone());
            Ok(())
        }
    }

    const SIG: u32 = 0x5445_5354;

    #[test]
    fn roundtrip_unabbreviated_records() {
        let mut writer = BitstreamWriter::new(SIG);
        writer.enter_subblock(FIRST_APPLICATION_BLOCK_ID, 4);
        writer.emit_unabbreviated_record(7, &[1, 2, 3, u64::MAX]);
        writer.emit_unabbreviated_record(9, &[]);
        writer.end_block();
        let bytes = writer.into_bytes();

        let mut visitor = CollectingVisitor::default();
        read_bitstream(&bytes, &mut visitor).unwrap();
        assert_eq!(visitor.signature, SIG);
        assert_eq!(visitor.entered, vec![FIRST_APPLICATION_BLOCK_ID]);
        assert_eq!(visitor.exits, 1);
        assert_eq!(
            visitor.records,
            vec![
                Record { id: 7, fields: vec![1, 2, 3, u64::MAX], blob: None },
                Record { id: 9, fields: vec![], blob: None },
            ]
        );
    }

    #[test]
    fn roundtrip_abbreviated_record_with_blob() {
        let abbrev = Abbreviation::new(vec![
            Operand::Literal(2),
            Operand::Fixed(3),
            Operand::Vbr(13),
            Operand::Blob,
        ]);

        let mut writer = BitstreamWriter::new(SIG);
        writer.enter_subblock(FIRST_APPLICATION_BLOCK_ID, 5);
        let id = writer.define_abbreviation(&abbrev).unwrap();
        writer.emit_record(id, 2, &[5, 4242], Some(b"fingerprint")).unwrap();
        writer.end_block();
        let bytes = writer.into_bytes();

        let mut visitor = CollectingVisitor::default();
        read_bitstream(&bytes, &mut visitor).unwrap();
        assert_eq!(
            visitor.records,
            vec![Record { id: 2, fields: vec![5, 4242], blob: Some(b"fingerprint".to_vec()) }]
        );
    }

    #[test]
    fn roundtrip_array_of_char6() {
        let abbrev = Abbreviation::new(vec![
            Operand::Literal(1),
            Operand::Array(Box::new(Operand::Char6)),
        ]);

        let mut writer = BitstreamWriter::new(SIG);
        writer.enter_subblock(FIRST_APPLICATION_BLOCK_ID, 4);
        let id = writer.define_abbreviation(&abbrev).unwrap();
        let chars: Vec<u64> = "ab.Z_9".bytes().map(|b| encode_char6(b).unwrap()).collect();
        writer.emit_record(id, 1, &chars, None).unwrap();
        writer.end_block();
        let bytes = writer.into_bytes();

        let mut visitor = CollectingVisitor::default();
        read_bitstream(&bytes, &mut visitor).unwrap();
        let decoded: Vec<u8> =
            visitor.records[0].fields.iter().map(|&v| decode_char6(v).unwrap()).collect();
        assert_eq!(decoded, b"ab.Z_9");
    }

    #[test]
    fn skipped_blocks_are_not_visited() {
        let mut writer = BitstreamWriter::new(SIG);
        writer.enter_subblock(FIRST_APPLICATION_BLOCK_ID, 4);
        writer.emit_unabbreviated_record(1, &[11]);
        writer.enter_subblock(FIRST_APPLICATION_BLOCK_ID + 1, 4);
        writer.emit_unabbreviated_record(2, &[22]);
        writer.end_block();
        writer.emit_unabbreviated_record(3, &[33]);
        writer.end_block();
        let bytes = writer.into_bytes();

        let mut visitor =
            CollectingVisitor { skip_blocks: vec![FIRST_APPLICATION_BLOCK_ID + 1], ..Default::default() };
        read_bitstream(&bytes, &mut visitor).unwrap();
        let ids: Vec<u64> = visitor.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
        // only the entered block reports an exit
        assert_eq!(visitor.exits, 1);
    }

    #[test]
    fn blockinfo_abbreviations_apply_to_target_blocks() {
        let abbrev =
            Abbreviation::new(vec![Operand::Literal(4), Operand::Vbr(6), Operand::Fixed(8)]);

        let mut writer = BitstreamWriter::new(SIG);
        writer.enter_blockinfo_block(2);
        let id = writer
            .define_blockinfo_abbreviation(FIRST_APPLICATION_BLOCK_ID, &abbrev)
            .unwrap();
        writer.end_block();
        writer.enter_subblock(FIRST_APPLICATION_BLOCK_ID, 4);
        writer.emit_record(id, 4, &[64, 255], None).unwrap();
        writer.end_block();
        let bytes = writer.into_bytes();

        let mut visitor = CollectingVisitor::default();
        read_bitstream(&bytes, &mut visitor).unwrap();
        // the BLOCKINFO block itself is consumed by the decoder
        assert_eq!(visitor.entered, vec![FIRST_APPLICATION_BLOCK_ID]);
        assert_eq!(visitor.records, vec![Record { id: 4, fields: vec![64, 255], blob: None }]);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut writer = BitstreamWriter::new(SIG);
        writer.enter_subblock(FIRST_APPLICATION_BLOCK_ID, 4);
        writer.emit_unabbreviated_record(1, &[1, 2, 3]);
        writer.end_block();
        let bytes = writer.into_bytes();

        let mut visitor = CollectingVisitor::default();
        let err = read_bitstream(&bytes[..bytes.len() - 6], &mut visitor).unwrap_err();
        assert!(matches!(
            err,
            BitstreamError::UnexpectedEof
                | BitstreamError::MissingEndBlock
                | BitstreamError::BlockLengthOverrun
        ));
    }

    #[test]
    fn char6_alphabet_is_total() {
        for byte in (b'a'..=b'z').chain(b'A'..=b'Z').chain(b'0'..=b'9').chain([b'.', b'_']) {
            let encoded = encode_char6(byte).unwrap();
            assert_eq!(decode_char6(encoded).unwrap(), byte);
        }
        assert_eq!(encode_char6(b'/'), None);
        assert!(decode_char6(64).is_err());
    }
}
