//! The bitstream encoder.
//!
//! Dual of the reader: fixed/VBR/blob primitives plus the block lifecycle.
//! `enter_subblock` leaves a placeholder length word that `end_block`
//! backpatches once the block's extent is known.

use super::{
    Abbreviation, BitstreamError, Operand, BLOCKINFO_BLOCK_ID, BLOCKINFO_SETBID, DEFINE_ABBREV,
    END_BLOCK, ENTER_SUBBLOCK, FIRST_APPLICATION_ABBREV_ID, TOP_LEVEL_ABBREV_WIDTH,
    UNABBREV_RECORD,
};
use std::collections::HashMap;

struct BlockScope {
    abbrev_width: u32,
    /// Offset of the 32-bit length placeholder to backpatch.
    length_offset: usize,
    abbreviations: Vec<Abbreviation>,
    is_blockinfo: bool,
}

/// Encodes a bitstream into an in-memory buffer.
pub struct BitstreamWriter {
    out: Vec<u8>,
    /// Bits written so far; the last byte of `out` may be partially filled.
    bit_len: usize,
    scopes: Vec<BlockScope>,
    /// Abbreviations registered through a BLOCKINFO block, per target block.
    blockinfo: HashMap<u64, Vec<Abbreviation>>,
    /// Target block currently selected inside a BLOCKINFO block.
    blockinfo_bid: Option<u64>,
}

impl BitstreamWriter {
    /// Starts a stream with the given 32-bit signature.
    pub fn new(signature: u32) -> Self {
        let mut writer = Self {
            out: Vec::new(),
            bit_len: 0,
            scopes: Vec::new(),
            blockinfo: HashMap::new(),
            blockinfo_bid: None,
        };
        writer.write(signature as u64, 32);
        writer
    }

    /// Appends `width` bits of `value`, LSB-first.
    pub fn write(&mut self, value: u64, width: u32) {
        debug_assert!(width <= 64);
        debug_assert!(width == 64 || value < (1u64 << width), "value does not fit the width");
        let mut value = value;
        let mut remaining = width;
        while remaining > 0 {
            let bit_in_byte = (self.bit_len % 8) as u32;
            if bit_in_byte == 0 {
                self.out.push(0);
            }
            let take = remaining.min(8 - bit_in_byte);
            let mask = ((1u16 << take) - 1) as u64;
            *self.out.last_mut().expect("byte was just pushed") |=
                ((value & mask) as u8) << bit_in_byte;
            value >>= take;
            remaining -= take;
            self.bit_len += take as usize;
        }
    }

    /// Appends `value` as VBR chunks of `width` bits.
    pub fn write_vbr(&mut self, value: u64, width: u32) {
        debug_assert!((2..=32).contains(&width));
        let payload_bits = width - 1;
        let continue_bit = 1u64 << payload_bits;
        let payload_mask = continue_bit - 1;
        let mut value = value;
        loop {
            let payload = value & payload_mask;
            value >>= payload_bits;
            if value != 0 {
                self.write(payload | continue_bit, width);
            } else {
                self.write(payload, width);
                return;
            }
        }
    }

    /// Pads with zero bits to the next 32-bit boundary.
    pub fn align32(&mut self) {
        if self.bit_len % 8 != 0 {
            self.bit_len = (self.bit_len + 7) / 8 * 8;
        }
        while self.out.len() % 4 != 0 {
            self.out.push(0);
            self.bit_len += 8;
        }
        debug_assert_eq!(self.bit_len, self.out.len() * 8);
    }

    fn current_width(&self) -> u32 {
        self.scopes.last().map_or(TOP_LEVEL_ABBREV_WIDTH, |scope| scope.abbrev_width)
    }

    /// Opens a nested block with the given id and abbreviation width.
    pub fn enter_subblock(&mut self, block_id: u64, abbrev_width: u32) {
        debug_assert!((1..=32).contains(&abbrev_width));
        self.write(ENTER_SUBBLOCK, self.current_width());
        self.write_vbr(block_id, 8);
        self.write_vbr(abbrev_width as u64, 4);
        self.align32();
        let length_offset = self.out.len();
        self.write(0, 32);
        let abbreviations = self.blockinfo.get(&block_id).cloned().unwrap_or_default();
        self.scopes.push(BlockScope {
            abbrev_width,
            length_offset,
            abbreviations,
            is_blockinfo: block_id == BLOCKINFO_BLOCK_ID,
        });
    }

    /// Opens the reserved BLOCKINFO block. Abbreviations defined through
    /// [`Self::define_blockinfo_abbreviation`] until the matching
    /// [`Self::end_block`] apply to their target blocks, not to this one.
    pub fn enter_blockinfo_block(&mut self, abbrev_width: u32) {
        self.enter_subblock(BLOCKINFO_BLOCK_ID, abbrev_width);
        self.blockinfo_bid = None;
    }

    /// Closes the innermost open block and backpatches its length word.
    pub fn end_block(&mut self) {
        let scope = self.scopes.pop().expect("end_block without enter_subblock");
        self.write(END_BLOCK, scope.abbrev_width);
        self.align32();
        let body_bytes = self.out.len() - (scope.length_offset + 4);
        let words = (body_bytes / 4) as u32;
        self.out[scope.length_offset..scope.length_offset + 4]
            .copy_from_slice(&words.to_le_bytes());
        if scope.is_blockinfo {
            self.blockinfo_bid = None;
        }
    }

    /// Defines an abbreviation in the current block and returns its id.
    pub fn define_abbreviation(&mut self, abbrev: &Abbreviation) -> Result<u64, BitstreamError> {
        self.emit_abbrev_definition(abbrev)?;
        let scope = self.scopes.last_mut().expect("define_abbreviation outside a block");
        debug_assert!(!scope.is_blockinfo, "use define_blockinfo_abbreviation inside BLOCKINFO");
        scope.abbreviations.push(abbrev.clone());
        Ok(FIRST_APPLICATION_ABBREV_ID + scope.abbreviations.len() as u64 - 1)
    }

    /// Defines an abbreviation for `block_id` from inside a BLOCKINFO block
    /// and returns the id it will have there.
    pub fn define_blockinfo_abbreviation(
        &mut self,
        block_id: u64,
        abbrev: &Abbreviation,
    ) -> Result<u64, BitstreamError> {
        debug_assert!(
            self.scopes.last().is_some_and(|s| s.is_blockinfo),
            "not inside a BLOCKINFO block"
        );
        if self.blockinfo_bid != Some(block_id) {
            self.emit_unabbreviated_record(BLOCKINFO_SETBID, &[block_id]);
            self.blockinfo_bid = Some(block_id);
        }
        self.emit_abbrev_definition(abbrev)?;
        let registered = self.blockinfo.entry(block_id).or_default();
        registered.push(abbrev.clone());
        Ok(FIRST_APPLICATION_ABBREV_ID + registered.len() as u64 - 1)
    }

    fn emit_abbrev_definition(&mut self, abbrev: &Abbreviation) -> Result<(), BitstreamError> {
        self.write(DEFINE_ABBREV, self.current_width());
        let num_operands: usize = abbrev
            .operands
            .iter()
            .map(|op| if matches!(op, Operand::Array(_)) { 2 } else { 1 })
            .sum();
        self.write_vbr(num_operands as u64, 5);
        for operand in &abbrev.operands {
            self.emit_operand_definition(operand)?;
        }
        Ok(())
    }

    fn emit_operand_definition(&mut self, operand: &Operand) -> Result<(), BitstreamError> {
        match operand {
            Operand::Literal(value) => {
                self.write(1, 1);
                self.write_vbr(*value, 8);
            }
            Operand::Fixed(width) => {
                if *width > 64 {
                    return Err(BitstreamError::InvalidAbbrevWidth(*width as u64));
                }
                self.write(0, 1);
                self.write(operand.encoding_code(), 3);
                self.write_vbr(*width as u64, 5);
            }
            Operand::Vbr(width) => {
                if !(2..=32).contains(width) {
                    return Err(BitstreamError::InvalidAbbrevWidth(*width as u64));
                }
                self.write(0, 1);
                self.write(operand.encoding_code(), 3);
                self.write_vbr(*width as u64, 5);
            }
            Operand::Array(element) => {
                if matches!(**element, Operand::Array(_) | Operand::Blob) {
                    return Err(BitstreamError::InvalidAbbrevOperand(element.encoding_code()));
                }
                self.write(0, 1);
                self.write(operand.encoding_code(), 3);
                self.emit_operand_definition(element)?;
            }
            Operand::Char6 | Operand::Blob => {
                self.write(0, 1);
                self.write(operand.encoding_code(), 3);
            }
        }
        Ok(())
    }

    /// Emits a record without an abbreviation: every operand is VBR6.
    pub fn emit_unabbreviated_record(&mut self, code: u64, fields: &[u64]) {
        self.write(UNABBREV_RECORD, self.current_width());
        self.write_vbr(code, 6);
        self.write_vbr(fields.len() as u64, 6);
        for &field in fields {
            self.write_vbr(field, 6);
        }
    }

    /// Emits a record through a previously defined abbreviation.
    ///
    /// `fields` supplies the non-literal scalar operands in order; when the
    /// abbreviation ends in an array, the remaining fields become its
    /// elements. `blob` must be present exactly when the abbreviation has a
    /// blob operand.
    pub fn emit_record(
        &mut self,
        abbrev_id: u64,
        code: u64,
        fields: &[u64],
        blob: Option<&[u8]>,
    ) -> Result<(), BitstreamError> {
        let scope = self.scopes.last().expect("emit_record outside a block");
        let index = abbrev_id
            .checked_sub(FIRST_APPLICATION_ABBREV_ID)
            .ok_or(BitstreamError::InvalidAbbreviationId(abbrev_id))? as usize;
        let abbrev = scope
            .abbreviations
            .get(index)
            .ok_or(BitstreamError::InvalidAbbreviationId(abbrev_id))?
            .clone();

        self.write(abbrev_id, self.current_width());

        let mut values = std::iter::once(code).chain(fields.iter().copied());
        let mut remaining = 1 + fields.len();
        for operand in &abbrev.operands {
            match operand {
                Operand::Literal(expected) => {
                    let value = values.next().ok_or(BitstreamError::MissingOperand)?;
                    remaining -= 1;
                    debug_assert_eq!(value, *expected, "literal operand mismatch");
                }
                Operand::Fixed(width) => {
                    let value = values.next().ok_or(BitstreamError::MissingOperand)?;
                    remaining -= 1;
                    self.write(value, *width);
                }
                Operand::Vbr(width) => {
                    let value = values.next().ok_or(BitstreamError::MissingOperand)?;
                    remaining -= 1;
                    self.write_vbr(value, *width);
                }
                Operand::Char6 => {
                    let value = values.next().ok_or(BitstreamError::MissingOperand)?;
                    remaining -= 1;
                    self.write(value, 6);
                }
                Operand::Array(element) => {
                    self.write_vbr(remaining as u64, 6);
                    for value in values.by_ref() {
                        match &**element {
                            Operand::Literal(_) => {}
                            Operand::Fixed(width) => self.write(value, *width),
                            Operand::Vbr(width) => self.write_vbr(value, *width),
                            Operand::Char6 => self.write(value, 6),
                            Operand::Array(_) | Operand::Blob => {
                                return Err(BitstreamError::InvalidAbbrevOperand(
                                    element.encoding_code(),
                                ))
                            }
                        }
                    }
                    remaining = 0;
                }
                Operand::Blob => {
                    let bytes = blob.unwrap_or_default();
                    self.write_vbr(bytes.len() as u64, 6);
                    self.align32();
                    self.out.extend_from_slice(bytes);
                    self.bit_len += bytes.len() * 8;
                    self.align32();
                }
            }
        }
        debug_assert_eq!(remaining, 0, "unconsumed record fields");
        Ok(())
    }

    /// Finishes the stream and returns the encoded bytes.
    pub fn into_bytes(mut self) -> Vec<u8> {
        debug_assert!(self.scopes.is_empty(), "unclosed block at end of stream");
        self.align32();
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_words_are_backpatched() {
        let mut writer = BitstreamWriter::new(0x4141_4141);
        writer.enter_subblock(9, 4);
        writer.emit_unabbreviated_record(1, &[2]);
        writer.end_block();
        let bytes = writer.into_bytes();

        // signature, ENTER_SUBBLOCK header word(s), then the length word
        // directly before the block body; reader cross-checks exact offsets
        let mut cursor = crate::bitstream::BitstreamReader::new(&bytes[4..]);
        assert_eq!(cursor.read(2).unwrap(), ENTER_SUBBLOCK);
        assert_eq!(cursor.read_vbr(8).unwrap(), 9);
        assert_eq!(cursor.read_vbr(4).unwrap(), 4);
        cursor.align32();
        let words = cursor.read(32).unwrap();
        assert!(words > 0);
        // the whole stream is the signature + one header word + length word +
        // body words
        assert_eq!(bytes.len(), 4 + 4 + 4 + words as usize * 4);
    }

    #[test]
    fn align32_is_idempotent() {
        let mut writer = BitstreamWriter::new(0);
        writer.write(1, 3);
        writer.align32();
        let len = writer.out.len();
        writer.align32();
        assert_eq!(writer.out.len(), len);
        assert_eq!(len % 4, 0);
    }
}
