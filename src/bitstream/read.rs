//! The bitstream decoder: a bit cursor plus the visitor-driven walk.

use super::{
    Abbreviation, BitstreamError, BitstreamVisitor, Operand, Record, BLOCKINFO_BLOCK_ID,
    BLOCKINFO_SETBID, DEFINE_ABBREV, END_BLOCK, ENTER_SUBBLOCK, FIRST_APPLICATION_ABBREV_ID,
    TOP_LEVEL_ABBREV_WIDTH, UNABBREV_RECORD,
};
use std::collections::HashMap;

/// A cursor over an in-memory buffer, consuming bits LSB-first within each
/// byte, matching the LLVM bitstream bit order.
pub struct BitstreamReader<'a> {
    bytes: &'a [u8],
    bit: usize,
}

impl<'a> BitstreamReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, bit: 0 }
    }

    /// Reads a fixed-width unsigned value. A width of zero yields zero.
    pub fn read(&mut self, width: u32) -> Result<u64, BitstreamError> {
        debug_assert!(width <= 64);
        let mut result = 0u64;
        let mut produced = 0u32;
        while produced < width {
            let byte_index = self.bit / 8;
            if byte_index >= self.bytes.len() {
                return Err(BitstreamError::UnexpectedEof);
            }
            let bit_in_byte = (self.bit % 8) as u32;
            let take = (width - produced).min(8 - bit_in_byte);
            let mask = ((1u16 << take) - 1) as u8;
            let chunk = (self.bytes[byte_index] >> bit_in_byte) & mask;
            result |= (chunk as u64) << produced;
            produced += take;
            self.bit += take as usize;
        }
        Ok(result)
    }

    /// Reads a variable-bit-rate value in chunks of `width` bits. The high
    /// bit of each chunk marks continuation; payloads accumulate little end
    /// first. Values that overflow 64 bits are rejected.
    pub fn read_vbr(&mut self, width: u32) -> Result<u64, BitstreamError> {
        debug_assert!((2..=32).contains(&width));
        let payload_bits = width - 1;
        let continue_mask = 1u64 << payload_bits;
        let payload_mask = continue_mask - 1;
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let chunk = self.read(width)?;
            let payload = chunk & payload_mask;
            if payload != 0 {
                if shift >= 64 {
                    return Err(BitstreamError::VbrOverflow);
                }
                let shifted = payload << shift;
                if shifted >> shift != payload {
                    return Err(BitstreamError::VbrOverflow);
                }
                result |= shifted;
            }
            if chunk & continue_mask == 0 {
                return Ok(result);
            }
            shift = shift.saturating_add(payload_bits);
        }
    }

    /// Advances to the next 32-bit boundary.
    pub fn align32(&mut self) {
        self.bit = (self.bit + 31) / 32 * 32;
    }

    /// Reads `count` raw bytes; the cursor must be byte-aligned.
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], BitstreamError> {
        debug_assert_eq!(self.bit % 8, 0);
        let start = self.bit / 8;
        let end = start.checked_add(count).ok_or(BitstreamError::UnexpectedEof)?;
        if end > self.bytes.len() {
            return Err(BitstreamError::UnexpectedEof);
        }
        self.bit = end * 8;
        Ok(&self.bytes[start..end])
    }

    /// Skips `count` bytes; the cursor must be byte-aligned.
    pub fn skip_bytes(&mut self, count: usize) -> Result<(), BitstreamError> {
        self.read_bytes(count).map(|_| ())
    }

    /// Whether fewer than 32 bits remain; trailing padding below one word is
    /// tolerated at the top level.
    pub fn at_end(&self) -> bool {
        self.bit / 8 >= self.bytes.len() || self.bytes.len() * 8 - self.bit < 32
    }
}

/// One nesting level of the decode.
struct Scope {
    abbrev_width: u32,
    abbreviations: Vec<Abbreviation>,
}

/// Walks `data`, reporting blocks and records to `visitor`.
pub fn read_bitstream<V: BitstreamVisitor>(data: &[u8], visitor: &mut V) -> Result<(), V::Error> {
    let mut cursor = BitstreamReader::new(data);
    let signature = cursor.read(32)?;
    visitor.validate_signature(signature as u32)?;

    let mut blockinfo: HashMap<u64, Vec<Abbreviation>> = HashMap::new();
    let mut scopes: Vec<Scope> =
        vec![Scope { abbrev_width: TOP_LEVEL_ABBREV_WIDTH, abbreviations: Vec::new() }];

    loop {
        if scopes.len() == 1 {
            if cursor.at_end() {
                return Ok(());
            }
            let abbrev_id = cursor.read(TOP_LEVEL_ABBREV_WIDTH)?;
            if abbrev_id != ENTER_SUBBLOCK {
                return Err(BitstreamError::InvalidAbbreviationId(abbrev_id).into());
            }
            enter_block(&mut cursor, &mut scopes, &mut blockinfo, visitor)?;
            continue;
        }

        let scope = scopes.last().expect("scope stack is never empty");
        let abbrev_id = cursor.read(scope.abbrev_width).map_err(|e| match e {
            BitstreamError::UnexpectedEof => BitstreamError::MissingEndBlock,
            other => other,
        })?;
        match abbrev_id {
            END_BLOCK => {
                cursor.align32();
                scopes.pop();
                visitor.did_exit_block()?;
            }
            ENTER_SUBBLOCK => {
                enter_block(&mut cursor, &mut scopes, &mut blockinfo, visitor)?;
            }
            DEFINE_ABBREV => {
                let abbrev = read_abbreviation(&mut cursor)?;
                scopes.last_mut().expect("scope stack is never empty").abbreviations.push(abbrev);
            }
            UNABBREV_RECORD => {
                let record = read_unabbreviated(&mut cursor)?;
                visitor.visit(&record)?;
            }
            user => {
                let index = (user - FIRST_APPLICATION_ABBREV_ID) as usize;
                let scope = scopes.last().expect("scope stack is never empty");
                let abbrev = scope
                    .abbreviations
                    .get(index)
                    .ok_or(BitstreamError::InvalidAbbreviationId(user))?
                    .clone();
                let record = read_abbreviated(&mut cursor, &abbrev)?;
                visitor.visit(&record)?;
            }
        }
    }
}

fn enter_block<V: BitstreamVisitor>(
    cursor: &mut BitstreamReader<'_>,
    scopes: &mut Vec<Scope>,
    blockinfo: &mut HashMap<u64, Vec<Abbreviation>>,
    visitor: &mut V,
) -> Result<(), V::Error> {
    let block_id = cursor.read_vbr(8)?;
    let abbrev_width = cursor.read_vbr(4)?;
    if abbrev_width == 0 || abbrev_width > 32 {
        return Err(BitstreamError::InvalidAbbrevWidth(abbrev_width).into());
    }
    cursor.align32();
    let length_in_words = cursor.read(32)?;

    if block_id == BLOCKINFO_BLOCK_ID {
        read_blockinfo(cursor, abbrev_width as u32, blockinfo)?;
        return Ok(());
    }

    if visitor.should_enter_block(block_id)? {
        let abbreviations = blockinfo.get(&block_id).cloned().unwrap_or_default();
        scopes.push(Scope { abbrev_width: abbrev_width as u32, abbreviations });
    } else {
        let bytes = (length_in_words as usize)
            .checked_mul(4)
            .ok_or(BitstreamError::BlockLengthOverrun)?;
        cursor.skip_bytes(bytes).map_err(|_| BitstreamError::BlockLengthOverrun)?;
    }
    Ok(())
}

/// Consumes a `BLOCKINFO` block, registering its abbreviations per target
/// block id. Naming records are skipped.
fn read_blockinfo(
    cursor: &mut BitstreamReader<'_>,
    abbrev_width: u32,
    blockinfo: &mut HashMap<u64, Vec<Abbreviation>>,
) -> Result<(), BitstreamError> {
    let mut current_bid: Option<u64> = None;
    loop {
        let abbrev_id = cursor.read(abbrev_width).map_err(|e| match e {
            BitstreamError::UnexpectedEof => BitstreamError::MissingEndBlock,
            other => other,
        })?;
        match abbrev_id {
            END_BLOCK => {
                cursor.align32();
                return Ok(());
            }
            DEFINE_ABBREV => {
                let abbrev = read_abbreviation(cursor)?;
                let bid = current_bid.ok_or(BitstreamError::MalformedBlockInfo)?;
                blockinfo.entry(bid).or_default().push(abbrev);
            }
            UNABBREV_RECORD => {
                let record = read_unabbreviated(cursor)?;
                if record.id == BLOCKINFO_SETBID {
                    current_bid = Some(record.field(0)?);
                }
                // BLOCKNAME / SETRECORDNAME are metadata only
            }
            ENTER_SUBBLOCK => return Err(BitstreamError::MalformedBlockInfo),
            other => return Err(BitstreamError::InvalidAbbreviationId(other)),
        }
    }
}

fn read_abbreviation(cursor: &mut BitstreamReader<'_>) -> Result<Abbreviation, BitstreamError> {
    let num_operands = cursor.read_vbr(5)? as usize;
    let mut operands = Vec::with_capacity(num_operands);
    let mut remaining = num_operands;
    while remaining > 0 {
        let (operand, consumed) = read_operand(cursor, remaining)?;
        remaining -= consumed;
        operands.push(operand);
    }
    Ok(Abbreviation::new(operands))
}

/// Reads one operand definition, returning how many operand slots it consumed
/// (arrays consume one extra for their element type).
fn read_operand(
    cursor: &mut BitstreamReader<'_>,
    remaining: usize,
) -> Result<(Operand, usize), BitstreamError> {
    let is_literal = cursor.read(1)?;
    if is_literal == 1 {
        return Ok((Operand::Literal(cursor.read_vbr(8)?), 1));
    }
    let encoding = cursor.read(3)?;
    match encoding {
        1 => {
            let width = cursor.read_vbr(5)?;
            if width > 64 {
                return Err(BitstreamError::InvalidAbbrevWidth(width));
            }
            Ok((Operand::Fixed(width as u32), 1))
        }
        2 => {
            let width = cursor.read_vbr(5)?;
            if !(2..=32).contains(&width) {
                return Err(BitstreamError::InvalidAbbrevWidth(width));
            }
            Ok((Operand::Vbr(width as u32), 1))
        }
        3 => {
            if remaining < 2 {
                return Err(BitstreamError::MissingOperand);
            }
            let (element, consumed) = read_operand(cursor, remaining - 1)?;
            if matches!(element, Operand::Array(_) | Operand::Blob) {
                return Err(BitstreamError::InvalidAbbrevOperand(encoding));
            }
            Ok((Operand::Array(Box::new(element)), consumed + 1))
        }
        4 => Ok((Operand::Char6, 1)),
        5 => Ok((Operand::Blob, 1)),
        other => Err(BitstreamError::InvalidAbbrevOperand(other)),
    }
}

fn read_unabbreviated(cursor: &mut BitstreamReader<'_>) -> Result<Record, BitstreamError> {
    let code = cursor.read_vbr(6)?;
    let count = cursor.read_vbr(6)? as usize;
    let mut fields = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        fields.push(cursor.read_vbr(6)?);
    }
    Ok(Record { id: code, fields, blob: None })
}

fn read_abbreviated(
    cursor: &mut BitstreamReader<'_>,
    abbrev: &Abbreviation,
) -> Result<Record, BitstreamError> {
    let mut values: Vec<u64> = Vec::new();
    let mut blob: Option<Vec<u8>> = None;

    for operand in &abbrev.operands {
        match operand {
            Operand::Literal(value) => values.push(*value),
            Operand::Fixed(width) => values.push(cursor.read(*width)?),
            Operand::Vbr(width) => values.push(cursor.read_vbr(*width)?),
            Operand::Char6 => values.push(cursor.read(6)?),
            Operand::Array(element) => {
                let count = cursor.read_vbr(6)? as usize;
                for _ in 0..count {
                    match &**element {
                        Operand::Literal(value) => values.push(*value),
                        Operand::Fixed(width) => values.push(cursor.read(*width)?),
                        Operand::Vbr(width) => values.push(cursor.read_vbr(*width)?),
                        Operand::Char6 => values.push(cursor.read(6)?),
                        Operand::Array(_) | Operand::Blob => {
                            return Err(BitstreamError::InvalidAbbrevOperand(
                                element.encoding_code(),
                            ))
                        }
                    }
                }
            }
            Operand::Blob => {
                let count = cursor.read_vbr(6)? as usize;
                cursor.align32();
                blob = Some(cursor.read_bytes(count)?.to_vec());
                cursor.align32();
            }
        }
    }

    if values.is_empty() {
        return Err(BitstreamError::MissingOperand);
    }
    let id = values.remove(0);
    Ok(Record { id, fields: values, blob })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_reads_are_lsb_first() {
        // 0b1101_0110, 0b0000_0011
        let bytes = [0xd6, 0x03];
        let mut cursor = BitstreamReader::new(&bytes);
        assert_eq!(cursor.read(3).unwrap(), 0b110);
        assert_eq!(cursor.read(5).unwrap(), 0b11010);
        assert_eq!(cursor.read(8).unwrap(), 0x03);
        assert!(matches!(cursor.read(1), Err(BitstreamError::UnexpectedEof)));
    }

    #[test]
    fn zero_width_read_is_zero() {
        let mut cursor = BitstreamReader::new(&[0xff]);
        assert_eq!(cursor.read(0).unwrap(), 0);
    }

    #[test]
    fn vbr_roundtrip_values() {
        for value in [0u64, 1, 5, 63, 64, 127, 128, 1 << 20, u64::MAX] {
            for width in [2u32, 4, 6, 8, 13] {
                let mut writer = crate::bitstream::BitstreamWriter::new(0);
                writer.write_vbr(value, width);
                writer.align32();
                let bytes = writer.into_bytes();
                // skip the 32-bit signature
                let mut cursor = BitstreamReader::new(&bytes[4..]);
                assert_eq!(cursor.read_vbr(width).unwrap(), value, "value {value} width {width}");
            }
        }
    }

    #[test]
    fn overlong_vbr_is_rejected() {
        // eleven VBR8 continuation chunks of all-ones payload: 77 payload bits
        let mut writer = crate::bitstream::BitstreamWriter::new(0);
        for _ in 0..10 {
            writer.write(0xff, 8);
        }
        writer.write(0x7f, 8);
        writer.align32();
        let bytes = writer.into_bytes();
        let mut cursor = BitstreamReader::new(&bytes[4..]);
        assert_eq!(cursor.read_vbr(8), Err(BitstreamError::VbrOverflow));
    }

    #[test]
    fn align32_rounds_up() {
        let bytes = [0u8; 8];
        let mut cursor = BitstreamReader::new(&bytes);
        cursor.read(3).unwrap();
        cursor.align32();
        assert_eq!(cursor.read_bytes(4).unwrap(), [0u8; 4]);
    }
}
