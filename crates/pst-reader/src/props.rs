//! MAPI property decoding.
//!
//! A descriptor's primary data block is a self-contained heap. The block
//! header points at a table header, the table header points at a packed
//! array of 8-byte property records, and a trailing cursor list (the
//! table index) turns value slots into byte ranges within the block.
//! Immediate-typed values live in the slot itself; everything else goes
//! through the table index or, for slots marked external, through the
//! descriptor's associated data store.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use tracing::trace;

use crate::assoc::AssociatedDataStore;
use crate::error::{FormatError, PstResult, UnsupportedFeature};

/// Block-type tag of a property heap block.
pub const PROPERTY_BLOCK_TYPE: u16 = 0xBCEC;

const TABLE_SIGNATURE: u8 = 0xB5;
const TABLE_IDENTIFIER_SIZE: u8 = 2;
const TABLE_VALUE_SIZE: u8 = 6;

/// `PT_SHORT`: 16-bit signed integer, immediate.
pub const PT_SHORT: u16 = 0x0002;
/// `PT_LONG`: 32-bit signed integer, immediate.
pub const PT_LONG: u16 = 0x0003;
/// `PT_CURRENCY`: 64-bit fixed-point currency amount.
pub const PT_CURRENCY: u16 = 0x0006;
/// `PT_BOOLEAN`: immediate.
pub const PT_BOOLEAN: u16 = 0x000B;
/// `PT_LONGLONG`: 64-bit signed integer.
pub const PT_LONGLONG: u16 = 0x0014;
/// `PT_UNICODE`: UTF-16LE string.
pub const PT_UNICODE: u16 = 0x001F;
/// `PT_SYSTIME`: 64-bit Windows FILETIME.
pub const PT_SYSTIME: u16 = 0x0040;

/// One decrypted property heap block with its parsed table index.
///
/// The cursor list runs from `index_offset + (header_slot >> 4)` to the
/// end of the block; each adjacent cursor pair bounds one addressable
/// byte range.
#[derive(Clone)]
pub struct PropertyBlock {
    bytes: Vec<u8>,
    cursors: Vec<u16>,
    header_slot: u32,
}

impl fmt::Debug for PropertyBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyBlock")
            .field("size", &self.bytes.len())
            .field("cursors", &self.cursors.len())
            .field("header_slot", &self.header_slot)
            .finish()
    }
}

impl PropertyBlock {
    pub fn parse(bytes: Vec<u8>) -> PstResult<Self> {
        if bytes.len() < 8 {
            return Err(FormatError::BlockTooSmall(bytes.len()).into());
        }
        let mut cursor = Cursor::new(bytes.as_slice());
        // table-index offset
        let index_offset = cursor.read_u16::<LittleEndian>()?;
        // block type
        let block_type = cursor.read_u16::<LittleEndian>()?;
        // table-header slot
        let header_slot = cursor.read_u32::<LittleEndian>()?;
        if block_type != PROPERTY_BLOCK_TYPE {
            return Err(FormatError::InvalidBlockType(block_type).into());
        }

        let start = index_offset as usize + (header_slot >> 4) as usize;
        if start > bytes.len() {
            return Err(FormatError::TableIndexOutOfBounds {
                offset: start,
                size: bytes.len(),
            }
            .into());
        }
        let cursors = bytes[start..]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Ok(Self {
            bytes,
            cursors,
            header_slot,
        })
    }

    /// Byte range addressed by one value slot.
    fn resolve(&self, slot: u32) -> PstResult<&[u8]> {
        let pair = ((slot >> 4) / 2) as usize;
        if pair + 1 >= self.cursors.len() {
            return Err(FormatError::SlotOutOfRange(slot).into());
        }
        let start = self.cursors[pair];
        let end = self.cursors[pair + 1];
        if start > end {
            return Err(FormatError::InvalidTableRange { start, end }.into());
        }
        if end as usize > self.bytes.len() {
            return Err(FormatError::TableRangeOutOfBounds {
                start,
                end,
                size: self.bytes.len(),
            }
            .into());
        }
        Ok(&self.bytes[start as usize..end as usize])
    }
}

#[derive(Clone, Copy, Debug)]
struct PropertyRecord {
    key: u16,
    type_code: u16,
    slot: u32,
}

/// Decoded property table for one descriptor.
///
/// Holds the raw 8-byte records; values resolve on demand as the store is
/// iterated, so one malformed value does not poison its neighbors.
pub struct PropertyStore<'p> {
    block: PropertyBlock,
    records: Vec<PropertyRecord>,
    assoc: Option<AssociatedDataStore<'p>>,
}

impl fmt::Debug for PropertyStore<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyStore")
            .field("block", &self.block)
            .field("records", &self.records.len())
            .field("assoc", &self.assoc)
            .finish()
    }
}

impl<'p> PropertyStore<'p> {
    pub fn new(
        block: PropertyBlock,
        assoc: Option<AssociatedDataStore<'p>>,
    ) -> PstResult<Self> {
        let header = block.resolve(block.header_slot)?;
        if header.len() < 8 {
            return Err(FormatError::TableHeaderTooSmall(header.len()).into());
        }
        let mut cursor = Cursor::new(header);
        // signature
        let signature = cursor.read_u8()?;
        // identifier and value widths
        let identifier_size = cursor.read_u8()?;
        let value_size = cursor.read_u8()?;
        // table level, read past
        let _ = cursor.read_u8()?;
        // property-array slot
        let array_slot = cursor.read_u32::<LittleEndian>()?;

        if signature != TABLE_SIGNATURE {
            return Err(FormatError::InvalidTableSignature(signature).into());
        }
        if identifier_size != TABLE_IDENTIFIER_SIZE {
            return Err(FormatError::InvalidIdentifierSize(identifier_size).into());
        }
        if value_size != TABLE_VALUE_SIZE {
            return Err(FormatError::InvalidValueSize(value_size).into());
        }

        let array = block.resolve(array_slot)?;
        let mut records = Vec::with_capacity(array.len() / 8);
        for mut record in array.chunks_exact(8) {
            // key, type, value slot
            let key = record.read_u16::<LittleEndian>()?;
            let type_code = record.read_u16::<LittleEndian>()?;
            let slot = record.read_u32::<LittleEndian>()?;
            records.push(PropertyRecord {
                key,
                type_code,
                slot,
            });
        }
        trace!(count = records.len(), "property store loaded");

        Ok(Self {
            block,
            records,
            assoc,
        })
    }

    fn resolve_record(&self, record: PropertyRecord) -> PstResult<Property> {
        let value = match record.type_code {
            // immediates decode straight from the slot
            PT_SHORT => PropertyValue::Integer(i64::from(record.slot as u16 as i16)),
            PT_LONG => PropertyValue::Integer(i64::from(record.slot as i32)),
            PT_BOOLEAN => PropertyValue::Boolean(record.slot != 0),
            _ if record.slot & 0xF == 0xF => match &self.assoc {
                Some(store) => decode_value(record.type_code, &store.read(record.slot)?)?,
                None => return Err(UnsupportedFeature::ExternalReference(record.slot).into()),
            },
            _ => decode_value(record.type_code, self.block.resolve(record.slot)?)?,
        };
        Ok(Property {
            key: record.key,
            type_code: record.type_code,
            value,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Properties in stored order, each resolved as it is reached.
    pub fn iter(&self) -> Properties<'_> {
        Properties {
            store: self,
            position: 0,
        }
    }
}

/// Iterator over a store's properties.
pub struct Properties<'a> {
    store: &'a PropertyStore<'a>,
    position: usize,
}

impl Iterator for Properties<'_> {
    type Item = PstResult<Property>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = *self.store.records.get(self.position)?;
        self.position += 1;
        Some(self.store.resolve_record(record))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.store.records.len() - self.position;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Properties<'_> {}

/// One resolved MAPI property.
#[derive(Clone, Debug)]
pub struct Property {
    key: u16,
    type_code: u16,
    value: PropertyValue,
}

impl Property {
    pub fn key(&self) -> u16 {
        self.key
    }

    pub fn type_code(&self) -> u16 {
        self.type_code
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    pub fn into_value(self) -> PropertyValue {
        self.value
    }
}

/// A property value, decoded per its MAPI type code.
#[derive(Clone, PartialEq, Eq)]
pub enum PropertyValue {
    /// From an immediate boolean slot.
    Boolean(bool),
    /// Any of the 16, 32 or 64-bit integer types, sign-extended.
    Integer(i64),
    /// 100-nanosecond intervals since January 1, 1601.
    Filetime(i64),
    /// Re-encoded from UTF-16LE.
    String(String),
    /// Any type without a narrower decoding.
    Binary(Vec<u8>),
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(value) => write!(f, "Boolean({value})"),
            Self::Integer(value) => write!(f, "Integer({value})"),
            Self::Filetime(value) => write!(f, "Filetime(0x{value:016X})"),
            Self::String(value) => write!(f, "String({value:?})"),
            Self::Binary(value) => write!(f, "Binary({} bytes)", value.len()),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Filetime(value) => write!(f, "0x{value:016X}"),
            Self::String(value) => f.write_str(value),
            Self::Binary(value) => write!(f, "{} bytes", value.len()),
        }
    }
}

/// Decode raw value bytes per the MAPI type code.
///
/// Unknown codes are not an error here; anything without a narrower
/// decoding comes back as [`PropertyValue::Binary`]. Naming and further
/// interpretation belong to the caller's MAPI tables.
pub fn decode_value(type_code: u16, raw: &[u8]) -> PstResult<PropertyValue> {
    match type_code {
        PT_UNICODE => {
            if raw.len() % 2 != 0 {
                return Err(FormatError::InvalidUnicodeLength(raw.len()).into());
            }
            let units = raw
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
            let text = char::decode_utf16(units)
                .collect::<Result<String, _>>()
                .map_err(|error| FormatError::InvalidUnicodeValue(error.unpaired_surrogate()))?;
            Ok(PropertyValue::String(text))
        }
        PT_SYSTIME => Ok(PropertyValue::Filetime(read_i64(type_code, raw)?)),
        PT_CURRENCY | PT_LONGLONG => Ok(PropertyValue::Integer(read_i64(type_code, raw)?)),
        _ => Ok(PropertyValue::Binary(raw.to_vec())),
    }
}

fn read_i64(type_code: u16, raw: &[u8]) -> PstResult<i64> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| FormatError::InvalidScalarSize {
        type_code,
        expected: 8,
        actual: raw.len(),
    })?;
    Ok(i64::from_le_bytes(bytes))
}

/// Render one property using the caller's MAPI name tables.
///
/// `type_names` maps a type code to its semantic name and `tag_names`
/// maps (key, type code) to a display name. Anything absent from the
/// tables renders as hex.
pub fn describe_property(
    property: &Property,
    type_names: &HashMap<u16, &str>,
    tag_names: &HashMap<(u16, u16), &str>,
) -> String {
    let type_name = match type_names.get(&property.type_code()) {
        Some(name) => (*name).to_string(),
        None => format!("0x{:04X}", property.type_code()),
    };
    let tag_name = match tag_names.get(&(property.key(), property.type_code())) {
        Some(name) => (*name).to_string(),
        None => format!("0x{:04X}", property.key()),
    };
    format!("{tag_name} ({type_name}): {}", property.value())
}
