//! Error types shared by every decoding layer.

use std::io;
use thiserror::Error;

/// The container is structurally invalid, or one of the layout assumptions
/// this decoder makes was violated.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid header magic: 0x{0:08X}")]
    InvalidHeaderMagic(u32),
    #[error("Truncated read at offset 0x{offset:X}: expected {expected} bytes, got {actual}")]
    TruncatedRead {
        offset: u64,
        expected: usize,
        actual: usize,
    },
    #[error("Invalid index node type: 0x{0:04X}")]
    InvalidNodeType(u16),
    #[error("Unexpected index node type 0x{actual:04X}, expected 0x{expected:04X}")]
    UnexpectedNodeType { expected: u16, actual: u16 },
    #[error("Invalid index node item max {actual}, expected {expected}")]
    InvalidNodeItemMax { expected: u8, actual: u8 },
    #[error("Index node item count {count} exceeds max {max}")]
    NodeItemOverflow { count: u8, max: u8 },
    #[error("Invalid index node item size {actual}, expected {expected}")]
    InvalidNodeItemSize { expected: u8, actual: u8 },
    #[error("No descriptor with id 0x{0:X}")]
    DescriptorNotFound(u64),
    #[error("No data block with id 0x{0:X}")]
    BlockNotFound(u64),
    #[error("Descriptor 0x{id:X} references missing parent 0x{parent:X}")]
    MissingParent { id: u64, parent: u64 },
    #[error("Data block too small: {0} bytes")]
    BlockTooSmall(usize),
    #[error("Invalid data block type: 0x{0:04X}")]
    InvalidBlockType(u16),
    #[error("Table index offset 0x{offset:04X} outside block of {size} bytes")]
    TableIndexOutOfBounds { offset: usize, size: usize },
    #[error("Table slot 0x{0:08X} has no table index entry")]
    SlotOutOfRange(u32),
    #[error("Invalid table index range 0x{start:04X}..0x{end:04X}")]
    InvalidTableRange { start: u16, end: u16 },
    #[error("Table index range 0x{start:04X}..0x{end:04X} outside block of {size} bytes")]
    TableRangeOutOfBounds { start: u16, end: u16, size: usize },
    #[error("Table header range too small: {0} bytes")]
    TableHeaderTooSmall(usize),
    #[error("Invalid table header signature: 0x{0:02X}")]
    InvalidTableSignature(u8),
    #[error("Invalid table header identifier size: {0}")]
    InvalidIdentifierSize(u8),
    #[error("Invalid table header value size: {0}")]
    InvalidValueSize(u8),
    #[error("Invalid associated data signature: 0x{0:02X}")]
    InvalidAssocSignature(u8),
    #[error("No associated data entry for sub-id 0x{0:08X}")]
    AssocEntryNotFound(u32),
    #[error("Invalid UTF-16 value length: {0} bytes")]
    InvalidUnicodeLength(usize),
    #[error("Invalid UTF-16 code unit 0x{0:04X} in string value")]
    InvalidUnicodeValue(u16),
    #[error("Value of type 0x{type_code:04X} has {actual} bytes, expected {expected}")]
    InvalidScalarSize {
        type_code: u16,
        expected: usize,
        actual: usize,
    },
}

/// The construct is valid per the format, but decoding it is outside this
/// crate's scope.
#[derive(Error, Debug)]
pub enum UnsupportedFeature {
    #[error("Multi-block associated data chain: continuation 0x{0:016X}")]
    AssociatedDataChain(u64),
    #[error("External reference 0x{0:08X} without an associated data store")]
    ExternalReference(u32),
}

#[derive(Error, Debug)]
pub enum PstError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Unsupported(#[from] UnsupportedFeature),
    #[error("Read failed: {0}")]
    Io(#[from] io::Error),
}

pub type PstResult<T> = Result<T, PstError>;
