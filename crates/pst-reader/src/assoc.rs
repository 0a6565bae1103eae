//! The associated data store.
//!
//! A descriptor whose assoc_data_id is nonzero carries a secondary table
//! mapping local sub-ids to data blocks, used for values that do not fit
//! in the property heap. A referenced block either is the value itself or
//! starts with the segment-table marker, in which case it lists further
//! block ids whose decrypted contents concatenate into the value. Table
//! and segment-list blocks are internal metadata and are stored in the
//! clear even in encrypted containers; only value bytes decrypt.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use tracing::trace;

use crate::error::{FormatError, PstResult, UnsupportedFeature};
use crate::BlockSource;

/// Signature byte of an associated data block.
pub const ASSOC_SIGNATURE: u8 = 0x02;

/// First 16 bits of a block holding a segment table instead of a value.
pub const SEGMENT_TABLE_MARKER: u16 = 0x0101;

/// The high halves of entry ids are sometimes nonzero in real containers
/// and carry no known meaning; they are masked off on load.
const ENTRY_ID_MASK: u64 = 0xFFFF_FFFF;

/// Sub-id table for one descriptor.
pub struct AssociatedDataStore<'p> {
    source: &'p dyn BlockSource,
    entries: HashMap<u32, u64>,
}

impl<'p> AssociatedDataStore<'p> {
    /// Loads the table stored under `block_id`.
    pub fn load(source: &'p dyn BlockSource, block_id: u64) -> PstResult<Self> {
        let bytes = source.read_data_block(block_id)?;
        if bytes.len() < 4 {
            return Err(FormatError::BlockTooSmall(bytes.len()).into());
        }
        let mut cursor = Cursor::new(bytes.as_slice());
        // signature
        let signature = cursor.read_u8()?;
        if signature != ASSOC_SIGNATURE {
            return Err(FormatError::InvalidAssocSignature(signature).into());
        }
        // node type, read past
        let _ = cursor.read_u8()?;
        // entry count
        let count = cursor.read_u16::<LittleEndian>()?;
        if bytes.len() < 4 + usize::from(count) * 24 {
            return Err(FormatError::BlockTooSmall(bytes.len()).into());
        }

        let mut entries = HashMap::with_capacity(usize::from(count));
        for _ in 0..count {
            // sub-id and data block id, high halves masked
            let sub_id = cursor.read_u64::<LittleEndian>()? & ENTRY_ID_MASK;
            let data_id = cursor.read_u64::<LittleEndian>()? & ENTRY_ID_MASK;
            // continuation pointer of a multi-block chain
            let continuation = cursor.read_u64::<LittleEndian>()?;
            if continuation != 0 {
                return Err(UnsupportedFeature::AssociatedDataChain(continuation).into());
            }
            entries.insert(sub_id as u32, data_id);
        }
        trace!(block_id, count = entries.len(), "associated data store loaded");

        Ok(Self { source, entries })
    }

    /// Value bytes for one sub-id, reassembled across segments if needed.
    pub fn read(&self, sub_id: u32) -> PstResult<Vec<u8>> {
        let data_id = self
            .entries
            .get(&sub_id)
            .copied()
            .ok_or(FormatError::AssocEntryNotFound(sub_id))?;
        let mut bytes = self.source.read_data_block(data_id)?;
        if bytes.len() >= 2 && u16::from_le_bytes([bytes[0], bytes[1]]) == SEGMENT_TABLE_MARKER {
            self.read_segments(&bytes)
        } else {
            self.source.decrypt(&mut bytes);
            Ok(bytes)
        }
    }

    fn read_segments(&self, table: &[u8]) -> PstResult<Vec<u8>> {
        if table.len() < 8 {
            return Err(FormatError::BlockTooSmall(table.len()).into());
        }
        let mut cursor = Cursor::new(table);
        // marker
        let _ = cursor.read_u16::<LittleEndian>()?;
        // segment count
        let count = cursor.read_u16::<LittleEndian>()?;
        // declared total size, read past
        let _ = cursor.read_u32::<LittleEndian>()?;
        if table.len() < 8 + usize::from(count) * 8 {
            return Err(FormatError::BlockTooSmall(table.len()).into());
        }

        let mut value = Vec::new();
        for _ in 0..count {
            let segment_id = cursor.read_u64::<LittleEndian>()?;
            value.extend_from_slice(&self.source.read_decrypted_data_block(segment_id)?);
        }
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for AssociatedDataStore<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociatedDataStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode_block;
    use crate::index::BlockPointer;
    use crate::PstError;

    struct StubSource {
        blocks: Vec<(u64, Vec<u8>)>,
        encrypted: bool,
    }

    impl StubSource {
        fn new(encrypted: bool) -> Self {
            Self {
                blocks: Vec::new(),
                encrypted,
            }
        }

        fn push(&mut self, id: u64, bytes: Vec<u8>) {
            self.blocks.push((id, bytes));
        }
    }

    impl BlockSource for StubSource {
        fn find_block(&self, id: u64) -> PstResult<BlockPointer> {
            self.blocks
                .iter()
                .position(|(block_id, _)| *block_id == id)
                .map(|position| {
                    let size = self.blocks[position].1.len() as u16;
                    BlockPointer::new(id, position as u64, size)
                })
                .ok_or_else(|| FormatError::BlockNotFound(id).into())
        }

        fn read_block(&self, offset: u64, size: usize) -> PstResult<Vec<u8>> {
            let bytes = &self.blocks[offset as usize].1;
            assert_eq!(bytes.len(), size);
            Ok(bytes.clone())
        }

        fn decrypt(&self, bytes: &mut [u8]) {
            if self.encrypted {
                crate::encode::decode_block(bytes);
            }
        }
    }

    fn assoc_block(entries: &[(u64, u64, u64)]) -> Vec<u8> {
        let mut block = vec![ASSOC_SIGNATURE, 0x00];
        block.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for (sub_id, data_id, continuation) in entries {
            block.extend_from_slice(&sub_id.to_le_bytes());
            block.extend_from_slice(&data_id.to_le_bytes());
            block.extend_from_slice(&continuation.to_le_bytes());
        }
        block
    }

    fn segment_table(segment_ids: &[u64], total: u32) -> Vec<u8> {
        let mut block = Vec::new();
        block.extend_from_slice(&SEGMENT_TABLE_MARKER.to_le_bytes());
        block.extend_from_slice(&(segment_ids.len() as u16).to_le_bytes());
        block.extend_from_slice(&total.to_le_bytes());
        for id in segment_ids {
            block.extend_from_slice(&id.to_le_bytes());
        }
        block
    }

    #[test]
    fn test_entry_ids_are_masked() {
        let mut source = StubSource::new(false);
        source.push(
            0xBC,
            assoc_block(&[
                (0x8000_0000_0000_0061, 0xFFFF_FFFF_0000_00B4, 0),
                (0x62, 0xB8, 0),
            ]),
        );
        let store = AssociatedDataStore::load(&source, 0xBC).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.entries[&0x61], 0xB4);
        assert_eq!(store.entries[&0x62], 0xB8);
    }

    #[test]
    fn test_chain_is_rejected() {
        let mut source = StubSource::new(false);
        source.push(0xBC, assoc_block(&[(0x61, 0xB4, 0x77)]));
        let err = AssociatedDataStore::load(&source, 0xBC).unwrap_err();
        assert!(matches!(
            err,
            PstError::Unsupported(UnsupportedFeature::AssociatedDataChain(0x77))
        ));
    }

    #[test]
    fn test_bad_signature() {
        let mut source = StubSource::new(false);
        let mut block = assoc_block(&[]);
        block[0] = 0x03;
        source.push(0xBC, block);
        let err = AssociatedDataStore::load(&source, 0xBC).unwrap_err();
        assert!(matches!(
            err,
            PstError::Format(FormatError::InvalidAssocSignature(0x03))
        ));
    }

    #[test]
    fn test_single_block_value() {
        let mut source = StubSource::new(true);
        source.push(0xBC, assoc_block(&[(0x61, 0xB4, 0)]));
        let mut stored = b"secret".to_vec();
        encode_block(&mut stored);
        source.push(0xB4, stored);

        let store = AssociatedDataStore::load(&source, 0xBC).unwrap();
        assert_eq!(store.read(0x61).unwrap(), b"secret");
    }

    #[test]
    fn test_missing_sub_id() {
        let mut source = StubSource::new(false);
        source.push(0xBC, assoc_block(&[(0x61, 0xB4, 0)]));
        let store = AssociatedDataStore::load(&source, 0xBC).unwrap();
        let err = store.read(0x99).unwrap_err();
        assert!(matches!(
            err,
            PstError::Format(FormatError::AssocEntryNotFound(0x99))
        ));
    }

    #[test]
    fn test_segmented_value() {
        let mut source = StubSource::new(true);
        source.push(0xBC, assoc_block(&[(0x61, 0xB4, 0)]));
        // the table block stays in the clear; only the segments decrypt
        source.push(0xB4, segment_table(&[0xC0, 0xC4], 6));
        let mut first = b"Hell".to_vec();
        encode_block(&mut first);
        source.push(0xC0, first);
        let mut second = b"o!".to_vec();
        encode_block(&mut second);
        source.push(0xC4, second);

        let store = AssociatedDataStore::load(&source, 0xBC).unwrap();
        assert_eq!(store.read(0x61).unwrap(), b"Hello!");
    }

    #[test]
    fn test_missing_segment_block() {
        let mut source = StubSource::new(false);
        source.push(0xBC, assoc_block(&[(0x61, 0xB4, 0)]));
        source.push(0xB4, segment_table(&[0xC0], 4));
        let store = AssociatedDataStore::load(&source, 0xBC).unwrap();
        let err = store.read(0x61).unwrap_err();
        assert!(matches!(
            err,
            PstError::Format(FormatError::BlockNotFound(0xC0))
        ));
    }
}
