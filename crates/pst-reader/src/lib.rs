#![doc = include_str!("../README.md")]

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, trace};

pub mod assoc;
pub mod encode;
pub mod error;
pub mod header;
pub mod index;
pub mod props;

pub use crate::assoc::AssociatedDataStore;
pub use crate::encode::{decode_block, encode_block};
pub use crate::error::{FormatError, PstError, PstResult, UnsupportedFeature};
pub use crate::header::{Header, HEADER_SIZE};
pub use crate::index::{AllocationTable, BlockPointer, Descriptor, DescriptorTree};
pub use crate::props::{
    decode_value, describe_property, Properties, Property, PropertyBlock, PropertyStore,
    PropertyValue,
};

/// Descriptor id of the message store root in a well-formed container.
pub const ROOT_DESCRIPTOR_ID: u64 = 0x2;

/// Fills `buffer` from `offset`, failing if the source ends first.
pub(crate) fn read_full<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    buffer: &mut [u8],
) -> PstResult<()> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => {
                return Err(FormatError::TruncatedRead {
                    offset,
                    expected: buffer.len(),
                    actual: filled,
                }
                .into())
            }
            Ok(count) => filled += count,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error.into()),
        }
    }
    Ok(())
}

/// Narrow view of a container: allocation lookup plus positioned reads.
///
/// The property and associated data stores depend on this seam rather
/// than on [`PstFile`] itself, which keeps them testable against canned
/// sources.
pub trait BlockSource {
    /// Allocation-table lookup.
    fn find_block(&self, id: u64) -> PstResult<BlockPointer>;

    /// Positioned exact read.
    fn read_block(&self, offset: u64, size: usize) -> PstResult<Vec<u8>>;

    /// Reverses the substitution cipher in place, when the container
    /// uses it.
    fn decrypt(&self, bytes: &mut [u8]);

    /// Positioned exact read through the decryption layer.
    fn read_decrypted_block(&self, offset: u64, size: usize) -> PstResult<Vec<u8>> {
        let mut bytes = self.read_block(offset, size)?;
        self.decrypt(&mut bytes);
        Ok(bytes)
    }

    /// Raw bytes of the block registered under `id`.
    fn read_data_block(&self, id: u64) -> PstResult<Vec<u8>> {
        let block = self.find_block(id)?;
        self.read_block(block.offset(), usize::from(block.size()))
    }

    /// Decrypted bytes of the block registered under `id`.
    fn read_decrypted_data_block(&self, id: u64) -> PstResult<Vec<u8>> {
        let block = self.find_block(id)?;
        self.read_decrypted_block(block.offset(), usize::from(block.size()))
    }
}

/// An opened PST container.
///
/// The header and both index trees are parsed once at construction and
/// are read-only afterwards. The reader sits behind a mutex so positioned
/// reads work from shared references.
pub struct PstFile<R: Read + Seek> {
    reader: Mutex<R>,
    header: Header,
    descriptors: DescriptorTree,
    blocks: AllocationTable,
}

impl PstFile<File> {
    /// Opens a container on disk.
    pub fn open<P: AsRef<Path>>(path: P) -> PstResult<Self> {
        Self::new(File::open(path)?)
    }
}

impl<R: Read + Seek> PstFile<R> {
    /// Parses the header and loads both index trees from `reader`.
    pub fn new(mut reader: R) -> PstResult<Self> {
        let mut buffer = vec![0_u8; HEADER_SIZE];
        read_full(&mut reader, 0, &mut buffer)?;
        let header = Header::parse(&buffer)?;
        debug!(
            file_size = header.file_size(),
            encrypted = header.is_encrypted(),
            "header parsed"
        );

        let descriptors = DescriptorTree::read(&mut reader, header.descriptor_root())?;
        let blocks = AllocationTable::read(&mut reader, header.allocation_root())?;

        Ok(Self {
            reader: Mutex::new(reader),
            header,
            descriptors,
            blocks,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn descriptors(&self) -> &DescriptorTree {
        &self.descriptors
    }

    pub fn blocks(&self) -> &AllocationTable {
        &self.blocks
    }

    /// Descriptor-tree lookup.
    pub fn find_descriptor(&self, id: u64) -> PstResult<&Descriptor> {
        self.descriptors.find(id)
    }

    /// Builds the property store for one descriptor, attaching its
    /// associated data store when the descriptor carries one.
    pub fn load_properties(&self, descriptor: &Descriptor) -> PstResult<PropertyStore<'_>> {
        trace!(id = descriptor.id(), "loading properties");
        let assoc = match descriptor.assoc_data_id() {
            Some(assoc_data_id) => Some(AssociatedDataStore::load(self, assoc_data_id)?),
            None => None,
        };
        let bytes = self.read_decrypted_data_block(descriptor.data_id())?;
        let block = PropertyBlock::parse(bytes)?;
        PropertyStore::new(block, assoc)
    }
}

impl<R: Read + Seek> BlockSource for PstFile<R> {
    fn find_block(&self, id: u64) -> PstResult<BlockPointer> {
        self.blocks.find(id).copied()
    }

    fn read_block(&self, offset: u64, size: usize) -> PstResult<Vec<u8>> {
        // A poisoned lock only means another reader panicked mid-read;
        // the position is reset on every read, so the state is sound.
        let mut reader = match self.reader.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut buffer = vec![0_u8; size];
        read_full(&mut *reader, offset, &mut buffer)?;
        Ok(buffer)
    }

    fn decrypt(&self, bytes: &mut [u8]) {
        if self.header.is_encrypted() {
            decode_block(bytes);
        }
    }
}

impl<R: Read + Seek> fmt::Debug for PstFile<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PstFile")
            .field("header", &self.header)
            .field("descriptors", &self.descriptors.len())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_full_at_offset() {
        let mut reader = Cursor::new((0_u8..32).collect::<Vec<u8>>());
        let mut buffer = [0_u8; 4];
        read_full(&mut reader, 8, &mut buffer).unwrap();
        assert_eq!(buffer, [8, 9, 10, 11]);
    }

    #[test]
    fn test_read_full_truncated() {
        let mut reader = Cursor::new(vec![0_u8; 10]);
        let mut buffer = [0_u8; 16];
        let err = read_full(&mut reader, 4, &mut buffer).unwrap_err();
        assert!(matches!(
            err,
            PstError::Format(FormatError::TruncatedRead {
                offset: 4,
                expected: 16,
                actual: 6,
            })
        ));
    }
}
