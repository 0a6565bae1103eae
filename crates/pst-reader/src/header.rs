//! Container header: the first 512 bytes of the file.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::{Cursor, Seek, SeekFrom};

use crate::error::{FormatError, PstResult};

/// Size of the fixed header at the start of every container.
pub const HEADER_SIZE: usize = 512;

/// The magic bytes are `!BDN`, read as a big-endian value.
const HEADER_MAGIC: u32 = u32::from_be_bytes(*b"!BDN");

/// File-type byte marking the encrypted variant of the format.
pub const ENCRYPTED_FILE_TYPE: u8 = 0x17;

pub const FILE_TYPE_OFFSET: u64 = 0x0A;
const FILE_SIZE_OFFSET: u64 = 0xB8;
const TREE_ROOTS_OFFSET: u64 = 0xD8;

/// Decoded container header.
///
/// Everything else in the file is reached from here: the two index-tree
/// roots are file offsets of 512-byte index nodes, and the file-type byte
/// decides whether data blocks go through the decryption layer.
#[derive(Clone, Debug)]
pub struct Header {
    file_type: u8,
    file_size: u64,
    descriptor_root_back_ptr: u64,
    descriptor_root: u64,
    allocation_root_back_ptr: u64,
    allocation_root: u64,
}

impl Header {
    pub fn parse(buffer: &[u8]) -> PstResult<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(FormatError::TruncatedRead {
                offset: 0,
                expected: HEADER_SIZE,
                actual: buffer.len(),
            }
            .into());
        }

        let mut cursor = Cursor::new(buffer);

        // magic
        let magic = cursor.read_u32::<BigEndian>()?;
        if magic != HEADER_MAGIC {
            return Err(FormatError::InvalidHeaderMagic(magic).into());
        }

        // file type
        cursor.seek(SeekFrom::Start(FILE_TYPE_OFFSET))?;
        let file_type = cursor.read_u8()?;

        // declared file size
        cursor.seek(SeekFrom::Start(FILE_SIZE_OFFSET))?;
        let file_size = cursor.read_u64::<LittleEndian>()?;

        // descriptor tree root back-pointer and offset
        cursor.seek(SeekFrom::Start(TREE_ROOTS_OFFSET))?;
        let descriptor_root_back_ptr = cursor.read_u64::<LittleEndian>()?;
        let descriptor_root = cursor.read_u64::<LittleEndian>()?;

        // allocation tree root back-pointer and offset
        let allocation_root_back_ptr = cursor.read_u64::<LittleEndian>()?;
        let allocation_root = cursor.read_u64::<LittleEndian>()?;

        Ok(Self {
            file_type,
            file_size,
            descriptor_root_back_ptr,
            descriptor_root,
            allocation_root_back_ptr,
            allocation_root,
        })
    }

    pub fn file_type(&self) -> u8 {
        self.file_type
    }

    /// Whether data blocks are stored under the substitution cipher.
    pub fn is_encrypted(&self) -> bool {
        self.file_type == ENCRYPTED_FILE_TYPE
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// File offset of the descriptor tree's root index node.
    pub fn descriptor_root(&self) -> u64 {
        self.descriptor_root
    }

    pub fn descriptor_root_back_ptr(&self) -> u64 {
        self.descriptor_root_back_ptr
    }

    /// File offset of the allocation tree's root index node.
    pub fn allocation_root(&self) -> u64 {
        self.allocation_root
    }

    pub fn allocation_root_back_ptr(&self) -> u64 {
        self.allocation_root_back_ptr
    }
}
