//! The two index B-trees.
//!
//! Both the descriptor hierarchy and the data-block allocation table are
//! stored as B-trees of 512-byte index nodes. A node is either a branch
//! (node_level > 0) of child pointers or a leaf of fixed-size records;
//! which leaf record applies is decided by the node-type tag. The trees
//! are walked once at open time into flat in-memory tables.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use tracing::debug;

use crate::error::{FormatError, PstResult};

/// Every index node occupies exactly this many bytes.
pub const INDEX_NODE_SIZE: usize = 512;

/// Node-type tag carried by descriptor tree nodes.
pub const DESCRIPTOR_NODE_TYPE: u16 = 0x8181;

/// Node-type tag carried by allocation tree nodes.
pub const ALLOCATION_NODE_TYPE: u16 = 0x8080;

const ITEM_COUNT_OFFSET: usize = 0x1E8;
const NODE_TYPE_OFFSET: usize = 0x1F0;
const BACK_PTR_OFFSET: usize = 0x1F8;

const BRANCH_ITEM_SIZE: u8 = 24;
const BRANCH_ITEM_MAX: u8 = 20;
const DESCRIPTOR_ITEM_SIZE: u8 = 32;
const DESCRIPTOR_ITEM_MAX: u8 = 15;
const ALLOCATION_ITEM_SIZE: u8 = 24;
const ALLOCATION_ITEM_MAX: u8 = 20;

/// Branch record: points at a child index node lower in the same tree.
#[derive(Clone, Copy, Debug)]
pub struct BranchRecord {
    id: u64,
    back_ptr: u64,
    offset: u64,
}

impl BranchRecord {
    fn read(f: &mut dyn Read) -> io::Result<Self> {
        // first id covered by the child
        let id = f.read_u64::<LittleEndian>()?;
        // child back-pointer
        let back_ptr = f.read_u64::<LittleEndian>()?;
        // child node file offset
        let offset = f.read_u64::<LittleEndian>()?;
        Ok(Self {
            id,
            back_ptr,
            offset,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn back_ptr(&self) -> u64 {
        self.back_ptr
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// One logical item (folder, message, attachment) in the descriptor tree.
#[derive(Clone, Debug)]
pub struct Descriptor {
    id: u64,
    data_id: u64,
    assoc_data_id: Option<u64>,
    parent_id: u64,
    children: Vec<u64>,
}

impl Descriptor {
    fn read(f: &mut dyn Read) -> io::Result<Self> {
        // id
        let id = f.read_u64::<LittleEndian>()?;
        // primary data block
        let data_id = f.read_u64::<LittleEndian>()?;
        // associated data block, zero when absent
        let assoc_data_id = f.read_u64::<LittleEndian>()?;
        // parent descriptor
        let parent_id = u64::from(f.read_u32::<LittleEndian>()?);
        Ok(Self {
            id,
            data_id,
            assoc_data_id: (assoc_data_id != 0).then_some(assoc_data_id),
            parent_id,
            children: Vec::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn data_id(&self) -> u64 {
        self.data_id
    }

    pub fn assoc_data_id(&self) -> Option<u64> {
        self.assoc_data_id
    }

    pub fn parent_id(&self) -> u64 {
        self.parent_id
    }

    /// Ids of the descriptors whose parent this one is.
    pub fn children(&self) -> &[u64] {
        &self.children
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_id == 0 || self.parent_id == self.id
    }
}

/// Location and length of one raw data block.
#[derive(Clone, Copy, Debug)]
pub struct BlockPointer {
    id: u64,
    offset: u64,
    size: u16,
}

impl BlockPointer {
    pub fn new(id: u64, offset: u64, size: u16) -> Self {
        Self { id, offset, size }
    }

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        // id
        let id = f.read_u64::<LittleEndian>()?;
        // file offset
        let offset = f.read_u64::<LittleEndian>()?;
        // byte size
        let size = f.read_u16::<LittleEndian>()?;
        // reference count and allocation page, read past
        let _ = f.read_u16::<LittleEndian>()?;
        let _ = f.read_u32::<LittleEndian>()?;
        Ok(Self { id, offset, size })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u16 {
        self.size
    }
}

/// Decoded records of one index node.
#[derive(Clone, Debug)]
pub enum NodeRecords {
    Branches(Vec<BranchRecord>),
    Descriptors(Vec<Descriptor>),
    Blocks(Vec<BlockPointer>),
}

/// One 512-byte index node.
///
/// The trailing metadata is validated before any record is decoded; a node
/// that declares more items than its kind allows, or the wrong stride,
/// never yields records.
#[derive(Clone, Debug)]
pub struct IndexNode {
    level: u8,
    node_type: u16,
    back_ptr: u64,
    records: NodeRecords,
}

impl IndexNode {
    pub fn parse(buffer: &[u8], expected_type: u16) -> PstResult<Self> {
        if buffer.len() < INDEX_NODE_SIZE {
            return Err(FormatError::TruncatedRead {
                offset: 0,
                expected: INDEX_NODE_SIZE,
                actual: buffer.len(),
            }
            .into());
        }

        let mut cursor = Cursor::new(buffer);

        // item count, max, size, level
        cursor.seek(SeekFrom::Start(ITEM_COUNT_OFFSET as u64))?;
        let item_count = cursor.read_u8()?;
        let item_max = cursor.read_u8()?;
        let item_size = cursor.read_u8()?;
        let level = cursor.read_u8()?;

        // node type
        cursor.seek(SeekFrom::Start(NODE_TYPE_OFFSET as u64))?;
        let node_type = cursor.read_u16::<LittleEndian>()?;

        // back-pointer
        cursor.seek(SeekFrom::Start(BACK_PTR_OFFSET as u64))?;
        let back_ptr = cursor.read_u64::<LittleEndian>()?;

        if node_type != DESCRIPTOR_NODE_TYPE && node_type != ALLOCATION_NODE_TYPE {
            return Err(FormatError::InvalidNodeType(node_type).into());
        }
        if node_type != expected_type {
            return Err(FormatError::UnexpectedNodeType {
                expected: expected_type,
                actual: node_type,
            }
            .into());
        }

        let (expected_max, expected_size) = if level > 0 {
            (BRANCH_ITEM_MAX, BRANCH_ITEM_SIZE)
        } else if node_type == DESCRIPTOR_NODE_TYPE {
            (DESCRIPTOR_ITEM_MAX, DESCRIPTOR_ITEM_SIZE)
        } else {
            (ALLOCATION_ITEM_MAX, ALLOCATION_ITEM_SIZE)
        };
        if item_max != expected_max {
            return Err(FormatError::InvalidNodeItemMax {
                expected: expected_max,
                actual: item_max,
            }
            .into());
        }
        if item_count > item_max {
            return Err(FormatError::NodeItemOverflow {
                count: item_count,
                max: item_max,
            }
            .into());
        }
        if item_size != expected_size {
            return Err(FormatError::InvalidNodeItemSize {
                expected: expected_size,
                actual: item_size,
            }
            .into());
        }

        let items = buffer[..item_count as usize * item_size as usize]
            .chunks_exact(item_size as usize);
        let records = if level > 0 {
            let branches = items
                .map(|mut item| BranchRecord::read(&mut item))
                .collect::<io::Result<_>>()?;
            NodeRecords::Branches(branches)
        } else if node_type == DESCRIPTOR_NODE_TYPE {
            let descriptors = items
                .map(|mut item| Descriptor::read(&mut item))
                .collect::<io::Result<_>>()?;
            NodeRecords::Descriptors(descriptors)
        } else {
            let blocks = items
                .map(|mut item| BlockPointer::read(&mut item))
                .collect::<io::Result<_>>()?;
            NodeRecords::Blocks(blocks)
        };

        Ok(Self {
            level,
            node_type,
            back_ptr,
            records,
        })
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn node_type(&self) -> u16 {
        self.node_type
    }

    pub fn back_ptr(&self) -> u64 {
        self.back_ptr
    }

    pub fn records(&self) -> &NodeRecords {
        &self.records
    }

    pub fn into_records(self) -> NodeRecords {
        self.records
    }
}

fn read_node<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    expected_type: u16,
) -> PstResult<IndexNode> {
    let mut buffer = vec![0_u8; INDEX_NODE_SIZE];
    crate::read_full(reader, offset, &mut buffer)?;
    IndexNode::parse(&buffer, expected_type)
}

/// The descriptor hierarchy, loaded whole.
///
/// Leaf records are collected into a flat table first and linked into
/// their parents in a second pass, so the order blocks present them in
/// never matters.
#[derive(Clone, Debug)]
pub struct DescriptorTree {
    records: Vec<Descriptor>,
    top_level: Vec<u64>,
    root: Option<u64>,
}

impl DescriptorTree {
    pub fn read<R: Read + Seek>(reader: &mut R, root_offset: u64) -> PstResult<Self> {
        let mut records = Vec::new();
        Self::collect(reader, root_offset, &mut records)?;
        debug!(count = records.len(), "descriptor tree loaded");
        Self::link(records)
    }

    fn collect<R: Read + Seek>(
        reader: &mut R,
        offset: u64,
        records: &mut Vec<Descriptor>,
    ) -> PstResult<()> {
        let node = read_node(reader, offset, DESCRIPTOR_NODE_TYPE)?;
        match node.into_records() {
            NodeRecords::Branches(branches) => {
                for branch in branches {
                    Self::collect(reader, branch.offset(), records)?;
                }
            }
            NodeRecords::Descriptors(leaves) => records.extend(leaves),
            NodeRecords::Blocks(_) => {
                return Err(FormatError::UnexpectedNodeType {
                    expected: DESCRIPTOR_NODE_TYPE,
                    actual: ALLOCATION_NODE_TYPE,
                }
                .into())
            }
        }
        Ok(())
    }

    fn link(mut records: Vec<Descriptor>) -> PstResult<Self> {
        let positions: HashMap<u64, usize> = records
            .iter()
            .enumerate()
            .map(|(position, descriptor)| (descriptor.id(), position))
            .collect();

        let mut top_level = Vec::new();
        let mut root = None;
        for position in 0..records.len() {
            let id = records[position].id();
            let parent_id = records[position].parent_id();
            if parent_id == id {
                root = Some(id);
                top_level.push(id);
            } else if parent_id == 0 {
                top_level.push(id);
            } else {
                let parent = positions
                    .get(&parent_id)
                    .copied()
                    .ok_or(FormatError::MissingParent {
                        id,
                        parent: parent_id,
                    })?;
                records[parent].children.push(id);
            }
        }

        Ok(Self {
            records,
            top_level,
            root,
        })
    }

    pub fn find(&self, id: u64) -> PstResult<&Descriptor> {
        self.records
            .iter()
            .find(|descriptor| descriptor.id() == id)
            .ok_or_else(|| FormatError::DescriptorNotFound(id).into())
    }

    pub fn records(&self) -> &[Descriptor] {
        &self.records
    }

    /// Ids of descriptors with no parent, in discovery order.
    pub fn top_level(&self) -> &[u64] {
        &self.top_level
    }

    /// The self-parented descriptor, when the container has one.
    pub fn root(&self) -> Option<&Descriptor> {
        self.root.and_then(|id| self.find(id).ok())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Flat block id → (offset, size) table.
#[derive(Clone, Debug)]
pub struct AllocationTable {
    records: Vec<BlockPointer>,
}

impl AllocationTable {
    pub fn read<R: Read + Seek>(reader: &mut R, root_offset: u64) -> PstResult<Self> {
        let mut records = Vec::new();
        Self::collect(reader, root_offset, &mut records)?;
        debug!(count = records.len(), "allocation table loaded");
        Ok(Self { records })
    }

    fn collect<R: Read + Seek>(
        reader: &mut R,
        offset: u64,
        records: &mut Vec<BlockPointer>,
    ) -> PstResult<()> {
        let node = read_node(reader, offset, ALLOCATION_NODE_TYPE)?;
        match node.into_records() {
            NodeRecords::Branches(branches) => {
                for branch in branches {
                    Self::collect(reader, branch.offset(), records)?;
                }
            }
            NodeRecords::Blocks(leaves) => records.extend(leaves),
            NodeRecords::Descriptors(_) => {
                return Err(FormatError::UnexpectedNodeType {
                    expected: ALLOCATION_NODE_TYPE,
                    actual: DESCRIPTOR_NODE_TYPE,
                }
                .into())
            }
        }
        Ok(())
    }

    pub fn find(&self, id: u64) -> PstResult<&BlockPointer> {
        self.records
            .iter()
            .find(|block| block.id() == id)
            .ok_or_else(|| FormatError::BlockNotFound(id).into())
    }

    pub fn records(&self) -> &[BlockPointer] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PstError;

    fn node_buffer(
        node_type: u16,
        level: u8,
        item_size: u8,
        item_max: u8,
        items: &[Vec<u8>],
    ) -> Vec<u8> {
        let mut buffer = vec![0_u8; INDEX_NODE_SIZE];
        for (i, item) in items.iter().enumerate() {
            let start = i * item_size as usize;
            buffer[start..start + item.len()].copy_from_slice(item);
        }
        buffer[ITEM_COUNT_OFFSET] = items.len() as u8;
        buffer[ITEM_COUNT_OFFSET + 1] = item_max;
        buffer[ITEM_COUNT_OFFSET + 2] = item_size;
        buffer[ITEM_COUNT_OFFSET + 3] = level;
        buffer[NODE_TYPE_OFFSET..NODE_TYPE_OFFSET + 2].copy_from_slice(&node_type.to_le_bytes());
        buffer[BACK_PTR_OFFSET..BACK_PTR_OFFSET + 8].copy_from_slice(&0xABCD_u64.to_le_bytes());
        buffer
    }

    fn descriptor_item(id: u64, data_id: u64, assoc_data_id: u64, parent_id: u32) -> Vec<u8> {
        let mut item = Vec::with_capacity(32);
        item.extend_from_slice(&id.to_le_bytes());
        item.extend_from_slice(&data_id.to_le_bytes());
        item.extend_from_slice(&assoc_data_id.to_le_bytes());
        item.extend_from_slice(&parent_id.to_le_bytes());
        item.extend_from_slice(&[0; 4]);
        item
    }

    fn block_item(id: u64, offset: u64, size: u16) -> Vec<u8> {
        let mut item = Vec::with_capacity(24);
        item.extend_from_slice(&id.to_le_bytes());
        item.extend_from_slice(&offset.to_le_bytes());
        item.extend_from_slice(&size.to_le_bytes());
        item.extend_from_slice(&[0; 6]);
        item
    }

    fn branch_item(id: u64, back_ptr: u64, offset: u64) -> Vec<u8> {
        let mut item = Vec::with_capacity(24);
        item.extend_from_slice(&id.to_le_bytes());
        item.extend_from_slice(&back_ptr.to_le_bytes());
        item.extend_from_slice(&offset.to_le_bytes());
        item
    }

    #[test]
    fn test_parse_descriptor_leaf() {
        let buffer = node_buffer(
            DESCRIPTOR_NODE_TYPE,
            0,
            DESCRIPTOR_ITEM_SIZE,
            DESCRIPTOR_ITEM_MAX,
            &[
                descriptor_item(0x2, 0xB4, 0, 0x2),
                descriptor_item(0x21, 0xB8, 0xBC, 0x2),
            ],
        );
        let node = IndexNode::parse(&buffer, DESCRIPTOR_NODE_TYPE).unwrap();
        assert_eq!(node.level(), 0);
        assert_eq!(node.node_type(), DESCRIPTOR_NODE_TYPE);
        assert_eq!(node.back_ptr(), 0xABCD);

        let NodeRecords::Descriptors(records) = node.records() else {
            panic!("expected descriptor records");
        };
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id(), 0x2);
        assert_eq!(records[0].data_id(), 0xB4);
        assert_eq!(records[0].assoc_data_id(), None);
        assert_eq!(records[0].parent_id(), 0x2);
        assert!(records[0].is_top_level());
        assert_eq!(records[1].assoc_data_id(), Some(0xBC));
        assert!(!records[1].is_top_level());
    }

    #[test]
    fn test_parse_allocation_leaf() {
        let buffer = node_buffer(
            ALLOCATION_NODE_TYPE,
            0,
            ALLOCATION_ITEM_SIZE,
            ALLOCATION_ITEM_MAX,
            &[block_item(0xB4, 0x8000, 0x6C)],
        );
        let node = IndexNode::parse(&buffer, ALLOCATION_NODE_TYPE).unwrap();
        let NodeRecords::Blocks(records) = node.records() else {
            panic!("expected block records");
        };
        assert_eq!(records[0].id(), 0xB4);
        assert_eq!(records[0].offset(), 0x8000);
        assert_eq!(records[0].size(), 0x6C);
    }

    #[test]
    fn test_item_count_overflow() {
        let mut buffer = node_buffer(
            DESCRIPTOR_NODE_TYPE,
            0,
            DESCRIPTOR_ITEM_SIZE,
            DESCRIPTOR_ITEM_MAX,
            &[descriptor_item(0x2, 0xB4, 0, 0)],
        );
        buffer[ITEM_COUNT_OFFSET] = DESCRIPTOR_ITEM_MAX + 1;
        let err = IndexNode::parse(&buffer, DESCRIPTOR_NODE_TYPE).unwrap_err();
        assert!(matches!(
            err,
            PstError::Format(FormatError::NodeItemOverflow { count: 16, max: 15 })
        ));
    }

    #[test]
    fn test_unknown_node_type() {
        let buffer = node_buffer(0x1234, 0, DESCRIPTOR_ITEM_SIZE, DESCRIPTOR_ITEM_MAX, &[]);
        let err = IndexNode::parse(&buffer, DESCRIPTOR_NODE_TYPE).unwrap_err();
        assert!(matches!(
            err,
            PstError::Format(FormatError::InvalidNodeType(0x1234))
        ));
    }

    #[test]
    fn test_mismatched_node_type() {
        let buffer = node_buffer(
            ALLOCATION_NODE_TYPE,
            0,
            ALLOCATION_ITEM_SIZE,
            ALLOCATION_ITEM_MAX,
            &[],
        );
        let err = IndexNode::parse(&buffer, DESCRIPTOR_NODE_TYPE).unwrap_err();
        assert!(matches!(
            err,
            PstError::Format(FormatError::UnexpectedNodeType {
                expected: DESCRIPTOR_NODE_TYPE,
                actual: ALLOCATION_NODE_TYPE,
            })
        ));
    }

    #[test]
    fn test_wrong_item_size() {
        let buffer = node_buffer(DESCRIPTOR_NODE_TYPE, 0, 24, DESCRIPTOR_ITEM_MAX, &[]);
        let err = IndexNode::parse(&buffer, DESCRIPTOR_NODE_TYPE).unwrap_err();
        assert!(matches!(
            err,
            PstError::Format(FormatError::InvalidNodeItemSize {
                expected: 32,
                actual: 24,
            })
        ));
    }

    #[test]
    fn test_descriptor_tree_two_level() {
        // Root branch at 0 pointing at two leaves; the child of 0x21 sits in
        // the first leaf, before its parent is discovered in the second.
        let mut image = node_buffer(
            DESCRIPTOR_NODE_TYPE,
            1,
            BRANCH_ITEM_SIZE,
            BRANCH_ITEM_MAX,
            &[branch_item(0x2, 0x10, 512), branch_item(0x21, 0x11, 1024)],
        );
        image.extend(node_buffer(
            DESCRIPTOR_NODE_TYPE,
            0,
            DESCRIPTOR_ITEM_SIZE,
            DESCRIPTOR_ITEM_MAX,
            &[
                descriptor_item(0x61, 0xC0, 0, 0x21),
                descriptor_item(0x2, 0xB4, 0, 0x2),
            ],
        ));
        image.extend(node_buffer(
            DESCRIPTOR_NODE_TYPE,
            0,
            DESCRIPTOR_ITEM_SIZE,
            DESCRIPTOR_ITEM_MAX,
            &[
                descriptor_item(0x21, 0xB8, 0, 0x2),
                descriptor_item(0x8022, 0xD0, 0, 0),
            ],
        ));

        let tree = DescriptorTree::read(&mut Cursor::new(image), 0).unwrap();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.top_level(), &[0x2, 0x8022]);
        assert_eq!(tree.root().unwrap().id(), 0x2);
        assert_eq!(tree.find(0x2).unwrap().children(), &[0x21]);
        assert_eq!(tree.find(0x21).unwrap().children(), &[0x61]);
        assert!(tree.find(0x61).unwrap().children().is_empty());

        let err = tree.find(0x99).unwrap_err();
        assert!(matches!(
            err,
            PstError::Format(FormatError::DescriptorNotFound(0x99))
        ));
    }

    #[test]
    fn test_descriptor_missing_parent() {
        let image = node_buffer(
            DESCRIPTOR_NODE_TYPE,
            0,
            DESCRIPTOR_ITEM_SIZE,
            DESCRIPTOR_ITEM_MAX,
            &[descriptor_item(0x61, 0xC0, 0, 0x99)],
        );
        let err = DescriptorTree::read(&mut Cursor::new(image), 0).unwrap_err();
        assert!(matches!(
            err,
            PstError::Format(FormatError::MissingParent {
                id: 0x61,
                parent: 0x99,
            })
        ));
    }

    #[test]
    fn test_allocation_table() {
        let mut image = node_buffer(
            ALLOCATION_NODE_TYPE,
            1,
            BRANCH_ITEM_SIZE,
            BRANCH_ITEM_MAX,
            &[branch_item(0xB4, 0x20, 512)],
        );
        image.extend(node_buffer(
            ALLOCATION_NODE_TYPE,
            0,
            ALLOCATION_ITEM_SIZE,
            ALLOCATION_ITEM_MAX,
            &[block_item(0xB4, 0x8000, 0x6C), block_item(0xB8, 0x9000, 0x200)],
        ));

        let table = AllocationTable::read(&mut Cursor::new(image), 0).unwrap();
        assert_eq!(table.len(), 2);
        let block = table.find(0xB8).unwrap();
        assert_eq!(block.offset(), 0x9000);
        assert_eq!(block.size(), 0x200);

        let err = table.find(0xFF).unwrap_err();
        assert!(matches!(
            err,
            PstError::Format(FormatError::BlockNotFound(0xFF))
        ));
    }

    #[test]
    fn test_truncated_node() {
        let err = IndexNode::parse(&[0_u8; 100], DESCRIPTOR_NODE_TYPE).unwrap_err();
        assert!(matches!(
            err,
            PstError::Format(FormatError::TruncatedRead {
                expected: INDEX_NODE_SIZE,
                actual: 100,
                ..
            })
        ));
    }
}
