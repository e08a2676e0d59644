//! Block-offset view of an open file.
//!
//! Files above the upload cutoff are tracked as an ordered list of
//! non-overlapping `[start, end)` blocks. A block only holds bytes once a
//! write touches it; clean blocks stay data-free so commit can move them
//! with a server-side part copy instead of a download+upload.

pub mod staged;

use uuid::Uuid;

pub const BLOCK_ID_LENGTH: usize = 32;

#[derive(Debug, Clone)]
pub struct Block {
    pub id: String,
    pub start: u64,
    pub end: u64,
    /// Present only after a write or an explicit materialization.
    pub data: Option<Vec<u8>>,
    /// Differs from the remote object; must be uploaded on commit.
    pub dirty: bool,
    /// Has no remote backing at all (zero-filled gap or extension), so
    /// there is nothing to fetch for it.
    pub truncated: bool,
}

impl Block {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Result of [`BlockOffsetList::find_blocks_to_modify`].
#[derive(Debug, PartialEq, Eq)]
pub struct ModifySpan {
    /// Index of the first block the write touches.
    pub index: usize,
    /// Total size of the touched blocks.
    pub size: u64,
    /// The write extends past the current end of the file.
    pub larger_than_file: bool,
    /// The write starts at or past the end, touching no existing block.
    pub append_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BlockOffsetList {
    pub blocks: Vec<Block>,
    /// Small files bypass the block machinery and are rewritten whole.
    pub small_file: bool,
    pub id_length: usize,
}

pub fn new_block_id(length: usize) -> String {
    let mut id = String::with_capacity(length);
    while id.len() < length {
        id.push_str(Uuid::new_v4().simple().to_string().as_str());
    }
    id.truncate(length);
    id
}

impl BlockOffsetList {
    pub fn new_small() -> Self {
        Self {
            blocks: Vec::new(),
            small_file: true,
            id_length: BLOCK_ID_LENGTH,
        }
    }

    /// Partition an existing remote object of `size` bytes into clean
    /// blocks of `part_size`, the last one cut to fit.
    pub fn from_size(size: u64, part_size: u64) -> Self {
        let mut blocks = Vec::new();
        let mut start = 0;
        while start < size {
            let end = (start + part_size).min(size);
            blocks.push(Block {
                id: new_block_id(BLOCK_ID_LENGTH),
                start,
                end,
                data: None,
                dirty: false,
                truncated: false,
            });
            start = end;
        }
        Self {
            blocks,
            small_file: false,
            id_length: BLOCK_ID_LENGTH,
        }
    }

    pub fn file_size(&self) -> u64 {
        self.blocks.last().map(|b| b.end).unwrap_or(0)
    }

    pub fn has_dirty(&self) -> bool {
        self.blocks.iter().any(|b| b.dirty)
    }

    /// Locate the block containing `offset`. Returns `(true, index)` on a
    /// hit, `(false, insertion_index)` when the offset is past every block.
    pub fn binary_search(&self, offset: u64) -> (bool, usize) {
        let mut lo = 0usize;
        let mut hi = self.blocks.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let block = &self.blocks[mid];
            if offset < block.start {
                hi = mid;
            } else if offset >= block.end {
                lo = mid + 1;
            } else {
                return (true, mid);
            }
        }
        (false, lo)
    }

    /// Describe which existing blocks a write of `length` bytes at
    /// `offset` touches.
    pub fn find_blocks_to_modify(&self, offset: u64, length: u64) -> ModifySpan {
        let write_end = offset + length;
        let file_size = self.file_size();
        let (found, index) = self.binary_search(offset);
        if !found {
            return ModifySpan {
                index,
                size: 0,
                larger_than_file: true,
                append_only: true,
            };
        }
        let mut size = 0;
        for block in &self.blocks[index..] {
            if block.start >= write_end {
                break;
            }
            size += block.len();
        }
        ModifySpan {
            index,
            size,
            larger_than_file: write_end > file_size,
            append_only: false,
        }
    }

    /// Append zero-backed dirty blocks until the file covers `new_end`.
    pub fn extend_to(&mut self, new_end: u64, part_size: u64) {
        let mut start = self.file_size();
        while start < new_end {
            let end = (start + part_size).min(new_end);
            self.blocks.push(Block {
                id: new_block_id(self.id_length.max(1)),
                start,
                end,
                data: None,
                dirty: true,
                truncated: true,
            });
            start = end;
        }
    }

    /// Resize to exactly `size` bytes. Growth appends zero blocks; shrink
    /// drops trailing blocks and cuts the straddling one. The block at the
    /// new end is left dirty so the next commit rewrites the object.
    pub fn truncate_to(&mut self, size: u64, part_size: u64) {
        let current = self.file_size();
        if size >= current {
            self.extend_to(size, part_size);
            return;
        }
        self.blocks.retain(|b| b.start < size);
        if let Some(last) = self.blocks.last_mut() {
            if last.end > size {
                last.end = size;
                let len = last.len() as usize;
                if let Some(data) = last.data.as_mut() {
                    data.truncate(len);
                }
            }
            last.dirty = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_block_list() -> BlockOffsetList {
        let mut bol = BlockOffsetList::from_size(12, 5);
        bol.blocks[0].end = 4;
        bol.blocks[1].start = 4;
        bol.blocks[1].end = 7;
        bol.blocks[2].start = 7;
        bol
    }

    #[test]
    fn test_binary_search() {
        let bol = three_block_list();
        assert_eq!(bol.binary_search(0), (true, 0));
        assert_eq!(bol.binary_search(5), (true, 1));
        assert_eq!(bol.binary_search(11), (true, 2));
        assert_eq!(bol.binary_search(20), (false, 3));
    }

    #[test]
    fn test_find_blocks_to_modify_interior() {
        let bol = three_block_list();
        let span = bol.find_blocks_to_modify(3, 7);
        assert_eq!(span.index, 0);
        assert_eq!(span.size, 12);
        assert!(!span.larger_than_file);
        assert!(!span.append_only);
    }

    #[test]
    fn test_find_blocks_to_modify_overrunning_tail() {
        let bol = three_block_list();
        let span = bol.find_blocks_to_modify(8, 10);
        assert_eq!(span.index, 2);
        assert_eq!(span.size, 5);
        assert!(span.larger_than_file);
        assert!(!span.append_only);
    }

    #[test]
    fn test_find_blocks_to_modify_past_end() {
        let bol = three_block_list();
        let span = bol.find_blocks_to_modify(20, 20);
        assert_eq!(span.size, 0);
        assert!(span.larger_than_file);
        assert!(span.append_only);
    }

    #[test]
    fn test_from_size_partition() {
        let bol = BlockOffsetList::from_size(21, 8);
        let bounds: Vec<(u64, u64)> = bol.blocks.iter().map(|b| (b.start, b.end)).collect();
        assert_eq!(bounds, vec![(0, 8), (8, 16), (16, 21)]);
        assert!(!bol.has_dirty());
        assert_eq!(bol.file_size(), 21);
    }

    #[test]
    fn test_extend_to_appends_zero_blocks() {
        let mut bol = BlockOffsetList::from_size(10, 8);
        bol.extend_to(30, 8);
        assert_eq!(bol.file_size(), 30);
        let tail: Vec<&Block> = bol.blocks.iter().filter(|b| b.start >= 10).collect();
        assert!(tail.iter().all(|b| b.dirty && b.truncated && b.data.is_none()));
        assert_eq!(tail.last().unwrap().end, 30);
    }

    #[test]
    fn test_truncate_to_shrinks_and_dirties() {
        let mut bol = BlockOffsetList::from_size(20, 8);
        bol.truncate_to(10, 8);
        assert_eq!(bol.file_size(), 10);
        assert_eq!(bol.blocks.len(), 2);
        assert_eq!(bol.blocks[1].end, 10);
        assert!(bol.blocks[1].dirty);
    }

    #[test]
    fn test_truncate_to_cuts_buffered_data() {
        let mut bol = BlockOffsetList::from_size(8, 8);
        bol.blocks[0].data = Some(b"01234567".to_vec());
        bol.truncate_to(5, 8);
        assert_eq!(bol.file_size(), 5);
        assert_eq!(bol.blocks[0].data.as_deref(), Some(&b"01234"[..]));
    }

    #[test]
    fn test_truncate_to_zero() {
        let mut bol = BlockOffsetList::from_size(20, 8);
        bol.truncate_to(0, 8);
        assert!(bol.blocks.is_empty());
        assert_eq!(bol.file_size(), 0);
    }

    #[test]
    fn test_block_id_length() {
        assert_eq!(new_block_id(32).len(), 32);
        assert_eq!(new_block_id(44).len(), 44);
    }
}
