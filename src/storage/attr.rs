//! Attributes surfaced for objects, directories and symlinks.

use crate::cadapter::keys::base_name;
use bitflags::bitflags;
use std::collections::HashMap;
use std::time::SystemTime;

/// Size reported for synthesized directory entries, matching what local
/// filesystems report for a directory inode.
pub const DIR_SIZE: u64 = 4096;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttrFlags: u8 {
        const DIR = 0b01;
        const SYMLINK = 0b10;
    }
}

#[derive(Debug, Clone)]
pub struct ObjectAttr {
    /// Logical path, prefix already stripped.
    pub path: String,
    pub name: String,
    pub size: u64,
    pub mtime: SystemTime,
    pub flags: AttrFlags,
    pub metadata: HashMap<String, String>,
}

impl ObjectAttr {
    pub fn file(
        path: String,
        size: u64,
        mtime: SystemTime,
        metadata: HashMap<String, String>,
    ) -> Self {
        let name = base_name(&path).to_string();
        Self {
            path,
            name,
            size,
            mtime,
            flags: AttrFlags::empty(),
            metadata,
        }
    }

    /// Directories have no single backing object, so size and mtime are
    /// synthesized.
    pub fn dir(path: String) -> Self {
        let name = base_name(&path).to_string();
        Self {
            path,
            name,
            size: DIR_SIZE,
            mtime: SystemTime::now(),
            flags: AttrFlags::DIR,
            metadata: HashMap::new(),
        }
    }

    pub fn symlink(
        path: String,
        size: u64,
        mtime: SystemTime,
        metadata: HashMap<String, String>,
    ) -> Self {
        let name = base_name(&path).to_string();
        Self {
            path,
            name,
            size,
            mtime,
            flags: AttrFlags::SYMLINK,
            metadata,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.flags.contains(AttrFlags::DIR)
    }

    pub fn is_symlink(&self) -> bool {
        self.flags.contains(AttrFlags::SYMLINK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_attr_synthesized() {
        let attr = ObjectAttr::dir("a/b".to_string());
        assert_eq!(attr.name, "b");
        assert_eq!(attr.size, DIR_SIZE);
        assert!(attr.is_dir());
        assert!(!attr.is_symlink());
    }

    #[test]
    fn test_file_attr_name() {
        let attr = ObjectAttr::file("x/y/z.txt".to_string(), 7, SystemTime::now(), HashMap::new());
        assert_eq!(attr.name, "z.txt");
        assert!(attr.flags.is_empty());
    }
}
