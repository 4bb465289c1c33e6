//! Inode-to-path resolution (component A, `BTRFS_IOC_INO_LOOKUP`).
//!
//! The scanner enumerates changed inodes straight out of the b-tree (§4.C) and never
//! learns a path for any of them. Before the locker can open a candidate it needs one,
//! so this module fills the gap the index leaves: read the inode's `INODE_REF` item to
//! get its parent directory id and file name, then ask the kernel to resolve the
//! parent's path with `INO_LOOKUP`, and join the two.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use crate::error::{DedupError, Kind, Result};
use crate::ioctl::{BtrfsOps, SearchKey, FS_TREE_OBJECTID, INODE_REF_KEY};

/// Resolves `inode_number` to a path under `mount_path`. Returns `Ok(None)` when the
/// inode has no `INODE_REF` (already unlinked, or a hardlink target this pass does not
/// disambiguate further — the first reference found is used).
pub fn resolve_path<O: BtrfsOps>(
    ops: &O,
    fd: RawFd,
    mount_path: &Path,
    inode_number: u64,
) -> Result<Option<PathBuf>> {
    let Some((parent_ino, name)) = find_inode_ref(ops, fd, inode_number)? else {
        return Ok(None);
    };
    let dir_path = ops.ino_lookup(fd, parent_ino)?;

    let mut full = mount_path.to_path_buf();
    if !dir_path.is_empty() {
        full.push(dir_path);
    }
    full.push(name);
    Ok(Some(full))
}

/// Reads the single `INODE_REF` item for `inode_number`, returning `(parent_inode,
/// file_name)`. The item's offset field carries the parent objectid; its body is
/// `struct btrfs_inode_ref { index: u64, name_len: u16, name: [u8] }`.
fn find_inode_ref<O: BtrfsOps>(
    ops: &O,
    fd: RawFd,
    inode_number: u64,
) -> Result<Option<(u64, String)>> {
    let key = SearchKey {
        tree_id: FS_TREE_OBJECTID,
        min_objectid: inode_number,
        max_objectid: inode_number,
        min_offset: 0,
        max_offset: u64::MAX,
        min_transid: 0,
        max_transid: u64::MAX,
        min_type: INODE_REF_KEY,
        max_type: INODE_REF_KEY,
        nr_items: 1,
        ..Default::default()
    };
    let items = ops.tree_search(fd, key)?;
    let Some(item) = items.into_iter().find(|i| i.header.item_type == INODE_REF_KEY) else {
        return Ok(None);
    };

    const HEADER_LEN: usize = 10; // index: u64, name_len: u16
    if item.data.len() < HEADER_LEN {
        return Err(DedupError::new(Kind::Mismatch, "truncated INODE_REF item"));
    }
    let name_len = u16::from_le_bytes([item.data[8], item.data[9]]) as usize;
    let name_bytes = item
        .data
        .get(HEADER_LEN..HEADER_LEN + name_len)
        .ok_or_else(|| DedupError::new(Kind::Mismatch, "truncated INODE_REF name"))?;

    Ok(Some((item.header.offset, String::from_utf8_lossy(name_bytes).into_owned())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioctl::{SearchHeader, SearchItem};
    use std::cell::RefCell;

    struct FakeOps {
        items: RefCell<Vec<SearchItem>>,
        dir_path: String,
    }

    impl BtrfsOps for FakeOps {
        fn tree_search(&self, _fd: RawFd, _key: SearchKey) -> Result<Vec<SearchItem>> {
            Ok(self.items.borrow_mut().drain(..).collect())
        }
        fn get_flags(&self, _fd: RawFd) -> Result<i32> {
            Ok(0)
        }
        fn set_flags(&self, _fd: RawFd, _flags: i32) -> Result<()> {
            Ok(())
        }
        fn subvol_get_flags(&self, _fd: RawFd) -> Result<u64> {
            Ok(0)
        }
        fn ino_lookup(&self, _fd: RawFd, _objectid: u64) -> Result<String> {
            Ok(self.dir_path.clone())
        }
        fn subvol_tree_id(&self, _fd: RawFd) -> Result<u64> {
            Ok(0)
        }
        fn clone_file(&self, _dest: RawFd, _src: RawFd) -> Result<()> {
            Ok(())
        }
        fn clone_range(
            &self,
            _dest: RawFd,
            _src: RawFd,
            _src_offset: u64,
            _len: u64,
            _dest_offset: u64,
        ) -> Result<()> {
            Ok(())
        }
        fn defrag_range(&self, _fd: RawFd, _start: u64, _len: u64) -> Result<()> {
            Ok(())
        }
        fn current_transid(&self, _fd: RawFd) -> Result<u64> {
            Ok(0)
        }
    }

    fn inode_ref_item(parent: u64, child: u64, name: &str) -> SearchItem {
        let mut data = Vec::new();
        data.extend_from_slice(&0u64.to_le_bytes()); // index, unused here
        data.extend_from_slice(&(name.len() as u16).to_le_bytes());
        data.extend_from_slice(name.as_bytes());
        SearchItem {
            header: SearchHeader {
                transid: 1,
                objectid: child,
                offset: parent,
                item_type: INODE_REF_KEY,
                len: data.len() as u32,
            },
            data,
        }
    }

    #[test]
    fn resolves_path_from_inode_ref_and_lookup() {
        let ops = FakeOps {
            items: RefCell::new(vec![inode_ref_item(256, 257, "photo.raw")]),
            dir_path: "Pictures".to_string(),
        };
        let resolved = resolve_path(&ops, 0, Path::new("/mnt/data"), 257).unwrap();
        assert_eq!(resolved, Some(PathBuf::from("/mnt/data/Pictures/photo.raw")));
    }

    #[test]
    fn root_directory_lookup_yields_bare_mount_path() {
        let ops = FakeOps {
            items: RefCell::new(vec![inode_ref_item(5, 258, "top-level.bin")]),
            dir_path: String::new(),
        };
        let resolved = resolve_path(&ops, 0, Path::new("/mnt/data"), 258).unwrap();
        assert_eq!(resolved, Some(PathBuf::from("/mnt/data/top-level.bin")));
    }

    #[test]
    fn missing_inode_ref_yields_none() {
        let ops = FakeOps {
            items: RefCell::new(vec![]),
            dir_path: String::new(),
        };
        let resolved = resolve_path(&ops, 0, Path::new("/mnt/data"), 999).unwrap();
        assert_eq!(resolved, None);
    }
}
