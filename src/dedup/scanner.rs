//! Incremental change scanner (§3 and §4.C, component C).
//!
//! Walks the subvolume's own b-tree with `TREE_SEARCH`, filtering by `min_transid` so a
//! scan only costs time proportional to what changed since the volume's last recorded
//! watermark, not the whole tree. Regular files are the only item kind tracked; the
//! watermark only advances once every item in a batch has been folded into the store,
//! so a scan interrupted partway through is safe to simply re-run.

use std::os::fd::RawFd;
use std::time::{Duration, SystemTime};

use log::debug;

use crate::error::Result;
use crate::ioctl::{BtrfsOps, SearchKey, FS_TREE_OBJECTID, INODE_ITEM_KEY};

/// A regular file discovered by a scan pass, with just the fields the candidate index
/// and store need: `(inode, size, generation, mtime)` per §4.C.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedInode {
    pub inode_number: u64,
    pub size: u64,
    pub generation: u64,
    pub mtime: SystemTime,
    pub nodatacow: bool,
}

/// `S_IFMT` mask and `S_IFREG` value, used to skip directories/symlinks/device nodes
/// without opening them.
const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;

/// Reads every `INODE_ITEM` in `[min_transid, u64::MAX]` from the subvolume rooted at
/// `fd`, paging through `TREE_SEARCH` until the kernel returns an empty batch.
///
/// Returns the scanned regular files and the highest transid observed, which becomes
/// the caller's next watermark. An empty result with `min_transid` unchanged signals
/// nothing changed since the last pass (§8: no regression past the high-water mark).
pub fn scan_since<O: BtrfsOps>(
    ops: &O,
    fd: RawFd,
    min_transid: u64,
) -> Result<(Vec<ScannedInode>, u64)> {
    let mut found = Vec::new();
    let mut high_watermark = min_transid;
    let mut next_objectid = 0u64;

    loop {
        let key = SearchKey {
            tree_id: FS_TREE_OBJECTID,
            min_objectid: next_objectid,
            max_objectid: u64::MAX,
            min_offset: 0,
            max_offset: u64::MAX,
            min_transid,
            max_transid: u64::MAX,
            min_type: INODE_ITEM_KEY,
            max_type: INODE_ITEM_KEY,
            nr_items: 512,
            ..Default::default()
        };
        let items = ops.tree_search(fd, key)?;
        if items.is_empty() {
            break;
        }
        let batch_len = items.len();
        for item in &items {
            high_watermark = high_watermark.max(item.header.transid);
            next_objectid = next_objectid.max(item.header.objectid + 1);
            if let Some(inode) = parse_inode_item(item) {
                found.push(inode);
            }
        }
        debug!("scanned batch of {batch_len} items, next_objectid={next_objectid}");
        if batch_len < 512 {
            break;
        }
    }

    Ok((found, high_watermark))
}

/// Confirms whether `inode_number` still has an `INODE_ITEM` in the subvolume's tree.
/// Used to decide whether a previously-tracked record can be dropped: a vanished
/// inode-item is the scanner's evidence the file no longer exists (§3).
pub fn inode_exists<O: BtrfsOps>(ops: &O, fd: RawFd, inode_number: u64) -> Result<bool> {
    let key = SearchKey {
        tree_id: FS_TREE_OBJECTID,
        min_objectid: inode_number,
        max_objectid: inode_number,
        min_offset: 0,
        max_offset: u64::MAX,
        min_transid: 0,
        max_transid: u64::MAX,
        min_type: INODE_ITEM_KEY,
        max_type: INODE_ITEM_KEY,
        nr_items: 1,
        ..Default::default()
    };
    let items = ops.tree_search(fd, key)?;
    Ok(items.iter().any(|i| i.header.item_type == INODE_ITEM_KEY))
}

fn parse_inode_item(item: &crate::ioctl::SearchItem) -> Option<ScannedInode> {
    use std::mem::size_of;
    const PREFIX_SIZE: usize = size_of::<crate::ioctl::InodeItemPrefix>();
    if item.data.len() < PREFIX_SIZE {
        return None;
    }
    let prefix = unsafe {
        std::ptr::read_unaligned(item.data.as_ptr() as *const crate::ioctl::InodeItemPrefix)
    };
    if prefix.mode & S_IFMT != S_IFREG {
        return None;
    }
    let mtime = SystemTime::UNIX_EPOCH
        + Duration::new(prefix.mtime.sec, prefix.mtime.nsec);
    Some(ScannedInode {
        inode_number: item.header.objectid,
        size: prefix.size,
        generation: prefix.generation,
        mtime,
        nodatacow: prefix.flags & crate::ioctl::INODE_FLAG_NODATACOW != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioctl::{SearchHeader, SearchItem};
    use std::cell::RefCell;
    use std::mem::size_of;

    struct FakeOps {
        batches: RefCell<Vec<Vec<SearchItem>>>,
    }

    fn inode_item_bytes(size: u64, generation: u64, mode: u32) -> Vec<u8> {
        inode_item_bytes_with_flags(size, generation, mode, 0)
    }

    fn inode_item_bytes_with_flags(size: u64, generation: u64, mode: u32, flags: u64) -> Vec<u8> {
        inode_item_bytes_full(size, generation, mode, flags, 0)
    }

    fn inode_item_bytes_full(
        size: u64,
        generation: u64,
        mode: u32,
        flags: u64,
        mtime_sec: u64,
    ) -> Vec<u8> {
        let prefix = crate::ioctl::InodeItemPrefix {
            generation,
            transid: generation,
            size,
            nbytes: size,
            nlink: 1,
            mode,
            flags,
            mtime: crate::ioctl::Timespec {
                sec: mtime_sec,
                nsec: 0,
            },
            ..Default::default()
        };
        let ptr = &prefix as *const _ as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, size_of::<crate::ioctl::InodeItemPrefix>()).to_vec() }
    }

    impl BtrfsOps for FakeOps {
        fn tree_search(
            &self,
            _fd: RawFd,
            _key: SearchKey,
        ) -> Result<Vec<SearchItem>> {
            Ok(self.batches.borrow_mut().pop().unwrap_or_default())
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
            Ok(String::new())
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

    #[test]
    fn scan_collects_regular_files_and_tracks_watermark() {
        let batch = vec![
            SearchItem {
                header: SearchHeader {
                    transid: 5,
                    objectid: 256,
                    offset: 0,
                    item_type: INODE_ITEM_KEY,
                    len: size_of::<crate::ioctl::InodeItemPrefix>() as u32,
                },
                data: inode_item_bytes(1024, 5, S_IFREG),
            },
            SearchItem {
                header: SearchHeader {
                    transid: 7,
                    objectid: 257,
                    offset: 0,
                    item_type: INODE_ITEM_KEY,
                    len: size_of::<crate::ioctl::InodeItemPrefix>() as u32,
                },
                // a directory, must be filtered out
                data: inode_item_bytes(0, 7, S_IFMT & 0o040000 | 0o040000),
            },
        ];
        let ops = FakeOps {
            batches: RefCell::new(vec![vec![], batch]),
        };
        let (found, watermark) = scan_since(&ops, 0, 3).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].inode_number, 256);
        assert_eq!(watermark, 7);
    }

    #[test]
    fn nodatacow_flag_is_carried_through() {
        let batch = vec![SearchItem {
            header: SearchHeader {
                transid: 9,
                objectid: 300,
                offset: 0,
                item_type: INODE_ITEM_KEY,
                len: size_of::<crate::ioctl::InodeItemPrefix>() as u32,
            },
            data: inode_item_bytes_with_flags(2048, 9, S_IFREG, crate::ioctl::INODE_FLAG_NODATACOW),
        }];
        let ops = FakeOps {
            batches: RefCell::new(vec![vec![], batch]),
        };
        let (found, _) = scan_since(&ops, 0, 0).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].nodatacow);
    }

    #[test]
    fn empty_batch_yields_no_change() {
        let ops = FakeOps {
            batches: RefCell::new(vec![vec![]]),
        };
        let (found, watermark) = scan_since(&ops, 0, 42).unwrap();
        assert!(found.is_empty());
        assert_eq!(watermark, 42);
    }

    #[test]
    fn inode_exists_true_when_item_present() {
        let batch = vec![SearchItem {
            header: SearchHeader {
                transid: 1,
                objectid: 500,
                offset: 0,
                item_type: INODE_ITEM_KEY,
                len: size_of::<crate::ioctl::InodeItemPrefix>() as u32,
            },
            data: inode_item_bytes(10, 1, S_IFREG),
        }];
        let ops = FakeOps {
            batches: RefCell::new(vec![batch]),
        };
        assert!(inode_exists(&ops, 0, 500).unwrap());
    }

    #[test]
    fn inode_exists_false_when_no_item_returned() {
        let ops = FakeOps {
            batches: RefCell::new(vec![vec![]]),
        };
        assert!(!inode_exists(&ops, 0, 500).unwrap());
    }
}
