//! Typed wrappers over the Btrfs and generic-filesystem ioctls the agent drives.
//!
//! Every structure here matches the kernel ABI bit-for-bit: fixed widths, explicit
//! padding, `#[repr(C)]` (or `packed` where the kernel itself packs). The wrappers are
//! grouped behind the [`BtrfsOps`] trait so that the scanner, locker and cloner are
//! generic over the capability instead of calling `libc::ioctl` directly, which lets
//! tests drive them against a fake implementation without a real Btrfs filesystem.

use std::ffi::c_long;
use std::fs::File;
use std::io;
use std::io::Error;
use std::mem::size_of;
use std::os::fd::{AsRawFd, RawFd};

use crate::error::{DedupError, Kind, Result};

/// ioctl command-number composition, following the same bit layout as `linux/ioctl.h`.
macro_rules! ioc {
    ($dir:expr, $ty:expr, $nr:expr, $size:expr) => {
        (($dir) << 30) | (($ty) << 8) | ($nr) | (($size) << 16)
    };
}

/// Read-only ioctl (kernel fills the argument).
macro_rules! ior {
    ($ty:expr, $nr:expr, $arg:ty) => {
        ioc!(2u64, $ty, $nr, size_of::<$arg>() as u64)
    };
}

/// Write-only ioctl (userspace fills the argument).
macro_rules! iow {
    ($ty:expr, $nr:expr, $arg:ty) => {
        ioc!(1u64, $ty, $nr, size_of::<$arg>() as u64)
    };
}

/// Read-write ioctl (both directions).
macro_rules! iowr {
    ($ty:expr, $nr:expr, $arg:ty) => {
        ioc!(3u64, $ty, $nr, size_of::<$arg>() as u64)
    };
}

/// ioctl type magic shared by every `BTRFS_IOC_*` command.
const BTRFS_MAGIC: u64 = 0x94;

/// `TREE_SEARCH` buffer size: one kernel batch, reused across calls.
pub const SEARCH_BUF_SIZE: usize = 16 * 1024;

/// `BTRFS_FS_TREE_OBJECTID`: every subvolume's own filesystem tree.
pub const FS_TREE_OBJECTID: u64 = 5;
/// `BTRFS_ROOT_TREE_OBJECTID`: the tree of tree-roots, holding one `ROOT_ITEM` per
/// subvolume.
pub const ROOT_TREE_OBJECTID: u64 = 1;
/// `BTRFS_INODE_ITEM_KEY`: the item type carrying `struct btrfs_inode_item`.
pub const INODE_ITEM_KEY: u32 = 1;
/// `BTRFS_ROOT_ITEM_KEY`: the item type carrying `struct btrfs_root_item`, keyed by the
/// subvolume's own tree id.
pub const ROOT_ITEM_KEY: u32 = 132;
/// `BTRFS_INODE_REF_KEY`: the parent-directory back-reference used to resolve a path.
pub const INODE_REF_KEY: u32 = 12;
/// `BTRFS_INO_LOOKUP_PATH_MAX`: size of the kernel's fixed path-name buffer.
pub const INO_LOOKUP_PATH_MAX: usize = 4080;

/// Mirrors `struct btrfs_ioctl_search_key`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct SearchKey {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub nr_items: u32,
    unused: u32,
    unused1: u64,
    unused2: u64,
    unused3: u64,
    unused4: u64,
}

/// Mirrors `struct btrfs_ioctl_search_args`: key followed by a fixed result buffer.
#[repr(C)]
pub struct SearchArgs {
    pub key: SearchKey,
    pub buf: [u8; SEARCH_BUF_SIZE],
}

/// Mirrors `struct btrfs_ioctl_search_header`, which precedes every item in the result
/// buffer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SearchHeader {
    pub transid: u64,
    pub objectid: u64,
    pub offset: u64,
    pub item_type: u32,
    pub len: u32,
}

impl SearchHeader {
    pub const SIZE: usize = size_of::<SearchHeader>();
}

/// A raw item returned by `tree_search`: its header plus the item's own bytes.
pub struct SearchItem {
    pub header: SearchHeader,
    pub data: Vec<u8>,
}

/// Mirrors `struct btrfs_timespec`: whole seconds plus nanoseconds, packed with no
/// padding, exactly as the kernel lays out `atime`/`ctime`/`mtime`/`otime`.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u32,
}

/// Mirrors the fixed-size prefix of `struct btrfs_inode_item` that this agent cares
/// about (size, transaction id, flags and mtime); the kernel's structure continues
/// with `ctime`/`otime` this agent never reads, but the layout keeps the fields it
/// does need first, so reading a prefix is safe.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct InodeItemPrefix {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub block_group: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u64,
    pub flags: u64,
    pub sequence: u64,
    reserved: [u64; 4],
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
}

/// `BTRFS_INODE_NODATACOW`, read straight off the inode item a `TREE_SEARCH` batch
/// already returns, so the candidate index's exclusion (§4.D) costs no extra ioctl:
/// set when the file was created NOCOW and therefore never has shareable,
/// checksum-backed extents.
pub const INODE_FLAG_NODATACOW: u64 = 1 << 1;

/// Mirrors `struct btrfs_ioctl_ino_lookup_args`: a directory objectid in, a path
/// relative to the subvolume root out. `treeid = 0` asks the kernel to resolve within
/// the subvolume the ioctl's fd already belongs to. `objectid = 0` is a special case:
/// the kernel does not resolve a path at all but instead fills `treeid` with the fd's
/// own subvolume tree id, which is how [`BtrfsOps::subvol_tree_id`] reads it back.
#[repr(C)]
pub struct InoLookupArgs {
    pub treeid: u64,
    pub objectid: u64,
    pub name: [u8; INO_LOOKUP_PATH_MAX],
}

impl Default for InoLookupArgs {
    fn default() -> Self {
        InoLookupArgs {
            treeid: 0,
            objectid: 0,
            name: [0u8; INO_LOOKUP_PATH_MAX],
        }
    }
}

/// Mirrors `struct btrfs_ioctl_clone_range_args`.
#[repr(C)]
pub struct CloneRangeArgs {
    pub src_fd: i64,
    pub src_offset: u64,
    pub src_length: u64,
    pub dest_offset: u64,
}

/// Mirrors `struct btrfs_ioctl_defrag_range_args`.
#[repr(C)]
#[derive(Default)]
pub struct DefragRangeArgs {
    pub start: u64,
    pub len: u64,
    pub flags: u64,
    pub extent_thresh: u32,
    pub compress_type: u32,
    unused: [u32; 4],
}

const IOC_TREE_SEARCH: u64 = iowr!(BTRFS_MAGIC, 17, SearchArgs);
const IOC_CLONE: u64 = iow!(BTRFS_MAGIC, 9, i32);
const IOC_CLONE_RANGE: u64 = iow!(BTRFS_MAGIC, 13, CloneRangeArgs);
const IOC_DEFRAG_RANGE: u64 = iow!(BTRFS_MAGIC, 16, DefragRangeArgs);
const IOC_SUBVOL_GETFLAGS: u64 = ior!(BTRFS_MAGIC, 25, u64);
const IOC_INO_LOOKUP: u64 = iowr!(BTRFS_MAGIC, 18, InoLookupArgs);

/// `FS_IOC_GETFLAGS` / `FS_IOC_SETFLAGS`, generic to every Linux filesystem, not just
/// Btrfs (magic `'f'` / 0x66).
const FS_IOC_GETFLAGS: u64 = ior!(0x66u64, 1, i32);
const FS_IOC_SETFLAGS: u64 = iow!(0x66u64, 2, i32);

/// `FS_IMMUTABLE_FL`, the inode attribute the safe-locker toggles.
pub const FS_IMMUTABLE_FL: i32 = 0x00000010;

fn check(ret: c_long, what: &'static str) -> Result<()> {
    if ret < 0 {
        let err = Error::last_os_error();
        let kind = match err.raw_os_error() {
            Some(libc::EOPNOTSUPP) | Some(libc::ENOTTY) => Kind::Unsupported,
            Some(libc::EPERM) | Some(libc::EACCES) => Kind::Permission,
            Some(libc::ENOENT) => Kind::Vanished,
            _ => Kind::IoError,
        };
        return Err(DedupError::from_io(kind, err, None).context(what));
    }
    Ok(())
}

/// The capability surface this agent needs from the kernel.
///
/// Implemented for real file descriptors by [`RealBtrfs`]; tests provide their own
/// implementation to exercise the scanner/locker/orchestrator without Btrfs.
pub trait BtrfsOps {
    /// Issues one `TREE_SEARCH` call and returns the raw items found, plus the key
    /// that should seed the next call (`None` once the kernel returns nothing).
    fn tree_search(&self, fd: RawFd, key: SearchKey) -> Result<Vec<SearchItem>>;

    /// Reads the generic inode attribute flags (`FS_IOC_GETFLAGS`).
    fn get_flags(&self, fd: RawFd) -> Result<i32>;

    /// Writes the generic inode attribute flags (`FS_IOC_SETFLAGS`).
    fn set_flags(&self, fd: RawFd, flags: i32) -> Result<()>;

    /// Reads the subvolume flags (`BTRFS_IOC_SUBVOL_GETFLAGS`), notably read-only.
    fn subvol_get_flags(&self, fd: RawFd) -> Result<u64>;

    /// Resolves `objectid` (a directory inode) to its path relative to the subvolume
    /// root via `BTRFS_IOC_INO_LOOKUP`. An empty string means the root itself.
    fn ino_lookup(&self, fd: RawFd, objectid: u64) -> Result<String>;

    /// Returns the tree id of the subvolume `fd` belongs to, via `BTRFS_IOC_INO_LOOKUP`
    /// with `objectid = 0` (§3: the `subvol_root_id` half of a volume's identity). This
    /// is distinct from the subvolume root directory's inode number, which is the fixed
    /// constant `BTRFS_FIRST_FREE_OBJECTID` (256) for every subvolume and so cannot
    /// distinguish one subvolume from another.
    fn subvol_tree_id(&self, fd: RawFd) -> Result<u64>;

    /// Clones the whole of `src` onto `dest` (`BTRFS_IOC_CLONE`).
    fn clone_file(&self, dest: RawFd, src: RawFd) -> Result<()>;

    /// Clones `len` bytes from `src_offset` in `src` to `dest_offset` in `dest`
    /// (`BTRFS_IOC_CLONE_RANGE`).
    fn clone_range(
        &self,
        dest: RawFd,
        src: RawFd,
        src_offset: u64,
        len: u64,
        dest_offset: u64,
    ) -> Result<()>;

    /// Requests defragmentation of `[start, start+len)` in the given file.
    fn defrag_range(&self, fd: RawFd, start: u64, len: u64) -> Result<()>;

    /// Returns the filesystem's current transaction id, used as the new watermark
    /// when a scan completes. Implemented via a zero-length `tree_search` on the
    /// root tree, whose header carries the current transid.
    fn current_transid(&self, fd: RawFd) -> Result<u64>;
}

/// The real, syscall-backed implementation of [`BtrfsOps`].
#[derive(Default, Clone, Copy)]
pub struct RealBtrfs;

impl BtrfsOps for RealBtrfs {
    fn tree_search(&self, fd: RawFd, key: SearchKey) -> Result<Vec<SearchItem>> {
        let mut args = SearchArgs {
            key,
            buf: [0u8; SEARCH_BUF_SIZE],
        };
        let ret = unsafe { libc::ioctl(fd, IOC_TREE_SEARCH as _, &mut args) };
        check(ret as c_long, "TREE_SEARCH")?;

        let nr = args.key.nr_items as usize;
        let mut items = Vec::with_capacity(nr);
        let mut offset = 0usize;
        for _ in 0..nr {
            if offset + SearchHeader::SIZE > args.buf.len() {
                break;
            }
            let header = unsafe {
                std::ptr::read_unaligned(args.buf[offset..].as_ptr() as *const SearchHeader)
            };
            offset += SearchHeader::SIZE;
            let len = header.len as usize;
            if offset + len > args.buf.len() {
                break;
            }
            let data = args.buf[offset..offset + len].to_vec();
            offset += len;
            items.push(SearchItem { header, data });
        }
        Ok(items)
    }

    fn get_flags(&self, fd: RawFd) -> Result<i32> {
        let mut flags: i32 = 0;
        let ret = unsafe { libc::ioctl(fd, FS_IOC_GETFLAGS as _, &mut flags) };
        check(ret as c_long, "FS_IOC_GETFLAGS")?;
        Ok(flags)
    }

    fn set_flags(&self, fd: RawFd, flags: i32) -> Result<()> {
        let ret = unsafe { libc::ioctl(fd, FS_IOC_SETFLAGS as _, &flags) };
        check(ret as c_long, "FS_IOC_SETFLAGS")
    }

    fn subvol_get_flags(&self, fd: RawFd) -> Result<u64> {
        let mut flags: u64 = 0;
        let ret = unsafe { libc::ioctl(fd, IOC_SUBVOL_GETFLAGS as _, &mut flags) };
        check(ret as c_long, "BTRFS_IOC_SUBVOL_GETFLAGS")?;
        Ok(flags)
    }

    fn ino_lookup(&self, fd: RawFd, objectid: u64) -> Result<String> {
        let mut args = InoLookupArgs {
            objectid,
            ..Default::default()
        };
        let ret = unsafe { libc::ioctl(fd, IOC_INO_LOOKUP as _, &mut args) };
        check(ret as c_long, "BTRFS_IOC_INO_LOOKUP")?;
        let end = args.name.iter().position(|&b| b == 0).unwrap_or(args.name.len());
        Ok(String::from_utf8_lossy(&args.name[..end]).into_owned())
    }

    fn subvol_tree_id(&self, fd: RawFd) -> Result<u64> {
        let mut args = InoLookupArgs {
            objectid: 0,
            ..Default::default()
        };
        let ret = unsafe { libc::ioctl(fd, IOC_INO_LOOKUP as _, &mut args) };
        check(ret as c_long, "BTRFS_IOC_INO_LOOKUP")?;
        Ok(args.treeid)
    }

    fn clone_file(&self, dest: RawFd, src: RawFd) -> Result<()> {
        let ret = unsafe { libc::ioctl(dest, IOC_CLONE as _, src as libc::c_long) };
        check(ret as c_long, "BTRFS_IOC_CLONE")
    }

    fn clone_range(
        &self,
        dest: RawFd,
        src: RawFd,
        src_offset: u64,
        len: u64,
        dest_offset: u64,
    ) -> Result<()> {
        let args = CloneRangeArgs {
            src_fd: src as i64,
            src_offset,
            src_length: len,
            dest_offset,
        };
        let ret = unsafe { libc::ioctl(dest, IOC_CLONE_RANGE as _, &args) };
        check(ret as c_long, "BTRFS_IOC_CLONE_RANGE")
    }

    fn defrag_range(&self, fd: RawFd, start: u64, len: u64) -> Result<()> {
        let args = DefragRangeArgs {
            start,
            len,
            ..Default::default()
        };
        let ret = unsafe { libc::ioctl(fd, IOC_DEFRAG_RANGE as _, &args) };
        check(ret as c_long, "BTRFS_IOC_DEFRAG_RANGE")
    }

    fn current_transid(&self, fd: RawFd) -> Result<u64> {
        // The root tree holds a ROOT_ITEM for every subvolume, each header stamped with
        // the transid of that subvolume's last commit. Scanning within a single
        // subvolume's own tree (as this used to do) only reflects writes to that one
        // subvolume's root directory; the highest transid across every ROOT_ITEM in the
        // root tree is a safe, monotonic upper bound for "the filesystem's current
        // transaction" regardless of which subvolume actually changed. Paginate the same
        // way `scan_since` does, since the root tree can hold more than one batch.
        let mut next_objectid = 0u64;
        let mut high = 0u64;
        loop {
            let key = SearchKey {
                tree_id: ROOT_TREE_OBJECTID,
                min_objectid: next_objectid,
                max_objectid: u64::MAX,
                min_offset: 0,
                max_offset: u64::MAX,
                min_transid: 0,
                max_transid: u64::MAX,
                min_type: ROOT_ITEM_KEY,
                max_type: ROOT_ITEM_KEY,
                nr_items: 512,
                ..Default::default()
            };
            let items = self.tree_search(fd, key)?;
            if items.is_empty() {
                break;
            }
            let batch_len = items.len();
            for item in &items {
                high = high.max(item.header.transid);
                next_objectid = next_objectid.max(item.header.objectid + 1);
            }
            if batch_len < 512 {
                break;
            }
        }
        Ok(high)
    }
}

/// Opens `path` the way the locker and scanner need: read-only, refusing to follow a
/// final symlink component.
pub fn open_nofollow(path: &std::path::Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
}

pub(crate) fn raw_fd(file: &File) -> RawFd {
    file.as_raw_fd()
}
