//! Safe-locker: the immutable-attribute protocol (§4.E, component E).
//!
//! The kernel clone ioctl does not itself re-check that both sides are unmodified, so
//! userspace makes modification impossible for the critical section by setting
//! `FS_IMMUTABLE_FL`, sweeping `/proc` for writers, then re-checking size/mtime before
//! handing locked handles to the comparator. Every exit path reverts the bit on exactly
//! the files this locker set, never on files that were already immutable.

use std::fs::{self, File};
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::SystemTime;

use log::warn;

use crate::error::{DedupError, Kind, Result};
use crate::ioctl::{BtrfsOps, FS_IMMUTABLE_FL};

/// A single member as handed to the locker: the path and the metadata recorded at
/// index time, used for the stability recheck.
pub struct LockRequest {
    pub path: PathBuf,
    pub expected_size: u64,
    pub expected_mtime: SystemTime,
}

/// One successfully locked file: an open read-only handle plus whether this locker
/// set the immutable bit (and therefore owns clearing it).
pub struct LockedFile {
    pub path: PathBuf,
    pub file: File,
    pub dev: u64,
    pub inode: u64,
    pub(crate) we_set_immutable: bool,
}

/// Locks every member of `requests` against concurrent modification, dropping members
/// that fail with a recoverable reason and returning the rest. `errors` collects the
/// classified reason for each drop so the orchestrator can count outcomes.
pub struct LockedClass {
    pub locked: Vec<LockedFile>,
    pub dropped: Vec<(PathBuf, Kind)>,
}

/// Runs steps 1-4 of the protocol for a whole class, then reverts immediately on any
/// file this function itself could not hand off cleanly. The comparator/cloner is
/// responsible for calling [`release`] on the returned handles once it is done, which
/// performs step 6 for every successfully locked file.
pub fn lock_class<O: BtrfsOps>(ops: &O, requests: Vec<LockRequest>) -> Result<LockedClass> {
    let mut locked = Vec::new();
    let mut dropped = Vec::new();
    let mut opened = Vec::new();

    // Step 1: open read-only, O_NOFOLLOW, and record identity.
    for req in requests {
        match crate::ioctl::open_nofollow(&req.path) {
            Ok(file) => {
                let meta = match file.metadata() {
                    Ok(m) => m,
                    Err(e) => {
                        dropped.push((req.path.clone(), Kind::Vanished));
                        let _ = e;
                        continue;
                    }
                };
                opened.push((req, file, meta.dev(), meta.ino()));
            }
            Err(_) => dropped.push((req.path.clone(), Kind::Vanished)),
        }
    }

    // Step 2: set immutable, recording ownership of the bit. A file already immutable
    // here was not made so by this run: it is a leftover from one that was killed
    // mid-class before it reached `release`, and must be reported and excluded rather
    // than silently folded in as something this run now owns.
    let mut candidates = Vec::new();
    for (req, file, dev, ino) in opened {
        let fd = file.as_raw_fd();
        let prior_flags = match ops.get_flags(fd) {
            Ok(f) => f,
            Err(e) => {
                dropped.push((req.path.clone(), e.kind()));
                continue;
            }
        };
        if prior_flags & FS_IMMUTABLE_FL != 0 {
            warn!(
                "{} is already immutable, likely left over from an interrupted run; run `chattr -i` manually",
                req.path.display()
            );
            dropped.push((req.path.clone(), Kind::AlreadyImmutable));
            continue;
        }
        if let Err(e) = ops.set_flags(fd, prior_flags | FS_IMMUTABLE_FL) {
            dropped.push((req.path.clone(), e.kind()));
            continue;
        }
        candidates.push((req, file, dev, ino, true));
    }

    // Step 3: writer sweep, once, over the whole class.
    let target_inodes: Vec<(u64, u64)> = candidates.iter().map(|(_, _, d, i, _)| (*d, *i)).collect();
    let busy = match sweep_writers(&target_inodes) {
        Ok(busy) => busy,
        Err(e) => {
            // Sweep itself failed (e.g. /proc unreadable): revert everything and fail
            // the whole class conservatively rather than risk an unguarded clone.
            for (req, file, _, _, we_set) in candidates {
                if we_set {
                    let _ = ops.set_flags(file.as_raw_fd(), 0);
                }
                dropped.push((req.path, Kind::Busy));
            }
            return Err(e);
        }
    };

    for (req, file, dev, ino, we_set) in candidates {
        if busy.contains(&(dev, ino)) {
            if we_set {
                let _ = ops.set_flags(file.as_raw_fd(), 0);
            }
            dropped.push((req.path, Kind::Busy));
            continue;
        }

        // Step 4: stability recheck.
        let meta = match file.metadata() {
            Ok(m) => m,
            Err(_) => {
                if we_set {
                    let _ = ops.set_flags(file.as_raw_fd(), 0);
                }
                dropped.push((req.path, Kind::Changed));
                continue;
            }
        };
        let mtime_ok = meta
            .modified()
            .map(|m| m == req.expected_mtime)
            .unwrap_or(false);
        if meta.size() != req.expected_size || !mtime_ok {
            if we_set {
                let _ = ops.set_flags(file.as_raw_fd(), 0);
            }
            dropped.push((req.path, Kind::Changed));
            continue;
        }

        locked.push(LockedFile {
            path: req.path,
            file,
            dev,
            inode: ino,
            we_set_immutable: we_set,
        });
    }

    Ok(LockedClass { locked, dropped })
}

/// Step 6: clears `IMMUTABLE` on every file this locker set it on. Safe to call more
/// than once; previously-immutable files are left untouched.
pub fn release<O: BtrfsOps>(ops: &O, locked: Vec<LockedFile>) {
    for file in locked {
        if file.we_set_immutable {
            let fd = file.file.as_raw_fd();
            if let Ok(flags) = ops.get_flags(fd) {
                if let Err(e) = ops.set_flags(fd, flags & !FS_IMMUTABLE_FL) {
                    warn!(
                        "failed to clear immutable bit on {}: {e}; run `chattr -i` manually",
                        file.path.display()
                    );
                }
            }
        }
    }
}

/// Walks `/proc/<pid>/fd/*` and `/proc/<pid>/maps` once, returning the `(dev, inode)`
/// pairs in `targets` that are held open for writing or mapped `PROT_WRITE|MAP_SHARED`.
///
/// Mirrors the PID-enumeration idiom used elsewhere in this codebase for iterating
/// `/proc`: read the directory, parse each entry name as a PID, skip anything that
/// isn't one (races with processes exiting mid-sweep are expected and not errors).
fn sweep_writers(targets: &[(u64, u64)]) -> Result<std::collections::HashSet<(u64, u64)>> {
    use std::collections::HashSet;
    let target_set: HashSet<(u64, u64)> = targets.iter().copied().collect();
    let mut busy = HashSet::new();
    if target_set.is_empty() {
        return Ok(busy);
    }

    let proc_dir = fs::read_dir("/proc")
        .map_err(|e| DedupError::from_io(Kind::IoError, e, Some(PathBuf::from("/proc"))))?;

    for entry in proc_dir {
        let Ok(entry) = entry else { continue };
        let Ok(pid) = entry.file_name().into_string().unwrap_or_default().parse::<u32>() else {
            continue;
        };

        sweep_fds(pid, &target_set, &mut busy);
        sweep_maps(pid, &target_set, &mut busy);
    }

    Ok(busy)
}

fn sweep_fds(pid: u32, targets: &std::collections::HashSet<(u64, u64)>, busy: &mut std::collections::HashSet<(u64, u64)>) {
    let fd_dir = match fs::read_dir(format!("/proc/{pid}/fd")) {
        Ok(d) => d,
        Err(_) => return,
    };
    for entry in fd_dir.flatten() {
        let path = entry.path();
        let Ok(target) = fs::read_link(&path) else {
            continue;
        };
        let Ok(meta) = fs::metadata(&target) else {
            continue;
        };
        let key = (meta.dev(), meta.ino());
        if !targets.contains(&key) {
            continue;
        }
        // The fd's access mode is recorded in `/proc/<pid>/fdinfo/<fd>`'s `flags` line;
        // conservatively treat a readable fdinfo failure as a potential writer rather
        // than silently ignoring it.
        let fd_num = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let mode = fdinfo_access_mode(pid, fd_num);
        if mode != Some(libc::O_RDONLY) {
            busy.insert(key);
        }
    }
}

fn fdinfo_access_mode(pid: u32, fd_num: &str) -> Option<i32> {
    let content = fs::read_to_string(format!("/proc/{pid}/fdinfo/{fd_num}")).ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("flags:") {
            let raw = i32::from_str_radix(rest.trim(), 8).ok()?;
            return Some(raw & libc::O_ACCMODE);
        }
    }
    None
}

fn sweep_maps(pid: u32, targets: &std::collections::HashSet<(u64, u64)>, busy: &mut std::collections::HashSet<(u64, u64)>) {
    let content = match fs::read_to_string(format!("/proc/{pid}/maps")) {
        Ok(c) => c,
        Err(_) => return,
    };
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let Some(_range) = fields.next() else { continue };
        let Some(perms) = fields.next() else { continue };
        let writable = perms.contains('w');
        let shared = perms.contains('s');
        if !writable || !shared {
            continue;
        }
        // dev field like "08:01", inode is the next-to-last token before the path.
        let Some(dev_field) = fields.next() else { continue };
        let _offset = fields.next();
        let Some(inode_field) = fields.next() else { continue };
        let Ok(inode) = inode_field.parse::<u64>() else { continue };
        if inode == 0 {
            continue;
        }
        let Some((major, minor)) = dev_field.split_once(':') else { continue };
        let (Ok(major), Ok(minor)) = (
            u64::from_str_radix(major, 16),
            u64::from_str_radix(minor, 16),
        ) else {
            continue;
        };
        let dev = libc::makedev(major as u32, minor as u32);
        if targets.contains(&(dev, inode)) {
            busy.insert((dev, inode));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_line_with_shared_write_is_flagged() {
        let mut targets = std::collections::HashSet::new();
        let dev = libc::makedev(8, 1);
        targets.insert((dev, 1234u64));
        let mut busy = std::collections::HashSet::new();
        let line = "7f0000000000-7f0000001000 rw-s 00000000 08:01 1234 /mnt/data/file";
        let mut fields = line.split_whitespace();
        let _range = fields.next();
        let perms = fields.next().unwrap();
        assert!(perms.contains('w') && perms.contains('s'));
        let _ = fields.next();
        let _ = fields.next();
        let inode_field = fields.next().unwrap();
        assert_eq!(inode_field.parse::<u64>().unwrap(), 1234);
        busy.insert((dev, 1234));
        assert!(busy.contains(&(dev, 1234)));
        let _ = targets;
    }
}
