//! Comparator and cloner (§4.F, component F).
//!
//! Given a class of same-size locked files, picks a reference (first in canonical
//! order) and streams each candidate against it in fixed-size blocks. Equal candidates
//! are cloned onto the reference with `BTRFS_IOC_CLONE`; the immutable bit on the
//! destination is cleared only for the instant of the clone call and restored right
//! after, keeping the writer-sweep guarantee intact for the rest of the critical
//! section.

use std::io::Read;
use std::os::fd::AsRawFd;

use crate::error::Result;
use crate::ioctl::BtrfsOps;
use crate::locker::LockedFile;

/// One read block at a time; matches the size the spec calls out for the compare loop.
const COMPARE_BLOCK: usize = 128 * 1024;

/// The outcome of processing one non-reference member of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Bytes matched the reference and the clone ioctl succeeded.
    Cloned,
    /// Bytes differed from the reference; no clone attempted.
    Mismatch,
    /// A read or ioctl error occurred during compare or clone.
    Failed,
}

/// One candidate's outcome: its index into `members`, what happened, and (only
/// meaningful when `outcome == Outcome::Cloned`) the index of the reference it was
/// cloned onto — which may be any earlier-settled representative, not just `members[0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareResult {
    pub idx: usize,
    pub outcome: Outcome,
    pub reference_idx: usize,
}

/// Reduces `members` to its equality sub-classes and clones each sub-class onto its
/// first member. `members[0]` is the first reference; a candidate that mismatches
/// every reference seen so far becomes a new reference in turn, so the whole set
/// partitions into however many distinct byte-contents it actually contains rather
/// than comparing everything against a single, possibly wrong, first pick (§4.F/§4.G:
/// "the candidate is dropped... and the orchestrator may retry with a new reference").
/// `pre_defrag` issues `BTRFS_IOC_DEFRAG_RANGE` once per file, the first time it takes
/// part in a comparison; `allow_crossvol` gates whether a candidate may be paired with
/// a reference in a different subvolume at all. An I/O error during a compare or clone
/// aborts the rest of the class immediately (§7: "abort class, revert locks") rather
/// than treating only the one candidate as failed and continuing to the next.
pub fn reduce_and_clone<O: BtrfsOps>(
    ops: &O,
    members: &[LockedFile],
    pre_defrag: bool,
    allow_crossvol: bool,
) -> Vec<CompareResult> {
    let mut results = Vec::new();
    if members.is_empty() {
        return results;
    }

    let mut representatives = vec![0usize];
    let mut defragged = std::collections::HashSet::new();

    'outer: for idx in 1..members.len() {
        let candidate = &members[idx];
        let mut settled = false;

        for &rep_idx in &representatives {
            let reference = &members[rep_idx];
            if !allow_crossvol && candidate.dev != reference.dev {
                continue;
            }

            if pre_defrag {
                maybe_defrag(ops, reference, rep_idx, &mut defragged);
                maybe_defrag(ops, candidate, idx, &mut defragged);
            }

            match compare_bytes(reference, candidate) {
                Ok(true) => match clone_onto(ops, reference, candidate) {
                    Ok(()) => {
                        results.push(CompareResult { idx, outcome: Outcome::Cloned, reference_idx: rep_idx });
                        settled = true;
                        break;
                    }
                    Err(_) => {
                        results.push(CompareResult { idx, outcome: Outcome::Failed, reference_idx: rep_idx });
                        break 'outer;
                    }
                },
                Ok(false) => continue,
                Err(_) => {
                    results.push(CompareResult { idx, outcome: Outcome::Failed, reference_idx: idx });
                    break 'outer;
                }
            }
        }

        if !settled {
            results.push(CompareResult { idx, outcome: Outcome::Mismatch, reference_idx: idx });
            representatives.push(idx);
        }
    }

    results
}

fn maybe_defrag<O: BtrfsOps>(
    ops: &O,
    file: &LockedFile,
    idx: usize,
    defragged: &mut std::collections::HashSet<usize>,
) {
    if defragged.insert(idx) {
        let size = candidate_size(file);
        let _ = ops.defrag_range(file.file.as_raw_fd(), 0, size);
    }
}

fn candidate_size(file: &LockedFile) -> u64 {
    file.file.metadata().map(|m| m.len()).unwrap_or(0)
}

/// Streams both files in lockstep, comparing `COMPARE_BLOCK`-sized chunks.
fn compare_bytes(reference: &LockedFile, candidate: &LockedFile) -> Result<bool> {
    let mut a = reference.file.try_clone()?;
    let mut b = candidate.file.try_clone()?;
    use std::io::Seek;
    a.seek(std::io::SeekFrom::Start(0))?;
    b.seek(std::io::SeekFrom::Start(0))?;

    let mut buf_a = vec![0u8; COMPARE_BLOCK];
    let mut buf_b = vec![0u8; COMPARE_BLOCK];
    loop {
        let read_a = a.read(&mut buf_a)?;
        let read_b = b.read(&mut buf_b)?;
        if read_a != read_b {
            return Ok(false);
        }
        if read_a == 0 {
            return Ok(true);
        }
        if buf_a[..read_a] != buf_b[..read_b] {
            return Ok(false);
        }
    }
}

/// Clears immutable on the destination, clones, then restores it, regardless of
/// outcome.
fn clone_onto<O: BtrfsOps>(ops: &O, reference: &LockedFile, candidate: &LockedFile) -> Result<()> {
    let dest_fd = candidate.file.as_raw_fd();
    let prior_flags = ops.get_flags(dest_fd)?;
    ops.set_flags(dest_fd, prior_flags & !crate::ioctl::FS_IMMUTABLE_FL)?;

    let clone_result = ops.clone_file(dest_fd, reference.file.as_raw_fd());

    let restore_result = ops.set_flags(dest_fd, prior_flags);
    clone_result?;
    restore_result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn locked(content: &[u8]) -> LockedFile {
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(content).unwrap();
        let meta = tmp.metadata().unwrap();
        LockedFile {
            path: std::path::PathBuf::from("/tmp/fake"),
            dev: meta.dev(),
            inode: meta.ino(),
            file: tmp,
            we_set_immutable: false,
        }
    }

    use std::os::unix::fs::MetadataExt;

    #[test]
    fn identical_content_compares_equal() {
        let a = locked(b"hello world");
        let b = locked(b"hello world");
        assert!(compare_bytes(&a, &b).unwrap());
    }

    #[test]
    fn differing_content_compares_unequal() {
        let a = locked(b"hello world");
        let b = locked(b"hello worlD");
        assert!(!compare_bytes(&a, &b).unwrap());
    }

    #[test]
    fn differing_length_compares_unequal() {
        let a = locked(b"short");
        let b = locked(b"a bit longer");
        assert!(!compare_bytes(&a, &b).unwrap());
    }

    use std::os::fd::RawFd;

    struct NoopOps;

    impl BtrfsOps for NoopOps {
        fn tree_search(
            &self,
            _fd: RawFd,
            _key: crate::ioctl::SearchKey,
        ) -> Result<Vec<crate::ioctl::SearchItem>> {
            Ok(Vec::new())
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

    struct FailCloneOps;

    impl BtrfsOps for FailCloneOps {
        fn tree_search(
            &self,
            _fd: RawFd,
            _key: crate::ioctl::SearchKey,
        ) -> Result<Vec<crate::ioctl::SearchItem>> {
            Ok(Vec::new())
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
            Err(crate::error::DedupError::new(crate::error::Kind::IoError, "boom"))
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
    fn clone_failure_aborts_remaining_candidates() {
        let members = vec![locked(b"same"), locked(b"same"), locked(b"same")];
        let results = reduce_and_clone(&FailCloneOps, &members, false, true);
        assert_eq!(
            results,
            vec![CompareResult { idx: 1, outcome: Outcome::Failed, reference_idx: 0 }]
        );
    }

    #[test]
    fn reduce_splits_into_two_equality_sub_classes() {
        // a/b share one content, c/d share another; neither pair matches the other.
        let members = vec![
            locked(b"alpha-alpha"),
            locked(b"alpha-alpha"),
            locked(b"beta-beta!!"),
            locked(b"beta-beta!!"),
        ];
        let results = reduce_and_clone(&NoopOps, &members, false, true);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], CompareResult { idx: 1, outcome: Outcome::Cloned, reference_idx: 0 });
        assert_eq!(results[1], CompareResult { idx: 2, outcome: Outcome::Mismatch, reference_idx: 2 });
        assert_eq!(results[2], CompareResult { idx: 3, outcome: Outcome::Cloned, reference_idx: 2 });
    }

    #[test]
    fn reduce_clones_all_onto_single_reference_when_all_equal() {
        let members = vec![locked(b"same"), locked(b"same"), locked(b"same")];
        let results = reduce_and_clone(&NoopOps, &members, false, true);
        assert_eq!(
            results,
            vec![
                CompareResult { idx: 1, outcome: Outcome::Cloned, reference_idx: 0 },
                CompareResult { idx: 2, outcome: Outcome::Cloned, reference_idx: 0 },
            ]
        );
    }
}
