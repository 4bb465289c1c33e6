//! Dedup orchestrator (§4.G, component G): drives the scanner, index, safe-locker and
//! comparator/cloner through one pass and reports a summary.

use std::os::fd::RawFd;
use std::time::SystemTime;

use log::info;

use crate::error::{Kind, Result};
use crate::index::{build_classes, CandidateClass};
use crate::ioctl::BtrfsOps;
use crate::locker::{lock_class, release, LockRequest};
use crate::scanner::{inode_exists, scan_since};
use crate::store::{InodeRecord, Store};
use crate::volume::VolumeIdRepr;

/// Options governing one `dedup` pass, mirroring the CLI flags in §6.
#[derive(Debug, Clone, Copy)]
pub struct PassOptions {
    pub allow_crossvol: bool,
    pub pre_defrag: bool,
    pub size_cutoff: u64,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            allow_crossvol: true,
            pre_defrag: false,
            size_cutoff: 0,
        }
    }
}

/// Per-outcome counters emitted at the end of a pass (§4.G step 5).
#[derive(Debug, Default, Clone, Copy)]
pub struct PassSummary {
    pub classes_considered: u64,
    pub cloned: u64,
    pub mismatched: u64,
    pub busy: u64,
    pub changed: u64,
    pub vanished: u64,
    pub already_immutable: u64,
    pub failed: u64,
}

/// Runs the scanner for one already-resolved volume and commits its results. Returns
/// the number of inodes absorbed.
pub fn scan_volume<O: BtrfsOps>(
    ops: &O,
    store: &mut Store,
    volume: VolumeIdRepr,
    fd: RawFd,
) -> Result<usize> {
    let last_watermark = store
        .volume(volume)
        .map(|v| v.last_tracked_generation)
        .unwrap_or(0);

    // Snapshot the current transid before scanning (§4.C): any write landing after
    // this point is still >= the watermark we commit, so it is never missed.
    let snapshot_txid = ops.current_transid(fd)?;
    let (found, _high_watermark) = scan_since(ops, fd, last_watermark + 1)?;

    let absorbed = found.len();
    for inode in &found {
        if !crate::index::is_trackable(inode.size, inode.nodatacow) {
            continue;
        }
        // A changed inode's generation has moved past whatever it was last compared
        // at, so it re-enters the candidate pool (§8 idempotent-rerun requirement).
        store.upsert_inode(
            volume,
            InodeRecord {
                inode_number: inode.inode_number,
                size: inode.size,
                generation: inode.generation,
                mtime: inode.mtime,
                last_compared_generation: 0,
                nodatacow: inode.nodatacow,
            },
        );
    }

    // Records untouched by this pass may simply be unchanged, or their inode may have
    // been unlinked entirely; §3 only permits dropping a record once the scanner has
    // positive evidence the inode-item itself is gone, so confirm each one explicitly
    // rather than inferring deletion from absence in this pass's changed set.
    let found_inodes: std::collections::HashSet<u64> =
        found.iter().map(|i| i.inode_number).collect();
    let stale: Vec<u64> = store
        .inodes_of(volume)
        .map(|r| r.inode_number)
        .filter(|n| !found_inodes.contains(n))
        .collect();
    let mut vanished = 0;
    for inode_number in stale {
        if let Ok(false) = inode_exists(ops, fd, inode_number) {
            store.remove_inode(volume, inode_number);
            vanished += 1;
        }
    }

    if let Some(mut v) = store.volume(volume).cloned() {
        v.last_tracked_generation = snapshot_txid;
        v.online = true;
        store.upsert_volume(v);
    }
    store.commit()?;

    info!(
        "volume {volume:?}: absorbed {absorbed} changed inodes, dropped {vanished} vanished, watermark now {snapshot_txid}"
    );
    Ok(absorbed)
}

/// Runs the lock/compare/clone steps for one class, updating the summary and, for
/// every member successfully compared or cloned, the store's `last_compared_generation`
/// watermark (§8 idempotent-rerun requirement). Paths are resolved by the caller via
/// `path_of`, since the index only knows volume+inode.
pub fn process_class<O: BtrfsOps>(
    ops: &O,
    store: &mut Store,
    class: &CandidateClass,
    path_of: impl Fn(VolumeIdRepr, u64) -> Option<(std::path::PathBuf, u64, SystemTime)>,
    opts: PassOptions,
    summary: &mut PassSummary,
) {
    summary.classes_considered += 1;

    let mut requests = Vec::new();
    let mut owner_of_path: std::collections::HashMap<std::path::PathBuf, (VolumeIdRepr, u64)> =
        std::collections::HashMap::new();
    for member in &class.members {
        if let Some((path, size, mtime)) = path_of(member.volume, member.record.inode_number) {
            owner_of_path.insert(path.clone(), (member.volume, member.record.inode_number));
            requests.push(LockRequest {
                path,
                expected_size: size,
                expected_mtime: mtime,
            });
        }
    }

    let locked_class = match lock_class(ops, requests) {
        Ok(lc) => lc,
        Err(_) => {
            summary.failed += 1;
            return;
        }
    };

    for (_, kind) in &locked_class.dropped {
        match kind {
            Kind::Busy => summary.busy += 1,
            Kind::Changed => summary.changed += 1,
            Kind::Vanished => summary.vanished += 1,
            Kind::AlreadyImmutable => summary.already_immutable += 1,
            _ => summary.failed += 1,
        }
    }

    if locked_class.locked.len() < 2 {
        release(ops, locked_class.locked);
        return;
    }

    let results = crate::compare::reduce_and_clone(
        ops,
        &locked_class.locked,
        opts.pre_defrag,
        opts.allow_crossvol,
    );

    let mut mark = |path: &std::path::Path| {
        if let Some(&(volume, inode_number)) = owner_of_path.get(path) {
            store.mark_compared(volume, inode_number);
        }
    };

    // Only a successful clone counts as "cloned or verified-equal": a mismatch means
    // these two happen to share a size but not content, which tells us nothing about
    // whether they'll still share it (and nothing else) at the next pass. Both sides
    // of a successful clone are settled — the candidate that got cloned, and the
    // reference it matched, whichever representative that turned out to be.
    for result in &results {
        match result.outcome {
            crate::compare::Outcome::Cloned => {
                summary.cloned += 1;
                mark(&locked_class.locked[result.idx].path);
                mark(&locked_class.locked[result.reference_idx].path);
            }
            crate::compare::Outcome::Mismatch => summary.mismatched += 1,
            crate::compare::Outcome::Failed => summary.failed += 1,
        }
    }

    release(ops, locked_class.locked);
}

/// Builds the candidate classes for a pass: every selected volume, restricted to
/// `size >= opts.size_cutoff`.
pub fn classes_for_pass(store: &Store, volumes: &[VolumeIdRepr], opts: PassOptions) -> Vec<CandidateClass> {
    build_classes(store, volumes, opts.size_cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeId;
    use uuid::Uuid;

    #[test]
    fn default_options_allow_crossvol_with_no_cutoff() {
        let opts = PassOptions::default();
        assert!(opts.allow_crossvol);
        assert_eq!(opts.size_cutoff, 0);
    }

    #[test]
    fn classes_for_pass_respects_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        let v: VolumeIdRepr = VolumeId {
            fs_uuid: Uuid::from_bytes([9; 16]),
            subvol_root_id: 1,
        }
        .into();
        for (ino, size) in [(1, 10), (2, 10), (3, 1000), (4, 1000)] {
            store.upsert_inode(
                v,
                InodeRecord {
                    inode_number: ino,
                    size,
                    generation: 1,
                    mtime: SystemTime::UNIX_EPOCH,
                    last_compared_generation: 0,
                    nodatacow: false,
                },
            );
        }
        let opts = PassOptions {
            size_cutoff: 100,
            ..Default::default()
        };
        let classes = classes_for_pass(&store, &[v], opts);
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].size, 1000);
    }
}
