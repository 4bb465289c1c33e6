//! Candidate index (§4.D, component D): same-size equivalence classes ready for the
//! safe-locker.

use crate::store::{InodeRecord, Store};
use crate::volume::VolumeIdRepr;

/// One candidate equivalence class: every tracked file sharing a size, ordered by
/// `(volume_id, inode_number)` so a run over the same state is deterministic.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub volume: VolumeIdRepr,
    pub record: InodeRecord,
}

#[derive(Debug, Clone)]
pub struct CandidateClass {
    pub size: u64,
    pub members: Vec<Candidate>,
}

/// Whether a scanned inode is eligible for tracking at all: regular files only (the
/// scanner already filters by mode), non-zero size, and not `NODATACOW`/`NODATASUM`.
pub fn is_trackable(size: u64, nodatacow: bool) -> bool {
    size > 0 && !nodatacow
}

/// Builds same-size classes of two or more members across the given volumes, ordered
/// by descending size so the orchestrator can walk bigger payoffs first (§4.G step 4),
/// optionally restricted to `size >= min_size`. Ordering within a class is by
/// `(volume_id, inode_number)`, per §4.D, so a run over the same state is
/// deterministic.
pub fn build_classes(store: &Store, volumes: &[VolumeIdRepr], min_size: u64) -> Vec<CandidateClass> {
    let mut classes: Vec<CandidateClass> = store
        .same_size_groups(volumes, min_size)
        .into_iter()
        .map(|(size, members)| {
            let mut members: Vec<Candidate> = members
                .into_iter()
                .map(|(volume, record)| Candidate { volume, record })
                .collect();
            members.sort_by(|a, b| {
                (a.volume, a.record.inode_number).cmp(&(b.volume, b.record.inode_number))
            });
            CandidateClass { size, members }
        })
        .collect();

    classes.sort_by(|a, b| b.size.cmp(&a.size));
    classes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InodeRecord;
    use crate::volume::VolumeId;
    use uuid::Uuid;

    fn vol(n: u8) -> VolumeIdRepr {
        VolumeId {
            fs_uuid: Uuid::from_bytes([n; 16]),
            subvol_root_id: n as u64,
        }
        .into()
    }

    fn record(inode_number: u64, size: u64) -> InodeRecord {
        InodeRecord {
            inode_number,
            size,
            generation: 1,
            mtime: std::time::SystemTime::UNIX_EPOCH,
            last_compared_generation: 0,
            nodatacow: false,
        }
    }

    #[test]
    fn classes_are_size_descending_and_deterministically_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        let v = vol(1);
        store.upsert_inode(v, record(3, 100));
        store.upsert_inode(v, record(1, 100));
        store.upsert_inode(v, record(2, 200));
        store.upsert_inode(v, record(4, 200));
        store.upsert_inode(v, record(5, 300));

        let classes = build_classes(&store, &[v], 0);
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[0].size, 200);
        assert_eq!(classes[1].size, 100);
        assert_eq!(
            classes[1].members.iter().map(|c| c.record.inode_number).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn min_size_filters_small_classes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        let v = vol(2);
        store.upsert_inode(v, record(1, 50));
        store.upsert_inode(v, record(2, 50));
        store.upsert_inode(v, record(3, 500));
        store.upsert_inode(v, record(4, 500));

        let classes = build_classes(&store, &[v], 100);
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].size, 500);
    }

    #[test]
    fn nodatacow_or_zero_size_is_not_trackable() {
        assert!(!is_trackable(0, false));
        assert!(!is_trackable(100, true));
        assert!(is_trackable(100, false));
    }
}
