//! Persistent state: the volume registry and the per-inode record table (§3, component B).
//!
//! Commits are atomic: the whole table is re-encoded with `bincode` into a temp file in
//! the same directory as the store, `fsync`ed, then renamed over the live file. A reader
//! never observes a half-written store, and a crash mid-commit leaves the previous
//! generation intact.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{DedupError, Kind, Result};
use crate::volume::{Volume, VolumeIdRepr};

/// One tracked file: identity within its volume, content fingerprint inputs, and the
/// generation it was last seen at. Size is carried denormalized so the candidate index
/// (component D) can group by size without re-statting every inode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InodeRecord {
    pub inode_number: u64,
    pub size: u64,
    pub generation: u64,
    pub mtime: SystemTime,
    /// The `generation` this inode held the last time it was successfully compared or
    /// cloned against another member of its class. Equal to `generation` means a rerun
    /// has nothing left to do for this inode (§4.D, §8 idempotent-rerun requirement).
    pub last_compared_generation: u64,
    pub nodatacow: bool,
}

/// The full on-disk state: every tracked volume and its inode table.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreData {
    pub volumes: BTreeMap<VolumeIdRepr, Volume>,
    pub inodes: BTreeMap<VolumeIdRepr, BTreeMap<u64, InodeRecord>>,
}

/// A store bound to a directory on disk. Cheap to construct; the data is loaded once
/// at open time and held in memory, matching the scale spec.md assumes (single-host,
/// one state file per configured state directory).
pub struct Store {
    path: PathBuf,
    data: StoreData,
}

const STORE_FILE_NAME: &str = "state.bin";

impl Store {
    /// Opens (creating if absent) the store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            DedupError::from_io(Kind::StoreError, e, Some(dir.to_path_buf()))
        })?;
        let path = dir.join(STORE_FILE_NAME);
        let data = if path.exists() {
            let mut file = File::open(&path)
                .map_err(|e| DedupError::from_io(Kind::StoreError, e, Some(path.clone())))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)
                .map_err(|e| DedupError::from_io(Kind::StoreError, e, Some(path.clone())))?;
            bincode::deserialize(&buf).map_err(|e| {
                DedupError::new(Kind::StoreError, format!("corrupt state file: {e}"))
                    .with_path(path.clone())
            })?
        } else {
            StoreData::default()
        };
        Ok(Self { path, data })
    }

    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.data.volumes.values()
    }

    pub fn volume(&self, id: VolumeIdRepr) -> Option<&Volume> {
        self.data.volumes.get(&id)
    }

    pub fn upsert_volume(&mut self, volume: Volume) {
        self.data.volumes.insert(volume.id, volume);
    }

    pub fn inodes_of(&self, volume: VolumeIdRepr) -> impl Iterator<Item = &InodeRecord> {
        self.data
            .inodes
            .get(&volume)
            .into_iter()
            .flat_map(|m| m.values())
    }

    pub fn inode(&self, volume: VolumeIdRepr, inode_number: u64) -> Option<&InodeRecord> {
        self.data.inodes.get(&volume)?.get(&inode_number)
    }

    pub fn upsert_inode(&mut self, volume: VolumeIdRepr, record: InodeRecord) {
        self.data
            .inodes
            .entry(volume)
            .or_default()
            .insert(record.inode_number, record);
    }

    pub fn remove_inode(&mut self, volume: VolumeIdRepr, inode_number: u64) {
        if let Some(table) = self.data.inodes.get_mut(&volume) {
            table.remove(&inode_number);
        }
    }

    /// Groups every tracked record across `volumes` by size, restricted to
    /// `size >= min_size`, for the candidate index (§4.D builds on top of this). Each
    /// record is paired with the volume it belongs to, since a class can span more
    /// than one volume. Singleton groups (no possible match) are omitted. Records
    /// already compared at their current generation are excluded entirely, so a rerun
    /// over unchanged data builds no classes and performs no clones (§8).
    pub fn same_size_groups(
        &self,
        volumes: &[VolumeIdRepr],
        min_size: u64,
    ) -> BTreeMap<u64, Vec<(VolumeIdRepr, InodeRecord)>> {
        let mut by_size: BTreeMap<u64, Vec<(VolumeIdRepr, InodeRecord)>> = BTreeMap::new();
        for &volume in volumes {
            for record in self.inodes_of(volume) {
                if record.size < min_size {
                    continue;
                }
                if record.last_compared_generation == record.generation {
                    continue;
                }
                by_size
                    .entry(record.size)
                    .or_default()
                    .push((volume, record.clone()));
            }
        }
        by_size.retain(|_, members| members.len() > 1);
        by_size
    }

    /// Marks `inode_number` as compared-up-to-date at its current generation, after a
    /// successful compare or clone in a pass. A no-op if the inode isn't tracked (e.g.
    /// it vanished between indexing and locking).
    pub fn mark_compared(&mut self, volume: VolumeIdRepr, inode_number: u64) {
        if let Some(record) = self
            .data
            .inodes
            .get_mut(&volume)
            .and_then(|table| table.get_mut(&inode_number))
        {
            record.last_compared_generation = record.generation;
        }
    }

    /// Atomically persists the current in-memory state: encode to a temp file beside
    /// the live one, `fsync` it, then rename over the live path. The rename is what
    /// makes the commit atomic; the preceding fsync ensures the renamed content is
    /// actually durable rather than just reordered in the page cache.
    pub fn commit(&self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| DedupError::new(Kind::StoreError, "state file has no parent directory"))?;
        let encoded = bincode::serialize(&self.data)
            .map_err(|e| DedupError::new(Kind::StoreError, format!("encode failed: {e}")))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| DedupError::from_io(Kind::StoreError, e, Some(dir.to_path_buf())))?;
        tmp.write_all(&encoded)
            .map_err(|e| DedupError::from_io(Kind::StoreError, e, Some(self.path.clone())))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| DedupError::from_io(Kind::StoreError, e, Some(self.path.clone())))?;
        tmp.persist(&self.path)
            .map_err(|e| DedupError::new(Kind::StoreError, e.to_string()).with_path(self.path.clone()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeId;
    use uuid::Uuid;

    fn sample_volume(n: u64) -> Volume {
        let id: VolumeIdRepr = VolumeId {
            fs_uuid: Uuid::from_bytes([n as u8; 16]),
            subvol_root_id: n,
        }
        .into();
        Volume {
            id,
            mount_path: PathBuf::from(format!("/mnt/vol{n}")),
            last_tracked_generation: 0,
            last_tracked_size_cutoff: 0,
            read_only: false,
            tracking_enabled: true,
            online: true,
        }
    }

    #[test]
    fn commit_then_reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        let vol = sample_volume(1);
        store.upsert_volume(vol.clone());
        store.upsert_inode(
            vol.id,
            InodeRecord {
                inode_number: 42,
                size: 4096,
                generation: 10,
                mtime: SystemTime::UNIX_EPOCH,
                last_compared_generation: 0,
                nodatacow: false,
            },
        );
        store.commit().unwrap();

        let reopened = Store::open(dir.path()).unwrap();
        assert_eq!(reopened.volumes().count(), 1);
        assert_eq!(reopened.inode(vol.id, 42).unwrap().size, 4096);
    }

    #[test]
    fn same_size_groups_excludes_singletons() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        let vol = sample_volume(2);
        store.upsert_volume(vol.clone());
        for (ino, size) in [(1, 100), (2, 100), (3, 200)] {
            store.upsert_inode(
                vol.id,
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
        let groups = store.same_size_groups(&[vol.id], 0);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups.get(&100).unwrap().len(), 2);
    }

    #[test]
    fn reopen_of_missing_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.volumes().count(), 0);
    }

    #[test]
    fn mark_compared_excludes_record_from_same_size_groups() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        let vol = sample_volume(3);
        store.upsert_volume(vol.clone());
        for (ino, size) in [(1, 100), (2, 100)] {
            store.upsert_inode(
                vol.id,
                InodeRecord {
                    inode_number: ino,
                    size,
                    generation: 5,
                    mtime: SystemTime::UNIX_EPOCH,
                    last_compared_generation: 0,
                    nodatacow: false,
                },
            );
        }
        store.mark_compared(vol.id, 1);
        store.mark_compared(vol.id, 2);

        let groups = store.same_size_groups(&[vol.id], 0);
        assert!(groups.is_empty());
    }
}
