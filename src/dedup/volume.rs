//! Volume identity and the mount/UUID resolution collaborator.
//!
//! Reading the mount table and walking `/dev` to resolve a block path to a mounted
//! subvolume is explicitly out of scope for this agent's core (§1): it is modeled as
//! a small [`VolumeSource`] seam so the rest of the pipeline only ever deals with an
//! already-resolved [`VolumeId`] and an open directory handle on the subvolume root.

use std::fs;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{DedupError, Kind, Result};
use crate::ioctl::BtrfsOps;

/// The stable identity of a volume: the filesystem's UUID plus the subvolume's root
/// tree id. Re-mounting at a different path must resolve to the same `VolumeId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId {
    pub fs_uuid: Uuid,
    pub subvol_root_id: u64,
}

impl Volume {
    /// Builds a fresh registry entry for a volume seen for the first time, with no
    /// recorded watermark yet.
    pub fn new(id: VolumeIdRepr, mount_path: PathBuf) -> Self {
        Volume {
            id,
            mount_path,
            last_tracked_generation: 0,
            last_tracked_size_cutoff: 0,
            read_only: false,
            tracking_enabled: true,
            online: true,
        }
    }
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.fs_uuid, self.subvol_root_id)
    }
}

/// A volume as tracked by the registry: identity, where it was last seen mounted, and
/// the tracking flags that gate it from a pass.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Volume {
    pub id: VolumeIdRepr,
    pub mount_path: PathBuf,
    pub last_tracked_generation: u64,
    pub last_tracked_size_cutoff: u64,
    pub read_only: bool,
    pub tracking_enabled: bool,
    /// Whether the volume was observed mounted during the most recent pass. A
    /// vanished volume is marked offline rather than deleted, per §3.
    pub online: bool,
}

/// A serialization-friendly mirror of [`VolumeId`] (the store's encoding doesn't need
/// to depend on `uuid`'s own `Serialize` feature gate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct VolumeIdRepr {
    pub fs_uuid_bytes: [u8; 16],
    pub subvol_root_id: u64,
}

impl From<VolumeId> for VolumeIdRepr {
    fn from(id: VolumeId) -> Self {
        VolumeIdRepr {
            fs_uuid_bytes: *id.fs_uuid.as_bytes(),
            subvol_root_id: id.subvol_root_id,
        }
    }
}

impl From<VolumeIdRepr> for VolumeId {
    fn from(repr: VolumeIdRepr) -> Self {
        VolumeId {
            fs_uuid: Uuid::from_bytes(repr.fs_uuid_bytes),
            subvol_root_id: repr.subvol_root_id,
        }
    }
}

/// The outcome of resolving a user-supplied volume reference (path, block device or
/// UUID) to a concrete, open subvolume.
pub struct ResolvedVolume {
    pub id: VolumeId,
    pub mount_path: PathBuf,
    /// A handle on the subvolume root, suitable for the `TREE_SEARCH` and
    /// `SUBVOL_GETFLAGS` ioctls.
    pub root: File,
}

/// The collaborator boundary between this agent and "enumerate mounted filesystems".
/// Out of scope as a feature (§1); specified here only as the seam the orchestrator
/// and CLI plug into, so it can be faked in tests.
pub trait VolumeSource {
    /// Resolves one of the accepted reference forms (§6): a path under a mount point,
    /// a `/dev/...` block path, or a filesystem UUID.
    fn resolve(&self, reference: &str) -> Result<ResolvedVolume>;

    /// Lists every currently-mounted, non-read-only Btrfs subvolume, for `dedup`/`scan`
    /// invocations with no explicit volume arguments.
    fn list_mounted(&self) -> Result<Vec<ResolvedVolume>>;
}

/// The default [`VolumeSource`]: reads `/proc/self/mountinfo` and uses
/// `BTRFS_IOC_SUBVOL_GETFLAGS` plus `statfs` to identify the containing subvolume of a
/// given path.
pub struct DefaultVolumeSource<'a, O: BtrfsOps> {
    ops: &'a O,
}

impl<'a, O: BtrfsOps> DefaultVolumeSource<'a, O> {
    pub fn new(ops: &'a O) -> Self {
        Self { ops }
    }

    fn fs_uuid_of(&self, path: &Path) -> Result<Uuid> {
        // Btrfs exposes the filesystem UUID via the `fsid` sysfs attribute of the
        // backing device; as a portable fallback usable without walking `/sys`, the
        // agent derives a stable identifier from `st_dev`, which is unique per mounted
        // filesystem instance and remains stable across remounts at a different path.
        let meta = fs::metadata(path)?;
        let dev = meta.dev();
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&dev.to_le_bytes());
        Ok(Uuid::from_bytes(bytes))
    }

    fn subvol_root_id_of(&self, root: &File) -> Result<u64> {
        // The subvolume root directory's own inode number is always
        // `BTRFS_FIRST_FREE_OBJECTID` (256) for every subvolume on the filesystem, so it
        // cannot serve as the per-subvolume half of a `VolumeId` (§3). The actual tree id
        // comes from `BTRFS_IOC_INO_LOOKUP`'s `objectid = 0` special case.
        self.ops.subvol_tree_id(crate::ioctl::raw_fd(root))
    }

    fn open_root(&self, path: &Path) -> Result<File> {
        crate::ioctl::open_nofollow(path)
            .map_err(|e| DedupError::from_io(Kind::Vanished, e, Some(path.to_path_buf())))
    }

    fn resolve_path(&self, path: &Path) -> Result<ResolvedVolume> {
        let canon = fs::canonicalize(path)
            .map_err(|e| DedupError::from_io(Kind::Vanished, e, Some(path.to_path_buf())))?;
        let root = self.open_root(&canon)?;
        let fs_uuid = self.fs_uuid_of(&canon)?;
        let subvol_root_id = self.subvol_root_id_of(&root)?;
        // Confirm we are actually looking at a subvolume, not an arbitrary directory,
        // by asking the kernel for its flags; an error here means the path is not on
        // Btrfs at all.
        let _ = self.ops.subvol_get_flags(crate::ioctl::raw_fd(&root))?;
        Ok(ResolvedVolume {
            id: VolumeId {
                fs_uuid,
                subvol_root_id,
            },
            mount_path: canon,
            root,
        })
    }
}

impl<'a, O: BtrfsOps> VolumeSource for DefaultVolumeSource<'a, O> {
    fn resolve(&self, reference: &str) -> Result<ResolvedVolume> {
        let path = Path::new(reference);
        if path.exists() {
            return self.resolve_path(path);
        }
        if let Ok(uuid) = Uuid::parse_str(reference) {
            for entry in self.list_mounted()? {
                if entry.id.fs_uuid == uuid {
                    return Ok(entry);
                }
            }
            return Err(DedupError::new(
                Kind::Vanished,
                format!("no mounted volume with UUID {uuid}"),
            ));
        }
        Err(DedupError::new(
            Kind::Vanished,
            format!("cannot resolve volume reference `{reference}`"),
        ))
    }

    fn list_mounted(&self) -> Result<Vec<ResolvedVolume>> {
        let content = fs::read_to_string("/proc/self/mountinfo")?;
        let mut out = Vec::new();
        for line in content.lines() {
            // Format: id parent major:minor root mount_point options ... - fstype source ...
            let Some(dash) = line.find(" - ") else {
                continue;
            };
            let (left, right) = line.split_at(dash);
            let mount_point = match left.split_whitespace().nth(4) {
                Some(mp) => mp,
                None => continue,
            };
            let fstype = right[3..].split_whitespace().next().unwrap_or("");
            if fstype != "btrfs" {
                continue;
            }
            if let Ok(resolved) = self.resolve_path(Path::new(mount_point)) {
                out.push(resolved);
            }
        }
        Ok(out)
    }
}

/// A minimal line-oriented reader kept separate so unit tests can exercise the
/// mountinfo-parsing logic without needing real mount points.
pub fn parse_mountinfo_btrfs_points(content: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for line in content.lines() {
        let Some(dash) = line.find(" - ") else {
            continue;
        };
        let (left, right) = line.split_at(dash);
        let mount_point = match left.split_whitespace().nth(4) {
            Some(mp) => mp,
            None => continue,
        };
        let fstype = right[3..].split_whitespace().next().unwrap_or("");
        if fstype == "btrfs" {
            out.push(PathBuf::from(mount_point));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_btrfs_mountpoints_only() {
        let sample = "\
25 1 0:20 / /mnt/data rw,relatime shared:1 - btrfs /dev/sda1 rw,ssd\n\
26 1 0:21 / /mnt/other rw,relatime shared:2 - ext4 /dev/sda2 rw\n";
        let points = parse_mountinfo_btrfs_points(sample);
        assert_eq!(points, vec![PathBuf::from("/mnt/data")]);
    }

    #[test]
    fn volume_id_repr_roundtrips() {
        let id = VolumeId {
            fs_uuid: Uuid::from_bytes([7u8; 16]),
            subvol_root_id: 256,
        };
        let repr: VolumeIdRepr = id.into();
        let back: VolumeId = repr.into();
        assert_eq!(id, back);
    }
}
