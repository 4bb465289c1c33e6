//! State directory resolution (§2.1, component J).
//!
//! Precedence, highest first: an explicit `--state-dir` flag, the `BTRFS_DEDUP_STATE_DIR`
//! environment variable, then `$XDG_DATA_HOME/btrfs-dedup`, falling back to
//! `$HOME/.local/share/btrfs-dedup`. The directory is created with `0700` permissions if
//! it does not already exist, since the store holds a full inode inventory of every
//! tracked volume.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::{DedupError, Kind, Result};

pub const STATE_DIR_ENV: &str = "BTRFS_DEDUP_STATE_DIR";

/// Resolves and creates the state directory, applying the precedence described above.
pub fn resolve_state_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_dir) = std::env::var(STATE_DIR_ENV) {
        PathBuf::from(env_dir)
    } else if let Some(data_home) = dirs::data_local_dir() {
        data_home.join("btrfs-dedup")
    } else {
        return Err(DedupError::new(
            Kind::StoreError,
            "cannot determine home directory to locate state directory",
        ));
    };

    create_private(&dir)?;
    Ok(dir)
}

fn create_private(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .map_err(|e| DedupError::from_io(Kind::StoreError, e, Some(dir.to_path_buf())))?;
    }
    let mut perms = fs::metadata(dir)
        .map_err(|e| DedupError::from_io(Kind::StoreError, e, Some(dir.to_path_buf())))?
        .permissions();
    perms.set_mode(0o700);
    fs::set_permissions(dir, perms)
        .map_err(|e| DedupError::from_io(Kind::StoreError, e, Some(dir.to_path_buf())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_wins_and_is_created_private() {
        let base = tempfile::tempdir().unwrap();
        let target = base.path().join("explicit-state");
        let resolved = resolve_state_dir(Some(&target)).unwrap();
        assert_eq!(resolved, target);
        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn env_var_used_when_no_explicit_path() {
        let base = tempfile::tempdir().unwrap();
        let target = base.path().join("env-state");
        std::env::set_var(STATE_DIR_ENV, &target);
        let resolved = resolve_state_dir(None).unwrap();
        std::env::remove_var(STATE_DIR_ENV);
        assert_eq!(resolved, target);
    }
}
