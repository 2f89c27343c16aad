use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;
use log::debug;

use crate::core::error::StorageError;

/// The tree of container `id`; ids that would resolve outside of
/// `<root>/rootfs/<id>` are rejected.
fn rootfs_path(root: &Path, id: &str) -> Result<PathBuf, StorageError> {
    if id.is_empty() || id == "." || id == ".." || id.contains('/') {
        return Err(StorageError::InvalidId { id: id.to_string() });
    }

    Ok(root.join("rootfs").join(id))
}

pub fn exists(root: impl AsRef<Path>, id: &str) -> bool {
    rootfs_path(root.as_ref(), id).is_ok_and(|path| path.exists())
}

/// Remove the filesystem tree of container `id`.
///
/// A missing tree is reported as [`StorageError::RootfsNotExist`] so callers
/// can tell "already gone" from a broken store.
pub fn delete(root: impl AsRef<Path>, id: &str) -> anyhow::Result<()> {
    let path = rootfs_path(root.as_ref(), id)?;

    match std::fs::symlink_metadata(&path) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StorageError::RootfsNotExist { id: id.to_string() }.into());
        }
        Err(e) => return Err(e).context("get rootfs stat failed"),
    }

    std::fs::remove_dir_all(&path).context("remove rootfs failed")?;
    debug!("Removed rootfs {}", path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_missing_rootfs() {
        let dir = tempfile::tempdir().unwrap();

        let err = delete(dir.path(), "c1").unwrap_err();
        assert_eq!(
            err.downcast_ref::<StorageError>(),
            Some(&StorageError::RootfsNotExist {
                id: "c1".to_string()
            })
        );
    }

    #[test]
    fn test_delete_rootfs_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("rootfs").join("c1").join("etc");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("hosts"), "127.0.0.1\tlocalhost\n").unwrap();

        assert!(exists(dir.path(), "c1"));
        delete(dir.path(), "c1").unwrap();
        assert!(!exists(dir.path(), "c1"));

        // A second delete reports the tree as gone.
        assert!(delete(dir.path(), "c1").is_err());
    }

    #[test]
    fn test_delete_rejects_ids_outside_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = dir.path().join("network").join("bridge").join("br0");
        std::fs::create_dir_all(descriptor.parent().unwrap()).unwrap();
        std::fs::write(&descriptor, "{}").unwrap();
        std::fs::create_dir_all(dir.path().join("rootfs").join("c1")).unwrap();

        for id in ["", ".", "..", "../network", "c1/.."] {
            let err = delete(dir.path(), id).unwrap_err();
            assert_eq!(
                err.downcast_ref::<StorageError>(),
                Some(&StorageError::InvalidId { id: id.to_string() })
            );
            assert!(!exists(dir.path(), id));
        }

        assert!(descriptor.exists());
        assert!(exists(dir.path(), "c1"));
    }
}
