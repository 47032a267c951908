//! POSIX path resolution.
//!
//! Paths are walked component by component from the root inode. Symbolic
//! links are never followed here; the FUSE layer resolves them through
//! `readlink`, and parent/name splitting happens kernel-side, so the FUSE
//! callbacks arrive already split into a directory inode and a name.

use crate::errors::{IOResult, XfsError};
use crate::fs::xfs::dir;
use crate::fs::xfs::inode::InodeRef;
use crate::fs::xfs::XfsFs;

/// Resolves `path` to an inode handle.
///
/// Empty components (repeated or trailing `/`) are skipped; `.` and `..`
/// resolve through the stored directory entries.
pub fn walk(fs: &XfsFs, path: &str) -> IOResult<InodeRef> {
    let mut current = fs.iget(fs.sb().rootino)?;

    for component in path.split('/') {
        if component.is_empty() {
            continue;
        }
        let ino = {
            let inode = current.read();
            if !inode.is_dir() {
                return Err(XfsError::NotDirectory);
            }
            dir::lookup(fs, &inode, component.as_bytes())?.0
        };
        // Done with the current directory; its guard drops here.
        current = fs.iget(ino)?;
    }
    Ok(current)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn walk_root_variants() {
        let fs = crate::fs::xfs::test_img::TestImage::default().mount_ro();
        let rootino = fs.sb().rootino;
        for path in ["/", "", "//", "/."] {
            let handle = walk(&fs, path).unwrap();
            assert_eq!(handle.read().ino, rootino, "path {path:?}");
        }
    }

    #[test]
    fn walk_nested_components() {
        let fs = crate::fs::xfs::test_img::TestImage::default().mount_ro();
        let file = walk(&fs, "/hello.txt").unwrap();
        assert!(file.read().is_reg());
        // `..` resolves through the stored entry.
        let back = walk(&fs, "/../hello.txt").unwrap();
        assert_eq!(back.read().ino, file.read().ino);
    }

    #[test]
    fn walk_missing() {
        let fs = crate::fs::xfs::test_img::TestImage::default().mount_ro();
        assert_eq!(walk(&fs, "/nope").unwrap_err(), XfsError::NoEntry);
    }

    #[test]
    fn walk_through_non_directory() {
        let fs = crate::fs::xfs::test_img::TestImage::default().mount_ro();
        assert_eq!(
            walk(&fs, "/hello.txt/x").unwrap_err(),
            XfsError::NotDirectory
        );
    }
}
