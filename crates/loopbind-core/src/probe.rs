//! Cheap device-class checks used by enumeration and the bind path.

use crate::status::get_status_legacy;
use std::fs::{self, File};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Fixed major number of the loop block driver.
pub const LOOP_MAJOR: libc::c_uint = 7;

/// True iff `path` stats as a block special device with the loop major.
///
/// No side effects; a failed stat simply means "not a loop device".
pub fn is_loop_device(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| {
            meta.file_type().is_block_device() && libc::major(meta.rdev()) == LOOP_MAJOR
        })
        .unwrap_or(false)
}

/// True iff the device currently holds a binding.
///
/// A successful status query means a backing file is associated; every
/// failure shape (ENXIO included) reads as "not bound".
pub fn is_loop_used(device: &File) -> bool {
    get_status_legacy(device.as_raw_fd()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn regular_file_is_not_a_loop_device() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, b"x").unwrap();
        assert!(!is_loop_device(&path));
    }

    #[test]
    fn missing_path_is_not_a_loop_device() {
        assert!(!is_loop_device(Path::new("/definitely/not/here/loop0")));
    }
}
