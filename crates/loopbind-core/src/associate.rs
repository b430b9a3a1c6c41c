//! Association queries: is a device bound to a given backing file, which
//! device holds a file, and which device is free for a new binding.

use crate::enumerate::{DeviceTopology, FilterMode, LoopDeviceRef, LoopSearch};
use crate::error::{LoopError, LoopResult};
use crate::status::{get_status64, get_status_legacy};
use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Three-way answer for an association query.
///
/// `Indeterminate` is a query failure, not "free": collapsing it into
/// `NotBound` could hand out a device that is actually in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Association {
    Bound,
    NotBound,
    Indeterminate,
}

/// Stable identity of a backing file: device id plus inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl FileIdentity {
    pub fn of(path: &Path) -> LoopResult<Self> {
        let meta = fs::metadata(path).map_err(|err| LoopError::from_path_io(path, err))?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

fn identity_matches(
    stored_dev: u64,
    stored_ino: u64,
    stored_offset: u64,
    target: FileIdentity,
    offset: u64,
    offset_significant: bool,
) -> bool {
    stored_dev == target.dev
        && stored_ino == target.ino
        && (!offset_significant || stored_offset == offset)
}

/// Does `device` currently hold a binding to `target`?
///
/// Tries the 64-bit status shape first, falls back to the legacy shape.
/// ENXIO from both means the device is free; any other failure is
/// `Indeterminate`.
pub fn is_associated(
    device: &File,
    target: FileIdentity,
    offset: u64,
    offset_significant: bool,
) -> Association {
    let fd = device.as_raw_fd();

    match get_status64(fd) {
        Ok(info) => {
            return if identity_matches(
                info.lo_device,
                info.lo_inode,
                info.lo_offset,
                target,
                offset,
                offset_significant,
            ) {
                Association::Bound
            } else {
                Association::NotBound
            };
        }
        Err(err) if err.raw_os_error() == Some(libc::ENXIO) => return Association::NotBound,
        Err(_) => {}
    }

    match get_status_legacy(fd) {
        Ok(info) => {
            if identity_matches(
                info.lo_device as u64,
                info.lo_inode as u64,
                info.lo_offset as u64,
                target,
                offset,
                offset_significant,
            ) {
                Association::Bound
            } else {
                Association::NotBound
            }
        }
        Err(err) if err.raw_os_error() == Some(libc::ENXIO) => Association::NotBound,
        Err(_) => Association::Indeterminate,
    }
}

/// Find the device already bound to `(file, offset)`, if any.
///
/// Every handle opened along the way, other than the returned one, is
/// closed before this returns.
pub fn find_associated(
    topology: &DeviceTopology,
    file: &Path,
    offset: u64,
) -> LoopResult<Option<LoopDeviceRef>> {
    let target = FileIdentity::of(file)?;
    let search = LoopSearch::open(topology, FilterMode::UsedOnly)?;

    for device in search {
        if is_associated(&device.file, target, offset, true) == Association::Bound {
            return Ok(Some(device));
        }
    }
    Ok(None)
}

/// Find a device with no current binding.
///
/// When nothing turns up, the enumeration counters distinguish the three
/// failure shapes: every probed node denied, probed but all in use, or no
/// loop node present at all.
pub fn find_free(topology: &DeviceTopology) -> LoopResult<LoopDeviceRef> {
    let mut search = LoopSearch::open(topology, FilterMode::FreeOnly)?;

    if let Some(device) = search.next() {
        return Ok(device);
    }

    let counters = search.counters();
    if counters.attempted > 0 && counters.permission_denied > 0 {
        Err(LoopError::Permission {
            probed: counters.attempted,
        })
    } else if counters.attempted > 0 {
        Err(LoopError::NoFreeDevice)
    } else {
        Err(LoopError::LoopSupportMissing)
    }
}
