//! Error taxonomy shared across the crate.
//!
//! Enumeration folds per-device permission failures into counters instead of
//! erroring; everything else surfaces here. Retry policy (re-enumerating on
//! `Busy`) belongs to the caller, never to this crate.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used by every fallible operation in this crate.
pub type LoopResult<T> = Result<T, LoopError>;

#[derive(Debug, Error)]
pub enum LoopError {
    /// Any I/O or kernel-request failure that aborts the current operation.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The requested file or device does not exist.
    #[error("{}: no such file or device", path.display())]
    NotFound { path: PathBuf },

    /// Another process won the race for this device between enumeration and
    /// attach. Retryable: pick a different device and try again.
    #[error("device {} is busy (lost the attach race)", device.display())]
    Busy { device: PathBuf },

    /// A binding field cannot be represented in the legacy `loop_info`
    /// layout. The bind must be aborted rather than silently truncated.
    #[error("binding field `{0}` does not fit the legacy loop_info layout")]
    Overflow(&'static str),

    /// Loop devices exist but every candidate was unreadable.
    #[error("no permission to open any of the {probed} probed loop devices")]
    Permission { probed: usize },

    /// Devices were probed but all of them already hold a binding.
    #[error("could not find any free loop device")]
    NoFreeDevice,

    /// Not a single loop device node was found; the loop driver is probably
    /// not loaded.
    #[error("no loop devices found; does this kernel know about the loop device? (try `modprobe loop`)")]
    LoopSupportMissing,
}

impl LoopError {
    /// Map an open/stat failure on `path` to `NotFound` or `Io`.
    pub(crate) fn from_path_io(path: &std::path::Path, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            LoopError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            LoopError::Io(err)
        }
    }
}
