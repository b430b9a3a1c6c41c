//! Multi-strategy loop device discovery.
//!
//! The kernel offers no "list all loop bindings" call, so enumeration walks
//! three fallback stages of increasing cost:
//!
//! 1. sysfs block directory (used-only searches, when it exists) — the
//!    cheapest source of in-use devices; when this stage runs, it is also
//!    the last, so no device is reported twice;
//! 2. the conventional default range `loop0..loop7`, probed by constructed
//!    path with no directory listing at all;
//! 3. an exhaustive scan of the device directory (or the `loop/` subdir)
//!    for loop-major nodes with minor >= 8, in version-aware name order.
//!
//! One `LoopSearch` is a single forward pass; permission failures are
//! counted, not fatal, so `find_free` can tell "all denied" from "none
//! free" from "no loop support at all".

use crate::error::{LoopError, LoopResult};
use crate::probe::{is_loop_device, is_loop_used, LOOP_MAJOR};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

/// Number of conventionally present devices (`/dev/loop0..7`).
pub const DEFAULT_LOOP_COUNT: u32 = 8;

/// Which devices a search should yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Any,
    UsedOnly,
    FreeOnly,
}

/// Filesystem roots consulted during enumeration.
///
/// Injected explicitly so searches can run against a fixture tree in tests
/// and so no path is process-global state.
#[derive(Debug, Clone)]
pub struct DeviceTopology {
    /// Directory of device nodes, conventionally `/dev`.
    pub dev_dir: PathBuf,
    /// Optional loop-specific subdirectory (`/dev/loop/N` layout).
    pub loop_subdir: PathBuf,
    /// sysfs block-device directory used to accelerate used-device search.
    pub sysfs_block_dir: PathBuf,
}

impl Default for DeviceTopology {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            loop_subdir: PathBuf::from("/dev/loop"),
            sysfs_block_dir: PathBuf::from("/sys/block"),
        }
    }
}

/// An open, read-only handle on a discovered loop device.
///
/// The handle is exclusively owned; dropping the ref releases it.
#[derive(Debug)]
pub struct LoopDeviceRef {
    pub path: PathBuf,
    pub file: File,
}

/// Running totals for one enumeration pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchCounters {
    /// Loop device nodes that were found to exist.
    pub attempted: usize,
    /// Nodes that exist but could not be opened for lack of permission.
    pub permission_denied: usize,
}

#[derive(Debug)]
enum Stage {
    Sysfs,
    DefaultRange(u32),
    Scan,
    Done,
}

/// Lazy, finite, single-pass cursor over existing loop devices.
pub struct LoopSearch {
    topology: DeviceTopology,
    mode: FilterMode,
    use_subdir: bool,
    stage: Stage,
    pending: Option<VecDeque<PathBuf>>,
    counters: SearchCounters,
}

impl LoopSearch {
    /// Start a search. Fails only when the device directory is absent.
    pub fn open(topology: &DeviceTopology, mode: FilterMode) -> LoopResult<Self> {
        if !topology.dev_dir.is_dir() {
            return Err(LoopError::NotFound {
                path: topology.dev_dir.clone(),
            });
        }

        let use_subdir = topology.loop_subdir.is_dir();
        let stage = if mode == FilterMode::UsedOnly && topology.sysfs_block_dir.is_dir() {
            Stage::Sysfs
        } else {
            Stage::DefaultRange(0)
        };

        Ok(Self {
            topology: topology.clone(),
            mode,
            use_subdir,
            stage,
            pending: None,
            counters: SearchCounters::default(),
        })
    }

    /// Totals accumulated so far; meaningful once the search is exhausted.
    pub fn counters(&self) -> SearchCounters {
        self.counters
    }

    fn device_node_path(&self, num: u64) -> PathBuf {
        if self.use_subdir {
            self.topology.loop_subdir.join(num.to_string())
        } else {
            self.topology.dev_dir.join(format!("loop{num}"))
        }
    }

    /// Open `path` read-only and hand it back if it matches the filter.
    /// Bookkeeping happens here: the node exists, so it counts as attempted;
    /// EACCES feeds the permission counter and the search moves on.
    fn consider(&mut self, path: PathBuf) -> Option<LoopDeviceRef> {
        self.counters.attempted += 1;
        match File::open(&path) {
            Ok(file) => {
                let wanted = match self.mode {
                    FilterMode::Any => true,
                    FilterMode::UsedOnly => is_loop_used(&file),
                    FilterMode::FreeOnly => !is_loop_used(&file),
                };
                if wanted {
                    Some(LoopDeviceRef { path, file })
                } else {
                    None
                }
            }
            Err(err) => {
                if err.kind() == io::ErrorKind::PermissionDenied {
                    self.counters.permission_denied += 1;
                }
                None
            }
        }
    }

    fn sysfs_listing(&self) -> VecDeque<PathBuf> {
        let mut numbers: Vec<u64> = list_dir_names(&self.topology.sysfs_block_dir)
            .iter()
            .filter_map(|name| parse_loop_number(name))
            .collect();
        numbers.sort_unstable();
        numbers
            .into_iter()
            .map(|num| self.device_node_path(num))
            .collect()
    }

    fn scan_listing(&self) -> VecDeque<PathBuf> {
        let (dir, numeric_names) = if self.use_subdir {
            (&self.topology.loop_subdir, true)
        } else {
            (&self.topology.dev_dir, false)
        };

        let mut names: Vec<String> = list_dir_names(dir)
            .into_iter()
            .filter(|name| {
                let num = if numeric_names {
                    name.parse::<u64>().ok()
                } else {
                    parse_loop_number(name)
                };
                num.is_some_and(|n| n >= u64::from(DEFAULT_LOOP_COUNT))
            })
            .collect();
        names.sort_by(|a, b| version_cmp(a, b));
        names.into_iter().map(|name| dir.join(name)).collect()
    }

    fn next_pending(&mut self) -> Option<PathBuf> {
        self.pending.as_mut().and_then(VecDeque::pop_front)
    }
}

impl Iterator for LoopSearch {
    type Item = LoopDeviceRef;

    fn next(&mut self) -> Option<LoopDeviceRef> {
        loop {
            match self.stage {
                // A) /sys/block/loopN. Terminal: the listing covers every
                // existing device, so falling through to the later stages
                // would double-report loop0..7.
                Stage::Sysfs => {
                    if self.pending.is_none() {
                        self.pending = Some(self.sysfs_listing());
                    }
                    while let Some(path) = self.next_pending() {
                        if !is_loop_device(&path) {
                            continue;
                        }
                        if let Some(dev) = self.consider(path) {
                            return Some(dev);
                        }
                    }
                    self.pending = None;
                    self.stage = Stage::Done;
                }

                // B) the classic first eight devices, enough for almost
                // every system, probed without any directory listing.
                Stage::DefaultRange(next) => {
                    if next >= DEFAULT_LOOP_COUNT {
                        self.stage = Stage::Scan;
                        continue;
                    }
                    self.stage = Stage::DefaultRange(next + 1);
                    let path = self.device_node_path(u64::from(next));
                    if !is_loop_device(&path) {
                        continue;
                    }
                    if let Some(dev) = self.consider(path) {
                        return Some(dev);
                    }
                }

                // C) worst case: scan the whole device directory for
                // loop-major nodes beyond the default range.
                Stage::Scan => {
                    if self.pending.is_none() {
                        self.pending = Some(self.scan_listing());
                    }
                    while let Some(path) = self.next_pending() {
                        let Ok(meta) = fs::metadata(&path) else {
                            continue;
                        };
                        if !meta.file_type().is_block_device()
                            || libc::major(meta.rdev()) != LOOP_MAJOR
                            || u64::from(libc::minor(meta.rdev()))
                                < u64::from(DEFAULT_LOOP_COUNT)
                        {
                            continue;
                        }
                        if let Some(dev) = self.consider(path) {
                            return Some(dev);
                        }
                    }
                    self.pending = None;
                    self.stage = Stage::Done;
                }

                Stage::Done => return None,
            }
        }
    }
}

fn list_dir_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect()
}

/// Parse the numeric suffix of a `loop<N>` name. Anything else is `None`.
pub(crate) fn parse_loop_number(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("loop")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Version-aware name ordering: digit runs compare numerically, everything
/// else byte-wise. Matches the scan order users expect (`loop9 < loop10`).
pub(crate) fn version_cmp(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0, 0);

    while i < a.len() && j < b.len() {
        if a[i].is_ascii_digit() && b[j].is_ascii_digit() {
            let ai = i + a[i..].iter().take_while(|c| c.is_ascii_digit()).count();
            let bj = j + b[j..].iter().take_while(|c| c.is_ascii_digit()).count();
            let run_a = trim_leading_zeros(&a[i..ai]);
            let run_b = trim_leading_zeros(&b[j..bj]);
            let ord = run_a
                .len()
                .cmp(&run_b.len())
                .then_with(|| run_a.cmp(run_b))
                // Equal values with different raw widths: the run with more
                // leading zeros sorts first, as in strverscmp.
                .then_with(|| (bj - j).cmp(&(ai - i)));
            if ord != Ordering::Equal {
                return ord;
            }
            i = ai;
            j = bj;
        } else {
            if a[i] != b[j] {
                return a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }
    }
    (a.len() - i).cmp(&(b.len() - j))
}

fn trim_leading_zeros(digits: &[u8]) -> &[u8] {
    let start = digits
        .iter()
        .take_while(|&&b| b == b'0')
        .count()
        .min(digits.len().saturating_sub(1));
    &digits[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loop_number_parsing() {
        assert_eq!(parse_loop_number("loop0"), Some(0));
        assert_eq!(parse_loop_number("loop17"), Some(17));
        assert_eq!(parse_loop_number("loop"), None);
        assert_eq!(parse_loop_number("loop1p1"), None);
        assert_eq!(parse_loop_number("sda"), None);
    }

    #[test]
    fn version_order_sorts_numerically() {
        let mut names = vec!["loop10", "loop9", "loop100", "loop11"];
        names.sort_by(|a, b| version_cmp(a, b));
        assert_eq!(names, vec!["loop9", "loop10", "loop11", "loop100"]);
    }

    #[test]
    fn version_order_falls_back_to_bytes() {
        assert_eq!(version_cmp("loopa", "loopb"), Ordering::Less);
        assert_eq!(version_cmp("loop2", "loop2"), Ordering::Equal);
    }

    #[test]
    fn version_order_puts_leading_zeros_first() {
        assert_eq!(version_cmp("loop02", "loop2"), Ordering::Less);
        assert_eq!(version_cmp("loop2", "loop02"), Ordering::Greater);
        assert_eq!(version_cmp("loop010", "loop10"), Ordering::Less);
    }

    #[test]
    fn missing_dev_dir_is_an_error() {
        let topology = DeviceTopology {
            dev_dir: PathBuf::from("/no/such/dev"),
            loop_subdir: PathBuf::from("/no/such/dev/loop"),
            sysfs_block_dir: PathBuf::from("/no/such/sys"),
        };
        assert!(matches!(
            LoopSearch::open(&topology, FilterMode::Any),
            Err(LoopError::NotFound { .. })
        ));
    }

    #[test]
    fn empty_topology_yields_nothing_with_zero_attempts() {
        let dev = tempdir().unwrap();
        let topology = DeviceTopology {
            dev_dir: dev.path().to_path_buf(),
            loop_subdir: dev.path().join("loop"),
            sysfs_block_dir: dev.path().join("sys-block"),
        };

        let mut search = LoopSearch::open(&topology, FilterMode::FreeOnly).unwrap();
        assert!(search.next().is_none());
        assert_eq!(search.counters(), SearchCounters::default());
        // Single pass: exhausted cursors stay exhausted.
        assert!(search.next().is_none());
    }

    #[test]
    fn regular_files_named_like_loops_are_skipped() {
        // Without mknod we cannot create block nodes, but the enumerator
        // must still refuse to treat plain files as devices.
        let dev = tempdir().unwrap();
        for n in [0, 1, 9] {
            std::fs::write(dev.path().join(format!("loop{n}")), b"").unwrap();
        }
        let topology = DeviceTopology {
            dev_dir: dev.path().to_path_buf(),
            loop_subdir: dev.path().join("loop"),
            sysfs_block_dir: dev.path().join("sys-block"),
        };

        let mut search = LoopSearch::open(&topology, FilterMode::Any).unwrap();
        assert!(search.next().is_none());
        assert_eq!(search.counters().attempted, 0);
    }
}
