//! Bind and unbind state transitions.
//!
//! `bind` walks the full attach protocol against a chosen device: open the
//! backing file and device, populate the 64-bit descriptor, attach the
//! backing fd, then push status (with the legacy-shape fallback). A failure
//! after the attach is undone with a clear-fd, so the caller only ever
//! observes a fully bound or fully unbound device. `unbind` is a single
//! atomic clear request.

use crate::associate::find_associated;
use crate::enumerate::DeviceTopology;
use crate::error::{LoopError, LoopResult};
use crate::keys::{derive_key, PassphraseSource};
use crate::status::{
    clear_backing_fd, get_status64, get_status_legacy, project_to_legacy, set_backing_fd,
    set_status64, set_status_legacy, LoopInfo64, LO_CRYPT_CRYPTOAPI, LO_CRYPT_NONE, LO_CRYPT_XOR,
    LO_FLAGS_AUTOCLEAR, LO_KEY_SIZE, LO_NAME_SIZE,
};
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Parsed encryption request.
///
/// A purely numeric spec selects a cipher by its legacy type number; any
/// other non-empty spec names a transport cipher. `none`/`no` and the empty
/// spec mean no encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherSpec {
    pub encrypt_type: u32,
    pub name: Option<String>,
}

impl CipherSpec {
    pub fn parse(spec: Option<&str>) -> Self {
        let spec = spec.unwrap_or("").trim();
        if spec.is_empty() || spec.eq_ignore_ascii_case("none") || spec.eq_ignore_ascii_case("no")
        {
            return Self {
                encrypt_type: LO_CRYPT_NONE,
                name: None,
            };
        }
        if let Ok(num) = spec.parse::<u32>() {
            return Self {
                encrypt_type: num,
                name: None,
            };
        }
        Self {
            encrypt_type: LO_CRYPT_CRYPTOAPI,
            name: Some(spec.to_string()),
        }
    }
}

/// Everything `bind` needs to know, requested options included.
#[derive(Debug)]
pub struct BindRequest<'a> {
    pub device: &'a Path,
    pub file: &'a Path,
    pub offset: u64,
    pub size_limit: u64,
    pub cipher: Option<&'a str>,
    /// Key length handed to the cipher; defaults to the maximum supported
    /// size when unset.
    pub key_bits: Option<u32>,
    /// Stretch the passphrase through the hash pool instead of copying it.
    pub stretch_key: bool,
    pub read_only: bool,
    pub autoclear: bool,
    /// Enumeration roots for the advisory already-associated scan; `None`
    /// falls back to the standard `/dev` and sysfs layout.
    pub topology: Option<&'a DeviceTopology>,
}

impl<'a> BindRequest<'a> {
    pub fn new(device: &'a Path, file: &'a Path) -> Self {
        Self {
            device,
            file,
            offset: 0,
            size_limit: 0,
            cipher: None,
            key_bits: None,
            stretch_key: true,
            read_only: false,
            autoclear: false,
            topology: None,
        }
    }
}

/// What a bind actually achieved, as distinct from what was requested.
#[derive(Debug)]
pub struct BindReport {
    /// The binding ended up read-only (requested, or downgraded because the
    /// backing filesystem is read-only).
    pub read_only: bool,
    /// The kernel confirmed the autoclear flag.
    pub autoclear: bool,
    /// Kept open only when autoclear was achieved: this handle is what
    /// keeps the binding alive until last-close.
    pub device_handle: Option<File>,
}

fn copy_name(dst: &mut [u8; LO_NAME_SIZE], src: &[u8]) {
    let take = src.len().min(LO_NAME_SIZE - 1);
    dst[..take].copy_from_slice(&src[..take]);
    dst[take] = 0;
}

fn key_bytes_for(key_bits: Option<u32>) -> usize {
    let bits = key_bits.filter(|&bits| bits > 0).unwrap_or((LO_KEY_SIZE * 8) as u32);
    ((bits as usize) / 8).clamp(1, LO_KEY_SIZE)
}

/// Bind `request.device` to `request.file`.
///
/// Busy devices surface as `LoopError::Busy` so callers racing other
/// processes can re-enumerate and retry; every other failure is final for
/// this attempt. On any failure the device is left unbound.
pub fn bind(
    request: &BindRequest<'_>,
    passphrase: &mut dyn PassphraseSource,
) -> LoopResult<BindReport> {
    // Advisory only, and the scan costs a full enumeration pass, so it is
    // skipped outright when nobody listens at warn level.
    if log::log_enabled!(log::Level::Warn) {
        let default_topology;
        let topology = match request.topology {
            Some(topology) => topology,
            None => {
                default_topology = DeviceTopology::default();
                &default_topology
            }
        };
        if let Ok(Some(existing)) = find_associated(topology, request.file, request.offset) {
            warn!(
                "{} is already associated with {}",
                request.file.display(),
                existing.path.display()
            );
        }
    }

    // 1) backing file, honouring the read-only request and downgrading
    //    silently when the filesystem itself is read-only.
    let mut read_only = request.read_only;
    let backing = match open_with_mode(request.file, read_only) {
        Ok(file) => file,
        Err(err) if !read_only && err.raw_os_error() == Some(libc::EROFS) => {
            read_only = true;
            open_with_mode(request.file, true)
                .map_err(|err| LoopError::from_path_io(request.file, err))?
        }
        Err(err) => return Err(LoopError::from_path_io(request.file, err)),
    };

    // 2) the device, with the same access mode.
    let device = open_with_mode(request.device, read_only)
        .map_err(|err| LoopError::from_path_io(request.device, err))?;

    // 3) + 4) descriptor: canonical backing path and encryption fields.
    let mut info = LoopInfo64::default();
    let stored_name = fs::canonicalize(request.file)
        .unwrap_or_else(|_| request.file.to_path_buf());
    copy_name(&mut info.lo_file_name, stored_name.as_os_str().as_bytes());

    let cipher = CipherSpec::parse(request.cipher);
    info.lo_encrypt_type = cipher.encrypt_type;
    if let Some(name) = &cipher.name {
        copy_name(&mut info.lo_crypt_name, name.as_bytes());
    }
    info.lo_offset = request.offset;
    info.lo_sizelimit = request.size_limit;

    // 5) key material.
    match info.lo_encrypt_type {
        LO_CRYPT_NONE => info.lo_encrypt_key_size = 0,
        LO_CRYPT_XOR => {
            let pass = passphrase.read_passphrase("Password: ")?;
            let key = derive_key(&pass, LO_KEY_SIZE, false);
            info.lo_encrypt_key.copy_from_slice(&key);
            info.lo_encrypt_key_size = LO_KEY_SIZE as u32;
        }
        _ => {
            let pass = passphrase.read_passphrase("Password: ")?;
            if request.stretch_key {
                let take = key_bytes_for(request.key_bits);
                let key = derive_key(&pass, take, true);
                info.lo_encrypt_key[..take].copy_from_slice(&key);
                info.lo_encrypt_key_size = take as u32;
            } else {
                let key = derive_key(&pass, LO_KEY_SIZE, false);
                info.lo_encrypt_key.copy_from_slice(&key);
                info.lo_encrypt_key_size = LO_KEY_SIZE as u32;
            }
        }
    }

    // 6) attach the backing descriptor. EBUSY means another process won the
    //    race for this device; that outcome is retryable with a different
    //    device, everything else is not.
    if let Err(err) = set_backing_fd(device.as_raw_fd(), backing.as_raw_fd()) {
        info.wipe_key();
        return Err(if err.raw_os_error() == Some(libc::EBUSY) {
            LoopError::Busy {
                device: request.device.to_path_buf(),
            }
        } else {
            LoopError::Io(err)
        });
    }

    // 7) the device now holds its own reference to the backing file.
    drop(backing);

    // 8) push status, falling back to the legacy shape when the kernel
    //    rejects the 64-bit call.
    let mut autoclear = request.autoclear;
    if autoclear {
        info.lo_flags |= LO_FLAGS_AUTOCLEAR;
    }

    let status_result = push_status(&device, &mut info, &mut autoclear);
    info.wipe_key();

    // 9) all-or-nothing: undo the attach before reporting failure.
    if let Err(err) = status_result {
        let _ = clear_backing_fd(device.as_raw_fd());
        return Err(err);
    }

    debug!(
        "bound {} to {} (offset {}, sizelimit {})",
        request.device.display(),
        stored_name.display(),
        request.offset,
        request.size_limit
    );

    // 11) with autoclear in effect, the open handle is the binding's
    //     lifeline; without it the handle has served its purpose.
    let device_handle = autoclear.then_some(device);
    Ok(BindReport {
        read_only,
        autoclear,
        device_handle,
    })
}

/// Steps 8 and 10: set status (64-bit first, legacy on rejection) and
/// confirm the autoclear flag against what the kernel actually stored.
fn push_status(device: &File, info: &mut LoopInfo64, autoclear: &mut bool) -> LoopResult<()> {
    let fd = device.as_raw_fd();

    match set_status64(fd, info) {
        Ok(()) => {
            if *autoclear {
                let confirmed = get_status64(fd)
                    .map(|current| current.lo_flags & LO_FLAGS_AUTOCLEAR != 0)
                    .unwrap_or(false);
                if !confirmed {
                    *autoclear = false;
                }
            }
            Ok(())
        }
        Err(err64) => {
            debug!("LOOP_SET_STATUS64 rejected ({err64}), retrying with the legacy layout");
            let mut legacy = project_to_legacy(info).inspect_err(|_| *autoclear = false)?;
            let result = set_status_legacy(fd, &legacy);
            legacy.wipe_key();
            result?;

            if *autoclear {
                let confirmed = get_status_legacy(fd)
                    .map(|current| current.lo_flags as u32 & LO_FLAGS_AUTOCLEAR != 0)
                    .unwrap_or(false);
                if !confirmed {
                    *autoclear = false;
                }
            }
            Ok(())
        }
    }
}

fn open_with_mode(path: &Path, read_only: bool) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(!read_only)
        .open(path)
}

/// Detach the binding on `device`.
///
/// A single atomic kernel request: open read-only, clear the backing
/// descriptor, close. There is no partial state to clean up on failure.
pub fn unbind(device: &Path) -> LoopResult<()> {
    let file = File::open(device).map_err(|err| LoopError::from_path_io(device, err))?;
    clear_backing_fd(file.as_raw_fd())?;
    debug!("unbound {}", device.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    struct FixedPass(&'static [u8]);

    impl PassphraseSource for FixedPass {
        fn read_passphrase(&mut self, _prompt: &str) -> LoopResult<Zeroizing<Vec<u8>>> {
            Ok(Zeroizing::new(self.0.to_vec()))
        }
    }

    #[test]
    fn cipher_spec_empty_and_none_mean_no_encryption() {
        for spec in [None, Some(""), Some("none"), Some("NONE"), Some("no")] {
            let parsed = CipherSpec::parse(spec);
            assert_eq!(parsed.encrypt_type, LO_CRYPT_NONE, "spec {spec:?}");
            assert_eq!(parsed.name, None);
        }
    }

    #[test]
    fn cipher_spec_digits_select_numeric_type() {
        let parsed = CipherSpec::parse(Some("18"));
        assert_eq!(parsed.encrypt_type, 18);
        assert_eq!(parsed.name, None);

        let xor = CipherSpec::parse(Some("1"));
        assert_eq!(xor.encrypt_type, LO_CRYPT_XOR);
    }

    #[test]
    fn cipher_spec_names_select_cryptoapi() {
        for spec in ["aes", "twofish", "aes-256"] {
            let parsed = CipherSpec::parse(Some(spec));
            assert_eq!(parsed.encrypt_type, LO_CRYPT_CRYPTOAPI);
            assert_eq!(parsed.name.as_deref(), Some(spec));
        }
    }

    #[test]
    fn key_size_defaults_to_maximum() {
        assert_eq!(key_bytes_for(None), LO_KEY_SIZE);
        assert_eq!(key_bytes_for(Some(0)), LO_KEY_SIZE);
    }

    #[test]
    fn key_size_follows_requested_bits_within_bounds() {
        assert_eq!(key_bytes_for(Some(128)), 16);
        assert_eq!(key_bytes_for(Some(160)), 20);
        // Wider than the descriptor's key slot: clamp instead of overflow.
        assert_eq!(key_bytes_for(Some(4096)), LO_KEY_SIZE);
    }

    #[test]
    fn name_copy_truncates_and_terminates() {
        let mut dst = [0xFFu8; LO_NAME_SIZE];
        copy_name(&mut dst, b"/tmp/img.raw");
        assert_eq!(&dst[..12], b"/tmp/img.raw");
        assert_eq!(dst[12], 0);

        let long = vec![b'x'; 2 * LO_NAME_SIZE];
        copy_name(&mut dst, &long);
        assert_eq!(dst[LO_NAME_SIZE - 1], 0);
        assert!(dst[..LO_NAME_SIZE - 1].iter().all(|&b| b == b'x'));
    }

    #[test]
    fn bind_scans_the_request_topology_not_the_system_one() {
        let dir = tempfile::tempdir().unwrap();
        let backing = dir.path().join("img");
        std::fs::write(&backing, b"payload").unwrap();
        let topology = DeviceTopology {
            dev_dir: dir.path().to_path_buf(),
            loop_subdir: dir.path().join("loop"),
            sysfs_block_dir: dir.path().join("sys-block"),
        };

        let device = dir.path().join("loop0");
        let mut request = BindRequest::new(&device, &backing);
        request.topology = Some(&topology);
        let mut pass = FixedPass(b"");

        // The advisory scan runs against the supplied roots and the bind
        // then fails on the absent device node, not on the scan.
        assert!(matches!(
            bind(&request, &mut pass),
            Err(LoopError::NotFound { path }) if path == device
        ));
    }

    #[test]
    fn bind_against_missing_backing_file_reports_not_found() {
        let request = BindRequest::new(
            Path::new("/dev/loop0"),
            Path::new("/no/such/backing.img"),
        );
        let mut pass = FixedPass(b"");
        assert!(matches!(
            bind(&request, &mut pass),
            Err(LoopError::NotFound { .. })
        ));
    }
}
