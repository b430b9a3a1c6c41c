//! The two generations of the kernel's loop binding descriptor, the ioctl
//! requests that carry them, and the lossy projection between the shapes.
//!
//! `LoopInfo64` is authoritative. `LoopInfo` is the pre-2.6 fixed-width
//! layout and is only used when the kernel rejects the 64-bit calls; any
//! field that does not survive the narrowing is an `Overflow` error, never a
//! silent truncation. The two structs never share storage.

use crate::error::{LoopError, LoopResult};
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use zeroize::Zeroize;

pub const LO_NAME_SIZE: usize = 64;
pub const LO_KEY_SIZE: usize = 32;

pub const LO_CRYPT_NONE: u32 = 0;
pub const LO_CRYPT_XOR: u32 = 1;
pub const LO_CRYPT_CRYPTOAPI: u32 = 18;

/// The binding releases itself when the last reference to the device closes.
pub const LO_FLAGS_AUTOCLEAR: u32 = 4;

pub(crate) const LOOP_SET_FD: libc::c_ulong = 0x4C00;
pub(crate) const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
pub(crate) const LOOP_SET_STATUS: libc::c_ulong = 0x4C02;
pub(crate) const LOOP_GET_STATUS: libc::c_ulong = 0x4C03;
pub(crate) const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
pub(crate) const LOOP_GET_STATUS64: libc::c_ulong = 0x4C05;

/// `struct loop_info64` from `<linux/loop.h>`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct LoopInfo64 {
    pub lo_device: u64,
    pub lo_inode: u64,
    pub lo_rdevice: u64,
    pub lo_offset: u64,
    pub lo_sizelimit: u64,
    pub lo_number: u32,
    pub lo_encrypt_type: u32,
    pub lo_encrypt_key_size: u32,
    pub lo_flags: u32,
    pub lo_file_name: [u8; LO_NAME_SIZE],
    pub lo_crypt_name: [u8; LO_NAME_SIZE],
    pub lo_encrypt_key: [u8; LO_KEY_SIZE],
    pub lo_init: [u64; 2],
}

/// Legacy `struct loop_info`, kept only as a fallback wire shape.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct LoopInfo {
    pub lo_number: libc::c_int,
    pub lo_device: libc::c_ulong,
    pub lo_inode: libc::c_ulong,
    pub lo_rdevice: libc::c_ulong,
    pub lo_offset: libc::c_int,
    pub lo_encrypt_type: libc::c_int,
    pub lo_encrypt_key_size: libc::c_int,
    pub lo_flags: libc::c_int,
    pub lo_name: [u8; LO_NAME_SIZE],
    pub lo_encrypt_key: [u8; LO_KEY_SIZE],
    pub lo_init: [libc::c_ulong; 2],
    pub reserved: [u8; 4],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        // Plain-old-data ioctl payload; all-zero is the valid empty state.
        unsafe { std::mem::zeroed() }
    }
}

impl Default for LoopInfo {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

impl LoopInfo64 {
    /// Scrub key material once the descriptor has been handed to the kernel.
    pub fn wipe_key(&mut self) {
        self.lo_encrypt_key.zeroize();
    }
}

impl LoopInfo {
    pub fn wipe_key(&mut self) {
        self.lo_encrypt_key.zeroize();
    }
}

/// Narrow a 64-bit descriptor to the legacy layout.
///
/// Pure and total except for the documented overflow case: `lo_device`,
/// `lo_rdevice`, `lo_inode` and `lo_offset` must round-trip exactly, and a
/// nonzero `lo_sizelimit` has nowhere to go, or the projection is rejected.
pub fn project_to_legacy(info: &LoopInfo64) -> LoopResult<LoopInfo> {
    let mut old = LoopInfo::default();

    old.lo_number = info.lo_number as libc::c_int;
    old.lo_device = info.lo_device as libc::c_ulong;
    old.lo_inode = info.lo_inode as libc::c_ulong;
    old.lo_rdevice = info.lo_rdevice as libc::c_ulong;
    old.lo_offset = info.lo_offset as libc::c_int;
    old.lo_encrypt_type = info.lo_encrypt_type as libc::c_int;
    old.lo_encrypt_key_size = info.lo_encrypt_key_size as libc::c_int;
    old.lo_flags = info.lo_flags as libc::c_int;
    old.lo_init = [
        info.lo_init[0] as libc::c_ulong,
        info.lo_init[1] as libc::c_ulong,
    ];

    // The legacy shape has a single name slot: transport ciphers store the
    // cipher name there, everything else the backing file name.
    if info.lo_encrypt_type == LO_CRYPT_CRYPTOAPI {
        old.lo_name = info.lo_crypt_name;
    } else {
        old.lo_name = info.lo_file_name;
    }
    old.lo_encrypt_key = info.lo_encrypt_key;

    if old.lo_device as u64 != info.lo_device {
        return Err(LoopError::Overflow("lo_device"));
    }
    if old.lo_rdevice as u64 != info.lo_rdevice {
        return Err(LoopError::Overflow("lo_rdevice"));
    }
    if old.lo_inode as u64 != info.lo_inode {
        return Err(LoopError::Overflow("lo_inode"));
    }
    if old.lo_offset as i64 as u64 != info.lo_offset {
        return Err(LoopError::Overflow("lo_offset"));
    }
    // The legacy layout has no size-limit field at all; a nonzero limit
    // cannot be represented and must not be dropped on the floor.
    if info.lo_sizelimit != 0 {
        return Err(LoopError::Overflow("lo_sizelimit"));
    }

    Ok(old)
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub(crate) fn set_backing_fd(device: RawFd, backing: RawFd) -> io::Result<()> {
    check(unsafe { libc::ioctl(device, LOOP_SET_FD, backing) })
}

pub(crate) fn clear_backing_fd(device: RawFd) -> io::Result<()> {
    check(unsafe { libc::ioctl(device, LOOP_CLR_FD, 0) })
}

pub(crate) fn set_status64(device: RawFd, info: &LoopInfo64) -> io::Result<()> {
    check(unsafe { libc::ioctl(device, LOOP_SET_STATUS64, info as *const LoopInfo64) })
}

pub(crate) fn set_status_legacy(device: RawFd, info: &LoopInfo) -> io::Result<()> {
    check(unsafe { libc::ioctl(device, LOOP_SET_STATUS, info as *const LoopInfo) })
}

pub(crate) fn get_status64(device: RawFd) -> io::Result<LoopInfo64> {
    let mut info = LoopInfo64::default();
    check(unsafe { libc::ioctl(device, LOOP_GET_STATUS64, &mut info as *mut LoopInfo64) })?;
    Ok(info)
}

pub(crate) fn get_status_legacy(device: RawFd) -> io::Result<LoopInfo> {
    let mut info = LoopInfo::default();
    check(unsafe { libc::ioctl(device, LOOP_GET_STATUS, &mut info as *mut LoopInfo) })?;
    Ok(info)
}

/// Decoded binding state of a device, shape-independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingStatus {
    pub backing_dev: u64,
    pub backing_ino: u64,
    pub offset: u64,
    pub size_limit: u64,
    pub encrypt_type: u32,
    pub crypt_name: String,
    pub file_name: String,
    pub flags: u32,
}

fn name_to_string(raw: &[u8; LO_NAME_SIZE]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Query a device's current binding, preferring the 64-bit shape.
///
/// `Ok(None)` means the device holds no binding (the kernel answered ENXIO);
/// any other query failure propagates so callers never mistake a transient
/// error for a free device.
pub fn query_status(device: &File) -> LoopResult<Option<BindingStatus>> {
    let fd = device.as_raw_fd();

    match get_status64(fd) {
        Ok(info) => {
            return Ok(Some(BindingStatus {
                backing_dev: info.lo_device,
                backing_ino: info.lo_inode,
                offset: info.lo_offset,
                size_limit: info.lo_sizelimit,
                encrypt_type: info.lo_encrypt_type,
                crypt_name: name_to_string(&info.lo_crypt_name),
                file_name: name_to_string(&info.lo_file_name),
                flags: info.lo_flags,
            }))
        }
        Err(err) if err.raw_os_error() == Some(libc::ENXIO) => return Ok(None),
        Err(_) => {}
    }

    match get_status_legacy(fd) {
        Ok(info) => Ok(Some(BindingStatus {
            backing_dev: info.lo_device as u64,
            backing_ino: info.lo_inode as u64,
            offset: info.lo_offset as u64,
            size_limit: 0,
            encrypt_type: info.lo_encrypt_type as u32,
            crypt_name: String::new(),
            file_name: name_to_string(&info.lo_name),
            flags: info.lo_flags as u32,
        })),
        Err(err) if err.raw_os_error() == Some(libc::ENXIO) => Ok(None),
        Err(err) => Err(LoopError::Io(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(offset: u64, device: u64, inode: u64) -> LoopInfo64 {
        let mut info = LoopInfo64::default();
        info.lo_device = device;
        info.lo_inode = inode;
        info.lo_offset = offset;
        info.lo_number = 3;
        info.lo_encrypt_type = LO_CRYPT_NONE;
        info.lo_flags = LO_FLAGS_AUTOCLEAR;
        info.lo_file_name[..8].copy_from_slice(b"/tmp/img");
        info
    }

    #[test]
    fn projection_preserves_identity_fields() {
        let info = filled(4096, 0x801, 12345);
        let old = project_to_legacy(&info).unwrap();
        assert_eq!(old.lo_device as u64, 0x801);
        assert_eq!(old.lo_inode as u64, 12345);
        assert_eq!(old.lo_offset, 4096);
        assert_eq!(old.lo_number, 3);
        assert_eq!(old.lo_flags as u32, LO_FLAGS_AUTOCLEAR);
        assert_eq!(&old.lo_name[..8], b"/tmp/img");
    }

    #[test]
    fn projection_rejects_wide_offset() {
        let info = filled(u64::from(u32::MAX) + 100, 0x801, 1);
        match project_to_legacy(&info) {
            Err(LoopError::Overflow(field)) => assert_eq!(field, "lo_offset"),
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[test]
    fn projection_rejects_negative_offset_reinterpretation() {
        // Fits in 32 value bits but flips the sign of the legacy c_int field.
        let info = filled(u64::from(u32::MAX), 0x801, 1);
        assert!(matches!(
            project_to_legacy(&info),
            Err(LoopError::Overflow("lo_offset"))
        ));
    }

    #[test]
    fn projection_rejects_size_limit() {
        let mut info = filled(0, 0x801, 1);
        info.lo_sizelimit = 512;
        assert!(matches!(
            project_to_legacy(&info),
            Err(LoopError::Overflow("lo_sizelimit"))
        ));
    }

    #[test]
    fn projection_picks_crypt_name_for_cryptoapi() {
        let mut info = filled(0, 1, 1);
        info.lo_encrypt_type = LO_CRYPT_CRYPTOAPI;
        info.lo_crypt_name[..3].copy_from_slice(b"aes");
        let old = project_to_legacy(&info).unwrap();
        assert_eq!(&old.lo_name[..3], b"aes");
    }

    #[test]
    fn projection_picks_file_name_otherwise() {
        let info = filled(0, 1, 1);
        let old = project_to_legacy(&info).unwrap();
        assert_eq!(&old.lo_name[..8], b"/tmp/img");
    }

    #[test]
    fn wipe_key_zeroes_material() {
        let mut info = LoopInfo64::default();
        info.lo_encrypt_key = [0xAA; LO_KEY_SIZE];
        info.wipe_key();
        assert_eq!(info.lo_encrypt_key, [0u8; LO_KEY_SIZE]);
    }

    #[test]
    fn name_decoding_stops_at_nul() {
        let mut raw = [0u8; LO_NAME_SIZE];
        raw[..4].copy_from_slice(b"abcd");
        assert_eq!(name_to_string(&raw), "abcd");
    }
}
