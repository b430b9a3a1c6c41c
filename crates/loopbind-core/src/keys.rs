//! Passphrase intake and key-material derivation.
//!
//! Every buffer that ever holds passphrase or key bytes is `Zeroizing`, so
//! it is scrubbed on every exit path. The fd-backed reader deliberately
//! reads one byte at a time straight through `read(2)`: no buffering layer
//! may retain secret bytes, and the stream must not be consumed past the
//! line terminator.

use crate::error::LoopResult;
use ripemd::{Digest, Ripemd160};
use std::io;
use std::os::unix::io::RawFd;
use zeroize::Zeroizing;

const DIGEST_LEN: usize = 20;

/// Expand `passphrase` into `target_len` bytes of key material.
///
/// Without `stretch` the passphrase is copied verbatim, truncated or
/// zero-padded. With `stretch` the pool is
/// `RIPEMD-160(pass) || RIPEMD-160('A' || pass)` and the first `target_len`
/// bytes are returned. The stretch exists to grow short passphrases to
/// cipher-sized keys; it is not a hardened KDF.
pub fn derive_key(passphrase: &[u8], target_len: usize, stretch: bool) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; target_len]);

    if stretch {
        let mut salted = Zeroizing::new(Vec::with_capacity(passphrase.len() + 1));
        salted.push(b'A');
        salted.extend_from_slice(passphrase);

        let mut pool = Zeroizing::new([0u8; 2 * DIGEST_LEN]);
        pool[..DIGEST_LEN].copy_from_slice(&Ripemd160::digest(passphrase));
        pool[DIGEST_LEN..].copy_from_slice(&Ripemd160::digest(&salted[..]));

        let take = target_len.min(pool.len());
        key[..take].copy_from_slice(&pool[..take]);
    } else {
        let take = passphrase.len().min(target_len);
        key[..take].copy_from_slice(&passphrase[..take]);
    }

    key
}

/// Where bind operations obtain their secret.
///
/// External collaborator seam: the terminal prompt and the fd stream both
/// hand back raw bytes, never an interned string.
pub trait PassphraseSource {
    fn read_passphrase(&mut self, prompt: &str) -> LoopResult<Zeroizing<Vec<u8>>>;
}

/// Interactive terminal prompt.
pub struct TerminalPrompt;

impl PassphraseSource for TerminalPrompt {
    fn read_passphrase(&mut self, prompt: &str) -> LoopResult<Zeroizing<Vec<u8>>> {
        let pass = rpassword::prompt_password(prompt)?;
        Ok(Zeroizing::new(pass.into_bytes()))
    }
}

/// Reads from a caller-supplied descriptor until newline, NUL, or EOF.
///
/// The caller keeps ownership of the descriptor; bytes past the terminator
/// stay unread.
pub struct FdReader {
    fd: RawFd,
}

impl FdReader {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl PassphraseSource for FdReader {
    fn read_passphrase(&mut self, _prompt: &str) -> LoopResult<Zeroizing<Vec<u8>>> {
        let mut pass = Zeroizing::new(Vec::new());
        loop {
            let mut byte = [0u8; 1];
            let n = unsafe { libc::read(self.fd, byte.as_mut_ptr().cast(), 1) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if n == 0 || byte[0] == b'\n' || byte[0] == 0 {
                break;
            }
            pass.push(byte[0]);
        }
        Ok(pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Read;
    use std::os::unix::io::AsRawFd;
    use tempfile::tempdir;

    #[test]
    fn plain_copy_pads_with_zeros() {
        let key = derive_key(b"abc", 32, false);
        assert_eq!(&key[..3], b"abc");
        assert_eq!(&key[3..], &[0u8; 29][..]);
    }

    #[test]
    fn plain_copy_truncates_long_passphrases() {
        let key = derive_key(b"0123456789", 4, false);
        assert_eq!(&key[..], b"0123");
    }

    #[test]
    fn stretch_is_deterministic() {
        let a = derive_key(b"correct horse", 32, true);
        let b = derive_key(b"correct horse", 32, true);
        assert_eq!(&a[..], &b[..]);
        assert_ne!(&a[..], &derive_key(b"other", 32, true)[..]);
    }

    #[test]
    fn stretch_matches_two_digest_construction() {
        let pass = b"swordfish";
        let mut salted = vec![b'A'];
        salted.extend_from_slice(pass);

        let key = derive_key(pass, 32, true);
        assert_eq!(&key[..DIGEST_LEN], &Ripemd160::digest(pass)[..]);
        assert_eq!(
            &key[DIGEST_LEN..32],
            &Ripemd160::digest(&salted)[..32 - DIGEST_LEN]
        );
    }

    #[test]
    fn stretch_honours_short_targets() {
        let short = derive_key(b"swordfish", 16, true);
        let long = derive_key(b"swordfish", 32, true);
        assert_eq!(&short[..], &long[..16]);
    }

    #[test]
    fn fd_reader_stops_at_newline_without_overreading() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pass");
        std::fs::write(&path, b"secret\nrest").unwrap();

        let mut file = File::open(&path).unwrap();
        let mut source = FdReader::new(file.as_raw_fd());
        let pass = source.read_passphrase("").unwrap();
        assert_eq!(&pass[..], b"secret");

        // Everything past the terminator must still be on the stream.
        let mut rest = String::new();
        file.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "rest");
    }

    #[test]
    fn fd_reader_accepts_eof_terminated_input() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pass");
        std::fs::write(&path, b"no-newline").unwrap();

        let file = File::open(&path).unwrap();
        let mut source = FdReader::new(file.as_raw_fd());
        let pass = source.read_passphrase("").unwrap();
        assert_eq!(&pass[..], b"no-newline");
    }

    #[test]
    fn fd_reader_treats_nul_as_terminator() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pass");
        std::fs::write(&path, b"abc\0def").unwrap();

        let file = File::open(&path).unwrap();
        let mut source = FdReader::new(file.as_raw_fd());
        let pass = source.read_passphrase("").unwrap();
        assert_eq!(&pass[..], b"abc");
    }
}
