//! Host-file access for container images.
//!
//! The storage layers above never touch the host file directly; they go
//! through [`BlockDevice`], a seekable byte-level contract. Two devices are
//! provided: [`HostFileDevice`] for plaintext images and [`CipherDevice`],
//! which layers an AES-256-CTR keystream over an inner device so that every
//! byte past the plaintext prefix lands on disk encrypted.

use crate::error::Result;
use crate::superblock::CIPHER_ORIGIN;
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr128BE;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Seekable byte I/O over a container image.
///
/// Reads may come back short when the requested range extends past the end
/// of the host file; callers treat the missing bytes as zero (sparse
/// images). Writes past the end extend the file.
pub trait BlockDevice: Send {
    /// Read up to `buf.len()` bytes at `offset`, returning how many were read.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `data` at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current host-file length in bytes.
    fn len(&mut self) -> Result<u64>;

    /// Flush host-file buffers to stable storage.
    fn sync(&mut self) -> Result<()>;
}

/// Plain (unencrypted) host-file device.
pub struct HostFileDevice {
    file: std::fs::File,
}

impl HostFileDevice {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(HostFileDevice { file })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(HostFileDevice { file })
    }
}

impl BlockDevice for HostFileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            let n = self.file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Keying material for the stream cipher, derived from the password and the
/// image's IV block.
#[derive(Clone)]
pub struct CipherKey {
    key: [u8; 32],
    iv: [u8; 16],
}

impl CipherKey {
    /// Derive the cipher key from a password and the four image IVs.
    ///
    /// The key binds the password to the image (two IVs salt the key, the
    /// other two derive the counter IV), so identical passwords on distinct
    /// images produce unrelated keystreams.
    pub fn derive(password: &str, ivs: &[u64; 4]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(ivs[0].to_le_bytes());
        hasher.update(ivs[1].to_le_bytes());
        let key: [u8; 32] = hasher.finalize().into();

        let mut hasher = Sha256::new();
        hasher.update(ivs[2].to_le_bytes());
        hasher.update(ivs[3].to_le_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&digest[..16]);

        CipherKey { key, iv }
    }
}

/// Encrypting device: AES-256-CTR keystream over an inner device.
///
/// Offsets below [`CIPHER_ORIGIN`] (the IV block and cipher header, which
/// must be readable before any key exists) pass through as plaintext; the
/// keystream position for offset `o` is `o - CIPHER_ORIGIN`, so random
/// access never re-reads neighbouring bytes.
pub struct CipherDevice<D> {
    inner: D,
    cipher: Aes256Ctr,
}

impl<D: BlockDevice> CipherDevice<D> {
    pub fn new(inner: D, key: &CipherKey) -> Self {
        let cipher = Aes256Ctr::new((&key.key).into(), (&key.iv).into());
        CipherDevice { inner, cipher }
    }

    /// Apply the keystream in place to the ciphered portion of a buffer
    /// that starts at absolute offset `offset`.
    fn keystream(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end <= CIPHER_ORIGIN {
            return Ok(());
        }
        let start = offset.max(CIPHER_ORIGIN);
        let skip = (start - offset) as usize;
        self.cipher
            .try_seek(start - CIPHER_ORIGIN)
            .map_err(|_| crate::error::CloakError::Corrupt("keystream position overflow"))?;
        self.cipher.apply_keystream(&mut buf[skip..]);
        Ok(())
    }
}

impl<D: BlockDevice> BlockDevice for CipherDevice<D> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read_at(offset, buf)?;
        self.keystream(offset, &mut buf[..n])?;
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut ciphered = data.to_vec();
        self.keystream(offset, &mut ciphered)?;
        self.inner.write_at(offset, &ciphered)
    }

    fn len(&mut self) -> Result<u64> {
        self.inner.len()
    }

    fn sync(&mut self) -> Result<()> {
        self.inner.sync()
    }
}
