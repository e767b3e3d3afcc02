//! On-disk geometry of a container image.
//!
//! Everything before the data area is the superblock region:
//!
//! ```text
//! offset 0   IV block                32 bytes (four u64-LE IVs)
//! offset 32  cipher header            2 bytes (rounds, cipher id)
//! offset 34  block size               4 bytes (u32 LE)
//! offset 38  version                  2 bytes (version, duplicate cipher id)
//! offset 40  password hash           32 bytes (SHA-256)
//! offset 72  total block count        8 bytes (u64 LE)
//! offset 80  occupancy bitmap  ceil(N/8) bytes (bit i of byte j = block 8j+i)
//!            file count               8 bytes (u64 LE, informational)
//!            data area            N * B bytes (block 0 .. N-1)
//! ```
//!
//! The first 40 bytes are plaintext (they are needed to construct the
//! cipher); everything from the password hash onward goes through the
//! encrypted device. All multi-byte integers are little-endian.

use crate::device::BlockDevice;
use crate::error::{CloakError, Result};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Byte offset where the ciphered region begins (end of the plaintext
/// prefix: IVs + cipher header + block size + version fields).
pub const CIPHER_ORIGIN: u64 = 40;

/// Size of the stored password hash (SHA-256).
pub const PASS_HASH_BYTES: usize = 32;

/// Offset of the password hash region.
pub const PASS_HASH_OFFSET: u64 = CIPHER_ORIGIN;

/// Offset of the total-block-count field.
pub const BLOCK_COUNT_OFFSET: u64 = 72;

/// Offset of the occupancy bitmap.
pub const BITMAP_OFFSET: u64 = 80;

/// Per-block trailer size: bytes-written (u32) + next-block index (u64).
pub const BLOCK_META: u32 = 12;

/// Current image format version. Versions below this predate the explicit
/// block-size field and imply 4096-byte blocks.
pub const FORMAT_VERSION: u8 = 20;

/// Block size implied by pre-versioned images.
pub const LEGACY_BLOCK_SIZE: u32 = 4096;

/// Cipher ids stored in the header.
pub const CIPHER_NONE: u8 = 0;
pub const CIPHER_AES256: u8 = 1;

/// Volume geometry derived from the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub block_size: u32,
    pub blocks: u64,
}

impl Layout {
    pub fn new(block_size: u32, blocks: u64) -> Self {
        Layout { block_size, blocks }
    }

    /// Bytes occupied by the occupancy bitmap.
    pub fn bitmap_len(&self) -> u64 {
        (self.blocks + 7) / 8
    }

    /// Offset of the (informational) file-count field.
    pub fn file_count_offset(&self) -> u64 {
        BITMAP_OFFSET + self.bitmap_len()
    }

    /// Offset of block 0 of the data area.
    pub fn data_origin(&self) -> u64 {
        self.file_count_offset() + 8
    }

    /// Offset of data-area block `index`.
    pub fn block_offset(&self, index: u64) -> u64 {
        self.data_origin() + index * self.block_size as u64
    }

    /// Usable data bytes per block (block size minus the trailer).
    pub fn write_space(&self) -> u32 {
        self.block_size - BLOCK_META
    }
}

/// Parsed superblock fields.
#[derive(Debug, Clone)]
pub struct Superblock {
    pub ivs: [u64; 4],
    pub rounds: u8,
    pub cipher: u8,
    pub block_size: u32,
    pub version: u8,
    pub blocks: u64,
}

impl Superblock {
    /// Read the 40-byte plaintext prefix from a raw (unciphered) device.
    ///
    /// The block count lives past the cipher origin and is filled in by
    /// [`Superblock::read_block_count`] once a ciphered device exists.
    pub fn read_prefix(dev: &mut dyn BlockDevice) -> Result<Self> {
        let mut prefix = [0u8; CIPHER_ORIGIN as usize];
        let n = dev.read_at(0, &mut prefix)?;
        if n < prefix.len() {
            return Err(CloakError::Corrupt("image too short for superblock"));
        }

        let mut ivs = [0u64; 4];
        for (i, iv) in ivs.iter_mut().enumerate() {
            *iv = u64::from_le_bytes(prefix[i * 8..i * 8 + 8].try_into().unwrap());
        }

        let rounds = prefix[32];
        let cipher = prefix[33];
        let stored_block_size = u32::from_le_bytes(prefix[34..38].try_into().unwrap());
        let version = prefix[38];
        let cipher_dup = prefix[39];

        if cipher != cipher_dup {
            return Err(CloakError::Corrupt("cipher id mismatch in header"));
        }
        if version > FORMAT_VERSION {
            return Err(CloakError::Corrupt("unsupported image version"));
        }

        let block_size = if version < FORMAT_VERSION {
            LEGACY_BLOCK_SIZE
        } else {
            stored_block_size
        };
        if block_size <= BLOCK_META {
            return Err(CloakError::Corrupt("block size too small"));
        }

        Ok(Superblock {
            ivs,
            rounds,
            cipher,
            block_size,
            version,
            blocks: 0,
        })
    }

    /// Read the total block count through the (possibly ciphered) device.
    pub fn read_block_count(&mut self, dev: &mut dyn BlockDevice) -> Result<()> {
        let mut buf = [0u8; 8];
        let n = dev.read_at(BLOCK_COUNT_OFFSET, &mut buf)?;
        if n < 8 {
            return Err(CloakError::Corrupt("image too short for block count"));
        }
        self.blocks = u64::from_le_bytes(buf);
        if self.blocks == 0 {
            return Err(CloakError::Corrupt("image reports zero blocks"));
        }
        Ok(())
    }

    /// Compare the stored password hash against `password`.
    pub fn verify_password(dev: &mut dyn BlockDevice, password: &str) -> Result<()> {
        let mut stored = [0u8; PASS_HASH_BYTES];
        let n = dev.read_at(PASS_HASH_OFFSET, &mut stored)?;
        if n < PASS_HASH_BYTES {
            return Err(CloakError::Corrupt("image too short for password hash"));
        }
        let expected: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        if stored != expected {
            return Err(CloakError::WrongPassword);
        }
        Ok(())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.block_size, self.blocks)
    }
}

/// An open volume: the device handle plus its geometry.
///
/// The device sits behind a mutex because independent [`crate::File`]
/// handles over distinct chains share it; the mutex serializes their byte
/// I/O (the core itself is single-writer, see the crate docs).
pub struct Volume {
    device: Mutex<Box<dyn BlockDevice>>,
    layout: Layout,
}

/// Shared handle to an open volume.
pub type SharedVolume = Arc<Volume>;

impl Volume {
    pub fn new(device: Box<dyn BlockDevice>, layout: Layout) -> SharedVolume {
        Arc::new(Volume {
            device: Mutex::new(device),
            layout,
        })
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Read up to `buf.len()` bytes at `offset`; short reads mean the
    /// region is past the end of a sparse image and reads as zero.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.device.lock().read_at(offset, buf)
    }

    /// Read exactly `buf.len()` bytes, zero-filling anything past the end
    /// of a sparse image.
    pub fn read_exact_or_zero(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at(offset, buf)?;
        buf[n..].fill(0);
        Ok(())
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.device.lock().write_at(offset, data)
    }

    pub fn sync(&self) -> Result<()> {
        self.device.lock().sync()
    }
}
