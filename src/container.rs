//! Building and opening container images.
//!
//! A fresh image is the superblock region followed by the data area (left
//! unwritten in sparse mode), with the root folder created at block 0
//! before the builder returns. Opening reverses the process: parse the
//! plaintext prefix, stand up the cipher, verify the password, read the
//! block count.

use crate::device::{BlockDevice, CipherDevice, CipherKey, HostFileDevice};
use crate::error::{CloakError, Result};
use crate::folder::ContentFolder;
use crate::superblock::{
    Layout, SharedVolume, Superblock, Volume, BITMAP_OFFSET, BLOCK_COUNT_OFFSET, BLOCK_META,
    CIPHER_AES256, CIPHER_NONE, FORMAT_VERSION, PASS_HASH_OFFSET,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const DEFAULT_BLOCKS: u64 = 4096;
const DEFAULT_BLOCK_SIZE: u32 = 4096;
const DEFAULT_ROUNDS: u8 = 64;

/// Writes a fresh container image.
pub struct ImageBuilder {
    path: PathBuf,
    password: String,
    blocks: u64,
    block_size: u32,
    cipher: u8,
    sparse: bool,
}

impl ImageBuilder {
    pub fn new<P: AsRef<Path>>(path: P, password: &str) -> Self {
        ImageBuilder {
            path: path.as_ref().to_path_buf(),
            password: password.to_string(),
            blocks: DEFAULT_BLOCKS,
            block_size: DEFAULT_BLOCK_SIZE,
            cipher: CIPHER_AES256,
            sparse: false,
        }
    }

    /// Number of data-area blocks.
    pub fn blocks(mut self, blocks: u64) -> Self {
        self.blocks = blocks;
        self
    }

    /// Block size in bytes (trailer included).
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Skip zero-filling the data area; unwritten regions read as free.
    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    /// Build without a cipher (cipher id 0). The password hash is still
    /// stored and checked on open.
    pub fn plaintext(mut self) -> Self {
        self.cipher = CIPHER_NONE;
        self
    }

    pub fn build(self) -> Result<()> {
        if self.blocks == 0 {
            return Err(CloakError::Corrupt("image must have at least one block"));
        }
        if self.block_size <= BLOCK_META {
            return Err(CloakError::Corrupt("block size too small"));
        }

        let mut ivs = [0u64; 4];
        for iv in ivs.iter_mut() {
            *iv = rand::rngs::OsRng.next_u64();
        }

        // plaintext prefix: IVs, cipher header, block size, version
        let mut prefix = [0u8; 40];
        for (i, iv) in ivs.iter().enumerate() {
            prefix[i * 8..i * 8 + 8].copy_from_slice(&iv.to_le_bytes());
        }
        prefix[32] = DEFAULT_ROUNDS;
        prefix[33] = self.cipher;
        prefix[34..38].copy_from_slice(&self.block_size.to_le_bytes());
        prefix[38] = FORMAT_VERSION;
        prefix[39] = self.cipher;

        let mut raw = HostFileDevice::create(&self.path)?;
        raw.write_at(0, &prefix)?;

        let mut dev: Box<dyn BlockDevice> = match self.cipher {
            CIPHER_NONE => Box::new(raw),
            _ => Box::new(CipherDevice::new(
                raw,
                &CipherKey::derive(&self.password, &ivs),
            )),
        };

        let hash: [u8; 32] = Sha256::digest(self.password.as_bytes()).into();
        dev.write_at(PASS_HASH_OFFSET, &hash)?;
        dev.write_at(BLOCK_COUNT_OFFSET, &self.blocks.to_le_bytes())?;

        let layout = Layout::new(self.block_size, self.blocks);
        dev.write_at(BITMAP_OFFSET, &vec![0u8; layout.bitmap_len() as usize])?;
        dev.write_at(layout.file_count_offset(), &0u64.to_le_bytes())?;

        if !self.sparse {
            tracing::info!(blocks = self.blocks, "zero-filling data area");
            let zeros = vec![0u8; self.block_size as usize];
            for block in 0..self.blocks {
                dev.write_at(layout.block_offset(block), &zeros)?;
            }
        }

        // the root folder always occupies block 0 of a fresh image
        let vol = Volume::new(dev, layout);
        let root = ContentFolder::create(vol.clone())?;
        if root.start_block() != 0 {
            return Err(CloakError::Corrupt("root folder did not land on block 0"));
        }
        vol.sync()?;

        tracing::info!(
            path = %self.path.display(),
            blocks = self.blocks,
            block_size = self.block_size,
            "container image built"
        );
        Ok(())
    }
}

/// Open an existing image: parse the prefix, stand up the cipher, check
/// the password, and read the geometry.
pub fn open_volume<P: AsRef<Path>>(path: P, password: &str) -> Result<SharedVolume> {
    let mut raw = HostFileDevice::open(path)?;
    let mut superblock = Superblock::read_prefix(&mut raw)?;

    let mut dev: Box<dyn BlockDevice> = match superblock.cipher {
        CIPHER_NONE => Box::new(raw),
        CIPHER_AES256 => Box::new(CipherDevice::new(
            raw,
            &CipherKey::derive(password, &superblock.ivs),
        )),
        _ => return Err(CloakError::Corrupt("unsupported cipher id")),
    };

    Superblock::verify_password(dev.as_mut(), password)?;
    superblock.read_block_count(dev.as_mut())?;

    Ok(Volume::new(dev, superblock.layout()))
}
