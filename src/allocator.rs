//! Occupancy-bitmap block allocator.
//!
//! One bit per data-area block, stored in the superblock region: bit `i` of
//! byte `j` covers block `8j + i`. Reservation and marking are separate
//! steps: [`Allocator::reserve`] only *finds* clear bits; a bit is set when
//! the block is actually built and its trailer first persisted (see
//! [`crate::block::FileBlock`]). This lets a file hold a tentative "next"
//! block that is silently reusable if never written, at the cost of making
//! concurrent writers unsound, which the crate disallows.

use crate::error::{CloakError, Result};
use crate::superblock::{SharedVolume, BITMAP_OFFSET};

pub struct Allocator {
    vol: SharedVolume,
}

impl Allocator {
    pub fn new(vol: SharedVolume) -> Self {
        Allocator { vol }
    }

    /// Return the first `n` currently-clear bit positions in ascending
    /// order without setting them. Fails with `OutOfSpace` when fewer than
    /// `n` blocks are free.
    pub fn reserve(&self, n: usize) -> Result<Vec<u64>> {
        let layout = self.vol.layout();
        let mut bitmap = vec![0u8; layout.bitmap_len() as usize];
        // a short read means the tail of a sparse image: all free
        self.vol.read_exact_or_zero(BITMAP_OFFSET, &mut bitmap)?;

        let mut found = Vec::with_capacity(n);
        'scan: for (byte_index, byte) in bitmap.iter().enumerate() {
            if *byte == u8::MAX {
                continue;
            }
            for bit in 0..8 {
                let block = (byte_index * 8 + bit) as u64;
                if block >= layout.blocks {
                    break 'scan;
                }
                if byte & (1 << bit) == 0 {
                    found.push(block);
                    if found.len() == n {
                        break 'scan;
                    }
                }
            }
        }

        if found.len() < n {
            return Err(CloakError::OutOfSpace);
        }
        Ok(found)
    }

    /// Set the bit for `block`. Idempotent.
    pub fn mark_in_use(&self, block: u64) -> Result<()> {
        self.flip(block, true)
    }

    /// Clear the bit for `block`. Idempotent; clearing an already-free
    /// block is logged as a probable double-free.
    pub fn mark_free(&self, block: u64) -> Result<()> {
        self.flip(block, false)
    }

    pub fn is_in_use(&self, block: u64) -> Result<bool> {
        self.check_range(block)?;
        let mut byte = [0u8];
        self.vol
            .read_exact_or_zero(BITMAP_OFFSET + block / 8, &mut byte)?;
        Ok(byte[0] & (1 << (block % 8)) != 0)
    }

    /// Number of clear bits, for statfs.
    pub fn free_blocks(&self) -> Result<u64> {
        let layout = self.vol.layout();
        let mut bitmap = vec![0u8; layout.bitmap_len() as usize];
        self.vol.read_exact_or_zero(BITMAP_OFFSET, &mut bitmap)?;

        let mut free = 0;
        for block in 0..layout.blocks {
            if bitmap[(block / 8) as usize] & (1 << (block % 8)) == 0 {
                free += 1;
            }
        }
        Ok(free)
    }

    fn flip(&self, block: u64, set: bool) -> Result<()> {
        self.check_range(block)?;
        let offset = BITMAP_OFFSET + block / 8;
        let mask = 1u8 << (block % 8);

        let mut byte = [0u8];
        self.vol.read_exact_or_zero(offset, &mut byte)?;

        if !set && byte[0] & mask == 0 {
            tracing::warn!(block, "freeing a block that is already free");
            return Ok(());
        }

        if set {
            byte[0] |= mask;
        } else {
            byte[0] &= !mask;
        }
        self.vol.write_at(offset, &byte)
    }

    fn check_range(&self, block: u64) -> Result<()> {
        if block >= self.vol.layout().blocks {
            return Err(CloakError::Corrupt("block index beyond data area"));
        }
        Ok(())
    }
}
