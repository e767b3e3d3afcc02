//! A single physical block of the data area.
//!
//! Layout: a data region of `block_size - BLOCK_META` bytes followed by the
//! trailer (`bytes_written` u32 LE, `next_block_index` u64 LE). Blocks are
//! self-describing; there is no central index table. A block whose `next`
//! equals its own index is the end of its chain.

use crate::allocator::Allocator;
use crate::error::{CloakError, Result};
use crate::superblock::{SharedVolume, BLOCK_META};

pub struct FileBlock {
    vol: SharedVolume,
    index: u64,
    cursor: u32,
    bytes_written: u32,
    next: u64,
}

impl FileBlock {
    /// Open an existing block, reading its trailer.
    ///
    /// An uninitialized trailer (sparse image) reads as an empty block;
    /// for block 0 that is also a valid self-loop terminator.
    pub fn open(vol: SharedVolume, index: u64) -> Result<Self> {
        let layout = vol.layout();
        if index >= layout.blocks {
            return Err(CloakError::Corrupt("chain references block beyond data area"));
        }

        let mut trailer = [0u8; BLOCK_META as usize];
        vol.read_exact_or_zero(layout.block_offset(index) + layout.write_space() as u64, &mut trailer)?;

        let bytes_written = u32::from_le_bytes(trailer[0..4].try_into().unwrap());
        let next = u64::from_le_bytes(trailer[4..12].try_into().unwrap());
        if bytes_written > layout.write_space() {
            return Err(CloakError::Corrupt("block trailer reports impossible size"));
        }

        Ok(FileBlock {
            vol,
            index,
            cursor: 0,
            bytes_written,
            next,
        })
    }

    /// Build a brand-new writable block at `index`: persists an empty
    /// trailer with a self-loop terminator and registers the block with the
    /// occupancy bitmap.
    pub fn create(vol: SharedVolume, index: u64) -> Result<Self> {
        let block = FileBlock {
            vol: vol.clone(),
            index,
            cursor: 0,
            bytes_written: 0,
            next: index,
        };
        block.persist_trailer()?;
        Allocator::new(vol).mark_in_use(index)?;
        Ok(block)
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Cursor position within the data region.
    pub fn tell(&self) -> u32 {
        self.cursor
    }

    /// Bytes written to this block so far.
    pub fn size(&self) -> u32 {
        self.bytes_written
    }

    pub fn next_index(&self) -> u64 {
        self.next
    }

    /// Whether this block terminates its chain.
    pub fn is_end(&self) -> bool {
        self.next == self.index
    }

    /// Position the cursor within the data region.
    pub fn seek(&mut self, pos: u32) -> Result<()> {
        if pos > self.vol.layout().write_space() {
            return Err(CloakError::SeekOutOfRange);
        }
        self.cursor = pos;
        Ok(())
    }

    /// Read up to `buf.len()` bytes from the data region at the cursor.
    /// Clamped to the data region; callers clamp to `bytes_written`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let layout = self.vol.layout();
        let room = (layout.write_space() - self.cursor) as usize;
        let n = buf.len().min(room);
        self.vol
            .read_exact_or_zero(layout.block_offset(self.index) + self.cursor as u64, &mut buf[..n])?;
        self.cursor += n as u32;
        Ok(n)
    }

    /// Write `data` into the data region at the cursor and persist the
    /// trailer. `bytes_written` only grows: overwrites inside the existing
    /// payload leave it unchanged, writes past it extend it.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let layout = self.vol.layout();
        debug_assert!(self.cursor + data.len() as u32 <= layout.write_space());
        self.vol
            .write_at(layout.block_offset(self.index) + self.cursor as u64, data)?;
        self.cursor += data.len() as u32;
        if self.cursor > self.bytes_written {
            self.bytes_written = self.cursor;
        }
        self.persist_trailer()
    }

    /// Point this block's `next` at `index` and persist.
    pub fn set_next(&mut self, index: u64) -> Result<()> {
        self.next = index;
        self.persist_trailer()
    }

    /// Rewrite `bytes_written` (truncation) and persist.
    pub fn set_size(&mut self, bytes: u32) -> Result<()> {
        self.bytes_written = bytes;
        self.persist_trailer()
    }

    /// Clear this block's occupancy bit. Data and trailer are left intact;
    /// reuse overwrites them.
    pub fn unlink(&self) -> Result<()> {
        Allocator::new(self.vol.clone()).mark_free(self.index)
    }

    fn persist_trailer(&self) -> Result<()> {
        let layout = self.vol.layout();
        let mut trailer = [0u8; BLOCK_META as usize];
        trailer[0..4].copy_from_slice(&self.bytes_written.to_le_bytes());
        trailer[4..12].copy_from_slice(&self.next.to_le_bytes());
        self.vol
            .write_at(layout.block_offset(self.index) + layout.write_space() as u64, &trailer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostFileDevice;
    use crate::superblock::{Layout, Volume};
    use tempfile::NamedTempFile;

    fn test_volume() -> (NamedTempFile, SharedVolume) {
        let temp = NamedTempFile::new().unwrap();
        let dev = HostFileDevice::create(temp.path()).unwrap();
        let vol = Volume::new(Box::new(dev), Layout::new(128, 32));
        (temp, vol)
    }

    #[test]
    fn create_marks_block_and_self_loops() {
        let (_t, vol) = test_volume();
        let block = FileBlock::create(vol.clone(), 3).unwrap();
        assert!(block.is_end());
        assert_eq!(block.size(), 0);
        assert!(Allocator::new(vol).is_in_use(3).unwrap());
    }

    #[test]
    fn write_read_round_trip() {
        let (_t, vol) = test_volume();
        {
            let mut block = FileBlock::create(vol.clone(), 0).unwrap();
            block.write(b"hello block").unwrap();
            assert_eq!(block.size(), 11);
            assert_eq!(block.tell(), 11);
        }

        let mut block = FileBlock::open(vol, 0).unwrap();
        assert_eq!(block.size(), 11);
        let mut buf = [0u8; 11];
        block.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello block");
    }

    #[test]
    fn overwrite_inside_payload_keeps_size() {
        let (_t, vol) = test_volume();
        let mut block = FileBlock::create(vol, 1).unwrap();
        block.write(b"0123456789").unwrap();

        block.seek(2).unwrap();
        block.write(b"xx").unwrap();
        assert_eq!(block.size(), 10);

        block.seek(8).unwrap();
        block.write(b"abcd").unwrap();
        assert_eq!(block.size(), 12);
    }

    #[test]
    fn next_pointer_persists() {
        let (_t, vol) = test_volume();
        {
            let mut block = FileBlock::create(vol.clone(), 2).unwrap();
            block.set_next(7).unwrap();
        }
        let block = FileBlock::open(vol, 2).unwrap();
        assert_eq!(block.next_index(), 7);
        assert!(!block.is_end());
    }

    #[test]
    fn unlink_clears_bit_only() {
        let (_t, vol) = test_volume();
        {
            let mut block = FileBlock::create(vol.clone(), 4).unwrap();
            block.write(b"survives unlink").unwrap();
            block.unlink().unwrap();
        }

        assert!(!Allocator::new(vol.clone()).is_in_use(4).unwrap());
        // payload is still readable until the block is reused
        let mut block = FileBlock::open(vol, 4).unwrap();
        let mut buf = [0u8; 15];
        block.read(&mut buf).unwrap();
        assert_eq!(&buf, b"survives unlink");
    }

    #[test]
    fn open_rejects_out_of_range_index() {
        let (_t, vol) = test_volume();
        assert!(matches!(
            FileBlock::open(vol, 99),
            Err(CloakError::Corrupt(_))
        ));
    }
}
