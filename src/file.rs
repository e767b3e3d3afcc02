//! Random-access byte streams over linked block chains.
//!
//! A [`File`] is a singly-linked list of [`FileBlock`]s terminated by a
//! self-loop. The logical size is the sum of `bytes_written` across the
//! chain; there is no per-file index structure, so opening an existing file
//! walks the chain once to count blocks and sum sizes.

use crate::allocator::Allocator;
use crate::block::FileBlock;
use crate::error::{CloakError, Result};
use crate::superblock::SharedVolume;
use std::io::SeekFrom;

/// Read/write capability of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Where writes land: appended to the end or over existing bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Append,
    Overwrite,
}

/// Whether opening drops the existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncation {
    Keep,
    Truncate,
}

/// Open mode: access x placement x truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub access: Access,
    pub placement: Placement,
    pub truncation: Truncation,
}

impl OpenMode {
    pub fn new(access: Access, placement: Placement, truncation: Truncation) -> Self {
        OpenMode {
            access,
            placement,
            truncation,
        }
    }

    /// Read-write, cursor at the end, size grows with every write.
    pub fn append() -> Self {
        Self::new(Access::ReadWrite, Placement::Append, Truncation::Keep)
    }

    /// Read-write, cursor at the start, writes land over existing bytes.
    pub fn overwrite() -> Self {
        Self::new(Access::ReadWrite, Placement::Overwrite, Truncation::Keep)
    }

    pub fn read_only() -> Self {
        Self::new(Access::ReadOnly, Placement::Append, Truncation::Keep)
    }

    pub fn write_only() -> Self {
        Self::new(Access::WriteOnly, Placement::Append, Truncation::Keep)
    }

    /// Read-write, existing content dropped on open.
    pub fn truncate() -> Self {
        Self::new(Access::ReadWrite, Placement::Append, Truncation::Truncate)
    }
}

pub struct File {
    vol: SharedVolume,
    mode: OpenMode,
    start_block: Option<u64>,
    size: u64,
    pos: u64,
    /// Index of the working block within the chain (not its volume index).
    block_index: u64,
    block_count: u64,
    working: Option<FileBlock>,
}

impl File {
    /// A brand-new file. No block is allocated until the first write (or
    /// until [`File::start_block`] forces one).
    pub fn create(vol: SharedVolume) -> Self {
        File {
            vol,
            mode: OpenMode::append(),
            start_block: None,
            size: 0,
            pos: 0,
            block_index: 0,
            block_count: 0,
            working: None,
        }
    }

    /// Open the chain rooted at `start_block`.
    ///
    /// Walks the chain to establish size and block count, then positions
    /// the cursor: at the end for append mode, at byte 0 otherwise. The
    /// truncate flag drops all content but keeps the head block at its
    /// original index so directory slots stay valid.
    pub fn open(vol: SharedVolume, start_block: u64, mode: OpenMode) -> Result<Self> {
        let mut file = File {
            vol: vol.clone(),
            mode,
            start_block: Some(start_block),
            size: 0,
            pos: 0,
            block_index: 0,
            block_count: 0,
            working: None,
        };
        file.enumerate_chain()?;
        file.working = Some(FileBlock::open(vol, start_block)?);

        if mode.access != Access::ReadOnly {
            if mode.truncation == Truncation::Truncate {
                file.drop_content()?;
            } else if mode.placement == Placement::Append {
                file.seek(SeekFrom::End(0))?;
            }
        }
        Ok(file)
    }

    pub fn open_mode(&self) -> OpenMode {
        self.mode
    }

    /// Logical size in bytes, as tracked by this handle. Reopening a file
    /// recomputes the authoritative value from the chain.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current logical byte position.
    pub fn tell(&self) -> u64 {
        self.pos
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Volume index of the first block, creating it if the file has none
    /// yet (a created file defers its first allocation to this point or to
    /// the first write, whichever comes first).
    pub fn start_block(&mut self) -> Result<u64> {
        if self.start_block.is_none() {
            self.ensure_working_block()?;
        }
        Ok(self.start_block.expect("working block sets start"))
    }

    /// Read up to `buf.len()` bytes at the cursor, advancing along the
    /// chain. Returns the number of bytes read; 0 means end of chain.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.mode.access == Access::WriteOnly {
            return Err(CloakError::NotReadable);
        }

        let mut read = 0;
        while read < buf.len() {
            let before = self.block_index;
            let n = self.read_working_bytes(&mut buf[read..])?;
            read += n;
            // a zero-byte step that did not advance the chain is the end
            if n == 0 && self.block_index == before {
                break;
            }
        }
        self.pos += read as u64;
        Ok(read)
    }

    /// Write all of `data` at the cursor, growing the chain as needed.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.mode.access == Access::ReadOnly {
            return Err(CloakError::NotWritable);
        }

        let write_space = self.vol.layout().write_space();
        let mut wrote = 0;
        while wrote < data.len() {
            self.ensure_working_block()?;
            let working = self.working.as_mut().expect("ensured above");

            let room = (write_space - working.tell()) as usize;
            let chunk = (data.len() - wrote).min(room);
            working.write(&data[wrote..wrote + chunk])?;

            wrote += chunk;
            self.pos += chunk as u64;
            if self.mode.placement == Placement::Append {
                self.size += chunk as u64;
            }
        }
        Ok(wrote)
    }

    /// Move the cursor. Returns the new logical position; positions outside
    /// the chain fail with `SeekOutOfRange`.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let space = self.vol.layout().write_space() as i64;

        let (target_block, block_pos, new_pos) = match pos {
            SeekFrom::Start(off) => {
                if off > i64::MAX as u64 {
                    return Err(CloakError::SeekOutOfRange);
                }
                let off = off as i64;
                let (block, block_pos) = position_from_start(off, space);
                (block, block_pos, off)
            }
            SeekFrom::End(off) => {
                if off > 0 || self.block_count == 0 {
                    return Err(CloakError::SeekOutOfRange);
                }
                let last_bytes = self.block_at(self.block_count - 1)?.size() as i64;
                let (back_block, back_pos) = position_from_start(-off, space);
                let mut block = (self.block_count - 1) as i64 - back_block;
                let mut block_pos = last_bytes - back_pos;
                if block_pos < 0 {
                    block_pos += space;
                    block -= 1;
                }
                (block, block_pos, self.size as i64 + off)
            }
            SeekFrom::Current(off) => {
                let in_block = self.working.as_ref().map(|w| w.tell()).unwrap_or(0) as i64;
                let addition = off + in_block;
                let left_over = addition.abs() % space;
                let hops = (addition.abs() - left_over) / space;
                if addition >= 0 {
                    (
                        self.block_index as i64 + hops,
                        left_over,
                        self.pos as i64 + off,
                    )
                } else {
                    (
                        self.block_index as i64 - (hops + 1),
                        space - left_over,
                        self.pos as i64 + off,
                    )
                }
            }
        };

        if target_block < 0 || target_block as u64 >= self.block_count || new_pos < 0 {
            return Err(CloakError::SeekOutOfRange);
        }

        let mut block = self.block_at(target_block as u64)?;
        block.seek(block_pos as u32)?;
        self.block_index = target_block as u64;
        self.working = Some(block);
        self.pos = new_pos as u64;
        Ok(self.pos)
    }

    /// Chop the file at `new_size`. Orphaned trailing blocks are returned
    /// to the allocator; growing a file this way is not supported (a
    /// `new_size` at or past the current size is a no-op).
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        if new_size >= self.size {
            return Ok(());
        }

        let space = self.vol.layout().write_space() as u64;
        let whole = new_size / space;
        let left_over = new_size % space;
        let (last_index, last_bytes) = if left_over == 0 && new_size >= space {
            (whole - 1, space)
        } else {
            (whole, left_over)
        };
        let new_count = if new_size == 0 {
            1
        } else {
            whole + u64::from(left_over != 0)
        };

        let mut last = self.block_at(last_index)?;

        // free the tail the chain no longer reaches
        if !last.is_end() {
            let mut index = last.next_index();
            let mut hops = 0u64;
            loop {
                let block = FileBlock::open(self.vol.clone(), index)?;
                block.unlink()?;
                hops += 1;
                if hops > self.vol.layout().blocks {
                    return Err(CloakError::Corrupt("cycle in block chain"));
                }
                if block.is_end() {
                    break;
                }
                index = block.next_index();
            }
        }

        last.set_size(last_bytes as u32)?;
        let terminator = last.index();
        last.set_next(terminator)?;

        self.block_count = new_count;
        self.size = new_size;
        let resume = self.pos.min(new_size);
        self.seek(SeekFrom::Start(resume))?;
        Ok(())
    }

    /// Walk the whole chain returning every block to the allocator, then
    /// reset to an empty, block-less file.
    pub fn unlink(&mut self) -> Result<()> {
        if let Some(start) = self.start_block {
            let mut index = start;
            let mut hops = 0u64;
            loop {
                let block = FileBlock::open(self.vol.clone(), index)?;
                block.unlink()?;
                hops += 1;
                if hops > self.vol.layout().blocks {
                    return Err(CloakError::Corrupt("cycle in block chain"));
                }
                if block.is_end() {
                    break;
                }
                index = block.next_index();
            }
        }

        self.size = 0;
        self.pos = 0;
        self.block_count = 0;
        self.block_index = 0;
        self.working = None;
        self.start_block = None;
        Ok(())
    }

    /// Durability point for callers. Writes are write-through (data and
    /// trailers persist as they happen), so this only exists to pair with
    /// a device-level sync in the layer above.
    pub fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// The blocks of this file's chain, in order. Used by invariant checks
    /// and the folder layer.
    pub fn chain_blocks(&self) -> Result<Vec<u64>> {
        let mut blocks = Vec::new();
        let Some(start) = self.start_block else {
            return Ok(blocks);
        };
        let mut index = start;
        loop {
            let block = FileBlock::open(self.vol.clone(), index)?;
            blocks.push(index);
            if blocks.len() as u64 > self.vol.layout().blocks {
                return Err(CloakError::Corrupt("cycle in block chain"));
            }
            if block.is_end() {
                break;
            }
            index = block.next_index();
        }
        Ok(blocks)
    }

    // -- chain maintenance --------------------------------------------------

    fn enumerate_chain(&mut self) -> Result<()> {
        let Some(start) = self.start_block else {
            return Ok(());
        };
        let mut index = start;
        loop {
            let block = FileBlock::open(self.vol.clone(), index)?;
            self.size += block.size() as u64;
            self.block_count += 1;
            if self.block_count > self.vol.layout().blocks {
                return Err(CloakError::Corrupt("cycle in block chain"));
            }
            if block.is_end() {
                break;
            }
            index = block.next_index();
        }
        Ok(())
    }

    fn read_working_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(working) = self.working.as_mut() else {
            return Ok(0);
        };

        let available = working.size().saturating_sub(working.tell()) as usize;
        let want = buf.len().min(available);
        let n = working.read(&mut buf[..want])?;

        // block exhausted with more chain to go: step into the next block
        if self.block_index + 1 < self.block_count && n == available {
            let next = working.next_index();
            self.block_index += 1;
            self.working = Some(FileBlock::open(self.vol.clone(), next)?);
        }
        Ok(n)
    }

    /// Make sure the working block can accept at least one byte.
    fn ensure_working_block(&mut self) -> Result<()> {
        if self.working.is_none() {
            self.push_tail_block()?;
            self.start_block = Some(self.working.as_ref().expect("just pushed").index());
            return Ok(());
        }

        let write_space = self.vol.layout().write_space();
        if self.working.as_ref().expect("checked above").tell() < write_space {
            return Ok(());
        }

        // the working block is exhausted; an overwrite that ran past the
        // end of the file continues as an append
        if self.pos >= self.size {
            self.mode.placement = Placement::Append;
        }

        if self.mode.placement == Placement::Overwrite && self.block_index + 1 < self.block_count {
            let next = self.working.as_ref().expect("checked above").next_index();
            self.block_index += 1;
            self.working = Some(FileBlock::open(self.vol.clone(), next)?);
            return Ok(());
        }

        self.push_tail_block()
    }

    /// Allocate and link a fresh block at the tail of the chain.
    fn push_tail_block(&mut self) -> Result<()> {
        // a speculative pair: the first index becomes the block, the second
        // stays unmarked and is simply the likeliest candidate for the next
        // growth step
        let reserved = Allocator::new(self.vol.clone()).reserve(2)?;
        let block = FileBlock::create(self.vol.clone(), reserved[0])?;

        if let Some(prev) = self.working.as_mut() {
            prev.set_next(block.index())?;
        }

        self.block_count += 1;
        self.block_index = self.block_count - 1;
        tracing::debug!(
            block = block.index(),
            chain_len = self.block_count,
            "chain grew"
        );
        self.working = Some(block);
        Ok(())
    }

    /// Truncate-on-open: unlink everything, then rebuild the head block at
    /// its original index so directory slots keep pointing at this file.
    fn drop_content(&mut self) -> Result<()> {
        let head = self.start_block.expect("open sets the start block");
        self.unlink()?;
        let block = FileBlock::create(self.vol.clone(), head)?;
        self.start_block = Some(head);
        self.working = Some(block);
        self.block_count = 1;
        self.block_index = 0;
        Ok(())
    }

    /// The `n`-th block of the chain (0-based), by walking from the start.
    fn block_at(&self, n: u64) -> Result<FileBlock> {
        let start = self
            .start_block
            .ok_or(CloakError::Corrupt("file has no blocks"))?;
        let mut block = FileBlock::open(self.vol.clone(), start)?;
        for _ in 0..n {
            if block.is_end() {
                return Err(CloakError::Corrupt("chain shorter than expected"));
            }
            block = FileBlock::open(self.vol.clone(), block.next_index())?;
        }
        Ok(block)
    }
}

/// Map a from-the-start offset to (chain block, in-block position).
///
/// Offsets inside the first block stay there, including the exact end of
/// it; a later offset landing exactly on a block boundary maps to the end
/// of the previous block rather than the start of the next.
fn position_from_start(off: i64, space: i64) -> (i64, i64) {
    if off <= space {
        return (0, off);
    }
    let left_over = off % space;
    if left_over == 0 {
        (off / space - 1, space)
    } else {
        (off / space, left_over)
    }
}
