//! Directories encoded in file bodies.
//!
//! A folder's body is an 8-byte entry count followed by fixed-width slot
//! records. The count only ever grows; removing an entry tombstones its
//! slot (clears the in-use flag bit) and a later add may reclaim it. Entry
//! payloads are reached through the slot's first-block index, never copied.
//!
//! Slot record, `SLOT_WIDTH` = 1 + `MAX_NAME` + 8 bytes:
//!
//! ```text
//! byte 0        flags: bit 0 = in use, bit 1 = file (1) / subfolder (0)
//! bytes 1..256  name, NUL-terminated, remainder undefined
//! bytes 256..   first block index of the entry, u64 LE
//! ```

use crate::error::{CloakError, Result};
use crate::file::{File, OpenMode};
use crate::superblock::SharedVolume;
use std::collections::HashMap;
use std::io::SeekFrom;

/// Longest storable name field; usable names keep one byte for the NUL.
pub const MAX_NAME: usize = 255;

const SLOT_WIDTH: u64 = 1 + MAX_NAME as u64 + 8;
const HEADER_LEN: u64 = 8;

const FLAG_IN_USE: u8 = 1 << 0;
const FLAG_FILE: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
}

/// What a directory knows about one live entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub name: String,
    pub size: u64,
    pub kind: EntryKind,
    pub first_block: u64,
}

/// Cached slot facts; sizes are recomputed from the chain on demand so the
/// cache can never go stale through a file handle writing behind it.
#[derive(Debug, Clone, Copy)]
struct CachedSlot {
    kind: EntryKind,
    first_block: u64,
    slot: u64,
}

pub struct ContentFolder {
    vol: SharedVolume,
    start_block: u64,
    entry_count: u64,
    dead_count: u64,
    cache: HashMap<String, CachedSlot>,
    /// Cleared once a full scan finds no tombstone, so repeated adds skip
    /// the scan; set again whenever a removal creates one.
    check_early_slots: bool,
}

impl ContentFolder {
    /// Create an empty folder: a one-block file holding a zeroed count.
    pub fn create(vol: SharedVolume) -> Result<Self> {
        let mut data = File::create(vol.clone());
        data.write(&0u64.to_le_bytes())?;
        data.flush()?;
        let start_block = data.start_block()?;

        Ok(ContentFolder {
            vol,
            start_block,
            entry_count: 0,
            dead_count: 0,
            cache: HashMap::new(),
            check_early_slots: true,
        })
    }

    /// Open the folder rooted at `start_block`, reading the entry count
    /// and tallying tombstones.
    pub fn open(vol: SharedVolume, start_block: u64) -> Result<Self> {
        let mut reader = File::open(vol.clone(), start_block, OpenMode::read_only())?;
        let mut head = [0u8; 8];
        let n = reader.read(&mut head)?;
        // an unwritten body (sparse image) holds no entries
        let entry_count = if n == 8 { u64::from_le_bytes(head) } else { 0 };

        if n == 8 && entry_count > reader.size().saturating_sub(HEADER_LEN) / SLOT_WIDTH {
            return Err(CloakError::Corrupt("folder entry count disagrees with body"));
        }

        let mut folder = ContentFolder {
            vol,
            start_block,
            entry_count,
            dead_count: 0,
            cache: HashMap::new(),
            check_early_slots: true,
        };

        for slot in 0..entry_count {
            let record = folder.read_slot(&mut reader, slot)?;
            if record[0] & FLAG_IN_USE == 0 {
                folder.dead_count += 1;
            }
        }
        Ok(folder)
    }

    pub fn start_block(&self) -> u64 {
        self.start_block
    }

    /// Total slots ever allocated, tombstones included.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Live entries only.
    pub fn live_count(&self) -> u64 {
        self.entry_count - self.dead_count
    }

    /// Create an empty file entry named `name`; returns its start block.
    pub fn add_file(&mut self, name: &str) -> Result<u64> {
        validate_name(name)?;
        if self.lookup(name)?.is_some() {
            return Err(CloakError::AlreadyExists(name.to_string()));
        }

        let mut entry = File::create(self.vol.clone());
        let first_block = entry.start_block()?;
        self.write_slot(name, EntryKind::File, first_block)?;
        Ok(first_block)
    }

    /// Create an empty subfolder named `name`; returns its start block.
    pub fn add_folder(&mut self, name: &str) -> Result<u64> {
        validate_name(name)?;
        if self.lookup(name)?.is_some() {
            return Err(CloakError::AlreadyExists(name.to_string()));
        }

        let entry = ContentFolder::create(self.vol.clone())?;
        self.write_slot(name, EntryKind::Folder, entry.start_block)?;
        Ok(entry.start_block)
    }

    /// Open the file entry `name` in the given mode.
    pub fn file(&mut self, name: &str, mode: OpenMode) -> Result<File> {
        match self.lookup(name)? {
            Some(slot) if slot.kind == EntryKind::File => {
                File::open(self.vol.clone(), slot.first_block, mode)
            }
            _ => Err(CloakError::NotFound(name.to_string())),
        }
    }

    /// Open the subfolder entry `name`.
    pub fn folder(&mut self, name: &str) -> Result<ContentFolder> {
        match self.lookup(name)? {
            Some(slot) if slot.kind == EntryKind::Folder => {
                ContentFolder::open(self.vol.clone(), slot.first_block)
            }
            _ => Err(CloakError::NotFound(name.to_string())),
        }
    }

    /// Info for one live entry, or `None`. File sizes come from walking
    /// the entry's chain.
    pub fn entry_info(&mut self, name: &str) -> Result<Option<EntryInfo>> {
        let Some(slot) = self.lookup(name)? else {
            return Ok(None);
        };
        Ok(Some(self.build_info(name, slot)?))
    }

    /// Every live entry in slot order.
    pub fn entries(&mut self) -> Result<Vec<EntryInfo>> {
        let mut reader = self.reader()?;
        let mut out = Vec::new();
        for slot in 0..self.entry_count {
            let record = self.read_slot(&mut reader, slot)?;
            if record[0] & FLAG_IN_USE == 0 {
                continue;
            }
            let (name, cached) = parse_record(&record, slot)?;
            self.cache.insert(name.clone(), cached);
            out.push(self.build_info(&name, cached)?);
        }
        Ok(out)
    }

    /// Unlink the named file's chain and tombstone its slot.
    pub fn remove_file(&mut self, name: &str) -> Result<()> {
        let slot = match self.lookup(name)? {
            Some(slot) if slot.kind == EntryKind::File => slot,
            _ => return Err(CloakError::NotFound(name.to_string())),
        };

        let mut entry = File::open(self.vol.clone(), slot.first_block, OpenMode::append())?;
        entry.unlink()?;
        self.tombstone_slot(slot.slot)?;
        self.forget(name);
        Ok(())
    }

    /// Remove the named subfolder and everything below it. Children are
    /// snapshotted before removal so the walk is immune to the slot
    /// mutations it causes. No rollback: a failure partway leaves the
    /// already-removed children gone.
    pub fn remove_folder(&mut self, name: &str) -> Result<()> {
        let slot = match self.lookup(name)? {
            Some(slot) if slot.kind == EntryKind::Folder => slot,
            _ => return Err(CloakError::NotFound(name.to_string())),
        };

        let mut sub = ContentFolder::open(self.vol.clone(), slot.first_block)?;
        for child in sub.entries()? {
            match child.kind {
                EntryKind::File => sub.remove_file(&child.name)?,
                EntryKind::Folder => sub.remove_folder(&child.name)?,
            }
        }

        let mut body = File::open(self.vol.clone(), slot.first_block, OpenMode::append())?;
        body.unlink()?;
        self.tombstone_slot(slot.slot)?;
        self.forget(name);
        Ok(())
    }

    /// Rewrite an entry's name in place (the flags byte and block index
    /// are untouched).
    pub fn rename_entry(&mut self, src: &str, dst: &str) -> Result<()> {
        validate_name(dst)?;
        if self.lookup(dst)?.is_some() {
            return Err(CloakError::AlreadyExists(dst.to_string()));
        }
        let slot = self
            .lookup(src)?
            .ok_or_else(|| CloakError::NotFound(src.to_string()))?;

        let mut writer = self.writer()?;
        writer.seek(SeekFrom::Start(HEADER_LEN + slot.slot * SLOT_WIDTH + 1))?;
        writer.write(&name_field(dst))?;
        writer.flush()?;
        self.cache.remove(src);
        Ok(())
    }

    /// Tombstone a slot without touching the entry's data. The other half
    /// of a cross-folder move; pairs with [`ContentFolder::graft`].
    pub fn detach(&mut self, name: &str) -> Result<()> {
        let slot = self
            .lookup(name)?
            .ok_or_else(|| CloakError::NotFound(name.to_string()))?;
        self.tombstone_slot(slot.slot)?;
        self.forget(name);
        Ok(())
    }

    /// Write a slot for an entry whose data already exists elsewhere.
    pub fn graft(&mut self, name: &str, kind: EntryKind, first_block: u64) -> Result<()> {
        validate_name(name)?;
        if self.lookup(name)?.is_some() {
            return Err(CloakError::AlreadyExists(name.to_string()));
        }
        self.write_slot(name, kind, first_block)
    }

    // -- slot plumbing ------------------------------------------------------

    fn reader(&self) -> Result<File> {
        File::open(self.vol.clone(), self.start_block, OpenMode::read_only())
    }

    fn writer(&self) -> Result<File> {
        File::open(self.vol.clone(), self.start_block, OpenMode::overwrite())
    }

    fn read_slot(&self, reader: &mut File, slot: u64) -> Result<Vec<u8>> {
        reader.seek(SeekFrom::Start(HEADER_LEN + slot * SLOT_WIDTH))?;
        let mut record = vec![0u8; SLOT_WIDTH as usize];
        let n = reader.read(&mut record)?;
        if n < record.len() {
            return Err(CloakError::Corrupt("folder body truncated"));
        }
        Ok(record)
    }

    fn lookup(&mut self, name: &str) -> Result<Option<CachedSlot>> {
        if let Some(slot) = self.cache.get(name) {
            return Ok(Some(*slot));
        }

        let mut reader = self.reader()?;
        for slot in 0..self.entry_count {
            let record = self.read_slot(&mut reader, slot)?;
            if record[0] & FLAG_IN_USE == 0 {
                continue;
            }
            let (slot_name, cached) = parse_record(&record, slot)?;
            self.cache.insert(slot_name.clone(), cached);
            if slot_name == name {
                return Ok(Some(cached));
            }
        }
        Ok(None)
    }

    fn build_info(&self, name: &str, slot: CachedSlot) -> Result<EntryInfo> {
        let size = match slot.kind {
            EntryKind::File => {
                File::open(self.vol.clone(), slot.first_block, OpenMode::read_only())?.size()
            }
            EntryKind::Folder => 0,
        };
        Ok(EntryInfo {
            name: name.to_string(),
            size,
            kind: slot.kind,
            first_block: slot.first_block,
        })
    }

    /// First tombstoned slot, if any. Skipped entirely once a full scan
    /// has come up empty.
    fn find_tombstone(&mut self) -> Result<Option<u64>> {
        if !self.check_early_slots {
            return Ok(None);
        }
        let mut reader = self.reader()?;
        for slot in 0..self.entry_count {
            let record = self.read_slot(&mut reader, slot)?;
            if record[0] & FLAG_IN_USE == 0 {
                return Ok(Some(slot));
            }
        }
        self.check_early_slots = false;
        Ok(None)
    }

    fn write_slot(&mut self, name: &str, kind: EntryKind, first_block: u64) -> Result<()> {
        let mut record = vec![0u8; SLOT_WIDTH as usize];
        record[0] = FLAG_IN_USE
            | match kind {
                EntryKind::File => FLAG_FILE,
                EntryKind::Folder => 0,
            };
        record[1..1 + MAX_NAME].copy_from_slice(&name_field(name));
        record[1 + MAX_NAME..].copy_from_slice(&first_block.to_le_bytes());

        match self.find_tombstone()? {
            Some(slot) => {
                let mut writer = self.writer()?;
                writer.seek(SeekFrom::Start(HEADER_LEN + slot * SLOT_WIDTH))?;
                writer.write(&record)?;
                writer.flush()?;
                self.dead_count -= 1;
            }
            None => {
                let mut writer =
                    File::open(self.vol.clone(), self.start_block, OpenMode::append())?;
                writer.write(&record)?;
                writer.flush()?;
                self.entry_count += 1;
                self.persist_entry_count()?;
            }
        }

        // the next lookup scan caches the slot with its real index
        Ok(())
    }

    fn persist_entry_count(&self) -> Result<()> {
        let mut writer = self.writer()?;
        writer.seek(SeekFrom::Start(0))?;
        writer.write(&self.entry_count.to_le_bytes())?;
        writer.flush()
    }

    fn tombstone_slot(&self, slot: u64) -> Result<()> {
        let mut writer = self.writer()?;
        writer.seek(SeekFrom::Start(HEADER_LEN + slot * SLOT_WIDTH))?;
        writer.write(&[0u8])?;
        writer.flush()
    }

    fn forget(&mut self, name: &str) {
        self.cache.remove(name);
        self.dead_count += 1;
        self.check_early_slots = true;
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() >= MAX_NAME
        || name.contains('/')
        || name.as_bytes().contains(&0)
    {
        return Err(CloakError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// The fixed-width, NUL-terminated name field of a slot.
fn name_field(name: &str) -> [u8; MAX_NAME] {
    let mut field = [0u8; MAX_NAME];
    field[..name.len()].copy_from_slice(name.as_bytes());
    field
}

fn parse_record(record: &[u8], slot: u64) -> Result<(String, CachedSlot)> {
    let name_bytes = &record[1..1 + MAX_NAME];
    let end = name_bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(CloakError::Corrupt("unterminated entry name"))?;
    let name = std::str::from_utf8(&name_bytes[..end])
        .map_err(|_| CloakError::Corrupt("entry name is not UTF-8"))?
        .to_string();

    let kind = if record[0] & FLAG_FILE != 0 {
        EntryKind::File
    } else {
        EntryKind::Folder
    };
    let first_block = u64::from_le_bytes(record[1 + MAX_NAME..].try_into().unwrap());

    Ok((
        name,
        CachedSlot {
            kind,
            first_block,
            slot,
        },
    ))
}
