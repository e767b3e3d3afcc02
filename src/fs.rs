//! Path-based facade over the folder tree.
//!
//! `CoreFS` resolves `/`-separated paths against the root folder (always
//! block 0), hands out [`File`] handles, and keeps a path → start-block
//! cache so deep trees are not re-walked on every call. The cache is
//! purged by path prefix whenever a folder disappears or moves.
//!
//! The core assumes single-threaded cooperative use; an enclosing mount
//! shim is expected to serialize mutations with its own lock around the
//! whole `CoreFS`.

use crate::allocator::Allocator;
use crate::container::open_volume;
use crate::error::{CloakError, Result};
use crate::file::{File, OpenMode};
use crate::folder::{ContentFolder, EntryInfo, EntryKind};
use crate::superblock::SharedVolume;
use std::collections::HashMap;
use std::path::Path;

/// The root folder of every image lives at block 0 of the data area.
const ROOT_BLOCK: u64 = 0;

/// Filesystem-wide statistics, for `df`-style reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
}

pub struct CoreFS {
    vol: SharedVolume,
    folder_cache: HashMap<String, u64>,
}

impl CoreFS {
    /// Open the container at `path`, verifying `password`.
    pub fn open<P: AsRef<Path>>(path: P, password: &str) -> Result<Self> {
        Ok(Self::from_volume(open_volume(path, password)?))
    }

    /// Wrap an already-open volume.
    pub fn from_volume(vol: SharedVolume) -> Self {
        CoreFS {
            vol,
            folder_cache: HashMap::new(),
        }
    }

    /// Open the file at `path` in the given mode.
    pub fn open_file(&mut self, path: &str, mode: OpenMode) -> Result<File> {
        let (parent, leaf) = split_path(path)?;
        self.resolve_folder(&parent)?.file(&leaf, mode)
    }

    /// Create an empty file at `path`.
    pub fn make_file(&mut self, path: &str) -> Result<()> {
        let (parent, leaf) = split_path(path)?;
        self.resolve_folder(&parent)?.add_file(&leaf)?;
        Ok(())
    }

    /// Create an empty folder at `path`.
    pub fn make_folder(&mut self, path: &str) -> Result<()> {
        let (parent, leaf) = split_path(path)?;
        self.resolve_folder(&parent)?.add_folder(&leaf)?;
        Ok(())
    }

    /// Remove the file at `path`, returning its blocks to the allocator.
    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        let (parent, leaf) = split_path(path)?;
        self.resolve_folder(&parent)?.remove_file(&leaf)
    }

    /// Remove the folder at `path`. Without `recursive`, a folder with
    /// live entries fails with `NotEmpty`.
    pub fn remove_folder(&mut self, path: &str, recursive: bool) -> Result<()> {
        let (parent, leaf) = split_path(path)?;
        let mut parent_folder = self.resolve_folder(&parent)?;

        if !recursive {
            let target = parent_folder.folder(&leaf)?;
            if target.live_count() > 0 {
                return Err(CloakError::NotEmpty(normalize(path)));
            }
        }
        parent_folder.remove_folder(&leaf)?;
        self.purge_cached_subtree(&normalize(path));
        Ok(())
    }

    /// Rename or move an entry. A move re-points directory slots; the
    /// entry's chain is never copied.
    pub fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        let (src_parent, src_leaf) = split_path(src)?;
        let (dst_parent, dst_leaf) = split_path(dst)?;
        let src_norm = normalize(src);
        let dst_norm = normalize(dst);

        if dst_norm.starts_with(&format!("{src_norm}/")) {
            return Err(CloakError::InvalidName(dst_norm));
        }

        if src_parent == dst_parent {
            self.resolve_folder(&src_parent)?
                .rename_entry(&src_leaf, &dst_leaf)?;
        } else {
            let mut dst_folder = self.resolve_folder(&dst_parent)?;
            let mut src_folder = self.resolve_folder(&src_parent)?;
            let info = src_folder
                .entry_info(&src_leaf)?
                .ok_or(CloakError::NotFound(src_norm.clone()))?;

            // graft first so an existing destination leaves the source intact
            dst_folder.graft(&dst_leaf, info.kind, info.first_block)?;
            src_folder.detach(&src_leaf)?;
        }

        self.purge_cached_subtree(&src_norm);
        Ok(())
    }

    /// Metadata for the entry at `path`.
    pub fn stat(&mut self, path: &str) -> Result<EntryInfo> {
        let segments = segments(path);
        if segments.is_empty() {
            return Ok(EntryInfo {
                name: "/".to_string(),
                size: 0,
                kind: EntryKind::Folder,
                first_block: ROOT_BLOCK,
            });
        }
        let (parent, leaf) = split_path(path)?;
        self.resolve_folder(&parent)?
            .entry_info(&leaf)?
            .ok_or(CloakError::NotFound(normalize(path)))
    }

    /// Live entries of the folder at `path`.
    pub fn list_folder(&mut self, path: &str) -> Result<Vec<EntryInfo>> {
        let segs = segments(path);
        self.resolve_folder(&segs)?.entries()
    }

    pub fn file_exists(&mut self, path: &str) -> Result<bool> {
        self.exists_as(path, EntryKind::File)
    }

    pub fn folder_exists(&mut self, path: &str) -> Result<bool> {
        if segments(path).is_empty() {
            return Ok(true);
        }
        self.exists_as(path, EntryKind::Folder)
    }

    /// Chop the file at `path` to `size` bytes.
    pub fn truncate_file(&mut self, path: &str, size: u64) -> Result<()> {
        let mut file = self.open_file(path, OpenMode::overwrite())?;
        file.truncate(size)?;
        file.flush()
    }

    /// Filesystem statistics; the free count is read straight off the
    /// occupancy bitmap.
    pub fn statfs(&self) -> Result<StatFs> {
        let layout = self.vol.layout();
        Ok(StatFs {
            block_size: layout.block_size,
            total_blocks: layout.blocks,
            free_blocks: Allocator::new(self.vol.clone()).free_blocks()?,
        })
    }

    /// Flush host-file buffers to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.vol.sync()
    }

    fn exists_as(&mut self, path: &str, kind: EntryKind) -> Result<bool> {
        let (parent, leaf) = match split_path(path) {
            Ok(parts) => parts,
            Err(_) => return Ok(false),
        };
        let mut folder = match self.resolve_folder(&parent) {
            Ok(folder) => folder,
            Err(CloakError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(folder.entry_info(&leaf)?.is_some_and(|i| i.kind == kind))
    }

    /// Walk to the folder at `segments`, preferring the path cache and
    /// filling it for every level visited.
    fn resolve_folder(&mut self, segments: &[String]) -> Result<ContentFolder> {
        let key = join(segments);
        if let Some(&start) = self.folder_cache.get(&key) {
            return ContentFolder::open(self.vol.clone(), start);
        }

        let mut folder = ContentFolder::open(self.vol.clone(), ROOT_BLOCK)?;
        for depth in 0..segments.len() {
            folder = folder.folder(&segments[depth])?;
            self.folder_cache
                .insert(join(&segments[..=depth]), folder.start_block());
        }
        Ok(folder)
    }

    /// Drop a removed or moved folder and all its descendants from the
    /// path cache.
    fn purge_cached_subtree(&mut self, path: &str) {
        let prefix = format!("{path}/");
        self.folder_cache
            .retain(|cached, _| cached != path && !cached.starts_with(&prefix));
    }
}

fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize(path: &str) -> String {
    join(&segments(path))
}

fn join(segments: &[String]) -> String {
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Split into (parent segments, leaf name); the root has no leaf.
fn split_path(path: &str) -> Result<(Vec<String>, String)> {
    let mut segs = segments(path);
    let leaf = segs
        .pop()
        .ok_or_else(|| CloakError::InvalidName(path.to_string()))?;
    Ok((segs, leaf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ImageBuilder;
    use std::io::SeekFrom;
    use tempfile::TempDir;

    fn test_fs() -> (TempDir, CoreFS) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fs.img");
        ImageBuilder::new(&path, "pw")
            .blocks(512)
            .block_size(256)
            .sparse(true)
            .build()
            .unwrap();
        let fs = CoreFS::open(&path, "pw").unwrap();
        (dir, fs)
    }

    #[test]
    fn make_write_read() {
        let (_d, mut fs) = test_fs();
        fs.make_folder("/docs").unwrap();
        fs.make_file("/docs/readme").unwrap();

        {
            let mut file = fs.open_file("/docs/readme", OpenMode::append()).unwrap();
            file.write(b"path-addressed bytes").unwrap();
            file.flush().unwrap();
        }

        let mut file = fs.open_file("/docs/readme", OpenMode::read_only()).unwrap();
        let mut buf = vec![0u8; 20];
        file.read(&mut buf).unwrap();
        assert_eq!(&buf, b"path-addressed bytes");
    }

    #[test]
    fn nested_folders_resolve() {
        let (_d, mut fs) = test_fs();
        fs.make_folder("/a").unwrap();
        fs.make_folder("/a/b").unwrap();
        fs.make_folder("/a/b/c").unwrap();
        fs.make_file("/a/b/c/leaf").unwrap();

        assert!(fs.file_exists("/a/b/c/leaf").unwrap());
        assert!(fs.folder_exists("/a/b").unwrap());
        assert!(!fs.folder_exists("/a/b/c/leaf").unwrap());
        assert!(!fs.file_exists("/a/nope").unwrap());
        assert!(!fs.file_exists("/missing/parent/file").unwrap());
    }

    #[test]
    fn stat_reports_kind_and_size() {
        let (_d, mut fs) = test_fs();
        fs.make_folder("/d").unwrap();
        fs.make_file("/d/f").unwrap();
        {
            let mut file = fs.open_file("/d/f", OpenMode::append()).unwrap();
            file.write(&vec![1u8; 300]).unwrap();
        }

        let info = fs.stat("/d/f").unwrap();
        assert_eq!(info.kind, EntryKind::File);
        assert_eq!(info.size, 300);

        let root = fs.stat("/").unwrap();
        assert_eq!(root.kind, EntryKind::Folder);
        assert_eq!(root.first_block, 0);

        assert!(matches!(
            fs.stat("/d/missing"),
            Err(CloakError::NotFound(_))
        ));
    }

    #[test]
    fn statfs_tracks_allocation() {
        let (_d, mut fs) = test_fs();
        let before = fs.statfs().unwrap();
        assert_eq!(before.block_size, 256);
        assert_eq!(before.total_blocks, 512);
        // root folder occupies at least one block
        assert!(before.free_blocks < 512);

        fs.make_file("/big").unwrap();
        {
            let mut file = fs.open_file("/big", OpenMode::append()).unwrap();
            file.write(&vec![0u8; 2000]).unwrap();
        }
        let after = fs.statfs().unwrap();
        assert!(after.free_blocks < before.free_blocks);

        fs.remove_file("/big").unwrap();
        let reclaimed = fs.statfs().unwrap();
        assert!(reclaimed.free_blocks > after.free_blocks);
    }

    #[test]
    fn remove_folder_honors_recursive_flag() {
        let (_d, mut fs) = test_fs();
        fs.make_folder("/full").unwrap();
        fs.make_file("/full/child").unwrap();

        assert!(matches!(
            fs.remove_folder("/full", false),
            Err(CloakError::NotEmpty(_))
        ));
        fs.remove_folder("/full", true).unwrap();
        assert!(!fs.folder_exists("/full").unwrap());

        fs.make_folder("/empty").unwrap();
        fs.remove_folder("/empty", false).unwrap();
        assert!(!fs.folder_exists("/empty").unwrap());
    }

    #[test]
    fn cache_purged_when_folder_removed() {
        let (_d, mut fs) = test_fs();
        fs.make_folder("/cache").unwrap();
        fs.make_folder("/cache/inner").unwrap();
        fs.make_file("/cache/inner/f").unwrap();

        // populate the cache
        assert!(fs.file_exists("/cache/inner/f").unwrap());
        assert!(fs.folder_cache.contains_key("/cache/inner"));

        fs.remove_folder("/cache", true).unwrap();
        assert!(!fs.folder_cache.contains_key("/cache"));
        assert!(!fs.folder_cache.contains_key("/cache/inner"));

        // a fresh folder by the same name starts empty
        fs.make_folder("/cache").unwrap();
        assert_eq!(fs.list_folder("/cache").unwrap().len(), 0);
    }

    #[test]
    fn rename_within_folder() {
        let (_d, mut fs) = test_fs();
        fs.make_file("/before").unwrap();
        {
            let mut file = fs.open_file("/before", OpenMode::append()).unwrap();
            file.write(b"contents").unwrap();
        }

        fs.rename("/before", "/after").unwrap();
        assert!(!fs.file_exists("/before").unwrap());

        let mut file = fs.open_file("/after", OpenMode::read_only()).unwrap();
        let mut buf = [0u8; 8];
        file.read(&mut buf).unwrap();
        assert_eq!(&buf, b"contents");
    }

    #[test]
    fn rename_moves_across_folders() {
        let (_d, mut fs) = test_fs();
        fs.make_folder("/src").unwrap();
        fs.make_folder("/dst").unwrap();
        fs.make_file("/src/wander").unwrap();
        {
            let mut file = fs.open_file("/src/wander", OpenMode::append()).unwrap();
            file.write(b"moved intact").unwrap();
        }

        fs.rename("/src/wander", "/dst/settled").unwrap();
        assert!(!fs.file_exists("/src/wander").unwrap());

        let mut file = fs.open_file("/dst/settled", OpenMode::read_only()).unwrap();
        let mut buf = [0u8; 12];
        file.read(&mut buf).unwrap();
        assert_eq!(&buf, b"moved intact");
    }

    #[test]
    fn rename_into_own_subtree_rejected() {
        let (_d, mut fs) = test_fs();
        fs.make_folder("/loop").unwrap();
        fs.make_folder("/loop/deeper").unwrap();
        assert!(fs.rename("/loop", "/loop/deeper/again").is_err());
    }

    #[test]
    fn rename_onto_existing_entry_rejected() {
        let (_d, mut fs) = test_fs();
        fs.make_folder("/dst").unwrap();
        fs.make_file("/dst/taken").unwrap();
        fs.make_file("/orig").unwrap();

        assert!(matches!(
            fs.rename("/orig", "/dst/taken"),
            Err(CloakError::AlreadyExists(_))
        ));
        // source untouched by the failed move
        assert!(fs.file_exists("/orig").unwrap());
    }

    #[test]
    fn truncate_through_path() {
        let (_d, mut fs) = test_fs();
        fs.make_file("/t").unwrap();
        {
            let mut file = fs.open_file("/t", OpenMode::append()).unwrap();
            file.write(&vec![9u8; 1000]).unwrap();
        }

        fs.truncate_file("/t", 250).unwrap();
        assert_eq!(fs.stat("/t").unwrap().size, 250);
    }

    #[test]
    fn root_path_is_not_a_file() {
        let (_d, mut fs) = test_fs();
        assert!(fs.make_file("/").is_err());
        assert!(fs.open_file("/", OpenMode::read_only()).is_err());
        assert!(fs.folder_exists("/").unwrap());
    }

    #[test]
    fn seek_through_fs_handle() {
        let (_d, mut fs) = test_fs();
        fs.make_file("/s").unwrap();
        {
            let mut file = fs.open_file("/s", OpenMode::append()).unwrap();
            file.write(&vec![b'-'; 600]).unwrap();
        }
        {
            let mut file = fs.open_file("/s", OpenMode::overwrite()).unwrap();
            file.seek(SeekFrom::Start(500)).unwrap();
            file.write(b"mark").unwrap();
        }

        let mut file = fs.open_file("/s", OpenMode::read_only()).unwrap();
        file.seek(SeekFrom::Start(500)).unwrap();
        let mut buf = [0u8; 4];
        file.read(&mut buf).unwrap();
        assert_eq!(&buf, b"mark");
    }
}
