//! Whole-container integration: image lifecycle, password gating,
//! persistence across reopen, and space accounting through the path API.

use cloakfs::{CloakError, CoreFS, EntryKind, ImageBuilder, OpenMode};
use std::io::SeekFrom;
use tempfile::TempDir;

fn build(dir: &TempDir, name: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    ImageBuilder::new(&path, "letmein")
        .blocks(1024)
        .block_size(4096)
        .sparse(true)
        .build()
        .unwrap();
    path
}

#[test]
fn tree_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = build(&dir, "persist.img");

    {
        let mut fs = CoreFS::open(&path, "letmein").unwrap();
        fs.make_folder("/photos").unwrap();
        fs.make_folder("/photos/2026").unwrap();
        fs.make_file("/photos/2026/trip.raw").unwrap();
        let mut file = fs
            .open_file("/photos/2026/trip.raw", OpenMode::append())
            .unwrap();
        file.write(&vec![0x42; 30_000]).unwrap();
        file.flush().unwrap();
        fs.sync().unwrap();
    }

    let mut fs = CoreFS::open(&path, "letmein").unwrap();
    let info = fs.stat("/photos/2026/trip.raw").unwrap();
    assert_eq!(info.kind, EntryKind::File);
    assert_eq!(info.size, 30_000);

    let mut file = fs
        .open_file("/photos/2026/trip.raw", OpenMode::read_only())
        .unwrap();
    let mut buf = vec![0u8; 30_000];
    assert_eq!(file.read(&mut buf).unwrap(), 30_000);
    assert!(buf.iter().all(|&b| b == 0x42));
}

#[test]
fn wrong_password_never_opens() {
    let dir = TempDir::new().unwrap();
    let path = build(&dir, "locked.img");

    assert!(matches!(
        CoreFS::open(&path, "LETMEIN"),
        Err(CloakError::WrongPassword)
    ));
    assert!(matches!(
        CoreFS::open(&path, ""),
        Err(CloakError::WrongPassword)
    ));
}

#[test]
fn image_bytes_do_not_leak_content() {
    let dir = TempDir::new().unwrap();
    let path = build(&dir, "opaque.img");

    let secret = b"extremely sensitive plaintext marker";
    {
        let mut fs = CoreFS::open(&path, "letmein").unwrap();
        fs.make_file("/secret").unwrap();
        let mut file = fs.open_file("/secret", OpenMode::append()).unwrap();
        file.write(secret).unwrap();
        file.flush().unwrap();
        fs.sync().unwrap();
    }

    let raw = std::fs::read(&path).unwrap();
    let leaked = raw
        .windows(secret.len())
        .any(|window| window == secret.as_slice());
    assert!(!leaked, "plaintext found in the host file");
}

#[test]
fn truncated_image_is_corrupt_not_a_panic() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stub.img");
    std::fs::write(&path, [0u8; 16]).unwrap();

    assert!(matches!(
        CoreFS::open(&path, "pw"),
        Err(CloakError::Corrupt(_))
    ));
}

#[test]
fn statfs_reflects_geometry_and_usage() {
    let dir = TempDir::new().unwrap();
    let path = build(&dir, "stats.img");
    let mut fs = CoreFS::open(&path, "letmein").unwrap();

    let fresh = fs.statfs().unwrap();
    assert_eq!(fresh.block_size, 4096);
    assert_eq!(fresh.total_blocks, 1024);
    assert_eq!(fresh.free_blocks, 1023); // root folder body

    fs.make_file("/filler").unwrap();
    {
        let mut file = fs.open_file("/filler", OpenMode::append()).unwrap();
        file.write(&vec![1u8; 20_000]).unwrap(); // five 4084-byte blocks
        file.flush().unwrap();
    }
    assert_eq!(fs.statfs().unwrap().free_blocks, 1023 - 5);

    fs.remove_file("/filler").unwrap();
    assert_eq!(fs.statfs().unwrap().free_blocks, 1023);
}

#[test]
fn out_of_space_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tiny.img");
    ImageBuilder::new(&path, "pw")
        .blocks(4)
        .block_size(4096)
        .sparse(true)
        .build()
        .unwrap();

    let mut fs = CoreFS::open(&path, "pw").unwrap();
    fs.make_file("/takes-it-all").unwrap();
    let mut file = fs.open_file("/takes-it-all", OpenMode::append()).unwrap();
    // 1 root + 1 file head leaves 2 blocks; the chain allocator asks for a
    // pair per growth step, so filling them exhausts the image
    let result = (0..4)
        .try_for_each(|_| file.write(&vec![0u8; 4084]).map(|_| ()));
    assert!(matches!(result, Err(CloakError::OutOfSpace)));
}

#[test]
fn deep_paths_and_listing() {
    let dir = TempDir::new().unwrap();
    let path = build(&dir, "deep.img");
    let mut fs = CoreFS::open(&path, "letmein").unwrap();

    let mut current = String::new();
    for depth in 0..6 {
        current = format!("{current}/d{depth}");
        fs.make_folder(&current).unwrap();
    }
    fs.make_file(&format!("{current}/bottom")).unwrap();

    let listing = fs.list_folder(&current).unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "bottom");

    fs.remove_folder("/d0", true).unwrap();
    assert_eq!(fs.statfs().unwrap().free_blocks, 1023);
    assert!(!fs.folder_exists("/d0").unwrap());
}

#[test]
fn truncate_flag_resets_existing_file() {
    let dir = TempDir::new().unwrap();
    let path = build(&dir, "truncflag.img");
    let mut fs = CoreFS::open(&path, "letmein").unwrap();

    fs.make_file("/log").unwrap();
    {
        let mut file = fs.open_file("/log", OpenMode::append()).unwrap();
        file.write(&vec![b'o'; 9000]).unwrap();
        file.flush().unwrap();
    }

    {
        let mut file = fs.open_file("/log", OpenMode::truncate()).unwrap();
        assert_eq!(file.size(), 0);
        file.write(b"rotated").unwrap();
        file.flush().unwrap();
    }

    // the directory still reaches the file at its original start block
    let mut file = fs.open_file("/log", OpenMode::read_only()).unwrap();
    assert_eq!(file.size(), 7);
    let mut buf = [0u8; 7];
    file.read(&mut buf).unwrap();
    assert_eq!(&buf, b"rotated");
}

#[test]
fn write_flush_read_within_one_handle_generation() {
    let dir = TempDir::new().unwrap();
    let path = build(&dir, "ordering.img");
    let mut fs = CoreFS::open(&path, "letmein").unwrap();

    fs.make_file("/wal").unwrap();
    let mut writer = fs.open_file("/wal", OpenMode::append()).unwrap();
    writer.write(b"committed").unwrap();
    writer.flush().unwrap();

    // a write followed by a flush is visible to a subsequent reader
    let mut reader = fs.open_file("/wal", OpenMode::read_only()).unwrap();
    let mut buf = [0u8; 9];
    reader.read(&mut buf).unwrap();
    assert_eq!(&buf, b"committed");

    // and the writer can keep appending afterwards
    writer.write(b" more").unwrap();
    writer.flush().unwrap();
    let mut reader = fs.open_file("/wal", OpenMode::read_only()).unwrap();
    assert_eq!(reader.size(), 14);

    let pos = reader.seek(SeekFrom::End(-5)).unwrap();
    assert_eq!(pos, 9);
    let mut tail = [0u8; 5];
    reader.read(&mut tail).unwrap();
    assert_eq!(&tail, b" more");
}
