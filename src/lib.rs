//! Encrypted single-file virtual filesystem.
//!
//! A cloakfs container is one host file holding a complete directory tree.
//! Everything past a 40-byte plaintext prefix is run through a seekable
//! stream cipher, so an unmounted container is an opaque blob to anyone
//! without the password.
//!
//! ## Storage model
//!
//! - **Fixed-size blocks** tracked by a bit-per-block occupancy bitmap in
//!   the superblock region ([`allocator`]).
//! - **Files are block chains**: each block's trailer stores how many data
//!   bytes it holds and the index of the next block; a block pointing at
//!   itself terminates the chain ([`block`], [`file`]).
//! - **Folders are files**: a directory is the body of an ordinary file
//!   holding an entry count and fixed-width slot records with in-band
//!   tombstones ([`folder`]).
//! - **Paths** resolve against the root folder at block 0 ([`fs`]).
//!
//! ## Layout of a container
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ IVs + cipher header + block size + version   │  40 B, plaintext
//! ├──────────────────────────────────────────────┤
//! │ password hash (SHA-256)                      │  32 B ─┐
//! │ total block count                            │   8 B  │
//! │ occupancy bitmap                             │ ⌈N/8⌉ B │ ciphered
//! │ file count (informational)                   │   8 B  │
//! │ data area: N blocks of B bytes               │ N×B B ─┘
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use cloakfs::{CoreFS, ImageBuilder, OpenMode};
//!
//! # fn main() -> cloakfs::Result<()> {
//! ImageBuilder::new("vault.img", "password")
//!     .blocks(4096)
//!     .build()?;
//!
//! let mut fs = CoreFS::open("vault.img", "password")?;
//! fs.make_folder("/notes")?;
//! fs.make_file("/notes/today")?;
//!
//! let mut file = fs.open_file("/notes/today", OpenMode::append())?;
//! file.write(b"nobody can read this from the outside")?;
//! file.flush()?;
//! # Ok(())
//! # }
//! ```
//!
//! The core is single-writer: handles may be held concurrently over
//! distinct chains, but mutations must be serialized by the caller (a
//! mount shim typically wraps the whole [`CoreFS`] in a mutex).

pub mod allocator;
pub mod block;
pub mod container;
pub mod device;
pub mod error;
pub mod file;
pub mod folder;
pub mod fs;
pub mod superblock;

pub use container::{open_volume, ImageBuilder};
pub use error::{CloakError, Result};
pub use file::{Access, File, OpenMode, Placement, Truncation};
pub use folder::{ContentFolder, EntryInfo, EntryKind, MAX_NAME};
pub use fs::{CoreFS, StatFs};
pub use superblock::{Layout, SharedVolume, Volume, BLOCK_META};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
