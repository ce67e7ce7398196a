//! Filesystem access layer
//!
//! Thin async wrappers over `tokio::fs` that hand back [`FileStat`] records
//! and fully rendered directory entries. Nothing here knows about the jail
//! or about handles; callers pass already-confined paths.

use crate::Result;
use crate::format;
use crate::protocol::{FileAttrs, NameEntry};
use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Raw stat record, the subset of `struct stat` the listing needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// `st_mode`, type bits included
    pub mode: u32,
    /// Hard link count
    pub nlink: u64,
    /// Owner id
    pub uid: u32,
    /// Group id
    pub gid: u32,
    /// Size in bytes
    pub size: u64,
    /// Seconds since the epoch
    pub atime: i64,
    /// Seconds since the epoch
    pub mtime: i64,
}

impl FileStat {
    /// Directory type bits
    pub const fn is_dir(&self) -> bool {
        self.mode & 0o170_000 == 0o040_000
    }

    /// Regular file type bits
    pub const fn is_regular(&self) -> bool {
        self.mode & 0o170_000 == 0o100_000
    }

    /// SFTP attribute block for this record
    pub fn to_attrs(&self) -> FileAttrs {
        FileAttrs {
            size: Some(self.size),
            uid: Some(self.uid),
            gid: Some(self.gid),
            permissions: Some(self.mode),
            atime: Some(clamp_time(self.atime)),
            mtime: Some(clamp_time(self.mtime)),
        }
    }
}

impl From<&std::fs::Metadata> for FileStat {
    fn from(metadata: &std::fs::Metadata) -> Self {
        Self {
            mode: metadata.mode(),
            nlink: metadata.nlink(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            size: metadata.size(),
            atime: metadata.atime(),
            mtime: metadata.mtime(),
        }
    }
}

// SFTP v3 carries 32-bit timestamps
fn clamp_time(secs: i64) -> u32 {
    u32::try_from(secs.max(0)).unwrap_or(u32::MAX)
}

/// Resolve symlinks and relative components through the OS
///
/// # Errors
///
/// Returns [`crate::Error::Filesystem`] if the path does not exist.
pub async fn canonicalize(path: &Path) -> Result<PathBuf> {
    Ok(fs::canonicalize(path).await?)
}

/// Stat following symlinks
///
/// # Errors
///
/// Returns [`crate::Error::Filesystem`] on any OS failure.
pub async fn stat(path: &Path) -> Result<FileStat> {
    let metadata = fs::metadata(path).await?;
    Ok(FileStat::from(&metadata))
}

/// Stat without following a trailing symlink
///
/// # Errors
///
/// Returns [`crate::Error::Filesystem`] on any OS failure.
pub async fn lstat(path: &Path) -> Result<FileStat> {
    let metadata = fs::symlink_metadata(path).await?;
    Ok(FileStat::from(&metadata))
}

/// Listing entry for a single path, rendered from its lstat record
///
/// # Errors
///
/// Returns [`crate::Error::Filesystem`] on any OS failure.
pub async fn entry(path: &Path) -> Result<NameEntry> {
    let stat = lstat(path).await?;
    let filename = path
        .file_name()
        .map_or_else(|| path.to_string_lossy(), |name| name.to_string_lossy())
        .into_owned();

    Ok(NameEntry {
        longname: format::longname(&stat, &filename),
        filename,
        attrs: stat.to_attrs(),
    })
}

/// Every child of a directory, in enumeration order
///
/// Each child is stat'ed in turn; the whole listing is materialized before
/// returning.
///
/// # Errors
///
/// Returns [`crate::Error::Filesystem`] if the directory cannot be read or a
/// child cannot be stat'ed.
pub async fn read_dir(path: &Path) -> Result<Vec<NameEntry>> {
    let mut read_dir = fs::read_dir(path).await?;
    let mut entries = Vec::new();

    while let Some(child) = read_dir.next_entry().await? {
        entries.push(entry(&child.path()).await?);
    }

    debug!(directory = ?path, count = entries.len(), "Directory enumerated");
    Ok(entries)
}

/// Open a file for reading
///
/// # Errors
///
/// Returns [`crate::Error::Filesystem`] on any OS failure.
pub async fn open_read(path: &Path) -> Result<fs::File> {
    Ok(fs::OpenOptions::new().read(true).open(path).await?)
}

/// Read up to `len` bytes starting at `offset`
///
/// A short or empty result is not an error; an empty vector means the
/// offset is at or past end of file.
///
/// # Errors
///
/// Returns [`crate::Error::Filesystem`] if the seek or read fails.
pub async fn read_at(file: &mut fs::File, offset: u64, len: usize) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buffer = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buffer.truncate(filled);

    Ok(buffer)
}
