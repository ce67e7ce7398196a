//! Handle table and per-handle state machine
//!
//! A handle stands for one open file or directory across several requests.
//! Clients only ever see the opaque `handle-<id>` byte string; this module is
//! the only place that parses it.
//!
//! State transitions:
//!
//! ```text
//!   Directory: New ──list──▶ Complete ──list──▶ (EOF, no I/O)
//!   File:      Open ──read n>0──▶ Open ──read 0 at cursor──▶ Complete
//!              Complete ──read──▶ (EOF, no I/O)
//!   Any state ──close──▶ Closed ──close──▶ Closed (nothing released)
//! ```

use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tracing::debug;

const HANDLE_PREFIX: &str = "handle-";

/// Default bound on records kept per table
pub const DEFAULT_MAX_HANDLES: usize = 1024;

/// Numeric handle identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u64);

impl HandleId {
    /// Raw counter value
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Opaque wire form handed to the client
    pub fn to_bytes(self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parse the wire form; anything malformed is simply not a handle
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        let digits = text.strip_prefix(HANDLE_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(Self)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{HANDLE_PREFIX}{}", self.0)
    }
}

/// What a handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Regular file opened for reading
    File,
    /// Directory opened for listing
    Directory,
}

/// Lifecycle state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Created, nothing delivered yet
    New,
    /// File descriptor held and readable
    Open,
    /// Everything delivered; further reads/lists answer EOF
    Complete,
    /// Terminal; descriptor released
    Closed,
}

/// One open file or directory
#[derive(Debug)]
pub struct Handle {
    id: HandleId,
    kind: HandleKind,
    path: PathBuf,
    state: HandleState,
    descriptor: Option<File>,
    mode: String,
    offset: u64,
}

impl Handle {
    /// Identifier issued by the table
    pub const fn id(&self) -> HandleId {
        self.id
    }

    /// File or directory
    pub const fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Resolved host path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current lifecycle state
    pub const fn state(&self) -> HandleState {
        self.state
    }

    /// Open mode string, e.g. `r`
    pub fn mode(&self) -> &str {
        &self.mode
    }

    /// Bytes delivered to the client so far
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether an OS descriptor is still held
    pub const fn has_descriptor(&self) -> bool {
        self.descriptor.is_some()
    }

    /// Decide whether a listing should hit the filesystem
    ///
    /// Returns `true` when the entries still have to be read, `false` when
    /// they were already delivered.
    ///
    /// # Errors
    ///
    /// [`Error::BadHandleType`] for file handles, [`Error::AlreadyClosed`]
    /// once closed.
    pub fn begin_listing(&self) -> Result<bool> {
        if self.kind != HandleKind::Directory {
            return Err(Error::BadHandleType(format!("{} is not a directory handle", self.id)));
        }
        match self.state {
            HandleState::Closed => Err(Error::AlreadyClosed(self.id.to_string())),
            HandleState::Complete => Ok(false),
            HandleState::New | HandleState::Open => Ok(true),
        }
    }

    /// The listing went out; the next one answers EOF
    pub fn finish_listing(&mut self) {
        self.state = HandleState::Complete;
    }

    /// Descriptor to read from, or `None` when the file is exhausted
    ///
    /// # Errors
    ///
    /// [`Error::BadHandleType`] for directory handles,
    /// [`Error::AlreadyClosed`] once closed.
    pub fn readable(&mut self) -> Result<Option<&mut File>> {
        if self.kind != HandleKind::File {
            return Err(Error::BadHandleType(format!("{} is not a file handle", self.id)));
        }
        match self.state {
            HandleState::Closed => Err(Error::AlreadyClosed(self.id.to_string())),
            HandleState::Complete => Ok(None),
            HandleState::New | HandleState::Open => self
                .descriptor
                .as_mut()
                .map(Some)
                .ok_or_else(|| Error::AlreadyClosed(self.id.to_string())),
        }
    }

    /// Account for a completed read of `bytes` out of `requested` at `at`
    ///
    /// Zero bytes at the delivered cursor means the file is finished,
    /// whatever the OS says about end of file. A zero-byte read anywhere else
    /// leaves the state alone: a pipelining client may still have gaps
    /// behind it to re-request.
    pub fn record_read(&mut self, at: u64, requested: usize, bytes: usize) {
        if bytes > 0 {
            self.offset += bytes as u64;
        } else if requested > 0 && at == self.offset {
            self.state = HandleState::Complete;
        }
    }

    /// Close the handle, returning whether a descriptor was released
    ///
    /// Valid from every state; closing twice releases nothing the second
    /// time.
    pub fn close(&mut self) -> bool {
        let released = self.descriptor.take().is_some();
        self.state = HandleState::Closed;
        self.offset = 0;
        released
    }
}

/// Per-session table of handles
///
/// Ids come from a counter that starts at 0 and only ever increases, so an
/// id is never handed out twice by the same table. Closed records are kept
/// so a repeated close still succeeds; they are only swept when the table
/// reaches its bound.
#[derive(Debug)]
pub struct HandleTable {
    handles: HashMap<HandleId, Handle>,
    next_id: u64,
    max_handles: usize,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HANDLES)
    }
}

impl HandleTable {
    /// Empty table holding at most `max_handles` records
    pub fn new(max_handles: usize) -> Self {
        Self {
            handles: HashMap::new(),
            next_id: 0,
            max_handles: max_handles.max(1),
        }
    }

    /// Number of records, closed ones included
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// No records at all
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Number of handles not yet closed
    pub fn live(&self) -> usize {
        self.handles
            .values()
            .filter(|h| h.state != HandleState::Closed)
            .count()
    }

    /// Allocate a new handle
    ///
    /// File handles start `Open` (descriptor held), directory handles `New`.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceExhaustion`] when the table is full of live handles.
    pub fn create(
        &mut self,
        kind: HandleKind,
        path: PathBuf,
        descriptor: Option<File>,
        mode: impl Into<String>,
    ) -> Result<HandleId> {
        if self.handles.len() >= self.max_handles {
            self.sweep_closed();
            if self.handles.len() >= self.max_handles {
                return Err(Error::resource_exhaustion(format!(
                    "Too many open handles ({})",
                    self.max_handles
                )));
            }
        }

        let id = HandleId(self.next_id);
        self.next_id += 1;

        let state = match (kind, descriptor.is_some()) {
            (HandleKind::File, true) => HandleState::Open,
            _ => HandleState::New,
        };

        debug!(handle = %id, ?kind, path = ?path, "Handle created");
        self.handles.insert(
            id,
            Handle {
                id,
                kind,
                path,
                state,
                descriptor,
                mode: mode.into(),
                offset: 0,
            },
        );

        Ok(id)
    }

    /// Look up a handle by its wire form
    ///
    /// # Errors
    ///
    /// [`Error::UnknownHandle`] for malformed or unknown handles.
    pub fn get(&self, raw: &[u8]) -> Result<&Handle> {
        HandleId::parse(raw)
            .and_then(|id| self.handles.get(&id))
            .ok_or_else(|| Error::unknown_handle(raw))
    }

    /// Mutable lookup by wire form
    ///
    /// # Errors
    ///
    /// [`Error::UnknownHandle`] for malformed or unknown handles.
    pub fn get_mut(&mut self, raw: &[u8]) -> Result<&mut Handle> {
        HandleId::parse(raw)
            .and_then(|id| self.handles.get_mut(&id))
            .ok_or_else(|| Error::unknown_handle(raw))
    }

    /// Apply `mutator` to a handle in place
    ///
    /// # Errors
    ///
    /// [`Error::UnknownHandle`] if the handle does not exist; otherwise
    /// whatever `mutator` returns.
    pub fn update<T>(
        &mut self,
        raw: &[u8],
        mutator: impl FnOnce(&mut Handle) -> Result<T>,
    ) -> Result<T> {
        mutator(self.get_mut(raw)?)
    }

    /// Close every handle, returning how many descriptors were released
    pub fn close_all(&mut self) -> usize {
        self.handles.values_mut().map(Handle::close).filter(|r| *r).count()
    }

    fn sweep_closed(&mut self) {
        let before = self.handles.len();
        self.handles.retain(|_, h| h.state != HandleState::Closed);
        debug!(
            swept = before - self.handles.len(),
            remaining = self.handles.len(),
            "Swept closed handles"
        );
    }
}
