//! Operation dispatcher
//!
//! Maps each decoded [`Request`] onto the jail, the handle table and the
//! filesystem layer, and produces exactly one [`Response`]. Failures never
//! escape: they are logged and turned into a STATUS reply.

use crate::files;
use crate::handle::{HandleKind, HandleTable};
use crate::jail::Jail;
use crate::protocol::{FileAttrs, NameEntry, OpenFlags, Request, Response};
use crate::{Error, Result};
use tracing::{debug, error, info, warn};

/// Default cap on the bytes returned by a single read
pub const DEFAULT_MAX_READ_LEN: usize = 32 * 1024;

/// Per-session request handler
///
/// Owns the session's handle table; requests are handled one at a time
/// through `&mut self`.
#[derive(Debug)]
pub struct Dispatcher {
    jail: Jail,
    handles: HandleTable,
    max_read_len: usize,
}

impl Dispatcher {
    /// Dispatcher over `jail` with its own handle table
    pub fn new(jail: Jail, handles: HandleTable, max_read_len: usize) -> Self {
        Self {
            jail,
            handles,
            max_read_len: max_read_len.max(1),
        }
    }

    /// Root the session is confined to
    pub const fn jail(&self) -> &Jail {
        &self.jail
    }

    /// The session's handle table
    pub const fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Handle one request
    pub async fn dispatch(&mut self, request: Request) -> Response {
        let operation = request.name();
        debug!(operation, "Dispatching request");

        let result = match request {
            Request::Opendir { path } => self.open_dir(&path).await,
            Request::Readdir { handle } => self.list_dir(&handle).await,
            Request::Close { handle } => self.close(&handle),
            Request::Stat { path } => self.stat(&path).await,
            Request::Lstat { path } => self.lstat(&path).await,
            Request::Realpath { path } => self.resolve_path(&path).await,
            Request::Open {
                filename,
                pflags,
                attrs,
            } => self.open_file(&filename, pflags, &attrs).await,
            Request::Read {
                handle,
                offset,
                len,
            } => self.read(&handle, offset, len).await,
            Request::Write { .. }
            | Request::Fstat { .. }
            | Request::Setstat { .. }
            | Request::Fsetstat { .. }
            | Request::Remove { .. }
            | Request::Mkdir { .. }
            | Request::Rmdir { .. }
            | Request::Rename { .. }
            | Request::Readlink { .. }
            | Request::Symlink { .. }
            | Request::Extended { .. }
            | Request::Unknown { .. } => Err(Error::unsupported(operation)),
        };

        result.unwrap_or_else(|e| Self::error_response(operation, &e))
    }

    fn error_response(operation: &str, e: &Error) -> Response {
        if e.is_security_event() {
            warn!(event = "security_violation", operation, error = %e, "Request rejected");
        } else if e.is_client_error() {
            debug!(operation, error = %e, "Request failed");
        } else {
            error!(operation, error = %e, "Request failed");
        }
        Response::status(e.to_status_code(), e.sanitized_message())
    }

    /// Open a directory for listing
    ///
    /// # Errors
    ///
    /// [`Error::OutOfJail`], [`Error::Filesystem`], or
    /// [`Error::NotADirectory`] if the target is anything but a directory.
    pub async fn open_dir(&mut self, path: &str) -> Result<Response> {
        let resolved = self.jail.resolve_canonical(path).await?;
        let stat = files::stat(&resolved).await?;
        if !stat.is_dir() {
            return Err(Error::NotADirectory(resolved.display().to_string()));
        }

        let id = self
            .handles
            .create(HandleKind::Directory, resolved, None, "r")?;
        debug!(handle = %id, path, "Directory opened");
        Ok(Response::Handle(id.to_bytes()))
    }

    /// List a directory handle; the first call returns every entry, later
    /// calls return EOF
    ///
    /// # Errors
    ///
    /// [`Error::UnknownHandle`], [`Error::BadHandleType`],
    /// [`Error::AlreadyClosed`] or [`Error::Filesystem`].
    pub async fn list_dir(&mut self, handle: &[u8]) -> Result<Response> {
        let entry = self.handles.get(handle)?;
        if !entry.begin_listing()? {
            return Ok(Response::eof());
        }

        let path = entry.path().to_path_buf();
        let entries = files::read_dir(&path).await?;
        self.handles.get_mut(handle)?.finish_listing();

        Ok(Response::Name(entries))
    }

    /// Close a handle
    ///
    /// # Errors
    ///
    /// [`Error::UnknownHandle`] if the handle was never issued.
    pub fn close(&mut self, handle: &[u8]) -> Result<Response> {
        let entry = self.handles.get_mut(handle)?;
        let released = entry.close();
        debug!(handle = %entry.id(), released, "Handle closed");
        Ok(Response::ok())
    }

    /// Attributes, following symlinks
    ///
    /// # Errors
    ///
    /// [`Error::OutOfJail`] or [`Error::Filesystem`].
    pub async fn stat(&self, path: &str) -> Result<Response> {
        let resolved = self.jail.resolve_canonical(path).await?;
        Ok(Response::Attrs(files::stat(&resolved).await?.to_attrs()))
    }

    /// Attributes of the path itself, without following a trailing symlink
    ///
    /// # Errors
    ///
    /// [`Error::OutOfJail`] or [`Error::Filesystem`].
    pub async fn lstat(&self, path: &str) -> Result<Response> {
        let resolved = self.jail.resolve_no_follow(path).await?;
        Ok(Response::Attrs(files::lstat(&resolved).await?.to_attrs()))
    }

    /// Canonical absolute form of a client path
    ///
    /// # Errors
    ///
    /// [`Error::OutOfJail`] or [`Error::Filesystem`].
    pub async fn resolve_path(&self, path: &str) -> Result<Response> {
        let resolved = self.jail.resolve_canonical(path).await?;
        let name = resolved.to_string_lossy().into_owned();

        Ok(Response::Name(vec![NameEntry {
            filename: name.clone(),
            longname: name,
            attrs: FileAttrs::default(),
        }]))
    }

    /// Open a regular file for reading
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedOperation`] for any write intent,
    /// [`Error::NotARegularFile`] for directories, links and devices,
    /// otherwise [`Error::OutOfJail`] or [`Error::Filesystem`].
    pub async fn open_file(
        &mut self,
        path: &str,
        pflags: OpenFlags,
        _attrs: &FileAttrs,
    ) -> Result<Response> {
        if !pflags.is_read_only() {
            return Err(Error::unsupported(format!(
                "open with flags {:#x}",
                pflags.0
            )));
        }

        let lexical = self.jail.resolve(path)?;
        let resolved = self.jail.resolve_canonical(path).await?;
        if !files::lstat(&lexical).await?.is_regular() {
            return Err(Error::NotARegularFile(resolved.display().to_string()));
        }

        let file = files::open_read(&resolved).await?;
        let mode = pflags.mode_string().unwrap_or("r");
        let id = self
            .handles
            .create(HandleKind::File, resolved, Some(file), mode)?;

        info!(event = "file_opened", handle = %id, path, mode, "File opened for reading");
        Ok(Response::Handle(id.to_bytes()))
    }

    /// Read up to `len` bytes at `offset`
    ///
    /// # Errors
    ///
    /// [`Error::UnknownHandle`], [`Error::BadHandleType`],
    /// [`Error::AlreadyClosed`] or [`Error::Filesystem`].
    pub async fn read(&mut self, handle: &[u8], offset: u64, len: u32) -> Result<Response> {
        let len = usize::try_from(len)
            .unwrap_or(usize::MAX)
            .min(self.max_read_len);
        let entry = self.handles.get_mut(handle)?;

        let Some(file) = entry.readable()? else {
            return Ok(Response::eof());
        };
        let data = files::read_at(file, offset, len).await?;
        entry.record_read(offset, len, data.len());

        if data.is_empty() {
            debug!(
                handle = %entry.id(),
                offset,
                delivered = entry.offset(),
                state = ?entry.state(),
                "End of file"
            );
            Ok(Response::eof())
        } else {
            Ok(Response::Data(data))
        }
    }

    /// Release every descriptor still held by the session
    pub fn shutdown(&mut self) -> usize {
        let released = self.handles.close_all();
        info!(
            event = "session_handles_released",
            released,
            "Released open handles"
        );
        released
    }
}
