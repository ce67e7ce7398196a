//! SFTP Protocol Implementation
//!
//! Wire types for the SSH File Transfer Protocol as defined in
//! draft-ietf-secsh-filexfer-02 (protocol version 3).
//!
//! The SFTP protocol runs over the SSH connection protocol (RFC 4254),
//! using the "sftp" subsystem. Every packet is `u32 length | u8 type |
//! payload`; the length prefix is handled by the session framing, so the
//! functions here work on the bytes after it.

use bytes::{BufMut, BytesMut};

/// SFTP Protocol Version
pub const SFTP_VERSION: u32 = 3;

/// SFTP message types (as defined in the SFTP specification)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Initialize SFTP session
    Init = 1,
    /// Version response
    Version = 2,
    /// Open file
    Open = 3,
    /// Close file
    Close = 4,
    /// Read from file
    Read = 5,
    /// Write to file
    Write = 6,
    /// Get file attributes by path
    Lstat = 7,
    /// Get file attributes by handle
    Fstat = 8,
    /// Set file attributes by path
    Setstat = 9,
    /// Set file attributes by handle
    Fsetstat = 10,
    /// Open directory
    Opendir = 11,
    /// Read directory entries
    Readdir = 12,
    /// Remove file
    Remove = 13,
    /// Create directory
    Mkdir = 14,
    /// Remove directory
    Rmdir = 15,
    /// Get real path
    Realpath = 16,
    /// Get file attributes by path (follow symlinks)
    Stat = 17,
    /// Rename file or directory
    Rename = 18,
    /// Read symbolic link
    Readlink = 19,
    /// Create symbolic link
    Symlink = 20,
    /// Status response
    Status = 101,
    /// Handle response
    Handle = 102,
    /// Data response
    Data = 103,
    /// Name response (for directory listings)
    Name = 104,
    /// Attributes response
    Attrs = 105,
    /// Extended request
    Extended = 200,
    /// Extended reply
    ExtendedReply = 201,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Init),
            2 => Ok(Self::Version),
            3 => Ok(Self::Open),
            4 => Ok(Self::Close),
            5 => Ok(Self::Read),
            6 => Ok(Self::Write),
            7 => Ok(Self::Lstat),
            8 => Ok(Self::Fstat),
            9 => Ok(Self::Setstat),
            10 => Ok(Self::Fsetstat),
            11 => Ok(Self::Opendir),
            12 => Ok(Self::Readdir),
            13 => Ok(Self::Remove),
            14 => Ok(Self::Mkdir),
            15 => Ok(Self::Rmdir),
            16 => Ok(Self::Realpath),
            17 => Ok(Self::Stat),
            18 => Ok(Self::Rename),
            19 => Ok(Self::Readlink),
            20 => Ok(Self::Symlink),
            101 => Ok(Self::Status),
            102 => Ok(Self::Handle),
            103 => Ok(Self::Data),
            104 => Ok(Self::Name),
            105 => Ok(Self::Attrs),
            200 => Ok(Self::Extended),
            201 => Ok(Self::ExtendedReply),
            _ => Err(crate::Error::Protocol(format!(
                "Unknown message type: {value}"
            ))),
        }
    }
}

/// SFTP Status codes (RFC draft-ietf-secsh-filexfer)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Success
    Ok = 0,
    /// End of file
    Eof = 1,
    /// No such file or directory
    NoSuchFile = 2,
    /// Permission denied
    PermissionDenied = 3,
    /// General failure
    Failure = 4,
    /// Bad message
    BadMessage = 5,
    /// No connection
    NoConnection = 6,
    /// Connection lost
    ConnectionLost = 7,
    /// Operation not supported
    OpUnsupported = 8,
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> Self {
        code as Self
    }
}

/// File open flags (draft-ietf-secsh-filexfer-02)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// SSH_FXF_READ
    pub const READ: u32 = 0x0000_0001;
    /// SSH_FXF_WRITE
    pub const WRITE: u32 = 0x0000_0002;
    /// SSH_FXF_APPEND
    pub const APPEND: u32 = 0x0000_0004;
    /// SSH_FXF_CREAT
    pub const CREAT: u32 = 0x0000_0008;
    /// SSH_FXF_TRUNC
    pub const TRUNC: u32 = 0x0000_0010;
    /// SSH_FXF_EXCL
    pub const EXCL: u32 = 0x0000_0020;

    /// Every flag that would let the client modify or create a file
    pub const WRITE_INTENT: u32 =
        Self::WRITE | Self::APPEND | Self::CREAT | Self::TRUNC | Self::EXCL;

    /// READ is set
    pub const fn has_read(self) -> bool {
        self.0 & Self::READ != 0
    }

    /// WRITE is set
    pub const fn has_write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// APPEND is set
    pub const fn has_append(self) -> bool {
        self.0 & Self::APPEND != 0
    }

    /// CREAT is set
    pub const fn has_creat(self) -> bool {
        self.0 & Self::CREAT != 0
    }

    /// TRUNC is set
    pub const fn has_trunc(self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    /// EXCL is set
    pub const fn has_excl(self) -> bool {
        self.0 & Self::EXCL != 0
    }

    /// True when no flag asks for modification of the file
    pub const fn is_read_only(self) -> bool {
        self.0 & Self::WRITE_INTENT == 0
    }

    /// fopen-style mode string for this flag combination
    ///
    /// Returns `None` for combinations that have no fopen equivalent.
    pub const fn mode_string(self) -> Option<&'static str> {
        const R: u32 = OpenFlags::READ;
        const W: u32 = OpenFlags::WRITE;
        const A: u32 = OpenFlags::APPEND;
        const C: u32 = OpenFlags::CREAT;
        const T: u32 = OpenFlags::TRUNC;
        const X: u32 = OpenFlags::EXCL;

        match self.0 {
            R => Some("r"),
            v if v == R | W => Some("r+"),
            v if v == T | C | W => Some("w"),
            v if v == T | C | W | X => Some("wx"),
            v if v == T | C | R | W => Some("w+"),
            v if v == T | C | R | W | X => Some("wx+"),
            v if v == A | C | W => Some("a"),
            v if v == A | C | W | X => Some("ax"),
            v if v == A | C | R | W => Some("a+"),
            v if v == A | C | R | W | X => Some("ax+"),
            _ => None,
        }
    }
}

/// File attributes (draft-ietf-secsh-filexfer-02)
///
/// `permissions` carries the full `st_mode`, file-type bits included, the
/// way OpenSSH reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    /// Size in bytes
    pub size: Option<u64>,
    /// Owner id; sent together with `gid`
    pub uid: Option<u32>,
    /// Group id
    pub gid: Option<u32>,
    /// Full `st_mode`
    pub permissions: Option<u32>,
    /// Access time, seconds since the epoch; sent together with `mtime`
    pub atime: Option<u32>,
    /// Modification time, seconds since the epoch
    pub mtime: Option<u32>,
}

impl FileAttrs {
    const FLAG_SIZE: u32 = 0x0000_0001;
    const FLAG_UIDGID: u32 = 0x0000_0002;
    const FLAG_PERMISSIONS: u32 = 0x0000_0004;
    const FLAG_ACMODTIME: u32 = 0x0000_0008;
    const FLAG_EXTENDED: u32 = 0x8000_0000;

    /// Encode file attributes to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut flags = 0u32;

        if self.size.is_some() {
            flags |= Self::FLAG_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= Self::FLAG_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= Self::FLAG_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= Self::FLAG_ACMODTIME;
        }

        buf.put_u32(flags);

        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }

        buf
    }

    /// Decode file attributes from bytes
    ///
    /// Extended attribute pairs are consumed and discarded.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Protocol`] when the buffer is truncated.
    pub fn decode(buf: &mut &[u8]) -> crate::Result<Self> {
        let flags = codec::get_u32(buf)?;
        let mut attrs = Self::default();

        if flags & Self::FLAG_SIZE != 0 {
            attrs.size = Some(codec::get_u64(buf)?);
        }

        if flags & Self::FLAG_UIDGID != 0 {
            attrs.uid = Some(codec::get_u32(buf)?);
            attrs.gid = Some(codec::get_u32(buf)?);
        }

        if flags & Self::FLAG_PERMISSIONS != 0 {
            attrs.permissions = Some(codec::get_u32(buf)?);
        }

        if flags & Self::FLAG_ACMODTIME != 0 {
            attrs.atime = Some(codec::get_u32(buf)?);
            attrs.mtime = Some(codec::get_u32(buf)?);
        }

        if flags & Self::FLAG_EXTENDED != 0 {
            let count = codec::get_u32(buf)?;
            for _ in 0..count {
                codec::get_bytes(buf)?;
                codec::get_bytes(buf)?;
            }
        }

        Ok(attrs)
    }
}

/// Client request, decoded from one SFTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Open a file
    Open {
        /// Client path
        filename: String,
        /// Requested access
        pflags: OpenFlags,
        /// Attributes for a created file
        attrs: FileAttrs,
    },
    /// Close a handle
    Close {
        /// Wire handle
        handle: Vec<u8>,
    },
    /// Read from a file handle
    Read {
        /// Wire handle
        handle: Vec<u8>,
        /// Byte offset to read from
        offset: u64,
        /// Requested length
        len: u32,
    },
    /// Write to a file handle
    Write {
        /// Wire handle
        handle: Vec<u8>,
        /// Byte offset to write at
        offset: u64,
        /// Bytes to write
        data: Vec<u8>,
    },
    /// Attributes without following a trailing symlink
    Lstat {
        /// Client path
        path: String,
    },
    /// Attributes of an open handle
    Fstat {
        /// Wire handle
        handle: Vec<u8>,
    },
    /// Change attributes by path
    Setstat {
        /// Client path
        path: String,
        /// New attributes
        attrs: FileAttrs,
    },
    /// Change attributes by handle
    Fsetstat {
        /// Wire handle
        handle: Vec<u8>,
        /// New attributes
        attrs: FileAttrs,
    },
    /// Open a directory for listing
    Opendir {
        /// Client path
        path: String,
    },
    /// List an open directory
    Readdir {
        /// Wire handle
        handle: Vec<u8>,
    },
    /// Remove a file
    Remove {
        /// Client path
        path: String,
    },
    /// Create a directory
    Mkdir {
        /// Client path
        path: String,
        /// Attributes for the new directory
        attrs: FileAttrs,
    },
    /// Remove a directory
    Rmdir {
        /// Client path
        path: String,
    },
    /// Canonicalize a path
    Realpath {
        /// Client path
        path: String,
    },
    /// Attributes, following symlinks
    Stat {
        /// Client path
        path: String,
    },
    /// Rename a file or directory
    Rename {
        /// Current path
        old_path: String,
        /// New path
        new_path: String,
    },
    /// Read a symlink target
    Readlink {
        /// Client path
        path: String,
    },
    /// Create a symlink
    Symlink {
        /// Link to create
        link_path: String,
        /// Where it points
        target_path: String,
    },
    /// Vendor extension
    Extended {
        /// Extension name, e.g. `statvfs@openssh.com`
        name: String,
    },
    /// Request id was readable but the message type is not one a client sends
    Unknown {
        /// Raw type byte
        kind: u8,
    },
}

impl Request {
    /// Short lowercase operation name, used in logs and status messages
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Close { .. } => "close",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Lstat { .. } => "lstat",
            Self::Fstat { .. } => "fstat",
            Self::Setstat { .. } => "setstat",
            Self::Fsetstat { .. } => "fsetstat",
            Self::Opendir { .. } => "opendir",
            Self::Readdir { .. } => "readdir",
            Self::Remove { .. } => "remove",
            Self::Mkdir { .. } => "mkdir",
            Self::Rmdir { .. } => "rmdir",
            Self::Realpath { .. } => "realpath",
            Self::Stat { .. } => "stat",
            Self::Rename { .. } => "rename",
            Self::Readlink { .. } => "readlink",
            Self::Symlink { .. } => "symlink",
            Self::Extended { .. } => "extended",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// One decoded client packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Version negotiation; carries no request id
    Init {
        /// Client protocol version
        version: u32,
    },
    /// Any other request
    Request {
        /// Request id echoed in the reply
        id: u32,
        /// Decoded request
        request: Request,
    },
}

impl Packet {
    /// Decode a packet body (type byte onwards, length prefix stripped)
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Protocol`] for truncated or malformed
    /// payloads. A message type no client sends decodes to
    /// [`Request::Unknown`] once its request id has been read.
    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        let mut buf = data;
        let kind = codec::get_u8(&mut buf)?;

        if kind == MessageType::Init as u8 {
            let version = codec::get_u32(&mut buf)?;
            return Ok(Self::Init { version });
        }

        let id = codec::get_u32(&mut buf)?;
        let buf = &mut buf;

        let Ok(msg_type) = MessageType::try_from(kind) else {
            return Ok(Self::Request {
                id,
                request: Request::Unknown { kind },
            });
        };

        let request = match msg_type {
            MessageType::Open => Request::Open {
                filename: codec::get_string(buf)?,
                pflags: OpenFlags(codec::get_u32(buf)?),
                attrs: FileAttrs::decode(buf)?,
            },
            MessageType::Close => Request::Close {
                handle: codec::get_bytes(buf)?,
            },
            MessageType::Read => Request::Read {
                handle: codec::get_bytes(buf)?,
                offset: codec::get_u64(buf)?,
                len: codec::get_u32(buf)?,
            },
            MessageType::Write => Request::Write {
                handle: codec::get_bytes(buf)?,
                offset: codec::get_u64(buf)?,
                data: codec::get_bytes(buf)?,
            },
            MessageType::Lstat => Request::Lstat {
                path: codec::get_string(buf)?,
            },
            MessageType::Fstat => Request::Fstat {
                handle: codec::get_bytes(buf)?,
            },
            MessageType::Setstat => Request::Setstat {
                path: codec::get_string(buf)?,
                attrs: FileAttrs::decode(buf)?,
            },
            MessageType::Fsetstat => Request::Fsetstat {
                handle: codec::get_bytes(buf)?,
                attrs: FileAttrs::decode(buf)?,
            },
            MessageType::Opendir => Request::Opendir {
                path: codec::get_string(buf)?,
            },
            MessageType::Readdir => Request::Readdir {
                handle: codec::get_bytes(buf)?,
            },
            MessageType::Remove => Request::Remove {
                path: codec::get_string(buf)?,
            },
            MessageType::Mkdir => Request::Mkdir {
                path: codec::get_string(buf)?,
                attrs: FileAttrs::decode(buf)?,
            },
            MessageType::Rmdir => Request::Rmdir {
                path: codec::get_string(buf)?,
            },
            MessageType::Realpath => Request::Realpath {
                path: codec::get_string(buf)?,
            },
            MessageType::Stat => Request::Stat {
                path: codec::get_string(buf)?,
            },
            MessageType::Rename => Request::Rename {
                old_path: codec::get_string(buf)?,
                new_path: codec::get_string(buf)?,
            },
            MessageType::Readlink => Request::Readlink {
                path: codec::get_string(buf)?,
            },
            MessageType::Symlink => Request::Symlink {
                link_path: codec::get_string(buf)?,
                target_path: codec::get_string(buf)?,
            },
            // Extension payloads are opaque; only the name matters here
            MessageType::Extended => Request::Extended {
                name: codec::get_string(buf)?,
            },
            // Server-side types; INIT was handled above
            MessageType::Init
            | MessageType::Version
            | MessageType::Status
            | MessageType::Handle
            | MessageType::Data
            | MessageType::Name
            | MessageType::Attrs
            | MessageType::ExtendedReply => Request::Unknown { kind },
        };

        Ok(Self::Request { id, request })
    }

    /// Best-effort request id of a packet that failed to decode
    ///
    /// Lets the session answer a malformed request with a status instead of
    /// dropping the connection.
    pub fn peek_request_id(data: &[u8]) -> Option<u32> {
        match data {
            [kind, a, b, c, d, ..] if *kind != MessageType::Init as u8 => {
                Some(u32::from_be_bytes([*a, *b, *c, *d]))
            }
            _ => None,
        }
    }
}

/// One entry of a NAME response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    /// Bare name (or absolute path for REALPATH)
    pub filename: String,
    /// `ls -l` style line
    pub longname: String,
    /// Entry attributes
    pub attrs: FileAttrs,
}

/// Server response; exactly one is produced per request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Reply to INIT
    Version,
    /// STATUS with a code and a client-safe message
    Status {
        /// Status code
        code: StatusCode,
        /// Human-readable message
        message: String,
    },
    /// Newly issued wire handle
    Handle(Vec<u8>),
    /// File bytes
    Data(Vec<u8>),
    /// Directory entries or a resolved path
    Name(Vec<NameEntry>),
    /// File attributes
    Attrs(FileAttrs),
}

impl Response {
    /// OK status
    pub fn ok() -> Self {
        Self::status(StatusCode::Ok, "Success")
    }

    /// EOF status
    pub fn eof() -> Self {
        Self::status(StatusCode::Eof, "End of file")
    }

    /// Status with explicit code and message
    pub fn status(code: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    /// Status code, if this is a STATUS response
    pub const fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Encode as a packet body (no length prefix)
    pub fn encode(&self, request_id: u32) -> BytesMut {
        let mut response = BytesMut::new();

        match self {
            Self::Version => {
                response.put_u8(MessageType::Version as u8);
                response.put_u32(SFTP_VERSION);
            }
            Self::Status { code, message } => {
                response.put_u8(MessageType::Status as u8);
                response.put_u32(request_id);
                response.put_u32((*code).into());
                codec::put_string(&mut response, message);
                codec::put_string(&mut response, "en"); // language tag
            }
            Self::Handle(handle) => {
                response.put_u8(MessageType::Handle as u8);
                response.put_u32(request_id);
                codec::put_bytes(&mut response, handle);
            }
            Self::Data(data) => {
                response.put_u8(MessageType::Data as u8);
                response.put_u32(request_id);
                codec::put_bytes(&mut response, data);
            }
            Self::Name(entries) => {
                response.put_u8(MessageType::Name as u8);
                response.put_u32(request_id);
                response.put_u32(u32::try_from(entries.len()).unwrap_or(u32::MAX));
                for entry in entries {
                    codec::put_string(&mut response, &entry.filename);
                    codec::put_string(&mut response, &entry.longname);
                    response.put(entry.attrs.encode());
                }
            }
            Self::Attrs(attrs) => {
                response.put_u8(MessageType::Attrs as u8);
                response.put_u32(request_id);
                response.put(attrs.encode());
            }
        }

        response
    }
}

/// Helper functions for encoding/decoding SFTP protocol strings
pub mod codec {
    use bytes::{Buf, BufMut, BytesMut};

    fn need(buf: &[u8], n: usize, what: &str) -> crate::Result<()> {
        if buf.remaining() < n {
            return Err(crate::Error::Protocol(format!(
                "Insufficient data for {what}"
            )));
        }
        Ok(())
    }

    /// Decode a byte
    pub fn get_u8(buf: &mut &[u8]) -> crate::Result<u8> {
        need(buf, 1, "u8")?;
        Ok(buf.get_u8())
    }

    /// Decode a big-endian u32
    pub fn get_u32(buf: &mut &[u8]) -> crate::Result<u32> {
        need(buf, 4, "u32")?;
        Ok(buf.get_u32())
    }

    /// Decode a big-endian u64
    pub fn get_u64(buf: &mut &[u8]) -> crate::Result<u64> {
        need(buf, 8, "u64")?;
        Ok(buf.get_u64())
    }

    /// Encode a string as SFTP string (length + data)
    pub fn put_string(buf: &mut BytesMut, s: &str) {
        put_bytes(buf, s.as_bytes());
    }

    /// Decode an SFTP string
    pub fn get_string(buf: &mut &[u8]) -> crate::Result<String> {
        let bytes = get_bytes(buf)?;
        String::from_utf8(bytes)
            .map_err(|e| crate::Error::Protocol(format!("Invalid UTF-8 string: {e}")))
    }

    /// Encode bytes as SFTP string (length + data)
    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(u32::try_from(data.len()).unwrap_or(u32::MAX));
        buf.put_slice(data);
    }

    /// Decode SFTP bytes
    pub fn get_bytes(buf: &mut &[u8]) -> crate::Result<Vec<u8>> {
        let len = get_u32(buf)? as usize;
        need(buf, len, "bytes")?;

        let bytes = buf[..len].to_vec();
        buf.advance(len);

        Ok(bytes)
    }
}
