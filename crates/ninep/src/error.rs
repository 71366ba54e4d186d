//! Error types for the 9P protocol engine.
//!
//! Mirrors the taxonomy of protocol-level failures (§7 of the design
//! document this crate implements): codec errors, dispatcher errors,
//! auth errors and transport errors all funnel into [`Error`], which
//! the server dispatcher turns into `Rerror` and the client
//! multiplexer surfaces to callers verbatim.

use std::fmt;
use std::io;

/// errno-like numeric codes used by backends and the dispatcher.
///
/// These are the subset of POSIX errno values this crate's
/// backends and reference implementations actually raise; they are
/// not interpreted by the wire codec, only carried in `Rerror` text
/// and exposed to backends that want a stable numeric code alongside
/// the human-readable string.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
    pub const EACCES: i32 = 13;
    pub const EEXIST: i32 = 17;
    pub const ENOTDIR: i32 = 20;
    pub const EISDIR: i32 = 21;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const EPROTO: i32 = 71;
    pub const ENOSYS: i32 = 38;
    pub const ETIMEDOUT: i32 = 110;
}

/// The protocol-level error kinds of §7.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProtoKind {
    ShortBuffer,
    MalformedMessage,
    UnknownVersion,
    UnknownType,
    UnknownFid,
    FidInUse,
    FidExhausted,
    TagExhausted,
    AuthRequired,
    AuthFailed,
    AuthTimeout,
    NotSupported,
    Timeout,
    TransportError,
}

impl ProtoKind {
    /// A conventional errno for this kind, used by backends/tests that
    /// want a stable number alongside the text.
    pub fn errno(&self) -> i32 {
        use errno::*;
        match self {
            ProtoKind::ShortBuffer => EINVAL,
            ProtoKind::MalformedMessage => EINVAL,
            ProtoKind::UnknownVersion => EPROTO,
            ProtoKind::UnknownType => ENOSYS,
            ProtoKind::UnknownFid => EBADF,
            ProtoKind::FidInUse => EINVAL,
            ProtoKind::FidExhausted => ENOSPC,
            ProtoKind::TagExhausted => ENOSPC,
            ProtoKind::AuthRequired => EPERM,
            ProtoKind::AuthFailed => EPERM,
            ProtoKind::AuthTimeout => ETIMEDOUT,
            ProtoKind::NotSupported => ENOSYS,
            ProtoKind::Timeout => ETIMEDOUT,
            ProtoKind::TransportError => EIO,
        }
    }
}

impl fmt::Display for ProtoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtoKind::ShortBuffer => "buffer too small",
            ProtoKind::MalformedMessage => "malformed message",
            ProtoKind::UnknownVersion => "unknown version",
            ProtoKind::UnknownType => "operation not supported",
            ProtoKind::UnknownFid => "unknown fid",
            ProtoKind::FidInUse => "FID already in use",
            ProtoKind::FidExhausted => "cannot allocate fid",
            ProtoKind::TagExhausted => "cannot allocate tag",
            ProtoKind::AuthRequired => "authentication required",
            ProtoKind::AuthFailed => "authentication failed",
            ProtoKind::AuthTimeout => "authentication challenge expired",
            ProtoKind::NotSupported => "not supported",
            ProtoKind::Timeout => "request timed out",
            ProtoKind::TransportError => "transport error",
        };
        f.write_str(s)
    }
}

/// The crate-wide error type.
///
/// Every handler in the dispatcher and every helper in the client
/// multiplexer returns `Result<T, Error>`; the dispatcher converts any
/// `Err` into `Rerror` with [`Error::to_string`] as `ename`.
#[derive(Debug)]
pub enum Error {
    /// Protocol-level failure with a specific kind from §7.
    Proto(ProtoKind, String),
    /// A backend returned application-specific failure text.
    Backend(String),
    /// The underlying transport or I/O layer failed.
    Io(io::Error),
}

impl Error {
    pub fn proto(kind: ProtoKind) -> Error {
        let msg = kind.to_string();
        Error::Proto(kind, msg)
    }

    pub fn proto_msg(kind: ProtoKind, msg: impl Into<String>) -> Error {
        Error::Proto(kind, msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Error {
        Error::Backend(msg.into())
    }

    /// The errno this error should be reported as, for callers that
    /// want a stable numeric code next to the text (e.g. tests).
    pub fn errno(&self) -> i32 {
        match self {
            Error::Proto(kind, _) => kind.errno(),
            Error::Backend(_) => errno::EIO,
            Error::Io(_) => errno::EIO,
        }
    }

    /// The text to put in `Rerror.ename` / surface to the client.
    pub fn ename(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Proto(_, msg) => f.write_str(msg),
            Error::Backend(msg) => f.write_str(msg),
            Error::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}
