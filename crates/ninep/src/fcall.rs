//! 9P2000 protocol data types and constants.
//!
//! # Protocol
//! 9P2000 (the base protocol; 9P2000.u/.L extensions are out of scope)

use std::mem::size_of;

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// The version string that comes with Rversion when the server does not
/// understand the client's version string
pub const VERSION_UNKNOWN: &str = "unknown";

/// Special tag which Tversion/Rversion must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which Tattach with no auth must use as `afid`
pub const NOFID: u32 = !0;

/// Maximum number of path elements a single Twalk may carry
pub const MAXWELEM: usize = 16;

/// Ample room for a Tread/Twrite header: size[4] type[1] tag[2] fid[4]
/// offset[8] count[4]
pub const IOHDRSZ: u32 = 23;

/// v9fs default port
pub const V9FS_PORT: u16 = 564;

/// Maximum length of a 9P wire string, per §9 of the design document.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Open mode values. The type of I/O to check against the permissions
/// for the file, plus the OR-able flags.
pub mod om {
    pub const READ: u8 = 0;
    pub const WRITE: u8 = 1;
    pub const RDWR: u8 = 2;
    pub const EXEC: u8 = 3;
    /// Or'ed in, truncate file first
    pub const TRUNC: u8 = 0x10;
    /// Or'ed in, remove on close
    pub const RCLOSE: u8 = 0x40;
}

/// Bits in `Stat.mode` (permission mode, not `QId.typ`).
pub mod dm {
    pub const DIR: u32 = 0x80000000;
    pub const APPEND: u32 = 0x40000000;
    pub const EXCL: u32 = 0x20000000;
    pub const MOUNT: u32 = 0x10000000;
    pub const AUTH: u32 = 0x08000000;
    pub const TMP: u32 = 0x04000000;
    pub const READ: u32 = 0x4;
    pub const WRITE: u32 = 0x2;
    pub const EXEC: u32 = 0x1;
}

bitflags! {
    /// Bits in `QId.typ`.
    ///
    /// QIdType can be constructed from `std::fs::FileType` via `From`.
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QIdType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

impl From<::std::fs::FileType> for QIdType {
    fn from(typ: ::std::fs::FileType) -> Self {
        From::from(&typ)
    }
}

impl<'a> From<&'a ::std::fs::FileType> for QIdType {
    fn from(typ: &'a ::std::fs::FileType) -> Self {
        if typ.is_dir() {
            QIdType::DIR
        } else {
            QIdType::FILE
        }
    }
}

/// The server-assigned unique identity of a file at a point in time.
///
/// Invariant: two files coexisting at the server at the same time have
/// distinct `(typ, path)`; a `path` value may be reissued after the
/// file it named has been removed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct QId {
    pub typ: QIdType,
    /// Bumped by the server whenever the file's content changes
    pub version: u32,
    /// Unique among all files simultaneously present in the hierarchy
    pub path: u64,
}

impl QId {
    /// A `QId` is always exactly 13 bytes on the wire.
    pub const SIZE: u32 = 13;

    pub fn size(&self) -> u32 {
        Self::SIZE
    }
}

/// 9P2000 file metadata, as carried by Tstat/Rstat/Twstat and by the
/// concatenated records a directory read returns.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// Server type, set by client requests to 0 and by convention
    /// assigned by the server for `Twstat` "don't touch" sentinel use
    pub typ: u16,
    pub dev: u32,
    pub qid: QId,
    /// Permission bits, with `dm::DIR` et al. for the type bits
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
}

impl Stat {
    /// Size of the encoded fields, NOT including the two-byte outer
    /// size prefix itself. This is the value written as that prefix.
    pub fn size(&self) -> u16 {
        (size_of::<u16>() // typ
            + size_of::<u32>() // dev
            + QId::SIZE as usize
            + size_of::<u32>() // mode
            + size_of::<u32>() // atime
            + size_of::<u32>() // mtime
            + size_of::<u64>() // length
            + (size_of::<u16>() * 4) // 4 string length prefixes
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len()) as u16
    }

    /// A `Stat` used as a Twstat "don't touch this field" sentinel:
    /// numeric fields all-ones, strings empty.
    pub fn dont_touch() -> Stat {
        Stat {
            typ: !0,
            dev: !0,
            qid: QId {
                typ: QIdType::empty(),
                version: !0,
                path: !0,
            },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }
}

/// Data type used in Rread and Twrite.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    /// 9P2000 message type, the wire byte identifying each T/R pair.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        TVersion    = 100,
        RVersion    = 101,
        TAuth       = 102,
        RAuth       = 103,
        TAttach     = 104,
        RAttach     = 105,
        // TError = 106, illegal, never sent
        RError      = 107,
        TFlush      = 108,
        RFlush      = 109,
        TWalk       = 110,
        RWalk       = 111,
        TOpen       = 112,
        ROpen       = 113,
        TCreate     = 114,
        RCreate     = 115,
        TRead       = 116,
        RRead       = 117,
        TWrite      = 118,
        RWrite      = 119,
        TClunk      = 120,
        RClunk      = 121,
        TRemove     = 122,
        RRemove     = 123,
        TStat       = 124,
        RStat       = 125,
        TWStat      = 126,
        RWStat      = 127,
    }
}

impl MsgType {
    /// True for T-messages (requests).
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// True for R-messages (responses), including `RError`.
    pub fn is_r(&self) -> bool {
        use MsgType::*;
        matches!(
            *self,
            RVersion | RAuth | RAttach | RError | RFlush | RWalk | ROpen | RCreate | RRead
                | RWrite | RClunk | RRemove | RStat | RWStat
        )
    }
}

impl<'a> From<&'a FCall> for MsgType {
    fn from(fcall: &'a FCall) -> MsgType {
        match *fcall {
            FCall::TVersion { .. } => MsgType::TVersion,
            FCall::RVersion { .. } => MsgType::RVersion,
            FCall::TAuth { .. } => MsgType::TAuth,
            FCall::RAuth { .. } => MsgType::RAuth,
            FCall::TAttach { .. } => MsgType::TAttach,
            FCall::RAttach { .. } => MsgType::RAttach,
            FCall::RError { .. } => MsgType::RError,
            FCall::TFlush { .. } => MsgType::TFlush,
            FCall::RFlush => MsgType::RFlush,
            FCall::TWalk { .. } => MsgType::TWalk,
            FCall::RWalk { .. } => MsgType::RWalk,
            FCall::TOpen { .. } => MsgType::TOpen,
            FCall::ROpen { .. } => MsgType::ROpen,
            FCall::TCreate { .. } => MsgType::TCreate,
            FCall::RCreate { .. } => MsgType::RCreate,
            FCall::TRead { .. } => MsgType::TRead,
            FCall::RRead { .. } => MsgType::RRead,
            FCall::TWrite { .. } => MsgType::TWrite,
            FCall::RWrite { .. } => MsgType::RWrite,
            FCall::TClunk { .. } => MsgType::TClunk,
            FCall::RClunk => MsgType::RClunk,
            FCall::TRemove { .. } => MsgType::TRemove,
            FCall::RRemove => MsgType::RRemove,
            FCall::TStat { .. } => MsgType::TStat,
            FCall::RStat { .. } => MsgType::RStat,
            FCall::TWStat { .. } => MsgType::TWStat,
            FCall::RWStat => MsgType::RWStat,
        }
    }
}

/// A data type encapsulating the 9P2000 T/R messages of §4.1.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    TVersion {
        msize: u32,
        version: String,
    },
    RVersion {
        msize: u32,
        version: String,
    },
    TAuth {
        afid: u32,
        uname: String,
        aname: String,
    },
    RAuth {
        aqid: QId,
    },
    TAttach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    RAttach {
        qid: QId,
    },
    RError {
        ename: String,
    },
    TFlush {
        oldtag: u16,
    },
    RFlush,
    TWalk {
        fid: u32,
        newfid: u32,
        wname: Vec<String>,
    },
    RWalk {
        wqid: Vec<QId>,
    },
    TOpen {
        fid: u32,
        mode: u8,
    },
    ROpen {
        qid: QId,
        iounit: u32,
    },
    TCreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
    },
    RCreate {
        qid: QId,
        iounit: u32,
    },
    TRead {
        fid: u32,
        offset: u64,
        count: u32,
    },
    RRead {
        data: Data,
    },
    TWrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    RWrite {
        count: u32,
    },
    TClunk {
        fid: u32,
    },
    RClunk,
    TRemove {
        fid: u32,
    },
    RRemove,
    TStat {
        fid: u32,
    },
    RStat {
        stat: Stat,
    },
    TWStat {
        fid: u32,
        stat: Stat,
    },
    RWStat,
}

impl FCall {
    /// The fid(s) this message references, for dispatcher lookups.
    /// `Tattach`'s `afid` is included only when it is not `NOFID`.
    pub fn fids(&self) -> Vec<u32> {
        match *self {
            FCall::TAttach { afid, .. } if afid != NOFID => vec![afid],
            FCall::TWalk { fid, .. } => vec![fid],
            FCall::TOpen { fid, .. } => vec![fid],
            FCall::TCreate { fid, .. } => vec![fid],
            FCall::TRead { fid, .. } => vec![fid],
            FCall::TWrite { fid, .. } => vec![fid],
            FCall::TClunk { fid } => vec![fid],
            FCall::TRemove { fid } => vec![fid],
            FCall::TStat { fid } => vec![fid],
            FCall::TWStat { fid, .. } => vec![fid],
            _ => Vec::new(),
        }
    }

    /// The fid this message allocates, if any (`Tauth`'s `afid`,
    /// `Tattach`'s `fid`, `Twalk`'s `newfid`).
    pub fn newfid(&self) -> Option<u32> {
        match *self {
            FCall::TAuth { afid, .. } => Some(afid),
            FCall::TAttach { fid, .. } => Some(fid),
            FCall::TWalk { newfid, .. } => Some(newfid),
            _ => None,
        }
    }
}

/// Envelope for 9P messages: the tag chosen by the requester, echoed
/// unchanged on the matching response.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    pub tag: u16,
    pub body: FCall,
}
