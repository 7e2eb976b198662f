//! Core identifiers and the decoded request record shared by the scheduler,
//! the engine and the server's operation state machines.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a storage object on one server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(u64);

impl Handle {
    /// The null handle, never assigned to a real object.
    pub const NULL: Handle = Handle(0);

    /// Creates a new Handle from a raw u64 value
    pub const fn new(h: u64) -> Self {
        Handle(h)
    }

    /// Returns the raw u64 value of this handle
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true for the null handle
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the logical file system collection a handle belongs to
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FsId(u32);

impl FsId {
    /// Creates a new FsId from a raw u32 value
    pub const fn new(id: u32) -> Self {
        FsId(id)
    }

    /// Returns the raw u32 value of this file system id
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A (handle, file system) pair naming one object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Target object handle
    pub handle: Handle,
    /// File system the handle lives in
    pub fs_id: FsId,
}

impl ObjectRef {
    /// Creates a new object reference
    pub const fn new(handle: Handle, fs_id: FsId) -> Self {
        Self { handle, fs_id }
    }
}

/// Global operating mode of a server.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerMode {
    /// Ordinary service, mutating requests are admitted.
    #[default]
    Normal,
    /// Maintenance mode, ordinary mutating requests are rejected.
    Administrative,
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMode::Normal => write!(f, "normal"),
            ServerMode::Administrative => write!(f, "admin"),
        }
    }
}

/// Direction of a data transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoType {
    /// Read bytes from the object
    Read,
    /// Write bytes to the object
    Write,
}

/// Attribute fields a client may change with setattr.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrUpdate {
    /// New permission bits
    pub mode: Option<u32>,
    /// New owner
    pub uid: Option<u32>,
    /// New group
    pub gid: Option<u32>,
}

/// Runtime parameters settable through the management interface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerParam {
    /// Switch the server's operating mode
    Mode(ServerMode),
    /// Replace the event monitoring mask
    EventMask(u64),
    /// Resize the performance history
    PerfHistory(u32),
}

/// A decoded request as handed over by the wire protocol layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRequest {
    /// Create a new data space object
    Create {
        /// Destination file system
        fs_id: FsId,
    },
    /// Remove an object
    Remove(ObjectRef),
    /// Bulk data transfer
    Io {
        /// Target object
        target: ObjectRef,
        /// Read or write
        io_type: IoType,
        /// Byte offset
        offset: u64,
        /// Bytes to read
        len: u64,
        /// Payload for writes
        data: Vec<u8>,
    },
    /// Data transfer small enough to travel inside the request
    SmallIo {
        /// Target object
        target: ObjectRef,
        /// Read or write
        io_type: IoType,
        /// Byte offset
        offset: u64,
        /// Bytes to read
        len: u64,
        /// Payload for writes
        data: Vec<u8>,
    },
    /// Read object attributes
    Getattr(ObjectRef),
    /// Change object attributes
    Setattr {
        /// Target object
        target: ObjectRef,
        /// Fields to change
        attr: AttrUpdate,
    },
    /// Resolve a path starting at a directory
    LookupPath {
        /// Directory the lookup starts from
        start: ObjectRef,
        /// Relative path
        path: String,
    },
    /// Create a directory entry
    Crdirent {
        /// Parent directory
        parent: ObjectRef,
        /// Entry name
        name: String,
        /// Object the entry points at
        new_handle: Handle,
    },
    /// Remove a directory entry
    Rmdirent {
        /// Parent directory
        parent: ObjectRef,
        /// Entry name
        name: String,
    },
    /// Repoint a directory entry
    Chdirent {
        /// Parent directory
        parent: ObjectRef,
        /// Entry name
        name: String,
        /// New target of the entry
        new_handle: Handle,
    },
    /// Change an object's size
    Truncate {
        /// Target object
        target: ObjectRef,
        /// New size in bytes
        size: u64,
    },
    /// Create a directory object
    Mkdir {
        /// Destination file system
        fs_id: FsId,
    },
    /// List directory entries
    Readdir(ObjectRef),
    /// Fetch server configuration
    GetConfig,
    /// Flush object data to stable storage
    Flush(ObjectRef),
    /// Set a runtime parameter
    MgmtSetParam {
        /// File system the parameter applies to
        fs_id: FsId,
        /// Parameter and value
        param: ServerParam,
    },
    /// Management no-op, used to probe liveness
    MgmtNoop,
    /// Fetch performance counters
    MgmtPerfMon,
    /// Fetch event monitor records
    MgmtEventMon,
    /// Iterate all handles of a file system
    MgmtIterateHandles {
        /// File system to iterate
        fs_id: FsId,
    },
    /// Fetch storage details for a list of handles
    MgmtDspaceInfoList {
        /// File system the handles belong to
        fs_id: FsId,
        /// Handles to inspect
        handles: Vec<Handle>,
    },
    /// Remove an object without touching directories (repair)
    MgmtRemoveObject(ObjectRef),
    /// Remove a dangling directory entry (repair)
    MgmtRemoveDirent {
        /// Parent directory
        parent: ObjectRef,
        /// Entry name
        name: String,
    },
    /// Find the directory data handle of a directory
    MgmtGetDirdataHandle(ObjectRef),
    /// Read extended attributes
    Geteattr {
        /// Target object
        target: ObjectRef,
        /// Keys to read
        keys: Vec<String>,
    },
    /// Write extended attributes
    Seteattr {
        /// Target object
        target: ObjectRef,
        /// Key/value pairs to write
        pairs: Vec<(String, Vec<u8>)>,
    },
    /// Delete an extended attribute
    Deleattr {
        /// Target object
        target: ObjectRef,
        /// Key to delete
        key: String,
    },
    /// List extended attribute keys
    Listeattr(ObjectRef),
    /// File system usage statistics
    Statfs {
        /// File system to report on
        fs_id: FsId,
    },
    /// Internal: completion of a flow-based write
    WriteCompletion,
    /// Internal: periodic performance counter rollover
    PerfUpdate,
    /// Internal: periodic job timeout sweep
    JobTimer,
    /// Internal: request that failed protocol decoding
    ProtoError,
}

/// Fieldless discriminant of [`ServerRequest`], used to look up state machines.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum OpKind {
    Create,
    Remove,
    Io,
    SmallIo,
    Getattr,
    Setattr,
    LookupPath,
    Crdirent,
    Rmdirent,
    Chdirent,
    Truncate,
    Mkdir,
    Readdir,
    GetConfig,
    Flush,
    MgmtSetParam,
    MgmtNoop,
    MgmtPerfMon,
    MgmtEventMon,
    MgmtIterateHandles,
    MgmtDspaceInfoList,
    MgmtRemoveObject,
    MgmtRemoveDirent,
    MgmtGetDirdataHandle,
    Geteattr,
    Seteattr,
    Deleattr,
    Listeattr,
    Statfs,
    WriteCompletion,
    PerfUpdate,
    JobTimer,
    ProtoError,
}

impl OpKind {
    /// Repair operations that stay admissible in administrative mode.
    pub fn is_mgmt_repair(&self) -> bool {
        matches!(self, OpKind::MgmtRemoveObject | OpKind::MgmtRemoveDirent)
    }

    /// Kinds generated inside the server rather than received from a client.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            OpKind::WriteCompletion | OpKind::PerfUpdate | OpKind::JobTimer | OpKind::ProtoError
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl ServerRequest {
    /// Returns the discriminant of this request.
    pub fn kind(&self) -> OpKind {
        match self {
            ServerRequest::Create { .. } => OpKind::Create,
            ServerRequest::Remove(_) => OpKind::Remove,
            ServerRequest::Io { .. } => OpKind::Io,
            ServerRequest::SmallIo { .. } => OpKind::SmallIo,
            ServerRequest::Getattr(_) => OpKind::Getattr,
            ServerRequest::Setattr { .. } => OpKind::Setattr,
            ServerRequest::LookupPath { .. } => OpKind::LookupPath,
            ServerRequest::Crdirent { .. } => OpKind::Crdirent,
            ServerRequest::Rmdirent { .. } => OpKind::Rmdirent,
            ServerRequest::Chdirent { .. } => OpKind::Chdirent,
            ServerRequest::Truncate { .. } => OpKind::Truncate,
            ServerRequest::Mkdir { .. } => OpKind::Mkdir,
            ServerRequest::Readdir(_) => OpKind::Readdir,
            ServerRequest::GetConfig => OpKind::GetConfig,
            ServerRequest::Flush(_) => OpKind::Flush,
            ServerRequest::MgmtSetParam { .. } => OpKind::MgmtSetParam,
            ServerRequest::MgmtNoop => OpKind::MgmtNoop,
            ServerRequest::MgmtPerfMon => OpKind::MgmtPerfMon,
            ServerRequest::MgmtEventMon => OpKind::MgmtEventMon,
            ServerRequest::MgmtIterateHandles { .. } => OpKind::MgmtIterateHandles,
            ServerRequest::MgmtDspaceInfoList { .. } => OpKind::MgmtDspaceInfoList,
            ServerRequest::MgmtRemoveObject(_) => OpKind::MgmtRemoveObject,
            ServerRequest::MgmtRemoveDirent { .. } => OpKind::MgmtRemoveDirent,
            ServerRequest::MgmtGetDirdataHandle(_) => OpKind::MgmtGetDirdataHandle,
            ServerRequest::Geteattr { .. } => OpKind::Geteattr,
            ServerRequest::Seteattr { .. } => OpKind::Seteattr,
            ServerRequest::Deleattr { .. } => OpKind::Deleattr,
            ServerRequest::Listeattr(_) => OpKind::Listeattr,
            ServerRequest::Statfs { .. } => OpKind::Statfs,
            ServerRequest::WriteCompletion => OpKind::WriteCompletion,
            ServerRequest::PerfUpdate => OpKind::PerfUpdate,
            ServerRequest::JobTimer => OpKind::JobTimer,
            ServerRequest::ProtoError => OpKind::ProtoError,
        }
    }
}

/// Error numbers carried in job status codes, always negative on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Errno {
    Perm,
    NoEnt,
    Again,
    NoMem,
    Exist,
    NotDir,
    Inval,
    NoSpc,
    NoSys,
    Overflow,
    Already,
}

impl Errno {
    /// Returns the negative status code for this error.
    pub fn code(&self) -> i32 {
        -match self {
            Errno::Perm => 1,
            Errno::NoEnt => 2,
            Errno::Again => 11,
            Errno::NoMem => 12,
            Errno::Exist => 17,
            Errno::NotDir => 20,
            Errno::Inval => 22,
            Errno::NoSpc => 28,
            Errno::NoSys => 38,
            Errno::Overflow => 75,
            Errno::Already => 114,
        }
    }

    /// Maps a status code back to an errno, if it is one we know.
    pub fn from_code(code: i32) -> Option<Errno> {
        [
            Errno::Perm,
            Errno::NoEnt,
            Errno::Again,
            Errno::NoMem,
            Errno::Exist,
            Errno::NotDir,
            Errno::Inval,
            Errno::NoSpc,
            Errno::NoSys,
            Errno::Overflow,
            Errno::Already,
        ]
        .into_iter()
        .find(|e| e.code() == code)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errno::Perm => "EPERM",
            Errno::NoEnt => "ENOENT",
            Errno::Again => "EAGAIN",
            Errno::NoMem => "ENOMEM",
            Errno::Exist => "EEXIST",
            Errno::NotDir => "ENOTDIR",
            Errno::Inval => "EINVAL",
            Errno::NoSpc => "ENOSPC",
            Errno::NoSys => "ENOSYS",
            Errno::Overflow => "EOVERFLOW",
            Errno::Already => "EALREADY",
        };
        f.write_str(name)
    }
}
