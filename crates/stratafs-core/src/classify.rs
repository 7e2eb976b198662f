//! Operation descriptor classifier.
//!
//! Maps every decoded request to the scheduling class the admission
//! scheduler works with: bypass, mode change, or a (handle, fs_id) target
//! plus the two flags used by the concurrency-bypass rules.

use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};
use crate::types::{FsId, Handle, IoType, ObjectRef, ServerMode, ServerParam, ServerRequest};

/// Per-object scheduling target of a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Object the request operates on.
    pub handle: Handle,
    /// File system of the object.
    pub fs_id: FsId,
    /// Whether the request modifies the object.
    pub mutates: bool,
    /// Whether the request is a bulk data transfer.
    pub is_bulk_io: bool,
    /// Repair operation, admissible in administrative mode.
    pub mgmt: bool,
}

impl Target {
    fn new(obj: ObjectRef, mutates: bool) -> Self {
        Self {
            handle: obj.handle,
            fs_id: obj.fs_id,
            mutates,
            is_bulk_io: false,
            mgmt: false,
        }
    }

    fn bulk(mut self) -> Self {
        self.is_bulk_io = true;
        self
    }

    fn mgmt(mut self) -> Self {
        self.mgmt = true;
        self
    }

    /// Shorthand used by tests and callers that classify by hand.
    pub fn object(handle: Handle, fs_id: FsId, mutates: bool, is_bulk_io: bool) -> Self {
        Self {
            handle,
            fs_id,
            mutates,
            is_bulk_io,
            mgmt: false,
        }
    }
}

/// Scheduling class of a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    /// No per-object conflict; admitted without queueing.
    Bypass {
        /// Whether the request modifies the file system.
        mutates: bool,
        /// Repair operation, admissible in administrative mode.
        mgmt: bool,
    },
    /// Switch of the global operating mode.
    ModeChange(ServerMode),
    /// Request bound to one object.
    Targeted(Target),
}

impl Classification {
    /// Whether this class modifies the file system.
    pub fn mutates(&self) -> bool {
        match self {
            Classification::Bypass { mutates, .. } => *mutates,
            Classification::ModeChange(_) => false,
            Classification::Targeted(t) => t.mutates,
        }
    }

    /// Whether this class is exempt from administrative-mode rejection.
    pub fn is_mgmt(&self) -> bool {
        match self {
            Classification::Bypass { mgmt, .. } => *mgmt,
            Classification::ModeChange(_) => true,
            Classification::Targeted(t) => t.mgmt,
        }
    }
}

const fn bypass(mutates: bool) -> Classification {
    Classification::Bypass {
        mutates,
        mgmt: false,
    }
}

/// Classifies a request for admission.
///
/// `req_index` selects one handle of a multi-handle request
/// (`MgmtDspaceInfoList`); other kinds ignore it.
pub fn classify(req: &ServerRequest, req_index: usize) -> SchedResult<Classification> {
    use ServerRequest as R;

    let class = match req {
        R::Create { .. } | R::Mkdir { .. } => bypass(true),
        R::MgmtSetParam { param, .. } => match param {
            ServerParam::Mode(mode) => Classification::ModeChange(*mode),
            ServerParam::EventMask(_) | ServerParam::PerfHistory(_) => bypass(false),
        },
        R::GetConfig
        | R::MgmtNoop
        | R::MgmtPerfMon
        | R::MgmtEventMon
        | R::MgmtIterateHandles { .. }
        | R::Statfs { .. } => bypass(false),

        R::Remove(obj) | R::Flush(obj) => Classification::Targeted(Target::new(*obj, true)),
        R::Setattr { target, .. }
        | R::Truncate { target, .. }
        | R::Seteattr { target, .. }
        | R::Deleattr { target, .. } => Classification::Targeted(Target::new(*target, true)),
        R::Crdirent { parent, .. } | R::Rmdirent { parent, .. } | R::Chdirent { parent, .. } => {
            Classification::Targeted(Target::new(*parent, true))
        }
        R::MgmtRemoveObject(obj) => Classification::Targeted(Target::new(*obj, true).mgmt()),
        R::MgmtRemoveDirent { parent, .. } => {
            Classification::Targeted(Target::new(*parent, true).mgmt())
        }

        R::Io {
            target, io_type, ..
        } => Classification::Targeted(Target::new(*target, *io_type == IoType::Write).bulk()),
        // small I/O carries its payload inline and is not eligible for the
        // concurrent I/O rule
        R::SmallIo {
            target, io_type, ..
        } => Classification::Targeted(Target::new(*target, *io_type == IoType::Write)),

        R::Getattr(obj) | R::Readdir(obj) | R::MgmtGetDirdataHandle(obj) | R::Listeattr(obj) => {
            Classification::Targeted(Target::new(*obj, false))
        }
        R::LookupPath { start, .. } => Classification::Targeted(Target::new(*start, false)),
        R::Geteattr { target, .. } => Classification::Targeted(Target::new(*target, false)),
        R::MgmtDspaceInfoList { fs_id, handles } => {
            let handle = handles
                .get(req_index)
                .copied()
                .ok_or(SchedError::IndexOverflow {
                    index: req_index,
                    len: handles.len(),
                })?;
            Classification::Targeted(Target::new(ObjectRef::new(handle, *fs_id), false))
        }

        R::WriteCompletion | R::PerfUpdate | R::JobTimer | R::ProtoError => {
            return Err(SchedError::Unschedulable { kind: req.kind() })
        }
    };
    Ok(class)
}
