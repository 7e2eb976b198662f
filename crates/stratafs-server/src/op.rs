//! Per-operation context and the client-facing request/response records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use stratafs_core::{Errno, Handle, OpKind, RequestId, ServerRequest, Ticket};

use crate::job::JobContext;
use crate::perf::PerfSample;
use crate::store::{ObjectAttr, StatFs};

/// Driver-assigned identifier of an in-flight operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(u64);

impl OpId {
    /// Creates an OpId from a raw value
    pub fn new(id: u64) -> Self {
        OpId(id)
    }

    /// Returns the raw u64 value of this id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded request together with the client's correlation tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Echoed back in the response.
    pub tag: u64,
    /// The request itself.
    pub request: ServerRequest,
}

/// Payload of a response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    /// Status only.
    #[default]
    Empty,
    /// Object attributes.
    Attr(ObjectAttr),
    /// Handle of a new object.
    Created(Handle),
    /// Bytes read.
    Data(Vec<u8>),
    /// Number of bytes written.
    Written(u64),
    /// File system usage.
    Statfs(StatFs),
    /// Performance history, oldest first.
    PerfSamples(Vec<PerfSample>),
}

/// Response sent back to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResponse {
    /// Tag of the request being answered.
    pub tag: u64,
    /// Kind of the request being answered.
    pub kind: OpKind,
    /// Zero or a negative errno.
    pub status: i32,
    /// Payload; `Empty` on failure.
    pub body: ResponseBody,
}

impl ServerResponse {
    /// Builds an error response.
    pub fn error(tag: u64, kind: OpKind, errno: Errno) -> Self {
        Self {
            tag,
            kind,
            status: errno.code(),
            body: ResponseBody::Empty,
        }
    }

    /// Whether the request succeeded.
    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// State carried by one operation through its state machine.
pub struct ServerOp {
    /// Driver id; user data for every job this op posts.
    pub id: OpId,
    /// Client tag, `None` for internal operations.
    pub tag: Option<u64>,
    /// The request being served.
    pub request: ServerRequest,
    /// Async collaborators.
    pub jobs: Arc<JobContext>,
    /// Scheduler ticket held while the op runs.
    pub ticket: Option<Ticket>,
    /// Pending timer entry, if the op is waiting on one.
    pub timer: Option<RequestId>,
    /// Attributes fetched by the prelude.
    pub attr: Option<ObjectAttr>,
    /// Response payload under construction.
    pub body: ResponseBody,
    /// Status reported to the client.
    pub reply_status: i32,
    /// Set by the final state; the driver drops the op afterwards.
    pub completed: bool,
}

impl ServerOp {
    /// Context for a client request.
    pub fn new(id: OpId, tag: u64, request: ServerRequest, jobs: Arc<JobContext>) -> Self {
        Self::build(id, Some(tag), request, jobs)
    }

    /// Context for a server-internal operation.
    pub fn internal(id: OpId, request: ServerRequest, jobs: Arc<JobContext>) -> Self {
        Self::build(id, None, request, jobs)
    }

    fn build(id: OpId, tag: Option<u64>, request: ServerRequest, jobs: Arc<JobContext>) -> Self {
        Self {
            id,
            tag,
            request,
            jobs,
            ticket: None,
            timer: None,
            attr: None,
            body: ResponseBody::Empty,
            reply_status: 0,
            completed: false,
        }
    }

    /// Kind of the request.
    pub fn kind(&self) -> OpKind {
        self.request.kind()
    }

    /// Whether the driver started this op on its own.
    pub fn is_internal(&self) -> bool {
        self.tag.is_none()
    }

    /// Records a failure to report, keeping the first one seen.
    pub fn fail(&mut self, code: i32) {
        if self.reply_status == 0 {
            self.reply_status = code;
        }
    }

    /// The response for this op in its current state.
    pub fn response(&self) -> Option<ServerResponse> {
        let tag = self.tag?;
        let body = if self.reply_status == 0 {
            self.body.clone()
        } else {
            ResponseBody::Empty
        };
        Some(ServerResponse {
            tag,
            kind: self.kind(),
            status: self.reply_status,
            body,
        })
    }
}

impl fmt::Debug for ServerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOp")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("kind", &self.kind())
            .field("ticket", &self.ticket)
            .field("reply_status", &self.reply_status)
            .field("completed", &self.completed)
            .finish()
    }
}
