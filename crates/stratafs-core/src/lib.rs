#![warn(missing_docs)]

//! StrataFS core: request admission scheduling and the state machine engine.
//!
//! This crate holds the two pieces every metadata server request passes
//! through. The scheduler decides when a request may touch its target
//! object, serializing conflicting work per handle while letting reads and
//! bulk I/O share an object, and gating a global administrative mode.
//! The engine runs the continuation-based state machines that implement
//! each request type.

pub mod classify;
pub mod engine;
pub mod error;
pub mod machine;
pub mod sched;
pub mod timer;
pub mod types;

pub use classify::{classify, Classification, Target};
pub use engine::{ContinuationStack, Engine, EngineConfig, Run};
pub use error::{EngineError, EngineResult, SchedError, SchedResult};
pub use machine::{
    ActionFn, JobStatus, MachineDef, MachineId, Signal, StateDef, StateId, StepResult, Transition,
    SUCCESS,
};
pub use sched::{
    Completion, Decision, RequestId, RequestStatus, Scheduler, SchedulerConfig, SchedulerStats,
    Ticket, TimerPost,
};
pub use timer::TimerQueue;
pub use types::{
    AttrUpdate, Errno, FsId, Handle, IoType, ObjectRef, OpKind, ServerMode, ServerParam,
    ServerRequest,
};
