//! Error types for the request scheduler and the state machine engine.

use thiserror::Error;

use crate::types::{Errno, OpKind};

/// Result type alias for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Error variants for the request scheduler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// The request kind is never submitted to the scheduler.
    #[error("request kind {kind} cannot be scheduled")]
    Unschedulable {
        /// The rejected kind.
        kind: OpKind,
    },

    /// A per-handle index pointed past the end of the request's handle list.
    #[error("request index {index} out of range for {len} handles")]
    IndexOverflow {
        /// Requested index.
        index: usize,
        /// Number of handles in the request.
        len: usize,
    },

    /// No entry exists for the given id.
    #[error("unknown scheduler id {0}")]
    UnknownId(u64),

    /// The entry was asked to do something its current state forbids.
    #[error("scheduler id {id} is {status}, cannot {action}")]
    InvalidState {
        /// Entry id.
        id: u64,
        /// Current status name.
        status: &'static str,
        /// Attempted action.
        action: &'static str,
    },

    /// Unpost was called on an entry that already holds its slot.
    #[error("scheduler id {0} is already scheduled")]
    AlreadyScheduled(u64),

    /// The same id appeared twice in one batch test.
    #[error("scheduler id {0} listed more than once")]
    DuplicateId(u64),

    /// A timer deadline lies beyond what the clock can represent.
    #[error("timer duration of {secs}s overflows the clock")]
    DeadlineOverflow {
        /// Requested duration in whole seconds.
        secs: u64,
    },

    /// The request arena is full.
    #[error("scheduler capacity of {capacity} requests exhausted")]
    Exhausted {
        /// Configured capacity.
        capacity: usize,
    },
}

impl SchedError {
    /// Wire status equivalent of this error.
    pub fn errno(&self) -> Errno {
        match self {
            SchedError::Unschedulable { .. } => Errno::Inval,
            SchedError::IndexOverflow { .. } => Errno::Overflow,
            SchedError::UnknownId(_) => Errno::Inval,
            SchedError::InvalidState { .. } => Errno::Inval,
            SchedError::AlreadyScheduled(_) => Errno::Already,
            SchedError::DuplicateId(_) => Errno::Inval,
            SchedError::DeadlineOverflow { .. } => Errno::Overflow,
            SchedError::Exhausted { .. } => Errno::NoMem,
        }
    }
}

/// Error variants for the state machine engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A transition named a state that does not exist in its machine.
    #[error("machine {machine}: state {state} refers to unknown state {target}")]
    UnknownState {
        /// Machine being resolved.
        machine: String,
        /// State holding the bad transition.
        state: String,
        /// Missing target.
        target: String,
    },

    /// A jump or lookup named a machine that is not registered.
    #[error("unknown state machine {0}")]
    UnknownMachine(String),

    /// Two machines were registered under the same name.
    #[error("state machine {0} registered twice")]
    DuplicateMachine(String),

    /// A machine was built without states or a state without a default.
    #[error("machine {machine} is malformed: {reason}")]
    Malformed {
        /// Machine being built.
        machine: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Resolution reached a terminate marker; a transition is missing.
    #[error("machine {machine} state {state} took an invalid termination path on signal {signal}")]
    Terminated {
        /// Machine holding the state.
        machine: String,
        /// State whose transition terminated.
        state: String,
        /// Signal being resolved.
        signal: i32,
    },

    /// An action returned a fatal result.
    #[error("machine {machine} state {state} failed with code {code}")]
    ActionFailed {
        /// Machine holding the state.
        machine: String,
        /// Failing state.
        state: String,
        /// Raw negative result.
        code: i32,
    },

    /// The run was aborted by an earlier failure.
    #[error("state machine run already aborted")]
    Aborted,

    /// Nested machines exceeded the continuation stack.
    #[error("continuation stack overflow at depth {depth}")]
    StackOverflow {
        /// Configured bound.
        depth: usize,
    },

    /// A return marker was reached with no continuation to resume.
    #[error("continuation stack underflow in machine {machine}")]
    StackUnderflow {
        /// Machine that returned.
        machine: String,
    },

    /// The engine has been halted.
    #[error("state machine engine halted")]
    Halted,
}
