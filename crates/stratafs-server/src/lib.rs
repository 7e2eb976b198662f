#![warn(missing_docs)]

//! StrataFS storage server: the collaborators around the core scheduler and
//! engine, wired into a runnable driver loop.
//!
//! Requests arrive as [`ClientRequest`]s, each served by a state machine
//! from [`machines`]. Machine actions post work through the [`job`] layer
//! (scheduler admission, object store access, timers, responses) and the
//! [`driver`] resumes them as that work completes.

pub mod config;
pub mod driver;
pub mod error;
pub mod job;
pub mod machines;
pub mod op;
pub mod ops_attr;
pub mod ops_common;
pub mod ops_io;
pub mod ops_mgmt;
pub mod ops_object;
pub mod perf;
pub mod store;

pub use config::{DriverConfig, LogFormat, ServerConfig, StoreConfig};
pub use driver::{DriverStats, Server};
pub use error::{ServerError, ServerResult};
pub use job::{JobCompletion, JobContext, JobIntervals};
pub use machines::{definitions, MachineTable};
pub use op::{ClientRequest, OpId, ResponseBody, ServerOp, ServerResponse};
pub use perf::{PerfHistory, PerfSample};
pub use store::{MemStore, ObjectAttr, ObjectStore, StatFs};
