//! Data transfer operations: bulk I/O and small I/O.
//!
//! Both read or write a byte range of one object. Small I/O carries its
//! payload inline and is capped at [`SMALL_IO_MAX`] bytes.

use stratafs_core::{
    Errno, IoType, JobStatus, MachineDef, ServerRequest, StateDef, StepResult, Transition,
};
use tracing::debug;

use crate::op::{ResponseBody, ServerOp};
use crate::ops_common::op_machine;
use crate::store::ObjectStore;

/// Machine name for bulk I/O.
pub const IO: &str = "io";
/// Machine name for small I/O.
pub const SMALL_IO: &str = "small_io";
/// Largest payload small I/O accepts.
pub const SMALL_IO_MAX: u64 = 16 * 1024;

/// Bulk read or write.
pub fn io_machine() -> MachineDef<ServerOp> {
    op_machine(
        IO,
        vec![StateDef::run("transfer", transfer).default(Transition::To("final"))],
    )
}

/// Inline read or write.
pub fn small_io_machine() -> MachineDef<ServerOp> {
    op_machine(
        SMALL_IO,
        vec![
            StateDef::run("check_size", check_size)
                .on_success(Transition::To("transfer"))
                .default(Transition::To("final")),
            StateDef::run("transfer", transfer).default(Transition::To("final")),
        ],
    )
}

fn check_size(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    if let ServerRequest::SmallIo {
        io_type, len, data, ..
    } = &op.request
    {
        let size = match io_type {
            IoType::Read => *len,
            IoType::Write => data.len() as u64,
        };
        if size > SMALL_IO_MAX {
            debug!(op = %op.id, size, "small I/O payload too large");
            *status = JobStatus::error(Errno::Inval);
        }
    }
    StepResult::Complete
}

fn transfer(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    let (target, io_type, offset, len, data) = match &op.request {
        ServerRequest::Io {
            target,
            io_type,
            offset,
            len,
            data,
        }
        | ServerRequest::SmallIo {
            target,
            io_type,
            offset,
            len,
            data,
        } => (*target, *io_type, *offset, *len, data),
        _ => {
            *status = JobStatus::error(Errno::Inval);
            return StepResult::Complete;
        }
    };

    match io_type {
        IoType::Read => op.jobs.post_store(op.id, move |store: &dyn ObjectStore| {
            store.read(target, offset, len).map(ResponseBody::Data)
        }),
        IoType::Write => {
            let data = data.clone();
            op.jobs.post_store(op.id, move |store: &dyn ObjectStore| {
                store.write(target, offset, &data).map(ResponseBody::Written)
            })
        }
    }
    StepResult::Suspended
}
