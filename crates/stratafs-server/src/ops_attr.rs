//! Attribute operations: getattr, setattr, truncate.

use stratafs_core::{Errno, JobStatus, MachineDef, ServerRequest, StateDef, StepResult, Transition};

use crate::op::{ResponseBody, ServerOp};
use crate::ops_common::op_machine;
use crate::store::ObjectStore;

/// Machine name for getattr.
pub const GETATTR: &str = "getattr";
/// Machine name for setattr.
pub const SETATTR: &str = "setattr";
/// Machine name for truncate.
pub const TRUNCATE: &str = "truncate";

/// Answers with the attributes the prelude read.
pub fn getattr_machine() -> MachineDef<ServerOp> {
    op_machine(
        GETATTR,
        vec![StateDef::run("reply_attr", reply_attr).default(Transition::To("final"))],
    )
}

/// Applies an attribute update.
pub fn setattr_machine() -> MachineDef<ServerOp> {
    op_machine(
        SETATTR,
        vec![StateDef::run("write_attr", write_attr).default(Transition::To("final"))],
    )
}

/// Resizes an object.
pub fn truncate_machine() -> MachineDef<ServerOp> {
    op_machine(
        TRUNCATE,
        vec![StateDef::run("resize", resize).default(Transition::To("final"))],
    )
}

fn reply_attr(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    match op.attr {
        Some(attr) => op.body = ResponseBody::Attr(attr),
        None => *status = JobStatus::error(Errno::NoEnt),
    }
    StepResult::Complete
}

fn write_attr(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    let ServerRequest::Setattr { target, attr } = &op.request else {
        *status = JobStatus::error(Errno::Inval);
        return StepResult::Complete;
    };
    let (target, update) = (*target, attr.clone());
    op.jobs.post_store(op.id, move |store: &dyn ObjectStore| {
        store.setattr(target, &update).map(ResponseBody::Attr)
    });
    StepResult::Suspended
}

fn resize(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    let ServerRequest::Truncate { target, size } = op.request else {
        *status = JobStatus::error(Errno::Inval);
        return StepResult::Complete;
    };
    op.jobs.post_store(op.id, move |store: &dyn ObjectStore| {
        store.truncate(target, size).map(|_| ResponseBody::Empty)
    });
    StepResult::Suspended
}
