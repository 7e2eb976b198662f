//! Machines and actions shared by every operation.
//!
//! Each client operation is laid out the same way: a `prelude` call that
//! admits the request through the scheduler and reads the target's
//! attributes, the operation's own states, then a `final_response` call
//! that releases the scheduler ticket and answers the client.

use std::time::Duration;

use stratafs_core::{
    Decision, Errno, JobStatus, MachineDef, ObjectRef, ServerRequest, StateDef, StepResult, Ticket,
    TimerPost, Transition,
};
use tracing::{debug, warn};

use crate::op::{ResponseBody, ServerOp};
use crate::store::ObjectStore;

/// Admission and attribute fetch.
pub const PRELUDE: &str = "prelude";
/// Ticket release and response.
pub const FINAL_RESPONSE: &str = "final_response";

/// Object whose attributes the prelude reads, if any.
pub fn target_object(req: &ServerRequest) -> Option<ObjectRef> {
    match req {
        ServerRequest::Getattr(obj) | ServerRequest::Remove(obj) => Some(*obj),
        ServerRequest::Setattr { target, .. }
        | ServerRequest::Truncate { target, .. }
        | ServerRequest::Io { target, .. }
        | ServerRequest::SmallIo { target, .. } => Some(*target),
        _ => None,
    }
}

/// The shared admission machine.
pub fn prelude_machine() -> MachineDef<ServerOp> {
    MachineDef::new(PRELUDE)
        .state(
            StateDef::run("schedule", schedule)
                .on_success(Transition::To("read_attr"))
                .default(Transition::Return),
        )
        .state(
            StateDef::run("read_attr", read_attr)
                .on_success(Transition::To("keep_attr"))
                .default(Transition::Return),
        )
        .state(StateDef::run("keep_attr", keep_attr).default(Transition::Return))
}

/// The shared response machine.
pub fn final_response_machine() -> MachineDef<ServerOp> {
    MachineDef::new(FINAL_RESPONSE)
        .state(StateDef::run("release", release).default(Transition::To("send")))
        .state(StateDef::run("send", send_response).default(Transition::Return))
}

/// Builds a client operation machine around `work`.
///
/// `work` states should route to `"final"` when they are done; the first
/// one runs after a successful prelude.
pub fn op_machine(name: &'static str, work: Vec<StateDef<ServerOp>>) -> MachineDef<ServerOp> {
    let first = work.first().map_or("final", |s| s.name());
    let mut def = MachineDef::new(name).state(
        StateDef::call("prelude", PRELUDE)
            .on_success(Transition::To(first))
            .default(Transition::To("final")),
    );
    for state in work {
        def = def.state(state);
    }
    def.state(StateDef::call("final", FINAL_RESPONSE).default(Transition::To("cleanup")))
        .state(StateDef::run("cleanup", complete).default(Transition::Terminate))
}

fn schedule(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    match op.jobs.post_sched(op.id, &op.request) {
        Ok(Decision::RunImmediately(ticket)) => {
            op.ticket = Some(ticket);
            *status = JobStatus::success();
            StepResult::Complete
        }
        Ok(Decision::Queued(id)) => {
            op.ticket = Some(Ticket::Slot(id));
            StepResult::Suspended
        }
        Ok(Decision::Rejected) => {
            *status = JobStatus::error(Errno::Again);
            StepResult::Complete
        }
        Err(e) => {
            debug!(op = %op.id, error = %e, "scheduling failed");
            *status = JobStatus::error(e.errno());
            StepResult::Complete
        }
    }
}

fn read_attr(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    let Some(obj) = target_object(&op.request) else {
        *status = JobStatus::success();
        return StepResult::Complete;
    };
    op.jobs.post_store(op.id, move |store: &dyn ObjectStore| {
        store.getattr(obj).map(ResponseBody::Attr)
    });
    StepResult::Suspended
}

fn keep_attr(op: &mut ServerOp, _status: &mut JobStatus) -> StepResult {
    if let ResponseBody::Attr(attr) = std::mem::take(&mut op.body) {
        op.attr = Some(attr);
    }
    StepResult::Complete
}

fn release(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    if !status.is_success() {
        op.fail(status.error_code);
    }
    if let Some(ticket) = op.ticket.take() {
        if let Err(e) = op.jobs.release_sched(ticket) {
            warn!(op = %op.id, error = %e, "failed to release scheduler ticket");
        }
    }
    *status = JobStatus::success();
    StepResult::Complete
}

fn send_response(op: &mut ServerOp, _status: &mut JobStatus) -> StepResult {
    if let Some(resp) = op.response() {
        if let Err(e) = op.jobs.post_response(resp) {
            warn!(op = %op.id, error = %e, "failed to send response");
        }
    }
    StepResult::Complete
}

/// Last state of every machine: hands the op back to the driver.
pub fn complete(op: &mut ServerOp, _status: &mut JobStatus) -> StepResult {
    op.completed = true;
    StepResult::Suspended
}

/// Posts a timer for `op`, completing inline when it fires at once.
pub fn arm_timer(op: &mut ServerOp, status: &mut JobStatus, after: Duration) -> StepResult {
    match op.jobs.post_timer(op.id, after) {
        Ok(TimerPost::Completed(_)) => {
            *status = JobStatus::success();
            StepResult::Complete
        }
        Ok(TimerPost::Pending(id)) => {
            op.timer = Some(id);
            StepResult::Suspended
        }
        Err(e) => {
            warn!(op = %op.id, error = %e, "failed to post timer");
            *status = JobStatus::error(e.errno());
            StepResult::Complete
        }
    }
}
