//! Management operations and the server-internal periodic machines.

use stratafs_core::{
    Errno, JobStatus, MachineDef, ServerParam, ServerRequest, StateDef, StepResult, Transition,
};
use tracing::{debug, info};

use crate::op::{ResponseBody, ServerOp};
use crate::ops_common::{arm_timer, complete, op_machine};
use crate::store::ObjectStore;

/// Machine name for set-param.
pub const SET_PARAM: &str = "mgmt_setparam";
/// Machine name for noop.
pub const NOOP: &str = "mgmt_noop";
/// Machine name for perf-mon.
pub const PERF_MON: &str = "mgmt_perf_mon";
/// Machine name for statfs.
pub const STATFS: &str = "statfs";
/// Machine name for the job timer.
pub const JOB_TIMER: &str = "job_timer";
/// Machine name for the perf sampler.
pub const PERF_UPDATE: &str = "perf_update";

/// Sets a runtime parameter.
///
/// Mode changes take effect in the scheduler when the prelude admits the
/// request; this machine only acknowledges them.
pub fn set_param_machine() -> MachineDef<ServerOp> {
    op_machine(
        SET_PARAM,
        vec![StateDef::run("apply_param", apply_param).default(Transition::To("final"))],
    )
}

/// Admits and answers without doing anything.
pub fn noop_machine() -> MachineDef<ServerOp> {
    op_machine(NOOP, Vec::new())
}

/// Returns the performance history.
pub fn perf_mon_machine() -> MachineDef<ServerOp> {
    op_machine(
        PERF_MON,
        vec![StateDef::run("collect", collect_perf).default(Transition::To("final"))],
    )
}

/// File system usage.
pub fn statfs_machine() -> MachineDef<ServerOp> {
    op_machine(
        STATFS,
        vec![StateDef::run("query", query_statfs).default(Transition::To("final"))],
    )
}

/// Periodic housekeeping tick; re-arms itself until shutdown.
pub fn job_timer_machine() -> MachineDef<ServerOp> {
    MachineDef::new(JOB_TIMER)
        .state(
            StateDef::run("arm", arm_job_timer)
                .on_success(Transition::To("expire"))
                .default(Transition::To("cleanup")),
        )
        .state(StateDef::run("expire", job_timer_expired).default(Transition::To("arm")))
        .state(StateDef::run("cleanup", complete).default(Transition::Terminate))
}

/// Periodic performance sample; re-arms itself until shutdown.
pub fn perf_update_machine() -> MachineDef<ServerOp> {
    MachineDef::new(PERF_UPDATE)
        .state(
            StateDef::run("arm", arm_perf_update)
                .on_success(Transition::To("sample"))
                .default(Transition::To("cleanup")),
        )
        .state(StateDef::run("sample", take_sample).default(Transition::To("arm")))
        .state(StateDef::run("cleanup", complete).default(Transition::Terminate))
}

fn apply_param(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    let ServerRequest::MgmtSetParam { param, .. } = &op.request else {
        *status = JobStatus::error(Errno::Inval);
        return StepResult::Complete;
    };
    match param {
        ServerParam::Mode(mode) => {
            info!(op = %op.id, %mode, "mode change acknowledged");
        }
        ServerParam::EventMask(mask) => {
            op.jobs.set_event_mask(*mask);
            info!(op = %op.id, mask = format_args!("{:#x}", mask), "event mask updated");
        }
        ServerParam::PerfHistory(len) => {
            op.jobs.resize_perf(*len as usize);
            info!(op = %op.id, len, "performance history resized");
        }
    }
    StepResult::Complete
}

fn collect_perf(op: &mut ServerOp, _status: &mut JobStatus) -> StepResult {
    op.body = ResponseBody::PerfSamples(op.jobs.perf_snapshot());
    StepResult::Complete
}

fn query_statfs(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    let ServerRequest::Statfs { fs_id } = op.request else {
        *status = JobStatus::error(Errno::Inval);
        return StepResult::Complete;
    };
    op.jobs.post_store(op.id, move |store: &dyn ObjectStore| {
        store.statfs(fs_id).map(ResponseBody::Statfs)
    });
    StepResult::Suspended
}

fn arm_job_timer(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    if op.jobs.is_draining() {
        return complete(op, status);
    }
    let after = op.jobs.intervals().timer;
    arm_timer(op, status, after)
}

fn job_timer_expired(op: &mut ServerOp, _status: &mut JobStatus) -> StepResult {
    op.timer = None;
    let ticks = op.jobs.tick();
    debug!(ticks, "job timer expired");
    StepResult::Complete
}

fn arm_perf_update(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    if op.jobs.is_draining() {
        return complete(op, status);
    }
    let after = op.jobs.intervals().perf;
    arm_timer(op, status, after)
}

fn take_sample(op: &mut ServerOp, _status: &mut JobStatus) -> StepResult {
    op.timer = None;
    let sample = op.jobs.record_perf();
    debug!(
        seq = sample.seq,
        posted = sample.posted,
        scheduled = sample.scheduled,
        "performance sample"
    );
    StepResult::Complete
}
