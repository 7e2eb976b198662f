//! Object lifecycle operations: create, mkdir and remove.

use stratafs_core::{
    AttrUpdate, Errno, JobStatus, MachineDef, ObjectRef, ServerRequest, StateDef, StepResult, Transition,
};
use tracing::debug;

use crate::op::{ResponseBody, ServerOp};
use crate::ops_common::op_machine;
use crate::store::ObjectStore;

/// Machine name for create.
pub const CREATE: &str = "create";
/// Machine name for mkdir.
pub const MKDIR: &str = "mkdir";
/// Machine name for remove.
pub const REMOVE: &str = "remove";

/// Mode given to new directories: `S_IFDIR | 0755`.
pub const DIR_MODE: u32 = 0o040_755;

/// Allocates a new object.
pub fn create_machine() -> MachineDef<ServerOp> {
    op_machine(
        CREATE,
        vec![StateDef::run("create_object", create_object).default(Transition::To("final"))],
    )
}

/// Allocates a directory object and writes its attributes.
///
/// If the attributes cannot be written the new object is removed again
/// and the client sees the setattr failure.
pub fn mkdir_machine() -> MachineDef<ServerOp> {
    op_machine(
        MKDIR,
        vec![
            StateDef::run("create_dir", create_dir)
                .on_success(Transition::To("set_dir_attr"))
                .default(Transition::To("final")),
            StateDef::run("set_dir_attr", set_dir_attr)
                .on_success(Transition::To("final"))
                .default(Transition::To("mkdir_error")),
            StateDef::run("mkdir_error", mkdir_error).default(Transition::To("final")),
        ],
    )
}

/// Deletes an object.
pub fn remove_machine() -> MachineDef<ServerOp> {
    op_machine(
        REMOVE,
        vec![StateDef::run("remove_object", remove_object).default(Transition::To("final"))],
    )
}

fn create_object(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    let ServerRequest::Create { fs_id } = op.request else {
        *status = JobStatus::error(Errno::Inval);
        return StepResult::Complete;
    };
    op.jobs.post_store(op.id, move |store: &dyn ObjectStore| {
        store.create(fs_id).map(ResponseBody::Created)
    });
    StepResult::Suspended
}

fn remove_object(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    let ServerRequest::Remove(target) = op.request else {
        *status = JobStatus::error(Errno::Inval);
        return StepResult::Complete;
    };
    op.jobs.post_store(op.id, move |store: &dyn ObjectStore| {
        store.remove(target).map(|_| ResponseBody::Empty)
    });
    StepResult::Suspended
}

fn create_dir(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    let ServerRequest::Mkdir { fs_id } = op.request else {
        *status = JobStatus::error(Errno::Inval);
        return StepResult::Complete;
    };
    op.jobs.post_store(op.id, move |store: &dyn ObjectStore| {
        store.create(fs_id).map(ResponseBody::Created)
    });
    StepResult::Suspended
}

fn set_dir_attr(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    let (ServerRequest::Mkdir { fs_id }, ResponseBody::Created(handle)) = (&op.request, &op.body)
    else {
        *status = JobStatus::error(Errno::Inval);
        return StepResult::Complete;
    };
    let (dir, handle) = (ObjectRef::new(*handle, *fs_id), *handle);
    let update = AttrUpdate {
        mode: Some(DIR_MODE),
        ..Default::default()
    };
    op.jobs.post_store(op.id, move |store: &dyn ObjectStore| {
        store
            .setattr(dir, &update)
            .map(|_| ResponseBody::Created(handle))
    });
    StepResult::Suspended
}

fn mkdir_error(op: &mut ServerOp, status: &mut JobStatus) -> StepResult {
    op.fail(status.error_code);
    let (ServerRequest::Mkdir { fs_id }, ResponseBody::Created(handle)) =
        (&op.request, std::mem::take(&mut op.body))
    else {
        return StepResult::Complete;
    };
    let dir = ObjectRef::new(handle, *fs_id);
    debug!(op = %op.id, %handle, "removing directory after failed setattr");
    op.jobs.post_store(op.id, move |store: &dyn ObjectStore| {
        store.remove(dir).map(|_| ResponseBody::Empty)
    });
    StepResult::Suspended
}
