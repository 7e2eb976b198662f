//! End-to-end admission scenarios for the request scheduler, plus engine
//! transition behavior, driven through the public API only.

use std::time::{Duration, Instant};

use stratafs_core::{
    Classification, Decision, Engine, EngineConfig, FsId, Handle, IoType, JobStatus, MachineDef,
    ObjectRef, RequestStatus, Scheduler, SchedulerConfig, ServerMode, ServerParam, ServerRequest,
    StateDef, StepResult, Target, Ticket, TimerPost, Transition,
};

const H: u64 = 42;

fn sched() -> Scheduler<&'static str> {
    Scheduler::initialize(SchedulerConfig::default())
}

fn obj(h: u64) -> ObjectRef {
    ObjectRef::new(Handle::new(h), FsId::new(1))
}

fn small_io(h: u64, io_type: IoType) -> ServerRequest {
    ServerRequest::SmallIo {
        target: obj(h),
        io_type,
        offset: 0,
        len: 4,
        data: vec![0; 4],
    }
}

fn set_mode(mode: ServerMode) -> ServerRequest {
    ServerRequest::MgmtSetParam {
        fs_id: FsId::new(1),
        param: ServerParam::Mode(mode),
    }
}

fn slot(decision: Decision) -> stratafs_core::RequestId {
    match decision {
        Decision::RunImmediately(Ticket::Slot(id)) | Decision::Queued(id) => id,
        other => panic!("expected an entry, got {:?}", other),
    }
}

#[test]
fn test_scenario_a_writes_serialize() {
    let mut s = sched();
    let w1 = s.post(&small_io(H, IoType::Write), 0, "w1").unwrap();
    let w2 = s.post(&small_io(H, IoType::Write), 0, "w2").unwrap();
    let w3 = s.post(&small_io(H, IoType::Write), 0, "w3").unwrap();

    assert!(matches!(w1, Decision::RunImmediately(Ticket::Slot(_))));
    assert!(matches!(w2, Decision::Queued(_)));
    assert!(matches!(w3, Decision::Queued(_)));

    let (w1, w2, w3) = (slot(w1), slot(w2), slot(w3));
    s.release(Ticket::Slot(w1)).unwrap();
    assert_eq!(s.status(w2), Some(RequestStatus::ReadyToSchedule));
    assert_eq!(s.status(w3), Some(RequestStatus::Queued));

    let done = s.test(w2).unwrap().unwrap();
    assert_eq!(done.user_data, "w2");
    assert_eq!(s.status(w2), Some(RequestStatus::Scheduled));
    assert_eq!(s.test(w3).unwrap(), None);
}

#[test]
fn test_scenario_b_reads_share_writes_wait() {
    let mut s = sched();
    let getattr = ServerRequest::Getattr(obj(H));
    let r1 = s.post(&getattr, 0, "r1").unwrap();
    let r2 = s.post(&getattr, 0, "r2").unwrap();
    let w1 = s.post(&small_io(H, IoType::Write), 0, "w1").unwrap();

    assert!(matches!(r1, Decision::RunImmediately(_)));
    assert!(matches!(r2, Decision::RunImmediately(_)));
    assert!(matches!(w1, Decision::Queued(_)));
    assert_eq!(s.scheduled_count(), 2);
    assert_eq!(s.stats().readonly_bypass, 1);

    s.release(Ticket::Slot(slot(r1))).unwrap();
    assert_eq!(s.status(slot(w1)), Some(RequestStatus::Queued));
    s.release(Ticket::Slot(slot(r2))).unwrap();
    assert_eq!(s.status(slot(w1)), Some(RequestStatus::ReadyToSchedule));
}

#[test]
fn test_scenario_c_admin_mode_waits_for_drain() {
    let mut s = sched();
    let a = slot(s.post(&small_io(1, IoType::Write), 0, "a").unwrap());
    let b = slot(s.post(&small_io(2, IoType::Write), 0, "b").unwrap());
    assert_eq!(s.scheduled_count(), 2);

    let mode = s.post(&set_mode(ServerMode::Administrative), 0, "admin").unwrap();
    let mode = match mode {
        Decision::Queued(id) => id,
        other => panic!("expected Queued, got {:?}", other),
    };
    assert_eq!(s.current_mode(), ServerMode::Normal);

    s.release(Ticket::Slot(a)).unwrap();
    assert_eq!(s.status(mode), Some(RequestStatus::Queued));
    s.release(Ticket::Slot(b)).unwrap();
    assert_eq!(s.status(mode), Some(RequestStatus::ReadyToSchedule));

    // the mode only changes once the completion is claimed
    assert_eq!(s.current_mode(), ServerMode::Normal);
    let done = s.test(mode).unwrap().unwrap();
    assert_eq!(done.user_data, "admin");
    assert_eq!(s.current_mode(), ServerMode::Administrative);
}

#[test]
fn test_scenario_d_mutation_rejected_in_admin_mode() {
    let mut s = Scheduler::<&str>::initialize(SchedulerConfig {
        initial_mode: ServerMode::Administrative,
        ..Default::default()
    });
    let decision = s.post(&small_io(H, IoType::Write), 0, "w").unwrap();
    assert_eq!(decision, Decision::Rejected);
    assert!(!s.has_queue(Handle::new(H)));
    assert!(s.is_empty());

    // reads and repair operations still get through
    assert!(matches!(
        s.post(&ServerRequest::Getattr(obj(H)), 0, "r").unwrap(),
        Decision::RunImmediately(_)
    ));
    assert!(matches!(
        s.post(&ServerRequest::MgmtRemoveObject(obj(7)), 0, "repair").unwrap(),
        Decision::RunImmediately(_)
    ));
}

#[test]
fn test_scenario_e_timers() {
    let mut s = sched();
    match s.post_timer(Duration::ZERO, "now").unwrap() {
        TimerPost::Completed(data) => assert_eq!(data, "now"),
        other => panic!("expected immediate completion, got {:?}", other),
    }
    assert_eq!(s.pending_timers(), 0);

    let base = Instant::now();
    let id = match s.post_timer_at(Duration::from_millis(50), "later", base).unwrap() {
        TimerPost::Pending(id) => id,
        other => panic!("expected pending timer, got {:?}", other),
    };
    assert!(s.test_any_at(8, base + Duration::from_millis(49)).is_empty());
    let done = s.test_any_at(8, base + Duration::from_millis(50));
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, id);
    assert_eq!(done[0].user_data, "later");
    assert!(s.is_empty());
}

#[test]
fn test_bulk_io_runs_concurrently() {
    let mut s = sched();
    let class = |mutates| Classification::Targeted(Target::object(Handle::new(H), FsId::new(1), mutates, true));
    assert!(matches!(
        s.post_classified(class(true), "io1").unwrap(),
        Decision::RunImmediately(_)
    ));
    assert!(matches!(
        s.post_classified(class(true), "io2").unwrap(),
        Decision::RunImmediately(_)
    ));
    assert!(matches!(
        s.post(&small_io(H, IoType::Write), 0, "small").unwrap(),
        Decision::Queued(_)
    ));
    assert_eq!(s.stats().io_bypass, 1);
}

#[test]
fn test_release_readies_compatible_run() {
    let mut s = sched();
    let w = slot(s.post(&small_io(H, IoType::Write), 0, "w").unwrap());
    let r1 = slot(s.post(&ServerRequest::Getattr(obj(H)), 0, "r1").unwrap());
    let r2 = slot(s.post(&ServerRequest::Getattr(obj(H)), 0, "r2").unwrap());
    let w2 = slot(s.post(&small_io(H, IoType::Write), 0, "w2").unwrap());

    s.release(Ticket::Slot(w)).unwrap();
    assert_eq!(s.status(r1), Some(RequestStatus::ReadyToSchedule));
    assert_eq!(s.status(r2), Some(RequestStatus::ReadyToSchedule));
    assert_eq!(s.status(w2), Some(RequestStatus::Queued));

    let claimed: Vec<_> = s.test_any(8).into_iter().map(|c| c.user_data).collect();
    assert_eq!(claimed, vec!["r1", "r2"]);
    assert_eq!(s.scheduled_count(), 2);
}

#[test]
fn test_queue_destroyed_when_empty() {
    let mut s = sched();
    let id = slot(s.post(&small_io(H, IoType::Write), 0, "w").unwrap());
    assert!(s.has_queue(Handle::new(H)));
    s.release(Ticket::Slot(id)).unwrap();
    assert!(!s.has_queue(Handle::new(H)));
    assert_eq!(s.queue_count(), 0);
    assert_eq!(s.scheduled_count(), 0);
}

#[test]
fn test_normal_mode_restores_mutations() {
    let mut s = sched();
    let admin = slot(s.post(&set_mode(ServerMode::Administrative), 0, "admin").unwrap());
    assert_eq!(s.current_mode(), ServerMode::Administrative);
    assert_eq!(
        s.post(&ServerRequest::Create { fs_id: FsId::new(1) }, 0, "create").unwrap(),
        Decision::Rejected
    );
    s.release(Ticket::Slot(admin)).unwrap();

    let normal = s.post(&set_mode(ServerMode::Normal), 0, "normal").unwrap();
    assert!(matches!(normal, Decision::RunImmediately(_)));
    assert_eq!(s.current_mode(), ServerMode::Normal);
    assert!(matches!(
        s.post(&ServerRequest::Create { fs_id: FsId::new(1) }, 0, "create").unwrap(),
        Decision::RunImmediately(Ticket::Bypass)
    ));
}

#[derive(Debug, Default)]
struct Visits(Vec<&'static str>);

fn produce(ctx: &mut Visits, status: &mut JobStatus) -> StepResult {
    ctx.0.push("produce");
    status.error_code = -17;
    StepResult::Complete
}

fn matched(ctx: &mut Visits, _: &mut JobStatus) -> StepResult {
    ctx.0.push("matched");
    StepResult::Suspended
}

fn fallback(ctx: &mut Visits, _: &mut JobStatus) -> StepResult {
    ctx.0.push("fallback");
    StepResult::Suspended
}

#[test]
fn test_engine_unlisted_signal_falls_to_default() {
    let def = MachineDef::new("probe")
        .state(
            StateDef::run("produce", produce)
                .on(0, Transition::To("matched"))
                .on(-2, Transition::To("matched"))
                .default(Transition::To("fallback")),
        )
        .state(StateDef::run("matched", matched).default(Transition::Terminate))
        .state(StateDef::run("fallback", fallback).default(Transition::Terminate));
    let engine = Engine::initialize(EngineConfig::default(), vec![def]).unwrap();

    let mut run = engine.locate("probe", Visits::default()).unwrap();
    let mut status = JobStatus::success();
    engine.drive_start(&mut run, &mut status).unwrap();
    assert_eq!(run.ctx().0, vec!["produce", "fallback"]);
    assert_eq!(engine.state_name(&run), Some("fallback"));
}
