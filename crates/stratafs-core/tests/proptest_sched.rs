//! Property-based tests for the request scheduler using proptest.
//!
//! Random interleavings of post / release / unpost / claim calls, mixed
//! with mode changes, are replayed against the scheduler while its
//! per-handle exclusion, slot accounting, queue cleanup and drain gate
//! invariants are checked after every step.

use proptest::prelude::*;
use stratafs_core::{
    Classification, Decision, FsId, Handle, RequestId, RequestStatus, Scheduler, SchedulerConfig,
    ServerMode, Target, Ticket,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Write,
    Read,
    BulkRead,
    BulkWrite,
}

impl Kind {
    fn class(self, handle: u64) -> Classification {
        let (mutates, bulk) = match self {
            Kind::Write => (true, false),
            Kind::Read => (false, false),
            Kind::BulkRead => (false, true),
            Kind::BulkWrite => (true, true),
        };
        Classification::Targeted(Target::object(Handle::new(handle), FsId::new(1), mutates, bulk))
    }

    fn exclusive(self) -> bool {
        self == Kind::Write
    }

    fn mutates(self) -> bool {
        matches!(self, Kind::Write | Kind::BulkWrite)
    }
}

#[derive(Debug, Clone)]
enum Step {
    Post { handle: u64, kind: Kind },
    Mode(ServerMode),
    Release(usize),
    Unpost(usize),
    Claim(usize),
}

fn any_kind() -> impl Strategy<Value = Kind> {
    prop_oneof![
        Just(Kind::Write),
        Just(Kind::Read),
        Just(Kind::BulkRead),
        Just(Kind::BulkWrite)
    ]
}

fn any_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0u64..3u64, any_kind()).prop_map(|(handle, kind)| Step::Post { handle, kind }),
        1 => prop_oneof![Just(ServerMode::Administrative), Just(ServerMode::Normal)].prop_map(Step::Mode),
        2 => any::<usize>().prop_map(Step::Release),
        1 => any::<usize>().prop_map(Step::Unpost),
        1 => (1usize..4usize).prop_map(Step::Claim),
    ]
}

#[derive(Debug, Clone, Copy)]
struct Live {
    id: RequestId,
    handle: u64,
    kind: Kind,
}

#[derive(Debug, Clone, Copy)]
struct LiveMode {
    id: RequestId,
    mode: ServerMode,
}

/// Entries of either kind, in post order.
fn live_ids(live: &[Live], modes: &[LiveMode]) -> Vec<RequestId> {
    live.iter()
        .map(|l| l.id)
        .chain(modes.iter().map(|m| m.id))
        .collect()
}

fn forget(live: &mut Vec<Live>, modes: &mut Vec<LiveMode>, id: RequestId) {
    live.retain(|l| l.id != id);
    modes.retain(|m| m.id != id);
}

fn check_drain_gate(s: &Scheduler<u64>, live: &[Live], modes: &[LiveMode]) -> Result<(), TestCaseError> {
    if let Some(head) = modes.first() {
        if head.mode == ServerMode::Administrative && s.status(head.id) == Some(RequestStatus::Queued) {
            prop_assert!(
                !live.is_empty(),
                "administrative change {:?} still queued with nothing to drain",
                head.id
            );
        }
    }
    Ok(())
}

fn check_invariants(s: &Scheduler<u64>, live: &[Live]) -> Result<(), TestCaseError> {
    let scheduled: Vec<&Live> = live
        .iter()
        .filter(|l| s.status(l.id) == Some(RequestStatus::Scheduled))
        .collect();
    prop_assert_eq!(s.scheduled_count(), scheduled.len());

    for handle in 0u64..3 {
        let running: Vec<&&Live> = scheduled.iter().filter(|l| l.handle == handle).collect();
        if running.iter().any(|l| l.kind.exclusive()) {
            prop_assert_eq!(running.len(), 1, "exclusive request shares handle {}", handle);
        }
        let on_handle = live.iter().filter(|l| l.handle == handle).count();
        prop_assert_eq!(s.queue_len(Handle::new(handle)), on_handle);
        prop_assert_eq!(s.has_queue(Handle::new(handle)), on_handle > 0);
    }
    Ok(())
}

proptest! {
    /// Mixed workloads never break exclusion or slot accounting, and
    /// releasing everything leaves no queue behind.
    #[test]
    fn test_scheduler_invariants_hold(steps in proptest::collection::vec(any_step(), 1..120)) {
        let mut s: Scheduler<u64> = Scheduler::initialize(SchedulerConfig::default());
        let mut live: Vec<Live> = Vec::new();
        let mut modes: Vec<LiveMode> = Vec::new();
        let mut tag = 0u64;

        for step in steps {
            match step {
                Step::Post { handle, kind } => {
                    tag += 1;
                    let admin_pending = s.current_mode() == ServerMode::Administrative
                        || modes.first().is_some_and(|m| m.mode == ServerMode::Administrative);
                    match s.post_classified(kind.class(handle), tag).unwrap() {
                        Decision::RunImmediately(Ticket::Slot(id)) | Decision::Queued(id) => {
                            prop_assert!(!(kind.mutates() && admin_pending), "mutation admitted in admin mode");
                            live.push(Live { id, handle, kind });
                        }
                        Decision::Rejected => {
                            prop_assert!(kind.mutates() && admin_pending, "unexpected rejection of {:?}", kind);
                        }
                        other => prop_assert!(false, "unexpected decision {:?}", other),
                    }
                }
                Step::Mode(mode) => {
                    tag += 1;
                    match s.post_classified(Classification::ModeChange(mode), tag).unwrap() {
                        Decision::RunImmediately(Ticket::Slot(id)) => {
                            prop_assert_eq!(s.current_mode(), mode);
                            modes.push(LiveMode { id, mode });
                        }
                        Decision::Queued(id) => modes.push(LiveMode { id, mode }),
                        other => prop_assert!(false, "unexpected mode decision {:?}", other),
                    }
                }
                Step::Release(pick) => {
                    let running: Vec<RequestId> = live_ids(&live, &modes)
                        .into_iter()
                        .filter(|id| s.status(*id) == Some(RequestStatus::Scheduled))
                        .collect();
                    if !running.is_empty() {
                        let id = running[pick % running.len()];
                        s.release(Ticket::Slot(id)).unwrap();
                        forget(&mut live, &mut modes, id);
                    }
                }
                Step::Unpost(pick) => {
                    let waiting: Vec<RequestId> = live_ids(&live, &modes)
                        .into_iter()
                        .filter(|id| s.status(*id) != Some(RequestStatus::Scheduled))
                        .collect();
                    if !waiting.is_empty() {
                        let id = waiting[pick % waiting.len()];
                        s.unpost(id).unwrap();
                        forget(&mut live, &mut modes, id);
                    }
                }
                Step::Claim(max) => {
                    s.test_any(max);
                }
            }
            check_invariants(&s, &live)?;
            check_drain_gate(&s, &live, &modes)?;
        }

        // drain: claim and release until nothing is left
        while !live.is_empty() || !modes.is_empty() {
            s.test_any(usize::MAX);
            let running: Vec<RequestId> = live_ids(&live, &modes)
                .into_iter()
                .filter(|id| s.status(*id) == Some(RequestStatus::Scheduled))
                .collect();
            prop_assert!(
                !running.is_empty(),
                "queue stalled with {} entries and {} mode changes",
                live.len(),
                modes.len()
            );
            for id in running {
                s.release(Ticket::Slot(id)).unwrap();
                forget(&mut live, &mut modes, id);
            }
            check_invariants(&s, &live)?;
            check_drain_gate(&s, &live, &modes)?;
        }
        prop_assert_eq!(s.queue_count(), 0);
        prop_assert_eq!(s.scheduled_count(), 0);
        prop_assert_eq!(s.mode_queue_len(), 0);
        prop_assert!(s.is_empty());
    }

    /// Writes on one handle are admitted strictly one at a time, in order.
    #[test]
    fn test_writes_run_in_fifo_order(count in 1usize..20) {
        let mut s: Scheduler<usize> = Scheduler::initialize(SchedulerConfig::default());
        let mut ids = Vec::new();
        for i in 0..count {
            match s.post_classified(Kind::Write.class(9), i).unwrap() {
                Decision::RunImmediately(Ticket::Slot(id)) => {
                    prop_assert_eq!(i, 0);
                    ids.push(id);
                }
                Decision::Queued(id) => ids.push(id),
                other => prop_assert!(false, "unexpected decision {:?}", other),
            }
        }

        let mut current = ids[0];
        for (expected, next) in ids.iter().enumerate().skip(1) {
            s.release(Ticket::Slot(current)).unwrap();
            let claimed = s.test_any(usize::MAX);
            prop_assert_eq!(claimed.len(), 1);
            prop_assert_eq!(claimed[0].user_data, expected);
            prop_assert_eq!(claimed[0].id, *next);
            current = *next;
        }
        s.release(Ticket::Slot(current)).unwrap();
        prop_assert!(!s.has_queue(Handle::new(9)));
    }

    /// While every running request is bulk I/O, more bulk I/O is admitted
    /// without queueing.
    #[test]
    fn test_bulk_io_never_queues_behind_bulk_io(
        kinds in proptest::collection::vec(prop_oneof![Just(Kind::BulkRead), Just(Kind::BulkWrite)], 1..30)
    ) {
        let mut s: Scheduler<u64> = Scheduler::initialize(SchedulerConfig::default());
        for kind in kinds {
            let decision = s.post_classified(kind.class(3), 0).unwrap();
            prop_assert!(matches!(decision, Decision::RunImmediately(Ticket::Slot(_))));
        }
        prop_assert_eq!(s.scheduled_count(), s.queue_len(Handle::new(3)));
    }

    /// Reads on a handle with only reads running are admitted immediately.
    #[test]
    fn test_reads_never_queue_behind_reads(count in 1usize..30) {
        let mut s: Scheduler<u64> = Scheduler::initialize(SchedulerConfig::default());
        for _ in 0..count {
            let decision = s.post_classified(Kind::Read.class(4), 0).unwrap();
            prop_assert!(matches!(decision, Decision::RunImmediately(Ticket::Slot(_))));
        }
        prop_assert_eq!(s.scheduled_count(), count);
    }
}
