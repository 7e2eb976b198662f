//! Per-object admission scheduler.
//!
//! Keeps one FIFO per targeted handle, a FIFO of mode-change requests, a
//! ready queue of unblocked-but-unclaimed requests and a deadline-ordered
//! timer queue. Only the head of a handle queue may run, except that a
//! contiguous run of bulk I/O requests, or of read-only requests, may run
//! together. A transition to administrative mode waits until every
//! handle-bound request has left the scheduler.
//!
//! Requests live in an arena keyed by [`RequestId`]; the queues hold ids.
//! The scheduler is single-writer: callers serialize access externally.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classify::{classify, Classification, Target};
use crate::error::{SchedError, SchedResult};
use crate::timer::TimerQueue;
use crate::types::{Handle, ServerMode, ServerRequest};

/// Stable identifier of a scheduler entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    /// Creates a RequestId from a raw value
    pub fn new(id: u64) -> Self {
        RequestId(id)
    }

    /// Returns the raw u64 value of this id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a scheduler entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Blocked behind an incompatible predecessor.
    Queued,
    /// Unblocked, waiting for a test call to claim it.
    ReadyToSchedule,
    /// Holding its concurrency slot.
    Scheduled,
    /// A timer waiting for its deadline.
    Timing,
}

impl RequestStatus {
    fn name(&self) -> &'static str {
        match self {
            RequestStatus::Queued => "Queued",
            RequestStatus::ReadyToSchedule => "ReadyToSchedule",
            RequestStatus::Scheduled => "Scheduled",
            RequestStatus::Timing => "Timing",
        }
    }
}

/// What a caller must release once it is done with an admitted request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ticket {
    /// Admitted without an entry; releasing it is a no-op.
    Bypass,
    /// Holds an entry in the scheduler.
    Slot(RequestId),
}

impl Ticket {
    /// The entry id, if the ticket holds one.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Ticket::Bypass => None,
            Ticket::Slot(id) => Some(*id),
        }
    }
}

/// Outcome of posting a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// The request may run now.
    RunImmediately(Ticket),
    /// The request waits; test the id later.
    Queued(RequestId),
    /// A mutating request arrived during an administrative transition;
    /// the caller should retry later.
    Rejected,
}

/// A request or timer handed back by a test call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion<U> {
    /// Entry that completed.
    pub id: RequestId,
    /// User data supplied at post time.
    pub user_data: U,
}

/// Outcome of posting a timer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimerPost<U> {
    /// The duration was zero; nothing was queued.
    Completed(U),
    /// Test the id later.
    Pending(RequestId),
}

/// Configuration for the request scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of live entries (requests plus timers).
    pub max_requests: usize,
    /// Operating mode at startup.
    pub initial_mode: ServerMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_requests: 65536,
            initial_mode: ServerMode::Normal,
        }
    }
}

/// Counters for the request scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Total post calls that produced a decision.
    pub posted: u64,
    /// Posts admitted immediately.
    pub immediate: u64,
    /// Posts that had to wait.
    pub queued: u64,
    /// Posts rejected by the administrative-mode rule.
    pub rejected: u64,
    /// Admissions through the concurrent I/O rule.
    pub io_bypass: u64,
    /// Admissions through the concurrent read-only rule.
    pub readonly_bypass: u64,
    /// Entries released after running.
    pub released: u64,
    /// Entries withdrawn before running.
    pub unposted: u64,
    /// Entries moved to the ready queue.
    pub promoted: u64,
    /// Timers posted with a non-zero duration.
    pub timers_posted: u64,
    /// Timers that reached their deadline.
    pub timers_fired: u64,
    /// Operating mode transitions applied.
    pub mode_changes: u64,
}

#[derive(Debug, Clone, Copy)]
enum EntryKind {
    Object(Target),
    Mode(ServerMode),
    Timer(Instant),
}

#[derive(Debug)]
struct Entry<U> {
    kind: EntryKind,
    status: RequestStatus,
    user_data: U,
}

/// Concurrency class used by the bypass rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunClass {
    BulkIo,
    ReadOnly,
    Exclusive,
}

impl RunClass {
    fn of(t: &Target) -> Self {
        if t.is_bulk_io {
            RunClass::BulkIo
        } else if !t.mutates {
            RunClass::ReadOnly
        } else {
            RunClass::Exclusive
        }
    }

    fn admits(&self, t: &Target) -> bool {
        match self {
            RunClass::BulkIo => t.is_bulk_io,
            RunClass::ReadOnly => !t.mutates,
            RunClass::Exclusive => false,
        }
    }
}

/// Per-object admission scheduler.
pub struct Scheduler<U> {
    config: SchedulerConfig,
    entries: HashMap<RequestId, Entry<U>>,
    queues: HashMap<Handle, VecDeque<RequestId>>,
    mode_queue: VecDeque<RequestId>,
    ready: VecDeque<RequestId>,
    timers: TimerQueue,
    next_id: u64,
    current_mode: ServerMode,
    scheduled_count: usize,
    handle_entries: usize,
    stats: SchedulerStats,
}

impl<U: Clone> Scheduler<U> {
    /// Builds an empty scheduler.
    pub fn initialize(config: SchedulerConfig) -> Self {
        info!(
            "Initializing request scheduler: max_requests={}, mode={}",
            config.max_requests, config.initial_mode
        );
        let current_mode = config.initial_mode;
        Self {
            config,
            entries: HashMap::new(),
            queues: HashMap::new(),
            mode_queue: VecDeque::new(),
            ready: VecDeque::new(),
            timers: TimerQueue::new(),
            next_id: 1,
            current_mode,
            scheduled_count: 0,
            handle_entries: 0,
            stats: SchedulerStats::default(),
        }
    }

    /// Drops every queue, entry and timer. Returns how many entries were abandoned.
    pub fn finalize(&mut self) -> usize {
        let abandoned = self.entries.len();
        if abandoned > 0 {
            warn!("Finalizing request scheduler with {} live entries", abandoned);
        } else {
            info!("Finalizing request scheduler");
        }
        self.entries.clear();
        self.queues.clear();
        self.mode_queue.clear();
        self.ready.clear();
        self.timers.clear();
        self.scheduled_count = 0;
        self.handle_entries = 0;
        abandoned
    }

    /// Classifies and posts a decoded request.
    pub fn post(
        &mut self,
        req: &ServerRequest,
        req_index: usize,
        user_data: U,
    ) -> SchedResult<Decision> {
        let class = classify(req, req_index)?;
        self.post_classified(class, user_data)
    }

    /// Posts a request whose class is already known.
    pub fn post_classified(
        &mut self,
        class: Classification,
        user_data: U,
    ) -> SchedResult<Decision> {
        if class.mutates() && !class.is_mgmt() && self.admin_pending() {
            self.stats.posted += 1;
            self.stats.rejected += 1;
            warn!(
                "Rejecting mutating request during administrative mode: mode={}",
                self.current_mode
            );
            return Ok(Decision::Rejected);
        }

        let decision = match class {
            Classification::Bypass { .. } => Decision::RunImmediately(Ticket::Bypass),
            Classification::ModeChange(mode) => self.post_mode(mode, user_data)?,
            Classification::Targeted(target) => self.post_object(target, user_data)?,
        };

        self.stats.posted += 1;
        match decision {
            Decision::RunImmediately(_) => self.stats.immediate += 1,
            Decision::Queued(_) => self.stats.queued += 1,
            Decision::Rejected => self.stats.rejected += 1,
        }
        Ok(decision)
    }

    fn admin_pending(&self) -> bool {
        if self.current_mode == ServerMode::Administrative {
            return true;
        }
        self.mode_queue
            .front()
            .and_then(|id| self.entries.get(id))
            .is_some_and(|e| matches!(e.kind, EntryKind::Mode(ServerMode::Administrative)))
    }

    fn allocate(&mut self, kind: EntryKind, status: RequestStatus, user_data: U) -> SchedResult<RequestId> {
        if self.entries.len() >= self.config.max_requests {
            return Err(SchedError::Exhausted {
                capacity: self.config.max_requests,
            });
        }
        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                kind,
                status,
                user_data,
            },
        );
        Ok(id)
    }

    fn post_mode(&mut self, mode: ServerMode, user_data: U) -> SchedResult<Decision> {
        let at_head = self.mode_queue.is_empty();
        let runs = at_head && (mode == ServerMode::Normal || self.drained());
        let status = if runs {
            RequestStatus::Scheduled
        } else {
            RequestStatus::Queued
        };
        let id = self.allocate(EntryKind::Mode(mode), status, user_data)?;
        self.mode_queue.push_back(id);

        if runs {
            self.apply_mode(mode);
            Ok(Decision::RunImmediately(Ticket::Slot(id)))
        } else {
            debug!(%id, %mode, "Mode change queued pending drain");
            Ok(Decision::Queued(id))
        }
    }

    fn post_object(&mut self, target: Target, user_data: U) -> SchedResult<Decision> {
        let handle = target.handle;
        let status = match self.queues.get(&handle) {
            None => RequestStatus::Scheduled,
            Some(queue) => match self.bypass_class(queue, &target) {
                Some(RunClass::BulkIo) => {
                    self.stats.io_bypass += 1;
                    debug!(%handle, "Allowing concurrent I/O");
                    RequestStatus::Scheduled
                }
                Some(_) => {
                    self.stats.readonly_bypass += 1;
                    debug!(%handle, "Allowing concurrent read only");
                    RequestStatus::Scheduled
                }
                None => RequestStatus::Queued,
            },
        };

        let id = self.allocate(EntryKind::Object(target), status, user_data)?;
        self.queues.entry(handle).or_default().push_back(id);
        self.handle_entries += 1;

        debug!(%handle, %id, ?status, "Posted request");
        if status == RequestStatus::Scheduled {
            self.scheduled_count += 1;
            Ok(Decision::RunImmediately(Ticket::Slot(id)))
        } else {
            Ok(Decision::Queued(id))
        }
    }

    /// A new request may join a queue only when every entry already holds
    /// its slot and all of them share the newcomer's concurrency class.
    fn bypass_class(&self, queue: &VecDeque<RequestId>, target: &Target) -> Option<RunClass> {
        let members: Vec<&Entry<U>> = queue.iter().filter_map(|id| self.entries.get(id)).collect();
        if members.iter().any(|e| e.status != RequestStatus::Scheduled) {
            return None;
        }
        let all = |class: RunClass| {
            members.iter().all(|e| match e.kind {
                EntryKind::Object(t) => class.admits(&t),
                _ => false,
            })
        };
        if target.is_bulk_io && all(RunClass::BulkIo) {
            Some(RunClass::BulkIo)
        } else if !target.mutates && all(RunClass::ReadOnly) {
            Some(RunClass::ReadOnly)
        } else {
            None
        }
    }

    /// Releases a request that finished running.
    pub fn release(&mut self, ticket: Ticket) -> SchedResult<()> {
        let id = match ticket {
            Ticket::Bypass => return Ok(()),
            Ticket::Slot(id) => id,
        };
        let entry = self.entries.get(&id).ok_or(SchedError::UnknownId(id.0))?;
        if entry.status != RequestStatus::Scheduled {
            return Err(SchedError::InvalidState {
                id: id.0,
                status: entry.status.name(),
                action: "release",
            });
        }
        let kind = entry.kind;
        self.entries.remove(&id);

        match kind {
            EntryKind::Object(target) => {
                self.scheduled_count -= 1;
                self.detach_object(id, target.handle, true);
                debug!(handle = %target.handle, %id, "Released request");
            }
            EntryKind::Mode(mode) => {
                self.mode_queue.retain(|m| *m != id);
                debug!(%id, %mode, "Released mode change");
            }
            EntryKind::Timer(_) => {}
        }
        self.stats.released += 1;
        self.ready_mode_head();
        Ok(())
    }

    /// Withdraws a request that has not started running and returns its user data.
    pub fn unpost(&mut self, id: RequestId) -> SchedResult<U> {
        let entry = self.entries.get(&id).ok_or(SchedError::UnknownId(id.0))?;
        if entry.status == RequestStatus::Scheduled {
            return Err(SchedError::AlreadyScheduled(id.0));
        }
        let was_ready = entry.status == RequestStatus::ReadyToSchedule;
        let entry = self
            .entries
            .remove(&id)
            .ok_or(SchedError::UnknownId(id.0))?;
        if was_ready {
            self.ready.retain(|r| *r != id);
        }

        match entry.kind {
            EntryKind::Object(target) => {
                self.detach_object(id, target.handle, was_ready);
            }
            EntryKind::Mode(_) => {
                self.mode_queue.retain(|m| *m != id);
            }
            EntryKind::Timer(deadline) => {
                self.timers.remove(deadline, id.0);
            }
        }
        debug!(%id, "Unposted request");
        self.stats.unposted += 1;
        self.ready_mode_head();
        Ok(entry.user_data)
    }

    /// Removes `id` from its handle queue, destroying the queue when it
    /// empties, and readies the next compatible run if `promote` is set.
    fn detach_object(&mut self, id: RequestId, handle: Handle, promote: bool) {
        self.handle_entries -= 1;
        let Some(queue) = self.queues.get_mut(&handle) else {
            return;
        };
        queue.retain(|q| *q != id);
        if queue.is_empty() {
            self.queues.remove(&handle);
            debug!(%handle, "Destroyed empty handle queue");
            return;
        }
        if promote {
            self.promote_head(handle);
        }
    }

    /// Readies the head of a handle queue and the compatible entries
    /// directly behind it.
    fn promote_head(&mut self, handle: Handle) {
        let Some(queue) = self.queues.get(&handle) else {
            return;
        };
        let ids: Vec<RequestId> = queue.iter().copied().collect();
        let Some(head) = ids.first().and_then(|id| self.entries.get(id)) else {
            return;
        };
        if head.status != RequestStatus::Queued {
            return;
        }
        let class = match head.kind {
            EntryKind::Object(t) => RunClass::of(&t),
            _ => RunClass::Exclusive,
        };

        self.make_ready(ids[0]);
        for id in &ids[1..] {
            let compatible = self.entries.get(id).is_some_and(|e| match e.kind {
                EntryKind::Object(t) => class.admits(&t) && e.status == RequestStatus::Queued,
                _ => false,
            });
            if !compatible {
                break;
            }
            debug!(%handle, %id, ?class, "Readying concurrent request at release time");
            self.make_ready(*id);
        }
    }

    fn make_ready(&mut self, id: RequestId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.status = RequestStatus::ReadyToSchedule;
            self.ready.push_back(id);
            self.stats.promoted += 1;
        }
    }

    /// True when no handle-bound request is queued, ready or running.
    fn drained(&self) -> bool {
        self.handle_entries == 0
    }

    /// Readies the mode queue head if the drain gate allows it.
    fn ready_mode_head(&mut self) {
        let Some(id) = self.mode_queue.front().copied() else {
            return;
        };
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        if entry.status != RequestStatus::Queued {
            return;
        }
        let allowed = match entry.kind {
            EntryKind::Mode(ServerMode::Normal) => true,
            EntryKind::Mode(ServerMode::Administrative) => self.drained(),
            _ => false,
        };
        if allowed {
            debug!(%id, "Mode change ready to schedule");
            self.make_ready(id);
        }
    }

    fn apply_mode(&mut self, mode: ServerMode) {
        if self.current_mode != mode {
            info!("Server mode change: {} -> {}", self.current_mode, mode);
        }
        self.current_mode = mode;
        self.stats.mode_changes += 1;
    }

    /// Moves a ready entry to Scheduled and hands back its user data.
    fn claim(&mut self, id: RequestId) -> Option<Completion<U>> {
        let entry = self.entries.get_mut(&id)?;
        entry.status = RequestStatus::Scheduled;
        let user_data = entry.user_data.clone();
        let kind = entry.kind;
        self.ready.retain(|r| *r != id);
        match kind {
            EntryKind::Object(target) => {
                self.scheduled_count += 1;
                debug!(handle = %target.handle, %id, "Scheduling request");
            }
            EntryKind::Mode(mode) => self.apply_mode(mode),
            EntryKind::Timer(_) => {}
        }
        Some(Completion { id, user_data })
    }

    fn fire_timer(&mut self, id: RequestId) -> Option<Completion<U>> {
        let entry = self.entries.remove(&id)?;
        self.stats.timers_fired += 1;
        Some(Completion {
            id,
            user_data: entry.user_data,
        })
    }

    /// Tests a single entry.
    ///
    /// Returns `Ok(None)` while the entry is still queued or its timer has
    /// not expired.
    pub fn test(&mut self, id: RequestId) -> SchedResult<Option<Completion<U>>> {
        self.test_at(id, Instant::now())
    }

    /// [`Scheduler::test`] against an explicit clock reading.
    pub fn test_at(&mut self, id: RequestId, now: Instant) -> SchedResult<Option<Completion<U>>> {
        let entry = self.entries.get(&id).ok_or(SchedError::UnknownId(id.0))?;
        let (status, kind) = (entry.status, entry.kind);
        match (status, kind) {
            (RequestStatus::Scheduled, _) => Err(SchedError::InvalidState {
                id: id.0,
                status: status.name(),
                action: "test",
            }),
            (RequestStatus::Queued, _) => Ok(None),
            (RequestStatus::ReadyToSchedule, _) => Ok(self.claim(id)),
            (RequestStatus::Timing, EntryKind::Timer(deadline)) => {
                if deadline > now {
                    return Ok(None);
                }
                self.timers.remove(deadline, id.0);
                Ok(self.fire_timer(id))
            }
            (RequestStatus::Timing, _) => Err(SchedError::InvalidState {
                id: id.0,
                status: status.name(),
                action: "test",
            }),
        }
    }

    /// Tests a set of entries. Returns the position in `ids` and the
    /// completion of every entry that completed.
    ///
    /// Fails without changing any state if an id is unknown, scheduled or
    /// listed twice.
    pub fn test_many(&mut self, ids: &[RequestId]) -> SchedResult<Vec<(usize, Completion<U>)>> {
        self.test_many_at(ids, Instant::now())
    }

    /// [`Scheduler::test_many`] against an explicit clock reading.
    pub fn test_many_at(
        &mut self,
        ids: &[RequestId],
        now: Instant,
    ) -> SchedResult<Vec<(usize, Completion<U>)>> {
        let mut seen = HashSet::with_capacity(ids.len());
        for id in ids {
            if !seen.insert(*id) {
                return Err(SchedError::DuplicateId(id.0));
            }
            let entry = self.entries.get(id).ok_or(SchedError::UnknownId(id.0))?;
            if entry.status == RequestStatus::Scheduled {
                return Err(SchedError::InvalidState {
                    id: id.0,
                    status: entry.status.name(),
                    action: "test",
                });
            }
        }

        let mut out = Vec::new();
        for (index, id) in ids.iter().enumerate() {
            if let Some(done) = self.test_at(*id, now)? {
                out.push((index, done));
            }
        }
        Ok(out)
    }

    /// Completes up to `max` entries: expired timers first, then the ready
    /// queue in FIFO order.
    pub fn test_any(&mut self, max: usize) -> Vec<Completion<U>> {
        self.test_any_at(max, Instant::now())
    }

    /// [`Scheduler::test_any`] against an explicit clock reading.
    pub fn test_any_at(&mut self, max: usize, now: Instant) -> Vec<Completion<U>> {
        let mut out = Vec::new();
        while out.len() < max {
            let Some(raw) = self.timers.pop_due(now) else {
                break;
            };
            if let Some(done) = self.fire_timer(RequestId(raw)) {
                debug!(id = raw, "Timer expired");
                out.push(done);
            }
        }
        while out.len() < max {
            let Some(id) = self.ready.front().copied() else {
                break;
            };
            match self.claim(id) {
                Some(done) => out.push(done),
                None => {
                    self.ready.pop_front();
                }
            }
        }
        out
    }

    /// Posts a timer that completes once `after` has elapsed.
    pub fn post_timer(&mut self, after: Duration, user_data: U) -> SchedResult<TimerPost<U>> {
        self.post_timer_at(after, user_data, Instant::now())
    }

    /// [`Scheduler::post_timer`] against an explicit clock reading.
    pub fn post_timer_at(
        &mut self,
        after: Duration,
        user_data: U,
        now: Instant,
    ) -> SchedResult<TimerPost<U>> {
        if after.is_zero() {
            return Ok(TimerPost::Completed(user_data));
        }
        let deadline = now
            .checked_add(after)
            .ok_or(SchedError::DeadlineOverflow {
                secs: after.as_secs(),
            })?;
        let id = self.allocate(EntryKind::Timer(deadline), RequestStatus::Timing, user_data)?;
        self.timers.insert(deadline, id.0);
        self.stats.timers_posted += 1;
        Ok(TimerPost::Pending(id))
    }

    /// Current operating mode.
    pub fn current_mode(&self) -> ServerMode {
        self.current_mode
    }

    /// Number of handle-bound requests holding their slot.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled_count
    }

    /// Status of a live entry.
    pub fn status(&self, id: RequestId) -> Option<RequestStatus> {
        self.entries.get(&id).map(|e| e.status)
    }

    /// Number of entries queued on a handle (0 if the queue does not exist).
    pub fn queue_len(&self, handle: Handle) -> usize {
        self.queues.get(&handle).map_or(0, |q| q.len())
    }

    /// Whether a queue currently exists for the handle.
    pub fn has_queue(&self, handle: Handle) -> bool {
        self.queues.contains_key(&handle)
    }

    /// Number of handle queues.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Number of mode changes waiting or running.
    pub fn mode_queue_len(&self) -> usize {
        self.mode_queue.len()
    }

    /// Entries waiting to be claimed by a test call.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Timers not yet fired.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Earliest pending timer deadline.
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Number of live entries of every kind.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when the scheduler holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Scheduler counters.
    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Configuration in use.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}
