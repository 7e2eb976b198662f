//! Asynchronous job layer.
//!
//! State actions never block. They post work here and return
//! `Suspended`; the result comes back to the driver as a [`JobCompletion`]
//! on an mpsc channel, or through a scheduler sweep for queued requests
//! and timers. Work that finishes on the spot (immediate admission, zero
//! timers, responses) is reported inline so the action can return
//! `Complete` instead.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use stratafs_core::{
    Completion, Decision, Errno, JobStatus, RequestId, RequestStatus, SchedResult, Scheduler,
    SchedulerStats, ServerRequest, Ticket, TimerPost,
};

use crate::error::{ServerError, ServerResult};
use crate::op::{OpId, ResponseBody, ServerResponse};
use crate::perf::{PerfHistory, PerfSample};
use crate::store::ObjectStore;

/// Result of a posted job, delivered to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    /// Operation that posted the job.
    pub op: OpId,
    /// Outcome handed to the operation's next state.
    pub status: JobStatus,
    /// Payload produced by a store job.
    pub body: Option<ResponseBody>,
}

impl JobCompletion {
    /// A successful completion without payload.
    pub fn success(op: OpId) -> Self {
        Self {
            op,
            status: JobStatus::success(),
            body: None,
        }
    }
}

/// Periods of the server-internal machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobIntervals {
    /// Job timer period.
    pub timer: Duration,
    /// Performance sampling period.
    pub perf: Duration,
}

/// Collaborators reachable from state actions.
pub struct JobContext {
    sched: Mutex<Scheduler<OpId>>,
    store: Arc<dyn ObjectStore>,
    perf: Mutex<PerfHistory>,
    event_mask: AtomicU64,
    timer_ticks: AtomicU64,
    draining: AtomicBool,
    intervals: JobIntervals,
    completions: mpsc::UnboundedSender<JobCompletion>,
    responses: mpsc::UnboundedSender<ServerResponse>,
}

impl JobContext {
    /// Wires the job layer to its scheduler, store and channels.
    pub fn new(
        sched: Scheduler<OpId>,
        store: Arc<dyn ObjectStore>,
        perf: PerfHistory,
        intervals: JobIntervals,
        completions: mpsc::UnboundedSender<JobCompletion>,
        responses: mpsc::UnboundedSender<ServerResponse>,
    ) -> Self {
        Self {
            sched: Mutex::new(sched),
            store,
            perf: Mutex::new(perf),
            event_mask: AtomicU64::new(0),
            timer_ticks: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            intervals,
            completions,
            responses,
        }
    }

    /// Submits a request for admission on behalf of `op`.
    pub fn post_sched(&self, op: OpId, req: &ServerRequest) -> SchedResult<Decision> {
        let decision = self.sched.lock().post(req, 0, op)?;
        debug!(%op, kind = %req.kind(), ?decision, "posted scheduler job");
        Ok(decision)
    }

    /// Releases an admitted request.
    pub fn release_sched(&self, ticket: Ticket) -> SchedResult<()> {
        self.sched.lock().release(ticket)
    }

    /// Gives up a ticket whatever state its entry reached: running entries
    /// are released, waiting ones withdrawn.
    pub fn abandon_sched(&self, ticket: Ticket) -> SchedResult<()> {
        let mut sched = self.sched.lock();
        let Ticket::Slot(id) = ticket else {
            return Ok(());
        };
        match sched.status(id) {
            Some(RequestStatus::Scheduled) => sched.release(ticket),
            Some(_) => sched.unpost(id).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Withdraws a request or timer that has not completed.
    pub fn unpost_sched(&self, id: RequestId) -> SchedResult<OpId> {
        self.sched.lock().unpost(id)
    }

    /// Posts a timer for `op`. A zero duration completes inline.
    pub fn post_timer(&self, op: OpId, after: Duration) -> SchedResult<TimerPost<OpId>> {
        self.sched.lock().post_timer(after, op)
    }

    /// Claims up to `max` ready requests and expired timers.
    pub fn test_sched(&self, max: usize) -> Vec<Completion<OpId>> {
        self.sched.lock().test_any(max)
    }

    /// Runs `f` with exclusive access to the scheduler.
    pub fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler<OpId>) -> R) -> R {
        f(&mut self.sched.lock())
    }

    /// Snapshot of the scheduler counters.
    pub fn sched_stats(&self) -> SchedulerStats {
        self.sched.lock().stats().clone()
    }

    /// Runs `work` against the store on a spawned task; its result
    /// arrives as a completion for `op`.
    pub fn post_store<F>(&self, op: OpId, work: F)
    where
        F: FnOnce(&dyn ObjectStore) -> Result<ResponseBody, Errno> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let tx = self.completions.clone();
        tokio::spawn(async move {
            let completion = match work(store.as_ref()) {
                Ok(body) => {
                    let actual_size = match &body {
                        ResponseBody::Data(data) => data.len() as u64,
                        ResponseBody::Written(n) => *n,
                        _ => 0,
                    };
                    JobCompletion {
                        op,
                        status: JobStatus {
                            error_code: 0,
                            actual_size,
                        },
                        body: Some(body),
                    }
                }
                Err(errno) => JobCompletion {
                    op,
                    status: JobStatus::error(errno),
                    body: None,
                },
            };
            if tx.send(completion).is_err() {
                warn!(%op, "driver gone, dropping store completion");
            }
        });
    }

    /// Sends a response to the client. Completes inline.
    pub fn post_response(&self, resp: ServerResponse) -> ServerResult<()> {
        debug!(tag = resp.tag, kind = %resp.kind, status = resp.status, "sending response");
        self.responses
            .send(resp)
            .map_err(|_| ServerError::ChannelClosed("responses"))
    }

    /// Appends a performance sample.
    pub fn record_perf(&self) -> PerfSample {
        let (stats, scheduled) = {
            let sched = self.sched.lock();
            (sched.stats().clone(), sched.scheduled_count())
        };
        self.perf.lock().record(&stats, scheduled)
    }

    /// Performance history, oldest first.
    pub fn perf_snapshot(&self) -> Vec<PerfSample> {
        self.perf.lock().snapshot()
    }

    /// Changes how many performance samples are kept.
    pub fn resize_perf(&self, capacity: usize) {
        self.perf.lock().resize(capacity);
    }

    /// Current event mask.
    pub fn event_mask(&self) -> u64 {
        self.event_mask.load(Ordering::Relaxed)
    }

    /// Replaces the event mask.
    pub fn set_event_mask(&self, mask: u64) {
        self.event_mask.store(mask, Ordering::Relaxed);
    }

    /// Counts one job timer period.
    pub fn tick(&self) -> u64 {
        self.timer_ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Job timer periods elapsed.
    pub fn timer_ticks(&self) -> u64 {
        self.timer_ticks.load(Ordering::Relaxed)
    }

    /// Marks the server as shutting down.
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Whether the server is shutting down.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Periods of the internal machines.
    pub fn intervals(&self) -> JobIntervals {
        self.intervals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use stratafs_core::{FsId, ObjectRef, SchedulerConfig};

    fn context() -> (
        JobContext,
        mpsc::UnboundedReceiver<JobCompletion>,
        mpsc::UnboundedReceiver<ServerResponse>,
    ) {
        let (ctx_tx, ctx_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let jobs = JobContext::new(
            Scheduler::initialize(SchedulerConfig::default()),
            Arc::new(MemStore::new()),
            PerfHistory::new(4),
            JobIntervals {
                timer: Duration::from_millis(10),
                perf: Duration::from_millis(10),
            },
            ctx_tx,
            resp_tx,
        );
        (jobs, ctx_rx, resp_rx)
    }

    #[tokio::test]
    async fn test_post_store_delivers_completion() {
        let (jobs, mut rx, _resp) = context();
        let op = OpId::new(3);
        jobs.post_store(op, |store| store.create(FsId::new(1)).map(ResponseBody::Created));
        let done = rx.recv().await.unwrap();
        assert_eq!(done.op, op);
        assert!(done.status.is_success());
        assert!(matches!(done.body, Some(ResponseBody::Created(_))));
    }

    #[tokio::test]
    async fn test_post_store_error_status() {
        let (jobs, mut rx, _resp) = context();
        let missing = ObjectRef::new(stratafs_core::Handle::new(99), FsId::new(1));
        jobs.post_store(OpId::new(1), move |store| {
            store.getattr(missing).map(ResponseBody::Attr)
        });
        let done = rx.recv().await.unwrap();
        assert_eq!(done.status.error_code, Errno::NoEnt.code());
        assert!(done.body.is_none());
    }

    #[tokio::test]
    async fn test_post_store_reports_size() {
        let (jobs, mut rx, _resp) = context();
        jobs.post_store(OpId::new(1), |_| Ok(ResponseBody::Data(vec![0; 12])));
        assert_eq!(rx.recv().await.unwrap().status.actual_size, 12);
    }

    #[tokio::test]
    async fn test_post_response() {
        let (jobs, _rx, mut resp_rx) = context();
        jobs.post_response(ServerResponse::error(5, stratafs_core::OpKind::Getattr, Errno::NoEnt))
            .unwrap();
        let resp = resp_rx.recv().await.unwrap();
        assert_eq!(resp.tag, 5);
        drop(resp_rx);
        assert!(matches!(
            jobs.post_response(ServerResponse::error(6, stratafs_core::OpKind::Getattr, Errno::NoEnt)),
            Err(ServerError::ChannelClosed(_))
        ));
    }

    #[test]
    fn test_sched_passthrough() {
        let (jobs, _rx, _resp) = context();
        let req = ServerRequest::Getattr(ObjectRef::new(stratafs_core::Handle::new(1), FsId::new(1)));
        let decision = jobs.post_sched(OpId::new(1), &req).unwrap();
        let ticket = match decision {
            Decision::RunImmediately(t) => t,
            other => panic!("expected RunImmediately, got {:?}", other),
        };
        assert_eq!(jobs.with_scheduler(|s| s.scheduled_count()), 1);
        jobs.release_sched(ticket).unwrap();
        assert_eq!(jobs.sched_stats().released, 1);
    }

    #[test]
    fn test_abandon_waiting_ticket() {
        let (jobs, _rx, _resp) = context();
        let obj = ObjectRef::new(stratafs_core::Handle::new(1), FsId::new(1));
        let write = ServerRequest::Truncate { target: obj, size: 0 };
        let first = match jobs.post_sched(OpId::new(1), &write).unwrap() {
            Decision::RunImmediately(t) => t,
            other => panic!("expected RunImmediately, got {:?}", other),
        };
        let waiting = match jobs.post_sched(OpId::new(2), &write).unwrap() {
            Decision::Queued(id) => id,
            other => panic!("expected Queued, got {:?}", other),
        };

        // queued entry is withdrawn, not released
        jobs.abandon_sched(Ticket::Slot(waiting)).unwrap();
        assert_eq!(jobs.with_scheduler(|s| s.status(waiting)), None);
        assert_eq!(jobs.sched_stats().unposted, 1);

        jobs.abandon_sched(first).unwrap();
        assert!(jobs.with_scheduler(|s| s.is_empty()));
        assert_eq!(jobs.sched_stats().released, 1);
        jobs.abandon_sched(Ticket::Bypass).unwrap();
    }

    #[test]
    fn test_abandon_ready_ticket() {
        let (jobs, _rx, _resp) = context();
        let obj = ObjectRef::new(stratafs_core::Handle::new(1), FsId::new(1));
        let write = ServerRequest::Truncate { target: obj, size: 0 };
        let first = match jobs.post_sched(OpId::new(1), &write).unwrap() {
            Decision::RunImmediately(t) => t,
            other => panic!("expected RunImmediately, got {:?}", other),
        };
        let ready = match jobs.post_sched(OpId::new(2), &write).unwrap() {
            Decision::Queued(id) => id,
            other => panic!("expected Queued, got {:?}", other),
        };
        jobs.release_sched(first).unwrap();
        assert_eq!(
            jobs.with_scheduler(|s| s.status(ready)),
            Some(RequestStatus::ReadyToSchedule)
        );

        jobs.abandon_sched(Ticket::Slot(ready)).unwrap();
        assert!(jobs.with_scheduler(|s| s.is_empty()));
        assert!(jobs.test_sched(8).is_empty());
    }

    #[test]
    fn test_timer_and_perf() {
        let (jobs, _rx, _resp) = context();
        assert!(matches!(
            jobs.post_timer(OpId::new(2), Duration::ZERO).unwrap(),
            TimerPost::Completed(op) if op == OpId::new(2)
        ));
        let id = match jobs.post_timer(OpId::new(2), Duration::from_secs(60)).unwrap() {
            TimerPost::Pending(id) => id,
            other => panic!("expected pending timer, got {:?}", other),
        };
        assert_eq!(jobs.unpost_sched(id).unwrap(), OpId::new(2));
        assert!(jobs.test_sched(8).is_empty());

        jobs.record_perf();
        jobs.record_perf();
        assert_eq!(jobs.perf_snapshot().len(), 2);
        jobs.resize_perf(1);
        assert_eq!(jobs.perf_snapshot().len(), 1);

        jobs.set_event_mask(0xf0);
        assert_eq!(jobs.event_mask(), 0xf0);
        assert_eq!(jobs.tick(), 1);
        assert!(!jobs.is_draining());
        jobs.set_draining();
        assert!(jobs.is_draining());
    }
}
