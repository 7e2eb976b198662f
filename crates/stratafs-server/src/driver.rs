//! The server driver loop.
//!
//! One task owns every in-flight operation. It starts a run for each
//! incoming request, resumes runs as their jobs complete, and sweeps the
//! scheduler for requests that became ready and timers that expired.
//! Shutdown stops intake, retires the periodic internal operations and
//! waits for the client operations still in progress.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use stratafs_core::{
    Engine, EngineResult, Errno, JobStatus, MachineId, Run, Scheduler, ServerRequest,
};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::job::{JobCompletion, JobContext, JobIntervals};
use crate::machines::{definitions, MachineTable};
use crate::op::{ClientRequest, OpId, ResponseBody, ServerOp, ServerResponse};
use crate::perf::PerfHistory;
use crate::store::{MemStore, ObjectStore};

/// Counters reported when the driver exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStats {
    /// Operations started, internal ones included.
    pub ops_started: u64,
    /// Operations that reached their final state.
    pub ops_completed: u64,
    /// Operations aborted by an engine error.
    pub ops_failed: u64,
    /// Requests answered with ENOSYS.
    pub ops_unsupported: u64,
    /// Ready requests and expired timers claimed from the scheduler.
    pub sched_completions: u64,
    /// Store jobs delivered back to their operations.
    pub store_completions: u64,
}

/// A configured server, ready to run.
pub struct Server {
    config: ServerConfig,
    engine: Engine<ServerOp>,
    table: MachineTable,
    store: Arc<dyn ObjectStore>,
}

impl Server {
    /// Builds a server backed by an in-memory object store sized by
    /// `config.store`.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let store = MemStore::with_max_object_size(config.store.max_object_size);
        Self::with_store(config, Arc::new(store))
    }

    /// Builds a server backed by `store`.
    pub fn with_store(config: ServerConfig, store: Arc<dyn ObjectStore>) -> ServerResult<Self> {
        config.validate()?;
        let engine = Engine::initialize(config.engine.clone(), definitions())?;
        let table = MachineTable::resolve(&engine)?;
        info!(
            server = %config.server_name,
            machines = engine.machine_count(),
            served = table.len(),
            "state machines initialized"
        );
        Ok(Self {
            config,
            engine,
            table,
            store,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Runs until `shutdown` flips to true or `incoming` closes, then
    /// drains the client operations in progress.
    pub async fn run(
        self,
        mut incoming: mpsc::Receiver<ClientRequest>,
        responses: mpsc::UnboundedSender<ServerResponse>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ServerResult<DriverStats> {
        let Server {
            config,
            engine,
            table,
            store,
        } = self;
        let (completions_tx, mut completions_rx) = mpsc::unbounded_channel();
        let jobs = Arc::new(JobContext::new(
            Scheduler::initialize(config.scheduler.clone()),
            store,
            PerfHistory::new(config.driver.perf_history),
            JobIntervals {
                timer: Duration::from_millis(config.driver.timer_interval_ms),
                perf: Duration::from_millis(config.driver.perf_interval_ms),
            },
            completions_tx,
            responses,
        ));
        let mut driver = Driver {
            engine,
            table,
            jobs,
            ops: HashMap::new(),
            next_id: 1,
            test_count: config.driver.test_count,
            stats: DriverStats::default(),
        };

        driver.start_internal(ServerRequest::JobTimer)?;
        driver.start_internal(ServerRequest::PerfUpdate)?;
        info!(server = %config.server_name, "server running");

        if *shutdown.borrow() {
            driver.begin_shutdown();
        }

        let mut tick = tokio::time::interval(Duration::from_millis(config.driver.poll_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let draining = driver.jobs.is_draining();
            if draining && driver.client_ops() == 0 {
                break;
            }
            tokio::select! {
                Some(done) = completions_rx.recv() => {
                    driver.stats.store_completions += 1;
                    driver.complete_job(done);
                }
                req = incoming.recv(), if !draining => match req {
                    Some(req) => driver.start_op(req),
                    None => {
                        info!("request channel closed");
                        driver.begin_shutdown();
                    }
                },
                changed = shutdown.changed(), if !draining => {
                    if changed.is_err() || *shutdown.borrow() {
                        driver.begin_shutdown();
                    }
                }
                _ = tick.tick() => {}
            }
            driver.sweep();
        }

        let Driver {
            mut engine,
            jobs,
            stats,
            ..
        } = driver;
        engine.halt();
        engine.finalize();
        let leftover = jobs.with_scheduler(|s| s.finalize());
        if leftover > 0 {
            warn!(leftover, "scheduler entries left at shutdown");
        }
        info!(
            started = stats.ops_started,
            completed = stats.ops_completed,
            failed = stats.ops_failed,
            "server stopped"
        );
        Ok(stats)
    }
}

struct Driver {
    engine: Engine<ServerOp>,
    table: MachineTable,
    jobs: Arc<JobContext>,
    ops: HashMap<OpId, Run<ServerOp>>,
    next_id: u64,
    test_count: usize,
    stats: DriverStats,
}

impl Driver {
    fn alloc_id(&mut self) -> OpId {
        let id = OpId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn client_ops(&self) -> usize {
        self.ops.values().filter(|r| !r.ctx().is_internal()).count()
    }

    fn start_op(&mut self, req: ClientRequest) {
        let kind = req.request.kind();
        let Some(machine) = self.table.lookup_client(kind) else {
            self.stats.ops_unsupported += 1;
            debug!(tag = req.tag, %kind, "no state machine for request");
            self.reply(ServerResponse::error(req.tag, kind, Errno::NoSys));
            return;
        };
        let id = self.alloc_id();
        let tag = req.tag;
        let op = ServerOp::new(id, tag, req.request, Arc::clone(&self.jobs));
        if let Err(e) = self.launch(machine, op) {
            error!(%id, %kind, error = %e, "failed to start operation");
            self.stats.ops_failed += 1;
            self.reply(ServerResponse::error(tag, kind, e.errno()));
        }
    }

    fn start_internal(&mut self, request: ServerRequest) -> ServerResult<()> {
        let kind = request.kind();
        let machine = self
            .table
            .lookup(kind)
            .ok_or_else(|| ServerError::NoMachine(kind.to_string()))?;
        let id = self.alloc_id();
        debug!(%id, %kind, "starting internal operation");
        self.launch(machine, ServerOp::internal(id, request, Arc::clone(&self.jobs)))
    }

    fn launch(&mut self, machine: MachineId, op: ServerOp) -> ServerResult<()> {
        let mut run = self.engine.locate_id(machine, op)?;
        self.stats.ops_started += 1;
        let mut status = JobStatus::success();
        let result = self.engine.drive_start(&mut run, &mut status);
        self.settle(run, result);
        Ok(())
    }

    fn complete_job(&mut self, done: JobCompletion) {
        self.resume(done.op, done.status, done.body);
    }

    fn resume(&mut self, id: OpId, mut status: JobStatus, body: Option<ResponseBody>) {
        let Some(mut run) = self.ops.remove(&id) else {
            debug!(%id, "completion for retired operation");
            return;
        };
        if let Some(body) = body {
            run.ctx_mut().body = body;
        }
        let result = self.engine.drive_next(&mut run, &mut status);
        self.settle(run, result);
    }

    fn settle(&mut self, mut run: Run<ServerOp>, result: EngineResult<()>) {
        let id = run.ctx().id;
        match result {
            Ok(()) if run.ctx().completed => {
                self.stats.ops_completed += 1;
                debug!(%id, kind = %run.ctx().kind(), "operation completed");
            }
            Ok(()) => {
                self.ops.insert(id, run);
            }
            Err(e) => {
                self.stats.ops_failed += 1;
                let state = self.engine.state_name(&run).unwrap_or("?");
                let op = run.ctx_mut();
                error!(%id, kind = %op.kind(), state, error = %e, "operation aborted");
                if let Some(ticket) = op.ticket.take() {
                    if let Err(e) = self.jobs.abandon_sched(ticket) {
                        warn!(%id, error = %e, "failed to release scheduler ticket");
                    }
                }
                if let Some(timer) = op.timer.take() {
                    if let Err(e) = self.jobs.unpost_sched(timer) {
                        warn!(%id, error = %e, "failed to withdraw timer");
                    }
                }
                op.fail(Errno::Inval.code());
                if let Some(resp) = op.response() {
                    self.reply(resp);
                }
            }
        }
    }

    /// Resumes operations whose queued requests or timers completed.
    fn sweep(&mut self) {
        for done in self.jobs.test_sched(self.test_count) {
            self.stats.sched_completions += 1;
            self.resume(done.user_data, JobStatus::success(), None);
        }
    }

    fn begin_shutdown(&mut self) {
        if self.jobs.is_draining() {
            return;
        }
        self.jobs.set_draining();
        let internal: Vec<OpId> = self
            .ops
            .iter()
            .filter(|(_, run)| run.ctx().is_internal())
            .map(|(id, _)| *id)
            .collect();
        for id in internal {
            let Some(mut run) = self.ops.remove(&id) else {
                continue;
            };
            if let Some(timer) = run.ctx_mut().timer.take() {
                if let Err(e) = self.jobs.unpost_sched(timer) {
                    warn!(%id, error = %e, "failed to withdraw timer");
                }
            }
            debug!(%id, kind = %run.ctx().kind(), "retired internal operation");
        }
        info!(in_progress = self.client_ops(), "draining operations");
    }

    fn reply(&self, resp: ServerResponse) {
        if let Err(e) = self.jobs.post_response(resp) {
            warn!(error = %e, "failed to send response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratafs_core::OpKind;

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = ServerConfig::default();
        config.driver.test_count = 0;
        assert!(matches!(
            Server::new(config),
            Err(ServerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_new_resolves_machines() {
        let server = Server::new(ServerConfig::default()).unwrap();
        assert!(server.table.lookup_client(OpKind::Getattr).is_some());
        assert!(server.table.lookup_client(OpKind::Mkdir).is_some());
        assert!(server.table.lookup_client(OpKind::Readdir).is_none());
        assert!(server.table.lookup_client(OpKind::PerfUpdate).is_none());
        assert_eq!(server.config().driver.test_count, 64);
    }

    #[tokio::test]
    async fn test_run_stops_when_shutdown_already_set() {
        let server = Server::new(ServerConfig::default()).unwrap();
        let (_req_tx, req_rx) = mpsc::channel(4);
        let (resp_tx, _resp_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(true);
        let stats = server.run(req_rx, resp_tx, stop_rx).await.unwrap();
        assert_eq!(stats.ops_started, 2);
        assert_eq!(stats.ops_failed, 0);
    }

    #[tokio::test]
    async fn test_run_stops_when_requests_close() {
        let server = Server::new(ServerConfig::default()).unwrap();
        let (req_tx, req_rx) = mpsc::channel(4);
        let (resp_tx, _resp_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        drop(req_tx);
        let stats = server.run(req_rx, resp_tx, stop_rx).await.unwrap();
        assert_eq!(stats.ops_completed, 0);
    }
}
