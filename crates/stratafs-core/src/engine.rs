//! Continuation-based state machine engine.
//!
//! The engine owns the resolved machine tables. Each in-flight operation
//! owns a [`Run`]: its context, its cursor, and a bounded continuation
//! stack for nested machines. Runs are stepped one at a time by the driver;
//! the engine itself only needs `&self` and can be shared behind an `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use crate::error::{EngineError, EngineResult};
use crate::machine::{
    BodyDef, JobStatus, Machine, MachineDef, MachineId, NextState, State, StateBody, StateId,
    StepResult, Transition,
};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum nesting depth of machine jumps.
    pub max_stack_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_stack_depth: 8 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Position {
    machine: MachineId,
    state: StateId,
}

/// Bounded stack of return positions, one per active nested machine.
#[derive(Debug, Clone)]
pub struct ContinuationStack {
    frames: Vec<Position>,
    capacity: usize,
}

impl ContinuationStack {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, pos: Position) -> EngineResult<()> {
        if self.frames.len() >= self.capacity {
            return Err(EngineError::StackOverflow {
                depth: self.capacity,
            });
        }
        self.frames.push(pos);
        Ok(())
    }

    fn pop(&mut self) -> Option<Position> {
        self.frames.pop()
    }

    fn clear(&mut self) {
        self.frames.clear();
    }

    /// Current nesting depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Maximum nesting depth.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Per-operation execution state.
#[derive(Debug)]
pub struct Run<C> {
    ctx: C,
    root: MachineId,
    cursor: Position,
    stack: ContinuationStack,
    aborted: bool,
}

impl<C> Run<C> {
    /// Operation context.
    pub fn ctx(&self) -> &C {
        &self.ctx
    }

    /// Mutable operation context.
    pub fn ctx_mut(&mut self) -> &mut C {
        &mut self.ctx
    }

    /// Consumes the run, returning its context.
    pub fn into_ctx(self) -> C {
        self.ctx
    }

    /// Machine the run was located for.
    pub fn root(&self) -> MachineId {
        self.root
    }

    /// Machine currently executing.
    pub fn machine(&self) -> MachineId {
        self.cursor.machine
    }

    /// Nesting depth of the continuation stack.
    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    /// Whether a fatal error stopped this run.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

/// Resolved machine tables plus the global halt flag.
#[derive(Debug)]
pub struct Engine<C> {
    config: EngineConfig,
    machines: Vec<Machine<C>>,
    by_name: HashMap<&'static str, MachineId>,
    halted: AtomicBool,
}

impl<C> Engine<C> {
    /// Resolves machine definitions into tables.
    ///
    /// Every transition target and jump is looked up by name; unknown names,
    /// duplicate machines, empty machines and states without a default
    /// transition are rejected.
    pub fn initialize(config: EngineConfig, defs: Vec<MachineDef<C>>) -> EngineResult<Self> {
        let mut by_name = HashMap::with_capacity(defs.len());
        for (idx, def) in defs.iter().enumerate() {
            if by_name.insert(def.name, MachineId(idx)).is_some() {
                return Err(EngineError::DuplicateMachine(def.name.to_string()));
            }
        }

        let mut machines = Vec::with_capacity(defs.len());
        for def in defs {
            machines.push(resolve_machine(def, &by_name)?);
        }

        info!(
            machines = machines.len(),
            max_stack_depth = config.max_stack_depth,
            "state machine engine initialized"
        );
        Ok(Self {
            config,
            machines,
            by_name,
            halted: AtomicBool::new(false),
        })
    }

    /// Drops every table. Runs located before this call must not be stepped.
    pub fn finalize(&mut self) {
        self.machines.clear();
        self.by_name.clear();
        self.halted.store(true, Ordering::SeqCst);
        debug!("state machine engine finalized");
    }

    /// Stops the engine; every later `start`/`invoke`/`next` fails.
    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            info!("state machine engine halted");
        }
    }

    /// Whether [`halt`](Self::halt) was called.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Looks up a machine id by name.
    pub fn machine_id(&self, name: &str) -> Option<MachineId> {
        self.by_name.get(name).copied()
    }

    /// Name of a machine.
    pub fn machine_name(&self, id: MachineId) -> Option<&'static str> {
        self.machines.get(id.0).map(|m| m.name)
    }

    /// Number of registered machines.
    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    /// Name of the state the run is positioned at.
    pub fn state_name(&self, run: &Run<C>) -> Option<&'static str> {
        self.machines
            .get(run.cursor.machine.0)
            .and_then(|m| m.states.get(run.cursor.state.0))
            .map(|s| s.name)
    }

    /// Builds a run for the named machine.
    pub fn locate(&self, name: &str, ctx: C) -> EngineResult<Run<C>> {
        let id = self
            .machine_id(name)
            .ok_or_else(|| EngineError::UnknownMachine(name.to_string()))?;
        self.locate_id(id, ctx)
    }

    /// Builds a run for a machine id, descending through leading jumps.
    pub fn locate_id(&self, id: MachineId, ctx: C) -> EngineResult<Run<C>> {
        if id.0 >= self.machines.len() {
            return Err(EngineError::UnknownMachine(format!("#{}", id.0)));
        }
        let mut run = Run {
            ctx,
            root: id,
            cursor: Position {
                machine: id,
                state: StateId(0),
            },
            stack: ContinuationStack::new(self.config.max_stack_depth),
            aborted: false,
        };
        self.descend(&mut run)?;
        Ok(run)
    }

    /// Rewinds the run to the first state of its machine and invokes it.
    pub fn start(&self, run: &mut Run<C>, status: &mut JobStatus) -> EngineResult<StepResult> {
        self.check(run)?;
        run.stack.clear();
        run.cursor = Position {
            machine: run.root,
            state: StateId(0),
        };
        self.descend(run).map_err(|e| self.abort(run, e))?;
        self.invoke(run, status)
    }

    /// Invokes the action of the current state.
    ///
    /// On success the result is `Suspended` or `Complete`; a `Fatal` action
    /// result aborts the run and is returned as [`EngineError::ActionFailed`].
    pub fn invoke(&self, run: &mut Run<C>, status: &mut JobStatus) -> EngineResult<StepResult> {
        self.check(run)?;
        let (machine, state) = self.names(run.cursor);
        let action = match &self.state(run.cursor).body {
            StateBody::Action(action) => *action,
            // descend() never leaves the cursor on a jump
            StateBody::Jump(_) => {
                return Err(self.abort(
                    run,
                    EngineError::Malformed {
                        machine: machine.to_string(),
                        reason: format!("cursor stopped on jump state {}", state),
                    },
                ))
            }
        };

        trace!(machine, state, signal = status.error_code, "entering state");
        let result = action(&mut run.ctx, status);
        trace!(machine, state, result = result.as_raw(), "exiting state");

        match result {
            StepResult::Fatal(code) => {
                error!(machine, state, code, "state action failed");
                Err(self.abort(
                    run,
                    EngineError::ActionFailed {
                        machine: machine.to_string(),
                        state: state.to_string(),
                        code,
                    },
                ))
            }
            other => Ok(other),
        }
    }

    /// Resolves the current state's transitions against `status` and
    /// invokes the state it lands on.
    pub fn next(&self, run: &mut Run<C>, status: &mut JobStatus) -> EngineResult<StepResult> {
        self.check(run)?;
        let signal = status.error_code;
        loop {
            let state = self.state(run.cursor);
            match state.resolve(signal) {
                NextState::State(id) => {
                    run.cursor.state = id;
                    break;
                }
                NextState::Return => {
                    let (machine, _) = self.names(run.cursor);
                    let Some(parent) = run.stack.pop() else {
                        return Err(self.abort(
                            run,
                            EngineError::StackUnderflow {
                                machine: machine.to_string(),
                            },
                        ));
                    };
                    debug!(machine, depth = run.stack.depth(), "returning from nested machine");
                    run.cursor = parent;
                }
                NextState::Terminate => {
                    let (machine, state) = self.names(run.cursor);
                    error!(machine, state, signal, "state machine reached a terminate marker");
                    return Err(self.abort(
                        run,
                        EngineError::Terminated {
                            machine: machine.to_string(),
                            state: state.to_string(),
                            signal,
                        },
                    ));
                }
            }
        }
        self.descend(run).map_err(|e| self.abort(run, e))?;
        self.invoke(run, status)
    }

    /// `start`, then `next` for as long as steps complete synchronously.
    pub fn drive_start(&self, run: &mut Run<C>, status: &mut JobStatus) -> EngineResult<()> {
        let step = self.start(run, status)?;
        self.drive(run, status, step)
    }

    /// `next`, then again for as long as steps complete synchronously.
    pub fn drive_next(&self, run: &mut Run<C>, status: &mut JobStatus) -> EngineResult<()> {
        let step = self.next(run, status)?;
        self.drive(run, status, step)
    }

    fn drive(
        &self,
        run: &mut Run<C>,
        status: &mut JobStatus,
        mut step: StepResult,
    ) -> EngineResult<()> {
        while step == StepResult::Complete {
            step = self.next(run, status)?;
        }
        Ok(())
    }

    fn check(&self, run: &Run<C>) -> EngineResult<()> {
        if self.is_halted() {
            return Err(EngineError::Halted);
        }
        if run.aborted {
            return Err(EngineError::Aborted);
        }
        Ok(())
    }

    fn abort(&self, run: &mut Run<C>, err: EngineError) -> EngineError {
        run.aborted = true;
        err
    }

    /// Follows entry jumps until the cursor rests on an action state.
    fn descend(&self, run: &mut Run<C>) -> EngineResult<()> {
        while let StateBody::Jump(target) = self.state(run.cursor).body {
            run.stack.push(run.cursor)?;
            debug!(
                from = self.machines[run.cursor.machine.0].name,
                to = self.machines[target.0].name,
                depth = run.stack.depth(),
                "entering nested machine"
            );
            run.cursor = Position {
                machine: target,
                state: StateId(0),
            };
        }
        Ok(())
    }

    fn state(&self, pos: Position) -> &State<C> {
        &self.machines[pos.machine.0].states[pos.state.0]
    }

    fn names(&self, pos: Position) -> (&'static str, &'static str) {
        let machine = &self.machines[pos.machine.0];
        (machine.name, machine.states[pos.state.0].name)
    }
}

fn resolve_machine<C>(
    def: MachineDef<C>,
    machines: &HashMap<&'static str, MachineId>,
) -> EngineResult<Machine<C>> {
    let malformed = |reason: String| EngineError::Malformed {
        machine: def.name.to_string(),
        reason,
    };
    if def.states.is_empty() {
        return Err(malformed("no states".to_string()));
    }

    let mut state_ids: HashMap<&'static str, StateId> = HashMap::with_capacity(def.states.len());
    for (idx, st) in def.states.iter().enumerate() {
        if state_ids.insert(st.name, StateId(idx)).is_some() {
            return Err(malformed(format!("state {} defined twice", st.name)));
        }
    }

    let target = |state: &'static str, t: &Transition| -> EngineResult<NextState> {
        match t {
            Transition::To(name) => state_ids
                .get(name)
                .copied()
                .map(NextState::State)
                .ok_or_else(|| EngineError::UnknownState {
                    machine: def.name.to_string(),
                    state: state.to_string(),
                    target: name.to_string(),
                }),
            Transition::Return => Ok(NextState::Return),
            Transition::Terminate => Ok(NextState::Terminate),
        }
    };

    let mut states = Vec::with_capacity(def.states.len());
    for st in &def.states {
        let default = match &st.default {
            Some(t) => target(st.name, t)?,
            None => return Err(malformed(format!("state {} has no default transition", st.name))),
        };
        let transitions = st
            .transitions
            .iter()
            .map(|(signal, t)| Ok((*signal, target(st.name, t)?)))
            .collect::<EngineResult<Vec<_>>>()?;
        let body = match &st.body {
            BodyDef::Run(action) => StateBody::Action(*action),
            BodyDef::Call(name) => StateBody::Jump(
                machines
                    .get(name)
                    .copied()
                    .ok_or_else(|| EngineError::UnknownMachine(name.to_string()))?,
            ),
        };
        states.push(State {
            name: st.name,
            body,
            transitions,
            default,
        });
    }

    Ok(Machine {
        name: def.name,
        states,
    })
}
