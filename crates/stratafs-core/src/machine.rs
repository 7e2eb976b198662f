//! State machine tables.
//!
//! A machine is an ordered list of states. Each state either runs an action
//! or jumps into a nested machine, and carries a transition table keyed by
//! the signal found in the job status (`error_code`), plus a mandatory
//! default entry. Machines are written with [`MachineDef`] / [`StateDef`]
//! using names, and resolved to ids when the engine is initialized.

use serde::{Deserialize, Serialize};

use crate::types::Errno;

/// Value compared against transition tables.
pub type Signal = i32;

/// Signal of a successful step.
pub const SUCCESS: Signal = 0;

/// Result of an asynchronous unit of work, handed to every action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Zero on success, a negative errno otherwise. Drives transitions.
    pub error_code: i32,
    /// Bytes moved by the job, when it moved any.
    pub actual_size: u64,
}

impl JobStatus {
    /// A successful status.
    pub fn success() -> Self {
        Self::default()
    }

    /// A failed status carrying `errno`.
    pub fn error(errno: Errno) -> Self {
        Self {
            error_code: errno.code(),
            actual_size: 0,
        }
    }

    /// Returns true when the error code is zero.
    pub fn is_success(&self) -> bool {
        self.error_code == SUCCESS
    }
}

/// What an action reports back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// Asynchronous work was posted; resume with `next` when it completes.
    Suspended,
    /// The step finished synchronously; call `next` right away.
    Complete,
    /// Unrecoverable failure; the run is aborted.
    Fatal(i32),
}

impl StepResult {
    /// Decodes the 0 / 1 / negative convention.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => StepResult::Suspended,
            r if r > 0 => StepResult::Complete,
            r => StepResult::Fatal(r),
        }
    }

    /// Encodes to the 0 / 1 / negative convention.
    pub fn as_raw(&self) -> i32 {
        match self {
            StepResult::Suspended => 0,
            StepResult::Complete => 1,
            StepResult::Fatal(code) => (*code).min(-1),
        }
    }
}

/// A state action: mutates the operation context and may rewrite the status.
pub type ActionFn<C> = fn(&mut C, &mut JobStatus) -> StepResult;

/// Transition target as written in a machine definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Continue at the named state of the same machine.
    To(&'static str),
    /// Return to the caller of this nested machine.
    Return,
    /// Illegal end of the machine; reaching it is an authoring error.
    Terminate,
}

#[derive(Debug, Clone)]
pub(crate) enum BodyDef<C> {
    Run(ActionFn<C>),
    Call(&'static str),
}

/// One state of a machine definition.
#[derive(Debug, Clone)]
pub struct StateDef<C> {
    pub(crate) name: &'static str,
    pub(crate) body: BodyDef<C>,
    pub(crate) transitions: Vec<(Signal, Transition)>,
    pub(crate) default: Option<Transition>,
}

impl<C> StateDef<C> {
    /// A state that runs `action`.
    pub fn run(name: &'static str, action: ActionFn<C>) -> Self {
        Self {
            name,
            body: BodyDef::Run(action),
            transitions: Vec::new(),
            default: None,
        }
    }

    /// A state that enters the named machine and resolves its own
    /// transitions when that machine returns.
    pub fn call(name: &'static str, machine: &'static str) -> Self {
        Self {
            name,
            body: BodyDef::Call(machine),
            transitions: Vec::new(),
            default: None,
        }
    }

    /// Adds a transition taken when the status carries `signal`.
    pub fn on(mut self, signal: Signal, to: Transition) -> Self {
        self.transitions.push((signal, to));
        self
    }

    /// Shorthand for `on(SUCCESS, ..)`.
    pub fn on_success(self, to: Transition) -> Self {
        self.on(SUCCESS, to)
    }

    /// Sets the transition taken for any unlisted signal.
    pub fn default(mut self, to: Transition) -> Self {
        self.default = Some(to);
        self
    }

    /// State name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A machine definition, resolved by [`crate::engine::Engine::initialize`].
#[derive(Debug, Clone)]
pub struct MachineDef<C> {
    pub(crate) name: &'static str,
    pub(crate) states: Vec<StateDef<C>>,
}

impl<C> MachineDef<C> {
    /// Starts an empty machine.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            states: Vec::new(),
        }
    }

    /// Appends a state. The first state is the entry point.
    pub fn state(mut self, state: StateDef<C>) -> Self {
        self.states.push(state);
        self
    }

    /// Machine name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of states.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true when no states were added.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Index of a registered machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MachineId(pub(crate) usize);

/// Index of a state inside its machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId(pub(crate) usize);

/// Resolved transition target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NextState {
    State(StateId),
    Return,
    Terminate,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum StateBody<C> {
    Action(ActionFn<C>),
    Jump(MachineId),
}

#[derive(Debug)]
pub(crate) struct State<C> {
    pub(crate) name: &'static str,
    pub(crate) body: StateBody<C>,
    pub(crate) transitions: Vec<(Signal, NextState)>,
    pub(crate) default: NextState,
}

impl<C> State<C> {
    /// First listed transition matching `signal`, else the default.
    pub(crate) fn resolve(&self, signal: Signal) -> NextState {
        self.transitions
            .iter()
            .find(|(s, _)| *s == signal)
            .map_or(self.default, |(_, next)| *next)
    }
}

#[derive(Debug)]
pub(crate) struct Machine<C> {
    pub(crate) name: &'static str,
    pub(crate) states: Vec<State<C>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut (), _: &mut JobStatus) -> StepResult {
        StepResult::Complete
    }

    #[test]
    fn test_step_result_raw() {
        assert_eq!(StepResult::from_raw(0), StepResult::Suspended);
        assert_eq!(StepResult::from_raw(1), StepResult::Complete);
        assert_eq!(StepResult::from_raw(-22), StepResult::Fatal(-22));
        assert_eq!(StepResult::Fatal(-5).as_raw(), -5);
        assert_eq!(StepResult::Fatal(0).as_raw(), -1);
        assert_eq!(StepResult::Complete.as_raw(), 1);
    }

    #[test]
    fn test_job_status() {
        assert!(JobStatus::success().is_success());
        let st = JobStatus::error(Errno::NoEnt);
        assert_eq!(st.error_code, -2);
        assert!(!st.is_success());
    }

    #[test]
    fn test_state_def_builder() {
        let st = StateDef::run("init", noop)
            .on_success(Transition::To("next"))
            .on(-2, Transition::Return)
            .default(Transition::Terminate);
        assert_eq!(st.name(), "init");
        assert_eq!(st.transitions.len(), 2);
        assert_eq!(st.transitions[1], (-2, Transition::Return));
        assert_eq!(st.default, Some(Transition::Terminate));
    }

    #[test]
    fn test_resolve_falls_through_to_default() {
        let st: State<()> = State {
            name: "s",
            body: StateBody::Action(noop),
            transitions: vec![(0, NextState::State(StateId(1))), (-2, NextState::Return)],
            default: NextState::State(StateId(4)),
        };
        assert_eq!(st.resolve(0), NextState::State(StateId(1)));
        assert_eq!(st.resolve(-2), NextState::Return);
        assert_eq!(st.resolve(-11), NextState::State(StateId(4)));
        assert_eq!(st.resolve(99), NextState::State(StateId(4)));
    }

    #[test]
    fn test_first_matching_transition_wins() {
        let st: State<()> = State {
            name: "s",
            body: StateBody::Action(noop),
            transitions: vec![(0, NextState::Return), (0, NextState::Terminate)],
            default: NextState::Terminate,
        };
        assert_eq!(st.resolve(0), NextState::Return);
    }
}
