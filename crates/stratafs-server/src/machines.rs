//! Registry of operation state machines.

use std::collections::HashMap;

use stratafs_core::{Engine, MachineDef, MachineId, OpKind};

use crate::error::{ServerError, ServerResult};
use crate::op::ServerOp;
use crate::{ops_attr, ops_common, ops_io, ops_mgmt, ops_object};

/// Request kinds served by a machine, and the machine's name.
const SERVED: &[(OpKind, &str)] = &[
    (OpKind::Getattr, ops_attr::GETATTR),
    (OpKind::Setattr, ops_attr::SETATTR),
    (OpKind::Truncate, ops_attr::TRUNCATE),
    (OpKind::Io, ops_io::IO),
    (OpKind::SmallIo, ops_io::SMALL_IO),
    (OpKind::Create, ops_object::CREATE),
    (OpKind::Mkdir, ops_object::MKDIR),
    (OpKind::Remove, ops_object::REMOVE),
    (OpKind::MgmtSetParam, ops_mgmt::SET_PARAM),
    (OpKind::MgmtNoop, ops_mgmt::NOOP),
    (OpKind::MgmtPerfMon, ops_mgmt::PERF_MON),
    (OpKind::Statfs, ops_mgmt::STATFS),
    (OpKind::JobTimer, ops_mgmt::JOB_TIMER),
    (OpKind::PerfUpdate, ops_mgmt::PERF_UPDATE),
];

/// Every machine definition the server registers with the engine.
pub fn definitions() -> Vec<MachineDef<ServerOp>> {
    vec![
        ops_common::prelude_machine(),
        ops_common::final_response_machine(),
        ops_attr::getattr_machine(),
        ops_attr::setattr_machine(),
        ops_attr::truncate_machine(),
        ops_io::io_machine(),
        ops_io::small_io_machine(),
        ops_object::create_machine(),
        ops_object::mkdir_machine(),
        ops_object::remove_machine(),
        ops_mgmt::set_param_machine(),
        ops_mgmt::noop_machine(),
        ops_mgmt::perf_mon_machine(),
        ops_mgmt::statfs_machine(),
        ops_mgmt::job_timer_machine(),
        ops_mgmt::perf_update_machine(),
    ]
}

/// Request kind to resolved machine id.
#[derive(Debug, Clone)]
pub struct MachineTable {
    by_kind: HashMap<OpKind, MachineId>,
}

impl MachineTable {
    /// Resolves every served kind against the engine's tables.
    pub fn resolve(engine: &Engine<ServerOp>) -> ServerResult<Self> {
        let mut by_kind = HashMap::with_capacity(SERVED.len());
        for (kind, name) in SERVED {
            let id = engine
                .machine_id(name)
                .ok_or_else(|| ServerError::NoMachine(name.to_string()))?;
            by_kind.insert(*kind, id);
        }
        Ok(Self { by_kind })
    }

    /// Machine for any kind, internal ones included.
    pub fn lookup(&self, kind: OpKind) -> Option<MachineId> {
        self.by_kind.get(&kind).copied()
    }

    /// Machine for a kind received from a client; internal kinds have none.
    pub fn lookup_client(&self, kind: OpKind) -> Option<MachineId> {
        if kind.is_internal() {
            return None;
        }
        self.lookup(kind)
    }

    /// Number of kinds served.
    pub fn len(&self) -> usize {
        self.by_kind.len()
    }

    /// Returns true when no kind is served.
    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }
}
