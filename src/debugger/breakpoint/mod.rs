//! User breakpoints.
//!
//! A [`Breakpoint`] is a logical entity: it has a stable id, a location that may be resolved
//! lazily (symbol name) and an optional hit handler. Every traced process keeps a
//! [`BreakpointTable`] that binds breakpoints to physical traps of its [`BreakpointManager`].

pub mod manager;

use crate::debugger::address::TargetAddress;
use crate::debugger::channel::HardwareKind;
use crate::debugger::error::Error;
use crate::weak_error;
use log::debug;
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub use manager::{
    BreakpointManager, PatchedWrite, PhysicalKind, PhysicalTrap, TrapId, TrapIo, TrapOwner,
    TrapPolicy,
};

static GLOBAL_BP_COUNTER: AtomicU32 = AtomicU32::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(u32);

impl BreakpointId {
    fn next() -> Self {
        Self(GLOBAL_BP_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for BreakpointId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BreakpointLocation {
    Address(u64),
    /// Resolved through a symbol lookup when process is created and after every exec.
    Symbol(String),
}

impl Display for BreakpointLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakpointLocation::Address(addr) => write!(f, "{addr:#X}"),
            BreakpointLocation::Symbol(name) => f.write_str(name),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakpointKind {
    Code,
    Watch(HardwareKind),
}

/// Breakpoint hit passed into [`BreakpointHandler`].
#[derive(Clone, Debug)]
pub struct BreakpointHit {
    pub id: BreakpointId,
    pub tid: Pid,
    pub address: TargetAddress,
    /// Hit count including this hit.
    pub hits: u32,
}

/// Breakpoint hit callback.
pub trait BreakpointHandler: Send + Sync {
    /// Return true if debugee should stop on this hit.
    fn on_hit(&self, hit: &BreakpointHit) -> anyhow::Result<bool>;
}

impl<F> BreakpointHandler for F
where
    F: Fn(&BreakpointHit) -> anyhow::Result<bool> + Send + Sync,
{
    fn on_hit(&self, hit: &BreakpointHit) -> anyhow::Result<bool> {
        self(hit)
    }
}

#[derive(Clone)]
pub struct Breakpoint {
    id: BreakpointId,
    location: BreakpointLocation,
    kind: BreakpointKind,
    thread: Option<Pid>,
    handler: Option<Arc<dyn BreakpointHandler>>,
}

impl Debug for Breakpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Breakpoint")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("kind", &self.kind)
            .field("thread", &self.thread)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl Breakpoint {
    fn new(location: BreakpointLocation, kind: BreakpointKind) -> Self {
        Self {
            id: BreakpointId::next(),
            location,
            kind,
            thread: None,
            handler: None,
        }
    }

    pub fn at_address(addr: u64) -> Self {
        Self::new(BreakpointLocation::Address(addr), BreakpointKind::Code)
    }

    pub fn at_symbol(name: impl Into<String>) -> Self {
        Self::new(BreakpointLocation::Symbol(name.into()), BreakpointKind::Code)
    }

    /// Hardware watchpoint, never falls back to a software trap.
    pub fn watch(addr: u64, kind: HardwareKind) -> Self {
        Self::new(BreakpointLocation::Address(addr), BreakpointKind::Watch(kind))
    }

    /// Bind breakpoint to a single thread, hits by other threads are ignored.
    pub fn for_thread(mut self, tid: Pid) -> Self {
        self.thread = Some(tid);
        self
    }

    pub fn with_handler(mut self, handler: impl BreakpointHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn id(&self) -> BreakpointId {
        self.id
    }

    pub fn location(&self) -> &BreakpointLocation {
        &self.location
    }

    pub fn kind(&self) -> BreakpointKind {
        self.kind
    }

    pub fn thread(&self) -> Option<Pid> {
        self.thread
    }

    fn policy(&self, code_policy: TrapPolicy) -> TrapPolicy {
        match self.kind {
            BreakpointKind::Code => code_policy,
            BreakpointKind::Watch(kind) => TrapPolicy::Watch(kind),
        }
    }

    /// Ask a handler whether hit should stop the debugee.
    /// A breakpoint without handler always stops, handler errors are logged and treated as stop.
    fn should_stop(&self, hit: &BreakpointHit) -> bool {
        match &self.handler {
            None => true,
            Some(handler) => {
                weak_error!(handler.on_hit(hit).map_err(Error::Hook), "breakpoint handler:")
                    .unwrap_or(true)
            }
        }
    }
}

/// Breakpoint state snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpointInfo {
    pub id: BreakpointId,
    pub location: BreakpointLocation,
    pub enabled: bool,
    pub hits: u32,
    /// Resolved address, `None` for a pending breakpoint.
    pub address: Option<TargetAddress>,
}

#[derive(Clone, Debug)]
struct TableEntry {
    breakpoint: Breakpoint,
    enabled: bool,
    trap: Option<TrapId>,
    hits: u32,
}

/// Breakpoints of a single process.
#[derive(Clone, Debug, Default)]
pub struct BreakpointTable {
    entries: BTreeMap<BreakpointId, TableEntry>,
}

impl BreakpointTable {
    /// Add breakpoint, install a trap if address is known.
    ///
    /// # Arguments
    ///
    /// * `traps`: process trap manager
    /// * `io`: process memory and debug registers
    /// * `breakpoint`: new breakpoint
    /// * `enabled`: initial state
    /// * `address`: resolved address, `None` if breakpoint pending
    /// * `code_policy`: trap policy for code breakpoints
    pub fn add(
        &mut self,
        traps: &mut BreakpointManager,
        io: &dyn TrapIo,
        breakpoint: Breakpoint,
        enabled: bool,
        address: Option<u64>,
        code_policy: TrapPolicy,
    ) -> Result<(), Error> {
        let id = breakpoint.id;
        let trap = match address {
            None => None,
            Some(addr) => Some(traps.insert(
                io,
                TargetAddress::new(traps.domain(), addr),
                TrapOwner::Breakpoint(id),
                breakpoint.policy(code_policy),
                enabled,
            )?),
        };
        debug!(target: "debugger", "breakpoint {id} at {} added, trap: {trap:?}", breakpoint.location);

        self.entries.insert(
            id,
            TableEntry {
                breakpoint,
                enabled,
                trap,
                hits: 0,
            },
        );
        Ok(())
    }

    pub fn remove(
        &mut self,
        traps: &mut BreakpointManager,
        io: &dyn TrapIo,
        id: BreakpointId,
    ) -> Result<Breakpoint, Error> {
        let entry = self
            .entries
            .get(&id)
            .ok_or(Error::BreakpointNotFound(id))?;
        if let Some(trap) = entry.trap {
            traps.remove(io, trap)?;
        }
        let entry = self
            .entries
            .remove(&id)
            .ok_or(Error::BreakpointNotFound(id))?;
        Ok(entry.breakpoint)
    }

    pub fn set_enabled(
        &mut self,
        traps: &mut BreakpointManager,
        io: &dyn TrapIo,
        id: BreakpointId,
        enabled: bool,
    ) -> Result<(), Error> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(Error::BreakpointNotFound(id))?;
        if let Some(trap) = entry.trap {
            if enabled {
                traps.enable(io, trap)?;
            } else {
                traps.disable(io, trap)?;
            }
        }
        entry.enabled = enabled;
        Ok(())
    }

    pub fn contains(&self, id: BreakpointId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Breakpoints without installed trap, with their symbol names.
    pub fn pending(&self) -> Vec<(BreakpointId, String)> {
        self.entries
            .values()
            .filter(|e| e.trap.is_none())
            .filter_map(|e| match &e.breakpoint.location {
                BreakpointLocation::Symbol(name) => Some((e.breakpoint.id, name.clone())),
                BreakpointLocation::Address(_) => None,
            })
            .collect()
    }

    /// Install a trap for a pending breakpoint.
    pub fn resolve(
        &mut self,
        traps: &mut BreakpointManager,
        io: &dyn TrapIo,
        id: BreakpointId,
        address: u64,
        code_policy: TrapPolicy,
    ) -> Result<(), Error> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(Error::BreakpointNotFound(id))?;
        if entry.trap.is_some() {
            return Ok(());
        }
        let trap = traps.insert(
            io,
            TargetAddress::new(traps.domain(), address),
            TrapOwner::Breakpoint(id),
            entry.breakpoint.policy(code_policy),
            entry.enabled,
        )?;
        debug!(target: "debugger", "breakpoint {id} resolved at {address:#X}");
        entry.trap = Some(trap);
        Ok(())
    }

    /// Memory image replaced, every breakpoint becomes pending.
    /// Address breakpoints are returned for a reinstallation.
    pub fn reset_after_exec(&mut self) -> Vec<(BreakpointId, u64)> {
        self.entries
            .values_mut()
            .filter_map(|e| {
                e.trap = None;
                match e.breakpoint.location {
                    BreakpointLocation::Address(addr) => Some((e.breakpoint.id, addr)),
                    BreakpointLocation::Symbol(_) => None,
                }
            })
            .collect()
    }

    /// Register a trap hit by a thread, return breakpoints that want to stop the debugee.
    pub fn hit(
        &mut self,
        owners: &[(TrapId, TrapOwner)],
        tid: Pid,
        address: TargetAddress,
    ) -> Vec<BreakpointId> {
        let mut stop = vec![];
        for (_, owner) in owners {
            let TrapOwner::Breakpoint(id) = owner else {
                continue;
            };
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };
            if !entry.enabled || entry.breakpoint.thread.is_some_and(|t| t != tid) {
                continue;
            }
            entry.hits += 1;

            let hit = BreakpointHit {
                id: *id,
                tid,
                address,
                hits: entry.hits,
            };
            if entry.breakpoint.should_stop(&hit) {
                stop.push(*id);
            }
        }
        stop
    }

    /// True if any trap owner is a breakpoint applicable to the thread.
    pub fn is_relevant(&self, owners: &[(TrapId, TrapOwner)], tid: Pid) -> bool {
        owners.iter().any(|(_, owner)| match owner {
            TrapOwner::Breakpoint(id) => self.entries.get(id).is_some_and(|e| {
                e.enabled && e.breakpoint.thread.map_or(true, |t| t == tid)
            }),
            _ => false,
        })
    }

    pub fn info(&self, traps: &BreakpointManager) -> Vec<BreakpointInfo> {
        self.entries
            .values()
            .map(|e| BreakpointInfo {
                id: e.breakpoint.id,
                location: e.breakpoint.location.clone(),
                enabled: e.enabled,
                hits: e.hits,
                address: e.trap.and_then(|t| traps.address_of(t)),
            })
            .collect()
    }
}
