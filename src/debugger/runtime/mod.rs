//! Runtime awareness.
//!
//! A managed runtime cooperates with the debugger through a table of exported addresses and a
//! notification function: the debugger arms a trap at that function and the runtime calls it
//! with `(code, data1, data2)` arguments. [`RuntimeHandler`] is a pluggable interpreter of
//! those notifications, [`ManagedRuntime`] is the one shipped with the crate.

pub mod info;
pub mod managed;
pub mod notification;

use crate::debugger::breakpoint::{TrapId, TrapOwner};
use crate::debugger::error::Error;
use crate::debugger::event::StopReason;
use crate::debugger::memory::MemoryAccess;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::any::Any;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

pub use managed::ManagedRuntime;
pub use notification::NotificationKind;

/// Symbol and code knowledge supplied by a front end.
pub trait SymbolLookup: Send + Sync {
    /// Address of a symbol in the process memory image, `None` if symbol is unknown
    /// (yet, a symbol may appear after a module load).
    fn resolve(&self, pid: Pid, name: &str) -> anyhow::Result<Option<u64>>;

    /// True if there is a debug info for code at `addr`, so stepping into it is meaningful.
    fn is_steppable(&self, _pid: Pid, _addr: u64) -> bool {
        false
    }
}

/// Lookup without any symbols.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoSymbols;

impl SymbolLookup for NoSymbols {
    fn resolve(&self, _: Pid, _: &str) -> anyhow::Result<Option<u64>> {
        Ok(None)
    }
}

/// Fixed symbol table, same for every process.
#[derive(Default, Debug, Clone)]
pub struct StaticSymbols {
    symbols: HashMap<String, u64>,
    steppable: Vec<Range<u64>>,
}

impl StaticSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_symbol(mut self, name: impl Into<String>, addr: u64) -> Self {
        self.symbols.insert(name.into(), addr);
        self
    }

    /// Mark code range as a code with debug info.
    pub fn with_steppable(mut self, range: Range<u64>) -> Self {
        self.steppable.push(range);
        self
    }
}

impl SymbolLookup for StaticSymbols {
    fn resolve(&self, _: Pid, name: &str) -> anyhow::Result<Option<u64>> {
        Ok(self.symbols.get(name).copied())
    }

    fn is_steppable(&self, _: Pid, addr: u64) -> bool {
        self.steppable.iter().any(|r| r.contains(&addr))
    }
}

/// Process view given to a runtime handler, the thread that caused the call is stopped.
pub trait RuntimeContext: MemoryAccess {
    fn pid(&self) -> Pid;

    /// Thread that caused a handler call.
    fn tid(&self) -> Pid;

    /// True if a debugger spawned the process by itself (not attached).
    fn is_spawned(&self) -> bool;

    fn has_thread(&self, tid: Pid) -> bool;

    /// Stack pointer of a thread that caused a handler call.
    fn stack_pointer(&mut self) -> Result<u64, Error>;

    fn resolve(&self, name: &str) -> Result<Option<u64>, Error>;

    /// Arm a software trap owned by a runtime.
    fn insert_trap(&mut self, addr: u64, owner: TrapOwner) -> Result<TrapId, Error>;

    fn remove_trap(&mut self, trap: TrapId) -> Result<(), Error>;
}

/// What a debugger does after a runtime handled a trap or a notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotificationAction {
    /// Resume thread silently.
    Resume,
    /// Report notification as [`crate::debugger::DebuggerEvent::Runtime`] and resume.
    Report,
    /// Surface a stop.
    Stop(StopReason),
    /// Stop every other thread of the process, then resume the notifying thread.
    AcquireGlobalLock,
    /// Resume threads stopped by [`NotificationAction::AcquireGlobalLock`].
    ReleaseGlobalLock,
    /// New code is available, try to resolve pending breakpoints, then resume.
    ResolveBreakpoints,
}

/// Method that must be compiled before a call into it can be followed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trampoline {
    /// Runtime function that compiles a method and returns its code address.
    pub compile_method: u64,
    pub args: Vec<u64>,
}

/// Runtime awareness of a single process.
pub trait RuntimeHandler: Send {
    fn name(&self) -> &'static str;

    /// Called once a process is stopped after spawn or attach.
    fn initialize(&mut self, ctx: &mut dyn RuntimeContext, attached: bool) -> Result<(), Error>;

    /// Trap owned by [`TrapOwner::Runtime`] hit.
    fn on_trap(
        &mut self,
        _ctx: &mut dyn RuntimeContext,
        _trap: TrapId,
    ) -> Result<NotificationAction, Error> {
        Ok(NotificationAction::Resume)
    }

    /// Notification trap hit.
    fn handle_notification(
        &mut self,
        ctx: &mut dyn RuntimeContext,
        kind: NotificationKind,
        data1: u64,
        data2: u64,
    ) -> Result<NotificationAction, Error>;

    fn thread_created(&mut self, _tid: Pid) {}

    fn thread_exited(&mut self, _tid: Pid) {}

    /// Signals used by a runtime internally, they are passed to a debugee without a stop.
    fn is_quiet_signal(&self, _signal: Signal) -> bool {
        false
    }

    /// Return a trampoline if call `target` is a not yet compiled method.
    fn trampoline(&self, _ctx: &mut dyn RuntimeContext, _target: u64) -> Option<Trampoline> {
        None
    }

    /// Process memory image replaced.
    fn on_exec(&mut self, ctx: &mut dyn RuntimeContext) -> Result<(), Error>;

    /// Debugger going to detach from a process.
    fn on_detach(&mut self, _ctx: &mut dyn RuntimeContext) -> Result<(), Error> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Constructor of per process runtime handlers.
pub type RuntimeFactory = Arc<dyn Fn() -> Box<dyn RuntimeHandler> + Send + Sync>;

/// Runtime handler of a native process, ignores every notification.
#[derive(Default, Debug)]
pub struct NativeRuntime;

impl RuntimeHandler for NativeRuntime {
    fn name(&self) -> &'static str {
        "native"
    }

    fn initialize(&mut self, _: &mut dyn RuntimeContext, _: bool) -> Result<(), Error> {
        Ok(())
    }

    fn handle_notification(
        &mut self,
        _: &mut dyn RuntimeContext,
        kind: NotificationKind,
        _: u64,
        _: u64,
    ) -> Result<NotificationAction, Error> {
        log::debug!(target: "runtime", "native runtime ignores {kind} notification");
        Ok(NotificationAction::Resume)
    }

    fn on_exec(&mut self, _: &mut dyn RuntimeContext) -> Result<(), Error> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory of [`NativeRuntime`] handlers.
pub fn native_runtime() -> RuntimeFactory {
    Arc::new(|| Box::new(NativeRuntime) as Box<dyn RuntimeHandler>)
}

/// Factory of [`ManagedRuntime`] handlers.
pub fn managed_runtime() -> RuntimeFactory {
    Arc::new(|| Box::new(ManagedRuntime::new()) as Box<dyn RuntimeHandler>)
}
