//! Process state: threads, traps, breakpoints, invocations and a runtime handler of a single
//! traced process.
//!
//! Every mutation goes through [`ProcessState`] while a caller holds its lock. Raw statuses are
//! decoded into [`ChildEvent`]s by a thread [`Inferior`], then the state decides what happens
//! next: a thread is resumed transparently, a stepping engine gets a new input or a stop is
//! surfaced as a [`DebuggerEvent`].
//!
//! Process-wide changes that need a session registry (new threads, forked children, process
//! exit) are collected as [`Effect`]s and applied by the owner after a process lock released.

use crate::debugger::address::{AddressDomain, TargetAddress};
use crate::debugger::arch::{Architecture, Instruction};
use crate::debugger::breakpoint::{
    Breakpoint, BreakpointId, BreakpointInfo, BreakpointLocation, BreakpointManager,
    BreakpointTable, TrapId, TrapIo, TrapOwner, TrapPolicy,
};
use crate::debugger::channel::{
    ChannelError, ControlChannel, HardwareKind, RawStatus, StopOutcome, TargetInfo,
};
use crate::debugger::config::{DebuggerConfig, ForkPolicy};
use crate::debugger::error::Error;
use crate::debugger::event::{ChildEvent, DebuggerEvent, ExitStatus, ProcessId, StopReason};
use crate::debugger::inferior::{Inferior, ResumeKind, RunState};
use crate::debugger::invoke::{
    Invocation, InvocationHandle, InvocationOutcome, InvocationResult, InvocationTable,
    InvocationToken,
};
use crate::debugger::memory::{MemoryAccess, MemoryArea, TargetMemoryInfo};
use crate::debugger::register::Registers;
use crate::debugger::runtime::{
    NotificationAction, NotificationKind, RuntimeContext, RuntimeFactory, RuntimeHandler,
    SymbolLookup, Trampoline,
};
use crate::debugger::step::{StepAction, StepCommand, StepTarget, SteppingEngine};
use crate::weak_error;
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{mpsc, Arc};

/// Session parts shared by every process.
#[derive(Clone)]
pub(crate) struct Shared {
    pub channel: Arc<dyn ControlChannel>,
    pub arch: Arc<dyn Architecture>,
    pub config: Arc<DebuggerConfig>,
    pub symbols: Arc<dyn SymbolLookup>,
    pub runtime: RuntimeFactory,
    pub events: mpsc::Sender<DebuggerEvent>,
}

/// Registry change requested by a process.
pub(crate) enum Effect {
    ThreadAdded(Pid),
    ThreadRemoved(Pid),
    /// Child of a fork followed by a debugger, stopped, must be registered and continued.
    Forked(Box<ProcessState>),
    /// Process exited or detached.
    Gone,
}

/// Trap at `address` is lifted for a single step of a thread.
#[derive(Clone, Copy, Debug)]
struct StepOver {
    address: TargetAddress,
    /// How to resume a thread when step completes.
    then: ResumeKind,
}

pub(crate) struct ThreadEntry {
    inferior: Inferior,
    step_over: Option<StepOver>,
    /// Client wants this thread running.
    resumed: bool,
    /// Stopped by a debugger internally, resumed by [`ProcessState::release_held`].
    held: bool,
    /// Stopped by a runtime global thread lock.
    locked: bool,
    /// Asynchronous stop requested by a client.
    stop_requested: bool,
}

impl ThreadEntry {
    fn new(inferior: Inferior, resumed: bool) -> Self {
        Self {
            inferior,
            step_over: None,
            resumed,
            held: false,
            locked: false,
            stop_requested: false,
        }
    }
}

/// Thread snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    pub process: ProcessId,
    pub tid: Pid,
    pub state: RunState,
    /// Program counter, known for stopped threads only.
    pub pc: Option<TargetAddress>,
    /// Number of nested invocations in progress.
    pub invocations: usize,
}

/// Memory and debug registers of a process accessed through one stopped thread.
struct ProcessIo<'a> {
    channel: &'a dyn ControlChannel,
    tid: Pid,
    threads: SmallVec<[Pid; 8]>,
}

impl<'a> ProcessIo<'a> {
    fn new(channel: &'a dyn ControlChannel, threads: &BTreeMap<Pid, ThreadEntry>, tid: Pid) -> Self {
        Self {
            channel,
            tid,
            threads: threads.keys().copied().collect(),
        }
    }
}

impl TrapIo for ProcessIo<'_> {
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>, Error> {
        Ok(self.channel.read_memory(self.tid, addr, size)?)
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), Error> {
        Ok(self.channel.write_memory(self.tid, addr, data)?)
    }

    /// Slot is programmed in every thread or in none of them.
    fn set_hw_slot(&self, slot: usize, addr: u64, kind: HardwareKind) -> Result<(), Error> {
        for (i, tid) in self.threads.iter().enumerate() {
            if let Err(e) = self.channel.insert_hw_breakpoint(*tid, slot, addr, kind) {
                for programmed in &self.threads[..i] {
                    weak_error!(
                        self.channel.remove_hw_breakpoint(*programmed, slot),
                        "rollback debug registers:"
                    );
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn clear_hw_slot(&self, slot: usize) -> Result<(), Error> {
        for tid in &self.threads {
            self.channel.remove_hw_breakpoint(*tid, slot)?;
        }
        Ok(())
    }
}

/// Process view for runtime handlers and stepping engines.
struct ProcessContext<'a> {
    tid: Pid,
    pid: Pid,
    spawned: bool,
    memory_info: TargetMemoryInfo,
    threads: &'a mut BTreeMap<Pid, ThreadEntry>,
    traps: &'a mut BreakpointManager,
    channel: &'a dyn ControlChannel,
    symbols: &'a dyn SymbolLookup,
}

impl ProcessContext<'_> {
    fn inferior(&mut self) -> Result<&mut Inferior, Error> {
        self.threads
            .get_mut(&self.tid)
            .map(|entry| &mut entry.inferior)
            .ok_or(Error::ThreadNotFound(self.tid))
    }
}

impl MemoryAccess for ProcessContext<'_> {
    fn memory_info(&self) -> TargetMemoryInfo {
        self.memory_info
    }

    fn domain(&self) -> AddressDomain {
        self.traps.domain()
    }

    fn read_buffer(&self, addr: TargetAddress, size: usize) -> Result<Vec<u8>, Error> {
        if addr.domain() != self.traps.domain() {
            return Err(Error::DomainMismatch);
        }
        let mut bytes = self.channel.read_memory(self.tid, addr.as_u64(), size)?;
        self.traps.shadow(addr.as_u64(), &mut bytes);
        Ok(bytes)
    }

    fn write_buffer(&mut self, addr: TargetAddress, data: &[u8]) -> Result<(), Error> {
        let entry = self
            .threads
            .get_mut(&self.tid)
            .ok_or(Error::ThreadNotFound(self.tid))?;
        entry.inferior.memory(self.traps).write_buffer(addr, data)
    }
}

impl RuntimeContext for ProcessContext<'_> {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn tid(&self) -> Pid {
        self.tid
    }

    fn is_spawned(&self) -> bool {
        self.spawned
    }

    fn has_thread(&self, tid: Pid) -> bool {
        self.threads.contains_key(&tid)
    }

    fn stack_pointer(&mut self) -> Result<u64, Error> {
        self.inferior()?.sp()
    }

    fn resolve(&self, name: &str) -> Result<Option<u64>, Error> {
        self.symbols.resolve(self.pid, name).map_err(Error::Hook)
    }

    fn insert_trap(&mut self, addr: u64, owner: TrapOwner) -> Result<TrapId, Error> {
        let io = ProcessIo::new(self.channel, self.threads, self.tid);
        let address = TargetAddress::new(self.traps.domain(), addr);
        self.traps
            .insert(&io, address, owner, TrapPolicy::Software, true)
    }

    fn remove_trap(&mut self, trap: TrapId) -> Result<(), Error> {
        let io = ProcessIo::new(self.channel, self.threads, self.tid);
        self.traps.remove(&io, trap)
    }
}

/// Stopped thread as seen by a stepping engine.
struct ThreadTarget<'a> {
    ctx: ProcessContext<'a>,
    runtime: &'a dyn RuntimeHandler,
    arch: &'a dyn Architecture,
}

impl StepTarget for ThreadTarget<'_> {
    fn pc(&mut self) -> Result<TargetAddress, Error> {
        self.ctx.inferior()?.pc()
    }

    fn sp(&mut self) -> Result<u64, Error> {
        self.ctx.inferior()?.sp()
    }

    fn instruction(&mut self, addr: TargetAddress) -> Result<Instruction, Error> {
        let len = self.arch.max_instruction_len();
        let code = match self.ctx.read_buffer(addr, len) {
            Ok(code) => code,
            Err(_) => {
                // instruction at the end of a mapping
                let mut code = Vec::with_capacity(len);
                for offset in 0..len as u64 {
                    match self.ctx.read_buffer(addr + offset, 1) {
                        Ok(byte) => code.extend(byte),
                        Err(_) => break,
                    }
                }
                code
            }
        };
        self.arch.decode(addr.as_u64(), &code)
    }

    fn return_address(&mut self) -> Result<TargetAddress, Error> {
        self.ctx.inferior()?.return_address()
    }

    fn is_steppable(&self, addr: TargetAddress) -> bool {
        self.ctx.symbols.is_steppable(self.ctx.pid, addr.as_u64())
    }

    fn trampoline(&mut self, target: TargetAddress) -> Option<Trampoline> {
        self.runtime.trampoline(&mut self.ctx, target.as_u64())
    }
}

/// Traced process.
pub(crate) struct ProcessState {
    id: ProcessId,
    pid: Pid,
    spawned: bool,
    info: TargetInfo,
    memory_info: TargetMemoryInfo,
    shared: Shared,
    threads: BTreeMap<Pid, ThreadEntry>,
    engines: HashMap<Pid, SteppingEngine>,
    traps: BreakpointManager,
    breakpoints: BreakpointTable,
    invocations: InvocationTable,
    runtime: Box<dyn RuntimeHandler>,
    /// Statuses observed while doing something else.
    pending: VecDeque<(Pid, RawStatus)>,
    /// Exit status of a thread group leader.
    exit_status: Option<ExitStatus>,
    exited: bool,
    effects: Vec<Effect>,
}

impl ProcessState {
    pub(crate) fn new(
        id: ProcessId,
        pid: Pid,
        spawned: bool,
        info: TargetInfo,
        domain: AddressDomain,
        shared: Shared,
    ) -> Self {
        let traps = BreakpointManager::new(
            domain,
            shared.arch.breakpoint_instruction(),
            info.hardware_slots,
        );
        Self::with_parts(id, pid, spawned, info, shared, traps, BreakpointTable::default())
    }

    fn with_parts(
        id: ProcessId,
        pid: Pid,
        spawned: bool,
        info: TargetInfo,
        shared: Shared,
        traps: BreakpointManager,
        breakpoints: BreakpointTable,
    ) -> Self {
        let runtime = (shared.runtime)();
        Self {
            id,
            pid,
            spawned,
            info,
            memory_info: TargetMemoryInfo::from(info),
            shared,
            threads: BTreeMap::new(),
            engines: HashMap::new(),
            traps,
            breakpoints,
            invocations: InvocationTable::default(),
            runtime,
            pending: VecDeque::new(),
            exit_status: None,
            exited: false,
            effects: vec![],
        }
    }

    pub(crate) fn id(&self) -> ProcessId {
        self.id
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn domain(&self) -> AddressDomain {
        self.traps.domain()
    }

    pub(crate) fn is_spawned(&self) -> bool {
        self.spawned
    }

    pub(crate) fn tids(&self) -> Vec<Pid> {
        self.threads.keys().copied().collect()
    }

    pub(crate) fn physical_trap_count(&self) -> usize {
        self.traps.physical_count()
    }

    pub(crate) fn runtime(&self) -> &dyn RuntimeHandler {
        self.runtime.as_ref()
    }

    pub(crate) fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    fn check_alive(&self) -> Result<(), Error> {
        if self.exited {
            return Err(Error::NoTarget);
        }
        Ok(())
    }

    fn entry(&mut self, tid: Pid) -> Result<&mut ThreadEntry, Error> {
        self.threads
            .get_mut(&tid)
            .ok_or(Error::ThreadNotFound(tid))
    }

    fn emit(&self, event: DebuggerEvent) {
        if self.shared.events.send(event).is_err() {
            debug!(target: "debugger", "event receiver gone");
        }
    }

    fn code_policy(&self) -> TrapPolicy {
        if self.shared.config.prefer_hardware_breakpoints {
            TrapPolicy::PreferHardware {
                fallback: self.shared.config.allow_software_fallback,
            }
        } else {
            TrapPolicy::Software
        }
    }

    fn is_stepping(&self, tid: Pid) -> bool {
        self.engines
            .get(&tid)
            .is_some_and(SteppingEngine::is_active)
    }

    /// Thread must run: a client resumed it, it steps or runs an invocation.
    fn wants_run(&self, tid: Pid) -> bool {
        self.is_stepping(tid)
            || self
                .threads
                .get(&tid)
                .is_some_and(|e| e.resumed || e.inferior.callback_depth() > 0)
    }

    /// Thread used for memory access, leader preferred.
    fn io_tid(&self) -> Option<Pid> {
        if self
            .threads
            .get(&self.pid)
            .is_some_and(|e| e.inferior.is_stopped())
        {
            return Some(self.pid);
        }
        self.threads
            .iter()
            .find(|(_, e)| e.inferior.is_stopped())
            .map(|(tid, _)| *tid)
    }

    /// Add a thread that is already stopped by a channel (spawn, attach).
    pub(crate) fn add_thread(&mut self, tid: Pid) -> Result<(), Error> {
        let mut inferior = Inferior::new(
            tid,
            self.pid,
            self.id,
            self.traps.domain(),
            self.shared.channel.clone(),
            self.shared.arch.clone(),
            self.memory_info,
        );
        inferior.initialize(false)?;
        self.threads.insert(tid, ThreadEntry::new(inferior, false));
        Ok(())
    }

    /// Look for a runtime in a freshly spawned or attached process.
    pub(crate) fn initialize_runtime(&mut self, attached: bool) {
        let tid = self.pid;
        let result = self.with_runtime(tid, |runtime, ctx| runtime.initialize(ctx, attached));
        if let Err(e) = result {
            warn!(target: "runtime", "{} runtime initialization: {e:#}", self.id);
        }
    }

    fn with_runtime<T>(
        &mut self,
        tid: Pid,
        f: impl FnOnce(&mut dyn RuntimeHandler, &mut dyn RuntimeContext) -> T,
    ) -> T {
        let mut ctx = ProcessContext {
            tid,
            pid: self.pid,
            spawned: self.spawned,
            memory_info: self.memory_info,
            threads: &mut self.threads,
            traps: &mut self.traps,
            channel: self.shared.channel.as_ref(),
            symbols: self.shared.symbols.as_ref(),
        };
        f(self.runtime.as_mut(), &mut ctx)
    }

    fn drive(
        &mut self,
        tid: Pid,
        f: impl FnOnce(&mut SteppingEngine, &mut dyn StepTarget) -> Result<StepAction, Error>,
    ) -> Result<StepAction, Error> {
        let engine = self.engines.entry(tid).or_default();
        let mut target = ThreadTarget {
            ctx: ProcessContext {
                tid,
                pid: self.pid,
                spawned: self.spawned,
                memory_info: self.memory_info,
                threads: &mut self.threads,
                traps: &mut self.traps,
                channel: self.shared.channel.as_ref(),
                symbols: self.shared.symbols.as_ref(),
            },
            runtime: self.runtime.as_ref(),
            arch: self.shared.arch.as_ref(),
        };
        f(engine, &mut target)
    }

    // ---------------------------------- event handling ------------------------------------------

    /// Queue a status observed outside of this process lock.
    pub(crate) fn enqueue(&mut self, tid: Pid, status: RawStatus) {
        self.pending.push_back((tid, status));
    }

    pub(crate) fn drain_pending(&mut self) {
        while let Some((tid, status)) = self.pending.pop_front() {
            self.handle_status(tid, status);
        }
    }

    /// Handle a raw status of a thread of this process.
    pub(crate) fn handle_status(&mut self, tid: Pid, status: RawStatus) {
        if self.exited {
            debug!(target: "debugger", "status of exited {}: {status:?}", self.id);
            return;
        }
        let event = match self.shared.channel.dispatch_event(tid, status) {
            Ok(event) => event,
            Err(ChannelError::Dispatched) => {
                debug!(target: "debugger", "thread {tid} status {status:?} already handled");
                return;
            }
            Err(e) => {
                warn!(target: "debugger", "thread {tid} status {status:?}: {e:#}");
                return;
            }
        };
        let Some(entry) = self.threads.get_mut(&tid) else {
            debug!(target: "debugger", "status of unknown thread {tid}: {status:?}");
            return;
        };
        let event = entry
            .inferior
            .decode(event, &self.traps)
            .unwrap_or_else(|e| ChildEvent::InternalError(e.to_string()));
        debug!(target: "debugger", "thread {tid}: {event:?}");

        if let Err(e) = self.handle_child(tid, event) {
            warn!(target: "debugger", "thread {tid} event handling: {e:#}");
            self.fail(tid, e.to_string());
        }
    }

    fn handle_child(&mut self, tid: Pid, event: ChildEvent) -> Result<(), Error> {
        if let ChildEvent::Stopped {
            signal: Some(signal),
        } = event
        {
            if self.shared.config.is_quiet(signal) || self.runtime.is_quiet_signal(signal) {
                return self.pass_signal(tid, signal);
            }
        }

        // ptrace event stops happen inside a syscall, a step over continues after them
        let finishes_step_over = !matches!(
            event,
            ChildEvent::ThreadCreated(_)
                | ChildEvent::Forked(_)
                | ChildEvent::CalledExit
                | ChildEvent::Execd
                | ChildEvent::Exited(_)
                | ChildEvent::Signaled(_)
        );
        let step_over = if finishes_step_over {
            self.finish_step_over(tid)
        } else {
            None
        };

        let result = match event {
            ChildEvent::Exited(code) => self.thread_gone(tid, ExitStatus::Code(code)),
            ChildEvent::Signaled(signal) => self.thread_gone(tid, ExitStatus::Signal(signal)),
            ChildEvent::Stopped { signal: None } => match step_over.map(|so| so.then) {
                Some(ResumeKind::Step) | None => self.on_single_step(tid),
                Some(kind) => self.resume_thread(tid, kind),
            },
            ChildEvent::Stopped {
                signal: Some(signal),
            } => {
                self.abort_step(tid);
                let address = self.pc_of(tid);
                self.surface(
                    tid,
                    DebuggerEvent::Stopped {
                        process: self.id,
                        tid,
                        address,
                        reason: StopReason::Signal(signal),
                    },
                );
                Ok(())
            }
            ChildEvent::Interrupted => self.on_interrupted(tid, step_over),
            ChildEvent::HitBreakpoint {
                address, owners, ..
            } => self.on_trap_hit(tid, address, &owners),
            ChildEvent::Notification { kind, data1, data2 } => {
                self.on_notification(tid, kind, data1, data2)
            }
            ChildEvent::CallbackCompleted {
                token,
                data1,
                data2,
                ..
            } => self.on_callback_completed(tid, token, data1, data2),
            ChildEvent::ThreadCreated(new_tid) => self.on_thread_created(tid, new_tid),
            ChildEvent::Forked(child) => self.on_fork(tid, child),
            ChildEvent::Execd => self.on_exec(tid),
            ChildEvent::CalledExit => self.continue_thread(tid),
            ChildEvent::InternalError(msg) => {
                self.fail(tid, msg);
                Ok(())
            }
        };

        if step_over.is_some() {
            self.release_held();
        }
        result
    }

    fn pc_of(&mut self, tid: Pid) -> Option<TargetAddress> {
        self.threads
            .get_mut(&tid)
            .and_then(|e| e.inferior.pc().ok())
    }

    /// Surface an error stop of a thread.
    fn fail(&mut self, tid: Pid, msg: String) {
        self.abort_step(tid);
        let address = self.pc_of(tid);
        self.surface(
            tid,
            DebuggerEvent::Stopped {
                process: self.id,
                tid,
                address,
                reason: StopReason::Error(msg),
            },
        );
    }

    /// Make an event visible to a client, the whole process stops.
    /// Threads with an active step keep going.
    fn surface(&mut self, tid: Pid, event: DebuggerEvent) {
        for entry in self.threads.values_mut() {
            entry.resumed = false;
        }
        weak_error!(self.hold_others(Some(tid), true), "stop threads:");
        self.emit(event);
    }

    fn pass_signal(&mut self, tid: Pid, signal: Signal) -> Result<(), Error> {
        let run = self.wants_run(tid);
        let entry = self.entry(tid)?;
        if run || entry.step_over.is_some() {
            debug!(target: "debugger", "pass signal {signal} to {tid}");
            entry.inferior.redeliver(signal)
        } else {
            // delivered on next continue
            entry.held = true;
            Ok(())
        }
    }

    fn on_single_step(&mut self, tid: Pid) -> Result<(), Error> {
        if !self.is_stepping(tid) {
            debug!(target: "debugger", "stray single step of {tid}");
            return self.continue_thread(tid);
        }
        let action = self.drive(tid, |engine, target| engine.on_step_complete(target))?;
        self.execute(tid, action)
    }

    fn on_interrupted(&mut self, tid: Pid, step_over: Option<StepOver>) -> Result<(), Error> {
        let entry = self.entry(tid)?;
        if entry.stop_requested {
            entry.stop_requested = false;
            entry.resumed = false;
            self.abort_step(tid);
            let address = self.pc_of(tid);
            self.emit(DebuggerEvent::Stopped {
                process: self.id,
                tid,
                address,
                reason: StopReason::Interrupted,
            });
            return Ok(());
        }
        match step_over {
            Some(so) => self.resume_thread(tid, so.then),
            None => self.continue_thread(tid),
        }
    }

    fn on_trap_hit(
        &mut self,
        tid: Pid,
        address: TargetAddress,
        owners: &[(TrapId, TrapOwner)],
    ) -> Result<(), Error> {
        let stop = self.breakpoints.hit(owners, tid, address);
        if !stop.is_empty() {
            self.abort_step(tid);
            self.surface(
                tid,
                DebuggerEvent::HitBreakpoint {
                    process: self.id,
                    tid,
                    address,
                    breakpoints: stop,
                },
            );
            return Ok(());
        }

        if owners
            .iter()
            .any(|(_, owner)| *owner == TrapOwner::Step(tid))
        {
            if self.is_stepping(tid) {
                let action = self.drive(tid, |engine, target| engine.on_temp_trap(target, address))?;
                return self.execute(tid, action);
            }
            self.clear_step_traps(tid);
        }

        if let Some((trap, _)) = owners
            .iter()
            .find(|(_, owner)| *owner == TrapOwner::Runtime)
        {
            let trap = *trap;
            let action = self
                .with_runtime(tid, |runtime, ctx| runtime.on_trap(ctx, trap))
                .unwrap_or_else(|e| {
                    warn!(target: "runtime", "runtime trap {trap}: {e:#}");
                    NotificationAction::Resume
                });
            return self.apply_runtime_action(tid, action, None);
        }

        // trap of another thread or a filtered breakpoint
        self.continue_thread(tid)
    }

    fn on_notification(
        &mut self,
        tid: Pid,
        kind: NotificationKind,
        data1: u64,
        data2: u64,
    ) -> Result<(), Error> {
        debug!(target: "runtime", "thread {tid} notification {kind} ({data1:#X}, {data2:#X})");
        let action = self
            .with_runtime(tid, |runtime, ctx| {
                runtime.handle_notification(ctx, kind, data1, data2)
            })
            .unwrap_or_else(|e| {
                warn!(target: "runtime", "notification {kind}: {e:#}");
                NotificationAction::Resume
            });
        self.apply_runtime_action(tid, action, Some((kind, data1, data2)))
    }

    fn apply_runtime_action(
        &mut self,
        tid: Pid,
        action: NotificationAction,
        notification: Option<(NotificationKind, u64, u64)>,
    ) -> Result<(), Error> {
        match action {
            NotificationAction::Resume => self.continue_thread(tid),
            NotificationAction::Report => {
                if let Some((kind, data1, data2)) = notification {
                    self.emit(DebuggerEvent::Runtime {
                        process: self.id,
                        tid,
                        kind,
                        data1,
                        data2,
                    });
                }
                self.continue_thread(tid)
            }
            NotificationAction::Stop(reason) => {
                self.abort_step(tid);
                let address = self.pc_of(tid);
                self.surface(
                    tid,
                    DebuggerEvent::Stopped {
                        process: self.id,
                        tid,
                        address,
                        reason,
                    },
                );
                Ok(())
            }
            NotificationAction::AcquireGlobalLock => {
                let others: Vec<Pid> = self.threads.keys().copied().filter(|t| *t != tid).collect();
                for other in others {
                    self.stop_one(other)?;
                    if let Some(entry) = self.threads.get_mut(&other) {
                        entry.locked = true;
                        entry.held = false;
                    }
                }
                self.continue_thread(tid)
            }
            NotificationAction::ReleaseGlobalLock => {
                for entry in self.threads.values_mut() {
                    if entry.locked {
                        entry.locked = false;
                        entry.held = true;
                    }
                }
                self.continue_thread(tid)?;
                self.release_held();
                Ok(())
            }
            NotificationAction::ResolveBreakpoints => {
                self.resolve_pending(tid);
                self.continue_thread(tid)
            }
        }
    }

    fn on_callback_completed(
        &mut self,
        tid: Pid,
        token: InvocationToken,
        data1: u64,
        data2: u64,
    ) -> Result<(), Error> {
        let Some(pending) = self.invocations.take(token) else {
            return self.continue_thread(tid);
        };

        let domain = self.traps.domain();
        let entry = self
            .threads
            .get_mut(&tid)
            .ok_or(Error::ThreadNotFound(tid))?;
        let blob = match pending.blob_size {
            Some(size) if data1 != 0 => weak_error!(
                entry
                    .inferior
                    .memory(&mut self.traps)
                    .read_buffer(TargetAddress::new(domain, data1), size),
                "invocation result:"
            ),
            _ => None,
        };
        entry.inferior.pop_registers()?;
        let io = ProcessIo::new(self.shared.channel.as_ref(), &self.threads, tid);
        weak_error!(self.traps.remove(&io, pending.trap), "remove return trap:");
        debug!(target: "debugger", "invocation {token} on {tid} completed: ({data1:#X}, {data2:#X})");

        pending.resolve(InvocationOutcome::Completed(InvocationResult {
            data1,
            data2,
            blob,
        }));

        if token.is_internal() {
            if self.engines.get(&tid).is_some_and(SteppingEngine::is_compiling) {
                let action = self.drive(tid, |engine, _| engine.on_compiled(data1))?;
                return self.execute(tid, action);
            }
            return self.continue_thread(tid);
        }

        self.emit(DebuggerEvent::InvocationCompleted {
            process: self.id,
            tid,
            token,
            data1,
            data2,
        });
        Ok(())
    }

    fn on_thread_created(&mut self, parent: Pid, tid: Pid) -> Result<(), Error> {
        if !self.shared.config.adopt_threads {
            self.shared.channel.initialize_thread(tid, true)?;
            self.shared.channel.detach(tid)?;
            debug!(target: "debugger", "thread {tid} of {} left untraced", self.id);
            return self.continue_thread(parent);
        }

        let mut inferior = Inferior::new(
            tid,
            self.pid,
            self.id,
            self.traps.domain(),
            self.shared.channel.clone(),
            self.shared.arch.clone(),
            self.memory_info,
        );
        inferior.initialize(true)?;
        for (slot, addr, kind) in self.traps.active_slots() {
            weak_error!(
                self.shared.channel.insert_hw_breakpoint(tid, slot, addr, kind),
                "program debug registers:"
            );
        }

        let resumed = self.threads.get(&parent).is_some_and(|e| e.resumed);
        self.threads.insert(tid, ThreadEntry::new(inferior, resumed));
        self.runtime.thread_created(tid);
        self.effects.push(Effect::ThreadAdded(tid));
        info!(target: "debugger", "new thread {tid} in {}", self.id);
        self.emit(DebuggerEvent::ThreadCreated {
            process: self.id,
            tid,
        });

        self.continue_thread(tid)?;
        self.continue_thread(parent)
    }

    fn on_fork(&mut self, parent_tid: Pid, child: Pid) -> Result<(), Error> {
        self.shared.channel.initialize_thread(child, true)?;
        let channel = self.shared.channel.as_ref();
        let child_io = ProcessIo {
            channel,
            tid: child,
            threads: SmallVec::from_slice(&[child]),
        };

        match self.shared.config.fork_policy {
            ForkPolicy::Follow => {
                let domain = AddressDomain::new();
                let traps = self.traps.clone_for_fork(domain, &child_io)?;
                let id = ProcessId::next();
                let mut state = ProcessState::with_parts(
                    id,
                    child,
                    self.spawned,
                    self.info,
                    self.shared.clone(),
                    traps,
                    self.breakpoints.clone(),
                );
                state.add_thread(child)?;
                info!(target: "debugger", "follow fork of {}: {id} ({child})", self.id);
                self.emit(DebuggerEvent::ProcessForked {
                    parent: self.id,
                    child_pid: child,
                    child: Some(id),
                });
                self.effects.push(Effect::Forked(Box::new(state)));
            }
            ForkPolicy::Detach => {
                self.traps.restore_memory(&child_io)?;
                channel.detach(child)?;
                debug!(target: "debugger", "fork child {child} of {} detached", self.id);
                self.emit(DebuggerEvent::ProcessForked {
                    parent: self.id,
                    child_pid: child,
                    child: None,
                });
            }
        }

        self.continue_thread(parent_tid)
    }

    fn on_exec(&mut self, tid: Pid) -> Result<(), Error> {
        let others: Vec<Pid> = self.threads.keys().copied().filter(|t| *t != tid).collect();
        for other in others {
            self.threads.remove(&other);
            self.engines.remove(&other);
            self.runtime.thread_exited(other);
            self.abort_thread_invocations(other);
            self.effects.push(Effect::ThreadRemoved(other));
            self.emit(DebuggerEvent::ThreadExited {
                process: self.id,
                tid: other,
            });
        }
        self.abort_step(tid);
        self.abort_thread_invocations(tid);

        let domain = AddressDomain::new();
        self.traps.reset_after_exec(domain);
        let entry = self.entry(tid)?;
        entry.step_over = None;
        entry.inferior.drop_callbacks();
        entry.inferior.set_domain(domain);
        info!(target: "debugger", "{} replaced its image, new domain {domain}", self.id);

        let policy = self.code_policy();
        let io = ProcessIo::new(self.shared.channel.as_ref(), &self.threads, tid);
        for (id, addr) in self.breakpoints.reset_after_exec() {
            weak_error!(
                self.breakpoints
                    .resolve(&mut self.traps, &io, id, addr, policy),
                "reinstall breakpoint:"
            );
        }
        self.resolve_pending(tid);

        let result = self.with_runtime(tid, |runtime, ctx| runtime.on_exec(ctx));
        if let Err(e) = result {
            warn!(target: "runtime", "runtime after exec: {e:#}");
        }

        self.emit(DebuggerEvent::ProcessExecd { process: self.id });
        if self.shared.config.stop_on_exec {
            let address = self.pc_of(tid);
            self.surface(
                tid,
                DebuggerEvent::Stopped {
                    process: self.id,
                    tid,
                    address,
                    reason: StopReason::Exec,
                },
            );
            return Ok(());
        }
        self.continue_thread(tid)
    }

    fn thread_gone(&mut self, tid: Pid, status: ExitStatus) -> Result<(), Error> {
        let Some(entry) = self.threads.remove(&tid) else {
            return Ok(());
        };
        if let Some(mut engine) = self.engines.remove(&tid) {
            engine.abort();
        }
        self.runtime.thread_exited(tid);
        self.abort_thread_invocations(tid);
        if tid == self.pid {
            self.exit_status = Some(status);
        }

        if self.threads.is_empty() {
            self.traps.forget_all();
            self.exited = true;
            self.effects.push(Effect::Gone);
            let status = self.exit_status.unwrap_or(status);
            info!(target: "debugger", "{} exited: {status:?}", self.id);
            self.emit(DebuggerEvent::ProcessExited {
                process: self.id,
                status,
            });
            return Ok(());
        }

        debug!(target: "debugger", "thread {tid} exited: {status:?}");
        self.effects.push(Effect::ThreadRemoved(tid));
        self.emit(DebuggerEvent::ThreadExited {
            process: self.id,
            tid,
        });

        let mut leftovers = self.traps.entries_of(TrapOwner::Step(tid));
        leftovers.extend(self.traps.entries_of(TrapOwner::CallReturn(tid)));
        match self.io_tid() {
            Some(io_tid) => {
                let io = ProcessIo::new(self.shared.channel.as_ref(), &self.threads, io_tid);
                for trap in leftovers {
                    weak_error!(self.traps.remove(&io, trap), "remove thread trap:");
                }
                if let Some(so) = entry.step_over {
                    weak_error!(self.traps.unlift(&io, so.address), "unlift:");
                }
            }
            None if !leftovers.is_empty() || entry.step_over.is_some() => {
                warn!(target: "debugger", "no stopped thread to clean up traps of {tid}");
            }
            None => {}
        }
        self.release_held();
        Ok(())
    }

    // ---------------------------------- run control ---------------------------------------------

    /// Stop a running thread synchronously.
    /// Return true if the thread was stopped by this request, an unrelated stop is queued.
    fn stop_one(&mut self, tid: Pid) -> Result<bool, Error> {
        let Some(entry) = self.threads.get_mut(&tid) else {
            return Ok(false);
        };
        match entry.inferior.stop_and_wait()? {
            StopOutcome::Interrupted => Ok(true),
            StopOutcome::AlreadyStopped => Ok(false),
            StopOutcome::Event(status) => {
                self.pending.push_back((tid, status));
                Ok(false)
            }
        }
    }

    /// Stop every running thread except `except`, stopped threads become held.
    fn hold_others(&mut self, except: Option<Pid>, keep_stepping: bool) -> Result<(), Error> {
        let targets: Vec<Pid> = self
            .threads
            .iter()
            .filter(|(tid, e)| {
                Some(**tid) != except && e.inferior.run_state() == RunState::Running
            })
            .filter(|(tid, _)| !keep_stepping || !self.is_stepping(**tid))
            .map(|(tid, _)| *tid)
            .collect();
        for tid in targets {
            if self.stop_one(tid)? {
                if let Some(entry) = self.threads.get_mut(&tid) {
                    entry.held = true;
                }
            }
        }
        Ok(())
    }

    /// Stop every running thread, return threads stopped by this call.
    fn suspend_all(&mut self) -> Result<Vec<Pid>, Error> {
        let running: Vec<Pid> = self
            .threads
            .iter()
            .filter(|(_, e)| e.inferior.run_state() == RunState::Running)
            .map(|(tid, _)| *tid)
            .collect();
        let mut stopped = vec![];
        for tid in running {
            if self.stop_one(tid)? {
                stopped.push(tid);
            }
        }
        Ok(stopped)
    }

    /// Run `f` while every thread is stopped, `f` gets a thread for memory access.
    fn with_suspended<T>(
        &mut self,
        f: impl FnOnce(&mut Self, Pid) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let suspended = self.suspend_all()?;
        let result = match self.io_tid() {
            Some(tid) => f(self, tid),
            None => Err(Error::NoTarget),
        };
        for tid in suspended {
            if self.threads.get(&tid).is_some_and(|e| e.inferior.is_stopped()) {
                weak_error!(self.rerun(tid), "resume thread:");
            }
        }
        self.drain_pending();
        result
    }

    /// Resume a stopped thread, a software trap at the program counter is stepped over first.
    fn resume_thread(&mut self, tid: Pid, kind: ResumeKind) -> Result<(), Error> {
        let entry = self.entry(tid)?;
        let pc = entry.inferior.pc()?;
        // thread that never ran hits a trap at its first instruction
        let ran = entry.inferior.last_resume().is_some();
        if ran && self.traps.is_software_trap(pc) {
            // nobody else may pass the address while original bytes are in place
            self.hold_others(Some(tid), false)?;
            let io = ProcessIo::new(self.shared.channel.as_ref(), &self.threads, tid);
            self.traps.lift(&io, pc)?;
            let entry = self
                .threads
                .get_mut(&tid)
                .ok_or(Error::ThreadNotFound(tid))?;
            entry.held = false;
            entry.step_over = Some(StepOver {
                address: pc,
                then: kind,
            });
            if let Err(e) = entry.inferior.step() {
                entry.step_over = None;
                let io = ProcessIo::new(self.shared.channel.as_ref(), &self.threads, tid);
                weak_error!(self.traps.unlift(&io, pc), "unlift:");
                return Err(e);
            }
            debug!(target: "debugger", "thread {tid} steps over a trap at {pc}");
            return Ok(());
        }

        let hardware = ran && self.traps.lookup(pc).is_some_and(|trap| !trap.is_software());
        let arch = self.shared.arch.clone();
        let entry = self.entry(tid)?;
        if hardware {
            let mut regs = entry.inferior.registers()?;
            arch.set_resume_flag(&mut regs);
            entry.inferior.set_registers(&regs)?;
        }
        entry.held = false;
        match kind {
            ResumeKind::Step => entry.inferior.step(),
            ResumeKind::Cont => entry.inferior.cont(),
            ResumeKind::Resume => entry.inferior.resume(),
        }
    }

    /// Resume a thread the same way it ran before a stop.
    fn rerun(&mut self, tid: Pid) -> Result<(), Error> {
        let stepping = self.is_stepping(tid);
        let entry = self.entry(tid)?;
        if entry.step_over.is_some() {
            return entry.inferior.step();
        }
        let kind = match entry.inferior.last_resume() {
            Some(ResumeKind::Step) if stepping => ResumeKind::Step,
            Some(ResumeKind::Resume) => ResumeKind::Resume,
            _ => ResumeKind::Cont,
        };
        self.resume_thread(tid, kind)
    }

    /// Continue a thread after a stop handled internally.
    /// Thread stays held if a client doesn't want it running.
    fn continue_thread(&mut self, tid: Pid) -> Result<(), Error> {
        let run = self.wants_run(tid);
        let Some(entry) = self.threads.get_mut(&tid) else {
            return Ok(());
        };
        if !run && entry.step_over.is_none() {
            entry.held = true;
            return Ok(());
        }
        self.rerun(tid)
    }

    /// Resume held threads that should run, one step over at a time.
    fn release_held(&mut self) {
        if self.exited || self.threads.values().any(|e| e.step_over.is_some()) {
            return;
        }
        let held: Vec<Pid> = self
            .threads
            .iter()
            .filter(|(tid, e)| {
                e.held && !e.locked && e.inferior.is_stopped() && self.wants_run(**tid)
            })
            .map(|(tid, _)| *tid)
            .collect();
        for tid in held {
            if let Err(e) = self.rerun(tid) {
                warn!(target: "debugger", "resume held thread {tid}: {e:#}");
                continue;
            }
            if self
                .threads
                .get(&tid)
                .is_some_and(|e| e.step_over.is_some())
            {
                break;
            }
        }
    }

    fn finish_step_over(&mut self, tid: Pid) -> Option<StepOver> {
        let so = self.threads.get_mut(&tid)?.step_over.take()?;
        let io = ProcessIo::new(self.shared.channel.as_ref(), &self.threads, tid);
        weak_error!(self.traps.unlift(&io, so.address), "unlift:");
        Some(so)
    }

    fn clear_step_traps(&mut self, tid: Pid) {
        let traps = self.traps.entries_of(TrapOwner::Step(tid));
        if traps.is_empty() {
            return;
        }
        let Some(io_tid) = self.io_tid() else {
            return;
        };
        let io = ProcessIo::new(self.shared.channel.as_ref(), &self.threads, io_tid);
        for trap in traps {
            weak_error!(self.traps.remove(&io, trap), "remove step trap:");
        }
    }

    fn abort_step(&mut self, tid: Pid) {
        if let Some(engine) = self.engines.get_mut(&tid) {
            engine.abort();
        }
        self.clear_step_traps(tid);
    }

    fn arm_step_trap(&mut self, tid: Pid, address: TargetAddress) -> Result<(), Error> {
        let existing = self.traps.entries_of(TrapOwner::Step(tid));
        if existing
            .iter()
            .any(|id| self.traps.address_of(*id) == Some(address))
        {
            return Ok(());
        }
        self.clear_step_traps(tid);
        let io = ProcessIo::new(self.shared.channel.as_ref(), &self.threads, tid);
        self.traps.insert(
            &io,
            address,
            TrapOwner::Step(tid),
            TrapPolicy::Software,
            true,
        )?;
        Ok(())
    }

    /// Execute an action of a stepping engine.
    fn execute(&mut self, tid: Pid, action: StepAction) -> Result<(), Error> {
        debug!(target: "debugger", "thread {tid} step action: {action:?}");
        let result = match action {
            StepAction::Step => self.resume_thread(tid, ResumeKind::Step),
            StepAction::Resume => self.resume_thread(tid, ResumeKind::Cont),
            StepAction::RunTo(address) => self
                .arm_step_trap(tid, address)
                .and_then(|_| self.resume_thread(tid, ResumeKind::Cont)),
            StepAction::Compile(trampoline) => self
                .start_invocation(
                    tid,
                    InvocationToken::internal(),
                    trampoline.compile_method,
                    &trampoline.args,
                    None,
                )
                .map(drop),
            StepAction::Done => {
                self.clear_step_traps(tid);
                let address = self.pc_of(tid);
                self.surface(
                    tid,
                    DebuggerEvent::Stopped {
                        process: self.id,
                        tid,
                        address,
                        reason: StopReason::StepComplete,
                    },
                );
                Ok(())
            }
        };
        if result.is_err() {
            self.abort_step(tid);
        }
        result
    }

    /// Continue every thread of the process.
    pub(crate) fn cont_all(&mut self) -> Result<(), Error> {
        self.check_alive()?;
        for entry in self.threads.values_mut() {
            entry.resumed = true;
            if entry.inferior.is_stopped() && entry.step_over.is_none() {
                entry.held = true;
            }
        }
        self.release_held();
        self.drain_pending();
        Ok(())
    }

    /// Continue a single thread, other threads keep their state.
    pub(crate) fn cont_thread(&mut self, tid: Pid) -> Result<(), Error> {
        self.check_alive()?;
        let entry = self.entry(tid)?;
        if !entry.inferior.is_stopped() {
            return Err(Error::NotStopped);
        }
        entry.resumed = true;
        self.resume_thread(tid, ResumeKind::Cont)?;
        self.drain_pending();
        Ok(())
    }

    /// Start a step of a thread, other threads stay stopped.
    pub(crate) fn step(&mut self, tid: Pid, command: StepCommand) -> Result<(), Error> {
        self.check_alive()?;
        if !self.entry(tid)?.inferior.is_stopped() {
            return Err(Error::NotStopped);
        }
        if command == StepCommand::Continue {
            return self.cont_thread(tid);
        }

        for entry in self.threads.values_mut() {
            entry.resumed = false;
        }
        self.hold_others(Some(tid), false)?;
        self.clear_step_traps(tid);

        let action = self.drive(tid, |engine, target| engine.start(command, target))?;
        self.execute(tid, action)?;
        self.drain_pending();
        Ok(())
    }

    /// Stop the whole process synchronously.
    pub(crate) fn stop_all(&mut self) -> Result<(), Error> {
        self.check_alive()?;
        for entry in self.threads.values_mut() {
            entry.resumed = false;
        }
        let tids = self.tids();
        for tid in &tids {
            self.abort_step(*tid);
        }
        let stopped = self.suspend_all()?;
        for tid in &stopped {
            // interrupted before the step over completed
            self.finish_step_over(*tid);
        }

        if let Some(tid) = stopped.first().copied().or_else(|| tids.first().copied()) {
            let address = self.pc_of(tid);
            self.emit(DebuggerEvent::Stopped {
                process: self.id,
                tid,
                address,
                reason: StopReason::Interrupted,
            });
        }
        self.drain_pending();
        Ok(())
    }

    /// Request an asynchronous stop of a thread.
    /// Return false if thread already stopped.
    pub(crate) fn stop_thread(&mut self, tid: Pid) -> Result<bool, Error> {
        self.check_alive()?;
        let entry = self.entry(tid)?;
        entry.resumed = false;
        let requested = entry.inferior.stop()?;
        entry.stop_requested = requested;
        Ok(requested)
    }

    pub(crate) fn run_state(&self, tid: Pid) -> Result<RunState, Error> {
        self.threads
            .get(&tid)
            .map(|e| e.inferior.run_state())
            .ok_or(Error::ThreadNotFound(tid))
    }

    pub(crate) fn threads(&mut self) -> Vec<ThreadInfo> {
        let id = self.id;
        self.threads
            .iter_mut()
            .map(|(tid, e)| ThreadInfo {
                process: id,
                tid: *tid,
                state: e.inferior.run_state(),
                pc: e
                    .inferior
                    .is_stopped()
                    .then(|| e.inferior.pc().ok())
                    .flatten(),
                invocations: e.inferior.callback_depth(),
            })
            .collect()
    }

    /// Detach from the process, memory and registers are restored first.
    pub(crate) fn detach(&mut self) -> Result<(), Error> {
        self.check_alive()?;
        for entry in self.threads.values_mut() {
            entry.resumed = false;
        }
        let stopped = self.suspend_all()?;
        for tid in &stopped {
            self.finish_step_over(*tid);
        }
        self.drain_pending();
        if self.exited {
            return Ok(());
        }
        let tids = self.tids();
        for tid in &tids {
            self.abort_step(*tid);
            self.finish_step_over(*tid);
        }

        let mut errors = vec![];
        let tid = self.io_tid().ok_or(Error::NoTarget)?;
        if let Err(e) = self.with_runtime(tid, |runtime, ctx| runtime.on_detach(ctx)) {
            errors.push(e);
        }
        for (token, tid) in self.invocations.abort_all() {
            self.emit(DebuggerEvent::InvocationAborted {
                process: self.id,
                tid,
                token,
            });
        }
        let io = ProcessIo::new(self.shared.channel.as_ref(), &self.threads, tid);
        if let Err(e) = self.traps.remove_all(&io) {
            errors.push(e);
        }
        for (tid, entry) in self.threads.iter_mut() {
            if let Err(e) = entry.inferior.detach() {
                warn!(target: "debugger", "detach thread {tid}: {e:#}");
                errors.push(e);
            }
        }

        self.threads.clear();
        self.engines.clear();
        self.traps.forget_all();
        self.exited = true;
        self.effects.push(Effect::Gone);
        info!(target: "debugger", "{} detached", self.id);
        self.emit(DebuggerEvent::ProcessExited {
            process: self.id,
            status: ExitStatus::Detached,
        });

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::MultipleErrors(errors))
        }
    }

    /// Kill the process, exit is observed as a regular exit event.
    pub(crate) fn kill(&mut self) -> Result<(), Error> {
        self.check_alive()?;
        let tids = self.tids();
        for tid in tids {
            if let Some(engine) = self.engines.get_mut(&tid) {
                engine.abort();
            }
        }
        self.shared.channel.kill(self.pid)?;
        Ok(())
    }

    // ---------------------------------- breakpoints ---------------------------------------------

    /// Add a breakpoint, a breakpoint at an unknown symbol stays pending.
    pub(crate) fn insert_breakpoint(
        &mut self,
        breakpoint: Breakpoint,
        enabled: bool,
    ) -> Result<BreakpointId, Error> {
        self.check_alive()?;
        let id = breakpoint.id();
        let address = match breakpoint.location() {
            BreakpointLocation::Address(addr) => Some(*addr),
            BreakpointLocation::Symbol(name) => self
                .shared
                .symbols
                .resolve(self.pid, name)
                .map_err(Error::Hook)?,
        };
        let policy = self.code_policy();
        self.with_suspended(|this, tid| {
            let io = ProcessIo::new(this.shared.channel.as_ref(), &this.threads, tid);
            this.breakpoints
                .add(&mut this.traps, &io, breakpoint, enabled, address, policy)
        })?;
        Ok(id)
    }

    pub(crate) fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), Error> {
        self.check_alive()?;
        if !self.breakpoints.contains(id) {
            return Err(Error::BreakpointNotFound(id));
        }
        self.with_suspended(|this, tid| {
            let io = ProcessIo::new(this.shared.channel.as_ref(), &this.threads, tid);
            this.breakpoints.remove(&mut this.traps, &io, id).map(drop)
        })
    }

    pub(crate) fn set_breakpoint_enabled(
        &mut self,
        id: BreakpointId,
        enabled: bool,
    ) -> Result<(), Error> {
        self.check_alive()?;
        if !self.breakpoints.contains(id) {
            return Err(Error::BreakpointNotFound(id));
        }
        self.with_suspended(|this, tid| {
            let io = ProcessIo::new(this.shared.channel.as_ref(), &this.threads, tid);
            this.breakpoints
                .set_enabled(&mut this.traps, &io, id, enabled)
        })
    }

    pub(crate) fn breakpoints(&self) -> Vec<BreakpointInfo> {
        self.breakpoints.info(&self.traps)
    }

    /// Install pending breakpoints whose symbols became known.
    fn resolve_pending(&mut self, tid: Pid) {
        let policy = self.code_policy();
        for (id, name) in self.breakpoints.pending() {
            let addr = match self.shared.symbols.resolve(self.pid, &name) {
                Ok(Some(addr)) => addr,
                Ok(None) => continue,
                Err(e) => {
                    warn!(target: "debugger", "resolve `{name}`: {e:#}");
                    continue;
                }
            };
            let io = ProcessIo::new(self.shared.channel.as_ref(), &self.threads, tid);
            weak_error!(
                self.breakpoints
                    .resolve(&mut self.traps, &io, id, addr, policy),
                "resolve breakpoint:"
            );
        }
    }

    // ---------------------------------- memory and registers ------------------------------------

    /// Access memory through a stopped thread, reads see original bytes under traps.
    pub(crate) fn with_memory<T>(
        &mut self,
        tid: Pid,
        f: impl FnOnce(&mut dyn MemoryAccess) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let entry = self
            .threads
            .get_mut(&tid)
            .ok_or(Error::ThreadNotFound(tid))?;
        let mut memory = entry.inferior.memory(&mut self.traps);
        f(&mut memory)
    }

    pub(crate) fn registers(&mut self, tid: Pid) -> Result<Registers, Error> {
        self.entry(tid)?.inferior.registers()
    }

    pub(crate) fn set_registers(&mut self, tid: Pid, registers: &Registers) -> Result<(), Error> {
        self.entry(tid)?.inferior.set_registers(registers)
    }

    pub(crate) fn memory_maps(&self) -> Result<Vec<MemoryArea>, Error> {
        Ok(self.shared.channel.memory_maps(self.pid)?)
    }

    // ---------------------------------- invocations ---------------------------------------------

    pub(crate) fn invoke(
        &mut self,
        tid: Pid,
        invocation: Invocation,
    ) -> Result<InvocationHandle, Error> {
        self.check_alive()?;
        let handle = self.start_invocation(
            tid,
            invocation.token,
            invocation.method,
            &invocation.args,
            invocation.blob_size,
        )?;
        self.drain_pending();
        Ok(handle)
    }

    fn start_invocation(
        &mut self,
        tid: Pid,
        token: InvocationToken,
        method: u64,
        args: &[u64],
        blob_size: Option<usize>,
    ) -> Result<InvocationHandle, Error> {
        if self.invocations.is_pending(token) {
            return Err(Error::InvocationPending(token.as_u64()));
        }
        let entry = self.entry(tid)?;
        if !entry.inferior.is_stopped() {
            return Err(Error::NotStopped);
        }
        let pc = entry.inferior.pc()?;
        let mut regs = entry.inferior.registers()?;
        let setup = self
            .shared
            .arch
            .setup_call(&mut regs, method, args, pc.as_u64())?;

        let io = ProcessIo::new(self.shared.channel.as_ref(), &self.threads, tid);
        let trap = self.traps.insert(
            &io,
            pc,
            TrapOwner::CallReturn(tid),
            TrapPolicy::Software,
            true,
        )?;
        drop(io);

        let entry = self
            .threads
            .get_mut(&tid)
            .ok_or(Error::ThreadNotFound(tid))?;
        let entered = entry
            .inferior
            .push_registers(token, pc, setup.return_sp)
            .and_then(|_| {
                for (addr, bytes) in &setup.stack_writes {
                    self.shared.channel.write_memory(tid, *addr, bytes)?;
                }
                entry.inferior.set_registers(&regs)
            });
        if let Err(e) = entered {
            if entry.inferior.callback_frame().is_some_and(|f| f.token == token) {
                weak_error!(entry.inferior.pop_registers(), "restore registers:");
            }
            let io = ProcessIo::new(self.shared.channel.as_ref(), &self.threads, tid);
            weak_error!(self.traps.remove(&io, trap), "remove return trap:");
            return Err(e);
        }

        let handle = self.invocations.register(token, tid, trap, blob_size)?;
        if let Err(e) = self.resume_thread(tid, ResumeKind::Resume) {
            self.invocations.take(token);
            if let Some(entry) = self.threads.get_mut(&tid) {
                weak_error!(entry.inferior.pop_registers(), "restore registers:");
            }
            let io = ProcessIo::new(self.shared.channel.as_ref(), &self.threads, tid);
            weak_error!(self.traps.remove(&io, trap), "remove return trap:");
            return Err(e);
        }
        debug!(target: "debugger", "invocation {token} of {method:#X} started on {tid}");
        Ok(handle)
    }

    /// Abort an invocation, nested invocations started after it are aborted too.
    pub(crate) fn abort_invocation(&mut self, token: InvocationToken) -> Result<(), Error> {
        self.check_alive()?;
        let tid = self
            .invocations
            .get(token)
            .map(|p| p.tid)
            .ok_or(Error::NoCallbackFrame)?;

        loop {
            self.stop_one(tid)?;
            if self.pending.is_empty() {
                break;
            }
            self.drain_pending();
            if !self.invocations.is_pending(token) {
                return Ok(());
            }
        }
        if let Some(entry) = self.threads.get_mut(&tid) {
            entry.held = false;
        }

        loop {
            let entry = self.entry(tid)?;
            let frame = entry.inferior.pop_registers()?;
            if let Some(pending) = self.invocations.take(frame.token) {
                let io = ProcessIo::new(self.shared.channel.as_ref(), &self.threads, tid);
                weak_error!(self.traps.remove(&io, pending.trap), "remove return trap:");
                pending.resolve(InvocationOutcome::Aborted);
            }
            if frame.token.is_internal() {
                self.abort_step(tid);
            } else {
                self.emit(DebuggerEvent::InvocationAborted {
                    process: self.id,
                    tid,
                    token: frame.token,
                });
            }
            if frame.token == token {
                break;
            }
        }
        debug!(target: "debugger", "invocation {token} on {tid} aborted");
        Ok(())
    }

    /// Resolve invocations of a gone thread as aborted.
    fn abort_thread_invocations(&mut self, tid: Pid) {
        for token in self.invocations.of_thread(tid) {
            if let Some(pending) = self.invocations.take(token) {
                pending.resolve(InvocationOutcome::Aborted);
                if !token.is_internal() {
                    self.emit(DebuggerEvent::InvocationAborted {
                        process: self.id,
                        tid,
                        token,
                    });
                }
            }
        }
    }
}
