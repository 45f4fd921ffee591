use crate::debugger::address::TargetAddress;
use crate::debugger::breakpoint::{TrapId, TrapOwner};
use crate::debugger::error::Error;
use crate::debugger::event::StopReason;
use crate::debugger::runtime::info::{RuntimeInfo, DEBUGGER_INFO_SYMBOL};
use crate::debugger::runtime::{
    NotificationAction, NotificationKind, RuntimeContext, RuntimeHandler, Trampoline,
};
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::any::Any;
use std::collections::HashMap;

/// Protocol version written into a runtime after notifications are armed.
const DEBUGGER_PROTOCOL_VERSION: i32 = 4;

/// Runtime data of a managed thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManagedThread {
    /// Last managed frame address, `None` for a thread registered by GC.
    pub lmf: Option<u64>,
    pub data: u64,
}

/// Awareness of a Mono-like managed runtime.
///
/// Initialization is two phase when a process is spawned: the runtime is told that a debugger
/// is present and a trap is armed at its `initialize` function, the notification trap is
/// armed when the runtime reaches it. After attach both phases run at once.
pub struct ManagedRuntime {
    info: Option<RuntimeInfo>,
    init_trap: Option<TrapId>,
    notification_trap: Option<TrapId>,
    threads: HashMap<Pid, ManagedThread>,
    main_sp: Option<u64>,
    quiet_signals: Vec<Signal>,
}

impl Default for ManagedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedRuntime {
    pub fn new() -> Self {
        Self {
            info: None,
            init_trap: None,
            notification_trap: None,
            threads: HashMap::new(),
            main_sp: None,
            // GC suspend and restart signals
            quiet_signals: vec![Signal::SIGPWR, Signal::SIGXCPU],
        }
    }

    pub fn with_quiet_signals(mut self, signals: Vec<Signal>) -> Self {
        self.quiet_signals = signals;
        self
    }

    pub fn info(&self) -> Option<&RuntimeInfo> {
        self.info.as_ref()
    }

    /// True when a notification trap is armed.
    pub fn is_active(&self) -> bool {
        self.notification_trap.is_some()
    }

    pub fn managed_thread(&self, tid: Pid) -> Option<ManagedThread> {
        self.threads.get(&tid).copied()
    }

    /// Stack pointer of a thread at the moment `main` reached.
    pub fn main_stack_pointer(&self) -> Option<u64> {
        self.main_sp
    }

    fn require_info(&self) -> Result<&RuntimeInfo, Error> {
        self.info.as_ref().ok_or(Error::NoRuntime)
    }

    fn initialize_notifications(&mut self, ctx: &mut dyn RuntimeContext) -> Result<(), Error> {
        let info = self.require_info()?.clone();
        let domain = ctx.domain();

        ctx.write_integer(
            TargetAddress::new(domain, info.debugger_version),
            DEBUGGER_PROTOCOL_VERSION,
        )?;
        if let Some(trap) = self.init_trap.take() {
            ctx.remove_trap(trap)?;
        }

        let function = ctx.read_address(TargetAddress::new(domain, info.notification_address))?;
        if function.is_null() {
            warn!(target: "runtime", "runtime notification function not set");
            return Ok(());
        }
        self.notification_trap = Some(ctx.insert_trap(function.as_u64(), TrapOwner::Notification)?);
        info!(target: "runtime", "runtime notifications armed at {function}");
        Ok(())
    }

    fn register_thread(&mut self, ctx: &mut dyn RuntimeContext, record: u64) -> Result<(), Error> {
        let record = TargetAddress::new(ctx.domain(), record);
        let lmf = ctx.read_address(record + 8)?;
        debug!(target: "runtime", "managed thread {} created, lmf: {lmf}", ctx.tid());
        self.threads.insert(
            ctx.tid(),
            ManagedThread {
                lmf: Some(lmf.as_u64()),
                data: (record + 24).as_u64(),
            },
        );
        Ok(())
    }

    fn gc_thread_created(
        &mut self,
        ctx: &mut dyn RuntimeContext,
        data: u64,
        tid: u64,
    ) -> Result<(), Error> {
        let tid = Pid::from_raw(tid as i32);
        if !ctx.has_thread(tid) {
            return Err(Error::ThreadNotFound(tid));
        }
        debug!(target: "runtime", "gc thread {tid} registered, data: {data:#X}");
        self.threads
            .entry(tid)
            .and_modify(|t| t.data = data)
            .or_insert(ManagedThread { lmf: None, data });
        Ok(())
    }
}

impl RuntimeHandler for ManagedRuntime {
    fn name(&self) -> &'static str {
        "managed"
    }

    fn initialize(&mut self, ctx: &mut dyn RuntimeContext, attached: bool) -> Result<(), Error> {
        let Some(addr) = ctx.resolve(DEBUGGER_INFO_SYMBOL)? else {
            debug!(target: "runtime", "process {} has no managed runtime", ctx.pid());
            return Ok(());
        };
        let domain = ctx.domain();
        let info = RuntimeInfo::read(&*ctx, TargetAddress::new(domain, addr))?;
        let using = TargetAddress::new(domain, info.using_mono_debugger);
        let initialize = info.initialize;
        let (vtable_ptr, vtable) = (info.thread_vtable_ptr, info.thread_vtable);
        let (handler_ptr, handler) = (info.event_handler_ptr, info.event_handler);
        self.info = Some(info);

        if attached {
            self.initialize_notifications(ctx)?;
            ctx.write_address(
                TargetAddress::new(domain, vtable_ptr),
                TargetAddress::new(domain, vtable),
            )?;
            ctx.write_address(
                TargetAddress::new(domain, handler_ptr),
                TargetAddress::new(domain, handler),
            )?;
            ctx.write_integer(using, 1)?;
        } else {
            ctx.write_integer(using, 1)?;
            self.init_trap = Some(ctx.insert_trap(initialize, TrapOwner::Runtime)?);
        }

        info!(target: "runtime", "managed runtime found in process {}", ctx.pid());
        Ok(())
    }

    fn on_trap(
        &mut self,
        ctx: &mut dyn RuntimeContext,
        trap: TrapId,
    ) -> Result<NotificationAction, Error> {
        if self.init_trap == Some(trap) {
            self.initialize_notifications(ctx)?;
        }
        Ok(NotificationAction::Resume)
    }

    fn handle_notification(
        &mut self,
        ctx: &mut dyn RuntimeContext,
        kind: NotificationKind,
        data1: u64,
        data2: u64,
    ) -> Result<NotificationAction, Error> {
        let info = self.require_info()?.clone();
        debug!(target: "runtime", "thread {} notification {kind}: {data1:#X} {data2:#X}", ctx.tid());

        let action = match kind {
            NotificationKind::AcquireGlobalThreadLock => NotificationAction::AcquireGlobalLock,
            NotificationKind::ReleaseGlobalThreadLock => NotificationAction::ReleaseGlobalLock,
            NotificationKind::ThreadCreated => {
                self.register_thread(ctx, data2)?;
                NotificationAction::Report
            }
            NotificationKind::ThreadCleanup => {
                self.threads.remove(&ctx.tid());
                NotificationAction::Report
            }
            NotificationKind::GcThreadCreated => {
                self.gc_thread_created(ctx, data1, data2)?;
                NotificationAction::Resume
            }
            NotificationKind::GcThreadExited => {
                self.threads.remove(&ctx.tid());
                NotificationAction::Resume
            }
            NotificationKind::InitializeThreadManager | NotificationKind::LoadModule => {
                NotificationAction::ResolveBreakpoints
            }
            NotificationKind::ReachedMain => {
                let sp = ctx.stack_pointer()?;
                self.main_sp = Some(sp);
                NotificationAction::Report
            }
            NotificationKind::UnhandledException => {
                NotificationAction::Stop(StopReason::Exception { data1, data2 })
            }
            NotificationKind::ThrowException | NotificationKind::HandleException => {
                NotificationAction::Report
            }
            NotificationKind::FinalizeManagedCode => {
                self.threads.clear();
                NotificationAction::Resume
            }
            NotificationKind::InterruptionRequest => {
                ctx.write_integer(TargetAddress::new(ctx.domain(), info.interruption_request), 0)?;
                NotificationAction::Report
            }
            NotificationKind::JitBreakpoint => {
                NotificationAction::Stop(StopReason::Runtime(NotificationKind::JitBreakpoint))
            }
            NotificationKind::Trampoline
            | NotificationKind::UnloadModule
            | NotificationKind::DomainCreate
            | NotificationKind::DomainUnload
            | NotificationKind::ClassInitialized
            | NotificationKind::Unknown(_) => NotificationAction::Report,
            NotificationKind::InitializeManagedCode
            | NotificationKind::InitializeCorlib
            | NotificationKind::WrapperMain
            | NotificationKind::MainExited => NotificationAction::Resume,
        };
        Ok(action)
    }

    fn thread_exited(&mut self, tid: Pid) {
        self.threads.remove(&tid);
    }

    fn is_quiet_signal(&self, signal: Signal) -> bool {
        self.info.is_some() && self.quiet_signals.contains(&signal)
    }

    /// A call target is a trampoline if it starts with a relative call or jump into one of
    /// runtime trampolines, a compiled method argument follows that instruction.
    fn trampoline(&self, ctx: &mut dyn RuntimeContext, target: u64) -> Option<Trampoline> {
        const CALL_REL32: u8 = 0xE8;
        const JMP_REL32: u8 = 0xE9;
        const INSN_LEN: u64 = 5;

        let info = self.info.as_ref()?;
        if info.trampoline_num <= 0 || info.trampoline_code == 0 {
            return None;
        }
        let domain = ctx.domain();
        let target = TargetAddress::new(domain, target);
        let code = ctx.read_buffer(target, INSN_LEN as usize).ok()?;
        if code[0] != CALL_REL32 && code[0] != JMP_REL32 {
            return None;
        }
        let rel = i32::from_le_bytes([code[1], code[2], code[3], code[4]]);
        let destination = (target + INSN_LEN).offset(rel as i64);

        let address_size = ctx.memory_info().address_size as u64;
        let table = TargetAddress::new(domain, info.trampoline_code);
        let is_trampoline = (0..info.trampoline_num as u64).any(|i| {
            ctx.read_address(table + i * address_size)
                .is_ok_and(|entry| !entry.is_null() && entry == destination)
        });
        if !is_trampoline {
            return None;
        }

        let method = ctx.read_address(target + INSN_LEN).ok()?;
        debug!(target: "runtime", "call into trampoline at {target}, method: {method}");
        Some(Trampoline {
            compile_method: info.compile_method,
            args: vec![method.as_u64()],
        })
    }

    fn on_exec(&mut self, ctx: &mut dyn RuntimeContext) -> Result<(), Error> {
        // traps are already gone together with an old memory image
        self.info = None;
        self.init_trap = None;
        self.notification_trap = None;
        self.threads.clear();
        self.main_sp = None;
        self.initialize(ctx, false)
    }

    fn on_detach(&mut self, ctx: &mut dyn RuntimeContext) -> Result<(), Error> {
        let Some(info) = self.info.take() else {
            return Ok(());
        };
        let domain = ctx.domain();
        let null = TargetAddress::null(domain);
        ctx.write_address(TargetAddress::new(domain, info.thread_vtable_ptr), null)?;
        ctx.write_address(TargetAddress::new(domain, info.event_handler_ptr), null)?;
        ctx.write_integer(TargetAddress::new(domain, info.using_mono_debugger), 0)?;
        self.init_trap = None;
        self.notification_trap = None;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
