//! Traced OS thread.
//!
//! [`Inferior`] wraps a single thread behind a [`ControlChannel`]: it keeps a run state machine,
//! caches registers and the current frame while the thread is stopped and turns raw channel
//! events into [`ChildEvent`]s.

use crate::debugger::address::{AddressDomain, TargetAddress};
use crate::debugger::arch::Architecture;
use crate::debugger::breakpoint::{BreakpointManager, PhysicalKind, TrapOwner};
use crate::debugger::channel::{ChannelError, ChannelEvent, ControlChannel, HardwareKind, StopOutcome};
use crate::debugger::error::Error;
use crate::debugger::event::{ChildEvent, ProcessId};
use crate::debugger::invoke::InvocationToken;
use crate::debugger::memory::{MemoryAccess, MemoryArea, TargetMemoryInfo};
use crate::debugger::register::{Register, Registers};
use crate::debugger::runtime::NotificationKind;
use crate::muted_error;
use log::debug;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InferiorState {
    Created,
    Initializing,
    Stopped,
    Running,
    Exited,
}

/// Externally visible run state of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    NoTarget,
    Stopped,
    Running,
    Exited,
}

/// How thread was resumed last time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeKind {
    Step,
    Cont,
    /// Continue without signal injection.
    Resume,
}

/// Most recent frame of a stopped thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CurrentFrame {
    pub pc: TargetAddress,
    pub sp: u64,
    pub fp: u64,
}

/// Register snapshot saved before a nested invocation.
#[derive(Clone, Debug)]
pub struct CallbackFrame {
    pub token: InvocationToken,
    pub registers: Registers,
    /// Stack pointer value after invoked method returns.
    pub return_sp: u64,
    pub return_address: TargetAddress,
}

pub struct Inferior {
    tid: Pid,
    pid: Pid,
    process: ProcessId,
    domain: AddressDomain,
    state: InferiorState,
    disposed: bool,
    channel: Arc<dyn ControlChannel>,
    arch: Arc<dyn Architecture>,
    memory_info: TargetMemoryInfo,
    registers: Option<Registers>,
    frame: Option<CurrentFrame>,
    pending_signal: Option<Signal>,
    last_resume: Option<ResumeKind>,
    callbacks: Vec<CallbackFrame>,
}

impl Inferior {
    pub fn new(
        tid: Pid,
        pid: Pid,
        process: ProcessId,
        domain: AddressDomain,
        channel: Arc<dyn ControlChannel>,
        arch: Arc<dyn Architecture>,
        memory_info: TargetMemoryInfo,
    ) -> Self {
        Self {
            tid,
            pid,
            process,
            domain,
            state: InferiorState::Created,
            disposed: false,
            channel,
            arch,
            memory_info,
            registers: None,
            frame: None,
            pending_signal: None,
            last_resume: None,
            callbacks: vec![],
        }
    }

    pub fn tid(&self) -> Pid {
        self.tid
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn domain(&self) -> AddressDomain {
        self.domain
    }

    pub(crate) fn set_domain(&mut self, domain: AddressDomain) {
        self.domain = domain;
        self.invalidate();
    }

    pub fn arch(&self) -> &Arc<dyn Architecture> {
        &self.arch
    }

    pub fn state(&self) -> InferiorState {
        self.state
    }

    pub fn run_state(&self) -> RunState {
        if self.disposed {
            return RunState::NoTarget;
        }
        match self.state {
            InferiorState::Created | InferiorState::Initializing => RunState::NoTarget,
            InferiorState::Stopped => RunState::Stopped,
            InferiorState::Running => RunState::Running,
            InferiorState::Exited => RunState::Exited,
        }
    }

    pub fn is_stopped(&self) -> bool {
        !self.disposed && self.state == InferiorState::Stopped
    }

    pub fn last_resume(&self) -> Option<ResumeKind> {
        self.last_resume
    }

    pub fn pending_signal(&self) -> Option<Signal> {
        self.pending_signal
    }

    /// Drop signal that must be re-delivered on next continue.
    pub fn clear_pending_signal(&mut self) {
        self.pending_signal = None;
    }

    fn check_alive(&self) -> Result<(), Error> {
        if self.disposed {
            return Err(Error::ObjectDisposed);
        }
        if self.state == InferiorState::Exited {
            return Err(Error::NoTarget);
        }
        Ok(())
    }

    fn check_stopped(&self) -> Result<(), Error> {
        self.check_alive()?;
        if self.state != InferiorState::Stopped {
            return Err(Error::NotStopped);
        }
        Ok(())
    }

    fn invalidate(&mut self) {
        self.registers = None;
        self.frame = None;
    }

    /// Move a new thread into stopped state.
    ///
    /// # Arguments
    ///
    /// * `setup`: if true channel prepares the thread and waits for its first stop,
    ///   otherwise thread already stopped by the channel (spawn, attach).
    pub fn initialize(&mut self, setup: bool) -> Result<(), Error> {
        if self.disposed {
            return Err(Error::ObjectDisposed);
        }
        if self.state != InferiorState::Created {
            return Err(Error::AlreadyHaveTarget);
        }

        self.state = InferiorState::Initializing;
        if setup {
            if let Err(e) = self.channel.initialize_thread(self.tid, true) {
                self.state = InferiorState::Created;
                return Err(e.into());
            }
        }
        debug!(target: "tracer", "thread {} initialized", self.tid);
        self.state = InferiorState::Stopped;
        Ok(())
    }

    fn run(&mut self, kind: ResumeKind, signal: Option<Signal>) -> Result<(), Error> {
        self.check_stopped()?;

        let prev = self.state;
        self.state = InferiorState::Running;
        let result = match kind {
            ResumeKind::Step => self.channel.step(self.tid, signal),
            ResumeKind::Cont | ResumeKind::Resume => self.channel.cont(self.tid, signal),
        };
        if let Err(e) = result {
            self.state = prev;
            return Err(e.into());
        }

        debug!(target: "tracer", "thread {} resumed ({kind:?}, signal: {signal:?})", self.tid);
        self.last_resume = Some(kind);
        self.invalidate();
        Ok(())
    }

    /// Execute a single instruction, pending signal is kept for the next continue.
    pub fn step(&mut self) -> Result<(), Error> {
        self.run(ResumeKind::Step, None)
    }

    /// Continue execution, pending signal is delivered.
    pub fn cont(&mut self) -> Result<(), Error> {
        self.check_stopped()?;
        let signal = self.pending_signal;
        self.run(ResumeKind::Cont, signal)?;
        self.pending_signal = None;
        Ok(())
    }

    /// Continue execution without signal injection.
    pub fn resume(&mut self) -> Result<(), Error> {
        self.run(ResumeKind::Resume, None)
    }

    /// Resume thread the same way it was resumed last time, delivering a signal.
    pub fn redeliver(&mut self, signal: Signal) -> Result<(), Error> {
        let kind = match self.last_resume {
            Some(ResumeKind::Step) => ResumeKind::Step,
            _ => ResumeKind::Cont,
        };
        self.run(kind, Some(signal))?;
        if self.pending_signal == Some(signal) {
            self.pending_signal = None;
        }
        Ok(())
    }

    /// Request an asynchronous stop.
    /// Return false if thread already stopped (no signal sent).
    pub fn stop(&mut self) -> Result<bool, Error> {
        self.check_alive()?;
        if self.state != InferiorState::Running {
            return Ok(false);
        }
        match self.channel.stop(self.tid) {
            Ok(()) => Ok(true),
            Err(ChannelError::AlreadyStopped) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop thread and wait until it really stopped.
    /// Returned [`StopOutcome::Event`] contains an unrelated event that must be handled
    /// by a caller, thread is stopped in any case.
    pub fn stop_and_wait(&mut self) -> Result<StopOutcome, Error> {
        self.check_alive()?;
        if self.state != InferiorState::Running {
            return Ok(StopOutcome::AlreadyStopped);
        }
        let outcome = self.channel.stop_and_wait(self.tid)?;
        debug!(target: "tracer", "thread {} stopped by request: {outcome:?}", self.tid);
        self.mark_stopped();
        Ok(outcome)
    }

    /// Thread observed in stopped state.
    pub(crate) fn mark_stopped(&mut self) {
        if self.state != InferiorState::Exited {
            self.state = InferiorState::Stopped;
        }
        self.invalidate();
    }

    pub(crate) fn mark_exited(&mut self) {
        self.state = InferiorState::Exited;
        self.callbacks.clear();
        self.invalidate();
    }

    pub fn dispose(&mut self) {
        self.disposed = true;
    }

    /// Detach from a thread, registers saved by pushed callback frames are restored first.
    pub fn detach(&mut self) -> Result<(), Error> {
        self.check_stopped()?;
        if let Some(first) = self.callbacks.first().cloned() {
            self.callbacks.clear();
            self.set_registers(&first.registers)?;
        }
        self.channel.detach(self.tid)?;
        self.state = InferiorState::Exited;
        self.disposed = true;
        Ok(())
    }

    pub fn kill(&mut self) -> Result<(), Error> {
        self.check_alive()?;
        self.channel.kill(self.tid)?;
        Ok(())
    }

    pub fn registers(&mut self) -> Result<Registers, Error> {
        self.check_stopped()?;
        if let Some(regs) = &self.registers {
            return Ok(regs.clone());
        }
        let regs = Registers::from_values(&self.channel.get_registers(self.tid)?);
        self.registers = Some(regs.clone());
        Ok(regs)
    }

    /// Write registers, invalid entries keep their current values.
    pub fn set_registers(&mut self, registers: &Registers) -> Result<(), Error> {
        let current = self.registers()?;
        let merged = registers.merge(&current);
        self.channel.set_registers(self.tid, &merged)?;
        self.registers = Some(Registers::from_values(&merged));
        self.frame = None;
        Ok(())
    }

    fn register(&mut self, idx: usize) -> Result<u64, Error> {
        self.registers()?.get(idx).ok_or(Error::NoStack)
    }

    pub fn pc(&mut self) -> Result<TargetAddress, Error> {
        let idx = self.arch.pc_register();
        Ok(TargetAddress::new(self.domain, self.register(idx)?))
    }

    pub fn sp(&mut self) -> Result<u64, Error> {
        let idx = self.arch.sp_register();
        self.register(idx)
    }

    pub fn set_pc(&mut self, pc: u64) -> Result<(), Error> {
        let mut regs = Registers::empty();
        if let Some(register) = Register::from_index(self.arch.pc_register()) {
            regs.set(register, pc);
        }
        self.set_registers(&regs)
    }

    pub fn current_frame(&mut self) -> Result<CurrentFrame, Error> {
        self.check_stopped()?;
        if let Some(frame) = self.frame {
            return Ok(frame);
        }
        let regs = self.registers().map_err(|_| Error::NoStack)?;
        let value = |idx: usize| regs.get(idx).ok_or(Error::NoStack);
        let frame = CurrentFrame {
            pc: TargetAddress::new(self.domain, value(self.arch.pc_register())?),
            sp: value(self.arch.sp_register())?,
            fp: value(self.arch.frame_register())?,
        };
        self.frame = Some(frame);
        Ok(frame)
    }

    /// Return address of a current frame (standard frame layout assumed).
    pub fn return_address(&mut self) -> Result<TargetAddress, Error> {
        let regs = self.registers()?;
        let slot = self.arch.return_address_slot(&regs)?;
        self.read_address_raw(slot)
    }

    /// Read an address-width word at `addr` without trap shadowing.
    pub(crate) fn read_address_raw(&mut self, addr: u64) -> Result<TargetAddress, Error> {
        self.check_stopped()?;
        let bytes = self
            .channel
            .read_memory(self.tid, addr, self.memory_info.address_size)?;
        Ok(TargetAddress::new(self.domain, self.memory_info.decode(&bytes)))
    }

    pub fn push_registers(
        &mut self,
        token: InvocationToken,
        return_address: TargetAddress,
        return_sp: u64,
    ) -> Result<(), Error> {
        let registers = self.registers()?;
        self.callbacks.push(CallbackFrame {
            token,
            registers,
            return_sp,
            return_address,
        });
        Ok(())
    }

    /// Restore registers saved by [`Inferior::push_registers`].
    pub fn pop_registers(&mut self) -> Result<CallbackFrame, Error> {
        self.check_stopped()?;
        let frame = self.callbacks.pop().ok_or(Error::NoCallbackFrame)?;
        self.set_registers(&frame.registers)?;
        Ok(frame)
    }

    pub fn callback_frame(&self) -> Option<&CallbackFrame> {
        self.callbacks.last()
    }

    pub fn callback_depth(&self) -> usize {
        self.callbacks.len()
    }

    /// Forget saved frames, memory image they belong to is gone (exec).
    pub(crate) fn drop_callbacks(&mut self) {
        self.callbacks.clear();
    }

    /// Point-in-time snapshot of process memory mappings.
    pub fn memory_maps(&self) -> Option<Vec<MemoryArea>> {
        muted_error!(self.channel.memory_maps(self.pid), "memory maps:")
    }

    /// Memory view of a thread, reads are shadowed by traps of `traps` manager.
    pub fn memory<'a>(&'a mut self, traps: &'a mut BreakpointManager) -> InferiorMemory<'a> {
        InferiorMemory {
            inferior: self,
            traps,
        }
    }

    /// Decode a channel event into a [`ChildEvent`] and update thread state.
    pub fn decode(
        &mut self,
        event: ChannelEvent,
        traps: &BreakpointManager,
    ) -> Result<ChildEvent, Error> {
        if matches!(event, ChannelEvent::Exited(_) | ChannelEvent::Signaled(_)) {
            self.mark_exited();
        } else {
            self.mark_stopped();
        }

        let event = match event {
            ChannelEvent::Exited(code) => ChildEvent::Exited(code),
            ChannelEvent::Signaled(signal) => ChildEvent::Signaled(signal),
            ChannelEvent::Stopped(signal) => {
                self.pending_signal = Some(signal);
                ChildEvent::Stopped {
                    signal: Some(signal),
                }
            }
            ChannelEvent::Interrupted => ChildEvent::Interrupted,
            ChannelEvent::SingleStep => ChildEvent::Stopped { signal: None },
            ChannelEvent::Breakpoint { pc } => {
                let address = TargetAddress::new(self.domain, pc - self.arch.breakpoint_pc_adjust());
                match traps.lookup(address) {
                    Some(trap) if matches!(trap.kind, PhysicalKind::Software { .. }) => {
                        self.set_pc(address.as_u64())?;
                        self.classify_trap(address, traps)?
                    }
                    // trap instruction of a debugee itself
                    _ => {
                        self.pending_signal = Some(Signal::SIGTRAP);
                        ChildEvent::Stopped {
                            signal: Some(Signal::SIGTRAP),
                        }
                    }
                }
            }
            ChannelEvent::HardwareBreakpoint { slot } => match traps.slot_info(slot) {
                Some((address, HardwareKind::Execute, _)) => self.classify_trap(address, traps)?,
                Some((address, _, owners)) => ChildEvent::HitBreakpoint {
                    trap: owners.first().map(|(id, _)| *id),
                    address,
                    owners,
                },
                None => ChildEvent::InternalError(format!("hit of unused hardware slot {slot}")),
            },
            ChannelEvent::Clone(tid) => ChildEvent::ThreadCreated(tid),
            ChannelEvent::Fork(pid) => ChildEvent::Forked(pid),
            ChannelEvent::Exec => ChildEvent::Execd,
            ChannelEvent::CalledExit => ChildEvent::CalledExit,
        };
        Ok(event)
    }

    fn classify_trap(
        &mut self,
        address: TargetAddress,
        traps: &BreakpointManager,
    ) -> Result<ChildEvent, Error> {
        let owners = traps.owners(address);

        if owners
            .iter()
            .any(|(_, owner)| *owner == TrapOwner::CallReturn(self.tid))
        {
            let top = self
                .callbacks
                .last()
                .map(|f| (f.token, f.return_sp, f.return_address));
            if let Some((token, return_sp, return_address)) = top {
                if return_address == address && self.sp()? == return_sp {
                    let (r1, r2) = self.arch.return_registers();
                    let regs = self.registers()?;
                    return Ok(ChildEvent::CallbackCompleted {
                        token,
                        data1: regs.get(r1).unwrap_or_default(),
                        data2: regs.get(r2).unwrap_or_default(),
                        blob: None,
                    });
                }
            }
        }

        if owners
            .iter()
            .any(|(_, owner)| *owner == TrapOwner::Notification)
        {
            let regs = self.registers()?;
            let args = self.arch.argument_registers();
            let arg = |n: usize| {
                args.get(n)
                    .and_then(|idx| regs.get(*idx))
                    .unwrap_or_default()
            };
            return Ok(ChildEvent::Notification {
                kind: NotificationKind::from(arg(0)),
                data1: arg(1),
                data2: arg(2),
            });
        }

        Ok(ChildEvent::HitBreakpoint {
            trap: owners.first().map(|(id, _)| *id),
            address,
            owners,
        })
    }
}

/// Memory of a stopped thread.
pub struct InferiorMemory<'a> {
    inferior: &'a mut Inferior,
    traps: &'a mut BreakpointManager,
}

impl MemoryAccess for InferiorMemory<'_> {
    fn memory_info(&self) -> TargetMemoryInfo {
        self.inferior.memory_info
    }

    fn domain(&self) -> AddressDomain {
        self.inferior.domain
    }

    fn read_buffer(&self, addr: TargetAddress, size: usize) -> Result<Vec<u8>, Error> {
        self.inferior.check_stopped()?;
        if addr.domain() != self.inferior.domain {
            return Err(Error::DomainMismatch);
        }
        let mut bytes = self
            .inferior
            .channel
            .read_memory(self.inferior.tid, addr.as_u64(), size)?;
        self.traps.shadow(addr.as_u64(), &mut bytes);
        Ok(bytes)
    }

    fn write_buffer(&mut self, addr: TargetAddress, data: &[u8]) -> Result<(), Error> {
        self.inferior.check_stopped()?;
        if addr.domain() != self.inferior.domain {
            return Err(Error::DomainMismatch);
        }
        if let Some(maps) = self.inferior.memory_maps() {
            let read_only = maps
                .iter()
                .find(|area| area.contains(addr.as_u64()))
                .is_some_and(MemoryArea::is_read_only);
            if read_only {
                return Err(Error::ReadOnly(addr.as_u64()));
            }
        }

        let patched = self.traps.write_through(addr.as_u64(), data);
        self.inferior
            .channel
            .write_memory(self.inferior.tid, addr.as_u64(), &patched.data)?;
        self.traps.commit_write(patched);
        self.inferior.frame = None;
        Ok(())
    }
}
