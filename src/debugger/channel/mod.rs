//! Native control channel.
//!
//! Channel is a primitive, OS specific interface over a traced process: run control, memory and
//! register access, hardware trap slots and raw stop events. Core never assumes a partial success
//! of a channel call, every call either succeeds or returns a [`ChannelError`].

pub mod code;
pub mod ptrace;

use crate::debugger::memory::MemoryArea;
use crate::debugger::process::ProcessStart;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use os_pipe::PipeReader;

pub use ptrace::PtraceChannel;

/// Raw status of a traced thread, as returned by a `wait` call.
pub type RawStatus = WaitStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// Target description, queried once per process and cached by the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetInfo {
    pub int_size: usize,
    pub long_size: usize,
    pub address_size: usize,
    pub endianness: Endianness,
    /// Number of hardware trap slots, zero if platform has no hardware traps.
    pub hardware_slots: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HardwareKind {
    Execute,
    Read,
    Write,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("unknown channel error")]
    Unknown,
    #[error("no target")]
    NoTarget,
    #[error("already have a target")]
    AlreadyHaveTarget,
    #[error("cannot start target: {0}")]
    CannotStartTarget(String),
    #[error("target not stopped")]
    NotStopped,
    #[error("target already stopped")]
    AlreadyStopped,
    #[error("memory access error at {0:#X}")]
    MemoryAccess(u64),
    #[error("all debug registers are occupied")]
    DebugRegisterOccupied,
    #[error("operation not implemented")]
    NotImplemented,
    #[error("cannot detach")]
    CannotDetach,
    #[error("thread {0} not found")]
    NoSuchThread(Pid),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("status already dispatched")]
    Dispatched,
    #[error("channel closed")]
    Closed,
}

/// Process created by a [`ControlChannel::spawn`] call.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: Pid,
    pub stdout: Option<PipeReader>,
    pub stderr: Option<PipeReader>,
}

/// Result of a synchronous stop request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// Thread was already stopped, no signal sent.
    AlreadyStopped,
    /// Thread stopped due to interrupt request.
    Interrupted,
    /// Thread stopped for another reason before the interrupt arrives (exit, signal, trap).
    Event(RawStatus),
}

/// Channel level interpretation of a raw status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Exited(i32),
    Signaled(Signal),
    /// Signal delivery stop.
    Stopped(Signal),
    /// Stop caused by interrupt request.
    Interrupted,
    /// Software trap instruction executed, `pc` points after the trap instruction.
    Breakpoint { pc: u64 },
    HardwareBreakpoint { slot: usize },
    SingleStep,
    Clone(Pid),
    Fork(Pid),
    Exec,
    CalledExit,
}

/// Primitive operations over a traced process.
/// All thread scoped operations take thread id of the target thread.
pub trait ControlChannel: Send + Sync {
    fn target_info(&self) -> Result<TargetInfo, ChannelError>;

    /// Start a new process, process must be stopped at the first instruction.
    fn spawn(&self, start: &ProcessStart) -> Result<SpawnedProcess, ChannelError>;

    /// Attach to a running process, return all threads of it (stopped).
    fn attach(&self, pid: Pid) -> Result<Vec<Pid>, ChannelError>;

    /// Prepare a new thread (from clone or fork event) for tracing.
    /// If `wait` is set, block until first thread stop is observed.
    fn initialize_thread(&self, tid: Pid, wait: bool) -> Result<(), ChannelError>;

    fn detach(&self, tid: Pid) -> Result<(), ChannelError>;

    fn kill(&self, tid: Pid) -> Result<(), ChannelError>;

    fn step(&self, tid: Pid, signal: Option<Signal>) -> Result<(), ChannelError>;

    fn cont(&self, tid: Pid, signal: Option<Signal>) -> Result<(), ChannelError>;

    /// Asynchronous interrupt, return [`ChannelError::AlreadyStopped`] if thread already stopped.
    fn stop(&self, tid: Pid) -> Result<(), ChannelError>;

    /// Stop a thread synchronously. A status observed but not dispatched yet is returned as
    /// [`StopOutcome::Event`].
    fn stop_and_wait(&self, tid: Pid) -> Result<StopOutcome, ChannelError>;

    /// Block until next raw status of any traced thread.
    /// Return [`ChannelError::Closed`] when channel is closed.
    fn wait(&self) -> Result<RawStatus, ChannelError>;

    /// Interpret a status returned by [`ControlChannel::wait`] or [`ControlChannel::stop_and_wait`].
    /// Every status is dispatched once, a second attempt fails with [`ChannelError::Dispatched`].
    fn dispatch_event(&self, tid: Pid, status: RawStatus) -> Result<ChannelEvent, ChannelError>;

    fn read_memory(&self, tid: Pid, addr: u64, size: usize) -> Result<Vec<u8>, ChannelError>;

    fn write_memory(&self, tid: Pid, addr: u64, data: &[u8]) -> Result<(), ChannelError>;

    /// Register values keyed by architecture register index.
    fn get_registers(&self, tid: Pid) -> Result<Vec<u64>, ChannelError>;

    fn set_registers(&self, tid: Pid, values: &[u64]) -> Result<(), ChannelError>;

    fn insert_hw_breakpoint(
        &self,
        tid: Pid,
        slot: usize,
        addr: u64,
        kind: HardwareKind,
    ) -> Result<(), ChannelError>;

    fn remove_hw_breakpoint(&self, tid: Pid, slot: usize) -> Result<(), ChannelError>;

    /// Snapshot of process memory mappings.
    fn memory_maps(&self, pid: Pid) -> Result<Vec<MemoryArea>, ChannelError>;

    /// Wake up waiters and release channel resources.
    fn close(&self);
}
