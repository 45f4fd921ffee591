use crate::debugger::address::TargetAddress;
use crate::debugger::breakpoint::{BreakpointId, TrapId, TrapOwner};
use crate::debugger::invoke::InvocationToken;
use crate::debugger::runtime::NotificationKind;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use smallvec::SmallVec;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};

static GLOBAL_PROCESS_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Identity of a traced process inside a debugger session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u32);

impl ProcessId {
    pub(crate) fn next() -> Self {
        Self(GLOBAL_PROCESS_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "process#{}", self.0)
    }
}

/// Decoded stop of a single thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChildEvent {
    Exited(i32),
    Signaled(Signal),
    /// Thread stopped, `None` signal means a completed single step.
    Stopped { signal: Option<Signal> },
    Interrupted,
    /// Trap hit, address is a trap address (pc already rewound for software traps).
    HitBreakpoint {
        trap: Option<TrapId>,
        address: TargetAddress,
        owners: SmallVec<[(TrapId, TrapOwner); 2]>,
    },
    /// Runtime notification trap hit.
    Notification {
        kind: NotificationKind,
        data1: u64,
        data2: u64,
    },
    /// Nested invocation returned.
    CallbackCompleted {
        token: InvocationToken,
        data1: u64,
        data2: u64,
        blob: Option<Vec<u8>>,
    },
    ThreadCreated(Pid),
    Forked(Pid),
    Execd,
    /// Thread is going to exit.
    CalledExit,
    /// Event that can't be classified, thread is stopped.
    InternalError(String),
}

/// Why a thread stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Step command completed.
    StepComplete,
    /// Stop requested by debugger.
    Interrupted,
    /// Non quiet signal delivered to a thread, signal is re-delivered at next continue.
    Signal(Signal),
    /// Runtime reported an exception.
    Exception { data1: u64, data2: u64 },
    /// Runtime asked for a stop (jit breakpoint, main reached, etc.).
    Runtime(NotificationKind),
    /// Process image replaced.
    Exec,
    /// Internal error, thread stopped in unexpected state.
    Error(String),
}

/// Output stream of a spawned process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Event observable by debugger client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DebuggerEvent {
    Stopped {
        process: ProcessId,
        tid: Pid,
        address: Option<TargetAddress>,
        reason: StopReason,
    },
    HitBreakpoint {
        process: ProcessId,
        tid: Pid,
        address: TargetAddress,
        breakpoints: Vec<BreakpointId>,
    },
    ThreadCreated {
        process: ProcessId,
        tid: Pid,
    },
    ThreadExited {
        process: ProcessId,
        tid: Pid,
    },
    ProcessForked {
        parent: ProcessId,
        child_pid: Pid,
        /// Child process if it followed by the debugger.
        child: Option<ProcessId>,
    },
    ProcessExecd {
        process: ProcessId,
    },
    /// Whole process terminated, emitted once per process.
    ProcessExited {
        process: ProcessId,
        status: ExitStatus,
    },
    InvocationCompleted {
        process: ProcessId,
        tid: Pid,
        token: InvocationToken,
        data1: u64,
        data2: u64,
    },
    InvocationAborted {
        process: ProcessId,
        tid: Pid,
        token: InvocationToken,
    },
    /// Runtime notification, reported without stopping the debugee.
    Runtime {
        process: ProcessId,
        tid: Pid,
        kind: NotificationKind,
        data1: u64,
        data2: u64,
    },
    TargetOutput {
        process: ProcessId,
        stream: Stream,
        data: Vec<u8>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    Signal(Signal),
    /// Debugger detached from a process.
    Detached,
}
