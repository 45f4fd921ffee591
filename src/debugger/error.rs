use crate::debugger::breakpoint::BreakpointId;
use crate::debugger::channel::ChannelError;
use crate::debugger::register::Register;
use itertools::Itertools;
use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- state errors ----------------------------------------------
    #[error("target not stopped")]
    NotStopped,
    #[error("already have a target")]
    AlreadyHaveTarget,
    #[error("object disposed")]
    ObjectDisposed,
    #[error("no target")]
    NoTarget,
    #[error("target not attached, cannot detach")]
    CannotDetach,
    #[error("cannot start target: {0}")]
    CannotStartTarget(String),
    #[error("invocation with token {0} already pending")]
    InvocationPending(u64),

    // --------------------------------- entity not found ------------------------------------------
    #[error("thread {0} not found")]
    ThreadNotFound(Pid),
    #[error("process not found")]
    ProcessNotFound,
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(BreakpointId),
    #[error("trap {0} not found")]
    TrapNotFound(u32),
    #[error("unresolved symbol `{0}`")]
    UnresolvedSymbol(String),
    #[error("no stack")]
    NoStack,
    #[error("no callback frame")]
    NoCallbackFrame,
    #[error("register {0} not valid")]
    RegisterNotValid(Register),

    // --------------------------------- memory errors ---------------------------------------------
    #[error("memory access error at {0:#X}")]
    MemoryAccess(u64),
    #[error("write into read only memory at {0:#X}")]
    ReadOnly(u64),
    #[error("addresses from different domains")]
    DomainMismatch,

    // --------------------------------- trap errors -----------------------------------------------
    #[error("all debug registers are occupied")]
    DebugRegisterOccupied,
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    // --------------------------------- disasm ----------------------------------------------------
    #[error("install disassembler: {0}")]
    DisAsmInit(capstone::Error),
    #[error("instructions disassembly error: {0}")]
    DisAsm(capstone::Error),
    #[error("invalid instruction at {0:#X}")]
    InvalidInstruction(u64),

    // --------------------------------- runtime errors --------------------------------------------
    #[error("runtime support not found")]
    NoRuntime,
    #[error("invalid runtime debugger info magic")]
    RuntimeMagic,
    #[error("unsupported runtime debugger info version {found}, expected {supported}")]
    RuntimeVersion { found: i32, supported: i32 },

    // --------------------------------- channel errors --------------------------------------------
    #[error("control channel: {0}")]
    Channel(ChannelError),
    #[error("multiple errors: {}", .0.iter().join("; "))]
    MultipleErrors(Vec<Self>),

    // --------------------------------- third party errors ----------------------------------------
    #[error("hook: {0}")]
    Hook(anyhow::Error),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Config(#[from] toml::de::Error),
}

impl From<ChannelError> for Error {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::NoTarget => Error::NoTarget,
            ChannelError::AlreadyHaveTarget => Error::AlreadyHaveTarget,
            ChannelError::CannotStartTarget(msg) => Error::CannotStartTarget(msg),
            ChannelError::NotStopped => Error::NotStopped,
            ChannelError::MemoryAccess(addr) => Error::MemoryAccess(addr),
            ChannelError::DebugRegisterOccupied => Error::DebugRegisterOccupied,
            ChannelError::NotImplemented => Error::NotImplemented("control channel"),
            ChannelError::CannotDetach => Error::CannotDetach,
            ChannelError::NoSuchThread(tid) => Error::ThreadNotFound(tid),
            e @ (ChannelError::Unknown
            | ChannelError::AlreadyStopped
            | ChannelError::Syscall(_, _)
            | ChannelError::Dispatched
            | ChannelError::Closed) => Error::Channel(e),
        }
    }
}

impl Error {
    /// Return a hint to an interface - continue debugging after error or stop whole session.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::NotStopped => false,
            Error::AlreadyHaveTarget => false,
            Error::ObjectDisposed => false,
            Error::NoTarget => false,
            Error::CannotDetach => false,
            Error::CannotStartTarget(_) => false,
            Error::InvocationPending(_) => false,
            Error::ThreadNotFound(_) => false,
            Error::ProcessNotFound => false,
            Error::BreakpointNotFound(_) => false,
            Error::TrapNotFound(_) => false,
            Error::UnresolvedSymbol(_) => false,
            Error::NoStack => false,
            Error::NoCallbackFrame => false,
            Error::RegisterNotValid(_) => false,
            Error::MemoryAccess(_) => false,
            Error::ReadOnly(_) => false,
            Error::DomainMismatch => false,
            Error::DebugRegisterOccupied => false,
            Error::NotImplemented(_) => false,
            Error::NoRuntime => false,
            Error::RuntimeMagic => false,
            Error::RuntimeVersion { .. } => false,
            Error::DisAsm(_) => false,
            Error::InvalidInstruction(_) => false,
            Error::Hook(_) => false,
            Error::IO(_) => false,
            Error::Config(_) => false,
            Error::MultipleErrors(errors) => errors.iter().any(|e| e.is_fatal()),

            // currently fatal errors
            Error::DisAsmInit(_) => true,
            Error::Channel(ChannelError::Closed) => true,
            Error::Channel(ChannelError::Syscall(_, _)) => true,
            Error::Channel(_) => false,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
