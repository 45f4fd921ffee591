//! Nested invocations: calls of debugee functions made by a debugger on a stopped thread.
//!
//! Invocation is asynchronous: a call returns an [`InvocationHandle`] immediately and the thread
//! runs the invoked method. A trap at the saved program counter catches a return, then saved
//! registers are restored and the result is delivered exactly once, both into the handle and as
//! a [`crate::debugger::DebuggerEvent::InvocationCompleted`] event.

use crate::debugger::breakpoint::TrapId;
use crate::debugger::error::Error;
use log::warn;
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Duration;

const INTERNAL_TOKEN_BASE: u64 = 1 << 63;

static GLOBAL_INTERNAL_TOKEN: AtomicU64 = AtomicU64::new(INTERNAL_TOKEN_BASE);

/// Caller chosen correlation token of an invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvocationToken(u64);

impl InvocationToken {
    pub fn new(token: u64) -> Self {
        Self(token)
    }

    /// Token of an invocation made by a debugger itself (e.g. method compilation).
    pub(crate) fn internal() -> Self {
        Self(GLOBAL_INTERNAL_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_internal(self) -> bool {
        self.0 >= INTERNAL_TOKEN_BASE
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for InvocationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Method call request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub token: InvocationToken,
    pub method: u64,
    pub args: Vec<u64>,
    /// Read `n` bytes at the first returned word after completion.
    pub blob_size: Option<usize>,
}

impl Invocation {
    pub fn new(token: InvocationToken, method: u64, args: Vec<u64>) -> Self {
        Self {
            token,
            method,
            args,
            blob_size: None,
        }
    }

    pub fn with_blob(mut self, size: usize) -> Self {
        self.blob_size = Some(size);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvocationResult {
    pub data1: u64,
    pub data2: u64,
    pub blob: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvocationOutcome {
    Completed(InvocationResult),
    /// Invocation aborted or the thread exited before completion.
    Aborted,
}

/// Promise of an invocation result.
#[derive(Debug)]
pub struct InvocationHandle {
    token: InvocationToken,
    receiver: mpsc::Receiver<InvocationOutcome>,
}

impl InvocationHandle {
    pub fn token(&self) -> InvocationToken {
        self.token
    }

    /// Block until an outcome, `None` if debugger gone.
    pub fn wait(&self) -> Option<InvocationOutcome> {
        self.receiver.recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<InvocationOutcome> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn try_outcome(&self) -> Option<InvocationOutcome> {
        self.receiver.try_recv().ok()
    }
}

/// Invocation in progress.
#[derive(Debug)]
pub struct PendingInvocation {
    pub token: InvocationToken,
    pub tid: Pid,
    /// Trap at a return address.
    pub trap: TrapId,
    pub blob_size: Option<usize>,
    sender: mpsc::Sender<InvocationOutcome>,
}

impl PendingInvocation {
    /// Resolve the promise, a dropped handle is not an error.
    pub fn resolve(self, outcome: InvocationOutcome) {
        _ = self.sender.send(outcome);
    }
}

/// Invocations of a single process.
#[derive(Debug, Default)]
pub struct InvocationTable {
    pending: HashMap<InvocationToken, PendingInvocation>,
    resolved: HashSet<InvocationToken>,
}

impl InvocationTable {
    pub fn is_pending(&self, token: InvocationToken) -> bool {
        self.pending.contains_key(&token)
    }

    pub fn register(
        &mut self,
        token: InvocationToken,
        tid: Pid,
        trap: TrapId,
        blob_size: Option<usize>,
    ) -> Result<InvocationHandle, Error> {
        if self.pending.contains_key(&token) {
            return Err(Error::InvocationPending(token.as_u64()));
        }
        let (sender, receiver) = mpsc::channel();
        self.resolved.remove(&token);
        self.pending.insert(
            token,
            PendingInvocation {
                token,
                tid,
                trap,
                blob_size,
                sender,
            },
        );
        Ok(InvocationHandle { token, receiver })
    }

    /// Take a pending invocation for resolution.
    /// Unknown and already resolved tokens are logged and ignored.
    pub fn take(&mut self, token: InvocationToken) -> Option<PendingInvocation> {
        match self.pending.remove(&token) {
            Some(pending) => {
                self.resolved.insert(token);
                Some(pending)
            }
            None if self.resolved.contains(&token) => {
                warn!(target: "debugger", "invocation {token} already resolved");
                None
            }
            None => {
                warn!(target: "debugger", "unknown invocation {token}");
                None
            }
        }
    }

    pub fn get(&self, token: InvocationToken) -> Option<&PendingInvocation> {
        self.pending.get(&token)
    }

    /// Tokens of invocations running on a thread.
    pub fn of_thread(&self, tid: Pid) -> Vec<InvocationToken> {
        let mut tokens: Vec<_> = self
            .pending
            .values()
            .filter(|p| p.tid == tid)
            .map(|p| p.token)
            .collect();
        tokens.sort();
        tokens
    }

    /// Drop every pending invocation, handles receive [`InvocationOutcome::Aborted`].
    pub fn abort_all(&mut self) -> Vec<(InvocationToken, Pid)> {
        self.pending
            .drain()
            .map(|(token, pending)| {
                let tid = pending.tid;
                pending.resolve(InvocationOutcome::Aborted);
                (token, tid)
            })
            .collect()
    }
}
