pub mod address;
pub mod arch;
pub mod breakpoint;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod inferior;
pub mod invoke;
mod manager;
pub mod memory;
pub mod process;
pub mod register;
pub mod runtime;
pub mod step;

pub use address::{AddressDomain, TargetAddress};
pub use breakpoint::{Breakpoint, BreakpointId, BreakpointInfo, BreakpointLocation};
pub use config::{DebuggerConfig, ForkPolicy};
pub use error::Error;
pub use event::{DebuggerEvent, ExitStatus, ProcessId, StopReason, Stream};
pub use inferior::RunState;
pub use invoke::{Invocation, InvocationHandle, InvocationOutcome, InvocationToken};
pub use manager::ThreadInfo;
pub use process::ProcessStart;
pub use step::StepCommand;

use crate::debugger::arch::{Architecture, X86_64};
use crate::debugger::channel::{ChannelError, ControlChannel, PtraceChannel, RawStatus};
use crate::debugger::manager::{Effect, ProcessState, Shared};
use crate::debugger::memory::{MemoryAccess, MemoryArea};
use crate::debugger::register::Registers;
use crate::debugger::runtime::{
    managed_runtime, NoSymbols, RuntimeFactory, RuntimeHandler, SymbolLookup,
};
use crate::weak_error;
use log::{debug, info, warn};
use nix::unistd::Pid;
use os_pipe::PipeReader;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Read;
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type ProcessRef = Arc<Mutex<ProcessState>>;

/// Processes of a session and their threads.
#[derive(Default)]
struct Registry {
    processes: BTreeMap<ProcessId, ProcessRef>,
    tids: HashMap<Pid, ProcessId>,
    /// Statuses of threads unknown yet, replayed when a thread is registered.
    orphans: HashMap<Pid, VecDeque<RawStatus>>,
}

struct Session {
    shared: Shared,
    registry: Mutex<Registry>,
}

impl Session {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    fn process(&self, id: ProcessId) -> Result<ProcessRef, Error> {
        self.registry()
            .processes
            .get(&id)
            .cloned()
            .ok_or(Error::ProcessNotFound)
    }

    fn process_of(&self, tid: Pid) -> Result<(ProcessId, ProcessRef), Error> {
        let registry = self.registry();
        let id = *registry.tids.get(&tid).ok_or(Error::ThreadNotFound(tid))?;
        let process = registry
            .processes
            .get(&id)
            .cloned()
            .ok_or(Error::ProcessNotFound)?;
        Ok((id, process))
    }

    /// Add a new process into a registry, statuses of its threads observed earlier are replayed.
    fn register(&self, state: ProcessState) -> ProcessId {
        let id = state.id();
        let tids = state.tids();
        let process = Arc::new(Mutex::new(state));
        let orphans = {
            let mut registry = self.registry();
            registry.processes.insert(id, process.clone());
            let mut orphans = vec![];
            for tid in tids {
                registry.tids.insert(tid, id);
                if let Some(statuses) = registry.orphans.remove(&tid) {
                    orphans.extend(statuses.into_iter().map(|s| (tid, s)));
                }
            }
            orphans
        };
        if !orphans.is_empty() {
            let effects = {
                let mut state = lock(&process);
                for (tid, status) in orphans {
                    state.enqueue(tid, status);
                }
                state.drain_pending();
                state.take_effects()
            };
            self.apply(id, effects);
        }
        id
    }

    /// Pass a raw status to the owning process.
    fn deliver(&self, tid: Pid, status: RawStatus) {
        let (id, process) = {
            let mut registry = self.registry();
            let found = registry
                .tids
                .get(&tid)
                .and_then(|id| registry.processes.get(id).map(|p| (*id, p.clone())));
            match found {
                Some(found) => found,
                None => {
                    debug!(target: "debugger", "status of unknown thread {tid}: {status:?}");
                    registry.orphans.entry(tid).or_default().push_back(status);
                    return;
                }
            }
        };

        let effects = {
            let mut state = lock(&process);
            state.handle_status(tid, status);
            state.drain_pending();
            state.take_effects()
        };
        self.apply(id, effects);
    }

    /// Apply registry changes requested by processes, a process lock is never held here.
    fn apply(&self, id: ProcessId, effects: Vec<Effect>) {
        let mut work: VecDeque<(ProcessId, Vec<Effect>)> = VecDeque::from([(id, effects)]);

        while let Some((id, effects)) = work.pop_front() {
            for effect in effects {
                match effect {
                    Effect::ThreadAdded(tid) => {
                        let (process, orphans) = {
                            let mut registry = self.registry();
                            registry.tids.insert(tid, id);
                            (
                                registry.processes.get(&id).cloned(),
                                registry.orphans.remove(&tid),
                            )
                        };
                        if let (Some(process), Some(orphans)) = (process, orphans) {
                            let mut state = lock(&process);
                            for status in orphans {
                                state.enqueue(tid, status);
                            }
                            state.drain_pending();
                            work.push_back((id, state.take_effects()));
                        }
                    }
                    Effect::ThreadRemoved(tid) => {
                        self.registry().tids.remove(&tid);
                    }
                    Effect::Forked(child) => {
                        let child_id = self.register(*child);
                        debug!(target: "debugger", "{child_id} registered as a child of {id}");
                        if let Ok(process) = self.process(child_id) {
                            let mut state = lock(&process);
                            weak_error!(state.cont_all(), "continue forked child:");
                            work.push_back((child_id, state.take_effects()));
                        }
                    }
                    Effect::Gone => {
                        let mut registry = self.registry();
                        registry.processes.remove(&id);
                        registry.tids.retain(|_, owner| *owner != id);
                        debug!(target: "debugger", "{id} removed from a session");
                    }
                }
            }
        }
    }
}

/// Loop over raw statuses of a channel until the channel closed.
fn wait_loop(session: Arc<Session>) {
    loop {
        let status = match session.shared.channel.wait() {
            Ok(status) => status,
            Err(ChannelError::Closed) => break,
            Err(e) => {
                warn!(target: "debugger", "wait for a status: {e}");
                break;
            }
        };
        let Some(tid) = status.pid() else {
            continue;
        };
        session.deliver(tid, status);
    }
    debug!(target: "debugger", "waiter stopped");
}

/// Debugger session configuration.
pub struct DebuggerBuilder {
    channel: Option<Arc<dyn ControlChannel>>,
    arch: Arc<dyn Architecture>,
    config: DebuggerConfig,
    symbols: Arc<dyn SymbolLookup>,
    runtime: RuntimeFactory,
}

impl Default for DebuggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DebuggerBuilder {
    pub fn new() -> Self {
        Self {
            channel: None,
            arch: Arc::new(X86_64),
            config: DebuggerConfig::default(),
            symbols: Arc::new(NoSymbols),
            runtime: managed_runtime(),
        }
    }

    /// Use a custom control channel, ptrace channel is used by default.
    pub fn with_channel(mut self, channel: Arc<dyn ControlChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_arch(mut self, arch: Arc<dyn Architecture>) -> Self {
        self.arch = arch;
        self
    }

    pub fn with_config(mut self, config: DebuggerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_symbols(mut self, symbols: impl SymbolLookup + 'static) -> Self {
        self.symbols = Arc::new(symbols);
        self
    }

    /// Runtime handler factory, a handler is created for every traced process.
    pub fn with_runtime(mut self, runtime: RuntimeFactory) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn build(self) -> Result<Debugger, Error> {
        let channel: Arc<dyn ControlChannel> = match self.channel {
            Some(channel) => channel,
            None => Arc::new(PtraceChannel::new()?),
        };
        let (events_tx, events_rx) = mpsc::channel();
        let session = Arc::new(Session {
            shared: Shared {
                channel,
                arch: self.arch,
                config: Arc::new(self.config),
                symbols: self.symbols,
                runtime: self.runtime,
                events: events_tx,
            },
            registry: Mutex::default(),
        });

        let waiter = {
            let session = session.clone();
            thread::Builder::new()
                .name("rdb-waiter".to_string())
                .spawn(move || wait_loop(session))?
        };

        Ok(Debugger {
            session,
            events: Mutex::new(events_rx),
            waiter: Some(waiter),
        })
    }
}

/// Debugger session over one or more traced processes.
///
/// Raw statuses are consumed by a background waiter, client facing operations lock a single
/// process at a time. Everything observable happens through [`DebuggerEvent`]s.
pub struct Debugger {
    session: Arc<Session>,
    events: Mutex<mpsc::Receiver<DebuggerEvent>>,
    waiter: Option<JoinHandle<()>>,
}

impl Debugger {
    pub fn builder() -> DebuggerBuilder {
        DebuggerBuilder::new()
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.session.shared.config
    }

    fn with_process<T>(
        &self,
        id: ProcessId,
        f: impl FnOnce(&mut ProcessState) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let process = self.session.process(id)?;
        let (result, effects) = {
            let mut state = lock(&process);
            let result = f(&mut state);
            (result, state.take_effects())
        };
        self.session.apply(id, effects);
        result
    }

    fn with_thread<T>(
        &self,
        tid: Pid,
        f: impl FnOnce(&mut ProcessState) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let (id, process) = self.session.process_of(tid)?;
        let (result, effects) = {
            let mut state = lock(&process);
            let result = f(&mut state);
            (result, state.take_effects())
        };
        self.session.apply(id, effects);
        result
    }

    fn forward_output(&self, process: ProcessId, reader: Option<PipeReader>, stream: Stream) {
        let Some(mut reader) = reader else {
            return;
        };
        let events = self.session.shared.events.clone();
        let spawned = thread::Builder::new()
            .name(format!("rdb-output-{}", process.as_u32()))
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let event = DebuggerEvent::TargetOutput {
                                process,
                                stream,
                                data: buf[..n].to_vec(),
                            };
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        weak_error!(spawned, "spawn output reader:");
    }

    // ---------------------------------- processes -----------------------------------------------

    /// Start a new process, it stays stopped at the first instruction until [`Debugger::cont`].
    pub fn spawn(&self, mut start: ProcessStart) -> Result<ProcessId, Error> {
        let shared = &self.session.shared;
        start.disable_aslr &= shared.config.disable_aslr;
        let spawned = shared.channel.spawn(&start)?;
        let info = shared.channel.target_info()?;

        let mut state = ProcessState::new(
            ProcessId::next(),
            spawned.pid,
            true,
            info,
            AddressDomain::new(),
            shared.clone(),
        );
        state.add_thread(spawned.pid)?;
        state.initialize_runtime(false);
        let id = self.session.register(state);
        info!(target: "debugger", "{id} spawned: {} ({})", start.program, spawned.pid);

        self.forward_output(id, spawned.stdout, Stream::Stdout);
        self.forward_output(id, spawned.stderr, Stream::Stderr);
        Ok(id)
    }

    /// Attach to a running process, every thread of it is stopped.
    pub fn attach(&self, pid: Pid) -> Result<ProcessId, Error> {
        let shared = &self.session.shared;
        let threads = shared.channel.attach(pid)?;
        let info = shared.channel.target_info()?;

        let mut state = ProcessState::new(
            ProcessId::next(),
            pid,
            false,
            info,
            AddressDomain::new(),
            shared.clone(),
        );
        for tid in threads {
            state.add_thread(tid)?;
        }
        state.initialize_runtime(true);
        let id = self.session.register(state);
        info!(target: "debugger", "{id} attached to {pid}");
        Ok(id)
    }

    /// Live processes of a session.
    pub fn processes(&self) -> Vec<ProcessId> {
        self.session.registry().processes.keys().copied().collect()
    }

    pub fn process_pid(&self, id: ProcessId) -> Result<Pid, Error> {
        self.with_process(id, |state| Ok(state.pid()))
    }

    /// Current address domain of a process.
    pub fn domain(&self, id: ProcessId) -> Result<AddressDomain, Error> {
        self.with_process(id, |state| Ok(state.domain()))
    }

    pub fn threads(&self, id: ProcessId) -> Result<Vec<ThreadInfo>, Error> {
        self.with_process(id, |state| Ok(state.threads()))
    }

    pub fn run_state(&self, tid: Pid) -> Result<RunState, Error> {
        self.with_thread(tid, |state| state.run_state(tid))
    }

    /// Number of trap instructions or debug register slots armed in process.
    pub fn physical_trap_count(&self, id: ProcessId) -> Result<usize, Error> {
        self.with_process(id, |state| Ok(state.physical_trap_count()))
    }

    /// Name of a runtime handler attached to a process.
    pub fn runtime_name(&self, id: ProcessId) -> Result<&'static str, Error> {
        self.with_process(id, |state| Ok(state.runtime().name()))
    }

    /// Inspect a runtime handler of a process.
    pub fn with_runtime<T>(
        &self,
        id: ProcessId,
        f: impl FnOnce(&dyn RuntimeHandler) -> T,
    ) -> Result<T, Error> {
        self.with_process(id, |state| Ok(f(state.runtime())))
    }

    // ---------------------------------- run control ---------------------------------------------

    /// Continue every thread of a process.
    pub fn cont(&self, id: ProcessId) -> Result<(), Error> {
        self.with_process(id, |state| state.cont_all())
    }

    pub fn cont_thread(&self, tid: Pid) -> Result<(), Error> {
        self.with_thread(tid, |state| state.cont_thread(tid))
    }

    /// Start a step, completion is reported as [`StopReason::StepComplete`].
    pub fn step(&self, tid: Pid, command: StepCommand) -> Result<(), Error> {
        self.with_thread(tid, |state| state.step(tid, command))
    }

    /// Stop whole process, return when every thread is stopped.
    pub fn stop(&self, id: ProcessId) -> Result<(), Error> {
        self.with_process(id, |state| state.stop_all())
    }

    /// Request a thread stop, return false if a thread already stopped.
    pub fn stop_thread(&self, tid: Pid) -> Result<bool, Error> {
        self.with_thread(tid, |state| state.stop_thread(tid))
    }

    /// Remove every trap, restore memory and let a process go.
    pub fn detach(&self, id: ProcessId) -> Result<(), Error> {
        self.with_process(id, |state| state.detach())
    }

    pub fn kill(&self, id: ProcessId) -> Result<(), Error> {
        self.with_process(id, |state| state.kill())
    }

    // ---------------------------------- breakpoints ---------------------------------------------

    pub fn insert_breakpoint(
        &self,
        id: ProcessId,
        breakpoint: Breakpoint,
        enabled: bool,
    ) -> Result<BreakpointId, Error> {
        self.with_process(id, |state| state.insert_breakpoint(breakpoint, enabled))
    }

    pub fn remove_breakpoint(&self, id: ProcessId, breakpoint: BreakpointId) -> Result<(), Error> {
        self.with_process(id, |state| state.remove_breakpoint(breakpoint))
    }

    pub fn set_breakpoint_enabled(
        &self,
        id: ProcessId,
        breakpoint: BreakpointId,
        enabled: bool,
    ) -> Result<(), Error> {
        self.with_process(id, |state| state.set_breakpoint_enabled(breakpoint, enabled))
    }

    pub fn breakpoints(&self, id: ProcessId) -> Result<Vec<BreakpointInfo>, Error> {
        self.with_process(id, |state| Ok(state.breakpoints()))
    }

    // ---------------------------------- memory and registers ------------------------------------

    /// Access memory of a process through a stopped thread.
    pub fn with_memory<T>(
        &self,
        tid: Pid,
        f: impl FnOnce(&mut dyn MemoryAccess) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.with_thread(tid, |state| state.with_memory(tid, f))
    }

    pub fn read_memory(&self, tid: Pid, addr: TargetAddress, size: usize) -> Result<Vec<u8>, Error> {
        self.with_memory(tid, |memory| memory.read_buffer(addr, size))
    }

    pub fn write_memory(&self, tid: Pid, addr: TargetAddress, data: &[u8]) -> Result<(), Error> {
        self.with_memory(tid, |memory| memory.write_buffer(addr, data))
    }

    /// Read null terminated string, length is bounded by [`DebuggerConfig::max_string_length`].
    pub fn read_string(&self, tid: Pid, addr: TargetAddress) -> Result<String, Error> {
        let max_len = self.session.shared.config.max_string_length;
        self.with_memory(tid, |memory| memory.read_string(addr, max_len))
    }

    /// Address of a symbol in a process memory image.
    pub fn resolve_symbol(&self, id: ProcessId, name: &str) -> Result<TargetAddress, Error> {
        let pid = self.process_pid(id)?;
        let domain = self.domain(id)?;
        let addr = self
            .session
            .shared
            .symbols
            .resolve(pid, name)
            .map_err(Error::Hook)?;
        addr.map(|addr| TargetAddress::new(domain, addr))
            .ok_or_else(|| Error::UnresolvedSymbol(name.to_string()))
    }

    pub fn registers(&self, tid: Pid) -> Result<Registers, Error> {
        self.with_thread(tid, |state| state.registers(tid))
    }

    pub fn set_registers(&self, tid: Pid, registers: &Registers) -> Result<(), Error> {
        self.with_thread(tid, |state| state.set_registers(tid, registers))
    }

    pub fn memory_maps(&self, id: ProcessId) -> Result<Vec<MemoryArea>, Error> {
        self.with_process(id, |state| state.memory_maps())
    }

    // ---------------------------------- invocations ---------------------------------------------

    /// Call a method on a stopped thread, result is delivered through a returned handle.
    pub fn invoke(&self, tid: Pid, invocation: Invocation) -> Result<InvocationHandle, Error> {
        self.with_thread(tid, |state| state.invoke(tid, invocation))
    }

    pub fn abort_invocation(&self, id: ProcessId, token: InvocationToken) -> Result<(), Error> {
        self.with_process(id, |state| state.abort_invocation(token))
    }

    // ---------------------------------- events --------------------------------------------------

    /// Wait for the next event, `None` on timeout.
    pub fn wait_event(&self, timeout: Duration) -> Option<DebuggerEvent> {
        lock(&self.events).recv_timeout(timeout).ok()
    }

    pub fn try_event(&self) -> Option<DebuggerEvent> {
        lock(&self.events).try_recv().ok()
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        for id in self.processes() {
            let spawned = self.with_process(id, |state| Ok(state.is_spawned()));
            if spawned.unwrap_or_default() {
                weak_error!(self.kill(id), "kill on drop:");
            } else {
                weak_error!(self.detach(id), "detach on drop:");
            }
        }
        self.session.shared.channel.close();
        if let Some(waiter) = self.waiter.take() {
            if waiter.join().is_err() {
                warn!(target: "debugger", "waiter thread panicked");
            }
        }
    }
}
