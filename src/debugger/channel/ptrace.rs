//! Linux control channel.
//!
//! Ptrace requests are accepted only from a thread that attached a tracee, so every request is
//! executed by a single worker thread. The worker also polls `waitpid` between requests and
//! publishes observed statuses to [`ControlChannel::wait`] callers.

use crate::debugger::channel::code;
use crate::debugger::channel::{
    ChannelError, ChannelEvent, ControlChannel, Endianness, HardwareKind, RawStatus,
    SpawnedProcess, StopOutcome, TargetInfo,
};
use crate::debugger::memory::MemoryArea;
use crate::debugger::process::{seize_external, ProcessStart};
use crate::debugger::register::{update_user_regs, values_from_user_regs};
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::c_void;
use std::io::IoSliceMut;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(1);
const WORD_SIZE: u64 = std::mem::size_of::<libc::c_long>() as u64;
const PAGE_SIZE: u64 = 4096;
const DEBUG_SLOTS: usize = 4;
const DR6: usize = 6;
const DR7: usize = 7;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn syscall_error(name: &'static str, tid: Pid) -> impl Fn(Errno) -> ChannelError {
    move |e| match e {
        Errno::ESRCH | Errno::ECHILD => ChannelError::NoSuchThread(tid),
        e => ChannelError::Syscall(name, e),
    }
}

/// Offset of a debug register inside a `user` area.
fn debug_register_offset(idx: usize) -> ptrace::AddressType {
    (std::mem::offset_of!(libc::user, u_debugreg) + idx * 8) as ptrace::AddressType
}

/// Debug control register value with `slot` configured for `kind` access.
fn dr7_enable(dr7: u64, slot: usize, kind: HardwareKind) -> u64 {
    let (rw, len) = match kind {
        HardwareKind::Execute => (0b00, 0b00),
        HardwareKind::Write => (0b01, 0b11),
        HardwareKind::Read => (0b11, 0b11),
    };
    let control_shift = 16 + 4 * slot;
    dr7_disable(dr7, slot)
        | (1 << (2 * slot))
        | ((rw | len << 2) << control_shift)
        | code::DR7_EXACT
}

/// Debug control register value with `slot` disabled.
fn dr7_disable(dr7: u64, slot: usize) -> u64 {
    dr7 & !(1 << (2 * slot)) & !(0xF << (16 + 4 * slot))
}

/// Interpret a debug status register, `None` if no slot triggered.
fn dr6_slot(dr6: u64) -> Option<usize> {
    let triggered = dr6 & code::DR6_SLOT_MASK;
    (triggered != 0).then(|| triggered.trailing_zeros() as usize)
}

/// Statuses published for [`ControlChannel::wait`].
#[derive(Default)]
struct StatusQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

#[derive(Default)]
struct QueueState {
    statuses: VecDeque<WaitStatus>,
    closed: bool,
}

impl StatusQueue {
    fn push(&self, status: WaitStatus) {
        lock(&self.state).statuses.push_back(status);
        self.cond.notify_one();
    }

    fn pop(&self) -> Result<WaitStatus, ChannelError> {
        let mut state = lock(&self.state);
        loop {
            if let Some(status) = state.statuses.pop_front() {
                return Ok(status);
            }
            if state.closed {
                return Err(ChannelError::Closed);
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.cond.notify_all();
    }
}

/// Tracer side bookkeeping, owned by a worker thread.
struct Tracer {
    queue: Arc<StatusQueue>,
    /// Threads initialized for tracing.
    known: HashSet<Pid>,
    running: HashSet<Pid>,
    /// Statuses of threads that are not initialized yet.
    stash: HashMap<Pid, VecDeque<WaitStatus>>,
    /// Observed statuses waiting for a dispatch.
    undispatched: HashMap<Pid, VecDeque<WaitStatus>>,
}

impl Tracer {
    fn new(queue: Arc<StatusQueue>) -> Self {
        Self {
            queue,
            known: HashSet::new(),
            running: HashSet::new(),
            stash: HashMap::new(),
            undispatched: HashMap::new(),
        }
    }

    /// Reap every available status without blocking.
    fn poll(&mut self) {
        loop {
            let flags = WaitPidFlag::WNOHANG | WaitPidFlag::__WALL;
            match waitpid(None, Some(flags)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => self.observe(status),
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    warn!(target: "tracer", "waitpid: {e}");
                    break;
                }
            }
        }
    }

    fn observe(&mut self, status: WaitStatus) {
        let Some(tid) = status.pid() else {
            return;
        };
        if !self.known.contains(&tid) {
            debug!(target: "tracer", "status of uninitialized thread {tid} stashed: {status:?}");
            self.stash.entry(tid).or_default().push_back(status);
            return;
        }
        self.record(tid, status);
    }

    fn record(&mut self, tid: Pid, status: WaitStatus) {
        debug!(target: "tracer", "thread {tid} status: {status:?}");
        self.running.remove(&tid);
        if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
            self.known.remove(&tid);
        }
        self.undispatched.entry(tid).or_default().push_back(status);
        self.queue.push(status);
    }

    fn spawn(&mut self, start: &ProcessStart) -> Result<SpawnedProcess, ChannelError> {
        let pipe = || os_pipe::pipe().map_err(|e| ChannelError::CannotStartTarget(e.to_string()));
        let (stdout, stderr, pid) = if start.redirect_output {
            let (out_reader, out_writer) = pipe()?;
            let (err_reader, err_writer) = pipe()?;
            let pid = start.install(Some(out_writer), Some(err_writer))?;
            (Some(out_reader), Some(err_reader), pid)
        } else {
            (None, None, start.install(None, None)?)
        };

        self.run_to_exec(pid)?;
        self.known.insert(pid);
        debug!(target: "tracer", "process {pid} stopped after exec");
        Ok(SpawnedProcess {
            pid,
            stdout,
            stderr,
        })
    }

    /// Continue a seized process until it replaces its image by the target program.
    fn run_to_exec(&mut self, pid: Pid) -> Result<(), ChannelError> {
        _ = ptrace::cont(pid, None);
        loop {
            let status = waitpid(pid, Some(WaitPidFlag::__WALL))
                .map_err(|e| ChannelError::Syscall("waitpid", e))?;
            match status {
                WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_EXEC) => return Ok(()),
                WaitStatus::Exited(_, code) => {
                    return Err(ChannelError::CannotStartTarget(format!(
                        "process exited with code {code} before exec"
                    )))
                }
                WaitStatus::Signaled(_, signal, _) => {
                    return Err(ChannelError::CannotStartTarget(format!(
                        "process killed by {signal} before exec"
                    )))
                }
                WaitStatus::PtraceEvent(..) | WaitStatus::Stopped(..) => {
                    ptrace::cont(pid, None).map_err(syscall_error("ptrace cont", pid))?;
                }
                _ => {}
            }
        }
    }

    fn attach(&mut self, pid: Pid) -> Result<Vec<Pid>, ChannelError> {
        if self.known.contains(&pid) {
            return Err(ChannelError::AlreadyHaveTarget);
        }
        let threads = seize_external(pid)?;
        self.known.extend(threads.iter().copied());
        Ok(threads)
    }

    fn initialize_thread(&mut self, tid: Pid, wait: bool) -> Result<(), ChannelError> {
        self.known.insert(tid);
        let mut stashed = self.stash.remove(&tid).unwrap_or_default();
        if !wait && stashed.is_empty() {
            return Ok(());
        }

        let first = match stashed.pop_front() {
            Some(status) => status,
            None => waitpid(tid, Some(WaitPidFlag::__WALL))
                .map_err(syscall_error("waitpid", tid))?,
        };
        if !matches!(first, WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP)) {
            self.record(tid, first);
        }
        for status in stashed {
            self.record(tid, status);
        }
        Ok(())
    }

    fn detach(&mut self, tid: Pid) -> Result<(), ChannelError> {
        ptrace::detach(tid, None).map_err(syscall_error("ptrace detach", tid))?;
        self.forget(tid);
        Ok(())
    }

    fn forget(&mut self, tid: Pid) {
        self.known.remove(&tid);
        self.running.remove(&tid);
        self.stash.remove(&tid);
        self.undispatched.remove(&tid);
    }

    fn resume(&mut self, tid: Pid, step: bool, signal: Option<Signal>) -> Result<(), ChannelError> {
        if !self.known.contains(&tid) {
            return Err(ChannelError::NoSuchThread(tid));
        }
        if self.running.contains(&tid) {
            return Err(ChannelError::NotStopped);
        }
        if step {
            ptrace::step(tid, signal).map_err(syscall_error("ptrace step", tid))?;
        } else {
            ptrace::cont(tid, signal).map_err(syscall_error("ptrace cont", tid))?;
        }
        self.running.insert(tid);
        Ok(())
    }

    fn stop(&mut self, tid: Pid) -> Result<(), ChannelError> {
        if !self.running.contains(&tid) {
            return Err(ChannelError::AlreadyStopped);
        }
        ptrace::interrupt(tid).map_err(syscall_error("ptrace interrupt", tid))
    }

    fn stop_and_wait(&mut self, tid: Pid) -> Result<StopOutcome, ChannelError> {
        if let Some(status) = self.undispatched.get(&tid).and_then(|q| q.front()) {
            return Ok(StopOutcome::Event(*status));
        }
        if !self.running.contains(&tid) {
            return Ok(StopOutcome::AlreadyStopped);
        }

        match ptrace::interrupt(tid) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(ChannelError::Syscall("ptrace interrupt", e)),
        }
        let status =
            waitpid(tid, Some(WaitPidFlag::__WALL)).map_err(syscall_error("waitpid", tid))?;
        if let WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP) = status {
            self.running.remove(&tid);
            return Ok(StopOutcome::Interrupted);
        }
        self.record(tid, status);
        Ok(StopOutcome::Event(status))
    }

    fn dispatch(&mut self, tid: Pid, status: WaitStatus) -> Result<ChannelEvent, ChannelError> {
        let queue = self.undispatched.entry(tid).or_default();
        match queue.iter().position(|s| *s == status) {
            Some(idx) => {
                queue.remove(idx);
            }
            None => return Err(ChannelError::Dispatched),
        }
        if queue.is_empty() {
            self.undispatched.remove(&tid);
        }
        self.decode(tid, status)
    }

    fn decode(&mut self, tid: Pid, status: WaitStatus) -> Result<ChannelEvent, ChannelError> {
        let event = match status {
            WaitStatus::Exited(_, code) => ChannelEvent::Exited(code),
            WaitStatus::Signaled(_, signal, _) => ChannelEvent::Signaled(signal),
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                let info = ptrace::getsiginfo(tid).map_err(syscall_error("ptrace getsiginfo", tid))?;
                match info.si_code {
                    code::TRAP_BRKPT | code::SI_KERNEL => {
                        let regs =
                            ptrace::getregs(tid).map_err(syscall_error("ptrace getregs", tid))?;
                        ChannelEvent::Breakpoint { pc: regs.rip }
                    }
                    code::TRAP_HWBKPT => self.decode_hardware(tid)?,
                    code::TRAP_TRACE => ChannelEvent::SingleStep,
                    si_code => {
                        debug!(target: "tracer", "SIGTRAP with code {si_code} on {tid}");
                        ChannelEvent::Stopped(Signal::SIGTRAP)
                    }
                }
            }
            WaitStatus::Stopped(_, signal) => ChannelEvent::Stopped(signal),
            WaitStatus::PtraceEvent(_, _, event) => match event {
                libc::PTRACE_EVENT_CLONE => ChannelEvent::Clone(self.event_pid(tid)?),
                libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => {
                    ChannelEvent::Fork(self.event_pid(tid)?)
                }
                libc::PTRACE_EVENT_EXEC => ChannelEvent::Exec,
                libc::PTRACE_EVENT_EXIT => ChannelEvent::CalledExit,
                libc::PTRACE_EVENT_STOP => ChannelEvent::Interrupted,
                event => {
                    warn!(target: "tracer", "unsupported ptrace event {event} on {tid}");
                    return Err(ChannelError::Unknown);
                }
            },
            status => {
                warn!(target: "tracer", "unexpected status of {tid}: {status:?}");
                return Err(ChannelError::Unknown);
            }
        };
        Ok(event)
    }

    fn event_pid(&self, tid: Pid) -> Result<Pid, ChannelError> {
        let msg = ptrace::getevent(tid).map_err(syscall_error("ptrace getevent", tid))?;
        Ok(Pid::from_raw(msg as libc::pid_t))
    }

    fn decode_hardware(&mut self, tid: Pid) -> Result<ChannelEvent, ChannelError> {
        let dr6 = ptrace::read_user(tid, debug_register_offset(DR6))
            .map_err(syscall_error("ptrace peekuser", tid))? as u64;
        self.write_debug_register(tid, DR6, 0)?;

        if let Some(slot) = dr6_slot(dr6) {
            return Ok(ChannelEvent::HardwareBreakpoint { slot });
        }
        if dr6 & code::DR6_BS != 0 {
            return Ok(ChannelEvent::SingleStep);
        }
        Ok(ChannelEvent::Stopped(Signal::SIGTRAP))
    }

    fn write_debug_register(&self, tid: Pid, idx: usize, value: u64) -> Result<(), ChannelError> {
        unsafe {
            ptrace::write_user(tid, debug_register_offset(idx), value as *mut c_void)
                .map_err(syscall_error("ptrace pokeuser", tid))
        }
    }

    fn insert_hw_breakpoint(
        &self,
        tid: Pid,
        slot: usize,
        addr: u64,
        kind: HardwareKind,
    ) -> Result<(), ChannelError> {
        if slot >= DEBUG_SLOTS {
            return Err(ChannelError::DebugRegisterOccupied);
        }
        let dr7 = ptrace::read_user(tid, debug_register_offset(DR7))
            .map_err(syscall_error("ptrace peekuser", tid))? as u64;
        self.write_debug_register(tid, slot, addr)?;
        self.write_debug_register(tid, DR7, dr7_enable(dr7, slot, kind))
    }

    fn remove_hw_breakpoint(&self, tid: Pid, slot: usize) -> Result<(), ChannelError> {
        if slot >= DEBUG_SLOTS {
            return Err(ChannelError::DebugRegisterOccupied);
        }
        let dr7 = ptrace::read_user(tid, debug_register_offset(DR7))
            .map_err(syscall_error("ptrace peekuser", tid))? as u64;
        self.write_debug_register(tid, DR7, dr7_disable(dr7, slot))?;
        self.write_debug_register(tid, slot, 0)
    }

    fn read_words(&self, tid: Pid, addr: u64, size: usize) -> Result<Vec<u8>, ChannelError> {
        let mut result = Vec::with_capacity(size);
        let mut cursor = addr;
        while result.len() < size {
            let aligned = cursor & !(WORD_SIZE - 1);
            let shift = (cursor - aligned) as usize;
            let word = ptrace::read(tid, aligned as ptrace::AddressType)
                .map_err(|_| ChannelError::MemoryAccess(cursor))?
                .to_ne_bytes();
            let n = (WORD_SIZE as usize - shift).min(size - result.len());
            result.extend_from_slice(&word[shift..shift + n]);
            cursor += n as u64;
        }
        Ok(result)
    }

    fn write_words(&self, tid: Pid, addr: u64, data: &[u8]) -> Result<(), ChannelError> {
        let mut written = 0;
        while written < data.len() {
            let cursor = addr + written as u64;
            let aligned = cursor & !(WORD_SIZE - 1);
            let shift = (cursor - aligned) as usize;
            let n = (WORD_SIZE as usize - shift).min(data.len() - written);

            let mut word = if n == WORD_SIZE as usize {
                [0; WORD_SIZE as usize]
            } else {
                ptrace::read(tid, aligned as ptrace::AddressType)
                    .map_err(|_| ChannelError::MemoryAccess(cursor))?
                    .to_ne_bytes()
            };
            word[shift..shift + n].copy_from_slice(&data[written..written + n]);
            let value = libc::c_long::from_ne_bytes(word);
            unsafe {
                ptrace::write(tid, aligned as ptrace::AddressType, value as *mut c_void)
                    .map_err(|_| ChannelError::MemoryAccess(cursor))?;
            }
            written += n;
        }
        Ok(())
    }

    fn get_registers(&self, tid: Pid) -> Result<Vec<u64>, ChannelError> {
        let regs = ptrace::getregs(tid).map_err(syscall_error("ptrace getregs", tid))?;
        Ok(values_from_user_regs(&regs))
    }

    fn set_registers(&self, tid: Pid, values: &[u64]) -> Result<(), ChannelError> {
        let mut regs = ptrace::getregs(tid).map_err(syscall_error("ptrace getregs", tid))?;
        update_user_regs(&mut regs, values);
        ptrace::setregs(tid, regs).map_err(syscall_error("ptrace setregs", tid))
    }
}

type Job = Box<dyn FnOnce(&mut Tracer) + Send>;

fn work(mut tracer: Tracer, jobs: mpsc::Receiver<Job>) {
    loop {
        match jobs.recv_timeout(POLL_INTERVAL) {
            Ok(job) => job(&mut tracer),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        tracer.poll();
    }
    debug!(target: "tracer", "ptrace worker stopped");
}

/// [`ControlChannel`] over linux ptrace.
pub struct PtraceChannel {
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    queue: Arc<StatusQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PtraceChannel {
    /// Start a ptrace worker thread.
    pub fn new() -> std::io::Result<Self> {
        let queue = Arc::new(StatusQueue::default());
        let (jobs_tx, jobs_rx) = mpsc::channel();
        let tracer = Tracer::new(queue.clone());
        let worker = thread::Builder::new()
            .name("rdb-tracer".to_string())
            .spawn(move || work(tracer, jobs_rx))?;

        Ok(Self {
            jobs: Mutex::new(Some(jobs_tx)),
            queue,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Execute a request on a worker thread and wait for its result.
    fn call<T, F>(&self, f: F) -> Result<T, ChannelError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Tracer) -> Result<T, ChannelError> + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        let job: Job = Box::new(move |tracer| {
            _ = result_tx.send(f(tracer));
        });
        {
            let jobs = lock(&self.jobs);
            let sender = jobs.as_ref().ok_or(ChannelError::Closed)?;
            sender.send(job).map_err(|_| ChannelError::Closed)?;
        }
        result_rx.recv().map_err(|_| ChannelError::Closed)?
    }

    fn read_vm(tid: Pid, addr: u64, size: usize) -> Result<Vec<u8>, ChannelError> {
        let mut remote = vec![];
        let mut cursor = addr;
        let end = addr + size as u64;
        while cursor < end {
            let next_page = (cursor / PAGE_SIZE + 1) * PAGE_SIZE;
            let chunk_end = next_page.min(end);
            remote.push(RemoteIoVec {
                base: cursor as usize,
                len: (chunk_end - cursor) as usize,
            });
            cursor = chunk_end;
        }

        let mut buf = vec![0; size];
        let read = process_vm_readv(tid, &mut [IoSliceMut::new(&mut buf)], &remote)
            .map_err(|_| ChannelError::MemoryAccess(addr))?;
        if read < size {
            return Err(ChannelError::MemoryAccess(addr + read as u64));
        }
        Ok(buf)
    }
}

impl ControlChannel for PtraceChannel {
    fn target_info(&self) -> Result<TargetInfo, ChannelError> {
        Ok(TargetInfo {
            int_size: 4,
            long_size: 8,
            address_size: 8,
            endianness: Endianness::Little,
            hardware_slots: DEBUG_SLOTS,
        })
    }

    fn spawn(&self, start: &ProcessStart) -> Result<SpawnedProcess, ChannelError> {
        let start = start.clone();
        self.call(move |tracer| tracer.spawn(&start))
    }

    fn attach(&self, pid: Pid) -> Result<Vec<Pid>, ChannelError> {
        self.call(move |tracer| tracer.attach(pid))
    }

    fn initialize_thread(&self, tid: Pid, wait: bool) -> Result<(), ChannelError> {
        self.call(move |tracer| tracer.initialize_thread(tid, wait))
    }

    fn detach(&self, tid: Pid) -> Result<(), ChannelError> {
        self.call(move |tracer| tracer.detach(tid))
    }

    fn kill(&self, tid: Pid) -> Result<(), ChannelError> {
        signal::kill(tid, Signal::SIGKILL).map_err(syscall_error("kill", tid))
    }

    fn step(&self, tid: Pid, signal: Option<Signal>) -> Result<(), ChannelError> {
        self.call(move |tracer| tracer.resume(tid, true, signal))
    }

    fn cont(&self, tid: Pid, signal: Option<Signal>) -> Result<(), ChannelError> {
        self.call(move |tracer| tracer.resume(tid, false, signal))
    }

    fn stop(&self, tid: Pid) -> Result<(), ChannelError> {
        self.call(move |tracer| tracer.stop(tid))
    }

    fn stop_and_wait(&self, tid: Pid) -> Result<StopOutcome, ChannelError> {
        self.call(move |tracer| tracer.stop_and_wait(tid))
    }

    fn wait(&self) -> Result<RawStatus, ChannelError> {
        self.queue.pop()
    }

    fn dispatch_event(&self, tid: Pid, status: RawStatus) -> Result<ChannelEvent, ChannelError> {
        self.call(move |tracer| tracer.dispatch(tid, status))
    }

    fn read_memory(&self, tid: Pid, addr: u64, size: usize) -> Result<Vec<u8>, ChannelError> {
        if size == 0 {
            return Ok(vec![]);
        }
        match Self::read_vm(tid, addr, size) {
            Ok(bytes) => Ok(bytes),
            // not readable pages (execute only code) are still readable through ptrace
            Err(_) => self.call(move |tracer| tracer.read_words(tid, addr, size)),
        }
    }

    fn write_memory(&self, tid: Pid, addr: u64, data: &[u8]) -> Result<(), ChannelError> {
        let data = data.to_vec();
        self.call(move |tracer| tracer.write_words(tid, addr, &data))
    }

    fn get_registers(&self, tid: Pid) -> Result<Vec<u64>, ChannelError> {
        self.call(move |tracer| tracer.get_registers(tid))
    }

    fn set_registers(&self, tid: Pid, values: &[u64]) -> Result<(), ChannelError> {
        let values = values.to_vec();
        self.call(move |tracer| tracer.set_registers(tid, &values))
    }

    fn insert_hw_breakpoint(
        &self,
        tid: Pid,
        slot: usize,
        addr: u64,
        kind: HardwareKind,
    ) -> Result<(), ChannelError> {
        self.call(move |tracer| tracer.insert_hw_breakpoint(tid, slot, addr, kind))
    }

    fn remove_hw_breakpoint(&self, tid: Pid, slot: usize) -> Result<(), ChannelError> {
        self.call(move |tracer| tracer.remove_hw_breakpoint(tid, slot))
    }

    fn memory_maps(&self, pid: Pid) -> Result<Vec<MemoryArea>, ChannelError> {
        let maps = proc_maps::get_process_maps(pid.as_raw())
            .map_err(|_| ChannelError::NoSuchThread(pid))?;
        Ok(maps.iter().map(MemoryArea::from).collect())
    }

    fn close(&self) {
        self.queue.close();
        lock(&self.jobs).take();
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                warn!(target: "tracer", "ptrace worker panicked");
            }
        }
    }
}

impl Drop for PtraceChannel {
    fn drop(&mut self) {
        self.close();
    }
}
