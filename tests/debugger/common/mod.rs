//! Scripted control channel for integration tests.
//!
//! [`MockChannel`] runs a tiny x86_64 interpreter instead of real processes: code is assembled
//! with [`Asm`] into a [`Program`] image, every resume executes instructions synchronously until
//! a trap, a ptrace-like event or a `jmp $` spin (thread stays running until stopped).

use nix::libc;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use rdb::debugger::channel::{
    ChannelError, ChannelEvent, ControlChannel, Endianness, HardwareKind, RawStatus,
    SpawnedProcess, StopOutcome, TargetInfo,
};
use rdb::debugger::memory::MemoryArea;
use rdb::debugger::process::ProcessStart;
use rdb::debugger::register::Register;
use rdb::debugger::{
    Debugger, DebuggerBuilder, DebuggerEvent, ExitStatus, ProcessId, StopReason, TargetAddress,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use strum::EnumCount;

pub const CODE: u64 = 0x40_0000;
pub const RODATA: u64 = 0x50_0000;
pub const DATA: u64 = 0x60_0000;
pub const STACK: u64 = 0x7F_0000;
pub const STACK_TOP: u64 = 0x80_0000;

const PAGE: usize = 0x1000;
const EFLAGS_RF: u64 = 1 << 16;
/// Instructions executed by a single resume before a thread is considered spinning.
const BUDGET: usize = 100_000;

const SYS_CLONE: u64 = 56;
const SYS_FORK: u64 = 57;
const SYS_EXECVE: u64 = 59;
const SYS_EXIT: u64 = 60;
const SYS_KILL: u64 = 62;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
/// Time to wait for an event that must not come.
pub const QUIET_TIMEOUT: Duration = Duration::from_millis(200);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---------------------------------- assembler ---------------------------------------------------

/// Registers addressable by `mov r32, imm32`, discriminant is an opcode register number.
#[derive(Clone, Copy, Debug)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
}

impl Gpr {
    fn from_code(code: u8) -> Register {
        match code {
            0 => Register::Rax,
            1 => Register::Rcx,
            2 => Register::Rdx,
            3 => Register::Rbx,
            4 => Register::Rsp,
            5 => Register::Rbp,
            6 => Register::Rsi,
            _ => Register::Rdi,
        }
    }
}

/// Sequential x86_64 code builder.
#[derive(Clone, Debug)]
pub struct Asm {
    start: u64,
    bytes: Vec<u8>,
}

impl Asm {
    pub fn at(start: u64) -> Self {
        Self {
            start,
            bytes: vec![],
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Address of the next emitted instruction.
    pub fn here(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn nop(self) -> Self {
        self.raw(&[0x90])
    }

    pub fn int3(self) -> Self {
        self.raw(&[0xCC])
    }

    pub fn ret(self) -> Self {
        self.raw(&[0xC3])
    }

    /// `jmp $`
    pub fn spin(self) -> Self {
        self.raw(&[0xEB, 0xFE])
    }

    pub fn mov(self, reg: Gpr, imm: u32) -> Self {
        let mut bytes = vec![0xB8 + reg as u8];
        bytes.extend_from_slice(&imm.to_le_bytes());
        self.raw(&bytes)
    }

    fn rel32(&self, target: u64, len: u64) -> [u8; 4] {
        let rel = target as i64 - (self.here() + len) as i64;
        (rel as i32).to_le_bytes()
    }

    pub fn call(self, target: u64) -> Self {
        let rel = self.rel32(target, 5);
        self.raw(&[0xE8]).raw(&rel)
    }

    /// `call rax`
    pub fn call_rax(self) -> Self {
        self.raw(&[0xFF, 0xD0])
    }

    pub fn jmp(self, target: u64) -> Self {
        let rel = self.rel32(target, 5);
        self.raw(&[0xE9]).raw(&rel)
    }

    /// Decrement `rcx`, jump to `target` while it is not zero.
    pub fn loop_to(self, target: u64) -> Self {
        let rel = target as i64 - (self.here() + 2) as i64;
        self.raw(&[0xE2, rel as i8 as u8])
    }

    /// `push rbp; mov rbp, rsp`
    pub fn enter(self) -> Self {
        self.raw(&[0x55, 0x48, 0x89, 0xE5])
    }

    /// `pop rbp; ret`
    pub fn leave(self) -> Self {
        self.raw(&[0x5D, 0xC3])
    }

    /// `pop rax`
    pub fn pop_rax(self) -> Self {
        self.raw(&[0x58])
    }

    /// `mov [rdi], eax`
    pub fn store(self) -> Self {
        self.raw(&[0x89, 0x07])
    }

    /// `mov eax, [rdi]`
    pub fn load(self) -> Self {
        self.raw(&[0x8B, 0x07])
    }

    pub fn syscall(self, nr: u64) -> Self {
        self.mov(Gpr::Rax, nr as u32).raw(&[0x0F, 0x05])
    }

    pub fn exit(self, code: u32) -> Self {
        self.mov(Gpr::Rdi, code).syscall(SYS_EXIT)
    }

    /// Send a signal to the calling thread.
    pub fn raise(self, signal: Signal) -> Self {
        self.mov(Gpr::Rdi, signal as i32 as u32).syscall(SYS_KILL)
    }

    pub fn fork(self) -> Self {
        self.syscall(SYS_FORK)
    }

    pub fn clone_thread(self) -> Self {
        self.syscall(SYS_CLONE)
    }

    /// Replace process image with a program given by [`Program::then_exec`].
    pub fn exec(self) -> Self {
        self.syscall(SYS_EXECVE)
    }
}

// ---------------------------------- memory image ------------------------------------------------

#[derive(Clone, Debug)]
struct Region {
    start: u64,
    data: Vec<u8>,
    write: bool,
    execute: bool,
}

impl Region {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

#[derive(Clone, Debug)]
struct Memory(Vec<Region>);

impl Memory {
    fn locate(&self, addr: u64) -> Option<(usize, usize)> {
        self.0
            .iter()
            .position(|r| addr >= r.start && addr < r.end())
            .map(|idx| (idx, (addr - self.0[idx].start) as usize))
    }

    fn read(&self, addr: u64, size: usize) -> Option<Vec<u8>> {
        (0..size as u64)
            .map(|i| {
                let (region, offset) = self.locate(addr + i)?;
                Some(self.0[region].data[offset])
            })
            .collect()
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Option<()> {
        for (i, b) in data.iter().enumerate() {
            let (region, offset) = self.locate(addr + i as u64)?;
            self.0[region].data[offset] = *b;
        }
        Some(())
    }

    fn read_u64(&self, addr: u64) -> Option<u64> {
        let bytes = self.read(addr, 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }
}

/// Memory image of a test program, entry point is [`CODE`].
#[derive(Clone, Debug)]
pub struct Program {
    memory: Memory,
    entry: u64,
    exec: Option<Box<Program>>,
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl Program {
    pub fn new() -> Self {
        let region = |start: u64, size: usize, write: bool, execute: bool| Region {
            start,
            data: vec![0; size],
            write,
            execute,
        };
        Self {
            memory: Memory(vec![
                region(CODE, PAGE, false, true),
                region(RODATA, PAGE, false, false),
                region(DATA, PAGE, true, false),
                region(STACK, (STACK_TOP - STACK) as usize, true, false),
            ]),
            entry: CODE,
            exec: None,
        }
    }

    pub fn with(mut self, asm: Asm) -> Self {
        self.memory
            .write(asm.start, &asm.bytes)
            .expect("code out of program image");
        self
    }

    pub fn bytes(mut self, addr: u64, data: &[u8]) -> Self {
        self.memory
            .write(addr, data)
            .expect("data out of program image");
        self
    }

    pub fn word(self, addr: u64, value: u64) -> Self {
        self.bytes(addr, &value.to_le_bytes())
    }

    /// Image loaded by an exec syscall.
    pub fn then_exec(mut self, next: Program) -> Self {
        self.exec = Some(Box::new(next));
        self
    }

    fn initial_registers(&self) -> Vec<u64> {
        let mut regs = vec![0; Register::COUNT];
        regs[Register::Rip.index()] = self.entry;
        regs[Register::Rsp.index()] = STACK_TOP - 0x100;
        regs[Register::Eflags.index()] = 0x202;
        regs[Register::Cs.index()] = 0x33;
        regs[Register::Ss.index()] = 0x2B;
        regs[Register::OrigRax.index()] = u64::MAX;
        regs
    }
}

// ---------------------------------- interpreter -------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ThreadState {
    Stopped,
    Running,
    Exited,
    Detached,
}

#[derive(Clone, Debug)]
struct MockThread {
    pid: Pid,
    regs: Vec<u64>,
    state: ThreadState,
    slots: Vec<Option<(u64, HardwareKind)>>,
    /// Exit code reported at the next resume (after an exit event).
    exit_code: Option<i32>,
}

impl MockThread {
    fn new(pid: Pid, regs: Vec<u64>, slots: usize) -> Self {
        Self {
            pid,
            regs,
            state: ThreadState::Stopped,
            slots: vec![None; slots],
            exit_code: None,
        }
    }

    fn get(&self, reg: Register) -> u64 {
        self.regs[reg.index()]
    }

    fn set(&mut self, reg: Register, value: u64) {
        self.regs[reg.index()] = value;
    }

    fn push(&mut self, memory: &mut Memory, value: u64) -> Option<()> {
        let sp = self.get(Register::Rsp) - 8;
        memory.write(sp, &value.to_le_bytes())?;
        self.set(Register::Rsp, sp);
        Some(())
    }

    fn pop(&mut self, memory: &Memory) -> Option<u64> {
        let sp = self.get(Register::Rsp);
        let value = memory.read_u64(sp)?;
        self.set(Register::Rsp, sp + 8);
        Some(value)
    }

    fn data_watch(&self, addr: u64, len: u64, write: bool) -> Option<usize> {
        self.slots.iter().position(|slot| match slot {
            Some((at, HardwareKind::Write)) if write => *at < addr + len && addr < *at + 8,
            Some((at, HardwareKind::Read)) => *at < addr + len && addr < *at + 8,
            _ => false,
        })
    }
}

enum Outcome {
    Next,
    Spin,
    Stop(ChannelEvent),
    Syscall,
}

fn fault() -> Outcome {
    Outcome::Stop(ChannelEvent::Stopped(Signal::SIGSEGV))
}

/// Execute one instruction at `rip` of a thread.
fn execute_one(thread: &mut MockThread, memory: &mut Memory) -> Outcome {
    let rip = thread.get(Register::Rip);
    let eflags = thread.get(Register::Eflags);

    if eflags & EFLAGS_RF == 0 {
        let hit = thread
            .slots
            .iter()
            .position(|s| *s == Some((rip, HardwareKind::Execute)));
        if let Some(slot) = hit {
            thread.set(Register::Eflags, eflags | EFLAGS_RF);
            return Outcome::Stop(ChannelEvent::HardwareBreakpoint { slot });
        }
    }
    thread.set(Register::Eflags, eflags & !EFLAGS_RF);

    let Some(code) = memory.read(rip, 1) else {
        return fault();
    };
    let imm32 = |memory: &Memory| -> Option<u32> {
        let b = memory.read(rip + 1, 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    };
    let rel8 = |memory: &Memory| -> Option<i8> { Some(memory.read(rip + 1, 1)?[0] as i8) };
    let second = memory.read(rip + 1, 1).map(|b| b[0]);

    let mut next = rip;
    match code[0] {
        0x90 => next = rip + 1,
        0xCC => {
            thread.set(Register::Rip, rip + 1);
            return Outcome::Stop(ChannelEvent::Breakpoint { pc: rip + 1 });
        }
        0xC3 => match thread.pop(memory) {
            Some(ret) => next = ret,
            None => return fault(),
        },
        0xE8 | 0xE9 => {
            let Some(rel) = imm32(memory) else {
                return fault();
            };
            let ret = rip + 5;
            if code[0] == 0xE8 && thread.push(memory, ret).is_none() {
                return fault();
            }
            next = ret.wrapping_add(rel as i32 as i64 as u64);
        }
        0xEB => {
            let Some(rel) = rel8(memory) else {
                return fault();
            };
            if rel == -2 {
                return Outcome::Spin;
            }
            next = (rip + 2).wrapping_add(rel as i64 as u64);
        }
        0xE2 => {
            let Some(rel) = rel8(memory) else {
                return fault();
            };
            let rcx = thread.get(Register::Rcx).wrapping_sub(1);
            thread.set(Register::Rcx, rcx);
            next = if rcx != 0 {
                (rip + 2).wrapping_add(rel as i64 as u64)
            } else {
                rip + 2
            };
        }
        op @ 0xB8..=0xBF => {
            let Some(imm) = imm32(memory) else {
                return fault();
            };
            thread.set(Gpr::from_code(op - 0xB8), imm as u64);
            next = rip + 5;
        }
        0x55 => {
            let rbp = thread.get(Register::Rbp);
            if thread.push(memory, rbp).is_none() {
                return fault();
            }
            next = rip + 1;
        }
        0x5D | 0x58 => {
            let Some(value) = thread.pop(memory) else {
                return fault();
            };
            let reg = if code[0] == 0x5D {
                Register::Rbp
            } else {
                Register::Rax
            };
            thread.set(reg, value);
            next = rip + 1;
        }
        0x48 if memory.read(rip + 1, 2) == Some(vec![0x89, 0xE5]) => {
            let rsp = thread.get(Register::Rsp);
            thread.set(Register::Rbp, rsp);
            next = rip + 3;
        }
        0x89 if second == Some(0x07) => {
            let addr = thread.get(Register::Rdi);
            let value = thread.get(Register::Rax) as u32;
            if memory.write(addr, &value.to_le_bytes()).is_none() {
                return fault();
            }
            thread.set(Register::Rip, rip + 2);
            if let Some(slot) = thread.data_watch(addr, 4, true) {
                return Outcome::Stop(ChannelEvent::HardwareBreakpoint { slot });
            }
            return Outcome::Next;
        }
        0x8B if second == Some(0x07) => {
            let addr = thread.get(Register::Rdi);
            let Some(bytes) = memory.read(addr, 4) else {
                return fault();
            };
            let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            thread.set(Register::Rax, value as u64);
            thread.set(Register::Rip, rip + 2);
            if let Some(slot) = thread.data_watch(addr, 4, false) {
                return Outcome::Stop(ChannelEvent::HardwareBreakpoint { slot });
            }
            return Outcome::Next;
        }
        0xFF if second == Some(0xD0) => {
            if thread.push(memory, rip + 2).is_none() {
                return fault();
            }
            next = thread.get(Register::Rax);
        }
        0x0F if second == Some(0x05) => {
            thread.set(Register::Rip, rip + 2);
            return Outcome::Syscall;
        }
        _ => return Outcome::Stop(ChannelEvent::Stopped(Signal::SIGILL)),
    }
    thread.set(Register::Rip, next);
    Outcome::Next
}

/// Raw status a real kernel reports for a channel event.
fn raw_status(tid: Pid, event: ChannelEvent) -> RawStatus {
    match event {
        ChannelEvent::Exited(code) => WaitStatus::Exited(tid, code),
        ChannelEvent::Signaled(signal) => WaitStatus::Signaled(tid, signal, false),
        ChannelEvent::Stopped(signal) => WaitStatus::Stopped(tid, signal),
        ChannelEvent::Interrupted => {
            WaitStatus::PtraceEvent(tid, Signal::SIGTRAP, libc::PTRACE_EVENT_STOP)
        }
        ChannelEvent::Breakpoint { .. }
        | ChannelEvent::HardwareBreakpoint { .. }
        | ChannelEvent::SingleStep => WaitStatus::Stopped(tid, Signal::SIGTRAP),
        ChannelEvent::Clone(_) => {
            WaitStatus::PtraceEvent(tid, Signal::SIGTRAP, libc::PTRACE_EVENT_CLONE)
        }
        ChannelEvent::Fork(_) => {
            WaitStatus::PtraceEvent(tid, Signal::SIGTRAP, libc::PTRACE_EVENT_FORK)
        }
        ChannelEvent::Exec => WaitStatus::PtraceEvent(tid, Signal::SIGTRAP, libc::PTRACE_EVENT_EXEC),
        ChannelEvent::CalledExit => {
            WaitStatus::PtraceEvent(tid, Signal::SIGTRAP, libc::PTRACE_EVENT_EXIT)
        }
    }
}

struct MockProcess {
    memory: Memory,
    exec: Option<Box<Program>>,
}

struct World {
    programs: HashMap<String, Program>,
    processes: HashMap<Pid, MockProcess>,
    threads: BTreeMap<Pid, MockThread>,
    queue: VecDeque<RawStatus>,
    undispatched: HashMap<Pid, VecDeque<(RawStatus, ChannelEvent)>>,
    next_pid: i32,
    hardware_slots: usize,
    signals: Vec<(Pid, Signal)>,
    detached: Vec<Pid>,
    /// Threads with debug registers that can't be programmed.
    locked_slots: Vec<Pid>,
    /// Number of resume requests (continue or step).
    resumes: usize,
    closed: bool,
}

impl World {
    fn new_pid(&mut self) -> Pid {
        self.next_pid += 1;
        Pid::from_raw(self.next_pid)
    }

    fn report(&mut self, tid: Pid, event: ChannelEvent) {
        let status = raw_status(tid, event);
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.state = match event {
                ChannelEvent::Exited(_) | ChannelEvent::Signaled(_) => ThreadState::Exited,
                _ => ThreadState::Stopped,
            };
        }
        self.undispatched
            .entry(tid)
            .or_default()
            .push_back((status, event));
        self.queue.push_back(status);
    }

    fn thread(&mut self, tid: Pid) -> Result<&mut MockThread, ChannelError> {
        match self.threads.get_mut(&tid) {
            Some(t) if matches!(t.state, ThreadState::Stopped | ThreadState::Running) => Ok(t),
            _ => Err(ChannelError::NoSuchThread(tid)),
        }
    }

    fn memory(&mut self, tid: Pid) -> Result<&mut Memory, ChannelError> {
        let pid = self.thread(tid)?.pid;
        self.processes
            .get_mut(&pid)
            .map(|p| &mut p.memory)
            .ok_or(ChannelError::NoSuchThread(tid))
    }

    fn start_process(&mut self, program: &Program) -> Pid {
        let pid = self.new_pid();
        self.processes.insert(
            pid,
            MockProcess {
                memory: program.memory.clone(),
                exec: program.exec.clone(),
            },
        );
        let thread = MockThread::new(pid, program.initial_registers(), self.hardware_slots);
        self.threads.insert(pid, thread);
        pid
    }

    fn resume(&mut self, tid: Pid, step: bool, signal: Option<Signal>) -> Result<(), ChannelError> {
        self.resumes += 1;
        let thread = self.thread(tid)?;
        if thread.state != ThreadState::Stopped {
            return Err(ChannelError::NotStopped);
        }
        if let Some(code) = thread.exit_code.take() {
            self.report(tid, ChannelEvent::Exited(code));
            return Ok(());
        }
        thread.state = ThreadState::Running;
        if let Some(signal) = signal {
            self.signals.push((tid, signal));
        }

        for _ in 0..BUDGET {
            let pid = self.thread(tid)?.pid;
            let (Some(thread), Some(process)) =
                (self.threads.get_mut(&tid), self.processes.get_mut(&pid))
            else {
                return Err(ChannelError::NoSuchThread(tid));
            };
            let event = match execute_one(thread, &mut process.memory) {
                Outcome::Next if step => Some(ChannelEvent::SingleStep),
                Outcome::Next => None,
                Outcome::Spin if step => Some(ChannelEvent::SingleStep),
                Outcome::Spin => return Ok(()),
                Outcome::Stop(event) => Some(event),
                Outcome::Syscall => match self.syscall(tid) {
                    Some(event) => Some(event),
                    None if step => Some(ChannelEvent::SingleStep),
                    None => None,
                },
            };
            if let Some(event) = event {
                self.report(tid, event);
                return Ok(());
            }
        }
        Ok(())
    }

    fn syscall(&mut self, tid: Pid) -> Option<ChannelEvent> {
        let thread = self.threads.get(&tid)?.clone();
        let nr = thread.get(Register::Rax);
        let arg = thread.get(Register::Rdi);
        match nr {
            SYS_EXIT => {
                self.threads.get_mut(&tid)?.exit_code = Some(arg as i32);
                Some(ChannelEvent::CalledExit)
            }
            SYS_KILL => {
                let signal = Signal::try_from(arg as i32).unwrap_or(Signal::SIGTERM);
                Some(ChannelEvent::Stopped(signal))
            }
            SYS_CLONE => {
                let child = self.new_pid();
                let mut regs = thread.regs.clone();
                regs[Register::Rax.index()] = 0;
                let new = MockThread::new(thread.pid, regs, self.hardware_slots);
                self.threads.insert(child, new);
                self.threads.get_mut(&tid)?.set(Register::Rax, child.as_raw() as u64);
                self.report(child, ChannelEvent::Interrupted);
                Some(ChannelEvent::Clone(child))
            }
            SYS_FORK => {
                let child = self.new_pid();
                let parent = self.processes.get(&thread.pid)?;
                let process = MockProcess {
                    memory: parent.memory.clone(),
                    exec: parent.exec.clone(),
                };
                self.processes.insert(child, process);
                let mut regs = thread.regs.clone();
                regs[Register::Rax.index()] = 0;
                let new = MockThread::new(child, regs, self.hardware_slots);
                self.threads.insert(child, new);
                self.threads.get_mut(&tid)?.set(Register::Rax, child.as_raw() as u64);
                self.report(child, ChannelEvent::Interrupted);
                Some(ChannelEvent::Fork(child))
            }
            SYS_EXECVE => {
                let pid = thread.pid;
                let Some(next) = self.processes.get_mut(&pid)?.exec.take() else {
                    self.threads.get_mut(&tid)?.set(Register::Rax, (-2i64) as u64);
                    return None;
                };
                let others: Vec<Pid> = self
                    .threads
                    .iter()
                    .filter(|(t, th)| **t != tid && th.pid == pid)
                    .map(|(t, _)| *t)
                    .collect();
                for other in others {
                    self.threads.remove(&other);
                    self.undispatched.remove(&other);
                }
                let process = self.processes.get_mut(&pid)?;
                process.memory = next.memory.clone();
                process.exec = next.exec.clone();
                let slots = self.hardware_slots;
                let thread = self.threads.get_mut(&tid)?;
                thread.regs = next.initial_registers();
                thread.slots = vec![None; slots];
                Some(ChannelEvent::Exec)
            }
            _ => {
                self.threads.get_mut(&tid)?.set(Register::Rax, (-38i64) as u64);
                None
            }
        }
    }
}

/// In-memory [`ControlChannel`] over interpreted test programs.
pub struct MockChannel {
    world: Mutex<World>,
    changed: Condvar,
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChannel {
    pub fn new() -> Self {
        Self::with_hardware_slots(4)
    }

    pub fn with_hardware_slots(slots: usize) -> Self {
        Self {
            world: Mutex::new(World {
                programs: HashMap::new(),
                processes: HashMap::new(),
                threads: BTreeMap::new(),
                queue: VecDeque::new(),
                undispatched: HashMap::new(),
                next_pid: 1000,
                hardware_slots: slots,
                signals: vec![],
                detached: vec![],
                locked_slots: vec![],
                resumes: 0,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap()
    }

    /// Make a program available for spawn by name.
    pub fn with_program(self, name: &str, program: Program) -> Self {
        self.world().programs.insert(name.to_string(), program);
        self
    }

    /// Start an untraced process, its thread is running until attached.
    pub fn launch(&self, program: &Program) -> Pid {
        let mut world = self.world();
        let pid = world.start_process(program);
        if let Some(thread) = world.threads.get_mut(&pid) {
            thread.state = ThreadState::Running;
        }
        pid
    }

    /// Raw process memory, software traps included.
    pub fn peek(&self, pid: Pid, addr: u64, size: usize) -> Vec<u8> {
        self.world().processes[&pid]
            .memory
            .read(addr, size)
            .expect("peek out of process image")
    }

    pub fn register(&self, tid: Pid, reg: Register) -> u64 {
        self.world().threads[&tid].get(reg)
    }

    /// Signals injected by resume calls.
    pub fn delivered_signals(&self) -> Vec<(Pid, Signal)> {
        self.world().signals.clone()
    }

    pub fn is_detached(&self, tid: Pid) -> bool {
        self.world().detached.contains(&tid)
    }

    pub fn resume_count(&self) -> usize {
        self.world().resumes
    }

    /// Fail every debug register write of a thread.
    pub fn lock_debug_registers(&self, tid: Pid) {
        self.world().locked_slots.push(tid);
    }

    pub fn hw_slots(&self, tid: Pid) -> Vec<(u64, HardwareKind)> {
        self.world().threads[&tid]
            .slots
            .iter()
            .flatten()
            .copied()
            .collect()
    }

    pub fn threads_of(&self, pid: Pid) -> Vec<Pid> {
        self.world()
            .threads
            .iter()
            .filter(|(_, t)| t.pid == pid && t.state != ThreadState::Exited)
            .map(|(tid, _)| *tid)
            .collect()
    }

    fn notify<T>(&self, result: T) -> T {
        self.changed.notify_all();
        result
    }
}

impl ControlChannel for MockChannel {
    fn target_info(&self) -> Result<TargetInfo, ChannelError> {
        Ok(TargetInfo {
            int_size: 4,
            long_size: 8,
            address_size: 8,
            endianness: Endianness::Little,
            hardware_slots: self.world().hardware_slots,
        })
    }

    fn spawn(&self, start: &ProcessStart) -> Result<SpawnedProcess, ChannelError> {
        let mut world = self.world();
        let program = world
            .programs
            .get(&start.program)
            .cloned()
            .ok_or_else(|| ChannelError::CannotStartTarget(start.program.clone()))?;
        let pid = world.start_process(&program);
        Ok(SpawnedProcess {
            pid,
            stdout: None,
            stderr: None,
        })
    }

    fn attach(&self, pid: Pid) -> Result<Vec<Pid>, ChannelError> {
        let mut world = self.world();
        if !world.processes.contains_key(&pid) {
            return Err(ChannelError::NoSuchThread(pid));
        }
        let tids: Vec<Pid> = world
            .threads
            .iter_mut()
            .filter(|(_, t)| t.pid == pid && t.state == ThreadState::Running)
            .map(|(tid, t)| {
                t.state = ThreadState::Stopped;
                *tid
            })
            .collect();
        Ok(tids)
    }

    fn initialize_thread(&self, tid: Pid, _wait: bool) -> Result<(), ChannelError> {
        let mut world = self.world();
        world.thread(tid)?;
        if let Some(statuses) = world.undispatched.get_mut(&tid) {
            if let Some(pos) = statuses
                .iter()
                .position(|(_, e)| *e == ChannelEvent::Interrupted)
            {
                statuses.remove(pos);
            }
        }
        Ok(())
    }

    fn detach(&self, tid: Pid) -> Result<(), ChannelError> {
        let mut world = self.world();
        let slots = world.hardware_slots;
        let thread = world.thread(tid)?;
        if thread.state != ThreadState::Stopped {
            return Err(ChannelError::NoSuchThread(tid));
        }
        thread.state = ThreadState::Detached;
        thread.slots = vec![None; slots];
        world.undispatched.remove(&tid);
        world.detached.push(tid);
        Ok(())
    }

    fn kill(&self, tid: Pid) -> Result<(), ChannelError> {
        let mut world = self.world();
        let pid = world.thread(tid)?.pid;
        let victims: Vec<Pid> = world
            .threads
            .iter()
            .filter(|(_, t)| {
                t.pid == pid && matches!(t.state, ThreadState::Stopped | ThreadState::Running)
            })
            .map(|(tid, _)| *tid)
            .collect();
        for victim in victims {
            world.undispatched.remove(&victim);
            world.report(victim, ChannelEvent::Signaled(Signal::SIGKILL));
        }
        self.notify(Ok(()))
    }

    fn step(&self, tid: Pid, signal: Option<Signal>) -> Result<(), ChannelError> {
        let result = self.world().resume(tid, true, signal);
        self.notify(result)
    }

    fn cont(&self, tid: Pid, signal: Option<Signal>) -> Result<(), ChannelError> {
        let result = self.world().resume(tid, false, signal);
        self.notify(result)
    }

    fn stop(&self, tid: Pid) -> Result<(), ChannelError> {
        let mut world = self.world();
        if world.thread(tid)?.state != ThreadState::Running {
            return Err(ChannelError::AlreadyStopped);
        }
        world.report(tid, ChannelEvent::Interrupted);
        self.notify(Ok(()))
    }

    fn stop_and_wait(&self, tid: Pid) -> Result<StopOutcome, ChannelError> {
        let mut world = self.world();
        if let Some((status, _)) = world.undispatched.get(&tid).and_then(|s| s.front()) {
            return Ok(StopOutcome::Event(*status));
        }
        let thread = world.thread(tid)?;
        if thread.state != ThreadState::Running {
            return Ok(StopOutcome::AlreadyStopped);
        }
        thread.state = ThreadState::Stopped;
        Ok(StopOutcome::Interrupted)
    }

    fn wait(&self) -> Result<RawStatus, ChannelError> {
        let mut world = self.world();
        loop {
            if let Some(status) = world.queue.pop_front() {
                return Ok(status);
            }
            if world.closed {
                return Err(ChannelError::Closed);
            }
            world = self.changed.wait(world).unwrap();
        }
    }

    fn dispatch_event(&self, tid: Pid, status: RawStatus) -> Result<ChannelEvent, ChannelError> {
        let mut world = self.world();
        let statuses = world
            .undispatched
            .get_mut(&tid)
            .ok_or(ChannelError::Dispatched)?;
        let pos = statuses
            .iter()
            .position(|(s, _)| *s == status)
            .ok_or(ChannelError::Dispatched)?;
        let (_, event) = statuses.remove(pos).ok_or(ChannelError::Dispatched)?;
        Ok(event)
    }

    fn read_memory(&self, tid: Pid, addr: u64, size: usize) -> Result<Vec<u8>, ChannelError> {
        self.world()
            .memory(tid)?
            .read(addr, size)
            .ok_or(ChannelError::MemoryAccess(addr))
    }

    fn write_memory(&self, tid: Pid, addr: u64, data: &[u8]) -> Result<(), ChannelError> {
        self.world()
            .memory(tid)?
            .write(addr, data)
            .ok_or(ChannelError::MemoryAccess(addr))
    }

    fn get_registers(&self, tid: Pid) -> Result<Vec<u64>, ChannelError> {
        let mut world = self.world();
        let thread = world.thread(tid)?;
        if thread.state != ThreadState::Stopped {
            return Err(ChannelError::NotStopped);
        }
        Ok(thread.regs.clone())
    }

    fn set_registers(&self, tid: Pid, values: &[u64]) -> Result<(), ChannelError> {
        let mut world = self.world();
        let thread = world.thread(tid)?;
        if thread.state != ThreadState::Stopped {
            return Err(ChannelError::NotStopped);
        }
        for (idx, value) in values.iter().enumerate().take(Register::COUNT) {
            thread.regs[idx] = *value;
        }
        Ok(())
    }

    fn insert_hw_breakpoint(
        &self,
        tid: Pid,
        slot: usize,
        addr: u64,
        kind: HardwareKind,
    ) -> Result<(), ChannelError> {
        let mut world = self.world();
        if world.locked_slots.contains(&tid) {
            return Err(ChannelError::Syscall("ptrace pokeuser", nix::Error::EIO));
        }
        let thread = world.thread(tid)?;
        let entry = thread
            .slots
            .get_mut(slot)
            .ok_or(ChannelError::DebugRegisterOccupied)?;
        *entry = Some((addr, kind));
        Ok(())
    }

    fn remove_hw_breakpoint(&self, tid: Pid, slot: usize) -> Result<(), ChannelError> {
        let mut world = self.world();
        let thread = world.thread(tid)?;
        if let Some(entry) = thread.slots.get_mut(slot) {
            *entry = None;
        }
        Ok(())
    }

    fn memory_maps(&self, pid: Pid) -> Result<Vec<MemoryArea>, ChannelError> {
        let world = self.world();
        let process = world
            .processes
            .get(&pid)
            .ok_or(ChannelError::NoSuchThread(pid))?;
        Ok(process
            .memory
            .0
            .iter()
            .map(|r| MemoryArea {
                start: r.start,
                end: r.end(),
                read: true,
                write: r.write,
                execute: r.execute,
                name: None,
            })
            .collect())
    }

    fn close(&self) {
        self.world().closed = true;
        self.changed.notify_all();
    }
}

// ---------------------------------- debugger session --------------------------------------------

/// Debugger over a [`MockChannel`].
pub struct Session {
    pub debugger: Debugger,
    pub channel: Arc<MockChannel>,
}

impl Session {
    pub fn new(channel: MockChannel) -> Self {
        Self::with(channel, |builder| builder)
    }

    pub fn with(channel: MockChannel, f: impl FnOnce(DebuggerBuilder) -> DebuggerBuilder) -> Self {
        init_logger();
        let channel = Arc::new(channel);
        let builder = Debugger::builder().with_channel(channel.clone() as Arc<dyn ControlChannel>);
        let debugger = f(builder).build().unwrap();
        Self { debugger, channel }
    }

    /// Spawn a program, return its id and pid (also a main thread id).
    pub fn spawn(&self, program: &str) -> (ProcessId, Pid) {
        let id = self.debugger.spawn(ProcessStart::new(program)).unwrap();
        let pid = self.debugger.process_pid(id).unwrap();
        (id, pid)
    }

    pub fn addr(&self, id: ProcessId, addr: u64) -> TargetAddress {
        TargetAddress::new(self.debugger.domain(id).unwrap(), addr)
    }

    pub fn next_event(&self) -> DebuggerEvent {
        loop {
            let event = self
                .debugger
                .wait_event(EVENT_TIMEOUT)
                .expect("no debugger event");
            if !matches!(event, DebuggerEvent::TargetOutput { .. }) {
                return event;
            }
        }
    }

    /// Next stop of a thread, panics on any other event.
    pub fn expect_stop(&self) -> (Pid, u64, StopReason) {
        match self.next_event() {
            DebuggerEvent::Stopped {
                tid,
                address,
                reason,
                ..
            } => (tid, address.map(|a| a.as_u64()).unwrap_or_default(), reason),
            event => panic!("unexpected event: {event:?}"),
        }
    }

    /// Next breakpoint hit, return a thread and an address.
    pub fn expect_hit(&self) -> (Pid, TargetAddress) {
        match self.next_event() {
            DebuggerEvent::HitBreakpoint { tid, address, .. } => (tid, address),
            event => panic!("unexpected event: {event:?}"),
        }
    }

    pub fn expect_exit(&self, id: ProcessId) -> ExitStatus {
        match self.next_event() {
            DebuggerEvent::ProcessExited { process, status } if process == id => status,
            event => panic!("unexpected event: {event:?}"),
        }
    }

    /// No event is delivered for a while.
    pub fn expect_quiet(&self) {
        if let Some(event) = self.debugger.wait_event(QUIET_TIMEOUT) {
            panic!("unexpected event: {event:?}");
        }
    }

    pub fn pc(&self, tid: Pid) -> u64 {
        self.debugger
            .registers(tid)
            .unwrap()
            .value(Register::Rip)
            .unwrap()
    }
}
