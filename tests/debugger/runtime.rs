use crate::common::{Asm, Gpr, MockChannel, Program, Session, CODE, DATA};
use nix::sys::signal::Signal;
use rdb::debugger::runtime::info::{encode_table, RuntimeInfo, DEBUGGER_INFO_SYMBOL, SUPPORTED_VERSION};
use rdb::debugger::runtime::managed::ManagedThread;
use rdb::debugger::runtime::{ManagedRuntime, NotificationKind, RuntimeHandler, StaticSymbols};
use rdb::debugger::step::{CallPolicy, StepFrame};
use rdb::debugger::{DebuggerEvent, ExitStatus, ProcessId, StepCommand, StopReason};
use serial_test::serial;

const INIT_FN: u64 = CODE + 0x100;
const NOTIFY_FN: u64 = CODE + 0x200;
const STUB: u64 = CODE + 0x300;
const TRAMPOLINE: u64 = CODE + 0x380;
const COMPILE_FN: u64 = CODE + 0x400;
const COMPILED: u64 = CODE + 0x500;

const NOTIFY_PTR: u64 = DATA + 0x200;
const VERSION: u64 = DATA + 0x210;
const USING: u64 = DATA + 0x218;
const VTABLE_PTR: u64 = DATA + 0x220;
const HANDLER_PTR: u64 = DATA + 0x228;
const INTERRUPTION: u64 = DATA + 0x230;
const TRAMPOLINES: u64 = DATA + 0x240;
const THREAD_RECORD: u64 = DATA + 0x300;

fn runtime_info(compile_method: u64) -> RuntimeInfo {
    RuntimeInfo {
        trampoline_num: 1,
        trampoline_code: TRAMPOLINES,
        notification_address: NOTIFY_PTR,
        debugger_version: VERSION,
        compile_method,
        initialize: INIT_FN,
        thread_vtable_ptr: VTABLE_PTR,
        thread_vtable: 0xAAAA,
        event_handler_ptr: HANDLER_PTR,
        event_handler: 0xBBBB,
        using_mono_debugger: USING,
        interruption_request: INTERRUPTION,
        ..Default::default()
    }
}

/// Runtime image: info table, notification and initialize functions.
fn runtime_program(compile_method: u64) -> Program {
    Program::new()
        .bytes(DATA, &encode_table(&runtime_info(compile_method), SUPPORTED_VERSION))
        .word(NOTIFY_PTR, NOTIFY_FN)
        .word(VTABLE_PTR, 0x1111)
        .word(HANDLER_PTR, 0x2222)
        .word(TRAMPOLINES, TRAMPOLINE)
        .word(THREAD_RECORD + 8, 0x1234)
        .with(Asm::at(INIT_FN).nop().ret())
        .with(Asm::at(NOTIFY_FN).nop().ret())
}

/// Call a notification function the way a runtime does.
fn notify(asm: Asm, kind: NotificationKind, data1: u64, data2: u64) -> Asm {
    asm.mov(Gpr::Rdi, kind.code() as u32)
        .mov(Gpr::Rsi, data1 as u32)
        .mov(Gpr::Rdx, data2 as u32)
        .call(NOTIFY_FN)
}

fn session(program: Program) -> Session {
    let channel = MockChannel::new().with_program("managed", program);
    Session::with(channel, |b| {
        b.with_symbols(StaticSymbols::new().with_symbol(DEBUGGER_INFO_SYMBOL, DATA))
    })
}

fn read_u64(session: &Session, pid: nix::unistd::Pid, addr: u64) -> u64 {
    let bytes = session.channel.peek(pid, addr, 8);
    u64::from_le_bytes(bytes.try_into().unwrap())
}

fn is_active(session: &Session, id: ProcessId) -> bool {
    session
        .debugger
        .with_runtime(id, |runtime| {
            runtime
                .as_any()
                .downcast_ref::<ManagedRuntime>()
                .is_some_and(ManagedRuntime::is_active)
        })
        .unwrap()
}

#[test]
#[serial]
fn test_runtime_notifications() {
    let code = Asm::at(CODE).call(INIT_FN);
    let code = notify(code, NotificationKind::ThrowException, 0x11, 0x22);
    let code = notify(code, NotificationKind::ThreadCreated, 0, THREAD_RECORD);
    let code = code.raise(Signal::SIGPWR);
    let code = notify(code, NotificationKind::UnhandledException, 0x33, 0x44).exit(0);
    let session = session(runtime_program(0).with(code));
    let (id, pid) = session.spawn("managed");

    assert_eq!(session.debugger.runtime_name(id).unwrap(), "managed");
    // debugger presence announced, notifications armed later by `initialize`
    assert_eq!(read_u64(&session, pid, USING) & 0xFFFF_FFFF, 1);
    assert!(!is_active(&session, id));

    session.debugger.cont(id).unwrap();
    match session.next_event() {
        DebuggerEvent::Runtime {
            kind, data1, data2, ..
        } => {
            assert_eq!(kind, NotificationKind::ThrowException);
            assert_eq!((data1, data2), (0x11, 0x22));
        }
        event => panic!("unexpected event: {event:?}"),
    }
    match session.next_event() {
        DebuggerEvent::Runtime { kind, tid, .. } => {
            assert_eq!(kind, NotificationKind::ThreadCreated);
            assert_eq!(tid, pid);
        }
        event => panic!("unexpected event: {event:?}"),
    }

    // GC signal passes through
    let (tid, pc, reason) = session.expect_stop();
    assert_eq!(tid, pid);
    assert_eq!(pc, NOTIFY_FN);
    assert_eq!(
        reason,
        StopReason::Exception {
            data1: 0x33,
            data2: 0x44
        }
    );
    assert_eq!(
        session.channel.delivered_signals(),
        vec![(pid, Signal::SIGPWR)]
    );

    assert!(is_active(&session, id));
    assert_eq!(session.channel.peek(pid, VERSION, 4), 4u32.to_le_bytes());
    // initialize trap removed
    assert_eq!(session.channel.peek(pid, INIT_FN, 1), [0x90]);
    let thread = session
        .debugger
        .with_runtime(id, |runtime| {
            runtime
                .as_any()
                .downcast_ref::<ManagedRuntime>()
                .and_then(|r| r.managed_thread(pid))
        })
        .unwrap();
    assert_eq!(
        thread,
        Some(ManagedThread {
            lmf: Some(0x1234),
            data: THREAD_RECORD + 24,
        })
    );

    session.debugger.cont(id).unwrap();
    assert_eq!(session.expect_exit(id), ExitStatus::Code(0));
}

#[test]
#[serial]
fn test_process_without_runtime() {
    let program = Program::new().with(Asm::at(CODE).raise(Signal::SIGPWR).exit(0));
    let session = Session::new(MockChannel::new().with_program("native", program));
    let (id, _) = session.spawn("native");

    // SIGPWR is an ordinary signal without a runtime
    session.debugger.cont(id).unwrap();
    let (_, _, reason) = session.expect_stop();
    assert_eq!(reason, StopReason::Signal(Signal::SIGPWR));
    assert!(!is_active(&session, id));
}

#[test]
#[serial]
fn test_runtime_detach() {
    let program = runtime_program(0).with(Asm::at(CODE).call(INIT_FN).exit(0));
    let session = session(program);
    let (id, pid) = session.spawn("managed");
    assert_eq!(session.channel.peek(pid, INIT_FN, 1), [0xCC]);

    session.debugger.detach(id).unwrap();
    match session.next_event() {
        DebuggerEvent::ProcessExited { status, .. } => assert_eq!(status, ExitStatus::Detached),
        event => panic!("unexpected event: {event:?}"),
    }

    assert_eq!(read_u64(&session, pid, USING) & 0xFFFF_FFFF, 0);
    assert_eq!(read_u64(&session, pid, VTABLE_PTR), 0);
    assert_eq!(read_u64(&session, pid, HANDLER_PTR), 0);
    assert_eq!(session.channel.peek(pid, INIT_FN, 1), [0x90]);
    assert!(session.channel.is_detached(pid));
}

/// ```text
/// CODE:       call STUB
/// CODE + 5:   exit(0)
///
/// STUB:       call TRAMPOLINE; <method id>
/// TRAMPOLINE: jmp COMPILED
/// COMPILED:   pop rax; nop; ret
/// ```
fn trampoline_program(compiled: u32) -> Program {
    runtime_program(COMPILE_FN)
        .with(Asm::at(CODE).call(STUB).exit(0))
        .with(
            Asm::at(STUB)
                .call(TRAMPOLINE)
                .raw(&0xBEEFu64.to_le_bytes()),
        )
        .with(Asm::at(TRAMPOLINE).jmp(COMPILED))
        .with(Asm::at(COMPILE_FN).mov(Gpr::Rax, compiled).ret())
        .with(Asm::at(COMPILED).pop_rax().nop().ret())
}

fn step_into_stub(session: &Session, id: ProcessId, tid: nix::unistd::Pid) -> (u64, StopReason) {
    let frame = StepFrame::new(
        session.addr(id, CODE),
        session.addr(id, CODE + 5),
        CallPolicy::Follow,
    );
    session
        .debugger
        .step(tid, StepCommand::Range(frame))
        .unwrap();
    let (stopped, pc, reason) = session.expect_stop();
    assert_eq!(stopped, tid);
    (pc, reason)
}

#[test]
#[serial]
fn test_step_into_trampoline() {
    let session = session(trampoline_program(COMPILED as u32));
    let (id, tid) = session.spawn("managed");

    let (pc, reason) = step_into_stub(&session, id, tid);
    assert_eq!(reason, StopReason::StepComplete);
    assert_eq!(pc, COMPILED);
    assert_eq!(session.debugger.threads(id).unwrap()[0].invocations, 0);

    session.debugger.cont(id).unwrap();
    assert_eq!(session.expect_exit(id), ExitStatus::Code(0));
}

#[test]
#[serial]
fn test_step_over_not_compiled_method() {
    let session = session(trampoline_program(0));
    let (id, tid) = session.spawn("managed");

    let (pc, reason) = step_into_stub(&session, id, tid);
    assert_eq!(reason, StopReason::StepComplete);
    assert_eq!(pc, CODE + 5);

    session.debugger.cont(id).unwrap();
    assert_eq!(session.expect_exit(id), ExitStatus::Code(0));
}
