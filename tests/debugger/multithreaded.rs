use crate::common::{Asm, MockChannel, Program, Session, CODE};
use nix::sys::signal::Signal;
use rdb::debugger::channel::HardwareKind;
use rdb::debugger::{
    Breakpoint, DebuggerConfig, DebuggerEvent, ExitStatus, ProcessId, RunState, StopReason,
};
use serial_test::serial;

/// Address right after a clone syscall, both threads continue here.
const AFTER_CLONE: u64 = CODE + 7;

fn clone_program(tail: Asm) -> Program {
    Program::new()
        .with(Asm::at(CODE).clone_thread())
        .with(tail)
}

#[test]
#[serial]
fn test_thread_created_and_exited() {
    let program = clone_program(Asm::at(AFTER_CLONE).exit(0));
    let session = Session::new(MockChannel::new().with_program("mt", program));
    let (id, pid) = session.spawn("mt");

    session.debugger.cont(id).unwrap();
    let child = match session.next_event() {
        DebuggerEvent::ThreadCreated { process, tid } => {
            assert_eq!(process, id);
            assert_ne!(tid, pid);
            tid
        }
        event => panic!("unexpected event: {event:?}"),
    };
    match session.next_event() {
        DebuggerEvent::ThreadExited { tid, .. } => assert_eq!(tid, child),
        event => panic!("unexpected event: {event:?}"),
    }
    assert_eq!(session.expect_exit(id), ExitStatus::Code(0));
}

#[test]
#[serial]
fn test_new_thread_inherits_hw_brkpt() {
    let program = clone_program(Asm::at(AFTER_CLONE).nop().exit(0));
    let session = Session::new(MockChannel::new().with_program("mt", program));
    let (id, _) = session.spawn("mt");

    session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_address(AFTER_CLONE), true)
        .unwrap();
    session.debugger.cont(id).unwrap();

    let child = match session.next_event() {
        DebuggerEvent::ThreadCreated { tid, .. } => tid,
        event => panic!("unexpected event: {event:?}"),
    };
    assert_eq!(
        session.channel.hw_slots(child),
        vec![(AFTER_CLONE, HardwareKind::Execute)]
    );

    // new thread is resumed first
    let (tid, address) = session.expect_hit();
    assert_eq!(tid, child);
    assert_eq!(address.as_u64(), AFTER_CLONE);
    assert_eq!(session.debugger.threads(id).unwrap().len(), 2);
}

#[test]
#[serial]
fn test_threads_not_adopted() {
    let program = clone_program(Asm::at(AFTER_CLONE).exit(0));
    let channel = MockChannel::new().with_program("mt", program);
    let session = Session::with(channel, |b| {
        b.with_config(DebuggerConfig {
            adopt_threads: false,
            ..Default::default()
        })
    });
    let (id, pid) = session.spawn("mt");

    session.debugger.cont(id).unwrap();
    assert_eq!(session.expect_exit(id), ExitStatus::Code(0));

    let child = pid.as_raw() + 1;
    assert!(session
        .channel
        .is_detached(nix::unistd::Pid::from_raw(child)));
}

#[test]
#[serial]
fn test_stop_and_continue_threads() {
    let program = clone_program(Asm::at(AFTER_CLONE).spin());
    let session = Session::new(MockChannel::new().with_program("mt", program));
    let (id, pid) = session.spawn("mt");

    session.debugger.cont(id).unwrap();
    let child = match session.next_event() {
        DebuggerEvent::ThreadCreated { tid, .. } => tid,
        event => panic!("unexpected event: {event:?}"),
    };

    session.debugger.stop(id).unwrap();
    let (_, _, reason) = session.expect_stop();
    assert_eq!(reason, StopReason::Interrupted);

    let threads = session.debugger.threads(id).unwrap();
    assert_eq!(threads.len(), 2);
    for thread in &threads {
        assert_eq!(thread.state, RunState::Stopped);
        assert_eq!(thread.pc.map(|pc| pc.as_u64()), Some(AFTER_CLONE));
        assert_eq!(thread.invocations, 0);
    }

    // single thread stop request
    session.debugger.cont_thread(child).unwrap();
    assert_eq!(session.debugger.run_state(child).unwrap(), RunState::Running);
    assert_eq!(session.debugger.run_state(pid).unwrap(), RunState::Stopped);

    assert!(session.debugger.stop_thread(child).unwrap());
    let (tid, pc, reason) = session.expect_stop();
    assert_eq!(tid, child);
    assert_eq!(pc, AFTER_CLONE);
    assert_eq!(reason, StopReason::Interrupted);
    assert!(!session.debugger.stop_thread(child).unwrap());

    session.debugger.kill(id).unwrap();
    match session.next_event() {
        DebuggerEvent::ThreadExited { .. } => {}
        event => panic!("unexpected event: {event:?}"),
    }
    assert_eq!(
        session.expect_exit(id),
        ExitStatus::Signal(Signal::SIGKILL)
    );
}

fn expect_thread_created(session: &Session) -> nix::unistd::Pid {
    match session.next_event() {
        DebuggerEvent::ThreadCreated { tid, .. } => tid,
        event => panic!("unexpected event: {event:?}"),
    }
}

fn kill_and_wait(session: &Session, id: ProcessId) {
    session.debugger.kill(id).unwrap();
    loop {
        match session.next_event() {
            DebuggerEvent::ThreadExited { .. } => {}
            DebuggerEvent::ProcessExited { process, status } if process == id => {
                assert_eq!(status, ExitStatus::Signal(Signal::SIGKILL));
                break;
            }
            event => panic!("unexpected event: {event:?}"),
        }
    }
}

#[test]
#[serial]
fn test_brkpt_hit_during_thread_creation() {
    // both threads run a second clone after the first one
    let program = clone_program(Asm::at(AFTER_CLONE).clone_thread().spin());
    let session = Session::new(MockChannel::new().with_program("mt", program));
    let (id, pid) = session.spawn("mt");

    session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_address(AFTER_CLONE), true)
        .unwrap();
    session.debugger.cont(id).unwrap();
    let first = expect_thread_created(&session);

    // new thread stops at a breakpoint while the leader is inside the next clone
    let (tid, address) = session.expect_hit();
    assert_eq!(tid, first);
    assert_eq!(address.as_u64(), AFTER_CLONE);
    let second = expect_thread_created(&session);
    assert_ne!(second, first);
    assert_ne!(second, pid);

    let threads = session.debugger.threads(id).unwrap();
    assert_eq!(threads.len(), 3);
    assert!(threads.iter().all(|t| t.state == RunState::Stopped));
    let pc_of = |tid| {
        threads
            .iter()
            .find(|t| t.tid == tid)
            .and_then(|t| t.pc)
            .map(|pc| pc.as_u64())
    };
    assert_eq!(pc_of(first), Some(AFTER_CLONE));
    assert_eq!(pc_of(pid), Some(AFTER_CLONE + 7));
    assert_eq!(pc_of(second), Some(AFTER_CLONE + 7));
    assert_eq!(
        session.channel.hw_slots(second),
        vec![(AFTER_CLONE, HardwareKind::Execute)]
    );

    kill_and_wait(&session, id);
}

#[test]
#[serial]
fn test_hw_slot_all_threads_or_none() {
    let program = clone_program(Asm::at(AFTER_CLONE).spin());
    let session = Session::new(MockChannel::new().with_program("mt", program));
    let (id, pid) = session.spawn("mt");

    session.debugger.cont(id).unwrap();
    let child = expect_thread_created(&session);
    session.debugger.stop(id).unwrap();
    let (_, _, reason) = session.expect_stop();
    assert_eq!(reason, StopReason::Interrupted);

    // leader is programmed first, then the child fails
    session.channel.lock_debug_registers(child);
    session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_address(CODE), true)
        .unwrap();
    assert!(session.channel.hw_slots(pid).is_empty());
    assert!(session.channel.hw_slots(child).is_empty());
    assert_eq!(session.channel.peek(pid, CODE, 1), vec![0xCC]);

    kill_and_wait(&session, id);
}
