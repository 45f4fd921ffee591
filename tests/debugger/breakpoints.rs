use crate::common::{Asm, Gpr, MockChannel, Program, Session, CODE};
use nix::unistd::Pid;
use rdb::debugger::breakpoint::BreakpointHit;
use rdb::debugger::register::Register;
use rdb::debugger::runtime::StaticSymbols;
use rdb::debugger::{Breakpoint, DebuggerConfig, Error, ExitStatus};
use serial_test::serial;

/// nop; nop; nop; nop; nop; nop; exit(7)
fn nops_program() -> Program {
    Program::new().with(
        Asm::at(CODE)
            .nop()
            .nop()
            .nop()
            .nop()
            .nop()
            .nop()
            .exit(7),
    )
}

fn software_only() -> DebuggerConfig {
    DebuggerConfig {
        prefer_hardware_breakpoints: false,
        ..Default::default()
    }
}

#[test]
#[serial]
fn test_brkpt_on_addr() {
    let channel = MockChannel::new().with_program("nops", nops_program());
    let session = Session::new(channel);
    let (id, pid) = session.spawn("nops");

    let bp = session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_address(CODE + 1), true)
        .unwrap();
    // hardware slot used by default
    assert_eq!(session.channel.peek(pid, CODE + 1, 1), vec![0x90]);
    assert_eq!(session.channel.hw_slots(pid).len(), 1);

    session.debugger.cont(id).unwrap();
    let (tid, address) = session.expect_hit();
    assert_eq!(tid, pid);
    assert_eq!(address, session.addr(id, CODE + 1));
    assert_eq!(session.pc(tid), CODE + 1);

    let info = session.debugger.breakpoints(id).unwrap();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].id, bp);
    assert_eq!(info[0].hits, 1);

    session.debugger.cont(id).unwrap();
    assert_eq!(session.expect_exit(id), ExitStatus::Code(7));
}

#[test]
#[serial]
fn test_software_brkpt_step_over() {
    let channel = MockChannel::new().with_program("nops", nops_program());
    let session = Session::with(channel, |b| b.with_config(software_only()));
    let (id, pid) = session.spawn("nops");

    session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_address(CODE + 1), true)
        .unwrap();
    assert_eq!(session.channel.peek(pid, CODE + 1, 1), vec![0xCC]);
    // trap instruction is invisible through debugger memory access
    let code = session
        .debugger
        .read_memory(pid, session.addr(id, CODE), 3)
        .unwrap();
    assert_eq!(code, vec![0x90, 0x90, 0x90]);

    session.debugger.cont(id).unwrap();
    let (tid, address) = session.expect_hit();
    assert_eq!(address.as_u64(), CODE + 1);
    // program counter rewound to a trap address
    assert_eq!(session.pc(tid), CODE + 1);

    session.debugger.cont(id).unwrap();
    assert_eq!(session.expect_exit(id), ExitStatus::Code(7));
}

#[test]
#[serial]
fn test_multiple_brkpt_on_addr() {
    let channel = MockChannel::new().with_program("nops", nops_program());
    let session = Session::with(channel, |b| b.with_config(software_only()));
    let (id, _) = session.spawn("nops");

    let bp1 = session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_address(CODE + 2), true)
        .unwrap();
    let bp2 = session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_address(CODE + 2), true)
        .unwrap();
    let bp3 = session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_address(CODE + 4), true)
        .unwrap();
    assert_eq!(session.debugger.physical_trap_count(id).unwrap(), 2);

    session.debugger.cont(id).unwrap();
    match session.next_event() {
        rdb::debugger::DebuggerEvent::HitBreakpoint {
            address,
            mut breakpoints,
            ..
        } => {
            assert_eq!(address.as_u64(), CODE + 2);
            breakpoints.sort();
            assert_eq!(breakpoints, vec![bp1, bp2]);
        }
        event => panic!("unexpected event: {event:?}"),
    }

    session.debugger.cont(id).unwrap();
    match session.next_event() {
        rdb::debugger::DebuggerEvent::HitBreakpoint { breakpoints, .. } => {
            assert_eq!(breakpoints, vec![bp3]);
        }
        event => panic!("unexpected event: {event:?}"),
    }

    session.debugger.cont(id).unwrap();
    assert_eq!(session.expect_exit(id), ExitStatus::Code(7));
}

#[test]
#[serial]
fn test_brkpt_enable_disable_remove() {
    let channel = MockChannel::new().with_program("nops", nops_program());
    let session = Session::with(channel, |b| b.with_config(software_only()));
    let (id, pid) = session.spawn("nops");

    let bp = session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_address(CODE + 1), false)
        .unwrap();
    assert_eq!(session.channel.peek(pid, CODE + 1, 1), vec![0x90]);
    assert_eq!(session.debugger.physical_trap_count(id).unwrap(), 0);
    let info = session.debugger.breakpoints(id).unwrap();
    assert!(!info[0].enabled);
    assert_eq!(info[0].address, Some(session.addr(id, CODE + 1)));

    session.debugger.set_breakpoint_enabled(id, bp, true).unwrap();
    assert_eq!(session.channel.peek(pid, CODE + 1, 1), vec![0xCC]);
    assert_eq!(session.debugger.physical_trap_count(id).unwrap(), 1);

    session.debugger.set_breakpoint_enabled(id, bp, false).unwrap();
    assert_eq!(session.channel.peek(pid, CODE + 1, 1), vec![0x90]);

    session.debugger.set_breakpoint_enabled(id, bp, true).unwrap();
    session.debugger.remove_breakpoint(id, bp).unwrap();
    assert_eq!(session.channel.peek(pid, CODE + 1, 1), vec![0x90]);
    assert_eq!(session.debugger.physical_trap_count(id).unwrap(), 0);
    assert!(session.debugger.breakpoints(id).unwrap().is_empty());

    assert!(matches!(
        session.debugger.remove_breakpoint(id, bp),
        Err(Error::BreakpointNotFound(_))
    ));

    session.debugger.cont(id).unwrap();
    assert_eq!(session.expect_exit(id), ExitStatus::Code(7));
}

#[test]
#[serial]
fn test_failed_write_under_brkpt() {
    let last = CODE + 0xFFF;
    let program = nops_program().with(Asm::at(last).nop());
    let channel = MockChannel::new().with_program("nops", program);
    let session = Session::with(channel, |b| b.with_config(software_only()));
    let (id, pid) = session.spawn("nops");
    let addr = session.addr(id, last);

    let bp = session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_address(last), true)
        .unwrap();
    // second byte lies past the end of a code page
    assert!(matches!(
        session.debugger.write_memory(pid, addr, &[0x11, 0x22]),
        Err(Error::MemoryAccess(_))
    ));
    assert_eq!(session.debugger.read_memory(pid, addr, 1).unwrap(), vec![0x90]);
    assert_eq!(session.channel.peek(pid, last, 1), vec![0xCC]);

    session.debugger.remove_breakpoint(id, bp).unwrap();
    assert_eq!(session.channel.peek(pid, last, 1), vec![0x90]);

    // successful write replaces bytes under a trap
    let bp = session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_address(last), true)
        .unwrap();
    session.debugger.write_memory(pid, addr, &[0xF4]).unwrap();
    assert_eq!(session.debugger.read_memory(pid, addr, 1).unwrap(), vec![0xF4]);
    assert_eq!(session.channel.peek(pid, last, 1), vec![0xCC]);
    session.debugger.remove_breakpoint(id, bp).unwrap();
    assert_eq!(session.channel.peek(pid, last, 1), vec![0xF4]);

    session.debugger.cont(id).unwrap();
    assert_eq!(session.expect_exit(id), ExitStatus::Code(7));
}

#[test]
#[serial]
fn test_software_fallback_when_slots_exhausted() {
    let channel = MockChannel::new().with_program("nops", nops_program());
    let session = Session::new(channel);
    let (id, pid) = session.spawn("nops");

    for offset in 1..=5 {
        session
            .debugger
            .insert_breakpoint(id, Breakpoint::at_address(CODE + offset), true)
            .unwrap();
    }
    assert_eq!(session.channel.hw_slots(pid).len(), 4);
    assert_eq!(session.channel.peek(pid, CODE + 1, 4), vec![0x90; 4]);
    assert_eq!(session.channel.peek(pid, CODE + 5, 1), vec![0xCC]);
    assert_eq!(session.debugger.physical_trap_count(id).unwrap(), 5);

    for offset in 1..=5 {
        session.debugger.cont(id).unwrap();
        let (_, address) = session.expect_hit();
        assert_eq!(address.as_u64(), CODE + offset);
    }
    session.debugger.cont(id).unwrap();
    assert_eq!(session.expect_exit(id), ExitStatus::Code(7));
}

#[test]
#[serial]
fn test_no_hardware_slots() {
    let program = nops_program();

    let channel = MockChannel::with_hardware_slots(0).with_program("nops", program.clone());
    let session = Session::with(channel, |b| {
        b.with_config(DebuggerConfig {
            allow_software_fallback: false,
            ..Default::default()
        })
    });
    let (id, _) = session.spawn("nops");
    let result = session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_address(CODE + 1), true);
    assert!(matches!(result, Err(Error::DebugRegisterOccupied)));
    drop(session);

    let channel = MockChannel::with_hardware_slots(0).with_program("nops", program);
    let session = Session::new(channel);
    let (id, pid) = session.spawn("nops");
    session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_address(CODE + 1), true)
        .unwrap();
    assert_eq!(session.channel.peek(pid, CODE + 1, 1), vec![0xCC]);
}

#[test]
#[serial]
fn test_brkpt_handler() {
    let program = Program::new().with(
        Asm::at(CODE)
            .mov(Gpr::Rcx, 3)
            // CODE + 5
            .nop()
            .loop_to(CODE + 5)
            .exit(0),
    );
    let channel = MockChannel::new().with_program("loop", program);
    let session = Session::new(channel);
    let (id, _) = session.spawn("loop");

    let bp = Breakpoint::at_address(CODE + 5)
        .with_handler(|hit: &BreakpointHit| -> anyhow::Result<bool> { Ok(hit.hits >= 2) });
    let bp = session.debugger.insert_breakpoint(id, bp, true).unwrap();

    session.debugger.cont(id).unwrap();
    let (tid, address) = session.expect_hit();
    assert_eq!(address.as_u64(), CODE + 5);
    let regs = session.debugger.registers(tid).unwrap();
    assert_eq!(regs.value(Register::Rcx).unwrap(), 2);

    let info = session.debugger.breakpoints(id).unwrap();
    assert_eq!(info[0].hits, 2);

    session.debugger.remove_breakpoint(id, bp).unwrap();
    session.debugger.cont(id).unwrap();
    assert_eq!(session.expect_exit(id), ExitStatus::Code(0));
}

#[test]
#[serial]
fn test_brkpt_handler_error_stops() {
    let channel = MockChannel::new().with_program("nops", nops_program());
    let session = Session::new(channel);
    let (id, _) = session.spawn("nops");

    let bp = Breakpoint::at_address(CODE + 3).with_handler(
        |_: &BreakpointHit| -> anyhow::Result<bool> { Err(anyhow::anyhow!("broken condition")) },
    );
    session.debugger.insert_breakpoint(id, bp, true).unwrap();

    session.debugger.cont(id).unwrap();
    let (_, address) = session.expect_hit();
    assert_eq!(address.as_u64(), CODE + 3);
}

#[test]
#[serial]
fn test_thread_bound_brkpt() {
    let channel = MockChannel::new().with_program("nops", nops_program());
    let session = Session::new(channel);
    let (id, _) = session.spawn("nops");

    let bp = Breakpoint::at_address(CODE + 1).for_thread(Pid::from_raw(1));
    session.debugger.insert_breakpoint(id, bp, true).unwrap();

    session.debugger.cont(id).unwrap();
    assert_eq!(session.expect_exit(id), ExitStatus::Code(7));
}

#[test]
#[serial]
fn test_symbol_brkpt() {
    let channel = MockChannel::new().with_program("nops", nops_program());
    let session = Session::with(channel, |b| {
        b.with_symbols(StaticSymbols::new().with_symbol("main", CODE + 2))
    });
    let (id, _) = session.spawn("nops");

    session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_symbol("main"), true)
        .unwrap();
    let pending = session
        .debugger
        .insert_breakpoint(id, Breakpoint::at_symbol("not_loaded_yet"), true)
        .unwrap();

    let info = session.debugger.breakpoints(id).unwrap();
    let main = info.iter().find(|i| i.id != pending).unwrap();
    assert_eq!(main.address, Some(session.addr(id, CODE + 2)));
    let not_loaded = info.iter().find(|i| i.id == pending).unwrap();
    assert_eq!(not_loaded.address, None);

    session.debugger.cont(id).unwrap();
    let (_, address) = session.expect_hit();
    assert_eq!(address.as_u64(), CODE + 2);

    session.debugger.cont(id).unwrap();
    assert_eq!(session.expect_exit(id), ExitStatus::Code(7));
}
