use crate::debugger::arch::{Architecture, CallSetup, CallTarget, Instruction};
use crate::debugger::error::Error;
use crate::debugger::register::{Register, Registers};
use capstone::prelude::*;
use std::cell::RefCell;
use strum::EnumCount;

thread_local! {
    static DISASM: RefCell<Option<Capstone>> = const { RefCell::new(None) };
}

/// Bytes below stack pointer that a leaf function may use without adjusting it.
const RED_ZONE: u64 = 128;

/// `RF` bit of `EFLAGS`, suppresses instruction breakpoints for one instruction.
const EFLAGS_RF: u64 = 1 << 16;

static ARGUMENT_REGISTERS: [usize; 6] = [
    Register::Rdi.index(),
    Register::Rsi.index(),
    Register::Rdx.index(),
    Register::Rcx.index(),
    Register::R8.index(),
    Register::R9.index(),
];

/// System V x86_64.
#[derive(Default, Debug, Clone, Copy)]
pub struct X86_64;

impl X86_64 {
    fn with_disasm<T>(f: impl FnOnce(&Capstone) -> Result<T, Error>) -> Result<T, Error> {
        DISASM.with(|cell| {
            let mut cs = cell.borrow_mut();
            if cs.is_none() {
                *cs = Some(
                    Capstone::new()
                        .x86()
                        .mode(arch::x86::ArchMode::Mode64)
                        .syntax(arch::x86::ArchSyntax::Intel)
                        .build()
                        .map_err(Error::DisAsmInit)?,
                );
            }
            let cs = cs.as_ref().ok_or(Error::NotImplemented("disassembler"))?;
            f(cs)
        })
    }

    fn parse_call_target(op_str: &str) -> CallTarget {
        op_str
            .strip_prefix("0x")
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .map(CallTarget::Direct)
            .unwrap_or(CallTarget::Indirect)
    }
}

impl Architecture for X86_64 {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn register_count(&self) -> usize {
        Register::COUNT
    }

    fn pc_register(&self) -> usize {
        Register::Rip.index()
    }

    fn sp_register(&self) -> usize {
        Register::Rsp.index()
    }

    fn frame_register(&self) -> usize {
        Register::Rbp.index()
    }

    fn return_registers(&self) -> (usize, usize) {
        (Register::Rax.index(), Register::Rdx.index())
    }

    fn argument_registers(&self) -> &'static [usize] {
        &ARGUMENT_REGISTERS
    }

    fn breakpoint_instruction(&self) -> &'static [u8] {
        &[0xCC]
    }

    fn max_instruction_len(&self) -> usize {
        15
    }

    fn set_resume_flag(&self, regs: &mut Registers) {
        if let Ok(flags) = regs.value(Register::Eflags) {
            regs.set(Register::Eflags, flags | EFLAGS_RF);
        }
    }

    fn decode(&self, address: u64, code: &[u8]) -> Result<Instruction, Error> {
        Self::with_disasm(|cs| {
            let insns = cs.disasm_count(code, address, 1).map_err(Error::DisAsm)?;
            let insn = insns
                .iter()
                .next()
                .ok_or(Error::InvalidInstruction(address))?;

            let mnemonic = insn.mnemonic().unwrap_or_default().to_string();
            let call = (mnemonic == "call")
                .then(|| Self::parse_call_target(insn.op_str().unwrap_or_default()));
            let is_return = matches!(mnemonic.as_str(), "ret" | "retf" | "iretq");

            Ok(Instruction {
                address,
                len: insn.bytes().len(),
                mnemonic,
                call,
                is_return,
            })
        })
    }

    fn return_address_slot(&self, regs: &Registers) -> Result<u64, Error> {
        Ok(regs.value(Register::Rbp)? + 8)
    }

    fn setup_call(
        &self,
        regs: &mut Registers,
        method: u64,
        args: &[u64],
        return_address: u64,
    ) -> Result<CallSetup, Error> {
        if args.len() > ARGUMENT_REGISTERS.len() {
            return Err(Error::NotImplemented("stack passed arguments"));
        }

        let sp = regs.value(Register::Rsp)?;
        // skip red zone, align to 16 bytes and push return address,
        // so the callee sees the stack as after a `call` instruction
        let aligned = (sp - RED_ZONE) & !0xF;
        let new_sp = aligned - 8;

        for (reg, value) in ARGUMENT_REGISTERS.iter().zip(args) {
            let register = Register::from_index(*reg).ok_or(Error::NoStack)?;
            regs.set(register, *value);
        }
        // number of vector registers for variadic callee
        regs.set(Register::Rax, 0);
        regs.set(Register::Rsp, new_sp);
        regs.set(Register::Rip, method);
        // prevent syscall restart by the kernel
        regs.set(Register::OrigRax, u64::MAX);

        Ok(CallSetup {
            stack_writes: vec![(new_sp, return_address.to_le_bytes().to_vec())],
            return_sp: new_sp + 8,
        })
    }
}
