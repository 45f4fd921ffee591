//! Architecture specific knowledge: register roles, trap instruction, call decoding and
//! call frame setup for invocations inside a debugee.

pub mod x86_64;

use crate::debugger::error::Error;
use crate::debugger::register::Registers;

pub use x86_64::X86_64;

/// Target of a call instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallTarget {
    /// Target known before instruction execution.
    Direct(u64),
    /// Target computed at runtime (register or memory operand).
    Indirect,
}

/// Decoded machine instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub len: usize,
    pub mnemonic: String,
    pub call: Option<CallTarget>,
    pub is_return: bool,
}

impl Instruction {
    /// Address of the next instruction (return address for calls).
    pub fn next_address(&self) -> u64 {
        self.address + self.len as u64
    }
}

/// Memory writes required to complete a call setup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSetup {
    pub stack_writes: Vec<(u64, Vec<u8>)>,
    /// Stack pointer value after the callee returns.
    pub return_sp: u64,
}

pub trait Architecture: Send + Sync {
    fn name(&self) -> &'static str;

    /// Number of registers in register file.
    fn register_count(&self) -> usize;

    fn pc_register(&self) -> usize;

    fn sp_register(&self) -> usize;

    fn frame_register(&self) -> usize;

    /// Registers holding a first and a second return value words.
    fn return_registers(&self) -> (usize, usize);

    /// Registers used for passing integer arguments, in order.
    fn argument_registers(&self) -> &'static [usize];

    /// Software trap instruction bytes.
    fn breakpoint_instruction(&self) -> &'static [u8];

    /// How far program counter advanced after software trap execution.
    fn breakpoint_pc_adjust(&self) -> u64 {
        self.breakpoint_instruction().len() as u64
    }

    fn max_instruction_len(&self) -> usize;

    /// Make a thread execute an instruction under a hardware execute trap once,
    /// without a trap.
    fn set_resume_flag(&self, _regs: &mut Registers) {}

    /// Decode a single instruction at `address`, `code` is a memory starting at `address`.
    fn decode(&self, address: u64, code: &[u8]) -> Result<Instruction, Error>;

    /// Location of a return address for a frame described by registers, if a standard frame
    /// layout is used.
    fn return_address_slot(&self, regs: &Registers) -> Result<u64, Error>;

    /// Prepare registers for a call of `method` with integer arguments, callee returns
    /// to `return_address`.
    fn setup_call(
        &self,
        regs: &mut Registers,
        method: u64,
        args: &[u64],
        return_address: u64,
    ) -> Result<CallSetup, Error>;
}
