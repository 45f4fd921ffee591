use crate::debugger::error::Error;
use nix::libc::user_regs_struct;
use smallvec::SmallVec;
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{Display, EnumCount as EnumCountMacro, EnumIter, EnumString};

/// x86_64 general purpose registers, discriminant is a register index in a register file.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display, EnumIter, EnumCountMacro,
)]
#[strum(serialize_all = "snake_case")]
#[repr(usize)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    Cs,
    OrigRax,
    FsBase,
    GsBase,
    Fs,
    Gs,
    Ss,
    Ds,
    Es,
}

impl Register {
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Option<Register> {
        Register::iter().nth(idx)
    }
}

/// Register file of a thread. Every entry is either valid or invalid (not read yet, or
/// not supported by a target).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registers(SmallVec<[Option<u64>; 32]>);

impl Registers {
    /// Register file where every register is invalid.
    pub fn empty() -> Self {
        Self(SmallVec::from_elem(None, Register::COUNT))
    }

    pub fn from_values(values: &[u64]) -> Self {
        let mut regs = Self::empty();
        for (idx, v) in values.iter().enumerate().take(Register::COUNT) {
            regs.0[idx] = Some(*v);
        }
        regs
    }

    pub fn get(&self, idx: usize) -> Option<u64> {
        self.0.get(idx).copied().flatten()
    }

    pub fn value(&self, register: Register) -> Result<u64, Error> {
        self.get(register.index())
            .ok_or(Error::RegisterNotValid(register))
    }

    pub fn set(&mut self, register: Register, value: u64) {
        self.0[register.index()] = Some(value);
    }

    pub fn invalidate(&mut self, register: Register) {
        self.0[register.index()] = None;
    }

    pub fn is_valid(&self, register: Register) -> bool {
        self.get(register.index()).is_some()
    }

    /// Flatten register file into a values array, invalid entries are taken from `old`.
    pub fn merge(&self, old: &Registers) -> Vec<u64> {
        self.0
            .iter()
            .zip(old.0.iter())
            .map(|(new, old)| new.or(*old).unwrap_or_default())
            .collect()
    }
}

/// Build register file values from a ptrace register struct.
pub fn values_from_user_regs(regs: &user_regs_struct) -> Vec<u64> {
    Register::iter()
        .map(|r| match r {
            Register::Rax => regs.rax,
            Register::Rbx => regs.rbx,
            Register::Rcx => regs.rcx,
            Register::Rdx => regs.rdx,
            Register::Rdi => regs.rdi,
            Register::Rsi => regs.rsi,
            Register::Rbp => regs.rbp,
            Register::Rsp => regs.rsp,
            Register::R8 => regs.r8,
            Register::R9 => regs.r9,
            Register::R10 => regs.r10,
            Register::R11 => regs.r11,
            Register::R12 => regs.r12,
            Register::R13 => regs.r13,
            Register::R14 => regs.r14,
            Register::R15 => regs.r15,
            Register::Rip => regs.rip,
            Register::Eflags => regs.eflags,
            Register::Cs => regs.cs,
            Register::OrigRax => regs.orig_rax,
            Register::FsBase => regs.fs_base,
            Register::GsBase => regs.gs_base,
            Register::Fs => regs.fs,
            Register::Gs => regs.gs,
            Register::Ss => regs.ss,
            Register::Ds => regs.ds,
            Register::Es => regs.es,
        })
        .collect()
}

/// Write register file values into ptrace register struct, missing values are left untouched.
pub fn update_user_regs(regs: &mut user_regs_struct, values: &[u64]) {
    for (idx, value) in values.iter().copied().enumerate() {
        let Some(register) = Register::from_index(idx) else {
            break;
        };
        let slot = match register {
            Register::Rax => &mut regs.rax,
            Register::Rbx => &mut regs.rbx,
            Register::Rcx => &mut regs.rcx,
            Register::Rdx => &mut regs.rdx,
            Register::Rdi => &mut regs.rdi,
            Register::Rsi => &mut regs.rsi,
            Register::Rbp => &mut regs.rbp,
            Register::Rsp => &mut regs.rsp,
            Register::R8 => &mut regs.r8,
            Register::R9 => &mut regs.r9,
            Register::R10 => &mut regs.r10,
            Register::R11 => &mut regs.r11,
            Register::R12 => &mut regs.r12,
            Register::R13 => &mut regs.r13,
            Register::R14 => &mut regs.r14,
            Register::R15 => &mut regs.r15,
            Register::Rip => &mut regs.rip,
            Register::Eflags => &mut regs.eflags,
            Register::Cs => &mut regs.cs,
            Register::OrigRax => &mut regs.orig_rax,
            Register::FsBase => &mut regs.fs_base,
            Register::GsBase => &mut regs.gs_base,
            Register::Fs => &mut regs.fs,
            Register::Gs => &mut regs.gs,
            Register::Ss => &mut regs.ss,
            Register::Ds => &mut regs.ds,
            Register::Es => &mut regs.es,
        };
        *slot = value;
    }
}
