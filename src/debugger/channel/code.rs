/// Process breakpoint
pub const TRAP_BRKPT: i32 = 0x1;
/// Process trace trap
pub const TRAP_TRACE: i32 = 0x2;
/// Hardware breakpoint/watchpoint
pub const TRAP_HWBKPT: i32 = 0x4;
/// Sent by the kernel from somewhere
pub const SI_KERNEL: i32 = 0x80;

/// Debug status register, low bits are set for triggered slots.
pub const DR6_SLOT_MASK: u64 = 0xF;
/// Debug status register, single step bit.
pub const DR6_BS: u64 = 1 << 14;
/// Debug control register, `LE`/`GE` exact match bits are recommended by Intel manuals.
pub const DR7_EXACT: u64 = 1 << 8;
