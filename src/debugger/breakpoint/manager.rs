//! Physical traps of a single process.
//!
//! Many logical owners (user breakpoints, temporary step traps, runtime notification trap, etc.)
//! may want a stop at the same address. Manager keeps exactly one physical trap per distinct
//! address with at least one enabled owner entry, and arbitrates hardware slots.

use crate::debugger::address::{AddressDomain, TargetAddress};
use crate::debugger::breakpoint::BreakpointId;
use crate::debugger::channel::HardwareKind;
use crate::debugger::error::Error;
use crate::weak_error;
use log::{debug, error, warn};
use nix::unistd::Pid;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};

/// Handle of a single owner entry in [`BreakpointManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrapId(u32);

impl TrapId {
    pub fn from_raw(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for TrapId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "trap#{}", self.0)
    }
}

/// Who wants a stop at the trap address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrapOwner {
    /// User visible breakpoint.
    Breakpoint(BreakpointId),
    /// Temporary trap of a stepping engine of a thread.
    Step(Pid),
    /// Return address of a nested invocation running on a thread.
    CallReturn(Pid),
    /// Runtime notification function.
    Notification,
    /// Other runtime support traps.
    Runtime,
}

impl TrapOwner {
    /// Owner bound to a thread that may not exist in a forked child.
    fn is_thread_bound(&self) -> bool {
        matches!(self, TrapOwner::Step(_) | TrapOwner::CallReturn(_))
    }
}

/// How a physical trap should be installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapPolicy {
    /// Use a hardware slot if one is free, fall back to a software trap if `fallback` is set,
    /// fail with [`Error::DebugRegisterOccupied`] otherwise.
    PreferHardware { fallback: bool },
    /// Always patch memory.
    Software,
    /// Hardware watchpoint, never falls back.
    Watch(HardwareKind),
}

impl TrapPolicy {
    fn class(&self) -> HardwareKind {
        match self {
            TrapPolicy::Watch(kind) => *kind,
            _ => HardwareKind::Execute,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhysicalKind {
    Hardware {
        slot: usize,
        kind: HardwareKind,
    },
    Software {
        original: SmallVec<[u8; 4]>,
        /// Original bytes temporarily written back (step over the trap in progress).
        lifted: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalTrap {
    pub address: TargetAddress,
    pub kind: PhysicalKind,
}

impl PhysicalTrap {
    pub fn is_software(&self) -> bool {
        matches!(self.kind, PhysicalKind::Software { .. })
    }
}

#[derive(Clone, Debug)]
struct TrapEntry {
    address: TargetAddress,
    owner: TrapOwner,
    policy: TrapPolicy,
    enabled: bool,
}

impl TrapEntry {
    fn key(&self) -> Key {
        (self.address.as_u64(), self.policy.class())
    }
}

/// Memory and debug registers of a traced process.
pub trait TrapIo {
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>, Error>;

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), Error>;

    /// Program hardware slot in every thread of the process.
    fn set_hw_slot(&self, slot: usize, addr: u64, kind: HardwareKind) -> Result<(), Error>;

    fn clear_hw_slot(&self, slot: usize) -> Result<(), Error>;
}

type Key = (u64, HardwareKind);

/// User data prepared for writing over software traps.
#[derive(Debug)]
pub struct PatchedWrite {
    /// Bytes to write, trap instructions kept.
    pub data: Vec<u8>,
    originals: Vec<(Key, usize, u8)>,
}

/// Process wide physical trap registry.
#[derive(Debug)]
pub struct BreakpointManager {
    domain: AddressDomain,
    instruction: SmallVec<[u8; 4]>,
    slots: Vec<Option<Key>>,
    entries: BTreeMap<TrapId, TrapEntry>,
    physical: HashMap<Key, PhysicalTrap>,
    next_id: u32,
}

impl BreakpointManager {
    /// Create manager for a process.
    ///
    /// # Arguments
    ///
    /// * `domain`: address space of the process
    /// * `instruction`: software trap instruction
    /// * `hardware_slots`: number of hardware trap slots
    pub fn new(domain: AddressDomain, instruction: &[u8], hardware_slots: usize) -> Self {
        Self {
            domain,
            instruction: SmallVec::from_slice(instruction),
            slots: vec![None; hardware_slots],
            entries: BTreeMap::new(),
            physical: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn domain(&self) -> AddressDomain {
        self.domain
    }

    /// Add owner entry for an address, install a physical trap if it is the first enabled
    /// entry for this address.
    pub fn insert(
        &mut self,
        io: &dyn TrapIo,
        address: TargetAddress,
        owner: TrapOwner,
        policy: TrapPolicy,
        enabled: bool,
    ) -> Result<TrapId, Error> {
        if address.domain() != self.domain {
            return Err(Error::DomainMismatch);
        }

        let entry = TrapEntry {
            address,
            owner,
            policy,
            enabled,
        };
        if enabled {
            self.acquire(io, entry.key(), address, policy)?;
        }

        let id = TrapId(self.next_id);
        self.next_id += 1;
        debug!(target: "debugger", "insert {id} at {address} for {owner:?}, enabled: {enabled}");
        self.entries.insert(id, entry);
        Ok(id)
    }

    /// Remove owner entry. Physical trap is removed (and original bytes restored) when
    /// no enabled entries left for the address.
    pub fn remove(&mut self, io: &dyn TrapIo, id: TrapId) -> Result<(), Error> {
        let entry = self
            .entries
            .remove(&id)
            .ok_or(Error::TrapNotFound(id.0))?;
        debug!(target: "debugger", "remove {id} at {}", entry.address);

        if entry.enabled && !self.is_needed(entry.key()) {
            if let Err(e) = self.release(io, entry.key()) {
                self.entries.insert(id, entry);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn enable(&mut self, io: &dyn TrapIo, id: TrapId) -> Result<(), Error> {
        let entry = self.entries.get(&id).ok_or(Error::TrapNotFound(id.0))?;
        if entry.enabled {
            return Ok(());
        }
        let (key, address, policy) = (entry.key(), entry.address, entry.policy);
        self.acquire(io, key, address, policy)?;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.enabled = true;
        }
        Ok(())
    }

    pub fn disable(&mut self, io: &dyn TrapIo, id: TrapId) -> Result<(), Error> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(Error::TrapNotFound(id.0))?;
        if !entry.enabled {
            return Ok(());
        }
        entry.enabled = false;
        let key = entry.key();

        if !self.is_needed(key) {
            if let Err(e) = self.release(io, key) {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.enabled = true;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn is_enabled(&self, id: TrapId) -> Option<bool> {
        self.entries.get(&id).map(|e| e.enabled)
    }

    pub fn address_of(&self, id: TrapId) -> Option<TargetAddress> {
        self.entries.get(&id).map(|e| e.address)
    }

    /// Number of installed physical traps.
    pub fn physical_count(&self) -> usize {
        self.physical.len()
    }

    /// Physical code trap at address.
    pub fn lookup(&self, address: TargetAddress) -> Option<&PhysicalTrap> {
        if address.domain() != self.domain {
            return None;
        }
        self.physical
            .get(&(address.as_u64(), HardwareKind::Execute))
    }

    /// True if software trap instruction currently patched at address.
    pub fn is_software_trap(&self, address: TargetAddress) -> bool {
        matches!(
            self.lookup(address),
            Some(PhysicalTrap {
                kind: PhysicalKind::Software { lifted: false, .. },
                ..
            })
        )
    }

    /// Enabled owners of a code trap at address.
    pub fn owners(&self, address: TargetAddress) -> SmallVec<[(TrapId, TrapOwner); 2]> {
        self.owners_by_key((address.as_u64(), HardwareKind::Execute), address.domain())
    }

    fn owners_by_key(
        &self,
        key: Key,
        domain: AddressDomain,
    ) -> SmallVec<[(TrapId, TrapOwner); 2]> {
        if domain != self.domain {
            return SmallVec::new();
        }
        self.entries
            .iter()
            .filter(|(_, e)| e.enabled && e.key() == key)
            .map(|(id, e)| (*id, e.owner))
            .collect()
    }

    /// Address, kind and owners of a hardware slot.
    pub fn slot_info(
        &self,
        slot: usize,
    ) -> Option<(TargetAddress, HardwareKind, SmallVec<[(TrapId, TrapOwner); 2]>)> {
        let key = (*self.slots.get(slot)?)?;
        let address = TargetAddress::new(self.domain, key.0);
        Some((address, key.1, self.owners_by_key(key, self.domain)))
    }

    /// Active hardware slots, used for programming newly created threads.
    pub fn active_slots(&self) -> Vec<(usize, u64, HardwareKind)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, key)| key.map(|(addr, kind)| (slot, addr, kind)))
            .collect()
    }

    /// All entries of an owner.
    pub fn entries_of(&self, owner: TrapOwner) -> Vec<TrapId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Replace patched bytes in a memory buffer read from `addr` with saved original bytes.
    pub fn shadow(&self, addr: u64, buf: &mut [u8]) {
        let end = addr + buf.len() as u64;
        for trap in self.physical.values() {
            let PhysicalKind::Software {
                original,
                lifted: false,
            } = &trap.kind
            else {
                continue;
            };
            let trap_addr = trap.address.as_u64();
            for (i, b) in original.iter().enumerate() {
                let a = trap_addr + i as u64;
                if a >= addr && a < end {
                    buf[(a - addr) as usize] = *b;
                }
            }
        }
    }

    /// Prepare user data for writing at `addr`: trap instructions stay in memory, and bytes that
    /// overlap software traps become new original bytes once the write is committed with
    /// [`BreakpointManager::commit_write`].
    pub fn write_through(&self, addr: u64, data: &[u8]) -> PatchedWrite {
        let mut out = data.to_vec();
        let mut originals = vec![];
        let end = addr + data.len() as u64;
        for (key, trap) in &self.physical {
            let PhysicalKind::Software { original, lifted } = &trap.kind else {
                continue;
            };
            let trap_addr = trap.address.as_u64();
            for i in 0..original.len() {
                let a = trap_addr + i as u64;
                if a >= addr && a < end {
                    let idx = (a - addr) as usize;
                    originals.push((*key, i, data[idx]));
                    if !*lifted {
                        out[idx] = self.instruction[i];
                    }
                }
            }
        }
        PatchedWrite {
            data: out,
            originals,
        }
    }

    /// Store original bytes of a write that reached target memory.
    pub fn commit_write(&mut self, write: PatchedWrite) {
        for (key, idx, byte) in write.originals {
            if let Some(PhysicalTrap {
                kind: PhysicalKind::Software { original, .. },
                ..
            }) = self.physical.get_mut(&key)
            {
                if let Some(b) = original.get_mut(idx) {
                    *b = byte;
                }
            }
        }
    }

    /// Temporary restore original bytes of a software trap (step over a trap).
    pub fn lift(&mut self, io: &dyn TrapIo, address: TargetAddress) -> Result<(), Error> {
        let Some(trap) = self
            .physical
            .get_mut(&(address.as_u64(), HardwareKind::Execute))
        else {
            return Ok(());
        };
        if let PhysicalKind::Software { original, lifted } = &mut trap.kind {
            if !*lifted {
                io.write(address.as_u64(), original)?;
                *lifted = true;
            }
        }
        Ok(())
    }

    /// Put trap instruction back after [`BreakpointManager::lift`].
    /// Nothing happens if trap was removed in the meantime.
    pub fn unlift(&mut self, io: &dyn TrapIo, address: TargetAddress) -> Result<(), Error> {
        let instruction = self.instruction.clone();
        let Some(trap) = self
            .physical
            .get_mut(&(address.as_u64(), HardwareKind::Execute))
        else {
            return Ok(());
        };
        if let PhysicalKind::Software { lifted, .. } = &mut trap.kind {
            if *lifted {
                io.write(address.as_u64(), &instruction)?;
                *lifted = false;
            }
        }
        Ok(())
    }

    /// Remove all traps and restore memory.
    pub fn remove_all(&mut self, io: &dyn TrapIo) -> Result<(), Error> {
        let keys: Vec<Key> = self.physical.keys().copied().collect();
        let errors: Vec<Error> = keys
            .into_iter()
            .filter_map(|key| self.release(io, key).err())
            .collect();
        self.entries.clear();
        self.physical.clear();
        self.slots.iter_mut().for_each(|s| *s = None);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::MultipleErrors(errors))
        }
    }

    /// Drop all traps without touching memory (process memory no longer exists).
    pub fn forget_all(&mut self) {
        self.entries.clear();
        self.physical.clear();
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    /// Process memory image was replaced, all traps are gone.
    pub fn reset_after_exec(&mut self, domain: AddressDomain) {
        self.forget_all();
        self.domain = domain;
    }

    /// Write original bytes of every patched software trap into another memory (fork child
    /// that will be detached), manager state is not changed.
    pub fn restore_memory(&self, io: &dyn TrapIo) -> Result<(), Error> {
        for trap in self.physical.values() {
            if let PhysicalKind::Software {
                original,
                lifted: false,
            } = &trap.kind
            {
                io.write(trap.address.as_u64(), original)?;
            }
        }
        Ok(())
    }

    /// Create manager for a forked child.
    /// Child memory is a copy of parent memory, so patched software traps are already there.
    /// Thread bound entries (step and invocation traps) are dropped from the child and
    /// hardware traps are reinstalled.
    pub fn clone_for_fork(&self, domain: AddressDomain, io: &dyn TrapIo) -> Result<Self, Error> {
        let mut child = Self {
            domain,
            instruction: self.instruction.clone(),
            slots: vec![None; self.slots.len()],
            entries: BTreeMap::new(),
            physical: HashMap::new(),
            next_id: self.next_id,
        };

        for (key, trap) in &self.physical {
            if let PhysicalKind::Software { lifted: false, .. } = trap.kind {
                child.physical.insert(
                    *key,
                    PhysicalTrap {
                        address: trap.address.rebind(domain),
                        kind: trap.kind.clone(),
                    },
                );
            }
        }

        for (id, entry) in &self.entries {
            if entry.owner.is_thread_bound() {
                continue;
            }
            let mut entry = entry.clone();
            entry.address = entry.address.rebind(domain);
            child.entries.insert(*id, entry);
        }

        child.reconcile(io)?;
        Ok(child)
    }

    /// Make physical traps match enabled entries.
    fn reconcile(&mut self, io: &dyn TrapIo) -> Result<(), Error> {
        let stale: Vec<Key> = self
            .physical
            .keys()
            .filter(|key| !self.is_needed(**key))
            .copied()
            .collect();
        for key in stale {
            self.release(io, key)?;
        }

        let missing: Vec<(Key, TargetAddress, TrapPolicy)> = self
            .entries
            .values()
            .filter(|e| e.enabled && !self.physical.contains_key(&e.key()))
            .map(|e| (e.key(), e.address, e.policy))
            .collect();
        for (key, address, policy) in missing {
            if !self.physical.contains_key(&key) {
                self.acquire(io, key, address, policy)?;
            }
        }
        Ok(())
    }

    fn is_needed(&self, key: Key) -> bool {
        self.entries.values().any(|e| e.enabled && e.key() == key)
    }

    fn acquire(
        &mut self,
        io: &dyn TrapIo,
        key: Key,
        address: TargetAddress,
        policy: TrapPolicy,
    ) -> Result<(), Error> {
        if self.physical.contains_key(&key) {
            return Ok(());
        }

        match policy {
            TrapPolicy::Software => self.install_software(io, key, address),
            TrapPolicy::Watch(kind) => self.install_hardware(io, key, address, kind),
            TrapPolicy::PreferHardware { fallback } => {
                match self.install_hardware(io, key, address, HardwareKind::Execute) {
                    Ok(()) => Ok(()),
                    Err(e) if fallback => {
                        debug!(
                            target: "debugger",
                            "hardware trap at {address} not installed ({e}), use software trap"
                        );
                        self.install_software(io, key, address)
                    }
                    Err(Error::NotImplemented(_)) => Err(Error::DebugRegisterOccupied),
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn install_hardware(
        &mut self,
        io: &dyn TrapIo,
        key: Key,
        address: TargetAddress,
        kind: HardwareKind,
    ) -> Result<(), Error> {
        if self.slots.is_empty() {
            return Err(Error::NotImplemented("hardware traps"));
        }
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::DebugRegisterOccupied)?;

        io.set_hw_slot(slot, address.as_u64(), kind)?;
        self.slots[slot] = Some(key);
        self.physical.insert(
            key,
            PhysicalTrap {
                address,
                kind: PhysicalKind::Hardware { slot, kind },
            },
        );
        Ok(())
    }

    fn install_software(
        &mut self,
        io: &dyn TrapIo,
        key: Key,
        address: TargetAddress,
    ) -> Result<(), Error> {
        let original = io.read(address.as_u64(), self.instruction.len())?;
        io.write(address.as_u64(), &self.instruction)?;
        self.physical.insert(
            key,
            PhysicalTrap {
                address,
                kind: PhysicalKind::Software {
                    original: SmallVec::from_vec(original),
                    lifted: false,
                },
            },
        );
        Ok(())
    }

    fn release(&mut self, io: &dyn TrapIo, key: Key) -> Result<(), Error> {
        let Some(trap) = self.physical.remove(&key) else {
            warn!(target: "debugger", "release of unknown physical trap at {:#X}", key.0);
            return Ok(());
        };

        let result = match &trap.kind {
            PhysicalKind::Software { lifted: true, .. } => Ok(()),
            PhysicalKind::Software { original, .. } => io.write(key.0, original),
            PhysicalKind::Hardware { slot, .. } => {
                let slot = *slot;
                self.slots[slot] = None;
                // slot state of a running thread can't be changed, but slot is free anyway
                weak_error!(io.clear_hw_slot(slot), "clear hardware slot:");
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(target: "debugger", "restore memory at {:#X}: {e}", key.0);
            self.physical.insert(key, trap);
            return Err(e);
        }
        Ok(())
    }
}
