use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

static GLOBAL_DOMAIN_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Identity of an address space.
/// Every traced process owns a domain, a new one is allocated when process memory image
/// is replaced (exec) or duplicated (fork).
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub struct AddressDomain(u32);

impl AddressDomain {
    /// Allocate a new unique domain.
    pub fn new() -> Self {
        Self(GLOBAL_DOMAIN_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
    }

    pub fn id(self) -> u32 {
        self.0
    }
}

impl Default for AddressDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AddressDomain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "domain#{}", self.0)
    }
}

/// Address in some address space of the debugee.
///
/// Addresses from different domains are never comparable, [`PartialOrd::partial_cmp`] returns
/// `None` for them and [`TargetAddress::distance`] fails.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub struct TargetAddress {
    domain: AddressDomain,
    addr: u64,
}

impl TargetAddress {
    pub fn new(domain: AddressDomain, addr: u64) -> Self {
        Self { domain, addr }
    }

    pub fn null(domain: AddressDomain) -> Self {
        Self { domain, addr: 0 }
    }

    pub fn is_null(self) -> bool {
        self.addr == 0
    }

    pub fn domain(self) -> AddressDomain {
        self.domain
    }

    pub fn as_u64(self) -> u64 {
        self.addr
    }

    pub fn as_usize(self) -> usize {
        self.addr as usize
    }

    /// Shift address by signed offset, result address lives in the same domain.
    pub fn offset(self, offset: i64) -> Self {
        Self {
            domain: self.domain,
            addr: self.addr.wrapping_add_signed(offset),
        }
    }

    /// Same address value in another domain (used when memory image is duplicated on fork).
    pub fn rebind(self, domain: AddressDomain) -> Self {
        Self {
            domain,
            addr: self.addr,
        }
    }

    /// Return `other - self`, `None` if addresses belong to different domains.
    pub fn distance(self, other: TargetAddress) -> Option<i64> {
        (self.domain == other.domain).then(|| other.addr.wrapping_sub(self.addr) as i64)
    }

    /// Return true if address in `[start, end)`, addresses from another domain are never in range.
    pub fn in_range(self, start: TargetAddress, end: TargetAddress) -> bool {
        matches!(
            (self.partial_cmp(&start), self.partial_cmp(&end)),
            (
                Some(Ordering::Greater | Ordering::Equal),
                Some(Ordering::Less)
            )
        )
    }
}

impl PartialOrd for TargetAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.domain != other.domain {
            return None;
        }
        Some(self.addr.cmp(&other.addr))
    }
}

impl std::ops::Add<u64> for TargetAddress {
    type Output = TargetAddress;

    fn add(self, rhs: u64) -> Self::Output {
        Self {
            domain: self.domain,
            addr: self.addr.wrapping_add(rhs),
        }
    }
}

impl std::ops::Sub<u64> for TargetAddress {
    type Output = TargetAddress;

    fn sub(self, rhs: u64) -> Self::Output {
        Self {
            domain: self.domain,
            addr: self.addr.wrapping_sub(rhs),
        }
    }
}

impl From<TargetAddress> for u64 {
    fn from(addr: TargetAddress) -> Self {
        addr.addr
    }
}

impl Display for TargetAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("{:#016X}", self.addr))
    }
}
