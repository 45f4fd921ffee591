use crate::debugger::address::{AddressDomain, TargetAddress};
use crate::debugger::channel::{Endianness, TargetInfo};
use crate::debugger::error::Error;
use proc_maps::MapRange;
use std::path::PathBuf;

/// Single mapped region of a debugee address space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryArea {
    pub start: u64,
    pub end: u64,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub name: Option<PathBuf>,
}

impl MemoryArea {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// True if debugger must not change this memory through user writes.
    /// Executable mappings are patchable by the debugger.
    pub fn is_read_only(&self) -> bool {
        !self.write && !self.execute
    }
}

impl From<&MapRange> for MemoryArea {
    fn from(range: &MapRange) -> Self {
        let start = range.start() as u64;
        Self {
            start,
            end: start + range.size() as u64,
            read: range.is_read(),
            write: range.is_write(),
            execute: range.is_exec(),
            name: range.filename().map(ToOwned::to_owned),
        }
    }
}

/// Integer sizes and byte order of a debugee, queried once per process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetMemoryInfo {
    pub int_size: usize,
    pub long_size: usize,
    pub address_size: usize,
    pub endianness: Endianness,
}

impl From<TargetInfo> for TargetMemoryInfo {
    fn from(info: TargetInfo) -> Self {
        Self {
            int_size: info.int_size,
            long_size: info.long_size,
            address_size: info.address_size,
            endianness: info.endianness,
        }
    }
}

impl TargetMemoryInfo {
    /// Decode unsigned integer, integer width is a length of `bytes` (at most 8).
    pub fn decode(&self, bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        let len = bytes.len().min(8);
        match self.endianness {
            Endianness::Little => {
                buf[..len].copy_from_slice(&bytes[..len]);
                u64::from_le_bytes(buf)
            }
            Endianness::Big => {
                buf[8 - len..].copy_from_slice(&bytes[..len]);
                u64::from_be_bytes(buf)
            }
        }
    }

    /// Decode signed integer with sign extension.
    pub fn decode_signed(&self, bytes: &[u8]) -> i64 {
        let len = bytes.len().min(8);
        if len == 0 {
            return 0;
        }
        let value = self.decode(bytes);
        let shift = 64 - len * 8;
        ((value << shift) as i64) >> shift
    }

    /// Encode the `size` lowest bytes of a value.
    pub fn encode(&self, value: u64, size: usize) -> Vec<u8> {
        let size = size.min(8);
        match self.endianness {
            Endianness::Little => value.to_le_bytes()[..size].to_vec(),
            Endianness::Big => value.to_be_bytes()[8 - size..].to_vec(),
        }
    }
}

/// Typed access to a debugee memory.
/// Implementors provide raw buffer access, sized helpers decode values with [`TargetMemoryInfo`].
pub trait MemoryAccess {
    fn memory_info(&self) -> TargetMemoryInfo;

    fn domain(&self) -> AddressDomain;

    fn read_buffer(&self, addr: TargetAddress, size: usize) -> Result<Vec<u8>, Error>;

    fn write_buffer(&mut self, addr: TargetAddress, data: &[u8]) -> Result<(), Error>;

    fn read_byte(&self, addr: TargetAddress) -> Result<u8, Error> {
        Ok(self.read_buffer(addr, 1)?[0])
    }

    fn read_integer(&self, addr: TargetAddress) -> Result<i32, Error> {
        let info = self.memory_info();
        let bytes = self.read_buffer(addr, info.int_size)?;
        Ok(info.decode_signed(&bytes) as i32)
    }

    fn read_long(&self, addr: TargetAddress) -> Result<i64, Error> {
        let info = self.memory_info();
        let bytes = self.read_buffer(addr, info.long_size)?;
        Ok(info.decode_signed(&bytes))
    }

    fn read_address(&self, addr: TargetAddress) -> Result<TargetAddress, Error> {
        let info = self.memory_info();
        let bytes = self.read_buffer(addr, info.address_size)?;
        Ok(TargetAddress::new(addr.domain(), info.decode(&bytes)))
    }

    /// Read null terminated string, at most `max_len` bytes (terminator excluded).
    fn read_string(&self, addr: TargetAddress, max_len: usize) -> Result<String, Error> {
        const CHUNK: usize = 64;
        let mut result = Vec::new();
        let mut cursor = addr;
        while result.len() < max_len {
            let want = CHUNK.min(max_len - result.len());
            // fall back to byte reads at the end of a mapping
            let chunk = match self.read_buffer(cursor, want) {
                Ok(chunk) => chunk,
                Err(Error::MemoryAccess(_)) if want > 1 => self.read_buffer(cursor, 1)?,
                Err(e) => return Err(e),
            };
            match chunk.iter().position(|b| *b == 0) {
                Some(pos) => {
                    result.extend_from_slice(&chunk[..pos]);
                    return Ok(String::from_utf8_lossy(&result).into_owned());
                }
                None => {
                    result.extend_from_slice(&chunk);
                    cursor = cursor + chunk.len() as u64;
                }
            }
        }
        Ok(String::from_utf8_lossy(&result).into_owned())
    }

    fn write_byte(&mut self, addr: TargetAddress, value: u8) -> Result<(), Error> {
        self.write_buffer(addr, &[value])
    }

    fn write_integer(&mut self, addr: TargetAddress, value: i32) -> Result<(), Error> {
        let info = self.memory_info();
        let bytes = info.encode(value as i64 as u64, info.int_size);
        self.write_buffer(addr, &bytes)
    }

    fn write_long(&mut self, addr: TargetAddress, value: i64) -> Result<(), Error> {
        let info = self.memory_info();
        let bytes = info.encode(value as u64, info.long_size);
        self.write_buffer(addr, &bytes)
    }

    fn write_address(&mut self, addr: TargetAddress, value: TargetAddress) -> Result<(), Error> {
        if value.domain() != addr.domain() && !value.is_null() {
            return Err(Error::DomainMismatch);
        }
        let info = self.memory_info();
        let bytes = info.encode(value.as_u64(), info.address_size);
        self.write_buffer(addr, &bytes)
    }
}
