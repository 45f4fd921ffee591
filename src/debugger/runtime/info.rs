//! Runtime debugger info table exported by a managed runtime.

use crate::debugger::address::TargetAddress;
use crate::debugger::error::Error;
use crate::debugger::memory::{MemoryAccess, TargetMemoryInfo};

pub const DEBUGGER_INFO_SYMBOL: &str = "MONO_DEBUGGER__debugger_info";
pub const DEBUGGER_INFO_MAGIC: u64 = 0x7aff65af4253d427;
pub const SUPPORTED_VERSION: i32 = 80;
/// magic (8) + version (4) + minor version (4) + reserved (4) + size (4)
pub const HEADER_SIZE: usize = 24;

/// Debugger info header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InfoHeader {
    pub version: i32,
    pub minor_version: i32,
    /// Size of a whole table including header.
    pub size: usize,
}

impl InfoHeader {
    pub fn parse(bytes: &[u8], info: TargetMemoryInfo) -> Result<Self, Error> {
        let mut reader = TableReader::new(bytes, info, 0);
        let magic = reader.u64()?;
        if magic != DEBUGGER_INFO_MAGIC {
            return Err(Error::RuntimeMagic);
        }
        let version = reader.i32()?;
        if version != SUPPORTED_VERSION {
            return Err(Error::RuntimeVersion {
                found: version,
                supported: SUPPORTED_VERSION,
            });
        }
        let minor_version = reader.i32()?;
        let _reserved = reader.i32()?;
        let size = reader.i32()?;

        Ok(Self {
            version,
            minor_version,
            size: usize::try_from(size).unwrap_or_default().max(HEADER_SIZE),
        })
    }
}

/// Addresses and sizes exported by a runtime, in table order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub symbol_table_size: i32,
    pub trampoline_num: i32,
    pub trampoline_code: u64,
    pub notification_address: u64,
    pub symbol_table: u64,
    pub metadata_info: u64,
    pub debugger_version: u64,
    pub compile_method: u64,
    pub get_virtual_method: u64,
    pub get_boxed_object_method: u64,
    pub runtime_invoke: u64,
    pub class_get_static_field_data: u64,
    pub run_finally: u64,
    pub initialize: u64,
    pub create_string: u64,
    pub lookup_class: u64,
    pub insert_method_breakpoint: u64,
    pub insert_source_breakpoint: u64,
    pub remove_breakpoint: u64,
    pub register_class_init_callback: u64,
    pub remove_class_init_callback: u64,
    pub thread_table: u64,
    pub executable_code_buffer: u64,
    pub breakpoint_info: u64,
    pub breakpoint_info_index: u64,
    pub executable_code_buffer_size: i32,
    pub breakpoint_array_size: i32,
    pub get_method_signature: u64,
    pub init_code_buffer: u64,
    pub thread_vtable_ptr: u64,
    pub thread_vtable: u64,
    pub event_handler_ptr: u64,
    pub event_handler: u64,
    pub using_mono_debugger: u64,
    pub interruption_request: u64,
}

impl RuntimeInfo {
    /// Read and validate a table located at `addr`.
    pub fn read<M: MemoryAccess + ?Sized>(
        memory: &M,
        addr: TargetAddress,
    ) -> Result<Self, Error> {
        let info = memory.memory_info();
        let header = InfoHeader::parse(&memory.read_buffer(addr, HEADER_SIZE)?, info)?;
        let table = memory.read_buffer(addr, header.size)?;
        Self::parse(&table, info, addr.as_u64())
    }

    /// Parse a whole table (header included).
    pub fn parse(table: &[u8], info: TargetMemoryInfo, base: u64) -> Result<Self, Error> {
        let mut r = TableReader::new(table, info, base);
        r.skip(HEADER_SIZE);

        Ok(Self {
            symbol_table_size: r.i32()?,
            trampoline_num: r.i32()?,
            trampoline_code: r.address()?,
            notification_address: r.address()?,
            symbol_table: r.address()?,
            metadata_info: r.address()?,
            debugger_version: r.address()?,
            compile_method: r.address()?,
            get_virtual_method: r.address()?,
            get_boxed_object_method: r.address()?,
            runtime_invoke: r.address()?,
            class_get_static_field_data: r.address()?,
            run_finally: r.address()?,
            initialize: r.address()?,
            create_string: r.address()?,
            lookup_class: r.address()?,
            insert_method_breakpoint: r.address()?,
            insert_source_breakpoint: r.address()?,
            remove_breakpoint: r.address()?,
            register_class_init_callback: r.address()?,
            remove_class_init_callback: r.address()?,
            thread_table: r.address()?,
            executable_code_buffer: r.address()?,
            breakpoint_info: r.address()?,
            breakpoint_info_index: r.address()?,
            executable_code_buffer_size: r.i32()?,
            breakpoint_array_size: r.i32()?,
            get_method_signature: r.address()?,
            init_code_buffer: r.address()?,
            thread_vtable_ptr: r.address()?,
            thread_vtable: r.address()?,
            event_handler_ptr: r.address()?,
            event_handler: r.address()?,
            using_mono_debugger: r.address()?,
            interruption_request: r.address()?,
        })
    }
}

struct TableReader<'a> {
    data: &'a [u8],
    info: TargetMemoryInfo,
    base: u64,
    offset: usize,
}

impl<'a> TableReader<'a> {
    fn new(data: &'a [u8], info: TargetMemoryInfo, base: u64) -> Self {
        Self {
            data,
            info,
            base,
            offset: 0,
        }
    }

    fn skip(&mut self, n: usize) {
        self.offset += n;
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let chunk = self
            .data
            .get(self.offset..self.offset + n)
            .ok_or(Error::MemoryAccess(self.base + self.offset as u64))?;
        self.offset += n;
        Ok(chunk)
    }

    fn i32(&mut self) -> Result<i32, Error> {
        let bytes = self.take(4)?;
        Ok(self.info.decode_signed(bytes) as i32)
    }

    fn u64(&mut self) -> Result<u64, Error> {
        let bytes = self.take(8)?;
        Ok(self.info.decode(bytes))
    }

    fn address(&mut self) -> Result<u64, Error> {
        let bytes = self.take(self.info.address_size)?;
        Ok(self.info.decode(bytes))
    }
}

/// Build a little endian table image with 8 byte addresses.
pub fn encode_table(info: &RuntimeInfo, version: i32) -> Vec<u8> {
    let mut out = vec![];
    out.extend_from_slice(&DEBUGGER_INFO_MAGIC.to_le_bytes());
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());

    let i32s = |out: &mut Vec<u8>, v: i32| out.extend_from_slice(&v.to_le_bytes());
    let addr = |out: &mut Vec<u8>, v: u64| out.extend_from_slice(&v.to_le_bytes());
    i32s(&mut out, info.symbol_table_size);
    i32s(&mut out, info.trampoline_num);
    for v in [
        info.trampoline_code,
        info.notification_address,
        info.symbol_table,
        info.metadata_info,
        info.debugger_version,
        info.compile_method,
        info.get_virtual_method,
        info.get_boxed_object_method,
        info.runtime_invoke,
        info.class_get_static_field_data,
        info.run_finally,
        info.initialize,
        info.create_string,
        info.lookup_class,
        info.insert_method_breakpoint,
        info.insert_source_breakpoint,
        info.remove_breakpoint,
        info.register_class_init_callback,
        info.remove_class_init_callback,
        info.thread_table,
        info.executable_code_buffer,
        info.breakpoint_info,
        info.breakpoint_info_index,
    ] {
        addr(&mut out, v);
    }
    i32s(&mut out, info.executable_code_buffer_size);
    i32s(&mut out, info.breakpoint_array_size);
    for v in [
        info.get_method_signature,
        info.init_code_buffer,
        info.thread_vtable_ptr,
        info.thread_vtable,
        info.event_handler_ptr,
        info.event_handler,
        info.using_mono_debugger,
        info.interruption_request,
    ] {
        addr(&mut out, v);
    }

    let size = out.len() as i32;
    out[20..24].copy_from_slice(&size.to_le_bytes());
    out
}
