// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Packing and unpacking of the transfer record.
//!
//! Layout: a fixed header at offset 0, followed by append-only tagged blocks.
//! A string block is `STR | size:u16 | utf8 bytes`; a file-item block is
//! `FIL | size:u16 | flags:u32 | 3 string offsets`; a property block is
//! `CPR | size:u16 | 2 string offsets`.  `size` counts the whole block
//! including the 5-byte tag prefix.  `total_size` in the header is the
//! current end of the record and every valid block walk must land on it
//! exactly.  String offset 0 means "absent" (offset 0 is the header, so no
//! real string can live there).

use super::{SharedBuffer, TransferError};
use crate::shared::constants::{
    shm_name, CRASH_DESC_MAGIC, FILE_ITEM_MAGIC, PROPERTY_MAGIC, STRING_MAGIC,
    TRANSFER_SCHEMA_VERSION,
};
use crate::shared::configuration::DumpVerbosity;
use serde::Serialize;
use std::collections::BTreeMap;
use std::mem::size_of;
use std::path::PathBuf;

const BLOCK_PREFIX: usize = 5; // 3-byte tag + u16 size
const FILE_ITEM_SIZE: u16 = (BLOCK_PREFIX + 4 + 3 * 4) as u16;
const PROPERTY_SIZE: u16 = (BLOCK_PREFIX + 2 * 4) as u16;

/// Behavior flags of a registered file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FileFlags(pub u32);

impl FileFlags {
    /// Snapshot the file next to the report instead of referencing it in
    /// place.  Volatile files (logs still being written) need this.
    pub const MAKE_COPY: FileFlags = FileFlags(0x1);
    /// The reporter may delete the source file after delivery.
    pub const ALLOW_DELETE: FileFlags = FileFlags(0x2);
    /// Registration succeeds even if the file does not exist yet.
    pub const MISSING_FILE_OK: FileFlags = FileFlags(0x4);

    pub const fn contains(self, other: FileFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FileFlags {
    type Output = FileFlags;
    fn bitor(self, rhs: FileFlags) -> FileFlags {
        FileFlags(self.0 | rhs.0)
    }
}

/// A file attached to the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredFile {
    pub src_path: PathBuf,
    pub dst_name: String,
    pub description: String,
    pub flags: FileFlags,
}

/// Process-scoped fields packed into the record when the handler installs or
/// reinitializes.  Everything here is known before any fault occurs.
#[derive(Debug, Clone)]
pub struct RecordSeed {
    pub crash_id: String,
    pub app_name: String,
    pub app_version: String,
    pub image_path: String,
    pub output_dir: String,
    pub server_url: Option<String>,
    pub symbol_helper_path: Option<String>,
    pub dump_verbosity: DumpVerbosity,
    pub process_id: u32,
}

/// Fault fields stamped into the header at crash time.
#[derive(Debug, Clone, Default)]
pub struct FaultSummary {
    pub kind: i32,
    pub code: u32,
    pub fpe_subcode: u32,
    pub thread_id: u64,
    pub ip: u64,
    pub sp: u64,
    pub fault_addr: u64,
    pub manual: bool,
    /// The failed assertion, when one is the cause.
    pub assertion: Option<AssertionRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssertionRecord {
    pub expression: String,
    pub function: String,
    pub file: String,
    pub line: u32,
}

const FLAG_CRASHED: u32 = 0x1;
const FLAG_MANUAL: u32 = 0x2;

/// The fixed header at offset 0.  All fields are explicitly sized; the
/// schema version guards both sides against layout drift.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct CrashDescHeader {
    magic: [u8; 3],
    _pad: u8,
    size: u16,
    _pad2: u16,
    total_size: u32,
    schema_version: u32,
    file_count: u32,
    property_count: u32,
    dump_verbosity: u32,
    process_id: u32,
    fault_kind: i32,
    fault_code: u32,
    fpe_subcode: u32,
    assert_line: u32,
    flags: u32,
    server_url_off: u32,
    app_name_off: u32,
    app_version_off: u32,
    crash_id_off: u32,
    output_dir_off: u32,
    symbol_helper_off: u32,
    image_path_off: u32,
    assert_expr_off: u32,
    assert_func_off: u32,
    assert_file_off: u32,
    thread_id: u64,
    fault_ip: u64,
    fault_sp: u64,
    fault_addr: u64,
}

impl CrashDescHeader {
    fn empty() -> Self {
        // SAFETY: the header is plain integers; all-zero is a valid value
        // for every field.
        let mut h: CrashDescHeader = unsafe { std::mem::zeroed() };
        h.magic = CRASH_DESC_MAGIC;
        h.size = size_of::<CrashDescHeader>() as u16;
        h.total_size = size_of::<CrashDescHeader>() as u32;
        h.schema_version = TRANSFER_SCHEMA_VERSION;
        h
    }
}

/// Packs the transfer record into a freshly created shared buffer.
///
/// All packing happens before any fault: at install/reinit time the seed and
/// the registered files/properties are written, so the only in-crash work is
/// stamping the fault fields into the already-mapped header.
pub struct TransferWriter {
    buffer: SharedBuffer,
    header_view: *mut u8,
}

// The raw header pointer is only dereferenced under the handler's state
// lock; the buffer itself is Sync.
unsafe impl Send for TransferWriter {}

impl TransferWriter {
    /// Creates the shared buffer for `seed.crash_id` and writes the header
    /// and the seed strings.
    pub fn begin(seed: &RecordSeed) -> Result<Self, TransferError> {
        let buffer = SharedBuffer::create(&shm_name(&seed.crash_id))?;
        let header_view = buffer.map_view(0, size_of::<CrashDescHeader>())?;
        let mut writer = TransferWriter {
            buffer,
            header_view,
        };
        writer.store_header(&CrashDescHeader::empty());

        let mut h = writer.header();
        h.dump_verbosity = seed.dump_verbosity as u32;
        h.process_id = seed.process_id;
        writer.store_header(&h);

        let crash_id_off = writer.pack_string(&seed.crash_id)?;
        let app_name_off = writer.pack_string(&seed.app_name)?;
        let app_version_off = writer.pack_string(&seed.app_version)?;
        let image_path_off = writer.pack_string(&seed.image_path)?;
        let output_dir_off = writer.pack_string(&seed.output_dir)?;
        let server_url_off = match &seed.server_url {
            Some(url) => writer.pack_string(url)?,
            None => 0,
        };
        let symbol_helper_off = match &seed.symbol_helper_path {
            Some(path) => writer.pack_string(path)?,
            None => 0,
        };

        let mut h = writer.header();
        h.crash_id_off = crash_id_off;
        h.app_name_off = app_name_off;
        h.app_version_off = app_version_off;
        h.image_path_off = image_path_off;
        h.output_dir_off = output_dir_off;
        h.server_url_off = server_url_off;
        h.symbol_helper_off = symbol_helper_off;
        writer.store_header(&h);
        Ok(writer)
    }

    /// Appends a string block and returns its offset.
    pub fn pack_string(&mut self, s: &str) -> Result<u32, TransferError> {
        let block_len = BLOCK_PREFIX + s.len();
        if block_len > u16::MAX as usize {
            return Err(TransferError::StringTooLong(s.len()));
        }
        let mut bytes = Vec::with_capacity(block_len);
        bytes.extend_from_slice(&STRING_MAGIC);
        bytes.extend_from_slice(&(block_len as u16).to_le_bytes());
        bytes.extend_from_slice(s.as_bytes());
        self.append(&bytes)
    }

    /// Appends a file-item block (and the strings it references).
    pub fn pack_file_item(&mut self, file: &RegisteredFile) -> Result<(), TransferError> {
        let src_off = self.pack_string(&file.src_path.to_string_lossy())?;
        let dst_off = self.pack_string(&file.dst_name)?;
        let desc_off = self.pack_string(&file.description)?;
        let mut bytes = Vec::with_capacity(FILE_ITEM_SIZE as usize);
        bytes.extend_from_slice(&FILE_ITEM_MAGIC);
        bytes.extend_from_slice(&FILE_ITEM_SIZE.to_le_bytes());
        bytes.extend_from_slice(&file.flags.0.to_le_bytes());
        bytes.extend_from_slice(&src_off.to_le_bytes());
        bytes.extend_from_slice(&dst_off.to_le_bytes());
        bytes.extend_from_slice(&desc_off.to_le_bytes());
        self.append(&bytes)?;
        let mut h = self.header();
        h.file_count += 1;
        self.store_header(&h);
        Ok(())
    }

    /// Appends a property block.  Overwrites append a fresh block for the
    /// same name; the reader keeps the last occurrence.
    pub fn pack_property(&mut self, name: &str, value: &str) -> Result<(), TransferError> {
        let name_off = self.pack_string(name)?;
        let value_off = self.pack_string(value)?;
        let mut bytes = Vec::with_capacity(PROPERTY_SIZE as usize);
        bytes.extend_from_slice(&PROPERTY_MAGIC);
        bytes.extend_from_slice(&PROPERTY_SIZE.to_le_bytes());
        bytes.extend_from_slice(&name_off.to_le_bytes());
        bytes.extend_from_slice(&value_off.to_le_bytes());
        self.append(&bytes)?;
        let mut h = self.header();
        h.property_count += 1;
        self.store_header(&h);
        Ok(())
    }

    /// Marks the record as describing a real crash (as opposed to a prepared
    /// record that was never consumed).
    pub fn mark_crashed(&mut self) {
        let mut h = self.header();
        h.flags |= FLAG_CRASHED;
        self.store_header(&h);
    }

    /// Stamps the fault fields into the header.  Only the assertion strings
    /// (rare) require appending; everything else writes into the mapped
    /// header view.
    pub fn set_fault(&mut self, fault: &FaultSummary) -> Result<(), TransferError> {
        let assertion = match &fault.assertion {
            Some(a) => Some((
                self.pack_string(&a.expression)?,
                self.pack_string(&a.function)?,
                self.pack_string(&a.file)?,
                a.line,
            )),
            None => None,
        };
        let mut h = self.header();
        h.fault_kind = fault.kind;
        h.fault_code = fault.code;
        h.fpe_subcode = fault.fpe_subcode;
        h.thread_id = fault.thread_id;
        h.fault_ip = fault.ip;
        h.fault_sp = fault.sp;
        h.fault_addr = fault.fault_addr;
        if fault.manual {
            h.flags |= FLAG_MANUAL;
        }
        if let Some((expr_off, func_off, file_off, line)) = assertion {
            h.assert_expr_off = expr_off;
            h.assert_func_off = func_off;
            h.assert_file_off = file_off;
            h.assert_line = line;
        }
        self.store_header(&h);
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<u32, TransferError> {
        let mut h = self.header();
        let offset = h.total_size as usize;
        if offset + bytes.len() > self.buffer.size() {
            return Err(TransferError::BufferFull(self.buffer.size()));
        }
        let view = self.buffer.map_view(offset, bytes.len())?;
        // SAFETY: the view covers exactly bytes.len() writable bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), view, bytes.len());
        }
        self.buffer.unmap_view(view);
        h.total_size += bytes.len() as u32;
        self.store_header(&h);
        Ok(offset as u32)
    }

    fn header(&self) -> CrashDescHeader {
        // SAFETY: header_view stays mapped for the writer's lifetime and
        // covers a full header.
        unsafe { std::ptr::read_unaligned(self.header_view as *const CrashDescHeader) }
    }

    fn store_header(&mut self, h: &CrashDescHeader) {
        // SAFETY: as above; write_unaligned tolerates any base alignment.
        unsafe { std::ptr::write_unaligned(self.header_view as *mut CrashDescHeader, *h) }
    }
}

/// The unpacked record, as consumed by the reporter.
#[derive(Debug, Serialize)]
pub struct TransferRecord {
    pub crash_id: String,
    pub app_name: String,
    pub app_version: String,
    pub image_path: String,
    pub output_dir: String,
    pub server_url: Option<String>,
    pub symbol_helper_path: Option<String>,
    pub dump_verbosity: DumpVerbosity,
    pub process_id: u32,
    pub thread_id: u64,
    pub crashed: bool,
    pub manual_report: bool,
    pub fault_kind: i32,
    pub fault_code: u32,
    pub fpe_subcode: u32,
    pub fault_ip: u64,
    pub fault_sp: u64,
    pub fault_addr: u64,
    pub assertion: Option<AssertionRecord>,
    pub files: Vec<RegisteredFile>,
    pub properties: BTreeMap<String, String>,
}

/// Attaches to a record packed by another process and validates it on read.
pub struct TransferReader {
    buffer: SharedBuffer,
}

impl TransferReader {
    pub fn open(crash_id: &str) -> Result<Self, TransferError> {
        let buffer = SharedBuffer::open(&shm_name(crash_id))?;
        Ok(TransferReader { buffer })
    }

    /// Walks the whole record.  Rejects bad magic, schema drift, malformed
    /// blocks, and any walk that does not land exactly on `total_size`.
    pub fn read(&self) -> Result<TransferRecord, TransferError> {
        let header = self.read_header()?;
        let total = header.total_size as usize;
        if total > self.buffer.size() || (header.size as usize) < size_of::<CrashDescHeader>() {
            return Err(TransferError::InconsistentBlock {
                offset: 0,
                size: header.size,
            });
        }

        let view = self.buffer.map_view(0, total)?;
        // SAFETY: the view covers [0, total) and stays mapped until the
        // explicit unmap below.
        let bytes = unsafe { std::slice::from_raw_parts(view as *const u8, total) };
        let result = Self::unpack(&header, bytes);
        self.buffer.unmap_view(view);
        result
    }

    fn read_header(&self) -> Result<CrashDescHeader, TransferError> {
        let view = self.buffer.map_view(0, size_of::<CrashDescHeader>())?;
        // SAFETY: the view covers a full header.
        let header =
            unsafe { std::ptr::read_unaligned(view as *const CrashDescHeader) };
        self.buffer.unmap_view(view);
        if header.magic != CRASH_DESC_MAGIC {
            return Err(TransferError::BadMagic);
        }
        if header.schema_version != TRANSFER_SCHEMA_VERSION {
            return Err(TransferError::SchemaMismatch {
                expected: TRANSFER_SCHEMA_VERSION,
                actual: header.schema_version,
            });
        }
        Ok(header)
    }

    fn unpack(header: &CrashDescHeader, bytes: &[u8]) -> Result<TransferRecord, TransferError> {
        let total = header.total_size;
        let mut files = Vec::new();
        let mut properties = BTreeMap::new();

        let mut offset = header.size as u32;
        while offset < total {
            let (tag, size) = Self::block_prefix(bytes, offset)?;
            if size < BLOCK_PREFIX as u16 || offset + size as u32 > total {
                return Err(TransferError::InconsistentBlock { offset, size });
            }
            match tag {
                t if t == STRING_MAGIC => {}
                t if t == FILE_ITEM_MAGIC => {
                    if size != FILE_ITEM_SIZE {
                        return Err(TransferError::InconsistentBlock { offset, size });
                    }
                    let base = offset as usize + BLOCK_PREFIX;
                    let flags = FileFlags(read_u32(bytes, base));
                    let src = Self::string_at(bytes, read_u32(bytes, base + 4))?;
                    let dst = Self::string_at(bytes, read_u32(bytes, base + 8))?;
                    let desc = Self::string_at(bytes, read_u32(bytes, base + 12))?;
                    files.push(RegisteredFile {
                        src_path: PathBuf::from(src),
                        dst_name: dst,
                        description: desc,
                        flags,
                    });
                }
                t if t == PROPERTY_MAGIC => {
                    if size != PROPERTY_SIZE {
                        return Err(TransferError::InconsistentBlock { offset, size });
                    }
                    let base = offset as usize + BLOCK_PREFIX;
                    let name = Self::string_at(bytes, read_u32(bytes, base))?;
                    let value = Self::string_at(bytes, read_u32(bytes, base + 4))?;
                    // Last occurrence wins.
                    properties.insert(name, value);
                }
                _ => return Err(TransferError::InvalidBlock(offset)),
            }
            offset += size as u32;
        }
        if offset != total {
            return Err(TransferError::TotalSizeMismatch {
                reached: offset,
                declared: total,
            });
        }

        let optional = |off: u32| -> Result<Option<String>, TransferError> {
            if off == 0 {
                Ok(None)
            } else {
                Self::string_at(bytes, off).map(Some)
            }
        };
        let assertion = if header.assert_expr_off != 0 {
            Some(AssertionRecord {
                expression: Self::string_at(bytes, header.assert_expr_off)?,
                function: Self::string_at(bytes, header.assert_func_off)?,
                file: Self::string_at(bytes, header.assert_file_off)?,
                line: header.assert_line,
            })
        } else {
            None
        };
        let dump_verbosity = match header.dump_verbosity {
            0 => DumpVerbosity::Minimal,
            2 => DumpVerbosity::Full,
            _ => DumpVerbosity::Normal,
        };

        Ok(TransferRecord {
            crash_id: Self::string_at(bytes, header.crash_id_off)?,
            app_name: Self::string_at(bytes, header.app_name_off)?,
            app_version: Self::string_at(bytes, header.app_version_off)?,
            image_path: Self::string_at(bytes, header.image_path_off)?,
            output_dir: Self::string_at(bytes, header.output_dir_off)?,
            server_url: optional(header.server_url_off)?,
            symbol_helper_path: optional(header.symbol_helper_off)?,
            dump_verbosity,
            process_id: header.process_id,
            thread_id: header.thread_id,
            crashed: header.flags & FLAG_CRASHED != 0,
            manual_report: header.flags & FLAG_MANUAL != 0,
            fault_kind: header.fault_kind,
            fault_code: header.fault_code,
            fpe_subcode: header.fpe_subcode,
            fault_ip: header.fault_ip,
            fault_sp: header.fault_sp,
            fault_addr: header.fault_addr,
            assertion,
            files,
            properties,
        })
    }

    fn block_prefix(bytes: &[u8], offset: u32) -> Result<([u8; 3], u16), TransferError> {
        let start = offset as usize;
        if start + BLOCK_PREFIX > bytes.len() {
            return Err(TransferError::InconsistentBlock { offset, size: 0 });
        }
        let tag = [bytes[start], bytes[start + 1], bytes[start + 2]];
        let size = u16::from_le_bytes([bytes[start + 3], bytes[start + 4]]);
        Ok((tag, size))
    }

    fn string_at(bytes: &[u8], offset: u32) -> Result<String, TransferError> {
        let (tag, size) = Self::block_prefix(bytes, offset)?;
        if tag != STRING_MAGIC {
            return Err(TransferError::InvalidBlock(offset));
        }
        let start = offset as usize;
        if size < BLOCK_PREFIX as u16 || start + size as usize > bytes.len() {
            return Err(TransferError::InconsistentBlock { offset, size });
        }
        std::str::from_utf8(&bytes[start + BLOCK_PREFIX..start + size as usize])
            .map(str::to_string)
            .map_err(|_| TransferError::InvalidUtf8)
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
