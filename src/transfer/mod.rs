// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The shared transfer buffer and the tagged-block transfer record.
//!
//! This is the only channel between the faulting process and the reporter
//! process.  Everything inside the record is referenced by byte offset, never
//! by pointer: the reader lives in a different address space with a different
//! heap state than the writer.

mod record;
mod shared_buffer;

pub use record::{
    AssertionRecord, FaultSummary, FileFlags, RecordSeed, RegisteredFile, TransferReader,
    TransferRecord, TransferWriter,
};
pub use shared_buffer::SharedBuffer;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Failed to create shared memory object {0}: {1}")]
    CreateFailed(String, nix::Error),
    #[error("Failed to open shared memory object {0}: {1}")]
    OpenFailed(String, nix::Error),
    #[error("Failed to size shared memory object: {0}")]
    ResizeFailed(nix::Error),
    #[error("Failed to map view at offset {offset} length {length}: {source}")]
    MapFailed {
        offset: usize,
        length: usize,
        source: nix::Error,
    },
    #[error("View [{offset}, +{length}) does not fit in a buffer of {size} bytes")]
    ViewOutOfRange {
        offset: usize,
        length: usize,
        size: usize,
    },
    #[error("Transfer buffer is full (ceiling {0} bytes)")]
    BufferFull(usize),
    #[error("String of {0} bytes exceeds the block size limit")]
    StringTooLong(usize),
    #[error("Record does not start with the expected magic tag")]
    BadMagic,
    #[error("Record schema version {actual} does not match expected {expected}")]
    SchemaMismatch { expected: u32, actual: u32 },
    #[error("Unrecognized block tag at offset {0}")]
    InvalidBlock(u32),
    #[error("Block at offset {offset} declares an inconsistent size {size}")]
    InconsistentBlock { offset: u32, size: u16 },
    #[error("Record walk ended at {reached}, header declares total size {declared}")]
    TotalSizeMismatch { reached: u32, declared: u32 },
    #[error("String block holds invalid utf-8")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
