// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Magic tag opening the transfer record header.
pub const CRASH_DESC_MAGIC: [u8; 3] = *b"CRD";
/// Magic tag for a string block.
pub const STRING_MAGIC: [u8; 3] = *b"STR";
/// Magic tag for a file-item block.
pub const FILE_ITEM_MAGIC: [u8; 3] = *b"FIL";
/// Magic tag for a custom-property block.
pub const PROPERTY_MAGIC: [u8; 3] = *b"CPR";

/// Schema stamp of the transfer record.  Readers reject any other value: the
/// record crosses a process boundary and both sides must have been built from
/// the same layout.
pub const TRANSFER_SCHEMA_VERSION: u32 = 3;

/// Fixed ceiling of the shared transfer buffer.  Sized generously so that
/// in-crash packing never needs dynamic growth.
pub const MAX_SHARED_MEMORY_SIZE: usize = 10 * 1024 * 1024;

/// Default bound on the wait for the reporter's completion signal.  The
/// original design waited forever; a hung reporter must not wedge the
/// faulting process indefinitely, so the wait is bounded and the timeout is
/// surfaced to the caller.
pub const DEFAULT_REPORTER_TIMEOUT: Duration = Duration::from_secs(60);

/// Name of the POSIX shared memory object holding the transfer record for
/// one crash cycle.
pub fn shm_name(crash_id: &str) -> String {
    format!("/crashtrap-{crash_id}")
}

/// Path of the FIFO the reporter signals once the synchronous portion of its
/// work (the part that needs the faulting process alive) is done.
pub fn sync_fifo_path(logs_dir: &Path, crash_id: &str) -> PathBuf {
    logs_dir.join(format!("{crash_id}.sync"))
}
