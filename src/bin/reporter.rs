// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    use anyhow::Context;
    use std::path::PathBuf;

    let mut args = std::env::args().skip(1);
    let crash_id = args
        .next()
        .context("usage: crashtrap-reporter <crash-id> [sync-fifo-path]")?;
    let fifo_path = args.next().map(PathBuf::from);
    crashtrap::reporter::reporter_entry_point(&crash_id, fifo_path.as_deref())
}
