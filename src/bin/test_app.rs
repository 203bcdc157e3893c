// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash-under-test binary for the subprocess integration tests: installs
//! the handler against a given output directory and reporter, then triggers
//! the requested fault.  For fatal categories this process never returns
//! from `emulate_crash_code`.

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    use anyhow::Context;
    use std::path::PathBuf;
    use std::time::Duration;

    use crashtrap::{CrashConfiguration, DumpVerbosity, HookMask};

    let mut args = std::env::args().skip(1);
    let usage = "usage: crashtrap-test-app <fault-code> <output-dir> <reporter-path>";
    let fault_code: i32 = args.next().context(usage)?.parse().context(usage)?;
    let output_dir = PathBuf::from(args.next().context(usage)?);
    let reporter_path = PathBuf::from(args.next().context(usage)?);

    let config = CrashConfiguration::new(
        "crashtrap-test-app",
        "0.0.1",
        Some(reporter_path),
        None,
        Some(output_dir),
        DumpVerbosity::default(),
        HookMask::ALL,
        None,
        Some(Duration::from_secs(10)),
        true,
        false,
    )?;
    crashtrap::install(config)?;
    crashtrap::add_property("test.fault-code", &fault_code.to_string())?;
    crashtrap::emulate_crash_code(fault_code);
    // Only non-fatal or unknown codes reach this point.
    Ok(())
}
