// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

//! The out-of-process side of the handoff: attaches to the transfer record,
//! collects the report into `<output_dir>/<crash_id>/`, then signals the
//! faulting process through the sync fifo.
//!
//! Runs in a freshly exec'd process with a healthy heap, so ordinary
//! filesystem and serialization code is fine here.

use crate::shared::constants::sync_fifo_path;
use crate::transfer::{FileFlags, TransferReader, TransferRecord};
use anyhow::Context;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
struct CollectedFile {
    name: String,
    source: PathBuf,
    description: String,
    copied: bool,
    missing: bool,
    #[serde(skip)]
    delete_after: bool,
}

/// The report manifest written as `crashdesc.json` next to the collected
/// files.
#[derive(Debug, Serialize)]
struct ReportManifest<'a> {
    generated_at: String,
    os: String,
    reporter_pid: u32,
    record: &'a TransferRecord,
    collected_files: &'a [CollectedFile],
}

/// Entry point of the reporter process.
///
/// The work that needs the faulting process alive (reading the shared
/// buffer, snapshotting volatile files) happens before the fifo is
/// signalled; anything that can run against a dead peer would go after.
pub fn reporter_entry_point(crash_id: &str, fifo_path: Option<&Path>) -> anyhow::Result<()> {
    let record = TransferReader::open(crash_id)
        .with_context(|| format!("failed to attach to the transfer record for {crash_id}"))?
        .read()
        .context("failed to read the transfer record")?;

    let report_dir = PathBuf::from(&record.output_dir).join(&record.crash_id);
    std::fs::create_dir_all(&report_dir)
        .with_context(|| format!("failed to create report directory {report_dir:?}"))?;

    let collected = collect_files(&record, &report_dir);

    let manifest = ReportManifest {
        generated_at: chrono::Utc::now().to_rfc3339(),
        os: os_info::get().to_string(),
        reporter_pid: std::process::id(),
        record: &record,
        collected_files: &collected,
    };
    let manifest_path = report_dir.join("crashdesc.json");
    let out = std::fs::File::create(&manifest_path)
        .with_context(|| format!("failed to create {manifest_path:?}"))?;
    serde_json::to_writer_pretty(out, &manifest).context("failed to write the manifest")?;

    let fifo = fifo_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| {
            sync_fifo_path(&PathBuf::from(&record.output_dir).join("logs"), crash_id)
        });
    signal_completion(&fifo);

    // The peer is no longer needed; delete-after-delivery runs last.
    for file in &collected {
        if file.delete_after {
            let _ = std::fs::remove_file(&file.source);
        }
    }
    Ok(())
}

/// Resolves every registered file (expanding search patterns against the
/// source directory) and snapshots the ones marked for copying.
fn collect_files(record: &TransferRecord, report_dir: &Path) -> Vec<CollectedFile> {
    let mut collected = Vec::new();
    for file in &record.files {
        let pattern = file
            .src_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if pattern.contains(['*', '?']) {
            let parent = file.src_path.parent().unwrap_or(Path::new("."));
            let mut matched = false;
            if let Ok(entries) = std::fs::read_dir(parent) {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if !match_pattern(pattern, name) {
                        continue;
                    }
                    matched = true;
                    collected.push(snapshot(
                        &entry.path(),
                        name,
                        &file.description,
                        file.flags,
                        report_dir,
                    ));
                }
            }
            if !matched {
                collected.push(CollectedFile {
                    name: file.dst_name.clone(),
                    source: file.src_path.clone(),
                    description: file.description.clone(),
                    copied: false,
                    missing: true,
                    delete_after: false,
                });
            }
        } else {
            collected.push(snapshot(
                &file.src_path,
                &file.dst_name,
                &file.description,
                file.flags,
                report_dir,
            ));
        }
    }
    collected
}

fn snapshot(
    source: &Path,
    dst_name: &str,
    description: &str,
    flags: FileFlags,
    report_dir: &Path,
) -> CollectedFile {
    let missing = !source.exists();
    let copied = !missing
        && flags.contains(FileFlags::MAKE_COPY)
        && std::fs::copy(source, report_dir.join(dst_name)).is_ok();
    CollectedFile {
        name: dst_name.to_string(),
        source: source.to_path_buf(),
        description: description.to_string(),
        copied,
        missing,
        delete_after: copied && flags.contains(FileFlags::ALLOW_DELETE),
    }
}

/// Minimal `*`/`?` matching against one path component.
fn match_pattern(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    // Iterative backtracking over the last-seen star.
    let (mut p, mut n) = (0usize, 0usize);
    let (mut star, mut star_n) = (None::<usize>, 0usize);
    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_n = n;
            p += 1;
        } else if let Some(sp) = star {
            p = sp + 1;
            star_n += 1;
            n = star_n;
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

/// Writes the one-byte completion signal.  A faulting process that gave up
/// waiting (or died) leaves no reader; that is not the reporter's failure.
fn signal_completion(fifo: &Path) {
    let file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(fifo);
    if let Ok(mut file) = file {
        let _ = file.write_all(&[1]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{SyncFifo, TimeoutManager};
    use crate::shared::configuration::DumpVerbosity;
    use crate::transfer::{RecordSeed, RegisteredFile, TransferWriter};
    use std::time::Duration;

    #[test]
    fn test_match_pattern() {
        assert!(match_pattern("*.log", "app.log"));
        assert!(match_pattern("app.?og", "app.log"));
        assert!(match_pattern("*", "anything"));
        assert!(match_pattern("a*b*c", "aXXbYYc"));
        assert!(!match_pattern("*.log", "app.txt"));
        assert!(!match_pattern("app.?og", "app.og"));
        assert!(match_pattern("", ""));
        assert!(!match_pattern("", "x"));
    }

    #[test]
    fn test_end_to_end_collection() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("dump");
        let logs_dir = output_dir.join("logs");
        std::fs::create_dir_all(&logs_dir).unwrap();

        let log_path = dir.path().join("session.log");
        std::fs::write(&log_path, b"line one\n").unwrap();
        std::fs::write(dir.path().join("a.trace"), b"t1").unwrap();
        std::fs::write(dir.path().join("b.trace"), b"t2").unwrap();

        let crash_id = uuid::Uuid::new_v4().to_string();
        let seed = RecordSeed {
            crash_id: crash_id.clone(),
            app_name: "collector-test".into(),
            app_version: "9.9".into(),
            image_path: "/usr/bin/collector-test".into(),
            output_dir: output_dir.to_string_lossy().into_owned(),
            server_url: None,
            symbol_helper_path: None,
            dump_verbosity: DumpVerbosity::Normal,
            process_id: std::process::id(),
        };
        let mut writer = TransferWriter::begin(&seed).unwrap();
        writer
            .pack_file_item(&RegisteredFile {
                src_path: log_path.clone(),
                dst_name: "session.log".into(),
                description: "session log".into(),
                flags: FileFlags::MAKE_COPY,
            })
            .unwrap();
        writer
            .pack_file_item(&RegisteredFile {
                src_path: dir.path().join("*.trace"),
                dst_name: "traces".into(),
                description: "trace files".into(),
                flags: FileFlags::MAKE_COPY,
            })
            .unwrap();
        writer
            .pack_file_item(&RegisteredFile {
                src_path: dir.path().join("absent.dat"),
                dst_name: "absent.dat".into(),
                description: String::new(),
                flags: FileFlags::MISSING_FILE_OK,
            })
            .unwrap();
        writer.pack_property("stage", "test").unwrap();
        writer.mark_crashed();

        let fifo_path = sync_fifo_path(&logs_dir, &crash_id);
        let fifo = SyncFifo::create(&fifo_path).unwrap();

        reporter_entry_point(&crash_id, Some(&fifo_path)).unwrap();

        // The completion signal arrived.
        let manager = TimeoutManager::new(Duration::from_secs(5));
        assert!(fifo.wait_signalled(&manager).unwrap());

        let report_dir = output_dir.join(&crash_id);
        assert!(report_dir.join("session.log").is_file());
        assert!(report_dir.join("a.trace").is_file());
        assert!(report_dir.join("b.trace").is_file());
        assert!(!report_dir.join("absent.dat").exists());

        let manifest: serde_json::Value =
            serde_json::from_reader(std::fs::File::open(report_dir.join("crashdesc.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["record"]["app_name"], "collector-test");
        assert_eq!(manifest["record"]["properties"]["stage"], "test");
        assert_eq!(manifest["record"]["crashed"], true);
        let collected = manifest["collected_files"].as_array().unwrap();
        assert!(collected
            .iter()
            .any(|f| f["name"] == "absent.dat" && f["missing"] == true));
    }

    #[test]
    fn test_signal_completion_without_reader_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        // Not even a fifo; must not panic or block.
        signal_completion(&dir.path().join("nothing.sync"));
    }
}
