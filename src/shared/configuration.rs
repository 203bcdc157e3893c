// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::constants;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Bitmask selecting which fault categories the installer hooks.
///
/// The bit layout is part of the host-facing contract; a zero mask means
/// "install everything".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HookMask(pub u32);

impl HookMask {
    pub const STRUCTURED_EXCEPTION: HookMask = HookMask(0x1);
    pub const TERMINATE_CALL: HookMask = HookMask(0x2);
    pub const UNEXPECTED_CALL: HookMask = HookMask(0x4);
    pub const PURE_CALL: HookMask = HookMask(0x8);
    pub const ALLOC_FAILURE: HookMask = HookMask(0x10);
    pub const SECURITY: HookMask = HookMask(0x20);
    pub const INVALID_PARAMETER: HookMask = HookMask(0x40);
    pub const SIGABRT: HookMask = HookMask(0x80);
    pub const SIGFPE: HookMask = HookMask(0x100);
    pub const SIGILL: HookMask = HookMask(0x200);
    pub const SIGINT: HookMask = HookMask(0x400);
    pub const SIGSEGV: HookMask = HookMask(0x800);
    pub const SIGTERM: HookMask = HookMask(0x1000);
    pub const ALL: HookMask = HookMask(0xFFFF);

    pub const fn contains(self, other: HookMask) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The effective mask: an empty mask defaults to all categories.
    pub const fn or_all(self) -> HookMask {
        if self.is_empty() {
            HookMask::ALL
        } else {
            self
        }
    }
}

impl Default for HookMask {
    fn default() -> Self {
        HookMask::ALL
    }
}

impl std::ops::BitOr for HookMask {
    type Output = HookMask;
    fn bitor(self, rhs: HookMask) -> HookMask {
        HookMask(self.0 | rhs.0)
    }
}

/// How much process state the reporter should capture in the dump.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DumpVerbosity {
    /// Stack and registers of the faulting thread only.
    Minimal,
    #[default]
    Normal,
    /// Full memory of the process.  Expensive, and the resulting report may
    /// contain sensitive data.
    Full,
}

/// Install-time configuration of the crash handler.  Immutable once the
/// handler is installed.
///
/// Empty/absent fields whose defaults depend on the process image (app name,
/// reporter path, output directory) are resolved during `install()`, not
/// here; the application version has no derivable default on unix and is
/// therefore required up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashConfiguration {
    app_name: String,
    app_version: String,
    reporter_path: Option<PathBuf>,
    symbol_helper_path: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    dump_verbosity: DumpVerbosity,
    hooks: HookMask,
    server_url: Option<String>,
    reporter_timeout: Duration,
    create_alt_stack: bool,
    // Suppress the local stderr notification when the reporter fails to
    // launch (headless hosts).
    silent: bool,
}

impl CrashConfiguration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        reporter_path: Option<PathBuf>,
        symbol_helper_path: Option<PathBuf>,
        output_dir: Option<PathBuf>,
        dump_verbosity: DumpVerbosity,
        hooks: HookMask,
        server_url: Option<String>,
        reporter_timeout: Option<Duration>,
        create_alt_stack: bool,
        silent: bool,
    ) -> anyhow::Result<Self> {
        let app_version = app_version.into();
        anyhow::ensure!(
            !app_version.trim().is_empty(),
            "Application version is required and cannot be derived on this platform"
        );
        Ok(Self {
            app_name: app_name.into(),
            app_version,
            reporter_path,
            symbol_helper_path,
            output_dir,
            dump_verbosity,
            hooks: hooks.or_all(),
            server_url,
            reporter_timeout: reporter_timeout.unwrap_or(constants::DEFAULT_REPORTER_TIMEOUT),
            create_alt_stack,
            silent,
        })
    }

    /// Minimal configuration: everything else at its default.
    pub fn with_defaults(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Self::new(
            app_name,
            app_version,
            None,
            None,
            None,
            DumpVerbosity::default(),
            HookMask::ALL,
            None,
            None,
            true,
            false,
        )
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    pub fn reporter_path(&self) -> Option<&PathBuf> {
        self.reporter_path.as_ref()
    }

    pub fn symbol_helper_path(&self) -> Option<&PathBuf> {
        self.symbol_helper_path.as_ref()
    }

    pub fn output_dir(&self) -> Option<&PathBuf> {
        self.output_dir.as_ref()
    }

    pub fn dump_verbosity(&self) -> DumpVerbosity {
        self.dump_verbosity
    }

    pub fn hooks(&self) -> HookMask {
        self.hooks
    }

    pub fn server_url(&self) -> Option<&String> {
        self.server_url.as_ref()
    }

    pub fn reporter_timeout(&self) -> Duration {
        self.reporter_timeout
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn silent(&self) -> bool {
        self.silent
    }

    pub fn set_output_dir(&mut self, dir: PathBuf) {
        self.output_dir = Some(dir);
    }

    pub fn set_reporter_path(&mut self, path: PathBuf) {
        self.reporter_path = Some(path);
    }

    pub fn set_app_name(&mut self, name: String) {
        self.app_name = name;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_required() {
        let cfg = CrashConfiguration::with_defaults("demo", "");
        assert!(cfg.is_err());
        let cfg = CrashConfiguration::with_defaults("demo", "   ");
        assert!(cfg.is_err());
        let cfg = CrashConfiguration::with_defaults("demo", "1.0.0").unwrap();
        assert_eq!(cfg.app_version(), "1.0.0");
    }

    #[test]
    fn test_empty_mask_defaults_to_all() {
        let cfg = CrashConfiguration::new(
            "demo",
            "1.0.0",
            None,
            None,
            None,
            DumpVerbosity::Normal,
            HookMask(0),
            None,
            None,
            false,
            true,
        )
        .unwrap();
        assert_eq!(cfg.hooks(), HookMask::ALL);
    }

    #[test]
    fn test_mask_contains() {
        let mask = HookMask::SIGABRT | HookMask::SIGSEGV;
        assert!(mask.contains(HookMask::SIGABRT));
        assert!(mask.contains(HookMask::SIGSEGV));
        assert!(!mask.contains(HookMask::SIGINT));
        assert!(HookMask::ALL.contains(HookMask::STRUCTURED_EXCEPTION));
    }

    #[test]
    fn test_default_timeout_applied() {
        let cfg = CrashConfiguration::with_defaults("demo", "1.0.0").unwrap();
        assert_eq!(cfg.reporter_timeout(), constants::DEFAULT_REPORTER_TIMEOUT);
    }

    #[test]
    fn test_configuration_round_trips_through_json() {
        let cfg = CrashConfiguration::with_defaults("demo", "1.0.0").unwrap();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: CrashConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
