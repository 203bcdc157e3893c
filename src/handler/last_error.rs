// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A per-thread stack of human-readable error lines describing the most
//! recent failed operation.  Each public entry point clears it before doing
//! any work, so the content always refers to the last call made on the
//! current thread.

use std::cell::RefCell;

thread_local! {
    static LAST_ERROR: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn clear() {
    LAST_ERROR.with(|e| e.borrow_mut().clear());
}

pub(crate) fn push(line: impl Into<String>) {
    LAST_ERROR.with(|e| e.borrow_mut().push(line.into()));
}

/// The accumulated lines, most general first, joined with newlines.
pub(crate) fn message() -> String {
    LAST_ERROR.with(|e| e.borrow().join("\n"))
}
