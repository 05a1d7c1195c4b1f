// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Redaction of registered secrets from log-bound text.
//!
//! Database root passwords and the repository password are registered when
//! loaded; any string that may embed them (command lines, error chains) is
//! passed through [`redact`] before logging. The registry is copy-on-write
//! behind a multi-reader lock since registration is rare and reads are hot.

use std::sync::{Arc, OnceLock, RwLock};

static SECRETS: OnceLock<RwLock<Arc<Vec<String>>>> = OnceLock::new();

fn registry() -> &'static RwLock<Arc<Vec<String>>> {
    SECRETS.get_or_init(|| RwLock::new(Arc::new(Vec::new())))
}

/// Registers a value to be replaced with `[redacted]` by [`redact`].
/// Empty values are ignored.
pub fn register_secret(value: impl Into<String>) {
    let value = value.into();
    if value.is_empty() {
        return;
    }
    let mut guard = registry().write().expect("secret registry lock poisoned");
    if guard.contains(&value) {
        return;
    }
    let mut next = Vec::clone(&guard);
    next.push(value);
    *guard = Arc::new(next);
}

/// Replaces every registered secret occurring in `text` with `[redacted]`.
pub fn redact(text: impl Into<String>) -> String {
    let mut text = text.into();
    let secrets = registry()
        .read()
        .expect("secret registry lock poisoned")
        .clone();
    for secret in secrets.iter() {
        if text.contains(secret.as_str()) {
            text = text.replace(secret.as_str(), "[redacted]");
        }
    }
    text
}
