#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod atomic;
pub mod builder;
pub mod config;
pub mod error;
pub mod handlers;
pub mod index;
pub mod signals;
pub mod vcs;
pub mod watcher;

pub use atomic::{clean_orphan_temps, AtomicWriter};
pub use config::{WatchBackend, WatchConfig};
pub use error::{Error, Result};
pub use handlers::{HandlerKind, HandlerSet, Replacements};
pub use index::ReferenceIndex;
pub use signals::{Severity, Signal, SignalHub};
pub use vcs::{CheckoutHook, NoCheckout, PerforceCheckout};
pub use watcher::{WatcherHandle, WatcherService};

use std::path::{Component, Path};

/// Convert an absolute path to a project-relative, forward-slash string.
///
/// Returns `None` when the path is not inside `root`. The original case is
/// preserved; callers lowercase separately when they need a lookup key.
pub fn to_rel_path(root: &Path, abs: &Path) -> Option<String> {
    let rel = abs.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                if !out.is_empty() {
                    out.push('/');
                }
                out.push_str(&part.to_string_lossy());
            },
            Component::CurDir => {},
            _ => return None,
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Lowercased extension of a path, with the leading dot (`".mtl"`).
pub fn ext_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
}
