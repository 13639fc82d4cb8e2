/// Failure reporting for host callbacks.
///
/// Host code (`on_select`, mode/open listeners) runs inside `guard`, which
/// turns both `Err` returns and panics into a report plus `None`, so a
/// misbehaving callback can never unwind through the palette state machine.
///
/// Reports go to an `ErrorReporter`: `TracingReporter` logs them, and
/// `JsonlReporter` appends one record per failure to
/// `~/.local/share/cmdk/errors.jsonl`.
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::Cell;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use crate::storage::data_dir;

pub trait ErrorReporter: Send + Sync {
    fn capture(&self, error: &anyhow::Error, context: &str);
}

// ── Reporters ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn capture(&self, error: &anyhow::Error, context: &str) {
        tracing::error!(context, "host callback failed: {error:#}");
    }
}

/// One line in the errors file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: i64,
    pub context: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct JsonlReporter {
    path: PathBuf,
}

impl Default for JsonlReporter {
    fn default() -> Self {
        Self::new(data_dir().join("errors.jsonl"))
    }
}

impl JsonlReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_append(&self, record: &ErrorRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl ErrorReporter for JsonlReporter {
    /// Write errors are ignored: reporting must never become a failure itself.
    fn capture(&self, error: &anyhow::Error, context: &str) {
        let record = ErrorRecord {
            timestamp: Utc::now().timestamp(),
            context: context.to_string(),
            message: format!("{error:#}"),
        };
        let _ = self.try_append(&record);
    }
}

/// Load every record from a JSONL errors file, oldest first.
pub fn load_records(path: &Path) -> Vec<ErrorRecord> {
    let Ok(content) = std::fs::read_to_string(path) else { return Vec::new() };
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

// ── Guard ─────────────────────────────────────────────────────────────────────

thread_local! {
    static GUARD_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether the current thread is inside `guard`. Panic hooks use this to
/// tell a contained callback panic from one that will end the process.
pub fn in_guard() -> bool {
    GUARD_DEPTH.with(|depth| depth.get() > 0)
}

/// Run a host callback, reporting `Err` and panics instead of propagating them.
pub fn guard<T>(
    reporter: &dyn ErrorReporter,
    context: &str,
    f: impl FnOnce() -> Result<T>,
) -> Option<T> {
    GUARD_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    GUARD_DEPTH.with(|depth| depth.set(depth.get() - 1));
    match outcome {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            reporter.capture(&e, context);
            None
        }
        Err(payload) => {
            let e = anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref()));
            reporter.capture(&e, context);
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<(String, String)>>);

    impl ErrorReporter for Capture {
        fn capture(&self, error: &anyhow::Error, context: &str) {
            self.0.lock().unwrap().push((context.to_string(), format!("{error:#}")));
        }
    }

    #[test]
    fn test_guard_passes_values_through() {
        let reporter = Capture::default();
        assert_eq!(guard(&reporter, "ok", || Ok(5)), Some(5));
        assert!(reporter.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_guard_reports_errors() {
        let reporter = Capture::default();
        let out: Option<()> = guard(&reporter, "on_select:deploy", || anyhow::bail!("no creds"));
        assert!(out.is_none());
        let seen = reporter.0.lock().unwrap();
        assert_eq!(seen[0].0, "on_select:deploy");
        assert!(seen[0].1.contains("no creds"));
    }

    #[test]
    fn test_guard_contains_panics() {
        let reporter = Capture::default();
        let out: Option<()> = guard(&reporter, "on_open_change", || panic!("host bug"));
        assert!(out.is_none());
        assert!(reporter.0.lock().unwrap()[0].1.contains("host bug"));
        assert!(!in_guard());
    }

    #[test]
    fn test_in_guard_tracks_nesting() {
        let reporter = Capture::default();
        assert!(!in_guard());
        let inner = guard(&reporter, "outer", || {
            let nested = guard(&reporter, "inner", || Ok(in_guard()));
            Ok((nested, in_guard()))
        });
        assert_eq!(inner, Some((Some(true), true)));
        assert!(!in_guard());
    }

    #[test]
    fn test_jsonl_reporter_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("errors.jsonl");
        let reporter = JsonlReporter::new(&path);
        reporter.capture(&anyhow::anyhow!("first"), "a");
        reporter.capture(&anyhow::anyhow!("second"), "b");
        let records = load_records(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].context, "a");
        assert_eq!(records[1].message, "second");
    }

    #[test]
    fn test_jsonl_reporter_swallows_write_failures() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        // Parent is a regular file, so create_dir_all fails.
        let reporter = JsonlReporter::new(blocker.join("errors.jsonl"));
        reporter.capture(&anyhow::anyhow!("lost"), "ctx");
        assert!(load_records(reporter.path()).is_empty());
    }
}
