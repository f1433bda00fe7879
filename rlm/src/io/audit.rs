//! Append-only audit log.
//!
//! One human-readable, newline-terminated line per record (`EXECUTING:`,
//! `OBSERVATION:`, `THOUGHT:`, `SELF_HEAL:`). A log without a configured path
//! is a silent no-op. Write failures are traced and swallowed; observability
//! never fails a step.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::warn;

#[derive(Debug, Default)]
pub struct AuditLog {
    sink: Option<Sink>,
}

#[derive(Debug)]
struct Sink {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    /// A log that drops every record.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create audit log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        Ok(Self {
            sink: Some(Sink {
                path: path.to_path_buf(),
                file: Mutex::new(file),
            }),
        })
    }

    /// Open when a path is configured; otherwise disabled.
    pub fn from_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::open(path),
            None => Ok(Self::disabled()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|sink| sink.path.as_path())
    }

    /// Append one record. Embedded newlines are flattened so a record stays one line.
    pub fn append(&self, record: &str) {
        let Some(sink) = &self.sink else {
            return;
        };
        let mut line = record.trim_end().replace(['\r', '\n'], " ");
        line.push('\n');
        let mut file = match sink.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = file.write_all(line.as_bytes()) {
            warn!(path = %sink.path.display(), err = %err, "audit log append failed");
        }
    }
}
