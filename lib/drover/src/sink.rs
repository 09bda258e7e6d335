//! Output sinks for collected results.

use crate::api::OutputSink;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::error;

/// Line-oriented file sink. Buffered; flushed on drop.
pub struct FileSink {
    path: String,
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> Result<FileSink> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| format!("create_dir_all {}", parent.display()))?;
            }
        }
        let file = File::create(path).with_context(|| format!("creating output file {}", path.display()))?;
        Ok(FileSink { path: path.display().to_string(), writer: BufWriter::new(file) })
    }
}

impl OutputSink for FileSink {
    fn append(&mut self, line: &str) -> Result<()> {
        writeln!(self.writer, "{}", line).with_context(|| format!("writing result line to {}", self.path))
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            error!(path = %self.path, "flushing output sink: {}", e);
        }
    }
}

/// In-memory sink. Cloning yields another handle onto the same line buffer,
/// so a test can keep a handle and inspect lines after the run.
#[derive(Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().unwrap().is_empty()
    }
}

impl OutputSink for MemorySink {
    fn append(&mut self, line: &str) -> Result<()> {
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }
}
