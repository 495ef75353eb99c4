//! Append-only JSONL log file.
//!
//! Each event holds the file lock for its whole line and flushes when the
//! line is done, so concurrent writers never interleave partial lines.

use parking_lot::{Mutex, MutexGuard};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::MakeWriter;

const LINE_BUFFER_CAPACITY: usize = 8192;

/// Shared JSONL sink handed to [`crate::JsonLayer`].
pub struct JsonlFile {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl JsonlFile {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(BufWriter::with_capacity(LINE_BUFFER_CAPACITY, file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for JsonlFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlFile").field("path", &self.path).finish()
    }
}

/// One log line in progress; flushed to disk on drop.
pub struct JsonlLine<'a> {
    file: MutexGuard<'a, BufWriter<File>>,
}

impl Write for JsonlLine<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for JsonlLine<'_> {
    fn drop(&mut self) {
        let _ = self.file.flush();
    }
}

impl<'a> MakeWriter<'a> for JsonlFile {
    type Writer = JsonlLine<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        JsonlLine {
            file: self.file.lock(),
        }
    }
}
