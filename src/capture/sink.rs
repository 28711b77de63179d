use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Destination for one output's chunks over a capture round.
///
/// The coordinator calls `begin_round` before arming, `accept` from the
/// delivery thread for every chunk, then `take_output` once the frame is
/// complete or `abandon` if the round timed out.
pub trait OutputSink: Send {
    type Output;

    /// Discard anything left from the previous round and get ready for a new frame.
    fn begin_round(&mut self) -> io::Result<()>;

    /// Append one chunk. Returns `true` once the frame is complete.
    fn accept(&mut self, data: &[u8], end_of_frame: bool) -> bool;

    fn is_complete(&self) -> bool;

    /// Bytes accepted so far this round.
    fn bytes_accepted(&self) -> usize;

    /// Hand over the finished frame.
    fn take_output(&mut self) -> io::Result<Self::Output>;

    /// Release per-round resources after a timeout.
    fn abandon(&mut self) {}
}

/// A sink shared between the capturing thread and a delivery callback.
pub type SharedSink<S> = Arc<Mutex<S>>;

pub fn shared<S: OutputSink>(sink: S) -> SharedSink<S> {
    Arc::new(Mutex::new(sink))
}

/// Build `dir/{prefix}_{local ISO-8601 timestamp with microseconds}.{ext}`.
pub fn timestamped_path(dir: &Path, prefix: &str, ext: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f");
    dir.join(format!("{prefix}_{stamp}.{ext}"))
}

/// Create `path` for writing, failing if it already exists so a name
/// collision never overwrites an earlier round.
fn create_exclusive(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Accumulates a frame in one growable buffer.
#[derive(Debug, Default)]
pub struct MemorySink {
    buffer: Vec<u8>,
    complete: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bytes accumulated so far this round.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl OutputSink for MemorySink {
    type Output = Vec<u8>;

    fn begin_round(&mut self) -> io::Result<()> {
        self.buffer.clear();
        self.complete = false;
        Ok(())
    }

    fn accept(&mut self, data: &[u8], end_of_frame: bool) -> bool {
        if self.complete {
            return true;
        }
        self.buffer.extend_from_slice(data);
        self.complete = end_of_frame;
        self.complete
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn bytes_accepted(&self) -> usize {
        self.buffer.len()
    }

    fn take_output(&mut self) -> io::Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.buffer))
    }
}

/// Streams each round's frame into a freshly created, timestamp-named file.
pub struct FileSink {
    dir: PathBuf,
    prefix: String,
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    written: usize,
    complete: bool,
    error: Option<io::Error>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            path: None,
            writer: None,
            written: 0,
            complete: false,
            error: None,
        }
    }

    /// File the current (or last) round writes to.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                self.error.get_or_insert(e);
            }
        }
    }
}

impl OutputSink for FileSink {
    type Output = PathBuf;

    fn begin_round(&mut self) -> io::Result<()> {
        self.close();
        let path = timestamped_path(&self.dir, &self.prefix, "jpg");
        let file = create_exclusive(&path)?;
        debug!("opened {}", path.display());
        self.writer = Some(BufWriter::new(file));
        self.path = Some(path);
        self.written = 0;
        self.complete = false;
        self.error = None;
        Ok(())
    }

    fn accept(&mut self, data: &[u8], end_of_frame: bool) -> bool {
        if self.complete {
            return true;
        }
        if let Some(writer) = self.writer.as_mut() {
            match writer.write_all(data) {
                Ok(()) => self.written += data.len(),
                Err(e) => {
                    warn!("write to {:?} failed: {e}", self.path);
                    self.error.get_or_insert(e);
                    self.writer = None;
                }
            }
        }
        if end_of_frame {
            self.close();
            self.complete = true;
        }
        self.complete
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn bytes_accepted(&self) -> usize {
        self.written
    }

    fn take_output(&mut self) -> io::Result<PathBuf> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        match (&self.path, self.complete) {
            (Some(path), true) => Ok(path.clone()),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "frame did not complete",
            )),
        }
    }

    fn abandon(&mut self) {
        self.close();
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        self.close();
    }
}
