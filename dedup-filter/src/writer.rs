use std::io::{self, Write};

use dedup_common::Record;
use tracing::warn;

/// When forwarded records are pushed to the underlying writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Flush after every record, so downstream readers see each record as soon as it passes.
    PerRecord,
    /// Leave flushing to the underlying writer and `into_inner`.
    Buffered,
}

/// Writes forwarded records as newline-delimited JSON, in the order they are given.
pub struct RecordWriter<W: Write> {
    out: W,
    mirror: Option<Box<dyn Write>>,
    flush: FlushPolicy,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(out: W, flush: FlushPolicy) -> Self {
        Self {
            out,
            mirror: None,
            flush,
        }
    }

    /// Also copy every record to `mirror`, e.g. stderr when running verbosely.
    /// Failures on the mirror are logged and never fail the write.
    pub fn with_mirror(mut self, mirror: Box<dyn Write>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn write(&mut self, record: &Record) -> io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        self.out.write_all(&line)?;
        if self.flush == FlushPolicy::PerRecord {
            self.out.flush()?;
        }

        if let Some(mirror) = self.mirror.as_mut() {
            if let Err(error) = mirror.write_all(&line).and_then(|()| mirror.flush()) {
                warn!("failed to mirror record: {error}");
            }
        }

        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    /// Flush and hand back the underlying writer.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.flush()?;
        Ok(self.out)
    }
}
