//! Relay sink for observed session output.
//!
//! Append-only line writer the controller relays `(session, line)` pairs
//! to. The record format (`HOST,` prefix plus whatever fields the
//! session binaries emit) is owned by the external post-processing
//! scripts; this module only prefixes the host column and never parses
//! the payload.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::session::SessionId;

/// Column header emitted before any records.
const HEADER: &str = "HOST,TIME,CMD,ADDR,COUNT";

/// Append-only output sink.
pub struct RelaySink {
    out: BufWriter<Box<dyn Write + Send>>,
}

impl RelaySink {
    /// Creates a sink over an arbitrary writer and emits the header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written.
    pub fn new(writer: Box<dyn Write + Send>) -> io::Result<Self> {
        let mut out = BufWriter::new(writer);
        writeln!(out, "{HEADER}")?;
        Ok(Self { out })
    }

    /// Creates a sink writing to a file at `path` (truncating).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn to_file(path: &Path) -> io::Result<Self> {
        Self::new(Box::new(File::create(path)?))
    }

    /// Creates a sink writing to stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written.
    pub fn to_stdout() -> io::Result<Self> {
        Self::new(Box::new(io::stdout()))
    }

    /// Appends one observed line, prefixed with its session.
    ///
    /// # Errors
    ///
    /// Returns an error on write failure.
    pub fn relay(&mut self, session: &SessionId, line: &str) -> io::Result<()> {
        writeln!(self.out, "{session},{line}")
    }

    /// Flushes buffered records. Called once at loop exit; a run that
    /// aborts mid-way keeps whatever was already flushed.
    ///
    /// # Errors
    ///
    /// Returns an error on flush failure.
    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn header_then_prefixed_records() {
        let buf = SharedBuf::default();
        let mut sink = RelaySink::new(Box::new(buf.clone())).unwrap();
        sink.relay(&SessionId::new("h3"), "12.5: STARTING [a,1]")
            .unwrap();
        sink.relay(&SessionId::new("srv1"), "12.6: AUTO_ASSIGNED [b,2]")
            .unwrap();
        sink.flush().unwrap();

        let written = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(
            lines,
            vec![
                "HOST,TIME,CMD,ADDR,COUNT",
                "h3,12.5: STARTING [a,1]",
                "srv1,12.6: AUTO_ASSIGNED [b,2]",
            ]
        );
    }
}
