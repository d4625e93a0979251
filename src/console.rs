//! Console output, used in console mode and before a context is ready.

use {
    crate::{sink::LogSink, LogError},
    std::{io, path::PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

/// Writes every message to stdout or stderr behind a fixed prefix.
///
/// There is nothing to rotate or close: [`LogSink::close`] always succeeds
/// and writing keeps working afterwards.
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    stream: ConsoleStream,
    prefix: &'static str,
}

impl ConsoleSink {
    pub const fn new(stream: ConsoleStream, prefix: &'static str) -> Self {
        ConsoleSink { stream, prefix }
    }

    pub const fn info() -> Self {
        ConsoleSink::new(ConsoleStream::Stdout, "[INFO] ")
    }

    pub const fn error() -> Self {
        ConsoleSink::new(ConsoleStream::Stderr, "[ERROR] ")
    }

    pub const fn slow() -> Self {
        ConsoleSink::new(ConsoleStream::Stderr, "[SLOW] ")
    }

    pub fn stream(&self) -> ConsoleStream {
        self.stream
    }

    /// Prefix `buf` and write it to `out` in one call, so lines from
    /// concurrent writers stay whole.
    fn write_to<W: io::Write>(&self, mut out: W, buf: &[u8]) -> io::Result<()> {
        let mut line = Vec::with_capacity(self.prefix.len() + buf.len() + 1);
        line.extend_from_slice(self.prefix.as_bytes());
        line.extend_from_slice(buf);
        if !buf.ends_with(b"\n") {
            line.push(b'\n');
        }
        out.write_all(&line)?;
        out.flush()
    }
}

impl LogSink for ConsoleSink {
    fn write(&self, buf: &[u8]) -> Result<usize, LogError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let res = match self.stream {
            ConsoleStream::Stdout => self.write_to(io::stdout().lock(), buf),
            ConsoleStream::Stderr => self.write_to(io::stderr().lock(), buf),
        };
        res.map_err(|err| LogError::FileIOError {
            path: PathBuf::from(match self.stream {
                ConsoleStream::Stdout => "<stdout>",
                ConsoleStream::Stderr => "<stderr>",
            }),
            error: err.to_string(),
        })?;
        Ok(buf.len())
    }

    fn close(&self) -> Result<(), LogError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_and_terminates_lines() {
        let mut out = Vec::new();
        ConsoleSink::error().write_to(&mut out, b"boom").unwrap();
        assert_eq!(out, b"[ERROR] boom\n");

        let mut out = Vec::new();
        ConsoleSink::info().write_to(&mut out, b"ready\n").unwrap();
        assert_eq!(out, b"[INFO] ready\n");
    }

    #[test]
    fn closing_the_console_is_harmless() {
        let sink = ConsoleSink::slow();
        sink.close().unwrap();
        assert_eq!(sink.write(b"still here").unwrap(), 10);
        assert_eq!(sink.stream(), ConsoleStream::Stderr);
    }
}
