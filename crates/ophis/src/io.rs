//! Host output plumbing for the `print` native.
//!
//! The dispatch loop never blocks on I/O; `print` hands its formatted text
//! to a host-provided [`PrintWriter`] and control returns to the loop
//! immediately. Embedders capture or redirect output by supplying their own
//! implementation.

use std::{
    borrow::Cow,
    io::Write as _,
};

use crate::exceptions::Exception;

/// Trait for handling output from the `print()` native.
pub trait PrintWriter {
    /// Called once for each formatted argument passed to `print()`.
    ///
    /// Writes only the given argument's text; separators and the trailing
    /// newline are emitted via [`PrintWriter::stdout_push`].
    fn stdout_write(&mut self, output: Cow<'_, str>) -> Result<(), Exception>;

    /// Adds a single character (separator or terminator) to the output.
    fn stdout_push(&mut self, end: char) -> Result<(), Exception>;
}

/// Default writer: standard output.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) -> Result<(), Exception> {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(output.as_bytes());
        Ok(())
    }

    fn stdout_push(&mut self, end: char) -> Result<(), Exception> {
        let mut buf = [0u8; 4];
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(end.encode_utf8(&mut buf).as_bytes());
        Ok(())
    }
}

/// Writer that discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn stdout_write(&mut self, _output: Cow<'_, str>) -> Result<(), Exception> {
        Ok(())
    }

    fn stdout_push(&mut self, _end: char) -> Result<(), Exception> {
        Ok(())
    }
}

/// Writer that collects output into a string, for tests and capture.
#[derive(Debug, Default)]
pub struct CollectStringPrint {
    output: String,
}

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything written so far.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Consumes the writer, returning the collected output.
    #[must_use]
    pub fn into_output(self) -> String {
        self.output
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) -> Result<(), Exception> {
        self.output.push_str(&output);
        Ok(())
    }

    fn stdout_push(&mut self, end: char) -> Result<(), Exception> {
        self.output.push(end);
        Ok(())
    }
}
