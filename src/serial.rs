//! The serial port the demo reports on

use std::io::{self, Write};

/// Prints a formatted line to a [Serial]. Evaluates to an `io::Result<()>`.
///
/// The line is formatted into a fixed buffer first, so one line is written at once.
#[macro_export]
macro_rules! uprintln {
    ($serial:expr, $($arg:tt)*) => {
        {
            use core::fmt::Write as _;
            let mut str = arrayvec::ArrayString::<1024>::new();
            match writeln!(str, $($arg)*) {
                Ok(_) => $serial.write_line(str.as_str()),
                Err(_) => $serial.write_line("Error: failed to print string, too long\n"),
            }
        }
    };
}

/// A line based serial terminal
pub struct Serial<W: Write> {
    port: W,
}

impl<W: Write> Serial<W> {
    pub fn new(port: W) -> Self {
        Self { port }
    }

    /// Writes the line with the terminal's `\r\n` line endings
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\r\n")?;
        self.port.flush()
    }

    /// Writes raw bytes without a line ending
    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    pub fn into_inner(self) -> W {
        self.port
    }
}
