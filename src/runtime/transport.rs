//! Byte-stream transport with per-direction deadlines.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// A connected byte stream whose blocking reads and writes can be bounded.
///
/// `None` removes the deadline. A zero duration is never passed.
pub trait Transport: Read + Write {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}
