//! Line-framed control over a Unix stream socket

use super::fd_passing::send_with_fd;
use super::{parse_reply_line, ControlTransport, ReplyLine};
use crate::error::{CaptureError, Result, ResultExt};
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

/// Control transport speaking newline-terminated commands
pub struct StreamTransport {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl StreamTransport {
    /// Connect to `path`, retrying while the peer is not yet listening.
    ///
    /// Waits for the peer's greeting: an optional banner line followed by
    /// `ready`.
    pub fn connect(path: &Path, attempts: u32, delay: Duration) -> Result<Self> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match UnixStream::connect(path) {
                Ok(stream) => {
                    tracing::debug!("Connected to {:?} on attempt {}", path, attempt);
                    return Self::from_stream(stream);
                }
                Err(e) => {
                    tracing::debug!(
                        "Connection to {:?} failed ({}/{}): {}",
                        path,
                        attempt,
                        attempts,
                        e
                    );
                    if attempt < attempts {
                        std::thread::sleep(delay);
                    }
                }
            }
        }
        Err(CaptureError::Connection {
            path: path.to_path_buf(),
            attempts,
        })
    }

    /// Use an already connected stream and perform the greeting
    pub fn from_stream(stream: UnixStream) -> Result<Self> {
        let reader = BufReader::new(stream.try_clone().context("Failed to clone control socket")?);
        let mut transport = Self {
            writer: stream,
            reader,
        };
        transport.greet()?;
        Ok(transport)
    }

    fn greet(&mut self) -> Result<()> {
        let first = self.read_line()?;
        if first.trim() == "ready" {
            return Ok(());
        }
        tracing::debug!("Peer banner: {}", first.trim());
        match parse_reply_line(&self.read_line()?)? {
            ReplyLine::Ready => Ok(()),
            ReplyLine::Value(v) => Err(CaptureError::protocol(format!(
                "expected ready after banner, got value {:?}",
                v
            ))),
        }
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .context("Failed to read from control socket")?;
        if n == 0 {
            return Err(CaptureError::protocol("peer closed the control connection"));
        }
        Ok(line)
    }

    fn read_reply(&mut self) -> Result<Option<String>> {
        let mut value = None;
        loop {
            match parse_reply_line(&self.read_line()?)? {
                ReplyLine::Value(v) => value = Some(v),
                ReplyLine::Ready => return Ok(value),
            }
        }
    }
}

impl ControlTransport for StreamTransport {
    fn request(&mut self, command: &str) -> Result<Option<String>> {
        self.writer
            .write_all(format!("{}\n", command).as_bytes())
            .with_context(|| format!("Failed to send {:?}", command))?;
        self.read_reply()
    }

    fn request_with_fd(&mut self, command: &str, fd: &OwnedFd) -> Result<Option<String>> {
        let line = format!("{}\n", command);
        send_with_fd(self.writer.as_fd(), line.as_bytes(), fd.as_fd())
            .with_context(|| format!("Failed to send {:?}", command))?;
        self.read_reply()
    }
}
