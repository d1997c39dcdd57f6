//! Control protocol client
//!
//! The acquisition peer is driven by short text commands. Each command gets
//! a reply made of optional `= <value>` lines and a closing `ready`; a line
//! starting with `error` fails the command. Anything else is a protocol
//! violation and ends the session.
//!
//! # Backends
//!
//! | Backend | Transport | Framing |
//! |---------|-----------|---------|
//! | [`StreamTransport`] | Unix stream socket | newline-terminated lines |
//! | [`MessageTransport`] | Unix seqpacket socket | one message per command and reply |
//! | [`SimulatedTagger`] | in process | none |
//!
//! All three implement [`ControlTransport`]. [`ControlLink`] sits on top,
//! caches the session constants and logs every exchange.

pub mod fd_passing;
pub mod message;
pub mod simulator;
pub mod stream;

pub use message::MessageTransport;
pub use simulator::SimulatedTagger;
pub use stream::StreamTransport;

use crate::config::{CaptureConfig, ControlBackend};
use crate::error::{CaptureError, Result, ResultExt};
use std::os::fd::OwnedFd;

/// One parsed reply line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyLine {
    /// `= <value>`
    Value(String),
    /// `ready`
    Ready,
}

/// Parse a single reply line.
///
/// `error ...` lines and unrecognized tokens both become protocol errors.
pub fn parse_reply_line(line: &str) -> Result<ReplyLine> {
    let line = line.trim();
    if line == "ready" {
        Ok(ReplyLine::Ready)
    } else if let Some(value) = line.strip_prefix('=') {
        Ok(ReplyLine::Value(value.trim().to_string()))
    } else if line.starts_with("error") {
        Err(CaptureError::protocol(line))
    } else {
        Err(CaptureError::protocol(format!("unexpected reply {:?}", line)))
    }
}

/// Request/reply transport to the acquisition peer
#[cfg_attr(test, mockall::automock)]
pub trait ControlTransport: Send {
    /// Send a command and wait for its reply. Returns the `= <value>`
    /// payload, if any.
    fn request(&mut self, command: &str) -> Result<Option<String>>;

    /// Like [`request`](Self::request), passing `fd` to the peer alongside
    /// the command
    fn request_with_fd(&mut self, command: &str, fd: &OwnedFd) -> Result<Option<String>>;
}

/// Connect the backend selected in `config`
pub fn connect_transport(config: &CaptureConfig) -> Result<Box<dyn ControlTransport>> {
    let control = &config.control;
    let transport: Box<dyn ControlTransport> = match control.backend {
        ControlBackend::Stream => Box::new(StreamTransport::connect(
            &control.socket_path,
            control.connect_attempts,
            control.connect_delay(),
        )?),
        ControlBackend::Message => Box::new(MessageTransport::connect(
            &control.socket_path,
            control.connect_attempts,
            control.connect_delay(),
        )?),
        ControlBackend::Simulated => Box::new(SimulatedTagger::new(
            &config.simulator,
            config.binner.bin_time,
            config.binner.layout,
        )),
    };
    Ok(transport)
}

/// Session with the acquisition peer
pub struct ControlLink {
    transport: Box<dyn ControlTransport>,
    clockrate: u64,
    version: String,
    capture_running: bool,
}

impl ControlLink {
    /// Wrap a connected transport and query the session constants
    pub fn new(transport: Box<dyn ControlTransport>) -> Result<Self> {
        let mut link = Self {
            transport,
            clockrate: 0,
            version: String::new(),
            capture_running: false,
        };
        let clockrate = link.query("clockrate?")?;
        link.clockrate = parse_clockrate(&clockrate)?;
        link.version = link.query("version?")?;
        tracing::info!(
            "Connected to acquisition peer: clock rate {} Hz, hardware version {}",
            link.clockrate,
            link.version
        );
        Ok(link)
    }

    /// Connect using the configured backend
    pub fn connect(config: &CaptureConfig) -> Result<Self> {
        let transport = connect_transport(config)?;
        Self::new(transport).context("Control handshake failed")
    }

    /// Clock rate in Hz, queried once at connect
    pub fn clockrate(&self) -> u64 {
        self.clockrate
    }

    /// Hardware version string, queried once at connect
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Whether the last start/stop command issued was a start
    pub fn is_capture_running(&self) -> bool {
        self.capture_running
    }

    fn command(&mut self, command: &str) -> Result<Option<String>> {
        tracing::debug!("control -> {}", command);
        let reply = self.transport.request(command);
        log_reply(command, &reply);
        reply
    }

    fn query(&mut self, command: &str) -> Result<String> {
        self.command(command)?
            .ok_or_else(|| CaptureError::protocol(format!("no value in reply to {}", command)))
    }

    pub fn reset_counter(&mut self) -> Result<()> {
        self.command("reset_counter").map(drop)
    }

    pub fn start_capture(&mut self) -> Result<()> {
        self.command("start_capture")?;
        self.capture_running = true;
        Ok(())
    }

    pub fn stop_capture(&mut self) -> Result<()> {
        self.command("stop_capture")?;
        self.capture_running = false;
        Ok(())
    }

    pub fn flush_fifo(&mut self) -> Result<()> {
        self.command("flush_fifo").map(drop)
    }

    /// Set the output flow-control window
    pub fn set_send_window(&mut self, window: u32) -> Result<()> {
        self.command(&format!("set_send_window {}", window)).map(drop)
    }

    /// Register `fd` with the peer as output `id`
    pub fn add_output(&mut self, id: &str, fd: &OwnedFd) -> Result<()> {
        let command = format!("add_output {}", id);
        tracing::debug!("control -> {} (fd attached)", command);
        let reply = self.transport.request_with_fd(&command, fd);
        log_reply(&command, &reply);
        reply.map(drop)
    }

    pub fn remove_output(&mut self, id: &str) -> Result<()> {
        self.command(&format!("remove_output {}", id)).map(drop)
    }

    /// Ask the peer to exit
    pub fn quit(&mut self) -> Result<()> {
        self.command("quit")?;
        self.capture_running = false;
        Ok(())
    }
}

impl std::fmt::Debug for ControlLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLink")
            .field("clockrate", &self.clockrate)
            .field("version", &self.version)
            .field("capture_running", &self.capture_running)
            .finish()
    }
}

fn log_reply(command: &str, reply: &Result<Option<String>>) {
    match reply {
        Ok(Some(value)) => tracing::debug!("control <- {} = {}", command, value),
        Ok(None) => tracing::debug!("control <- {} ready", command),
        Err(e) => tracing::debug!("control <- {} failed: {}", command, e),
    }
}

fn parse_clockrate(value: &str) -> Result<u64> {
    if let Ok(rate) = value.parse::<u64>() {
        return Ok(rate);
    }
    match value.parse::<f64>() {
        Ok(rate) if rate.is_finite() && rate >= 1.0 => Ok(rate.round() as u64),
        _ => Err(CaptureError::protocol(format!("invalid clock rate {:?}", value))),
    }
}
