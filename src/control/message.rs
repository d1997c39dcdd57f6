//! Message-framed control over a Unix seqpacket socket
//!
//! Every command is one message and every reply is one message. A reply
//! holds `ready`, `= <value>` or `error ...`; multi-line replies are
//! accepted if the peer sends them.

use super::fd_passing::send_with_fd;
use super::{parse_reply_line, ControlTransport, ReplyLine};
use crate::error::{CaptureError, Result, ResultExt};
use nix::sys::socket::{
    connect, recv, send, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr,
};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

const MAX_REPLY: usize = 4096;

pub struct MessageTransport {
    socket: OwnedFd,
    buf: Vec<u8>,
}

impl MessageTransport {
    /// Connect to `path`, retrying while the peer is not yet listening, and
    /// wait for the initial `ready`.
    pub fn connect(path: &Path, attempts: u32, delay: Duration) -> Result<Self> {
        let attempts = attempts.max(1);
        let addr = UnixAddr::new(path)?;
        for attempt in 1..=attempts {
            let fd = socket(
                AddressFamily::Unix,
                SockType::SeqPacket,
                SockFlag::SOCK_CLOEXEC,
                None,
            )?;
            match connect(fd.as_raw_fd(), &addr) {
                Ok(()) => {
                    tracing::debug!("Connected to {:?} on attempt {}", path, attempt);
                    return Self::from_socket(fd);
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

    /// Use a connected seqpacket socket and wait for `ready`
    pub fn from_socket(socket: OwnedFd) -> Result<Self> {
        let mut transport = Self {
            socket,
            buf: vec![0u8; MAX_REPLY],
        };
        match transport.read_reply().context("Control handshake failed")? {
            None => Ok(transport),
            Some(v) => Err(CaptureError::protocol(format!(
                "expected ready, got value {:?}",
                v
            ))),
        }
    }

    fn read_reply(&mut self) -> Result<Option<String>> {
        let n = recv(self.socket.as_raw_fd(), &mut self.buf, MsgFlags::empty())?;
        if n == 0 {
            return Err(CaptureError::protocol("peer closed the control connection"));
        }
        let text = String::from_utf8_lossy(&self.buf[..n]);
        let mut value = None;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match parse_reply_line(line)? {
                ReplyLine::Value(v) => value = Some(v),
                ReplyLine::Ready => return Ok(value),
            }
        }
        match value {
            Some(v) => Ok(Some(v)),
            None => Err(CaptureError::protocol(format!("empty reply {:?}", text))),
        }
    }
}

impl ControlTransport for MessageTransport {
    fn request(&mut self, command: &str) -> Result<Option<String>> {
        send(self.socket.as_raw_fd(), command.as_bytes(), MsgFlags::empty())
            .map_err(CaptureError::from)
            .with_context(|| format!("Failed to send {:?}", command))?;
        self.read_reply()
    }

    fn request_with_fd(&mut self, command: &str, fd: &OwnedFd) -> Result<Option<String>> {
        send_with_fd(self.socket.as_fd(), command.as_bytes(), fd.as_fd())
            .with_context(|| format!("Failed to send {:?}", command))?;
        self.read_reply()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::fd_passing::recv_with_fd;
    use nix::sys::socket::socketpair;

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    fn reply(peer: &OwnedFd, text: &str) {
        send(peer.as_raw_fd(), text.as_bytes(), MsgFlags::empty()).unwrap();
    }

    #[test]
    fn test_single_message_replies() {
        let (ours, peer) = pair();
        reply(&peer, "ready");
        reply(&peer, "= 32000000");
        reply(&peer, "ready");
        let mut t = MessageTransport::from_socket(ours).unwrap();
        assert_eq!(t.request("clockrate?").unwrap(), Some("32000000".into()));
        assert_eq!(t.request("start_capture").unwrap(), None);

        let mut buf = [0u8; 64];
        let n = recv(peer.as_raw_fd(), &mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(&buf[..n], b"clockrate?");
    }

    #[test]
    fn test_error_message() {
        let (ours, peer) = pair();
        reply(&peer, "ready");
        reply(&peer, "error: no such output");
        let mut t = MessageTransport::from_socket(ours).unwrap();
        let err = t.request("remove_output x").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fd_travels_with_command() {
        let (ours, peer) = pair();
        reply(&peer, "ready");
        reply(&peer, "ready");
        let mut t = MessageTransport::from_socket(ours).unwrap();
        let (sink, _source) = std::os::unix::net::UnixStream::pair().unwrap();
        t.request_with_fd("add_output a", &OwnedFd::from(sink))
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, fd) = recv_with_fd(peer.as_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"add_output a");
        assert!(fd.is_some());
    }

    #[test]
    fn test_bad_greeting() {
        let (ours, peer) = pair();
        reply(&peer, "hello");
        assert!(MessageTransport::from_socket(ours).is_err());
    }
}
