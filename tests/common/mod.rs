//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use timetag_capture::binner::{BinRecord, RecordLayout};
use timetag_capture::control::fd_passing::recv_with_fd;

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// Poll `condition` until it holds or the test timeout passes
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + test_timeout();
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Binning program that copies tagged records straight through
pub fn passthrough_binner(dir: &Path) -> PathBuf {
    let path = dir.join("passthrough_bin");
    std::fs::write(&path, "#!/bin/sh\nexec cat\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[derive(Default)]
struct PeerState {
    commands: Vec<String>,
    outputs: HashMap<String, File>,
}

/// Acquisition peer speaking the control protocol on a Unix stream socket.
///
/// Accepts a single connection. Outputs passed with `add_output` are kept
/// so tests can write records into them.
pub struct FakePeer {
    path: PathBuf,
    state: Arc<Mutex<PeerState>>,
    handle: Option<JoinHandle<()>>,
}

impl FakePeer {
    pub fn spawn(dir: &Path, clockrate: u64) -> Self {
        Self::spawn_failing(dir, clockrate, None)
    }

    /// Like [`spawn`](Self::spawn), but answer `fail_on` with an error line
    pub fn spawn_failing(dir: &Path, clockrate: u64, fail_on: Option<&'static str>) -> Self {
        let path = dir.join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let state = Arc::new(Mutex::new(PeerState::default()));
        let worker_state = Arc::clone(&state);
        let handle = std::thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            serve(stream, clockrate, fail_on, &worker_state);
        });
        Self {
            path,
            state,
            handle: Some(handle),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Commands received so far, without the trailing newline
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn output_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().unwrap().outputs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Write tagged records into output `id`
    pub fn emit(&self, id: &str, records: &[BinRecord]) {
        self.emit_as(id, RecordLayout::Tagged, records);
    }

    /// Write records encoded as `layout` into output `id`
    pub fn emit_as(&self, id: &str, layout: RecordLayout, records: &[BinRecord]) {
        let mut state = self.state.lock().unwrap();
        let output = state.outputs.get_mut(id).expect("no such output");
        for record in records {
            output.write_all(&layout.encode(record)).unwrap();
        }
        output.flush().unwrap();
    }

    /// Wait for the client to hang up
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

fn serve(
    mut stream: UnixStream,
    clockrate: u64,
    fail_on: Option<&'static str>,
    state: &Mutex<PeerState>,
) {
    stream.write_all(b"fake_tagger 0.1\nready\n").unwrap();
    let mut pending = String::new();
    let mut passed_fd = None;
    let mut buf = [0u8; 512];
    loop {
        let Ok((n, fd)) = recv_with_fd(stream.as_fd(), &mut buf) else {
            return;
        };
        if n == 0 {
            return;
        }
        if fd.is_some() {
            passed_fd = fd;
        }
        pending.push_str(&String::from_utf8_lossy(&buf[..n]));

        while let Some(end) = pending.find('\n') {
            let line: String = pending.drain(..=end).collect();
            let command = line.trim().to_string();
            let mut state = state.lock().unwrap();
            state.commands.push(command.clone());

            let reply = if Some(command.as_str()) == fail_on {
                "error: refused\n".to_string()
            } else if command == "clockrate?" {
                format!("= {}\nready\n", clockrate)
            } else if command == "version?" {
                "= 3\nready\n".to_string()
            } else if let Some(id) = command.strip_prefix("add_output ") {
                match passed_fd.take() {
                    Some(fd) => {
                        state.outputs.insert(id.to_string(), File::from(fd));
                        "ready\n".to_string()
                    }
                    None => "error: no descriptor\n".to_string(),
                }
            } else if let Some(id) = command.strip_prefix("remove_output ") {
                match state.outputs.remove(id) {
                    Some(_) => "ready\n".to_string(),
                    None => "error: unknown output\n".to_string(),
                }
            } else {
                "ready\n".to_string()
            };
            drop(state);

            if stream.write_all(reply.as_bytes()).is_err() || command == "quit" {
                return;
            }
        }
    }
}
