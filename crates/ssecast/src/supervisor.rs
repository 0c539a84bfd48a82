//! Starting server instances and holding the controller side of them.
//!
//! Two isolation modes share one reactor:
//!
//! - **Thread mode** ([`start`], [`start_with_config`]): the reactor runs on a
//!   named thread of the calling process. The returned [`ControlHandle`]
//!   owns the control pipe's write end.
//! - **Process mode** ([`spawn_worker`]): the reactor runs in a separate
//!   `ssecast-worker` process whose stdin is the control pipe. The returned
//!   [`WorkerProcess`] owns that stdin. If the controller dies the kernel
//!   closes the pipe and the worker exits on EOF.
//!
//! In both modes every setup step happens before a handle is returned, so
//! a failure leaves nothing running.

use std::io::{self, BufRead, BufReader, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::unix::pipe::Sender;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::control;
use crate::errors::{ReactorError, SetupError};
use crate::listener;
use crate::loader::{ENV_CLIENT_READ_BUFFER, ENV_EVENT_CAPACITY, ENV_READ_CAPACITY};
use crate::reactor::Reactor;

/// How long [`spawn_worker`] waits for the worker's readiness line.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Start a server on `address:port` with default settings.
pub fn start(address: &str, port: u16) -> Result<ControlHandle, SetupError> {
    start_with_config(ServerConfig::new(address, port))
}

/// Start a server in thread mode.
///
/// Binds, creates the control pipe and the poller on the calling thread,
/// then moves the reactor onto its own thread and returns without waiting
/// for any subscriber.
pub fn start_with_config(config: ServerConfig) -> Result<ControlHandle, SetupError> {
    config.validate()?;
    let listener = listener::bind(&config.host, config.port)?;
    let local_addr = listener.local_addr().map_err(SetupError::LocalAddr)?;
    let (sender, receiver) = control::channel().map_err(SetupError::ControlChannel)?;
    let reactor = Reactor::new(listener, receiver, &config)?;

    let worker = thread::Builder::new()
        .name(format!("ssecast-{}", local_addr.port()))
        .spawn(move || reactor.run())
        .map_err(SetupError::Spawn)?;
    info!(addr = %local_addr, "server started");

    Ok(ControlHandle {
        sender: Some(sender),
        local_addr,
        worker: Some(worker),
    })
}

/// Controller side of a thread-mode server.
///
/// Writes are fire-and-forget: each successful write becomes (at most) one
/// broadcast, with no acknowledgement. Dropping the handle shuts the server
/// down the same way [`ControlHandle::close`] does.
#[derive(Debug)]
pub struct ControlHandle {
    sender: Option<Sender>,
    local_addr: SocketAddr,
    worker: Option<JoinHandle<Result<(), ReactorError>>>,
}

impl ControlHandle {
    /// Address subscribers connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Submit one payload for broadcast. An empty payload sends nothing.
    pub fn broadcast(&mut self, payload: &[u8]) -> io::Result<()> {
        self.write_all(payload)
    }

    /// Whether the worker thread is still running.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Close the control channel and wait for the worker to exit.
    pub fn close(mut self) -> Result<(), ReactorError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), ReactorError> {
        drop(self.sender.take());
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let result = match worker.join() {
            Ok(result) => result,
            Err(_) => Err(ReactorError::WorkerPanicked),
        };
        debug!(addr = %self.local_addr, ok = result.is_ok(), "worker joined");
        result
    }
}

impl Write for ControlHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.sender {
            Some(sender) => sender.write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "control channel closed",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ControlHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(addr = %self.local_addr, error = %e, "worker ended with error");
        }
    }
}

/// Start a server in process mode by running `program` (the
/// `ssecast-worker` binary).
///
/// Host and port go on the command line, capacities through the
/// environment. Returns once the worker has printed its readiness line, or
/// fails with [`SetupError::WorkerNotReady`] (killing the worker) if that
/// takes longer than [`READY_TIMEOUT`].
pub fn spawn_worker(
    program: impl AsRef<Path>,
    config: &ServerConfig,
) -> Result<WorkerProcess, SetupError> {
    config.validate()?;
    let program = program.as_ref();
    let mut child = Command::new(program)
        .arg("--host")
        .arg(&config.host)
        .arg("--port")
        .arg(config.port.to_string())
        .env(ENV_READ_CAPACITY, config.read_capacity.to_string())
        .env(ENV_EVENT_CAPACITY, config.event_capacity.to_string())
        .env(ENV_CLIENT_READ_BUFFER, config.client_read_buffer.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(SetupError::Spawn)?;

    let stdin = child.stdin.take();
    let local_addr = match await_ready(&mut child, READY_TIMEOUT) {
        Ok(addr) => addr,
        Err(e) => {
            drop(stdin);
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
    };
    info!(pid = child.id(), addr = %local_addr, ?program, "worker process started");

    Ok(WorkerProcess {
        child,
        stdin,
        local_addr,
    })
}

/// Read the worker's first stdout line, giving up after `timeout`.
///
/// The read happens on a helper thread. On timeout that thread stays
/// blocked until the caller kills the worker and its stdout closes.
fn await_ready(child: &mut Child, timeout: Duration) -> Result<SocketAddr, SetupError> {
    let stdout = child.stdout.take().ok_or(SetupError::WorkerNotReady)?;
    let (tx, rx) = mpsc::channel();
    let _ = thread::Builder::new()
        .name("ssecast-ready".into())
        .spawn(move || {
            let mut line = String::new();
            let read = BufReader::new(stdout).read_line(&mut line);
            let _ = tx.send(read.map(|n| (n, line)));
        })
        .map_err(SetupError::Spawn)?;

    let (n, line) = match rx.recv_timeout(timeout) {
        Ok(read) => read.map_err(SetupError::Spawn)?,
        Err(_) => {
            warn!(pid = child.id(), ?timeout, "worker did not report readiness in time");
            return Err(SetupError::WorkerNotReady);
        }
    };
    if n == 0 {
        return Err(SetupError::WorkerNotReady);
    }
    control::parse_ready_line(&line)
        .ok_or_else(|| SetupError::BadReadyLine(line.trim_end().to_string()))
}

/// Controller side of a process-mode server.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    local_addr: SocketAddr,
}

impl WorkerProcess {
    /// Address subscribers connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// OS process id of the worker.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Submit one payload for broadcast. An empty payload sends nothing.
    pub fn broadcast(&mut self, payload: &[u8]) -> io::Result<()> {
        self.write_all(payload)
    }

    /// Close the worker's stdin and wait for it to exit.
    pub fn close(mut self) -> io::Result<ExitStatus> {
        drop(self.stdin.take());
        self.child.wait()
    }
}

impl Write for WorkerProcess {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.stdin {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "control channel closed",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            match self.child.wait() {
                Ok(status) => debug!(pid = self.child.id(), %status, "worker process exited"),
                Err(e) => warn!(pid = self.child.id(), error = %e, "failed to reap worker process"),
            }
        }
    }
}

/// Build the reactor for a worker process: stdin is the control channel.
pub fn worker_reactor(config: &ServerConfig) -> Result<Reactor, SetupError> {
    config.validate()?;
    let receiver = control::stdin_receiver().map_err(SetupError::ControlChannel)?;
    let listener = listener::bind(&config.host, config.port)?;
    Reactor::new(listener, receiver, config)
}
