//! The single-threaded readiness loop driving one server instance.
//!
//! The reactor owns every piece of instance state: the listening socket,
//! the control channel read end, the client registry and the broadcaster.
//! Only the thread running [`Reactor::run`] touches them, so nothing here
//! is locked.
//!
//! Readiness is edge-triggered. Accept drains the listener until it would
//! block. Ingest and client reads stop after a bounded number of reads and
//! re-register their source so the next wait reports it again.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Duration;

use metrics::counter;
use mio::event::Event;
use mio::net::TcpListener;
use mio::unix::pipe::Receiver;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, trace, warn};

use crate::broadcaster::{Broadcaster, Flush, Ingest};
use crate::config::ServerConfig;
use crate::errors::{ReactorError, SetupError};
use crate::handshake;
use crate::metrics::{SSE_FLUSHES_TOTAL, SSE_HANDSHAKE_FAILURES_TOTAL};
use crate::registry::ClientRegistry;

/// Token of the listening socket.
pub const LISTENER: Token = Token(0);
/// Token of the control channel read end.
pub const CONTROL: Token = Token(1);

/// Reads of subscriber input per readiness event before yielding.
pub const MAX_CLIENT_READS: usize = 16;

/// What the caller should do after a [`Reactor::turn`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Keep going.
    Continue,
    /// The control channel closed; stop now.
    Shutdown,
}

/// Readiness flags copied out of a [`mio::event::Event`].
#[derive(Clone, Copy, Debug)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    read_closed: bool,
    write_closed: bool,
    error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// One server instance's event loop.
pub struct Reactor {
    poll: Poll,
    events: Events,
    ready: Vec<Readiness>,
    listener: TcpListener,
    control: Receiver,
    clients: ClientRegistry,
    broadcaster: Broadcaster,
    inbound: Vec<u8>,
    accepted: u64,
}

impl Reactor {
    /// Register the listener and control channel with a fresh poller.
    pub fn new(
        mut listener: TcpListener,
        mut control: Receiver,
        config: &ServerConfig,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        let poll = Poll::new().map_err(SetupError::Poller)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|source| SetupError::Register {
                what: "listener",
                source,
            })?;
        poll.registry()
            .register(&mut control, CONTROL, Interest::READABLE)
            .map_err(|source| SetupError::Register {
                what: "control channel",
                source,
            })?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity),
            ready: Vec::with_capacity(config.event_capacity),
            listener,
            control,
            clients: ClientRegistry::new(),
            broadcaster: Broadcaster::new(config.read_capacity),
            inbound: vec![0; config.client_read_buffer],
            accepted: 0,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Connected subscribers.
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Outbound message state.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Connections accepted so far, including ones dropped since.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Run until the control channel closes.
    ///
    /// Blocks in the readiness wait with no timeout. Returning drops every
    /// client socket without flushing anything still pending.
    pub fn run(mut self) -> Result<(), ReactorError> {
        info!(addr = ?self.local_addr().ok(), "event loop started");
        loop {
            if self.turn(None)? == Flow::Shutdown {
                info!(
                    clients = self.clients.len(),
                    "control channel closed, shutting down"
                );
                return Ok(());
            }
        }
    }

    /// Wait for readiness once (up to `timeout`) and dispatch the batch.
    ///
    /// Listener and control events are handled before client events, so a
    /// client writable in the same batch as a new message flushes the new one.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<Flow, ReactorError> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(Flow::Continue);
            }
            return Err(ReactorError::Wait(e));
        }

        self.ready.clear();
        self.ready.extend(self.events.iter().map(Readiness::from));
        let ready = std::mem::take(&mut self.ready);

        let mut flow = Flow::Continue;
        for r in ready.iter().filter(|r| r.token == LISTENER || r.token == CONTROL) {
            if r.token == LISTENER {
                self.accept_all();
            } else if self.on_control(r) == Flow::Shutdown {
                flow = Flow::Shutdown;
                break;
            }
        }
        if flow == Flow::Continue {
            for r in ready.iter().filter(|r| r.token != LISTENER && r.token != CONTROL) {
                self.on_client(r);
            }
        }

        self.ready = ready;
        Ok(flow)
    }

    fn accept_all(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if is_transient_accept_error(&e) => {
                    debug!(error = %e, "connection gone before accept");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            };
            self.accepted += 1;

            let token = match self.clients.add(self.poll.registry(), stream, peer) {
                Ok(token) => token,
                Err(e) => {
                    warn!(%peer, error = %e, "failed to register client");
                    continue;
                }
            };
            debug!(token = token.0, %peer, "accepted");
            self.greet(token);
        }
    }

    fn greet(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(token) else {
            return;
        };
        if let Err(e) = handshake::send_header(&mut client.stream) {
            warn!(token = token.0, peer = %client.peer, error = %e, "handshake failed, dropping client");
            counter!(SSE_HANDSHAKE_FAILURES_TOTAL).increment(1);
            let _ = self.clients.remove(self.poll.registry(), token);
        }
    }

    fn on_control(&mut self, r: &Readiness) -> Flow {
        if !(r.readable || r.read_closed || r.error) {
            return Flow::Continue;
        }
        let ingested = self.broadcaster.ingest(&mut self.control);
        if self.broadcaster.is_draining() {
            self.rearm_control();
        }
        match ingested {
            Ok(Ingest::Message { .. }) => {
                let _ = self
                    .broadcaster
                    .fan_out(&mut self.clients, self.poll.registry());
                Flow::Continue
            }
            Ok(Ingest::Empty) => Flow::Continue,
            Ok(Ingest::Closed) => Flow::Shutdown,
            Err(e) => {
                warn!(error = %e, "control channel read failed");
                Flow::Continue
            }
        }
    }

    fn on_client(&mut self, r: &Readiness) {
        if !self.clients.contains(r.token) {
            trace!(token = r.token.0, "event for removed client");
            return;
        }
        if r.error {
            self.drop_client(r.token, "socket error");
            return;
        }
        if (r.readable || r.read_closed) && !self.consume(r.token) {
            return;
        }
        if r.writable {
            self.flush(r.token);
        }
        if r.write_closed && self.clients.contains(r.token) {
            self.drop_client(r.token, "hangup");
        }
    }

    /// Drain and discard subscriber input. Returns `false` if the client was removed.
    fn consume(&mut self, token: Token) -> bool {
        let Some(client) = self.clients.get_mut(token) else {
            return false;
        };
        let mut received = 0;
        let mut exhausted = false;
        for _ in 0..MAX_CLIENT_READS {
            match client.stream.read(&mut self.inbound) {
                Ok(0) => {
                    self.drop_client(token, "peer closed");
                    return false;
                }
                Ok(n) => received += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    exhausted = true;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(token = token.0, error = %e, "client read failed");
                    self.drop_client(token, "read error");
                    return false;
                }
            }
        }
        if received > 0 {
            trace!(token = token.0, bytes = received, "discarded client input");
        }
        if exhausted {
            return true;
        }
        if let Err(e) = self.clients.rearm(self.poll.registry(), token) {
            warn!(token = token.0, error = %e, "failed to re-arm client");
            self.drop_client(token, "reregister error");
            return false;
        }
        true
    }

    fn rearm_control(&mut self) {
        let registry = self.poll.registry();
        if let Err(e) = registry.reregister(&mut self.control, CONTROL, Interest::READABLE) {
            warn!(error = %e, "failed to re-arm control channel");
        }
    }

    fn flush(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(token) else {
            return;
        };
        let result = self.broadcaster.flush(&mut client.stream);
        counter!(SSE_FLUSHES_TOTAL, "outcome" => result.outcome()).increment(1);
        match result {
            Flush::Complete(n) => trace!(token = token.0, bytes = n, "flushed"),
            Flush::Short { written, dropped } => {
                debug!(token = token.0, written, dropped, "short write, remainder dropped");
            }
            Flush::Idle => {}
            Flush::Failed(e) => {
                warn!(token = token.0, error = %e, "write failed");
                self.drop_client(token, "write error");
                return;
            }
        }
        if let Err(e) = self.clients.demote(self.poll.registry(), token) {
            warn!(token = token.0, error = %e, "failed to reset client interest");
            self.drop_client(token, "reregister error");
        }
    }

    fn drop_client(&mut self, token: Token, reason: &'static str) {
        if let Some(peer) = self.clients.remove(self.poll.registry(), token) {
            debug!(token = token.0, %peer, reason, "client dropped");
        }
    }
}

/// Accept failures caused by a peer that vanished from the backlog.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
