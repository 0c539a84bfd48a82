//! Connected subscriber bookkeeping.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::debug;

use crate::metrics::{SSE_CONNECTIONS_ACTIVE, SSE_CONNECTIONS_TOTAL, SSE_DISCONNECTIONS_TOTAL};

/// First token handed to a subscriber. Lower tokens belong to the reactor's
/// own descriptors.
pub const FIRST_CLIENT_TOKEN: usize = 2;

/// Poller interest currently registered for a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteInterest {
    /// Read-only: nothing to send.
    None,
    /// Read+write: waiting for writability to flush the current message.
    Pending,
}

/// One accepted subscriber connection.
pub struct Client {
    /// Connection socket. Dropping the client closes it.
    pub stream: TcpStream,
    /// Remote address.
    pub peer: SocketAddr,
    interest: WriteInterest,
    connected_at: Instant,
}

impl Client {
    /// Current write interest.
    pub fn interest(&self) -> WriteInterest {
        self.interest
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Registry of connected subscribers, keyed by poller token.
///
/// Every interest change goes through this type so a client's
/// [`WriteInterest`] always matches what the poller has registered.
pub struct ClientRegistry {
    clients: BTreeMap<Token, Client>,
    next_token: usize,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            clients: BTreeMap::new(),
            next_token: FIRST_CLIENT_TOKEN,
        }
    }

    /// Register a freshly accepted connection with read-only interest.
    ///
    /// Tokens are never reused, so a stale event for a removed client can
    /// not land on a newer one.
    pub fn add(
        &mut self,
        registry: &Registry,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> io::Result<Token> {
        let token = Token(self.next_token);
        registry.register(&mut stream, token, Interest::READABLE)?;
        self.next_token += 1;

        let client = Client {
            stream,
            peer,
            interest: WriteInterest::None,
            connected_at: Instant::now(),
        };
        let _ = self.clients.insert(token, client);
        counter!(SSE_CONNECTIONS_TOTAL).increment(1);
        gauge!(SSE_CONNECTIONS_ACTIVE).set(self.clients.len() as f64);
        debug!(token = token.0, %peer, clients = self.clients.len(), "client added");
        Ok(token)
    }

    /// Deregister and close a client. Returns its peer address if it was present.
    pub fn remove(&mut self, registry: &Registry, token: Token) -> Option<SocketAddr> {
        let mut client = self.clients.remove(&token)?;
        if let Err(e) = registry.deregister(&mut client.stream) {
            debug!(token = token.0, error = %e, "deregister failed");
        }
        counter!(SSE_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(SSE_CONNECTIONS_ACTIVE).set(self.clients.len() as f64);
        debug!(
            token = token.0,
            peer = %client.peer,
            age_ms = client.age().as_millis() as u64,
            clients = self.clients.len(),
            "client removed"
        );
        Some(client.peer)
    }

    /// Switch a client to read+write interest.
    ///
    /// Returns `Ok(false)` if the client is unknown or already pending.
    pub fn promote(&mut self, registry: &Registry, token: Token) -> io::Result<bool> {
        self.set_interest(registry, token, WriteInterest::Pending)
    }

    /// Switch a client back to read-only interest.
    ///
    /// Returns `Ok(false)` if the client is unknown or not pending.
    pub fn demote(&mut self, registry: &Registry, token: Token) -> io::Result<bool> {
        self.set_interest(registry, token, WriteInterest::None)
    }

    /// Re-register a client with its current interest so pending readiness
    /// is reported again by the next wait.
    pub fn rearm(&mut self, registry: &Registry, token: Token) -> io::Result<bool> {
        let Some(client) = self.clients.get_mut(&token) else {
            return Ok(false);
        };
        registry.reregister(&mut client.stream, token, mio_interest(client.interest))?;
        Ok(true)
    }

    fn set_interest(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: WriteInterest,
    ) -> io::Result<bool> {
        let Some(client) = self.clients.get_mut(&token) else {
            return Ok(false);
        };
        if client.interest == interest {
            return Ok(false);
        }
        registry.reregister(&mut client.stream, token, mio_interest(interest))?;
        client.interest = interest;
        Ok(true)
    }

    /// Call `f` once per client present when iteration starts.
    ///
    /// Iterates a snapshot of the membership, so `f` may remove clients
    /// (including ones not yet visited, which are then skipped).
    pub fn for_each(&mut self, mut f: impl FnMut(&mut Self, Token)) {
        for token in self.tokens() {
            if self.contains(token) {
                f(self, token);
            }
        }
    }

    /// Snapshot of current tokens, in token order.
    pub fn tokens(&self) -> Vec<Token> {
        self.clients.keys().copied().collect()
    }

    /// Look up a client.
    pub fn get(&self, token: Token) -> Option<&Client> {
        self.clients.get(&token)
    }

    /// Look up a client mutably.
    pub fn get_mut(&mut self, token: Token) -> Option<&mut Client> {
        self.clients.get_mut(&token)
    }

    /// Whether `token` is registered.
    pub fn contains(&self, token: Token) -> bool {
        self.clients.contains_key(&token)
    }

    /// Write interest of a client, if present.
    pub fn interest(&self, token: Token) -> Option<WriteInterest> {
        self.clients.get(&token).map(Client::interest)
    }

    /// Number of clients waiting to flush.
    pub fn pending_count(&self) -> usize {
        self.clients
            .values()
            .filter(|c| c.interest == WriteInterest::Pending)
            .count()
    }

    /// Number of connected clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no clients are connected.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

fn mio_interest(interest: WriteInterest) -> Interest {
    match interest {
        WriteInterest::None => Interest::READABLE,
        WriteInterest::Pending => Interest::READABLE | Interest::WRITABLE,
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::time::Duration;

    use mio::{Events, Poll};

    use super::*;

    /// A connected (server side, client side) socket pair over loopback.
    fn socket_pair() -> (TcpStream, SocketAddr, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), peer, client)
    }

    fn add_client(
        clients: &mut ClientRegistry,
        poll: &Poll,
    ) -> (Token, std::net::TcpStream) {
        let (server, peer, remote) = socket_pair();
        let token = clients.add(poll.registry(), server, peer).unwrap();
        (token, remote)
    }

    #[test]
    fn add_assigns_increasing_tokens() {
        let poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new();
        let (t1, _r1) = add_client(&mut clients, &poll);
        let (t2, _r2) = add_client(&mut clients, &poll);
        assert_eq!(t1, Token(FIRST_CLIENT_TOKEN));
        assert_eq!(t2, Token(FIRST_CLIENT_TOKEN + 1));
        assert_eq!(clients.len(), 2);
    }

    #[test]
    fn new_client_is_read_only() {
        let poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new();
        let (token, _remote) = add_client(&mut clients, &poll);
        assert_eq!(clients.interest(token), Some(WriteInterest::None));
        assert_eq!(clients.pending_count(), 0);
    }

    #[test]
    fn remove_closes_connection() {
        let poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new();
        let (token, mut remote) = add_client(&mut clients, &poll);

        assert!(clients.remove(poll.registry(), token).is_some());
        assert!(clients.is_empty());

        remote
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(remote.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn remove_unknown_is_none() {
        let poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new();
        assert!(clients.remove(poll.registry(), Token(99)).is_none());
    }

    #[test]
    fn tokens_not_reused_after_remove() {
        let poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new();
        let (t1, _r1) = add_client(&mut clients, &poll);
        let _ = clients.remove(poll.registry(), t1);
        let (t2, _r2) = add_client(&mut clients, &poll);
        assert_ne!(t1, t2);
    }

    #[test]
    fn promote_is_idempotent() {
        let poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new();
        let (token, _remote) = add_client(&mut clients, &poll);

        assert!(clients.promote(poll.registry(), token).unwrap());
        assert!(!clients.promote(poll.registry(), token).unwrap());
        assert_eq!(clients.interest(token), Some(WriteInterest::Pending));
        assert_eq!(clients.pending_count(), 1);
    }

    #[test]
    fn demote_restores_read_only() {
        let poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new();
        let (token, _remote) = add_client(&mut clients, &poll);

        assert!(!clients.demote(poll.registry(), token).unwrap());
        let _ = clients.promote(poll.registry(), token).unwrap();
        assert!(clients.demote(poll.registry(), token).unwrap());
        assert_eq!(clients.interest(token), Some(WriteInterest::None));
    }

    #[test]
    fn promote_unknown_is_false() {
        let poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new();
        assert!(!clients.promote(poll.registry(), Token(42)).unwrap());
    }

    #[test]
    fn promoted_client_reports_writable() {
        let mut poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new();
        let (token, _remote) = add_client(&mut clients, &poll);
        let _ = clients.promote(poll.registry(), token).unwrap();

        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_secs(2))).unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.token() == token && e.is_writable())
        );
    }

    #[test]
    fn rearm_reports_pending_input_again() {
        use std::io::Write;

        let mut poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new();
        let (token, mut remote) = add_client(&mut clients, &poll);
        remote.write_all(b"unread").unwrap();

        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_secs(2))).unwrap();
        assert!(events.iter().any(|e| e.token() == token && e.is_readable()));

        // Nothing was read, so only a re-registration brings the event back.
        assert!(clients.rearm(poll.registry(), token).unwrap());
        poll.poll(&mut events, Some(Duration::from_secs(2))).unwrap();
        assert!(events.iter().any(|e| e.token() == token && e.is_readable()));
        assert_eq!(clients.interest(token), Some(WriteInterest::None));
    }

    #[test]
    fn rearm_unknown_is_false() {
        let poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new();
        assert!(!clients.rearm(poll.registry(), Token(7)).unwrap());
    }

    #[test]
    fn for_each_tolerates_removal() {
        let poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new();
        let mut remotes = Vec::new();
        for _ in 0..4 {
            let (_, remote) = add_client(&mut clients, &poll);
            remotes.push(remote);
        }

        let mut visited = Vec::new();
        clients.for_each(|clients, token| {
            visited.push(token);
            // Drop the next client before it is visited.
            let _ = clients.remove(poll.registry(), Token(token.0 + 1));
        });

        assert_eq!(
            visited,
            vec![Token(FIRST_CLIENT_TOKEN), Token(FIRST_CLIENT_TOKEN + 2)]
        );
        assert_eq!(clients.len(), 2);
    }

    #[test]
    fn client_age_increases() {
        let poll = Poll::new().unwrap();
        let mut clients = ClientRegistry::new();
        let (token, _remote) = add_client(&mut clients, &poll);
        let age1 = clients.get(token).unwrap().age();
        std::thread::sleep(Duration::from_millis(10));
        let age2 = clients.get(token).unwrap().age();
        assert!(age2 > age1);
    }
}
