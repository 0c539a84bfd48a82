//! Outbound message state and the per-round ingest / fan-out / flush steps.
//!
//! There is at most one outbound message. A new payload replaces it even
//! if some clients have not flushed the old one yet, so a slow client
//! always writes the newest frame and never an older one.

use std::io::{self, Read, Write};

use bytes::{Bytes, BytesMut};
use metrics::counter;
use mio::Registry;
use tracing::{debug, warn};

use crate::metrics::{SSE_BROADCASTS_TOTAL, SSE_TRUNCATED_BYTES_TOTAL};
use crate::registry::ClientRegistry;

/// Prefix of every SSE data frame.
pub const FRAME_PREFIX: &[u8] = b"data: ";
/// Terminator of every SSE data frame.
pub const FRAME_SUFFIX: &[u8] = b"\n\n";

/// Reads spent discarding an oversized burst before yielding to other events.
pub const MAX_DRAIN_READS: usize = 16;

/// Wrap `payload` as `data: <payload>\n\n`.
pub fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX.len() + payload.len() + FRAME_SUFFIX.len());
    buf.extend_from_slice(FRAME_PREFIX);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(FRAME_SUFFIX);
    buf.freeze()
}

/// Result of draining the control channel once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ingest {
    /// A new message replaced the current one.
    Message {
        /// Payload bytes kept (at most the read capacity).
        len: usize,
        /// Bytes read past the capacity and thrown away.
        discarded: usize,
    },
    /// Nothing was readable.
    Empty,
    /// The controller closed its end.
    Closed,
}

/// Result of one write attempt to a client.
#[derive(Debug)]
pub enum Flush {
    /// The whole frame was written.
    Complete(usize),
    /// Only part of the frame was accepted; the rest is dropped.
    Short {
        /// Bytes accepted by the socket.
        written: usize,
        /// Bytes that will never be sent.
        dropped: usize,
    },
    /// No message has been ingested yet.
    Idle,
    /// The write failed; the client should be removed.
    Failed(io::Error),
}

impl Flush {
    /// Label used for the `outcome` metric dimension.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Complete(_) => "complete",
            Self::Short { .. } => "short",
            Self::Idle => "idle",
            Self::Failed(_) => "failed",
        }
    }
}

/// Holds the current outbound frame and moves it to clients.
pub struct Broadcaster {
    capacity: usize,
    scratch: Vec<u8>,
    current: Option<Bytes>,
    ingested: u64,
    draining: bool,
}

enum Drained {
    Bytes(usize),
    Closed,
}

impl Broadcaster {
    /// Create a broadcaster taking at most `capacity` payload bytes per ingest.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            scratch: vec![0; capacity],
            current: None,
            ingested: 0,
            draining: false,
        }
    }

    /// Take the next payload from the control channel.
    ///
    /// The first read (up to the capacity) becomes the new message. Whatever
    /// else is readable in the same burst is drained and discarded, so a
    /// write longer than the capacity arrives cut at exactly `capacity`
    /// bytes. A separate write queued behind a capacity-filling one is
    /// discarded with it. EOF, on the first read or while draining, yields
    /// [`Ingest::Closed`].
    ///
    /// Draining stops after [`MAX_DRAIN_READS`] reads. [`is_draining`]
    /// then reports `true`, the caller must re-arm readiness, and the next
    /// call keeps discarding before it accepts a new message.
    ///
    /// [`is_draining`]: Self::is_draining
    pub fn ingest<R: Read>(&mut self, source: &mut R) -> io::Result<Ingest> {
        if self.draining {
            return match self.drain(source) {
                Drained::Closed => Ok(Ingest::Closed),
                Drained::Bytes(n) => {
                    self.record_truncation(n);
                    Ok(Ingest::Empty)
                }
            };
        }

        let len = match read_retrying(source, &mut self.scratch) {
            Ok(0) => return Ok(Ingest::Closed),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Ingest::Empty),
            Err(e) => return Err(e),
        };
        let message = frame(&self.scratch[..len]);

        let drained = self.drain(source);

        self.current = Some(message);
        self.ingested += 1;
        counter!(SSE_BROADCASTS_TOTAL).increment(1);
        debug!(len, seq = self.ingested, "ingested broadcast payload");

        match drained {
            Drained::Closed => Ok(Ingest::Closed),
            Drained::Bytes(discarded) => {
                self.record_truncation(discarded);
                Ok(Ingest::Message { len, discarded })
            }
        }
    }

    /// Discard readable bytes, at most [`MAX_DRAIN_READS`] reads.
    fn drain<R: Read>(&mut self, source: &mut R) -> Drained {
        let mut discarded = 0;
        for _ in 0..MAX_DRAIN_READS {
            match read_retrying(source, &mut self.scratch) {
                Ok(0) => {
                    self.draining = false;
                    return Drained::Closed;
                }
                Ok(n) => discarded += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.draining = false;
                    return Drained::Bytes(discarded);
                }
                Err(e) => {
                    warn!(error = %e, "control channel read failed while draining");
                    self.draining = false;
                    return Drained::Bytes(discarded);
                }
            }
        }
        self.draining = true;
        Drained::Bytes(discarded)
    }

    fn record_truncation(&self, discarded: usize) {
        if discarded == 0 {
            return;
        }
        warn!(
            discarded,
            capacity = self.capacity,
            still_draining = self.draining,
            "control payload exceeded read capacity, truncated"
        );
        counter!(SSE_TRUNCATED_BYTES_TOTAL).increment(discarded as u64);
    }

    /// Promote every registered client to read+write interest.
    ///
    /// Clients whose interest cannot be changed are removed. Returns the
    /// number of clients newly marked pending.
    pub fn fan_out(&self, clients: &mut ClientRegistry, registry: &Registry) -> usize {
        if self.current.is_none() {
            return 0;
        }
        let mut promoted = 0;
        clients.for_each(|clients, token| match clients.promote(registry, token) {
            Ok(true) => promoted += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(token = token.0, error = %e, "failed to mark client writable, dropping it");
                let _ = clients.remove(registry, token);
            }
        });
        debug!(promoted, clients = clients.len(), "fan-out");
        promoted
    }

    /// Make exactly one attempt to write the current frame to `conn`.
    ///
    /// A short write is not resumed.
    pub fn flush<W: Write>(&self, conn: &mut W) -> Flush {
        let Some(message) = &self.current else {
            return Flush::Idle;
        };
        loop {
            match conn.write(message) {
                Ok(n) if n == message.len() => return Flush::Complete(n),
                Ok(n) => {
                    return Flush::Short {
                        written: n,
                        dropped: message.len() - n,
                    };
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Flush::Short {
                        written: 0,
                        dropped: message.len(),
                    };
                }
                Err(e) => return Flush::Failed(e),
            }
        }
    }

    /// The framed message clients will write next, if any.
    pub fn current(&self) -> Option<&Bytes> {
        self.current.as_ref()
    }

    /// Maximum payload bytes per ingest.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages ingested so far.
    pub fn ingested(&self) -> u64 {
        self.ingested
    }

    /// Whether an oversized burst is still being discarded.
    pub fn is_draining(&self) -> bool {
        self.draining
    }
}

fn read_retrying<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match source.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            other => return other,
        }
    }
}
