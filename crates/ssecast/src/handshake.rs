//! Fixed SSE response header sent to every subscriber on connect.

use std::io::{self, Write};

use crate::errors::HandshakeError;

/// Response header written once, right after accept. No request parsing
/// happens; whatever the subscriber sent is irrelevant to this reply.
pub const SSE_HEADER: &[u8] =
    b"HTTP/1.1 200 OK\nCache-Control: no-cache\nContent-Type: text/event-stream\n\n";

/// Write [`SSE_HEADER`] with a single write attempt.
///
/// The socket was just accepted, so its send buffer is empty and the
/// header is expected to fit. Anything short of the full header is an error.
pub fn send_header<W: Write>(conn: &mut W) -> Result<(), HandshakeError> {
    let written = loop {
        match conn.write(SSE_HEADER) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(HandshakeError::Io(e)),
        }
    };
    if written < SSE_HEADER.len() {
        return Err(HandshakeError::Short {
            written,
            expected: SSE_HEADER.len(),
        });
    }
    Ok(())
}
