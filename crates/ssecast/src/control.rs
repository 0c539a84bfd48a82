//! Control channel plumbing: the pipe between controller and worker, and
//! the readiness line a worker process prints once it is listening.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsFd;

use mio::unix::pipe::{self, Receiver, Sender};

/// Prefix of the line a worker process prints on stdout once bound.
pub const READY_PREFIX: &str = "listening ";

/// Create a control pipe.
///
/// The write end blocks like an ordinary pipe so a controller can use it
/// with plain `write_all`; the read end is non-blocking for the reactor.
pub fn channel() -> io::Result<(Sender, Receiver)> {
    let (sender, receiver) = pipe::new()?;
    sender.set_nonblocking(false)?;
    Ok((sender, receiver))
}

/// Take this process's stdin as the control channel read end.
///
/// The descriptor is duplicated and switched to non-blocking mode.
pub fn stdin_receiver() -> io::Result<Receiver> {
    let fd = io::stdin().as_fd().try_clone_to_owned()?;
    let receiver = Receiver::from(fd);
    receiver.set_nonblocking(true)?;
    Ok(receiver)
}

/// Format the readiness line for `addr` (without the trailing newline).
pub fn ready_line(addr: SocketAddr) -> String {
    format!("{READY_PREFIX}{addr}")
}

/// Parse a readiness line printed by a worker process.
pub fn parse_ready_line(line: &str) -> Option<SocketAddr> {
    line.trim_end()
        .strip_prefix(READY_PREFIX)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn channel_carries_bytes() {
        let (mut tx, mut rx) = channel().unwrap();
        tx.write_all(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = rx.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn empty_read_end_would_block() {
        let (_tx, mut rx) = channel().unwrap();
        let mut buf = [0u8; 4];
        let err = rx.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn dropping_sender_is_eof() {
        let (tx, mut rx) = channel().unwrap();
        drop(tx);
        let mut buf = [0u8; 4];
        assert_eq!(rx.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn ready_line_round_trip() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let line = ready_line(addr);
        assert_eq!(line, "listening 127.0.0.1:9000");
        assert_eq!(parse_ready_line(&format!("{line}\n")), Some(addr));
    }

    #[test]
    fn foreign_line_is_rejected() {
        assert_eq!(parse_ready_line("hello"), None);
        assert_eq!(parse_ready_line("listening nowhere"), None);
    }
}
