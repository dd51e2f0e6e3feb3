//! TCP loopback message stream.
//!
//! The host binds a listener on `base_port + tracer_id` and accepts one
//! tracer. Both sides then run a fixed-token handshake on the blocking socket,
//! after which the socket switches to non-blocking mode. Reads sleep briefly
//! on `WouldBlock`; writes spin, since a sleeping writer stalls the traced
//! application.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::CaptureError;
use crate::session::TerminationFlag;
use crate::transport::FRAME_PREFIX_SIZE;

/// Sent by the host as soon as a tracer connects.
pub const HANDSHAKE_TOKEN: &[u8] = b"It's a trap!";
/// The tracer's answer after it has verified [`HANDSHAKE_TOKEN`].
pub const HANDSHAKE_REPLY: &[u8] = b"It's not a trap.";

pub const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);
/// Consecutive zero-byte reads before the peer is considered gone.
pub const MAX_IDLE_READS: u32 = 200;
const RECV_RETRY_DELAY: Duration = Duration::from_millis(1);
const ACCEPT_POLL_DELAY: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

/// Listening socket for the host role.
pub struct MessageListener {
    listener: TcpListener,
    address: String,
    port: u16,
}

impl MessageListener {
    pub fn bind(address: &str, port: u16) -> Result<Self, CaptureError> {
        let listener = TcpListener::bind((address, port))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        debug!("listening for tracer on {}:{}", address, port);
        Ok(MessageListener {
            listener,
            address: address.to_string(),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Waits for a tracer to connect.
    ///
    /// Returns `Ok(None)` if `termination` is requested before anyone
    /// connects. Aborted connections and a downed network are fatal, every
    /// other accept error is retried.
    pub fn accept(&self, termination: &TerminationFlag) -> Result<Option<MessageStream>, CaptureError> {
        loop {
            if termination.is_requested() {
                return Ok(None);
            }
            match self.listener.accept() {
                Ok((socket, peer)) => {
                    debug!("tracer connected from {}", peer);
                    socket.set_nonblocking(false)?;
                    socket.set_nodelay(true)?;
                    return Ok(Some(MessageStream::from_socket(
                        socket,
                        Role::Host,
                        &self.address,
                        self.port,
                    )));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_DELAY);
                }
                Err(e) if is_fatal_accept_error(&e) => {
                    return Err(CaptureError::NetworkFailure(e));
                }
                Err(e) => {
                    warn!("accept on port {} failed, retrying: {}", self.port, e);
                    thread::sleep(ACCEPT_POLL_DELAY);
                }
            }
        }
    }
}

fn is_fatal_accept_error(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::ConnectionAborted
        || matches!(e.raw_os_error(), Some(libc::ENETDOWN) | Some(libc::ENETUNREACH))
}

/// Bounded buffer that coalesces small framed sends.
struct SendBuffer {
    bytes: Vec<u8>,
    capacity: usize,
}

impl SendBuffer {
    fn would_overflow(&self, len: usize) -> bool {
        self.bytes.len() + len > self.capacity
    }
}

pub struct MessageStream {
    socket: TcpStream,
    role: Role,
    address: String,
    port: u16,
    send_buffer: Option<SendBuffer>,
    last_error: Option<io::ErrorKind>,
}

impl MessageStream {
    fn from_socket(socket: TcpStream, role: Role, address: &str, port: u16) -> Self {
        MessageStream {
            socket,
            role,
            address: address.to_string(),
            port,
            send_buffer: None,
            last_error: None,
        }
    }

    /// Connects to a capture host and completes the client handshake.
    pub fn connect(address: &str, port: u16) -> Result<Self, CaptureError> {
        let mut attempt = 0;
        let socket = loop {
            attempt += 1;
            match TcpStream::connect((address, port)) {
                Ok(socket) => break socket,
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    debug!(
                        "connect to {}:{} failed (attempt {}/{}): {}",
                        address, port, attempt, CONNECT_ATTEMPTS, e
                    );
                    thread::sleep(CONNECT_BACKOFF);
                }
                Err(e) => {
                    warn!("giving up on {}:{}: {}", address, port, e);
                    return Err(CaptureError::ConnectFailure {
                        address: address.to_string(),
                        port,
                        attempts: attempt,
                    });
                }
            }
        };
        socket.set_nodelay(true)?;

        let mut stream = MessageStream::from_socket(socket, Role::Client, address, port);
        stream.handshake()?;
        Ok(stream)
    }

    /// Runs the handshake for this stream's role, then switches the socket
    /// to non-blocking mode.
    pub fn handshake(&mut self) -> Result<(), CaptureError> {
        match self.role {
            Role::Host => host_handshake(&mut self.socket, HANDSHAKE_TOKEN, HANDSHAKE_REPLY)?,
            Role::Client => client_handshake(&mut self.socket, HANDSHAKE_TOKEN, HANDSHAKE_REPLY)?,
        }
        self.socket.set_nonblocking(true)?;
        debug!("handshake complete on port {}", self.port);
        Ok(())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Kind of the last transport error seen on this stream.
    pub fn last_error(&self) -> Option<io::ErrorKind> {
        self.last_error
    }

    /// Coalesce framed sends into a buffer of `capacity` bytes.
    pub fn enable_send_buffer(&mut self, capacity: usize) {
        self.send_buffer = Some(SendBuffer {
            bytes: Vec::with_capacity(capacity),
            capacity,
        });
    }

    /// Sends `bytes` as one length-prefixed frame, buffering when possible.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), CaptureError> {
        let frame_len = FRAME_PREFIX_SIZE + bytes.len();
        let prefix = (bytes.len() as u64).to_le_bytes();

        let overflow = self
            .send_buffer
            .as_ref()
            .is_some_and(|buffer| buffer.would_overflow(frame_len));
        if overflow {
            self.flush()?;
        }
        if let Some(buffer) = self.send_buffer.as_mut() {
            if !buffer.would_overflow(frame_len) {
                buffer.bytes.extend_from_slice(&prefix);
                buffer.bytes.extend_from_slice(bytes);
                return Ok(());
            }
        }

        self.really_send(&prefix, false)?;
        self.really_send(bytes, false)
    }

    /// Sends `bytes` with no framing, after anything already buffered.
    ///
    /// An optional send gives up quietly on errors instead of failing.
    pub fn send_raw(&mut self, bytes: &[u8], optional: bool) -> Result<(), CaptureError> {
        self.flush()?;
        self.really_send(bytes, optional)
    }

    pub fn flush(&mut self) -> Result<(), CaptureError> {
        let Some(buffer) = self.send_buffer.as_mut() else {
            return Ok(());
        };
        if buffer.bytes.is_empty() {
            return Ok(());
        }
        let mut pending = std::mem::take(&mut buffer.bytes);
        let result = self.really_send(&pending, false);
        pending.clear();
        if let Some(buffer) = self.send_buffer.as_mut() {
            buffer.bytes = pending;
        }
        result
    }

    fn really_send(&mut self, bytes: &[u8], optional: bool) -> Result<(), CaptureError> {
        let mut sent = 0;
        while sent < bytes.len() {
            match self.socket.write(&bytes[sent..]) {
                Ok(0) => {
                    if optional {
                        debug!("socket accepted 0 bytes after {} of {}", sent, bytes.len());
                        return Ok(());
                    }
                    self.last_error = Some(io::ErrorKind::WriteZero);
                    return Err(CaptureError::NetworkFailure(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted 0 bytes",
                    )));
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.last_error = Some(e.kind());
                    if optional {
                        debug!("dropping optional send of {} bytes: {}", bytes.len(), e);
                        return Ok(());
                    }
                    return Err(classify_stream_error(e));
                }
            }
        }
        Ok(())
    }

    /// Fills `buf` completely.
    ///
    /// A reset connection, or [`MAX_IDLE_READS`] reads in a row that return
    /// nothing, end the stream with [`CaptureError::NetworkTermination`].
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<(), CaptureError> {
        let mut filled = 0;
        let mut idle_reads = 0;
        while filled < buf.len() {
            match self.socket.read(&mut buf[filled..]) {
                Ok(0) => {
                    idle_reads += 1;
                    if idle_reads >= MAX_IDLE_READS {
                        self.last_error = Some(io::ErrorKind::ConnectionReset);
                        return Err(CaptureError::NetworkTermination);
                    }
                    thread::sleep(RECV_RETRY_DELAY);
                }
                Ok(n) => {
                    filled += n;
                    idle_reads = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(RECV_RETRY_DELAY),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.last_error = Some(e.kind());
                    return Err(classify_stream_error(e));
                }
            }
        }
        Ok(())
    }

    /// True when unread bytes are already queued on the socket.
    pub fn has_pending(&self) -> bool {
        let mut peeked = [0u8; 1];
        matches!(self.socket.peek(&mut peeked), Ok(n) if n > 0)
    }

    /// Bytes the kernel has queued for reading right now.
    pub fn queued_bytes(&self) -> Result<usize, CaptureError> {
        let mut queued: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(self.socket.as_raw_fd(), libc::FIONREAD, &mut queued) };
        if ret < 0 {
            return Err(classify_stream_error(io::Error::last_os_error()));
        }
        Ok(queued.max(0) as usize)
    }

    /// Waits until data is queued on the socket.
    ///
    /// Returns `Ok(false)` once `termination` is requested and nothing is
    /// left to read, so queued data is always drained first. A closed peer
    /// ends with [`CaptureError::NetworkTermination`].
    pub fn wait_readable(&mut self, termination: &TerminationFlag) -> Result<bool, CaptureError> {
        let mut peeked = [0u8; 1];
        loop {
            match self.socket.peek(&mut peeked) {
                Ok(0) => {
                    self.last_error = Some(io::ErrorKind::ConnectionReset);
                    return Err(CaptureError::NetworkTermination);
                }
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if termination.is_requested() {
                        return Ok(false);
                    }
                    thread::sleep(RECV_RETRY_DELAY);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.last_error = Some(e.kind());
                    return Err(classify_stream_error(e));
                }
            }
        }
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            debug!("discarding unsent data on port {}: {}", self.port, e);
        }
    }
}

fn classify_stream_error(e: io::Error) -> CaptureError {
    match e.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
            CaptureError::NetworkTermination
        }
        _ => CaptureError::NetworkFailure(e),
    }
}

fn expect_token<S: Read>(socket: &mut S, expected: &[u8], what: &str) -> Result<(), CaptureError> {
    let mut received = vec![0u8; expected.len()];
    socket.read_exact(&mut received).map_err(|e| {
        CaptureError::HandshakeFailure(format!("connection failed before {what} arrived: {e}"))
    })?;
    if received != expected {
        return Err(CaptureError::HandshakeFailure(format!(
            "unexpected {what} {:?}; the peer speaks a different protocol version",
            String::from_utf8_lossy(&received)
        )));
    }
    Ok(())
}

fn host_handshake<S: Read + Write>(
    socket: &mut S,
    token: &[u8],
    reply: &[u8],
) -> Result<(), CaptureError> {
    socket.write_all(token)?;
    socket.flush()?;
    expect_token(socket, reply, "handshake reply")
}

fn client_handshake<S: Read + Write>(
    socket: &mut S,
    token: &[u8],
    reply: &[u8],
) -> Result<(), CaptureError> {
    expect_token(socket, token, "handshake token")?;
    socket.write_all(reply)?;
    socket.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::net::TcpListener;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn connected_pair() -> (MessageStream, MessageStream) {
        let listener = MessageListener::bind("127.0.0.1", 0).unwrap();
        let port = listener.port();
        let client = thread::spawn(move || MessageStream::connect("127.0.0.1", port).unwrap());
        let mut host = listener
            .accept(&TerminationFlag::new())
            .unwrap()
            .expect("tracer should connect");
        host.handshake().unwrap();
        (host, client.join().unwrap())
    }

    #[test]
    fn test_handshake_with_matching_tokens() {
        let (host, client) = connected_pair();
        assert_eq!(host.role(), Role::Host);
        assert_eq!(client.role(), Role::Client);
        assert_eq!(host.port(), client.port());
    }

    #[test]
    fn test_client_rejects_single_byte_difference() {
        let (mut server, mut client) = socket_pair();
        let host = thread::spawn(move || {
            let mut token = HANDSHAKE_TOKEN.to_vec();
            token[5] ^= 0x01;
            host_handshake(&mut server, &token, HANDSHAKE_REPLY)
        });
        let result = client_handshake(&mut client, HANDSHAKE_TOKEN, HANDSHAKE_REPLY);
        assert!(matches!(result, Err(CaptureError::HandshakeFailure(_))));
        drop(client);
        assert!(host.join().unwrap().is_err());
    }

    #[test]
    fn test_host_rejects_single_byte_difference_in_reply() {
        let (mut server, mut client) = socket_pair();
        let tracer = thread::spawn(move || {
            let mut reply = HANDSHAKE_REPLY.to_vec();
            let last = reply.len() - 1;
            reply[last] = b'!';
            client_handshake(&mut client, HANDSHAKE_TOKEN, &reply)
        });
        let result = host_handshake(&mut server, HANDSHAKE_TOKEN, HANDSHAKE_REPLY);
        match result {
            Err(CaptureError::HandshakeFailure(msg)) => assert!(msg.contains("handshake reply")),
            other => panic!("expected handshake failure, got {other:?}"),
        }
        assert!(tracer.join().unwrap().is_ok());
    }

    #[test]
    fn test_connect_gives_up_without_listener() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        match MessageStream::connect("127.0.0.1", port) {
            Err(CaptureError::ConnectFailure { attempts, .. }) => {
                assert_eq!(attempts, CONNECT_ATTEMPTS)
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("connect should fail"),
        }
    }

    #[test]
    fn test_accept_stops_on_termination() {
        let listener = MessageListener::bind("127.0.0.1", 0).unwrap();
        let termination = TerminationFlag::new();
        termination.request();
        assert!(listener.accept(&termination).unwrap().is_none());
    }

    #[test]
    fn test_buffered_send_is_lossless_and_ordered() {
        let (mut host, mut client) = connected_pair();
        client.enable_send_buffer(97);

        let mut rng = rand::rng();
        let mut sent: Vec<Vec<u8>> = Vec::new();
        for i in 0..300 {
            let len = rng.random_range(0..240);
            let chunk: Vec<u8> = (0..len).map(|j| (i * 7 + j) as u8).collect();
            sent.push(chunk);
        }

        let expected = sent.clone();
        let writer = thread::spawn(move || {
            for chunk in &sent {
                client.send(chunk).unwrap();
            }
            client.flush().unwrap();
            client
        });

        for chunk in &expected {
            let mut prefix = [0u8; FRAME_PREFIX_SIZE];
            host.recv(&mut prefix).unwrap();
            assert_eq!(u64::from_le_bytes(prefix) as usize, chunk.len());
            let mut payload = vec![0u8; chunk.len()];
            host.recv(&mut payload).unwrap();
            assert_eq!(&payload, chunk);
        }
        let _client = writer.join().unwrap();
        assert!(!host.has_pending());
    }

    #[test]
    fn test_raw_send_follows_buffered_frames() {
        let (mut host, mut client) = connected_pair();
        client.enable_send_buffer(1024);
        client.send(b"abc").unwrap();
        client.send_raw(b"xyz", false).unwrap();

        let mut received = [0u8; FRAME_PREFIX_SIZE + 6];
        host.recv(&mut received).unwrap();
        assert_eq!(&received[..8], &3u64.to_le_bytes());
        assert_eq!(&received[8..], b"abcxyz");
    }

    #[test]
    fn test_wait_readable_drains_before_stopping() {
        let (mut host, mut client) = connected_pair();
        let termination = TerminationFlag::new();
        client.send(b"queued").unwrap();
        assert!(host.wait_readable(&termination).unwrap());

        termination.request();
        assert!(host.wait_readable(&termination).unwrap());
        let mut frame = [0u8; FRAME_PREFIX_SIZE + 6];
        host.recv(&mut frame).unwrap();
        assert!(!host.wait_readable(&termination).unwrap());

        drop(client);
        assert!(matches!(
            host.wait_readable(&TerminationFlag::new()),
            Err(CaptureError::NetworkTermination)
        ));
    }

    #[test]
    fn test_queued_bytes_counts_unread_frames() {
        let (mut host, mut client) = connected_pair();
        assert_eq!(host.queued_bytes().unwrap(), 0);
        client.send(b"first").unwrap();
        client.send(b"second").unwrap();
        while host.queued_bytes().unwrap() < 2 * FRAME_PREFIX_SIZE + 11 {
            thread::sleep(Duration::from_millis(1));
        }

        let mut frame = [0u8; FRAME_PREFIX_SIZE + 5];
        host.recv(&mut frame).unwrap();
        assert_eq!(host.queued_bytes().unwrap(), FRAME_PREFIX_SIZE + 6);
    }

    #[test]
    fn test_recv_reports_termination_after_peer_closes() {
        let (mut host, client) = connected_pair();
        drop(client);
        let mut buf = [0u8; 4];
        assert!(matches!(
            host.recv(&mut buf),
            Err(CaptureError::NetworkTermination)
        ));
        assert_eq!(host.last_error(), Some(io::ErrorKind::ConnectionReset));
    }
}
