//! Framed TCP connections and the transport abstraction
//!
//! `StreamConnection` wraps a non-blocking mio `TcpStream` with an inbound
//! `FrameBuffer` and an outbound byte queue. It serves both the ACDS link
//! and host media connections. `Transport` is the packet-level seam the host
//! and participant runtimes talk through, so a connection can be swapped for
//! an in-process channel.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::Duration;

use log::{debug, trace};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::framing::{encode_frame, FrameBuffer};
use crate::packet::Packet;

/// Unsent bytes allowed per connection before it is considered stuck
pub const MAX_OUTBOUND_BACKLOG: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

// ============================================================================
// Transport trait
// ============================================================================

/// Packet-level connection to a peer
pub trait Transport: Send {
    fn send(&mut self, packet: &Packet) -> Result<()>;

    /// Next buffered packet, without blocking
    fn try_recv(&mut self) -> Result<Option<Packet>>;

    fn close(&mut self);
}

// ============================================================================
// StreamConnection
// ============================================================================

pub struct StreamConnection {
    stream: TcpStream,
    peer: SocketAddr,
    inbound: FrameBuffer,
    outbound: Vec<u8>,
    max_len: usize,
    closed: bool,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("peer", &self.peer)
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl StreamConnection {
    /// Resolve `host` and connect to the first address that answers
    pub fn connect(host: &str, port: u16, timeout: Duration, max_len: usize) -> Result<Self> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::NetworkConnect(format!("resolve {}:{}: {}", host, port, e)))?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match std::net::TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_nonblocking(true)?;
                    debug!("Connected to {}", addr);
                    return Ok(Self::from_mio(TcpStream::from_std(stream), addr, max_len));
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(Error::NetworkConnect(match last_err {
            Some(e) => format!("{}:{}: {}", host, port, e),
            None => format!("{}:{}: no addresses", host, port),
        }))
    }

    /// Wrap an already-connected (e.g. accepted) stream
    pub fn from_mio(stream: TcpStream, peer: SocketAddr, max_len: usize) -> Self {
        Self {
            stream,
            peer,
            inbound: FrameBuffer::new(max_len),
            outbound: Vec::new(),
            max_len,
            closed: false,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The underlying socket, for registering with a `Poll`
    pub fn source_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Queue a framed message and try to flush
    pub fn send_message<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        if self.closed {
            return Err(Error::NetworkProtocol(format!("{} is closed", self.peer)));
        }
        let encoded = encode_frame(msg, self.max_len)?;
        if self.outbound.len() + encoded.len() > MAX_OUTBOUND_BACKLOG {
            return Err(Error::NetworkProtocol(format!(
                "send backlog to {} exceeded",
                self.peer
            )));
        }
        self.outbound.extend_from_slice(&encoded);
        self.flush()
    }

    /// Write as much of the outbound queue as the socket takes
    pub fn flush(&mut self) -> Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    self.closed = true;
                    return Err(Error::NetworkProtocol(format!("{} closed", self.peer)));
                }
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.closed = true;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Read until the socket would block; EOF marks the connection closed
    pub fn fill(&mut self) -> Result<usize> {
        let mut total = 0;
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => {
                    self.inbound.extend(&buf[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.closed = true;
                    return Err(e.into());
                }
            }
        }
        if total > 0 {
            trace!("Read {} bytes from {}", total, self.peer);
        }
        Ok(total)
    }

    /// Next complete message already buffered
    pub fn next_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        Ok(self.inbound.next_frame()?)
    }

    /// Buffered message, or read more and try again
    pub fn poll_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        if let Some(msg) = self.next_message()? {
            return Ok(Some(msg));
        }
        if self.closed {
            return Err(Error::NetworkProtocol(format!(
                "{} closed the connection",
                self.peer
            )));
        }
        self.fill()?;
        match self.next_message()? {
            Some(msg) => Ok(Some(msg)),
            None if self.closed => Err(Error::NetworkProtocol(format!(
                "{} closed the connection",
                self.peer
            ))),
            None => Ok(None),
        }
    }

    pub fn shutdown(&mut self) {
        let _ = self.flush();
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.closed = true;
    }
}

impl Transport for StreamConnection {
    fn send(&mut self, packet: &Packet) -> Result<()> {
        self.send_message(packet)
    }

    fn try_recv(&mut self) -> Result<Option<Packet>> {
        self.flush()?;
        self.poll_message()
    }

    fn close(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Readiness: blocking wait on a single connection
// ============================================================================

const CONN_TOKEN: Token = Token(0);

/// A private poll used to wait for one connection to become readable
pub struct Readiness {
    poll: Poll,
    events: Events,
}

impl Readiness {
    pub fn for_connection(conn: &mut StreamConnection) -> Result<Self> {
        let poll = Poll::new()?;
        poll.registry().register(
            conn.source_mut(),
            CONN_TOKEN,
            Interest::READABLE,
        )?;
        Ok(Self {
            poll,
            events: Events::with_capacity(8),
        })
    }

    /// Block up to `timeout`; true if the connection signalled readiness
    pub fn wait(&mut self, timeout: Duration) -> Result<bool> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => Ok(!self.events.is_empty()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// In-process transport
// ============================================================================

/// One end of an in-memory packet pipe
pub struct ChannelTransport {
    tx: Option<Sender<Packet>>,
    rx: Receiver<Packet>,
}

impl ChannelTransport {
    /// Two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (
            Self {
                tx: Some(a_tx),
                rx: a_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: b_rx,
            },
        )
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, packet: &Packet) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::NetworkProtocol("channel closed".to_string()))?;
        tx.send(packet.clone())
            .map_err(|_| Error::NetworkProtocol("channel peer dropped".to_string()))
    }

    fn try_recv(&mut self) -> Result<Option<Packet>> {
        match self.rx.try_recv() {
            Ok(p) => Ok(Some(p)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(Error::NetworkProtocol("channel peer dropped".to_string()))
            }
        }
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MAX_PACKET_SIZE;
    use std::time::Instant;

    fn connected_pair() -> (StreamConnection, StreamConnection) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client =
            StreamConnection::connect("127.0.0.1", port, Duration::from_secs(2), MAX_PACKET_SIZE)
                .unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let server =
            StreamConnection::from_mio(TcpStream::from_std(accepted), peer, MAX_PACKET_SIZE);
        (client, server)
    }

    fn recv_within(conn: &mut StreamConnection, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(p) = conn.try_recv().unwrap() {
                return Some(p);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_stream_send_receive() {
        let (mut client, mut server) = connected_pair();

        client.send(&Packet::Ping).unwrap();
        client
            .send(&Packet::AsciiFrame {
                text: "hello".to_string(),
            })
            .unwrap();

        assert_eq!(recv_within(&mut server, Duration::from_secs(2)), Some(Packet::Ping));
        assert_eq!(
            recv_within(&mut server, Duration::from_secs(2)),
            Some(Packet::AsciiFrame {
                text: "hello".to_string()
            })
        );
    }

    #[test]
    fn test_eof_reported_as_error() {
        let (mut client, mut server) = connected_pair();
        client.close();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut saw_error = false;
        while Instant::now() < deadline {
            match server.try_recv() {
                Err(e) => {
                    assert!(e.is_disconnect());
                    saw_error = true;
                    break;
                }
                Ok(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        assert!(saw_error);
        assert!(server.is_closed());
    }

    #[test]
    fn test_readiness_wakes_on_data() {
        let (mut client, mut server) = connected_pair();
        let mut ready = Readiness::for_connection(&mut server).unwrap();

        client.send(&Packet::Pong).unwrap();
        assert!(ready.wait(Duration::from_secs(2)).unwrap());
        assert_eq!(recv_within(&mut server, Duration::from_secs(1)), Some(Packet::Pong));
    }

    #[test]
    fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = StreamConnection::connect("127.0.0.1", port, Duration::from_millis(500), 1024)
            .unwrap_err();
        assert!(matches!(err, Error::NetworkConnect(_)));
    }

    #[test]
    fn test_channel_pair() {
        let (mut a, mut b) = ChannelTransport::pair();
        a.send(&Packet::ClientLeave).unwrap();
        assert_eq!(b.try_recv().unwrap(), Some(Packet::ClientLeave));
        assert_eq!(b.try_recv().unwrap(), None);

        drop(a);
        assert!(b.try_recv().is_err());
    }

    #[test]
    fn test_channel_close_stops_sending() {
        let (mut a, _b) = ChannelTransport::pair();
        a.close();
        assert!(a.send(&Packet::Ping).is_err());
    }
}
