//! Client side of the discovery service link
//!
//! `DiscoveryLink` is the message-level seam the discovery session drives.
//! `AcdsClient` implements it over a framed TCP connection; `ChannelLink`
//! implements it in-process.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{AcdsMessage, MAX_ACDS_MESSAGE_SIZE};
use crate::transport::{Readiness, StreamConnection};

pub trait DiscoveryLink: Send {
    fn send(&mut self, msg: &AcdsMessage) -> Result<()>;

    /// Next message, waiting at most `timeout`
    fn recv(&mut self, timeout: Duration) -> Result<Option<AcdsMessage>>;

    fn close(&mut self);
}

// ============================================================================
// TCP client
// ============================================================================

pub struct AcdsClient {
    conn: StreamConnection,
    readiness: Readiness,
}

impl AcdsClient {
    pub fn connect(address: &str, port: u16, timeout: Duration) -> Result<Self> {
        let mut conn = StreamConnection::connect(address, port, timeout, MAX_ACDS_MESSAGE_SIZE)?;
        let readiness = Readiness::for_connection(&mut conn)?;
        info!("Connected to discovery service {}", conn.peer_addr());
        Ok(Self { conn, readiness })
    }
}

impl DiscoveryLink for AcdsClient {
    fn send(&mut self, msg: &AcdsMessage) -> Result<()> {
        debug!("ACDS -> {}", msg.kind());
        self.conn.send_message(msg)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<AcdsMessage>> {
        self.conn.flush()?;
        if let Some(msg) = self.conn.poll_message::<AcdsMessage>()? {
            debug!("ACDS <- {}", msg.kind());
            return Ok(Some(msg));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if !self.readiness.wait(remaining)? {
                return Ok(None);
            }
            if let Some(msg) = self.conn.poll_message::<AcdsMessage>()? {
                debug!("ACDS <- {}", msg.kind());
                return Ok(Some(msg));
            }
        }
    }

    fn close(&mut self) {
        self.conn.shutdown();
    }
}

// ============================================================================
// In-process link
// ============================================================================

/// One end of an in-memory message pipe
pub struct ChannelLink {
    tx: Option<Sender<AcdsMessage>>,
    rx: Receiver<AcdsMessage>,
}

impl ChannelLink {
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

impl DiscoveryLink for ChannelLink {
    fn send(&mut self, msg: &AcdsMessage) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::NetworkProtocol("link closed".to_string()))?;
        tx.send(msg.clone())
            .map_err(|_| Error::NetworkProtocol("link peer dropped".to_string()))
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<AcdsMessage>> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::NetworkProtocol("link peer dropped".to_string()))
            }
        }
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

// ============================================================================
// Request/reply helper
// ============================================================================

/// Wait for the first message matching `want`, queueing the rest
pub fn await_reply(
    link: &mut dyn DiscoveryLink,
    backlog: &mut VecDeque<AcdsMessage>,
    timeout: Duration,
    want: impl Fn(&AcdsMessage) -> bool,
) -> Result<AcdsMessage> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::NetworkProtocol(
                "discovery service did not reply in time".to_string(),
            ));
        }
        match link.recv(remaining)? {
            Some(msg) if want(&msg) => return Ok(msg),
            Some(AcdsMessage::Error { code, message }) => {
                return Err(Error::Acds { code, message });
            }
            Some(other) => backlog.push_back(other),
            None => {}
        }
    }
}
