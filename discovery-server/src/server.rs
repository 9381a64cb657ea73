//! Discovery server event loop
//!
//! A single-threaded mio loop over a TCP listener and its clients:
//!
//! ```text
//!   accept ──► Client (framed) ──► Signaling::handle ──► Delivery
//!                                                          │
//!              Reply ──► sender        Session ──► every member but one
//! ```
//!
//! Housekeeping (session expiry, migration timeouts, rate-limit entries)
//! runs on a timer inside the same loop.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use session_core::protocol::{AcdsMessage, MAX_ACDS_MESSAGE_SIZE};
use session_core::transport::StreamConnection;

use crate::client::Client;
use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::signaling::{Delivery, Signaling};

// ============================================================================
// Constants
// ============================================================================

/// mio token for the listening socket
const LISTENER_TOKEN: Token = Token(0);

/// Upper bound on one poll, so timers and shutdown are noticed
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const MAX_CLIENTS: usize = 4096;

// ============================================================================
// Server Structure
// ============================================================================

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    clients: HashMap<Token, Client>,
    next_token: usize,
    signaling: Signaling,
    metrics: Arc<Metrics>,
    cleanup_interval: Duration,
    metrics_interval: Option<Duration>,
}

impl Server {
    pub fn bind(config: ServerConfig) -> io::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
            .parse()
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("bad bind address {}: {}", config.bind_address, e),
                )
            })?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;
        info!("Discovery server listening on {}", local_addr);

        let metrics = Arc::new(Metrics::new());
        let cleanup_interval = config.cleanup_interval();
        let metrics_interval = (config.metrics_log_interval_secs > 0)
            .then(|| Duration::from_secs(config.metrics_log_interval_secs));

        Ok(Server {
            poll,
            listener,
            local_addr,
            clients: HashMap::new(),
            next_token: 1,
            signaling: Signaling::new(config, Arc::clone(&metrics)),
            metrics,
            cleanup_interval,
            metrics_interval,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Serve until `shutdown` is set
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        let mut last_cleanup = Instant::now();
        let mut last_metrics = Instant::now();

        while !shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let mut readable = Vec::new();
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_clients()?,
                    token if event.is_readable() || event.is_read_closed() => readable.push(token),
                    _ => {}
                }
            }

            for token in readable {
                self.process_client(token);
            }

            self.flush_clients();
            self.cleanup_closed();

            let now = Instant::now();
            if now.duration_since(last_cleanup) >= self.cleanup_interval {
                last_cleanup = now;
                self.housekeeping(now);
            }
            if let Some(interval) = self.metrics_interval {
                if now.duration_since(last_metrics) >= interval {
                    last_metrics = now;
                    info!("Metrics:\n{}", self.metrics.render());
                }
            }
        }

        info!("Shutting down, closing {} connections", self.clients.len());
        for client in self.clients.values_mut() {
            client.conn.shutdown();
        }
        self.clients.clear();
        Ok(())
    }

    fn accept_clients(&mut self) -> io::Result<()> {
        loop {
            let (mut stream, from) = match self.listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    return Ok(());
                }
            };

            if self.clients.len() >= MAX_CLIENTS {
                warn!("Refusing {}: {} clients connected", from, self.clients.len());
                continue;
            }

            let token = Token(self.next_token);
            self.next_token += 1;
            self.poll.registry().register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            )?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay for {}: {}", from, e);
            }

            debug!("New connection from {} ({:?})", from, token);
            let conn = StreamConnection::from_mio(stream, from, MAX_ACDS_MESSAGE_SIZE);
            self.clients.insert(token, Client::new(conn, from));
            Metrics::inc(&self.metrics.active_connections);
        }
    }

    fn process_client(&mut self, token: Token) {
        let mut deliveries = Vec::new();

        // Borrow clients and signaling separately
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        if let Err(e) = client.conn.fill() {
            debug!("Read from {} failed: {}", client.observed_addr, e);
        }
        loop {
            match client.conn.next_message::<AcdsMessage>() {
                Ok(Some(msg)) => {
                    let out = self.signaling.handle(
                        client.observed_addr,
                        &mut client.membership,
                        msg,
                        Instant::now(),
                    );
                    deliveries.extend(out);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Dropping {}: {}", client.observed_addr, e);
                    client.conn.shutdown();
                    break;
                }
            }
        }

        self.deliver(token, deliveries);
    }

    fn deliver(&mut self, from: Token, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            match delivery {
                Delivery::Reply(msg) => {
                    if let Some(client) = self.clients.get_mut(&from) {
                        send(client, &msg);
                    }
                }
                Delivery::Session {
                    session_id,
                    except,
                    msg,
                } => {
                    for client in self.clients.values_mut() {
                        if client.is_member_of(&session_id) && client.participant_id() != except {
                            send(client, &msg);
                        }
                    }
                }
            }
        }
    }

    fn flush_clients(&mut self) {
        for client in self.clients.values_mut() {
            if client.conn.has_pending_output() {
                if let Err(e) = client.conn.flush() {
                    debug!("Flush to {} failed: {}", client.observed_addr, e);
                }
            }
        }
    }

    fn cleanup_closed(&mut self) {
        let closed: Vec<Token> = self
            .clients
            .iter()
            .filter(|(_, c)| c.conn.is_closed())
            .map(|(t, _)| *t)
            .collect();

        for token in closed {
            let Some(mut client) = self.clients.remove(&token) else {
                continue;
            };
            let _ = self.poll.registry().deregister(client.conn.source_mut());
            Metrics::dec(&self.metrics.active_connections);
            debug!("Connection closed: {}", client.observed_addr);

            if let Some(m) = client.membership.take() {
                let out = self.signaling.disconnect(m);
                self.deliver(token, out);
            }
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        let expired = self.signaling.cleanup(now);
        if expired.is_empty() {
            return;
        }
        for client in self.clients.values_mut() {
            if client
                .membership
                .map(|m| expired.contains(&m.session_id))
                .unwrap_or(false)
            {
                client.membership = None;
            }
        }
    }
}

fn send(client: &mut Client, msg: &AcdsMessage) {
    if let Err(e) = client.conn.send_message(msg) {
        debug!(
            "Send {} to {} failed: {}",
            msg.kind(),
            client.observed_addr,
            e
        );
    }
}
