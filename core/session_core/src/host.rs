//! Session host runtime
//!
//! The host mixes everyone's media. Three threads share one registry lock:
//!
//! ```text
//!   accept ──┐                      ┌── render (video ~60 Hz, audio 10 ms)
//!            ▼                      ▼
//!        ┌──────────────────────────────┐
//!        │ Mutex<ClientRegistry>        │
//!        │  [id 1][id 2][memory id 3]   │
//!        └──────────────────────────────┘
//!            ▲
//!   receive ─┘  (drain sockets under lock, dispatch after release)
//! ```
//!
//! Codec and renderer calls never run under the lock. Per-client failures
//! only flag the record; the receive loop sweeps flagged records after each
//! dispatch pass.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token};

use crate::error::{Error, Result};
use crate::media::{
    mix_frames, AudioCodec, AudioRing, FrameRenderer, Image, LumaRenderer, Pcm16Codec,
    AUDIO_RING_CAPACITY, MIX_FRAME_SAMPLES, SAMPLE_RATE,
};
use crate::packet::{split_audio_batch, Packet, StreamKind, MAX_PACKET_SIZE};
use crate::settings::SessionSettings;
use crate::transport::{StreamConnection, Transport};

// ============================================================================
// Constants
// ============================================================================

pub const DEFAULT_HOST_PORT: u16 = 27224;
pub const DEFAULT_MAX_CLIENTS: usize = 32;

/// Network frame size every participant sends
pub const DEFAULT_FRAME_WIDTH: u32 = 160;
pub const DEFAULT_FRAME_HEIGHT: u32 = 120;

const LISTENER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const OVERRIDE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const AUDIO_TICK: Duration = Duration::from_millis(10);
const OVERFLOW_WARN_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Configuration and collaborators
// ============================================================================

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub bind_address: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub max_clients: usize,
    pub frame_width: u32,
    pub frame_height: u32,
    pub video_fps: u32,
    pub accept_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_HOST_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            frame_width: DEFAULT_FRAME_WIDTH,
            frame_height: DEFAULT_FRAME_HEIGHT,
            video_fps: 60,
            accept_timeout: POLL_TIMEOUT,
        }
    }
}

/// Renderer and codecs the host runs with
pub struct HostMedia {
    pub renderer: Box<dyn FrameRenderer>,
    pub decoder: Box<dyn AudioCodec>,
    pub encoder: Box<dyn AudioCodec>,
}

impl Default for HostMedia {
    fn default() -> Self {
        Self {
            renderer: Box::new(LumaRenderer::default()),
            decoder: Box::new(Pcm16Codec),
            encoder: Box::new(Pcm16Codec),
        }
    }
}

/// Callbacks from the host threads; all run without the registry lock held
pub trait HostObserver: Send + Sync {
    fn on_client_join(&self, _client_id: u32) {}
    fn on_client_leave(&self, _client_id: u32) {}
    /// Mixed video, as broadcast to participants
    fn on_frame(&self, _text: &str) {}
    /// Mixed audio, before encoding
    fn on_audio(&self, _samples: &[f32]) {}
    /// A removed client's override, returned unclosed to whoever supplied it
    fn on_transport_released(&self, _client_id: u32, _transport: Box<dyn Transport>) {}
}

struct NoopObserver;

impl HostObserver for NoopObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantType {
    Network,
    /// The host's own capture, injected without a network hop
    Memory,
}

// ============================================================================
// Client registry
// ============================================================================

pub struct ClientRecord {
    pub participant_type: ParticipantType,
    pub client_id: u32,
    connection: Option<StreamConnection>,
    transport_override: Option<Box<dyn Transport>>,
    video: Image,
    video_populated: bool,
    audio: AudioRing,
    pub video_active: bool,
    pub audio_active: bool,
    pub pending_removal: bool,
    needs_drain: bool,
    last_overflow_warning: Option<Instant>,
}

impl ClientRecord {
    fn new(
        participant_type: ParticipantType,
        client_id: u32,
        connection: Option<StreamConnection>,
        width: u32,
        height: u32,
    ) -> Self {
        let memory = participant_type == ParticipantType::Memory;
        Self {
            participant_type,
            client_id,
            connection,
            transport_override: None,
            video: Image::new(width, height),
            video_populated: false,
            audio: AudioRing::new(AUDIO_RING_CAPACITY),
            video_active: memory,
            audio_active: memory,
            pending_removal: false,
            needs_drain: false,
            last_overflow_warning: None,
        }
    }

    /// Send over the override if set, else the socket; memory records discard
    fn send(&mut self, packet: &Packet) -> Result<()> {
        if let Some(t) = self.transport_override.as_mut() {
            return t.send(packet);
        }
        match self.connection.as_mut() {
            Some(conn) => conn.send(packet),
            None => Ok(()),
        }
    }

    fn push_audio(&mut self, samples: &[f32]) {
        let dropped = self.audio.push_slice(samples);
        if dropped > 0 {
            let now = Instant::now();
            let due = self
                .last_overflow_warning
                .map_or(true, |t| now.duration_since(t) >= OVERFLOW_WARN_INTERVAL);
            if due {
                warn!(
                    "Client {} audio ring full, dropped {} samples",
                    self.client_id, dropped
                );
                self.last_overflow_warning = Some(now);
            }
        }
    }

    /// Shut the socket down; an override is never closed here
    fn close(&mut self) {
        if let Some(conn) = self.connection.as_mut() {
            conn.shutdown();
        }
    }
}

/// Fixed-capacity client table with monotonic ids starting at 1
pub struct ClientRegistry {
    clients: Vec<ClientRecord>,
    capacity: usize,
    next_id: u32,
}

impl ClientRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: Vec::with_capacity(capacity),
            capacity,
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.capacity
    }

    /// Id the next insert will get
    pub fn peek_next_id(&self) -> u32 {
        self.next_id
    }

    /// Admit a record built for the next id; nothing is inserted when full
    fn insert_with(&mut self, build: impl FnOnce(u32) -> ClientRecord) -> Result<u32> {
        if self.is_full() {
            return Err(Error::SessionFull);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.clients.push(build(id));
        Ok(id)
    }

    fn get_mut(&mut self, client_id: u32) -> Option<&mut ClientRecord> {
        self.clients.iter_mut().find(|c| c.client_id == client_id)
    }

    fn remove(&mut self, client_id: u32) -> Option<ClientRecord> {
        let idx = self.clients.iter().position(|c| c.client_id == client_id)?;
        Some(self.clients.remove(idx))
    }

    pub fn ids(&self) -> Vec<u32> {
        self.clients.iter().map(|c| c.client_id).collect()
    }

    fn memory_id(&self) -> Option<u32> {
        self.clients
            .iter()
            .find(|c| c.participant_type == ParticipantType::Memory)
            .map(|c| c.client_id)
    }
}

// ============================================================================
// Counters
// ============================================================================

#[derive(Debug, Default)]
pub struct HostStats {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub audio_batches_received: AtomicU64,
    pub video_broadcasts: AtomicU64,
    pub audio_broadcasts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStatsSnapshot {
    pub connected: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub audio_batches_received: u64,
    pub video_broadcasts: u64,
    pub audio_broadcasts: u64,
}

// ============================================================================
// Shared state
// ============================================================================

struct Shared {
    registry: Mutex<ClientRegistry>,
    running: AtomicBool,
    overrides: AtomicUsize,
    observer: Arc<dyn HostObserver>,
    stats: HostStats,
    /// Registry of the receive loop's poll, for registering accepted sockets
    poll_registry: Registry,
    frame_width: u32,
    frame_height: u32,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ClientRegistry> {
        // A panicked thread leaves the table consistent; keep going
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn broadcast(&self, packet: &Packet) -> usize {
        let mut reg = self.lock();
        let mut sent = 0;
        for record in reg.clients.iter_mut().filter(|c| !c.pending_removal) {
            if record.participant_type == ParticipantType::Memory {
                continue;
            }
            match record.send(packet) {
                Ok(()) => sent += 1,
                Err(e) => {
                    debug!("Send to client {} failed: {}", record.client_id, e);
                    record.pending_removal = true;
                }
            }
        }
        sent
    }

    /// Remove a record and run the leave callback outside the lock
    fn remove_client(&self, client_id: u32) -> Result<()> {
        let mut record = {
            let mut reg = self.lock();
            reg.remove(client_id)
                .ok_or_else(|| Error::NotFound(format!("client {}", client_id)))?
        };
        if let Some(conn) = record.connection.as_mut() {
            let _ = self.poll_registry.deregister(conn.source_mut());
        }
        let released = record.transport_override.take();
        if released.is_some() {
            self.overrides.fetch_sub(1, Ordering::SeqCst);
        }
        record.close();
        info!("Client {} removed", client_id);
        if let Some(transport) = released {
            self.observer.on_transport_released(client_id, transport);
        }
        self.observer.on_client_leave(client_id);
        Ok(())
    }

    fn inject_frame(&self, client_id: u32, width: u32, height: u32, pixels: Vec<u8>) -> Result<()> {
        let image = Image::from_pixels(width, height, pixels)?;
        let scaled = image.resize(self.frame_width, self.frame_height);
        let mut reg = self.lock();
        let record = reg
            .get_mut(client_id)
            .ok_or_else(|| Error::NotFound(format!("client {}", client_id)))?;
        record.video.pixels.copy_from_slice(&scaled.pixels);
        record.video_populated = true;
        Ok(())
    }

    fn inject_audio(&self, client_id: u32, samples: &[f32]) -> Result<()> {
        let mut reg = self.lock();
        let record = reg
            .get_mut(client_id)
            .ok_or_else(|| Error::NotFound(format!("client {}", client_id)))?;
        record.push_audio(samples);
        Ok(())
    }
}

/// Handle for feeding the host's own capture into its memory participant
#[derive(Clone)]
pub struct MemoryFeed {
    shared: Arc<Shared>,
    client_id: u32,
}

impl MemoryFeed {
    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn inject_frame(&self, width: u32, height: u32, pixels: Vec<u8>) -> Result<()> {
        self.shared.inject_frame(self.client_id, width, height, pixels)
    }

    pub fn inject_audio(&self, samples: &[f32]) -> Result<()> {
        self.shared.inject_audio(self.client_id, samples)
    }
}

// ============================================================================
// SessionHost
// ============================================================================

pub struct SessionHost {
    config: HostConfig,
    shared: Arc<Shared>,
    recv_poll: Option<Poll>,
    media: Option<HostMedia>,
    local_addr: Option<SocketAddr>,
    threads: Vec<JoinHandle<()>>,
}

impl SessionHost {
    pub fn new(
        config: HostConfig,
        media: HostMedia,
        observer: Option<Arc<dyn HostObserver>>,
    ) -> Result<Self> {
        if config.max_clients == 0 {
            return Err(Error::InvalidParam("max_clients must be > 0".to_string()));
        }
        if config.frame_width == 0 || config.frame_height == 0 {
            return Err(Error::InvalidParam("frame size must be non-zero".to_string()));
        }

        let poll = Poll::new()?;
        let poll_registry = poll.registry().try_clone()?;

        let shared = Arc::new(Shared {
            registry: Mutex::new(ClientRegistry::new(config.max_clients)),
            running: AtomicBool::new(false),
            overrides: AtomicUsize::new(0),
            observer: observer.unwrap_or_else(|| Arc::new(NoopObserver)),
            stats: HostStats::default(),
            poll_registry,
            frame_width: config.frame_width,
            frame_height: config.frame_height,
        });

        Ok(Self {
            config,
            shared,
            recv_poll: Some(poll),
            media: Some(media),
            local_addr: None,
            threads: Vec::new(),
        })
    }

    /// Bind the listener and spawn the accept, receive and render threads
    pub fn start(&mut self) -> Result<()> {
        if self.shared.is_running() {
            return Err(Error::InvalidState("host already running".to_string()));
        }
        let (Some(recv_poll), Some(media)) = (self.recv_poll.take(), self.media.take()) else {
            return Err(Error::InvalidState("host cannot be restarted".to_string()));
        };

        let bind: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::InvalidParam(format!("bind address: {}", e)))?;
        let mut listener =
            TcpListener::bind(bind).map_err(|e| Error::NetworkBind(format!("{}: {}", bind, e)))?;
        let local = listener.local_addr()?;

        let accept_poll = Poll::new()?;
        accept_poll
            .registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        self.shared.running.store(true, Ordering::SeqCst);
        self.local_addr = Some(local);

        let HostMedia {
            renderer,
            decoder,
            encoder,
        } = media;

        let spawn = |name: &str, f: Box<dyn FnOnce() + Send>| {
            thread::Builder::new()
                .name(name.to_string())
                .spawn(f)
                .map_err(|e| Error::Thread(e.to_string()))
        };

        let shared = self.shared.clone();
        let timeout = self.config.accept_timeout;
        let accept = spawn(
            "host-accept",
            Box::new(move || accept_loop(shared, accept_poll, listener, timeout)),
        );

        let shared = self.shared.clone();
        let receive = spawn(
            "host-receive",
            Box::new(move || receive_loop(shared, recv_poll, decoder)),
        );

        let shared = self.shared.clone();
        let video_interval = Duration::from_micros(1_000_000 / self.config.video_fps.max(1) as u64);
        let render = spawn(
            "host-render",
            Box::new(move || render_loop(shared, renderer, encoder, video_interval)),
        );

        for handle in [accept, receive, render] {
            match handle {
                Ok(h) => self.threads.push(h),
                Err(e) => {
                    self.stop();
                    return Err(e);
                }
            }
        }

        info!("Session host listening on {}", local);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop all threads and drop every client
    pub fn stop(&mut self) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }

        let ids = self.shared.lock().ids();
        for id in ids {
            let _ = self.shared.remove_client(id);
        }

        if was_running {
            info!("Session host stopped");
        }
    }

    /// Admit the host's own capture as a participant
    pub fn add_memory_participant(&self) -> Result<u32> {
        let id = {
            let mut reg = self.shared.lock();
            if reg.memory_id().is_some() {
                return Err(Error::InvalidState(
                    "memory participant already present".to_string(),
                ));
            }
            let (w, h) = (self.config.frame_width, self.config.frame_height);
            reg.insert_with(|id| ClientRecord::new(ParticipantType::Memory, id, None, w, h))?
        };
        info!("Memory participant admitted as client {}", id);
        self.shared.observer.on_client_join(id);
        Ok(id)
    }

    pub fn memory_feed(&self) -> Option<MemoryFeed> {
        let id = self.shared.lock().memory_id()?;
        Some(MemoryFeed {
            shared: self.shared.clone(),
            client_id: id,
        })
    }

    /// Feed a frame of any size into the memory participant
    pub fn inject_frame(&self, width: u32, height: u32, pixels: Vec<u8>) -> Result<()> {
        let feed = self
            .memory_feed()
            .ok_or_else(|| Error::InvalidState("no memory participant".to_string()))?;
        feed.inject_frame(width, height, pixels)
    }

    pub fn inject_audio(&self, samples: &[f32]) -> Result<()> {
        let feed = self
            .memory_feed()
            .ok_or_else(|| Error::InvalidState("no memory participant".to_string()))?;
        feed.inject_audio(samples)
    }

    /// Admit a client that talks over an arbitrary transport
    pub fn add_client_transport(&self, transport: Box<dyn Transport>) -> Result<u32> {
        let id = {
            let mut reg = self.shared.lock();
            let (w, h) = (self.config.frame_width, self.config.frame_height);
            let id = reg.insert_with(|id| {
                let mut record = ClientRecord::new(ParticipantType::Network, id, None, w, h);
                record.transport_override = Some(transport);
                record
            })?;
            self.shared.overrides.fetch_add(1, Ordering::SeqCst);
            if let Some(record) = reg.get_mut(id) {
                if let Err(e) = record.send(&Packet::Welcome { client_id: id }) {
                    record.pending_removal = true;
                    debug!("Welcome to client {} failed: {}", id, e);
                }
            }
            id
        };
        self.shared.stats.accepted.fetch_add(1, Ordering::Relaxed);
        self.shared.observer.on_client_join(id);
        Ok(id)
    }

    pub fn remove_client(&self, client_id: u32) -> Result<()> {
        self.shared.remove_client(client_id)
    }

    /// Route a client's traffic through `transport` instead of its socket
    ///
    /// Returns the override it replaces, still open.
    pub fn set_transport_override(
        &self,
        client_id: u32,
        transport: Box<dyn Transport>,
    ) -> Result<Option<Box<dyn Transport>>> {
        let mut reg = self.shared.lock();
        let record = reg
            .get_mut(client_id)
            .ok_or_else(|| Error::NotFound(format!("client {}", client_id)))?;
        let previous = record.transport_override.replace(transport);
        if previous.is_none() {
            self.shared.overrides.fetch_add(1, Ordering::SeqCst);
        }
        debug!("Transport override set for client {}", client_id);
        Ok(previous)
    }

    /// Hand the override back to the caller and resume using the socket
    pub fn clear_transport_override(&self, client_id: u32) -> Result<Box<dyn Transport>> {
        let mut reg = self.shared.lock();
        let record = reg
            .get_mut(client_id)
            .ok_or_else(|| Error::NotFound(format!("client {}", client_id)))?;
        let transport = record
            .transport_override
            .take()
            .ok_or_else(|| Error::NotFound(format!("override for client {}", client_id)))?;
        record.needs_drain = true;
        self.shared.overrides.fetch_sub(1, Ordering::SeqCst);
        Ok(transport)
    }

    /// Send to every network client; returns how many accepted it
    pub fn broadcast(&self, packet: &Packet) -> usize {
        self.shared.broadcast(packet)
    }

    pub fn broadcast_settings(&self, settings: &SessionSettings) -> usize {
        self.broadcast(&Packet::SettingsUpdate {
            settings: settings.to_bytes().to_vec(),
        })
    }

    pub fn client_count(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn client_ids(&self) -> Vec<u32> {
        self.shared.lock().ids()
    }

    pub fn stats(&self) -> HostStatsSnapshot {
        let s = &self.shared.stats;
        HostStatsSnapshot {
            connected: self.client_count(),
            accepted: s.accepted.load(Ordering::Relaxed),
            rejected: s.rejected.load(Ordering::Relaxed),
            frames_received: s.frames_received.load(Ordering::Relaxed),
            frames_dropped: s.frames_dropped.load(Ordering::Relaxed),
            audio_batches_received: s.audio_batches_received.load(Ordering::Relaxed),
            video_broadcasts: s.video_broadcasts.load(Ordering::Relaxed),
            audio_broadcasts: s.audio_broadcasts.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SessionHost {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Accept loop
// ============================================================================

fn accept_loop(shared: Arc<Shared>, mut poll: Poll, listener: TcpListener, timeout: Duration) {
    let mut events = Events::with_capacity(64);

    while shared.is_running() {
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                warn!("Accept poll failed: {}", e);
            }
            continue;
        }

        if events.is_empty() {
            continue;
        }

        loop {
            let (mut stream, addr) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    break;
                }
            };

            let admitted = {
                let mut reg = shared.lock();
                if reg.is_full() {
                    None
                } else {
                    let id = reg.peek_next_id();
                    match shared.poll_registry.register(
                        &mut stream,
                        Token(id as usize),
                        Interest::READABLE,
                    ) {
                        Ok(()) => {
                            let conn = StreamConnection::from_mio(stream, addr, MAX_PACKET_SIZE);
                            let (w, h) = (shared.frame_width, shared.frame_height);
                            let inserted = reg
                                .insert_with(|id| {
                                    let kind = ParticipantType::Network;
                                    ClientRecord::new(kind, id, Some(conn), w, h)
                                })
                                .ok();
                            if let Some(record) = inserted.and_then(|id| reg.get_mut(id)) {
                                let client_id = record.client_id;
                                if let Err(e) = record.send(&Packet::Welcome { client_id }) {
                                    debug!("Welcome to {} failed: {}", addr, e);
                                    record.pending_removal = true;
                                }
                            }
                            inserted
                        }
                        Err(e) => {
                            warn!("Failed to register client {}: {}", addr, e);
                            None
                        }
                    }
                }
            };

            match admitted {
                Some(id) => {
                    shared.stats.accepted.fetch_add(1, Ordering::Relaxed);
                    info!("Client {} connected from {}", id, addr);
                    shared.observer.on_client_join(id);
                }
                None => {
                    shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!("Rejected connection from {} (session full)", addr);
                }
            }
        }
    }

    debug!("Accept loop exiting");
}

// ============================================================================
// Receive loop
// ============================================================================

fn receive_loop(shared: Arc<Shared>, mut poll: Poll, mut decoder: Box<dyn AudioCodec>) {
    let mut events = Events::with_capacity(256);

    while shared.is_running() {
        let timeout = if shared.overrides.load(Ordering::SeqCst) > 0 {
            OVERRIDE_POLL_INTERVAL
        } else {
            POLL_TIMEOUT
        };

        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                warn!("Receive poll failed: {}", e);
            }
            continue;
        }

        let ready: Vec<u32> = events.iter().map(|ev| ev.token().0 as u32).collect();

        // Drain sockets under the lock; dispatch after releasing it
        let inbound = {
            let mut reg = shared.lock();
            drain_clients(&mut reg, &ready)
        };

        for (client_id, packet) in inbound {
            dispatch(&shared, decoder.as_mut(), client_id, packet);
        }

        let flagged: Vec<u32> = shared
            .lock()
            .clients
            .iter()
            .filter(|c| c.pending_removal)
            .map(|c| c.client_id)
            .collect();
        for id in flagged {
            let _ = shared.remove_client(id);
        }
    }

    debug!("Receive loop exiting");
}

fn drain_clients(reg: &mut ClientRegistry, ready: &[u32]) -> Vec<(u32, Packet)> {
    let mut out = Vec::new();

    for record in reg.clients.iter_mut().filter(|c| !c.pending_removal) {
        let id = record.client_id;

        if let Some(t) = record.transport_override.as_mut() {
            loop {
                match t.try_recv() {
                    Ok(Some(p)) => out.push((id, p)),
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Client {} override transport failed: {}", id, e);
                        record.pending_removal = true;
                        break;
                    }
                }
            }
            continue;
        }

        if !(ready.contains(&id) || record.needs_drain) {
            continue;
        }
        record.needs_drain = false;

        let Some(conn) = record.connection.as_mut() else {
            continue;
        };
        loop {
            match conn.try_recv() {
                Ok(Some(p)) => out.push((id, p)),
                Ok(None) => break,
                Err(e) => {
                    debug!("Client {} disconnected: {}", id, e);
                    record.pending_removal = true;
                    break;
                }
            }
        }
    }

    out
}

fn dispatch(shared: &Shared, decoder: &mut dyn AudioCodec, client_id: u32, packet: Packet) {
    match packet {
        Packet::ImageFrame {
            width,
            height,
            pixels,
        } => {
            let mut reg = shared.lock();
            if let Some(record) = reg.get_mut(client_id) {
                if record.video.copy_from_frame(width, height, &pixels) {
                    record.video_populated = true;
                    shared.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                } else {
                    trace!(
                        "Client {} sent {}x{} frame, dropping",
                        client_id,
                        width,
                        height
                    );
                    shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Packet::AudioOpusBatch {
            frame_count,
            frame_sizes,
            data,
            ..
        } => {
            let frames = match split_audio_batch(frame_count, &frame_sizes, &data) {
                Ok(f) => f,
                Err(e) => {
                    debug!("Client {} sent bad audio batch: {}", client_id, e);
                    return;
                }
            };
            let mut samples = Vec::new();
            for frame in frames {
                match decoder.decode(frame) {
                    Ok(decoded) => samples.extend(decoded),
                    Err(e) => debug!("Client {} audio decode failed: {}", client_id, e),
                }
            }
            shared
                .stats
                .audio_batches_received
                .fetch_add(1, Ordering::Relaxed);
            let mut reg = shared.lock();
            if let Some(record) = reg.get_mut(client_id) {
                record.push_audio(&samples);
            }
        }
        Packet::StreamStart { kind } | Packet::StreamStop { kind } => {
            let active = matches!(packet, Packet::StreamStart { .. });
            let mut reg = shared.lock();
            if let Some(record) = reg.get_mut(client_id) {
                match kind {
                    StreamKind::Video => record.video_active = active,
                    StreamKind::Audio => record.audio_active = active,
                }
                debug!(
                    "Client {} {:?} stream {}",
                    client_id,
                    kind,
                    if active { "started" } else { "stopped" }
                );
            }
        }
        Packet::Ping => {
            let mut reg = shared.lock();
            if let Some(record) = reg.get_mut(client_id) {
                if record.send(&Packet::Pong).is_err() {
                    record.pending_removal = true;
                }
            }
        }
        Packet::ClientLeave => {
            let mut reg = shared.lock();
            if let Some(record) = reg.get_mut(client_id) {
                info!("Client {} leaving", client_id);
                record.pending_removal = true;
            }
        }
        Packet::Pong => {}
        other => debug!("Client {} sent unexpected {:?}", client_id, packet_name(&other)),
    }
}

fn packet_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::Welcome { .. } => "Welcome",
        Packet::AsciiFrame { .. } => "AsciiFrame",
        Packet::AudioMix { .. } => "AudioMix",
        Packet::SettingsUpdate { .. } => "SettingsUpdate",
        _ => "packet",
    }
}

// ============================================================================
// Render loop
// ============================================================================

fn render_loop(
    shared: Arc<Shared>,
    mut renderer: Box<dyn FrameRenderer>,
    mut encoder: Box<dyn AudioCodec>,
    video_interval: Duration,
) {
    let mut next_video = Instant::now();
    let mut next_audio = Instant::now();

    while shared.is_running() {
        let now = Instant::now();

        if now >= next_audio {
            mix_audio(&shared, encoder.as_mut());
            next_audio += AUDIO_TICK;
            if now > next_audio + AUDIO_TICK * 10 {
                next_audio = now + AUDIO_TICK;
            }
        }

        if now >= next_video {
            mix_video(&shared, renderer.as_mut());
            next_video += video_interval;
            if now > next_video + video_interval * 4 {
                next_video = now + video_interval;
            }
        }

        let wake = next_audio.min(next_video);
        let now = Instant::now();
        if wake > now {
            thread::sleep((wake - now).min(AUDIO_TICK));
        }
    }

    debug!("Render loop exiting");
}

fn mix_video(shared: &Shared, renderer: &mut dyn FrameRenderer) {
    let images: Vec<Image> = {
        let reg = shared.lock();
        reg.clients
            .iter()
            .filter(|c| c.video_active && c.video_populated && !c.pending_removal)
            .map(|c| c.video.clone())
            .collect()
    };

    if images.is_empty() {
        return;
    }

    let tiles: Vec<String> = images.iter().map(|img| renderer.render(img)).collect();
    let text = renderer.grid(&tiles);

    shared.observer.on_frame(&text);
    shared.broadcast(&Packet::AsciiFrame { text });
    shared.stats.video_broadcasts.fetch_add(1, Ordering::Relaxed);
}

fn mix_audio(shared: &Shared, encoder: &mut dyn AudioCodec) {
    let frames: Vec<Vec<f32>> = {
        let mut reg = shared.lock();
        reg.clients
            .iter_mut()
            .filter(|c| c.audio_active && !c.audio.is_empty() && !c.pending_removal)
            .map(|c| {
                let mut frame = vec![0.0f32; MIX_FRAME_SAMPLES];
                c.audio.read_into(&mut frame);
                frame
            })
            .collect()
    };

    if frames.is_empty() {
        return;
    }

    let mix = mix_frames(&frames, MIX_FRAME_SAMPLES);
    shared.observer.on_audio(&mix);

    match encoder.encode(&mix) {
        Ok(data) => {
            shared.broadcast(&Packet::AudioMix {
                sample_rate: SAMPLE_RATE,
                data,
            });
            shared.stats.audio_broadcasts.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => warn!("Audio mix encode failed: {}", e),
    }
}

// ============================================================================
// Tests
// ============================================================================
