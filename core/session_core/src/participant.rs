//! Session participant runtime
//!
//! Connects to the host, streams captured video and audio from two worker
//! threads, and hands the mixed output back to the caller through `poll`.
//!
//! The capture threads share the connection with `poll` behind a mutex.
//! Each thread owns its source while running and returns it when joined, so
//! streams can be stopped and restarted.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::host::{DEFAULT_FRAME_HEIGHT, DEFAULT_FRAME_WIDTH, DEFAULT_HOST_PORT};
use crate::media::{AudioCodec, Image, Pcm16Codec, CAPTURE_FRAME_SAMPLES, SAMPLE_RATE};
use crate::migration::{HostLiveness, KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT};
use crate::packet::{Packet, StreamKind, MAX_PACKET_SIZE};
use crate::settings::{needs_update, SessionSettings};
use crate::transport::{Readiness, StreamConnection, Transport};

const CAPTURE_FRAME_MS: u16 = 20;
const IDLE_WAIT: Duration = Duration::from_millis(2);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    pub host_address: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub enable_video: bool,
    pub enable_audio: bool,
    /// Network frame size; must match the host's buffers
    pub frame_width: u32,
    pub frame_height: u32,
    pub video_fps: u32,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            host_address: "127.0.0.1".to_string(),
            port: DEFAULT_HOST_PORT,
            connect_timeout: Duration::from_secs(5),
            enable_video: true,
            enable_audio: true,
            frame_width: DEFAULT_FRAME_WIDTH,
            frame_height: DEFAULT_FRAME_HEIGHT,
            video_fps: 30,
            keepalive_interval: KEEPALIVE_INTERVAL,
            keepalive_timeout: KEEPALIVE_TIMEOUT,
        }
    }
}

// ============================================================================
// Capture sources
// ============================================================================

pub trait VideoSource: Send {
    /// Next frame, or `None` if nothing new is ready
    fn next_frame(&mut self) -> Result<Option<Image>>;
}

pub trait AudioSource: Send {
    /// Fill `out` with mono samples at 48 kHz; returns how many were written
    fn read(&mut self, out: &mut [f32]) -> Result<usize>;
}

/// Moving diagonal gradient
#[derive(Debug, Clone)]
pub struct TestPatternSource {
    pub width: u32,
    pub height: u32,
    tick: u32,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: 0,
        }
    }
}

impl VideoSource for TestPatternSource {
    fn next_frame(&mut self) -> Result<Option<Image>> {
        let mut img = Image::new(self.width, self.height);
        let span = (self.width + self.height).max(1);
        for y in 0..self.height {
            for x in 0..self.width {
                let v = (((x + y + self.tick) % span) * 255 / span) as u8;
                let i = ((y * self.width + x) * 3) as usize;
                img.pixels[i..i + 3].copy_from_slice(&[v, v, v]);
            }
        }
        self.tick = self.tick.wrapping_add(1);
        Ok(Some(img))
    }
}

/// Sine tone
#[derive(Debug, Clone)]
pub struct ToneSource {
    pub frequency: f32,
    pub amplitude: f32,
    phase: f32,
}

impl ToneSource {
    pub fn new(frequency: f32, amplitude: f32) -> Self {
        Self {
            frequency,
            amplitude,
            phase: 0.0,
        }
    }
}

impl AudioSource for ToneSource {
    fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        let step = TAU * self.frequency / SAMPLE_RATE as f32;
        for s in out.iter_mut() {
            *s = self.phase.sin() * self.amplitude;
            self.phase = (self.phase + step) % TAU;
        }
        Ok(out.len())
    }
}

// ============================================================================
// Host output
// ============================================================================

/// What `poll` surfaced from the host
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Welcome(u32),
    Frame(String),
    Audio(Vec<f32>),
    Settings(SessionSettings),
}

// ============================================================================
// Capture threads
// ============================================================================

type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

fn lock_transport(t: &SharedTransport) -> MutexGuard<'_, Box<dyn Transport>> {
    t.lock().unwrap_or_else(|e| e.into_inner())
}

struct CaptureTask<T> {
    running: Arc<AtomicBool>,
    handle: JoinHandle<T>,
}

impl<T> CaptureTask<T> {
    fn spawn(name: &str, f: impl FnOnce(Arc<AtomicBool>) -> T + Send + 'static) -> Result<Self>
    where
        T: Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || f(flag))
            .map_err(|e| Error::Thread(e.to_string()))?;
        Ok(Self { running, handle })
    }

    /// Signal and join; `None` if the thread panicked
    fn stop(self) -> Option<T> {
        self.running.store(false, Ordering::SeqCst);
        self.handle.join().ok()
    }
}

struct VideoWorker {
    source: Box<dyn VideoSource>,
    transport: SharedTransport,
    link_failed: Arc<AtomicBool>,
    width: u32,
    height: u32,
    interval: Duration,
}

impl VideoWorker {
    fn run(mut self, running: Arc<AtomicBool>) -> Box<dyn VideoSource> {
        let mut next = Instant::now();
        while running.load(Ordering::SeqCst) {
            match self.source.next_frame() {
                Ok(Some(frame)) => {
                    let frame = if frame.width == self.width && frame.height == self.height {
                        frame
                    } else {
                        frame.resize(self.width, self.height)
                    };
                    let packet = Packet::ImageFrame {
                        width: frame.width,
                        height: frame.height,
                        pixels: frame.pixels,
                    };
                    if let Err(e) = lock_transport(&self.transport).send(&packet) {
                        warn!("Video send failed: {}", e);
                        self.link_failed.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("Video source error: {}", e),
            }

            next += self.interval;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                next = now;
            }
        }
        self.source
    }
}

struct AudioWorker {
    source: Box<dyn AudioSource>,
    encoder: Box<dyn AudioCodec>,
    transport: SharedTransport,
    link_failed: Arc<AtomicBool>,
}

impl AudioWorker {
    fn run(mut self, running: Arc<AtomicBool>) -> (Box<dyn AudioSource>, Box<dyn AudioCodec>) {
        let interval = Duration::from_millis(CAPTURE_FRAME_MS as u64);
        let mut chunk = vec![0.0f32; CAPTURE_FRAME_SAMPLES];
        let mut next = Instant::now();

        while running.load(Ordering::SeqCst) {
            match self.source.read(&mut chunk) {
                Ok(n) if n > 0 => {
                    let batch = self.encoder.encode(&chunk[..n]).and_then(|frame| {
                        Packet::audio_batch(SAMPLE_RATE, CAPTURE_FRAME_MS, &[frame])
                    });
                    match batch {
                        Ok(packet) => {
                            if let Err(e) = lock_transport(&self.transport).send(&packet) {
                                warn!("Audio send failed: {}", e);
                                self.link_failed.store(true, Ordering::SeqCst);
                                break;
                            }
                        }
                        Err(e) => debug!("Audio encode failed: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("Audio source error: {}", e),
            }

            next += interval;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                next = now;
            }
        }
        (self.source, self.encoder)
    }
}

// ============================================================================
// SessionParticipant
// ============================================================================

pub struct SessionParticipant {
    config: ParticipantConfig,
    transport: Option<SharedTransport>,
    readiness: Option<Readiness>,
    client_id: Option<u32>,

    video_source: Option<Box<dyn VideoSource>>,
    audio_source: Option<Box<dyn AudioSource>>,
    encoder: Option<Box<dyn AudioCodec>>,
    decoder: Box<dyn AudioCodec>,
    video_task: Option<CaptureTask<Box<dyn VideoSource>>>,
    audio_task: Option<CaptureTask<(Box<dyn AudioSource>, Box<dyn AudioCodec>)>>,

    settings: SessionSettings,
    liveness: HostLiveness,
    link_failed: Arc<AtomicBool>,
}

impl SessionParticipant {
    pub fn new(config: ParticipantConfig) -> Self {
        let source_w = config.frame_width;
        let source_h = config.frame_height;
        let liveness = HostLiveness::with_timing(
            Instant::now(),
            config.keepalive_interval,
            config.keepalive_timeout,
        );
        Self {
            config,
            transport: None,
            readiness: None,
            client_id: None,
            video_source: Some(Box::new(TestPatternSource::new(source_w, source_h))),
            audio_source: Some(Box::new(ToneSource::new(440.0, 0.1))),
            encoder: Some(Box::new(Pcm16Codec)),
            decoder: Box::new(Pcm16Codec),
            video_task: None,
            audio_task: None,
            settings: SessionSettings::default(),
            liveness,
            link_failed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_video_source(mut self, source: Box<dyn VideoSource>) -> Self {
        self.video_source = Some(source);
        self
    }

    pub fn with_audio_source(mut self, source: Box<dyn AudioSource>) -> Self {
        self.audio_source = Some(source);
        self
    }

    pub fn with_codec(
        mut self,
        encoder: Box<dyn AudioCodec>,
        decoder: Box<dyn AudioCodec>,
    ) -> Self {
        self.encoder = Some(encoder);
        self.decoder = decoder;
        self
    }

    pub fn config(&self) -> &ParticipantConfig {
        &self.config
    }

    /// Connect to the configured host over TCP
    pub fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::InvalidState("already connected".to_string()));
        }
        let mut conn = StreamConnection::connect(
            &self.config.host_address,
            self.config.port,
            self.config.connect_timeout,
            MAX_PACKET_SIZE,
        )?;
        self.readiness = Some(Readiness::for_connection(&mut conn)?);
        info!(
            "Connected to host {}:{}",
            self.config.host_address, self.config.port
        );
        self.attach(Box::new(conn));
        Ok(())
    }

    /// Use an already-established transport (e.g. an in-process channel)
    pub fn connect_with(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        if self.is_connected() {
            return Err(Error::InvalidState("already connected".to_string()));
        }
        self.readiness = None;
        self.attach(transport);
        Ok(())
    }

    fn attach(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(Arc::new(Mutex::new(transport)));
        self.link_failed.store(false, Ordering::SeqCst);
        self.liveness = HostLiveness::with_timing(
            Instant::now(),
            self.config.keepalive_interval,
            self.config.keepalive_timeout,
        );
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn client_id(&self) -> Option<u32> {
        self.client_id
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.liveness.rtt
    }

    pub fn is_video_running(&self) -> bool {
        self.video_task.is_some()
    }

    pub fn is_audio_running(&self) -> bool {
        self.audio_task.is_some()
    }

    fn connected_transport(&self, enabled: bool, what: &str) -> Result<SharedTransport> {
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| Error::InvalidState(format!("cannot start {}: not connected", what)))?;
        if !enabled {
            return Err(Error::InvalidState(format!("{} is disabled", what)));
        }
        Ok(transport)
    }

    fn send(&self, packet: &Packet) -> Result<()> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| Error::InvalidState("not connected".to_string()))?;
        let result = lock_transport(transport).send(packet);
        if result.is_err() {
            self.link_failed.store(true, Ordering::SeqCst);
        }
        result
    }

    pub fn start_video(&mut self) -> Result<()> {
        let transport = self.connected_transport(self.config.enable_video, "video")?;
        if self.video_task.is_some() {
            return Ok(());
        }
        let source = self
            .video_source
            .take()
            .ok_or_else(|| Error::InvalidState("video source unavailable".to_string()))?;

        if let Err(e) = self.send(&Packet::StreamStart {
            kind: StreamKind::Video,
        }) {
            self.video_source = Some(source);
            return Err(e);
        }

        let worker = VideoWorker {
            source,
            transport,
            link_failed: self.link_failed.clone(),
            width: self.config.frame_width,
            height: self.config.frame_height,
            interval: Duration::from_micros(1_000_000 / self.config.video_fps.max(1) as u64),
        };
        self.video_task = Some(CaptureTask::spawn("capture-video", move |running| {
            worker.run(running)
        })?);
        debug!("Video capture started");
        Ok(())
    }

    pub fn stop_video(&mut self) -> Result<()> {
        let Some(task) = self.video_task.take() else {
            return Ok(());
        };
        match task.stop() {
            Some(source) => self.video_source = Some(source),
            None => warn!("Video capture thread panicked"),
        }
        if self.is_connected() {
            self.send(&Packet::StreamStop {
                kind: StreamKind::Video,
            })?;
        }
        debug!("Video capture stopped");
        Ok(())
    }

    pub fn start_audio(&mut self) -> Result<()> {
        let transport = self.connected_transport(self.config.enable_audio, "audio")?;
        if self.audio_task.is_some() {
            return Ok(());
        }
        let (Some(source), Some(encoder)) = (self.audio_source.take(), self.encoder.take()) else {
            return Err(Error::InvalidState("audio source unavailable".to_string()));
        };

        if let Err(e) = self.send(&Packet::StreamStart {
            kind: StreamKind::Audio,
        }) {
            self.audio_source = Some(source);
            self.encoder = Some(encoder);
            return Err(e);
        }

        let worker = AudioWorker {
            source,
            encoder,
            transport,
            link_failed: self.link_failed.clone(),
        };
        self.audio_task = Some(CaptureTask::spawn("capture-audio", move |running| {
            worker.run(running)
        })?);
        debug!("Audio capture started");
        Ok(())
    }

    pub fn stop_audio(&mut self) -> Result<()> {
        let Some(task) = self.audio_task.take() else {
            return Ok(());
        };
        match task.stop() {
            Some((source, encoder)) => {
                self.audio_source = Some(source);
                self.encoder = Some(encoder);
            }
            None => warn!("Audio capture thread panicked"),
        }
        if self.is_connected() {
            self.send(&Packet::StreamStop {
                kind: StreamKind::Audio,
            })?;
        }
        debug!("Audio capture stopped");
        Ok(())
    }

    /// Wait up to `timeout` for host traffic, then drain it and run keepalive
    pub fn poll(&mut self, timeout: Duration) -> Result<Vec<HostEvent>> {
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| Error::InvalidState("not connected".to_string()))?;

        let mut packets = self.drain(&transport);
        if packets.is_empty() && !self.link_failed.load(Ordering::SeqCst) {
            match self.readiness.as_mut() {
                Some(r) => {
                    r.wait(timeout)?;
                }
                None => thread::sleep(timeout.min(IDLE_WAIT)),
            }
            packets = self.drain(&transport);
        }

        let now = Instant::now();
        let mut events = Vec::new();
        for packet in packets {
            self.liveness.record_heard(now, packet == Packet::Pong);
            if let Some(ev) = self.handle_packet(packet) {
                events.push(ev);
            }
        }

        if self.link_failed.load(Ordering::SeqCst) {
            self.liveness.mark_failed();
            return Ok(events);
        }

        if self.liveness.check_timeout(now) {
            warn!(
                "Host missed {} keepalives",
                self.liveness.missed_keepalives
            );
        }
        if self.liveness.should_send_ping(now) && self.send(&Packet::Ping).is_ok() {
            self.liveness.record_ping_sent(now);
        }

        Ok(events)
    }

    fn drain(&self, transport: &SharedTransport) -> Vec<Packet> {
        let mut out = Vec::new();
        let mut guard = lock_transport(transport);
        loop {
            match guard.try_recv() {
                Ok(Some(p)) => out.push(p),
                Ok(None) => break,
                Err(e) => {
                    if !self.link_failed.swap(true, Ordering::SeqCst) {
                        warn!("Host connection lost: {}", e);
                    }
                    break;
                }
            }
        }
        out
    }

    fn handle_packet(&mut self, packet: Packet) -> Option<HostEvent> {
        match packet {
            Packet::Welcome { client_id } => {
                info!("Admitted by host as client {}", client_id);
                self.client_id = Some(client_id);
                Some(HostEvent::Welcome(client_id))
            }
            Packet::AsciiFrame { text } => Some(HostEvent::Frame(text)),
            Packet::AudioMix { data, .. } => match self.decoder.decode(&data) {
                Ok(samples) => Some(HostEvent::Audio(samples)),
                Err(e) => {
                    debug!("Audio mix decode failed: {}", e);
                    None
                }
            },
            Packet::SettingsUpdate { settings } => match SessionSettings::from_bytes(&settings) {
                Ok(remote) if needs_update(self.settings.version, remote.version) => {
                    debug!("Applying settings version {}", remote.version);
                    self.settings = remote;
                    Some(HostEvent::Settings(remote))
                }
                Ok(_) => None,
                Err(e) => {
                    debug!("Bad settings update: {}", e);
                    None
                }
            },
            Packet::Pong => None,
            other => {
                debug!(
                    "Ignoring unexpected packet from host: {:?}",
                    std::mem::discriminant(&other)
                );
                None
            }
        }
    }

    /// False after a connection error/EOF or too many missed keepalives
    pub fn is_host_alive(&self) -> bool {
        self.is_connected() && !self.link_failed.load(Ordering::SeqCst) && self.liveness.is_alive()
    }

    /// The connection itself failed, as opposed to keepalives going unanswered
    pub fn connection_lost(&self) -> bool {
        self.link_failed.load(Ordering::SeqCst)
    }

    /// Stop capture, say goodbye and drop the connection
    pub fn stop(&mut self) {
        let _ = self.stop_video();
        let _ = self.stop_audio();
        if let Some(transport) = self.transport.take() {
            let mut guard = lock_transport(&transport);
            if !self.link_failed.load(Ordering::SeqCst) {
                let _ = guard.send(&Packet::ClientLeave);
            }
            guard.close();
        }
        self.readiness = None;
        self.client_id = None;
    }
}

impl Drop for SessionParticipant {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    fn quiet_config() -> ParticipantConfig {
        ParticipantConfig {
            frame_width: 4,
            frame_height: 2,
            video_fps: 100,
            ..Default::default()
        }
    }

    fn wait_for(peer: &mut ChannelTransport, want: fn(&Packet) -> bool) -> Option<Packet> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            match peer.try_recv() {
                Ok(Some(p)) if want(&p) => return Some(p),
                Ok(_) => thread::sleep(Duration::from_millis(2)),
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn test_start_requires_connection() {
        let mut p = SessionParticipant::new(quiet_config());
        assert!(matches!(p.start_video(), Err(Error::InvalidState(_))));
        assert!(matches!(p.start_audio(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_start_requires_enabled_stream() {
        let mut p = SessionParticipant::new(ParticipantConfig {
            enable_video: false,
            ..quiet_config()
        });
        let (ours, _theirs) = ChannelTransport::pair();
        p.connect_with(Box::new(ours)).unwrap();
        assert!(matches!(p.start_video(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_video_stream_lifecycle() {
        let mut p = SessionParticipant::new(quiet_config());
        let (ours, mut host) = ChannelTransport::pair();
        p.connect_with(Box::new(ours)).unwrap();

        p.start_video().unwrap();
        assert_eq!(
            wait_for(&mut host, |p| matches!(p, Packet::StreamStart { .. })),
            Some(Packet::StreamStart {
                kind: StreamKind::Video
            })
        );
        match wait_for(&mut host, |p| matches!(p, Packet::ImageFrame { .. })) {
            Some(Packet::ImageFrame {
                width,
                height,
                pixels,
            }) => {
                assert_eq!((width, height), (4, 2));
                assert_eq!(pixels.len(), 4 * 2 * 3);
            }
            other => panic!("Expected ImageFrame, got {:?}", other),
        }

        p.stop_video().unwrap();
        assert!(!p.is_video_running());
        assert!(wait_for(&mut host, |p| *p
            == Packet::StreamStop {
                kind: StreamKind::Video
            })
        .is_some());

        // Source was returned; restart works
        p.start_video().unwrap();
        p.stop();
        assert!(wait_for(&mut host, |p| *p == Packet::ClientLeave).is_some());
    }

    #[test]
    fn test_audio_batches_sent() {
        let mut p = SessionParticipant::new(quiet_config());
        let (ours, mut host) = ChannelTransport::pair();
        p.connect_with(Box::new(ours)).unwrap();
        p.start_audio().unwrap();

        match wait_for(&mut host, |p| matches!(p, Packet::AudioOpusBatch { .. })) {
            Some(Packet::AudioOpusBatch {
                sample_rate,
                frame_count,
                frame_sizes,
                ..
            }) => {
                assert_eq!(sample_rate, SAMPLE_RATE);
                assert_eq!(frame_count, 1);
                assert_eq!(frame_sizes, vec![(CAPTURE_FRAME_SAMPLES * 2) as u16]);
            }
            other => panic!("Expected AudioOpusBatch, got {:?}", other),
        }
        p.stop();
    }

    #[test]
    fn test_poll_surfaces_host_output() {
        let mut p = SessionParticipant::new(quiet_config());
        let (ours, mut host) = ChannelTransport::pair();
        p.connect_with(Box::new(ours)).unwrap();

        host.send(&Packet::Welcome { client_id: 7 }).unwrap();
        host.send(&Packet::AsciiFrame {
            text: "@@".to_string(),
        })
        .unwrap();

        let events = p.poll(Duration::from_millis(10)).unwrap();
        assert_eq!(
            events,
            vec![HostEvent::Welcome(7), HostEvent::Frame("@@".to_string())]
        );
        assert_eq!(p.client_id(), Some(7));
        assert!(p.is_host_alive());
    }

    #[test]
    fn test_settings_only_applied_when_newer() {
        let mut p = SessionParticipant::new(quiet_config());
        let (ours, mut host) = ChannelTransport::pair();
        p.connect_with(Box::new(ours)).unwrap();

        let mut newer = SessionSettings::default();
        newer.version = p.settings().version + 1;
        newer.width = 120;
        host.send(&Packet::SettingsUpdate {
            settings: newer.to_bytes().to_vec(),
        })
        .unwrap();
        let events = p.poll(Duration::from_millis(10)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(p.settings().width, 120);

        let mut stale = newer;
        stale.width = 10;
        host.send(&Packet::SettingsUpdate {
            settings: stale.to_bytes().to_vec(),
        })
        .unwrap();
        assert!(p.poll(Duration::from_millis(10)).unwrap().is_empty());
        assert_eq!(p.settings().width, 120);
    }

    #[test]
    fn test_dropped_host_detected() {
        let mut p = SessionParticipant::new(quiet_config());
        let (ours, host) = ChannelTransport::pair();
        p.connect_with(Box::new(ours)).unwrap();
        drop(host);

        p.poll(Duration::from_millis(10)).unwrap();
        assert!(!p.is_host_alive());
    }

    #[test]
    fn test_missed_keepalives_fail_host() {
        let mut p = SessionParticipant::new(ParticipantConfig {
            keepalive_interval: Duration::from_millis(5),
            keepalive_timeout: Duration::from_millis(5),
            ..quiet_config()
        });
        let (ours, mut host) = ChannelTransport::pair();
        p.connect_with(Box::new(ours)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while p.is_host_alive() && Instant::now() < deadline {
            p.poll(Duration::from_millis(3)).unwrap();
            // Drain pings without answering
            while let Ok(Some(_)) = host.try_recv() {}
        }
        assert!(!p.is_host_alive());
    }

    #[test]
    fn test_tone_source_amplitude() {
        let mut tone = ToneSource::new(1000.0, 0.5);
        let mut buf = [0.0f32; 480];
        assert_eq!(tone.read(&mut buf).unwrap(), 480);
        assert!(buf.iter().all(|s| s.abs() <= 0.5 + 1e-6));
        assert!(buf.iter().any(|s| s.abs() > 0.4));
    }
}
