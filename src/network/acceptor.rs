//! TCP endpoint ownership
//!
//! In reverse mode the host listens and the agent dials back: the first
//! accepted connection is video, the second (when audio is enabled) is
//! audio, and anything further is closed immediately so the agent never
//! blocks. In forward mode the host dials 127.0.0.1 through the adb
//! forward in the order the agent accepts them: video, then audio; the
//! control slot is reserved and never opened here.
//!
//! Bytes are dispatched to the registered handlers on the connection's
//! read thread; the video chain and the audio chain therefore each run
//! single-threaded.

use crate::core::config::ConnectionMode;
use crate::core::error::{MirrorError, Result};
use crate::{log_verbose, log_warn};
use std::io::Read;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const READ_BUF_SIZE: usize = 65536;
/// Cancellation poll interval for accept loops and connection waits.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Read timeout so read loops notice a stop request promptly.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    Idle,
    Listening,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    pub mode: ConnectionMode,
    pub port: u16,
    pub audio_enabled: bool,
    /// Bound on forward-mode dialing of the video connection.
    pub connect_timeout: Duration,
}

impl AcceptorConfig {
    pub fn new(mode: ConnectionMode, port: u16, audio_enabled: bool) -> Self {
        Self {
            mode,
            port,
            audio_enabled,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

type DataHandler = Box<dyn FnMut(&[u8]) + Send>;
type ErrorHandler = Box<dyn FnMut(MirrorError) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Video,
    Audio,
}

struct AcceptorShared {
    state: Mutex<AcceptorState>,
    last_error: Mutex<Option<MirrorError>>,
    running: AtomicBool,
    streams: Mutex<Vec<TcpStream>>,
    video_handler: Mutex<Option<DataHandler>>,
    audio_handler: Mutex<Option<DataHandler>>,
    error_handler: Mutex<Option<ErrorHandler>>,
}

impl AcceptorShared {
    fn set_state(&self, state: AcceptorState) {
        *self.state.lock().unwrap() = state;
    }

    fn fail(&self, error: MirrorError) {
        log_warn!("NET", "Transport error: {}", error);
        let notification = match &error {
            MirrorError::ReceiveError(msg) => MirrorError::ReceiveError(msg.clone()),
            other => MirrorError::ReceiveError(other.to_string()),
        };
        *self.last_error.lock().unwrap() = Some(error);
        self.set_state(AcceptorState::Error);
        if let Some(handler) = self.error_handler.lock().unwrap().as_mut() {
            handler(notification);
        }
    }

    fn register_stream(&self, stream: &TcpStream) {
        if let Ok(clone) = stream.try_clone() {
            self.streams.lock().unwrap().push(clone);
        }
    }
}

/// Owns the TCP endpoint and the per-connection read threads.
pub struct SocketAcceptor {
    config: AcceptorConfig,
    shared: Arc<AcceptorShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SocketAcceptor {
    pub fn new(config: AcceptorConfig) -> Self {
        Self {
            config,
            shared: Arc::new(AcceptorShared {
                state: Mutex::new(AcceptorState::Idle),
                last_error: Mutex::new(None),
                running: AtomicBool::new(false),
                streams: Mutex::new(Vec::new()),
                video_handler: Mutex::new(None),
                audio_handler: Mutex::new(None),
                error_handler: Mutex::new(None),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn set_video_handler(&self, handler: DataHandler) {
        *self.shared.video_handler.lock().unwrap() = Some(handler);
    }

    pub fn set_audio_handler(&self, handler: DataHandler) {
        *self.shared.audio_handler.lock().unwrap() = Some(handler);
    }

    /// Receives fatal transport errors (video side only).
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.shared.error_handler.lock().unwrap() = Some(handler);
    }

    pub fn state(&self) -> AcceptorState {
        *self.shared.state.lock().unwrap()
    }

    /// Establish the expected connections for the configured mode.
    pub fn start(&self) -> Result<()> {
        if self.config.port == 0 {
            return Err(MirrorError::InvalidPort(self.config.port));
        }
        self.shared.running.store(true, Ordering::SeqCst);

        match self.config.mode {
            ConnectionMode::Reverse => self.start_listening(),
            ConnectionMode::Forward => {
                self.start_dialing();
                Ok(())
            }
        }
    }

    /// Cancel the listener and every connection.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        for stream in self.shared.streams.lock().unwrap().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != AcceptorState::Error {
                *state = AcceptorState::Disconnected;
            }
        }
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }

    /// Poll until the video connection is up, an error occurred, or the
    /// timeout expires.
    pub fn wait_for_video_connection(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state() {
                AcceptorState::Connected => return Ok(()),
                AcceptorState::Error => {
                    let taken = self.shared.last_error.lock().unwrap().take();
                    return Err(
                        taken.unwrap_or_else(|| MirrorError::ConnectionFailed("unknown".into()))
                    );
                }
                _ => {}
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                return Err(MirrorError::ConnectionCancelled);
            }
            if Instant::now() >= deadline {
                return Err(MirrorError::ConnectionTimeout);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn start_listening(&self) -> Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", self.config.port))
            .map_err(|e| MirrorError::from_bind_error(e, self.config.port))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| MirrorError::ListenerCreationFailed(e.to_string()))?;
        self.shared.set_state(AcceptorState::Listening);
        log_verbose!("NET", "Listening on 127.0.0.1:{}", self.config.port);

        let shared = self.shared.clone();
        let audio_enabled = self.config.audio_enabled;
        let handle = thread::spawn(move || {
            let mut accepted = 0usize;
            let mut read_threads = Vec::new();
            while shared.running.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nonblocking(false);
                        accepted += 1;
                        let kind = match accepted {
                            1 => Some(StreamKind::Video),
                            2 if audio_enabled => Some(StreamKind::Audio),
                            _ => None,
                        };
                        match kind {
                            Some(kind) => {
                                log_verbose!("NET", "Accepted {:?} connection from {}", kind, addr);
                                read_threads.push(spawn_read_loop(shared.clone(), stream, kind));
                            }
                            None => {
                                // The agent must not block on extras.
                                log_verbose!("NET", "Closing unexpected connection from {}", addr);
                                let _ = stream.shutdown(Shutdown::Both);
                            }
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(POLL_INTERVAL);
                    }
                    Err(e) => {
                        if shared.running.load(Ordering::SeqCst) {
                            shared.fail(MirrorError::ListenerFailed(e.to_string()));
                        }
                        break;
                    }
                }
            }
            for handle in read_threads {
                let _ = handle.join();
            }
        });
        self.threads.lock().unwrap().push(handle);
        Ok(())
    }

    fn start_dialing(&self) {
        self.shared.set_state(AcceptorState::Connecting);
        let shared = self.shared.clone();
        let port = self.config.port;
        let audio_enabled = self.config.audio_enabled;
        let timeout = self.config.connect_timeout;

        let handle = thread::spawn(move || {
            // Strict order: the agent accepts video first.
            let video = dial_with_retry(&shared, port, timeout);
            let video = match video {
                Some(stream) => stream,
                None => return,
            };
            shared.set_state(AcceptorState::Connected);
            let video_thread = spawn_read_loop(shared.clone(), video, StreamKind::Video);

            let mut audio_thread = None;
            if audio_enabled {
                // Audio failures are non-fatal; video continues.
                match TcpStream::connect(("127.0.0.1", port)) {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        audio_thread =
                            Some(spawn_read_loop(shared.clone(), stream, StreamKind::Audio));
                    }
                    Err(e) => {
                        log_warn!("NET", "Audio dial failed (continuing without audio): {}", e);
                    }
                }
            }

            let _ = video_thread.join();
            if let Some(handle) = audio_thread {
                let _ = handle.join();
            }
        });
        self.threads.lock().unwrap().push(handle);
    }
}

impl Drop for SocketAcceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Dial the video connection, retrying until the deadline. The agent may
/// not be listening yet when we start.
fn dial_with_retry(
    shared: &Arc<AcceptorShared>,
    port: u16,
    timeout: Duration,
) -> Option<TcpStream> {
    let deadline = Instant::now() + timeout;
    loop {
        if !shared.running.load(Ordering::SeqCst) {
            shared.set_state(AcceptorState::Disconnected);
            return None;
        }
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Some(stream);
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    *shared.last_error.lock().unwrap() = Some(MirrorError::ConnectionTimeout);
                    shared.set_state(AcceptorState::Error);
                    return None;
                }
                log_verbose!("NET", "Dial failed, retrying: {}", e);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn spawn_read_loop(
    shared: Arc<AcceptorShared>,
    stream: TcpStream,
    kind: StreamKind,
) -> JoinHandle<()> {
    shared.register_stream(&stream);
    let _ = stream.set_read_timeout(Some(READ_TIMEOUT));
    thread::spawn(move || {
        read_loop(&shared, stream, kind);
    })
}

fn read_loop(shared: &Arc<AcceptorShared>, mut stream: TcpStream, kind: StreamKind) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut total: u64 = 0;
    let start = Instant::now();
    let mut last_log = Instant::now();

    while shared.running.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => {
                log_verbose!("NET", "{:?} connection closed by peer", kind);
                if kind == StreamKind::Video {
                    shared.set_state(AcceptorState::Disconnected);
                }
                return;
            }
            Ok(n) => {
                total += n as u64;
                let handler = match kind {
                    StreamKind::Video => &shared.video_handler,
                    StreamKind::Audio => &shared.audio_handler,
                };
                if let Some(handler) = handler.lock().unwrap().as_mut() {
                    handler(&buf[..n]);
                }

                if last_log.elapsed().as_secs() >= 10 {
                    let mbps = (total as f64 * 8.0) / (start.elapsed().as_secs_f64() * 1_000_000.0);
                    log_verbose!(
                        "NET",
                        "{:?} stats: {:.1}MB, {:.2}Mbps",
                        kind,
                        total as f64 / 1_048_576.0,
                        mbps
                    );
                    last_log = Instant::now();
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                continue;
            }
            Err(e) => {
                if shared.running.load(Ordering::SeqCst) {
                    if kind == StreamKind::Video {
                        shared.fail(MirrorError::ReceiveError(e.to_string()));
                    } else {
                        log_warn!("NET", "Audio receive error: {}", e);
                    }
                }
                return;
            }
        }
    }
}
