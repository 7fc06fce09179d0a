//! Agent lifecycle
//!
//! Pushes the agent artifact, establishes the port mapping for the
//! configured connection mode, starts the remote process over an adb
//! shell, and watches it until it exits. In reverse mode the acceptor
//! must already be listening before `start_server` runs.

use crate::adb::service::AdbService;
use crate::core::config::{ConnectionMode, MirrorConfig};
use crate::core::error::{MirrorError, Result};
use crate::{log_info, log_verbose, log_warn};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Socket name the agent pairs with on the device side.
const AGENT_SOCKET: &str = "localabstract:scrcpy";
const AGENT_MAIN_CLASS: &str = "com.genymobile.scrcpy.Server";
/// How often the monitor polls the child for exit.
const MONITOR_POLL: Duration = Duration::from_millis(100);

type ExitHandler = Box<dyn FnMut(Option<i32>) + Send>;

/// Build the device-side command line for the agent in raw-stream mode.
pub fn build_agent_command(config: &MirrorConfig) -> Vec<String> {
    let mut cmd = vec![
        format!("CLASSPATH={}", MirrorConfig::AGENT_REMOTE_PATH),
        "app_process".to_string(),
        "/".to_string(),
        AGENT_MAIN_CLASS.to_string(),
        "-s".to_string(),
        config.serial.clone(),
    ];
    if config.max_size > 0 {
        cmd.push(format!("--max-size={}", config.max_size));
    }
    cmd.push(format!("--video-bit-rate={}", config.bitrate_bps));
    cmd.push(format!("--max-fps={}", config.max_fps));
    cmd.push(format!("--video-codec={}", config.video_codec.agent_name()));
    cmd.push("--no-playback".to_string());
    if config.audio_enabled {
        cmd.push(format!("--audio-codec={}", config.audio_codec.agent_name()));
    } else {
        cmd.push("--no-audio".to_string());
    }
    cmd.push("--no-control".to_string());
    cmd.push("--video-source=display".to_string());
    if config.stay_awake {
        cmd.push("--stay-awake".to_string());
    }
    if config.show_touches {
        cmd.push("--show-touches".to_string());
    }
    if config.turn_screen_off {
        cmd.push("--turn-screen-off".to_string());
    }
    cmd
}

pub struct ServerLauncher {
    adb: Arc<dyn AdbService>,
    child: Arc<Mutex<Option<Child>>>,
    stopping: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    exit_handler: Arc<Mutex<Option<ExitHandler>>>,
    mapping: Mutex<Option<(ConnectionMode, String, u16)>>,
}

impl ServerLauncher {
    pub fn new(adb: Arc<dyn AdbService>) -> Self {
        Self {
            adb,
            child: Arc::new(Mutex::new(None)),
            stopping: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(None),
            exit_handler: Arc::new(Mutex::new(None)),
            mapping: Mutex::new(None),
        }
    }

    /// The device-management channel this launcher drives.
    pub fn adb(&self) -> Arc<dyn AdbService> {
        self.adb.clone()
    }

    /// Called with the exit code when the agent terminates on its own.
    /// Codes 0 and 15 are normal; anything else is abnormal.
    pub fn set_exit_handler(&self, handler: ExitHandler) {
        *self.exit_handler.lock().unwrap() = Some(handler);
    }

    /// Push the agent artifact and establish the port mapping. Must
    /// complete before the first agent-side connection attempt: reverse
    /// mode requires the host listener to be up when the agent dials.
    pub fn prepare_environment(&self, config: &MirrorConfig) -> Result<()> {
        self.adb.ensure_device_ready(&config.serial)?;
        self.adb
            .push(&config.serial, &config.agent_path, MirrorConfig::AGENT_REMOTE_PATH)?;
        log_verbose!("LAUNCH", "Agent pushed to {}", MirrorConfig::AGENT_REMOTE_PATH);

        match config.connection_mode {
            ConnectionMode::Reverse => {
                self.adb
                    .reverse(&config.serial, AGENT_SOCKET, config.port)?;
            }
            ConnectionMode::Forward => {
                self.adb.forward(&config.serial, config.port, AGENT_SOCKET)?;
            }
        }
        *self.mapping.lock().unwrap() = Some((
            config.connection_mode,
            config.serial.clone(),
            config.port,
        ));
        Ok(())
    }

    /// Spawn the agent. Returns once the process is started; connection
    /// establishment is the acceptor's business.
    pub fn start_server(&self, config: &MirrorConfig) -> Result<()> {
        // Leftovers from a previous run would hold the encoder.
        let _ = self
            .adb
            .shell(&config.serial, &["pkill", "-f", AGENT_MAIN_CLASS]);

        self.stopping.store(false, Ordering::SeqCst);
        let command = build_agent_command(config);
        let child = self.adb.spawn_shell(&config.serial, &command)?;
        log_info!("LAUNCH", "Agent started on {}", config.serial);
        *self.child.lock().unwrap() = Some(child);
        self.spawn_monitor();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.child.lock().unwrap().is_some()
    }

    /// Terminate the agent and release the port mapping. An exit caused
    /// by this call is not reported through the exit handler.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);

        if let Some((_, serial, _)) = self.mapping.lock().unwrap().clone() {
            // Agent-side first so the device encoder is released even if
            // the local adb process lingers.
            let _ = self.adb.shell(&serial, &["pkill", "-f", AGENT_MAIN_CLASS]);
        }
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.release_environment();
    }

    /// Remove the forward/reverse mapping if one is active.
    pub fn release_environment(&self) {
        if let Some((mode, serial, port)) = self.mapping.lock().unwrap().take() {
            let result = match mode {
                ConnectionMode::Reverse => self.adb.remove_reverse(&serial, AGENT_SOCKET),
                ConnectionMode::Forward => self.adb.remove_forward(&serial, port),
            };
            if let Err(e) = result {
                log_warn!("LAUNCH", "Failed to release port mapping: {}", e);
            }
        }
    }

    fn spawn_monitor(&self) {
        let child = self.child.clone();
        let stopping = self.stopping.clone();
        let exit_handler = self.exit_handler.clone();

        let handle = thread::spawn(move || {
            loop {
                let status = {
                    let mut guard = child.lock().unwrap();
                    match guard.as_mut() {
                        // stop() took the child; nothing to report.
                        None => return,
                        Some(c) => match c.try_wait() {
                            Ok(Some(status)) => {
                                guard.take();
                                Some(status)
                            }
                            Ok(None) => None,
                            Err(e) => {
                                log_warn!("LAUNCH", "Monitor wait failed: {}", e);
                                guard.take();
                                return;
                            }
                        },
                    }
                };
                if let Some(status) = status {
                    if stopping.load(Ordering::SeqCst) {
                        return;
                    }
                    let code = status.code();
                    log_info!("LAUNCH", "Agent exited with {:?}", code);
                    if let Some(handler) = exit_handler.lock().unwrap().as_mut() {
                        handler(code);
                    }
                    return;
                }
                thread::sleep(MONITOR_POLL);
            }
        });
        *self.monitor.lock().unwrap() = Some(handle);
    }
}

impl Drop for ServerLauncher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Exit codes 0 and 15 (SIGTERM-induced) are a normal agent shutdown.
pub fn is_normal_exit(code: Option<i32>) -> bool {
    matches!(code, Some(0) | Some(15) | None)
}
