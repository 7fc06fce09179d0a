//! Top-level session coordination
//!
//! Owns the launcher, the acceptor, both stream chains, and the frame
//! pipeline; drives the state machine and tears everything down on
//! failure. The video chain (parser -> decoder -> pipeline) runs on the
//! video read thread, the audio chain (parser -> decoder -> synchronizer
//! -> regulator) on the audio read thread, so neither chain needs locks
//! internally.

use crate::adb::launcher::{is_normal_exit, ServerLauncher};
use crate::adb::service::AdbService;
use crate::audio::decoder::{
    create_audio_decoder, AudioDecoder, AudioFormat, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE,
};
use crate::audio::parser::AudioStreamParser;
use crate::audio::regulator::{AudioRegulator, RegulatorConfig};
use crate::audio::sink::{start_pull_worker, AudioSink, PullWorkerHandle};
use crate::audio::sync::AudioSynchronizer;
use crate::core::config::{ConnectionMode, MirrorConfig, VideoCodec};
use crate::core::error::{MirrorError, Result};
use crate::core::frame::VideoFrame;
use crate::core::power::{PowerCoordinator, PowerHold};
use crate::network::acceptor::{AcceptorConfig, SocketAcceptor};
use crate::network::ports::PortProbe;
use crate::video::decoder::VideoDecoder;
use crate::video::parser::{VideoFraming, VideoStreamParser};
use crate::video::pipeline::{FramePipeline, TaskScheduler};
use crate::{log_error, log_info, log_verbose, log_warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Assumed portrait size until the first frame tells us better.
const DEFAULT_FRAME_SIZE: (u32, u32) = (1080, 1920);
/// Bound on waiting for the agent's video connection.
const VIDEO_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Capturing,
    Paused,
    Disconnected,
    Error,
}

pub type VideoDecoderFactory = Box<dyn Fn() -> Box<dyn VideoDecoder> + Send + Sync>;

struct SessionCore {
    state: Mutex<SessionState>,
    last_error: Mutex<Option<MirrorError>>,
}

impl SessionCore {
    fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        let mut guard = self.state.lock().unwrap();
        if *guard != state {
            log_info!("SESSION", "{:?} -> {:?}", *guard, state);
            *guard = state;
        }
    }

    fn fail(&self, error: MirrorError) {
        log_error!("SESSION", "{}", error);
        *self.last_error.lock().unwrap() = Some(error);
        self.set_state(SessionState::Error);
    }
}

/// Everything the video read thread owns.
struct VideoChain {
    parser: VideoStreamParser,
    decoder: Box<dyn VideoDecoder>,
    /// SPS payload the decoder was last initialized with. `None` while
    /// the decoder is unconfigured; compared against every incoming SPS
    /// so each genuine change triggers its own reconfiguration, no
    /// matter how many land in one read.
    configured_sps: Option<Vec<u8>>,
    latest_size: Option<(u32, u32)>,
}

pub struct ScrcpySession {
    config: MirrorConfig,
    core: Arc<SessionCore>,
    launcher: Arc<ServerLauncher>,
    acceptor: Mutex<Option<SocketAcceptor>>,
    pipeline: Arc<FramePipeline>,
    regulator: Arc<AudioRegulator>,
    synchronizer: Arc<Mutex<AudioSynchronizer>>,
    video: Arc<Mutex<VideoChain>>,
    audio_parser: Arc<Mutex<AudioStreamParser>>,
    audio_decoder: Arc<Mutex<Option<Box<dyn AudioDecoder>>>>,
    decoder_factory: Arc<VideoDecoderFactory>,
    power: PowerCoordinator,
    power_hold: Mutex<Option<PowerHold>>,
    audio_sink: Mutex<Option<Box<dyn AudioSink>>>,
    pull_worker: Mutex<Option<PullWorkerHandle>>,
}

impl ScrcpySession {
    /// Build a session from its collaborators. `ScrcpySession::new` wires
    /// the production ones; tests inject doubles here.
    pub fn with_parts(
        config: MirrorConfig,
        adb: Arc<dyn AdbService>,
        decoder_factory: VideoDecoderFactory,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        let regulator = Arc::new(AudioRegulator::new(
            RegulatorConfig::new(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS)
                .with_target_ms(config.target_buffering_ms),
        ));
        let decoder_factory = Arc::new(decoder_factory);
        let video = Arc::new(Mutex::new(VideoChain {
            parser: VideoStreamParser::new(config.video_codec, VideoFraming::AnnexB),
            decoder: (*decoder_factory)(),
            configured_sps: None,
            latest_size: None,
        }));

        Self {
            config,
            core: Arc::new(SessionCore {
                state: Mutex::new(SessionState::Idle),
                last_error: Mutex::new(None),
            }),
            launcher: Arc::new(ServerLauncher::new(adb)),
            acceptor: Mutex::new(None),
            pipeline: Arc::new(FramePipeline::new(scheduler)),
            regulator,
            synchronizer: Arc::new(Mutex::new(AudioSynchronizer::new(DEFAULT_SAMPLE_RATE))),
            video,
            audio_parser: Arc::new(Mutex::new(AudioStreamParser::new())),
            audio_decoder: Arc::new(Mutex::new(None)),
            decoder_factory,
            power: PowerCoordinator::new(),
            power_hold: Mutex::new(None),
            audio_sink: Mutex::new(None),
            pull_worker: Mutex::new(None),
        }
    }

    #[cfg(feature = "openh264")]
    pub fn new(config: MirrorConfig, scheduler: Arc<dyn TaskScheduler>) -> Self {
        use crate::adb::service::ExecAdbService;
        use crate::video::decoder::OpenH264Decoder;

        let adb = Arc::new(ExecAdbService::new(config.adb_binary().to_string()));
        Self::with_parts(
            config,
            adb,
            Box::new(|| Box::new(OpenH264Decoder::new())),
            scheduler,
        )
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// Take the error that moved the session to `Error`, if any.
    pub fn take_last_error(&self) -> Option<MirrorError> {
        self.core.last_error.lock().unwrap().take()
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn regulator(&self) -> Arc<AudioRegulator> {
        self.regulator.clone()
    }

    pub fn pipeline(&self) -> Arc<FramePipeline> {
        self.pipeline.clone()
    }

    /// Frames reach this handler on the scheduler's thread.
    pub fn set_frame_handler(&self, handler: Box<dyn FnMut(VideoFrame) + Send>) {
        self.pipeline.set_frame_handler(handler);
    }

    /// Attach the audio output; the pull worker starts with the capture.
    pub fn set_audio_sink(&self, sink: Box<dyn AudioSink>) {
        *self.audio_sink.lock().unwrap() = Some(sink);
    }

    /// `Idle|Disconnected -> Connecting -> Connected`. Verifies the device
    /// and builds fresh stream chains.
    pub fn connect(&self) -> Result<()> {
        self.require_state(&[SessionState::Idle, SessionState::Disconnected], "connect")?;
        self.core.set_state(SessionState::Connecting);

        if let Err(e) = self.launcher_adb_check() {
            self.core
                .fail(MirrorError::ConnectionFailed(e.to_string()));
            return Err(e);
        }

        self.rebuild_chains();
        self.core.set_state(SessionState::Connected);
        Ok(())
    }

    /// `Connected|Paused -> Capturing`. Prepares the device environment,
    /// brings up the transport, launches the agent, and waits for video.
    pub fn start_capture(&self) -> Result<()> {
        if self.state() == SessionState::Paused {
            self.core.set_state(SessionState::Capturing);
            return Ok(());
        }
        self.require_state(&[SessionState::Connected], "start_capture")?;

        match self.start_capture_inner() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.teardown_transport();
                // Errors with their own taxonomy entry keep it; everything
                // else is reported as a capture-start failure.
                let error = match e {
                    MirrorError::PortInUse(_)
                    | MirrorError::InvalidPort(_)
                    | MirrorError::ConnectionTimeout
                    | MirrorError::DeviceNotReady(_)
                    | MirrorError::PortForwardingFailed(_)
                    | MirrorError::AgentStartFailed(_)
                    | MirrorError::DeviceOccupied => e,
                    MirrorError::CaptureStartFailed(msg) => MirrorError::CaptureStartFailed(msg),
                    other => MirrorError::CaptureStartFailed(other.to_string()),
                };
                self.core
                    .fail(MirrorError::CaptureStartFailed(error.to_string()));
                Err(error)
            }
        }
    }

    fn start_capture_inner(&self) -> Result<()> {
        // An occupied port normally surfaces as the acceptor's bind
        // failure; the pre-flight probe only runs when the caller allowed
        // squatter cleanup, because probing briefly holds the port.
        if self.config.connection_mode == ConnectionMode::Reverse
            && self.config.free_port_on_conflict
        {
            if let Err(e) = PortProbe::ensure_free(self.config.port) {
                if matches!(e, MirrorError::PortInUse(_)) {
                    PortProbe::free_port(self.config.port, true)?;
                } else {
                    return Err(e);
                }
            }
        }

        self.launcher.prepare_environment(&self.config)?;

        let acceptor = SocketAcceptor::new(AcceptorConfig::new(
            self.config.connection_mode,
            self.config.port,
            self.config.audio_enabled,
        ));
        self.wire_acceptor(&acceptor);

        // The pipeline must accept frames before the agent can stream.
        let size = self
            .video
            .lock()
            .unwrap()
            .latest_size
            .unwrap_or(DEFAULT_FRAME_SIZE);
        self.pipeline.start(size);

        // The listener must be up before the agent dials back.
        acceptor.start()?;

        // Capturing before the agent launches, so early frames are kept.
        self.core.set_state(SessionState::Capturing);

        let exit_core = self.core.clone();
        self.launcher.set_exit_handler(Box::new(move |code| {
            if is_normal_exit(code) {
                log_info!("SESSION", "Agent finished normally ({:?})", code);
                exit_core.set_state(SessionState::Disconnected);
            } else {
                exit_core.fail(MirrorError::ProcessTerminated(code.unwrap_or(-1)));
            }
        }));
        self.launcher.start_server(&self.config)?;

        acceptor.wait_for_video_connection(VIDEO_CONNECT_TIMEOUT)?;
        *self.acceptor.lock().unwrap() = Some(acceptor);

        *self.power_hold.lock().unwrap() = Some(self.power.acquire());

        if let Some(sink) = self.audio_sink.lock().unwrap().take() {
            let format = AudioFormat {
                sample_rate: DEFAULT_SAMPLE_RATE,
                channels: DEFAULT_CHANNELS,
            };
            *self.pull_worker.lock().unwrap() =
                Some(start_pull_worker(self.regulator.clone(), format, sink));
        }
        Ok(())
    }

    /// `Capturing -> Connected`. Stops the pipeline, transport, and agent,
    /// then resets the stream chains.
    pub fn stop_capture(&self) -> Result<()> {
        self.require_state(
            &[SessionState::Capturing, SessionState::Paused],
            "stop_capture",
        )?;
        self.teardown_transport();
        self.core.set_state(SessionState::Connected);
        Ok(())
    }

    /// `Capturing -> Paused`: decoded frames are dropped until resume.
    pub fn pause(&self) -> Result<()> {
        self.require_state(&[SessionState::Capturing], "pause")?;
        self.core.set_state(SessionState::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.require_state(&[SessionState::Paused], "resume")?;
        self.core.set_state(SessionState::Capturing);
        Ok(())
    }

    /// Unconditional cleanup; always ends in `Disconnected`.
    pub fn disconnect(&self) {
        self.teardown_transport();
        self.core.set_state(SessionState::Disconnected);
    }

    /// Cancellation order: pipeline, acceptor, agent, pull worker.
    fn teardown_transport(&self) {
        self.pipeline.stop();
        if let Some(acceptor) = self.acceptor.lock().unwrap().take() {
            acceptor.stop();
        }
        self.launcher.stop();
        *self.pull_worker.lock().unwrap() = None;
        *self.power_hold.lock().unwrap() = None;
        self.rebuild_chains();
    }

    /// Fresh parsers and decoders; clears the frame slot and regulators.
    fn rebuild_chains(&self) {
        {
            let mut video = self.video.lock().unwrap();
            video.parser.reset();
            video.decoder = (*self.decoder_factory)();
            video.configured_sps = None;
            video.latest_size = None;
        }
        self.audio_parser.lock().unwrap().reset();
        *self.audio_decoder.lock().unwrap() = None;
        self.regulator.reset();
        self.synchronizer.lock().unwrap().reset();
    }

    fn launcher_adb_check(&self) -> Result<()> {
        // Device presence is the only connect-time requirement; ports and
        // the agent are start_capture business.
        self.launcher_adb().ensure_device_ready(&self.config.serial)
    }

    fn launcher_adb(&self) -> Arc<dyn AdbService> {
        self.launcher.adb()
    }

    fn require_state(&self, allowed: &[SessionState], op: &str) -> Result<()> {
        let current = self.state();
        if allowed.contains(&current) {
            Ok(())
        } else {
            Err(MirrorError::InvalidState(format!(
                "{} is not allowed in {:?}",
                op, current
            )))
        }
    }

    fn wire_acceptor(&self, acceptor: &SocketAcceptor) {
        // Video chain: parser -> (sps gate) -> decoder -> pipeline.
        {
            let mut video = self.video.lock().unwrap();
            video.parser.set_sps_handler(Box::new(|sps| {
                log_verbose!("SESSION", "New SPS on the stream ({} bytes)", sps.len());
            }));
        }
        let video = self.video.clone();
        let pipeline = self.pipeline.clone();
        let core = self.core.clone();
        let codec = self.config.video_codec;
        acceptor.set_video_handler(Box::new(move |bytes| {
            let mut chain = video.lock().unwrap();
            let nals = chain.parser.append(bytes);
            for nal in nals {
                // Every SPS whose bytes differ from the one the decoder
                // was configured with forces its own reconfiguration,
                // even when several changes land in one read. The change
                // applies at the SPS itself, so VCL NALs that preceded
                // it in this batch still decode with the old
                // configuration.
                if nal.is_sps()
                    && chain.configured_sps.is_some()
                    && chain.configured_sps.as_deref() != Some(nal.payload())
                {
                    handle_sps_changed(&mut chain, &pipeline);
                }
                if !chain.decoder.is_ready() && chain.parser.has_complete_parameter_sets() {
                    if let Err(e) = initialize_decoder(&mut chain, codec) {
                        core.fail(e);
                        return;
                    }
                }
                if nal.is_vcl() && chain.decoder.is_ready() {
                    match chain.decoder.decode(&nal) {
                        Ok(frames) => {
                            for frame in frames {
                                handle_decoded_frame(&core, &mut chain, &pipeline, frame);
                            }
                        }
                        Err(e) => {
                            core.fail(e);
                            return;
                        }
                    }
                }
            }
        }));

        // Audio chain: parser -> decoder -> synchronizer -> regulator.
        {
            let mut parser = self.audio_parser.lock().unwrap();

            let decoder_slot = self.audio_decoder.clone();
            parser.set_codec_handler(Box::new(move |id| {
                log_info!("AUDIO", "Stream codec: {:?}", id);
                match create_audio_decoder(id) {
                    Ok(mut decoder) => {
                        if let Err(e) = decoder.initialize(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS) {
                            log_warn!("AUDIO", "Decoder unavailable: {}", e);
                            return;
                        }
                        *decoder_slot.lock().unwrap() = Some(decoder);
                    }
                    Err(e) => log_warn!("AUDIO", "No decoder for stream: {}", e),
                }
            }));

            let decoder_slot = self.audio_decoder.clone();
            let regulator = self.regulator.clone();
            let synchronizer = self.synchronizer.clone();
            parser.set_packet_handler(Box::new(move |packet| {
                let mut slot = decoder_slot.lock().unwrap();
                let decoder = match slot.as_mut() {
                    Some(decoder) => decoder,
                    None => return,
                };
                if packet.is_config {
                    if let Err(e) = decoder.process_config_packet(&packet.payload) {
                        log_warn!("AUDIO", "Config packet rejected: {}", e);
                    }
                    return;
                }
                match decoder.decode(&packet.payload, packet.pts_us, packet.is_key) {
                    Ok(pcm) => {
                        if pcm.is_empty() {
                            return;
                        }
                        let channels = usize::from(decoder.output_format().channels).max(1);
                        let sample_count = (pcm.len() / channels) as u32;
                        let decision = synchronizer
                            .lock()
                            .unwrap()
                            .process_audio_pts(packet.pts_us, sample_count);
                        if decision.is_discontinuity {
                            log_verbose!("AUDIO", "PTS discontinuity, clock re-seeded");
                        }
                        if decision.should_play {
                            regulator.push(&pcm);
                        } else {
                            log_verbose!(
                                "AUDIO",
                                "Dropping late packet (drift {:.0}ms)",
                                decision.drift_ms
                            );
                        }
                    }
                    // Audio is best-effort: log and carry on.
                    Err(e) => log_warn!("AUDIO", "Decode failed: {}", e),
                }
            }));
        }
        let audio_parser = self.audio_parser.clone();
        acceptor.set_audio_handler(Box::new(move |bytes| {
            audio_parser.lock().unwrap().append(bytes);
        }));

        let core = self.core.clone();
        acceptor.set_error_handler(Box::new(move |error| {
            core.fail(error);
        }));
    }
}

impl Drop for ScrcpySession {
    fn drop(&mut self) {
        self.teardown_transport();
    }
}

/// SPS changed (rotation or resolution): make the decoder not-ready and
/// flush pre-rotation frames out of the pipeline.
fn handle_sps_changed(chain: &mut VideoChain, pipeline: &FramePipeline) {
    log_info!("SESSION", "SPS changed, reconfiguring decoder");
    chain.decoder.reset();
    chain.configured_sps = None;
    if pipeline.is_running() {
        let size = chain.latest_size.unwrap_or(DEFAULT_FRAME_SIZE);
        pipeline.stop();
        pipeline.start(size);
    }
}

fn initialize_decoder(chain: &mut VideoChain, codec: VideoCodec) -> Result<()> {
    let missing =
        || MirrorError::InitializationFailed("parameter sets incomplete".into());
    let sets = chain.parser.parameter_sets();
    match codec {
        VideoCodec::H264 => {
            let sps = sets.sps().ok_or_else(missing)?.to_vec();
            let pps = sets.pps().ok_or_else(missing)?.to_vec();
            chain.decoder.initialize_h264(&sps, &pps)?;
            chain.configured_sps = Some(sps);
        }
        VideoCodec::H265 => {
            let vps = sets.vps().ok_or_else(missing)?.to_vec();
            let sps = sets.sps().ok_or_else(missing)?.to_vec();
            let pps = sets.pps().ok_or_else(missing)?.to_vec();
            chain.decoder.initialize_h265(&vps, &sps, &pps)?;
            chain.configured_sps = Some(sps);
        }
    }
    Ok(())
}

fn handle_decoded_frame(
    core: &SessionCore,
    chain: &mut VideoChain,
    pipeline: &FramePipeline,
    frame: VideoFrame,
) {
    if core.state() != SessionState::Capturing {
        return;
    }
    let size = (frame.width, frame.height);
    if chain.latest_size != Some(size) {
        if let Some((old_w, old_h)) = chain.latest_size {
            let swapped = old_w == frame.height && old_h == frame.width;
            log_info!(
                "SESSION",
                "Frame size {}x{} -> {}x{}{}",
                old_w,
                old_h,
                frame.width,
                frame.height,
                if swapped { " (orientation swap)" } else { "" }
            );
        }
        chain.latest_size = Some(size);
        pipeline.set_current_size(size);
    }
    pipeline.push_frame(frame);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::service::Device;
    use crate::video::decoder::testing::{FakeDecoderLog, FakeVideoDecoder};
    use crate::video::pipeline::ChannelScheduler;

    struct StubAdb {
        ready: bool,
    }

    impl AdbService for StubAdb {
        fn devices(&self) -> Result<Vec<Device>> {
            if self.ready {
                Ok(vec![Device {
                    serial: "dev1".into(),
                    state: "device".into(),
                    model: "Test".into(),
                }])
            } else {
                Ok(Vec::new())
            }
        }
        fn push(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn forward(&self, _: &str, _: u16, _: &str) -> Result<()> {
            Ok(())
        }
        fn remove_forward(&self, _: &str, _: u16) -> Result<()> {
            Ok(())
        }
        fn reverse(&self, _: &str, _: &str, _: u16) -> Result<()> {
            Ok(())
        }
        fn remove_reverse(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn shell(&self, _: &str, _: &[&str]) -> Result<String> {
            Ok(String::new())
        }
        fn spawn_shell(&self, _: &str, _: &[String]) -> Result<std::process::Child> {
            Err(MirrorError::AgentStartFailed("stub".into()))
        }
    }

    fn stub_session(ready: bool) -> ScrcpySession {
        let (scheduler, _rx) = ChannelScheduler::new();
        let log = Arc::new(FakeDecoderLog::default());
        let mut config = MirrorConfig::default();
        config.serial = "dev1".into();
        ScrcpySession::with_parts(
            config,
            Arc::new(StubAdb { ready }),
            Box::new(move || Box::new(FakeVideoDecoder::new(log.clone()))),
            scheduler,
        )
    }

    #[test]
    fn connect_requires_idle_or_disconnected() {
        let session = stub_session(true);
        assert_eq!(session.state(), SessionState::Idle);
        session.connect().unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        // Connecting twice is illegal.
        assert!(matches!(
            session.connect(),
            Err(MirrorError::InvalidState(_))
        ));

        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        session.connect().unwrap();
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn connect_fails_to_error_when_device_missing() {
        let session = stub_session(false);
        assert!(session.connect().is_err());
        assert_eq!(session.state(), SessionState::Error);
        assert!(matches!(
            session.take_last_error(),
            Some(MirrorError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn capture_requires_connected() {
        let session = stub_session(true);
        assert!(matches!(
            session.start_capture(),
            Err(MirrorError::InvalidState(_))
        ));
        assert!(matches!(
            session.stop_capture(),
            Err(MirrorError::InvalidState(_))
        ));
    }

    #[test]
    fn pause_resume_cycle() {
        let session = stub_session(true);
        session.connect().unwrap();
        // Force Capturing without a live transport.
        session.core.set_state(SessionState::Capturing);

        session.pause().unwrap();
        assert_eq!(session.state(), SessionState::Paused);
        assert!(matches!(session.pause(), Err(MirrorError::InvalidState(_))));
        session.resume().unwrap();
        assert_eq!(session.state(), SessionState::Capturing);

        session.stop_capture().unwrap();
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn abnormal_agent_exit_moves_to_error() {
        let session = stub_session(true);
        session.core.set_state(SessionState::Capturing);
        session.core.fail(MirrorError::ProcessTerminated(9));
        assert_eq!(session.state(), SessionState::Error);
        assert!(matches!(
            session.take_last_error(),
            Some(MirrorError::ProcessTerminated(9))
        ));
    }

    #[test]
    fn disconnect_is_unconditional() {
        let session = stub_session(true);
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        session.connect().unwrap();
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
