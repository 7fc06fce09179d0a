//! End-to-end stream scenarios over the public API: literal wire input on
//! one side, decoded artifacts on the other.

use sc_host::adb::service::{AdbService, Device};
use sc_host::audio::decoder::{AudioDecoder, RawAudioDecoder};
use sc_host::audio::parser::{encode_packet, AudioCodecId, AudioStreamParser};
use sc_host::audio::regulator::{AudioRegulator, RegulatorConfig};
use sc_host::audio::sync::AudioSynchronizer;
use sc_host::core::config::{ConnectionMode, MirrorConfig, VideoCodec};
use sc_host::core::error::{MirrorError, Result};
use sc_host::core::frame::VideoFrame;
use sc_host::core::session::{ScrcpySession, SessionState};
use sc_host::network::acceptor::{AcceptorConfig, SocketAcceptor};
use sc_host::video::decoder::VideoDecoder;
use sc_host::video::parser::{NalUnit, VideoFraming, VideoStreamParser};
use sc_host::video::pipeline::ChannelScheduler;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn annexb_nal(header: u8, body: &[u8]) -> Vec<u8> {
    let mut v = vec![0, 0, 0, 1, header];
    v.extend_from_slice(body);
    v
}

/// Codec id prologue plus three RAW packets decode to the
/// expected Float32 samples.
#[test]
fn raw_audio_stream_decodes_to_pcm() {
    let mut parser = AudioStreamParser::new();

    let codec_ids = Arc::new(Mutex::new(Vec::new()));
    let codec_ids_clone = codec_ids.clone();
    parser.set_codec_handler(Box::new(move |id| {
        codec_ids_clone.lock().unwrap().push(id.raw());
    }));

    let deliveries = Arc::new(Mutex::new(Vec::<Vec<f32>>::new()));
    let deliveries_clone = deliveries.clone();
    let decoder = Arc::new(Mutex::new(RawAudioDecoder::new()));
    decoder.lock().unwrap().initialize(48_000, 2).unwrap();
    let decoder_clone = decoder.clone();
    parser.set_packet_handler(Box::new(move |packet| {
        let pcm = decoder_clone
            .lock()
            .unwrap()
            .decode(&packet.payload, packet.pts_us, packet.is_key)
            .unwrap();
        deliveries_clone.lock().unwrap().push(pcm);
    }));

    let mut stream = 0x0072_6177u32.to_be_bytes().to_vec();
    for k in 1..=3u64 {
        // Sample values 0 and 64 as little-endian i16.
        stream.extend_from_slice(&encode_packet(k * 1000, false, false, &[0x00, 0x00, 0x40, 0x00]));
    }
    parser.append(&stream);

    assert_eq!(*codec_ids.lock().unwrap(), vec![AudioCodecId::RAW]);
    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 3);
    for pcm in deliveries.iter() {
        assert_eq!(pcm.len(), 2);
        assert_eq!(pcm[0], 0.0);
        assert!((pcm[1] - 0.001953125).abs() < f32::EPSILON);
    }
}

/// Counts lifecycle calls and stamps frames with the initialization
/// generation so rotation epochs are visible downstream.
struct CountingDecoder {
    inits: Arc<AtomicU64>,
    resets: Arc<AtomicU64>,
    vcl_decoded: Arc<AtomicU64>,
    ready: bool,
}

impl CountingDecoder {
    fn new(inits: Arc<AtomicU64>, resets: Arc<AtomicU64>, vcl_decoded: Arc<AtomicU64>) -> Self {
        Self {
            inits,
            resets,
            vcl_decoded,
            ready: false,
        }
    }
}

impl VideoDecoder for CountingDecoder {
    fn initialize_h264(&mut self, _sps: &[u8], _pps: &[u8]) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        self.ready = true;
        Ok(())
    }

    fn initialize_h265(&mut self, _vps: &[u8], _sps: &[u8], _pps: &[u8]) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        self.ready = true;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn decode(&mut self, nal: &NalUnit) -> Result<Vec<VideoFrame>> {
        if !self.ready {
            return Err(MirrorError::DecodeFailed("not ready".into()));
        }
        if !nal.is_vcl() {
            return Ok(Vec::new());
        }
        self.vcl_decoded.fetch_add(1, Ordering::SeqCst);
        let generation = self.inits.load(Ordering::SeqCst) as u32;
        let w = 100 * generation;
        let h = 200 * generation;
        Ok(vec![VideoFrame {
            width: w,
            height: h,
            y_plane: Arc::new(vec![0; 16]),
            u_plane: Arc::new(vec![0; 4]),
            v_plane: Arc::new(vec![0; 4]),
            y_stride: w as usize,
            uv_stride: (w / 2) as usize,
            presented_at: Instant::now(),
        }])
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.ready = false;
    }
}

/// An SPS split across arbitrary appends, then PPS and a VCL
/// NAL: parameter sets complete, the decoder initializes, the VCL is
/// routed to decode.
#[test]
fn nal_assembly_across_appends_initializes_decoder() {
    let mut parser = VideoStreamParser::new(VideoCodec::H264, VideoFraming::AnnexB);
    let inits = Arc::new(AtomicU64::new(0));
    let resets = Arc::new(AtomicU64::new(0));
    let vcls = Arc::new(AtomicU64::new(0));
    let mut decoder = CountingDecoder::new(inits.clone(), resets.clone(), vcls.clone());

    let sps = annexb_nal(0x67, &[0x64, 0x00, 0x1F]);
    let mut stream = Vec::new();
    stream.extend_from_slice(&annexb_nal(0x68, &[0xEE]));
    stream.extend_from_slice(&annexb_nal(0x65, &[0x88, 0x80, 0x10]));
    stream.extend_from_slice(&[0, 0, 0, 1]); // terminates the IDR

    let mut nals = Vec::new();
    // The SPS arrives in three arbitrary splits.
    nals.extend(parser.append(&sps[..2]));
    nals.extend(parser.append(&sps[2..5]));
    nals.extend(parser.append(&sps[5..]));
    assert!(nals.is_empty());
    nals.extend(parser.append(&stream));

    for nal in &nals {
        if !decoder.is_ready() && parser.has_complete_parameter_sets() {
            let sets = parser.parameter_sets();
            decoder
                .initialize_h264(sets.sps().unwrap(), sets.pps().unwrap())
                .unwrap();
        }
        if nal.is_vcl() && decoder.is_ready() {
            decoder.decode(nal).unwrap();
        }
    }

    assert!(parser.has_complete_parameter_sets());
    assert_eq!(inits.load(Ordering::SeqCst), 1);
    assert_eq!(vcls.load(Ordering::SeqCst), 1);
}

/// A one-second PTS jump in an otherwise regular 20 ms
/// cadence flags exactly one discontinuity and zeroes the drift right
/// after the reset.
#[test]
fn pts_discontinuity_resets_clock() {
    let mut sync = AudioSynchronizer::new(48_000);
    let base = Instant::now();
    let pts = [0u64, 20_000, 40_000, 1_000_000, 1_020_000];
    let mut flagged = Vec::new();
    for &p in &pts {
        let d = sync.process_audio_pts_at(p, 960, base + Duration::from_micros(p));
        flagged.push((d.is_discontinuity, d.drift_ms));
    }
    assert_eq!(
        flagged.iter().map(|f| f.0).collect::<Vec<_>>(),
        vec![false, false, false, true, false]
    );
    assert_eq!(flagged[3].1, 0.0);
    assert_eq!(sync.discontinuity_count(), 1);
}

/// Pushing 12 000 frames into a 9 600-frame regulator drops
/// exactly 2 400 into the overflow counter.
#[test]
fn regulator_overflow_accounting() {
    let regulator = AudioRegulator::new(RegulatorConfig::new(48_000, 1));
    regulator.push(&vec![0.0f32; 12_000]);
    let stats = regulator.stats();
    assert_eq!(stats.overflow_frames, 2400);
    assert_eq!(stats.buffered_frames, 9600);
}

/// Forward mode dials video then audio, and never a third.
#[test]
fn forward_dials_are_ordered() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let order = Arc::new(Mutex::new(Vec::new()));
    let order_clone = order.clone();
    let server = thread::spawn(move || {
        let (mut first, _) = listener.accept().unwrap();
        order_clone.lock().unwrap().push("dial1");
        first.write_all(b"video-bytes").unwrap();
        let (mut second, _) = listener.accept().unwrap();
        order_clone.lock().unwrap().push("dial2");
        second.write_all(b"audio-bytes").unwrap();

        listener.set_nonblocking(true).unwrap();
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            assert!(listener.accept().is_err(), "unexpected third dial");
            thread::sleep(Duration::from_millis(50));
        }
        (first, second)
    });

    let acceptor = SocketAcceptor::new(AcceptorConfig::new(ConnectionMode::Forward, port, true));
    let video = Arc::new(Mutex::new(Vec::new()));
    let audio = Arc::new(Mutex::new(Vec::new()));
    let video_clone = video.clone();
    let audio_clone = audio.clone();
    acceptor.set_video_handler(Box::new(move |b| {
        video_clone.lock().unwrap().extend_from_slice(b)
    }));
    acceptor.set_audio_handler(Box::new(move |b| {
        audio_clone.lock().unwrap().extend_from_slice(b)
    }));

    acceptor.start().unwrap();
    acceptor
        .wait_for_video_connection(Duration::from_secs(5))
        .unwrap();
    let _streams = server.join().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while (video.lock().unwrap().is_empty() || audio.lock().unwrap().is_empty())
        && Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(*order.lock().unwrap(), vec!["dial1", "dial2"]);
    assert_eq!(&*video.lock().unwrap(), b"video-bytes");
    assert_eq!(&*audio.lock().unwrap(), b"audio-bytes");
    acceptor.stop();
}

// ---------------------------------------------------------------------------
// Full-session scenario with a fake agent over real sockets.

/// AdbService double whose "agent" is a local sleep process.
struct FakeDeviceAdb;

impl AdbService for FakeDeviceAdb {
    fn devices(&self) -> Result<Vec<Device>> {
        Ok(vec![Device {
            serial: "fake-device".into(),
            state: "device".into(),
            model: "Fake".into(),
        }])
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
    fn spawn_shell(&self, _: &str, _: &[String]) -> Result<Child> {
        Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| MirrorError::AgentStartFailed(e.to_string()))
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn dial_until_up(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Err(e) => panic!("agent could not dial back: {}", e),
        }
    }
}

/// Full wiring: a reverse-mode session against a fake agent. The stream
/// rotates twice in quick succession; every rotation resets and
/// re-initializes the decoder, and frames are never delivered out of
/// rotation order.
#[test]
fn full_session_handles_rotation_and_audio() {
    let port = free_port();
    let mut config = MirrorConfig::default();
    config.serial = "fake-device".into();
    config.port = port;
    config.connection_mode = ConnectionMode::Reverse;
    config.audio_enabled = true;

    let inits = Arc::new(AtomicU64::new(0));
    let resets = Arc::new(AtomicU64::new(0));
    let vcls = Arc::new(AtomicU64::new(0));
    let (inits_f, resets_f, vcls_f) = (inits.clone(), resets.clone(), vcls.clone());

    let (scheduler, tasks) = ChannelScheduler::new();
    let session = ScrcpySession::with_parts(
        config,
        Arc::new(FakeDeviceAdb),
        Box::new(move || {
            Box::new(CountingDecoder::new(
                inits_f.clone(),
                resets_f.clone(),
                vcls_f.clone(),
            ))
        }),
        scheduler,
    );

    let delivered = Arc::new(Mutex::new(Vec::<(u32, u32)>::new()));
    let delivered_clone = delivered.clone();
    session.set_frame_handler(Box::new(move |frame| {
        delivered_clone
            .lock()
            .unwrap()
            .push((frame.width, frame.height));
    }));

    // Fake agent: dials back once the listener is up, streams a few
    // pre-rotation GOPs, then two rapid rotations written as one burst
    // (so both SPS changes can land in a single read), then audio.
    let agent = thread::spawn(move || {
        let mut video = dial_until_up(port);
        let sps1 = annexb_nal(0x67, &[1, 1, 1]);
        let sps2 = annexb_nal(0x67, &[2, 2, 2]);
        let sps3 = annexb_nal(0x67, &[3, 3, 3]);
        let pps = annexb_nal(0x68, &[9]);
        let vcl = annexb_nal(0x65, &[0xAB, 0xCD]);

        let mut pre = Vec::new();
        pre.extend_from_slice(&sps1);
        pre.extend_from_slice(&pps);
        for _ in 0..3 {
            pre.extend_from_slice(&vcl);
        }
        video.write_all(&pre).unwrap();

        let mut post = Vec::new();
        for sps in [&sps2, &sps3] {
            post.extend_from_slice(sps);
            post.extend_from_slice(&pps);
            for _ in 0..3 {
                post.extend_from_slice(&vcl);
            }
        }
        post.extend_from_slice(&[0, 0, 0, 1]); // terminate the last NAL
        video.write_all(&post).unwrap();

        let mut audio = dial_until_up(port);
        let mut bytes = 0x0072_6177u32.to_be_bytes().to_vec();
        for k in 0..10u64 {
            // One 20 ms stereo frame per packet: 960 * 2 i16 samples.
            let payload = vec![0x40u8, 0x00].repeat(960 * 2);
            bytes.extend_from_slice(&encode_packet(k * 20_000, false, false, &payload));
        }
        audio.write_all(&bytes).unwrap();

        (video, audio)
    });

    session.connect().unwrap();
    session.start_capture().unwrap();
    assert_eq!(session.state(), SessionState::Capturing);
    let _streams = agent.join().unwrap();

    // Drain dispatches until the whole stream has been decoded.
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        ChannelScheduler::drain(&tasks);
        if vcls.load(Ordering::SeqCst) == 9
            && session.regulator().stats().pushed_frames >= 9600
        {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    // One more pass for the dispatch of the final frame.
    thread::sleep(Duration::from_millis(50));
    ChannelScheduler::drain(&tasks);

    // Each of the two rotations forced its own reset and
    // re-initialization, even though both arrived back to back.
    assert_eq!(inits.load(Ordering::SeqCst), 3);
    assert!(resets.load(Ordering::SeqCst) >= 2);
    assert_eq!(vcls.load(Ordering::SeqCst), 9);

    // Frames are delivered in epoch order: widths never go backwards,
    // and the final rotation's frames always get through.
    let seen = delivered.lock().unwrap().clone();
    assert!(seen.iter().any(|&(w, _)| w == 300));
    assert!(seen.windows(2).all(|pair| pair[0].0 <= pair[1].0));

    // Audio flowed through decoder, synchronizer, and regulator.
    let stats = session.regulator().stats();
    assert!(stats.pushed_frames > 0);
    assert_eq!(stats.pushed_frames % 960, 0);

    session.stop_capture().unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    session.disconnect();
    assert_eq!(session.state(), SessionState::Disconnected);
}
