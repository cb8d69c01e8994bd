use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ilkit::prelude::*;
use ilkit::virtual_core::prelude::*;
use rand::Rng;

const AVCC: [u8; 14] = [1, 0x42, 0, 0x1e, 0xff, 0xe1, 0, 2, 0x67, 0x42, 1, 0, 1, 0x68];
const SLICE: [u8; 9] = [0, 0, 0, 5, 0x65, 0x88, 0x84, 0x21, 0xa0];
const WAIT: Duration = Duration::from_millis(500);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> SessionConfig {
    SessionConfig {
        command_timeout: Duration::from_millis(500),
        input_wait_step: Duration::from_millis(5),
        input_deadline: Duration::from_millis(500),
        output_wait_step: Duration::from_millis(5),
        max_consecutive_timeouts: 3,
    }
}

// Core refcounts are process-wide and keyed by name, so every test owns its backend name.
fn setup(name: &str, specs: Vec<VirtualComponentSpec>) -> (Arc<VirtualBackend>, ComponentRegistry) {
    init_tracing();
    let backend = specs
        .into_iter()
        .fold(VirtualBackend::new(name), VirtualBackend::with_component);
    let backend = Arc::new(backend);
    let registry = ComponentRegistry::new().with_backend(backend.clone());
    (backend, registry)
}

fn avc_decoder(name: &str) -> VirtualComponentSpec {
    VirtualComponentSpec::new(name, ["video_decoder.avc"])
}

fn h264(width: u32, height: u32) -> EsFormat {
    EsFormat::video(codes::H264, width, height).with_extra(AVCC.to_vec())
}

fn drain(session: &mut Session) -> Vec<OutputUnit> {
    let mut units = Vec::new();
    while let Some(unit) = session.poll_output_timeout(WAIT).unwrap() {
        units.push(unit);
    }
    units
}

#[test]
fn decoder_opens_and_decodes_one_frame() {
    let (backend, registry) = setup("scenario-decode", vec![avc_decoder("OMX.virtual.avc")]);
    let mut session = OpenRequest::decoder(h264(1280, 720))
        .config(config())
        .open(&registry)
        .unwrap();
    assert_eq!(session.state(), SessionState::Executing);
    assert_eq!(session.component(), "OMX.virtual.avc");
    let output = session.output_format();
    assert_eq!(output.codec, codes::I420);
    assert_eq!(output.as_video().map(|v| (v.width, v.height)), Some((1280, 720)));

    session
        .submit_input(&SLICE, 40_000, BufferFlags::empty())
        .unwrap();
    let frame = session.poll_output_timeout(WAIT).unwrap().unwrap();
    assert_eq!(frame.data.len(), 1280 * 720 * 3 / 2);
    assert_eq!(frame.timestamp, 40_000);
    assert!(frame.flags.contains(BufferFlags::END_OF_FRAME));
    assert_eq!(session.poll_output().unwrap(), None);
    // The worker handled the configuration unit before the slice.
    assert_eq!(backend.stats().codec_configs(), 1);

    let stats = session.stats();
    assert_eq!((stats.inputs, stats.outputs), (1, 1));
    session.close();
    assert_eq!(backend.stats().live_buffers(), 0);
    assert_eq!(backend.stats().open_handles(), 0);
}

#[test]
fn output_geometry_change_reconfigures_once() {
    let (backend, registry) = setup(
        "scenario-reconfigure",
        vec![avc_decoder("OMX.virtual.avc").with_settings_change(2, 1280, 720)],
    );
    let mut session = OpenRequest::decoder(h264(640, 360))
        .config(config())
        .open(&registry)
        .unwrap();

    let mut units = Vec::new();
    for i in 0..5 {
        session
            .submit_input(&SLICE, i * 33_000, BufferFlags::empty())
            .unwrap();
        if let Some(unit) = session.poll_output_timeout(WAIT).unwrap() {
            units.push(unit);
        }
    }
    units.extend(drain(&mut session));

    assert_eq!(units.len(), 5);
    assert_eq!(units[0].data.len(), 640 * 360 * 3 / 2);
    assert!(units[1..].iter().all(|u| u.data.len() == 1280 * 720 * 3 / 2));
    let timestamps: Vec<i64> = units.iter().map(|u| u.timestamp).collect();
    assert_eq!(timestamps, [0, 33_000, 66_000, 99_000, 132_000]);

    assert_eq!(session.stats().reconfigurations, 1);
    assert_eq!(backend.stats().settings_changes(), 1);
    let output = session.output_format().as_video().unwrap();
    assert_eq!((output.width, output.height), (1280, 720));
    session.close();
    assert_eq!(backend.stats().live_buffers(), 0);
}

#[test]
fn discontinuity_run_flushes_once() {
    let (backend, registry) = setup("scenario-flush", vec![avc_decoder("OMX.virtual.avc")]);
    let mut session = OpenRequest::decoder(h264(320, 240))
        .config(config())
        .open(&registry)
        .unwrap();

    session.submit_input(&SLICE, 0, BufferFlags::empty()).unwrap();
    session
        .submit_input(&SLICE, 1, BufferFlags::DISCONTINUITY)
        .unwrap();
    session
        .submit_input(&SLICE, 2, BufferFlags::DATA_CORRUPT)
        .unwrap();
    session
        .submit_input(&SLICE, 3, BufferFlags::DISCONTINUITY)
        .unwrap();
    assert_eq!(session.stats().flushes, 1);
    assert_eq!(backend.stats().flushes(), 1);

    session.submit_input(&SLICE, 4, BufferFlags::empty()).unwrap();
    session
        .submit_input(&SLICE, 5, BufferFlags::DISCONTINUITY)
        .unwrap();
    assert_eq!(session.stats().flushes, 2);
    assert_eq!(session.stats().inputs, 2);

    // Nothing was submitted since the last flush.
    session.flush().unwrap();
    assert_eq!(backend.stats().flushes(), 2);
    session.close();
    assert_eq!(backend.stats().live_buffers(), 0);
}

#[test]
fn hanging_component_times_out_without_leaks() {
    let (backend, registry) = setup(
        "scenario-hang",
        vec![avc_decoder("OMX.virtual.avc").hanging_on(ComponentState::Executing)],
    );
    let err = OpenRequest::decoder(h264(320, 240))
        .config(SessionConfig {
            command_timeout: Duration::from_millis(150),
            ..config()
        })
        .open(&registry)
        .unwrap_err();
    assert_eq!(err.code(), "timeout");
    assert!(err.retryable());
    assert!(matches!(err, OpenError::Component { ref component, .. } if component == "OMX.virtual.avc"));
    assert_eq!(backend.stats().live_buffers(), 0);
    assert_eq!(backend.stats().open_handles(), 0);
    assert_eq!(CoreGuard::users("scenario-hang"), 0);
}

#[test]
fn failed_candidates_fall_through_to_the_next() {
    let (backend, registry) = setup(
        "scenario-fallback",
        vec![
            avc_decoder("OMX.virtual.avc.a").failing_open(ErrorCode::InsufficientResources),
            avc_decoder("OMX.virtual.avc.b").refusing_definitions(),
            avc_decoder("OMX.virtual.avc.c"),
        ],
    );
    let session = OpenRequest::decoder(h264(320, 240))
        .config(config())
        .open(&registry)
        .unwrap();
    assert_eq!(session.component(), "OMX.virtual.avc.c");
    assert_eq!(backend.stats().open_handles(), 1);
    drop(session);
    assert_eq!(backend.stats().open_handles(), 0);
    assert_eq!(backend.stats().live_buffers(), 0);
}

#[test]
fn last_candidate_failure_is_reported() {
    let (_backend, registry) = setup(
        "scenario-refused",
        vec![avc_decoder("OMX.virtual.avc").refusing_definitions()],
    );
    let err = OpenRequest::decoder(h264(320, 240))
        .config(config())
        .open(&registry)
        .unwrap_err();
    assert_eq!(err.code(), "negotiation_failed");
    assert!(!err.retryable());
    assert!(err.component_error().is_some());
}

#[test]
fn requests_are_validated_before_loading() {
    let (backend, registry) = setup("scenario-validate", vec![avc_decoder("OMX.virtual.avc")]);
    let err = OpenRequest::decoder(EsFormat::video(codes::H264, 0, 0))
        .open(&registry)
        .unwrap_err();
    assert_eq!(err.code(), "bad_parameter");
    let err = OpenRequest::encoder(EsFormat::video(codes::I420, 64, 64), codes::VP9)
        .open(&registry)
        .unwrap_err();
    assert_eq!(err.code(), "bad_parameter");
    let err = OpenRequest::decoder(EsFormat::video(codes::HEVC, 64, 64))
        .open(&registry)
        .unwrap_err();
    assert!(matches!(err, OpenError::NoComponent { ref role } if role == "video_decoder.hevc"));
    assert_eq!(backend.stats().inits(), 1);
    assert_eq!(backend.stats().deinits(), 1);
}

#[test]
fn decoder_without_codec_configuration_is_refused() {
    let (backend, registry) = setup("scenario-csd", vec![avc_decoder("OMX.virtual.avc")]);
    let err = OpenRequest::decoder(EsFormat::video(codes::H264, 320, 240))
        .config(config())
        .open(&registry)
        .unwrap_err();
    assert_eq!(err.code(), "negotiation_failed");
    assert_eq!(backend.stats().open_handles(), 0);
}

#[test]
fn malformed_unit_is_dropped_and_the_session_continues() {
    let (_backend, registry) = setup("scenario-malformed", vec![avc_decoder("OMX.virtual.avc")]);
    let mut session = OpenRequest::decoder(h264(320, 240))
        .config(config())
        .open(&registry)
        .unwrap();
    let err = session
        .submit_input(&[0, 0, 0, 50, 0x65], 0, BufferFlags::empty())
        .unwrap_err();
    assert_eq!(err.code(), "malformed_input");
    assert_eq!(session.state(), SessionState::Executing);
    assert_eq!(session.stats().dropped_units, 1);

    session.submit_input(&SLICE, 10, BufferFlags::empty()).unwrap();
    let frame = session.poll_output_timeout(WAIT).unwrap().unwrap();
    assert_eq!(frame.timestamp, 10);
}

#[test]
fn benign_stream_errors_are_absorbed() {
    let (_backend, registry) = setup(
        "scenario-corrupt",
        vec![avc_decoder("OMX.virtual.avc").with_corruption_every(2)],
    );
    let mut session = OpenRequest::decoder(h264(320, 240))
        .config(config())
        .open(&registry)
        .unwrap();
    for i in 0..4 {
        session.submit_input(&SLICE, i, BufferFlags::empty()).unwrap();
    }
    assert_eq!(drain(&mut session).len(), 4);
    session.poll_output().unwrap();
    assert_eq!(session.stats().benign_errors, 2);
    assert_eq!(session.state(), SessionState::Executing);
}

#[test]
fn stream_errors_during_a_flush_are_counted() {
    let (backend, registry) = setup(
        "scenario-corrupt-flush",
        vec![avc_decoder("OMX.virtual.avc").with_corruption_every(1)],
    );
    let mut session = OpenRequest::decoder(h264(320, 240))
        .config(config())
        .open(&registry)
        .unwrap();
    session.submit_input(&SLICE, 0, BufferFlags::empty()).unwrap();
    // The error is reported ahead of the flush completion.
    session.flush().unwrap();
    assert_eq!(backend.stats().flushes(), 1);
    assert_eq!(session.stats().benign_errors, 1);
    assert_eq!(session.state(), SessionState::Executing);
}

#[test]
fn encoder_produces_compressed_units() {
    let (backend, registry) = setup(
        "scenario-encode",
        vec![
            VirtualComponentSpec::new("OMX.virtual.avc.encoder", ["video_encoder.avc"])
                .with_buffers(4, 64 * 1024),
        ],
    );
    let mut session = OpenRequest::encoder(EsFormat::video(codes::I420, 640, 480), codes::H264)
        .bitrate(1_000_000)
        .config(config())
        .open(&registry)
        .unwrap();
    assert_eq!(session.kind(), CodecKind::Encoder);
    assert_eq!(session.output_format().codec, codes::H264);
    assert_eq!(backend.stats().codec_configs(), 0);

    let mut picture = vec![0u8; 640 * 480 * 3 / 2];
    rand::thread_rng().fill(&mut picture[..]);
    session
        .submit_input(&picture, 1_000, BufferFlags::END_OF_STREAM)
        .unwrap();
    let unit = session.poll_output_timeout(WAIT).unwrap().unwrap();
    assert_eq!(unit.data.len(), picture.len() / 8 + 16);
    assert_eq!(unit.timestamp, 1_000);
    assert!(unit.flags.contains(BufferFlags::END_OF_STREAM));
    session.close();
    assert_eq!(backend.stats().live_buffers(), 0);
}

#[test]
fn oversized_units_are_split_across_buffers() {
    let (backend, registry) = setup(
        "scenario-split",
        vec![avc_decoder("OMX.virtual.avc").with_buffers(4, 4096)],
    );
    let mut session = OpenRequest::decoder(h264(176, 144))
        .config(config())
        .open(&registry)
        .unwrap();
    let capacity = session
        .inner()
        .input_port()
        .definition()
        .map(|d| d.buffer_size as usize)
        .unwrap();
    let payload = capacity * 2;
    let mut unit = vec![0u8; 4 + payload];
    unit[..4].copy_from_slice(&(payload as u32).to_be_bytes());
    unit[4] = 0x65;
    session.submit_input(&unit, 7, BufferFlags::empty()).unwrap();

    // One frame for three input buffers: only the last one ends the frame.
    let units = drain(&mut session);
    assert_eq!(units.len(), 1);
    assert_eq!(backend.stats().inputs(), 3);
    assert_eq!(session.stats().inputs, 1);
}

#[test]
fn codec_configuration_is_split_across_small_buffers() {
    let (backend, registry) = setup(
        "scenario-split-config",
        vec![avc_decoder("OMX.virtual.avc").with_buffers(4, 8)],
    );
    let format = h264(176, 144);
    let expected = prepare_codec_config(&format).unwrap().data;
    let session = OpenRequest::decoder(format)
        .config(config())
        .open(&registry)
        .unwrap();
    let capacity = session
        .inner()
        .input_port()
        .definition()
        .map(|d| d.buffer_size as usize)
        .unwrap();
    assert!(expected.len() > capacity);

    let deadline = Instant::now() + WAIT;
    while backend.stats().codec_configs() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(backend.stats().codec_configs(), 1);
    assert_eq!(backend.stats().last_codec_config(), expected);
    session.close();
    assert_eq!(backend.stats().live_buffers(), 0);
}

#[test]
fn audio_output_is_stamped_from_sample_count() {
    let (backend, registry) = setup(
        "scenario-audio",
        vec![VirtualComponentSpec::new("OMX.virtual.aac", ["audio_decoder.aac"])],
    );
    let format = EsFormat::audio(codes::AAC, 2, 48_000).with_extra(vec![0x11, 0x90]);
    let mut session = OpenRequest::decoder(format)
        .config(config())
        .open(&registry)
        .unwrap();
    let pcm = session.output_format().as_audio().copied().unwrap();
    assert_eq!((pcm.channels, pcm.rate), (2, 48_000));

    for _ in 0..3 {
        session.submit_input(&[0x21, 0x10, 0x05], 0, BufferFlags::empty()).unwrap();
    }
    let units = drain(&mut session);
    assert!(units.iter().all(|u| u.data.len() == 1024 * 2 * 2));
    let timestamps: Vec<i64> = units.iter().map(|u| u.timestamp).collect();
    assert_eq!(timestamps, [0, 21_333, 42_666]);
    assert_eq!(backend.stats().codec_configs(), 1);
}

#[test]
fn cores_are_released_with_the_last_session() {
    let (backend, registry) = setup("scenario-cores", vec![avc_decoder("OMX.virtual.avc")]);
    let first = OpenRequest::decoder(h264(320, 240))
        .config(config())
        .open(&registry)
        .unwrap();
    let second = OpenRequest::decoder(h264(320, 240))
        .config(config())
        .open(&registry)
        .unwrap();
    assert_eq!(CoreGuard::users("scenario-cores"), 2);
    assert_eq!(backend.stats().inits(), 1);
    first.close();
    assert_eq!(backend.stats().deinits(), 0);
    second.close();
    assert_eq!(backend.stats().deinits(), 1);
    assert_eq!(CoreGuard::users("scenario-cores"), 0);
}
