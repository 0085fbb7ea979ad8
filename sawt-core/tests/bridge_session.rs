mod common;

use std::sync::Arc;

use approx::assert_relative_eq;
use parking_lot::Mutex;
use sawt_core::audio::{SourceId, FRAME_SIZE, INPUT_SAMPLE_RATE};
use sawt_core::buffering::chunk::AudioFrame;
use sawt_core::codec::InboundChunk;
use sawt_core::engine::{Session, SharedState, DEFAULT_LEVEL_GAIN};
use sawt_core::{SessionStatus, TransportEvent};

use common::{
    pcm24k_ms, CallLog, CaptureProbe, ManualClock, MockCapture, MockHandle, MockOutput,
    OutputProbe, TransportProbe,
};

struct Rig {
    shared: Arc<SharedState>,
    session: Session,
    clock: ManualClock,
    log: CallLog,
    output: Arc<Mutex<OutputProbe>>,
    capture: Arc<Mutex<CaptureProbe>>,
    transport: Arc<Mutex<TransportProbe>>,
}

fn rig_with(configure: impl FnOnce(&mut MockOutput, &mut MockCapture, &mut MockHandle)) -> Rig {
    let log = CallLog::default();
    let clock = ManualClock::default();
    let shared = Arc::new(SharedState::new());
    let mut session = Session::new(Arc::clone(&shared), DEFAULT_LEVEL_GAIN);

    let mut output = MockOutput::new(clock.clone(), Arc::clone(&log));
    let mut capture = MockCapture::new(Arc::clone(&log));
    let mut handle = MockHandle::new(Arc::clone(&log));
    configure(&mut output, &mut capture, &mut handle);

    let output_probe = Arc::clone(&output.probe);
    let capture_probe = Arc::clone(&capture.probe);
    let transport_probe = Arc::clone(&handle.probe);

    session.attach_output(Box::new(output));
    session.attach_capture(Box::new(capture));
    session.attach_transport(Box::new(handle));

    Rig {
        shared,
        session,
        clock,
        log,
        output: output_probe,
        capture: capture_probe,
        transport: transport_probe,
    }
}

fn rig() -> Rig {
    rig_with(|_, _, _| {})
}

fn connected() -> Rig {
    let mut rig = rig();
    rig.session.handle_transport_event(TransportEvent::Open);
    assert_eq!(rig.session.status(), SessionStatus::Connected);
    rig
}

fn speech_frame(value: f32) -> AudioFrame {
    AudioFrame::new(vec![value; FRAME_SIZE], INPUT_SAMPLE_RATE)
}

fn audio(ms: usize, seq: u64) -> TransportEvent {
    TransportEvent::Audio(InboundChunk::raw(pcm24k_ms(ms, 8_000), seq))
}

#[test]
fn muted_frames_meter_but_do_not_send() {
    let mut rig = connected();
    let mut levels = rig.shared.subscribe_levels();

    rig.shared.set_muted(true);
    for _ in 0..3 {
        rig.session.handle_frame(speech_frame(0.1));
    }
    assert!(rig.transport.lock().sent.is_empty());

    for _ in 0..3 {
        let event = levels.try_recv().expect("level published while muted");
        assert!(event.muted);
        assert_relative_eq!(event.level, 0.5, epsilon = 1e-5);
    }
    assert_relative_eq!(rig.shared.input_level(), 0.5, epsilon = 1e-5);

    rig.shared.set_muted(false);
    rig.session.handle_frame(speech_frame(0.1));
    rig.session.handle_frame(speech_frame(0.1));

    let sent = &rig.transport.lock().sent;
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|c| c.data.len() == FRAME_SIZE * 2));
    assert!(sent.iter().all(|c| c.mime_type == "pcm;rate=16000"));

    let diag = rig.shared.diagnostics().snapshot();
    assert_eq!(diag.frames_muted, 3);
    assert_eq!(diag.chunks_sent, 2);
}

#[test]
fn frames_before_open_are_discarded() {
    let mut rig = rig();
    rig.session.handle_frame(speech_frame(0.2));
    assert!(rig.transport.lock().sent.is_empty());
    assert_eq!(rig.shared.diagnostics().snapshot().frames_dropped, 1);

    rig.session.handle_transport_event(TransportEvent::Open);
    rig.session.handle_frame(speech_frame(0.2));
    assert_eq!(rig.transport.lock().sent.len(), 1);
}

#[test]
fn back_to_back_buffers_play_gaplessly() {
    let mut rig = connected();
    rig.clock.set(0.5);

    rig.session.handle_transport_event(audio(100, 0));
    rig.session.handle_transport_event(audio(100, 1));

    let started = &rig.output.lock().started;
    assert_eq!(started.len(), 2);
    assert_relative_eq!(started[0].1, 0.5);
    assert_relative_eq!(started[1].1, started[0].1 + 0.1, epsilon = 1e-9);
    assert_eq!(started[0].2, 2_400);
}

#[test]
fn late_buffer_never_starts_in_the_past() {
    let mut rig = connected();
    rig.session.handle_transport_event(audio(100, 0));

    rig.clock.set(0.35);
    rig.session.handle_transport_event(audio(100, 1));

    let started = &rig.output.lock().started;
    assert_relative_eq!(started[1].1, 0.35);
    assert_eq!(rig.shared.diagnostics().snapshot().underruns, 1);
}

#[test]
fn late_buffer_after_turn_complete_is_not_an_underrun() {
    let mut rig = connected();
    rig.session.handle_transport_event(audio(100, 0));
    rig.session.handle_transport_event(TransportEvent::TurnComplete);

    rig.clock.set(2.0);
    rig.session.handle_transport_event(audio(100, 1));

    assert_relative_eq!(rig.output.lock().started[1].1, 2.0);
    assert_eq!(rig.shared.diagnostics().snapshot().underruns, 0);
}

#[test]
fn sources_without_a_completion_notice_leave_the_active_set() {
    let mut rig = connected();
    rig.session.handle_transport_event(audio(100, 0));
    rig.session.handle_transport_event(audio(100, 1));
    assert_eq!(rig.session.active_sources(), 2);

    // Both ran out; the device never reported either.
    rig.clock.set(0.5);
    rig.session.handle_transport_event(audio(100, 2));
    assert_eq!(rig.session.active_sources(), 1);
    assert_eq!(rig.shared.diagnostics().snapshot().sources_completed, 2);

    // A notice arriving late is not counted twice.
    rig.session.handle_source_ended(SourceId(0));
    assert_eq!(rig.shared.diagnostics().snapshot().sources_completed, 2);
}

#[test]
fn playback_clock_starts_at_device_time() {
    let rig = rig_with(|output, _, _| output.clock.set(7.25));
    assert_relative_eq!(rig.session.playback_clock().next_start(), 7.25);
}

#[test]
fn interrupt_mid_playback_flushes_and_reanchors() {
    let mut rig = connected();
    rig.clock.set(1.0);
    rig.session.handle_transport_event(audio(500, 0));
    assert_eq!(rig.session.active_sources(), 1);

    rig.clock.set(1.2);
    rig.session.handle_transport_event(TransportEvent::Interrupted);

    assert_eq!(rig.session.active_sources(), 0);
    assert_eq!(rig.output.lock().stopped, vec![SourceId(0)]);
    assert_relative_eq!(rig.session.playback_clock().next_start(), 1.2);

    rig.clock.set(1.25);
    rig.session.handle_transport_event(audio(100, 1));
    assert_relative_eq!(rig.output.lock().started[1].1, 1.25);

    let diag = rig.shared.diagnostics().snapshot();
    assert_eq!(diag.interrupts, 1);
    assert_eq!(diag.sources_interrupted, 1);
}

#[test]
fn interrupt_ignores_sources_that_already_ended() {
    let mut rig = connected();
    rig.session.handle_transport_event(audio(20, 0));
    rig.session.handle_transport_event(audio(20, 1));
    rig.session.handle_source_ended(SourceId(0));

    rig.session.handle_transport_event(TransportEvent::Interrupted);
    assert_eq!(rig.session.active_sources(), 0);
    assert_eq!(rig.output.lock().stopped, vec![SourceId(1)]);
    assert_eq!(rig.session.status(), SessionStatus::Connected);
}

#[test]
fn natural_completion_leaves_active_set() {
    let mut rig = connected();
    rig.session.handle_transport_event(audio(50, 0));
    rig.session.handle_source_ended(SourceId(0));
    rig.session.handle_source_ended(SourceId(0));

    assert_eq!(rig.session.active_sources(), 0);
    assert_eq!(rig.shared.diagnostics().snapshot().sources_completed, 1);
}

#[test]
fn undecodable_chunks_are_dropped_and_streaming_continues() {
    let mut rig = connected();

    rig.session
        .handle_transport_event(TransportEvent::Audio(InboundChunk::raw(vec![1, 2, 3], 0)));
    rig.session
        .handle_transport_event(TransportEvent::Audio(InboundChunk::raw(Vec::new(), 1)));
    rig.session.handle_transport_event(TransportEvent::Audio(InboundChunk::base64(
        "%%not base64%%",
        "pcm;rate=24000",
        2,
    )));
    rig.session.handle_transport_event(audio(40, 3));

    assert_eq!(rig.session.status(), SessionStatus::Connected);
    assert_eq!(rig.output.lock().started.len(), 1);
    let diag = rig.shared.diagnostics().snapshot();
    assert_eq!(diag.decode_errors, 3);
    assert_eq!(diag.chunks_received, 4);
}

#[test]
fn close_releases_in_order_once() {
    let mut rig = connected();
    rig.session.handle_transport_event(audio(200, 0));

    rig.session.close();
    assert_eq!(rig.session.status(), SessionStatus::Closed);
    assert_eq!(
        *rig.log.lock(),
        vec![
            "transport.close",
            "capture.stop",
            "capture.close",
            "output.stop src-0",
            "output.close",
        ]
    );

    rig.session.close();
    rig.session.fail("late failure".into());
    drop(rig.session);

    assert_eq!(rig.log.lock().len(), 5);
    assert_eq!(rig.transport.lock().closes, 1);
    assert_eq!(rig.capture.lock().closes, 1);
    assert_eq!(rig.output.lock().closes, 1);
    assert_eq!(rig.shared.status(), SessionStatus::Closed);
}

#[test]
fn release_continues_past_failing_steps() {
    let mut rig = rig_with(|output, capture, handle| {
        output.fail_close = true;
        capture.fail_close = true;
        handle.fail_close = true;
    });

    rig.session.close();

    assert_eq!(rig.transport.lock().closes, 1);
    assert_eq!(rig.capture.lock().stops, 1);
    assert_eq!(rig.capture.lock().closes, 1);
    assert_eq!(rig.output.lock().closes, 1);
    assert_eq!(rig.session.status(), SessionStatus::Closed);
}

#[test]
fn transport_error_is_terminal() {
    let mut rig = connected();
    let mut status = rig.shared.subscribe_status();

    rig.session
        .handle_transport_event(TransportEvent::Error("handshake rejected".into()));

    let event = status.try_recv().expect("error status broadcast");
    assert_eq!(event.status, SessionStatus::Error);
    assert_eq!(event.detail.as_deref(), Some("handshake rejected"));
    assert!(rig.session.is_finished());
    assert_eq!(rig.output.lock().closes, 1);

    // Terminal states absorb.
    rig.session.handle_transport_event(TransportEvent::Open);
    rig.session.close();
    assert_eq!(rig.shared.status(), SessionStatus::Error);
    assert!(status.try_recv().is_err());
}

#[test]
fn error_while_connecting_releases_devices() {
    let mut rig = rig();
    rig.session
        .handle_transport_event(TransportEvent::Error("dns failure".into()));

    assert_eq!(rig.session.status(), SessionStatus::Error);
    assert_eq!(rig.capture.lock().closes, 1);
    assert_eq!(rig.output.lock().closes, 1);
}

#[test]
fn unexpected_remote_close_is_an_error() {
    let mut rig = connected();
    let mut status = rig.shared.subscribe_status();

    rig.session.handle_transport_event(TransportEvent::Closed {
        reason: Some("going away".into()),
    });

    let event = status.try_recv().expect("status broadcast");
    assert_eq!(event.status, SessionStatus::Error);
    assert!(event.detail.unwrap_or_default().contains("going away"));
}

#[test]
fn events_after_close_are_ignored() {
    let mut rig = connected();
    rig.session.close();

    rig.session.handle_transport_event(audio(100, 0));
    rig.session.handle_frame(speech_frame(0.3));

    assert!(rig.output.lock().started.is_empty());
    assert!(rig.transport.lock().sent.is_empty());
}

#[test]
fn dropping_a_live_session_closes_it() {
    let rig = connected();
    let mut status = rig.shared.subscribe_status();
    drop(rig.session);

    assert_eq!(rig.shared.status(), SessionStatus::Closed);
    assert_eq!(status.try_recv().expect("closed").status, SessionStatus::Closed);
    assert_eq!(rig.output.lock().closes, 1);
    assert_eq!(rig.capture.lock().closes, 1);
}
