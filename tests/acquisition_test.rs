//! End-to-end tests of the acquisition control loop: sequencing, stop
//! semantics, the stop-at-limit policy and failure escalation, all driven
//! through the public controller API against the mock camera.

mod common;

use common::{next_event, test_settings, wait_until, RecordingSink};
use scope_daq::acquisition::{AcquisitionController, AcquisitionEvent};
use scope_daq::core::{AcquisitionState, FilmSettings, SessionKey};
use scope_daq::instrument::mock::MockCamera;
use scope_daq::properties::{CameraConfig, CameraGeometry, PropertyMap};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

fn preview_config() -> CameraConfig {
    CameraConfig {
        geometry: CameraGeometry::full_sensor(32, 32),
        properties: PropertyMap::new(),
        film: FilmSettings::preview(),
    }
}

fn film_config(film: FilmSettings) -> CameraConfig {
    CameraConfig {
        geometry: CameraGeometry::full_sensor(32, 32),
        properties: PropertyMap::new(),
        film,
    }
}

#[tokio::test]
async fn persisted_sequence_is_gapless_from_zero() {
    let mut camera = MockCamera::new(32, 32);
    camera.set_frames_per_poll(2);
    let mut controller = AcquisitionController::new(Box::new(camera), test_settings());

    let (sink, sink_probe) = RecordingSink::new();
    assert!(
        controller
            .configure(film_config(FilmSettings::run_till_abort()), Some(Box::new(sink)))
            .await
    );

    let mut events = controller.subscribe();
    controller.start(SessionKey::new()).await.unwrap();

    wait_until(|| sink_probe.saved() >= 10, "ten frames persisted").await;
    controller.stop().await.unwrap();

    // Persister saw every sequence number in order, no gaps, from 0.
    let numbers = sink_probe.numbers();
    let expected: Vec<u64> = (0..numbers.len() as u64).collect();
    assert_eq!(numbers, expected);

    // The notifier saw the same sequence, batched.
    let mut notified = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let AcquisitionEvent::NewFrames { frames, .. } = event {
            notified.extend(frames.iter().map(|f| f.number));
        }
    }
    let expected: Vec<u64> = (0..notified.len() as u64).collect();
    assert_eq!(notified, expected);
    assert!(notified.len() >= numbers.len());

    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn fixed_length_film_dispatches_exactly_n_frames() {
    let mut camera = MockCamera::new(32, 32);
    // three frames per poll so the limit lands mid-batch
    camera.set_frames_per_poll(3);
    let mut controller = AcquisitionController::new(Box::new(camera), test_settings());

    let (sink, sink_probe) = RecordingSink::new();
    assert!(
        controller
            .configure(film_config(FilmSettings::fixed_length(7)), Some(Box::new(sink)))
            .await
    );

    let mut events = controller.subscribe();
    let key = SessionKey::new();
    controller.start(key).await.unwrap();

    let mut notified = Vec::new();
    let mut limit_events = 0;
    while limit_events == 0 || notified.len() < 7 {
        match next_event(&mut events).await {
            AcquisitionEvent::NewFrames { frames, key: k } => {
                assert_eq!(k, key);
                notified.extend(frames.iter().map(|f| f.number));
            }
            AcquisitionEvent::LimitReached { key: k } => {
                assert_eq!(k, key);
                limit_events += 1;
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    assert_eq!(limit_events, 1);
    assert_eq!(notified, (0..7).collect::<Vec<u64>>());
    assert_eq!(sink_probe.numbers(), (0..7).collect::<Vec<u64>>());

    // The controller stopped itself and closed the film.
    wait_until(|| sink_probe.finalized(), "sink finalized").await;
    assert_eq!(controller.state().await, AcquisitionState::Idle);

    // No frames trickle in after the limit.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn restart_never_leaks_frames_from_previous_session() {
    let camera = MockCamera::new(32, 32);
    let mut controller = AcquisitionController::new(Box::new(camera), test_settings());
    assert!(controller.configure(preview_config(), None).await);

    let mut events = controller.subscribe();
    let key_a = SessionKey::new();
    controller.start(key_a).await.unwrap();
    wait_until2(&controller, 3).await;
    controller.stop().await.unwrap();

    // Everything produced so far belongs to session A; drain it.
    tokio::time::sleep(Duration::from_millis(10)).await;
    while events.try_recv().is_ok() {}

    let key_b = SessionKey::new();
    controller.start(key_b).await.unwrap();

    let mut first_batch = None;
    while first_batch.is_none() {
        if let AcquisitionEvent::NewFrames { frames, key } = next_event(&mut events).await {
            first_batch = Some((frames, key));
        }
    }
    let (frames, key) = first_batch.unwrap();
    assert_eq!(key, key_b, "frame batch carries the old session key");
    assert_eq!(frames[0].number, 0, "sequence did not restart from zero");

    controller.stop().await.unwrap();
    controller.shutdown().await.unwrap();
}

/// Waits until the current session has produced at least `frames` frames.
async fn wait_until2(controller: &AcquisitionController, frames: u64) {
    for _ in 0..2000 {
        if controller.frame_count().await >= frames {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("no frames produced in time");
}

#[tokio::test]
async fn no_frames_are_produced_after_stop_returns() {
    let camera = MockCamera::new(32, 32);
    let mut controller = AcquisitionController::new(Box::new(camera), test_settings());
    assert!(controller.configure(preview_config(), None).await);

    controller.start(SessionKey::new()).await.unwrap();
    wait_until2(&controller, 3).await;
    controller.stop().await.unwrap();
    assert_eq!(controller.state().await, AcquisitionState::Idle);

    let count = controller.frame_count().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(controller.frame_count().await, count);

    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent_after_a_session() {
    let camera = MockCamera::new(32, 32);
    let mut controller = AcquisitionController::new(Box::new(camera), test_settings());
    assert!(controller.configure(preview_config(), None).await);

    controller.start(SessionKey::new()).await.unwrap();
    controller.stop().await.unwrap();
    controller.stop().await.unwrap();
    assert_eq!(controller.state().await, AcquisitionState::Idle);

    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn repeated_poll_failures_escalate_to_device_fault() {
    let camera = MockCamera::new(32, 32);
    let probe = camera.probe();
    let mut controller = AcquisitionController::new(Box::new(camera), test_settings());
    assert!(controller.configure(preview_config(), None).await);

    let mut events = controller.subscribe();
    probe.fail_next_polls(10);
    let key = SessionKey::new();
    controller.start(key).await.unwrap();

    loop {
        match next_event(&mut events).await {
            AcquisitionEvent::DeviceFault { key: k } => {
                assert_eq!(k, key);
                break;
            }
            AcquisitionEvent::NewFrames { .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(controller.state().await, AcquisitionState::Idle);

    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn start_failure_is_surfaced_and_leaves_state_unchanged() {
    let camera = MockCamera::new(32, 32);
    let probe = camera.probe();
    let mut controller = AcquisitionController::new(Box::new(camera), test_settings());
    assert!(controller.configure(preview_config(), None).await);

    probe.fail_next_start();
    assert!(controller.start(SessionKey::new()).await.is_err());
    assert_eq!(controller.state().await, AcquisitionState::Idle);

    // The failure was transient; the next start succeeds.
    controller.start(SessionKey::new()).await.unwrap();
    assert_eq!(controller.state().await, AcquisitionState::Active);

    controller.stop().await.unwrap();
    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn sink_failure_keeps_notifying_frames() {
    let camera = MockCamera::new(32, 32);
    let mut controller = AcquisitionController::new(Box::new(camera), test_settings());

    let (sink, sink_probe) = RecordingSink::failing_on(3);
    assert!(
        controller
            .configure(film_config(FilmSettings::run_till_abort()), Some(Box::new(sink)))
            .await
    );

    let mut events = controller.subscribe();
    controller.start(SessionKey::new()).await.unwrap();

    let mut saw_sink_error = false;
    let mut notified_after_error = false;
    while !(saw_sink_error && notified_after_error) {
        match next_event(&mut events).await {
            AcquisitionEvent::SinkError { .. } => saw_sink_error = true,
            AcquisitionEvent::NewFrames { frames, .. } => {
                if saw_sink_error || frames.iter().any(|f| f.number >= 3) {
                    notified_after_error = true;
                }
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    // Frames before the failure were persisted in order; nothing after.
    assert_eq!(sink_probe.numbers(), vec![0, 1, 2]);
    assert_eq!(controller.state().await, AcquisitionState::Active);

    controller.stop().await.unwrap();
    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn control_calls_never_interleave_with_a_slow_poll() {
    let mut camera = MockCamera::new(32, 32);
    camera.set_poll_delay(Duration::from_millis(5));
    let probe = camera.probe();
    let mut controller = AcquisitionController::new(Box::new(camera), test_settings());

    assert!(controller.configure(preview_config(), None).await);

    // Hammer the control surface while the loop is polling with an
    // artificially slow readout.
    for _ in 0..10 {
        controller.start(SessionKey::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3)).await;
        controller.stop().await.unwrap();
        assert!(controller.configure(preview_config(), None).await);
    }

    assert!(probe.poll_count() > 0);
    assert_eq!(probe.reentrancy_violations(), 0);

    controller.shutdown().await.unwrap();
}
