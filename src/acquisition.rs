//! Camera acquisition controller.
//!
//! The controller owns a [`CameraDevice`] and runs the continuous acquisition
//! loop on a dedicated Tokio task: while `Active`, each tick polls the device
//! for newly completed frames, wraps them in [`CameraFrame`] objects with
//! monotonically increasing sequence numbers, persists them through the film
//! sink when filming, and broadcasts the batch to every subscriber. When not
//! `Active` the loop still runs, sleeping its polling interval, so start and
//! stop never create or destroy threads.
//!
//! All acquisition state and every device call are serialized behind one
//! `tokio::sync::Mutex` shared by the loop task and the control methods; no
//! two device calls can ever be in flight concurrently.
//!
//! ```text
//! caller: configure() -> start(key) ----------------> stop() -> shutdown()
//!                              |                        |
//! loop:   idle .. idle .. [poll -> frames -> sink/broadcast] .. idle ..
//! ```

use crate::config::CameraSettings;
use crate::core::{
    AcquisitionSession, AcquisitionState, CameraDevice, CameraFrame, FilmSettings, FrameSink,
    SessionKey,
};
use crate::error::{AppResult, DaqError};
use crate::properties::{apply_camera_properties, CameraConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Events broadcast by the controller to notifier subscribers.
#[derive(Clone, Debug)]
pub enum AcquisitionEvent {
    /// One batch of newly acquired frames, in sequence order.
    NewFrames {
        /// The frames, oldest first.
        frames: Vec<CameraFrame>,
        /// Session the frames belong to.
        key: SessionKey,
    },
    /// The configured frame limit was hit. Fires at most once per session,
    /// coincident with the final frame batch.
    LimitReached {
        /// Session that completed.
        key: SessionKey,
    },
    /// Too many consecutive poll failures; acquisition was stopped.
    DeviceFault {
        /// Session that was aborted.
        key: SessionKey,
    },
    /// The film sink failed; persistence stopped for the rest of the
    /// session, frames continue to be notified.
    SinkError {
        /// Session the failure occurred in.
        key: SessionKey,
        /// Formatted sink error.
        message: String,
    },
}

/// State shared between the control methods and the loop task.
struct Inner {
    device: Box<dyn CameraDevice>,
    state: AcquisitionState,
    configured: bool,
    last_error: Option<DaqError>,
    frame_counter: u64,
    session: Option<AcquisitionSession>,
    film: FilmSettings,
    sink: Option<Box<dyn FrameSink>>,
    consecutive_poll_errors: u32,
    shutdown_requested: bool,
}

/// Owns the camera and the acquisition loop. See the module docs.
pub struct AcquisitionController {
    shared: Arc<Mutex<Inner>>,
    events: broadcast::Sender<AcquisitionEvent>,
    loop_task: Option<JoinHandle<()>>,
    settings: CameraSettings,
}

impl AcquisitionController {
    /// Creates the controller and spawns its loop task. The loop idles until
    /// a configured session is started and lives until [`shutdown`].
    ///
    /// [`shutdown`]: AcquisitionController::shutdown
    pub fn new(device: Box<dyn CameraDevice>, settings: CameraSettings) -> Self {
        let (events, _) = broadcast::channel(1024);
        let shared = Arc::new(Mutex::new(Inner {
            device,
            state: AcquisitionState::Idle,
            configured: false,
            last_error: None,
            frame_counter: 0,
            session: None,
            film: FilmSettings::preview(),
            sink: None,
            consecutive_poll_errors: 0,
            shutdown_requested: false,
        }));

        let loop_task = tokio::spawn(run_loop(
            Arc::clone(&shared),
            events.clone(),
            settings.poll_interval,
            settings.fault_threshold,
            settings.channel_id.clone(),
        ));

        Self {
            shared,
            events,
            loop_task: Some(loop_task),
            settings,
        }
    }

    /// Subscribes to the controller's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<AcquisitionEvent> {
        self.events.subscribe()
    }

    /// Applies a configuration batch to the camera.
    ///
    /// Only legal while `Idle`. Never propagates a device error: on failure
    /// the controller records it (see [`last_error`]) and marks itself
    /// unconfigured, so a subsequent `start` is a no-op instead of failing
    /// mid-loop. Returns the resulting configured flag.
    ///
    /// When `config.film.filming` is set, `sink` receives every frame of the
    /// following sessions in sequence order.
    ///
    /// [`last_error`]: AcquisitionController::last_error
    pub async fn configure(
        &self,
        config: CameraConfig,
        sink: Option<Box<dyn FrameSink>>,
    ) -> bool {
        let mut inner = self.shared.lock().await;
        if inner.state != AcquisitionState::Idle {
            warn!("configure ignored: acquisition is not idle");
            inner.last_error = Some(DaqError::Protocol(
                "configure while acquisition is running".to_string(),
            ));
            return inner.configured;
        }

        // A sink left over from an earlier film must not silently receive
        // frames of the next one.
        if let Some(mut old) = inner.sink.take() {
            if let Err(e) = old.finalize().await {
                warn!(error = %e, "failed to finalize previous film sink");
            }
        }

        match apply_camera_properties(inner.device.as_mut(), &config).await {
            Ok(()) => {
                inner.film = config.film;
                inner.sink = if config.film.filming { sink } else { None };
                inner.configured = true;
                inner.last_error = None;
                info!(
                    roi = ?(config.geometry.x_start, config.geometry.x_pixels,
                            config.geometry.y_start, config.geometry.y_pixels),
                    binning = config.geometry.x_bin,
                    filming = config.film.filming,
                    "camera configured"
                );
            }
            Err(e) => {
                warn!(error = %e, "bad camera settings");
                inner.configured = false;
                inner.last_error = Some(e);
            }
        }
        inner.configured
    }

    /// Starts a new acquisition session under `key`.
    ///
    /// A start issued while unconfigured or while a session is running is
    /// reported as a warning and ignored. A device failure is returned and
    /// leaves the controller `Idle`.
    pub async fn start(&self, key: SessionKey) -> AppResult<()> {
        let mut inner = self.shared.lock().await;
        if inner.state != AcquisitionState::Idle {
            warn!(session = %key, "start ignored: acquisition already running");
            return Ok(());
        }
        if !inner.configured {
            warn!(session = %key, "start ignored: camera is not configured");
            return Ok(());
        }

        inner.device.start_acquisition().await?;
        inner.frame_counter = 0;
        inner.consecutive_poll_errors = 0;
        let film = inner.film;
        inner.session = Some(AcquisitionSession { key, film });
        inner.state = AcquisitionState::Active;
        info!(session = %key, filming = film.filming, "acquisition started");
        Ok(())
    }

    /// Stops the running session and blocks until the loop task has
    /// acknowledged `Idle`, guaranteeing no frame is produced after this
    /// returns. Idempotent: stopping an idle controller is a no-op.
    pub async fn stop(&self) -> AppResult<()> {
        {
            let mut inner = self.shared.lock().await;
            match inner.state {
                AcquisitionState::Idle => return Ok(()),
                AcquisitionState::Stopping => {}
                AcquisitionState::Active => {
                    inner.state = AcquisitionState::Stopping;
                    if let Err(e) = inner.device.stop_acquisition().await {
                        // Abort the transition; the caller decides what to do
                        // with a driver that refuses to stop.
                        inner.state = AcquisitionState::Active;
                        return Err(e);
                    }
                    info!("acquisition stop requested");
                }
            }
        }
        self.wait_for_idle().await
    }

    /// Stops the loop task and releases the device. Terminal: no further
    /// operations are valid afterward.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        {
            let mut inner = self.shared.lock().await;
            if inner.state == AcquisitionState::Active {
                if let Err(e) = inner.device.stop_acquisition().await {
                    warn!(error = %e, "device stop failed during shutdown");
                }
                inner.state = AcquisitionState::Stopping;
            }
            inner.shutdown_requested = true;
        }

        if let Some(task) = self.loop_task.take() {
            task.await
                .map_err(|e| DaqError::Shutdown(e.to_string()))?;
        }

        let mut inner = self.shared.lock().await;
        if let Some(mut sink) = inner.sink.take() {
            if let Err(e) = sink.finalize().await {
                warn!(error = %e, "failed to finalize film sink during shutdown");
            }
        }
        inner.device.shutdown().await?;
        inner.configured = false;
        info!("acquisition controller shut down");
        Ok(())
    }

    /// Current loop state.
    pub async fn state(&self) -> AcquisitionState {
        self.shared.lock().await.state
    }

    /// True after the last `configure` succeeded.
    pub async fn is_configured(&self) -> bool {
        self.shared.lock().await.configured
    }

    /// The recorded error of the last failed `configure`, if any.
    pub async fn last_error(&self) -> Option<String> {
        self.shared
            .lock()
            .await
            .last_error
            .as_ref()
            .map(|e| e.to_string())
    }

    /// Frames produced so far in the current session.
    pub async fn frame_count(&self) -> u64 {
        self.shared.lock().await.frame_counter
    }

    /// Seconds per frame, derived from the camera's reported frame rate.
    pub async fn acquisition_timing(&self) -> AppResult<f64> {
        let inner = self.shared.lock().await;
        let rate = inner
            .device
            .get_property("internal_frame_rate")
            .await?
            .as_f64()
            .filter(|rate| *rate > 0.0)
            .ok_or_else(|| {
                DaqError::Device("camera reported an unusable frame rate".to_string())
            })?;
        Ok(1.0 / rate)
    }

    async fn wait_for_idle(&self) -> AppResult<()> {
        let deadline = tokio::time::Instant::now() + self.settings.stop_timeout;
        loop {
            {
                let inner = self.shared.lock().await;
                if inner.state == AcquisitionState::Idle {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DaqError::StopTimeout);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl Drop for AcquisitionController {
    fn drop(&mut self) {
        // Dropped without shutdown: don't leave the loop task running.
        if let Some(task) = self.loop_task.take() {
            task.abort();
        }
    }
}

/// The acquisition loop. Runs until shutdown is requested; ticks at
/// `poll_interval` in every state so an idle controller costs a bounded
/// amount of CPU and an active one has bounded per-frame latency.
async fn run_loop(
    shared: Arc<Mutex<Inner>>,
    events: broadcast::Sender<AcquisitionEvent>,
    poll_interval: Duration,
    fault_threshold: u32,
    channel_id: String,
) {
    debug!("acquisition loop started");
    loop {
        let mut outgoing = Vec::new();
        {
            let mut inner = shared.lock().await;
            if inner.shutdown_requested {
                inner.state = AcquisitionState::Idle;
                break;
            }
            match inner.state {
                AcquisitionState::Active => {
                    if inner.configured {
                        tick_active(&mut inner, &mut outgoing, fault_threshold, &channel_id)
                            .await;
                    }
                }
                AcquisitionState::Stopping => {
                    finalize_sink(&mut inner).await;
                    inner.session = None;
                    inner.state = AcquisitionState::Idle;
                }
                AcquisitionState::Idle => {}
            }
        }
        // Dispatch after releasing the lock so slow subscribers never extend
        // the critical section.
        for event in outgoing {
            let _ = events.send(event);
        }
        tokio::time::sleep(poll_interval).await;
    }
    debug!("acquisition loop exited");
}

/// One active tick: poll, build frames, enforce the limit policy, persist,
/// queue notifications.
async fn tick_active(
    inner: &mut Inner,
    outgoing: &mut Vec<AcquisitionEvent>,
    fault_threshold: u32,
    channel_id: &str,
) {
    let Some(session) = inner.session.clone() else {
        return;
    };

    let poll = match inner.device.poll_frames().await {
        Ok(poll) => {
            inner.consecutive_poll_errors = 0;
            poll
        }
        Err(e) => {
            inner.consecutive_poll_errors += 1;
            warn!(
                error = %e,
                consecutive = inner.consecutive_poll_errors,
                "frame poll failed, retrying next tick"
            );
            if inner.consecutive_poll_errors >= fault_threshold {
                error!(
                    threshold = fault_threshold,
                    "too many consecutive poll failures, stopping acquisition"
                );
                if let Err(stop_err) = inner.device.stop_acquisition().await {
                    warn!(error = %stop_err, "device stop failed after poll fault");
                }
                finalize_sink(inner).await;
                inner.session = None;
                inner.state = AcquisitionState::Idle;
                inner.consecutive_poll_errors = 0;
                outgoing.push(AcquisitionEvent::DeviceFault { key: session.key });
            }
            return;
        }
    };

    if poll.buffers.is_empty() {
        return;
    }

    let (width, height) = (poll.width, poll.height);
    let mut frames = Vec::with_capacity(poll.buffers.len());
    let mut limit_hit = false;
    for data in poll.buffers {
        let frame = CameraFrame::new(data, inner.frame_counter, width, height, channel_id);
        inner.frame_counter += 1;
        frames.push(frame);
        if session.film.filming
            && session.film.stop_at_limit
            && session.film.frame_limit == Some(inner.frame_counter)
        {
            limit_hit = true;
            break;
        }
    }

    if session.film.filming && inner.sink.is_some() {
        let mut failed = None;
        if let Some(sink) = inner.sink.as_mut() {
            for frame in &frames {
                if let Err(e) = sink.save_frame(frame).await {
                    error!(error = %e, frame = frame.number, "film sink write failed");
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            // A gap would corrupt the sequential output format; stop
            // persisting but keep notifying.
            inner.sink = None;
            outgoing.push(AcquisitionEvent::SinkError {
                key: session.key,
                message: e.to_string(),
            });
        }
    }

    if limit_hit {
        outgoing.push(AcquisitionEvent::LimitReached { key: session.key });
    }
    outgoing.push(AcquisitionEvent::NewFrames {
        frames,
        key: session.key,
    });

    if limit_hit {
        info!(
            session = %session.key,
            frames = inner.frame_counter,
            "frame limit reached, stopping acquisition"
        );
        if let Err(e) = inner.device.stop_acquisition().await {
            warn!(error = %e, "device stop failed at frame limit");
        }
        finalize_sink(inner).await;
        inner.session = None;
        inner.state = AcquisitionState::Idle;
    }
}

async fn finalize_sink(inner: &mut Inner) {
    if let Some(mut sink) = inner.sink.take() {
        if let Err(e) = sink.finalize().await {
            warn!(error = %e, "failed to finalize film sink");
        }
    }
}
