//! Focus-lock feedback loop.
//!
//! The same control-loop pattern as [`crate::acquisition`], instantiated for
//! the focus-lock hardware: a quadrant photodiode watching the reflection of
//! an IR spot off the coverslip, and an objective Z positioner. While locked,
//! each tick reads the QPD and commands the stage to a corrected position
//! computed by a linear lock function around the configured Z center.
//!
//! Corrections are gated on the QPD sum signal: with no usable reflection the
//! loop holds position instead of chasing noise.

use crate::config::FocusSettings;
use crate::core::{AcquisitionState, FocusStage, QpdSensor};
use crate::error::{AppResult, DaqError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Events broadcast by the focus-lock loop.
#[derive(Clone, Copy, Debug)]
pub enum FocusEvent {
    /// One QPD sample was taken.
    Sample {
        /// Measured spot displacement.
        offset: f64,
        /// QPD sum signal.
        sum: f64,
        /// Stage target commanded for this sample, or `None` when the sum
        /// signal was below the lock threshold and position was held.
        target: Option<f64>,
    },
    /// Too many consecutive device failures; the lock disengaged itself.
    Fault,
}

struct Inner {
    qpd: Box<dyn QpdSensor>,
    stage: Box<dyn FocusStage>,
    state: AcquisitionState,
    consecutive_errors: u32,
    shutdown_requested: bool,
}

/// Owns the QPD and stage and runs the feedback loop.
pub struct FocusLockController {
    shared: Arc<Mutex<Inner>>,
    events: broadcast::Sender<FocusEvent>,
    loop_task: Option<JoinHandle<()>>,
    settings: FocusSettings,
}

impl FocusLockController {
    /// Creates the controller and spawns its loop task; the loop idles until
    /// the lock is engaged and lives until [`shutdown`].
    ///
    /// [`shutdown`]: FocusLockController::shutdown
    pub fn new(
        qpd: Box<dyn QpdSensor>,
        stage: Box<dyn FocusStage>,
        settings: FocusSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let shared = Arc::new(Mutex::new(Inner {
            qpd,
            stage,
            state: AcquisitionState::Idle,
            consecutive_errors: 0,
            shutdown_requested: false,
        }));

        let loop_task = tokio::spawn(run_loop(
            Arc::clone(&shared),
            events.clone(),
            settings.clone(),
        ));

        Self {
            shared,
            events,
            loop_task: Some(loop_task),
            settings,
        }
    }

    /// Subscribes to the lock's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<FocusEvent> {
        self.events.subscribe()
    }

    /// Engages the lock. Ignored with a warning if already engaged.
    pub async fn start_lock(&self) -> AppResult<()> {
        let mut inner = self.shared.lock().await;
        if inner.state != AcquisitionState::Idle {
            warn!("start_lock ignored: lock already engaged");
            return Ok(());
        }
        inner.consecutive_errors = 0;
        inner.state = AcquisitionState::Active;
        info!("focus lock engaged");
        Ok(())
    }

    /// Disengages the lock and blocks until the loop has acknowledged
    /// `Idle`. Idempotent.
    pub async fn stop_lock(&self) -> AppResult<()> {
        {
            let mut inner = self.shared.lock().await;
            match inner.state {
                AcquisitionState::Idle => return Ok(()),
                AcquisitionState::Stopping => {}
                AcquisitionState::Active => {
                    inner.state = AcquisitionState::Stopping;
                    info!("focus lock stop requested");
                }
            }
        }
        self.wait_for_idle().await
    }

    /// True while the lock is engaged.
    pub async fn is_locked(&self) -> bool {
        self.shared.lock().await.state == AcquisitionState::Active
    }

    /// Stops the loop task and releases both devices. Terminal.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        {
            let mut inner = self.shared.lock().await;
            inner.shutdown_requested = true;
        }
        if let Some(task) = self.loop_task.take() {
            task.await
                .map_err(|e| DaqError::Shutdown(e.to_string()))?;
        }
        let mut inner = self.shared.lock().await;
        inner.qpd.shutdown().await?;
        inner.stage.shutdown().await?;
        info!("focus lock controller shut down");
        Ok(())
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

impl Drop for FocusLockController {
    fn drop(&mut self) {
        if let Some(task) = self.loop_task.take() {
            task.abort();
        }
    }
}

async fn run_loop(
    shared: Arc<Mutex<Inner>>,
    events: broadcast::Sender<FocusEvent>,
    settings: FocusSettings,
) {
    debug!("focus lock loop started");
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
                    tick_locked(&mut inner, &mut outgoing, &settings).await;
                }
                AcquisitionState::Stopping => {
                    inner.state = AcquisitionState::Idle;
                }
                AcquisitionState::Idle => {}
            }
        }
        for event in outgoing {
            let _ = events.send(event);
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
    debug!("focus lock loop exited");
}

async fn tick_locked(inner: &mut Inner, outgoing: &mut Vec<FocusEvent>, settings: &FocusSettings) {
    let sample = match inner.qpd.read_sample().await {
        Ok(sample) => {
            inner.consecutive_errors = 0;
            sample
        }
        Err(e) => {
            fault_tick(inner, outgoing, settings, &e, "qpd read failed");
            return;
        }
    };

    let target = if sample.sum >= settings.sum_threshold {
        let target = settings.z_center_um + settings.lock_gain * sample.offset;
        if let Err(e) = inner.stage.move_to(target).await {
            fault_tick(inner, outgoing, settings, &e, "stage move failed");
            return;
        }
        Some(target)
    } else {
        debug!(sum = sample.sum, "qpd sum below threshold, holding position");
        None
    };

    outgoing.push(FocusEvent::Sample {
        offset: sample.offset,
        sum: sample.sum,
        target,
    });
}

fn fault_tick(
    inner: &mut Inner,
    outgoing: &mut Vec<FocusEvent>,
    settings: &FocusSettings,
    err: &DaqError,
    what: &str,
) {
    inner.consecutive_errors += 1;
    warn!(
        error = %err,
        consecutive = inner.consecutive_errors,
        "{}, retrying next tick",
        what
    );
    if inner.consecutive_errors >= settings.fault_threshold {
        error!(
            threshold = settings.fault_threshold,
            "too many consecutive focus lock failures, disengaging"
        );
        inner.consecutive_errors = 0;
        inner.state = AcquisitionState::Idle;
        outgoing.push(FocusEvent::Fault);
    }
}
