//! Mock instruments that generate synthetic data.
//!
//! Each mock exposes a cloneable probe handle so tests can inspect the calls
//! the controller made (property write order, poll counts, reentrancy) and
//! inject failures, after the mock itself has been boxed into a controller.

use crate::core::{
    CameraDevice, FocusStage, FramePoll, PropertyValue, QpdSample, QpdSensor,
};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// RAII guard backing the non-reentrancy assertion.
///
/// Every device entry point raises the busy flag for the duration of the
/// call; an overlapping call finds the flag already raised and is counted as
/// a violation instead of panicking inside the loop task.
struct CallGuard {
    busy: Arc<AtomicBool>,
    owned: bool,
}

impl CallGuard {
    fn enter(busy: &Arc<AtomicBool>, violations: &Arc<AtomicU32>) -> Self {
        let owned = !busy.swap(true, Ordering::SeqCst);
        if !owned {
            violations.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            busy: Arc::clone(busy),
            owned,
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.owned {
            self.busy.store(false, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// Mock camera
// =============================================================================

/// A camera that synthesizes frames instead of talking to hardware.
pub struct MockCamera {
    properties: HashMap<String, PropertyValue>,
    roi: (u32, u32),
    bin: u32,
    acquiring: bool,
    shut_down: bool,
    generated: u64,
    frames_per_poll: usize,
    poll_delay: Duration,
    rng: StdRng,
    writes: Arc<Mutex<Vec<(String, PropertyValue)>>>,
    busy: Arc<AtomicBool>,
    violations: Arc<AtomicU32>,
    fail_polls: Arc<AtomicU32>,
    fail_start: Arc<AtomicBool>,
    polls: Arc<AtomicU64>,
}

/// Cloneable inspection/injection handle for a [`MockCamera`].
#[derive(Clone)]
pub struct MockCameraProbe {
    writes: Arc<Mutex<Vec<(String, PropertyValue)>>>,
    violations: Arc<AtomicU32>,
    fail_polls: Arc<AtomicU32>,
    fail_start: Arc<AtomicBool>,
    polls: Arc<AtomicU64>,
}

impl MockCameraProbe {
    /// Every `set_property` call observed, in order.
    pub fn property_writes(&self) -> Vec<(String, PropertyValue)> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of overlapping device calls observed. Must stay 0.
    pub fn reentrancy_violations(&self) -> u32 {
        self.violations.load(Ordering::SeqCst)
    }

    /// Makes the next `count` polls fail with a device error.
    pub fn fail_next_polls(&self, count: u32) {
        self.fail_polls.store(count, Ordering::SeqCst);
    }

    /// Makes the next `start_acquisition` fail with a device error.
    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    /// Total number of `poll_frames` calls.
    pub fn poll_count(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }
}

impl MockCamera {
    /// Creates a mock camera with the given sensor dimensions.
    pub fn new(sensor_width: u32, sensor_height: u32) -> Self {
        let mut properties = HashMap::new();
        properties.insert("roi_x".to_string(), PropertyValue::Int(0));
        properties.insert("roi_width".to_string(), PropertyValue::from(sensor_width));
        properties.insert("roi_y".to_string(), PropertyValue::Int(0));
        properties.insert("roi_height".to_string(), PropertyValue::from(sensor_height));
        properties.insert("binning".to_string(), PropertyValue::from("1x1"));
        properties.insert("exposure_time".to_string(), PropertyValue::Float(0.1));
        properties.insert(
            "internal_frame_rate".to_string(),
            PropertyValue::Float(100.0),
        );
        properties.insert("temperature".to_string(), PropertyValue::Float(25.0));
        properties.insert(
            "trigger_mode".to_string(),
            PropertyValue::from("internal"),
        );
        properties.insert("gain".to_string(), PropertyValue::Int(1));

        Self {
            properties,
            roi: (sensor_width, sensor_height),
            bin: 1,
            acquiring: false,
            shut_down: false,
            generated: 0,
            frames_per_poll: 1,
            poll_delay: Duration::ZERO,
            rng: StdRng::seed_from_u64(42),
            writes: Arc::new(Mutex::new(Vec::new())),
            busy: Arc::new(AtomicBool::new(false)),
            violations: Arc::new(AtomicU32::new(0)),
            fail_polls: Arc::new(AtomicU32::new(0)),
            fail_start: Arc::new(AtomicBool::new(false)),
            polls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns an inspection handle that stays valid after the camera is
    /// boxed into a controller.
    pub fn probe(&self) -> MockCameraProbe {
        MockCameraProbe {
            writes: Arc::clone(&self.writes),
            violations: Arc::clone(&self.violations),
            fail_polls: Arc::clone(&self.fail_polls),
            fail_start: Arc::clone(&self.fail_start),
            polls: Arc::clone(&self.polls),
        }
    }

    /// Number of frames returned by each successful poll while acquiring.
    pub fn set_frames_per_poll(&mut self, frames: usize) {
        self.frames_per_poll = frames;
    }

    /// Artificial readout latency, applied inside the busy window so races
    /// have a wide target.
    pub fn set_poll_delay(&mut self, delay: Duration) {
        self.poll_delay = delay;
    }

    fn frame_dimensions(&self) -> (u32, u32) {
        (self.roi.0 / self.bin, self.roi.1 / self.bin)
    }

    fn synthesize_frame(&mut self, width: u32, height: u32) -> Vec<u16> {
        let mut data = vec![0u16; (width * height) as usize];
        let shift = self.generated * 7;
        for (i, px) in data.iter_mut().enumerate() {
            let base = ((i as u64 + shift) % 256) as u16 * 16;
            *px = base + self.rng.gen_range(0..16);
        }
        self.generated += 1;
        data
    }

    fn ensure_alive(&self) -> AppResult<()> {
        if self.shut_down {
            Err(DaqError::Device("camera is shut down".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CameraDevice for MockCamera {
    fn is_device_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    async fn set_property(&mut self, name: &str, value: &PropertyValue) -> AppResult<()> {
        let _guard = CallGuard::enter(&self.busy, &self.violations);
        self.ensure_alive()?;
        if !self.properties.contains_key(name) {
            return Err(DaqError::Configuration(format!(
                "unknown camera property '{}'",
                name
            )));
        }

        match name {
            "roi_width" => {
                let width = value
                    .as_i64()
                    .filter(|v| *v > 0)
                    .ok_or_else(|| bad_value(name, value))?;
                self.roi.0 = width as u32;
            }
            "roi_height" => {
                let height = value
                    .as_i64()
                    .filter(|v| *v > 0)
                    .ok_or_else(|| bad_value(name, value))?;
                self.roi.1 = height as u32;
            }
            "roi_x" | "roi_y" => {
                value
                    .as_i64()
                    .filter(|v| *v >= 0)
                    .ok_or_else(|| bad_value(name, value))?;
            }
            "binning" => {
                self.bin = match value.as_str() {
                    Some("1x1") => 1,
                    Some("2x2") => 2,
                    Some("4x4") => 4,
                    _ => return Err(bad_value(name, value)),
                };
            }
            "exposure_time" => {
                value
                    .as_f64()
                    .filter(|v| *v > 0.0)
                    .ok_or_else(|| bad_value(name, value))?;
            }
            _ => {}
        }

        self.properties.insert(name.to_string(), value.clone());
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), value.clone()));
        Ok(())
    }

    async fn get_property(&self, name: &str) -> AppResult<PropertyValue> {
        let _guard = CallGuard::enter(&self.busy, &self.violations);
        self.ensure_alive()?;
        self.properties
            .get(name)
            .cloned()
            .ok_or_else(|| DaqError::Configuration(format!("unknown camera property '{}'", name)))
    }

    async fn start_acquisition(&mut self) -> AppResult<()> {
        let _guard = CallGuard::enter(&self.busy, &self.violations);
        self.ensure_alive()?;
        if self.fail_start.swap(false, Ordering::SeqCst) {
            return Err(DaqError::Device("injected start failure".to_string()));
        }
        self.acquiring = true;
        self.generated = 0;
        Ok(())
    }

    async fn stop_acquisition(&mut self) -> AppResult<()> {
        let _guard = CallGuard::enter(&self.busy, &self.violations);
        self.ensure_alive()?;
        self.acquiring = false;
        Ok(())
    }

    async fn poll_frames(&mut self) -> AppResult<FramePoll> {
        let _guard = CallGuard::enter(&self.busy, &self.violations);
        self.ensure_alive()?;
        self.polls.fetch_add(1, Ordering::SeqCst);

        if self.poll_delay > Duration::ZERO {
            tokio::time::sleep(self.poll_delay).await;
        }

        let pending = self.fail_polls.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_polls.store(pending - 1, Ordering::SeqCst);
            return Err(DaqError::Device("injected poll failure".to_string()));
        }

        if !self.acquiring {
            return Ok(FramePoll::default());
        }

        let (width, height) = self.frame_dimensions();
        let buffers = (0..self.frames_per_poll)
            .map(|_| self.synthesize_frame(width, height))
            .collect();
        Ok(FramePoll {
            buffers,
            width,
            height,
        })
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        let _guard = CallGuard::enter(&self.busy, &self.violations);
        self.acquiring = false;
        self.shut_down = true;
        Ok(())
    }
}

fn bad_value(name: &str, value: &PropertyValue) -> DaqError {
    DaqError::Configuration(format!("invalid value '{}' for property '{}'", value, name))
}

// =============================================================================
// Mock focus-lock devices
// =============================================================================

/// A QPD that reports a settable sample.
pub struct MockQpd {
    sample: Arc<Mutex<QpdSample>>,
    fail_reads: Arc<AtomicU32>,
    shut_down: bool,
}

/// Handle for steering a [`MockQpd`] from a test.
#[derive(Clone)]
pub struct MockQpdProbe {
    sample: Arc<Mutex<QpdSample>>,
    fail_reads: Arc<AtomicU32>,
}

impl MockQpdProbe {
    /// Sets the spot displacement the QPD will report.
    pub fn set_offset(&self, offset: f64) {
        self.sample
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .offset = offset;
    }

    /// Sets the sum signal the QPD will report.
    pub fn set_sum(&self, sum: f64) {
        self.sample
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sum = sum;
    }

    /// Makes the next `count` reads fail with a device error.
    pub fn fail_next_reads(&self, count: u32) {
        self.fail_reads.store(count, Ordering::SeqCst);
    }
}

impl MockQpd {
    /// Creates a QPD reporting the given sample until changed via the probe.
    pub fn new(offset: f64, sum: f64) -> Self {
        Self {
            sample: Arc::new(Mutex::new(QpdSample { sum, offset })),
            fail_reads: Arc::new(AtomicU32::new(0)),
            shut_down: false,
        }
    }

    /// Returns a steering handle valid after boxing.
    pub fn probe(&self) -> MockQpdProbe {
        MockQpdProbe {
            sample: Arc::clone(&self.sample),
            fail_reads: Arc::clone(&self.fail_reads),
        }
    }
}

#[async_trait]
impl QpdSensor for MockQpd {
    async fn read_sample(&mut self) -> AppResult<QpdSample> {
        if self.shut_down {
            return Err(DaqError::Device("qpd is shut down".to_string()));
        }
        let pending = self.fail_reads.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_reads.store(pending - 1, Ordering::SeqCst);
            return Err(DaqError::Device("injected qpd failure".to_string()));
        }
        Ok(*self.sample.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        self.shut_down = true;
        Ok(())
    }
}

/// An objective Z positioner that records every commanded move.
pub struct MockFocusStage {
    position: Arc<Mutex<f64>>,
    moves: Arc<Mutex<Vec<f64>>>,
    shut_down: bool,
}

/// Inspection handle for a [`MockFocusStage`].
#[derive(Clone)]
pub struct MockFocusStageProbe {
    position: Arc<Mutex<f64>>,
    moves: Arc<Mutex<Vec<f64>>>,
}

impl MockFocusStageProbe {
    /// Every commanded target position, in order.
    pub fn moves(&self) -> Vec<f64> {
        self.moves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current stage position.
    pub fn position(&self) -> f64 {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MockFocusStage {
    /// Creates a stage parked at `position_um`.
    pub fn new(position_um: f64) -> Self {
        Self {
            position: Arc::new(Mutex::new(position_um)),
            moves: Arc::new(Mutex::new(Vec::new())),
            shut_down: false,
        }
    }

    /// Returns an inspection handle valid after boxing.
    pub fn probe(&self) -> MockFocusStageProbe {
        MockFocusStageProbe {
            position: Arc::clone(&self.position),
            moves: Arc::clone(&self.moves),
        }
    }
}

#[async_trait]
impl FocusStage for MockFocusStage {
    async fn move_to(&mut self, position_um: f64) -> AppResult<()> {
        if self.shut_down {
            return Err(DaqError::Device("stage is shut down".to_string()));
        }
        *self.position.lock().unwrap_or_else(PoisonError::into_inner) = position_um;
        self.moves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(position_um);
        Ok(())
    }

    async fn position(&self) -> AppResult<f64> {
        Ok(*self.position.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        self.shut_down = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_is_empty_before_start() {
        let mut camera = MockCamera::new(64, 64);
        let poll = camera.poll_frames().await.unwrap();
        assert!(poll.buffers.is_empty());
    }

    #[tokio::test]
    async fn test_frames_follow_roi_and_binning() {
        let mut camera = MockCamera::new(256, 256);
        camera
            .set_property("roi_width", &PropertyValue::Int(128))
            .await
            .unwrap();
        camera
            .set_property("roi_height", &PropertyValue::Int(64))
            .await
            .unwrap();
        camera
            .set_property("binning", &PropertyValue::from("2x2"))
            .await
            .unwrap();
        camera.start_acquisition().await.unwrap();

        let poll = camera.poll_frames().await.unwrap();
        assert_eq!((poll.width, poll.height), (64, 32));
        assert_eq!(poll.buffers[0].len(), 64 * 32);
    }

    #[tokio::test]
    async fn test_unknown_property_rejected() {
        let mut camera = MockCamera::new(64, 64);
        let err = camera
            .set_property("no_such_property", &PropertyValue::Int(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(camera.get_property("no_such_property").await.is_err());
    }

    #[tokio::test]
    async fn test_injected_poll_failure_is_transient() {
        let mut camera = MockCamera::new(64, 64);
        let probe = camera.probe();
        camera.start_acquisition().await.unwrap();

        probe.fail_next_polls(1);
        assert!(camera.poll_frames().await.is_err());
        assert!(camera.poll_frames().await.is_ok());
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let mut camera = MockCamera::new(64, 64);
        camera.shutdown().await.unwrap();
        assert!(camera.start_acquisition().await.is_err());
    }

    #[tokio::test]
    async fn test_stage_records_moves() {
        let mut stage = MockFocusStage::new(50.0);
        let probe = stage.probe();
        stage.move_to(48.25).await.unwrap();
        assert_eq!(probe.moves(), vec![48.25]);
        assert_eq!(stage.position().await.unwrap(), 48.25);
    }
}
