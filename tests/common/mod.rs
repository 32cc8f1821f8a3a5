//! Shared helpers for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use scope_daq::acquisition::AcquisitionEvent;
use scope_daq::config::CameraSettings;
use scope_daq::core::{CameraFrame, FrameSink};
use scope_daq::error::{AppResult, DaqError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

/// Fast loop settings so the tests finish quickly.
pub fn test_settings() -> CameraSettings {
    CameraSettings {
        poll_interval: Duration::from_millis(1),
        fault_threshold: 3,
        ..CameraSettings::default()
    }
}

/// A film persister that records the sequence numbers it receives.
pub struct RecordingSink {
    numbers: Arc<Mutex<Vec<u64>>>,
    finalized: Arc<AtomicBool>,
    fail_on: Option<u64>,
}

/// Inspection handle for a [`RecordingSink`], valid after boxing.
#[derive(Clone)]
pub struct SinkProbe {
    numbers: Arc<Mutex<Vec<u64>>>,
    finalized: Arc<AtomicBool>,
}

impl SinkProbe {
    pub fn numbers(&self) -> Vec<u64> {
        self.numbers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn saved(&self) -> usize {
        self.numbers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }
}

impl RecordingSink {
    pub fn new() -> (Self, SinkProbe) {
        Self::with_failure(None)
    }

    /// A sink that fails with an I/O error on the given sequence number.
    pub fn failing_on(number: u64) -> (Self, SinkProbe) {
        Self::with_failure(Some(number))
    }

    fn with_failure(fail_on: Option<u64>) -> (Self, SinkProbe) {
        let numbers = Arc::new(Mutex::new(Vec::new()));
        let finalized = Arc::new(AtomicBool::new(false));
        let probe = SinkProbe {
            numbers: Arc::clone(&numbers),
            finalized: Arc::clone(&finalized),
        };
        (
            Self {
                numbers,
                finalized,
                fail_on,
            },
            probe,
        )
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn save_frame(&mut self, frame: &CameraFrame) -> AppResult<()> {
        if self.fail_on == Some(frame.number) {
            return Err(DaqError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected sink failure",
            )));
        }
        self.numbers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.number);
        Ok(())
    }

    async fn finalize(&mut self) -> AppResult<()> {
        self.finalized.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Receives the next event, panicking after two seconds.
pub async fn next_event(rx: &mut broadcast::Receiver<AcquisitionEvent>) -> AcquisitionEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for acquisition event")
        .expect("event channel closed")
}

/// Polls `cond` once per millisecond until it holds, panicking after two
/// seconds.
pub async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(cond(), "condition not reached in time: {}", what);
}
