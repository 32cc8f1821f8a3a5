//! Core traits and data types for the acquisition system.
//!
//! This module defines the foundational abstractions shared by the camera
//! acquisition loop and the focus-lock loop: the frame value object, the
//! session model, the loop state machine, and the capability traits that
//! decouple the controllers from any vendor driver.
//!
//! # Architecture Overview
//!
//! - [`CameraDevice`]: the contract a camera driver must satisfy (property
//!   access, start/stop, non-blocking frame polling, shutdown)
//! - [`FrameSink`]: the film persister invoked once per frame, in sequence
//!   order, while filming
//! - [`QpdSensor`] / [`FocusStage`]: the focus-lock feedback capabilities
//! - [`CameraFrame`]: immutable frame plus sequence metadata
//! - [`AcquisitionState`]: the `Idle -> Active -> Stopping -> Idle` machine
//!   both control loops run behind their shared lock
//!
//! # Data Flow
//!
//! ```text
//! CameraDevice --[raw buffers]--> AcquisitionController --> FrameSink (filming)
//!                                        |
//!                                        +--> broadcast::channel --> GUI/consumers
//! ```
//!
//! # Thread Safety
//!
//! Capability traits require `Send + Sync` so implementations can live behind
//! the controller's lock inside a Tokio task. Device methods take `&mut self`:
//! the owning mutex is the only path to the hardware, so no two device calls
//! can ever be in flight concurrently.

use crate::error::AppResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

// =============================================================================
// Frames and sessions
// =============================================================================

/// A single acquired camera frame.
///
/// Immutable once constructed. The pixel payload is reference counted so the
/// controller, the persister and any number of notifier subscribers can share
/// it without copies, and nobody can mutate it after dispatch.
#[derive(Clone, Debug)]
pub struct CameraFrame {
    /// Pixel data, row-major, native 16-bit camera counts.
    pub payload: Arc<[u16]>,
    /// Sequence number, starting at 0 for every session.
    pub number: u64,
    /// Frame width in pixels (after binning).
    pub width: u32,
    /// Frame height in pixels (after binning).
    pub height: u32,
    /// Source channel identifier (e.g. "camera1").
    pub channel: String,
    /// UTC timestamp assigned when the frame object was created.
    pub timestamp: DateTime<Utc>,
}

impl CameraFrame {
    /// Creates a frame from a raw device buffer.
    pub fn new(payload: Vec<u16>, number: u64, width: u32, height: u32, channel: &str) -> Self {
        Self {
            payload: payload.into(),
            number,
            width,
            height,
            channel: channel.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Returns the number of pixels in the payload.
    pub fn pixel_count(&self) -> usize {
        self.payload.len()
    }

    /// Returns the payload size in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.payload.len() * 2
    }
}

/// Opaque token identifying one `start`/`stop` acquisition session.
///
/// Lets downstream consumers disambiguate frames across restarts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(Uuid);

impl SessionKey {
    /// Creates a fresh session key.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Filming policy for an acquisition session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilmSettings {
    /// When true, frames are persisted in addition to being notified.
    pub filming: bool,
    /// When true, the session halts itself once `frame_limit` is reached.
    pub stop_at_limit: bool,
    /// Fixed-length acquisition limit, in frames.
    pub frame_limit: Option<u64>,
}

impl FilmSettings {
    /// Preview mode: frames are notified only, never persisted.
    pub fn preview() -> Self {
        Self {
            filming: false,
            stop_at_limit: false,
            frame_limit: None,
        }
    }

    /// Fixed-length film: persist and stop after exactly `frames` frames.
    pub fn fixed_length(frames: u64) -> Self {
        Self {
            filming: true,
            stop_at_limit: true,
            frame_limit: Some(frames),
        }
    }

    /// Open-ended film: persist until explicitly stopped.
    pub fn run_till_abort() -> Self {
        Self {
            filming: true,
            stop_at_limit: false,
            frame_limit: None,
        }
    }
}

/// One live acquisition session, installed by `start` and replaced atomically
/// by the next `start`.
#[derive(Clone, Debug)]
pub struct AcquisitionSession {
    /// Caller-provided token for this session.
    pub key: SessionKey,
    /// Filming policy captured at `start` time.
    pub film: FilmSettings,
}

/// State machine shared between a control loop and its callers.
///
/// `Idle` is both the initial and the terminal-per-cycle state. `Stopping`
/// means a stop was requested and the loop has not yet acknowledged it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionState {
    /// Not acquiring; the loop idles at its polling cadence.
    Idle,
    /// Acquiring; each tick polls the device for new data.
    Active,
    /// Stop requested; the loop transitions to `Idle` on its next tick.
    Stopping,
}

// =============================================================================
// Device properties
// =============================================================================

/// Strongly-typed value for a device property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Boolean flag property.
    Bool(bool),
    /// Integer property (positions, sizes, counts).
    Int(i64),
    /// Floating point property (exposure, frame rate).
    Float(f64),
    /// Enumerated or free-form string property.
    String(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Float(fl) => write!(f, "{}", fl),
            PropertyValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl PropertyValue {
    /// Extract value as f64, converting from integer if needed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(f) => Some(*f),
            PropertyValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Extract value as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract value as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Extract value as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        PropertyValue::Int(value as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

// =============================================================================
// Camera capability
// =============================================================================

/// Result of one frame poll: zero or more raw buffers plus their dimensions.
///
/// An empty buffer list is a valid "no new data" result.
#[derive(Debug, Default)]
pub struct FramePoll {
    /// Newly available frame buffers, oldest first.
    pub buffers: Vec<Vec<u16>>,
    /// Width of every buffer in this poll, in pixels.
    pub width: u32,
    /// Height of every buffer in this poll, in pixels.
    pub height: u32,
}

/// Contract a camera driver must satisfy.
///
/// Implementations are assumed non-reentrant: the controller serializes all
/// calls behind a single lock, and `&mut self` receivers make concurrent
/// access unrepresentable in safe code.
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Returns true if `name` is a property this camera recognizes.
    fn is_device_property(&self, name: &str) -> bool;

    /// Sets a device property. Fails with `DaqError::Configuration` on an
    /// invalid name or value.
    async fn set_property(&mut self, name: &str, value: &PropertyValue) -> AppResult<()>;

    /// Reads a device property. Fails with `DaqError::Configuration` if the
    /// property is unknown.
    async fn get_property(&self, name: &str) -> AppResult<PropertyValue>;

    /// Starts continuous acquisition. Fails with `DaqError::Device` on a
    /// driver failure.
    async fn start_acquisition(&mut self) -> AppResult<()>;

    /// Stops continuous acquisition.
    async fn stop_acquisition(&mut self) -> AppResult<()>;

    /// Polls for newly available frames. Non-blocking or short-blocking;
    /// an empty result is normal when no frame has completed readout.
    async fn poll_frames(&mut self) -> AppResult<FramePoll>;

    /// Releases the device. No further calls are valid afterward.
    async fn shutdown(&mut self) -> AppResult<()>;
}

// =============================================================================
// Downstream sinks
// =============================================================================

/// Film persister, invoked once per frame in strict sequence order.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Persists one frame. Sequence numbers arrive monotonically with no
    /// gaps under normal operation.
    async fn save_frame(&mut self, frame: &CameraFrame) -> AppResult<()>;

    /// Flushes buffered data and writes any trailing metadata.
    async fn finalize(&mut self) -> AppResult<()>;
}

// =============================================================================
// Focus-lock capabilities
// =============================================================================

/// One quadrant photodiode reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QpdSample {
    /// Total intensity on the diode. Corrections are gated on this: below
    /// the configured threshold there is no usable reflection to lock on.
    pub sum: f64,
    /// Measured spot displacement from center, in sensor units.
    pub offset: f64,
}

/// Quadrant photodiode capability consumed by the focus-lock loop.
#[async_trait]
pub trait QpdSensor: Send + Sync {
    /// Reads the current QPD sample. Short-blocking.
    async fn read_sample(&mut self) -> AppResult<QpdSample>;

    /// Releases the sensor.
    async fn shutdown(&mut self) -> AppResult<()>;
}

/// Objective Z positioner capability consumed by the focus-lock loop.
#[async_trait]
pub trait FocusStage: Send + Sync {
    /// Moves to an absolute position in micrometers.
    async fn move_to(&mut self, position_um: f64) -> AppResult<()>;

    /// Returns the current position in micrometers.
    async fn position(&self) -> AppResult<f64>;

    /// Releases the stage.
    async fn shutdown(&mut self) -> AppResult<()>;
}
