//! Camera geometry and device property batch application.
//!
//! A configuration is applied to a [`CameraDevice`] as one batch: the
//! structured readout geometry first (ROI position/size, then the binning
//! mode), then the generic property bag. On any failure the whole batch is
//! considered failed and the controller marks itself unconfigured.
//!
//! The structured fields write through reserved property names; a generic-bag
//! entry using one of those names is rejected rather than silently skipped,
//! so a stale bag value can never overwrite the structured result.

use crate::core::{CameraDevice, PropertyValue};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Horizontal ROI start, in unbinned sensor pixels.
pub const PROP_ROI_X: &str = "roi_x";
/// Horizontal ROI size, in unbinned sensor pixels.
pub const PROP_ROI_WIDTH: &str = "roi_width";
/// Vertical ROI start, in unbinned sensor pixels.
pub const PROP_ROI_Y: &str = "roi_y";
/// Vertical ROI size, in unbinned sensor pixels.
pub const PROP_ROI_HEIGHT: &str = "roi_height";
/// Binning mode identifier ("1x1", "2x2" or "4x4").
pub const PROP_BINNING: &str = "binning";

/// Property names owned by the structured geometry pass. Generic-bag entries
/// with these names fail the batch.
pub const RESERVED_PROPERTIES: [&str; 5] = [
    PROP_ROI_X,
    PROP_ROI_WIDTH,
    PROP_ROI_Y,
    PROP_ROI_HEIGHT,
    PROP_BINNING,
];

/// Readout geometry for one camera configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraGeometry {
    /// ROI horizontal start position.
    pub x_start: u32,
    /// ROI width in pixels.
    pub x_pixels: u32,
    /// ROI vertical start position.
    pub y_start: u32,
    /// ROI height in pixels.
    pub y_pixels: u32,
    /// Horizontal binning factor.
    pub x_bin: u32,
    /// Vertical binning factor. Must equal `x_bin`.
    pub y_bin: u32,
}

impl CameraGeometry {
    /// Full-sensor readout at the given dimensions, no binning.
    pub fn full_sensor(width: u32, height: u32) -> Self {
        Self {
            x_start: 0,
            x_pixels: width,
            y_start: 0,
            y_pixels: height,
            x_bin: 1,
            y_bin: 1,
        }
    }

    /// Maps the binning factors to the device's mode identifier.
    ///
    /// Unequal factors and factors outside {1, 2, 4} are configuration
    /// errors.
    pub fn binning_mode(&self) -> AppResult<&'static str> {
        if self.x_bin != self.y_bin {
            return Err(DaqError::Configuration(format!(
                "unequal binning is not supported ({}x{})",
                self.x_bin, self.y_bin
            )));
        }
        match self.x_bin {
            1 => Ok("1x1"),
            2 => Ok("2x2"),
            4 => Ok("4x4"),
            other => Err(DaqError::Configuration(format!(
                "unsupported bin size {}",
                other
            ))),
        }
    }

    fn validate(&self) -> AppResult<()> {
        if self.x_pixels == 0 || self.y_pixels == 0 {
            return Err(DaqError::Configuration(format!(
                "zero-sized region of interest ({}x{})",
                self.x_pixels, self.y_pixels
            )));
        }
        self.binning_mode().map(|_| ())
    }
}

/// Insertion-ordered device property bag.
///
/// Order matters: entries are applied in the order they were inserted, and
/// within the bag the last write to a given device setting wins.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyMap {
    entries: Vec<(String, PropertyValue)>,
}

impl PropertyMap {
    /// Creates an empty property bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a property, preserving insertion order.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries in the bag.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the bag has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Complete camera configuration applied by `AcquisitionController::configure`.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Readout geometry (ROI + binning).
    pub geometry: CameraGeometry,
    /// Additional device properties (exposure, gain, trigger mode, ...).
    pub properties: PropertyMap,
    /// Filming policy for sessions started under this configuration.
    pub film: crate::core::FilmSettings,
}

/// Applies one configuration batch to the device.
///
/// Write order: ROI horizontal position/size, ROI vertical position/size,
/// binning mode, then the generic bag. Aborts on the first failure; the
/// caller is responsible for treating a partial application as unconfigured.
pub(crate) async fn apply_camera_properties(
    device: &mut dyn CameraDevice,
    config: &CameraConfig,
) -> AppResult<()> {
    let geometry = &config.geometry;
    geometry.validate()?;

    device
        .set_property(PROP_ROI_X, &PropertyValue::from(geometry.x_start))
        .await?;
    device
        .set_property(PROP_ROI_WIDTH, &PropertyValue::from(geometry.x_pixels))
        .await?;
    device
        .set_property(PROP_ROI_Y, &PropertyValue::from(geometry.y_start))
        .await?;
    device
        .set_property(PROP_ROI_HEIGHT, &PropertyValue::from(geometry.y_pixels))
        .await?;

    let mode = geometry.binning_mode()?;
    device
        .set_property(PROP_BINNING, &PropertyValue::from(mode))
        .await?;

    for (name, value) in config.properties.iter() {
        if RESERVED_PROPERTIES.contains(&name) {
            return Err(DaqError::Configuration(format!(
                "property '{}' collides with a structured geometry field",
                name
            )));
        }
        if device.is_device_property(name) {
            device.set_property(name, value).await?;
        } else {
            debug!(property = name, "skipping unrecognized device property");
        }
    }

    Ok(())
}
