//! Film storage writers.
//!
//! A film is persisted as a `.dax` file: raw 16-bit little-endian pixel data,
//! frames concatenated in sequence order with no header. A text `.inf`
//! sidecar written at finalize time records the dimensions, frame count and
//! timestamps an analysis tool needs to interpret the raw data.

use crate::core::{CameraFrame, FrameSink};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Writes a frame stream as a `.dax` film plus `.inf` metadata sidecar.
pub struct DaxWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    frames_written: u64,
    dimensions: Option<(u32, u32)>,
    channel: Option<String>,
    created: DateTime<Utc>,
}

impl DaxWriter {
    /// Creates the output file, making parent directories as needed.
    pub fn create(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&path)?;
        info!(path = %path.display(), "dax writer initialized");
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            frames_written: 0,
            dimensions: None,
            channel: None,
            created: Utc::now(),
        })
    }

    /// Number of frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn inf_path(&self) -> PathBuf {
        self.path.with_extension("inf")
    }

    fn write_inf(&self) -> AppResult<()> {
        let (width, height) = self.dimensions.unwrap_or((0, 0));
        let mut inf = File::create(self.inf_path())?;
        writeln!(inf, "information file for")?;
        writeln!(inf, "{}", self.path.display())?;
        writeln!(inf, "date = {}", self.created.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(
            inf,
            "channel = {}",
            self.channel.as_deref().unwrap_or("unknown")
        )?;
        writeln!(inf, "number of frames = {}", self.frames_written)?;
        writeln!(inf, "frame dimensions = {} x {}", width, height)?;
        writeln!(inf, "frame size = {}", width as u64 * height as u64)?;
        writeln!(inf, "data type = 16 bit integers (binary, little endian)")?;
        Ok(())
    }
}

#[async_trait]
impl FrameSink for DaxWriter {
    async fn save_frame(&mut self, frame: &CameraFrame) -> AppResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DaqError::Protocol("save_frame after finalize".to_string()))?;

        match self.dimensions {
            None => {
                self.dimensions = Some((frame.width, frame.height));
                self.channel = Some(frame.channel.clone());
            }
            Some(dims) if dims != (frame.width, frame.height) => {
                return Err(DaqError::Configuration(format!(
                    "frame dimensions changed mid-film ({}x{} -> {}x{})",
                    dims.0, dims.1, frame.width, frame.height
                )));
            }
            Some(_) => {}
        }

        let mut bytes = Vec::with_capacity(frame.payload.len() * 2);
        for px in frame.payload.iter() {
            bytes.extend_from_slice(&px.to_le_bytes());
        }
        writer.write_all(&bytes)?;
        self.frames_written += 1;
        Ok(())
    }

    async fn finalize(&mut self) -> AppResult<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(()); // already finalized
        };
        writer.flush()?;
        self.write_inf()?;
        info!(
            path = %self.path.display(),
            frames = self.frames_written,
            "film finalized"
        );
        Ok(())
    }
}
