//! Imaging device capability.
//!
//! The camera SDK is out of scope: a driver only has to produce monochrome
//! [`Frame`]s on demand. Saved frames go to a [`FrameSink`]; the default sink
//! writes one binary PGM file per frame.

pub mod image_stats;
pub mod schedule;

pub use image_stats::{image_stats, ImageStats};
pub use schedule::{make_log_intervals, CaptureSchedule};

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppResult, DaqError};

/// One monochrome image.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Width in pixels
    pub width: usize,
    /// Height in pixels
    pub height: usize,
    /// Row-major pixel values
    pub pixels: Vec<u16>,
    /// Largest value a pixel can take (255 for 8-bit sensors)
    pub max_value: u16,
    /// Wall-clock time the frame was grabbed
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    /// Build a frame, checking that the buffer matches the dimensions.
    pub fn new(width: usize, height: usize, pixels: Vec<u16>, max_value: u16) -> AppResult<Self> {
        if pixels.len() != width * height {
            return Err(DaqError::Instrument(format!(
                "frame buffer has {} pixels, expected {}x{}",
                pixels.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
            max_value,
            timestamp: Utc::now(),
        })
    }

    /// Pixel at row `y`, column `x`.
    pub fn at(&self, y: usize, x: usize) -> u16 {
        self.pixels[y * self.width + x]
    }
}

/// Camera that can grab a frame on request.
#[async_trait]
pub trait Camera: Send {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Grab the next frame.
    async fn grab(&mut self) -> AppResult<Frame>;
}

/// Destination of saved frames.
pub trait FrameSink: Send {
    /// Persist `frame` as capture number `index` (starting at 0).
    fn save(&mut self, index: u64, frame: &Frame) -> AppResult<()>;
}

/// Writes `img_000000.pgm`, `img_000001.pgm`, ... into a directory.
pub struct PgmDirectorySink {
    directory: PathBuf,
}

impl PgmDirectorySink {
    /// Create the directory if needed.
    pub fn new(directory: impl AsRef<Path>) -> AppResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    /// Path of capture number `index`.
    pub fn path_for(&self, index: u64) -> PathBuf {
        self.directory.join(format!("img_{:06}.pgm", index))
    }
}

impl FrameSink for PgmDirectorySink {
    fn save(&mut self, index: u64, frame: &Frame) -> AppResult<()> {
        let mut out = BufWriter::new(File::create(self.path_for(index))?);
        write!(
            out,
            "P5\n{} {}\n{}\n",
            frame.width, frame.height, frame.max_value
        )?;
        if frame.max_value < 256 {
            let bytes: Vec<u8> = frame.pixels.iter().map(|&p| p.min(255) as u8).collect();
            out.write_all(&bytes)?;
        } else {
            for &p in &frame.pixels {
                out.write_all(&p.to_be_bytes())?;
            }
        }
        out.flush()?;
        Ok(())
    }
}
