//! Summary output: scalar event log and confusion-matrix images
//!
//! Scalars are appended to `scalars.jsonl`, one JSON object per line.
//! Images go to `images/` as binary PGM files, each with a JSON sidecar that
//! holds the raw counts and class names.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::metrics::ConfusionMatrix;
use crate::error::{Error, Result};

/// One line of `scalars.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    /// Metric tag
    pub tag: String,
    /// Epoch the value belongs to
    pub step: usize,
    /// Metric value
    pub value: f64,
    /// Write time
    pub wall_time: DateTime<Utc>,
}

/// A grayscale raster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    /// Width in pixels
    pub width: usize,
    /// Height in pixels
    pub height: usize,
    /// Row-major 8-bit intensities
    pub pixels: Vec<u8>,
}

impl RenderedImage {
    /// Encode as binary PGM (`P5`)
    pub fn to_pgm(&self) -> Vec<u8> {
        let mut bytes = format!("P5\n{} {}\n255\n", self.width, self.height).into_bytes();
        bytes.extend_from_slice(&self.pixels);
        bytes
    }
}

/// Turns a confusion matrix into an image
pub trait ConfusionRenderer {
    /// Render `matrix`; `class_names` label its rows and columns
    fn render(&self, matrix: &ConfusionMatrix, class_names: &[String]) -> Result<RenderedImage>;
}

/// Heat-map renderer: one square block per cell, darker for a larger share
/// of the true class
#[derive(Debug, Clone, Copy)]
pub struct PgmHeatmap {
    /// Block edge in pixels
    pub cell_size: usize,
}

impl Default for PgmHeatmap {
    fn default() -> Self {
        Self { cell_size: 16 }
    }
}

impl ConfusionRenderer for PgmHeatmap {
    fn render(&self, matrix: &ConfusionMatrix, class_names: &[String]) -> Result<RenderedImage> {
        let k = matrix.num_classes();
        if !class_names.is_empty() && class_names.len() != k {
            return Err(Error::invalid_input(format!(
                "{} class names for a {}x{} confusion matrix",
                class_names.len(),
                k,
                k
            )));
        }
        let cell = self.cell_size.max(1);
        let side = k * cell;
        let mut pixels = vec![255u8; side * side];

        for (row, counts) in matrix.rows().iter().enumerate() {
            let row_total: u64 = counts.iter().sum();
            for (col, &count) in counts.iter().enumerate() {
                let share = if row_total == 0 {
                    0.0
                } else {
                    count as f64 / row_total as f64
                };
                let shade = (255.0 * (1.0 - share)).round() as u8;
                for y in row * cell..(row + 1) * cell {
                    let line = &mut pixels[y * side..(y + 1) * side];
                    line[col * cell..(col + 1) * cell].fill(shade);
                }
            }
        }

        Ok(RenderedImage {
            width: side,
            height: side,
            pixels,
        })
    }
}

#[derive(Serialize)]
struct ImageSidecar<'a> {
    tag: &'a str,
    step: usize,
    class_names: &'a [String],
    counts: &'a [Vec<u64>],
}

/// Writes the summaries of one run
pub struct SummaryWriter {
    dir: PathBuf,
    scalars: BufWriter<File>,
    renderer: Box<dyn ConfusionRenderer>,
}

impl SummaryWriter {
    /// Open `dir` with the default heat-map renderer
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_renderer(dir, Box::new(PgmHeatmap::default()))
    }

    /// Open `dir` with a custom renderer
    pub fn with_renderer(dir: impl AsRef<Path>, renderer: Box<dyn ConfusionRenderer>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join("images"))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("scalars.jsonl"))?;
        Ok(Self {
            dir,
            scalars: BufWriter::new(file),
            renderer,
        })
    }

    /// Summary directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one scalar
    pub fn scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let event = ScalarEvent {
            tag: tag.to_string(),
            step,
            value,
            wall_time: Utc::now(),
        };
        serde_json::to_writer(&mut self.scalars, &event)?;
        self.scalars.write_all(b"\n")?;
        Ok(())
    }

    /// Render and write a confusion matrix; returns the image path
    pub fn confusion_matrix(
        &mut self,
        tag: &str,
        matrix: &ConfusionMatrix,
        class_names: &[String],
        step: usize,
    ) -> Result<PathBuf> {
        let image = self.renderer.render(matrix, class_names)?;
        let stem = format!("{}-{}", file_stem(tag), step);
        let path = self.dir.join("images").join(format!("{}.pgm", stem));
        fs::write(&path, image.to_pgm())?;

        let sidecar = ImageSidecar {
            tag,
            step,
            class_names,
            counts: matrix.rows(),
        };
        let sidecar_path = self.dir.join("images").join(format!("{}.json", stem));
        fs::write(&sidecar_path, serde_json::to_string_pretty(&sidecar)?)?;

        debug!("Wrote {} for step {}", tag, step);
        Ok(path)
    }

    /// Flush buffered scalars to disk
    pub fn flush(&mut self) -> Result<()> {
        self.scalars.flush()?;
        Ok(())
    }

    /// Read every scalar written to `dir`
    pub fn read_scalars(dir: impl AsRef<Path>) -> Result<Vec<ScalarEvent>> {
        let text = fs::read_to_string(dir.as_ref().join("scalars.jsonl"))?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    }
}

fn file_stem(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}
