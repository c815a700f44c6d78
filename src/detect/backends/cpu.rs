use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, Region};
use crate::frame::Frame;

const DEFAULT_CELL_SIZE: u32 = 16;
const DEFAULT_CHANGE_THRESHOLD: f32 = 24.0;

/// CPU backend: grid frame differencing.
///
/// Each frame is reduced to mean luma per cell. Cells whose luma moved by more
/// than the threshold since the previous frame are "active"; one region bounding
/// all active cells is reported.
pub struct CpuBackend {
    cell_size: u32,
    threshold: f32,
    previous: Option<LumaGrid>,
}

struct LumaGrid {
    width: u32,
    height: u32,
    cols: u32,
    cells: Vec<f32>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_CELL_SIZE, DEFAULT_CHANGE_THRESHOLD)
    }

    pub fn with_params(cell_size: u32, threshold: f32) -> Self {
        Self {
            cell_size: cell_size.max(1),
            threshold,
            previous: None,
        }
    }

    fn compare(&self, prev: &LumaGrid, current: &LumaGrid) -> Option<Detection> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        let mut delta_sum = 0.0f32;
        let mut active = 0usize;

        for (idx, (a, b)) in prev.cells.iter().zip(current.cells.iter()).enumerate() {
            let delta = (a - b).abs();
            if delta <= self.threshold {
                continue;
            }
            active += 1;
            delta_sum += delta;
            let col = idx as u32 % current.cols;
            let row = idx as u32 / current.cols;
            bounds = Some(match bounds {
                None => (col, row, col, row),
                Some((c0, r0, c1, r1)) => (c0.min(col), r0.min(row), c1.max(col), r1.max(row)),
            });
        }

        let (c0, r0, c1, r1) = bounds?;
        let x0 = c0 * self.cell_size;
        let y0 = r0 * self.cell_size;
        let x1 = ((c1 + 1) * self.cell_size).min(current.width);
        let y1 = ((r1 + 1) * self.cell_size).min(current.height);
        let confidence = (delta_sum / active as f32 / 255.0).clamp(0.0, 1.0);

        Some(Detection {
            region: Region::new(x0 as i32, y0 as i32, (x1 - x0) as i32, (y1 - y0) as i32),
            confidence,
        })
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let current = luma_grid(frame, self.cell_size);

        let detection = match &self.previous {
            Some(prev) if prev.width == current.width && prev.height == current.height => {
                self.compare(prev, &current)
            }
            _ => None,
        };

        self.previous = Some(current);
        Ok(detection.into_iter().collect())
    }

    fn close(&mut self) -> Result<()> {
        self.previous = None;
        Ok(())
    }
}

fn luma_grid(frame: &Frame, cell_size: u32) -> LumaGrid {
    let width = frame.width();
    let height = frame.height();
    let cols = width.div_ceil(cell_size);
    let rows = height.div_ceil(cell_size);
    let cell_count = (cols * rows) as usize;

    let mut sums = vec![0.0f32; cell_count];
    let mut counts = vec![0u32; cell_count];
    for (i, px) in frame.pixels().chunks_exact(3).enumerate() {
        let x = i as u32 % width;
        let y = i as u32 / width;
        let idx = ((y / cell_size) * cols + x / cell_size) as usize;
        sums[idx] += 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
        counts[idx] += 1;
    }

    let cells = sums
        .iter()
        .zip(counts.iter())
        .map(|(sum, &count)| if count == 0 { 0.0 } else { sum / count as f32 })
        .collect();

    LumaGrid {
        width,
        height,
        cols,
        cells,
    }
}
