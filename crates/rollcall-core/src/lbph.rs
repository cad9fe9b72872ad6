//! Local Binary Patterns Histograms (LBPH) face classifier.
//!
//! Each sample is encoded as a grid of 256-bin LBP histograms (radius 1,
//! 8 neighbours, 8×8 cells). Prediction is nearest-neighbour over every
//! training sample using the alternative chi-square distance on per-cell
//! normalized histograms, so 0 means identical and disjoint histograms
//! score 4 per cell.

use crate::classifier::{ClassifierError, Label, Prediction, TrainableClassifier};
use image::GrayImage;
use serde::{Deserialize, Serialize};

const LBP_BINS: usize = 256;
const DEFAULT_GRID: u32 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    grid_x: u32,
    grid_y: u32,
    /// Dimensions every sample must have.
    sample_width: u32,
    sample_height: u32,
    /// Pixels per grid cell; raw counts are normalized by this at comparison time.
    cell_pixels: u32,
    /// One flattened `grid_x * grid_y * 256` count histogram per training sample.
    histograms: Vec<Vec<u16>>,
    labels: Vec<Label>,
}

impl LbphModel {
    fn check_shape(&self, sample: &GrayImage) -> Result<(), ClassifierError> {
        let actual = sample.dimensions();
        let expected = (self.sample_width, self.sample_height);
        if actual != expected {
            return Err(ClassifierError::ShapeMismatch { expected, actual });
        }
        Ok(())
    }
}

impl TrainableClassifier for LbphModel {
    fn fit(samples: &[(GrayImage, Label)]) -> Result<Self, ClassifierError> {
        let (first, _) = samples.first().ok_or(ClassifierError::EmptyTrainingSet)?;
        let (sample_width, sample_height) = first.dimensions();
        if sample_width < 3 || sample_height < 3 {
            return Err(ClassifierError::SampleTooSmall {
                width: sample_width,
                height: sample_height,
            });
        }
        let grid = Grid::new(sample_width, sample_height, DEFAULT_GRID, DEFAULT_GRID)?;

        let mut histograms = Vec::with_capacity(samples.len());
        let mut labels = Vec::with_capacity(samples.len());
        for (sample, label) in samples {
            let actual = sample.dimensions();
            if actual != (sample_width, sample_height) {
                return Err(ClassifierError::ShapeMismatch {
                    expected: (sample_width, sample_height),
                    actual,
                });
            }
            histograms.push(spatial_histogram(&lbp_codes(sample), &grid));
            labels.push(*label);
        }

        Ok(Self {
            grid_x: grid.cols,
            grid_y: grid.rows,
            sample_width,
            sample_height,
            cell_pixels: grid.cell_w * grid.cell_h,
            histograms,
            labels,
        })
    }

    fn predict(&self, sample: &GrayImage) -> Result<Prediction, ClassifierError> {
        self.check_shape(sample)?;
        let grid = Grid::new(self.sample_width, self.sample_height, self.grid_x, self.grid_y)?;
        let query = spatial_histogram(&lbp_codes(sample), &grid);

        let mut best: Option<Prediction> = None;
        for (hist, &label) in self.histograms.iter().zip(&self.labels) {
            let distance = chi_square_alt(&query, hist) / self.cell_pixels as f64;
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Prediction { label, distance });
            }
        }
        best.ok_or(ClassifierError::Untrained)
    }
}

/// Cell layout over the LBP code image (two pixels smaller than the sample).
struct Grid {
    cols: u32,
    rows: u32,
    cell_w: u32,
    cell_h: u32,
    code_width: u32,
}

impl Grid {
    fn new(width: u32, height: u32, cols: u32, rows: u32) -> Result<Self, ClassifierError> {
        let code_width = width.saturating_sub(2);
        let code_height = height.saturating_sub(2);
        let cell_w = code_width / cols.max(1);
        let cell_h = code_height / rows.max(1);
        if cell_w == 0 || cell_h == 0 {
            return Err(ClassifierError::SampleTooSmall { width, height });
        }
        Ok(Self {
            cols,
            rows,
            cell_w,
            cell_h,
            code_width,
        })
    }
}

/// LBP code of every interior pixel, row-major, `(w - 2) × (h - 2)`.
fn lbp_codes(sample: &GrayImage) -> Vec<u8> {
    let (width, height) = sample.dimensions();
    let w = width as usize;
    let h = height as usize;
    let px = sample.as_raw();

    // Clockwise from top-left.
    const NEIGHBOURS: [(isize, isize); 8] = [
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];

    let mut codes = Vec::with_capacity((w - 2) * (h - 2));
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = px[y * w + x];
            let mut code = 0u8;
            for (bit, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
                let nx = (x as isize + dx) as usize;
                let ny = (y as isize + dy) as usize;
                if px[ny * w + nx] >= center {
                    code |= 1 << (7 - bit);
                }
            }
            codes.push(code);
        }
    }
    codes
}

fn spatial_histogram(codes: &[u8], grid: &Grid) -> Vec<u16> {
    let cw = grid.code_width as usize;
    let cell_w = grid.cell_w as usize;
    let cell_h = grid.cell_h as usize;
    let mut hist = vec![0u16; (grid.cols * grid.rows) as usize * LBP_BINS];

    for row in 0..grid.rows as usize {
        for col in 0..grid.cols as usize {
            let base = (row * grid.cols as usize + col) * LBP_BINS;
            for y in row * cell_h..(row + 1) * cell_h {
                let start = y * cw + col * cell_w;
                for &code in &codes[start..start + cell_w] {
                    hist[base + code as usize] += 1;
                }
            }
        }
    }
    hist
}

/// Alternative chi-square over raw counts: `Σ 2(a - b)² / (a + b)`.
fn chi_square_alt(a: &[u16], b: &[u16]) -> f64 {
    a.iter()
        .zip(b)
        .filter(|&(&x, &y)| x != 0 || y != 0)
        .map(|(&x, &y)| {
            let diff = x as f64 - y as f64;
            2.0 * diff * diff / (x as f64 + y as f64)
        })
        .sum()
}
