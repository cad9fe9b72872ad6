//! Sample normalization shared by training and recognition.
//!
//! Every sample the classifier sees goes through the same steps:
//! grayscale, resize to the canonical 200×200, CLAHE, 3×3 Gaussian blur.
//! Only the interpolation filter and the CLAHE clip limit differ between
//! the offline training path and the real-time inference path.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};

/// Canonical side length of a classifier sample.
pub const SAMPLE_SIZE: u32 = 200;

const CLAHE_TILES: u32 = 8;
const TRAINING_CLIP_LIMIT: f32 = 2.0;
const INFERENCE_CLIP_LIMIT: f32 = 1.5;

/// Which path a sample is normalized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Offline training: Lanczos resampling, stronger equalization.
    Training,
    /// Real-time recognition: bilinear resampling, lighter equalization.
    Inference,
}

impl Mode {
    fn filter(self) -> FilterType {
        match self {
            Mode::Training => FilterType::Lanczos3,
            Mode::Inference => FilterType::Triangle,
        }
    }

    fn clip_limit(self) -> f32 {
        match self {
            Mode::Training => TRAINING_CLIP_LIMIT,
            Mode::Inference => INFERENCE_CLIP_LIMIT,
        }
    }
}

/// Normalize a raw image or face crop into a classifier sample.
pub fn normalize(image: &DynamicImage, mode: Mode) -> GrayImage {
    normalize_gray(&image.to_luma8(), mode)
}

/// Normalize an already single-channel image into a classifier sample.
pub fn normalize_gray(gray: &GrayImage, mode: Mode) -> GrayImage {
    let mut sample = if gray.dimensions() == (SAMPLE_SIZE, SAMPLE_SIZE) {
        gray.clone()
    } else {
        imageops::resize(gray, SAMPLE_SIZE, SAMPLE_SIZE, mode.filter())
    };
    let (w, h) = sample.dimensions();
    clahe_enhance(&mut sample, w, h, CLAHE_TILES, mode.clip_limit());
    gaussian_blur_3x3(&sample)
}

/// Apply Contrast-Limited Adaptive Histogram Equalization (CLAHE) in-place.
///
/// `clip_limit` follows the usual convention: a bin is clipped at
/// `clip_limit × tile_pixels / 256` (never below 1), and the excess is spread
/// evenly across all bins. Output pixels bilinearly interpolate between the
/// CDFs of the four nearest tiles.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 || tiles == 0 || gray.len() < w * h {
        return;
    }

    let tiles = tiles as usize;
    let tile_w = w / tiles;
    let tile_h = h / tiles;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(tiles * tiles);
    for row in 0..tiles {
        for col in 0..tiles {
            let mut hist = [0u32; 256];
            let y0 = row * tile_h;
            let x0 = col * tile_w;
            for y in y0..y0 + tile_h {
                for &p in &gray[y * w + x0..y * w + x0 + tile_w] {
                    hist[p as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist;
                if i < leftover {
                    *bin += 1;
                }
            }

            let mut cdf = [0f32; 256];
            let mut acc = 0f32;
            for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
                acc += count as f32;
                *slot = acc;
            }
            let cdf_min = cdf.iter().find(|&&v| v > 0.0).copied().unwrap_or(0.0);
            let denom = tile_pixels as f32 - cdf_min;
            if denom > 0.0 {
                for v in cdf.iter_mut() {
                    *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
                }
            }
            cdfs.push(cdf);
        }
    }

    let last = (tiles - 1) as f32;
    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, last);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(tiles - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, last);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(tiles - 1);
            let dx = fx - c0 as f32;

            let pixel = gray[y * w + x] as usize;
            let tl = cdfs[r0 * tiles + c0][pixel];
            let tr = cdfs[r0 * tiles + c1][pixel];
            let bl = cdfs[r1 * tiles + c0][pixel];
            let br = cdfs[r1 * tiles + c1][pixel];

            let top = tl * (1.0 - dx) + tr * dx;
            let bot = bl * (1.0 - dx) + br * dx;
            gray[y * w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// 3×3 Gaussian blur with the [1, 2, 1] / 4 kernel and reflect-101 borders.
pub fn gaussian_blur_3x3(src: &GrayImage) -> GrayImage {
    let (width, height) = src.dimensions();
    let w = width as usize;
    let h = height as usize;
    if w < 2 || h < 2 {
        return src.clone();
    }
    let data = src.as_raw();

    let reflect = |i: isize, n: usize| -> usize {
        if i < 0 {
            (-i) as usize
        } else if i as usize >= n {
            2 * n - 2 - i as usize
        } else {
            i as usize
        }
    };

    // Horizontal pass keeps 4× scaled sums to avoid rounding twice.
    let mut horiz = vec![0u16; w * h];
    for y in 0..h {
        let row = &data[y * w..(y + 1) * w];
        for x in 0..w {
            let l = row[reflect(x as isize - 1, w)] as u16;
            let c = row[x] as u16;
            let r = row[reflect(x as isize + 1, w)] as u16;
            horiz[y * w + x] = l + 2 * c + r;
        }
    }

    let mut out = GrayImage::new(width, height);
    let dst: &mut [u8] = &mut out;
    for y in 0..h {
        let up = reflect(y as isize - 1, h);
        let down = reflect(y as isize + 1, h);
        for x in 0..w {
            let sum = horiz[up * w + x] + 2 * horiz[y * w + x] + horiz[down * w + x];
            dst[y * w + x] = ((sum + 8) >> 4) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    fn stddev(data: &[u8]) -> f32 {
        let n = data.len() as f32;
        let mean = data.iter().map(|&b| b as f32).sum::<f32>() / n;
        let variance = data.iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n;
        variance.sqrt()
    }

    #[test]
    fn test_training_and_inference_share_resolution() {
        let inputs = [
            DynamicImage::ImageLuma8(GrayImage::from_pixel(37, 53, Luma([90]))),
            DynamicImage::ImageRgb8(RgbImage::from_pixel(640, 480, Rgb([10, 200, 30]))),
            DynamicImage::ImageLuma8(GrayImage::from_pixel(200, 200, Luma([5]))),
        ];
        for input in &inputs {
            let train = normalize(input, Mode::Training);
            let infer = normalize(input, Mode::Inference);
            assert_eq!(train.dimensions(), (SAMPLE_SIZE, SAMPLE_SIZE));
            assert_eq!(train.dimensions(), infer.dimensions());
        }
    }

    #[test]
    fn test_clahe_increases_contrast() {
        let (w, h) = (32u32, 32u32);
        let mut gray: Vec<u8> = (0..(w * h) as usize).map(|i| 100 + (i % 11) as u8).collect();

        let orig = stddev(&gray);
        clahe_enhance(&mut gray, w, h, 2, 2.0);
        let enhanced = stddev(&gray);
        assert!(enhanced > orig, "orig={orig:.2}, enhanced={enhanced:.2}");
    }

    #[test]
    fn test_clahe_ignores_degenerate_input() {
        let mut gray = vec![7u8; 4];
        clahe_enhance(&mut gray, 2, 2, 8, 2.0);
        assert_eq!(gray, vec![7u8; 4]);
    }

    #[test]
    fn test_blur_preserves_uniform_image() {
        let img = GrayImage::from_pixel(10, 10, Luma([128]));
        let blurred = gaussian_blur_3x3(&img);
        assert!(blurred.pixels().all(|p| p.0[0] == 128));
    }

    #[test]
    fn test_blur_spreads_single_pixel() {
        let mut img = GrayImage::new(5, 5);
        img.put_pixel(2, 2, Luma([160]));
        let blurred = gaussian_blur_3x3(&img);
        // centre weight 4/16, edge neighbours 2/16, corners 1/16
        assert_eq!(blurred.get_pixel(2, 2).0[0], 40);
        assert_eq!(blurred.get_pixel(1, 2).0[0], 20);
        assert_eq!(blurred.get_pixel(1, 1).0[0], 10);
        assert_eq!(blurred.get_pixel(0, 0).0[0], 0);
    }
}
