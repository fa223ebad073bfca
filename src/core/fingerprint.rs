use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_1_SQRT_2, PI};
use std::path::Path;
use thiserror::Error;

/// Side of the low-frequency block that feeds the hash (8x8 = 64 bits).
pub const HASH_SIZE: usize = 8;
/// Side of the luminance grid the DCT runs over.
pub const DCT_SIZE: usize = 32;
/// 16 bins for each of R, G and B.
pub const HISTOGRAM_BINS: usize = 48;

const BINS_PER_CHANNEL: usize = 16;
const BIN_WIDTH: usize = 256 / BINS_PER_CHANNEL;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("File not found: {path}")]
    NotFound { path: String },

    #[error("Failed to decode {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Compact visual summary of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub perceptual_hash: u64,
    pub width: u32,
    pub height: u32,
    /// 48 normalized bins, R then G then B; each channel sums to 1/3.
    pub color_histogram: Option<Vec<f64>>,
}

/// Computes fingerprints from image files.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    compute_histogram: bool,
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self {
            compute_histogram: true,
        }
    }

    pub fn with_histogram(mut self, enabled: bool) -> Self {
        self.compute_histogram = enabled;
        self
    }

    /// Fingerprint the image at `path`.
    ///
    /// Native dimensions come from a header read so they reflect the file
    /// as stored, not the decoded buffer.
    pub fn extract(&self, path: &Path) -> Result<Fingerprint, DecodeError> {
        if !path.exists() {
            return Err(DecodeError::NotFound {
                path: path.to_string_lossy().to_string(),
            });
        }

        let (width, height) = read_dimensions(path)?;
        let img = image::open(path).map_err(|e| decode_error(path, e))?;

        let mut fingerprint = self.extract_image(&img);
        fingerprint.width = width;
        fingerprint.height = height;
        Ok(fingerprint)
    }

    /// Fingerprint an already decoded image.
    pub fn extract_image(&self, img: &DynamicImage) -> Fingerprint {
        let (width, height) = img.dimensions();
        Fingerprint {
            perceptual_hash: perceptual_hash(img),
            width,
            height,
            color_histogram: self.compute_histogram.then(|| color_histogram(img)),
        }
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Read width and height from the file header without decoding pixels.
pub fn read_dimensions(path: &Path) -> Result<(u32, u32), DecodeError> {
    image::image_dimensions(path).map_err(|e| decode_error(path, e))
}

fn decode_error(path: &Path, source: image::ImageError) -> DecodeError {
    match source {
        image::ImageError::IoError(e) => DecodeError::Io(e),
        source => DecodeError::Image {
            path: path.to_string_lossy().to_string(),
            source,
        },
    }
}

/// 64-bit DCT hash. Bit 63 holds coefficient 0 of the 8x8 low-frequency
/// block, scanned row-major over `dct[u][v]`.
pub fn perceptual_hash(img: &DynamicImage) -> u64 {
    let grid = luminance_grid(img);
    let dct = dct_2d(&grid);

    let mut low_freq = [0.0f64; HASH_SIZE * HASH_SIZE];
    for u in 0..HASH_SIZE {
        for v in 0..HASH_SIZE {
            low_freq[u * HASH_SIZE + v] = dct[u][v];
        }
    }

    let mean = low_freq.iter().sum::<f64>() / low_freq.len() as f64;

    low_freq
        .iter()
        .enumerate()
        .fold(0u64, |hash, (i, &coefficient)| {
            if coefficient > mean {
                hash | (1u64 << (63 - i))
            } else {
                hash
            }
        })
}

fn luminance_grid(img: &DynamicImage) -> [[f64; DCT_SIZE]; DCT_SIZE] {
    let small = img
        .resize_exact(DCT_SIZE as u32, DCT_SIZE as u32, FilterType::Lanczos3)
        .to_rgb8();

    let mut grid = [[0.0f64; DCT_SIZE]; DCT_SIZE];
    for (x, y, pixel) in small.enumerate_pixels() {
        grid[y as usize][x as usize] = f64::from(gray_level(pixel));
    }
    grid
}

/// Rec.601 luma (0.299 R + 0.587 G + 0.114 B), rounded half up.
pub fn gray_level(pixel: &Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    let luma = 0.299 * f64::from(r) + 0.587 * f64::from(g) + 0.114 * f64::from(b);
    (luma + 0.5).min(255.0) as u8
}

/// DCT-II over `pixels[y][x]`, returned as `dct[u][v]` where `u` is the
/// horizontal frequency. Scale is 0.25 * Cu * Cv.
fn dct_2d(pixels: &[[f64; DCT_SIZE]; DCT_SIZE]) -> [[f64; DCT_SIZE]; DCT_SIZE] {
    let n = DCT_SIZE as f64;
    let mut cosines = [[0.0f64; DCT_SIZE]; DCT_SIZE];
    for (k, row) in cosines.iter_mut().enumerate() {
        for (x, value) in row.iter_mut().enumerate() {
            *value = ((2.0 * x as f64 + 1.0) * k as f64 * PI / (2.0 * n)).cos();
        }
    }

    // Separable pass along x first: rows[y][u] = sum_x pixels[y][x] * cos(x, u)
    let mut rows = [[0.0f64; DCT_SIZE]; DCT_SIZE];
    for y in 0..DCT_SIZE {
        for u in 0..DCT_SIZE {
            rows[y][u] = (0..DCT_SIZE).map(|x| pixels[y][x] * cosines[u][x]).sum();
        }
    }

    let scale = |k: usize| if k == 0 { FRAC_1_SQRT_2 } else { 1.0 };

    let mut dct = [[0.0f64; DCT_SIZE]; DCT_SIZE];
    for u in 0..DCT_SIZE {
        for v in 0..DCT_SIZE {
            let sum: f64 = (0..DCT_SIZE).map(|y| rows[y][u] * cosines[v][y]).sum();
            dct[u][v] = 0.25 * scale(u) * scale(v) * sum;
        }
    }
    dct
}

/// 48-bin RGB histogram over every pixel at native resolution.
pub fn color_histogram(img: &DynamicImage) -> Vec<f64> {
    let rgb = img.to_rgb8();
    let mut counts = [0u64; HISTOGRAM_BINS];

    for pixel in rgb.pixels() {
        for channel in 0..3 {
            let bin = pixel[channel] as usize / BIN_WIDTH;
            counts[channel * BINS_PER_CHANNEL + bin] += 1;
        }
    }

    let total_pixels = u64::from(rgb.width()) * u64::from(rgb.height());
    if total_pixels == 0 {
        return vec![0.0; HISTOGRAM_BINS];
    }

    let norm = (total_pixels * 3) as f64;
    counts.iter().map(|&count| count as f64 / norm).collect()
}
