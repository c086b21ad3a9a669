//! Image analyzers run by the process stage.
//!
//! Two implementations of [`ImageAnalyzer`] are bundled: [`LibraryAnalyzer`]
//! builds on `image::imageops`, [`CustomAnalyzer`] does its own convolution.
//! The pipeline saves the output of both side by side.

use crate::{AnalysisKind, PipelineError};
use image::{imageops, DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};

const SOBEL_X: [f32; 9] = [-1.0, 0.0, 1.0, -2.0, 0.0, 2.0, -1.0, 0.0, 1.0];
const SOBEL_Y: [f32; 9] = [-1.0, -2.0, -1.0, 0.0, 0.0, 0.0, 1.0, 2.0, 1.0];
const GAUSSIAN_3X3: [f32; 9] = [
    1.0 / 16.0,
    2.0 / 16.0,
    1.0 / 16.0,
    2.0 / 16.0,
    4.0 / 16.0,
    2.0 / 16.0,
    1.0 / 16.0,
    2.0 / 16.0,
    1.0 / 16.0,
];
const HARRIS_K: f32 = 0.04;
const CORNER_MARK: Rgb<u8> = Rgb([255, 0, 0]);

/// Pixel-level analysis capability.
///
/// Implementations run on the analysis thread pool, never on the async runtime.
pub trait ImageAnalyzer: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn detect_edges(&self, image: &DynamicImage) -> Result<DynamicImage, PipelineError>;

    fn detect_corners(&self, image: &DynamicImage) -> Result<DynamicImage, PipelineError>;

    fn detect_circles(&self, _image: &DynamicImage) -> Result<DynamicImage, PipelineError> {
        Err(PipelineError::analysis(format!(
            "{}: circle detection is not implemented",
            self.name()
        )))
    }

    fn analyze(&self, kind: AnalysisKind, image: &DynamicImage) -> Result<DynamicImage, PipelineError> {
        match kind {
            AnalysisKind::Edges => self.detect_edges(image),
            AnalysisKind::Corners => self.detect_corners(image),
            AnalysisKind::Circles => self.detect_circles(image),
        }
    }
}

/// Row-major float plane used for intermediate results.
#[derive(Debug, Clone)]
struct Plane {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl Plane {
    fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> f32) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { width, height, data }
    }

    fn get(&self, x: u32, y: u32) -> f32 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    /// Read with mirrored borders; the edge pixel itself is not repeated.
    fn get_reflect(&self, x: i64, y: i64) -> f32 {
        let reflect = |v: i64, len: u32| -> u32 {
            let len = len as i64;
            if len == 1 {
                return 0;
            }
            let mut v = v;
            if v < 0 {
                v = -v;
            }
            if v >= len {
                v = 2 * (len - 1) - v;
            }
            v.clamp(0, len - 1) as u32
        };
        self.get(reflect(x, self.width), reflect(y, self.height))
    }

    fn zip(&self, other: &Plane, f: impl Fn(f32, f32) -> f32) -> Plane {
        Plane {
            width: self.width,
            height: self.height,
            data: self.data.iter().zip(&other.data).map(|(a, b)| f(*a, *b)).collect(),
        }
    }

    fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::MIN, f32::max)
    }

    fn to_gray(&self, f: impl Fn(f32) -> u8) -> GrayImage {
        ImageBuffer::from_fn(self.width, self.height, |x, y| Luma([f(self.get(x, y))]))
    }
}

/// Harris response `det(M) - k * trace(M)^2` from smoothed gradient products.
fn harris_response(xx: &Plane, yy: &Plane, xy: &Plane) -> Plane {
    let det = xx.zip(yy, |a, b| a * b).zip(xy, |d, c| d - c * c);
    let trace = xx.zip(yy, |a, b| a + b);
    det.zip(&trace, |d, t| d - HARRIS_K * t * t)
}

/// Paint a 3x3 square on `canvas` for every pixel set in `mask`.
fn mark_corners(canvas: &mut RgbImage, mask: &[bool]) {
    let (width, height) = canvas.dimensions();
    for y in 0..height {
        for x in 0..width {
            if !mask[y as usize * width as usize + x as usize] {
                continue;
            }
            for ny in y.saturating_sub(1)..(y + 2).min(height) {
                for nx in x.saturating_sub(1)..(x + 2).min(width) {
                    canvas.put_pixel(nx, ny, CORNER_MARK);
                }
            }
        }
    }
}

fn ensure_nonempty(image: &DynamicImage) -> Result<(), PipelineError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::analysis("image has no pixels"));
    }
    Ok(())
}

/// Analyzer built on `image::imageops` primitives.
#[derive(Debug, Clone)]
pub struct LibraryAnalyzer {
    pub blur_sigma: f32,
    pub low_threshold: u8,
    pub high_threshold: u8,
}

impl Default for LibraryAnalyzer {
    fn default() -> Self {
        Self {
            blur_sigma: 1.0,
            low_threshold: 50,
            high_threshold: 100,
        }
    }
}

impl LibraryAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signed gradient from `filter3x3`, which clamps to `u8`: filtering with
    /// the kernel and its negation yields the positive and negative parts.
    /// The kernel is scaled by 1/4 so Sobel sums stay inside 0..=255.
    fn signed_gradient(gray: &GrayImage, kernel: &[f32; 9]) -> Plane {
        let positive: Vec<f32> = kernel.iter().map(|k| k / 4.0).collect();
        let negative: Vec<f32> = kernel.iter().map(|k| -k / 4.0).collect();
        let pos = imageops::filter3x3(gray, &positive);
        let neg = imageops::filter3x3(gray, &negative);
        Plane::from_fn(gray.width(), gray.height(), |x, y| {
            4.0 * (pos.get_pixel(x, y)[0] as f32 - neg.get_pixel(x, y)[0] as f32)
        })
    }

    fn smoothed_gray(&self, image: &DynamicImage) -> GrayImage {
        imageops::blur(&image.to_luma8(), self.blur_sigma)
    }
}

impl ImageAnalyzer for LibraryAnalyzer {
    fn name(&self) -> &'static str {
        "library"
    }

    /// Gradient magnitude with hysteresis: strong pixels, plus weak pixels touching a strong one.
    fn detect_edges(&self, image: &DynamicImage) -> Result<DynamicImage, PipelineError> {
        ensure_nonempty(image)?;
        let gray = self.smoothed_gray(image);
        let gx = Self::signed_gradient(&gray, &SOBEL_X);
        let gy = Self::signed_gradient(&gray, &SOBEL_Y);
        let magnitude = gx.zip(&gy, |a, b| (a * a + b * b).sqrt());

        let low = self.low_threshold as f32;
        let high = self.high_threshold as f32;
        let (width, height) = (magnitude.width, magnitude.height);
        let edges = ImageBuffer::from_fn(width, height, |x, y| {
            let value = magnitude.get(x, y);
            let strong_neighbour = || {
                (y.saturating_sub(1)..(y + 2).min(height)).any(|ny| {
                    (x.saturating_sub(1)..(x + 2).min(width)).any(|nx| magnitude.get(nx, ny) >= high)
                })
            };
            if value >= high || (value >= low && strong_neighbour()) {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        });

        Ok(DynamicImage::ImageLuma8(edges))
    }

    /// Harris over a 3x3 box window; pixels above 1% of the peak response are marked.
    fn detect_corners(&self, image: &DynamicImage) -> Result<DynamicImage, PipelineError> {
        ensure_nonempty(image)?;
        let gray = self.smoothed_gray(image);
        let gx = Self::signed_gradient(&gray, &SOBEL_X);
        let gy = Self::signed_gradient(&gray, &SOBEL_Y);

        let window_sum = |plane: Plane| {
            Plane::from_fn(plane.width, plane.height, |x, y| {
                let mut sum = 0.0;
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        sum += plane.get_reflect(x as i64 + dx, y as i64 + dy);
                    }
                }
                sum
            })
        };
        let xx = window_sum(gx.zip(&gx, |a, b| a * b));
        let yy = window_sum(gy.zip(&gy, |a, b| a * b));
        let xy = window_sum(gx.zip(&gy, |a, b| a * b));
        let response = harris_response(&xx, &yy, &xy);

        let peak = response.max();
        let mask: Vec<bool> = if peak > 0.0 {
            response.data.iter().map(|r| *r > 0.01 * peak).collect()
        } else {
            vec![false; response.data.len()]
        };

        let mut canvas = image.to_rgb8();
        mark_corners(&mut canvas, &mask);
        Ok(DynamicImage::ImageRgb8(canvas))
    }
}

/// Analyzer with hand-written convolution, grayscale and gamma correction.
#[derive(Debug, Clone)]
pub struct CustomAnalyzer {
    /// Gamma applied to the grayscale plane before filtering; 1.0 disables it
    pub gamma: f32,
    /// Number of strongest corner responses used to pick the threshold
    pub target_corners: usize,
}

impl Default for CustomAnalyzer {
    fn default() -> Self {
        Self {
            gamma: 1.0,
            target_corners: 1000,
        }
    }
}

impl CustomAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// ITU-R BT.601 luma weights.
    fn grayscale(image: &DynamicImage) -> Plane {
        let rgb = image.to_rgb8();
        Plane::from_fn(rgb.width(), rgb.height(), |x, y| {
            let Rgb([r, g, b]) = *rgb.get_pixel(x, y);
            (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).clamp(0.0, 255.0)
        })
    }

    fn gamma_correct(plane: &Plane, gamma: f32) -> Result<Plane, PipelineError> {
        if gamma <= 0.0 {
            return Err(PipelineError::analysis("gamma must be greater than 0"));
        }
        let exponent = 1.0 / gamma;
        Ok(Plane {
            width: plane.width,
            height: plane.height,
            data: plane
                .data
                .iter()
                .map(|v| (v / 255.0).powf(exponent) * 255.0)
                .collect(),
        })
    }

    /// 3x3 convolution with reflected borders.
    fn convolve(plane: &Plane, kernel: &[f32; 9]) -> Plane {
        Plane::from_fn(plane.width, plane.height, |x, y| {
            let mut sum = 0.0;
            for ky in 0..3i64 {
                for kx in 0..3i64 {
                    let weight = kernel[(ky * 3 + kx) as usize];
                    sum += weight * plane.get_reflect(x as i64 + kx - 1, y as i64 + ky - 1);
                }
            }
            sum
        })
    }

    fn prepared_gray(&self, image: &DynamicImage) -> Result<Plane, PipelineError> {
        let gray = Self::grayscale(image);
        if (self.gamma - 1.0).abs() > f32::EPSILON {
            Self::gamma_correct(&gray, self.gamma)
        } else {
            Ok(gray)
        }
    }

    fn adaptive_threshold(&self, normalized: &Plane) -> f32 {
        let mut sorted = normalized.data.clone();
        sorted.sort_by(|a, b| b.total_cmp(a));
        let threshold = if sorted.len() > self.target_corners {
            sorted[self.target_corners]
        } else {
            sorted.last().copied().unwrap_or(0.5)
        };
        threshold.clamp(0.1, 0.9)
    }
}

impl ImageAnalyzer for CustomAnalyzer {
    fn name(&self) -> &'static str {
        "custom"
    }

    /// Sobel gradient magnitude scaled so the strongest edge is 255.
    fn detect_edges(&self, image: &DynamicImage) -> Result<DynamicImage, PipelineError> {
        ensure_nonempty(image)?;
        let gray = self.prepared_gray(image)?;
        let gx = Self::convolve(&gray, &SOBEL_X);
        let gy = Self::convolve(&gray, &SOBEL_Y);
        let magnitude = gx.zip(&gy, |a, b| (a * a + b * b).sqrt());

        let peak = magnitude.max();
        let scale = if peak > 0.0 { 255.0 / peak } else { 0.0 };
        let edges = magnitude.to_gray(|v| (v * scale).round().clamp(0.0, 255.0) as u8);
        Ok(DynamicImage::ImageLuma8(edges))
    }

    /// Harris with Gaussian smoothing, adaptive threshold and 3x3 non-maximum suppression.
    fn detect_corners(&self, image: &DynamicImage) -> Result<DynamicImage, PipelineError> {
        ensure_nonempty(image)?;
        let gray = self.prepared_gray(image)?;
        let gx = Self::convolve(&gray, &SOBEL_X);
        let gy = Self::convolve(&gray, &SOBEL_Y);

        let xx = Self::convolve(&gx.zip(&gx, |a, b| a * b), &GAUSSIAN_3X3);
        let yy = Self::convolve(&gy.zip(&gy, |a, b| a * b), &GAUSSIAN_3X3);
        let xy = Self::convolve(&gx.zip(&gy, |a, b| a * b), &GAUSSIAN_3X3);
        let response = harris_response(&xx, &yy, &xy);

        // Edge (negative) and flat (zero) responses both normalize to 0.
        let peak = response.max();
        let normalized = Plane {
            width: response.width,
            height: response.height,
            data: response
                .data
                .iter()
                .map(|r| if peak > 0.0 { r.max(0.0) / peak } else { 0.0 })
                .collect(),
        };

        let threshold = self.adaptive_threshold(&normalized);
        let (width, height) = (normalized.width, normalized.height);
        let mut mask = vec![false; normalized.data.len()];
        for y in 1..height.saturating_sub(1) {
            for x in 1..width.saturating_sub(1) {
                let value = normalized.get(x, y);
                if value <= threshold {
                    continue;
                }
                let is_peak = (y - 1..=y + 1)
                    .all(|ny| (x - 1..=x + 1).all(|nx| normalized.get(nx, ny) <= value));
                if is_peak {
                    mask[y as usize * width as usize + x as usize] = true;
                }
            }
        }

        let mut canvas = image.to_rgb8();
        mark_corners(&mut canvas, &mask);
        Ok(DynamicImage::ImageRgb8(canvas))
    }
}
