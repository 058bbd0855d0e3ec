//! Image moments and shape-invariant descriptors
//!
//! Raw, central and normalized central moments of a binary region, the seven
//! Hu invariants derived from them, and a rotation-invariant radial signature
//! of a contour outline.

use image::GrayImage;

use crate::types::{BoundingBox, Point};

/// Number of radial signature samples taken around a contour
const RADIAL_SAMPLES: usize = 32;
/// Fourier magnitudes kept from the radial signature
pub const SHAPE_DESCRIPTOR_LEN: usize = 8;

/// Spatial and central moments up to third order
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Moments {
    pub m00: f64,
    pub m10: f64,
    pub m01: f64,
    pub mu20: f64,
    pub mu11: f64,
    pub mu02: f64,
    pub mu30: f64,
    pub mu21: f64,
    pub mu12: f64,
    pub mu03: f64,
}

impl Moments {
    /// Moments of ink pixels (value > 127) inside `region`, or the whole mask
    pub fn of_mask(mask: &GrayImage, region: Option<&BoundingBox>) -> Moments {
        let (x0, y0, x1, y1) = region_bounds(mask, region);

        let mut pixels = Vec::new();
        for y in y0..y1 {
            for x in x0..x1 {
                if mask.get_pixel(x, y).0[0] > 127 {
                    pixels.push(((x - x0) as f64, (y - y0) as f64));
                }
            }
        }
        Self::of_points(&pixels)
    }

    /// Moments of a set of unit-mass points
    pub fn of_points(points: &[(f64, f64)]) -> Moments {
        let m00 = points.len() as f64;
        if m00 == 0.0 {
            return Moments::default();
        }

        let m10: f64 = points.iter().map(|p| p.0).sum();
        let m01: f64 = points.iter().map(|p| p.1).sum();
        let cx = m10 / m00;
        let cy = m01 / m00;

        let mut m = Moments {
            m00,
            m10,
            m01,
            ..Default::default()
        };
        for &(x, y) in points {
            let dx = x - cx;
            let dy = y - cy;
            m.mu20 += dx * dx;
            m.mu11 += dx * dy;
            m.mu02 += dy * dy;
            m.mu30 += dx * dx * dx;
            m.mu21 += dx * dx * dy;
            m.mu12 += dx * dy * dy;
            m.mu03 += dy * dy * dy;
        }
        m
    }

    pub fn centroid(&self) -> (f64, f64) {
        if self.m00 == 0.0 {
            (0.0, 0.0)
        } else {
            (self.m10 / self.m00, self.m01 / self.m00)
        }
    }

    /// Normalized central moment eta_pq
    fn eta(&self, mu: f64, p: u32, q: u32) -> f64 {
        if self.m00 == 0.0 {
            return 0.0;
        }
        let gamma = (p + q) as f64 / 2.0 + 1.0;
        mu / self.m00.powf(gamma)
    }

    /// The seven Hu invariants
    pub fn hu(&self) -> [f64; 7] {
        let n20 = self.eta(self.mu20, 2, 0);
        let n02 = self.eta(self.mu02, 0, 2);
        let n11 = self.eta(self.mu11, 1, 1);
        let n30 = self.eta(self.mu30, 3, 0);
        let n03 = self.eta(self.mu03, 0, 3);
        let n21 = self.eta(self.mu21, 2, 1);
        let n12 = self.eta(self.mu12, 1, 2);

        let a = n30 + n12;
        let b = n21 + n03;

        [
            n20 + n02,
            (n20 - n02).powi(2) + 4.0 * n11 * n11,
            (n30 - 3.0 * n12).powi(2) + (3.0 * n21 - n03).powi(2),
            a * a + b * b,
            (n30 - 3.0 * n12) * a * (a * a - 3.0 * b * b)
                + (3.0 * n21 - n03) * b * (3.0 * a * a - b * b),
            (n20 - n02) * (a * a - b * b) + 4.0 * n11 * a * b,
            (3.0 * n21 - n03) * a * (a * a - 3.0 * b * b)
                - (n30 - 3.0 * n12) * b * (3.0 * a * a - b * b),
        ]
    }

    /// Principal axis angle in radians, in (-pi/2, pi/2]
    pub fn orientation(&self) -> f64 {
        0.5 * (2.0 * self.mu11).atan2(self.mu20 - self.mu02)
    }

    /// (major, minor) axis lengths of the equivalent ellipse
    pub fn axes(&self) -> (f64, f64) {
        if self.m00 == 0.0 {
            return (0.0, 0.0);
        }
        let a = self.mu20 / self.m00;
        let c = self.mu02 / self.m00;
        let b = self.mu11 / self.m00;
        let common = ((a - c).powi(2) + 4.0 * b * b).sqrt();
        let l1 = ((a + c + common) / 2.0).max(0.0);
        let l2 = ((a + c - common) / 2.0).max(0.0);
        (4.0 * l1.sqrt(), 4.0 * l2.sqrt())
    }

    /// Eccentricity of the equivalent ellipse in [0, 1]
    pub fn eccentricity(&self) -> f64 {
        let (major, minor) = self.axes();
        if major <= f64::EPSILON {
            0.0
        } else {
            (1.0 - (minor * minor) / (major * major)).max(0.0).sqrt()
        }
    }
}

fn region_bounds(mask: &GrayImage, region: Option<&BoundingBox>) -> (u32, u32, u32, u32) {
    let (w, h) = mask.dimensions();
    match region {
        Some(b) => {
            let x0 = (b.x.max(0.0) as u32).min(w);
            let y0 = (b.y.max(0.0) as u32).min(h);
            let x1 = (b.right().ceil().max(0.0) as u32).min(w);
            let y1 = (b.bottom().ceil().max(0.0) as u32).min(h);
            (x0, y0, x1.max(x0), y1.max(y0))
        }
        None => (0, 0, w, h),
    }
}

/// Hu invariants of the ink inside `region`
pub fn hu_moments(mask: &GrayImage, region: Option<&BoundingBox>) -> [f64; 7] {
    Moments::of_mask(mask, region).hu()
}

/// Magnitudes below this are rasterization noise and compare as equal
const HU_FLOOR: f64 = 1e-10;

/// Signed log scale used for comparing Hu invariants
pub fn log_hu(hu: &[f64]) -> Vec<f64> {
    hu.iter()
        .map(|&h| {
            if h.abs() < HU_FLOOR {
                -HU_FLOOR.log10()
            } else {
                -h.signum() * h.abs().log10()
            }
        })
        .collect()
}

/// Similarity in [0, 1] between two Hu vectors, 1 for identical shapes.
///
/// Mean absolute difference of log-scaled invariants, mapped through 1/(1+d).
pub fn moment_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let la = log_hu(a);
    let lb = log_hu(b);
    // Higher-order invariants are noisy on rasterized strokes, weight them down
    const WEIGHTS: [f64; 7] = [2.0, 1.5, 1.0, 1.0, 0.5, 0.5, 0.5];
    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for (i, (x, y)) in la.iter().zip(lb.iter()).enumerate() {
        let w = WEIGHTS.get(i).copied().unwrap_or(0.5);
        total += w * (x - y).abs();
        weight_sum += w;
    }
    let d = total / weight_sum;
    1.0 / (1.0 + d)
}

/// Rotation-invariant radial signature of a contour.
///
/// Distances from the centroid are sampled at equal angular steps,
/// normalized by their maximum and reduced to DFT magnitudes (harmonics
/// 1..=SHAPE_DESCRIPTOR_LEN) divided by the DC term.
pub fn shape_descriptor(points: &[Point]) -> Vec<f64> {
    if points.len() < 3 {
        return vec![0.0; SHAPE_DESCRIPTOR_LEN];
    }

    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;

    let mut radial = [0.0f64; RADIAL_SAMPLES];
    for p in points {
        let angle = (p.y - cy).atan2(p.x - cx) + std::f64::consts::PI;
        let bin = ((angle / std::f64::consts::TAU) * RADIAL_SAMPLES as f64) as usize % RADIAL_SAMPLES;
        let r = ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt();
        radial[bin] = radial[bin].max(r);
    }

    // Fill empty bins from the nearest populated neighbour
    let filled = radial.to_vec();
    for i in 0..RADIAL_SAMPLES {
        if filled[i] == 0.0 {
            radial[i] = (1..RADIAL_SAMPLES / 2)
                .find_map(|k| {
                    let left = filled[(i + RADIAL_SAMPLES - k) % RADIAL_SAMPLES];
                    let right = filled[(i + k) % RADIAL_SAMPLES];
                    if left > 0.0 || right > 0.0 {
                        Some(left.max(right))
                    } else {
                        None
                    }
                })
                .unwrap_or(0.0);
        }
    }

    let max = radial.iter().cloned().fold(0.0, f64::max);
    if max <= f64::EPSILON {
        return vec![0.0; SHAPE_DESCRIPTOR_LEN];
    }
    let normalized: Vec<f64> = radial.iter().map(|r| r / max).collect();

    let dc: f64 = normalized.iter().sum::<f64>().max(f64::EPSILON);
    (1..=SHAPE_DESCRIPTOR_LEN)
        .map(|k| {
            let (mut re, mut im) = (0.0, 0.0);
            for (t, v) in normalized.iter().enumerate() {
                let phase = std::f64::consts::TAU * k as f64 * t as f64 / RADIAL_SAMPLES as f64;
                re += v * phase.cos();
                im -= v * phase.sin();
            }
            (re * re + im * im).sqrt() / dc
        })
        .collect()
}

/// Similarity in [0, 1] between two shape descriptors
pub fn descriptor_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let d: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt();
    1.0 / (1.0 + 4.0 * d)
}
