//! FAST-9 corners with BRIEF binary descriptors

use image::GrayImage;
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use serde::{Deserialize, Serialize};

/// 256-bit BRIEF descriptor
pub type Descriptor = [u8; 32];

/// Half-size of the square patch sampled around each keypoint
const PATCH_RADIUS: i32 = 12;
const FAST_THRESHOLD: u8 = 20;
const PATTERN_SEED: u64 = 0x5EED_B81E_F000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: u32,
    pub y: u32,
    pub score: f32,
}

/// Keypoints and their descriptors, index-aligned
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeypointSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl KeypointSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeypointMatch {
    pub query: usize,
    pub train: usize,
    pub distance: u32,
}

/// Fixed BRIEF sampling pattern
#[derive(Debug, Clone)]
pub struct BriefExtractor {
    pairs: Vec<[(i32, i32); 2]>,
    max_keypoints: usize,
}

impl Default for BriefExtractor {
    fn default() -> Self {
        Self::new(64)
    }
}

impl BriefExtractor {
    pub fn new(max_keypoints: usize) -> Self {
        // xorshift keeps the pattern identical across runs and platforms
        let mut state = PATTERN_SEED;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % (2 * PATCH_RADIUS as u64 + 1)) as i32 - PATCH_RADIUS
        };
        let pairs = (0..256)
            .map(|_| [(next(), next()), (next(), next())])
            .collect();
        Self { pairs, max_keypoints }
    }

    /// Detect FAST-9 corners and describe the strongest ones
    pub fn detect_and_describe(&self, gray: &GrayImage) -> KeypointSet {
        let (w, h) = gray.dimensions();
        if w <= 2 * PATCH_RADIUS as u32 || h <= 2 * PATCH_RADIUS as u32 {
            return KeypointSet::default();
        }

        let mut corners: Vec<_> = corners_fast9(gray, FAST_THRESHOLD)
            .into_iter()
            .filter(|c| {
                let (x, y) = (c.x as i32, c.y as i32);
                x >= PATCH_RADIUS && y >= PATCH_RADIUS && x < w as i32 - PATCH_RADIUS && y < h as i32 - PATCH_RADIUS
            })
            .collect();
        corners.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        corners.truncate(self.max_keypoints);

        let smoothed = gaussian_blur_f32(gray, 2.0);
        let mut set = KeypointSet::default();
        for c in corners {
            set.descriptors.push(self.describe(&smoothed, c.x as i32, c.y as i32));
            set.keypoints.push(Keypoint {
                x: c.x,
                y: c.y,
                score: c.score,
            });
        }
        set
    }

    fn describe(&self, smoothed: &GrayImage, x: i32, y: i32) -> Descriptor {
        let mut descriptor = [0u8; 32];
        let sample = |dx: i32, dy: i32| smoothed.get_pixel((x + dx) as u32, (y + dy) as u32).0[0];
        for (bit, [(ax, ay), (bx, by)]) in self.pairs.iter().enumerate() {
            if sample(*ax, *ay) < sample(*bx, *by) {
                descriptor[bit / 8] |= 1 << (bit % 8);
            }
        }
        descriptor
    }
}

pub fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Nearest-neighbour matching with Lowe's ratio test and an absolute
/// distance ceiling
pub fn match_descriptors(
    query: &[Descriptor],
    train: &[Descriptor],
    max_distance: u32,
    ratio: f32,
) -> Vec<KeypointMatch> {
    let mut matches = Vec::new();
    for (qi, q) in query.iter().enumerate() {
        let mut best: Option<(usize, u32)> = None;
        let mut second = u32::MAX;
        for (ti, t) in train.iter().enumerate() {
            let d = hamming(q, t);
            match best {
                Some((_, bd)) if d >= bd => second = second.min(d),
                Some((_, bd)) => {
                    second = bd;
                    best = Some((ti, d));
                }
                None => best = Some((ti, d)),
            }
        }
        if let Some((ti, d)) = best {
            let passes_ratio = second == u32::MAX || (d as f32) < ratio * second as f32;
            if d < max_distance && passes_ratio {
                matches.push(KeypointMatch {
                    query: qi,
                    train: ti,
                    distance: d,
                });
            }
        }
    }
    matches
}

/// 0.5 * min(1, n / 10) + 0.5 * (1 - mean_distance / 256)
pub fn match_confidence(matches: &[KeypointMatch]) -> f64 {
    if matches.is_empty() {
        return 0.0;
    }
    let n = matches.len() as f64;
    let mean = matches.iter().map(|m| m.distance as f64).sum::<f64>() / n;
    0.5 * (n / 10.0).min(1.0) + 0.5 * (1.0 - mean / 256.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut};
    use imageproc::rect::Rect;

    fn zigzag() -> GrayImage {
        let mut img = GrayImage::from_pixel(120, 80, Luma([255]));
        let points = [(10.0, 40.0), (30.0, 40.0), (40.0, 20.0), (55.0, 60.0), (70.0, 20.0), (85.0, 60.0), (95.0, 40.0), (110.0, 40.0)];
        for pair in points.windows(2) {
            draw_line_segment_mut(&mut img, pair[0], pair[1], Luma([0]));
        }
        draw_filled_rect_mut(&mut img, Rect::at(50, 65).of_size(10, 6), Luma([0]));
        img
    }

    #[test]
    fn test_pattern_is_deterministic() {
        let a = BriefExtractor::default();
        let b = BriefExtractor::default();
        assert_eq!(a.pairs, b.pairs);
        assert!(a.pairs.iter().flatten().all(|(x, y)| x.abs() <= PATCH_RADIUS && y.abs() <= PATCH_RADIUS));
    }

    #[test]
    fn test_blank_image_has_no_keypoints() {
        let img = GrayImage::from_pixel(64, 64, Luma([200]));
        assert!(BriefExtractor::default().detect_and_describe(&img).is_empty());
    }

    #[test]
    fn test_self_match() {
        let extractor = BriefExtractor::default();
        let set = extractor.detect_and_describe(&zigzag());
        assert!(set.len() >= 3, "found {} keypoints", set.len());

        let matches = match_descriptors(&set.descriptors, &set.descriptors, 64, 1.01);
        assert!(matches.len() >= 3);
        assert!(matches.iter().all(|m| m.distance == 0));
        assert!(match_confidence(&matches) >= 0.65);
    }

    #[test]
    fn test_hamming() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        b[0] = 0b1011;
        b[31] = 0xFF;
        assert_eq!(hamming(&a, &b), 11);
        assert_eq!(hamming(&b, &b), 0);
    }

    #[test]
    fn test_confidence_formula() {
        let matches: Vec<KeypointMatch> = (0..5)
            .map(|i| KeypointMatch { query: i, train: i, distance: 32 })
            .collect();
        let expected = 0.5 * 0.5 + 0.5 * (1.0 - 32.0 / 256.0);
        assert!((match_confidence(&matches) - expected).abs() < 1e-12);
        assert_eq!(match_confidence(&[]), 0.0);
    }
}
