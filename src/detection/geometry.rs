//! Overlap helpers shared by the pattern engine and fusion

use std::cmp::Ordering;

use crate::types::{BoundingBox, DetectedSymbol};

pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f64 {
    a.iou(b)
}

/// Sort by descending confidence. Ties keep their original order.
pub fn sort_by_confidence(symbols: &mut [DetectedSymbol]) {
    symbols.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));
}

/// Greedy non-maximum suppression.
///
/// Walks symbols in descending confidence and drops any whose IoU with an
/// already kept symbol exceeds `max_iou`. The output is sorted by
/// confidence and running it again is a no-op.
pub fn non_maximum_suppression(mut symbols: Vec<DetectedSymbol>, max_iou: f64) -> Vec<DetectedSymbol> {
    sort_by_confidence(&mut symbols);
    let mut kept: Vec<DetectedSymbol> = Vec::with_capacity(symbols.len());
    for candidate in symbols {
        let suppressed = kept
            .iter()
            .any(|k| k.bounding_box.iou(&candidate.bounding_box) > max_iou);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Largest pairwise IoU in a set, 0 for fewer than two symbols
pub fn max_pairwise_iou(symbols: &[DetectedSymbol]) -> f64 {
    let mut max = 0.0f64;
    for (i, a) in symbols.iter().enumerate() {
        for b in &symbols[i + 1..] {
            max = max.max(a.bounding_box.iou(&b.bounding_box));
        }
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetectionMethod, SymbolType};

    fn symbol(x: f64, y: f64, confidence: f64) -> DetectedSymbol {
        DetectedSymbol::new(
            SymbolType::Resistor,
            confidence,
            BoundingBox::new(x, y, 40.0, 20.0),
            DetectionMethod::PatternMatching,
        )
    }

    #[test]
    fn test_nms_keeps_highest_confidence() {
        let symbols = vec![symbol(0.0, 0.0, 0.6), symbol(2.0, 1.0, 0.9), symbol(200.0, 0.0, 0.7)];
        let kept = non_maximum_suppression(symbols, 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.7);
    }

    #[test]
    fn test_nms_is_idempotent() {
        let symbols: Vec<_> = (0..20)
            .map(|i| symbol((i * 7) as f64, (i % 3) as f64 * 5.0, 0.5 + (i as f64) / 50.0))
            .collect();
        let once = non_maximum_suppression(symbols, 0.5);
        assert!(max_pairwise_iou(&once) <= 0.5);
        let twice = non_maximum_suppression(once.clone(), 0.5);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_touching_boxes_do_not_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(10.0, 0.0, 10.0, 10.0);
        assert_eq!(iou(&a, &b), 0.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-12);
    }
}
