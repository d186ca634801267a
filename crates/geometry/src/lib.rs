//! Axis-aligned rectangles in image pixel coordinates.
//!
//! Everything here is plain numeric geometry: no rendering types, no scene
//! graph. Rectangles serialize as a `[x1, y1, x2, y2]` array, which is the
//! layout used by the per-frame record files.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest accepted side length for a newly created box.
pub const MIN_SIDE: f64 = 5.0;

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("rectangle has non-finite coordinates")]
    NonFinite,
    #[error("rectangle {width}x{height} is smaller than {}x{}", MIN_SIDE, MIN_SIDE)]
    TooSmall { width: f64, height: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct Rect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl From<[f64; 4]> for Rect {
    fn from([x1, y1, x2, y2]: [f64; 4]) -> Self { Self { x1, y1, x2, y2 } }
}

impl From<Rect> for [f64; 4] {
    fn from(r: Rect) -> Self { [r.x1, r.y1, r.x2, r.y2] }
}

impl Rect {
    /// Builds a rectangle exactly as given, without reordering corners.
    pub const fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self { Self { x1, y1, x2, y2 } }

    /// Builds a rectangle from two opposite corners in any order.
    pub fn from_corners(ax: f64, ay: f64, bx: f64, by: f64) -> Self {
        Self { x1: ax.min(bx), y1: ay.min(by), x2: ax.max(bx), y2: ay.max(by) }
    }

    /// Normalizes corner order and rejects rectangles that are not usable as a
    /// new annotation (non-finite, or smaller than [`MIN_SIDE`] on either side).
    pub fn validated(self) -> Result<Self, GeometryError> {
        if !self.is_finite() {
            return Err(GeometryError::NonFinite);
        }
        let r = self.normalized();
        if r.width() < MIN_SIDE || r.height() < MIN_SIDE {
            return Err(GeometryError::TooSmall { width: r.width(), height: r.height() });
        }
        Ok(r)
    }

    pub fn normalized(self) -> Self { Self::from_corners(self.x1, self.y1, self.x2, self.y2) }

    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    pub fn width(&self) -> f64 { (self.x2 - self.x1).max(0.0) }

    pub fn height(&self) -> f64 { (self.y2 - self.y1).max(0.0) }

    pub fn area(&self) -> f64 { self.width() * self.height() }

    pub fn intersection_area(&self, other: &Rect) -> f64 {
        let w = self.x2.min(other.x2) - self.x1.max(other.x1);
        let h = self.y2.min(other.y2) - self.y1.max(other.y1);
        if w <= 0.0 || h <= 0.0 { 0.0 } else { w * h }
    }

    /// Intersection over union. Zero when the rectangles do not overlap or
    /// when both are empty.
    pub fn iou(&self, other: &Rect) -> f64 {
        let inter = self.intersection_area(other);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union > 0.0 { inter / union } else { 0.0 }
    }

    /// Position `step` of `steps` between `self` and `other`, computed as
    /// `v + (w - v) * step / steps` so that whole-number inputs stay exact.
    pub fn step_towards(&self, other: &Rect, step: usize, steps: usize) -> Rect {
        let (k, n) = (step as f64, steps as f64);
        let mix = |a: f64, b: f64| a + (b - a) * k / n;
        Rect {
            x1: mix(self.x1, other.x1),
            y1: mix(self.y1, other.y1),
            x2: mix(self.x2, other.x2),
            y2: mix(self.y2, other.y2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn iou_of_identical_rects_is_one() {
        let r = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert_relative_eq!(r.iou(&r), 1.0);
    }

    #[test]
    fn iou_of_disjoint_rects_is_zero() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        // touching edges do not overlap
        let c = Rect::new(10.0, 0.0, 20.0, 10.0);
        assert_eq!(a.iou(&c), 0.0);
    }

    #[test]
    fn iou_is_symmetric() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(1.0, 1.0, 11.0, 11.0);
        assert_relative_eq!(a.iou(&b), b.iou(&a));
        assert_relative_eq!(a.iou(&b), 81.0 / 119.0, epsilon = 1e-12);
    }

    #[test]
    fn validated_normalizes_and_rejects_small() {
        let r = Rect::new(10.0, 20.0, 0.0, 0.0).validated().unwrap();
        assert_eq!(r, Rect::new(0.0, 0.0, 10.0, 20.0));

        assert_eq!(
            Rect::new(0.0, 0.0, 4.0, 100.0).validated(),
            Err(GeometryError::TooSmall { width: 4.0, height: 100.0 })
        );
        assert_eq!(Rect::new(0.0, 0.0, f64::NAN, 10.0).validated(), Err(GeometryError::NonFinite));
        assert!(Rect::new(0.0, 0.0, 5.0, 5.0).validated().is_ok());
    }

    #[test]
    fn step_towards_fills_evenly() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(30.0, 0.0, 40.0, 10.0);
        assert_eq!(a.step_towards(&b, 1, 3), Rect::new(10.0, 0.0, 20.0, 10.0));
        assert_eq!(a.step_towards(&b, 2, 3), Rect::new(20.0, 0.0, 30.0, 10.0));
    }

    #[test]
    fn serializes_as_array() {
        let r = Rect::new(1.5, 2.0, 3.0, 4.0);
        assert_eq!(serde_json::to_string(&r).unwrap(), "[1.5,2.0,3.0,4.0]");
        let back: Rect = serde_json::from_str("[1.5, 2, 3, 4]").unwrap();
        assert_eq!(back, r);
    }
}
