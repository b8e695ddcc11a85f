//! Uniform arc-length sampling of chained cubic Bézier segments.
//!
//! A path is a list of [`BezierPoint`]s. The segment between points `A` and
//! `B` has control polygon `A`, `A + A.handle`, `B + B.handle`, `B`. Sampling
//! by parameter would bunch samples where the curve is slow, so
//! [`ArcLengthSampler`] builds a cumulative-length table per segment and
//! inverts distance to parameter inside the matched table bucket.
//!
//! ```ignore
//! use ssfx::arc_length::{ArcLengthSampler, BezierPoint};
//! use glam::Vec3;
//!
//! let path = [BezierPoint::new(Vec3::ZERO, Vec3::X), BezierPoint::new(Vec3::X * 4.0, -Vec3::X)];
//! let samples = ArcLengthSampler::new(32).sample(&path, 5);
//! assert_eq!(samples.len(), 5);
//! ```

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Default table resolution per segment.
pub const DEFAULT_PRECISION: u32 = 20;

/// A path vertex and its outgoing handle, relative to `position`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BezierPoint {
    pub position: Vec3,
    pub handle: Vec3,
}

impl BezierPoint {
    pub fn new(position: Vec3, handle: Vec3) -> Self {
        Self { position, handle }
    }
}

/// Point on the segment `a → b` at parameter `t ∈ [0, 1]`.
pub fn position(a: &BezierPoint, b: &BezierPoint, t: f32) -> Vec3 {
    let t = t.clamp(0.0, 1.0);
    let u = 1.0 - t;
    let c1 = a.position + a.handle;
    let c2 = b.position + b.handle;
    a.position * (u * u * u) + c1 * (3.0 * u * u * t) + c2 * (3.0 * u * t * t) + b.position * (t * t * t)
}

/// First derivative of the segment `a → b` at `t`.
pub fn derivative(a: &BezierPoint, b: &BezierPoint, t: f32) -> Vec3 {
    let t = t.clamp(0.0, 1.0);
    let u = 1.0 - t;
    let c1 = a.position + a.handle;
    let c2 = b.position + b.handle;
    (c1 - a.position) * (3.0 * u * u) + (c2 - c1) * (6.0 * u * t) + (b.position - c2) * (3.0 * t * t)
}

/// Cumulative polyline length of `a → b` after each of `steps` equal steps.
///
/// Entry `i` is the length from `t = 0` to `t = (i + 1) / steps`; the last
/// entry is the segment length.
pub fn segment_lut(a: &BezierPoint, b: &BezierPoint, steps: u32) -> Vec<f32> {
    let steps = steps.max(1);
    let mut lut = Vec::with_capacity(steps as usize);
    let mut previous = a.position;
    let mut len = 0.0;
    for i in 1..=steps {
        let next = position(a, b, i as f32 / steps as f32);
        len += previous.distance(next);
        lut.push(len);
        previous = next;
    }
    lut
}

/// Approximate length of `a → b`.
pub fn segment_length(a: &BezierPoint, b: &BezierPoint, steps: u32) -> f32 {
    segment_lut(a, b, steps).last().copied().unwrap_or(0.0)
}

/// Invert a cumulative-length table: parameter at which `distance` is reached.
pub fn distance_to_t(lut: &[f32], distance: f32) -> f32 {
    if lut.is_empty() || distance <= 0.0 {
        return 0.0;
    }
    let resolution = lut.len() as f32;
    let Some(i) = lut.iter().position(|&len| len >= distance) else {
        return 1.0;
    };
    let previous = if i == 0 { 0.0 } else { lut[i - 1] };
    let span = lut[i] - previous;
    let frac = if span > 0.0 { (distance - previous) / span } else { 0.0 };
    (i as f32 + frac) / resolution
}

/// One arc-length sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArcSample {
    pub position: Vec3,
    /// Unit tangent, zero where the curve is stationary.
    pub tangent: Vec3,
    /// Index of the segment the sample lies on (its start point).
    pub segment: usize,
    /// Distance fraction travelled along that segment, in `[0, 1]`.
    pub fraction: f32,
}

/// Samples a path at uniform arc-length spacing.
#[derive(Clone, Copy, Debug)]
pub struct ArcLengthSampler {
    precision: u32,
}

impl Default for ArcLengthSampler {
    fn default() -> Self {
        Self::new(DEFAULT_PRECISION)
    }
}

impl ArcLengthSampler {
    /// `precision` is the table resolution per segment.
    pub fn new(precision: u32) -> Self {
        Self {
            precision: precision.max(1),
        }
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    /// Total path length and the length of each segment.
    pub fn length(&self, points: &[BezierPoint]) -> (f32, Vec<f32>) {
        let parts: Vec<f32> = points
            .windows(2)
            .map(|w| segment_length(&w[0], &w[1], self.precision))
            .collect();
        (parts.iter().sum(), parts)
    }

    /// `count` samples from the first to the last point, equally spaced by
    /// distance along the curve.
    ///
    /// A single point yields that point once; `count == 1` yields the start.
    pub fn sample(&self, points: &[BezierPoint], count: usize) -> Vec<ArcSample> {
        if points.is_empty() || count == 0 {
            return Vec::new();
        }
        if points.len() == 1 || count == 1 {
            let first = &points[0];
            let tangent = match points.get(1) {
                Some(next) => derivative(first, next, 0.0).normalize_or_zero(),
                None => Vec3::ZERO,
            };
            return vec![ArcSample {
                position: first.position,
                tangent,
                segment: 0,
                fraction: 0.0,
            }];
        }

        let luts: Vec<Vec<f32>> = points
            .windows(2)
            .map(|w| segment_lut(&w[0], &w[1], self.precision))
            .collect();
        let lengths: Vec<f32> = luts.iter().map(|lut| lut.last().copied().unwrap_or(0.0)).collect();
        let total: f32 = lengths.iter().sum();
        let spacing = total / (count - 1) as f32;
        let last_segment = luts.len() - 1;

        let mut samples = Vec::with_capacity(count);
        let mut segment = 0;
        let mut floor = 0.0;

        for i in 0..count {
            let distance = if i == count - 1 { total } else { i as f32 * spacing };
            while segment < last_segment && floor + lengths[segment] < distance {
                floor += lengths[segment];
                segment += 1;
            }

            let local = (distance - floor).max(0.0);
            let t = if i == count - 1 {
                1.0
            } else {
                distance_to_t(&luts[segment], local)
            };
            let (a, b) = (&points[segment], &points[segment + 1]);
            let fraction = if lengths[segment] <= 0.0 {
                0.0
            } else if i == count - 1 {
                1.0
            } else {
                (local / lengths[segment]).clamp(0.0, 1.0)
            };

            samples.push(ArcSample {
                position: position(a, b, t),
                tangent: derivative(a, b, t).normalize_or_zero(),
                segment,
                fraction,
            });
        }

        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_line() -> [BezierPoint; 2] {
        // Collinear but unevenly spread handles: parameter speed varies a lot.
        [
            BezierPoint::new(Vec3::ZERO, Vec3::new(8.0, 0.0, 0.0)),
            BezierPoint::new(Vec3::new(10.0, 0.0, 0.0), Vec3::new(-1.0, 0.0, 0.0)),
        ]
    }

    #[test]
    fn test_endpoints() {
        let [a, b] = straight_line();
        assert_eq!(position(&a, &b, 0.0), a.position);
        assert!((position(&a, &b, 1.0) - b.position).length() < 1e-5);
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let a = BezierPoint::new(Vec3::ZERO, Vec3::new(1.0, 2.0, 0.0));
        let b = BezierPoint::new(Vec3::new(3.0, 0.0, 1.0), Vec3::new(0.0, 1.0, -1.0));
        let h = 1e-3;
        for &t in &[0.1, 0.5, 0.9] {
            let numeric = (position(&a, &b, t + h) - position(&a, &b, t - h)) / (2.0 * h);
            let analytic = derivative(&a, &b, t);
            assert!((numeric - analytic).length() < 1e-2, "t={t}: {numeric} vs {analytic}");
        }
    }

    #[test]
    fn test_lut_is_cumulative() {
        let [a, b] = straight_line();
        let lut = segment_lut(&a, &b, 50);
        assert_eq!(lut.len(), 50);
        assert!(lut.windows(2).all(|w| w[1] >= w[0]));
        assert!((lut[49] - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_distance_to_t_interpolates_inside_bucket() {
        let lut = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(distance_to_t(&lut, 0.0), 0.0);
        assert!((distance_to_t(&lut, 0.5) - 0.125).abs() < 1e-6);
        assert!((distance_to_t(&lut, 2.5) - 0.625).abs() < 1e-6);
        assert_eq!(distance_to_t(&lut, 4.0), 1.0);
        assert_eq!(distance_to_t(&lut, 9.0), 1.0);
        assert_eq!(distance_to_t(&[], 1.0), 0.0);
    }

    #[test]
    fn test_straight_line_equal_spacing() {
        let samples = ArcLengthSampler::new(200).sample(&straight_line(), 11);
        assert_eq!(samples.len(), 11);
        for pair in samples.windows(2) {
            let gap = pair[0].position.distance(pair[1].position);
            assert!((gap - 1.0).abs() < 1e-2, "gap {gap}");
        }
        assert_eq!(samples[0].position, Vec3::ZERO);
        assert!((samples[10].position.x - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_multi_segment_reports_segment_and_fraction() {
        let points = [
            BezierPoint::new(Vec3::ZERO, Vec3::ZERO),
            BezierPoint::new(Vec3::new(1.0, 0.0, 0.0), Vec3::ZERO),
            BezierPoint::new(Vec3::new(3.0, 0.0, 0.0), Vec3::ZERO),
        ];
        let samples = ArcLengthSampler::new(100).sample(&points, 4);
        assert_eq!(samples[0].segment, 0);
        assert_eq!(samples[1].segment, 0);
        assert!((samples[1].fraction - 1.0).abs() < 1e-3);
        assert_eq!(samples[2].segment, 1);
        assert!((samples[2].fraction - 0.5).abs() < 1e-2);
        assert_eq!(samples[3].segment, 1);
        assert_eq!(samples[3].fraction, 1.0);
    }

    #[test]
    fn test_degenerate_inputs() {
        let sampler = ArcLengthSampler::default();
        let single = [BezierPoint::new(Vec3::new(1.0, 2.0, 3.0), Vec3::X)];
        let out = sampler.sample(&single, 10);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].position, Vec3::new(1.0, 2.0, 3.0));

        let out = sampler.sample(&straight_line(), 1);
        assert_eq!(out.len(), 1);
        assert!(out[0].position.is_finite());

        assert!(sampler.sample(&straight_line(), 0).is_empty());
        assert!(sampler.sample(&[], 5).is_empty());
    }

    #[test]
    fn test_zero_length_path() {
        let p = BezierPoint::new(Vec3::ONE, Vec3::ZERO);
        let out = ArcLengthSampler::default().sample(&[p, p], 3);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|s| s.position == Vec3::ONE && s.fraction == 0.0));
    }
}
