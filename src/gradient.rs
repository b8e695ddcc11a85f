//! Fixed-capacity lookup tables for over-lifetime curves.
//!
//! Emitters describe size, speed, color and alpha over a particle's life as
//! keyed curves of any length. The simulation kernel reads them from the
//! config record as fixed 10-entry tables, each entry being `(value..., t)`
//! with `t` remapped to `[0, 1]` relative to the curve's own time range.
//!
//! Trailing unused entries carry [`SENTINEL_TIME`] so the kernel can stop
//! scanning without a separate key count.
//!
//! ```ignore
//! use ssfx::gradient::{sample_curve, CurveKey};
//!
//! let mut table = [[0.0; 2]; 10];
//! let report = sample_curve(&[CurveKey::new(1.0, 0.0), CurveKey::new(0.0, 2.0)], &mut table);
//! assert_eq!(report.written, 2);
//! assert_eq!(table[1], [0.0, 1.0]);
//! ```

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Number of entries in every gradient table.
pub const GRADIENT_SLOTS: usize = 10;

/// Time value marking an unused table entry.
pub const SENTINEL_TIME: f32 = 65536.0;

/// A scalar key: size, speed or alpha at a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurveKey {
    pub value: f32,
    pub time: f32,
}

impl CurveKey {
    pub fn new(value: f32, time: f32) -> Self {
        Self { value, time }
    }
}

/// An RGB key of a color gradient.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColorKey {
    pub color: Vec3,
    pub time: f32,
}

impl ColorKey {
    pub fn new(color: Vec3, time: f32) -> Self {
        Self { color, time }
    }
}

/// Color gradient with independent color and alpha key lists.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Gradient {
    #[serde(default)]
    pub colors: Vec<ColorKey>,
    #[serde(default)]
    pub alphas: Vec<CurveKey>,
}

impl Gradient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_color(mut self, color: Vec3, time: f32) -> Self {
        self.colors.push(ColorKey::new(color, time));
        self
    }

    pub fn with_alpha(mut self, alpha: f32, time: f32) -> Self {
        self.alphas.push(CurveKey::new(alpha, time));
        self
    }
}

/// Outcome of writing keys into a table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SampleReport {
    /// Keys stored in the table.
    pub written: usize,
    /// Keys beyond [`GRADIENT_SLOTS`] that were discarded.
    pub dropped: usize,
}

impl SampleReport {
    pub fn truncated(&self) -> bool {
        self.dropped > 0
    }
}

/// Write a scalar curve into a `(value, t)` table.
///
/// An empty curve leaves the table untouched.
pub fn sample_curve(keys: &[CurveKey], table: &mut [[f32; 2]; GRADIENT_SLOTS]) -> SampleReport {
    fill_table(keys, |k| k.time, table, |entry, key, t| {
        *entry = [key.value, t];
    }, |entry| entry[1] = SENTINEL_TIME)
}

/// Write the color half of a gradient into an `(r, g, b, t)` table.
pub fn sample_colors(keys: &[ColorKey], table: &mut [[f32; 4]; GRADIENT_SLOTS]) -> SampleReport {
    fill_table(keys, |k| k.time, table, |entry, key, t| {
        *entry = [key.color.x, key.color.y, key.color.z, t];
    }, |entry| entry[3] = SENTINEL_TIME)
}

fn fill_table<K, E>(
    keys: &[K],
    time_of: impl Fn(&K) -> f32,
    table: &mut [E; GRADIENT_SLOTS],
    write: impl Fn(&mut E, &K, f32),
    mark_unused: impl Fn(&mut E),
) -> SampleReport {
    if keys.is_empty() {
        return SampleReport::default();
    }

    let dropped = keys.len().saturating_sub(GRADIENT_SLOTS);
    if dropped > 0 {
        log::warn!(
            "[ssfx] gradient will be truncated: {} keys given, max is {}",
            keys.len(),
            GRADIENT_SLOTS
        );
    }

    let (min, max) = keys.iter().map(&time_of).fold((f32::MAX, f32::MIN), |(lo, hi), t| {
        (lo.min(t), hi.max(t))
    });
    let range = max - min;

    let written = keys.len().min(GRADIENT_SLOTS);
    for (entry, key) in table.iter_mut().zip(keys.iter()) {
        let t = if range > 0.0 { (time_of(key) - min) / range } else { 0.0 };
        write(entry, key, t);
    }
    for entry in table.iter_mut().skip(written) {
        mark_unused(entry);
    }

    SampleReport { written, dropped }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_normalized_keys() {
        let keys = [
            CurveKey::new(1.0, 0.0),
            CurveKey::new(0.5, 0.25),
            CurveKey::new(0.0, 1.0),
        ];
        let mut table = [[0.0; 2]; GRADIENT_SLOTS];
        let report = sample_curve(&keys, &mut table);

        assert_eq!(report, SampleReport { written: 3, dropped: 0 });
        for (entry, key) in table.iter().zip(keys.iter()) {
            assert_eq!(*entry, [key.value, key.time]);
        }
        for entry in &table[3..] {
            assert_eq!(entry[1], SENTINEL_TIME);
        }
    }

    #[test]
    fn test_times_remapped_to_own_range() {
        let keys = [CurveKey::new(2.0, 3.0), CurveKey::new(4.0, 5.0), CurveKey::new(6.0, 7.0)];
        let mut table = [[0.0; 2]; GRADIENT_SLOTS];
        sample_curve(&keys, &mut table);

        assert_eq!(table[0], [2.0, 0.0]);
        assert_eq!(table[1], [4.0, 0.5]);
        assert_eq!(table[2], [6.0, 1.0]);
    }

    #[test]
    fn test_single_key_maps_to_zero() {
        let mut table = [[0.0; 2]; GRADIENT_SLOTS];
        sample_curve(&[CurveKey::new(3.0, 0.7)], &mut table);
        assert_eq!(table[0], [3.0, 0.0]);
        assert!(table[0][1].is_finite());
    }

    #[test]
    fn test_truncates_to_first_ten() {
        let keys: Vec<_> = (0..14).map(|i| CurveKey::new(i as f32, i as f32)).collect();
        let mut table = [[0.0; 2]; GRADIENT_SLOTS];
        let report = sample_curve(&keys, &mut table);

        assert_eq!(report.written, GRADIENT_SLOTS);
        assert_eq!(report.dropped, 4);
        assert!(report.truncated());
        for (i, entry) in table.iter().enumerate() {
            assert_eq!(entry[0], i as f32);
        }
    }

    #[test]
    fn test_empty_leaves_table_untouched() {
        let mut table = [[0.0; 4]; GRADIENT_SLOTS];
        let report = sample_colors(&[], &mut table);
        assert_eq!(report.written, 0);
        assert_eq!(table, [[0.0; 4]; GRADIENT_SLOTS]);
    }

    #[test]
    fn test_colors_keep_rgb() {
        let gradient = Gradient::new()
            .with_color(Vec3::new(1.0, 0.0, 0.0), 0.0)
            .with_color(Vec3::new(0.0, 0.0, 1.0), 1.0);
        let mut table = [[0.0; 4]; GRADIENT_SLOTS];
        sample_colors(&gradient.colors, &mut table);

        assert_eq!(table[0], [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(table[1], [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(table[2][3], SENTINEL_TIME);
    }
}
