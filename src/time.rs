//! Frame timing for the pipeline.
//!
//! [`FrameClock`] produces the `(elapsed, delta)` pair each frame hands to
//! [`ParticleBufferPipeline::run_frame`](crate::ParticleBufferPipeline::run_frame).
//! Elapsed time is the sum of accepted deltas, so a stall (a breakpoint, a
//! window drag, an editor reload) does not make every particle expire at
//! once: any delta longer than [`MAX_FRAME_DELTA`] counts as zero.
//!
//! ```
//! use ssfx::FrameClock;
//!
//! let mut clock = FrameClock::new();
//! clock.advance(0.5);
//! clock.advance(3.0); // hiccup, ignored
//! assert_eq!(clock.elapsed(), 0.5);
//! assert_eq!(clock.frame(), 2);
//! ```

use std::time::Instant;

/// Deltas above this many seconds are dropped.
pub const MAX_FRAME_DELTA: f32 = 1.0;

/// Time tracking for the frame loop.
#[derive(Debug)]
pub struct FrameClock {
    last_frame: Option<Instant>,
    total: f32,
    step: f32,
    frames: u64,
    paused: bool,
    fixed_step: Option<f32>,
    speed: f32,
}

impl FrameClock {
    pub fn new() -> Self {
        Self {
            last_frame: None,
            total: 0.0,
            step: 0.0,
            frames: 0,
            paused: false,
            fixed_step: None,
            speed: 1.0,
        }
    }

    /// Sample the wall clock. Call once per frame.
    ///
    /// Returns `(elapsed_time, delta_time)`.
    pub fn update(&mut self) -> (f32, f32) {
        let now = Instant::now();
        let raw = self
            .last_frame
            .map_or(0.0, |last| now.duration_since(last).as_secs_f32());
        self.last_frame = Some(now);
        self.advance(raw)
    }

    /// Step by `raw_delta` seconds without looking at the wall clock.
    pub fn advance(&mut self, raw_delta: f32) -> (f32, f32) {
        self.frames += 1;
        if self.paused {
            self.step = 0.0;
            return (self.total, 0.0);
        }

        let delta = match self.fixed_step {
            Some(fixed) => fixed,
            None if raw_delta > MAX_FRAME_DELTA || raw_delta < 0.0 => {
                log::debug!("[ssfx] frame delta {:.3}s dropped", raw_delta);
                0.0
            }
            None => raw_delta,
        };
        self.step = delta * self.speed;
        self.total += self.step;
        (self.total, self.step)
    }

    #[inline]
    pub fn elapsed(&self) -> f32 {
        self.total
    }

    #[inline]
    pub fn delta(&self) -> f32 {
        self.step
    }

    #[inline]
    pub fn frame(&self) -> u64 {
        self.frames
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// While paused, `delta()` is 0 and `elapsed()` stops increasing.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.last_frame = Some(Instant::now());
        }
    }

    /// Use a constant step instead of measured time. `None` restores measuring.
    pub fn set_fixed_delta(&mut self, delta: Option<f32>) {
        self.fixed_step = delta;
    }

    pub fn set_time_scale(&mut self, scale: f32) {
        self.speed = scale.max(0.0);
    }

    pub fn reset(&mut self) {
        *self = Self {
            fixed_step: self.fixed_step,
            speed: self.speed,
            ..Self::new()
        };
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_wall_clock_sample_is_zero() {
        let mut clock = FrameClock::new();
        assert_eq!(clock.update(), (0.0, 0.0));
        let (elapsed, delta) = clock.update();
        assert!(delta >= 0.0);
        assert_eq!(elapsed, delta);
        assert_eq!(clock.frame(), 2);
    }

    #[test]
    fn test_hiccup_is_dropped() {
        let mut clock = FrameClock::new();
        clock.advance(0.25);
        assert_eq!(clock.advance(1.5), (0.25, 0.0));
        assert_eq!(clock.advance(1.0), (1.25, 1.0));
    }

    #[test]
    fn test_pause_freezes_elapsed() {
        let mut clock = FrameClock::new();
        clock.advance(0.1);
        clock.pause();
        assert_eq!(clock.advance(0.1), (0.1, 0.0));
        clock.resume();
        clock.advance(0.1);
        assert!((clock.elapsed() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_fixed_delta_and_scale() {
        let mut clock = FrameClock::new();
        clock.set_fixed_delta(Some(0.5));
        clock.set_time_scale(2.0);
        assert_eq!(clock.advance(5.0), (1.0, 1.0));

        clock.set_time_scale(-1.0);
        assert_eq!(clock.advance(0.1).1, 0.0);

        clock.reset();
        assert_eq!(clock.frame(), 0);
        assert_eq!(clock.elapsed(), 0.0);
    }
}
