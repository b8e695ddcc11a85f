//! Per-emitter playback state.
//!
//! A [`ParticleEffect`] owns the emission settings of one emitter and its
//! config slot. Playback is a timer: [`start`](ParticleEffect::start) runs it
//! for a duration, [`pause`](ParticleEffect::pause) freezes both the timer
//! and the emitter's live particles, and [`reset`](ParticleEffect::reset)
//! kills them.
//!
//! ```
//! use ssfx::{ConfigRegistry, EmitterParams, ParticleEffect};
//!
//! let mut registry = ConfigRegistry::new();
//! let mut effect = ParticleEffect::new(EmitterParams::new().with_gravity(1.0)).with_duration(2.0);
//! effect.start(&mut registry, None);
//! effect.update(0.5);
//! assert_eq!(effect.progress(), 0.25);
//! ```

use glam::{Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::config::{build_config, ConfigFlags, EmitterParams};
use crate::kernels::ParticleGpu;
use crate::registry::ConfigRegistry;

/// Ranges new particles are drawn from.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmissionSettings {
    pub lifetime_min: f32,
    pub lifetime_max: f32,
    /// Particles per second while playing.
    pub spawn_rate: f32,
    pub size_min: f32,
    pub size_max: f32,
    pub speed_min: f32,
    pub speed_max: f32,
    pub color: Vec4,
}

impl Default for EmissionSettings {
    fn default() -> Self {
        Self {
            lifetime_min: 1.0,
            lifetime_max: 1.0,
            spawn_rate: 0.2,
            size_min: 0.01,
            size_max: 0.01,
            speed_min: 1.0,
            speed_max: 1.2,
            color: Vec4::ONE,
        }
    }
}

/// Playback state and emission settings of one emitter.
#[derive(Clone, Debug)]
pub struct ParticleEffect {
    params: EmitterParams,
    emission: EmissionSettings,
    duration: f32,
    config_index: Option<u32>,
    playing: bool,
    paused: bool,
    killed: bool,
    run_duration: f32,
    timer: f32,
    spawn_budget: f32,
}

impl ParticleEffect {
    pub fn new(params: EmitterParams) -> Self {
        Self {
            params,
            emission: EmissionSettings::default(),
            duration: 1.0,
            config_index: None,
            playing: false,
            paused: false,
            killed: false,
            run_duration: 1.0,
            timer: 0.0,
            spawn_budget: 0.0,
        }
    }

    /// Default run length used by [`start`](Self::start).
    pub fn with_duration(mut self, seconds: f32) -> Self {
        self.duration = seconds;
        self
    }

    pub fn with_emission(mut self, emission: EmissionSettings) -> Self {
        self.emission = emission;
        self
    }

    pub fn params(&self) -> &EmitterParams {
        &self.params
    }

    pub fn emission(&self) -> &EmissionSettings {
        &self.emission
    }

    pub fn config_index(&self) -> Option<u32> {
        self.config_index
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Replace the parameters and push the rebuilt config.
    pub fn set_params(&mut self, registry: &mut ConfigRegistry, params: EmitterParams) {
        self.params = params;
        self.update_config(registry);
    }

    /// Register the config on first use, overwrite it afterwards.
    pub fn update_config(&mut self, registry: &mut ConfigRegistry) {
        let mut config = build_config(&self.params);
        config.set_flag(ConfigFlags::PAUSE, self.paused);
        let target = self.params.target.as_ref().map(|t| t.position);
        let index = match self.config_index {
            Some(index) => {
                registry.bind_target(index, target);
                registry.update(index, config);
                index
            }
            None => {
                let index = registry.register(config);
                registry.bind_target(index, target);
                index
            }
        };
        self.config_index = Some(index);
        self.killed = false;
    }

    /// Run for `duration` seconds, or the default duration.
    pub fn start(&mut self, registry: &mut ConfigRegistry, duration: Option<f32>) {
        self.paused = false;
        if self.config_index.is_none() || self.killed {
            self.update_config(registry);
        }
        if let Some(index) = self.config_index {
            registry.set_paused(index, false);
        }
        self.run_duration = duration.filter(|d| *d >= 0.0).unwrap_or(self.duration);
        self.timer = 0.0;
        self.spawn_budget = 0.0;
        self.playing = true;
    }

    /// Freeze the timer and every live particle of this emitter.
    pub fn pause(&mut self, registry: &mut ConfigRegistry) {
        if !self.playing {
            return;
        }
        if let Some(index) = self.config_index {
            registry.set_paused(index, true);
        }
        self.paused = true;
    }

    /// Resume after [`pause`](Self::pause), or start if stopped.
    pub fn play(&mut self, registry: &mut ConfigRegistry) {
        if !self.playing {
            self.start(registry, None);
            return;
        }
        if let Some(index) = self.config_index {
            registry.set_paused(index, false);
        }
        self.paused = false;
    }

    /// Stop and kill every live particle of this emitter.
    pub fn reset(&mut self, registry: &mut ConfigRegistry) {
        if let Some(index) = self.config_index {
            registry.set_kill_all(index);
            self.killed = true;
        }
        self.playing = false;
        self.paused = false;
        self.timer = 0.0;
        self.spawn_budget = 0.0;
    }

    /// Advance the timer; stops once the run duration is reached.
    pub fn update(&mut self, delta: f32) {
        if !self.playing || self.paused {
            return;
        }
        self.timer += delta;
        if self.timer >= self.run_duration {
            self.playing = false;
            self.timer = self.run_duration;
        }
    }

    /// Fraction of the run elapsed, in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        if self.run_duration <= 0.0 {
            return if self.playing { 0.0 } else { 1.0 };
        }
        (self.timer / self.run_duration).clamp(0.0, 1.0)
    }

    /// Particles to emit this frame at the configured rate.
    pub fn spawn_count(&mut self, delta: f32) -> u32 {
        if !self.playing || self.paused {
            return 0;
        }
        self.spawn_budget += self.emission.spawn_rate.max(0.0) * delta;
        let count = self.spawn_budget.floor();
        self.spawn_budget -= count;
        count as u32
    }

    /// The two vectors materials read to emit on the GPU:
    /// `(config index, lifetime min, lifetime max, spawn rate)` and
    /// `(size min, size max, speed min, speed max)`.
    pub fn emission_data(&self) -> [Vec4; 2] {
        let e = &self.emission;
        [
            Vec4::new(
                self.config_index.unwrap_or(0) as f32,
                e.lifetime_min,
                e.lifetime_max,
                e.spawn_rate,
            ),
            Vec4::new(e.size_min, e.size_max, e.speed_min, e.speed_max),
        ]
    }

    /// A new particle for this emitter.
    ///
    /// `jitter` holds three values in `[0, 1)` picking lifetime, size and
    /// speed within their ranges.
    pub fn make_particle(&self, position: Vec3, normal: Vec3, time: f32, jitter: Vec3) -> ParticleGpu {
        let e = &self.emission;
        let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
        let size = lerp(e.size_min, e.size_max, jitter.y);
        let speed = lerp(e.speed_min, e.speed_max, jitter.z);
        let color = e.color.to_array();
        ParticleGpu {
            position: position.to_array(),
            spawn_time: time,
            color,
            start_color: [color[0], color[1], color[2]],
            lifetime: lerp(e.lifetime_min, e.lifetime_max, jitter.x),
            normal: normal.to_array(),
            config_index: self.config_index.unwrap_or(0),
            velocity: (normal.normalize_or_zero() * speed).to_array(),
            size,
            start_size: size,
            start_speed: speed,
            alive: 1,
            _pad: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetParams;

    fn effect() -> ParticleEffect {
        ParticleEffect::new(EmitterParams::new().with_gravity(1.0)).with_duration(2.0)
    }

    #[test]
    fn test_start_registers_config() {
        let mut registry = ConfigRegistry::new();
        let mut fx = effect();
        fx.start(&mut registry, None);
        let index = fx.config_index().expect("registered");
        assert!(registry.get(index).is_some_and(|c| c.has(ConfigFlags::GRAVITY)));
        assert!(fx.is_playing());
    }

    #[test]
    fn test_progress_and_completion() {
        let mut registry = ConfigRegistry::new();
        let mut fx = effect();
        fx.start(&mut registry, Some(1.0));
        fx.update(0.25);
        assert_eq!(fx.progress(), 0.25);
        fx.update(1.0);
        assert!(!fx.is_playing());
        assert_eq!(fx.progress(), 1.0);
    }

    #[test]
    fn test_pause_sets_flag_and_freezes_timer() {
        let mut registry = ConfigRegistry::new();
        let mut fx = effect();
        fx.pause(&mut registry);
        assert!(!fx.is_paused());

        fx.start(&mut registry, None);
        let index = fx.config_index().expect("registered");
        fx.pause(&mut registry);
        fx.update(1.0);
        assert_eq!(fx.progress(), 0.0);
        assert!(registry.get(index).is_some_and(|c| c.has(ConfigFlags::PAUSE)));

        fx.play(&mut registry);
        assert!(!fx.is_paused());
        assert!(registry.get(index).is_some_and(|c| !c.has(ConfigFlags::PAUSE)));
    }

    #[test]
    fn test_reset_kills_and_restart_revives() {
        let mut registry = ConfigRegistry::new();
        let mut fx = effect();
        fx.start(&mut registry, None);
        let index = fx.config_index().expect("registered");
        fx.reset(&mut registry);
        assert!(!fx.is_playing());
        assert!(registry.get(index).is_some_and(|c| c.has(ConfigFlags::KILL_ALL)));

        fx.start(&mut registry, None);
        assert_eq!(fx.config_index(), Some(index));
        assert!(registry.get(index).is_some_and(|c| !c.has(ConfigFlags::KILL_ALL)));
    }

    #[test]
    fn test_spawn_count_accumulates() {
        let mut registry = ConfigRegistry::new();
        let mut fx = effect().with_emission(EmissionSettings {
            spawn_rate: 10.0,
            ..Default::default()
        });
        assert_eq!(fx.spawn_count(1.0), 0);
        fx.start(&mut registry, None);
        assert_eq!(fx.spawn_count(0.25), 2);
        assert_eq!(fx.spawn_count(0.25), 3);
    }

    #[test]
    fn test_emission_data_and_particle() {
        let mut registry = ConfigRegistry::new();
        let mut fx = effect();
        fx.update_config(&mut registry);
        let [a, b] = fx.emission_data();
        assert_eq!(a.x, 1.0);
        assert_eq!(b, Vec4::new(0.01, 0.01, 1.0, 1.2));

        let p = fx.make_particle(Vec3::ZERO, Vec3::Y, 3.0, Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(p.config_index, 1);
        assert_eq!(p.spawn_time, 3.0);
        assert!((p.velocity[1] - 1.2).abs() < 1e-6);
        assert_eq!(p.alive, 1);
    }

    #[test]
    fn test_dropping_target_unbinds_it() {
        let mut registry = ConfigRegistry::new();
        let target = TargetParams {
            position: Vec3::new(4.0, 0.0, 0.0),
            attraction_force: 1.0,
            kill_radius: 0.1,
            die_on_reach: false,
            lifetime_from_distance: false,
        };
        let mut fx = ParticleEffect::new(EmitterParams::new().with_target(target));
        fx.start(&mut registry, None);
        let index = fx.config_index().expect("registered");
        assert_eq!(registry.bound_target(index), Some(target.position));

        fx.set_params(&mut registry, EmitterParams::new());
        assert_eq!(registry.bound_target(index), None);
        assert_eq!(registry.get(index).map(|c| c.target()), Some(Vec3::ZERO));
    }
}
