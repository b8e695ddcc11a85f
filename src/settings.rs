//! Pipeline settings.
//!
//! Settings are built in code with the `with_*` builder methods or loaded
//! from JSON:
//!
//! ```
//! use ssfx::PipelineSettings;
//!
//! let settings = PipelineSettings::from_json(r#"{
//!     "emitters": [{ "max_particles": 100, "index_count": 6 }],
//!     "policy": "prioritize_old",
//!     "max_speed": 4.0
//! }"#).unwrap();
//! assert_eq!(settings.total_capacity(), 100);
//! ```

use glam::{Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::gpu::{MaterialId, MeshId};
use crate::kernels::MergePolicy;

/// One emitter's share of the particle buffers and how it is drawn.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterSlot {
    /// Cap on live particles, also the emitter's slice length.
    pub max_particles: u32,
    #[serde(skip)]
    pub mesh: MeshId,
    /// Indices per instance of `mesh`.
    pub index_count: u32,
    #[serde(skip)]
    pub material: MaterialId,
}

impl Default for EmitterSlot {
    fn default() -> Self {
        Self {
            max_particles: 0,
            mesh: MeshId::default(),
            index_count: 6,
            material: MaterialId::default(),
        }
    }
}

impl EmitterSlot {
    pub fn new(max_particles: u32) -> Self {
        Self {
            max_particles,
            ..Default::default()
        }
    }

    pub fn with_mesh(mut self, mesh: MeshId, index_count: u32) -> Self {
        self.mesh = mesh;
        self.index_count = index_count;
        self
    }

    pub fn with_material(mut self, material: MaterialId) -> Self {
        self.material = material;
        self
    }
}

/// Tiling and offset of the noise map lookup.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSettings {
    pub tiling: Vec2,
    pub offset: Vec2,
}

impl Default for NoiseSettings {
    fn default() -> Self {
        Self {
            tiling: Vec2::ONE,
            offset: Vec2::ZERO,
        }
    }
}

impl NoiseSettings {
    /// `(tiling.x, tiling.y, offset.x, offset.y)` as the kernels read it.
    pub fn st(&self) -> Vec4 {
        Vec4::new(self.tiling.x, self.tiling.y, self.offset.x, self.offset.y)
    }
}

/// Global settings of a [`ParticleBufferPipeline`](crate::ParticleBufferPipeline).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub emitters: Vec<EmitterSlot>,
    /// What the union keeps when an emitter is full.
    pub policy: MergePolicy,
    /// Log every frame at debug level.
    pub debug: bool,
    pub floor_height: f32,
    /// Scaled per config by its gravity modifier.
    pub gravity: f32,
    /// Speed clamp; 0 or less disables it.
    pub max_speed: f32,
    pub noise: NoiseSettings,
    pub wind_direction: Vec3,
    pub wind_speed: f32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            emitters: Vec::new(),
            policy: MergePolicy::PrioritizeNew,
            debug: false,
            floor_height: f32::MIN,
            gravity: 9.81,
            max_speed: 2.0,
            noise: NoiseSettings::default(),
            wind_direction: Vec3::ZERO,
            wind_speed: 0.0,
        }
    }
}

impl PipelineSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_emitter(mut self, slot: EmitterSlot) -> Self {
        self.emitters.push(slot);
        self
    }

    pub fn with_policy(mut self, policy: MergePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_floor(mut self, height: f32) -> Self {
        self.floor_height = height;
        self
    }

    pub fn with_gravity(mut self, gravity: f32) -> Self {
        self.gravity = gravity;
        self
    }

    pub fn with_max_speed(mut self, speed: f32) -> Self {
        self.max_speed = speed;
        self
    }

    pub fn with_noise(mut self, tiling: Vec2, offset: Vec2) -> Self {
        self.noise = NoiseSettings { tiling, offset };
        self
    }

    pub fn with_wind(mut self, direction: Vec3, speed: f32) -> Self {
        self.wind_direction = direction;
        self.wind_speed = speed;
        self
    }

    /// Wind velocity handed to the simulation.
    pub fn wind(&self) -> Vec3 {
        self.wind_direction.normalize_or_zero() * self.wind_speed
    }

    /// Sum of every emitter's cap.
    pub fn total_capacity(&self) -> u32 {
        self.emitters.iter().map(|e| e.max_particles).sum()
    }

    /// Start of each emitter's slice in the particle buffers.
    pub fn offsets(&self) -> Vec<u32> {
        self.emitters
            .iter()
            .scan(0, |start, e| {
                let offset = *start;
                *start += e.max_particles;
                Some(offset)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_prefix_sums() {
        let settings = PipelineSettings::new()
            .with_emitter(EmitterSlot::new(10))
            .with_emitter(EmitterSlot::new(0))
            .with_emitter(EmitterSlot::new(5));
        assert_eq!(settings.offsets(), vec![0, 10, 10]);
        assert_eq!(settings.total_capacity(), 15);
    }

    #[test]
    fn test_json_defaults() {
        let settings = PipelineSettings::from_json(r#"{ "emitters": [{ "max_particles": 3 }] }"#).expect("parse");
        assert_eq!(settings.emitters[0].index_count, 6);
        assert_eq!(settings.policy, MergePolicy::PrioritizeNew);
        assert_eq!(settings.max_speed, 2.0);
        assert_eq!(settings.noise.st(), Vec4::new(1.0, 1.0, 0.0, 0.0));
    }

    #[test]
    fn test_json_round_trip_and_errors() {
        let settings = PipelineSettings::new()
            .with_emitter(EmitterSlot::new(40))
            .with_policy(MergePolicy::PrioritizeOld)
            .with_wind(Vec3::new(2.0, 0.0, 0.0), 3.0);
        let json = settings.to_json().expect("serialize");
        let parsed = PipelineSettings::from_json(&json).expect("parse");
        assert_eq!(parsed, settings);
        assert_eq!(parsed.wind(), Vec3::new(3.0, 0.0, 0.0));

        assert!(PipelineSettings::from_json("{ \"policy\": 3 }").is_err());
    }
}
