//! Per-emitter simulation parameters as uploaded to the GPU.
//!
//! A [`ParticleSystemConfig`] is a plain-data record with a fixed, documented
//! layout (432 bytes, 16-byte aligned):
//!
//! | offset | field | meaning |
//! |-------:|-------|---------|
//! | 0 | `flags` | [`ConfigFlags`] bitmask |
//! | 4 | `gravity` | gravity scale |
//! | 8 | `_pad` | alignment |
//! | 16 | `color_over_lifetime` | 10 × `(r, g, b, t)` |
//! | 176 | `alpha_over_lifetime` | 10 × `(alpha, t)` |
//! | 256 | `size_over_lifetime` | 10 × `(size, t)` |
//! | 336 | `speed_over_lifetime` | 10 × `(speed, t)` |
//! | 416 | `target_position` | attraction target |
//! | 428 | `target_packed` | attraction force and kill radius, see [`pack2`] |
//!
//! Records are assembled from emitter-level toggles by [`build_config`].
//! Flags, never zeroed data, decide what the simulation kernel applies.

use std::ops::{BitOr, BitOrAssign};

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::gradient::{sample_colors, sample_curve, CurveKey, Gradient, GRADIENT_SLOTS};
use crate::GpuStruct;

/// Quantization scale of each half of a packed pair.
pub const PACK_SCALE: f32 = 65535.0;

/// Upper bound of the attraction force stored in `target_packed`.
pub const MAX_ATTRACTION_FORCE: f32 = 100.0;

/// Upper bound of the kill radius stored in `target_packed`.
pub const MAX_KILL_RADIUS: f32 = 10.0;

/// Feature bits of a config record.
///
/// Bit 0 is unused so a zeroed record reads as "nothing enabled".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConfigFlags(u32);

impl ConfigFlags {
    pub const NONE: Self = Self(0);
    pub const GRAVITY: Self = Self(1 << 1);
    pub const COLOR_OVER_LIFETIME: Self = Self(1 << 2);
    pub const ALPHA_OVER_LIFETIME: Self = Self(1 << 3);
    pub const SIZE_OVER_LIFETIME: Self = Self(1 << 4);
    pub const TARGET: Self = Self(1 << 5);
    pub const SPEED_OVER_LIFETIME: Self = Self(1 << 6);
    pub const KILL_ALL: Self = Self(1 << 7);
    pub const TARGET_DIE_ON_REACH: Self = Self(1 << 8);
    pub const FOLLOW_PATH: Self = Self(1 << 9);
    pub const LIFETIME_FROM_TARGET_DISTANCE: Self = Self(1 << 10);
    pub const PAUSE: Self = Self(1 << 11);

    /// Every named flag with its WGSL constant name.
    pub const ALL: [(Self, &'static str); 11] = [
        (Self::GRAVITY, "FLAG_GRAVITY"),
        (Self::COLOR_OVER_LIFETIME, "FLAG_COLOR_OVER_LIFETIME"),
        (Self::ALPHA_OVER_LIFETIME, "FLAG_ALPHA_OVER_LIFETIME"),
        (Self::SIZE_OVER_LIFETIME, "FLAG_SIZE_OVER_LIFETIME"),
        (Self::TARGET, "FLAG_TARGET"),
        (Self::SPEED_OVER_LIFETIME, "FLAG_SPEED_OVER_LIFETIME"),
        (Self::KILL_ALL, "FLAG_KILL_ALL"),
        (Self::TARGET_DIE_ON_REACH, "FLAG_TARGET_DIE_ON_REACH"),
        (Self::FOLLOW_PATH, "FLAG_FOLLOW_PATH"),
        (Self::LIFETIME_FROM_TARGET_DISTANCE, "FLAG_LIFETIME_FROM_TARGET_DISTANCE"),
        (Self::PAUSE, "FLAG_PAUSE"),
    ];

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }

    /// WGSL `const` declarations for every flag.
    pub fn wgsl_constants() -> String {
        Self::ALL
            .iter()
            .map(|(flag, name)| format!("const {}: u32 = {}u;\n", name, flag.bits()))
            .collect()
    }
}

impl BitOr for ConfigFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ConfigFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// GPU record of one emitter kind's parameters.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable, GpuStruct)]
pub struct ParticleSystemConfig {
    pub flags: u32,
    pub gravity: f32,
    pub _pad: [u32; 2],
    pub color_over_lifetime: [[f32; 4]; 10],
    pub alpha_over_lifetime: [[f32; 2]; 10],
    pub size_over_lifetime: [[f32; 2]; 10],
    pub speed_over_lifetime: [[f32; 2]; 10],
    pub target_position: [f32; 3],
    pub target_packed: u32,
}

impl Default for ParticleSystemConfig {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl ParticleSystemConfig {
    pub fn flags(&self) -> ConfigFlags {
        ConfigFlags::from_bits(self.flags)
    }

    pub fn has(&self, flag: ConfigFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn set_flag(&mut self, flag: ConfigFlags, on: bool) {
        let mut flags = self.flags();
        flags.set(flag, on);
        self.flags = flags.bits();
    }

    pub fn target(&self) -> Vec3 {
        Vec3::from_array(self.target_position)
    }

    /// Decoded `(attraction_force, kill_radius)`.
    pub fn target_params(&self) -> (f32, f32) {
        unpack2(self.target_packed, MAX_ATTRACTION_FORCE, MAX_KILL_RADIUS)
    }
}

/// Attraction target settings of an emitter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetParams {
    pub position: Vec3,
    pub attraction_force: f32,
    pub kill_radius: f32,
    #[serde(default)]
    pub die_on_reach: bool,
    #[serde(default)]
    pub lifetime_from_distance: bool,
}

/// Emitter-level toggles and curves a config record is built from.
///
/// Curve data may be present while its toggle is off; it is then ignored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterParams {
    pub gravity_enabled: bool,
    pub gravity: f32,
    pub color_enabled: bool,
    pub color_over_lifetime: Gradient,
    pub size_enabled: bool,
    pub size_over_lifetime: Vec<CurveKey>,
    pub speed_enabled: bool,
    pub speed_over_lifetime: Vec<CurveKey>,
    pub target: Option<TargetParams>,
    pub follow_path: bool,
}

impl EmitterParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gravity(mut self, gravity: f32) -> Self {
        self.gravity_enabled = true;
        self.gravity = gravity;
        self
    }

    pub fn with_color_over_lifetime(mut self, gradient: Gradient) -> Self {
        self.color_enabled = true;
        self.color_over_lifetime = gradient;
        self
    }

    pub fn with_size_over_lifetime(mut self, keys: Vec<CurveKey>) -> Self {
        self.size_enabled = true;
        self.size_over_lifetime = keys;
        self
    }

    pub fn with_speed_over_lifetime(mut self, keys: Vec<CurveKey>) -> Self {
        self.speed_enabled = true;
        self.speed_over_lifetime = keys;
        self
    }

    pub fn with_target(mut self, target: TargetParams) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_follow_path(mut self) -> Self {
        self.follow_path = true;
        self
    }
}

/// Assemble a config record from emitter parameters.
pub fn build_config(params: &EmitterParams) -> ParticleSystemConfig {
    let mut config = ParticleSystemConfig::default();
    let mut flags = ConfigFlags::NONE;

    if params.gravity_enabled {
        config.gravity = params.gravity;
        flags |= ConfigFlags::GRAVITY;
    }

    if params.color_enabled {
        let gradient = &params.color_over_lifetime;
        if sample_colors(&gradient.colors, &mut config.color_over_lifetime).written > 0 {
            flags |= ConfigFlags::COLOR_OVER_LIFETIME;
        }
        if sample_curve(&gradient.alphas, &mut config.alpha_over_lifetime).written > 0 {
            flags |= ConfigFlags::ALPHA_OVER_LIFETIME;
        }
    }

    if params.size_enabled && sample_curve(&params.size_over_lifetime, &mut config.size_over_lifetime).written > 0 {
        flags |= ConfigFlags::SIZE_OVER_LIFETIME;
    }

    if params.speed_enabled && sample_curve(&params.speed_over_lifetime, &mut config.speed_over_lifetime).written > 0 {
        flags |= ConfigFlags::SPEED_OVER_LIFETIME;
    }

    if let Some(target) = &params.target {
        config.target_position = target.position.to_array();
        config.target_packed = pack2(
            target.attraction_force,
            MAX_ATTRACTION_FORCE,
            target.kill_radius,
            MAX_KILL_RADIUS,
        );
        flags |= ConfigFlags::TARGET;
        if target.die_on_reach {
            flags |= ConfigFlags::TARGET_DIE_ON_REACH;
        }
        if target.lifetime_from_distance {
            flags |= ConfigFlags::LIFETIME_FROM_TARGET_DISTANCE;
        }
    }

    if params.follow_path {
        flags |= ConfigFlags::FOLLOW_PATH;
    }

    config.flags = flags.bits();
    config
}

/// Quantize `a ∈ [0, a_max]` and `b ∈ [0, b_max]` to 16 bits each and pack
/// them into one word, `a` in the low half.
///
/// Values outside their range are clamped.
pub fn pack2(a: f32, a_max: f32, b: f32, b_max: f32) -> u32 {
    quantize(a, a_max) | (quantize(b, b_max) << 16)
}

/// Inverse of [`pack2`], exact to within one quantization step.
pub fn unpack2(packed: u32, a_max: f32, b_max: f32) -> (f32, f32) {
    let a = (packed & 0xFFFF) as f32 / PACK_SCALE * a_max;
    let b = (packed >> 16) as f32 / PACK_SCALE * b_max;
    (a, b)
}

fn quantize(value: f32, max: f32) -> u32 {
    if max <= 0.0 || !value.is_finite() {
        return 0;
    }
    ((value / max).clamp(0.0, 1.0) * PACK_SCALE).round() as u32
}

const _: () = assert!(std::mem::size_of::<ParticleSystemConfig>() == 432);
const _: () = assert!(GRADIENT_SLOTS == 10);
