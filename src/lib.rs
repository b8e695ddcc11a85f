//! # SSFX - Screen-Space Particle Effects
//!
//! GPU-resident particle buffers for many emitters, driven by a fixed
//! sequence of compute kernels and drawn with indirect instanced draws.
//!
//! SSFX owns everything between "an emitter wrote some particles" and "the
//! renderer drew the survivors": merging new particles into a fixed-capacity
//! slice per emitter, simulating them against per-emitter configs, and
//! producing draw arguments the CPU never reads back.
//!
//! ## Quick Start
//!
//! ```
//! use ssfx::prelude::*;
//!
//! let mut backend = SoftwareBackend::new();
//! let mut context = EffectContext::new();
//! let mut pipeline = ParticleBufferPipeline::new(
//!     PipelineSettings::new().with_emitter(EmitterSlot::new(100)),
//! );
//!
//! let mut effect = ParticleEffect::new(EmitterParams::new().with_gravity(1.0));
//! effect.start(context.configs_mut(), None);
//!
//! let report = pipeline
//!     .run_frame(&mut backend, &mut context, 0.0, 1.0 / 60.0, |backend, target| {
//!         let p = effect.make_particle(Vec3::ZERO, Vec3::Y, target.time, Vec3::ZERO);
//!         backend.emit(target, 0, p)?;
//!         Ok(())
//!     })
//!     .expect("frame");
//! assert!(!report.is_noop());
//! assert_eq!(pipeline.read_live_counts(&mut backend).expect("counts"), vec![1]);
//! ```
//!
//! ## Core Concepts
//!
//! ### Emitters and slots
//!
//! [`PipelineSettings`] lists one [`EmitterSlot`] per emitter. Emitter `e`
//! owns the particle range starting at the sum of the capacities before it.
//! Changing the layout reallocates the buffers and drops live particles.
//!
//! ### Configs
//!
//! Every particle carries the index of a [`ParticleSystemConfig`] in the
//! [`ConfigRegistry`]. Index 0 is reserved and zeroed. The registry mirrors
//! itself to a GPU buffer, uploading only the range that changed.
//!
//! ### Frames
//!
//! [`ParticleBufferPipeline::run_frame`] applies queued registry commands,
//! lets the host emit into the fresh buffer, then merges with the previous
//! frame's survivors, simulates, draws and swaps.
//!
//! ### Backends
//!
//! The pipeline talks to a [`GpuBackend`]. [`WgpuBackend`] runs on a real
//! device; [`SoftwareBackend`] runs the same kernels on the CPU and records
//! every command, which is what the tests use.

extern crate self as ssfx;

pub mod arc_length;
pub mod config;
pub mod context;
pub mod effect;
pub mod error;
pub mod gpu;
pub mod gradient;
pub mod kernels;
pub mod noise;
pub mod pipeline;
pub mod registry;
pub mod settings;
pub mod spline;
pub mod time;

pub use bytemuck;
pub use glam::{Vec2, Vec3, Vec4};
pub use ssfx_derive::GpuStruct;

pub use config::{build_config, ConfigFlags, EmitterParams, ParticleSystemConfig, TargetParams};
pub use context::{EffectCommand, EffectContext, EffectHandle};
pub use effect::{EmissionSettings, ParticleEffect};
pub use error::{Error, GpuError, Result, TextureError};
pub use gpu::{GpuBackend, MaterialBinding, MaterialId, MeshId, SoftwareBackend, WgpuBackend};
pub use gradient::{ColorKey, CurveKey, Gradient};
pub use kernels::{MergePolicy, ParticleGpu, SimulationUniforms};
pub use noise::NoiseMap;
pub use pipeline::{EmissionTarget, FrameReport, ParticleBufferPipeline, Stage};
pub use registry::ConfigRegistry;
pub use settings::{EmitterSlot, NoiseSettings, PipelineSettings};
pub use spline::{BoundingBox, PathId, SplinePath, SplineRegistry};
pub use time::FrameClock;

/// A `#[repr(C)]` record shared byte for byte with WGSL.
///
/// Implemented by `#[derive(GpuStruct)]`, which checks at compile time
/// that every field sits where WGSL would put it.
pub trait GpuStruct: bytemuck::Pod {
    /// Name of the WGSL struct.
    const WGSL_NAME: &'static str;

    /// WGSL struct definition, ready to paste into a kernel.
    const WGSL_STRUCT: &'static str;

    /// Size in bytes, equal on both sides.
    const GPU_SIZE: u32;
}

/// Convenient re-exports for common usage.
///
/// ```
/// use ssfx::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{ConfigFlags, EmitterParams, ParticleSystemConfig, TargetParams};
    pub use crate::context::{EffectContext, EffectHandle};
    pub use crate::effect::{EmissionSettings, ParticleEffect};
    pub use crate::gpu::{GpuBackend, SoftwareBackend, WgpuBackend};
    pub use crate::gradient::{ColorKey, CurveKey, Gradient};
    pub use crate::kernels::{MergePolicy, ParticleGpu};
    pub use crate::pipeline::{EmissionTarget, ParticleBufferPipeline};
    pub use crate::registry::ConfigRegistry;
    pub use crate::settings::{EmitterSlot, PipelineSettings};
    pub use crate::spline::{SplinePath, SplineRegistry};
    pub use crate::time::FrameClock;
    pub use crate::{GpuStruct, Vec2, Vec3, Vec4};
}
