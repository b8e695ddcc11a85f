//! Built-in compute kernels and the records they share with the host.
//!
//! Every frame runs four kernels in a fixed order (see
//! [`ParticleBufferPipeline`](crate::pipeline::ParticleBufferPipeline)):
//!
//! | Kernel | Dispatch | Work |
//! |--------|----------|------|
//! | `SetIndirectArgs` | direct `(1, 1, 1)` | workgroup counts into the dispatch-args buffer |
//! | `BufferUnion` | indirect, offset 0 | merge survivors and new spawns per emitter |
//! | `Simulate` | indirect, offset 12 | integrate, age, kill |
//! | `ClearDrawArgs` | direct | zero the per-emitter emitted counters |
//!
//! The WGSL text of each kernel is assembled from the `#[derive(GpuStruct)]`
//! definitions of the host records, so both sides always agree on layout.
//! [`reference`] holds CPU versions of the same kernels, used by the
//! software backend.

pub mod reference;
mod wgsl;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigFlags, ParticleSystemConfig, MAX_ATTRACTION_FORCE, MAX_KILL_RADIUS, PACK_SCALE};
use crate::gpu::{Binding, Kernel};
use crate::gradient::SENTINEL_TIME;
use crate::spline::SplineInfo;
use crate::GpuStruct;

pub use wgsl::EMIT_WGSL;

/// Words per emitter in the draw-args buffer.
pub const DRAW_ARGS_STRIDE: u32 = 8;
/// Draw-args word holding the mesh index count.
pub const DRAW_INDEX_COUNT: usize = 0;
/// Draw-args word holding the live particle count.
pub const DRAW_INSTANCE_COUNT: usize = 1;
/// Draw-args word holding the first particle of the emitter's slice.
pub const DRAW_FIRST_INSTANCE: usize = 4;
/// Draw-args word counting spawn attempts this frame.
pub const DRAW_EMITTED: usize = 5;

/// Words in the dispatch-args buffer: union `xyz`, then simulate `xyz`.
pub const DISPATCH_ARGS_WORDS: u32 = 6;
/// Byte offset of the union workgroup counts.
pub const UNION_ARGS_OFFSET: u64 = 0;
/// Byte offset of the simulate workgroup counts.
pub const SIMULATE_ARGS_OFFSET: u64 = 12;

/// Invocations per union workgroup (one invocation per emitter).
pub const UNION_WORKGROUP_SIZE: u32 = 64;
/// Invocations per simulate workgroup (one invocation per particle).
pub const SIMULATE_WORKGROUP_SIZE: u32 = 256;
/// Invocations per clear workgroup (one invocation per emitter).
pub const CLEAR_WORKGROUP_SIZE: u32 = 64;

/// One particle as stored in the particle buffers (96 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, GpuStruct)]
pub struct ParticleGpu {
    pub position: [f32; 3],
    pub spawn_time: f32,
    pub color: [f32; 4],
    pub start_color: [f32; 3],
    pub lifetime: f32,
    pub normal: [f32; 3],
    pub config_index: u32,
    pub velocity: [f32; 3],
    pub size: f32,
    pub start_size: f32,
    pub start_speed: f32,
    pub alive: u32,
    pub _pad: u32,
}

/// Frame constants read by every kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, GpuStruct)]
pub struct SimulationUniforms {
    pub time: f32,
    pub delta_time: f32,
    pub frame: u32,
    pub emitter_count: u32,
    pub gravity: f32,
    pub floor_height: f32,
    pub max_speed: f32,
    pub policy: u32,
    /// Noise tiling in `xy`, offset in `zw`.
    pub noise_st: [f32; 4],
    pub wind: [f32; 3],
    pub spline_count: u32,
    pub noise_width: u32,
    pub noise_height: u32,
    pub capacity: u32,
    pub _pad: u32,
}

/// What the union stage does once an emitter's cap is reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// New spawns win; surviving particles are truncated.
    #[default]
    PrioritizeNew,
    /// Survivors win; new spawns are dropped.
    PrioritizeOld,
}

impl MergePolicy {
    pub fn as_u32(self) -> u32 {
        match self {
            MergePolicy::PrioritizeNew => 0,
            MergePolicy::PrioritizeOld => 1,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        if value == 0 {
            MergePolicy::PrioritizeNew
        } else {
            MergePolicy::PrioritizeOld
        }
    }
}

/// Particles kept by the union stage for one emitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeCounts {
    pub kept_previous: u32,
    pub kept_new: u32,
}

impl MergeCounts {
    pub fn live(&self) -> u32 {
        self.kept_previous + self.kept_new
    }
}

/// The merge law: how many survivors and spawns an emitter with `cap`
/// slots keeps when `previous_alive` particles survived and `spawned` were
/// emitted this frame.
pub fn merge_counts(policy: MergePolicy, cap: u32, previous_alive: u32, spawned: u32) -> MergeCounts {
    match policy {
        MergePolicy::PrioritizeNew => {
            let kept_new = cap.min(spawned);
            MergeCounts {
                kept_previous: previous_alive.min(cap - kept_new),
                kept_new,
            }
        }
        MergePolicy::PrioritizeOld => {
            let kept_previous = previous_alive.min(cap);
            MergeCounts {
                kept_previous,
                kept_new: spawned.min(cap - kept_previous),
            }
        }
    }
}

/// Access mode of a kernel binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Uniform,
    ReadOnly,
    ReadWrite,
}

/// WGSL text of a kernel and the bindings it declares.
///
/// The entry point is always `main`.
#[derive(Clone, Debug)]
pub struct KernelSource {
    pub label: String,
    pub wgsl: String,
    pub bindings: Vec<(Binding, Access)>,
}

impl KernelSource {
    pub fn new(label: impl Into<String>, wgsl: impl Into<String>, bindings: Vec<(Binding, Access)>) -> Self {
        Self {
            label: label.into(),
            wgsl: wgsl.into(),
            bindings,
        }
    }

    /// A simulate kernel with a custom body, using the standard bindings.
    ///
    /// `body` runs for every live particle with `p` (a `ParticleGpu`),
    /// `config`, `index` and `uniforms` in scope; write `p` back by falling
    /// through to the end.
    pub fn custom_simulate(body: &str) -> Self {
        Self::new(
            "Simulate (custom)",
            format!(
                "{}\n{}\n{}\n{}",
                prelude(),
                wgsl::CURVES,
                wgsl::SIMULATE_BINDINGS,
                wgsl::SIMULATE_SHELL.replace("{{BODY}}", body)
            ),
            simulate_bindings(),
        )
    }
}

/// WGSL declarations shared by every kernel: constants and records.
pub fn prelude() -> String {
    format!(
        "{flags}\
const DRAW_ARGS_STRIDE: u32 = {stride}u;\n\
const DRAW_INSTANCE_COUNT: u32 = {instance}u;\n\
const DRAW_FIRST_INSTANCE: u32 = {first}u;\n\
const DRAW_EMITTED: u32 = {emitted}u;\n\
const POLICY_PRIORITIZE_NEW: u32 = 0u;\n\
const UNION_WORKGROUP_SIZE: u32 = {union_wg}u;\n\
const SIMULATE_WORKGROUP_SIZE: u32 = {sim_wg}u;\n\
const SENTINEL_TIME: f32 = {sentinel:.1};\n\
const PACK_SCALE: f32 = {scale:.1};\n\
const MAX_ATTRACTION_FORCE: f32 = {force:.1};\n\
const MAX_KILL_RADIUS: f32 = {radius:.1};\n\n\
{particle}\n\n{uniforms}\n\n{config}\n\n{spline}\n",
        flags = ConfigFlags::wgsl_constants(),
        stride = DRAW_ARGS_STRIDE,
        instance = DRAW_INSTANCE_COUNT,
        first = DRAW_FIRST_INSTANCE,
        emitted = DRAW_EMITTED,
        union_wg = UNION_WORKGROUP_SIZE,
        sim_wg = SIMULATE_WORKGROUP_SIZE,
        sentinel = SENTINEL_TIME,
        scale = PACK_SCALE,
        force = MAX_ATTRACTION_FORCE,
        radius = MAX_KILL_RADIUS,
        particle = ParticleGpu::WGSL_STRUCT,
        uniforms = SimulationUniforms::WGSL_STRUCT,
        config = ParticleSystemConfig::WGSL_STRUCT,
        spline = SplineInfo::WGSL_STRUCT,
    )
}

fn simulate_bindings() -> Vec<(Binding, Access)> {
    vec![
        (Binding::Uniforms, Access::Uniform),
        (Binding::Particles, Access::ReadWrite),
        (Binding::DrawArgs, Access::ReadOnly),
        (Binding::MaxCounts, Access::ReadOnly),
        (Binding::Offsets, Access::ReadOnly),
        (Binding::Configs, Access::ReadOnly),
        (Binding::SplinePositions, Access::ReadOnly),
        (Binding::SplineInfos, Access::ReadOnly),
        (Binding::Noise, Access::ReadOnly),
    ]
}

/// The built-in source of `kernel`.
pub fn source(kernel: Kernel) -> KernelSource {
    let prelude = prelude();
    match kernel {
        Kernel::SetIndirectArgs => KernelSource::new(
            kernel.label(),
            format!("{}\n{}", prelude, wgsl::SET_INDIRECT_ARGS),
            vec![
                (Binding::Uniforms, Access::Uniform),
                (Binding::DispatchArgs, Access::ReadWrite),
                (Binding::MaxCounts, Access::ReadOnly),
            ],
        ),
        Kernel::BufferUnion => KernelSource::new(
            kernel.label(),
            format!("{}\n{}", prelude, wgsl::BUFFER_UNION),
            vec![
                (Binding::Uniforms, Access::Uniform),
                (Binding::Particles, Access::ReadWrite),
                (Binding::PreviousParticles, Access::ReadOnly),
                (Binding::DrawArgs, Access::ReadWrite),
                (Binding::MaxCounts, Access::ReadOnly),
                (Binding::Offsets, Access::ReadOnly),
            ],
        ),
        Kernel::Simulate => KernelSource::new(
            kernel.label(),
            format!(
                "{}\n{}\n{}\n{}",
                prelude,
                wgsl::CURVES,
                wgsl::SIMULATE_BINDINGS,
                wgsl::SIMULATE_SHELL.replace("{{BODY}}", wgsl::SIMULATE_BODY)
            ),
            simulate_bindings(),
        ),
        Kernel::ClearDrawArgs => KernelSource::new(
            kernel.label(),
            format!("{}\n{}", prelude, wgsl::CLEAR_DRAW_ARGS),
            vec![
                (Binding::Uniforms, Access::Uniform),
                (Binding::DrawArgs, Access::ReadWrite),
            ],
        ),
    }
}

/// Bindings and helper an emission kernel starts from.
///
/// Declares `uniforms`, `particles`, an atomic `draw_args`, `max_counts`
/// and `offsets`, plus `ssfx_emit(emitter, particle) -> bool`, which
/// appends `particle` to the emitter's slice while it has room and counts
/// every attempt in the emitted word.
pub fn emission_prelude() -> String {
    format!("{}\n{}", prelude(), EMIT_WGSL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(std::mem::size_of::<ParticleGpu>(), 96);
        assert_eq!(ParticleGpu::GPU_SIZE, 96);
        assert_eq!(std::mem::size_of::<SimulationUniforms>(), 80);
        assert_eq!(SimulationUniforms::GPU_SIZE, 80);
    }

    #[test]
    fn test_prioritize_new_law() {
        let c = merge_counts(MergePolicy::PrioritizeNew, 100, 80, 40);
        assert_eq!(c, MergeCounts { kept_previous: 60, kept_new: 40 });

        let c = merge_counts(MergePolicy::PrioritizeNew, 10, 5, 30);
        assert_eq!(c, MergeCounts { kept_previous: 0, kept_new: 10 });

        let c = merge_counts(MergePolicy::PrioritizeNew, 10, 3, 2);
        assert_eq!(c.live(), 5);
    }

    #[test]
    fn test_prioritize_old_law() {
        let c = merge_counts(MergePolicy::PrioritizeOld, 100, 80, 40);
        assert_eq!(c, MergeCounts { kept_previous: 80, kept_new: 20 });

        let c = merge_counts(MergePolicy::PrioritizeOld, 10, 10, 5);
        assert_eq!(c, MergeCounts { kept_previous: 10, kept_new: 0 });
    }

    #[test]
    fn test_merge_law_exhaustive_small() {
        for cap in 0..12 {
            for prev in 0..15 {
                for spawned in 0..15 {
                    let new = merge_counts(MergePolicy::PrioritizeNew, cap, prev, spawned);
                    assert_eq!(new.kept_new, cap.min(spawned));
                    assert_eq!(new.kept_previous, prev.min(cap.saturating_sub(spawned)));
                    assert!(new.live() <= cap);

                    let old = merge_counts(MergePolicy::PrioritizeOld, cap, prev, spawned);
                    assert_eq!(old.kept_previous, prev.min(cap));
                    assert_eq!(old.kept_new, spawned.min(cap.saturating_sub(prev)));
                    assert!(old.live() <= cap);
                }
            }
        }
    }

    #[test]
    fn test_policy_round_trip() {
        for policy in [MergePolicy::PrioritizeNew, MergePolicy::PrioritizeOld] {
            assert_eq!(MergePolicy::from_u32(policy.as_u32()), policy);
        }
    }

    #[test]
    fn test_sources_use_shared_records() {
        for kernel in Kernel::ALL {
            let src = source(kernel);
            assert!(src.wgsl.contains("struct ParticleGpu"));
            assert!(src.wgsl.contains("fn main("));
            assert!(src.bindings.iter().any(|(b, _)| *b == Binding::Uniforms));
        }
    }
}
