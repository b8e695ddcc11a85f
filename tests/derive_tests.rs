//! Integration tests for the `GpuStruct` derive.
//!
//! These check the generated WGSL against hand-written expectations and
//! the built-in records against their Rust sizes.

use bytemuck::{Pod, Zeroable};
use ssfx::config::ParticleSystemConfig;
use ssfx::kernels::{ParticleGpu, SimulationUniforms};
use ssfx::spline::SplineInfo;
use ssfx::GpuStruct;

// ============================================================================
// Scalars and vectors
// ============================================================================

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, GpuStruct)]
struct Scalars {
    a: f32,
    b: u32,
    c: i32,
    d: f32,
}

#[test]
fn test_scalar_struct() {
    assert_eq!(Scalars::WGSL_NAME, "Scalars");
    assert_eq!(Scalars::GPU_SIZE, 16);
    assert_eq!(
        Scalars::WGSL_STRUCT,
        "struct Scalars {\n    a: f32,\n    b: u32,\n    c: i32,\n    d: f32,\n}"
    );
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, GpuStruct)]
struct Spark {
    position: [f32; 3],
    age: f32,
    velocity: [f32; 3],
    size: f32,
    uv: [f32; 2],
    flags: [u32; 2],
}

#[test]
fn test_vec3_followed_by_scalar_packs() {
    assert_eq!(Spark::GPU_SIZE, 48);
    assert_eq!(Spark::GPU_SIZE as usize, std::mem::size_of::<Spark>());
    assert!(Spark::WGSL_STRUCT.contains("position: vec3<f32>,"));
    assert!(Spark::WGSL_STRUCT.contains("uv: vec2<f32>,"));
    assert!(Spark::WGSL_STRUCT.contains("flags: vec2<u32>,"));
}

// ============================================================================
// Arrays
// ============================================================================

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, GpuStruct)]
struct Curves {
    colors: [[f32; 4]; 3],
    keys: [[f32; 2]; 4],
    weights: [f32; 6],
    count: u32,
    _pad: u32,
}

#[test]
fn test_nested_arrays() {
    assert!(Curves::WGSL_STRUCT.contains("colors: array<vec4<f32>, 3>,"));
    assert!(Curves::WGSL_STRUCT.contains("keys: array<vec2<f32>, 4>,"));
    assert!(Curves::WGSL_STRUCT.contains("weights: array<f32, 6>,"));
    assert_eq!(Curves::GPU_SIZE as usize, std::mem::size_of::<Curves>());
}

// ============================================================================
// Built-in records
// ============================================================================

fn assert_matches_rust<T: GpuStruct>() {
    assert_eq!(T::GPU_SIZE as usize, std::mem::size_of::<T>(), "{}", T::WGSL_NAME);
    assert!(T::WGSL_STRUCT.starts_with(&format!("struct {} {{", T::WGSL_NAME)));
}

#[test]
fn test_builtin_records_match_rust_layout() {
    assert_matches_rust::<ParticleGpu>();
    assert_matches_rust::<SimulationUniforms>();
    assert_matches_rust::<ParticleSystemConfig>();
    assert_matches_rust::<SplineInfo>();
}

#[test]
fn test_particle_record_fields() {
    let wgsl = ParticleGpu::WGSL_STRUCT;
    for field in ["position: vec3<f32>,", "spawn_time: f32,", "config_index: u32,", "alive: u32,"] {
        assert!(wgsl.contains(field), "missing `{}` in\n{}", field, wgsl);
    }
}
