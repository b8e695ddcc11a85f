//! GPU backend abstraction.
//!
//! The pipeline and registries never touch a graphics API directly. They
//! drive a [`GpuBackend`], which exposes the handful of operations the frame
//! sequence needs: allocate, release, upload, dispatch, indirect draw.
//!
//! Two backends ship with the crate:
//!
//! - [`SoftwareBackend`] keeps buffers in host memory and runs reference
//!   kernels on the CPU. It records every command, which makes it the
//!   backend of choice for tests and headless tooling.
//! - [`WgpuBackend`] records real compute and render passes with `wgpu`.

mod software;
mod wgpu_backend;

pub use software::{Command, SoftwareBackend};
#[cfg(test)]
pub(crate) use software::RejectingUploads;
pub use wgpu_backend::{EmissionKernelId, MaterialBinding, WgpuBackend};

use crate::error::GpuError;

/// Opaque name of a buffer owned by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u32);

impl BufferHandle {
    pub fn id(&self) -> u32 {
        self.0
    }
}

/// Mesh registered with a backend, drawn once per live particle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct MeshId(pub u32);

/// Material (render pipeline and its bindings) registered with a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct MaterialId(pub u32);

/// How a buffer is bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    /// Read/write structured storage.
    Storage,
    /// Small constant block.
    Uniform,
    /// Storage that is also read as indirect draw/dispatch arguments.
    Indirect,
}

/// Allocation request: `count` elements of `stride` bytes.
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub count: u32,
    pub stride: u32,
    pub kind: BufferKind,
}

impl<'a> BufferDesc<'a> {
    pub fn storage(label: &'a str, count: u32, stride: u32) -> Self {
        Self { label, count, stride, kind: BufferKind::Storage }
    }

    pub fn uniform(label: &'a str, size: u32) -> Self {
        Self { label, count: 1, stride: size, kind: BufferKind::Uniform }
    }

    pub fn indirect(label: &'a str, words: u32) -> Self {
        Self { label, count: words, stride: 4, kind: BufferKind::Indirect }
    }

    pub fn size(&self) -> u64 {
        self.count as u64 * self.stride as u64
    }
}

/// The built-in compute kernels, in frame order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kernel {
    SetIndirectArgs,
    BufferUnion,
    Simulate,
    ClearDrawArgs,
}

impl Kernel {
    pub const ALL: [Kernel; 4] = [
        Kernel::SetIndirectArgs,
        Kernel::BufferUnion,
        Kernel::Simulate,
        Kernel::ClearDrawArgs,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Kernel::SetIndirectArgs => "SetIndirectArgs",
            Kernel::BufferUnion => "BufferUnion",
            Kernel::Simulate => "Simulate",
            Kernel::ClearDrawArgs => "ClearDrawArgs",
        }
    }
}

/// Resource slots shared by all kernels. Each maps to a fixed
/// `@binding` index in group 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Binding {
    Uniforms,
    Particles,
    PreviousParticles,
    DrawArgs,
    DispatchArgs,
    MaxCounts,
    Offsets,
    Configs,
    SplinePositions,
    SplineInfos,
    Noise,
}

impl Binding {
    pub fn index(&self) -> u32 {
        match self {
            Binding::Uniforms => 0,
            Binding::Particles => 1,
            Binding::PreviousParticles => 2,
            Binding::DrawArgs => 3,
            Binding::DispatchArgs => 4,
            Binding::MaxCounts => 5,
            Binding::Offsets => 6,
            Binding::Configs => 7,
            Binding::SplinePositions => 8,
            Binding::SplineInfos => 9,
            Binding::Noise => 10,
        }
    }
}

/// Buffers bound for one dispatch.
#[derive(Clone, Debug, Default)]
pub struct KernelArgs {
    bindings: Vec<(Binding, BufferHandle)>,
}

impl KernelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, binding: Binding, buffer: BufferHandle) -> Self {
        self.bindings.retain(|(b, _)| *b != binding);
        self.bindings.push((binding, buffer));
        self
    }

    pub fn get(&self, binding: Binding) -> Option<BufferHandle> {
        self.bindings.iter().find(|(b, _)| *b == binding).map(|(_, h)| *h)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Binding, BufferHandle)> {
        self.bindings.iter()
    }
}

/// Workgroup counts of a dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Counts known on the host.
    Direct { x: u32, y: u32, z: u32 },
    /// Counts read from `buffer` at byte `offset` (three `u32`).
    Indirect { buffer: BufferHandle, offset: u64 },
}

impl Dispatch {
    pub fn single() -> Self {
        Dispatch::Direct { x: 1, y: 1, z: 1 }
    }
}

/// An instanced indexed draw whose arguments live in a GPU buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndirectDraw {
    pub mesh: MeshId,
    pub material: MaterialId,
    /// Draw-args buffer and byte offset of this emitter's 5-word record.
    pub args: BufferHandle,
    pub offset: u64,
    /// Particle buffer the material reads instance data from.
    pub particles: BufferHandle,
}

/// Buffer and compute operations the pipeline is driven through.
pub trait GpuBackend {
    /// Create a zero-initialized buffer.
    fn allocate(&mut self, desc: &BufferDesc) -> Result<BufferHandle, GpuError>;

    /// Destroy a buffer. Releasing an unknown handle is a no-op.
    fn release(&mut self, handle: BufferHandle);

    /// Write `data` at byte `offset`.
    fn upload(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), GpuError>;

    /// Record a compute dispatch.
    fn dispatch(&mut self, kernel: Kernel, args: &KernelArgs, dispatch: Dispatch) -> Result<(), GpuError>;

    /// Record an indirect instanced draw.
    fn draw_indirect(&mut self, draw: &IndirectDraw) -> Result<(), GpuError>;

    /// Copy `len` bytes back to the host, flushing pending work first.
    fn read(&mut self, handle: BufferHandle, offset: u64, len: u64) -> Result<Vec<u8>, GpuError>;

    /// Size in bytes of a live buffer.
    fn buffer_size(&self, handle: BufferHandle) -> Option<u64>;

    /// Hand recorded work to the device. Called once at the end of a frame.
    fn submit(&mut self) {}
}

/// Number of workgroups of `size` needed to cover `count` invocations.
pub fn workgroups(count: u32, size: u32) -> u32 {
    count.div_ceil(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_args_rebind_replaces() {
        let args = KernelArgs::new()
            .bind(Binding::Particles, BufferHandle(1))
            .bind(Binding::Particles, BufferHandle(2));
        assert_eq!(args.get(Binding::Particles), Some(BufferHandle(2)));
        assert_eq!(args.iter().count(), 1);
        assert_eq!(args.get(Binding::Noise), None);
    }

    #[test]
    fn test_binding_indices_unique() {
        let all = [
            Binding::Uniforms,
            Binding::Particles,
            Binding::PreviousParticles,
            Binding::DrawArgs,
            Binding::DispatchArgs,
            Binding::MaxCounts,
            Binding::Offsets,
            Binding::Configs,
            Binding::SplinePositions,
            Binding::SplineInfos,
            Binding::Noise,
        ];
        let mut seen: Vec<u32> = all.iter().map(|b| b.index()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), all.len());
    }

    #[test]
    fn test_workgroups() {
        assert_eq!(workgroups(0, 64), 0);
        assert_eq!(workgroups(1, 64), 1);
        assert_eq!(workgroups(64, 64), 1);
        assert_eq!(workgroups(257, 256), 2);
    }
}
