//! Host-memory backend running the reference kernels.

use std::collections::HashMap;

use bytemuck::Pod;

use super::{
    BufferDesc, BufferHandle, Binding, Dispatch, GpuBackend, IndirectDraw, Kernel, KernelArgs, MaterialId, MeshId,
};
use crate::config::ParticleSystemConfig;
use crate::error::GpuError;
use crate::kernels::{reference, ParticleGpu, SimulationUniforms, DRAW_FIRST_INSTANCE, DRAW_INSTANCE_COUNT};
use crate::pipeline::EmissionTarget;
use crate::spline::SplineInfo;

/// Everything a [`SoftwareBackend`] was asked to do, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Allocate { handle: BufferHandle, label: String, size: u64 },
    Release(BufferHandle),
    Upload { handle: BufferHandle, offset: u64, len: u64 },
    Dispatch { kernel: Kernel, groups: [u32; 3] },
    Draw { mesh: MeshId, material: MaterialId, instances: u32, first_instance: u32 },
    Submit,
}

#[derive(Debug)]
struct HostBuffer {
    words: Vec<u32>,
    size: u64,
}

impl HostBuffer {
    fn bytes_mut(&mut self) -> &mut [u8] {
        let size = self.size as usize;
        &mut bytemuck::cast_slice_mut(&mut self.words)[..size]
    }

    fn view<T: Pod>(&self) -> &[T] {
        let elements = self.size as usize / std::mem::size_of::<T>().max(1);
        let words = elements * std::mem::size_of::<T>() / 4;
        bytemuck::try_cast_slice(&self.words[..words]).unwrap_or(&[])
    }

    fn view_mut<T: Pod>(&mut self) -> &mut [T] {
        let elements = self.size as usize / std::mem::size_of::<T>().max(1);
        let words = elements * std::mem::size_of::<T>() / 4;
        bytemuck::try_cast_slice_mut(&mut self.words[..words]).unwrap_or(&mut [])
    }
}

/// Backend keeping every buffer in host memory.
///
/// Dispatches run [`kernels::reference`](crate::kernels::reference) on the
/// CPU, so a frame driven through this backend produces the same buffer
/// contents as the GPU kernels.
#[derive(Debug, Default)]
pub struct SoftwareBackend {
    buffers: HashMap<u32, HostBuffer>,
    next_handle: u32,
    commands: Vec<Command>,
    memory_limit: Option<u64>,
    allocated: u64,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail allocations once `bytes` are in use.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Bytes held by live buffers.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Buffer contents as whole `T` elements.
    pub fn contents<T: Pod>(&self, handle: BufferHandle) -> Option<&[T]> {
        self.buffers.get(&handle.0).map(|b| b.view())
    }

    /// Run the emission step of `ssfx_emit` on the host.
    ///
    /// Returns whether the particle fit under the emitter's cap.
    pub fn emit(&mut self, target: &EmissionTarget, emitter: u32, particle: ParticleGpu) -> Result<bool, GpuError> {
        let max_counts = self.host(target.max_counts)?.view::<u32>().to_vec();
        let offsets = self.host(target.offsets)?.view::<u32>().to_vec();
        let mut draw_args = self.take(target.draw_args)?;
        let mut particles = match self.take(target.particles) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.buffers.insert(target.draw_args.0, draw_args);
                return Err(e);
            }
        };

        let stored = reference::emit(
            emitter as usize,
            particle,
            particles.view_mut(),
            draw_args.view_mut(),
            &max_counts,
            &offsets,
        );

        self.buffers.insert(target.particles.0, particles);
        self.buffers.insert(target.draw_args.0, draw_args);
        Ok(stored)
    }

    fn host(&self, handle: BufferHandle) -> Result<&HostBuffer, GpuError> {
        self.buffers.get(&handle.0).ok_or(GpuError::UnknownBuffer(handle.0))
    }

    fn take(&mut self, handle: BufferHandle) -> Result<HostBuffer, GpuError> {
        self.buffers.remove(&handle.0).ok_or(GpuError::UnknownBuffer(handle.0))
    }

    fn copy<T: Pod>(&self, kernel: Kernel, args: &KernelArgs, binding: Binding) -> Result<Vec<T>, GpuError> {
        let handle = bound(kernel, args, binding)?;
        Ok(self.host(handle)?.view::<T>().to_vec())
    }

    fn uniforms(&self, kernel: Kernel, args: &KernelArgs) -> Result<SimulationUniforms, GpuError> {
        let handle = bound(kernel, args, Binding::Uniforms)?;
        self.host(handle)?
            .view::<SimulationUniforms>()
            .first()
            .copied()
            .ok_or(GpuError::OutOfBounds {
                offset: 0,
                len: std::mem::size_of::<SimulationUniforms>() as u64,
                size: self.buffer_size(handle).unwrap_or(0),
            })
    }

    fn indirect_groups(&self, buffer: BufferHandle, offset: u64) -> Result<[u32; 3], GpuError> {
        let words = self.host(buffer)?.view::<u32>();
        let start = (offset / 4) as usize;
        match words.get(start..start + 3) {
            Some(w) => Ok([w[0], w[1], w[2]]),
            None => Err(GpuError::OutOfBounds {
                offset,
                len: 12,
                size: words.len() as u64 * 4,
            }),
        }
    }

    fn run(&mut self, kernel: Kernel, args: &KernelArgs) -> Result<(), GpuError> {
        let uniforms = self.uniforms(kernel, args)?;
        match kernel {
            Kernel::SetIndirectArgs => {
                let max_counts: Vec<u32> = self.copy(kernel, args, Binding::MaxCounts)?;
                self.with_buffer(bound(kernel, args, Binding::DispatchArgs)?, |b| {
                    reference::set_indirect_args(&uniforms, &max_counts, b.view_mut())
                })
            }
            Kernel::BufferUnion => {
                let previous: Vec<ParticleGpu> = self.copy(kernel, args, Binding::PreviousParticles)?;
                let max_counts: Vec<u32> = self.copy(kernel, args, Binding::MaxCounts)?;
                let offsets: Vec<u32> = self.copy(kernel, args, Binding::Offsets)?;
                let mut draw_args: Vec<u32> = self.copy(kernel, args, Binding::DrawArgs)?;
                self.with_buffer(bound(kernel, args, Binding::Particles)?, |b| {
                    reference::buffer_union(&uniforms, &previous, b.view_mut(), &mut draw_args, &max_counts, &offsets)
                })?;
                self.with_buffer(bound(kernel, args, Binding::DrawArgs)?, |b| {
                    b.view_mut::<u32>().copy_from_slice(&draw_args)
                })
            }
            Kernel::Simulate => {
                let draw_args: Vec<u32> = self.copy(kernel, args, Binding::DrawArgs)?;
                let max_counts: Vec<u32> = self.copy(kernel, args, Binding::MaxCounts)?;
                let offsets: Vec<u32> = self.copy(kernel, args, Binding::Offsets)?;
                let configs: Vec<ParticleSystemConfig> = self.copy(kernel, args, Binding::Configs)?;
                let spline_positions: Vec<[f32; 4]> = self.copy(kernel, args, Binding::SplinePositions)?;
                let spline_infos: Vec<SplineInfo> = self.copy(kernel, args, Binding::SplineInfos)?;
                let noise: Vec<f32> = self.copy(kernel, args, Binding::Noise)?;
                let inputs = reference::SimulateInputs {
                    draw_args: &draw_args,
                    max_counts: &max_counts,
                    offsets: &offsets,
                    configs: &configs,
                    spline_positions: &spline_positions,
                    spline_infos: &spline_infos,
                    noise: &noise,
                };
                self.with_buffer(bound(kernel, args, Binding::Particles)?, |b| {
                    reference::simulate(&uniforms, b.view_mut(), &inputs)
                })
            }
            Kernel::ClearDrawArgs => self.with_buffer(bound(kernel, args, Binding::DrawArgs)?, |b| {
                reference::clear_draw_args(&uniforms, b.view_mut())
            }),
        }
    }

    fn with_buffer(&mut self, handle: BufferHandle, f: impl FnOnce(&mut HostBuffer)) -> Result<(), GpuError> {
        let buffer = self
            .buffers
            .get_mut(&handle.0)
            .ok_or(GpuError::UnknownBuffer(handle.0))?;
        f(buffer);
        Ok(())
    }
}

fn bound(kernel: Kernel, args: &KernelArgs, binding: Binding) -> Result<BufferHandle, GpuError> {
    args.get(binding).ok_or_else(|| GpuError::MissingBinding {
        kernel: kernel.label().to_string(),
        binding: binding.index(),
    })
}

impl GpuBackend for SoftwareBackend {
    fn allocate(&mut self, desc: &BufferDesc) -> Result<BufferHandle, GpuError> {
        let size = desc.size();
        if size == 0 {
            return Err(GpuError::ZeroSized(desc.label.to_string()));
        }
        if let Some(limit) = self.memory_limit {
            if self.allocated + size > limit {
                return Err(GpuError::OutOfMemory {
                    label: desc.label.to_string(),
                    size,
                    limit,
                });
            }
        }

        self.next_handle += 1;
        let handle = BufferHandle(self.next_handle);
        self.buffers.insert(
            handle.0,
            HostBuffer {
                words: vec![0; size.div_ceil(4) as usize],
                size,
            },
        );
        self.allocated += size;
        self.commands.push(Command::Allocate {
            handle,
            label: desc.label.to_string(),
            size,
        });
        Ok(handle)
    }

    fn release(&mut self, handle: BufferHandle) {
        if let Some(buffer) = self.buffers.remove(&handle.0) {
            self.allocated -= buffer.size;
            self.commands.push(Command::Release(handle));
        }
    }

    fn upload(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), GpuError> {
        let buffer = self
            .buffers
            .get_mut(&handle.0)
            .ok_or(GpuError::UnknownBuffer(handle.0))?;
        let len = data.len() as u64;
        if offset + len > buffer.size {
            return Err(GpuError::OutOfBounds {
                offset,
                len,
                size: buffer.size,
            });
        }
        buffer.bytes_mut()[offset as usize..(offset + len) as usize].copy_from_slice(data);
        self.commands.push(Command::Upload { handle, offset, len });
        Ok(())
    }

    fn dispatch(&mut self, kernel: Kernel, args: &KernelArgs, dispatch: Dispatch) -> Result<(), GpuError> {
        let groups = match dispatch {
            Dispatch::Direct { x, y, z } => [x, y, z],
            Dispatch::Indirect { buffer, offset } => self.indirect_groups(buffer, offset)?,
        };
        self.commands.push(Command::Dispatch { kernel, groups });
        if groups.iter().any(|&g| g == 0) {
            return Ok(());
        }
        self.run(kernel, args)
    }

    fn draw_indirect(&mut self, draw: &IndirectDraw) -> Result<(), GpuError> {
        let words = self.host(draw.args)?.view::<u32>();
        let base = (draw.offset / 4) as usize;
        let record = words.get(base..base + 5).ok_or(GpuError::OutOfBounds {
            offset: draw.offset,
            len: 20,
            size: words.len() as u64 * 4,
        })?;
        let command = Command::Draw {
            mesh: draw.mesh,
            material: draw.material,
            instances: record[DRAW_INSTANCE_COUNT],
            first_instance: record[DRAW_FIRST_INSTANCE],
        };
        self.commands.push(command);
        Ok(())
    }

    fn read(&mut self, handle: BufferHandle, offset: u64, len: u64) -> Result<Vec<u8>, GpuError> {
        let buffer = self.host(handle)?;
        if offset + len > buffer.size {
            return Err(GpuError::OutOfBounds {
                offset,
                len,
                size: buffer.size,
            });
        }
        let bytes: &[u8] = bytemuck::cast_slice(&buffer.words);
        Ok(bytes[offset as usize..(offset + len) as usize].to_vec())
    }

    fn buffer_size(&self, handle: BufferHandle) -> Option<u64> {
        self.buffers.get(&handle.0).map(|b| b.size)
    }

    fn submit(&mut self) {
        self.commands.push(Command::Submit);
    }
}

/// Wraps a [`SoftwareBackend`] and rejects the next `n` uploads.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RejectingUploads {
    pub inner: SoftwareBackend,
    pub reject: u32,
}

#[cfg(test)]
impl GpuBackend for RejectingUploads {
    fn allocate(&mut self, desc: &BufferDesc) -> Result<BufferHandle, GpuError> {
        self.inner.allocate(desc)
    }

    fn release(&mut self, handle: BufferHandle) {
        self.inner.release(handle)
    }

    fn upload(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), GpuError> {
        if self.reject > 0 {
            self.reject -= 1;
            return Err(GpuError::UnknownBuffer(handle.0));
        }
        self.inner.upload(handle, offset, data)
    }

    fn dispatch(&mut self, kernel: Kernel, args: &KernelArgs, dispatch: Dispatch) -> Result<(), GpuError> {
        self.inner.dispatch(kernel, args, dispatch)
    }

    fn draw_indirect(&mut self, draw: &IndirectDraw) -> Result<(), GpuError> {
        self.inner.draw_indirect(draw)
    }

    fn read(&mut self, handle: BufferHandle, offset: u64, len: u64) -> Result<Vec<u8>, GpuError> {
        self.inner.read(handle, offset, len)
    }

    fn buffer_size(&self, handle: BufferHandle) -> Option<u64> {
        self.inner.buffer_size(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_zeroed_and_sized() {
        let mut backend = SoftwareBackend::new();
        let h = backend.allocate(&BufferDesc::storage("a", 3, 8)).expect("allocate");
        assert_eq!(backend.buffer_size(h), Some(24));
        assert_eq!(backend.read(h, 0, 24).expect("read"), vec![0u8; 24]);
        assert_eq!(backend.allocated_bytes(), 24);
        backend.release(h);
        assert_eq!(backend.allocated_bytes(), 0);
        assert_eq!(backend.buffer_size(h), None);
    }

    #[test]
    fn test_memory_limit() {
        let mut backend = SoftwareBackend::new().with_memory_limit(100);
        backend.allocate(&BufferDesc::storage("a", 20, 4)).expect("allocate");
        let err = backend.allocate(&BufferDesc::storage("b", 20, 4)).unwrap_err();
        assert!(matches!(err, GpuError::OutOfMemory { size: 80, limit: 100, .. }));
    }

    #[test]
    fn test_zero_sized_allocation() {
        let mut backend = SoftwareBackend::new();
        let err = backend.allocate(&BufferDesc::storage("empty", 0, 96)).unwrap_err();
        assert!(matches!(err, GpuError::ZeroSized(_)));
    }

    #[test]
    fn test_upload_bounds() {
        let mut backend = SoftwareBackend::new();
        let h = backend.allocate(&BufferDesc::indirect("args", 4)).expect("allocate");
        backend.upload(h, 4, bytemuck::cast_slice(&[7u32, 9])).expect("upload");
        assert_eq!(backend.contents::<u32>(h), Some(&[0, 7, 9, 0][..]));
        assert!(backend.upload(h, 12, &[0; 8]).is_err());
        assert!(backend.upload(BufferHandle(99), 0, &[0; 4]).is_err());
    }

    #[test]
    fn test_indirect_dispatch_with_zero_groups_is_skipped() {
        let mut backend = SoftwareBackend::new();
        let args = backend.allocate(&BufferDesc::indirect("dispatch", 6)).expect("allocate");
        // No bindings: running the kernel would fail.
        backend
            .dispatch(
                Kernel::Simulate,
                &KernelArgs::new(),
                Dispatch::Indirect { buffer: args, offset: 12 },
            )
            .expect("skipped");
        assert_eq!(
            backend.commands().last(),
            Some(&Command::Dispatch {
                kernel: Kernel::Simulate,
                groups: [0, 0, 0]
            })
        );
    }

    #[test]
    fn test_missing_binding() {
        let mut backend = SoftwareBackend::new();
        let err = backend
            .dispatch(Kernel::ClearDrawArgs, &KernelArgs::new(), Dispatch::single())
            .unwrap_err();
        assert!(matches!(err, GpuError::MissingBinding { binding: 0, .. }));
    }
}
