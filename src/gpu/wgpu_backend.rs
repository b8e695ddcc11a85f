//! `wgpu` implementation of [`GpuBackend`].

use std::collections::HashMap;

use wgpu::util::DeviceExt;

use super::{
    BufferDesc, BufferHandle, BufferKind, Binding, Dispatch, GpuBackend, IndirectDraw, Kernel, KernelArgs, MaterialId,
    MeshId,
};
use crate::error::GpuError;
use crate::kernels::{self, emission_prelude, Access, KernelSource};
use crate::pipeline::EmissionTarget;

/// Render pipeline drawing one emitter's particles.
///
/// The vertex stage reads particles from a storage buffer at group 0,
/// binding 0, indexed by `@builtin(instance_index)`. Indirect draws start
/// at the emitter's slot offset, so the index is already absolute.
pub struct MaterialBinding {
    pub pipeline: wgpu::RenderPipeline,
    /// Layout of group 0 (binding 0: `array<ParticleGpu>`, read-only).
    pub particles_layout: wgpu::BindGroupLayout,
}

/// An emission kernel registered with [`WgpuBackend::create_emission_kernel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EmissionKernelId(usize);

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

struct Mesh {
    vertices: wgpu::Buffer,
    indices: wgpu::Buffer,
}

struct ComputeKernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    bindings: Vec<(Binding, Access)>,
    label: String,
}

struct RenderTarget {
    color: wgpu::TextureView,
    depth: Option<wgpu::TextureView>,
}

/// Backend recording compute and render passes on a `wgpu` device.
///
/// Work is recorded into one command encoder and submitted by
/// [`submit`](GpuBackend::submit) at the end of each frame. Draws are
/// batched into a single render pass that loads the current target
/// contents.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    buffers: HashMap<u32, GpuBuffer>,
    next_handle: u32,
    kernels: HashMap<Kernel, ComputeKernel>,
    emission_kernels: Vec<ComputeKernel>,
    meshes: Vec<Mesh>,
    materials: Vec<MaterialBinding>,
    target: Option<RenderTarget>,
    encoder: Option<wgpu::CommandEncoder>,
    pending_draws: Vec<IndirectDraw>,
}

impl WgpuBackend {
    /// Create a headless backend on the default adapter.
    pub fn new() -> Result<Self, GpuError> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuError::NoAdapter)?;

        let mut required_features = wgpu::Features::empty();
        if adapter.features().contains(wgpu::Features::INDIRECT_FIRST_INSTANCE) {
            required_features |= wgpu::Features::INDIRECT_FIRST_INSTANCE;
        } else {
            log::warn!("[ssfx] adapter lacks INDIRECT_FIRST_INSTANCE; every emitter draws from slot 0");
        }

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("SSFX Device"),
                    required_features,
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await?;

        log::info!("[ssfx] using adapter {}", adapter.get_info().name);
        Self::from_device(device, queue)
    }

    /// Wrap a device owned by the host renderer.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Result<Self, GpuError> {
        device.on_uncaptured_error(Box::new(|e: wgpu::Error| log::error!("[ssfx] uncaptured wgpu error: {}", e)));

        let mut backend = Self {
            device,
            queue,
            buffers: HashMap::new(),
            next_handle: 0,
            kernels: HashMap::new(),
            emission_kernels: Vec::new(),
            meshes: Vec::new(),
            materials: Vec::new(),
            target: None,
            encoder: None,
            pending_draws: Vec::new(),
        };
        for kernel in Kernel::ALL {
            let compiled = backend.compile(&kernels::source(kernel))?;
            backend.kernels.insert(kernel, compiled);
        }
        Ok(backend)
    }

    /// Replace a built-in kernel, typically the simulation with
    /// [`KernelSource::custom_simulate`].
    pub fn with_kernel_override(mut self, kernel: Kernel, source: &KernelSource) -> Result<Self, GpuError> {
        let compiled = self.compile(source)?;
        self.kernels.insert(kernel, compiled);
        Ok(self)
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The `wgpu` buffer behind `handle`, for binding it in host materials.
    pub fn raw_buffer(&self, handle: BufferHandle) -> Option<&wgpu::Buffer> {
        self.buffers.get(&handle.0).map(|b| &b.buffer)
    }

    /// Upload a mesh drawn once per particle. Indices are `u32`.
    pub fn register_mesh(&mut self, vertices: &[u8], indices: &[u32]) -> MeshId {
        let vertices = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Particle Mesh Vertices"),
            contents: vertices,
            usage: wgpu::BufferUsages::VERTEX,
        });
        let indices = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Particle Mesh Indices"),
            contents: bytemuck::cast_slice(indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        self.meshes.push(Mesh { vertices, indices });
        MeshId(self.meshes.len() as u32 - 1)
    }

    pub fn register_material(&mut self, material: MaterialBinding) -> MaterialId {
        self.materials.push(material);
        MaterialId(self.materials.len() as u32 - 1)
    }

    /// Where draws land. Both attachments are loaded, not cleared.
    pub fn set_target(&mut self, color: wgpu::TextureView, depth: Option<wgpu::TextureView>) {
        self.target = Some(RenderTarget { color, depth });
    }

    /// Compile an emission kernel. `body` is appended to
    /// [`emission_prelude`] and must define `@compute fn main`.
    pub fn create_emission_kernel(&mut self, label: &str, body: &str) -> Result<EmissionKernelId, GpuError> {
        let source = KernelSource::new(
            label,
            format!("{}\n{}", emission_prelude(), body),
            vec![
                (Binding::Uniforms, Access::Uniform),
                (Binding::Particles, Access::ReadWrite),
                (Binding::DrawArgs, Access::ReadWrite),
                (Binding::MaxCounts, Access::ReadOnly),
                (Binding::Offsets, Access::ReadOnly),
            ],
        );
        let compiled = self.compile(&source)?;
        self.emission_kernels.push(compiled);
        Ok(EmissionKernelId(self.emission_kernels.len() - 1))
    }

    /// Record an emission dispatch against this frame's buffers.
    pub fn dispatch_emission(
        &mut self,
        kernel: EmissionKernelId,
        target: &EmissionTarget,
        groups: [u32; 3],
    ) -> Result<(), GpuError> {
        let args = KernelArgs::new()
            .bind(Binding::Uniforms, target.uniforms)
            .bind(Binding::Particles, target.particles)
            .bind(Binding::DrawArgs, target.draw_args)
            .bind(Binding::MaxCounts, target.max_counts)
            .bind(Binding::Offsets, target.offsets);
        let compiled = self.emission_kernels.get(kernel.0).ok_or_else(|| GpuError::InvalidKernel {
            label: format!("emission #{}", kernel.0),
            message: "not registered".into(),
        })?;
        let bind_group = bind_kernel(&self.device, &self.buffers, compiled, &args)?;
        flush_draws(&self.device, &mut self.encoder, &mut self.pending_draws, self.target.as_ref(), &self.meshes, &self.materials, &self.buffers);
        let encoder = encoder(&self.device, &mut self.encoder);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(&compiled.label),
            timestamp_writes: None,
        });
        pass.set_pipeline(&compiled.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        Ok(())
    }

    fn compile(&self, source: &KernelSource) -> Result<ComputeKernel, GpuError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&source.label),
            source: wgpu::ShaderSource::Wgsl(source.wgsl.as_str().into()),
        });

        let entries: Vec<wgpu::BindGroupLayoutEntry> = source
            .bindings
            .iter()
            .map(|(binding, access)| wgpu::BindGroupLayoutEntry {
                binding: binding.index(),
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: match access {
                        Access::Uniform => wgpu::BufferBindingType::Uniform,
                        Access::ReadOnly => wgpu::BufferBindingType::Storage { read_only: true },
                        Access::ReadWrite => wgpu::BufferBindingType::Storage { read_only: false },
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&source.label),
            entries: &entries,
        });

        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&source.label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&source.label),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::InvalidKernel {
                label: source.label.clone(),
                message: error.to_string(),
            });
        }

        Ok(ComputeKernel {
            pipeline,
            layout,
            bindings: source.bindings.clone(),
            label: source.label.clone(),
        })
    }

    fn flush(&mut self) {
        flush_draws(
            &self.device,
            &mut self.encoder,
            &mut self.pending_draws,
            self.target.as_ref(),
            &self.meshes,
            &self.materials,
            &self.buffers,
        );
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }
}

fn encoder<'a>(device: &wgpu::Device, slot: &'a mut Option<wgpu::CommandEncoder>) -> &'a mut wgpu::CommandEncoder {
    slot.get_or_insert_with(|| {
        device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("SSFX Frame Encoder"),
        })
    })
}

fn bind_kernel(
    device: &wgpu::Device,
    buffers: &HashMap<u32, GpuBuffer>,
    kernel: &ComputeKernel,
    args: &KernelArgs,
) -> Result<wgpu::BindGroup, GpuError> {
    let mut entries = Vec::with_capacity(kernel.bindings.len());
    for (binding, _) in &kernel.bindings {
        let handle = args.get(*binding).ok_or_else(|| GpuError::MissingBinding {
            kernel: kernel.label.clone(),
            binding: binding.index(),
        })?;
        let buffer = buffers.get(&handle.0).ok_or(GpuError::UnknownBuffer(handle.0))?;
        entries.push(wgpu::BindGroupEntry {
            binding: binding.index(),
            resource: buffer.buffer.as_entire_binding(),
        });
    }
    Ok(device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(&kernel.label),
        layout: &kernel.layout,
        entries: &entries,
    }))
}

fn flush_draws(
    device: &wgpu::Device,
    slot: &mut Option<wgpu::CommandEncoder>,
    pending: &mut Vec<IndirectDraw>,
    target: Option<&RenderTarget>,
    meshes: &[Mesh],
    materials: &[MaterialBinding],
    buffers: &HashMap<u32, GpuBuffer>,
) {
    if pending.is_empty() {
        return;
    }
    let draws = std::mem::take(pending);
    let Some(target) = target else {
        log::warn!("[ssfx] {} particle draws dropped: no render target set", draws.len());
        return;
    };

    let mut prepared = Vec::with_capacity(draws.len());
    for draw in &draws {
        let mesh = meshes.get(draw.mesh.0 as usize);
        let material = materials.get(draw.material.0 as usize);
        let particles = buffers.get(&draw.particles.0);
        let args = buffers.get(&draw.args.0);
        let (Some(mesh), Some(material), Some(particles), Some(args)) = (mesh, material, particles, args) else {
            log::warn!("[ssfx] skipping draw with missing mesh, material or buffer: {:?}", draw);
            continue;
        };
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Particle Material Bind Group"),
            layout: &material.particles_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: particles.buffer.as_entire_binding(),
            }],
        });
        prepared.push((mesh, material, bind_group, &args.buffer, draw.offset));
    }

    let encoder = encoder(device, slot);
    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("SSFX Particles Pass"),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view: &target.color,
            resolve_target: None,
            ops: wgpu::Operations {
                load: wgpu::LoadOp::Load,
                store: wgpu::StoreOp::Store,
            },
        })],
        depth_stencil_attachment: target.depth.as_ref().map(|view| wgpu::RenderPassDepthStencilAttachment {
            view,
            depth_ops: Some(wgpu::Operations {
                load: wgpu::LoadOp::Load,
                store: wgpu::StoreOp::Store,
            }),
            stencil_ops: None,
        }),
        timestamp_writes: None,
        occlusion_query_set: None,
    });

    for (mesh, material, bind_group, args, offset) in &prepared {
        pass.set_pipeline(&material.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.set_vertex_buffer(0, mesh.vertices.slice(..));
        pass.set_index_buffer(mesh.indices.slice(..), wgpu::IndexFormat::Uint32);
        pass.draw_indexed_indirect(args, *offset);
    }
}

impl GpuBackend for WgpuBackend {
    fn allocate(&mut self, desc: &BufferDesc) -> Result<BufferHandle, GpuError> {
        let size = desc.size();
        if size == 0 {
            return Err(GpuError::ZeroSized(desc.label.to_string()));
        }
        let limits = self.device.limits();
        let limit = match desc.kind {
            BufferKind::Uniform => limits.max_uniform_buffer_binding_size as u64,
            BufferKind::Storage | BufferKind::Indirect => limits.max_storage_buffer_binding_size as u64,
        }
        .min(limits.max_buffer_size);
        if size > limit {
            return Err(GpuError::OutOfMemory {
                label: desc.label.to_string(),
                size,
                limit,
            });
        }

        let usage = match desc.kind {
            BufferKind::Storage => {
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC
            }
            BufferKind::Uniform => wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            BufferKind::Indirect => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::INDIRECT
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC
            }
        };

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size,
            usage,
            mapped_at_creation: false,
        });
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(GpuError::OutOfMemory {
                label: desc.label.to_string(),
                size,
                limit,
            });
        }

        self.next_handle += 1;
        let handle = BufferHandle(self.next_handle);
        self.buffers.insert(handle.0, GpuBuffer { buffer, size });
        log::trace!("[ssfx] allocated `{}` ({} bytes) as {:?}", desc.label, size, handle);
        Ok(handle)
    }

    fn release(&mut self, handle: BufferHandle) {
        if let Some(buffer) = self.buffers.remove(&handle.0) {
            buffer.buffer.destroy();
        }
    }

    fn upload(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), GpuError> {
        let buffer = self.buffers.get(&handle.0).ok_or(GpuError::UnknownBuffer(handle.0))?;
        let len = data.len() as u64;
        if offset + len > buffer.size {
            return Err(GpuError::OutOfBounds {
                offset,
                len,
                size: buffer.size,
            });
        }
        self.queue.write_buffer(&buffer.buffer, offset, data);
        Ok(())
    }

    fn dispatch(&mut self, kernel: Kernel, args: &KernelArgs, dispatch: Dispatch) -> Result<(), GpuError> {
        let compiled = self.kernels.get(&kernel).ok_or_else(|| GpuError::InvalidKernel {
            label: kernel.label().to_string(),
            message: "not compiled".into(),
        })?;
        let bind_group = bind_kernel(&self.device, &self.buffers, compiled, args)?;
        let indirect = match dispatch {
            Dispatch::Indirect { buffer, offset } => {
                let raw = self.buffers.get(&buffer.0).ok_or(GpuError::UnknownBuffer(buffer.0))?;
                Some((&raw.buffer, offset))
            }
            Dispatch::Direct { .. } => None,
        };

        flush_draws(
            &self.device,
            &mut self.encoder,
            &mut self.pending_draws,
            self.target.as_ref(),
            &self.meshes,
            &self.materials,
            &self.buffers,
        );
        let encoder = encoder(&self.device, &mut self.encoder);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(kernel.label()),
            timestamp_writes: None,
        });
        pass.set_pipeline(&compiled.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        match (dispatch, indirect) {
            (_, Some((buffer, offset))) => pass.dispatch_workgroups_indirect(buffer, offset),
            (Dispatch::Direct { x, y, z }, None) => pass.dispatch_workgroups(x, y, z),
            (Dispatch::Indirect { .. }, None) => {}
        }
        Ok(())
    }

    fn draw_indirect(&mut self, draw: &IndirectDraw) -> Result<(), GpuError> {
        if !self.buffers.contains_key(&draw.args.0) {
            return Err(GpuError::UnknownBuffer(draw.args.0));
        }
        self.pending_draws.push(*draw);
        Ok(())
    }

    fn read(&mut self, handle: BufferHandle, offset: u64, len: u64) -> Result<Vec<u8>, GpuError> {
        self.flush();

        let buffer = self.buffers.get(&handle.0).ok_or(GpuError::UnknownBuffer(handle.0))?;
        if offset + len > buffer.size {
            return Err(GpuError::OutOfBounds {
                offset,
                len,
                size: buffer.size,
            });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        // Copies must start and end on 4-byte boundaries.
        let start = offset & !3;
        let end = ((offset + len + 3) & !3).min(buffer.size);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("SSFX Readback"),
            size: end - start,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut copy = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("SSFX Readback Encoder"),
        });
        copy.copy_buffer_to_buffer(&buffer.buffer, start, &staging, 0, end - start);
        self.queue.submit(std::iter::once(copy.finish()));

        let (sender, receiver) = crossbeam_channel::bounded(1);
        let slice = staging.slice(..);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(GpuError::BufferMapping(e.to_string())),
            Err(e) => return Err(GpuError::BufferMapping(e.to_string())),
        }

        let bytes = {
            let data = slice.get_mapped_range();
            let skip = (offset - start) as usize;
            data[skip..skip + len as usize].to_vec()
        };
        staging.unmap();
        Ok(bytes)
    }

    fn buffer_size(&self, handle: BufferHandle) -> Option<u64> {
        self.buffers.get(&handle.0).map(|b| b.size)
    }

    fn submit(&mut self) {
        self.flush();
    }
}
