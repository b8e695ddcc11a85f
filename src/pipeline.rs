//! The per-frame particle buffer pipeline.
//!
//! Every emitter owns a fixed slice of two particle buffers that swap roles
//! each frame. A frame runs, in this order and only through
//! [`ParticleBufferPipeline::run_frame`]:
//!
//! 1. **EnsureCapacity**: (re)allocate the buffer set when an emitter's
//!    capacity changed. Reallocation drops every live particle; a mesh swap
//!    only rewrites the index counts.
//! 2. **Emission**: the caller's closure appends spawns to the current
//!    buffer and counts them in draw-args word 5.
//! 3. **SetIndirectArgs**: size the union and simulation dispatches.
//! 4. **BufferUnion**: merge last frame's survivors with this frame's spawns
//!    under the emitter cap and write the live count to draw-args word 1.
//! 5. **Simulate**: age, move and kill particles.
//! 6. **Render**: one indexed indirect draw per emitter.
//! 7. **Swap**: the current buffer becomes the previous one; frame += 1.
//! 8. **ClearDrawArgs**: zero the per-frame words for the next frame.

use crate::context::EffectContext;
use crate::error::{Error, Result};
use crate::gpu::{
    workgroups, Binding, BufferDesc, BufferHandle, Dispatch, GpuBackend, IndirectDraw, Kernel, KernelArgs,
};
use crate::kernels::{
    ParticleGpu, SimulationUniforms, CLEAR_WORKGROUP_SIZE, DISPATCH_ARGS_WORDS, DRAW_ARGS_STRIDE, DRAW_FIRST_INSTANCE,
    DRAW_INDEX_COUNT, DRAW_INSTANCE_COUNT, SIMULATE_ARGS_OFFSET, UNION_ARGS_OFFSET,
};
use crate::noise::NoiseMap;
use crate::settings::{EmitterSlot, PipelineSettings};
use crate::GpuStruct;

/// Bytes of one emitter's draw-args record.
pub const DRAW_ARGS_BYTES: u64 = DRAW_ARGS_STRIDE as u64 * 4;

/// A step of [`ParticleBufferPipeline::run_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    EnsureCapacity,
    Emission,
    SetIndirectArgs,
    BufferUnion,
    Simulate,
    Render,
    Swap,
    ClearDrawArgs,
}

/// What a frame did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameReport {
    /// Index of the frame that ran, before the swap incremented it.
    pub frame: u32,
    pub stages: Vec<Stage>,
    /// Total particle slots.
    pub capacity: u32,
    /// The buffer set was (re)created this frame.
    pub reallocated: bool,
    pub draws: u32,
}

impl FrameReport {
    /// A frame that ran no stage.
    pub fn is_noop(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Buffers an emission pass writes to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EmissionTarget {
    /// Current particle buffer.
    pub particles: BufferHandle,
    pub draw_args: BufferHandle,
    pub max_counts: BufferHandle,
    pub offsets: BufferHandle,
    pub uniforms: BufferHandle,
    pub emitter_count: u32,
    pub capacity: u32,
    pub time: f32,
    pub delta_time: f32,
}

/// Particle, argument and constant buffers of one emitter layout.
#[derive(Debug)]
pub struct ParticleBufferSet {
    current: BufferHandle,
    previous: BufferHandle,
    draw_args: BufferHandle,
    dispatch_args: BufferHandle,
    max_counts: BufferHandle,
    offsets: BufferHandle,
    uniforms: BufferHandle,
    layout: Vec<EmitterSlot>,
    capacity: u32,
    frame: u32,
}

impl ParticleBufferSet {
    /// Allocate and initialize the buffers for `layout`.
    ///
    /// On failure every buffer created so far is released.
    pub fn allocate<B: GpuBackend + ?Sized>(backend: &mut B, layout: &[EmitterSlot]) -> Result<Self> {
        let emitters = layout.len() as u32;
        let capacity: u32 = layout.iter().map(|e| e.max_particles).sum();

        let descs = [
            BufferDesc::storage("Particles A", capacity, ParticleGpu::GPU_SIZE),
            BufferDesc::storage("Particles B", capacity, ParticleGpu::GPU_SIZE),
            BufferDesc::indirect("Particle Draw Args", emitters * DRAW_ARGS_STRIDE),
            BufferDesc::indirect("Particle Dispatch Args", DISPATCH_ARGS_WORDS),
            BufferDesc::storage("Particle Max Counts", emitters, 4),
            BufferDesc::storage("Particle Offsets", emitters, 4),
            BufferDesc::uniform("Simulation Uniforms", SimulationUniforms::GPU_SIZE),
        ];
        let mut handles = Vec::with_capacity(descs.len());
        for desc in &descs {
            match backend.allocate(desc) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        backend.release(handle);
                    }
                    return Err(Error::allocation(e));
                }
            }
        }

        let set = Self {
            current: handles[0],
            previous: handles[1],
            draw_args: handles[2],
            dispatch_args: handles[3],
            max_counts: handles[4],
            offsets: handles[5],
            uniforms: handles[6],
            layout: layout.to_vec(),
            capacity,
            frame: 0,
        };

        let offsets: Vec<u32> = layout
            .iter()
            .scan(0, |start, e| {
                let offset = *start;
                *start += e.max_particles;
                Some(offset)
            })
            .collect();
        let max_counts: Vec<u32> = layout.iter().map(|e| e.max_particles).collect();
        let mut draw_args = vec![0u32; (emitters * DRAW_ARGS_STRIDE) as usize];
        for (e, slot) in layout.iter().enumerate() {
            let record = &mut draw_args[e * DRAW_ARGS_STRIDE as usize..][..DRAW_ARGS_STRIDE as usize];
            record[DRAW_INDEX_COUNT] = slot.index_count;
            record[DRAW_FIRST_INSTANCE] = offsets[e];
        }

        let uploads: [(BufferHandle, &[u32]); 3] = [
            (set.draw_args, &draw_args),
            (set.max_counts, &max_counts),
            (set.offsets, &offsets),
        ];
        for (handle, words) in uploads {
            if let Err(e) = backend.upload(handle, 0, bytemuck::cast_slice(words)) {
                set.release(backend);
                return Err(e.into());
            }
        }
        Ok(set)
    }

    pub fn release<B: GpuBackend + ?Sized>(&self, backend: &mut B) {
        for handle in [
            self.current,
            self.previous,
            self.draw_args,
            self.dispatch_args,
            self.max_counts,
            self.offsets,
            self.uniforms,
        ] {
            backend.release(handle);
        }
    }

    /// Buffer written by this frame's emission and union.
    pub fn current(&self) -> BufferHandle {
        self.current
    }

    /// Buffer holding last frame's live particles.
    pub fn previous(&self) -> BufferHandle {
        self.previous
    }

    pub fn draw_args(&self) -> BufferHandle {
        self.draw_args
    }

    pub fn dispatch_args(&self) -> BufferHandle {
        self.dispatch_args
    }

    pub fn max_counts(&self) -> BufferHandle {
        self.max_counts
    }

    pub fn offsets(&self) -> BufferHandle {
        self.offsets
    }

    pub fn uniforms(&self) -> BufferHandle {
        self.uniforms
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn emitter_count(&self) -> u32 {
        self.layout.len() as u32
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    fn matches(&self, layout: &[EmitterSlot]) -> bool {
        self.layout.len() == layout.len()
            && self
                .layout
                .iter()
                .zip(layout)
                .all(|(a, b)| a.max_particles == b.max_particles)
    }

    /// Adopt `layout`'s meshes and materials, rewriting index counts that changed.
    fn refresh_meshes<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, layout: &[EmitterSlot]) -> Result<()> {
        for (e, (old, new)) in self.layout.iter().zip(layout).enumerate() {
            if old.index_count != new.index_count {
                let offset = e as u64 * DRAW_ARGS_BYTES + DRAW_INDEX_COUNT as u64 * 4;
                backend.upload(self.draw_args, offset, bytemuck::bytes_of(&new.index_count))?;
            }
        }
        self.layout.copy_from_slice(layout);
        Ok(())
    }

    fn swap(&mut self) {
        std::mem::swap(&mut self.current, &mut self.previous);
        self.frame = self.frame.wrapping_add(1);
    }
}

/// Drives the frame sequence on a [`GpuBackend`].
#[derive(Debug)]
pub struct ParticleBufferPipeline {
    settings: PipelineSettings,
    buffers: Option<ParticleBufferSet>,
    noise: Option<NoiseMap>,
    noise_buffer: Option<BufferHandle>,
}

impl ParticleBufferPipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            buffers: None,
            noise: None,
            noise_buffer: None,
        }
    }

    pub fn with_noise_map(mut self, noise: NoiseMap) -> Self {
        self.noise = Some(noise);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Replace the settings. A changed emitter capacity reallocates next frame.
    pub fn set_settings(&mut self, settings: PipelineSettings) {
        self.settings = settings;
    }

    /// Replace the noise map; uploaded next frame.
    pub fn set_noise_map<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, noise: Option<NoiseMap>) {
        if let Some(old) = self.noise_buffer.take() {
            backend.release(old);
        }
        self.noise = noise;
    }

    pub fn buffers(&self) -> Option<&ParticleBufferSet> {
        self.buffers.as_ref()
    }

    /// Frames run since the buffer set was allocated.
    pub fn frame(&self) -> u32 {
        self.buffers.as_ref().map_or(0, |b| b.frame)
    }

    /// Run one frame.
    ///
    /// `emit` is called between EnsureCapacity and SetIndirectArgs with the
    /// buffers an emission pass writes to. Errors from it abandon the frame
    /// before any dispatch.
    pub fn run_frame<B, F>(
        &mut self,
        backend: &mut B,
        context: &mut EffectContext,
        time: f32,
        delta_time: f32,
        emit: F,
    ) -> Result<FrameReport>
    where
        B: GpuBackend + ?Sized,
        F: FnOnce(&mut B, &EmissionTarget) -> Result<()>,
    {
        context.apply_pending();

        if self.settings.emitters.is_empty() {
            log::warn!("[ssfx] no emitters configured, skipping frame");
            return Ok(FrameReport::default());
        }
        if self.settings.total_capacity() == 0 {
            log::warn!("[ssfx] every emitter has max_particles 0, skipping frame");
            return Ok(FrameReport::default());
        }

        let mut report = FrameReport::default();

        // 1. EnsureCapacity
        let (set, reallocated) = ensure_capacity(&mut self.buffers, &self.settings.emitters, backend)?;
        report.reallocated = reallocated;
        report.stages.push(Stage::EnsureCapacity);

        let (configs, splines) = context.registries_mut();
        let config_buffer = configs.sync_to_gpu(backend)?;
        let spline_buffers = splines.get_buffers(backend)?;
        let noise_buffer = ensure_noise(&mut self.noise_buffer, self.noise.as_ref(), backend)?;

        report.frame = set.frame;
        report.capacity = set.capacity;

        let uniforms = frame_uniforms(&self.settings, self.noise.as_ref(), set, spline_buffers.count, time, delta_time);
        backend.upload(set.uniforms, 0, bytemuck::bytes_of(&uniforms))?;

        // 2. Emission
        let target = EmissionTarget {
            particles: set.current,
            draw_args: set.draw_args,
            max_counts: set.max_counts,
            offsets: set.offsets,
            uniforms: set.uniforms,
            emitter_count: set.emitter_count(),
            capacity: set.capacity,
            time,
            delta_time,
        };
        emit(&mut *backend, &target)?;
        report.stages.push(Stage::Emission);

        // 3. SetIndirectArgs
        let args = KernelArgs::new()
            .bind(Binding::Uniforms, set.uniforms)
            .bind(Binding::DispatchArgs, set.dispatch_args)
            .bind(Binding::MaxCounts, set.max_counts);
        backend.dispatch(Kernel::SetIndirectArgs, &args, Dispatch::single())?;
        report.stages.push(Stage::SetIndirectArgs);

        // 4. BufferUnion
        let args = KernelArgs::new()
            .bind(Binding::Uniforms, set.uniforms)
            .bind(Binding::Particles, set.current)
            .bind(Binding::PreviousParticles, set.previous)
            .bind(Binding::DrawArgs, set.draw_args)
            .bind(Binding::MaxCounts, set.max_counts)
            .bind(Binding::Offsets, set.offsets);
        backend.dispatch(
            Kernel::BufferUnion,
            &args,
            Dispatch::Indirect {
                buffer: set.dispatch_args,
                offset: UNION_ARGS_OFFSET,
            },
        )?;
        report.stages.push(Stage::BufferUnion);

        // 5. Simulate
        let args = KernelArgs::new()
            .bind(Binding::Uniforms, set.uniforms)
            .bind(Binding::Particles, set.current)
            .bind(Binding::DrawArgs, set.draw_args)
            .bind(Binding::MaxCounts, set.max_counts)
            .bind(Binding::Offsets, set.offsets)
            .bind(Binding::Configs, config_buffer)
            .bind(Binding::SplinePositions, spline_buffers.positions)
            .bind(Binding::SplineInfos, spline_buffers.infos)
            .bind(Binding::Noise, noise_buffer);
        backend.dispatch(
            Kernel::Simulate,
            &args,
            Dispatch::Indirect {
                buffer: set.dispatch_args,
                offset: SIMULATE_ARGS_OFFSET,
            },
        )?;
        report.stages.push(Stage::Simulate);

        // 6. Render
        for (e, slot) in set.layout.iter().enumerate() {
            if slot.max_particles == 0 {
                continue;
            }
            backend.draw_indirect(&IndirectDraw {
                mesh: slot.mesh,
                material: slot.material,
                args: set.draw_args,
                offset: e as u64 * DRAW_ARGS_BYTES,
                particles: set.current,
            })?;
            report.draws += 1;
        }
        report.stages.push(Stage::Render);

        // 7. Swap
        set.swap();
        report.stages.push(Stage::Swap);

        // 8. ClearDrawArgs
        let args = KernelArgs::new()
            .bind(Binding::Uniforms, set.uniforms)
            .bind(Binding::DrawArgs, set.draw_args);
        let groups = workgroups(set.emitter_count(), CLEAR_WORKGROUP_SIZE);
        backend.dispatch(Kernel::ClearDrawArgs, &args, Dispatch::Direct { x: groups, y: 1, z: 1 })?;
        report.stages.push(Stage::ClearDrawArgs);

        backend.submit();

        if self.settings.debug {
            log::debug!(
                "[ssfx] frame {} done: {} emitters, capacity {}, {} draws{}",
                report.frame,
                set.emitter_count(),
                report.capacity,
                report.draws,
                if report.reallocated { ", reallocated" } else { "" }
            );
        }
        Ok(report)
    }

    /// Live particles per emitter as of the last frame. Forces a readback.
    pub fn read_live_counts<B: GpuBackend + ?Sized>(&self, backend: &mut B) -> Result<Vec<u32>> {
        let Some(set) = &self.buffers else {
            return Ok(Vec::new());
        };
        let bytes = backend.read(set.draw_args, 0, set.emitter_count() as u64 * DRAW_ARGS_BYTES)?;
        Ok(bytes
            .chunks_exact(DRAW_ARGS_BYTES as usize)
            .map(|record| {
                let word = &record[DRAW_INSTANCE_COUNT * 4..DRAW_INSTANCE_COUNT * 4 + 4];
                u32::from_le_bytes([word[0], word[1], word[2], word[3]])
            })
            .collect())
    }

    /// Release every buffer owned by the pipeline and the context.
    pub fn free_resources<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, context: &mut EffectContext) {
        if let Some(set) = self.buffers.take() {
            set.release(backend);
        }
        if let Some(noise) = self.noise_buffer.take() {
            backend.release(noise);
        }
        let (configs, splines) = context.registries_mut();
        configs.free_resources(backend);
        splines.free_resources(backend);
        log::debug!("[ssfx] pipeline resources released");
    }
}

/// Reuse the buffer set when capacities match, otherwise reallocate it.
fn ensure_capacity<'a, B: GpuBackend + ?Sized>(
    buffers: &'a mut Option<ParticleBufferSet>,
    layout: &[EmitterSlot],
    backend: &mut B,
) -> Result<(&'a mut ParticleBufferSet, bool)> {
    match buffers.take() {
        Some(mut set) if set.matches(layout) => {
            let refreshed = set.refresh_meshes(backend, layout);
            let set = buffers.insert(set);
            refreshed?;
            Ok((set, false))
        }
        old => {
            if let Some(old) = old {
                old.release(backend);
            }
            let set = ParticleBufferSet::allocate(backend, layout)?;
            log::info!(
                "[ssfx] particle buffers allocated: {} emitters, {} particles",
                set.emitter_count(),
                set.capacity
            );
            Ok((buffers.insert(set), true))
        }
    }
}

fn ensure_noise<B: GpuBackend + ?Sized>(
    cached: &mut Option<BufferHandle>,
    noise: Option<&NoiseMap>,
    backend: &mut B,
) -> Result<BufferHandle> {
    if let Some(handle) = *cached {
        return Ok(handle);
    }
    let handle = match noise {
        Some(noise) => noise.upload(backend)?,
        None => backend
            .allocate(&BufferDesc::storage("Noise Map", 1, 4))
            .map_err(Error::allocation)?,
    };
    *cached = Some(handle);
    Ok(handle)
}

fn frame_uniforms(
    settings: &PipelineSettings,
    noise: Option<&NoiseMap>,
    set: &ParticleBufferSet,
    spline_count: u32,
    time: f32,
    delta_time: f32,
) -> SimulationUniforms {
    SimulationUniforms {
        time,
        delta_time,
        frame: set.frame,
        emitter_count: set.emitter_count(),
        gravity: settings.gravity,
        floor_height: settings.floor_height,
        max_speed: settings.max_speed,
        policy: settings.policy.as_u32(),
        noise_st: settings.noise.st().to_array(),
        wind: settings.wind().to_array(),
        spline_count,
        noise_width: noise.map_or(0, |n| n.width()),
        noise_height: noise.map_or(0, |n| n.height()),
        capacity: set.capacity,
        _pad: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{Command, SoftwareBackend};

    fn pipeline(caps: &[u32]) -> ParticleBufferPipeline {
        let settings = caps
            .iter()
            .fold(PipelineSettings::new(), |s, &cap| s.with_emitter(EmitterSlot::new(cap)));
        ParticleBufferPipeline::new(settings)
    }

    fn no_emission<B: GpuBackend + ?Sized>(_: &mut B, _: &EmissionTarget) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_stage_order() {
        let mut backend = SoftwareBackend::new();
        let mut context = EffectContext::new();
        let mut pipeline = pipeline(&[10]);
        let report = pipeline
            .run_frame(&mut backend, &mut context, 0.0, 0.016, no_emission)
            .expect("frame");
        assert_eq!(
            report.stages,
            vec![
                Stage::EnsureCapacity,
                Stage::Emission,
                Stage::SetIndirectArgs,
                Stage::BufferUnion,
                Stage::Simulate,
                Stage::Render,
                Stage::Swap,
                Stage::ClearDrawArgs,
            ]
        );
        assert!(report.reallocated);

        let kernels: Vec<Kernel> = backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::Dispatch { kernel, .. } => Some(*kernel),
                _ => None,
            })
            .collect();
        assert_eq!(kernels, Kernel::ALL.to_vec());
        assert_eq!(backend.commands().last(), Some(&Command::Submit));
    }

    #[test]
    fn test_empty_layout_is_noop() {
        let mut backend = SoftwareBackend::new();
        let mut context = EffectContext::new();
        let mut pipeline = pipeline(&[]);
        let report = pipeline
            .run_frame(&mut backend, &mut context, 0.0, 0.016, no_emission)
            .expect("frame");
        assert!(report.is_noop());
        assert!(backend.commands().is_empty());

        let mut zero = self::pipeline(&[0, 0]);
        assert!(zero
            .run_frame(&mut backend, &mut context, 0.0, 0.016, no_emission)
            .expect("frame")
            .is_noop());
    }

    #[test]
    fn test_draw_args_initialized_per_emitter() {
        let mut backend = SoftwareBackend::new();
        let mut context = EffectContext::new();
        let mut pipeline = pipeline(&[10, 20]);
        pipeline
            .run_frame(&mut backend, &mut context, 0.0, 0.016, no_emission)
            .expect("frame");
        let set = pipeline.buffers().expect("buffers");
        let words = backend.contents::<u32>(set.draw_args()).expect("draw args");
        assert_eq!(&words[..8], &[6, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&words[8..], &[6, 0, 0, 0, 10, 0, 0, 0]);
        assert_eq!(backend.contents::<u32>(set.offsets()), Some(&[0, 10][..]));
    }

    #[test]
    fn test_layout_change_reallocates() {
        let mut backend = SoftwareBackend::new();
        let mut context = EffectContext::new();
        let mut pipeline = pipeline(&[10]);
        let first = pipeline
            .run_frame(&mut backend, &mut context, 0.0, 0.016, no_emission)
            .expect("frame");
        let second = pipeline
            .run_frame(&mut backend, &mut context, 0.016, 0.016, no_emission)
            .expect("frame");
        assert!(first.reallocated);
        assert!(!second.reallocated);
        assert_eq!(second.frame, 1);

        pipeline.set_settings(PipelineSettings::new().with_emitter(EmitterSlot::new(30)));
        let third = pipeline
            .run_frame(&mut backend, &mut context, 0.032, 0.016, no_emission)
            .expect("frame");
        assert!(third.reallocated);
        assert_eq!(third.frame, 0);
        assert_eq!(third.capacity, 30);
    }

    #[test]
    fn test_emission_error_abandons_frame() {
        let mut backend = SoftwareBackend::new();
        let mut context = EffectContext::new();
        let mut pipeline = pipeline(&[10]);
        let result = pipeline.run_frame(&mut backend, &mut context, 0.0, 0.016, |_, _| {
            Err(Error::Gpu(crate::error::GpuError::BufferMapping("lost".into())))
        });
        assert!(result.is_err());
        assert!(!backend
            .commands()
            .iter()
            .any(|c| matches!(c, Command::Dispatch { .. })));
    }

    #[test]
    fn test_free_resources() {
        let mut backend = SoftwareBackend::new();
        let mut context = EffectContext::new();
        let mut pipeline = pipeline(&[10]);
        pipeline
            .run_frame(&mut backend, &mut context, 0.0, 0.016, no_emission)
            .expect("frame");
        assert!(backend.live_buffers() > 0);
        pipeline.free_resources(&mut backend, &mut context);
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.allocated_bytes(), 0);
    }
}
