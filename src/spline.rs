//! Paths particles can follow, and the registry packing them for the GPU.
//!
//! A [`SplinePath`] owns its control points and caches `sample_count`
//! arc-length samples, each `(x, y, z, width)`. The [`SplineRegistry`]
//! concatenates the samples of every registered path into one positions
//! buffer and describes each path with a [`SplineInfo`] (attraction box,
//! start offset, sample count).
//!
//! Sample counts differ per path, so offsets shift whenever any path
//! changes: the registry rebuilds both buffers from scratch when any path
//! is dirty or the registered set changed, and otherwise hands back the
//! cached handles.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::arc_length::{ArcLengthSampler, BezierPoint, DEFAULT_PRECISION};
use crate::error::{Error, GpuError, Result};
use crate::gpu::{BufferDesc, BufferHandle, GpuBackend};
use crate::GpuStruct;

/// Default number of samples cached per path.
pub const DEFAULT_SAMPLE_COUNT: u32 = 50;

/// Width given to points added without one.
const DEFAULT_POINT_WIDTH: f32 = 0.3;

/// GPU description of one registered path (32 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, GpuStruct)]
pub struct SplineInfo {
    pub box_min: [f32; 3],
    pub start_index: u32,
    pub box_max: [f32; 3],
    pub step_count: u32,
}

/// Axis-aligned box.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoundingBox {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Smallest box holding every point, or `None` for no points.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        points.into_iter().fold(None, |bb, p| match bb {
            None => Some(Self::new(p, p)),
            Some(bb) => Some(Self::new(bb.min.min(p), bb.max.max(p))),
        })
    }

    pub fn contains(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn expand(&self, margin: f32) -> Self {
        Self::new(self.min - Vec3::splat(margin), self.max + Vec3::splat(margin))
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Vec3::ZERO)
    }
}

/// Region inside which particles are pulled onto a path.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttractionBox {
    /// The path's own bounds grown by a margin.
    Automatic { margin: f32 },
    /// A fixed box.
    Manual(BoundingBox),
}

impl Default for AttractionBox {
    fn default() -> Self {
        AttractionBox::Automatic { margin: 0.0 }
    }
}

/// A control point of a path.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplinePoint {
    pub point: BezierPoint,
    pub width: f32,
}

impl SplinePoint {
    pub fn new(position: Vec3, handle: Vec3, width: f32) -> Self {
        Self {
            point: BezierPoint::new(position, handle),
            width,
        }
    }
}

/// An editable path with cached arc-length samples.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SplinePath {
    points: Vec<SplinePoint>,
    sample_count: u32,
    precision: u32,
    attraction: AttractionBox,
    #[serde(skip)]
    samples: Vec<[f32; 4]>,
    #[serde(skip)]
    bounds: Option<BoundingBox>,
    #[serde(skip, default = "dirty_default")]
    dirty: bool,
}

fn dirty_default() -> bool {
    true
}

impl Default for SplinePath {
    fn default() -> Self {
        Self::new()
    }
}

impl SplinePath {
    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            sample_count: DEFAULT_SAMPLE_COUNT,
            precision: DEFAULT_PRECISION,
            attraction: AttractionBox::default(),
            samples: Vec::new(),
            bounds: None,
            dirty: true,
        }
    }

    pub fn with_point(mut self, point: SplinePoint) -> Self {
        self.points.push(point);
        self.recompute();
        self
    }

    pub fn with_sample_count(mut self, count: u32) -> Self {
        self.sample_count = count;
        self.recompute();
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = precision.max(1);
        self.recompute();
        self
    }

    pub fn with_attraction(mut self, attraction: AttractionBox) -> Self {
        self.attraction = attraction;
        self.dirty = true;
        self
    }

    pub fn points(&self) -> &[SplinePoint] {
        &self.points
    }

    pub fn samples(&self) -> &[[f32; 4]] {
        &self.samples
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Bounds of the cached samples.
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        self.bounds
    }

    /// Box used by the simulation to decide which particles follow this path.
    pub fn attraction_box(&self) -> BoundingBox {
        match self.attraction {
            AttractionBox::Manual(bb) => bb,
            AttractionBox::Automatic { margin } => self.bounds.unwrap_or_default().expand(margin),
        }
    }

    /// Move point `index` and its handle.
    pub fn set_point(&mut self, index: usize, point: SplinePoint) {
        let Some(slot) = self.points.get_mut(index) else {
            log::warn!("[ssfx] spline point {} out of range ({} points)", index, self.points.len());
            return;
        };
        *slot = point;
        self.recompute();
    }

    /// Insert `point` at `index`, shifting later points back.
    pub fn add_point_at(&mut self, index: usize, point: SplinePoint) {
        let index = index.min(self.points.len());
        self.points.insert(index, point);
        self.recompute();
    }

    /// Insert a point after `previous` (`None` for the front), placed so it
    /// does not overlap its neighbours.
    ///
    /// - at the front it duplicates the first point;
    /// - at the end it continues the last segment by its own length;
    /// - otherwise it lands halfway between its neighbours.
    pub fn add_point_after(&mut self, previous: Option<usize>, origin: Vec3) {
        let n = self.points.len();
        let (index, position, width) = match previous {
            _ if n == 0 => (0, origin, DEFAULT_POINT_WIDTH),
            None => (0, self.points[0].point.position, self.points[0].width),
            Some(i) if i + 1 >= n => {
                let last = self.points[n - 1];
                let step = if n >= 2 {
                    last.point.position - self.points[n - 2].point.position
                } else {
                    Vec3::ZERO
                };
                (n, last.point.position + step, last.width)
            }
            Some(i) => {
                let a = self.points[i];
                let b = self.points[i + 1];
                (i + 1, a.point.position.lerp(b.point.position, 0.5), a.width)
            }
        };
        self.add_point_at(index, SplinePoint::new(position, Vec3::ZERO, width));
    }

    pub fn remove_point(&mut self, index: usize) -> Option<SplinePoint> {
        if index >= self.points.len() {
            return None;
        }
        let removed = self.points.remove(index);
        self.recompute();
        Some(removed)
    }

    /// Resample the path and mark it dirty.
    ///
    /// Paths with fewer than two points have no samples.
    pub fn recompute(&mut self) {
        self.dirty = true;
        if self.points.len() < 2 {
            self.samples.clear();
            self.bounds = None;
            return;
        }

        let bezier: Vec<BezierPoint> = self.points.iter().map(|p| p.point).collect();
        let samples = ArcLengthSampler::new(self.precision).sample(&bezier, self.sample_count as usize);

        self.samples = samples
            .iter()
            .map(|s| {
                let a = self.points[s.segment].width;
                let b = self.points[s.segment + 1].width;
                let width = a + (b - a) * s.fraction;
                [s.position.x, s.position.y, s.position.z, width]
            })
            .collect();
        self.bounds = BoundingBox::from_points(samples.iter().map(|s| s.position));
    }
}

/// Stable name of a registered path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(pub(crate) u32);

/// Handles returned by [`SplineRegistry::get_buffers`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplineBuffers {
    /// `[f32; 4]` per sample.
    pub positions: BufferHandle,
    /// One [`SplineInfo`] per path.
    pub infos: BufferHandle,
    /// Number of registered paths.
    pub count: u32,
}

/// The active paths, in registration order.
#[derive(Debug, Default)]
pub struct SplineRegistry {
    paths: Vec<(PathId, SplinePath)>,
    next_id: Arc<AtomicU32>,
    layout_changed: bool,
    buffers: Option<SplineBuffers>,
    rebuilds: u64,
}

impl SplineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, path: SplinePath) -> PathId {
        let id = PathId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.register_as(id, path);
        id
    }

    /// Register under an id reserved earlier through the shared counter.
    pub fn register_as(&mut self, id: PathId, path: SplinePath) {
        if self.index_of(id).is_some() {
            log::warn!("[ssfx] path {:?} already registered", id);
            return;
        }
        self.next_id.fetch_max(id.0 + 1, Ordering::Relaxed);
        self.paths.push((id, path));
        self.layout_changed = true;
    }

    /// Counter handing out path ids, shared with [`EffectHandle`](crate::EffectHandle).
    pub(crate) fn id_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.next_id)
    }

    pub fn unregister(&mut self, id: PathId) -> Option<SplinePath> {
        let Some(pos) = self.paths.iter().position(|(p, _)| *p == id) else {
            log::warn!("[ssfx] unregistering unknown path {:?}", id);
            return None;
        };
        self.layout_changed = true;
        Some(self.paths.remove(pos).1)
    }

    pub fn get(&self, id: PathId) -> Option<&SplinePath> {
        self.paths.iter().find(|(p, _)| *p == id).map(|(_, path)| path)
    }

    /// Edit a path in place; edits through its methods mark it dirty.
    pub fn get_mut(&mut self, id: PathId) -> Option<&mut SplinePath> {
        self.paths.iter_mut().find(|(p, _)| *p == id).map(|(_, path)| path)
    }

    /// Position of `id` in the GPU info buffer.
    pub fn index_of(&self, id: PathId) -> Option<usize> {
        self.paths.iter().position(|(p, _)| *p == id)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Total samples over every path.
    pub fn total_samples(&self) -> usize {
        self.paths.iter().map(|(_, p)| p.samples().len()).sum()
    }

    pub fn needs_rebuild(&self) -> bool {
        self.buffers.is_none() || self.layout_changed || self.paths.iter().any(|(_, p)| p.is_dirty())
    }

    /// How many times the buffers were rebuilt.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Current buffers, rebuilt first if anything changed.
    ///
    /// With nothing registered both buffers hold a single zeroed element so
    /// they can still be bound.
    pub fn get_buffers<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) -> Result<SplineBuffers> {
        if let (false, Some(buffers)) = (self.needs_rebuild(), self.buffers) {
            return Ok(buffers);
        }

        let mut infos = Vec::with_capacity(self.paths.len());
        let mut positions: Vec<[f32; 4]> = Vec::with_capacity(self.total_samples());
        for (_, path) in &self.paths {
            let bb = path.attraction_box();
            infos.push(SplineInfo {
                box_min: bb.min.to_array(),
                start_index: positions.len() as u32,
                box_max: bb.max.to_array(),
                step_count: path.samples().len() as u32,
            });
            positions.extend_from_slice(path.samples());
        }

        log::debug!(
            "[ssfx] rebuilding spline buffers: {} paths, {} samples",
            infos.len(),
            positions.len()
        );

        if let Some(old) = self.buffers.take() {
            backend.release(old.positions);
            backend.release(old.infos);
        }

        let position_handle = backend
            .allocate(&BufferDesc::storage("Spline Positions", positions.len().max(1) as u32, 16))
            .map_err(Error::allocation)?;
        let info_handle = match backend.allocate(&BufferDesc::storage(
            "Spline Infos",
            infos.len().max(1) as u32,
            SplineInfo::GPU_SIZE,
        )) {
            Ok(handle) => handle,
            Err(e) => {
                backend.release(position_handle);
                return Err(Error::allocation(e));
            }
        };

        let uploaded = upload_slice(backend, position_handle, &positions)
            .and_then(|()| upload_slice(backend, info_handle, &infos));
        if let Err(e) = uploaded {
            backend.release(position_handle);
            backend.release(info_handle);
            return Err(e.into());
        }

        for (_, path) in &mut self.paths {
            path.clear_dirty();
        }
        self.layout_changed = false;
        self.rebuilds += 1;

        let buffers = SplineBuffers {
            positions: position_handle,
            infos: info_handle,
            count: self.paths.len() as u32,
        };
        self.buffers = Some(buffers);
        Ok(buffers)
    }

    /// Release the GPU buffers; the next `get_buffers` rebuilds them.
    pub fn free_resources<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        if let Some(old) = self.buffers.take() {
            backend.release(old.positions);
            backend.release(old.infos);
        }
    }
}

fn upload_slice<B: GpuBackend + ?Sized, T: Pod>(
    backend: &mut B,
    handle: BufferHandle,
    data: &[T],
) -> std::result::Result<(), GpuError> {
    if data.is_empty() {
        return Ok(());
    }
    backend.upload(handle, 0, bytemuck::cast_slice(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::RejectingUploads;

    fn line(length: f32, samples: u32) -> SplinePath {
        SplinePath::new()
            .with_sample_count(samples)
            .with_point(SplinePoint::new(Vec3::ZERO, Vec3::ZERO, 1.0))
            .with_point(SplinePoint::new(Vec3::new(length, 0.0, 0.0), Vec3::ZERO, 3.0))
    }

    #[test]
    fn test_info_layout() {
        assert_eq!(std::mem::size_of::<SplineInfo>(), 32);
        assert_eq!(SplineInfo::GPU_SIZE, 32);
        assert!(SplineInfo::WGSL_STRUCT.contains("box_min: vec3<f32>,"));
    }

    #[test]
    fn test_samples_carry_interpolated_width() {
        let path = line(4.0, 5);
        let samples = path.samples();
        assert_eq!(samples.len(), 5);
        assert!((samples[0][3] - 1.0).abs() < 1e-4);
        assert!((samples[2][3] - 2.0).abs() < 1e-2);
        assert!((samples[4][3] - 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_single_point_has_no_samples() {
        let path = SplinePath::new().with_point(SplinePoint::new(Vec3::ONE, Vec3::ZERO, 1.0));
        assert!(path.samples().is_empty());
        assert!(path.bounding_box().is_none());
    }

    #[test]
    fn test_attraction_box_modes() {
        let path = line(2.0, 3);
        let auto = path.attraction_box();
        assert_eq!(auto.min, Vec3::ZERO);
        assert!((auto.max.x - 2.0).abs() < 1e-4);

        let padded = line(2.0, 3).with_attraction(AttractionBox::Automatic { margin: 1.0 });
        assert!(padded.attraction_box().contains(Vec3::new(-0.5, 0.5, 0.0)));

        let fixed = BoundingBox::new(Vec3::splat(-9.0), Vec3::splat(9.0));
        let manual = line(2.0, 3).with_attraction(AttractionBox::Manual(fixed));
        assert_eq!(manual.attraction_box(), fixed);
    }

    #[test]
    fn test_add_point_after() {
        let mut path = line(2.0, 3);
        path.add_point_after(Some(0), Vec3::ZERO);
        assert_eq!(path.points()[1].point.position, Vec3::new(1.0, 0.0, 0.0));

        path.add_point_after(Some(2), Vec3::ZERO);
        assert_eq!(path.points()[3].point.position, Vec3::new(3.0, 0.0, 0.0));

        path.add_point_after(None, Vec3::ZERO);
        assert_eq!(path.points().len(), 5);
        assert_eq!(path.points()[0].point.position, Vec3::ZERO);

        let mut empty = SplinePath::new();
        empty.add_point_after(None, Vec3::new(7.0, 0.0, 0.0));
        assert_eq!(empty.points()[0].point.position.x, 7.0);
        assert_eq!(empty.points()[0].width, DEFAULT_POINT_WIDTH);
    }

    #[test]
    fn test_registry_ids_and_order() {
        let mut registry = SplineRegistry::new();
        let a = registry.register(line(1.0, 3));
        let b = registry.register(line(2.0, 4));
        assert_eq!(registry.index_of(b), Some(1));
        assert_eq!(registry.total_samples(), 7);

        assert!(registry.unregister(a).is_some());
        assert_eq!(registry.index_of(b), Some(0));
        assert!(registry.unregister(a).is_none());
        assert!(registry.needs_rebuild());
    }

    #[test]
    fn test_failed_upload_releases_fresh_buffers() {
        let mut backend = RejectingUploads {
            reject: 1,
            ..Default::default()
        };
        let mut registry = SplineRegistry::new();
        registry.register(line(2.0, 3));
        assert!(registry.get_buffers(&mut backend).is_err());
        assert_eq!(backend.inner.live_buffers(), 0);
        assert!(registry.needs_rebuild());
        assert_eq!(registry.rebuild_count(), 0);

        let buffers = registry.get_buffers(&mut backend).expect("retry");
        assert_eq!(backend.inner.live_buffers(), 2);
        assert_eq!(buffers.count, 1);
        assert!(!registry.needs_rebuild());
    }
}
