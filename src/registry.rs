//! Shared arena of [`ParticleSystemConfig`] records.
//!
//! Emitters register a config once and receive a stable slot index, which
//! particles carry as `config_index`. Slots are mutated in place and never
//! compacted or reused; slot 0 is reserved and stays zeroed so a zeroed
//! particle never picks up a real config.
//!
//! The GPU mirror grows geometrically (10 slots, then doubling) and is only
//! re-uploaded when something changed since the last sync.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use glam::Vec3;

use crate::config::{ConfigFlags, ParticleSystemConfig};
use crate::error::{Error, Result};
use crate::gpu::{BufferDesc, BufferHandle, GpuBackend};
use crate::GpuStruct;

/// Slots allocated by the first sync.
pub const DEFAULT_SLOT_CAPACITY: u32 = 10;

/// Half-open range of slots changed since the last upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirtyRange {
    pub start: u32,
    pub end: u32,
}

impl DirtyRange {
    pub fn single(index: u32) -> Self {
        Self { start: index, end: index + 1 }
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

#[derive(Debug)]
struct ConfigBuffer {
    handle: BufferHandle,
    capacity: u32,
}

/// Config slots plus their GPU mirror.
#[derive(Debug)]
pub struct ConfigRegistry {
    slots: Vec<ParticleSystemConfig>,
    targets: Vec<Option<Vec3>>,
    next_index: Arc<AtomicU32>,
    dirty: Option<DirtyRange>,
    version: u64,
    buffer: Option<ConfigBuffer>,
    uploads: u64,
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self {
            slots: vec![ParticleSystemConfig::default()],
            targets: vec![None],
            next_index: Arc::new(AtomicU32::new(1)),
            dirty: None,
            version: 0,
            buffer: None,
            uploads: 0,
        }
    }

    /// Counter handing out slot indices, shared with [`EffectHandle`](crate::EffectHandle).
    pub(crate) fn index_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.next_index)
    }

    /// Store `config` in a fresh slot and return its index (never 0).
    pub fn register(&mut self, config: ParticleSystemConfig) -> u32 {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.register_at(index, config);
        index
    }

    /// Store `config` at an index reserved earlier through the shared counter.
    ///
    /// Slots between the current end and `index` are created zeroed.
    pub fn register_at(&mut self, index: u32, config: ParticleSystemConfig) {
        if index == 0 {
            log::warn!("[ssfx] slot 0 is reserved, config not registered");
            return;
        }
        let needed = index as usize + 1;
        if self.slots.len() < needed {
            self.slots.resize(needed, ParticleSystemConfig::default());
            self.targets.resize(needed, None);
        }
        self.next_index.fetch_max(index + 1, Ordering::Relaxed);
        self.slots[index as usize] = config;
        self.mark_dirty(index);
    }

    /// Overwrite slot `index`. A bound target keeps its position.
    pub fn update(&mut self, index: u32, mut config: ParticleSystemConfig) {
        if !self.in_range(index, "update") {
            return;
        }
        if let Some(target) = self.targets[index as usize] {
            config.target_position = target.to_array();
        }
        self.slots[index as usize] = config;
        self.mark_dirty(index);
    }

    /// Kill every live particle using slot `index`. Other fields are kept.
    pub fn set_kill_all(&mut self, index: u32) {
        self.set_flag(index, ConfigFlags::KILL_ALL, true, "set_kill_all");
    }

    /// Freeze or resume every particle using slot `index`.
    pub fn set_paused(&mut self, index: u32, paused: bool) {
        self.set_flag(index, ConfigFlags::PAUSE, paused, "set_paused");
    }

    /// Bind or unbind a target whose position is re-patched on sync.
    pub fn bind_target(&mut self, index: u32, position: Option<Vec3>) {
        if !self.in_range(index, "bind_target") {
            return;
        }
        self.targets[index as usize] = position;
    }

    pub fn bound_target(&self, index: u32) -> Option<Vec3> {
        self.targets.get(index as usize).copied().flatten()
    }

    /// Move the target bound to slot `index`.
    pub fn move_target(&mut self, index: u32, position: Vec3) {
        if !self.in_range(index, "move_target") {
            return;
        }
        match &mut self.targets[index as usize] {
            Some(target) => *target = position,
            None => log::warn!("[ssfx] move_target: slot {} has no bound target", index),
        }
    }

    /// First slot structurally equal to `config`.
    pub fn find(&self, config: &ParticleSystemConfig) -> Option<u32> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, slot)| *slot == config)
            .map(|(i, _)| i as u32)
    }

    /// Whether any registered slot has `flag` set.
    pub fn any_flag(&self, flag: ConfigFlags) -> bool {
        self.slots.iter().skip(1).any(|slot| slot.has(flag))
    }

    pub fn get(&self, index: u32) -> Option<&ParticleSystemConfig> {
        if index == 0 {
            return None;
        }
        self.slots.get(index as usize)
    }

    /// Slots including the reserved slot 0.
    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Registered configs.
    pub fn len(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dirty(&self) -> Option<DirtyRange> {
        self.dirty
    }

    /// Bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Slots the GPU buffer can hold, 0 before the first sync.
    pub fn capacity(&self) -> u32 {
        self.buffer.as_ref().map_or(0, |b| b.capacity)
    }

    /// Number of uploads issued by [`sync_to_gpu`](Self::sync_to_gpu).
    pub fn upload_count(&self) -> u64 {
        self.uploads
    }

    /// Bring the GPU mirror up to date and return its handle.
    pub fn sync_to_gpu<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) -> Result<BufferHandle> {
        self.patch_targets();

        let required = self.slot_count();
        let mut capacity = self.capacity().max(DEFAULT_SLOT_CAPACITY);
        while capacity < required {
            capacity *= 2;
        }

        let reusable = self.buffer.as_ref().filter(|b| b.capacity == capacity).map(|b| b.handle);
        let handle = match reusable {
            Some(handle) => {
                if let Some(range) = self.dirty {
                    let end = range.end.min(required);
                    let data = &self.slots[range.start as usize..end as usize];
                    let offset = range.start as u64 * ParticleSystemConfig::GPU_SIZE as u64;
                    // The range stays dirty until the write lands.
                    backend.upload(handle, offset, bytemuck::cast_slice(data))?;
                    self.uploads += 1;
                    self.dirty = None;
                }
                handle
            }
            None => {
                if let Some(old) = self.buffer.take() {
                    backend.release(old.handle);
                }
                log::debug!("[ssfx] config buffer allocated with {} slots", capacity);
                let handle = backend
                    .allocate(&BufferDesc::storage(
                        "Particle System Configs",
                        capacity,
                        ParticleSystemConfig::GPU_SIZE,
                    ))
                    .map_err(Error::allocation)?;
                if let Err(e) = backend.upload(handle, 0, bytemuck::cast_slice(&self.slots)) {
                    backend.release(handle);
                    return Err(e.into());
                }
                self.uploads += 1;
                self.dirty = None;
                self.buffer = Some(ConfigBuffer { handle, capacity });
                handle
            }
        };
        Ok(handle)
    }

    /// Release the GPU mirror; the next sync reallocates and uploads everything.
    pub fn free_resources<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        if let Some(old) = self.buffer.take() {
            backend.release(old.handle);
        }
    }

    fn patch_targets(&mut self) {
        for index in 1..self.slots.len() {
            let Some(target) = self.targets[index] else {
                continue;
            };
            let position = target.to_array();
            if self.slots[index].target_position != position {
                self.slots[index].target_position = position;
                self.mark_dirty(index as u32);
            }
        }
    }

    fn set_flag(&mut self, index: u32, flag: ConfigFlags, on: bool, op: &str) {
        if !self.in_range(index, op) {
            return;
        }
        let slot = &mut self.slots[index as usize];
        if slot.has(flag) == on {
            return;
        }
        slot.set_flag(flag, on);
        self.mark_dirty(index);
    }

    fn in_range(&self, index: u32, op: &str) -> bool {
        if index == 0 || index as usize >= self.slots.len() {
            log::warn!(
                "[ssfx] {}: config index {} out of range (1..{})",
                op,
                index,
                self.slots.len()
            );
            return false;
        }
        true
    }

    fn mark_dirty(&mut self, index: u32) {
        let range = DirtyRange::single(index);
        self.dirty = Some(self.dirty.map_or(range, |d| d.union(range)));
        self.version += 1;
    }
}
