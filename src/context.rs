//! Owner of the registries shared by every emitter.
//!
//! The frame thread owns an [`EffectContext`] and passes it to
//! [`ParticleBufferPipeline::run_frame`](crate::ParticleBufferPipeline::run_frame).
//! Other threads mutate it through an [`EffectHandle`]: indices and ids are
//! reserved immediately, the commands are queued and only applied at the
//! start of the next frame, so the GPU mirrors never see half an update.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use glam::Vec3;

use crate::config::ParticleSystemConfig;
use crate::registry::ConfigRegistry;
use crate::spline::{PathId, SplinePath, SplineRegistry};

/// Mutation queued by an [`EffectHandle`].
#[derive(Debug)]
pub enum EffectCommand {
    Register { index: u32, config: ParticleSystemConfig },
    Update { index: u32, config: ParticleSystemConfig },
    KillAll(u32),
    SetPaused(u32, bool),
    BindTarget(u32, Option<Vec3>),
    MoveTarget(u32, Vec3),
    RegisterPath { id: PathId, path: SplinePath },
    UnregisterPath(PathId),
}

/// Config and path registries plus the queue feeding them.
#[derive(Debug)]
pub struct EffectContext {
    configs: ConfigRegistry,
    splines: SplineRegistry,
    sender: Sender<EffectCommand>,
    receiver: Receiver<EffectCommand>,
}

impl Default for EffectContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectContext {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            configs: ConfigRegistry::new(),
            splines: SplineRegistry::new(),
            sender,
            receiver,
        }
    }

    pub fn configs(&self) -> &ConfigRegistry {
        &self.configs
    }

    pub fn configs_mut(&mut self) -> &mut ConfigRegistry {
        &mut self.configs
    }

    pub fn splines(&self) -> &SplineRegistry {
        &self.splines
    }

    pub fn splines_mut(&mut self) -> &mut SplineRegistry {
        &mut self.splines
    }

    /// Both registries at once.
    pub fn registries_mut(&mut self) -> (&mut ConfigRegistry, &mut SplineRegistry) {
        (&mut self.configs, &mut self.splines)
    }

    /// A handle for mutating this context from other threads.
    pub fn handle(&self) -> EffectHandle {
        EffectHandle {
            sender: self.sender.clone(),
            config_indices: self.configs.index_counter(),
            path_ids: self.splines.id_counter(),
        }
    }

    /// Commands waiting for the next frame.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Apply every queued command in the order it was sent.
    ///
    /// Returns how many were applied.
    pub fn apply_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(command) = self.receiver.try_recv() {
            self.apply(command);
            applied += 1;
        }
        if applied > 0 {
            log::trace!("[ssfx] applied {} queued effect commands", applied);
        }
        applied
    }

    fn apply(&mut self, command: EffectCommand) {
        match command {
            EffectCommand::Register { index, config } => self.configs.register_at(index, config),
            EffectCommand::Update { index, config } => self.configs.update(index, config),
            EffectCommand::KillAll(index) => self.configs.set_kill_all(index),
            EffectCommand::SetPaused(index, paused) => self.configs.set_paused(index, paused),
            EffectCommand::BindTarget(index, target) => self.configs.bind_target(index, target),
            EffectCommand::MoveTarget(index, position) => self.configs.move_target(index, position),
            EffectCommand::RegisterPath { id, path } => self.splines.register_as(id, path),
            EffectCommand::UnregisterPath(id) => {
                self.splines.unregister(id);
            }
        }
    }
}

/// Cloneable, `Send` access to an [`EffectContext`].
#[derive(Clone, Debug)]
pub struct EffectHandle {
    sender: Sender<EffectCommand>,
    config_indices: Arc<AtomicU32>,
    path_ids: Arc<AtomicU32>,
}

impl EffectHandle {
    /// Reserve a config slot now; the config lands there next frame.
    pub fn register(&self, config: ParticleSystemConfig) -> u32 {
        let index = self.config_indices.fetch_add(1, Ordering::Relaxed);
        self.send(EffectCommand::Register { index, config });
        index
    }

    pub fn update(&self, index: u32, config: ParticleSystemConfig) {
        self.send(EffectCommand::Update { index, config });
    }

    pub fn set_kill_all(&self, index: u32) {
        self.send(EffectCommand::KillAll(index));
    }

    pub fn set_paused(&self, index: u32, paused: bool) {
        self.send(EffectCommand::SetPaused(index, paused));
    }

    pub fn bind_target(&self, index: u32, target: Option<Vec3>) {
        self.send(EffectCommand::BindTarget(index, target));
    }

    pub fn move_target(&self, index: u32, position: Vec3) {
        self.send(EffectCommand::MoveTarget(index, position));
    }

    /// Reserve a path id now; the path is registered next frame.
    pub fn register_path(&self, path: SplinePath) -> PathId {
        let id = PathId(self.path_ids.fetch_add(1, Ordering::Relaxed));
        self.send(EffectCommand::RegisterPath { id, path });
        id
    }

    pub fn unregister_path(&self, id: PathId) {
        self.send(EffectCommand::UnregisterPath(id));
    }

    fn send(&self, command: EffectCommand) {
        if self.sender.send(command).is_err() {
            log::warn!("[ssfx] effect context dropped, command discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFlags;
    use std::thread;

    #[test]
    fn test_commands_apply_at_frame_boundary() {
        let mut context = EffectContext::new();
        let handle = context.handle();
        let index = handle.register(ParticleSystemConfig::default());
        handle.set_kill_all(index);
        assert_eq!(index, 1);
        assert!(context.configs().get(index).is_none());
        assert_eq!(context.pending(), 2);

        assert_eq!(context.apply_pending(), 2);
        assert!(context.configs().get(index).is_some_and(|c| c.has(ConfigFlags::KILL_ALL)));
    }

    #[test]
    fn test_indices_never_collide_with_direct_registration() {
        let mut context = EffectContext::new();
        let handle = context.handle();
        let a = handle.register(ParticleSystemConfig::default());
        let b = context.configs_mut().register(ParticleSystemConfig::default());
        assert_ne!(a, b);
        context.apply_pending();
        assert_eq!(context.configs().len(), 2);
    }

    #[test]
    fn test_handles_from_threads() {
        let mut context = EffectContext::new();
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let handle = context.handle();
                thread::spawn(move || {
                    (0..5)
                        .map(|_| handle.register(ParticleSystemConfig::default()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut indices: Vec<u32> = workers
            .into_iter()
            .flat_map(|w| w.join().expect("worker"))
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, (1..=20).collect::<Vec<_>>());

        context.apply_pending();
        assert_eq!(context.configs().len(), 20);
    }

    #[test]
    fn test_paths_through_handle() {
        let mut context = EffectContext::new();
        let handle = context.handle();
        let id = handle.register_path(SplinePath::new());
        assert!(context.splines().get(id).is_none());
        context.apply_pending();
        assert!(context.splines().get(id).is_some());
        handle.unregister_path(id);
        context.apply_pending();
        assert!(context.splines().is_empty());
    }
}
