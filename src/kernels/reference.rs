//! CPU versions of the built-in kernels.
//!
//! These follow the WGSL line for line and are what
//! [`SoftwareBackend`](crate::gpu::SoftwareBackend) executes. Buffers are
//! passed as typed slices; the draw-args buffer as raw words.

use glam::{Vec3, Vec4};

use super::{
    merge_counts, MergePolicy, ParticleGpu, SimulationUniforms, DRAW_ARGS_STRIDE, DRAW_EMITTED,
    DRAW_INSTANCE_COUNT, SIMULATE_WORKGROUP_SIZE, UNION_WORKGROUP_SIZE,
};
use crate::config::{unpack2, ConfigFlags, ParticleSystemConfig, MAX_ATTRACTION_FORCE, MAX_KILL_RADIUS};
use crate::gpu::workgroups;
use crate::gradient::{GRADIENT_SLOTS, SENTINEL_TIME};
use crate::spline::SplineInfo;

/// Fill the six dispatch words from the per-emitter caps.
pub fn set_indirect_args(uniforms: &SimulationUniforms, max_counts: &[u32], dispatch_args: &mut [u32]) {
    let emitters = (uniforms.emitter_count as usize).min(max_counts.len());
    let total: u32 = max_counts[..emitters].iter().sum();

    dispatch_args[..6].copy_from_slice(&[
        workgroups(uniforms.emitter_count, UNION_WORKGROUP_SIZE),
        1,
        1,
        workgroups(total, SIMULATE_WORKGROUP_SIZE),
        1,
        1,
    ]);
}

/// Merge survivors from `previous` with this frame's spawns in `particles`.
pub fn buffer_union(
    uniforms: &SimulationUniforms,
    previous: &[ParticleGpu],
    particles: &mut [ParticleGpu],
    draw_args: &mut [u32],
    max_counts: &[u32],
    offsets: &[u32],
) {
    let policy = MergePolicy::from_u32(uniforms.policy);

    for e in 0..uniforms.emitter_count as usize {
        let base = offsets[e] as usize;
        let cap = max_counts[e];
        let args = e * DRAW_ARGS_STRIDE as usize;
        let previous_count = draw_args[args + DRAW_INSTANCE_COUNT].min(cap) as usize;
        let spawned = draw_args[args + DRAW_EMITTED].min(cap);

        let survivors = &previous[base..base + previous_count];
        let previous_alive = survivors.iter().filter(|p| p.alive != 0).count() as u32;
        let counts = merge_counts(policy, cap, previous_alive, spawned);

        let kept_previous = counts.kept_previous as usize;
        let kept_new = counts.kept_new as usize;
        if kept_previous > 0 {
            particles.copy_within(base..base + kept_new, base + kept_previous);
        }

        for (slot, p) in survivors.iter().filter(|p| p.alive != 0).take(kept_previous).enumerate() {
            particles[base + slot] = *p;
        }

        draw_args[args + DRAW_INSTANCE_COUNT] = counts.live();
    }
}

/// Buffers the simulate kernel reads besides the particles.
pub struct SimulateInputs<'a> {
    pub draw_args: &'a [u32],
    pub max_counts: &'a [u32],
    pub offsets: &'a [u32],
    pub configs: &'a [ParticleSystemConfig],
    pub spline_positions: &'a [[f32; 4]],
    pub spline_infos: &'a [SplineInfo],
    pub noise: &'a [f32],
}

/// Age, move and kill every live particle.
pub fn simulate(uniforms: &SimulationUniforms, particles: &mut [ParticleGpu], inputs: &SimulateInputs) {
    for e in 0..uniforms.emitter_count as usize {
        let base = inputs.offsets[e] as usize;
        let live = inputs.draw_args[e * DRAW_ARGS_STRIDE as usize + DRAW_INSTANCE_COUNT]
            .min(inputs.max_counts[e]) as usize;
        for index in base..base + live {
            if index >= uniforms.capacity as usize {
                break;
            }
            let p = &mut particles[index];
            if p.alive == 0 {
                continue;
            }
            let config = inputs
                .configs
                .get(p.config_index as usize)
                .copied()
                .unwrap_or_default();
            simulate_particle(uniforms, &config, inputs, p);
        }
    }
}

fn simulate_particle(
    uniforms: &SimulationUniforms,
    config: &ParticleSystemConfig,
    inputs: &SimulateInputs,
    p: &mut ParticleGpu,
) {
    let flags = config.flags();
    if flags.contains(ConfigFlags::KILL_ALL) {
        p.alive = 0;
        return;
    }
    if flags.contains(ConfigFlags::PAUSE) {
        return;
    }

    let dt = uniforms.delta_time;
    let age = uniforms.time - p.spawn_time;
    let distance_based =
        flags.contains(ConfigFlags::TARGET) && flags.contains(ConfigFlags::LIFETIME_FROM_TARGET_DISTANCE);
    if !distance_based && age >= p.lifetime {
        p.alive = 0;
        return;
    }
    let life = (age / p.lifetime.max(0.0001)).clamp(0.0, 1.0);

    let (force, kill_radius) = unpack2(config.target_packed, MAX_ATTRACTION_FORCE, MAX_KILL_RADIUS);
    let mut position = Vec3::from_array(p.position);
    let mut velocity = Vec3::from_array(p.velocity);

    if flags.contains(ConfigFlags::GRAVITY) {
        velocity.y -= uniforms.gravity * config.gravity * dt;
    }

    let mut gust = 1.0;
    let (width, height) = (uniforms.noise_width, uniforms.noise_height);
    if width > 0 && height > 0 {
        let st = Vec4::from_array(uniforms.noise_st);
        let u = (position.x * st.x + st.z).rem_euclid(1.0);
        let v = (position.y * st.y + st.w).rem_euclid(1.0);
        let nx = ((u * width as f32) as u32).min(width - 1);
        let ny = ((v * height as f32) as u32).min(height - 1);
        gust = 0.5 + inputs.noise.get((ny * width + nx) as usize).copied().unwrap_or(0.0);
    }
    velocity += Vec3::from_array(uniforms.wind) * gust * dt;

    if flags.contains(ConfigFlags::TARGET) {
        let to_target = config.target() - position;
        let dist = to_target.length();
        let dies_on_reach = flags.contains(ConfigFlags::TARGET_DIE_ON_REACH) || distance_based;
        if dies_on_reach && dist <= kill_radius {
            p.alive = 0;
            return;
        }
        if dist > 0.0 {
            velocity += to_target / dist * force * dt;
        }
    }

    if flags.contains(ConfigFlags::FOLLOW_PATH) {
        let paths = inputs.spline_infos.iter().take(uniforms.spline_count as usize);
        for info in paths {
            let (lo, hi) = (Vec3::from_array(info.box_min), Vec3::from_array(info.box_max));
            if info.step_count > 0 && position.cmpge(lo).all() && position.cmple(hi).all() {
                let sample = ((life * (info.step_count - 1) as f32 + 0.5) as u32).min(info.step_count - 1);
                if let Some(goal) = inputs.spline_positions.get((info.start_index + sample) as usize) {
                    let goal = Vec4::from_array(*goal).truncate();
                    velocity += (goal - position) * force.max(1.0) * dt;
                }
                break;
            }
        }
    }

    if flags.contains(ConfigFlags::SPEED_OVER_LIFETIME) {
        let speed = velocity.length();
        if speed > 0.0 {
            velocity = velocity / speed * (p.start_speed * eval_curve(&config.speed_over_lifetime, life));
        }
    }
    if uniforms.max_speed > 0.0 {
        let speed = velocity.length();
        if speed > uniforms.max_speed {
            velocity = velocity / speed * uniforms.max_speed;
        }
    }

    position += velocity * dt;
    if position.y < uniforms.floor_height {
        position.y = uniforms.floor_height;
        velocity.y = velocity.y.max(0.0);
    }
    p.position = position.to_array();
    p.velocity = velocity.to_array();

    if flags.contains(ConfigFlags::SIZE_OVER_LIFETIME) {
        p.size = p.start_size * eval_curve(&config.size_over_lifetime, life);
    }
    if flags.contains(ConfigFlags::COLOR_OVER_LIFETIME) {
        let rgb = eval_color(&config.color_over_lifetime, life);
        p.color = [rgb.x, rgb.y, rgb.z, p.color[3]];
    }
    if flags.contains(ConfigFlags::ALPHA_OVER_LIFETIME) {
        p.color[3] = eval_curve(&config.alpha_over_lifetime, life);
    }
}

/// Piecewise-linear lookup in a `(value, t)` table.
pub fn eval_curve(keys: &[[f32; 2]; GRADIENT_SLOTS], t: f32) -> f32 {
    let mut value = keys[0][0];
    for i in 1..GRADIENT_SLOTS {
        let next = keys[i];
        if next[1] >= SENTINEL_TIME {
            break;
        }
        let prev = keys[i - 1];
        if t <= next[1] {
            let span = next[1] - prev[1];
            let f = if span > 0.0 { ((t - prev[1]) / span).clamp(0.0, 1.0) } else { 0.0 };
            return prev[0] + (next[0] - prev[0]) * f;
        }
        value = next[0];
    }
    value
}

/// Piecewise-linear lookup in an `(r, g, b, t)` table.
pub fn eval_color(keys: &[[f32; 4]; GRADIENT_SLOTS], t: f32) -> Vec3 {
    let rgb = |k: [f32; 4]| Vec3::new(k[0], k[1], k[2]);
    let mut value = rgb(keys[0]);
    for i in 1..GRADIENT_SLOTS {
        let next = keys[i];
        if next[3] >= SENTINEL_TIME {
            break;
        }
        let prev = keys[i - 1];
        if t <= next[3] {
            let span = next[3] - prev[3];
            let f = if span > 0.0 { ((t - prev[3]) / span).clamp(0.0, 1.0) } else { 0.0 };
            return rgb(prev).lerp(rgb(next), f);
        }
        value = rgb(next);
    }
    value
}

/// Zero the per-frame words of every emitter's draw args.
pub fn clear_draw_args(uniforms: &SimulationUniforms, draw_args: &mut [u32]) {
    for e in 0..uniforms.emitter_count as usize {
        let args = e * DRAW_ARGS_STRIDE as usize;
        draw_args[args + DRAW_EMITTED] = 0;
        draw_args[args + 6] = 0;
        draw_args[args + 7] = 0;
    }
}

/// Append `particle` to `emitter`'s slice the way `ssfx_emit` does.
///
/// Returns whether the particle was stored.
pub fn emit(
    emitter: usize,
    mut particle: ParticleGpu,
    particles: &mut [ParticleGpu],
    draw_args: &mut [u32],
    max_counts: &[u32],
    offsets: &[u32],
) -> bool {
    if emitter >= max_counts.len() {
        return false;
    }
    let word = emitter * DRAW_ARGS_STRIDE as usize + DRAW_EMITTED;
    let slot = draw_args[word];
    draw_args[word] = slot.saturating_add(1);
    if slot >= max_counts[emitter] {
        return false;
    }
    particle.alive = 1;
    particles[(offsets[emitter] + slot) as usize] = particle;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{build_config, pack2, EmitterParams, TargetParams};
    use crate::gradient::CurveKey;

    fn uniforms(emitters: u32, capacity: u32) -> SimulationUniforms {
        SimulationUniforms {
            emitter_count: emitters,
            capacity,
            delta_time: 0.1,
            time: 1.0,
            ..Default::default()
        }
    }

    fn particle(config_index: u32, tag: f32) -> ParticleGpu {
        ParticleGpu {
            position: [tag, 0.0, 0.0],
            config_index,
            lifetime: 100.0,
            alive: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_set_indirect_args() {
        let mut dispatch = [0u32; 6];
        set_indirect_args(&uniforms(70, 0), &vec![10; 70], &mut dispatch);
        assert_eq!(dispatch, [2, 1, 1, 3, 1, 1]);
    }

    #[test]
    fn test_union_keeps_survivors_then_spawns() {
        let u = SimulationUniforms {
            policy: MergePolicy::PrioritizeNew.as_u32(),
            ..uniforms(1, 5)
        };
        let mut previous = vec![ParticleGpu::default(); 5];
        previous[0] = particle(1, 1.0);
        previous[1] = ParticleGpu { alive: 0, ..particle(1, 2.0) };
        previous[2] = particle(1, 3.0);

        let mut current = vec![ParticleGpu::default(); 5];
        current[0] = particle(1, 10.0);
        current[1] = particle(1, 11.0);

        let mut draw_args = vec![0u32; 8];
        draw_args[DRAW_INSTANCE_COUNT] = 3;
        draw_args[DRAW_EMITTED] = 2;

        buffer_union(&u, &previous, &mut current, &mut draw_args, &[5], &[0]);

        assert_eq!(draw_args[DRAW_INSTANCE_COUNT], 4);
        let tags: Vec<f32> = current[..4].iter().map(|p| p.position[0]).collect();
        assert_eq!(tags, vec![1.0, 3.0, 10.0, 11.0]);
    }

    #[test]
    fn test_union_prioritize_old_drops_spawns() {
        let u = SimulationUniforms {
            policy: MergePolicy::PrioritizeOld.as_u32(),
            ..uniforms(1, 3)
        };
        let previous = vec![particle(1, 1.0), particle(1, 2.0), particle(1, 3.0)];
        let mut current = vec![particle(1, 10.0), ParticleGpu::default(), ParticleGpu::default()];
        let mut draw_args = vec![0u32; 8];
        draw_args[DRAW_INSTANCE_COUNT] = 3;
        draw_args[DRAW_EMITTED] = 1;

        buffer_union(&u, &previous, &mut current, &mut draw_args, &[3], &[0]);

        assert_eq!(draw_args[DRAW_INSTANCE_COUNT], 3);
        let tags: Vec<f32> = current.iter().map(|p| p.position[0]).collect();
        assert_eq!(tags, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_emit_counts_attempts_past_cap() {
        let mut particles = vec![ParticleGpu::default(); 4];
        let mut draw_args = vec![0u32; 16];
        let caps = [2, 2];
        let offsets = [0, 2];

        for i in 0..3 {
            let stored = emit(1, particle(1, i as f32), &mut particles, &mut draw_args, &caps, &offsets);
            assert_eq!(stored, i < 2);
        }
        assert_eq!(draw_args[8 + DRAW_EMITTED], 3);
        assert_eq!(particles[2].position[0], 0.0);
        assert_eq!(particles[3].position[0], 1.0);
        assert_eq!(particles[0].alive, 0);
    }

    #[test]
    fn test_kill_all_and_pause() {
        let mut kill = ParticleSystemConfig::default();
        kill.set_flag(ConfigFlags::KILL_ALL, true);
        let mut pause = ParticleSystemConfig::default();
        pause.set_flag(ConfigFlags::PAUSE, true);
        let configs = [ParticleSystemConfig::default(), kill, pause];

        let mut particles = vec![particle(1, 0.0), particle(2, 5.0)];
        let draw_args = [0, 2, 0, 0, 0, 0, 0, 0];
        let inputs = SimulateInputs {
            draw_args: &draw_args,
            max_counts: &[2],
            offsets: &[0],
            configs: &configs,
            spline_positions: &[],
            spline_infos: &[],
            noise: &[],
        };
        let u = SimulationUniforms {
            wind: [1.0, 0.0, 0.0],
            ..uniforms(1, 2)
        };
        simulate(&u, &mut particles, &inputs);

        assert_eq!(particles[0].alive, 0);
        assert_eq!(particles[1].alive, 1);
        assert_eq!(particles[1].position, [5.0, 0.0, 0.0]);
    }

    #[test]
    fn test_target_die_on_reach() {
        let params = EmitterParams::new().with_target(TargetParams {
            position: Vec3::new(0.5, 0.0, 0.0),
            attraction_force: 1.0,
            kill_radius: 1.0,
            die_on_reach: true,
            lifetime_from_distance: false,
        });
        let configs = [ParticleSystemConfig::default(), build_config(&params)];
        let mut particles = vec![particle(1, 0.0), particle(1, 5.0)];
        let draw_args = [0, 2, 0, 0, 0, 0, 0, 0];
        let inputs = SimulateInputs {
            draw_args: &draw_args,
            max_counts: &[2],
            offsets: &[0],
            configs: &configs,
            spline_positions: &[],
            spline_infos: &[],
            noise: &[],
        };
        simulate(&uniforms(1, 2), &mut particles, &inputs);

        assert_eq!(particles[0].alive, 0);
        assert_eq!(particles[1].alive, 1);
        // Pulled toward the target.
        assert!(particles[1].position[0] < 5.0);
        assert_eq!(configs[1].target_packed, pack2(1.0, MAX_ATTRACTION_FORCE, 1.0, MAX_KILL_RADIUS));
    }

    #[test]
    fn test_lifetime_expiry_and_floor() {
        let mut gravity = ParticleSystemConfig::default();
        gravity.set_flag(ConfigFlags::GRAVITY, true);
        gravity.gravity = 1.0;
        let configs = [ParticleSystemConfig::default(), gravity];

        let expired = ParticleGpu {
            lifetime: 0.5,
            ..particle(1, 0.0)
        };
        let falling = ParticleGpu {
            velocity: [0.0, -10.0, 0.0],
            ..particle(1, 0.0)
        };
        let mut particles = vec![expired, falling];
        let draw_args = [0, 2, 0, 0, 0, 0, 0, 0];
        let inputs = SimulateInputs {
            draw_args: &draw_args,
            max_counts: &[2],
            offsets: &[0],
            configs: &configs,
            spline_positions: &[],
            spline_infos: &[],
            noise: &[],
        };
        let u = SimulationUniforms {
            gravity: 9.8,
            floor_height: -0.5,
            ..uniforms(1, 2)
        };
        simulate(&u, &mut particles, &inputs);

        assert_eq!(particles[0].alive, 0);
        assert_eq!(particles[1].position[1], -0.5);
        assert_eq!(particles[1].velocity[1], 0.0);
    }

    #[test]
    fn test_size_curve_applied() {
        let params = EmitterParams::new()
            .with_size_over_lifetime(vec![CurveKey::new(1.0, 0.0), CurveKey::new(0.0, 1.0)]);
        let configs = [ParticleSystemConfig::default(), build_config(&params)];
        let mut particles = vec![ParticleGpu {
            start_size: 2.0,
            lifetime: 4.0,
            ..particle(1, 0.0)
        }];
        let draw_args = [0, 1, 0, 0, 0, 0, 0, 0];
        let inputs = SimulateInputs {
            draw_args: &draw_args,
            max_counts: &[1],
            offsets: &[0],
            configs: &configs,
            spline_positions: &[],
            spline_infos: &[],
            noise: &[],
        };
        // age 1 of 4 -> life 0.25 -> curve 0.75
        simulate(&uniforms(1, 1), &mut particles, &inputs);
        assert!((particles[0].size - 1.5).abs() < 1e-5);
    }

    #[test]
    fn test_eval_curve_edges() {
        let mut keys = [[0.0, SENTINEL_TIME]; GRADIENT_SLOTS];
        keys[0] = [2.0, 0.0];
        assert_eq!(eval_curve(&keys, 0.7), 2.0);

        keys[1] = [4.0, 0.5];
        assert_eq!(eval_curve(&keys, 0.25), 3.0);
        assert_eq!(eval_curve(&keys, 0.9), 4.0);
    }

    #[test]
    fn test_clear_keeps_index_and_instance_counts() {
        let mut draw_args = vec![36, 7, 0, 0, 0, 9, 1, 1];
        clear_draw_args(&uniforms(1, 0), &mut draw_args);
        assert_eq!(draw_args, vec![36, 7, 0, 0, 0, 0, 0, 0]);
    }
}
