//! WGSL bodies of the built-in kernels. Each is appended to
//! [`prelude`](super::prelude), which declares the shared records and constants.

pub const SET_INDIRECT_ARGS: &str = r#"
@group(0) @binding(0) var<uniform> uniforms: SimulationUniforms;
@group(0) @binding(4) var<storage, read_write> dispatch_args: array<u32>;
@group(0) @binding(5) var<storage, read> max_counts: array<u32>;

@compute @workgroup_size(1)
fn main() {
    var total = 0u;
    for (var e = 0u; e < uniforms.emitter_count; e += 1u) {
        total += max_counts[e];
    }

    dispatch_args[0] = (uniforms.emitter_count + UNION_WORKGROUP_SIZE - 1u) / UNION_WORKGROUP_SIZE;
    dispatch_args[1] = 1u;
    dispatch_args[2] = 1u;
    dispatch_args[3] = (total + SIMULATE_WORKGROUP_SIZE - 1u) / SIMULATE_WORKGROUP_SIZE;
    dispatch_args[4] = 1u;
    dispatch_args[5] = 1u;
}
"#;

pub const BUFFER_UNION: &str = r#"
@group(0) @binding(0) var<uniform> uniforms: SimulationUniforms;
@group(0) @binding(1) var<storage, read_write> particles: array<ParticleGpu>;
@group(0) @binding(2) var<storage, read> previous: array<ParticleGpu>;
@group(0) @binding(3) var<storage, read_write> draw_args: array<u32>;
@group(0) @binding(5) var<storage, read> max_counts: array<u32>;
@group(0) @binding(6) var<storage, read> offsets: array<u32>;

// One invocation per emitter. New spawns sit at the start of the emitter's
// slice in `particles`; survivors are read from `previous`. The result is
// survivors (oldest first) followed by the kept spawns.
@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let e = global_id.x;
    if (e >= uniforms.emitter_count) {
        return;
    }

    let base = offsets[e];
    let cap = max_counts[e];
    let args = e * DRAW_ARGS_STRIDE;
    let previous_count = min(draw_args[args + DRAW_INSTANCE_COUNT], cap);
    let spawned = min(draw_args[args + DRAW_EMITTED], cap);

    var previous_alive = 0u;
    for (var i = 0u; i < previous_count; i += 1u) {
        if (previous[base + i].alive != 0u) {
            previous_alive += 1u;
        }
    }

    var kept_previous = 0u;
    var kept_new = 0u;
    if (uniforms.policy == POLICY_PRIORITIZE_NEW) {
        kept_new = min(cap, spawned);
        kept_previous = min(previous_alive, cap - kept_new);
    } else {
        kept_previous = min(previous_alive, cap);
        kept_new = min(spawned, cap - kept_previous);
    }

    // Move kept spawns behind the survivors, highest index first.
    if (kept_previous > 0u) {
        for (var i = kept_new; i > 0u; i -= 1u) {
            particles[base + kept_previous + i - 1u] = particles[base + i - 1u];
        }
    }

    var written = 0u;
    for (var i = 0u; i < previous_count && written < kept_previous; i += 1u) {
        let p = previous[base + i];
        if (p.alive != 0u) {
            particles[base + written] = p;
            written += 1u;
        }
    }

    draw_args[args + DRAW_INSTANCE_COUNT] = kept_previous + kept_new;
}
"#;

pub const CURVES: &str = r#"
// Piecewise-linear lookup in a (value, t) table ending at SENTINEL_TIME.
fn eval_curve(keys: array<vec2<f32>, 10>, t: f32) -> f32 {
    var k = keys;
    var value = k[0].x;
    for (var i = 1u; i < 10u; i += 1u) {
        let next = k[i];
        if (next.y >= SENTINEL_TIME) {
            break;
        }
        let prev = k[i - 1u];
        if (t <= next.y) {
            let span = next.y - prev.y;
            var f = 0.0;
            if (span > 0.0) {
                f = clamp((t - prev.y) / span, 0.0, 1.0);
            }
            return mix(prev.x, next.x, f);
        }
        value = next.x;
    }
    return value;
}

fn eval_color(keys: array<vec4<f32>, 10>, t: f32) -> vec3<f32> {
    var k = keys;
    var value = k[0].xyz;
    for (var i = 1u; i < 10u; i += 1u) {
        let next = k[i];
        if (next.w >= SENTINEL_TIME) {
            break;
        }
        let prev = k[i - 1u];
        if (t <= next.w) {
            let span = next.w - prev.w;
            var f = 0.0;
            if (span > 0.0) {
                f = clamp((t - prev.w) / span, 0.0, 1.0);
            }
            return mix(prev.xyz, next.xyz, vec3<f32>(f));
        }
        value = next.xyz;
    }
    return value;
}
"#;

pub const SIMULATE_BINDINGS: &str = r#"
@group(0) @binding(0) var<uniform> uniforms: SimulationUniforms;
@group(0) @binding(1) var<storage, read_write> particles: array<ParticleGpu>;
@group(0) @binding(3) var<storage, read> draw_args: array<u32>;
@group(0) @binding(5) var<storage, read> max_counts: array<u32>;
@group(0) @binding(6) var<storage, read> offsets: array<u32>;
@group(0) @binding(7) var<storage, read> configs: array<ParticleSystemConfig>;
@group(0) @binding(8) var<storage, read> spline_positions: array<vec4<f32>>;
@group(0) @binding(9) var<storage, read> spline_infos: array<SplineInfo>;
@group(0) @binding(10) var<storage, read> noise: array<f32>;
"#;

pub const SIMULATE_SHELL: &str = r#"
const NO_EMITTER: u32 = 0xFFFFFFFFu;

fn find_emitter(index: u32) -> u32 {
    for (var e = 0u; e < uniforms.emitter_count; e += 1u) {
        if (index >= offsets[e] && index < offsets[e] + max_counts[e]) {
            return e;
        }
    }
    return NO_EMITTER;
}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let index = global_id.x;
    if (index >= uniforms.capacity) {
        return;
    }
    let emitter = find_emitter(index);
    if (emitter == NO_EMITTER) {
        return;
    }
    if (index - offsets[emitter] >= draw_args[emitter * DRAW_ARGS_STRIDE + DRAW_INSTANCE_COUNT]) {
        return;
    }

    var p = particles[index];
    if (p.alive == 0u) {
        return;
    }
    var config = ParticleSystemConfig();
    if (p.config_index < arrayLength(&configs)) {
        config = configs[p.config_index];
    }

{{BODY}}

    particles[index] = p;
}
"#;

pub const SIMULATE_BODY: &str = r#"
    let flags = config.flags;
    if ((flags & FLAG_KILL_ALL) != 0u) {
        p.alive = 0u;
        particles[index] = p;
        return;
    }
    if ((flags & FLAG_PAUSE) != 0u) {
        return;
    }

    let dt = uniforms.delta_time;
    let age = uniforms.time - p.spawn_time;
    let distance_based = (flags & FLAG_TARGET) != 0u && (flags & FLAG_LIFETIME_FROM_TARGET_DISTANCE) != 0u;
    if (!distance_based && age >= p.lifetime) {
        p.alive = 0u;
        particles[index] = p;
        return;
    }
    let life = clamp(age / max(p.lifetime, 0.0001), 0.0, 1.0);

    let force = f32(config.target_packed & 0xFFFFu) / PACK_SCALE * MAX_ATTRACTION_FORCE;
    let kill_radius = f32(config.target_packed >> 16u) / PACK_SCALE * MAX_KILL_RADIUS;
    var velocity = p.velocity;

    if ((flags & FLAG_GRAVITY) != 0u) {
        velocity.y -= uniforms.gravity * config.gravity * dt;
    }

    var gust = 1.0;
    if (uniforms.noise_width > 0u && uniforms.noise_height > 0u) {
        let uv = fract(p.position.xy * uniforms.noise_st.xy + uniforms.noise_st.zw);
        let nx = min(u32(uv.x * f32(uniforms.noise_width)), uniforms.noise_width - 1u);
        let ny = min(u32(uv.y * f32(uniforms.noise_height)), uniforms.noise_height - 1u);
        gust = 0.5 + noise[ny * uniforms.noise_width + nx];
    }
    velocity += uniforms.wind * gust * dt;

    if ((flags & FLAG_TARGET) != 0u) {
        let to_target = config.target_position - p.position;
        let dist = length(to_target);
        let dies_on_reach = (flags & FLAG_TARGET_DIE_ON_REACH) != 0u || distance_based;
        if (dies_on_reach && dist <= kill_radius) {
            p.alive = 0u;
            particles[index] = p;
            return;
        }
        if (dist > 0.0) {
            velocity += to_target / dist * force * dt;
        }
    }

    if ((flags & FLAG_FOLLOW_PATH) != 0u) {
        for (var s = 0u; s < uniforms.spline_count; s += 1u) {
            let info = spline_infos[s];
            if (info.step_count > 0u && all(p.position >= info.box_min) && all(p.position <= info.box_max)) {
                let step = min(u32(life * f32(info.step_count - 1u) + 0.5), info.step_count - 1u);
                let goal = spline_positions[info.start_index + step].xyz;
                velocity += (goal - p.position) * max(force, 1.0) * dt;
                break;
            }
        }
    }

    if ((flags & FLAG_SPEED_OVER_LIFETIME) != 0u) {
        let speed = length(velocity);
        if (speed > 0.0) {
            velocity = velocity / speed * (p.start_speed * eval_curve(config.speed_over_lifetime, life));
        }
    }
    if (uniforms.max_speed > 0.0) {
        let speed = length(velocity);
        if (speed > uniforms.max_speed) {
            velocity = velocity / speed * uniforms.max_speed;
        }
    }

    p.position += velocity * dt;
    if (p.position.y < uniforms.floor_height) {
        p.position.y = uniforms.floor_height;
        velocity.y = max(velocity.y, 0.0);
    }
    p.velocity = velocity;

    if ((flags & FLAG_SIZE_OVER_LIFETIME) != 0u) {
        p.size = p.start_size * eval_curve(config.size_over_lifetime, life);
    }
    if ((flags & FLAG_COLOR_OVER_LIFETIME) != 0u) {
        p.color = vec4<f32>(eval_color(config.color_over_lifetime, life), p.color.w);
    }
    if ((flags & FLAG_ALPHA_OVER_LIFETIME) != 0u) {
        p.color.w = eval_curve(config.alpha_over_lifetime, life);
    }
"#;

pub const CLEAR_DRAW_ARGS: &str = r#"
@group(0) @binding(0) var<uniform> uniforms: SimulationUniforms;
@group(0) @binding(3) var<storage, read_write> draw_args: array<u32>;

// Index count, instance count and first instance persist across frames.
@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let e = global_id.x;
    if (e >= uniforms.emitter_count) {
        return;
    }
    let args = e * DRAW_ARGS_STRIDE;
    draw_args[args + DRAW_EMITTED] = 0u;
    draw_args[args + 6u] = 0u;
    draw_args[args + 7u] = 0u;
}
"#;

/// Bindings and append helper for emission kernels.
pub const EMIT_WGSL: &str = r#"
@group(0) @binding(0) var<uniform> uniforms: SimulationUniforms;
@group(0) @binding(1) var<storage, read_write> particles: array<ParticleGpu>;
@group(0) @binding(3) var<storage, read_write> draw_args: array<atomic<u32>>;
@group(0) @binding(5) var<storage, read> max_counts: array<u32>;
@group(0) @binding(6) var<storage, read> offsets: array<u32>;

// Appends `particle` to the emitter's slice. Every call is counted in the
// emitted word, even when the slice is full and the particle is dropped.
fn ssfx_emit(emitter: u32, particle: ParticleGpu) -> bool {
    if (emitter >= uniforms.emitter_count) {
        return false;
    }
    let slot = atomicAdd(&draw_args[emitter * DRAW_ARGS_STRIDE + DRAW_EMITTED], 1u);
    if (slot >= max_counts[emitter]) {
        return false;
    }
    var p = particle;
    p.alive = 1u;
    particles[offsets[emitter] + slot] = p;
    return true;
}
"#;
